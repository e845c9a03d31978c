//! JIT compilation engine for a DSP56300-class emulated core.
//!
//! Translates decoded instruction sequences into x86-64 machine code:
//! block formation under self-modifying-code and hardware-loop
//! constraints, a register cache mapping the emulated register file
//! onto host registers, a memory bridge from emulated address spaces to
//! host pointers, and the stack/calling-convention machinery for native
//! call-outs from generated code.
//!
//! The per-instruction semantics live behind the [`OpEmitter`] trait;
//! this crate only asks an instruction to emit its effect and report
//! its side-effect flags.

pub mod block;
pub mod code_buffer;
pub mod mem;
pub mod pool;
pub mod reg_cache;
pub mod stack;
pub mod x86_64;

pub use block::{
    build_block, BlockFlags, BuildEnv, CompiledBlock, EmitInfo, JitBlock, JitError, OpEmitter,
    OpFlags, RuntimeCells, RuntimeData, ADDR_INVALID,
};
pub use code_buffer::CodeBuffer;
pub use mem::{CallArg, MemParams, NativeCtx};
pub use pool::RegPool;
pub use reg_cache::{CacheState, DspRegCache};
pub use stack::StackHelper;
pub use x86_64::regs::{Gp, HostCaps, HostReg, Xmm};
pub use x86_64::stubs::{emit_stubs, EngineStubs};
