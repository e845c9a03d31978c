//! Block formation.
//!
//! `build_block` drives one compilation pass: record the predicted
//! fallthrough, emit instructions through the opcode collaborator until
//! a termination condition fires, then finalize the control-flow exit
//! and hand every borrowed resource back. Termination sits exactly
//! where static next-address knowledge breaks down — branches, loop
//! control, program-memory writes — so every block without a dynamic
//! exit has a statically known successor.

use std::collections::{HashMap, HashSet};

use bitflags::bitflags;
use d56jit_core::state::sr;
use d56jit_core::{AddressingMode, DspReg, DspState, JitConfig, JitMode, MemArea, Memory, Peripherals};
use thiserror::Error;
use tracing::trace;

use crate::code_buffer::CodeBuffer;
use crate::mem::{self, CallArg, MemParams, NativeCtx};
use crate::pool::RegPool;
use crate::reg_cache::DspRegCache;
use crate::stack::StackHelper;
use crate::x86_64::emitter as emit;
use crate::x86_64::emitter::{ArithOp, Cond};
use crate::x86_64::regs::{Gp, HostCaps, HostReg, Xmm, LOOP_COUNT_REG, POOL_GPS, POOL_XMMS, SCRATCH, STATE_BASE};

bitflags! {
    /// Side effects one instruction reports back to the builder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        /// Wrote program memory.
        const WRITE_PMEM = 1 << 0;
        /// Wrote the loop-count register.
        const WRITE_TO_LC = 1 << 1;
        /// Wrote the loop-address register.
        const WRITE_TO_LA = 1 << 2;
        /// A branch (conditional or not).
        const BRANCH = 1 << 3;
        /// A return: pops the program counter.
        const POP_PC = 1 << 4;
        /// A loop-control instruction.
        const LOOP = 1 << 5;
    }
}

bitflags! {
    /// Exit bookkeeping of a finalized block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        /// Contains an instruction that writes program memory.
        const WRITE_PMEM = 1 << 0;
        /// Ends a hardware loop (loop-closing exit attached).
        const LOOP_END = 1 << 1;
    }
}

/// What one instruction emission reports back.
#[derive(Debug, Clone, Copy)]
pub struct EmitInfo {
    /// Encoded size in program-memory words.
    pub size: u32,
    pub flags: OpFlags,
}

/// Opcode collaborator: knows what each instruction does, both as
/// generated code and as a single interpreted step.
///
/// Emitters report control transfers through `JitBlock::set_next_pc_*`
/// and never write the cached PC directly — the builder owns the final
/// PC store.
pub trait OpEmitter {
    /// Emit the instruction at `pc` into the current block, fetching
    /// the opcode from program memory.
    fn emit(&mut self, block: &mut JitBlock, mem: &Memory, pc: u32) -> EmitInfo;

    /// Execute the instruction at `pc` directly. Returns its size in
    /// words. Fallback for addresses the compiler reports nothing to
    /// compile for.
    fn interpret(
        &mut self,
        state: &mut DspState,
        mem: &mut Memory,
        periph: &mut dyn Peripherals,
        pc: u32,
    ) -> u32;

    /// Emit the deferred condition-code update, if the emitter batches
    /// CCR writes. Called once at block finalization when an
    /// instruction marked the CCR dirty.
    fn flush_ccr(&mut self, _block: &mut JitBlock) {}
}

/// A finalized run of compiled instructions. Immutable; the code is
/// never patched after finalization. Owned by the block cache.
#[derive(Debug, Clone)]
pub struct CompiledBlock {
    /// First program-memory address covered.
    pub start: u32,
    /// Encoded length in program-memory words.
    pub word_len: u32,
    pub insn_count: u32,
    pub flags: BlockFlags,
    /// Entry into the code buffer.
    pub entry_offset: usize,
    pub host_size: usize,
}

impl CompiledBlock {
    /// Whether `addr` falls inside the instruction range this block was
    /// compiled from.
    pub fn covers(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.start + self.word_len
    }
}

#[derive(Debug, Error)]
pub enum JitError {
    /// Nothing to compile at this address (already covered, or a
    /// zero-instruction build). Recoverable: advance by one
    /// instruction or interpret.
    #[error("nothing to compile at {0:#08x}")]
    EmptyBlock(u32),
    #[error("code buffer exhausted")]
    BufferFull,
}

/// Cells written by generated code, read back by the dispatcher.
/// `#[repr(C)]` and heap-pinned by the engine so cell addresses can be
/// embedded in generated code.
#[repr(C)]
pub struct RuntimeData {
    /// Computed next PC for blocks with a dynamic exit.
    pub next_pc: u32,
    /// Program-memory write observed during the last execution, or
    /// `ADDR_INVALID`.
    pub pmem_write_addr: u32,
    pub pmem_write_value: u32,
    _pad: u32,
    /// Current call context for slow-path shims.
    pub native_ctx: *mut NativeCtx,
}

/// Marker for "no program-memory write happened".
pub const ADDR_INVALID: u32 = 0xffff_ffff;

impl RuntimeData {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            next_pc: 0,
            pmem_write_addr: ADDR_INVALID,
            pmem_write_value: 0,
            _pad: 0,
            native_ctx: std::ptr::null_mut(),
        })
    }

    pub fn cells(&self) -> RuntimeCells {
        RuntimeCells {
            next_pc: &self.next_pc as *const u32 as u64,
            pmem_write_addr: &self.pmem_write_addr as *const u32 as u64,
            pmem_write_value: &self.pmem_write_value as *const u32 as u64,
            native_ctx: &self.native_ctx as *const *mut NativeCtx as u64,
        }
    }
}

/// Absolute addresses of the runtime-data cells.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeCells {
    pub next_pc: u64,
    pub pmem_write_addr: u64,
    pub pmem_write_value: u64,
    pub native_ctx: u64,
}

/// Everything one compilation pass needs from the outside.
pub struct BuildEnv<'a> {
    pub mem: MemParams,
    /// Compile-time view of emulated memory (opcode fetch).
    pub memory: &'a Memory,
    /// Config already resolved for this start address.
    pub config: JitConfig,
    pub mode: JitMode,
    /// Compile-time view of the CPU state (loop registers).
    pub state: &'a DspState,
    /// Addresses subject to self-modification: forced single-instruction
    /// blocks.
    pub volatile_p: &'a HashSet<u32>,
    /// Hardware-loop end address to loop start address.
    pub loop_ends: &'a HashMap<u32, u32>,
    /// Whether a block already exists at an address (any mode).
    pub occupied: &'a dyn Fn(u32) -> bool,
    pub cells: RuntimeCells,
    pub epilogue_offset: usize,
}

/// In-progress block compilation: the surface instruction emitters
/// program against. Owns the pools, register cache and stack tracking
/// for exactly one pass; borrows the engine's code buffer.
pub struct JitBlock<'a> {
    pub buf: &'a mut CodeBuffer,
    pub gp_pool: RegPool<Gp>,
    pub xmm_pool: RegPool<Xmm>,
    pub stack: StackHelper,
    pub regs: DspRegCache,
    pub mem: MemParams,
    pub config: JitConfig,
    pub mode: JitMode,
    cells: RuntimeCells,
    possible_branch: bool,
    ccr_dirty: bool,
}

impl<'a> JitBlock<'a> {
    fn new(buf: &'a mut CodeBuffer, env: &BuildEnv, caps: HostCaps) -> Self {
        Self {
            buf,
            gp_pool: RegPool::new(&POOL_GPS),
            xmm_pool: RegPool::new(&POOL_XMMS),
            stack: StackHelper::new(),
            regs: DspRegCache::new(caps),
            mem: env.mem,
            config: env.config.clone(),
            mode: env.mode,
            cells: env.cells,
            possible_branch: false,
            ccr_dirty: false,
        }
    }

    // -- scratch registers --

    pub fn scratch_gp(&mut self) -> Gp {
        let reg = self.gp_pool.acquire();
        self.stack.set_used(reg);
        reg
    }

    pub fn release_gp(&mut self, reg: Gp) {
        self.gp_pool.release(reg);
    }

    pub fn scratch_xmm(&mut self) -> Xmm {
        let reg = self.xmm_pool.acquire();
        self.stack.set_used(reg);
        reg
    }

    pub fn release_xmm(&mut self, reg: Xmm) {
        self.xmm_pool.release(reg);
    }

    // -- register cache --

    /// Cache a logical register, loading on first use.
    pub fn reg(&mut self, reg: DspReg, read: bool, write: bool) -> HostReg {
        self.regs
            .get(self.buf, &mut self.stack, &mut self.xmm_pool, reg, read, write)
    }

    pub fn reg_word(&mut self, reg: DspReg, read: bool, write: bool) -> Gp {
        self.regs.get_word(self.buf, &mut self.stack, reg, read, write)
    }

    pub fn read_wide_to_gp(&mut self, reg: DspReg, dst: Gp) {
        self.regs.read_wide_to_gp(self.buf, &mut self.stack, reg, dst);
    }

    pub fn write_wide_from_gp(&mut self, reg: DspReg, src: Gp) {
        self.regs.write_wide_from_gp(self.buf, &mut self.stack, reg, src);
    }

    pub fn agu_read(&mut self, reg: DspReg, dst: Gp) {
        self.regs
            .agu_read(self.buf, &mut self.stack, &mut self.xmm_pool, reg, dst);
    }

    pub fn agu_write(&mut self, reg: DspReg, src: Gp) {
        self.regs
            .agu_write(self.buf, &mut self.stack, &mut self.xmm_pool, reg, src);
    }

    // -- memory bridge --

    pub fn mem_read_static(&mut self, dst: Gp, area: Option<MemArea>, addr: u32) {
        mem::read_static(self.buf, &mut self.stack, &self.mem, dst, area, addr);
    }

    pub fn mem_write_static(&mut self, area: Option<MemArea>, addr: u32, src: Gp) {
        mem::write_static(self.buf, &mut self.stack, &self.mem, &self.config, area, addr, src);
    }

    pub fn mem_read_dynamic(&mut self, dst: Gp, area: Option<MemArea>, addr: Gp) {
        mem::read_dynamic(self.buf, &mut self.stack, &self.mem, &self.config, dst, area, addr);
    }

    pub fn mem_write_dynamic(&mut self, area: Option<MemArea>, addr: Gp, src: Gp) {
        mem::write_dynamic(self.buf, &mut self.stack, &self.mem, &self.config, area, addr, src);
    }

    /// Wrapped native call with the volatile working set saved.
    pub fn native_call(&mut self, target: u64, args: &[CallArg], result_to: Option<Gp>) {
        mem::emit_native_call(self.buf, &mut self.stack, target, args, result_to);
    }

    // -- control flow --

    /// Record a runtime-computed next PC. The builder turns this into
    /// the final PC store at block exit.
    pub fn set_next_pc_dynamic(&mut self, src: Gp) {
        emit::mov_ri(self.buf, true, SCRATCH, self.cells.next_pc);
        emit::store32(self.buf, SCRATCH, 0, src);
        self.possible_branch = true;
    }

    /// Record a statically known branch target.
    pub fn set_next_pc_imm(&mut self, pc: u32) {
        emit::mov_ri(self.buf, true, SCRATCH, self.cells.next_pc);
        emit::store32_imm(self.buf, SCRATCH, 0, pc);
        self.possible_branch = true;
    }

    /// Record a program-memory write so the dispatcher can invalidate
    /// stale blocks after execution.
    pub fn record_pmem_write(&mut self, addr: Gp, value: Gp) {
        emit::mov_ri(self.buf, true, SCRATCH, self.cells.pmem_write_addr);
        emit::store32(self.buf, SCRATCH, 0, addr);
        emit::mov_ri(self.buf, true, SCRATCH, self.cells.pmem_write_value);
        emit::store32(self.buf, SCRATCH, 0, value);
    }

    /// Defer the condition-code update to block finalization.
    pub fn mark_ccr_dirty(&mut self) {
        self.ccr_dirty = true;
    }

    /// Addressing mode this block is compiled against for generator
    /// `agu`. A mode the configuration does not support aborts the
    /// compilation — an unrecognized combination is never silently
    /// miscompiled.
    pub fn addressing_mode(&self, agu: u32) -> AddressingMode {
        let mode = self.mode.addressing_mode(agu);
        match mode {
            AddressingMode::Bitreverse => assert!(
                self.config.agu_support_bitreverse,
                "bit-reverse addressing not supported (generator {agu})"
            ),
            AddressingMode::MultiWrapModulo => assert!(
                self.config.agu_support_multiple_wrap_modulo,
                "multiple-wrap modulo addressing not supported (generator {agu})"
            ),
            AddressingMode::Modulo | AddressingMode::Linear => {}
        }
        mode
    }
}

/// Compile one block starting at `start`. On `EmptyBlock` the buffer is
/// rewound as if nothing happened.
pub fn build_block(
    buf: &mut CodeBuffer,
    emitter: &mut dyn OpEmitter,
    env: &BuildEnv,
    caps: HostCaps,
    start: u32,
) -> Result<CompiledBlock, JitError> {
    let entry_offset = buf.offset();
    let mut jb = JitBlock::new(buf, env, caps);

    // Predicted fallthrough into the next-pc cell; the immediate is
    // patched once the block length is known.
    emit::mov_ri(jb.buf, true, SCRATCH, env.cells.next_pc);
    let next_pc_patch = emit::store32_imm(jb.buf, SCRATCH, 0, 0);

    let loop_cap = env.config.max_loop_iterations;
    if loop_cap > 0 {
        emit::mov_ri(jb.buf, false, LOOP_COUNT_REG, loop_cap as u64);
    }
    let loop_top = jb.buf.offset();

    let mut word_len = 0u32;
    let mut insn_count = 0u32;
    let mut op_flags = OpFlags::empty();
    let mut append_loop = false;
    let mut single = false;

    loop {
        let pc = start + word_len;

        // Never shadow code that is already compiled.
        if (env.occupied)(pc) {
            break;
        }

        // Volatile address: emit at most this one instruction.
        if env.volatile_p.contains(&pc) {
            if insn_count > 0 {
                break;
            }
            single = true;
        }

        let info = emitter.emit(&mut jb, env.memory, pc);
        word_len += info.size;
        insn_count += 1;
        op_flags |= info.flags;

        // Hardware loop end reached: attach the loop-closing exit. LA
        // only means anything while the loop flag is set.
        if (env.state.sr & sr::LF) != 0 && start + word_len == env.state.la.wrapping_add(1) {
            append_loop = true;
            break;
        }

        if info
            .flags
            .intersects(OpFlags::WRITE_PMEM | OpFlags::WRITE_TO_LA | OpFlags::WRITE_TO_LC)
        {
            break;
        }
        if info.flags.intersects(OpFlags::BRANCH | OpFlags::POP_PC | OpFlags::LOOP) {
            break;
        }
        if single {
            break;
        }
        if env.config.max_instructions_per_block > 0
            && insn_count >= env.config.max_instructions_per_block
        {
            break;
        }
    }

    if insn_count == 0 {
        jb.buf.truncate(entry_offset);
        return Err(JitError::EmptyBlock(start));
    }

    let fallthrough = start + word_len;
    jb.buf.patch_u32(next_pc_patch, fallthrough);

    if jb.ccr_dirty {
        emitter.flush_ccr(&mut jb);
    }

    // Hand everything back: registers to memory, pools empty, stack
    // balanced.
    jb.regs.flush_all(jb.buf);
    jb.gp_pool.release_all();
    jb.xmm_pool.release_all();
    jb.stack.pop_all(jb.buf);
    jb.stack.finish();

    let pc_off = DspState::offset_of_pc();

    if append_loop {
        emit_loop_close(&mut jb, env, start, fallthrough, loop_top, loop_cap);
    } else if jb.possible_branch {
        emit::mov_ri(jb.buf, true, SCRATCH, env.cells.next_pc);
        emit::load32(jb.buf, SCRATCH, SCRATCH, 0);
        emit::store32(jb.buf, STATE_BASE, pc_off, SCRATCH);
        emit::jmp_to(jb.buf, env.epilogue_offset);
    } else {
        emit::store32_imm(jb.buf, STATE_BASE, pc_off, fallthrough);
        emit::jmp_to(jb.buf, env.epilogue_offset);
    }

    let host_size = jb.buf.offset() - entry_offset;
    let mut flags = BlockFlags::empty();
    if op_flags.contains(OpFlags::WRITE_PMEM) {
        flags |= BlockFlags::WRITE_PMEM;
    }
    if append_loop {
        flags |= BlockFlags::LOOP_END;
    }

    trace!(
        start = format_args!("{start:#08x}"),
        words = word_len,
        insns = insn_count,
        host_bytes = host_size,
        ?flags,
        "block compiled"
    );

    Ok(CompiledBlock {
        start,
        word_len,
        insn_count,
        flags,
        entry_offset,
        host_size,
    })
}

/// Loop-closing exit. The register cache is already flushed, so this
/// operates on backing memory directly; the intra-block back edge is
/// only taken when the loop body is exactly this block.
fn emit_loop_close(
    jb: &mut JitBlock,
    env: &BuildEnv,
    start: u32,
    fallthrough: u32,
    loop_top: usize,
    loop_cap: u32,
) {
    let pc_off = DspState::offset_of_pc();
    let sr_off = DspState::offset_of_sr();
    let lc_off = DspState::offset_of_lc();
    let end_addr = fallthrough.wrapping_sub(1);
    let loop_start = env.loop_ends.get(&end_addr).copied();

    emit::dec32_mem(jb.buf, STATE_BASE, lc_off);
    let loop_done = emit::jcc_forward(jb.buf, Cond::Equal);

    match loop_start {
        Some(ls) if ls == start => {
            if loop_cap > 0 {
                emit::dec32(jb.buf, LOOP_COUNT_REG);
                let cap_hit = emit::jcc_forward(jb.buf, Cond::Equal);
                emit::jmp_to(jb.buf, loop_top);
                emit::bind_forward(jb.buf, cap_hit);
                // Time slice for interrupts: leave the block, resume at
                // the loop start on the next dispatch.
                emit::store32_imm(jb.buf, STATE_BASE, pc_off, ls);
                emit::jmp_to(jb.buf, env.epilogue_offset);
            } else {
                emit::jmp_to(jb.buf, loop_top);
            }
        }
        Some(ls) => {
            emit::store32_imm(jb.buf, STATE_BASE, pc_off, ls);
            emit::jmp_to(jb.buf, env.epilogue_offset);
        }
        None => {
            // The loop instruction is responsible for registering its
            // end address. Refuse to guess.
            panic!("no loop start registered for loop end {end_addr:#08x}");
        }
    }

    emit::bind_forward(jb.buf, loop_done);
    // Count exhausted: leave the loop.
    emit::arith_mi(jb.buf, ArithOp::And, STATE_BASE, sr_off, !(sr::LF as i32));
    emit::store32_imm(jb.buf, STATE_BASE, pc_off, fallthrough);
    emit::jmp_to(jb.buf, env.epilogue_offset);
}
