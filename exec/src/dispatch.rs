//! Runtime dispatcher.
//!
//! Owns the code buffer, the block cache and the runtime-data cells.
//! Each step derives the current mode key, runs the cached block for
//! (PC, mode) or compiles one, and post-processes the exit: observed
//! program-memory writes invalidate the whole cache (coarse on purpose
//! — no stale code may survive a write to the code it came from), and
//! pending interrupts are serviced only at block boundaries.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;

use d56jit_backend::x86_64::stubs;
use d56jit_backend::{
    build_block, BlockFlags, BuildEnv, CodeBuffer, CompiledBlock, EngineStubs, HostCaps, JitError,
    MemParams, NativeCtx, OpEmitter, RuntimeData, ADDR_INVALID,
};
use d56jit_core::{DspState, InterruptSink, JitConfig, JitMode, Memory, Peripherals};
use tracing::{debug, trace};

use crate::cache::BlockCache;

/// Refuse to compile with less than this much buffer left; the cache is
/// flushed instead and compilation starts over into a fresh buffer.
const MIN_CODE_BUF_REMAINING: usize = 64 * 1024;

/// Per-address configuration override, consulted before each
/// compilation.
pub type BlockConfigFn = Box<dyn Fn(u32) -> Option<JitConfig>>;

/// What one dispatcher step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A cached block ran.
    Cached,
    /// A block was compiled, then ran.
    Compiled,
    /// Nothing to compile; one instruction was interpreted.
    Interpreted,
}

/// Running totals, for tests and diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct JitStats {
    pub blocks_compiled: u64,
    pub blocks_executed: u64,
    pub instructions_interpreted: u64,
    pub cache_invalidations: u64,
}

pub struct Jit {
    buf: CodeBuffer,
    stubs: EngineStubs,
    caps: HostCaps,
    cache: BlockCache,
    config: JitConfig,
    block_config: Option<BlockConfigFn>,
    runtime: Box<RuntimeData>,
    volatile_p: HashSet<u32>,
    loop_ends: HashMap<u32, u32>,
    pending_interrupts: VecDeque<u32>,
    stats: JitStats,
}

impl Jit {
    pub fn new(config: JitConfig) -> io::Result<Self> {
        let mut buf = CodeBuffer::with_default_size()?;
        let stubs = stubs::emit_stubs(&mut buf);
        Ok(Self {
            buf,
            stubs,
            caps: HostCaps::detect(),
            cache: BlockCache::new(),
            config,
            block_config: None,
            runtime: RuntimeData::new(),
            volatile_p: HashSet::new(),
            loop_ends: HashMap::new(),
            pending_interrupts: VecDeque::new(),
            stats: JitStats::default(),
        })
    }

    /// Install a per-address configuration override.
    pub fn set_block_config(&mut self, f: Option<BlockConfigFn>) {
        self.block_config = f;
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    pub fn cached_blocks(&self) -> usize {
        self.cache.block_count()
    }

    /// Register a hardware loop's end/start pair. Loop instructions
    /// must call this before a block can attach the loop-closing exit.
    pub fn register_loop(&mut self, end: u32, start: u32) {
        self.loop_ends.insert(end, start);
    }

    /// Flag a program-memory address as self-modified; blocks there
    /// are compiled one instruction at a time from now on.
    pub fn mark_volatile(&mut self, addr: u32) {
        self.volatile_p.insert(addr);
    }

    pub fn is_volatile(&self, addr: u32) -> bool {
        self.volatile_p.contains(&addr)
    }

    /// Drop every compiled block and reclaim the code buffer.
    pub fn invalidate_all(&mut self) {
        self.cache.clear();
        self.buf.truncate(self.stubs.code_start);
        self.stats.cache_invalidations += 1;
        debug!("block cache invalidated");
    }

    /// Range invalidation: coarse like the rest of the cache — clears
    /// everything — but additionally marks the range volatile so
    /// recompiled code there stays single-instruction.
    pub fn invalidate_range(&mut self, start: u32, len: u32) {
        for addr in start..start.saturating_add(len) {
            self.volatile_p.insert(addr);
        }
        self.invalidate_all();
    }

    /// Compile a block at `pc` against the current mode, inserting it
    /// into the cache unless it is an uncacheable single-instruction
    /// volatile block.
    pub fn compile(
        &mut self,
        state: &DspState,
        mem: &Memory,
        emitter: &mut dyn OpEmitter,
        pc: u32,
    ) -> Result<CompiledBlock, JitError> {
        let mode = JitMode::from_state(state);

        // Idempotence: compiling a cached (address, mode) pair again
        // returns the existing block.
        if let Some(block) = self.cache.lookup(pc, mode) {
            return Ok(block.clone());
        }

        if self.buf.remaining() < MIN_CODE_BUF_REMAINING {
            debug!("code buffer low, flushing cache");
            self.invalidate_all();
        }
        let config = self
            .block_config
            .as_ref()
            .and_then(|f| f(pc))
            .unwrap_or_else(|| self.config.clone());

        let cache_single = config.cache_single_op_blocks;
        let cache = &self.cache;
        // Occupancy is per (address, mode): a different mode variant at
        // the same address compiles its own chain entry.
        let occupied = move |addr: u32| cache.lookup(addr, mode).is_some();
        let env = BuildEnv {
            mem: MemParams::new(mem, self.runtime.cells().native_ctx),
            memory: mem,
            config,
            mode,
            state,
            volatile_p: &self.volatile_p,
            loop_ends: &self.loop_ends,
            occupied: &occupied,
            cells: self.runtime.cells(),
            epilogue_offset: self.stubs.epilogue_offset,
        };

        let block = build_block(&mut self.buf, emitter, &env, self.caps, pc)?;
        self.stats.blocks_compiled += 1;

        let uncacheable =
            block.insn_count == 1 && self.volatile_p.contains(&block.start) && !cache_single;
        if !uncacheable {
            self.cache.insert(mode, block.clone());
        }
        Ok(block)
    }

    /// Run one compiled block against live state.
    pub fn exec_block(
        &mut self,
        state: &mut DspState,
        mem: &mut Memory,
        periph: &mut dyn Peripherals,
        block: &CompiledBlock,
    ) {
        self.runtime.pmem_write_addr = ADDR_INVALID;

        let mut ctx = NativeCtx::new(mem, periph);
        self.runtime.native_ctx = &mut ctx;

        // SAFETY: `block` was emitted into `self.buf` and finalized;
        // the state pointer is valid for the duration of the call; the
        // native context outlives it.
        unsafe {
            stubs::enter(
                &self.buf,
                self.stubs,
                state as *mut DspState as *mut u8,
                self.buf.ptr_at(block.entry_offset),
            );
        }
        self.runtime.native_ctx = std::ptr::null_mut();
        self.stats.blocks_executed += 1;

        // Self-modification: no stale compiled code survives a write to
        // program memory.
        if block.flags.contains(BlockFlags::WRITE_PMEM) {
            let addr = self.runtime.pmem_write_addr;
            if addr != ADDR_INVALID {
                trace!(addr = format_args!("{addr:#08x}"), "program memory written");
                self.volatile_p.insert(addr);
                self.invalidate_all();
            }
        }
    }

    /// One dispatcher step: service a pending interrupt, then look up,
    /// compile or interpret at the current PC, and execute.
    pub fn step(
        &mut self,
        state: &mut DspState,
        mem: &mut Memory,
        periph: &mut dyn Peripherals,
        emitter: &mut dyn OpEmitter,
    ) -> StepOutcome {
        // Interrupts are only checked between blocks; a block always
        // runs to its single exit.
        if let Some(vector) = self.pending_interrupts.pop_front() {
            trace!(vector, "servicing interrupt");
            state.pc = vector;
        }

        let pc = state.pc;
        let mode = JitMode::from_state(state);

        if let Some(block) = self.cache.lookup(pc, mode).cloned() {
            self.exec_block(state, mem, periph, &block);
            return StepOutcome::Cached;
        }

        match self.compile(state, mem, emitter, pc) {
            Ok(block) => {
                self.exec_block(state, mem, periph, &block);
                StepOutcome::Compiled
            }
            Err(JitError::EmptyBlock(_)) => {
                // Single-step fallback; the interpreter leaves the PC
                // fully updated.
                emitter.interpret(state, mem, periph, pc);
                self.stats.instructions_interpreted += 1;
                StepOutcome::Interpreted
            }
            Err(JitError::BufferFull) => unreachable!("compile self-heals a full buffer"),
        }
    }
}

impl InterruptSink for Jit {
    fn inject_interrupt(&mut self, vector: u32) {
        self.pending_interrupts.push_back(vector);
    }
}
