/// Compilation toggles.
///
/// One instance per emulated core; the dispatcher may additionally
/// consult a per-address override callback before each compilation.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Emit bit-reverse address generation (unsupported combinations
    /// abort compilation instead of miscompiling).
    pub agu_support_bitreverse: bool,
    /// Emit multiple-wrap-modulo address generation.
    pub agu_support_multiple_wrap_modulo: bool,
    /// Keep single-instruction blocks (forced at volatile addresses) in
    /// the block cache instead of rebuilding them every dispatch.
    pub cache_single_op_blocks: bool,
    /// Route every data-memory write through the native helper call
    /// instead of emitting direct stores.
    pub memory_writes_call_native: bool,
    /// Allow dynamically computed addresses to reach the peripheral
    /// window: emits the classify-then-branch sequence on every dynamic
    /// access instead of assuming plain memory.
    pub dynamic_peripheral_addressing: bool,
    /// Hard cap on instructions per block; 0 disables the cap. A
    /// debug/tracing aid, not needed for correctness.
    pub max_instructions_per_block: u32,
    /// Maximum hardware-loop iterations executed inside one block entry
    /// before the block exits so pending interrupts can be serviced;
    /// 0 disables the cap.
    pub max_loop_iterations: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            agu_support_bitreverse: false,
            agu_support_multiple_wrap_modulo: true,
            cache_single_op_blocks: true,
            memory_writes_call_native: false,
            dynamic_peripheral_addressing: false,
            max_instructions_per_block: 0,
            max_loop_iterations: 0,
        }
    }
}
