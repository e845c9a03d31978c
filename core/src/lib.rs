//! Core types for the DSP56300-class JIT engine.
//!
//! Leaf crate: the emulated CPU register backing store, memory areas and
//! backing arrays, addressing-mode/mode-key derivation and the JIT
//! configuration. Everything here is plain data — code generation lives
//! in `d56jit-backend`.

pub mod config;
pub mod memory;
pub mod mode;
pub mod state;

pub use config::JitConfig;
pub use memory::{
    bulk_copy, bulk_copy_to_fixed, bulk_fill, is_peripheral, is_peripheral_range, read_word,
    write_word, InterruptSink, MemArea, Memory, Peripherals,
};
pub use mode::{calc_addressing_mode, AddressingMode, JitMode};
pub use state::{sr, DspReg, DspState, RegClass};
