//! Runtime dispatcher for the DSP56300-class JIT.
//!
//! Drives the lookup → compile → execute cycle over the block cache,
//! with mode-keyed block chains, coarse self-modification invalidation
//! and block-boundary interrupt servicing.

pub mod cache;
pub mod dispatch;

pub use cache::{BlockCache, BlockChain};
pub use dispatch::{BlockConfigFn, Jit, JitStats, StepOutcome};
