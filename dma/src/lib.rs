//! DMA engine (volatile transfer channels).
//!
//! Six channels moving words between the emulated memory areas and the
//! peripheral window, driven by control-register writes. Transfers run
//! on a pending-countdown against the core clock; completion optionally
//! clears the enable bit and raises a channel interrupt.

pub mod channel;
pub mod controller;

pub use channel::{AddressGenMode, DmaChannel, TransferMode};
pub use controller::{Dma, MAX_DELAY_CYCLES, VBA_DMA_CHANNEL0};
