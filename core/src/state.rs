use std::mem::offset_of;

/// Emulated CPU register backing store.
///
/// `#[repr(C)]` because the field offsets are the ABI between Rust and
/// generated code: compiled blocks address every register relative to a
/// base pointer held in a host register for the lifetime of the block.
/// One instance per emulated core; always passed explicitly, never
/// global, so multiple cores and test fixtures stay independent.
///
/// 24-bit quantities live in the low bits of a `u32`, the 56-bit
/// accumulators and 48-bit data registers in the low bits of a `u64`.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct DspState {
    /// Address registers R0-R7.
    pub r: [u32; 8],
    /// Offset registers N0-N7.
    pub n: [u32; 8],
    /// Modifier registers M0-M7.
    pub m: [u32; 8],
    /// Accumulator A (56 bit).
    pub a: u64,
    /// Accumulator B (56 bit).
    pub b: u64,
    /// Data register X (48 bit).
    pub x: u64,
    /// Data register Y (48 bit).
    pub y: u64,
    /// Status register.
    pub sr: u32,
    /// Program counter.
    pub pc: u32,
    /// Loop counter.
    pub lc: u32,
    /// Loop address (last address of the active hardware loop).
    pub la: u32,
    /// System stack pointer.
    pub sp: u32,
}

impl DspState {
    pub fn new() -> Self {
        Self {
            r: [0; 8],
            n: [0; 8],
            // Linear addressing on all generators after reset.
            m: [0xff_ffff; 8],
            a: 0,
            b: 0,
            x: 0,
            y: 0,
            sr: 0,
            pc: 0,
            lc: 0,
            la: 0,
            sp: 0,
        }
    }

    /// Byte offset of a logical register's backing field.
    pub fn offset_of_reg(reg: DspReg) -> i32 {
        let off = match reg {
            DspReg::R(i) => offset_of!(DspState, r) + 4 * i as usize,
            DspReg::N(i) => offset_of!(DspState, n) + 4 * i as usize,
            DspReg::M(i) => offset_of!(DspState, m) + 4 * i as usize,
            DspReg::A => offset_of!(DspState, a),
            DspReg::B => offset_of!(DspState, b),
            DspReg::X => offset_of!(DspState, x),
            DspReg::Y => offset_of!(DspState, y),
            DspReg::Sr => offset_of!(DspState, sr),
            DspReg::Pc => offset_of!(DspState, pc),
            DspReg::Lc => offset_of!(DspState, lc),
            DspReg::La => offset_of!(DspState, la),
        };
        off as i32
    }

    pub const fn offset_of_pc() -> i32 {
        offset_of!(DspState, pc) as i32
    }

    pub const fn offset_of_sr() -> i32 {
        offset_of!(DspState, sr) as i32
    }

    pub const fn offset_of_lc() -> i32 {
        offset_of!(DspState, lc) as i32
    }
}

impl Default for DspState {
    fn default() -> Self {
        Self::new()
    }
}

/// A logical (emulated) register, as opposed to a host register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DspReg {
    /// Address register of generator 0-7.
    R(u8),
    /// Offset register of generator 0-7.
    N(u8),
    /// Modifier register of generator 0-7.
    M(u8),
    A,
    B,
    X,
    Y,
    Sr,
    Pc,
    Lc,
    La,
}

/// Host-register class a logical register is cached in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    /// One lane of a packed {R, N, M} vector register.
    AguPack,
    /// A dedicated 128-bit vector slot (accumulators, data registers).
    Wide,
    /// A dedicated general-purpose register (SR/PC/LC/LA).
    Word,
}

impl DspReg {
    /// All logical registers, in cache-slot order.
    pub fn all() -> impl Iterator<Item = DspReg> {
        let agu = (0..8u8).flat_map(|i| [DspReg::R(i), DspReg::N(i), DspReg::M(i)]);
        agu.chain([
            DspReg::A,
            DspReg::B,
            DspReg::X,
            DspReg::Y,
            DspReg::Sr,
            DspReg::Pc,
            DspReg::Lc,
            DspReg::La,
        ])
    }

    pub fn class(self) -> RegClass {
        match self {
            DspReg::R(_) | DspReg::N(_) | DspReg::M(_) => RegClass::AguPack,
            DspReg::A | DspReg::B | DspReg::X | DspReg::Y => RegClass::Wide,
            DspReg::Sr | DspReg::Pc | DspReg::Lc | DspReg::La => RegClass::Word,
        }
    }

    /// Address-generator index for AGU component registers.
    pub fn agu_index(self) -> Option<u8> {
        match self {
            DspReg::R(i) | DspReg::N(i) | DspReg::M(i) => Some(i),
            _ => None,
        }
    }
}

/// Status register bit positions and masks.
pub mod sr {
    use bitflags::bitflags;

    bitflags! {
        /// Condition code register bits (SR bits 0-7).
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct Ccr: u32 {
            const CARRY = 1 << 0;
            const OVERFLOW = 1 << 1;
            const ZERO = 1 << 2;
            const NEGATIVE = 1 << 3;
            const UNNORMALIZED = 1 << 4;
            const EXTENSION = 1 << 5;
            const LIMIT = 1 << 6;
            const SCALING = 1 << 7;
        }
    }

    /// Scaling mode bit 0.
    pub const S0: u32 = 1 << 10;
    /// Scaling mode bit 1.
    pub const S1: u32 = 1 << 11;
    /// Sixteen-bit compatibility mode.
    pub const SC: u32 = 1 << 13;
    /// Double-precision multiply mode.
    pub const DM: u32 = 1 << 14;
    /// Loop flag: a hardware DO loop is active.
    pub const LF: u32 = 1 << 15;

    /// SR bits that affect generated code and therefore participate in
    /// the mode key. The CCR is evaluated at runtime, never compiled in,
    /// and the interrupt mask bits only matter between blocks.
    pub const MODE_RELEVANT: u32 = S0 | S1 | SC | DM;
}
