//! Host register identities and the fixed register plan.
//!
//! The plan mirrors the scarcity constraints of the emulated machine:
//! the state base and the four dedicated word registers live in
//! callee-saved registers so native call-outs never disturb them, the
//! scratch pools live in caller-saved registers and are snapshotted
//! around calls by the stack helper.

/// x86-64 general-purpose registers, numbered as in ModR/M and REX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gp {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gp {
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }
}

/// x86-64 vector registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

impl Xmm {
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    pub const fn from_index(i: u8) -> Xmm {
        assert!(i < 16);
        // SAFETY: repr(u8) with contiguous discriminants 0..16.
        unsafe { std::mem::transmute(i) }
    }
}

/// Either register file, for stack bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostReg {
    Gp(Gp),
    Xmm(Xmm),
}

impl HostReg {
    /// Bytes this register occupies when pushed by the stack helper.
    /// Vector registers are saved in full.
    pub const fn push_bytes(self) -> u32 {
        match self {
            HostReg::Gp(_) => 8,
            HostReg::Xmm(_) => 16,
        }
    }

    pub const fn is_vector(self) -> bool {
        matches!(self, HostReg::Xmm(_))
    }

    /// Caller-saved under the host calling convention, i.e. clobbered
    /// by any native call made from generated code.
    pub fn is_volatile(self) -> bool {
        match self {
            HostReg::Gp(g) => VOLATILE_GPS.contains(&g),
            #[cfg(windows)]
            HostReg::Xmm(x) => (x as u8) < 6,
            #[cfg(not(windows))]
            HostReg::Xmm(_) => true,
        }
    }
}

impl From<Gp> for HostReg {
    fn from(g: Gp) -> Self {
        HostReg::Gp(g)
    }
}

impl From<Xmm> for HostReg {
    fn from(x: Xmm) -> Self {
        HostReg::Xmm(x)
    }
}

/// Base pointer to the `DspState` backing store for the lifetime of
/// generated code. Set by the shared prologue, callee-saved.
pub const STATE_BASE: Gp = Gp::Rbp;

/// Permanent scratch; used to materialize 64-bit pointers. Never pooled.
pub const SCRATCH: Gp = Gp::Rax;

/// Reserved as the shift-count register; never pooled.
pub const SHIFT_REG: Gp = Gp::Rcx;

/// Scratch pool handed to instruction emitters.
pub const POOL_GPS: [Gp; 4] = [Gp::R8, Gp::R9, Gp::R10, Gp::R11];
pub const POOL_XMMS: [Xmm; 4] = [Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2, Xmm::Xmm3];

/// Dedicated vector slot of AGU pack `i` (lanes [R, N, M, 0]).
pub const fn agu_slot(i: u8) -> Xmm {
    assert!(i < 8);
    Xmm::from_index(4 + i)
}

/// Dedicated vector slots for the wide registers A, B, X, Y.
pub const WIDE_SLOTS: [Xmm; 4] = [Xmm::Xmm12, Xmm::Xmm13, Xmm::Xmm14, Xmm::Xmm15];

/// Dedicated word slots for SR, PC, LC, LA. All callee-saved.
pub const WORD_SLOTS: [Gp; 4] = [Gp::Rbx, Gp::R12, Gp::R13, Gp::R14];

/// Intra-block hardware-loop iteration counter (callee-saved, only
/// touched when the iteration cap is configured).
pub const LOOP_COUNT_REG: Gp = Gp::R15;

#[cfg(not(windows))]
pub const CALL_ARG_GPS: [Gp; 4] = [Gp::Rdi, Gp::Rsi, Gp::Rdx, Gp::Rcx];
#[cfg(windows)]
pub const CALL_ARG_GPS: [Gp; 4] = [Gp::Rcx, Gp::Rdx, Gp::R8, Gp::R9];

#[cfg(not(windows))]
pub const VOLATILE_GPS: [Gp; 9] = [
    Gp::Rax,
    Gp::Rcx,
    Gp::Rdx,
    Gp::Rsi,
    Gp::Rdi,
    Gp::R8,
    Gp::R9,
    Gp::R10,
    Gp::R11,
];
#[cfg(windows)]
pub const VOLATILE_GPS: [Gp; 7] = [Gp::Rax, Gp::Rcx, Gp::Rdx, Gp::R8, Gp::R9, Gp::R10, Gp::R11];

/// Callee-saved GP registers the shared prologue must preserve.
#[cfg(not(windows))]
pub const CALLEE_SAVED_GPS: [Gp; 6] = [Gp::Rbx, Gp::Rbp, Gp::R12, Gp::R13, Gp::R14, Gp::R15];
#[cfg(windows)]
pub const CALLEE_SAVED_GPS: [Gp; 8] = [
    Gp::Rbx,
    Gp::Rbp,
    Gp::Rsi,
    Gp::Rdi,
    Gp::R12,
    Gp::R13,
    Gp::R14,
    Gp::R15,
];

/// Stack alignment required at every native call site.
pub const STACK_ALIGN: u32 = 16;

/// Shadow space the callee may spill its register arguments into.
#[cfg(windows)]
pub const SHADOW_SPACE: u32 = 32;
#[cfg(not(windows))]
pub const SHADOW_SPACE: u32 = 0;

/// Host vector capabilities, detected once at backend construction. The
/// AGU lane strategy is picked here, not per emitted access.
#[derive(Debug, Clone, Copy)]
pub struct HostCaps {
    pub sse41: bool,
}

impl HostCaps {
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self {
                sse41: std::arch::is_x86_feature_detected!("sse4.1"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self { sse41: false }
        }
    }
}
