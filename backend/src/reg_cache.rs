//! Virtual DSP register cache.
//!
//! Projects a subset of the emulated register file into host registers
//! for the duration of one block. Loads are lazy (first reference emits
//! the load), stores happen at block exit: AGU packs, accumulators and
//! data registers store back whenever they were loaded, the word
//! registers (SR/PC/LC/LA) only when written. Outside of a flush, at
//! most one host register holds the live value of a given emulated
//! register, and the backing store is stale exactly for the registers
//! currently cached and dirty.
//!
//! Address-generator triples pack {R, N, M} into one 128-bit register
//! (lanes 0/1/2), assembled by sequential load-shift-merge steps and
//! read back by symmetric shifts. One extra shift or merge per access
//! buys halving 24 scalar values down to 8 vector slots.

use d56jit_core::{DspReg, DspState};

use crate::code_buffer::CodeBuffer;
use crate::stack::StackHelper;
use crate::x86_64::emitter as emit;
use crate::x86_64::regs::{agu_slot, Gp, HostCaps, HostReg, Xmm, STATE_BASE, WIDE_SLOTS, WORD_SLOTS};
use crate::RegPool;

/// Liveness of one cached register, with pure transition functions so
/// the policy can be property-tested apart from any emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Unloaded,
    Clean,
    Dirty,
}

impl CacheState {
    pub fn after_load(self) -> CacheState {
        match self {
            CacheState::Unloaded => CacheState::Clean,
            s => s,
        }
    }

    pub fn after_write(self) -> CacheState {
        CacheState::Dirty
    }

    pub fn after_flush(self) -> CacheState {
        CacheState::Unloaded
    }

    pub fn is_loaded(self) -> bool {
        self != CacheState::Unloaded
    }
}

pub struct DspRegCache {
    agu: [CacheState; 8],
    wide: [CacheState; 4],
    word: [CacheState; 4],
    caps: HostCaps,
}

fn wide_index(reg: DspReg) -> usize {
    match reg {
        DspReg::A => 0,
        DspReg::B => 1,
        DspReg::X => 2,
        DspReg::Y => 3,
        _ => panic!("{reg:?} is not a wide register"),
    }
}

fn word_index(reg: DspReg) -> usize {
    match reg {
        DspReg::Sr => 0,
        DspReg::Pc => 1,
        DspReg::Lc => 2,
        DspReg::La => 3,
        _ => panic!("{reg:?} is not a word register"),
    }
}

/// Pack lane of an AGU component register.
fn agu_lane(reg: DspReg) -> u8 {
    match reg {
        DspReg::R(_) => 0,
        DspReg::N(_) => 1,
        DspReg::M(_) => 2,
        _ => panic!("{reg:?} is not an AGU register"),
    }
}

impl DspRegCache {
    pub fn new(caps: HostCaps) -> Self {
        Self {
            agu: [CacheState::Unloaded; 8],
            wide: [CacheState::Unloaded; 4],
            word: [CacheState::Unloaded; 4],
            caps,
        }
    }

    /// Map a logical register to the host register caching it, loading
    /// on first use. AGU components map to their generator's pack; use
    /// the lane accessors to move values in and out.
    pub fn get(
        &mut self,
        buf: &mut CodeBuffer,
        stack: &mut StackHelper,
        xmm_pool: &mut RegPool<Xmm>,
        reg: DspReg,
        read: bool,
        write: bool,
    ) -> HostReg {
        match reg.class() {
            d56jit_core::RegClass::AguPack => {
                let i = reg.agu_index().unwrap() as usize;
                self.ensure_agu_loaded(buf, stack, xmm_pool, i);
                if write {
                    self.agu[i] = self.agu[i].after_write();
                }
                HostReg::Xmm(agu_slot(i as u8))
            }
            d56jit_core::RegClass::Wide => HostReg::Xmm(self.get_wide(buf, stack, reg, read, write)),
            d56jit_core::RegClass::Word => HostReg::Gp(self.get_word(buf, stack, reg, read, write)),
        }
    }

    /// Dedicated vector slot of an accumulator or data register.
    pub fn get_wide(
        &mut self,
        buf: &mut CodeBuffer,
        stack: &mut StackHelper,
        reg: DspReg,
        read: bool,
        write: bool,
    ) -> Xmm {
        let i = wide_index(reg);
        let slot = WIDE_SLOTS[i];
        if read && !self.wide[i].is_loaded() {
            emit::movq_load(buf, slot, STATE_BASE, DspState::offset_of_reg(reg));
        }
        stack.set_used(slot);
        self.wide[i] = self.wide[i].after_load();
        if write {
            self.wide[i] = self.wide[i].after_write();
        }
        slot
    }

    /// Dedicated word slot of SR/PC/LC/LA.
    pub fn get_word(
        &mut self,
        buf: &mut CodeBuffer,
        stack: &mut StackHelper,
        reg: DspReg,
        read: bool,
        write: bool,
    ) -> Gp {
        let i = word_index(reg);
        let slot = WORD_SLOTS[i];
        if read && !self.word[i].is_loaded() {
            emit::load32(buf, slot, STATE_BASE, DspState::offset_of_reg(reg));
        }
        stack.set_used(slot);
        self.word[i] = self.word[i].after_load();
        if write {
            self.word[i] = self.word[i].after_write();
        }
        slot
    }

    /// Copy an accumulator/data register into a general register.
    pub fn read_wide_to_gp(
        &mut self,
        buf: &mut CodeBuffer,
        stack: &mut StackHelper,
        reg: DspReg,
        dst: Gp,
    ) {
        let slot = self.get_wide(buf, stack, reg, true, false);
        emit::movq_gx(buf, dst, slot);
    }

    /// Replace an accumulator/data register from a general register.
    pub fn write_wide_from_gp(
        &mut self,
        buf: &mut CodeBuffer,
        stack: &mut StackHelper,
        reg: DspReg,
        src: Gp,
    ) {
        let slot = self.get_wide(buf, stack, reg, false, true);
        emit::movq_xg(buf, slot, src);
    }

    /// Read one AGU component (R/N/M) into `dst`.
    pub fn agu_read(
        &mut self,
        buf: &mut CodeBuffer,
        stack: &mut StackHelper,
        xmm_pool: &mut RegPool<Xmm>,
        reg: DspReg,
        dst: Gp,
    ) {
        let i = reg.agu_index().expect("AGU register expected") as usize;
        self.ensure_agu_loaded(buf, stack, xmm_pool, i);
        let xm = agu_slot(i as u8);
        match agu_lane(reg) {
            0 => emit::movd_gx(buf, dst, xm),
            lane if self.caps.sse41 => emit::pextrd(buf, dst, xm, lane),
            lane => {
                // Swap the wanted lane into lane 0, extract, swap back.
                let order = shuffle_for_lane(lane);
                emit::pshufd(buf, xm, xm, order);
                emit::movd_gx(buf, dst, xm);
                emit::pshufd(buf, xm, xm, order);
            }
        }
    }

    /// Overwrite one AGU component (R/N/M) from `src`.
    pub fn agu_write(
        &mut self,
        buf: &mut CodeBuffer,
        stack: &mut StackHelper,
        xmm_pool: &mut RegPool<Xmm>,
        reg: DspReg,
        src: Gp,
    ) {
        let i = reg.agu_index().expect("AGU register expected") as usize;
        // Partial pack update: the other two lanes must be live.
        self.ensure_agu_loaded(buf, stack, xmm_pool, i);
        let xm = agu_slot(i as u8);
        let lane = agu_lane(reg);
        if self.caps.sse41 {
            emit::pinsrd(buf, xm, src, lane);
        } else {
            let tmp = xmm_pool.acquire();
            stack.set_used(tmp);
            emit::movd_xg(buf, tmp, src);
            if lane == 0 {
                emit::movss_rr(buf, xm, tmp);
            } else {
                let order = shuffle_for_lane(lane);
                emit::pshufd(buf, xm, xm, order);
                emit::movss_rr(buf, xm, tmp);
                emit::pshufd(buf, xm, xm, order);
            }
            xmm_pool.release(tmp);
        }
        self.agu[i] = self.agu[i].after_write();
    }

    fn ensure_agu_loaded(
        &mut self,
        buf: &mut CodeBuffer,
        stack: &mut StackHelper,
        xmm_pool: &mut RegPool<Xmm>,
        i: usize,
    ) {
        if self.agu[i].is_loaded() {
            return;
        }
        let xm = agu_slot(i as u8);
        stack.set_used(xm);

        // Assemble [R, N, M, 0] from the three backing words.
        emit::movd_load(buf, xm, STATE_BASE, DspState::offset_of_reg(DspReg::M(i as u8)));
        emit::pslldq(buf, xm, 4);

        let tmp = xmm_pool.acquire();
        stack.set_used(tmp);
        emit::movd_load(buf, tmp, STATE_BASE, DspState::offset_of_reg(DspReg::N(i as u8)));
        emit::movss_rr(buf, xm, tmp);
        emit::pslldq(buf, xm, 4);
        emit::movd_load(buf, tmp, STATE_BASE, DspState::offset_of_reg(DspReg::R(i as u8)));
        emit::movss_rr(buf, xm, tmp);
        xmm_pool.release(tmp);

        self.agu[i] = self.agu[i].after_load();
    }

    /// Store an AGU pack back, shifting the lanes out one by one.
    /// Destroys the register contents, so the pack goes back to
    /// Unloaded.
    fn store_agu(&mut self, buf: &mut CodeBuffer, i: usize) {
        let xm = agu_slot(i as u8);
        emit::movd_store(buf, STATE_BASE, DspState::offset_of_reg(DspReg::R(i as u8)), xm);
        emit::psrldq(buf, xm, 4);
        emit::movd_store(buf, STATE_BASE, DspState::offset_of_reg(DspReg::N(i as u8)), xm);
        emit::psrldq(buf, xm, 4);
        emit::movd_store(buf, STATE_BASE, DspState::offset_of_reg(DspReg::M(i as u8)), xm);
        self.agu[i] = self.agu[i].after_flush();
    }

    /// Store every cached register back to the backing store. After
    /// this, backing memory is authoritative for the whole register
    /// file.
    pub fn flush_all(&mut self, buf: &mut CodeBuffer) {
        for i in 0..8 {
            if self.agu[i].is_loaded() {
                self.store_agu(buf, i);
            }
        }
        for (i, reg) in [DspReg::A, DspReg::B, DspReg::X, DspReg::Y].into_iter().enumerate() {
            if self.wide[i].is_loaded() {
                emit::movq_store(buf, STATE_BASE, DspState::offset_of_reg(reg), WIDE_SLOTS[i]);
                self.wide[i] = self.wide[i].after_flush();
            }
        }
        for (i, reg) in [DspReg::Sr, DspReg::Pc, DspReg::Lc, DspReg::La]
            .into_iter()
            .enumerate()
        {
            if self.word[i] == CacheState::Dirty {
                emit::store32(buf, STATE_BASE, DspState::offset_of_reg(reg), WORD_SLOTS[i]);
            }
            self.word[i] = self.word[i].after_flush();
        }
    }

    /// True when nothing is cached (holds after `flush_all`).
    pub fn is_flushed(&self) -> bool {
        self.agu.iter().all(|s| !s.is_loaded())
            && self.wide.iter().all(|s| !s.is_loaded())
            && self.word.iter().all(|s| !s.is_loaded())
    }

    pub fn state_of(&self, reg: DspReg) -> CacheState {
        match reg.class() {
            d56jit_core::RegClass::AguPack => self.agu[reg.agu_index().unwrap() as usize],
            d56jit_core::RegClass::Wide => self.wide[wide_index(reg)],
            d56jit_core::RegClass::Word => self.word[word_index(reg)],
        }
    }
}

/// PSHUFD order that swaps `lane` with lane 0 (its own inverse).
fn shuffle_for_lane(lane: u8) -> u8 {
    match lane {
        1 => 0xE1, // 3,2,0,1 — swap lanes 0 and 1
        2 => 0xC6, // 3,0,1,2 — swap lanes 0 and 2
        _ => unreachable!("lane 0 needs no shuffle"),
    }
}
