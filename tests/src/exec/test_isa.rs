//! Miniature instruction set for exercising the JIT end to end.
//!
//! Each instruction is implemented twice — as emitted host code through
//! the block-building surface, and as a direct interpreter step — so
//! compiled and interpreted execution can be compared state-for-state.
//!
//! Word layout: opcode in bits 23-16, a 16-bit operand below. `DO`
//! carries its loop end address in a second word.

use d56jit_backend::x86_64::emitter as emit;
use d56jit_backend::x86_64::emitter::ArithOp;
use d56jit_backend::{EmitInfo, JitBlock, OpEmitter, OpFlags};
use d56jit_core::state::sr;
use d56jit_core::{read_word, write_word, DspReg, DspState, MemArea, Memory, Peripherals};

pub const OP_NOP: u32 = 0x00;
/// A = imm16.
pub const OP_LDA: u32 = 0x01;
/// A = (A + imm16) & 56-bit mask.
pub const OP_ADDA: u32 = 0x02;
/// R[op>>12] = imm12.
pub const OP_LDR: u32 = 0x03;
/// R[n] = (R[n] + 1) & 24-bit mask.
pub const OP_INCR: u32 = 0x04;
/// X:[imm16] = A low 24 bits.
pub const OP_STAX: u32 = 0x05;
/// A = X:[imm16].
pub const OP_LDAX: u32 = 0x06;
/// PC = imm16.
pub const OP_BRA: u32 = 0x07;
/// PC = R0 (runtime-computed target).
pub const OP_BRR: u32 = 0x08;
/// P:[imm16] = A low 24 bits (program-memory write).
pub const OP_STP: u32 = 0x09;
/// LC = imm16, LA = second word, SR.LF set.
pub const OP_DO: u32 = 0x0a;
/// Branch to self.
pub const OP_HALT: u32 = 0x0b;
/// A = X:[R1] (runtime-computed address).
pub const OP_LDAXR: u32 = 0x0c;
/// X:[R1] = A low 24 bits (runtime-computed address).
pub const OP_STAXR: u32 = 0x0d;

const MASK24: u32 = 0x00ff_ffff;
const MASK56: u64 = 0x00ff_ffff_ffff_ffff;

/// Assemble one word.
pub fn asm(op: u32, operand: u32) -> u32 {
    (op << 16) | (operand & 0xffff)
}

pub struct TestIsa {
    /// Body start of the active hardware loop (interpreter side).
    loop_start: Option<u32>,
}

impl TestIsa {
    pub fn new() -> Self {
        Self { loop_start: None }
    }

    fn fetch(mem: &Memory, pc: u32) -> (u32, u32) {
        let word = mem.get(MemArea::P, pc);
        (word >> 16, word & 0xffff)
    }

    /// Z flag from the current accumulator value.
    fn update_z(state: &mut DspState) {
        let z = sr::Ccr::ZERO.bits();
        if state.a == 0 {
            state.sr |= z;
        } else {
            state.sr &= !z;
        }
    }

    /// Hardware-loop bookkeeping after a sequentially advancing
    /// instruction, mirroring the compiled loop-closing exit.
    fn check_loop_end(&mut self, state: &mut DspState) {
        if state.sr & sr::LF == 0 || state.pc != state.la.wrapping_add(1) {
            return;
        }
        state.lc = state.lc.wrapping_sub(1);
        if state.lc == 0 {
            state.sr &= !sr::LF;
            self.loop_start = None;
        } else if let Some(start) = self.loop_start {
            state.pc = start;
        }
    }
}

impl Default for TestIsa {
    fn default() -> Self {
        Self::new()
    }
}

impl OpEmitter for TestIsa {
    fn emit(&mut self, b: &mut JitBlock, mem: &Memory, pc: u32) -> EmitInfo {
        let (op, operand) = Self::fetch(mem, pc);
        let mut flags = OpFlags::empty();
        let mut size = 1;

        match op {
            OP_NOP => {}
            OP_LDA => {
                let s = b.scratch_gp();
                emit::mov_ri(b.buf, false, s, operand as u64);
                b.write_wide_from_gp(DspReg::A, s);
                b.release_gp(s);
                b.mark_ccr_dirty();
            }
            OP_ADDA => {
                let s = b.scratch_gp();
                b.read_wide_to_gp(DspReg::A, s);
                emit::arith_ri(b.buf, ArithOp::Add, true, s, operand as i32);
                let m = b.scratch_gp();
                emit::mov_ri(b.buf, true, m, MASK56);
                emit::arith_rr(b.buf, ArithOp::And, true, s, m);
                b.release_gp(m);
                b.write_wide_from_gp(DspReg::A, s);
                b.release_gp(s);
                b.mark_ccr_dirty();
            }
            OP_LDR => {
                let n = ((operand >> 12) & 7) as u8;
                let s = b.scratch_gp();
                emit::mov_ri(b.buf, false, s, (operand & 0xfff) as u64);
                b.agu_write(DspReg::R(n), s);
                b.release_gp(s);
            }
            OP_INCR => {
                let n = (operand & 7) as u8;
                // Linear semantics only; the consult still refuses
                // configurations the engine does not support.
                b.addressing_mode(n as u32);
                let s = b.scratch_gp();
                b.agu_read(DspReg::R(n), s);
                emit::inc32(b.buf, s);
                emit::arith_ri(b.buf, ArithOp::And, false, s, MASK24 as i32);
                b.agu_write(DspReg::R(n), s);
                b.release_gp(s);
            }
            OP_STAX => {
                let s = b.scratch_gp();
                b.read_wide_to_gp(DspReg::A, s);
                emit::arith_ri(b.buf, ArithOp::And, false, s, MASK24 as i32);
                b.mem_write_static(Some(MemArea::X), operand, s);
                b.release_gp(s);
            }
            OP_LDAX => {
                let s = b.scratch_gp();
                b.mem_read_static(s, Some(MemArea::X), operand);
                b.write_wide_from_gp(DspReg::A, s);
                b.release_gp(s);
                b.mark_ccr_dirty();
            }
            OP_BRA => {
                b.set_next_pc_imm(operand);
                flags |= OpFlags::BRANCH;
            }
            OP_BRR => {
                let s = b.scratch_gp();
                b.agu_read(DspReg::R(0), s);
                b.set_next_pc_dynamic(s);
                b.release_gp(s);
                flags |= OpFlags::BRANCH;
            }
            OP_STP => {
                let s = b.scratch_gp();
                b.read_wide_to_gp(DspReg::A, s);
                emit::arith_ri(b.buf, ArithOp::And, false, s, MASK24 as i32);
                b.mem_write_static(Some(MemArea::P), operand, s);
                let addr = b.scratch_gp();
                emit::mov_ri(b.buf, false, addr, operand as u64);
                b.record_pmem_write(addr, s);
                b.release_gp(addr);
                b.release_gp(s);
                flags |= OpFlags::WRITE_PMEM;
            }
            OP_DO => {
                let end = mem.get(MemArea::P, pc + 1) & 0xffff;
                size = 2;
                let lc = b.reg_word(DspReg::Lc, false, true);
                emit::mov_ri(b.buf, false, lc, operand as u64);
                let la = b.reg_word(DspReg::La, false, true);
                emit::mov_ri(b.buf, false, la, end as u64);
                let sr_reg = b.reg_word(DspReg::Sr, true, true);
                emit::arith_ri(b.buf, ArithOp::Or, false, sr_reg, sr::LF as i32);
                flags |= OpFlags::WRITE_TO_LC | OpFlags::WRITE_TO_LA | OpFlags::LOOP;
            }
            OP_HALT => {
                b.set_next_pc_imm(pc);
                flags |= OpFlags::BRANCH;
            }
            OP_LDAXR => {
                let addr = b.scratch_gp();
                b.agu_read(DspReg::R(1), addr);
                let s = b.scratch_gp();
                b.mem_read_dynamic(s, Some(MemArea::X), addr);
                b.write_wide_from_gp(DspReg::A, s);
                b.release_gp(s);
                b.release_gp(addr);
                b.mark_ccr_dirty();
            }
            OP_STAXR => {
                let addr = b.scratch_gp();
                b.agu_read(DspReg::R(1), addr);
                let s = b.scratch_gp();
                b.read_wide_to_gp(DspReg::A, s);
                emit::arith_ri(b.buf, ArithOp::And, false, s, MASK24 as i32);
                b.mem_write_dynamic(Some(MemArea::X), addr, s);
                b.release_gp(s);
                b.release_gp(addr);
            }
            other => panic!("unknown test opcode {other:#x} at {pc:#x}"),
        }

        EmitInfo { size, flags }
    }

    fn interpret(
        &mut self,
        state: &mut DspState,
        mem: &mut Memory,
        periph: &mut dyn Peripherals,
        pc: u32,
    ) -> u32 {
        let (op, operand) = Self::fetch(mem, pc);
        let mut size = 1;
        let mut branched = false;

        match op {
            OP_NOP => {}
            OP_LDA => {
                state.a = operand as u64;
                Self::update_z(state);
            }
            OP_ADDA => {
                state.a = (state.a + operand as u64) & MASK56;
                Self::update_z(state);
            }
            OP_LDR => {
                let n = ((operand >> 12) & 7) as usize;
                state.r[n] = operand & 0xfff;
            }
            OP_INCR => {
                let n = (operand & 7) as usize;
                state.r[n] = state.r[n].wrapping_add(1) & MASK24;
            }
            OP_STAX => {
                write_word(mem, periph, MemArea::X, operand, state.a as u32 & MASK24);
            }
            OP_LDAX => {
                state.a = read_word(mem, periph, MemArea::X, operand) as u64;
                Self::update_z(state);
            }
            OP_BRA => {
                state.pc = operand;
                branched = true;
            }
            OP_BRR => {
                state.pc = state.r[0];
                branched = true;
            }
            OP_STP => {
                mem.set(MemArea::P, operand, state.a as u32 & MASK24);
            }
            OP_DO => {
                let end = mem.get(MemArea::P, pc + 1) & 0xffff;
                size = 2;
                state.lc = operand;
                state.la = end;
                state.sr |= sr::LF;
                self.loop_start = Some(pc + 2);
            }
            OP_HALT => {
                branched = true;
            }
            OP_LDAXR => {
                state.a = read_word(mem, periph, MemArea::X, state.r[1]) as u64;
                Self::update_z(state);
            }
            OP_STAXR => {
                write_word(mem, periph, MemArea::X, state.r[1], state.a as u32 & MASK24);
            }
            other => panic!("unknown test opcode {other:#x} at {pc:#x}"),
        }

        if !branched {
            state.pc = pc + size;
            self.check_loop_end(state);
        }
        size
    }

    fn flush_ccr(&mut self, b: &mut JitBlock) {
        // Z from the final accumulator value; the per-instruction marks
        // were batched.
        let s = b.scratch_gp();
        b.read_wide_to_gp(DspReg::A, s);
        emit::test_rr(b.buf, true, s, s);
        emit::setcc(b.buf, emit::Cond::Equal, s);
        emit::movzx8(b.buf, s, s);
        emit::shift_ri(b.buf, emit::ShiftOp::Shl, false, s, 2);
        let sr_reg = b.reg_word(DspReg::Sr, true, true);
        emit::arith_ri(b.buf, ArithOp::And, false, sr_reg, !(sr::Ccr::ZERO.bits() as i32));
        emit::arith_rr(b.buf, ArithOp::Or, false, sr_reg, s);
        b.release_gp(s);
    }
}
