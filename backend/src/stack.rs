//! Host stack bookkeeping for generated code.
//!
//! Tracks every register pushed by block code so depth is known exactly
//! at all times, snapshots the volatile working set around native
//! call-outs, and wraps calls with the alignment and shadow-space rules
//! of the host calling convention. Block entry leaves the stack 16-byte
//! aligned (arranged by the shared prologue), so the correction at a
//! call site is a pure function of the tracked push depth.

use crate::code_buffer::CodeBuffer;
use crate::x86_64::emitter as emit;
use crate::x86_64::regs::{Gp, HostReg, Xmm, SHADOW_SPACE, STACK_ALIGN};

#[derive(Debug, Clone, Copy)]
struct Pushed {
    reg: HostReg,
    /// Cumulative push depth right after this entry was pushed; the
    /// entry currently lives at `[rsp + depth_now - stack_offset]`.
    stack_offset: u32,
}

pub struct StackHelper {
    pushed: Vec<Pushed>,
    pushed_bytes: u32,
    used: Vec<HostReg>,
    call_count: u32,
}

/// Restore point returned by `push_volatiles`.
#[derive(Debug, Clone, Copy)]
pub struct StackMark(usize);

impl StackHelper {
    pub fn new() -> Self {
        Self {
            pushed: Vec::with_capacity(16),
            pushed_bytes: 0,
            used: Vec::with_capacity(16),
            call_count: 0,
        }
    }

    pub fn depth_bytes(&self) -> u32 {
        self.pushed_bytes
    }

    pub fn push_count(&self) -> usize {
        self.pushed.len()
    }

    pub fn call_count(&self) -> u32 {
        self.call_count
    }

    /// Record that generated code touches `reg`. Idempotent.
    pub fn set_used(&mut self, reg: impl Into<HostReg>) {
        let reg = reg.into();
        if !self.used.contains(&reg) {
            self.used.push(reg);
        }
    }

    pub fn is_used(&self, reg: impl Into<HostReg>) -> bool {
        self.used.contains(&reg.into())
    }

    pub fn push_gp(&mut self, buf: &mut CodeBuffer, reg: Gp) {
        emit::push(buf, reg);
        self.record(HostReg::Gp(reg));
    }

    /// Vector pushes reserve a full 16 bytes and save all lanes.
    pub fn push_xmm(&mut self, buf: &mut CodeBuffer, reg: Xmm) {
        emit::sub_rsp(buf, 16);
        emit::movdqu_store(buf, Gp::Rsp, 0, reg);
        self.record(HostReg::Xmm(reg));
    }

    fn record(&mut self, reg: HostReg) {
        self.pushed_bytes += reg.push_bytes();
        self.pushed.push(Pushed {
            reg,
            stack_offset: self.pushed_bytes,
        });
    }

    /// Pop the most recent push.
    pub fn pop(&mut self, buf: &mut CodeBuffer) {
        let entry = self.pushed.pop().expect("pop with empty stack record");
        self.pushed_bytes -= entry.reg.push_bytes();
        match entry.reg {
            HostReg::Gp(g) => emit::pop(buf, g),
            HostReg::Xmm(x) => {
                emit::movdqu_load(buf, x, Gp::Rsp, 0);
                emit::add_rsp(buf, 16);
            }
        }
    }

    /// Save every volatile register the block is using, excluding
    /// `exclude` (typically the register a call result lands in).
    /// Returns the mark to hand back to `restore`.
    ///
    /// If the byte count is misaligned for the upcoming call, one
    /// already-selected register is pushed a second time purely as
    /// alignment padding; the duplicate pops back into the same
    /// register, so restore needs no special case.
    pub fn push_volatiles(&mut self, buf: &mut CodeBuffer, exclude: &[HostReg]) -> StackMark {
        let mark = StackMark(self.pushed.len());

        let mut to_push: Vec<HostReg> = self
            .used
            .iter()
            .copied()
            .filter(|r| r.is_volatile() && !exclude.contains(r))
            .collect();

        let mut bytes: u32 = to_push.iter().map(|r| r.push_bytes()).sum();
        if bytes % STACK_ALIGN != 0 {
            let pad = *to_push
                .iter()
                .rev()
                .find(|r| !r.is_vector())
                .expect("misaligned push set without a GP register");
            to_push.push(pad);
            bytes += pad.push_bytes();
        }

        if to_push.iter().any(|r| r.is_vector()) {
            // One stack-pointer adjustment plus offset stores beats a
            // sequence of sub/movdqu pairs once vectors are involved.
            emit::sub_rsp(buf, bytes);
            self.pushed_bytes += bytes;
            let mut offset: i32 = 0;
            for reg in to_push {
                self.pushed.push(Pushed {
                    reg,
                    stack_offset: self.pushed_bytes - offset as u32,
                });
                match reg {
                    HostReg::Gp(g) => emit::store64(buf, Gp::Rsp, offset, g),
                    HostReg::Xmm(x) => emit::movdqu_store(buf, Gp::Rsp, offset, x),
                }
                offset += reg.push_bytes() as i32;
            }
        } else {
            for reg in to_push {
                match reg {
                    HostReg::Gp(g) => self.push_gp(buf, g),
                    HostReg::Xmm(x) => self.push_xmm(buf, x),
                }
            }
        }

        mark
    }

    /// Restore everything pushed since `mark`.
    pub fn restore(&mut self, buf: &mut CodeBuffer, mark: StackMark) {
        let range = mark.0..self.pushed.len();
        if range.is_empty() {
            return;
        }

        if self.pushed[range.clone()].iter().any(|p| p.reg.is_vector()) {
            // Reload in memory-address order, then one adjustment.
            let mut entries: Vec<Pushed> = self.pushed.drain(range).collect();
            let bytes: u32 = entries.iter().map(|p| p.reg.push_bytes()).sum();
            entries.sort_by_key(|p| std::cmp::Reverse(p.stack_offset));
            for p in &entries {
                let offset = (self.pushed_bytes - p.stack_offset) as i32;
                match p.reg {
                    HostReg::Gp(g) => emit::load64(buf, g, Gp::Rsp, offset),
                    HostReg::Xmm(x) => emit::movdqu_load(buf, x, Gp::Rsp, offset),
                }
            }
            emit::add_rsp(buf, bytes);
            self.pushed_bytes -= bytes;
        } else {
            while self.pushed.len() > mark.0 {
                self.pop(buf);
            }
        }
    }

    /// Pop every outstanding push.
    pub fn pop_all(&mut self, buf: &mut CodeBuffer) {
        self.restore(buf, StackMark(0));
    }

    /// Wrap one native call: align the stack and reserve shadow space,
    /// run `emit_call` (argument setup + the call itself), undo.
    pub fn call(&mut self, buf: &mut CodeBuffer, emit_call: impl FnOnce(&mut CodeBuffer)) {
        let align_pad = (STACK_ALIGN - self.pushed_bytes % STACK_ALIGN) % STACK_ALIGN;
        let adjust = align_pad + SHADOW_SPACE;

        emit::sub_rsp(buf, adjust);
        emit_call(buf);
        emit::add_rsp(buf, adjust);

        self.call_count += 1;
    }

    /// Block finalization check: every push must have been popped.
    pub fn finish(&self) {
        assert!(
            self.pushed.is_empty(),
            "unbalanced stack pushes at block end: {} outstanding",
            self.pushed.len()
        );
    }
}

impl Default for StackHelper {
    fn default() -> Self {
        Self::new()
    }
}
