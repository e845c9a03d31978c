//! Shared entry/exit stubs.
//!
//! One prologue/epilogue pair is emitted at engine initialization;
//! every compiled block runs between them. The prologue saves the
//! callee-saved registers, loads the state base register from the first
//! argument and tail-jumps into the block whose code pointer arrives as
//! the second argument; blocks finish by jumping to the shared epilogue.

use crate::code_buffer::CodeBuffer;
use crate::x86_64::emitter as emit;
use crate::x86_64::regs::{CALLEE_SAVED_GPS, CALL_ARG_GPS, STATE_BASE};

/// Bytes subtracted after the pushes so block entry sees a 16-byte
/// aligned stack (return address plus an even number of pushes).
const FRAME_PAD: u32 = 8;

#[cfg(windows)]
const XMM_SAVE_BYTES: u32 = 160; // xmm6-xmm15

/// Offsets of the stubs inside the code buffer.
#[derive(Debug, Clone, Copy)]
pub struct EngineStubs {
    /// Entry point: `extern "C" fn(*mut DspState, *const u8)`.
    pub entry_offset: usize,
    /// Where blocks jump to return to the host.
    pub epilogue_offset: usize,
    /// First byte after the stubs; block code starts here.
    pub code_start: usize,
}

/// Emit prologue and epilogue at the buffer's current position.
pub fn emit_stubs(buf: &mut CodeBuffer) -> EngineStubs {
    let entry_offset = buf.offset();

    for &reg in CALLEE_SAVED_GPS.iter() {
        emit::push(buf, reg);
    }
    #[cfg(windows)]
    {
        use crate::x86_64::regs::{Gp, Xmm};
        emit::sub_rsp(buf, XMM_SAVE_BYTES);
        for i in 0..10u8 {
            emit::movdqu_store(buf, Gp::Rsp, (16 * i) as i32, Xmm::from_index(6 + i));
        }
    }

    // State base from the first argument, then into the block.
    emit::mov_rr(buf, true, STATE_BASE, CALL_ARG_GPS[0]);
    emit::sub_rsp(buf, FRAME_PAD);
    emit::jmp_reg(buf, CALL_ARG_GPS[1]);

    let epilogue_offset = buf.offset();
    emit::add_rsp(buf, FRAME_PAD);
    #[cfg(windows)]
    {
        use crate::x86_64::regs::{Gp, Xmm};
        for i in 0..10u8 {
            emit::movdqu_load(buf, Xmm::from_index(6 + i), Gp::Rsp, (16 * i) as i32);
        }
        emit::add_rsp(buf, XMM_SAVE_BYTES);
    }
    for &reg in CALLEE_SAVED_GPS.iter().rev() {
        emit::pop(buf, reg);
    }
    emit::ret(buf);

    EngineStubs {
        entry_offset,
        epilogue_offset,
        code_start: buf.offset(),
    }
}

/// Call into a compiled block through the shared prologue.
///
/// # Safety
/// `state` must point to a valid `DspState` and `code` to a finalized
/// block inside the same buffer the stubs were emitted into.
pub unsafe fn enter(buf: &CodeBuffer, stubs: EngineStubs, state: *mut u8, code: *const u8) {
    let entry: unsafe extern "C" fn(*mut u8, *const u8) =
        std::mem::transmute(buf.ptr_at(stubs.entry_offset));
    entry(state, code);
}
