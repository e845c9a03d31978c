//! Memory bridge: emulated address spaces to host accesses.
//!
//! Every access is classified as peripheral (slow path: native call
//! into the peripheral collaborator), bridged (data-space address
//! aliasing into program memory) or plain (direct pointer arithmetic
//! off a backing-array base). Classification happens at compile time
//! for statically known operands and as emitted compare-and-branch code
//! for dynamic ones. An access whose space selector decodes to the
//! reserved space emits nothing at all.

use d56jit_core::memory::{self, is_peripheral, PERIPH_FIRST};
use d56jit_core::{JitConfig, MemArea, Memory, Peripherals};

use crate::code_buffer::CodeBuffer;
use crate::stack::StackHelper;
use crate::x86_64::emitter as emit;
use crate::x86_64::emitter::{ArithOp, Cond};
use crate::x86_64::regs::{Gp, HostReg, CALL_ARG_GPS, SCRATCH};

/// Call context reachable from generated code: thin pointer handed to
/// the shims, holding the fat references internally. The dispatcher
/// materializes one per execution and publishes its address through a
/// runtime-data cell, so compiled code never embeds a transient
/// address.
pub struct NativeCtx {
    pub mem: *mut Memory,
    pub periph: *mut dyn Peripherals,
}

impl NativeCtx {
    pub fn new(mem: &mut Memory, periph: &mut dyn Peripherals) -> Self {
        Self {
            mem: mem as *mut Memory,
            // The field type elides to `dyn Peripherals + 'static`; the
            // reference is shorter-lived. The pointer is only used for
            // the duration guaranteed by the shims' safety contract, so
            // erase the lifetime into the raw fat pointer.
            periph: unsafe {
                std::mem::transmute::<&mut dyn Peripherals, *mut dyn Peripherals>(periph)
            },
        }
    }
}

/// Slow-path word read called from generated code.
///
/// # Safety
/// `ctx` must point to a live `NativeCtx` whose references are valid
/// for the duration of the call.
pub unsafe extern "C" fn mem_read_shim(ctx: *mut NativeCtx, area: u32, addr: u32) -> u32 {
    let ctx = &mut *ctx;
    match MemArea::from_space_code(area) {
        Some(area) => memory::read_word(&*ctx.mem, &mut *ctx.periph, area, addr),
        None => 0,
    }
}

/// Slow-path word write called from generated code.
///
/// # Safety
/// See [`mem_read_shim`].
pub unsafe extern "C" fn mem_write_shim(ctx: *mut NativeCtx, area: u32, addr: u32, value: u32) {
    let ctx = &mut *ctx;
    if let Some(area) = MemArea::from_space_code(area) {
        memory::write_word(&mut *ctx.mem, &mut *ctx.periph, area, addr, value);
    }
}

/// Compile-time snapshot of everything address classification and
/// pointer-arithmetic emission need.
#[derive(Debug, Clone, Copy)]
pub struct MemParams {
    x_base: u64,
    y_base: u64,
    p_base: u64,
    mem_size: u32,
    bridged_start: u32,
    /// Address of the cell holding the current `*mut NativeCtx`.
    ctx_cell: u64,
}

impl MemParams {
    pub fn new(mem: &Memory, ctx_cell: u64) -> Self {
        Self {
            x_base: mem.area_base_ptr(MemArea::X) as u64,
            y_base: mem.area_base_ptr(MemArea::Y) as u64,
            p_base: mem.area_base_ptr(MemArea::P) as u64,
            mem_size: mem.size() as u32,
            bridged_start: mem.bridged_start(),
            ctx_cell,
        }
    }

    fn area_base(&self, area: MemArea) -> u64 {
        match area {
            MemArea::X => self.x_base,
            MemArea::Y => self.y_base,
            MemArea::P => self.p_base,
        }
    }

    fn has_bridge(&self, area: MemArea) -> bool {
        area != MemArea::P && self.bridged_start < self.mem_size
    }
}

/// One argument of a native call, marshalled by `emit_call_args`.
#[derive(Debug, Clone, Copy)]
pub enum CallArg {
    Imm(u64),
    /// 32-bit register value.
    Reg(Gp),
    /// 64-bit value loaded from an absolute cell address.
    Cell(u64),
}

/// Move arguments into the convention's registers without clobbering a
/// still-needed source: register-register moves run as a parallel move
/// (cycles broken through the scratch register), immediates and cell
/// loads follow once every register source is consumed.
pub fn emit_call_args(buf: &mut CodeBuffer, args: &[CallArg]) {
    assert!(args.len() <= CALL_ARG_GPS.len());

    let mut reg_moves: Vec<(Gp, Gp)> = Vec::new();
    let mut rest: Vec<(Gp, CallArg)> = Vec::new();
    for (i, &arg) in args.iter().enumerate() {
        let dst = CALL_ARG_GPS[i];
        match arg {
            CallArg::Reg(src) if src != dst => reg_moves.push((dst, src)),
            CallArg::Reg(_) => {}
            other => rest.push((dst, other)),
        }
    }

    while !reg_moves.is_empty() {
        // A move is safe when no pending move still reads its target.
        if let Some(pos) = reg_moves
            .iter()
            .position(|&(dst, _)| reg_moves.iter().all(|&(_, src)| src != dst))
        {
            let (dst, src) = reg_moves.swap_remove(pos);
            emit::mov_rr(buf, false, dst, src);
        } else {
            // Every pending target is also a pending source: a cycle.
            // Rotate one value through the scratch register.
            let (dst, src) = reg_moves[0];
            emit::mov_rr(buf, false, SCRATCH, src);
            reg_moves[0] = (dst, SCRATCH);
        }
    }

    for (dst, arg) in rest {
        match arg {
            CallArg::Imm(v) => emit::mov_ri(buf, true, dst, v),
            CallArg::Cell(cell) => {
                emit::mov_ri(buf, true, SCRATCH, cell);
                emit::load64(buf, dst, SCRATCH, 0);
            }
            CallArg::Reg(_) => unreachable!(),
        }
    }
}

/// Emit a wrapped native call to `target` with `args`, the volatile
/// working set saved around it. `result_to` receives the return value
/// and is excluded from the save set.
pub fn emit_native_call(
    buf: &mut CodeBuffer,
    stack: &mut StackHelper,
    target: u64,
    args: &[CallArg],
    result_to: Option<Gp>,
) {
    let exclude: Vec<HostReg> = result_to.map(|r| r.into()).into_iter().collect();
    let mark = stack.push_volatiles(buf, &exclude);
    stack.call(buf, |buf| {
        emit_call_args(buf, args);
        emit::mov_ri(buf, true, SCRATCH, target);
        emit::call_reg(buf, SCRATCH);
        if let Some(dst) = result_to {
            if dst != Gp::Rax {
                emit::mov_rr(buf, false, dst, Gp::Rax);
            }
        }
    });
    stack.restore(buf, mark);
}

fn slow_read(buf: &mut CodeBuffer, stack: &mut StackHelper, p: &MemParams, dst: Gp, area: MemArea, addr: CallArg) {
    emit_native_call(
        buf,
        stack,
        mem_read_shim as usize as u64,
        &[CallArg::Cell(p.ctx_cell), CallArg::Imm(area as u64), addr],
        Some(dst),
    );
}

fn slow_write(buf: &mut CodeBuffer, stack: &mut StackHelper, p: &MemParams, area: MemArea, addr: CallArg, value: CallArg) {
    emit_native_call(
        buf,
        stack,
        mem_write_shim as usize as u64,
        &[CallArg::Cell(p.ctx_cell), CallArg::Imm(area as u64), addr, value],
        None,
    );
}

/// Read a word at a statically known address into `dst`.
pub fn read_static(
    buf: &mut CodeBuffer,
    stack: &mut StackHelper,
    p: &MemParams,
    dst: Gp,
    area: Option<MemArea>,
    addr: u32,
) {
    let Some(area) = area else {
        // Reserved space selector: no transfer.
        return;
    };
    if is_peripheral(area, addr) {
        slow_read(buf, stack, p, dst, area, CallArg::Imm(addr as u64));
        return;
    }
    let area = if area != MemArea::P && addr >= p.bridged_start {
        MemArea::P
    } else {
        area
    };
    emit::mov_ri(buf, true, SCRATCH, p.area_base(area) + 4 * addr as u64);
    emit::load32(buf, dst, SCRATCH, 0);
}

/// Write `src` to a statically known address.
pub fn write_static(
    buf: &mut CodeBuffer,
    stack: &mut StackHelper,
    p: &MemParams,
    config: &JitConfig,
    area: Option<MemArea>,
    addr: u32,
    src: Gp,
) {
    let Some(area) = area else {
        return;
    };
    if is_peripheral(area, addr) || config.memory_writes_call_native {
        slow_write(buf, stack, p, area, CallArg::Imm(addr as u64), CallArg::Reg(src));
        return;
    }
    let area = if area != MemArea::P && addr >= p.bridged_start {
        MemArea::P
    } else {
        area
    };
    emit::mov_ri(buf, true, SCRATCH, p.area_base(area) + 4 * addr as u64);
    emit::store32(buf, SCRATCH, 0, src);
}

/// Select the backing-array base for a dynamic address: the area's own
/// array, or program memory once the address crosses the bridge
/// boundary. Leaves the base in the scratch register.
fn dynamic_base(buf: &mut CodeBuffer, p: &MemParams, area: MemArea, addr: Gp) {
    emit::mov_ri(buf, true, SCRATCH, p.area_base(area));
    if p.has_bridge(area) {
        emit::arith_ri(buf, ArithOp::Cmp, false, addr, p.bridged_start as i32);
        let skip = emit::jcc_forward(buf, Cond::Below);
        emit::mov_ri(buf, true, SCRATCH, p.p_base);
        emit::bind_forward(buf, skip);
    }
}

/// Read a word at a runtime address in `addr` into `dst`.
///
/// With dynamic peripheral addressing enabled this emits the
/// classify-then-branch sequence; otherwise dynamic addresses are
/// assumed to stay out of the peripheral window.
pub fn read_dynamic(
    buf: &mut CodeBuffer,
    stack: &mut StackHelper,
    p: &MemParams,
    config: &JitConfig,
    dst: Gp,
    area: Option<MemArea>,
    addr: Gp,
) {
    let Some(area) = area else {
        return;
    };

    let mut done = None;
    if config.dynamic_peripheral_addressing && area != MemArea::P {
        emit::arith_ri(buf, ArithOp::Cmp, false, addr, PERIPH_FIRST as i32);
        let fast = emit::jcc_forward(buf, Cond::Below);
        slow_read(buf, stack, p, dst, area, CallArg::Reg(addr));
        done = Some(emit::jmp_forward(buf));
        emit::bind_forward(buf, fast);
    }

    dynamic_base(buf, p, area, addr);
    emit::load32_idx(buf, dst, SCRATCH, addr, 0);

    if let Some(done) = done {
        emit::bind_forward(buf, done);
    }
}

/// Write `src` to a runtime address in `addr`.
pub fn write_dynamic(
    buf: &mut CodeBuffer,
    stack: &mut StackHelper,
    p: &MemParams,
    config: &JitConfig,
    area: Option<MemArea>,
    addr: Gp,
    src: Gp,
) {
    let Some(area) = area else {
        return;
    };

    if config.memory_writes_call_native {
        slow_write(buf, stack, p, area, CallArg::Reg(addr), CallArg::Reg(src));
        return;
    }

    let mut done = None;
    if config.dynamic_peripheral_addressing && area != MemArea::P {
        emit::arith_ri(buf, ArithOp::Cmp, false, addr, PERIPH_FIRST as i32);
        let fast = emit::jcc_forward(buf, Cond::Below);
        slow_write(buf, stack, p, area, CallArg::Reg(addr), CallArg::Reg(src));
        done = Some(emit::jmp_forward(buf));
        emit::bind_forward(buf, fast);
    }

    dynamic_base(buf, p, area, addr);
    emit::store32_idx(buf, SCRATCH, addr, 0, src);

    if let Some(done) = done {
        emit::bind_forward(buf, done);
    }
}
