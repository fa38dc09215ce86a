//! Instruction handlers, grouped by the kind of state they touch.
//!
//! Every handler follows the same shape: decode the ModRM operand, run the
//! privilege checks, read, compute, write, then record flags and charge
//! cycles through [`Cpu::finish`]. A fault returned with `?` before the
//! final write leaves registers and memory untouched.

use crate::bus::Bus;
use crate::config::{CpuConfig, Features};
use crate::dispatch::DispatchTable;

mod arith;
mod bits;
mod branch;
mod ctrl_regs;
mod cyrix;
mod io;
mod misc;
mod mmx;
mod mov;
mod pmode;
mod shift;
mod sse;
mod stack;
mod string;
mod x87;

pub(crate) fn register<B: Bus>(t: &mut DispatchTable<B>, config: &CpuConfig) {
    arith::register(t, config);
    shift::register(t);
    bits::register(t);
    mov::register(t);
    stack::register(t);
    branch::register(t);
    misc::register(t, config);
    pmode::register(t, config);
    ctrl_regs::register(t);
    io::register(t);
    string::register(t);
    // Escape opcodes exist without a coprocessor: they raise #NM so the
    // guest can emulate them.
    x87::register(t);
    if config.has(Features::MMX) {
        mmx::register(t);
    }
    if config.has(Features::SSE) {
        sse::register(t);
    }
    if config.has(Features::CYRIX_SMM) {
        cyrix::register(t);
    }
}
