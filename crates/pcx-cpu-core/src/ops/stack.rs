//! PUSH/POP of registers, immediates, segments and flags; PUSHA/POPA and
//! LEAVE.

use crate::bus::Bus;
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::flags::{FLAG_RF, FLAG_VM};
use crate::regs::{Width, EBP, ESP};
use crate::segment::SegReg;
use crate::state::CpuMode;
use crate::timing::InstrClass;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>) {
    t.set_range(0x50..=0x57, push_reg::<B>);
    t.set_range(0x58..=0x5f, pop_reg::<B>);
    t.set(0x68, push_imm::<B>);
    t.set(0x6a, push_imm::<B>);
    t.set(0x8f, pop_rm::<B>);
    for op in [0x06, 0x0e, 0x16, 0x1e, 0x1a0, 0x1a8] {
        t.set(op, push_sreg::<B>);
    }
    for op in [0x07, 0x17, 0x1f, 0x1a1, 0x1a9] {
        t.set(op, pop_sreg::<B>);
    }
    t.set(0x9c, pushf::<B>);
    t.set(0x9d, popf::<B>);
    t.set(0x60, pusha::<B>);
    t.set(0x61, popa::<B>);
    t.set(0xc9, leave::<B>);
}

fn sreg_for(opcode: u16) -> SegReg {
    match opcode {
        0x06 | 0x07 => SegReg::Es,
        0x0e => SegReg::Cs,
        0x16 | 0x17 => SegReg::Ss,
        0x1e | 0x1f => SegReg::Ds,
        0x1a0 | 0x1a1 => SegReg::Fs,
        _ => SegReg::Gs,
    }
}

fn push_reg<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let v = cpu.state.gprs.read(width, (insn.opcode & 7) as u8);
    let result = cpu.push(width, v);
    cpu.finish(InstrClass::Stack, cpu.cyc(1, 2), result)
}

/// POP ESP loads the popped value, not the incremented pointer.
fn pop_reg<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let v = cpu.pop(width)?;
    cpu.state.gprs.write(width, (insn.opcode & 7) as u8, v);
    cpu.finish(InstrClass::Stack, cpu.cyc(1, 4), Ok(()))
}

fn push_imm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let v = if insn.opcode == 0x6a {
        cpu.fetch_simm8()?
    } else {
        cpu.fetch_imm(width)?
    };
    let result = cpu.push(width, v);
    cpu.finish(InstrClass::Stack, cpu.cyc(1, 2), result)
}

/// 8F /0: the destination address is formed with ESP already advanced, so
/// `POP [ESP]` stores into the slot above the one popped. A faulting store
/// puts ESP back.
fn pop_rm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let v = cpu.peek(0, width)?;
    let old_esp = cpu.state.gprs.get(ESP);
    cpu.drop_stack(width.bytes());
    let stored = cpu.modrm(insn).and_then(|m| {
        if m.reg != 0 {
            return Err(Fault::InvalidOpcode);
        }
        cpu.write_rm(&m, width, v)?;
        Ok(m.is_reg())
    });
    let is_reg = match stored {
        Ok(is_reg) => is_reg,
        Err(fault) => {
            cpu.state.gprs.set(ESP, old_esp);
            return Err(fault);
        }
    };
    let cycles = if is_reg { cpu.cyc(4, 4) } else { cpu.cyc(6, 5) };
    cpu.finish(InstrClass::Stack, cycles, Ok(()))
}

fn push_sreg<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let sel = cpu.state.seg(sreg_for(insn.opcode)).selector as u32;
    let result = cpu.push(insn.width(), sel);
    cpu.finish(InstrClass::Stack, cpu.cyc(3, 2), result)
}

/// POP SS arms the one-instruction interrupt shadow like MOV SS.
fn pop_sreg<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let seg = sreg_for(insn.opcode);
    let width = insn.width();
    let sel = cpu.peek(0, width)? as u16;
    cpu.load_segment(seg, sel)?;
    cpu.drop_stack(width.bytes());
    if seg == SegReg::Ss {
        cpu.pending.inhibit_interrupts_for_one_instruction();
    }
    let cycles = if cpu.state.protected() { cpu.cyc(9, 21) } else { cpu.cyc(3, 7) };
    cpu.finish(InstrClass::SegmentLoad, cycles, Ok(()))
}

/// PUSHF: IOPL-sensitive in V86 mode. The 32-bit image never shows VM or RF.
fn pushf<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    if cpu.state.mode() == CpuMode::Vm86 && cpu.state.flags.iopl() < 3 {
        return Err(Fault::gp0());
    }
    let width = insn.width();
    let v = cpu.state.flags.eflags() & !(FLAG_VM | FLAG_RF);
    let result = cpu.push(width, v);
    cpu.finish(InstrClass::Stack, cpu.cyc(3, 4), result)
}

fn popf<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    if cpu.state.mode() == CpuMode::Vm86 && cpu.state.flags.iopl() < 3 {
        return Err(Fault::gp0());
    }
    let width = insn.width();
    let v = cpu.pop(width)?;
    let merged = cpu.merge_popped_flags(v, width);
    cpu.state.flags.set_eflags(merged);
    cpu.finish(InstrClass::Stack, cpu.cyc(9, 5), Ok(()))
}

/// PUSHA: the whole frame is written before ESP moves.
fn pusha<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let size = width.bytes();
    let regs = cpu.state.gprs;
    let esp = regs.get(ESP);
    let mask = if cpu.state.stack32() { u32::MAX } else { 0xffff };
    for idx in 0..8u8 {
        let off = esp.wrapping_sub(size * (idx as u32 + 1)) & mask;
        cpu.write_mem(SegReg::Ss, off, width, regs.read(width, idx))?;
    }
    cpu.set_esp(esp.wrapping_sub(8 * size) & mask);
    cpu.finish(InstrClass::Stack, cpu.cyc(11, 18), Ok(()))
}

/// POPA: the stored ESP slot is skipped.
fn popa<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let size = width.bytes();
    let mut values = [0u32; 8];
    for (i, slot) in values.iter_mut().enumerate() {
        *slot = cpu.peek(size * i as u32, width)?;
    }
    for (i, v) in values.iter().enumerate() {
        let idx = 7 - i as u8;
        if idx != ESP {
            cpu.state.gprs.write(width, idx, *v);
        }
    }
    cpu.drop_stack(8 * size);
    cpu.finish(InstrClass::Stack, cpu.cyc(9, 24), Ok(()))
}

/// LEAVE: ESP = EBP, then pop EBP.
fn leave<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let frame = cpu.state.gprs.get(EBP);
    let saved_esp = cpu.state.gprs.get(ESP);
    cpu.set_esp(frame);
    match cpu.pop(width) {
        Ok(v) => cpu.state.gprs.write(width, EBP, v),
        Err(fault) => {
            cpu.state.gprs.set(ESP, saved_esp);
            return Err(fault);
        }
    }
    cpu.finish(InstrClass::Stack, cpu.cyc(5, 4), Ok(()))
}
