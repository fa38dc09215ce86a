//! Data movement: MOV in all its forms, LEA, XCHG, MOVZX/MOVSX and the far
//! pointer loads.

use crate::bus::Bus;
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::modrm::Operand;
use crate::regs::{Width, EAX};
use crate::segment::SegReg;
use crate::timing::InstrClass;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>) {
    t.set_range(0x88..=0x89, mov_rm_reg::<B>);
    t.set_range(0x8a..=0x8b, mov_reg_rm::<B>);
    t.set(0x8c, mov_rm_sreg::<B>);
    t.set(0x8e, mov_sreg_rm::<B>);
    t.set_range(0xa0..=0xa3, mov_moffs::<B>);
    t.set_range(0xb0..=0xbf, mov_reg_imm::<B>);
    t.set_range(0xc6..=0xc7, mov_rm_imm::<B>);
    t.set(0x8d, lea::<B>);
    t.set_range(0x86..=0x87, xchg_rm_reg::<B>);
    t.set_range(0x91..=0x97, xchg_acc::<B>);
    for op in [0x1b6, 0x1b7, 0x1be, 0x1bf] {
        t.set(op, movx::<B>);
    }
    t.set(0xc4, load_far_pointer::<B>);
    t.set(0xc5, load_far_pointer::<B>);
    for op in [0x1b2, 0x1b4, 0x1b5] {
        t.set(op, load_far_pointer::<B>);
    }
}

#[inline]
fn byte_or(insn: &Insn) -> Width {
    if insn.opcode & 1 == 0 {
        Width::Byte
    } else {
        insn.width()
    }
}

/// Completes a store to r/m. Memory stores use the `MovStore` policy.
fn store_rm<B: Bus>(cpu: &mut Cpu<B>, m: &crate::modrm::ModRm, width: Width, value: u32) -> Result<(), Fault> {
    if m.is_reg() {
        cpu.write_rm(m, width, value)?;
        return cpu.finish(InstrClass::MovLoad, 1, Ok(()));
    }
    let result = cpu.write_rm(m, width, value);
    let cycles = cpu.cyc(1, 2);
    cpu.finish(InstrClass::MovStore, cycles, result)
}

fn mov_rm_reg<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = byte_or(insn);
    let m = cpu.modrm(insn)?;
    let v = cpu.state.gprs.read(width, m.reg);
    store_rm(cpu, &m, width, v)
}

fn mov_reg_rm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = byte_or(insn);
    let m = cpu.modrm(insn)?;
    let v = cpu.read_rm(&m, width)?;
    cpu.state.gprs.write(width, m.reg, v);
    let cycles = if m.is_reg() { cpu.cyc(1, 2) } else { cpu.cyc(1, 4) };
    cpu.finish(InstrClass::MovLoad, cycles, Ok(()))
}

/// 8C: the register form zero-extends into a 32-bit destination.
fn mov_rm_sreg<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let m = cpu.modrm(insn)?;
    let seg = SegReg::from_index(m.reg).ok_or(Fault::InvalidOpcode)?;
    let sel = cpu.state.seg(seg).selector as u32;
    let width = if m.is_reg() { insn.width() } else { Width::Word };
    store_rm(cpu, &m, width, sel)
}

/// 8E: loading CS is undefined; loading SS holds off interrupts for one
/// instruction so SS:ESP can be switched as a pair.
fn mov_sreg_rm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let m = cpu.modrm(insn)?;
    let seg = match SegReg::from_index(m.reg) {
        Some(SegReg::Cs) | None => return Err(Fault::InvalidOpcode),
        Some(seg) => seg,
    };
    let sel = cpu.read_rm(&m, Width::Word)? as u16;
    let result = cpu.load_segment(seg, sel);
    if result.is_ok() && seg == SegReg::Ss {
        cpu.pending.inhibit_interrupts_for_one_instruction();
    }
    let cycles = if cpu.state.protected() { cpu.cyc(9, 18) } else { cpu.cyc(3, 2) };
    cpu.finish(InstrClass::SegmentLoad, cycles, result)
}

/// A0-A3: accumulator to/from an absolute offset.
fn mov_moffs<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = byte_or(insn);
    let off = cpu.fetch_imm(Width::from_op32(insn.addr32))?;
    let seg = insn.data_seg();
    if insn.opcode < 0xa2 {
        let v = cpu.read_mem(seg, off, width)?;
        cpu.state.gprs.write(width, EAX, v);
        cpu.finish(InstrClass::MovLoad, 1, Ok(()))
    } else {
        let v = cpu.state.gprs.read(width, EAX);
        let result = cpu.write_mem(seg, off, width, v);
        let cycles = cpu.cyc(1, 2);
        cpu.finish(InstrClass::MovStore, cycles, result)
    }
}

/// B0-B7 byte registers, B8-BF word/dword registers.
fn mov_reg_imm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = if insn.opcode < 0xb8 {
        Width::Byte
    } else {
        insn.width()
    };
    let v = cpu.fetch_imm(width)?;
    cpu.state.gprs.write(width, (insn.opcode & 7) as u8, v);
    cpu.finish(InstrClass::MovLoad, cpu.cyc(1, 2), Ok(()))
}

fn mov_rm_imm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = byte_or(insn);
    let m = cpu.modrm(insn)?;
    if m.reg != 0 {
        return Err(Fault::InvalidOpcode);
    }
    let v = cpu.fetch_imm(width)?;
    store_rm(cpu, &m, width, v)
}

fn lea<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let m = cpu.modrm(insn)?;
    let (_, off) = Cpu::<B>::mem_operand(&m)?;
    cpu.state.gprs.write(insn.width(), m.reg, off);
    cpu.finish(InstrClass::Alu, cpu.cyc(1, 2), Ok(()))
}

/// 86/87: memory exchanges commit the register only after the store.
fn xchg_rm_reg<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = byte_or(insn);
    let m = cpu.modrm(insn)?;
    let mem = cpu.read_rm(&m, width)?;
    let reg = cpu.state.gprs.read(width, m.reg);
    let result = cpu.write_rm(&m, width, reg);
    if result.is_ok() {
        cpu.state.gprs.write(width, m.reg, mem);
    }
    let (class, cycles) = if m.is_reg() {
        (InstrClass::Alu, 3)
    } else {
        (InstrClass::MovStore, cpu.cyc(5, 5))
    };
    cpu.finish(class, cycles, result)
}

fn xchg_acc<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let reg = (insn.opcode & 7) as u8;
    let a = cpu.state.gprs.read(width, EAX);
    let b = cpu.state.gprs.read(width, reg);
    cpu.state.gprs.write(width, EAX, b);
    cpu.state.gprs.write(width, reg, a);
    cpu.finish(InstrClass::Alu, 3, Ok(()))
}

/// 0F B6/B7 MOVZX, 0F BE/BF MOVSX.
fn movx<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let src_width = if insn.opcode & 1 == 0 {
        Width::Byte
    } else {
        Width::Word
    };
    let m = cpu.modrm(insn)?;
    let v = cpu.read_rm(&m, src_width)?;
    let v = if insn.opcode >= 0x1be {
        src_width.sign_extend(v)
    } else {
        v
    };
    cpu.state.gprs.write(insn.width(), m.reg, v);
    cpu.finish(InstrClass::MovLoad, 3, Ok(()))
}

/// LES/LDS (C4/C5) and LSS/LFS/LGS (0F B2/B4/B5).
fn load_far_pointer<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let seg = match insn.opcode {
        0xc4 => SegReg::Es,
        0xc5 => SegReg::Ds,
        0x1b2 => SegReg::Ss,
        0x1b4 => SegReg::Fs,
        _ => SegReg::Gs,
    };
    let width = insn.width();
    let m = cpu.modrm(insn)?;
    let (mseg, off) = match m.operand {
        Operand::Mem { seg, off } => (seg, off),
        Operand::Reg(_) => return Err(Fault::InvalidOpcode),
    };
    let offset = cpu.read_mem(mseg, off, width)?;
    let sel = cpu.read_mem(mseg, off.wrapping_add(width.bytes()), Width::Word)? as u16;
    let result = cpu.load_segment(seg, sel);
    if result.is_ok() {
        cpu.state.gprs.write(width, m.reg, offset);
    }
    let cycles = if cpu.state.protected() { cpu.cyc(12, 22) } else { cpu.cyc(6, 7) };
    cpu.finish(InstrClass::SegmentLoad, cycles, result)
}
