//! MOVS, STOS, LODS, CMPS and SCAS.
//!
//! Each handler is monomorphised on the address size. With a REP prefix one
//! element is processed per step; while the count is non-zero (and, for
//! CMPS/SCAS, the ZF condition holds) EIP is rewound to the first prefix so
//! the instruction restarts and interrupts can land between elements.

use crate::bus::Bus;
use crate::cpu::{Cpu, Insn, Rep};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::flags::FlagOp;
use crate::regs::{Width, EAX, ECX, EDI, ESI};
use crate::segment::SegReg;
use crate::timing::InstrClass;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>) {
    for op in [0xa4, 0xa5] {
        t.set_split(op, movs::<B, false>, movs::<B, true>);
    }
    for op in [0xaa, 0xab] {
        t.set_split(op, stos::<B, false>, stos::<B, true>);
    }
    for op in [0xac, 0xad] {
        t.set_split(op, lods::<B, false>, lods::<B, true>);
    }
    for op in [0xa6, 0xa7] {
        t.set_split(op, cmps::<B, false>, cmps::<B, true>);
    }
    for op in [0xae, 0xaf] {
        t.set_split(op, scas::<B, false>, scas::<B, true>);
    }
}

#[inline]
fn addr_width<const A32: bool>() -> Width {
    if A32 {
        Width::Dword
    } else {
        Width::Word
    }
}

fn elem_width(insn: &Insn) -> Width {
    if insn.opcode & 1 == 0 {
        Width::Byte
    } else {
        insn.width()
    }
}

fn index<B: Bus, const A32: bool>(cpu: &Cpu<B>, reg: u8) -> u32 {
    cpu.state.gprs.read(addr_width::<A32>(), reg)
}

/// Steps ESI/EDI by the element size in the DF direction.
fn advance<B: Bus, const A32: bool>(cpu: &mut Cpu<B>, reg: u8, width: Width) {
    let step = if cpu.state.flags.df() {
        width.bytes().wrapping_neg()
    } else {
        width.bytes()
    };
    let aw = addr_width::<A32>();
    let v = cpu.state.gprs.read(aw, reg).wrapping_add(step);
    cpu.state.gprs.write(aw, reg, v);
}

/// A REP with an exhausted count does nothing at all.
fn rep_exhausted<B: Bus, const A32: bool>(cpu: &Cpu<B>, insn: &Insn) -> bool {
    insn.rep.is_some() && index::<B, A32>(cpu, ECX) == 0
}

/// Decrements the count after one element and rewinds EIP when another
/// iteration is due. `compare` adds the REPE/REPNE ZF test.
fn repeat<B: Bus, const A32: bool>(cpu: &mut Cpu<B>, insn: &Insn, compare: bool) {
    let Some(rep) = insn.rep else {
        return;
    };
    let aw = addr_width::<A32>();
    let count = cpu.state.gprs.read(aw, ECX).wrapping_sub(1) & aw.mask();
    cpu.state.gprs.write(aw, ECX, count);
    let again = count != 0
        && (!compare
            || match rep {
                Rep::Repe => cpu.state.flags.zf(),
                Rep::Repne => !cpu.state.flags.zf(),
            });
    if again {
        cpu.state.eip = insn.start_eip;
    }
}

fn movs<B: Bus, const A32: bool>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    if rep_exhausted::<B, A32>(cpu, insn) {
        return cpu.finish(InstrClass::String, cpu.cyc(5, 5), Ok(()));
    }
    let width = elem_width(insn);
    let src = index::<B, A32>(cpu, ESI);
    let dst = index::<B, A32>(cpu, EDI);
    let v = cpu.read_mem(insn.data_seg(), src, width)?;
    let result = cpu.write_mem(SegReg::Es, dst, width, v);
    if result.is_ok() {
        advance::<B, A32>(cpu, ESI, width);
        advance::<B, A32>(cpu, EDI, width);
        repeat::<B, A32>(cpu, insn, false);
    }
    cpu.finish(InstrClass::String, cpu.cyc(7, 7), result)
}

fn stos<B: Bus, const A32: bool>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    if rep_exhausted::<B, A32>(cpu, insn) {
        return cpu.finish(InstrClass::String, cpu.cyc(5, 5), Ok(()));
    }
    let width = elem_width(insn);
    let dst = index::<B, A32>(cpu, EDI);
    let v = cpu.state.gprs.read(width, EAX);
    let result = cpu.write_mem(SegReg::Es, dst, width, v);
    if result.is_ok() {
        advance::<B, A32>(cpu, EDI, width);
        repeat::<B, A32>(cpu, insn, false);
    }
    cpu.finish(InstrClass::String, cpu.cyc(5, 4), result)
}

fn lods<B: Bus, const A32: bool>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    if rep_exhausted::<B, A32>(cpu, insn) {
        return cpu.finish(InstrClass::String, cpu.cyc(5, 5), Ok(()));
    }
    let width = elem_width(insn);
    let src = index::<B, A32>(cpu, ESI);
    let v = cpu.read_mem(insn.data_seg(), src, width)?;
    cpu.state.gprs.write(width, EAX, v);
    advance::<B, A32>(cpu, ESI, width);
    repeat::<B, A32>(cpu, insn, false);
    cpu.finish(InstrClass::String, cpu.cyc(5, 5), Ok(()))
}

fn record_compare<B: Bus>(cpu: &mut Cpu<B>, width: Width, a: u32, b: u32) {
    let mask = width.mask();
    let res = a.wrapping_sub(b) & mask;
    cpu.state.flags.record(FlagOp::Sub, width, a & mask, b & mask, res);
}

fn cmps<B: Bus, const A32: bool>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    if rep_exhausted::<B, A32>(cpu, insn) {
        return cpu.finish(InstrClass::String, cpu.cyc(5, 5), Ok(()));
    }
    let width = elem_width(insn);
    let src = index::<B, A32>(cpu, ESI);
    let dst = index::<B, A32>(cpu, EDI);
    let a = cpu.read_mem(insn.data_seg(), src, width)?;
    let b = cpu.read_mem(SegReg::Es, dst, width)?;
    record_compare(cpu, width, a, b);
    advance::<B, A32>(cpu, ESI, width);
    advance::<B, A32>(cpu, EDI, width);
    repeat::<B, A32>(cpu, insn, true);
    cpu.finish(InstrClass::String, cpu.cyc(8, 10), Ok(()))
}

fn scas<B: Bus, const A32: bool>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    if rep_exhausted::<B, A32>(cpu, insn) {
        return cpu.finish(InstrClass::String, cpu.cyc(5, 5), Ok(()));
    }
    let width = elem_width(insn);
    let dst = index::<B, A32>(cpu, EDI);
    let b = cpu.read_mem(SegReg::Es, dst, width)?;
    let a = cpu.state.gprs.read(width, EAX);
    record_compare(cpu, width, a, b);
    advance::<B, A32>(cpu, EDI, width);
    repeat::<B, A32>(cpu, insn, true);
    cpu.finish(InstrClass::String, cpu.cyc(6, 7), Ok(()))
}
