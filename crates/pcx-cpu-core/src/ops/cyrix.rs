//! Cyrix SMM instructions: SMINT, RSM and the descriptor-cache save/restore
//! family.

use crate::bus::Bus;
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::segment::{SegReg, SegmentCache};
use crate::smm::{CCR1_SMAC, CCR1_USE_SMI};
use crate::timing::InstrClass;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>) {
    t.set(0x138, smint::<B>);
    t.set(0x1aa, rsm::<B>);
    t.set(0x178, svdc::<B>);
    t.set(0x179, rsdc::<B>);
    t.set(0x17a, svldt::<B>);
    t.set(0x17b, rsldt::<B>);
    t.set(0x17c, svts::<B>);
    t.set(0x17d, rsts::<B>);
}

fn smint<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let ccr1 = cpu.smm.ccr1();
    let enabled = ccr1 & CCR1_USE_SMI != 0 && ccr1 & CCR1_SMAC != 0;
    if !enabled || cpu.state.cpl() != 0 {
        return Err(Fault::InvalidOpcode);
    }
    cpu.enter_smm();
    cpu.finish(InstrClass::Smm, cpu.cyc(24, 24), Ok(()))
}

fn rsm<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    if !cpu.smm.in_smm() {
        return Err(Fault::InvalidOpcode);
    }
    cpu.leave_smm();
    cpu.finish(InstrClass::Smm, cpu.cyc(76, 76), Ok(()))
}

fn require_smm<B: Bus>(cpu: &Cpu<B>) -> Result<(), Fault> {
    if cpu.smm_instructions_allowed() {
        Ok(())
    } else {
        Err(Fault::InvalidOpcode)
    }
}

/// Decodes the m80 operand; `reg` is returned for SVDC/RSDC.
fn operand<B: Bus>(cpu: &mut Cpu<B>, insn: &Insn) -> Result<(u8, SegReg, u32), Fault> {
    require_smm(cpu)?;
    let m = cpu.modrm(insn)?;
    let (seg, off) = Cpu::<B>::mem_operand(&m)?;
    Ok((m.reg, seg, off))
}

fn svdc<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let (reg, seg, off) = operand(cpu, insn)?;
    let sreg = SegReg::from_index(reg).ok_or(Fault::InvalidOpcode)?;
    let cache = *cpu.state.seg(sreg);
    cpu.store_segment_image(cache, seg, off)?;
    cpu.finish(InstrClass::Smm, cpu.cyc(18, 18), Ok(()))
}

fn rsdc<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let (reg, seg, off) = operand(cpu, insn)?;
    let sreg = match SegReg::from_index(reg) {
        Some(SegReg::Cs) | None => return Err(Fault::InvalidOpcode),
        Some(s) => s,
    };
    let cache = cpu.load_segment_image(seg, off)?;
    *cpu.state.seg_mut(sreg) = cache;
    if sreg == SegReg::Ss {
        // The stored DPL becomes the new CPL in protected mode.
        let dpl = cache.dpl();
        if cpu.state.protected() && !cpu.state.flags.vm() {
            cpu.state.set_cpl(dpl);
        }
    }
    cpu.finish(InstrClass::Smm, cpu.cyc(24, 24), Ok(()))
}

fn save_system<B: Bus>(
    cpu: &mut Cpu<B>,
    insn: &Insn,
    cache: impl Fn(&Cpu<B>) -> SegmentCache,
) -> Result<(), Fault> {
    let (_, seg, off) = operand(cpu, insn)?;
    let image = cache(cpu);
    cpu.store_segment_image(image, seg, off)?;
    cpu.finish(InstrClass::Smm, cpu.cyc(18, 18), Ok(()))
}

fn svldt<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    save_system(cpu, insn, |cpu| cpu.state.ldtr)
}

fn svts<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    save_system(cpu, insn, |cpu| cpu.state.tr)
}

fn rsldt<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let (_, seg, off) = operand(cpu, insn)?;
    cpu.state.ldtr = cpu.load_segment_image(seg, off)?;
    cpu.finish(InstrClass::Smm, cpu.cyc(24, 24), Ok(()))
}

fn rsts<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let (_, seg, off) = operand(cpu, insn)?;
    cpu.state.tr = cpu.load_segment_image(seg, off)?;
    cpu.finish(InstrClass::Smm, cpu.cyc(24, 24), Ok(()))
}
