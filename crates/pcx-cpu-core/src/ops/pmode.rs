//! Protected-mode system instructions: ARPL, the 0F 00 / 0F 01 groups,
//! LAR/LSL and CLTS.

use crate::bus::Bus;
use crate::config::CpuConfig;
use crate::control::Cr0;
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::flags::FLAG_ZF;
use crate::modrm::ModRm;
use crate::regs::Width;
use crate::segment::{
    Descriptor, SegmentCache, TableReg, SYS_LDT, SYS_TSS16_AVAIL, SYS_TSS16_BUSY,
    SYS_TSS32_AVAIL, SYS_TSS32_BUSY,
};
use crate::state::CpuMode;
use crate::timing::InstrClass;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>, config: &CpuConfig) {
    t.set(0x63, arpl::<B>);
    t.set(0x100, group6::<B>);
    if config.model.has_invlpg() {
        t.set(0x101, group7::<B>);
    } else {
        t.set(0x101, group7_no_invlpg::<B>);
    }
    t.set(0x102, lar_lsl::<B>);
    t.set(0x103, lar_lsl::<B>);
    t.set(0x106, clts::<B>);
}

/// Real and V86 mode have no selectors to check.
fn require_protected<B: Bus>(cpu: &Cpu<B>) -> Result<(), Fault> {
    if cpu.state.mode() == CpuMode::Protected {
        Ok(())
    } else {
        Err(Fault::InvalidOpcode)
    }
}

/// Stores a selector or MSW. A register destination takes the full operand
/// size, memory always a word.
fn store_word<B: Bus>(cpu: &mut Cpu<B>, insn: &Insn, m: &ModRm, value: u32) -> Result<(), Fault> {
    let width = if m.is_reg() { insn.width() } else { Width::Word };
    cpu.write_rm(m, width, value)
}

fn arpl<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    require_protected(cpu)?;
    let m = cpu.modrm(insn)?;
    let dst = cpu.read_rm(&m, Width::Word)?;
    let src = cpu.state.gprs.read(Width::Word, m.reg);
    let adjust = dst & 3 < src & 3;
    let result = if adjust {
        cpu.write_rm(&m, Width::Word, (dst & !3) | (src & 3))
    } else {
        Ok(())
    };
    if result.is_ok() {
        cpu.state.flags.set(FLAG_ZF, adjust);
    }
    cpu.finish(InstrClass::System, cpu.cyc(9, 20), result)
}

/// 0F 00: SLDT, STR, LLDT, LTR, VERR, VERW.
fn group6<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    require_protected(cpu)?;
    let m = cpu.modrm(insn)?;
    match m.reg {
        0 => {
            let sel = cpu.state.ldtr.selector as u32;
            store_word(cpu, insn, &m, sel)?;
            cpu.finish(InstrClass::System, cpu.cyc(2, 2), Ok(()))
        }
        1 => {
            let sel = cpu.state.tr.selector as u32;
            store_word(cpu, insn, &m, sel)?;
            cpu.finish(InstrClass::System, cpu.cyc(2, 2), Ok(()))
        }
        2 => {
            cpu.require_cpl0()?;
            let sel = cpu.read_rm(&m, Width::Word)? as u16;
            lldt(cpu, sel)?;
            cpu.finish(InstrClass::System, cpu.cyc(11, 20), Ok(()))
        }
        3 => {
            cpu.require_cpl0()?;
            let sel = cpu.read_rm(&m, Width::Word)? as u16;
            ltr(cpu, sel)?;
            cpu.finish(InstrClass::System, cpu.cyc(20, 23), Ok(()))
        }
        4 | 5 => {
            let sel = cpu.read_rm(&m, Width::Word)? as u16;
            let ok = verify(cpu, sel, m.reg == 5)?;
            cpu.state.flags.set(FLAG_ZF, ok);
            cpu.finish(InstrClass::System, cpu.cyc(11, 10), Ok(()))
        }
        _ => Err(Fault::InvalidOpcode),
    }
}

/// System descriptors live in the GDT only.
fn read_gdt_descriptor<B: Bus>(cpu: &mut Cpu<B>, sel: u16) -> Result<Descriptor, Fault> {
    if sel & 4 != 0 {
        return Err(Fault::GeneralProtection(sel & 0xfffc));
    }
    cpu.read_descriptor(sel)
}

fn lldt<B: Bus>(cpu: &mut Cpu<B>, sel: u16) -> Result<(), Fault> {
    if sel & !3 == 0 {
        cpu.state.ldtr = SegmentCache::null(sel);
        return Ok(());
    }
    let err = sel & 0xfffc;
    let desc = read_gdt_descriptor(cpu, sel)?;
    if !desc.is_system() || desc.system_type() != SYS_LDT {
        return Err(Fault::GeneralProtection(err));
    }
    if !desc.present() {
        return Err(Fault::SegmentNotPresent(err));
    }
    cpu.state.ldtr = SegmentCache::from_descriptor(sel, desc);
    tracing::debug!(selector = format_args!("{sel:#06x}"), base = format_args!("{:#010x}", desc.base()), "LDT loaded");
    Ok(())
}

/// LTR marks the TSS descriptor busy in the GDT.
fn ltr<B: Bus>(cpu: &mut Cpu<B>, sel: u16) -> Result<(), Fault> {
    let err = sel & 0xfffc;
    if sel & !3 == 0 {
        return Err(Fault::gp0());
    }
    let desc = read_gdt_descriptor(cpu, sel)?;
    let busy = match (desc.is_system(), desc.system_type()) {
        (true, SYS_TSS16_AVAIL) => SYS_TSS16_BUSY,
        (true, SYS_TSS32_AVAIL) => SYS_TSS32_BUSY,
        _ => return Err(Fault::GeneralProtection(err)),
    };
    if !desc.present() {
        return Err(Fault::SegmentNotPresent(err));
    }
    let access = (desc.access() & !0xf) | busy;
    let addr = cpu.descriptor_addr(sel)?.wrapping_add(5);
    cpu.write_sys(addr, Width::Byte, access as u32)?;
    cpu.state.tr = SegmentCache {
        access,
        ..SegmentCache::from_descriptor(sel, desc)
    };
    Ok(())
}

/// Reads the descriptor for LAR/LSL/VERR/VERW. Selectors outside the table
/// report `None` rather than faulting.
fn fetch_descriptor<B: Bus>(cpu: &mut Cpu<B>, sel: u16) -> Result<Option<Descriptor>, Fault> {
    if sel & !3 == 0 {
        return Ok(None);
    }
    let Ok(addr) = cpu.descriptor_addr(sel) else {
        return Ok(None);
    };
    Ok(Some(Descriptor(cpu.read_sys_u64(addr)?)))
}

/// Privilege check shared by the probing instructions. Conforming code
/// segments are visible from any level.
fn visible<B: Bus>(cpu: &Cpu<B>, sel: u16, desc: Descriptor) -> bool {
    let cache = SegmentCache::from_descriptor(sel, desc);
    if cache.conforming() {
        return true;
    }
    let rpl = (sel & 3) as u8;
    desc.dpl() >= rpl.max(cpu.state.cpl())
}

fn verify<B: Bus>(cpu: &mut Cpu<B>, sel: u16, write: bool) -> Result<bool, Fault> {
    let Some(desc) = fetch_descriptor(cpu, sel)? else {
        return Ok(false);
    };
    if desc.is_system() || !visible(cpu, sel, desc) {
        return Ok(false);
    }
    let cache = SegmentCache::from_descriptor(sel, desc);
    Ok(if write { cache.writable() } else { cache.readable() })
}

fn lar_lsl<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    require_protected(cpu)?;
    let is_lsl = insn.opcode == 0x103;
    let width = insn.width();
    let m = cpu.modrm(insn)?;
    let sel = cpu.read_rm(&m, Width::Word)? as u16;
    let value = fetch_descriptor(cpu, sel)?.and_then(|desc| {
        let type_ok = if desc.is_system() {
            match desc.system_type() {
                1 | 2 | 3 | 9 | 11 => true,
                4 | 5 | 12 => !is_lsl,
                _ => false,
            }
        } else {
            true
        };
        if !type_ok || !visible(cpu, sel, desc) {
            return None;
        }
        Some(if is_lsl {
            desc.limit()
        } else {
            ((desc.0 >> 32) as u32) & 0x00ff_ff00
        })
    });
    match value {
        Some(v) => {
            cpu.state.gprs.write(width, m.reg, v);
            cpu.state.flags.set(FLAG_ZF, true);
        }
        None => cpu.state.flags.set(FLAG_ZF, false),
    }
    cpu.finish(InstrClass::System, cpu.cyc(11, 15), Ok(()))
}

fn group7_no_invlpg<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    group7_impl(cpu, insn, false)
}

fn group7<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    group7_impl(cpu, insn, true)
}

/// 0F 01: SGDT, SIDT, LGDT, LIDT, SMSW, LMSW, INVLPG.
fn group7_impl<B: Bus>(cpu: &mut Cpu<B>, insn: &Insn, has_invlpg: bool) -> Result<(), Fault> {
    let m = cpu.modrm(insn)?;
    match m.reg {
        0 | 1 => {
            let (seg, off) = Cpu::<B>::mem_operand(&m)?;
            let table = if m.reg == 0 { cpu.state.gdtr } else { cpu.state.idtr };
            let base = if insn.op32 { table.base } else { table.base & 0x00ff_ffff };
            cpu.write_mem(seg, off, Width::Word, table.limit as u32)?;
            cpu.write_mem(seg, off.wrapping_add(2), Width::Dword, base)?;
            cpu.finish(InstrClass::System, cpu.cyc(10, 9), Ok(()))
        }
        2 | 3 => {
            let (seg, off) = Cpu::<B>::mem_operand(&m)?;
            cpu.require_cpl0()?;
            let limit = cpu.read_mem(seg, off, Width::Word)? as u16;
            let base = cpu.read_mem(seg, off.wrapping_add(2), Width::Dword)?;
            let base = if insn.op32 { base } else { base & 0x00ff_ffff };
            let table = TableReg { base, limit };
            if m.reg == 2 {
                cpu.state.gdtr = table;
            } else {
                cpu.state.idtr = table;
            }
            tracing::debug!(which = if m.reg == 2 { "GDT" } else { "IDT" }, base = format_args!("{base:#010x}"), limit, "descriptor table loaded");
            cpu.finish(InstrClass::System, cpu.cyc(11, 11), Ok(()))
        }
        4 => {
            let msw = cpu.mmu.cr0();
            let value = if m.is_reg() { msw } else { msw & 0xffff };
            store_word(cpu, insn, &m, value)?;
            cpu.finish(InstrClass::System, cpu.cyc(2, 3), Ok(()))
        }
        6 => {
            cpu.require_cpl0()?;
            let v = cpu.read_rm(&m, Width::Word)?;
            lmsw(cpu, v);
            cpu.finish(InstrClass::System, cpu.cyc(13, 10), Ok(()))
        }
        7 if has_invlpg => {
            let (seg, off) = Cpu::<B>::mem_operand(&m)?;
            cpu.require_cpl0()?;
            let lin = cpu.state.seg(seg).base.wrapping_add(off);
            cpu.mmu.invlpg(lin);
            cpu.invalidate_fetch_window();
            cpu.finish(InstrClass::System, 12, Ok(()))
        }
        _ => Err(Fault::InvalidOpcode),
    }
}

/// LMSW loads PE/MP/EM/TS. PE can be set but never cleared.
fn lmsw<B: Bus>(cpu: &mut Cpu<B>, v: u32) {
    let old = cpu.mmu.cr0();
    let low = (v & 0xf) | (old & Cr0::PE.bits());
    let new = (old & !0xf) | low;
    let flush = cpu.mmu.set_cr0(new);
    cpu.after_flush(flush);
    cpu.state.update_mode(new & Cr0::PE.bits() != 0);
}

fn clts<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    cpu.require_cpl0()?;
    let cr0 = cpu.mmu.cr0() & !Cr0::TS.bits();
    let flush = cpu.mmu.set_cr0(cr0);
    cpu.after_flush(flush);
    cpu.finish(InstrClass::System, 5, Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PcBus;
    use crate::segment::SegReg;

    fn protected_cpu() -> Cpu<PcBus> {
        let mut cpu = Cpu::new(CpuConfig::default(), PcBus::new(1 << 20)).unwrap();
        // GDT at 0x800: null, ring-0 code, ring-3 data, LDT, 32-bit TSS.
        let gdt = [
            0u64,
            0x00cf_9a00_0000_ffff,
            0x00cf_f200_0000_ffff,
            0x0000_8200_2000_00ff,
            0x0000_8900_3000_0067,
        ];
        for (i, d) in gdt.iter().enumerate() {
            cpu.bus.load(0x800 + 8 * i as u64, &d.to_le_bytes());
        }
        cpu.state.gdtr = TableReg { base: 0x800, limit: 0x27 };
        cpu.mmu.set_cr0(cpu.mmu.cr0() | 1);
        let cs = cpu.read_descriptor(0x08).unwrap();
        *cpu.state.seg_mut(SegReg::Cs) = SegmentCache::from_descriptor(0x08, cs);
        cpu.state.update_mode(true);
        cpu
    }

    #[test]
    fn ltr_marks_tss_busy() {
        let mut cpu = protected_cpu();
        ltr(&mut cpu, 0x20).unwrap();
        assert_eq!(cpu.state.tr.base, 0x3000);
        assert_eq!(cpu.bus.ram()[0x800 + 0x20 + 5] & 0xf, SYS_TSS32_BUSY);
        // A busy TSS cannot be loaded again.
        assert_eq!(ltr(&mut cpu, 0x20), Err(Fault::GeneralProtection(0x20)));
    }

    #[test]
    fn lldt_rejects_non_ldt_descriptors() {
        let mut cpu = protected_cpu();
        lldt(&mut cpu, 0x18).unwrap();
        assert_eq!(cpu.state.ldtr.base, 0x2000);
        assert_eq!(lldt(&mut cpu, 0x10), Err(Fault::GeneralProtection(0x10)));
        lldt(&mut cpu, 0).unwrap();
        assert!(!cpu.state.ldtr.valid);
    }

    #[test]
    fn verify_checks_type_and_privilege() {
        let mut cpu = protected_cpu();
        assert_eq!(verify(&mut cpu, 0x13, true), Ok(true));
        assert_eq!(verify(&mut cpu, 0x08, true), Ok(false));
        assert_eq!(verify(&mut cpu, 0x08, false), Ok(true));
        assert_eq!(verify(&mut cpu, 0x40, false), Ok(false));
    }

    #[test]
    fn lmsw_cannot_clear_pe() {
        let mut cpu = protected_cpu();
        lmsw(&mut cpu, 0x8);
        assert_eq!(cpu.mmu.cr0() & 0xf, 0x9);
    }
}
