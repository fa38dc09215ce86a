//! MOV to and from control, debug and test registers (0F 20-26).
//!
//! These always operate on a 32-bit general register: the `mod` field of
//! the ModRM byte is ignored, so no displacement follows.

use crate::bus::Bus;
use crate::control::{Cr0, Cr4, DR6_BD};
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::timing::InstrClass;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>) {
    t.set(0x120, mov_from_cr::<B>);
    t.set(0x122, mov_to_cr::<B>);
    t.set(0x121, mov_from_dr::<B>);
    t.set(0x123, mov_to_dr::<B>);
    t.set(0x124, mov_from_tr::<B>);
    t.set(0x126, mov_to_tr::<B>);
}

/// Returns `(reg field, rm field)` of the register-only ModRM byte.
fn reg_operands<B: Bus>(cpu: &mut Cpu<B>) -> Result<(u8, u8), Fault> {
    let byte = cpu.fetch_u8()?;
    Ok(((byte >> 3) & 7, byte & 7))
}

/// Undefined control registers and CR4 on models without it.
fn check_cr_index<B: Bus>(cpu: &Cpu<B>, idx: u8) -> Result<(), Fault> {
    match idx {
        0 | 2 | 3 => Ok(()),
        4 if cpu.config.model.has_cr4() => Ok(()),
        _ => Err(Fault::InvalidOpcode),
    }
}

fn mov_from_cr<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let (cr, gpr) = reg_operands(cpu)?;
    check_cr_index(cpu, cr)?;
    cpu.require_cpl0()?;
    let value = match cr {
        0 => cpu.mmu.cr0(),
        2 => cpu.mmu.cr2(),
        3 => cpu.mmu.cr3(),
        _ => cpu.mmu.cr4(),
    };
    cpu.state.gprs.set(gpr, value);
    cpu.finish(InstrClass::System, cpu.cyc(4, 6), Ok(()))
}

fn mov_to_cr<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let (cr, gpr) = reg_operands(cpu)?;
    check_cr_index(cpu, cr)?;
    cpu.require_cpl0()?;
    let value = cpu.state.gprs.get(gpr);
    match cr {
        0 => write_cr0(cpu, value)?,
        2 => cpu.mmu.set_cr2(value),
        3 => {
            let kind = cpu.mmu.set_cr3(value);
            cpu.after_flush(Some(kind));
        }
        _ => {
            if value & !cpu.config.cr4_mask != 0 {
                tracing::debug!(value = format_args!("{value:#x}"), mask = format_args!("{:#x}", cpu.config.cr4_mask), "reserved CR4 bits");
                return Err(Fault::gp0());
            }
            let kind = cpu.mmu.set_cr4(value);
            cpu.after_flush(kind);
        }
    }
    cpu.finish(InstrClass::System, cpu.cyc(16, 10), Ok(()))
}

fn write_cr0<B: Bus>(cpu: &mut Cpu<B>, value: u32) -> Result<(), Fault> {
    let mut new = Cr0::from_bits_retain(value);
    if cpu.config.model.is_486_class() {
        new |= Cr0::ET;
    }
    if new.contains(Cr0::PG) && !new.contains(Cr0::PE) {
        return Err(Fault::gp0());
    }
    let old = cpu.cr0();
    let kind = cpu.mmu.set_cr0(new.bits());
    cpu.after_flush(kind);
    cpu.state.update_mode(new.contains(Cr0::PE));
    if old.contains(Cr0::PE) != new.contains(Cr0::PE) || old.contains(Cr0::PG) != new.contains(Cr0::PG) {
        tracing::debug!(old = ?old, new = ?new, mode = ?cpu.state.mode(), "CR0 mode switch");
    }
    Ok(())
}

fn cr4_de<B: Bus>(cpu: &Cpu<B>) -> bool {
    cpu.mmu.cr4() & Cr4::DE.bits() != 0
}

/// DR7.GD turns any debug-register access into #DB with DR6.BD set.
fn check_general_detect<B: Bus>(cpu: &mut Cpu<B>) -> Result<(), Fault> {
    if cpu.state.dr.general_detect() {
        cpu.state.dr.dr6 |= DR6_BD;
        return Err(Fault::Debug);
    }
    Ok(())
}

fn mov_from_dr<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let (dr, gpr) = reg_operands(cpu)?;
    cpu.require_cpl0()?;
    check_general_detect(cpu)?;
    let value = cpu.state.dr.read(dr, cr4_de(cpu))?;
    cpu.state.gprs.set(gpr, value);
    cpu.finish(InstrClass::System, cpu.cyc(10, 22), Ok(()))
}

fn mov_to_dr<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let (dr, gpr) = reg_operands(cpu)?;
    cpu.require_cpl0()?;
    check_general_detect(cpu)?;
    let value = cpu.state.gprs.get(gpr);
    let de = cr4_de(cpu);
    cpu.state.dr.write(dr, value, de)?;
    cpu.finish(InstrClass::System, cpu.cyc(11, 22), Ok(()))
}

fn require_test_regs<B: Bus>(cpu: &Cpu<B>) -> Result<(), Fault> {
    if cpu.config.model.has_test_registers() {
        Ok(())
    } else {
        Err(Fault::InvalidOpcode)
    }
}

fn mov_from_tr<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let (tr, gpr) = reg_operands(cpu)?;
    require_test_regs(cpu)?;
    cpu.require_cpl0()?;
    let is_486 = cpu.config.model.is_486_class();
    let value = cpu.state.test_regs.read(tr, is_486)?;
    cpu.state.gprs.set(gpr, value);
    cpu.finish(InstrClass::System, cpu.cyc(4, 12), Ok(()))
}

fn mov_to_tr<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let (tr, gpr) = reg_operands(cpu)?;
    require_test_regs(cpu)?;
    cpu.require_cpl0()?;
    let is_486 = cpu.config.model.is_486_class();
    let value = cpu.state.gprs.get(gpr);
    cpu.state.test_regs.write(tr, value, is_486)?;
    cpu.finish(InstrClass::System, cpu.cyc(4, 12), Ok(()))
}
