//! IN/OUT with the TSS I/O permission bitmap.

use crate::bus::Bus;
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::regs::{Width, EAX, EDX};
use crate::segment::{SYS_TSS32_AVAIL, SYS_TSS32_BUSY};
use crate::state::CpuMode;
use crate::timing::InstrClass;

/// Offset of the I/O map base field in a 32-bit TSS.
const TSS_IOMAP_BASE: u32 = 0x66;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>) {
    t.set_range(0xe4..=0xe5, in_imm::<B>);
    t.set_range(0xe6..=0xe7, out_imm::<B>);
    t.set_range(0xec..=0xed, in_dx::<B>);
    t.set_range(0xee..=0xef, out_dx::<B>);
}

fn io_width(insn: &Insn) -> Width {
    if insn.opcode & 1 == 0 {
        Width::Byte
    } else {
        insn.width()
    }
}

impl<B: Bus> Cpu<B> {
    /// Checks access to `width` bytes at `port`. Only consulted in
    /// protected mode when CPL > IOPL, and always in V86 mode.
    pub(crate) fn check_io_permission(&mut self, port: u16, width: Width) -> Result<(), Fault> {
        let needs_bitmap = match self.state.mode() {
            CpuMode::Real => false,
            CpuMode::Vm86 => true,
            CpuMode::Protected => self.state.cpl() > self.state.flags.iopl(),
        };
        if !needs_bitmap {
            return Ok(());
        }
        let tr = self.state.tr;
        let tss32 = tr.valid
            && matches!(tr.access & 0x1f, SYS_TSS32_AVAIL | SYS_TSS32_BUSY);
        if !tss32 || tr.limit < 0x67 {
            return Err(Fault::gp0());
        }
        let map_base = self.read_sys(tr.base.wrapping_add(TSS_IOMAP_BASE), Width::Word)?;
        let off = map_base + (port as u32 >> 3);
        if off + 1 > tr.limit {
            return Err(Fault::gp0());
        }
        let bits = self.read_sys(tr.base.wrapping_add(off), Width::Word)?;
        let mask = ((1u32 << width.bytes()) - 1) << (port & 7);
        if bits & mask != 0 {
            tracing::debug!(port = format_args!("{port:#06x}"), "I/O bitmap denies port");
            return Err(Fault::gp0());
        }
        Ok(())
    }

    fn port_in(&mut self, port: u16, width: Width) -> Result<u32, Fault> {
        self.check_io_permission(port, width)?;
        if let Some(v) = self.cyrix_port(port, width, None) {
            return Ok(v);
        }
        Ok(self.bus.io_read(port, width))
    }

    fn port_out(&mut self, port: u16, width: Width, value: u32) -> Result<(), Fault> {
        self.check_io_permission(port, width)?;
        if self.cyrix_port(port, width, Some(value)).is_some() {
            return Ok(());
        }
        self.bus.io_write(port, width, value);
        Ok(())
    }
}

fn in_imm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = io_width(insn);
    let port = cpu.fetch_u8()? as u16;
    let v = cpu.port_in(port, width)?;
    cpu.state.gprs.write(width, EAX, v);
    cpu.finish(InstrClass::PortIo, cpu.cyc(14, 12), Ok(()))
}

fn out_imm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = io_width(insn);
    let port = cpu.fetch_u8()? as u16;
    let v = cpu.state.gprs.read(width, EAX);
    cpu.port_out(port, width, v)?;
    cpu.finish(InstrClass::PortIo, cpu.cyc(16, 10), Ok(()))
}

fn in_dx<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = io_width(insn);
    let port = cpu.state.gprs.read(Width::Word, EDX) as u16;
    let v = cpu.port_in(port, width)?;
    cpu.state.gprs.write(width, EAX, v);
    cpu.finish(InstrClass::PortIo, cpu.cyc(14, 13), Ok(()))
}

fn out_dx<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = io_width(insn);
    let port = cpu.state.gprs.read(Width::Word, EDX) as u16;
    let v = cpu.state.gprs.read(width, EAX);
    cpu.port_out(port, width, v)?;
    cpu.finish(InstrClass::PortIo, cpu.cyc(16, 11), Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PcBus;
    use crate::config::CpuConfig;
    use crate::flags::FLAG_VM;
    use crate::segment::{SegmentCache, AR_PRESENT};

    fn v86_cpu_with_tss() -> Cpu<PcBus> {
        let mut cpu = Cpu::new(CpuConfig::default(), PcBus::new(1 << 20)).unwrap();
        cpu.mmu.set_cr0(cpu.mmu.cr0() | 1);
        let eflags = cpu.state.flags.eflags() | FLAG_VM;
        cpu.state.flags.set_eflags(eflags);
        cpu.state.update_mode(true);
        // TSS at 0x4000 with the bitmap at offset 0x68, limit covering
        // ports 0..0x7f plus the terminator byte.
        cpu.state.tr = SegmentCache {
            selector: 0x28,
            base: 0x4000,
            limit: 0x68 + 0x10,
            access: AR_PRESENT | SYS_TSS32_BUSY,
            flags: 0,
            valid: true,
        };
        cpu.bus.load(0x4000 + 0x66, &0x68u16.to_le_bytes());
        // Deny port 0x61 only.
        cpu.bus.load(0x4000 + 0x68 + 0x0c, &[0x02]);
        cpu
    }

    #[test]
    fn bitmap_denies_only_marked_ports() {
        let mut cpu = v86_cpu_with_tss();
        assert_eq!(cpu.check_io_permission(0x60, Width::Byte), Ok(()));
        assert_eq!(cpu.check_io_permission(0x61, Width::Byte), Err(Fault::gp0()));
        // A word access at 0x60 touches 0x61 too.
        assert_eq!(cpu.check_io_permission(0x60, Width::Word), Err(Fault::gp0()));
        // Beyond the TSS limit.
        assert_eq!(cpu.check_io_permission(0x3f8, Width::Byte), Err(Fault::gp0()));
    }

    #[test]
    fn real_mode_skips_the_bitmap() {
        let mut cpu = Cpu::new(CpuConfig::default(), PcBus::new(1 << 20)).unwrap();
        assert_eq!(cpu.check_io_permission(0x61, Width::Byte), Ok(()));
    }
}
