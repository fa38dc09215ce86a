//! MMX handlers.
//!
//! Registers are addressed by their fixed physical index, never relative to
//! TOP. Each handler switches the x87 file into MMX mode once, after the
//! availability checks and before the first register access.

use crate::bus::Bus;
use crate::control::Cr0;
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::mmx::{self as lanes, Lane};
use crate::modrm::ModRm;
use crate::regs::Width;
use crate::timing::InstrClass;

type BinOp = fn(u64, u64) -> u64;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>) {
    for op in 0x160..=0x16b {
        t.set(op, binary::<B>);
    }
    for op in [0x174, 0x175, 0x176, 0x1d5, 0x1e5] {
        t.set(op, binary::<B>);
    }
    for op in [0x1d8, 0x1d9, 0x1db, 0x1dc, 0x1dd, 0x1df] {
        t.set(op, binary::<B>);
    }
    for op in [0x1e8, 0x1e9, 0x1eb, 0x1ec, 0x1ed, 0x1ef] {
        t.set(op, binary::<B>);
    }
    for op in [0x1f8, 0x1f9, 0x1fa, 0x1fc, 0x1fd, 0x1fe] {
        t.set(op, binary::<B>);
    }
    for op in [0x1d1, 0x1d2, 0x1d3, 0x1e1, 0x1e2, 0x1f1, 0x1f2, 0x1f3] {
        t.set(op, shift_by_operand::<B>);
    }
    t.set_range(0x171..=0x173, shift_imm::<B>);
    t.set(0x16e, movd_load::<B>);
    t.set(0x17e, movd_store::<B>);
    t.set(0x16f, movq_load::<B>);
    t.set(0x17f, movq_store::<B>);
    t.set(0x177, emms::<B>);
}

/// CR0.EM makes MMX opcodes undefined; CR0.TS defers them to the OS.
fn enter<B: Bus>(cpu: &mut Cpu<B>) -> Result<(), Fault> {
    let cr0 = cpu.cr0();
    if cr0.contains(Cr0::EM) {
        return Err(Fault::InvalidOpcode);
    }
    if cr0.contains(Cr0::TS) {
        return Err(Fault::DeviceNotAvailable);
    }
    cpu.state.fpu.enter_mmx();
    Ok(())
}

fn source<B: Bus>(cpu: &mut Cpu<B>, m: &ModRm) -> Result<u64, Fault> {
    if m.is_reg() {
        return Ok(cpu.state.fpu.as_mmx(m.rm));
    }
    let (seg, off) = Cpu::<B>::mem_operand(m)?;
    cpu.read_mem64(seg, off)
}

fn cycles<B: Bus>(cpu: &Cpu<B>, m: &ModRm) -> u32 {
    if m.is_reg() {
        cpu.cyc(1, 1)
    } else {
        cpu.cyc(2, 2)
    }
}

fn binop(opcode: u16) -> Option<BinOp> {
    let f: BinOp = match opcode & 0xff {
        0x60 => |a, b| lanes::punpck(Lane::B, false, a, b),
        0x61 => |a, b| lanes::punpck(Lane::W, false, a, b),
        0x62 => |a, b| lanes::punpck(Lane::D, false, a, b),
        0x63 => lanes::packsswb,
        0x64 => |a, b| lanes::pcmpgt(Lane::B, a, b),
        0x65 => |a, b| lanes::pcmpgt(Lane::W, a, b),
        0x66 => |a, b| lanes::pcmpgt(Lane::D, a, b),
        0x67 => lanes::packuswb,
        0x68 => |a, b| lanes::punpck(Lane::B, true, a, b),
        0x69 => |a, b| lanes::punpck(Lane::W, true, a, b),
        0x6a => |a, b| lanes::punpck(Lane::D, true, a, b),
        0x6b => lanes::packssdw,
        0x74 => |a, b| lanes::pcmpeq(Lane::B, a, b),
        0x75 => |a, b| lanes::pcmpeq(Lane::W, a, b),
        0x76 => |a, b| lanes::pcmpeq(Lane::D, a, b),
        0xd5 => lanes::pmullw,
        0xe5 => lanes::pmulhw,
        0xd8 => lanes::psubus_b,
        0xd9 => lanes::psubus_w,
        0xdc => lanes::paddus_b,
        0xdd => lanes::paddus_w,
        0xe8 => lanes::psubs_b,
        0xe9 => lanes::psubs_w,
        0xec => lanes::padds_b,
        0xed => lanes::padds_w,
        0xdb => |a, b| a & b,
        0xdf => |a, b| !a & b,
        0xeb => |a, b| a | b,
        0xef => |a, b| a ^ b,
        0xf8 => |a, b| lanes::psub(Lane::B, a, b),
        0xf9 => |a, b| lanes::psub(Lane::W, a, b),
        0xfa => |a, b| lanes::psub(Lane::D, a, b),
        0xfc => |a, b| lanes::padd(Lane::B, a, b),
        0xfd => |a, b| lanes::padd(Lane::W, a, b),
        0xfe => |a, b| lanes::padd(Lane::D, a, b),
        _ => return None,
    };
    Some(f)
}

fn binary<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let f = binop(insn.opcode).ok_or(Fault::InvalidOpcode)?;
    enter(cpu)?;
    let m = cpu.modrm(insn)?;
    let src = source(cpu, &m)?;
    let dst = cpu.state.fpu.as_mmx(m.reg);
    cpu.state.fpu.set_mmx(m.reg, f(dst, src));
    cpu.finish(InstrClass::Mmx, cycles(cpu, &m), Ok(()))
}

#[derive(Debug, Clone, Copy)]
enum ShiftKind {
    Left,
    Right,
    Arith,
}

fn shift(kind: ShiftKind, lane: Lane, v: u64, count: u64) -> u64 {
    match kind {
        ShiftKind::Left => lanes::psll(lane, v, count),
        ShiftKind::Right => lanes::psrl(lane, v, count),
        ShiftKind::Arith => lanes::psra(lane, v, count),
    }
}

/// PSRL/PSRA/PSLL with the count taken from an MMX register or m64.
fn shift_by_operand<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let (kind, lane) = match insn.opcode & 0xff {
        0xd1 => (ShiftKind::Right, Lane::W),
        0xd2 => (ShiftKind::Right, Lane::D),
        0xd3 => (ShiftKind::Right, Lane::Q),
        0xe1 => (ShiftKind::Arith, Lane::W),
        0xe2 => (ShiftKind::Arith, Lane::D),
        0xf1 => (ShiftKind::Left, Lane::W),
        0xf2 => (ShiftKind::Left, Lane::D),
        _ => (ShiftKind::Left, Lane::Q),
    };
    enter(cpu)?;
    let m = cpu.modrm(insn)?;
    let count = source(cpu, &m)?;
    let v = cpu.state.fpu.as_mmx(m.reg);
    cpu.state.fpu.set_mmx(m.reg, shift(kind, lane, v, count));
    cpu.finish(InstrClass::Mmx, cycles(cpu, &m), Ok(()))
}

/// 0F 71/72/73 group: `/2` PSRL, `/4` PSRA, `/6` PSLL by imm8.
fn shift_imm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    enter(cpu)?;
    let m = cpu.modrm(insn)?;
    let count = cpu.fetch_u8()? as u64;
    if !m.is_reg() {
        return Err(Fault::InvalidOpcode);
    }
    let lane = match insn.opcode & 0xff {
        0x71 => Lane::W,
        0x72 => Lane::D,
        _ => Lane::Q,
    };
    let kind = match (m.reg, lane) {
        (2, _) => ShiftKind::Right,
        (4, Lane::W | Lane::D) => ShiftKind::Arith,
        (6, _) => ShiftKind::Left,
        _ => return Err(Fault::InvalidOpcode),
    };
    let v = cpu.state.fpu.as_mmx(m.rm);
    cpu.state.fpu.set_mmx(m.rm, shift(kind, lane, v, count));
    cpu.finish(InstrClass::Mmx, cpu.cyc(1, 1), Ok(()))
}

fn movd_load<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    enter(cpu)?;
    let m = cpu.modrm(insn)?;
    let v = cpu.read_rm(&m, Width::Dword)?;
    cpu.state.fpu.set_mmx(m.reg, v as u64);
    cpu.finish(InstrClass::Mmx, cycles(cpu, &m), Ok(()))
}

fn movd_store<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    enter(cpu)?;
    let m = cpu.modrm(insn)?;
    let v = cpu.state.fpu.as_mmx(m.reg) as u32;
    cpu.write_rm(&m, Width::Dword, v)?;
    cpu.finish(InstrClass::Mmx, cycles(cpu, &m), Ok(()))
}

fn movq_load<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    enter(cpu)?;
    let m = cpu.modrm(insn)?;
    let v = source(cpu, &m)?;
    cpu.state.fpu.set_mmx(m.reg, v);
    cpu.finish(InstrClass::Mmx, cycles(cpu, &m), Ok(()))
}

fn movq_store<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    enter(cpu)?;
    let m = cpu.modrm(insn)?;
    let v = cpu.state.fpu.as_mmx(m.reg);
    if m.is_reg() {
        cpu.state.fpu.set_mmx(m.rm, v);
    } else {
        let (seg, off) = Cpu::<B>::mem_operand(&m)?;
        cpu.write_mem64(seg, off, v)?;
    }
    cpu.finish(InstrClass::Mmx, cycles(cpu, &m), Ok(()))
}

fn emms<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let cr0 = cpu.cr0();
    if cr0.contains(Cr0::EM) {
        return Err(Fault::InvalidOpcode);
    }
    if cr0.contains(Cr0::TS) {
        return Err(Fault::DeviceNotAvailable);
    }
    cpu.state.fpu.emms();
    cpu.finish(InstrClass::Mmx, cpu.cyc(1, 1), Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PcBus;
    use crate::config::{CpuConfig, CpuModel};
    use crate::fpu::{TAG_ALL_EMPTY, TAG_ALL_VALID};
    use crate::interrupts::NoInterrupts;
    use crate::segment::{SegReg, SegmentCache};

    fn mmx_cpu(code: &[u8]) -> Cpu<PcBus> {
        let mut cpu = Cpu::new(CpuConfig::for_model(CpuModel::PentiumMmx), PcBus::new(1 << 20)).unwrap();
        *cpu.state.seg_mut(SegReg::Cs) = SegmentCache::real(0);
        *cpu.state.seg_mut(SegReg::Ds) = SegmentCache::real(0);
        cpu.state.eip = 0x1000;
        cpu.bus.load(0x1000, code);
        cpu
    }

    #[test]
    fn pxor_resets_the_x87_view_and_sets_exponent() {
        // PXOR MM1, MM1
        let mut cpu = mmx_cpu(&[0x0f, 0xef, 0xc9]);
        cpu.state.fpu.set_tag_word(0x5555);
        cpu.state.fpu.set_status_word(3 << 11);
        cpu.state.fpu.set_mmx(1, 0x1234);
        cpu.step(&mut NoInterrupts).unwrap();
        assert_eq!(cpu.state.fpu.tag_word(), TAG_ALL_VALID);
        assert_eq!(cpu.state.fpu.top(), 0);
        assert_eq!(cpu.state.fpu.as_mmx(1), 0);
        assert_eq!(cpu.state.fpu.raw(1) >> 64, 0xffff);
    }

    #[test]
    fn paddusb_saturates_from_memory() {
        // MOVQ MM0, [0x2000]; PADDUSB MM0, [0x2008]; EMMS
        let code = [
            0x0f, 0x6f, 0x06, 0x00, 0x20, 0x0f, 0xdc, 0x06, 0x08, 0x20, 0x0f, 0x77,
        ];
        let mut cpu = mmx_cpu(&code);
        cpu.bus.load(0x2000, &0x01ff_80u64.to_le_bytes());
        cpu.bus.load(0x2008, &0x0102_90u64.to_le_bytes());
        for _ in 0..3 {
            cpu.step(&mut NoInterrupts).unwrap();
        }
        assert_eq!(cpu.state.fpu.as_mmx(0), 0x02ff_ff);
        assert_eq!(cpu.state.fpu.tag_word(), TAG_ALL_EMPTY);
    }

    #[test]
    fn immediate_shift_groups() {
        // PSRAW MM2, 4; PSLLQ MM2, 8
        let mut cpu = mmx_cpu(&[0x0f, 0x71, 0xe2, 0x04, 0x0f, 0x73, 0xf2, 0x08]);
        cpu.state.fpu.set_mmx(2, 0x8000_0010);
        cpu.step(&mut NoInterrupts).unwrap();
        assert_eq!(cpu.state.fpu.as_mmx(2), 0xf800_0001);
        cpu.step(&mut NoInterrupts).unwrap();
        assert_eq!(cpu.state.fpu.as_mmx(2), 0xf8_0000_0100);
    }

    #[test]
    fn em_is_undefined_and_ts_is_not_available() {
        let mut cpu = mmx_cpu(&[]);
        cpu.mmu.set_cr0(cpu.mmu.cr0() | Cr0::EM.bits());
        assert_eq!(enter(&mut cpu), Err(Fault::InvalidOpcode));
        cpu.mmu.set_cr0((cpu.mmu.cr0() & !Cr0::EM.bits()) | Cr0::TS.bits());
        assert_eq!(enter(&mut cpu), Err(Fault::DeviceNotAvailable));
    }
}
