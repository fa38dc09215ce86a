//! SSE packed-single handlers on the independent XMM file.

use crate::bus::Bus;
use crate::control::{Cr0, Cr4};
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::modrm::ModRm;
use crate::regs::Width;
use crate::segment::SegReg;
use crate::sse::{packed_single, PsOp, FXSAVE_AREA_SIZE};
use crate::timing::InstrClass;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>) {
    t.set(0x110, mov_load::<B, false>);
    t.set(0x128, mov_load::<B, true>);
    t.set(0x111, mov_store::<B, false>);
    t.set(0x129, mov_store::<B, true>);
    t.set_range(0x154..=0x157, logic::<B>);
    for op in [0x151, 0x158, 0x159, 0x15c, 0x15d, 0x15e, 0x15f] {
        t.set(op, arith::<B>);
    }
    t.set(0x1ae, group_ae::<B>);
}

/// SSE needs the OS to have opted in through CR4.OSFXSR.
fn check_available<B: Bus>(cpu: &Cpu<B>) -> Result<(), Fault> {
    let cr0 = cpu.cr0();
    if cr0.contains(Cr0::EM) || cpu.mmu.cr4() & Cr4::OSFXSR.bits() == 0 {
        return Err(Fault::InvalidOpcode);
    }
    if cr0.contains(Cr0::TS) {
        return Err(Fault::DeviceNotAvailable);
    }
    Ok(())
}

fn xmm_index(i: u8) -> usize {
    (i & 7) as usize
}

/// MOVAPS operands must be 16-byte aligned.
fn mem_operand<B: Bus>(m: &ModRm, aligned: bool) -> Result<(SegReg, u32), Fault> {
    let (seg, off) = Cpu::<B>::mem_operand(m)?;
    if aligned && off & 0xf != 0 {
        return Err(Fault::gp0());
    }
    Ok((seg, off))
}

fn source<B: Bus>(cpu: &mut Cpu<B>, m: &ModRm, aligned: bool) -> Result<u128, Fault> {
    if m.is_reg() {
        return Ok(cpu.state.xmm.regs[xmm_index(m.rm)]);
    }
    let (seg, off) = mem_operand::<B>(m, aligned)?;
    cpu.read_mem128(seg, off)
}

fn cycles<B: Bus>(cpu: &Cpu<B>, m: &ModRm) -> u32 {
    if m.is_reg() {
        cpu.cyc(1, 1)
    } else {
        cpu.cyc(2, 2)
    }
}

fn mov_load<B: Bus, const ALIGNED: bool>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    check_available(cpu)?;
    let m = cpu.modrm(insn)?;
    let v = source(cpu, &m, ALIGNED)?;
    cpu.state.xmm.regs[xmm_index(m.reg)] = v;
    cpu.finish(InstrClass::Sse, cycles(cpu, &m), Ok(()))
}

fn mov_store<B: Bus, const ALIGNED: bool>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    check_available(cpu)?;
    let m = cpu.modrm(insn)?;
    let v = cpu.state.xmm.regs[xmm_index(m.reg)];
    if m.is_reg() {
        cpu.state.xmm.regs[xmm_index(m.rm)] = v;
    } else {
        let (seg, off) = mem_operand::<B>(&m, ALIGNED)?;
        cpu.write_mem128(seg, off, v)?;
    }
    cpu.finish(InstrClass::Sse, cycles(cpu, &m), Ok(()))
}

/// ANDPS, ANDNPS, ORPS and XORPS.
fn logic<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    check_available(cpu)?;
    let m = cpu.modrm(insn)?;
    let src = source(cpu, &m, true)?;
    let dst = cpu.state.xmm.regs[xmm_index(m.reg)];
    let r = match insn.opcode & 0xff {
        0x54 => dst & src,
        0x55 => !dst & src,
        0x56 => dst | src,
        _ => dst ^ src,
    };
    cpu.state.xmm.regs[xmm_index(m.reg)] = r;
    cpu.finish(InstrClass::Sse, cycles(cpu, &m), Ok(()))
}

fn arith<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    check_available(cpu)?;
    let op = match insn.opcode & 0xff {
        0x51 => PsOp::Sqrt,
        0x58 => PsOp::Add,
        0x59 => PsOp::Mul,
        0x5c => PsOp::Sub,
        0x5d => PsOp::Min,
        0x5e => PsOp::Div,
        _ => PsOp::Max,
    };
    let m = cpu.modrm(insn)?;
    let src = source(cpu, &m, true)?;
    let dst = cpu.state.xmm.regs[xmm_index(m.reg)];
    cpu.state.xmm.regs[xmm_index(m.reg)] = packed_single(op, dst, src);
    let cost = match op {
        PsOp::Div => cpu.cyc(36, 36),
        PsOp::Sqrt => cpu.cyc(58, 58),
        _ => cycles(cpu, &m) + 1,
    };
    cpu.finish(InstrClass::Sse, cost, Ok(()))
}

/// 0F AE memory forms: `/0` FXSAVE, `/1` FXRSTOR, `/2` LDMXCSR, `/3`
/// STMXCSR.
fn group_ae<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let m = cpu.modrm(insn)?;
    if m.is_reg() {
        return Err(Fault::InvalidOpcode);
    }
    let (seg, off) = Cpu::<B>::mem_operand(&m)?;
    match m.reg {
        0 | 1 => fx_state(cpu, m.reg == 1, seg, off),
        2 | 3 => mxcsr(cpu, m.reg == 3, seg, off),
        _ => Err(Fault::InvalidOpcode),
    }
}

fn mxcsr<B: Bus>(cpu: &mut Cpu<B>, store: bool, seg: SegReg, off: u32) -> Result<(), Fault> {
    check_available(cpu)?;
    if store {
        let v = cpu.state.xmm.mxcsr();
        cpu.write_mem(seg, off, Width::Dword, v)?;
    } else {
        let v = cpu.read_mem(seg, off, Width::Dword)?;
        cpu.state.xmm.load_mxcsr(v)?;
    }
    cpu.finish(InstrClass::Sse, cpu.cyc(7, 7), Ok(()))
}

/// FXSAVE and FXRSTOR work without CR4.OSFXSR; they then skip MXCSR and
/// the XMM registers. The image must be 16-byte aligned.
fn fx_state<B: Bus>(cpu: &mut Cpu<B>, restore: bool, seg: SegReg, off: u32) -> Result<(), Fault> {
    let cr0 = cpu.cr0();
    if cr0.contains(Cr0::EM) {
        return Err(Fault::InvalidOpcode);
    }
    if cr0.contains(Cr0::TS) {
        return Err(Fault::DeviceNotAvailable);
    }
    if off & 0xf != 0 {
        return Err(Fault::gp0());
    }
    let with_sse = cpu.mmu.cr4() & Cr4::OSFXSR.bits() != 0;
    if restore {
        let mut image = [0u8; FXSAVE_AREA_SIZE];
        cpu.read_mem_bytes(seg, off, &mut image)?;
        cpu.state.fxrstor(&image, with_sse)?;
        cpu.finish(InstrClass::Sse, cpu.cyc(40, 40), Ok(()))
    } else {
        let image = cpu.state.fxsave(with_sse);
        cpu.write_mem_bytes(seg, off, &image)?;
        cpu.finish(InstrClass::Sse, cpu.cyc(30, 30), Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PcBus;
    use crate::config::{CpuConfig, CpuModel};
    use crate::interrupts::NoInterrupts;
    use crate::segment::SegmentCache;
    use crate::sse::MXCSR_DEFAULT;

    fn sse_cpu(code: &[u8], osfxsr: bool) -> Cpu<PcBus> {
        let mut cpu = Cpu::new(CpuConfig::for_model(CpuModel::PentiumIII), PcBus::new(1 << 20)).unwrap();
        *cpu.state.seg_mut(SegReg::Cs) = SegmentCache::real(0);
        *cpu.state.seg_mut(SegReg::Ds) = SegmentCache::real(0);
        if osfxsr {
            cpu.mmu.set_cr4(Cr4::OSFXSR.bits());
        }
        cpu.state.eip = 0x1000;
        cpu.bus.load(0x1000, code);
        cpu
    }

    fn f32x4(v: [f32; 4]) -> u128 {
        v.iter()
            .enumerate()
            .fold(0, |acc, (i, l)| acc | (l.to_bits() as u128) << (32 * i))
    }

    #[test]
    fn addps_from_aligned_memory() {
        // ADDPS XMM1, [0x2000]
        let mut cpu = sse_cpu(&[0x0f, 0x58, 0x0e, 0x00, 0x20], true);
        cpu.state.xmm.regs[1] = f32x4([1.0, 2.0, 3.0, 4.0]);
        cpu.bus.load(0x2000, &f32x4([0.5, 0.5, -3.0, 4.0]).to_le_bytes());
        cpu.step(&mut NoInterrupts).unwrap();
        assert_eq!(cpu.state.xmm.regs[1], f32x4([1.5, 2.5, 0.0, 8.0]));
    }

    #[test]
    fn movaps_rejects_misaligned_operand() {
        let m = ModRm {
            mod_: 0,
            reg: 0,
            rm: 6,
            operand: crate::modrm::Operand::Mem { seg: SegReg::Ds, off: 0x2008 },
        };
        assert_eq!(mem_operand::<PcBus>(&m, true), Err(Fault::gp0()));
        assert_eq!(mem_operand::<PcBus>(&m, false), Ok((SegReg::Ds, 0x2008)));
    }

    #[test]
    fn without_osfxsr_sse_is_undefined() {
        let cpu = sse_cpu(&[], false);
        assert_eq!(check_available(&cpu), Err(Fault::InvalidOpcode));
        let cpu = sse_cpu(&[], true);
        assert_eq!(check_available(&cpu), Ok(()));
    }

    #[test]
    fn ldmxcsr_rejects_reserved_bits() {
        // LDMXCSR [0x2000]
        let mut cpu = sse_cpu(&[0x0f, 0xae, 0x16, 0x00, 0x20], true);
        cpu.bus.load(0x2000, &0x0001_0000u32.to_le_bytes());
        assert!(cpu.step(&mut NoInterrupts).is_ok());
        assert_eq!(cpu.state.xmm.mxcsr(), MXCSR_DEFAULT);
    }

    #[test]
    fn fxsave_then_fxrstor_brings_back_sse_state() {
        // FXSAVE [0x2000]; FXRSTOR [0x2000]
        let mut cpu = sse_cpu(&[0x0f, 0xae, 0x06, 0x00, 0x20, 0x0f, 0xae, 0x0e, 0x00, 0x20], true);
        cpu.state.xmm.regs[5] = 0xfeed_face_0000_0000_dead_beef_0000_0001;
        cpu.state.xmm.load_mxcsr(0x1f00).unwrap();
        cpu.step(&mut NoInterrupts).unwrap();
        let ram = cpu.bus.ram();
        assert_eq!(&ram[0x2000..0x2002], &0x037fu16.to_le_bytes());
        assert_eq!(&ram[0x2018..0x201c], &0x1f00u32.to_le_bytes());
        assert_eq!(&ram[0x20f0..0x2100], &cpu.state.xmm.regs[5].to_le_bytes());

        cpu.state.xmm.regs[5] = 0;
        cpu.state.xmm.load_mxcsr(MXCSR_DEFAULT).unwrap();
        cpu.step(&mut NoInterrupts).unwrap();
        assert_eq!(cpu.state.eip, 0x100a);
        assert_eq!(cpu.state.xmm.regs[5], 0xfeed_face_0000_0000_dead_beef_0000_0001);
        assert_eq!(cpu.state.xmm.mxcsr(), 0x1f00);
    }

    #[test]
    fn fxsave_without_osfxsr_omits_sse_state() {
        // FXSAVE [0x2000]
        let mut cpu = sse_cpu(&[0x0f, 0xae, 0x06, 0x00, 0x20], false);
        cpu.state.xmm.regs[0] = u128::MAX;
        cpu.bus.load(0x2018, &[0xaa; 8]);
        cpu.step(&mut NoInterrupts).unwrap();
        assert_eq!(cpu.state.eip, 0x1005);
        let ram = cpu.bus.ram();
        assert_eq!(&ram[0x2000..0x2002], &0x037fu16.to_le_bytes());
        assert_eq!(&ram[0x2018..0x2020], &[0; 8]);
        assert_eq!(&ram[0x20a0..0x20b0], &[0; 16]);
    }

    #[test]
    fn fxsave_to_misaligned_memory_is_gp() {
        let mut cpu = sse_cpu(&[], true);
        assert_eq!(fx_state(&mut cpu, false, SegReg::Ds, 0x2008), Err(Fault::gp0()));
        assert_eq!(fx_state(&mut cpu, true, SegReg::Ds, 0x2010), Ok(()));
    }
}
