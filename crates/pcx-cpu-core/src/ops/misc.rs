//! Flag manipulation, conversions, HLT, BOUND, cache control and CPUID.

use crate::bus::Bus;
use crate::config::{CpuConfig, CpuModel, Features};
use crate::control::{CpuidEdx, Cr4};
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::flags::{FLAG_AF, FLAG_CF, FLAG_DF, FLAG_IF, FLAG_PF, FLAG_SF, FLAG_ZF};
use crate::regs::{Width, EAX, EBX, ECX, EDX};
use crate::state::CpuMode;
use crate::timing::InstrClass;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>, config: &CpuConfig) {
    t.set(0x90, nop::<B>);
    t.set(0x98, cbw::<B>);
    t.set(0x99, cwd::<B>);
    t.set(0xf4, hlt::<B>);
    for op in [0xf5, 0xf8, 0xf9, 0xfc, 0xfd] {
        t.set(op, flag_op::<B>);
    }
    t.set(0xfa, cli::<B>);
    t.set(0xfb, sti::<B>);
    t.set(0x62, bound::<B>);
    t.set(0xd6, setalc::<B>);
    t.set(0x9e, sahf::<B>);
    t.set(0x9f, lahf::<B>);
    if config.model.is_486_class() {
        t.set(0x108, invd::<B>);
        t.set(0x109, wbinvd::<B>);
    }
    if config.has(Features::CPUID) {
        t.set(0x1a2, cpuid::<B>);
    }
}

fn nop<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    cpu.finish(InstrClass::Misc, cpu.cyc(1, 3), Ok(()))
}

/// CBW / CWDE.
fn cbw<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let g = &mut cpu.state.gprs;
    if insn.op32 {
        let ax = g.read(Width::Word, EAX);
        g.set(EAX, Width::Word.sign_extend(ax));
    } else {
        let al = g.read(Width::Byte, EAX);
        g.write(Width::Word, EAX, Width::Byte.sign_extend(al));
    }
    cpu.finish(InstrClass::Alu, 3, Ok(()))
}

/// CWD / CDQ.
fn cwd<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let g = &mut cpu.state.gprs;
    let negative = g.read(width, EAX) & width.sign_bit() != 0;
    g.write(width, EDX, if negative { u32::MAX } else { 0 });
    cpu.finish(InstrClass::Alu, 2, Ok(()))
}

fn hlt<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    cpu.require_cpl0()?;
    cpu.state.halted = true;
    tracing::trace!(eip = format_args!("{:#010x}", cpu.state.eip), "halted");
    cpu.finish(InstrClass::System, cpu.cyc(4, 5), Ok(()))
}

/// CMC, CLC, STC, CLD, STD.
fn flag_op<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let flags = &mut cpu.state.flags;
    match insn.opcode {
        0xf5 => {
            let cf = flags.cf();
            flags.set(FLAG_CF, !cf);
        }
        0xf8 => flags.set(FLAG_CF, false),
        0xf9 => flags.set(FLAG_CF, true),
        0xfc => flags.set(FLAG_DF, false),
        _ => flags.set(FLAG_DF, true),
    }
    cpu.finish(InstrClass::Misc, 2, Ok(()))
}

/// CLI/STI are IOPL-sensitive outside real mode.
fn check_iopl<B: Bus>(cpu: &Cpu<B>) -> Result<(), Fault> {
    let iopl = cpu.state.flags.iopl();
    let allowed = match cpu.state.mode() {
        CpuMode::Real => true,
        CpuMode::Vm86 => iopl == 3,
        CpuMode::Protected => cpu.state.cpl() <= iopl,
    };
    if allowed {
        Ok(())
    } else {
        Err(Fault::gp0())
    }
}

fn cli<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    check_iopl(cpu)?;
    cpu.state.flags.set(FLAG_IF, false);
    cpu.finish(InstrClass::Misc, cpu.cyc(5, 3), Ok(()))
}

/// STI holds off interrupts until the following instruction retires.
fn sti<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    check_iopl(cpu)?;
    if !cpu.state.flags.if_() {
        cpu.pending.inhibit_interrupts_for_one_instruction();
    }
    cpu.state.flags.set(FLAG_IF, true);
    cpu.finish(InstrClass::Misc, cpu.cyc(5, 3), Ok(()))
}

fn bound<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let m = cpu.modrm(insn)?;
    let (seg, off) = Cpu::<B>::mem_operand(&m)?;
    let low = width.sign_extend(cpu.read_mem(seg, off, width)?) as i32;
    let high = width.sign_extend(cpu.read_mem(seg, off.wrapping_add(width.bytes()), width)?) as i32;
    let index = width.sign_extend(cpu.state.gprs.read(width, m.reg)) as i32;
    let cycles = cpu.cyc(7, 10);
    if index < low || index > high {
        cpu.charge(cycles);
        return Err(Fault::BoundRange);
    }
    cpu.finish(InstrClass::Misc, cycles, Ok(()))
}

/// Undocumented: AL = CF ? 0xff : 0.
fn setalc<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let v = if cpu.state.flags.cf() { 0xff } else { 0 };
    cpu.state.gprs.write(Width::Byte, EAX, v);
    cpu.finish(InstrClass::Alu, 3, Ok(()))
}

const SAHF_MASK: u32 = FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF | FLAG_CF;

fn sahf<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let ah = cpu.state.gprs.read(Width::Byte, 4);
    let flags = &mut cpu.state.flags;
    flags.rebuild();
    let merged = (flags.eflags() & !SAHF_MASK) | (ah & SAHF_MASK);
    flags.set_eflags(merged);
    cpu.finish(InstrClass::Misc, cpu.cyc(2, 3), Ok(()))
}

fn lahf<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let low = cpu.state.flags.eflags() & 0xff;
    cpu.state.gprs.write(Width::Byte, 4, low);
    cpu.finish(InstrClass::Misc, cpu.cyc(3, 2), Ok(()))
}

fn invd<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    cpu.require_cpl0()?;
    cpu.finish(InstrClass::System, 1000, Ok(()))
}

fn wbinvd<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    cpu.require_cpl0()?;
    cpu.finish(InstrClass::System, 10000, Ok(()))
}

/// Packs a 12-character vendor string into EBX, EDX, ECX order.
fn vendor_regs(vendor: &[u8; 12]) -> [u32; 3] {
    let word = |i: usize| u32::from_le_bytes([vendor[i], vendor[i + 1], vendor[i + 2], vendor[i + 3]]);
    [word(0), word(4), word(8)]
}

/// EDX feature bits of leaf 1. Each bit has a working path in this core:
/// VME is never reported, and FXSR follows the 0F AE handlers.
fn feature_edx(config: &CpuConfig) -> CpuidEdx {
    let mut edx = CpuidEdx::empty();
    let cr4 = Cr4::from_bits_truncate(config.cr4_mask);
    edx.set(CpuidEdx::FPU, config.has(Features::FPU));
    edx.set(CpuidEdx::DE, cr4.contains(Cr4::DE));
    edx.set(CpuidEdx::PSE, cr4.contains(Cr4::PSE));
    edx.set(CpuidEdx::PGE, cr4.contains(Cr4::PGE));
    edx.set(CpuidEdx::MMX, config.has(Features::MMX));
    edx.set(CpuidEdx::FXSR | CpuidEdx::SSE, config.has(Features::SSE));
    edx
}

fn cpuid_leaf(config: &CpuConfig, leaf: u32) -> [u32; 4] {
    match leaf {
        0 => {
            let vendor = if config.model == CpuModel::CyrixMII {
                b"CyrixInstead"
            } else {
                b"GenuineIntel"
            };
            let [ebx, edx, ecx] = vendor_regs(vendor);
            [1, ebx, ecx, edx]
        }
        1 => [config.model.cpuid_signature(), 0, 0, feature_edx(config).bits()],
        _ => [0; 4],
    }
}

fn cpuid<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let leaf = cpu.state.gprs.get(EAX);
    let [eax, ebx, ecx, edx] = cpuid_leaf(&cpu.config, leaf);
    let g = &mut cpu.state.gprs;
    g.set(EAX, eax);
    g.set(EBX, ebx);
    g.set(ECX, ecx);
    g.set(EDX, edx);
    cpu.finish(InstrClass::System, cpu.cyc(14, 14), Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_strings() {
        let intel = cpuid_leaf(&CpuConfig::for_model(CpuModel::Pentium), 0);
        assert_eq!(intel[1], u32::from_le_bytes(*b"Genu"));
        assert_eq!(intel[3], u32::from_le_bytes(*b"ineI"));
        assert_eq!(intel[2], u32::from_le_bytes(*b"ntel"));
        let cyrix = cpuid_leaf(&CpuConfig::for_model(CpuModel::CyrixMII), 0);
        assert_eq!(cyrix[1], u32::from_le_bytes(*b"Cyri"));
    }

    #[test]
    fn leaf1_reports_simd_by_model() {
        let p3 = cpuid_leaf(&CpuConfig::for_model(CpuModel::PentiumIII), 1);
        assert_eq!(p3[0], 0x0672);
        assert_ne!(p3[3] & (1 << 23), 0);
        assert_ne!(p3[3] & (1 << 25), 0);
        let p5 = cpuid_leaf(&CpuConfig::for_model(CpuModel::Pentium), 1);
        assert_eq!(p5[3] & (1 << 23), 0);
        assert_eq!(p5[3] & 1, 1);
    }

    #[test]
    fn vme_is_never_reported() {
        for model in [CpuModel::Pentium, CpuModel::PentiumMmx, CpuModel::PentiumIII, CpuModel::CyrixMII] {
            let config = CpuConfig::for_model(model).with_cr4_mask(0x07ff);
            assert!(!feature_edx(&config).contains(CpuidEdx::VME), "{model:?}");
        }
    }
}
