//! Control transfer: Jcc, JCXZ/LOOP, JMP/CALL/RET, software interrupts,
//! IRET, SETcc and the FF group.

use crate::bus::Bus;
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::modrm::ModRm;
use crate::regs::{Width, ECX, ESP};
use crate::segment::{SegReg, SegmentCache};
use crate::state::CpuMode;
use crate::timing::InstrClass;

use super::arith;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>) {
    t.set_range(0x70..=0x7f, jcc_short::<B>);
    t.set_range(0x180..=0x18f, jcc_near::<B>);
    t.set_split(0xe3, jcxz::<B, false>, jcxz::<B, true>);
    for op in 0xe0..=0xe2 {
        t.set_split(op, loop_::<B, false>, loop_::<B, true>);
    }
    t.set(0xeb, jmp_short::<B>);
    t.set(0xe9, jmp_near::<B>);
    t.set(0xe8, call_near::<B>);
    t.set(0xc3, ret_near::<B>);
    t.set(0xc2, ret_near::<B>);
    t.set(0xea, jmp_far::<B>);
    t.set(0x9a, call_far_imm::<B>);
    t.set(0xcd, int_n::<B>);
    t.set(0xcc, int3::<B>);
    t.set(0xce, into::<B>);
    t.set(0xcf, iret::<B>);
    t.set_range(0x190..=0x19f, setcc::<B>);
    t.set(0xff, group_ff::<B>);
}

/// Validates a near target against CS without moving EIP.
fn near_target<B: Bus>(cpu: &Cpu<B>, target: u32, op32: bool) -> Result<u32, Fault> {
    let target = if op32 { target } else { target & 0xffff };
    if !cpu.state.seg(SegReg::Cs).contains(target, 1) {
        return Err(Fault::gp0());
    }
    Ok(target)
}

fn branch_taken<B: Bus>(cpu: &mut Cpu<B>, insn: &Insn, rel: u32) -> Result<(), Fault> {
    let target = cpu.state.eip.wrapping_add(rel);
    cpu.jump_near(target, insn.op32)?;
    cpu.finish(InstrClass::Branch, cpu.cyc(3, 7), Ok(()))
}

fn not_taken<B: Bus>(cpu: &mut Cpu<B>) -> Result<(), Fault> {
    cpu.finish(InstrClass::Branch, cpu.cyc(1, 3), Ok(()))
}

fn jcc_short<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let rel = cpu.fetch_simm8()?;
    if cpu.state.flags.condition(insn.opcode as u8) {
        branch_taken(cpu, insn, rel)
    } else {
        not_taken(cpu)
    }
}

fn jcc_near<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let rel = width.sign_extend(cpu.fetch_imm(width)?);
    if cpu.state.flags.condition(insn.opcode as u8) {
        branch_taken(cpu, insn, rel)
    } else {
        not_taken(cpu)
    }
}

#[inline]
fn count_width<const A32: bool>() -> Width {
    if A32 {
        Width::Dword
    } else {
        Width::Word
    }
}

/// E3: JCXZ/JECXZ. The address size picks CX or ECX.
fn jcxz<B: Bus, const A32: bool>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let rel = cpu.fetch_simm8()?;
    if cpu.state.gprs.read(count_width::<A32>(), ECX) == 0 {
        branch_taken(cpu, insn, rel)
    } else {
        not_taken(cpu)
    }
}

/// E0 LOOPNZ, E1 LOOPZ, E2 LOOP. The count is only written back once the
/// target has been validated.
fn loop_<B: Bus, const A32: bool>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let rel = cpu.fetch_simm8()?;
    let width = count_width::<A32>();
    let count = cpu.state.gprs.read(width, ECX).wrapping_sub(1) & width.mask();
    let taken = count != 0
        && match insn.opcode {
            0xe0 => !cpu.state.flags.zf(),
            0xe1 => cpu.state.flags.zf(),
            _ => true,
        };
    if taken {
        let target = near_target(cpu, cpu.state.eip.wrapping_add(rel), insn.op32)?;
        cpu.state.gprs.write(width, ECX, count);
        cpu.state.eip = target;
        cpu.finish(InstrClass::Branch, cpu.cyc(7, 11), Ok(()))
    } else {
        cpu.state.gprs.write(width, ECX, count);
        cpu.finish(InstrClass::Branch, cpu.cyc(6, 4), Ok(()))
    }
}

fn jmp_short<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let rel = cpu.fetch_simm8()?;
    branch_taken(cpu, insn, rel)
}

fn jmp_near<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let rel = width.sign_extend(cpu.fetch_imm(width)?);
    branch_taken(cpu, insn, rel)
}

/// Pushes the return address and moves to `target`. Nothing is pushed when
/// the target is outside CS.
fn call_to<B: Bus>(cpu: &mut Cpu<B>, target: u32, op32: bool) -> Result<(), Fault> {
    let target = near_target(cpu, target, op32)?;
    let ret = cpu.state.eip;
    cpu.push(Width::from_op32(op32), ret)?;
    cpu.state.eip = target;
    Ok(())
}

fn call_near<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let rel = width.sign_extend(cpu.fetch_imm(width)?);
    let target = cpu.state.eip.wrapping_add(rel);
    call_to(cpu, target, insn.op32)?;
    cpu.finish(InstrClass::Branch, cpu.cyc(3, 7), Ok(()))
}

/// C3 RET, C2 RET imm16. ESP is released only once the target checks out.
fn ret_near<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let extra = if insn.opcode == 0xc2 {
        cpu.fetch_imm(Width::Word)?
    } else {
        0
    };
    let target = cpu.peek(0, width)?;
    cpu.jump_near(target, insn.op32)?;
    cpu.drop_stack(width.bytes() + extra);
    cpu.finish(InstrClass::Branch, cpu.cyc(5, 10), Ok(()))
}

fn far_target_cache<B: Bus>(cpu: &mut Cpu<B>, sel: u16) -> Result<SegmentCache, Fault> {
    Ok(match cpu.state.mode() {
        CpuMode::Real => SegmentCache::real(sel),
        CpuMode::Vm86 => SegmentCache::vm86(sel),
        CpuMode::Protected => cpu.check_code_target(sel, false)?.0,
    })
}

/// Far CALL to a code segment at the current privilege level. Both slots
/// of the return frame are written before ESP, CS and EIP change.
fn call_far<B: Bus>(cpu: &mut Cpu<B>, sel: u16, offset: u32, op32: bool) -> Result<(), Fault> {
    let width = Width::from_op32(op32);
    let size = width.bytes();
    let offset = if op32 { offset } else { offset & 0xffff };
    let cache = far_target_cache(cpu, sel)?;
    if !cache.contains(offset, 1) {
        return Err(Fault::gp0());
    }
    let mask = if cpu.state.stack32() { u32::MAX } else { 0xffff };
    let esp = cpu.state.gprs.get(ESP);
    let old_cs = cpu.state.seg(SegReg::Cs).selector as u32;
    let old_eip = cpu.state.eip;
    cpu.write_mem(SegReg::Ss, esp.wrapping_sub(size) & mask, width, old_cs)?;
    cpu.write_mem(SegReg::Ss, esp.wrapping_sub(2 * size) & mask, width, old_eip)?;
    cpu.set_esp(esp.wrapping_sub(2 * size) & mask);
    *cpu.state.seg_mut(SegReg::Cs) = cache;
    cpu.state.eip = offset;
    Ok(())
}

fn far_pointer_imm<B: Bus>(cpu: &mut Cpu<B>, insn: &Insn) -> Result<(u16, u32), Fault> {
    let offset = cpu.fetch_imm(insn.width())?;
    let sel = cpu.fetch_imm(Width::Word)? as u16;
    Ok((sel, offset))
}

fn jmp_far<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let (sel, offset) = far_pointer_imm(cpu, insn)?;
    cpu.far_jump(sel, offset, insn.op32)?;
    let cycles = if cpu.state.protected() { cpu.cyc(18, 27) } else { cpu.cyc(17, 12) };
    cpu.finish(InstrClass::Branch, cycles, Ok(()))
}

fn call_far_imm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let (sel, offset) = far_pointer_imm(cpu, insn)?;
    call_far(cpu, sel, offset, insn.op32)?;
    let cycles = if cpu.state.protected() { cpu.cyc(20, 34) } else { cpu.cyc(18, 17) };
    cpu.finish(InstrClass::Branch, cycles, Ok(()))
}

/// INT n. Delivery charges its own cycles.
fn int_n<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let vector = cpu.fetch_u8()?;
    cpu.software_interrupt(vector)
}

fn int3<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    cpu.software_trap(3)
}

fn into<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    if cpu.state.flags.of() {
        return cpu.software_trap(4);
    }
    cpu.finish(InstrClass::Branch, 3, Ok(()))
}

fn iret<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    cpu.iret(insn.op32)?;
    cpu.flush_prefetch();
    let cycles = if cpu.state.protected() { cpu.cyc(20, 38) } else { cpu.cyc(15, 22) };
    cpu.finish(InstrClass::Branch, cycles, Ok(()))
}

fn setcc<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let m = cpu.modrm(insn)?;
    let v = cpu.state.flags.condition(insn.opcode as u8) as u32;
    if m.is_reg() {
        cpu.write_rm(&m, Width::Byte, v)?;
        return cpu.finish(InstrClass::Alu, cpu.cyc(4, 4), Ok(()));
    }
    let result = cpu.write_rm(&m, Width::Byte, v);
    cpu.finish(InstrClass::MovStore, cpu.cyc(3, 5), result)
}

/// Reads a 16:16 or 16:32 far pointer from a memory operand.
fn far_pointer_mem<B: Bus>(cpu: &mut Cpu<B>, m: &ModRm, width: Width) -> Result<(u16, u32), Fault> {
    let (seg, off) = Cpu::<B>::mem_operand(m)?;
    let offset = cpu.read_mem(seg, off, width)?;
    let sel = cpu.read_mem(seg, off.wrapping_add(width.bytes()), Width::Word)? as u16;
    Ok((sel, offset))
}

/// FF: INC/DEC, CALL/JMP near and far indirect, PUSH.
fn group_ff<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let m = cpu.modrm(insn)?;
    match m.reg {
        0 => arith::inc_dec_rm(cpu, &m, width, false),
        1 => arith::inc_dec_rm(cpu, &m, width, true),
        2 => {
            let target = cpu.read_rm(&m, width)?;
            call_to(cpu, target, insn.op32)?;
            cpu.finish(InstrClass::Branch, cpu.cyc(5, 10), Ok(()))
        }
        3 => {
            let (sel, offset) = far_pointer_mem(cpu, &m, width)?;
            call_far(cpu, sel, offset, insn.op32)?;
            cpu.finish(InstrClass::Branch, cpu.cyc(17, 22), Ok(()))
        }
        4 => {
            let target = cpu.read_rm(&m, width)?;
            cpu.jump_near(target, insn.op32)?;
            cpu.finish(InstrClass::Branch, cpu.cyc(5, 10), Ok(()))
        }
        5 => {
            let (sel, offset) = far_pointer_mem(cpu, &m, width)?;
            cpu.far_jump(sel, offset, insn.op32)?;
            cpu.finish(InstrClass::Branch, cpu.cyc(13, 17), Ok(()))
        }
        6 => {
            let v = cpu.read_rm(&m, width)?;
            let result = cpu.push(width, v);
            cpu.finish(InstrClass::Stack, cpu.cyc(4, 5), result)
        }
        _ => Err(Fault::InvalidOpcode),
    }
}
