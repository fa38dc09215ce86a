//! x87 escape opcodes D8-DF and WAIT.
//!
//! Operands flow through the configured [`crate::fpu::FpuBackend`]. Results
//! are committed only after their exceptions were signalled, so an unmasked
//! exception leaves the destination untouched.

use crate::bus::Bus;
use crate::config::Features;
use crate::control::Cr0;
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::fpu::{FpExceptions, F80, FSW_ES};
use crate::modrm::ModRm;
use crate::regs::{Width, EAX};
use crate::segment::SegReg;
use crate::timing::InstrClass;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>) {
    t.set(0xd8, esc_d8::<B>);
    t.set(0xd9, esc_d9::<B>);
    t.set(0xda, esc_da::<B>);
    t.set(0xdb, esc_db::<B>);
    t.set(0xdc, esc_dc::<B>);
    t.set(0xdd, esc_dd::<B>);
    t.set(0xde, esc_de::<B>);
    t.set(0xdf, esc_df::<B>);
    t.set(0x9b, wait::<B>);
}

const PI: F80 = F80 {
    sign_exp: 0x4000,
    mant: 0xc90f_daa2_2168_c235,
};

/// No coprocessor or CR0.EM: #NM so the OS can emulate. CR0.TS: #NM for
/// lazy context switching.
fn check_available<B: Bus>(cpu: &Cpu<B>) -> Result<(), Fault> {
    let cr0 = cpu.cr0();
    if !cpu.config.has(Features::FPU) || cr0.contains(Cr0::EM) || cr0.contains(Cr0::TS) {
        return Err(Fault::DeviceNotAvailable);
    }
    Ok(())
}

/// WAIT only honours TS when MP is also set, then reports a pending
/// unmasked exception.
fn wait<B: Bus>(cpu: &mut Cpu<B>, _insn: &mut Insn) -> Result<(), Fault> {
    let cr0 = cpu.cr0();
    if cr0.contains(Cr0::TS) && cr0.contains(Cr0::MP) {
        return Err(Fault::DeviceNotAvailable);
    }
    if cpu.config.has(Features::FPU) && cpu.state.fpu.status_word() & FSW_ES != 0 {
        return Err(Fault::FpuError);
    }
    cpu.finish(InstrClass::X87, cpu.cyc(1, 6), Ok(()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arith {
    Add,
    Mul,
    Com,
    Comp,
    Sub,
    Subr,
    Div,
    Divr,
}

impl Arith {
    fn from_index(idx: u8) -> Self {
        match idx & 7 {
            0 => Arith::Add,
            1 => Arith::Mul,
            2 => Arith::Com,
            3 => Arith::Comp,
            4 => Arith::Sub,
            5 => Arith::Subr,
            6 => Arith::Div,
            _ => Arith::Divr,
        }
    }

    /// DC/DE register forms encode the reversed operations in swapped slots.
    fn reversed(self) -> Self {
        match self {
            Arith::Sub => Arith::Subr,
            Arith::Subr => Arith::Sub,
            Arith::Div => Arith::Divr,
            Arith::Divr => Arith::Div,
            other => other,
        }
    }

    fn cycles<B: Bus>(self, cpu: &Cpu<B>) -> u32 {
        match self {
            Arith::Add | Arith::Sub | Arith::Subr => cpu.cyc(10, 23),
            Arith::Mul => cpu.cyc(16, 29),
            Arith::Com | Arith::Comp => cpu.cyc(4, 24),
            Arith::Div | Arith::Divr => cpu.cyc(73, 88),
        }
    }
}

/// `dst = dst op src` into `ST(dst)`, or a compare of ST(0) with `src`.
/// `pre` carries exceptions already raised while converting `src`.
fn arith<B: Bus>(
    cpu: &mut Cpu<B>,
    op: Arith,
    dst: u8,
    src: F80,
    pre: FpExceptions,
    pop: bool,
) -> Result<(), Fault> {
    let a = cpu.state.fpu.st(dst)?;
    let rc = cpu.state.fpu.rounding();
    let backend = &*cpu.fpu_backend;
    let (value, exc) = match op {
        Arith::Com | Arith::Comp => {
            let (ord, exc) = backend.compare(a, src);
            cpu.state.fpu.signal(pre | exc)?;
            cpu.state.fpu.set_condition(ord);
            if op == Arith::Comp {
                cpu.state.fpu.pop();
            }
            return cpu.finish(InstrClass::X87, op.cycles(cpu), Ok(()));
        }
        Arith::Add => backend.add(a, src, rc),
        Arith::Mul => backend.mul(a, src, rc),
        Arith::Sub => backend.sub(a, src, rc),
        Arith::Subr => backend.sub(src, a, rc),
        Arith::Div => backend.div(a, src, rc),
        Arith::Divr => backend.div(src, a, rc),
    };
    cpu.state.fpu.commit(dst, (value, pre | exc))?;
    if pop {
        cpu.state.fpu.pop();
    }
    cpu.finish(InstrClass::X87, op.cycles(cpu), Ok(()))
}

fn mem<B: Bus>(m: &ModRm) -> Result<(SegReg, u32), Fault> {
    Cpu::<B>::mem_operand(m)
}

fn read_f32<B: Bus>(cpu: &mut Cpu<B>, m: &ModRm) -> Result<(F80, FpExceptions), Fault> {
    let (seg, off) = mem::<B>(m)?;
    let bits = cpu.read_mem(seg, off, Width::Dword)?;
    Ok(cpu.fpu_backend.from_f32(bits))
}

fn read_f64<B: Bus>(cpu: &mut Cpu<B>, m: &ModRm) -> Result<(F80, FpExceptions), Fault> {
    let (seg, off) = mem::<B>(m)?;
    let bits = cpu.read_mem64(seg, off)?;
    Ok(cpu.fpu_backend.from_f64(bits))
}

/// Signed integer operand of `bytes` size (2, 4 or 8).
fn read_int<B: Bus>(cpu: &mut Cpu<B>, m: &ModRm, bytes: u32) -> Result<F80, Fault> {
    let (seg, off) = mem::<B>(m)?;
    let v = match bytes {
        2 => cpu.read_mem(seg, off, Width::Word)? as u16 as i16 as i64,
        4 => cpu.read_mem(seg, off, Width::Dword)? as i32 as i64,
        _ => cpu.read_mem64(seg, off)? as i64,
    };
    Ok(cpu.fpu_backend.from_i64(v))
}

fn read_f80<B: Bus>(cpu: &mut Cpu<B>, m: &ModRm) -> Result<F80, Fault> {
    let (seg, off) = mem::<B>(m)?;
    let mut buf = [0u8; 10];
    cpu.read_mem_bytes(seg, off, &mut buf)?;
    Ok(F80::from_le_bytes(buf))
}

/// Pushes a loaded value; `cycles` is the (486, 386) pair.
fn load<B: Bus>(
    cpu: &mut Cpu<B>,
    (v, exc): (F80, FpExceptions),
    (c486, c386): (u32, u32),
) -> Result<(), Fault> {
    cpu.state.fpu.signal(exc)?;
    cpu.state.fpu.push(v)?;
    cpu.finish(InstrClass::X87, cpu.cyc(c486, c386), Ok(()))
}

fn store_f32<B: Bus>(cpu: &mut Cpu<B>, m: &ModRm, pop: bool) -> Result<(), Fault> {
    let (seg, off) = mem::<B>(m)?;
    let v = cpu.state.fpu.st(0)?;
    let (bits, exc) = cpu.fpu_backend.to_f32(v, cpu.state.fpu.rounding());
    cpu.state.fpu.signal(exc)?;
    cpu.write_mem(seg, off, Width::Dword, bits)?;
    if pop {
        cpu.state.fpu.pop();
    }
    cpu.finish(InstrClass::X87, cpu.cyc(7, 11), Ok(()))
}

fn store_f64<B: Bus>(cpu: &mut Cpu<B>, m: &ModRm, pop: bool) -> Result<(), Fault> {
    let (seg, off) = mem::<B>(m)?;
    let v = cpu.state.fpu.st(0)?;
    let (bits, exc) = cpu.fpu_backend.to_f64(v, cpu.state.fpu.rounding());
    cpu.state.fpu.signal(exc)?;
    cpu.write_mem64(seg, off, bits)?;
    if pop {
        cpu.state.fpu.pop();
    }
    cpu.finish(InstrClass::X87, cpu.cyc(8, 12), Ok(()))
}

/// FIST/FISTP. Out-of-range values store the integer indefinite (the most
/// negative value) when IE is masked.
fn store_int<B: Bus>(cpu: &mut Cpu<B>, m: &ModRm, bytes: u32, pop: bool) -> Result<(), Fault> {
    let (seg, off) = mem::<B>(m)?;
    let v = cpu.state.fpu.st(0)?;
    let (rounded, mut exc) = cpu.fpu_backend.to_i64(v, cpu.state.fpu.rounding());
    let bits = 8 * bytes;
    let indefinite = i64::MIN >> (64 - bits);
    let value = match rounded {
        Some(i) if bits == 64 || (i >= indefinite && i <= !indefinite) => i,
        _ => {
            exc |= FpExceptions::INVALID;
            indefinite
        }
    };
    cpu.state.fpu.signal(exc)?;
    match bytes {
        2 => cpu.write_mem(seg, off, Width::Word, value as u32)?,
        4 => cpu.write_mem(seg, off, Width::Dword, value as u32)?,
        _ => cpu.write_mem64(seg, off, value as u64)?,
    }
    if pop {
        cpu.state.fpu.pop();
    }
    cpu.finish(InstrClass::X87, cpu.cyc(29, 82), Ok(()))
}

fn d8_dc_da_de<B: Bus>(cpu: &mut Cpu<B>, insn: &Insn) -> Result<(), Fault> {
    check_available(cpu)?;
    let m = cpu.modrm(insn)?;
    let op = Arith::from_index(m.reg);
    if m.is_reg() {
        let i = m.rm;
        return match insn.opcode {
            0xd8 => {
                let src = cpu.state.fpu.st(i)?;
                arith(cpu, op, 0, src, FpExceptions::empty(), false)
            }
            0xdc => {
                let src = cpu.state.fpu.st(0)?;
                arith(cpu, op.reversed(), i, src, FpExceptions::empty(), false)
            }
            0xde => match op {
                // FCOMPP is DE D9 only.
                Arith::Comp if i == 1 => {
                    let src = cpu.state.fpu.st(1)?;
                    arith(cpu, Arith::Comp, 0, src, FpExceptions::empty(), false)?;
                    cpu.state.fpu.pop();
                    Ok(())
                }
                Arith::Com | Arith::Comp => Err(Fault::InvalidOpcode),
                _ => {
                    let src = cpu.state.fpu.st(0)?;
                    arith(cpu, op.reversed(), i, src, FpExceptions::empty(), true)
                }
            },
            _ => Err(Fault::InvalidOpcode),
        };
    }
    let (src, pre) = match insn.opcode {
        0xd8 => read_f32(cpu, &m)?,
        0xdc => read_f64(cpu, &m)?,
        0xda => (read_int(cpu, &m, 4)?, FpExceptions::empty()),
        _ => (read_int(cpu, &m, 2)?, FpExceptions::empty()),
    };
    arith(cpu, op, 0, src, pre, false)
}

fn esc_d8<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    d8_dc_da_de(cpu, insn)
}

fn esc_da<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    d8_dc_da_de(cpu, insn)
}

fn esc_dc<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    d8_dc_da_de(cpu, insn)
}

fn esc_de<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    d8_dc_da_de(cpu, insn)
}

/// Writes FNSTENV's 14- or 28-byte image. Instruction and operand
/// pointers are not tracked and read as zero.
fn store_env<B: Bus>(cpu: &mut Cpu<B>, seg: SegReg, off: u32, op32: bool) -> Result<(), Fault> {
    let fpu = &cpu.state.fpu;
    let fields = [fpu.fcw as u32, fpu.status_word() as u32, fpu.tag_word() as u32, 0, 0, 0, 0];
    let width = if op32 { Width::Dword } else { Width::Word };
    for (i, v) in fields.iter().enumerate() {
        cpu.write_mem(seg, off.wrapping_add(i as u32 * width.bytes()), width, *v)?;
    }
    Ok(())
}

fn load_env<B: Bus>(cpu: &mut Cpu<B>, seg: SegReg, off: u32, op32: bool) -> Result<(), Fault> {
    let step = if op32 { 4 } else { 2 };
    let fcw = cpu.read_mem(seg, off, Width::Word)? as u16;
    let fsw = cpu.read_mem(seg, off.wrapping_add(step), Width::Word)? as u16;
    let tag = cpu.read_mem(seg, off.wrapping_add(2 * step), Width::Word)? as u16;
    let fpu = &mut cpu.state.fpu;
    fpu.fcw = fcw;
    fpu.set_status_word(fsw);
    fpu.set_tag_word(tag);
    Ok(())
}

fn esc_d9<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    check_available(cpu)?;
    let m = cpu.modrm(insn)?;
    if !m.is_reg() {
        let (seg, off) = mem::<B>(&m)?;
        return match m.reg {
            0 => {
                let v = read_f32(cpu, &m)?;
                load(cpu, v, (3, 20))
            }
            2 => store_f32(cpu, &m, false),
            3 => store_f32(cpu, &m, true),
            4 => {
                load_env(cpu, seg, off, insn.op32)?;
                cpu.finish(InstrClass::X87, cpu.cyc(44, 71), Ok(()))
            }
            5 => {
                let fcw = cpu.read_mem(seg, off, Width::Word)? as u16;
                cpu.state.fpu.fcw = fcw;
                cpu.finish(InstrClass::X87, cpu.cyc(4, 19), Ok(()))
            }
            6 => {
                store_env(cpu, seg, off, insn.op32)?;
                cpu.finish(InstrClass::X87, cpu.cyc(67, 103), Ok(()))
            }
            7 => {
                let fcw = cpu.state.fpu.fcw as u32;
                cpu.write_mem(seg, off, Width::Word, fcw)?;
                cpu.finish(InstrClass::X87, cpu.cyc(3, 15), Ok(()))
            }
            _ => Err(Fault::InvalidOpcode),
        };
    }
    let i = m.rm;
    match m.reg {
        0 => {
            let v = cpu.state.fpu.st(i)?;
            load(cpu, (v, FpExceptions::empty()), (4, 14))
        }
        1 => {
            let a = cpu.state.fpu.st(0)?;
            let b = cpu.state.fpu.st(i)?;
            cpu.state.fpu.set_stack(0, b);
            cpu.state.fpu.set_stack(i, a);
            cpu.finish(InstrClass::X87, cpu.cyc(4, 18), Ok(()))
        }
        2 if i == 0 => cpu.finish(InstrClass::X87, cpu.cyc(3, 12), Ok(())),
        4 => match i {
            0 | 1 => {
                let v = cpu.state.fpu.st(0)?;
                let v = if i == 0 { v.neg() } else { v.abs() };
                cpu.state.fpu.set_stack(0, v);
                cpu.finish(InstrClass::X87, cpu.cyc(6, 22), Ok(()))
            }
            4 => arith(cpu, Arith::Com, 0, F80::ZERO, FpExceptions::empty(), false),
            _ => Err(Fault::InvalidOpcode),
        },
        5 => {
            let v = match i {
                0 => F80::ONE,
                3 => PI,
                6 => F80::ZERO,
                _ => return Err(Fault::InvalidOpcode),
            };
            load(cpu, (v, FpExceptions::empty()), (4, 20))
        }
        7 => match i {
            2 => {
                let v = cpu.state.fpu.st(0)?;
                let r = cpu.fpu_backend.sqrt(v, cpu.state.fpu.rounding());
                cpu.state.fpu.commit(0, r)?;
                cpu.finish(InstrClass::X87, cpu.cyc(83, 122), Ok(()))
            }
            4 => {
                let v = cpu.state.fpu.st(0)?;
                let r = cpu.fpu_backend.round_to_int(v, cpu.state.fpu.rounding());
                cpu.state.fpu.commit(0, r)?;
                cpu.finish(InstrClass::X87, cpu.cyc(21, 66), Ok(()))
            }
            _ => Err(Fault::InvalidOpcode),
        },
        _ => Err(Fault::InvalidOpcode),
    }
}

fn esc_db<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    check_available(cpu)?;
    let m = cpu.modrm(insn)?;
    if m.is_reg() {
        return match (m.reg, m.rm) {
            // FENI, FDISI and FSETPM are no-ops after the 8087/287.
            (4, 0 | 1 | 4) => cpu.finish(InstrClass::X87, cpu.cyc(3, 8), Ok(())),
            (4, 2) => {
                cpu.state.fpu.clear_exceptions();
                cpu.finish(InstrClass::X87, cpu.cyc(7, 11), Ok(()))
            }
            (4, 3) => {
                cpu.state.fpu.init();
                cpu.finish(InstrClass::X87, cpu.cyc(17, 33), Ok(()))
            }
            _ => Err(Fault::InvalidOpcode),
        };
    }
    match m.reg {
        0 => {
            let v = read_int(cpu, &m, 4)?;
            load(cpu, (v, FpExceptions::empty()), (9, 45))
        }
        2 => store_int(cpu, &m, 4, false),
        3 => store_int(cpu, &m, 4, true),
        5 => {
            let v = read_f80(cpu, &m)?;
            load(cpu, (v, FpExceptions::empty()), (3, 44))
        }
        7 => {
            let (seg, off) = mem::<B>(&m)?;
            let v = cpu.state.fpu.st(0)?;
            cpu.write_mem_bytes(seg, off, &v.to_le_bytes())?;
            cpu.state.fpu.pop();
            cpu.finish(InstrClass::X87, cpu.cyc(6, 53), Ok(()))
        }
        _ => Err(Fault::InvalidOpcode),
    }
}

fn esc_dd<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    check_available(cpu)?;
    let m = cpu.modrm(insn)?;
    if m.is_reg() {
        let i = m.rm;
        return match m.reg {
            0 => {
                cpu.state.fpu.free(i);
                cpu.finish(InstrClass::X87, cpu.cyc(3, 18), Ok(()))
            }
            2 | 3 => {
                let v = cpu.state.fpu.st(0)?;
                cpu.state.fpu.set_stack(i, v);
                if m.reg == 3 {
                    cpu.state.fpu.pop();
                }
                cpu.finish(InstrClass::X87, cpu.cyc(3, 11), Ok(()))
            }
            _ => Err(Fault::InvalidOpcode),
        };
    }
    match m.reg {
        0 => {
            let v = read_f64(cpu, &m)?;
            load(cpu, v, (3, 25))
        }
        2 => store_f64(cpu, &m, false),
        3 => store_f64(cpu, &m, true),
        7 => {
            let (seg, off) = mem::<B>(&m)?;
            let fsw = cpu.state.fpu.status_word() as u32;
            cpu.write_mem(seg, off, Width::Word, fsw)?;
            cpu.finish(InstrClass::X87, cpu.cyc(3, 15), Ok(()))
        }
        _ => Err(Fault::InvalidOpcode),
    }
}

fn esc_df<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    check_available(cpu)?;
    let m = cpu.modrm(insn)?;
    if m.is_reg() {
        if m.reg == 4 && m.rm == 0 {
            let fsw = cpu.state.fpu.status_word() as u32;
            cpu.state.gprs.write(Width::Word, EAX, fsw);
            return cpu.finish(InstrClass::X87, cpu.cyc(3, 13), Ok(()));
        }
        return Err(Fault::InvalidOpcode);
    }
    match m.reg {
        0 => {
            let v = read_int(cpu, &m, 2)?;
            load(cpu, (v, FpExceptions::empty()), (13, 61))
        }
        2 => store_int(cpu, &m, 2, false),
        3 => store_int(cpu, &m, 2, true),
        5 => {
            let v = read_int(cpu, &m, 8)?;
            load(cpu, (v, FpExceptions::empty()), (10, 56))
        }
        7 => store_int(cpu, &m, 8, true),
        _ => Err(Fault::InvalidOpcode),
    }
}
