//! Integer arithmetic: the eight classic ALU ops, TEST, INC/DEC, the F6/F7
//! unary group and IMUL.

use crate::bus::Bus;
use crate::config::CpuConfig;
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::flags::{FlagOp, Flags, FLAG_CF, FLAG_OF};
use crate::modrm::ModRm;
use crate::regs::{Width, EAX, EDX};
use crate::timing::InstrClass;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>, _config: &CpuConfig) {
    for base in (0x00u16..0x40).step_by(8) {
        t.set_range(base..=base + 5, alu::<B>);
    }
    t.set_range(0x80..=0x83, group1::<B>);
    t.set_range(0x84..=0x85, test_rm_reg::<B>);
    t.set_range(0xa8..=0xa9, test_acc_imm::<B>);
    t.set_range(0x40..=0x4f, inc_dec_reg::<B>);
    t.set(0xfe, group_fe::<B>);
    t.set_range(0xf6..=0xf7, group3::<B>);
    t.set(0x1af, imul_reg_rm::<B>);
    t.set(0x69, imul_imm::<B>);
    t.set(0x6b, imul_imm::<B>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// Operation selected by bits 5:3 of the opcode or the ModRM reg field.
    pub(crate) fn from_index(idx: u8) -> Self {
        match idx & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    #[inline]
    fn writes_back(self) -> bool {
        self != AluOp::Cmp
    }

    /// Returns the masked result and the carry consumed by ADC/SBB.
    pub(crate) fn compute(self, flags: &Flags, width: Width, a: u32, b: u32) -> (u32, bool) {
        let cin = matches!(self, AluOp::Adc | AluOp::Sbb) && flags.cf();
        let res = match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Adc => a.wrapping_add(b).wrapping_add(cin as u32),
            AluOp::Sub | AluOp::Cmp => a.wrapping_sub(b),
            AluOp::Sbb => a.wrapping_sub(b).wrapping_sub(cin as u32),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
        };
        (res & width.mask(), cin)
    }

    pub(crate) fn record(self, flags: &mut Flags, width: Width, a: u32, b: u32, res: u32, cin: bool) {
        match self {
            AluOp::Add => flags.record(FlagOp::Add, width, a, b, res),
            AluOp::Sub | AluOp::Cmp => flags.record(FlagOp::Sub, width, a, b, res),
            AluOp::Adc => flags.record_carry(FlagOp::Adc, width, a, b, res, cin),
            AluOp::Sbb => flags.record_carry(FlagOp::Sbb, width, a, b, res, cin),
            AluOp::And | AluOp::Or | AluOp::Xor => flags.record(FlagOp::Zn, width, res, 0, res),
        }
    }
}

#[inline]
fn byte_or(insn: &Insn) -> Width {
    if insn.opcode & 1 == 0 {
        Width::Byte
    } else {
        insn.width()
    }
}

/// `op r/m, src`: the store happens before the flags are recorded.
fn alu_rm<B: Bus>(cpu: &mut Cpu<B>, op: AluOp, m: &ModRm, width: Width, src: u32) -> Result<(), Fault> {
    let dst = cpu.read_rm(m, width)?;
    let (res, cin) = op.compute(&cpu.state.flags, width, dst, src);
    if m.is_reg() || !op.writes_back() {
        if op.writes_back() {
            cpu.write_rm(m, width, res)?;
        }
        op.record(&mut cpu.state.flags, width, dst, src, res, cin);
        let cycles = if m.is_reg() { cpu.cyc(1, 2) } else { cpu.cyc(2, 5) };
        return cpu.finish(InstrClass::Alu, cycles, Ok(()));
    }
    let result = cpu.write_rm(m, width, res);
    if result.is_ok() {
        op.record(&mut cpu.state.flags, width, dst, src, res, cin);
    }
    let cycles = cpu.cyc(3, 7);
    cpu.finish(InstrClass::AluStore, cycles, result)
}

/// 00-3D: ADD/OR/ADC/SBB/AND/SUB/XOR/CMP in their six encodings.
fn alu<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let op = AluOp::from_index((insn.opcode >> 3) as u8);
    let width = byte_or(insn);
    match insn.opcode & 7 {
        0 | 1 => {
            let m = cpu.modrm(insn)?;
            let src = cpu.state.gprs.read(width, m.reg);
            alu_rm(cpu, op, &m, width, src)
        }
        2 | 3 => {
            let m = cpu.modrm(insn)?;
            let src = cpu.read_rm(&m, width)?;
            let dst = cpu.state.gprs.read(width, m.reg);
            let (res, cin) = op.compute(&cpu.state.flags, width, dst, src);
            if op.writes_back() {
                cpu.state.gprs.write(width, m.reg, res);
            }
            op.record(&mut cpu.state.flags, width, dst, src, res, cin);
            let cycles = if m.is_reg() { cpu.cyc(1, 2) } else { cpu.cyc(2, 6) };
            cpu.finish(InstrClass::Alu, cycles, Ok(()))
        }
        _ => {
            let src = cpu.fetch_imm(width)?;
            let dst = cpu.state.gprs.read(width, EAX);
            let (res, cin) = op.compute(&cpu.state.flags, width, dst, src);
            if op.writes_back() {
                cpu.state.gprs.write(width, EAX, res);
            }
            op.record(&mut cpu.state.flags, width, dst, src, res, cin);
            let cycles = cpu.cyc(1, 2);
            cpu.finish(InstrClass::Alu, cycles, Ok(()))
        }
    }
}

/// 80-83: ALU r/m, imm. 83 sign-extends an 8-bit immediate.
fn group1<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = if insn.opcode == 0x81 || insn.opcode == 0x83 {
        insn.width()
    } else {
        Width::Byte
    };
    let m = cpu.modrm(insn)?;
    let imm = if insn.opcode == 0x83 {
        cpu.fetch_simm8()? & width.mask()
    } else {
        cpu.fetch_imm(width)?
    };
    alu_rm(cpu, AluOp::from_index(m.reg), &m, width, imm)
}

fn test_rm_reg<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = byte_or(insn);
    let m = cpu.modrm(insn)?;
    let a = cpu.read_rm(&m, width)?;
    let res = a & cpu.state.gprs.read(width, m.reg);
    cpu.state.flags.record(FlagOp::Zn, width, res, 0, res);
    let cycles = if m.is_reg() { cpu.cyc(1, 2) } else { cpu.cyc(2, 5) };
    cpu.finish(InstrClass::Alu, cycles, Ok(()))
}

fn test_acc_imm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = byte_or(insn);
    let imm = cpu.fetch_imm(width)?;
    let res = cpu.state.gprs.read(width, EAX) & imm;
    cpu.state.flags.record(FlagOp::Zn, width, res, 0, res);
    let cycles = cpu.cyc(1, 2);
    cpu.finish(InstrClass::Alu, cycles, Ok(()))
}

fn record_inc_dec(flags: &mut Flags, width: Width, old: u32, res: u32, dec: bool) {
    flags.rebuild_cf();
    let op = if dec { FlagOp::Dec } else { FlagOp::Inc };
    flags.record(op, width, old, 1, res);
}

fn inc_dec_reg<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let reg = (insn.opcode & 7) as u8;
    let dec = insn.opcode >= 0x48;
    let old = cpu.state.gprs.read(width, reg);
    let res = if dec { old.wrapping_sub(1) } else { old.wrapping_add(1) } & width.mask();
    cpu.state.gprs.write(width, reg, res);
    record_inc_dec(&mut cpu.state.flags, width, old, res, dec);
    let cycles = cpu.cyc(1, 2);
    cpu.finish(InstrClass::Alu, cycles, Ok(()))
}

/// INC/DEC r/m; CF is preserved.
pub(super) fn inc_dec_rm<B: Bus>(cpu: &mut Cpu<B>, m: &ModRm, width: Width, dec: bool) -> Result<(), Fault> {
    let old = cpu.read_rm(m, width)?;
    let res = if dec { old.wrapping_sub(1) } else { old.wrapping_add(1) } & width.mask();
    let result = cpu.write_rm(m, width, res);
    if result.is_ok() {
        record_inc_dec(&mut cpu.state.flags, width, old, res, dec);
    }
    let (class, cycles) = if m.is_reg() {
        (InstrClass::Alu, cpu.cyc(1, 2))
    } else {
        (InstrClass::AluStore, cpu.cyc(3, 6))
    };
    cpu.finish(class, cycles, result)
}

fn group_fe<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let m = cpu.modrm(insn)?;
    match m.reg {
        0 => inc_dec_rm(cpu, &m, Width::Byte, false),
        1 => inc_dec_rm(cpu, &m, Width::Byte, true),
        _ => Err(Fault::InvalidOpcode),
    }
}

fn acc_pair(cpu: &Cpu<impl Bus>, width: Width) -> u64 {
    let g = &cpu.state.gprs;
    match width {
        Width::Byte => g.read(Width::Word, EAX) as u64,
        Width::Word => (g.read(Width::Word, EDX) as u64) << 16 | g.read(Width::Word, EAX) as u64,
        Width::Dword => (g.get(EDX) as u64) << 32 | g.get(EAX) as u64,
    }
}

/// Writes a double-width product into AX, DX:AX or EDX:EAX.
fn set_acc_pair(cpu: &mut Cpu<impl Bus>, width: Width, value: u64) {
    let g = &mut cpu.state.gprs;
    match width {
        Width::Byte => g.write(Width::Word, EAX, value as u32),
        Width::Word => {
            g.write(Width::Word, EAX, value as u32);
            g.write(Width::Word, EDX, (value >> 16) as u32);
        }
        Width::Dword => {
            g.set(EAX, value as u32);
            g.set(EDX, (value >> 32) as u32);
        }
    }
}

/// Quotient and remainder into AL/AH, AX/DX or EAX/EDX.
fn set_div_result(cpu: &mut Cpu<impl Bus>, width: Width, quot: u32, rem: u32) {
    let g = &mut cpu.state.gprs;
    match width {
        Width::Byte => g.write(Width::Word, EAX, (rem & 0xff) << 8 | (quot & 0xff)),
        _ => {
            g.write(width, EAX, quot);
            g.write(width, EDX, rem);
        }
    }
}

#[inline]
fn signed(width: Width, v: u32) -> i64 {
    width.sign_extend(v & width.mask()) as i32 as i64
}

fn mul_flags(flags: &mut Flags, width: Width, low: u32, overflow: bool) {
    flags.record(FlagOp::Zn, width, low, 0, low);
    flags.set(FLAG_CF | FLAG_OF, overflow);
}

/// F6/F7: TEST, NOT, NEG, MUL, IMUL, DIV, IDIV.
fn group3<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = byte_or(insn);
    let bits = width.bits();
    let m = cpu.modrm(insn)?;
    match m.reg {
        0 | 1 => {
            let imm = cpu.fetch_imm(width)?;
            let res = cpu.read_rm(&m, width)? & imm;
            cpu.state.flags.record(FlagOp::Zn, width, res, 0, res);
            let cycles = if m.is_reg() { cpu.cyc(1, 2) } else { cpu.cyc(2, 5) };
            cpu.finish(InstrClass::Alu, cycles, Ok(()))
        }
        2 => {
            let v = cpu.read_rm(&m, width)?;
            let result = cpu.write_rm(&m, width, !v & width.mask());
            let class = if m.is_reg() { InstrClass::Alu } else { InstrClass::AluStore };
            let cycles = if m.is_reg() { cpu.cyc(1, 2) } else { cpu.cyc(3, 6) };
            cpu.finish(class, cycles, result)
        }
        3 => {
            let v = cpu.read_rm(&m, width)?;
            let res = 0u32.wrapping_sub(v) & width.mask();
            let result = cpu.write_rm(&m, width, res);
            if result.is_ok() {
                cpu.state.flags.record(FlagOp::Sub, width, 0, v, res);
            }
            let class = if m.is_reg() { InstrClass::Alu } else { InstrClass::AluStore };
            let cycles = if m.is_reg() { cpu.cyc(1, 2) } else { cpu.cyc(3, 6) };
            cpu.finish(class, cycles, result)
        }
        4 => {
            let src = cpu.read_rm(&m, width)? as u64;
            let acc = cpu.state.gprs.read(width, EAX) as u64;
            let full = acc * src;
            set_acc_pair(cpu, width, full);
            mul_flags(&mut cpu.state.flags, width, full as u32 & width.mask(), full >> bits != 0);
            let cycles = cpu.cyc(13, 9 + bits);
            cpu.finish(InstrClass::Alu, cycles, Ok(()))
        }
        5 => {
            let src = signed(width, cpu.read_rm(&m, width)?);
            let acc = signed(width, cpu.state.gprs.read(width, EAX));
            let full = acc * src;
            let low = full as u32 & width.mask();
            set_acc_pair(cpu, width, full as u64);
            mul_flags(&mut cpu.state.flags, width, low, signed(width, low) != full);
            let cycles = cpu.cyc(13, 9 + bits);
            cpu.finish(InstrClass::Alu, cycles, Ok(()))
        }
        6 => {
            let divisor = cpu.read_rm(&m, width)? as u64;
            let dividend = acc_pair(cpu, width);
            if divisor == 0 {
                return Err(Fault::DivideError);
            }
            let quot = dividend / divisor;
            if quot > width.mask() as u64 {
                return Err(Fault::DivideError);
            }
            set_div_result(cpu, width, quot as u32, (dividend % divisor) as u32);
            let cycles = cpu.cyc(8 + bits, 6 + bits);
            cpu.finish(InstrClass::Alu, cycles, Ok(()))
        }
        _ => {
            let divisor = signed(width, cpu.read_rm(&m, width)?);
            let raw = acc_pair(cpu, width);
            let dividend = match width {
                Width::Byte => raw as u16 as i16 as i64,
                Width::Word => raw as u32 as i32 as i64,
                Width::Dword => raw as i64,
            };
            let quot = dividend.checked_div(divisor).ok_or(Fault::DivideError)?;
            let rem = dividend.checked_rem(divisor).ok_or(Fault::DivideError)?;
            let half = 1i64 << (bits - 1);
            if quot < -half || quot >= half {
                return Err(Fault::DivideError);
            }
            set_div_result(cpu, width, quot as u32, rem as u32);
            let cycles = cpu.cyc(11 + bits, 11 + bits);
            cpu.finish(InstrClass::Alu, cycles, Ok(()))
        }
    }
}

/// Truncating signed multiply for the two- and three-operand IMUL forms.
fn imul_trunc(width: Width, a: u32, b: u32) -> (u32, bool) {
    let full = signed(width, a) * signed(width, b);
    let res = full as u32 & width.mask();
    (res, signed(width, res) != full)
}

fn imul_reg_rm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let m = cpu.modrm(insn)?;
    let src = cpu.read_rm(&m, width)?;
    let (res, overflow) = imul_trunc(width, cpu.state.gprs.read(width, m.reg), src);
    cpu.state.gprs.write(width, m.reg, res);
    mul_flags(&mut cpu.state.flags, width, res, overflow);
    let cycles = cpu.cyc(13, 9 + width.bits());
    cpu.finish(InstrClass::Alu, cycles, Ok(()))
}

/// 69 / 6B: IMUL Gv, Ev, imm.
fn imul_imm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let m = cpu.modrm(insn)?;
    let imm = if insn.opcode == 0x6b {
        cpu.fetch_simm8()?
    } else {
        cpu.fetch_imm(width)?
    };
    let src = cpu.read_rm(&m, width)?;
    let (res, overflow) = imul_trunc(width, src, imm);
    cpu.state.gprs.write(width, m.reg, res);
    mul_flags(&mut cpu.state.flags, width, res, overflow);
    let cycles = cpu.cyc(13, 9 + width.bits());
    cpu.finish(InstrClass::Alu, cycles, Ok(()))
}
