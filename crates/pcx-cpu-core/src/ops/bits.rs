//! BT/BTS/BTR/BTC and the bit scans.

use crate::bus::Bus;
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::flags::{FLAG_CF, FLAG_ZF};
use crate::modrm::{ModRm, Operand};
use crate::regs::Width;
use crate::timing::InstrClass;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>) {
    for op in [0x1a3, 0x1ab, 0x1b3, 0x1bb] {
        t.set(op, bt_reg::<B>);
    }
    t.set(0x1ba, bt_imm::<B>);
    t.set(0x1bc, bit_scan::<B>);
    t.set(0x1bd, bit_scan::<B>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}

impl BitOp {
    fn from_index(idx: u8) -> Self {
        match idx & 3 {
            0 => BitOp::Test,
            1 => BitOp::Set,
            2 => BitOp::Reset,
            _ => BitOp::Complement,
        }
    }

    /// New operand value, or `None` when the operand is only read.
    pub(crate) fn apply(self, v: u32, bit: u32) -> Option<u32> {
        let m = 1u32 << bit;
        match self {
            BitOp::Test => None,
            BitOp::Set => Some(v | m),
            BitOp::Reset => Some(v & !m),
            BitOp::Complement => Some(v ^ m),
        }
    }
}

/// Resolves the operand holding bit `index`. A register-supplied index on a
/// memory operand is a signed bit offset that can leave the addressed
/// word/dword.
fn locate(insn: &Insn, m: &ModRm, width: Width, index: u32, from_reg: bool) -> (ModRm, u32) {
    let bits = width.bits();
    let bit = index & (bits - 1);
    let operand = match m.operand {
        Operand::Mem { seg, off } if from_reg => {
            let idx = width.sign_extend(index & width.mask()) as i32;
            let disp = (idx >> bits.trailing_zeros()).wrapping_mul(width.bytes() as i32);
            let mut off = off.wrapping_add(disp as u32);
            if !insn.addr32 {
                off &= 0xffff;
            }
            Operand::Mem { seg, off }
        }
        other => other,
    };
    (ModRm { operand, ..*m }, bit)
}

fn bit_op<B: Bus>(
    cpu: &mut Cpu<B>,
    insn: &Insn,
    m: &ModRm,
    op: BitOp,
    index: u32,
    from_reg: bool,
) -> Result<(), Fault> {
    let width = insn.width();
    let (target, bit) = locate(insn, m, width, index, from_reg);
    let v = cpu.read_rm(&target, width)?;
    let old = (v >> bit) & 1 != 0;
    let result = match op.apply(v, bit) {
        Some(new) => cpu.write_rm(&target, width, new),
        None => Ok(()),
    };
    if result.is_ok() {
        cpu.state.flags.rebuild();
        cpu.state.flags.set(FLAG_CF, old);
    }
    let cycles = match (m.is_reg(), op) {
        (true, BitOp::Test) => 3,
        (true, _) => cpu.cyc(6, 6),
        (false, BitOp::Test) => cpu.cyc(8, 12),
        (false, _) => cpu.cyc(13, 13),
    };
    cpu.finish(InstrClass::BitOp, cycles, result)
}

/// 0F A3/AB/B3/BB: bit index from a register.
fn bt_reg<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let op = BitOp::from_index(((insn.opcode >> 3) & 3) as u8);
    let m = cpu.modrm(insn)?;
    let index = cpu.state.gprs.read(insn.width(), m.reg);
    bit_op(cpu, insn, &m, op, index, true)
}

/// 0F BA /4-/7: bit index from imm8.
fn bt_imm<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let m = cpu.modrm(insn)?;
    if m.reg < 4 {
        return Err(Fault::InvalidOpcode);
    }
    let index = cpu.fetch_u8()? as u32;
    bit_op(cpu, insn, &m, BitOp::from_index(m.reg), index, false)
}

/// 0F BC/BD: BSF/BSR. A zero source sets ZF and leaves the destination.
fn bit_scan<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = insn.width();
    let m = cpu.modrm(insn)?;
    let src = cpu.read_rm(&m, width)? & width.mask();
    cpu.state.flags.rebuild();
    cpu.state.flags.set(FLAG_ZF, src == 0);
    if src != 0 {
        let idx = if insn.opcode == 0x1bc {
            src.trailing_zeros()
        } else {
            31 - src.leading_zeros()
        };
        cpu.state.gprs.write(width, m.reg, idx);
    }
    let cycles = cpu.cyc(6 + width.bits() / 2, 10 + width.bits());
    cpu.finish(InstrClass::BitOp, cycles, Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegReg;

    fn insn(op32: bool) -> Insn {
        Insn {
            opcode: 0x1a3,
            op32,
            addr32: true,
            seg_override: None,
            rep: None,
            lock: false,
            start_eip: 0,
        }
    }

    fn mem(off: u32) -> ModRm {
        ModRm {
            mod_: 0,
            reg: 0,
            rm: 0,
            operand: Operand::Mem { seg: SegReg::Ds, off },
        }
    }

    #[test]
    fn register_index_reaches_outside_the_operand() {
        let (m, bit) = locate(&insn(true), &mem(0x100), Width::Dword, 37, true);
        assert_eq!(m.operand, Operand::Mem { seg: SegReg::Ds, off: 0x104 });
        assert_eq!(bit, 5);
        let (m, bit) = locate(&insn(true), &mem(0x100), Width::Dword, (-1i32) as u32, true);
        assert_eq!(m.operand, Operand::Mem { seg: SegReg::Ds, off: 0xfc });
        assert_eq!(bit, 31);
        let (m, bit) = locate(&insn(false), &mem(0x100), Width::Word, 0x11, true);
        assert_eq!(m.operand, Operand::Mem { seg: SegReg::Ds, off: 0x102 });
        assert_eq!(bit, 1);
    }

    #[test]
    fn immediate_index_wraps_within_operand() {
        let (m, bit) = locate(&insn(true), &mem(0x100), Width::Dword, 37, false);
        assert_eq!(m.operand, Operand::Mem { seg: SegReg::Ds, off: 0x100 });
        assert_eq!(bit, 5);
    }

    #[test]
    fn apply_per_op() {
        assert_eq!(BitOp::Test.apply(0b1010, 1), None);
        assert_eq!(BitOp::Set.apply(0b1000, 1), Some(0b1010));
        assert_eq!(BitOp::Reset.apply(0b1010, 1), Some(0b1000));
        assert_eq!(BitOp::Complement.apply(0b1010, 3), Some(0b0010));
    }
}
