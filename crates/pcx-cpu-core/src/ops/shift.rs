//! Shift and rotate group (C0/C1, D0-D3).

use crate::bus::Bus;
use crate::cpu::{Cpu, Insn};
use crate::dispatch::DispatchTable;
use crate::fault::Fault;
use crate::flags::{FlagOp, FLAG_CF, FLAG_OF};
use crate::regs::{Width, ECX};
use crate::timing::InstrClass;

pub(super) fn register<B: Bus>(t: &mut DispatchTable<B>) {
    t.set_range(0xc0..=0xc1, shift_group::<B>);
    t.set_range(0xd0..=0xd3, shift_group::<B>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rotated {
    pub res: u32,
    pub cf: bool,
    pub of: bool,
}

#[inline]
fn msb(width: Width, v: u32) -> bool {
    v & width.sign_bit() != 0
}

/// ROL/ROR/RCL/RCR by a non-zero, already masked count.
pub(crate) fn rotate(kind: u8, width: Width, v: u32, count: u32, cf_in: bool) -> Rotated {
    let bits = width.bits();
    let mask = width.mask();
    let v = v & mask;
    match kind & 3 {
        0 => {
            let n = count % bits;
            let res = if n == 0 { v } else { ((v << n) | (v >> (bits - n))) & mask };
            let cf = res & 1 != 0;
            Rotated { res, cf, of: msb(width, res) ^ cf }
        }
        1 => {
            let n = count % bits;
            let res = if n == 0 { v } else { ((v >> n) | (v << (bits - n))) & mask };
            let cf = msb(width, res);
            Rotated { res, cf, of: cf ^ (res & (width.sign_bit() >> 1) != 0) }
        }
        kind => {
            let total = bits + 1;
            let full_mask = (1u64 << total) - 1;
            let n = count % total;
            let val = v as u64 | (cf_in as u64) << bits;
            let val = match (n, kind) {
                (0, _) => val,
                (_, 2) => ((val << n) | (val >> (total - n))) & full_mask,
                _ => ((val >> n) | (val << (total - n))) & full_mask,
            };
            let res = val as u32 & mask;
            let cf = (val >> bits) & 1 != 0;
            let of = if kind == 2 {
                msb(width, res) ^ cf
            } else {
                msb(width, res) ^ (res & (width.sign_bit() >> 1) != 0)
            };
            Rotated { res, cf, of }
        }
    }
}

fn shift_group<B: Bus>(cpu: &mut Cpu<B>, insn: &mut Insn) -> Result<(), Fault> {
    let width = if insn.opcode & 1 == 0 {
        Width::Byte
    } else {
        insn.width()
    };
    let m = cpu.modrm(insn)?;
    let count = match insn.opcode {
        0xc0 | 0xc1 => cpu.fetch_u8()? as u32,
        0xd0 | 0xd1 => 1,
        _ => cpu.state.gprs.read(Width::Byte, ECX),
    } & 0x1f;
    let v = cpu.read_rm(&m, width)?;
    let (class, cycles) = if m.is_reg() {
        (InstrClass::Shift, cpu.cyc(3, 3))
    } else {
        (InstrClass::AluStore, cpu.cyc(4, 7))
    };
    if count == 0 {
        return cpu.finish(InstrClass::Shift, cycles, Ok(()));
    }

    let mask = width.mask();
    let result = match m.reg {
        kind @ 0..=3 => {
            let r = rotate(kind, width, v, count, cpu.state.flags.cf());
            let result = cpu.write_rm(&m, width, r.res);
            if result.is_ok() {
                cpu.state.flags.set(FLAG_CF, r.cf);
                cpu.state.flags.set(FLAG_OF, r.of);
            }
            result
        }
        4 | 6 => {
            let res = (v << count) & mask;
            let result = cpu.write_rm(&m, width, res);
            if result.is_ok() {
                cpu.state.flags.record(FlagOp::Shl, width, v, count, res);
            }
            result
        }
        5 => {
            let res = (v & mask) >> count;
            let result = cpu.write_rm(&m, width, res);
            if result.is_ok() {
                cpu.state.flags.record(FlagOp::Shr, width, v, count, res);
            }
            result
        }
        _ => {
            let res = ((width.sign_extend(v & mask) as i32) >> count) as u32 & mask;
            let result = cpu.write_rm(&m, width, res);
            if result.is_ok() {
                cpu.state.flags.record(FlagOp::Sar, width, v, count, res);
            }
            result
        }
    };
    cpu.finish(class, cycles, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rol_ror_byte() {
        let r = rotate(0, Width::Byte, 0x81, 1, false);
        assert_eq!(r.res, 0x03);
        assert!(r.cf);
        let r = rotate(1, Width::Byte, 0x01, 1, false);
        assert_eq!(r.res, 0x80);
        assert!(r.cf);
        assert!(r.of);
    }

    #[test]
    fn rcl_rcr_go_through_carry() {
        let r = rotate(2, Width::Byte, 0x80, 1, false);
        assert_eq!(r.res, 0x00);
        assert!(r.cf);
        let r = rotate(3, Width::Byte, 0x00, 1, true);
        assert_eq!(r.res, 0x80);
        assert!(!r.cf);
        // 9-bit rotation returns to the start.
        let r = rotate(2, Width::Byte, 0x5a, 9, true);
        assert_eq!(r.res, 0x5a);
        assert!(r.cf);
    }

    #[test]
    fn dword_rotate_by_31() {
        let r = rotate(0, Width::Dword, 0x0000_0002, 31, false);
        assert_eq!(r.res, 0x0000_0001);
        let r = rotate(3, Width::Dword, 0x0000_0001, 1, false);
        assert_eq!(r.res, 0);
        assert!(r.cf);
    }
}
