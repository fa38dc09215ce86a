//! ModRM/SIB effective-address decoding for 16- and 32-bit addressing.

use crate::fault::Fault;
use crate::regs::{Gprs, Width, EBP, EBX, EDI, ESI, ESP};
use crate::segment::SegReg;

/// Decoded r/m operand. Memory operands carry the final segment (override
/// already applied) and the wrapped offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(u8),
    Mem { seg: SegReg, off: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub mod_: u8,
    pub reg: u8,
    pub rm: u8,
    pub operand: Operand,
}

impl ModRm {
    #[inline]
    pub fn is_reg(&self) -> bool {
        self.mod_ == 3
    }
}

/// Decodes the addressing form following `modrm`.
///
/// Displacement and SIB bytes are pulled through `fetch`, so a fetch fault
/// (CS limit, page fault) propagates out of the decoder unchanged.
pub fn decode(
    modrm: u8,
    addr32: bool,
    seg_override: Option<SegReg>,
    gprs: &Gprs,
    mut fetch: impl FnMut() -> Result<u8, Fault>,
) -> Result<ModRm, Fault> {
    let mod_ = modrm >> 6;
    let reg = (modrm >> 3) & 7;
    let rm = modrm & 7;
    if mod_ == 3 {
        return Ok(ModRm {
            mod_,
            reg,
            rm,
            operand: Operand::Reg(rm),
        });
    }

    let (default_seg, off) = if addr32 {
        decode32(mod_, rm, gprs, &mut fetch)?
    } else {
        decode16(mod_, rm, gprs, &mut fetch)?
    };
    Ok(ModRm {
        mod_,
        reg,
        rm,
        operand: Operand::Mem {
            seg: seg_override.unwrap_or(default_seg),
            off,
        },
    })
}

fn fetch_disp(
    bytes: u32,
    fetch: &mut impl FnMut() -> Result<u8, Fault>,
) -> Result<u32, Fault> {
    let mut v = 0u32;
    for i in 0..bytes {
        v |= (fetch()? as u32) << (8 * i);
    }
    Ok(match bytes {
        1 => Width::Byte.sign_extend(v),
        _ => v,
    })
}

fn decode16(
    mod_: u8,
    rm: u8,
    gprs: &Gprs,
    fetch: &mut impl FnMut() -> Result<u8, Fault>,
) -> Result<(SegReg, u32), Fault> {
    let r = |idx| gprs.read(Width::Word, idx);
    let (seg, base) = match rm {
        0 => (SegReg::Ds, r(EBX) + r(ESI)),
        1 => (SegReg::Ds, r(EBX) + r(EDI)),
        2 => (SegReg::Ss, r(EBP) + r(ESI)),
        3 => (SegReg::Ss, r(EBP) + r(EDI)),
        4 => (SegReg::Ds, r(ESI)),
        5 => (SegReg::Ds, r(EDI)),
        6 if mod_ == 0 => (SegReg::Ds, 0),
        6 => (SegReg::Ss, r(EBP)),
        _ => (SegReg::Ds, r(EBX)),
    };
    let disp = match (mod_, rm) {
        (0, 6) => fetch_disp(2, fetch)?,
        (0, _) => 0,
        (1, _) => fetch_disp(1, fetch)?,
        _ => fetch_disp(2, fetch)?,
    };
    Ok((seg, base.wrapping_add(disp) & 0xffff))
}

fn decode32(
    mod_: u8,
    rm: u8,
    gprs: &Gprs,
    fetch: &mut impl FnMut() -> Result<u8, Fault>,
) -> Result<(SegReg, u32), Fault> {
    let (seg, base) = if rm == 4 {
        let sib = fetch()?;
        let scale = sib >> 6;
        let index = (sib >> 3) & 7;
        let base_reg = sib & 7;
        let scaled = if index == 4 {
            0
        } else {
            gprs.get(index) << scale
        };
        let (seg, base) = if base_reg == 5 && mod_ == 0 {
            (SegReg::Ds, fetch_disp(4, fetch)?)
        } else if base_reg == ESP || base_reg == EBP {
            (SegReg::Ss, gprs.get(base_reg))
        } else {
            (SegReg::Ds, gprs.get(base_reg))
        };
        (seg, base.wrapping_add(scaled))
    } else if rm == 5 && mod_ == 0 {
        (SegReg::Ds, 0)
    } else if rm == EBP {
        (SegReg::Ss, gprs.get(rm))
    } else {
        (SegReg::Ds, gprs.get(rm))
    };
    let disp = match (mod_, rm) {
        (0, 5) => fetch_disp(4, fetch)?,
        (0, _) => 0,
        (1, _) => fetch_disp(1, fetch)?,
        _ => fetch_disp(4, fetch)?,
    };
    Ok((seg, base.wrapping_add(disp)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::EAX;

    fn run(bytes: &[u8], addr32: bool, gprs: &Gprs) -> (ModRm, usize) {
        let mut pos = 1;
        let m = decode(bytes[0], addr32, None, gprs, || {
            let b = bytes.get(pos).copied().ok_or(Fault::gp0())?;
            pos += 1;
            Ok(b)
        })
        .unwrap();
        (m, pos)
    }

    #[test]
    fn bp_based_forms_default_to_ss() {
        let mut g = Gprs::new();
        g.set(EBP, 0x100);
        g.set(ESI, 0x10);
        let (m, len) = run(&[0x42, 0xfe], false, &g); // [bp+si-2]
        assert_eq!(len, 2);
        assert_eq!(
            m.operand,
            Operand::Mem {
                seg: SegReg::Ss,
                off: 0x10e
            }
        );
        let (m, _) = run(&[0x06, 0x34, 0x12], false, &g); // [disp16]
        assert_eq!(
            m.operand,
            Operand::Mem {
                seg: SegReg::Ds,
                off: 0x1234
            }
        );
    }

    #[test]
    fn sixteen_bit_offsets_wrap() {
        let mut g = Gprs::new();
        g.set(EBX, 0xffff);
        g.set(ESI, 0x0002);
        let (m, _) = run(&[0x00], false, &g);
        assert_eq!(
            m.operand,
            Operand::Mem {
                seg: SegReg::Ds,
                off: 1
            }
        );
    }

    #[test]
    fn sib_without_base_uses_disp32() {
        let mut g = Gprs::new();
        g.set(EAX, 3);
        // mod=0 rm=4, SIB scale=4 index=eax base=5 -> [eax*4 + disp32]
        let (m, len) = run(&[0x04, 0x85, 0x00, 0x10, 0x00, 0x00], true, &g);
        assert_eq!(len, 6);
        assert_eq!(
            m.operand,
            Operand::Mem {
                seg: SegReg::Ds,
                off: 0x100c
            }
        );
    }

    #[test]
    fn esp_base_defaults_to_ss_and_override_wins() {
        let mut g = Gprs::new();
        g.set(ESP, 0x8000);
        let (m, _) = run(&[0x44, 0x24, 0x04], true, &g); // [esp+4]
        assert_eq!(
            m.operand,
            Operand::Mem {
                seg: SegReg::Ss,
                off: 0x8004
            }
        );
        let m = decode(0x44, true, Some(SegReg::Es), &g, {
            let mut it = [0x24u8, 0x04].into_iter();
            move || it.next().ok_or(Fault::gp0())
        })
        .unwrap();
        assert!(matches!(m.operand, Operand::Mem { seg: SegReg::Es, .. }));
    }

    #[test]
    fn register_form_reads_no_bytes() {
        let g = Gprs::new();
        let (m, len) = run(&[0xc8], true, &g);
        assert_eq!(len, 1);
        assert!(m.is_reg());
        assert_eq!(m.reg, 1);
        assert_eq!(m.operand, Operand::Reg(0));
    }
}
