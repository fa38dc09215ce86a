//! 80-bit extended-precision values and the exact unpack/round/pack helpers
//! shared by both arithmetic back-ends.

use bitflags::bitflags;

bitflags! {
    /// x87 exception flags, laid out as in FSW bits 0-5.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FpExceptions: u16 {
        const INVALID = 1 << 0;
        const DENORMAL = 1 << 1;
        const ZERO_DIVIDE = 1 << 2;
        const OVERFLOW = 1 << 3;
        const UNDERFLOW = 1 << 4;
        const PRECISION = 1 << 5;
    }
}

/// FCW.RC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rounding {
    #[default]
    Nearest,
    Down,
    Up,
    Zero,
}

impl Rounding {
    pub fn from_control_word(fcw: u16) -> Self {
        match (fcw >> 10) & 3 {
            0 => Rounding::Nearest,
            1 => Rounding::Down,
            2 => Rounding::Up,
            _ => Rounding::Zero,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpClass {
    Zero,
    Normal,
    Denormal,
    Infinity,
    Nan,
    /// Pseudo-denormals/unnormals/pseudo-infinities: invalid operands on 387+.
    Unsupported,
}

/// Result of a floating-point comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpOrdering {
    Less,
    Equal,
    Greater,
    Unordered,
}

/// An x87 extended-precision value: sign + 15-bit exponent + explicit
/// 64-bit significand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct F80 {
    pub sign_exp: u16,
    pub mant: u64,
}

const EXP_BIAS: i32 = 16383;
const EXP_MAX: u16 = 0x7fff;
const INT_BIT: u64 = 1 << 63;

impl F80 {
    pub const ZERO: F80 = F80 { sign_exp: 0, mant: 0 };
    pub const ONE: F80 = F80 {
        sign_exp: 0x3fff,
        mant: INT_BIT,
    };
    /// Default QNaN written on a masked invalid operation.
    pub const INDEFINITE: F80 = F80 {
        sign_exp: 0xffff,
        mant: 0xc000_0000_0000_0000,
    };

    #[inline]
    pub const fn from_bits(bits: u128) -> Self {
        Self {
            sign_exp: (bits >> 64) as u16,
            mant: bits as u64,
        }
    }

    #[inline]
    pub const fn to_bits(self) -> u128 {
        ((self.sign_exp as u128) << 64) | self.mant as u128
    }

    /// Little-endian 10-byte memory image.
    pub fn to_le_bytes(self) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[..8].copy_from_slice(&self.mant.to_le_bytes());
        out[8..].copy_from_slice(&self.sign_exp.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: [u8; 10]) -> Self {
        let mut mant = [0u8; 8];
        mant.copy_from_slice(&bytes[..8]);
        Self {
            mant: u64::from_le_bytes(mant),
            sign_exp: u16::from_le_bytes([bytes[8], bytes[9]]),
        }
    }

    #[inline]
    pub const fn sign(self) -> bool {
        self.sign_exp & 0x8000 != 0
    }

    #[inline]
    pub const fn biased_exp(self) -> u16 {
        self.sign_exp & EXP_MAX
    }

    #[inline]
    pub const fn neg(self) -> Self {
        Self {
            sign_exp: self.sign_exp ^ 0x8000,
            mant: self.mant,
        }
    }

    #[inline]
    pub const fn abs(self) -> Self {
        Self {
            sign_exp: self.sign_exp & EXP_MAX,
            mant: self.mant,
        }
    }

    pub fn class(self) -> FpClass {
        let exp = self.biased_exp();
        let int = self.mant & INT_BIT != 0;
        match exp {
            0 if self.mant == 0 => FpClass::Zero,
            0 if int => FpClass::Unsupported,
            0 => FpClass::Denormal,
            EXP_MAX if !int => FpClass::Unsupported,
            EXP_MAX if self.mant << 1 == 0 => FpClass::Infinity,
            EXP_MAX => FpClass::Nan,
            _ if !int => FpClass::Unsupported,
            _ => FpClass::Normal,
        }
    }

    #[inline]
    pub fn is_nan(self) -> bool {
        self.class() == FpClass::Nan
    }

    #[inline]
    pub fn is_signaling_nan(self) -> bool {
        self.is_nan() && self.mant & (1 << 62) == 0
    }

    #[inline]
    pub fn quiet(self) -> Self {
        Self {
            sign_exp: self.sign_exp,
            mant: self.mant | (1 << 62),
        }
    }

    pub fn infinity(sign: bool) -> Self {
        Self {
            sign_exp: EXP_MAX | if sign { 0x8000 } else { 0 },
            mant: INT_BIT,
        }
    }

    pub fn zero(sign: bool) -> Self {
        Self {
            sign_exp: if sign { 0x8000 } else { 0 },
            mant: 0,
        }
    }

    /// Exact conversion from a 64-bit integer.
    pub fn from_i64(v: i64) -> Self {
        if v == 0 {
            return Self::ZERO;
        }
        let sign = v < 0;
        let mag = v.unsigned_abs();
        let lz = mag.leading_zeros();
        Self {
            sign_exp: (EXP_BIAS as u16 + 63 - lz as u16) | if sign { 0x8000 } else { 0 },
            mant: mag << lz,
        }
    }

    /// Exact widening from an IEEE double image.
    pub fn from_f64_bits(bits: u64) -> Self {
        from_ieee(bits, 52, 11)
    }

    /// Exact widening from an IEEE single image.
    pub fn from_f32_bits(bits: u32) -> Self {
        from_ieee(bits as u64, 23, 8)
    }

    pub fn from_f64(v: f64) -> Self {
        Self::from_f64_bits(v.to_bits())
    }
}

fn from_ieee(bits: u64, frac_bits: u32, exp_bits: u32) -> F80 {
    let sign = (bits >> (frac_bits + exp_bits)) & 1 != 0;
    let exp_max = (1u64 << exp_bits) - 1;
    let bias = (exp_max >> 1) as i32;
    let exp = (bits >> frac_bits) & exp_max;
    let frac = bits & ((1u64 << frac_bits) - 1);
    let sign_bit = if sign { 0x8000 } else { 0 };

    if exp == exp_max {
        return F80 {
            sign_exp: EXP_MAX | sign_bit,
            mant: INT_BIT | (frac << (63 - frac_bits)),
        };
    }
    if exp == 0 {
        if frac == 0 {
            return F80::zero(sign);
        }
        let lz = frac.leading_zeros() as i32;
        // Value = frac * 2^(1 - bias - frac_bits); normalise to bit 63.
        let e = 1 - bias - frac_bits as i32 + (63 - lz);
        return F80 {
            sign_exp: (e + EXP_BIAS) as u16 | sign_bit,
            mant: frac << lz,
        };
    }
    let e = exp as i32 - bias;
    F80 {
        sign_exp: (e + EXP_BIAS) as u16 | sign_bit,
        mant: INT_BIT | (frac << (63 - frac_bits)),
    }
}

/// A finite non-zero value `(-1)^sign * mant * 2^(exp - 127)` with bit 127 of
/// `mant` set after normalisation. Zero is `mant == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Unpacked {
    pub sign: bool,
    pub exp: i32,
    pub mant: u128,
}

impl Unpacked {
    pub fn normalize(mut self) -> Self {
        if self.mant != 0 {
            let lz = self.mant.leading_zeros();
            self.mant <<= lz;
            self.exp -= lz as i32;
        }
        self
    }

    /// Unpacks a finite value (zero, normal or denormal).
    pub fn from_f80(v: F80) -> Self {
        let biased = v.biased_exp() as i32;
        let exp = if biased == 0 { 1 - EXP_BIAS } else { biased - EXP_BIAS };
        Self {
            sign: v.sign(),
            exp,
            mant: (v.mant as u128) << 64,
        }
        .normalize()
    }
}

#[inline]
pub(crate) fn shift_right_sticky(m: u128, shift: u32) -> u128 {
    if shift == 0 {
        m
    } else if shift >= 128 {
        (m != 0) as u128
    } else {
        let lost = m & ((1u128 << shift) - 1);
        (m >> shift) | (lost != 0) as u128
    }
}

/// Target format for rounding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Format {
    /// Significand bits including the integer bit.
    pub precision: u32,
    pub emin: i32,
    pub emax: i32,
}

pub(crate) const EXTENDED: Format = Format {
    precision: 64,
    emin: 1 - EXP_BIAS,
    emax: EXP_BIAS,
};
pub(crate) const DOUBLE: Format = Format {
    precision: 53,
    emin: -1022,
    emax: 1023,
};
pub(crate) const SINGLE: Format = Format {
    precision: 24,
    emin: -126,
    emax: 127,
};

/// A rounded result: `significand * 2^(exp - precision + 1)`; denormals have
/// the integer bit clear and `exp == emin`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Rounded {
    Finite {
        sign: bool,
        exp: i32,
        significand: u64,
    },
    Infinity(bool),
    MaxFinite(bool),
}

fn round_increment(sign: bool, lsb: bool, rem: u128, half: u128, rc: Rounding) -> bool {
    if rem == 0 {
        return false;
    }
    match rc {
        Rounding::Nearest => rem > half || (rem == half && lsb),
        Rounding::Down => sign,
        Rounding::Up => !sign,
        Rounding::Zero => false,
    }
}

/// Rounds `u` to `fmt` under `rc`, accumulating exceptions.
pub(crate) fn round(u: Unpacked, fmt: Format, rc: Rounding, exc: &mut FpExceptions) -> Rounded {
    let u = u.normalize();
    if u.mant == 0 {
        return Rounded::Finite {
            sign: u.sign,
            exp: fmt.emin,
            significand: 0,
        };
    }

    let mut exp = u.exp;
    let mut mant = u.mant;
    let tiny = exp < fmt.emin;
    if tiny {
        mant = shift_right_sticky(mant, (fmt.emin - exp) as u32);
        exp = fmt.emin;
    }

    let drop = 128 - fmt.precision;
    let mut sig = mant >> drop;
    let rem = mant & ((1u128 << drop) - 1);
    let half = 1u128 << (drop - 1);
    if rem != 0 {
        *exc |= FpExceptions::PRECISION;
        if tiny {
            *exc |= FpExceptions::UNDERFLOW;
        }
    }
    if round_increment(u.sign, sig & 1 != 0, rem, half, rc) {
        sig += 1;
        if sig == 1u128 << fmt.precision {
            sig >>= 1;
            exp += 1;
        }
    }

    if exp > fmt.emax {
        *exc |= FpExceptions::OVERFLOW | FpExceptions::PRECISION;
        let to_inf = match rc {
            Rounding::Nearest => true,
            Rounding::Down => u.sign,
            Rounding::Up => !u.sign,
            Rounding::Zero => false,
        };
        return if to_inf {
            Rounded::Infinity(u.sign)
        } else {
            Rounded::MaxFinite(u.sign)
        };
    }

    Rounded::Finite {
        sign: u.sign,
        exp,
        significand: sig as u64,
    }
}

pub(crate) fn pack_f80(r: Rounded) -> F80 {
    match r {
        Rounded::Infinity(sign) => F80::infinity(sign),
        Rounded::MaxFinite(sign) => F80 {
            sign_exp: (EXP_MAX - 1) | if sign { 0x8000 } else { 0 },
            mant: u64::MAX,
        },
        Rounded::Finite {
            sign,
            exp,
            significand,
        } => {
            let biased = if significand & INT_BIT != 0 {
                (exp + EXP_BIAS) as u16
            } else {
                0
            };
            F80 {
                sign_exp: biased | if sign { 0x8000 } else { 0 },
                mant: significand,
            }
        }
    }
}

/// Packs into an IEEE image with `frac_bits` fraction bits and `exp_bits`
/// exponent bits.
pub(crate) fn pack_ieee(r: Rounded, frac_bits: u32, exp_bits: u32) -> u64 {
    let exp_max = (1u64 << exp_bits) - 1;
    let bias = (exp_max >> 1) as i32;
    let sign_bit = |s: bool| (s as u64) << (frac_bits + exp_bits);
    match r {
        Rounded::Infinity(sign) => sign_bit(sign) | (exp_max << frac_bits),
        Rounded::MaxFinite(sign) => {
            sign_bit(sign) | ((exp_max - 1) << frac_bits) | ((1u64 << frac_bits) - 1)
        }
        Rounded::Finite {
            sign,
            exp,
            significand,
        } => {
            let frac = significand & ((1u64 << frac_bits) - 1);
            let biased = if significand >> frac_bits != 0 {
                (exp + bias) as u64
            } else {
                0
            };
            sign_bit(sign) | (biased << frac_bits) | frac
        }
    }
}

/// Narrows to IEEE double under `rc`.
pub(crate) fn f80_to_f64_bits(v: F80, rc: Rounding, exc: &mut FpExceptions) -> u64 {
    narrow(v, rc, exc, DOUBLE, 52, 11)
}

pub(crate) fn f80_to_f32_bits(v: F80, rc: Rounding, exc: &mut FpExceptions) -> u32 {
    narrow(v, rc, exc, SINGLE, 23, 8) as u32
}

fn narrow(v: F80, rc: Rounding, exc: &mut FpExceptions, fmt: Format, frac_bits: u32, exp_bits: u32) -> u64 {
    let exp_max = (1u64 << exp_bits) - 1;
    let sign_bit = (v.sign() as u64) << (frac_bits + exp_bits);
    match v.class() {
        FpClass::Infinity => sign_bit | (exp_max << frac_bits),
        FpClass::Nan => {
            if v.is_signaling_nan() {
                *exc |= FpExceptions::INVALID;
            }
            let frac = (v.mant << 1) >> (64 - frac_bits);
            sign_bit | (exp_max << frac_bits) | frac | (1 << (frac_bits - 1))
        }
        FpClass::Unsupported => {
            *exc |= FpExceptions::INVALID;
            (exp_max << frac_bits) | (1 << (frac_bits - 1)) | (1 << (frac_bits + exp_bits))
        }
        _ => pack_ieee(round(Unpacked::from_f80(v), fmt, rc, exc), frac_bits, exp_bits),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f64_widening_is_exact() {
        for v in [1.0f64, -2.5, 0.1, 1e-310, f64::MAX, f64::MIN_POSITIVE] {
            let wide = F80::from_f64(v);
            let mut exc = FpExceptions::empty();
            let back = f80_to_f64_bits(wide, Rounding::Nearest, &mut exc);
            assert_eq!(f64::from_bits(back), v);
            assert!(exc.is_empty(), "{v}: {exc:?}");
        }
    }

    #[test]
    fn classification() {
        assert_eq!(F80::ZERO.class(), FpClass::Zero);
        assert_eq!(F80::ONE.class(), FpClass::Normal);
        assert_eq!(F80::INDEFINITE.class(), FpClass::Nan);
        assert_eq!(F80::infinity(true).class(), FpClass::Infinity);
        assert_eq!(
            F80 {
                sign_exp: 0x3fff,
                mant: 1
            }
            .class(),
            FpClass::Unsupported
        );
    }

    #[test]
    fn narrowing_rounds_per_control() {
        // 1 + 2^-60 is exact in F80 but not in f64.
        let v = F80 {
            sign_exp: 0x3fff,
            mant: INT_BIT | (1 << 3),
        };
        let mut exc = FpExceptions::empty();
        assert_eq!(f64::from_bits(f80_to_f64_bits(v, Rounding::Nearest, &mut exc)), 1.0);
        assert!(exc.contains(FpExceptions::PRECISION));
        let up = f64::from_bits(f80_to_f64_bits(v, Rounding::Up, &mut exc));
        assert_eq!(up, 1.0 + f64::EPSILON);
    }

    #[test]
    fn integer_conversion() {
        assert_eq!(F80::from_i64(1), F80::ONE);
        assert_eq!(F80::from_i64(-1), F80::ONE.neg());
        assert_eq!(F80::from_i64(i64::MIN).mant, INT_BIT);
    }
}
