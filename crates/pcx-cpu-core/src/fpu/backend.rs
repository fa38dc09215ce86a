//! x87 arithmetic back-ends.
//!
//! Both back-ends share the operand classification and special-value rules;
//! they differ only in how finite results are computed. `SoftFloat` is exact
//! to the 64-bit significand under FCW.RC, `Native` rounds through a host
//! `f64`. Results agree whenever the operands and the exact result are
//! representable as `f64`.

use core::cmp::Ordering;

use super::f80::{
    f80_to_f32_bits, f80_to_f64_bits, pack_f80, round, shift_right_sticky, FpClass,
    FpExceptions, FpOrdering, Rounding, Unpacked, EXTENDED, F80,
};
use crate::config::FpuBackendKind;

pub type FpResult = (F80, FpExceptions);

pub trait FpuBackend {
    fn add(&self, a: F80, b: F80, rc: Rounding) -> FpResult;
    fn sub(&self, a: F80, b: F80, rc: Rounding) -> FpResult {
        self.add(a, b.neg(), rc)
    }
    fn mul(&self, a: F80, b: F80, rc: Rounding) -> FpResult;
    fn div(&self, a: F80, b: F80, rc: Rounding) -> FpResult;
    fn sqrt(&self, a: F80, rc: Rounding) -> FpResult;

    fn compare(&self, a: F80, b: F80) -> (FpOrdering, FpExceptions) {
        compare(a, b)
    }

    fn round_to_int(&self, a: F80, rc: Rounding) -> FpResult {
        round_to_int(a, rc)
    }

    fn from_i64(&self, v: i64) -> F80 {
        F80::from_i64(v)
    }

    /// `None` when the rounded value does not fit (the caller stores the
    /// integer indefinite).
    fn to_i64(&self, a: F80, rc: Rounding) -> (Option<i64>, FpExceptions) {
        to_i64(a, rc)
    }

    fn from_f32(&self, bits: u32) -> FpResult {
        widen(F80::from_f32_bits(bits))
    }

    fn from_f64(&self, bits: u64) -> FpResult {
        widen(F80::from_f64_bits(bits))
    }

    fn to_f32(&self, a: F80, rc: Rounding) -> (u32, FpExceptions) {
        let mut exc = FpExceptions::empty();
        let bits = f80_to_f32_bits(a, rc, &mut exc);
        (bits, exc)
    }

    fn to_f64(&self, a: F80, rc: Rounding) -> (u64, FpExceptions) {
        let mut exc = FpExceptions::empty();
        let bits = f80_to_f64_bits(a, rc, &mut exc);
        (bits, exc)
    }
}

pub fn backend_for(kind: FpuBackendKind) -> Box<dyn FpuBackend> {
    match kind {
        FpuBackendKind::SoftFloat => Box::new(SoftFloat),
        FpuBackendKind::Native => Box::new(Native),
    }
}

fn widen(v: F80) -> FpResult {
    // Widening is exact; only a signalling NaN operand is an exception.
    if v.is_signaling_nan() {
        (v.quiet(), FpExceptions::INVALID)
    } else {
        (v, FpExceptions::empty())
    }
}

fn invalid() -> FpResult {
    (F80::INDEFINITE, FpExceptions::INVALID)
}

/// NaN/unsupported operand handling common to every arithmetic op.
fn propagate_nan(a: F80, b: F80) -> Option<FpResult> {
    let (ca, cb) = (a.class(), b.class());
    if ca == FpClass::Unsupported || cb == FpClass::Unsupported {
        return Some(invalid());
    }
    if ca != FpClass::Nan && cb != FpClass::Nan {
        return None;
    }
    let exc = if a.is_signaling_nan() || b.is_signaling_nan() {
        FpExceptions::INVALID
    } else {
        FpExceptions::empty()
    };
    let pick = match (ca, cb) {
        (FpClass::Nan, FpClass::Nan) => {
            if (a.mant << 1) >= (b.mant << 1) {
                a
            } else {
                b
            }
        }
        (FpClass::Nan, _) => a,
        _ => b,
    };
    Some((pick.quiet(), exc))
}

fn denormal_flag(a: F80, b: F80) -> FpExceptions {
    if a.class() == FpClass::Denormal || b.class() == FpClass::Denormal {
        FpExceptions::DENORMAL
    } else {
        FpExceptions::empty()
    }
}

fn finish(u: Unpacked, rc: Rounding, mut exc: FpExceptions) -> FpResult {
    let r = round(u, EXTENDED, rc, &mut exc);
    (pack_f80(r), exc)
}

pub struct SoftFloat;

impl FpuBackend for SoftFloat {
    fn add(&self, a: F80, b: F80, rc: Rounding) -> FpResult {
        if let Some(r) = propagate_nan(a, b) {
            return r;
        }
        let exc = denormal_flag(a, b);
        match (a.class(), b.class()) {
            (FpClass::Infinity, FpClass::Infinity) if a.sign() != b.sign() => return invalid(),
            (FpClass::Infinity, _) => return (a, exc),
            (_, FpClass::Infinity) => return (b, exc),
            (FpClass::Zero, FpClass::Zero) => {
                let sign = if a.sign() == b.sign() {
                    a.sign()
                } else {
                    rc == Rounding::Down
                };
                return (F80::zero(sign), exc);
            }
            (FpClass::Zero, _) => return (b, exc),
            (_, FpClass::Zero) => return (a, exc),
            _ => {}
        }

        let (mut x, mut y) = (Unpacked::from_f80(a), Unpacked::from_f80(b));
        if (y.exp, y.mant) > (x.exp, x.mant) {
            core::mem::swap(&mut x, &mut y);
        }
        // One bit of headroom for the carry.
        let xm = x.mant >> 1;
        let ym = shift_right_sticky(y.mant >> 1, (x.exp - y.exp) as u32);
        let exp = x.exp + 1;
        let (sign, mant) = if x.sign == y.sign {
            (x.sign, xm + ym)
        } else {
            (x.sign, xm - ym)
        };
        if mant == 0 {
            return (F80::zero(rc == Rounding::Down), exc);
        }
        finish(Unpacked { sign, exp, mant }, rc, exc)
    }

    fn mul(&self, a: F80, b: F80, rc: Rounding) -> FpResult {
        if let Some(r) = propagate_nan(a, b) {
            return r;
        }
        let exc = denormal_flag(a, b);
        let sign = a.sign() ^ b.sign();
        match (a.class(), b.class()) {
            (FpClass::Infinity, FpClass::Zero) | (FpClass::Zero, FpClass::Infinity) => {
                return invalid()
            }
            (FpClass::Infinity, _) | (_, FpClass::Infinity) => return (F80::infinity(sign), exc),
            (FpClass::Zero, _) | (_, FpClass::Zero) => return (F80::zero(sign), exc),
            _ => {}
        }
        let (x, y) = (Unpacked::from_f80(a), Unpacked::from_f80(b));
        let product = ((x.mant >> 64) as u64 as u128) * ((y.mant >> 64) as u64 as u128);
        // Both factors carry their leading one at bit 63, so the product has
        // it at bit 126 or 127.
        let (exp, mant) = if product >> 127 != 0 {
            (x.exp + y.exp + 1, product)
        } else {
            (x.exp + y.exp, product << 1)
        };
        finish(Unpacked { sign, exp, mant }, rc, exc)
    }

    fn div(&self, a: F80, b: F80, rc: Rounding) -> FpResult {
        if let Some(r) = propagate_nan(a, b) {
            return r;
        }
        let mut exc = denormal_flag(a, b);
        let sign = a.sign() ^ b.sign();
        match (a.class(), b.class()) {
            (FpClass::Infinity, FpClass::Infinity) | (FpClass::Zero, FpClass::Zero) => {
                return invalid()
            }
            (FpClass::Infinity, _) => return (F80::infinity(sign), exc),
            (_, FpClass::Infinity) => return (F80::zero(sign), exc),
            (FpClass::Zero, _) => return (F80::zero(sign), exc),
            (_, FpClass::Zero) => {
                exc |= FpExceptions::ZERO_DIVIDE;
                return (F80::infinity(sign), exc);
            }
            _ => {}
        }
        let (x, y) = (Unpacked::from_f80(a), Unpacked::from_f80(b));
        let num = (x.mant >> 64) as u128;
        let den = (y.mant >> 64) as u128;
        let q_hi = (num << 64) / den;
        let r_hi = (num << 64) % den;
        let q_lo = (r_hi << 64) / den;
        let r_lo = (r_hi << 64) % den;
        let sticky = (q_lo & 1 != 0 || r_lo != 0) as u128;
        let mant = (q_hi << 63) | (q_lo >> 1) | sticky;
        finish(
            Unpacked {
                sign,
                exp: x.exp - y.exp,
                mant,
            },
            rc,
            exc,
        )
    }

    fn sqrt(&self, a: F80, rc: Rounding) -> FpResult {
        match a.class() {
            FpClass::Unsupported => return invalid(),
            FpClass::Nan => {
                let exc = if a.is_signaling_nan() {
                    FpExceptions::INVALID
                } else {
                    FpExceptions::empty()
                };
                return (a.quiet(), exc);
            }
            FpClass::Zero => return (a, FpExceptions::empty()),
            _ if a.sign() => return invalid(),
            FpClass::Infinity => return (a, FpExceptions::empty()),
            _ => {}
        }
        let exc = denormal_flag(a, a);
        let x = Unpacked::from_f80(a);
        // value = m * 2^e with m a 64-bit integer.
        let mut m = (x.mant >> 64) as u128;
        let mut e = x.exp - 63;
        if e & 1 != 0 {
            m <<= 1;
            e -= 1;
        }
        // Radicand m * 4^K, consumed two bits at a time from the top.
        const K: u32 = 36;
        let m_bits = 128 - m.leading_zeros();
        let total = (m_bits + 2 * K + 1) & !1;
        let bit = |p: u32| -> u128 {
            if p < 2 * K {
                0
            } else {
                (m >> (p - 2 * K)) & 1
            }
        };
        let (mut root, mut rem) = (0u128, 0u128);
        let mut p = total;
        while p >= 2 {
            p -= 2;
            rem = (rem << 2) | (bit(p + 1) << 1) | bit(p);
            let trial = (root << 2) | 1;
            if rem >= trial {
                rem -= trial;
                root = (root << 1) | 1;
            } else {
                root <<= 1;
            }
        }
        let r = 127 - root.leading_zeros() as i32;
        let mant = (root << (127 - r)) | (rem != 0) as u128;
        finish(
            Unpacked {
                sign: false,
                exp: r + e / 2 - K as i32,
                mant,
            },
            rc,
            exc,
        )
    }
}

pub struct Native;

impl Native {
    fn binary(a: F80, b: F80, op: impl FnOnce(f64, f64) -> f64) -> FpResult {
        if let Some(r) = propagate_nan(a, b) {
            return r;
        }
        let mut exc = denormal_flag(a, b);
        let (x, _) = f64_of(a);
        let (y, _) = f64_of(b);
        let r = op(x, y);
        if r.is_nan() {
            return invalid();
        }
        if r.is_infinite() && x.is_finite() && y.is_finite() {
            exc |= if y == 0.0 {
                FpExceptions::ZERO_DIVIDE
            } else {
                FpExceptions::OVERFLOW | FpExceptions::PRECISION
            };
        }
        (F80::from_f64(r), exc)
    }
}

fn f64_of(v: F80) -> (f64, FpExceptions) {
    let mut exc = FpExceptions::empty();
    let bits = f80_to_f64_bits(v, Rounding::Nearest, &mut exc);
    (f64::from_bits(bits), exc)
}

impl FpuBackend for Native {
    fn add(&self, a: F80, b: F80, _rc: Rounding) -> FpResult {
        Self::binary(a, b, |x, y| x + y)
    }

    fn mul(&self, a: F80, b: F80, _rc: Rounding) -> FpResult {
        Self::binary(a, b, |x, y| x * y)
    }

    fn div(&self, a: F80, b: F80, _rc: Rounding) -> FpResult {
        Self::binary(a, b, |x, y| x / y)
    }

    fn sqrt(&self, a: F80, _rc: Rounding) -> FpResult {
        match a.class() {
            FpClass::Unsupported => invalid(),
            FpClass::Nan => (a.quiet(), FpExceptions::empty()),
            FpClass::Zero => (a, FpExceptions::empty()),
            _ if a.sign() => invalid(),
            _ => {
                let (x, _) = f64_of(a);
                (F80::from_f64(x.sqrt()), FpExceptions::empty())
            }
        }
    }
}

pub fn compare(a: F80, b: F80) -> (FpOrdering, FpExceptions) {
    let (ca, cb) = (a.class(), b.class());
    if matches!(ca, FpClass::Nan | FpClass::Unsupported)
        || matches!(cb, FpClass::Nan | FpClass::Unsupported)
    {
        return (FpOrdering::Unordered, FpExceptions::INVALID);
    }
    let exc = denormal_flag(a, b);
    if ca == FpClass::Zero && cb == FpClass::Zero {
        return (FpOrdering::Equal, exc);
    }
    let key = |v: F80| -> (bool, u16, u64) { (v.sign(), v.biased_exp(), v.mant) };
    let (sa, ea, ma) = key(a);
    let (sb, eb, mb) = key(b);
    let ord = match (sa, sb) {
        (false, true) => Ordering::Greater,
        (true, false) => Ordering::Less,
        (false, false) => (ea, ma).cmp(&(eb, mb)),
        (true, true) => (eb, mb).cmp(&(ea, ma)),
    };
    // Zero against a non-zero of the opposite sign is decided by sign alone.
    let ord = if ca == FpClass::Zero {
        if sb {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    } else if cb == FpClass::Zero {
        if sa {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    } else {
        ord
    };
    let ord = match ord {
        Ordering::Less => FpOrdering::Less,
        Ordering::Equal => FpOrdering::Equal,
        Ordering::Greater => FpOrdering::Greater,
    };
    (ord, exc)
}

/// Rounds to an integral magnitude. Returns `(sign, magnitude, inexact)`;
/// magnitudes that do not fit in 64 bits come back as `None`.
fn integral(a: F80, rc: Rounding) -> Option<(bool, u64, bool)> {
    let x = Unpacked::from_f80(a);
    if x.mant == 0 {
        return Some((x.sign, 0, false));
    }
    if x.exp >= 64 {
        return None;
    }
    let (int, rem_bits, frac) = if x.exp < 0 {
        (0u128, 128u32, x.mant)
    } else {
        let shift = 127 - x.exp as u32;
        (x.mant >> shift, shift, x.mant & ((1u128 << shift) - 1))
    };
    let inexact = frac != 0;
    let up = if !inexact {
        false
    } else {
        match rc {
            Rounding::Nearest => {
                if rem_bits == 128 {
                    // |x| < 1: round up only when > 0.5 (or == 0.5 never ties to 1).
                    x.exp == -1 && (x.mant << 1) != 0
                } else {
                    let half = 1u128 << (rem_bits - 1);
                    frac > half || (frac == half && int & 1 != 0)
                }
            }
            Rounding::Down => x.sign,
            Rounding::Up => !x.sign,
            Rounding::Zero => false,
        }
    };
    let int = int + up as u128;
    if int > u64::MAX as u128 {
        return None;
    }
    Some((x.sign, int as u64, inexact))
}

pub fn round_to_int(a: F80, rc: Rounding) -> FpResult {
    match a.class() {
        FpClass::Unsupported => return invalid(),
        FpClass::Nan => return (a.quiet(), FpExceptions::empty()),
        FpClass::Infinity | FpClass::Zero => return (a, FpExceptions::empty()),
        _ => {}
    }
    let x = Unpacked::from_f80(a);
    if x.exp >= 63 {
        return (a, FpExceptions::empty());
    }
    match integral(a, rc) {
        Some((sign, mag, inexact)) => {
            let v = if mag == 0 {
                F80::zero(sign)
            } else {
                let lz = mag.leading_zeros();
                F80 {
                    sign_exp: (16383 + 63 - lz as u16) | if sign { 0x8000 } else { 0 },
                    mant: mag << lz,
                }
            };
            let exc = if inexact {
                FpExceptions::PRECISION
            } else {
                FpExceptions::empty()
            };
            (v, exc)
        }
        None => (a, FpExceptions::empty()),
    }
}

pub fn to_i64(a: F80, rc: Rounding) -> (Option<i64>, FpExceptions) {
    match a.class() {
        FpClass::Nan | FpClass::Infinity | FpClass::Unsupported => {
            return (None, FpExceptions::INVALID)
        }
        _ => {}
    }
    match integral(a, rc) {
        Some((sign, mag, inexact)) => {
            let exc = if inexact {
                FpExceptions::PRECISION
            } else {
                FpExceptions::empty()
            };
            let v = if sign {
                if mag > 1u64 << 63 {
                    return (None, FpExceptions::INVALID);
                }
                (mag as i64).wrapping_neg()
            } else {
                if mag > i64::MAX as u64 {
                    return (None, FpExceptions::INVALID);
                }
                mag as i64
            };
            (Some(v), exc)
        }
        None => (None, FpExceptions::INVALID),
    }
}
