//! Packed-integer lane arithmetic for the MMX instructions.
//!
//! Everything here is a pure function on 64-bit register images; the
//! handlers in `ops::mmx` take care of register aliasing and operand fetch.

fn u64_to_u8x8(v: u64) -> [u8; 8] {
    v.to_le_bytes()
}

fn u8x8_to_u64(v: [u8; 8]) -> u64 {
    u64::from_le_bytes(v)
}

fn u64_to_u16x4(v: u64) -> [u16; 4] {
    let mut out = [0u16; 4];
    for (i, lane) in out.iter_mut().enumerate() {
        *lane = (v >> (i * 16)) as u16;
    }
    out
}

fn u16x4_to_u64(v: [u16; 4]) -> u64 {
    v.iter()
        .enumerate()
        .fold(0, |acc, (i, &lane)| acc | (lane as u64) << (i * 16))
}

fn u64_to_u32x2(v: u64) -> [u32; 2] {
    [v as u32, (v >> 32) as u32]
}

fn u32x2_to_u64(v: [u32; 2]) -> u64 {
    v[0] as u64 | (v[1] as u64) << 32
}

/// Element width of a packed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    B,
    W,
    D,
    Q,
}

impl Lane {
    fn bits(self) -> u32 {
        match self {
            Lane::B => 8,
            Lane::W => 16,
            Lane::D => 32,
            Lane::Q => 64,
        }
    }
}

/// Applies `f` lane-wise with wrapping semantics at `lane` width.
pub fn map2(lane: Lane, a: u64, b: u64, f: impl Fn(u64, u64) -> u64) -> u64 {
    let bits = lane.bits();
    if bits == 64 {
        return f(a, b);
    }
    let mask = (1u64 << bits) - 1;
    (0..64 / bits).fold(0, |acc, i| {
        let shift = i * bits;
        let r = f((a >> shift) & mask, (b >> shift) & mask) & mask;
        acc | r << shift
    })
}

pub fn padd(lane: Lane, a: u64, b: u64) -> u64 {
    map2(lane, a, b, u64::wrapping_add)
}

pub fn psub(lane: Lane, a: u64, b: u64) -> u64 {
    map2(lane, a, b, u64::wrapping_sub)
}

pub fn padds_b(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u8x8(a), u64_to_u8x8(b));
    u8x8_to_u64(core::array::from_fn(|i| {
        (a[i] as i8).saturating_add(b[i] as i8) as u8
    }))
}

pub fn padds_w(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u16x4(a), u64_to_u16x4(b));
    u16x4_to_u64(core::array::from_fn(|i| {
        (a[i] as i16).saturating_add(b[i] as i16) as u16
    }))
}

pub fn psubs_b(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u8x8(a), u64_to_u8x8(b));
    u8x8_to_u64(core::array::from_fn(|i| {
        (a[i] as i8).saturating_sub(b[i] as i8) as u8
    }))
}

pub fn psubs_w(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u16x4(a), u64_to_u16x4(b));
    u16x4_to_u64(core::array::from_fn(|i| {
        (a[i] as i16).saturating_sub(b[i] as i16) as u16
    }))
}

pub fn paddus_b(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u8x8(a), u64_to_u8x8(b));
    u8x8_to_u64(core::array::from_fn(|i| a[i].saturating_add(b[i])))
}

pub fn paddus_w(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u16x4(a), u64_to_u16x4(b));
    u16x4_to_u64(core::array::from_fn(|i| a[i].saturating_add(b[i])))
}

pub fn psubus_b(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u8x8(a), u64_to_u8x8(b));
    u8x8_to_u64(core::array::from_fn(|i| a[i].saturating_sub(b[i])))
}

pub fn psubus_w(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u16x4(a), u64_to_u16x4(b));
    u16x4_to_u64(core::array::from_fn(|i| a[i].saturating_sub(b[i])))
}

pub fn pmullw(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u16x4(a), u64_to_u16x4(b));
    u16x4_to_u64(core::array::from_fn(|i| {
        ((a[i] as i16 as i32) * (b[i] as i16 as i32)) as u16
    }))
}

pub fn pmulhw(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u16x4(a), u64_to_u16x4(b));
    u16x4_to_u64(core::array::from_fn(|i| {
        (((a[i] as i16 as i32) * (b[i] as i16 as i32)) >> 16) as u16
    }))
}

pub fn pcmpeq(lane: Lane, a: u64, b: u64) -> u64 {
    map2(lane, a, b, |x, y| if x == y { u64::MAX } else { 0 })
}

pub fn pcmpgt(lane: Lane, a: u64, b: u64) -> u64 {
    let bits = lane.bits();
    let sext = move |v: u64| ((v << (64 - bits)) as i64) >> (64 - bits);
    map2(lane, a, b, move |x, y| {
        if sext(x) > sext(y) {
            u64::MAX
        } else {
            0
        }
    })
}

/// Narrows signed words to signed bytes: `a` fills the low half.
pub fn packsswb(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u16x4(a), u64_to_u16x4(b));
    let sat = |w: u16| (w as i16).clamp(i8::MIN as i16, i8::MAX as i16) as i8 as u8;
    u8x8_to_u64(core::array::from_fn(|i| {
        if i < 4 {
            sat(a[i])
        } else {
            sat(b[i - 4])
        }
    }))
}

/// Narrows signed words to unsigned bytes.
pub fn packuswb(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u16x4(a), u64_to_u16x4(b));
    let sat = |w: u16| (w as i16).clamp(0, u8::MAX as i16) as u8;
    u8x8_to_u64(core::array::from_fn(|i| {
        if i < 4 {
            sat(a[i])
        } else {
            sat(b[i - 4])
        }
    }))
}

/// Narrows signed dwords to signed words.
pub fn packssdw(a: u64, b: u64) -> u64 {
    let (a, b) = (u64_to_u32x2(a), u64_to_u32x2(b));
    let sat = |d: u32| (d as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16 as u16;
    u16x4_to_u64([sat(a[0]), sat(a[1]), sat(b[0]), sat(b[1])])
}

/// Interleaves the low halves (`high == false`) or high halves of `a` and `b`.
pub fn punpck(lane: Lane, high: bool, a: u64, b: u64) -> u64 {
    match lane {
        Lane::B => {
            let (a, b) = (u64_to_u8x8(a), u64_to_u8x8(b));
            let base = if high { 4 } else { 0 };
            u8x8_to_u64(core::array::from_fn(|i| {
                let src = if i % 2 == 0 { &a } else { &b };
                src[base + i / 2]
            }))
        }
        Lane::W => {
            let (a, b) = (u64_to_u16x4(a), u64_to_u16x4(b));
            let base = if high { 2 } else { 0 };
            u16x4_to_u64([a[base], b[base], a[base + 1], b[base + 1]])
        }
        Lane::D | Lane::Q => {
            let (a, b) = (u64_to_u32x2(a), u64_to_u32x2(b));
            let i = high as usize;
            u32x2_to_u64([a[i], b[i]])
        }
    }
}

/// Logical left shift; counts at or above the lane width clear the lane.
pub fn psll(lane: Lane, v: u64, count: u64) -> u64 {
    if count >= lane.bits() as u64 {
        return 0;
    }
    map2(lane, v, 0, |x, _| x << count)
}

pub fn psrl(lane: Lane, v: u64, count: u64) -> u64 {
    if count >= lane.bits() as u64 {
        return 0;
    }
    map2(lane, v, 0, |x, _| x >> count)
}

/// Arithmetic right shift; large counts fill each lane with its sign.
pub fn psra(lane: Lane, v: u64, count: u64) -> u64 {
    let bits = lane.bits();
    let count = count.min(bits as u64 - 1) as u32;
    map2(lane, v, 0, move |x, _| {
        let sext = ((x << (64 - bits)) as i64) >> (64 - bits);
        (sext >> count) as u64
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_lane_add() {
        assert_eq!(padd(Lane::B, 0x00ff_00ff, 0x0001_0001), 0x0000_0000);
        assert_eq!(padd(Lane::W, 0xffff, 1), 0);
        assert_eq!(psub(Lane::D, 0, 1), 0xffff_ffff);
    }

    #[test]
    fn saturating_byte_ops() {
        assert_eq!(padds_b(0x7f, 0x01), 0x7f);
        assert_eq!(psubs_b(0x80, 0x01), 0x80);
        assert_eq!(paddus_b(0xff, 0x01), 0xff);
        assert_eq!(psubus_b(0x00, 0x01), 0x00);
    }

    #[test]
    fn pack_clamps_instead_of_wrapping() {
        // 200 as a signed byte target saturates to 127.
        assert_eq!(packsswb(200, 0) & 0xff, 0x7f);
        assert_eq!(packsswb(0xff38, 0) & 0xff, 0x80); // -200
        assert_eq!(packuswb(0xff38, 0) & 0xff, 0x00);
        assert_eq!(packuswb(300, 0) & 0xff, 0xff);
        assert_eq!(packssdw(0x0001_0000, 0) & 0xffff, 0x7fff);
    }

    #[test]
    fn unpack_low_and_high() {
        let a = 0x0706_0504_0302_0100;
        let b = 0x1716_1514_1312_1110;
        assert_eq!(punpck(Lane::B, false, a, b), 0x1303_1202_1101_1000);
        assert_eq!(punpck(Lane::D, true, a, b), 0x1716_1514_0706_0504);
    }

    #[test]
    fn shifts_clear_or_sign_fill() {
        assert_eq!(psll(Lane::W, 0x8001, 1), 0x0002);
        assert_eq!(psrl(Lane::W, 0x8001, 16), 0);
        assert_eq!(psra(Lane::W, 0x8000, 40), 0xffff);
        assert_eq!(psll(Lane::Q, 1, 63), 1 << 63);
    }

    #[test]
    fn compares_are_signed() {
        assert_eq!(pcmpgt(Lane::B, 0x01, 0xff), 0xff);
        assert_eq!(pcmpeq(Lane::W, 0x1234, 0x1234) & 0xffff, 0xffff);
    }
}
