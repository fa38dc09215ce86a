//! SSE register file and packed-single lane helpers.

use crate::fault::Fault;

pub const XMM_REGS: usize = 8;
/// FXSAVE/FXRSTOR memory image.
pub const FXSAVE_AREA_SIZE: usize = 512;
pub const MXCSR_DEFAULT: u32 = 0x1f80;
/// Writable MXCSR bits on a Pentium III (no DAZ).
pub const MXCSR_MASK: u32 = 0xffbf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmmFile {
    pub regs: [u128; XMM_REGS],
    mxcsr: u32,
}

impl Default for XmmFile {
    fn default() -> Self {
        Self {
            regs: [0; XMM_REGS],
            mxcsr: MXCSR_DEFAULT,
        }
    }
}

impl XmmFile {
    #[inline]
    pub fn mxcsr(&self) -> u32 {
        self.mxcsr
    }

    /// LDMXCSR: reserved bits set raise #GP(0) and leave MXCSR unchanged.
    pub fn load_mxcsr(&mut self, value: u32) -> Result<(), Fault> {
        if value & !MXCSR_MASK != 0 {
            return Err(Fault::gp0());
        }
        self.mxcsr = value;
        Ok(())
    }
}

pub(crate) fn u128_to_f32x4(v: u128) -> [f32; 4] {
    core::array::from_fn(|i| f32::from_bits((v >> (i * 32)) as u32))
}

pub(crate) fn f32x4_to_u128(v: [f32; 4]) -> u128 {
    v.iter()
        .enumerate()
        .fold(0, |acc, (i, lane)| acc | (lane.to_bits() as u128) << (i * 32))
}

/// Packed-single arithmetic selected by the low opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsOp {
    Add,
    Mul,
    Sub,
    Min,
    Max,
    Div,
    Sqrt,
}

fn lane(op: PsOp, a: f32, b: f32) -> f32 {
    match op {
        PsOp::Add => a + b,
        PsOp::Mul => a * b,
        PsOp::Sub => a - b,
        PsOp::Div => a / b,
        // MINPS/MAXPS return the source operand when either input is NaN or
        // both are zero.
        PsOp::Min => {
            if a < b {
                a
            } else {
                b
            }
        }
        PsOp::Max => {
            if a > b {
                a
            } else {
                b
            }
        }
        PsOp::Sqrt => b.sqrt(),
    }
}

pub fn packed_single(op: PsOp, dst: u128, src: u128) -> u128 {
    let (a, b) = (u128_to_f32x4(dst), u128_to_f32x4(src));
    f32x4_to_u128(core::array::from_fn(|i| lane(op, a[i], b[i])))
}
