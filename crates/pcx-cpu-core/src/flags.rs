//! EFLAGS with lazily evaluated arithmetic flags.
//!
//! ALU handlers record `(op, width, op1, op2, result)` and move on; the six
//! arithmetic flags are only derived when something reads them. Handlers that
//! manipulate an arithmetic flag directly must go through [`Flags::set`],
//! which rebuilds first so stale lazy state cannot leak into the result.

use crate::regs::Width;

pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_RESERVED1: u32 = 1 << 1;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_TF: u32 = 1 << 8;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;
pub const FLAG_IOPL: u32 = 3 << 12;
pub const FLAG_NT: u32 = 1 << 14;
pub const FLAG_RF: u32 = 1 << 16;
pub const FLAG_VM: u32 = 1 << 17;
pub const FLAG_AC: u32 = 1 << 18;
pub const FLAG_ID: u32 = 1 << 21;

pub const ARITH_FLAGS: u32 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;

/// Bits that software can ever observe as set.
const DEFINED_FLAGS: u32 = ARITH_FLAGS
    | FLAG_TF
    | FLAG_IF
    | FLAG_DF
    | FLAG_IOPL
    | FLAG_NT
    | FLAG_RF
    | FLAG_VM
    | FLAG_AC
    | FLAG_ID;

/// The operation whose result the arithmetic flags currently describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    /// Logic ops: CF = OF = AF = 0.
    Zn,
    Add,
    Adc,
    Sub,
    Sbb,
    Inc,
    Dec,
    Shl,
    Shr,
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lazy {
    op: FlagOp,
    width: Width,
    op1: u32,
    op2: u32,
    res: u32,
    carry_in: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    raw: u32,
    lazy: Option<Lazy>,
}

impl Default for Flags {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn parity_even(byte: u32) -> bool {
    (byte as u8).count_ones() % 2 == 0
}

impl Lazy {
    fn cf(&self, raw: u32) -> bool {
        let m = self.width.mask();
        let (op1, op2, res) = (self.op1 & m, self.op2 & m, self.res & m);
        let sign = self.width.sign_bit();
        match self.op {
            FlagOp::Zn => false,
            FlagOp::Add => res < op1,
            FlagOp::Adc => res < op1 || (self.carry_in && res == op1),
            FlagOp::Sub => op1 < op2,
            FlagOp::Sbb => op1 < op2 || (self.carry_in && op1 == op2),
            FlagOp::Inc | FlagOp::Dec => raw & FLAG_CF != 0,
            FlagOp::Shl => (self.op1 << (self.op2 - 1)) & sign != 0,
            FlagOp::Shr => (op1 >> (self.op2 - 1)) & 1 != 0,
            FlagOp::Sar => {
                let sext = self.width.sign_extend(op1) as i32;
                (sext >> (self.op2 - 1)) & 1 != 0
            }
        }
    }

    fn of(&self) -> bool {
        let m = self.width.mask();
        let (op1, op2, res) = (self.op1 & m, self.op2 & m, self.res & m);
        let sign = self.width.sign_bit();
        match self.op {
            FlagOp::Zn | FlagOp::Sar => false,
            FlagOp::Add | FlagOp::Adc | FlagOp::Inc => !(op1 ^ op2) & (op1 ^ res) & sign != 0,
            FlagOp::Sub | FlagOp::Sbb | FlagOp::Dec => (op1 ^ op2) & (op1 ^ res) & sign != 0,
            FlagOp::Shl => (res ^ (self.op1 << (self.op2 - 1))) & sign != 0,
            FlagOp::Shr => self.op2 == 1 && op1 & sign != 0,
        }
    }

    fn af(&self) -> bool {
        match self.op {
            FlagOp::Zn | FlagOp::Shl | FlagOp::Shr | FlagOp::Sar => false,
            _ => (self.op1 ^ self.op2 ^ self.res) & 0x10 != 0,
        }
    }

    fn arith_bits(&self, raw: u32) -> u32 {
        let res = self.res & self.width.mask();
        let mut bits = 0;
        if self.cf(raw) {
            bits |= FLAG_CF;
        }
        if parity_even(res) {
            bits |= FLAG_PF;
        }
        if self.af() {
            bits |= FLAG_AF;
        }
        if res == 0 {
            bits |= FLAG_ZF;
        }
        if res & self.width.sign_bit() != 0 {
            bits |= FLAG_SF;
        }
        if self.of() {
            bits |= FLAG_OF;
        }
        bits
    }
}

impl Flags {
    pub const fn new() -> Self {
        Self {
            raw: FLAG_RESERVED1,
            lazy: None,
        }
    }

    /// Records an ALU result. Shifts pass the (non-zero, masked) count as `op2`.
    #[inline]
    pub fn record(&mut self, op: FlagOp, width: Width, op1: u32, op2: u32, res: u32) {
        debug_assert!(!matches!(op, FlagOp::Adc | FlagOp::Sbb));
        self.lazy = Some(Lazy {
            op,
            width,
            op1,
            op2,
            res,
            carry_in: false,
        });
    }

    /// Records ADC/SBB, which also need the incoming carry.
    #[inline]
    pub fn record_carry(
        &mut self,
        op: FlagOp,
        width: Width,
        op1: u32,
        op2: u32,
        res: u32,
        carry_in: bool,
    ) {
        self.lazy = Some(Lazy {
            op,
            width,
            op1,
            op2,
            res,
            carry_in,
        });
    }

    /// Complete EFLAGS image, evaluating pending lazy state without
    /// committing it.
    #[inline]
    pub fn eflags(&self) -> u32 {
        match self.lazy {
            Some(lazy) => (self.raw & !ARITH_FLAGS) | lazy.arith_bits(self.raw),
            None => self.raw,
        }
    }

    /// Forces the deferred flag computation into the raw image.
    pub fn rebuild(&mut self) {
        self.raw = self.eflags();
        self.lazy = None;
    }

    /// Materializes only CF, keeping the lazy state for the other flags.
    /// INC and DEC call this before recording so the old carry survives.
    pub fn rebuild_cf(&mut self) {
        let cf = self.cf();
        self.raw = (self.raw & !FLAG_CF) | if cf { FLAG_CF } else { 0 };
    }

    /// Replaces the whole image (POPF, IRET, task state restore).
    pub fn set_eflags(&mut self, value: u32) {
        self.raw = (value & DEFINED_FLAGS) | FLAG_RESERVED1;
        self.lazy = None;
    }

    #[inline]
    pub fn get(&self, mask: u32) -> bool {
        self.eflags() & mask != 0
    }

    /// Sets or clears `mask`. Arithmetic bits force a rebuild first.
    pub fn set(&mut self, mask: u32, on: bool) {
        if mask & ARITH_FLAGS != 0 {
            self.rebuild();
        }
        if on {
            self.raw |= mask;
        } else {
            self.raw &= !mask;
        }
    }

    #[inline]
    pub fn cf(&self) -> bool {
        match &self.lazy {
            Some(lazy) => lazy.cf(self.raw),
            None => self.raw & FLAG_CF != 0,
        }
    }

    #[inline]
    pub fn zf(&self) -> bool {
        self.get(FLAG_ZF)
    }

    #[inline]
    pub fn sf(&self) -> bool {
        self.get(FLAG_SF)
    }

    #[inline]
    pub fn of(&self) -> bool {
        self.get(FLAG_OF)
    }

    #[inline]
    pub fn pf(&self) -> bool {
        self.get(FLAG_PF)
    }

    #[inline]
    pub fn df(&self) -> bool {
        self.raw & FLAG_DF != 0
    }

    #[inline]
    pub fn if_(&self) -> bool {
        self.raw & FLAG_IF != 0
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.raw & FLAG_IOPL) >> 12) as u8
    }

    #[inline]
    pub fn vm(&self) -> bool {
        self.raw & FLAG_VM != 0
    }

    /// Evaluates the Jcc/SETcc condition encoded in the low nibble of `cc`.
    pub fn condition(&self, cc: u8) -> bool {
        let f = self.eflags();
        let cf = f & FLAG_CF != 0;
        let zf = f & FLAG_ZF != 0;
        let sf = f & FLAG_SF != 0;
        let of = f & FLAG_OF != 0;
        let pf = f & FLAG_PF != 0;
        let taken = match (cc >> 1) & 7 {
            0 => of,
            1 => cf,
            2 => zf,
            3 => cf || zf,
            4 => sf,
            5 => pf,
            6 => sf != of,
            _ => zf || sf != of,
        };
        taken ^ (cc & 1 != 0)
    }
}
