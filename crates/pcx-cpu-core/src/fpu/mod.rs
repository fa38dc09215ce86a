//! x87 register file shared with the MMX registers.
//!
//! One array of eight 80-bit slots backs both views: the x87 stack addresses
//! slots relative to TOP, MMX addresses them by physical index and only uses
//! the low 64 bits. The MMX path must call [`FpuMmxFile::enter_mmx`] once per
//! instruction so stack-relative addressing never desyncs from the flat view.

pub mod backend;
pub mod f80;
mod x87;

pub use backend::{backend_for, FpuBackend, Native, SoftFloat};
pub use f80::{FpClass, FpExceptions, FpOrdering, Rounding, F80};

pub const FCW_DEFAULT: u16 = 0x037f;
/// Exception mask bits IM..PM.
pub const FCW_EXCEPTION_MASK: u16 = 0x3f;
pub const FCW_IM: u16 = 1 << 0;

pub const FSW_IE: u16 = 1 << 0;
pub const FSW_ZE: u16 = 1 << 2;
pub const FSW_SF: u16 = 1 << 6;
pub const FSW_ES: u16 = 1 << 7;
pub const FSW_C0: u16 = 1 << 8;
pub const FSW_C1: u16 = 1 << 9;
pub const FSW_C2: u16 = 1 << 10;
pub const FSW_C3: u16 = 1 << 14;
pub const FSW_TOP_SHIFT: u16 = 11;
pub const FSW_TOP_MASK: u16 = 0b111 << FSW_TOP_SHIFT;
/// Busy mirrors ES on the 387 and later.
pub const FSW_B: u16 = 1 << 15;

pub const TAG_ALL_VALID: u16 = 0x0000;
pub const TAG_ALL_EMPTY: u16 = 0xffff;

const MMX_EXPONENT: u128 = 0xffff << 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Valid = 0b00,
    Zero = 0b01,
    Special = 0b10,
    Empty = 0b11,
}

impl Tag {
    pub fn of(v: F80) -> Self {
        match v.class() {
            FpClass::Normal => Tag::Valid,
            FpClass::Zero => Tag::Zero,
            _ => Tag::Special,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 3 {
            0 => Tag::Valid,
            1 => Tag::Zero,
            2 => Tag::Special,
            _ => Tag::Empty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpuMmxFile {
    regs: [u128; 8],
    tag: u16,
    top: u8,
    pub fcw: u16,
    /// Status word without the TOP field.
    fsw: u16,
}

impl Default for FpuMmxFile {
    fn default() -> Self {
        Self {
            regs: [0; 8],
            tag: TAG_ALL_EMPTY,
            top: 0,
            fcw: FCW_DEFAULT,
            fsw: 0,
        }
    }
}

impl FpuMmxFile {
    #[inline]
    pub fn top(&self) -> u8 {
        self.top
    }

    #[inline]
    pub fn tag_word(&self) -> u16 {
        self.tag
    }

    pub fn set_tag_word(&mut self, tag: u16) {
        self.tag = tag;
    }

    pub fn status_word(&self) -> u16 {
        (self.fsw & !FSW_TOP_MASK) | ((self.top as u16) << FSW_TOP_SHIFT)
    }

    pub fn set_status_word(&mut self, fsw: u16) {
        self.top = ((fsw & FSW_TOP_MASK) >> FSW_TOP_SHIFT) as u8;
        self.fsw = fsw & !FSW_TOP_MASK;
    }

    pub fn set_status_bits(&mut self, mask: u16, on: bool) {
        if on {
            self.fsw |= mask;
        } else {
            self.fsw &= !mask;
        }
    }

    #[inline]
    fn phys(&self, i: u8) -> usize {
        ((self.top + i) & 7) as usize
    }

    /// Tag of a physical slot.
    pub fn tag(&self, phys: usize) -> Tag {
        Tag::from_bits(self.tag >> (2 * (phys & 7)))
    }

    fn set_tag(&mut self, phys: usize, tag: Tag) {
        let shift = 2 * (phys & 7);
        self.tag = (self.tag & !(3 << shift)) | ((tag as u16) << shift);
    }

    /// Tag of `ST(i)`.
    pub fn stack_tag(&self, i: u8) -> Tag {
        self.tag(self.phys(i))
    }

    /// Raw value of `ST(i)`, without any empty-slot check.
    pub fn as_stack(&self, i: u8) -> F80 {
        F80::from_bits(self.regs[self.phys(i)])
    }

    /// Writes `ST(i)` and retags it from the value.
    pub fn set_stack(&mut self, i: u8, v: F80) {
        let phys = self.phys(i);
        self.regs[phys] = v.to_bits();
        self.set_tag(phys, Tag::of(v));
    }

    /// Marks `ST(i)` empty (FFREE).
    pub fn free(&mut self, i: u8) {
        let phys = self.phys(i);
        self.set_tag(phys, Tag::Empty);
    }

    pub(crate) fn dec_top(&mut self) {
        self.top = self.top.wrapping_sub(1) & 7;
    }

    pub(crate) fn inc_top(&mut self) {
        self.top = (self.top + 1) & 7;
    }

    /// Writes `ST(i)` and leaves its tag alone.
    pub(crate) fn set_stack_raw(&mut self, i: u8, v: F80) {
        let phys = self.phys(i);
        self.regs[phys] = v.to_bits();
    }

    /// FXSAVE's one bit per physical slot, set where the slot is not empty.
    pub fn abridged_tag(&self) -> u8 {
        (0..8)
            .filter(|&p| self.tag(p) != Tag::Empty)
            .fold(0, |acc, p| acc | (1u8 << p))
    }

    /// Expands an abridged tag. Occupied slots are reclassified from
    /// their contents.
    pub fn set_abridged_tag(&mut self, abridged: u8) {
        for p in 0..8 {
            let tag = if abridged & (1 << p) == 0 {
                Tag::Empty
            } else {
                Tag::of(F80::from_bits(self.regs[p]))
            };
            self.set_tag(p, tag);
        }
    }

    /// Low 64 bits of physical slot `i`.
    #[inline]
    pub fn as_mmx(&self, i: u8) -> u64 {
        self.regs[(i & 7) as usize] as u64
    }

    /// MMX writes also force the aliased exponent field to all-ones.
    #[inline]
    pub fn set_mmx(&mut self, i: u8, v: u64) {
        self.regs[(i & 7) as usize] = v as u128 | MMX_EXPONENT;
    }

    /// Raw 80-bit image of physical slot `i`.
    pub fn raw(&self, phys: usize) -> u128 {
        self.regs[phys & 7]
    }

    /// Switch to MMX mode: every slot valid, TOP = 0.
    pub fn enter_mmx(&mut self) {
        self.tag = TAG_ALL_VALID;
        self.top = 0;
    }

    /// EMMS: leave MMX mode with every slot empty.
    pub fn emms(&mut self) {
        self.tag = TAG_ALL_EMPTY;
    }

    /// FNINIT. Register contents are left as they were.
    pub fn init(&mut self) {
        self.fcw = FCW_DEFAULT;
        self.fsw = 0;
        self.top = 0;
        self.tag = TAG_ALL_EMPTY;
    }

    pub fn rounding(&self) -> Rounding {
        Rounding::from_control_word(self.fcw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_view_follows_top() {
        let mut f = FpuMmxFile::default();
        f.set_status_word(5 << FSW_TOP_SHIFT);
        f.set_stack(1, F80::ONE);
        assert_eq!(F80::from_bits(f.raw(6)), F80::ONE);
        assert_eq!(f.tag(6), Tag::Valid);
        assert_eq!(f.stack_tag(0), Tag::Empty);
        assert_eq!(f.status_word() >> FSW_TOP_SHIFT, 5);
    }

    #[test]
    fn mmx_view_is_flat_and_sets_exponent() {
        let mut f = FpuMmxFile::default();
        f.set_status_word(3 << FSW_TOP_SHIFT);
        f.enter_mmx();
        f.set_mmx(2, 0x1122_3344_5566_7788);
        assert_eq!(f.top(), 0);
        assert_eq!(f.tag_word(), TAG_ALL_VALID);
        assert_eq!(f.raw(2) >> 64, 0xffff);
        assert_eq!(f.as_stack(2).mant, 0x1122_3344_5566_7788);
        f.emms();
        assert_eq!(f.tag_word(), TAG_ALL_EMPTY);
    }

    #[test]
    fn tags_reflect_value_class() {
        assert_eq!(Tag::of(F80::ZERO), Tag::Zero);
        assert_eq!(Tag::of(F80::infinity(false)), Tag::Special);
        assert_eq!(Tag::of(F80::INDEFINITE), Tag::Special);
        assert_eq!(Tag::of(F80::ONE), Tag::Valid);
    }
}
