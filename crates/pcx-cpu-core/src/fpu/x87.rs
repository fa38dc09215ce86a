//! x87 stack discipline and exception signalling on top of [`FpuMmxFile`].
//!
//! Masked exceptions only set FSW bits and let the instruction complete with
//! the default result. An unmasked exception sets ES and surfaces as
//! [`Fault::FpuError`] before any register is written.

use super::{
    FpExceptions, FpOrdering, FpuMmxFile, Tag, F80, FCW_EXCEPTION_MASK, FSW_B, FSW_C0, FSW_C1,
    FSW_C2, FSW_C3, FSW_ES, FSW_SF,
};
use crate::fault::Fault;

impl FpuMmxFile {
    fn unmasked(&self, exc: FpExceptions) -> bool {
        exc.bits() & !self.fcw & FCW_EXCEPTION_MASK != 0
    }

    /// Accumulates `exc` into FSW. Returns #MF when any of them is unmasked.
    pub fn signal(&mut self, exc: FpExceptions) -> Result<(), Fault> {
        if exc.is_empty() {
            return Ok(());
        }
        self.set_status_bits(exc.bits(), true);
        if self.unmasked(exc) {
            self.set_status_bits(FSW_ES | FSW_B, true);
            return Err(Fault::FpuError);
        }
        Ok(())
    }

    fn stack_fault(&mut self, overflow: bool) -> Result<(), Fault> {
        self.set_status_bits(FSW_SF, true);
        self.set_status_bits(FSW_C1, overflow);
        self.signal(FpExceptions::INVALID)
    }

    /// Reads `ST(i)`. An empty slot is a stack underflow; when masked the
    /// read yields the indefinite QNaN.
    pub fn st(&mut self, i: u8) -> Result<F80, Fault> {
        if self.stack_tag(i) == Tag::Empty {
            self.stack_fault(false)?;
            return Ok(F80::INDEFINITE);
        }
        Ok(self.as_stack(i))
    }

    /// Pushes `v`. Pushing onto a non-empty slot is a stack overflow; when
    /// masked the indefinite QNaN is pushed instead.
    pub fn push(&mut self, v: F80) -> Result<(), Fault> {
        let v = if self.stack_tag(7) != Tag::Empty {
            self.stack_fault(true)?;
            F80::INDEFINITE
        } else {
            v
        };
        self.dec_top();
        self.set_stack(0, v);
        Ok(())
    }

    /// Pops `ST(0)` without reading it.
    pub fn pop(&mut self) {
        self.free(0);
        self.inc_top();
    }

    /// Signals the result's exceptions, then stores the value to `ST(i)`.
    pub fn commit(&mut self, i: u8, (v, exc): (F80, FpExceptions)) -> Result<(), Fault> {
        self.signal(exc)?;
        self.set_stack(i, v);
        Ok(())
    }

    /// Sets C3/C2/C0 from a comparison (FCOM encoding).
    pub fn set_condition(&mut self, ord: FpOrdering) {
        let (c3, c2, c0) = match ord {
            FpOrdering::Greater => (false, false, false),
            FpOrdering::Less => (false, false, true),
            FpOrdering::Equal => (true, false, false),
            FpOrdering::Unordered => (true, true, true),
        };
        self.set_status_bits(FSW_C3, c3);
        self.set_status_bits(FSW_C2, c2);
        self.set_status_bits(FSW_C0, c0);
        self.set_status_bits(FSW_C1, false);
    }

    /// FNCLEX.
    pub fn clear_exceptions(&mut self) {
        self.set_status_bits(FCW_EXCEPTION_MASK | FSW_SF | FSW_ES | FSW_B, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fpu::{FCW_IM, FSW_IE};

    #[test]
    fn masked_underflow_reads_indefinite() {
        let mut f = FpuMmxFile::default();
        f.set_status_bits(FSW_C1, true);
        assert_eq!(f.st(0), Ok(F80::INDEFINITE));
        let fsw = f.status_word();
        assert_ne!(fsw & FSW_IE, 0);
        assert_ne!(fsw & FSW_SF, 0);
        assert_eq!(fsw & FSW_C1, 0);
        assert_eq!(fsw & FSW_ES, 0);
    }

    #[test]
    fn unmasked_underflow_faults() {
        let mut f = FpuMmxFile::default();
        f.fcw &= !FCW_IM;
        assert_eq!(f.st(0), Err(Fault::FpuError));
        assert_ne!(f.status_word() & FSW_ES, 0);
    }

    #[test]
    fn overflow_on_ninth_push() {
        let mut f = FpuMmxFile::default();
        for _ in 0..8 {
            f.push(F80::ONE).unwrap();
        }
        assert_eq!(f.status_word() & FSW_IE, 0);
        f.push(F80::ZERO).unwrap();
        assert_eq!(f.as_stack(0), F80::INDEFINITE);
        let fsw = f.status_word();
        assert_eq!(fsw & (FSW_IE | FSW_SF | FSW_C1), FSW_IE | FSW_SF | FSW_C1);
    }

    #[test]
    fn unmasked_overflow_leaves_stack_alone() {
        let mut f = FpuMmxFile::default();
        f.fcw &= !FCW_IM;
        for _ in 0..8 {
            f.push(F80::ONE).unwrap();
        }
        let top = f.top();
        assert_eq!(f.push(F80::ZERO), Err(Fault::FpuError));
        assert_eq!(f.top(), top);
    }

    #[test]
    fn push_pop_moves_top() {
        let mut f = FpuMmxFile::default();
        f.push(F80::ONE).unwrap();
        assert_eq!(f.top(), 7);
        assert_eq!(f.st(0), Ok(F80::ONE));
        f.pop();
        assert_eq!(f.top(), 0);
        assert_eq!(f.tag_word(), 0xffff);
    }
}
