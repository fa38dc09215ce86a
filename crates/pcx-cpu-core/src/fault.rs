//! Architectural faults raised by instruction handlers, and the terminal
//! conditions that stop the driver loop.

use pcx_mmu::PageFault;

/// A fault raised while executing one instruction.
///
/// Every fault-capable primitive returns `Result<_, Fault>`; the first fault
/// stops the instruction before any further architectural commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("#DE divide error")]
    DivideError,
    #[error("#DB debug exception")]
    Debug,
    #[error("#BP breakpoint")]
    Breakpoint,
    #[error("#OF overflow")]
    Overflow,
    #[error("#BR bound range exceeded")]
    BoundRange,
    #[error("#UD invalid opcode")]
    InvalidOpcode,
    #[error("#NM device not available")]
    DeviceNotAvailable,
    #[error("#DF double fault")]
    DoubleFault,
    #[error("#TS invalid TSS ({0:#06x})")]
    InvalidTss(u16),
    #[error("#NP segment not present ({0:#06x})")]
    SegmentNotPresent(u16),
    #[error("#SS stack segment fault ({0:#06x})")]
    StackSegment(u16),
    #[error("#GP general protection ({0:#06x})")]
    GeneralProtection(u16),
    #[error("#PF page fault at {addr:#010x} (error code {error_code:#x})")]
    PageFault { addr: u32, error_code: u32 },
    #[error("#MF x87 floating-point error")]
    FpuError,
    #[error("#XM SIMD floating-point exception")]
    SimdFloatingPoint,
}

/// Exception classes used for double-fault escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

impl Fault {
    #[inline]
    pub const fn gp0() -> Self {
        Fault::GeneralProtection(0)
    }

    pub const fn vector(self) -> u8 {
        match self {
            Fault::DivideError => 0,
            Fault::Debug => 1,
            Fault::Breakpoint => 3,
            Fault::Overflow => 4,
            Fault::BoundRange => 5,
            Fault::InvalidOpcode => 6,
            Fault::DeviceNotAvailable => 7,
            Fault::DoubleFault => 8,
            Fault::InvalidTss(_) => 10,
            Fault::SegmentNotPresent(_) => 11,
            Fault::StackSegment(_) => 12,
            Fault::GeneralProtection(_) => 13,
            Fault::PageFault { .. } => 14,
            Fault::FpuError => 16,
            Fault::SimdFloatingPoint => 19,
        }
    }

    /// The error code pushed on delivery, if this vector pushes one.
    pub const fn error_code(self) -> Option<u32> {
        match self {
            Fault::DoubleFault => Some(0),
            Fault::InvalidTss(sel)
            | Fault::SegmentNotPresent(sel)
            | Fault::StackSegment(sel)
            | Fault::GeneralProtection(sel) => Some(sel as u32),
            Fault::PageFault { error_code, .. } => Some(error_code),
            _ => None,
        }
    }

    pub const fn class(self) -> FaultClass {
        match self {
            Fault::DivideError
            | Fault::InvalidTss(_)
            | Fault::SegmentNotPresent(_)
            | Fault::StackSegment(_)
            | Fault::GeneralProtection(_) => FaultClass::Contributory,
            Fault::PageFault { .. } => FaultClass::PageFault,
            Fault::DoubleFault => FaultClass::DoubleFault,
            _ => FaultClass::Benign,
        }
    }

    /// Traps report the address of the next instruction instead of the
    /// faulting one.
    pub const fn is_trap(self) -> bool {
        matches!(self, Fault::Breakpoint | Fault::Overflow)
    }
}

impl From<PageFault> for Fault {
    fn from(pf: PageFault) -> Self {
        Fault::PageFault {
            addr: pf.addr,
            error_code: pf.error_code,
        }
    }
}

/// Whether a fault raised while delivering `first` escalates to #DF.
pub fn escalates_to_double_fault(first: FaultClass, second: FaultClass) -> bool {
    use FaultClass as C;
    matches!(
        (first, second),
        (C::Contributory, C::Contributory) | (C::PageFault, C::Contributory | C::PageFault)
    )
}

/// Conditions that stop the machine rather than being delivered to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CpuExit {
    #[error("triple fault")]
    TripleFault,
    #[error("processor shutdown")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_and_error_codes() {
        assert_eq!(Fault::gp0().vector(), 13);
        assert_eq!(Fault::gp0().error_code(), Some(0));
        assert_eq!(Fault::InvalidOpcode.error_code(), None);
        let pf: Fault = PageFault {
            addr: 0x1234,
            error_code: 0b110,
        }
        .into();
        assert_eq!(pf.vector(), 14);
        assert_eq!(pf.error_code(), Some(0b110));
    }

    #[test]
    fn double_fault_matrix() {
        use FaultClass as C;
        assert!(escalates_to_double_fault(C::Contributory, C::Contributory));
        assert!(!escalates_to_double_fault(C::Contributory, C::PageFault));
        assert!(escalates_to_double_fault(C::PageFault, C::PageFault));
        assert!(escalates_to_double_fault(C::PageFault, C::Contributory));
        assert!(!escalates_to_double_fault(C::Benign, C::Contributory));
    }
}
