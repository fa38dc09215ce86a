//! Control, debug and test registers.
//!
//! CR0/CR3/CR4 images live in the MMU (they drive translation); this module
//! gives them typed views and owns the debug/test register files.

use bitflags::bitflags;

use crate::fault::Fault;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Cr0: u32 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Cr4: u32 {
        const VME = 1 << 0;
        const PVI = 1 << 1;
        const TSD = 1 << 2;
        const DE = 1 << 3;
        const PSE = 1 << 4;
        const PAE = 1 << 5;
        const MCE = 1 << 6;
        const PGE = 1 << 7;
        const PCE = 1 << 8;
        const OSFXSR = 1 << 9;
        const OSXMMEXCPT = 1 << 10;
    }
}

bitflags! {
    /// CPUID leaf 1 EDX feature bits this core can report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuidEdx: u32 {
        const FPU = 1 << 0;
        const VME = 1 << 1;
        const DE = 1 << 2;
        const PSE = 1 << 3;
        const PGE = 1 << 13;
        const MMX = 1 << 23;
        const FXSR = 1 << 24;
        const SSE = 1 << 25;
    }
}

pub const DR6_BD: u32 = 1 << 13;
pub const DR6_BS: u32 = 1 << 14;
pub const DR7_GD: u32 = 1 << 13;

const DR6_RESET: u32 = 0xffff_0ff0;
const DR7_RESET: u32 = 0x0000_0400;

/// DR0-DR3 breakpoint addresses plus DR6 status and DR7 control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugRegs {
    pub dr: [u32; 4],
    pub dr6: u32,
    pub dr7: u32,
}

impl Default for DebugRegs {
    fn default() -> Self {
        Self {
            dr: [0; 4],
            dr6: DR6_RESET,
            dr7: DR7_RESET,
        }
    }
}

impl DebugRegs {
    /// Maps a `MOV DRn` index to a physical register. DR4/DR5 alias DR6/DR7
    /// unless CR4.DE is set, in which case they are undefined.
    fn resolve(idx: u8, cr4_de: bool) -> Result<u8, Fault> {
        match idx & 7 {
            4 | 5 if cr4_de => Err(Fault::InvalidOpcode),
            4 => Ok(6),
            5 => Ok(7),
            n => Ok(n),
        }
    }

    pub fn read(&self, idx: u8, cr4_de: bool) -> Result<u32, Fault> {
        Ok(match Self::resolve(idx, cr4_de)? {
            n @ 0..=3 => self.dr[n as usize],
            6 => self.dr6,
            _ => self.dr7,
        })
    }

    pub fn write(&mut self, idx: u8, value: u32, cr4_de: bool) -> Result<(), Fault> {
        match Self::resolve(idx, cr4_de)? {
            n @ 0..=3 => self.dr[n as usize] = value,
            6 => self.dr6 = value | DR6_RESET,
            _ => self.dr7 = value | DR7_RESET,
        }
        Ok(())
    }

    /// DR7.GD arms a #DB on the next debug-register access.
    #[inline]
    pub fn general_detect(&self) -> bool {
        self.dr7 & DR7_GD != 0
    }
}

/// TR3-TR7 cache/TLB test registers (386/486 only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TestRegs {
    regs: [u32; 8],
}

impl TestRegs {
    fn valid(idx: u8, is_486: bool) -> bool {
        match idx {
            6 | 7 => true,
            3..=5 => is_486,
            _ => false,
        }
    }

    pub fn read(&self, idx: u8, is_486: bool) -> Result<u32, Fault> {
        if !Self::valid(idx, is_486) {
            return Err(Fault::InvalidOpcode);
        }
        Ok(self.regs[idx as usize])
    }

    pub fn write(&mut self, idx: u8, value: u32, is_486: bool) -> Result<(), Fault> {
        if !Self::valid(idx, is_486) {
            return Err(Fault::InvalidOpcode);
        }
        self.regs[idx as usize] = value;
        Ok(())
    }
}
