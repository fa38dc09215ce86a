//! Architecturally visible CPU state.
//!
//! Control registers are not here: CR0/CR2/CR3/CR4 live in [`pcx_mmu::Mmu`]
//! because every translation consults them. Interpreter bookkeeping that is
//! not architectural (interrupt shadow, pending events, SMM latches, fetch
//! window) lives next to the state in [`crate::Cpu`].

use crate::control::{DebugRegs, TestRegs};
use crate::fault::Fault;
use crate::flags::Flags;
use crate::fpu::{FpuMmxFile, F80};
use crate::regs::Gprs;
use crate::segment::{SegReg, SegmentCache, TableReg, FLAG_DB};
use crate::sse::{XmmFile, FXSAVE_AREA_SIZE, MXCSR_MASK};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuMode {
    Real,
    Protected,
    Vm86,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    pub gprs: Gprs,
    pub eip: u32,
    /// EIP of the instruction being executed; faults restart from here.
    pub prev_eip: u32,
    pub flags: Flags,
    pub segs: [SegmentCache; 6],
    pub gdtr: TableReg,
    pub idtr: TableReg,
    pub ldtr: SegmentCache,
    pub tr: SegmentCache,
    pub dr: DebugRegs,
    pub test_regs: TestRegs,
    pub halted: bool,
    pub fpu: FpuMmxFile,
    pub xmm: XmmFile,
    mode: CpuMode,
    cpl: u8,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuState {
    /// Power-on state: real mode at F000:FFF0 with CS based at the top of
    /// the 4 GiB space.
    pub fn new() -> Self {
        let mut segs = [SegmentCache::real(0); 6];
        segs[SegReg::Cs.index()] = SegmentCache {
            base: 0xffff_0000,
            ..SegmentCache::real(0xf000)
        };
        Self {
            gprs: Gprs::new(),
            eip: 0xfff0,
            prev_eip: 0xfff0,
            flags: Flags::new(),
            segs,
            gdtr: TableReg {
                base: 0,
                limit: 0xffff,
            },
            idtr: TableReg {
                base: 0,
                limit: 0x3ff,
            },
            ldtr: SegmentCache::default(),
            tr: SegmentCache::default(),
            dr: DebugRegs::default(),
            test_regs: TestRegs::default(),
            halted: false,
            fpu: FpuMmxFile::default(),
            xmm: XmmFile::default(),
            mode: CpuMode::Real,
            cpl: 0,
        }
    }

    #[inline]
    pub fn seg(&self, seg: SegReg) -> &SegmentCache {
        &self.segs[seg.index()]
    }

    #[inline]
    pub fn seg_mut(&mut self, seg: SegReg) -> &mut SegmentCache {
        &mut self.segs[seg.index()]
    }

    #[inline]
    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    #[inline]
    pub fn cpl(&self) -> u8 {
        self.cpl
    }

    pub(crate) fn set_cpl(&mut self, cpl: u8) {
        self.cpl = cpl & 3;
    }

    /// Re-derives the mode from CR0.PE and EFLAGS.VM. CPL follows: 0 in
    /// real mode, 3 in V86, the CS RPL in protected mode.
    pub fn update_mode(&mut self, cr0_pe: bool) {
        self.mode = match (cr0_pe, self.flags.vm()) {
            (false, _) => CpuMode::Real,
            (true, true) => CpuMode::Vm86,
            (true, false) => CpuMode::Protected,
        };
        self.cpl = match self.mode {
            CpuMode::Real => 0,
            CpuMode::Vm86 => 3,
            CpuMode::Protected => self.seg(SegReg::Cs).rpl(),
        };
    }

    #[inline]
    pub fn protected(&self) -> bool {
        self.mode != CpuMode::Real
    }

    /// Default operand/address size of the code segment.
    #[inline]
    pub fn code32(&self) -> bool {
        self.mode == CpuMode::Protected && self.seg(SegReg::Cs).flags & FLAG_DB != 0
    }

    /// Whether SS:ESP is used as a 32-bit pointer.
    #[inline]
    pub fn stack32(&self) -> bool {
        self.mode == CpuMode::Protected && self.seg(SegReg::Ss).big()
    }
}

const FX_MXCSR: usize = 24;
const FX_ST0: usize = 32;
const FX_XMM0: usize = 160;

/// FXSAVE/FXRSTOR images. The x87 instruction and operand pointers are not
/// tracked and save as zero.
impl CpuState {
    /// Builds the 512-byte FXSAVE image. MXCSR and the XMM registers are
    /// only written when `with_sse` (CR4.OSFXSR) is set.
    pub fn fxsave(&self, with_sse: bool) -> [u8; FXSAVE_AREA_SIZE] {
        let mut image = [0u8; FXSAVE_AREA_SIZE];
        let fpu = &self.fpu;
        image[0..2].copy_from_slice(&fpu.fcw.to_le_bytes());
        image[2..4].copy_from_slice(&fpu.status_word().to_le_bytes());
        image[4] = fpu.abridged_tag();
        for i in 0..8u8 {
            let at = FX_ST0 + 16 * i as usize;
            image[at..at + 10].copy_from_slice(&fpu.as_stack(i).to_le_bytes());
        }
        if with_sse {
            image[FX_MXCSR..FX_MXCSR + 4].copy_from_slice(&self.xmm.mxcsr().to_le_bytes());
            image[FX_MXCSR + 4..FX_MXCSR + 8].copy_from_slice(&MXCSR_MASK.to_le_bytes());
            for (i, r) in self.xmm.regs.iter().enumerate() {
                let at = FX_XMM0 + 16 * i;
                image[at..at + 16].copy_from_slice(&r.to_le_bytes());
            }
        }
        image
    }

    /// Loads an FXSAVE image. Reserved MXCSR bits raise #GP(0) before any
    /// register changes.
    pub fn fxrstor(&mut self, image: &[u8; FXSAVE_AREA_SIZE], with_sse: bool) -> Result<(), Fault> {
        if with_sse {
            let mut mxcsr = [0u8; 4];
            mxcsr.copy_from_slice(&image[FX_MXCSR..FX_MXCSR + 4]);
            self.xmm.load_mxcsr(u32::from_le_bytes(mxcsr))?;
            for (i, r) in self.xmm.regs.iter_mut().enumerate() {
                let at = FX_XMM0 + 16 * i;
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&image[at..at + 16]);
                *r = u128::from_le_bytes(bytes);
            }
        }
        let fpu = &mut self.fpu;
        fpu.fcw = u16::from_le_bytes([image[0], image[1]]);
        fpu.set_status_word(u16::from_le_bytes([image[2], image[3]]));
        for i in 0..8u8 {
            let at = FX_ST0 + 16 * i as usize;
            let mut bytes = [0u8; 10];
            bytes.copy_from_slice(&image[at..at + 10]);
            fpu.set_stack_raw(i, F80::from_le_bytes(bytes));
        }
        fpu.set_abridged_tag(image[4]);
        Ok(())
    }
}
