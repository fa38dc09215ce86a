//! Cyrix System Management Mode.
//!
//! Configuration registers are reached through the index/data port pair at
//! 0x22/0x23. SMM entry saves a small header just below SMHR (physical
//! addresses, written before paging is switched off):
//!
//! | SMHR - | contents                     |
//! |--------|------------------------------|
//! | 0x04   | DR7                          |
//! | 0x08   | EFLAGS                       |
//! | 0x0c   | CR0                          |
//! | 0x10   | EIP of the current insn      |
//! | 0x14   | EIP of the next insn         |
//! | 0x18   | CS selector, CPL in bit 21   |
//! | 0x20   | CS descriptor (8 bytes)      |
//! | 0x24   | reserved, written as zero    |

use pcx_mmu::MemoryBus;

use crate::bus::Bus;
use crate::cpu::Cpu;
use crate::regs::Width;
use crate::segment::{Descriptor, SegReg, SegmentCache};

pub const CYRIX_INDEX_PORT: u16 = 0x22;
pub const CYRIX_DATA_PORT: u16 = 0x23;

pub const CCR0: u8 = 0xc0;
pub const CCR1: u8 = 0xc1;
pub const CCR2: u8 = 0xc2;
pub const CCR3: u8 = 0xc3;
pub const SMAR0: u8 = 0xcd;
pub const SMAR1: u8 = 0xce;
pub const SMAR2: u8 = 0xcf;
/// Device identification registers.
pub const DIR0: u8 = 0xfe;
pub const DIR1: u8 = 0xff;

pub const CCR1_USE_SMI: u8 = 1 << 1;
pub const CCR1_SMAC: u8 = 1 << 2;
pub const CCR1_SM3: u8 = 1 << 3;

/// 6x86MX device ID (DIR0) and stepping (DIR1).
const DEVICE_ID: [u8; 2] = [0x51, 0x08];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmmState {
    index: u8,
    ccr: [u8; 4],
    smar: [u8; 3],
    /// Header address; `None` until first computed from SMAR.
    smhr: Option<u32>,
    in_smm: bool,
    smi_pending: bool,
    smi_latched: bool,
}

impl Default for SmmState {
    fn default() -> Self {
        Self {
            index: 0,
            ccr: [0; 4],
            smar: [0; 3],
            smhr: None,
            in_smm: false,
            smi_pending: false,
            smi_latched: false,
        }
    }
}

impl SmmState {
    #[inline]
    pub fn in_smm(&self) -> bool {
        self.in_smm
    }

    #[inline]
    pub fn ccr1(&self) -> u8 {
        self.ccr[1]
    }

    /// Both SMAC and USE_SMI: SMM-only instructions are usable outside SMM.
    fn smac(&self) -> bool {
        self.ccr[1] & CCR1_SMAC != 0
    }

    /// SMM address region base.
    pub fn smar_base(&self) -> u32 {
        (self.smar[0] as u32) << 24 | (self.smar[1] as u32) << 16 | ((self.smar[2] & 0xf0) as u32) << 8
    }

    /// SMM address region size in bytes: 0 disables, 1..=14 select
    /// 4 KiB << (n - 1), 15 selects 4 GiB.
    pub fn smar_size(&self) -> u64 {
        match self.smar[2] & 0xf {
            0 => 0,
            0xf => 1 << 32,
            n => 0x1000u64 << (n - 1),
        }
    }

    pub fn smhr(&self) -> u32 {
        self.smhr
            .unwrap_or_else(|| (self.smar_base() as u64 + self.smar_size()) as u32)
    }

    pub fn set_smhr(&mut self, addr: u32) {
        self.smhr = Some(addr);
    }

    pub(crate) fn raise(&mut self) {
        if self.in_smm {
            self.smi_latched = true;
        } else {
            self.smi_pending = true;
        }
    }

    pub fn smi_latched(&self) -> bool {
        self.smi_latched
    }

    pub(crate) fn smi_ready(&mut self) -> bool {
        if self.smi_pending && !self.in_smm {
            self.smi_pending = false;
            return true;
        }
        false
    }

    pub fn read_port(&mut self, port: u16) -> u8 {
        if port == CYRIX_INDEX_PORT {
            return 0xff;
        }
        match self.index {
            CCR0..=CCR3 => self.ccr[(self.index - CCR0) as usize],
            SMAR0..=SMAR2 => self.smar[(self.index - SMAR0) as usize],
            DIR0 => DEVICE_ID[0],
            DIR1 => DEVICE_ID[1],
            _ => 0xff,
        }
    }

    pub fn write_port(&mut self, port: u16, value: u8) {
        if port == CYRIX_INDEX_PORT {
            self.index = value;
            return;
        }
        match self.index {
            CCR0..=CCR3 => self.ccr[(self.index - CCR0) as usize] = value,
            SMAR0..=SMAR2 => {
                self.smar[(self.index - SMAR0) as usize] = value;
                self.smhr = None;
            }
            _ => {}
        }
    }
}

impl<B: Bus> Cpu<B> {
    /// Whether SVDC-class instructions may execute.
    pub(crate) fn smm_instructions_allowed(&self) -> bool {
        self.smm.in_smm || (self.smm.smac() && self.smm.ccr[1] & CCR1_USE_SMI != 0)
    }

    /// Saves the SMM header and switches to the SMM execution environment.
    pub fn enter_smm(&mut self) {
        let smhr = self.smm.smhr();
        self.smm.set_smhr(smhr);
        self.state.flags.rebuild();

        let cs = *self.state.seg(SegReg::Cs);
        let header = [
            self.state.dr.dr7,
            self.state.flags.eflags(),
            self.mmu.cr0(),
            self.state.prev_eip,
            self.state.eip,
            cs.selector as u32 | (self.state.cpl() as u32) << 21,
        ];
        let top = smhr as u64;
        for (i, v) in header.iter().enumerate() {
            self.bus.write_u32(top - 4 * (i as u64 + 1), *v);
        }
        self.bus.write_u64(top - 0x20, cs.to_descriptor().0);
        self.bus.write_u32(top - 0x24, 0);

        self.smm.in_smm = true;
        self.bus.smram_remap(true);

        let kind = self.mmu.set_cr0(self.mmu.cr0() & !0x8000_000d);
        self.after_flush(kind);
        self.mmu.set_cr4(0);
        self.state.flags.set_eflags(0x2);
        self.state.dr.dr7 = 0x400;

        let base = self.smm.smar_base();
        *self.state.seg_mut(SegReg::Cs) = SegmentCache {
            selector: (base >> 4) as u16,
            base,
            limit: u32::MAX,
            access: 0x93,
            flags: 0x80,
            valid: true,
        };
        self.state.eip = 0;
        self.state.halted = false;
        self.state.update_mode(false);
        self.invalidate_fetch_window();
        self.flush_prefetch();
        tracing::info!(smhr = format_args!("{smhr:#010x}"), base = format_args!("{base:#010x}"), "entered SMM");
    }

    /// RSM: restores the header and leaves SMM. A latched SMI re-enters at
    /// once.
    pub(crate) fn leave_smm(&mut self) {
        let top = self.smm.smhr() as u64;
        let dr7 = self.bus.read_u32(top - 0x04);
        let eflags = self.bus.read_u32(top - 0x08);
        let cr0 = self.bus.read_u32(top - 0x0c);
        let next_eip = self.bus.read_u32(top - 0x14);
        let cs_word = self.bus.read_u32(top - 0x18);
        let cs_desc = Descriptor(self.bus.read_u64(top - 0x20));

        self.state.dr.dr7 = dr7;
        self.state.flags.set_eflags(eflags);
        let kind = self.mmu.set_cr0(cr0);
        self.after_flush(kind);
        *self.state.seg_mut(SegReg::Cs) = SegmentCache::from_descriptor(cs_word as u16, cs_desc);
        self.state.eip = next_eip;

        self.smm.in_smm = false;
        self.bus.smram_remap(false);
        self.state.update_mode(cr0 & 1 != 0);
        if self.state.protected() && !self.state.flags.vm() {
            self.state.set_cpl(((cs_word >> 21) & 3) as u8);
        }
        self.invalidate_fetch_window();
        self.flush_prefetch();
        tracing::info!(eip = format_args!("{next_eip:#010x}"), "left SMM");

        if self.smm.smi_latched {
            self.smm.smi_latched = false;
            self.enter_smm();
        }
    }

    /// m80 image used by SVDC/RSDC and friends: descriptor, then selector.
    pub(crate) fn store_segment_image(
        &mut self,
        cache: SegmentCache,
        seg: SegReg,
        off: u32,
    ) -> Result<(), crate::fault::Fault> {
        let mut image = [0u8; 10];
        image[..8].copy_from_slice(&cache.to_descriptor().0.to_le_bytes());
        image[8..].copy_from_slice(&cache.selector.to_le_bytes());
        self.write_mem_bytes(seg, off, &image)
    }

    pub(crate) fn load_segment_image(
        &mut self,
        seg: SegReg,
        off: u32,
    ) -> Result<SegmentCache, crate::fault::Fault> {
        let mut image = [0u8; 10];
        self.read_mem_bytes(seg, off, &mut image)?;
        let mut desc = [0u8; 8];
        desc.copy_from_slice(&image[..8]);
        let selector = u16::from_le_bytes([image[8], image[9]]);
        Ok(SegmentCache::from_descriptor(
            selector,
            Descriptor(u64::from_le_bytes(desc)),
        ))
    }

    /// Cyrix configuration port access, intercepted before the bus.
    pub(crate) fn cyrix_port(&mut self, port: u16, width: Width, value: Option<u32>) -> Option<u32> {
        if !self.config.model.is_cyrix() || !(CYRIX_INDEX_PORT..=CYRIX_DATA_PORT).contains(&port) {
            return None;
        }
        match value {
            Some(v) => {
                for i in 0..width.bytes() as u16 {
                    let p = port + i;
                    if p <= CYRIX_DATA_PORT {
                        self.smm.write_port(p, (v >> (8 * i)) as u8);
                    }
                }
                Some(0)
            }
            None => {
                let mut v = 0;
                for i in 0..width.bytes() as u16 {
                    let p = port + i;
                    let byte = if p <= CYRIX_DATA_PORT {
                        self.smm.read_port(p)
                    } else {
                        0xff
                    };
                    v |= (byte as u32) << (8 * i);
                }
                Some(v)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(s: &mut SmmState, index: u8, value: u8) {
        s.write_port(CYRIX_INDEX_PORT, index);
        s.write_port(CYRIX_DATA_PORT, value);
    }

    #[test]
    fn smar_decodes_base_and_size() {
        let mut s = SmmState::default();
        write(&mut s, SMAR0, 0x00);
        write(&mut s, SMAR1, 0x0a);
        write(&mut s, SMAR2, 0x03);
        assert_eq!(s.smar_base(), 0x000a_0000);
        assert_eq!(s.smar_size(), 0x4000);
        assert_eq!(s.smhr(), 0x000a_4000);
        write(&mut s, SMAR2, 0x0f);
        assert_eq!(s.smar_size(), 1 << 32);
        write(&mut s, SMAR2, 0x00);
        assert_eq!(s.smar_size(), 0);
    }

    #[test]
    fn config_registers_round_trip_through_ports() {
        let mut s = SmmState::default();
        write(&mut s, CCR1, CCR1_USE_SMI | CCR1_SMAC);
        s.write_port(CYRIX_INDEX_PORT, CCR1);
        assert_eq!(s.read_port(CYRIX_DATA_PORT), CCR1_USE_SMI | CCR1_SMAC);
        s.write_port(CYRIX_INDEX_PORT, 0x20);
        assert_eq!(s.read_port(CYRIX_DATA_PORT), 0xff);
        s.write_port(CYRIX_INDEX_PORT, DIR0);
        assert_eq!(s.read_port(CYRIX_DATA_PORT), DEVICE_ID[0]);
    }

    #[test]
    fn second_smi_in_smm_is_latched_once() {
        let mut s = SmmState::default();
        s.raise();
        assert!(s.smi_ready());
        s.in_smm = true;
        s.raise();
        s.raise();
        assert!(!s.smi_ready());
        assert!(s.smi_latched());
    }
}
