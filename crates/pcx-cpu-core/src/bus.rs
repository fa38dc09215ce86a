//! The CPU's view of the rest of the machine: physical memory (with MMIO
//! windows), port I/O and the SMRAM remap hook.
//!
//! Device models plug in as [`MmioHandler`] / [`PortHandler`] trait objects.
//! Every callback runs synchronously inside the instruction that triggered it,
//! so a multi-byte access reaches the device in program order.

use std::cell::RefCell;
use std::rc::Rc;

use pcx_mmu::MemoryBus;

use crate::config::CpuConfig;
use crate::regs::Width;

/// Port I/O as seen by IN/OUT. Values are zero-extended to 32 bits.
pub trait IoBus {
    fn io_read(&mut self, port: u16, width: Width) -> u32;
    fn io_write(&mut self, port: u16, width: Width, value: u32);
}

/// Everything the CPU core needs from the platform.
pub trait Bus: MemoryBus + IoBus {
    /// Called on SMM entry (`true`) and exit (`false`) so the chipset can
    /// switch SMRAM in or out of the physical address space.
    fn smram_remap(&mut self, _in_smm: bool) {}
}

impl<T: IoBus + ?Sized> IoBus for &mut T {
    fn io_read(&mut self, port: u16, width: Width) -> u32 {
        (**self).io_read(port, width)
    }

    fn io_write(&mut self, port: u16, width: Width, value: u32) {
        (**self).io_write(port, width, value)
    }
}

impl<T: Bus + ?Sized> Bus for &mut T {
    fn smram_remap(&mut self, in_smm: bool) {
        (**self).smram_remap(in_smm)
    }
}

/// A device-owned physical address window. `offset` is relative to the start
/// of the window.
pub trait MmioHandler {
    fn read(&mut self, offset: u64, width: Width) -> u32;
    fn write(&mut self, offset: u64, width: Width, value: u32);
}

/// A device-owned range of I/O ports. `port` is the absolute port number.
pub trait PortHandler {
    fn read(&mut self, port: u16, width: Width) -> u32;
    fn write(&mut self, port: u16, width: Width, value: u32);
}

impl<T: MmioHandler> MmioHandler for Rc<RefCell<T>> {
    fn read(&mut self, offset: u64, width: Width) -> u32 {
        self.borrow_mut().read(offset, width)
    }

    fn write(&mut self, offset: u64, width: Width, value: u32) {
        self.borrow_mut().write(offset, width, value)
    }
}

impl<T: PortHandler> PortHandler for Rc<RefCell<T>> {
    fn read(&mut self, port: u16, width: Width) -> u32 {
        self.borrow_mut().read(port, width)
    }

    fn write(&mut self, port: u16, width: Width, value: u32) {
        self.borrow_mut().write(port, width, value)
    }
}

struct MmioRange {
    base: u64,
    len: u64,
    handler: Box<dyn MmioHandler>,
}

struct PortRange {
    base: u16,
    count: u16,
    handler: Box<dyn PortHandler>,
}

impl PortRange {
    fn contains(&self, port: u16) -> bool {
        port.wrapping_sub(self.base) < self.count
    }
}

struct Smram {
    base: u64,
    backing: Vec<u8>,
    active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Ram,
    Smram,
    Mmio(usize),
    Unmapped,
}

/// Flat RAM plus registered MMIO windows, port handlers and an optional
/// SMRAM window that shadows RAM while the CPU is in SMM.
pub struct PcBus {
    ram: Vec<u8>,
    mmio: Vec<MmioRange>,
    ports: Vec<PortRange>,
    smram: Option<Smram>,
}

impl core::fmt::Debug for PcBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PcBus")
            .field("ram", &format_args!("{:#x} bytes", self.ram.len()))
            .field("mmio_ranges", &self.mmio.len())
            .field("port_ranges", &self.ports.len())
            .field("smram_active", &self.smram_active())
            .finish()
    }
}

impl PcBus {
    pub fn new(ram_size: usize) -> Self {
        Self {
            ram: vec![0; ram_size],
            mmio: Vec::new(),
            ports: Vec::new(),
            smram: None,
        }
    }

    pub fn for_config(config: &CpuConfig) -> Self {
        Self::new(config.ram_size)
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    /// Copies `bytes` into RAM at `paddr`. Bytes past the end of RAM are
    /// dropped.
    pub fn load(&mut self, paddr: u64, bytes: &[u8]) {
        let start = (paddr as usize).min(self.ram.len());
        let end = start.saturating_add(bytes.len()).min(self.ram.len());
        self.ram[start..end].copy_from_slice(&bytes[..end - start]);
    }

    pub fn map_mmio(&mut self, base: u64, len: u64, handler: impl MmioHandler + 'static) {
        self.mmio.push(MmioRange {
            base,
            len,
            handler: Box::new(handler),
        });
    }

    pub fn map_ports(&mut self, base: u16, count: u16, handler: impl PortHandler + 'static) {
        self.ports.push(PortRange {
            base,
            count,
            handler: Box::new(handler),
        });
    }

    /// Installs an SMRAM window of `size` bytes at physical `base`.
    pub fn set_smram(&mut self, base: u64, size: usize) {
        self.smram = Some(Smram {
            base,
            backing: vec![0; size],
            active: false,
        });
    }

    pub fn smram_active(&self) -> bool {
        self.smram.as_ref().is_some_and(|s| s.active)
    }

    pub fn smram(&self) -> Option<&[u8]> {
        self.smram.as_ref().map(|s| s.backing.as_slice())
    }

    fn region(&self, paddr: u64, len: u64) -> Option<Region> {
        let end = paddr.checked_add(len)?;
        if let Some(s) = self.smram.as_ref().filter(|s| s.active) {
            let s_end = s.base + s.backing.len() as u64;
            if paddr >= s.base && end <= s_end {
                return Some(Region::Smram);
            }
            if paddr < s_end && end > s.base {
                return None;
            }
        }
        for (idx, r) in self.mmio.iter().enumerate() {
            let r_end = r.base + r.len;
            if paddr >= r.base && end <= r_end {
                return Some(Region::Mmio(idx));
            }
            if paddr < r_end && end > r.base {
                return None;
            }
        }
        if end <= self.ram.len() as u64 {
            Some(Region::Ram)
        } else if paddr >= self.ram.len() as u64 {
            Some(Region::Unmapped)
        } else {
            None
        }
    }

    fn read_n(&mut self, paddr: u64, width: Width) -> u32 {
        let len = width.bytes() as u64;
        match self.region(paddr, len) {
            Some(Region::Ram) => {
                let at = paddr as usize;
                self.ram[at..at + len as usize]
                    .iter()
                    .rev()
                    .fold(0, |acc, &b| (acc << 8) | b as u32)
            }
            Some(Region::Smram) => {
                let Some(s) = self.smram.as_ref() else {
                    return width.mask();
                };
                let at = (paddr - s.base) as usize;
                s.backing[at..at + len as usize]
                    .iter()
                    .rev()
                    .fold(0, |acc, &b| (acc << 8) | b as u32)
            }
            Some(Region::Mmio(idx)) => {
                let r = &mut self.mmio[idx];
                r.handler.read(paddr - r.base, width) & width.mask()
            }
            Some(Region::Unmapped) => width.mask(),
            None if len == 1 => width.mask(),
            // Straddles two regions: split into bytes, low address first.
            None => (0..len).fold(0, |acc, i| {
                acc | self.read_n(paddr.wrapping_add(i), Width::Byte) << (8 * i)
            }),
        }
    }

    fn write_n(&mut self, paddr: u64, width: Width, value: u32) {
        let len = width.bytes() as u64;
        match self.region(paddr, len) {
            Some(Region::Ram) => {
                let at = paddr as usize;
                self.ram[at..at + len as usize]
                    .copy_from_slice(&value.to_le_bytes()[..len as usize]);
            }
            Some(Region::Smram) => {
                if let Some(s) = self.smram.as_mut() {
                    let at = (paddr - s.base) as usize;
                    s.backing[at..at + len as usize]
                        .copy_from_slice(&value.to_le_bytes()[..len as usize]);
                }
            }
            Some(Region::Mmio(idx)) => {
                let r = &mut self.mmio[idx];
                r.handler.write(paddr - r.base, width, value & width.mask());
            }
            Some(Region::Unmapped) => {}
            None if len == 1 => {}
            None => {
                for i in 0..len {
                    self.write_n(paddr.wrapping_add(i), Width::Byte, value >> (8 * i));
                }
            }
        }
    }
}

impl MemoryBus for PcBus {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.read_n(paddr, Width::Byte) as u8
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        self.read_n(paddr, Width::Word) as u16
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        self.read_n(paddr, Width::Dword)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        let lo = self.read_n(paddr, Width::Dword) as u64;
        let hi = self.read_n(paddr.wrapping_add(4), Width::Dword) as u64;
        lo | hi << 32
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.write_n(paddr, Width::Byte, value as u32)
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.write_n(paddr, Width::Word, value as u32)
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_n(paddr, Width::Dword, value)
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_n(paddr, Width::Dword, value as u32);
        self.write_n(paddr.wrapping_add(4), Width::Dword, (value >> 32) as u32);
    }
}

impl IoBus for PcBus {
    fn io_read(&mut self, port: u16, width: Width) -> u32 {
        match self.ports.iter_mut().find(|r| r.contains(port)) {
            Some(r) => r.handler.read(port, width) & width.mask(),
            None => width.mask(),
        }
    }

    fn io_write(&mut self, port: u16, width: Width, value: u32) {
        if let Some(r) = self.ports.iter_mut().find(|r| r.contains(port)) {
            r.handler.write(port, width, value & width.mask());
        }
    }
}

impl Bus for PcBus {
    fn smram_remap(&mut self, in_smm: bool) {
        if let Some(s) = self.smram.as_mut() {
            s.active = in_smm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        writes: Vec<(u64, Width, u32)>,
    }

    impl MmioHandler for Recorder {
        fn read(&mut self, offset: u64, _width: Width) -> u32 {
            0xa0 + offset as u32
        }

        fn write(&mut self, offset: u64, width: Width, value: u32) {
            self.writes.push((offset, width, value));
        }
    }

    #[test]
    fn ram_and_unmapped() {
        let mut bus = PcBus::new(0x1000);
        bus.write_u32(0x10, 0x1122_3344);
        assert_eq!(bus.read_u16(0x12), 0x1122);
        assert_eq!(bus.read_u32(0x2000), 0xffff_ffff);
        // Straddling the end of RAM.
        assert_eq!(bus.read_u16(0xfff), 0xff00);
    }

    #[test]
    fn mmio_routes_by_range_and_keeps_width() {
        let dev = Rc::new(RefCell::new(Recorder::default()));
        let mut bus = PcBus::new(0x1000);
        bus.map_mmio(0x800, 0x10, dev.clone());
        bus.write_u16(0x804, 0xbeef);
        assert_eq!(bus.read_u8(0x801), 0xa1);
        assert_eq!(bus.ram()[0x804], 0);
        assert_eq!(dev.borrow().writes, vec![(4, Width::Word, 0xbeef)]);
    }

    #[test]
    fn smram_shadows_ram_only_while_active() {
        let mut bus = PcBus::new(0x10000);
        bus.set_smram(0x8000, 0x1000);
        bus.write_u8(0x8000, 0x11);
        bus.smram_remap(true);
        assert_eq!(bus.read_u8(0x8000), 0);
        bus.write_u8(0x8000, 0x22);
        bus.smram_remap(false);
        assert_eq!(bus.read_u8(0x8000), 0x11);
        assert_eq!(bus.smram().map(|s| s[0]), Some(0x22));
    }

    #[test]
    fn unclaimed_ports_float_high() {
        let mut bus = PcBus::new(0x100);
        assert_eq!(bus.io_read(0x80, Width::Byte), 0xff);
        assert_eq!(bus.io_read(0x80, Width::Word), 0xffff);
    }
}
