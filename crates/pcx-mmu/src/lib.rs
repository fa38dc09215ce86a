//! 32-bit x86 MMU: linear → physical translation with a software TLB.
//!
//! Supported paging modes:
//! - No paging (identity mapping of the 32-bit linear space)
//! - Two-level 32-bit paging with 4KiB pages, plus 4MiB pages when CR4.PSE is set
//!
//! The MMU also owns the translation-cache flush policy for control-register
//! writes (see [`FlushKind`]).

mod tlb;

use tlb::{Leaf, Tlb, Translation};

/// Physical memory access used for page-table walking and by the CPU core for
/// every data access once the linear address has been translated.
pub trait MemoryBus {
    fn read_u8(&mut self, paddr: u64) -> u8;
    fn read_u16(&mut self, paddr: u64) -> u16;
    fn read_u32(&mut self, paddr: u64) -> u32;
    fn read_u64(&mut self, paddr: u64) -> u64;

    fn write_u8(&mut self, paddr: u64, value: u8);
    fn write_u16(&mut self, paddr: u64, value: u16);
    fn write_u32(&mut self, paddr: u64, value: u32);
    fn write_u64(&mut self, paddr: u64, value: u64);

    /// Read a byte slice from physical memory.
    ///
    /// The default implementation falls back to byte-at-a-time reads via
    /// [`MemoryBus::read_u8`].
    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_u8(paddr.wrapping_add(i as u64));
        }
    }

    /// Write a byte slice to physical memory.
    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u64), byte);
        }
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        <T as MemoryBus>::read_u8(&mut **self, paddr)
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        <T as MemoryBus>::read_u16(&mut **self, paddr)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        <T as MemoryBus>::read_u32(&mut **self, paddr)
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        <T as MemoryBus>::read_u64(&mut **self, paddr)
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        <T as MemoryBus>::write_u8(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        <T as MemoryBus>::write_u16(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        <T as MemoryBus>::write_u32(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        <T as MemoryBus>::write_u64(&mut **self, paddr, value)
    }

    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        <T as MemoryBus>::read_bytes(&mut **self, paddr, dst)
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        <T as MemoryBus>::write_bytes(&mut **self, paddr, src)
    }
}

/// Type of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }

    #[inline]
    fn is_execute(self) -> bool {
        matches!(self, AccessType::Execute)
    }
}

/// #PF details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address (CR2).
    pub addr: u32,
    /// Error code as per Intel SDM (P, W/R, U/S, RSVD).
    pub error_code: u32,
}

impl PageFault {
    #[inline]
    fn new(addr: u32, error_code: u32) -> Self {
        Self { addr, error_code }
    }
}

/// Translation-cache flush variants.
///
/// Control-register writes pick exactly one of these; picking the wrong one
/// leaves memory-mapping state observably stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushKind {
    /// Drop every cached translation, global pages included, and invalidate the
    /// CPU's instruction-fetch window.
    Full,
    /// Drop every cached translation but keep instruction-fetch state.
    NoPc,
    /// Drop cached data translations only (supervisor write permission changed).
    WriteProtect,
    /// Drop non-global translations (CR3 reload). Without CR4.PGE every entry
    /// is non-global.
    NonGlobal,
}

impl FlushKind {
    /// Selects the flush a CR0 write requires, if any.
    ///
    /// A paging or protection toggle dominates, then a WP toggle, then a
    /// cache-disable toggle.
    pub fn for_cr0_write(old: u32, new: u32) -> Option<FlushKind> {
        let changed = old ^ new;
        if changed & (CR0_PE | CR0_PG) != 0 {
            Some(FlushKind::Full)
        } else if changed & CR0_WP != 0 {
            Some(FlushKind::WriteProtect)
        } else if changed & CR0_CD != 0 {
            Some(FlushKind::NoPc)
        } else {
            None
        }
    }

    /// Selects the flush a CR4 write requires, if any.
    pub fn for_cr4_write(old: u32, new: u32) -> Option<FlushKind> {
        if (old ^ new) & (CR4_PSE | CR4_PAE | CR4_PGE) != 0 {
            Some(FlushKind::Full)
        } else {
            None
        }
    }
}

/// Per-kind flush tallies. Always maintained; tests and debuggers use them to
/// observe which variant a control-register write selected.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushCounters {
    pub full: u64,
    pub no_pc: u64,
    pub write_protect: u64,
    pub non_global: u64,
    pub invlpg: u64,
}

impl FlushCounters {
    fn record(&mut self, kind: FlushKind) {
        let slot = match kind {
            FlushKind::Full => &mut self.full,
            FlushKind::NoPc => &mut self.no_pc,
            FlushKind::WriteProtect => &mut self.write_protect,
            FlushKind::NonGlobal => &mut self.non_global,
        };
        *slot = slot.wrapping_add(1);
    }
}

/// 32-bit x86 MMU with a software TLB.
#[derive(Debug, Clone)]
pub struct Mmu {
    cr0: u32,
    cr2: u32,
    cr3: u32,
    cr4: u32,
    tlb: Tlb,
    last_flush: Option<FlushKind>,
    counters: FlushCounters,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            tlb: Tlb::new(),
            last_flush: None,
            counters: FlushCounters::default(),
        }
    }

    /// CR2 is architecturally written on #PF; the MMU latches it on every
    /// faulting translation so the CPU can fetch it when delivering the fault.
    #[inline]
    pub fn cr2(&self) -> u32 {
        self.cr2
    }

    #[inline]
    pub fn set_cr2(&mut self, value: u32) {
        self.cr2 = value;
    }

    #[inline]
    pub fn cr0(&self) -> u32 {
        self.cr0
    }

    #[inline]
    pub fn cr3(&self) -> u32 {
        self.cr3
    }

    #[inline]
    pub fn cr4(&self) -> u32 {
        self.cr4
    }

    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PG != 0
    }

    /// The most recent flush performed, if any.
    #[inline]
    pub fn last_flush(&self) -> Option<FlushKind> {
        self.last_flush
    }

    #[inline]
    pub fn flush_counters(&self) -> FlushCounters {
        self.counters
    }

    /// Number of live cached translations as `(instruction, data)`.
    pub fn tlb_occupancy(&self) -> (usize, usize) {
        self.tlb.occupancy()
    }

    /// Installs a new CR0 image and performs the flush it requires.
    pub fn set_cr0(&mut self, value: u32) -> Option<FlushKind> {
        let kind = FlushKind::for_cr0_write(self.cr0, value);
        self.cr0 = value;
        if let Some(kind) = kind {
            self.flush(kind);
        }
        kind
    }

    /// Installs a new CR3 image. CR3 loads always flush non-global entries.
    pub fn set_cr3(&mut self, value: u32) -> FlushKind {
        self.cr3 = value;
        self.flush(FlushKind::NonGlobal);
        FlushKind::NonGlobal
    }

    pub fn set_cr4(&mut self, value: u32) -> Option<FlushKind> {
        let kind = FlushKind::for_cr4_write(self.cr4, value);
        self.cr4 = value;
        if let Some(kind) = kind {
            self.flush(kind);
        }
        kind
    }

    /// Performs a flush of the given kind.
    pub fn flush(&mut self, kind: FlushKind) {
        match kind {
            FlushKind::Full | FlushKind::NoPc => self.tlb.flush_all(),
            FlushKind::WriteProtect => self.tlb.flush_data(),
            FlushKind::NonGlobal => {
                if self.cr4_pge() {
                    self.tlb.flush_non_global();
                } else {
                    self.tlb.flush_all();
                }
            }
        }
        self.counters.record(kind);
        self.last_flush = Some(kind);
    }

    /// INVLPG.
    pub fn invlpg(&mut self, laddr: u32) {
        self.counters.invlpg = self.counters.invlpg.wrapping_add(1);
        self.tlb.invalidate_address(laddr);
    }

    /// Translate a linear address to a physical address.
    ///
    /// `cpl` is the current privilege level (0..=3). Only CPL==3 is treated as
    /// "user"; all others are "supervisor". Accessed and dirty bits are set in
    /// the paging structures as a side effect.
    pub fn translate(
        &mut self,
        bus: &mut impl MemoryBus,
        laddr: u32,
        access: AccessType,
        cpl: u8,
    ) -> Result<u64, PageFault> {
        if !self.paging_enabled() {
            return Ok(laddr as u64);
        }

        let is_user = cpl == 3;
        let is_exec = access.is_execute();

        if let Some((slot, entry)) = self.tlb.lookup(laddr, is_exec) {
            if is_user && !entry.user() {
                return Err(self.fault(PageFault::new(
                    laddr,
                    pf_error_code(true, access, is_user, false),
                )));
            }

            if !access.is_write() {
                return Ok(entry.translate(laddr));
            }

            if !entry.writable() && (is_user || self.wp_enabled()) {
                return Err(self.fault(PageFault::new(
                    laddr,
                    pf_error_code(true, access, is_user, false),
                )));
            }

            // Lazily set D on the first write hit.
            if !entry.dirty() {
                let leaf_addr = entry.leaf_addr();
                let val = bus.read_u32(leaf_addr);
                bus.write_u32(leaf_addr, val | PTE_D);
                self.tlb.mark_dirty(slot);
            }
            return Ok(entry.translate(laddr));
        }

        match self.walk(bus, laddr, access, is_user) {
            Ok((entry, paddr)) => {
                self.tlb.insert(is_exec, entry);
                Ok(paddr)
            }
            Err(pf) => Err(self.fault(pf)),
        }
    }

    #[inline]
    fn fault(&mut self, pf: PageFault) -> PageFault {
        self.cr2 = pf.addr;
        pf
    }

    #[inline]
    fn cr4_pse(&self) -> bool {
        self.cr4 & CR4_PSE != 0
    }

    #[inline]
    fn cr4_pge(&self) -> bool {
        self.cr4 & CR4_PGE != 0
    }

    #[inline]
    fn wp_enabled(&self) -> bool {
        self.cr0 & CR0_WP != 0
    }

    fn check_perms(
        &self,
        laddr: u32,
        user_ok: bool,
        writable_ok: bool,
        access: AccessType,
        is_user: bool,
    ) -> Result<(), PageFault> {
        if is_user && !user_ok {
            return Err(PageFault::new(
                laddr,
                pf_error_code(true, access, is_user, false),
            ));
        }

        if access.is_write() && !writable_ok && (is_user || self.wp_enabled()) {
            return Err(PageFault::new(
                laddr,
                pf_error_code(true, access, is_user, false),
            ));
        }

        Ok(())
    }

    fn walk(
        &mut self,
        bus: &mut impl MemoryBus,
        laddr: u32,
        access: AccessType,
        is_user: bool,
    ) -> Result<(Translation, u64), PageFault> {
        let pd_base = self.cr3 & !0xfff;
        let pd_index = laddr >> 22;
        let pde_addr = (pd_base + pd_index * 4) as u64;
        let pde_raw = bus.read_u32(pde_addr);
        if pde_raw & PTE_P == 0 {
            return Err(PageFault::new(
                laddr,
                pf_error_code(false, access, is_user, false),
            ));
        }

        let large = pde_raw & PTE_PS != 0 && self.cr4_pse();
        if large && pde_raw & PDE_4M_RESERVED != 0 {
            return Err(PageFault::new(
                laddr,
                pf_error_code(true, access, is_user, true),
            ));
        }

        let pde = mark_accessed(bus, pde_addr, pde_raw);

        if large {
            let user_ok = pde & PTE_US != 0;
            let writable_ok = pde & PTE_RW != 0;
            self.check_perms(laddr, user_ok, writable_ok, access, is_user)?;

            let new_pde = if access.is_write() { pde | PTE_D } else { pde };
            if new_pde != pde {
                bus.write_u32(pde_addr, new_pde);
            }

            let entry = Translation::large(
                laddr,
                new_pde,
                Leaf {
                    addr: pde_addr as u32,
                    user: user_ok,
                    writable: writable_ok,
                    global: self.cr4_pge() && new_pde & PTE_G != 0,
                    dirty: new_pde & PTE_D != 0,
                },
            );
            return Ok((entry, entry.translate(laddr)));
        }

        let pt_base = pde & 0xffff_f000;
        let pt_index = (laddr >> 12) & 0x3ff;
        let pte_addr = (pt_base + pt_index * 4) as u64;
        let pte_raw = bus.read_u32(pte_addr);
        if pte_raw & PTE_P == 0 {
            return Err(PageFault::new(
                laddr,
                pf_error_code(false, access, is_user, false),
            ));
        }
        let pte = mark_accessed(bus, pte_addr, pte_raw);

        let user_ok = pde & PTE_US != 0 && pte & PTE_US != 0;
        let writable_ok = pde & PTE_RW != 0 && pte & PTE_RW != 0;
        self.check_perms(laddr, user_ok, writable_ok, access, is_user)?;

        let new_pte = if access.is_write() { pte | PTE_D } else { pte };
        if new_pte != pte {
            bus.write_u32(pte_addr, new_pte);
        }

        let entry = Translation::small(
            laddr,
            new_pte,
            Leaf {
                addr: pte_addr as u32,
                user: user_ok,
                writable: writable_ok,
                global: self.cr4_pge() && new_pte & PTE_G != 0,
                dirty: new_pte & PTE_D != 0,
            },
        );
        Ok((entry, entry.translate(laddr)))
    }
}

fn mark_accessed(bus: &mut impl MemoryBus, entry_addr: u64, entry: u32) -> u32 {
    if entry & PTE_A == 0 {
        let entry = entry | PTE_A;
        bus.write_u32(entry_addr, entry);
        entry
    } else {
        entry
    }
}

#[inline]
fn pf_error_code(present: bool, access: AccessType, is_user: bool, rsvd: bool) -> u32 {
    let mut code = 0u32;
    if present {
        code |= 1 << 0;
    }
    if access.is_write() {
        code |= 1 << 1;
    }
    if is_user {
        code |= 1 << 2;
    }
    if rsvd {
        code |= 1 << 3;
    }
    code
}

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_CD: u32 = 1 << 30;
pub const CR0_PG: u32 = 1 << 31;

pub const CR4_PSE: u32 = 1 << 4;
pub const CR4_PAE: u32 = 1 << 5;
pub const CR4_PGE: u32 = 1 << 7;

const PTE_P: u32 = 1 << 0;
const PTE_RW: u32 = 1 << 1;
const PTE_US: u32 = 1 << 2;
const PTE_A: u32 = 1 << 5;
const PTE_D: u32 = 1 << 6;
const PTE_PS: u32 = 1 << 7;
const PTE_G: u32 = 1 << 8;

const PDE_4M_RESERVED: u32 = 0x003f_e000;

#[cfg(test)]
mod tests;
