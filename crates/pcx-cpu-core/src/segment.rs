//! Segment registers, cached descriptors and descriptor-table registers.

/// Segment register index, in ModRM `reg` field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    #[inline]
    pub fn from_index(idx: u8) -> Option<Self> {
        Self::ALL.get(idx as usize).copied()
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

pub const AR_ACCESSED: u8 = 1 << 0;
/// Readable (code) or writable (data).
pub const AR_RW: u8 = 1 << 1;
/// Conforming (code) or expand-down (data).
pub const AR_DC: u8 = 1 << 2;
pub const AR_CODE: u8 = 1 << 3;
/// Code/data (as opposed to a system descriptor).
pub const AR_S: u8 = 1 << 4;
pub const AR_PRESENT: u8 = 1 << 7;

pub const FLAG_AVL: u8 = 1 << 4;
pub const FLAG_DB: u8 = 1 << 6;
pub const FLAG_G: u8 = 1 << 7;

/// System descriptor types (access byte low nibble with S clear).
pub const SYS_TSS16_AVAIL: u8 = 0x1;
pub const SYS_LDT: u8 = 0x2;
pub const SYS_TSS16_BUSY: u8 = 0x3;
pub const SYS_TASK_GATE: u8 = 0x5;
pub const SYS_INT_GATE16: u8 = 0x6;
pub const SYS_TRAP_GATE16: u8 = 0x7;
pub const SYS_TSS32_AVAIL: u8 = 0x9;
pub const SYS_TSS32_BUSY: u8 = 0xb;
pub const SYS_INT_GATE32: u8 = 0xe;
pub const SYS_TRAP_GATE32: u8 = 0xf;

/// An 8-byte GDT/LDT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub u64);

impl Descriptor {
    #[inline]
    fn low(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn base(self) -> u32 {
        (self.low() >> 16) | ((self.high() & 0xff) << 16) | (self.high() & 0xff00_0000)
    }

    /// Limit in bytes, already scaled by the granularity bit.
    pub fn limit(self) -> u32 {
        let raw = (self.low() & 0xffff) | (self.high() & 0x000f_0000);
        if self.flags() & FLAG_G != 0 {
            (raw << 12) | 0xfff
        } else {
            raw
        }
    }

    #[inline]
    pub fn access(self) -> u8 {
        (self.high() >> 8) as u8
    }

    #[inline]
    pub fn flags(self) -> u8 {
        ((self.high() >> 16) & 0xf0) as u8
    }

    #[inline]
    pub fn dpl(self) -> u8 {
        (self.access() >> 5) & 3
    }

    #[inline]
    pub fn present(self) -> bool {
        self.access() & AR_PRESENT != 0
    }

    #[inline]
    pub fn is_system(self) -> bool {
        self.access() & AR_S == 0
    }

    #[inline]
    pub fn system_type(self) -> u8 {
        self.access() & 0xf
    }

    /// Gate target offset (interrupt/trap/call gates).
    pub fn gate_offset(self) -> u32 {
        (self.low() & 0xffff) | (self.high() & 0xffff_0000)
    }

    /// Gate target selector.
    pub fn gate_selector(self) -> u16 {
        (self.low() >> 16) as u16
    }
}

/// Hidden descriptor cache of a segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub access: u8,
    pub flags: u8,
    /// Cleared when a null selector was loaded in protected mode; any access
    /// through the segment then raises #GP(0).
    pub valid: bool,
}

impl SegmentCache {
    /// Real-mode / V86 style load: base = selector * 16, 64 KiB limit.
    pub fn real(selector: u16) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
            limit: 0xffff,
            access: AR_PRESENT | AR_S | AR_RW | AR_ACCESSED,
            flags: 0,
            valid: true,
        }
    }

    /// V86 segments are always DPL 3.
    pub fn vm86(selector: u16) -> Self {
        Self {
            access: AR_PRESENT | AR_S | AR_RW | AR_ACCESSED | (3 << 5),
            ..Self::real(selector)
        }
    }

    pub fn from_descriptor(selector: u16, desc: Descriptor) -> Self {
        Self {
            selector,
            base: desc.base(),
            limit: desc.limit(),
            access: desc.access(),
            flags: desc.flags(),
            valid: true,
        }
    }

    /// Null selector loaded into a data segment register in protected mode.
    pub fn null(selector: u16) -> Self {
        Self {
            selector,
            valid: false,
            ..Self::default()
        }
    }

    /// Re-packs the cache into descriptor format.
    pub fn to_descriptor(&self) -> Descriptor {
        let raw_limit = if self.flags & FLAG_G != 0 {
            self.limit >> 12
        } else {
            self.limit
        } & 0xf_ffff;
        let low = (raw_limit & 0xffff) | (self.base << 16);
        let high = ((self.base >> 16) & 0xff)
            | ((self.access as u32) << 8)
            | (raw_limit & 0xf_0000)
            | (((self.flags & 0xf0) as u32) << 16)
            | (self.base & 0xff00_0000);
        Descriptor(low as u64 | ((high as u64) << 32))
    }

    #[inline]
    pub fn rpl(&self) -> u8 {
        (self.selector & 3) as u8
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 3
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.access & AR_PRESENT != 0
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.access & (AR_S | AR_CODE) == AR_S | AR_CODE
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        self.access & (AR_S | AR_CODE) == AR_S
    }

    #[inline]
    pub fn readable(&self) -> bool {
        self.is_data() || (self.is_code() && self.access & AR_RW != 0)
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.is_data() && self.access & AR_RW != 0
    }

    #[inline]
    pub fn expand_down(&self) -> bool {
        self.is_data() && self.access & AR_DC != 0
    }

    #[inline]
    pub fn conforming(&self) -> bool {
        self.is_code() && self.access & AR_DC != 0
    }

    /// D/B bit: 32-bit default size for code, 4 GiB upper bound for
    /// expand-down stacks.
    #[inline]
    pub fn big(&self) -> bool {
        self.flags & FLAG_DB != 0
    }

    /// Whether `size` bytes at `offset` fall within the segment limit.
    pub fn contains(&self, offset: u32, size: u32) -> bool {
        let last = offset as u64 + size as u64 - 1;
        if self.expand_down() {
            let upper = if self.big() { 0xffff_ffffu64 } else { 0xffff };
            offset > self.limit && last <= upper
        } else {
            last <= self.limit as u64
        }
    }
}

/// GDTR / IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableReg {
    pub base: u32,
    pub limit: u16,
}
