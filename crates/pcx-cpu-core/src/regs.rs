//! General-purpose register file with the classic 8/16/32-bit aliased views.

pub const EAX: u8 = 0;
pub const ECX: u8 = 1;
pub const EDX: u8 = 2;
pub const EBX: u8 = 3;
pub const ESP: u8 = 4;
pub const EBP: u8 = 5;
pub const ESI: u8 = 6;
pub const EDI: u8 = 7;

/// Operand width of an integer access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Width::Byte => 8,
            Width::Word => 16,
            Width::Dword => 32,
        }
    }

    #[inline]
    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xff,
            Width::Word => 0xffff,
            Width::Dword => 0xffff_ffff,
        }
    }

    #[inline]
    pub const fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Sign-extends the low `bits()` of `value` to 32 bits.
    #[inline]
    pub const fn sign_extend(self, value: u32) -> u32 {
        match self {
            Width::Byte => value as u8 as i8 as i32 as u32,
            Width::Word => value as u16 as i16 as i32 as u32,
            Width::Dword => value,
        }
    }

    /// Word or dword, picked by the operand-size attribute.
    #[inline]
    pub const fn from_op32(op32: bool) -> Self {
        if op32 {
            Width::Dword
        } else {
            Width::Word
        }
    }
}

/// Eight 32-bit registers. Narrow writes only modify their own slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gprs([u32; 8]);

impl Gprs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads register `idx`.
    ///
    /// For [`Width::Byte`], indices 0-3 are AL/CL/DL/BL and 4-7 are AH/CH/DH/BH.
    #[inline]
    pub fn read(&self, width: Width, idx: u8) -> u32 {
        let idx = idx as usize & 7;
        match width {
            Width::Byte if idx < 4 => self.0[idx] & 0xff,
            Width::Byte => (self.0[idx - 4] >> 8) & 0xff,
            Width::Word => self.0[idx] & 0xffff,
            Width::Dword => self.0[idx],
        }
    }

    #[inline]
    pub fn write(&mut self, width: Width, idx: u8, value: u32) {
        let idx = idx as usize & 7;
        match width {
            Width::Byte if idx < 4 => {
                self.0[idx] = (self.0[idx] & !0xff) | (value & 0xff);
            }
            Width::Byte => {
                let r = &mut self.0[idx - 4];
                *r = (*r & !0xff00) | ((value & 0xff) << 8);
            }
            Width::Word => self.0[idx] = (self.0[idx] & !0xffff) | (value & 0xffff),
            Width::Dword => self.0[idx] = value,
        }
    }

    #[inline]
    pub fn get(&self, idx: u8) -> u32 {
        self.0[idx as usize & 7]
    }

    #[inline]
    pub fn set(&mut self, idx: u8, value: u32) {
        self.0[idx as usize & 7] = value;
    }
}
