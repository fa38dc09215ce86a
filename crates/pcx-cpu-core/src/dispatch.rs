//! Opcode dispatch table.
//!
//! 256 one-byte opcodes followed by 256 `0F`-prefixed ones, each with an
//! a16 and an a32 column. Most handlers read the address size from the
//! decoded prefixes and sit in both columns; the string and loop handlers
//! are monomorphised per address size and registered with
//! [`DispatchTable::set_split`].

use crate::bus::Bus;
use crate::config::CpuConfig;
use crate::cpu::{Cpu, Insn};
use crate::fault::Fault;
use crate::ops;

/// Number of opcode slots: one-byte plus two-byte map.
pub const OPCODE_SLOTS: usize = 0x200;

pub type Handler<B> = fn(&mut Cpu<B>, &mut Insn) -> Result<(), Fault>;

pub struct DispatchTable<B: Bus> {
    entries: Box<[[Option<Handler<B>>; 2]]>,
}

impl<B: Bus> DispatchTable<B> {
    fn empty() -> Self {
        Self {
            entries: vec![[None; 2]; OPCODE_SLOTS].into_boxed_slice(),
        }
    }

    /// Builds the table for `config`. Opcodes the model lacks stay empty and
    /// decode as #UD.
    pub fn build(config: &CpuConfig) -> Self {
        let mut table = Self::empty();
        ops::register(&mut table, config);
        table
    }

    /// Installs `handler` for both address sizes.
    pub fn set(&mut self, opcode: u16, handler: Handler<B>) {
        self.entries[opcode as usize] = [Some(handler), Some(handler)];
    }

    pub fn set_range(&mut self, opcodes: core::ops::RangeInclusive<u16>, handler: Handler<B>) {
        for op in opcodes {
            self.set(op, handler);
        }
    }

    pub fn set_split(&mut self, opcode: u16, a16: Handler<B>, a32: Handler<B>) {
        self.entries[opcode as usize] = [Some(a16), Some(a32)];
    }

    pub fn clear(&mut self, opcode: u16) {
        self.entries[opcode as usize] = [None, None];
    }

    #[inline]
    pub fn get(&self, opcode: u16, addr32: bool) -> Option<Handler<B>> {
        self.entries
            .get(opcode as usize)
            .and_then(|slot| slot[addr32 as usize])
    }

    /// Number of opcodes with a handler.
    pub fn populated(&self) -> usize {
        self.entries.iter().filter(|slot| slot[0].is_some()).count()
    }
}

impl<B: Bus> core::fmt::Debug for DispatchTable<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("populated", &self.populated())
            .finish()
    }
}
