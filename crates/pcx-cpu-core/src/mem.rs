//! Segmented, paged memory access and segment-register loads.
//!
//! Every access goes segment check → linear address → page translation →
//! physical bus access. An access that straddles a page boundary translates
//! both pages before touching memory, so a #PF on the second page leaves
//! memory untouched.

use pcx_mmu::{AccessType, MemoryBus};

use crate::bus::Bus;
use crate::cpu::Cpu;
use crate::fault::Fault;
use crate::regs::{Width, ESP};
use crate::segment::{Descriptor, SegReg, SegmentCache, AR_ACCESSED};
use crate::state::CpuMode;

const PAGE_MASK: u32 = 0xfff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

impl<B: Bus> Cpu<B> {
    pub(crate) fn translate(
        &mut self,
        lin: u32,
        access: AccessType,
        cpl: u8,
    ) -> Result<u64, Fault> {
        Ok(self.mmu.translate(&mut self.bus, lin, access, cpl)?)
    }

    /// Checks `size` bytes at `seg:off` and returns the linear address.
    fn linear(&self, seg: SegReg, off: u32, size: u32, access: Access) -> Result<u32, Fault> {
        let cache = self.state.seg(seg);
        let limit_fault = if seg == SegReg::Ss {
            Fault::StackSegment(0)
        } else {
            Fault::gp0()
        };
        if self.state.mode() == CpuMode::Protected {
            if !cache.valid {
                return Err(Fault::gp0());
            }
            let ok = match access {
                Access::Read => cache.readable(),
                Access::Write => cache.writable(),
            };
            if !ok {
                return Err(Fault::gp0());
            }
        }
        if !cache.contains(off, size) {
            return Err(limit_fault);
        }
        Ok(cache.base.wrapping_add(off))
    }

    fn read_lin(&mut self, lin: u32, buf: &mut [u8], cpl: u8) -> Result<(), Fault> {
        self.mem_accesses += 1;
        let len = buf.len() as u32;
        let first_len = (PAGE_MASK - (lin & PAGE_MASK) + 1).min(len);
        let p0 = self.translate(lin, AccessType::Read, cpl)?;
        if first_len == len {
            self.bus.read_bytes(p0, buf);
            return Ok(());
        }
        let p1 = self.translate(lin.wrapping_add(first_len), AccessType::Read, cpl)?;
        let (a, b) = buf.split_at_mut(first_len as usize);
        self.bus.read_bytes(p0, a);
        self.bus.read_bytes(p1, b);
        Ok(())
    }

    fn write_lin(&mut self, lin: u32, data: &[u8], cpl: u8) -> Result<(), Fault> {
        self.mem_accesses += 1;
        let len = data.len() as u32;
        let first_len = (PAGE_MASK - (lin & PAGE_MASK) + 1).min(len);
        let p0 = self.translate(lin, AccessType::Write, cpl)?;
        if first_len == len {
            self.bus.write_bytes(p0, data);
            return Ok(());
        }
        let p1 = self.translate(lin.wrapping_add(first_len), AccessType::Write, cpl)?;
        let (a, b) = data.split_at(first_len as usize);
        self.bus.write_bytes(p0, a);
        self.bus.write_bytes(p1, b);
        Ok(())
    }

    fn read_lin_width(&mut self, lin: u32, width: Width, cpl: u8) -> Result<u32, Fault> {
        if lin & PAGE_MASK <= PAGE_MASK + 1 - width.bytes() {
            self.mem_accesses += 1;
            let p = self.translate(lin, AccessType::Read, cpl)?;
            return Ok(match width {
                Width::Byte => self.bus.read_u8(p) as u32,
                Width::Word => self.bus.read_u16(p) as u32,
                Width::Dword => self.bus.read_u32(p),
            });
        }
        let mut buf = [0u8; 4];
        self.read_lin(lin, &mut buf[..width.bytes() as usize], cpl)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_lin_width(&mut self, lin: u32, width: Width, value: u32, cpl: u8) -> Result<(), Fault> {
        if lin & PAGE_MASK <= PAGE_MASK + 1 - width.bytes() {
            self.mem_accesses += 1;
            let p = self.translate(lin, AccessType::Write, cpl)?;
            match width {
                Width::Byte => self.bus.write_u8(p, value as u8),
                Width::Word => self.bus.write_u16(p, value as u16),
                Width::Dword => self.bus.write_u32(p, value),
            }
            return Ok(());
        }
        let bytes = value.to_le_bytes();
        self.write_lin(lin, &bytes[..width.bytes() as usize], cpl)
    }

    pub fn read_mem(&mut self, seg: SegReg, off: u32, width: Width) -> Result<u32, Fault> {
        let lin = self.linear(seg, off, width.bytes(), Access::Read)?;
        self.read_lin_width(lin, width, self.state.cpl())
    }

    pub fn write_mem(&mut self, seg: SegReg, off: u32, width: Width, value: u32) -> Result<(), Fault> {
        let lin = self.linear(seg, off, width.bytes(), Access::Write)?;
        self.write_lin_width(lin, width, value, self.state.cpl())
    }

    pub fn read_mem_bytes(&mut self, seg: SegReg, off: u32, buf: &mut [u8]) -> Result<(), Fault> {
        let lin = self.linear(seg, off, buf.len() as u32, Access::Read)?;
        self.read_lin(lin, buf, self.state.cpl())
    }

    pub fn write_mem_bytes(&mut self, seg: SegReg, off: u32, data: &[u8]) -> Result<(), Fault> {
        let lin = self.linear(seg, off, data.len() as u32, Access::Write)?;
        self.write_lin(lin, data, self.state.cpl())
    }

    pub fn read_mem64(&mut self, seg: SegReg, off: u32) -> Result<u64, Fault> {
        let mut buf = [0u8; 8];
        self.read_mem_bytes(seg, off, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_mem64(&mut self, seg: SegReg, off: u32, value: u64) -> Result<(), Fault> {
        self.write_mem_bytes(seg, off, &value.to_le_bytes())
    }

    pub fn read_mem128(&mut self, seg: SegReg, off: u32) -> Result<u128, Fault> {
        let mut buf = [0u8; 16];
        self.read_mem_bytes(seg, off, &mut buf)?;
        Ok(u128::from_le_bytes(buf))
    }

    pub fn write_mem128(&mut self, seg: SegReg, off: u32, value: u128) -> Result<(), Fault> {
        self.write_mem_bytes(seg, off, &value.to_le_bytes())
    }

    /// Supervisor-level read of a system structure (GDT, IDT, TSS).
    pub(crate) fn read_sys(&mut self, lin: u32, width: Width) -> Result<u32, Fault> {
        self.read_lin_width(lin, width, 0)
    }

    pub(crate) fn read_sys_u64(&mut self, lin: u32) -> Result<u64, Fault> {
        let mut buf = [0u8; 8];
        self.read_lin(lin, &mut buf, 0)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn write_sys(&mut self, lin: u32, width: Width, value: u32) -> Result<(), Fault> {
        self.write_lin_width(lin, width, value, 0)
    }

    /// Writes to an already checked stack segment at an explicit privilege
    /// level. Used for frames built before the new SS:ESP is committed.
    pub(crate) fn write_stack_at(
        &mut self,
        ss: &SegmentCache,
        off: u32,
        width: Width,
        value: u32,
        cpl: u8,
    ) -> Result<(), Fault> {
        if !ss.contains(off, width.bytes()) {
            return Err(Fault::StackSegment(0));
        }
        self.write_lin_width(ss.base.wrapping_add(off), width, value, cpl)
    }

    #[inline]
    fn stack_mask(&self) -> u32 {
        if self.state.stack32() {
            u32::MAX
        } else {
            0xffff
        }
    }

    pub(crate) fn set_esp(&mut self, value: u32) {
        if self.state.stack32() {
            self.state.gprs.set(ESP, value);
        } else {
            self.state.gprs.write(Width::Word, ESP, value);
        }
    }

    /// Pushes a word or dword. ESP only moves once the store succeeded.
    pub fn push(&mut self, width: Width, value: u32) -> Result<(), Fault> {
        let esp = self.state.gprs.get(ESP).wrapping_sub(width.bytes()) & self.stack_mask();
        self.write_mem(SegReg::Ss, esp, width, value)?;
        self.set_esp(esp);
        Ok(())
    }

    /// Reads the stack slot `depth` bytes above ESP without popping.
    pub(crate) fn peek(&mut self, depth: u32, width: Width) -> Result<u32, Fault> {
        let off = self.state.gprs.get(ESP).wrapping_add(depth) & self.stack_mask();
        self.read_mem(SegReg::Ss, off, width)
    }

    /// Releases `bytes` of stack.
    pub(crate) fn drop_stack(&mut self, bytes: u32) {
        let esp = self.state.gprs.get(ESP).wrapping_add(bytes) & self.stack_mask();
        self.set_esp(esp);
    }

    pub fn pop(&mut self, width: Width) -> Result<u32, Fault> {
        let v = self.peek(0, width)?;
        self.drop_stack(width.bytes());
        Ok(v)
    }

    /// Linear address of the descriptor for `sel`, after the table limit
    /// check.
    pub(crate) fn descriptor_addr(&self, sel: u16) -> Result<u32, Fault> {
        let index_off = (sel & !7) as u32;
        let (base, limit) = if sel & 4 != 0 {
            let ldt = &self.state.ldtr;
            if !ldt.valid || ldt.selector & !3 == 0 {
                return Err(Fault::GeneralProtection(sel & 0xfffc));
            }
            (ldt.base, ldt.limit)
        } else {
            (self.state.gdtr.base, self.state.gdtr.limit as u32)
        };
        if index_off + 7 > limit {
            return Err(Fault::GeneralProtection(sel & 0xfffc));
        }
        Ok(base.wrapping_add(index_off))
    }

    pub(crate) fn read_descriptor(&mut self, sel: u16) -> Result<Descriptor, Fault> {
        let addr = self.descriptor_addr(sel)?;
        Ok(Descriptor(self.read_sys_u64(addr)?))
    }

    /// Sets the accessed bit of a code/data descriptor in memory.
    pub(crate) fn mark_accessed(&mut self, sel: u16, desc: Descriptor) -> Result<(), Fault> {
        if desc.access() & AR_ACCESSED != 0 {
            return Ok(());
        }
        let addr = self.descriptor_addr(sel)?.wrapping_add(5);
        self.write_sys(addr, Width::Byte, (desc.access() | AR_ACCESSED) as u32)
    }

    /// Validates a data or stack segment load and returns the new cache.
    pub(crate) fn check_segment_load(&mut self, seg: SegReg, sel: u16) -> Result<SegmentCache, Fault> {
        match self.state.mode() {
            CpuMode::Real => return Ok(SegmentCache::real(sel)),
            CpuMode::Vm86 => return Ok(SegmentCache::vm86(sel)),
            CpuMode::Protected => {}
        }
        let cpl = self.state.cpl();
        let err = sel & 0xfffc;
        if sel & !3 == 0 {
            return match seg {
                SegReg::Ss | SegReg::Cs => Err(Fault::gp0()),
                _ => Ok(SegmentCache::null(sel)),
            };
        }
        let desc = self.read_descriptor(sel)?;
        let cache = SegmentCache::from_descriptor(sel, desc);
        let rpl = (sel & 3) as u8;
        if seg == SegReg::Ss {
            if rpl != cpl || desc.dpl() != cpl || !cache.writable() {
                return Err(Fault::GeneralProtection(err));
            }
            if !desc.present() {
                return Err(Fault::StackSegment(err));
            }
        } else {
            if !cache.readable() {
                return Err(Fault::GeneralProtection(err));
            }
            if !cache.conforming() && rpl.max(cpl) > desc.dpl() {
                return Err(Fault::GeneralProtection(err));
            }
            if !desc.present() {
                return Err(Fault::SegmentNotPresent(err));
            }
        }
        self.mark_accessed(sel, desc)?;
        Ok(SegmentCache {
            access: cache.access | AR_ACCESSED,
            ..cache
        })
    }

    /// Loads a data or stack segment register (MOV Sreg, POP Sreg, LDS...).
    pub fn load_segment(&mut self, seg: SegReg, sel: u16) -> Result<(), Fault> {
        let cache = self.check_segment_load(seg, sel)?;
        if self.state.mode() == CpuMode::Protected {
            tracing::debug!(?seg, selector = format_args!("{sel:#06x}"), base = format_args!("{:#010x}", cache.base), "segment load");
        }
        *self.state.seg_mut(seg) = cache;
        Ok(())
    }

    /// Far control transfer to `sel:offset`. Protected mode accepts direct
    /// code-segment targets only.
    pub(crate) fn far_jump(&mut self, sel: u16, offset: u32, op32: bool) -> Result<(), Fault> {
        let offset = if op32 { offset } else { offset & 0xffff };
        let cache = match self.state.mode() {
            CpuMode::Real => SegmentCache::real(sel),
            CpuMode::Vm86 => SegmentCache::vm86(sel),
            CpuMode::Protected => {
                let (cache, _) = self.check_code_target(sel, false)?;
                cache
            }
        };
        if !cache.contains(offset, 1) {
            return Err(Fault::gp0());
        }
        *self.state.seg_mut(SegReg::Cs) = cache;
        self.state.eip = offset;
        Ok(())
    }

    /// Checks a same-privilege code-segment target (far JMP/CALL, RETF).
    /// With `is_return`, an outer-privilege RPL is accepted and returned as
    /// the new CPL.
    pub(crate) fn check_code_target(
        &mut self,
        sel: u16,
        is_return: bool,
    ) -> Result<(SegmentCache, u8), Fault> {
        let cpl = self.state.cpl();
        let rpl = (sel & 3) as u8;
        let err = sel & 0xfffc;
        if sel & !3 == 0 {
            return Err(Fault::gp0());
        }
        let desc = self.read_descriptor(sel)?;
        let cache = SegmentCache::from_descriptor(sel, desc);
        if !cache.is_code() {
            return Err(Fault::GeneralProtection(err));
        }
        let new_cpl = if is_return {
            if rpl < cpl {
                return Err(Fault::GeneralProtection(err));
            }
            if cache.conforming() {
                if desc.dpl() > rpl {
                    return Err(Fault::GeneralProtection(err));
                }
            } else if desc.dpl() != rpl {
                return Err(Fault::GeneralProtection(err));
            }
            rpl
        } else {
            if cache.conforming() {
                if desc.dpl() > cpl {
                    return Err(Fault::GeneralProtection(err));
                }
            } else if rpl > cpl || desc.dpl() != cpl {
                return Err(Fault::GeneralProtection(err));
            }
            cpl
        };
        if !desc.present() {
            return Err(Fault::SegmentNotPresent(err));
        }
        self.mark_accessed(sel, desc)?;
        let cache = SegmentCache {
            selector: (sel & !3) | new_cpl as u16,
            access: cache.access | AR_ACCESSED,
            ..cache
        };
        Ok((cache, new_cpl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PcBus;
    use crate::config::CpuConfig;
    use crate::segment::{TableReg, FLAG_DB};

    fn cpu() -> Cpu<PcBus> {
        Cpu::new(CpuConfig::default(), PcBus::new(1 << 20)).unwrap()
    }

    fn flat_protected(cpu: &mut Cpu<PcBus>) {
        // GDT at 0x500: null, code 0x08, data 0x10, read-only data 0x18.
        let gdt = [
            0u64,
            0x00cf_9a00_0000_ffff,
            0x00cf_9200_0000_ffff,
            0x00cf_9000_0000_ffff,
        ];
        for (i, d) in gdt.iter().enumerate() {
            cpu.bus.load(0x500 + 8 * i as u64, &d.to_le_bytes());
        }
        cpu.state.gdtr = TableReg {
            base: 0x500,
            limit: 0x1f,
        };
        cpu.mmu.set_cr0(cpu.mmu.cr0() | 1);
        cpu.state.update_mode(true);
        let cs = cpu.read_descriptor(0x08).unwrap();
        *cpu.state.seg_mut(SegReg::Cs) = SegmentCache::from_descriptor(0x08, cs);
        cpu.state.update_mode(true);
    }

    #[test]
    fn real_mode_limit_faults() {
        let mut c = cpu();
        *c.state.seg_mut(SegReg::Ds) = SegmentCache::real(0);
        assert_eq!(c.read_mem(SegReg::Ds, 0xffff, Width::Word), Err(Fault::gp0()));
        assert_eq!(
            c.write_mem(SegReg::Ss, 0xffff, Width::Dword, 0),
            Err(Fault::StackSegment(0))
        );
        c.write_mem(SegReg::Ds, 0x10, Width::Dword, 0xdead_beef).unwrap();
        assert_eq!(c.read_mem(SegReg::Ds, 0x12, Width::Word).unwrap(), 0xdead);
    }

    #[test]
    fn protected_loads_check_type_and_mark_accessed() {
        let mut c = cpu();
        flat_protected(&mut c);
        c.load_segment(SegReg::Ds, 0x10).unwrap();
        assert_eq!(c.bus.ram()[0x500 + 0x10 + 5] & AR_ACCESSED, AR_ACCESSED);
        assert_eq!(c.state.seg(SegReg::Ds).flags & FLAG_DB, FLAG_DB);

        // Null selector loads fine, then faults on use.
        c.load_segment(SegReg::Es, 0).unwrap();
        assert_eq!(c.read_mem(SegReg::Es, 0, Width::Byte), Err(Fault::gp0()));
        assert_eq!(c.load_segment(SegReg::Ss, 0), Err(Fault::gp0()));

        // Beyond the GDT limit.
        assert_eq!(
            c.load_segment(SegReg::Ds, 0x20),
            Err(Fault::GeneralProtection(0x20))
        );
        // SS must be writable.
        assert_eq!(
            c.load_segment(SegReg::Ss, 0x18),
            Err(Fault::GeneralProtection(0x18))
        );
        c.load_segment(SegReg::Fs, 0x18).unwrap();
        assert_eq!(c.write_mem(SegReg::Fs, 0, Width::Byte, 1), Err(Fault::gp0()));
    }

    #[test]
    fn push_commits_esp_only_on_success() {
        let mut c = cpu();
        *c.state.seg_mut(SegReg::Ss) = SegmentCache::real(0);
        c.state.gprs.set(ESP, 0x100);
        c.push(Width::Word, 0x1234).unwrap();
        assert_eq!(c.state.gprs.get(ESP), 0xfe);
        assert_eq!(c.pop(Width::Word).unwrap(), 0x1234);

        // SP=1: a word push wraps to 0xffff and overruns the limit.
        c.state.gprs.set(ESP, 1);
        assert_eq!(c.push(Width::Word, 1), Err(Fault::StackSegment(0)));
        assert_eq!(c.state.gprs.get(ESP), 1);
    }
}
