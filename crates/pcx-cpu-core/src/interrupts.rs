//! Interrupt/exception delivery (IVT/IDT), privilege transitions and IRET.
//!
//! [`crate::state::CpuState`] only carries architecturally visible state. The
//! bookkeeping the driver needs between instructions (interrupt shadow,
//! queued events, NMI latch) lives in [`PendingEventState`].

use crate::bus::Bus;
use crate::cpu::Cpu;
use crate::fault::{escalates_to_double_fault, CpuExit, Fault, FaultClass};
use crate::flags::{
    FLAG_AC, FLAG_IF, FLAG_IOPL, FLAG_NT, FLAG_RESERVED1, FLAG_RF, FLAG_TF, FLAG_VM,
};
use crate::regs::{Width, ESP};
use crate::segment::{
    SegReg, SegmentCache, AR_ACCESSED, SYS_INT_GATE16, SYS_INT_GATE32, SYS_TRAP_GATE16,
    SYS_TRAP_GATE32, SYS_TSS32_AVAIL, SYS_TSS32_BUSY,
};
use crate::state::CpuMode;

pub const NMI_VECTOR: u8 = 2;

/// Cycles charged for delivering an event, by mode.
const REAL_MODE_DELIVERY_CYCLES: u32 = 26;
const SAME_LEVEL_DELIVERY_CYCLES: u32 = 44;
const INNER_LEVEL_DELIVERY_CYCLES: u32 = 71;

/// External interrupt controller interface.
pub trait InterruptController {
    /// Returns the next pending external interrupt vector, if any.
    fn poll_interrupt(&mut self) -> Option<u8>;

    /// Called once the CPU has committed to delivering `vector`.
    fn acknowledge(&mut self, _vector: u8) {}
}

/// A controller with no interrupt sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInterrupts;

impl InterruptController for NoInterrupts {
    fn poll_interrupt(&mut self) -> Option<u8> {
        None
    }
}

/// Something to deliver through the IVT/IDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Exception(Fault),
    /// INT n / INT3 / INTO. Subject to the gate DPL check.
    Software { vector: u8, return_eip: u32 },
    External(u8),
    Nmi,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingEventState {
    pending_event: Option<Event>,
    /// Interrupt shadow (STI / MOV SS / POP SS).
    interrupt_inhibit: u8,
    /// Set while the instruction that armed the shadow is still executing.
    shadow_armed: bool,
    nmi_pending: bool,
    /// NMIs are blocked from delivery until the next IRET.
    nmi_blocked: bool,
}

impl PendingEventState {
    /// Queues an event for delivery at the next instruction boundary.
    pub fn raise(&mut self, event: Event) {
        self.pending_event = Some(event);
    }

    pub fn has_pending_event(&self) -> bool {
        self.pending_event.is_some()
    }

    pub(crate) fn take_event(&mut self) -> Option<Event> {
        self.pending_event.take()
    }

    pub fn raise_nmi(&mut self) {
        self.nmi_pending = true;
    }

    pub fn nmi_pending(&self) -> bool {
        self.nmi_pending
    }

    pub(crate) fn take_nmi(&mut self) -> bool {
        if self.nmi_pending && !self.nmi_blocked && self.interrupt_inhibit == 0 {
            self.nmi_pending = false;
            self.nmi_blocked = true;
            return true;
        }
        false
    }

    pub(crate) fn unblock_nmi(&mut self) {
        self.nmi_blocked = false;
    }

    /// Inhibits maskable interrupts until the instruction after the current
    /// one has retired.
    pub fn inhibit_interrupts_for_one_instruction(&mut self) {
        self.interrupt_inhibit = 1;
        self.shadow_armed = true;
    }

    pub fn interrupt_inhibit(&self) -> u8 {
        self.interrupt_inhibit
    }

    /// Drops the interrupt shadow. An event handler's first instruction
    /// never inherits the shadow of the instruction it interrupted.
    pub fn clear_interrupt_shadow(&mut self) {
        self.interrupt_inhibit = 0;
        self.shadow_armed = false;
    }

    /// Ages the interrupt shadow after an instruction retires.
    pub fn retire_instruction(&mut self) {
        if self.shadow_armed {
            self.shadow_armed = false;
        } else if self.interrupt_inhibit > 0 {
            self.interrupt_inhibit -= 1;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Gate {
    selector: u16,
    offset: u32,
    dpl: u8,
    is_32: bool,
    is_interrupt: bool,
}

impl<B: Bus> Cpu<B> {
    /// Delivers `event`, escalating to #DF and finally to a triple fault when
    /// delivery itself faults.
    pub fn deliver(&mut self, event: Event) -> Result<(), CpuExit> {
        let mut current = event;
        let mut class = match event {
            Event::Exception(fault) => Some(fault.class()),
            _ => None,
        };
        // Benign → contributory → #DF → triple fault is the longest chain.
        for _ in 0..4 {
            match self.deliver_once(current) {
                Ok(()) => {
                    self.pending.clear_interrupt_shadow();
                    self.stats.events_delivered += 1;
                    return Ok(());
                }
                Err(second) => {
                    if class == Some(FaultClass::DoubleFault) {
                        break;
                    }
                    let next = match class {
                        Some(first) if escalates_to_double_fault(first, second.class()) => {
                            Fault::DoubleFault
                        }
                        _ => second,
                    };
                    tracing::debug!(?current, fault = %second, escalated = %next, "fault during delivery");
                    class = Some(next.class());
                    current = Event::Exception(next);
                }
            }
        }
        tracing::error!(eip = format_args!("{:#010x}", self.state.eip), "triple fault");
        Err(CpuExit::TripleFault)
    }

    /// Software interrupt raised by INT n. On failure the caller's
    /// instruction faults with EIP still pointing at it.
    pub(crate) fn software_interrupt(&mut self, vector: u8) -> Result<(), Fault> {
        if self.state.mode() == CpuMode::Vm86 && self.state.flags.iopl() < 3 {
            return Err(Fault::gp0());
        }
        self.software_trap(vector)
    }

    /// INT3 and INTO: like INT n but not IOPL-sensitive in V86 mode.
    pub(crate) fn software_trap(&mut self, vector: u8) -> Result<(), Fault> {
        let return_eip = self.state.eip;
        self.deliver_once(Event::Software { vector, return_eip })
    }

    fn deliver_once(&mut self, event: Event) -> Result<(), Fault> {
        let (vector, error_code, software) = match event {
            Event::Exception(fault) => {
                tracing::debug!(%fault, eip = format_args!("{:#010x}", self.state.eip), "delivering exception");
                (fault.vector(), fault.error_code(), false)
            }
            Event::Software { vector, return_eip } => {
                self.state.eip = return_eip;
                (vector, None, true)
            }
            Event::External(vector) => (vector, None, false),
            Event::Nmi => (NMI_VECTOR, None, false),
        };
        self.state.flags.rebuild();
        self.state.halted = false;
        self.flush_prefetch();
        match self.state.mode() {
            CpuMode::Real => self.deliver_real(vector),
            CpuMode::Protected | CpuMode::Vm86 => {
                self.deliver_protected(vector, error_code, software)
            }
        }
    }

    fn deliver_real(&mut self, vector: u8) -> Result<(), Fault> {
        let entry = vector as u32 * 4;
        if entry + 3 > self.state.idtr.limit as u32 {
            return Err(Fault::gp0());
        }
        let ivt = self.state.idtr.base.wrapping_add(entry);
        let ip = self.read_sys(ivt, Width::Word)?;
        let cs = self.read_sys(ivt.wrapping_add(2), Width::Word)? as u16;

        let ss = *self.state.seg(SegReg::Ss);
        let frame = [
            self.state.flags.eflags() & 0xffff,
            self.state.seg(SegReg::Cs).selector as u32,
            self.state.eip & 0xffff,
        ];
        let esp = self.push_frame(&ss, self.state.gprs.get(ESP), false, Width::Word, &frame, 0)?;
        self.set_esp(esp);

        self.state.flags.set(FLAG_IF | FLAG_TF | FLAG_AC, false);
        *self.state.seg_mut(SegReg::Cs) = SegmentCache::real(cs);
        self.state.eip = ip;
        self.charge(REAL_MODE_DELIVERY_CYCLES);
        Ok(())
    }

    /// Writes `values` downwards from `esp` on `ss` and returns the new ESP.
    fn push_frame(
        &mut self,
        ss: &SegmentCache,
        esp: u32,
        stack32: bool,
        width: Width,
        values: &[u32],
        cpl: u8,
    ) -> Result<u32, Fault> {
        let mask = if stack32 { u32::MAX } else { 0xffff };
        let mut esp = esp;
        for &v in values {
            esp = esp.wrapping_sub(width.bytes()) & mask;
            self.write_stack_at(ss, esp, width, v, cpl)?;
        }
        Ok(esp)
    }

    fn read_gate(&mut self, vector: u8) -> Result<Gate, Fault> {
        let idt_err = Fault::GeneralProtection(vector as u16 * 8 + 2);
        let entry = vector as u32 * 8;
        if entry + 7 > self.state.idtr.limit as u32 {
            return Err(idt_err);
        }
        let desc = crate::segment::Descriptor(
            self.read_sys_u64(self.state.idtr.base.wrapping_add(entry))?,
        );
        if !desc.is_system() {
            return Err(idt_err);
        }
        let kind = desc.system_type();
        let (is_32, is_interrupt) = match kind {
            SYS_INT_GATE16 => (false, true),
            SYS_TRAP_GATE16 => (false, false),
            SYS_INT_GATE32 => (true, true),
            SYS_TRAP_GATE32 => (true, false),
            // Task gates are not supported by this core.
            _ => return Err(idt_err),
        };
        if !desc.present() {
            return Err(Fault::SegmentNotPresent(vector as u16 * 8 + 2));
        }
        Ok(Gate {
            selector: desc.gate_selector(),
            offset: if is_32 {
                desc.gate_offset()
            } else {
                desc.gate_offset() & 0xffff
            },
            dpl: desc.dpl(),
            is_32,
            is_interrupt,
        })
    }

    /// Reads the ring `cpl` stack pointer from the current TSS.
    fn tss_stack(&mut self, cpl: u8) -> Result<(u16, u32), Fault> {
        let tr = self.state.tr;
        let ts = Fault::InvalidTss(tr.selector & 0xfffc);
        if !tr.valid {
            return Err(ts);
        }
        let is_32 = matches!(tr.access & 0xf, SYS_TSS32_AVAIL | SYS_TSS32_BUSY);
        if is_32 {
            let off = 4 + 8 * cpl as u32;
            if off + 7 > tr.limit {
                return Err(ts);
            }
            let esp = self.read_sys(tr.base.wrapping_add(off), Width::Dword)?;
            let ss = self.read_sys(tr.base.wrapping_add(off + 4), Width::Word)? as u16;
            Ok((ss, esp))
        } else {
            let off = 2 + 4 * cpl as u32;
            if off + 3 > tr.limit {
                return Err(ts);
            }
            let sp = self.read_sys(tr.base.wrapping_add(off), Width::Word)?;
            let ss = self.read_sys(tr.base.wrapping_add(off + 2), Width::Word)? as u16;
            Ok((ss, sp))
        }
    }

    /// Validates the inner-level stack segment named by the TSS.
    fn check_tss_stack_segment(&mut self, sel: u16, new_cpl: u8) -> Result<SegmentCache, Fault> {
        let err = Fault::InvalidTss(sel & 0xfffc);
        if sel & !3 == 0 || (sel & 3) as u8 != new_cpl {
            return Err(err);
        }
        let desc = self.read_descriptor(sel)?;
        let cache = SegmentCache::from_descriptor(sel, desc);
        if !cache.writable() || desc.dpl() != new_cpl {
            return Err(err);
        }
        if !desc.present() {
            return Err(Fault::StackSegment(sel & 0xfffc));
        }
        self.mark_accessed(sel, desc)?;
        Ok(SegmentCache {
            access: cache.access | AR_ACCESSED,
            ..cache
        })
    }

    fn deliver_protected(
        &mut self,
        vector: u8,
        error_code: Option<u32>,
        software: bool,
    ) -> Result<(), Fault> {
        let gate = self.read_gate(vector)?;
        let cpl = self.state.cpl();
        if software && gate.dpl < cpl {
            return Err(Fault::GeneralProtection(vector as u16 * 8 + 2));
        }

        let sel = gate.selector;
        let err = sel & 0xfffc;
        if sel & !3 == 0 {
            return Err(Fault::gp0());
        }
        let desc = self.read_descriptor(sel)?;
        let target = SegmentCache::from_descriptor(sel, desc);
        if !target.is_code() || desc.dpl() > cpl {
            return Err(Fault::GeneralProtection(err));
        }
        if !desc.present() {
            return Err(Fault::SegmentNotPresent(err));
        }
        let from_vm86 = self.state.mode() == CpuMode::Vm86;
        let new_cpl = if target.conforming() { cpl } else { desc.dpl() };
        if from_vm86 && new_cpl != 0 {
            return Err(Fault::GeneralProtection(err));
        }
        let width = if gate.is_32 { Width::Dword } else { Width::Word };

        let eflags = self.state.flags.eflags();
        let cs_sel = self.state.seg(SegReg::Cs).selector as u32;
        let eip = self.state.eip;
        let mut frame: Vec<u32> = Vec::with_capacity(10);

        let switch = new_cpl < cpl || from_vm86;
        let (ss, esp) = if switch {
            let (ss_sel, esp) = self.tss_stack(new_cpl)?;
            let ss = self.check_tss_stack_segment(ss_sel, new_cpl)?;
            if from_vm86 {
                for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                    frame.push(self.state.seg(seg).selector as u32);
                }
            }
            frame.push(self.state.seg(SegReg::Ss).selector as u32);
            frame.push(self.state.gprs.get(ESP));
            (ss, esp)
        } else {
            (*self.state.seg(SegReg::Ss), self.state.gprs.get(ESP))
        };
        frame.extend([eflags, cs_sel, eip]);
        if let Some(code) = error_code {
            frame.push(code);
        }

        let new_esp = self.push_frame(&ss, esp, ss.big(), width, &frame, new_cpl)?;

        // Frame is on the stack; commit.
        if switch {
            *self.state.seg_mut(SegReg::Ss) = ss;
        }
        if from_vm86 {
            for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
                *self.state.seg_mut(seg) = SegmentCache::null(0);
            }
        }
        if ss.big() {
            self.state.gprs.set(ESP, new_esp);
        } else {
            self.state.gprs.write(Width::Word, ESP, new_esp);
        }
        *self.state.seg_mut(SegReg::Cs) = SegmentCache {
            selector: (sel & !3) | new_cpl as u16,
            ..target
        };
        self.state.flags.set(FLAG_TF | FLAG_NT | FLAG_RF | FLAG_VM, false);
        if gate.is_interrupt {
            self.state.flags.set(FLAG_IF, false);
        }
        self.state.update_mode(true);
        self.state.set_cpl(new_cpl);
        self.state.eip = gate.offset;
        self.charge(if switch {
            INNER_LEVEL_DELIVERY_CYCLES
        } else {
            SAME_LEVEL_DELIVERY_CYCLES
        });
        Ok(())
    }

    /// Merges a popped EFLAGS image under the IOPL/CPL rules shared by IRET
    /// and POPF. VM is never taken from `value`.
    pub(crate) fn merge_popped_flags(&self, value: u32, width: Width) -> u32 {
        let old = self.state.flags.eflags();
        let mut keep = FLAG_VM;
        if width == Width::Word {
            keep |= 0xffff_0000;
        }
        match self.state.mode() {
            CpuMode::Real => {}
            CpuMode::Vm86 => keep |= FLAG_IOPL,
            CpuMode::Protected => {
                let cpl = self.state.cpl();
                if cpl > 0 {
                    keep |= FLAG_IOPL;
                }
                if cpl > self.state.flags.iopl() {
                    keep |= FLAG_IF;
                }
            }
        }
        (old & keep) | (value & !keep) | FLAG_RESERVED1
    }

    pub(crate) fn iret(&mut self, op32: bool) -> Result<(), Fault> {
        let width = Width::from_op32(op32);
        let size = width.bytes();
        match self.state.mode() {
            CpuMode::Vm86 if self.state.flags.iopl() < 3 => return Err(Fault::gp0()),
            CpuMode::Real | CpuMode::Vm86 => {
                let ip = self.peek(0, width)?;
                let cs = self.peek(size, width)? as u16;
                let flags = self.peek(2 * size, width)?;
                if ip > 0xffff {
                    return Err(Fault::gp0());
                }
                let merged = self.merge_popped_flags(flags, width);
                self.drop_stack(3 * size);
                let cache = if self.state.mode() == CpuMode::Vm86 {
                    SegmentCache::vm86(cs)
                } else {
                    SegmentCache::real(cs)
                };
                *self.state.seg_mut(SegReg::Cs) = cache;
                self.state.eip = ip;
                self.state.flags.set_eflags(merged);
            }
            CpuMode::Protected => self.iret_protected(width)?,
        }
        self.pending.unblock_nmi();
        Ok(())
    }

    fn iret_protected(&mut self, width: Width) -> Result<(), Fault> {
        if self.state.flags.get(FLAG_NT) {
            // Nested task return needs a task switch, which this core lacks.
            return Err(Fault::gp0());
        }
        let size = width.bytes();
        let eip = self.peek(0, width)?;
        let cs = self.peek(size, width)? as u16;
        let flags = self.peek(2 * size, width)?;
        let cpl = self.state.cpl();

        if width == Width::Dword && flags & FLAG_VM != 0 && cpl == 0 {
            let esp = self.peek(12, width)?;
            let mut sels = [0u16; 5];
            for (i, slot) in sels.iter_mut().enumerate() {
                *slot = self.peek(16 + 4 * i as u32, width)? as u16;
            }
            let [ss, es, ds, fs, gs] = sels;
            self.state.flags.set_eflags(flags | FLAG_VM);
            for (seg, sel) in [
                (SegReg::Cs, cs),
                (SegReg::Ss, ss),
                (SegReg::Es, es),
                (SegReg::Ds, ds),
                (SegReg::Fs, fs),
                (SegReg::Gs, gs),
            ] {
                *self.state.seg_mut(seg) = SegmentCache::vm86(sel);
            }
            self.state.update_mode(true);
            self.state.gprs.set(ESP, esp);
            self.state.eip = eip & 0xffff;
            return Ok(());
        }

        let (target, new_cpl) = self.check_code_target(cs, true)?;
        let merged = self.merge_popped_flags(flags, width);
        if new_cpl > cpl {
            let esp = self.peek(3 * size, width)?;
            let ss_sel = self.peek(4 * size, width)? as u16;
            let err = ss_sel & 0xfffc;
            if ss_sel & !3 == 0 || (ss_sel & 3) as u8 != new_cpl {
                return Err(Fault::GeneralProtection(err));
            }
            let desc = self.read_descriptor(ss_sel)?;
            let ss = SegmentCache::from_descriptor(ss_sel, desc);
            if !ss.writable() || desc.dpl() != new_cpl {
                return Err(Fault::GeneralProtection(err));
            }
            if !desc.present() {
                return Err(Fault::StackSegment(err));
            }
            if !target.contains(eip, 1) {
                return Err(Fault::gp0());
            }
            self.mark_accessed(ss_sel, desc)?;
            *self.state.seg_mut(SegReg::Cs) = target;
            *self.state.seg_mut(SegReg::Ss) = ss;
            self.state.set_cpl(new_cpl);
            self.set_esp(esp);
            for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
                let cache = self.state.seg(seg);
                if cache.valid && !cache.conforming() && cache.dpl() < new_cpl {
                    *self.state.seg_mut(seg) = SegmentCache::null(0);
                }
            }
        } else {
            if !target.contains(eip, 1) {
                return Err(Fault::gp0());
            }
            self.drop_stack(3 * size);
            *self.state.seg_mut(SegReg::Cs) = target;
        }
        self.state.flags.set_eflags(merged);
        self.state.eip = eip;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_covers_exactly_the_next_instruction() {
        let mut p = PendingEventState::default();
        p.inhibit_interrupts_for_one_instruction();
        // Retiring the arming instruction keeps the shadow up.
        p.retire_instruction();
        assert_eq!(p.interrupt_inhibit(), 1);
        p.retire_instruction();
        assert_eq!(p.interrupt_inhibit(), 0);
    }

    #[test]
    fn nmi_blocked_until_iret() {
        let mut p = PendingEventState::default();
        p.raise_nmi();
        assert!(p.take_nmi());
        p.raise_nmi();
        assert!(!p.take_nmi());
        p.unblock_nmi();
        assert!(p.take_nmi());
    }
}
