//! The interpreter driver: prefix decode, dispatch, fault routing, interrupt
//! polling and per-instruction retirement.

use pcx_mmu::{FlushKind, Mmu};

use crate::bus::Bus;
use crate::config::{ConfigError, CpuConfig, CpuModel, Features};
use crate::control::{Cr0, DR6_BS};
use crate::dispatch::DispatchTable;
use crate::fault::{CpuExit, Fault};
use crate::flags::FLAG_TF;
use crate::fpu::{backend_for, FpuBackend};
use crate::interrupts::{Event, InterruptController, PendingEventState};
use crate::modrm::{self, ModRm, Operand};
use crate::regs::{Width, EDX};
use crate::segment::SegReg;
use crate::smm::SmmState;
use crate::state::CpuState;
use crate::timing::{ChargeOrder, CycleCounter, InstrClass, PrefetchQueue};

/// Longest legal instruction, prefixes included.
pub const MAX_INSN_LEN: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rep {
    /// F3: REP / REPE.
    Repe,
    /// F2: REPNE.
    Repne,
}

/// Prefix state of the instruction being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    /// Primary opcode; two-byte opcodes are `0x100 | second byte`.
    pub opcode: u16,
    pub op32: bool,
    pub addr32: bool,
    pub seg_override: Option<SegReg>,
    pub rep: Option<Rep>,
    pub lock: bool,
    /// EIP of the first prefix byte.
    pub start_eip: u32,
}

impl Insn {
    #[inline]
    pub fn width(&self) -> Width {
        Width::from_op32(self.op32)
    }

    /// Default-DS segment with the override applied.
    #[inline]
    pub fn data_seg(&self) -> SegReg {
        self.seg_override.unwrap_or(SegReg::Ds)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    pub instructions: u64,
    pub prefetch_stall_cycles: u64,
    pub events_delivered: u64,
}

pub struct Cpu<B: Bus> {
    pub state: CpuState,
    pub mmu: Mmu,
    pub bus: B,
    pub pending: PendingEventState,
    pub smm: SmmState,
    pub stats: CpuStats,
    pub(crate) cycles: CycleCounter,
    pub(crate) config: CpuConfig,
    pub(crate) fpu_backend: Box<dyn FpuBackend>,
    table: DispatchTable<B>,
    /// Cached translation of the page EIP is executing from.
    fetch_window: Option<(u32, u64)>,
    prefetch: PrefetchQueue,
    fetch_count: u32,
    pub(crate) mem_accesses: u32,
    insn_cycles: u32,
}

impl<B: Bus> core::fmt::Debug for Cpu<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cpu")
            .field("model", &self.config.model)
            .field("eip", &format_args!("{:#010x}", self.state.eip))
            .field("mode", &self.state.mode())
            .field("cycles", &self.cycles.get())
            .finish_non_exhaustive()
    }
}

impl<B: Bus> Cpu<B> {
    pub fn new(config: CpuConfig, bus: B) -> Result<Self, ConfigError> {
        Self::with_counter(config, bus, CycleCounter::default())
    }

    /// Builds a CPU that charges an externally owned cycle counter.
    pub fn with_counter(config: CpuConfig, bus: B, cycles: CycleCounter) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut cpu = Self {
            state: CpuState::new(),
            mmu: Mmu::new(),
            bus,
            pending: PendingEventState::default(),
            smm: SmmState::default(),
            stats: CpuStats::default(),
            cycles,
            fpu_backend: backend_for(config.fpu_backend),
            table: DispatchTable::build(&config),
            config,
            fetch_window: None,
            prefetch: PrefetchQueue::default(),
            fetch_count: 0,
            mem_accesses: 0,
            insn_cycles: 0,
        };
        cpu.reset();
        Ok(cpu)
    }

    /// Power-on reset. Memory and device state are left alone.
    pub fn reset(&mut self) {
        self.state = CpuState::new();
        self.state.gprs.set(EDX, self.config.model.cpuid_signature());
        self.mmu = Mmu::new();
        if self.config.has(Features::FPU) {
            self.mmu.set_cr0(Cr0::ET.bits());
        }
        self.pending = PendingEventState::default();
        self.smm = SmmState::default();
        self.fetch_window = None;
        self.prefetch.flush();
    }

    #[inline]
    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    #[inline]
    pub fn model(&self) -> CpuModel {
        self.config.model
    }

    #[inline]
    pub fn cycles(&self) -> &CycleCounter {
        &self.cycles
    }

    pub fn fpu_backend(&self) -> &dyn FpuBackend {
        &*self.fpu_backend
    }

    pub fn fetch_window_valid(&self) -> bool {
        self.fetch_window.is_some()
    }

    pub fn prefetch_queued(&self) -> i32 {
        self.prefetch.queued()
    }

    #[inline]
    pub fn cr0(&self) -> Cr0 {
        Cr0::from_bits_retain(self.mmu.cr0())
    }

    /// Requests a non-maskable interrupt at the next instruction boundary.
    pub fn raise_nmi(&mut self) {
        self.pending.raise_nmi();
    }

    /// Asserts the SMI line. Ignored on models without SMM.
    pub fn raise_smi(&mut self) {
        if !self.config.has(Features::CYRIX_SMM) {
            tracing::debug!(model = ?self.config.model, "SMI ignored, no SMM support");
            return;
        }
        self.smm.raise();
    }

    /// Runs until the cycle counter is exhausted, after loading it with
    /// `budget`. Returns the number of instructions retired.
    pub fn run(&mut self, budget: i64, ic: &mut impl InterruptController) -> Result<u64, CpuExit> {
        self.cycles.set(budget);
        let start = self.stats.instructions;
        while !self.cycles.exhausted() {
            self.step(ic)?;
        }
        Ok(self.stats.instructions - start)
    }

    /// Executes one instruction or delivers one event.
    pub fn step(&mut self, ic: &mut impl InterruptController) -> Result<(), CpuExit> {
        if self.smm.smi_ready() {
            self.enter_smm();
            return Ok(());
        }

        if let Some(event) = self.pending.take_event() {
            self.state.halted = false;
            return self.deliver(event);
        }

        if self.pending.take_nmi() {
            self.state.halted = false;
            return self.deliver(Event::Nmi);
        }

        if self.state.flags.if_() && self.pending.interrupt_inhibit() == 0 {
            if let Some(vector) = ic.poll_interrupt() {
                ic.acknowledge(vector);
                self.state.halted = false;
                return self.deliver(Event::External(vector));
            }
        }

        if self.state.halted {
            if !self.state.flags.if_() {
                tracing::error!(eip = self.state.eip, "halted with interrupts disabled");
                return Err(CpuExit::Shutdown);
            }
            let idle = self.cycles.get().clamp(1, u32::MAX as i64) as u32;
            self.cycles.charge(idle);
            return Ok(());
        }

        self.execute_one()
    }

    fn execute_one(&mut self) -> Result<(), CpuExit> {
        let start = self.state.eip;
        self.state.prev_eip = start;
        self.fetch_count = 0;
        self.mem_accesses = 0;
        self.insn_cycles = 0;
        let single_step = self.state.flags.get(FLAG_TF);

        let mut insn = Insn {
            opcode: 0,
            op32: false,
            addr32: false,
            seg_override: None,
            rep: None,
            lock: false,
            start_eip: start,
        };
        match self.decode_and_dispatch(&mut insn) {
            Ok(()) => self.retire(&insn, single_step),
            Err(fault) => {
                if !fault.is_trap() {
                    self.state.eip = self.state.prev_eip;
                }
                self.prefetch.flush();
                self.deliver(Event::Exception(fault))
            }
        }
    }

    fn decode_and_dispatch(&mut self, insn: &mut Insn) -> Result<(), Fault> {
        let code32 = self.state.code32();
        insn.op32 = code32;
        insn.addr32 = code32;
        loop {
            let b = self.fetch_u8()?;
            match b {
                0x26 | 0x2e | 0x36 | 0x3e => insn.seg_override = SegReg::from_index((b >> 3) & 3),
                0x64 => insn.seg_override = Some(SegReg::Fs),
                0x65 => insn.seg_override = Some(SegReg::Gs),
                0x66 => insn.op32 = !code32,
                0x67 => insn.addr32 = !code32,
                0xf0 => insn.lock = true,
                0xf2 => insn.rep = Some(Rep::Repne),
                0xf3 => insn.rep = Some(Rep::Repe),
                0x0f => {
                    insn.opcode = 0x100 | self.fetch_u8()? as u16;
                    break;
                }
                _ => {
                    insn.opcode = b as u16;
                    break;
                }
            }
        }

        match self.table.get(insn.opcode, insn.addr32) {
            Some(handler) => handler(self, insn),
            None => {
                tracing::warn!(
                    opcode = format_args!("{:#05x}", insn.opcode),
                    eip = format_args!("{:#010x}", insn.start_eip),
                    model = ?self.config.model,
                    "no handler for opcode"
                );
                Err(Fault::InvalidOpcode)
            }
        }
    }

    fn retire(&mut self, insn: &Insn, single_step: bool) -> Result<(), CpuExit> {
        self.pending.retire_instruction();
        self.stats.instructions += 1;

        if self.config.prefetch {
            let stall = self
                .prefetch
                .run(self.fetch_count, self.insn_cycles, self.mem_accesses);
            if stall != 0 {
                self.cycles.charge(stall);
                self.stats.prefetch_stall_cycles += stall as u64;
            }
            if self.state.eip != insn.start_eip.wrapping_add(self.fetch_count) {
                self.prefetch.flush();
            }
        }

        tracing::trace!(
            eip = format_args!("{:#010x}", insn.start_eip),
            opcode = format_args!("{:#05x}", insn.opcode),
            cycles = self.insn_cycles,
            "retired"
        );

        if single_step && self.state.flags.get(FLAG_TF) {
            self.state.dr.dr6 |= DR6_BS;
            return self.deliver(Event::Exception(Fault::Debug));
        }
        Ok(())
    }

    /// Picks the 486-class or 386 cycle count for the configured model.
    #[inline]
    pub(crate) fn cyc(&self, c486: u32, c386: u32) -> u32 {
        if self.config.model.is_486_class() {
            c486
        } else {
            c386
        }
    }

    #[inline]
    pub(crate) fn charge(&mut self, cycles: u32) {
        self.cycles.charge(cycles);
        self.insn_cycles += cycles;
    }

    /// Completes a handler under its class's charge ordering.
    ///
    /// `result` is the outcome of the handler's final access.
    pub(crate) fn finish(
        &mut self,
        class: InstrClass,
        cycles: u32,
        result: Result<(), Fault>,
    ) -> Result<(), Fault> {
        match self.config.cycle_policy.order(class) {
            ChargeOrder::ChargeThenCheck => {
                self.charge(cycles);
                result
            }
            ChargeOrder::CheckThenCharge => {
                result?;
                self.charge(cycles);
                Ok(())
            }
        }
    }

    /// Applies the side effects of a translation flush on the fetch path.
    pub(crate) fn after_flush(&mut self, kind: Option<FlushKind>) {
        if let Some(kind) = kind {
            tracing::debug!(?kind, "translation flush");
            if matches!(kind, FlushKind::Full | FlushKind::NonGlobal) {
                self.invalidate_fetch_window();
            }
        }
    }

    pub(crate) fn flush_prefetch(&mut self) {
        self.prefetch.flush();
    }

    pub(crate) fn invalidate_fetch_window(&mut self) {
        self.fetch_window = None;
    }

    /// Fetches one instruction byte at CS:EIP and advances EIP.
    pub(crate) fn fetch_u8(&mut self) -> Result<u8, Fault> {
        self.fetch_count += 1;
        if self.fetch_count > MAX_INSN_LEN {
            return Err(Fault::gp0());
        }
        let eip = self.state.eip;
        let cs = *self.state.seg(SegReg::Cs);
        if !cs.contains(eip, 1) {
            return Err(Fault::gp0());
        }
        let lin = cs.base.wrapping_add(eip);
        let page = lin & !0xfff;
        let phys_page = match self.fetch_window {
            Some((lin_page, phys_page)) if lin_page == page => phys_page,
            _ => {
                let phys = self.translate(page, pcx_mmu::AccessType::Execute, self.state.cpl())?;
                self.fetch_window = Some((page, phys));
                phys
            }
        };
        let byte = self.bus.read_u8(phys_page | (lin & 0xfff) as u64);
        self.state.eip = if self.state.code32() {
            eip.wrapping_add(1)
        } else {
            eip.wrapping_add(1) & 0xffff
        };
        Ok(byte)
    }

    pub(crate) fn fetch_imm(&mut self, width: Width) -> Result<u32, Fault> {
        let mut v = 0u32;
        for i in 0..width.bytes() {
            v |= (self.fetch_u8()? as u32) << (8 * i);
        }
        Ok(v)
    }

    /// Fetches a sign-extended 8-bit immediate.
    pub(crate) fn fetch_simm8(&mut self) -> Result<u32, Fault> {
        Ok(Width::Byte.sign_extend(self.fetch_u8()? as u32))
    }

    pub(crate) fn modrm(&mut self, insn: &Insn) -> Result<ModRm, Fault> {
        let byte = self.fetch_u8()?;
        let gprs = self.state.gprs;
        modrm::decode(byte, insn.addr32, insn.seg_override, &gprs, || self.fetch_u8())
    }

    pub(crate) fn read_rm(&mut self, m: &ModRm, width: Width) -> Result<u32, Fault> {
        match m.operand {
            Operand::Reg(r) => Ok(self.state.gprs.read(width, r)),
            Operand::Mem { seg, off } => self.read_mem(seg, off, width),
        }
    }

    pub(crate) fn write_rm(&mut self, m: &ModRm, width: Width, value: u32) -> Result<(), Fault> {
        match m.operand {
            Operand::Reg(r) => {
                self.state.gprs.write(width, r, value);
                Ok(())
            }
            Operand::Mem { seg, off } => self.write_mem(seg, off, width, value),
        }
    }

    /// Memory-form-only operand (LEA, LGDT, BOUND, ...). Register form is #UD.
    pub(crate) fn mem_operand(m: &ModRm) -> Result<(SegReg, u32), Fault> {
        match m.operand {
            Operand::Mem { seg, off } => Ok((seg, off)),
            Operand::Reg(_) => Err(Fault::InvalidOpcode),
        }
    }

    /// Privileged instructions: CPL 0 outside real mode, else #GP(0).
    pub(crate) fn require_cpl0(&self) -> Result<(), Fault> {
        if self.state.protected() && self.state.cpl() != 0 {
            return Err(Fault::gp0());
        }
        Ok(())
    }

    /// Near jump target, truncated to IP in 16-bit operand size.
    pub(crate) fn jump_near(&mut self, target: u32, op32: bool) -> Result<(), Fault> {
        let target = if op32 { target } else { target & 0xffff };
        if !self.state.seg(SegReg::Cs).contains(target, 1) {
            return Err(Fault::gp0());
        }
        self.state.eip = target;
        Ok(())
    }
}

/// Convenience for building a CPU on top of [`crate::bus::PcBus`].
impl Cpu<crate::bus::PcBus> {
    pub fn with_pc_bus(config: CpuConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let bus = crate::bus::PcBus::for_config(&config);
        Self::new(config, bus)
    }
}
