#![forbid(unsafe_code)]

//! Interpreter core for 386/486/Pentium-class x86 CPUs.
//!
//! [`Cpu`] owns the architectural state ([`state::CpuState`]), the MMU and a
//! platform [`bus::Bus`]. Each [`Cpu::step`] either delivers one pending event
//! or executes one instruction through a per-model [`dispatch::DispatchTable`].
//! Handlers never partially commit: a fault raised before the final write
//! leaves registers and memory as they were, and the driver restarts the
//! instruction after delivering it.

mod mem;
mod ops;

pub mod bus;
pub mod config;
pub mod control;
pub mod cpu;
pub mod dispatch;
pub mod fault;
pub mod flags;
pub mod fpu;
pub mod interrupts;
pub mod mmx;
pub mod modrm;
pub mod regs;
pub mod segment;
pub mod smm;
pub mod sse;
pub mod state;
pub mod timing;

pub use bus::{Bus, IoBus, MmioHandler, PcBus, PortHandler};
pub use config::{ConfigError, CpuConfig, CpuModel, Features, FpuBackendKind};
pub use cpu::{Cpu, CpuStats};
pub use fault::{CpuExit, Fault};
pub use interrupts::{Event, InterruptController, NoInterrupts};
pub use pcx_mmu::{FlushKind, MemoryBus};
pub use regs::Width;
pub use segment::SegReg;
pub use state::{CpuMode, CpuState};
pub use timing::{CycleCounter, InstrClass};
