#![allow(dead_code)]

use pcx_cpu_core::segment::SegmentCache;
use pcx_cpu_core::{Cpu, CpuConfig, CpuExit, InterruptController, PcBus, SegReg};

pub const CODE_BASE: u32 = 0x1000;
pub const DATA_BASE: u32 = 0x2000;

/// Routes the core's log events into the test harness output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Real-mode CPU with CS = DS = ES = SS = 0, code at `CODE_BASE` and the
/// stack top at 0x8000.
pub fn real_mode(config: CpuConfig, code: &[u8]) -> Cpu<PcBus> {
    init_tracing();
    let mut cpu = Cpu::new(config, PcBus::new(1 << 20)).expect("valid config");
    for seg in SegReg::ALL {
        *cpu.state.seg_mut(seg) = SegmentCache::real(0);
    }
    cpu.state.eip = CODE_BASE;
    cpu.state.gprs.set(pcx_cpu_core::regs::ESP, 0x8000);
    cpu.bus.load(CODE_BASE as u64, code);
    cpu
}

/// Points IVT entry `vector` at `0000:target`.
pub fn set_vector(cpu: &mut Cpu<PcBus>, vector: u8, target: u16) {
    let entry = (target as u32).to_le_bytes();
    cpu.bus.load(vector as u64 * 4, &entry);
}

pub fn run_steps(cpu: &mut Cpu<PcBus>, n: usize) -> Result<(), CpuExit> {
    let mut ic = Idle;
    for _ in 0..n {
        cpu.step(&mut ic)?;
    }
    Ok(())
}

pub struct Idle;

impl InterruptController for Idle {
    fn poll_interrupt(&mut self) -> Option<u8> {
        None
    }
}

/// A controller with a single request line.
#[derive(Default)]
pub struct Line {
    pub vector: Option<u8>,
    pub acked: Vec<u8>,
}

impl InterruptController for Line {
    fn poll_interrupt(&mut self) -> Option<u8> {
        self.vector
    }

    fn acknowledge(&mut self, vector: u8) {
        self.vector = None;
        self.acked.push(vector);
    }
}
