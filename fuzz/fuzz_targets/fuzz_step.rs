#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pcx_cpu_core::segment::SegmentCache;
use pcx_cpu_core::{Cpu, CpuConfig, CpuModel, NoInterrupts, PcBus, SegReg};

const RAM_SIZE: usize = 64 * 1024;
const CODE_BASE: u32 = 0x1000;

#[derive(Debug, Arbitrary)]
struct Input {
    model: u8,
    gprs: [u32; 8],
    eflags: u16,
    cr0_low: u8,
    steps: u8,
    code: Vec<u8>,
}

fn model(sel: u8) -> CpuModel {
    match sel % 6 {
        0 => CpuModel::I386,
        1 => CpuModel::I486,
        2 => CpuModel::Pentium,
        3 => CpuModel::PentiumMmx,
        4 => CpuModel::PentiumIII,
        _ => CpuModel::CyrixMII,
    }
}

fuzz_target!(|input: Input| {
    let Ok(mut cpu) = Cpu::new(CpuConfig::for_model(model(input.model)), PcBus::new(RAM_SIZE)) else {
        return;
    };
    for seg in SegReg::ALL {
        *cpu.state.seg_mut(seg) = SegmentCache::real(0);
    }
    for (i, v) in input.gprs.iter().enumerate() {
        cpu.state.gprs.set(i as u8, *v);
    }
    // Small REP counts keep each step cheap.
    cpu.state.gprs.set(1, input.gprs[1] & 0xff);
    cpu.state.flags.set_eflags(input.eflags as u32 | 0x2);
    // MP/EM/TS only; PE stays clear so execution starts in real mode.
    let cr0 = cpu.mmu.cr0() | (input.cr0_low as u32 & 0xe);
    cpu.mmu.set_cr0(cr0);
    cpu.state.eip = CODE_BASE;
    cpu.bus.load(CODE_BASE as u64, &input.code);

    let mut ic = NoInterrupts;
    for _ in 0..input.steps.min(64) {
        if cpu.step(&mut ic).is_err() {
            break;
        }
        assert!(cpu.state.fpu.top() < 8);
    }
});
