//! A faulting instruction commits nothing: registers, flags and memory are
//! as they were, and the pushed return address is the faulting instruction.

mod common;

use common::{real_mode, run_steps, set_vector, CODE_BASE};
use pcx_cpu_core::flags::{FLAG_CF, FLAG_ZF};
use pcx_cpu_core::regs::{EAX, ECX, EDI, ESP};
use pcx_cpu_core::{Cpu, CpuConfig, PcBus};

const HANDLER: u16 = 0x3000;

fn frame(cpu: &Cpu<PcBus>) -> (u16, u16, u16) {
    let ram = cpu.bus.ram();
    let word = |at: usize| u16::from_le_bytes([ram[at], ram[at + 1]]);
    (word(0x7ffa), word(0x7ffc), word(0x7ffe))
}

#[test]
fn add_to_memory_past_the_limit_changes_nothing() {
    // ADD [0xFFFF], AX: the word straddles the 64 KiB limit.
    let mut cpu = real_mode(CpuConfig::default(), &[0x01, 0x06, 0xff, 0xff]);
    set_vector(&mut cpu, 13, HANDLER);
    cpu.bus.load(0xffff, &[0x12]);
    cpu.state.gprs.set(EAX, 0xffff);
    cpu.state.flags.set(FLAG_CF, true);
    cpu.state.flags.set(FLAG_ZF, false);
    let flags_before = cpu.state.flags.eflags() as u16;

    run_steps(&mut cpu, 1).unwrap();

    assert_eq!(cpu.state.eip, HANDLER as u32);
    assert_eq!(cpu.bus.ram()[0xffff], 0x12);
    assert_eq!(cpu.state.gprs.get(EAX), 0xffff);
    let (ip, cs, flags) = frame(&cpu);
    assert_eq!((ip, cs), (CODE_BASE as u16, 0));
    assert_eq!(flags, flags_before);
}

#[test]
fn faulting_pop_keeps_the_stack_pointer() {
    // POP word [0xFFFF]: the read succeeds, the store faults.
    let mut cpu = real_mode(CpuConfig::default(), &[0x8f, 0x06, 0xff, 0xff]);
    set_vector(&mut cpu, 13, HANDLER);
    cpu.bus.load(0x8000, &[0x34, 0x12]);
    run_steps(&mut cpu, 1).unwrap();
    assert_eq!(cpu.state.eip, HANDLER as u32);
    // Only the exception frame moved SP.
    assert_eq!(cpu.state.gprs.get(ESP), 0x7ffa);
    assert_eq!(frame(&cpu).0, CODE_BASE as u16);
}

#[test]
fn pop_to_esp_relative_memory_uses_the_incremented_pointer() {
    // POP word [ESP]
    let mut cpu = real_mode(CpuConfig::default(), &[0x67, 0x8f, 0x04, 0x24]);
    cpu.state.gprs.set(ESP, 0x2000);
    cpu.bus.load(0x2000, &[0x34, 0x12, 0xef, 0xbe]);
    run_steps(&mut cpu, 1).unwrap();
    let ram = cpu.bus.ram();
    assert_eq!(cpu.state.gprs.get(ESP), 0x2002);
    assert_eq!(&ram[0x2000..0x2004], &[0x34, 0x12, 0x34, 0x12]);
}

#[test]
fn faulting_esp_relative_pop_restores_the_stack_pointer() {
    // POP word [ESP+0xFFFE]: past the SS limit once ESP has moved up by two.
    let mut cpu = real_mode(
        CpuConfig::default(),
        &[0x67, 0x8f, 0x84, 0x24, 0xfe, 0xff, 0x00, 0x00],
    );
    set_vector(&mut cpu, 12, HANDLER);
    cpu.bus.load(0x8000, &[0x34, 0x12]);
    run_steps(&mut cpu, 1).unwrap();
    assert_eq!(cpu.state.eip, HANDLER as u32);
    assert_eq!(cpu.state.gprs.get(ESP), 0x7ffa);
    assert_eq!(frame(&cpu).0, CODE_BASE as u16);
}

#[test]
fn rep_stos_fault_keeps_progress_so_far() {
    // REP STOSW with the third word straddling the limit.
    let mut cpu = real_mode(CpuConfig::default(), &[0xf3, 0xab]);
    set_vector(&mut cpu, 13, HANDLER);
    cpu.state.gprs.set(EAX, 0xa5a5);
    cpu.state.gprs.set(ECX, 5);
    cpu.state.gprs.set(EDI, 0xfffb);
    run_steps(&mut cpu, 3).unwrap();
    assert_eq!(cpu.state.eip, HANDLER as u32);
    assert_eq!(cpu.state.gprs.get(ECX), 3);
    assert_eq!(cpu.state.gprs.get(EDI), 0xffff);
    assert_eq!(&cpu.bus.ram()[0xfffb..0xffff], &[0xa5; 4]);
    assert_eq!(frame(&cpu).0, CODE_BASE as u16);
}

#[test]
fn divide_error_restarts_the_division() {
    // DIV BL with BL = 0
    let mut cpu = real_mode(CpuConfig::default(), &[0xf6, 0xf3]);
    set_vector(&mut cpu, 0, HANDLER);
    cpu.state.gprs.set(EAX, 0x1234);
    run_steps(&mut cpu, 1).unwrap();
    assert_eq!(cpu.state.eip, HANDLER as u32);
    assert_eq!(cpu.state.gprs.get(EAX), 0x1234);
    assert_eq!(frame(&cpu).0, CODE_BASE as u16);
}
