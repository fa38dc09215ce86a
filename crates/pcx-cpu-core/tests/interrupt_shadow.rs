mod common;

use common::{real_mode, set_vector, Line, CODE_BASE};
use pcx_cpu_core::flags::FLAG_IF;
use pcx_cpu_core::regs::{EAX, ESP};
use pcx_cpu_core::{Cpu, CpuConfig, PcBus};

const HANDLER: u16 = 0x3000;
const EXTERNAL: u16 = 0x4000;

fn word(cpu: &Cpu<PcBus>, at: usize) -> u16 {
    let ram = cpu.bus.ram();
    u16::from_le_bytes([ram[at], ram[at + 1]])
}

#[test]
fn mov_ss_holds_interrupts_until_the_stack_pointer_is_loaded() {
    // MOV SS, AX; MOV SP, 0x6000; NOP
    let mut cpu = real_mode(CpuConfig::default(), &[0x8e, 0xd0, 0xbc, 0x00, 0x60, 0x90]);
    set_vector(&mut cpu, 0x20, HANDLER);
    cpu.state.flags.set(FLAG_IF, true);
    cpu.state.gprs.set(EAX, 0x0100);
    let mut line = Line::default();

    cpu.step(&mut line).unwrap();
    assert_eq!(cpu.state.eip, CODE_BASE + 2);

    line.vector = Some(0x20);
    cpu.step(&mut line).unwrap();
    assert_eq!(cpu.state.eip, CODE_BASE + 5, "MOV SP runs inside the shadow");
    assert!(line.acked.is_empty());
    let flags = cpu.state.flags.eflags() as u16;

    cpu.step(&mut line).unwrap();
    assert_eq!(cpu.state.eip, HANDLER as u32);
    assert_eq!(line.acked, vec![0x20]);
    assert_eq!(cpu.state.gprs.get(ESP), 0x5ffa);
    // IP, CS and FLAGS sit at 0100:5FFA, below the new stack top.
    assert_eq!(word(&cpu, 0x6ffa), (CODE_BASE + 5) as u16);
    assert_eq!(word(&cpu, 0x6ffc), 0);
    assert_eq!(word(&cpu, 0x6ffe), flags);
}

#[test]
fn exception_inside_the_shadow_does_not_extend_it() {
    // STI; DIV BL with BL = 0
    let mut cpu = real_mode(CpuConfig::default(), &[0xfb, 0xf6, 0xf3]);
    set_vector(&mut cpu, 0, HANDLER);
    set_vector(&mut cpu, 0x20, EXTERNAL);
    cpu.bus.load(HANDLER as u64, &[0x90]);
    let mut line = Line {
        vector: Some(0x20),
        acked: Vec::new(),
    };

    cpu.step(&mut line).unwrap();
    cpu.step(&mut line).unwrap();
    assert_eq!(cpu.state.eip, HANDLER as u32);
    assert_eq!(cpu.pending.interrupt_inhibit(), 0);
    assert!(line.acked.is_empty());

    // A trap gate would have left IF set on entry.
    cpu.state.flags.set(FLAG_IF, true);
    cpu.step(&mut line).unwrap();
    assert_eq!(cpu.state.eip, EXTERNAL as u32);
    assert_eq!(line.acked, vec![0x20]);
}

#[test]
fn sti_enables_after_the_next_instruction() {
    // STI; NOP; NOP
    let mut cpu = real_mode(CpuConfig::default(), &[0xfb, 0x90, 0x90]);
    set_vector(&mut cpu, 0x21, HANDLER);
    let mut line = Line {
        vector: Some(0x21),
        acked: Vec::new(),
    };

    cpu.step(&mut line).unwrap();
    assert!(cpu.state.flags.if_());
    cpu.step(&mut line).unwrap();
    assert_eq!(cpu.state.eip, CODE_BASE + 2);
    cpu.step(&mut line).unwrap();
    assert_eq!(cpu.state.eip, HANDLER as u32);
    assert!(!cpu.state.flags.if_());
}

#[test]
fn hlt_with_interrupts_disabled_shuts_down() {
    let mut cpu = real_mode(CpuConfig::default(), &[0xf4]);
    let mut line = Line::default();
    cpu.step(&mut line).unwrap();
    assert!(cpu.state.halted);
    assert_eq!(
        cpu.step(&mut line),
        Err(pcx_cpu_core::CpuExit::Shutdown)
    );
}

#[test]
fn interrupt_wakes_a_halted_cpu() {
    let mut cpu = real_mode(CpuConfig::default(), &[0xf4]);
    set_vector(&mut cpu, 0x22, HANDLER);
    cpu.state.flags.set(FLAG_IF, true);
    let mut line = Line::default();
    cpu.step(&mut line).unwrap();
    assert!(cpu.state.halted);
    line.vector = Some(0x22);
    cpu.step(&mut line).unwrap();
    assert!(!cpu.state.halted);
    assert_eq!(cpu.state.eip, HANDLER as u32);
}
