//! Whole-machine smoke tests: a ROM at the reset vector, RAM, and a POST
//! code latch on port 0x80.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{ensure, Result};
use pcx_cpu_core::segment::SegReg;
use pcx_cpu_core::{
    Cpu, CpuConfig, CpuExit, CpuMode, CpuModel, MmioHandler, NoInterrupts, PcBus, PortHandler,
    Width,
};

const ROM_BASE: u64 = 0xffff_0000;
const ROM_SIZE: usize = 0x1_0000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("pcx_cpu_core=debug")
        .try_init();
}

struct Rom(Vec<u8>);

impl Rom {
    /// A ROM whose reset vector far-jumps to `0000:1000`.
    fn with_reset_jump() -> Self {
        let mut image = vec![0xff; ROM_SIZE];
        image[0xfff0..0xfff5].copy_from_slice(&[0xea, 0x00, 0x10, 0x00, 0x00]);
        Self(image)
    }
}

impl MmioHandler for Rom {
    fn read(&mut self, offset: u64, width: Width) -> u32 {
        (0..width.bytes()).fold(0, |acc, i| {
            let b = self.0.get(offset as usize + i as usize).copied().unwrap_or(0xff);
            acc | (b as u32) << (8 * i)
        })
    }

    fn write(&mut self, _offset: u64, _width: Width, _value: u32) {}
}

#[derive(Default)]
struct PostCodes(Vec<u32>);

impl PortHandler for PostCodes {
    fn read(&mut self, _port: u16, _width: Width) -> u32 {
        self.0.last().copied().unwrap_or(0)
    }

    fn write(&mut self, _port: u16, _width: Width, value: u32) {
        tracing::debug!(value, "post code");
        self.0.push(value);
    }
}

fn machine(model: CpuModel, program: &[u8]) -> Result<(Cpu<PcBus>, Rc<RefCell<PostCodes>>)> {
    let mut cpu = Cpu::with_pc_bus(CpuConfig::for_model(model).with_ram_size(1 << 20))?;
    let post = Rc::new(RefCell::new(PostCodes::default()));
    cpu.bus.map_mmio(ROM_BASE, ROM_SIZE as u64, Rom::with_reset_jump());
    cpu.bus.map_ports(0x80, 1, post.clone());
    cpu.bus.load(0x1000, program);
    Ok((cpu, post))
}

#[test]
fn boots_from_reset_vector_and_halts() -> Result<()> {
    init_tracing();
    let program = [
        0xbc, 0x00, 0x80, // mov sp, 0x8000
        0xb8, 0x34, 0x12, // mov ax, 0x1234
        0xe7, 0x80, // out 0x80, ax
        0x50, // push ax
        0x5b, // pop bx
        0xf4, // hlt
    ];
    let (mut cpu, post) = machine(CpuModel::I486, &program)?;
    ensure!(cpu.state.seg(SegReg::Cs).base == 0xffff_0000);
    ensure!(cpu.state.eip == 0xfff0);

    let exit = cpu.run(10_000, &mut NoInterrupts);
    ensure!(exit == Err(CpuExit::Shutdown), "unexpected exit {exit:?}");
    ensure!(post.borrow().0 == [0x1234]);
    ensure!(cpu.state.gprs.get(3) == 0x1234);
    ensure!(cpu.stats.instructions == 7);
    Ok(())
}

#[test]
fn enters_protected_mode_through_a_flat_gdt() -> Result<()> {
    init_tracing();
    let mut program = vec![
        0x0f, 0x01, 0x16, 0x00, 0x20, // lgdt [0x2000]
        0x0f, 0x20, 0xc0, // mov eax, cr0
        0x66, 0x83, 0xc8, 0x01, // or eax, 1
        0x0f, 0x22, 0xc0, // mov cr0, eax
        0x66, 0xea, 0x00, 0x11, 0x00, 0x00, 0x08, 0x00, // jmp dword 0x08:0x1100
    ];
    program.resize(0x100, 0x90);
    program.extend_from_slice(&[
        0xbb, 0x78, 0x56, 0x34, 0x12, // mov ebx, 0x12345678
        0xb8, 0x10, 0x00, 0x00, 0x00, // mov eax, 0x10
        0x8e, 0xd8, // mov ds, ax
        0x89, 0x1d, 0x00, 0x30, 0x00, 0x00, // mov [0x3000], ebx
        0xf4, // hlt
    ]);
    let (mut cpu, _) = machine(CpuModel::I486, &program)?;
    // Pseudo-descriptor, then null / flat code / flat data.
    cpu.bus.load(0x2000, &[0x17, 0x00, 0x08, 0x20, 0x00, 0x00]);
    cpu.bus.load(
        0x2008,
        &[
            0, 0, 0, 0, 0, 0, 0, 0, //
            0xff, 0xff, 0x00, 0x00, 0x00, 0x9a, 0xcf, 0x00, //
            0xff, 0xff, 0x00, 0x00, 0x00, 0x92, 0xcf, 0x00,
        ],
    );

    let exit = cpu.run(10_000, &mut NoInterrupts);
    ensure!(exit == Err(CpuExit::Shutdown), "unexpected exit {exit:?}");
    ensure!(cpu.state.mode() == CpuMode::Protected);
    ensure!(cpu.state.seg(SegReg::Cs).selector == 0x08);
    ensure!(cpu.state.code32());
    ensure!(cpu.bus.ram()[0x3000..0x3004] == 0x1234_5678u32.to_le_bytes());
    Ok(())
}

#[test]
fn run_stops_when_the_budget_is_spent() -> Result<()> {
    init_tracing();
    // jmp $
    let (mut cpu, _) = machine(CpuModel::I386, &[0xeb, 0xfe])?;
    let retired = cpu.run(5_000, &mut NoInterrupts)?;
    ensure!(retired > 1);
    ensure!(cpu.cycles().get() <= 0);
    ensure!(cpu.state.eip == 0x1000);
    Ok(())
}
