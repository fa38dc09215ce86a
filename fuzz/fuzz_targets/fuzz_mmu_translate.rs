#![no_main]

use libfuzzer_sys::fuzz_target;
use pcx_cpu_core::PcBus;
use pcx_mmu::{AccessType, Mmu, CR0_PE, CR0_PG};

const RAM_SIZE: usize = 256 * 1024;
const HEADER: usize = 0x15;

fn u32_at(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    if let Some(src) = data.get(at..) {
        let n = src.len().min(4);
        buf[..n].copy_from_slice(&src[..n]);
    }
    u32::from_le_bytes(buf)
}

fuzz_target!(|data: &[u8]| {
    // Layout:
    //   0x00..0x0c: CR0, CR3, CR4
    //   0x0c:       CPL in bits 0-1, access type in bits 2-3
    //   0x0d..0x15: two linear addresses
    //   0x15..:     RAM image holding the paging structures
    if data.len() < HEADER {
        return;
    }
    let cr0 = u32_at(data, 0) | CR0_PE | CR0_PG;
    let cr3 = u32_at(data, 4) % RAM_SIZE as u32;
    let cr4 = u32_at(data, 8);
    let cpl = data[0x0c] & 3;
    let access = match (data[0x0c] >> 2) % 3 {
        0 => AccessType::Read,
        1 => AccessType::Write,
        _ => AccessType::Execute,
    };
    let first = u32_at(data, 0x0d);
    let second = u32_at(data, 0x11);

    let mut ram = PcBus::new(RAM_SIZE);
    let image = &data[HEADER..data.len().min(HEADER + RAM_SIZE)];
    ram.load(0, image);

    let mut mmu = Mmu::new();
    mmu.set_cr4(cr4);
    mmu.set_cr0(cr0);
    mmu.set_cr3(cr3);

    let walked = mmu.translate(&mut ram, first, access, cpl);
    let cached = mmu.translate(&mut ram, first, access, cpl);
    // A TLB hit must agree with the walk that filled it.
    if let (Ok(a), Ok(b)) = (walked, cached) {
        assert_eq!(a, b);
    }
    if let Err(pf) = walked {
        assert_eq!(pf.addr, first);
    }

    let _ = mmu.translate(&mut ram, second, access, cpl);
    mmu.invlpg(second);
    let (itlb, dtlb) = mmu.tlb_occupancy();
    assert!(itlb + dtlb <= 2);
});
