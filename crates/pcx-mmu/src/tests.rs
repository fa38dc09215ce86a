use super::*;

use core::convert::TryInto;

#[derive(Clone)]
struct TestMemory {
    data: Vec<u8>,
    reads: usize,
    writes: usize,
}

impl TestMemory {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            reads: 0,
            writes: 0,
        }
    }

    fn reset_counters(&mut self) {
        self.reads = 0;
        self.writes = 0;
    }

    fn write_u32_raw(&mut self, paddr: u64, value: u32) {
        let off = paddr as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u32_raw(&self, paddr: u64) -> u32 {
        let off = paddr as usize;
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }
}

impl MemoryBus for TestMemory {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.reads += 1;
        self.data[paddr as usize]
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        self.reads += 1;
        let off = paddr as usize;
        u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap())
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        self.reads += 1;
        self.read_u32_raw(paddr)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        self.reads += 1;
        let off = paddr as usize;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.writes += 1;
        self.data[paddr as usize] = value;
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.writes += 1;
        let off = paddr as usize;
        self.data[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.writes += 1;
        self.write_u32_raw(paddr, value);
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.writes += 1;
        let off = paddr as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }
}

const PD: u64 = 0x1000;
const PT: u64 = 0x2000;

fn paged_mmu(mem: &mut TestMemory, pte_flags: u32) -> Mmu {
    mem.write_u32_raw(PD, PT as u32 | 0x7);
    mem.write_u32_raw(PT + 4 * 5, 0x0000_8000 | pte_flags);
    let mut mmu = Mmu::new();
    mmu.set_cr3(PD as u32);
    mmu.set_cr0(CR0_PE | CR0_PG);
    mmu
}

#[test]
fn memory_bus_is_implemented_for_mut_refs() {
    fn read_through<B: MemoryBus>(mut bus: B, paddr: u64) -> u8 {
        bus.read_u8(paddr)
    }

    let mut mem = TestMemory::new(0x10);
    mem.data[0] = 0xaa;
    mem.reset_counters();
    assert_eq!(read_through(&mut mem, 0), 0xaa);
    assert_eq!(mem.reads, 1);
}

#[test]
fn identity_when_paging_disabled() {
    let mut mem = TestMemory::new(0x10);
    let mut mmu = Mmu::new();
    let got = mmu.translate(&mut mem, 0xdead_beef, AccessType::Write, 3);
    assert_eq!(got, Ok(0xdead_beef));
    assert_eq!(mem.reads, 0);
}

#[test]
fn walk_sets_accessed_and_dirty() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, 0x3);

    let paddr = mmu.translate(&mut mem, 0x5123, AccessType::Read, 0).unwrap();
    assert_eq!(paddr, 0x8123);
    let pte = mem.read_u32_raw(PT + 4 * 5);
    assert_ne!(pte & PTE_A, 0);
    assert_eq!(pte & PTE_D, 0);
    assert_ne!(mem.read_u32_raw(PD) & PTE_A, 0);

    mmu.translate(&mut mem, 0x5124, AccessType::Write, 0).unwrap();
    assert_ne!(mem.read_u32_raw(PT + 4 * 5) & PTE_D, 0);
}

#[test]
fn write_hit_sets_dirty_lazily_once() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, 0x3);

    // Populate the dtlb through a read.
    mmu.translate(&mut mem, 0x5000, AccessType::Read, 0).unwrap();
    mem.reset_counters();

    mmu.translate(&mut mem, 0x5000, AccessType::Write, 0).unwrap();
    assert_eq!(mem.writes, 1);
    assert_ne!(mem.read_u32_raw(PT + 4 * 5) & PTE_D, 0);

    mem.reset_counters();
    mmu.translate(&mut mem, 0x5008, AccessType::Write, 0).unwrap();
    assert_eq!(mem.writes, 0);
    assert_eq!(mem.reads, 0);
}

#[test]
fn not_present_fault_latches_cr2() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, 0x3);

    let err = mmu
        .translate(&mut mem, 0x0060_0000, AccessType::Write, 3)
        .unwrap_err();
    assert_eq!(err.addr, 0x0060_0000);
    // W | U, not present.
    assert_eq!(err.error_code, 0b110);
    assert_eq!(mmu.cr2(), 0x0060_0000);
}

#[test]
fn supervisor_write_to_readonly_page_honours_wp() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, 0x1);

    assert!(mmu.translate(&mut mem, 0x5000, AccessType::Write, 0).is_ok());

    assert_eq!(
        mmu.set_cr0(CR0_PE | CR0_PG | CR0_WP),
        Some(FlushKind::WriteProtect)
    );
    let err = mmu
        .translate(&mut mem, 0x5000, AccessType::Write, 0)
        .unwrap_err();
    assert_eq!(err.error_code, 0b011);
}

#[test]
fn user_access_to_supervisor_page_faults() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, 0x3);
    let err = mmu
        .translate(&mut mem, 0x5000, AccessType::Read, 3)
        .unwrap_err();
    assert_eq!(err.error_code, 0b101);
}

#[test]
fn large_page_translation_and_reserved_bits() {
    let mut mem = TestMemory::new(0x10000);
    mem.write_u32_raw(PD + 4, 0x0080_0000 | PTE_PS | 0x7);
    let mut mmu = Mmu::new();
    mmu.set_cr4(CR4_PSE);
    mmu.set_cr3(PD as u32);
    mmu.set_cr0(CR0_PE | CR0_PG);

    assert_eq!(
        mmu.translate(&mut mem, 0x0041_2345, AccessType::Read, 3),
        Ok(0x0081_2345)
    );

    mem.write_u32_raw(PD + 8, 0x0080_0000 | 0x2000 | PTE_PS | 0x7);
    let err = mmu
        .translate(&mut mem, 0x0080_0000, AccessType::Read, 0)
        .unwrap_err();
    assert_eq!(err.error_code & 0b1001, 0b1001);
}

#[test]
fn invlpg_forces_rewalk() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = paged_mmu(&mut mem, 0x3);
    assert_eq!(
        mmu.translate(&mut mem, 0x5000, AccessType::Read, 0),
        Ok(0x8000)
    );

    mem.write_u32_raw(PT + 4 * 5, 0x0000_9000 | 0x23);
    assert_eq!(
        mmu.translate(&mut mem, 0x5000, AccessType::Read, 0),
        Ok(0x8000)
    );
    mmu.invlpg(0x5abc);
    assert_eq!(
        mmu.translate(&mut mem, 0x5000, AccessType::Read, 0),
        Ok(0x9000)
    );
    assert_eq!(mmu.flush_counters().invlpg, 1);
}
