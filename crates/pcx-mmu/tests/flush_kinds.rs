use pcx_mmu::{
    AccessType, FlushKind, MemoryBus, Mmu, CR0_CD, CR0_PE, CR0_PG, CR0_WP, CR4_PGE, CR4_PSE,
};
use proptest::prelude::*;

struct Ram(Vec<u8>);

impl Ram {
    fn put(&mut self, paddr: u64, value: u32) {
        let off = paddr as usize;
        self.0[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl MemoryBus for Ram {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.0[paddr as usize]
    }
    fn read_u16(&mut self, paddr: u64) -> u16 {
        let o = paddr as usize;
        u16::from_le_bytes([self.0[o], self.0[o + 1]])
    }
    fn read_u32(&mut self, paddr: u64) -> u32 {
        let o = paddr as usize;
        u32::from_le_bytes(self.0[o..o + 4].try_into().unwrap())
    }
    fn read_u64(&mut self, paddr: u64) -> u64 {
        let o = paddr as usize;
        u64::from_le_bytes(self.0[o..o + 8].try_into().unwrap())
    }
    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.0[paddr as usize] = value;
    }
    fn write_u16(&mut self, paddr: u64, value: u16) {
        let o = paddr as usize;
        self.0[o..o + 2].copy_from_slice(&value.to_le_bytes());
    }
    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.put(paddr, value);
    }
    fn write_u64(&mut self, paddr: u64, value: u64) {
        let o = paddr as usize;
        self.0[o..o + 8].copy_from_slice(&value.to_le_bytes());
    }
}

/// Maps linear page 0 (global) and page 1 (non-global) and warms both TLBs.
fn warmed(cr4: u32) -> (Mmu, Ram) {
    let mut ram = Ram(vec![0; 0x10_000]);
    ram.put(0x1000, 0x2000 | 0x7);
    ram.put(0x2000, 0x8000 | 0x107);
    ram.put(0x2004, 0x9000 | 0x007);

    let mut mmu = Mmu::new();
    mmu.set_cr4(cr4);
    mmu.set_cr3(0x1000);
    mmu.set_cr0(CR0_PE | CR0_PG);
    for laddr in [0x0000u32, 0x1000] {
        mmu.translate(&mut ram, laddr, AccessType::Read, 0).unwrap();
        mmu.translate(&mut ram, laddr, AccessType::Execute, 0).unwrap();
    }
    (mmu, ram)
}

#[test]
fn cr0_flush_selection() {
    let base = CR0_PE | CR0_PG;
    assert_eq!(FlushKind::for_cr0_write(base, base), None);
    assert_eq!(FlushKind::for_cr0_write(base, CR0_PE), Some(FlushKind::Full));
    assert_eq!(FlushKind::for_cr0_write(0, CR0_PE), Some(FlushKind::Full));
    assert_eq!(
        FlushKind::for_cr0_write(base, base | CR0_WP),
        Some(FlushKind::WriteProtect)
    );
    assert_eq!(
        FlushKind::for_cr0_write(base, base | CR0_CD),
        Some(FlushKind::NoPc)
    );
    // PG toggles dominate the others.
    assert_eq!(
        FlushKind::for_cr0_write(CR0_PE, base | CR0_WP | CR0_CD),
        Some(FlushKind::Full)
    );
    // TS/EM/MP/NE/ET changes flush nothing.
    assert_eq!(FlushKind::for_cr0_write(base, base | 0x3e), None);
}

#[test]
fn write_protect_flush_keeps_instruction_translations() {
    let (mut mmu, _ram) = warmed(0);
    assert_eq!(mmu.tlb_occupancy(), (2, 2));

    let cr0 = mmu.cr0();
    assert_eq!(mmu.set_cr0(cr0 | CR0_WP), Some(FlushKind::WriteProtect));
    assert_eq!(mmu.tlb_occupancy(), (2, 0));
    assert_eq!(mmu.flush_counters().write_protect, 1);
}

#[test]
fn cache_disable_flush_drops_everything() {
    let (mut mmu, _ram) = warmed(CR4_PGE);
    let cr0 = mmu.cr0();
    assert_eq!(mmu.set_cr0(cr0 | CR0_CD), Some(FlushKind::NoPc));
    assert_eq!(mmu.tlb_occupancy(), (0, 0));
    assert_eq!(mmu.last_flush(), Some(FlushKind::NoPc));
}

#[test]
fn cr3_reload_keeps_global_pages_only_with_pge() {
    let (mut mmu, _ram) = warmed(CR4_PGE);
    assert_eq!(mmu.set_cr3(0x1000), FlushKind::NonGlobal);
    assert_eq!(mmu.tlb_occupancy(), (1, 1));

    let (mut mmu, _ram) = warmed(0);
    mmu.set_cr3(0x1000);
    assert_eq!(mmu.tlb_occupancy(), (0, 0));
}

#[test]
fn cr4_paging_feature_change_is_full_flush() {
    let (mut mmu, _ram) = warmed(CR4_PGE);
    assert_eq!(mmu.set_cr4(CR4_PGE | CR4_PSE), Some(FlushKind::Full));
    assert_eq!(mmu.tlb_occupancy(), (0, 0));
    assert_eq!(mmu.set_cr4(CR4_PGE | CR4_PSE | (1 << 9)), None);
}

proptest! {
    #[test]
    fn cr0_flush_is_none_iff_no_relevant_bit_changed(old in any::<u32>(), new in any::<u32>()) {
        let relevant = CR0_PE | CR0_PG | CR0_WP | CR0_CD;
        let kind = FlushKind::for_cr0_write(old, new);
        prop_assert_eq!(kind.is_none(), (old ^ new) & relevant == 0);
    }
}
