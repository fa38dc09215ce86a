#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use pcx_mmu::{AccessType, MemoryBus, Mmu, CR0_PE, CR0_PG, CR4_PSE};
#[cfg(not(target_arch = "wasm32"))]
use std::convert::TryInto;

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("PCX_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
struct BenchMemory {
    data: Vec<u8>,
}

#[cfg(not(target_arch = "wasm32"))]
impl BenchMemory {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    fn write_u32_raw(&mut self, paddr: u64, value: u32) {
        let off = paddr as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl MemoryBus for BenchMemory {
    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.data[paddr as usize]
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        let off = paddr as usize;
        u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap())
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        let off = paddr as usize;
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        let off = paddr as usize;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.data[paddr as usize] = value;
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        let off = paddr as usize;
        self.data[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_u32_raw(paddr, value);
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        let off = paddr as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_tlb_hit_4k(c: &mut Criterion) {
    let mut mem = BenchMemory::new(0x20_000);
    let pd_base = 0x1000u64;
    let pt_base = 0x2000u64;
    mem.write_u32_raw(pd_base, pt_base as u32 | 0x7);
    for i in 0..16u64 {
        mem.write_u32_raw(pt_base + i * 4, (0x10_000 + i as u32 * 0x1000) | 0x67);
    }

    let mut mmu = Mmu::new();
    mmu.set_cr3(pd_base as u32);
    mmu.set_cr0(CR0_PE | CR0_PG);
    for i in 0..16u32 {
        let _ = mmu.translate(&mut mem, i * 0x1000, AccessType::Read, 0);
    }

    let mut group = c.benchmark_group("tlb");
    group.throughput(Throughput::Elements(16));
    group.bench_function("hit_4k", |b| {
        b.iter(|| {
            for i in 0..16u32 {
                let laddr = black_box(i * 0x1000 + 0x10);
                black_box(mmu.translate(&mut mem, laddr, AccessType::Read, 0).ok());
            }
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_walk_4m(c: &mut Criterion) {
    let mut mem = BenchMemory::new(0x4000);
    let pd_base = 0x1000u64;
    mem.write_u32_raw(pd_base + 4, 0x0040_0000 | 0xe7);

    let mut mmu = Mmu::new();
    mmu.set_cr4(CR4_PSE);
    mmu.set_cr3(pd_base as u32);
    mmu.set_cr0(CR0_PE | CR0_PG);

    c.bench_function("tlb/miss_walk_4m", |b| {
        b.iter(|| {
            mmu.invlpg(0x0040_0000);
            black_box(
                mmu.translate(&mut mem, black_box(0x0041_0000), AccessType::Read, 0)
                    .ok(),
            );
        })
    });
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_tlb_hit_4k, bench_walk_4m
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
