//! Translation caches shaped like the Pentium's: each side keeps a
//! set-associative array for 4 KiB pages next to a small fully associative
//! array for 4 MiB pages.

const SMALL_SETS: usize = 16;
const SMALL_WAYS: usize = 4;
const LARGE_SLOTS: usize = 8;

const SMALL_PAGE_MASK: u32 = !0xfff;
const LARGE_PAGE_MASK: u32 = !0x3f_ffff;

const USER: u8 = 0x01;
const WRITABLE: u8 = 0x02;
const GLOBAL: u8 = 0x04;
const DIRTY: u8 = 0x08;
const LARGE: u8 = 0x10;

/// Effective permissions and bookkeeping of the leaf entry a walk ended on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Leaf {
    /// Physical address of the PTE, or of the PDE for a 4 MiB page.
    pub(crate) addr: u32,
    pub(crate) user: bool,
    pub(crate) writable: bool,
    pub(crate) global: bool,
    pub(crate) dirty: bool,
}

/// One cached page mapping. `page` and `frame` are aligned to the page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Translation {
    page: u32,
    frame: u32,
    leaf: u32,
    bits: u8,
}

impl Translation {
    pub(crate) fn small(laddr: u32, frame: u32, leaf: Leaf) -> Self {
        Self::build(laddr & SMALL_PAGE_MASK, frame & SMALL_PAGE_MASK, leaf, 0)
    }

    pub(crate) fn large(laddr: u32, frame: u32, leaf: Leaf) -> Self {
        Self::build(laddr & LARGE_PAGE_MASK, frame & LARGE_PAGE_MASK, leaf, LARGE)
    }

    fn build(page: u32, frame: u32, leaf: Leaf, mut bits: u8) -> Self {
        for (on, bit) in [
            (leaf.user, USER),
            (leaf.writable, WRITABLE),
            (leaf.global, GLOBAL),
            (leaf.dirty, DIRTY),
        ] {
            if on {
                bits |= bit;
            }
        }
        Self {
            page,
            frame,
            leaf: leaf.addr,
            bits,
        }
    }

    #[inline]
    fn offset_mask(&self) -> u32 {
        if self.is_large() {
            !LARGE_PAGE_MASK
        } else {
            !SMALL_PAGE_MASK
        }
    }

    #[inline]
    pub(crate) fn translate(&self, laddr: u32) -> u64 {
        (self.frame | (laddr & self.offset_mask())) as u64
    }

    #[inline]
    pub(crate) fn leaf_addr(&self) -> u64 {
        self.leaf as u64
    }

    #[inline]
    pub(crate) fn user(&self) -> bool {
        self.bits & USER != 0
    }

    #[inline]
    pub(crate) fn writable(&self) -> bool {
        self.bits & WRITABLE != 0
    }

    #[inline]
    pub(crate) fn dirty(&self) -> bool {
        self.bits & DIRTY != 0
    }

    #[inline]
    fn global(&self) -> bool {
        self.bits & GLOBAL != 0
    }

    #[inline]
    fn is_large(&self) -> bool {
        self.bits & LARGE != 0
    }

    #[inline]
    fn covers(&self, laddr: u32) -> bool {
        self.page == laddr & !self.offset_mask()
    }
}

/// Where a hit lives, so a later write hit can set its dirty bit in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Small { set: u8, way: u8 },
    Large(u8),
}

#[inline]
fn small_set(laddr: u32) -> usize {
    (laddr >> 12) as usize % SMALL_SETS
}

/// Picks the slot to fill: a free one if any, else the round-robin victim.
fn choose(slots: &[Option<Translation>], victim: &mut u8) -> usize {
    if let Some(free) = slots.iter().position(Option::is_none) {
        return free;
    }
    let i = *victim as usize % slots.len();
    *victim = victim.wrapping_add(1);
    i
}

#[derive(Debug, Clone)]
struct PageCache {
    small: [[Option<Translation>; SMALL_WAYS]; SMALL_SETS],
    small_victim: [u8; SMALL_SETS],
    large: [Option<Translation>; LARGE_SLOTS],
    large_victim: u8,
}

impl PageCache {
    fn new() -> Self {
        Self {
            small: [[None; SMALL_WAYS]; SMALL_SETS],
            small_victim: [0; SMALL_SETS],
            large: [None; LARGE_SLOTS],
            large_victim: 0,
        }
    }

    fn lookup(&self, laddr: u32) -> Option<(Slot, Translation)> {
        let large = self.large.iter().enumerate().find_map(|(i, t)| match t {
            Some(t) if t.covers(laddr) => Some((Slot::Large(i as u8), *t)),
            _ => None,
        });
        large.or_else(|| {
            let set = small_set(laddr);
            self.small[set].iter().enumerate().find_map(|(way, t)| match t {
                Some(t) if t.covers(laddr) => Some((
                    Slot::Small {
                        set: set as u8,
                        way: way as u8,
                    },
                    *t,
                )),
                _ => None,
            })
        })
    }

    fn insert(&mut self, t: Translation) {
        let (slots, victim) = if t.is_large() {
            (&mut self.large[..], &mut self.large_victim)
        } else {
            let set = small_set(t.page);
            (&mut self.small[set][..], &mut self.small_victim[set])
        };
        let same_page = slots
            .iter()
            .position(|cur| matches!(cur, Some(cur) if cur.page == t.page));
        let i = match same_page {
            Some(i) => i,
            None => choose(slots, victim),
        };
        slots[i] = Some(t);
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut Option<Translation> {
        match slot {
            Slot::Small { set, way } => &mut self.small[set as usize][way as usize],
            Slot::Large(i) => &mut self.large[i as usize],
        }
    }

    fn entries_mut(&mut self) -> impl Iterator<Item = &mut Option<Translation>> {
        self.small.iter_mut().flatten().chain(self.large.iter_mut())
    }

    /// Drops every cached translation `keep` rejects.
    fn retain(&mut self, keep: impl Fn(&Translation) -> bool) {
        for slot in self.entries_mut() {
            if slot.as_ref().is_some_and(|t| !keep(t)) {
                *slot = None;
            }
        }
    }

    fn invalidate(&mut self, laddr: u32) {
        self.retain(|t| !t.covers(laddr));
    }

    fn len(&self) -> usize {
        self.small
            .iter()
            .flatten()
            .chain(self.large.iter())
            .filter(|t| t.is_some())
            .count()
    }
}

/// Instruction-side and data-side translation caches.
#[derive(Debug, Clone)]
pub(crate) struct Tlb {
    code: PageCache,
    data: PageCache,
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Self {
            code: PageCache::new(),
            data: PageCache::new(),
        }
    }

    #[inline]
    fn side(&self, exec: bool) -> &PageCache {
        if exec {
            &self.code
        } else {
            &self.data
        }
    }

    #[inline]
    pub(crate) fn lookup(&self, laddr: u32, exec: bool) -> Option<(Slot, Translation)> {
        self.side(exec).lookup(laddr)
    }

    pub(crate) fn insert(&mut self, exec: bool, t: Translation) {
        if exec {
            self.code.insert(t);
        } else {
            self.data.insert(t);
        }
    }

    /// Records that the data-side entry in `slot` now has its D bit set.
    pub(crate) fn mark_dirty(&mut self, slot: Slot) {
        if let Some(t) = self.data.slot_mut(slot) {
            t.bits |= DIRTY;
        }
    }

    pub(crate) fn invalidate_address(&mut self, laddr: u32) {
        self.code.invalidate(laddr);
        self.data.invalidate(laddr);
    }

    pub(crate) fn flush_all(&mut self) {
        self.code.retain(|_| false);
        self.data.retain(|_| false);
    }

    pub(crate) fn flush_data(&mut self) {
        self.data.retain(|_| false);
    }

    pub(crate) fn flush_non_global(&mut self) {
        self.code.retain(Translation::global);
        self.data.retain(Translation::global);
    }

    /// Live entries as `(code, data)`.
    pub(crate) fn occupancy(&self) -> (usize, usize) {
        (self.code.len(), self.data.len())
    }
}
