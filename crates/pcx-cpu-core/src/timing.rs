//! Cycle accounting: the shared cycle counter, the per-class charge ordering
//! policy and the 386 prefetch-queue stall model.

use std::cell::Cell;
use std::rc::Rc;

/// Cycle budget shared between the CPU and device timing.
///
/// The CPU counts down; the timing side holds a clone, reads how far the
/// CPU got and refills the budget before the next slice.
#[derive(Debug, Clone, Default)]
pub struct CycleCounter(Rc<Cell<i64>>);

impl CycleCounter {
    pub fn new(budget: i64) -> Self {
        Self(Rc::new(Cell::new(budget)))
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.0.get()
    }

    #[inline]
    pub fn set(&self, budget: i64) {
        self.0.set(budget);
    }

    #[inline]
    pub fn charge(&self, cycles: u32) {
        self.0.set(self.0.get() - cycles as i64);
    }

    #[inline]
    pub fn exhausted(&self) -> bool {
        self.0.get() <= 0
    }
}

/// Handler classes that share a charge ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrClass {
    Alu,
    AluStore,
    MovLoad,
    MovStore,
    Stack,
    BitOp,
    Shift,
    Branch,
    String,
    SegmentLoad,
    System,
    PortIo,
    X87,
    Mmx,
    Sse,
    Smm,
    Misc,
}

impl InstrClass {
    pub const COUNT: usize = 17;
}

/// Whether a handler's cycles are charged before its final fault check or
/// only once it has succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChargeOrder {
    /// Cycles are spent even when the final access faults.
    ChargeThenCheck,
    #[default]
    CheckThenCharge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePolicyTable {
    orders: [ChargeOrder; InstrClass::COUNT],
}

impl Default for CyclePolicyTable {
    fn default() -> Self {
        Self::uniform(ChargeOrder::CheckThenCharge)
            .with(InstrClass::MovStore, ChargeOrder::ChargeThenCheck)
            .with(InstrClass::String, ChargeOrder::ChargeThenCheck)
    }
}

impl CyclePolicyTable {
    pub fn uniform(order: ChargeOrder) -> Self {
        Self {
            orders: [order; InstrClass::COUNT],
        }
    }

    pub fn with(mut self, class: InstrClass, order: ChargeOrder) -> Self {
        self.orders[class as usize] = order;
        self
    }

    #[inline]
    pub fn order(&self, class: InstrClass) -> ChargeOrder {
        self.orders[class as usize]
    }
}

pub const PREFETCH_QUEUE_BYTES: i32 = 16;
/// Bytes fetched per bus cycle.
const PREFETCH_WIDTH: i32 = 2;
/// Clocks per bus cycle (and per operand memory access).
const BUS_CYCLE: u32 = 2;

/// 386-style prefetch queue. Free bus slots during execution top it up;
/// an instruction longer than what is queued stalls until it is fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchQueue {
    bytes: i32,
}

impl PrefetchQueue {
    #[inline]
    pub fn queued(&self) -> i32 {
        self.bytes
    }

    /// Control transfer: the queue is discarded.
    pub fn flush(&mut self) {
        self.bytes = 0;
    }

    /// Consumes an instruction of `len` bytes and returns the stall cycles.
    pub fn run(&mut self, len: u32, exec_cycles: u32, mem_accesses: u32) -> u32 {
        let mem_cycles = mem_accesses * BUS_CYCLE;
        let exec_cycles = exec_cycles.max(mem_cycles);

        self.bytes -= len as i32;
        let mut stall = 0;
        while self.bytes < 0 {
            self.bytes += PREFETCH_WIDTH;
            stall += BUS_CYCLE;
        }

        let free_slots = (exec_cycles - mem_cycles) / BUS_CYCLE;
        self.bytes = (self.bytes + free_slots as i32 * PREFETCH_WIDTH).min(PREFETCH_QUEUE_BYTES);
        stall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_shared() {
        let cpu_side = CycleCounter::new(100);
        let timer_side = cpu_side.clone();
        cpu_side.charge(30);
        assert_eq!(timer_side.get(), 70);
        timer_side.set(0);
        assert!(cpu_side.exhausted());
    }

    #[test]
    fn default_policy() {
        let p = CyclePolicyTable::default();
        assert_eq!(p.order(InstrClass::MovStore), ChargeOrder::ChargeThenCheck);
        assert_eq!(p.order(InstrClass::String), ChargeOrder::ChargeThenCheck);
        assert_eq!(p.order(InstrClass::Alu), ChargeOrder::CheckThenCharge);
        assert_eq!(p.order(InstrClass::Misc), ChargeOrder::CheckThenCharge);
    }

    #[test]
    fn prefetch_stalls_then_refills() {
        let mut q = PrefetchQueue::default();
        // Cold queue: a 3-byte instruction waits for two bus cycles.
        assert_eq!(q.run(3, 2, 0), 4);
        // One spare byte plus one free slot.
        assert_eq!(q.queued(), 3);
        assert_eq!(q.run(1, 20, 0), 0);
        assert_eq!(q.queued(), 16);
        // Memory traffic eats the free slots.
        assert_eq!(q.run(2, 4, 2), 0);
        assert_eq!(q.queued(), 14);
    }
}
