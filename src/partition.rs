//! Per-processor partition fabric: object pools, perf counters, and the
//! partition mask arithmetic.
//!
//! Each processor owns a slot; connection-affine objects are allocated from
//! and returned to the slot's pools, and counters are written slot-locally.
//! Only summation crosses slots.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::handle::{ConnectionState, PacketSpace, TransportParameters};
use crate::toeplitz::ToeplitzHash;

/// Signed, per-slot performance counters.
///
/// An object may be counted up on one slot and counted down on another (its
/// owning thread moved), so an individual slot's value can go negative; only
/// the clamped sum is externally meaningful.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum PerfCounter {
    ConnCreated,
    ConnHandshakeFail,
    ConnAppReject,
    ConnResumed,
    ConnActive,
    ConnConnected,
    ConnProtocolErrors,
    ConnNoAlloc,
    StrmActive,
    PktsSuspectedLost,
    PktsDropped,
    PktsDecryptionFail,
    UdpRecv,
    UdpSend,
    UdpRecvBytes,
    UdpSendBytes,
    AppSendBytes,
    AppRecvBytes,
    ConnQueueDepth,
    ConnOperQueueDepth,
    WorkOperQueueDepth,
}

impl PerfCounter {
    pub const COUNT: usize = PerfCounter::WorkOperQueueDepth as usize + 1;
}

/// Freelist pool bounded at a fixed depth; anything beyond falls back to the
/// allocator.
pub struct Pool<T> {
    freelist: Mutex<Vec<Box<T>>>,
}

const MAX_POOL_DEPTH: usize = 256;

impl<T> Pool<T> {
    pub fn new() -> Self {
        Pool {
            freelist: Mutex::new(Vec::new()),
        }
    }

    /// Takes a pooled allocation, reinitializing it with `init`, or allocates
    /// fresh when the pool is dry.
    pub fn alloc_with(&self, init: impl FnOnce() -> T) -> Box<T> {
        match self.freelist.lock().unwrap().pop() {
            Some(mut recycled) => {
                *recycled = init();
                recycled
            }
            None => Box::new(init()),
        }
    }

    /// Returns an allocation for reuse.
    pub fn free(&self, item: Box<T>) {
        let mut freelist = self.freelist.lock().unwrap();
        if freelist.len() < MAX_POOL_DEPTH {
            freelist.push(item);
        }
    }

    /// Number of allocations currently cached.
    pub fn idle(&self) -> usize {
        self.freelist.lock().unwrap().len()
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One processor's slot: pools for connection-affine objects plus its share
/// of the perf counters.
pub struct PerProcessor {
    pub connection_pool: Pool<ConnectionState>,
    pub transport_params_pool: Pool<TransportParameters>,
    pub packet_space_pool: Pool<PacketSpace>,
    counters: [AtomicI64; PerfCounter::COUNT],
}

impl PerProcessor {
    fn new() -> Self {
        PerProcessor {
            connection_pool: Pool::new(),
            transport_params_pool: Pool::new(),
            packet_space_pool: Pool::new(),
            counters: std::array::from_fn(|_| AtomicI64::new(0)),
        }
    }

    pub fn counter_add(&self, counter: PerfCounter, delta: i64) {
        self.counters[counter as usize].fetch_add(delta, Ordering::Relaxed);
    }

    fn counter_load(&self, index: usize) -> i64 {
        self.counters[index].load(Ordering::Relaxed)
    }
}

/// Smallest mask of the form `2^n - 1` covering `partition_count`.
pub fn partition_mask(partition_count: u16) -> u16 {
    debug_assert!(partition_count != 0);
    debug_assert!(partition_count != 0xFFFF);

    let mut smeared = partition_count;
    smeared |= smeared >> 1;
    smeared |= smeared >> 2;
    smeared |= smeared >> 4;
    smeared |= smeared >> 8;
    let high_bit = smeared - (smeared >> 1);

    (high_bit << 1).wrapping_sub(1)
}

/// The partition fabric, sized once at initialization and immutable for the
/// library's lifetime.
pub struct Partitions {
    processor_count: u16,
    partition_count: u16,
    partition_mask: u16,
    toeplitz: ToeplitzHash,
    slots: Box<[PerProcessor]>,
}

impl Partitions {
    pub fn new(processor_count: u16, partition_count: u16) -> Self {
        debug_assert!(processor_count > 0);
        debug_assert!(partition_count > 0 && partition_count <= processor_count);
        let slots = (0..processor_count)
            .map(|_| PerProcessor::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Partitions {
            processor_count,
            partition_count,
            partition_mask: partition_mask(partition_count),
            toeplitz: ToeplitzHash::from_rng(),
            slots,
        }
    }

    pub fn processor_count(&self) -> u16 {
        self.processor_count
    }

    pub fn partition_count(&self) -> u16 {
        self.partition_count
    }

    pub fn partition_mask(&self) -> u16 {
        self.partition_mask
    }

    /// Maps a connection ID or address tuple to its partition: Toeplitz hash,
    /// mask, then a modulo fold for masked values past the count.
    pub fn partition_for(&self, input: &[u8]) -> u16 {
        let masked = (self.toeplitz.hash(input) as u16) & self.partition_mask;
        if masked >= self.partition_count {
            masked % self.partition_count
        } else {
            masked
        }
    }

    pub fn slot(&self, index: usize) -> &PerProcessor {
        &self.slots[index]
    }

    /// The calling thread's slot. Processor affinity is not observable from
    /// portable code, so threads are spread across slots by identity hash.
    pub fn current_slot_index(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() % self.slots.len() as u64) as usize
    }

    pub fn current_slot(&self) -> &PerProcessor {
        self.slot(self.current_slot_index())
    }

    pub fn counter_add(&self, counter: PerfCounter, delta: i64) {
        self.current_slot().counter_add(counter, delta);
    }

    /// Sums counters element-wise across every slot into `out`, which may
    /// cover a prefix of the counter set. Elements still negative after
    /// summation are clamped to zero; they are transient artifacts of
    /// concurrent cross-slot increments and decrements.
    pub fn sum_counters(&self, out: &mut [i64]) {
        debug_assert!(out.len() <= PerfCounter::COUNT);
        for (index, value) in out.iter_mut().enumerate() {
            *value = self.slots[0].counter_load(index);
        }
        for slot in &self.slots[1..] {
            for (index, value) in out.iter_mut().enumerate() {
                *value += slot.counter_load(index);
            }
        }
        for value in out.iter_mut() {
            if *value < 0 {
                *value = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_covers_count() {
        assert_eq!(partition_mask(1), 1);
        assert_eq!(partition_mask(2), 3);
        assert_eq!(partition_mask(3), 3);
        assert_eq!(partition_mask(4), 7);
        assert_eq!(partition_mask(6), 7);
        assert_eq!(partition_mask(8), 15);
        assert_eq!(partition_mask(64), 127);
    }

    #[test]
    fn mask_is_minimal_for_every_count() {
        for count in 1..=crate::MAX_PARTITION_COUNT {
            let mask = partition_mask(count);
            assert!(mask >= count, "mask {} below count {}", mask, count);
            assert_eq!(mask & (mask + 1), 0, "mask {} not 2^n-1", mask);
            if mask > 1 {
                assert!(mask / 2 < count, "mask {} not minimal for {}", mask, count);
            }
        }
    }

    #[test]
    fn partition_fold_stays_in_range() {
        let partitions = Partitions::new(6, 6);
        for seed in 0u32..200 {
            let input = seed.to_be_bytes();
            let partition = partitions.partition_for(&input);
            assert!(partition < 6);
        }
    }

    #[test]
    fn sum_clamps_negative_totals() {
        let partitions = Partitions::new(4, 4);
        partitions.slot(0).counter_add(PerfCounter::ConnActive, 3);
        partitions.slot(1).counter_add(PerfCounter::ConnActive, -1);
        partitions.slot(2).counter_add(PerfCounter::StrmActive, -5);
        partitions.slot(3).counter_add(PerfCounter::UdpRecv, 7);

        let mut counters = [0; PerfCounter::COUNT];
        partitions.sum_counters(&mut counters);
        assert_eq!(counters[PerfCounter::ConnActive as usize], 2);
        assert_eq!(counters[PerfCounter::StrmActive as usize], 0);
        assert_eq!(counters[PerfCounter::UdpRecv as usize], 7);
    }

    #[test]
    fn sum_accepts_a_prefix() {
        let partitions = Partitions::new(2, 2);
        partitions.slot(1).counter_add(PerfCounter::ConnCreated, 9);
        let mut prefix = [0; 1];
        partitions.sum_counters(&mut prefix);
        assert_eq!(prefix[0], 9);
    }

    #[test]
    fn pool_recycles_allocations() {
        let pool: Pool<u64> = Pool::new();
        let a = pool.alloc_with(|| 11);
        assert_eq!(*a, 11);
        pool.free(a);
        assert_eq!(pool.idle(), 1);
        let b = pool.alloc_with(|| 22);
        assert_eq!(*b, 22);
        assert_eq!(pool.idle(), 0);
    }
}
