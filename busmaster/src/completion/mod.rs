//! Deferred completion queue.
//!
//! Moves finished mappings from the interrupt handler to the bottom half,
//! which does the unmapping (cache sync, bounce copy-back, translation
//! unlock) that must never run in interrupt context.
//!
//! # Ring
//!
//! ```text
//!        tail (consumer)           head (producer)
//!          │                         │
//!   [ . . R R R R R R . . . . . . . . ]   N slots, N - 1 usable
//!
//!   enqueue:  seq odd → write slot → publish head (Release) → seq even
//!   drain:    take slot → advance tail (Release) → unmap
//! ```
//!
//! One producer, one consumer. [`CompletionQueue::split`] hands out exactly
//! one [`Producer`] and one [`Consumer`]; the interrupt handler keeps the
//! producer and never sees the mapper.
//!
//! # Failure handling
//!
//! A full ring rejects the record and raises the overflow flag; the producer
//! puts the mapping back on its descriptor. The consumer's overflow recovery
//! then walks the hardware ring and unmaps every completed descriptor that
//! still holds a mapping. A watchdog flags records that sat in the queue
//! longer than the timeout; drain reports them as timed out.

mod ring;

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use static_assertions::const_assert;

use crate::config::DmaConfig;
use crate::dma::{DmaBuffer, Mapping, Unmap};
use crate::error::DmaError;
use crate::sync::{without_interrupts, SeqCount};
use crate::time::{Clock, Timeout};

pub use ring::{DescriptorRing, MappingTable};

/// Default ring size.
pub const COMPLETION_QUEUE_SIZE: usize = 128;
const_assert!(COMPLETION_QUEUE_SIZE.is_power_of_two());

/// Records older than this are flagged by the watchdog.
pub const COMPLETION_TIMEOUT_MS: u64 = 5000;

/// Default completions handled per bottom-half pass.
pub const DRAIN_BATCH: usize = 16;

/// Snapshot retries before falling back to a masked read.
pub const SEQLOCK_MAX_RETRIES: u32 = 256;

// ═══════════════════════════════════════════════════════════════════════════
// RECORDS
// ═══════════════════════════════════════════════════════════════════════════

/// A finished transfer waiting to be unmapped.
#[derive(Debug)]
pub struct CompletionRecord {
    pub nic: u8,
    pub desc_index: u16,
    mapping: Mapping,
    timestamp: u64,
}

impl CompletionRecord {
    pub fn new(nic: u8, desc_index: u16, mapping: Mapping, timestamp: u64) -> Self {
        Self {
            nic,
            desc_index,
            mapping,
            timestamp,
        }
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    /// Clock reading when the completion was observed.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn into_mapping(self) -> Mapping {
        self.mapping
    }
}

/// A record the full ring refused, handed back whole.
#[derive(Debug)]
pub struct Rejected(pub CompletionRecord);

impl Rejected {
    pub fn into_mapping(self) -> Mapping {
        self.0.into_mapping()
    }

    pub fn error(&self) -> DmaError {
        DmaError::QueueOverflow
    }
}

/// What one [`Producer::service_ring`] walk did.
#[must_use = "a stranded mapping leaks unless the bottom half unmaps it"]
#[derive(Debug)]
pub struct RingService {
    /// Mappings queued.
    pub queued: usize,
    /// Refused by the full queue and its descriptor slot was taken
    /// meanwhile. Pass it to the bottom half for unmapping.
    pub stranded: Option<Rejected>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    /// Sat in the queue past the watchdog timeout.
    TimedOut,
    /// Found by overflow recovery, never queued.
    Recovered,
}

/// An unmapped transfer, buffer returned.
#[derive(Debug)]
pub struct Completion {
    pub nic: u8,
    pub desc_index: u16,
    pub buffer: DmaBuffer,
    pub status: CompletionStatus,
}

impl Completion {
    pub fn error(&self) -> Option<DmaError> {
        match self.status {
            CompletionStatus::TimedOut => Some(DmaError::Timeout),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// STATISTICS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u32,
    pub completed: u32,
    pub overflow_events: u32,
    pub timeouts: u32,
    pub recovered: u32,
    pub seqlock_fallbacks: u32,
    /// Deepest the queue has been.
    pub high_water: u32,
    /// Rejected mappings whose descriptor slot was taken meanwhile,
    /// handed back stranded.
    pub lost: u32,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU32,
    completed: AtomicU32,
    overflow_events: AtomicU32,
    timeouts: AtomicU32,
    recovered: AtomicU32,
    seqlock_fallbacks: AtomicU32,
    high_water: AtomicU32,
    lost: AtomicU32,
}

fn bump(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Consistent view of the ring indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub head: usize,
    pub tail: usize,
    pub seq: u32,
    /// Records between tail and head.
    pub len: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE
// ═══════════════════════════════════════════════════════════════════════════

struct Slot {
    record: UnsafeCell<Option<CompletionRecord>>,
    timed_out: AtomicBool,
}

/// Single-producer single-consumer completion ring of `N` slots.
pub struct CompletionQueue<C, const N: usize = COMPLETION_QUEUE_SIZE> {
    slots: [Slot; N],
    head: AtomicUsize,
    tail: AtomicUsize,
    seq: SeqCount,
    overflow: AtomicBool,
    clock: C,
    timeout_ms: u64,
    drain_batch: usize,
    counters: Counters,
}

// SAFETY: slots in [tail, head) belong to the consumer, the rest to the
// producer, and `split` allows only one of each.
unsafe impl<C: Sync, const N: usize> Sync for CompletionQueue<C, N> {}

impl<C: Clock, const N: usize> CompletionQueue<C, N> {
    const MASK: usize = {
        assert!(N.is_power_of_two() && N >= 2, "queue size must be a power of two");
        N - 1
    };

    pub fn new(clock: C, timeout_ms: u64) -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                record: UnsafeCell::new(None),
                timed_out: AtomicBool::new(false),
            }),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            seq: SeqCount::new(),
            overflow: AtomicBool::new(false),
            clock,
            timeout_ms,
            drain_batch: DRAIN_BATCH,
            counters: Counters::default(),
        }
    }

    pub fn from_config(clock: C, config: &DmaConfig) -> Self {
        let mut queue = Self::new(clock, config.completion_timeout_ms);
        queue.drain_batch = config.drain_batch.max(1);
        queue
    }

    /// Hand out the interrupt-side and bottom-half-side handles.
    pub fn split(&mut self) -> (Producer<'_, C, N>, Consumer<'_, C, N>) {
        let queue: &Self = self;
        (Producer { queue }, Consumer { queue })
    }

    /// Usable slots.
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Read head and tail as a consistent pair.
    ///
    /// Retries while a write is in progress; after
    /// [`SEQLOCK_MAX_RETRIES`] it masks interrupts and reads directly.
    pub fn snapshot(&self) -> QueueSnapshot {
        for _ in 0..SEQLOCK_MAX_RETRIES {
            let Some(start) = self.seq.read_begin() else {
                spin_loop();
                continue;
            };
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if self.seq.read_validate(start) {
                return self.describe(head, tail, start);
            }
            spin_loop();
        }

        bump(&self.counters.seqlock_fallbacks);
        without_interrupts(|| {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            self.describe(head, tail, self.seq.current())
        })
    }

    pub fn len(&self) -> usize {
        self.snapshot().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.counters;
        let load = |a: &AtomicU32| a.load(Ordering::Relaxed);
        QueueStats {
            enqueued: load(&c.enqueued),
            completed: load(&c.completed),
            overflow_events: load(&c.overflow_events),
            timeouts: load(&c.timeouts),
            recovered: load(&c.recovered),
            seqlock_fallbacks: load(&c.seqlock_fallbacks),
            high_water: load(&c.high_water),
            lost: load(&c.lost),
        }
    }

    fn describe(&self, head: usize, tail: usize, seq: u32) -> QueueSnapshot {
        QueueSnapshot {
            head,
            tail,
            seq,
            len: head.wrapping_sub(tail) & Self::MASK,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PRODUCER (interrupt side)
// ═══════════════════════════════════════════════════════════════════════════

/// Interrupt-side handle. Never blocks, never logs, never unmaps.
pub struct Producer<'q, C, const N: usize = COMPLETION_QUEUE_SIZE> {
    queue: &'q CompletionQueue<C, N>,
}

impl<'q, C: Clock, const N: usize> Producer<'q, C, N> {
    /// Queue a record. A full ring hands it back.
    pub fn enqueue(&mut self, record: CompletionRecord) -> Result<(), Rejected> {
        let q = self.queue;
        let mask = CompletionQueue::<C, N>::MASK;
        let head = q.head.load(Ordering::Relaxed);
        let tail = q.tail.load(Ordering::Acquire);
        let next = (head + 1) & mask;
        if next == tail {
            q.overflow.store(true, Ordering::Release);
            bump(&q.counters.overflow_events);
            return Err(Rejected(record));
        }

        q.seq.write_begin();
        let slot = &q.slots[head];
        // SAFETY: `head` is outside [tail, head), so the consumer is done
        // with this slot until we publish it.
        unsafe { *slot.record.get() = Some(record) };
        slot.timed_out.store(false, Ordering::Relaxed);
        q.head.store(next, Ordering::Release);
        q.seq.write_end();

        bump(&q.counters.enqueued);
        let depth = (next.wrapping_sub(tail) & mask) as u32;
        q.counters.high_water.fetch_max(depth, Ordering::Relaxed);
        Ok(())
    }

    /// Queue the mapping of a finished descriptor, stamped with the current
    /// time.
    pub fn queue_completion(&mut self, nic: u8, desc_index: u16, mapping: Mapping) -> Result<(), Rejected> {
        let timestamp = self.queue.clock.now();
        self.enqueue(CompletionRecord::new(nic, desc_index, mapping, timestamp))
    }

    /// Interrupt-handler walk: queue the mapping of every completed
    /// descriptor.
    ///
    /// On overflow the mapping goes back on its descriptor and the walk
    /// stops; overflow recovery picks up the rest. A mapping whose slot was
    /// reused in the meantime comes back in [`RingService::stranded`].
    pub fn service_ring<R: DescriptorRing + ?Sized>(&mut self, nic: u8, ring: &R) -> RingService {
        let mut queued = 0;
        for index in 0..ring.descriptor_count() {
            if !ring.is_hw_complete(index) {
                continue;
            }
            let Some(mapping) = ring.take_mapping(index) else {
                continue;
            };
            match self.queue_completion(nic, index as u16, mapping) {
                Ok(()) => queued += 1,
                Err(Rejected(record)) => {
                    let CompletionRecord {
                        desc_index,
                        mapping,
                        timestamp,
                        ..
                    } = record;
                    let stranded = ring.attach_mapping(index, mapping).err().map(|mapping| {
                        bump(&self.queue.counters.lost);
                        Rejected(CompletionRecord::new(nic, desc_index, mapping, timestamp))
                    });
                    return RingService { queued, stranded };
                }
            }
        }
        RingService {
            queued,
            stranded: None,
        }
    }

    pub fn queue(&self) -> &CompletionQueue<C, N> {
        self.queue
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONSUMER (bottom half)
// ═══════════════════════════════════════════════════════════════════════════

/// Bottom-half handle. Does all unmapping.
pub struct Consumer<'q, C, const N: usize = COMPLETION_QUEUE_SIZE> {
    queue: &'q CompletionQueue<C, N>,
}

impl<'q, C: Clock, const N: usize> Consumer<'q, C, N> {
    /// Unmap up to `max` queued completions, oldest first.
    pub fn drain_batch<U, F>(&mut self, unmapper: &mut U, max: usize, mut on_complete: F) -> usize
    where
        U: Unmap + ?Sized,
        F: FnMut(Completion),
    {
        let q = self.queue;
        let mask = CompletionQueue::<C, N>::MASK;
        let mut drained = 0;

        while drained < max {
            let tail = q.tail.load(Ordering::Relaxed);
            let head = q.head.load(Ordering::Acquire);
            if tail == head {
                break;
            }
            let slot = &q.slots[tail];
            // SAFETY: `tail` is inside [tail, head), which the producer
            // published and will not touch until we advance past it.
            let record = unsafe { (*slot.record.get()).take() };
            let timed_out = slot.timed_out.swap(false, Ordering::Relaxed);
            q.tail.store((tail + 1) & mask, Ordering::Release);

            let Some(record) = record else {
                log::error!("completion: published slot {} was empty", tail);
                continue;
            };
            let status = if timed_out {
                CompletionStatus::TimedOut
            } else {
                CompletionStatus::Completed
            };
            let CompletionRecord {
                nic,
                desc_index,
                mapping,
                ..
            } = record;
            let buffer = unmapper.unmap(mapping);
            bump(&q.counters.completed);
            on_complete(Completion {
                nic,
                desc_index,
                buffer,
                status,
            });
            drained += 1;
        }
        drained
    }

    /// Unmap everything queued.
    pub fn drain<U, F>(&mut self, unmapper: &mut U, on_complete: F) -> usize
    where
        U: Unmap + ?Sized,
        F: FnMut(Completion),
    {
        self.drain_batch(unmapper, usize::MAX, on_complete)
    }

    /// Flag queued records older than the timeout. Never touches hardware.
    pub fn watchdog_sweep(&mut self) -> usize {
        let q = self.queue;
        let mask = CompletionQueue::<C, N>::MASK;
        let snap = q.snapshot();
        let now = q.clock.now();
        let ticks = q.clock.ms_to_ticks(q.timeout_ms);

        let mut flagged = 0;
        let mut index = snap.tail;
        while index != snap.head {
            let slot = &q.slots[index];
            // SAFETY: inside the consistent [tail, head) window.
            let stamp = unsafe { (*slot.record.get()).as_ref().map(|r| r.timestamp) };
            if let Some(stamp) = stamp {
                if !slot.timed_out.load(Ordering::Relaxed) && Timeout::new(stamp, ticks).expired_at(now) {
                    slot.timed_out.store(true, Ordering::Relaxed);
                    bump(&q.counters.timeouts);
                    flagged += 1;
                }
            }
            index = (index + 1) & mask;
        }

        if flagged > 0 {
            log::warn!(
                "completion: {} transfers waited more than {} ms",
                flagged,
                q.timeout_ms
            );
        }
        flagged
    }

    pub fn overflowed(&self) -> bool {
        self.queue.overflowed()
    }

    /// Reconcile after an overflow: unmap every completed descriptor of
    /// `ring` that still holds a mapping. No-op unless the flag is set.
    pub fn recover_overflow<U, R, F>(&mut self, unmapper: &mut U, nic: u8, ring: &R, mut on_complete: F) -> usize
    where
        U: Unmap + ?Sized,
        R: DescriptorRing + ?Sized,
        F: FnMut(Completion),
    {
        let q = self.queue;
        if !q.overflow.swap(false, Ordering::AcqRel) {
            return 0;
        }

        let mut recovered = 0;
        for index in 0..ring.descriptor_count() {
            if !ring.is_hw_complete(index) {
                continue;
            }
            let Some(mapping) = ring.take_mapping(index) else {
                continue;
            };
            let buffer = unmapper.unmap(mapping);
            bump(&q.counters.recovered);
            on_complete(Completion {
                nic,
                desc_index: index as u16,
                buffer,
                status: CompletionStatus::Recovered,
            });
            recovered += 1;
        }
        log::warn!("completion: overflow recovery reclaimed {} descriptors", recovered);
        recovered
    }

    /// One bottom-half pass: watchdog, a batched drain, then overflow
    /// recovery if the producer overflowed.
    pub fn process<U, R, F>(&mut self, unmapper: &mut U, nic: u8, ring: &R, mut on_complete: F) -> usize
    where
        U: Unmap + ?Sized,
        R: DescriptorRing + ?Sized,
        F: FnMut(Completion),
    {
        self.watchdog_sweep();
        let batch = self.queue.drain_batch;
        let mut handled = self.drain_batch(unmapper, batch, &mut on_complete);
        if self.overflowed() {
            // Queued records first, so recovery only sees what never made it.
            handled += self.drain(unmapper, &mut on_complete);
            handled += self.recover_overflow(unmapper, nic, ring, &mut on_complete);
        }
        handled
    }

    pub fn queue(&self) -> &CompletionQueue<C, N> {
        self.queue
    }
}
