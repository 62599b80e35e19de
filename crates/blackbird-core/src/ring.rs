//! Lock-free single-producer/single-consumer ring buffer.
//!
//! [`channel`] splits a ring into a [`Producer`] and a [`Consumer`]. Neither
//! half is `Clone` and every mutating method takes `&mut self`, so exactly one
//! context can post and exactly one can read.
//!
//! Both cursors are free-running `u32` counters, masked with `N - 1` only when
//! indexing storage:
//!
//! - empty: `write == read`
//! - full: `write - read == N`
//! - depth: `write - read` (wrapping)
//!
//! The producer writes a slot completely before publishing it with a
//! `Release` store of the write cursor; the consumer reads the write cursor
//! with `Acquire` before touching the slot. Slots also carry a sequence
//! number so a coalescing overwrite of a pending entry is never observed
//! half-written.
//!
//! The producer can also mark everything posted so far as stale with
//! [`Producer::discard_pending`]. The consumer skips stale entries on its
//! next read, so a reset on the producer side reaches events already in
//! flight. A consumer that requested such a reset calls
//! [`Consumer::await_discard`] first and reads nothing until the mark lands.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default ring capacity (power of two).
pub const DEFAULT_CAPACITY: usize = 128;

/// Drops between two "ring full" warnings.
const DROP_WARN_INTERVAL: u32 = 100;

/// An event that can travel through a ring.
pub trait RingItem: Copy + Send + 'static {
    /// Logical source used to coalesce events under pressure.
    ///
    /// Two events with the same key replace each other; `None` means the
    /// event never coalesces.
    fn coalesce_key(&self) -> Option<u32> {
        None
    }
}

/// What a full ring does with a new event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Discard the new event.
    #[default]
    Drop,
    /// Overwrite the newest pending event from the same source, falling back
    /// to dropping when there is none.
    ///
    /// If the consumer takes the matched entry while it is being replaced,
    /// the new event can be lost. It is counted as dropped whenever the
    /// producer sees the consumer move past that entry.
    Coalesce,
}

/// Result of posting an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostOutcome {
    /// Appended to the ring.
    Queued,
    /// Replaced a pending event from the same source.
    Coalesced,
    /// Discarded; the ring was full.
    Dropped,
}

impl PostOutcome {
    /// Whether the event will reach the consumer.
    pub fn is_delivered(self) -> bool {
        !matches!(self, PostOutcome::Dropped)
    }
}

/// Anything that accepts events from the real-time side.
pub trait EventSink<E> {
    /// Hand an event over. Never blocks.
    fn post(&mut self, event: E) -> PostOutcome;
}

impl<E> EventSink<E> for Vec<E> {
    fn post(&mut self, event: E) -> PostOutcome {
        self.push(event);
        PostOutcome::Queued
    }
}

/// Point-in-time view of a ring's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    pub posted: u32,
    pub processed: u32,
    pub dropped: u32,
    pub coalesced: u32,
    /// Highest depth observed since the last reset.
    pub high_water: u32,
    pub depth: u32,
    pub capacity: u32,
}

struct Slot<T> {
    /// Even while stable, odd while the producer is writing.
    seq: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T: Copy> Slot<T> {
    fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Producer only.
    fn store(&self, value: T) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: only the producer writes slots, and readers validate the
        // sequence number around their copy.
        unsafe { std::ptr::write_volatile((*self.value.get()).as_mut_ptr(), value) };
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Caller must have observed this slot published by the write cursor.
    fn load(&self) -> T {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: the slot was initialised before being published; a copy
            // racing a coalescing write is discarded by the sequence check.
            let value = unsafe { std::ptr::read_volatile((*self.value.get()).as_ptr()) };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return value;
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    posted: AtomicU32,
    processed: AtomicU32,
    dropped: AtomicU32,
    coalesced: AtomicU32,
    high_water: AtomicU32,
}

struct Shared<T> {
    name: &'static str,
    policy: OverflowPolicy,
    /// Written only by the producer.
    write: AtomicU32,
    /// Written only by the consumer.
    read: AtomicU32,
    /// Write cursor at the last [`Producer::discard_pending`].
    discard_mark: AtomicU32,
    /// Bumped by every [`Producer::discard_pending`].
    discard_epoch: AtomicU32,
    slots: Box<[Slot<T>]>,
    counters: Counters,
}

// SAFETY: slot access is partitioned by the cursors (see module docs) and
// the only shared write, a coalescing overwrite, is guarded by the slot
// sequence number.
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn depth(&self) -> u32 {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    fn stats(&self) -> RingStats {
        RingStats {
            posted: self.counters.posted.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            high_water: self.counters.high_water.load(Ordering::Relaxed),
            depth: self.depth(),
            capacity: self.slots.len() as u32,
        }
    }

    fn reset_stats(&self) {
        self.counters.posted.store(0, Ordering::Relaxed);
        self.counters.processed.store(0, Ordering::Relaxed);
        self.counters.dropped.store(0, Ordering::Relaxed);
        self.counters.coalesced.store(0, Ordering::Relaxed);
        self.counters.high_water.store(self.depth(), Ordering::Relaxed);
    }
}

/// Create a ring of capacity `N` and split it into its two halves.
pub fn channel<T: RingItem, const N: usize>(
    name: &'static str,
    policy: OverflowPolicy,
) -> (Producer<T, N>, Consumer<T, N>) {
    let () = Producer::<T, N>::CAPACITY_OK;
    let shared = Arc::new(Shared {
        name,
        policy,
        write: AtomicU32::new(0),
        read: AtomicU32::new(0),
        discard_mark: AtomicU32::new(0),
        discard_epoch: AtomicU32::new(0),
        slots: (0..N).map(|_| Slot::new()).collect(),
        counters: Counters::default(),
    });
    (
        Producer {
            shared: Arc::clone(&shared),
            stale_below: None,
        },
        Consumer {
            shared,
            epoch_seen: 0,
            epoch_wanted: 0,
        },
    )
}

/// Posting half of a ring.
pub struct Producer<T, const N: usize> {
    shared: Arc<Shared<T>>,
    /// Entries below this cursor are stale and never coalesced into.
    stale_below: Option<u32>,
}

impl<T: RingItem, const N: usize> Producer<T, N> {
    const MASK: u32 = (N - 1) as u32;
    const CAPACITY_OK: () = assert!(
        N.is_power_of_two() && N <= (1 << 31),
        "ring capacity must be a power of two"
    );

    /// Post an event without blocking.
    pub fn post(&mut self, event: T) -> PostOutcome {
        let shared = &*self.shared;
        let write = shared.write.load(Ordering::Relaxed);
        let read = shared.read.load(Ordering::Acquire);
        let depth = write.wrapping_sub(read);
        if depth as usize >= N {
            return self.overflow(event, write, read);
        }

        shared.slots[(write & Self::MASK) as usize].store(event);
        shared.write.store(write.wrapping_add(1), Ordering::Release);
        shared.counters.posted.fetch_add(1, Ordering::Relaxed);
        shared.counters.high_water.fetch_max(depth + 1, Ordering::Relaxed);
        PostOutcome::Queued
    }

    /// Post an event, reporting a dropped event as [`Error::RingFull`].
    pub fn try_post(&mut self, event: T) -> Result<PostOutcome> {
        match self.post(event) {
            PostOutcome::Dropped => Err(Error::RingFull {
                ring: self.shared.name,
            }),
            outcome => Ok(outcome),
        }
    }

    /// Mark every event posted so far as stale.
    ///
    /// The consumer skips them instead of returning them; events posted
    /// after this call are delivered as usual.
    pub fn discard_pending(&mut self) {
        let shared = &*self.shared;
        let write = shared.write.load(Ordering::Relaxed);
        shared.discard_mark.store(write, Ordering::Relaxed);
        shared.discard_epoch.fetch_add(1, Ordering::Release);
        self.stale_below = Some(write);
    }

    fn overflow(&mut self, event: T, write: u32, read: u32) -> PostOutcome {
        let shared = &*self.shared;
        if shared.policy == OverflowPolicy::Coalesce {
            if let Some(key) = event.coalesce_key() {
                // Stale entries are gone as far as the consumer is concerned.
                let mut floor = read;
                if let Some(mark) = self.stale_below {
                    if mark.wrapping_sub(read) as usize <= N {
                        floor = mark;
                    } else {
                        self.stale_below = None;
                    }
                }
                // Newest pending entry first.
                let mut index = write;
                while index != floor {
                    index = index.wrapping_sub(1);
                    let slot = &shared.slots[(index & Self::MASK) as usize];
                    if slot.load().coalesce_key() == Some(key) {
                        slot.store(event);
                        // The consumer may have taken the old entry meanwhile.
                        let read = shared.read.load(Ordering::Acquire);
                        if index.wrapping_sub(read) as usize >= N {
                            return self.drop_event();
                        }
                        shared.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                        return PostOutcome::Coalesced;
                    }
                }
            }
        }
        self.drop_event()
    }

    fn drop_event(&self) -> PostOutcome {
        let shared = &*self.shared;
        let dropped = shared.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped % DROP_WARN_INTERVAL == 0 {
            log::warn!("Ring '{}' full, dropped {} events", shared.name, dropped);
        }
        PostOutcome::Dropped
    }

    /// Number of pending events.
    pub fn depth(&self) -> u32 {
        self.shared.depth()
    }

    /// Whether another event fits without overflow handling.
    pub fn is_full(&self) -> bool {
        self.depth() as usize >= N
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }

    /// A read-only view of this ring's counters.
    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            shared: Arc::clone(&self.shared) as Arc<dyn StatsSource>,
        }
    }
}

impl<T: RingItem, const N: usize> EventSink<T> for Producer<T, N> {
    fn post(&mut self, event: T) -> PostOutcome {
        Producer::post(self, event)
    }
}

/// Reading half of a ring.
pub struct Consumer<T, const N: usize> {
    shared: Arc<Shared<T>>,
    /// Discard epoch whose mark has been fully skipped.
    epoch_seen: u32,
    /// Until the discard epoch reaches this, everything pending is stale.
    epoch_wanted: u32,
}

impl<T: RingItem, const N: usize> Consumer<T, N> {
    const MASK: u32 = (N - 1) as u32;

    /// First live entry at or after `read`, given a `write` cursor loaded
    /// before this call. Also returns the discard epoch once every entry it
    /// marked stale lies below `write`.
    fn live_read(&self, read: u32, write: u32) -> (u32, Option<u32>) {
        let shared = &*self.shared;
        let epoch = shared.discard_epoch.load(Ordering::Acquire);
        // Entries below `write` were posted before the awaited mark.
        if (self.epoch_wanted.wrapping_sub(epoch) as i32) > 0 {
            return (write, None);
        }
        if epoch == self.epoch_seen {
            return (read, Some(epoch));
        }
        let mark = shared.discard_mark.load(Ordering::Relaxed);
        let to_mark = mark.wrapping_sub(read);
        let to_write = write.wrapping_sub(read);
        if to_mark as usize > N {
            // Already passed.
            (read, Some(epoch))
        } else if to_mark <= to_write {
            (mark, Some(epoch))
        } else {
            (write, None)
        }
    }

    /// Advance past stale entries. Returns the new read cursor.
    fn skip_stale(&mut self, write: u32) -> u32 {
        let shared = &*self.shared;
        let read = shared.read.load(Ordering::Relaxed);
        let (live, settled) = self.live_read(read, write);
        if let Some(epoch) = settled {
            self.epoch_seen = epoch;
        }
        if live != read {
            shared.read.store(live, Ordering::Release);
            log::debug!(
                "Ring '{}' skipped {} stale events",
                shared.name,
                live.wrapping_sub(read)
            );
        }
        live
    }

    /// Treat everything as stale until the producer's next
    /// [`Producer::discard_pending`]. Call before asking for the discard.
    pub fn await_discard(&mut self) {
        let epoch = self.shared.discard_epoch.load(Ordering::Acquire);
        self.epoch_wanted = epoch.wrapping_add(1);
    }

    /// Stop waiting for a discard that was never requested.
    pub fn cancel_await(&mut self) {
        self.epoch_wanted = self.shared.discard_epoch.load(Ordering::Acquire);
    }

    /// Remove and return the oldest pending event.
    pub fn get(&mut self) -> Option<T> {
        let write = self.shared.write.load(Ordering::Acquire);
        let read = self.skip_stale(write);
        if read == write {
            return None;
        }
        let shared = &*self.shared;
        let event = shared.slots[(read & Self::MASK) as usize].load();
        shared.read.store(read.wrapping_add(1), Ordering::Release);
        shared.counters.processed.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Return the oldest pending event without consuming it.
    pub fn peek(&self) -> Option<T> {
        let shared = &*self.shared;
        let write = shared.write.load(Ordering::Acquire);
        let (read, _) = self.live_read(shared.read.load(Ordering::Relaxed), write);
        if read == write {
            return None;
        }
        Some(shared.slots[(read & Self::MASK) as usize].load())
    }

    /// Number of pending events.
    pub fn depth(&self) -> u32 {
        self.shared.depth()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Discard everything pending. Returns how many live events were
    /// discarded.
    pub fn clear(&mut self) -> u32 {
        let write = self.shared.write.load(Ordering::Acquire);
        let read = self.skip_stale(write);
        self.shared.read.store(write, Ordering::Release);
        write.wrapping_sub(read)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }

    /// Zero the counters; the high-water mark restarts at the current depth.
    pub fn reset_stats(&self) {
        self.shared.reset_stats();
    }

    /// A read-only view of this ring's counters.
    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            shared: Arc::clone(&self.shared) as Arc<dyn StatsSource>,
        }
    }
}

trait StatsSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn stats(&self) -> RingStats;
}

impl<T: Send> StatsSource for Shared<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn stats(&self) -> RingStats {
        Shared::stats(self)
    }
}

/// Cloneable, type-erased view of a ring's counters for diagnostics.
#[derive(Clone)]
pub struct RingMonitor {
    shared: Arc<dyn StatsSource>,
}

impl RingMonitor {
    /// Ring name.
    pub fn name(&self) -> &'static str {
        self.shared.name()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }
}

impl std::fmt::Debug for RingMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingMonitor")
            .field("name", &self.name())
            .field("stats", &self.stats())
            .finish()
    }
}
