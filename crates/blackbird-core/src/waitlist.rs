//! Wait-list scheduler: suspended tasks waiting on the clock.
//!
//! Tasks wait either for a wall-clock deadline (the sleep queue, keyed in
//! milliseconds) or for a position on the beat grid (the sync queue, keyed in
//! raw Q16.16 beats). Both queues live in one fixed arena of wait nodes
//! allocated at construction; a node is always in exactly one of the idle
//! pool, the sleep queue or the sync queue, so scheduling never allocates.
//!
//! Queues are singly linked through node indices and kept sorted ascending
//! by wakeup. Equal wakeups keep insertion order.

use crate::clock::BeatClock;
use crate::error::{Error, Result};
use crate::events::{ResumeEvent, TaskId, WaitKind};
use crate::ring::EventSink;
use crate::timing::{seconds_to_ms, BeatTime, Millis};

/// Default number of wait nodes.
pub const DEFAULT_MAX_WAITS: usize = 64;

#[derive(Clone, Copy, Debug)]
struct WaitNode {
    /// Milliseconds on the sleep queue, raw beats on the sync queue.
    wakeup: i64,
    task: TaskId,
    next: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default)]
struct Queue {
    head: Option<usize>,
    len: usize,
}

impl Queue {
    /// Insert after every node whose wakeup is not later than the new one.
    fn insert(&mut self, nodes: &mut [WaitNode], index: usize) {
        let wakeup = nodes[index].wakeup;
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(i) = cursor {
            if nodes[i].wakeup > wakeup {
                break;
            }
            prev = Some(i);
            cursor = nodes[i].next;
        }
        nodes[index].next = cursor;
        match prev {
            Some(p) => nodes[p].next = Some(index),
            None => self.head = Some(index),
        }
        self.len += 1;
    }

    /// Unlink the head if it is due at `limit`.
    fn pop_due(&mut self, nodes: &mut [WaitNode], limit: i64) -> Option<usize> {
        let head = self.head?;
        if nodes[head].wakeup > limit {
            return None;
        }
        self.head = nodes[head].next.take();
        self.len -= 1;
        Some(head)
    }

    fn pop(&mut self, nodes: &mut [WaitNode]) -> Option<usize> {
        self.pop_due(nodes, i64::MAX)
    }

    /// Unlink the first node belonging to `task`.
    fn remove(&mut self, nodes: &mut [WaitNode], task: TaskId) -> Option<usize> {
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(i) = cursor {
            if nodes[i].task == task {
                let next = nodes[i].next.take();
                match prev {
                    Some(p) => nodes[p].next = next,
                    None => self.head = next,
                }
                self.len -= 1;
                return Some(i);
            }
            prev = Some(i);
            cursor = nodes[i].next;
        }
        None
    }

    fn head_wakeup(&self, nodes: &[WaitNode]) -> Option<i64> {
        self.head.map(|i| nodes[i].wakeup)
    }
}

/// Counters exposed to the diagnostics surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Waits accepted since the last reset.
    pub successes: u32,
    /// Waits rejected for lack of a free node.
    pub failures: u32,
    pub active_sleep: u32,
    pub active_sync: u32,
    /// Most waits active at once since the last reset.
    pub active_max: u32,
    pub capacity: u32,
}

/// Fixed-capacity scheduler for sleep and sync waits.
#[derive(Clone, Debug)]
pub struct WaitListScheduler {
    nodes: Box<[WaitNode]>,
    idle: Option<usize>,
    sleep: Queue,
    sync: Queue,
    /// Beat position seen by the last tick.
    last_beat: BeatTime,
    successes: u32,
    failures: u32,
    active_max: u32,
}

impl Default for WaitListScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WAITS)
    }
}

impl WaitListScheduler {
    /// Create a scheduler with room for `capacity` concurrent waits.
    pub fn new(capacity: usize) -> Self {
        let nodes: Box<[WaitNode]> = (0..capacity)
            .map(|i| WaitNode {
                wakeup: 0,
                task: TaskId(0),
                next: (i + 1 < capacity).then_some(i + 1),
            })
            .collect();
        Self {
            idle: (capacity > 0).then_some(0),
            nodes,
            sleep: Queue::default(),
            sync: Queue::default(),
            last_beat: BeatTime::ZERO,
            successes: 0,
            failures: 0,
            active_max: 0,
        }
    }

    /// Total number of wait nodes.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Waits currently queued on either list.
    pub fn active(&self) -> usize {
        self.sleep.len + self.sync.len
    }

    /// Waits currently queued on one list.
    pub fn active_of(&self, kind: WaitKind) -> usize {
        match kind {
            WaitKind::Sleep => self.sleep.len,
            WaitKind::Sync => self.sync.len,
        }
    }

    /// Deadline of the earliest sleep wait.
    pub fn next_sleep_ms(&self) -> Option<Millis> {
        self.sleep
            .head_wakeup(&self.nodes)
            .map(|ms| ms.max(0) as Millis)
    }

    /// Beat position of the earliest sync wait.
    pub fn next_sync_beat(&self) -> Option<BeatTime> {
        self.sync.head_wakeup(&self.nodes).map(BeatTime::from_raw)
    }

    /// Wake `task` after `seconds` of wall-clock time.
    ///
    /// Zero is allowed and resumes at the next tick; negative and NaN
    /// durations are rejected.
    pub fn schedule_sleep(&mut self, task: TaskId, seconds: f64, now_ms: Millis) -> Result<()> {
        if seconds.is_nan() || seconds < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "sleep duration must be non-negative, got {seconds}"
            )));
        }
        let wakeup = now_ms.saturating_add(seconds_to_ms(seconds));
        self.enqueue(WaitKind::Sleep, task, wakeup.min(i64::MAX as u64) as i64)
    }

    /// Wake `task` at the next multiple of `beats` strictly after the current
    /// beat position.
    pub fn schedule_sync(
        &mut self,
        task: TaskId,
        beats: f64,
        clock: &BeatClock,
        now_ms: Millis,
    ) -> Result<()> {
        let step = BeatTime::from_float(beats);
        if beats.is_nan() || beats <= 0.0 || step <= BeatTime::ZERO {
            return Err(Error::InvalidArgument(format!(
                "sync interval must be positive, got {beats}"
            )));
        }

        let now = clock.beat_at(now_ms);
        let mut awaken = now.next_multiple_of(step);
        // A grid point the last tick already reached would fire again at once.
        if awaken <= self.last_beat {
            awaken = self.last_beat.next_multiple_of(step);
        }
        self.enqueue(WaitKind::Sync, task, awaken.raw())
    }

    /// Wake `task` after `beats` beats at the current beat duration, without
    /// aligning to the beat grid.
    pub fn schedule_beats(
        &mut self,
        task: TaskId,
        beats: f64,
        clock: &BeatClock,
        now_ms: Millis,
    ) -> Result<()> {
        if beats.is_nan() || beats < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "beat count must be non-negative, got {beats}"
            )));
        }
        let delay_ms = (beats * clock.beat_duration_ms() as f64).round();
        let delay_ms = if delay_ms >= i64::MAX as f64 {
            i64::MAX
        } else {
            delay_ms as i64
        };
        let wakeup = (now_ms.min(i64::MAX as u64) as i64).saturating_add(delay_ms);
        self.enqueue(WaitKind::Sleep, task, wakeup)
    }

    fn enqueue(&mut self, kind: WaitKind, task: TaskId, wakeup: i64) -> Result<()> {
        let Some(index) = self.idle else {
            self.failures = self.failures.wrapping_add(1);
            log::warn!(
                "[WAITS] No free wait node for {task} ({} in use)",
                self.nodes.len()
            );
            return Err(Error::ResourceExhausted {
                capacity: self.nodes.len(),
            });
        };
        self.idle = self.nodes[index].next;
        self.nodes[index].wakeup = wakeup;
        self.nodes[index].task = task;

        match kind {
            WaitKind::Sleep => self.sleep.insert(&mut self.nodes, index),
            WaitKind::Sync => self.sync.insert(&mut self.nodes, index),
        }
        self.successes = self.successes.wrapping_add(1);
        self.active_max = self.active_max.max(self.active() as u32);
        log::trace!("[WAITS] {task} waits on {kind:?} until {wakeup}");
        Ok(())
    }

    fn release(&mut self, index: usize) {
        self.nodes[index].next = self.idle;
        self.idle = Some(index);
    }

    /// Remove `task`'s pending wait. Returns whether one was found.
    pub fn cancel(&mut self, task: TaskId) -> bool {
        let found = self
            .sleep
            .remove(&mut self.nodes, task)
            .or_else(|| self.sync.remove(&mut self.nodes, task));
        match found {
            Some(index) => {
                self.release(index);
                true
            }
            None => false,
        }
    }

    /// Return every queued node to the idle pool. Returns how many waits
    /// were discarded.
    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        while let Some(index) = self.sleep.pop(&mut self.nodes) {
            self.release(index);
            cancelled += 1;
        }
        while let Some(index) = self.sync.pop(&mut self.nodes) {
            self.release(index);
            cancelled += 1;
        }
        if cancelled > 0 {
            log::info!("Cancelled {cancelled} pending waits");
        }
        cancelled
    }

    /// Post a resume event for every wait that is due at `now_ms`.
    ///
    /// All due sleep waits are posted before any sync wait. Returns the
    /// number of waits resolved; their nodes are back in the pool whether or
    /// not the sink accepted the event.
    pub fn tick<S>(&mut self, clock: &BeatClock, now_ms: Millis, sink: &mut S) -> usize
    where
        S: EventSink<ResumeEvent> + ?Sized,
    {
        let beat = clock.beat_at(now_ms);
        self.last_beat = beat;
        let mut resolved = 0;

        let limit_ms = now_ms.min(i64::MAX as u64) as i64;
        while let Some(index) = self.sleep.pop_due(&mut self.nodes, limit_ms) {
            self.resolve(index, WaitKind::Sleep, now_ms, sink);
            resolved += 1;
        }
        while let Some(index) = self.sync.pop_due(&mut self.nodes, beat.raw()) {
            self.resolve(index, WaitKind::Sync, now_ms, sink);
            resolved += 1;
        }
        resolved
    }

    fn resolve<S>(&mut self, index: usize, kind: WaitKind, now_ms: Millis, sink: &mut S)
    where
        S: EventSink<ResumeEvent> + ?Sized,
    {
        let task = self.nodes[index].task;
        self.release(index);
        let outcome = sink.post(ResumeEvent {
            task,
            kind,
            timestamp_ms: now_ms,
        });
        if !outcome.is_delivered() {
            log::trace!("[WAITS] Resume for {task} was dropped");
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            successes: self.successes,
            failures: self.failures,
            active_sleep: self.sleep.len as u32,
            active_sync: self.sync.len as u32,
            active_max: self.active_max,
            capacity: self.nodes.len() as u32,
        }
    }

    /// Zero the counters; the high-water mark restarts at the current count.
    pub fn reset_stats(&mut self) {
        self.successes = 0;
        self.failures = 0;
        self.active_max = self.active() as u32;
    }
}
