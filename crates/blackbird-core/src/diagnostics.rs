//! Counters published by the real-time core for the script side.
//!
//! The real-time core stores into relaxed atomics once per tick; readers take
//! a [`DiagnosticsSnapshot`]. Values are individually current but a snapshot
//! is not an atomic view across fields.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::events::TransportChanged;
use crate::timers::TimerStats;
use crate::timing::BeatTime;
use crate::waitlist::SchedulerStats;

/// Shared counter block, written by the real-time core only.
#[derive(Debug, Default)]
pub struct Diagnostics {
    now_ms: AtomicU64,
    beat_raw: AtomicI64,
    beat_duration_ms: AtomicU32,

    transport_running: AtomicBool,
    transport_beat_raw: AtomicI64,
    transport_ms: AtomicU64,
    /// Bumped after every transport change is stored.
    transport_changes: AtomicU64,

    wait_successes: AtomicU32,
    wait_failures: AtomicU32,
    active_sleep: AtomicU32,
    active_sync: AtomicU32,
    active_max: AtomicU32,
    wait_capacity: AtomicU32,
    exhaustion_resumes: AtomicU32,

    timer_fires: AtomicU64,
    timer_overruns: AtomicU32,
    timer_resyncs: AtomicU32,
    skipped_blocks: AtomicU64,
    active_timers: AtomicU32,

    commands_applied: AtomicU64,
    command_errors: AtomicU32,
}

impl Diagnostics {
    pub(crate) fn publish_clock(&self, now_ms: u64, beat: BeatTime, beat_duration_ms: u32) {
        self.now_ms.store(now_ms, Ordering::Relaxed);
        self.beat_raw.store(beat.raw(), Ordering::Relaxed);
        self.beat_duration_ms.store(beat_duration_ms, Ordering::Relaxed);
    }

    /// Initial transport state, without counting it as a change.
    pub(crate) fn init_transport(&self, running: bool) {
        self.transport_running.store(running, Ordering::Relaxed);
    }

    pub(crate) fn publish_transport(&self, running: bool, beat: BeatTime, now_ms: u64) {
        self.transport_running.store(running, Ordering::Relaxed);
        self.transport_beat_raw.store(beat.raw(), Ordering::Relaxed);
        self.transport_ms.store(now_ms, Ordering::Relaxed);
        self.transport_changes.fetch_add(1, Ordering::Release);
    }

    /// Number of transport changes so far and the latest state.
    pub fn transport(&self) -> (u64, TransportChanged) {
        let changes = self.transport_changes.load(Ordering::Acquire);
        let state = TransportChanged {
            running: self.transport_running.load(Ordering::Relaxed),
            beat: BeatTime::from_raw(self.transport_beat_raw.load(Ordering::Relaxed)),
            timestamp_ms: self.transport_ms.load(Ordering::Relaxed),
        };
        (changes, state)
    }

    pub(crate) fn publish_scheduler(&self, stats: &SchedulerStats) {
        self.wait_successes.store(stats.successes, Ordering::Relaxed);
        self.wait_failures.store(stats.failures, Ordering::Relaxed);
        self.active_sleep.store(stats.active_sleep, Ordering::Relaxed);
        self.active_sync.store(stats.active_sync, Ordering::Relaxed);
        self.active_max.store(stats.active_max, Ordering::Relaxed);
        self.wait_capacity.store(stats.capacity, Ordering::Relaxed);
    }

    pub(crate) fn publish_timers(&self, stats: &TimerStats) {
        self.timer_fires.store(stats.fires, Ordering::Relaxed);
        self.timer_overruns.store(stats.overruns, Ordering::Relaxed);
        self.timer_resyncs.store(stats.forced_resyncs, Ordering::Relaxed);
        self.skipped_blocks.store(stats.skipped_blocks, Ordering::Relaxed);
        self.active_timers.store(stats.active, Ordering::Relaxed);
    }

    pub(crate) fn record_exhaustion_resume(&self) {
        self.exhaustion_resumes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_command(&self, ok: bool) {
        self.commands_applied.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.command_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn reset_counters(&self) {
        self.exhaustion_resumes.store(0, Ordering::Relaxed);
        self.commands_applied.store(0, Ordering::Relaxed);
        self.command_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            now_ms: self.now_ms.load(Ordering::Relaxed),
            beat: BeatTime::from_raw(self.beat_raw.load(Ordering::Relaxed)),
            beat_duration_ms: self.beat_duration_ms.load(Ordering::Relaxed),
            transport_running: self.transport_running.load(Ordering::Relaxed),
            scheduler: SchedulerStats {
                successes: self.wait_successes.load(Ordering::Relaxed),
                failures: self.wait_failures.load(Ordering::Relaxed),
                active_sleep: self.active_sleep.load(Ordering::Relaxed),
                active_sync: self.active_sync.load(Ordering::Relaxed),
                active_max: self.active_max.load(Ordering::Relaxed),
                capacity: self.wait_capacity.load(Ordering::Relaxed),
            },
            exhaustion_resumes: self.exhaustion_resumes.load(Ordering::Relaxed),
            timers: TimerStats {
                fires: self.timer_fires.load(Ordering::Relaxed),
                overruns: self.timer_overruns.load(Ordering::Relaxed),
                forced_resyncs: self.timer_resyncs.load(Ordering::Relaxed),
                skipped_blocks: self.skipped_blocks.load(Ordering::Relaxed),
                active: self.active_timers.load(Ordering::Relaxed),
            },
            commands_applied: self.commands_applied.load(Ordering::Relaxed),
            command_errors: self.command_errors.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DiagnosticsSnapshot {
    /// Millisecond tick last processed.
    pub now_ms: u64,
    /// Beat position at `now_ms`.
    pub beat: BeatTime,
    pub beat_duration_ms: u32,
    /// Whether the selected clock source is running.
    pub transport_running: bool,
    pub scheduler: SchedulerStats,
    /// Waits turned into immediate resumes because the pool was empty.
    pub exhaustion_resumes: u32,
    pub timers: TimerStats,
    pub commands_applied: u64,
    pub command_errors: u32,
}

impl DiagnosticsSnapshot {
    /// Tempo implied by the published beat duration.
    pub fn tempo_bpm(&self) -> f64 {
        if self.beat_duration_ms == 0 {
            return 0.0;
        }
        60_000.0 / self.beat_duration_ms as f64
    }
}

impl std::fmt::Display for DiagnosticsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "clock     : {} ms, beat {}, {:.2} BPM ({})",
            self.now_ms,
            self.beat,
            self.tempo_bpm(),
            if self.transport_running { "running" } else { "stopped" }
        )?;
        writeln!(
            f,
            "waits     : {} ok, {} failed, {} sleep + {} sync active (max {}/{}), \
             {} exhaustion resumes",
            self.scheduler.successes,
            self.scheduler.failures,
            self.scheduler.active_sleep,
            self.scheduler.active_sync,
            self.scheduler.active_max,
            self.scheduler.capacity,
            self.exhaustion_resumes
        )?;
        writeln!(
            f,
            "timers    : {} fires, {} active, {} overruns, {} resyncs, {} skipped blocks",
            self.timers.fires,
            self.timers.active,
            self.timers.overruns,
            self.timers.forced_resyncs,
            self.timers.skipped_blocks
        )?;
        write!(
            f,
            "commands  : {} applied, {} rejected",
            self.commands_applied, self.command_errors
        )
    }
}
