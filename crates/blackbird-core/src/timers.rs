//! Periodic timer engine driven by the sample counter.
//!
//! Each slot fires at a period measured in samples. Periods are held as a
//! whole number of samples plus a Q16 fractional remainder; the remainder
//! accumulates per firing and rolls one extra sample into the next trigger
//! once it adds up to a whole sample, so the long-run rate is exact.
//!
//! Work is done in fixed blocks of `block_size` samples. A call that finds
//! itself more than `max_catchup_blocks` behind skips ahead instead of
//! stalling, and a timer that owes more than `max_catchup_fires` firings is
//! re-anchored at the current block.

use std::time::Instant;

use crate::error::{Error, Result};
use crate::events::{TimerFired, TimerId};
use crate::ring::EventSink;

const Q16_ONE: u64 = 1 << 16;
const Q16_MASK: u64 = Q16_ONE - 1;

/// Period a slot starts with.
pub const DEFAULT_PERIOD_SECONDS: f64 = 1.0;

/// Invoked on the real-time context for every firing.
pub type TimerCallback = fn(TimerFired, &mut dyn EventSink<TimerFired>);

/// The default callback: hand the firing to the script side.
pub fn post_timer_event(event: TimerFired, sink: &mut dyn EventSink<TimerFired>) {
    sink.post(event);
}

/// Block and catch-up limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerLimits {
    pub block_size: u32,
    pub max_catchup_blocks: u32,
    pub max_catchup_fires: u32,
}

impl Default for TimerLimits {
    fn default() -> Self {
        Self {
            block_size: 8,
            max_catchup_blocks: 8,
            max_catchup_fires: 16,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct TimerSlot {
    callback: TimerCallback,
    active: bool,
    period_seconds: f64,
    /// Period in samples, Q16.16.
    period_q16: u64,
    next_trigger: u64,
    /// Accumulated fractional samples, Q16, always below one.
    error_q16: u64,
    stage: u32,
}

impl TimerSlot {
    fn whole(&self) -> u64 {
        self.period_q16 >> 16
    }

    fn frac(&self) -> u64 {
        self.period_q16 & Q16_MASK
    }

    /// Anchor the timeline at `now`; the first firing is one period later.
    fn anchor(&mut self, now: u64) {
        self.next_trigger = now + self.whole();
        self.error_q16 = self.frac();
    }

    fn advance(&mut self) {
        self.next_trigger += self.whole();
        self.error_q16 += self.frac();
        if self.error_q16 >= Q16_ONE {
            self.next_trigger += 1;
            self.error_q16 -= Q16_ONE;
        }
    }
}

/// Counters exposed to the diagnostics surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimerStats {
    pub fires: u64,
    /// Callbacks whose wall time exceeded their period.
    pub overruns: u32,
    /// Timers re-anchored after owing too many firings.
    pub forced_resyncs: u32,
    /// Blocks skipped because a call fell too far behind.
    pub skipped_blocks: u64,
    pub active: u32,
}

/// Fixed set of periodic timers.
pub struct TimerEngine {
    sample_rate: u32,
    limits: TimerLimits,
    slots: Box<[TimerSlot]>,
    /// Last sample count handed to `process`.
    sample_count: u64,
    /// End of the last processed block.
    processed_until: u64,
    stats: TimerStats,
}

impl TimerEngine {
    pub fn new(timer_count: usize, sample_rate: u32, limits: TimerLimits) -> Self {
        let sample_rate = sample_rate.max(1);
        let period_q16 = period_to_q16(DEFAULT_PERIOD_SECONDS, sample_rate);
        let slot = TimerSlot {
            callback: post_timer_event,
            active: false,
            period_seconds: DEFAULT_PERIOD_SECONDS,
            period_q16,
            next_trigger: 0,
            error_q16: 0,
            stage: 0,
        };
        Self {
            sample_rate,
            limits: TimerLimits {
                block_size: limits.block_size.max(1),
                max_catchup_blocks: limits.max_catchup_blocks.max(1),
                max_catchup_fires: limits.max_catchup_fires.max(1),
            },
            slots: vec![slot; timer_count].into_boxed_slice(),
            sample_count: 0,
            processed_until: 0,
            stats: TimerStats::default(),
        }
    }

    /// Number of timer slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot_mut(&mut self, id: TimerId) -> Result<&mut TimerSlot> {
        let count = self.slots.len();
        self.slots.get_mut(id.0).ok_or_else(|| {
            log::warn!("Timer id {} out of range (0..{count})", id.0);
            Error::UnknownTimer(id.0)
        })
    }

    /// Arm a timer; it first fires one period after the current sample count.
    pub fn start(&mut self, id: TimerId, callback: TimerCallback) -> Result<()> {
        let now = self.sample_count;
        let slot = self.slot_mut(id)?;
        slot.callback = callback;
        slot.active = true;
        slot.stage = 0;
        slot.anchor(now);
        log::debug!("Started {id} with a {:.4}s period", slot.period_seconds);
        Ok(())
    }

    pub fn stop(&mut self, id: TimerId) -> Result<()> {
        self.slot_mut(id)?.active = false;
        Ok(())
    }

    /// Stop every timer.
    pub fn stop_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.active = false;
        }
    }

    /// Set a timer's period. A running timer keeps its next trigger and uses
    /// the new period from then on.
    pub fn set_period(&mut self, id: TimerId, seconds: f64) -> Result<()> {
        if seconds.is_nan() || seconds <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "timer period must be positive, got {seconds}"
            )));
        }
        let period_q16 = period_to_q16(seconds, self.sample_rate);
        let slot = self.slot_mut(id)?;
        slot.period_seconds = seconds;
        slot.period_q16 = period_q16;
        Ok(())
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.slots.get(id.0).is_some_and(|slot| slot.active)
    }

    /// Period in samples, Q16.16.
    pub fn period_q16(&self, id: TimerId) -> Option<u64> {
        self.slots.get(id.0).map(|slot| slot.period_q16)
    }

    /// Run every whole block up to `sample_count`.
    pub fn process(&mut self, sample_count: u64, sink: &mut dyn EventSink<TimerFired>) {
        self.sample_count = sample_count;
        let block = self.limits.block_size as u64;
        let mut blocks = 0;
        while self.processed_until + block <= sample_count {
            if blocks == self.limits.max_catchup_blocks {
                let behind = (sample_count - self.processed_until) / block;
                self.processed_until += behind * block;
                self.stats.skipped_blocks += behind;
                log::warn!("Timer processing fell {behind} blocks behind, skipping ahead");
                self.process_block(self.processed_until, sink);
                break;
            }
            self.processed_until += block;
            self.process_block(self.processed_until, sink);
            blocks += 1;
        }
    }

    /// Fire every active timer whose trigger is at or before `now`.
    pub fn process_block(&mut self, now: u64, sink: &mut dyn EventSink<TimerFired>) {
        let max_fires = self.limits.max_catchup_fires;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.active {
                continue;
            }
            let mut fires = 0;
            while slot.next_trigger <= now {
                if fires == max_fires {
                    log::warn!("timer#{index} owes more than {max_fires} firings, resyncing");
                    slot.anchor(now);
                    self.stats.forced_resyncs += 1;
                    break;
                }
                slot.stage = slot.stage.wrapping_add(1);
                let event = TimerFired {
                    timer: TimerId(index),
                    stage: slot.stage,
                    sample: slot.next_trigger,
                    period_samples: slot.whole().min(u32::MAX as u64) as u32,
                };

                let started = Instant::now();
                (slot.callback)(event, sink);
                if started.elapsed().as_secs_f64() > slot.period_seconds {
                    self.stats.overruns += 1;
                }

                slot.advance();
                self.stats.fires += 1;
                fires += 1;
            }
        }
    }

    pub fn stats(&self) -> TimerStats {
        TimerStats {
            active: self.slots.iter().filter(|slot| slot.active).count() as u32,
            ..self.stats
        }
    }

    pub fn reset_stats(&mut self) {
        self.stats = TimerStats::default();
    }
}

/// Seconds to samples in Q16.16, never shorter than one sample.
fn period_to_q16(seconds: f64, sample_rate: u32) -> u64 {
    let q16 = (seconds * sample_rate as f64 * Q16_ONE as f64).round();
    if q16 >= u64::MAX as f64 {
        u64::MAX
    } else {
        (q16 as u64).max(Q16_ONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48_000;

    fn engine(timers: usize, max_catchup_blocks: u32) -> TimerEngine {
        TimerEngine::new(
            timers,
            RATE,
            TimerLimits {
                max_catchup_blocks,
                ..TimerLimits::default()
            },
        )
    }

    /// Firings due within `elapsed` samples of the start, from the Q16 period.
    fn expected_fires(period_q16: u64, elapsed: u64) -> u64 {
        ((elapsed + 1) * Q16_ONE - 1) / period_q16
    }

    #[test]
    fn test_average_period_is_exact() {
        let mut timers = engine(1, 1000);
        timers.set_period(TimerId(0), 0.1).unwrap();
        timers.start(TimerId(0), post_timer_event).unwrap();

        let mut fired = Vec::new();
        let mut now = 0;
        while fired.len() < 10_000 {
            now += 4800;
            timers.process(now, &mut fired);
        }
        assert_eq!(fired.len(), 10_000);
        let span = fired[9_999].sample - fired[0].sample;
        assert_eq!(span, 9_999 * 4800);
        for pair in fired.windows(2) {
            assert_eq!(pair[1].sample - pair[0].sample, 4800);
        }
    }

    #[test]
    fn test_fractional_period_jitter_is_one_sample() {
        let mut timers = engine(1, 1000);
        // 590.4 samples
        timers.set_period(TimerId(0), 0.0123).unwrap();
        timers.start(TimerId(0), post_timer_event).unwrap();
        let period_q16 = timers.period_q16(TimerId(0)).unwrap();
        assert_eq!(period_q16 >> 16, 590);

        let mut fired = Vec::new();
        for now in (4800..=600_000).step_by(4800) {
            timers.process(now, &mut fired);
        }
        for pair in fired.windows(2) {
            let gap = pair[1].sample - pair[0].sample;
            assert!(gap == 590 || gap == 591, "gap {gap}");
        }
        assert_eq!(fired.len() as u64, expected_fires(period_q16, 600_000));
        let k = fired.len() as u64;
        assert_eq!(fired[k as usize - 1].sample, k * period_q16 >> 16);
    }

    #[test]
    fn test_two_timers_over_sixty_thousand_samples() {
        let mut timers = engine(2, 8);
        timers.set_period(TimerId(0), 1.5).unwrap();
        timers.set_period(TimerId(1), 1.0).unwrap();
        timers.start(TimerId(0), post_timer_event).unwrap();
        timers.start(TimerId(1), post_timer_event).unwrap();

        let mut fired = Vec::new();
        for now in (48..=60_000).step_by(48) {
            timers.process(now, &mut fired);
        }

        for id in [TimerId(0), TimerId(1)] {
            let q16 = timers.period_q16(id).unwrap();
            let count = fired.iter().filter(|e| e.timer == id).count() as u64;
            assert_eq!(count, expected_fires(q16, 60_000), "{id}");
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].timer, TimerId(1));
        assert_eq!(fired[0].sample, 48_000);
        assert_eq!(fired[0].stage, 1);
    }

    #[test]
    fn test_stage_counts_and_resets_on_start() {
        let mut timers = engine(1, 8);
        timers.set_period(TimerId(0), 0.001).unwrap();
        timers.start(TimerId(0), post_timer_event).unwrap();
        let mut fired = Vec::new();
        for now in (48..=144).step_by(48) {
            timers.process(now, &mut fired);
        }
        let stages: Vec<u32> = fired.iter().map(|e| e.stage).collect();
        assert_eq!(stages, vec![1, 2, 3]);

        timers.start(TimerId(0), post_timer_event).unwrap();
        fired.clear();
        timers.process(192, &mut fired);
        assert_eq!(fired[0].stage, 1);
    }

    #[test]
    fn test_stopped_timer_does_not_fire() {
        let mut timers = engine(2, 8);
        timers.set_period(TimerId(1), 0.001).unwrap();
        timers.start(TimerId(1), post_timer_event).unwrap();
        timers.stop(TimerId(1)).unwrap();
        let mut fired = Vec::new();
        timers.process(480, &mut fired);
        assert!(fired.is_empty());
        assert!(!timers.is_active(TimerId(1)));
    }

    #[test]
    fn test_invalid_ids_and_periods() {
        let mut timers = engine(2, 8);
        assert!(matches!(
            timers.start(TimerId(2), post_timer_event),
            Err(Error::UnknownTimer(2))
        ));
        assert!(matches!(timers.stop(TimerId(9)), Err(Error::UnknownTimer(9))));
        assert!(matches!(
            timers.set_period(TimerId(0), 0.0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(timers.set_period(TimerId(0), f64::NAN).is_err());
        // Shorter than a sample is clamped to one sample.
        timers.set_period(TimerId(0), 1e-9).unwrap();
        assert_eq!(timers.period_q16(TimerId(0)), Some(Q16_ONE));
    }

    #[test]
    fn test_overload_skips_blocks_and_resyncs() {
        let mut timers = engine(1, 8);
        timers.set_period(TimerId(0), 0.001).unwrap();
        timers.start(TimerId(0), post_timer_event).unwrap();

        let mut fired = Vec::new();
        // 48_000 samples late in one call.
        timers.process(48_000, &mut fired);
        let stats = timers.stats();
        assert!(stats.skipped_blocks > 0);
        assert_eq!(stats.forced_resyncs, 1);
        // The first block's firing plus one bounded burst, then the timeline
        // restarts at the current block.
        assert_eq!(fired.len(), 1 + 16);
        fired.clear();
        timers.process(48_048, &mut fired);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].sample, 48_048);
    }

    #[test]
    fn test_custom_callback_and_overrun() {
        fn doubled(event: TimerFired, sink: &mut dyn EventSink<TimerFired>) {
            sink.post(event);
            sink.post(event);
        }
        fn slow(event: TimerFired, sink: &mut dyn EventSink<TimerFired>) {
            std::thread::sleep(std::time::Duration::from_millis(3));
            sink.post(event);
        }

        let mut timers = engine(2, 8);
        timers.set_period(TimerId(0), 0.001).unwrap();
        timers.set_period(TimerId(1), 0.001).unwrap();
        timers.start(TimerId(0), doubled).unwrap();
        timers.start(TimerId(1), slow).unwrap();

        let mut fired = Vec::new();
        timers.process(48, &mut fired);
        assert_eq!(fired.iter().filter(|e| e.timer == TimerId(0)).count(), 2);
        assert_eq!(fired.iter().filter(|e| e.timer == TimerId(1)).count(), 1);
        let stats = timers.stats();
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.fires, 2);
        assert_eq!(stats.active, 2);
    }
}
