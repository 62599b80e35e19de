//! Beat clock: the authoritative "what beat is it now".
//!
//! Two tempo sources can drive the clock:
//!
//! - [`ClockSource::Internal`] - a free-running tempo generator counting whole
//!   beats on integer-millisecond boundaries with a fractional error
//!   accumulator, so the long-run tempo is exact.
//! - [`ClockSource::External`] - tempo derived from trigger edges on a clock
//!   input, smoothed over the last [`TRIGGER_AVERAGE_LEN`] intervals.
//!
//! Only the currently selected source may move the [`BeatReference`]; updates
//! tagged with the other source are ignored so the two never fight. Between
//! updates the beat position is extrapolated with integer arithmetic only.

use crate::timing::{seconds_to_ms, BeatTime, Millis};
use serde::{Deserialize, Serialize};

const Q16_ONE: u64 = 1 << 16;
const Q16_MASK: u64 = Q16_ONE - 1;

/// Number of trigger intervals averaged by the external source.
pub const TRIGGER_AVERAGE_LEN: usize = 4;

/// Tempo used at startup and whenever a non-positive tempo is requested.
pub const DEFAULT_TEMPO_BPM: f64 = 120.0;

/// Gap between trigger edges after which the external clock counts as stopped.
pub const DEFAULT_STOP_GAP_MS: u32 = 4000;

/// Boundaries the internal clock will catch up in one tick before re-anchoring.
const MAX_BEAT_CATCHUP: u32 = 64;

/// Longest internal beat interval, Q16.16 milliseconds.
const MAX_INTERVAL_Q16: u64 = (u32::MAX as u64) << 16;

/// Which tempo source owns the beat reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    /// Internally generated tempo.
    #[default]
    Internal,
    /// Tempo derived from trigger edges on a clock input.
    External,
}

/// Anchor point used to extrapolate the beat position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeatReference {
    /// Beat position at `updated_ms`.
    pub beat: BeatTime,
    /// Millisecond timestamp of the last update.
    pub updated_ms: Millis,
    /// Duration of one beat in milliseconds, never below 1.
    pub beat_duration_ms: u32,
    /// Reciprocal of `beat_duration_ms`: beats per millisecond with 32
    /// fractional bits, rounded up.
    pub beats_per_ms: u64,
    /// Beat position the reference is never extrapolated past, typically the
    /// next beat the owning source will announce.
    pub ceiling: Option<BeatTime>,
}

impl BeatReference {
    fn new(
        beat: BeatTime,
        updated_ms: Millis,
        beat_duration_ms: u32,
        ceiling: Option<BeatTime>,
    ) -> Self {
        let beat_duration_ms = beat_duration_ms.max(1);
        Self {
            beat,
            updated_ms,
            beat_duration_ms,
            beats_per_ms: (1u64 << 32).div_ceil(beat_duration_ms as u64),
            ceiling,
        }
    }

    /// Extrapolate the beat position at `now_ms`.
    #[inline]
    pub fn beat_at(&self, now_ms: Millis) -> BeatTime {
        let elapsed = now_ms.saturating_sub(self.updated_ms);
        let delta = elapsed.saturating_mul(self.beats_per_ms) >> 16;
        let beat = self.beat + BeatTime::from_raw(delta.min(i64::MAX as u64) as i64);
        match self.ceiling {
            Some(ceiling) if beat > ceiling => ceiling.max(self.beat),
            _ => beat,
        }
    }
}

/// Convert a beat duration in seconds to whole milliseconds, clamped to 1 ms.
fn beat_duration_to_ms(seconds: f64) -> u32 {
    match seconds_to_ms(seconds) {
        0 => {
            log::debug!("Beat duration {seconds}s coerced to 1 ms");
            1
        }
        ms => ms.min(u32::MAX as u64) as u32,
    }
}

/// Free-running tempo generator.
#[derive(Clone, Debug)]
struct InternalClock {
    running: bool,
    /// Beat position announced at the last boundary.
    beat: BeatTime,
    /// Milliseconds per beat, Q16.16.
    interval_q16: u64,
    next_boundary_ms: Millis,
    /// Accumulated fractional milliseconds, Q16.16, always below one.
    error_q16: u64,
}

impl InternalClock {
    fn new(bpm: f64) -> Self {
        let mut clock = Self {
            running: false,
            beat: BeatTime::ZERO,
            interval_q16: 0,
            next_boundary_ms: 0,
            error_q16: 0,
        };
        clock.set_interval(bpm);
        clock
    }

    fn set_interval(&mut self, bpm: f64) {
        let interval_ms = 60_000.0 / bpm;
        let interval_q16 = (interval_ms * Q16_ONE as f64).round() as u64;
        self.interval_q16 = interval_q16.clamp(Q16_ONE, MAX_INTERVAL_Q16);
    }

    /// Beat interval rounded to whole milliseconds.
    fn interval_ms(&self) -> u32 {
        ((self.interval_q16 + Q16_ONE / 2) >> 16).min(u32::MAX as u64) as u32
    }

    /// Move the next boundary one beat later, rolling the fractional
    /// remainder into a whole millisecond once it adds up to one.
    fn advance(&mut self) {
        self.next_boundary_ms += self.interval_q16 >> 16;
        self.error_q16 += self.interval_q16 & Q16_MASK;
        if self.error_q16 >= Q16_ONE {
            self.next_boundary_ms += 1;
            self.error_q16 -= Q16_ONE;
        }
    }

    /// Portion of the current beat still ahead of `now_ms`, at most one beat.
    fn remaining_at(&self, now_ms: Millis) -> BeatTime {
        let ahead_ms = self.next_boundary_ms.saturating_sub(now_ms);
        let raw = ((ahead_ms as u128) << 32) / self.interval_q16 as u128;
        BeatTime::from_raw((raw as i64).min(BeatTime::SCALE))
    }
}

/// Tempo follower for trigger edges on the clock input.
#[derive(Clone, Debug)]
struct ExternalClock {
    /// Beats advanced per trigger edge, Q16.16.
    beats_per_pulse_q16: u32,
    stop_gap_ms: u32,
    last_edge_ms: Option<Millis>,
    edges: u64,
    intervals: [u32; TRIGGER_AVERAGE_LEN],
    pos: usize,
    len: usize,
    sum_ms: u64,
}

impl ExternalClock {
    fn new(pulses_per_beat: f64, stop_gap_ms: u32) -> Self {
        let mut clock = Self {
            beats_per_pulse_q16: Q16_ONE as u32,
            stop_gap_ms,
            last_edge_ms: None,
            edges: 0,
            intervals: [0; TRIGGER_AVERAGE_LEN],
            pos: 0,
            len: 0,
            sum_ms: 0,
        };
        clock.set_division(pulses_per_beat);
        clock
    }

    fn set_division(&mut self, pulses_per_beat: f64) {
        let ppb = if pulses_per_beat.is_finite() && pulses_per_beat > 0.0 {
            pulses_per_beat
        } else {
            1.0
        };
        self.beats_per_pulse_q16 = ((Q16_ONE as f64 / ppb).round() as u32).max(1);
    }

    fn beats_per_pulse(&self) -> BeatTime {
        BeatTime::from_raw(self.beats_per_pulse_q16 as i64)
    }

    /// Record an edge. Returns the new beat position and the averaged beat
    /// duration once an interval has been measured.
    fn edge(&mut self, now_ms: Millis) -> Option<(BeatTime, u32)> {
        let last = self.last_edge_ms.replace(now_ms)?;
        let gap = now_ms.saturating_sub(last);
        if gap > self.stop_gap_ms as u64 {
            log::debug!("Clock input silent for {gap} ms, treating as stopped");
            return None;
        }

        let duration = ((gap << 16) / self.beats_per_pulse_q16 as u64).min(u32::MAX as u64) as u32;
        self.sum_ms = self.sum_ms + duration as u64 - self.intervals[self.pos] as u64;
        self.intervals[self.pos] = duration;
        self.pos = (self.pos + 1) % TRIGGER_AVERAGE_LEN;
        self.len = (self.len + 1).min(TRIGGER_AVERAGE_LEN);
        self.edges += 1;

        let beat = BeatTime::from_raw((self.edges * self.beats_per_pulse_q16 as u64) as i64);
        let average = (self.sum_ms / self.len as u64) as u32;
        Some((beat, average))
    }
}

/// The authoritative beat position, fed by one of two tempo sources.
#[derive(Clone, Debug)]
pub struct BeatClock {
    source: ClockSource,
    reference: BeatReference,
    internal: InternalClock,
    external: ExternalClock,
    now_ms: Millis,
    last_tick_ms: Option<Millis>,
    beat_now: BeatTime,
}

impl Default for BeatClock {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPO_BPM)
    }
}

impl BeatClock {
    /// Create a clock on the internal source, running from beat 0 at time 0.
    pub fn new(tempo_bpm: f64) -> Self {
        let tempo_bpm = sanitize_bpm(tempo_bpm);
        let internal = InternalClock::new(tempo_bpm);
        let mut clock = Self {
            source: ClockSource::Internal,
            reference: BeatReference::new(BeatTime::ZERO, 0, internal.interval_ms(), None),
            internal,
            external: ExternalClock::new(1.0, DEFAULT_STOP_GAP_MS),
            now_ms: 0,
            last_tick_ms: None,
            beat_now: BeatTime::ZERO,
        };
        clock.start(0.0);
        clock
    }

    /// Set how many trigger edges make one beat on the external source.
    pub fn with_trigger_division(mut self, pulses_per_beat: f64) -> Self {
        self.external.set_division(pulses_per_beat);
        self
    }

    /// Set the trigger gap after which the external clock counts as stopped.
    pub fn with_stop_gap_ms(mut self, stop_gap_ms: u32) -> Self {
        self.external.stop_gap_ms = stop_gap_ms;
        self
    }

    /// The currently selected source.
    pub fn source(&self) -> ClockSource {
        self.source
    }

    /// Select which source may update the beat reference.
    pub fn set_source(&mut self, source: ClockSource) {
        if self.source != source {
            log::debug!("Clock source {:?} -> {:?}", self.source, source);
            self.source = source;
        }
    }

    /// Re-anchor the beat reference at the current time.
    ///
    /// Ignored unless `from` is the selected source. Durations below one
    /// millisecond (including zero, negative and NaN) are clamped to 1 ms.
    /// Returns whether the reference moved.
    pub fn update_reference(
        &mut self,
        beat: f64,
        beat_duration_secs: f64,
        from: ClockSource,
    ) -> bool {
        let duration_ms = beat_duration_to_ms(beat_duration_secs);
        self.apply_reference(from, BeatTime::from_float(beat), self.now_ms, duration_ms, None)
    }

    fn apply_reference(
        &mut self,
        from: ClockSource,
        beat: BeatTime,
        at_ms: Millis,
        duration_ms: u32,
        ceiling: Option<BeatTime>,
    ) -> bool {
        if from != self.source {
            log::trace!("Ignoring {from:?} reference while {:?} is selected", self.source);
            return false;
        }
        self.reference = BeatReference::new(beat, at_ms, duration_ms, ceiling);
        true
    }

    /// Advance the clock to `now_ms`.
    ///
    /// Runs the internal source's beat boundaries and refreshes the cached
    /// beat position. Calls with a timestamp that is not later than the
    /// previous tick are ignored; returns whether the tick was processed.
    pub fn tick(&mut self, now_ms: Millis) -> bool {
        if matches!(self.last_tick_ms, Some(last) if now_ms <= last) {
            return false;
        }
        self.last_tick_ms = Some(now_ms);
        self.now_ms = now_ms;
        self.run_internal(now_ms);
        self.beat_now = self.reference.beat_at(now_ms);
        true
    }

    // Each boundary is quantized to the millisecond at or before its exact
    // position, so the announced beat leads anything synced to it.
    fn run_internal(&mut self, now_ms: Millis) {
        if !self.internal.running {
            return;
        }
        let mut crossed = 0;
        while self.internal.next_boundary_ms <= now_ms {
            if crossed == MAX_BEAT_CATCHUP {
                log::warn!("Internal clock fell {crossed} beats behind, re-anchoring");
                self.internal.next_boundary_ms = now_ms;
                self.internal.error_q16 = 0;
                self.internal.advance();
                break;
            }
            let boundary_ms = self.internal.next_boundary_ms;
            self.internal.beat += BeatTime::ONE;
            self.internal.advance();
            let beat = self.internal.beat;
            let duration_ms = self.internal.interval_ms();
            self.apply_reference(
                ClockSource::Internal,
                beat,
                boundary_ms,
                duration_ms,
                Some(beat + BeatTime::ONE),
            );
            crossed += 1;
        }
    }

    /// Beat position at `now_ms`, extrapolated from the current reference.
    #[inline]
    pub fn beat_at(&self, now_ms: Millis) -> BeatTime {
        self.reference.beat_at(now_ms)
    }

    /// Beat position as of the last tick.
    pub fn current_beat(&self) -> BeatTime {
        self.beat_now
    }

    /// Timestamp of the last tick.
    pub fn now_ms(&self) -> Millis {
        self.now_ms
    }

    /// The current beat reference.
    pub fn reference(&self) -> &BeatReference {
        &self.reference
    }

    /// Duration of one beat in milliseconds.
    pub fn beat_duration_ms(&self) -> u32 {
        self.reference.beat_duration_ms
    }

    /// Tempo implied by the current reference.
    pub fn tempo_bpm(&self) -> f64 {
        60_000.0 / self.reference.beat_duration_ms as f64
    }

    /// Seconds since the sample counter started.
    pub fn time_seconds(&self, now_ms: Millis) -> f64 {
        now_ms as f64 * 0.001
    }

    /// Whether the internal source is running.
    pub fn is_running(&self) -> bool {
        self.internal.running
    }

    /// Whether the selected source is moving the beat at `now_ms`.
    ///
    /// The external source runs while trigger edges arrive within the stop
    /// gap of each other.
    pub fn transport_running(&self, now_ms: Millis) -> bool {
        match self.source {
            ClockSource::Internal => self.internal.running,
            ClockSource::External => self.external.last_edge_ms.is_some_and(|last| {
                now_ms.saturating_sub(last) <= self.external.stop_gap_ms as u64
            }),
        }
    }

    /// Change the internal tempo, preserving the current beat position.
    ///
    /// Non-positive tempos fall back to [`DEFAULT_TEMPO_BPM`].
    pub fn set_tempo(&mut self, bpm: f64) {
        let bpm = sanitize_bpm(bpm);
        let now = self.now_ms;
        let before = self.reference.beat_at(now);
        let remaining = if self.internal.running {
            self.internal.remaining_at(now)
        } else {
            BeatTime::ONE
        };
        self.internal.set_interval(bpm);
        log::debug!("Internal tempo set to {bpm:.2} BPM");

        if !self.internal.running {
            return;
        }
        let remaining_q16 =
            ((remaining.raw() as u128 * self.internal.interval_q16 as u128) >> 16) as u64;
        self.internal.next_boundary_ms = now + (remaining_q16 >> 16);
        self.internal.error_q16 = remaining_q16 & Q16_MASK;

        let next_beat = self.internal.beat + BeatTime::ONE;
        let duration_ms = self.internal.interval_ms();
        // Rounding in the projection must not pull the beat back.
        let beat = if self.source == ClockSource::Internal {
            (next_beat - remaining).max(before)
        } else {
            next_beat - remaining
        };
        self.apply_reference(ClockSource::Internal, beat, now, duration_ms, Some(next_beat));
    }

    /// Start the internal source at `beat`, anchored at the last tick.
    pub fn start(&mut self, beat: f64) {
        let beat = BeatTime::from_float(beat);
        let now = self.now_ms;
        self.internal.running = true;
        self.internal.beat = beat;
        self.internal.next_boundary_ms = now;
        self.internal.error_q16 = 0;
        self.internal.advance();
        let duration_ms = self.internal.interval_ms();
        self.apply_reference(
            ClockSource::Internal,
            beat,
            now,
            duration_ms,
            Some(beat + BeatTime::ONE),
        );
    }

    /// Stop the internal source, freezing the beat position if it is selected.
    pub fn stop(&mut self) {
        if !self.internal.running {
            return;
        }
        let now = self.now_ms;
        let current = self.reference.beat_at(now);
        self.internal.running = false;
        let duration_ms = self.internal.interval_ms();
        self.apply_reference(ClockSource::Internal, current, now, duration_ms, Some(current));
    }

    /// Set how many trigger edges make one beat on the external source.
    ///
    /// Non-positive values fall back to one edge per beat.
    pub fn set_trigger_division(&mut self, pulses_per_beat: f64) {
        self.external.set_division(pulses_per_beat);
    }

    /// Record a trigger edge on the clock input at `now_ms`.
    ///
    /// Returns whether the edge moved the beat reference (it can only do so
    /// while the external source is selected).
    pub fn trigger_edge(&mut self, now_ms: Millis) -> bool {
        let Some((beat, duration_ms)) = self.external.edge(now_ms) else {
            return false;
        };
        let ceiling = beat + self.external.beats_per_pulse();
        self.apply_reference(ClockSource::External, beat, now_ms, duration_ms, Some(ceiling))
    }
}

fn sanitize_bpm(bpm: f64) -> f64 {
    if bpm.is_finite() && bpm > 0.0 {
        bpm
    } else {
        DEFAULT_TEMPO_BPM
    }
}
