//! Event records carried from the real-time context to the script context.
//!
//! Each kind travels on its own ring:
//!
//! - [`TimerFired`] - a periodic timer elapsed
//! - [`ResumeEvent`] - a suspended task's wait is due
//! - [`InputDetected`] - an input detector fired
//! - [`EnvelopeDone`] - an output envelope finished its last segment
//!
//! Records are small `Copy` values; a ring slot holds a plain copy. Clock
//! start and stop reach the script as a [`TransportChanged`] instead.

use crate::ring::RingItem;
use crate::timing::{BeatTime, Millis};

/// Identifier of a script task (coroutine) waiting on the clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u32);

impl TaskId {
    /// Get the inner value.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for TaskId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Index of a periodic timer slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub usize);

impl From<usize> for TimerId {
    fn from(id: usize) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Which queue a wait was registered on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitKind {
    /// Wall-clock deadline in milliseconds.
    Sleep,
    /// Beat-grid position.
    Sync,
}

/// A periodic timer elapsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerFired {
    pub timer: TimerId,
    /// Firing count since the timer was started.
    pub stage: u32,
    /// Sample the firing was due at.
    pub sample: u64,
    /// Whole-sample period in effect for this firing.
    pub period_samples: u32,
}

impl RingItem for TimerFired {
    fn coalesce_key(&self) -> Option<u32> {
        Some(self.timer.0 as u32)
    }
}

/// A task's wait is due and it should be resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeEvent {
    pub task: TaskId,
    pub kind: WaitKind,
    /// Millisecond tick the wait was found due.
    pub timestamp_ms: Millis,
}

impl RingItem for ResumeEvent {
    fn coalesce_key(&self) -> Option<u32> {
        Some(self.task.0)
    }
}

/// Detector that produced an input event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Detection {
    /// Crossed the change threshold.
    Change { rising: bool },
    /// Periodic stream sample.
    Stream,
    /// Moved into a new voltage window.
    Window { window: i32, rising: bool },
    /// Quantized to a new scale degree.
    Scale {
        index: i32,
        octave: i32,
        note: f32,
        volts: f32,
    },
    /// Envelope-followed level report.
    Volume,
    /// Peak detected.
    Peak,
    /// Frequency estimate report.
    Frequency,
}

/// An input detector fired.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InputDetected {
    /// Zero-based input channel.
    pub channel: u8,
    /// Voltage or state reported by the detector.
    pub value: f32,
    pub detection: Detection,
    pub timestamp_ms: Millis,
}

impl RingItem for InputDetected {
    fn coalesce_key(&self) -> Option<u32> {
        Some(self.channel as u32)
    }
}

/// An output envelope finished its last segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvelopeDone {
    /// Zero-based output channel.
    pub channel: u8,
    pub timestamp_ms: Millis,
}

impl RingItem for EnvelopeDone {
    fn coalesce_key(&self) -> Option<u32> {
        Some(self.channel as u32)
    }
}

/// The selected clock source started or stopped.
///
/// Not carried on a ring: the script side sees the latest transport state
/// when it next dispatches, so several changes in between fold into one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportChanged {
    pub running: bool,
    /// Beat position when the change was seen.
    pub beat: BeatTime,
    pub timestamp_ms: Millis,
}
