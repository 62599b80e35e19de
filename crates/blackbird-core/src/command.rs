//! Commands from the script context to the real-time context.
//!
//! The script side never touches clock, scheduler or timer state directly.
//! Every change is queued as a [`Command`] and applied by the real-time core
//! at the start of its next tick, so multi-word state is never torn.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::clock::ClockSource;
use crate::error::{Error, Result};
use crate::events::{TaskId, TimerId};
use crate::timers::TimerCallback;

/// Queue capacity used when none is configured.
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

/// A change requested by the script context.
#[derive(Clone, Copy, Debug)]
pub enum Command {
    // === Waits ===
    /// Resume after a wall-clock delay.
    Sleep { task: TaskId, seconds: f64 },

    /// Resume on the next multiple of `beats`.
    Sync { task: TaskId, beats: f64 },

    /// Resume after `beats` beats at the current tempo, off the grid.
    SleepBeats { task: TaskId, beats: f64 },

    /// Drop a task's pending wait.
    Cancel { task: TaskId },

    /// Drop every pending wait and stop all timers (script reload).
    CancelAll,

    // === Clock ===
    SetSource { source: ClockSource },

    /// Re-anchor the beat reference at the tick that applies this command.
    UpdateReference {
        beat: f64,
        beat_duration_secs: f64,
        from: ClockSource,
    },

    SetTempo { bpm: f64 },

    StartClock { beat: f64 },

    StopClock,

    SetTriggerDivision { pulses_per_beat: f64 },

    // === Timers ===
    TimerStart {
        timer: TimerId,
        callback: TimerCallback,
    },

    TimerStop { timer: TimerId },

    TimerSetPeriod { timer: TimerId, seconds: f64 },

    // === Diagnostics ===
    /// Zero the scheduler and timer counters.
    ResetStats,
}

/// Sending half of the command queue.
#[derive(Clone, Debug)]
pub struct CommandSender {
    tx: Sender<Command>,
}

impl CommandSender {
    /// Queue a command without blocking.
    pub fn send(&self, command: Command) -> Result<()> {
        self.tx.try_send(command).map_err(|err| match err {
            TrySendError::Full(command) => {
                log::warn!("Command queue full, rejected {command:?}");
                Error::CommandQueueFull
            }
            TrySendError::Disconnected(_) => Error::Disconnected,
        })
    }

    /// Commands waiting to be applied.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// Create a bounded command queue.
pub fn command_queue(capacity: usize) -> (CommandSender, Receiver<Command>) {
    let (tx, rx) = bounded(capacity.max(1));
    (CommandSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_arrive_in_order() {
        let (tx, rx) = command_queue(4);
        tx.send(Command::SetTempo { bpm: 90.0 }).unwrap();
        tx.send(Command::Cancel { task: TaskId(3) }).unwrap();
        assert_eq!(tx.pending(), 2);

        assert!(matches!(rx.try_recv(), Ok(Command::SetTempo { bpm }) if bpm == 90.0));
        assert!(matches!(
            rx.try_recv(),
            Ok(Command::Cancel { task: TaskId(3) })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_is_reported() {
        let (tx, _rx) = command_queue(1);
        tx.send(Command::StopClock).unwrap();
        assert!(matches!(
            tx.send(Command::StopClock),
            Err(Error::CommandQueueFull)
        ));
    }

    #[test]
    fn test_dropped_receiver_is_reported() {
        let (tx, rx) = command_queue(1);
        drop(rx);
        assert!(matches!(
            tx.send(Command::CancelAll),
            Err(Error::Disconnected)
        ));
    }
}
