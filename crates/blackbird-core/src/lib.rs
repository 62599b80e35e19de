//! Blackbird Core - real-time scheduling for a live-coded CV instrument.
//!
//! This crate turns a sample counter into beat-accurate wake-ups for
//! suspended script tasks and carries them, together with timer firings and
//! hardware notifications, from the real-time context to the script context:
//!
//! - **Clock** - beat position from an internal tempo or external triggers
//! - **Wait list** - sleep and beat-sync waits in a fixed node arena
//! - **Event bus** - four lock-free single-producer/single-consumer rings
//! - **Timers** - periodic callbacks with drift-free fractional periods
//! - **Engine** - the real-time core and the script-side handle
//!
//! # Architecture
//!
//! The real-time context owns all scheduling state inside a
//! [`RealtimeCore`] and is driven once per processing tick. The script
//! context holds a [`ScriptHandle`]: changes go through the [`Command`]
//! queue, applied at the start of the next tick, and results come back as
//! events drained into a [`ScriptHost`]. Nothing on the real-time path
//! blocks or allocates.
//!
//! ```no_run
//! use blackbird_core::{CoreConfig, Engine, ResumeEvent, ScriptHost, TaskId};
//!
//! struct Host;
//! impl ScriptHost for Host {
//!     fn on_resume(&mut self, event: ResumeEvent) {
//!         println!("resume {}", event.task);
//!     }
//! }
//!
//! let (mut core, mut script) = Engine::new(CoreConfig::default())?.split();
//! script.sync(TaskId(1), 0.5)?;
//! for ms in 0..=250 {
//!     core.process(ms * 48);
//! }
//! script.dispatch(&mut Host, None);
//! # Ok::<(), blackbird_core::Error>(())
//! ```

pub mod bus;
pub mod clock;
pub mod command;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod events;
pub mod ring;
pub mod timers;
pub mod timing;
pub mod waitlist;

pub use bus::{
    event_bus, BusConsumer, BusPolicies, BusProducer, BusStats, DispatchReport, ScriptHost,
};
pub use clock::{BeatClock, BeatReference, ClockSource};
pub use command::{Command, CommandSender};
pub use config::{CoreConfig, ExhaustionPolicy};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use engine::{Engine, RealtimeCore, ScriptHandle};
pub use error::{Error, Result};
pub use events::{
    Detection, EnvelopeDone, InputDetected, ResumeEvent, TaskId, TimerFired, TimerId,
    TransportChanged, WaitKind,
};
pub use ring::{EventSink, OverflowPolicy, PostOutcome, RingItem, RingMonitor, RingStats};
pub use timers::{post_timer_event, TimerCallback, TimerEngine, TimerLimits, TimerStats};
pub use timing::{BeatTime, Millis, SampleClock};
pub use waitlist::{SchedulerStats, WaitListScheduler};
