//! Cross-core event bus: four rings from the real-time context to the
//! script context.
//!
//! [`event_bus`] returns the two halves. The [`BusProducer`] belongs to the
//! real-time core; the [`BusConsumer`] drains every ring into a
//! [`ScriptHost`] at the script side's own pace.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::events::{EnvelopeDone, InputDetected, ResumeEvent, TimerFired, TransportChanged};
use crate::ring::{self, Consumer, OverflowPolicy, PostOutcome, Producer, RingMonitor, RingStats};

/// Slots per ring.
pub const RING_CAPACITY: usize = 128;

/// Overflow policy for each ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusPolicies {
    pub timer: OverflowPolicy,
    pub resume: OverflowPolicy,
    pub input: OverflowPolicy,
    pub envelope: OverflowPolicy,
}

impl Default for BusPolicies {
    fn default() -> Self {
        Self {
            timer: OverflowPolicy::Coalesce,
            resume: OverflowPolicy::Coalesce,
            input: OverflowPolicy::Coalesce,
            envelope: OverflowPolicy::Drop,
        }
    }
}

/// Create the four rings and split them into producer and consumer halves.
pub fn event_bus(policies: BusPolicies) -> (BusProducer, BusConsumer) {
    let (timers, timer_rx) = ring::channel::<TimerFired, RING_CAPACITY>("timer", policies.timer);
    let (resumes, resume_rx) =
        ring::channel::<ResumeEvent, RING_CAPACITY>("resume", policies.resume);
    let (inputs, input_rx) =
        ring::channel::<InputDetected, RING_CAPACITY>("input", policies.input);
    let (envelopes, envelope_rx) =
        ring::channel::<EnvelopeDone, RING_CAPACITY>("envelope", policies.envelope);
    (
        BusProducer {
            timers,
            resumes,
            inputs,
            envelopes,
        },
        BusConsumer {
            timers: timer_rx,
            resumes: resume_rx,
            inputs: input_rx,
            envelopes: envelope_rx,
            timing: HandlerTiming::default(),
        },
    )
}

/// Real-time half of the bus.
pub struct BusProducer {
    pub timers: Producer<TimerFired, RING_CAPACITY>,
    pub resumes: Producer<ResumeEvent, RING_CAPACITY>,
    pub inputs: Producer<InputDetected, RING_CAPACITY>,
    pub envelopes: Producer<EnvelopeDone, RING_CAPACITY>,
}

impl BusProducer {
    pub fn post_timer(&mut self, event: TimerFired) -> PostOutcome {
        self.timers.post(event)
    }

    pub fn post_resume(&mut self, event: ResumeEvent) -> PostOutcome {
        self.resumes.post(event)
    }

    pub fn post_input(&mut self, event: InputDetected) -> PostOutcome {
        self.inputs.post(event)
    }

    pub fn post_envelope(&mut self, event: EnvelopeDone) -> PostOutcome {
        self.envelopes.post(event)
    }

    /// Mark everything posted so far as stale on every ring.
    pub fn discard_pending(&mut self) {
        self.timers.discard_pending();
        self.resumes.discard_pending();
        self.inputs.discard_pending();
        self.envelopes.discard_pending();
    }

    /// Counter snapshot for all rings.
    pub fn stats(&self) -> BusStats {
        BusStats {
            timer: self.timers.stats(),
            resume: self.resumes.stats(),
            input: self.inputs.stats(),
            envelope: self.envelopes.stats(),
        }
    }
}

/// Handlers invoked by [`BusConsumer::dispatch`].
///
/// Every handler defaults to doing nothing, so a host only implements the
/// kinds it cares about.
pub trait ScriptHost {
    fn on_timer(&mut self, _event: TimerFired) {}
    fn on_resume(&mut self, _event: ResumeEvent) {}
    fn on_input(&mut self, _event: InputDetected) {}
    fn on_envelope_done(&mut self, _event: EnvelopeDone) {}
    /// Called before any ring is drained when the clock started or stopped.
    fn on_transport(&mut self, _event: TransportChanged) {}
}

/// Wall time spent in timer and resume handlers, in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandlerTiming {
    pub timer_last_us: u64,
    pub timer_worst_us: u64,
    pub resume_last_us: u64,
    pub resume_worst_us: u64,
}

/// Events handled by one [`BusConsumer::dispatch`] call, per ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub timers: usize,
    pub resumes: usize,
    pub inputs: usize,
    pub envelopes: usize,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.timers + self.resumes + self.inputs + self.envelopes
    }
}

/// Counter snapshot for all four rings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
    pub timer: RingStats,
    pub resume: RingStats,
    pub input: RingStats,
    pub envelope: RingStats,
}

impl BusStats {
    /// No ring has dropped an event since the last reset.
    pub fn is_healthy(&self) -> bool {
        self.rings().iter().all(|(_, stats)| stats.dropped == 0)
    }

    /// Rings with their names, in dispatch order.
    pub fn rings(&self) -> [(&'static str, RingStats); 4] {
        [
            ("timer", self.timer),
            ("resume", self.resume),
            ("input", self.input),
            ("envelope", self.envelope),
        ]
    }
}

/// Script half of the bus.
pub struct BusConsumer {
    pub timers: Consumer<TimerFired, RING_CAPACITY>,
    pub resumes: Consumer<ResumeEvent, RING_CAPACITY>,
    pub inputs: Consumer<InputDetected, RING_CAPACITY>,
    pub envelopes: Consumer<EnvelopeDone, RING_CAPACITY>,
    timing: HandlerTiming,
}

impl BusConsumer {
    /// Drain the rings into `host`.
    ///
    /// Rings are visited in the order timer, resume, input, envelope. With a
    /// `budget`, at most that many events are taken from each ring so one
    /// busy ring cannot starve the others.
    pub fn dispatch<H: ScriptHost + ?Sized>(
        &mut self,
        host: &mut H,
        budget: Option<usize>,
    ) -> DispatchReport {
        let limit = budget.unwrap_or(usize::MAX);
        let mut report = DispatchReport::default();

        while report.timers < limit {
            let Some(event) = self.timers.get() else { break };
            let started = Instant::now();
            host.on_timer(event);
            let elapsed = started.elapsed().as_micros() as u64;
            self.timing.timer_last_us = elapsed;
            self.timing.timer_worst_us = self.timing.timer_worst_us.max(elapsed);
            report.timers += 1;
        }

        while report.resumes < limit {
            let Some(event) = self.resumes.get() else { break };
            let started = Instant::now();
            host.on_resume(event);
            let elapsed = started.elapsed().as_micros() as u64;
            self.timing.resume_last_us = elapsed;
            self.timing.resume_worst_us = self.timing.resume_worst_us.max(elapsed);
            report.resumes += 1;
        }

        while report.inputs < limit {
            let Some(event) = self.inputs.get() else { break };
            host.on_input(event);
            report.inputs += 1;
        }

        while report.envelopes < limit {
            let Some(event) = self.envelopes.get() else { break };
            host.on_envelope_done(event);
            report.envelopes += 1;
        }

        if report.total() > 0 {
            log::trace!("Dispatched {report:?}");
        }
        report
    }

    /// Events waiting across all rings.
    pub fn pending(&self) -> usize {
        (self.timers.depth() + self.resumes.depth() + self.inputs.depth() + self.envelopes.depth())
            as usize
    }

    /// Discard everything pending on every ring. Returns how many events
    /// were discarded.
    pub fn clear(&mut self) -> usize {
        let cleared = self.timers.clear()
            + self.resumes.clear()
            + self.inputs.clear()
            + self.envelopes.clear();
        cleared as usize
    }

    /// Read nothing until the producer next discards its pending events.
    pub fn await_discard(&mut self) {
        self.timers.await_discard();
        self.resumes.await_discard();
        self.inputs.await_discard();
        self.envelopes.await_discard();
    }

    pub fn cancel_await(&mut self) {
        self.timers.cancel_await();
        self.resumes.cancel_await();
        self.inputs.cancel_await();
        self.envelopes.cancel_await();
    }

    /// Counter snapshot for all rings.
    pub fn stats(&self) -> BusStats {
        BusStats {
            timer: self.timers.stats(),
            resume: self.resumes.stats(),
            input: self.inputs.stats(),
            envelope: self.envelopes.stats(),
        }
    }

    /// Zero every ring's counters and the handler timings.
    pub fn reset_stats(&mut self) {
        self.timers.reset_stats();
        self.resumes.reset_stats();
        self.inputs.reset_stats();
        self.envelopes.reset_stats();
        self.timing = HandlerTiming::default();
    }

    /// Handler timings since the last reset.
    pub fn handler_timing(&self) -> HandlerTiming {
        self.timing
    }

    /// Cloneable views of the four rings, for a diagnostics thread.
    pub fn monitors(&self) -> [RingMonitor; 4] {
        [
            self.timers.monitor(),
            self.resumes.monitor(),
            self.inputs.monitor(),
            self.envelopes.monitor(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Detection, TaskId, TimerId, WaitKind};

    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
    }

    impl ScriptHost for Recorder {
        fn on_timer(&mut self, event: TimerFired) {
            self.log.push(format!("timer {} stage {}", event.timer.0, event.stage));
        }

        fn on_resume(&mut self, event: ResumeEvent) {
            self.log.push(format!("resume {}", event.task.0));
        }

        fn on_input(&mut self, event: InputDetected) {
            self.log.push(format!("input {}", event.channel));
        }

        fn on_envelope_done(&mut self, event: EnvelopeDone) {
            self.log.push(format!("envelope {}", event.channel));
        }
    }

    fn resume(task: u32) -> ResumeEvent {
        ResumeEvent {
            task: TaskId(task),
            kind: WaitKind::Sleep,
            timestamp_ms: 0,
        }
    }

    fn timer(id: usize, stage: u32) -> TimerFired {
        TimerFired {
            timer: TimerId(id),
            stage,
            sample: 0,
            period_samples: 4800,
        }
    }

    #[test]
    fn test_dispatch_visits_rings_in_order() {
        let (mut tx, mut rx) = event_bus(BusPolicies::default());
        tx.post_envelope(EnvelopeDone {
            channel: 2,
            timestamp_ms: 0,
        });
        tx.post_resume(resume(5));
        tx.post_input(InputDetected {
            channel: 1,
            value: 2.5,
            detection: Detection::Change { rising: true },
            timestamp_ms: 0,
        });
        tx.post_timer(timer(0, 1));

        let mut host = Recorder::default();
        let report = rx.dispatch(&mut host, None);
        assert_eq!(report.total(), 4);
        assert_eq!(
            host.log,
            vec!["timer 0 stage 1", "resume 5", "input 1", "envelope 2"]
        );
        assert_eq!(rx.pending(), 0);
    }

    #[test]
    fn test_dispatch_budget_is_per_ring() {
        let (mut tx, mut rx) = event_bus(BusPolicies::default());
        for task in 0..10 {
            tx.post_resume(resume(task));
        }
        tx.post_timer(timer(3, 1));

        let mut host = Recorder::default();
        let report = rx.dispatch(&mut host, Some(4));
        assert_eq!(report.resumes, 4);
        assert_eq!(report.timers, 1);
        assert_eq!(rx.pending(), 6);

        rx.dispatch(&mut host, None);
        let resumed: Vec<&String> = host.log.iter().filter(|l| l.starts_with("resume")).collect();
        assert_eq!(resumed.len(), 10);
        assert_eq!(resumed[9], "resume 9");
    }

    #[test]
    fn test_default_host_ignores_events() {
        struct Silent;
        impl ScriptHost for Silent {}

        let (mut tx, mut rx) = event_bus(BusPolicies::default());
        tx.post_timer(timer(0, 1));
        tx.post_envelope(EnvelopeDone {
            channel: 0,
            timestamp_ms: 0,
        });
        assert_eq!(rx.dispatch(&mut Silent, None).total(), 2);
        assert_eq!(rx.stats().timer.processed, 1);
    }

    #[test]
    fn test_full_timer_ring_coalesces_by_timer() {
        let (mut tx, mut rx) = event_bus(BusPolicies::default());
        for stage in 0..RING_CAPACITY as u32 {
            tx.post_timer(timer((stage % 2) as usize, stage));
        }
        assert_eq!(tx.post_timer(timer(1, 500)), PostOutcome::Coalesced);
        assert_eq!(tx.post_timer(timer(7, 1)), PostOutcome::Dropped);

        let stats = rx.stats();
        assert_eq!(stats.timer.coalesced, 1);
        assert_eq!(stats.timer.dropped, 1);
        assert!(!stats.is_healthy());

        let mut host = Recorder::default();
        rx.dispatch(&mut host, None);
        assert_eq!(host.log.len(), RING_CAPACITY);
        // The newest pending timer 1 entry carries the coalesced stage.
        assert_eq!(host.log[RING_CAPACITY - 1], "timer 1 stage 500");
    }

    #[test]
    fn test_envelope_ring_drops_when_full() {
        let (mut tx, rx) = event_bus(BusPolicies::default());
        for _ in 0..RING_CAPACITY {
            tx.post_envelope(EnvelopeDone {
                channel: 0,
                timestamp_ms: 0,
            });
        }
        let outcome = tx.post_envelope(EnvelopeDone {
            channel: 0,
            timestamp_ms: 1,
        });
        assert_eq!(outcome, PostOutcome::Dropped);
        assert_eq!(rx.stats().envelope.dropped, 1);
    }

    #[test]
    fn test_clear_and_reset() {
        let (mut tx, mut rx) = event_bus(BusPolicies::default());
        for task in 0..3 {
            tx.post_resume(resume(task));
        }
        tx.post_timer(timer(0, 1));
        assert_eq!(rx.clear(), 4);
        assert_eq!(rx.pending(), 0);

        rx.reset_stats();
        let stats = tx.stats();
        assert_eq!(stats.resume.posted, 0);
        assert!(stats.is_healthy());
        assert_eq!(rx.handler_timing(), HandlerTiming::default());
        assert_eq!(rx.monitors()[1].name(), "resume");
    }
}
