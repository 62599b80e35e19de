//! The real-time core and the script-side handle.
//!
//! [`Engine::new`] builds every component from a [`CoreConfig`] and
//! [`Engine::split`] hands out the two halves:
//!
//! - [`RealtimeCore`] owns the beat clock, the wait scheduler, the timer
//!   engine and the producer half of the event bus. It is driven once per
//!   processing tick with the sample counter and never blocks.
//! - [`ScriptHandle`] queues commands for the real-time core and drains the
//!   event bus into a [`ScriptHost`].
//!
//! Within one call to [`RealtimeCore::process`] the order is fixed: clock
//! tick, queued commands, timer blocks, then due waits. At most one queue's
//! worth of commands is applied per tick; the rest wait for the next one.

use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::bus::{
    event_bus, BusConsumer, BusProducer, BusStats, DispatchReport, HandlerTiming, ScriptHost,
};
use crate::clock::{BeatClock, ClockSource};
use crate::command::{command_queue, Command, CommandSender};
use crate::config::{CoreConfig, ExhaustionPolicy};
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::error::{Error, Result};
use crate::events::{
    Detection, EnvelopeDone, InputDetected, ResumeEvent, TaskId, TimerId, WaitKind,
};
use crate::ring::{PostOutcome, RingMonitor};
use crate::timers::{post_timer_event, TimerCallback, TimerEngine};
use crate::timing::{Millis, SampleClock};
use crate::waitlist::WaitListScheduler;

/// A configured core, before its halves go to their threads.
pub struct Engine {
    realtime: RealtimeCore,
    script: ScriptHandle,
}

impl Engine {
    /// Validate `config` and build every component.
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;

        let (bus_tx, bus_rx) = event_bus(config.overflow);
        let (command_tx, command_rx) = command_queue(config.command_queue_capacity);
        let diagnostics = Arc::new(Diagnostics::default());

        let mut clock = BeatClock::new(config.initial_tempo_bpm)
            .with_trigger_division(config.trigger_pulses_per_beat)
            .with_stop_gap_ms(config.clock_stop_gap_ms);
        clock.set_source(config.clock_source);
        let transport_running = clock.transport_running(0);
        diagnostics.init_transport(transport_running);

        log::info!(
            "Scheduling core ready: {} Hz, {} wait nodes, {} timers, {:.1} BPM",
            config.sample_rate_hz,
            config.max_waits,
            config.timer_count,
            config.initial_tempo_bpm
        );

        Ok(Self {
            realtime: RealtimeCore {
                sample_clock: SampleClock::new(config.sample_rate_hz),
                clock,
                waits: WaitListScheduler::new(config.max_waits),
                timers: TimerEngine::new(
                    config.timer_count,
                    config.sample_rate_hz,
                    config.timer_limits(),
                ),
                bus: bus_tx,
                commands: command_rx,
                diagnostics: Arc::clone(&diagnostics),
                exhaustion: config.exhaustion,
                command_budget: config.command_queue_capacity.max(1),
                transport_running,
                sample_count: 0,
            },
            script: ScriptHandle {
                commands: command_tx,
                bus: bus_rx,
                diagnostics,
                transport_seen: 0,
            },
        })
    }

    /// Separate the real-time half from the script half.
    pub fn split(self) -> (RealtimeCore, ScriptHandle) {
        (self.realtime, self.script)
    }
}

/// State owned by the real-time context.
pub struct RealtimeCore {
    sample_clock: SampleClock,
    clock: BeatClock,
    waits: WaitListScheduler,
    timers: TimerEngine,
    bus: BusProducer,
    commands: Receiver<Command>,
    diagnostics: Arc<Diagnostics>,
    exhaustion: ExhaustionPolicy,
    /// Commands applied per tick at most.
    command_budget: usize,
    transport_running: bool,
    sample_count: u64,
}

impl RealtimeCore {
    /// Run one processing tick at `sample_count`.
    pub fn process(&mut self, sample_count: u64) {
        self.sample_count = sample_count;
        let now_ms = self.sample_clock.ms_at(sample_count);
        let advanced = self.clock.tick(now_ms);

        for _ in 0..self.command_budget {
            let Ok(command) = self.commands.try_recv() else {
                break;
            };
            let ok = self.apply(command, now_ms);
            self.diagnostics.record_command(ok);
        }

        self.timers.process(sample_count, &mut self.bus.timers);

        if advanced {
            self.waits.tick(&self.clock, now_ms, &mut self.bus.resumes);
        }
        self.publish(now_ms);
    }

    fn apply(&mut self, command: Command, now_ms: Millis) -> bool {
        let result = match command {
            Command::Sleep { task, seconds } => {
                let result = self.waits.schedule_sleep(task, seconds, now_ms);
                self.on_schedule(task, WaitKind::Sleep, result, now_ms)
            }
            Command::Sync { task, beats } => {
                let result = self.waits.schedule_sync(task, beats, &self.clock, now_ms);
                self.on_schedule(task, WaitKind::Sync, result, now_ms)
            }
            Command::SleepBeats { task, beats } => {
                let result = self.waits.schedule_beats(task, beats, &self.clock, now_ms);
                self.on_schedule(task, WaitKind::Sleep, result, now_ms)
            }
            Command::Cancel { task } => {
                self.waits.cancel(task);
                Ok(())
            }
            Command::CancelAll => {
                let cancelled = self.waits.cancel_all();
                self.timers.stop_all();
                // Events from before the reset must not reach the new script.
                self.bus.discard_pending();
                log::info!("Reset: {cancelled} waits cancelled, timers stopped");
                Ok(())
            }
            Command::SetSource { source } => {
                self.clock.set_source(source);
                Ok(())
            }
            Command::UpdateReference {
                beat,
                beat_duration_secs,
                from,
            } => {
                self.clock.update_reference(beat, beat_duration_secs, from);
                Ok(())
            }
            Command::SetTempo { bpm } => {
                self.clock.set_tempo(bpm);
                Ok(())
            }
            Command::StartClock { beat } => {
                self.clock.start(beat);
                Ok(())
            }
            Command::StopClock => {
                self.clock.stop();
                Ok(())
            }
            Command::SetTriggerDivision { pulses_per_beat } => {
                self.clock.set_trigger_division(pulses_per_beat);
                Ok(())
            }
            Command::TimerStart { timer, callback } => self.timers.start(timer, callback),
            Command::TimerStop { timer } => self.timers.stop(timer),
            Command::TimerSetPeriod { timer, seconds } => self.timers.set_period(timer, seconds),
            Command::ResetStats => {
                self.waits.reset_stats();
                self.timers.reset_stats();
                self.diagnostics.reset_counters();
                Ok(())
            }
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                log::debug!("Command {command:?} failed: {err}");
                false
            }
        }
    }

    /// Apply the exhaustion policy to a failed wait.
    fn on_schedule(
        &mut self,
        task: TaskId,
        kind: WaitKind,
        result: Result<()>,
        now_ms: Millis,
    ) -> Result<()> {
        match result {
            Err(Error::ResourceExhausted { .. })
                if self.exhaustion == ExhaustionPolicy::ResumeImmediately =>
            {
                self.diagnostics.record_exhaustion_resume();
                self.bus
                    .resumes
                    .try_post(ResumeEvent {
                        task,
                        kind,
                        timestamp_ms: now_ms,
                    })
                    .map(|_| ())
            }
            other => other,
        }
    }

    fn publish(&mut self, now_ms: Millis) {
        let beat = self.clock.beat_at(now_ms);
        let running = self.clock.transport_running(now_ms);
        if running != self.transport_running {
            self.transport_running = running;
            log::debug!(
                "Transport {} at beat {beat}",
                if running { "started" } else { "stopped" }
            );
            self.diagnostics.publish_transport(running, beat, now_ms);
        }
        self.diagnostics
            .publish_clock(now_ms, beat, self.clock.beat_duration_ms());
        self.diagnostics.publish_scheduler(&self.waits.stats());
        self.diagnostics.publish_timers(&self.timers.stats());
    }

    /// Record a trigger edge on the clock input at the current tick.
    pub fn trigger_edge(&mut self) -> bool {
        let now_ms = self.sample_clock.ms_at(self.sample_count);
        self.clock.trigger_edge(now_ms)
    }

    /// Report an input detector firing.
    pub fn post_input(&mut self, channel: u8, value: f32, detection: Detection) -> PostOutcome {
        let timestamp_ms = self.sample_clock.ms_at(self.sample_count);
        self.bus.post_input(InputDetected {
            channel,
            value,
            detection,
            timestamp_ms,
        })
    }

    /// Report that an output envelope finished.
    pub fn post_envelope_done(&mut self, channel: u8) -> PostOutcome {
        let timestamp_ms = self.sample_clock.ms_at(self.sample_count);
        self.bus.post_envelope(EnvelopeDone {
            channel,
            timestamp_ms,
        })
    }

    pub fn clock(&self) -> &BeatClock {
        &self.clock
    }

    pub fn waits(&self) -> &WaitListScheduler {
        &self.waits
    }

    pub fn timers(&self) -> &TimerEngine {
        &self.timers
    }

    /// Sample count of the last tick.
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_clock.sample_rate()
    }
}

/// The script context's view of the core.
pub struct ScriptHandle {
    commands: CommandSender,
    bus: BusConsumer,
    diagnostics: Arc<Diagnostics>,
    /// Transport changes already reported to the host.
    transport_seen: u64,
}

impl ScriptHandle {
    /// Suspend `task` for `seconds` of wall-clock time.
    pub fn sleep(&self, task: TaskId, seconds: f64) -> Result<()> {
        if seconds.is_nan() || seconds < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "sleep duration must be non-negative, got {seconds}"
            )));
        }
        self.commands.send(Command::Sleep { task, seconds })
    }

    /// Suspend `task` until the next multiple of `beats`.
    pub fn sync(&self, task: TaskId, beats: f64) -> Result<()> {
        if beats.is_nan() || beats <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "sync interval must be positive, got {beats}"
            )));
        }
        self.commands.send(Command::Sync { task, beats })
    }

    /// Suspend `task` for `beats` beats at the current tempo.
    pub fn sleep_beats(&self, task: TaskId, beats: f64) -> Result<()> {
        if beats.is_nan() || beats < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "beat count must be non-negative, got {beats}"
            )));
        }
        self.commands.send(Command::SleepBeats { task, beats })
    }

    pub fn cancel(&self, task: TaskId) -> Result<()> {
        self.commands.send(Command::Cancel { task })
    }

    /// Full reset for a script reload: every wait and timer on the real-time
    /// side, and every event still pending here.
    ///
    /// Events the real-time side posts before it applies the reset are
    /// skipped as well.
    pub fn cancel_all(&mut self) -> Result<()> {
        self.bus.await_discard();
        if let Err(err) = self.commands.send(Command::CancelAll) {
            self.bus.cancel_await();
            return Err(err);
        }
        self.bus.clear();
        Ok(())
    }

    pub fn set_source(&self, source: ClockSource) -> Result<()> {
        self.commands.send(Command::SetSource { source })
    }

    pub fn update_reference(
        &self,
        beat: f64,
        beat_duration_secs: f64,
        from: ClockSource,
    ) -> Result<()> {
        self.commands.send(Command::UpdateReference {
            beat,
            beat_duration_secs,
            from,
        })
    }

    pub fn set_tempo(&self, bpm: f64) -> Result<()> {
        self.commands.send(Command::SetTempo { bpm })
    }

    pub fn start_clock(&self, beat: f64) -> Result<()> {
        self.commands.send(Command::StartClock { beat })
    }

    pub fn stop_clock(&self) -> Result<()> {
        self.commands.send(Command::StopClock)
    }

    pub fn set_trigger_division(&self, pulses_per_beat: f64) -> Result<()> {
        self.commands.send(Command::SetTriggerDivision { pulses_per_beat })
    }

    /// Start a timer that reports each firing to the script side.
    pub fn start_timer(&self, timer: TimerId) -> Result<()> {
        self.start_timer_with(timer, post_timer_event)
    }

    /// Start a timer with a callback that runs on the real-time context.
    pub fn start_timer_with(&self, timer: TimerId, callback: TimerCallback) -> Result<()> {
        self.commands.send(Command::TimerStart { timer, callback })
    }

    pub fn stop_timer(&self, timer: TimerId) -> Result<()> {
        self.commands.send(Command::TimerStop { timer })
    }

    pub fn set_timer_period(&self, timer: TimerId, seconds: f64) -> Result<()> {
        self.commands.send(Command::TimerSetPeriod { timer, seconds })
    }

    /// Zero every counter on both sides.
    pub fn reset_stats(&mut self) -> Result<()> {
        self.commands.send(Command::ResetStats)?;
        self.bus.reset_stats();
        Ok(())
    }

    /// Drain pending events into `host`, after reporting any transport
    /// change since the last call.
    pub fn dispatch<H: ScriptHost + ?Sized>(
        &mut self,
        host: &mut H,
        budget: Option<usize>,
    ) -> DispatchReport {
        let (changes, transport) = self.diagnostics.transport();
        if changes != self.transport_seen {
            self.transport_seen = changes;
            host.on_transport(transport);
        }
        self.bus.dispatch(host, budget)
    }

    /// Events waiting to be dispatched.
    pub fn pending(&self) -> usize {
        self.bus.pending()
    }

    pub fn bus_stats(&self) -> BusStats {
        self.bus.stats()
    }

    pub fn handler_timing(&self) -> HandlerTiming {
        self.bus.handler_timing()
    }

    pub fn ring_monitors(&self) -> [RingMonitor; 4] {
        self.bus.monitors()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Another sender for commands, e.g. for a tempo input handler.
    pub fn command_sender(&self) -> CommandSender {
        self.commands.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{TimerFired, TransportChanged};
    use crate::timing::BeatTime;
    use std::thread;

    const SAMPLES_PER_MS: u64 = 48;

    #[derive(Default)]
    struct Host {
        resumes: Vec<ResumeEvent>,
        timers: Vec<TimerFired>,
        inputs: Vec<InputDetected>,
        envelopes: Vec<EnvelopeDone>,
        transport: Vec<TransportChanged>,
    }

    impl ScriptHost for Host {
        fn on_timer(&mut self, event: TimerFired) {
            self.timers.push(event);
        }

        fn on_resume(&mut self, event: ResumeEvent) {
            self.resumes.push(event);
        }

        fn on_input(&mut self, event: InputDetected) {
            self.inputs.push(event);
        }

        fn on_envelope_done(&mut self, event: EnvelopeDone) {
            self.envelopes.push(event);
        }

        fn on_transport(&mut self, event: TransportChanged) {
            self.transport.push(event);
        }
    }

    fn engine(config: CoreConfig) -> (RealtimeCore, ScriptHandle) {
        Engine::new(config).unwrap().split()
    }

    fn run_ms(core: &mut RealtimeCore, from: u64, to: u64) {
        for ms in from..=to {
            core.process(ms * SAMPLES_PER_MS);
        }
    }

    #[test]
    fn test_sleep_resumes_through_the_bus() {
        let (mut core, mut script) = engine(CoreConfig::default());
        script.sleep(TaskId(1), 0.25).unwrap();
        run_ms(&mut core, 0, 249);

        let mut host = Host::default();
        script.dispatch(&mut host, None);
        assert!(host.resumes.is_empty());

        run_ms(&mut core, 250, 250);
        script.dispatch(&mut host, None);
        assert_eq!(host.resumes, vec![ResumeEvent {
            task: TaskId(1),
            kind: WaitKind::Sleep,
            timestamp_ms: 250,
        }]);
        assert_eq!(script.diagnostics().scheduler.successes, 1);
    }

    #[test]
    fn test_sync_follows_tempo_change() {
        let (mut core, mut script) = engine(CoreConfig::default());
        script.set_tempo(60.0).unwrap();
        script.sync(TaskId(4), 1.0).unwrap();
        run_ms(&mut core, 0, 999);

        let mut host = Host::default();
        script.dispatch(&mut host, None);
        assert!(host.resumes.is_empty());
        run_ms(&mut core, 1000, 1000);
        script.dispatch(&mut host, None);
        assert_eq!(host.resumes.len(), 1);
        assert_eq!(host.resumes[0].kind, WaitKind::Sync);
        assert_eq!(script.diagnostics().beat_duration_ms, 1000);
    }

    #[test]
    fn test_exhaustion_resumes_immediately_by_default() {
        let (mut core, mut script) = engine(CoreConfig {
            max_waits: 1,
            ..CoreConfig::default()
        });
        script.sleep(TaskId(1), 10.0).unwrap();
        script.sleep(TaskId(2), 10.0).unwrap();
        run_ms(&mut core, 0, 5);

        let mut host = Host::default();
        script.dispatch(&mut host, None);
        assert_eq!(host.resumes.len(), 1);
        assert_eq!(host.resumes[0].task, TaskId(2));
        assert_eq!(host.resumes[0].timestamp_ms, 0);

        let diagnostics = script.diagnostics();
        assert_eq!(diagnostics.exhaustion_resumes, 1);
        assert_eq!(diagnostics.scheduler.failures, 1);
        assert_eq!(diagnostics.command_errors, 0);
    }

    #[test]
    fn test_exhaustion_fail_policy_only_counts() {
        let (mut core, mut script) = engine(CoreConfig {
            max_waits: 1,
            exhaustion: ExhaustionPolicy::Fail,
            ..CoreConfig::default()
        });
        script.sleep(TaskId(1), 10.0).unwrap();
        script.sleep(TaskId(2), 10.0).unwrap();
        run_ms(&mut core, 0, 5);

        let mut host = Host::default();
        script.dispatch(&mut host, None);
        assert!(host.resumes.is_empty());
        let diagnostics = script.diagnostics();
        assert_eq!(diagnostics.exhaustion_resumes, 0);
        assert_eq!(diagnostics.command_errors, 1);
    }

    #[test]
    fn test_invalid_waits_are_rejected_before_queueing() {
        let (_core, script) = engine(CoreConfig::default());
        assert!(matches!(
            script.sync(TaskId(1), 0.0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(script.sleep(TaskId(1), f64::NAN).is_err());
        assert!(script.sleep_beats(TaskId(1), -1.0).is_err());
    }

    #[test]
    fn test_timer_fires_reach_the_host() {
        let (mut core, mut script) = engine(CoreConfig::default());
        script.set_timer_period(TimerId(0), 0.01).unwrap();
        script.start_timer(TimerId(0)).unwrap();

        let mut host = Host::default();
        for ms in 0..=1000 {
            core.process(ms * SAMPLES_PER_MS);
            script.dispatch(&mut host, None);
        }
        assert_eq!(host.timers.len(), 100);
        assert_eq!(host.timers[99].stage, 100);
        assert_eq!(script.diagnostics().timers.active, 1);

        script.stop_timer(TimerId(0)).unwrap();
        // An unknown timer is counted as a rejected command.
        script.stop_timer(TimerId(99)).unwrap();
        run_ms(&mut core, 1001, 1200);
        script.dispatch(&mut host, None);
        assert_eq!(host.timers.len(), 100);
        assert_eq!(script.diagnostics().command_errors, 1);
    }

    #[test]
    fn test_cancel_all_resets_waits_timers_and_pending_events() {
        let (mut core, mut script) = engine(CoreConfig::default());
        script.set_timer_period(TimerId(2), 0.001).unwrap();
        script.start_timer(TimerId(2)).unwrap();
        script.sleep(TaskId(1), 5.0).unwrap();
        script.sync(TaskId(2), 4.0).unwrap();
        run_ms(&mut core, 0, 20);
        assert!(script.pending() > 0);
        assert_eq!(core.waits().active(), 2);

        script.cancel_all().unwrap();
        assert_eq!(script.pending(), 0);
        run_ms(&mut core, 21, 21);
        assert_eq!(core.waits().active(), 0);
        assert!(!core.timers().is_active(TimerId(2)));
    }

    #[test]
    fn test_cancel_all_skips_events_posted_before_it_applies() {
        let (mut core, mut script) = engine(CoreConfig::default());
        script.sleep(TaskId(1), 0.005).unwrap();
        run_ms(&mut core, 0, 4);

        script.cancel_all().unwrap();
        // The real-time side is mid-tick: it already polled the queue and
        // still resolves the old script's wait.
        core.bus.post_resume(ResumeEvent {
            task: TaskId(1),
            kind: WaitKind::Sleep,
            timestamp_ms: 5,
        });
        core.post_input(0, 1.0, Detection::Stream);
        let mut host = Host::default();
        script.dispatch(&mut host, None);
        assert!(host.resumes.is_empty());

        script.sleep(TaskId(2), 0.0).unwrap();
        run_ms(&mut core, 5, 6);
        script.dispatch(&mut host, None);
        let tasks: Vec<TaskId> = host.resumes.iter().map(|e| e.task).collect();
        assert_eq!(tasks, vec![TaskId(2)]);
        assert!(host.inputs.is_empty());
        assert!(script.bus_stats().is_healthy());
    }

    #[test]
    fn test_reload_under_load_never_resumes_old_tasks() {
        let _ = env_logger::builder().is_test(true).try_init();
        const ROUNDS: u32 = 50;
        const TASKS: u32 = 8;
        let (mut core, mut script) = engine(CoreConfig::default());

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let realtime = thread::spawn(move || {
            let mut sample = 0;
            while done_rx.try_recv().is_err() {
                sample += SAMPLES_PER_MS;
                core.process(sample);
                thread::yield_now();
            }
        });

        fn retry(send: impl Fn() -> Result<()>) {
            while let Err(Error::CommandQueueFull) = send() {
                thread::yield_now();
            }
        }

        let mut host = Host::default();
        for round in 0..ROUNDS {
            let old = round * TASKS * 2;
            let new = old + TASKS;
            for task in old..new {
                retry(|| script.sleep(TaskId(task), 0.0));
            }
            thread::yield_now();
            while let Err(Error::CommandQueueFull) = script.cancel_all() {
                thread::yield_now();
            }
            for task in new..new + TASKS {
                retry(|| script.sleep(TaskId(task), 0.0));
            }

            let mut resumed = 0;
            while resumed < TASKS {
                script.dispatch(&mut host, None);
                for event in host.resumes.drain(..) {
                    assert!(event.task.0 >= new, "{} resumed after the reset", event.task);
                    resumed += 1;
                }
                thread::yield_now();
            }
            assert_eq!(resumed, TASKS);
        }

        done_tx.send(()).unwrap();
        realtime.join().unwrap();
    }

    #[test]
    fn test_commands_per_tick_are_bounded() {
        let _ = env_logger::builder().is_test(true).try_init();
        const CAPACITY: u64 = 8;
        let (mut core, script) = engine(CoreConfig {
            command_queue_capacity: CAPACITY as usize,
            ..CoreConfig::default()
        });

        let sender = script.command_sender();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let flood = thread::spawn(move || {
            while stop_rx.try_recv().is_err() {
                let _ = sender.send(Command::Cancel { task: TaskId(0) });
            }
        });

        let mut applied = 0;
        for ms in 0..500 {
            core.process(ms * SAMPLES_PER_MS);
            let total = script.diagnostics().commands_applied;
            assert!(total - applied <= CAPACITY, "{} commands in one tick", total - applied);
            applied = total;
        }
        stop_tx.send(()).unwrap();
        flood.join().unwrap();
        assert!(applied > 0);
    }

    #[test]
    fn test_transport_changes_reach_the_host() {
        let (mut core, mut script) = engine(CoreConfig::default());
        let mut host = Host::default();
        run_ms(&mut core, 0, 99);
        script.dispatch(&mut host, None);
        assert!(host.transport.is_empty());

        script.stop_clock().unwrap();
        run_ms(&mut core, 100, 200);
        script.dispatch(&mut host, None);
        assert_eq!(host.transport, vec![TransportChanged {
            running: false,
            beat: BeatTime::from_float(0.2),
            timestamp_ms: 100,
        }]);
        assert!(!script.diagnostics().transport_running);

        script.start_clock(4.0).unwrap();
        run_ms(&mut core, 201, 201);
        script.dispatch(&mut host, None);
        assert_eq!(host.transport.len(), 2);
        assert!(host.transport[1].running);
        assert_eq!(host.transport[1].beat, BeatTime::from_whole(4));

        // Nothing new to report.
        script.dispatch(&mut host, None);
        assert_eq!(host.transport.len(), 2);
    }

    #[test]
    fn test_external_clock_through_trigger_edges() {
        let (mut core, script) = engine(CoreConfig::default());
        script.set_source(ClockSource::External).unwrap();
        for ms in 0..=2000 {
            core.process(ms * SAMPLES_PER_MS);
            if ms % 250 == 0 {
                core.trigger_edge();
            }
        }
        assert_eq!(core.clock().beat_duration_ms(), 250);
        assert_eq!(script.diagnostics().beat_duration_ms, 250);
    }

    #[test]
    fn test_hardware_events_are_delivered() {
        let (mut core, mut script) = engine(CoreConfig::default());
        core.process(480);
        core.post_input(1, 3.3, Detection::Window {
            window: 2,
            rising: true,
        });
        core.post_envelope_done(3);

        let mut host = Host::default();
        script.dispatch(&mut host, None);
        assert_eq!(host.inputs.len(), 1);
        assert_eq!(host.inputs[0].timestamp_ms, 10);
        assert_eq!(host.envelopes, vec![EnvelopeDone {
            channel: 3,
            timestamp_ms: 10,
        }]);
    }

    #[test]
    fn test_reset_stats_clears_both_sides() {
        let (mut core, mut script) = engine(CoreConfig::default());
        script.sleep(TaskId(1), 0.0).unwrap();
        run_ms(&mut core, 0, 2);
        let mut host = Host::default();
        script.dispatch(&mut host, None);
        assert_eq!(script.bus_stats().resume.processed, 1);

        script.reset_stats().unwrap();
        run_ms(&mut core, 3, 3);
        assert_eq!(script.bus_stats().resume.processed, 0);
        let diagnostics = script.diagnostics();
        assert_eq!(diagnostics.scheduler.successes, 0);
        // Only the reset itself.
        assert_eq!(diagnostics.commands_applied, 1);
    }

    #[test]
    fn test_threads_deliver_every_resume_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        const TASKS: u32 = 32;
        const ROUNDS: u32 = 20;
        let (mut core, mut script) = engine(CoreConfig::default());

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let realtime = thread::spawn(move || {
            let mut sample = 0;
            while done_rx.try_recv().is_err() {
                sample += SAMPLES_PER_MS;
                core.process(sample);
                thread::yield_now();
            }
            core.waits().active()
        });

        #[derive(Default)]
        struct Counter {
            resumed: Vec<u32>,
            last: Vec<TaskId>,
        }
        impl ScriptHost for Counter {
            fn on_resume(&mut self, event: ResumeEvent) {
                self.resumed[event.task.0 as usize] += 1;
                self.last.push(event.task);
            }
        }

        let mut host = Counter {
            resumed: vec![0; TASKS as usize],
            last: Vec::new(),
        };
        for task in 0..TASKS {
            script.sleep(TaskId(task), 0.001 * task as f64).unwrap();
        }
        while host.resumed.iter().any(|&n| n < ROUNDS) {
            script.dispatch(&mut host, None);
            for task in host.last.drain(..) {
                if host.resumed[task.0 as usize] < ROUNDS {
                    // Commands can only back up while the core is busy.
                    while let Err(Error::CommandQueueFull) = script.sync(task, 0.25) {
                        thread::yield_now();
                    }
                }
            }
            thread::yield_now();
        }

        done_tx.send(()).unwrap();
        let still_waiting = realtime.join().unwrap();
        assert_eq!(still_waiting, 0);
        assert!(host.resumed.iter().all(|&n| n == ROUNDS));
        assert!(script.bus_stats().is_healthy());
    }
}
