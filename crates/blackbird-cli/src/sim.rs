//! Host-side simulation of the two execution contexts.
//!
//! The real-time core runs on its own thread against a simulated sample
//! counter, one millisecond per tick. The calling thread plays the script
//! context: it drains the event bus into a toy [`ScriptHost`] and re-issues
//! a wait for every task that was resumed.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use blackbird_core::bus::HandlerTiming;
use blackbird_core::{
    BusStats, ClockSource, CoreConfig, Detection, DiagnosticsSnapshot, Engine, EnvelopeDone, Error,
    InputDetected, ResumeEvent, ScriptHandle, ScriptHost, TaskId, TimerFired, TimerId,
    TransportChanged,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// What to simulate.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Simulated time to run for.
    pub duration: Duration,
    /// Number of script tasks issuing waits.
    pub tasks: u32,
    /// Pace the real-time thread against the wall clock.
    pub realtime: bool,
    /// Drive the external clock input with an edge every this many ms.
    pub trigger_ms: Option<u64>,
    /// Number of periodic timers to start.
    pub timers: usize,
    /// Time each resume handler spends "running script code".
    pub slow_host: Option<Duration>,
    /// Randomise wait lengths with this seed.
    pub seed: Option<u64>,
    /// Per-ring dispatch budget.
    pub budget: Option<usize>,
}

/// Outcome of a simulation run.
#[derive(Debug, Clone)]
pub struct SimReport {
    pub diagnostics: DiagnosticsSnapshot,
    pub bus: BusStats,
    pub timing: HandlerTiming,
    pub resumes: u64,
    pub timer_events: u64,
    pub inputs: u64,
    pub envelopes: u64,
    pub transport_changes: u64,
    pub wall_time: Duration,
}

/// A wait a task issues each time it is resumed.
#[derive(Debug, Clone, Copy)]
enum Wait {
    Sleep(f64),
    Sync(f64),
    Beats(f64),
}

struct ToyHost {
    waits: Vec<Wait>,
    resumed: Vec<TaskId>,
    rng: Option<StdRng>,
    slow_host: Option<Duration>,
    resumes: u64,
    timer_events: u64,
    inputs: u64,
    envelopes: u64,
    transport_changes: u64,
}

impl ToyHost {
    fn new(tasks: u32, options: &SimOptions) -> Self {
        let waits = (0..tasks)
            .map(|task| match task % 3 {
                0 => Wait::Sleep(0.05 + 0.01 * (task % 10) as f64),
                1 => Wait::Sync([0.25, 0.5, 1.0][(task as usize / 3) % 3]),
                _ => Wait::Beats(0.75),
            })
            .collect();
        Self {
            waits,
            resumed: Vec::new(),
            rng: options.seed.map(StdRng::seed_from_u64),
            slow_host: options.slow_host,
            resumes: 0,
            timer_events: 0,
            inputs: 0,
            envelopes: 0,
            transport_changes: 0,
        }
    }

    /// The next wait for `task`, randomised when a seed was given.
    fn next_wait(&mut self, task: TaskId) -> Wait {
        let wait = self.waits[task.0 as usize];
        let Some(rng) = self.rng.as_mut() else {
            return wait;
        };
        match wait {
            Wait::Sleep(_) => Wait::Sleep(rng.random_range(0.0..0.5)),
            Wait::Sync(_) => Wait::Sync([0.125, 0.25, 0.5, 1.0][rng.random_range(0..4)]),
            Wait::Beats(_) => Wait::Beats(rng.random_range(0.1..2.0)),
        }
    }

    fn issue(&mut self, script: &ScriptHandle, task: TaskId) -> Result<()> {
        let wait = self.next_wait(task);
        loop {
            let sent = match wait {
                Wait::Sleep(seconds) => script.sleep(task, seconds),
                Wait::Sync(beats) => script.sync(task, beats),
                Wait::Beats(beats) => script.sleep_beats(task, beats),
            };
            match sent {
                Ok(()) => return Ok(()),
                Err(Error::CommandQueueFull) => thread::yield_now(),
                Err(err) => return Err(err).with_context(|| format!("Failed to schedule {task}")),
            }
        }
    }
}

impl ScriptHost for ToyHost {
    fn on_timer(&mut self, event: TimerFired) {
        self.timer_events += 1;
        log::trace!("{} stage {} at sample {}", event.timer, event.stage, event.sample);
    }

    fn on_resume(&mut self, event: ResumeEvent) {
        self.resumes += 1;
        if let Some(delay) = self.slow_host {
            thread::sleep(delay);
        }
        self.resumed.push(event.task);
    }

    fn on_input(&mut self, _event: InputDetected) {
        self.inputs += 1;
    }

    fn on_envelope_done(&mut self, _event: EnvelopeDone) {
        self.envelopes += 1;
    }

    fn on_transport(&mut self, event: TransportChanged) {
        self.transport_changes += 1;
        log::info!(
            "Clock {} at beat {} ({} ms)",
            if event.running { "started" } else { "stopped" },
            event.beat,
            event.timestamp_ms
        );
    }
}

/// Run the simulation to completion.
pub fn simulate(config: CoreConfig, options: &SimOptions) -> Result<SimReport> {
    let sample_rate = config.sample_rate_hz as u64;
    let (mut core, mut script) = Engine::new(config)
        .context("Invalid core configuration")?
        .split();

    if options.trigger_ms.is_some() {
        script.set_source(ClockSource::External)?;
    }
    for timer in 0..options.timers {
        script.set_timer_period(TimerId(timer), 0.1 * (timer + 1) as f64)?;
        script.start_timer(TimerId(timer))?;
    }

    let mut host = ToyHost::new(options.tasks, options);
    for task in 0..options.tasks {
        host.issue(&script, TaskId(task))?;
    }

    let total_ms = options.duration.as_millis() as u64;
    let trigger_ms = options.trigger_ms;
    let realtime = options.realtime;
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let started = Instant::now();

    let realtime_thread = thread::Builder::new()
        .name("bb-realtime".into())
        .spawn(move || {
            for ms in 1..=total_ms {
                if stop_rx.try_recv().is_ok() {
                    break;
                }
                core.process(ms * sample_rate / 1000);
                if trigger_ms.is_some_and(|every| every > 0 && ms % every == 0) {
                    core.trigger_edge();
                }
                // Stand-ins for the input detectors and slopes.
                if ms % 1000 == 0 {
                    core.post_input(0, 1.0, Detection::Change { rising: true });
                    core.post_envelope_done(1);
                }
                if realtime {
                    let due = started + Duration::from_millis(ms);
                    if let Some(wait) = due.checked_duration_since(Instant::now()) {
                        thread::sleep(wait);
                    }
                } else if ms % 64 == 0 {
                    thread::yield_now();
                }
            }
            core.waits().stats()
        })
        .context("Failed to spawn real-time thread")?;

    let result = script_loop(&mut script, &mut host, options.budget, || {
        realtime_thread.is_finished()
    });
    if result.is_err() {
        let _ = stop_tx.send(());
    }
    let scheduler = realtime_thread
        .join()
        .map_err(|_| anyhow!("Real-time thread panicked"))?;
    result?;

    // Final drain after the core stopped.
    script.dispatch(&mut host, None);
    log::info!(
        "Simulation finished: {} waits still pending of {}",
        scheduler.active_sleep + scheduler.active_sync,
        scheduler.capacity
    );

    Ok(SimReport {
        diagnostics: script.diagnostics(),
        bus: script.bus_stats(),
        timing: script.handler_timing(),
        resumes: host.resumes,
        timer_events: host.timer_events,
        inputs: host.inputs,
        envelopes: host.envelopes,
        transport_changes: host.transport_changes,
        wall_time: started.elapsed(),
    })
}

fn script_loop(
    script: &mut ScriptHandle,
    host: &mut ToyHost,
    budget: Option<usize>,
    finished: impl Fn() -> bool,
) -> Result<()> {
    while !finished() {
        let report = script.dispatch(host, budget);
        let resumed: Vec<TaskId> = host.resumed.drain(..).collect();
        for task in resumed {
            host.issue(script, task)?;
        }
        if report.total() == 0 {
            thread::sleep(Duration::from_micros(200));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SimOptions {
        SimOptions {
            duration: Duration::from_secs(2),
            tasks: 6,
            realtime: false,
            trigger_ms: None,
            timers: 1,
            slow_host: None,
            seed: Some(7),
            budget: None,
        }
    }

    #[test]
    fn test_simulation_runs_to_completion() {
        let report = simulate(CoreConfig::default(), &options()).unwrap();
        assert!(report.resumes > 0);
        assert_eq!(report.inputs, 2);
        assert_eq!(report.envelopes, 2);
        assert!(report.diagnostics.commands_applied > 0);
        assert_eq!(report.diagnostics.now_ms, 2000);
    }

    #[test]
    fn test_external_clock_sets_tempo() {
        let report = simulate(
            CoreConfig::default(),
            &SimOptions {
                trigger_ms: Some(400),
                ..options()
            },
        )
        .unwrap();
        assert_eq!(report.diagnostics.beat_duration_ms, 400);
        assert!(report.diagnostics.transport_running);
        assert!(report.transport_changes >= 1);
    }
}
