//! Blackbird simulator - the `bb-sim` command.
//!
//! Runs the scheduling core on a host machine: a real-time thread driven by
//! a simulated sample counter, a script thread resuming toy tasks, and a
//! report of the diagnostics surface at the end.
//!
//! # Commands
//!
//! - `run` - a steady workload of sleep, sync and beat waits
//! - `stress` - randomised waits, more tasks than wait nodes and a slow host
//! - `config` - print the default configuration as TOML

mod sim;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use blackbird_core::CoreConfig;
use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::sim::{simulate, SimOptions, SimReport};

/// Blackbird - real-time scheduling core simulator
#[derive(Parser, Debug)]
#[command(name = "bb-sim")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Simulate the Blackbird beat clock, wait list and event bus", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(ClapArgs, Debug, Clone)]
struct CommonArgs {
    /// Core configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Simulated time to run, e.g. "10s" or "2m"
    #[arg(short, long, default_value = "10s", value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Override the initial tempo
    #[arg(long)]
    bpm: Option<f64>,

    /// Pace the real-time thread against the wall clock
    #[arg(long)]
    realtime: bool,

    /// Drive the external clock input with an edge every N milliseconds
    #[arg(long, value_name = "MS")]
    trigger_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a steady workload
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// Number of script tasks
        #[arg(short, long, default_value_t = 8)]
        tasks: u32,

        /// Number of periodic timers to start
        #[arg(long, default_value_t = 2)]
        timers: usize,
    },

    /// Overload the core to exercise exhaustion and ring overflow
    Stress {
        #[command(flatten)]
        common: CommonArgs,

        /// Number of script tasks (more than the wait pool holds)
        #[arg(short, long, default_value_t = 200)]
        tasks: u32,

        /// Time each resume handler takes, e.g. "500us"
        #[arg(long, default_value = "200us", value_parser = humantime::parse_duration)]
        slow_host: Duration,

        /// Seed for randomised wait lengths
        #[arg(long, default_value_t = 1)]
        seed: u64,

        /// Events taken from each ring per dispatch
        #[arg(long)]
        budget: Option<usize>,
    },

    /// Print the default configuration
    Config,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    match args.command {
        Commands::Run {
            common,
            tasks,
            timers,
        } => {
            let config = load_config(&common)?;
            let options = SimOptions {
                duration: common.duration,
                tasks,
                realtime: common.realtime,
                trigger_ms: common.trigger_ms,
                timers: timers.min(config.timer_count),
                slow_host: None,
                seed: None,
                budget: None,
            };
            run(config, options)
        }
        Commands::Stress {
            common,
            tasks,
            slow_host,
            seed,
            budget,
        } => {
            let config = load_config(&common)?;
            let options = SimOptions {
                duration: common.duration,
                tasks,
                realtime: common.realtime,
                trigger_ms: common.trigger_ms,
                timers: config.timer_count,
                slow_host: Some(slow_host),
                seed: Some(seed),
                budget,
            };
            run(config, options)
        }
        Commands::Config => {
            print!("{}", CoreConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(common: &CommonArgs) -> Result<CoreConfig> {
    let mut config = match &common.config {
        Some(path) => CoreConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CoreConfig::default(),
    };
    if let Some(bpm) = common.bpm {
        config.initial_tempo_bpm = bpm;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run(config: CoreConfig, options: SimOptions) -> Result<()> {
    log::info!(
        "Simulating {} with {} tasks ({})",
        humantime::format_duration(options.duration),
        options.tasks,
        if options.realtime { "real time" } else { "as fast as possible" }
    );
    let report = simulate(config, &options)?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SimReport) {
    println!();
    println!("Blackbird scheduling core");
    println!("=========================");
    println!("{}", report.diagnostics);
    println!();
    println!("ring      posted  processed  dropped  coalesced  high-water");
    for (name, stats) in report.bus.rings() {
        println!(
            "{:<8} {:>7} {:>10} {:>8} {:>10} {:>7}/{}",
            name,
            stats.posted,
            stats.processed,
            stats.dropped,
            stats.coalesced,
            stats.high_water,
            stats.capacity
        );
    }
    println!();
    println!(
        "handlers  : timer last/worst {}/{} us, resume last/worst {}/{} us",
        report.timing.timer_last_us,
        report.timing.timer_worst_us,
        report.timing.resume_last_us,
        report.timing.resume_worst_us
    );
    println!(
        "delivered : {} resumes, {} timer events, {} inputs, {} envelopes, {} transport changes",
        report.resumes,
        report.timer_events,
        report.inputs,
        report.envelopes,
        report.transport_changes
    );
    println!(
        "wall time : {:.3}s ({})",
        report.wall_time.as_secs_f64(),
        if report.bus.is_healthy() { "healthy" } else { "events dropped" }
    );
}
