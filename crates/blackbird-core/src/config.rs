//! Configuration for the scheduling core.
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes:
//!
//! ```toml
//! sample_rate_hz = 44100
//! max_waits = 128
//! exhaustion = "fail"
//!
//! [overflow]
//! envelope = "coalesce"
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bus::BusPolicies;
use crate::clock::{ClockSource, DEFAULT_STOP_GAP_MS, DEFAULT_TEMPO_BPM};
use crate::command::DEFAULT_COMMAND_CAPACITY;
use crate::error::{Error, Result};
use crate::timers::TimerLimits;
use crate::waitlist::DEFAULT_MAX_WAITS;

/// What happens to a wait that finds the node pool empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Resume the task at once so it never hangs.
    #[default]
    ResumeImmediately,
    /// Only count the failure; the task is not resumed.
    Fail,
}

/// Scheduling core configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Sample counter rate in Hz
    pub sample_rate_hz: u32,
    /// Wait nodes available to suspended tasks
    pub max_waits: usize,
    /// Periodic timer slots
    pub timer_count: usize,
    /// Samples per timer block
    pub timer_block_size: u32,
    /// Blocks run per call before skipping ahead
    pub max_catchup_blocks: u32,
    /// Firings owed by one timer before it is re-anchored
    pub max_catchup_fires: u32,
    /// Script-to-real-time command queue capacity
    pub command_queue_capacity: usize,
    /// Tempo of the internal clock at startup
    pub initial_tempo_bpm: f64,
    /// Clock source selected at startup
    pub clock_source: ClockSource,
    /// Trigger edges per beat on the clock input
    pub trigger_pulses_per_beat: f64,
    /// Trigger gap after which the clock input counts as stopped
    pub clock_stop_gap_ms: u32,
    /// Behaviour when the wait pool is empty
    pub exhaustion: ExhaustionPolicy,
    /// Overflow policy per event ring
    pub overflow: BusPolicies,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 48_000,
            max_waits: DEFAULT_MAX_WAITS,
            timer_count: 8,
            timer_block_size: 8,
            max_catchup_blocks: 8,
            max_catchup_fires: 16,
            command_queue_capacity: DEFAULT_COMMAND_CAPACITY,
            initial_tempo_bpm: DEFAULT_TEMPO_BPM,
            clock_source: ClockSource::Internal,
            trigger_pulses_per_beat: 1.0,
            clock_stop_gap_ms: DEFAULT_STOP_GAP_MS,
            exhaustion: ExhaustionPolicy::default(),
            overflow: BusPolicies::default(),
        }
    }
}

impl CoreConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!("Config file not found at {:?}", path)));
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Write the configuration as TOML, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 8] = [
            (self.sample_rate_hz > 0, "sample_rate_hz must be positive"),
            (self.max_waits > 0, "max_waits must be positive"),
            (self.timer_count > 0, "timer_count must be positive"),
            (self.timer_block_size > 0, "timer_block_size must be positive"),
            (
                self.max_catchup_blocks > 0 && self.max_catchup_fires > 0,
                "catch-up limits must be positive",
            ),
            (
                self.command_queue_capacity > 0,
                "command_queue_capacity must be positive",
            ),
            (
                self.initial_tempo_bpm.is_finite() && self.initial_tempo_bpm > 0.0,
                "initial_tempo_bpm must be positive",
            ),
            (
                self.trigger_pulses_per_beat.is_finite() && self.trigger_pulses_per_beat > 0.0,
                "trigger_pulses_per_beat must be positive",
            ),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(Error::InvalidArgument(message.to_string())),
            None => Ok(()),
        }
    }

    /// Block and catch-up limits for the timer engine.
    pub fn timer_limits(&self) -> TimerLimits {
        TimerLimits {
            block_size: self.timer_block_size,
            max_catchup_blocks: self.max_catchup_blocks,
            max_catchup_fires: self.max_catchup_fires,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::OverflowPolicy;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.sample_rate_hz, 48_000);
        assert_eq!(config.max_waits, 64);
        assert_eq!(config.exhaustion, ExhaustionPolicy::ResumeImmediately);
        assert_eq!(config.overflow.envelope, OverflowPolicy::Drop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = CoreConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = CoreConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = CoreConfig::from_toml_str(
            r#"
            max_waits = 16
            exhaustion = "fail"
            clock_source = "external"

            [overflow]
            resume = "drop"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_waits, 16);
        assert_eq!(config.exhaustion, ExhaustionPolicy::Fail);
        assert_eq!(config.clock_source, ClockSource::External);
        assert_eq!(config.overflow.resume, OverflowPolicy::Drop);
        assert_eq!(config.overflow.timer, OverflowPolicy::Coalesce);
        assert_eq!(config.timer_count, 8);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            CoreConfig::from_toml_str("max_waits = 0"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            CoreConfig::from_toml_str("initial_tempo_bpm = -10.0"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            CoreConfig::from_toml_str("exhaustion = \"retry\""),
            Err(Error::TomlParse(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blackbird").join("core.toml");
        let config = CoreConfig {
            sample_rate_hz: 44_100,
            timer_count: 4,
            ..CoreConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(CoreConfig::load(&path).unwrap(), config);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(CoreConfig::load(missing), Err(Error::Config(_))));
    }
}
