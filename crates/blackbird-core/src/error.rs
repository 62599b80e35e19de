//! Error types for the blackbird-core crate.

use thiserror::Error;

/// Errors reported by the scheduling core.
///
/// Nothing on the real-time path panics: every failure is a value the
/// caller can retry, drop or surface as a diagnostic.
#[derive(Error, Debug)]
pub enum Error {
    /// Every wait node in the pool is already in use.
    #[error("Wait pool exhausted ({capacity} nodes in use)")]
    ResourceExhausted { capacity: usize },

    /// An event ring was full and the event was not queued.
    #[error("Event ring '{ring}' is full")]
    RingFull { ring: &'static str },

    /// A duration, beat count or other argument was out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A timer id outside the configured slot range.
    #[error("Unknown timer id {0}")]
    UnknownTimer(usize),

    /// The script-to-real-time command queue is full.
    #[error("Command queue is full")]
    CommandQueueFull,

    /// The other side of a queue has been dropped.
    #[error("Real-time core disconnected")]
    Disconnected,

    /// Configuration file error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
