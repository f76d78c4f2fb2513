//! Error types shared by the PV store, configuration and logging layers.
//!
//! The driver and gateway crates wrap these in their own error enums; the
//! binary works with `anyhow` at the top level.

use crate::pv::PvKind;
use thiserror::Error;

/// Result alias for PV operations.
pub type PvResult<T> = std::result::Result<T, PvError>;

/// Errors raised by process-variable lookups, posts and client puts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PvError {
    /// No PV with this name exists in the registry.
    #[error("Unknown PV '{0}'")]
    UnknownPv(String),

    /// Two definitions produced the same PV name.
    #[error("Duplicate PV definition '{0}'")]
    Duplicate(String),

    /// A client tried to write a PV that has no `W` feature.
    #[error("PV '{0}' is read-only")]
    ReadOnly(String),

    /// The value cannot be converted to the kind of the PV.
    #[error("PV '{name}' expects {expected}, got {got}")]
    TypeMismatch {
        /// PV name.
        name: String,
        /// Kind of the PV.
        expected: PvKind,
        /// Offered value.
        got: String,
    },

    /// The value is not one of the choices of a discrete PV.
    #[error("'{value}' is not a legal value of PV '{name}', choices: {choices:?}")]
    IllegalChoice {
        /// PV name.
        name: String,
        /// Offered value.
        value: String,
        /// Legal choices.
        choices: Vec<String>,
    },

    /// The value lies outside the control limits.
    #[error("PV '{name}': {value} is outside the limits [{low}, {high}]")]
    OutOfRange {
        /// PV name.
        name: String,
        /// Offered value.
        value: f64,
        /// Lower control limit.
        low: f64,
        /// Upper control limit.
        high: f64,
    },

    /// NaN or infinity offered to a numeric PV by a client.
    #[error("PV '{0}' does not accept non-finite values")]
    NonFinite(String),

    /// The driver side of the put queue has gone away.
    #[error("Put queue is closed, the driver is not running")]
    PutQueueClosed,
}

/// Errors raised while loading or validating the server configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A provider (TOML file, environment) failed to parse or extract.
    #[error("Configuration error: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Values parsed but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}
