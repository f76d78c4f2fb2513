//! Core types for the RIGOL oscilloscope PV server.
//!
//! - [`pv`]: typed, timestamped process variables backed by watch channels
//! - [`registry`]: PV definitions, the per-device registry and the put queue
//! - [`state`]: the `server` PV state machine
//! - [`config`]: layered configuration (defaults, TOML, environment, CLI)
//! - [`logging`]: tracing subscriber with a runtime-adjustable level
//! - [`error`]: error types

pub mod config;
pub mod error;
pub mod logging;
pub mod pv;
pub mod registry;
pub mod state;

pub use error::{ConfigError, PvError, PvResult};
pub use pv::{Access, Alarm, Pv, PvKind, PvMeta, PvValue, Sample, Severity};
pub use registry::{framework_defs, PublishMode, PutRequest, PvDef, PvRegistry};
pub use state::{ServerCommand, ServerControl, ServerState, Transition};
