//! RIGOL oscilloscope driver
//!
//! Serves a RIGOL DS1000Z-class scope as process variables:
//!
//! - [`resource`]: VISA-style resource strings
//! - [`scpi`]: SCPI transport over TCP with IEEE-488.2 binary blocks
//! - [`mock`]: simulated scope for tests and demos
//! - [`catalogue`]: the PVs served per scope and channel
//! - [`driver`]: settings read-back, trigger detection, waveform acquisition
//!   and client setters
//! - [`runner`]: the acquisition loop
//!
//! # Example
//!
//! ```no_run
//! use scope_driver_rigol::{Catalogue, DriverOptions, MockScope, RigolScope, Runner, RunnerOptions};
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let catalogue = Catalogue::build("TCPIP::192.168.27.31::INSTR", 2);
//! let registry = Arc::new(catalogue.registry("rigol0:", "v0.1.0", 0.1, 0)?);
//! let options = DriverOptions { channels: 2, ..Default::default() };
//! let mut scope = RigolScope::new(
//!     Arc::new(MockScope::new().with_auto_trigger()),
//!     registry,
//!     catalogue.setters(),
//!     options,
//! );
//! scope.init().await?;
//! let mut runner = Runner::new(scope, RunnerOptions::default())?;
//! runner.command(scope_core::ServerCommand::Start).await?;
//! runner.run(tokio::time::sleep(std::time::Duration::from_secs(60))).await?;
//! # Ok(())
//! # }
//! ```

pub mod catalogue;
pub mod command;
pub mod driver;
pub mod error;
pub mod mock;
pub mod resource;
pub mod runner;
pub mod scpi;
pub mod waveform;

pub use catalogue::{Catalogue, Setter};
pub use driver::{DriverOptions, RigolScope, Timing};
pub use error::{DriverError, ScpiError};
pub use mock::{Fault, MockScope};
pub use resource::Resource;
pub use runner::{Runner, RunnerOptions};
pub use scpi::{ScpiClient, ScpiTransport};
