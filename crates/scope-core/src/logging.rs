//! Tracing setup
//!
//! Structured logging through `tracing` with a `tracing-subscriber` fmt layer.
//! The level filter sits behind a reload layer so that the `verbose` PV can
//! change it while the server runs. `RUST_LOG`, when set, takes precedence
//! over the configured verbosity at startup.
//!
//! # Example
//! ```no_run
//! let logs = scope_core::logging::init(1)?;
//! tracing::debug!("visible at verbosity 1");
//! logs.set_verbosity(0)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

/// Map a verbosity count to a filter directive.
pub fn verbosity_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Handle to the live level filter.
#[derive(Clone)]
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl std::fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle").finish_non_exhaustive()
    }
}

impl LogHandle {
    /// Replace the level filter.
    pub fn set_verbosity(&self, verbose: u8) -> Result<()> {
        self.handle
            .reload(EnvFilter::new(verbosity_directive(verbose)))
            .map_err(|e| anyhow!("Failed to change log level: {}", e))?;
        tracing::info!("log verbosity set to {}", verbose);
        Ok(())
    }
}

/// Install the global subscriber.
///
/// Calling this twice is not an error. The second subscriber is dropped, so
/// its handle fails on reload.
pub fn init(verbose: u8) -> Result<LogHandle> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_directive(verbose)));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let fmt_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_thread_names(true);

    if let Err(e) = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
    {
        if !e
            .to_string()
            .contains("a global default trace dispatcher has already been set")
        {
            return Err(anyhow!("Failed to initialize tracing: {}", e));
        }
    }

    Ok(LogHandle { handle })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_directive() {
        assert_eq!(verbosity_directive(0), "info");
        assert_eq!(verbosity_directive(1), "debug");
        assert_eq!(verbosity_directive(2), "trace");
        assert_eq!(verbosity_directive(9), "trace");
    }

    #[test]
    fn test_init_twice() {
        assert!(init(0).is_ok());
        assert!(init(2).is_ok());
    }
}
