//! Command-line entry point of the RIGOL scope server.
//!
//! Connects to the scope (or a simulated one with `--mock`), serves its
//! settings and waveforms as PVs through the gateway and runs the
//! acquisition loop until the `server` PV is set to `Exit` or Ctrl-C.
//!
//! ```bash
//! rigol-scope-server -r TCPIP::192.168.27.31::5555::SOCKET -c 2
//! rigol-scope-server --mock -v
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use scope_core::config::{ConfigOverrides, ServerConfig};
use scope_core::logging;
use scope_core::ServerCommand;
use scope_driver_rigol::resource::ResourceKind;
use scope_driver_rigol::{
    Catalogue, DriverOptions, MockScope, Resource, RigolScope, Runner, RunnerOptions, ScpiClient,
    ScpiTransport,
};
use scope_server::Gateway;
use std::path::PathBuf;
use std::sync::Arc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "rigol-scope-server", version = VERSION)]
#[command(about = "Serve a RIGOL oscilloscope as process variables", long_about = None)]
struct Cli {
    /// Number of channels to serve
    #[arg(short, long)]
    channels: Option<usize>,

    /// Device name, the PV prefix is <device><index>:
    #[arg(short, long)]
    device: Option<String>,

    /// Device index
    #[arg(short, long)]
    index: Option<String>,

    /// Resource string, e.g. TCPIP::192.168.27.31::INSTR
    #[arg(short, long)]
    resource: Option<String>,

    /// Show more details (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Gateway listen address
    #[arg(long)]
    listen: Option<String>,

    /// Serve a simulated scope
    #[arg(long)]
    mock: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            device: self.device.clone(),
            index: self.index.clone(),
            channels: self.channels,
            resource: self.resource.clone(),
            listen: self.listen.clone(),
            verbose: (self.verbose > 0).then_some(self.verbose),
            mock: self.mock.then_some(true),
        }
    }
}

/// The resource is checked even with `--mock`, since `visaResource` shows it.
fn resource_of(config: &ServerConfig) -> Result<Resource> {
    config
        .resource
        .parse()
        .with_context(|| format!("invalid resource '{}'", config.resource))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(cli.config.as_deref(), &cli.overrides())
        .context("invalid configuration")?;
    let log = logging::init(config.verbose)?;
    tracing::info!("rigol-scope-server {} serving {}", VERSION, config.prefix());
    let resource = resource_of(&config)?;

    let catalogue = Catalogue::build(&config.resource, config.channels);
    let registry = Arc::new(catalogue.registry(
        &config.prefix(),
        VERSION,
        config.sleep_s,
        config.verbose,
    )?);

    let transport: Arc<dyn ScpiTransport> = if config.mock {
        tracing::info!("Serving a simulated scope");
        Arc::new(MockScope::new().with_auto_trigger())
    } else {
        Arc::new(ScpiClient::connect(&resource, config.timeout()).await?)
    };

    let mut scope = RigolScope::new(
        transport,
        Arc::clone(&registry),
        catalogue.setters(),
        DriverOptions {
            channels: config.channels,
            error_count_limit: config.error_count_limit,
        },
    );
    if let Err(e) = scope.init().await {
        if !config.mock && resource.kind == ResourceKind::Socket && e.is_timeout() {
            tracing::error!(
                "No answer to *IDN? over the raw socket. \
                 Disable the VXI-11 server on the scope or use an INSTR resource."
            );
        }
        return Err(e).context("cannot initialize the scope");
    }

    let gateway = Gateway::bind(&config.listen, Arc::clone(&registry)).await?;
    let gateway = tokio::spawn(gateway.run());

    let mut runner = Runner::new(
        scope,
        RunnerOptions {
            periodic_update: config.periodic_update(),
            log: Some(log),
        },
    )?;
    runner.command(ServerCommand::Start).await?;
    let result = runner
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    gateway.abort();
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "rigol-scope-server",
            "-c",
            "2",
            "-r",
            "TCPIP::10.0.0.5::5555::SOCKET",
            "-vv",
            "--mock",
        ]);
        let overrides = cli.overrides();
        assert_eq!(overrides.channels, Some(2));
        assert_eq!(overrides.verbose, Some(2));
        assert_eq!(overrides.mock, Some(true));
        assert_eq!(overrides.device, None);
    }

    #[test]
    fn test_resource_is_checked_with_mock() {
        let mut config = ServerConfig {
            mock: true,
            ..Default::default()
        };
        assert!(resource_of(&config).is_ok());
        config.resource = "USB0::0x1AB1::0x04CE::INSTR".into();
        let err = resource_of(&config).unwrap_err();
        assert!(err.to_string().contains("USB0::0x1AB1"));
    }

    #[test]
    fn test_unset_flags_leave_config_alone() {
        let cli = Cli::parse_from(["rigol-scope-server"]);
        let overrides = cli.overrides();
        assert_eq!(overrides.verbose, None);
        assert_eq!(overrides.mock, None);
    }
}
