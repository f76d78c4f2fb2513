//! Acquisition loop
//!
//! The runner is the single task that talks to the instrument. Each cycle it
//! applies queued client puts, polls the scope while the server is started,
//! counts the cycle and then sleeps for the `sleep` PV period. Puts arriving
//! during the sleep are applied at once. A periodic update refreshes the
//! slow-changing scope parameters.

use crate::driver::RigolScope;
use anyhow::{anyhow, Result};
use scope_core::logging::LogHandle;
use scope_core::registry::{PublishMode, PutRequest, PvRegistry};
use scope_core::state::{ServerCommand, ServerControl, Transition};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Runner settings.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Period of [`RigolScope::periodic_update`].
    pub periodic_update: Duration,
    /// Live log filter driven by the `verbose` PV.
    pub log: Option<LogHandle>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            periodic_update: Duration::from_secs(1),
            log: None,
        }
    }
}

/// Drives a [`RigolScope`] until the server exits.
pub struct Runner {
    scope: RigolScope,
    registry: Arc<PvRegistry>,
    control: ServerControl,
    puts: mpsc::UnboundedReceiver<PutRequest>,
    options: RunnerOptions,
    cycle: i64,
}

impl Runner {
    /// Take over the scope and the registry's put queue.
    pub fn new(scope: RigolScope, options: RunnerOptions) -> Result<Self> {
        let registry = Arc::clone(scope.registry());
        let puts = registry
            .take_put_receiver()
            .ok_or_else(|| anyhow!("put queue of {} is already taken", registry.prefix()))?;
        Ok(Self {
            scope,
            registry,
            control: ServerControl::new(),
            puts,
            options,
            cycle: 0,
        })
    }

    /// Server state control.
    pub fn control(&self) -> &ServerControl {
        &self.control
    }

    /// The driven scope.
    pub fn scope(&self) -> &RigolScope {
        &self.scope
    }

    /// Apply a server command and run what the transition requires.
    pub async fn command(&mut self, command: ServerCommand) -> Result<()> {
        let transition = self.control.apply(command, &self.registry)?;
        match transition {
            Transition::Start => {
                if let Err(e) = self.scope.on_start().await {
                    self.scope.handle_failure(&e, "in start sequence").await;
                }
            }
            Transition::Clear => self.scope.on_clear()?,
            Transition::Stop | Transition::Exit | Transition::None => {}
        }
        self.follow_driver_requests().await
    }

    async fn follow_driver_requests(&mut self) -> Result<()> {
        while let Some(command) = self.scope.take_server_request() {
            let transition = self.control.apply(command, &self.registry)?;
            if transition == Transition::Start {
                if let Err(e) = self.scope.on_start().await {
                    self.scope.handle_failure(&e, "in start sequence").await;
                }
            }
        }
        Ok(())
    }

    /// Apply one client put.
    pub async fn apply_put(&mut self, put: PutRequest) -> Result<()> {
        match put.name.as_str() {
            "server" => match put.value.as_str().and_then(ServerCommand::parse) {
                Some(command) => self.command(command).await?,
                None => self
                    .registry
                    .warn(&format!("Unknown server command '{}'", put.value)),
            },
            "verbose" => {
                let level = put.value.as_i64().unwrap_or_default().clamp(0, 255) as u8;
                self.registry
                    .publish("verbose", put.value, PublishMode::Always)?;
                if let Some(log) = &self.options.log {
                    log.set_verbosity(level)?;
                }
            }
            "sleep" => {
                self.registry.publish("sleep", put.value, PublishMode::Always)?;
            }
            _ => {
                let name = put.name.clone();
                if let Err(e) = self.scope.apply_put(put, self.control.state()).await {
                    self.registry
                        .error(&format!("Put to {} failed: {}", name, e));
                }
                self.follow_driver_requests().await?;
            }
        }
        Ok(())
    }

    fn sleep_period(&self) -> Duration {
        self.registry
            .pvv("sleep")
            .ok()
            .and_then(|v| v.as_f64())
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map_or(Duration::from_millis(100), Duration::from_secs_f64)
    }

    async fn poll(&mut self) -> Result<()> {
        if let Err(e) = self.scope.poll().await {
            if e.is_fatal() {
                self.registry
                    .error(&format!("Lost connection to the scope: {}", e));
                self.command(ServerCommand::Exit).await?;
            } else {
                self.scope.handle_failure(&e, "in poll").await;
            }
        }
        self.follow_driver_requests().await
    }

    /// Run until the server exits or `shutdown` completes.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut shutdown_seen = false;
        let mut last_update: Option<Instant> = None;

        tracing::info!(
            "Server for {} running. Sleeping per cycle: {:?}",
            self.registry.prefix(),
            self.sleep_period()
        );

        loop {
            while let Ok(put) = self.puts.try_recv() {
                self.apply_put(put).await?;
            }
            if self.control.is_exited() {
                break;
            }

            if self.control.is_started() {
                self.poll().await?;
            }

            self.cycle += 1;
            self.registry
                .publish("cycle", self.cycle, PublishMode::Always)?;

            if last_update.map_or(true, |t| t.elapsed() >= self.options.periodic_update) {
                last_update = Some(Instant::now());
                self.scope.periodic_update().await?;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.sleep_period()) => {}
                Some(put) = self.puts.recv() => self.apply_put(put).await?,
                _ = &mut shutdown, if !shutdown_seen => {
                    shutdown_seen = true;
                    tracing::info!("shutdown requested");
                    self.command(ServerCommand::Exit).await?;
                }
            }
        }

        tracing::info!("Server is exited");
        Ok(())
    }
}
