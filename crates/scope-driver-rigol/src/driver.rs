//! RIGOL oscilloscope driver
//!
//! [`RigolScope`] owns the instrument connection and publishes through the
//! shared [`PvRegistry`]. Only the acquisition loop calls into it, so every
//! method runs with exclusive access to the instrument and multi-command
//! sequences such as STOP / read waveforms / RUN cannot interleave with
//! client puts.
//!
//! ## Acquisition cycle
//!
//! 1. [`RigolScope::detect_trigger`] polls `:TRIGger:STATus?`
//! 2. on `TD`, [`RigolScope::acquire_waveforms`] stops the scope, reads the
//!    preamble and WORD data of every displayed channel, publishes waveform,
//!    mean and peak-to-peak, then restarts the scope
//! 3. [`RigolScope::periodic_update`] refreshes the horizontal scale, channel
//!    display flags and trigger level about once a second
//!
//! Requests to change the server state (scope stopped externally, repeated
//! timeouts) are queued and collected by the loop with
//! [`RigolScope::take_server_request`].

use crate::catalogue::Setter;
use crate::command::{abbreviate, combined_query, is_excluded_from_settings, is_query, split_reply};
use crate::error::{DriverError, Result, ScpiError};
use crate::scpi::ScpiTransport;
use crate::waveform::{Horizontal, Preamble, Stats};
use chrono::{DateTime, Utc};
use scope_core::pv::PvValue;
use scope_core::registry::{PublishMode, PutRequest, PvRegistry};
use scope_core::state::{ServerCommand, ServerState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Status polls while waiting for the scope to run again.
pub const READY_ATTEMPTS: usize = 5;

/// Pause between those polls.
pub const READY_INTERVAL: Duration = Duration::from_millis(100);

const TRIGGER_STATUS: &str = ":TRIGger:STATus?";
const CONFIGURE_TRANSFER: &str = ":WAV:FORM WORD;:WAV:MODE RAW;:SAVE:OVERlap ON";
const SETUP_IDLE: &str = "Setup";

/// Driver tuning.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Number of channels served.
    pub channels: usize,
    /// Consecutive failures of one kind tolerated before exiting.
    pub error_count_limit: u32,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            channels: 4,
            error_count_limit: 2,
        }
    }
}

/// Seconds spent in the stages of the last acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timing {
    /// Trigger status query that saw the trigger.
    pub trigger_detection: f64,
    /// Whole acquisition, STOP to ready.
    pub acquire_wf: f64,
    /// Source selection and preamble, summed over channels.
    pub preamble: f64,
    /// Waveform data transfer, summed over channels.
    pub query_wf: f64,
    /// Conversion and publishing, summed over channels.
    pub publish_wf: f64,
}

impl Timing {
    /// Values in publishing order, rounded to microseconds.
    pub fn to_vec(&self) -> Vec<f64> {
        [
            self.trigger_detection,
            self.acquire_wf,
            self.preamble,
            self.query_wf,
            self.publish_wf,
        ]
        .iter()
        .map(|v| (v * 1e6).round() / 1e6)
        .collect()
    }
}

enum Outcome {
    Written,
    Reply(String),
    Failed,
}

/// Driver of one RIGOL scope.
pub struct RigolScope {
    transport: Arc<dyn ScpiTransport>,
    registry: Arc<PvRegistry>,
    setters: HashMap<String, Setter>,
    options: DriverOptions,

    settings: Vec<(String, String)>,
    settings_query: String,
    parameters_query: String,
    previous_parameters: Option<String>,

    horizontal: Horizontal,
    enabled_channels: Vec<usize>,
    acquisitions: u64,
    triggers_lost: u64,
    trig_time: DateTime<Utc>,
    timing: Timing,
    error_counts: HashMap<&'static str, u32>,
    server_request: Option<ServerCommand>,
}

impl RigolScope {
    /// Create the driver. Call [`RigolScope::init`] before polling.
    pub fn new(
        transport: Arc<dyn ScpiTransport>,
        registry: Arc<PvRegistry>,
        setters: HashMap<String, Setter>,
        options: DriverOptions,
    ) -> Self {
        let mut headers = vec![
            "WAV:XOR".to_string(),
            "WAV:XINC".to_string(),
            "WAV:POIN".to_string(),
        ];
        headers.extend((1..=options.channels).map(|ch| format!("CHAN{}:DISP", ch)));
        headers.push("TRIG:EDGE:LEV".to_string());

        Self {
            transport,
            registry,
            setters,
            parameters_query: combined_query(&headers),
            options,
            settings: Vec::new(),
            settings_query: String::new(),
            previous_parameters: None,
            horizontal: Horizontal::default(),
            enabled_channels: Vec::new(),
            acquisitions: 0,
            triggers_lost: 0,
            trig_time: Utc::now(),
            timing: Timing::default(),
            error_counts: HashMap::new(),
            server_request: None,
        }
    }

    /// Identify the scope, build the settings query and adopt the settings.
    pub async fn init(&mut self) -> Result<()> {
        self.identify().await?;
        self.make_settings_query().await?;
        self.adopt_local_setting().await
    }

    /// Clear the device, check `*IDN?` and clear the status registers.
    pub async fn identify(&self) -> Result<String> {
        self.transport.clear().await?;
        let idn = self.transport.query("*IDN?").await?;
        tracing::info!("IDN: {}", idn);
        if !idn.starts_with("RIGOL") {
            return Err(DriverError::NotRigol(idn));
        }
        self.transport.write("*CLS").await?;
        Ok(idn)
    }

    /// Collect the short mnemonics of all PVs bound to SCPI and check that
    /// the scope answers each of them.
    pub async fn make_settings_query(&mut self) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let mut settings = Vec::new();
        for name in registry.names() {
            let Some(scpi) = registry.pv(name)?.meta().scpi.as_deref() else {
                continue;
            };
            let short = abbreviate(scpi);
            if is_excluded_from_settings(&short) {
                continue;
            }
            let reply = self
                .transport
                .query(&format!(":{}?", short))
                .await
                .map_err(|source| DriverError::InvalidScpi {
                    pv: name.to_string(),
                    scpi: short.clone(),
                    source,
                })?;
            tracing::trace!("SCPI for PV {}: {}, reply: {}", name, short, reply);
            settings.push((name.to_string(), short));
        }

        let headers: Vec<&str> = settings.iter().map(|(_, s)| s.as_str()).collect();
        self.settings_query = combined_query(&headers);
        self.settings = settings;
        tracing::debug!("settings query: {}", self.settings_query);
        Ok(())
    }

    /// Read all settings at once and post the PVs whose value changed.
    pub async fn adopt_local_setting(&mut self) -> Result<()> {
        tracing::info!("adopting local settings");
        if self.settings.is_empty() {
            return Ok(());
        }
        let reply = self.transport.query(&self.settings_query).await?;
        let values = split_reply(&reply);
        if values.len() != self.settings.len() {
            let l = values.len().min(self.settings.len());
            return Err(DriverError::SettingsMismatch {
                expected: self.settings.len(),
                got: values.len(),
                first_missing: self
                    .settings
                    .get(l)
                    .map_or_else(|| "(extra values)".to_string(), |(pv, _)| pv.clone()),
            });
        }

        let timestamp = Utc::now();
        let mut changed = false;
        for ((name, _), reply) in self.settings.iter().zip(values) {
            let pv = self.registry.pv(name)?;
            let value = match pv.coerce(&PvValue::from(reply)) {
                Ok(v) => v,
                Err(_) if pv.meta().access.discrete => {
                    self.registry
                        .warn(&format!("Scope reports '{}' for {}, not a known choice", reply, name));
                    continue;
                }
                Err(source) => {
                    return Err(DriverError::Conversion {
                        pv: name.clone(),
                        reply: reply.to_string(),
                        source,
                    })
                }
            };
            if pv.current() != value {
                tracing::debug!("posting {}={}", name, value);
                pv.post(value, timestamp)?;
                changed = true;
            }
        }
        if !changed {
            tracing::info!("Local setting did not change.");
        }
        Ok(())
    }

    /// Runs when the server is started: configure the transfer format,
    /// adopt the settings, run the scope.
    pub async fn on_start(&mut self) -> Result<()> {
        tracing::info!("start sequence");
        self.transport.write(CONFIGURE_TRANSFER).await?;
        self.adopt_local_setting().await?;
        self.transport.write(":RUN").await?;
        self.wait_for_ready().await.map(|_| ())
    }

    /// Reset the counters.
    pub fn on_clear(&mut self) -> Result<()> {
        self.triggers_lost = 0;
        self.registry.publish("acqCount", 0i64, PublishMode::Always)?;
        self.registry.publish("lostTrigs", 0i64, PublishMode::Always)?;
        Ok(())
    }

    /// Poll the trigger status until the scope runs. Requests `Stop` if it
    /// is still stopped after [`READY_ATTEMPTS`] polls.
    pub async fn wait_for_ready(&mut self) -> Result<bool> {
        for attempt in 0..READY_ATTEMPTS {
            if self.transport.query(TRIGGER_STATUS).await? != "STOP" {
                return Ok(true);
            }
            if attempt + 1 < READY_ATTEMPTS {
                tokio::time::sleep(READY_INTERVAL).await;
            }
        }
        let waited = READY_INTERVAL.as_secs_f64() * (READY_ATTEMPTS - 1) as f64;
        self.registry.warn(&format!(
            "Scope still stopped {:.1} seconds after acquisition, Server will be stopped",
            waited
        ));
        self.request(ServerCommand::Stop);
        Ok(false)
    }

    /// Refresh horizontal scale, display flags and trigger level if the
    /// scope reports anything new.
    pub async fn update_scope_parameters(&mut self) -> Result<()> {
        let reply = self.transport.query(&self.parameters_query).await?;
        if self.previous_parameters.as_deref() == Some(reply.as_str()) {
            return Ok(());
        }
        self.previous_parameters = Some(reply.clone());
        tracing::info!("Scope parameters changed: {}", reply);

        let channels = self.options.channels;
        let fields = split_reply(&reply);
        let bad = || DriverError::Reply {
            query: self.parameters_query.clone(),
            reply: reply.clone(),
        };
        if fields.len() != channels + 4 {
            return Err(bad());
        }
        let float = |i: usize| fields[i].parse::<f64>().map_err(|_| bad());
        let horizontal = Horizontal {
            xorigin: float(0)?,
            xincrement: float(1)?,
            points: fields[2].parse().map_err(|_| bad())?,
        };
        let level = float(3 + channels)?;

        let now = Utc::now();
        let reg = &self.registry;
        reg.publish_at("tAxis", horizontal.time_axis(), PublishMode::Always, now)?;
        reg.publish_at("recLengthR", horizontal.points as f64, PublishMode::IfChanged, now)?;
        reg.publish_at("timePerDiv", horizontal.time_per_div(), PublishMode::IfChanged, now)?;
        if let Some(rate) = horizontal.sampling_rate() {
            reg.publish_at("samplingRate", rate, PublishMode::IfChanged, now)?;
        }
        let mut enabled = Vec::new();
        for ch in 1..=channels {
            let letter = fields[2 + ch];
            reg.publish_at(&format!("c{:02}OnOff", ch), letter, PublishMode::IfChanged, now)?;
            if letter == "1" {
                enabled.push(ch);
            }
        }
        reg.publish_at("trigLevel", level, PublishMode::IfChanged, now)?;

        self.horizontal = horizontal;
        self.enabled_channels = enabled;
        Ok(())
    }

    /// Check whether the scope triggered.
    ///
    /// Timeouts are counted per kind; the server is asked to exit when a kind
    /// reaches the limit. A lost connection is returned as an error.
    pub async fn detect_trigger(&mut self) -> Result<bool> {
        let start = Instant::now();
        let status = match self.transport.query(TRIGGER_STATUS).await {
            Ok(status) => status,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                self.count_failure(&e);
                return Ok(false);
            }
        };
        self.error_counts.clear();

        if status == "STOP" {
            self.registry.warn("Scope was stopped externally. Server stopped.");
            self.request(ServerCommand::Stop);
        }
        self.registry
            .publish("trigState", status.as_str(), PublishMode::IfChanged)?;

        if !status.starts_with("TD") {
            return Ok(false);
        }
        self.acquisitions += 1;
        self.trig_time = Utc::now();
        self.timing.trigger_detection = start.elapsed().as_secs_f64();
        tracing::debug!("Trigger detected {}", self.acquisitions);
        Ok(true)
    }

    fn count_failure(&mut self, e: &ScpiError) {
        self.registry
            .error(&format!("Transport error in query for trigger: {}", e));
        let label = e.label();
        let count = self.error_counts.entry(label).or_insert(0);
        *count += 1;
        let count = *count;
        let limit = self.options.error_count_limit;
        if count >= limit {
            self.registry.error(&format!(
                "Processing stopped due to {} happened {} times",
                label, limit
            ));
            self.request(ServerCommand::Exit);
        } else {
            self.registry
                .warn(&format!("Exception #{} during processing: {}", count, label));
        }
    }

    /// Read and publish the waveforms of all displayed channels.
    ///
    /// A transport error skips the remaining channels; any other error skips
    /// only the channel it happened on. The scope is restarted either way.
    pub async fn acquire_waveforms(&mut self) -> Result<()> {
        let start = Instant::now();
        tracing::debug!(channels = ?self.enabled_channels, "acquiring waveforms");

        let count = self
            .registry
            .pvv("acqCount")?
            .as_i64()
            .unwrap_or_default()
            + 1;
        self.registry
            .publish_at("acqCount", count, PublishMode::Always, self.trig_time)?;
        self.timing.preamble = 0.0;
        self.timing.query_wf = 0.0;
        self.timing.publish_wf = 0.0;

        // The preamble and data may change while acquiring.
        self.transport.write(":STOP").await?;
        for ch in self.enabled_channels.clone() {
            let mut operation = "getting preamble";
            match self.acquire_channel(ch, &mut operation).await {
                Ok(()) => {}
                Err(e) if e.is_transport() => {
                    self.registry.error(&format!(
                        "Transport error in {} for channel {}: {}",
                        operation, ch, e
                    ));
                    break;
                }
                Err(e) => self.registry.error(&format!(
                    "Exception in {} of channel {}: {}",
                    operation, ch, e
                )),
            }
        }

        self.transport.write(":RUN").await?;
        self.wait_for_ready().await?;
        self.timing.acquire_wf = start.elapsed().as_secs_f64();
        tracing::trace!(timing = ?self.timing, "acquisition done");
        Ok(())
    }

    async fn acquire_channel(&mut self, ch: usize, operation: &mut &'static str) -> Result<()> {
        let ts = Instant::now();
        self.transport
            .write(&format!("WAV:SOURce CHANnel{}", ch))
            .await?;
        let preamble: Preamble = self.transport.query(":WAV:PRE?").await?.parse()?;
        self.timing.preamble += ts.elapsed().as_secs_f64();

        *operation = "getting waveform";
        let ts = Instant::now();
        let raw = self.transport.query_binary(":WAV:DATA?").await?;
        self.timing.query_wf += ts.elapsed().as_secs_f64();

        *operation = "publishing";
        let ts = Instant::now();
        let volts = preamble.to_volts(&raw);
        let stats = Stats::of(&volts);
        let offset = self
            .registry
            .pvv(&format!("c{:02}VoltOffset", ch))?
            .as_f64()
            .unwrap_or_default();
        let shifted: Vec<f64> = volts.iter().map(|v| v + offset).collect();
        let t = self.trig_time;
        let reg = &self.registry;
        reg.publish_at(&format!("c{:02}Waveform", ch), shifted, PublishMode::Always, t)?;
        reg.publish_at(&format!("c{:02}Peak2Peak", ch), stats.peak_to_peak, PublishMode::Always, t)?;
        reg.publish_at(&format!("c{:02}Mean", ch), stats.mean, PublishMode::Always, t)?;
        self.timing.publish_wf += ts.elapsed().as_secs_f64();
        Ok(())
    }

    /// One polling step: detect a trigger and acquire on success.
    pub async fn poll(&mut self) -> Result<()> {
        if self.detect_trigger().await? {
            self.acquire_waveforms().await?;
        }
        Ok(())
    }

    /// Infrequent refresh of scope parameters, lost triggers and timing.
    pub async fn periodic_update(&mut self) -> Result<()> {
        if let Err(e) = self.update_scope_parameters().await {
            self.handle_failure(&e, "in update_scope_parameters").await;
        }
        self.registry.publish(
            "lostTrigs",
            self.triggers_lost,
            PublishMode::IfChanged,
        )?;
        self.registry
            .publish("timing", self.timing.to_vec(), PublishMode::Always)?;
        Ok(())
    }

    /// Report a failed instrument operation and clear the scope's error
    /// queue.
    pub async fn handle_failure(&self, err: &DriverError, location: &str) {
        let msg = if err.is_timeout() {
            "ERR:VI_ERROR_TMO".to_string()
        } else {
            err.to_string()
        };
        self.registry.error(&format!("{}: {}", msg, location));
        if let Err(e) = self.transport.write("*CLS").await {
            tracing::warn!("*CLS after failure: {}", e);
        }
    }

    async fn scope_cmd(&self, cmd: &str) -> Outcome {
        tracing::debug!(">scope_cmd: {}", cmd);
        let result = if is_query(cmd) {
            self.transport.query(cmd).await.map(Outcome::Reply)
        } else {
            self.transport.write(cmd).await.map(|()| Outcome::Written)
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.handle_failure(&e.into(), &format!("in scope_cmd({})", cmd))
                    .await;
                Outcome::Failed
            }
        }
    }

    // =========================================================================
    // Setters
    // =========================================================================

    /// Apply a client put. PVs without a setter are posted as they are.
    pub async fn apply_put(&mut self, put: PutRequest, server: ServerState) -> Result<()> {
        tracing::debug!(pv = %put.name, value = %put.value, "applying put");
        match self.setters.get(&put.name).copied() {
            Some(Setter::Setup) => self.set_setup(&put.value, server).await,
            Some(Setter::InstrCmd) => self.set_instr_cmd(&put.value).await,
            Some(Setter::RecLength) => self.set_rec_length(put.value).await,
            Some(Setter::Trigger) => self.set_trigger(&put.value).await,
            Some(Setter::Scpi) => self.set_scpi(&put.name, put.value).await,
            None => {
                self.registry.publish(&put.name, put.value, PublishMode::Always)?;
                Ok(())
            }
        }
    }

    async fn set_setup(&mut self, value: &PvValue, server: ServerState) -> Result<()> {
        let action_slot = value.to_string();
        if action_slot == SETUP_IDLE {
            return Ok(());
        }
        let file = match action_slot.split_once(' ') {
            Some((_, "latest")) => "C:/latest.stp",
            Some((_, "oper")) => "C:/operational.stp",
            _ => {
                self.registry
                    .warn(&format!("Unknown setup action '{}'", action_slot));
                self.reset_setup()?;
                return Ok(());
            }
        };
        let recall = action_slot.starts_with("Recall");

        let (command, status) = if recall {
            if server == ServerState::Started {
                self.registry.warn("Please set server to Stop before Recalling");
                self.reset_setup()?;
                return Ok(());
            }
            (
                format!("LOAD:SETUp {}", file),
                format!("Setup was recalled from {}", file),
            )
        } else {
            (
                format!("SAVE:SETup {}", file),
                format!("Setup was saved to {}", file),
            )
        };

        let outcome = self.scope_cmd(&command).await;
        self.reset_setup()?;
        if matches!(outcome, Outcome::Failed) {
            return Ok(());
        }
        self.registry.post_status(status);
        if recall {
            if let Err(e) = self.adopt_local_setting().await {
                self.handle_failure(&e, "in adopt_local_setting").await;
            }
        }
        Ok(())
    }

    fn reset_setup(&self) -> Result<()> {
        self.registry
            .publish("setup", SETUP_IDLE, PublishMode::Always)?;
        Ok(())
    }

    async fn set_instr_cmd(&mut self, value: &PvValue) -> Result<()> {
        let cmd = value.to_string();
        self.registry.publish("instrCmdR", "", PublishMode::Always)?;
        if let Outcome::Reply(reply) = self.scope_cmd(&cmd).await {
            self.registry.publish("instrCmdR", reply, PublishMode::Always)?;
        }
        self.registry.publish("instrCmdS", cmd, PublishMode::Always)?;
        Ok(())
    }

    async fn set_rec_length(&mut self, value: PvValue) -> Result<()> {
        self.scope_cmd(&format!("ACQuire:MDEPth {}", value)).await;
        self.registry.publish("recLengthS", value, PublishMode::Always)?;
        if let Err(e) = self.update_scope_parameters().await {
            self.handle_failure(&e, "in update_scope_parameters").await;
        }
        Ok(())
    }

    async fn set_trigger(&mut self, value: &PvValue) -> Result<()> {
        if value.as_str() == Some("Force!") {
            self.scope_cmd("TFORce").await;
            self.registry.publish("trigger", "Trigger", PublishMode::Always)?;
        }
        Ok(())
    }

    async fn set_scpi(&mut self, name: &str, value: PvValue) -> Result<()> {
        let meta = self.registry.pv(name)?.meta().clone();
        let Some(scpi) = meta.scpi else {
            self.registry.error(&format!("No SCPI defined for PV {}", name));
            return Ok(());
        };
        let cmd = if meta.access.writable {
            format!("{} {}", scpi, value)
        } else {
            format!("{}?", scpi)
        };
        if let Outcome::Reply(reply) = self.scope_cmd(&cmd).await {
            if let Err(e) = self.registry.publish(name, reply, PublishMode::Always) {
                tracing::warn!("reply to {} not posted: {}", cmd, e);
            }
        }
        self.registry.publish(name, value, PublishMode::Always)?;
        Ok(())
    }

    // =========================================================================
    // State
    // =========================================================================

    fn request(&mut self, command: ServerCommand) {
        if self.server_request != Some(ServerCommand::Exit) {
            self.server_request = Some(command);
        }
    }

    /// Server state change requested by the driver since the last call.
    pub fn take_server_request(&mut self) -> Option<ServerCommand> {
        self.server_request.take()
    }

    /// Channels read on each trigger.
    pub fn enabled_channels(&self) -> &[usize] {
        &self.enabled_channels
    }

    /// Horizontal scale of the current record.
    pub fn horizontal(&self) -> Horizontal {
        self.horizontal
    }

    /// Timing of the last acquisition.
    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Triggers detected since start.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions
    }

    /// Combined query reading every SCPI-bound PV.
    pub fn settings_query(&self) -> &str {
        &self.settings_query
    }

    /// Registry the driver publishes to.
    pub fn registry(&self) -> &Arc<PvRegistry> {
        &self.registry
    }
}
