//! PV definitions and the registry that owns every PV of one device.
//!
//! The registry is the publishing side of the server: the driver posts
//! samples through it, and network clients read, monitor and put through it.
//! Client puts never touch the instrument directly. They are validated here
//! and queued as [`PutRequest`]s for the acquisition loop, which owns the
//! instrument connection and applies them between polls.

use crate::error::{PvError, PvResult};
use crate::pv::{Access, Pv, PvMeta, PvValue};
use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Placeholder for the channel number in template names and mnemonics.
pub const CHANNEL_PLACEHOLDER: &str = "<n>";

/// Shortest polling pause a client may set, seconds.
pub const MIN_SLEEP_S: f64 = 0.001;

/// Choices of the `server` PV: commands first, then the states they lead to.
pub const SERVER_CHOICES: [&str; 7] = [
    "Start", "Stop", "Clear", "Exit", "Started", "Stopped", "Exited",
];

// =============================================================================
// PvDef
// =============================================================================

/// Declarative definition of a PV, expanded into a [`Pv`] by the registry.
#[derive(Debug, Clone)]
pub struct PvDef {
    meta: PvMeta,
    initial: PvValue,
}

impl PvDef {
    /// Define a PV from its initial value and feature string (`"R"`, `"W"`,
    /// `"WD"`, `"A"`...).
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        initial: impl Into<PvValue>,
        features: &str,
    ) -> Self {
        Self {
            meta: PvMeta::new(name, description, Access::parse(features)),
            initial: initial.into(),
        }
    }

    /// Define a discrete PV. The first choice is the initial value.
    pub fn choices(
        name: impl Into<String>,
        description: impl Into<String>,
        choices: &[&str],
        features: &str,
    ) -> Self {
        let mut def = Self::new(name, description, PvValue::choices(choices), features);
        def.meta.access.discrete = true;
        def
    }

    /// Attach engineering units.
    pub fn with_units(mut self, units: &str) -> Self {
        self.meta = self.meta.with_units(units);
        self
    }

    /// Bind a long-form SCPI mnemonic, e.g. `TIMebase:SCALe`.
    pub fn with_scpi(mut self, scpi: &str) -> Self {
        self.meta.scpi = Some(scpi.to_string());
        self
    }

    /// Attach control limits.
    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.meta = self.meta.with_limits(low, high);
        self
    }

    /// Attach value-alarm limits.
    pub fn with_alarm(mut self, low: f64, high: f64) -> Self {
        self.meta = self.meta.with_alarm(low, high);
        self
    }

    /// Name without the device prefix.
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Metadata of the PV to be created.
    pub fn meta(&self) -> &PvMeta {
        &self.meta
    }

    /// Initial value.
    pub fn initial(&self) -> &PvValue {
        &self.initial
    }

    /// True if the name contains the channel placeholder.
    pub fn is_channel_template(&self) -> bool {
        self.meta.name.contains(CHANNEL_PLACEHOLDER)
    }

    /// Instantiate a channel template for channel `channel` (1-based).
    ///
    /// The name gets a two-digit channel number (`c<n>OnOff` → `c01OnOff`),
    /// the SCPI mnemonic gets the plain number (`CHANnel<n>` → `CHANnel1`).
    pub fn for_channel(&self, channel: usize) -> Self {
        let mut def = self.clone();
        def.meta.name = self
            .meta
            .name
            .replace(CHANNEL_PLACEHOLDER, &format!("{:02}", channel));
        def.meta.scpi = self
            .meta
            .scpi
            .as_ref()
            .map(|s| s.replace(CHANNEL_PLACEHOLDER, &channel.to_string()));
        def
    }

    fn into_pv(self) -> Pv {
        Pv::new(self.meta, self.initial)
    }
}

/// Definitions of the PVs every device server carries.
pub fn framework_defs(version: &str, sleep_s: f64, verbose: u8) -> Vec<PvDef> {
    vec![
        PvDef::new("version", "Program version", version, "R"),
        PvDef::new("status", "Server status", "", "R"),
        PvDef::new(
            "server",
            "Server control",
            PvValue::Enum {
                choices: SERVER_CHOICES.iter().map(|c| (*c).to_string()).collect(),
                index: 5,
            },
            "WD",
        ),
        PvDef::new("sleep", "Pause between polling cycles", sleep_s, "W")
            .with_units("S")
            .with_limits(MIN_SLEEP_S, 60.0),
        PvDef::new("cycle", "Polling cycle counter", 0i64, "R"),
        PvDef::new("verbose", "Log verbosity: 0 info, 1 debug, 2 trace", i64::from(verbose), "W")
            .with_limits(0.0, 3.0),
    ]
}

// =============================================================================
// Registry
// =============================================================================

/// How [`PvRegistry::publish`] treats an unchanged value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Always post a new sample.
    Always,
    /// Post only if the value differs from the current one.
    IfChanged,
}

/// A validated client write waiting to be applied by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct PutRequest {
    /// PV name without the device prefix.
    pub name: String,
    /// Value already converted to the PV's kind.
    pub value: PvValue,
    /// When the put was received.
    pub received: DateTime<Utc>,
}

/// All PVs of one device, addressed by name with or without the prefix.
pub struct PvRegistry {
    prefix: String,
    order: Vec<String>,
    pvs: HashMap<String, Pv>,
    put_tx: mpsc::UnboundedSender<PutRequest>,
    put_rx: Mutex<Option<mpsc::UnboundedReceiver<PutRequest>>>,
}

impl std::fmt::Debug for PvRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PvRegistry")
            .field("prefix", &self.prefix)
            .field("count", &self.order.len())
            .finish_non_exhaustive()
    }
}

impl PvRegistry {
    /// Build the registry. Definition order is preserved; channel templates
    /// must be expanded by the caller.
    pub fn new(prefix: impl Into<String>, defs: impl IntoIterator<Item = PvDef>) -> PvResult<Self> {
        let (put_tx, put_rx) = mpsc::unbounded_channel();
        let mut order = Vec::new();
        let mut pvs = HashMap::new();
        for def in defs {
            let name = def.name().to_string();
            if pvs.contains_key(&name) {
                return Err(PvError::Duplicate(name));
            }
            tracing::trace!(pv = %name, value = ?def.initial(), "creating PV");
            pvs.insert(name.clone(), def.into_pv());
            order.push(name);
        }
        Ok(Self {
            prefix: prefix.into(),
            order,
            pvs,
            put_tx,
            put_rx: Mutex::new(Some(put_rx)),
        })
    }

    /// Device prefix, e.g. `rigol0:`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// PV names without prefix, in definition order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Full network name of a PV.
    pub fn full_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Look up a PV by name without prefix.
    pub fn pv(&self, name: &str) -> PvResult<&Pv> {
        self.pvs
            .get(name)
            .ok_or_else(|| PvError::UnknownPv(name.to_string()))
    }

    /// Current value of a PV.
    pub fn pvv(&self, name: &str) -> PvResult<PvValue> {
        self.pv(name).map(Pv::current)
    }

    /// Look up a PV by its full network name.
    ///
    /// Names without the prefix are accepted too.
    pub fn resolve(&self, full_name: &str) -> PvResult<&Pv> {
        let name = full_name.strip_prefix(&self.prefix).unwrap_or(full_name);
        self.pv(name)
            .map_err(|_| PvError::UnknownPv(full_name.to_string()))
    }

    /// Publish a value stamped now. Returns whether a sample was posted.
    pub fn publish(&self, name: &str, value: impl Into<PvValue>, mode: PublishMode) -> PvResult<bool> {
        self.publish_at(name, value, mode, Utc::now())
    }

    /// Publish a value with an explicit timestamp.
    pub fn publish_at(
        &self,
        name: &str,
        value: impl Into<PvValue>,
        mode: PublishMode,
        timestamp: DateTime<Utc>,
    ) -> PvResult<bool> {
        let pv = self.pv(name)?;
        match mode {
            PublishMode::Always => pv.post(value.into(), timestamp).map(|()| true),
            PublishMode::IfChanged => pv.post_if_changed(value.into(), timestamp),
        }
    }

    /// Validate a client write and queue it for the driver.
    pub fn request_put(&self, full_name: &str, value: PvValue) -> PvResult<()> {
        let pv = self.resolve(full_name)?;
        let value = pv.validate_put(&value)?;
        tracing::debug!(pv = pv.name(), %value, "put queued");
        self.put_tx
            .send(PutRequest {
                name: pv.name().to_string(),
                value,
                received: Utc::now(),
            })
            .map_err(|_| PvError::PutQueueClosed)
    }

    /// Take the receiving end of the put queue. Only the first call succeeds.
    pub fn take_put_receiver(&self) -> Option<mpsc::UnboundedReceiver<PutRequest>> {
        self.put_rx.lock().take()
    }

    /// Log a warning and post it to the `status` PV.
    pub fn warn(&self, msg: &str) {
        tracing::warn!("{}", msg);
        self.post_status(format!("WAR_@{}: {}", Local::now().format("%m%d:%H%M%S"), msg));
    }

    /// Log an error and post it to the `status` PV.
    pub fn error(&self, msg: &str) {
        tracing::error!("{}", msg);
        self.post_status(format!("ERR_@{}: {}", Local::now().format("%m%d:%H%M%S"), msg));
    }

    /// Post a plain line to the `status` PV.
    pub fn post_status(&self, line: impl Into<String>) {
        if let Err(e) = self.publish("status", line.into(), PublishMode::Always) {
            tracing::error!("cannot post status: {}", e);
        }
    }
}
