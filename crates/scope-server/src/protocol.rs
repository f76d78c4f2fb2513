//! Wire format of the PV gateway.
//!
//! One JSON object per line in each direction. Requests are tagged by `op`;
//! every response carries `ok`, plus `error` on failure or the payload of
//! the request on success.

use scope_core::pv::{PvMeta, PvValue, Sample};
use serde::{Deserialize, Serialize};

/// A client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Request {
    /// Names of every PV served.
    List,
    /// Static description of a PV.
    Info { pv: String },
    /// Latest sample of a PV.
    Get { pv: String },
    /// Write a PV. Answered once the put is queued for the acquisition loop.
    Put { pv: String, value: PvValue },
    /// Stream every new sample of a PV until the connection closes.
    Monitor { pv: String },
}

/// A gateway response or monitor update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// Whether the request succeeded.
    pub ok: bool,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// PV the response refers to, as named by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pv: Option<String>,
    /// Full names, for `list`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,
    /// Metadata, for `info`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<PvMeta>,
    /// Sample, for `get` and monitor updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Sample>,
}

impl Response {
    /// Bare acknowledgement.
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    /// Failure with its reason.
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(msg.into()),
            ..Default::default()
        }
    }

    /// Answer to `list`.
    pub fn names(names: Vec<String>) -> Self {
        Self {
            names: Some(names),
            ..Self::ok()
        }
    }

    /// Answer to `info`.
    pub fn meta(pv: &str, meta: PvMeta) -> Self {
        Self {
            pv: Some(pv.to_string()),
            meta: Some(meta),
            ..Self::ok()
        }
    }

    /// Answer to `get`, or a monitor update.
    pub fn sample(pv: &str, sample: Sample) -> Self {
        Self {
            pv: Some(pv.to_string()),
            sample: Some(sample),
            ..Self::ok()
        }
    }

    /// Encode as one line, terminator included.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
