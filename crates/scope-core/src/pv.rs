//! Process Variables
//!
//! A process variable (PV) is a named, typed value that is republished to all
//! subscribers whenever the server posts a new sample. Each PV is backed by a
//! `tokio::sync::watch` channel, so every subscriber always sees the latest
//! sample and slow subscribers never block the acquisition loop.
//!
//! # Kinds
//!
//! The kind of a PV is fixed by its initial value:
//!
//! | kind | initial value | example |
//! |------|---------------|---------|
//! | `Bool` | `true` | |
//! | `Int` | `0` | `acqCount` |
//! | `Float` | `0.0` | `samplingRate` |
//! | `Str` | `""` | `status` |
//! | `FloatArray` | `vec![0.0]` | `c01Waveform` |
//! | `Enum` | choices + index | `trigMode` |
//!
//! Posting a value of another kind coerces it where the conversion is lossless
//! (an integer to a float PV, a choice string to an enum PV, a reply string to a
//! numeric PV). Anything else is a [`PvError::TypeMismatch`].
//!
//! # Features
//!
//! Access is described with the compact feature strings used in the PV
//! catalogue: `R` read-only (the default), `W` writable by clients, `D`
//! discrete (enumerated choices), `A` carries alarm state.
//!
//! # Example
//!
//! ```rust,ignore
//! let pv = Pv::new(
//!     PvMeta::new("c01Peak2Peak", "Peak-to-peak amplitude", Access::parse("A"))
//!         .with_units("V")
//!         .with_alarm(-9.0, 9.0),
//!     PvValue::Float(0.0),
//! );
//!
//! let mut rx = pv.subscribe();
//! pv.post(PvValue::Float(12.0), Utc::now())?;
//! rx.changed().await?;
//! assert_eq!(rx.borrow().alarm.severity, Severity::Major);
//! ```

use crate::error::{PvError, PvResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

// =============================================================================
// Values
// =============================================================================

/// Value carried by a process variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating-point scalar.
    Float(f64),
    /// Text.
    Str(String),
    /// Array of floats (waveforms, time axis, timing).
    FloatArray(Vec<f64>),
    /// Enumerated value: one of a fixed list of choices.
    Enum {
        /// Legal choices, fixed at creation.
        choices: Vec<String>,
        /// Index of the selected choice.
        index: usize,
    },
}

/// Kind of a process variable, derived from its initial value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PvKind {
    /// See [`PvValue::Bool`].
    Bool,
    /// See [`PvValue::Int`].
    Int,
    /// See [`PvValue::Float`].
    Float,
    /// See [`PvValue::Str`].
    Str,
    /// See [`PvValue::FloatArray`].
    FloatArray,
    /// See [`PvValue::Enum`].
    Enum,
}

impl fmt::Display for PvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PvKind::Bool => "bool",
            PvKind::Int => "int",
            PvKind::Float => "float",
            PvKind::Str => "string",
            PvKind::FloatArray => "float array",
            PvKind::Enum => "enum",
        };
        write!(f, "{}", label)
    }
}

impl PvValue {
    /// Build an enumerated value with the first choice selected.
    pub fn choices(choices: &[&str]) -> Self {
        PvValue::Enum {
            choices: choices.iter().map(|c| (*c).to_string()).collect(),
            index: 0,
        }
    }

    /// Kind of this value.
    pub fn kind(&self) -> PvKind {
        match self {
            PvValue::Bool(_) => PvKind::Bool,
            PvValue::Int(_) => PvKind::Int,
            PvValue::Float(_) => PvKind::Float,
            PvValue::Str(_) => PvKind::Str,
            PvValue::FloatArray(_) => PvKind::FloatArray,
            PvValue::Enum { .. } => PvKind::Enum,
        }
    }

    /// Numeric view of a scalar value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Float(v) => Some(*v),
            PvValue::Int(v) => Some(*v as f64),
            PvValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            PvValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Integer view of a scalar value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvValue::Int(v) => Some(*v),
            PvValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            PvValue::Bool(v) => Some(i64::from(*v)),
            PvValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text view: the string itself, or the selected choice of an enum.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PvValue::Str(s) => Some(s),
            PvValue::Enum { choices, index } => choices.get(*index).map(String::as_str),
            _ => None,
        }
    }

    /// Convert `self` to the kind of `template`.
    ///
    /// Returns `None` when no lossless conversion exists. For enums the
    /// choices of `template` are kept and only the index is taken from `self`.
    pub fn coerce_to(&self, template: &PvValue) -> Option<PvValue> {
        match template {
            PvValue::Bool(_) => match self {
                PvValue::Bool(v) => Some(PvValue::Bool(*v)),
                PvValue::Int(v) => Some(PvValue::Bool(*v != 0)),
                PvValue::Str(s) => match s.trim().to_uppercase().as_str() {
                    "1" | "ON" | "TRUE" => Some(PvValue::Bool(true)),
                    "0" | "OFF" | "FALSE" => Some(PvValue::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            PvValue::Int(_) => match self {
                PvValue::Float(v) if !v.is_finite() => None,
                PvValue::Enum { .. } | PvValue::FloatArray(_) => None,
                other => other.as_i64().map(PvValue::Int),
            },
            PvValue::Float(_) => match self {
                PvValue::Enum { .. } | PvValue::FloatArray(_) => None,
                other => other.as_f64().map(PvValue::Float),
            },
            PvValue::Str(_) => match self {
                PvValue::FloatArray(_) => None,
                other => Some(PvValue::Str(other.to_string())),
            },
            PvValue::FloatArray(_) => match self {
                PvValue::FloatArray(v) => Some(PvValue::FloatArray(v.clone())),
                PvValue::Float(v) => Some(PvValue::FloatArray(vec![*v])),
                PvValue::Int(v) => Some(PvValue::FloatArray(vec![*v as f64])),
                _ => None,
            },
            PvValue::Enum { choices, .. } => {
                let index = match self {
                    PvValue::Enum {
                        choices: other,
                        index,
                    } => {
                        let label = other.get(*index)?;
                        choices.iter().position(|c| c == label)?
                    }
                    PvValue::Str(s) => choices.iter().position(|c| c == s.trim())?,
                    PvValue::Int(i) => usize::try_from(*i).ok().filter(|i| *i < choices.len())?,
                    _ => return None,
                };
                Some(PvValue::Enum {
                    choices: choices.clone(),
                    index,
                })
            }
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Bool(v) => write!(f, "{}", v),
            PvValue::Int(v) => write!(f, "{}", v),
            PvValue::Float(v) => write!(f, "{}", v),
            PvValue::Str(s) => write!(f, "{}", s),
            PvValue::FloatArray(v) => write!(f, "[{} values]", v.len()),
            PvValue::Enum { choices, index } => {
                write!(f, "{}", choices.get(*index).map_or("?", String::as_str))
            }
        }
    }
}

impl From<bool> for PvValue {
    fn from(v: bool) -> Self {
        PvValue::Bool(v)
    }
}

impl From<i64> for PvValue {
    fn from(v: i64) -> Self {
        PvValue::Int(v)
    }
}

impl From<u64> for PvValue {
    fn from(v: u64) -> Self {
        PvValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for PvValue {
    fn from(v: usize) -> Self {
        PvValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        PvValue::Float(v)
    }
}

impl From<&str> for PvValue {
    fn from(v: &str) -> Self {
        PvValue::Str(v.to_string())
    }
}

impl From<String> for PvValue {
    fn from(v: String) -> Self {
        PvValue::Str(v)
    }
}

impl From<Vec<f64>> for PvValue {
    fn from(v: Vec<f64>) -> Self {
        PvValue::FloatArray(v)
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Access features of a PV, parsed from a feature string such as `"WD"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    /// `W`: clients may put new values.
    pub writable: bool,
    /// `D`: the value is one of a list of choices.
    pub discrete: bool,
    /// `A`: the PV carries alarm state.
    pub alarm: bool,
}

impl Access {
    /// Parse a feature string. Unknown letters are ignored, `R` is a no-op.
    pub fn parse(features: &str) -> Self {
        let mut access = Access::default();
        for c in features.chars() {
            match c {
                'W' => access.writable = true,
                'D' => access.discrete = true,
                'A' => access.alarm = true,
                _ => {}
            }
        }
        access
    }
}

/// Static description of a PV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvMeta {
    /// Name without the device prefix, e.g. `c01Waveform`.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Engineering units.
    pub units: Option<String>,
    /// Access features.
    pub access: Access,
    /// Lower control limit applied to client puts.
    pub limit_low: Option<f64>,
    /// Upper control limit applied to client puts.
    pub limit_high: Option<f64>,
    /// Values below this raise a major alarm.
    pub low_alarm: Option<f64>,
    /// Values above this raise a major alarm.
    pub high_alarm: Option<f64>,
    /// Long-form SCPI mnemonic bound to this PV, if any.
    pub scpi: Option<String>,
}

impl PvMeta {
    /// Metadata with no units, limits or SCPI binding.
    pub fn new(name: impl Into<String>, description: impl Into<String>, access: Access) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            units: None,
            access,
            limit_low: None,
            limit_high: None,
            low_alarm: None,
            high_alarm: None,
            scpi: None,
        }
    }

    /// Attach engineering units.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Attach control limits.
    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limit_low = Some(low);
        self.limit_high = Some(high);
        self
    }

    /// Attach value-alarm limits. Implies the `A` feature.
    pub fn with_alarm(mut self, low: f64, high: f64) -> Self {
        self.low_alarm = Some(low);
        self.high_alarm = Some(high);
        self.access.alarm = true;
        self
    }
}

// =============================================================================
// Samples & Alarms
// =============================================================================

/// Alarm severity, in increasing order of importance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Value is within limits.
    #[default]
    NoAlarm,
    /// Warning level.
    Minor,
    /// Value outside its alarm limits.
    Major,
    /// Value could not be determined.
    Invalid,
}

/// Alarm state attached to each sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    /// Severity of the alarm.
    pub severity: Severity,
    /// Short reason, empty when there is no alarm.
    pub message: String,
}

impl Alarm {
    fn evaluate(meta: &PvMeta, value: &PvValue) -> Self {
        let v = match value {
            PvValue::Float(v) => *v,
            PvValue::Int(v) => *v as f64,
            _ => return Alarm::default(),
        };
        if let Some(high) = meta.high_alarm {
            if v > high {
                return Alarm {
                    severity: Severity::Major,
                    message: "HIHI".to_string(),
                };
            }
        }
        if let Some(low) = meta.low_alarm {
            if v < low {
                return Alarm {
                    severity: Severity::Major,
                    message: "LOLO".to_string(),
                };
            }
        }
        Alarm::default()
    }
}

/// A timestamped value as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// The value.
    pub value: PvValue,
    /// When the value was acquired or posted.
    pub timestamp: DateTime<Utc>,
    /// Alarm state derived from the value.
    pub alarm: Alarm,
}

// =============================================================================
// Pv
// =============================================================================

/// A process variable: metadata plus a watch channel holding the latest sample.
///
/// Clones share the same channel, so a post through any clone reaches every
/// subscriber.
#[derive(Clone)]
pub struct Pv {
    sender: watch::Sender<Sample>,
    meta: Arc<PvMeta>,
}

impl fmt::Debug for Pv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pv")
            .field("meta", &self.meta)
            .field("value", &self.sender.borrow().value)
            .finish_non_exhaustive()
    }
}

impl Pv {
    /// Create a PV holding `initial`, timestamped now.
    pub fn new(meta: PvMeta, initial: PvValue) -> Self {
        let alarm = Alarm::evaluate(&meta, &initial);
        let (sender, _) = watch::channel(Sample {
            value: initial,
            timestamp: Utc::now(),
            alarm,
        });
        Self {
            sender,
            meta: Arc::new(meta),
        }
    }

    /// Name without the device prefix.
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Static metadata.
    pub fn meta(&self) -> &PvMeta {
        &self.meta
    }

    /// Kind of the PV.
    pub fn kind(&self) -> PvKind {
        self.sender.borrow().value.kind()
    }

    /// Current value (clone).
    pub fn current(&self) -> PvValue {
        self.sender.borrow().value.clone()
    }

    /// Current sample (clone).
    pub fn sample(&self) -> Sample {
        self.sender.borrow().clone()
    }

    /// Subscribe to new samples.
    pub fn subscribe(&self) -> watch::Receiver<Sample> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Convert `value` to this PV's kind.
    pub fn coerce(&self, value: &PvValue) -> PvResult<PvValue> {
        let template = self.current();
        value.coerce_to(&template).ok_or_else(|| match &template {
            PvValue::Enum { choices, .. } => PvError::IllegalChoice {
                name: self.meta.name.clone(),
                value: value.to_string(),
                choices: choices.clone(),
            },
            _ => PvError::TypeMismatch {
                name: self.meta.name.clone(),
                expected: template.kind(),
                got: format!("{:?}", value),
            },
        })
    }

    /// Publish `value` unconditionally.
    pub fn post(&self, value: PvValue, timestamp: DateTime<Utc>) -> PvResult<()> {
        let value = self.coerce(&value)?;
        self.send(value, timestamp);
        Ok(())
    }

    /// Publish `value` only if it differs from the current value.
    ///
    /// Returns whether a sample was published.
    pub fn post_if_changed(&self, value: PvValue, timestamp: DateTime<Utc>) -> PvResult<bool> {
        let value = self.coerce(&value)?;
        if self.sender.borrow().value == value {
            return Ok(false);
        }
        self.send(value, timestamp);
        Ok(true)
    }

    fn send(&self, value: PvValue, timestamp: DateTime<Utc>) {
        let alarm = Alarm::evaluate(&self.meta, &value);
        self.sender.send_replace(Sample {
            value,
            timestamp,
            alarm,
        });
    }

    /// Check a value offered by a client and convert it to this PV's kind.
    ///
    /// Rejects read-only PVs, values that cannot be converted, non-finite
    /// numbers and numbers outside the control limits.
    pub fn validate_put(&self, value: &PvValue) -> PvResult<PvValue> {
        if !self.meta.access.writable {
            return Err(PvError::ReadOnly(self.meta.name.clone()));
        }
        let value = self.coerce(value)?;
        match &value {
            PvValue::Float(v) => self.check_limits(*v)?,
            PvValue::Int(v) => self.check_limits(*v as f64)?,
            PvValue::FloatArray(v) if v.iter().any(|x| !x.is_finite()) => {
                return Err(PvError::NonFinite(self.meta.name.clone()));
            }
            _ => {}
        }
        Ok(value)
    }

    fn check_limits(&self, v: f64) -> PvResult<()> {
        if !v.is_finite() {
            return Err(PvError::NonFinite(self.meta.name.clone()));
        }
        let low = self.meta.limit_low.unwrap_or(f64::NEG_INFINITY);
        let high = self.meta.limit_high.unwrap_or(f64::INFINITY);
        if v < low || v > high {
            return Err(PvError::OutOfRange {
                name: self.meta.name.clone(),
                value: v,
                low,
                high,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[allow(clippy::float_cmp, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn float_pv(features: &str) -> Pv {
        Pv::new(
            PvMeta::new("c01VoltsPerDiv", "Vertical scale", Access::parse(features))
                .with_limits(500e-6, 10.0),
            PvValue::Float(1e-3),
        )
    }

    #[test]
    fn test_access_parse() {
        let access = Access::parse("WD");
        assert!(access.writable && access.discrete && !access.alarm);
        assert_eq!(Access::parse("R"), Access::default());
        assert!(Access::parse("A").alarm);
    }

    #[test]
    fn test_coerce_reply_strings() {
        let float = PvValue::Float(0.0);
        assert_eq!(
            PvValue::from("2.000000e-06").coerce_to(&float),
            Some(PvValue::Float(2e-6))
        );
        assert_eq!(PvValue::Int(3).coerce_to(&float), Some(PvValue::Float(3.0)));
        assert_eq!(PvValue::from("x").coerce_to(&float), None);

        let int = PvValue::Int(0);
        assert_eq!(PvValue::from("1000").coerce_to(&int), Some(PvValue::Int(1000)));
        assert_eq!(PvValue::Float(2.5).coerce_to(&int), None);
    }

    #[test]
    fn test_coerce_enum() {
        let mode = PvValue::choices(&["NORM", "AUTO", "SING"]);
        let auto = PvValue::from("AUTO").coerce_to(&mode).unwrap();
        assert_eq!(auto.as_str(), Some("AUTO"));
        assert_eq!(PvValue::Int(2).coerce_to(&mode).unwrap().as_str(), Some("SING"));
        assert!(PvValue::from("EDGE").coerce_to(&mode).is_none());
        assert!(PvValue::Int(3).coerce_to(&mode).is_none());
    }

    #[test]
    fn test_post_if_changed() {
        let pv = float_pv("W");
        assert!(!pv.post_if_changed(PvValue::Float(1e-3), Utc::now()).unwrap());
        assert!(pv.post_if_changed(PvValue::Float(2e-3), Utc::now()).unwrap());
        assert_eq!(pv.current(), PvValue::Float(2e-3));
    }

    #[test]
    fn test_post_type_mismatch() {
        let pv = float_pv("W");
        let err = pv.post(PvValue::FloatArray(vec![1.0]), Utc::now()).unwrap_err();
        assert!(matches!(err, PvError::TypeMismatch { .. }));
    }

    #[test]
    fn test_validate_put() {
        let pv = float_pv("W");
        assert_eq!(pv.validate_put(&PvValue::Float(0.5)).unwrap(), PvValue::Float(0.5));
        assert!(matches!(
            pv.validate_put(&PvValue::Float(20.0)),
            Err(PvError::OutOfRange { .. })
        ));
        assert!(matches!(
            pv.validate_put(&PvValue::Float(f64::NAN)),
            Err(PvError::NonFinite(_))
        ));

        let read_only = float_pv("R");
        assert!(matches!(
            read_only.validate_put(&PvValue::Float(0.5)),
            Err(PvError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_alarm_limits() {
        let pv = Pv::new(
            PvMeta::new("c01Peak2Peak", "Peak-to-peak amplitude", Access::parse("A"))
                .with_alarm(-9.0, 9.0),
            PvValue::Float(0.0),
        );
        assert_eq!(pv.sample().alarm.severity, Severity::NoAlarm);

        pv.post(PvValue::Float(9.5), Utc::now()).unwrap();
        assert_eq!(pv.sample().alarm.severity, Severity::Major);

        pv.post(PvValue::Float(1.0), Utc::now()).unwrap();
        assert_eq!(pv.sample().alarm, Alarm::default());
    }

    #[tokio::test]
    async fn test_subscribers_see_latest_sample() {
        let pv = Pv::new(
            PvMeta::new("acqCount", "Number of acquisition recorded", Access::default()),
            PvValue::Int(0),
        );
        let mut rx = pv.subscribe();
        assert_eq!(pv.subscriber_count(), 1);

        pv.post(PvValue::Int(1), Utc::now()).unwrap();
        pv.post(PvValue::Int(2), Utc::now()).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().value, PvValue::Int(2));
    }

    #[test]
    fn test_untagged_json() {
        let v: PvValue = serde_json::from_str("[1, 2.5]").unwrap();
        assert_eq!(v, PvValue::FloatArray(vec![1.0, 2.5]));
        let v: PvValue = serde_json::from_str("3").unwrap();
        assert_eq!(v, PvValue::Int(3));
        let v: PvValue = serde_json::from_str("\"Force!\"").unwrap();
        assert_eq!(v, PvValue::from("Force!"));
    }
}
