//! Waveform preamble and sample scaling.

use crate::error::{DriverError, Result};
use std::str::FromStr;

/// Number of horizontal divisions on the scope display.
pub const HORIZONTAL_DIVISIONS: f64 = 10.0;

/// Reply to `:WAV:PRE?`.
///
/// `<format>,<type>,<points>,<count>,<xincrement>,<xorigin>,<xreference>,
/// <yincrement>,<yorigin>,<yreference>`
#[derive(Debug, Clone, PartialEq)]
pub struct Preamble {
    /// 0 BYTE, 1 WORD, 2 ASC.
    pub format: i64,
    /// 0 NORMal, 1 MAXimum, 2 RAW.
    pub kind: i64,
    /// Points in the record.
    pub points: usize,
    /// Averages, 1 outside average mode.
    pub count: i64,
    /// Seconds between points.
    pub xincrement: f64,
    /// Time of the first point relative to the trigger.
    pub xorigin: f64,
    /// Reference point on the time axis.
    pub xreference: f64,
    /// Volts per count.
    pub yincrement: f64,
    /// Vertical offset in counts.
    pub yorigin: f64,
    /// Count at the vertical reference.
    pub yreference: f64,
}

impl Preamble {
    /// Volts of each raw sample: `(raw - yorigin - yreference) * yincrement`.
    pub fn to_volts(&self, raw: &[u16]) -> Vec<f64> {
        raw.iter()
            .map(|&r| (f64::from(r) - self.yorigin - self.yreference) * self.yincrement)
            .collect()
    }
}

impl FromStr for Preamble {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || DriverError::Reply {
            query: ":WAV:PRE?".into(),
            reply: s.to_string(),
        };
        let f: Vec<&str> = s.trim().split(',').map(str::trim).collect();
        if f.len() < 10 {
            return Err(bad());
        }
        let int = |i: usize| f[i].parse::<i64>().map_err(|_| bad());
        let float = |i: usize| f[i].parse::<f64>().map_err(|_| bad());
        Ok(Self {
            format: int(0)?,
            kind: int(1)?,
            points: f[2].parse().map_err(|_| bad())?,
            count: int(3)?,
            xincrement: float(4)?,
            xorigin: float(5)?,
            xreference: float(6)?,
            yincrement: float(7)?,
            yorigin: float(8)?,
            yreference: float(9)?,
        })
    }
}

/// Horizontal scale of the current record.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Horizontal {
    /// Time of the first point.
    pub xorigin: f64,
    /// Seconds between points.
    pub xincrement: f64,
    /// Points in the record.
    pub points: usize,
}

impl Horizontal {
    /// Time of each sample, `i * xincrement + xorigin`.
    pub fn time_axis(&self) -> Vec<f64> {
        (0..self.points)
            .map(|i| i as f64 * self.xincrement + self.xorigin)
            .collect()
    }

    /// Seconds per division.
    pub fn time_per_div(&self) -> f64 {
        self.points as f64 * self.xincrement / HORIZONTAL_DIVISIONS
    }

    /// Samples per second, `None` for a zero increment.
    pub fn sampling_rate(&self) -> Option<f64> {
        (self.xincrement > 0.0).then(|| 1.0 / self.xincrement)
    }
}

/// Mean and peak-to-peak of a waveform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    /// Average value.
    pub mean: f64,
    /// Maximum minus minimum.
    pub peak_to_peak: f64,
}

impl Stats {
    /// Statistics of `v`. An empty waveform yields zeros.
    pub fn of(v: &[f64]) -> Self {
        if v.is_empty() {
            return Self {
                mean: 0.0,
                peak_to_peak: 0.0,
            };
        }
        let (min, max, sum) = v.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), &x| (min.min(x), max.max(x), sum + x),
        );
        Self {
            mean: sum / v.len() as f64,
            peak_to_peak: max - min,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    const PRE: &str = "0,2,1200,1,1.000000e-09,-6.000000e-07,0,4.000000e-02,0,32768";

    #[test]
    fn test_parse_preamble() {
        let pre: Preamble = PRE.parse().unwrap();
        assert_eq!(pre.kind, 2);
        assert_eq!(pre.points, 1200);
        assert_eq!(pre.xincrement, 1e-9);
        assert_eq!(pre.yincrement, 0.04);
        assert_eq!(pre.yreference, 32768.0);
        assert!(matches!(
            "0,2,1200".parse::<Preamble>(),
            Err(DriverError::Reply { .. })
        ));
        assert!("0,2,1200,1,x,0,0,0,0,0".parse::<Preamble>().is_err());
    }

    #[test]
    fn test_scaling_and_stats() {
        let pre: Preamble = PRE.parse().unwrap();
        let v = pre.to_volts(&[32768, 32793, 32743]);
        assert_eq!(v[0], 0.0);
        assert!((v[1] - 1.0).abs() < 1e-12);
        assert!((v[2] + 1.0).abs() < 1e-12);

        let stats = Stats::of(&v);
        assert!(stats.mean.abs() < 1e-12);
        assert!((stats.peak_to_peak - 2.0).abs() < 1e-12);
        assert_eq!(Stats::of(&[]).peak_to_peak, 0.0);
    }

    #[test]
    fn test_horizontal() {
        let h = Horizontal {
            xorigin: -6e-7,
            xincrement: 1e-9,
            points: 1200,
        };
        let t = h.time_axis();
        assert_eq!(t.len(), 1200);
        assert_eq!(t[0], -6e-7);
        assert!((t[600]).abs() < 1e-18);
        assert!((h.time_per_div() - 1.2e-7).abs() < 1e-20);
        assert!((h.sampling_rate().unwrap() - 1e9).abs() < 1.0);
        assert_eq!(Horizontal::default().sampling_rate(), None);
    }
}
