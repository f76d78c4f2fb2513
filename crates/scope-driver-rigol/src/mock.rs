//! Simulated RIGOL scope for tests and `--mock` runs.
//!
//! [`MockScope`] answers the subset of the DS1000Z command set the driver
//! uses: combined `;` queries with relative headers, long and short
//! mnemonics, waveform preamble and WORD data, trigger status, setup
//! save/recall. Unknown queries time out, like on the instrument.

use crate::command::abbreviate;
use crate::error::ScpiError;
use crate::scpi::ScpiTransport;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::TAU;

/// Identification string of the simulated scope.
pub const MOCK_IDN: &str = "RIGOL TECHNOLOGIES,DS1104Z,DS1ZA000000001,00.04.04.SP4";

const HISTORY_LIMIT: usize = 512;
const AUTO_POINTS: usize = 1200;
const CYCLES_PER_RECORD: f64 = 3.0;
const Y_REFERENCE: f64 = 32768.0;
const COUNTS_PER_DIV: f64 = 3200.0;

/// Injected transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The next call times out.
    Timeout,
    /// The connection is lost for good.
    Disconnect,
}

struct MockState {
    settings: HashMap<String, String>,
    saved: HashMap<String, HashMap<String, String>>,
    running: bool,
    armed: bool,
    auto_trigger: bool,
    polls_since_run: u32,
    source: usize,
    records: u64,
    closed: bool,
    faults: VecDeque<Fault>,
    targeted: Vec<(String, Fault)>,
    replies: HashMap<String, String>,
    history: VecDeque<String>,
}

fn default_settings() -> HashMap<String, String> {
    let mut s: HashMap<String, String> = [
        ("ACQ:MDEP", "AUTO"),
        ("TIM:SCAL", "1.000000e-06"),
        ("TIM:OFFS", "0.000000e+00"),
        ("TRIG:MODE", "EDGE"),
        ("TRIG:COUP", "DC"),
        ("TRIG:SWE", "AUTO"),
        ("TRIG:EDGE:SOUR", "CHAN1"),
        ("TRIG:EDGE:SLOP", "POS"),
        ("TRIG:EDGE:LEV", "0.000000e+00"),
        ("WAV:FORM", "BYTE"),
        ("WAV:MODE", "NORM"),
        ("SAVE:OVER", "OFF"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for ch in 1..=4 {
        let on = if ch <= 2 { "1" } else { "0" };
        s.insert(format!("CHAN{}:DISP", ch), on.to_string());
        s.insert(format!("CHAN{}:COUP", ch), "DC".to_string());
        s.insert(format!("CHAN{}:SCAL", ch), "1.000000e+00".to_string());
        s.insert(format!("CHAN{}:OFFS", ch), "0.000000e+00".to_string());
    }
    s
}

/// Short form of one header node.
///
/// Mixed-case nodes keep their uppercase letters. Uppercase long forms are
/// cut to four letters, or three when the fourth is a vowel, keeping any
/// numeric suffix.
fn short_node(node: &str) -> String {
    if node.starts_with('*') {
        return node.to_uppercase();
    }
    if node.chars().any(|c| c.is_lowercase()) {
        return abbreviate(node);
    }
    let node = node.to_uppercase();
    let split = node.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (letters, digits) = node.split_at(split);
    let short = if letters.len() <= 4 {
        letters
    } else if matches!(letters.as_bytes()[3], b'A' | b'E' | b'I' | b'O' | b'U') {
        &letters[..3]
    } else {
        &letters[..4]
    };
    format!("{}{}", short, digits)
}

fn short_header(header: &str) -> String {
    header.split(':').map(short_node).collect::<Vec<_>>().join(":")
}

fn record_points(depth: &str) -> usize {
    let depth = depth.trim().to_uppercase();
    let (number, factor) = if let Some(n) = depth.strip_suffix('K') {
        (n, 1_000.0)
    } else if let Some(n) = depth.strip_suffix('M') {
        (n, 1_000_000.0)
    } else {
        (depth.as_str(), 1.0)
    };
    number
        .parse::<f64>()
        .ok()
        .filter(|n| *n > 0.0)
        .map_or(AUTO_POINTS, |n| (n * factor) as usize)
}

impl MockState {
    fn number(&self, key: &str) -> f64 {
        self.settings
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }

    fn points(&self) -> usize {
        self.settings
            .get("ACQ:MDEP")
            .map_or(AUTO_POINTS, |d| record_points(d))
    }

    fn xincrement(&self) -> f64 {
        self.number("TIM:SCAL") * 10.0 / self.points() as f64
    }

    fn xorigin(&self) -> f64 {
        -(self.points() as f64) / 2.0 * self.xincrement() + self.number("TIM:OFFS")
    }

    fn yincrement(&self, ch: usize) -> f64 {
        self.number(&format!("CHAN{}:SCAL", ch)) / COUNTS_PER_DIV
    }

    fn preamble(&self) -> String {
        format!(
            "2,0,{},1,{:e},{:e},0,{:e},0,{}",
            self.points(),
            self.xincrement(),
            self.xorigin(),
            self.yincrement(self.source),
            Y_REFERENCE
        )
    }

    fn waveform(&self) -> Vec<u16> {
        let n = self.points();
        let amplitude = 0.5 * self.source as f64;
        let yinc = self.yincrement(self.source);
        let counts = if yinc > 0.0 { amplitude / yinc } else { 0.0 };
        let phase = self.records as f64 * 0.1;
        (0..n)
            .map(|i| {
                let x = TAU * CYCLES_PER_RECORD * i as f64 / n as f64 + phase;
                (Y_REFERENCE + (counts * x.sin()).round()).clamp(0.0, f64::from(u16::MAX)) as u16
            })
            .collect()
    }

    fn trigger_status(&mut self) -> &'static str {
        if !self.running {
            return "STOP";
        }
        self.polls_since_run += 1;
        if self.auto_trigger && self.polls_since_run > 2 {
            self.armed = true;
        }
        if self.armed {
            "TD"
        } else {
            "WAIT"
        }
    }

    fn answer(&mut self, header: &str) -> Option<String> {
        let reply = match header {
            "*IDN" => MOCK_IDN.to_string(),
            "*OPC" => "1".to_string(),
            "*ESR" | "*STB" => "0".to_string(),
            "TRIG:STAT" => self.trigger_status().to_string(),
            "WAV:PRE" => self.preamble(),
            "WAV:XOR" => format!("{:e}", self.xorigin()),
            "WAV:XINC" => format!("{:e}", self.xincrement()),
            "WAV:POIN" | "ACQ:MDEP" => self.points().to_string(),
            "ACQ:SRAT" => format!("{:e}", 1.0 / self.xincrement()),
            "WAV:SOUR" => format!("CHAN{}", self.source),
            other => self.settings.get(other)?.clone(),
        };
        Some(reply)
    }

    fn apply(&mut self, header: &str, arg: &str) {
        match header {
            "*CLS" => {}
            "*RST" => {
                self.settings = default_settings();
                self.running = true;
            }
            "RUN" => {
                self.running = true;
                self.polls_since_run = 0;
            }
            "STOP" => {
                if self.armed {
                    self.records += 1;
                }
                self.running = false;
                self.armed = false;
            }
            "TFOR" => self.armed = self.running,
            "SAVE:SET" | "SAVE:SETU" => {
                self.saved.insert(arg.to_uppercase(), self.settings.clone());
            }
            "LOAD:SET" | "LOAD:SETU" => {
                if let Some(saved) = self.saved.get(&arg.to_uppercase()) {
                    self.settings = saved.clone();
                }
            }
            "WAV:SOUR" => {
                let arg = short_node(arg);
                if let Some(ch) = arg.strip_prefix("CHAN").and_then(|n| n.parse().ok()) {
                    self.source = ch;
                }
            }
            h if h.ends_with(":DISP") => {
                let on = matches!(arg.to_uppercase().as_str(), "1" | "ON");
                self.settings
                    .insert(h.to_string(), if on { "1" } else { "0" }.to_string());
            }
            h => {
                self.settings.insert(h.to_string(), arg.to_string());
            }
        }
    }

    fn record(&mut self, text: &str) {
        self.history.push_back(text.to_string());
        if self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    /// Execute a program message and collect replies to its queries.
    fn execute(&mut self, text: &str) -> Result<Vec<String>, ScpiError> {
        self.record(text);

        let mut replies = Vec::new();
        let mut subsystem = String::new();
        for unit in text.split(';').map(str::trim).filter(|u| !u.is_empty()) {
            let absolute = unit.starts_with(':');
            let unit = unit.trim_start_matches(':');
            let (header, arg) = unit
                .split_once(char::is_whitespace)
                .map_or((unit, ""), |(h, a)| (h, a.trim()));
            let query = header.ends_with('?');
            let header = short_header(header.trim_end_matches('?'));

            let full = if absolute || subsystem.is_empty() || header.starts_with('*') {
                header
            } else {
                format!("{}:{}", subsystem, header)
            };
            if !full.starts_with('*') {
                subsystem = full.rsplit_once(':').map_or(String::new(), |(s, _)| s.to_string());
            }

            if query {
                let reply = self
                    .answer(&full)
                    .ok_or_else(|| ScpiError::Timeout(text.to_string()))?;
                replies.push(reply);
            } else {
                self.apply(&full, arg);
            }
        }
        Ok(replies)
    }
}

/// In-process simulated scope.
pub struct MockScope {
    state: Mutex<MockState>,
}

impl Default for MockScope {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScope {
    /// A running scope with channels 1 and 2 displayed.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                settings: default_settings(),
                saved: HashMap::new(),
                running: true,
                armed: false,
                auto_trigger: false,
                polls_since_run: 0,
                source: 1,
                records: 0,
                closed: false,
                faults: VecDeque::new(),
                targeted: Vec::new(),
                replies: HashMap::new(),
                history: VecDeque::new(),
            }),
        }
    }

    /// Trigger by itself every few status polls.
    pub fn with_auto_trigger(self) -> Self {
        self.state.lock().auto_trigger = true;
        self
    }

    /// Simulate a trigger event.
    pub fn arm_trigger(&self) {
        let mut state = self.state.lock();
        state.armed = state.running;
    }

    /// Stop acquisition as if from the front panel.
    pub fn press_stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.armed = false;
    }

    /// Change a setting as if from the front panel. `header` is the short
    /// form, e.g. `TIM:SCAL`.
    pub fn set(&self, header: &str, value: &str) {
        self.state
            .lock()
            .settings
            .insert(header.to_string(), value.to_string());
    }

    /// Current value of a stored setting.
    pub fn setting(&self, header: &str) -> Option<String> {
        self.state.lock().settings.get(header).cloned()
    }

    /// True while acquiring.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Fail the next calls with `fault`.
    pub fn inject(&self, fault: Fault, count: usize) {
        let mut state = self.state.lock();
        state.faults.extend(std::iter::repeat(fault).take(count));
    }

    /// Fail the next exchange whose text is exactly `text` with `fault`.
    pub fn inject_on(&self, text: &str, fault: Fault) {
        self.state.lock().targeted.push((text.to_string(), fault));
    }

    /// Answer the next `query` with `reply` instead of the simulated value.
    pub fn reply_once(&self, query: &str, reply: &str) {
        self.state
            .lock()
            .replies
            .insert(query.to_string(), reply.to_string());
    }

    /// Program messages received so far, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.iter().cloned().collect()
    }

    fn check_fault(state: &mut MockState, text: &str) -> Result<(), ScpiError> {
        if state.closed {
            return Err(ScpiError::ConnectionClosed);
        }
        let fault = match state.targeted.iter().position(|(t, _)| t == text) {
            Some(i) => Some(state.targeted.remove(i).1),
            None => state.faults.pop_front(),
        };
        match fault {
            Some(Fault::Timeout) => Err(ScpiError::Timeout(text.to_string())),
            Some(Fault::Disconnect) => {
                state.closed = true;
                Err(ScpiError::ConnectionClosed)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ScpiTransport for MockScope {
    async fn write(&self, command: &str) -> Result<(), ScpiError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state, command)?;
        tracing::trace!("Mock SCPI write: {}", command);
        state.execute(command).map(|_| ())
    }

    async fn query(&self, query: &str) -> Result<String, ScpiError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state, query)?;
        if let Some(reply) = state.replies.remove(query) {
            state.record(query);
            return Ok(reply);
        }
        let replies = state.execute(query)?;
        if replies.is_empty() {
            return Err(ScpiError::Timeout(query.to_string()));
        }
        tracing::trace!("Mock SCPI query: {} -> {:?}", query, replies);
        Ok(replies.join(";"))
    }

    async fn query_binary(&self, query: &str) -> Result<Vec<u16>, ScpiError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state, query)?;
        state.record(query);
        let header = short_header(query.trim().trim_start_matches(':').trim_end_matches('?'));
        if header != "WAV:DATA" {
            return Err(ScpiError::Protocol(format!("no binary reply to '{}'", query)));
        }
        Ok(state.waveform())
    }

    async fn clear(&self) -> Result<(), ScpiError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state, "clear")
    }
}
