//! Server state machine.
//!
//! The `server` PV doubles as command input and state display: clients put
//! `Start`, `Stop`, `Clear` or `Exit`, and the server answers by posting
//! `Started`, `Stopped` or `Exited`. `Clear` is transient and returns to the
//! state the server was in.

use crate::error::PvResult;
use crate::registry::{PublishMode, PvRegistry};
use std::fmt;

/// Command written to the `server` PV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    /// Start polling the instrument.
    Start,
    /// Stop polling, keep serving PVs.
    Stop,
    /// Reset counters, keep the current state.
    Clear,
    /// Leave the acquisition loop.
    Exit,
}

impl ServerCommand {
    /// Parse a command choice. State names are accepted as their command.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Start" | "Started" => Some(ServerCommand::Start),
            "Stop" | "Stopped" => Some(ServerCommand::Stop),
            "Clear" => Some(ServerCommand::Clear),
            "Exit" | "Exited" => Some(ServerCommand::Exit),
            _ => None,
        }
    }
}

/// State of the server as posted to the `server` PV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Polling the instrument.
    Started,
    /// Serving PVs without polling.
    Stopped,
    /// Acquisition loop has ended.
    Exited,
}

impl ServerState {
    /// Choice string posted to the `server` PV.
    pub fn label(self) -> &'static str {
        match self {
            ServerState::Started => "Started",
            ServerState::Stopped => "Stopped",
            ServerState::Exited => "Exited",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the acquisition loop must do after a command was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The server moves to `Started`; the driver runs its start sequence.
    Start,
    /// The server moves to `Stopped`.
    Stop,
    /// Counters must be reset; the state is unchanged.
    Clear,
    /// The server moves to `Exited`.
    Exit,
    /// Nothing to do.
    None,
}

/// Tracks the server state and mirrors it to the `server` PV.
#[derive(Debug)]
pub struct ServerControl {
    state: ServerState,
}

impl Default for ServerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerControl {
    /// A stopped server.
    pub fn new() -> Self {
        Self {
            state: ServerState::Stopped,
        }
    }

    /// Current state.
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// True while the loop should poll the instrument.
    pub fn is_started(&self) -> bool {
        self.state == ServerState::Started
    }

    /// True once the loop should end.
    pub fn is_exited(&self) -> bool {
        self.state == ServerState::Exited
    }

    /// Apply a command, post the resulting state and report what the caller
    /// must do. Commands are ignored once the server has exited.
    pub fn apply(&mut self, command: ServerCommand, registry: &PvRegistry) -> PvResult<Transition> {
        if self.is_exited() {
            return Ok(Transition::None);
        }
        let transition = match command {
            ServerCommand::Start => {
                tracing::info!("starting the server");
                self.state = ServerState::Started;
                Transition::Start
            }
            ServerCommand::Stop => {
                tracing::info!("server stopped");
                self.state = ServerState::Stopped;
                Transition::Stop
            }
            ServerCommand::Exit => {
                tracing::info!("server is exiting");
                self.state = ServerState::Exited;
                Transition::Exit
            }
            ServerCommand::Clear => {
                registry.post_status("Cleared");
                Transition::Clear
            }
        };
        registry.publish("server", self.state.label(), PublishMode::Always)?;
        Ok(transition)
    }
}
