//! Unified `NovaMessage` bus types.
//!
//! All events flow through a single `broadcast<NovaMessage>` channel.
//! Each message has a source (global ID of the originator), timestamp,
//! optional raw payload (hex-first policy), and a typed event.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::drill::{DrillStep, Level};
use crate::shot::ShotParameters;
use crate::{
    ActorState, ConnectionState, NovaConfig, RobotSection, RunMode, RunSettings, StatsSnapshot,
    StopReason, WebserverSection,
};

// ---------------------------------------------------------------------------
// Top-level message
// ---------------------------------------------------------------------------

/// A single event on the unified bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NovaMessage {
    #[serde(default)]
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<RawPayload>,
    pub event: NovaEvent,
}

impl NovaMessage {
    /// Create a new message with the current UTC timestamp. Use `.source()` and
    /// `.raw_binary()` to attach metadata.
    pub fn new(event: impl Into<NovaEvent>) -> Self {
        Self {
            source: String::new(),
            timestamp: Utc::now(),
            raw_payload: None,
            event: event.into(),
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn raw_binary(mut self, raw: Vec<u8>) -> Self {
        self.raw_payload = Some(RawPayload::Binary(raw));
        self
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<RobotCommand> for NovaEvent {
    fn from(cmd: RobotCommand) -> Self {
        NovaEvent::RobotCommand(cmd)
    }
}

impl From<ConnectionChanged> for NovaEvent {
    fn from(changed: ConnectionChanged) -> Self {
        NovaEvent::Connection(changed)
    }
}

impl From<RunEvent> for NovaEvent {
    fn from(event: RunEvent) -> Self {
        NovaEvent::Run(event)
    }
}

impl From<StatsCommand> for NovaEvent {
    fn from(cmd: StatsCommand) -> Self {
        NovaEvent::StatsCommand(cmd)
    }
}

impl From<StatsSnapshot> for NovaEvent {
    fn from(snapshot: StatsSnapshot) -> Self {
        NovaEvent::StatsSnapshot(snapshot)
    }
}

impl From<ActorState> for NovaEvent {
    fn from(state: ActorState) -> Self {
        NovaEvent::ActorStatus(state)
    }
}

impl From<ConfigCommand> for NovaEvent {
    fn from(cmd: ConfigCommand) -> Self {
        NovaEvent::ConfigCommand(cmd)
    }
}

impl From<ConfigOutcome> for NovaEvent {
    fn from(result: ConfigOutcome) -> Self {
        NovaEvent::ConfigOutcome(result)
    }
}

impl From<AlertMessage> for NovaEvent {
    fn from(alert: AlertMessage) -> Self {
        NovaEvent::Alert(alert)
    }
}

// ---------------------------------------------------------------------------
// Raw payload: hex-first policy
// ---------------------------------------------------------------------------

/// Raw wire data attached to a bus message.
///
/// Binary payloads serialize as lowercase hex strings.
#[derive(Debug, Clone)]
pub enum RawPayload {
    Binary(Vec<u8>),
    Text(String),
}

impl Serialize for RawPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RawPayload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RawPayload::Text(s))
    }
}

impl fmt::Display for RawPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawPayload::Binary(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            RawPayload::Text(s) => write!(f, "{s}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Event variants
// ---------------------------------------------------------------------------

/// The typed event payload carried by a `NovaMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NovaEvent {
    /// Request to the robot actor (from REST, WS or the CLI).
    RobotCommand(RobotCommand),
    /// Link state transition, emitted by the connection manager.
    Connection(ConnectionChanged),
    /// Drill runner progress.
    Run(RunEvent),
    /// Counter update, applied by SystemActor.
    StatsCommand(StatsCommand),
    /// Counters after a StatsCommand was applied.
    StatsSnapshot(StatsSnapshot),
    /// Generic actor status update.
    ActorStatus(ActorState),
    /// Config mutation request (emitted by POST handler).
    ConfigCommand(ConfigCommand),
    /// Config mutation outcome (emitted by SystemActor after processing).
    ConfigOutcome(ConfigOutcome),
    /// Alert for user-visible warn/error conditions.
    Alert(AlertMessage),
}

// ---------------------------------------------------------------------------
// RobotCommand
// ---------------------------------------------------------------------------

/// Everything a user can ask the robot actor to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RobotCommand {
    Connect,
    Disconnect,
    /// Start a library drill. Level and mode default to the run settings.
    StartDrill {
        drill: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<Level>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<RunMode>,
    },
    /// Loop an ad-hoc step list without countdown or statistics.
    StartTestRun {
        steps: Vec<DrillStep>,
        #[serde(default)]
        randomize: bool,
    },
    TogglePause,
    Stop,
    SkipCountdown,
    /// Fire a single ball outside any run.
    FireShot { shot: ShotParameters },
}

// ---------------------------------------------------------------------------
// ConnectionChanged
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionChanged {
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

/// Progress of the active run, in the order a UI would display it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    LastPlayed { drill: String },
    Countdown { remaining: u8 },
    Go,
    Started {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        drill: Option<String>,
        test_mode: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<RunMode>,
    },
    RepsRemaining { remaining: u32 },
    TimeRemaining { secs: u32, display: String },
    BatchSent { iteration: u32, balls: usize },
    Paused,
    Resumed,
    Stopped { reason: StopReason },
}

// ---------------------------------------------------------------------------
// StatsCommand
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatsCommand {
    AddBalls { count: u32 },
    AddDrill,
    /// Mark the start of a session (robot became ready).
    StartSession,
    Reset,
}

// ---------------------------------------------------------------------------
// ConfigCommand: config mutation request
// ---------------------------------------------------------------------------

/// A request to mutate the system configuration.
///
/// Emitted on the bus by the POST handler. Processed exclusively by
/// `SystemActor`, which applies the mutation, reconciles actors, and
/// optionally emits a `ConfigOutcome`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigCommand {
    /// Opaque correlation ID. When present, SystemActor emits a ConfigOutcome
    /// with the same ID after processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub action: ConfigAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfigAction {
    /// Replace the entire config. Used by POST /api/settings.
    ReplaceAll { config: NovaConfig },
    UpdateRobot { section: RobotSection },
    UpdateRun { settings: RunSettings },
    UpsertWebserver {
        index: String,
        section: WebserverSection,
    },
    /// Remove a web server by global ID ("webserver.1").
    Remove { id: String },
}

/// Acknowledgment of a config mutation, emitted by SystemActor after
/// processing a `ConfigCommand` that had a `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigOutcome {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restarted: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stopped: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub started: Vec<String>,
}

// ---------------------------------------------------------------------------
// AlertMessage: user-visible warn/error notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warn,
    Error,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Warn => write!(f, "warn"),
            AlertLevel::Error => write!(f, "error"),
        }
    }
}

/// A user-visible alert. Info/debug/trace stays in the tracing backend;
/// warn/error conditions surface here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub level: AlertLevel,
    pub message: String,
}
