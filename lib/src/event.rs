//! Shared domain types referenced by the bus messages in `message.rs`.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::handshake::HandshakeStage;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Link state of the robot. Exactly one per process, owned by the
/// connection manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Handshake,
    Auth1,
    Auth2,
    Auth3,
    Ready,
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    /// True while authenticating.
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::Handshake | Self::Auth1 | Self::Auth2 | Self::Auth3)
    }
}

impl From<HandshakeStage> for ConnectionState {
    fn from(stage: HandshakeStage) -> Self {
        match stage {
            HandshakeStage::Challenge => Self::Handshake,
            HandshakeStage::Auth1 => Self::Auth1,
            HandshakeStage::Auth2 => Self::Auth2,
            HandshakeStage::Auth3 => Self::Auth3,
            HandshakeStage::Complete => Self::Ready,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshake => "handshake",
            Self::Auth1 => "auth_1",
            Self::Auth2 => "auth_2",
            Self::Auth3 => "auth_3",
            Self::Ready => "ready",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Countdown,
    /// "GO!" shown, first batch imminent.
    Launching,
    Running,
    Paused,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Countdown => "countdown",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    User,
    /// Rep target reached.
    Completed,
    /// Duration elapsed.
    TimeUp,
    Disconnected,
    Shutdown,
}

/// `m:ss` for the time-mode display.
pub fn format_clock(secs: u32) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Lifetime counters, persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(default)]
    pub balls: u64,
    #[serde(default)]
    pub drills: u64,
}

/// Activity since the robot last became ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub started_at: DateTime<Utc>,
    pub balls: u64,
    pub drills: u64,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub totals: Stats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSummary>,
}

// ---------------------------------------------------------------------------
// ActorStatus: generic actor lifecycle
// ---------------------------------------------------------------------------

/// Generic actor lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorStatus {
    Starting,
    Disconnected,
    Connected,
}

impl fmt::Display for ActorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Actor state emitted on the bus. Carries lifecycle status and
/// actor-specific key/value telemetry (device name, link state, run phase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorState {
    pub status: ActorStatus,
    #[serde(default)]
    pub telemetry: HashMap<String, String>,
}

impl ActorState {
    pub fn new(status: ActorStatus, telemetry: HashMap<String, String>) -> Self {
        Self { status, telemetry }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_format() {
        assert_eq!(format_clock(0), "0:00");
        assert_eq!(format_clock(59), "0:59");
        assert_eq!(format_clock(125), "2:05");
    }

    #[test]
    fn handshake_stages_map_to_states() {
        assert_eq!(ConnectionState::from(HandshakeStage::Challenge), ConnectionState::Handshake);
        assert!(ConnectionState::from(HandshakeStage::Auth2).is_handshaking());
        assert!(ConnectionState::from(HandshakeStage::Complete).is_ready());
    }
}
