//! REST API request/response types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::drill::{DrillStep, Level};
use crate::shot::ShotParameters;
use crate::{ActorStatus, ConnectionState, RunEvent, RunMode, RunPhase, StatsSnapshot, StopReason};

/// GET /api/status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub actors: HashMap<String, ActorStatusResponse>,
    pub connection: ConnectionView,
    pub run: RunView,
    pub stats: StatsSnapshot,
}

/// Per-actor status within the status response. Also used as the cached
/// per-actor state in the web layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorStatusResponse {
    #[serde(default)]
    pub name: String,
    pub status: ActorStatus,
    #[serde(default)]
    pub telemetry: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionView {
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

/// What a display would currently show for the run, folded from `RunEvent`s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunView {
    pub phase: RunPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drill: Option<String>,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdown: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reps_remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<String>,
    #[serde(default)]
    pub batches: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_played: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stop: Option<StopReason>,
}

impl RunView {
    pub fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::LastPlayed { drill } => self.last_played = Some(drill.clone()),
            RunEvent::Countdown { remaining } => {
                self.phase = RunPhase::Countdown;
                self.countdown = Some(*remaining);
            }
            RunEvent::Go => {
                self.phase = RunPhase::Launching;
                self.countdown = None;
            }
            RunEvent::Started {
                drill,
                test_mode,
                mode,
            } => {
                let last_played = self.last_played.take();
                *self = RunView {
                    phase: RunPhase::Running,
                    drill: drill.clone(),
                    test_mode: *test_mode,
                    mode: *mode,
                    last_played,
                    ..RunView::default()
                };
            }
            RunEvent::RepsRemaining { remaining } => self.reps_remaining = Some(*remaining),
            RunEvent::TimeRemaining { display, .. } => self.time_remaining = Some(display.clone()),
            RunEvent::BatchSent { iteration, .. } => self.batches = *iteration,
            RunEvent::Paused => self.phase = RunPhase::Paused,
            RunEvent::Resumed => self.phase = RunPhase::Running,
            RunEvent::Stopped { reason } => {
                self.phase = RunPhase::Idle;
                self.countdown = None;
                self.last_stop = Some(*reason);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Drills
// ---------------------------------------------------------------------------

/// GET /api/drills response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillListResponse {
    pub categories: Vec<DrillCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillCategory {
    pub name: String,
    pub drills: Vec<DrillSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillSummary {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub randomize: bool,
    /// Active step count per level.
    pub active_steps: [usize; 3],
}

/// POST /api/drills request body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateDrillRequest {
    pub category: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateDrillResponse {
    pub key: String,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// POST /api/run request body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StartDrillRequest {
    pub drill: String,
    #[serde(default)]
    pub level: Option<Level>,
    #[serde(default)]
    pub mode: Option<RunMode>,
}

/// POST /api/run/test request body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestRunRequest {
    pub steps: Vec<DrillStep>,
    #[serde(default)]
    pub randomize: bool,
}

/// POST /api/shot request body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShotRequest {
    pub shot: ShotParameters,
}

/// POST /api/settings response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostSettingsResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restarted: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stopped: Vec<String>,
}
