use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drill::Level;
use crate::shot::{MAX_REPS, MIN_REPS};

const MIN_PAUSE_SECS: f64 = 0.5;
const MAX_PAUSE_SECS: f64 = 5.0;

/// How the robot is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Ble,
    /// In-process simulated robot.
    Mock,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble => write!(f, "ble"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// Whether a run ends after N repetitions or after a fixed duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Reps,
    Time,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reps => write!(f, "reps"),
            Self::Time => write!(f, "time"),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted config types
// ---------------------------------------------------------------------------

/// Top-level persisted config (`config.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NovaConfig {
    #[serde(default)]
    pub robot: RobotSection,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub webserver: HashMap<String, WebserverSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebserverSection {
    #[serde(default)]
    pub name: String,
    pub bind: String,
}

/// The robot link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotSection {
    #[serde(default = "default_robot_name")]
    pub name: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// Only connect to peripherals whose advertised name starts with this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
    /// 0 disables the timeout.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default)]
    pub auto_connect: bool,
}

fn default_robot_name() -> String {
    "Nova Robot".into()
}

fn default_scan_timeout() -> u64 {
    15
}

fn default_handshake_timeout() -> u64 {
    10
}

impl Default for RobotSection {
    fn default() -> Self {
        Self {
            name: default_robot_name(),
            transport: TransportKind::default(),
            name_prefix: None,
            scan_timeout_secs: default_scan_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            auto_connect: false,
        }
    }
}

impl RobotSection {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_secs > 0).then(|| Duration::from_secs(self.handshake_timeout_secs))
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs.max(1))
    }
}

/// Inputs the runner reads when a drill starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub level: Level,
    #[serde(default = "default_reps")]
    pub reps: u32,
    #[serde(default = "default_duration")]
    pub duration_secs: u32,
    /// Pause between batches, in seconds.
    #[serde(default = "default_pause")]
    pub pause_secs: f64,
}

fn default_reps() -> u32 {
    10
}

fn default_duration() -> u32 {
    60
}

fn default_pause() -> f64 {
    1.0
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            level: Level::default(),
            reps: default_reps(),
            duration_secs: default_duration(),
            pause_secs: default_pause(),
        }
    }
}

impl RunSettings {
    pub fn rep_target(&self) -> u32 {
        self.reps.clamp(MIN_REPS, MAX_REPS)
    }

    pub fn inter_shot_pause(&self) -> Duration {
        let secs = if self.pause_secs.is_finite() {
            self.pause_secs.clamp(MIN_PAUSE_SECS, MAX_PAUSE_SECS)
        } else {
            default_pause()
        };
        Duration::from_millis((secs * 1000.0).round() as u64)
    }
}

impl Default for NovaConfig {
    /// A BLE robot and one web server on all interfaces.
    fn default() -> Self {
        let mut webserver = HashMap::new();
        webserver.insert(
            "0".into(),
            WebserverSection {
                name: "Web Server".into(),
                bind: "0.0.0.0:3030".into(),
            },
        );
        Self {
            robot: RobotSection::default(),
            run: RunSettings::default(),
            webserver,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_is_clamped() {
        let mut run = RunSettings::default();
        assert_eq!(run.inter_shot_pause(), Duration::from_secs(1));
        run.pause_secs = 0.1;
        assert_eq!(run.inter_shot_pause(), Duration::from_millis(500));
        run.pause_secs = 12.0;
        assert_eq!(run.inter_shot_pause(), Duration::from_secs(5));
        run.pause_secs = f64::NAN;
        assert_eq!(run.inter_shot_pause(), Duration::from_secs(1));
    }

    #[test]
    fn rep_target_is_bounded() {
        let mut run = RunSettings::default();
        run.reps = 0;
        assert_eq!(run.rep_target(), 1);
        run.reps = 1000;
        assert_eq!(run.rep_target(), 200);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: NovaConfig = toml_like(
            r#"{"robot": {"transport": "mock", "handshake_timeout_secs": 0}, "run": {"mode": "time"}}"#,
        );
        assert_eq!(config.robot.transport, TransportKind::Mock);
        assert_eq!(config.robot.handshake_timeout(), None);
        assert_eq!(config.robot.scan_timeout_secs, 15);
        assert_eq!(config.run.mode, RunMode::Time);
        assert_eq!(config.run.reps, 10);
        assert!(config.webserver.is_empty());
    }

    fn toml_like(json: &str) -> NovaConfig {
        serde_json::from_str(json).unwrap()
    }
}
