//! Training statistics: lifetime counters plus the current session.
//!
//! Same split as the config cache: `StatsStore` is read-only and lives on
//! `SystemState`; the `StatsWriter` is held by `SystemActor`, which applies
//! every `StatsCommand` from the bus.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use novadrill::{SessionSummary, Stats, StatsCommand, StatsSnapshot};

struct Session {
    started_at: DateTime<Utc>,
    baseline: Stats,
}

struct StatsInner {
    path: PathBuf,
    totals: RwLock<Stats>,
    session: RwLock<Option<Session>>,
}

/// Read handle. Exposes only `snapshot()`.
pub struct StatsStore {
    inner: Arc<StatsInner>,
}

/// Write handle for stats mutations.
pub struct StatsWriter {
    inner: Arc<StatsInner>,
}

pub fn load(path: &Path) -> Stats {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!("failed to parse {}: {e}", path.display());
            Stats::default()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Stats::default(),
        Err(e) => {
            tracing::warn!("failed to read {}: {e}", path.display());
            Stats::default()
        }
    }
}

fn save_to(path: &Path, stats: &Stats) {
    if let Some(dir) = path.parent()
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        tracing::warn!("failed to create stats dir {}: {e}", dir.display());
        return;
    }
    match serde_json::to_string_pretty(stats) {
        Ok(contents) => {
            if let Err(e) = std::fs::write(path, contents) {
                tracing::warn!("failed to write {}: {e}", path.display());
            }
        }
        Err(e) => tracing::warn!("failed to serialize stats: {e}"),
    }
}

impl StatsStore {
    /// Load `stats.json` and create the store with its writer.
    pub fn new(path: PathBuf) -> (Self, StatsWriter) {
        let totals = load(&path);
        let inner = Arc::new(StatsInner {
            path,
            totals: RwLock::new(totals),
            session: RwLock::new(None),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            StatsWriter { inner },
        )
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Utc::now())
    }

    fn snapshot_at(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let totals = *self.inner.totals.read().unwrap_or_else(|e| e.into_inner());
        let session = self
            .inner
            .session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| SessionSummary {
                started_at: s.started_at,
                balls: totals.balls.saturating_sub(s.baseline.balls),
                drills: totals.drills.saturating_sub(s.baseline.drills),
                duration_secs: (now - s.started_at).num_seconds().max(0) as u64,
            });
        StatsSnapshot { totals, session }
    }
}

impl StatsWriter {
    /// Apply one command. Counter changes are persisted immediately.
    pub fn apply(&self, cmd: &StatsCommand) {
        let mut totals = self.inner.totals.write().unwrap_or_else(|e| e.into_inner());
        match cmd {
            StatsCommand::AddBalls { count } => totals.balls += u64::from(*count),
            StatsCommand::AddDrill => totals.drills += 1,
            StatsCommand::StartSession => {
                *self.inner.session.write().unwrap_or_else(|e| e.into_inner()) = Some(Session {
                    started_at: Utc::now(),
                    baseline: *totals,
                });
                return;
            }
            StatsCommand::Reset => {
                *totals = Stats::default();
                if let Some(session) = self
                    .inner
                    .session
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_mut()
                {
                    session.baseline = Stats::default();
                }
            }
        }
        save_to(&self.inner.path, &totals);
    }
}
