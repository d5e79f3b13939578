pub mod config;
pub mod drills;
mod stats;

pub use stats::{StatsStore, StatsWriter};

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::actors::{Actor, ReconfigureOutcome};
use crate::bus::BusSender;
use config::SystemConfig;
use drills::DrillStore;

/// Root entry point for all managed application state.
///
/// Passed as `Arc<SystemState>` to all actors and the web layer.
pub struct SystemState {
    pub system: SystemConfig,
    pub drills: DrillStore,
    pub stats: StatsStore,
    actors: RwLock<HashMap<String, (Box<dyn Actor>, Arc<AtomicBool>)>>,
}

impl SystemState {
    /// `drills.json` and `stats.json` live next to the config file.
    pub fn new(config_path: &Path) -> (Self, StatsWriter) {
        let dir = config_path.parent().unwrap_or(Path::new("."));
        let (stats, writer) = StatsStore::new(dir.join("stats.json"));
        (
            Self {
                system: SystemConfig::new(config_path.to_path_buf()),
                drills: DrillStore::new(dir.join("drills.json")),
                stats,
                actors: RwLock::new(HashMap::new()),
            },
            writer,
        )
    }

    // ----- Actor registry -----

    /// Register an actor in the registry with its shutdown flag.
    pub fn register_actor(&self, id: String, actor: Box<dyn Actor>, shutdown: Arc<AtomicBool>) {
        self.actors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (actor, shutdown));
    }

    pub fn actor_ids(&self) -> Vec<String> {
        self.actors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Run a closure with a reference to the actor for `id`.
    /// Returns `None` if the actor is not registered.
    pub fn with_actor<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&dyn Actor) -> R,
    {
        let guard = self.actors.read().unwrap_or_else(|e| e.into_inner());
        guard.get(id).map(|(a, _)| f(a.as_ref()))
    }

    /// Call `reconfigure()` on the actor identified by `id`.
    pub fn reconfigure_actor(
        &self,
        id: &str,
        state: &Arc<SystemState>,
        sender: &BusSender,
    ) -> Option<ReconfigureOutcome> {
        self.with_actor(id, |actor| actor.reconfigure(state, sender))
    }

    /// Stop an actor by setting its shutdown flag and calling `stop()`.
    pub fn stop_actor(&self, id: &str) {
        let guard = self.actors.read().unwrap_or_else(|e| e.into_inner());
        if let Some((actor, shutdown)) = guard.get(id) {
            shutdown.store(true, Ordering::Relaxed);
            actor.stop();
        }
    }

    pub fn remove_actor(&self, id: &str) -> Option<Box<dyn Actor>> {
        self.actors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|(a, _)| a)
    }
}
