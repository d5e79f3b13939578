//! Actor infrastructure: shared trait and actor resolution.

pub mod robot;
pub mod system;
pub mod web;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::broadcast;

use crate::bus::{BusReceiver, BusSender};
use crate::state::SystemState;
use crate::state::config::{NovaConfig, global_id};
use novadrill::NovaMessage;

/// There is one robot per process.
pub const ROBOT_ID: &str = "robot.0";

// ---------------------------------------------------------------------------
// Actor trait
// ---------------------------------------------------------------------------

/// Outcome of calling `Actor::reconfigure()` after a config change.
pub enum ReconfigureOutcome {
    NoChange,
    /// Applied in-place.
    Applied,
    /// Must stop and recreate the actor (e.g. bind address changed).
    RestartRequired,
}

/// Common trait for self-managed actors. Each actor struct holds its own config;
/// `start()` clones what it needs and spawns a thread.
pub trait Actor: Send + Sync {
    fn start(&self, state: Arc<SystemState>, sender: BusSender, receiver: BusReceiver);

    /// Request the actor to stop. Default: no-op (actors check the shutdown
    /// flag via `BusReceiver::is_shutdown()`).
    fn stop(&self) {}

    /// React to a config change. Implementations compare the current config
    /// snapshot against the actor's construction params.
    fn reconfigure(&self, _state: &Arc<SystemState>, _sender: &BusSender) -> ReconfigureOutcome {
        ReconfigureOutcome::NoChange
    }
}

// ---------------------------------------------------------------------------
// Actor resolution
// ---------------------------------------------------------------------------

/// A concrete actor ready to be started, resolved from config.
pub struct ResolvedActor {
    pub id: String,
    pub name: String,
    pub actor: Box<dyn Actor>,
}

/// Build the flat list of actors from the persisted config: the robot plus
/// every web server. Invalid bind addresses are logged and skipped.
pub fn resolve_actors(config: &NovaConfig) -> Vec<ResolvedActor> {
    let mut actors = vec![ResolvedActor {
        id: ROBOT_ID.to_string(),
        name: config.robot.name.clone(),
        actor: Box::new(robot::RobotActor::new(config.robot.clone())),
    }];

    for (index, ws) in &config.webserver {
        let id = global_id("webserver", index);
        match ws.bind.parse::<SocketAddr>() {
            Ok(addr) => {
                actors.push(ResolvedActor {
                    id,
                    name: ws.name.clone(),
                    actor: Box::new(web::WebActor::new(addr)),
                });
            }
            Err(e) => {
                tracing::warn!("webserver '{id}': invalid bind address '{}': {e}", ws.bind);
            }
        }
    }

    actors
}

/// Start a resolved actor: create bus wrappers, call start(), register in state.
pub fn start_actor(
    id: String,
    actor: Box<dyn Actor>,
    state: &Arc<SystemState>,
    bus_tx: &broadcast::Sender<NovaMessage>,
) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let sender = BusSender::new(id.clone(), bus_tx.clone(), Arc::clone(&shutdown));
    let receiver = sender.subscribe();
    actor.start(Arc::clone(state), sender, receiver);
    state.register_actor(id, actor, shutdown);
}

/// Map of actor IDs to display names.
pub fn actor_names(config: &NovaConfig) -> HashMap<String, String> {
    let mut names = HashMap::new();
    names.insert(ROBOT_ID.to_string(), config.robot.name.clone());
    for (index, ws) in &config.webserver {
        names.insert(global_id("webserver", index), ws.name.clone());
    }
    names
}
