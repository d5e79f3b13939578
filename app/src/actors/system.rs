//! System actor: always runs and owns every mutation of `SystemState`.
//!
//! Applies `StatsCommand` events through the sole `StatsWriter` and answers
//! with a `StatsSnapshot`. Also processes `ConfigCommand` events (from the
//! REST API), persisting the change and reconciling the running actors.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::actors::{Actor, ROBOT_ID, ReconfigureOutcome, ResolvedActor, resolve_actors, start_actor};
use crate::bus::{BusReceiver, BusSender, PollError};
use crate::state::{StatsWriter, SystemState};
use novadrill::{ConfigAction, ConfigCommand, ConfigOutcome, NovaEvent, NovaMessage};

// ---------------------------------------------------------------------------
// Config reload
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct ConfigReloadOutcome {
    pub applied: Vec<String>,
    pub restarted: Vec<String>,
    pub stopped: Vec<String>,
    pub started: Vec<String>,
}

/// Compare the running actor set against the config and apply changes.
///
/// - Running but no longer configured: stop + remove
/// - Running and configured: `reconfigure()`, restarting if required
/// - Configured but not running: create and start
///
/// With `scope = Some(id)` only that actor is considered.
pub(crate) fn apply_config_reload(
    state: &Arc<SystemState>,
    bus_tx: &broadcast::Sender<NovaMessage>,
    scope: Option<&str>,
) -> ConfigReloadOutcome {
    let snap = state.system.snapshot();
    let mut resolved: HashMap<String, ResolvedActor> = resolve_actors(&snap)
        .into_iter()
        .map(|ra| (ra.id.clone(), ra))
        .collect();

    let current: Vec<String> = state
        .actor_ids()
        .into_iter()
        .filter(|id| id != "system")
        .collect();
    let mut ids: Vec<String> = current.iter().chain(resolved.keys()).cloned().collect();
    ids.sort();
    ids.dedup();
    if let Some(target) = scope {
        ids.retain(|id| id == target);
    }

    let mut result = ConfigReloadOutcome::default();
    for id in ids {
        let running = current.contains(&id);
        match (running, resolved.remove(&id)) {
            (true, None) => {
                tracing::info!("config reload: stopping removed actor '{id}'");
                state.stop_actor(&id);
                state.remove_actor(&id);
                result.stopped.push(id);
            }
            (false, Some(ra)) => {
                tracing::info!("config reload: starting new actor '{id}'");
                start_actor(ra.id, ra.actor, state, bus_tx);
                result.started.push(id);
            }
            (true, Some(ra)) => {
                let sender = BusSender::new(id.clone(), bus_tx.clone(), Arc::new(AtomicBool::new(false)));
                match state.reconfigure_actor(&id, state, &sender) {
                    Some(ReconfigureOutcome::Applied) => {
                        tracing::info!("config reload: applied in-place for '{id}'");
                        result.applied.push(id);
                    }
                    Some(ReconfigureOutcome::RestartRequired) => {
                        tracing::info!("config reload: restarting '{id}'");
                        state.stop_actor(&id);
                        state.remove_actor(&id);
                        std::thread::sleep(Duration::from_millis(100));
                        start_actor(ra.id, ra.actor, state, bus_tx);
                        result.restarted.push(id);
                    }
                    Some(ReconfigureOutcome::NoChange) | None => {}
                }
            }
            (false, None) => {}
        }
    }
    result
}

// ---------------------------------------------------------------------------
// System actor
// ---------------------------------------------------------------------------

struct Handles {
    writer: StatsWriter,
    state: Arc<SystemState>,
    bus_tx: broadcast::Sender<NovaMessage>,
    ready_tx: std_mpsc::SyncSender<()>,
}

/// System actor. Always-on internal housekeeping, not config-driven.
pub struct SystemActor {
    handles: Mutex<Option<Handles>>,
}

impl SystemActor {
    pub fn new(
        writer: StatsWriter,
        state: Arc<SystemState>,
        bus_tx: broadcast::Sender<NovaMessage>,
    ) -> (Self, std_mpsc::Receiver<()>) {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(0);
        let actor = Self {
            handles: Mutex::new(Some(Handles {
                writer,
                state,
                bus_tx,
                ready_tx,
            })),
        };
        (actor, ready_rx)
    }
}

impl Actor for SystemActor {
    fn start(&self, _state: Arc<SystemState>, sender: BusSender, receiver: BusReceiver) {
        let Some(handles) = self.handles.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            tracing::error!("system actor started more than once");
            return;
        };
        if let Err(e) = std::thread::Builder::new()
            .name("system".into())
            .spawn(move || run(handles, sender, receiver))
        {
            tracing::error!("failed to spawn system thread: {e}");
        }
    }
}

fn run(handles: Handles, sender: BusSender, mut receiver: BusReceiver) {
    let Handles {
        writer,
        state,
        bus_tx,
        ready_tx,
    } = handles;

    // Signal main thread that we're up and polling.
    let _ = ready_tx.send(());
    drop(ready_tx);

    loop {
        match receiver.poll() {
            Err(PollError::Shutdown) => return,
            Ok(None) => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(Some(msg)) => match &msg.event {
                NovaEvent::StatsCommand(cmd) => {
                    writer.apply(cmd);
                    sender.emit(state.stats.snapshot());
                }
                NovaEvent::ConfigCommand(cmd) => {
                    handle_config_command(cmd, &state, &bus_tx, &sender);
                }
                _ => {}
            },
        }
    }
}

fn handle_config_command(
    cmd: &ConfigCommand,
    state: &Arc<SystemState>,
    bus_tx: &broadcast::Sender<NovaMessage>,
    sender: &BusSender,
) {
    let scope: Option<String> = match &cmd.action {
        ConfigAction::ReplaceAll { config } => {
            state.system.replace(config.clone());
            None
        }
        ConfigAction::UpdateRobot { section } => {
            state.system.update(|c| c.robot = section.clone());
            Some(ROBOT_ID.to_string())
        }
        ConfigAction::UpdateRun { settings } => {
            // Read at the start of every run; nothing to reconcile.
            state.system.update(|c| c.run = settings.clone());
            Some(ROBOT_ID.to_string())
        }
        ConfigAction::UpsertWebserver { index, section } => {
            state.system.update(|c| {
                c.webserver.insert(index.clone(), section.clone());
            });
            Some(format!("webserver.{index}"))
        }
        ConfigAction::Remove { id } => match id.split_once('.') {
            Some(("webserver", index)) => {
                state.system.update(|c| {
                    c.webserver.remove(index);
                });
                Some(id.clone())
            }
            _ => {
                tracing::warn!("config remove: cannot remove '{id}'");
                None
            }
        },
    };

    let result = match (&cmd.action, scope) {
        (ConfigAction::Remove { .. }, None) => ConfigReloadOutcome::default(),
        (_, scope) => apply_config_reload(state, bus_tx, scope.as_deref()),
    };

    if let Some(request_id) = &cmd.request_id {
        sender.emit(ConfigOutcome {
            request_id: request_id.clone(),
            restarted: result.restarted,
            stopped: result.stopped,
            started: result.started,
        });
    }
}
