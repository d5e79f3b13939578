//! Axum web server: REST endpoints + WebSocket event streaming.

pub mod routes;
pub mod types;
pub mod ws;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::routing::{get, post};
use tokio::sync::{RwLock, broadcast};
use tower_http::cors::CorsLayer;

use crate::actors::{Actor, ReconfigureOutcome, actor_names};
use crate::bus::{BusReceiver, BusSender};
use crate::state::SystemState;
use novadrill::{
    ActorState, ActorStatus, ActorStatusResponse, ConnectionView, NovaEvent, NovaMessage, RunView,
};

fn new_actor(name: String) -> ActorStatusResponse {
    ActorStatusResponse {
        name,
        status: ActorStatus::Disconnected,
        telemetry: HashMap::new(),
    }
}

/// Shared state for the web layer.
pub struct WebState {
    pub root: Arc<SystemState>,
    pub bus_tx: broadcast::Sender<NovaMessage>,
    pub actors: RwLock<HashMap<String, ActorStatusResponse>>,
    pub connection: RwLock<ConnectionView>,
    pub run: RwLock<RunView>,
    pub addr: SocketAddr,
    pub actor_id: String,
    pub ws_count: AtomicU64,
    pub request_count: AtomicU64,
}

impl WebState {
    /// Put an event on the bus stamped with this server's actor id.
    pub fn emit(&self, event: impl Into<NovaEvent>) {
        let _ = self
            .bus_tx
            .send(NovaMessage::new(event).source(&self.actor_id));
    }
}

/// Emit current telemetry as an ActorStatus event on the bus.
fn emit_status(status: ActorStatus, state: &WebState) {
    let mut telemetry = HashMap::from([
        ("bind".into(), state.addr.to_string()),
        (
            "websockets".into(),
            state.ws_count.load(Ordering::Relaxed).to_string(),
        ),
        (
            "requests".into(),
            state.request_count.load(Ordering::Relaxed).to_string(),
        ),
    ]);
    if status == ActorStatus::Disconnected {
        telemetry.insert("error".into(), "bind failed".into());
    }
    state.emit(ActorState::new(status, telemetry));
}

/// Emit Connected telemetry (convenience for periodic emitter + ws handlers).
pub(super) fn emit_telemetry(state: &WebState) {
    emit_status(ActorStatus::Connected, state);
}

// ---------------------------------------------------------------------------
// WebActor: wraps the axum web server as a normal actor
// ---------------------------------------------------------------------------

/// Web server actor. Spawns a dedicated thread with its own tokio runtime
/// to run the axum server and state_updater task.
pub struct WebActor {
    addr: SocketAddr,
    shutdown_tx: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl WebActor {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            shutdown_tx: Mutex::new(None),
        }
    }
}

impl Actor for WebActor {
    fn start(&self, state: Arc<SystemState>, sender: BusSender, _receiver: BusReceiver) {
        let addr = self.addr;
        let actor_id = sender.actor_id().to_string();
        let bus_tx = sender.raw_sender().clone();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        *self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);

        let thread_name = actor_id.clone();
        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let rt = match tokio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("webserver: failed to create tokio runtime: {e}");
                        return;
                    }
                };
                rt.block_on(run(addr, actor_id, state, bus_tx, shutdown_rx));
            });
        if let Err(e) = spawned {
            tracing::error!("webserver: failed to spawn thread: {e}");
        }
    }

    fn stop(&self) {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
    }

    fn reconfigure(&self, state: &Arc<SystemState>, sender: &BusSender) -> ReconfigureOutcome {
        let snap = state.system.snapshot();
        let index = sender.actor_id().strip_prefix("webserver.").unwrap_or("0");
        let new_bind = snap.webserver.get(index).map(|w| w.bind.as_str());
        match new_bind.and_then(|b| b.parse::<SocketAddr>().ok()) {
            Some(new_addr) if new_addr == self.addr => ReconfigureOutcome::NoChange,
            _ => ReconfigureOutcome::RestartRequired,
        }
    }
}

// ---------------------------------------------------------------------------
// Web server run loop
// ---------------------------------------------------------------------------

pub(crate) fn router(state: Arc<WebState>) -> Router {
    // Request counter middleware
    let counter_state = Arc::clone(&state);
    let count_middleware = axum::middleware::from_fn(move |req, next: axum::middleware::Next| {
        let st = Arc::clone(&counter_state);
        async move {
            st.request_count.fetch_add(1, Ordering::Relaxed);
            next.run(req).await
        }
    });

    Router::new()
        .route("/api/status", get(routes::get_status))
        .route(
            "/api/drills",
            get(routes::get_drills).post(routes::post_drill),
        )
        .route("/api/drills/{key}", get(routes::get_drill))
        .route(
            "/api/settings",
            get(routes::get_settings).post(routes::post_settings),
        )
        .route("/api/connect", post(routes::post_connect))
        .route("/api/disconnect", post(routes::post_disconnect))
        .route("/api/run", post(routes::post_run))
        .route("/api/run/test", post(routes::post_test_run))
        .route("/api/run/pause", post(routes::post_pause))
        .route("/api/run/stop", post(routes::post_stop))
        .route("/api/run/skip", post(routes::post_skip))
        .route("/api/shot", post(routes::post_shot))
        .route("/api/stats/reset", post(routes::post_stats_reset))
        .route("/api/ws", get(ws::ws_upgrade))
        .layer(count_middleware)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the web server. Blocks until shutdown signal or bus close.
async fn run(
    addr: SocketAddr,
    actor_id: String,
    root: Arc<SystemState>,
    bus_tx: broadcast::Sender<NovaMessage>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) {
    let state = Arc::new(new_state(root, bus_tx.clone(), addr, actor_id));

    // Background task: subscribe to bus and update web state
    let updater_state = Arc::clone(&state);
    let bus_rx = bus_tx.subscribe();
    tokio::spawn(state_updater(updater_state, bus_rx));

    // Periodic telemetry emitter (every 5s)
    let telemetry_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            emit_telemetry(&telemetry_state);
        }
    });

    let app = router(Arc::clone(&state));

    // Retry bind until success or shutdown
    let mut shutdown_rx = shutdown_rx;
    let listener = loop {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => break l,
            Err(e) => {
                tracing::warn!("web server: failed to bind {addr}: {e}, retrying in 3s");
                emit_status(ActorStatus::Disconnected, &state);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(3)) => continue,
                    _ = &mut shutdown_rx => return,
                }
            }
        }
    };

    tracing::info!("web server listening on {addr}");
    emit_status(ActorStatus::Connected, &state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async { drop(shutdown_rx.await) })
        .await
        .ok();
}

/// Web state with one cached entry per configured actor.
pub(crate) fn new_state(
    root: Arc<SystemState>,
    bus_tx: broadcast::Sender<NovaMessage>,
    addr: SocketAddr,
    actor_id: String,
) -> WebState {
    let names = actor_names(&root.system.snapshot());
    let actors = names
        .into_iter()
        .map(|(id, name)| (id, new_actor(name)))
        .collect();
    WebState {
        root,
        bus_tx,
        actors: RwLock::new(actors),
        connection: RwLock::new(ConnectionView::default()),
        run: RwLock::new(RunView::default()),
        addr,
        actor_id,
        ws_count: AtomicU64::new(0),
        request_count: AtomicU64::new(0),
    }
}

/// Background task that subscribes to the bus and keeps WebState current.
async fn state_updater(state: Arc<WebState>, mut bus_rx: broadcast::Receiver<NovaMessage>) {
    loop {
        match bus_rx.recv().await {
            Ok(msg) => apply_bus_event(&state, &msg).await,
            Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("web state updater: lagged, dropped {n} events");
            }
        }
    }
}

async fn apply_bus_event(state: &WebState, msg: &NovaMessage) {
    match &msg.event {
        NovaEvent::ActorStatus(update) => {
            let mut actors = state.actors.write().await;
            let actor = actors
                .entry(msg.source.clone())
                .or_insert_with(|| new_actor(String::new()));
            actor.status = update.status;
            actor.telemetry = update.telemetry.clone();
        }
        NovaEvent::Connection(changed) => {
            let mut view = state.connection.write().await;
            view.state = changed.state;
            view.device = changed.device.clone();
        }
        NovaEvent::Run(event) => state.run.write().await.apply(event),
        NovaEvent::ConfigOutcome(result) => {
            if !result.started.is_empty()
                || !result.stopped.is_empty()
                || !result.restarted.is_empty()
            {
                // Refresh actor names from config
                let snap = state.root.system.snapshot();
                let names = actor_names(&snap);

                let mut actors = state.actors.write().await;
                for (id, name) in &names {
                    let entry = actors
                        .entry(id.clone())
                        .or_insert_with(|| new_actor(name.clone()));
                    entry.name = name.clone();
                }
                // Remove stopped actors from cache
                for id in &result.stopped {
                    actors.remove(id);
                }
            }
        }
        // Stats are read from the store; commands and alerts need no caching
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novadrill::{ConnectionChanged, ConnectionState, RunEvent, RunPhase};

    pub(super) fn test_state() -> Arc<WebState> {
        let dir = std::env::temp_dir().join(format!("novadrill-web-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let (root, _writer) = SystemState::new(&dir.join("config.toml"));
        let (bus_tx, _) = broadcast::channel(64);
        Arc::new(new_state(
            Arc::new(root),
            bus_tx,
            "127.0.0.1:3030".parse().unwrap(),
            "webserver.0".into(),
        ))
    }

    #[tokio::test]
    async fn caches_connection_and_run_progress() {
        let state = test_state();
        let msg = |event: NovaEvent| NovaMessage::new(event).source("robot.0");

        apply_bus_event(
            &state,
            &msg(ConnectionChanged {
                state: ConnectionState::Ready,
                device: Some("Nova".into()),
            }
            .into()),
        )
        .await;
        apply_bus_event(&state, &msg(RunEvent::Countdown { remaining: 3 }.into())).await;

        let conn = state.connection.read().await.clone();
        assert_eq!(conn.state, ConnectionState::Ready);
        assert_eq!(conn.device.as_deref(), Some("Nova"));
        assert_eq!(state.run.read().await.phase, RunPhase::Countdown);
    }

    #[tokio::test]
    async fn actor_cache_starts_from_config() {
        let state = test_state();
        let actors = state.actors.read().await;
        assert!(actors.contains_key("robot.0"));
        assert!(actors.contains_key("webserver.0"));
    }
}
