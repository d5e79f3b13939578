//! REST endpoint handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use tokio::sync::broadcast;

use super::WebState;
use super::types::{
    CreateDrillRequest, CreateDrillResponse, DrillCategory, DrillListResponse, DrillSummary,
    PostSettingsResponse, ShotRequest, StartDrillRequest, StatusResponse, TestRunRequest,
};
use novadrill::{
    ConfigAction, ConfigCommand, Drill, DrillLookup, Level, NovaConfig, NovaEvent, RobotCommand,
    StatsCommand,
};

/// GET /api/status
pub async fn get_status(State(state): State<Arc<WebState>>) -> Json<StatusResponse> {
    let actors = state.actors.read().await.clone();
    let connection = state.connection.read().await.clone();
    let run = state.run.read().await.clone();
    Json(StatusResponse {
        actors,
        connection,
        run,
        stats: state.root.stats.snapshot(),
    })
}

// ---------------------------------------------------------------------------
// Drills
// ---------------------------------------------------------------------------

/// GET /api/drills: every category with a summary of each drill.
pub async fn get_drills(State(state): State<Arc<WebState>>) -> Json<DrillListResponse> {
    let categories = state.root.drills.read(|lib| {
        lib.categories()
            .into_iter()
            .map(|(name, keys)| DrillCategory {
                name,
                drills: keys
                    .into_iter()
                    .filter_map(|key| {
                        let drill = lib.drill(&key)?;
                        Some(DrillSummary {
                            name: drill.name.clone(),
                            randomize: drill.randomize,
                            active_steps: Level::ALL.map(|l| drill.active_steps(l).len()),
                            key,
                        })
                    })
                    .collect(),
            })
            .collect()
    });
    Json(DrillListResponse { categories })
}

/// GET /api/drills/{key}
pub async fn get_drill(
    State(state): State<Arc<WebState>>,
    Path(key): Path<String>,
) -> Result<Json<Drill>, StatusCode> {
    state
        .root
        .drills
        .read(|lib| lib.drill(&key).cloned())
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /api/drills: create an empty user drill.
pub async fn post_drill(
    State(state): State<Arc<WebState>>,
    Json(body): Json<CreateDrillRequest>,
) -> Result<Json<CreateDrillResponse>, (StatusCode, String)> {
    state
        .root
        .drills
        .create(&body.category, &body.name)
        .map(|key| Json(CreateDrillResponse { key }))
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

// ---------------------------------------------------------------------------
// Robot commands
// ---------------------------------------------------------------------------

// The robot actor validates and reports failures as alerts, so these only
// acknowledge that the command was queued.

fn command(state: &WebState, cmd: RobotCommand) -> StatusCode {
    state.emit(cmd);
    StatusCode::ACCEPTED
}

pub async fn post_connect(State(state): State<Arc<WebState>>) -> StatusCode {
    command(&state, RobotCommand::Connect)
}

pub async fn post_disconnect(State(state): State<Arc<WebState>>) -> StatusCode {
    command(&state, RobotCommand::Disconnect)
}

/// POST /api/run: start a library drill. Unknown keys are rejected here.
pub async fn post_run(
    State(state): State<Arc<WebState>>,
    Json(body): Json<StartDrillRequest>,
) -> StatusCode {
    if !state.root.drills.read(|lib| lib.drill(&body.drill).is_some()) {
        return StatusCode::NOT_FOUND;
    }
    command(
        &state,
        RobotCommand::StartDrill {
            drill: body.drill,
            level: body.level,
            mode: body.mode,
        },
    )
}

/// POST /api/run/test
pub async fn post_test_run(
    State(state): State<Arc<WebState>>,
    Json(body): Json<TestRunRequest>,
) -> StatusCode {
    command(
        &state,
        RobotCommand::StartTestRun {
            steps: body.steps,
            randomize: body.randomize,
        },
    )
}

pub async fn post_pause(State(state): State<Arc<WebState>>) -> StatusCode {
    command(&state, RobotCommand::TogglePause)
}

pub async fn post_stop(State(state): State<Arc<WebState>>) -> StatusCode {
    command(&state, RobotCommand::Stop)
}

pub async fn post_skip(State(state): State<Arc<WebState>>) -> StatusCode {
    command(&state, RobotCommand::SkipCountdown)
}

/// POST /api/shot: fire one test ball.
pub async fn post_shot(
    State(state): State<Arc<WebState>>,
    Json(body): Json<ShotRequest>,
) -> StatusCode {
    command(&state, RobotCommand::FireShot { shot: body.shot })
}

pub async fn post_stats_reset(State(state): State<Arc<WebState>>) -> StatusCode {
    state.emit(StatsCommand::Reset);
    StatusCode::ACCEPTED
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// GET /api/settings: returns the full persisted config.
pub async fn get_settings(State(state): State<Arc<WebState>>) -> Json<NovaConfig> {
    Json(state.root.system.snapshot())
}

/// POST /api/settings: config replacement via bus request-reply.
///
/// Emits a `ConfigCommand` on the bus, waits for `ConfigOutcome` with a
/// matching `request_id`, then returns the response. SystemActor handles
/// persistence and actor reconciliation.
pub async fn post_settings(
    State(state): State<Arc<WebState>>,
    Json(new_config): Json<NovaConfig>,
) -> Json<PostSettingsResponse> {
    let request_id = crate::state::config::generate_id();
    let mut bus_rx = state.bus_tx.subscribe();

    state.emit(ConfigCommand {
        request_id: Some(request_id.clone()),
        action: ConfigAction::ReplaceAll { config: new_config },
    });

    // Wait for ConfigOutcome with matching request_id (10s timeout)
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match bus_rx.recv().await {
                Ok(msg) => {
                    if let NovaEvent::ConfigOutcome(ref r) = msg.event
                        && r.request_id == request_id
                    {
                        return Some(r.clone());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    })
    .await;

    match result {
        Ok(Some(r)) => Json(PostSettingsResponse {
            restarted: r.restarted,
            stopped: r.stopped,
        }),
        _ => {
            tracing::warn!("config update: timed out waiting for ConfigOutcome");
            Json(PostSettingsResponse {
                restarted: Vec::new(),
                stopped: Vec::new(),
            })
        }
    }
}
