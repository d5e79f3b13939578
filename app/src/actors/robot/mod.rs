//! Robot actor: owns the link to the robot and the drill runner.
//!
//! Runs on its own thread with a dedicated tokio runtime. The event loop
//! multiplexes bus commands, link notifications, runner timers and the
//! handshake deadline. Runner side effects go through `SessionHost`, which
//! maps them onto the write queue, the scheduler and the bus.

mod ble;
mod connection;
mod mock;
mod queue;
mod runner;
mod scheduler;
mod transport;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use novadrill::{
    ActorState, ActorStatus, AlertLevel, ConnectionState, NovaEvent, NovaMessage, RobotCommand,
    RobotSection, RunEvent, StatsCommand, StopReason, codec,
};

use self::connection::{ConnectionManager, Routed};
use self::runner::{DrillRunner, RunError, RunTimer, RunnerHost};
use self::scheduler::{Fired, Scheduler};
use self::transport::{LinkEvent, Transport, TransportError};
use super::{Actor, ReconfigureOutcome};
use crate::bus::{BusReceiver, BusSender};
use crate::state::SystemState;

// ---------------------------------------------------------------------------
// RobotActor
// ---------------------------------------------------------------------------

pub struct RobotActor {
    section: RobotSection,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl RobotActor {
    pub fn new(section: RobotSection) -> Self {
        Self {
            section,
            shutdown_tx: Mutex::new(None),
        }
    }
}

impl Actor for RobotActor {
    fn start(&self, state: Arc<SystemState>, sender: BusSender, receiver: BusReceiver) {
        let section = self.section.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);

        let thread_name = sender.actor_id().to_string();
        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let rt = match tokio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("robot: failed to create tokio runtime: {e}");
                        return;
                    }
                };
                let transport = transport::from_config(&section);
                rt.block_on(run(section, transport, state, sender, receiver, shutdown_rx));
            });
        if let Err(e) = spawned {
            tracing::error!("robot: failed to spawn thread: {e}");
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

    /// Run settings are read at the start of every drill, so only a changed
    /// `[robot]` section needs a new link.
    fn reconfigure(&self, state: &Arc<SystemState>, _sender: &BusSender) -> ReconfigureOutcome {
        if state.system.snapshot().robot == self.section {
            ReconfigureOutcome::NoChange
        } else {
            ReconfigureOutcome::RestartRequired
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn run(
    section: RobotSection,
    transport: Box<dyn Transport>,
    state: Arc<SystemState>,
    sender: BusSender,
    mut receiver: BusReceiver,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let (scheduler, mut fired_rx) = Scheduler::new();
    let mut robot = Robot {
        conn: ConnectionManager::new(transport, sender.clone(), section.handshake_timeout()),
        runner: DrillRunner::new(),
        scheduler,
        sender,
        state,
        last_status: None,
    };
    robot.publish_status();

    if section.auto_connect {
        robot.connect().await;
    }

    loop {
        let deadline = robot.conn.handshake_deadline();
        tokio::select! {
            _ = &mut shutdown_rx => break,
            msg = receiver.recv() => match msg {
                Ok(msg) => robot.on_message(msg).await,
                Err(_) => break,
            },
            event = robot.conn.next_event() => robot.on_link_event(event),
            Some(fired) = fired_rx.recv() => robot.on_fired(fired),
            _ = wait_until(deadline) => robot.conn.handshake_timed_out().await,
        }
        robot.publish_status();
    }

    info!("robot: shutting down");
    robot.stop_run(StopReason::Shutdown);
    robot.conn.disconnect().await;
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Robot {
    conn: ConnectionManager,
    runner: DrillRunner,
    scheduler: Scheduler,
    sender: BusSender,
    state: Arc<SystemState>,
    last_status: Option<ActorState>,
}

impl Robot {
    /// Lend the runner a host wired to this robot's link, timers and bus.
    fn with_runner<R>(&mut self, f: impl FnOnce(&mut DrillRunner, &mut dyn RunnerHost) -> R) -> R {
        let mut host = SessionHost {
            conn: &self.conn,
            scheduler: &mut self.scheduler,
            sender: &self.sender,
        };
        f(&mut self.runner, &mut host)
    }

    fn stop_run(&mut self, reason: StopReason) {
        if self.runner.is_active() {
            self.with_runner(|runner, host| runner.stop_run(reason, host));
        }
    }

    async fn connect(&mut self) {
        // Failures are already alerted by the connection manager.
        let _ = self.conn.connect().await;
    }

    async fn on_message(&mut self, msg: NovaMessage) {
        let NovaEvent::RobotCommand(cmd) = msg.event else {
            return;
        };
        debug!("robot: command {cmd:?} from {}", msg.source);
        match cmd {
            RobotCommand::Connect => self.connect().await,
            RobotCommand::Disconnect => {
                self.stop_run(StopReason::Disconnected);
                self.conn.disconnect().await;
            }
            // Always halts the motors; with no link the stop packet is dropped.
            RobotCommand::Stop => {
                self.with_runner(|runner, host| runner.stop_run(StopReason::User, host));
            }
            cmd => {
                if let Err(e) = self.dispatch(cmd) {
                    warn!("robot: {e}");
                    self.sender.alert(AlertLevel::Warn, e.to_string());
                }
            }
        }
    }

    /// Commands that need a ready link.
    fn dispatch(&mut self, cmd: RobotCommand) -> Result<(), RunError> {
        if !self.conn.is_ready() {
            return Err(RunError::NotConnected);
        }
        match cmd {
            RobotCommand::StartDrill { drill, level, mode } => {
                let settings = self.state.system.snapshot().run;
                let level = level.unwrap_or(settings.level);
                let mode = mode.unwrap_or(settings.mode);
                let state = Arc::clone(&self.state);
                self.with_runner(|runner, host| {
                    state.drills.read(|lib| {
                        runner.start_drill_sequence(&drill, lib, level, mode, &settings, host)
                    })
                })
            }
            RobotCommand::StartTestRun { steps, randomize } => {
                let settings = self.state.system.snapshot().run;
                self.with_runner(|runner, host| {
                    runner.start_test_run(steps, randomize, &settings, host)
                })
            }
            RobotCommand::TogglePause => {
                self.with_runner(|runner, host| runner.toggle_pause(host));
                Ok(())
            }
            RobotCommand::SkipCountdown => {
                self.with_runner(|runner, host| runner.skip_countdown(host));
                Ok(())
            }
            RobotCommand::FireShot { shot } => {
                if self.runner.is_active() {
                    return Err(RunError::AlreadyActive);
                }
                let packet = codec::build_fire_packet([&shot.test_fire()])?;
                self.with_runner(|_, host| host.transmit(packet));
                Ok(())
            }
            RobotCommand::Connect | RobotCommand::Disconnect | RobotCommand::Stop => Ok(()),
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Notification(data) => match self.conn.handle_notification(&data) {
                Routed::Done => self.with_runner(|runner, host| runner.handle_done(host)),
                Routed::Ready => info!("robot: ready"),
                Routed::Handshake | Routed::Ignored => {}
            },
            LinkEvent::Disconnected => {
                self.conn.on_link_lost();
                self.stop_run(StopReason::Disconnected);
            }
        }
    }

    fn on_fired(&mut self, fired: Fired) {
        if self.scheduler.accept(&fired) {
            self.with_runner(|runner, host| runner.on_timer(fired.timer, host));
        }
    }

    /// Emit an ActorStatus event when connection state or run phase changed.
    fn publish_status(&mut self) {
        let conn_state = self.conn.state();
        let status = match conn_state {
            ConnectionState::Ready => ActorStatus::Connected,
            ConnectionState::Disconnected => ActorStatus::Disconnected,
            _ => ActorStatus::Starting,
        };
        let mut telemetry = HashMap::from([
            ("state".to_string(), conn_state.to_string()),
            ("phase".to_string(), format!("{:?}", self.runner.phase()).to_lowercase()),
        ]);
        if let Some(device) = self.conn.device() {
            telemetry.insert("device".into(), device.to_string());
        }
        let current = ActorState::new(status, telemetry);
        if self.last_status.as_ref() != Some(&current) {
            self.sender.emit(current.clone());
            self.last_status = Some(current);
        }
    }
}

// ---------------------------------------------------------------------------
// SessionHost
// ---------------------------------------------------------------------------

struct SessionHost<'a> {
    conn: &'a ConnectionManager,
    scheduler: &'a mut Scheduler,
    sender: &'a BusSender,
}

impl RunnerHost for SessionHost<'_> {
    fn transmit(&mut self, packet: Vec<u8>) {
        match self.conn.send_packet(packet) {
            Ok(_ticket) => {}
            Err(TransportError::NotConnected) => debug!("robot: packet dropped, no link"),
            Err(e) => warn!("robot: packet not queued: {e}"),
        }
    }

    fn schedule(&mut self, timer: RunTimer, after: Duration) {
        self.scheduler.schedule(timer, after);
    }

    fn cancel(&mut self, timer: RunTimer) {
        self.scheduler.cancel(timer);
    }

    fn cancel_all(&mut self) {
        self.scheduler.cancel_all();
    }

    fn publish(&mut self, event: RunEvent) {
        self.sender.emit(event);
    }

    fn record(&mut self, cmd: StatsCommand) {
        self.sender.emit(cmd);
    }
}
