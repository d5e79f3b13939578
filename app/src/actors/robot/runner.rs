//! Drill runner: countdown, batch transmission and pacing against the
//! robot's completion reports.
//!
//! The runner is synchronous and owns no I/O. Everything it does to the
//! outside world goes through a `RunnerHost`: packets to send, timers to
//! arm or cancel, progress events and statistics. The robot actor feeds
//! completion reports and fired timers back in.
//!
//! ```text
//! idle -> countdown(4..1) -> launching -> executing(running|paused) -> idle
//! ```
//!
//! Iterations after the first are driven only by `handle_done`; a batch the
//! robot never reports as finished stalls the run until it is stopped.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};

use novadrill::codec;
use novadrill::shot::{DROP_STEP, MAX_DROP, MIN_DROP};
use novadrill::{
    DrillLookup, DrillStep, Level, RunEvent, RunMode, RunPhase, RunSettings, ShotParameters,
    StatsCommand, StopReason, format_clock,
};

pub const COUNTDOWN_FROM: u8 = 4;
pub const COUNTDOWN_TICK: Duration = Duration::from_secs(1);
pub const GO_DELAY: Duration = Duration::from_millis(800);
const DURATION_TICK: Duration = Duration::from_secs(1);

/// Timers the runner arms through its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunTimer {
    CountdownTick,
    StartDelay,
    DurationTick,
    InterShot,
}

/// Side effects of the runner.
pub trait RunnerHost {
    /// Queue a packet for the robot. Fire-and-forget.
    fn transmit(&mut self, packet: Vec<u8>);
    fn schedule(&mut self, timer: RunTimer, after: Duration);
    fn cancel(&mut self, timer: RunTimer);
    fn cancel_all(&mut self);
    fn publish(&mut self, event: RunEvent);
    fn record(&mut self, cmd: StatsCommand);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RunError {
    #[error("A drill is already running")]
    AlreadyActive,
    #[error("Unknown drill '{0}'")]
    UnknownDrill(String),
    #[error("No active balls in this drill")]
    NoActiveBalls,
    #[error("Device not connected")]
    NotConnected,
    #[error(transparent)]
    TooManyBalls(#[from] codec::BatchTooLarge),
}

/// Each step contributes at most one ball to a batch.
fn check_batch_size(steps: &[DrillStep]) -> Result<(), RunError> {
    if steps.len() > codec::MAX_RECORDS {
        return Err(codec::BatchTooLarge(steps.len()).into());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Countdown(u8),
    Launching,
    Executing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Reps { target: u32, count: u32 },
    Time { remaining: u32 },
    /// Test mode.
    Unlimited,
}

#[derive(Debug)]
struct Session {
    stage: Stage,
    drill: Option<String>,
    steps: Vec<DrillStep>,
    randomize: bool,
    target: Target,
    pause: Duration,
    paused: bool,
    test_mode: bool,
    /// A batch went out and its completion has not arrived yet.
    awaiting_done: bool,
    last_packet: Option<Vec<u8>>,
    iterations: u32,
}

impl Session {
    fn mode(&self) -> Option<RunMode> {
        match self.target {
            Target::Reps { .. } => Some(RunMode::Reps),
            Target::Time { .. } => Some(RunMode::Time),
            Target::Unlimited => None,
        }
    }
}

pub struct DrillRunner {
    rng: Box<dyn RngCore + Send>,
    session: Option<Session>,
}

impl Default for DrillRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl DrillRunner {
    pub fn new() -> Self {
        Self::with_rng(Box::new(StdRng::from_entropy()))
    }

    pub fn with_rng(rng: Box<dyn RngCore + Send>) -> Self {
        Self { rng, session: None }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn phase(&self) -> RunPhase {
        match &self.session {
            None => RunPhase::Idle,
            Some(s) => match s.stage {
                Stage::Countdown(_) => RunPhase::Countdown,
                Stage::Launching => RunPhase::Launching,
                Stage::Executing if s.paused => RunPhase::Paused,
                Stage::Executing => RunPhase::Running,
            },
        }
    }

    // ---------------------------------------------------------------------
    // Starting
    // ---------------------------------------------------------------------

    /// Resolve `key`, filter inactive steps, and start the countdown.
    /// On error nothing changes.
    pub fn start_drill_sequence(
        &mut self,
        key: &str,
        lookup: &dyn DrillLookup,
        level: Level,
        mode: RunMode,
        settings: &RunSettings,
        host: &mut dyn RunnerHost,
    ) -> Result<(), RunError> {
        if self.session.is_some() {
            return Err(RunError::AlreadyActive);
        }
        let drill = lookup
            .drill(key)
            .ok_or_else(|| RunError::UnknownDrill(key.to_string()))?;
        let steps = drill.active_steps(level);
        if steps.is_empty() {
            return Err(RunError::NoActiveBalls);
        }
        check_batch_size(&steps)?;

        let target = match mode {
            RunMode::Reps => Target::Reps {
                target: settings.rep_target(),
                count: 0,
            },
            RunMode::Time => Target::Time {
                remaining: settings.duration_secs.max(1),
            },
        };
        tracing::info!(
            "runner: starting '{key}' ({level}, {mode}, {} steps)",
            steps.len()
        );
        self.session = Some(Session {
            stage: Stage::Countdown(COUNTDOWN_FROM),
            drill: Some(key.to_string()),
            steps,
            randomize: drill.randomize,
            target,
            pause: settings.inter_shot_pause(),
            paused: false,
            test_mode: false,
            awaiting_done: false,
            last_packet: None,
            iterations: 0,
        });

        host.publish(RunEvent::LastPlayed {
            drill: key.to_string(),
        });
        host.publish(RunEvent::Countdown {
            remaining: COUNTDOWN_FROM,
        });
        host.schedule(RunTimer::CountdownTick, COUNTDOWN_TICK);
        Ok(())
    }

    /// Loop caller-supplied steps with no countdown, target or statistics.
    pub fn start_test_run(
        &mut self,
        steps: Vec<DrillStep>,
        randomize: bool,
        settings: &RunSettings,
        host: &mut dyn RunnerHost,
    ) -> Result<(), RunError> {
        if self.session.is_some() {
            return Err(RunError::AlreadyActive);
        }
        let steps: Vec<DrillStep> = steps.into_iter().filter(|s| s.is_active()).collect();
        if steps.is_empty() {
            return Err(RunError::NoActiveBalls);
        }
        check_batch_size(&steps)?;
        tracing::info!("runner: test run ({} steps)", steps.len());
        self.session = Some(Session {
            stage: Stage::Countdown(0),
            drill: None,
            steps,
            randomize,
            target: Target::Unlimited,
            pause: settings.inter_shot_pause(),
            paused: false,
            test_mode: true,
            awaiting_done: false,
            last_packet: None,
            iterations: 0,
        });
        self.begin_execution(host);
        Ok(())
    }

    /// Jump from the countdown straight to execution.
    pub fn skip_countdown(&mut self, host: &mut dyn RunnerHost) {
        if matches!(
            self.session.as_ref().map(|s| s.stage),
            Some(Stage::Countdown(_) | Stage::Launching)
        ) {
            host.cancel(RunTimer::CountdownTick);
            host.cancel(RunTimer::StartDelay);
            self.begin_execution(host);
        }
    }

    fn begin_execution(&mut self, host: &mut dyn RunnerHost) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.stage = Stage::Executing;
        host.publish(RunEvent::Started {
            drill: session.drill.clone(),
            test_mode: session.test_mode,
            mode: session.mode(),
        });
        if !session.test_mode {
            host.record(StatsCommand::AddDrill);
        }
        if let Target::Time { remaining } = session.target {
            host.publish(RunEvent::TimeRemaining {
                secs: remaining,
                display: format_clock(remaining),
            });
            host.schedule(RunTimer::DurationTick, DURATION_TICK);
        }
        self.run_iteration(host);
    }

    // ---------------------------------------------------------------------
    // Iterations
    // ---------------------------------------------------------------------

    /// Build and send one batch covering every step once. No-op unless
    /// executing, unpaused and not waiting on a previous batch.
    fn run_iteration(&mut self, host: &mut dyn RunnerHost) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.stage != Stage::Executing || session.paused || session.awaiting_done {
            return;
        }

        if let Target::Reps { target, count } = &mut session.target {
            host.publish(RunEvent::RepsRemaining {
                remaining: target.saturating_sub(*count),
            });
            *count += 1;
        }

        let rng = self.rng.as_mut();
        let mut order: Vec<&DrillStep> = session.steps.iter().collect();
        if session.randomize {
            order.shuffle(&mut *rng);
        }
        let shots: Vec<ShotParameters> = order
            .into_iter()
            .filter_map(|step| pick_shot(step, &mut *rng))
            .collect();
        if shots.is_empty() {
            return;
        }

        let packet = match codec::build_fire_packet(&shots) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::error!("runner: {e}");
                return;
            }
        };
        session.iterations += 1;
        session.awaiting_done = true;
        session.last_packet = Some(packet.clone());
        tracing::debug!(
            "runner: batch {} with {} balls",
            session.iterations,
            shots.len()
        );

        if !session.test_mode {
            host.record(StatsCommand::AddBalls {
                count: shots.len() as u32,
            });
        }
        host.publish(RunEvent::BatchSent {
            iteration: session.iterations,
            balls: shots.len(),
        });
        host.transmit(packet);
    }

    /// The robot reported a finished batch.
    pub fn handle_done(&mut self, host: &mut dyn RunnerHost) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.stage != Stage::Executing {
            return;
        }
        session.awaiting_done = false;

        if let Target::Reps { target, count } = session.target
            && count >= target
        {
            self.stop_run(StopReason::Completed, host);
            return;
        }
        if !session.paused {
            host.schedule(RunTimer::InterShot, session.pause);
        }
    }

    pub fn toggle_pause(&mut self, host: &mut dyn RunnerHost) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.stage != Stage::Executing {
            return;
        }
        if session.paused {
            session.paused = false;
            host.publish(RunEvent::Resumed);
            if session.awaiting_done {
                // The interrupted batch is sent again; it is the same rep.
                if let Some(packet) = session.last_packet.clone() {
                    host.transmit(packet);
                }
            } else {
                self.run_iteration(host);
            }
        } else {
            session.paused = true;
            host.cancel(RunTimer::InterShot);
            host.transmit(codec::build_stop_packet());
            host.publish(RunEvent::Paused);
        }
    }

    /// End any run. Always halts the motors; safe in every state.
    pub fn stop_run(&mut self, reason: StopReason, host: &mut dyn RunnerHost) {
        host.cancel_all();
        host.transmit(codec::build_stop_packet());
        if let Some(session) = self.session.take() {
            tracing::info!(
                "runner: stopped after {} batches ({reason:?})",
                session.iterations
            );
            host.publish(RunEvent::Stopped { reason });
        }
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    pub fn on_timer(&mut self, timer: RunTimer, host: &mut dyn RunnerHost) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match (timer, session.stage) {
            (RunTimer::CountdownTick, Stage::Countdown(n)) => {
                let next = n.saturating_sub(1);
                if next >= 1 {
                    session.stage = Stage::Countdown(next);
                    host.publish(RunEvent::Countdown { remaining: next });
                    host.schedule(RunTimer::CountdownTick, COUNTDOWN_TICK);
                } else {
                    session.stage = Stage::Launching;
                    host.publish(RunEvent::Go);
                    host.schedule(RunTimer::StartDelay, GO_DELAY);
                }
            }
            (RunTimer::StartDelay, Stage::Launching) => self.begin_execution(host),
            (RunTimer::InterShot, Stage::Executing) => self.run_iteration(host),
            (RunTimer::DurationTick, Stage::Executing) => {
                let Target::Time { remaining } = &mut session.target else {
                    return;
                };
                if !session.paused {
                    *remaining = remaining.saturating_sub(1);
                    let secs = *remaining;
                    host.publish(RunEvent::TimeRemaining {
                        secs,
                        display: format_clock(secs),
                    });
                    if secs == 0 {
                        self.stop_run(StopReason::TimeUp, host);
                        return;
                    }
                }
                host.schedule(RunTimer::DurationTick, DURATION_TICK);
            }
            (timer, stage) => tracing::debug!("runner: ignoring {timer:?} in {stage:?}"),
        }
    }
}

/// One active variant of `step`, with scatter applied to its drop.
fn pick_shot(step: &DrillStep, rng: &mut dyn RngCore) -> Option<ShotParameters> {
    let variants: Vec<&ShotParameters> = step.active_variants().collect();
    let chosen = *variants.choose(&mut *rng)?;
    if step.scatter <= 0.0 {
        return Some(chosen.clone());
    }
    Some(chosen.with_drop(scatter_drop(chosen.drop, step.scatter, rng)))
}

/// Uniform pick from `[drop - scatter, drop + scatter]` on the 0.5 grid,
/// clamped to the drop range.
fn scatter_drop(drop: f64, scatter: f64, rng: &mut dyn RngCore) -> f64 {
    let lo = ((drop - scatter) / DROP_STEP).ceil() as i64;
    let hi = ((drop + scatter) / DROP_STEP).floor() as i64;
    if hi < lo {
        return drop.clamp(MIN_DROP, MAX_DROP);
    }
    let k = rng.gen_range(lo..=hi);
    (k as f64 * DROP_STEP).clamp(MIN_DROP, MAX_DROP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};

    use novadrill::codec::{FRAME_HEADER_LEN, SHOT_RECORD_LEN};
    use novadrill::{Drill, DrillLibrary};

    #[derive(Default)]
    struct RecordingHost {
        sent: Vec<Vec<u8>>,
        pending: HashSet<RunTimer>,
        scheduled: Vec<(RunTimer, Duration)>,
        events: Vec<RunEvent>,
        stats: Vec<StatsCommand>,
    }

    impl RunnerHost for RecordingHost {
        fn transmit(&mut self, packet: Vec<u8>) {
            self.sent.push(packet);
        }
        fn schedule(&mut self, timer: RunTimer, after: Duration) {
            self.pending.insert(timer);
            self.scheduled.push((timer, after));
        }
        fn cancel(&mut self, timer: RunTimer) {
            self.pending.remove(&timer);
        }
        fn cancel_all(&mut self) {
            self.pending.clear();
        }
        fn publish(&mut self, event: RunEvent) {
            self.events.push(event);
        }
        fn record(&mut self, cmd: StatsCommand) {
            self.stats.push(cmd);
        }
    }

    impl RecordingHost {
        fn stops(&self) -> usize {
            self.sent.iter().filter(|p| **p == codec::STOP).count()
        }

        fn batches(&self) -> Vec<&Vec<u8>> {
            self.sent
                .iter()
                .filter(|p| codec::fire_packet_len(p).is_some())
                .collect()
        }

        /// Fire a pending timer as the scheduler would.
        fn fire(&mut self, runner: &mut DrillRunner, timer: RunTimer) {
            assert!(self.pending.remove(&timer), "{timer:?} not pending");
            runner.on_timer(timer, self);
        }
    }

    fn shot(top: i32, drop: f64) -> ShotParameters {
        ShotParameters::new(top, 2000, 0, drop, 50, 1)
    }

    fn seeded() -> DrillRunner {
        DrillRunner::with_rng(Box::new(StdRng::seed_from_u64(7)))
    }

    fn library_with(key: &str, drill: Drill) -> DrillLibrary {
        let mut lib = DrillLibrary::default();
        lib.drills.insert(key.into(), drill);
        lib
    }

    fn three_step_library() -> DrillLibrary {
        library_with(
            "three",
            Drill::uniform(vec![
                DrillStep::single(shot(1000, 0.0)),
                DrillStep::single(shot(2000, 0.0)),
                DrillStep::single(shot(3000, 0.0)),
            ]),
        )
    }

    fn reps(n: u32) -> RunSettings {
        RunSettings {
            reps: n,
            ..RunSettings::default()
        }
    }

    fn start_and_launch(
        runner: &mut DrillRunner,
        host: &mut RecordingHost,
        lib: &DrillLibrary,
        settings: &RunSettings,
    ) {
        runner
            .start_drill_sequence("three", lib, Level::Beginner, settings.mode, settings, host)
            .unwrap();
        runner.skip_countdown(host);
    }

    /// Drop value of record `i`, mapped back from the device domain.
    fn drop_at(packet: &[u8], i: usize) -> f64 {
        let at = FRAME_HEADER_LEN + i * SHOT_RECORD_LEN + 12;
        let device = f32::from_le_bytes(packet[at..at + 4].try_into().unwrap()) as f64;
        (device + 22.0) / 44.0 * 20.0 - 10.0
    }

    fn top_at(packet: &[u8], i: usize) -> u32 {
        let at = FRAME_HEADER_LEN + i * SHOT_RECORD_LEN;
        u32::from_le_bytes(packet[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn drill_without_active_steps_is_rejected() {
        let mut step = DrillStep::single(shot(1000, 0.0));
        step.active = false;
        let lib = library_with("off", Drill::uniform(vec![step]));
        let mut runner = seeded();
        let mut host = RecordingHost::default();

        let result = runner.start_drill_sequence(
            "off",
            &lib,
            Level::Beginner,
            RunMode::Reps,
            &RunSettings::default(),
            &mut host,
        );
        assert_eq!(result, Err(RunError::NoActiveBalls));
        assert_eq!(runner.phase(), RunPhase::Idle);
        assert!(host.events.is_empty());
        assert!(host.scheduled.is_empty());
        assert!(host.sent.is_empty());
    }

    #[test]
    fn unknown_drill_is_rejected() {
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        let result = runner.start_drill_sequence(
            "nope",
            &DrillLibrary::builtin(),
            Level::Beginner,
            RunMode::Reps,
            &RunSettings::default(),
            &mut host,
        );
        assert_eq!(result, Err(RunError::UnknownDrill("nope".into())));
        assert!(!runner.is_active());
    }

    #[test]
    fn countdown_then_go_then_first_batch() {
        let lib = three_step_library();
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        runner
            .start_drill_sequence("three", &lib, Level::Beginner, RunMode::Reps, &reps(5), &mut host)
            .unwrap();
        assert_eq!(runner.phase(), RunPhase::Countdown);

        for _ in 0..4 {
            host.fire(&mut runner, RunTimer::CountdownTick);
        }
        assert_eq!(runner.phase(), RunPhase::Launching);
        assert_eq!(host.scheduled.last(), Some(&(RunTimer::StartDelay, GO_DELAY)));
        assert!(host.sent.is_empty());

        host.fire(&mut runner, RunTimer::StartDelay);
        assert_eq!(runner.phase(), RunPhase::Running);
        assert_eq!(
            host.events[..6],
            [
                RunEvent::LastPlayed {
                    drill: "three".into()
                },
                RunEvent::Countdown { remaining: 4 },
                RunEvent::Countdown { remaining: 3 },
                RunEvent::Countdown { remaining: 2 },
                RunEvent::Countdown { remaining: 1 },
                RunEvent::Go,
            ]
        );
        assert!(host.events.contains(&RunEvent::RepsRemaining { remaining: 5 }));
        assert_eq!(host.batches().len(), 1);
        assert_eq!(codec::fire_packet_len(host.batches()[0]), Some(3));
        assert_eq!(
            host.stats,
            vec![StatsCommand::AddDrill, StatsCommand::AddBalls { count: 3 }]
        );
    }

    #[test]
    fn rep_exhaustion_stops_exactly_once() {
        let lib = three_step_library();
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        start_and_launch(&mut runner, &mut host, &lib, &reps(5));

        for _ in 0..4 {
            runner.handle_done(&mut host);
            host.fire(&mut runner, RunTimer::InterShot);
        }
        assert_eq!(host.stops(), 0);
        runner.handle_done(&mut host);

        assert_eq!(runner.phase(), RunPhase::Idle);
        assert_eq!(host.batches().len(), 5);
        assert_eq!(host.stops(), 1);
        assert!(host.pending.is_empty());
        assert_eq!(
            host.events.last(),
            Some(&RunEvent::Stopped {
                reason: StopReason::Completed
            })
        );
        let drills = host.stats.iter().filter(|c| **c == StatsCommand::AddDrill).count();
        assert_eq!(drills, 1);

        // A late report after the run ended changes nothing.
        runner.handle_done(&mut host);
        assert_eq!(host.stops(), 1);
    }

    #[test]
    fn steps_keep_their_order_without_randomize() {
        let lib = three_step_library();
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        start_and_launch(&mut runner, &mut host, &lib, &reps(3));
        let batch = host.batches()[0].clone();
        assert_eq!(
            (top_at(&batch, 0), top_at(&batch, 1), top_at(&batch, 2)),
            (1000, 2000, 3000)
        );
    }

    #[test]
    fn randomize_reshuffles_each_iteration() {
        let mut lib = three_step_library();
        lib.drills.get_mut("three").unwrap().randomize = true;
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        start_and_launch(&mut runner, &mut host, &lib, &reps(200));
        for _ in 0..60 {
            runner.handle_done(&mut host);
            host.fire(&mut runner, RunTimer::InterShot);
        }
        let orders: HashSet<[u32; 3]> = host
            .batches()
            .iter()
            .map(|b| [top_at(b, 0), top_at(b, 1), top_at(b, 2)])
            .collect();
        assert!(orders.len() > 1);
        for order in &orders {
            let mut sorted = *order;
            sorted.sort();
            assert_eq!(sorted, [1000, 2000, 3000]);
        }
    }

    #[test]
    fn pause_and_resume_keep_the_remaining_count() {
        let lib = three_step_library();
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        start_and_launch(&mut runner, &mut host, &lib, &reps(5));
        let remaining = |host: &RecordingHost| {
            host.events
                .iter()
                .filter_map(|e| match e {
                    RunEvent::RepsRemaining { remaining } => Some(*remaining),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };

        runner.toggle_pause(&mut host);
        assert_eq!(runner.phase(), RunPhase::Paused);
        assert_eq!(host.stops(), 1);
        runner.toggle_pause(&mut host);
        assert_eq!(runner.phase(), RunPhase::Running);
        assert_eq!(remaining(&host), vec![5]);
        assert_eq!(host.batches().len(), 2);
        assert_eq!(host.batches()[0], host.batches()[1]);

        runner.handle_done(&mut host);
        host.fire(&mut runner, RunTimer::InterShot);
        assert_eq!(remaining(&host), vec![5, 4]);
    }

    #[test]
    fn pause_between_batches_cancels_the_delay() {
        let lib = three_step_library();
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        start_and_launch(&mut runner, &mut host, &lib, &reps(5));
        runner.handle_done(&mut host);
        assert!(host.pending.contains(&RunTimer::InterShot));

        runner.toggle_pause(&mut host);
        assert!(!host.pending.contains(&RunTimer::InterShot));

        // Resume fires the next rep immediately.
        runner.toggle_pause(&mut host);
        assert_eq!(host.batches().len(), 2);
        assert!(host.events.contains(&RunEvent::RepsRemaining { remaining: 4 }));
    }

    #[test]
    fn done_while_paused_does_not_schedule() {
        let lib = three_step_library();
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        start_and_launch(&mut runner, &mut host, &lib, &reps(5));
        runner.toggle_pause(&mut host);
        runner.handle_done(&mut host);
        assert!(!host.pending.contains(&RunTimer::InterShot));
    }

    #[test]
    fn time_mode_counts_down_and_holds_while_paused() {
        let lib = three_step_library();
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        let settings = RunSettings {
            mode: RunMode::Time,
            duration_secs: 3,
            ..RunSettings::default()
        };
        start_and_launch(&mut runner, &mut host, &lib, &settings);
        assert!(host.events.contains(&RunEvent::TimeRemaining {
            secs: 3,
            display: "0:03".into()
        }));

        host.fire(&mut runner, RunTimer::DurationTick);
        runner.toggle_pause(&mut host);
        host.fire(&mut runner, RunTimer::DurationTick);
        host.fire(&mut runner, RunTimer::DurationTick);
        assert!(runner.is_active());
        runner.toggle_pause(&mut host);

        host.fire(&mut runner, RunTimer::DurationTick);
        host.fire(&mut runner, RunTimer::DurationTick);
        assert!(!runner.is_active());
        assert_eq!(
            host.events.last(),
            Some(&RunEvent::Stopped {
                reason: StopReason::TimeUp
            })
        );
    }

    #[test]
    fn test_run_loops_without_stats_until_stopped() {
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        runner
            .start_test_run(
                vec![DrillStep::single(shot(1500, 1.0))],
                false,
                &RunSettings::default(),
                &mut host,
            )
            .unwrap();
        assert_eq!(runner.phase(), RunPhase::Running);
        for _ in 0..50 {
            runner.handle_done(&mut host);
            host.fire(&mut runner, RunTimer::InterShot);
        }
        assert!(runner.is_active());
        assert_eq!(host.batches().len(), 51);
        assert!(host.stats.is_empty());
        assert!(!host.events.iter().any(|e| matches!(e, RunEvent::Countdown { .. })));

        runner.stop_run(StopReason::User, &mut host);
        assert!(!runner.is_active());
    }

    #[test]
    fn stop_during_countdown_cancels_everything() {
        let lib = three_step_library();
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        runner
            .start_drill_sequence("three", &lib, Level::Beginner, RunMode::Reps, &reps(5), &mut host)
            .unwrap();
        host.fire(&mut runner, RunTimer::CountdownTick);
        runner.stop_run(StopReason::User, &mut host);

        assert!(host.pending.is_empty());
        assert!(host.batches().is_empty());
        assert!(!host.events.iter().any(|e| matches!(e, RunEvent::Started { .. })));

        // Orphaned timer deliveries after the stop are ignored.
        runner.on_timer(RunTimer::CountdownTick, &mut host);
        runner.on_timer(RunTimer::StartDelay, &mut host);
        assert!(!runner.is_active());

        runner.stop_run(StopReason::User, &mut host);
        let stopped = host
            .events
            .iter()
            .filter(|e| matches!(e, RunEvent::Stopped { .. }))
            .count();
        assert_eq!(stopped, 1);
    }

    #[test]
    fn test_run_larger_than_one_frame_is_rejected() {
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        let steps = vec![DrillStep::single(shot(1000, 0.0)); codec::MAX_RECORDS + 1];
        let result = runner.start_test_run(steps, false, &reps(1), &mut host);
        assert_eq!(
            result,
            Err(RunError::TooManyBalls(codec::BatchTooLarge(codec::MAX_RECORDS + 1)))
        );
        assert!(!runner.is_active());
        assert!(host.sent.is_empty());

        let steps = vec![DrillStep::single(shot(1000, 0.0)); codec::MAX_RECORDS];
        runner.start_test_run(steps, false, &reps(1), &mut host).unwrap();
        assert_eq!(host.batches().len(), 1);
        assert_eq!(codec::fire_packet_len(host.batches()[0]), Some(codec::MAX_RECORDS));
    }

    #[test]
    fn second_start_is_rejected() {
        let lib = three_step_library();
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        start_and_launch(&mut runner, &mut host, &lib, &reps(5));
        let again =
            runner.start_drill_sequence("three", &lib, Level::Beginner, RunMode::Reps, &reps(5), &mut host);
        assert_eq!(again, Err(RunError::AlreadyActive));
        assert_eq!(host.batches().len(), 1);
    }

    #[test]
    fn scatter_stays_on_the_half_grid() {
        let mut runner = seeded();
        let mut host = RecordingHost::default();
        let step = DrillStep::single(shot(2000, 2.0)).scatter(3.0);
        runner
            .start_test_run(vec![step], false, &RunSettings::default(), &mut host)
            .unwrap();
        for _ in 0..999 {
            runner.handle_done(&mut host);
            host.fire(&mut runner, RunTimer::InterShot);
        }

        let allowed: Vec<f64> = (-2..=10).map(|k| k as f64 * 0.5).collect();
        let mut seen = BTreeSet::new();
        for batch in host.batches() {
            let drop = drop_at(batch, 0);
            let nearest = allowed
                .iter()
                .copied()
                .min_by(|a, b| (a - drop).abs().total_cmp(&(b - drop).abs()))
                .unwrap();
            assert!((nearest - drop).abs() < 1e-3, "drop {drop} off grid");
            seen.insert((nearest * 2.0) as i64);
        }
        assert_eq!(host.batches().len(), 1000);
        assert!(seen.len() > 8);
    }

    #[test]
    fn scatter_clamps_to_drop_range() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let d = scatter_drop(9.5, 2.0, &mut rng);
            assert!((7.5..=10.0).contains(&d));
        }
    }

    #[test]
    fn only_active_variants_are_chosen() {
        let mut off = shot(7000, 0.0);
        off.active = false;
        let step = DrillStep::with_variants(vec![shot(1000, 0.0), off, shot(3000, 0.0)]);
        let mut rng = StdRng::seed_from_u64(3);
        let tops: HashSet<i32> = (0..200)
            .filter_map(|_| pick_shot(&step, &mut rng))
            .map(|s| s.top)
            .collect();
        assert_eq!(tops, HashSet::from([1000, 3000]));
    }
}
