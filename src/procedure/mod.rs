//! The beam shower procedure.
//!
//! [`BeamShowerProcedure`] is a small sequential state machine:
//! save the microscope state, apply the shower conditions, count down, and
//! restore. It owns an injected [`MicroscopeControl`] and an [`OperatorGate`],
//! and reports progress through [`EventSender`].
//!
//! # Guarantees
//!
//! - No mutating call is issued before the saved state exists.
//! - Once any mutation has succeeded, every exit path restores the saved state
//!   exactly once: normal expiry, `stop`, errors, and dropping the procedure.
//! - Operations take `&mut self`, so microscope calls are never concurrent.
//!   Other tasks request a stop through a [`StopHandle`].

mod countdown;
mod guard;
mod snapshot;
mod state;
mod steps;

pub use countdown::{Countdown, RemainingTime};
pub use guard::{AppliedMutations, ShowerGuard};
pub use snapshot::{ApertureSnapshot, SavedMicroscopeState};
pub use state::RunState;

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::backup::BackupRecord;
use crate::config::{DefocusMethod, ProcedureConfig, SpecimenBlanking};
use crate::error::{ShowerError, ShowerResult};
use crate::events::{EventSender, ShowerEvent};
use crate::microscope::{CondenserLens, ImagingMode, MicroscopeControl, ScreenPosition};
use crate::operator::{Acknowledgement, OperatorGate};
use steps::Hardware;

/// Cooperative cancellation flag shared with UI drivers.
///
/// Each run gets its own flag: a handle kept from a finished run cannot stop
/// the next one.
#[derive(Clone, Debug)]
pub struct StopHandle {
    flag: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Asks the procedure to stop at its next tick or preparation step.
    pub fn request_stop(&self) {
        self.flag.send_replace(true);
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so this only returns on a request.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self { flag: Arc::new(tx) }
    }
}

/// Returned by a successful `start`.
#[derive(Clone, Debug)]
pub struct RunHandle {
    /// When the shower conditions were in place and the countdown began
    pub started_at: DateTime<Utc>,
    /// Configured shower duration
    pub duration: Duration,
    /// Stop flag of this run
    pub stop: StopHandle,
}

impl RunHandle {
    /// Shorthand for `self.stop.request_stop()`.
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }
}

struct ActiveRun {
    config: ProcedureConfig,
    guard: Option<ShowerGuard>,
    countdown: Countdown,
}

/// Save/apply/wait/restore state machine for one microscope.
pub struct BeamShowerProcedure {
    scope: Arc<dyn MicroscopeControl>,
    gate: Arc<dyn OperatorGate>,
    events: EventSender,
    stop: StopHandle,
    state: RunState,
    run: Option<ActiveRun>,
    last_saved: Option<SavedMicroscopeState>,
    backup_path: Option<PathBuf>,
}

impl BeamShowerProcedure {
    /// Creates an idle procedure.
    pub fn new(scope: Arc<dyn MicroscopeControl>, gate: Arc<dyn OperatorGate>) -> Self {
        Self {
            scope,
            gate,
            events: EventSender::new(),
            stop: StopHandle::default(),
            state: RunState::Idle,
            run: None,
            last_saved: None,
            backup_path: None,
        }
    }

    /// Writes a backup record of the saved state to `path` at every start.
    pub fn with_backup(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(path.into());
        self
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Receiver for status, progress and error events.
    pub fn subscribe(&self) -> broadcast::Receiver<ShowerEvent> {
        self.events.subscribe()
    }

    /// Handle for requesting a stop from another task.
    ///
    /// Taken while `Idle`, it belongs to the next run: a stop requested before
    /// `start` cancels that run before any hardware is touched.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// State saved by the most recent start.
    pub fn saved_state(&self) -> Option<&SavedMicroscopeState> {
        self.last_saved.as_ref()
    }

    /// Saves the current state and applies the shower conditions.
    ///
    /// Valid only from `Idle`. A wrong imaging mode or invalid config fails
    /// before any hardware is touched. A failure after the first mutation rolls
    /// back before returning, leaving the procedure in `Failed` (or `Finished`
    /// when the failure was a requested stop).
    pub async fn start(&mut self, config: ProcedureConfig) -> ShowerResult<RunHandle> {
        let result = self.try_start(config).await;
        if let Err(err) = &result {
            self.report(err);
        }
        result
    }

    async fn try_start(&mut self, config: ProcedureConfig) -> ShowerResult<RunHandle> {
        if self.state != RunState::Idle {
            return Err(ShowerError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        config.validate()?;

        let mode = self.scope.imaging_mode().await?;
        if mode != ImagingMode::Stem {
            return Err(ShowerError::Mode {
                actual: mode.to_string(),
            });
        }

        if self.stop.is_stop_requested() {
            info!("Stop requested before start; nothing to undo");
            self.rearm_stop();
            return Err(ShowerError::Cancelled);
        }

        let saved = SavedMicroscopeState::capture(self.scope.as_ref(), &config).await?;
        self.last_saved = Some(saved.clone());
        self.write_backup(&config, &saved).await;

        self.transition(RunState::Preparing);
        let mut guard = ShowerGuard::new(
            Arc::clone(&self.scope),
            saved.clone(),
            config.clone(),
            self.events.clone(),
        );

        let prepared = Preparation {
            hw: Hardware::new(self.scope.as_ref(), &config.settle),
            gate: self.gate.as_ref(),
            events: &self.events,
            stop: &self.stop,
            config: &config,
            saved: &saved,
        }
        .run(guard.applied_mut())
        .await;

        match prepared {
            Ok(()) => {
                self.transition(RunState::Running);
                let handle = RunHandle {
                    started_at: Utc::now(),
                    duration: config.duration,
                    stop: self.stop.clone(),
                };
                info!("Starting beam shower for {:?}", config.duration);
                self.events.status("Beam Shower Running");
                self.run = Some(ActiveRun {
                    countdown: Countdown::new(config.duration),
                    config,
                    guard: Some(guard),
                });
                Ok(handle)
            }
            Err(err) if !guard.applied().any() => {
                self.transition(RunState::Idle);
                self.rearm_stop();
                Err(err)
            }
            Err(ShowerError::Cancelled) => {
                self.transition(RunState::Stopping);
                self.events.status("Stopping Beam Shower");
                self.release(guard, RunState::Finished).await?;
                Err(ShowerError::Cancelled)
            }
            Err(err) => {
                error!("Preparation failed, rolling back: {}", err);
                self.transition(RunState::Resetting);
                if let Err(restore_err) = self.release(guard, RunState::Failed).await {
                    self.report(&restore_err);
                }
                Err(err)
            }
        }
    }

    /// Advances the countdown by `elapsed`.
    ///
    /// Resets when the countdown reaches zero and performs a pending stop
    /// request. Outside `Running` this is a no-op returning
    /// [`RemainingTime::ZERO`].
    pub async fn tick(&mut self, elapsed: Duration) -> ShowerResult<RemainingTime> {
        let result = self.try_tick(elapsed).await;
        if let Err(err) = &result {
            self.report(err);
        }
        result
    }

    async fn try_tick(&mut self, elapsed: Duration) -> ShowerResult<RemainingTime> {
        if self.state != RunState::Running {
            return Ok(RemainingTime::ZERO);
        }
        if self.stop.is_stop_requested() {
            self.try_stop().await?;
            return Ok(RemainingTime::ZERO);
        }

        let monitor = self
            .run
            .as_ref()
            .map(|run| run.config.monitor_mode)
            .unwrap_or(false);
        if monitor {
            match self.scope.imaging_mode().await {
                Ok(ImagingMode::Stem) => {}
                Ok(other) => {
                    return self
                        .abort(ShowerError::Mode {
                            actual: other.to_string(),
                        })
                        .await
                }
                Err(err) => return self.abort(err.into()).await,
            }
        }

        let remaining = match self.run.as_mut() {
            Some(run) => run.countdown.advance(elapsed),
            None => RemainingTime::ZERO,
        };
        self.events.send(ShowerEvent::Progress(remaining));

        if remaining.is_zero() {
            info!("Beam shower time elapsed");
            self.transition(RunState::Resetting);
            self.try_reset().await?;
        }
        Ok(remaining)
    }

    /// Cancels an active run and restores immediately.
    ///
    /// Outside `Running`/`Preparing` there is nothing to stop and this is a no-op.
    pub async fn stop(&mut self) -> ShowerResult<()> {
        let result = self.try_stop().await;
        if let Err(err) = &result {
            self.report(err);
        }
        result
    }

    async fn try_stop(&mut self) -> ShowerResult<()> {
        if !self.state.is_active() {
            info!("Stop requested while {}; nothing to stop", self.state);
            return Ok(());
        }
        self.stop.request_stop();
        self.transition(RunState::Stopping);
        self.events.status("Stopping Beam Shower");
        self.try_reset().await?;
        self.events.status("Beam Shower Stopped");
        Ok(())
    }

    /// Restores the saved state. Safe to call repeatedly: only the first call
    /// after a run issues hardware calls.
    pub async fn reset(&mut self) -> ShowerResult<()> {
        let result = self.try_reset().await;
        if let Err(err) = &result {
            self.report(err);
        }
        result
    }

    async fn try_reset(&mut self) -> ShowerResult<()> {
        let guard = self.run.as_mut().and_then(|run| run.guard.take());
        match guard {
            Some(guard) => self.release(guard, RunState::Finished).await,
            None => Ok(()),
        }
    }

    /// Returns a finished or failed procedure to `Idle`.
    pub fn clear(&mut self) -> ShowerResult<()> {
        match self.state {
            RunState::Idle => Ok(()),
            state if state.is_terminal() => {
                self.rearm_stop();
                self.transition(RunState::Idle);
                Ok(())
            }
            state => Err(ShowerError::InvalidState {
                operation: "clear",
                state,
            }),
        }
    }

    /// Replays a backup record, e.g. after a crash left the microscope in
    /// shower state. Valid only from `Idle`.
    pub async fn recover(&mut self, record: BackupRecord) -> ShowerResult<()> {
        if self.state != RunState::Idle {
            let err = ShowerError::InvalidState {
                operation: "recover",
                state: self.state,
            };
            self.report(&err);
            return Err(err);
        }
        info!(
            "Recovering state saved at {} on {}",
            record.created_at, record.host
        );
        let applied = AppliedMutations::full_run(&record.saved, &record.procedure);
        self.last_saved = Some(record.saved.clone());
        let guard = ShowerGuard::with_applied(
            Arc::clone(&self.scope),
            record.saved,
            record.procedure,
            applied,
            self.events.clone(),
        );
        self.transition(RunState::Resetting);
        let result = self.release(guard, RunState::Finished).await;
        if let Err(err) = &result {
            self.report(err);
        }
        result
    }

    /// Error during `Running`: restore, then end in `Failed`.
    async fn abort(&mut self, err: ShowerError) -> ShowerResult<RemainingTime> {
        error!("Beam shower aborted: {}", err);
        if let Some(guard) = self.run.as_mut().and_then(|run| run.guard.take()) {
            self.transition(RunState::Resetting);
            if let Err(restore_err) = self.release(guard, RunState::Failed).await {
                self.report(&restore_err);
            }
        }
        Err(err)
    }

    async fn release(&mut self, guard: ShowerGuard, done: RunState) -> ShowerResult<()> {
        if self.state != RunState::Resetting {
            self.transition(RunState::Resetting);
        }
        let outcome = guard.release().await;
        self.run = None;
        match outcome {
            Ok(()) => {
                self.transition(done);
                self.events.status(match done {
                    RunState::Failed => "Beam Shower Reset After Error",
                    _ => "Beam Shower Finished",
                });
                Ok(())
            }
            Err(failures) => {
                self.transition(RunState::Failed);
                Err(ShowerError::RestoreIncomplete(failures))
            }
        }
    }

    async fn write_backup(&self, config: &ProcedureConfig, saved: &SavedMicroscopeState) {
        let Some(path) = &self.backup_path else {
            return;
        };
        let record = BackupRecord::new(config.clone(), saved.clone());
        match record.write(path).await {
            Ok(()) => info!("Saved microscope state to {}", path.display()),
            Err(err) => warn!("Could not write backup record: {}", err),
        }
    }

    /// Fresh flag for the next run.
    fn rearm_stop(&mut self) {
        self.stop = StopHandle::default();
    }

    fn transition(&mut self, next: RunState) {
        if !self.state.can_transition_to(next) {
            error!("Unexpected transition {} -> {}", self.state, next);
        }
        info!("{} -> {}", self.state, next);
        let from = std::mem::replace(&mut self.state, next);
        self.events.send(ShowerEvent::StateChanged { from, to: next });
    }

    fn report(&self, err: &ShowerError) {
        error!("{}", err);
        self.events.error(format!("Error: {err}"));
    }
}

/// Borrowed context for the mutation sequence.
struct Preparation<'a> {
    hw: Hardware<'a>,
    gate: &'a dyn OperatorGate,
    events: &'a EventSender,
    stop: &'a StopHandle,
    config: &'a ProcedureConfig,
    saved: &'a SavedMicroscopeState,
}

impl Preparation<'_> {
    async fn run(&self, applied: &mut AppliedMutations) -> ShowerResult<()> {
        info!("Setting up conditions");
        let scope = self.hw.scope();

        self.hw.blank_beam(true).await?;
        applied.beam_blanked = true;

        self.hw.move_screen(ScreenPosition::Lowered).await?;
        applied.screen_lowered = true;

        self.events.status(self.config.safety_prompt.clone());
        let answer = tokio::select! {
            answer = self.gate.acknowledge(&self.config.safety_prompt) => answer,
            () = self.stop.stopped() => {
                info!("Stop requested at the safety prompt");
                return Err(ShowerError::Cancelled);
            }
        };
        if answer == Acknowledgement::Declined {
            return Err(ShowerError::NotAcknowledged(
                self.config.safety_prompt.clone(),
            ));
        }
        self.check_stop()?;

        self.events.status("Removing Detectors");
        for id in &self.saved.inserted_detectors {
            self.hw.move_detector(*id, false).await?;
            applied.detectors_retracted.push(*id);
        }
        self.check_stop()?;

        match &self.config.blanking {
            SpecimenBlanking::IlDeflector { deflector, value } => {
                scope.set_deflector(*deflector, *value).await?;
                applied.il_blanked = true;
                info!("IL blanked with {}", deflector);
            }
            SpecimenBlanking::Apertures { kinds, size } => {
                self.events.status("Inserting SA and OL Apertures");
                for kind in kinds {
                    self.hw.move_aperture(*kind, *size).await?;
                    applied.apertures_moved.push(*kind);
                }
            }
        }

        self.hw.move_aperture(self.config.cl_aperture, 0).await?;
        applied.apertures_moved.push(self.config.cl_aperture);

        scope.set_probe_size(self.config.probe_size).await?;
        applied.probe_size_changed = true;
        self.check_stop()?;

        match &self.config.defocus {
            DefocusMethod::FreeLensControl { cl1, cl2, cl3 } => {
                self.events.status("Set CL Lenses");
                for (lens, value) in CondenserLens::ALL.into_iter().zip([*cl1, *cl2, *cl3]) {
                    scope.set_condenser_lens(lens, value).await?;
                    applied.lenses_changed = true;
                }
            }
            DefocusMethod::EnergyShift { ev } => {
                self.events.status("Set Energy Shift");
                scope.set_energy_shift(*ev).await?;
                applied.energy_shifted = true;
            }
        }
        self.check_stop()?;

        self.hw.blank_beam(false).await?;
        Ok(())
    }

    fn check_stop(&self) -> ShowerResult<()> {
        if self.stop.is_stop_requested() {
            Err(ShowerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettleDelays;
    use crate::microscope::simulated::{ControlCall, SimulatedMicroscope};
    use crate::operator::AutoAcknowledge;

    fn quick_config() -> ProcedureConfig {
        ProcedureConfig {
            settle: SettleDelays::none(),
            ..ProcedureConfig::default()
        }
    }

    fn procedure(scope: &Arc<SimulatedMicroscope>) -> BeamShowerProcedure {
        BeamShowerProcedure::new(scope.clone(), Arc::new(AutoAcknowledge))
    }

    #[tokio::test]
    async fn start_is_rejected_while_running() {
        let scope = Arc::new(SimulatedMicroscope::new());
        let mut procedure = procedure(&scope);
        procedure.start(quick_config()).await.unwrap();

        let err = procedure.start(quick_config()).await.unwrap_err();
        assert!(matches!(
            err,
            ShowerError::InvalidState {
                state: RunState::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn invalid_config_blocks_start_without_calls() {
        let scope = Arc::new(SimulatedMicroscope::new());
        let mut procedure = procedure(&scope);
        let config = quick_config().with_duration(Duration::ZERO);

        let err = procedure.start(config).await.unwrap_err();
        assert!(matches!(err, ShowerError::Config(_)));
        assert_eq!(procedure.state(), RunState::Idle);
        assert!(scope.calls().await.is_empty());
    }

    #[tokio::test]
    async fn failure_on_first_mutation_returns_to_idle() {
        let scope = Arc::new(SimulatedMicroscope::new());
        scope.fail_call("set_beam_blank").await;
        let mut procedure = procedure(&scope);

        let err = procedure.start(quick_config()).await.unwrap_err();
        assert!(matches!(err, ShowerError::ControlCall(_)));
        assert_eq!(procedure.state(), RunState::Idle);
        assert!(scope.calls().await.is_empty());
    }

    #[tokio::test]
    async fn stop_requested_during_preparation_rolls_back() {
        struct StopAtGate(StopHandle);

        #[async_trait::async_trait]
        impl OperatorGate for StopAtGate {
            async fn acknowledge(&self, _prompt: &str) -> Acknowledgement {
                self.0.request_stop();
                Acknowledgement::Confirmed
            }
        }

        let scope = Arc::new(SimulatedMicroscope::new());
        let before = scope.state().await;
        let stop = StopHandle::default();
        let mut procedure =
            BeamShowerProcedure::new(scope.clone(), Arc::new(StopAtGate(stop.clone())));
        procedure.stop = stop;

        let err = procedure.start(quick_config()).await.unwrap_err();
        assert!(matches!(err, ShowerError::Cancelled));
        assert_eq!(procedure.state(), RunState::Finished);

        let after = scope.state().await;
        assert_eq!(after.screen, before.screen);
        assert!(!after.beam_blanked);
        assert!(!scope
            .calls()
            .await
            .iter()
            .any(|call| matches!(call, ControlCall::SetDetectorInserted(..))));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_a_pending_safety_prompt() {
        struct NeverAnswers;

        #[async_trait::async_trait]
        impl OperatorGate for NeverAnswers {
            async fn acknowledge(&self, _prompt: &str) -> Acknowledgement {
                std::future::pending().await
            }
        }

        let scope = Arc::new(SimulatedMicroscope::new());
        let before = scope.state().await;
        let mut procedure = BeamShowerProcedure::new(scope.clone(), Arc::new(NeverAnswers));
        let stop = procedure.stop_handle();

        let (result, ()) = tokio::join!(procedure.start(quick_config()), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stop.request_stop();
        });

        assert!(matches!(result, Err(ShowerError::Cancelled)));
        assert_eq!(procedure.state(), RunState::Finished);
        assert_eq!(scope.state().await, before);
    }

    #[tokio::test]
    async fn stop_before_start_touches_nothing() {
        let scope = Arc::new(SimulatedMicroscope::new());
        let mut procedure = procedure(&scope);
        procedure.stop_handle().request_stop();

        let err = procedure.start(quick_config()).await.unwrap_err();
        assert!(matches!(err, ShowerError::Cancelled));
        assert_eq!(procedure.state(), RunState::Idle);
        assert!(scope.calls().await.is_empty());

        procedure.start(quick_config()).await.unwrap();
        assert_eq!(procedure.state(), RunState::Running);
    }

    #[tokio::test]
    async fn handle_from_previous_run_cannot_stop_the_next() {
        let scope = Arc::new(SimulatedMicroscope::new());
        let mut procedure = procedure(&scope);
        let first = procedure.start(quick_config()).await.unwrap();
        procedure.stop().await.unwrap();
        procedure.clear().unwrap();

        let second = procedure.start(quick_config()).await.unwrap();
        first.request_stop();
        procedure.tick(Duration::from_secs(1)).await.unwrap();
        assert_eq!(procedure.state(), RunState::Running);

        second.request_stop();
        procedure.tick(Duration::from_secs(1)).await.unwrap();
        assert_eq!(procedure.state(), RunState::Finished);
    }

    #[tokio::test]
    async fn clear_returns_to_idle_after_finish() {
        let scope = Arc::new(SimulatedMicroscope::new());
        let mut procedure = procedure(&scope);
        procedure.start(quick_config()).await.unwrap();
        procedure.stop().await.unwrap();

        assert_eq!(procedure.state(), RunState::Finished);
        procedure.clear().unwrap();
        assert_eq!(procedure.state(), RunState::Idle);
        procedure.start(quick_config()).await.unwrap();
        assert_eq!(procedure.state(), RunState::Running);
    }

    #[tokio::test]
    async fn stop_outside_run_is_a_noop() {
        let scope = Arc::new(SimulatedMicroscope::new());
        let mut procedure = procedure(&scope);
        procedure.stop().await.unwrap();
        procedure.reset().await.unwrap();
        assert_eq!(procedure.state(), RunState::Idle);
        assert!(scope.calls().await.is_empty());
    }

    #[tokio::test]
    async fn stop_handle_is_honoured_on_next_tick() {
        let scope = Arc::new(SimulatedMicroscope::new());
        let mut procedure = procedure(&scope);
        let handle = procedure.start(quick_config()).await.unwrap();

        handle.request_stop();
        let remaining = procedure.tick(Duration::from_secs(1)).await.unwrap();
        assert_eq!(remaining, RemainingTime::ZERO);
        assert_eq!(procedure.state(), RunState::Finished);
    }

    #[tokio::test]
    async fn mode_change_while_running_resets_and_fails() {
        let scope = Arc::new(SimulatedMicroscope::new());
        let mut procedure = procedure(&scope);
        let config = ProcedureConfig {
            monitor_mode: true,
            ..quick_config()
        };
        procedure.start(config).await.unwrap();

        scope.set_mode(ImagingMode::Tem).await;
        let err = procedure.tick(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ShowerError::Mode { .. }));
        assert_eq!(procedure.state(), RunState::Failed);
        assert!(!scope.state().await.beam_blanked);
        assert_eq!(
            scope.state().await.inserted_detectors(),
            procedure.saved_state().unwrap().inserted_detectors
        );
    }
}
