//! Countdown driver.
//!
//! [`ShowerSession`] starts a run and feeds the procedure real elapsed time on
//! a fixed interval until the run ends, a stop is requested, or the shutdown
//! future resolves. UI front ends that tick the procedure themselves do not
//! need it.

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::ProcedureConfig;
use crate::error::{ShowerError, ShowerResult};
use crate::procedure::{BeamShowerProcedure, RunState};

/// How a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The countdown reached zero and the microscope was restored.
    Completed,
    /// The run was stopped early and the microscope was restored.
    Stopped,
}

/// Drives one [`BeamShowerProcedure`] in real time.
pub struct ShowerSession {
    procedure: BeamShowerProcedure,
    tick_interval: Duration,
}

impl ShowerSession {
    /// Wraps an idle procedure; `tick_interval` is the countdown resolution.
    pub fn new(procedure: BeamShowerProcedure, tick_interval: Duration) -> Self {
        Self {
            procedure,
            tick_interval,
        }
    }

    /// The driven procedure, e.g. for its state or a stop handle.
    pub fn procedure(&self) -> &BeamShowerProcedure {
        &self.procedure
    }

    /// Starts a run and ticks it until it ends.
    ///
    /// `shutdown` is watched from the first preparation step on. When it
    /// resolves the run is stopped and restored before returning, including
    /// while the procedure is still preparing or waiting at the safety prompt.
    pub async fn run<F>(&mut self, config: ProcedureConfig, shutdown: F) -> ShowerResult<RunOutcome>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let stop = self.procedure.stop_handle();
        let mut shutdown_seen = false;

        let started = {
            let start = self.procedure.start(config);
            tokio::pin!(start);
            tokio::select! {
                result = &mut start => result,
                () = &mut shutdown => {
                    info!("Shutdown requested during preparation; cancelling");
                    shutdown_seen = true;
                    stop.request_stop();
                    start.await
                }
            }
        };
        let handle = match started {
            Ok(handle) => handle,
            Err(ShowerError::Cancelled) => return Ok(RunOutcome::Stopped),
            Err(err) => return Err(err),
        };
        if shutdown_seen {
            self.procedure.stop().await?;
            return Ok(RunOutcome::Stopped);
        }

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested; stopping beam shower");
                    self.procedure.stop().await?;
                    return Ok(RunOutcome::Stopped);
                }
                _ = interval.tick() => {
                    let now = Instant::now();
                    let remaining = self.procedure.tick(now - last_tick).await?;
                    last_tick = now;
                    debug!("Remaining time: {}", remaining);

                    if self.procedure.state() != RunState::Running {
                        return Ok(if handle.stop.is_stop_requested() {
                            RunOutcome::Stopped
                        } else {
                            RunOutcome::Completed
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettleDelays;
    use crate::microscope::simulated::{ControlCall, SimulatedMicroscope};
    use crate::operator::{Acknowledgement, AutoAcknowledge, OperatorGate};
    use std::sync::Arc;

    fn session(scope: &Arc<SimulatedMicroscope>) -> ShowerSession {
        let procedure = BeamShowerProcedure::new(scope.clone(), Arc::new(AutoAcknowledge));
        ShowerSession::new(procedure, Duration::from_secs(1))
    }

    fn config(duration: Duration) -> ProcedureConfig {
        ProcedureConfig {
            settle: SettleDelays::none(),
            ..ProcedureConfig::default()
        }
        .with_duration(duration)
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_countdown_expires() {
        let scope = Arc::new(SimulatedMicroscope::new());
        let mut session = session(&scope);
        let started = Instant::now();

        let outcome = session
            .run(config(Duration::from_secs(3)), std::future::pending())
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(session.procedure().state(), RunState::Finished);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(!scope.state().await.beam_blanked);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_and_restores() {
        let scope = Arc::new(SimulatedMicroscope::new());
        let before = scope.state().await;
        let mut session = session(&scope);

        let outcome = session
            .run(
                config(Duration::from_secs(600)),
                tokio::time::sleep(Duration::from_millis(2500)),
            )
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(session.procedure().state(), RunState::Finished);
        let after = scope.state().await;
        assert_eq!(after.lenses(), before.lenses());
        assert_eq!(after.screen, before.screen);
        assert_eq!(after.inserted_detectors(), before.inserted_detectors());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_safety_prompt_rolls_back() {
        struct SlowOperator;

        #[async_trait::async_trait]
        impl OperatorGate for SlowOperator {
            async fn acknowledge(&self, _prompt: &str) -> Acknowledgement {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Acknowledgement::Confirmed
            }
        }

        let scope = Arc::new(SimulatedMicroscope::new());
        let before = scope.state().await;
        let procedure = BeamShowerProcedure::new(scope.clone(), Arc::new(SlowOperator));
        let mut session = ShowerSession::new(procedure, Duration::from_secs(1));
        let started = Instant::now();

        let outcome = session
            .run(
                config(Duration::from_secs(600)),
                tokio::time::sleep(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Stopped);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(session.procedure().state(), RunState::Finished);
        assert_eq!(scope.state().await, before);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_settle_delay_rolls_back() {
        let scope = Arc::new(SimulatedMicroscope::new());
        let before = scope.state().await;
        let mut session = session(&scope);
        let config = ProcedureConfig::default().with_duration(Duration::from_secs(600));

        let outcome = session
            .run(config, tokio::time::sleep(Duration::from_millis(500)))
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(session.procedure().state(), RunState::Finished);
        assert_eq!(scope.state().await, before);
        assert!(!scope
            .calls()
            .await
            .iter()
            .any(|call| matches!(call, ControlCall::SetProbeSize(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_handle_ends_run_on_next_tick() {
        let scope = Arc::new(SimulatedMicroscope::new());
        let mut session = session(&scope);
        let stop = session.procedure().stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            stop.request_stop();
        });

        let outcome = session
            .run(config(Duration::from_secs(600)), std::future::pending())
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(session.procedure().state(), RunState::Finished);
    }
}
