//! Scoped ownership of the "hardware is in shower state" condition.
//!
//! A [`ShowerGuard`] is created together with the saved state and records every
//! mutation as it succeeds. Releasing the guard replays the saved state for
//! exactly those mutations. Release consumes the guard, so a run is restored at
//! most once. A guard dropped without release restores in the background.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::snapshot::SavedMicroscopeState;
use super::steps::Hardware;
use crate::config::{DefocusMethod, ProcedureConfig, SpecimenBlanking};
use crate::error::ControlError;
use crate::events::EventSender;
use crate::microscope::{ApertureKind, CondenserLens, DetectorId, MicroscopeControl};

/// Mutations that have succeeded during preparation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedMutations {
    /// The beam was blanked.
    pub beam_blanked: bool,
    /// The screen was lowered.
    pub screen_lowered: bool,
    /// Detectors retracted so far, in order.
    pub detectors_retracted: Vec<DetectorId>,
    /// An IL deflector was driven to its blanking value.
    pub il_blanked: bool,
    /// Apertures whose size was changed.
    pub apertures_moved: Vec<ApertureKind>,
    /// The probe size was changed.
    pub probe_size_changed: bool,
    /// At least one condenser lens was put under free lens control.
    pub lenses_changed: bool,
    /// The energy filter was shifted.
    pub energy_shifted: bool,
}

impl AppliedMutations {
    /// True once any mutating call has succeeded.
    pub fn any(&self) -> bool {
        self.beam_blanked
            || self.screen_lowered
            || !self.detectors_retracted.is_empty()
            || self.il_blanked
            || !self.apertures_moved.is_empty()
            || self.probe_size_changed
            || self.lenses_changed
            || self.energy_shifted
    }

    /// Every mutation a full run with `config` would apply. Used for recovery
    /// when the applied set is unknown.
    pub fn full_run(saved: &SavedMicroscopeState, config: &ProcedureConfig) -> Self {
        Self {
            beam_blanked: true,
            screen_lowered: true,
            detectors_retracted: saved.inserted_detectors.clone(),
            il_blanked: matches!(config.blanking, SpecimenBlanking::IlDeflector { .. }),
            apertures_moved: config.touched_apertures(),
            probe_size_changed: true,
            lenses_changed: matches!(config.defocus, DefocusMethod::FreeLensControl { .. }),
            energy_shifted: matches!(config.defocus, DefocusMethod::EnergyShift { .. }),
        }
    }
}

/// Owns the obligation to restore the microscope.
pub struct ShowerGuard {
    scope: Arc<dyn MicroscopeControl>,
    saved: SavedMicroscopeState,
    config: ProcedureConfig,
    applied: AppliedMutations,
    events: EventSender,
    released: bool,
}

impl ShowerGuard {
    /// Creates a guard with nothing applied yet.
    pub fn new(
        scope: Arc<dyn MicroscopeControl>,
        saved: SavedMicroscopeState,
        config: ProcedureConfig,
        events: EventSender,
    ) -> Self {
        Self::with_applied(scope, saved, config, AppliedMutations::default(), events)
    }

    /// Creates a guard for mutations already known to be applied.
    pub fn with_applied(
        scope: Arc<dyn MicroscopeControl>,
        saved: SavedMicroscopeState,
        config: ProcedureConfig,
        applied: AppliedMutations,
        events: EventSender,
    ) -> Self {
        Self {
            scope,
            saved,
            config,
            applied,
            events,
            released: false,
        }
    }

    /// Mutations recorded so far.
    pub fn applied(&self) -> &AppliedMutations {
        &self.applied
    }

    pub(crate) fn applied_mut(&mut self) -> &mut AppliedMutations {
        &mut self.applied
    }

    /// Replays the saved state. Every step is attempted; failures are returned together.
    pub async fn release(mut self) -> Result<(), Vec<ControlError>> {
        self.released = true;
        restore(
            self.scope.as_ref(),
            &self.saved,
            &self.config,
            &self.applied,
            &self.events,
        )
        .await
    }
}

impl Drop for ShowerGuard {
    fn drop(&mut self) {
        if self.released || !self.applied.any() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Beam shower dropped while active; restoring in the background");
                let scope = Arc::clone(&self.scope);
                let saved = self.saved.clone();
                let config = self.config.clone();
                let applied = std::mem::take(&mut self.applied);
                let events = self.events.clone();
                handle.spawn(async move {
                    if let Err(errors) =
                        restore(scope.as_ref(), &saved, &config, &applied, &events).await
                    {
                        error!("Background restore failed in {} step(s)", errors.len());
                    }
                });
            }
            Err(_) => {
                error!(
                    "Beam shower dropped outside a runtime; microscope left in shower state. \
                     Run `beam_shower restore` to replay the backup record"
                );
            }
        }
    }
}

/// Restore sequence: blank, probe size, lenses, detectors, blanking, apertures,
/// screen, unblank.
async fn restore(
    scope: &dyn MicroscopeControl,
    saved: &SavedMicroscopeState,
    config: &ProcedureConfig,
    applied: &AppliedMutations,
    events: &EventSender,
) -> Result<(), Vec<ControlError>> {
    if !applied.any() {
        return Ok(());
    }
    info!("Resetting conditions");
    let hw = Hardware::new(scope, &config.settle);
    let mut failures = Vec::new();
    let mut check = |result: Result<(), ControlError>| {
        if let Err(err) = result {
            error!("Restore step failed: {}", err);
            events.error(err.to_string());
            failures.push(err);
        }
    };

    check(hw.blank_beam(true).await);

    if applied.probe_size_changed {
        check(scope.set_probe_size(saved.probe_size).await);
    }

    events.status("Resetting Lenses");
    if applied.lenses_changed {
        for err in restore_lenses(scope, saved).await {
            check(Err(err));
        }
    }
    if applied.energy_shifted {
        check(
            scope
                .set_energy_shift(saved.energy_shift.unwrap_or(0.0))
                .await,
        );
    }

    if !applied.detectors_retracted.is_empty() {
        events.status("Inserting Detectors");
        for id in &applied.detectors_retracted {
            check(hw.move_detector(*id, true).await);
        }
    }

    if applied.il_blanked {
        if let SpecimenBlanking::IlDeflector { deflector, .. } = config.blanking {
            check(
                scope
                    .set_deflector(deflector, saved.deflector(deflector))
                    .await,
            );
            info!("IL unblanked");
        }
    }

    if !applied.apertures_moved.is_empty() {
        events.status("Restoring Apertures");
        for kind in &applied.apertures_moved {
            check(hw.move_aperture(*kind, saved.aperture_size(*kind)).await);
        }
    }

    if applied.screen_lowered {
        match scope.screen_position().await {
            Ok(position) if position == saved.screen => {}
            Ok(_) => check(hw.move_screen(saved.screen).await),
            Err(err) => check(Err(err)),
        }
    }

    check(hw.blank_beam(false).await);

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}

/// Releases free lens control, then writes back any lens that did not return
/// to its saved value.
///
/// If the release or a read fails, the saved value is written anyway. Every
/// failure is returned.
async fn restore_lenses(
    scope: &dyn MicroscopeControl,
    saved: &SavedMicroscopeState,
) -> Vec<ControlError> {
    let mut failures = Vec::new();
    let released = match scope.release_free_lens_control().await {
        Ok(()) => true,
        Err(err) => {
            failures.push(err);
            false
        }
    };

    for lens in CondenserLens::ALL {
        let expected = saved.lenses.get(lens);
        let write = if released {
            match scope.condenser_lens(lens).await {
                Ok(actual) if actual == expected => false,
                Ok(actual) => {
                    warn!(
                        "{} reads {} after release, expected {}; writing saved value",
                        lens, actual, expected
                    );
                    true
                }
                Err(err) => {
                    failures.push(err);
                    true
                }
            }
        } else {
            true
        };
        if write {
            if let Err(err) = scope.set_condenser_lens(lens, expected).await {
                failures.push(err);
            }
        }
    }
    failures
}
