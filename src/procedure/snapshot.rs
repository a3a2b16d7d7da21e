//! Snapshot of the microscope state taken before the first mutation.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{DefocusMethod, ProcedureConfig};
use crate::error::ControlResult;
use crate::microscope::{
    ApertureKind, CondenserLens, DeflectorPair, DetectorId, IlDeflector, LensCurrents,
    MicroscopeControl, ScreenPosition,
};

/// Saved size of one aperture slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApertureSnapshot {
    /// Aperture slot.
    pub kind: ApertureKind,
    /// `None` when neither addressing mode could report the size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u8>,
}

/// Everything a run changes, as it was before the run.
///
/// Captured once by `start`, never modified, and replayed by `reset`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedMicroscopeState {
    /// Probe size before the run.
    pub probe_size: u8,
    /// Condenser lens values before the run.
    pub lenses: LensCurrents,
    /// IL image shift before the run.
    pub image_shift: DeflectorPair,
    /// FLA deflector before the run.
    pub fla: DeflectorPair,
    /// Only read when the run defocuses with the energy filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_shift: Option<f64>,
    /// Screen position before the run.
    pub screen: ScreenPosition,
    /// Detectors that were inserted, in attach order.
    pub inserted_detectors: Vec<DetectorId>,
    /// Sizes of every aperture the run may move.
    pub apertures: Vec<ApertureSnapshot>,
}

impl SavedMicroscopeState {
    /// Reads the current state. Issues no mutating call.
    pub async fn capture(
        scope: &dyn MicroscopeControl,
        config: &ProcedureConfig,
    ) -> ControlResult<Self> {
        let probe_size = scope.probe_size().await?;

        let mut lenses = LensCurrents::default();
        for lens in CondenserLens::ALL {
            lenses.set(lens, scope.condenser_lens(lens).await?);
        }

        let image_shift = scope.deflector(IlDeflector::ImageShift).await?;
        let fla = scope.deflector(IlDeflector::Fla).await?;

        let energy_shift = match config.defocus {
            DefocusMethod::EnergyShift { .. } => Some(scope.energy_shift().await?),
            DefocusMethod::FreeLensControl { .. } => None,
        };

        let screen = scope.screen_position().await?;

        let mut inserted_detectors = Vec::new();
        for detector in scope.attached_detectors().await? {
            if scope.detector_inserted(detector.id).await? {
                debug!("{} ({}) is inserted", detector.name, detector.id);
                inserted_detectors.push(detector.id);
            }
        }

        let mut apertures = Vec::new();
        for kind in config.touched_apertures() {
            apertures.push(ApertureSnapshot {
                kind,
                size: read_aperture(scope, kind).await,
            });
        }

        Ok(Self {
            probe_size,
            lenses,
            image_shift,
            fla,
            energy_shift,
            screen,
            inserted_detectors,
            apertures,
        })
    }

    /// Saved value of an IL deflector.
    pub fn deflector(&self, deflector: IlDeflector) -> DeflectorPair {
        match deflector {
            IlDeflector::ImageShift => self.image_shift,
            IlDeflector::Fla => self.fla,
        }
    }

    /// Size to restore an aperture to. Unknown or untracked slots restore as removed.
    pub fn aperture_size(&self, kind: ApertureKind) -> u8 {
        self.apertures
            .iter()
            .find(|snapshot| snapshot.kind == kind)
            .and_then(|snapshot| snapshot.size)
            .unwrap_or(0)
    }
}

async fn read_aperture(scope: &dyn MicroscopeControl, kind: ApertureKind) -> Option<u8> {
    match scope.aperture_size(kind).await {
        Ok(size) => Some(size),
        Err(primary) => match scope.extended_aperture_size(kind).await {
            Ok(size) => Some(size),
            Err(extended) => {
                warn!(
                    "Could not read {}: {}; {}. It will be restored as removed",
                    kind, primary, extended
                );
                None
            }
        },
    }
}
