//! Simulated Microscope
//!
//! Provides an in-memory microscope for running the beam shower without hardware.
//! This is the equivalent of the control library's offline mode: every call
//! succeeds against simulated state unless a failure has been injected.
//!
//! Every mutating call is appended to a journal so tests can assert the exact
//! hardware sequence. Reads are not journaled.
//!
//! # Example
//!
//! ```rust,ignore
//! let scope = SimulatedMicroscope::new();
//! scope.set_beam_blank(true).await?;
//! assert_eq!(scope.calls().await, vec![ControlCall::SetBeamBlank(true)]);
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    ApertureKind, CondenserLens, DeflectorPair, DetectorId, DetectorInfo, IlDeflector,
    ImagingMode, LensCurrents, MicroscopeControl, ScreenPosition,
};
use crate::error::{ControlError, ControlResult};

/// A journaled mutating call.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlCall {
    /// `set_probe_size`
    SetProbeSize(u8),
    /// `set_condenser_lens`
    SetCondenserLens(CondenserLens, u32),
    /// `release_free_lens_control`
    ReleaseFreeLensControl,
    /// `set_deflector`
    SetDeflector(IlDeflector, DeflectorPair),
    /// `set_beam_blank`
    SetBeamBlank(bool),
    /// `set_energy_shift`
    SetEnergyShift(f64),
    /// `set_detector_inserted`
    SetDetectorInserted(DetectorId, bool),
    /// `set_screen_position`
    SetScreenPosition(ScreenPosition),
    /// `set_aperture_size`
    SetApertureSize(ApertureKind, u8),
    /// `set_extended_aperture_size`
    SetExtendedApertureSize(ApertureKind, u8),
}

/// Observable state of the simulated microscope.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulatedState {
    /// Current imaging mode.
    pub mode: ImagingMode,
    /// Selected probe size.
    pub probe_size: u8,
    /// Lens values set by the normal optics (without free lens control).
    pub standard_lenses: LensCurrents,
    /// Free lens control overrides, per lens.
    pub free_lens: HashMap<CondenserLens, u32>,
    /// IL image shift deflector.
    pub image_shift: DeflectorPair,
    /// FLA deflector.
    pub fla: DeflectorPair,
    /// Beam blanker state.
    pub beam_blanked: bool,
    /// Energy filter shift in eV.
    pub energy_shift: f64,
    /// Attached detectors and whether each is inserted.
    pub detectors: Vec<(DetectorInfo, bool)>,
    /// Viewing screen position.
    pub screen: ScreenPosition,
    /// Apertures addressable in the primary mode.
    pub apertures: HashMap<ApertureKind, u8>,
    /// Apertures addressable only in the extended mode.
    pub extended_apertures: HashMap<ApertureKind, u8>,
}

impl SimulatedState {
    /// Effective lens values, with free lens control overrides applied.
    pub fn lenses(&self) -> LensCurrents {
        let mut lenses = self.standard_lenses;
        for (lens, value) in &self.free_lens {
            lenses.set(*lens, *value);
        }
        lenses
    }

    /// IDs of the detectors currently inserted.
    pub fn inserted_detectors(&self) -> Vec<DetectorId> {
        self.detectors
            .iter()
            .filter(|(_, inserted)| *inserted)
            .map(|(info, _)| info.id)
            .collect()
    }
}

impl Default for SimulatedState {
    fn default() -> Self {
        Self {
            mode: ImagingMode::Stem,
            probe_size: 5,
            standard_lenses: LensCurrents::new(0x8000, 0x6D60, 0x8CA0),
            free_lens: HashMap::new(),
            image_shift: DeflectorPair::new(0x8000, 0x8000),
            fla: DeflectorPair::new(0x7F10, 0x80A0),
            beam_blanked: false,
            energy_shift: 0.0,
            detectors: vec![
                (
                    DetectorInfo {
                        id: DetectorId(0),
                        name: "ADF1".to_string(),
                    },
                    true,
                ),
                (
                    DetectorInfo {
                        id: DetectorId(1),
                        name: "BF".to_string(),
                    },
                    false,
                ),
            ],
            screen: ScreenPosition::Raised,
            apertures: HashMap::from([
                (ApertureKind(0), 2),
                (ApertureKind(2), 0),
                (ApertureKind(4), 0),
            ]),
            extended_apertures: HashMap::new(),
        }
    }
}

#[derive(Debug)]
enum Failure {
    Always,
    Times(u32),
}

struct Inner {
    state: SimulatedState,
    calls: Vec<ControlCall>,
    failures: HashMap<String, Failure>,
}

/// In-memory microscope with a call journal and failure injection.
pub struct SimulatedMicroscope {
    inner: Mutex<Inner>,
}

impl SimulatedMicroscope {
    /// Create a simulated microscope in STEM mode with default optics.
    pub fn new() -> Self {
        Self::with_state(SimulatedState::default())
    }

    /// Create a simulated microscope from explicit state.
    pub fn with_state(state: SimulatedState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                calls: Vec::new(),
                failures: HashMap::new(),
            }),
        }
    }

    /// Makes every call with the given name fail.
    pub async fn fail_call(&self, call: &str) {
        self.inner
            .lock()
            .await
            .failures
            .insert(call.to_string(), Failure::Always);
    }

    /// Makes the next `times` calls with the given name fail.
    pub async fn fail_call_times(&self, call: &str, times: u32) {
        if times == 0 {
            return;
        }
        self.inner
            .lock()
            .await
            .failures
            .insert(call.to_string(), Failure::Times(times));
    }

    /// Removes all injected failures.
    pub async fn clear_failures(&self) {
        self.inner.lock().await.failures.clear();
    }

    /// Journal of mutating calls, oldest first.
    pub async fn calls(&self) -> Vec<ControlCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Empties the call journal.
    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Copy of the current simulated state.
    pub async fn state(&self) -> SimulatedState {
        self.inner.lock().await.state.clone()
    }

    /// Changes the imaging mode, as an operator would at the console.
    pub async fn set_mode(&self, mode: ImagingMode) {
        self.inner.lock().await.state.mode = mode;
    }
}

impl Default for SimulatedMicroscope {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn check(&mut self, call: &str) -> ControlResult<()> {
        match self.failures.get_mut(call) {
            None => Ok(()),
            Some(Failure::Always) => Err(ControlError::new(call, "injected failure")),
            Some(Failure::Times(remaining)) => {
                *remaining -= 1;
                if *remaining == 0 {
                    self.failures.remove(call);
                }
                Err(ControlError::new(call, "injected failure"))
            }
        }
    }

    fn record(&mut self, call: ControlCall) {
        debug!(?call, "SimulatedMicroscope");
        self.calls.push(call);
    }

    fn detector_mut(&mut self, id: DetectorId, call: &str) -> ControlResult<&mut bool> {
        self.state
            .detectors
            .iter_mut()
            .find(|(info, _)| info.id == id)
            .map(|(_, inserted)| inserted)
            .ok_or_else(|| ControlError::new(call, format!("{id} is not attached")))
    }
}

fn unknown_aperture(call: &str, kind: ApertureKind) -> ControlError {
    ControlError::new(call, format!("{kind} not available in this addressing mode"))
}

#[async_trait]
impl MicroscopeControl for SimulatedMicroscope {
    async fn imaging_mode(&self) -> ControlResult<ImagingMode> {
        let mut inner = self.inner.lock().await;
        inner.check("imaging_mode")?;
        Ok(inner.state.mode)
    }

    async fn probe_size(&self) -> ControlResult<u8> {
        let mut inner = self.inner.lock().await;
        inner.check("probe_size")?;
        Ok(inner.state.probe_size)
    }

    async fn set_probe_size(&self, size: u8) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check("set_probe_size")?;
        inner.record(ControlCall::SetProbeSize(size));
        inner.state.probe_size = size;
        Ok(())
    }

    async fn condenser_lens(&self, lens: CondenserLens) -> ControlResult<u32> {
        let mut inner = self.inner.lock().await;
        inner.check("condenser_lens")?;
        Ok(inner.state.lenses().get(lens))
    }

    async fn set_condenser_lens(&self, lens: CondenserLens, value: u32) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check("set_condenser_lens")?;
        inner.record(ControlCall::SetCondenserLens(lens, value));
        inner.state.free_lens.insert(lens, value);
        Ok(())
    }

    async fn release_free_lens_control(&self) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check("release_free_lens_control")?;
        inner.record(ControlCall::ReleaseFreeLensControl);
        inner.state.free_lens.clear();
        Ok(())
    }

    async fn deflector(&self, deflector: IlDeflector) -> ControlResult<DeflectorPair> {
        let mut inner = self.inner.lock().await;
        inner.check("deflector")?;
        Ok(match deflector {
            IlDeflector::ImageShift => inner.state.image_shift,
            IlDeflector::Fla => inner.state.fla,
        })
    }

    async fn set_deflector(
        &self,
        deflector: IlDeflector,
        value: DeflectorPair,
    ) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check("set_deflector")?;
        inner.record(ControlCall::SetDeflector(deflector, value));
        match deflector {
            IlDeflector::ImageShift => inner.state.image_shift = value,
            IlDeflector::Fla => inner.state.fla = value,
        }
        Ok(())
    }

    async fn set_beam_blank(&self, blanked: bool) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check("set_beam_blank")?;
        inner.record(ControlCall::SetBeamBlank(blanked));
        inner.state.beam_blanked = blanked;
        Ok(())
    }

    async fn energy_shift(&self) -> ControlResult<f64> {
        let mut inner = self.inner.lock().await;
        inner.check("energy_shift")?;
        Ok(inner.state.energy_shift)
    }

    async fn set_energy_shift(&self, ev: f64) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check("set_energy_shift")?;
        inner.record(ControlCall::SetEnergyShift(ev));
        inner.state.energy_shift = ev;
        Ok(())
    }

    async fn attached_detectors(&self) -> ControlResult<Vec<DetectorInfo>> {
        let mut inner = self.inner.lock().await;
        inner.check("attached_detectors")?;
        Ok(inner
            .state
            .detectors
            .iter()
            .map(|(info, _)| info.clone())
            .collect())
    }

    async fn detector_inserted(&self, id: DetectorId) -> ControlResult<bool> {
        let mut inner = self.inner.lock().await;
        inner.check("detector_inserted")?;
        inner.detector_mut(id, "detector_inserted").map(|inserted| *inserted)
    }

    async fn set_detector_inserted(&self, id: DetectorId, inserted: bool) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check("set_detector_inserted")?;
        *inner.detector_mut(id, "set_detector_inserted")? = inserted;
        inner.record(ControlCall::SetDetectorInserted(id, inserted));
        Ok(())
    }

    async fn screen_position(&self) -> ControlResult<ScreenPosition> {
        let mut inner = self.inner.lock().await;
        inner.check("screen_position")?;
        Ok(inner.state.screen)
    }

    async fn set_screen_position(&self, position: ScreenPosition) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check("set_screen_position")?;
        inner.record(ControlCall::SetScreenPosition(position));
        inner.state.screen = position;
        Ok(())
    }

    async fn aperture_size(&self, kind: ApertureKind) -> ControlResult<u8> {
        let mut inner = self.inner.lock().await;
        inner.check("aperture_size")?;
        inner
            .state
            .apertures
            .get(&kind)
            .copied()
            .ok_or_else(|| unknown_aperture("aperture_size", kind))
    }

    async fn set_aperture_size(&self, kind: ApertureKind, size: u8) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check("set_aperture_size")?;
        let slot = inner
            .state
            .apertures
            .get_mut(&kind)
            .ok_or_else(|| unknown_aperture("set_aperture_size", kind))?;
        *slot = size;
        inner.record(ControlCall::SetApertureSize(kind, size));
        Ok(())
    }

    async fn extended_aperture_size(&self, kind: ApertureKind) -> ControlResult<u8> {
        let mut inner = self.inner.lock().await;
        inner.check("extended_aperture_size")?;
        inner
            .state
            .extended_apertures
            .get(&kind)
            .copied()
            .ok_or_else(|| unknown_aperture("extended_aperture_size", kind))
    }

    async fn set_extended_aperture_size(
        &self,
        kind: ApertureKind,
        size: u8,
    ) -> ControlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check("set_extended_aperture_size")?;
        let slot = inner
            .state
            .extended_apertures
            .get_mut(&kind)
            .ok_or_else(|| unknown_aperture("set_extended_aperture_size", kind))?;
        *slot = size;
        inner.record(ControlCall::SetExtendedApertureSize(kind, size));
        Ok(())
    }
}
