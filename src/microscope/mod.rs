//! Microscope control capability.
//!
//! The beam shower never talks to a vendor SDK directly. Everything it needs is
//! expressed by the [`MicroscopeControl`] trait, and an implementation is injected
//! into the procedure. This keeps the procedure free of global SDK objects and lets
//! the tests run against [`simulated::SimulatedMicroscope`].
//!
//! # Thread Safety
//!
//! Implementations must be `Send + Sync` so they can be shared with the restore
//! task spawned when a procedure is dropped mid-run. The procedure itself never
//! issues two calls concurrently.

pub mod simulated;

use crate::error::ControlResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Imaging mode reported by the microscope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImagingMode {
    /// Conventional transmission imaging.
    Tem,
    /// Scanning transmission imaging; required by the beam shower.
    Stem,
}

impl fmt::Display for ImagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImagingMode::Tem => write!(f, "TEM"),
            ImagingMode::Stem => write!(f, "STEM"),
        }
    }
}

/// One of the three condenser lenses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CondenserLens {
    /// First condenser lens.
    Cl1,
    /// Second condenser lens.
    Cl2,
    /// Third condenser lens.
    Cl3,
}

impl CondenserLens {
    /// All condenser lenses, in the order they are written.
    pub const ALL: [CondenserLens; 3] = [CondenserLens::Cl1, CondenserLens::Cl2, CondenserLens::Cl3];
}

impl fmt::Display for CondenserLens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CondenserLens::Cl1 => write!(f, "CL1"),
            CondenserLens::Cl2 => write!(f, "CL2"),
            CondenserLens::Cl3 => write!(f, "CL3"),
        }
    }
}

/// Current values of the three condenser lenses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LensCurrents {
    /// CL1 DAC value.
    pub cl1: u32,
    /// CL2 DAC value.
    pub cl2: u32,
    /// CL3 DAC value.
    pub cl3: u32,
}

impl LensCurrents {
    /// Creates a set of lens currents.
    pub fn new(cl1: u32, cl2: u32, cl3: u32) -> Self {
        Self { cl1, cl2, cl3 }
    }

    /// Returns the value for a single lens.
    pub fn get(&self, lens: CondenserLens) -> u32 {
        match lens {
            CondenserLens::Cl1 => self.cl1,
            CondenserLens::Cl2 => self.cl2,
            CondenserLens::Cl3 => self.cl3,
        }
    }

    /// Sets the value for a single lens.
    pub fn set(&mut self, lens: CondenserLens, value: u32) {
        match lens {
            CondenserLens::Cl1 => self.cl1 = value,
            CondenserLens::Cl2 => self.cl2 = value,
            CondenserLens::Cl3 => self.cl3 = value,
        }
    }
}

/// Post-specimen deflectors that can double as a beam blanker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IlDeflector {
    /// Image shift 2.
    ImageShift,
    /// Intermediate-lens deflector 2 (FLA2).
    Fla,
}

impl fmt::Display for IlDeflector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IlDeflector::ImageShift => write!(f, "IS2"),
            IlDeflector::Fla => write!(f, "FLA2"),
        }
    }
}

/// An (x, y) deflector setting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeflectorPair {
    /// X channel DAC value.
    pub x: u32,
    /// Y channel DAC value.
    pub y: u32,
}

impl DeflectorPair {
    /// Creates a deflector pair.
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Identifier of an attached detector (its index in the attached list).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectorId(pub u32);

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "detector {}", self.0)
    }
}

/// An attached detector as reported by the microscope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorInfo {
    /// Identifier used to move the detector.
    pub id: DetectorId,
    /// Name reported by the microscope, e.g. "ADF".
    pub name: String,
}

/// Position of the viewing screen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenPosition {
    /// In the beam path.
    Lowered,
    /// Out of the beam path.
    Raised,
}

/// Aperture slot selector (e.g. 0 = CL, 2 = OL, 4 = SA on the F200).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApertureKind(pub u8);

impl fmt::Display for ApertureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aperture kind {}", self.0)
    }
}

/// Capability interface over the microscope control library.
///
/// Calls are treated as synchronous and trusted to return; no timeouts are
/// applied. Mutating calls must not be retried by implementations.
#[async_trait]
pub trait MicroscopeControl: Send + Sync {
    /// Current imaging mode.
    async fn imaging_mode(&self) -> ControlResult<ImagingMode>;

    /// Currently selected probe (spot) size.
    async fn probe_size(&self) -> ControlResult<u8>;
    /// Selects a probe (spot) size.
    async fn set_probe_size(&self, size: u8) -> ControlResult<()>;

    /// Reads a condenser lens current.
    async fn condenser_lens(&self, lens: CondenserLens) -> ControlResult<u32>;
    /// Writes a condenser lens current through free lens control.
    async fn set_condenser_lens(&self, lens: CondenserLens, value: u32) -> ControlResult<()>;
    /// Switches free lens control off for all lenses.
    async fn release_free_lens_control(&self) -> ControlResult<()>;

    /// Reads an IL deflector pair.
    async fn deflector(&self, deflector: IlDeflector) -> ControlResult<DeflectorPair>;
    /// Writes an IL deflector pair.
    async fn set_deflector(&self, deflector: IlDeflector, value: DeflectorPair)
        -> ControlResult<()>;

    /// Blanks or unblanks the beam with the built-in blanker.
    async fn set_beam_blank(&self, blanked: bool) -> ControlResult<()>;

    /// Reads the energy-filter shift in eV.
    async fn energy_shift(&self) -> ControlResult<f64>;
    /// Writes the energy-filter shift in eV.
    async fn set_energy_shift(&self, ev: f64) -> ControlResult<()>;

    /// Lists attached detectors.
    async fn attached_detectors(&self) -> ControlResult<Vec<DetectorInfo>>;
    /// Whether a detector is currently inserted.
    async fn detector_inserted(&self, id: DetectorId) -> ControlResult<bool>;
    /// Inserts or retracts a detector.
    async fn set_detector_inserted(&self, id: DetectorId, inserted: bool) -> ControlResult<()>;

    /// Current viewing screen position.
    async fn screen_position(&self) -> ControlResult<ScreenPosition>;
    /// Moves the viewing screen.
    async fn set_screen_position(&self, position: ScreenPosition) -> ControlResult<()>;

    /// Aperture size index in the primary addressing mode (0 = removed).
    async fn aperture_size(&self, kind: ApertureKind) -> ControlResult<u8>;
    /// Selects an aperture size in the primary addressing mode.
    async fn set_aperture_size(&self, kind: ApertureKind, size: u8) -> ControlResult<()>;
    /// Aperture size index in the extended addressing mode.
    async fn extended_aperture_size(&self, kind: ApertureKind) -> ControlResult<u8>;
    /// Selects an aperture size in the extended addressing mode.
    async fn set_extended_aperture_size(&self, kind: ApertureKind, size: u8)
        -> ControlResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lens_currents_get_set() {
        let mut currents = LensCurrents::new(1, 2, 3);
        currents.set(CondenserLens::Cl2, 20000);
        assert_eq!(currents.get(CondenserLens::Cl1), 1);
        assert_eq!(currents.get(CondenserLens::Cl2), 20000);
        assert_eq!(currents.get(CondenserLens::Cl3), 3);
    }

    #[test]
    fn display_names_match_console_labels() {
        assert_eq!(IlDeflector::ImageShift.to_string(), "IS2");
        assert_eq!(IlDeflector::Fla.to_string(), "FLA2");
        assert_eq!(ImagingMode::Stem.to_string(), "STEM");
        assert_eq!(ApertureKind(4).to_string(), "aperture kind 4");
    }
}
