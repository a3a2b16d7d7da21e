//! Beam shower sequencing for STEM microscopes.
//!
//! A beam shower floods the specimen area with a broad, defocused electron
//! beam for a fixed time to fix hydrocarbon contamination before imaging. This
//! crate saves the relevant microscope state, applies the shower conditions,
//! counts down, and restores the saved state on every exit path.
//!
//! The microscope is reached only through the [`microscope::MicroscopeControl`]
//! trait. [`microscope::simulated::SimulatedMicroscope`] implements it in
//! memory for tests and dry runs.
//!
//! ```no_run
//! use std::sync::Arc;
//! use beam_shower::config::ProcedureConfig;
//! use beam_shower::microscope::simulated::SimulatedMicroscope;
//! use beam_shower::operator::AutoAcknowledge;
//! use beam_shower::procedure::BeamShowerProcedure;
//! use beam_shower::session::ShowerSession;
//!
//! # async fn demo() -> beam_shower::error::ShowerResult<()> {
//! let scope = Arc::new(SimulatedMicroscope::new());
//! let procedure = BeamShowerProcedure::new(scope, Arc::new(AutoAcknowledge));
//! let mut session = ShowerSession::new(procedure, std::time::Duration::from_secs(1));
//! session
//!     .run(ProcedureConfig::default(), async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod microscope;
pub mod operator;
pub mod procedure;
pub mod session;
