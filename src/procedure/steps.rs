//! Individual hardware moves with their settle delays.
//!
//! Both the preparation sequence and the restore sequence go through
//! [`Hardware`], so waits and the aperture addressing fallback behave the same
//! in both directions.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SettleDelays;
use crate::error::{ControlError, ControlResult};
use crate::microscope::{ApertureKind, DetectorId, MicroscopeControl, ScreenPosition};

/// Microscope handle paired with the settle delays of the current run.
pub(crate) struct Hardware<'a> {
    scope: &'a dyn MicroscopeControl,
    settle: &'a SettleDelays,
}

impl<'a> Hardware<'a> {
    pub(crate) fn new(scope: &'a dyn MicroscopeControl, settle: &'a SettleDelays) -> Self {
        Self { scope, settle }
    }

    pub(crate) fn scope(&self) -> &'a dyn MicroscopeControl {
        self.scope
    }

    pub(crate) async fn blank_beam(&self, blanked: bool) -> ControlResult<()> {
        self.scope.set_beam_blank(blanked).await?;
        info!("Beam {}", if blanked { "blanked" } else { "unblanked" });
        Ok(())
    }

    pub(crate) async fn move_screen(&self, position: ScreenPosition) -> ControlResult<()> {
        self.scope.set_screen_position(position).await?;
        settle(self.settle.screen).await;
        Ok(())
    }

    pub(crate) async fn move_detector(&self, id: DetectorId, inserted: bool) -> ControlResult<()> {
        self.scope.set_detector_inserted(id, inserted).await?;
        info!("{} {}", if inserted { "Inserted" } else { "Removed" }, id);
        settle(self.settle.detector).await;
        Ok(())
    }

    /// Selects `size` for an aperture slot; size 0 removes the aperture.
    ///
    /// Tries the primary addressing mode, then the extended one. Fails only if
    /// both are rejected.
    pub(crate) async fn move_aperture(&self, kind: ApertureKind, size: u8) -> ControlResult<()> {
        debug!("Setting {} to size {}", kind, size);
        match self.scope.set_aperture_size(kind, size).await {
            Ok(()) => {}
            Err(primary) => {
                warn!("{}; trying extended apertures", primary);
                self.scope
                    .set_extended_aperture_size(kind, size)
                    .await
                    .map_err(|extended| {
                        ControlError::new(
                            extended.call.clone(),
                            format!(
                                "{} (primary addressing: {})",
                                extended.message, primary.message
                            ),
                        )
                    })?;
            }
        }
        settle(self.settle.aperture).await;
        Ok(())
    }
}

async fn settle(delay: Duration) {
    if !delay.is_zero() {
        sleep(delay).await;
    }
}
