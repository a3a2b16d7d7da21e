//! Human-readable backup of the original microscope state.
//!
//! Written as TOML at the start of every run, before the first mutation, so an
//! operator can read the original lens values and `beam_shower restore` can
//! replay them if the process dies mid-run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::ProcedureConfig;
use crate::error::{ShowerError, ShowerResult};
use crate::procedure::SavedMicroscopeState;

/// Backup record of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// When the state was captured
    pub created_at: DateTime<Utc>,
    /// Machine the run was started on
    pub host: String,
    /// Procedure configuration of the run, needed to know what to undo
    pub procedure: ProcedureConfig,
    /// State before the run
    pub saved: SavedMicroscopeState,
}

impl BackupRecord {
    /// Creates a record stamped with the current time and host name.
    pub fn new(procedure: ProcedureConfig, saved: SavedMicroscopeState) -> Self {
        let host = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            created_at: Utc::now(),
            host,
            procedure,
            saved,
        }
    }

    /// Writes the record, creating parent directories as needed.
    pub async fn write(&self, path: &Path) -> ShowerResult<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|err| ShowerError::Backup(format!("serialize: {err}")))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, text).await?;
        Ok(())
    }

    /// Reads a record written by [`BackupRecord::write`].
    pub async fn read(path: &Path) -> ShowerResult<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|err| {
            ShowerError::Backup(format!("read {}: {err}", path.display()))
        })?;
        toml::from_str(&text)
            .map_err(|err| ShowerError::Backup(format!("parse {}: {err}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DefocusMethod, SpecimenBlanking};
    use crate::microscope::simulated::SimulatedMicroscope;
    use crate::microscope::IlDeflector;

    #[tokio::test]
    async fn record_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("backup.toml");
        let config = ProcedureConfig {
            defocus: DefocusMethod::EnergyShift { ev: 2000.0 },
            blanking: SpecimenBlanking::IlDeflector {
                deflector: IlDeflector::ImageShift,
                value: crate::microscope::DeflectorPair::new(0xFFFF, 0xFFFF),
            },
            ..ProcedureConfig::default()
        };
        let scope = SimulatedMicroscope::new();
        let saved = SavedMicroscopeState::capture(&scope, &config).await.unwrap();

        let record = BackupRecord::new(config, saved);
        record.write(&path).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("lenses"));

        let read = BackupRecord::read(&path).await.unwrap();
        assert_eq!(read.saved, record.saved);
        assert_eq!(read.procedure, record.procedure);
    }

    #[tokio::test]
    async fn missing_file_is_a_backup_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BackupRecord::read(&dir.path().join("absent.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShowerError::Backup(_)));
    }
}
