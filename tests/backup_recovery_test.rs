//! Backup record written at start, and recovery from it after an interrupted run.

use beam_shower::backup::BackupRecord;
use beam_shower::config::{ProcedureConfig, SettleDelays};
use beam_shower::error::ShowerError;
use beam_shower::events::ShowerEvent;
use beam_shower::microscope::simulated::SimulatedMicroscope;
use beam_shower::operator::AutoAcknowledge;
use beam_shower::procedure::{BeamShowerProcedure, RunState};
use std::sync::Arc;

fn quick_config() -> ProcedureConfig {
    ProcedureConfig {
        settle: SettleDelays::none(),
        ..ProcedureConfig::default()
    }
}

#[tokio::test]
async fn test_backup_is_written_before_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state_backup.toml");
    let scope = Arc::new(SimulatedMicroscope::new());
    let mut procedure =
        BeamShowerProcedure::new(scope.clone(), Arc::new(AutoAcknowledge)).with_backup(&path);

    procedure.start(quick_config()).await.unwrap();

    let record = BackupRecord::read(&path).await.unwrap();
    assert_eq!(Some(&record.saved), procedure.saved_state());
    assert_eq!(record.saved.probe_size, 5);
    assert_eq!(record.procedure, quick_config());
    procedure.stop().await.unwrap();
}

#[tokio::test]
async fn test_unwritable_backup_does_not_block_run() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not_a_dir");
    std::fs::write(&blocker, "file").unwrap();
    let scope = Arc::new(SimulatedMicroscope::new());
    let mut procedure = BeamShowerProcedure::new(scope.clone(), Arc::new(AutoAcknowledge))
        .with_backup(blocker.join("state_backup.toml"));

    procedure.start(quick_config()).await.unwrap();
    assert_eq!(procedure.state(), RunState::Running);
    procedure.stop().await.unwrap();
}

#[tokio::test]
async fn test_recover_replays_interrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state_backup.toml");
    let scope = Arc::new(SimulatedMicroscope::new());
    let before = scope.state().await;

    let mut crashed =
        BeamShowerProcedure::new(scope.clone(), Arc::new(AutoAcknowledge)).with_backup(&path);
    crashed.start(quick_config()).await.unwrap();
    // Process death: no restore runs.
    std::mem::forget(crashed);
    assert!(scope.state().await.free_lens.len() == 3);

    let record = BackupRecord::read(&path).await.unwrap();
    let mut procedure = BeamShowerProcedure::new(scope.clone(), Arc::new(AutoAcknowledge));
    let mut events = procedure.subscribe();
    procedure.recover(record).await.unwrap();

    assert_eq!(procedure.state(), RunState::Finished);
    assert_eq!(scope.state().await, before);

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ShowerEvent::Status(text) = event {
            statuses.push(text);
        }
    }
    assert!(statuses.contains(&"Beam Shower Finished".to_string()));
}

#[tokio::test]
async fn test_recover_is_rejected_during_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state_backup.toml");
    let scope = Arc::new(SimulatedMicroscope::new());
    let mut procedure =
        BeamShowerProcedure::new(scope.clone(), Arc::new(AutoAcknowledge)).with_backup(&path);
    procedure.start(quick_config()).await.unwrap();

    let record = BackupRecord::read(&path).await.unwrap();
    let err = procedure.recover(record).await.unwrap_err();
    assert!(matches!(
        err,
        ShowerError::InvalidState {
            operation: "recover",
            ..
        }
    ));
    procedure.stop().await.unwrap();
}

#[tokio::test]
async fn test_recover_finishes_a_failed_restore() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state_backup.toml");
    let scope = Arc::new(SimulatedMicroscope::new());
    let before = scope.state().await;
    let mut procedure =
        BeamShowerProcedure::new(scope.clone(), Arc::new(AutoAcknowledge)).with_backup(&path);
    procedure.start(quick_config()).await.unwrap();

    scope.fail_call("set_probe_size").await;
    let err = procedure.stop().await.unwrap_err();
    assert!(matches!(err, ShowerError::RestoreIncomplete(_)));
    assert_eq!(procedure.state(), RunState::Failed);
    assert_eq!(scope.state().await.probe_size, 1);

    scope.clear_failures().await;
    procedure.clear().unwrap();
    let record = BackupRecord::read(&path).await.unwrap();
    procedure.recover(record).await.unwrap();

    assert_eq!(procedure.state(), RunState::Finished);
    assert_eq!(scope.state().await, before);
}
