//! Integration tests for session history: configuration, storage and
//! view-time correlation.

use crate::harness_mock::MockHarness;
use liftlink::measurement::{MeasurementController, SessionStatus};
use liftlink::sensors::RecordingCommandLink;
use liftlink::storage::config::{load_config_from, save_config_to, AppConfig};
use liftlink::storage::session_store::{SessionStore, SqliteSessionStore};
use std::sync::Arc;

const HARNESS: &str = "C4:DE:E2:10:20:30";

fn run_session(controller: &MeasurementController, harness: &MockHarness) {
    assert!(controller.start());
    for payload in harness.notifications() {
        controller.on_notification(HARNESS, &payload);
    }
    assert_eq!(controller.status(), SessionStatus::Success);
    assert!(controller.reset_status());
}

#[tokio::test]
async fn test_history_from_configured_database() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.toml");

    let mut config = AppConfig::default();
    config.owner.user_id = "coach-7".to_string();
    config.owner.athlete_id = "lifter-3".to_string();
    config.session.persist_series = false;
    save_config_to(&config, &config_path).unwrap();

    let config = load_config_from(&config_path).unwrap();
    let store = Arc::new(SqliteSessionStore::open(&config.database_path()).unwrap());
    let link = Arc::new(RecordingCommandLink::with_connected(&[HARNESS]));
    let controller = MeasurementController::new(
        link,
        store.clone(),
        config.owner.to_owner(),
        config.session.clone(),
    );

    run_session(&controller, &MockHarness::default());
    run_session(&controller, &MockHarness::squat(6, 185));

    let history = store.list("coach-7", "lifter-3").unwrap();
    assert_eq!(history.len(), 2);
    // Newest first
    assert_eq!(history[0].samples.len(), 12);
    assert_eq!(history[1].samples.len(), 5);

    // Series is not stored, so it is derived from the raw samples
    assert!(history[1].series.is_none());
    let deltas: Vec<f64> = history[1]
        .correlated_series()
        .iter()
        .map(|p| p.angle_delta)
        .collect();
    assert_eq!(deltas, vec![5.0, 20.0, 5.0]);
    assert!(config_path.exists());
    assert!(dir.path().join("sessions.db").exists());
}

#[tokio::test]
async fn test_delete_removes_only_that_session() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteSessionStore::open(&dir.path().join("sessions.db")).unwrap());
    let config = AppConfig::default();
    let link = Arc::new(RecordingCommandLink::with_connected(&[HARNESS]));
    let controller = MeasurementController::new(
        link,
        store.clone(),
        config.owner.to_owner(),
        config.session.clone(),
    );

    run_session(&controller, &MockHarness::default());
    run_session(&controller, &MockHarness::default());

    let history = store.list(&config.owner.user_id, &config.owner.athlete_id).unwrap();
    assert_eq!(history.len(), 2);

    store.delete(&history[0].id).unwrap();
    let remaining = store.list(&config.owner.user_id, &config.owner.athlete_id).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, history[1].id);
    assert!(store.delete(&history[0].id).is_err());
}
