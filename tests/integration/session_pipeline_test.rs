//! Integration tests for the notification-to-storage pipeline.

use crate::harness_mock::MockHarness;
use liftlink::measurement::{MeasurementController, SessionConfig, SessionOwner, SessionStatus};
use liftlink::sensors::{Command, RecordingCommandLink};
use liftlink::storage::session_store::{MemorySessionStore, SessionStore, SqliteSessionStore};
use std::sync::Arc;
use std::time::Duration;

const HARNESS: &str = "C4:DE:E2:10:20:30";

fn owner() -> SessionOwner {
    SessionOwner::new("coach-1", "athlete-1")
}

#[tokio::test]
async fn test_streamed_session_saved_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteSessionStore::open(&dir.path().join("sessions.db")).unwrap());
    let link = Arc::new(RecordingCommandLink::with_connected(&[HARNESS]));
    let controller =
        MeasurementController::new(link.clone(), store.clone(), owner(), SessionConfig::default());

    let harness = MockHarness::default();
    let mut notifications = harness.notifications();
    let last = notifications.pop().unwrap();

    assert!(controller.start());
    for payload in &notifications {
        controller.on_notification(HARNESS, payload);
    }
    assert!(controller.stop());
    controller.on_notification(HARNESS, &last);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Success);
    let deltas: Vec<f64> = snapshot.series.iter().map(|p| p.angle_delta).collect();
    assert_eq!(deltas, vec![5.0, 20.0, 5.0]);
    assert_eq!(link.sent_commands(), vec![Command::Start, Command::Stop]);

    let saved = store.list("coach-1", "athlete-1").unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].samples.len(), 5);
    assert_eq!(Some(saved[0].id), snapshot.last_saved);
    assert_eq!(saved[0].correlated_series(), snapshot.series);
}

#[tokio::test(start_paused = true)]
async fn test_lost_end_finalizes_after_timeout() {
    let store = Arc::new(MemorySessionStore::new());
    let link = Arc::new(RecordingCommandLink::with_connected(&[HARNESS]));
    let controller =
        MeasurementController::new(link, store.clone(), owner(), SessionConfig::default());

    let harness = MockHarness::squat(50, 517);
    let records = harness.records().concat();

    controller.start();
    for chunk in records.as_bytes().chunks(64) {
        controller.on_notification(HARNESS, chunk);
    }
    controller.stop();
    assert_eq!(controller.status(), SessionStatus::Stopping);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let mut rx = controller.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.status == SessionStatus::Success),
    )
    .await
    .unwrap()
    .unwrap();
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].samples.len(), 100);
    assert_eq!(controller.snapshot().series.len(), 50);
}

#[tokio::test]
async fn test_failed_save_then_manual_retry() {
    let store = Arc::new(MemorySessionStore::new());
    let link = Arc::new(RecordingCommandLink::with_connected(&[HARNESS]));
    let controller =
        MeasurementController::new(link.clone(), store.clone(), owner(), SessionConfig::default());

    store.set_fail_saves(true);
    controller.start();
    let mut transitions = controller.subscribe_transitions();
    for payload in MockHarness::default().notifications() {
        controller.on_notification(HARNESS, &payload);
    }
    assert_eq!(controller.status(), SessionStatus::Error);
    // END before STOP still passes through Stopping
    assert_eq!(transitions.try_recv().unwrap(), SessionStatus::Stopping);
    assert_eq!(transitions.try_recv().unwrap(), SessionStatus::Saving);
    assert_eq!(transitions.try_recv().unwrap(), SessionStatus::Error);
    assert!(!controller.start());

    store.set_fail_saves(false);
    assert!(controller.retry_save());
    assert_eq!(controller.status(), SessionStatus::Success);
    assert_eq!(store.records().len(), 1);
    assert_eq!(store.save_attempts(), 2);
}

#[tokio::test]
async fn test_disconnect_mid_run_keeps_buffered_samples() {
    let store = Arc::new(MemorySessionStore::new());
    let link = Arc::new(RecordingCommandLink::with_connected(&[HARNESS]));
    let controller =
        MeasurementController::new(link.clone(), store.clone(), owner(), SessionConfig::default());

    let harness = MockHarness::squat(10, 185);
    let records = harness.records();

    controller.start();
    for record in &records[..6] {
        controller.on_notification(HARNESS, record.as_bytes());
    }
    // Half a record in flight when the link drops
    controller.on_notification(HARNESS, &records[6].as_bytes()[..10]);

    link.disconnect(HARNESS);
    controller.on_link_lost(HARNESS);

    assert_eq!(controller.status(), SessionStatus::Success);
    assert_eq!(store.records()[0].samples.len(), 6);
    assert!(!controller.stop());
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let store = Arc::new(MemorySessionStore::new());
    let link = Arc::new(RecordingCommandLink::with_connected(&[HARNESS]));
    let controller =
        MeasurementController::new(link.clone(), store.clone(), owner(), SessionConfig::default());

    controller.start();
    for payload in MockHarness::squat(4, 23).notifications() {
        controller.on_notification(HARNESS, &payload);
    }
    assert!(controller.reset_status());

    controller.start();
    for payload in MockHarness::default().notifications() {
        controller.on_notification(HARNESS, &payload);
    }

    let records = store.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].samples.len(), 8);
    assert_eq!(records[1].samples.len(), 5);
    assert_ne!(records[0].id, records[1].id);

    let listed = store.list("coach-1", "athlete-1").unwrap();
    assert_eq!(listed.len(), 2);
}
