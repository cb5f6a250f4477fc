mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{next_committed, start_engine, wait_for_raw};
use thermocal_lib::calibration::{CalibrationCoefficients, CalibrationLogEntry, CaptureError};
use thermocal_lib::engine::{CaptureAck, EngineError, ProbeEvent};
use thermocal_lib::persistence::{CalibrationStore, MemoryCalibrationStore, PersistenceResult};

const STANDARD_LINE: &str = "29:1265.1;30:974.3;31:533.8;32:3017.3";

/// Store whose log appends never complete, like an API that stopped answering.
struct StalledStore;

#[async_trait::async_trait]
impl CalibrationStore for StalledStore {
    async fn fetch_log(&self) -> PersistenceResult<Vec<CalibrationLogEntry>> {
        Ok(Vec::new())
    }

    async fn append_log(&self, _entry: &CalibrationLogEntry) -> PersistenceResult<()> {
        std::future::pending().await
    }

    async fn fetch_coefficients(&self) -> PersistenceResult<Option<BTreeMap<u32, CalibrationCoefficients>>> {
        Ok(None)
    }
}

fn entry(ordinal: u32, reference: f64, raw: [f64; 4]) -> CalibrationLogEntry {
    CalibrationLogEntry {
        ordinal,
        timestamp: Utc::now(),
        reference_temperature_c: reference,
        raw_values: raw,
    }
}

#[tokio::test]
async fn test_instant_capture_appends_persists_and_refits() {
    let store = Arc::new(MemoryCalibrationStore::new());
    let (handle, link) = start_engine(store.clone()).await;

    link.line(STANDARD_LINE);
    wait_for_raw(&handle, 4, 3017.3).await;

    let ack = handle.capture("90", Duration::ZERO).await.unwrap();
    let outcome = match ack {
        CaptureAck::Committed(outcome) => outcome,
        other => panic!("expected instant commit, got {:?}", other),
    };

    assert_eq!(outcome.entry.ordinal, 1);
    assert_eq!(outcome.entry.reference_temperature_c, 90.0);
    assert_eq!(outcome.entry.raw_values, [1265.1, 974.3, 533.8, 3017.3]);
    assert_eq!(outcome.points.len(), 4);
    assert!((outcome.points[0].temperature_c - 90.0).abs() < 1e-6);
    assert_eq!(outcome.refits.len(), 4);
    assert!(outcome.refits.iter().all(|r| r.coefficients.is_some() && !r.from_history));

    assert_eq!(store.entries().await.len(), 1);
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.log.len(), 1);
    assert_eq!(snapshot.markers.len(), 4);

    let next = handle.capture("100", Duration::ZERO).await.unwrap();
    match next {
        CaptureAck::Committed(outcome) => assert_eq!(outcome.entry.ordinal, 2),
        other => panic!("expected instant commit, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_reference_changes_nothing() {
    let store = Arc::new(MemoryCalibrationStore::new());
    let (handle, link) = start_engine(store.clone()).await;
    link.line(STANDARD_LINE);
    wait_for_raw(&handle, 1, 1265.1).await;

    let err = handle.capture("  ", Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(CaptureError::MissingReference)));

    let err = handle.capture("warm", Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(CaptureError::InvalidReference(_))));

    let snapshot = handle.snapshot();
    assert!(snapshot.log.is_empty());
    assert!(!snapshot.averaging);
    assert!(store.entries().await.is_empty());
}

#[tokio::test]
async fn test_capture_without_active_channels_is_rejected() {
    let store = Arc::new(MemoryCalibrationStore::new());
    let (handle, _link) = start_engine(store).await;
    for id in 1..=4 {
        handle.set_channel_active(id, false).await.unwrap();
    }

    let err = handle.capture("90", Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(CaptureError::NoActiveChannel)));
}

#[tokio::test(start_paused = true)]
async fn test_averaging_capture_means_samples_over_window() {
    let store = Arc::new(MemoryCalibrationStore::new());
    let (handle, link) = start_engine(store.clone()).await;
    link.line("29:1000;30:1000;31:1000;32:1000");
    wait_for_raw(&handle, 1, 1000.0).await;

    let mut events = handle.subscribe_events();
    let ack = handle.capture("90", Duration::from_secs(2)).await.unwrap();
    assert!(matches!(ack, CaptureAck::Averaging { replaced_previous: false, .. }));
    assert!(handle.snapshot().averaging);

    // samples land at 0.5s, 1.0s, 1.5s and 2.0s
    tokio::time::sleep(Duration::from_millis(750)).await;
    link.line("29:2000;30:2000;31:2000;32:2000");
    tokio::time::sleep(Duration::from_millis(500)).await;
    link.line("29:3000;30:3000;31:3000;32:3000");
    tokio::time::sleep(Duration::from_millis(500)).await;
    link.line("29:4000;30:4000;31:4000;32:4000");

    let outcome = next_committed(&mut events).await;
    assert_eq!(outcome.entry.ordinal, 1);
    assert_eq!(outcome.entry.raw_values, [2500.0; 4]);
    assert_eq!(store.entries().await.len(), 1);
    assert!(!handle.snapshot().averaging);
}

#[tokio::test(start_paused = true)]
async fn test_new_averaging_request_replaces_running_session() {
    let store = Arc::new(MemoryCalibrationStore::new());
    let (handle, link) = start_engine(store.clone()).await;
    link.line("29:1500;30:1500;31:1500;32:1500");
    wait_for_raw(&handle, 1, 1500.0).await;

    let mut events = handle.subscribe_events();
    handle.capture("60", Duration::from_secs(2)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let ack = handle.capture("90", Duration::from_secs(2)).await.unwrap();
    assert!(matches!(ack, CaptureAck::Averaging { replaced_previous: true, .. }));

    let outcome = next_committed(&mut events).await;
    assert_eq!(outcome.entry.reference_temperature_c, 90.0);
    assert_eq!(outcome.entry.ordinal, 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let entries = store.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reference_temperature_c, 90.0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_capture_never_commits() {
    let store = Arc::new(MemoryCalibrationStore::new());
    let (handle, link) = start_engine(store.clone()).await;
    link.line(STANDARD_LINE);
    wait_for_raw(&handle, 1, 1265.1).await;

    let mut events = handle.subscribe_events();
    handle.capture("90", Duration::from_secs(2)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(handle.cancel_capture().await.unwrap());
    assert!(!handle.cancel_capture().await.unwrap());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(handle.snapshot().log.is_empty());
    assert!(store.entries().await.is_empty());

    let mut saw_cancel = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ProbeEvent::CaptureCancelled => saw_cancel = true,
            ProbeEvent::CaptureCommitted(_) => panic!("cancelled capture committed"),
            _ => {}
        }
    }
    assert!(saw_cancel);
}

#[tokio::test]
async fn test_persistence_failure_keeps_local_entry_and_skips_refit() {
    let store = Arc::new(MemoryCalibrationStore::new());
    let (handle, link) = start_engine(store.clone()).await;
    link.line(STANDARD_LINE);
    wait_for_raw(&handle, 1, 1265.1).await;

    let before = handle.snapshot().coefficients.clone();
    let mut events = handle.subscribe_events();
    store.set_fail_appends(true);

    let err = handle.capture("90", Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.log.len(), 1);
    assert_eq!(snapshot.coefficients, before);
    assert!(store.entries().await.is_empty());

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let ProbeEvent::PersistenceFailed { ordinal, .. } = event {
            assert_eq!(ordinal, 1);
            saw_failure = true;
        }
    }
    assert!(saw_failure);
    assert_eq!(handle.metrics_receiver().borrow().persistence_failures, 1);
}

#[tokio::test]
async fn test_singular_refit_keeps_previous_coefficients() {
    let entries = vec![
        entry(1, 60.0, [1000.0, 0.0, 0.0, 0.0]),
        entry(2, 70.0, [1000.0, 0.0, 0.0, 0.0]),
        entry(3, 80.0, [1000.0, 0.0, 0.0, 0.0]),
    ];
    let store: Arc<dyn CalibrationStore> = Arc::new(MemoryCalibrationStore::with_entries(entries));
    let (handle, link) = start_engine(store).await;
    for id in 2..=4 {
        handle.set_channel_active(id, false).await.unwrap();
    }
    link.line("29:1000");
    wait_for_raw(&handle, 1, 1000.0).await;

    let before = handle.snapshot().coefficients[&29];
    let mut events = handle.subscribe_events();

    let outcome = match handle.capture("90", Duration::ZERO).await.unwrap() {
        CaptureAck::Committed(outcome) => outcome,
        other => panic!("expected instant commit, got {:?}", other),
    };
    assert_eq!(outcome.entry.ordinal, 4);
    assert_eq!(outcome.entry.raw_values, [1000.0, 0.0, 0.0, 0.0]);
    assert_eq!(outcome.refits.len(), 1);
    assert!(outcome.refits[0].coefficients.is_none());
    assert!(outcome.refits[0].error.is_some());

    assert_eq!(handle.snapshot().coefficients[&29], before);

    let mut saw_refit_failure = false;
    while let Ok(event) = events.try_recv() {
        if let ProbeEvent::RefitFailed { hardware_channel, .. } = event {
            assert_eq!(hardware_channel, 29);
            saw_refit_failure = true;
        }
    }
    assert!(saw_refit_failure);
}

#[tokio::test]
async fn test_stalled_store_does_not_block_engine() {
    let limit = Duration::from_secs(2);
    let (handle, link) = start_engine(Arc::new(StalledStore)).await;
    link.line(STANDARD_LINE);
    wait_for_raw(&handle, 1, 1265.1).await;

    let capture = tokio::spawn({
        let handle = handle.clone();
        async move { handle.capture("90", Duration::ZERO).await }
    });

    let mut snapshots = handle.snapshot_receiver();
    tokio::time::timeout(limit, snapshots.wait_for(|s| s.log.len() == 1))
        .await
        .expect("entry not appended locally")
        .unwrap();

    link.line("29:2000");
    tokio::time::timeout(limit, wait_for_raw(&handle, 1, 2000.0))
        .await
        .expect("telemetry stalled while saving");
    assert!(!tokio::time::timeout(limit, handle.cancel_capture()).await.unwrap().unwrap());

    tokio::time::timeout(limit, handle.shutdown())
        .await
        .expect("shutdown stalled while saving")
        .unwrap();
    assert!(link.is_closed());

    let result = capture.await.unwrap();
    assert!(matches!(result, Err(EngineError::ChannelClosed)));
}

#[tokio::test]
async fn test_out_of_range_duration_keeps_engine_running() {
    let store = Arc::new(MemoryCalibrationStore::new());
    let (handle, link) = start_engine(store.clone()).await;
    link.line(STANDARD_LINE);
    wait_for_raw(&handle, 1, 1265.1).await;

    let err = handle.capture("90", Duration::from_secs(u64::MAX)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(CaptureError::InvalidDuration(_))));
    assert!(!handle.snapshot().averaging);

    let ack = handle.capture("90", Duration::ZERO).await.unwrap();
    assert!(matches!(ack, CaptureAck::Committed(_)));
    assert_eq!(store.entries().await.len(), 1);
}
