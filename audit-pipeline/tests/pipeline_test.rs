//! Integration tests for the audit pipeline: ordering, listeners and the
//! segment store.

use audit_pipeline::{
    AuditCategory, AuditEvent, AuditFilter, AuditOutcome, AuditPipeline, AuditStore,
    MemoryAuditStore, PipelineOptions, SegmentAuditStore, StoreError,
};
use custodian_core::utils::{MasterKey, Sealer};
use custodian_core::Details;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn log_simple(pipeline: &AuditPipeline, user: &str) -> u64 {
    pipeline.log(
        AuditCategory::Authentication,
        "login",
        user,
        AuditOutcome::Success,
        Some("10.0.0.1"),
        None,
    )
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_three_concurrent_emitters_produce_gapless_ordered_trail() {
    let pipeline = AuditPipeline::in_memory();

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let pipeline = pipeline.clone();
            thread::spawn(move || log_simple(&pipeline, &format!("user-{}", i)))
        })
        .collect();
    let returned: HashSet<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let events: Vec<AuditEvent> = pipeline.query_events(AuditFilter::new()).collect();
    let ids: Vec<u64> = events.iter().map(|e| e.sequence_id).collect();

    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(returned, ids.iter().copied().collect());
}

#[test]
fn test_ids_strictly_increase_per_emitter_under_contention() {
    let pipeline = AuditPipeline::in_memory();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                let user = format!("user-{}", i);
                (0..50).map(|_| log_simple(&pipeline, &user)).collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        let ids = handle.join().unwrap();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        all.extend(ids);
    }

    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 400);

    let persisted: Vec<u64> = pipeline
        .query_events(AuditFilter::new())
        .map(|e| e.sequence_id)
        .collect();
    assert_eq!(persisted, all);
}

// ============================================================================
// Listeners
// ============================================================================

#[test]
fn test_listener_sees_matching_events_after_persistence() {
    let store = Arc::new(MemoryAuditStore::new());
    let pipeline = AuditPipeline::new(store.clone(), PipelineOptions::default()).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = seen.clone();
    let observed_store = store.clone();
    pipeline.register_listener(
        |e| e.outcome == AuditOutcome::Denied,
        move |e| {
            // Already durable when the callback runs.
            assert!(observed_store.last_sequence().unwrap() >= e.sequence_id);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    );

    pipeline.log(AuditCategory::Authorization, "check", "u1", AuditOutcome::Denied, None, None);
    pipeline.log(AuditCategory::Authorization, "check", "u1", AuditOutcome::Success, None, None);
    pipeline.log(AuditCategory::Authorization, "check", "u2", AuditOutcome::Denied, None, None);
    pipeline.drain_listeners();

    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn test_failing_listener_is_logged_as_system_event_once() {
    let pipeline = AuditPipeline::in_memory();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    pipeline.register_listener(
        |_| true,
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("sink offline")
        },
    );

    pipeline.log(AuditCategory::DataAccess, "read", "u1", AuditOutcome::Success, None, None);
    pipeline.drain_listeners();

    // The failure event itself is never dispatched, so no feedback loop.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let failures: Vec<AuditEvent> = pipeline
        .query_events(AuditFilter::new().category(AuditCategory::System))
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].action, "listener_failed");
    assert_eq!(failures[0].outcome, AuditOutcome::Failure);
    assert_eq!(
        failures[0].details.get("error").and_then(|v| v.as_text()),
        Some("sink offline")
    );
}

#[test]
fn test_panicking_listener_does_not_block_ingestion() {
    let pipeline = AuditPipeline::in_memory();
    let id = pipeline.register_listener(|_| true, |_| panic!("listener bug"));

    let first = log_simple(&pipeline, "u1");
    pipeline.drain_listeners();
    assert!(pipeline.unregister_listener(id));
    let second = log_simple(&pipeline, "u2");

    assert!(second > first);
    let system = pipeline
        .query_events(AuditFilter::new().category(AuditCategory::System))
        .count();
    assert_eq!(system, 1);
}

// ============================================================================
// Segment store
// ============================================================================

#[test]
fn test_segment_trail_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let key = MasterKey::from_bytes([9u8; 32]);

    {
        let store = SegmentAuditStore::open(dir.path(), 4, Some(Sealer::new(&key))).unwrap();
        let pipeline = AuditPipeline::new(Arc::new(store), PipelineOptions::default()).unwrap();
        for i in 0..10 {
            pipeline.log(
                AuditCategory::Compliance,
                "consent_recorded",
                "admin",
                AuditOutcome::Success,
                None,
                Some(Details::new().with("subject", format!("u{}", i))),
            );
        }
        pipeline.shutdown();
    }

    let store = SegmentAuditStore::open(dir.path(), 4, Some(Sealer::new(&key))).unwrap();
    let segments = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".log"))
        .count();
    assert_eq!(segments, 3);
    let pipeline = AuditPipeline::new(Arc::new(store), PipelineOptions::default()).unwrap();

    let next = log_simple(&pipeline, "u1");
    assert_eq!(next, 11);

    let about_u3: Vec<AuditEvent> = pipeline
        .query_events(AuditFilter::new().mentioning("u3"))
        .collect();
    assert_eq!(about_u3.len(), 1);
    assert_eq!(about_u3[0].sequence_id, 4);
}

#[test]
fn test_sealed_trail_refuses_wrong_key_and_keeps_ids_unique() {
    let dir = tempfile::tempdir().unwrap();
    let key = MasterKey::from_bytes([9u8; 32]);

    {
        let store = SegmentAuditStore::open(dir.path(), 4, Some(Sealer::new(&key))).unwrap();
        let pipeline = AuditPipeline::new(Arc::new(store), PipelineOptions::default()).unwrap();
        for user in ["u1", "u2", "u3"] {
            log_simple(&pipeline, user);
        }
        pipeline.shutdown();
    }

    let wrong = Sealer::new(&MasterKey::from_bytes([8u8; 32]));
    assert!(matches!(
        SegmentAuditStore::open(dir.path(), 4, Some(wrong)),
        Err(StoreError::Corrupt(_))
    ));
    assert!(SegmentAuditStore::open(dir.path(), 4, None).is_err());

    let store = SegmentAuditStore::open(dir.path(), 4, Some(Sealer::new(&key))).unwrap();
    let pipeline = AuditPipeline::new(Arc::new(store), PipelineOptions::default()).unwrap();
    assert_eq!(log_simple(&pipeline, "u4"), 4);

    let ids: Vec<u64> = pipeline
        .query_events(AuditFilter::new())
        .map(|e| e.sequence_id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
}
