//! Pipeline-level scenarios: quota accounting, fallback and cleanup.

use super::harness::{scan_request, ScriptedBackend, TestHarness};
use chrono::{TimeZone, Utc};
use foodsense::auth::AuthError;
use foodsense::quota::{QuotaError, Tier};
use foodsense::scans::ScanRepository;
use foodsense::storage::{ArtifactStore, StorageRef};
use foodsense::{Error, ScanEvent, ScanRequest};
use std::sync::Arc;

/// N reservations count to N, and the limit+1th is rejected.
#[tokio::test]
async fn test_guest_limit_is_enforced() {
    let harness = TestHarness::setup().unwrap();
    let pipeline = harness.pipeline();
    let token = harness.anonymous_token("guest-a").unwrap();

    for expected in 1..=10 {
        let outcome = pipeline.run(scan_request(&token)).await.unwrap();
        assert_eq!(outcome.usage_count, expected);
    }

    let err = pipeline.run(scan_request(&token)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Quota(QuotaError::Exceeded {
            tier: Tier::Guest,
            limit: 10,
            used: 10
        })
    ));
    assert_eq!(harness.usage_count("guest-a").await, 10);
    assert_eq!(harness.store.write_count(), 10);
}

/// A subject exhausted in one month starts over at 1 the next month.
#[tokio::test]
async fn test_new_month_resets_usage() {
    let harness = TestHarness::setup().unwrap();
    let pipeline = harness.pipeline();
    harness.seed_usage("free-a", Tier::Free, 25);
    let token = harness.user_token("free-a", "a@example.com").unwrap();

    assert!(pipeline.run(scan_request(&token)).await.is_err());

    harness.set_time(Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 5).unwrap());
    let outcome = pipeline.run(scan_request(&token)).await.unwrap();
    assert_eq!(outcome.usage_count, 1);
}

/// limit + 5 concurrent requests from one subject: exactly limit succeed.
#[tokio::test]
async fn test_concurrent_requests_never_oversell() {
    let harness = TestHarness::setup().unwrap();
    let pipeline = Arc::new(harness.pipeline());
    let token = harness.anonymous_token("guest-busy").unwrap();

    let handles: Vec<_> = (0..15)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            let request = scan_request(&token);
            tokio::spawn(async move { pipeline.run(request).await })
        })
        .collect();

    let mut succeeded = 0;
    let mut exceeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(Error::Quota(QuotaError::Exceeded { .. })) => exceeded += 1,
            Err(other) => unreachable!("unexpected error: {other}"),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(exceeded, 5);
    assert_eq!(harness.usage_count("guest-busy").await, 10);
    assert_eq!(harness.scans.len(), 10);
}

/// Different subjects do not share a counter.
#[tokio::test]
async fn test_subjects_are_independent() {
    let harness = TestHarness::setup().unwrap();
    let pipeline = harness.pipeline();
    harness.seed_usage("full", Tier::Guest, 10);

    let full = harness.anonymous_token("full").unwrap();
    let fresh = harness.anonymous_token("fresh").unwrap();
    assert!(pipeline.run(scan_request(&full)).await.is_err());
    assert!(pipeline.run(scan_request(&fresh)).await.is_ok());
}

/// A guest that signs in with the same id moves to the free allowance.
#[tokio::test]
async fn test_signed_in_guest_gets_free_tier() {
    let harness = TestHarness::setup().unwrap();
    let pipeline = harness.pipeline();
    let anonymous = harness.anonymous_token("linked").unwrap();
    let signed_in = harness.user_token("linked", "l@example.com").unwrap();

    pipeline.run(scan_request(&anonymous)).await.unwrap();
    for expected in 2..=25 {
        let outcome = pipeline.run(scan_request(&signed_in)).await.unwrap();
        assert_eq!(outcome.usage_count, expected);
    }

    let err = pipeline.run(scan_request(&signed_in)).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Quota Exceeded for Free Tier. Limit: 25, Used: 25"
    );
}

/// Paid subjects are never throttled.
#[tokio::test]
async fn test_paid_tier_is_unbounded() {
    let harness = TestHarness::setup().unwrap();
    let pipeline = harness.pipeline();
    harness.seed_usage("payer", Tier::Paid, 500);
    let token = harness.user_token("payer", "p@example.com").unwrap();

    let outcome = pipeline.run(scan_request(&token)).await.unwrap();
    assert_eq!(outcome.usage_count, 501);
}

/// [A fail, B fail, C ok] reports C; the aggregate error never surfaces.
#[tokio::test]
async fn test_fallback_reaches_third_backend() {
    let harness = TestHarness::setup_with_backends(vec![
        ScriptedBackend::failing("model-a", "quota exhausted"),
        ScriptedBackend::failing("model-b", "unsupported media"),
        ScriptedBackend::working("model-c", "Grilled salmon with rice."),
    ])
    .unwrap();
    let (pipeline, mut events) = harness.pipeline_with_events();
    let token = harness.user_token("u-fallback", "f@example.com").unwrap();

    let outcome = pipeline.run(scan_request(&token)).await.unwrap();
    assert_eq!(outcome.backend, "model-c");
    assert_eq!(outcome.analysis, "Grilled salmon with rice.");

    let record = harness.scans.get(&outcome.scan_id).await.unwrap().unwrap();
    assert_eq!(record.backend_used, "model-c");
    assert!(record.storage_reference.as_str().starts_with("userdata/u-fallback/scans/"));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(ScanEvent::Authenticated { anonymous: false, .. })));
    assert!(seen.contains(&ScanEvent::InferenceSucceeded {
        backend: "model-c".to_string()
    }));
    assert!(matches!(seen.last(), Some(ScanEvent::ScanRecorded { .. })));
}

/// A working first backend means later ones are never called.
#[tokio::test]
async fn test_first_success_short_circuits() {
    let harness = TestHarness::setup_with_backends(vec![
        ScriptedBackend::working("primary", "Toast."),
        ScriptedBackend::working("secondary", "unused"),
    ])
    .unwrap();
    let token = harness.anonymous_token("g-short").unwrap();

    harness.pipeline().run(scan_request(&token)).await.unwrap();
    assert_eq!(harness.backends[0].calls(), 1);
    assert_eq!(harness.backends[1].calls(), 0);
}

/// All backends failing deletes the artifact and keeps the quota charge.
#[tokio::test]
async fn test_total_inference_failure_cleans_up() {
    let harness = TestHarness::setup_with_backends(vec![ScriptedBackend::failing(
        "only-model",
        "model not found",
    )])
    .unwrap();
    let token = harness.anonymous_token("g-fail").unwrap();

    let err = harness.pipeline().run(scan_request(&token)).await.unwrap_err();
    match err {
        Error::Inference(inference) => assert_eq!(
            inference.messages(),
            ["only-model: provider error 500: model not found".to_string()]
        ),
        other => unreachable!("unexpected error: {other}"),
    }

    assert_eq!(harness.store.write_count(), 1);
    assert!(harness.store.is_empty());
    assert_eq!(harness.usage_count("g-fail").await, 1);
    assert!(harness.scans.is_empty());
}

/// A failed scan record write leaves the artifact in place.
#[tokio::test]
async fn test_record_failure_keeps_artifact() {
    let harness = TestHarness::setup().unwrap();
    harness.scans.fail_writes(true);
    let token = harness.anonymous_token("g-record").unwrap();

    let err = harness.pipeline().run(scan_request(&token)).await.unwrap_err();
    assert!(matches!(err, Error::Persistence(_)));
    assert_eq!(harness.store.len(), 1);
    assert_eq!(harness.store.delete_count(), 0);
    assert_eq!(harness.usage_count("g-record").await, 1);
}

/// Storage write failures abort before inference.
#[tokio::test]
async fn test_store_failure_skips_inference() {
    let harness = TestHarness::setup().unwrap();
    harness.store.fail_writes(true);
    let token = harness.anonymous_token("g-store").unwrap();

    let err = harness.pipeline().run(scan_request(&token)).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert_eq!(harness.backends[0].calls(), 0);
    assert_eq!(harness.usage_count("g-store").await, 1);
}

/// Auth failures happen before any quota or storage work.
#[tokio::test]
async fn test_auth_failures_short_circuit() {
    let harness = TestHarness::setup().unwrap();
    let pipeline = harness.pipeline();

    let err = pipeline
        .run(ScanRequest {
            credential: None,
            upload: Some(super::harness::jpeg_upload("a.jpg")),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth(AuthError::MissingCredential)));

    let err = pipeline.run(scan_request("not.a.token")).await.unwrap_err();
    assert!(matches!(err, Error::Auth(AuthError::InvalidCredential(_))));

    let blank = harness.anonymous_token("   ").unwrap();
    let err = pipeline.run(scan_request(&blank)).await.unwrap_err();
    assert!(matches!(err, Error::Auth(AuthError::MissingSubject)));

    assert_eq!(harness.store.write_count(), 0);
    assert_eq!(harness.backends[0].calls(), 0);
}

/// Deleting the same artifact twice is not an error.
#[tokio::test]
async fn test_artifact_delete_is_idempotent() {
    let harness = TestHarness::setup().unwrap();
    let token = harness.anonymous_token("g-del").unwrap();
    let outcome = harness.pipeline().run(scan_request(&token)).await.unwrap();

    let reference: StorageRef = outcome.storage_reference;
    harness.store.delete(&reference).await.unwrap();
    harness.store.delete(&reference).await.unwrap();
    assert!(!harness.store.exists(&reference).await.unwrap());
}
