mod common;

use std::time::Duration;

use common::{
    MemoryLoyalty, engine_with_config, engine_with_db, engine_with_loyalty, profile, test_config,
};
use engine::{ApplyCmd, Currency, Engine, EngineError, EventStatus, Origin, ReprocessOutcome};

#[tokio::test]
async fn sync_reads_submits_and_verifies() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 100);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;

    let record = engine
        .sync_external_points("@Fan", 25, "wheel", "spin-1")
        .await
        .unwrap();

    assert_eq!(record.attempt, 1);
    assert!(record.success);
    assert!(record.verified);
    assert!(!record.requires_reprocessing);
    assert_eq!(record.balance_before, Some(100));
    assert_eq!(record.balance_after, Some(125));
    assert_eq!(loyalty.points("fan"), 125);

    // A verified operation is done: no second submit.
    let again = engine
        .sync_external_points("fan", 25, "wheel", "spin-1")
        .await
        .unwrap();
    assert_eq!(again.id, record.id);
    assert_eq!(loyalty.submits(), 1);
}

#[tokio::test]
async fn timed_out_sync_is_flagged_then_reprocessed() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 10);
    let mut config = test_config();
    config.sync.timeout_ms = 50;
    let (engine, _db) = engine_with_config(config, Some(loyalty.clone())).await;
    let user = profile(&engine, "fan").await;

    loyalty.delay_submits(Duration::from_millis(500));
    let (grant, mirror) = engine
        .apply_and_mirror(
            ApplyCmd::credit(user.id, Currency::Coins, 25, "spin-9", Origin::Wheel)
                .mirror_to("fan"),
        )
        .await
        .unwrap();
    // The local grant is committed regardless of the remote outcome.
    assert_eq!(grant.status, EventStatus::Confirmed);
    assert_eq!(engine.balance(user.id, Currency::Coins).await.unwrap(), 25);

    let failed = mirror.unwrap().await.unwrap().unwrap();
    assert!(!failed.success);
    assert!(failed.requires_reprocessing);
    assert!(!failed.verified);
    assert_eq!(loyalty.points("fan"), 10);

    loyalty.delay_submits(Duration::ZERO);
    let ReprocessOutcome::Sync(retried) = engine.reprocess(failed.id).await.unwrap() else {
        panic!("expected a sync outcome");
    };
    assert_eq!(retried.attempt, 2);
    assert!(retried.success);
    assert!(retried.verified);
    assert!(!retried.requires_reprocessing);
    assert_eq!(loyalty.points("fan"), 35);

    let attempts = engine
        .sync_attempts("fan", "wheel", &grant.event_id.to_string())
        .await
        .unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts[0].reprocessed_at.is_some());
    assert!(!attempts[0].requires_reprocessing);
}

#[tokio::test]
async fn interrupted_mirror_is_left_for_the_sweep() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 10);
    let mut config = test_config();
    config.sync.timeout_ms = 60_000;
    let (engine, _db) = engine_with_config(config, Some(loyalty.clone())).await;
    let user = profile(&engine, "fan").await;

    loyalty.delay_submits(Duration::from_secs(30));
    let (grant, mirror) = engine
        .apply_and_mirror(
            ApplyCmd::credit(user.id, Currency::Coins, 25, "spin-5", Origin::Wheel)
                .mirror_to("fan"),
        )
        .await
        .unwrap();
    let mirror = mirror.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    mirror.abort();
    assert!(mirror.await.unwrap_err().is_cancelled());
    assert_eq!(engine.balance(user.id, Currency::Coins).await.unwrap(), 25);
    assert_eq!(loyalty.points("fan"), 10);

    let reference = grant.event_id.to_string();
    let attempts = engine
        .sync_attempts("fan", "wheel", &reference)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].requires_reprocessing);
    assert!(!attempts[0].verified);
    assert_eq!(engine.scan_pending().await.unwrap().syncs.len(), 1);

    loyalty.delay_submits(Duration::ZERO);
    let report = engine.run_sweep().await.unwrap();
    assert_eq!(report.syncs_recovered, 1);
    assert_eq!(loyalty.points("fan"), 35);

    let latest = engine
        .sync_status("fan", "wheel", &reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.attempt, 2);
    assert!(latest.verified);
}

#[tokio::test]
async fn mirror_with_blank_handle_is_rejected_before_commit() {
    let (engine, _db) = engine_with_loyalty(MemoryLoyalty::new()).await;
    let user = profile(&engine, "fan").await;

    let err = engine
        .apply(
            ApplyCmd::credit(user.id, Currency::Coins, 5, "spin-6", Origin::Wheel)
                .mirror_to(" @ "),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(engine.event_by_key("spin-6").await.unwrap().is_none());
}

#[tokio::test]
async fn sweep_converges_failed_sync() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 0);
    loyalty.fail_submits(1);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;

    let first = engine
        .sync_external_points("fan", 40, "raffle", "r-1")
        .await
        .unwrap();
    assert!(!first.success);
    assert!(first.requires_reprocessing);

    let pending = engine.scan_pending().await.unwrap();
    assert_eq!(pending.syncs.len(), 1);

    let report = engine.run_sweep().await.unwrap();
    assert_eq!(report.syncs_scanned, 1);
    assert_eq!(report.syncs_recovered, 1);
    assert_eq!(loyalty.points("fan"), 40);

    let latest = engine
        .sync_status("fan", "raffle", "r-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.attempt, 2);
    assert!(latest.verified);
    assert!(engine.scan_pending().await.unwrap().syncs.is_empty());
}

#[tokio::test]
async fn landed_submit_is_not_sent_twice() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 5);
    loyalty.land_then_fail_submits(1);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;

    let first = engine
        .sync_external_points("fan", 20, "word_game", "wg-1")
        .await
        .unwrap();
    assert!(!first.success);
    assert_eq!(loyalty.points("fan"), 25);

    let second = engine
        .sync_external_points("fan", 20, "word_game", "wg-1")
        .await
        .unwrap();
    assert!(second.verified);
    assert_eq!(second.attempt, 2);
    assert_eq!(loyalty.submits(), 1);
    assert_eq!(loyalty.points("fan"), 25);
}

#[tokio::test]
async fn acknowledged_delta_is_only_reverified() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 50);
    // Both polls of the first attempt see the old balance.
    loyalty.stale_reads(2);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;

    let first = engine
        .sync_external_points("fan", 10, "admin", "adj-1")
        .await
        .unwrap();
    assert!(first.success);
    assert!(!first.verified);
    assert_eq!(first.verification_attempts, 2);
    assert!(!first.requires_reprocessing);

    let second = engine
        .sync_external_points("fan", 10, "admin", "adj-1")
        .await
        .unwrap();
    assert!(second.verified);
    assert_eq!(second.attempt, 2);
    assert_eq!(second.balance_before, Some(50));
    assert_eq!(loyalty.submits(), 1);
    assert_eq!(loyalty.points("fan"), 60);
}

#[tokio::test]
async fn verification_escalates_after_cap() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 50);
    loyalty.stale_reads(10);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;

    let first = engine
        .sync_external_points("fan", 10, "admin", "adj-2")
        .await
        .unwrap();
    assert!(!first.requires_reprocessing);

    // Cap is 4 cumulative unverified reads; polls are 2 per attempt.
    let second = engine
        .sync_external_points("fan", 10, "admin", "adj-2")
        .await
        .unwrap();
    assert_eq!(second.verification_attempts, 4);
    assert!(second.success);
    assert!(!second.verified);
    assert!(second.requires_reprocessing);
    assert_eq!(loyalty.submits(), 1);
}

#[tokio::test]
async fn failed_balance_read_flags_attempt() {
    let loyalty = MemoryLoyalty::new();
    loyalty.fail_reads(1);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;

    let record = engine
        .sync_external_points("fan", 5, "wheel", "s-1")
        .await
        .unwrap();
    assert!(!record.success);
    assert!(record.requires_reprocessing);
    assert_eq!(record.balance_before, None);
    assert_eq!(loyalty.submits(), 0);
}

#[tokio::test]
async fn sync_retries_stop_at_the_cap_until_reprocessed() {
    let loyalty = MemoryLoyalty::new();
    loyalty.fail_submits(10);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;
    engine
        .sync_external_points("fan", 5, "wheel", "s-2")
        .await
        .unwrap();

    // max_retries is 3: attempts 2 and 3 come from sweeps, attempt 4 exhausts.
    for _ in 0..3 {
        engine.run_sweep().await.unwrap();
    }
    let latest = engine.sync_status("fan", "wheel", "s-2").await.unwrap().unwrap();
    assert_eq!(latest.attempt, 4);
    assert!(latest.requires_reprocessing);
    assert!(engine.scan_pending().await.unwrap().syncs.is_empty());

    // An operator can still push it through.
    loyalty.fail_submits(0);
    let ReprocessOutcome::Sync(done) = engine.reprocess(latest.id).await.unwrap() else {
        panic!("expected a sync outcome");
    };
    assert!(done.verified);
    assert_eq!(done.attempt, 5);
}

#[tokio::test]
async fn sweep_without_client_leaves_syncs_alone() {
    let loyalty = MemoryLoyalty::new();
    loyalty.fail_submits(1);
    let (engine, db) = engine_with_loyalty(loyalty).await;
    engine
        .sync_external_points("fan", 5, "wheel", "s-4")
        .await
        .unwrap();

    let offline = Engine::builder()
        .database(db)
        .config(test_config())
        .build()
        .await
        .unwrap();
    let report = offline.run_sweep().await.unwrap();
    assert_eq!(report.syncs_scanned, 1);
    assert_eq!(report.syncs_skipped, 1);
    assert_eq!(report.syncs_recovered, 0);

    let latest = offline.sync_status("fan", "wheel", "s-4").await.unwrap().unwrap();
    assert_eq!(latest.attempt, 1);
}

#[tokio::test]
async fn sync_requires_a_client() {
    let (engine, _db) = engine_with_db().await;
    let err = engine
        .sync_external_points("fan", 5, "wheel", "s-3")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExternalSyncFailure(_)));
}

#[tokio::test]
async fn reprocess_of_unknown_id_is_not_found() {
    let (engine, _db) = engine_with_db().await;
    let err = engine.reprocess(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EngineError::KeyNotFound(_)));
}

#[tokio::test]
async fn reprocess_of_confirmed_event_changes_nothing() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;
    let grant = engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 8, "g", Origin::Admin))
        .await
        .unwrap();

    for _ in 0..3 {
        let ReprocessOutcome::Ledger(outcome) = engine.reprocess(grant.event_id).await.unwrap()
        else {
            panic!("expected a ledger outcome");
        };
        assert!(outcome.replayed);
    }
    assert_eq!(engine.balance(user.id, Currency::Coins).await.unwrap(), 8);
}
