mod common;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use common::{
    MemoryLoyalty, engine_with_config, engine_with_db, engine_with_loyalty, profile, test_config,
};
use engine::{Currency, Engine, EngineError, Origin};

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, day, hour, 0, 0).unwrap()
}

async fn claim_days(engine: &Engine, user: Uuid, days: std::ops::RangeInclusive<u32>) {
    for day in days {
        let claim = engine.claim_streak(user, at(day, 9)).await.unwrap();
        assert!(!claim.already_claimed_today);
    }
}

#[tokio::test]
async fn second_claim_on_same_day_pays_nothing() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;

    let first = engine.claim_streak(user.id, at(1, 8)).await.unwrap();
    assert_eq!(first.day_count, 1);
    assert_eq!(first.reward.map(|r| r.amount), Some(10));

    let second = engine.claim_streak(user.id, at(1, 22)).await.unwrap();
    assert!(second.already_claimed_today);
    assert_eq!(second.day_count, 1);
    assert_eq!(second.reward, None);
    assert_eq!(engine.balance(user.id, Currency::Coins).await.unwrap(), 10);

    let status = engine.streak_status(user.id, at(1, 23)).await.unwrap();
    assert!(!status.claimable_today);
    assert_eq!(status.record.total_claims, 1);
}

#[tokio::test]
async fn reward_is_a_ledger_credit_keyed_by_day() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;

    let claim = engine.claim_streak(user.id, at(3, 12)).await.unwrap();
    let event = engine
        .event_by_key(&format!("daily:{}:2026-06-03", user.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Some(event.id), claim.event_id);
    assert_eq!(event.origin, Origin::DailyReward);
    assert_eq!(event.delta, 10);
}

#[tokio::test]
async fn consecutive_days_count_up_and_gaps_reset() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;

    claim_days(&engine, user.id, 1..=5).await;
    // Day 5 pays the bonus: 4 x 10 + 50.
    assert_eq!(engine.balance(user.id, Currency::Coins).await.unwrap(), 90);

    let after_gap = engine.claim_streak(user.id, at(8, 9)).await.unwrap();
    assert_eq!(after_gap.day_count, 1);

    let status = engine.streak_status(user.id, at(8, 10)).await.unwrap();
    assert_eq!(status.record.longest_day_count, 5);
    assert_eq!(status.record.total_claims, 6);
}

#[tokio::test]
async fn day_boundary_follows_configured_timezone() {
    let mut config = test_config();
    config.streak.timezone = chrono_tz::America::New_York;
    let (engine, _db) = engine_with_config(config, None).await;
    let user = profile(&engine, "fan").await;

    // 02:00 UTC on June 2 is still June 1 in New York.
    let late = engine.claim_streak(user.id, at(2, 2)).await.unwrap();
    assert_eq!(late.claim_date, NaiveDate::from_ymd_opt(2026, 6, 1).unwrap());

    let next = engine.claim_streak(user.id, at(2, 15)).await.unwrap();
    assert_eq!(next.day_count, 2);
}

#[tokio::test]
async fn lapsed_streak_is_restored_for_points() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 1_000);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;
    let user = profile(&engine, "fan").await;
    claim_days(&engine, user.id, 1..=10).await;

    // Last claim on June 10, today is June 14: three missed days.
    let status = engine.streak_status(user.id, at(14, 9)).await.unwrap();
    let quote = status.restoration.unwrap();
    assert_eq!(quote.missed_days, 3);
    assert_eq!(quote.total_cost, 600);
    assert_eq!(quote.prior_day_count, 10);

    let receipt = engine
        .restore_streak(user.id, 3, 600, at(14, 9))
        .await
        .unwrap();
    assert!(receipt.payment.verified);
    assert_eq!(receipt.payment.balance_after, Some(400));
    assert_eq!(loyalty.points("fan"), 400);
    assert!(receipt.record.restored_at.is_some());

    let resumed = engine.claim_streak(user.id, at(14, 10)).await.unwrap();
    assert_eq!(resumed.day_count, 11);

    // Nothing left to restore.
    let again = engine.restore_streak(user.id, 3, 600, at(14, 11)).await;
    assert!(matches!(again, Err(EngineError::RestorationUnavailable(_))));
}

#[tokio::test]
async fn rejected_restoration_debit_keeps_the_streak_lapsed() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 1_000);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;
    let user = profile(&engine, "fan").await;
    claim_days(&engine, user.id, 1..=10).await;

    loyalty.fail_submits(1);
    let err = engine
        .restore_streak(user.id, 3, 600, at(14, 9))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExternalSyncFailure(_)));
    assert_eq!(loyalty.points("fan"), 1_000);

    // The unpaid debit is not left for the sweep to charge later.
    let reference = format!("restore:{}:2026-06-10", user.id);
    let attempts = engine
        .sync_attempts("fan", "streak_restore", &reference)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(!attempts[0].requires_reprocessing);
    assert!(attempts[0].reprocessed_at.is_some());
    let report = engine.run_sweep().await.unwrap();
    assert_eq!(report.syncs_scanned, 0);
    assert_eq!(loyalty.points("fan"), 1_000);

    let claim = engine.claim_streak(user.id, at(14, 10)).await.unwrap();
    assert_eq!(claim.day_count, 1);
}

#[tokio::test]
async fn restoration_debit_that_landed_with_an_error_is_refunded() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 1_000);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;
    let user = profile(&engine, "fan").await;
    claim_days(&engine, user.id, 1..=10).await;

    loyalty.land_then_fail_submits(1);
    let err = engine
        .restore_streak(user.id, 3, 600, at(14, 9))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExternalSyncFailure(_)));
    assert_eq!(loyalty.submits(), 2);
    assert_eq!(loyalty.points("fan"), 1_000);

    let status = engine.streak_status(user.id, at(14, 9)).await.unwrap();
    assert!(status.record.restored_at.is_none());
    assert_eq!(status.restoration.map(|q| q.missed_days), Some(3));
}

#[tokio::test]
async fn restore_rejects_a_stale_quote() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 1_000);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;
    let user = profile(&engine, "fan").await;
    claim_days(&engine, user.id, 1..=3).await;

    let err = engine
        .restore_streak(user.id, 2, 400, at(7, 9))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(loyalty.submits(), 0);
}

#[tokio::test]
async fn restore_requires_enough_live_points() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 100);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;
    let user = profile(&engine, "fan").await;
    claim_days(&engine, user.id, 1..=3).await;

    let err = engine
        .restore_streak(user.id, 2, 400, at(6, 9))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance(_)));
    assert_eq!(loyalty.points("fan"), 100);

    let status = engine.streak_status(user.id, at(6, 9)).await.unwrap();
    assert_eq!(status.record.current_day_count, 3);
    assert!(status.record.restored_at.is_none());
}

#[tokio::test]
async fn restore_fails_when_balance_cannot_be_read() {
    let loyalty = MemoryLoyalty::new();
    loyalty.set_points("fan", 1_000);
    loyalty.fail_reads(1);
    let (engine, _db) = engine_with_loyalty(loyalty.clone()).await;
    let user = profile(&engine, "fan").await;
    claim_days(&engine, user.id, 1..=3).await;

    let err = engine
        .restore_streak(user.id, 2, 400, at(6, 9))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BalanceUnavailable(_)));
    assert_eq!(loyalty.submits(), 0);

    let (offline, _db) = engine_with_db().await;
    let user = profile(&offline, "fan").await;
    claim_days(&offline, user.id, 1..=3).await;
    let err = offline
        .restore_streak(user.id, 2, 400, at(6, 9))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BalanceUnavailable(_)));
}

#[tokio::test]
async fn restore_can_be_switched_off() {
    let mut config = test_config();
    config.streak.restoration_enabled = false;
    let (engine, _db) = engine_with_config(config, Some(MemoryLoyalty::new())).await;
    let user = profile(&engine, "fan").await;
    claim_days(&engine, user.id, 1..=3).await;

    let status = engine.streak_status(user.id, at(6, 9)).await.unwrap();
    assert!(status.restoration.is_none());
    let err = engine
        .restore_streak(user.id, 2, 400, at(6, 9))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RestorationUnavailable(_)));
}

#[tokio::test]
async fn claim_on_retired_profile_is_rejected() {
    let (engine, _db) = engine_with_db().await;
    let keeper = profile(&engine, "keeper").await;
    let dup = profile(&engine, "dup").await;
    engine.merge_profiles(keeper.id, dup.id, false).await.unwrap();

    let err = engine.claim_streak(dup.id, at(1, 9)).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}
