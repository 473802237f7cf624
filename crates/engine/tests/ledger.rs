mod common;

use sea_orm::{ConnectionTrait, Statement};

use common::{engine_with_db, profile};
use engine::{ApplyCmd, Currency, EngineError, EventStatus, Origin};

#[tokio::test]
async fn concurrent_replays_of_one_key_apply_once() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;

    let cmd = ApplyCmd::credit(user.id, Currency::Coins, 25, "k1", Origin::Wheel);
    let (a, b) = tokio::join!(engine.apply(cmd.clone()), engine.apply(cmd));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.event_id, b.event_id);
    assert!(a.replayed != b.replayed);
    assert_eq!(engine.balance(user.id, Currency::Coins).await.unwrap(), 25);
    assert_eq!(
        engine
            .events_for_user(user.id, Some(Currency::Coins))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn replay_returns_stored_result_even_with_other_payload() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;

    let first = engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 10, "spin-1", Origin::Wheel))
        .await
        .unwrap();
    engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 5, "spin-2", Origin::Wheel))
        .await
        .unwrap();
    let replay = engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 999, "spin-1", Origin::Wheel))
        .await
        .unwrap();

    assert!(replay.replayed);
    assert_eq!(replay.event_id, first.event_id);
    assert_eq!(replay.new_balance, 10);
    assert_eq!(engine.balance(user.id, Currency::Coins).await.unwrap(), 15);
}

#[tokio::test]
async fn over_debit_is_rejected_and_recorded_failed() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;
    engine
        .apply(ApplyCmd::credit(user.id, Currency::Tickets, 30, "raffle-win", Origin::Raffle))
        .await
        .unwrap();

    let err = engine
        .apply(ApplyCmd::debit(user.id, Currency::Tickets, 100, "raffle-entry", Origin::Raffle))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance(_)));
    assert_eq!(engine.balance(user.id, Currency::Tickets).await.unwrap(), 30);

    let failed = engine.event_by_key("raffle-entry").await.unwrap().unwrap();
    assert_eq!(failed.status, EventStatus::Failed);
    assert_eq!(failed.delta, -100);
    assert!(failed.error_message.is_some());
}

#[tokio::test]
async fn failed_key_is_reattempted_in_place() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;
    let debit = ApplyCmd::debit(user.id, Currency::Coins, 40, "shop-1", Origin::WordGame);

    assert!(engine.apply(debit.clone()).await.is_err());
    engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 50, "grant", Origin::Admin))
        .await
        .unwrap();

    let outcome = engine.apply(debit).await.unwrap();
    assert_eq!(outcome.status, EventStatus::Confirmed);
    assert_eq!(outcome.new_balance, 10);

    let event = engine.event_by_key("shop-1").await.unwrap().unwrap();
    assert_eq!(event.id, outcome.event_id);
    assert_eq!(event.retries, 1);
    assert_eq!(event.status, EventStatus::Confirmed);
}

#[tokio::test]
async fn balance_never_goes_negative_under_concurrent_debits() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;
    engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 100, "seed", Origin::Admin))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .apply(ApplyCmd::debit(
                    user.id,
                    Currency::Coins,
                    30,
                    format!("spend-{i}"),
                    Origin::WordGame,
                ))
                .await
        }));
    }
    let mut confirmed = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            confirmed += 1;
        }
    }

    assert_eq!(confirmed, 3);
    assert_eq!(engine.balance(user.id, Currency::Coins).await.unwrap(), 10);
}

#[tokio::test]
async fn invalid_commands_are_never_persisted() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;

    let zero = engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 0, "zero", Origin::Wheel))
        .await;
    assert!(matches!(zero, Err(EngineError::Validation(_))));

    let blank = engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 5, "  ", Origin::Wheel))
        .await;
    assert!(matches!(blank, Err(EngineError::Validation(_))));

    let reserved = engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 5, "c", Origin::Consolidation))
        .await;
    assert!(matches!(reserved, Err(EngineError::Validation(_))));

    let unknown = engine
        .apply(ApplyCmd::credit(uuid::Uuid::new_v4(), Currency::Coins, 5, "ghost", Origin::Wheel))
        .await;
    assert!(matches!(unknown, Err(EngineError::KeyNotFound(_))));

    assert!(engine.event_by_key("zero").await.unwrap().is_none());
    assert!(engine.event_by_key("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn enqueued_event_settles_on_sweep() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;

    let pending = engine
        .enqueue(ApplyCmd::credit(user.id, Currency::Tickets, 3, "raffle-7", Origin::Raffle))
        .await
        .unwrap();
    assert_eq!(pending.status, EventStatus::Pending);
    assert_eq!(engine.balance(user.id, Currency::Tickets).await.unwrap(), 0);

    let report = engine.run_sweep().await.unwrap();
    assert_eq!(report.events_scanned, 1);
    assert_eq!(report.events_recovered, 1);
    assert_eq!(engine.balance(user.id, Currency::Tickets).await.unwrap(), 3);

    let settled = engine.event(pending.id).await.unwrap();
    assert_eq!(settled.status, EventStatus::Confirmed);
    assert_eq!(settled.retries, 1);
    assert!(engine.scan_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn reversal_is_audited_and_single() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;
    let grant = engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 40, "oops", Origin::Wheel))
        .await
        .unwrap();

    let reversal = engine
        .reverse(grant.event_id, "oops-undo", Some("double spin"))
        .await
        .unwrap();
    assert_eq!(reversal.new_balance, 0);

    let event = engine.event(reversal.event_id).await.unwrap();
    assert_eq!(event.origin, Origin::Admin);
    assert_eq!(event.delta, -40);
    assert_eq!(event.reference_id, Some(grant.event_id.to_string()));

    let again = engine.reverse(grant.event_id, "oops-undo-2", None).await;
    assert!(matches!(again, Err(EngineError::Validation(_))));
    // Same key is a replay, not a second reversal.
    let replay = engine.reverse(grant.event_id, "oops-undo", None).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(engine.balance(user.id, Currency::Coins).await.unwrap(), 0);
}

#[tokio::test]
async fn failed_reversal_blocks_a_second_one_and_settles_once() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;
    let grant = engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 40, "grant", Origin::Wheel))
        .await
        .unwrap();
    engine
        .apply(ApplyCmd::debit(user.id, Currency::Coins, 40, "spend", Origin::WordGame))
        .await
        .unwrap();

    let first = engine.reverse(grant.event_id, "undo-1", None).await;
    assert!(matches!(first, Err(EngineError::InsufficientBalance(_))));
    let second = engine.reverse(grant.event_id, "undo-2", None).await;
    assert!(matches!(second, Err(EngineError::Validation(_))));
    assert!(engine.event_by_key("undo-2").await.unwrap().is_none());

    engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 100, "top-up", Origin::Admin))
        .await
        .unwrap();
    let report = engine.run_sweep().await.unwrap();
    assert_eq!(report.events_recovered, 1);
    assert_eq!(engine.balance(user.id, Currency::Coins).await.unwrap(), 60);

    let undo = engine.event_by_key("undo-1").await.unwrap().unwrap();
    assert_eq!(undo.status, EventStatus::Confirmed);
    assert_eq!(undo.delta, -40);
}

#[tokio::test]
async fn debit_of_unnegatable_amount_is_rejected() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;

    let cmd = ApplyCmd::debit(user.id, Currency::Coins, i64::MIN, "huge", Origin::WordGame);
    assert_eq!(cmd.delta, 0);
    let result = engine.apply(cmd).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
    assert!(engine.event_by_key("huge").await.unwrap().is_none());
}

#[tokio::test]
async fn recompute_detects_and_repairs_drift() {
    let (engine, db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;
    engine
        .apply(ApplyCmd::credit(user.id, Currency::Coins, 70, "a", Origin::Wheel))
        .await
        .unwrap();
    engine
        .apply(ApplyCmd::debit(user.id, Currency::Coins, 20, "b", Origin::WordGame))
        .await
        .unwrap();

    let checks = engine.recompute_balances(user.id, false).await.unwrap();
    assert!(checks.iter().all(|c| !c.drifted()));

    db.execute(Statement::from_sql_and_values(
        db.get_database_backend(),
        "UPDATE accounts SET balance = 999 WHERE user_id = ? AND currency = ?",
        vec![user.id.to_string().into(), "coins".into()],
    ))
    .await
    .unwrap();

    let checks = engine.recompute_balances(user.id, true).await.unwrap();
    let coins = checks
        .iter()
        .find(|c| c.currency == Currency::Coins)
        .unwrap();
    assert_eq!((coins.stored, coins.from_events), (999, 50));
    assert_eq!(engine.balance(user.id, Currency::Coins).await.unwrap(), 50);
}

#[tokio::test]
async fn balances_cover_every_currency() {
    let (engine, _db) = engine_with_db().await;
    let user = profile(&engine, "fan").await;
    engine
        .apply(ApplyCmd::credit(user.id, Currency::Tickets, 2, "t", Origin::Raffle))
        .await
        .unwrap();

    let balances = engine.balances(user.id).await.unwrap();
    assert_eq!(balances.get(&Currency::Coins), Some(&0));
    assert_eq!(balances.get(&Currency::Tickets), Some(&2));
}
