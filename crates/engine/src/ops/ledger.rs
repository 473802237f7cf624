use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveValue, ConnectionTrait, DatabaseTransaction, QueryFilter, QueryOrder, QuerySelect,
    Statement, TransactionTrait, prelude::*,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    ApplyCmd, Currency, EngineError, EventStatus, ExternalSyncRecord, LedgerEvent, LoyaltyClient,
    Origin, ResultEngine, accounts, ledger_events,
    locks::{account_key, sync_key},
    util::{normalize_handle, normalize_optional_text},
};

use super::{Engine, sync::SyncStart, with_tx};

/// Result of applying (or replaying) an idempotency key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub event_id: Uuid,
    pub status: EventStatus,
    /// Account balance after the event. Unchanged for a failed event.
    pub new_balance: i64,
    /// True when the key was already settled and nothing was applied now.
    pub replayed: bool,
    pub error_message: Option<String>,
}

impl ApplyOutcome {
    fn from_event(event: &LedgerEvent, new_balance: i64, replayed: bool) -> Self {
        Self {
            event_id: event.id,
            status: event.status,
            new_balance,
            replayed,
            error_message: event.error_message.clone(),
        }
    }

    /// Maps a failed outcome to the error the caller of `apply` sees.
    fn into_result(self) -> ResultEngine<Self> {
        match self.status {
            EventStatus::Failed => Err(EngineError::InsufficientBalance(
                self.error_message
                    .unwrap_or_else(|| "balance cannot cover debit".to_string()),
            )),
            _ => Ok(self),
        }
    }
}

/// Stored vs. replayed balance of one account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BalanceCheck {
    pub currency: Currency,
    pub stored: i64,
    pub from_events: i64,
}

impl BalanceCheck {
    pub fn drifted(&self) -> bool {
        self.stored != self.from_events
    }
}

fn validate_apply(cmd: &ApplyCmd) -> ResultEngine<()> {
    if cmd.user_id.is_nil() {
        return Err(EngineError::Validation("user id must not be nil".to_string()));
    }
    if cmd.delta == 0 {
        return Err(EngineError::Validation("delta must not be 0".to_string()));
    }
    if cmd.idempotency_key.trim().is_empty() {
        return Err(EngineError::Validation(
            "idempotency key must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn reject_reserved_origin(origin: Origin) -> ResultEngine<()> {
    if origin == Origin::Consolidation {
        return Err(EngineError::Validation(
            "consolidation events are written by merges only".to_string(),
        ));
    }
    Ok(())
}

fn insufficient_message(balance: i64, delta: i64) -> String {
    format!("balance {balance} cannot cover debit of {}", delta.unsigned_abs())
}

impl Engine {
    /// Credit or debit an account exactly once per idempotency key.
    ///
    /// - A key seen before returns the stored result; nothing is re-applied.
    /// - A debit the balance cannot cover is recorded as a `failed` event and
    ///   reported as [`EngineError::InsufficientBalance`]; the balance is
    ///   untouched.
    /// - With [`ApplyCmd::mirror_to`], a newly confirmed event is mirrored to
    ///   the loyalty service in the background after the commit.
    pub async fn apply(&self, cmd: ApplyCmd) -> ResultEngine<ApplyOutcome> {
        let (outcome, _mirror) = self.apply_and_mirror(cmd).await?;
        Ok(outcome)
    }

    /// Like [`Engine::apply`], also returning the spawned mirror task (if any)
    /// so the caller may await the sync record.
    pub async fn apply_and_mirror(
        &self,
        cmd: ApplyCmd,
    ) -> ResultEngine<(
        ApplyOutcome,
        Option<JoinHandle<ResultEngine<ExternalSyncRecord>>>,
    )> {
        reject_reserved_origin(cmd.origin)?;
        let mirror_handle = cmd
            .mirror_handle
            .as_deref()
            .map(|handle| {
                normalize_handle(handle).ok_or_else(|| {
                    EngineError::Validation("mirror handle must not be empty".to_string())
                })
            })
            .transpose()?;
        let outcome = self.apply_recorded(&cmd).await?.into_result()?;

        let mirror = match (mirror_handle, &self.loyalty) {
            (Some(handle), Some(client)) if !outcome.replayed => Some(
                self.start_mirror(
                    client.clone(),
                    handle,
                    cmd.delta,
                    cmd.origin.as_str().to_string(),
                    outcome.event_id.to_string(),
                )
                .await,
            ),
            (Some(_), None) => {
                tracing::warn!(
                    event_id = %outcome.event_id,
                    "mirror requested but no loyalty client is configured"
                );
                None
            }
            _ => None,
        };

        Ok((outcome, mirror))
    }

    /// Records the first sync attempt of a committed event, then hands the
    /// remote calls to a background task that keeps the operation's lock.
    ///
    /// The attempt row exists before the task runs, so a task that never
    /// finishes leaves work for the sweep instead of nothing.
    async fn start_mirror(
        &self,
        client: Arc<dyn LoyaltyClient>,
        handle: String,
        delta: i64,
        operation_type: String,
        reference_id: String,
    ) -> JoinHandle<ResultEngine<ExternalSyncRecord>> {
        let guard = self
            .locks
            .acquire([sync_key(&handle, &operation_type, &reference_id)])
            .await;
        let started = self
            .begin_sync(&handle, delta, &operation_type, &reference_id)
            .await;
        let engine = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match started? {
                SyncStart::Verified(record) => Ok(record),
                SyncStart::Open { attempt, previous } => {
                    engine.finish_sync(client.as_ref(), attempt, previous).await
                }
            }
        })
    }

    /// Runs the exactly-once primitive and reports failed debits as an
    /// outcome instead of an error. Used by the reconciliation sweep.
    pub(crate) async fn apply_recorded(&self, cmd: &ApplyCmd) -> ResultEngine<ApplyOutcome> {
        validate_apply(cmd)?;

        // A known key locks the account it is bound to, not the requested one.
        let existing = self
            .find_event_by_key(&self.database, &cmd.idempotency_key)
            .await?;
        let account = existing
            .as_ref()
            .map_or((cmd.user_id, cmd.currency), |e| (e.user_id, e.currency));

        let _guard = self.locks.acquire([account_key(account.0, account.1)]).await;
        let now = Utc::now();
        let outcome = with_tx!(self, |db_tx| {
            self.apply_in_tx(&db_tx, cmd, account, now).await
        })?;

        match outcome.status {
            EventStatus::Confirmed if !outcome.replayed => tracing::info!(
                event_id = %outcome.event_id,
                user_id = %account.0,
                currency = %account.1,
                delta = cmd.delta,
                origin = cmd.origin.as_str(),
                new_balance = outcome.new_balance,
                "ledger event confirmed"
            ),
            EventStatus::Failed => tracing::warn!(
                event_id = %outcome.event_id,
                user_id = %account.0,
                currency = %account.1,
                delta = cmd.delta,
                "ledger event failed: {}",
                outcome.error_message.as_deref().unwrap_or_default()
            ),
            _ => tracing::debug!(event_id = %outcome.event_id, "idempotent replay"),
        }
        Ok(outcome)
    }

    /// Core of `apply`, for callers that already hold the account lock and a
    /// transaction (streak claims, merges).
    ///
    /// `locked` is the account the caller holds the lock for; a stored event
    /// bound to another account is only ever returned, never re-attempted.
    pub(super) async fn apply_in_tx(
        &self,
        db_tx: &DatabaseTransaction,
        cmd: &ApplyCmd,
        locked: (Uuid, Currency),
        now: DateTime<Utc>,
    ) -> ResultEngine<ApplyOutcome> {
        if let Some(event) = self.find_event_by_key(db_tx, &cmd.idempotency_key).await? {
            if (event.user_id, event.currency, event.delta)
                != (cmd.user_id, cmd.currency, cmd.delta)
            {
                tracing::warn!(
                    key = %cmd.idempotency_key,
                    event_id = %event.id,
                    "idempotency key replayed with a different payload; returning stored event"
                );
            }
            let bound_to_lock = (event.user_id, event.currency) == locked;
            if event.status == EventStatus::Confirmed || !bound_to_lock {
                let balance = match event.balance_after {
                    Some(balance) => balance,
                    None => self.balance_in(db_tx, event.user_id, event.currency).await?,
                };
                return Ok(ApplyOutcome::from_event(&event, balance, true));
            }
            return self.reattempt_event(db_tx, event, now).await;
        }

        if (cmd.user_id, cmd.currency) != locked {
            return Err(EngineError::Validation(
                "account lock does not match the command".to_string(),
            ));
        }

        self.require_active_profile(db_tx, cmd.user_id).await?;
        let balance = self
            .lock_account(db_tx, cmd.user_id, cmd.currency, now)
            .await?;
        let new_balance = balance
            .checked_add(cmd.delta)
            .ok_or_else(|| EngineError::Validation("balance overflow".to_string()))?;

        let mut event = LedgerEvent {
            id: Uuid::new_v4(),
            user_id: cmd.user_id,
            currency: cmd.currency,
            delta: cmd.delta,
            reason: cmd.reason.trim().to_string(),
            origin: cmd.origin,
            idempotency_key: cmd.idempotency_key.clone(),
            status: EventStatus::Confirmed,
            retries: 0,
            balance_after: Some(new_balance),
            error_message: None,
            reference_id: normalize_optional_text(cmd.reference_id.as_deref()),
            original_user_id: None,
            created_at: now,
            updated_at: now,
        };
        if new_balance < 0 {
            event.status = EventStatus::Failed;
            event.balance_after = Some(balance);
            event.error_message = Some(insufficient_message(balance, cmd.delta));
        }

        if let Err(err) = ledger_events::ActiveModel::from(&event).insert(db_tx).await {
            // Lost an insert race on the unique key: the winner's event is the result.
            if let Some(existing) = self.find_event_by_key(db_tx, &cmd.idempotency_key).await? {
                let balance = existing.balance_after.unwrap_or(balance);
                return Ok(ApplyOutcome::from_event(&existing, balance, true));
            }
            return Err(err.into());
        }

        if event.status == EventStatus::Confirmed {
            self.set_balance(db_tx, cmd.user_id, cmd.currency, new_balance, now)
                .await?;
            return Ok(ApplyOutcome::from_event(&event, new_balance, false));
        }
        Ok(ApplyOutcome::from_event(&event, balance, false))
    }

    /// Settles a `pending` or `failed` event in place.
    async fn reattempt_event(
        &self,
        db_tx: &DatabaseTransaction,
        mut event: LedgerEvent,
        now: DateTime<Utc>,
    ) -> ResultEngine<ApplyOutcome> {
        self.require_active_profile(db_tx, event.user_id).await?;
        let balance = self
            .lock_account(db_tx, event.user_id, event.currency, now)
            .await?;
        let new_balance = balance
            .checked_add(event.delta)
            .ok_or_else(|| EngineError::Validation("balance overflow".to_string()))?;

        event.retries += 1;
        event.updated_at = now;
        if new_balance < 0 {
            event.status = EventStatus::Failed;
            event.balance_after = Some(balance);
            event.error_message = Some(insufficient_message(balance, event.delta));
        } else {
            event.status = EventStatus::Confirmed;
            event.balance_after = Some(new_balance);
            event.error_message = None;
        }

        let model = ledger_events::ActiveModel {
            id: ActiveValue::Set(event.id.to_string()),
            status: ActiveValue::Set(event.status.as_str().to_string()),
            retries: ActiveValue::Set(i32::try_from(event.retries).unwrap_or(i32::MAX)),
            balance_after: ActiveValue::Set(event.balance_after),
            error_message: ActiveValue::Set(event.error_message.clone()),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        model.update(db_tx).await?;

        if event.status == EventStatus::Confirmed {
            self.set_balance(db_tx, event.user_id, event.currency, new_balance, now)
                .await?;
            return Ok(ApplyOutcome::from_event(&event, new_balance, false));
        }
        Ok(ApplyOutcome::from_event(&event, balance, false))
    }

    /// Records a `pending` event without touching the balance. The
    /// reconciliation sweep settles it later through the same key.
    pub async fn enqueue(&self, cmd: ApplyCmd) -> ResultEngine<LedgerEvent> {
        validate_apply(&cmd)?;
        reject_reserved_origin(cmd.origin)?;

        let _guard = self
            .locks
            .acquire([account_key(cmd.user_id, cmd.currency)])
            .await;
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            async {
                if let Some(existing) = self
                    .find_event_by_key(&db_tx, &cmd.idempotency_key)
                    .await?
                {
                    return Ok(existing);
                }
                self.require_active_profile(&db_tx, cmd.user_id).await?;
                let event = LedgerEvent {
                    id: Uuid::new_v4(),
                    user_id: cmd.user_id,
                    currency: cmd.currency,
                    delta: cmd.delta,
                    reason: cmd.reason.trim().to_string(),
                    origin: cmd.origin,
                    idempotency_key: cmd.idempotency_key.clone(),
                    status: EventStatus::Pending,
                    retries: 0,
                    balance_after: None,
                    error_message: None,
                    reference_id: normalize_optional_text(cmd.reference_id.as_deref()),
                    original_user_id: None,
                    created_at: now,
                    updated_at: now,
                };
                ledger_events::ActiveModel::from(&event).insert(&db_tx).await?;
                Ok(event)
            }
            .await
        })
    }

    /// Audited reversal of a confirmed event: applies the negated delta as an
    /// `admin` event that references the original. A reversal the balance can
    /// no longer cover fails like any other debit; it stays the only reversal
    /// of the event and is settled by replaying its key (or by the sweep).
    pub async fn reverse(
        &self,
        event_id: Uuid,
        idempotency_key: impl Into<String>,
        reason: Option<&str>,
    ) -> ResultEngine<ApplyOutcome> {
        let original = self.event(event_id).await?;
        if original.status != EventStatus::Confirmed {
            return Err(EngineError::Validation(
                "only confirmed events can be reversed".to_string(),
            ));
        }
        if original.origin == Origin::Consolidation {
            return Err(EngineError::Validation(
                "consolidation events cannot be reversed".to_string(),
            ));
        }

        let reason = normalize_optional_text(reason)
            .unwrap_or_else(|| format!("reversal of {}", original.id));
        let cmd = ApplyCmd::new(
            original.user_id,
            original.currency,
            -original.delta,
            idempotency_key,
            Origin::Admin,
        )
        .reason(reason)
        .reference_id(original.id.to_string());
        validate_apply(&cmd)?;

        let account = (original.user_id, original.currency);
        let _guard = self.locks.acquire([account_key(account.0, account.1)]).await;
        let now = Utc::now();
        let outcome = with_tx!(self, |db_tx| {
            async {
                // Any reversal on record counts, settled or not: a failed one is
                // still retried by the sweep under its own key.
                let already = ledger_events::Entity::find()
                    .filter(ledger_events::Column::ReferenceId.eq(original.id.to_string()))
                    .filter(ledger_events::Column::Origin.eq(Origin::Admin.as_str()))
                    .filter(ledger_events::Column::Delta.eq(-original.delta))
                    .filter(ledger_events::Column::IdempotencyKey.ne(cmd.idempotency_key.clone()))
                    .one(&db_tx)
                    .await?;
                if let Some(existing) = already {
                    return Err(EngineError::Validation(format!(
                        "event {} already has reversal \"{}\" ({})",
                        original.id, existing.idempotency_key, existing.status
                    )));
                }
                self.apply_in_tx(&db_tx, &cmd, account, now).await
            }
            .await
        })?;
        tracing::info!(
            original = %original.id,
            reversal = %outcome.event_id,
            "ledger event reversed"
        );
        outcome.into_result()
    }

    /// Current balance of one account (0 if it was never touched).
    pub async fn balance(&self, user_id: Uuid, currency: Currency) -> ResultEngine<i64> {
        self.balance_in(&self.database, user_id, currency).await
    }

    /// Balances of every currency for a profile.
    pub async fn balances(&self, user_id: Uuid) -> ResultEngine<BTreeMap<Currency, i64>> {
        let mut out = BTreeMap::new();
        for currency in Currency::ALL {
            out.insert(currency, self.balance(user_id, currency).await?);
        }
        Ok(out)
    }

    pub async fn event(&self, event_id: Uuid) -> ResultEngine<LedgerEvent> {
        let model = ledger_events::Entity::find_by_id(event_id.to_string())
            .one(&self.database)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound("ledger event not exists".to_string()))?;
        LedgerEvent::try_from(model)
    }

    pub async fn event_by_key(&self, idempotency_key: &str) -> ResultEngine<Option<LedgerEvent>> {
        self.find_event_by_key(&self.database, idempotency_key).await
    }

    /// Events currently attributed to a profile, oldest first.
    pub async fn events_for_user(
        &self,
        user_id: Uuid,
        currency: Option<Currency>,
    ) -> ResultEngine<Vec<LedgerEvent>> {
        let mut query = ledger_events::Entity::find()
            .filter(ledger_events::Column::UserId.eq(user_id.to_string()));
        if let Some(currency) = currency {
            query = query.filter(ledger_events::Column::Currency.eq(currency.code()));
        }
        query
            .order_by_asc(ledger_events::Column::CreatedAt)
            .order_by_asc(ledger_events::Column::Id)
            .all(&self.database)
            .await?
            .into_iter()
            .map(LedgerEvent::try_from)
            .collect()
    }

    /// Replays confirmed events into balances and compares them with the
    /// materialized ones.
    ///
    /// When `repair` is set, drifted balances are overwritten with the replayed
    /// value (which must be non-negative).
    pub async fn recompute_balances(
        &self,
        user_id: Uuid,
        repair: bool,
    ) -> ResultEngine<Vec<BalanceCheck>> {
        let keys = Currency::ALL.map(|c| account_key(user_id, c));
        let _guard = self.locks.acquire(keys).await;
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            async {
                let mut checks = Vec::with_capacity(Currency::ALL.len());
                for currency in Currency::ALL {
                    let stmt = Statement::from_sql_and_values(
                        db_tx.get_database_backend(),
                        "SELECT COALESCE(SUM(delta), 0) AS sum \
                         FROM ledger_events \
                         WHERE user_id = ? AND currency = ? AND status = ?",
                        vec![
                            user_id.to_string().into(),
                            currency.code().into(),
                            EventStatus::Confirmed.as_str().into(),
                        ],
                    );
                    let row = db_tx.query_one(stmt).await?;
                    let from_events: i64 =
                        row.and_then(|r| r.try_get("", "sum").ok()).unwrap_or(0);
                    let check = BalanceCheck {
                        currency,
                        stored: self.balance_in(&db_tx, user_id, currency).await?,
                        from_events,
                    };
                    if check.drifted() {
                        tracing::warn!(
                            %user_id,
                            %currency,
                            stored = check.stored,
                            from_events = check.from_events,
                            "balance drift detected"
                        );
                        if repair {
                            if check.from_events < 0 {
                                return Err(EngineError::Validation(format!(
                                    "replayed {currency} balance is negative"
                                )));
                            }
                            self.lock_account(&db_tx, user_id, currency, now).await?;
                            self.set_balance(&db_tx, user_id, currency, check.from_events, now)
                                .await?;
                        }
                    }
                    checks.push(check);
                }
                Ok(checks)
            }
            .await
        })
    }

    pub(super) async fn find_event_by_key<C: ConnectionTrait>(
        &self,
        db: &C,
        idempotency_key: &str,
    ) -> ResultEngine<Option<LedgerEvent>> {
        ledger_events::Entity::find()
            .filter(ledger_events::Column::IdempotencyKey.eq(idempotency_key.to_string()))
            .one(db)
            .await?
            .map(LedgerEvent::try_from)
            .transpose()
    }

    pub(super) async fn balance_in<C: ConnectionTrait>(
        &self,
        db: &C,
        user_id: Uuid,
        currency: Currency,
    ) -> ResultEngine<i64> {
        let model = accounts::Entity::find_by_id((user_id.to_string(), currency.code().to_string()))
            .one(db)
            .await?;
        Ok(model.map_or(0, |m| m.balance))
    }

    /// Reads the account row for update, creating it at 0 on first use.
    pub(super) async fn lock_account(
        &self,
        db_tx: &DatabaseTransaction,
        user_id: Uuid,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> ResultEngine<i64> {
        let found = accounts::Entity::find_by_id((user_id.to_string(), currency.code().to_string()))
            .lock_exclusive()
            .one(db_tx)
            .await?;
        if let Some(model) = found {
            return Ok(model.balance);
        }
        accounts::ActiveModel {
            user_id: ActiveValue::Set(user_id.to_string()),
            currency: ActiveValue::Set(currency.code().to_string()),
            balance: ActiveValue::Set(0),
            updated_at: ActiveValue::Set(now),
        }
        .insert(db_tx)
        .await?;
        Ok(0)
    }

    pub(super) async fn set_balance(
        &self,
        db_tx: &DatabaseTransaction,
        user_id: Uuid,
        currency: Currency,
        balance: i64,
        now: DateTime<Utc>,
    ) -> ResultEngine<()> {
        if balance < 0 {
            return Err(EngineError::InsufficientBalance(format!(
                "{currency} balance would become {balance}"
            )));
        }
        accounts::ActiveModel {
            user_id: ActiveValue::Set(user_id.to_string()),
            currency: ActiveValue::Set(currency.code().to_string()),
            balance: ActiveValue::Set(balance),
            updated_at: ActiveValue::Set(now),
        }
        .update(db_tx)
        .await?;
        Ok(())
    }
}
