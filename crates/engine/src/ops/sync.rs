use std::future::Future;

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, ConnectionTrait, QueryFilter, QueryOrder, TransactionTrait, prelude::*};
use uuid::Uuid;

use crate::{
    EngineError, ExternalSyncRecord, LoyaltyClient, LoyaltyError, ResultEngine, external_sync,
    locks::sync_key,
    util::{normalize_handle, require_text},
};

use super::{Engine, with_tx};

/// What one attempt observed on the remote side.
struct Attempt {
    success: bool,
    balance_before: Option<i64>,
    balance_after: Option<i64>,
    verified: bool,
    unverified_reads: u32,
    error_message: Option<String>,
}

impl Attempt {
    fn failed(balance_before: Option<i64>, err: &LoyaltyError) -> Self {
        Self {
            success: false,
            balance_before,
            balance_after: None,
            verified: false,
            unverified_reads: 0,
            error_message: Some(err.to_string()),
        }
    }
}

/// State of an operation once its lock is held.
pub(super) enum SyncStart {
    /// Already verified; nothing to do.
    Verified(ExternalSyncRecord),
    /// A new attempt row, stored before any remote call.
    Open {
        attempt: ExternalSyncRecord,
        previous: Option<ExternalSyncRecord>,
    },
}

/// Normalized `(handle, operation_type, reference_id)` of an operation.
fn sync_target(
    handle: &str,
    operation_type: &str,
    reference_id: &str,
) -> ResultEngine<(String, String, String)> {
    let handle = normalize_handle(handle)
        .ok_or_else(|| EngineError::Validation("handle must not be empty".to_string()))?;
    let operation_type = require_text(operation_type, "operation type")?;
    let reference_id = require_text(reference_id, "reference id")?;
    Ok((handle, operation_type, reference_id))
}

impl Engine {
    /// Mirror a points delta to the loyalty service and verify it landed.
    ///
    /// Every call adds one attempt row for the operation
    /// `(handle, operation_type, reference_id)`. The row is stored before the
    /// first remote call and flagged for reprocessing until the attempt
    /// finishes, so an interrupted attempt is picked up by the sweep.
    /// - an operation with a verified attempt is done; that attempt is returned
    /// - an acknowledged but unverified delta is only re-verified, never
    ///   submitted again
    /// - a transport failure or timeout records `success = false` and flags the
    ///   attempt for reprocessing
    ///
    /// The local ledger is never touched here.
    pub async fn sync_external_points(
        &self,
        handle: &str,
        points_delta: i64,
        operation_type: &str,
        reference_id: &str,
    ) -> ResultEngine<ExternalSyncRecord> {
        let (handle, operation_type, reference_id) =
            sync_target(handle, operation_type, reference_id)?;
        if points_delta == 0 {
            return Err(EngineError::Validation(
                "points delta must not be 0".to_string(),
            ));
        }
        let client = self.loyalty()?.clone();

        let _guard = self
            .locks
            .acquire([sync_key(&handle, &operation_type, &reference_id)])
            .await;
        match self
            .begin_sync(&handle, points_delta, &operation_type, &reference_id)
            .await?
        {
            SyncStart::Verified(record) => Ok(record),
            SyncStart::Open { attempt, previous } => {
                self.finish_sync(client.as_ref(), attempt, previous).await
            }
        }
    }

    /// Stores the next attempt of an operation as unfinished. The caller
    /// holds the operation's sync lock.
    pub(super) async fn begin_sync(
        &self,
        handle: &str,
        points_delta: i64,
        operation_type: &str,
        reference_id: &str,
    ) -> ResultEngine<SyncStart> {
        let previous = self
            .latest_sync_attempt(&self.database, handle, operation_type, reference_id)
            .await?;
        if let Some(previous) = &previous
            && previous.verified
        {
            return Ok(SyncStart::Verified(previous.clone()));
        }

        let points_delta = match &previous {
            Some(previous) if previous.points_delta != points_delta => {
                tracing::warn!(
                    %handle,
                    %operation_type,
                    %reference_id,
                    stored = previous.points_delta,
                    requested = points_delta,
                    "sync retried with a different delta; keeping the stored one"
                );
                previous.points_delta
            }
            _ => points_delta,
        };

        // Carries what the earlier attempt knew, so a crash here loses nothing.
        let now = Utc::now();
        let attempt = ExternalSyncRecord {
            id: Uuid::new_v4(),
            handle: handle.to_string(),
            operation_type: operation_type.to_string(),
            reference_id: reference_id.to_string(),
            points_delta,
            attempt: previous.as_ref().map_or(1, |p| p.attempt + 1),
            success: previous.as_ref().is_some_and(|p| p.success),
            balance_before: previous.as_ref().and_then(|p| p.balance_before),
            balance_after: None,
            verified: false,
            verification_attempts: previous.as_ref().map_or(0, |p| p.verification_attempts),
            requires_reprocessing: true,
            error_message: Some("attempt did not finish".to_string()),
            reprocessed_at: None,
            created_at: now,
        };
        self.store_attempt(&attempt, previous.as_ref(), now).await?;
        Ok(SyncStart::Open { attempt, previous })
    }

    /// Runs the remote side of an open attempt and stores its outcome.
    pub(super) async fn finish_sync(
        &self,
        client: &dyn LoyaltyClient,
        open: ExternalSyncRecord,
        previous: Option<ExternalSyncRecord>,
    ) -> ResultEngine<ExternalSyncRecord> {
        let observed = match &previous {
            Some(previous) if previous.success => {
                // The remote already acknowledged this delta.
                let expected = previous
                    .balance_before
                    .and_then(|before| before.checked_add(open.points_delta));
                self.verify_only(client, &open.handle, previous.balance_before, expected)
                    .await
            }
            Some(previous) => {
                self.retry_submit(client, &open, previous.balance_before)
                    .await?
            }
            None => self.submit(client, &open, None).await?,
        };

        let verification_attempts = open.verification_attempts + observed.unverified_reads;
        let requires_reprocessing = !observed.success
            || (!observed.verified
                && verification_attempts >= self.config.sync.max_verification_attempts);
        let record = ExternalSyncRecord {
            success: observed.success,
            balance_before: observed.balance_before,
            balance_after: observed.balance_after,
            verified: observed.verified,
            verification_attempts,
            requires_reprocessing,
            error_message: observed.error_message,
            ..open
        };
        external_sync::ActiveModel::from(&record)
            .update(&self.database)
            .await?;

        if record.verified {
            tracing::info!(
                handle = %record.handle,
                operation_type = %record.operation_type,
                reference_id = %record.reference_id,
                attempt = record.attempt,
                delta = record.points_delta,
                "external sync verified"
            );
        } else {
            tracing::warn!(
                handle = %record.handle,
                operation_type = %record.operation_type,
                reference_id = %record.reference_id,
                attempt = record.attempt,
                success = record.success,
                verification_attempts = record.verification_attempts,
                requires_reprocessing = record.requires_reprocessing,
                error = record.error_message.as_deref().unwrap_or_default(),
                "external sync not verified"
            );
        }
        Ok(record)
    }

    /// Takes an unacknowledged operation out of the retry queue.
    ///
    /// Only the latest attempt is retired, and only while it is still
    /// unacknowledged; returns whether it was.
    pub(super) async fn abandon_sync(
        &self,
        record: &ExternalSyncRecord,
        reason: &str,
    ) -> ResultEngine<bool> {
        let _guard = self
            .locks
            .acquire([sync_key(
                &record.handle,
                &record.operation_type,
                &record.reference_id,
            )])
            .await;
        let latest = self
            .latest_sync_attempt(
                &self.database,
                &record.handle,
                &record.operation_type,
                &record.reference_id,
            )
            .await?;
        let Some(latest) = latest.filter(|l| l.id == record.id && !l.success) else {
            return Ok(false);
        };

        let message = match latest.error_message {
            Some(err) => format!("{err}; {reason}"),
            None => reason.to_string(),
        };
        external_sync::ActiveModel {
            id: ActiveValue::Set(latest.id.to_string()),
            requires_reprocessing: ActiveValue::Set(false),
            reprocessed_at: ActiveValue::Set(Some(Utc::now())),
            error_message: ActiveValue::Set(Some(message)),
            ..Default::default()
        }
        .update(&self.database)
        .await?;
        tracing::info!(
            handle = %latest.handle,
            operation_type = %latest.operation_type,
            reference_id = %latest.reference_id,
            "external sync abandoned: {reason}"
        );
        Ok(true)
    }

    /// Latest attempt of an operation, if any.
    pub async fn sync_status(
        &self,
        handle: &str,
        operation_type: &str,
        reference_id: &str,
    ) -> ResultEngine<Option<ExternalSyncRecord>> {
        let handle = normalize_handle(handle)
            .ok_or_else(|| EngineError::Validation("handle must not be empty".to_string()))?;
        self.latest_sync_attempt(&self.database, &handle, operation_type.trim(), reference_id.trim())
            .await
    }

    /// Every attempt of an operation, in attempt order.
    pub async fn sync_attempts(
        &self,
        handle: &str,
        operation_type: &str,
        reference_id: &str,
    ) -> ResultEngine<Vec<ExternalSyncRecord>> {
        let handle = normalize_handle(handle)
            .ok_or_else(|| EngineError::Validation("handle must not be empty".to_string()))?;
        external_sync::Entity::find()
            .filter(external_sync::Column::Handle.eq(handle))
            .filter(external_sync::Column::OperationType.eq(operation_type.trim()))
            .filter(external_sync::Column::ReferenceId.eq(reference_id.trim()))
            .order_by_asc(external_sync::Column::Attempt)
            .all(&self.database)
            .await?
            .into_iter()
            .map(ExternalSyncRecord::try_from)
            .collect()
    }

    pub async fn sync_record(&self, id: Uuid) -> ResultEngine<ExternalSyncRecord> {
        self.find_sync_record(id)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound("sync record not exists".to_string()))
    }

    pub(super) async fn find_sync_record(
        &self,
        id: Uuid,
    ) -> ResultEngine<Option<ExternalSyncRecord>> {
        external_sync::Entity::find_by_id(id.to_string())
            .one(&self.database)
            .await?
            .map(ExternalSyncRecord::try_from)
            .transpose()
    }

    async fn latest_sync_attempt<C: ConnectionTrait>(
        &self,
        db: &C,
        handle: &str,
        operation_type: &str,
        reference_id: &str,
    ) -> ResultEngine<Option<ExternalSyncRecord>> {
        external_sync::Entity::find()
            .filter(external_sync::Column::Handle.eq(handle))
            .filter(external_sync::Column::OperationType.eq(operation_type))
            .filter(external_sync::Column::ReferenceId.eq(reference_id))
            .order_by_desc(external_sync::Column::Attempt)
            .one(db)
            .await?
            .map(ExternalSyncRecord::try_from)
            .transpose()
    }

    /// Appends `record` and retires the attempt it supersedes.
    async fn store_attempt(
        &self,
        record: &ExternalSyncRecord,
        previous: Option<&ExternalSyncRecord>,
        now: DateTime<Utc>,
    ) -> ResultEngine<()> {
        with_tx!(self, |db_tx| {
            async {
                external_sync::ActiveModel::from(record).insert(&db_tx).await?;
                if let Some(previous) = previous {
                    external_sync::ActiveModel {
                        id: ActiveValue::Set(previous.id.to_string()),
                        requires_reprocessing: ActiveValue::Set(false),
                        reprocessed_at: ActiveValue::Set(Some(now)),
                        ..Default::default()
                    }
                    .update(&db_tx)
                    .await?;
                }
                Ok(())
            }
            .await
        })
    }

    /// Bounded remote call; a timeout is a failure like any other.
    pub(super) async fn remote<T, F>(&self, call: F) -> Result<T, LoyaltyError>
    where
        F: Future<Output = Result<T, LoyaltyError>>,
    {
        let timeout = self.config.sync.timeout();
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| LoyaltyError::Timeout(timeout))?
    }

    /// Read, submit, then verify. The baseline is stored on the open attempt
    /// before the submit goes out.
    async fn submit(
        &self,
        client: &dyn LoyaltyClient,
        open: &ExternalSyncRecord,
        known_before: Option<i64>,
    ) -> ResultEngine<Attempt> {
        let before = match known_before {
            Some(before) => before,
            None => match self.remote(client.balance(&open.handle)).await {
                Ok(before) => before,
                Err(err) => return Ok(Attempt::failed(open.balance_before, &err)),
            },
        };
        external_sync::ActiveModel {
            id: ActiveValue::Set(open.id.to_string()),
            balance_before: ActiveValue::Set(Some(before)),
            ..Default::default()
        }
        .update(&self.database)
        .await?;

        if let Err(err) = self
            .remote(client.add_points(&open.handle, open.points_delta))
            .await
        {
            return Ok(Attempt::failed(Some(before), &err));
        }
        Ok(self
            .verify_only(
                client,
                &open.handle,
                Some(before),
                before.checked_add(open.points_delta),
            )
            .await)
    }

    /// Retry after a failed attempt.
    ///
    /// A submit that timed out may still have landed: if the remote balance
    /// now equals the earlier `balance_before + delta`, the delta is taken as
    /// applied and not sent again.
    async fn retry_submit(
        &self,
        client: &dyn LoyaltyClient,
        open: &ExternalSyncRecord,
        earlier_before: Option<i64>,
    ) -> ResultEngine<Attempt> {
        let current = match self.remote(client.balance(&open.handle)).await {
            Ok(current) => current,
            Err(err) => return Ok(Attempt::failed(earlier_before, &err)),
        };
        if let Some(before) = earlier_before
            && before.checked_add(open.points_delta) == Some(current)
        {
            tracing::info!(
                handle = %open.handle,
                before,
                current,
                "earlier submit landed; not sending the delta again"
            );
            return Ok(Attempt {
                success: true,
                balance_before: Some(before),
                balance_after: Some(current),
                verified: true,
                unverified_reads: 0,
                error_message: None,
            });
        }
        self.submit(client, open, Some(current)).await
    }

    /// Re-reads the remote balance until it equals `expected`.
    async fn verify_only(
        &self,
        client: &dyn LoyaltyClient,
        handle: &str,
        balance_before: Option<i64>,
        expected: Option<i64>,
    ) -> Attempt {
        let mut attempt = Attempt {
            success: true,
            balance_before,
            balance_after: None,
            verified: false,
            unverified_reads: 0,
            error_message: None,
        };
        let Some(expected) = expected else {
            attempt.error_message = Some("no baseline balance to verify against".to_string());
            return attempt;
        };

        let delay = self.config.sync.verification_delay();
        for _ in 0..self.config.sync.verification_polls {
            tokio::time::sleep(delay).await;
            match self.remote(client.balance(handle)).await {
                Ok(observed) => {
                    attempt.balance_after = Some(observed);
                    if observed == expected {
                        attempt.verified = true;
                        attempt.error_message = None;
                        return attempt;
                    }
                    attempt.error_message =
                        Some(format!("expected balance {expected}, observed {observed}"));
                }
                Err(err) => attempt.error_message = Some(err.to_string()),
            }
            attempt.unverified_reads += 1;
        }
        attempt
    }
}
