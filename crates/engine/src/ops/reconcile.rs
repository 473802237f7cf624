use chrono::{Duration, Utc};
use sea_orm::{Condition, QueryFilter, QueryOrder, QuerySelect, prelude::*};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    ApplyCmd, EngineError, EventStatus, ExternalSyncRecord, LedgerEvent, ResultEngine,
    external_sync, ledger_events,
};

use super::{ApplyOutcome, Engine};

/// Work the sweep would pick up right now.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PendingWork {
    pub events: Vec<LedgerEvent>,
    /// Latest unsettled attempt of each operation.
    pub syncs: Vec<ExternalSyncRecord>,
}

impl PendingWork {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.syncs.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub events_scanned: usize,
    pub events_recovered: usize,
    pub events_failing: usize,
    /// Events that used their last automatic retry in this sweep.
    pub events_exhausted: usize,
    pub syncs_scanned: usize,
    pub syncs_recovered: usize,
    pub syncs_failing: usize,
    pub syncs_exhausted: usize,
    /// Syncs left alone because no loyalty client is configured.
    pub syncs_skipped: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ReprocessOutcome {
    Ledger(ApplyOutcome),
    Sync(ExternalSyncRecord),
}

impl Engine {
    /// Events and sync attempts older than the grace window that still need
    /// work and have retries left.
    pub async fn scan_pending(&self) -> ResultEngine<PendingWork> {
        let reconcile = &self.config.reconcile;
        let grace = Duration::seconds(i64::try_from(reconcile.grace_secs).unwrap_or(i64::MAX));
        let cutoff = Utc::now() - grace;
        let max_retries = i32::try_from(reconcile.max_retries).unwrap_or(i32::MAX);
        let limit = reconcile.batch_size;

        let events = ledger_events::Entity::find()
            .filter(ledger_events::Column::Status.is_in([
                EventStatus::Pending.as_str(),
                EventStatus::Failed.as_str(),
            ]))
            .filter(ledger_events::Column::UpdatedAt.lte(cutoff))
            .filter(ledger_events::Column::Retries.lt(max_retries))
            .order_by_asc(ledger_events::Column::CreatedAt)
            .order_by_asc(ledger_events::Column::Id)
            .limit(limit)
            .all(&self.database)
            .await?
            .into_iter()
            .map(LedgerEvent::try_from)
            .collect::<ResultEngine<Vec<_>>>()?;

        let syncs = external_sync::Entity::find()
            .filter(external_sync::Column::ReprocessedAt.is_null())
            .filter(
                Condition::any()
                    .add(external_sync::Column::RequiresReprocessing.eq(true))
                    .add(external_sync::Column::Verified.eq(false)),
            )
            .filter(external_sync::Column::CreatedAt.lte(cutoff))
            .filter(external_sync::Column::Attempt.lte(max_retries))
            .order_by_asc(external_sync::Column::CreatedAt)
            .order_by_asc(external_sync::Column::Id)
            .limit(limit)
            .all(&self.database)
            .await?
            .into_iter()
            .map(ExternalSyncRecord::try_from)
            .collect::<ResultEngine<Vec<_>>>()?;

        Ok(PendingWork { events, syncs })
    }

    /// One reconciliation pass: every pending item is retried once through
    /// the same idempotent primitive that created it.
    pub async fn run_sweep(&self) -> ResultEngine<SweepReport> {
        let work = self.scan_pending().await?;
        let max_retries = self.config.reconcile.max_retries;
        let mut report = SweepReport {
            events_scanned: work.events.len(),
            syncs_scanned: work.syncs.len(),
            ..SweepReport::default()
        };

        for event in &work.events {
            match self.apply_recorded(&ApplyCmd::from(event)).await {
                Ok(outcome) if outcome.status == EventStatus::Confirmed => {
                    report.events_recovered += 1;
                }
                Ok(_) => {
                    report.events_failing += 1;
                    if event.retries + 1 >= max_retries {
                        report.events_exhausted += 1;
                        tracing::warn!(
                            event_id = %event.id,
                            key = %event.idempotency_key,
                            "ledger event exhausted automatic retries"
                        );
                    }
                }
                Err(err) => {
                    report.events_failing += 1;
                    tracing::error!(event_id = %event.id, "ledger retry failed: {err}");
                }
            }
        }

        if self.loyalty.is_none() && !work.syncs.is_empty() {
            tracing::warn!(
                count = work.syncs.len(),
                "skipping sync retries: no loyalty client configured"
            );
            report.syncs_skipped = work.syncs.len();
        } else {
            for sync in &work.syncs {
                match self
                    .sync_external_points(
                        &sync.handle,
                        sync.points_delta,
                        &sync.operation_type,
                        &sync.reference_id,
                    )
                    .await
                {
                    Ok(record) if record.verified => report.syncs_recovered += 1,
                    Ok(record) => {
                        report.syncs_failing += 1;
                        if record.attempt > max_retries {
                            report.syncs_exhausted += 1;
                            tracing::warn!(
                                handle = %record.handle,
                                operation_type = %record.operation_type,
                                reference_id = %record.reference_id,
                                "external sync exhausted automatic retries"
                            );
                        }
                    }
                    Err(err) => {
                        report.syncs_failing += 1;
                        tracing::error!(sync_id = %sync.id, "sync retry failed: {err}");
                    }
                }
            }
        }

        self.locks.prune();
        if work.is_empty() {
            tracing::debug!("reconciliation sweep found nothing to do");
        } else {
            tracing::info!(
                events_scanned = report.events_scanned,
                events_recovered = report.events_recovered,
                syncs_scanned = report.syncs_scanned,
                syncs_recovered = report.syncs_recovered,
                "reconciliation sweep finished"
            );
        }
        Ok(report)
    }

    /// Operator-triggered retry of one ledger event or sync attempt, with no
    /// retry bound. Safe to call any number of times.
    pub async fn reprocess(&self, id: Uuid) -> ResultEngine<ReprocessOutcome> {
        if let Some(model) = ledger_events::Entity::find_by_id(id.to_string())
            .one(&self.database)
            .await?
        {
            let event = LedgerEvent::try_from(model)?;
            tracing::info!(event_id = %event.id, "manual reprocess of ledger event");
            let outcome = self.apply_recorded(&ApplyCmd::from(&event)).await?;
            return Ok(ReprocessOutcome::Ledger(outcome));
        }

        if let Some(record) = self.find_sync_record(id).await? {
            tracing::info!(sync_id = %record.id, "manual reprocess of external sync");
            let latest = self
                .sync_external_points(
                    &record.handle,
                    record.points_delta,
                    &record.operation_type,
                    &record.reference_id,
                )
                .await?;
            return Ok(ReprocessOutcome::Sync(latest));
        }

        Err(EngineError::KeyNotFound(
            "no ledger event or sync record with this id".to_string(),
        ))
    }
}
