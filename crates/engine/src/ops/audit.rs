use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sea_orm::{Condition, QueryFilter, QueryOrder, QuerySelect, TransactionTrait, prelude::*};

use crate::{
    Currency, EngineError, EventStatus, LedgerEvent, Origin, ResultEngine, ledger_events, profiles,
};

use super::{Engine, with_tx};

/// Filters for the audit query.
///
/// `from` is inclusive and `to` is exclusive (`[from, to)`), both in UTC.
#[derive(Clone, Debug, Default)]
pub struct AuditFilter {
    /// If present, acts as an allow-list of statuses.
    pub statuses: Option<Vec<EventStatus>>,
    /// If present, acts as an allow-list of origins.
    pub origins: Option<Vec<Origin>>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub user_id: Option<Uuid>,
}

/// One ledger event as shown to an operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuditRow {
    pub event_id: Uuid,
    pub date: DateTime<Utc>,
    pub user_id: Uuid,
    /// Current handle of the owning profile.
    pub handle: Option<String>,
    pub currency: Currency,
    pub origin: Origin,
    pub delta: i64,
    pub status: EventStatus,
    pub reason: String,
    pub error: Option<String>,
    pub retries: u32,
    pub reference_id: Option<String>,
    pub idempotency_key: String,
}

impl AuditRow {
    fn new(event: LedgerEvent, handle: Option<String>) -> Self {
        Self {
            event_id: event.id,
            date: event.created_at,
            user_id: event.user_id,
            handle,
            currency: event.currency,
            origin: event.origin,
            delta: event.delta,
            status: event.status,
            reason: event.reason,
            error: event.error_message,
            retries: event.retries,
            reference_id: event.reference_id,
            idempotency_key: event.idempotency_key,
        }
    }
}

fn validate_audit_filter(filter: &AuditFilter) -> ResultEngine<()> {
    if let (Some(from), Some(to)) = (filter.from, filter.to)
        && from >= to
    {
        return Err(EngineError::Validation(
            "invalid range: from must be < to".to_string(),
        ));
    }
    if filter.statuses.as_ref().is_some_and(|s| s.is_empty()) {
        return Err(EngineError::Validation(
            "statuses must not be empty".to_string(),
        ));
    }
    if filter.origins.as_ref().is_some_and(|o| o.is_empty()) {
        return Err(EngineError::Validation(
            "origins must not be empty".to_string(),
        ));
    }
    Ok(())
}

trait ApplyAuditFilters: QueryFilter + Sized {
    fn apply_audit_filters(self, filter: &AuditFilter) -> Self;
}

impl<T> ApplyAuditFilters for T
where
    T: QueryFilter + Sized,
{
    fn apply_audit_filters(mut self, filter: &AuditFilter) -> Self {
        if let Some(from) = filter.from {
            self = self.filter(ledger_events::Column::CreatedAt.gte(from));
        }
        if let Some(to) = filter.to {
            self = self.filter(ledger_events::Column::CreatedAt.lt(to));
        }
        if let Some(statuses) = &filter.statuses {
            let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
            self = self.filter(ledger_events::Column::Status.is_in(statuses));
        }
        if let Some(origins) = &filter.origins {
            let origins: Vec<&str> = origins.iter().map(|o| o.as_str()).collect();
            self = self.filter(ledger_events::Column::Origin.is_in(origins));
        }
        if let Some(user_id) = filter.user_id {
            self = self.filter(ledger_events::Column::UserId.eq(user_id.to_string()));
        }
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct AuditCursor {
    created_at: DateTime<Utc>,
    event_id: String,
}

impl AuditCursor {
    fn encode(&self) -> ResultEngine<String> {
        let bytes = serde_json::to_vec(self)
            .map_err(|_| EngineError::InvalidCursor("invalid audit cursor".to_string()))?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    fn decode(input: &str) -> ResultEngine<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(input.as_bytes())
            .map_err(|_| EngineError::InvalidCursor("invalid audit cursor".to_string()))?;
        serde_json::from_slice::<Self>(&bytes)
            .map_err(|_| EngineError::InvalidCursor("invalid audit cursor".to_string()))
    }
}

impl Engine {
    /// Read-only view of the ledger for operators, with cursor-based
    /// pagination.
    ///
    /// Pagination is newest → older by `(created_at DESC, event_id DESC)`.
    pub async fn query_audit(
        &self,
        filter: &AuditFilter,
        limit: u64,
        cursor: Option<&str>,
    ) -> ResultEngine<(Vec<AuditRow>, Option<String>)> {
        validate_audit_filter(filter)?;
        if limit == 0 {
            return Err(EngineError::Validation("limit must be > 0".to_string()));
        }

        with_tx!(self, |db_tx| {
            async {
                let limit_plus_one = limit.saturating_add(1);
                let mut query = ledger_events::Entity::find()
                    .find_also_related(profiles::Entity)
                    .order_by_desc(ledger_events::Column::CreatedAt)
                    .order_by_desc(ledger_events::Column::Id)
                    .limit(limit_plus_one);

                if let Some(cursor) = cursor {
                    let cursor = AuditCursor::decode(cursor)?;
                    query = query.filter(
                        Condition::any()
                            .add(ledger_events::Column::CreatedAt.lt(cursor.created_at))
                            .add(
                                Condition::all()
                                    .add(ledger_events::Column::CreatedAt.eq(cursor.created_at))
                                    .add(ledger_events::Column::Id.lt(cursor.event_id)),
                            ),
                    );
                }
                query = query.apply_audit_filters(filter);

                let rows: Vec<(ledger_events::Model, Option<profiles::Model>)> =
                    query.all(&db_tx).await?;
                let has_more = rows.len() > limit as usize;

                let mut out: Vec<AuditRow> = Vec::with_capacity(rows.len().min(limit as usize));
                for (event_model, profile) in rows.into_iter().take(limit as usize) {
                    let event = LedgerEvent::try_from(event_model)?;
                    out.push(AuditRow::new(event, profile.map(|p| p.handle)));
                }

                let next_cursor = out.last().map(|row| AuditCursor {
                    created_at: row.date,
                    event_id: row.event_id.to_string(),
                });
                let next_cursor = if has_more {
                    next_cursor.map(|c| c.encode()).transpose()?
                } else {
                    None
                };

                Ok((out, next_cursor))
            }
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_survives_encoding() {
        let cursor = AuditCursor {
            created_at: Utc::now(),
            event_id: Uuid::new_v4().to_string(),
        };
        let encoded = cursor.encode().unwrap();
        assert_eq!(AuditCursor::decode(&encoded).unwrap(), cursor);
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        assert!(matches!(
            AuditCursor::decode("not a cursor"),
            Err(EngineError::InvalidCursor(_))
        ));
    }

    #[test]
    fn empty_allow_lists_are_rejected() {
        let filter = AuditFilter {
            origins: Some(Vec::new()),
            ..AuditFilter::default()
        };
        assert!(validate_audit_filter(&filter).is_err());
    }
}
