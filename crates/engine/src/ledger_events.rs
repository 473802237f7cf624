//! Ledger events.
//!
//! A [`LedgerEvent`] is the immutable record of one balance change on one
//! account. Its `idempotency_key` is globally unique: a caller replaying the
//! same key gets the stored event back instead of a second application.
//!
//! Amounts are signed integers:
//! - positive values credit the account
//! - negative values debit it, and are rejected if the balance would go below 0

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Currency, EngineError, util::parse_uuid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Recorded, not yet applied to the balance.
    Pending,
    /// Applied; the balance includes this delta.
    Confirmed,
    /// Rejected; the balance was not touched.
    Failed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }
}

impl TryFrom<&str> for EventStatus {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(EngineError::Validation(format!(
                "invalid event status: {other}"
            ))),
        }
    }
}

/// Which part of the portal caused a balance change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Wheel,
    Raffle,
    DailyReward,
    WordGame,
    Admin,
    /// Written only by profile merges.
    Consolidation,
    /// Balances carried over from the previous system.
    Legacy,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wheel => "wheel",
            Self::Raffle => "raffle",
            Self::DailyReward => "daily_reward",
            Self::WordGame => "word_game",
            Self::Admin => "admin",
            Self::Consolidation => "consolidation",
            Self::Legacy => "legacy",
        }
    }
}

impl TryFrom<&str> for Origin {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "wheel" => Ok(Self::Wheel),
            "raffle" => Ok(Self::Raffle),
            "daily_reward" => Ok(Self::DailyReward),
            "word_game" => Ok(Self::WordGame),
            "admin" => Ok(Self::Admin),
            "consolidation" => Ok(Self::Consolidation),
            "legacy" => Ok(Self::Legacy),
            other => Err(EngineError::Validation(format!("invalid origin: {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub currency: Currency,
    pub delta: i64,
    pub reason: String,
    pub origin: Origin,
    pub idempotency_key: String,
    pub status: EventStatus,
    pub retries: u32,
    /// Account balance right after this event was last attempted.
    pub balance_after: Option<i64>,
    pub error_message: Option<String>,
    pub reference_id: Option<String>,
    /// Set when a merge re-attributed this event from another profile.
    pub original_user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "ledger_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    pub currency: String,
    pub delta: i64,
    pub reason: String,
    pub origin: String,
    #[sea_orm(unique)]
    pub idempotency_key: String,
    pub status: String,
    pub retries: i32,
    pub balance_after: Option<i64>,
    pub error_message: Option<String>,
    pub reference_id: Option<String>,
    pub original_user_id: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::profiles::Entity",
        from = "Column::UserId",
        to = "super::profiles::Column::Id",
        on_update = "NoAction",
        on_delete = "NoAction"
    )]
    Profiles,
}

impl Related<super::profiles::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Profiles.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<&LedgerEvent> for ActiveModel {
    fn from(event: &LedgerEvent) -> Self {
        Self {
            id: ActiveValue::Set(event.id.to_string()),
            user_id: ActiveValue::Set(event.user_id.to_string()),
            currency: ActiveValue::Set(event.currency.code().to_string()),
            delta: ActiveValue::Set(event.delta),
            reason: ActiveValue::Set(event.reason.clone()),
            origin: ActiveValue::Set(event.origin.as_str().to_string()),
            idempotency_key: ActiveValue::Set(event.idempotency_key.clone()),
            status: ActiveValue::Set(event.status.as_str().to_string()),
            retries: ActiveValue::Set(i32::try_from(event.retries).unwrap_or(i32::MAX)),
            balance_after: ActiveValue::Set(event.balance_after),
            error_message: ActiveValue::Set(event.error_message.clone()),
            reference_id: ActiveValue::Set(event.reference_id.clone()),
            original_user_id: ActiveValue::Set(event.original_user_id.map(|id| id.to_string())),
            created_at: ActiveValue::Set(event.created_at),
            updated_at: ActiveValue::Set(event.updated_at),
        }
    }
}

impl TryFrom<Model> for LedgerEvent {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&model.id, "ledger event")?,
            user_id: parse_uuid(&model.user_id, "user")?,
            currency: Currency::try_from(model.currency.as_str())?,
            delta: model.delta,
            reason: model.reason,
            origin: Origin::try_from(model.origin.as_str())?,
            idempotency_key: model.idempotency_key,
            status: EventStatus::try_from(model.status.as_str())?,
            retries: u32::try_from(model.retries).unwrap_or_default(),
            balance_after: model.balance_after,
            error_message: model.error_message,
            reference_id: model.reference_id,
            original_user_id: model
                .original_user_id
                .as_deref()
                .map(|id| parse_uuid(id, "user"))
                .transpose()?,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}
