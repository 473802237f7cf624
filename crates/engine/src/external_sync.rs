//! External sync records.
//!
//! One row per attempt at mirroring a points delta to the loyalty service.
//! An *operation* is identified by `(handle, operation_type, reference_id)`;
//! its attempts are numbered from 1. A row is stored flagged for
//! reprocessing before its first remote call and completed in place once the
//! attempt finishes. When a later attempt supersedes one, only
//! `requires_reprocessing` and `reprocessed_at` of the older row change.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, util::parse_uuid};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSyncRecord {
    pub id: Uuid,
    pub handle: String,
    pub operation_type: String,
    pub reference_id: String,
    pub points_delta: i64,
    pub attempt: u32,
    /// The remote side acknowledged the delta.
    pub success: bool,
    pub balance_before: Option<i64>,
    pub balance_after: Option<i64>,
    /// The remote balance was observed at `balance_before + points_delta`.
    pub verified: bool,
    /// Cumulative unverified balance re-reads for this operation.
    pub verification_attempts: u32,
    pub requires_reprocessing: bool,
    pub error_message: Option<String>,
    pub reprocessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "external_sync_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub handle: String,
    pub operation_type: String,
    pub reference_id: String,
    pub points_delta: i64,
    pub attempt: i32,
    pub success: bool,
    pub balance_before: Option<i64>,
    pub balance_after: Option<i64>,
    pub verified: bool,
    pub verification_attempts: i32,
    pub requires_reprocessing: bool,
    pub error_message: Option<String>,
    pub reprocessed_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<&ExternalSyncRecord> for ActiveModel {
    fn from(record: &ExternalSyncRecord) -> Self {
        Self {
            id: ActiveValue::Set(record.id.to_string()),
            handle: ActiveValue::Set(record.handle.clone()),
            operation_type: ActiveValue::Set(record.operation_type.clone()),
            reference_id: ActiveValue::Set(record.reference_id.clone()),
            points_delta: ActiveValue::Set(record.points_delta),
            attempt: ActiveValue::Set(i32::try_from(record.attempt).unwrap_or(i32::MAX)),
            success: ActiveValue::Set(record.success),
            balance_before: ActiveValue::Set(record.balance_before),
            balance_after: ActiveValue::Set(record.balance_after),
            verified: ActiveValue::Set(record.verified),
            verification_attempts: ActiveValue::Set(
                i32::try_from(record.verification_attempts).unwrap_or(i32::MAX),
            ),
            requires_reprocessing: ActiveValue::Set(record.requires_reprocessing),
            error_message: ActiveValue::Set(record.error_message.clone()),
            reprocessed_at: ActiveValue::Set(record.reprocessed_at),
            created_at: ActiveValue::Set(record.created_at),
        }
    }
}

impl TryFrom<Model> for ExternalSyncRecord {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&model.id, "sync record")?,
            handle: model.handle,
            operation_type: model.operation_type,
            reference_id: model.reference_id,
            points_delta: model.points_delta,
            attempt: u32::try_from(model.attempt).unwrap_or_default(),
            success: model.success,
            balance_before: model.balance_before,
            balance_after: model.balance_after,
            verified: model.verified,
            verification_attempts: u32::try_from(model.verification_attempts)
                .unwrap_or_default(),
            requires_reprocessing: model.requires_reprocessing,
            error_message: model.error_message,
            reprocessed_at: model.reprocessed_at,
            created_at: model.created_at,
        })
    }
}
