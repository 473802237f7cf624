//! Daily streak state, one row per profile.

use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, util::parse_uuid};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakRecord {
    pub user_id: Uuid,
    pub current_day_count: u32,
    pub longest_day_count: u32,
    pub total_claims: u32,
    /// Calendar date of the last claim, in the configured streak timezone.
    pub last_claim_date: Option<NaiveDate>,
    pub restored_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StreakRecord {
    pub(crate) fn empty(user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            current_day_count: 0,
            longest_day_count: 0,
            total_claims: 0,
            last_claim_date: None,
            restored_at: None,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "streaks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_id: String,
    pub current_day_count: i32,
    pub longest_day_count: i32,
    pub total_claims: i32,
    pub last_claim_date: Option<Date>,
    pub restored_at: Option<DateTimeUtc>,
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

fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl From<&StreakRecord> for ActiveModel {
    fn from(record: &StreakRecord) -> Self {
        Self {
            user_id: ActiveValue::Set(record.user_id.to_string()),
            current_day_count: ActiveValue::Set(to_db_count(record.current_day_count)),
            longest_day_count: ActiveValue::Set(to_db_count(record.longest_day_count)),
            total_claims: ActiveValue::Set(to_db_count(record.total_claims)),
            last_claim_date: ActiveValue::Set(record.last_claim_date),
            restored_at: ActiveValue::Set(record.restored_at),
            updated_at: ActiveValue::Set(record.updated_at),
        }
    }
}

impl TryFrom<Model> for StreakRecord {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: parse_uuid(&model.user_id, "user")?,
            current_day_count: u32::try_from(model.current_day_count).unwrap_or_default(),
            longest_day_count: u32::try_from(model.longest_day_count).unwrap_or_default(),
            total_claims: u32::try_from(model.total_claims).unwrap_or_default(),
            last_claim_date: model.last_claim_date,
            restored_at: model.restored_at,
            updated_at: model.updated_at,
        })
    }
}
