//! Viewer profiles.
//!
//! A profile is the canonical owner of ledger accounts. Profiles are created
//! lazily on first identity contact and never deleted: a merged duplicate is
//! kept with `active = false` and `merged_into` pointing at the survivor.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, util::parse_uuid};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    /// Platform user id; the strongest identity signal when present.
    pub external_id: Option<String>,
    /// Display handle as last seen.
    pub handle: String,
    /// Normalized handle used for lookups.
    pub handle_key: String,
    pub alternate_handles: Vec<String>,
    pub character_name: Option<String>,
    pub active: bool,
    /// True until an external id has been confirmed for this profile.
    pub provisional: bool,
    pub merged_into: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "profiles")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub external_id: Option<String>,
    pub handle: String,
    pub handle_key: String,
    pub character_name: Option<String>,
    pub active: bool,
    pub provisional: bool,
    pub merged_into: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::profile_aliases::Entity")]
    ProfileAliases,
    #[sea_orm(has_many = "super::accounts::Entity")]
    Accounts,
    #[sea_orm(has_many = "super::ledger_events::Entity")]
    LedgerEvents,
}

impl Related<super::profile_aliases::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProfileAliases.def()
    }
}

impl Related<super::accounts::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Accounts.def()
    }
}

impl Related<super::ledger_events::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LedgerEvents.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<&Profile> for ActiveModel {
    fn from(profile: &Profile) -> Self {
        Self {
            id: ActiveValue::Set(profile.id.to_string()),
            external_id: ActiveValue::Set(profile.external_id.clone()),
            handle: ActiveValue::Set(profile.handle.clone()),
            handle_key: ActiveValue::Set(profile.handle_key.clone()),
            character_name: ActiveValue::Set(profile.character_name.clone()),
            active: ActiveValue::Set(profile.active),
            provisional: ActiveValue::Set(profile.provisional),
            merged_into: ActiveValue::Set(profile.merged_into.map(|id| id.to_string())),
            created_at: ActiveValue::Set(profile.created_at),
            updated_at: ActiveValue::Set(profile.updated_at),
        }
    }
}

impl TryFrom<Model> for Profile {
    type Error = EngineError;

    /// Converts the row alone; `alternate_handles` is filled by the caller.
    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&model.id, "profile")?,
            external_id: model.external_id,
            handle: model.handle,
            handle_key: model.handle_key,
            alternate_handles: Vec::new(),
            character_name: model.character_name,
            active: model.active,
            provisional: model.provisional,
            merged_into: model
                .merged_into
                .as_deref()
                .map(|id| parse_uuid(id, "profile"))
                .transpose()?,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}
