use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveValue, ConnectionTrait, DatabaseTransaction, QueryFilter, QueryOrder, TransactionTrait,
    prelude::*,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    ApplyCmd, Currency, EngineError, LegacyProfile, Origin, Profile, ResultEngine,
    locks::{external_id_key, handle_key},
    profile_aliases, profiles,
    util::{clean_handle, normalize_handle, normalize_optional_text, parse_uuid},
};

use super::{Engine, with_tx};

/// A non-null field found only on the profile that lost canonical status; a
/// merge carries it forward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CarriedField {
    pub field: &'static str,
    pub value: String,
}

/// The external id and the handle pointed at different profiles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IdentityConflict {
    /// Canonical: matched by external id.
    pub external_match: Uuid,
    pub handle_match: Uuid,
    pub carried_fields: Vec<CarriedField>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IdentityResolution {
    pub canonical: Profile,
    pub aliases: Vec<String>,
    pub has_duplicates: bool,
    pub duplicates: Vec<Profile>,
    pub conflict: Option<IdentityConflict>,
    /// A new profile was created by this call.
    pub created: bool,
}

pub(super) fn carried_fields(
    canonical: &profiles::Model,
    other: &profiles::Model,
) -> Vec<CarriedField> {
    let mut fields = Vec::new();
    if canonical.character_name.is_none()
        && let Some(value) = &other.character_name
    {
        fields.push(CarriedField {
            field: "character_name",
            value: value.clone(),
        });
    }
    if canonical.external_id.is_none()
        && let Some(value) = &other.external_id
    {
        fields.push(CarriedField {
            field: "external_id",
            value: value.clone(),
        });
    }
    fields
}

fn sort_oldest_first(models: &mut Vec<profiles::Model>) {
    models.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    models.dedup_by(|a, b| a.id == b.id);
}

impl Engine {
    /// Find (or create) the canonical profile for a handle and optional
    /// external id.
    ///
    /// The external id wins over the handle. When both match different
    /// profiles the result carries an [`IdentityConflict`] and the handle
    /// match is listed as a duplicate; nothing is merged here.
    pub async fn resolve(
        &self,
        search_term: &str,
        external_id: Option<&str>,
    ) -> ResultEngine<IdentityResolution> {
        let key = normalize_handle(search_term)
            .ok_or_else(|| EngineError::Validation("handle must not be empty".to_string()))?;
        let shown_handle = clean_handle(search_term);
        let external_id = normalize_optional_text(external_id);

        let mut lock_keys = vec![handle_key(&key)];
        if let Some(external_id) = &external_id {
            lock_keys.push(external_id_key(external_id));
        }
        let _guard = self.locks.acquire(lock_keys).await;
        let now = Utc::now();

        let (canonical, duplicates, conflict, created) = with_tx!(self, |db_tx| {
            async {
                let by_external = match &external_id {
                    Some(external_id) => self.active_by_external_id(&db_tx, external_id).await?,
                    None => Vec::new(),
                };
                let by_handle = self.active_by_handle_key(&db_tx, &key).await?;

                if let Some(found) = by_external.first() {
                    let mut canonical = found.clone();
                    if canonical.handle_key != key {
                        canonical = self
                            .rename_profile(&db_tx, canonical, &shown_handle, &key, now)
                            .await?;
                    }
                    let mut duplicates: Vec<profiles::Model> =
                        by_external.iter().skip(1).cloned().collect();
                    let handle_others: Vec<profiles::Model> = by_handle
                        .into_iter()
                        .filter(|p| p.id != canonical.id)
                        .collect();
                    let conflict = match handle_others.first() {
                        Some(other) => Some(IdentityConflict {
                            external_match: parse_uuid(&canonical.id, "profile")?,
                            handle_match: parse_uuid(&other.id, "profile")?,
                            carried_fields: carried_fields(&canonical, other),
                        }),
                        None => None,
                    };
                    duplicates.extend(handle_others);
                    sort_oldest_first(&mut duplicates);
                    return Ok((canonical, duplicates, conflict, false));
                }

                if let Some(found) = by_handle.first() {
                    match (&external_id, &found.external_id) {
                        (Some(external_id), None) => {
                            let canonical = self
                                .attach_external_id(&db_tx, found.clone(), external_id, now)
                                .await?;
                            let duplicates = by_handle.iter().skip(1).cloned().collect();
                            return Ok((canonical, duplicates, None, false));
                        }
                        (Some(external_id), Some(_)) => {
                            // The handle belongs to another platform account.
                            let canonical = self
                                .insert_profile(
                                    &db_tx,
                                    Uuid::new_v4(),
                                    &shown_handle,
                                    &key,
                                    Some(external_id.clone()),
                                    None,
                                    now,
                                )
                                .await?;
                            return Ok((canonical, by_handle.clone(), None, true));
                        }
                        (None, _) => {
                            let duplicates = by_handle.iter().skip(1).cloned().collect();
                            return Ok((found.clone(), duplicates, None, false));
                        }
                    }
                }

                let canonical = self
                    .insert_profile(
                        &db_tx,
                        Uuid::new_v4(),
                        &shown_handle,
                        &key,
                        external_id.clone(),
                        None,
                        now,
                    )
                    .await?;
                Ok((canonical, Vec::new(), None, true))
            }
            .await
        })?;

        if let Some(conflict) = &conflict {
            tracing::warn!(
                external_match = %conflict.external_match,
                handle_match = %conflict.handle_match,
                handle = %shown_handle,
                "identity conflict: external id and handle match different profiles"
            );
        }
        if created {
            tracing::info!(profile_id = %canonical.id, handle = %shown_handle, "profile created");
        }

        let canonical = self.load_profile(&self.database, canonical).await?;
        let mut duplicate_profiles = Vec::with_capacity(duplicates.len());
        for model in duplicates {
            duplicate_profiles.push(self.load_profile(&self.database, model).await?);
        }
        Ok(IdentityResolution {
            aliases: canonical.alternate_handles.clone(),
            canonical,
            has_duplicates: !duplicate_profiles.is_empty(),
            duplicates: duplicate_profiles,
            conflict,
            created,
        })
    }

    /// Confirm the platform user id of a provisional profile.
    ///
    /// Fails with [`EngineError::ConflictingIdentity`] when another active
    /// profile already owns the id, or this one is bound to a different id.
    pub async fn confirm_external_id(
        &self,
        profile_id: Uuid,
        external_id: &str,
    ) -> ResultEngine<Profile> {
        let external_id = normalize_optional_text(Some(external_id))
            .ok_or_else(|| EngineError::Validation("external id must not be empty".to_string()))?;
        let _guard = self.locks.acquire([external_id_key(&external_id)]).await;
        let now = Utc::now();

        let model = with_tx!(self, |db_tx| {
            async {
                let model = self.require_active_profile(&db_tx, profile_id).await?;
                match model.external_id.as_deref() {
                    Some(current) if current == external_id => return Ok(model),
                    Some(current) => {
                        return Err(EngineError::ConflictingIdentity(format!(
                            "profile {profile_id} is bound to external id {current}"
                        )));
                    }
                    None => {}
                }
                let owners = self.active_by_external_id(&db_tx, &external_id).await?;
                if let Some(owner) = owners.iter().find(|p| p.id != model.id) {
                    return Err(EngineError::ConflictingIdentity(format!(
                        "external id {external_id} belongs to profile {}",
                        owner.id
                    )));
                }
                self.attach_external_id(&db_tx, model, &external_id, now).await
            }
            .await
        })?;
        self.load_profile(&self.database, model).await
    }

    /// Bring a profile over from the previous system together with its
    /// balances.
    ///
    /// The profile id derives from `legacy_id`, so re-importing is a no-op.
    /// No identity matching happens: an imported profile may duplicate one
    /// created by [`Engine::resolve`].
    pub async fn import_legacy_profile(&self, legacy: LegacyProfile) -> ResultEngine<Profile> {
        let legacy_id = legacy.legacy_id.trim().to_string();
        if legacy_id.is_empty() {
            return Err(EngineError::Validation("legacy id must not be empty".to_string()));
        }
        let key = normalize_handle(&legacy.handle)
            .ok_or_else(|| EngineError::Validation("handle must not be empty".to_string()))?;
        if legacy.coins < 0 || legacy.tickets < 0 {
            return Err(EngineError::Validation(
                "legacy balances must be >= 0".to_string(),
            ));
        }
        let shown_handle = clean_handle(&legacy.handle);
        let profile_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("legacy:{legacy_id}").as_bytes());
        let now = Utc::now();

        let inserted = with_tx!(self, |db_tx| {
            async {
                if profiles::Entity::find_by_id(profile_id.to_string())
                    .one(&db_tx)
                    .await?
                    .is_some()
                {
                    return Ok(false);
                }
                self.insert_profile(
                    &db_tx,
                    profile_id,
                    &shown_handle,
                    &key,
                    normalize_optional_text(legacy.external_id.as_deref()),
                    normalize_optional_text(legacy.character_name.as_deref()),
                    now,
                )
                .await?;
                Ok(true)
            }
            .await
        })?;
        if inserted {
            tracing::info!(%profile_id, %legacy_id, handle = %shown_handle, "legacy profile imported");
        }

        for currency in Currency::ALL {
            let amount = legacy.balance(currency);
            if amount == 0 {
                continue;
            }
            let cmd = ApplyCmd::credit(
                profile_id,
                currency,
                amount,
                format!("legacy:{legacy_id}:{}", currency.code()),
                Origin::Legacy,
            )
            .reason("legacy balance import")
            .reference_id(legacy_id.clone());
            self.apply(cmd).await?;
        }

        self.profile(profile_id).await
    }

    /// Active profiles bound to `external_id`, oldest first.
    pub(super) async fn active_by_external_id<C: ConnectionTrait>(
        &self,
        db: &C,
        external_id: &str,
    ) -> ResultEngine<Vec<profiles::Model>> {
        Ok(profiles::Entity::find()
            .filter(profiles::Column::ExternalId.eq(external_id))
            .filter(profiles::Column::Active.eq(true))
            .order_by_asc(profiles::Column::CreatedAt)
            .order_by_asc(profiles::Column::Id)
            .all(db)
            .await?)
    }

    /// Active profiles whose current or alternate handle normalizes to `key`,
    /// oldest first.
    async fn active_by_handle_key<C: ConnectionTrait>(
        &self,
        db: &C,
        key: &str,
    ) -> ResultEngine<Vec<profiles::Model>> {
        let mut found = profiles::Entity::find()
            .filter(profiles::Column::HandleKey.eq(key))
            .filter(profiles::Column::Active.eq(true))
            .all(db)
            .await?;

        let alias_owners: Vec<String> = profile_aliases::Entity::find()
            .filter(profile_aliases::Column::HandleKey.eq(key))
            .all(db)
            .await?
            .into_iter()
            .map(|alias| alias.profile_id)
            .collect();
        if !alias_owners.is_empty() {
            found.extend(
                profiles::Entity::find()
                    .filter(profiles::Column::Id.is_in(alias_owners))
                    .filter(profiles::Column::Active.eq(true))
                    .all(db)
                    .await?,
            );
        }
        sort_oldest_first(&mut found);
        Ok(found)
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_profile(
        &self,
        db_tx: &DatabaseTransaction,
        id: Uuid,
        shown_handle: &str,
        key: &str,
        external_id: Option<String>,
        character_name: Option<String>,
        now: DateTime<Utc>,
    ) -> ResultEngine<profiles::Model> {
        let profile = Profile {
            id,
            provisional: external_id.is_none(),
            external_id,
            handle: shown_handle.to_string(),
            handle_key: key.to_string(),
            alternate_handles: Vec::new(),
            character_name,
            active: true,
            merged_into: None,
            created_at: now,
            updated_at: now,
        };
        Ok(profiles::ActiveModel::from(&profile).insert(db_tx).await?)
    }

    async fn attach_external_id(
        &self,
        db_tx: &DatabaseTransaction,
        model: profiles::Model,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> ResultEngine<profiles::Model> {
        tracing::info!(profile_id = %model.id, external_id, "external id confirmed");
        let mut active: profiles::ActiveModel = model.into();
        active.external_id = ActiveValue::Set(Some(external_id.to_string()));
        active.provisional = ActiveValue::Set(false);
        active.updated_at = ActiveValue::Set(now);
        Ok(active.update(db_tx).await?)
    }

    /// Makes `shown_handle` the current handle and keeps the old one as an alias.
    async fn rename_profile(
        &self,
        db_tx: &DatabaseTransaction,
        model: profiles::Model,
        shown_handle: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> ResultEngine<profiles::Model> {
        self.add_alias(db_tx, &model.id, &model.handle, &model.handle_key, now)
            .await?;
        profile_aliases::Entity::delete_many()
            .filter(profile_aliases::Column::ProfileId.eq(model.id.clone()))
            .filter(profile_aliases::Column::HandleKey.eq(key))
            .exec(db_tx)
            .await?;

        tracing::info!(
            profile_id = %model.id,
            from = %model.handle,
            to = shown_handle,
            "profile handle changed"
        );
        let mut active: profiles::ActiveModel = model.into();
        active.handle = ActiveValue::Set(shown_handle.to_string());
        active.handle_key = ActiveValue::Set(key.to_string());
        active.updated_at = ActiveValue::Set(now);
        Ok(active.update(db_tx).await?)
    }

    pub(super) async fn add_alias(
        &self,
        db_tx: &DatabaseTransaction,
        profile_id: &str,
        handle: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> ResultEngine<()> {
        let exists = profile_aliases::Entity::find_by_id((profile_id.to_string(), key.to_string()))
            .one(db_tx)
            .await?
            .is_some();
        if !exists {
            profile_aliases::ActiveModel {
                profile_id: ActiveValue::Set(profile_id.to_string()),
                handle_key: ActiveValue::Set(key.to_string()),
                handle: ActiveValue::Set(handle.to_string()),
                created_at: ActiveValue::Set(now),
            }
            .insert(db_tx)
            .await?;
        }
        Ok(())
    }
}
