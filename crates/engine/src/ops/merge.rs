use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveValue, ConnectionTrait, DatabaseTransaction, QueryFilter, QueryOrder, Statement,
    TransactionTrait, prelude::*,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    ApplyCmd, Currency, EngineError, EventStatus, Origin, Profile, ResultEngine, StreakRecord,
    locks::{account_key, streak_key},
    profile_aliases, profiles, streaks,
};

use super::{CarriedField, Engine, identity::carried_fields, with_tx};

/// Balances of one currency before and after a merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CurrencyMergeLine {
    pub currency: Currency,
    pub canonical_before: i64,
    pub duplicate_before: i64,
    pub after: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergePreview {
    pub canonical: Profile,
    pub duplicate: Profile,
    pub lines: Vec<CurrencyMergeLine>,
    pub carried_fields: Vec<CarriedField>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Reference id of the consolidation events.
    pub merge_id: Uuid,
    pub canonical_id: Uuid,
    pub duplicate_id: Uuid,
    pub lines: Vec<CurrencyMergeLine>,
    /// Duplicate events now attributed to the canonical profile.
    pub events_reparented: u64,
    pub carried_fields: Vec<CarriedField>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum MergeOutcome {
    Preview(MergePreview),
    Executed(MergeReport),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum DuplicateKey {
    ExternalId(String),
    Handle(String),
}

/// Active profiles sharing an identity key, oldest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub key: DuplicateKey,
    pub profiles: Vec<Profile>,
}

/// Streak state of the canonical profile after absorbing the duplicate's.
///
/// The record with the later claim date keeps its running count; the best
/// streak and the claim total combine.
fn combine_streaks(
    canonical: StreakRecord,
    duplicate: StreakRecord,
    now: DateTime<Utc>,
) -> StreakRecord {
    let user_id = canonical.user_id;
    let (winner, other) = if duplicate.last_claim_date > canonical.last_claim_date {
        (duplicate, canonical)
    } else {
        (canonical, duplicate)
    };
    StreakRecord {
        user_id,
        current_day_count: winner.current_day_count,
        longest_day_count: winner.longest_day_count.max(other.longest_day_count),
        total_claims: winner.total_claims.saturating_add(other.total_claims),
        last_claim_date: winner.last_claim_date,
        restored_at: winner.restored_at,
        updated_at: now,
    }
}

fn check_merge_pair(
    canonical: &profiles::Model,
    duplicate: &profiles::Model,
) -> ResultEngine<()> {
    if !duplicate.active {
        return Err(EngineError::MergeAlreadyProcessed(format!(
            "profile {} was already merged into {}",
            duplicate.id,
            duplicate.merged_into.as_deref().unwrap_or("unknown")
        )));
    }
    if !canonical.active {
        return Err(EngineError::Validation(format!(
            "canonical profile {} is inactive",
            canonical.id
        )));
    }
    Ok(())
}

impl Engine {
    /// Fold `duplicate_id` into `canonical_id`.
    ///
    /// With `dry_run` nothing is written and the per-currency result is
    /// previewed. Otherwise, in one transaction:
    /// - each non-zero duplicate balance moves over as a `consolidation`
    ///   event pair (debit on the duplicate, credit on the canonical)
    /// - every duplicate event is re-attributed to the canonical profile,
    ///   keeping the duplicate id in `original_user_id`
    /// - handles, missing profile fields and streak state carry over
    /// - the duplicate is deactivated and points at the canonical profile
    pub async fn merge_profiles(
        &self,
        canonical_id: Uuid,
        duplicate_id: Uuid,
        dry_run: bool,
    ) -> ResultEngine<MergeOutcome> {
        if canonical_id == duplicate_id {
            return Err(EngineError::Validation(
                "cannot merge a profile into itself".to_string(),
            ));
        }
        if dry_run {
            return self
                .preview_merge(canonical_id, duplicate_id)
                .await
                .map(MergeOutcome::Preview);
        }
        self.execute_merge(canonical_id, duplicate_id)
            .await
            .map(MergeOutcome::Executed)
    }

    async fn preview_merge(
        &self,
        canonical_id: Uuid,
        duplicate_id: Uuid,
    ) -> ResultEngine<MergePreview> {
        let canonical = self.require_profile(&self.database, canonical_id).await?;
        let duplicate = self.require_profile(&self.database, duplicate_id).await?;
        check_merge_pair(&canonical, &duplicate)?;

        let mut lines = Vec::with_capacity(Currency::ALL.len());
        for currency in Currency::ALL {
            let canonical_before = self.balance_in(&self.database, canonical_id, currency).await?;
            let duplicate_before = self.balance_in(&self.database, duplicate_id, currency).await?;
            lines.push(CurrencyMergeLine {
                currency,
                canonical_before,
                duplicate_before,
                after: canonical_before + duplicate_before,
            });
        }
        let carried_fields = carried_fields(&canonical, &duplicate);
        Ok(MergePreview {
            canonical: self.load_profile(&self.database, canonical).await?,
            duplicate: self.load_profile(&self.database, duplicate).await?,
            lines,
            carried_fields,
        })
    }

    async fn execute_merge(
        &self,
        canonical_id: Uuid,
        duplicate_id: Uuid,
    ) -> ResultEngine<MergeReport> {
        let mut keys = Vec::new();
        for id in [canonical_id, duplicate_id] {
            keys.extend(Currency::ALL.map(|c| account_key(id, c)));
            keys.push(streak_key(id));
        }
        let _guard = self.locks.acquire(keys).await;
        let now = Utc::now();
        let merge_id = Uuid::new_v4();

        let report = with_tx!(self, |db_tx| {
            async {
                let canonical = self.require_profile(&db_tx, canonical_id).await?;
                let duplicate = self.require_profile(&db_tx, duplicate_id).await?;
                check_merge_pair(&canonical, &duplicate)?;

                let mut lines = Vec::with_capacity(Currency::ALL.len());
                for currency in Currency::ALL {
                    let canonical_before =
                        self.lock_account(&db_tx, canonical_id, currency, now).await?;
                    let duplicate_before =
                        self.lock_account(&db_tx, duplicate_id, currency, now).await?;
                    if duplicate_before > 0 {
                        self.consolidate(
                            &db_tx,
                            merge_id,
                            duplicate_id,
                            canonical_id,
                            currency,
                            duplicate_before,
                            now,
                        )
                        .await?;
                    }
                    lines.push(CurrencyMergeLine {
                        currency,
                        canonical_before,
                        duplicate_before,
                        after: canonical_before + duplicate_before,
                    });
                }

                let events_reparented =
                    self.reparent_events(&db_tx, duplicate_id, canonical_id).await?;
                self.carry_handles(&db_tx, &canonical, &duplicate, now).await?;
                let carried_fields = carried_fields(&canonical, &duplicate);
                self.carry_fields(&db_tx, canonical, &carried_fields, now)
                    .await?;
                self.merge_streaks(&db_tx, canonical_id, duplicate_id, now)
                    .await?;

                let mut retired: profiles::ActiveModel = duplicate.into();
                retired.active = ActiveValue::Set(false);
                retired.merged_into = ActiveValue::Set(Some(canonical_id.to_string()));
                retired.updated_at = ActiveValue::Set(now);
                retired.update(&db_tx).await?;

                Ok(MergeReport {
                    merge_id,
                    canonical_id,
                    duplicate_id,
                    lines,
                    events_reparented,
                    carried_fields,
                })
            }
            .await
        })?;

        tracing::info!(
            %merge_id,
            canonical = %canonical_id,
            duplicate = %duplicate_id,
            events_reparented = report.events_reparented,
            "profiles merged"
        );
        Ok(report)
    }

    /// The consolidation pair for one currency.
    #[allow(clippy::too_many_arguments)]
    async fn consolidate(
        &self,
        db_tx: &DatabaseTransaction,
        merge_id: Uuid,
        from: Uuid,
        to: Uuid,
        currency: Currency,
        amount: i64,
        now: DateTime<Utc>,
    ) -> ResultEngine<()> {
        let reason = format!("merge of {from} into {to}");
        let out = ApplyCmd::debit(
            from,
            currency,
            amount,
            format!("merge:{merge_id}:{}:out", currency.code()),
            Origin::Consolidation,
        )
        .reason(reason.clone())
        .reference_id(merge_id.to_string());
        let into = ApplyCmd::credit(
            to,
            currency,
            amount,
            format!("merge:{merge_id}:{}:in", currency.code()),
            Origin::Consolidation,
        )
        .reason(reason)
        .reference_id(merge_id.to_string());

        for (cmd, account) in [(out, (from, currency)), (into, (to, currency))] {
            let outcome = self.apply_in_tx(db_tx, &cmd, account, now).await?;
            if outcome.status != EventStatus::Confirmed {
                return Err(EngineError::InsufficientBalance(
                    outcome
                        .error_message
                        .unwrap_or_else(|| "consolidation could not be applied".to_string()),
                ));
            }
        }
        Ok(())
    }

    /// Moves every event of `from` to `to`, remembering the first owner.
    async fn reparent_events(
        &self,
        db_tx: &DatabaseTransaction,
        from: Uuid,
        to: Uuid,
    ) -> ResultEngine<u64> {
        let backend = db_tx.get_database_backend();
        db_tx
            .execute(Statement::from_sql_and_values(
                backend,
                "UPDATE ledger_events SET original_user_id = ? \
                 WHERE user_id = ? AND original_user_id IS NULL;",
                vec![from.to_string().into(), from.to_string().into()],
            ))
            .await?;
        let moved = db_tx
            .execute(Statement::from_sql_and_values(
                backend,
                "UPDATE ledger_events SET user_id = ? WHERE user_id = ?;",
                vec![to.to_string().into(), from.to_string().into()],
            ))
            .await?;
        Ok(moved.rows_affected())
    }

    async fn carry_handles(
        &self,
        db_tx: &DatabaseTransaction,
        canonical: &profiles::Model,
        duplicate: &profiles::Model,
        now: DateTime<Utc>,
    ) -> ResultEngine<()> {
        let aliases = profile_aliases::Entity::find()
            .filter(profile_aliases::Column::ProfileId.eq(duplicate.id.clone()))
            .order_by_asc(profile_aliases::Column::CreatedAt)
            .all(db_tx)
            .await?;
        let handles = std::iter::once((duplicate.handle.clone(), duplicate.handle_key.clone()))
            .chain(aliases.into_iter().map(|a| (a.handle, a.handle_key)));
        for (handle, key) in handles {
            if key != canonical.handle_key {
                self.add_alias(db_tx, &canonical.id, &handle, &key, now)
                    .await?;
            }
        }
        Ok(())
    }

    async fn carry_fields(
        &self,
        db_tx: &DatabaseTransaction,
        canonical: profiles::Model,
        fields: &[CarriedField],
        now: DateTime<Utc>,
    ) -> ResultEngine<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut active: profiles::ActiveModel = canonical.into();
        for field in fields {
            match field.field {
                "character_name" => {
                    active.character_name = ActiveValue::Set(Some(field.value.clone()));
                }
                "external_id" => {
                    active.external_id = ActiveValue::Set(Some(field.value.clone()));
                    active.provisional = ActiveValue::Set(false);
                }
                _ => {}
            }
        }
        active.updated_at = ActiveValue::Set(now);
        active.update(db_tx).await?;
        Ok(())
    }

    async fn merge_streaks(
        &self,
        db_tx: &DatabaseTransaction,
        canonical_id: Uuid,
        duplicate_id: Uuid,
        now: DateTime<Utc>,
    ) -> ResultEngine<()> {
        let Some(duplicate) = streaks::Entity::find_by_id(duplicate_id.to_string())
            .one(db_tx)
            .await?
        else {
            return Ok(());
        };
        let duplicate = StreakRecord::try_from(duplicate)?;
        let existing = streaks::Entity::find_by_id(canonical_id.to_string())
            .one(db_tx)
            .await?;

        streaks::Entity::delete_by_id(duplicate_id.to_string())
            .exec(db_tx)
            .await?;
        match existing {
            None => {
                let moved = StreakRecord {
                    user_id: canonical_id,
                    updated_at: now,
                    ..duplicate
                };
                streaks::ActiveModel::from(&moved).insert(db_tx).await?;
            }
            Some(existing) => {
                let combined = combine_streaks(StreakRecord::try_from(existing)?, duplicate, now);
                streaks::ActiveModel::from(&combined).update(db_tx).await?;
            }
        }
        Ok(())
    }

    /// Active profiles grouped by external id and by normalized handle; only
    /// groups with more than one member are returned.
    pub async fn find_duplicate_groups(&self) -> ResultEngine<Vec<DuplicateGroup>> {
        let active = profiles::Entity::find()
            .filter(profiles::Column::Active.eq(true))
            .order_by_asc(profiles::Column::CreatedAt)
            .order_by_asc(profiles::Column::Id)
            .all(&self.database)
            .await?;

        let mut groups: BTreeMap<DuplicateKey, Vec<profiles::Model>> = BTreeMap::new();
        for model in active {
            if let Some(external_id) = &model.external_id {
                groups
                    .entry(DuplicateKey::ExternalId(external_id.clone()))
                    .or_default()
                    .push(model.clone());
            }
            groups
                .entry(DuplicateKey::Handle(model.handle_key.clone()))
                .or_default()
                .push(model);
        }

        let mut out = Vec::new();
        for (key, members) in groups {
            if members.len() < 2 {
                continue;
            }
            let mut profiles = Vec::with_capacity(members.len());
            for model in members {
                profiles.push(self.load_profile(&self.database, model).await?);
            }
            out.push(DuplicateGroup { key, profiles });
        }
        Ok(out)
    }

    /// Merges every group of active profiles sharing an external id into its
    /// oldest member. Handle-only groups are left for an operator.
    pub async fn fix_up_external_id_duplicates(&self) -> ResultEngine<Vec<MergeReport>> {
        let mut reports = Vec::new();
        for group in self.find_duplicate_groups().await? {
            let DuplicateKey::ExternalId(external_id) = &group.key else {
                continue;
            };
            let Some((canonical, rest)) = group.profiles.split_first() else {
                continue;
            };
            for duplicate in rest {
                tracing::info!(
                    %external_id,
                    canonical = %canonical.id,
                    duplicate = %duplicate.id,
                    "auto-merging external id duplicate"
                );
                reports.push(self.execute_merge(canonical.id, duplicate.id).await?);
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn record(
        user: u128,
        count: u32,
        longest: u32,
        claims: u32,
        last: Option<(i32, u32, u32)>,
    ) -> StreakRecord {
        StreakRecord {
            user_id: Uuid::from_u128(user),
            current_day_count: count,
            longest_day_count: longest,
            total_claims: claims,
            last_claim_date: last.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            restored_at: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn later_claim_keeps_running_count() {
        let canonical = record(1, 3, 8, 20, Some((2026, 3, 1)));
        let duplicate = record(2, 5, 5, 6, Some((2026, 3, 4)));
        let combined = combine_streaks(canonical, duplicate, Utc::now());
        assert_eq!(combined.current_day_count, 5);
        assert_eq!(combined.longest_day_count, 8);
        assert_eq!(combined.total_claims, 26);
        assert_eq!(combined.last_claim_date, NaiveDate::from_ymd_opt(2026, 3, 4));
    }

    #[test]
    fn combined_record_belongs_to_canonical() {
        let canonical = record(1, 1, 1, 1, None);
        let duplicate = record(2, 4, 4, 4, Some((2026, 3, 4)));
        let combined = combine_streaks(canonical, duplicate, Utc::now());
        assert_eq!(combined.user_id, Uuid::from_u128(1));
        assert_eq!(combined.current_day_count, 4);
    }

    #[test]
    fn tie_keeps_canonical_count() {
        let canonical = record(1, 2, 2, 2, Some((2026, 3, 4)));
        let duplicate = record(2, 7, 7, 7, Some((2026, 3, 4)));
        let combined = combine_streaks(canonical, duplicate, Utc::now());
        assert_eq!(combined.current_day_count, 2);
        assert_eq!(combined.longest_day_count, 7);
    }
}
