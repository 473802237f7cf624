use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use sea_orm::{ConnectionTrait, TransactionTrait, prelude::*};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    ApplyCmd, EngineError, EventStatus, ExternalSyncRecord, Origin, ResultEngine, Reward,
    StreakConfig, StreakRecord,
    locks::{account_key, streak_key},
    streaks,
};

use super::{Engine, with_tx};

const RESTORE_OPERATION: &str = "streak_restore";
const REFUND_OPERATION: &str = "streak_restore_refund";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreakClaim {
    pub day_count: u32,
    /// `None` on a repeat claim or a day that pays nothing.
    pub reward: Option<Reward>,
    pub already_claimed_today: bool,
    pub event_id: Option<Uuid>,
    /// Calendar day of the claim in the streak timezone.
    pub claim_date: NaiveDate,
}

/// Price of buying back a lapsed streak.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RestorationQuote {
    pub missed_days: u32,
    pub cost_per_day: i64,
    pub total_cost: i64,
    /// The count the next claim continues from.
    pub prior_day_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreakStatus {
    pub record: StreakRecord,
    pub today: NaiveDate,
    pub claimable_today: bool,
    pub restoration: Option<RestorationQuote>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RestorationReceipt {
    pub quote: RestorationQuote,
    /// The loyalty points debit.
    pub payment: ExternalSyncRecord,
    pub record: StreakRecord,
}

fn local_date(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

fn previous_day(date: NaiveDate) -> Option<NaiveDate> {
    date.checked_sub_days(Days::new(1))
}

/// `None` when restoration is not on offer for `record` as of `today`.
fn quote_for(
    config: &StreakConfig,
    record: &StreakRecord,
    today: NaiveDate,
) -> Option<RestorationQuote> {
    if !config.restoration_enabled || record.current_day_count == 0 {
        return None;
    }
    let gap = (today - record.last_claim_date?).num_days();
    if gap <= 1 {
        return None;
    }
    let missed_days = u32::try_from(gap - 1).ok()?;
    if config.max_restorable_days.is_some_and(|max| missed_days > max) {
        return None;
    }
    Some(RestorationQuote {
        missed_days,
        cost_per_day: config.restoration_cost_per_day,
        total_cost: i64::from(missed_days).checked_mul(config.restoration_cost_per_day)?,
        prior_day_count: record.current_day_count,
    })
}

/// Next running count for a claim on `today`.
fn next_day_count(record: &StreakRecord, today: NaiveDate) -> u32 {
    match record.last_claim_date {
        Some(last) if Some(last) == previous_day(today) => record.current_day_count + 1,
        _ => 1,
    }
}

impl Engine {
    /// Claim today's streak day and its reward.
    ///
    /// The reward is credited through the ledger with the key
    /// `daily:{user}:{date}` in the same transaction as the streak update. A
    /// repeat claim on the same calendar day changes nothing.
    pub async fn claim_streak(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> ResultEngine<StreakClaim> {
        let config = &self.config.streak;
        let today = local_date(config.timezone, now);
        let reward_account = (user_id, config.reward_currency);
        let _guard = self
            .locks
            .acquire([
                streak_key(user_id),
                account_key(reward_account.0, reward_account.1),
            ])
            .await;

        let claim = with_tx!(self, |db_tx| {
            async {
                self.require_active_profile(&db_tx, user_id).await?;
                let stored = self.find_streak(&db_tx, user_id).await?;
                let exists = stored.is_some();
                let mut record = stored.unwrap_or_else(|| StreakRecord::empty(user_id, now));

                if record.last_claim_date == Some(today) {
                    return Ok(StreakClaim {
                        day_count: record.current_day_count,
                        reward: None,
                        already_claimed_today: true,
                        event_id: None,
                        claim_date: today,
                    });
                }

                let day_count = next_day_count(&record, today);
                let reward = self.rewards.reward_for(day_count);
                let mut event_id = None;
                if let Some(reward) = reward {
                    let cmd = ApplyCmd::credit(
                        user_id,
                        reward.currency,
                        reward.amount,
                        format!("daily:{user_id}:{today}"),
                        Origin::DailyReward,
                    )
                    .reason(format!("streak day {day_count}"));
                    let outcome = self
                        .apply_in_tx(&db_tx, &cmd, (user_id, reward.currency), now)
                        .await?;
                    if outcome.status != EventStatus::Confirmed {
                        return Err(EngineError::Validation(format!(
                            "daily reward for {today} could not be applied"
                        )));
                    }
                    event_id = Some(outcome.event_id);
                }

                record.current_day_count = day_count;
                record.longest_day_count = record.longest_day_count.max(day_count);
                record.total_claims = record.total_claims.saturating_add(1);
                record.last_claim_date = Some(today);
                record.updated_at = now;
                self.save_streak(&db_tx, &record, exists).await?;

                Ok(StreakClaim {
                    day_count,
                    reward,
                    already_claimed_today: false,
                    event_id,
                    claim_date: today,
                })
            }
            .await
        })?;

        if !claim.already_claimed_today {
            tracing::info!(
                %user_id,
                day_count = claim.day_count,
                date = %claim.claim_date,
                reward = claim.reward.map_or(0, |r| r.amount),
                "streak claimed"
            );
        }
        Ok(claim)
    }

    /// Streak record of a profile, whether today can still be claimed, and
    /// the restoration offer if there is one.
    pub async fn streak_status(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> ResultEngine<StreakStatus> {
        self.require_profile(&self.database, user_id).await?;
        let config = &self.config.streak;
        let today = local_date(config.timezone, now);
        let record = self
            .find_streak(&self.database, user_id)
            .await?
            .unwrap_or_else(|| StreakRecord::empty(user_id, now));
        Ok(StreakStatus {
            claimable_today: record.last_claim_date != Some(today),
            restoration: quote_for(config, &record, today),
            record,
            today,
        })
    }

    /// Buy back a lapsed streak with loyalty points.
    ///
    /// `missed_days` and `total_cost` must match the current quote. The
    /// remote balance is read live; the points are then debited through the
    /// sync adapter and only once the debit is acknowledged is the streak
    /// resumed (the next claim continues at the prior count + 1). An
    /// unacknowledged debit is dropped from the retry queue and fails the
    /// restore. If the streak moved on in between, the debit is refunded.
    pub async fn restore_streak(
        &self,
        user_id: Uuid,
        missed_days: u32,
        total_cost: i64,
        now: DateTime<Utc>,
    ) -> ResultEngine<RestorationReceipt> {
        let config = &self.config.streak;
        if !config.restoration_enabled {
            return Err(EngineError::RestorationUnavailable(
                "streak restoration is disabled".to_string(),
            ));
        }
        let today = local_date(config.timezone, now);
        let profile = self.require_active_profile(&self.database, user_id).await?;
        let record = self
            .find_streak(&self.database, user_id)
            .await?
            .unwrap_or_else(|| StreakRecord::empty(user_id, now));
        let quote = quote_for(config, &record, today).ok_or_else(|| {
            EngineError::RestorationUnavailable("no lapsed streak to restore".to_string())
        })?;
        if quote.missed_days != missed_days || quote.total_cost != total_cost {
            return Err(EngineError::Validation(format!(
                "stale quote: restoring {} missed days costs {}",
                quote.missed_days, quote.total_cost
            )));
        }
        let lapsed_on = record.last_claim_date.ok_or_else(|| {
            EngineError::RestorationUnavailable("no lapsed streak to restore".to_string())
        })?;

        // Affordability is decided on a live read, never a cached value.
        let client = self
            .loyalty()
            .map_err(|err| EngineError::BalanceUnavailable(err.to_string()))?
            .clone();
        let available = self
            .remote(client.balance(&profile.handle_key))
            .await
            .map_err(|err| EngineError::BalanceUnavailable(err.to_string()))?;
        if available < quote.total_cost {
            return Err(EngineError::InsufficientBalance(format!(
                "restoration costs {} points, {available} available",
                quote.total_cost
            )));
        }

        let reference_id = format!("restore:{user_id}:{lapsed_on}");
        let payment = self
            .sync_external_points(
                &profile.handle_key,
                -quote.total_cost,
                RESTORE_OPERATION,
                &reference_id,
            )
            .await?;
        if !payment.success {
            self.abandon_sync(&payment, "restoration not paid").await?;
            // A submit that errored may still have landed.
            let landed = match payment
                .balance_before
                .and_then(|before| before.checked_sub(quote.total_cost))
            {
                Some(expected) => matches!(
                    self.remote(client.balance(&profile.handle_key)).await,
                    Ok(current) if current == expected
                ),
                None => false,
            };
            if landed {
                self.sync_external_points(
                    &profile.handle_key,
                    quote.total_cost,
                    REFUND_OPERATION,
                    &reference_id,
                )
                .await?;
            }
            tracing::warn!(
                %user_id,
                %reference_id,
                refunded = landed,
                "restoration debit not acknowledged; streak stays lapsed"
            );
            return Err(EngineError::ExternalSyncFailure(format!(
                "restoration debit was not acknowledged: {}",
                payment.error_message.as_deref().unwrap_or("no response")
            )));
        }

        let resumed_on = previous_day(today)
            .ok_or_else(|| EngineError::Validation("date out of range".to_string()))?;
        let _guard = self.locks.acquire([streak_key(user_id)]).await;
        let resumed = with_tx!(self, |db_tx| {
            async {
                let Some(mut current) = self.find_streak(&db_tx, user_id).await? else {
                    return Ok(None);
                };
                let unchanged = current.last_claim_date == Some(lapsed_on)
                    && current.current_day_count == quote.prior_day_count;
                let already_resumed = current.last_claim_date == Some(resumed_on)
                    && current.current_day_count == quote.prior_day_count
                    && current.restored_at.is_some();
                if already_resumed {
                    return Ok(Some(current));
                }
                if !unchanged {
                    return Ok(None);
                }
                current.last_claim_date = Some(resumed_on);
                current.restored_at = Some(now);
                current.updated_at = now;
                self.save_streak(&db_tx, &current, true).await?;
                Ok(Some(current))
            }
            .await
        })?;

        let Some(record) = resumed else {
            tracing::warn!(%user_id, %reference_id, "streak changed during restoration; refunding");
            self.sync_external_points(
                &profile.handle_key,
                quote.total_cost,
                REFUND_OPERATION,
                &reference_id,
            )
            .await?;
            return Err(EngineError::RestorationUnavailable(
                "streak changed during restoration; points refunded".to_string(),
            ));
        };

        tracing::info!(
            %user_id,
            missed_days = quote.missed_days,
            total_cost = quote.total_cost,
            prior_day_count = quote.prior_day_count,
            "streak restored"
        );
        Ok(RestorationReceipt {
            quote,
            payment,
            record,
        })
    }

    async fn find_streak<C: ConnectionTrait>(
        &self,
        db: &C,
        user_id: Uuid,
    ) -> ResultEngine<Option<StreakRecord>> {
        streaks::Entity::find_by_id(user_id.to_string())
            .one(db)
            .await?
            .map(StreakRecord::try_from)
            .transpose()
    }

    async fn save_streak<C: ConnectionTrait>(
        &self,
        db: &C,
        record: &StreakRecord,
        exists: bool,
    ) -> ResultEngine<()> {
        let model = streaks::ActiveModel::from(record);
        if exists {
            model.update(db).await?;
        } else {
            model.insert(db).await?;
        }
        Ok(())
    }
}
