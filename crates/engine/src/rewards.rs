//! Daily streak reward lookup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Currency, StreakConfig};

/// A ledger grant paid for a streak day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    pub currency: Currency,
    pub amount: i64,
}

/// Resolves the reward for a consecutive-day count.
///
/// Lookup order: explicit override for that day, then the every-Nth-day
/// bonus, then the flat base reward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewardTable {
    currency: Currency,
    base: i64,
    bonus_every: u32,
    bonus: i64,
    overrides: BTreeMap<u32, i64>,
}

impl RewardTable {
    pub fn from_config(config: &StreakConfig) -> Self {
        Self {
            currency: config.reward_currency,
            base: config.base_reward,
            bonus_every: config.bonus_every,
            bonus: config.bonus_reward,
            overrides: config
                .overrides
                .iter()
                .map(|o| (o.day, o.amount))
                .collect(),
        }
    }

    pub fn amount_for(&self, day_count: u32) -> i64 {
        if let Some(amount) = self.overrides.get(&day_count) {
            return *amount;
        }
        if self.bonus_every > 0 && day_count > 0 && day_count % self.bonus_every == 0 {
            return self.bonus;
        }
        self.base
    }

    /// `None` when the day pays nothing.
    pub fn reward_for(&self, day_count: u32) -> Option<Reward> {
        let amount = self.amount_for(day_count);
        (amount > 0).then_some(Reward {
            currency: self.currency,
            amount,
        })
    }
}
