//! Engine tuning knobs.
//!
//! Every section deserializes with defaults, so an empty table (or no table at
//! all) yields a working configuration.

use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;

use crate::{Currency, EngineError, ResultEngine};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sync: SyncConfig,
    pub reconcile: ReconcileConfig,
    pub streak: StreakConfig,
}

impl EngineConfig {
    pub(crate) fn validate(&self) -> ResultEngine<()> {
        if self.sync.timeout_ms == 0 {
            return Err(EngineError::Validation(
                "sync.timeout_ms must be > 0".to_string(),
            ));
        }
        if self.sync.verification_polls == 0 {
            return Err(EngineError::Validation(
                "sync.verification_polls must be > 0".to_string(),
            ));
        }
        if self.sync.max_verification_attempts < self.sync.verification_polls {
            return Err(EngineError::Validation(
                "sync.max_verification_attempts must be >= sync.verification_polls".to_string(),
            ));
        }
        if self.streak.base_reward < 0 || self.streak.bonus_reward < 0 {
            return Err(EngineError::Validation(
                "streak rewards must be >= 0".to_string(),
            ));
        }
        if let Some(bad) = self.streak.overrides.iter().find(|o| o.day == 0 || o.amount < 0) {
            return Err(EngineError::Validation(format!(
                "invalid streak override for day {}",
                bad.day
            )));
        }
        if self.streak.restoration_cost_per_day <= 0 {
            return Err(EngineError::Validation(
                "streak.restoration_cost_per_day must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// External loyalty sync behaviour.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound for every single remote call.
    pub timeout_ms: u64,
    /// Balance re-reads performed per attempt while waiting for the remote
    /// side to reflect a submitted delta.
    pub verification_polls: u32,
    /// Pause between verification re-reads.
    pub verification_delay_ms: u64,
    /// Cumulative unverified re-reads after which an operation is escalated to
    /// `requires_reprocessing`.
    pub max_verification_attempts: u32,
}

impl SyncConfig {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub(crate) fn verification_delay(&self) -> Duration {
        Duration::from_millis(self.verification_delay_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            verification_polls: 3,
            verification_delay_ms: 750,
            max_verification_attempts: 9,
        }
    }
}

/// Reconciliation sweep behaviour.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Records younger than this are left alone by the sweep.
    pub grace_secs: u64,
    /// Automatic retries per ledger event or sync operation.
    pub max_retries: u32,
    /// Period of the background sweep in the daemon.
    pub interval_secs: u64,
    /// Max records of each kind handled per sweep.
    pub batch_size: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            grace_secs: 120,
            max_retries: 5,
            interval_secs: 60,
            batch_size: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RewardOverride {
    pub day: u32,
    pub amount: i64,
}

/// Daily streak rules.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreakConfig {
    /// IANA zone that defines where a calendar day starts.
    pub timezone: Tz,
    pub reward_currency: Currency,
    pub base_reward: i64,
    /// Every `bonus_every`-th consecutive day pays `bonus_reward` (0 disables).
    pub bonus_every: u32,
    pub bonus_reward: i64,
    /// Sparse day -> amount table, checked before the bonus rule.
    pub overrides: Vec<RewardOverride>,
    pub restoration_enabled: bool,
    /// Loyalty points charged per missed day.
    pub restoration_cost_per_day: i64,
    /// Longest gap (in missed days) that may still be bought back.
    pub max_restorable_days: Option<u32>,
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            reward_currency: Currency::Coins,
            base_reward: 10,
            bonus_every: 5,
            bonus_reward: 50,
            overrides: Vec::new(),
            restoration_enabled: true,
            restoration_cost_per_day: 200,
            max_restorable_days: Some(30),
        }
    }
}
