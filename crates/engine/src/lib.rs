//! Ledger and identity-reconciliation engine for the rewards portal.
//!
//! The engine owns the Coins/Tickets ledger, mirrors point grants to the
//! remote loyalty service, resolves and merges viewer identities, and runs the
//! daily streak. Every entry point lives on [`Engine`].

pub use commands::{ApplyCmd, LegacyProfile};
pub use config::{EngineConfig, ReconcileConfig, RewardOverride, StreakConfig, SyncConfig};
pub use currency::Currency;
pub use error::EngineError;
pub use external_sync::ExternalSyncRecord;
pub use ledger_events::{EventStatus, LedgerEvent, Origin};
pub use loyalty::{HttpLoyaltyClient, LoyaltyClient, LoyaltyError};
pub use ops::{
    ApplyOutcome, AuditFilter, AuditRow, BalanceCheck, CarriedField, CurrencyMergeLine,
    DuplicateGroup, DuplicateKey, Engine, EngineBuilder, IdentityConflict, IdentityResolution,
    MergeOutcome, MergePreview, MergeReport, PendingWork, ReprocessOutcome, RestorationQuote,
    RestorationReceipt, StreakClaim, StreakStatus, SweepReport,
};
pub use profiles::Profile;
pub use rewards::{Reward, RewardTable};
pub use streaks::StreakRecord;

mod accounts;
mod commands;
mod config;
mod currency;
mod error;
mod external_sync;
mod ledger_events;
mod locks;
mod loyalty;
mod ops;
mod profile_aliases;
mod profiles;
mod rewards;
mod streaks;
mod util;

type ResultEngine<T> = Result<T, EngineError>;
