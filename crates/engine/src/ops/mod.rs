use std::sync::Arc;

use sea_orm::{ConnectionTrait, DatabaseConnection, QueryFilter, prelude::*};
use uuid::Uuid;

use crate::{
    EngineConfig, EngineError, LoyaltyClient, Profile, ResultEngine, RewardTable, locks::KeyedLocks,
    profile_aliases, profiles,
};

mod audit;
mod identity;
mod ledger;
mod merge;
mod reconcile;
mod streak;
mod sync;

pub use audit::{AuditFilter, AuditRow};
pub use identity::{CarriedField, IdentityConflict, IdentityResolution};
pub use ledger::{ApplyOutcome, BalanceCheck};
pub use merge::{
    CurrencyMergeLine, DuplicateGroup, DuplicateKey, MergeOutcome, MergePreview, MergeReport,
};
pub use reconcile::{PendingWork, ReprocessOutcome, SweepReport};
pub use streak::{RestorationQuote, RestorationReceipt, StreakClaim, StreakStatus};

/// Run a block inside a DB transaction, committing on success and rolling back on error.
macro_rules! with_tx {
    ($self:expr, |$tx:ident| $body:expr) => {{
        let $tx = $self.database.begin().await?;
        let result: $crate::ResultEngine<_> = $body;
        match result {
            Ok(value) => {
                $tx.commit().await?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }};
}

pub(crate) use with_tx;

#[derive(Clone, Debug)]
pub struct Engine {
    database: DatabaseConnection,
    config: Arc<EngineConfig>,
    rewards: Arc<RewardTable>,
    loyalty: Option<Arc<dyn LoyaltyClient>>,
    locks: Arc<KeyedLocks>,
}

impl Engine {
    /// Return a builder for `Engine`. Help to build the struct.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn loyalty(&self) -> ResultEngine<&Arc<dyn LoyaltyClient>> {
        self.loyalty.as_ref().ok_or_else(|| {
            EngineError::ExternalSyncFailure("no loyalty client configured".to_string())
        })
    }

    /// Fetch a profile (active or not) with its alternate handles.
    pub async fn profile(&self, profile_id: Uuid) -> ResultEngine<Profile> {
        let model = profiles::Entity::find_by_id(profile_id.to_string())
            .one(&self.database)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound("profile not exists".to_string()))?;
        self.load_profile(&self.database, model).await
    }

    async fn load_profile<C: ConnectionTrait>(
        &self,
        db: &C,
        model: profiles::Model,
    ) -> ResultEngine<Profile> {
        let aliases = profile_aliases::Entity::find()
            .filter(profile_aliases::Column::ProfileId.eq(model.id.clone()))
            .all(db)
            .await?;
        let mut profile = Profile::try_from(model)?;
        let mut handles: Vec<(chrono::DateTime<chrono::Utc>, String)> =
            aliases.into_iter().map(|a| (a.created_at, a.handle)).collect();
        handles.sort();
        profile.alternate_handles = handles.into_iter().map(|(_, h)| h).collect();
        Ok(profile)
    }

    async fn require_profile<C: ConnectionTrait>(
        &self,
        db: &C,
        profile_id: Uuid,
    ) -> ResultEngine<profiles::Model> {
        profiles::Entity::find_by_id(profile_id.to_string())
            .one(db)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound("profile not exists".to_string()))
    }

    /// Ledger operations only ever target active (canonical) profiles.
    async fn require_active_profile<C: ConnectionTrait>(
        &self,
        db: &C,
        profile_id: Uuid,
    ) -> ResultEngine<profiles::Model> {
        let model = self.require_profile(db, profile_id).await?;
        if !model.active {
            return Err(EngineError::Validation(format!(
                "profile {profile_id} is inactive (merged into {})",
                model.merged_into.as_deref().unwrap_or("unknown")
            )));
        }
        Ok(model)
    }
}

/// The builder for `Engine`
#[derive(Default)]
pub struct EngineBuilder {
    database: DatabaseConnection,
    config: EngineConfig,
    loyalty: Option<Arc<dyn LoyaltyClient>>,
}

impl EngineBuilder {
    /// Pass the required database
    pub fn database(mut self, db: DatabaseConnection) -> EngineBuilder {
        self.database = db;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> EngineBuilder {
        self.config = config;
        self
    }

    /// Remote loyalty service used for point mirroring and streak restoration.
    pub fn loyalty(mut self, client: Arc<dyn LoyaltyClient>) -> EngineBuilder {
        self.loyalty = Some(client);
        self
    }

    /// Construct `Engine`
    pub async fn build(self) -> ResultEngine<Engine> {
        self.config.validate()?;
        let rewards = RewardTable::from_config(&self.config.streak);
        Ok(Engine {
            database: self.database,
            config: Arc::new(self.config),
            rewards: Arc::new(rewards),
            loyalty: self.loyalty,
            locks: Arc::new(KeyedLocks::default()),
        })
    }
}
