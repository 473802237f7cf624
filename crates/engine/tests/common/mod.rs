#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use sea_orm::{Database, DatabaseConnection};

use engine::{
    Engine, EngineConfig, LoyaltyClient, LoyaltyError, Profile, ReconcileConfig, StreakConfig,
    SyncConfig,
};
use migration::MigratorTrait;

/// Engine settings with no grace window and no verification delay.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        sync: SyncConfig {
            timeout_ms: 1_000,
            verification_polls: 2,
            verification_delay_ms: 0,
            max_verification_attempts: 4,
        },
        reconcile: ReconcileConfig {
            grace_secs: 0,
            max_retries: 3,
            interval_secs: 1,
            batch_size: 100,
        },
        streak: StreakConfig {
            timezone: chrono_tz::UTC,
            ..StreakConfig::default()
        },
    }
}

pub async fn memory_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    migration::Migrator::up(&db, None).await.unwrap();
    db
}

pub async fn engine_with_db() -> (Engine, DatabaseConnection) {
    engine_with_config(test_config(), None).await
}

pub async fn engine_with_loyalty(loyalty: Arc<MemoryLoyalty>) -> (Engine, DatabaseConnection) {
    engine_with_config(test_config(), Some(loyalty)).await
}

pub async fn engine_with_config(
    config: EngineConfig,
    loyalty: Option<Arc<MemoryLoyalty>>,
) -> (Engine, DatabaseConnection) {
    let db = memory_db().await;
    let mut builder = Engine::builder().database(db.clone()).config(config);
    if let Some(loyalty) = loyalty {
        builder = builder.loyalty(loyalty);
    }
    (builder.build().await.unwrap(), db)
}

pub async fn profile(engine: &Engine, handle: &str) -> Profile {
    engine.resolve(handle, None).await.unwrap().canonical
}

#[derive(Debug, Default)]
struct LoyaltyState {
    points: HashMap<String, i64>,
    failing_reads: u32,
    failing_submits: u32,
    /// Submits that apply on the remote side but report an error.
    landing_failures: u32,
    /// Reads that keep returning the pre-submit balance.
    stale_reads: u32,
    stale_value: HashMap<String, i64>,
    submit_delay: Option<Duration>,
    submits: u32,
}

/// In-memory loyalty service with scripted failures.
#[derive(Debug, Default)]
pub struct MemoryLoyalty {
    state: Mutex<LoyaltyState>,
}

impl MemoryLoyalty {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_points(&self, handle: &str, points: i64) {
        self.state
            .lock()
            .unwrap()
            .points
            .insert(handle.to_lowercase(), points);
    }

    pub fn points(&self, handle: &str) -> i64 {
        let state = self.state.lock().unwrap();
        state
            .points
            .get(&handle.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn submits(&self) -> u32 {
        self.state.lock().unwrap().submits
    }

    pub fn fail_reads(&self, count: u32) {
        self.state.lock().unwrap().failing_reads = count;
    }

    pub fn fail_submits(&self, count: u32) {
        self.state.lock().unwrap().failing_submits = count;
    }

    pub fn land_then_fail_submits(&self, count: u32) {
        self.state.lock().unwrap().landing_failures = count;
    }

    pub fn stale_reads(&self, count: u32) {
        self.state.lock().unwrap().stale_reads = count;
    }

    pub fn delay_submits(&self, delay: Duration) {
        self.state.lock().unwrap().submit_delay = Some(delay);
    }
}

#[async_trait]
impl LoyaltyClient for MemoryLoyalty {
    async fn balance(&self, handle: &str) -> Result<i64, LoyaltyError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(LoyaltyError::Rejected("balance read failed".to_string()));
        }
        let key = handle.to_lowercase();
        if state.stale_reads > 0 {
            if let Some(stale) = state.stale_value.get(&key).copied() {
                state.stale_reads -= 1;
                return Ok(stale);
            }
        }
        Ok(state.points.get(&key).copied().unwrap_or(0))
    }

    async fn add_points(&self, handle: &str, delta: i64) -> Result<(), LoyaltyError> {
        let delay = self.state.lock().unwrap().submit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.submits += 1;
        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(LoyaltyError::Rejected("submit failed".to_string()));
        }
        let key = handle.to_lowercase();
        let before = state.points.get(&key).copied().unwrap_or(0);
        state.stale_value.insert(key.clone(), before);
        state.points.insert(key, before + delta);
        if state.landing_failures > 0 {
            state.landing_failures -= 1;
            return Err(LoyaltyError::Timeout(Duration::from_secs(5)));
        }
        Ok(())
    }
}
