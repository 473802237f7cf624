pub use sea_orm_migration::prelude::*;

mod m20261001_000001_identity_ledger;
mod m20261001_000002_external_sync;
mod m20261001_000003_streaks;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261001_000001_identity_ledger::Migration),
            Box::new(m20261001_000002_external_sync::Migration),
            Box::new(m20261001_000003_streaks::Migration),
        ]
    }
}
