//! Initial schema: identities and the internal ledger.
//!
//! - `profiles`: one row per known viewer identity (never deleted)
//! - `profile_aliases`: alternate handles a profile has been seen under
//! - `accounts`: materialized balance per `(user, currency)`
//! - `ledger_events`: append-only balance changes, one per idempotency key

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

// ─────────────────────────────────────────────────────────────────────────────
// Table identifiers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Iden)]
enum Profiles {
    Table,
    Id,
    ExternalId,
    Handle,
    HandleKey,
    CharacterName,
    Active,
    Provisional,
    MergedInto,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum ProfileAliases {
    Table,
    ProfileId,
    HandleKey,
    Handle,
    CreatedAt,
}

#[derive(Iden)]
enum Accounts {
    Table,
    UserId,
    Currency,
    Balance,
    UpdatedAt,
}

#[derive(Iden)]
enum LedgerEvents {
    Table,
    Id,
    UserId,
    Currency,
    Delta,
    Reason,
    Origin,
    IdempotencyKey,
    Status,
    Retries,
    BalanceAfter,
    ErrorMessage,
    ReferenceId,
    OriginalUserId,
    CreatedAt,
    UpdatedAt,
}

// ─────────────────────────────────────────────────────────────────────────────
// Migration implementation
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ───────────────────────────────────────────────────────────────────
        // 1. Profiles
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Profiles::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Profiles::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Profiles::ExternalId).string())
                    .col(ColumnDef::new(Profiles::Handle).string().not_null())
                    .col(ColumnDef::new(Profiles::HandleKey).string().not_null())
                    .col(ColumnDef::new(Profiles::CharacterName).string())
                    .col(
                        ColumnDef::new(Profiles::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Profiles::Provisional)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(Profiles::MergedInto).string())
                    .col(ColumnDef::new(Profiles::CreatedAt).timestamp().not_null())
                    .col(ColumnDef::new(Profiles::UpdatedAt).timestamp().not_null())
                    .to_owned(),
            )
            .await?;

        // Not unique: legacy imports can carry duplicates until they are merged.
        manager
            .create_index(
                Index::create()
                    .name("idx-profiles-external_id")
                    .table(Profiles::Table)
                    .col(Profiles::ExternalId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-profiles-handle_key")
                    .table(Profiles::Table)
                    .col(Profiles::HandleKey)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 2. Profile aliases
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(ProfileAliases::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProfileAliases::ProfileId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ProfileAliases::HandleKey)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ProfileAliases::Handle).string().not_null())
                    .col(
                        ColumnDef::new(ProfileAliases::CreatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(ProfileAliases::ProfileId)
                            .col(ProfileAliases::HandleKey),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-profile_aliases-profile_id")
                            .from(ProfileAliases::Table, ProfileAliases::ProfileId)
                            .to(Profiles::Table, Profiles::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-profile_aliases-handle_key")
                    .table(ProfileAliases::Table)
                    .col(ProfileAliases::HandleKey)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 3. Accounts
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Accounts::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Accounts::UserId).string().not_null())
                    .col(ColumnDef::new(Accounts::Currency).string().not_null())
                    .col(
                        ColumnDef::new(Accounts::Balance)
                            .big_integer()
                            .not_null()
                            .default(0)
                            .check(Expr::col(Accounts::Balance).gte(0)),
                    )
                    .col(ColumnDef::new(Accounts::UpdatedAt).timestamp().not_null())
                    .primary_key(
                        Index::create()
                            .col(Accounts::UserId)
                            .col(Accounts::Currency),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-accounts-user_id")
                            .from(Accounts::Table, Accounts::UserId)
                            .to(Profiles::Table, Profiles::Id),
                    )
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 4. Ledger events
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(LedgerEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LedgerEvents::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LedgerEvents::UserId).string().not_null())
                    .col(ColumnDef::new(LedgerEvents::Currency).string().not_null())
                    .col(ColumnDef::new(LedgerEvents::Delta).big_integer().not_null())
                    .col(ColumnDef::new(LedgerEvents::Reason).string().not_null())
                    .col(ColumnDef::new(LedgerEvents::Origin).string().not_null())
                    .col(
                        ColumnDef::new(LedgerEvents::IdempotencyKey)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LedgerEvents::Status).string().not_null())
                    .col(
                        ColumnDef::new(LedgerEvents::Retries)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(LedgerEvents::BalanceAfter).big_integer())
                    .col(ColumnDef::new(LedgerEvents::ErrorMessage).string())
                    .col(ColumnDef::new(LedgerEvents::ReferenceId).string())
                    .col(ColumnDef::new(LedgerEvents::OriginalUserId).string())
                    .col(
                        ColumnDef::new(LedgerEvents::CreatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LedgerEvents::UpdatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-ledger_events-user_id")
                            .from(LedgerEvents::Table, LedgerEvents::UserId)
                            .to(Profiles::Table, Profiles::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uidx-ledger_events-idempotency_key")
                    .table(LedgerEvents::Table)
                    .col(LedgerEvents::IdempotencyKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-ledger_events-user_id-currency")
                    .table(LedgerEvents::Table)
                    .col(LedgerEvents::UserId)
                    .col(LedgerEvents::Currency)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-ledger_events-status-created_at")
                    .table(LedgerEvents::Table)
                    .col(LedgerEvents::Status)
                    .col(LedgerEvents::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LedgerEvents::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Accounts::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ProfileAliases::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Profiles::Table).to_owned())
            .await?;
        Ok(())
    }
}
