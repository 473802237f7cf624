use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[derive(Iden)]
enum ExternalSyncRecords {
    Table,
    Id,
    Handle,
    OperationType,
    ReferenceId,
    PointsDelta,
    Attempt,
    Success,
    BalanceBefore,
    BalanceAfter,
    Verified,
    VerificationAttempts,
    RequiresReprocessing,
    ErrorMessage,
    ReprocessedAt,
    CreatedAt,
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ExternalSyncRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExternalSyncRecords::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ExternalSyncRecords::Handle)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalSyncRecords::OperationType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalSyncRecords::ReferenceId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalSyncRecords::PointsDelta)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalSyncRecords::Attempt)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalSyncRecords::Success)
                            .boolean()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ExternalSyncRecords::BalanceBefore).big_integer())
                    .col(ColumnDef::new(ExternalSyncRecords::BalanceAfter).big_integer())
                    .col(
                        ColumnDef::new(ExternalSyncRecords::Verified)
                            .boolean()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalSyncRecords::VerificationAttempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExternalSyncRecords::RequiresReprocessing)
                            .boolean()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ExternalSyncRecords::ErrorMessage).string())
                    .col(ColumnDef::new(ExternalSyncRecords::ReprocessedAt).timestamp())
                    .col(
                        ColumnDef::new(ExternalSyncRecords::CreatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // One row per attempt of a given operation.
        manager
            .create_index(
                Index::create()
                    .name("uidx-external_sync_records-operation-attempt")
                    .table(ExternalSyncRecords::Table)
                    .col(ExternalSyncRecords::Handle)
                    .col(ExternalSyncRecords::OperationType)
                    .col(ExternalSyncRecords::ReferenceId)
                    .col(ExternalSyncRecords::Attempt)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-external_sync_records-requires_reprocessing")
                    .table(ExternalSyncRecords::Table)
                    .col(ExternalSyncRecords::RequiresReprocessing)
                    .col(ExternalSyncRecords::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ExternalSyncRecords::Table).to_owned())
            .await?;
        Ok(())
    }
}
