use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[derive(Iden)]
enum Profiles {
    Table,
    Id,
}

#[derive(Iden)]
enum Streaks {
    Table,
    UserId,
    CurrentDayCount,
    LongestDayCount,
    TotalClaims,
    LastClaimDate,
    RestoredAt,
    UpdatedAt,
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Streaks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Streaks::UserId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Streaks::CurrentDayCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Streaks::LongestDayCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Streaks::TotalClaims)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Streaks::LastClaimDate).date())
                    .col(ColumnDef::new(Streaks::RestoredAt).timestamp())
                    .col(ColumnDef::new(Streaks::UpdatedAt).timestamp().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-streaks-user_id")
                            .from(Streaks::Table, Streaks::UserId)
                            .to(Profiles::Table, Profiles::Id),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Streaks::Table).to_owned())
            .await?;
        Ok(())
    }
}
