use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Publication::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Publication::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Publication::Branch).string().not_null())
                    .col(ColumnDef::new(Publication::Theme).string().not_null())
                    .col(ColumnDef::new(Publication::AuthorId).string().not_null())
                    .col(ColumnDef::new(Publication::Status).string().not_null())
                    .col(ColumnDef::new(Publication::PublicationDate).date())
                    .col(ColumnDef::new(Publication::Title).string())
                    .to_owned(),
            )
            .await?;

        // Uniqueness guards look up siblings by (branch, theme, date)
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_publication_branch_theme_date")
                    .table(Publication::Table)
                    .col(Publication::Branch)
                    .col(Publication::Theme)
                    .col(Publication::PublicationDate)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Publication::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Publication {
    Table,
    Id,
    Branch,
    Theme,
    AuthorId,
    Status,
    PublicationDate,
    Title,
}
