use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Search filtering lists all grants of one user
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_experiment_permissions_user")
                    .table(ExperimentPermissions::Table)
                    .col(ExperimentPermissions::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_registered_model_permissions_user")
                    .table(RegisteredModelPermissions::Table)
                    .col(RegisteredModelPermissions::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_registered_model_permissions_user")
                    .table(RegisteredModelPermissions::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_experiment_permissions_user")
                    .table(ExperimentPermissions::Table)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum ExperimentPermissions {
    Table,
    UserId,
}

#[derive(DeriveIden)]
enum RegisteredModelPermissions {
    Table,
    UserId,
}
