use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(pk_auto(Users::Id))
                    .col(string_uniq(Users::Username))
                    .col(string(Users::PasswordHash))
                    .col(
                        ColumnDef::new(Users::IsAdmin)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .to_owned(),
            )
            .await?;

        // One grant per (experiment, user)
        manager
            .create_table(
                Table::create()
                    .table(ExperimentPermissions::Table)
                    .if_not_exists()
                    .col(pk_auto(ExperimentPermissions::Id))
                    .col(string(ExperimentPermissions::ExperimentId))
                    .col(integer(ExperimentPermissions::UserId))
                    .col(string(ExperimentPermissions::Permission))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_experiment_permissions_user")
                            .from(ExperimentPermissions::Table, ExperimentPermissions::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("unique_experiment_user")
                    .table(ExperimentPermissions::Table)
                    .col(ExperimentPermissions::ExperimentId)
                    .col(ExperimentPermissions::UserId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Registered models are keyed by name, not by an immutable id
        manager
            .create_table(
                Table::create()
                    .table(RegisteredModelPermissions::Table)
                    .if_not_exists()
                    .col(pk_auto(RegisteredModelPermissions::Id))
                    .col(string(RegisteredModelPermissions::Name))
                    .col(integer(RegisteredModelPermissions::UserId))
                    .col(string(RegisteredModelPermissions::Permission))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_registered_model_permissions_user")
                            .from(
                                RegisteredModelPermissions::Table,
                                RegisteredModelPermissions::UserId,
                            )
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("unique_name_user")
                    .table(RegisteredModelPermissions::Table)
                    .col(RegisteredModelPermissions::Name)
                    .col(RegisteredModelPermissions::UserId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(RegisteredModelPermissions::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(ExperimentPermissions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
    Username,
    PasswordHash,
    IsAdmin,
}

#[derive(DeriveIden)]
enum ExperimentPermissions {
    Table,
    Id,
    ExperimentId,
    UserId,
    Permission,
}

#[derive(DeriveIden)]
enum RegisteredModelPermissions {
    Table,
    Id,
    Name,
    UserId,
    Permission,
}
