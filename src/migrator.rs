use anyhow::Result;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::prelude::*;
use std::time::Duration;
use tracing::{error, info};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_users_table::Migration),
            Box::new(m20240301_000002_create_registry_tables::Migration),
            Box::new(m20240301_000003_create_task_tables::Migration),
            Box::new(m20240301_000004_create_history_tables::Migration),
            Box::new(m20240301_000005_open_usage_index::Migration),
        ]
    }
}

/// Table identifiers shared by the migrations below.
mod idens {
    use sea_orm_migration::prelude::*;

    #[derive(DeriveIden)]
    pub enum Users {
        Table,
        Id,
        Name,
        Username,
        PasswordHash,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub enum Clients {
        Table,
        Id,
        UserId,
        Name,
        Email,
        Phone,
        Address,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub enum Machines {
        Table,
        Id,
        UserId,
        Name,
        MachineType,
        Description,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub enum Tasks {
        Table,
        Id,
        UserId,
        ClientId,
        ServiceName,
        ServiceDate,
        Location,
        LocationNumber,
        Description,
        Completed,
        Paid,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub enum TaskMachines {
        Table,
        Id,
        TaskId,
        MachineId,
        StartTime,
        EndTime,
        HourlyRate,
        HoursWorked,
        TotalAmount,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub enum TaskHistories {
        Table,
        Id,
        TaskId,
        UserId,
        ServiceName,
        ServiceDate,
        Location,
        LocationNumber,
        Description,
        ClientName,
        ClientEmail,
        Paid,
        TotalAmount,
        CompletedAt,
    }

    #[derive(DeriveIden)]
    pub enum TaskHistoryMachines {
        Table,
        Id,
        HistoryId,
        MachineName,
        MachineType,
        StartTime,
        EndTime,
        HoursWorked,
        HourlyRate,
        TotalAmount,
    }
}

mod m20240301_000001_create_users_table {
    use super::idens::Users;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_users_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Users::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Users::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Users::Name).string().not_null())
                        .col(
                            ColumnDef::new(Users::Username)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Users::PasswordHash).string().not_null())
                        .col(
                            ColumnDef::new(Users::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Users::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Users::Table).to_owned())
                .await
        }
    }
}

mod m20240301_000002_create_registry_tables {
    use super::idens::{Clients, Machines, Users};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_registry_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Clients::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Clients::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Clients::UserId).integer().not_null())
                        .col(ColumnDef::new(Clients::Name).string().not_null())
                        .col(ColumnDef::new(Clients::Email).string().null())
                        .col(ColumnDef::new(Clients::Phone).string().null())
                        .col(ColumnDef::new(Clients::Address).string().null())
                        .col(
                            ColumnDef::new(Clients::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Clients::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_clients_user_id")
                                .from(Clients::Table, Clients::UserId)
                                .to(Users::Table, Users::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_clients_user_id")
                        .table(Clients::Table)
                        .col(Clients::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Machines::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Machines::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Machines::UserId).integer().not_null())
                        .col(ColumnDef::new(Machines::Name).string().not_null())
                        .col(ColumnDef::new(Machines::MachineType).string().null())
                        .col(ColumnDef::new(Machines::Description).text().null())
                        .col(
                            ColumnDef::new(Machines::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Machines::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_machines_user_id")
                                .from(Machines::Table, Machines::UserId)
                                .to(Users::Table, Users::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_machines_user_id")
                        .table(Machines::Table)
                        .col(Machines::UserId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Machines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Clients::Table).to_owned())
                .await
        }
    }
}

mod m20240301_000003_create_task_tables {
    use super::idens::{Clients, Machines, TaskMachines, Tasks, Users};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_task_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Tasks::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Tasks::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Tasks::UserId).integer().not_null())
                        .col(ColumnDef::new(Tasks::ClientId).integer().null())
                        .col(ColumnDef::new(Tasks::ServiceName).string().not_null())
                        .col(ColumnDef::new(Tasks::ServiceDate).date().not_null())
                        .col(ColumnDef::new(Tasks::Location).string().not_null())
                        .col(ColumnDef::new(Tasks::LocationNumber).string().not_null())
                        .col(ColumnDef::new(Tasks::Description).text().null())
                        .col(
                            ColumnDef::new(Tasks::Completed)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Tasks::Paid)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Tasks::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Tasks::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_tasks_user_id")
                                .from(Tasks::Table, Tasks::UserId)
                                .to(Users::Table, Users::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_tasks_client_id")
                                .from(Tasks::Table, Tasks::ClientId)
                                .to(Clients::Table, Clients::Id)
                                .on_delete(ForeignKeyAction::SetNull)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_tasks_user_id_created_at")
                        .table(Tasks::Table)
                        .col(Tasks::UserId)
                        .col(Tasks::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(TaskMachines::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(TaskMachines::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(TaskMachines::TaskId).integer().not_null())
                        .col(ColumnDef::new(TaskMachines::MachineId).integer().not_null())
                        .col(ColumnDef::new(TaskMachines::StartTime).double().not_null())
                        .col(ColumnDef::new(TaskMachines::EndTime).double().null())
                        .col(
                            ColumnDef::new(TaskMachines::HourlyRate)
                                .double()
                                .not_null()
                                .default(0.0),
                        )
                        .col(
                            ColumnDef::new(TaskMachines::HoursWorked)
                                .double()
                                .not_null()
                                .default(0.0),
                        )
                        .col(
                            ColumnDef::new(TaskMachines::TotalAmount)
                                .double()
                                .not_null()
                                .default(0.0),
                        )
                        .col(
                            ColumnDef::new(TaskMachines::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_task_machines_task_id")
                                .from(TaskMachines::Table, TaskMachines::TaskId)
                                .to(Tasks::Table, Tasks::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_task_machines_machine_id")
                                .from(TaskMachines::Table, TaskMachines::MachineId)
                                .to(Machines::Table, Machines::Id)
                                .on_delete(ForeignKeyAction::Restrict)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_task_machines_task_id")
                        .table(TaskMachines::Table)
                        .col(TaskMachines::TaskId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(TaskMachines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Tasks::Table).to_owned())
                .await
        }
    }
}

mod m20240301_000004_create_history_tables {
    use super::idens::{TaskHistories, TaskHistoryMachines, Users};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_history_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // task_id is deliberately not a foreign key: snapshots outlive their task
            manager
                .create_table(
                    Table::create()
                        .table(TaskHistories::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(TaskHistories::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(TaskHistories::TaskId).integer().not_null())
                        .col(ColumnDef::new(TaskHistories::UserId).integer().not_null())
                        .col(ColumnDef::new(TaskHistories::ServiceName).string().not_null())
                        .col(ColumnDef::new(TaskHistories::ServiceDate).date().not_null())
                        .col(ColumnDef::new(TaskHistories::Location).string().not_null())
                        .col(
                            ColumnDef::new(TaskHistories::LocationNumber)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(TaskHistories::Description).text().null())
                        .col(ColumnDef::new(TaskHistories::ClientName).string().not_null())
                        .col(ColumnDef::new(TaskHistories::ClientEmail).string().null())
                        .col(
                            ColumnDef::new(TaskHistories::Paid)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(TaskHistories::TotalAmount)
                                .double()
                                .not_null()
                                .default(0.0),
                        )
                        .col(
                            ColumnDef::new(TaskHistories::CompletedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_task_histories_user_id")
                                .from(TaskHistories::Table, TaskHistories::UserId)
                                .to(Users::Table, Users::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_task_histories_user_completed_at")
                        .table(TaskHistories::Table)
                        .col(TaskHistories::UserId)
                        .col(TaskHistories::CompletedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_task_histories_task_id")
                        .table(TaskHistories::Table)
                        .col(TaskHistories::TaskId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(TaskHistoryMachines::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(TaskHistoryMachines::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(TaskHistoryMachines::HistoryId)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TaskHistoryMachines::MachineName)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TaskHistoryMachines::MachineType)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(TaskHistoryMachines::StartTime)
                                .double()
                                .not_null(),
                        )
                        .col(ColumnDef::new(TaskHistoryMachines::EndTime).double().not_null())
                        .col(
                            ColumnDef::new(TaskHistoryMachines::HoursWorked)
                                .double()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TaskHistoryMachines::HourlyRate)
                                .double()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TaskHistoryMachines::TotalAmount)
                                .double()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_task_history_machines_history_id")
                                .from(TaskHistoryMachines::Table, TaskHistoryMachines::HistoryId)
                                .to(TaskHistories::Table, TaskHistories::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_task_history_machines_history_id")
                        .table(TaskHistoryMachines::Table)
                        .col(TaskHistoryMachines::HistoryId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(TaskHistoryMachines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(TaskHistories::Table).to_owned())
                .await
        }
    }
}

mod m20240301_000005_open_usage_index {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000005_open_usage_index"
        }
    }

    /// At most one open ledger line per machine. Partial indexes are not
    /// expressible through the schema builder, so the statement is raw SQL that
    /// both SQLite and Postgres accept.
    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .get_connection()
                .execute_unprepared(
                    "CREATE UNIQUE INDEX IF NOT EXISTS ux_task_machines_open_machine \
                     ON task_machines (machine_id) WHERE end_time IS NULL",
                )
                .await
                .map(|_| ())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .get_connection()
                .execute_unprepared("DROP INDEX IF EXISTS ux_task_machines_open_machine")
                .await
                .map(|_| ())
        }
    }
}

/// Connects to `db_url` and applies all pending migrations.
pub async fn run_migration(db_url: &str) -> Result<()> {
    info!("Setting up database connection for migrations");

    let mut opt = ConnectOptions::new(db_url);
    opt.max_connections(1)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;

    info!("Running database migrations");

    match Migrator::up(&db, None).await {
        Ok(_) => {
            info!("Migrations completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Migration failed: {}", e);
            Err(e.into())
        }
    }
}
