use sea_orm::DatabaseBackend;
use sea_orm_migration::prelude::*;

/// Money columns are `NUMERIC(19, 4)`. SQLite caps declared precision at 16.
fn money_column<T: IntoIden>(manager: &SchemaManager<'_>, column: T) -> ColumnDef {
    let mut def = ColumnDef::new(column);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => def.decimal_len(16, 4),
        _ => def.decimal_len(19, 4),
    };
    def
}

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_directory_tables::Migration),
            Box::new(m20250101_000002_create_deposits_table::Migration),
            Box::new(m20250101_000003_create_alerts_table::Migration),
            Box::new(m20250101_000004_create_movements_table::Migration),
            Box::new(m20250101_000005_create_sequence_and_lease_tables::Migration),
        ]
    }
}

mod m20250101_000001_create_directory_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000001_create_directory_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Products::Code)
                                .string_len(64)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(
                            super::money_column(manager, Products::UnitPrice)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Clients::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Clients::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Clients::Code)
                                .string_len(32)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Clients::Name).string().not_null())
                        .col(ColumnDef::new(Clients::TaxId).string_len(32).null())
                        .col(ColumnDef::new(Clients::ParentId).uuid().null())
                        .col(
                            ColumnDef::new(Clients::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Clients::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Clients::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_clients_parent_id")
                                .from(Clients::Table, Clients::ParentId)
                                .to(Clients::Table, Clients::Id)
                                .on_delete(ForeignKeyAction::Restrict)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Sites::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Sites::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Sites::Code)
                                .string_len(32)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Sites::Name).string().not_null())
                        .col(ColumnDef::new(Sites::ClientId).uuid().not_null())
                        .col(ColumnDef::new(Sites::SubClientId).uuid().null())
                        .col(ColumnDef::new(Sites::Address).string().null())
                        .col(
                            ColumnDef::new(Sites::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Sites::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Sites::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_sites_client_id")
                                .from(Sites::Table, Sites::ClientId)
                                .to(Clients::Table, Clients::Id)
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
                        .name("idx_sites_client_id")
                        .table(Sites::Table)
                        .col(Sites::ClientId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Sites::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Clients::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Products {
        Table,
        Id,
        Code,
        Name,
        UnitPrice,
        Active,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Clients {
        Table,
        Id,
        Code,
        Name,
        TaxId,
        ParentId,
        Active,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum Sites {
        Table,
        Id,
        Code,
        Name,
        ClientId,
        SubClientId,
        Address,
        Active,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000002_create_deposits_table {
    use super::m20250101_000001_create_directory_tables::{Products, Sites};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000002_create_deposits_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Deposits::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Deposits::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Deposits::Code)
                                .string_len(32)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Deposits::ProductId).uuid().not_null())
                        .col(ColumnDef::new(Deposits::SiteId).uuid().not_null())
                        .col(ColumnDef::new(Deposits::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(Deposits::DepositDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Deposits::ExpirationDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            super::money_column(manager, Deposits::UnitValue)
                                .not_null(),
                        )
                        .col(
                            super::money_column(manager, Deposits::TotalValue)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Deposits::State).string_len(32).not_null())
                        .col(ColumnDef::new(Deposits::InvoiceRef).string_len(64).null())
                        .col(
                            ColumnDef::new(Deposits::InvoicedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Deposits::RetiredAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Deposits::Notes).text().null())
                        .col(
                            ColumnDef::new(Deposits::Version)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(Deposits::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Deposits::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_deposits_product_id")
                                .from(Deposits::Table, Deposits::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Restrict)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_deposits_site_id")
                                .from(Deposits::Table, Deposits::SiteId)
                                .to(Sites::Table, Sites::Id)
                                .on_delete(ForeignKeyAction::Restrict)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            for (name, column) in [
                ("idx_deposits_state", Deposits::State),
                ("idx_deposits_site_id", Deposits::SiteId),
                ("idx_deposits_product_id", Deposits::ProductId),
                ("idx_deposits_expiration_date", Deposits::ExpirationDate),
            ] {
                manager
                    .create_index(
                        Index::create()
                            .if_not_exists()
                            .name(name)
                            .table(Deposits::Table)
                            .col(column)
                            .to_owned(),
                    )
                    .await?;
            }

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Deposits::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Deposits {
        Table,
        Id,
        Code,
        ProductId,
        SiteId,
        Quantity,
        DepositDate,
        ExpirationDate,
        UnitValue,
        TotalValue,
        State,
        InvoiceRef,
        InvoicedAt,
        RetiredAt,
        Notes,
        Version,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000003_create_alerts_table {
    use super::m20250101_000002_create_deposits_table::Deposits;
    use sea_orm_migration::prelude::*;
    use sea_orm_migration::sea_orm::ConnectionTrait;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000003_create_alerts_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Alerts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Alerts::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Alerts::AlertType).string_len(32).not_null())
                        .col(ColumnDef::new(Alerts::Priority).integer().not_null())
                        .col(ColumnDef::new(Alerts::DepositId).uuid().null())
                        .col(ColumnDef::new(Alerts::SiteId).uuid().null())
                        .col(ColumnDef::new(Alerts::ProductId).uuid().null())
                        .col(ColumnDef::new(Alerts::Title).string().not_null())
                        .col(ColumnDef::new(Alerts::Description).text().not_null())
                        .col(
                            ColumnDef::new(Alerts::Resolved)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Alerts::ResolvedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Alerts::ResolutionNote).text().null())
                        .col(ColumnDef::new(Alerts::Metadata).json().not_null())
                        .col(
                            ColumnDef::new(Alerts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Alerts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_alerts_deposit_id")
                                .from(Alerts::Table, Alerts::DepositId)
                                .to(Deposits::Table, Deposits::Id)
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
                        .name("idx_alerts_resolved_priority")
                        .table(Alerts::Table)
                        .col(Alerts::Resolved)
                        .col(Alerts::Priority)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_alerts_deposit_id")
                        .table(Alerts::Table)
                        .col(Alerts::DepositId)
                        .to_owned(),
                )
                .await?;

            // At most one open alert per (type, deposit). NULL deposit ids never collide.
            manager
                .get_connection()
                .execute_unprepared(
                    "CREATE UNIQUE INDEX IF NOT EXISTS ux_alerts_open_type_deposit \
                     ON alerts (alert_type, deposit_id) WHERE resolved = FALSE",
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Alerts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Alerts {
        Table,
        Id,
        AlertType,
        Priority,
        DepositId,
        SiteId,
        ProductId,
        Title,
        Description,
        Resolved,
        ResolvedAt,
        ResolutionNote,
        Metadata,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000004_create_movements_table {
    use super::m20250101_000002_create_deposits_table::Deposits;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000004_create_movements_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Movements::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Movements::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Movements::DepositId).uuid().not_null())
                        .col(
                            ColumnDef::new(Movements::MovementType)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Movements::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(Movements::OccurredAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Movements::Actor).string().not_null())
                        .col(ColumnDef::new(Movements::Description).text().not_null())
                        .col(
                            ColumnDef::new(Movements::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_movements_deposit_id")
                                .from(Movements::Table, Movements::DepositId)
                                .to(Deposits::Table, Deposits::Id)
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
                        .name("idx_movements_deposit_occurred_at")
                        .table(Movements::Table)
                        .col(Movements::DepositId)
                        .col(Movements::OccurredAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Movements::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Movements {
        Table,
        Id,
        DepositId,
        MovementType,
        Quantity,
        OccurredAt,
        Actor,
        Description,
        CreatedAt,
    }
}

mod m20250101_000005_create_sequence_and_lease_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000005_create_sequence_and_lease_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(SequenceCounters::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SequenceCounters::Prefix)
                                .string_len(32)
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SequenceCounters::LastValue)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(SequenceCounters::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(JobLeases::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(JobLeases::Name)
                                .string_len(64)
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(JobLeases::Holder).string().not_null())
                        .col(
                            ColumnDef::new(JobLeases::AcquiredAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(JobLeases::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(JobLeases::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(SequenceCounters::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum SequenceCounters {
        Table,
        Prefix,
        LastValue,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum JobLeases {
        Table,
        Name,
        Holder,
        AcquiredAt,
        ExpiresAt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::product;
    use rust_decimal_macros::dec;
    use sea_orm::{ActiveModelTrait, ConnectOptions, Database, EntityTrait, Set};
    use uuid::Uuid;

    #[tokio::test]
    async fn fresh_sqlite_database_migrates_and_keeps_money_scale() {
        let mut opt = ConnectOptions::new("sqlite::memory:".to_string());
        opt.max_connections(1).sqlx_logging(false);
        let db = Database::connect(opt).await.unwrap();

        Migrator::up(&db, None).await.unwrap();
        assert_eq!(Migrator::get_pending_migrations(&db).await.unwrap().len(), 0);

        let created = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set("RACK-01".to_string()),
            name: Set("Pallet rack".to_string()),
            unit_price: Set(dec!(1234.5678)),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();

        let stored = product::Entity::find_by_id(created.id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.unit_price, dec!(1234.5678));
    }
}
