//! Initial schema: agents, port forwards, traffic records

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Agents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Agents::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Agents::Name)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Agents::Token)
                            .string_len(255)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Agents::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Agents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_agents_token")
                    .table(Agents::Table)
                    .col(Agents::Token)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PortForwards::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PortForwards::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PortForwards::AgentId).big_integer().not_null())
                    .col(
                        ColumnDef::new(PortForwards::Name)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PortForwards::Direction)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PortForwards::ProxyType)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(ColumnDef::new(PortForwards::RemotePort).integer().not_null())
                    .col(
                        ColumnDef::new(PortForwards::RemoteIp)
                            .string_len(255)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(PortForwards::LocalIp)
                            .string_len(255)
                            .not_null()
                            .default("127.0.0.1"),
                    )
                    .col(ColumnDef::new(PortForwards::LocalPort).integer().not_null())
                    .col(
                        ColumnDef::new(PortForwards::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_port_forwards_agent")
                            .from(PortForwards::Table, PortForwards::AgentId)
                            .to(Agents::Table, Agents::Id)
                            .on_update(ForeignKeyAction::Cascade)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_port_forwards_agent_id")
                    .table(PortForwards::Table)
                    .col(PortForwards::AgentId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_port_forwards_agent_name")
                    .table(PortForwards::Table)
                    .col(PortForwards::AgentId)
                    .col(PortForwards::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TrafficRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TrafficRecords::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(TrafficRecords::ForwardId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TrafficRecords::BytesIn)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TrafficRecords::BytesOut)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TrafficRecords::RecordedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_traffic_records_forward")
                            .from(TrafficRecords::Table, TrafficRecords::ForwardId)
                            .to(PortForwards::Table, PortForwards::Id)
                            .on_update(ForeignKeyAction::Cascade)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_traffic_records_forward_id")
                    .table(TrafficRecords::Table)
                    .col(TrafficRecords::ForwardId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TrafficRecords::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PortForwards::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Agents::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Agents {
    Table,
    Id,
    Name,
    Token,
    Enabled,
    CreatedAt,
}

#[derive(DeriveIden)]
enum PortForwards {
    Table,
    Id,
    AgentId,
    Name,
    Direction,
    ProxyType,
    RemotePort,
    RemoteIp,
    LocalIp,
    LocalPort,
    Enabled,
}

#[derive(DeriveIden)]
enum TrafficRecords {
    Table,
    Id,
    ForwardId,
    BytesIn,
    BytesOut,
    RecordedAt,
}
