//! PortForward entity: one routing rule owned by an agent

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Direction of a forward as stored in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum Direction {
    #[sea_orm(string_value = "forward")]
    Forward,

    #[sea_orm(string_value = "reverse")]
    Reverse,

    #[sea_orm(string_value = "dynamic")]
    Dynamic,

    #[sea_orm(string_value = "reverse-dynamic")]
    ReverseDynamic,
}

impl From<Direction> for burrow_proto::Direction {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Forward => burrow_proto::Direction::Forward,
            Direction::Reverse => burrow_proto::Direction::Reverse,
            Direction::Dynamic => burrow_proto::Direction::Dynamic,
            Direction::ReverseDynamic => burrow_proto::Direction::ReverseDynamic,
        }
    }
}

impl From<burrow_proto::Direction> for Direction {
    fn from(d: burrow_proto::Direction) -> Self {
        match d {
            burrow_proto::Direction::Forward => Direction::Forward,
            burrow_proto::Direction::Reverse => Direction::Reverse,
            burrow_proto::Direction::Dynamic => Direction::Dynamic,
            burrow_proto::Direction::ReverseDynamic => Direction::ReverseDynamic,
        }
    }
}

/// Transport type of a forward as stored in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ProxyType {
    #[sea_orm(string_value = "tcp")]
    Tcp,

    #[sea_orm(string_value = "udp")]
    Udp,

    #[sea_orm(string_value = "socks5")]
    Socks5,
}

impl From<ProxyType> for burrow_proto::ProxyType {
    fn from(t: ProxyType) -> Self {
        match t {
            ProxyType::Tcp => burrow_proto::ProxyType::Tcp,
            ProxyType::Udp => burrow_proto::ProxyType::Udp,
            ProxyType::Socks5 => burrow_proto::ProxyType::Socks5,
        }
    }
}

impl From<burrow_proto::ProxyType> for ProxyType {
    fn from(t: burrow_proto::ProxyType) -> Self {
        match t {
            burrow_proto::ProxyType::Tcp => ProxyType::Tcp,
            burrow_proto::ProxyType::Udp => ProxyType::Udp,
            burrow_proto::ProxyType::Socks5 => ProxyType::Socks5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "port_forwards")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Owning agent
    #[sea_orm(indexed)]
    pub agent_id: i64,

    /// Human name, unique per agent; used as `proxyName` on the wire
    pub name: String,

    pub direction: Direction,

    pub proxy_type: ProxyType,

    /// Server-side port (bind for forward/dynamic, dial for reverse)
    pub remote_port: i32,

    /// Server-side dial address for reverse forwards
    pub remote_ip: String,

    /// Agent-side address (dial target for forward, bind for reverse)
    pub local_ip: String,

    pub local_port: i32,

    /// Disabled forwards are ignored by reconciliation
    pub enabled: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// A forward belongs to an agent
    #[sea_orm(
        belongs_to = "super::agent::Entity",
        from = "Column::AgentId",
        to = "super::agent::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Agent,
}

impl Related<super::agent::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Agent.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
