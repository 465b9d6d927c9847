//! Catalog adapter for the burrow tunnel
//!
//! The catalog is the authoritative store of agents and port forwards. The
//! core consumes it through the [`Catalog`] trait; [`SqlCatalog`] backs it
//! with SeaORM over SQLite/Postgres and [`MemoryCatalog`] backs tests and
//! ephemeral setups.

pub mod db;
pub mod entities;
pub mod memory;
pub mod migrator;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use thiserror::Error;

use burrow_proto::{Direction, PortForwardSpec, ProxyType};

pub use db::SqlCatalog;
pub use memory::MemoryCatalog;

pub type AgentId = i64;
pub type ForwardId = i64;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

/// An agent row as seen by the core.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub enabled: bool,
}

/// A port forward row as seen by the core.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRecord {
    pub id: ForwardId,
    pub agent_id: AgentId,
    pub name: String,
    pub direction: Direction,
    pub proxy_type: ProxyType,
    pub remote_port: u16,
    pub remote_ip: String,
    pub local_ip: String,
    pub local_port: u16,
    pub enabled: bool,
}

impl ForwardRecord {
    /// The wire shape pushed to agents.
    pub fn to_spec(&self) -> PortForwardSpec {
        PortForwardSpec {
            name: self.name.clone(),
            direction: self.direction,
            proxy_type: self.proxy_type,
            remote_port: self.remote_port,
            remote_ip: self.remote_ip.clone(),
            local_ip: self.local_ip.clone(),
            local_port: self.local_port,
        }
    }
}

/// Read-only interface the core consumes, plus the traffic append.
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    /// Resolve a handshake token to an enabled agent. Disabled agents and
    /// unknown tokens both come back as `None`.
    async fn agent_by_token(&self, token: &str) -> Result<Option<AgentRecord>, CatalogError>;

    /// Enabled forwards owned by the agent, any direction and transport.
    async fn forwards_by_agent(
        &self,
        agent_id: AgentId,
    ) -> Result<Vec<ForwardRecord>, CatalogError>;

    /// Whether `remote_port` is free among enabled forwards whose direction
    /// binds the server (`forward`, `dynamic`).
    async fn is_remote_port_available(
        &self,
        remote_port: u16,
        exclude: Option<ForwardId>,
    ) -> Result<bool, CatalogError>;

    /// Append one byte-count delta record for a forward.
    async fn append_traffic(
        &self,
        forward_id: ForwardId,
        bytes_in: u64,
        bytes_out: u64,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), CatalogError>;
}

/// Open a database connection.
pub async fn connect(url: &str) -> Result<DatabaseConnection, DbErr> {
    sea_orm::Database::connect(url).await
}

/// Bring the schema up to date.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    migrator::Migrator::up(db, None).await
}
