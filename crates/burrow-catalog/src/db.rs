//! SeaORM-backed catalog implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set,
};
use tracing::warn;

use crate::entities::{agent, port_forward, traffic_record, prelude::*};
use crate::{AgentId, AgentRecord, Catalog, CatalogError, ForwardId, ForwardRecord};

/// Catalog backed by a relational database.
#[derive(Clone)]
pub struct SqlCatalog {
    db: DatabaseConnection,
}

impl SqlCatalog {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn forward_from_model(m: port_forward::Model) -> Option<ForwardRecord> {
    let remote_port = match u16::try_from(m.remote_port) {
        Ok(p) => p,
        Err(_) => {
            warn!(forward_id = m.id, remote_port = m.remote_port, "ignoring forward with invalid remote port");
            return None;
        }
    };
    let local_port = match u16::try_from(m.local_port) {
        Ok(p) => p,
        Err(_) => {
            warn!(forward_id = m.id, local_port = m.local_port, "ignoring forward with invalid local port");
            return None;
        }
    };
    Some(ForwardRecord {
        id: m.id,
        agent_id: m.agent_id,
        name: m.name,
        direction: m.direction.into(),
        proxy_type: m.proxy_type.into(),
        remote_port,
        remote_ip: m.remote_ip,
        local_ip: m.local_ip,
        local_port,
        enabled: m.enabled,
    })
}

#[async_trait]
impl Catalog for SqlCatalog {
    async fn agent_by_token(&self, token: &str) -> Result<Option<AgentRecord>, CatalogError> {
        let found = Agent::find()
            .filter(agent::Column::Token.eq(token))
            .filter(agent::Column::Enabled.eq(true))
            .one(&self.db)
            .await?;

        Ok(found.map(|m| AgentRecord {
            id: m.id,
            name: m.name,
            enabled: m.enabled,
        }))
    }

    async fn forwards_by_agent(
        &self,
        agent_id: AgentId,
    ) -> Result<Vec<ForwardRecord>, CatalogError> {
        let rows = PortForward::find()
            .filter(port_forward::Column::AgentId.eq(agent_id))
            .filter(port_forward::Column::Enabled.eq(true))
            .all(&self.db)
            .await?;

        Ok(rows.into_iter().filter_map(forward_from_model).collect())
    }

    async fn is_remote_port_available(
        &self,
        remote_port: u16,
        exclude: Option<ForwardId>,
    ) -> Result<bool, CatalogError> {
        let mut query = PortForward::find()
            .filter(port_forward::Column::RemotePort.eq(remote_port as i32))
            .filter(port_forward::Column::Enabled.eq(true))
            .filter(port_forward::Column::Direction.is_in([
                port_forward::Direction::Forward,
                port_forward::Direction::Dynamic,
            ]));

        if let Some(id) = exclude {
            query = query.filter(port_forward::Column::Id.ne(id));
        }

        Ok(query.count(&self.db).await? == 0)
    }

    async fn append_traffic(
        &self,
        forward_id: ForwardId,
        bytes_in: u64,
        bytes_out: u64,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        let record = traffic_record::ActiveModel {
            id: NotSet,
            forward_id: Set(forward_id),
            bytes_in: Set(bytes_in as i64),
            bytes_out: Set(bytes_out as i64),
            recorded_at: Set(recorded_at),
        };
        record.insert(&self.db).await?;
        Ok(())
    }
}
