//! In-memory catalog for tests and ephemeral setups

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{AgentId, AgentRecord, Catalog, CatalogError, ForwardId, ForwardRecord};

/// One appended traffic delta.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficEntry {
    pub forward_id: ForwardId,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub recorded_at: DateTime<Utc>,
}

struct StoredAgent {
    record: AgentRecord,
    token: String,
}

#[derive(Default)]
struct Inner {
    agents: Vec<StoredAgent>,
    forwards: Vec<ForwardRecord>,
    traffic: Vec<TrafficEntry>,
    next_agent_id: AgentId,
    next_forward_id: ForwardId,
}

/// Catalog held entirely in memory. Mutations mirror what the external admin
/// surface would do against the database.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent(&self, name: &str, token: &str, enabled: bool) -> AgentId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_agent_id += 1;
        let id = inner.next_agent_id;
        inner.agents.push(StoredAgent {
            record: AgentRecord {
                id,
                name: name.to_string(),
                enabled,
            },
            token: token.to_string(),
        });
        id
    }

    pub fn set_agent_enabled(&self, agent_id: AgentId, enabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(agent) = inner.agents.iter_mut().find(|a| a.record.id == agent_id) {
            agent.record.enabled = enabled;
        }
    }

    /// Insert a forward; the `id` field of `record` is ignored and assigned.
    pub fn add_forward(&self, mut record: ForwardRecord) -> ForwardId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_forward_id += 1;
        record.id = inner.next_forward_id;
        let id = record.id;
        inner.forwards.push(record);
        id
    }

    pub fn set_forward_enabled(&self, forward_id: ForwardId, enabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(f) = inner.forwards.iter_mut().find(|f| f.id == forward_id) {
            f.enabled = enabled;
        }
    }

    pub fn remove_forward(&self, forward_id: ForwardId) {
        let mut inner = self.inner.lock().unwrap();
        inner.forwards.retain(|f| f.id != forward_id);
    }

    /// Snapshot of everything appended so far.
    pub fn traffic(&self) -> Vec<TrafficEntry> {
        self.inner.lock().unwrap().traffic.clone()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn agent_by_token(&self, token: &str) -> Result<Option<AgentRecord>, CatalogError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .agents
            .iter()
            .find(|a| a.token == token && a.record.enabled)
            .map(|a| a.record.clone()))
    }

    async fn forwards_by_agent(
        &self,
        agent_id: AgentId,
    ) -> Result<Vec<ForwardRecord>, CatalogError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .forwards
            .iter()
            .filter(|f| f.agent_id == agent_id && f.enabled)
            .cloned()
            .collect())
    }

    async fn is_remote_port_available(
        &self,
        remote_port: u16,
        exclude: Option<ForwardId>,
    ) -> Result<bool, CatalogError> {
        let inner = self.inner.lock().unwrap();
        Ok(!inner.forwards.iter().any(|f| {
            f.enabled
                && f.direction.binds_server()
                && f.remote_port == remote_port
                && Some(f.id) != exclude
        }))
    }

    async fn append_traffic(
        &self,
        forward_id: ForwardId,
        bytes_in: u64,
        bytes_out: u64,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        let mut inner = self.inner.lock().unwrap();
        inner.traffic.push(TrafficEntry {
            forward_id,
            bytes_in,
            bytes_out,
            recorded_at,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::{Direction, ProxyType};

    fn forward(agent_id: AgentId, name: &str, direction: Direction, remote_port: u16) -> ForwardRecord {
        ForwardRecord {
            id: 0,
            agent_id,
            name: name.to_string(),
            direction,
            proxy_type: ProxyType::Tcp,
            remote_port,
            remote_ip: String::new(),
            local_ip: "127.0.0.1".to_string(),
            local_port: 8080,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_token_lookup_filters_disabled() {
        let catalog = MemoryCatalog::new();
        let id = catalog.add_agent("edge-1", "tok-1", true);

        let found = catalog.agent_by_token("tok-1").await.unwrap();
        assert_eq!(found.unwrap().id, id);

        catalog.set_agent_enabled(id, false);
        assert!(catalog.agent_by_token("tok-1").await.unwrap().is_none());
        assert!(catalog.agent_by_token("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forwards_filter_disabled() {
        let catalog = MemoryCatalog::new();
        let agent = catalog.add_agent("edge-1", "tok-1", true);
        let f1 = catalog.add_forward(forward(agent, "ssh", Direction::Forward, 6000));
        catalog.add_forward(forward(agent, "web", Direction::Reverse, 3000));

        assert_eq!(catalog.forwards_by_agent(agent).await.unwrap().len(), 2);

        catalog.set_forward_enabled(f1, false);
        let rest = catalog.forwards_by_agent(agent).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "web");
    }

    #[tokio::test]
    async fn test_port_availability_only_counts_server_binding_directions() {
        let catalog = MemoryCatalog::new();
        let agent = catalog.add_agent("edge-1", "tok-1", true);
        catalog.add_forward(forward(agent, "rev", Direction::Reverse, 7001));

        // Reverse forwards do not bind the server.
        assert!(catalog.is_remote_port_available(7001, None).await.unwrap());

        let f = catalog.add_forward(forward(agent, "fwd", Direction::Forward, 7001));
        assert!(!catalog.is_remote_port_available(7001, None).await.unwrap());
        assert!(catalog
            .is_remote_port_available(7001, Some(f))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_traffic_append() {
        let catalog = MemoryCatalog::new();
        catalog.append_traffic(42, 10, 20, Utc::now()).await.unwrap();
        let entries = catalog.traffic();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].forward_id, 42);
        assert_eq!((entries[0].bytes_in, entries[0].bytes_out), (10, 20));
    }
}
