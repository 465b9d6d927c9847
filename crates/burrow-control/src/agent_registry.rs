//! Agent registry: live control sessions keyed by agent id
//!
//! At most one live session per agent. A new authenticated handshake for an
//! already-connected agent replaces the old handle; the caller tears the
//! superseded session down. Removal is identity-compared so a superseded
//! session's teardown never evicts its successor.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use burrow_catalog::AgentId;
use burrow_proto::ControlWriter;

/// Commands delivered to a session's mailbox, processed in arrival order
/// with its socket frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Re-query the catalog, reconcile listeners, push `config_update`.
    Reload,
    /// A newer session for the same agent took over; exit without cleanup.
    Superseded,
}

/// Handle to a live, authenticated control session.
#[derive(Clone)]
pub struct SessionHandle {
    /// Identity of this particular session, distinct across reconnects.
    pub session_id: Uuid,
    pub agent_id: AgentId,
    pub agent_name: String,
    /// Mailbox into the session's dispatch loop.
    pub commands: mpsc::Sender<SessionCommand>,
    /// Serialized writer for the control socket.
    pub writer: Arc<ControlWriter>,
}

/// Registry of connected agents.
pub struct AgentRegistry {
    agents: DashMap<AgentId, SessionHandle>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Register a session, replacing any previous one for the same agent.
    ///
    /// Returns the replaced handle so the caller can tear it down.
    pub fn register_or_replace(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let old = self.agents.insert(handle.agent_id, handle.clone());

        if let Some(ref replaced) = old {
            tracing::info!(
                agent_id = handle.agent_id,
                agent_name = %handle.agent_name,
                old_session = %replaced.session_id,
                new_session = %handle.session_id,
                "agent reconnected, superseding previous session"
            );
        } else {
            tracing::info!(
                agent_id = handle.agent_id,
                agent_name = %handle.agent_name,
                session = %handle.session_id,
                "agent connected"
            );
        }

        old
    }

    /// Remove the entry for `agent_id` only if it still belongs to
    /// `session_id`. The no-op case is a superseded session cleaning up
    /// after its successor already took the slot.
    pub fn remove_if_current(&self, agent_id: AgentId, session_id: Uuid) -> bool {
        let removed = self
            .agents
            .remove_if(&agent_id, |_, handle| handle.session_id == session_id)
            .is_some();

        if removed {
            tracing::info!(agent_id, session = %session_id, "agent disconnected");
        }
        removed
    }

    pub fn get(&self, agent_id: AgentId) -> Option<SessionHandle> {
        self.agents.get(&agent_id).map(|h| h.value().clone())
    }

    pub fn is_connected(&self, agent_id: AgentId) -> bool {
        self.agents.contains_key(&agent_id)
    }

    /// Ids of all connected agents.
    pub fn connected_agents(&self) -> Vec<AgentId> {
        self.agents.iter().map(|e| *e.key()).collect()
    }

    pub fn count(&self) -> usize {
        self.agents.len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    /// A handle whose writer wraps a real loopback socket; the sessions
    /// under test never write or receive commands.
    async fn test_handle(agent_id: AgentId) -> SessionHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        drop(accepted);
        let (_read, write) = client.unwrap().into_split();
        let (commands, _rx) = mpsc::channel(8);
        SessionHandle {
            session_id: Uuid::new_v4(),
            agent_id,
            agent_name: format!("agent-{agent_id}"),
            commands,
            writer: Arc::new(ControlWriter::new(write)),
        }
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = AgentRegistry::new();
        let handle = test_handle(1).await;
        let session = handle.session_id;

        assert!(registry.register_or_replace(handle).is_none());
        assert!(registry.is_connected(1));
        assert_eq!(registry.get(1).unwrap().session_id, session);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_replace_returns_old_handle() {
        let registry = AgentRegistry::new();
        let first = test_handle(1).await;
        let first_session = first.session_id;
        registry.register_or_replace(first);

        let second = test_handle(1).await;
        let second_session = second.session_id;
        let old = registry.register_or_replace(second).unwrap();

        assert_eq!(old.session_id, first_session);
        assert_eq!(registry.get(1).unwrap().session_id, second_session);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_superseded_session_cannot_evict_successor() {
        let registry = AgentRegistry::new();
        let first = test_handle(1).await;
        let first_session = first.session_id;
        registry.register_or_replace(first);

        let second = test_handle(1).await;
        let second_session = second.session_id;
        registry.register_or_replace(second);

        // The stale session's cleanup is a no-op.
        assert!(!registry.remove_if_current(1, first_session));
        assert!(registry.is_connected(1));

        assert!(registry.remove_if_current(1, second_session));
        assert!(!registry.is_connected(1));
    }
}
