//! Listener registry: server-side port ownership
//!
//! One entry per bound `remote_port`, carrying the owning session identity
//! and the abort handle of the accept task. Ports are reserved before the
//! bind so two reconciliations can never race into a double-bind; release is
//! identity-compared so a superseded session cannot close its successor's
//! listeners.

use std::sync::Mutex;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use burrow_catalog::{AgentId, ForwardId, ForwardRecord};

#[derive(Debug, Error)]
pub enum PortClaimError {
    #[error("port {port} already bound for agent {owner_agent}")]
    InUse { port: u16, owner_agent: AgentId },
}

struct ListenerEntry {
    agent_id: AgentId,
    session_id: Uuid,
    forward: ForwardRecord,
    /// Accept-loop task; aborting it drops the bound socket.
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Registry of bound server-side ports.
pub struct ListenerRegistry {
    listeners: DashMap<u16, ListenerEntry>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }

    /// Reserve a port for a session before binding it.
    ///
    /// The reservation makes the bind race-free: whoever holds the entry is
    /// the only task allowed to bind the port.
    pub fn reserve(
        &self,
        port: u16,
        session_id: Uuid,
        forward: ForwardRecord,
    ) -> Result<(), PortClaimError> {
        match self.listeners.entry(port) {
            Entry::Occupied(existing) => Err(PortClaimError::InUse {
                port,
                owner_agent: existing.get().agent_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(ListenerEntry {
                    agent_id: forward.agent_id,
                    session_id,
                    forward,
                    handle: Mutex::new(None),
                });
                Ok(())
            }
        }
    }

    /// Attach the accept task to a reserved port.
    pub fn attach(&self, port: u16, session_id: Uuid, handle: JoinHandle<()>) -> bool {
        match self.listeners.get(&port) {
            Some(entry) if entry.session_id == session_id => {
                *entry.handle.lock().unwrap() = Some(handle);
                true
            }
            _ => {
                // The reservation vanished under us; don't leak the task.
                handle.abort();
                false
            }
        }
    }

    /// Close a port owned by `session_id`. No-op for any other owner.
    pub fn release(&self, port: u16, session_id: Uuid) -> bool {
        let removed = self
            .listeners
            .remove_if(&port, |_, entry| entry.session_id == session_id);

        if let Some((_, entry)) = removed {
            if let Some(handle) = entry.handle.lock().unwrap().take() {
                handle.abort();
            }
            tracing::debug!(port, session = %session_id, "listener closed");
            true
        } else {
            false
        }
    }

    /// Close every port owned by a session. Run on session teardown.
    pub fn release_session(&self, session_id: Uuid) -> usize {
        let owned: Vec<u16> = self
            .listeners
            .iter()
            .filter(|e| e.value().session_id == session_id)
            .map(|e| *e.key())
            .collect();

        let mut closed = 0;
        for port in owned {
            if self.release(port, session_id) {
                closed += 1;
            }
        }
        closed
    }

    /// Ports currently owned by a session, with the forward each serves.
    pub fn owned_by(&self, session_id: Uuid) -> Vec<(u16, ForwardRecord)> {
        self.listeners
            .iter()
            .filter(|e| e.value().session_id == session_id)
            .map(|e| (*e.key(), e.value().forward.clone()))
            .collect()
    }

    /// Which forward a bound port serves, if any.
    pub fn forward_for(&self, port: u16) -> Option<ForwardId> {
        self.listeners.get(&port).map(|e| e.forward.id)
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.listeners.contains_key(&port)
    }

    pub fn count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
