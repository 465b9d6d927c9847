//! Pending table: connection-id keyed rendezvous for data-connection joins
//!
//! Every forward negotiation parks the task that owns the waiting socket
//! behind an entry here. The twin data connection (or a failure signal)
//! reaches that task through the entry's event channel; removal is exactly
//! once, decided by whichever of {join, deadline, session teardown} runs
//! first. Deadline removal compares the entry epoch so a recycled connection
//! id is never torn down by a stale timer.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use uuid::Uuid;

use burrow_catalog::{AgentId, ForwardId};

/// What the waiting task hears about its connection.
#[derive(Debug)]
pub enum PendingEvent {
    /// The agent-side dial succeeded (forward-dynamic only); the data
    /// connection follows separately.
    Ready,
    /// Negotiation failed; the waiting socket must be destroyed.
    Failed(String),
    /// The twin data connection arrived. `residual` holds any payload bytes
    /// the codec buffered past the `data_connection` frame.
    Data {
        read: OwnedReadHalf,
        write: OwnedWriteHalf,
        residual: Bytes,
    },
}

struct PendingEntry {
    epoch: u64,
    agent_id: AgentId,
    session_id: Uuid,
    forward_id: ForwardId,
    tx: mpsc::Sender<PendingEvent>,
}

/// Receiver side handed to the task that owns the waiting socket.
pub struct PendingTicket {
    pub epoch: u64,
    pub events: mpsc::Receiver<PendingEvent>,
}

/// Process-wide table of pending joins.
pub struct PendingTable {
    entries: DashMap<String, PendingEntry>,
    epochs: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            epochs: AtomicU64::new(0),
        }
    }

    /// Insert-if-absent. Returns `None` when the connection id is already
    /// taken (a hostile or confused peer reusing an id).
    pub fn register(
        &self,
        connection_id: &str,
        agent_id: AgentId,
        session_id: Uuid,
        forward_id: ForwardId,
    ) -> Option<PendingTicket> {
        match self.entries.entry(connection_id.to_string()) {
            Entry::Occupied(_) => {
                tracing::warn!(connection_id, "refusing duplicate pending registration");
                None
            }
            Entry::Vacant(slot) => {
                let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
                let (tx, events) = mpsc::channel(4);
                slot.insert(PendingEntry {
                    epoch,
                    agent_id,
                    session_id,
                    forward_id,
                    tx,
                });
                Some(PendingTicket { epoch, events })
            }
        }
    }

    /// Join a data connection to its pending entry, transferring socket
    /// ownership to the waiting task in one step.
    ///
    /// Returns false when no entry matches (stale or expired id); the caller
    /// destroys the data connection.
    pub fn join(
        &self,
        connection_id: &str,
        read: OwnedReadHalf,
        write: OwnedWriteHalf,
        residual: Bytes,
    ) -> bool {
        let Some((_, entry)) = self.entries.remove(connection_id) else {
            return false;
        };
        entry
            .tx
            .try_send(PendingEvent::Data {
                read,
                write,
                residual,
            })
            .is_ok()
    }

    /// Signal `dynamic_ready` to the waiting task without removing the
    /// entry; the data connection is still to come.
    pub fn notify_ready(&self, connection_id: &str) -> bool {
        match self.entries.get(connection_id) {
            Some(entry) => entry.tx.try_send(PendingEvent::Ready).is_ok(),
            None => false,
        }
    }

    /// Fail and remove a single entry.
    pub fn fail(&self, connection_id: &str, error: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(connection_id) else {
            return false;
        };
        tracing::debug!(connection_id, forward_id = entry.forward_id, error, "pending failed");
        let _ = entry.tx.try_send(PendingEvent::Failed(error.to_string()));
        true
    }

    /// Deadline-path removal: only succeeds while the entry still carries
    /// the caller's epoch. Losing the race with a join is a no-op.
    pub fn abandon(&self, connection_id: &str, epoch: u64) -> bool {
        self.entries
            .remove_if(connection_id, |_, entry| entry.epoch == epoch)
            .is_some()
    }

    /// Fail every entry owned by a session. Run on session teardown.
    pub fn fail_session(&self, session_id: Uuid) -> usize {
        let owned: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().session_id == session_id)
            .map(|e| e.key().clone())
            .collect();

        let mut failed = 0;
        for connection_id in owned {
            let removed = self
                .entries
                .remove_if(&connection_id, |_, entry| entry.session_id == session_id);
            if let Some((_, entry)) = removed {
                let _ = entry
                    .tx
                    .try_send(PendingEvent::Failed("control session closed".to_string()));
                failed += 1;
            }
        }

        if failed > 0 {
            tracing::debug!(session = %session_id, count = failed, "failed pendings on session teardown");
        }
        failed
    }

    /// Agent that owns a pending entry, for routing checks.
    pub fn owner(&self, connection_id: &str) -> Option<AgentId> {
        self.entries.get(connection_id).map(|e| e.agent_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_halves() -> (OwnedReadHalf, OwnedWriteHalf) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        drop(accepted);
        client.unwrap().into_split()
    }

    #[tokio::test]
    async fn test_register_join_delivers_socket_and_residual() {
        let table = PendingTable::new();
        let session = Uuid::new_v4();
        let mut ticket = table.register("c1", 1, session, 10).unwrap();

        let (read, write) = socket_halves().await;
        assert!(table.join("c1", read, write, Bytes::from_static(b"early")));
        assert!(table.is_empty());

        match ticket.events.recv().await.unwrap() {
            PendingEvent::Data { residual, .. } => assert_eq!(&residual[..], b"early"),
            other => panic!("expected Data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration_refused() {
        let table = PendingTable::new();
        let session = Uuid::new_v4();
        let _ticket = table.register("c1", 1, session, 10).unwrap();
        assert!(table.register("c1", 1, session, 10).is_none());
    }

    #[tokio::test]
    async fn test_join_unknown_id_is_refused() {
        let table = PendingTable::new();
        let (read, write) = socket_halves().await;
        assert!(!table.join("nope", read, write, Bytes::new()));
    }

    #[tokio::test]
    async fn test_abandon_respects_epoch() {
        let table = PendingTable::new();
        let session = Uuid::new_v4();
        let ticket = table.register("c1", 1, session, 10).unwrap();
        let stale_epoch = ticket.epoch;

        // Entry is consumed and the id re-registered before the old timer fires.
        let (read, write) = socket_halves().await;
        assert!(table.join("c1", read, write, Bytes::new()));
        let _ticket2 = table.register("c1", 1, session, 10).unwrap();

        // The stale deadline must not delete the rebound entry.
        assert!(!table.abandon("c1", stale_epoch));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_session_only_touches_owned_entries() {
        let table = PendingTable::new();
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();
        let mut ticket_a = table.register("a", 1, session_a, 10).unwrap();
        let _ticket_b = table.register("b", 2, session_b, 20).unwrap();

        assert_eq!(table.fail_session(session_a), 1);
        assert_eq!(table.len(), 1);
        assert!(matches!(
            ticket_a.events.recv().await,
            Some(PendingEvent::Failed(_))
        ));
        assert!(table.owner("b").is_some());
    }

    #[tokio::test]
    async fn test_ready_keeps_entry_for_the_data_join() {
        let table = PendingTable::new();
        let session = Uuid::new_v4();
        let mut ticket = table.register("c1", 1, session, 10).unwrap();

        assert!(table.notify_ready("c1"));
        assert_eq!(table.len(), 1);
        assert!(matches!(
            ticket.events.recv().await,
            Some(PendingEvent::Ready)
        ));

        let (read, write) = socket_halves().await;
        assert!(table.join("c1", read, write, Bytes::new()));
    }
}
