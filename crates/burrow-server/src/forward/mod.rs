//! Forward engines: per-direction orchestration of negotiation and piping

pub(crate) mod reverse;
pub(crate) mod socks;
pub(crate) mod tcp;
pub(crate) mod udp;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::Instant;
use uuid::Uuid;

use burrow_catalog::AgentId;
use burrow_control::{PendingEvent, PendingTicket};
use burrow_proto::ControlWriter;

use crate::server::ServerState;

/// What an engine task needs to talk to its agent and the shared state.
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub state: Arc<ServerState>,
    pub session_id: Uuid,
    pub agent_id: AgentId,
    pub writer: Arc<ControlWriter>,
}

/// Wait for the twin data connection on a pending ticket.
///
/// Returns the data socket halves and any residual payload, or `None` when
/// the negotiation failed or the deadline expired. The pending entry is gone
/// in every case; a deadline that loses the race with a join still drains
/// the delivered socket.
pub(crate) async fn await_data_join(
    state: &ServerState,
    connection_id: &str,
    mut ticket: PendingTicket,
) -> Option<(OwnedReadHalf, OwnedWriteHalf, Bytes)> {
    let deadline = Instant::now() + state.config.pending_timeout;
    loop {
        match tokio::time::timeout_at(deadline, ticket.events.recv()).await {
            Ok(Some(PendingEvent::Data {
                read,
                write,
                residual,
            })) => return Some((read, write, residual)),
            Ok(Some(PendingEvent::Ready)) => continue,
            Ok(Some(PendingEvent::Failed(error))) => {
                tracing::debug!(connection_id, error = %error, "negotiation failed");
                return None;
            }
            Ok(None) => return None,
            Err(_) => {
                if state.pending.abandon(connection_id, ticket.epoch) {
                    tracing::debug!(connection_id, "data connection did not arrive in time");
                    return None;
                }
                // Lost the race: a join or failure already consumed the
                // entry, so its event is in (or about to enter) the channel.
                return match tokio::time::timeout(
                    Duration::from_secs(1),
                    ticket.events.recv(),
                )
                .await
                {
                    Ok(Some(PendingEvent::Data {
                        read,
                        write,
                        residual,
                    })) => Some((read, write, residual)),
                    _ => None,
                };
            }
        }
    }
}
