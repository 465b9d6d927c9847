//! Reverse engines: agent-initiated negotiations, server-side dials
//!
//! For reverse TCP the server dials the forward's configured
//! `remote_ip:remote_port`; for reverse dynamic it dials whatever target the
//! agent's local SOCKS5 user asked for. Either way the dialed socket parks
//! behind a pending entry until the agent's data connection joins it.

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::debug;

use burrow_catalog::ForwardRecord;
use burrow_control::PendingTicket;
use burrow_proto::ControlMessage;

use super::{await_data_join, EngineContext};
use crate::pipe::pipe_pair;

/// Handle `reverse_connection`: dial the forward's server-side target.
pub(crate) async fn handle_reverse_connection(
    ctx: EngineContext,
    forward: ForwardRecord,
    connection_id: String,
) {
    let host = forward.remote_ip.clone();
    let port = forward.remote_port;
    dial_and_park(
        ctx,
        forward,
        connection_id,
        host,
        port,
        ReverseKind::Tcp,
    )
    .await;
}

/// Handle `reverse_dynamic`: dial the SOCKS5 target from the server network.
pub(crate) async fn handle_reverse_dynamic(
    ctx: EngineContext,
    forward: ForwardRecord,
    connection_id: String,
    target_host: String,
    target_port: u16,
) {
    dial_and_park(
        ctx,
        forward,
        connection_id,
        target_host,
        target_port,
        ReverseKind::Dynamic,
    )
    .await;
}

#[derive(Clone, Copy)]
enum ReverseKind {
    Tcp,
    Dynamic,
}

impl ReverseKind {
    fn ready(&self, connection_id: String) -> ControlMessage {
        match self {
            ReverseKind::Tcp => ControlMessage::ReverseReady { connection_id },
            ReverseKind::Dynamic => ControlMessage::ReverseDynamicReady { connection_id },
        }
    }

    fn failed(&self, connection_id: String, error: String) -> ControlMessage {
        match self {
            ReverseKind::Tcp => ControlMessage::ReverseFailed {
                connection_id,
                error,
            },
            ReverseKind::Dynamic => ControlMessage::ReverseDynamicFailed {
                connection_id,
                error,
            },
        }
    }
}

async fn dial_and_park(
    ctx: EngineContext,
    forward: ForwardRecord,
    connection_id: String,
    host: String,
    port: u16,
    kind: ReverseKind,
) {
    let dialed = tokio::time::timeout(
        ctx.state.config.dial_timeout,
        TcpStream::connect((host.as_str(), port)),
    )
    .await;

    let target = match dialed {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(forward = %forward.name, connection_id, host, port, "reverse dial failed: {}", e);
            let _ = ctx
                .writer
                .send(&kind.failed(connection_id, e.to_string()))
                .await;
            return;
        }
        Err(_) => {
            debug!(forward = %forward.name, connection_id, host, port, "reverse dial timed out");
            let _ = ctx
                .writer
                .send(&kind.failed(connection_id, "dial timed out".to_string()))
                .await;
            return;
        }
    };

    // Park the target socket before replying so the agent's data connection
    // can never race an absent entry.
    let Some(ticket) =
        ctx.state
            .pending
            .register(&connection_id, ctx.agent_id, ctx.session_id, forward.id)
    else {
        let _ = ctx
            .writer
            .send(&kind.failed(connection_id, "duplicate connection id".to_string()))
            .await;
        return;
    };

    if ctx
        .writer
        .send(&kind.ready(connection_id.clone()))
        .await
        .is_err()
    {
        ctx.state.pending.abandon(&connection_id, ticket.epoch);
        return;
    }

    wait_and_pipe(ctx, forward, connection_id, target, ticket).await;
}

async fn wait_and_pipe(
    ctx: EngineContext,
    forward: ForwardRecord,
    connection_id: String,
    target: TcpStream,
    ticket: PendingTicket,
) {
    let Some((read, write, residual)) =
        await_data_join(&ctx.state, &connection_id, ticket).await
    else {
        return;
    };

    // User bytes enter through the data connection in reverse modes, so the
    // data side is the entry for metering purposes.
    let counters = ctx.state.meter.counters(forward.id);
    let (bytes_in, bytes_out) = pipe_pair(
        (read, write),
        target.into_split(),
        residual,
        Bytes::new(),
        counters,
    )
    .await;
    debug!(
        forward = %forward.name,
        connection_id,
        bytes_in,
        bytes_out,
        "reverse connection closed"
    );
}
