//! Forward-TCP engine: server listener, agent-side local dial

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};
use uuid::Uuid;

use burrow_catalog::ForwardRecord;
use burrow_proto::ControlMessage;

use super::{await_data_join, EngineContext};
use crate::pipe::pipe_pair;

/// Accept loop for one forward-TCP listener. Aborted when the listener is
/// released.
pub(crate) async fn run_tcp_listener(
    ctx: EngineContext,
    listener: TcpListener,
    forward: ForwardRecord,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(forward = %forward.name, %peer_addr, "accepted forward connection");
                tokio::spawn(handle_user_connection(ctx.clone(), forward.clone(), stream));
            }
            Err(e) => {
                error!(forward = %forward.name, "accept failed: {}", e);
            }
        }
    }
}

async fn handle_user_connection(ctx: EngineContext, forward: ForwardRecord, user: TcpStream) {
    let connection_id = Uuid::new_v4().to_string();
    let Some(ticket) =
        ctx.state
            .pending
            .register(&connection_id, ctx.agent_id, ctx.session_id, forward.id)
    else {
        return;
    };

    let instruction = ControlMessage::NewConnection {
        proxy_name: forward.name.clone(),
        connection_id: connection_id.clone(),
    };
    if ctx.writer.send(&instruction).await.is_err() {
        ctx.state.pending.abandon(&connection_id, ticket.epoch);
        return;
    }

    let Some((read, write, residual)) =
        await_data_join(&ctx.state, &connection_id, ticket).await
    else {
        return;
    };

    let counters = ctx.state.meter.counters(forward.id);
    let (bytes_in, bytes_out) = pipe_pair(
        user.into_split(),
        (read, write),
        Bytes::new(),
        residual,
        counters,
    )
    .await;
    debug!(
        forward = %forward.name,
        connection_id,
        bytes_in,
        bytes_out,
        "forward connection closed"
    );
}
