//! Forward-dynamic engine: SOCKS5 on the server, dial on the agent side

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;

use burrow_catalog::ForwardRecord;
use burrow_control::PendingEvent;
use burrow_proto::ControlMessage;
use burrow_socks::{reply, REPLY_GENERAL_FAILURE, REPLY_SUCCESS};

use super::EngineContext;
use crate::pipe::pipe_pair;

/// Bytes a user may pipeline after the CONNECT request while the agent-side
/// dial is still in flight.
const MAX_PRE_DATA: usize = 256 * 1024;

/// Accept loop for one forward-dynamic listener.
pub(crate) async fn run_socks_listener(
    ctx: EngineContext,
    listener: TcpListener,
    forward: ForwardRecord,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(forward = %forward.name, %peer_addr, "accepted socks connection");
                tokio::spawn(handle_user_connection(ctx.clone(), forward.clone(), stream));
            }
            Err(e) => {
                error!(forward = %forward.name, "accept failed: {}", e);
            }
        }
    }
}

async fn handle_user_connection(ctx: EngineContext, forward: ForwardRecord, mut user: TcpStream) {
    let negotiation = tokio::time::timeout(
        ctx.state.config.handshake_timeout,
        burrow_socks::negotiate(&mut user),
    )
    .await;
    let request = match negotiation {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            debug!(forward = %forward.name, error = %e, "socks negotiation failed");
            return;
        }
        Err(_) => {
            debug!(forward = %forward.name, "socks negotiation timed out");
            return;
        }
    };

    let connection_id = Uuid::new_v4().to_string();
    let Some(mut ticket) =
        ctx.state
            .pending
            .register(&connection_id, ctx.agent_id, ctx.session_id, forward.id)
    else {
        return;
    };

    let instruction = ControlMessage::DynamicConnection {
        proxy_name: forward.name.clone(),
        connection_id: connection_id.clone(),
        target_host: request.addr.host(),
        target_port: request.port,
    };
    if ctx.writer.send(&instruction).await.is_err() {
        ctx.state.pending.abandon(&connection_id, ticket.epoch);
        return;
    }

    // Wait for the agent-side dial while buffering anything the user
    // pipelines after the CONNECT request (a TLS ClientHello, typically).
    let (mut user_read, mut user_write) = user.into_split();
    let mut pre_data = BytesMut::new();
    let mut replied = false;
    let mut user_eof = false;
    let mut timed_out = false;
    let deadline = Instant::now() + ctx.state.config.pending_timeout;

    loop {
        tokio::select! {
            event = ticket.events.recv() => match event {
                Some(PendingEvent::Ready) => {
                    if !replied {
                        if user_write.write_all(&reply(REPLY_SUCCESS)).await.is_err() {
                            ctx.state.pending.abandon(&connection_id, ticket.epoch);
                            return;
                        }
                        replied = true;
                    }
                }
                Some(PendingEvent::Failed(e)) => {
                    debug!(forward = %forward.name, connection_id, error = %e, "agent dial failed");
                    let _ = user_write.write_all(&reply(REPLY_GENERAL_FAILURE)).await;
                    let _ = user_write.shutdown().await;
                    return;
                }
                Some(PendingEvent::Data { read, write, residual }) => {
                    if !replied && user_write.write_all(&reply(REPLY_SUCCESS)).await.is_err() {
                        return;
                    }
                    let counters = ctx.state.meter.counters(forward.id);
                    let (bytes_in, bytes_out) = pipe_pair(
                        (user_read, user_write),
                        (read, write),
                        pre_data.freeze(),
                        residual,
                        counters,
                    )
                    .await;
                    debug!(
                        forward = %forward.name,
                        connection_id,
                        bytes_in,
                        bytes_out,
                        "dynamic connection closed"
                    );
                    return;
                }
                None => return,
            },
            result = user_read.read_buf(&mut pre_data), if !user_eof && pre_data.len() < MAX_PRE_DATA => {
                match result {
                    // A half-closing user may still want the response.
                    Ok(0) => user_eof = true,
                    Ok(_) => {}
                    Err(_) => {
                        ctx.state.pending.abandon(&connection_id, ticket.epoch);
                        return;
                    }
                }
            },
            _ = tokio::time::sleep_until(deadline), if !timed_out => {
                if ctx.state.pending.abandon(&connection_id, ticket.epoch) {
                    debug!(forward = %forward.name, connection_id, "dynamic connect timed out");
                    return;
                }
                // Lost the race; the final event is already on its way.
                timed_out = true;
            }
        }
    }
}
