//! Forward-UDP engine: datagram envelopes over the control channel
//!
//! No secondary TCP connection: each datagram rides the control channel
//! base64-encoded. The server assigns a stable connection id per external
//! source address; replies come back through the shared route table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::net::UdpSocket;
use tracing::{debug, warn};
use uuid::Uuid;

use burrow_catalog::ForwardRecord;
use burrow_control::UdpRoute;
use burrow_proto::ControlMessage;

use super::EngineContext;

const MAX_DATAGRAM: usize = 65536;

/// Sessions with no traffic for this long are dropped and the agent told.
const ROUTE_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Datagram loop for one forward-UDP binding. Aborted when the listener is
/// released.
pub(crate) async fn run_udp_forward(
    ctx: EngineContext,
    socket: UdpSocket,
    forward: ForwardRecord,
) {
    let socket = Arc::new(socket);
    let mut by_source: HashMap<SocketAddr, String> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (n, source) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(forward = %forward.name, "udp recv failed: {}", e);
                        continue;
                    }
                };

                let connection_id = match by_source.get(&source) {
                    Some(id) if ctx.state.udp_routes.get(id).is_some() => id.clone(),
                    _ => {
                        let id = Uuid::new_v4().to_string();
                        let route = Arc::new(UdpRoute::new(
                            socket.clone(),
                            source,
                            ctx.agent_id,
                            ctx.session_id,
                            forward.id,
                        ));
                        ctx.state.udp_routes.insert(&id, route);
                        by_source.insert(source, id.clone());
                        debug!(forward = %forward.name, %source, connection_id = %id, "new udp session");
                        id
                    }
                };

                if let Some(route) = ctx.state.udp_routes.get(&connection_id) {
                    route.touch();
                }

                let envelope = ControlMessage::UdpPacket {
                    connection_id,
                    data: BASE64.encode(&buf[..n]),
                    target_host: forward.local_ip.clone(),
                    target_port: forward.local_port,
                    proxy_name: forward.name.clone(),
                };
                if ctx.writer.send(&envelope).await.is_err() {
                    debug!(forward = %forward.name, "control channel closed, stopping udp forward");
                    return;
                }
                ctx.state.meter.add(forward.id, n as u64, 0);
            }

            _ = sweep.tick() => {
                let stale: Vec<(SocketAddr, String)> = by_source
                    .iter()
                    .filter(|(_, id)| match ctx.state.udp_routes.get(id) {
                        Some(route) => route.idle_for() > ROUTE_IDLE_TIMEOUT,
                        None => true,
                    })
                    .map(|(source, id)| (*source, id.clone()))
                    .collect();

                for (source, connection_id) in stale {
                    by_source.remove(&source);
                    if ctx.state.udp_routes.remove(&connection_id).is_some() {
                        debug!(forward = %forward.name, %source, connection_id, "udp session expired");
                        let _ = ctx
                            .writer
                            .send(&ControlMessage::UdpClose { connection_id })
                            .await;
                    }
                }
            }
        }
    }
}
