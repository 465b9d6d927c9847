//! Control-session state machine
//!
//! Every inbound TCP connection starts here. The first frame decides whether
//! it is a control session (`control_handshake`) or a data connection
//! (`data_connection`); anything else destroys it. Authenticated sessions
//! loop over socket frames, the command mailbox and the heartbeat deadline,
//! dispatching strictly in arrival order.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use burrow_catalog::{AgentId, AgentRecord, ForwardRecord};
use burrow_control::{PortClaimError, SessionCommand, SessionHandle};
use burrow_proto::{ControlMessage, ControlReader, ControlWriter, Direction, MessageReader, ProxyType};

use crate::forward::{reverse, socks, tcp, udp, EngineContext};
use crate::server::ServerState;

/// Entry point for every accepted TCP connection on the control port.
pub(crate) async fn handle_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    enable_keepalive(&stream, state.config.keepalive);

    let (read_half, write_half) = stream.into_split();
    let mut reader = MessageReader::new(read_half);

    let first = tokio::time::timeout(state.config.handshake_timeout, reader.next_message()).await;
    let first = match first {
        Ok(Ok(Some(msg))) => msg,
        Ok(Ok(None)) => {
            debug!(%peer_addr, "connection closed before first frame");
            return;
        }
        Ok(Err(e)) => {
            warn!(%peer_addr, "framing error before handshake: {}", e);
            return;
        }
        Err(_) => {
            debug!(%peer_addr, "handshake timed out");
            return;
        }
    };

    match first {
        ControlMessage::DataConnection { connection_id } => {
            // Reclassify as a data connection: the remaining buffered bytes
            // are tunneled payload and travel with the socket.
            let residual = reader.take_residual();
            let read = reader.into_inner();
            if !state.pending.join(&connection_id, read, write_half, residual) {
                debug!(%peer_addr, connection_id, "data connection with no matching pending entry");
            }
        }
        ControlMessage::ControlHandshake { token } => {
            run_control_session(state, reader, Arc::new(ControlWriter::new(write_half)), peer_addr, token).await;
        }
        other => {
            warn!(%peer_addr, message = ?other, "unexpected first frame, destroying connection");
        }
    }
}

async fn run_control_session(
    state: Arc<ServerState>,
    mut reader: ControlReader,
    writer: Arc<ControlWriter>,
    peer_addr: SocketAddr,
    token: String,
) {
    let agent = match state.catalog.agent_by_token(&token).await {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            info!(%peer_addr, "handshake with unknown token or disabled agent");
            let _ = writer
                .send(&ControlMessage::AuthResponse {
                    success: false,
                    error: Some("unknown token or agent disabled".to_string()),
                    port_forwards: None,
                })
                .await;
            return;
        }
        Err(e) => {
            error!(%peer_addr, "catalog lookup failed during auth: {}", e);
            let _ = writer
                .send(&ControlMessage::AuthResponse {
                    success: false,
                    error: Some("catalog unavailable".to_string()),
                    port_forwards: None,
                })
                .await;
            return;
        }
    };

    let forwards = match state.catalog.forwards_by_agent(agent.id).await {
        Ok(forwards) => forwards,
        Err(e) => {
            error!(agent_id = agent.id, "forward lookup failed during auth: {}", e);
            let _ = writer
                .send(&ControlMessage::AuthResponse {
                    success: false,
                    error: Some("catalog unavailable".to_string()),
                    port_forwards: None,
                })
                .await;
            return;
        }
    };

    let session_id = Uuid::new_v4();
    let (command_tx, mut commands) = mpsc::channel(8);
    let handle = SessionHandle {
        session_id,
        agent_id: agent.id,
        agent_name: agent.name.clone(),
        commands: command_tx,
        writer: writer.clone(),
    };

    // A reconnecting agent supersedes its previous session: tear the old
    // one's resources down here so the reconcile below can rebind its ports.
    if let Some(old) = state.registry.register_or_replace(handle) {
        let _ = old.commands.try_send(SessionCommand::Superseded);
        old.writer.shutdown().await;
        release_session_resources(&state, old.agent_id, old.session_id);
    }

    let specs = forwards.iter().map(|f| f.to_spec()).collect();
    if writer
        .send(&ControlMessage::AuthResponse {
            success: true,
            error: None,
            port_forwards: Some(specs),
        })
        .await
        .is_err()
    {
        release_session_resources(&state, agent.id, session_id);
        return;
    }

    info!(
        agent_id = agent.id,
        agent_name = %agent.name,
        %peer_addr,
        session = %session_id,
        forwards = forwards.len(),
        "agent authenticated"
    );

    let ctx = EngineContext {
        state: state.clone(),
        session_id,
        agent_id: agent.id,
        writer: writer.clone(),
    };
    reconcile_listeners(&ctx, &forwards).await;

    let mut forwards = forwards;
    let mut deadline = Instant::now() + state.config.heartbeat_timeout;

    loop {
        tokio::select! {
            frame = reader.next_message() => match frame {
                Ok(Some(ControlMessage::Heartbeat {})) => {
                    deadline = Instant::now() + state.config.heartbeat_timeout;
                    if writer.send(&ControlMessage::HeartbeatAck {}).await.is_err() {
                        break;
                    }
                }
                Ok(Some(msg)) => dispatch_message(&ctx, &agent, &forwards, msg).await,
                Ok(None) => {
                    info!(agent_id = agent.id, "control connection closed by agent");
                    break;
                }
                Err(e) => {
                    warn!(agent_id = agent.id, "control framing error: {}", e);
                    break;
                }
            },

            command = commands.recv() => match command {
                Some(SessionCommand::Reload) => {
                    match state.catalog.forwards_by_agent(agent.id).await {
                        Ok(new_forwards) => {
                            reconcile_listeners(&ctx, &new_forwards).await;
                            let specs = new_forwards.iter().map(|f| f.to_spec()).collect();
                            if writer
                                .send(&ControlMessage::ConfigUpdate { port_forwards: specs })
                                .await
                                .is_err()
                            {
                                break;
                            }
                            forwards = new_forwards;
                            info!(agent_id = agent.id, count = forwards.len(), "configuration pushed");
                        }
                        Err(e) => {
                            warn!(
                                agent_id = agent.id,
                                "catalog read failed during reload, keeping previous config: {}", e
                            );
                        }
                    }
                }
                Some(SessionCommand::Superseded) => {
                    info!(agent_id = agent.id, session = %session_id, "session superseded");
                    break;
                }
                None => break,
            },

            _ = tokio::time::sleep_until(deadline) => {
                warn!(agent_id = agent.id, "heartbeat timed out, destroying session");
                break;
            }
        }
    }

    release_session_resources(&state, agent.id, session_id);
}

/// Handle one authenticated frame. Slow work (dials) is spawned so dispatch
/// order for the session is preserved.
async fn dispatch_message(
    ctx: &EngineContext,
    agent: &AgentRecord,
    forwards: &[ForwardRecord],
    msg: ControlMessage,
) {
    match msg {
        ControlMessage::ReverseConnection {
            proxy_name,
            connection_id,
        } => match find_forward(forwards, &proxy_name, Direction::Reverse) {
            Some(forward) => {
                tokio::spawn(reverse::handle_reverse_connection(
                    ctx.clone(),
                    forward,
                    connection_id,
                ));
            }
            None => {
                warn!(agent_id = agent.id, proxy_name, "reverse_connection for unknown forward");
                let _ = ctx
                    .writer
                    .send(&ControlMessage::ReverseFailed {
                        connection_id,
                        error: format!("no reverse forward named {proxy_name}"),
                    })
                    .await;
            }
        },

        ControlMessage::ReverseDynamic {
            proxy_name,
            connection_id,
            target_host,
            target_port,
        } => match find_forward(forwards, &proxy_name, Direction::ReverseDynamic) {
            Some(forward) => {
                tokio::spawn(reverse::handle_reverse_dynamic(
                    ctx.clone(),
                    forward,
                    connection_id,
                    target_host,
                    target_port,
                ));
            }
            None => {
                warn!(agent_id = agent.id, proxy_name, "reverse_dynamic for unknown forward");
                let _ = ctx
                    .writer
                    .send(&ControlMessage::ReverseDynamicFailed {
                        connection_id,
                        error: format!("no reverse-dynamic forward named {proxy_name}"),
                    })
                    .await;
            }
        },

        ControlMessage::DynamicReady { connection_id } => {
            if ctx.state.pending.owner(&connection_id) == Some(agent.id) {
                ctx.state.pending.notify_ready(&connection_id);
            } else {
                debug!(agent_id = agent.id, connection_id, "dynamic_ready for unowned connection");
            }
        }

        ControlMessage::DynamicFailed {
            connection_id,
            error,
        } => {
            if ctx.state.pending.owner(&connection_id) == Some(agent.id) {
                ctx.state.pending.fail(&connection_id, &error);
            } else {
                debug!(agent_id = agent.id, connection_id, "dynamic_failed for unowned connection");
            }
        }

        ControlMessage::UdpPacketResponse {
            connection_id,
            data,
        } => {
            let Some(route) = ctx.state.udp_routes.get(&connection_id) else {
                debug!(connection_id, "udp response for unknown session");
                return;
            };
            if route.agent_id != agent.id {
                warn!(agent_id = agent.id, connection_id, "udp response for unowned session");
                return;
            }
            match BASE64.decode(data.as_bytes()) {
                Ok(payload) => {
                    route.touch();
                    match route.socket.send_to(&payload, route.source).await {
                        Ok(_) => ctx.state.meter.add(route.forward_id, 0, payload.len() as u64),
                        Err(e) => debug!(connection_id, "udp reply send failed: {}", e),
                    }
                }
                Err(e) => {
                    debug!(connection_id, "discarding udp response with invalid base64: {}", e);
                }
            }
        }

        ControlMessage::UdpClose { connection_id } => {
            if let Some(route) = ctx.state.udp_routes.get(&connection_id) {
                if route.agent_id == agent.id {
                    ctx.state.udp_routes.remove(&connection_id);
                    debug!(connection_id, "udp session closed by agent");
                }
            }
        }

        ControlMessage::Register {} => {
            warn!(agent_id = agent.id, "legacy register rejected; forwards are catalog-driven");
        }

        other => {
            debug!(agent_id = agent.id, message = ?other, "ignoring unexpected control frame");
        }
    }
}

fn find_forward(
    forwards: &[ForwardRecord],
    name: &str,
    direction: Direction,
) -> Option<ForwardRecord> {
    forwards
        .iter()
        .find(|f| f.name == name && f.direction == direction)
        .cloned()
}

/// Reconcile the session's server-side listeners with the desired set.
///
/// Closes removed, disabled and changed listeners before binding anything
/// new, so a port moving between forwards never double-binds. A port owned
/// by another live session leaves the forward dormant until the conflict is
/// resolved by a later reconciliation.
async fn reconcile_listeners(ctx: &EngineContext, forwards: &[ForwardRecord]) {
    let state = &ctx.state;
    let desired: HashMap<u16, &ForwardRecord> = forwards
        .iter()
        .filter(|f| f.enabled && f.direction.binds_server())
        .map(|f| (f.remote_port, f))
        .collect();

    let mut kept: HashSet<u16> = HashSet::new();
    for (port, current) in state.listeners.owned_by(ctx.session_id) {
        match desired.get(&port) {
            Some(f) if **f == current => {
                kept.insert(port);
            }
            _ => {
                state.listeners.release(port, ctx.session_id);
            }
        }
    }

    for (port, forward) in desired {
        if kept.contains(&port) {
            continue;
        }
        let forward = forward.clone();
        if let Err(PortClaimError::InUse { owner_agent, .. }) =
            state.listeners.reserve(port, ctx.session_id, forward.clone())
        {
            warn!(
                port,
                forward = %forward.name,
                agent_id = ctx.agent_id,
                owner_agent,
                "remote port already bound, leaving forward dormant"
            );
            continue;
        }
        if let Err(e) = bind_and_spawn(ctx, port, forward.clone()).await {
            error!(port, forward = %forward.name, "failed to bind listener: {}", e);
            state.listeners.release(port, ctx.session_id);
        }
    }
}

async fn bind_and_spawn(
    ctx: &EngineContext,
    port: u16,
    forward: ForwardRecord,
) -> std::io::Result<()> {
    let bind_addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
    let task = match (forward.direction, forward.proxy_type) {
        (Direction::Forward, ProxyType::Udp) => {
            let socket = UdpSocket::bind(bind_addr).await?;
            tokio::spawn(udp::run_udp_forward(
                ctx.clone(),
                socket,
                forward.clone(),
            ))
        }
        (Direction::Dynamic, _) => {
            let listener = TcpListener::bind(bind_addr).await?;
            tokio::spawn(socks::run_socks_listener(
                ctx.clone(),
                listener,
                forward.clone(),
            ))
        }
        _ => {
            let listener = TcpListener::bind(bind_addr).await?;
            tokio::spawn(tcp::run_tcp_listener(
                ctx.clone(),
                listener,
                forward.clone(),
            ))
        }
    };
    info!(port, forward = %forward.name, agent_id = ctx.agent_id, "listener bound");
    ctx.state.listeners.attach(port, ctx.session_id, task);
    Ok(())
}

/// Tear down everything a session owns. Idempotent: every removal is
/// identity-compared, so running this twice (or racing a successor) is a
/// no-op the second time.
fn release_session_resources(state: &Arc<ServerState>, agent_id: AgentId, session_id: Uuid) {
    let listeners = state.listeners.release_session(session_id);
    let pendings = state.pending.fail_session(session_id);
    let routes = state.udp_routes.remove_session(session_id);
    state.registry.remove_if_current(agent_id, session_id);
    if listeners + pendings + routes > 0 {
        debug!(
            agent_id,
            session = %session_id,
            listeners,
            pendings,
            routes,
            "session resources released"
        );
    }
}

fn enable_keepalive(stream: &TcpStream, period: Duration) {
    let keepalive = socket2::TcpKeepalive::new().with_time(period);
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!("failed to enable tcp keepalive: {}", e);
    }
}
