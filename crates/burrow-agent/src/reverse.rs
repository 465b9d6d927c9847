//! Reverse listeners on the agent side
//!
//! Reverse forwards bind inside the private network: plain TCP listeners for
//! `reverse`, local SOCKS5 listeners for `reverse-dynamic`. Each accepted
//! user triggers a negotiation over the control channel; on success the
//! agent opens a data connection and splices it with the user socket.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use burrow_proto::{ControlMessage, Direction, PortForwardSpec};
use burrow_socks::{reply, REPLY_GENERAL_FAILURE, REPLY_SUCCESS};

use crate::agent::{open_data_connection, splice, AgentShared};

/// Live reverse listeners keyed by forward name, diffed on every
/// `config_update`.
pub(crate) struct ReverseListeners {
    shared: Arc<AgentShared>,
    active: HashMap<String, (PortForwardSpec, JoinHandle<()>)>,
}

impl ReverseListeners {
    pub(crate) fn new(shared: Arc<AgentShared>) -> Self {
        Self {
            shared,
            active: HashMap::new(),
        }
    }

    /// Close removed or changed listeners, then open added ones. Applied
    /// atomically from the dispatch loop, so no frame observes a half-done
    /// topology.
    pub(crate) fn reconcile(&mut self, forwards: &[PortForwardSpec]) {
        let desired: HashMap<String, PortForwardSpec> = forwards
            .iter()
            .filter(|f| {
                matches!(f.direction, Direction::Reverse | Direction::ReverseDynamic)
            })
            .map(|f| (f.name.clone(), f.clone()))
            .collect();

        let stale: Vec<String> = self
            .active
            .iter()
            .filter(|(name, (spec, _))| desired.get(*name) != Some(spec))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some((spec, handle)) = self.active.remove(&name) {
                handle.abort();
                info!(
                    forward = %name,
                    "reverse listener on {}:{} closed",
                    spec.local_ip,
                    spec.local_port
                );
            }
        }

        for (name, spec) in desired {
            if !self.active.contains_key(&name) {
                let handle = tokio::spawn(run_reverse_listener(self.shared.clone(), spec.clone()));
                self.active.insert(name, (spec, handle));
            }
        }
    }

    pub(crate) fn shutdown(&mut self) {
        for (_, (_, handle)) in self.active.drain() {
            handle.abort();
        }
    }
}

async fn run_reverse_listener(shared: Arc<AgentShared>, spec: PortForwardSpec) {
    let listener = match TcpListener::bind((spec.local_ip.as_str(), spec.local_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                forward = %spec.name,
                "failed to bind reverse listener on {}:{}: {}",
                spec.local_ip,
                spec.local_port,
                e
            );
            return;
        }
    };
    info!(
        forward = %spec.name,
        "reverse listener bound on {}:{}",
        spec.local_ip,
        spec.local_port
    );

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(forward = %spec.name, %peer_addr, "accepted reverse connection");
                match spec.direction {
                    Direction::ReverseDynamic => {
                        tokio::spawn(handle_reverse_dynamic_user(
                            shared.clone(),
                            spec.clone(),
                            stream,
                        ));
                    }
                    _ => {
                        tokio::spawn(handle_reverse_user(shared.clone(), spec.clone(), stream));
                    }
                }
            }
            Err(e) => {
                error!(forward = %spec.name, "accept failed: {}", e);
            }
        }
    }
}

/// Reverse TCP: ask the server to dial its configured target, then bridge.
async fn handle_reverse_user(shared: Arc<AgentShared>, spec: PortForwardSpec, user: TcpStream) {
    let connection_id = Uuid::new_v4().to_string();
    let waiter = shared.register_reverse_waiter(&connection_id);

    if shared
        .writer
        .send(&ControlMessage::ReverseConnection {
            proxy_name: spec.name.clone(),
            connection_id: connection_id.clone(),
        })
        .await
        .is_err()
    {
        shared.discard_reverse_waiter(&connection_id);
        return;
    }

    match tokio::time::timeout(shared.config.negotiation_timeout, waiter).await {
        Ok(Ok(Ok(()))) => {
            let data = match open_data_connection(&shared.config.server_addr, &connection_id).await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(forward = %spec.name, connection_id, "data connection failed: {}", e);
                    return;
                }
            };
            splice(user, data).await;
        }
        Ok(Ok(Err(error))) => {
            debug!(forward = %spec.name, connection_id, "server dial failed: {}", error);
        }
        Ok(Err(_)) | Err(_) => {
            debug!(forward = %spec.name, connection_id, "reverse negotiation timed out");
            shared.discard_reverse_waiter(&connection_id);
        }
    }
}

/// Reverse dynamic: negotiate SOCKS5 locally, have the server dial the
/// target from its network, then bridge.
async fn handle_reverse_dynamic_user(
    shared: Arc<AgentShared>,
    spec: PortForwardSpec,
    mut user: TcpStream,
) {
    let negotiation = tokio::time::timeout(
        shared.config.negotiation_timeout,
        burrow_socks::negotiate(&mut user),
    )
    .await;
    let request = match negotiation {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            debug!(forward = %spec.name, "socks negotiation failed: {}", e);
            return;
        }
        Err(_) => {
            debug!(forward = %spec.name, "socks negotiation timed out");
            return;
        }
    };

    let connection_id = Uuid::new_v4().to_string();
    let waiter = shared.register_reverse_waiter(&connection_id);

    if shared
        .writer
        .send(&ControlMessage::ReverseDynamic {
            proxy_name: spec.name.clone(),
            connection_id: connection_id.clone(),
            target_host: request.addr.host(),
            target_port: request.port,
        })
        .await
        .is_err()
    {
        shared.discard_reverse_waiter(&connection_id);
        return;
    }

    match tokio::time::timeout(shared.config.negotiation_timeout, waiter).await {
        Ok(Ok(Ok(()))) => {
            if user.write_all(&reply(REPLY_SUCCESS)).await.is_err() {
                return;
            }
            let data = match open_data_connection(&shared.config.server_addr, &connection_id).await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(forward = %spec.name, connection_id, "data connection failed: {}", e);
                    return;
                }
            };
            splice(user, data).await;
        }
        Ok(Ok(Err(error))) => {
            debug!(forward = %spec.name, connection_id, "server dial failed: {}", error);
            let _ = user.write_all(&reply(REPLY_GENERAL_FAILURE)).await;
        }
        Ok(Err(_)) | Err(_) => {
            debug!(forward = %spec.name, connection_id, "reverse negotiation timed out");
            shared.discard_reverse_waiter(&connection_id);
            let _ = user.write_all(&reply(REPLY_GENERAL_FAILURE)).await;
        }
    }
}
