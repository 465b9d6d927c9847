//! Agent control loop: handshake, heartbeat, message dispatch, reconnect

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use burrow_proto::{
    ControlMessage, ControlWriter, Direction, FrameError, MessageReader, PortForwardSpec,
    ProxyType,
};

use crate::reverse::ReverseListeners;
use crate::udp::UdpSessionMux;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server closed the connection")]
    Disconnected,
}

/// Agent tuning knobs.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server control address (`host:port`).
    pub server_addr: String,
    /// Opaque auth token presented in `control_handshake`.
    pub token: String,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Delay before reconnecting after a lost session.
    pub reconnect_delay: Duration,
    /// Timeout for agent-side dials (local services, SOCKS5 targets).
    pub dial_timeout: Duration,
    /// How long a reverse negotiation may wait for the server's reply.
    pub negotiation_timeout: Duration,
    /// TCP keepalive period on the control socket.
    pub keepalive: Duration,
}

impl AgentConfig {
    pub fn new(server_addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            token: token.into(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(15),
            keepalive: Duration::from_secs(20),
        }
    }
}

/// State shared between the dispatch loop and spawned connection tasks.
pub(crate) struct AgentShared {
    pub(crate) config: AgentConfig,
    pub(crate) writer: Arc<ControlWriter>,
    forwards: Mutex<HashMap<String, PortForwardSpec>>,
    reverse_waiters: Mutex<HashMap<String, oneshot::Sender<Result<(), String>>>>,
}

impl AgentShared {
    fn set_forwards(&self, forwards: &[PortForwardSpec]) {
        let mut map = self.forwards.lock().unwrap();
        map.clear();
        for spec in forwards {
            map.insert(spec.name.clone(), spec.clone());
        }
    }

    fn forward(&self, name: &str) -> Option<PortForwardSpec> {
        self.forwards.lock().unwrap().get(name).cloned()
    }

    /// Park a oneshot for a `reverse_*` negotiation reply.
    pub(crate) fn register_reverse_waiter(
        &self,
        connection_id: &str,
    ) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        self.reverse_waiters
            .lock()
            .unwrap()
            .insert(connection_id.to_string(), tx);
        rx
    }

    pub(crate) fn discard_reverse_waiter(&self, connection_id: &str) {
        self.reverse_waiters.lock().unwrap().remove(connection_id);
    }

    fn complete_reverse(&self, connection_id: &str, result: Result<(), String>) {
        match self.reverse_waiters.lock().unwrap().remove(connection_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(connection_id, "reverse reply with no waiter"),
        }
    }
}

/// The tunnel agent.
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run forever, reconnecting with a fixed backoff whenever the control
    /// session ends.
    pub async fn run(&self) -> Result<(), AgentError> {
        loop {
            match self.run_once().await {
                Ok(()) => info!("control session ended, reconnecting"),
                Err(AgentError::AuthRejected(reason)) => {
                    // A bad token will not fix itself by retrying fast;
                    // still retry so a re-enabled agent comes back.
                    warn!("authentication rejected: {}", reason);
                }
                Err(e) => warn!("control session failed: {}", e),
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    /// One full control-session lifecycle: connect, authenticate, dispatch
    /// until the connection ends.
    pub async fn run_once(&self) -> Result<(), AgentError> {
        let stream = TcpStream::connect(&self.config.server_addr).await?;
        enable_keepalive(&stream, self.config.keepalive);
        let (read_half, write_half) = stream.into_split();
        let mut reader = MessageReader::new(read_half);
        let writer = Arc::new(ControlWriter::new(write_half));

        writer
            .send(&ControlMessage::ControlHandshake {
                token: self.config.token.clone(),
            })
            .await?;

        let forwards = match reader.next_message().await? {
            Some(ControlMessage::AuthResponse {
                success: true,
                port_forwards,
                ..
            }) => port_forwards.unwrap_or_default(),
            Some(ControlMessage::AuthResponse {
                success: false,
                error,
                ..
            }) => {
                return Err(AgentError::AuthRejected(
                    error.unwrap_or_else(|| "no reason given".to_string()),
                ))
            }
            Some(other) => {
                return Err(AgentError::Protocol(format!(
                    "expected auth_response, got {:?}",
                    other
                )))
            }
            None => return Err(AgentError::Disconnected),
        };

        info!(
            server = %self.config.server_addr,
            forwards = forwards.len(),
            "authenticated with server"
        );

        let shared = Arc::new(AgentShared {
            config: self.config.clone(),
            writer: writer.clone(),
            forwards: Mutex::new(HashMap::new()),
            reverse_waiters: Mutex::new(HashMap::new()),
        });
        shared.set_forwards(&forwards);

        let mut reverse_listeners = ReverseListeners::new(shared.clone());
        reverse_listeners.reconcile(&forwards);

        let heartbeat = spawn_heartbeat(writer.clone(), self.config.heartbeat_interval);
        let udp = UdpSessionMux::new(writer.clone());

        let result = loop {
            match reader.next_message().await {
                Ok(Some(msg)) => {
                    dispatch_message(&shared, &mut reverse_listeners, &udp, msg).await
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(AgentError::Frame(e)),
            }
        };

        heartbeat.abort();
        reverse_listeners.shutdown();
        udp.shutdown();
        result
    }
}

fn spawn_heartbeat(
    writer: Arc<ControlWriter>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if writer.send(&ControlMessage::Heartbeat {}).await.is_err() {
                debug!("heartbeat write failed, control socket gone");
                return;
            }
        }
    })
}

async fn dispatch_message(
    shared: &Arc<AgentShared>,
    reverse_listeners: &mut ReverseListeners,
    udp: &UdpSessionMux,
    msg: ControlMessage,
) {
    match msg {
        ControlMessage::NewConnection {
            proxy_name,
            connection_id,
        } => match shared.forward(&proxy_name) {
            Some(spec) if spec.direction == Direction::Forward && spec.proxy_type == ProxyType::Tcp => {
                tokio::spawn(handle_new_connection(shared.clone(), spec, connection_id));
            }
            _ => warn!(proxy_name, "new_connection for unknown forward"),
        },

        ControlMessage::DynamicConnection {
            proxy_name,
            connection_id,
            target_host,
            target_port,
        } => {
            tokio::spawn(handle_dynamic_connection(
                shared.clone(),
                proxy_name,
                connection_id,
                target_host,
                target_port,
            ));
        }

        ControlMessage::ConfigUpdate { port_forwards } => {
            info!(count = port_forwards.len(), "configuration update received");
            reverse_listeners.reconcile(&port_forwards);
            shared.set_forwards(&port_forwards);
        }

        ControlMessage::ReverseReady { connection_id }
        | ControlMessage::ReverseDynamicReady { connection_id } => {
            shared.complete_reverse(&connection_id, Ok(()));
        }

        ControlMessage::ReverseFailed {
            connection_id,
            error,
        }
        | ControlMessage::ReverseDynamicFailed {
            connection_id,
            error,
        } => {
            shared.complete_reverse(&connection_id, Err(error));
        }

        ControlMessage::UdpPacket {
            connection_id,
            data,
            target_host,
            target_port,
            ..
        } => {
            udp.handle_packet(connection_id, data, target_host, target_port)
                .await;
        }

        ControlMessage::UdpClose { connection_id } => {
            udp.close(&connection_id);
        }

        ControlMessage::HeartbeatAck {} => {
            debug!("heartbeat acknowledged");
        }

        other => {
            debug!(message = ?other, "ignoring unexpected control frame");
        }
    }
}

/// Forward-TCP data path: open the data connection, then dial the local
/// service. A failed local dial tears the data socket down and the server
/// observes EOF on the user side.
async fn handle_new_connection(
    shared: Arc<AgentShared>,
    spec: PortForwardSpec,
    connection_id: String,
) {
    let data = match open_data_connection(&shared.config.server_addr, &connection_id).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(forward = %spec.name, connection_id, "data connection failed: {}", e);
            return;
        }
    };

    let dialed = tokio::time::timeout(
        shared.config.dial_timeout,
        TcpStream::connect((spec.local_ip.as_str(), spec.local_port)),
    )
    .await;
    let target = match dialed {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(
                forward = %spec.name,
                connection_id,
                "local dial {}:{} failed: {}",
                spec.local_ip,
                spec.local_port,
                e
            );
            return;
        }
        Err(_) => {
            debug!(forward = %spec.name, connection_id, "local dial timed out");
            return;
        }
    };

    splice(data, target).await;
}

/// Forward-SOCKS5 data path: dial the requested target, report the outcome,
/// then open the data connection and splice.
async fn handle_dynamic_connection(
    shared: Arc<AgentShared>,
    proxy_name: String,
    connection_id: String,
    target_host: String,
    target_port: u16,
) {
    let dialed = tokio::time::timeout(
        shared.config.dial_timeout,
        TcpStream::connect((target_host.as_str(), target_port)),
    )
    .await;

    let target = match dialed {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(proxy_name, connection_id, target_host, target_port, "target dial failed: {}", e);
            let _ = shared
                .writer
                .send(&ControlMessage::DynamicFailed {
                    connection_id,
                    error: e.to_string(),
                })
                .await;
            return;
        }
        Err(_) => {
            debug!(proxy_name, connection_id, target_host, target_port, "target dial timed out");
            let _ = shared
                .writer
                .send(&ControlMessage::DynamicFailed {
                    connection_id,
                    error: "dial timed out".to_string(),
                })
                .await;
            return;
        }
    };

    if shared
        .writer
        .send(&ControlMessage::DynamicReady {
            connection_id: connection_id.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    let data = match open_data_connection(&shared.config.server_addr, &connection_id).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(proxy_name, connection_id, "data connection failed: {}", e);
            return;
        }
    };

    splice(data, target).await;
}

/// Dial the server and present `data_connection` as the first frame.
/// Everything after that line, both ways, is payload.
pub(crate) async fn open_data_connection(
    server_addr: &str,
    connection_id: &str,
) -> Result<TcpStream, AgentError> {
    let mut stream = TcpStream::connect(server_addr).await?;
    let mut line = serde_json::to_vec(&ControlMessage::DataConnection {
        connection_id: connection_id.to_string(),
    })
    .map_err(|e| AgentError::Protocol(e.to_string()))?;
    line.push(b'\n');
    stream.write_all(&line).await?;
    Ok(stream)
}

/// Splice two streams until both directions finish.
pub(crate) async fn splice(mut a: TcpStream, mut b: TcpStream) {
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((to_b, to_a)) => debug!(to_b, to_a, "splice finished"),
        Err(e) => debug!("splice ended: {}", e),
    }
}

pub(crate) fn enable_keepalive(stream: &TcpStream, period: Duration) {
    let keepalive = socket2::TcpKeepalive::new().with_time(period);
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!("failed to enable tcp keepalive: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = AgentConfig::new("relay.example.com:7000", "tok");
        assert_eq!(config.server_addr, "relay.example.com:7000");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_reverse_waiter_round_trip() {
        let (_, write_half) = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (client, accepted) =
                tokio::join!(TcpStream::connect(addr), listener.accept());
            drop(accepted);
            client.unwrap().into_split()
        };
        let shared = AgentShared {
            config: AgentConfig::new("localhost:7000", "tok"),
            writer: Arc::new(ControlWriter::new(write_half)),
            forwards: Mutex::new(HashMap::new()),
            reverse_waiters: Mutex::new(HashMap::new()),
        };

        let waiter = shared.register_reverse_waiter("c1");
        shared.complete_reverse("c1", Ok(()));
        assert_eq!(waiter.await.unwrap(), Ok(()));

        // Unknown ids are ignored.
        shared.complete_reverse("c2", Err("x".to_string()));

        let waiter = shared.register_reverse_waiter("c3");
        shared.discard_reverse_waiter("c3");
        assert!(waiter.await.is_err());
    }
}
