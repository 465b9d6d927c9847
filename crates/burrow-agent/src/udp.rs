//! UDP session multiplexing on the agent side
//!
//! One lazily created socket per connection id. Replies from the target are
//! re-enveloped as `udp_packet_response`; sessions idle for a minute close
//! themselves and tell the server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use burrow_proto::{ControlMessage, ControlWriter};

const MAX_DATAGRAM: usize = 65536;

/// Sessions with no reply traffic for this long are closed.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct UdpSession {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

/// Connection-id keyed UDP sessions for one control session.
pub(crate) struct UdpSessionMux {
    writer: Arc<ControlWriter>,
    sessions: Arc<Mutex<HashMap<String, UdpSession>>>,
}

impl UdpSessionMux {
    pub(crate) fn new(writer: Arc<ControlWriter>) -> Self {
        Self {
            writer,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Deliver one enveloped datagram to its target, creating the session
    /// socket on first sighting of the connection id.
    pub(crate) async fn handle_packet(
        &self,
        connection_id: String,
        data: String,
        target_host: String,
        target_port: u16,
    ) {
        let payload = match BASE64.decode(data.as_bytes()) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(connection_id, "discarding udp packet with invalid base64: {}", e);
                return;
            }
        };

        let socket = {
            let existing = self
                .sessions
                .lock()
                .unwrap()
                .get(&connection_id)
                .map(|s| s.socket.clone());
            match existing {
                Some(socket) => socket,
                None => match self.open_session(&connection_id, &target_host).await {
                    Some(socket) => socket,
                    None => return,
                },
            }
        };

        if let Err(e) = socket
            .send_to(&payload, (target_host.as_str(), target_port))
            .await
        {
            debug!(
                connection_id,
                target_host, target_port, "udp send failed: {}", e
            );
            self.close(&connection_id);
            let _ = self
                .writer
                .send(&ControlMessage::UdpClose { connection_id })
                .await;
        }
    }

    /// Bind a fresh socket (family chosen by the target host literal) and
    /// spawn its reply reader.
    async fn open_session(&self, connection_id: &str, target_host: &str) -> Option<Arc<UdpSocket>> {
        let bind_addr = if target_host.parse::<std::net::Ipv6Addr>().is_ok() {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!(connection_id, "failed to bind udp session socket: {}", e);
                return None;
            }
        };
        debug!(connection_id, target_host, "udp session opened");

        let reader = tokio::spawn(run_session_reader(
            socket.clone(),
            connection_id.to_string(),
            self.writer.clone(),
            self.sessions.clone(),
        ));

        self.sessions.lock().unwrap().insert(
            connection_id.to_string(),
            UdpSession {
                socket: socket.clone(),
                reader,
            },
        );
        Some(socket)
    }

    /// Drop a session (server-initiated `udp_close` or local error).
    pub(crate) fn close(&self, connection_id: &str) {
        if let Some(session) = self.sessions.lock().unwrap().remove(connection_id) {
            session.reader.abort();
            debug!(connection_id, "udp session closed");
        }
    }

    pub(crate) fn shutdown(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for (_, session) in sessions.drain() {
            session.reader.abort();
        }
    }
}

/// Forward target replies to the server until the session idles out.
async fn run_session_reader(
    socket: Arc<UdpSocket>,
    connection_id: String,
    writer: Arc<ControlWriter>,
    sessions: Arc<Mutex<HashMap<String, UdpSession>>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match tokio::time::timeout(SESSION_IDLE_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _from))) => {
                let response = ControlMessage::UdpPacketResponse {
                    connection_id: connection_id.clone(),
                    data: BASE64.encode(&buf[..n]),
                };
                if writer.send(&response).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!(connection_id, "udp recv failed: {}", e);
                break;
            }
            Err(_) => {
                debug!(connection_id, "udp session idle, closing");
                let _ = writer
                    .send(&ControlMessage::UdpClose {
                        connection_id: connection_id.clone(),
                    })
                    .await;
                break;
            }
        }
    }
    sessions.lock().unwrap().remove(&connection_id);
}
