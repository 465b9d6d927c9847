//! UDP route table: reply path for forward-UDP sessions
//!
//! The server assigns a connection id per distinct external source address.
//! Each id maps back to the bound UDP socket and the source, so
//! `udp_packet_response` frames find their way to the original sender.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use uuid::Uuid;

use burrow_catalog::{AgentId, ForwardId};

/// One live UDP session seen from the server side.
pub struct UdpRoute {
    pub socket: Arc<UdpSocket>,
    pub source: SocketAddr,
    pub agent_id: AgentId,
    pub session_id: Uuid,
    pub forward_id: ForwardId,
    last_seen: Mutex<Instant>,
}

impl UdpRoute {
    pub fn new(
        socket: Arc<UdpSocket>,
        source: SocketAddr,
        agent_id: AgentId,
        session_id: Uuid,
        forward_id: ForwardId,
    ) -> Self {
        Self {
            socket,
            source,
            agent_id,
            session_id,
            forward_id,
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }
}

/// Connection id -> route, shared between UDP listener tasks and the
/// control-session dispatcher.
pub struct UdpRouteTable {
    routes: DashMap<String, Arc<UdpRoute>>,
}

impl UdpRouteTable {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    pub fn insert(&self, connection_id: &str, route: Arc<UdpRoute>) {
        self.routes.insert(connection_id.to_string(), route);
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<UdpRoute>> {
        self.routes.get(connection_id).map(|r| r.value().clone())
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<UdpRoute>> {
        self.routes.remove(connection_id).map(|(_, r)| r)
    }

    /// Drop every route owned by a session. Run on session teardown.
    pub fn remove_session(&self, session_id: Uuid) -> usize {
        let owned: Vec<String> = self
            .routes
            .iter()
            .filter(|e| e.value().session_id == session_id)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for connection_id in owned {
            if self
                .routes
                .remove_if(&connection_id, |_, r| r.session_id == session_id)
                .is_some()
            {
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for UdpRouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_route(session_id: Uuid) -> Arc<UdpRoute> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let source: SocketAddr = "192.0.2.1:5353".parse().unwrap();
        Arc::new(UdpRoute::new(socket, source, 1, session_id, 10))
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let table = UdpRouteTable::new();
        let session = Uuid::new_v4();
        table.insert("u1", test_route(session).await);

        let route = table.get("u1").unwrap();
        assert_eq!(route.source.port(), 5353);

        assert!(table.remove("u1").is_some());
        assert!(table.get("u1").is_none());
    }

    #[tokio::test]
    async fn test_remove_session_only_drops_owned_routes() {
        let table = UdpRouteTable::new();
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();
        table.insert("a", test_route(session_a).await);
        table.insert("b", test_route(session_b).await);

        assert_eq!(table.remove_session(session_a), 1);
        assert!(table.get("a").is_none());
        assert!(table.get("b").is_some());
    }

    #[tokio::test]
    async fn test_fresh_route_reports_low_idle() {
        let table = UdpRouteTable::new();
        let session = Uuid::new_v4();
        table.insert("u1", test_route(session).await);

        let route = table.get("u1").unwrap();
        assert!(route.idle_for() < Duration::from_secs(5));
        route.touch();
        assert!(route.idle_for() < Duration::from_secs(5));
    }
}
