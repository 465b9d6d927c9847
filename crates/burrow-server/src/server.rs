//! Tunnel server: shared state, control listener, lifecycle

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use burrow_catalog::{AgentId, Catalog};
use burrow_control::{
    spawn_flusher, AgentRegistry, ListenerRegistry, PendingTable, SessionCommand, TrafficMeter,
    UdpRouteTable,
};

use crate::session;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind control listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Control listener address; agents connect here for control and data.
    pub bind_addr: SocketAddr,
    /// Session is destroyed when no heartbeat arrives within this window.
    pub heartbeat_timeout: Duration,
    /// How long a pending entry waits for its twin data connection.
    pub pending_timeout: Duration,
    /// How long a fresh connection may take to present its first frame.
    pub handshake_timeout: Duration,
    /// Timeout for server-side dials (reverse modes).
    pub dial_timeout: Duration,
    /// Traffic meter flush cadence.
    pub flush_interval: Duration,
    /// TCP keepalive period on control sockets.
    pub keepalive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7000".parse().unwrap(),
            heartbeat_timeout: Duration::from_secs(40),
            pending_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
            dial_timeout: Duration::from_secs(10),
            flush_interval: Duration::from_secs(30),
            keepalive: Duration::from_secs(20),
        }
    }
}

/// Everything the session tasks and forward engines share.
pub struct ServerState {
    pub catalog: Arc<dyn Catalog>,
    pub registry: AgentRegistry,
    pub pending: PendingTable,
    pub listeners: ListenerRegistry,
    pub udp_routes: UdpRouteTable,
    pub meter: Arc<TrafficMeter>,
    pub config: ServerConfig,
}

/// The server handle: bound control listener plus shared state.
pub struct TunnelServer {
    state: Arc<ServerState>,
    listener: TcpListener,
    local_addr: SocketAddr,
    flusher: JoinHandle<()>,
}

impl TunnelServer {
    /// Bind the control listener and start the traffic flusher.
    ///
    /// A bind failure here is fatal; listener binds for individual forwards
    /// later are not.
    pub async fn bind(
        config: ServerConfig,
        catalog: Arc<dyn Catalog>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let meter = Arc::new(TrafficMeter::new());
        let flusher = spawn_flusher(meter.clone(), catalog.clone(), config.flush_interval);

        let state = Arc::new(ServerState {
            catalog,
            registry: AgentRegistry::new(),
            pending: PendingTable::new(),
            listeners: ListenerRegistry::new(),
            udp_routes: UdpRouteTable::new(),
            meter,
            config,
        });

        info!("control listener bound on {}", local_addr);

        Ok(Self {
            state,
            listener,
            local_addr,
            flusher,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Accept control and data connections until cancelled.
    pub async fn serve(&self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let state = self.state.clone();
                    tokio::spawn(session::handle_connection(state, stream, peer_addr));
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Reload trigger for the external admin surface: the named agent
    /// re-reads the catalog, reconciles its listeners and receives a
    /// `config_update`. Returns false when the agent is offline.
    pub async fn reload_agent(&self, agent_id: AgentId) -> bool {
        match self.state.registry.get(agent_id) {
            Some(handle) => handle.commands.send(SessionCommand::Reload).await.is_ok(),
            None => false,
        }
    }

    /// Ids of agents with a live control session, for the admin surface.
    pub fn connected_agents(&self) -> Vec<AgentId> {
        self.state.registry.connected_agents()
    }

    /// Stop the periodic flusher and run one final bounded flush.
    pub async fn shutdown(&self) {
        self.flusher.abort();
        let flushed = tokio::time::timeout(
            Duration::from_secs(5),
            self.state.meter.flush(&self.state.catalog),
        )
        .await;
        if flushed.is_err() {
            error!("final traffic flush timed out");
        }
    }
}
