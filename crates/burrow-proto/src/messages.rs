//! Protocol message types

use serde::{Deserialize, Serialize};

/// Direction of a port forward, as stored in the catalog and pushed to agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Traffic enters at the server and exits at the agent side.
    Forward,
    /// Traffic enters at the agent and exits at the server side.
    Reverse,
    /// SOCKS5 entry on the server, dial on the agent side.
    Dynamic,
    /// SOCKS5 entry on the agent, dial on the server side.
    ReverseDynamic,
}

impl Direction {
    /// Whether this direction binds a socket on the server.
    pub fn binds_server(&self) -> bool {
        matches!(self, Direction::Forward | Direction::Dynamic)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
            Direction::Dynamic => "dynamic",
            Direction::ReverseDynamic => "reverse-dynamic",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport type of a port forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Tcp,
    Udp,
    Socks5,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Tcp => "tcp",
            ProxyType::Udp => "udp",
            ProxyType::Socks5 => "socks5",
        }
    }
}

impl std::fmt::Display for ProxyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port forward as pushed to agents in `auth_response` and `config_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardSpec {
    /// Human name, unique per agent. Used as `proxyName` in negotiations.
    pub name: String,
    pub direction: Direction,
    pub proxy_type: ProxyType,
    /// Server-side port (bind port for forward/dynamic, dial port for reverse).
    pub remote_port: u16,
    /// Server-side dial address for reverse forwards.
    pub remote_ip: String,
    /// Agent-side address (dial target for forward, bind address for reverse).
    pub local_ip: String,
    pub local_port: u16,
}

/// Control-plane message, one JSON object per line on the wire.
///
/// The `type` field carries the snake_case variant name; all other fields are
/// camelCase. Unknown types are tolerated by the codec (logged and skipped)
/// so older peers survive newer message sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    // Agent -> Server
    /// Initial authentication on a control connection.
    ControlHandshake { token: String },
    /// First frame on a secondary TCP connection; joins a pending entry.
    DataConnection { connection_id: String },
    /// Sent by agents every ~30 s.
    Heartbeat {},
    /// Begin reverse-TCP negotiation for a user connection on the agent side.
    ReverseConnection {
        proxy_name: String,
        connection_id: String,
    },
    /// Begin reverse-SOCKS5 negotiation; the server dials the target.
    ReverseDynamic {
        proxy_name: String,
        connection_id: String,
        target_host: String,
        target_port: u16,
    },
    /// Agent-side dial for a forward-SOCKS5 connection succeeded.
    DynamicReady { connection_id: String },
    /// Agent-side dial for a forward-SOCKS5 connection failed.
    DynamicFailed { connection_id: String, error: String },
    /// UDP reply from the agent-side target, base64 payload.
    UdpPacketResponse { connection_id: String, data: String },
    /// Legacy client-driven registration; always rejected.
    Register {},

    // Server -> Agent
    /// Handshake outcome; `port_forwards` is the authoritative set at login.
    AuthResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port_forwards: Option<Vec<PortForwardSpec>>,
    },
    /// New authoritative forward set after a catalog reload.
    ConfigUpdate { port_forwards: Vec<PortForwardSpec> },
    /// Dial instruction for forward TCP.
    NewConnection {
        proxy_name: String,
        connection_id: String,
    },
    /// Dial instruction for forward SOCKS5.
    DynamicConnection {
        proxy_name: String,
        connection_id: String,
        target_host: String,
        target_port: u16,
    },
    /// Server-side dial for reverse TCP succeeded.
    ReverseReady { connection_id: String },
    /// Server-side dial for reverse TCP failed.
    ReverseFailed { connection_id: String, error: String },
    /// Server-side dial for reverse SOCKS5 succeeded.
    ReverseDynamicReady { connection_id: String },
    /// Server-side dial for reverse SOCKS5 failed.
    ReverseDynamicFailed { connection_id: String, error: String },
    /// UDP datagram to deliver on the agent side, base64 payload.
    UdpPacket {
        connection_id: String,
        data: String,
        target_host: String,
        target_port: u16,
        proxy_name: String,
    },
    /// Reply to `heartbeat`.
    HeartbeatAck {},

    // Either direction
    /// End a UDP session.
    UdpClose { connection_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_type_names_are_snake_case() {
        let msg = ControlMessage::ControlHandshake {
            token: "secret".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"control_handshake""#));

        let msg = ControlMessage::ReverseDynamicReady {
            connection_id: "c1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"reverse_dynamic_ready""#));
    }

    #[test]
    fn test_wire_fields_are_camel_case() {
        let msg = ControlMessage::DynamicConnection {
            proxy_name: "web".to_string(),
            connection_id: "c1".to_string(),
            target_host: "example.com".to_string(),
            target_port: 80,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""proxyName":"web""#));
        assert!(json.contains(r#""connectionId":"c1""#));
        assert!(json.contains(r#""targetHost":"example.com""#));
        assert!(json.contains(r#""targetPort":80"#));
    }

    #[test]
    fn test_auth_response_omits_empty_fields() {
        let msg = ControlMessage::AuthResponse {
            success: true,
            error: None,
            port_forwards: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"auth_response","success":true}"#);
    }

    #[test]
    fn test_port_forward_spec_round_trip() {
        let spec = PortForwardSpec {
            name: "ssh".to_string(),
            direction: Direction::Forward,
            proxy_type: ProxyType::Tcp,
            remote_port: 6000,
            remote_ip: String::new(),
            local_ip: "127.0.0.1".to_string(),
            local_port: 22,
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains(r#""direction":"forward""#));
        assert!(json.contains(r#""proxyType":"tcp""#));
        assert!(json.contains(r#""remotePort":6000"#));
        assert!(json.contains(r#""localIp":"127.0.0.1""#));

        let back: PortForwardSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_direction_wire_names() {
        assert_eq!(
            serde_json::to_string(&Direction::ReverseDynamic).unwrap(),
            r#""reverse-dynamic""#
        );
        let d: Direction = serde_json::from_str(r#""reverse-dynamic""#).unwrap();
        assert_eq!(d, Direction::ReverseDynamic);
        assert!(!d.binds_server());
        assert!(Direction::Dynamic.binds_server());
        assert!(Direction::Forward.binds_server());
        assert!(!Direction::Reverse.binds_server());
    }

    #[test]
    fn test_heartbeat_parses_from_bare_object() {
        let msg: ControlMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Heartbeat {});
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let result = serde_json::from_str::<ControlMessage>(r#"{"type":"telemetry","v":1}"#);
        assert!(result.is_err());
    }
}
