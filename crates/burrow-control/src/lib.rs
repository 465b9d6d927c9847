//! Shared server-side state for the burrow tunnel
//!
//! Live control sessions, pending data-connection joins, listener ownership,
//! UDP reply routes and traffic accounting. Everything here is mutated from
//! many concurrent tasks; the registries provide atomic insert-if-absent and
//! identity-compared removal so racing teardown paths are no-ops for the
//! loser.

pub mod agent_registry;
pub mod listeners;
pub mod metering;
pub mod pending;
pub mod udp_routes;

pub use agent_registry::{AgentRegistry, SessionCommand, SessionHandle};
pub use listeners::{ListenerRegistry, PortClaimError};
pub use metering::{spawn_flusher, FlowCounters, TrafficMeter};
pub use pending::{PendingEvent, PendingTable, PendingTicket};
pub use udp_routes::{UdpRoute, UdpRouteTable};
