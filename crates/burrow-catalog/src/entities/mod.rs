//! Database entities

pub mod agent;
pub mod port_forward;
pub mod traffic_record;

pub use agent::Entity as Agent;
pub use port_forward::Entity as PortForward;
pub use traffic_record::Entity as TrafficRecord;

pub mod prelude {
    pub use super::agent::Entity as Agent;
    pub use super::port_forward::Entity as PortForward;
    pub use super::traffic_record::Entity as TrafficRecord;
}
