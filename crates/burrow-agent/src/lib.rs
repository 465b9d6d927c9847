//! Burrow tunnel agent
//!
//! Holds the long-lived control session to the server, dials secondary data
//! connections for forward traffic, exposes reverse listeners in the private
//! network and multiplexes forward-UDP sessions.

pub mod agent;
pub mod reverse;
pub mod udp;

pub use agent::{Agent, AgentConfig, AgentError};
