//! Burrow tunnel server
//!
//! Accepts long-lived control connections from agents, binds the server-side
//! listeners their catalog entries ask for, and splices user connections with
//! the secondary data connections agents dial back.

pub mod forward;
pub mod pipe;
pub mod server;
pub mod session;

pub use server::{ServerConfig, ServerError, ServerState, TunnelServer};
