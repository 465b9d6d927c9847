//! Control-plane protocol for the burrow tunnel
//!
//! Defines the newline-delimited JSON message catalog spoken between the
//! server and its agents, and the frame codec that reads and writes it.

pub mod framing;
pub mod messages;

pub use framing::{ControlReader, ControlWriter, FrameError, MessageReader, MessageWriter};
pub use messages::{ControlMessage, Direction, PortForwardSpec, ProxyType};
