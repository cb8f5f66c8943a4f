//! Roost Core - Shared protocol types
//!
//! This crate contains the protocol types shared between the Roost CLI
//! (`roost`) and the Roost daemon (`roost-daemon`) for communication via
//! the management Unix socket.

mod protocol;

pub use protocol::*;
