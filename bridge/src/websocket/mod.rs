//! WebSocket channel.
//!
//! Clients call dispatcher methods over the socket and receive every queue
//! event as it happens, which is how the outcome of an eventually-queued
//! write reaches them.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
