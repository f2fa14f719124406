//! Connection handlers for the call channel.

mod websocket;

pub use websocket::*;
