//! SQLite persistence for the durable log, identities and session state.

mod commands;
mod identities;
mod pool;
mod session;

pub use commands::*;
pub use identities::*;
pub use pool::*;
pub use session::*;
