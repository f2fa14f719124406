//! # Parcel Engine
//!
//! The pure core of Parcel's offline write path.
//!
//! This crate holds everything about "eventually" writes that can be decided
//! without a network or a disk: the typed object model, the transport codec,
//! the identity registry and the command queue state machine. The bridge crate
//! wraps it with storage, a backend client and a background worker.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never opens files or sockets
//! - **No clock**: time is passed in as millisecond timestamps
//! - **Persist-then-publish**: queue mutations return the log rows to write,
//!   so callers can make every change durable before it becomes visible
//!
//! ## Core Concepts
//!
//! ### Objects
//!
//! A [`BackendObject`] is a schema-less bag of [`FieldValue`]s with a
//! process-local [`LocalHandle`] and, once saved, a backend-assigned remote id.
//! Locally modified fields are tracked as dirty.
//!
//! ### Codec
//!
//! The [`codec`] module converts objects to and from the backend's REST
//! mapping. Dates travel as ISO-8601, bytes as base64. In the
//! [`EncodeContext::Durable`] context nested objects must already have a
//! remote id.
//!
//! ### Identity
//!
//! The [`IdentityRegistry`] owns the handle to remote id mapping (write-once)
//! and orders unsaved nested objects so children are saved before parents.
//!
//! ### Queue
//!
//! [`QueueState`] stages [`Command`]s. Saves of the same object merge, a
//! delete of a never-saved object cancels its queued writes, and each object's
//! commands run one at a time in order. Failures are classified by
//! [`outcome::classify`] and retried with [`RetryPolicy`] backoff.
//!
//! ## Quick Start
//!
//! ```rust
//! use parcel_engine::{BackendObject, CommandDraft, EnqueueAck, QueueState, Resolution, RetryPolicy};
//!
//! let mut queue = QueueState::new();
//! let mut score = BackendObject::new("GameScore").with("score", 1337);
//!
//! // Two writes before the queue drains become one command.
//! let (ack, _rows) = queue.enqueue(CommandDraft::save(&score), 1_000).unwrap();
//! assert_eq!(ack, EnqueueAck::Queued(1));
//! score.set("playerName", "Sean Plott");
//! let (ack, _rows) = queue.enqueue(CommandDraft::save(&score), 1_001).unwrap();
//! assert_eq!(ack, EnqueueAck::Merged(1));
//!
//! // The drain worker takes ready commands and reports back.
//! let ready = queue.next_ready(1_002, 8);
//! assert_eq!(ready.len(), 1);
//! let resolution = Resolution::Committed { remote_id: Some("xWMyZ4YEGZ".into()) };
//! queue.complete(ready[0].id, resolution, 1_003, &RetryPolicy::default());
//! assert!(queue.is_empty());
//! ```

pub mod codec;
pub mod command;
pub mod error;
pub mod object;
pub mod outcome;
pub mod queue;
pub mod registry;
pub mod value;

// Re-export main types at crate root
pub use codec::{EncodeContext, Mapping};
pub use command::{Command, CommandDraft, CommandId, CommandKind, CommandState};
pub use error::Error;
pub use object::{BackendObject, LocalHandle};
pub use outcome::{BackendError, ErrorClass, Outcome, ServerFields};
pub use queue::{Completion, EnqueueAck, LogChange, QueueState, QueuedCommand, Resolution, RetryPolicy};
pub use registry::{Identity, IdentityRegistry};
pub use value::FieldValue;

/// Type aliases for clarity
pub type RemoteId = String;
pub type ClassName = String;
pub type FieldName = String;
pub type Timestamp = u64;
