//! Replica-to-replica synchronization.
//!
//! [`Synchronizer`] drives the protocol, [`message`] defines the wire
//! types, and [`Channel`] abstracts the transport. Any transport that can
//! move [`Envelope`]s works; [`MemoryChannel`] is the in-process reference.

pub mod channel;
pub mod message;
pub mod synchronizer;

pub use channel::{BoxFuture, Channel, MemoryChannel};
pub use message::{Envelope, Message, Response};
pub use synchronizer::{SyncConfig, SyncStatus, Synchronizer};
