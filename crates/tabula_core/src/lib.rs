#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod error;
pub mod mergeable;
pub mod persist;
pub mod store;
pub mod sync;

pub use error::{Result, TabulaError};
pub use mergeable::{Hlc, MergeableContent, MergeableStore, Stamp, Time};
pub use persist::{MemoryPersister, Persister};
pub use store::{Cell, Id, Row, Store, Table, Tables, Value, Values};
pub use sync::{Channel, Envelope, MemoryChannel, Message, SyncConfig, SyncStatus, Synchronizer};
