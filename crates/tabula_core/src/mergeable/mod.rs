//! Conflict-free merge layer over the plain store.
//!
//! Three collaborating pieces:
//! - [`clock`]: the hybrid logical clock producing sortable causal
//!   timestamps.
//! - [`stamp`]: the `(value, time, hash)` stamp tree and its XOR hash
//!   aggregation.
//! - [`store`]: the [`MergeableStore`] wrapper combining both with the
//!   last-writer-wins merge rule and the hash-diff API.

pub mod clock;
pub mod stamp;
pub mod store;

pub use clock::{is_valid_time, Hlc, Time};
pub use stamp::{
    fnv1a, merge_tables_stamps, merge_values_stamps, recompute_tables, recompute_values,
    CellStamp, Hash, MergeableContent, RowStamp, Stamp, TableStamp, TablesStamp, ValueStamp,
    ValuesStamp,
};
pub use store::{CellHashes, ChangeListener, MergeableStore, RowHashes};
