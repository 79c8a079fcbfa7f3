//! Stamped values and incremental hash aggregation.
//!
//! A [`Stamp`] is a `(value, time, hash)` triple, the atomic unit of the
//! merge tree. Parent-level hashes are the bitwise XOR of
//! `keyed_hash(child_id, child_hash)` across children, XORed with a
//! timestamp-transition term. XOR aggregation is commutative, associative,
//! and self-inverse, so replacing one child's contribution never requires
//! rehashing its siblings.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::clock::{is_valid_time, Time};
use crate::store::{Cell, Id, Value};

/// 32-bit content hash.
pub type Hash = u32;

/// 32-bit FNV-1a over a byte slice.
pub const fn fnv1a(bytes: &[u8]) -> Hash {
    let mut hash: u32 = 0x811c_9dc5;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        i += 1;
    }
    hash
}

/// Hash of the empty timestamp; the aggregate hash of a freshly created
/// (empty, unstamped) subtree.
pub(crate) const EMPTY_TIME_HASH: Hash = fnv1a(b"");

/// A value with its causal timestamp and aggregate hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamp<T> {
    /// The stamped value; for inner tree levels, a map of child stamps.
    pub value: T,
    /// Causal timestamp; empty for bootstrap defaults.
    pub time: Time,
    /// Aggregate hash of this subtree.
    pub hash: Hash,
}

impl<T: Default> Default for Stamp<T> {
    fn default() -> Self {
        Self {
            value: T::default(),
            time: Time::new(),
            hash: EMPTY_TIME_HASH,
        }
    }
}

impl<T> Stamp<T> {
    /// Create a stamp from its parts.
    pub fn new(value: T, time: Time, hash: Hash) -> Self {
        Self { value, time, hash }
    }
}

/// Leaf stamp for a cell; `None` is an explicit deletion tombstone, kept so
/// the deletion itself carries a timestamp and propagates.
pub type CellStamp = Stamp<Option<Cell>>;

/// Stamped row: cell stamps keyed by cell id.
pub type RowStamp = Stamp<IndexMap<Id, CellStamp>>;

/// Stamped table: row stamps keyed by row id.
pub type TableStamp = Stamp<IndexMap<Id, RowStamp>>;

/// Root of the tabular half of the stamp tree.
pub type TablesStamp = Stamp<IndexMap<Id, TableStamp>>;

/// Leaf stamp for a keyed value.
pub type ValueStamp = Stamp<Option<Value>>;

/// Root of the keyed-value half of the stamp tree.
pub type ValuesStamp = Stamp<IndexMap<Id, ValueStamp>>;

/// A full stamped snapshot, or a partial delta of one; the two are the same
/// shape and both are applied with the same last-writer-wins rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeableContent {
    /// Tabular half of the tree.
    pub tables: TablesStamp,
    /// Keyed-value half of the tree.
    pub values: ValuesStamp,
}

// ===========================================================================
// Hash primitives
// ===========================================================================

fn json(value: &impl Serialize) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Hash of a leaf value together with its timestamp.
pub fn value_hash(value: &Option<Cell>, time: &str) -> Hash {
    fnv1a(format!("{}:{}", json(value), time).as_bytes())
}

/// The unit one child contributes into its parent's XOR aggregate.
pub fn keyed_hash(id: &str, hash: Hash) -> Hash {
    fnv1a(format!("{}:{}", id, hash).as_bytes())
}

/// The timestamp's own contribution to an aggregate hash transition.
///
/// Non-zero only when the time actually advances, so time-only updates still
/// perturb the aggregate while stale updates leave it untouched.
pub fn replace_time_hash(old_time: &str, new_time: &str) -> Hash {
    if new_time > old_time {
        fnv1a(old_time.as_bytes()) ^ fnv1a(new_time.as_bytes())
    } else {
        0
    }
}

// ===========================================================================
// Validation
// ===========================================================================

impl MergeableContent {
    /// Structural validation of an incoming payload.
    ///
    /// Never panics; returns `false` for any malformed timestamp or
    /// non-finite number so the caller can discard the payload wholesale.
    pub fn validate(&self) -> bool {
        validate_tables(&self.tables) && validate_values(&self.values)
    }

    /// Whether this content carries no leaves at all.
    pub fn is_empty(&self) -> bool {
        self.tables.value.is_empty() && self.values.value.is_empty()
    }
}

fn validate_leaf(value: &Option<Cell>, time: &str) -> bool {
    is_valid_time(time) && value.as_ref().map(Cell::is_valid).unwrap_or(true)
}

fn validate_tables(tables: &TablesStamp) -> bool {
    is_valid_time(&tables.time)
        && tables.value.values().all(|table| {
            is_valid_time(&table.time)
                && table.value.values().all(|row| {
                    is_valid_time(&row.time)
                        && row
                            .value
                            .values()
                            .all(|cell| validate_leaf(&cell.value, &cell.time))
                })
        })
}

fn validate_values(values: &ValuesStamp) -> bool {
    is_valid_time(&values.time)
        && values
            .value
            .values()
            .all(|v| validate_leaf(&v.value, &v.time))
}

// ===========================================================================
// Recomputation and accumulation
// ===========================================================================

fn max_time(a: &str, b: &str) -> Time {
    if b > a {
        b.to_string()
    } else {
        a.to_string()
    }
}

/// Recompute every hash in a tables subtree from its leaves, raising each
/// parent's time to the maximum seen among its children.
///
/// Used for trusted bulk loads; incremental mutation keeps the same
/// aggregates up to date without this full pass.
pub fn recompute_tables(tables: &mut TablesStamp) {
    let mut tables_hash = 0;
    let mut tables_time = tables.time.clone();
    for (table_id, table) in tables.value.iter_mut() {
        let mut table_hash = 0;
        let mut table_time = table.time.clone();
        for (row_id, row) in table.value.iter_mut() {
            let mut row_hash = 0;
            let mut row_time = row.time.clone();
            for (cell_id, cell) in row.value.iter_mut() {
                cell.hash = value_hash(&cell.value, &cell.time);
                row_hash ^= keyed_hash(cell_id, cell.hash);
                row_time = max_time(&row_time, &cell.time);
            }
            row.time = row_time.clone();
            row.hash = row_hash ^ fnv1a(row.time.as_bytes());
            table_hash ^= keyed_hash(row_id, row.hash);
            table_time = max_time(&table_time, &row.time);
        }
        table.time = table_time.clone();
        table.hash = table_hash ^ fnv1a(table.time.as_bytes());
        tables_hash ^= keyed_hash(table_id, table.hash);
        tables_time = max_time(&tables_time, &table.time);
    }
    tables.time = tables_time;
    tables.hash = tables_hash ^ fnv1a(tables.time.as_bytes());
}

/// Recompute every hash in a values subtree from its leaves.
pub fn recompute_values(values: &mut ValuesStamp) {
    let mut root_hash = 0;
    let mut root_time = values.time.clone();
    for (value_id, value) in values.value.iter_mut() {
        value.hash = value_hash(&value.value, &value.time);
        root_hash ^= keyed_hash(value_id, value.hash);
        root_time = max_time(&root_time, &value.time);
    }
    values.time = root_time;
    values.hash = root_hash ^ fnv1a(values.time.as_bytes());
}

/// Merge one partial tables stamp into an accumulator, taking the later
/// timestamp at each level and the later-stamped leaf where both carry one.
///
/// Used by the synchronizer to combine diff results from successive descent
/// levels into a single change set before applying it.
pub fn merge_tables_stamps(into: &mut TablesStamp, from: TablesStamp) {
    into.time = max_time(&into.time, &from.time);
    for (table_id, table) in from.value {
        let into_table = into.value.entry(table_id).or_default();
        into_table.time = max_time(&into_table.time, &table.time);
        for (row_id, row) in table.value {
            let into_row = into_table.value.entry(row_id).or_default();
            into_row.time = max_time(&into_row.time, &row.time);
            for (cell_id, cell) in row.value {
                match into_row.value.get_mut(&cell_id) {
                    Some(existing) if existing.time >= cell.time => {}
                    Some(existing) => *existing = cell,
                    None => {
                        into_row.value.insert(cell_id, cell);
                    }
                }
            }
        }
    }
}

/// Values-side counterpart of [`merge_tables_stamps`].
pub fn merge_values_stamps(into: &mut ValuesStamp, from: ValuesStamp) {
    into.time = max_time(&into.time, &from.time);
    for (value_id, leaf) in from.value {
        match into.value.get_mut(&value_id) {
            Some(existing) if existing.time >= leaf.time => {}
            Some(existing) => *existing = leaf,
            None => {
                into.value.insert(value_id, leaf);
            }
        }
    }
}
