//! Merge engine: a stamped, conflict-free wrapper around [`Store`].
//!
//! `MergeableStore` maintains a stamp tree mirroring Tables → Rows → Cells
//! and Values. Every local write is timestamped by the replica's hybrid
//! logical clock and folded into incrementally-maintained XOR aggregates, so
//! root hashes are an O(1) read and any two replicas can locate their
//! divergent subtrees by comparing hashes level by level.
//!
//! Merging is last-writer-wins per leaf: an incoming `(value, time)` replaces
//! the existing leaf iff its time is strictly greater. The rule is
//! idempotent, commutative, and associative, so changes may be re-applied or
//! delivered in any order.

use std::collections::BTreeSet;

use indexmap::IndexMap;

use super::clock::{Hlc, Time};
use super::stamp::{
    keyed_hash, recompute_tables, recompute_values, replace_time_hash, value_hash, Hash,
    MergeableContent, RowStamp, TableStamp, TablesStamp, ValuesStamp,
};
use crate::store::{Cell, CellHook, Id, Row, Store, Table, Tables, TransactionHook, Value,
    ValueHook, Values};

/// Hashes one level finer than the table level: table id → row id → hash.
pub type RowHashes = IndexMap<Id, IndexMap<Id, Hash>>;

/// Hashes at the cell level: table id → row id → cell id → hash.
pub type CellHashes = IndexMap<Id, IndexMap<Id, IndexMap<Id, Hash>>>;

/// Listener invoked with the minimal delta when a transaction finishes.
pub type ChangeListener = Box<dyn FnMut(&MergeableContent) + Send>;

/// A [`Store`] wrapped with causal stamps, aggregate hashes, and the
/// hash-diff reconciliation API.
pub struct MergeableStore {
    id: Id,
    store: Store,
    hlc: Hlc,
    tables: TablesStamp,
    values: ValuesStamp,
    touched_cells: BTreeSet<(Id, Id, Id)>,
    touched_values: BTreeSet<Id>,
    transaction_depth: usize,
    change_listeners: Vec<ChangeListener>,
}

impl MergeableStore {
    /// Create an empty mergeable store for the given replica id.
    pub fn new(replica_id: &str) -> Self {
        Self {
            id: replica_id.to_string(),
            store: Store::new(),
            hlc: Hlc::new(replica_id),
            tables: TablesStamp::default(),
            values: ValuesStamp::default(),
            touched_cells: BTreeSet::new(),
            touched_values: BTreeSet::new(),
            transaction_depth: 0,
            change_listeners: Vec::new(),
        }
    }

    /// The replica id this store was created with.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read-only access to the wrapped plain store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    // =========================================================================
    // Forwarded read surface
    // =========================================================================

    /// All tables.
    pub fn get_tables(&self) -> &Tables {
        self.store.get_tables()
    }

    /// A single table, if present.
    pub fn get_table(&self, table_id: &str) -> Option<&Table> {
        self.store.get_table(table_id)
    }

    /// A single row, if present.
    pub fn get_row(&self, table_id: &str, row_id: &str) -> Option<&Row> {
        self.store.get_row(table_id, row_id)
    }

    /// A single cell, if present.
    pub fn get_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<&Cell> {
        self.store.get_cell(table_id, row_id, cell_id)
    }

    /// All keyed values.
    pub fn get_values(&self) -> &Values {
        self.store.get_values()
    }

    /// A single keyed value, if present.
    pub fn get_value(&self, value_id: &str) -> Option<&Value> {
        self.store.get_value(value_id)
    }

    /// Whether a cell exists.
    pub fn has_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> bool {
        self.store.has_cell(table_id, row_id, cell_id)
    }

    /// Full snapshot of the plain tables and values.
    pub fn get_content(&self) -> (Tables, Values) {
        self.store.get_content()
    }

    /// Register a per-cell write hook on the wrapped store.
    pub fn add_cell_hook(&mut self, hook: CellHook) {
        self.store.add_cell_hook(hook);
    }

    /// Register a per-value write hook on the wrapped store.
    pub fn add_value_hook(&mut self, hook: ValueHook) {
        self.store.add_value_hook(hook);
    }

    /// Register a transaction-finish hook on the wrapped store.
    pub fn add_finish_hook(&mut self, hook: TransactionHook) {
        self.store.add_finish_hook(hook);
    }

    /// Register a listener receiving the minimal stamped delta each time the
    /// outermost transaction finishes with changes.
    pub fn add_change_listener(&mut self, listener: ChangeListener) {
        self.change_listeners.push(listener);
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Begin a (possibly nested) transaction.
    pub fn start_transaction(&mut self) {
        self.transaction_depth += 1;
        self.store.start_transaction();
    }

    /// End a transaction. When the outermost one finishes, change listeners
    /// receive the accumulated delta and the touched set is cleared.
    pub fn finish_transaction(&mut self) {
        if self.transaction_depth == 0 {
            return;
        }
        self.transaction_depth -= 1;
        self.store.finish_transaction();
        if self.transaction_depth == 0 {
            let changes = self.get_transaction_changes();
            self.touched_cells.clear();
            self.touched_values.clear();
            if !changes.is_empty() {
                self.notify_change_listeners(&changes);
            }
        }
    }

    /// Run `f` inside a transaction.
    pub fn transaction<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.start_transaction();
        let result = f(self);
        self.finish_transaction();
        result
    }

    /// The minimal stamped delta for everything touched since the last
    /// transaction boundary.
    pub fn get_transaction_changes(&self) -> MergeableContent {
        let mut changes = MergeableContent::default();
        changes.tables.time = self.tables.time.clone();
        changes.tables.hash = self.tables.hash;
        for (table_id, row_id, cell_id) in &self.touched_cells {
            let Some(table) = self.tables.value.get(table_id) else {
                continue;
            };
            let Some(row) = table.value.get(row_id) else {
                continue;
            };
            let Some(cell) = row.value.get(cell_id) else {
                continue;
            };
            let table_entry = changes.tables.value.entry(table_id.clone()).or_default();
            table_entry.time = table.time.clone();
            table_entry.hash = table.hash;
            let row_entry = table_entry.value.entry(row_id.clone()).or_default();
            row_entry.time = row.time.clone();
            row_entry.hash = row.hash;
            row_entry.value.insert(cell_id.clone(), cell.clone());
        }
        changes.values.time = self.values.time.clone();
        changes.values.hash = self.values.hash;
        for value_id in &self.touched_values {
            if let Some(value) = self.values.value.get(value_id) {
                changes.values.value.insert(value_id.clone(), value.clone());
            }
        }
        changes
    }

    fn notify_change_listeners(&mut self, changes: &MergeableContent) {
        let mut listeners = std::mem::take(&mut self.change_listeners);
        for listener in &mut listeners {
            listener(changes);
        }
        listeners.append(&mut self.change_listeners);
        self.change_listeners = listeners;
    }

    fn in_transaction<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.start_transaction();
        let result = f(self);
        self.finish_transaction();
        result
    }

    // =========================================================================
    // Local write path
    // =========================================================================

    /// Set a cell, stamping it with the next local clock time.
    pub fn set_cell(
        &mut self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        cell: impl Into<Cell>,
    ) {
        let cell = cell.into();
        self.in_transaction(|s| {
            s.store.set_cell(table_id, row_id, cell_id, cell.clone());
            let time = s.hlc.next();
            s.stamp_cell(table_id, row_id, cell_id, Some(cell), time);
            s.touched_cells.insert((
                table_id.to_string(),
                row_id.to_string(),
                cell_id.to_string(),
            ));
        });
    }

    /// Delete a cell, leaving a timestamped tombstone in the stamp tree so
    /// the deletion propagates to peers.
    pub fn del_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str) {
        if !self.store.has_cell(table_id, row_id, cell_id) {
            return;
        }
        self.in_transaction(|s| {
            s.store.del_cell(table_id, row_id, cell_id);
            let time = s.hlc.next();
            s.stamp_cell(table_id, row_id, cell_id, None, time);
            s.touched_cells.insert((
                table_id.to_string(),
                row_id.to_string(),
                cell_id.to_string(),
            ));
        });
    }

    /// Delete a whole row, tombstoning each of its cells.
    pub fn del_row(&mut self, table_id: &str, row_id: &str) {
        self.in_transaction(|s| {
            for cell_id in s.store.cell_ids(table_id, row_id) {
                s.del_cell(table_id, row_id, &cell_id);
            }
        });
    }

    /// Delete a whole table, tombstoning each of its cells.
    pub fn del_table(&mut self, table_id: &str) {
        self.in_transaction(|s| {
            for row_id in s.store.row_ids(table_id) {
                s.del_row(table_id, &row_id);
            }
        });
    }

    /// Set a keyed value, stamping it with the next local clock time.
    pub fn set_value(&mut self, value_id: &str, value: impl Into<Value>) {
        let value = value.into();
        self.in_transaction(|s| {
            s.store.set_value(value_id, value.clone());
            let time = s.hlc.next();
            s.stamp_value(value_id, Some(value), time);
            s.touched_values.insert(value_id.to_string());
        });
    }

    /// Delete a keyed value, leaving a timestamped tombstone.
    pub fn del_value(&mut self, value_id: &str) {
        if self.store.get_value(value_id).is_none() {
            return;
        }
        self.in_transaction(|s| {
            s.store.del_value(value_id);
            let time = s.hlc.next();
            s.stamp_value(value_id, None, time);
            s.touched_values.insert(value_id.to_string());
        });
    }

    /// Replace all tables, stamping only the cells that actually change.
    pub fn set_tables(&mut self, tables: Tables) {
        self.in_transaction(|s| {
            for table_id in s.store.table_ids() {
                if !tables.contains_key(&table_id) {
                    s.del_table(&table_id);
                }
            }
            for (table_id, table) in &tables {
                for row_id in s.store.row_ids(table_id) {
                    if !table.contains_key(&row_id) {
                        s.del_row(table_id, &row_id);
                    }
                }
                for (row_id, row) in table {
                    for cell_id in s.store.cell_ids(table_id, row_id) {
                        if !row.contains_key(&cell_id) {
                            s.del_cell(table_id, row_id, &cell_id);
                        }
                    }
                    for (cell_id, cell) in row {
                        if s.store.get_cell(table_id, row_id, cell_id) != Some(cell) {
                            s.set_cell(table_id, row_id, cell_id, cell.clone());
                        }
                    }
                }
            }
        });
    }

    /// Replace all keyed values, stamping only the values that change.
    pub fn set_values(&mut self, values: Values) {
        self.in_transaction(|s| {
            for value_id in s.store.get_values().keys().cloned().collect::<Vec<_>>() {
                if !values.contains_key(&value_id) {
                    s.del_value(&value_id);
                }
            }
            for (value_id, value) in &values {
                if s.store.get_value(value_id) != Some(value) {
                    s.set_value(value_id, value.clone());
                }
            }
        });
    }

    /// Replace the full content, stamping only what changes.
    pub fn set_content(&mut self, tables: Tables, values: Values) {
        self.in_transaction(|s| {
            s.set_tables(tables);
            s.set_values(values);
        });
    }

    /// Apply bootstrap content with empty timestamps.
    ///
    /// Only fills leaves that have never been causally stamped, so defaults
    /// never outrank real writes, local or remote.
    pub fn set_default_content(&mut self, tables: Tables, values: Values) {
        self.in_transaction(|s| {
            for (table_id, table) in &tables {
                for (row_id, row) in table {
                    for (cell_id, cell) in row {
                        if s.leaf_cell_time(table_id, row_id, cell_id).is_empty() {
                            s.store.set_cell(table_id, row_id, cell_id, cell.clone());
                            s.stamp_cell(
                                table_id,
                                row_id,
                                cell_id,
                                Some(cell.clone()),
                                Time::new(),
                            );
                            s.touched_cells.insert((
                                table_id.clone(),
                                row_id.clone(),
                                cell_id.clone(),
                            ));
                        }
                    }
                }
            }
            for (value_id, value) in &values {
                if s.leaf_value_time(value_id).is_empty() {
                    s.store.set_value(value_id, value.clone());
                    s.stamp_value(value_id, Some(value.clone()), Time::new());
                    s.touched_values.insert(value_id.clone());
                }
            }
        });
    }

    // =========================================================================
    // Stamp tree maintenance
    // =========================================================================

    fn leaf_cell_time(&self, table_id: &str, row_id: &str, cell_id: &str) -> &str {
        self.tables
            .value
            .get(table_id)
            .and_then(|t| t.value.get(row_id))
            .and_then(|r| r.value.get(cell_id))
            .map(|c| c.time.as_str())
            .unwrap_or("")
    }

    fn leaf_value_time(&self, value_id: &str) -> &str {
        self.values
            .value
            .get(value_id)
            .map(|v| v.time.as_str())
            .unwrap_or("")
    }

    /// Write one cell leaf and propagate hash and time changes upward through
    /// row → table → tables-root. Callers enforce the LWW guard.
    fn stamp_cell(
        &mut self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        value: Option<Cell>,
        time: Time,
    ) {
        let tables = &mut self.tables;

        let table_existed = tables.value.contains_key(table_id);
        let table = tables.value.entry(table_id.to_string()).or_default();
        let table_prev_hash = table.hash;
        let table_prev_time = table.time.clone();

        let row_existed = table.value.contains_key(row_id);
        let row = table.value.entry(row_id.to_string()).or_default();
        let row_prev_hash = row.hash;
        let row_prev_time = row.time.clone();

        let cell_existed = row.value.contains_key(cell_id);
        let cell = row.value.entry(cell_id.to_string()).or_default();
        let cell_prev_hash = cell.hash;
        cell.hash = value_hash(&value, &time);
        cell.value = value;
        cell.time = time.clone();
        let cell_new_hash = cell.hash;

        row.hash ^= if cell_existed {
            keyed_hash(cell_id, cell_prev_hash)
        } else {
            0
        };
        row.hash ^= keyed_hash(cell_id, cell_new_hash);
        row.hash ^= replace_time_hash(&row_prev_time, &time);
        if time > row.time {
            row.time = time.clone();
        }
        let row_new_hash = row.hash;

        table.hash ^= if row_existed {
            keyed_hash(row_id, row_prev_hash)
        } else {
            0
        };
        table.hash ^= keyed_hash(row_id, row_new_hash);
        table.hash ^= replace_time_hash(&table_prev_time, &time);
        if time > table.time {
            table.time = time.clone();
        }
        let table_new_hash = table.hash;

        let root_prev_time = tables.time.clone();
        tables.hash ^= if table_existed {
            keyed_hash(table_id, table_prev_hash)
        } else {
            0
        };
        tables.hash ^= keyed_hash(table_id, table_new_hash);
        tables.hash ^= replace_time_hash(&root_prev_time, &time);
        if time > tables.time {
            tables.time = time;
        }
    }

    /// Write one value leaf and propagate to the values root.
    fn stamp_value(&mut self, value_id: &str, value: Option<Value>, time: Time) {
        let values = &mut self.values;
        let existed = values.value.contains_key(value_id);
        let leaf = values.value.entry(value_id.to_string()).or_default();
        let prev_hash = leaf.hash;
        leaf.hash = value_hash(&value, &time);
        leaf.value = value;
        leaf.time = time.clone();
        let new_hash = leaf.hash;

        let root_prev_time = values.time.clone();
        values.hash ^= if existed { keyed_hash(value_id, prev_hash) } else { 0 };
        values.hash ^= keyed_hash(value_id, new_hash);
        values.hash ^= replace_time_hash(&root_prev_time, &time);
        if time > values.time {
            values.time = time;
        }
    }

    // =========================================================================
    // Mergeable content
    // =========================================================================

    /// Full stamped snapshot including all hashes; suitable for cold-start
    /// sync or persistence.
    pub fn get_mergeable_content(&self) -> MergeableContent {
        MergeableContent {
            tables: self.tables.clone(),
            values: self.values.clone(),
        }
    }

    /// Replace the whole local tree with trusted bulk content.
    ///
    /// The payload is validated first; a malformed payload is discarded and
    /// `false` returned with local state unchanged. Hashes and parent times
    /// are recomputed from the leaves, the plain store is rebuilt without
    /// per-cell hook dispatch, and listeners are notified once.
    pub fn set_mergeable_content(&mut self, content: MergeableContent) -> bool {
        if !content.validate() {
            log::debug!("[MergeableStore] discarding invalid mergeable content");
            return false;
        }
        let mut content = content;
        recompute_tables(&mut content.tables);
        recompute_values(&mut content.values);

        let mut tables = Tables::new();
        for (table_id, table) in &content.tables.value {
            for (row_id, row) in &table.value {
                for (cell_id, cell) in &row.value {
                    self.hlc.observe(&cell.time);
                    if let Some(value) = &cell.value {
                        tables
                            .entry(table_id.clone())
                            .or_default()
                            .entry(row_id.clone())
                            .or_default()
                            .insert(cell_id.clone(), value.clone());
                    }
                }
            }
        }
        let mut values = Values::new();
        for (value_id, leaf) in &content.values.value {
            self.hlc.observe(&leaf.time);
            if let Some(value) = &leaf.value {
                values.insert(value_id.clone(), value.clone());
            }
        }

        self.tables = content.tables;
        self.values = content.values;
        self.touched_cells.clear();
        self.touched_values.clear();
        self.store.set_content(tables, values);

        let full = self.get_mergeable_content();
        self.notify_change_listeners(&full);
        true
    }

    /// Merge an incoming stamped subtree leaf-by-leaf.
    ///
    /// An incoming `(value, time)` replaces the existing leaf iff `time` is
    /// strictly greater than the leaf's recorded time; on exact equality the
    /// existing value is kept. Malformed payloads are discarded wholesale.
    /// Returns whether any leaf was applied.
    pub fn apply_changes(&mut self, changes: MergeableContent) -> bool {
        if !changes.validate() {
            log::debug!("[MergeableStore] discarding invalid changes");
            return false;
        }
        if changes.is_empty() {
            return false;
        }
        self.in_transaction(|s| {
            let mut applied = 0usize;
            for (table_id, table) in &changes.tables.value {
                for (row_id, row) in &table.value {
                    for (cell_id, cell) in &row.value {
                        s.hlc.observe(&cell.time);
                        if cell.time.as_str() > s.leaf_cell_time(table_id, row_id, cell_id) {
                            match &cell.value {
                                Some(value) => {
                                    s.store.set_cell(table_id, row_id, cell_id, value.clone())
                                }
                                None => s.store.del_cell(table_id, row_id, cell_id),
                            }
                            s.stamp_cell(
                                table_id,
                                row_id,
                                cell_id,
                                cell.value.clone(),
                                cell.time.clone(),
                            );
                            s.touched_cells.insert((
                                table_id.clone(),
                                row_id.clone(),
                                cell_id.clone(),
                            ));
                            applied += 1;
                        }
                    }
                }
            }
            for (value_id, leaf) in &changes.values.value {
                s.hlc.observe(&leaf.time);
                if leaf.time.as_str() > s.leaf_value_time(value_id) {
                    match &leaf.value {
                        Some(value) => s.store.set_value(value_id, value.clone()),
                        None => s.store.del_value(value_id),
                    }
                    s.stamp_value(value_id, leaf.value.clone(), leaf.time.clone());
                    s.touched_values.insert(value_id.clone());
                    applied += 1;
                }
            }
            if applied > 0 {
                log::debug!("[MergeableStore] applied {} leaves", applied);
            }
            applied > 0
        })
    }

    /// Merge two stores bidirectionally by exchanging full contents.
    pub fn merge(&mut self, other: &mut MergeableStore) {
        let mine = self.get_mergeable_content();
        let theirs = other.get_mergeable_content();
        self.apply_changes(theirs);
        other.apply_changes(mine);
    }

    // =========================================================================
    // Hash-diff API
    // =========================================================================

    /// O(1) read of the root aggregates: `(tables_hash, values_hash)`.
    pub fn get_content_hashes(&self) -> (Hash, Hash) {
        (self.tables.hash, self.values.hash)
    }

    /// Hash per table.
    pub fn get_table_hashes(&self) -> IndexMap<Id, Hash> {
        self.tables
            .value
            .iter()
            .map(|(id, table)| (id.clone(), table.hash))
            .collect()
    }

    /// Row hashes for exactly the tables whose hash differs from the peer's.
    pub fn get_row_hashes(&self, other_table_hashes: &IndexMap<Id, Hash>) -> RowHashes {
        let mut row_hashes = RowHashes::new();
        for (table_id, other_hash) in other_table_hashes {
            if let Some(table) = self.tables.value.get(table_id) {
                if table.hash != *other_hash {
                    row_hashes.insert(
                        table_id.clone(),
                        table
                            .value
                            .iter()
                            .map(|(id, row)| (id.clone(), row.hash))
                            .collect(),
                    );
                }
            }
        }
        row_hashes
    }

    /// Cell hashes for exactly the rows whose hash differs from the peer's.
    pub fn get_cell_hashes(&self, other_row_hashes: &RowHashes) -> CellHashes {
        let mut cell_hashes = CellHashes::new();
        for (table_id, other_rows) in other_row_hashes {
            if let Some(table) = self.tables.value.get(table_id) {
                for (row_id, other_hash) in other_rows {
                    if let Some(row) = table.value.get(row_id) {
                        if row.hash != *other_hash {
                            cell_hashes
                                .entry(table_id.clone())
                                .or_default()
                                .insert(
                                    row_id.clone(),
                                    row.value
                                        .iter()
                                        .map(|(id, cell)| (id.clone(), cell.hash))
                                        .collect(),
                                );
                        }
                    }
                }
            }
        }
        cell_hashes
    }

    /// Hash per keyed value.
    pub fn get_value_hashes(&self) -> IndexMap<Id, Hash> {
        self.values
            .value
            .iter()
            .map(|(id, leaf)| (id.clone(), leaf.hash))
            .collect()
    }

    /// Tables the peer lacks entirely (full payload) plus the ids and local
    /// hashes of tables that exist on both sides but differ. Payload for the
    /// differing ids is withheld until requested at finer grain.
    pub fn get_table_diff(
        &self,
        other_table_hashes: &IndexMap<Id, Hash>,
    ) -> (TablesStamp, IndexMap<Id, Hash>) {
        let mut new_tables =
            TablesStamp::new(IndexMap::new(), self.tables.time.clone(), self.tables.hash);
        let mut differing = IndexMap::new();
        for (table_id, table) in &self.tables.value {
            match other_table_hashes.get(table_id) {
                None => {
                    new_tables.value.insert(table_id.clone(), table.clone());
                }
                Some(other_hash) if *other_hash != table.hash => {
                    differing.insert(table_id.clone(), table.hash);
                }
                _ => {}
            }
        }
        (new_tables, differing)
    }

    /// Rows the peer lacks (full payload) plus differing row ids and hashes,
    /// scoped to the tables the peer asked about.
    pub fn get_row_diff(&self, other_row_hashes: &RowHashes) -> (TablesStamp, RowHashes) {
        let mut new_rows =
            TablesStamp::new(IndexMap::new(), self.tables.time.clone(), self.tables.hash);
        let mut differing = RowHashes::new();
        for (table_id, other_rows) in other_row_hashes {
            if let Some(table) = self.tables.value.get(table_id) {
                for (row_id, row) in &table.value {
                    match other_rows.get(row_id) {
                        None => {
                            let table_entry = new_rows
                                .value
                                .entry(table_id.clone())
                                .or_insert_with(|| {
                                    TableStamp::new(IndexMap::new(), table.time.clone(), table.hash)
                                });
                            table_entry.value.insert(row_id.clone(), row.clone());
                        }
                        Some(other_hash) if *other_hash != row.hash => {
                            differing
                                .entry(table_id.clone())
                                .or_default()
                                .insert(row_id.clone(), row.hash);
                        }
                        _ => {}
                    }
                }
            }
        }
        (new_rows, differing)
    }

    /// Full cell-level stamps for just the cells that are absent from or
    /// differ against the peer's cell-hash map.
    pub fn get_cell_diff(&self, other_cell_hashes: &CellHashes) -> TablesStamp {
        let mut diff =
            TablesStamp::new(IndexMap::new(), self.tables.time.clone(), self.tables.hash);
        for (table_id, other_rows) in other_cell_hashes {
            let Some(table) = self.tables.value.get(table_id) else {
                continue;
            };
            for (row_id, other_cells) in other_rows {
                let Some(row) = table.value.get(row_id) else {
                    continue;
                };
                for (cell_id, cell) in &row.value {
                    let include = match other_cells.get(cell_id) {
                        None => true,
                        Some(other_hash) => *other_hash != cell.hash,
                    };
                    if include {
                        let table_entry = diff
                            .value
                            .entry(table_id.clone())
                            .or_insert_with(|| {
                                TableStamp::new(IndexMap::new(), table.time.clone(), table.hash)
                            });
                        let row_entry = table_entry
                            .value
                            .entry(row_id.clone())
                            .or_insert_with(|| {
                                RowStamp::new(IndexMap::new(), row.time.clone(), row.hash)
                            });
                        row_entry.value.insert(cell_id.clone(), cell.clone());
                    }
                }
            }
        }
        diff
    }

    /// Value stamps absent from or differing against the peer's value-hash
    /// map. Values are a single level; there is no finer descent.
    pub fn get_value_diff(&self, other_value_hashes: &IndexMap<Id, Hash>) -> ValuesStamp {
        let mut diff =
            ValuesStamp::new(IndexMap::new(), self.values.time.clone(), self.values.hash);
        for (value_id, leaf) in &self.values.value {
            let include = match other_value_hashes.get(value_id) {
                None => true,
                Some(other_hash) => *other_hash != leaf.hash,
            };
            if include {
                diff.value.insert(value_id.clone(), leaf.clone());
            }
        }
        diff
    }
}

impl std::fmt::Debug for MergeableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeableStore")
            .field("id", &self.id)
            .field("tables_hash", &self.tables.hash)
            .field("values_hash", &self.values.hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mergeable::stamp::fnv1a;

    fn create_test_store(id: &str) -> MergeableStore {
        MergeableStore::new(id)
    }

    /// Recompute the root hashes of a content snapshot from its leaves.
    fn recomputed_hashes(content: &MergeableContent) -> (Hash, Hash) {
        let mut content = content.clone();
        recompute_tables(&mut content.tables);
        recompute_values(&mut content.values);
        (content.tables.hash, content.values.hash)
    }

    #[test]
    fn test_set_cell_updates_store_and_hashes() {
        let mut store = create_test_store("a");
        let before = store.get_content_hashes();
        store.set_cell("pets", "fido", "species", "dog");

        assert_eq!(
            store.get_cell("pets", "fido", "species"),
            Some(&Cell::from("dog"))
        );
        assert_ne!(store.get_content_hashes(), before);
    }

    #[test]
    fn test_content_hashes_stable_without_mutation() {
        let mut store = create_test_store("a");
        store.set_cell("pets", "fido", "species", "dog");
        store.set_value("open", true);
        assert_eq!(store.get_content_hashes(), store.get_content_hashes());
    }

    #[test]
    fn test_hash_round_trip() {
        let mut store = create_test_store("a");
        store.set_cell("pets", "fido", "species", "dog");
        store.set_cell("pets", "fido", "color", "brown");
        store.set_cell("pets", "felix", "species", "cat");
        store.del_cell("pets", "fido", "color");
        store.set_value("open", true);
        store.set_value("employees", 3.0);

        let content = store.get_mergeable_content();
        assert_eq!(recomputed_hashes(&content), store.get_content_hashes());
    }

    #[test]
    fn test_lww_older_remote_write_loses() {
        let mut a = create_test_store("a");
        let mut b = create_test_store("b");

        b.set_cell("pets", "fido", "color", "black");
        let older = b.get_mergeable_content();

        // a's write happens after b's, so a's clock has moved past b's stamp
        // once it has seen it.
        a.apply_changes(older.clone());
        a.set_cell("pets", "fido", "color", "brown");
        a.apply_changes(older);

        assert_eq!(
            a.get_cell("pets", "fido", "color"),
            Some(&Cell::from("brown"))
        );
    }

    #[test]
    fn test_apply_changes_is_idempotent() {
        let mut a = create_test_store("a");
        let mut b = create_test_store("b");
        a.set_cell("pets", "fido", "species", "dog");
        let changes = a.get_mergeable_content();

        b.apply_changes(changes.clone());
        let once = (b.get_content(), b.get_content_hashes());
        b.apply_changes(changes);
        let twice = (b.get_content(), b.get_content_hashes());

        assert_eq!(once, twice);
    }

    #[test]
    fn test_apply_changes_commutes() {
        let mut a = create_test_store("a");
        let mut b = create_test_store("b");
        a.set_cell("pets", "fido", "species", "dog");
        b.set_cell("pets", "felix", "species", "cat");
        let delta_a = a.get_mergeable_content();
        let delta_b = b.get_mergeable_content();

        let mut x = create_test_store("x");
        x.apply_changes(delta_a.clone());
        x.apply_changes(delta_b.clone());

        let mut y = create_test_store("y");
        y.apply_changes(delta_b);
        y.apply_changes(delta_a);

        assert_eq!(x.get_content(), y.get_content());
        assert_eq!(x.get_content_hashes(), y.get_content_hashes());
    }

    #[test]
    fn test_merge_converges_and_later_writer_wins() {
        let mut a = create_test_store("a");
        let mut b = create_test_store("b");
        a.set_cell("pets", "fido", "color", "brown");
        b.set_cell("pets", "fido", "color", "black");

        a.merge(&mut b);

        assert_eq!(a.get_content(), b.get_content());
        assert_eq!(a.get_content_hashes(), b.get_content_hashes());

        // The surviving value is the one whose timestamp sorts greater.
        let winner = a.get_cell("pets", "fido", "color").cloned();
        let a_time = a.tables.value["pets"].value["fido"].value["color"].time.clone();
        assert!(winner == Some(Cell::from("brown")) || winner == Some(Cell::from("black")));
        assert!(!a_time.is_empty());
    }

    #[test]
    fn test_tombstone_propagates() {
        let mut a = create_test_store("a");
        let mut b = create_test_store("b");
        a.set_cell("pets", "fido", "species", "dog");
        a.merge(&mut b);
        assert!(b.has_cell("pets", "fido", "species"));

        a.del_cell("pets", "fido", "species");
        a.merge(&mut b);

        assert!(!b.has_cell("pets", "fido", "species"));
        assert_eq!(a.get_content_hashes(), b.get_content_hashes());
    }

    #[test]
    fn test_default_content_never_outranks_real_writes() {
        let mut store = create_test_store("a");
        store.set_cell("settings", "row", "theme", "dark");
        store.set_default_content(
            Tables::from([(
                "settings".to_string(),
                Table::from([(
                    "row".to_string(),
                    Row::from([
                        ("theme".to_string(), Cell::from("light")),
                        ("lang".to_string(), Cell::from("en")),
                    ]),
                )]),
            )]),
            Values::new(),
        );

        // The causally-written cell survives; the unwritten default fills in.
        assert_eq!(
            store.get_cell("settings", "row", "theme"),
            Some(&Cell::from("dark"))
        );
        assert_eq!(
            store.get_cell("settings", "row", "lang"),
            Some(&Cell::from("en"))
        );

        // A remote real write beats a default, regardless of arrival order.
        let mut remote = create_test_store("b");
        remote.set_cell("settings", "row", "lang", "fr");
        store.apply_changes(remote.get_mergeable_content());
        assert_eq!(
            store.get_cell("settings", "row", "lang"),
            Some(&Cell::from("fr"))
        );
    }

    #[test]
    fn test_table_diff_empty_for_equal_stores() {
        let mut a = create_test_store("a");
        a.set_cell("pets", "fido", "species", "dog");
        let hashes = a.get_table_hashes();

        let (new_tables, differing) = a.get_table_diff(&hashes);
        assert!(new_tables.value.is_empty());
        assert!(differing.is_empty());
    }

    #[test]
    fn test_table_diff_reports_missing_and_differing() {
        let mut a = create_test_store("a");
        let mut b = create_test_store("b");
        a.set_cell("pets", "fido", "species", "dog");
        a.set_cell("stock", "item1", "count", 5.0);
        b.set_cell("pets", "fido", "species", "cat");

        let (new_tables, differing) = a.get_table_diff(&b.get_table_hashes());
        // "stock" is absent on b: full payload.
        assert!(new_tables.value.contains_key("stock"));
        // "pets" exists on both but differs: id + hash only.
        assert!(differing.contains_key("pets"));
        assert!(!new_tables.value.contains_key("pets"));
    }

    #[test]
    fn test_row_and_cell_hash_descent_scopes_to_divergence() {
        let mut a = create_test_store("a");
        let mut b = create_test_store("b");
        a.set_cell("pets", "fido", "species", "dog");
        a.merge(&mut b);
        // Now diverge one row only.
        a.set_cell("pets", "fido", "color", "brown");
        a.set_cell("same", "row", "cell", 1.0);
        b.apply_changes(MergeableContent {
            tables: {
                let mut t = a.tables.clone();
                t.value.shift_remove("pets");
                t
            },
            values: ValuesStamp::default(),
        });

        let (_, differing) = b.get_table_diff(&a.get_table_hashes());
        assert_eq!(differing.len(), 1);
        assert!(differing.contains_key("pets"));

        let row_hashes = a.get_row_hashes(&differing);
        assert_eq!(row_hashes.len(), 1);
        assert!(row_hashes["pets"].contains_key("fido"));
    }

    #[test]
    fn test_value_diff_single_level() {
        let mut a = create_test_store("a");
        let mut b = create_test_store("b");
        a.set_value("open", true);
        a.set_value("employees", 3.0);
        b.set_value("open", false);

        let diff = a.get_value_diff(&b.get_value_hashes());
        assert!(diff.value.contains_key("employees"));
        assert!(diff.value.contains_key("open"));
    }

    #[test]
    fn test_transaction_changes_minimal_delta() {
        let mut a = create_test_store("a");
        a.set_cell("pets", "fido", "species", "dog");

        a.start_transaction();
        a.set_cell("pets", "fido", "color", "brown");
        a.set_value("open", true);
        let delta = a.get_transaction_changes();
        a.finish_transaction();

        // Only the touched leaves appear.
        assert_eq!(delta.tables.value["pets"].value["fido"].value.len(), 1);
        assert!(delta.tables.value["pets"].value["fido"]
            .value
            .contains_key("color"));
        assert_eq!(delta.values.value.len(), 1);

        // And the delta is applicable on its own.
        let mut b = create_test_store("b");
        b.apply_changes(delta);
        assert_eq!(
            b.get_cell("pets", "fido", "color"),
            Some(&Cell::from("brown"))
        );
        assert!(!b.has_cell("pets", "fido", "species"));
    }

    #[test]
    fn test_change_listener_fires_once_per_transaction() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut a = create_test_store("a");
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        a.add_change_listener(Box::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        a.transaction(|s| {
            s.set_cell("t", "r", "a", 1.0);
            s.set_cell("t", "r", "b", 2.0);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_mergeable_content_replaces_wholesale() {
        let mut a = create_test_store("a");
        a.set_cell("pets", "fido", "species", "dog");
        let snapshot = a.get_mergeable_content();

        let mut b = create_test_store("b");
        b.set_cell("junk", "row", "cell", 9.0);
        assert!(b.set_mergeable_content(snapshot));

        assert_eq!(a.get_content(), b.get_content());
        assert_eq!(a.get_content_hashes(), b.get_content_hashes());
        assert!(!b.store().has_table("junk"));
    }

    #[test]
    fn test_set_mergeable_content_rejects_malformed() {
        let mut store = create_test_store("a");
        store.set_cell("pets", "fido", "species", "dog");
        let before = store.get_content_hashes();

        let mut bad = MergeableContent::default();
        bad.tables.time = "not-a-valid-time!!".to_string();
        assert!(!store.set_mergeable_content(bad));
        assert_eq!(store.get_content_hashes(), before);
    }

    #[test]
    fn test_empty_store_root_hash_is_empty_time_hash() {
        let store = create_test_store("a");
        let (tables_hash, values_hash) = store.get_content_hashes();
        assert_eq!(tables_hash, fnv1a(b""));
        assert_eq!(values_hash, fnv1a(b""));
        // Two fresh replicas agree before any writes.
        let other = create_test_store("b");
        assert_eq!(store.get_content_hashes(), other.get_content_hashes());
    }
}
