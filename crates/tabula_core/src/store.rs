//! Plain reactive tabular store.
//!
//! This is the non-mergeable collaborator that [`MergeableStore`] wraps: an
//! in-memory Tables → Rows → Cells structure plus a flat keyed-value map,
//! with depth-counted transactions and synchronous write hooks. It knows
//! nothing about timestamps or hashes.
//!
//! [`MergeableStore`]: crate::mergeable::MergeableStore

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Identifier for tables, rows, cells, and values.
pub type Id = String;

/// A cell's row, keyed by cell id.
pub type Row = IndexMap<Id, Cell>;

/// A table, keyed by row id.
pub type Table = IndexMap<Id, Row>;

/// All tables, keyed by table id.
pub type Tables = IndexMap<Id, Table>;

/// The keyed-value half of the store.
pub type Values = IndexMap<Id, Value>;

/// Scalar stored in a single cell: boolean, number, or string.
///
/// Serialized untagged, so the JSON representation is the bare scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    /// Boolean cell.
    Bool(bool),
    /// Numeric cell (64-bit float).
    Number(f64),
    /// String cell.
    String(String),
}

/// Keyed values share the cell scalar type.
pub type Value = Cell;

impl Cell {
    /// Numbers must be finite to survive a JSON round trip.
    pub fn is_valid(&self) -> bool {
        match self {
            Cell::Number(n) => n.is_finite(),
            _ => true,
        }
    }
}

impl From<bool> for Cell {
    fn from(b: bool) -> Self {
        Cell::Bool(b)
    }
}

impl From<f64> for Cell {
    fn from(n: f64) -> Self {
        Cell::Number(n)
    }
}

impl From<i64> for Cell {
    fn from(n: i64) -> Self {
        Cell::Number(n as f64)
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::String(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::String(s)
    }
}

/// Hook invoked synchronously on every cell mutation.
///
/// Arguments are `(table_id, row_id, cell_id, new_cell)`; `None` signals a
/// deletion.
pub type CellHook = Box<dyn FnMut(&str, &str, &str, Option<&Cell>) + Send>;

/// Hook invoked synchronously on every keyed-value mutation.
pub type ValueHook = Box<dyn FnMut(&str, Option<&Value>) + Send>;

/// Hook invoked when the outermost transaction finishes.
pub type TransactionHook = Box<dyn FnMut() + Send>;

/// In-memory reactive tabular store.
///
/// Mutations fire registered hooks synchronously. Transactions nest by depth
/// counting; finish hooks run once when the outermost transaction ends.
/// Rows and tables emptied by cell deletion are pruned.
#[derive(Default)]
pub struct Store {
    tables: Tables,
    values: Values,
    transaction_depth: usize,
    cell_hooks: Vec<CellHook>,
    value_hooks: Vec<ValueHook>,
    finish_hooks: Vec<TransactionHook>,
}

impl Store {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// All tables.
    pub fn get_tables(&self) -> &Tables {
        &self.tables
    }

    /// A single table, if present.
    pub fn get_table(&self, table_id: &str) -> Option<&Table> {
        self.tables.get(table_id)
    }

    /// A single row, if present.
    pub fn get_row(&self, table_id: &str, row_id: &str) -> Option<&Row> {
        self.tables.get(table_id)?.get(row_id)
    }

    /// A single cell, if present.
    pub fn get_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<&Cell> {
        self.tables.get(table_id)?.get(row_id)?.get(cell_id)
    }

    /// All keyed values.
    pub fn get_values(&self) -> &Values {
        &self.values
    }

    /// A single keyed value, if present.
    pub fn get_value(&self, value_id: &str) -> Option<&Value> {
        self.values.get(value_id)
    }

    /// Whether a table exists.
    pub fn has_table(&self, table_id: &str) -> bool {
        self.tables.contains_key(table_id)
    }

    /// Whether a row exists.
    pub fn has_row(&self, table_id: &str, row_id: &str) -> bool {
        self.get_row(table_id, row_id).is_some()
    }

    /// Whether a cell exists.
    pub fn has_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> bool {
        self.get_cell(table_id, row_id, cell_id).is_some()
    }

    /// Whether the store holds no tables and no values.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.values.is_empty()
    }

    /// Ids of all tables.
    pub fn table_ids(&self) -> Vec<Id> {
        self.tables.keys().cloned().collect()
    }

    /// Ids of all rows in a table.
    pub fn row_ids(&self, table_id: &str) -> Vec<Id> {
        self.tables
            .get(table_id)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of all cells in a row.
    pub fn cell_ids(&self, table_id: &str, row_id: &str) -> Vec<Id> {
        self.get_row(table_id, row_id)
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Full snapshot of tables and values.
    pub fn get_content(&self) -> (Tables, Values) {
        (self.tables.clone(), self.values.clone())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Set a cell, creating its row and table as needed.
    pub fn set_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str, cell: Cell) {
        self.tables
            .entry(table_id.to_string())
            .or_default()
            .entry(row_id.to_string())
            .or_default()
            .insert(cell_id.to_string(), cell.clone());
        self.fire_cell_hooks(table_id, row_id, cell_id, Some(&cell));
        self.maybe_fire_finish();
    }

    /// Delete a cell. Empty rows and tables are pruned.
    pub fn del_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str) {
        let mut removed = false;
        if let Some(table) = self.tables.get_mut(table_id) {
            if let Some(row) = table.get_mut(row_id) {
                removed = row.shift_remove(cell_id).is_some();
                if row.is_empty() {
                    table.shift_remove(row_id);
                }
            }
            if table.is_empty() {
                self.tables.shift_remove(table_id);
            }
        }
        if removed {
            self.fire_cell_hooks(table_id, row_id, cell_id, None);
            self.maybe_fire_finish();
        }
    }

    /// Delete a whole row, firing a hook per removed cell.
    pub fn del_row(&mut self, table_id: &str, row_id: &str) {
        for cell_id in self.cell_ids(table_id, row_id) {
            self.del_cell(table_id, row_id, &cell_id);
        }
    }

    /// Delete a whole table, firing a hook per removed cell.
    pub fn del_table(&mut self, table_id: &str) {
        for row_id in self.row_ids(table_id) {
            self.del_row(table_id, &row_id);
        }
    }

    /// Set a keyed value.
    pub fn set_value(&mut self, value_id: &str, value: Value) {
        self.values.insert(value_id.to_string(), value.clone());
        self.fire_value_hooks(value_id, Some(&value));
        self.maybe_fire_finish();
    }

    /// Delete a keyed value.
    pub fn del_value(&mut self, value_id: &str) {
        if self.values.shift_remove(value_id).is_some() {
            self.fire_value_hooks(value_id, None);
            self.maybe_fire_finish();
        }
    }

    /// Replace all tables wholesale, without per-cell hook dispatch.
    ///
    /// Used for trusted bulk loads; finish hooks still fire once.
    pub fn set_tables(&mut self, tables: Tables) {
        self.tables = tables;
        self.maybe_fire_finish();
    }

    /// Replace all keyed values wholesale, without per-value hook dispatch.
    pub fn set_values(&mut self, values: Values) {
        self.values = values;
        self.maybe_fire_finish();
    }

    /// Replace the entire content wholesale, without per-cell hook dispatch.
    pub fn set_content(&mut self, tables: Tables, values: Values) {
        self.tables = tables;
        self.values = values;
        self.maybe_fire_finish();
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Begin a (possibly nested) transaction.
    pub fn start_transaction(&mut self) {
        self.transaction_depth += 1;
    }

    /// End a transaction; finish hooks fire when the outermost one ends.
    pub fn finish_transaction(&mut self) {
        if self.transaction_depth > 0 {
            self.transaction_depth -= 1;
            if self.transaction_depth == 0 {
                self.fire_finish_hooks();
            }
        }
    }

    /// Current transaction nesting depth.
    pub fn transaction_depth(&self) -> usize {
        self.transaction_depth
    }

    /// Run `f` inside a transaction.
    pub fn transaction<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.start_transaction();
        let result = f(self);
        self.finish_transaction();
        result
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Register a synchronous per-cell write hook.
    pub fn add_cell_hook(&mut self, hook: CellHook) {
        self.cell_hooks.push(hook);
    }

    /// Register a synchronous per-value write hook.
    pub fn add_value_hook(&mut self, hook: ValueHook) {
        self.value_hooks.push(hook);
    }

    /// Register a hook fired when the outermost transaction finishes.
    pub fn add_finish_hook(&mut self, hook: TransactionHook) {
        self.finish_hooks.push(hook);
    }

    fn fire_cell_hooks(&mut self, table_id: &str, row_id: &str, cell_id: &str, cell: Option<&Cell>) {
        let mut hooks = std::mem::take(&mut self.cell_hooks);
        for hook in &mut hooks {
            hook(table_id, row_id, cell_id, cell);
        }
        // Hooks registered during dispatch land after the existing ones.
        hooks.append(&mut self.cell_hooks);
        self.cell_hooks = hooks;
    }

    fn fire_value_hooks(&mut self, value_id: &str, value: Option<&Value>) {
        let mut hooks = std::mem::take(&mut self.value_hooks);
        for hook in &mut hooks {
            hook(value_id, value);
        }
        hooks.append(&mut self.value_hooks);
        self.value_hooks = hooks;
    }

    fn fire_finish_hooks(&mut self) {
        let mut hooks = std::mem::take(&mut self.finish_hooks);
        for hook in &mut hooks {
            hook();
        }
        hooks.append(&mut self.finish_hooks);
        self.finish_hooks = hooks;
    }

    /// Writes outside an explicit transaction fire finish hooks immediately.
    fn maybe_fire_finish(&mut self) {
        if self.transaction_depth == 0 {
            self.fire_finish_hooks();
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("tables", &self.tables)
            .field("values", &self.values)
            .field("transaction_depth", &self.transaction_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_set_and_get_cell() {
        let mut store = Store::new();
        store.set_cell("pets", "fido", "species", Cell::from("dog"));

        assert_eq!(
            store.get_cell("pets", "fido", "species"),
            Some(&Cell::String("dog".to_string()))
        );
        assert!(store.has_table("pets"));
        assert!(store.has_row("pets", "fido"));
    }

    #[test]
    fn test_del_cell_prunes_empty_containers() {
        let mut store = Store::new();
        store.set_cell("pets", "fido", "species", Cell::from("dog"));
        store.del_cell("pets", "fido", "species");

        assert!(!store.has_row("pets", "fido"));
        assert!(!store.has_table("pets"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_values() {
        let mut store = Store::new();
        store.set_value("open", Cell::from(true));
        assert_eq!(store.get_value("open"), Some(&Cell::Bool(true)));

        store.del_value("open");
        assert!(store.get_value("open").is_none());
    }

    #[test]
    fn test_cell_hook_fires() {
        let mut store = Store::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        store.add_cell_hook(Box::new(move |_, _, _, _| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        store.set_cell("t", "r", "c", Cell::from(1.0));
        store.del_cell("t", "r", "c");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_finish_hook_fires_once_per_transaction() {
        let mut store = Store::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        store.add_finish_hook(Box::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        store.transaction(|s| {
            s.set_cell("t", "r", "a", Cell::from(1.0));
            s.set_cell("t", "r", "b", Cell::from(2.0));
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Outside a transaction each write flushes immediately.
        store.set_cell("t", "r", "c", Cell::from(3.0));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cell_untagged_serde() {
        let json = serde_json::to_string(&Cell::from("dog")).unwrap();
        assert_eq!(json, "\"dog\"");
        let back: Cell = serde_json::from_str("42.0").unwrap();
        assert_eq!(back, Cell::Number(42.0));
    }

    #[test]
    fn test_invalid_number_cell() {
        assert!(!Cell::Number(f64::NAN).is_valid());
        assert!(Cell::Number(0.0).is_valid());
        assert!(Cell::Bool(false).is_valid());
    }
}
