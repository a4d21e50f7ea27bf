//! Key/ID translation.
//!
//! Keyed indexes address columns by string, keyed fields address rows by
//! string; internally everything is integer IDs. Reads resolve keys in
//! batches and map unknown keys to a sentinel that can never hold data, so
//! they produce empty results rather than errors. Allocation happens only on
//! the write path and is serialized per index, standing in for the external
//! translator component that owns ID assignment in a full deployment.

use crate::error::{Result, TranslateError};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// The ID unknown keys resolve to on the read path. Never allocated.
pub const MISSING_ID: u64 = u64::MAX;

#[derive(Default)]
struct KeyTable {
    by_key: FxHashMap<String, u64>,
    by_id: Vec<String>,
}

impl KeyTable {
    fn get(&self, key: &str) -> Option<u64> {
        self.by_key.get(key).copied()
    }

    fn get_or_create(&mut self, key: &str) -> u64 {
        if let Some(id) = self.by_key.get(key) {
            return *id;
        }
        let id = self.by_id.len() as u64;
        self.by_id.push(key.to_owned());
        self.by_key.insert(key.to_owned(), id);
        id
    }

    fn key_of(&self, id: u64) -> Option<&str> {
        self.by_id.get(id as usize).map(String::as_str)
    }
}

#[derive(Default)]
struct IndexTables {
    columns: KeyTable,
    rows: FxHashMap<String, KeyTable>,
}

/// The shared translation store. Shared-read; each index's allocations are
/// serialized behind that index's lock.
#[derive(Default)]
pub struct TranslateStore {
    indexes: RwLock<FxHashMap<String, Arc<Mutex<IndexTables>>>>,
}

impl TranslateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self, index: &str) -> Arc<Mutex<IndexTables>> {
        if let Some(t) = self.indexes.read().get(index) {
            return t.clone();
        }
        self.indexes.write().entry(index.to_owned()).or_default().clone()
    }

    /// Resolves a column key; `MISSING_ID` when unknown.
    pub fn col_id(&self, index: &str, key: &str) -> u64 {
        self.tables(index).lock().columns.get(key).unwrap_or(MISSING_ID)
    }

    pub fn col_id_or_create(&self, index: &str, key: &str) -> u64 {
        self.tables(index).lock().columns.get_or_create(key)
    }

    /// Translates column IDs back to keys after reduction. Missing entries
    /// are an invariant breach: results only carry allocated IDs.
    pub fn col_keys(&self, index: &str, ids: &[u64]) -> Result<Vec<String>> {
        let tables = self.tables(index);
        let tables = tables.lock();
        ids.iter()
            .map(|&id| {
                tables
                    .columns
                    .key_of(id)
                    .map(str::to_owned)
                    .ok_or_else(|| anyhow::anyhow!("column id {id} has no key in index `{index}`").into())
            })
            .collect()
    }

    pub fn row_id(&self, index: &str, field: &str, key: &str) -> u64 {
        self.tables(index)
            .lock()
            .rows
            .get(field)
            .and_then(|t| t.get(key))
            .unwrap_or(MISSING_ID)
    }

    pub fn row_id_or_create(&self, index: &str, field: &str, key: &str) -> u64 {
        self.tables(index).lock().rows.entry(field.to_owned()).or_default().get_or_create(key)
    }

    pub fn row_keys(&self, index: &str, field: &str, ids: &[u64]) -> Result<Vec<String>> {
        let tables = self.tables(index);
        let tables = tables.lock();
        let table = tables.rows.get(field);
        ids.iter()
            .map(|&id| {
                table
                    .and_then(|t| t.key_of(id))
                    .map(str::to_owned)
                    .ok_or_else(|| anyhow::anyhow!("row id {id} has no key in field `{field}`").into())
            })
            .collect()
    }

    /// Row IDs whose key matches a SQL-LIKE pattern (`%` multi-char, `_`
    /// single-char). Backs `Rows(field, like="...")`.
    pub fn row_ids_like(&self, index: &str, field: &str, pattern: &str) -> Vec<u64> {
        let tables = self.tables(index);
        let tables = tables.lock();
        let Some(table) = tables.rows.get(field) else {
            return Vec::new();
        };
        let mut ids: Vec<u64> = table
            .by_key
            .iter()
            .filter(|(key, _)| like_match(pattern, key))
            .map(|(_, &id)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Read-path resolution that errors instead of allocating, for write
    /// requests that reference a key in a read position.
    pub fn require_row_id(&self, index: &str, field: &str, key: &str) -> Result<u64> {
        match self.row_id(index, field, key) {
            MISSING_ID => Err(TranslateError::ReadOnlyAllocation { key: key.to_owned() }.into()),
            id => Ok(id),
        }
    }
}

fn like_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    // Iterative wildcard match with single backtrack point for `%`.
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut mark) = (usize::MAX, 0usize);
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '_' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '%' {
            star = pi;
            mark = ti;
            pi += 1;
        } else if star != usize::MAX {
            pi = star + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '%' {
        pi += 1;
    }
    pi == p.len()
}
