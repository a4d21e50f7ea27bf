//! The in-memory shard store.
//!
//! All committed data lives behind one `RwLock`; readers never hold it across
//! kernel execution. A query opens a [`ShardView`] per (index, shard) on
//! first touch, which snapshots that shard's fragments as `Arc` clones, so a
//! kernel sees a stable point-in-time image while writers keep going. Writers
//! mutate through `Arc::make_mut`, which is what makes the snapshots cheap.

use crate::bsi::Bsi;
use crate::db::schema::{IndexSchema, Schema, VIEW_STANDARD};
use crate::error::{ExecError, Result};
use crate::row::Row;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Rows of one view within one shard, keyed by row ID.
pub type ShardRows = BTreeMap<u64, Arc<Row>>;

#[derive(Default)]
struct ViewData {
    shards: FxHashMap<u64, Arc<ShardRows>>,
}

#[derive(Default)]
struct FieldData {
    views: FxHashMap<String, ViewData>,
    bsi: FxHashMap<u64, Arc<Bsi>>,
}

#[derive(Default)]
struct IndexData {
    existence: FxHashMap<u64, Arc<Row>>,
    fields: FxHashMap<String, FieldData>,
}

#[derive(Default)]
struct CommittedState {
    indexes: FxHashMap<String, IndexData>,
}

/// Which shards hold data, per index, across the whole cluster. Every node
/// updates it on write; in a real deployment this is fed by the membership
/// gossip, which is out of scope here.
#[derive(Default)]
pub struct ShardRegistry {
    inner: RwLock<FxHashMap<String, BTreeSet<u64>>>,
}

impl ShardRegistry {
    pub fn note(&self, index: &str, shard: u64) {
        self.inner.write().entry(index.to_owned()).or_default().insert(shard);
    }

    /// Shards known to hold data; `{0}` for an index nothing has written to,
    /// so reads on an empty index still fan out somewhere.
    pub fn shards(&self, index: &str) -> BTreeSet<u64> {
        let shards = self.inner.read().get(index).cloned().unwrap_or_default();
        if shards.is_empty() { BTreeSet::from([0]) } else { shards }
    }

    pub fn remove_index(&self, index: &str) {
        self.inner.write().remove(index);
    }
}

/// Per-(field, shard) snapshot inside a [`ShardView`].
#[derive(Default)]
pub struct FieldShard {
    views: FxHashMap<String, Arc<ShardRows>>,
    bsi: Option<Arc<Bsi>>,
}

/// A point-in-time image of one shard of one index.
pub struct ShardView {
    pub index: Arc<IndexSchema>,
    pub shard: u64,
    existence: Option<Arc<Row>>,
    fields: FxHashMap<String, FieldShard>,
}

impl ShardView {
    /// Column range `[lo, hi)` this shard covers.
    pub fn col_range(&self) -> (u64, u64) {
        pilcrow_primitives::shard_range(self.shard, self.index.def.shard_width_exp)
    }

    pub fn existence(&self) -> Option<&Row> {
        self.existence.as_deref()
    }

    /// One stored row of `field` in the named view; empty when absent.
    pub fn row(&self, field: &str, view: &str, row_id: u64) -> Row {
        self.fields
            .get(field)
            .and_then(|f| f.views.get(view))
            .and_then(|rows| rows.get(&row_id))
            .map(|r| Row::clone(r))
            .unwrap_or_default()
    }

    /// All rows of `field` in the named view, ascending by row ID.
    pub fn rows(&self, field: &str, view: &str) -> Option<&ShardRows> {
        self.fields.get(field).and_then(|f| f.views.get(view)).map(|v| &**v)
    }

    /// The names of every view `field` has data for in this shard.
    pub fn view_names(&self, field: &str) -> Vec<&str> {
        self.fields
            .get(field)
            .map(|f| f.views.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn bsi(&self, field: &str) -> Option<&Bsi> {
        self.fields.get(field).and_then(|f| f.bsi.as_deref())
    }

    /// The ranked-cache read model: row IDs of `field` ordered by descending
    /// count (ties ascending by ID), truncated to the cache size.
    pub fn top_rows(&self, field: &str, cache_size: u32) -> Vec<(u64, u64)> {
        let Some(rows) = self.rows(field, VIEW_STANDARD) else {
            return Vec::new();
        };
        let mut out: Vec<(u64, u64)> = rows.iter().map(|(&id, r)| (id, r.count())).collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        out.truncate(cache_size as usize);
        out
    }
}

/// The node-local store.
pub struct Store {
    schema: Arc<Schema>,
    registry: Arc<ShardRegistry>,
    state: RwLock<CommittedState>,
}

impl Store {
    pub fn new(schema: Arc<Schema>, registry: Arc<ShardRegistry>) -> Self {
        Self { schema, registry, state: RwLock::new(CommittedState::default()) }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    /// Opens a snapshot of `shard`. Cheap: clones `Arc`s, not data.
    pub fn open_view(&self, index: &str, shard: u64) -> Result<Arc<ShardView>> {
        let schema = self.schema.index(index)?;
        let state = self.state.read();
        let mut view = ShardView {
            index: schema,
            shard,
            existence: None,
            fields: FxHashMap::default(),
        };
        if let Some(data) = state.indexes.get(index) {
            view.existence = data.existence.get(&shard).cloned();
            for (name, field) in &data.fields {
                let mut fs = FieldShard { bsi: field.bsi.get(&shard).cloned(), ..Default::default() };
                for (vname, vdata) in &field.views {
                    if let Some(rows) = vdata.shards.get(&shard) {
                        fs.views.insert(vname.clone(), rows.clone());
                    }
                }
                if fs.bsi.is_some() || !fs.views.is_empty() {
                    view.fields.insert(name.clone(), fs);
                }
            }
        }
        Ok(Arc::new(view))
    }

    /// Sets a bit, maintaining mutex exclusivity, existence and time views.
    /// Returns whether anything changed.
    pub fn set_bit(
        &self,
        index: &str,
        field: &str,
        row_id: u64,
        col: u64,
        time: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let schema = self.schema.index(index)?;
        let fdef = schema.field(field)?;
        if fdef.is_bsi() {
            return Err(ExecError::Internal(anyhow::anyhow!(
                "set_bit on BSI field `{field}`; use set_value"
            )));
        }
        let shard = pilcrow_primitives::shard_of(col, schema.def.shard_width_exp);
        let mut views = vec![];
        if fdef.has_standard_view() {
            views.push(VIEW_STANDARD.to_owned());
        }
        if let (Some(q), Some(t)) = (fdef.time_quantum(), time) {
            for suffix in q.views_for_time(t) {
                views.push(format!("{VIEW_STANDARD}_{suffix}"));
            }
        }

        let mut state = self.state.write();
        let data = state.indexes.entry(index.to_owned()).or_default();
        let fdata = data.fields.entry(field.to_owned()).or_default();
        let mut changed = false;
        for view in &views {
            let vdata = fdata.views.entry(view.clone()).or_default();
            let rows = Arc::make_mut(vdata.shards.entry(shard).or_default());
            if fdef.single_valued() && view == VIEW_STANDARD {
                // Mutex: drop the column from any other row first.
                let other: Vec<u64> = rows
                    .iter()
                    .filter(|&(&id, ref r)| id != row_id && r.contains(col))
                    .map(|(&id, _)| id)
                    .collect();
                for id in other {
                    if let Some(r) = rows.get_mut(&id) {
                        Arc::make_mut(r).remove(col);
                        changed = true;
                    }
                }
            }
            let row = rows.entry(row_id).or_insert_with(|| Arc::new(Row::new()));
            changed |= Arc::make_mut(row).add(col);
        }
        if schema.def.track_existence {
            let existence = data.existence.entry(shard).or_insert_with(|| Arc::new(Row::new()));
            Arc::make_mut(existence).add(col);
        }
        drop(state);
        self.registry.note(index, shard);
        Ok(changed)
    }

    /// Clears a bit in every view; on BSI fields clears the column's value.
    pub fn clear_bit(&self, index: &str, field: &str, row_id: u64, col: u64) -> Result<bool> {
        let schema = self.schema.index(index)?;
        let fdef = schema.field(field)?;
        let shard = pilcrow_primitives::shard_of(col, schema.def.shard_width_exp);
        let mut state = self.state.write();
        let Some(data) = state.indexes.get_mut(index) else {
            return Ok(false);
        };
        let Some(fdata) = data.fields.get_mut(field) else {
            return Ok(false);
        };
        if fdef.is_bsi() {
            let Some(bsi) = fdata.bsi.get_mut(&shard) else {
                return Ok(false);
            };
            return Ok(Arc::make_mut(bsi).clear(col));
        }
        let mut changed = false;
        for vdata in fdata.views.values_mut() {
            if let Some(rows) = vdata.shards.get_mut(&shard) {
                if let Some(row) = Arc::make_mut(rows).get_mut(&row_id) {
                    changed |= Arc::make_mut(row).remove(col);
                }
            }
        }
        Ok(changed)
    }

    /// Writes a BSI value in unscaled units, checking field bounds.
    pub fn set_value(&self, index: &str, field: &str, col: u64, value: i64) -> Result<bool> {
        let schema = self.schema.index(index)?;
        let fdef = schema.field(field)?;
        let Some((min, max)) = fdef.bsi_bounds() else {
            return Err(ExecError::Internal(anyhow::anyhow!("set_value on non-BSI field `{field}`")));
        };
        if value < min || value > max {
            return Err(ExecError::ValueOutOfRange { field: field.to_owned(), value, min, max });
        }
        let shard = pilcrow_primitives::shard_of(col, schema.def.shard_width_exp);
        let mut state = self.state.write();
        let data = state.indexes.entry(index.to_owned()).or_default();
        let fdata = data.fields.entry(field.to_owned()).or_default();
        let bsi = fdata.bsi.entry(shard).or_default();
        let changed = Arc::make_mut(bsi).set(col, value);
        if schema.def.track_existence {
            let existence = data.existence.entry(shard).or_insert_with(|| Arc::new(Row::new()));
            Arc::make_mut(existence).add(col);
        }
        drop(state);
        self.registry.note(index, shard);
        Ok(changed)
    }

    /// Clears one stored row within one shard, in every view.
    pub fn clear_row_shard(&self, index: &str, field: &str, row_id: u64, shard: u64) -> Result<bool> {
        let schema = self.schema.index(index)?;
        let fdef = schema.field(field)?;
        if fdef.is_bsi() {
            return Err(ExecError::ClearRowOnBsi(field.to_owned()));
        }
        let mut state = self.state.write();
        let Some(fdata) = state.indexes.get_mut(index).and_then(|d| d.fields.get_mut(field)) else {
            return Ok(false);
        };
        let mut changed = false;
        for vdata in fdata.views.values_mut() {
            if let Some(rows) = vdata.shards.get_mut(&shard) {
                if let Some(prev) = Arc::make_mut(rows).remove(&row_id) {
                    changed |= !prev.is_empty();
                }
            }
        }
        Ok(changed)
    }

    /// Overwrites the shard slice of a stored row with `src` (already sliced
    /// to this shard's column range by the caller).
    pub fn store_row_shard(&self, index: &str, field: &str, row_id: u64, shard: u64, src: &Row) -> Result<bool> {
        let schema = self.schema.index(index)?;
        let fdef = schema.field(field)?;
        if fdef.is_bsi() {
            return Err(ExecError::Internal(anyhow::anyhow!("Store on BSI field `{field}`")));
        }
        let mut state = self.state.write();
        let data = state.indexes.entry(index.to_owned()).or_default();
        let fdata = data.fields.entry(field.to_owned()).or_default();
        let vdata = fdata.views.entry(VIEW_STANDARD.to_owned()).or_default();
        let rows = Arc::make_mut(vdata.shards.entry(shard).or_default());
        let prev = rows.insert(row_id, Arc::new(src.clone()));
        if schema.def.track_existence && !src.is_empty() {
            let existence = data.existence.entry(shard).or_insert_with(|| Arc::new(Row::new()));
            let existence = Arc::make_mut(existence);
            for col in src.iter() {
                existence.add(col);
            }
        }
        drop(state);
        self.registry.note(index, shard);
        Ok(prev.as_deref() != Some(src))
    }

    pub fn drop_index_data(&self, index: &str) {
        self.state.write().indexes.remove(index);
        self.registry.remove_index(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{FieldDef, IndexDef};
    use chrono::TimeZone;

    fn store() -> Store {
        let schema = Arc::new(Schema::new());
        schema.create_index(IndexDef::new("i")).unwrap();
        schema.create_field("i", FieldDef::set("f")).unwrap();
        schema.create_field("i", FieldDef::mutex("m")).unwrap();
        schema.create_field("i", FieldDef::int("v", -100, 1000)).unwrap();
        schema
            .create_field("i", FieldDef::time("t", "YMD".parse().unwrap()))
            .unwrap();
        Store::new(schema, Arc::new(ShardRegistry::default()))
    }

    #[test]
    fn set_bit_is_idempotent_and_tracks_existence() {
        let s = store();
        assert!(s.set_bit("i", "f", 10, 3, None).unwrap());
        assert!(!s.set_bit("i", "f", 10, 3, None).unwrap());
        let view = s.open_view("i", 0).unwrap();
        assert_eq!(view.row("f", VIEW_STANDARD, 10).columns(), vec![3]);
        assert_eq!(view.existence().unwrap().columns(), vec![3]);
    }

    #[test]
    fn snapshot_is_stable_across_writes() {
        let s = store();
        s.set_bit("i", "f", 10, 3, None).unwrap();
        let before = s.open_view("i", 0).unwrap();
        s.set_bit("i", "f", 10, 4, None).unwrap();
        assert_eq!(before.row("f", VIEW_STANDARD, 10).columns(), vec![3]);
        let after = s.open_view("i", 0).unwrap();
        assert_eq!(after.row("f", VIEW_STANDARD, 10).columns(), vec![3, 4]);
    }

    #[test]
    fn mutex_clears_previous_row() {
        let s = store();
        s.set_bit("i", "m", 1, 5, None).unwrap();
        s.set_bit("i", "m", 2, 5, None).unwrap();
        let view = s.open_view("i", 0).unwrap();
        assert!(view.row("m", VIEW_STANDARD, 1).is_empty());
        assert_eq!(view.row("m", VIEW_STANDARD, 2).columns(), vec![5]);
    }

    #[test]
    fn value_bounds_enforced() {
        let s = store();
        assert!(s.set_value("i", "v", 1, 1000).unwrap());
        let err = s.set_value("i", "v", 1, 1001).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::OutOfRange);
    }

    #[test]
    fn time_views_written_and_listed() {
        let s = store();
        let t = Utc.with_ymd_and_hms(2017, 2, 14, 12, 0, 0).unwrap();
        s.set_bit("i", "t", 1, 9, Some(t)).unwrap();
        let view = s.open_view("i", 0).unwrap();
        let mut names = view.view_names("t");
        names.sort_unstable();
        assert_eq!(names, ["standard", "standard_2017", "standard_201702", "standard_20170214"]);
    }

    #[test]
    fn clear_row_reports_change() {
        let s = store();
        s.set_bit("i", "f", 10, 3, None).unwrap();
        s.set_bit("i", "f", 10, 4, None).unwrap();
        assert!(s.clear_row_shard("i", "f", 10, 0).unwrap());
        assert!(!s.clear_row_shard("i", "f", 10, 0).unwrap());
        let err = s.clear_row_shard("i", "v", 1, 0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PreconditionFailed);
    }

    #[test]
    fn registry_reports_touched_shards() {
        let s = store();
        assert_eq!(s.registry.shards("i"), BTreeSet::from([0]));
        s.set_bit("i", "f", 1, (1 << 20) + 7, None).unwrap();
        s.set_bit("i", "f", 1, 2, None).unwrap();
        assert_eq!(s.registry.shards("i"), BTreeSet::from([0, 1]));
    }
}
