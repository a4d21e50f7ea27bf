//! Index and field definitions.
//!
//! The executor observes schema; it never mutates it. Creation/deletion here
//! exists for the schema subsystem (and tests) and enforces the same
//! uniqueness rules it would.

use crate::error::{Result, SchemaError};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use pilcrow_primitives::time::{TimeQuantum, TimeUnit};
use pilcrow_primitives::{check_shard_width_exp, Decimal, DEFAULT_SHARD_WIDTH_EXP};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;

/// Name of the all-time view of set/mutex/time fields.
pub const VIEW_STANDARD: &str = "standard";

/// Cache policy for set/mutex fields. `TopN` requires `Ranked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    #[default]
    Ranked,
    None,
}

pub const DEFAULT_CACHE_SIZE: u32 = 50_000;

/// Typed field kinds. Int, decimal and timestamp fields are BSI-backed.
#[derive(Debug, Clone)]
pub enum FieldType {
    Set {
        keys: bool,
        cache: CacheType,
        cache_size: u32,
    },
    Mutex {
        keys: bool,
        cache: CacheType,
        cache_size: u32,
    },
    Bool,
    Int {
        min: i64,
        max: i64,
    },
    Decimal {
        min: Decimal,
        max: Decimal,
        scale: i16,
    },
    Timestamp {
        unit: TimeUnit,
        epoch: DateTime<Utc>,
    },
    Time {
        keys: bool,
        quantum: TimeQuantum,
        ttl: Option<Duration>,
        no_standard_view: bool,
    },
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDef {
    /// Whether values live in a BSI fragment rather than row fragments.
    pub fn is_bsi(&self) -> bool {
        matches!(
            self.field_type,
            FieldType::Int { .. } | FieldType::Decimal { .. } | FieldType::Timestamp { .. }
        )
    }

    /// Whether rows are addressed by string keys.
    pub fn keyed(&self) -> bool {
        match self.field_type {
            FieldType::Set { keys, .. } | FieldType::Mutex { keys, .. } | FieldType::Time { keys, .. } => keys,
            _ => false,
        }
    }

    /// At most one row bit per column.
    pub fn single_valued(&self) -> bool {
        matches!(self.field_type, FieldType::Mutex { .. } | FieldType::Bool)
    }

    /// Declared value bounds for int-kinded fields, in unscaled units.
    pub fn bsi_bounds(&self) -> Option<(i64, i64)> {
        match &self.field_type {
            FieldType::Int { min, max } => Some((*min, *max)),
            FieldType::Decimal { min, max, scale } => {
                let lo = min.with_scale(*scale).ok()?.unscaled();
                let hi = max.with_scale(*scale).ok()?.unscaled();
                Some((lo, hi))
            }
            FieldType::Timestamp { unit, epoch } => Some(unit.tick_bounds(*epoch)),
            _ => None,
        }
    }

    pub fn decimal_scale(&self) -> Option<i16> {
        match self.field_type {
            FieldType::Decimal { scale, .. } => Some(scale),
            _ => None,
        }
    }

    pub fn time_quantum(&self) -> Option<&TimeQuantum> {
        match &self.field_type {
            FieldType::Time { quantum, .. } => Some(quantum),
            _ => None,
        }
    }

    pub fn ranked_cache(&self) -> Option<u32> {
        match self.field_type {
            FieldType::Set { cache: CacheType::Ranked, cache_size, .. }
            | FieldType::Mutex { cache: CacheType::Ranked, cache_size, .. } => Some(cache_size),
            _ => None,
        }
    }

    /// Whether the all-time view exists for reads without a time range.
    pub fn has_standard_view(&self) -> bool {
        match self.field_type {
            FieldType::Time { no_standard_view, .. } => !no_standard_view,
            _ => true,
        }
    }
}

/// Helpers for the common field shapes.
impl FieldDef {
    pub fn set(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Set { keys: false, cache: CacheType::Ranked, cache_size: DEFAULT_CACHE_SIZE },
        }
    }

    pub fn keyed_set(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Set { keys: true, cache: CacheType::Ranked, cache_size: DEFAULT_CACHE_SIZE },
        }
    }

    pub fn mutex(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Mutex { keys: false, cache: CacheType::Ranked, cache_size: DEFAULT_CACHE_SIZE },
        }
    }

    pub fn int(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self { name: name.into(), field_type: FieldType::Int { min, max } }
    }

    pub fn timestamp(name: impl Into<String>, unit: TimeUnit) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Timestamp { unit, epoch: Utc.timestamp_opt(0, 0).unwrap() },
        }
    }

    pub fn time(name: impl Into<String>, quantum: TimeQuantum) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Time { keys: false, quantum, ttl: None, no_standard_view: false },
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    /// Columns addressed by string keys.
    pub keys: bool,
    /// Maintain the implicit existence row; required for `Not` and `All`.
    pub track_existence: bool,
    pub shard_width_exp: u32,
}

impl IndexDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: false,
            track_existence: true,
            shard_width_exp: DEFAULT_SHARD_WIDTH_EXP,
        }
    }

    pub fn with_keys(mut self) -> Self {
        self.keys = true;
        self
    }

    pub fn without_existence(mut self) -> Self {
        self.track_existence = false;
        self
    }

    pub fn shard_width(&self) -> u64 {
        1 << self.shard_width_exp
    }
}

/// One index plus its fields, immutable once handed to the executor.
#[derive(Debug)]
pub struct IndexSchema {
    pub def: IndexDef,
    fields: FxHashMap<String, Arc<FieldDef>>,
}

impl IndexSchema {
    pub fn field(&self, name: &str) -> Result<Arc<FieldDef>> {
        self.fields
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::FieldNotFound(self.def.name.clone(), name.to_owned()).into())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

/// The process-wide schema registry.
#[derive(Default)]
pub struct Schema {
    indexes: RwLock<FxHashMap<String, Arc<IndexSchema>>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_index(&self, def: IndexDef) -> Result<()> {
        check_shard_width_exp(def.shard_width_exp).map_err(SchemaError::from)?;
        let mut indexes = self.indexes.write();
        if indexes.contains_key(&def.name) {
            return Err(SchemaError::IndexExists(def.name).into());
        }
        let name = def.name.clone();
        indexes.insert(name, Arc::new(IndexSchema { def, fields: FxHashMap::default() }));
        Ok(())
    }

    pub fn create_field(&self, index: &str, field: FieldDef) -> Result<()> {
        let mut indexes = self.indexes.write();
        let schema = indexes
            .get(index)
            .ok_or_else(|| SchemaError::IndexNotFound(index.to_owned()))?;
        if schema.fields.contains_key(&field.name) {
            return Err(SchemaError::FieldExists(index.to_owned(), field.name).into());
        }
        if let FieldType::Int { min, max } = &field.field_type {
            if min > max {
                return Err(SchemaError::NoBounds(index.to_owned(), field.name).into());
            }
        }
        let mut schema = IndexSchema {
            def: schema.def.clone(),
            fields: schema.fields.clone(),
        };
        schema.fields.insert(field.name.clone(), Arc::new(field));
        indexes.insert(index.to_owned(), Arc::new(schema));
        Ok(())
    }

    pub fn drop_index(&self, index: &str) -> Result<()> {
        if self.indexes.write().remove(index).is_none() {
            return Err(SchemaError::IndexNotFound(index.to_owned()).into());
        }
        Ok(())
    }

    pub fn index(&self, name: &str) -> Result<Arc<IndexSchema>> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::IndexNotFound(name.to_owned()).into())
    }
}
