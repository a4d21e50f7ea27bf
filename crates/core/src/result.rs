//! Result shapes.
//!
//! Every top-level call reduces to exactly one [`QueryResult`] variant; the
//! coordinator wraps them in a [`QueryResponse`] envelope with the elapsed
//! time. These types are also the unit reducers fold, so they live here
//! rather than in the executor.

use chrono::{DateTime, Utc};
use pilcrow_primitives::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A row-id (or key) with its count; the element of TopN/TopK/MinRow/MaxRow
/// results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub count: u64,
}

/// Value-with-count from Min/Max/Sum/Percentile. The raw value is always the
/// unscaled integer; decimal and timestamp fields add a typed rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValCount {
    pub val: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimal_val: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_val: Option<DateTime<Utc>>,
    pub count: u64,
}

impl ValCount {
    pub fn int(val: i64, count: u64) -> Self {
        Self { val, decimal_val: None, timestamp_val: None, count }
    }
}

/// One dimension value of a GroupBy tuple: a row of a set/mutex/time field,
/// or one distinct integer of a BSI field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRow {
    pub field: String,
    pub row_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_key: Option<String>,
    /// Set for BSI dimensions; `row_id` is unused then.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
}

/// The element of a GroupBy result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCount {
    pub group: Vec<FieldRow>,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agg: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimal_agg: Option<Decimal>,
}

/// Distinct over a signed BSI field: values split by sign, magnitudes only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignedRowResult {
    pub pos: Vec<u64>,
    pub neg: Vec<u64>,
}

/// A materialized row: sorted columns, plus keys on keyed indexes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowResult {
    pub columns: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

/// Field schema entry of an extracted table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFieldInfo {
    pub name: String,
}

/// One cell of an extracted table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExtractedValue {
    Ids(Vec<u64>),
    Keys(Vec<String>),
    Int(Option<i64>),
    Decimal(Option<Decimal>),
    Timestamp(Option<DateTime<Utc>>),
    Bool(Option<bool>),
}

/// One output row of Extract / ExternalLookup, keyed by column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedColumn {
    pub column: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub rows: Vec<ExtractedValue>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractedTable {
    pub fields: Vec<ExtractedFieldInfo>,
    pub columns: Vec<ExtractedColumn>,
}

/// `Rows(...)` output: row IDs, or row keys on keyed fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowIdentifiers {
    pub rows: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

/// TopN/TopK output with its originating field, for key translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairsField {
    pub field: String,
    pub pairs: Vec<Pair>,
}

/// GroupBy output; `aggregate` names the aggregate column when present.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupCounts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<String>,
    pub groups: Vec<GroupCount>,
}

/// The tagged union returned per top-level call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryResult {
    Row(RowResult),
    SignedRow(SignedRowResult),
    Count(u64),
    Bool(bool),
    ValCount(ValCount),
    Pairs(PairsField),
    GroupCounts(GroupCounts),
    RowIdentifiers(RowIdentifiers),
    Table(ExtractedTable),
    /// Write-only calls with nothing else to say.
    None,
}

/// Per-call envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub result: QueryResult,
    pub elapsed: Duration,
}
