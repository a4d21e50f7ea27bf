//! The call tree.
//!
//! A request is an index name plus a list of [`Call`]s. Calls carry
//! positional children (sub-calls) and named arguments whose values are
//! literals, conditions or further calls. The text syntax is compiled
//! elsewhere; the executor starts from this shape.

use crate::error::CallError;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use pilcrow_primitives::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Int(i64),
    Decimal(Decimal),
    Str(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    IdList(Vec<u64>),
    /// Signed list, used for GroupBy `previous` tuples that mix row IDs with
    /// BSI values.
    IntList(Vec<i64>),
    KeyList(Vec<String>),
}

/// Comparison operator in a `field OP value` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// A range predicate attached to a field-named argument, e.g.
/// `Row(foo > 20)` or `Row(10 <= foo < 60)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Cmp { op: CmpOp, value: Literal },
    /// `lo <= field < hi`: inclusive low, exclusive high, the way range
    /// conditions parse.
    Span { lo: Literal, hi: Literal },
    /// `between(a, b)`: both ends inclusive.
    Between { lo: Literal, hi: Literal },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Literal(Literal),
    Condition(Condition),
    Call(Call),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub name: String,
    pub children: Vec<Call>,
    pub args: IndexMap<String, Arg>,
}

/// Argument keys with reserved meaning; anything else names a field.
pub const RESERVED_ARGS: &[&str] = &[
    "field", "index", "from", "to", "limit", "offset", "previous", "column", "like", "in",
    "shards", "columns", "sort", "sort-desc", "having", "aggregate", "filter", "k", "n", "nth",
    "write", "query", "timestamp",
];

impl Call {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), children: Vec::new(), args: IndexMap::new() }
    }

    pub fn with_child(mut self, child: Call) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children<I: IntoIterator<Item = Call>>(mut self, children: I) -> Self {
        self.children.extend(children);
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.args.insert(key.into(), arg.into());
        self
    }

    /// `ConstRow(columns=[...])`, the substitution target of pre-calls.
    pub fn const_row<I: IntoIterator<Item = u64>>(columns: I) -> Self {
        Call::new("ConstRow").with_arg("columns", Literal::IdList(columns.into_iter().collect()))
    }

    /// `Row(field=row_id)`.
    pub fn row_bit(field: &str, row_id: u64) -> Self {
        Call::new("Row").with_arg(field, Literal::Int(row_id as i64))
    }

    pub fn arg(&self, key: &str) -> Option<&Arg> {
        self.args.get(key)
    }

    pub fn is_write(&self) -> bool {
        matches!(self.name.as_str(), "Set" | "Clear" | "ClearRow" | "Store")
            || (self.name == "ExternalLookup"
                && matches!(self.arg("write"), Some(Arg::Literal(Literal::Bool(true)))))
    }

    /// Counts mutating calls in the whole tree; the coordinator gates on it.
    pub fn count_writes(&self) -> u64 {
        let mut n = u64::from(self.is_write());
        n += self.children.iter().map(Call::count_writes).sum::<u64>();
        for arg in self.args.values() {
            if let Arg::Call(c) = arg {
                n += c.count_writes();
            }
        }
        n
    }

    /// The one argument whose key names a field, for the `Row(f=10)` /
    /// `Row(foo > 20)` shape.
    pub fn field_arg(&self) -> Option<(&str, &Arg)> {
        self.args
            .iter()
            .find(|(k, _)| !RESERVED_ARGS.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v))
    }

    fn bad_arg(&self, arg: &'static str, detail: impl Into<String>) -> CallError {
        CallError::BadArg { call: leak_name(&self.name), arg, detail: detail.into() }
    }

    pub fn u64_arg(&self, key: &'static str) -> Result<Option<u64>, CallError> {
        match self.arg(key) {
            None => Ok(None),
            Some(Arg::Literal(Literal::Int(v))) if *v >= 0 => Ok(Some(*v as u64)),
            Some(other) => Err(self.bad_arg(key, format!("expected a non-negative integer, got {other:?}"))),
        }
    }

    pub fn i64_arg(&self, key: &'static str) -> Result<Option<i64>, CallError> {
        match self.arg(key) {
            None => Ok(None),
            Some(Arg::Literal(Literal::Int(v))) => Ok(Some(*v)),
            Some(other) => Err(self.bad_arg(key, format!("expected an integer, got {other:?}"))),
        }
    }

    pub fn bool_arg(&self, key: &'static str) -> Result<Option<bool>, CallError> {
        match self.arg(key) {
            None => Ok(None),
            Some(Arg::Literal(Literal::Bool(v))) => Ok(Some(*v)),
            Some(other) => Err(self.bad_arg(key, format!("expected a bool, got {other:?}"))),
        }
    }

    pub fn str_arg(&self, key: &'static str) -> Result<Option<&str>, CallError> {
        match self.arg(key) {
            None => Ok(None),
            Some(Arg::Literal(Literal::Str(v))) => Ok(Some(v)),
            Some(other) => Err(self.bad_arg(key, format!("expected a string, got {other:?}"))),
        }
    }

    pub fn id_list_arg(&self, key: &'static str) -> Result<Option<&[u64]>, CallError> {
        match self.arg(key) {
            None => Ok(None),
            Some(Arg::Literal(Literal::IdList(v))) => Ok(Some(v)),
            Some(other) => Err(self.bad_arg(key, format!("expected an id list, got {other:?}"))),
        }
    }

    /// Accepts an RFC3339 string or a timestamp literal.
    pub fn timestamp_arg(&self, key: &'static str) -> Result<Option<DateTime<Utc>>, CallError> {
        match self.arg(key) {
            None => Ok(None),
            Some(Arg::Literal(Literal::Timestamp(t))) => Ok(Some(*t)),
            Some(Arg::Literal(Literal::Str(s))) => DateTime::parse_from_rfc3339(s)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| self.bad_arg(key, format!("bad RFC3339 timestamp: {e}"))),
            Some(other) => Err(self.bad_arg(key, format!("expected a timestamp, got {other:?}"))),
        }
    }

    pub fn call_arg(&self, key: &'static str) -> Result<Option<&Call>, CallError> {
        match self.arg(key) {
            None => Ok(None),
            Some(Arg::Call(c)) => Ok(Some(c)),
            Some(other) => Err(self.bad_arg(key, format!("expected a call, got {other:?}"))),
        }
    }

    /// Walks the tree depth-first, children and call-valued args included.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Call)) {
        f(self);
        for child in &self.children {
            child.walk(f);
        }
        for arg in self.args.values() {
            if let Arg::Call(c) = arg {
                c.walk(f);
            }
        }
    }
}

// Call names are a small closed set; interning them keeps `CallError`
// carrying `&'static str` without threading lifetimes through validation.
fn leak_name(name: &str) -> &'static str {
    use parking_lot::Mutex;
    use std::collections::HashSet;
    static NAMES: Mutex<Option<HashSet<&'static str>>> = Mutex::new(None);
    let mut guard = NAMES.lock();
    let set = guard.get_or_insert_with(HashSet::new);
    match set.get(name) {
        Some(&s) => s,
        None => {
            let s: &'static str = Box::leak(name.to_owned().into_boxed_str());
            set.insert(s);
            s
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        let mut first = true;
        for child in &self.children {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{child}")?;
        }
        for (k, v) in &self.args {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            match v {
                Arg::Literal(l) => write!(f, "{k}={l:?}")?,
                Arg::Condition(c) => write!(f, "{k} {c:?}")?,
                Arg::Call(c) => write!(f, "{k}={c}")?,
            }
        }
        write!(f, ")")
    }
}

impl From<Literal> for Arg {
    fn from(l: Literal) -> Self {
        Arg::Literal(l)
    }
}

impl From<Condition> for Arg {
    fn from(c: Condition) -> Self {
        Arg::Condition(c)
    }
}

impl From<Call> for Arg {
    fn from(c: Call) -> Self {
        Arg::Call(c)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Literal(Literal::Int(v))
    }
}

impl From<u64> for Arg {
    fn from(v: u64) -> Self {
        Arg::Literal(Literal::Int(v as i64))
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Literal(Literal::Str(v.to_owned()))
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Literal(Literal::Bool(v))
    }
}
