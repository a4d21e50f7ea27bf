//! GroupBy: shard-local group enumeration, the ordered merge, and the
//! cross-shard paging discipline.
//!
//! The shard kernel walks the cross product of its dimension enumerators as
//! an odometer, pruning on empty prefix intersections and fast-forwarding
//! past `previous`, so the full cross product is never materialized. Shards
//! emit groups in ascending tuple order; the reducer is an ordered merge
//! that sums counts and aggregates; sort/having/offset/limit run once, after
//! reduction.

use super::kernels::{eval_row, KernelCtx};
use super::{Executor, Partial};
use crate::db::schema::{FieldDef, FieldType};
use crate::error::{CallError, ExecError, Result};
use crate::pql::{Arg, Call, CmpOp, Condition, Literal};
use crate::result::{FieldRow, GroupCount};
use crate::row::Row;
use pilcrow_primitives::Decimal;
use smallvec::SmallVec;
use std::cmp::Ordering;

/// One coordinate of a group tuple: a row of a set-like dimension or one
/// value of a BSI dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DimValue {
    RowId(u64),
    Value(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimEntry {
    pub field: String,
    pub value: DimValue,
}

/// A merged (or per-shard) group. Tuples are short; keep them inline.
#[derive(Debug, Clone)]
pub struct ShardGroup {
    pub key: SmallVec<[DimEntry; 4]>,
    pub count: u64,
    pub agg: Option<i64>,
    pub decimal_agg: Option<Decimal>,
    /// Count-distinct partial: distinct value magnitudes by sign. Merged by
    /// union so the same value in two shards counts once.
    pub distinct: Option<(Row, Row)>,
}

impl ShardGroup {
    fn key_cmp(&self, other: &Self) -> Ordering {
        let a = self.key.iter().map(|e| e.value);
        let b = other.key.iter().map(|e| e.value);
        a.cmp(b)
    }

    pub fn into_group_count(self) -> GroupCount {
        let group = self
            .key
            .into_iter()
            .map(|e| match e.value {
                DimValue::RowId(id) => FieldRow { field: e.field, row_id: id, row_key: None, value: None },
                DimValue::Value(v) => FieldRow { field: e.field, row_id: 0, row_key: None, value: Some(v) },
            })
            .collect();
        GroupCount { group, count: self.count, agg: self.agg, decimal_agg: self.decimal_agg }
    }
}

enum AggSpec {
    None,
    Sum { field: String },
    CountDistinct { field: String, filter: Option<Call> },
}

fn parse_aggregate(call: &Call) -> Result<AggSpec> {
    let Some(agg) = call.call_arg("aggregate")? else {
        return Ok(AggSpec::None);
    };
    match agg.name.as_str() {
        "Sum" => {
            let field = agg
                .str_arg("field")?
                .ok_or(CallError::BadArg { call: "Sum", arg: "field", detail: "required".into() })?;
            Ok(AggSpec::Sum { field: field.to_owned() })
        }
        "Count" => {
            let distinct = agg
                .children
                .first()
                .filter(|c| c.name == "Distinct")
                .ok_or(CallError::BadArg {
                    call: "GroupBy",
                    arg: "aggregate",
                    detail: "Count aggregate requires a Distinct operand".into(),
                })?;
            let field = distinct
                .str_arg("field")?
                .ok_or(CallError::BadArg { call: "Distinct", arg: "field", detail: "required".into() })?;
            Ok(AggSpec::CountDistinct {
                field: field.to_owned(),
                filter: distinct.children.first().cloned(),
            })
        }
        other => Err(CallError::BadArg {
            call: "GroupBy",
            arg: "aggregate",
            detail: format!("unsupported aggregate `{other}`"),
        }
        .into()),
    }
}

/// Names the aggregate column in the shaped result.
pub fn aggregate_name(call: &Call) -> Option<String> {
    match call.call_arg("aggregate").ok().flatten() {
        Some(agg) if agg.name == "Sum" => Some("sum".to_owned()),
        Some(agg) if agg.name == "Count" => Some("count".to_owned()),
        _ => None,
    }
}

struct Dim {
    field: String,
    entries: Vec<(DimValue, Row)>,
}

/// Builds this shard's enumerator for one `Rows(...)` dimension.
fn build_dim(k: &mut KernelCtx<'_>, spec: &Call) -> Result<Dim> {
    if spec.name != "Rows" {
        return Err(CallError::BadArg {
            call: "GroupBy",
            arg: "dimension",
            detail: format!("expected Rows(...), got `{}`", spec.name),
        }
        .into());
    }
    let field = spec
        .str_arg("field")?
        .ok_or(CallError::BadArg { call: "Rows", arg: "field", detail: "required".into() })?
        .to_owned();
    let fdef = k.view.index.field(&field)?;
    let limit = spec.u64_arg("limit")?.map(|v| v as usize).unwrap_or(usize::MAX);
    let entries = if fdef.is_bsi() {
        bsi_dim_entries(k, &field, limit)
    } else {
        row_dim_entries(k, &field, &fdef, spec, limit)?
    };
    Ok(Dim { field, entries })
}

fn row_dim_entries(
    k: &mut KernelCtx<'_>,
    field: &str,
    fdef: &FieldDef,
    spec: &Call,
    limit: usize,
) -> Result<Vec<(DimValue, Row)>> {
    let (_, ids) = super::kernels::rows_ids(k, spec)?;
    let views = super::kernels::read_views(k.view, fdef, field, spec)?;
    let mut out = Vec::new();
    for id in ids.into_iter().take(limit) {
        let mut row = Row::new();
        for v in &views {
            row = row.union(&k.view.row(field, v, id));
        }
        if !row.is_empty() {
            out.push((DimValue::RowId(id), row));
        }
    }
    Ok(out)
}

/// BSI dimension values in ascending integer order, NULLs excluded.
fn bsi_dim_entries(k: &KernelCtx<'_>, field: &str, limit: usize) -> Vec<(DimValue, Row)> {
    let Some(bsi) = k.view.bsi(field) else {
        return Vec::new();
    };
    let (pos, neg) = bsi.distinct(None);
    let mut values: Vec<i64> = neg.iter().map(|m| -(m as i64)).collect();
    values.reverse();
    values.extend(pos.iter().map(|m| m as i64));
    values
        .into_iter()
        .take(limit)
        .map(|v| {
            let row = bsi.range(crate::bsi::Comparison::Eq(v));
            (DimValue::Value(v), row)
        })
        .collect()
}

fn parse_previous(call: &Call, dims: &[Dim]) -> Result<Option<Vec<DimValue>>> {
    let raw: Vec<i64> = match call.arg("previous") {
        None => return Ok(None),
        Some(Arg::Literal(Literal::IntList(v))) => v.clone(),
        Some(Arg::Literal(Literal::IdList(v))) => v.iter().map(|&x| x as i64).collect(),
        Some(other) => {
            return Err(CallError::BadArg {
                call: "GroupBy",
                arg: "previous",
                detail: format!("expected a tuple, got {other:?}"),
            }
            .into())
        }
    };
    if raw.len() != dims.len() {
        return Err(CallError::BadArg {
            call: "GroupBy",
            arg: "previous",
            detail: format!("tuple arity {} does not match {} dimensions", raw.len(), dims.len()),
        }
        .into());
    }
    Ok(Some(
        raw.iter()
            .zip(dims)
            .map(|(&v, d)| match d.entries.first().map(|e| e.0) {
                Some(DimValue::Value(_)) => DimValue::Value(v),
                _ => DimValue::RowId(v as u64),
            })
            .collect(),
    ))
}

/// Odometer advance at dimension `at`: increments it, resets deeper dims,
/// carries upward. Returns false when the product is exhausted.
fn advance(idx: &mut [usize], dims: &[Dim], at: usize) -> bool {
    let mut i = at;
    loop {
        idx[i] += 1;
        if idx[i] < dims[i].entries.len() {
            for slot in idx.iter_mut().skip(i + 1) {
                *slot = 0;
            }
            return true;
        }
        if i == 0 {
            return false;
        }
        i -= 1;
    }
}

/// Positions the odometer at the first tuple strictly greater than `prev`.
fn seek_past(idx: &mut [usize], dims: &[Dim], prev: &[DimValue]) -> bool {
    for i in 0..dims.len() {
        let pos = dims[i].entries.partition_point(|e| e.0 < prev[i]);
        if pos == dims[i].entries.len() {
            // Nothing >= prev here: bump an earlier dimension.
            return i > 0 && advance(idx, dims, i - 1);
        }
        idx[i] = pos;
        if dims[i].entries[pos].0 > prev[i] {
            for slot in idx.iter_mut().skip(i + 1) {
                *slot = 0;
            }
            return true;
        }
    }
    // Landed exactly on prev; previous is exclusive.
    advance(idx, dims, dims.len() - 1)
}

/// The shard-local GroupBy kernel.
pub(super) fn kernel(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    if call.children.is_empty() {
        return Err(CallError::EmptyOperands { call: "GroupBy" }.into());
    }
    let mut dims = Vec::with_capacity(call.children.len());
    for spec in &call.children.clone() {
        dims.push(build_dim(k, spec)?);
    }
    if dims.iter().any(|d| d.entries.is_empty()) {
        return Ok(Partial::Groups(Vec::new()));
    }
    let filter = match call.call_arg("filter")?.cloned() {
        Some(f) => Some(eval_row(k, &f)?),
        None => None,
    };
    let agg = parse_aggregate(call)?;
    let distinct_filter = match &agg {
        AggSpec::CountDistinct { filter: Some(f), .. } => Some(eval_row(k, &f.clone())?),
        AggSpec::CountDistinct { filter: None, .. } => None,
        _ => None,
    };
    // The streaming shortcut: with plain tuple order (no sort, no having)
    // the first offset+limit tuples per shard are enough.
    let cap = match (call.u64_arg("limit")?, call.str_arg("sort")?, call.arg("having")) {
        (Some(limit), None, None) => {
            (limit + call.u64_arg("offset")?.unwrap_or(0)) as usize
        }
        _ => usize::MAX,
    };

    let mut idx = vec![0usize; dims.len()];
    if let Some(prev) = parse_previous(call, &dims)? {
        if !seek_past(&mut idx, &dims, &prev) {
            return Ok(Partial::Groups(Vec::new()));
        }
    }

    let mut out: Vec<ShardGroup> = Vec::new();
    'product: loop {
        if out.len() >= cap {
            break;
        }
        k.ctx.check_live()?;
        // Intersect left to right, pruning the whole subtree on an empty
        // prefix.
        let mut acc: Option<Row> = filter.clone();
        for (i, dim) in dims.iter().enumerate() {
            let entry = &dim.entries[idx[i]];
            let next = match acc {
                None => entry.1.clone(),
                Some(a) => a.intersect(&entry.1),
            };
            if next.is_empty() {
                if !advance(&mut idx, &dims, i) {
                    break 'product;
                }
                continue 'product;
            }
            acc = Some(next);
        }
        let group_row = acc.expect("at least one dimension");
        let key: SmallVec<[DimEntry; 4]> = dims
            .iter()
            .zip(&idx)
            .map(|(d, &p)| DimEntry { field: d.field.clone(), value: d.entries[p].0 })
            .collect();

        match &agg {
            AggSpec::None => {
                out.push(ShardGroup {
                    key,
                    count: group_row.count(),
                    agg: None,
                    decimal_agg: None,
                    distinct: None,
                });
            }
            AggSpec::Sum { field } => {
                // With a Sum aggregate the count is the number of columns
                // that actually hold a value; empty ones drop out.
                if let Some(bsi) = k.view.bsi(field) {
                    if let Some((sum, count)) = bsi.sum(Some(&group_row)) {
                        if count > 0 {
                            out.push(ShardGroup { key, count, agg: Some(sum), decimal_agg: None, distinct: None });
                        }
                    } else {
                        return Err(ExecError::AggregateOutOfRange { field: field.clone() });
                    }
                }
            }
            AggSpec::CountDistinct { field, .. } => {
                let fdef = k.view.index.field(field)?;
                let scoped = match &distinct_filter {
                    Some(f) => group_row.intersect(f),
                    None => group_row.clone(),
                };
                let distinct = if fdef.is_bsi() {
                    k.view.bsi(field).map(|b| b.distinct(Some(&scoped)))
                } else {
                    return Err(CallError::BadArg {
                        call: "GroupBy",
                        arg: "aggregate",
                        detail: "Count(Distinct) requires an integer-typed field".into(),
                    }
                    .into());
                };
                out.push(ShardGroup {
                    key,
                    count: group_row.count(),
                    agg: None,
                    decimal_agg: None,
                    distinct: Some(distinct.unwrap_or_default()),
                });
            }
        }
        if !advance(&mut idx, &dims, dims.len() - 1) {
            break;
        }
    }
    Ok(Partial::Groups(out))
}

/// Ordered merge of two per-shard group streams; the GroupBy reducer.
pub(crate) fn merge(a: Vec<ShardGroup>, b: Vec<ShardGroup>) -> Vec<ShardGroup> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut ia, mut ib) = (a.into_iter().peekable(), b.into_iter().peekable());
    loop {
        match (ia.peek(), ib.peek()) {
            (None, None) => break,
            (Some(_), None) => out.push(ia.next().unwrap()),
            (None, Some(_)) => out.push(ib.next().unwrap()),
            (Some(ga), Some(gb)) => match ga.key_cmp(gb) {
                Ordering::Less => out.push(ia.next().unwrap()),
                Ordering::Greater => out.push(ib.next().unwrap()),
                Ordering::Equal => {
                    let mut g = ia.next().unwrap();
                    let other = ib.next().unwrap();
                    g.count += other.count;
                    g.agg = match (g.agg, other.agg) {
                        (Some(x), Some(y)) => Some(x.saturating_add(y)),
                        (x, y) => x.or(y),
                    };
                    g.distinct = match (g.distinct, other.distinct) {
                        (Some((p1, n1)), Some((p2, n2))) => Some((p1.union(&p2), n1.union(&n2))),
                        (x, y) => x.or(y),
                    };
                    out.push(g);
                }
            },
        }
    }
    out
}

fn parse_having(call: &Call) -> Result<Option<(String, Condition)>> {
    let Some(h) = call.call_arg("having")? else {
        return Ok(None);
    };
    match h.field_arg() {
        Some((subject, Arg::Condition(cond))) if subject == "count" || subject == "sum" => {
            Ok(Some((subject.to_owned(), cond.clone())))
        }
        _ => Err(CallError::BadArg {
            call: "GroupBy",
            arg: "having",
            detail: "expected Condition(count OP x) or Condition(sum OP x)".into(),
        }
        .into()),
    }
}

fn cond_holds(cond: &Condition, v: i64) -> bool {
    let as_int = |l: &Literal| match l {
        Literal::Int(x) => Some(*x),
        _ => None,
    };
    match cond {
        Condition::Cmp { op, value } => {
            let Some(x) = as_int(value) else { return false };
            match op {
                CmpOp::Eq => v == x,
                CmpOp::Neq => v != x,
                CmpOp::Lt => v < x,
                CmpOp::Lte => v <= x,
                CmpOp::Gt => v > x,
                CmpOp::Gte => v >= x,
            }
        }
        Condition::Span { lo, hi } => match (as_int(lo), as_int(hi)) {
            (Some(lo), Some(hi)) => v >= lo && v < hi,
            _ => false,
        },
        Condition::Between { lo, hi } => match (as_int(lo), as_int(hi)) {
            (Some(lo), Some(hi)) => v >= lo && v <= hi,
            _ => false,
        },
    }
}

/// Coordinator-side tail: resolve count-distinct aggregates, apply having,
/// sort, paging and decimal promotion.
pub(super) fn finalize(exec: &Executor, index: &str, call: &Call, partial: Partial) -> Result<Partial> {
    let Partial::Groups(mut groups) = partial else {
        return Ok(Partial::Groups(Vec::new()));
    };
    for g in &mut groups {
        if let Some((pos, neg)) = g.distinct.take() {
            g.agg = Some((pos.count() + neg.count()) as i64);
        }
    }
    if let Some((subject, cond)) = parse_having(call)? {
        groups.retain(|g| {
            let v = if subject == "count" { g.count as i64 } else { g.agg.unwrap_or(0) };
            cond_holds(&cond, v)
        });
    }
    match call.str_arg("sort")? {
        None => {}
        Some("count desc") => groups.sort_by(|a, b| b.count.cmp(&a.count).then(a.key_cmp(b))),
        Some("count asc") => groups.sort_by(|a, b| a.count.cmp(&b.count).then(a.key_cmp(b))),
        Some("sum desc") => groups.sort_by(|a, b| b.agg.cmp(&a.agg).then(a.key_cmp(b))),
        Some("sum asc") => groups.sort_by(|a, b| a.agg.cmp(&b.agg).then(a.key_cmp(b))),
        Some(other) => {
            return Err(CallError::BadArg {
                call: "GroupBy",
                arg: "sort",
                detail: format!("unsupported sort `{other}`"),
            }
            .into())
        }
    }
    let offset = call.u64_arg("offset")?.unwrap_or(0) as usize;
    let limit = call.u64_arg("limit")?.map(|v| v as usize).unwrap_or(usize::MAX);
    let groups: Vec<ShardGroup> = groups.into_iter().skip(offset).take(limit).collect();

    // Aggregate type promotion for decimal Sum fields.
    let scale = match call.call_arg("aggregate")? {
        Some(agg) if agg.name == "Sum" => {
            let field = agg.str_arg("field")?.unwrap_or_default();
            match exec.store().schema().index(index)?.field(field) {
                Ok(fdef) => match fdef.field_type {
                    FieldType::Decimal { scale, .. } => Some(scale),
                    _ => None,
                },
                Err(_) => None,
            }
        }
        _ => None,
    };
    let mut groups = groups;
    if let Some(scale) = scale {
        for g in &mut groups {
            if let Some(a) = g.agg {
                g.decimal_agg = Some(Decimal::new(a, scale));
            }
        }
    }
    Ok(Partial::Groups(groups))
}
