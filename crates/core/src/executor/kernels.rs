//! Shard-local operator kernels.
//!
//! Each kernel runs against one shard's snapshot view and returns a typed
//! [`Partial`]. Row-valued sub-expressions are evaluated recursively by
//! [`eval_row`]; everything cross-shard (ordering, paging, merging) belongs
//! to the reducers and the coordinator, not here.

use super::{registry, Executor, Partial};
use crate::bsi::{Bsi, Comparison};
use crate::db::schema::{FieldDef, FieldType, VIEW_STANDARD};
use crate::db::ShardView;
use crate::error::{CallError, ExecError, Result};
use crate::execution_context::ExecutionContext;
use crate::pql::{Arg, Call, CmpOp, Condition, Literal};
use crate::result::{ExtractedColumn, ExtractedValue, Pair, ValCount};
use crate::row::Row;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use pilcrow_primitives::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct KernelCtx<'a> {
    pub exec: &'a Executor,
    pub ctx: &'a ExecutionContext,
    pub index: &'a str,
    pub view: &'a ShardView,
}

/// Dispatches one call against one shard.
pub(crate) fn execute_call_shard(
    exec: &Arc<Executor>,
    ctx: &Arc<ExecutionContext>,
    index: &str,
    call: &Call,
    shard: u64,
) -> Result<Partial> {
    ctx.check_live()?;
    let view = ctx.view(exec.store(), index, shard)?;
    let spec = registry::spec(&call.name)?;
    let mut k = KernelCtx { exec: exec.as_ref(), ctx: ctx.as_ref(), index, view: view.as_ref() };
    (spec.kernel)(&mut k, call)
}

fn operand_err(call: &Call) -> ExecError {
    CallError::BadArg {
        call: "operand",
        arg: "child",
        detail: format!("`{}` does not produce a row here", call.name),
    }
    .into()
}

/// Evaluates a row-producing sub-expression on this shard.
pub fn eval_row(k: &mut KernelCtx<'_>, call: &Call) -> Result<Row> {
    k.ctx.check_live()?;
    match call.name.as_str() {
        "Row" => row_kernel_inner(k, call),
        "Union" => {
            let mut acc = Row::new();
            for c in &call.children {
                acc = acc.union(&eval_row(k, c)?);
            }
            Ok(acc)
        }
        "Intersect" => {
            let mut rows = call.children.iter();
            let first = rows.next().ok_or(CallError::EmptyOperands { call: "Intersect" })?;
            let mut acc = eval_row(k, first)?;
            for c in rows {
                acc = acc.intersect(&eval_row(k, c)?);
            }
            Ok(acc)
        }
        "Difference" => {
            let mut rows = call.children.iter();
            let first = rows.next().ok_or(CallError::EmptyOperands { call: "Difference" })?;
            let mut acc = eval_row(k, first)?;
            for c in rows {
                acc = acc.difference(&eval_row(k, c)?);
            }
            Ok(acc)
        }
        "Xor" => {
            let mut acc = Row::new();
            for c in &call.children {
                acc = acc.xor(&eval_row(k, c)?);
            }
            Ok(acc)
        }
        "Not" => {
            let child = call.children.first().ok_or(CallError::EmptyOperands { call: "Not" })?;
            let existence = existence_row(k)?;
            Ok(existence.difference(&eval_row(k, child)?))
        }
        "Shift" => {
            let child = call.children.first().ok_or(CallError::EmptyOperands { call: "Shift" })?;
            let n = call.u64_arg("n")?.unwrap_or(1);
            let (_, hi) = k.view.col_range();
            // Carries past the shard's upper edge are dropped; cross-shard
            // shift behavior is implementation-defined.
            Ok(eval_row(k, child)?.shifted(n, hi))
        }
        "ConstRow" => {
            let cols = call.id_list_arg("columns")?.unwrap_or_default();
            let (lo, hi) = k.view.col_range();
            Ok(Row::from_columns(cols.iter().copied().filter(|&c| c >= lo && c < hi)))
        }
        "All" => existence_row(k),
        "Limit" => {
            // Paging over the merged row happens at the coordinator; the
            // shard just contributes its slice.
            let child = call.children.first().ok_or(CallError::EmptyOperands { call: "Limit" })?;
            eval_row(k, child)
        }
        "UnionRows" => {
            let child = call.children.first().ok_or(CallError::EmptyOperands { call: "UnionRows" })?;
            if child.name != "Rows" {
                return Err(operand_err(child));
            }
            let (field, ids) = rows_ids(k, child)?;
            let fdef = k.view.index.field(&field)?;
            let views = read_views(k.view, &fdef, &field, child)?;
            let mut acc = Row::new();
            for id in ids {
                acc = acc.union(&view_row(k.view, &field, &views, id));
            }
            Ok(acc)
        }
        _ => Err(operand_err(call)),
    }
}

fn existence_row(k: &KernelCtx<'_>) -> Result<Row> {
    if !k.view.index.def.track_existence {
        return Err(ExecError::ExistenceRequired(k.view.index.def.name.clone()));
    }
    Ok(k.view.existence().cloned().unwrap_or_default())
}

/// The views a read of `field` consults: time-ranged reads take the minimal
/// bucket cover, un-ranged reads take the standard view, or every retained
/// bucket when the field keeps no standard view.
pub(super) fn read_views(view: &ShardView, fdef: &FieldDef, field: &str, call: &Call) -> Result<Vec<String>> {
    let from = call.timestamp_arg("from")?;
    let to = call.timestamp_arg("to")?;
    let Some(quantum) = fdef.time_quantum() else {
        return Ok(vec![VIEW_STANDARD.to_owned()]);
    };
    if from.is_none() && to.is_none() {
        if fdef.has_standard_view() {
            return Ok(vec![VIEW_STANDARD.to_owned()]);
        }
        // No standard view: the retained buckets are the readable range.
        return Ok(view
            .view_names(field)
            .into_iter()
            .filter(|v| *v != VIEW_STANDARD)
            .map(str::to_owned)
            .collect());
    }
    let from = from.unwrap_or_else(pilcrow_primitives::time::min_timestamp);
    let to = to.unwrap_or_else(pilcrow_primitives::time::max_timestamp);
    Ok(quantum
        .views_for_range(from, to)
        .into_iter()
        .map(|suffix| format!("{VIEW_STANDARD}_{suffix}"))
        .collect())
}

fn view_row(view: &ShardView, field: &str, views: &[String], row_id: u64) -> Row {
    let mut acc = Row::new();
    for v in views {
        acc = acc.union(&view.row(field, v, row_id));
    }
    acc
}

fn row_kernel_inner(k: &mut KernelCtx<'_>, call: &Call) -> Result<Row> {
    let (fname, arg) = call
        .field_arg()
        .ok_or(CallError::BadArg { call: "Row", arg: "field", detail: "missing field argument".into() })?;
    let fname = fname.to_owned();
    let fdef = k.view.index.field(&fname)?;
    match (&fdef.field_type, arg.clone()) {
        (FieldType::Int { .. } | FieldType::Decimal { .. } | FieldType::Timestamp { .. }, arg) => {
            let cond = match arg {
                Arg::Condition(c) => c,
                Arg::Literal(l) => Condition::Cmp { op: CmpOp::Eq, value: l },
                Arg::Call(_) => {
                    return Err(CallError::BadArg {
                        call: "Row",
                        arg: "condition",
                        detail: "expected a comparison".into(),
                    }
                    .into())
                }
            };
            bsi_condition_row(k, &fname, &fdef, &cond)
        }
        (FieldType::Bool, Arg::Literal(Literal::Bool(b))) => {
            Ok(k.view.row(&fname, VIEW_STANDARD, b as u64))
        }
        (_, Arg::Literal(Literal::Int(id))) => {
            if id < 0 {
                // Unknown-key sentinel: matches nothing.
                return Ok(Row::new());
            }
            let views = read_views(k.view, &fdef, &fname, call)?;
            Ok(view_row(k.view, &fname, &views, id as u64))
        }
        (_, other) => Err(CallError::BadArg {
            call: "Row",
            arg: "row",
            detail: format!("unsupported row argument {other:?} for field `{fname}`"),
        }
        .into()),
    }
}

/// Converts a literal to the field's unscaled integer domain.
fn convert_value(field: &str, fdef: &FieldDef, lit: &Literal) -> Result<i64> {
    match (&fdef.field_type, lit) {
        (FieldType::Int { .. }, Literal::Int(v)) => Ok(*v),
        (FieldType::Decimal { scale, .. }, Literal::Int(v)) => Decimal::new(*v, 0)
            .with_scale(*scale)
            .map(|d| d.unscaled())
            .map_err(|_| ExecError::DecimalOutOfRange { field: field.to_owned() }),
        (FieldType::Decimal { scale, .. }, Literal::Decimal(d)) => d
            .with_scale(*scale)
            .map(|d| d.unscaled())
            .map_err(|_| ExecError::DecimalOutOfRange { field: field.to_owned() }),
        (FieldType::Timestamp { .. }, Literal::Int(v)) => Ok(*v),
        (FieldType::Timestamp { unit, epoch }, Literal::Timestamp(t)) => unit
            .ticks(*t, *epoch)
            .map_err(|_| ExecError::TimestampOutOfRange { field: field.to_owned() }),
        (FieldType::Timestamp { unit, epoch }, Literal::Str(s)) => {
            let t = DateTime::parse_from_rfc3339(s)
                .map_err(|e| CallError::BadArg { call: "Row", arg: "value", detail: format!("bad RFC3339: {e}") })?
                .with_timezone(&Utc);
            unit.ticks(t, *epoch)
                .map_err(|_| ExecError::TimestampOutOfRange { field: field.to_owned() })
        }
        (_, other) => Err(CallError::BadArg {
            call: "Row",
            arg: "value",
            detail: format!("cannot compare field `{field}` with {other:?}"),
        }
        .into()),
    }
}

fn bsi_condition_row(k: &mut KernelCtx<'_>, field: &str, fdef: &FieldDef, cond: &Condition) -> Result<Row> {
    // Null predicates address the existence plane.
    if let Condition::Cmp { op, value: Literal::Null } = cond {
        let exists = k.view.bsi(field).map(|b| b.exists_row().clone()).unwrap_or_default();
        return match op {
            CmpOp::Neq => Ok(exists),
            CmpOp::Eq => {
                if !k.view.index.def.track_existence {
                    return Err(ExecError::ExistenceRequired(k.view.index.def.name.clone()));
                }
                Ok(k.view.existence().cloned().unwrap_or_default().difference(&exists))
            }
            _ => Err(CallError::BadArg {
                call: "Row",
                arg: "condition",
                detail: "null only supports == and !=".into(),
            }
            .into()),
        };
    }
    let Some(bsi) = k.view.bsi(field) else {
        return Ok(Row::new());
    };
    let cmp = match cond {
        Condition::Cmp { op, value } => {
            let v = convert_value(field, fdef, value)?;
            match op {
                CmpOp::Eq => Comparison::Eq(v),
                CmpOp::Neq => Comparison::Neq(v),
                CmpOp::Lt => Comparison::Lt(v),
                CmpOp::Lte => Comparison::Lte(v),
                CmpOp::Gt => Comparison::Gt(v),
                CmpOp::Gte => Comparison::Gte(v),
            }
        }
        Condition::Span { lo, hi } => {
            let lo = convert_value(field, fdef, lo)?;
            let hi = convert_value(field, fdef, hi)?;
            match hi.checked_sub(1) {
                Some(hi) => Comparison::Between(lo, hi),
                None => return Ok(Row::new()),
            }
        }
        Condition::Between { lo, hi } => {
            Comparison::Between(convert_value(field, fdef, lo)?, convert_value(field, fdef, hi)?)
        }
    };
    Ok(bsi.range(cmp))
}

// ---------------------------------------------------------------------------
// Registry kernels.

pub(super) fn kernel_row(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    eval_row(k, call).map(Partial::Row)
}

pub(super) fn kernel_count(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let child = call.children.first().ok_or(CallError::EmptyOperands { call: "Count" })?;
    Ok(Partial::Count(eval_row(k, child)?.count()))
}

pub(super) fn kernel_includes_column(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let col = call
        .u64_arg("column")?
        .ok_or(CallError::BadArg { call: "IncludesColumn", arg: "column", detail: "required".into() })?;
    let child = call
        .children
        .first()
        .ok_or(CallError::EmptyOperands { call: "IncludesColumn" })?;
    Ok(Partial::Changed(eval_row(k, child)?.contains(col)))
}

fn write_field_arg(call: &Call) -> Result<(String, Literal)> {
    match call.field_arg() {
        Some((f, Arg::Literal(l))) => Ok((f.to_owned(), l.clone())),
        _ => Err(CallError::BadArg {
            call: "Set",
            arg: "field",
            detail: "expected field=<row or value>".into(),
        }
        .into()),
    }
}

pub(super) fn kernel_set(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let col = call
        .u64_arg("column")?
        .ok_or(CallError::BadArg { call: "Set", arg: "column", detail: "required".into() })?;
    let (field, lit) = write_field_arg(call)?;
    let fdef = k.view.index.field(&field)?;
    let changed = if fdef.is_bsi() {
        let value = convert_value(&field, &fdef, &lit)?;
        k.exec.store().set_value(k.index, &field, col, value)?
    } else {
        let row_id = write_row_id(&field, &fdef, &lit)?;
        let time = call.timestamp_arg("timestamp")?;
        k.exec.store().set_bit(k.index, &field, row_id, col, time)?
    };
    Ok(Partial::Changed(changed))
}

pub(super) fn kernel_clear(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let col = call
        .u64_arg("column")?
        .ok_or(CallError::BadArg { call: "Clear", arg: "column", detail: "required".into() })?;
    let (field, lit) = write_field_arg(call)?;
    let fdef = k.view.index.field(&field)?;
    let row_id = if fdef.is_bsi() { 0 } else { write_row_id(&field, &fdef, &lit)? };
    Ok(Partial::Changed(k.exec.store().clear_bit(k.index, &field, row_id, col)?))
}

fn write_row_id(field: &str, fdef: &FieldDef, lit: &Literal) -> Result<u64> {
    match (&fdef.field_type, lit) {
        (FieldType::Bool, Literal::Bool(b)) => Ok(*b as u64),
        (_, Literal::Int(id)) if *id >= 0 => Ok(*id as u64),
        (_, other) => Err(CallError::BadArg {
            call: "Set",
            arg: "row",
            detail: format!("bad row for field `{field}`: {other:?}"),
        }
        .into()),
    }
}

pub(super) fn kernel_clear_row(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let (field, lit) = write_field_arg(call)?;
    let fdef = k.view.index.field(&field)?;
    if fdef.is_bsi() {
        return Err(ExecError::ClearRowOnBsi(field));
    }
    let row_id = write_row_id(&field, &fdef, &lit)?;
    let changed = k.exec.store().clear_row_shard(k.index, &field, row_id, k.view.shard)?;
    Ok(Partial::Changed(changed))
}

pub(super) fn kernel_store(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let src = call.children.first().ok_or(CallError::EmptyOperands { call: "Store" })?;
    let (field, lit) = write_field_arg(call)?;
    let fdef = k.view.index.field(&field)?;
    if fdef.is_bsi() {
        return Err(CallError::BadArg {
            call: "Store",
            arg: "field",
            detail: "integer-typed fields cannot be stored to".into(),
        }
        .into());
    }
    let row_id = write_row_id(&field, &fdef, &lit)?;
    let row = eval_row(k, src)?;
    let (lo, hi) = k.view.col_range();
    let sliced = row.slice_range(lo, hi);
    let changed = k
        .exec
        .store()
        .store_row_shard(k.index, &field, row_id, k.view.shard, &sliced)?;
    Ok(Partial::Changed(changed))
}

pub(super) fn kernel_topn(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let field = call
        .str_arg("field")?
        .ok_or(CallError::BadArg { call: "TopN", arg: "field", detail: "required".into() })?
        .to_owned();
    let fdef = k.view.index.field(&field)?;
    let Some(cache_size) = fdef.ranked_cache() else {
        return Err(ExecError::CacheNone(field));
    };
    let src = match call.children.first() {
        Some(c) => Some(eval_row(k, c)?),
        None => None,
    };
    let mut pairs = Vec::new();
    for (id, count) in k.view.top_rows(&field, cache_size) {
        let count = match &src {
            Some(src) => k.view.row(&field, VIEW_STANDARD, id).intersect(src).count(),
            None => count,
        };
        if count > 0 {
            pairs.push(Pair { id, key: None, count });
        }
    }
    Ok(Partial::Pairs(pairs))
}

pub(super) fn kernel_topk(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let field = call
        .str_arg("field")?
        .ok_or(CallError::BadArg { call: "TopK", arg: "field", detail: "required".into() })?
        .to_owned();
    let fdef = k.view.index.field(&field)?;
    let views = read_views(k.view, &fdef, &field, call)?;
    let src = match call.children.first() {
        Some(c) => Some(eval_row(k, c)?),
        None => None,
    };
    let mut ids = BTreeSet::new();
    for v in &views {
        if let Some(rows) = k.view.rows(&field, v) {
            ids.extend(rows.keys().copied());
        }
    }
    let mut pairs = Vec::new();
    for id in ids {
        let row = view_row(k.view, &field, &views, id);
        let count = match &src {
            Some(src) => row.intersect(src).count(),
            None => row.count(),
        };
        if count > 0 {
            pairs.push(Pair { id, key: None, count });
        }
    }
    Ok(Partial::Pairs(pairs))
}

fn bsi_of<'v>(k: &'v KernelCtx<'_>, field: &str) -> Option<&'v Bsi> {
    k.view.bsi(field)
}

fn agg_args(k: &mut KernelCtx<'_>, call: &Call) -> Result<(String, Option<Row>)> {
    let field = call
        .str_arg("field")?
        .ok_or(CallError::BadArg { call: "Sum", arg: "field", detail: "required".into() })?
        .to_owned();
    let filter = match call.children.first() {
        Some(c) => Some(eval_row(k, c)?),
        None => None,
    };
    Ok((field, filter))
}

pub(super) fn kernel_min(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let (field, filter) = agg_args(k, call)?;
    let out = bsi_of(k, &field)
        .and_then(|b| b.min(filter.as_ref()))
        .map(|(val, count)| ValCount::int(val, count))
        .unwrap_or(ValCount::int(0, 0));
    Ok(Partial::ValCount(out))
}

pub(super) fn kernel_max(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let (field, filter) = agg_args(k, call)?;
    let out = bsi_of(k, &field)
        .and_then(|b| b.max(filter.as_ref()))
        .map(|(val, count)| ValCount::int(val, count))
        .unwrap_or(ValCount::int(0, 0));
    Ok(Partial::ValCount(out))
}

pub(super) fn kernel_sum(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let (field, filter) = agg_args(k, call)?;
    match bsi_of(k, &field) {
        None => Ok(Partial::ValCount(ValCount::int(0, 0))),
        Some(b) => match b.sum(filter.as_ref()) {
            Some((val, count)) => Ok(Partial::ValCount(ValCount::int(val, count))),
            None => Err(ExecError::AggregateOutOfRange { field }),
        },
    }
}

pub(super) fn kernel_min_row(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    extreme_row(k, call, true)
}

pub(super) fn kernel_max_row(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    extreme_row(k, call, false)
}

fn extreme_row(k: &mut KernelCtx<'_>, call: &Call, min: bool) -> Result<Partial> {
    let field = call
        .str_arg("field")?
        .ok_or(CallError::BadArg { call: "MinRow", arg: "field", detail: "required".into() })?;
    let Some(rows) = k.view.rows(field, VIEW_STANDARD) else {
        return Ok(Partial::Pairs(vec![]));
    };
    let found = if min {
        rows.iter().find(|(_, r)| !r.is_empty())
    } else {
        rows.iter().rev().find(|(_, r)| !r.is_empty())
    };
    Ok(Partial::Pairs(
        found
            .map(|(&id, r)| vec![Pair { id, key: None, count: r.count() }])
            .unwrap_or_default(),
    ))
}

/// Enumerates the row IDs `Rows(...)` selects on this shard, ascending.
pub(super) fn rows_ids(k: &mut KernelCtx<'_>, call: &Call) -> Result<(String, Vec<u64>)> {
    let field = call
        .str_arg("field")?
        .ok_or(CallError::BadArg { call: "Rows", arg: "field", detail: "required".into() })?
        .to_owned();
    let fdef = k.view.index.field(&field)?;
    if fdef.is_bsi() {
        return Err(CallError::RowsOnIntField(field).into());
    }
    let views = read_views(k.view, &fdef, &field, call)?;
    let previous = call.u64_arg("previous")?;
    let column = call.u64_arg("column")?;
    let in_list: Option<BTreeSet<u64>> = call.id_list_arg("in")?.map(|l| l.iter().copied().collect());
    let limit = call.u64_arg("limit")?.map(|v| v as usize).unwrap_or(usize::MAX);

    let mut ids = BTreeSet::new();
    for v in &views {
        if let Some(rows) = k.view.rows(&field, v) {
            for (&id, row) in rows.iter() {
                if row.is_empty() {
                    continue;
                }
                if let Some(prev) = previous {
                    if id <= prev {
                        continue;
                    }
                }
                if let Some(col) = column {
                    if !row.contains(col) {
                        continue;
                    }
                }
                if let Some(list) = &in_list {
                    if !list.contains(&id) {
                        continue;
                    }
                }
                ids.insert(id);
            }
        }
    }
    Ok((field, ids.into_iter().take(limit).collect()))
}

pub(super) fn kernel_rows(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let (_, ids) = rows_ids(k, call)?;
    Ok(Partial::RowIds(ids))
}

pub(super) fn kernel_distinct(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let field = call
        .str_arg("field")?
        .ok_or(CallError::BadArg { call: "Distinct", arg: "field", detail: "required".into() })?
        .to_owned();
    let fdef = k.view.index.field(&field)?;
    let filter = match call.children.first() {
        Some(c) => Some(eval_row(k, c)?),
        None => None,
    };
    if fdef.is_bsi() {
        let Some(bsi) = k.view.bsi(&field) else {
            return Ok(Partial::Signed { pos: Row::new(), neg: Row::new() });
        };
        let (pos, neg) = bsi.distinct(filter.as_ref());
        return Ok(Partial::Signed { pos, neg });
    }
    // Set/mutex/time: the distinct row IDs with any bit under the filter.
    let views = read_views(k.view, &fdef, &field, call)?;
    let mut ids = Row::new();
    for v in &views {
        if let Some(rows) = k.view.rows(&field, v) {
            for (&id, row) in rows.iter() {
                let present = match &filter {
                    Some(f) => !row.intersect(f).is_empty(),
                    None => !row.is_empty(),
                };
                if present {
                    ids.add(id);
                }
            }
        }
    }
    Ok(Partial::Row(ids))
}

pub(super) fn kernel_extract(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let src = call.children.first().ok_or(CallError::EmptyOperands { call: "Extract" })?;
    let cols = eval_row(k, src)?;
    let mut fields = Vec::new();
    for spec in call.children.iter().skip(1) {
        if spec.name != "Rows" {
            return Err(operand_err(spec));
        }
        let field = spec
            .str_arg("field")?
            .ok_or(CallError::BadArg { call: "Extract", arg: "field", detail: "required".into() })?
            .to_owned();
        let fdef = k.view.index.field(&field)?;
        let views = read_views(k.view, &fdef, &field, spec)?;
        fields.push((field, fdef, views));
    }

    let mut out = Vec::new();
    for col in cols.iter() {
        let mut rows = Vec::with_capacity(fields.len());
        let mut cell_bytes = 24u64;
        for (field, fdef, views) in &fields {
            let value = match &fdef.field_type {
                FieldType::Int { .. } => ExtractedValue::Int(k.view.bsi(field).and_then(|b| b.get(col))),
                FieldType::Decimal { scale, .. } => ExtractedValue::Decimal(
                    k.view.bsi(field).and_then(|b| b.get(col)).map(|v| Decimal::new(v, *scale)),
                ),
                FieldType::Timestamp { unit, epoch } => ExtractedValue::Timestamp(
                    match k.view.bsi(field).and_then(|b| b.get(col)) {
                        Some(v) => Some(unit.from_ticks(v, *epoch)?),
                        None => None,
                    },
                ),
                FieldType::Bool => {
                    let t = k.view.row(field, VIEW_STANDARD, 1).contains(col);
                    let f = k.view.row(field, VIEW_STANDARD, 0).contains(col);
                    ExtractedValue::Bool(if t || f { Some(t) } else { None })
                }
                _ => {
                    let ids: Vec<u64> = views
                        .iter()
                        .filter_map(|v| k.view.rows(field, v))
                        .flat_map(|rows| rows.iter())
                        .filter(|(_, row)| row.contains(col))
                        .map(|(&id, _)| id)
                        .sorted_unstable()
                        .dedup()
                        .collect();
                    cell_bytes += 8 * ids.len() as u64;
                    ExtractedValue::Ids(ids)
                }
            };
            rows.push(value);
        }
        k.ctx.reserve_memory(cell_bytes)?;
        out.push(ExtractedColumn { column: col, key: None, rows });
    }
    Ok(Partial::Table(out))
}

pub(super) fn kernel_sort(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    let src = call.children.first().ok_or(CallError::EmptyOperands { call: "Sort" })?;
    let field = call
        .str_arg("field")?
        .ok_or(CallError::BadArg { call: "Sort", arg: "field", detail: "required".into() })?
        .to_owned();
    let cols = eval_row(k, src)?;
    let Some(bsi) = k.view.bsi(&field) else {
        return Ok(Partial::ColVals(Vec::new()));
    };
    let mut pairs = Vec::new();
    for col in cols.iter() {
        if let Some(v) = bsi.get(col) {
            pairs.push((col, v));
        }
    }
    k.ctx.reserve_memory(16 * pairs.len() as u64)?;
    Ok(Partial::ColVals(pairs))
}

pub(super) fn kernel_union_rows(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    eval_row(k, call).map(Partial::Row)
}

pub(super) fn kernel_groupby(k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    super::groupby::kernel(k, call)
}

/// Placeholder for operators the coordinator intercepts before fan-out.
pub(super) fn kernel_coordinator_only(_k: &mut KernelCtx<'_>, call: &Call) -> Result<Partial> {
    Err(ExecError::Internal(anyhow::anyhow!(
        "`{}` must be evaluated by the coordinator",
        call.name
    )))
}
