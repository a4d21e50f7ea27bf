//! The static operator registry.
//!
//! One entry per reserved call name, populated at startup: the shard-local
//! kernel, the reducer, and the planning flags (mutating? must it be
//! pre-computed cluster-wide when nested?). Dispatch is by name lookup; no
//! reflection anywhere.

use super::kernels::{self, KernelCtx};
use super::reduce::{self, ReduceFn};
use crate::db::schema::Schema;
use crate::error::{CallError, ExecError, Result};
use crate::pql::{Arg, Call};
use indexmap::IndexMap;
use once_cell::sync::Lazy;

pub(super) type KernelFn = fn(&mut KernelCtx<'_>, &Call) -> Result<super::Partial>;

pub struct OpSpec {
    pub name: &'static str,
    /// Mutating operator; gated by `maxWritesPerRequest` and replicated.
    pub write: bool,
    /// When nested, must run cluster-wide first and be substituted as a
    /// constant by the pre-call planner.
    pub precall_global: bool,
    pub(super) kernel: KernelFn,
    pub(super) reduce: ReduceFn,
}

macro_rules! op {
    ($name:literal, $kernel:path, $reduce:path) => {
        op!($name, $kernel, $reduce, write: false, precall: false)
    };
    ($name:literal, $kernel:path, $reduce:path, write) => {
        op!($name, $kernel, $reduce, write: true, precall: false)
    };
    ($name:literal, $kernel:path, $reduce:path, precall) => {
        op!($name, $kernel, $reduce, write: false, precall: true)
    };
    ($name:literal, $kernel:path, $reduce:path, write: $w:expr, precall: $p:expr) => {
        (
            $name,
            OpSpec { name: $name, write: $w, precall_global: $p, kernel: $kernel, reduce: $reduce },
        )
    };
}

static REGISTRY: Lazy<IndexMap<&'static str, OpSpec>> = Lazy::new(|| {
    IndexMap::from([
        op!("Row", kernels::kernel_row, reduce::row_union),
        op!("Union", kernels::kernel_row, reduce::row_union),
        op!("Intersect", kernels::kernel_row, reduce::row_union),
        op!("Difference", kernels::kernel_row, reduce::row_union),
        op!("Xor", kernels::kernel_row, reduce::row_union),
        op!("Not", kernels::kernel_row, reduce::row_union),
        op!("Shift", kernels::kernel_row, reduce::row_union),
        op!("ConstRow", kernels::kernel_row, reduce::row_union),
        op!("All", kernels::kernel_row, reduce::row_union),
        op!("Limit", kernels::kernel_row, reduce::row_union),
        op!("UnionRows", kernels::kernel_union_rows, reduce::row_union),
        op!("Count", kernels::kernel_count, reduce::count_sum, precall),
        op!("IncludesColumn", kernels::kernel_includes_column, reduce::changed_or),
        op!("Set", kernels::kernel_set, reduce::changed_or, write),
        op!("Clear", kernels::kernel_clear, reduce::changed_or, write),
        op!("ClearRow", kernels::kernel_clear_row, reduce::changed_or, write),
        op!("Store", kernels::kernel_store, reduce::changed_or, write),
        op!("TopN", kernels::kernel_topn, reduce::pairs_sum, precall),
        op!("TopK", kernels::kernel_topk, reduce::pairs_sum, precall),
        op!("Min", kernels::kernel_min, reduce::valcount_min),
        op!("Max", kernels::kernel_max, reduce::valcount_max),
        op!("Sum", kernels::kernel_sum, reduce::valcount_sum),
        op!("Percentile", kernels::kernel_coordinator_only, reduce::valcount_min, precall),
        op!("MinRow", kernels::kernel_min_row, reduce::pair_min),
        op!("MaxRow", kernels::kernel_max_row, reduce::pair_max),
        op!("Rows", kernels::kernel_rows, reduce::rowids_merge),
        op!("GroupBy", kernels::kernel_groupby, reduce::groups_merge, precall),
        op!("Distinct", kernels::kernel_distinct, reduce::signed_union, precall),
        op!("Extract", kernels::kernel_extract, reduce::table_concat),
        op!("Sort", kernels::kernel_sort, reduce::colvals_concat),
        op!("ExternalLookup", kernels::kernel_coordinator_only, reduce::table_concat, precall),
        op!("Options", kernels::kernel_coordinator_only, reduce::row_union),
    ])
});

pub fn spec(name: &str) -> Result<&'static OpSpec> {
    REGISTRY
        .get(name)
        .ok_or_else(|| CallError::Unknown(name.to_owned()).into())
}

/// Static checks over the whole tree, before translation and planning.
pub fn validate(schema: &Schema, index: &str, call: &Call) -> Result<()> {
    let index_name = call.str_arg("index")?.unwrap_or(index);
    let idx = schema.index(index_name)?;
    spec(&call.name)?;

    // GroupBy and Extract consume `Rows(...)` children as dimension specs;
    // there (and only there) integer-typed fields are legal dimensions.
    if call.name == "GroupBy" || call.name == "Extract" {
        let (head, specs) = if call.name == "Extract" {
            (call.children.first(), call.children.get(1..).unwrap_or_default())
        } else {
            (None, &call.children[..])
        };
        if let Some(first) = head {
            validate(schema, index_name, first)?;
        }
        for spec in specs {
            if spec.name != "Rows" {
                return Err(CallError::BadArg {
                    call: "GroupBy",
                    arg: "dimension",
                    detail: format!("expected Rows(...), got `{}`", spec.name),
                }
                .into());
            }
            if let Some(field) = spec.str_arg("field")? {
                idx.field(field)?;
            }
        }
        for (key, arg) in &call.args {
            if key == "having" {
                continue;
            }
            if let Arg::Call(c) = arg {
                validate(schema, index_name, c)?;
            }
        }
        return Ok(());
    }

    match call.name.as_str() {
        "Intersect" if call.children.is_empty() => {
            return Err(CallError::EmptyOperands { call: "Intersect" }.into());
        }
        "Difference" if call.children.is_empty() => {
            return Err(CallError::EmptyOperands { call: "Difference" }.into());
        }
        "Not" | "All" if !idx.def.track_existence => {
            return Err(ExecError::ExistenceRequired(idx.def.name.clone()));
        }
        "Rows" => {
            if call.arg("in").is_some() {
                for other in ["previous", "column", "like"] {
                    if call.arg(other).is_some() {
                        return Err(CallError::ConflictingArgs { call: "Rows", arg: "in", other }.into());
                    }
                }
            }
            if let Some(field) = call.str_arg("field")? {
                if idx.field(field)?.is_bsi() {
                    return Err(CallError::RowsOnIntField(field.to_owned()).into());
                }
            }
        }
        "ClearRow" => {
            if let Some((field, _)) = call.field_arg() {
                if idx.field(field)?.is_bsi() {
                    return Err(ExecError::ClearRowOnBsi(field.to_owned()));
                }
            }
        }
        "Row" => {
            let (field, _) = call.field_arg().ok_or(CallError::BadArg {
                call: "Row",
                arg: "field",
                detail: "missing field argument".into(),
            })?;
            idx.field(field)?;
        }
        _ => {}
    }
    // Named fields must exist wherever a `field` argument appears.
    if let Some(field) = call.str_arg("field")? {
        if matches!(
            call.name.as_str(),
            "TopN" | "TopK" | "Min" | "Max" | "Sum" | "Percentile" | "MinRow" | "MaxRow" | "Distinct" | "Sort"
        ) {
            idx.field(field)?;
        }
    }

    for child in &call.children {
        validate(schema, index_name, child)?;
    }
    for (key, arg) in &call.args {
        // `having` wraps a pseudo-call over count/sum, not an operator.
        if call.name == "GroupBy" && key == "having" {
            continue;
        }
        if let Arg::Call(c) = arg {
            validate(schema, index_name, c)?;
        }
    }
    Ok(())
}
