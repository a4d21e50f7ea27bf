//! The pre-call planner.
//!
//! Post-order walk of the call tree. A nested call that cannot run
//! shard-local (Distinct, TopN/TopK, Percentile, nested Count/GroupBy,
//! anything aimed at another index, ExternalLookup) is evaluated as a
//! top-level query first and substituted into its parent as a constant:
//! rows become `ConstRow(columns=[...])`, counts become integer literals,
//! signed Distinct keeps its positive side for use as a filter. Failures
//! propagate through the shared cancellation signal, so sibling pre-calls
//! stop early.

use super::{registry, Executor, Partial};
use crate::error::{CallError, ExecError, Result};
use crate::execution_context::ExecutionContext;
use crate::pql::{Arg, Call, Literal};
use crate::row::Row;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Whether `child`, nested under `parent_index`, must be pre-computed.
fn needs_hoist(child: &Call, parent_index: &str) -> bool {
    if let Ok(Some(target)) = child.str_arg("index") {
        if target != parent_index {
            return true;
        }
    }
    registry::spec(&child.name).map(|s| s.precall_global).unwrap_or(false)
}

/// Rewrites `call` in place: every precall-global descendant is evaluated
/// cluster-wide and replaced by a literal of the equivalent type.
pub(super) fn rewrite<'a>(
    exec: &'a Arc<Executor>,
    ctx: &'a Arc<ExecutionContext>,
    index: &'a str,
    call: Call,
) -> BoxFuture<'a, Result<Call>> {
    Box::pin(async move {
        let mut call = call;

        let children = std::mem::take(&mut call.children);
        for (i, child) in children.into_iter().enumerate() {
            // GroupBy/Extract `Rows` children and the GroupBy aggregate are
            // specs interpreted by their own kernels, not sub-queries.
            let opaque = match call.name.as_str() {
                "GroupBy" | "UnionRows" | "Rows" => true,
                "Extract" => i > 0,
                _ => false,
            };
            if opaque {
                call.children.push(child);
            } else if needs_hoist(&child, index) {
                call.children.push(hoist_to_row(exec, ctx, index, child).await?);
            } else {
                call.children.push(rewrite(exec, ctx, index, child).await?);
            }
        }

        let keys: Vec<String> = call.args.keys().cloned().collect();
        for key in keys {
            if call.name == "GroupBy" && key == "aggregate" {
                continue;
            }
            let Some(Arg::Call(sub)) = call.args.get(&key) else {
                continue;
            };
            let sub = sub.clone();
            let replacement = if needs_hoist(&sub, index) {
                match evaluate_global(exec, ctx, index, sub).await? {
                    Partial::Row(row) => Arg::Call(Call::const_row(row.iter())),
                    // Only the positive side survives as a filter.
                    Partial::Signed { pos, .. } => Arg::Call(Call::const_row(pos.iter())),
                    Partial::Count(n) => Arg::Literal(Literal::Int(n as i64)),
                    Partial::ValCount(vc) => Arg::Literal(Literal::Int(vc.val)),
                    other => return Err(not_substitutable(&key, &other)),
                }
            } else {
                Arg::Call(rewrite(exec, ctx, index, sub).await?)
            };
            call.args.insert(key, replacement);
        }
        Ok(call)
    })
}

/// Evaluates a hoisted call as its own top-level query, against its own
/// index when it names one.
async fn evaluate_global(
    exec: &Arc<Executor>,
    ctx: &Arc<ExecutionContext>,
    parent_index: &str,
    call: Call,
) -> Result<Partial> {
    let target = call.str_arg("index")?.unwrap_or(parent_index).to_owned();
    log::debug!("pre-computing `{}` against `{target}`", call.name);
    let rewritten = rewrite(exec, ctx, &target, call).await?;
    exec.execute_rewritten(ctx, &target, &rewritten).await
}

/// Hoists a positional child, which the parent consumes as a Row.
async fn hoist_to_row(
    exec: &Arc<Executor>,
    ctx: &Arc<ExecutionContext>,
    index: &str,
    child: Call,
) -> Result<Call> {
    // A nested TopN/TopK acts as the union of its winning rows.
    let pairs_field = child.str_arg("field")?.map(str::to_owned);
    match evaluate_global(exec, ctx, index, child).await? {
        Partial::Row(row) => Ok(Call::const_row(row.iter())),
        Partial::Signed { pos, .. } => Ok(Call::const_row(pos.iter())),
        Partial::Pairs(pairs) => {
            let field = pairs_field.ok_or(CallError::BadArg {
                call: "TopN",
                arg: "field",
                detail: "required".into(),
            })?;
            let union = Call::new("Union")
                .with_children(pairs.iter().map(|p| Call::row_bit(&field, p.id)));
            match exec.execute_rewritten(ctx, index, &union).await? {
                Partial::Row(row) => Ok(Call::const_row(row.iter())),
                other => Err(not_substitutable("operand", &other)),
            }
        }
        Partial::RowIds(_) | Partial::Count(_) | Partial::Groups(_) => Err(CallError::BadArg {
            call: "operand",
            arg: "child",
            detail: "pre-computed result is not usable as a row".into(),
        }
        .into()),
        Partial::None => Ok(Call::const_row(Row::new().iter())),
        other => Err(not_substitutable("operand", &other)),
    }
}

fn not_substitutable(position: &str, partial: &Partial) -> ExecError {
    CallError::BadArg {
        call: "precall",
        arg: "result",
        detail: format!("cannot substitute {partial:?} into `{position}`"),
    }
    .into()
}
