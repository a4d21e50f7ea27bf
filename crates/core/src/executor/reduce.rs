//! Reducers: the commutative/associative merge half of every operator.
//!
//! Partials arrive in no particular order, so everything here must be
//! insensitive to it; ordered output (TopN ranking, GroupBy tuple order,
//! Rows ascending) is restored by merge or by the coordinator's finalize.

use super::{groupby, Partial};
use crate::error::{ExecError, Result};
use crate::result::Pair;
use rustc_hash::FxHashMap;

pub(super) type ReduceFn = fn(Partial, Partial) -> Result<Partial>;

fn mismatch(op: &str, a: &Partial, b: &Partial) -> ExecError {
    ExecError::Internal(anyhow::anyhow!("{op} reducer got mismatched partials: {a:?} / {b:?}"))
}

pub(super) fn row_union(a: Partial, b: Partial) -> Result<Partial> {
    match (a, b) {
        (Partial::Row(x), Partial::Row(y)) => Ok(Partial::Row(x.union(&y))),
        (Partial::None, other) | (other, Partial::None) => Ok(other),
        (a, b) => Err(mismatch("row", &a, &b)),
    }
}

pub(super) fn signed_union(a: Partial, b: Partial) -> Result<Partial> {
    match (a, b) {
        (Partial::Signed { pos: p1, neg: n1 }, Partial::Signed { pos: p2, neg: n2 }) => {
            Ok(Partial::Signed { pos: p1.union(&p2), neg: n1.union(&n2) })
        }
        // Distinct over set/mutex fields reduces by plain union.
        (Partial::Row(x), Partial::Row(y)) => Ok(Partial::Row(x.union(&y))),
        (Partial::None, other) | (other, Partial::None) => Ok(other),
        (a, b) => Err(mismatch("distinct", &a, &b)),
    }
}

pub(super) fn count_sum(a: Partial, b: Partial) -> Result<Partial> {
    match (a, b) {
        (Partial::Count(x), Partial::Count(y)) => Ok(Partial::Count(x + y)),
        (Partial::None, other) | (other, Partial::None) => Ok(other),
        (a, b) => Err(mismatch("count", &a, &b)),
    }
}

pub(super) fn changed_or(a: Partial, b: Partial) -> Result<Partial> {
    match (a, b) {
        (Partial::Changed(x), Partial::Changed(y)) => Ok(Partial::Changed(x || y)),
        (Partial::None, other) | (other, Partial::None) => Ok(other),
        (a, b) => Err(mismatch("bool", &a, &b)),
    }
}

/// Sums counts per row id; ranking happens in finalize.
pub(super) fn pairs_sum(a: Partial, b: Partial) -> Result<Partial> {
    match (a, b) {
        (Partial::Pairs(x), Partial::Pairs(y)) => {
            let mut by_id: FxHashMap<u64, u64> = FxHashMap::default();
            for p in x.into_iter().chain(y) {
                *by_id.entry(p.id).or_default() += p.count;
            }
            let mut pairs: Vec<Pair> = by_id
                .into_iter()
                .map(|(id, count)| Pair { id, key: None, count })
                .collect();
            pairs.sort_by_key(|p| p.id);
            Ok(Partial::Pairs(pairs))
        }
        (Partial::None, other) | (other, Partial::None) => Ok(other),
        (a, b) => Err(mismatch("pairs", &a, &b)),
    }
}

fn extreme_pair(a: Partial, b: Partial, min: bool) -> Result<Partial> {
    match (a, b) {
        (Partial::Pairs(mut x), Partial::Pairs(mut y)) => {
            x.append(&mut y);
            let best = x
                .iter()
                .map(|p| p.id)
                .reduce(|p, q| if min { p.min(q) } else { p.max(q) });
            let out = best.map(|id| {
                let count = x.iter().filter(|p| p.id == id).map(|p| p.count).sum();
                vec![Pair { id, key: None, count }]
            });
            Ok(Partial::Pairs(out.unwrap_or_default()))
        }
        (Partial::None, other) | (other, Partial::None) => Ok(other),
        (a, b) => Err(mismatch("pair", &a, &b)),
    }
}

pub(super) fn pair_min(a: Partial, b: Partial) -> Result<Partial> {
    extreme_pair(a, b, true)
}

pub(super) fn pair_max(a: Partial, b: Partial) -> Result<Partial> {
    extreme_pair(a, b, false)
}

fn valcount(a: Partial, b: Partial, pick: impl Fn(i64, i64) -> std::cmp::Ordering) -> Result<Partial> {
    match (a, b) {
        (Partial::ValCount(x), Partial::ValCount(y)) => {
            if x.count == 0 {
                return Ok(Partial::ValCount(y));
            }
            if y.count == 0 {
                return Ok(Partial::ValCount(x));
            }
            Ok(Partial::ValCount(match pick(x.val, y.val) {
                std::cmp::Ordering::Less => x,
                std::cmp::Ordering::Greater => y,
                std::cmp::Ordering::Equal => {
                    let mut m = x;
                    m.count += y.count;
                    m
                }
            }))
        }
        (Partial::None, other) | (other, Partial::None) => Ok(other),
        (a, b) => Err(mismatch("valcount", &a, &b)),
    }
}

pub(super) fn valcount_min(a: Partial, b: Partial) -> Result<Partial> {
    valcount(a, b, |x, y| x.cmp(&y))
}

pub(super) fn valcount_max(a: Partial, b: Partial) -> Result<Partial> {
    valcount(a, b, |x, y| y.cmp(&x))
}

pub(super) fn valcount_sum(a: Partial, b: Partial) -> Result<Partial> {
    match (a, b) {
        (Partial::ValCount(x), Partial::ValCount(y)) => {
            let val = x
                .val
                .checked_add(y.val)
                .ok_or_else(|| ExecError::AggregateOutOfRange { field: String::new() })?;
            let mut m = x;
            m.val = val;
            m.count += y.count;
            Ok(Partial::ValCount(m))
        }
        (Partial::None, other) | (other, Partial::None) => Ok(other),
        (a, b) => Err(mismatch("sum", &a, &b)),
    }
}

/// Sorted merge with dedup; inputs are ascending per shard.
pub(super) fn rowids_merge(a: Partial, b: Partial) -> Result<Partial> {
    match (a, b) {
        (Partial::RowIds(x), Partial::RowIds(y)) => {
            let mut out = Vec::with_capacity(x.len() + y.len());
            let (mut ix, mut iy) = (x.into_iter().peekable(), y.into_iter().peekable());
            loop {
                match (ix.peek(), iy.peek()) {
                    (None, None) => break,
                    (Some(_), None) => out.push(ix.next().unwrap()),
                    (None, Some(_)) => out.push(iy.next().unwrap()),
                    (Some(&p), Some(&q)) => {
                        if p < q {
                            out.push(ix.next().unwrap());
                        } else if q < p {
                            out.push(iy.next().unwrap());
                        } else {
                            out.push(ix.next().unwrap());
                            iy.next();
                        }
                    }
                }
            }
            Ok(Partial::RowIds(out))
        }
        (Partial::None, other) | (other, Partial::None) => Ok(other),
        (a, b) => Err(mismatch("rows", &a, &b)),
    }
}

pub(super) fn groups_merge(a: Partial, b: Partial) -> Result<Partial> {
    match (a, b) {
        (Partial::Groups(x), Partial::Groups(y)) => Ok(Partial::Groups(groupby::merge(x, y))),
        (Partial::None, other) | (other, Partial::None) => Ok(other),
        (a, b) => Err(mismatch("groups", &a, &b)),
    }
}

pub(super) fn table_concat(a: Partial, b: Partial) -> Result<Partial> {
    match (a, b) {
        (Partial::Table(mut x), Partial::Table(mut y)) => {
            x.append(&mut y);
            Ok(Partial::Table(x))
        }
        (Partial::None, other) | (other, Partial::None) => Ok(other),
        (a, b) => Err(mismatch("table", &a, &b)),
    }
}

pub(super) fn colvals_concat(a: Partial, b: Partial) -> Result<Partial> {
    match (a, b) {
        (Partial::ColVals(mut x), Partial::ColVals(mut y)) => {
            x.append(&mut y);
            Ok(Partial::ColVals(x))
        }
        (Partial::None, other) | (other, Partial::None) => Ok(other),
        (a, b) => Err(mismatch("colvals", &a, &b)),
    }
}
