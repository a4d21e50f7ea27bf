//! The query coordinator.
//!
//! `Executor::execute` drives the full pipeline: validate and translate the
//! call tree, hoist precall-global sub-queries to constants, derive the
//! shard set, fan out to shard owners (local kernels behind a bounded worker
//! pool, peers over the internal RPC client), fold partials through the
//! operator's reducer, then shape and key-translate the final result.

pub mod groupby;
pub mod kernels;
pub mod precall;
pub mod reduce;
pub mod registry;
#[cfg(test)]
mod tests;

use crate::cluster::{Cluster, InternalClient, ShardPartial, ShardRequest};
use crate::config::{Config, QueryOptions};
use crate::db::schema::FieldType;
use crate::db::Store;
use crate::error::{CallError, ExecError, Result};
use crate::execution_context::ExecutionContext;
use crate::pql::{Arg, Call, CmpOp, Condition, Literal};
use crate::result::{
    ExtractedFieldInfo, ExtractedTable, GroupCounts, Pair, PairsField, QueryResponse, QueryResult,
    RowIdentifiers, RowResult, SignedRowResult, ValCount,
};
use crate::row::Row;
use crate::translate::{TranslateStore, MISSING_ID};
use async_trait::async_trait;
use futures::future::BoxFuture;
use groupby::ShardGroup;
use once_cell::sync::OnceCell;
use pilcrow_primitives::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

/// One shard's contribution to an operator, before reduction.
#[derive(Debug, Clone)]
pub enum Partial {
    Row(Row),
    /// Distinct over signed BSI: value magnitudes split by sign.
    Signed { pos: Row, neg: Row },
    Count(u64),
    Changed(bool),
    Pairs(Vec<Pair>),
    ValCount(ValCount),
    Groups(Vec<ShardGroup>),
    RowIds(Vec<u64>),
    Table(Vec<crate::result::ExtractedColumn>),
    /// (column, value) pairs feeding the coordinator-side Sort.
    ColVals(Vec<(u64, i64)>),
    None,
}

/// Seam to the external relational store behind `ExternalLookup`.
#[async_trait]
pub trait ExternalLookuper: Send + Sync {
    async fn lookup(&self, query: &str, columns: Vec<String>, write: bool) -> Result<ExtractedTable>;
}

pub struct Executor {
    store: Arc<Store>,
    translator: Arc<TranslateStore>,
    cluster: Arc<Cluster>,
    config: Config,
    client: OnceCell<Arc<dyn InternalClient>>,
    lookuper: OnceCell<Arc<dyn ExternalLookuper>>,
    local_sem: Arc<Semaphore>,
}

impl Executor {
    pub fn new(store: Arc<Store>, translator: Arc<TranslateStore>, cluster: Arc<Cluster>, config: Config) -> Arc<Self> {
        let workers = config.local_workers();
        Arc::new(Self {
            store,
            translator,
            cluster,
            config,
            client: OnceCell::new(),
            lookuper: OnceCell::new(),
            local_sem: Arc::new(Semaphore::new(workers)),
        })
    }

    /// Wires the internal transport. Must happen before the first query that
    /// touches a peer-owned shard.
    pub fn set_client(&self, client: Arc<dyn InternalClient>) {
        let _ = self.client.set(client);
    }

    pub fn set_lookuper(&self, lookuper: Arc<dyn ExternalLookuper>) {
        let _ = self.lookuper.set(lookuper);
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn translator(&self) -> &Arc<TranslateStore> {
        &self.translator
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn client(&self) -> Result<&Arc<dyn InternalClient>> {
        self.client
            .get()
            .ok_or_else(|| ExecError::Internal(anyhow::anyhow!("internal transport not configured")))
    }

    /// Runs a request: one response per top-level call, in order.
    #[tracing::instrument(skip_all, fields(index = index))]
    pub async fn execute(
        self: &Arc<Self>,
        index: &str,
        queries: Vec<Call>,
        opts: QueryOptions,
    ) -> Result<Vec<QueryResponse>> {
        let ctx = Arc::new(ExecutionContext::new(
            opts.deadline,
            opts.max_memory.or(self.config.default_max_memory),
        ));
        // Shard views go with the context on every exit path.
        let _release = scopeguard::guard(ctx.clone(), |c| c.release_views());

        let writes: u64 = queries.iter().map(Call::count_writes).sum();
        if let Some(limit) = self.config.max_writes_per_request {
            if writes > limit {
                return Err(ExecError::TooManyWrites { limit });
            }
        }
        if queries.iter().any(|c| c.name == "ExternalLookup" && c.is_write()) && queries.len() > 1 {
            return Err(CallError::ConflictingArgs {
                call: "ExternalLookup",
                arg: "write",
                other: "sibling calls",
            }
            .into());
        }

        let mut out = Vec::with_capacity(queries.len());
        for call in queries {
            let started = Instant::now();
            registry::validate(self.store.schema(), index, &call)?;
            let call = self.translate_call(index, call, writes > 0)?;
            let call = precall::rewrite(self, &ctx, index, call).await?;
            let partial = self.execute_rewritten(&ctx, index, &call).await?;
            let result = self.shape(index, &call, partial)?;
            out.push(QueryResponse { result, elapsed: started.elapsed() });
        }
        Ok(out)
    }

    /// Executes a fully rewritten call (no precall-global sub-calls left)
    /// and applies the operator's coordinator-side finalization.
    pub(crate) async fn execute_rewritten(
        self: &Arc<Self>,
        ctx: &Arc<ExecutionContext>,
        index: &str,
        call: &Call,
    ) -> Result<Partial> {
        ctx.check_live()?;
        // Options(call, shards=[...]) pins the shard set and unwraps.
        if call.name == "Options" {
            let inner = call.children.first().ok_or(CallError::EmptyOperands { call: "Options" })?;
            let mut shards = self.shard_set(index, inner)?;
            if let Some(explicit) = call.id_list_arg("shards")? {
                let explicit: BTreeSet<u64> = explicit.iter().copied().collect();
                shards.retain(|s| explicit.contains(s));
            }
            return self.fanout_finalized(ctx, index, inner, shards).await;
        }
        match call.name.as_str() {
            "Percentile" => self.execute_percentile(ctx, index, call).await,
            "ExternalLookup" => self.execute_external_lookup(ctx, index, call).await,
            _ => {
                let shards = self.shard_set(index, call)?;
                self.fanout_finalized(ctx, index, call, shards).await
            }
        }
    }

    /// Boxed re-entry into [`Self::execute_rewritten`], for operators whose
    /// coordinator evaluation issues further top-level queries (Percentile
    /// probes); boxing keeps the recursive future finite.
    fn execute_boxed<'a>(
        self: &'a Arc<Self>,
        ctx: &'a Arc<ExecutionContext>,
        index: &'a str,
        call: &'a Call,
    ) -> BoxFuture<'a, Result<Partial>> {
        Box::pin(self.execute_rewritten(ctx, index, call))
    }

    async fn fanout_finalized(
        self: &Arc<Self>,
        ctx: &Arc<ExecutionContext>,
        index: &str,
        call: &Call,
        shards: BTreeSet<u64>,
    ) -> Result<Partial> {
        let partial = self.fanout(ctx, index, call, shards).await?;
        self.finalize(ctx, index, call, partial)
    }

    /// The RPC server entry: runs `call` against the named local shards.
    /// Remote work gets its own context; coordinator-side cancellation is
    /// delivered by dropping the RPC, not by token propagation.
    pub async fn execute_shards_local(self: &Arc<Self>, req: ShardRequest) -> Result<Vec<ShardPartial>> {
        let ctx = Arc::new(ExecutionContext::new(None, None));
        let _release = scopeguard::guard(ctx.clone(), |c| c.release_views());
        let mut out = Vec::with_capacity(req.shards.len());
        for shard in req.shards {
            let _permit = self
                .local_sem
                .acquire()
                .await
                .map_err(|_| ExecError::Cancelled)?;
            let partial = kernels::execute_call_shard(self, &ctx, &req.index, &req.call, shard)?;
            out.push(ShardPartial { shard, partial });
        }
        Ok(out)
    }

    /// Parallel fan-out over `shards` with single-threaded reduction.
    #[tracing::instrument(skip_all, fields(call = %call.name, shards = shards.len()))]
    async fn fanout(
        self: &Arc<Self>,
        ctx: &Arc<ExecutionContext>,
        index: &str,
        call: &Call,
        shards: BTreeSet<u64>,
    ) -> Result<Partial> {
        let spec = registry::spec(&call.name)?;
        let is_write = call.is_write();
        // A derived-empty shard set (e.g. ConstRow with no columns) still
        // needs one kernel run so the result carries its proper type.
        let shards = if shards.is_empty() { BTreeSet::from([0]) } else { shards };
        let (tx, mut rx) = mpsc::channel::<Result<Partial>>(64);
        let mut tasks = JoinSet::new();

        for shard in shards {
            if is_write {
                // Writes replicate: one task per (shard, replica); the
                // boolean reducer is true iff any replica changed.
                for node in self.cluster.replicas(index, shard) {
                    self.spawn_shard_task(&mut tasks, tx.clone(), ctx, index, call, shard, vec![node.to_owned()]);
                }
            } else {
                let candidates = self.cluster.read_candidates(index, shard);
                self.spawn_shard_task(&mut tasks, tx.clone(), ctx, index, call, shard, candidates);
            }
        }
        drop(tx);

        // Single reducing task: fold partials as they arrive; the first
        // non-cancel failure cancels the rest and becomes the result.
        let mut acc: Option<Partial> = None;
        let mut first_err: Option<ExecError> = None;
        while let Some(res) = rx.recv().await {
            match res {
                Ok(partial) => {
                    if first_err.is_none() {
                        let merged = match acc.take() {
                            None => Ok(partial),
                            Some(prev) => (spec.reduce)(prev, partial),
                        };
                        match merged {
                            Ok(m) => acc = Some(m),
                            Err(e) => {
                                ctx.cancel();
                                first_err = Some(e);
                            }
                        }
                    }
                }
                Err(e) if first_err.is_none() && !e.is_cancellation() => {
                    ctx.cancel();
                    first_err = Some(e);
                }
                Err(_) => {}
            }
        }
        while tasks.join_next().await.is_some() {}

        if let Some(e) = first_err {
            return Err(e);
        }
        ctx.check_live()?;
        Ok(acc.unwrap_or(Partial::None))
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_shard_task(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        tx: mpsc::Sender<Result<Partial>>,
        ctx: &Arc<ExecutionContext>,
        index: &str,
        call: &Call,
        shard: u64,
        candidates: Vec<String>,
    ) {
        let exec = Arc::clone(self);
        let ctx = ctx.clone();
        let index = index.to_owned();
        let call = call.clone();
        tasks.spawn(async move {
            let res = exec.run_shard(&ctx, &index, &call, shard, candidates).await;
            let _ = tx.send(res).await;
        });
    }

    /// Runs one shard on its preferred replica, walking the candidate list
    /// on retriable transport failures until the per-shard budget runs out.
    async fn run_shard(
        self: &Arc<Self>,
        ctx: &Arc<ExecutionContext>,
        index: &str,
        call: &Call,
        shard: u64,
        candidates: Vec<String>,
    ) -> Result<Partial> {
        let attempts = self.config.shard_retry_budget as usize + 1;
        let mut last_err: Option<ExecError> = None;
        for node in candidates.iter().cycle().take(attempts) {
            ctx.check_live()?;
            if node == self.cluster.self_id() {
                let _permit = self
                    .local_sem
                    .acquire()
                    .await
                    .map_err(|_| ExecError::Cancelled)?;
                return kernels::execute_call_shard(self, ctx, index, call, shard);
            }
            let req = ShardRequest { index: index.to_owned(), call: call.clone(), shards: vec![shard] };
            match self.client()?.query_shards(node, req).await {
                Ok(mut partials) => {
                    return partials
                        .pop()
                        .map(|p| p.partial)
                        .ok_or_else(|| ExecError::Internal(anyhow::anyhow!("peer returned no partial for shard {shard}")));
                }
                Err(e) if e.is_retriable() => {
                    log::warn!("shard {shard} on `{node}` failed, trying next replica: {e}");
                    self.cluster.mark_down(node);
                    last_err = Some(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err.unwrap_or(ExecError::Internal(anyhow::anyhow!("no replicas for shard {shard}"))))
    }

    /// Derives the shard set a call touches. `None` from the recursion means
    /// "every shard of the index".
    pub(crate) fn shard_set(&self, index: &str, call: &Call) -> Result<BTreeSet<u64>> {
        let width_exp = self.store.schema().index(index)?.def.shard_width_exp;
        let derived = derive_shards(call, width_exp)?;
        Ok(match derived {
            Some(shards) => shards,
            None => self.store.registry().shards(index),
        })
    }

    /// The coordinator-side tail of each operator: ordering, paging and
    /// other work that only makes sense after reduction.
    fn finalize(&self, ctx: &ExecutionContext, index: &str, call: &Call, partial: Partial) -> Result<Partial> {
        match call.name.as_str() {
            "All" | "Limit" => {
                let Partial::Row(row) = partial else { return Ok(partial) };
                let offset = call.u64_arg("offset")?.unwrap_or(0);
                let limit = call.u64_arg("limit")?;
                let cols = row.iter().skip(offset as usize);
                let row = match limit {
                    Some(k) => Row::from_columns(cols.take(k as usize)),
                    None => Row::from_columns(cols),
                };
                Ok(Partial::Row(row))
            }
            "TopN" | "TopK" => {
                let Partial::Pairs(mut pairs) = partial else { return Ok(Partial::Pairs(vec![])) };
                // Descending count, ascending id for the deterministic
                // tie-break.
                pairs.sort_by(|a, b| b.count.cmp(&a.count).then(a.id.cmp(&b.id)));
                pairs.retain(|p| p.count > 0);
                if let Some(k) = call.u64_arg("k")? {
                    pairs.truncate(k as usize);
                }
                Ok(Partial::Pairs(pairs))
            }
            "Rows" => {
                let Partial::RowIds(mut ids) = partial else { return Ok(Partial::RowIds(vec![])) };
                if let Some(limit) = call.u64_arg("limit")? {
                    ids.truncate(limit as usize);
                }
                Ok(Partial::RowIds(ids))
            }
            "GroupBy" => groupby::finalize(self, index, call, partial),
            "Sort" => {
                let Partial::ColVals(mut pairs) = partial else { return Ok(Partial::Row(Row::new())) };
                let desc = call.bool_arg("sort-desc")?.unwrap_or(false);
                if desc {
                    pairs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                } else {
                    pairs.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
                }
                let offset = call.u64_arg("offset")?.unwrap_or(0) as usize;
                let limit = call.u64_arg("limit")?.map(|k| k as usize).unwrap_or(usize::MAX);
                ctx.check_live()?;
                Ok(Partial::Row(Row::from_columns(
                    pairs.into_iter().skip(offset).take(limit).map(|(c, _)| c),
                )))
            }
            _ => Ok(partial),
        }
    }

    /// Percentile runs at the coordinator: bounds from Min/Max, then a
    /// binary search over range-count probes, tie-breaking low.
    async fn execute_percentile(
        self: &Arc<Self>,
        ctx: &Arc<ExecutionContext>,
        index: &str,
        call: &Call,
    ) -> Result<Partial> {
        let field = call.str_arg("field")?.ok_or(CallError::BadArg {
            call: "Percentile",
            arg: "field",
            detail: "required".into(),
        })?;
        let nth = call.u64_arg("nth")?.unwrap_or(50);
        if nth > 100 {
            return Err(CallError::BadArg {
                call: "Percentile",
                arg: "nth",
                detail: format!("{nth} outside 0..=100"),
            }
            .into());
        }
        let filter = call.call_arg("filter")?.cloned();

        // Min/Max take the filter as a positional operand; Count probes wrap
        // it in an Intersect.
        let agg = |name: &str| {
            let c = Call::new(name).with_arg("field", field);
            match &filter {
                Some(f) => c.with_child(f.clone()),
                None => c,
            }
        };
        let counted = |cond: Condition| {
            let row = Call::new("Row").with_arg(field, cond);
            let src = match &filter {
                Some(f) => Call::new("Intersect").with_child(row).with_child(f.clone()),
                None => row,
            };
            Call::new("Count").with_child(src)
        };
        let count_of = |p: Partial| match p {
            Partial::Count(n) => n,
            _ => 0,
        };

        let Partial::ValCount(min) = self.execute_boxed(ctx, index, &agg("Min")).await? else {
            return Ok(Partial::ValCount(ValCount::int(0, 0)));
        };
        if min.count == 0 {
            return Ok(Partial::ValCount(ValCount::int(0, 0)));
        }
        if nth == 0 {
            return Ok(Partial::ValCount(min));
        }
        let Partial::ValCount(max) = self.execute_boxed(ctx, index, &agg("Max")).await? else {
            return Ok(Partial::ValCount(ValCount::int(0, 0)));
        };
        if nth == 100 {
            return Ok(Partial::ValCount(max));
        }

        let total_call = counted(Condition::Cmp { op: CmpOp::Neq, value: Literal::Null });
        let total = count_of(self.execute_boxed(ctx, index, &total_call).await?);
        if total == 0 {
            return Ok(Partial::ValCount(ValCount::int(0, 0)));
        }
        // Smallest v with |{x <= v}| >= ceil(nth% of total); ties break low.
        let rank = ((nth as u128 * total as u128).div_ceil(100).max(1)) as u64;
        let (mut lo, mut hi) = (min.val, max.val);
        while lo < hi {
            ctx.check_live()?;
            let mid = ((lo as i128 + hi as i128).div_euclid(2)) as i64;
            let probe = counted(Condition::Cmp { op: CmpOp::Lte, value: Literal::Int(mid) });
            let below = count_of(self.execute_boxed(ctx, index, &probe).await?);
            if below >= rank {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let eq = counted(Condition::Cmp { op: CmpOp::Eq, value: Literal::Int(lo) });
        let count = count_of(self.execute_boxed(ctx, index, &eq).await?);
        Ok(Partial::ValCount(ValCount::int(lo, count)))
    }

    /// Materializes the filter row globally, hands the column identifiers to
    /// the external store and relays its table, keyed by column.
    async fn execute_external_lookup(
        self: &Arc<Self>,
        ctx: &Arc<ExecutionContext>,
        index: &str,
        call: &Call,
    ) -> Result<Partial> {
        let lookuper = self
            .lookuper
            .get()
            .ok_or(ExecError::ExternalStoreNotConfigured)?;
        let query = call
            .str_arg("query")?
            .ok_or(CallError::BadArg { call: "ExternalLookup", arg: "query", detail: "required".into() })?;
        let write = call.bool_arg("write")?.unwrap_or(false);
        let src = call
            .children
            .first()
            .ok_or(CallError::EmptyOperands { call: "ExternalLookup" })?;
        let shards = self.shard_set(index, src)?;
        let Partial::Row(row) = self.fanout_finalized(ctx, index, src, shards).await? else {
            return Err(CallError::BadArg {
                call: "ExternalLookup",
                arg: "row",
                detail: "first operand must produce a row".into(),
            }
            .into());
        };
        let schema = self.store.schema().index(index)?;
        let columns: Vec<String> = if schema.def.keys {
            self.translator.col_keys(index, &row.columns())?
        } else {
            row.iter().map(|c| c.to_string()).collect()
        };
        let table = lookuper.lookup(query, columns, write).await?;
        if write {
            return Ok(Partial::Table(Vec::new()));
        }
        Ok(Partial::Table(table.columns))
    }

    /// Rewrites literal keys to IDs ahead of planning. On write requests
    /// unknown keys in writable positions allocate; on reads they become
    /// sentinels that match nothing.
    fn translate_call(&self, index: &str, mut call: Call, writable: bool) -> Result<Call> {
        let target_index = call.str_arg("index")?.unwrap_or(index).to_owned();
        let schema = self.store.schema().index(&target_index)?;

        let allocating = writable && call.is_write();
        // Column-valued args.
        for key in ["column", "previous"] {
            if key == "previous" && call.name != "Rows" {
                continue;
            }
            if let Some(Arg::Literal(Literal::Str(s))) = call.arg(key) {
                let s = s.clone();
                let id = if key == "column" {
                    if !schema.def.keys {
                        return Err(CallError::KeyOnUnkeyedIndex(target_index.clone()).into());
                    }
                    if allocating {
                        self.translator.col_id_or_create(&target_index, &s)
                    } else {
                        self.translator.col_id(&target_index, &s)
                    }
                } else {
                    let field = call
                        .str_arg("field")?
                        .map(str::to_owned)
                        .ok_or(CallError::BadArg { call: "Rows", arg: "field", detail: "required".into() })?;
                    self.translate_row_key(&target_index, &schema, &field, &s, false, writable)?
                };
                // Unknown keys become a sentinel that matches nothing; these
                // positions need a non-negative id, so saturate high.
                let id = if id == MISSING_ID { i64::MAX } else { id as i64 };
                call.args.insert(key.to_owned(), Arg::Literal(Literal::Int(id)));
            }
        }
        // ConstRow columns / Rows in= by key.
        for key in ["columns", "in"] {
            if let Some(Arg::Literal(Literal::KeyList(keys))) = call.arg(key) {
                let keys = keys.clone();
                let ids: Vec<u64> = if key == "in" {
                    let field = call
                        .str_arg("field")?
                        .map(str::to_owned)
                        .ok_or(CallError::BadArg { call: "Rows", arg: "field", detail: "required".into() })?;
                    keys.iter()
                        .map(|k| self.translate_row_key(&target_index, &schema, &field, k, false, writable))
                        .collect::<Result<_>>()?
                } else {
                    if !schema.def.keys {
                        return Err(CallError::KeyOnUnkeyedIndex(target_index.clone()).into());
                    }
                    keys.iter().map(|k| self.translator.col_id(&target_index, k)).collect()
                };
                call.args.insert(key.to_owned(), Arg::Literal(Literal::IdList(ids)));
            }
        }
        // Rows like= expands into in= against the field's key table.
        if call.name == "Rows" {
            if let Some(pattern) = call.str_arg("like")?.map(str::to_owned) {
                let field = call
                    .str_arg("field")?
                    .map(str::to_owned)
                    .ok_or(CallError::BadArg { call: "Rows", arg: "field", detail: "required".into() })?;
                let fdef = schema.field(&field)?;
                if !fdef.keyed() {
                    return Err(CallError::KeyOnUnkeyedField(field).into());
                }
                let ids = self.translator.row_ids_like(&target_index, &field, &pattern);
                call.args.shift_remove("like");
                call.args.insert("in".to_owned(), Arg::Literal(Literal::IdList(ids)));
            }
        }
        // The field-named arg: a string literal is a row key, except on BSI
        // fields where a string is a timestamp literal for the kernel.
        if let Some((fname, Arg::Literal(Literal::Str(key)))) = call.field_arg() {
            if schema.has_field(fname) && !schema.field(fname)?.is_bsi() {
                let fname = fname.to_owned();
                let key = key.clone();
                let id = self.translate_row_key(&target_index, &schema, &fname, &key, allocating, writable)?;
                // MISSING_ID casts to -1: the row-position sentinel.
                call.args.insert(fname, Arg::Literal(Literal::Int(id as i64)));
            }
        }

        let children = std::mem::take(&mut call.children);
        call.children = children
            .into_iter()
            .map(|c| self.translate_call(&target_index, c, writable))
            .collect::<Result<_>>()?;
        let keys: Vec<String> = call.args.keys().cloned().collect();
        for k in keys {
            if let Some(Arg::Call(c)) = call.args.get(&k) {
                let translated = self.translate_call(&target_index, c.clone(), writable)?;
                call.args.insert(k, Arg::Call(translated));
            }
        }
        Ok(call)
    }

    /// Resolves a row key. Writable calls allocate; read positions inside a
    /// write request must already resolve (a write cannot proceed against a
    /// key nobody allocated); plain reads degrade to the sentinel.
    fn translate_row_key(
        &self,
        index: &str,
        schema: &crate::db::schema::IndexSchema,
        field: &str,
        key: &str,
        allocating: bool,
        writable: bool,
    ) -> Result<u64> {
        let fdef = schema.field(field)?;
        if !fdef.keyed() {
            return Err(CallError::KeyOnUnkeyedField(field.to_owned()).into());
        }
        if allocating {
            return Ok(self.translator.row_id_or_create(index, field, key));
        }
        if writable {
            return self.translator.require_row_id(index, field, key);
        }
        Ok(self.translator.row_id(index, field, key))
    }

    /// Turns the reduced partial into the public result shape, translating
    /// IDs back to keys where the index or field is keyed.
    fn shape(&self, index: &str, call: &Call, partial: Partial) -> Result<QueryResult> {
        let schema = self.store.schema().index(index)?;
        let field_of = |call: &Call| -> Option<String> {
            call.str_arg("field").ok().flatten().map(str::to_owned)
        };
        Ok(match partial {
            Partial::Row(row) => {
                // Distinct on a set/mutex field yields row IDs, which are
                // not column-key translatable.
                let row_domain = call.name == "Distinct";
                let columns = row.columns();
                let keys = if schema.def.keys && !row_domain {
                    Some(self.translator.col_keys(index, &columns)?)
                } else {
                    None
                };
                QueryResult::Row(RowResult { columns, keys })
            }
            Partial::Signed { pos, neg } => QueryResult::SignedRow(SignedRowResult {
                pos: pos.columns(),
                neg: neg.columns(),
            }),
            Partial::Count(n) => QueryResult::Count(n),
            Partial::Changed(b) => QueryResult::Bool(b),
            Partial::ValCount(vc) => {
                let mut vc = vc;
                if let Some(field) = field_of(call) {
                    let fdef = schema.field(&field)?;
                    match &fdef.field_type {
                        FieldType::Decimal { scale, .. } => {
                            vc.decimal_val = Some(Decimal::new(vc.val, *scale));
                        }
                        FieldType::Timestamp { unit, epoch } if call.name != "Sum" => {
                            if vc.count > 0 {
                                vc.timestamp_val = Some(unit.from_ticks(vc.val, *epoch)?);
                            }
                        }
                        _ => {}
                    }
                }
                QueryResult::ValCount(vc)
            }
            Partial::Pairs(pairs) => {
                let field = field_of(call).unwrap_or_default();
                let pairs = self.translate_pairs(index, &schema, &field, pairs)?;
                QueryResult::Pairs(PairsField { field, pairs })
            }
            Partial::Groups(groups) => {
                let mut shaped = GroupCounts {
                    aggregate: groupby::aggregate_name(call),
                    groups: groups.into_iter().map(ShardGroup::into_group_count).collect(),
                };
                for g in &mut shaped.groups {
                    for fr in &mut g.group {
                        if fr.value.is_none() && schema.field(&fr.field)?.keyed() {
                            fr.row_key = Some(self.translator.row_keys(index, &fr.field, &[fr.row_id])?.remove(0));
                        }
                    }
                }
                QueryResult::GroupCounts(shaped)
            }
            Partial::RowIds(rows) => {
                let keys = match field_of(call) {
                    Some(field) if schema.field(&field)?.keyed() => {
                        Some(self.translator.row_keys(index, &field, &rows)?)
                    }
                    _ => None,
                };
                QueryResult::RowIdentifiers(RowIdentifiers { rows, keys })
            }
            Partial::Table(mut columns) => {
                columns.sort_by_key(|c| c.column);
                if schema.def.keys {
                    for c in &mut columns {
                        c.key = Some(self.translator.col_keys(index, &[c.column])?.remove(0));
                    }
                }
                let fields = call
                    .children
                    .iter()
                    .skip(1)
                    .filter_map(|c| c.str_arg("field").ok().flatten())
                    .map(|f| ExtractedFieldInfo { name: f.to_owned() })
                    .collect();
                QueryResult::Table(ExtractedTable { fields, columns })
            }
            Partial::ColVals(_) => {
                return Err(ExecError::Internal(anyhow::anyhow!("unfinalized sort partial")));
            }
            Partial::None => QueryResult::None,
        })
    }

    fn translate_pairs(
        &self,
        index: &str,
        schema: &crate::db::schema::IndexSchema,
        field: &str,
        mut pairs: Vec<Pair>,
    ) -> Result<Vec<Pair>> {
        if !field.is_empty() && schema.field(field)?.keyed() {
            let ids: Vec<u64> = pairs.iter().map(|p| p.id).collect();
            let keys = self.translator.row_keys(index, field, &ids)?;
            for (p, key) in pairs.iter_mut().zip(keys) {
                p.key = Some(key);
            }
        }
        Ok(pairs)
    }
}

/// `None` means "all shards of the index".
fn derive_shards(call: &Call, width_exp: u32) -> Result<Option<BTreeSet<u64>>> {
    match call.name.as_str() {
        "Set" | "Clear" | "IncludesColumn" => {
            let col = call
                .u64_arg("column")?
                .ok_or(CallError::BadArg { call: "Set", arg: "column", detail: "required".into() })?;
            Ok(Some(BTreeSet::from([pilcrow_primitives::shard_of(col, width_exp)])))
        }
        "ConstRow" => {
            let cols = call.id_list_arg("columns")?.unwrap_or_default();
            Ok(Some(
                cols.iter()
                    .filter(|&&c| c != MISSING_ID)
                    .map(|&c| pilcrow_primitives::shard_of(c, width_exp))
                    .collect(),
            ))
        }
        // Store overwrites its destination row everywhere, so it must visit
        // every shard regardless of where the source has bits.
        "Store" | "ClearRow" => Ok(None),
        "Options" => {
            // Handled by the coordinator before fan-out.
            Ok(None)
        }
        _ => {
            let mut acc: Option<BTreeSet<u64>> = Some(BTreeSet::new());
            let mut any_child = false;
            let mut visit = |c: &Call| -> Result<()> {
                any_child = true;
                match derive_shards(c, width_exp)? {
                    None => acc = None,
                    Some(s) => {
                        if let Some(acc) = acc.as_mut() {
                            acc.extend(s);
                        }
                    }
                }
                Ok(())
            };
            for c in &call.children {
                visit(c)?;
            }
            for arg in call.args.values() {
                if let Arg::Call(c) = arg {
                    visit(c)?;
                }
            }
            if !any_child {
                // Leaf operators (Row, Rows, All, aggregates) span the index.
                return Ok(None);
            }
            Ok(acc)
        }
    }
}
