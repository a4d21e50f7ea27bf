//! End-to-end executor tests over an in-process multi-node cluster.
//!
//! Every query here crosses the real coordinator path: validation, key
//! translation, pre-call planning, shard routing over the loopback
//! transport, reduction and shaping. Three nodes with two shards of data is
//! enough to make routing and reducers earn their keep.

use super::*;
use crate::cluster::{Cluster, LoopbackClient, Node};
use crate::config::{Config, QueryOptions};
use crate::db::datastore::ShardRegistry;
use crate::db::schema::{CacheType, FieldDef, FieldType, IndexDef, Schema};
use crate::db::Store;
use crate::error::ErrorKind;
use crate::pql::{Arg, Call, CmpOp, Condition, Literal};
use crate::result::{QueryResult, ValCount};
use crate::translate::TranslateStore;
use pilcrow_primitives::time::TimeUnit;
use pilcrow_primitives::Decimal;
use pretty_assertions::assert_eq;
use std::sync::Arc;

const W: u64 = 1 << 20;

struct TestCluster {
    execs: Vec<Arc<Executor>>,
    client: Arc<LoopbackClient>,
    schema: Arc<Schema>,
}

impl TestCluster {
    fn new(n: usize, replica_n: usize) -> Self {
        let schema = Arc::new(Schema::new());
        let registry = Arc::new(ShardRegistry::default());
        let translator = Arc::new(TranslateStore::new());
        let client = LoopbackClient::new();
        let nodes: Vec<Node> = (0..n).map(|i| Node::new(format!("node{i}"))).collect();
        let mut execs = Vec::with_capacity(n);
        for i in 0..n {
            let cluster = Arc::new(Cluster::new(nodes.clone(), format!("node{i}"), replica_n));
            let store = Arc::new(Store::new(schema.clone(), registry.clone()));
            let exec = Executor::new(store, translator.clone(), cluster, Config::default());
            exec.set_client(client.clone());
            client.register(&format!("node{i}"), exec.clone());
            execs.push(exec);
        }
        Self { execs, client, schema }
    }

    fn coordinator(&self) -> &Arc<Executor> {
        &self.execs[0]
    }

    async fn run(&self, index: &str, call: Call) -> crate::error::Result<QueryResult> {
        let mut out = self
            .coordinator()
            .execute(index, vec![call], QueryOptions::default())
            .await?;
        Ok(out.remove(0).result)
    }

    async fn q(&self, index: &str, call: Call) -> QueryResult {
        self.run(index, call).await.unwrap()
    }
}

fn set_index(tc: &TestCluster, name: &str) {
    tc.schema.create_index(IndexDef::new(name)).unwrap();
}

fn set_call(col: u64, field: &str, row: impl Into<Arg>) -> Call {
    Call::new("Set").with_arg("column", col).with_arg(field, row)
}

fn row_call(field: &str, row: impl Into<Arg>) -> Call {
    Call::new("Row").with_arg(field, row)
}

fn cond(op: CmpOp, v: i64) -> Condition {
    Condition::Cmp { op, value: Literal::Int(v) }
}

fn cols(r: QueryResult) -> Vec<u64> {
    match r {
        QueryResult::Row(r) => r.columns,
        other => panic!("expected a row result, got {other:?}"),
    }
}

fn count_of(r: QueryResult) -> u64 {
    match r {
        QueryResult::Count(n) => n,
        other => panic!("expected a count, got {other:?}"),
    }
}

fn changed(r: QueryResult) -> bool {
    match r {
        QueryResult::Bool(b) => b,
        other => panic!("expected a bool, got {other:?}"),
    }
}

fn valcount(r: QueryResult) -> ValCount {
    match r {
        QueryResult::ValCount(v) => v,
        other => panic!("expected a valcount, got {other:?}"),
    }
}

async fn seed_set_field(tc: &TestCluster, index: &str, field: &str, bits: &[(u64, u64)]) {
    for &(row, col) in bits {
        tc.q(index, set_call(col, field, row)).await;
    }
}

#[tokio::test]
async fn s1_set_row_not_union() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    seed_set_field(&tc, "i", "f", &[(10, 3), (10, W + 1), (20, W + 2)]).await;

    assert_eq!(cols(tc.q("i", row_call("f", 10u64)).await), vec![3, W + 1]);
    let not = Call::new("Not").with_child(row_call("f", 20u64));
    assert_eq!(cols(tc.q("i", not).await), vec![3, W + 1]);
    let union = Call::new("Union")
        .with_child(row_call("f", 10u64))
        .with_child(row_call("f", 20u64));
    assert_eq!(count_of(tc.q("i", Call::new("Count").with_child(union)).await), 3);
}

#[tokio::test]
async fn s2_bsi_range_and_aggregates() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::int("foo", -990, 1000)).unwrap();
    for (col, v) in [(50u64, 20i64), (W, 30), (W + 2, 10), (5 * W + 100, 20), (W + 1, 60)] {
        tc.q("i", set_call(col, "foo", v)).await;
    }

    let gt20 = row_call("foo", cond(CmpOp::Gt, 20));
    assert_eq!(cols(tc.q("i", gt20).await), vec![W, W + 1]);

    let span = Call::new("Row").with_arg(
        "foo",
        Condition::Span { lo: Literal::Int(20), hi: Literal::Int(60) },
    );
    assert_eq!(cols(tc.q("i", span).await), vec![50, W, 5 * W + 100]);

    let sum = valcount(tc.q("i", Call::new("Sum").with_arg("field", "foo")).await);
    assert_eq!((sum.val, sum.count), (140, 5));

    let max = valcount(tc.q("i", Call::new("Max").with_arg("field", "foo")).await);
    assert_eq!((max.val, max.count), (60, 1));

    let min = valcount(
        tc.q(
            "i",
            Call::new("Min")
                .with_arg("field", "foo")
                .with_child(row_call("foo", cond(CmpOp::Gte, 20))),
        )
        .await,
    );
    assert_eq!((min.val, min.count), (20, 2));
}

#[tokio::test]
async fn s3_groupby_with_sum_aggregate() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("general")).unwrap();
    tc.schema.create_field("i", FieldDef::set("sub")).unwrap();
    tc.schema.create_field("i", FieldDef::int("v", 0, 1000)).unwrap();
    seed_set_field(
        &tc,
        "i",
        "general",
        &[(10, 0), (10, 1), (10, W + 1), (11, 2), (11, W + 2), (12, 2), (12, W + 2)],
    )
    .await;
    seed_set_field(&tc, "i", "sub", &[(100, 0), (100, 1), (100, 3), (100, W + 1), (110, 0), (110, 2)]).await;
    for (col, v) in [(0u64, 10i64), (1, 100), (W + 10, 100)] {
        tc.q("i", set_call(col, "v", v)).await;
    }

    let call = Call::new("GroupBy")
        .with_child(Call::new("Rows").with_arg("field", "general"))
        .with_child(Call::new("Rows").with_arg("field", "sub"))
        .with_arg("aggregate", Call::new("Sum").with_arg("field", "v"));
    let QueryResult::GroupCounts(gc) = tc.q("i", call).await else {
        panic!("expected group counts");
    };
    assert_eq!(gc.aggregate.as_deref(), Some("sum"));
    let flat: Vec<(Vec<u64>, u64, i64)> = gc
        .groups
        .iter()
        .map(|g| {
            (
                g.group.iter().map(|fr| fr.row_id).collect(),
                g.count,
                g.agg.unwrap(),
            )
        })
        .collect();
    assert_eq!(flat, vec![(vec![10, 100], 2, 110), (vec![10, 110], 1, 10)]);
}

#[tokio::test]
async fn s4_topk() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    seed_set_field(
        &tc,
        "i",
        "f",
        &[(0, 0), (0, W + 2), (0, 1), (10, 2), (10, W), (10, 2 * W), (10, W + 1), (20, W)],
    )
    .await;

    let call = Call::new("TopK").with_arg("field", "f").with_arg("k", 2u64);
    let QueryResult::Pairs(p) = tc.q("i", call).await else { panic!("expected pairs") };
    let got: Vec<(u64, u64)> = p.pairs.iter().map(|p| (p.id, p.count)).collect();
    assert_eq!(got, vec![(10, 4), (0, 3)]);
}

#[tokio::test]
async fn s5_count_distinct_through_filter() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::keyed_set("type")).unwrap();
    tc.schema.create_field("i", FieldDef::int("equip_id", 0, 1000)).unwrap();
    tc.q("i", set_call(100, "type", "AntidotePoint")).await;
    tc.q("i", set_call(100, "type", "TwoPoints")).await;
    tc.q("i", set_call(101, "type", "TwoPoints")).await;
    for (col, v) in [(100u64, 1i64), (101, 2), (102, 3)] {
        tc.q("i", set_call(col, "equip_id", v)).await;
    }

    let call = Call::new("Count").with_child(
        Call::new("Distinct")
            .with_arg("field", "equip_id")
            .with_child(Call::new("Intersect").with_child(row_call("type", "AntidotePoint"))),
    );
    assert_eq!(count_of(tc.q("i", call).await), 1);
}

#[tokio::test]
async fn s6_all_with_limit_and_offset() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    for col in 0..105u64 {
        tc.q("i", set_call(col, "f", 10u64)).await;
    }

    let page = Call::new("All").with_arg("limit", 4u64).with_arg("offset", 4u64);
    assert_eq!(cols(tc.q("i", page).await), vec![4, 5, 6, 7]);
    let past_end = Call::new("All").with_arg("limit", 4u64).with_arg("offset", 1_000_000u64);
    assert_eq!(cols(tc.q("i", past_end).await), Vec::<u64>::new());
}

#[tokio::test]
async fn s7_groupby_paging_recovers_cross_product() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    for f in ["ppa", "ppb", "ppc"] {
        tc.schema.create_field("i", FieldDef::set(f)).unwrap();
        // Identical bits in two shards for every row.
        for row in 0..4u64 {
            seed_set_field(&tc, "i", f, &[(row, 0), (row, W + 1)]).await;
        }
    }

    let base = || {
        Call::new("GroupBy")
            .with_child(Call::new("Rows").with_arg("field", "ppa"))
            .with_child(Call::new("Rows").with_arg("field", "ppb"))
            .with_child(Call::new("Rows").with_arg("field", "ppc"))
            .with_arg("limit", 3u64)
    };
    let mut seen: Vec<Vec<u64>> = Vec::new();
    let mut pages = 0;
    let mut previous: Option<Vec<i64>> = None;
    loop {
        let mut call = base();
        if let Some(prev) = &previous {
            call = call.with_arg("previous", Literal::IntList(prev.clone()));
        }
        let QueryResult::GroupCounts(gc) = tc.q("i", call).await else { panic!() };
        if gc.groups.is_empty() {
            break;
        }
        pages += 1;
        for g in &gc.groups {
            // Both shards contribute to every group.
            assert_eq!(g.count, 2);
            seen.push(g.group.iter().map(|fr| fr.row_id).collect());
        }
        let last = gc.groups.last().unwrap();
        previous = Some(last.group.iter().map(|fr| fr.row_id as i64).collect());
        if gc.groups.len() < 3 {
            break;
        }
    }
    assert_eq!(pages, 22); // 21 full pages + 1 remainder
    assert_eq!(seen.len(), 64);
    let mut sorted = seen.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), 64, "tuples must be unique and totally ordered");
    assert_eq!(seen, sorted, "pages arrive in tuple order");
}

#[tokio::test]
async fn writes_are_idempotent() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    assert!(changed(tc.q("i", set_call(3, "f", 10u64)).await));
    assert!(!changed(tc.q("i", set_call(3, "f", 10u64)).await));
    assert_eq!(cols(tc.q("i", row_call("f", 10u64)).await), vec![3]);
}

#[tokio::test]
async fn clear_and_clear_row() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    tc.schema.create_field("i", FieldDef::int("v", 0, 10)).unwrap();
    seed_set_field(&tc, "i", "f", &[(1, 5), (1, W + 5), (2, 5)]).await;

    let clear = Call::new("Clear").with_arg("column", 5u64).with_arg("f", 1u64);
    assert!(changed(tc.q("i", clear.clone()).await));
    assert!(!changed(tc.q("i", clear).await));
    assert_eq!(cols(tc.q("i", row_call("f", 1u64)).await), vec![W + 5]);

    let clear_row = Call::new("ClearRow").with_arg("f", 1u64);
    assert!(changed(tc.q("i", clear_row).await));
    assert_eq!(cols(tc.q("i", row_call("f", 1u64)).await), Vec::<u64>::new());

    let err = tc.run("i", Call::new("ClearRow").with_arg("v", 1u64)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[tokio::test]
async fn store_overwrites_destination_row() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    tc.schema.create_field("i", FieldDef::set("g")).unwrap();
    seed_set_field(&tc, "i", "f", &[(10, 1), (10, W + 1)]).await;
    seed_set_field(&tc, "i", "g", &[(7, 2), (7, 2 * W + 2)]).await;

    let store = Call::new("Store").with_child(row_call("f", 10u64)).with_arg("g", 7u64);
    assert!(changed(tc.q("i", store).await));
    assert_eq!(cols(tc.q("i", row_call("g", 7u64)).await), vec![1, W + 1]);
}

#[tokio::test]
async fn xor_shift_limit_const_row_includes_column() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    seed_set_field(&tc, "i", "f", &[(1, 1), (1, 2), (2, 2), (2, 3)]).await;

    let xor = Call::new("Xor")
        .with_child(row_call("f", 1u64))
        .with_child(row_call("f", 2u64));
    assert_eq!(cols(tc.q("i", xor).await), vec![1, 3]);

    let shift = Call::new("Shift").with_child(row_call("f", 1u64)).with_arg("n", 2u64);
    assert_eq!(cols(tc.q("i", shift).await), vec![3, 4]);

    let limit = Call::new("Limit")
        .with_child(row_call("f", 2u64))
        .with_arg("limit", 1u64)
        .with_arg("offset", 1u64);
    assert_eq!(cols(tc.q("i", limit).await), vec![3]);

    let cr = Call::const_row([2, 9, W + 4]);
    assert_eq!(cols(tc.q("i", cr.clone()).await), vec![2, 9, W + 4]);

    let inc = Call::new("IncludesColumn").with_child(row_call("f", 2u64)).with_arg("column", 3u64);
    assert!(changed(tc.q("i", inc).await));
    let inc = Call::new("IncludesColumn").with_child(row_call("f", 2u64)).with_arg("column", 9u64);
    assert!(!changed(tc.q("i", inc).await));
}

#[tokio::test]
async fn rows_previous_limit_and_column() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    seed_set_field(&tc, "i", "f", &[(1, 0), (3, W + 1), (5, 0), (7, 2 * W)]).await;

    let rows = |args: &[(&str, u64)]| {
        let mut c = Call::new("Rows").with_arg("field", "f");
        for &(k, v) in args {
            c = c.with_arg(k, v);
        }
        c
    };
    let ids = |r: QueryResult| match r {
        QueryResult::RowIdentifiers(r) => r.rows,
        other => panic!("expected row ids, got {other:?}"),
    };

    assert_eq!(ids(tc.q("i", rows(&[])).await), vec![1, 3, 5, 7]);
    assert_eq!(ids(tc.q("i", rows(&[("previous", 3)])).await), vec![5, 7]);
    assert_eq!(ids(tc.q("i", rows(&[("limit", 2)])).await), vec![1, 3]);
    assert_eq!(ids(tc.q("i", rows(&[("column", 0)])).await), vec![1, 5]);

    let union_rows = Call::new("UnionRows").with_child(rows(&[("column", 0)]));
    assert_eq!(cols(tc.q("i", union_rows).await), vec![0]);

    let minr = Call::new("MinRow").with_arg("field", "f");
    let QueryResult::Pairs(p) = tc.q("i", minr).await else { panic!() };
    assert_eq!((p.pairs[0].id, p.pairs[0].count), (1, 1));
    let maxr = Call::new("MaxRow").with_arg("field", "f");
    let QueryResult::Pairs(p) = tc.q("i", maxr).await else { panic!() };
    assert_eq!((p.pairs[0].id, p.pairs[0].count), (7, 1));
}

#[tokio::test]
async fn keyed_index_round_trip_and_unknown_keys() {
    let tc = TestCluster::new(2, 1);
    tc.schema.create_index(IndexDef::new("k").with_keys()).unwrap();
    tc.schema.create_field("k", FieldDef::keyed_set("f")).unwrap();

    let set = Call::new("Set").with_arg("column", "alice").with_arg("f", "admin");
    assert!(changed(tc.q("k", set).await));
    let QueryResult::Row(r) = tc.q("k", row_call("f", "admin")).await else { panic!() };
    assert_eq!(r.keys.as_deref(), Some(&["alice".to_owned()][..]));

    // Unknown keys on the read path: empty, never an error.
    let QueryResult::Row(r) = tc.q("k", row_call("f", "ghost")).await else { panic!() };
    assert!(r.columns.is_empty());

    let rows_like = Call::new("Rows").with_arg("field", "f").with_arg("like", "adm%");
    let QueryResult::RowIdentifiers(r) = tc.q("k", rows_like).await else { panic!() };
    assert_eq!(r.keys.as_deref(), Some(&["admin".to_owned()][..]));
}

#[tokio::test]
async fn topn_requires_ranked_cache_and_translates_keys() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::keyed_set("tagged")).unwrap();
    let uncached = FieldDef {
        name: "plain".into(),
        field_type: FieldType::Set { keys: false, cache: CacheType::None, cache_size: 0 },
    };
    tc.schema.create_field("i", uncached).unwrap();

    for col in 0..3u64 {
        tc.q("i", Call::new("Set").with_arg("column", col).with_arg("tagged", "hot")).await;
    }
    tc.q("i", Call::new("Set").with_arg("column", 0u64).with_arg("tagged", "cold")).await;

    let top = Call::new("TopN").with_arg("field", "tagged").with_arg("k", 1u64);
    let QueryResult::Pairs(p) = tc.q("i", top).await else { panic!() };
    assert_eq!(p.pairs.len(), 1);
    assert_eq!(p.pairs[0].key.as_deref(), Some("hot"));
    assert_eq!(p.pairs[0].count, 3);

    tc.q("i", set_call(1, "plain", 4u64)).await;
    let top = Call::new("TopN").with_arg("field", "plain").with_arg("k", 1u64);
    assert_eq!(tc.run("i", top).await.unwrap_err().kind(), ErrorKind::PreconditionFailed);
}

#[tokio::test]
async fn topk_prefix_stability() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    let mut bits = Vec::new();
    for row in 0..6u64 {
        for col in 0..(row % 4 + 1) {
            bits.push((row, col * W + row));
        }
    }
    seed_set_field(&tc, "i", "f", &bits).await;

    let topk = |k: u64| Call::new("TopK").with_arg("field", "f").with_arg("k", k);
    for k in 1..5u64 {
        let QueryResult::Pairs(a) = tc.q("i", topk(k)).await else { panic!() };
        let QueryResult::Pairs(b) = tc.q("i", topk(k + 1)).await else { panic!() };
        assert_eq!(a.pairs[..], b.pairs[..k as usize], "prefix stability at k={k}");
    }
}

#[tokio::test]
async fn distinct_signed_and_precall_transparency() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::int("v", -50, 50)).unwrap();
    for (col, v) in [(0u64, -3i64), (1, 7), (W, 7), (W + 1, -3), (2 * W, 12)] {
        tc.q("i", set_call(col, "v", v)).await;
    }

    let QueryResult::SignedRow(sr) = tc.q("i", Call::new("Distinct").with_arg("field", "v")).await else {
        panic!()
    };
    assert_eq!(sr.pos, vec![7, 12]);
    assert_eq!(sr.neg, vec![3]);

    // Nested Count(Distinct) counts the positive side only.
    let counted = Call::new("Count").with_child(Call::new("Distinct").with_arg("field", "v"));
    assert_eq!(count_of(tc.q("i", counted).await), 2);
}

#[tokio::test]
async fn cross_index_distinct_joins_by_column() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "users");
    set_index(&tc, "events");
    tc.schema.create_field("users", FieldDef::set("active")).unwrap();
    tc.schema.create_field("events", FieldDef::set("kind")).unwrap();
    tc.schema.create_field("events", FieldDef::int("user_id", 0, 10_000)).unwrap();

    // Users 7 and W+9 are active; events reference users by id.
    seed_set_field(&tc, "users", "active", &[(1, 7), (1, W + 9), (1, 11)]).await;
    for (col, v) in [(0u64, 7i64), (1, 2000), (2, 7), (3, 11)] {
        tc.q("events", set_call(col, "user_id", v)).await;
    }
    seed_set_field(&tc, "events", "kind", &[(5, 0), (5, 1), (5, 2)]).await;

    // Active users that some `kind=5` event points at.
    let call = Call::new("Intersect")
        .with_child(row_call("active", 1u64))
        .with_child(
            Call::new("Distinct")
                .with_arg("index", "events")
                .with_arg("field", "user_id")
                .with_child(row_call("kind", 5u64)),
        );
    assert_eq!(cols(tc.q("users", call).await), vec![7]);
}

#[tokio::test]
async fn percentile_binary_search() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::int("v", 0, 1000)).unwrap();
    for (i, v) in [10i64, 20, 30, 40, 50, 60, 70, 80, 90, 100].iter().enumerate() {
        tc.q("i", set_call(i as u64 * W / 2, "v", *v)).await;
    }

    let pct = |nth: u64| Call::new("Percentile").with_arg("field", "v").with_arg("nth", nth);
    assert_eq!(valcount(tc.q("i", pct(0)).await).val, 10);
    assert_eq!(valcount(tc.q("i", pct(50)).await).val, 50);
    assert_eq!(valcount(tc.q("i", pct(100)).await).val, 100);

    let err = tc.run("i", pct(101)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn sort_by_bsi_field() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    tc.schema.create_field("i", FieldDef::int("v", 0, 100)).unwrap();
    seed_set_field(&tc, "i", "f", &[(1, 0), (1, 1), (1, W), (1, W + 1)]).await;
    for (col, v) in [(0u64, 40i64), (1, 10), (W, 30), (W + 1, 20)] {
        tc.q("i", set_call(col, "v", v)).await;
    }

    let sort = Call::new("Sort")
        .with_child(row_call("f", 1u64))
        .with_arg("field", "v")
        .with_arg("sort-desc", true)
        .with_arg("limit", 2u64);
    assert_eq!(cols(tc.q("i", sort).await), vec![0, W]);
}

#[tokio::test]
async fn extract_builds_a_table() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("tags")).unwrap();
    tc.schema.create_field("i", FieldDef::int("size", 0, 100)).unwrap();
    seed_set_field(&tc, "i", "tags", &[(1, 0), (2, 0), (1, W)]).await;
    tc.q("i", set_call(0, "size", 12i64)).await;

    let call = Call::new("Extract")
        .with_child(Call::const_row([0, W]))
        .with_child(Call::new("Rows").with_arg("field", "tags"))
        .with_child(Call::new("Rows").with_arg("field", "size"));
    let QueryResult::Table(t) = tc.q("i", call).await else { panic!() };
    assert_eq!(t.fields.len(), 2);
    assert_eq!(t.columns.len(), 2);
    assert_eq!(t.columns[0].column, 0);
    assert_eq!(
        t.columns[0].rows,
        vec![
            crate::result::ExtractedValue::Ids(vec![1, 2]),
            crate::result::ExtractedValue::Int(Some(12)),
        ]
    );
    assert_eq!(
        t.columns[1].rows,
        vec![
            crate::result::ExtractedValue::Ids(vec![1]),
            crate::result::ExtractedValue::Int(None),
        ]
    );
}

#[tokio::test]
async fn max_memory_budget_fails_extract() {
    let tc = TestCluster::new(1, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    for col in 0..64u64 {
        tc.q("i", set_call(col, "f", 1u64)).await;
    }
    let call = Call::new("Extract")
        .with_child(Call::new("All"))
        .with_child(Call::new("Rows").with_arg("field", "f"));
    let err = tc
        .coordinator()
        .execute("i", vec![call], QueryOptions { max_memory: Some(128), ..Default::default() })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
}

#[tokio::test]
async fn write_gate_enforced() {
    let schema = Arc::new(Schema::new());
    let registry = Arc::new(ShardRegistry::default());
    let translator = Arc::new(TranslateStore::new());
    let cluster = Arc::new(Cluster::single("solo"));
    let store = Arc::new(Store::new(schema.clone(), registry));
    let config = Config { max_writes_per_request: Some(2), ..Default::default() };
    let exec = Executor::new(store, translator, cluster, config);
    schema.create_index(IndexDef::new("i")).unwrap();
    schema.create_field("i", FieldDef::set("f")).unwrap();

    let writes: Vec<Call> = (0..3).map(|c| set_call(c, "f", 1u64)).collect();
    let err = exec.execute("i", writes, QueryOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
}

#[tokio::test]
async fn replica_failover_and_exhaustion() {
    let tc = TestCluster::new(2, 2);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    seed_set_field(&tc, "i", "f", &[(1, 0), (1, W + 1), (1, 3 * W)]).await;

    // Full replication: the coordinator prefers itself, so killing the peer
    // is survivable.
    tc.client.break_node("node1");
    assert_eq!(cols(tc.q("i", row_call("f", 1u64)).await), vec![0, W + 1, 3 * W]);
    tc.client.heal_node("node1");

    // With replica_n=1, a shard owned solely by the dead peer exhausts the
    // per-shard retry budget.
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    let peer_shard = (0..64u64)
        .find(|&s| tc.coordinator().cluster().replicas("i", s) == ["node1"])
        .expect("some shard lands on the peer");
    tc.q("i", set_call(peer_shard * W + 1, "f", 1u64)).await;
    tc.client.break_node("node1");
    let err = tc.run("i", row_call("f", 1u64)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}

#[tokio::test]
async fn shard_independence_matches_single_node() {
    let multi = TestCluster::new(3, 1);
    let single = TestCluster::new(1, 1);
    for tc in [&multi, &single] {
        set_index(tc, "i");
        tc.schema.create_field("i", FieldDef::set("f")).unwrap();
        tc.schema.create_field("i", FieldDef::int("v", 0, 500)).unwrap();
        seed_set_field(tc, "i", "f", &[(1, 0), (1, W + 1), (2, W + 1), (2, 4 * W)]).await;
        for (col, v) in [(0u64, 17i64), (W + 1, 3), (4 * W, 17)] {
            tc.q("i", set_call(col, "v", v)).await;
        }
    }
    let queries = [
        Call::new("Count").with_child(row_call("f", 1u64)),
        Call::new("Sum").with_arg("field", "v"),
        row_call("v", cond(CmpOp::Gte, 10)),
        Call::new("Distinct").with_arg("field", "v"),
    ];
    for q in queries {
        let label = q.to_string();
        assert_eq!(multi.q("i", q.clone()).await, single.q("i", q).await, "{label}");
    }
}

#[tokio::test]
async fn existence_complement_invariant() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    seed_set_field(&tc, "i", "f", &[(1, 0), (1, W), (2, 5), (3, 2 * W + 2)]).await;

    let r = row_call("f", 1u64);
    let not_r = Call::new("Not").with_child(r.clone());
    let union = Call::new("Union").with_child(r.clone()).with_child(not_r.clone());
    let all = Call::new("All");
    assert_eq!(
        count_of(tc.q("i", Call::new("Count").with_child(union)).await),
        cols(tc.q("i", all).await).len() as u64,
    );
    let overlap = Call::new("Intersect").with_child(r).with_child(not_r);
    assert_eq!(count_of(tc.q("i", Call::new("Count").with_child(overlap)).await), 0);
}

#[tokio::test]
async fn bsi_equality_decomposes_into_bounds() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::int("v", -100, 100)).unwrap();
    for (col, v) in [(0u64, -7i64), (1, 0), (2, 13), (W, 13), (W + 1, -7)] {
        tc.q("i", set_call(col, "v", v)).await;
    }
    for x in [-7i64, 0, 13, 5] {
        let eq = row_call("v", cond(CmpOp::Eq, x));
        let both = Call::new("Intersect")
            .with_child(row_call("v", cond(CmpOp::Gte, x)))
            .with_child(row_call("v", cond(CmpOp::Lte, x)));
        assert_eq!(cols(tc.q("i", eq).await), cols(tc.q("i", both).await), "x={x}");
    }
    // != null covers exactly the valued columns.
    let not_null = row_call("v", Condition::Cmp { op: CmpOp::Neq, value: Literal::Null });
    assert_eq!(cols(tc.q("i", not_null).await).len(), 5);
}

#[tokio::test]
async fn groupby_invariant_counts_total() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::mutex("m")).unwrap();
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    let bits = [(0u64, 0u64), (0, 1), (1, W), (2, W + 1), (2, 3 * W)];
    for &(row, col) in &bits {
        tc.q("i", set_call(col, "m", row)).await;
        tc.q("i", set_call(col, "f", 9u64)).await;
    }

    let gb = Call::new("GroupBy").with_child(Call::new("Rows").with_arg("field", "m"));
    let QueryResult::GroupCounts(gc) = tc.q("i", gb).await else { panic!() };
    let total: u64 = gc.groups.iter().map(|g| g.count).sum();
    assert_eq!(total, count_of(tc.q("i", Call::new("Count").with_child(row_call("f", 9u64))).await));
}

#[tokio::test]
async fn groupby_count_distinct_deduplicates_across_shards() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("g")).unwrap();
    tc.schema.create_field("i", FieldDef::int("v", 0, 100)).unwrap();
    seed_set_field(&tc, "i", "g", &[(1, 0), (1, W), (2, 2)]).await;
    for (col, v) in [(0u64, 7i64), (W, 7), (2, 9)] {
        tc.q("i", set_call(col, "v", v)).await;
    }

    let gb = Call::new("GroupBy")
        .with_child(Call::new("Rows").with_arg("field", "g"))
        .with_arg(
            "aggregate",
            Call::new("Count").with_child(Call::new("Distinct").with_arg("field", "v")),
        );
    let QueryResult::GroupCounts(gc) = tc.q("i", gb).await else { panic!() };
    assert_eq!(gc.aggregate.as_deref(), Some("count"));
    let flat: Vec<(u64, u64, i64)> = gc
        .groups
        .iter()
        .map(|g| (g.group[0].row_id, g.count, g.agg.unwrap()))
        .collect();
    // Value 7 appears in two shards of group 1 but counts once.
    assert_eq!(flat, vec![(1, 2, 1), (2, 1, 1)]);
}

#[tokio::test]
async fn groupby_over_integer_dimension() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::int("v", -10, 10)).unwrap();
    for (col, v) in [(0u64, 2i64), (1, 5), (2, -1), (W, 2)] {
        tc.q("i", set_call(col, "v", v)).await;
    }

    let gb = Call::new("GroupBy").with_child(Call::new("Rows").with_arg("field", "v"));
    let QueryResult::GroupCounts(gc) = tc.q("i", gb).await else { panic!() };
    let flat: Vec<(i64, u64)> = gc
        .groups
        .iter()
        .map(|g| (g.group[0].value.unwrap(), g.count))
        .collect();
    // Integer dimensions come back in value order, nulls excluded.
    assert_eq!(flat, vec![(-1, 1), (2, 2), (5, 1)]);
}

#[tokio::test]
async fn timestamp_fields_compare_and_shape() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::timestamp("ts", TimeUnit::Seconds)).unwrap();
    let stamps = ["2020-01-01T00:00:00Z", "2021-06-15T12:00:00Z", "2022-01-01T00:00:00Z"];
    for (col, s) in stamps.iter().enumerate() {
        tc.q("i", Call::new("Set").with_arg("column", col as u64).with_arg("ts", *s)).await;
    }

    let after = Call::new("Row").with_arg(
        "ts",
        Condition::Cmp { op: CmpOp::Gt, value: Literal::Str("2021-01-01T00:00:00Z".into()) },
    );
    assert_eq!(cols(tc.q("i", after).await), vec![1, 2]);

    let min = valcount(tc.q("i", Call::new("Min").with_arg("field", "ts")).await);
    assert_eq!(min.timestamp_val.unwrap().to_rfc3339(), "2020-01-01T00:00:00+00:00");
}

#[tokio::test]
async fn decimal_fields_scale_and_sum() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    let dec = FieldDef {
        name: "price".into(),
        field_type: FieldType::Decimal {
            min: Decimal::new(0, 2),
            max: Decimal::new(1_000_00, 2),
            scale: 2,
        },
    };
    tc.schema.create_field("i", dec).unwrap();
    for (col, unscaled) in [(0u64, 150i64), (1, 275), (W, 1000)] {
        let d = Decimal::new(unscaled, 2);
        tc.q("i", Call::new("Set").with_arg("column", col).with_arg("price", Arg::Literal(Literal::Decimal(d))))
            .await;
    }

    let sum = valcount(tc.q("i", Call::new("Sum").with_arg("field", "price")).await);
    assert_eq!(sum.val, 1425);
    assert_eq!(sum.decimal_val, Some(Decimal::new(1425, 2)));

    // Int literals scale up for comparisons: price > 2 means > 2.00.
    let over_two = row_call("price", cond(CmpOp::Gt, 2));
    assert_eq!(cols(tc.q("i", over_two).await), vec![1, W]);
}

#[tokio::test]
async fn time_quantum_ranged_reads() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema
        .create_field("i", FieldDef::time("seen", "YMD".parse().unwrap()))
        .unwrap();
    let writes = [
        (0u64, "2019-03-02T10:00:00Z"),
        (1, "2019-03-05T00:00:00Z"),
        (W, "2019-04-01T00:00:00Z"),
    ];
    for (col, when) in writes {
        tc.q(
            "i",
            Call::new("Set")
                .with_arg("column", col)
                .with_arg("seen", 8u64)
                .with_arg("timestamp", when),
        )
        .await;
    }

    let ranged = Call::new("Row")
        .with_arg("seen", 8u64)
        .with_arg("from", "2019-03-01T00:00:00Z")
        .with_arg("to", "2019-03-31T00:00:00Z");
    assert_eq!(cols(tc.q("i", ranged).await), vec![0, 1]);
    // Un-ranged reads hit the standard view.
    assert_eq!(cols(tc.q("i", row_call("seen", 8u64)).await), vec![0, 1, W]);
}

#[tokio::test]
async fn options_pins_the_shard_set() {
    let tc = TestCluster::new(3, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    seed_set_field(&tc, "i", "f", &[(1, 0), (1, W + 1), (1, 2 * W + 2)]).await;

    let call = Call::new("Options")
        .with_child(row_call("f", 1u64))
        .with_arg("shards", Literal::IdList(vec![0, 2]));
    assert_eq!(cols(tc.q("i", call).await), vec![0, 2 * W + 2]);
}

#[tokio::test]
async fn groupby_having_and_sort() {
    let tc = TestCluster::new(2, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("g")).unwrap();
    seed_set_field(
        &tc,
        "i",
        "g",
        &[(1, 0), (1, 1), (1, 2), (2, 3), (3, W), (3, W + 1)],
    )
    .await;

    let gb = Call::new("GroupBy")
        .with_child(Call::new("Rows").with_arg("field", "g"))
        .with_arg("having", Call::new("Condition").with_arg("count", cond(CmpOp::Gte, 2)))
        .with_arg("sort", "count desc");
    let QueryResult::GroupCounts(gc) = tc.q("i", gb).await else { panic!() };
    let flat: Vec<(u64, u64)> = gc.groups.iter().map(|g| (g.group[0].row_id, g.count)).collect();
    assert_eq!(flat, vec![(1, 3), (3, 2)]);
}

#[tokio::test]
async fn deadline_and_empty_operands() {
    let tc = TestCluster::new(1, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();

    let opts = QueryOptions {
        deadline: Some(std::time::Instant::now() - std::time::Duration::from_millis(1)),
        ..Default::default()
    };
    let err = tc
        .coordinator()
        .execute("i", vec![row_call("f", 1u64)], opts)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

    let err = tc.run("i", Call::new("Intersect")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn external_lookup_requires_configuration() {
    let tc = TestCluster::new(1, 1);
    set_index(&tc, "i");
    tc.schema.create_field("i", FieldDef::set("f")).unwrap();
    let call = Call::new("ExternalLookup")
        .with_child(Call::new("All"))
        .with_arg("query", "select * from t where id = any($1)");
    assert_eq!(tc.run("i", call).await.unwrap_err().kind(), ErrorKind::PreconditionFailed);
}
