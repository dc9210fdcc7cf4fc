//! Variable propagation across blocks: uid variables, value variables,
//! aggregation, math over foreign bindings, dependency ordering.

use serde_json::json;
use umbra::query::ast::{AggOp, Attr, Function, MathOp, UidArg};
use umbra::query::builder::{filters, math as m};
use umbra::query::{BlockBuilder, ExecOptions, Executor, FacetReq, QueryBuilder, Sel};
use umbra::schema::{PredicateSchema, Schema};
use umbra::store::MemStore;
use umbra::types::{CompareOp, TypedValue, Uid, ValueType};

fn fixture() -> MemStore {
    let schema = Schema::new()
        .predicate(PredicateSchema::new("name", ValueType::String).indexed())
        .predicate(PredicateSchema::new("age", ValueType::Int).indexed())
        .predicate(PredicateSchema::new("friend", ValueType::Uid).list());
    let mut s = MemStore::new(schema);
    for (uid, name, age) in [
        (1u64, "Michonne", 38i64),
        (23, "Rick Grimes", 15),
        (24, "Glenn Rhee", 15),
        (25, "Daryl Dixon", 17),
        (31, "Andrea", 19),
    ] {
        s.put_value(Uid(uid), "name", TypedValue::Str(name.into()));
        s.put_value(Uid(uid), "age", TypedValue::Int(age));
    }
    for target in [23u64, 24, 25, 31] {
        s.add_edge(Uid(1), "friend", Uid(target));
    }
    s.add_edge(Uid(23), "friend", Uid(1));
    s
}

fn run(store: &MemStore, q: umbra::query::Query) -> serde_json::Value {
    Executor::new(store, store.schema()).execute(&q).unwrap()
}

#[test]
fn uid_variable_feeds_a_later_block() {
    let store = fixture();
    let q = QueryBuilder::new()
        .block(
            BlockBuilder::new("friends", Function::Uid(vec![UidArg::Var("F".into())]))
                .order_asc("name")
                .select(Sel::pred("name")),
        )
        .block(
            BlockBuilder::var("v", Function::Uid(vec![UidArg::Lit(Uid(1))]))
                .select(Sel::pred("friend").bind("F")),
        )
        .build()
        .unwrap();
    let out = run(&store, q);
    // Declaration order decides output; execution order follows dependencies.
    assert_eq!(
        out,
        json!({
            "friends": [
                { "name": "Andrea" },
                { "name": "Daryl Dixon" },
                { "name": "Glenn Rhee" },
                { "name": "Rick Grimes" },
            ]
        })
    );
}

#[test]
fn value_variable_orders_and_projects() {
    let store = fixture();
    let q = QueryBuilder::new()
        .block(
            BlockBuilder::var("v", Function::Has(Attr::new("name")))
                .select(Sel::pred("age").bind("A")),
        )
        .block(
            BlockBuilder::new("byAge", Function::Uid(vec![UidArg::Var("A".into())]))
                .order_desc_val("A")
                .select(Sel::pred("name"))
                .select(Sel::val("A").alias("age")),
        )
        .build()
        .unwrap();
    let out = run(&store, q);
    assert_eq!(
        out["byAge"],
        json!([
            { "name": "Michonne", "age": 38 },
            { "name": "Andrea", "age": 19 },
            { "name": "Daryl Dixon", "age": 17 },
            { "name": "Rick Grimes", "age": 15 },
            { "name": "Glenn Rhee", "age": 15 },
        ])
    );
}

#[test]
fn aggregates_over_expanded_descendants() {
    let store = fixture();
    let q = QueryBuilder::new()
        .block(
            BlockBuilder::new("me", Function::Uid(vec![UidArg::Lit(Uid(1))]))
                .select(Sel::pred("friend").child(Sel::pred("age").bind("a")))
                .select(Sel::agg(AggOp::Min, "a").alias("minAge"))
                .select(Sel::agg(AggOp::Max, "a").alias("maxAge"))
                .select(Sel::agg(AggOp::Sum, "a").alias("sumAge"))
                .select(Sel::agg(AggOp::Avg, "a").alias("avgAge")),
        )
        .build()
        .unwrap();
    let out = run(&store, q);
    let me = &out["me"][0];
    assert_eq!(me["minAge"], json!(15));
    assert_eq!(me["maxAge"], json!(19));
    assert_eq!(me["sumAge"], json!(66));
    assert_eq!(me["avgAge"], json!(16.5));
}

#[test]
fn count_bound_at_the_root_feeds_math_elsewhere() {
    let store = fixture();
    let q = QueryBuilder::new()
        .block(
            BlockBuilder::var("v", Function::Has(Attr::new("name")))
                .select(Sel::count_uid().bind("total")),
        )
        .block(
            BlockBuilder::new("me", Function::Uid(vec![UidArg::Lit(Uid(1))]))
                .select(Sel::math(m::bin(MathOp::Mul, m::val("total"), m::int(2))).alias("doubled")),
        )
        .build()
        .unwrap();
    let out = run(&store, q);
    // `total` is keyed under the whole-block binding, disjoint from uid 1,
    // so it reads as the sum of its values.
    assert_eq!(out["me"][0]["doubled"], json!(10));
}

#[test]
fn per_node_counts_feed_math() {
    let store = fixture();
    let q = QueryBuilder::new()
        .block(
            BlockBuilder::var("v", Function::Has(Attr::new("name")))
                .select(Sel::count_pred("friend").bind("fc")),
        )
        .block(
            BlockBuilder::new("me", Function::Uid(vec![UidArg::Lit(Uid(1))]))
                .select(Sel::math(m::bin(MathOp::Add, m::val("fc"), m::int(1))).alias("n")),
        )
        .build()
        .unwrap();
    let out = run(&store, q);
    assert_eq!(out["me"][0]["n"], json!(5));
}

#[test]
fn len_filter_compares_a_variable_binding_count() {
    let store = fixture();
    let q = QueryBuilder::new()
        .block(
            BlockBuilder::var("v", Function::Uid(vec![UidArg::Lit(Uid(1))]))
                .select(Sel::pred("friend").bind("F")),
        )
        .block(
            BlockBuilder::new("some", Function::Uid(vec![UidArg::Lit(Uid(1))]))
                .filter(filters::func(Function::LenCmp(CompareOp::Eq, "F".into(), 4)))
                .select(Sel::pred("name")),
        )
        .block(
            BlockBuilder::new("none", Function::Uid(vec![UidArg::Lit(Uid(1))]))
                .filter(filters::func(Function::LenCmp(CompareOp::Gt, "F".into(), 10)))
                .select(Sel::pred("name")),
        )
        .build()
        .unwrap();
    let out = run(&store, q);
    assert_eq!(out["some"], json!([{ "name": "Michonne" }]));
    assert_eq!(out["none"], json!([]));
}

#[test]
fn facet_bindings_key_by_destination_uid() {
    let schema = Schema::new()
        .predicate(PredicateSchema::new("name", ValueType::String).indexed())
        .predicate(PredicateSchema::new("path", ValueType::Uid).list());
    let mut store = MemStore::new(schema);
    store.put_value(Uid(1), "name", TypedValue::Str("A".into()));
    store.put_value(Uid(2), "name", TypedValue::Str("B".into()));
    store.put_value(Uid(3), "name", TypedValue::Str("C".into()));
    store.add_edge_facets(Uid(1), "path", Uid(2), [("weight", TypedValue::Float(0.1))]);
    store.add_edge_facets(Uid(1), "path", Uid(3), [("weight", TypedValue::Float(0.5))]);
    store.add_edge_facets(Uid(2), "path", Uid(3), [("weight", TypedValue::Float(0.25))]);

    let q = QueryBuilder::new()
        .block(
            BlockBuilder::var("v", Function::Uid(vec![UidArg::Lit(Uid(1)), UidArg::Lit(Uid(2))]))
                .select(Sel::pred("path").facets(FacetReq::new().bind("W", "weight"))),
        )
        .block(
            BlockBuilder::new("weights", Function::Uid(vec![UidArg::Var("W".into())]))
                .order_asc_val("W")
                .select(Sel::pred("name"))
                .select(Sel::val("W").alias("weight")),
        )
        .build()
        .unwrap();
    let out = run(&store, q);
    // Uid 3 is reached twice; its numeric bindings accumulate.
    assert_eq!(
        out["weights"],
        json!([
            { "name": "B", "weight": 0.1 },
            { "name": "C", "weight": 0.75 },
        ])
    );
}

#[test]
fn cyclic_dependencies_fail_before_execution() {
    let store = fixture();
    let q = QueryBuilder::new()
        .block(
            BlockBuilder::var("a", Function::Uid(vec![UidArg::Var("Y".into())]))
                .select(Sel::pred("friend").bind("X")),
        )
        .block(
            BlockBuilder::var("b", Function::Uid(vec![UidArg::Var("X".into())]))
                .select(Sel::pred("friend").bind("Y")),
        )
        .build()
        .unwrap();
    let err = Executor::new(&store, store.schema()).execute(&q).unwrap_err();
    assert_eq!(err.code(), "CyclicVariableDependency");
}

#[test]
fn independent_blocks_agree_under_concurrency() {
    let store = fixture();
    let build = || {
        QueryBuilder::new()
            .block(
                BlockBuilder::new("everyone", Function::Has(Attr::new("name")))
                    .select(Sel::pred("name")),
            )
            .block(
                BlockBuilder::new("teens", Function::Has(Attr::new("name")))
                    .filter(filters::func(Function::Cmp(
                        CompareOp::Lt,
                        Attr::new("age"),
                        umbra::query::ast::FuncArg::Lit(TypedValue::Int(18)),
                    )))
                    .select(Sel::pred("name")),
            )
            .build()
            .unwrap()
    };
    let sequential = Executor::new(&store, store.schema())
        .options(ExecOptions::new().max_concurrency(1))
        .execute(&build())
        .unwrap();
    let concurrent = Executor::new(&store, store.schema())
        .options(ExecOptions::new().max_concurrency(4))
        .execute(&build())
        .unwrap();
    assert_eq!(sequential, concurrent);
}
