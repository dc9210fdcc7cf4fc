//! Property tests over the execution pipeline.

use proptest::prelude::*;
use umbra::query::ast::{AggOp, Attr, Function, UidArg};
use umbra::query::{BlockBuilder, Executor, QueryBuilder, Sel};
use umbra::schema::{PredicateSchema, Schema};
use umbra::store::MemStore;
use umbra::types::{TypedValue, Uid, ValueType};

fn scalar_store(values: &[i64]) -> MemStore {
    let schema = Schema::new().predicate(PredicateSchema::new("v", ValueType::Int).indexed());
    let mut store = MemStore::new(schema);
    for (i, &v) in values.iter().enumerate() {
        store.put_value(Uid(i as u64 + 1), "v", TypedValue::Int(v));
    }
    store
}

fn graph_store(n: usize, named: &[bool], edges: &[(usize, usize)]) -> MemStore {
    let schema = Schema::new()
        .predicate(PredicateSchema::new("name", ValueType::String).indexed())
        .predicate(PredicateSchema::new("age", ValueType::Int))
        .predicate(PredicateSchema::new("friend", ValueType::Uid).list());
    let mut store = MemStore::new(schema);
    for i in 0..n {
        let uid = Uid(i as u64 + 1);
        if named[i] {
            store.put_value(uid, "name", TypedValue::Str(format!("n{i}")));
        }
        store.put_value(uid, "age", TypedValue::Int(i as i64));
    }
    for &(a, b) in edges {
        store.add_edge(Uid(a as u64 + 1), "friend", Uid(b as u64 + 1));
    }
    store
}

fn block_uids(out: &serde_json::Value, key: &str) -> Vec<String> {
    out[key]
        .as_array()
        .map(|a| a.iter().filter_map(|n| n["uid"].as_str().map(str::to_owned)).collect())
        .unwrap_or_default()
}

proptest! {
    #[test]
    fn pagination_is_a_window_over_the_ordered_set(
        values in proptest::collection::vec(-50i64..50, 0..20),
        first in 0i64..30,
        offset in -10i64..30,
    ) {
        let store = scalar_store(&values);
        let q = QueryBuilder::new()
            .block(
                BlockBuilder::new("q", Function::Has(Attr::new("v")))
                    .offset(offset)
                    .first(first)
                    .select(Sel::uid()),
            )
            .build()
            .unwrap();
        let out = Executor::new(&store, store.schema()).execute(&q).unwrap();
        let got = block_uids(&out, "q");
        let expected: Vec<String> = (1..=values.len() as u64)
            .map(|u| Uid(u).to_hex())
            .skip(offset.max(0) as usize)
            .take(first as usize)
            .collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn between_matches_a_manual_range_check(
        values in proptest::collection::vec(-20i64..20, 0..20),
        lo in -25i64..25,
        hi in -25i64..25,
    ) {
        let store = scalar_store(&values);
        let q = QueryBuilder::new()
            .block(
                BlockBuilder::new(
                    "q",
                    Function::Between(Attr::new("v"), TypedValue::Int(lo), TypedValue::Int(hi)),
                )
                .select(Sel::uid()),
            )
            .build()
            .unwrap();
        let out = Executor::new(&store, store.schema()).execute(&q).unwrap();
        let got = block_uids(&out, "q");
        let expected: Vec<String> = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| lo <= v && v <= hi)
            .map(|(i, _)| Uid(i as u64 + 1).to_hex())
            .collect();
        prop_assert_eq!(got, expected);
        if lo > hi {
            prop_assert!(out["q"].as_array().unwrap().is_empty());
        }
    }

    #[test]
    fn cascade_never_adds_results(
        n in 1usize..12,
        seed in proptest::collection::vec((0usize..12, 0usize..12, any::<bool>()), 0..24),
    ) {
        let named: Vec<bool> = (0..n).map(|i| i % 3 != 0).collect();
        let edges: Vec<(usize, usize)> = seed
            .iter()
            .filter(|(a, b, keep)| *keep && *a < n && *b < n && a != b)
            .map(|(a, b, _)| (*a, *b))
            .collect();
        let store = graph_store(n, &named, &edges);
        let build = |cascade: bool| {
            let mut b = BlockBuilder::new("q", Function::Has(Attr::new("name")))
                .select(Sel::uid())
                .select(Sel::pred("name"))
                .select(Sel::pred("friend").child(Sel::pred("name")));
            if cascade {
                b = b.cascade();
            }
            QueryBuilder::new().block(b).build().unwrap()
        };
        let exec = Executor::new(&store, store.schema());
        let plain = block_uids(&exec.execute(&build(false)).unwrap(), "q");
        let cascaded = block_uids(&exec.execute(&build(true)).unwrap(), "q");
        prop_assert!(cascaded.len() <= plain.len());
        // Cascade filters; it never reorders or invents nodes.
        prop_assert!(cascaded.iter().all(|u| plain.contains(u)));
    }

    #[test]
    fn min_never_exceeds_max(
        ages in proptest::collection::vec(0i64..100, 1..10),
    ) {
        let schema = Schema::new()
            .predicate(PredicateSchema::new("age", ValueType::Int))
            .predicate(PredicateSchema::new("friend", ValueType::Uid).list());
        let mut store = MemStore::new(schema);
        for (i, &a) in ages.iter().enumerate() {
            let uid = Uid(i as u64 + 2);
            store.put_value(uid, "age", TypedValue::Int(a));
            store.add_edge(Uid(1), "friend", uid);
        }
        let q = QueryBuilder::new()
            .block(
                BlockBuilder::new("me", Function::Uid(vec![UidArg::Lit(Uid(1))]))
                    .select(Sel::pred("friend").child(Sel::pred("age").bind("a")))
                    .select(Sel::agg(AggOp::Min, "a").alias("lo"))
                    .select(Sel::agg(AggOp::Max, "a").alias("hi")),
            )
            .build()
            .unwrap();
        let out = Executor::new(&store, store.schema()).execute(&q).unwrap();
        let lo = out["me"][0]["lo"].as_i64().unwrap();
        let hi = out["me"][0]["hi"].as_i64().unwrap();
        prop_assert!(lo <= hi);
        prop_assert_eq!(lo, *ages.iter().min().unwrap());
        prop_assert_eq!(hi, *ages.iter().max().unwrap());
    }
}
