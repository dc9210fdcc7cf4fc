//! In-memory store backend.
//!
//! `MemStore` is the reference [`ReadStore`]: it is populated up front and
//! read concurrently afterwards, which gives every query a consistent
//! point-in-time view for free. Reverse adjacency is maintained at insert
//! time for predicates whose schema asks for it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;

use crate::schema::Schema;
use crate::types::{TypedValue, Uid};

use super::{Allocator, EdgePosting, Facet, Facets, Postings, ReadStore, ValuePosting};

/// In-memory graph store.
#[derive(Debug, Default)]
pub struct MemStore {
    schema: Schema,
    nodes: FxHashMap<Uid, FxHashMap<String, Postings>>,
    reverse: FxHashMap<Uid, FxHashMap<String, BTreeSet<Uid>>>,
    by_pred: FxHashMap<String, BTreeSet<Uid>>,
    subjects: BTreeSet<Uid>,
}

impl MemStore {
    /// Empty store over `schema`.
    pub fn new(schema: Schema) -> Self {
        MemStore { schema, ..MemStore::default() }
    }

    /// The store's schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Sets an untagged scalar value. Non-list predicates replace any
    /// previous untagged value; list predicates append.
    pub fn put_value(&mut self, uid: Uid, pred: &str, value: TypedValue) {
        self.put_posting(uid, pred, ValuePosting::plain(value));
    }

    /// Sets a language-tagged scalar value, replacing a previous value with
    /// the same tag.
    pub fn put_value_lang(&mut self, uid: Uid, pred: &str, lang: &str, value: TypedValue) {
        self.put_posting(
            uid,
            pred,
            ValuePosting { value, lang: Some(lang.to_owned()), facets: Facets::new() },
        );
    }

    /// Sets an untagged scalar value carrying facets.
    pub fn put_value_facets(
        &mut self,
        uid: Uid,
        pred: &str,
        value: TypedValue,
        facets: impl IntoIterator<Item = (&'static str, TypedValue)>,
    ) {
        self.put_posting(
            uid,
            pred,
            ValuePosting { value, lang: None, facets: collect_facets(facets) },
        );
    }

    /// Adds a uid edge.
    pub fn add_edge(&mut self, uid: Uid, pred: &str, target: Uid) {
        self.add_edge_posting(uid, pred, EdgePosting::plain(target));
    }

    /// Adds a uid edge carrying facets.
    pub fn add_edge_facets(
        &mut self,
        uid: Uid,
        pred: &str,
        target: Uid,
        facets: impl IntoIterator<Item = (&'static str, TypedValue)>,
    ) {
        self.add_edge_posting(uid, pred, EdgePosting { target, facets: collect_facets(facets) });
    }

    fn put_posting(&mut self, uid: Uid, pred: &str, posting: ValuePosting) {
        let list = self.schema.get(pred).is_some_and(|p| p.list);
        self.touch(uid, pred);
        let entry = self
            .nodes
            .entry(uid)
            .or_default()
            .entry(pred.to_owned())
            .or_insert_with(|| Postings::Values(Vec::new()));
        let Postings::Values(values) = entry else {
            return;
        };
        if !list {
            values.retain(|v| v.lang != posting.lang);
        }
        values.push(posting);
    }

    fn add_edge_posting(&mut self, uid: Uid, pred: &str, posting: EdgePosting) {
        let reverse = self.schema.get(pred).is_some_and(|p| p.reverse);
        self.touch(uid, pred);
        if reverse {
            self.reverse
                .entry(posting.target)
                .or_default()
                .entry(pred.to_owned())
                .or_default()
                .insert(uid);
            self.subjects.insert(posting.target);
        }
        let entry = self
            .nodes
            .entry(uid)
            .or_default()
            .entry(pred.to_owned())
            .or_insert_with(|| Postings::Edges(Vec::new()));
        if let Postings::Edges(edges) = entry {
            edges.push(posting);
        }
    }

    fn touch(&mut self, uid: Uid, pred: &str) {
        self.subjects.insert(uid);
        self.by_pred.entry(pred.to_owned()).or_default().insert(uid);
    }
}

impl ReadStore for MemStore {
    fn postings(&self, uid: Uid, pred: &str) -> Option<&Postings> {
        self.nodes.get(&uid)?.get(pred)
    }

    fn reverse_edges(&self, uid: Uid, pred: &str) -> Vec<Uid> {
        self.reverse
            .get(&uid)
            .and_then(|m| m.get(pred))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    fn subjects_with(&self, pred: &str) -> Vec<Uid> {
        self.by_pred
            .get(pred)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    fn all_subjects(&self) -> Vec<Uid> {
        self.subjects.iter().copied().collect()
    }
}

fn collect_facets(facets: impl IntoIterator<Item = (&'static str, TypedValue)>) -> Facets {
    facets
        .into_iter()
        .map(|(key, value)| Facet { key: key.to_owned(), value })
        .collect()
}

/// Monotonic in-process [`Allocator`].
#[derive(Debug)]
pub struct SeqAllocator {
    next_uid: AtomicU64,
    next_ts: AtomicU64,
    next_ns: AtomicU64,
}

impl Default for SeqAllocator {
    fn default() -> Self {
        // Uid 0 is reserved for whole-block bindings, namespace 0 for the
        // default namespace.
        SeqAllocator {
            next_uid: AtomicU64::new(1),
            next_ts: AtomicU64::new(1),
            next_ns: AtomicU64::new(1),
        }
    }
}

impl SeqAllocator {
    /// Allocator with all counters at their initial values.
    pub fn new() -> Self {
        SeqAllocator::default()
    }
}

impl Allocator for SeqAllocator {
    fn assign_uids(&self, n: u64) -> Uid {
        Uid(self.next_uid.fetch_add(n, Ordering::Relaxed))
    }

    fn assign_timestamp(&self, read_only: bool) -> u64 {
        if read_only {
            // Readers share the latest issued timestamp.
            self.next_ts.load(Ordering::Acquire).saturating_sub(1).max(1)
        } else {
            self.next_ts.fetch_add(1, Ordering::AcqRel)
        }
    }

    fn assign_namespace_ids(&self, n: u64) -> u64 {
        self.next_ns.fetch_add(n, Ordering::Relaxed)
    }
}
