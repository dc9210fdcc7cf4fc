//! Storage read interface consumed by the query pipeline.
//!
//! The executor never mutates storage; it reads postings through
//! [`ReadStore`] at a timestamp pinned once per query from the
//! [`Allocator`]. Index-backed and scan-backed evaluation share one code
//! path here, so a predicate without an index answers every function with
//! identical semantics.

use smallvec::SmallVec;

use crate::types::{TypedValue, Uid};

pub mod memory;

pub use memory::{MemStore, SeqAllocator};

/// One facet attached to a posting.
#[derive(Clone, Debug, PartialEq)]
pub struct Facet {
    /// Facet key.
    pub key: String,
    /// Facet value.
    pub value: TypedValue,
}

/// Facet list; almost always zero to two entries.
pub type Facets = SmallVec<[Facet; 2]>;

/// A scalar posting: value, optional language tag, facets.
#[derive(Clone, Debug, PartialEq)]
pub struct ValuePosting {
    /// Stored value.
    pub value: TypedValue,
    /// Language tag; `None` is the untagged value.
    pub lang: Option<String>,
    /// Facets on this posting.
    pub facets: Facets,
}

impl ValuePosting {
    /// Untagged, facet-free posting.
    pub fn plain(value: TypedValue) -> Self {
        ValuePosting { value, lang: None, facets: Facets::new() }
    }
}

/// A uid-edge posting: target node plus facets.
#[derive(Clone, Debug, PartialEq)]
pub struct EdgePosting {
    /// Destination node.
    pub target: Uid,
    /// Facets on this edge.
    pub facets: Facets,
}

impl EdgePosting {
    /// Facet-free edge.
    pub fn plain(target: Uid) -> Self {
        EdgePosting { target, facets: Facets::new() }
    }
}

/// Postings for one (subject, predicate) pair.
#[derive(Clone, Debug, PartialEq)]
pub enum Postings {
    /// Scalar values (one, or several for list predicates / language tags).
    Values(Vec<ValuePosting>),
    /// Outgoing edges, in insertion order.
    Edges(Vec<EdgePosting>),
}

impl Postings {
    /// Scalar postings, empty for edge postings.
    pub fn values(&self) -> &[ValuePosting] {
        match self {
            Postings::Values(v) => v,
            Postings::Edges(_) => &[],
        }
    }

    /// Edge postings, empty for scalar postings.
    pub fn edges(&self) -> &[EdgePosting] {
        match self {
            Postings::Edges(e) => e,
            Postings::Values(_) => &[],
        }
    }
}

/// Point-in-time read interface over the graph.
pub trait ReadStore: Send + Sync {
    /// Postings for `(uid, pred)`, if any.
    fn postings(&self, uid: Uid, pred: &str) -> Option<&Postings>;

    /// Subjects pointing at `uid` through `pred`, ascending.
    fn reverse_edges(&self, uid: Uid, pred: &str) -> Vec<Uid>;

    /// Subjects holding any posting for `pred`, ascending.
    fn subjects_with(&self, pred: &str) -> Vec<Uid>;

    /// Every subject in the store, ascending.
    fn all_subjects(&self) -> Vec<Uid>;
}

/// Identifier and timestamp assignment.
///
/// The executor pins one read timestamp per query; uid and namespace blocks
/// serve the write path this crate does not implement but the interface is
/// part of the storage contract.
pub trait Allocator: Send + Sync {
    /// Reserves `n` fresh uids, returning the first of a contiguous block.
    fn assign_uids(&self, n: u64) -> Uid;

    /// Issues a timestamp; read-only requests may share the latest issued
    /// one, writes always get a fresh value.
    fn assign_timestamp(&self, read_only: bool) -> u64;

    /// Reserves `n` fresh namespace ids, returning the first.
    fn assign_namespace_ids(&self, n: u64) -> u64;
}
