//! Predicate schema registry.
//!
//! The executor consults the schema for value types, list-ness, and which
//! access paths a predicate supports. Sorting by a predicate that is not
//! registered here is a fatal error.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::types::{QueryError, Result, ValueType};

/// Predicate holding a node's type names, consulted by the `type()` root
/// function.
pub const TYPE_PREDICATE: &str = "node.type";

/// Per-predicate schema entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PredicateSchema {
    /// Predicate name.
    pub name: String,
    /// Value type of stored postings ([`ValueType::Uid`] for edges).
    pub value_type: ValueType,
    /// Multiple values per subject.
    #[serde(default)]
    pub list: bool,
    /// Value index exists (enables index-driven root lookups; scans cover
    /// the rest with identical semantics).
    #[serde(default)]
    pub indexed: bool,
    /// Language-tagged variants are stored.
    #[serde(default)]
    pub lang: bool,
    /// Reverse edges are maintained (`~pred` traversal).
    #[serde(default)]
    pub reverse: bool,
    /// Count index exists (per-subject fanout lookups at the root).
    #[serde(default)]
    pub count_index: bool,
}

impl PredicateSchema {
    /// New scalar or edge predicate with all access flags off.
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        PredicateSchema {
            name: name.into(),
            value_type,
            list: false,
            indexed: false,
            lang: false,
            reverse: false,
            count_index: false,
        }
    }

    /// Marks the predicate list-valued.
    pub fn list(mut self) -> Self {
        self.list = true;
        self
    }

    /// Enables the value index.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Enables language-tagged storage.
    pub fn lang(mut self) -> Self {
        self.lang = true;
        self
    }

    /// Enables reverse-edge maintenance (edges only).
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Enables the count index.
    pub fn count_index(mut self) -> Self {
        self.count_index = true;
        self
    }
}

/// Registry of predicate schemas keyed by name. Serializes as a name-keyed
/// map, which is the on-disk schema format.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    preds: FxHashMap<String, PredicateSchema>,
}

impl Schema {
    /// Empty schema.
    pub fn new() -> Self {
        Schema::default()
    }

    /// Registers a predicate, replacing any previous entry of the same name.
    pub fn predicate(mut self, p: PredicateSchema) -> Self {
        self.preds.insert(p.name.clone(), p);
        self
    }

    /// Looks up a predicate entry.
    pub fn get(&self, name: &str) -> Option<&PredicateSchema> {
        self.preds.get(name)
    }

    /// True when `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.preds.contains_key(name)
    }

    /// Entry lookup that fails with [`QueryError::UnknownSortAttribute`],
    /// used by the ordering paths.
    pub fn sortable(&self, name: &str) -> Result<&PredicateSchema> {
        self.preds
            .get(name)
            .ok_or_else(|| QueryError::UnknownSortAttribute(name.to_owned()))
    }

    /// Declared value type, defaulting to string for unregistered names.
    pub fn value_type(&self, name: &str) -> ValueType {
        self.preds
            .get(name)
            .map_or(ValueType::String, |p| p.value_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup_and_flags() {
        let schema = Schema::new()
            .predicate(PredicateSchema::new("name", ValueType::String).indexed().lang())
            .predicate(PredicateSchema::new("friend", ValueType::Uid).list().reverse());
        assert!(schema.get("name").unwrap().indexed);
        assert!(schema.get("friend").unwrap().reverse);
        assert!(!schema.contains("nope"));
        assert_eq!(schema.value_type("friend"), ValueType::Uid);
        assert_eq!(schema.value_type("unregistered"), ValueType::String);
    }

    #[test]
    fn schema_round_trips_through_json() {
        let schema = Schema::new()
            .predicate(PredicateSchema::new("friend", ValueType::Uid).list().reverse());
        let text = serde_json::to_string(&schema).unwrap();
        let back: Schema = serde_json::from_str(&text).unwrap();
        let friend = back.get("friend").unwrap();
        assert!(friend.list && friend.reverse && !friend.indexed);
        assert_eq!(friend.value_type, ValueType::Uid);
    }

    #[test]
    fn sorting_requires_registration() {
        let schema = Schema::new();
        let err = schema.sortable("noindex_dob").unwrap_err();
        assert_eq!(err.to_string(), "Cannot sort by unknown attribute noindex_dob");
    }
}
