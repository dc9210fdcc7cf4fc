//! Umbra: an embeddable graph query engine.
//!
//! The crate executes block-structured graph queries over a snapshot of a
//! property graph: typed values with coercion, root functions and filters,
//! value and uid variables flowing across blocks, math and aggregation,
//! facets, group-by, ordering and pagination, and JSON result assembly.
//!
//! Storage is abstracted behind [`store::ReadStore`]; [`store::MemStore`]
//! is the bundled in-memory implementation used by the tests.
//!
//! ```
//! use umbra::query::{BlockBuilder, Executor, QueryBuilder, Sel};
//! use umbra::query::ast::{Attr, Function};
//! use umbra::schema::{PredicateSchema, Schema};
//! use umbra::store::MemStore;
//! use umbra::types::{TypedValue, Uid, ValueType};
//!
//! let schema = Schema::new()
//!     .predicate(PredicateSchema::new("name", ValueType::String).indexed());
//! let mut store = MemStore::new(schema);
//! store.put_value(Uid(1), "name", TypedValue::Str("Michonne".into()));
//!
//! let q = QueryBuilder::new()
//!     .block(
//!         BlockBuilder::new("me", Function::Has(Attr::new("name")))
//!             .select(Sel::pred("name")),
//!     )
//!     .build()
//!     .unwrap();
//! let out = Executor::new(&store, store.schema()).execute(&q).unwrap();
//! assert_eq!(out["me"][0]["name"], "Michonne");
//! ```

#![warn(missing_docs)]

pub mod query;
pub mod schema;
pub mod store;
pub mod types;

pub use query::{Executor, QueryBuilder};
pub use types::{QueryError, Result, TypedValue, Uid};
