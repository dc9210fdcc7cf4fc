//! Query pipeline: AST, variable analysis, function evaluation, subgraph
//! execution, result assembly.

mod assemble;
pub mod ast;
pub mod builder;
pub mod executor;
pub mod func;
pub mod math;
pub mod vars;

pub use ast::Query;
pub use builder::{BlockBuilder, FacetReq, GroupByBuilder, QueryBuilder, Sel};
pub use executor::{ExecOptions, Executor};
pub use vars::{VarKind, VarTable};
