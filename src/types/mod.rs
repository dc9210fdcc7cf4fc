//! Core identifier, value, and error types shared by the store and the
//! query pipeline.

use std::fmt;

use thiserror::Error;

pub mod geo;
pub mod value;

pub use geo::Geometry;
pub use value::{CompareOp, TypedValue, ValueType};

/// Opaque 64-bit node identifier. Ordering is numeric and used as the
/// tie-break everywhere results must be deterministic.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Uid(pub u64);

impl Uid {
    /// Reserved identifier used for whole-block value bindings (never a
    /// real node).
    pub const ZERO: Uid = Uid(0);

    /// Renders the identifier in the wire form (`"0x1"`).
    pub fn to_hex(self) -> String {
        format!("{:#x}", self.0)
    }

    /// Parses the wire form produced by [`Uid::to_hex`]; plain decimal is
    /// accepted as well.
    pub fn parse(s: &str) -> Result<Uid> {
        let parsed = match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse::<u64>(),
        };
        parsed
            .map(Uid)
            .map_err(|_| QueryError::InvalidArgument(format!("invalid uid literal {s:?}")))
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Structured errors emitted by the query pipeline.
///
/// Only the variants below abort a query; failures while resolving a single
/// subtree's value or filter are contained and degrade that subtree instead
/// (omitted field, false filter, empty set).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    /// A value could not be converted to the required type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// Geometry input could not be decoded, or uses an unsupported type.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// An `orderasc`/`orderdesc` attribute is not in the schema, or names an
    /// unknown variable.
    #[error("Cannot sort by unknown attribute {0}")]
    UnknownSortAttribute(String),
    /// An aggregate-style function was used where only root/filter functions
    /// are allowed.
    #[error("Function name: {0} is not valid at query root")]
    InvalidFunctionPlacement(String),
    /// Variable references between blocks form a cycle.
    #[error("cyclic variable dependency involving \"{0}\"")]
    CyclicVariableDependency(String),
    /// A function received an argument of the wrong shape.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The query's cancellation token fired.
    #[error("query cancelled")]
    Cancelled,
}

impl QueryError {
    /// Machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::TypeMismatch(_) => "TypeMismatch",
            QueryError::InvalidGeometry(_) => "InvalidGeometry",
            QueryError::UnknownSortAttribute(_) => "UnknownSortAttribute",
            QueryError::InvalidFunctionPlacement(_) => "InvalidFunctionPlacement",
            QueryError::CyclicVariableDependency(_) => "CyclicVariableDependency",
            QueryError::InvalidArgument(_) => "InvalidArgument",
            QueryError::Cancelled => "Cancelled",
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, QueryError>;
