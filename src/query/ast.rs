//! Parsed-query AST.
//!
//! The crate consumes an already-validated block tree; these types are the
//! contract with the parser. Construction goes through the fluent surface in
//! [`crate::query::builder`], validation (variable kinds, dependency cycles)
//! happens when a [`Query`] is handed to the executor.

use crate::types::{CompareOp, TypedValue, Uid};

/// A whole query: an ordered list of named blocks sharing one variable
/// namespace.
#[derive(Clone, Debug, Default)]
pub struct Query {
    /// Blocks in declaration order; output preserves this order.
    pub blocks: Vec<Block>,
}

/// One query block: a root function plus a selection tree.
#[derive(Clone, Debug)]
pub struct Block {
    /// Output key. Var blocks keep a name for diagnostics but emit nothing.
    pub name: String,
    /// Var blocks bind variables without contributing output.
    pub is_var: bool,
    /// Root function producing the block's candidate set.
    pub root: Function,
    /// Root-level filter.
    pub filter: Option<FilterExpr>,
    /// Root-level ordering, applied left to right.
    pub order: Vec<OrderSpec>,
    /// Root-level pagination.
    pub page: Pagination,
    /// Cascade directive for the whole block subtree.
    pub cascade: Option<Cascade>,
    /// Selections under each root node, in declaration order.
    pub selections: Vec<Selection>,
}

/// What a selection reads.
#[derive(Clone, Debug)]
pub enum SelectionSource {
    /// A stored predicate; `reverse` walks incoming edges (`~pred`),
    /// `count` emits the fanout instead of expanding.
    Predicate {
        /// Predicate name.
        name: String,
        /// Traverse incoming edges.
        reverse: bool,
        /// Emit `count(pred)` instead of expanding.
        count: bool,
    },
    /// The node's own identifier.
    Uid,
    /// `count(uid)`: the size of the current level.
    CountUid,
    /// `val(var)`: a value-variable read per node.
    Val(String),
    /// Aggregate over a value variable restricted to the node's expanded
    /// descendants (`min(val(x))` and friends).
    Aggregate(AggOp, String),
    /// `math(...)` over value variables.
    Math(MathExpr),
}

/// One entry in a node's selection list.
#[derive(Clone, Debug)]
pub struct Selection {
    /// Source being read.
    pub source: SelectionSource,
    /// Display key override.
    pub alias: Option<String>,
    /// `x as ...` variable binding. Edge predicates bind uid variables,
    /// everything else binds value variables.
    pub bind: Option<String>,
    /// Language chain for tagged predicates. `["*"]` expands every tag,
    /// `["ko", "en"]` is a first-populated-wins fallback chain.
    pub langs: Vec<String>,
    /// Filter over edge targets.
    pub filter: Option<FilterExpr>,
    /// Ordering over edge targets.
    pub order: Vec<OrderSpec>,
    /// Pagination over edge targets.
    pub page: Pagination,
    /// Facet handling for this predicate's edges.
    pub facets: Option<FacetSpec>,
    /// Group-by over edge targets; mutually exclusive with `children`.
    pub groupby: Option<GroupBy>,
    /// Cascade directive scoped to this subtree.
    pub cascade: Option<Cascade>,
    /// Nested selections for edge predicates.
    pub children: Vec<Selection>,
}

/// Aggregate operators over value variables.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AggOp {
    /// Smallest sample; absent on zero samples.
    Min,
    /// Largest sample; absent on zero samples.
    Max,
    /// Sum; `0` on zero samples.
    Sum,
    /// Arithmetic mean; absent on zero samples.
    Avg,
}

impl AggOp {
    /// Operator name as written in queries.
    pub fn name(self) -> &'static str {
        match self {
            AggOp::Min => "min",
            AggOp::Max => "max",
            AggOp::Sum => "sum",
            AggOp::Avg => "avg",
        }
    }
}

/// Sort key.
#[derive(Clone, Debug)]
pub enum OrderKey {
    /// Order by a stored predicate (optionally language-tagged).
    Predicate(String, Vec<String>),
    /// Order by a value variable; unbound nodes are dropped.
    Val(String),
}

/// One `orderasc`/`orderdesc` annotation.
#[derive(Clone, Debug)]
pub struct OrderSpec {
    /// What to sort by.
    pub key: OrderKey,
    /// Descending when set.
    pub desc: bool,
}

/// `first` / `offset` / `after` pagination.
#[derive(Clone, Copy, Debug, Default)]
pub struct Pagination {
    /// Maximum number of results; `None` is unlimited.
    pub first: Option<i64>,
    /// Results to skip; negative values clamp to zero.
    pub offset: i64,
    /// Skip results up to and including this uid.
    pub after: Option<Uid>,
}

impl Pagination {
    /// True when no pagination was requested.
    pub fn is_default(&self) -> bool {
        self.first.is_none() && self.offset == 0 && self.after.is_none()
    }
}

/// `@cascade` directive.
#[derive(Clone, Debug)]
pub enum Cascade {
    /// All declared fields are required.
    All,
    /// Only the listed fields are required.
    Fields(Vec<String>),
}

/// Boolean filter tree.
#[derive(Clone, Debug)]
pub enum FilterExpr {
    /// Leaf function.
    Func(Function),
    /// Conjunction.
    And(Vec<FilterExpr>),
    /// Disjunction.
    Or(Vec<FilterExpr>),
    /// Negation against the candidate set.
    Not(Box<FilterExpr>),
}

/// A predicate reference inside a function, with an optional language
/// chain (`name@en`).
#[derive(Clone, Debug)]
pub struct Attr {
    /// Predicate name.
    pub name: String,
    /// Language chain; empty means the untagged value.
    pub langs: Vec<String>,
}

impl Attr {
    /// Untagged predicate reference.
    pub fn new(name: impl Into<String>) -> Self {
        Attr { name: name.into(), langs: Vec::new() }
    }

    /// Tagged predicate reference.
    pub fn lang(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Attr { name: name.into(), langs: vec![tag.into()] }
    }
}

/// Argument to a comparison function.
#[derive(Clone, Debug)]
pub enum FuncArg {
    /// Literal value.
    Lit(TypedValue),
    /// Per-node value-variable read (`val(v)`).
    Val(String),
}

/// Argument to the `uid()` function.
#[derive(Clone, Debug)]
pub enum UidArg {
    /// Literal uid.
    Lit(Uid),
    /// A uid or value variable; value variables contribute their key set.
    Var(String),
}

/// Root/filter functions. The operator set is closed and dispatched through
/// one match in the evaluator.
#[derive(Clone, Debug)]
pub enum Function {
    /// `uid(...)`: union of literals and variable sets, ascending, deduped.
    Uid(Vec<UidArg>),
    /// `eq(attr, v1, v2, ...)`: any listed value matches.
    Eq(Attr, Vec<FuncArg>),
    /// `lt/le/gt/ge(attr, v)`.
    Cmp(CompareOp, Attr, FuncArg),
    /// `between(attr, lo, hi)`, inclusive; inverted bounds yield the empty
    /// set.
    Between(Attr, TypedValue, TypedValue),
    /// `has(attr)`.
    Has(Attr),
    /// `type(T)`.
    Type(String),
    /// `anyofterms(attr, "a b c")`.
    AnyOfTerms(Attr, String),
    /// `allofterms(attr, "a b c")`.
    AllOfTerms(Attr, String),
    /// `alloftext(attr, "...")`.
    AllOfText(Attr, String),
    /// `regexp(attr, /re/)`.
    Regexp(Attr, String),
    /// `match(attr, "text", max_distance)`.
    Match(Attr, String, i64),
    /// `uid_in(pred, ...)`: filter-only; arguments are validated as uids at
    /// evaluation time.
    UidIn(String, Vec<String>),
    /// `eq/lt/... (count(pred), n)`.
    CountCmp(CompareOp, String, i64),
    /// `eq/lt/... (len(var), n)`: filter-only.
    LenCmp(CompareOp, String, i64),
}

impl Function {
    /// Operator name for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Function::Uid(_) => "uid",
            Function::Eq(..) => "eq",
            Function::Cmp(op, ..) => match op {
                CompareOp::Eq => "eq",
                CompareOp::Lt => "lt",
                CompareOp::Le => "le",
                CompareOp::Gt => "gt",
                CompareOp::Ge => "ge",
            },
            Function::Between(..) => "between",
            Function::Has(_) => "has",
            Function::Type(_) => "type",
            Function::AnyOfTerms(..) => "anyofterms",
            Function::AllOfTerms(..) => "allofterms",
            Function::AllOfText(..) => "alloftext",
            Function::Regexp(..) => "regexp",
            Function::Match(..) => "match",
            Function::UidIn(..) => "uid_in",
            Function::CountCmp(..) => "count",
            Function::LenCmp(..) => "len",
        }
    }
}

/// Binary math operators.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MathOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division; always produces a float.
    Div,
    /// Modulo.
    Mod,
    /// Smaller operand.
    Min,
    /// Larger operand.
    Max,
    /// `pow(base, exp)`.
    Pow,
    /// `logbase(x, base)`.
    LogBase,
}

/// Unary math operators.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MathUnaryOp {
    /// Natural logarithm.
    Ln,
    /// Exponential.
    Exp,
    /// Square root.
    Sqrt,
    /// Unary negation.
    Neg,
    /// Seconds elapsed since a datetime value.
    Since,
    /// Floor.
    Floor,
    /// Ceiling.
    Ceil,
}

/// Comparison node inside `cond(...)`.
#[derive(Clone, Debug)]
pub struct MathCmp {
    /// Operator.
    pub op: CompareOp,
    /// Left operand.
    pub lhs: Box<MathExpr>,
    /// Right operand.
    pub rhs: Box<MathExpr>,
}

/// `math(...)` expression tree.
#[derive(Clone, Debug)]
pub enum MathExpr {
    /// Literal operand.
    Lit(TypedValue),
    /// Value-variable read.
    Val(String),
    /// Binary operation.
    Binary(MathOp, Box<MathExpr>, Box<MathExpr>),
    /// Unary operation.
    Unary(MathUnaryOp, Box<MathExpr>),
    /// `cond(cmp, then, else)`; both branches are evaluated, only the
    /// taken value is kept.
    Cond(MathCmp, Box<MathExpr>, Box<MathExpr>),
}

impl MathExpr {
    /// Variable names read anywhere in the expression.
    pub fn vars(&self, out: &mut Vec<String>) {
        match self {
            MathExpr::Lit(_) => {}
            MathExpr::Val(v) => out.push(v.clone()),
            MathExpr::Binary(_, a, b) => {
                a.vars(out);
                b.vars(out);
            }
            MathExpr::Unary(_, a) => a.vars(out),
            MathExpr::Cond(cmp, t, e) => {
                cmp.lhs.vars(out);
                cmp.rhs.vars(out);
                t.vars(out);
                e.vars(out);
            }
        }
    }
}

/// One facet key requested on a predicate.
#[derive(Clone, Debug)]
pub struct FacetKey {
    /// Facet name.
    pub key: String,
    /// Display alias.
    pub alias: Option<String>,
    /// `K as key` value-variable binding keyed by destination uid.
    pub bind: Option<String>,
}

/// Merged `@facets(...)` annotations for one predicate.
#[derive(Clone, Debug, Default)]
pub struct FacetSpec {
    /// Emit every facet present on the edge.
    pub all: bool,
    /// Specific keys to emit and/or bind.
    pub keys: Vec<FacetKey>,
    /// Edge-pruning filter over facet values.
    pub filter: Option<FilterExpr>,
    /// Order edge targets by a facet value.
    pub order: Option<OrderSpec>,
}

/// One group-by key.
#[derive(Clone, Debug)]
pub struct GroupKey {
    /// Predicate partitioned on.
    pub pred: String,
    /// Display alias.
    pub alias: Option<String>,
    /// Language chain for tagged keys.
    pub langs: Vec<String>,
}

/// Aggregate declared inside `@groupby`.
#[derive(Clone, Debug)]
pub enum GroupAggOp {
    /// Partition size.
    CountUid,
    /// Smallest value of a predicate within the partition.
    Min(String),
    /// Largest value of a predicate within the partition.
    Max(String),
    /// Sum of a predicate within the partition.
    Sum(String),
}

/// One aggregate entry in a group-by.
#[derive(Clone, Debug)]
pub struct GroupAgg {
    /// Aggregate to compute.
    pub op: GroupAggOp,
    /// Display alias.
    pub alias: Option<String>,
    /// `v as count(uid)` value-variable binding.
    pub bind: Option<String>,
}

/// `@groupby(keys...)` with its aggregate selections.
#[derive(Clone, Debug)]
pub struct GroupBy {
    /// Key tuple.
    pub keys: Vec<GroupKey>,
    /// Aggregates computed per group.
    pub aggs: Vec<GroupAgg>,
}
