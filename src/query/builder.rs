//! Fluent construction surface for the query AST.
//!
//! Builders are infallible to chain; problems found while assembling
//! (unparsable uids, conflicting order annotations) are deferred and
//! surfaced by [`QueryBuilder::build`], so call sites stay linear.

use crate::types::{QueryError, Result, Uid};

use super::ast::{
    AggOp, Block, Cascade, FacetKey, FacetSpec, FilterExpr, Function, GroupAgg, GroupAggOp,
    GroupBy, GroupKey, MathExpr, OrderKey, OrderSpec, Pagination, Query, Selection,
    SelectionSource,
};

/// Top-level query builder.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    query: Query,
    err: Option<QueryError>,
}

impl QueryBuilder {
    /// Empty query.
    pub fn new() -> Self {
        QueryBuilder::default()
    }

    /// Appends a block.
    pub fn block(mut self, b: BlockBuilder) -> Self {
        match b.finish() {
            Ok(block) => self.query.blocks.push(block),
            Err(e) => self.err = self.err.or(Some(e)),
        }
        self
    }

    /// Surfaces the first deferred error, otherwise the finished query.
    pub fn build(self) -> Result<Query> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(self.query),
        }
    }
}

/// Builder for one block.
#[derive(Debug)]
pub struct BlockBuilder {
    block: Block,
    err: Option<QueryError>,
}

impl BlockBuilder {
    /// Output block anchored by `root`.
    pub fn new(name: impl Into<String>, root: Function) -> Self {
        BlockBuilder {
            block: Block {
                name: name.into(),
                is_var: false,
                root,
                filter: None,
                order: Vec::new(),
                page: Pagination::default(),
                cascade: None,
                selections: Vec::new(),
            },
            err: None,
        }
    }

    /// Var block: binds variables, emits nothing.
    pub fn var(name: impl Into<String>, root: Function) -> Self {
        let mut b = BlockBuilder::new(name, root);
        b.block.is_var = true;
        b
    }

    /// Root filter.
    pub fn filter(mut self, f: FilterExpr) -> Self {
        self.block.filter = Some(f);
        self
    }

    /// Ascending order by predicate.
    pub fn order_asc(mut self, pred: impl Into<String>) -> Self {
        self.block.order.push(order_pred(pred, false));
        self
    }

    /// Descending order by predicate.
    pub fn order_desc(mut self, pred: impl Into<String>) -> Self {
        self.block.order.push(order_pred(pred, true));
        self
    }

    /// Ascending order by value variable.
    pub fn order_asc_val(mut self, var: impl Into<String>) -> Self {
        self.block.order.push(order_val(var, false));
        self
    }

    /// Descending order by value variable.
    pub fn order_desc_val(mut self, var: impl Into<String>) -> Self {
        self.block.order.push(order_val(var, true));
        self
    }

    /// `first: n`.
    pub fn first(mut self, n: i64) -> Self {
        self.block.page.first = Some(n);
        self
    }

    /// `offset: n`.
    pub fn offset(mut self, n: i64) -> Self {
        self.block.page.offset = n;
        self
    }

    /// `after: uid`.
    pub fn after(mut self, uid: Uid) -> Self {
        self.block.page.after = Some(uid);
        self
    }

    /// `after:` with a hex literal; parse failures surface at `build()`.
    pub fn after_hex(mut self, s: &str) -> Self {
        match Uid::parse(s) {
            Ok(uid) => self.block.page.after = Some(uid),
            Err(e) => self.err = self.err.or(Some(e)),
        }
        self
    }

    /// `@cascade` over all declared fields.
    pub fn cascade(mut self) -> Self {
        self.block.cascade = Some(Cascade::All);
        self
    }

    /// `@cascade(field, ...)`.
    pub fn cascade_fields(mut self, fields: impl IntoIterator<Item = &'static str>) -> Self {
        self.block.cascade = Some(Cascade::Fields(
            fields.into_iter().map(str::to_owned).collect(),
        ));
        self
    }

    /// Appends a selection.
    pub fn select(mut self, s: Sel) -> Self {
        match s.finish() {
            Ok(sel) => self.block.selections.push(sel),
            Err(e) => self.err = self.err.or(Some(e)),
        }
        self
    }

    fn finish(self) -> Result<Block> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(self.block),
        }
    }
}

/// Builder for one selection.
#[derive(Debug)]
pub struct Sel {
    sel: Selection,
    err: Option<QueryError>,
}

impl Sel {
    fn from_source(source: SelectionSource) -> Self {
        Sel {
            sel: Selection {
                source,
                alias: None,
                bind: None,
                langs: Vec::new(),
                filter: None,
                order: Vec::new(),
                page: Pagination::default(),
                facets: None,
                groupby: None,
                cascade: None,
                children: Vec::new(),
            },
            err: None,
        }
    }

    /// Forward predicate.
    pub fn pred(name: impl Into<String>) -> Self {
        Sel::from_source(SelectionSource::Predicate {
            name: name.into(),
            reverse: false,
            count: false,
        })
    }

    /// Reverse predicate (`~pred`).
    pub fn reverse(name: impl Into<String>) -> Self {
        Sel::from_source(SelectionSource::Predicate {
            name: name.into(),
            reverse: true,
            count: false,
        })
    }

    /// `count(pred)`.
    pub fn count_pred(name: impl Into<String>) -> Self {
        Sel::from_source(SelectionSource::Predicate {
            name: name.into(),
            reverse: false,
            count: true,
        })
    }

    /// The `uid` field.
    pub fn uid() -> Self {
        Sel::from_source(SelectionSource::Uid)
    }

    /// `count(uid)` at the current level.
    pub fn count_uid() -> Self {
        Sel::from_source(SelectionSource::CountUid)
    }

    /// `val(var)`.
    pub fn val(var: impl Into<String>) -> Self {
        Sel::from_source(SelectionSource::Val(var.into()))
    }

    /// Aggregate over a value variable, e.g. `min(val(x))`.
    pub fn agg(op: AggOp, var: impl Into<String>) -> Self {
        Sel::from_source(SelectionSource::Aggregate(op, var.into()))
    }

    /// `math(...)`.
    pub fn math(expr: MathExpr) -> Self {
        Sel::from_source(SelectionSource::Math(expr))
    }

    /// Display alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.sel.alias = Some(alias.into());
        self
    }

    /// `x as ...` binding.
    pub fn bind(mut self, var: impl Into<String>) -> Self {
        self.sel.bind = Some(var.into());
        self
    }

    /// Appends a language tag to the chain.
    pub fn lang(mut self, tag: impl Into<String>) -> Self {
        self.sel.langs.push(tag.into());
        self
    }

    /// `pred@*`: every tagged variant plus the untagged value.
    pub fn all_langs(mut self) -> Self {
        self.sel.langs = vec!["*".to_owned()];
        self
    }

    /// Filter over edge targets.
    pub fn filter(mut self, f: FilterExpr) -> Self {
        self.sel.filter = Some(f);
        self
    }

    /// Ascending order by predicate.
    pub fn order_asc(mut self, pred: impl Into<String>) -> Self {
        self.sel.order.push(order_pred(pred, false));
        self
    }

    /// Descending order by predicate.
    pub fn order_desc(mut self, pred: impl Into<String>) -> Self {
        self.sel.order.push(order_pred(pred, true));
        self
    }

    /// Ascending order by a language-tagged predicate.
    pub fn order_asc_lang(mut self, pred: impl Into<String>, tag: impl Into<String>) -> Self {
        self.sel.order.push(OrderSpec {
            key: OrderKey::Predicate(pred.into(), vec![tag.into()]),
            desc: false,
        });
        self
    }

    /// Ascending order by value variable.
    pub fn order_asc_val(mut self, var: impl Into<String>) -> Self {
        self.sel.order.push(order_val(var, false));
        self
    }

    /// Descending order by value variable.
    pub fn order_desc_val(mut self, var: impl Into<String>) -> Self {
        self.sel.order.push(order_val(var, true));
        self
    }

    /// `first: n`.
    pub fn first(mut self, n: i64) -> Self {
        self.sel.page.first = Some(n);
        self
    }

    /// `offset: n`.
    pub fn offset(mut self, n: i64) -> Self {
        self.sel.page.offset = n;
        self
    }

    /// `after: uid`.
    pub fn after(mut self, uid: Uid) -> Self {
        self.sel.page.after = Some(uid);
        self
    }

    /// `@facets(...)`; multiple calls merge.
    pub fn facets(mut self, req: FacetReq) -> Self {
        let spec = self.sel.facets.get_or_insert_with(FacetSpec::default);
        spec.all |= req.spec.all;
        spec.keys.extend(req.spec.keys);
        if req.spec.filter.is_some() {
            spec.filter = req.spec.filter;
        }
        if req.spec.order.is_some() {
            spec.order = req.spec.order;
        }
        self
    }

    /// `@groupby(...)`.
    pub fn groupby(mut self, g: GroupByBuilder) -> Self {
        self.sel.groupby = Some(g.groupby);
        self
    }

    /// `@cascade` on this subtree.
    pub fn cascade(mut self) -> Self {
        self.sel.cascade = Some(Cascade::All);
        self
    }

    /// Nested selection.
    pub fn child(mut self, s: Sel) -> Self {
        match s.finish() {
            Ok(sel) => self.sel.children.push(sel),
            Err(e) => self.err = self.err.or(Some(e)),
        }
        self
    }

    fn finish(self) -> Result<Selection> {
        if let Some(e) = self.err {
            return Err(e);
        }
        let facet_order = self.sel.facets.as_ref().is_some_and(|f| f.order.is_some());
        if facet_order && !self.sel.order.is_empty() {
            return Err(QueryError::InvalidArgument(
                "cannot sort by both a predicate and a facet on the same edge".into(),
            ));
        }
        Ok(self.sel)
    }
}

/// Builder for one `@facets(...)` annotation.
#[derive(Debug, Default)]
pub struct FacetReq {
    spec: FacetSpec,
}

impl FacetReq {
    /// `@facets` with no arguments: emit everything.
    pub fn all() -> Self {
        FacetReq { spec: FacetSpec { all: true, ..FacetSpec::default() } }
    }

    /// Empty request to extend with keys/filter/order.
    pub fn new() -> Self {
        FacetReq::default()
    }

    /// Requests one facet key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.spec.keys.push(FacetKey { key: key.into(), alias: None, bind: None });
        self
    }

    /// Requests a facet key under a display alias.
    pub fn key_alias(mut self, key: impl Into<String>, alias: impl Into<String>) -> Self {
        self.spec.keys.push(FacetKey {
            key: key.into(),
            alias: Some(alias.into()),
            bind: None,
        });
        self
    }

    /// `K as key`: binds the facet value per destination uid.
    pub fn bind(mut self, var: impl Into<String>, key: impl Into<String>) -> Self {
        self.spec.keys.push(FacetKey {
            key: key.into(),
            alias: None,
            bind: Some(var.into()),
        });
        self
    }

    /// Edge-pruning filter over facet values.
    pub fn filter(mut self, f: FilterExpr) -> Self {
        self.spec.filter = Some(f);
        self
    }

    /// Orders edge targets by a facet value, ascending.
    pub fn order_asc(mut self, key: impl Into<String>) -> Self {
        self.spec.order = Some(OrderSpec {
            key: OrderKey::Predicate(key.into(), Vec::new()),
            desc: false,
        });
        self
    }

    /// Orders edge targets by a facet value, descending.
    pub fn order_desc(mut self, key: impl Into<String>) -> Self {
        self.spec.order = Some(OrderSpec {
            key: OrderKey::Predicate(key.into(), Vec::new()),
            desc: true,
        });
        self
    }
}

/// Builder for `@groupby`.
#[derive(Debug)]
pub struct GroupByBuilder {
    groupby: GroupBy,
}

impl GroupByBuilder {
    /// Group-by over the listed key predicates.
    pub fn keys(keys: impl IntoIterator<Item = &'static str>) -> Self {
        GroupByBuilder {
            groupby: GroupBy {
                keys: keys
                    .into_iter()
                    .map(|k| GroupKey { pred: k.to_owned(), alias: None, langs: Vec::new() })
                    .collect(),
                aggs: Vec::new(),
            },
        }
    }

    /// Aliases the most recently added key.
    pub fn key_alias(mut self, alias: impl Into<String>) -> Self {
        if let Some(last) = self.groupby.keys.last_mut() {
            last.alias = Some(alias.into());
        }
        self
    }

    /// `count(uid)` per group.
    pub fn count_uid(mut self) -> Self {
        self.groupby.aggs.push(GroupAgg { op: GroupAggOp::CountUid, alias: None, bind: None });
        self
    }

    /// `v as count(uid)` per group.
    pub fn count_uid_bind(mut self, var: impl Into<String>) -> Self {
        self.groupby.aggs.push(GroupAgg {
            op: GroupAggOp::CountUid,
            alias: None,
            bind: Some(var.into()),
        });
        self
    }

    /// `min(pred)` per group.
    pub fn min(mut self, pred: impl Into<String>) -> Self {
        self.groupby.aggs.push(GroupAgg {
            op: GroupAggOp::Min(pred.into()),
            alias: None,
            bind: None,
        });
        self
    }

    /// `max(pred)` per group.
    pub fn max(mut self, pred: impl Into<String>) -> Self {
        self.groupby.aggs.push(GroupAgg {
            op: GroupAggOp::Max(pred.into()),
            alias: None,
            bind: None,
        });
        self
    }

    /// `sum(pred)` per group.
    pub fn sum(mut self, pred: impl Into<String>) -> Self {
        self.groupby.aggs.push(GroupAgg {
            op: GroupAggOp::Sum(pred.into()),
            alias: None,
            bind: None,
        });
        self
    }

    /// Aliases the most recently added aggregate.
    pub fn agg_alias(mut self, alias: impl Into<String>) -> Self {
        if let Some(last) = self.groupby.aggs.last_mut() {
            last.alias = Some(alias.into());
        }
        self
    }
}

fn order_pred(pred: impl Into<String>, desc: bool) -> OrderSpec {
    OrderSpec { key: OrderKey::Predicate(pred.into(), Vec::new()), desc }
}

fn order_val(var: impl Into<String>, desc: bool) -> OrderSpec {
    OrderSpec { key: OrderKey::Val(var.into()), desc }
}

/// Shorthand filter constructors.
pub mod filters {
    use super::{FilterExpr, Function};

    /// Leaf function filter.
    pub fn func(f: Function) -> FilterExpr {
        FilterExpr::Func(f)
    }

    /// Conjunction.
    pub fn and(parts: impl IntoIterator<Item = FilterExpr>) -> FilterExpr {
        FilterExpr::And(parts.into_iter().collect())
    }

    /// Disjunction.
    pub fn or(parts: impl IntoIterator<Item = FilterExpr>) -> FilterExpr {
        FilterExpr::Or(parts.into_iter().collect())
    }

    /// Negation.
    pub fn not(part: FilterExpr) -> FilterExpr {
        FilterExpr::Not(Box::new(part))
    }
}

/// Shorthand math-expression constructors.
pub mod math {
    use super::MathExpr;
    use crate::query::ast::{MathCmp, MathOp, MathUnaryOp};
    use crate::types::{CompareOp, TypedValue};

    /// Integer literal.
    pub fn int(v: i64) -> MathExpr {
        MathExpr::Lit(TypedValue::Int(v))
    }

    /// Float literal.
    pub fn float(v: f64) -> MathExpr {
        MathExpr::Lit(TypedValue::Float(v))
    }

    /// Variable read.
    pub fn val(name: impl Into<String>) -> MathExpr {
        MathExpr::Val(name.into())
    }

    /// Binary operation.
    pub fn bin(op: MathOp, lhs: MathExpr, rhs: MathExpr) -> MathExpr {
        MathExpr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    /// Unary operation.
    pub fn un(op: MathUnaryOp, arg: MathExpr) -> MathExpr {
        MathExpr::Unary(op, Box::new(arg))
    }

    /// `cond(lhs op rhs, then, else)`.
    pub fn cond(
        op: CompareOp,
        lhs: MathExpr,
        rhs: MathExpr,
        then: MathExpr,
        otherwise: MathExpr,
    ) -> MathExpr {
        MathExpr::Cond(
            MathCmp { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            Box::new(then),
            Box::new(otherwise),
        )
    }
}
