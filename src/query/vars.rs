//! Variable table and cross-block dependency ordering.
//!
//! Variables are scoped to one execution. Producers run before consumers:
//! [`analyze`] builds the block dependency graph up front, topologically
//! sorts it into levels, and rejects cycles before any storage read
//! happens. The table itself takes concurrent readers once producers are
//! done; sibling producers write private tables merged in declaration
//! order.

use std::cmp::Ordering;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::schema::Schema;
use crate::types::{QueryError, Result, TypedValue, Uid, ValueType};

use super::ast::{
    AggOp, Block, FilterExpr, FuncArg, Function, MathExpr, OrderKey, Query, Selection,
    SelectionSource, UidArg,
};

/// What kind of binding a variable name holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VarKind {
    /// Ordered node set.
    Uid,
    /// Per-node scalar.
    Value,
}

#[derive(Clone, Debug)]
enum VarData {
    Uids { order: Vec<Uid>, seen: FxHashSet<Uid> },
    Values(FxHashMap<Uid, TypedValue>),
}

/// Execution-scoped variable table.
#[derive(Debug, Default)]
pub struct VarTable {
    inner: RwLock<FxHashMap<String, VarData>>,
}

impl VarTable {
    /// Empty table.
    pub fn new() -> Self {
        VarTable::default()
    }

    fn kind_conflict(name: &str) -> QueryError {
        QueryError::InvalidArgument(format!(
            "variable \"{name}\" is used as both a uid and a value variable"
        ))
    }

    /// Adds one uid to a uid variable, keeping first-seen order.
    pub fn bind_uid(&self, name: &str, uid: Uid) -> Result<()> {
        let mut inner = self.inner.write();
        match inner
            .entry(name.to_owned())
            .or_insert_with(|| VarData::Uids { order: Vec::new(), seen: FxHashSet::default() })
        {
            VarData::Uids { order, seen } => {
                if seen.insert(uid) {
                    order.push(uid);
                }
                Ok(())
            }
            VarData::Values(_) => Err(Self::kind_conflict(name)),
        }
    }

    /// Adds several uids to a uid variable.
    pub fn bind_uids(&self, name: &str, uids: impl IntoIterator<Item = Uid>) -> Result<()> {
        for uid in uids {
            self.bind_uid(name, uid)?;
        }
        Ok(())
    }

    /// Binds a per-node value. Re-binding a numeric value for the same node
    /// accumulates by summation; non-numeric re-binds are last-write-wins.
    pub fn bind_value(&self, name: &str, uid: Uid, value: TypedValue) -> Result<()> {
        let mut inner = self.inner.write();
        match inner
            .entry(name.to_owned())
            .or_insert_with(|| VarData::Values(FxHashMap::default()))
        {
            VarData::Values(map) => {
                let merged = match map.remove(&uid) {
                    Some(prev) => merge_numeric(prev, value),
                    None => value,
                };
                map.insert(uid, merged);
                Ok(())
            }
            VarData::Uids { .. } => Err(Self::kind_conflict(name)),
        }
    }

    /// The variable's node set, ascending and deduplicated. Value variables
    /// contribute their key set. Unknown names resolve empty.
    pub fn uid_set(&self, name: &str) -> Vec<Uid> {
        let inner = self.inner.read();
        let mut uids: Vec<Uid> = match inner.get(name) {
            Some(VarData::Uids { order, .. }) => order.clone(),
            Some(VarData::Values(map)) => map.keys().copied().collect(),
            None => Vec::new(),
        };
        uids.sort_unstable();
        uids.dedup();
        uids
    }

    /// The value bound for `uid`, if any.
    pub fn value_of(&self, name: &str, uid: Uid) -> Option<TypedValue> {
        match self.inner.read().get(name)? {
            VarData::Values(map) => map.get(&uid).cloned(),
            VarData::Uids { .. } => None,
        }
    }

    /// Snapshot of a value variable's full map; empty for uid variables and
    /// unknown names.
    pub fn value_map(&self, name: &str) -> FxHashMap<Uid, TypedValue> {
        match self.inner.read().get(name) {
            Some(VarData::Values(map)) => map.clone(),
            _ => FxHashMap::default(),
        }
    }

    /// Distinct values of a value variable (for `eq(pred, val(v))` roots).
    pub fn distinct_values(&self, name: &str) -> Vec<TypedValue> {
        let map = self.value_map(name);
        let mut out: Vec<TypedValue> = Vec::new();
        for v in map.into_values() {
            if !out.contains(&v) {
                out.push(v);
            }
        }
        out
    }

    /// Binding count, for `len(var)`.
    pub fn len_of(&self, name: &str) -> usize {
        match self.inner.read().get(name) {
            Some(VarData::Uids { order, .. }) => order.len(),
            Some(VarData::Values(map)) => map.len(),
            None => 0,
        }
    }

    /// Declared kind, if the name is bound.
    pub fn kind_of(&self, name: &str) -> Option<VarKind> {
        match self.inner.read().get(name)? {
            VarData::Uids { .. } => Some(VarKind::Uid),
            VarData::Values(_) => Some(VarKind::Value),
        }
    }

    /// Reduces a value variable across all nodes with `op`.
    pub fn aggregate(&self, name: &str, op: AggOp) -> Option<TypedValue> {
        let map = self.value_map(name);
        aggregate_values(op, map.values())
    }

    /// Applies every binding of `delta` to this table, preserving the
    /// delta's uid insertion order and value-merge semantics.
    pub fn merge_from(&self, delta: VarTable) -> Result<()> {
        let data = delta.inner.into_inner();
        for (name, var) in deterministic(data) {
            match var {
                VarData::Uids { order, .. } => self.bind_uids(&name, order)?,
                VarData::Values(map) => {
                    for (uid, value) in deterministic(map) {
                        self.bind_value(&name, uid, value)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Read access to variables, satisfied by the global table and by the
/// merged view a producer block gets over (global, private delta).
pub trait VarReader: Sync {
    /// Ascending deduplicated node set; value variables contribute keys.
    fn uid_set(&self, name: &str) -> Vec<Uid>;
    /// Per-node value.
    fn value_of(&self, name: &str, uid: Uid) -> Option<TypedValue>;
    /// Full value map snapshot.
    fn value_map(&self, name: &str) -> FxHashMap<Uid, TypedValue>;
    /// Binding count, for `len(var)`.
    fn len_of(&self, name: &str) -> usize;

    /// Distinct values, in unspecified order.
    fn distinct_values(&self, name: &str) -> Vec<TypedValue> {
        let mut out: Vec<TypedValue> = Vec::new();
        for v in self.value_map(name).into_values() {
            if !out.contains(&v) {
                out.push(v);
            }
        }
        out
    }
}

impl VarReader for VarTable {
    fn uid_set(&self, name: &str) -> Vec<Uid> {
        VarTable::uid_set(self, name)
    }

    fn value_of(&self, name: &str, uid: Uid) -> Option<TypedValue> {
        VarTable::value_of(self, name, uid)
    }

    fn value_map(&self, name: &str) -> FxHashMap<Uid, TypedValue> {
        VarTable::value_map(self, name)
    }

    fn len_of(&self, name: &str) -> usize {
        VarTable::len_of(self, name)
    }
}

/// Merged read view over the global table and a block's private delta.
/// Overlapping numeric bindings read as their sum, matching what a
/// sequential merge would have produced.
pub struct VarView<'a> {
    /// Table holding bindings from completed earlier levels.
    pub global: &'a VarTable,
    /// The running block's own bindings.
    pub delta: &'a VarTable,
}

impl VarReader for VarView<'_> {
    fn uid_set(&self, name: &str) -> Vec<Uid> {
        let mut uids = self.global.uid_set(name);
        uids.extend(self.delta.uid_set(name));
        uids.sort_unstable();
        uids.dedup();
        uids
    }

    fn value_of(&self, name: &str, uid: Uid) -> Option<TypedValue> {
        match (self.global.value_of(name, uid), self.delta.value_of(name, uid)) {
            (Some(g), Some(d)) => Some(merge_numeric(g, d)),
            (g, d) => g.or(d),
        }
    }

    fn value_map(&self, name: &str) -> FxHashMap<Uid, TypedValue> {
        let mut map = self.global.value_map(name);
        for (uid, v) in self.delta.value_map(name) {
            let merged = match map.remove(&uid) {
                Some(prev) => merge_numeric(prev, v),
                None => v,
            };
            map.insert(uid, merged);
        }
        map
    }

    fn len_of(&self, name: &str) -> usize {
        let map = self.value_map(name);
        if map.is_empty() {
            self.uid_set(name).len()
        } else {
            map.len()
        }
    }
}

fn deterministic<K: Ord, V>(map: FxHashMap<K, V>) -> Vec<(K, V)> {
    let mut entries: Vec<(K, V)> = map.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

pub(crate) fn merge_numeric(prev: TypedValue, next: TypedValue) -> TypedValue {
    match (&prev, &next) {
        (TypedValue::Int(a), TypedValue::Int(b)) => TypedValue::Int(a + b),
        (TypedValue::Int(_) | TypedValue::Float(_), TypedValue::Int(_) | TypedValue::Float(_)) => {
            let a = prev.as_f64().unwrap_or(0.0);
            let b = next.as_f64().unwrap_or(0.0);
            TypedValue::Float(a + b)
        }
        _ => next,
    }
}

/// Reduces an iterator of values with `op`. `sum` is numeric with identity
/// zero; `min`/`max`/`avg` are absent on zero samples.
pub fn aggregate_values<'a>(
    op: AggOp,
    values: impl IntoIterator<Item = &'a TypedValue>,
) -> Option<TypedValue> {
    let mut iter = values.into_iter();
    match op {
        AggOp::Min | AggOp::Max => {
            let mut best = iter.next()?.clone();
            for v in iter {
                let ord = v.ordering(&best).unwrap_or(Ordering::Equal);
                let take = if op == AggOp::Min {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                };
                if take {
                    best = v.clone();
                }
            }
            Some(best)
        }
        AggOp::Sum => {
            let mut int_sum: i64 = 0;
            let mut float_sum: f64 = 0.0;
            let mut any_float = false;
            for v in iter {
                match v {
                    TypedValue::Int(i) => int_sum += i,
                    TypedValue::Float(f) => {
                        any_float = true;
                        float_sum += f;
                    }
                    _ => {}
                }
            }
            if any_float {
                Some(TypedValue::Float(float_sum + int_sum as f64))
            } else {
                Some(TypedValue::Int(int_sum))
            }
        }
        AggOp::Avg => {
            let mut sum = 0.0;
            let mut n = 0usize;
            for v in iter {
                if let Some(f) = v.as_f64() {
                    sum += f;
                    n += 1;
                }
            }
            if n == 0 {
                None
            } else {
                Some(TypedValue::Float(sum / n as f64))
            }
        }
    }
}

/// Variable names a block declares and consumes, with declared kinds.
#[derive(Debug, Default)]
struct BlockVars {
    declares: Vec<(String, VarKind)>,
    consumes: Vec<String>,
}

/// Orders blocks into dependency levels: every producer of a variable sits
/// in an earlier level than its consumers. Blocks within one level are
/// independent. Cycles and kind conflicts fail before execution.
pub fn analyze(query: &Query, schema: &Schema) -> Result<Vec<Vec<usize>>> {
    let per_block: Vec<BlockVars> = query.blocks.iter().map(|b| block_vars(b, schema)).collect();

    let mut kinds: FxHashMap<&str, VarKind> = FxHashMap::default();
    for vars in &per_block {
        for (name, kind) in &vars.declares {
            match kinds.insert(name, *kind) {
                Some(prev) if prev != *kind => {
                    return Err(VarTable::kind_conflict(name));
                }
                _ => {}
            }
        }
    }

    // Producer -> consumer edges between block indices.
    let n = query.blocks.len();
    let mut producers: FxHashMap<&str, Vec<usize>> = FxHashMap::default();
    for (i, vars) in per_block.iter().enumerate() {
        for (name, _) in &vars.declares {
            producers.entry(name).or_default().push(i);
        }
    }
    let mut out_edges: Vec<FxHashSet<usize>> = vec![FxHashSet::default(); n];
    let mut in_degree = vec![0usize; n];
    for (i, vars) in per_block.iter().enumerate() {
        for name in &vars.consumes {
            for &p in producers.get(name.as_str()).into_iter().flatten() {
                if p != i && out_edges[p].insert(i) {
                    in_degree[i] += 1;
                }
            }
        }
    }

    // Kahn's algorithm, level by level, declaration order within a level.
    let mut levels: Vec<Vec<usize>> = Vec::new();
    let mut placed = 0usize;
    let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    while !ready.is_empty() {
        ready.sort_unstable();
        placed += ready.len();
        let mut next: Vec<usize> = Vec::new();
        for &i in &ready {
            for &j in &out_edges[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    next.push(j);
                }
            }
        }
        levels.push(std::mem::take(&mut ready));
        ready = next;
    }
    if placed != n {
        let stuck = (0..n).find(|&i| in_degree[i] > 0).unwrap_or(0);
        let name = per_block[stuck]
            .consumes
            .first()
            .cloned()
            .unwrap_or_else(|| query.blocks[stuck].name.clone());
        return Err(QueryError::CyclicVariableDependency(name));
    }
    Ok(levels)
}

fn block_vars(block: &Block, schema: &Schema) -> BlockVars {
    let mut vars = BlockVars::default();
    function_vars(&block.root, &mut vars.consumes);
    if let Some(f) = &block.filter {
        filter_vars(f, &mut vars.consumes);
    }
    for o in &block.order {
        if let OrderKey::Val(v) = &o.key {
            vars.consumes.push(v.clone());
        }
    }
    for sel in &block.selections {
        selection_vars(sel, schema, &mut vars);
    }
    // A name both produced and consumed inside one block resolves locally.
    let declared: FxHashSet<&str> = vars.declares.iter().map(|(n, _)| n.as_str()).collect();
    vars.consumes = vars
        .consumes
        .iter()
        .filter(|n| !declared.contains(n.as_str()))
        .cloned()
        .collect();
    vars
}

fn selection_vars(sel: &Selection, schema: &Schema, vars: &mut BlockVars) {
    if let Some(bind) = &sel.bind {
        let kind = match &sel.source {
            SelectionSource::Predicate { name, count, .. } => {
                if !count && schema.value_type(name) == ValueType::Uid {
                    VarKind::Uid
                } else {
                    VarKind::Value
                }
            }
            _ => VarKind::Value,
        };
        vars.declares.push((bind.clone(), kind));
    }
    match &sel.source {
        SelectionSource::Val(v) | SelectionSource::Aggregate(_, v) => {
            vars.consumes.push(v.clone());
        }
        SelectionSource::Math(expr) => expr.vars(&mut vars.consumes),
        _ => {}
    }
    if let Some(f) = &sel.filter {
        filter_vars(f, &mut vars.consumes);
    }
    for o in &sel.order {
        if let OrderKey::Val(v) = &o.key {
            vars.consumes.push(v.clone());
        }
    }
    if let Some(facets) = &sel.facets {
        for key in &facets.keys {
            if let Some(bind) = &key.bind {
                vars.declares.push((bind.clone(), VarKind::Value));
            }
        }
    }
    if let Some(g) = &sel.groupby {
        for agg in &g.aggs {
            if let Some(bind) = &agg.bind {
                vars.declares.push((bind.clone(), VarKind::Value));
            }
        }
    }
    for child in &sel.children {
        selection_vars(child, schema, vars);
    }
}

fn filter_vars(expr: &FilterExpr, out: &mut Vec<String>) {
    match expr {
        FilterExpr::Func(f) => function_vars(f, out),
        FilterExpr::And(parts) | FilterExpr::Or(parts) => {
            for p in parts {
                filter_vars(p, out);
            }
        }
        FilterExpr::Not(p) => filter_vars(p, out),
    }
}

fn function_vars(f: &Function, out: &mut Vec<String>) {
    match f {
        Function::Uid(args) => {
            for a in args {
                if let UidArg::Var(v) = a {
                    out.push(v.clone());
                }
            }
        }
        Function::Eq(_, args) => {
            for a in args {
                if let FuncArg::Val(v) = a {
                    out.push(v.clone());
                }
            }
        }
        Function::Cmp(_, _, FuncArg::Val(v)) => out.push(v.clone()),
        Function::LenCmp(_, v, _) => out.push(v.clone()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::Attr;
    use crate::query::builder::{BlockBuilder, QueryBuilder, Sel};
    use crate::schema::PredicateSchema;

    #[test]
    fn numeric_rebinding_sums() {
        let table = VarTable::new();
        table.bind_value("w", Uid(2), TypedValue::Float(1.5)).unwrap();
        table.bind_value("w", Uid(2), TypedValue::Float(0.6)).unwrap();
        assert_eq!(table.value_of("w", Uid(2)), Some(TypedValue::Float(2.1)));
        table.bind_value("s", Uid(1), TypedValue::Str("a".into())).unwrap();
        table.bind_value("s", Uid(1), TypedValue::Str("b".into())).unwrap();
        assert_eq!(table.value_of("s", Uid(1)), Some(TypedValue::Str("b".into())));
    }

    #[test]
    fn uid_sets_are_sorted_and_deduped() {
        let table = VarTable::new();
        table.bind_uids("f", [Uid(31), Uid(23), Uid(31), Uid(1)]).unwrap();
        assert_eq!(table.uid_set("f"), vec![Uid(1), Uid(23), Uid(31)]);
        assert_eq!(table.len_of("f"), 3);
        assert!(table.uid_set("missing").is_empty());
    }

    #[test]
    fn kind_conflicts_are_rejected() {
        let table = VarTable::new();
        table.bind_uid("x", Uid(1)).unwrap();
        let err = table.bind_value("x", Uid(1), TypedValue::Int(1)).unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }

    #[test]
    fn aggregate_identities() {
        let none: [&TypedValue; 0] = [];
        assert_eq!(aggregate_values(AggOp::Sum, none), Some(TypedValue::Int(0)));
        assert_eq!(aggregate_values(AggOp::Min, none), None);
        let vals = [TypedValue::Int(3), TypedValue::Int(9)];
        assert_eq!(aggregate_values(AggOp::Max, &vals), Some(TypedValue::Int(9)));
        assert_eq!(aggregate_values(AggOp::Avg, &vals), Some(TypedValue::Float(6.0)));
    }

    fn schema() -> Schema {
        Schema::new()
            .predicate(PredicateSchema::new("friend", ValueType::Uid).list())
            .predicate(PredicateSchema::new("age", ValueType::Int).indexed())
    }

    #[test]
    fn producer_sorts_before_consumer() {
        let q = QueryBuilder::new()
            .block(
                BlockBuilder::new(
                    "shore",
                    Function::Uid(vec![UidArg::Var("f".into())]),
                )
                .select(Sel::pred("age")),
            )
            .block(
                BlockBuilder::var("v", Function::Has(Attr::new("age")))
                    .select(Sel::pred("friend").bind("f")),
            )
            .build()
            .unwrap();
        let levels = analyze(&q, &schema()).unwrap();
        assert_eq!(levels, vec![vec![1], vec![0]]);
    }

    #[test]
    fn cycles_are_fatal() {
        let q = QueryBuilder::new()
            .block(
                BlockBuilder::var("a", Function::Uid(vec![UidArg::Var("y".into())]))
                    .select(Sel::pred("friend").bind("x")),
            )
            .block(
                BlockBuilder::var("b", Function::Uid(vec![UidArg::Var("x".into())]))
                    .select(Sel::pred("friend").bind("y")),
            )
            .build()
            .unwrap();
        let err = analyze(&q, &schema()).unwrap_err();
        assert_eq!(err.code(), "CyclicVariableDependency");
    }
}
