//! Subgraph execution.
//!
//! Each block runs through the same stages: root resolution, filter,
//! order, level-by-level child expansion, cascade pruning, pagination.
//! Expansion is batched per level so that value variables bound anywhere in
//! a level are visible to math and aggregate selections of that level.
//! Blocks of one dependency level run on scoped threads bounded by
//! [`ExecOptions::max_concurrency`], each writing a private variable delta
//! that is merged in declaration order, so results are deterministic
//! regardless of scheduling.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use time::OffsetDateTime;
use tracing::{debug, trace};

use crate::schema::Schema;
use crate::store::{Allocator, Facets, ReadStore};
use crate::types::{CompareOp, QueryError, Result, TypedValue, Uid, ValueType};

use super::assemble;
use super::ast::{
    Attr, Block, Cascade, FilterExpr, FuncArg, Function, GroupAggOp, GroupBy, OrderKey, OrderSpec,
    Pagination, Query, Selection, SelectionSource,
};
use super::func::FuncCtx;
use super::math::MathEvaluator;
use super::vars::{aggregate_values, analyze, VarTable, VarView};

/// Execution tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct ExecOptions {
    /// Upper bound on sibling blocks evaluated concurrently.
    pub max_concurrency: usize,
    /// Fixed evaluation instant for `since()`; defaults to wall clock.
    pub now: Option<OffsetDateTime>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        ExecOptions { max_concurrency: 8, now: None }
    }
}

impl ExecOptions {
    /// Defaults.
    pub fn new() -> Self {
        ExecOptions::default()
    }

    /// Sets the sibling-block concurrency bound (at least 1).
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    /// Pins the evaluation instant, for reproducible `since()` results.
    pub fn fixed_now(mut self, now: OffsetDateTime) -> Self {
        self.now = Some(now);
        self
    }
}

/// One synthetic count object (`{"count": n}`).
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CountEntry {
    pub key: String,
    pub n: i64,
}

/// One group produced by `@groupby`.
#[derive(Clone, Debug)]
pub(crate) struct GroupResult {
    pub keys: Vec<(String, TypedValue)>,
    pub aggs: Vec<(String, TypedValue)>,
}

/// A field attached to a result node, in emission order.
#[derive(Clone, Debug)]
pub(crate) enum Field {
    Scalar(String, TypedValue),
    List(String, Vec<TypedValue>),
    Children { key: String, nodes: Vec<NodeResult>, counts: Vec<CountEntry> },
    Groups(String, Vec<GroupResult>),
}

/// Internal per-node result tree handed to the assembler.
#[derive(Clone, Debug)]
pub(crate) struct NodeResult {
    pub uid: Uid,
    pub fields: Vec<Field>,
}

impl NodeResult {
    /// Uids of every node in this subtree, excluding the node itself.
    fn descendants(&self, out: &mut FxHashSet<Uid>) {
        for f in &self.fields {
            if let Field::Children { nodes, .. } = f {
                for n in nodes {
                    out.insert(n.uid);
                    n.descendants(out);
                }
            }
        }
    }
}

/// Executed output of one block.
#[derive(Clone, Debug)]
pub(crate) struct BlockOut {
    pub nodes: Vec<NodeResult>,
    pub counts: Vec<CountEntry>,
}

/// Expansion input: the nodes at one level under one parent.
struct LevelGroup {
    parent: Uid,
    uids: Vec<Uid>,
}

/// Expansion output for one [`LevelGroup`].
struct GroupOut {
    nodes: Vec<NodeResult>,
    counts: Vec<CountEntry>,
}

/// Shell of a node being expanded; fields are kept per selection index so
/// the two evaluation passes can fill them out of order while emission
/// order stays declaration order.
struct Shell {
    uid: Uid,
    fields: Vec<Vec<Field>>,
}

/// Query executor over a pinned store snapshot.
pub struct Executor<'a> {
    store: &'a dyn ReadStore,
    schema: &'a Schema,
    alloc: Option<&'a dyn Allocator>,
    opts: ExecOptions,
}

impl<'a> Executor<'a> {
    /// Executor with default options.
    pub fn new(store: &'a dyn ReadStore, schema: &'a Schema) -> Self {
        Executor { store, schema, alloc: None, opts: ExecOptions::default() }
    }

    /// Replaces the options.
    pub fn options(mut self, opts: ExecOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Attaches an allocator; a read timestamp is pinned per query.
    pub fn allocator(mut self, alloc: &'a dyn Allocator) -> Self {
        self.alloc = Some(alloc);
        self
    }

    /// Executes a query to its JSON result tree.
    pub fn execute(&self, query: &Query) -> Result<serde_json::Value> {
        self.execute_with_cancel(query, &Arc::new(AtomicBool::new(false)))
    }

    /// Executes with an external cancellation token. A fired token aborts
    /// the query with [`QueryError::Cancelled`] and returns no partial
    /// data.
    pub fn execute_with_cancel(
        &self,
        query: &Query,
        cancel: &Arc<AtomicBool>,
    ) -> Result<serde_json::Value> {
        let levels = analyze(query, self.schema)?;
        let read_ts = self.alloc.map(|a| a.assign_timestamp(true)).unwrap_or_default();
        debug!(read_ts, blocks = query.blocks.len(), "query start");
        let now = self.opts.now.unwrap_or_else(OffsetDateTime::now_utc);
        let declared = declared_vars(query);

        let global = VarTable::new();
        let mut outputs: Vec<Option<BlockOut>> = query.blocks.iter().map(|_| None).collect();
        for level in &levels {
            let mut results: Vec<(usize, Result<(BlockOut, VarTable)>)> =
                Vec::with_capacity(level.len());
            if level.len() == 1 || self.opts.max_concurrency == 1 {
                for &i in level {
                    results.push((
                        i,
                        self.run_block(&query.blocks[i], &global, &declared, cancel, now),
                    ));
                }
            } else {
                for chunk in level.chunks(self.opts.max_concurrency) {
                    std::thread::scope(|scope| {
                        let handles: Vec<_> = chunk
                            .iter()
                            .map(|&i| {
                                let global = &global;
                                let declared = &declared;
                                scope.spawn(move || {
                                    let r = self.run_block(
                                        &query.blocks[i],
                                        global,
                                        declared,
                                        cancel,
                                        now,
                                    );
                                    if r.is_err() {
                                        cancel.store(true, AtomicOrdering::Release);
                                    }
                                    (i, r)
                                })
                            })
                            .collect();
                        for h in handles {
                            match h.join() {
                                Ok(entry) => results.push(entry),
                                Err(_) => results.push((
                                    usize::MAX,
                                    Err(QueryError::Cancelled),
                                )),
                            }
                        }
                    });
                }
            }
            // Merge in declaration order for deterministic variable state.
            results.sort_by_key(|(i, _)| *i);
            for (i, res) in results {
                let (out, delta) = res?;
                global.merge_from(delta)?;
                outputs[i] = Some(out);
            }
        }
        assemble::assemble(query, outputs)
    }

    fn check(&self, cancel: &AtomicBool) -> Result<()> {
        if cancel.load(AtomicOrdering::Acquire) {
            return Err(QueryError::Cancelled);
        }
        Ok(())
    }

    fn run_block(
        &self,
        block: &Block,
        global: &VarTable,
        declared: &FxHashSet<String>,
        cancel: &AtomicBool,
        now: OffsetDateTime,
    ) -> Result<(BlockOut, VarTable)> {
        let delta = VarTable::new();
        let out = {
            let view = VarView { global, delta: &delta };
            let ctx = FuncCtx { store: self.store, schema: self.schema, vars: &view };
            self.check(cancel)?;
            let mut roots = ctx.eval_root(&block.root)?;
            if let Some(f) = &block.filter {
                roots = ctx.eval_filter(f, &roots)?;
            }
            self.sort_uids(&ctx, declared, &mut roots, &block.order)?;
            debug!(block = %block.name, roots = roots.len(), "root resolved");
            let groups = vec![LevelGroup { parent: Uid::ZERO, uids: roots }];
            let mut expanded = self.expand_level(
                &ctx,
                &delta,
                declared,
                cancel,
                now,
                &block.selections,
                groups,
                block.cascade.as_ref(),
            )?;
            let GroupOut { mut nodes, counts } = expanded.remove(0);
            paginate_nodes(&mut nodes, &block.page);
            BlockOut { nodes, counts }
        };
        Ok((out, delta))
    }

    /// Orders `uids` in place per the order annotations. Nodes without a
    /// value for the primary key go last, ascending by uid; `val()` keys
    /// drop unbound nodes first. Ties always break ascending by uid.
    fn sort_uids(
        &self,
        ctx: &FuncCtx<'_>,
        declared: &FxHashSet<String>,
        uids: &mut Vec<Uid>,
        orders: &[OrderSpec],
    ) -> Result<()> {
        if orders.is_empty() {
            return Ok(());
        }
        for o in orders {
            match &o.key {
                OrderKey::Predicate(p, _) => {
                    self.schema.sortable(p)?;
                }
                OrderKey::Val(v) => {
                    if !declared.contains(v) {
                        return Err(QueryError::UnknownSortAttribute(v.clone()));
                    }
                    let map = ctx.vars.value_map(v);
                    uids.retain(|u| map.contains_key(u));
                }
            }
        }
        let keys: FxHashMap<Uid, Vec<Option<TypedValue>>> = uids
            .iter()
            .map(|&u| {
                let ks = orders
                    .iter()
                    .map(|o| match &o.key {
                        OrderKey::Predicate(p, langs) => {
                            let attr = Attr { name: p.clone(), langs: langs.clone() };
                            ctx.node_values(u, &attr).into_iter().next()
                        }
                        OrderKey::Val(v) => ctx.vars.value_of(v, u),
                    })
                    .collect();
                (u, ks)
            })
            .collect();
        uids.sort_by(|a, b| {
            let (ka, kb) = (&keys[a], &keys[b]);
            for (o, (va, vb)) in orders.iter().zip(ka.iter().zip(kb.iter())) {
                let ord = cmp_sort_key(va, vb, o.desc);
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            a.cmp(b)
        });
        Ok(())
    }

    /// Expands one level for every parent group at once.
    #[allow(clippy::too_many_arguments)]
    fn expand_level(
        &self,
        ctx: &FuncCtx<'_>,
        delta: &VarTable,
        declared: &FxHashSet<String>,
        cancel: &AtomicBool,
        now: OffsetDateTime,
        selections: &[Selection],
        groups: Vec<LevelGroup>,
        cascade: Option<&Cascade>,
    ) -> Result<Vec<GroupOut>> {
        self.check(cancel)?;
        let mut level_uids: Vec<Uid> = Vec::new();
        let mut seen = FxHashSet::default();
        for g in &groups {
            for &u in &g.uids {
                if seen.insert(u) {
                    level_uids.push(u);
                }
            }
        }

        let mut shells: Vec<Vec<Shell>> = groups
            .iter()
            .map(|g| {
                g.uids
                    .iter()
                    .map(|&u| Shell { uid: u, fields: vec![Vec::new(); selections.len()] })
                    .collect()
            })
            .collect();
        let mut counts: Vec<Vec<CountEntry>> = groups.iter().map(|_| Vec::new()).collect();

        // Pass 1: storage-backed selections and variable binding.
        for (idx, sel) in selections.iter().enumerate() {
            match &sel.source {
                SelectionSource::Predicate { name, reverse, count: false } => {
                    let is_edge = *reverse || self.schema.value_type(name) == ValueType::Uid;
                    if is_edge {
                        self.expand_edges(
                            ctx, delta, declared, cancel, now, sel, idx, name, *reverse,
                            &mut shells, cascade,
                        )?;
                    } else {
                        self.expand_scalar(ctx, delta, sel, idx, name, &mut shells)?;
                    }
                }
                SelectionSource::Predicate { name, count: true, .. } => {
                    let key = sel.alias.clone().unwrap_or_else(|| format!("count({name})"));
                    let emit = self.schema.contains(name);
                    for group in shells.iter_mut() {
                        for shell in group.iter_mut() {
                            let n = fanout(ctx.store, shell.uid, name);
                            if let Some(bind) = &sel.bind {
                                delta.bind_value(bind, shell.uid, TypedValue::Int(n))?;
                            }
                            if emit {
                                shell.fields[idx]
                                    .push(Field::Scalar(key.clone(), TypedValue::Int(n)));
                            }
                        }
                    }
                }
                SelectionSource::Uid => {
                    let key = sel.alias.clone().unwrap_or_else(|| "uid".to_owned());
                    for group in shells.iter_mut() {
                        for shell in group.iter_mut() {
                            shell.fields[idx]
                                .push(Field::Scalar(key.clone(), TypedValue::Uid(shell.uid)));
                        }
                    }
                }
                SelectionSource::CountUid => {
                    let key = sel.alias.clone().unwrap_or_else(|| "count".to_owned());
                    for (gi, g) in groups.iter().enumerate() {
                        let n = g.uids.len() as i64;
                        if let Some(bind) = &sel.bind {
                            delta.bind_value(bind, g.parent, TypedValue::Int(n))?;
                        }
                        counts[gi].push(CountEntry { key: key.clone(), n });
                    }
                }
                SelectionSource::Val(_)
                | SelectionSource::Aggregate(..)
                | SelectionSource::Math(_) => {}
            }
        }

        // Pass 2: value-variable consumers, now that level bindings exist.
        let view = ctx.vars;
        for (idx, sel) in selections.iter().enumerate() {
            match &sel.source {
                SelectionSource::Val(var) => {
                    let key = sel.alias.clone().unwrap_or_else(|| format!("val({var})"));
                    for group in shells.iter_mut() {
                        for shell in group.iter_mut() {
                            if let Some(v) = view.value_of(var, shell.uid) {
                                if let Some(bind) = &sel.bind {
                                    delta.bind_value(bind, shell.uid, v.clone())?;
                                }
                                shell.fields[idx].push(Field::Scalar(key.clone(), v));
                            }
                        }
                    }
                }
                SelectionSource::Aggregate(op, var) => {
                    let key = sel
                        .alias
                        .clone()
                        .unwrap_or_else(|| format!("{}(val({var}))", op.name()));
                    let map = view.value_map(var);
                    // A variable produced by this block's own expansion
                    // aggregates per node over its expanded descendants;
                    // one produced elsewhere aggregates over all bindings.
                    let local = !delta.value_map(var).is_empty();
                    for group in shells.iter_mut() {
                        for shell in group.iter_mut() {
                            let agg = if local {
                                let mut descendants = FxHashSet::default();
                                let node = shell_as_node(shell);
                                node.descendants(&mut descendants);
                                aggregate_values(
                                    *op,
                                    map.iter()
                                        .filter(|(u, _)| descendants.contains(u))
                                        .map(|(_, v)| v),
                                )
                            } else {
                                aggregate_values(*op, map.values())
                            };
                            if let Some(v) = agg {
                                if let Some(bind) = &sel.bind {
                                    delta.bind_value(bind, shell.uid, v.clone())?;
                                }
                                shell.fields[idx].push(Field::Scalar(key.clone(), v));
                            }
                        }
                    }
                }
                SelectionSource::Math(expr) => {
                    let ev = MathEvaluator::prepare(expr, view, &level_uids, now);
                    for group in shells.iter_mut() {
                        for shell in group.iter_mut() {
                            match ev.eval(expr, shell.uid) {
                                Ok(v) => {
                                    if let Some(bind) = &sel.bind {
                                        delta.bind_value(bind, shell.uid, v.clone())?;
                                    }
                                    if let Some(alias) = &sel.alias {
                                        shell.fields[idx]
                                            .push(Field::Scalar(alias.clone(), v));
                                    }
                                }
                                Err(QueryError::TypeMismatch(reason)) => {
                                    trace!(uid = %shell.uid, reason = %reason, "math skipped");
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // Cascade pruning after the whole level is known. Children were
        // already pruned inside the recursive expansion, so an empty edge
        // here means every target was filtered or cascaded away and the
        // requirement fails, propagating the prune upward.
        if let Some(c) = cascade {
            let required = required_indices(selections, c);
            for group in shells.iter_mut() {
                group.retain(|shell| {
                    required.iter().all(|&i| {
                        matches!(
                            selections[i].source,
                            SelectionSource::Uid | SelectionSource::CountUid
                        ) || shell.fields[i].iter().any(field_present)
                    })
                });
            }
        }

        Ok(shells
            .into_iter()
            .zip(counts)
            .map(|(group, counts)| GroupOut {
                nodes: group
                    .into_iter()
                    .map(|s| NodeResult {
                        uid: s.uid,
                        fields: s.fields.into_iter().flatten().collect(),
                    })
                    .collect(),
                counts,
            })
            .collect())
    }

    /// Expands a scalar predicate for every shell of the level.
    fn expand_scalar(
        &self,
        ctx: &FuncCtx<'_>,
        delta: &VarTable,
        sel: &Selection,
        idx: usize,
        name: &str,
        shells: &mut [Vec<Shell>],
    ) -> Result<()> {
        let list = self.schema.get(name).is_some_and(|p| p.list);
        let base = sel.alias.clone().unwrap_or_else(|| display_key(name, &sel.langs));
        for group in shells.iter_mut() {
            for shell in group.iter_mut() {
                let Some(postings) = ctx.store.postings(shell.uid, name) else {
                    continue;
                };
                let values = postings.values();
                if sel.langs.first().map(String::as_str) == Some("*") {
                    // One key per tag, the untagged value under the bare
                    // name, tags in first-seen storage order.
                    let mut emitted: Vec<(String, TypedValue)> = Vec::new();
                    for v in values {
                        let key = match &v.lang {
                            None => name.to_owned(),
                            Some(tag) => format!("{name}@{tag}"),
                        };
                        emitted.push((key, v.value.clone()));
                        if let Some(bind) = &sel.bind {
                            delta.bind_value(bind, shell.uid, v.value.clone())?;
                        }
                    }
                    for (key, v) in emitted {
                        shell.fields[idx].push(Field::Scalar(key, v));
                    }
                    continue;
                }
                let attr = Attr { name: name.to_owned(), langs: sel.langs.clone() };
                let resolved = ctx.node_values(shell.uid, &attr);
                if let Some(bind) = &sel.bind {
                    for v in &resolved {
                        delta.bind_value(bind, shell.uid, v.clone())?;
                    }
                }
                if resolved.is_empty() {
                    continue;
                }
                if list {
                    shell.fields[idx].push(Field::List(base.clone(), resolved.clone()));
                } else {
                    shell.fields[idx]
                        .push(Field::Scalar(base.clone(), resolved[0].clone()));
                }
                // Facets on a scalar predicate sit beside the value.
                if let Some(spec) = &sel.facets {
                    if let Some(posting) = values.iter().find(|v| v.lang.is_none()) {
                        for f in facet_fields(&base, &posting.facets, spec) {
                            shell.fields[idx].push(f);
                        }
                        for fk in &spec.keys {
                            let Some(bind) = &fk.bind else { continue };
                            if let Some(facet) =
                                posting.facets.iter().find(|f| f.key == fk.key)
                            {
                                delta.bind_value(bind, shell.uid, facet.value.clone())?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Expands a uid-edge predicate: facet filter, target filter, order,
    /// recursion into children, cascade, pagination, facet emission.
    #[allow(clippy::too_many_arguments)]
    fn expand_edges(
        &self,
        ctx: &FuncCtx<'_>,
        delta: &VarTable,
        declared: &FxHashSet<String>,
        cancel: &AtomicBool,
        now: OffsetDateTime,
        sel: &Selection,
        idx: usize,
        name: &str,
        reverse: bool,
        shells: &mut [Vec<Shell>],
        inherited_cascade: Option<&Cascade>,
    ) -> Result<()> {
        let key = sel.alias.clone().unwrap_or_else(|| {
            if reverse {
                format!("~{name}")
            } else {
                name.to_owned()
            }
        });
        // Collect surviving edges per occurrence first, then recurse once
        // over all occurrences so child math sees the whole level.
        let mut per_occurrence: Vec<(usize, usize, Vec<(Uid, Facets)>)> = Vec::new();
        for (gi, group) in shells.iter().enumerate() {
            for (si, shell) in group.iter().enumerate() {
                let mut edges: Vec<(Uid, Facets)> = if reverse {
                    ctx.store
                        .reverse_edges(shell.uid, name)
                        .into_iter()
                        .map(|u| (u, Facets::new()))
                        .collect()
                } else {
                    ctx.store
                        .postings(shell.uid, name)
                        .map(|p| {
                            p.edges()
                                .iter()
                                .map(|e| (e.target, e.facets.clone()))
                                .collect()
                        })
                        .unwrap_or_default()
                };
                if edges.is_empty() {
                    continue;
                }
                if let Some(spec) = &sel.facets {
                    if let Some(filter) = &spec.filter {
                        edges.retain(|(_, facets)| facet_filter_matches(filter, facets));
                    }
                }
                if let Some(filter) = &sel.filter {
                    let kept: FxHashSet<Uid> = ctx
                        .eval_filter(filter, &edges.iter().map(|(u, _)| *u).collect::<Vec<_>>())?
                        .into_iter()
                        .collect();
                    edges.retain(|(u, _)| kept.contains(u));
                }
                // Order by predicate/variable, or by a facet value.
                if !sel.order.is_empty() {
                    let mut targets: Vec<Uid> = edges.iter().map(|(u, _)| *u).collect();
                    self.sort_uids(ctx, declared, &mut targets, &sel.order)?;
                    edges = reorder_edges(edges, &targets);
                } else if let Some(spec) = &sel.facets {
                    if let Some(order) = &spec.order {
                        edges = sort_edges_by_facet(edges, order);
                    }
                }
                if let Some(bind) = &sel.bind {
                    delta.bind_uids(bind, edges.iter().map(|(u, _)| *u))?;
                }
                if let Some(spec) = &sel.facets {
                    for fk in &spec.keys {
                        if let Some(bind) = &fk.bind {
                            for (target, facets) in &edges {
                                if let Some(f) = facets.iter().find(|f| f.key == fk.key) {
                                    delta.bind_value(bind, *target, f.value.clone())?;
                                }
                            }
                        }
                    }
                }
                per_occurrence.push((gi, si, edges));
            }
        }

        if let Some(gb) = &sel.groupby {
            for (gi, si, edges) in per_occurrence {
                let targets: Vec<Uid> = edges.iter().map(|(u, _)| *u).collect();
                let groups = self.compute_groups(ctx, delta, gb, &targets)?;
                if !groups.is_empty() {
                    shells[gi][si].fields[idx].push(Field::Groups(key.clone(), groups));
                }
            }
            return Ok(());
        }

        let child_cascade = sel.cascade.as_ref().or(inherited_cascade);
        let child_groups: Vec<LevelGroup> = per_occurrence
            .iter()
            .map(|(gi, si, edges)| LevelGroup {
                parent: shells[*gi][*si].uid,
                uids: edges.iter().map(|(u, _)| *u).collect(),
            })
            .collect();
        let child_out = self.expand_level(
            ctx,
            delta,
            declared,
            cancel,
            now,
            &sel.children,
            child_groups,
            child_cascade,
        )?;

        for ((gi, si, edges), out) in per_occurrence.into_iter().zip(child_out) {
            let GroupOut { mut nodes, counts } = out;
            // Facets on uid edges land inside the child object.
            if let Some(spec) = &sel.facets {
                for node in nodes.iter_mut() {
                    if let Some((_, facets)) = edges.iter().find(|(u, _)| *u == node.uid) {
                        node.fields.extend(facet_fields(&key, facets, spec));
                    }
                }
            }
            paginate_nodes(&mut nodes, &sel.page);
            shells[gi][si].fields[idx].push(Field::Children { key: key.clone(), nodes, counts });
        }
        Ok(())
    }

    /// Partitions `targets` by the group-by key tuple and computes the
    /// declared aggregates. Groups come out ordered by (size, key tuple).
    fn compute_groups(
        &self,
        ctx: &FuncCtx<'_>,
        delta: &VarTable,
        gb: &GroupBy,
        targets: &[Uid],
    ) -> Result<Vec<GroupResult>> {
        let mut partitions: Vec<(Vec<TypedValue>, Vec<Uid>)> = Vec::new();
        for &t in targets {
            let mut per_key: Vec<Vec<TypedValue>> = Vec::with_capacity(gb.keys.len());
            let mut excluded = false;
            for k in &gb.keys {
                let vals = if self.schema.value_type(&k.pred) == ValueType::Uid {
                    ctx.store
                        .postings(t, &k.pred)
                        .map(|p| {
                            p.edges().iter().map(|e| TypedValue::Uid(e.target)).collect()
                        })
                        .unwrap_or_default()
                } else {
                    let attr = Attr { name: k.pred.clone(), langs: k.langs.clone() };
                    ctx.node_values(t, &attr)
                };
                if vals.is_empty() {
                    excluded = true;
                    break;
                }
                per_key.push(vals);
            }
            if excluded {
                continue;
            }
            // Members with several values for one key join every matching
            // group.
            for tuple in cartesian(&per_key) {
                match partitions.iter_mut().find(|(k, _)| *k == tuple) {
                    Some((_, members)) => members.push(t),
                    None => partitions.push((tuple, vec![t])),
                }
            }
        }
        partitions.sort_by(|(ka, ma), (kb, mb)| {
            ma.len().cmp(&mb.len()).then_with(|| cmp_tuples(ka, kb))
        });
        let mut out = Vec::with_capacity(partitions.len());
        for (tuple, members) in partitions {
            let keys: Vec<(String, TypedValue)> = gb
                .keys
                .iter()
                .zip(tuple.iter())
                .map(|(k, v)| (k.alias.clone().unwrap_or_else(|| k.pred.clone()), v.clone()))
                .collect();
            let mut aggs = Vec::with_capacity(gb.aggs.len());
            for agg in &gb.aggs {
                let (default_key, value) = match &agg.op {
                    GroupAggOp::CountUid => {
                        let n = members.len() as i64;
                        if let Some(bind) = &agg.bind {
                            // A count bound under a single uid key is
                            // keyed by that group's uid.
                            if let Some(TypedValue::Uid(u)) = tuple.first() {
                                if tuple.len() == 1 {
                                    delta.bind_value(bind, *u, TypedValue::Int(n))?;
                                }
                            }
                        }
                        ("count".to_owned(), Some(TypedValue::Int(n)))
                    }
                    GroupAggOp::Min(p) => {
                        (format!("min({p})"), member_agg(ctx, &members, p, super::ast::AggOp::Min))
                    }
                    GroupAggOp::Max(p) => {
                        (format!("max({p})"), member_agg(ctx, &members, p, super::ast::AggOp::Max))
                    }
                    GroupAggOp::Sum(p) => {
                        (format!("sum({p})"), member_agg(ctx, &members, p, super::ast::AggOp::Sum))
                    }
                };
                if let Some(v) = value {
                    aggs.push((agg.alias.clone().unwrap_or(default_key), v));
                }
            }
            out.push(GroupResult { keys, aggs });
        }
        Ok(out)
    }
}

/// Whether a field satisfies a cascade requirement. An edge field with no
/// surviving targets and no counts does not.
fn field_present(f: &Field) -> bool {
    match f {
        Field::Children { nodes, counts, .. } => !nodes.is_empty() || !counts.is_empty(),
        Field::Groups(_, groups) => !groups.is_empty(),
        Field::Scalar(..) | Field::List(..) => true,
    }
}

fn shell_as_node(shell: &Shell) -> NodeResult {
    NodeResult {
        uid: shell.uid,
        fields: shell.fields.iter().flatten().cloned().collect(),
    }
}

fn declared_vars(query: &Query) -> FxHashSet<String> {
    fn walk(sel: &Selection, out: &mut FxHashSet<String>) {
        if let Some(b) = &sel.bind {
            out.insert(b.clone());
        }
        if let Some(f) = &sel.facets {
            for k in &f.keys {
                if let Some(b) = &k.bind {
                    out.insert(b.clone());
                }
            }
        }
        if let Some(g) = &sel.groupby {
            for a in &g.aggs {
                if let Some(b) = &a.bind {
                    out.insert(b.clone());
                }
            }
        }
        for c in &sel.children {
            walk(c, out);
        }
    }
    let mut out = FxHashSet::default();
    for b in &query.blocks {
        for s in &b.selections {
            walk(s, &mut out);
        }
    }
    out
}

fn fanout(store: &dyn ReadStore, uid: Uid, pred: &str) -> i64 {
    store
        .postings(uid, pred)
        .map(|p| (p.edges().len() + p.values().len()) as i64)
        .unwrap_or(0)
}

fn display_key(name: &str, langs: &[String]) -> String {
    if langs.is_empty() {
        name.to_owned()
    } else {
        format!("{name}@{}", langs.join(":"))
    }
}

fn cmp_sort_key(
    a: &Option<TypedValue>,
    b: &Option<TypedValue>,
    desc: bool,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(va), Some(vb)) => {
            let ord = va.ordering(vb).unwrap_or(Ordering::Equal);
            if desc {
                ord.reverse()
            } else {
                ord
            }
        }
        // Value-less nodes go last regardless of direction.
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Applies `after`, a zero-clamped `offset`, and `first` (negative takes
/// from the end) to an already ordered node list.
fn paginate_nodes(nodes: &mut Vec<NodeResult>, page: &Pagination) {
    if page.is_default() {
        return;
    }
    if let Some(after) = page.after {
        nodes.retain(|n| n.uid > after);
    }
    let offset = page.offset.max(0) as usize;
    if offset > 0 {
        if offset >= nodes.len() {
            nodes.clear();
        } else {
            nodes.drain(..offset);
        }
    }
    if let Some(first) = page.first {
        if first >= 0 {
            nodes.truncate(first as usize);
        } else {
            let keep = (-first) as usize;
            if nodes.len() > keep {
                nodes.drain(..nodes.len() - keep);
            }
        }
    }
}

fn reorder_edges(edges: Vec<(Uid, Facets)>, order: &[Uid]) -> Vec<(Uid, Facets)> {
    let mut by_uid: FxHashMap<Uid, Vec<(Uid, Facets)>> = FxHashMap::default();
    for e in edges {
        by_uid.entry(e.0).or_default().push(e);
    }
    let mut out = Vec::new();
    for u in order {
        if let Some(mut es) = by_uid.remove(u) {
            out.append(&mut es);
        }
    }
    out
}

fn sort_edges_by_facet(mut edges: Vec<(Uid, Facets)>, order: &OrderSpec) -> Vec<(Uid, Facets)> {
    let OrderKey::Predicate(facet_key, _) = &order.key else {
        return edges;
    };
    let value_of = |facets: &Facets| -> Option<TypedValue> {
        facets.iter().find(|f| &f.key == facet_key).map(|f| f.value.clone())
    };
    edges.sort_by(|(ua, fa), (ub, fb)| {
        cmp_sort_key(&value_of(fa), &value_of(fb), order.desc).then(ua.cmp(ub))
    });
    edges
}

/// Evaluates an edge-pruning facet filter; a missing facet fails the
/// comparison, pruning the edge.
fn facet_filter_matches(expr: &FilterExpr, facets: &Facets) -> bool {
    let lookup = |attr: &Attr| -> Option<TypedValue> {
        facets.iter().find(|f| f.key == attr.name).map(|f| f.value.clone())
    };
    let compare = |op: CompareOp, attr: &Attr, lit: &TypedValue| -> bool {
        let Some(have) = lookup(attr) else {
            return false;
        };
        let against = lit.convert(have.value_type()).unwrap_or_else(|_| lit.clone());
        TypedValue::compare(op, &have, &against).unwrap_or(false)
    };
    match expr {
        FilterExpr::Func(f) => match f {
            Function::Eq(attr, args) => args.iter().any(|a| match a {
                FuncArg::Lit(v) => compare(CompareOp::Eq, attr, v),
                FuncArg::Val(_) => false,
            }),
            Function::Cmp(op, attr, FuncArg::Lit(v)) => compare(*op, attr, v),
            Function::Between(attr, lo, hi) => {
                compare(CompareOp::Ge, attr, lo) && compare(CompareOp::Le, attr, hi)
            }
            Function::Has(attr) => lookup(attr).is_some(),
            _ => false,
        },
        FilterExpr::And(parts) => parts.iter().all(|p| facet_filter_matches(p, facets)),
        FilterExpr::Or(parts) => parts.iter().any(|p| facet_filter_matches(p, facets)),
        FilterExpr::Not(p) => !facet_filter_matches(p, facets),
    }
}

/// Facet output fields for one edge or posting, under `base|facet` keys
/// (facet aliases replace the whole key).
fn facet_fields(base: &str, facets: &Facets, spec: &super::ast::FacetSpec) -> Vec<Field> {
    let mut out = Vec::new();
    if spec.all {
        for f in facets {
            out.push(Field::Scalar(format!("{base}|{}", f.key), f.value.clone()));
        }
    }
    for k in &spec.keys {
        if k.bind.is_some() && k.alias.is_none() {
            // A pure binding emits nothing.
            continue;
        }
        if let Some(f) = facets.iter().find(|f| f.key == k.key) {
            let key = k
                .alias
                .clone()
                .unwrap_or_else(|| format!("{base}|{}", f.key));
            out.push(Field::Scalar(key, f.value.clone()));
        }
    }
    out
}

fn required_indices(selections: &[Selection], cascade: &Cascade) -> Vec<usize> {
    match cascade {
        Cascade::All => (0..selections.len()).collect(),
        Cascade::Fields(fields) => selections
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                let name = match &s.source {
                    SelectionSource::Predicate { name, .. } => name.as_str(),
                    SelectionSource::Uid => "uid",
                    SelectionSource::Val(v) | SelectionSource::Aggregate(_, v) => v.as_str(),
                    SelectionSource::CountUid | SelectionSource::Math(_) => "",
                };
                fields.iter().any(|f| f == name)
                    || s.alias.as_deref().is_some_and(|a| fields.iter().any(|f| f == a))
            })
            .map(|(i, _)| i)
            .collect(),
    }
}

fn member_agg(
    ctx: &FuncCtx<'_>,
    members: &[Uid],
    pred: &str,
    op: super::ast::AggOp,
) -> Option<TypedValue> {
    let attr = Attr::new(pred);
    let values: Vec<TypedValue> = members
        .iter()
        .flat_map(|&m| ctx.node_values(m, &attr).into_iter().next())
        .collect();
    if values.is_empty() {
        return None;
    }
    aggregate_values(op, values.iter())
}

fn cartesian(per_key: &[Vec<TypedValue>]) -> Vec<Vec<TypedValue>> {
    let mut tuples: Vec<Vec<TypedValue>> = vec![Vec::new()];
    for vals in per_key {
        let mut next = Vec::with_capacity(tuples.len() * vals.len());
        for t in &tuples {
            for v in vals {
                let mut t = t.clone();
                t.push(v.clone());
                next.push(t);
            }
        }
        tuples = next;
    }
    tuples
}

fn cmp_tuples(a: &[TypedValue], b: &[TypedValue]) -> std::cmp::Ordering {
    for (va, vb) in a.iter().zip(b.iter()) {
        let ord = va.ordering(vb).unwrap_or(std::cmp::Ordering::Equal);
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}
