//! Root-function and filter evaluation.
//!
//! Both paths produce ordered uid sets. Dispatch is one closed match over
//! the operator enum. Index-backed and scan-backed predicates share the
//! same per-node comparison code, so missing indexes change cost, never
//! results. Type mismatches while testing one node are contained (that
//! node fails the test); argument errors, placement errors, and invalid
//! patterns abort the query.

use regex::Regex;
use rustc_hash::FxHashSet;

use crate::schema::{Schema, TYPE_PREDICATE};
use crate::store::ReadStore;
use crate::types::{CompareOp, QueryError, Result, TypedValue, Uid, ValueType};

use super::ast::{Attr, FilterExpr, FuncArg, Function, UidArg};
use super::vars::VarReader;

/// Shared read context for function evaluation.
pub struct FuncCtx<'a> {
    /// Storage reads.
    pub store: &'a dyn ReadStore,
    /// Predicate schemas.
    pub schema: &'a Schema,
    /// Variable reads.
    pub vars: &'a dyn VarReader,
}

impl FuncCtx<'_> {
    /// Resolves a root function to its ascending candidate set.
    pub fn eval_root(&self, f: &Function) -> Result<Vec<Uid>> {
        match f {
            Function::Uid(args) => {
                let mut uids = Vec::new();
                for arg in args {
                    match arg {
                        UidArg::Lit(u) => uids.push(*u),
                        UidArg::Var(name) => uids.extend(self.vars.uid_set(name)),
                    }
                }
                uids.sort_unstable();
                uids.dedup();
                uids.retain(|u| *u != Uid::ZERO);
                Ok(uids)
            }
            Function::LenCmp(..) | Function::UidIn(..) => Err(
                QueryError::InvalidFunctionPlacement(f.name().to_owned()),
            ),
            Function::CountCmp(op, pred, n) => {
                let mut out = Vec::new();
                for uid in self.store.all_subjects() {
                    if cmp_i64(*op, self.fanout(uid, pred), *n) {
                        out.push(uid);
                    }
                }
                Ok(out)
            }
            Function::Has(attr) => {
                let mut out = self.store.subjects_with(&attr.name);
                out.retain(|u| !self.node_values(*u, attr).is_empty() || self.has_edges(*u, attr));
                Ok(out)
            }
            Function::Type(t) => {
                let mut out = self.store.subjects_with(TYPE_PREDICATE);
                out.retain(|u| self.node_has_type(*u, t));
                Ok(out)
            }
            Function::Regexp(_, pattern) => {
                // Compile before scanning so a bad pattern is fatal even on
                // an empty candidate set.
                let re = compile_regex(pattern)?;
                self.scan(f, Some(&re))
            }
            _ => self.scan(f, None),
        }
    }

    /// Applies a filter tree to an ordered candidate set, preserving order.
    pub fn eval_filter(&self, expr: &FilterExpr, candidates: &[Uid]) -> Result<Vec<Uid>> {
        match expr {
            FilterExpr::Func(f) => {
                let precompiled = match f {
                    Function::Regexp(_, pattern) => Some(compile_regex(pattern)?),
                    _ => None,
                };
                if let Function::UidIn(_, args) = f {
                    validate_uid_in(args)?;
                }
                let mut out = Vec::with_capacity(candidates.len());
                for &uid in candidates {
                    if self.node_matches(f, uid, precompiled.as_ref(), false)? {
                        out.push(uid);
                    }
                }
                Ok(out)
            }
            FilterExpr::And(parts) => {
                let mut current = candidates.to_vec();
                for p in parts {
                    current = self.eval_filter(p, &current)?;
                }
                Ok(current)
            }
            FilterExpr::Or(parts) => {
                let mut keep: FxHashSet<Uid> = FxHashSet::default();
                for p in parts {
                    keep.extend(self.eval_filter(p, candidates)?);
                }
                Ok(candidates.iter().copied().filter(|u| keep.contains(u)).collect())
            }
            FilterExpr::Not(p) => {
                let matched: FxHashSet<Uid> =
                    self.eval_filter(p, candidates)?.into_iter().collect();
                Ok(candidates.iter().copied().filter(|u| !matched.contains(u)).collect())
            }
        }
    }

    fn scan(&self, f: &Function, re: Option<&Regex>) -> Result<Vec<Uid>> {
        let attr = match f {
            Function::Eq(attr, _)
            | Function::Cmp(_, attr, _)
            | Function::Between(attr, ..)
            | Function::AnyOfTerms(attr, _)
            | Function::AllOfTerms(attr, _)
            | Function::AllOfText(attr, _)
            | Function::Regexp(attr, _)
            | Function::Match(attr, ..) => attr,
            _ => return Ok(Vec::new()),
        };
        // `eq(pred, val(v))` at the root unions one lookup per distinct
        // value of `v`; one pass over the predicate's subjects covers the
        // same set.
        let mut out = Vec::new();
        for uid in self.store.subjects_with(&attr.name) {
            if self.node_matches(f, uid, re, true)? {
                out.push(uid);
            }
        }
        Ok(out)
    }

    /// Tests one function against one node. `at_root` switches `val(v)`
    /// arguments from per-node reads to the variable's distinct-value set.
    fn node_matches(&self, f: &Function, uid: Uid, re: Option<&Regex>, at_root: bool) -> Result<bool> {
        match f {
            Function::Uid(args) => {
                for arg in args {
                    let hit = match arg {
                        UidArg::Lit(u) => *u == uid,
                        UidArg::Var(name) => self.vars.uid_set(name).contains(&uid),
                    };
                    if hit {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Function::Eq(attr, args) => {
                let values = self.node_values(uid, attr);
                for arg in args {
                    for cmp in self.arg_values(arg, uid, &attr.name, at_root) {
                        if contained(any_compares(CompareOp::Eq, &values, &cmp))? {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
            Function::Cmp(op, attr, arg) => {
                let values = self.node_values(uid, attr);
                for cmp in self.arg_values(arg, uid, &attr.name, at_root) {
                    if contained(any_compares(*op, &values, &cmp))? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Function::Between(attr, lo, hi) => {
                let values = self.node_values(uid, attr);
                let lo = self.coerce(lo, &attr.name);
                let hi = self.coerce(hi, &attr.name);
                for v in &values {
                    let ge = contained(TypedValue::compare(CompareOp::Ge, v, &lo))?;
                    let le = contained(TypedValue::compare(CompareOp::Le, v, &hi))?;
                    if ge && le {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Function::Has(attr) => {
                Ok(!self.node_values(uid, attr).is_empty() || self.has_edges(uid, attr))
            }
            Function::Type(t) => Ok(self.node_has_type(uid, t)),
            Function::AnyOfTerms(attr, text) => {
                let wanted = terms(text);
                Ok(self.node_values(uid, attr).iter().any(|v| {
                    let have = value_terms(v);
                    wanted.iter().any(|t| have.contains(t))
                }))
            }
            Function::AllOfTerms(attr, text) | Function::AllOfText(attr, text) => {
                let wanted = terms(text);
                if wanted.is_empty() {
                    return Ok(false);
                }
                Ok(self.node_values(uid, attr).iter().any(|v| {
                    let have = value_terms(v);
                    wanted.iter().all(|t| have.contains(t))
                }))
            }
            Function::Regexp(attr, pattern) => {
                let owned;
                let re = match re {
                    Some(re) => re,
                    None => {
                        owned = compile_regex(pattern)?;
                        &owned
                    }
                };
                Ok(self
                    .node_values(uid, attr)
                    .iter()
                    .any(|v| v.as_str().is_some_and(|s| re.is_match(s))))
            }
            Function::Match(attr, text, max_dist) => {
                let target = text.to_lowercase();
                let max = (*max_dist).max(0) as usize;
                Ok(self.node_values(uid, attr).iter().any(|v| {
                    v.as_str()
                        .is_some_and(|s| levenshtein(&s.to_lowercase(), &target) <= max)
                }))
            }
            Function::UidIn(pred, args) => {
                let wanted = validate_uid_in(args)?;
                let edges = self
                    .store
                    .postings(uid, pred)
                    .map(|p| p.edges().to_vec())
                    .unwrap_or_default();
                Ok(edges.iter().any(|e| wanted.contains(&e.target)))
            }
            Function::CountCmp(op, pred, n) => Ok(cmp_i64(*op, self.fanout(uid, pred), *n)),
            Function::LenCmp(op, var, n) => {
                Ok(cmp_i64(*op, self.vars.len_of(var) as i64, *n))
            }
        }
    }

    /// Scalar values of `(uid, attr)` after language-chain resolution.
    /// No chain reads the untagged values; a chain takes the first tag that
    /// has any.
    pub fn node_values(&self, uid: Uid, attr: &Attr) -> Vec<TypedValue> {
        let Some(postings) = self.store.postings(uid, &attr.name) else {
            return Vec::new();
        };
        let values = postings.values();
        if attr.langs.is_empty() {
            return values
                .iter()
                .filter(|v| v.lang.is_none())
                .map(|v| v.value.clone())
                .collect();
        }
        for tag in &attr.langs {
            let hits: Vec<TypedValue> = values
                .iter()
                .filter(|v| match tag.as_str() {
                    "*" => true,
                    t => v.lang.as_deref() == Some(t),
                })
                .map(|v| v.value.clone())
                .collect();
            if !hits.is_empty() {
                return hits;
            }
        }
        Vec::new()
    }

    fn has_edges(&self, uid: Uid, attr: &Attr) -> bool {
        attr.langs.is_empty()
            && self
                .store
                .postings(uid, &attr.name)
                .is_some_and(|p| !p.edges().is_empty())
    }

    fn node_has_type(&self, uid: Uid, t: &str) -> bool {
        self.store
            .postings(uid, TYPE_PREDICATE)
            .map(|p| {
                p.values()
                    .iter()
                    .any(|v| v.value.as_str() == Some(t))
            })
            .unwrap_or(false)
    }

    fn fanout(&self, uid: Uid, pred: &str) -> i64 {
        self.store
            .postings(uid, pred)
            .map(|p| (p.edges().len() + p.values().len()) as i64)
            .unwrap_or(0)
    }

    /// Expands a function argument: literals coerce to the predicate's
    /// schema type, `val(v)` reads per node inside filters and the whole
    /// distinct-value set at the root.
    fn arg_values(&self, arg: &FuncArg, uid: Uid, pred: &str, at_root: bool) -> Vec<TypedValue> {
        match arg {
            FuncArg::Lit(v) => vec![self.coerce(v, pred)],
            FuncArg::Val(name) => {
                if at_root {
                    self.vars.distinct_values(name)
                } else {
                    self.vars.value_of(name, uid).into_iter().collect()
                }
            }
        }
    }

    fn coerce(&self, v: &TypedValue, pred: &str) -> TypedValue {
        let target = self.schema.value_type(pred);
        if target == ValueType::Uid {
            return v.clone();
        }
        v.convert(target).unwrap_or_else(|_| v.clone())
    }
}

/// Maps contained error classes to `false`, propagates fatal ones.
fn contained(r: Result<bool>) -> Result<bool> {
    match r {
        Ok(b) => Ok(b),
        Err(QueryError::TypeMismatch(_)) | Err(QueryError::InvalidGeometry(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

fn any_compares(op: CompareOp, values: &[TypedValue], against: &TypedValue) -> Result<bool> {
    for v in values {
        if TypedValue::compare(op, v, against)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn cmp_i64(op: CompareOp, a: i64, b: i64) -> bool {
    op.matches(a.cmp(&b))
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| QueryError::InvalidArgument(format!("invalid regular expression: {e}")))
}

fn validate_uid_in(args: &[String]) -> Result<FxHashSet<Uid>> {
    let mut out = FxHashSet::default();
    for arg in args {
        let uid = Uid::parse(arg).map_err(|_| {
            QueryError::InvalidArgument(format!("Value \"{arg}\" in uid_in is not a number"))
        })?;
        out.insert(uid);
    }
    Ok(out)
}

fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn value_terms(v: &TypedValue) -> FxHashSet<String> {
    match v.as_str() {
        Some(s) => terms(s).into_iter().collect(),
        None => FxHashSet::default(),
    }
}

/// Classic two-row edit distance over chars.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(ca != cb);
            cur[j + 1] = sub.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::vars::VarTable;
    use crate::schema::PredicateSchema;
    use crate::store::MemStore;
    use crate::types::value::parse_datetime;

    fn fixture() -> MemStore {
        let schema = Schema::new()
            .predicate(PredicateSchema::new("name", ValueType::String).indexed().lang())
            .predicate(PredicateSchema::new("age", ValueType::Int).indexed())
            .predicate(PredicateSchema::new("dob", ValueType::DateTime).indexed())
            .predicate(PredicateSchema::new("friend", ValueType::Uid).list().reverse())
            .predicate(PredicateSchema::new(TYPE_PREDICATE, ValueType::String).list());
        let mut s = MemStore::new(schema);
        for (uid, name, age) in [
            (1u64, "Michonne", 38i64),
            (23, "Rick Grimes", 15),
            (24, "Glenn Rhee", 15),
            (25, "Daryl Dixon", 17),
            (31, "Andrea", 19),
        ] {
            s.put_value(Uid(uid), "name", TypedValue::Str(name.into()));
            s.put_value(Uid(uid), "age", TypedValue::Int(age));
        }
        s.put_value(Uid(33), "name", TypedValue::Str(String::new()));
        s.put_value(
            Uid(1),
            "dob",
            TypedValue::DateTime(parse_datetime("1910-01-01").unwrap()),
        );
        s.put_value(Uid(1), TYPE_PREDICATE, TypedValue::Str("Person".into()));
        s.add_edge(Uid(1), "friend", Uid(23));
        s.add_edge(Uid(1), "friend", Uid(31));
        s
    }

    fn ctx<'a>(store: &'a MemStore, vars: &'a VarTable) -> FuncCtx<'a> {
        FuncCtx { store, schema: store.schema(), vars }
    }

    #[test]
    fn eq_and_between_scan() {
        let store = fixture();
        let vars = VarTable::new();
        let ctx = ctx(&store, &vars);
        let got = ctx
            .eval_root(&Function::Eq(
                Attr::new("age"),
                vec![FuncArg::Lit(TypedValue::Int(15))],
            ))
            .unwrap();
        assert_eq!(got, vec![Uid(23), Uid(24)]);
        let got = ctx
            .eval_root(&Function::Between(
                Attr::new("age"),
                TypedValue::Int(16),
                TypedValue::Int(20),
            ))
            .unwrap();
        assert_eq!(got, vec![Uid(25), Uid(31)]);
    }

    #[test]
    fn between_with_inverted_bounds_is_empty() {
        let store = fixture();
        let vars = VarTable::new();
        let got = ctx(&store, &vars)
            .eval_root(&Function::Between(
                Attr::new("age"),
                TypedValue::Int(30),
                TypedValue::Int(10),
            ))
            .unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn eq_matches_the_empty_string() {
        let store = fixture();
        let vars = VarTable::new();
        let got = ctx(&store, &vars)
            .eval_root(&Function::Eq(
                Attr::new("name"),
                vec![FuncArg::Lit(TypedValue::Str(String::new()))],
            ))
            .unwrap();
        assert_eq!(got, vec![Uid(33)]);
    }

    #[test]
    fn string_literals_coerce_to_schema_type() {
        let store = fixture();
        let vars = VarTable::new();
        let got = ctx(&store, &vars)
            .eval_root(&Function::Cmp(
                CompareOp::Le,
                Attr::new("dob"),
                FuncArg::Lit(TypedValue::Str("1911-01-01".into())),
            ))
            .unwrap();
        assert_eq!(got, vec![Uid(1)]);
    }

    #[test]
    fn term_matching() {
        let store = fixture();
        let vars = VarTable::new();
        let ctx = ctx(&store, &vars);
        let got = ctx
            .eval_root(&Function::AnyOfTerms(
                Attr::new("name"),
                "glenn rick nobody".into(),
            ))
            .unwrap();
        assert_eq!(got, vec![Uid(23), Uid(24)]);
        let got = ctx
            .eval_root(&Function::AllOfTerms(Attr::new("name"), "rick grimes".into()))
            .unwrap();
        assert_eq!(got, vec![Uid(23)]);
    }

    #[test]
    fn invalid_regex_is_fatal() {
        let store = fixture();
        let vars = VarTable::new();
        let err = ctx(&store, &vars)
            .eval_root(&Function::Regexp(Attr::new("name"), "*invalid".into()))
            .unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }

    #[test]
    fn match_uses_edit_distance() {
        let store = fixture();
        let vars = VarTable::new();
        let got = ctx(&store, &vars)
            .eval_root(&Function::Match(Attr::new("name"), "Michonn".into(), 2))
            .unwrap();
        assert_eq!(got, vec![Uid(1)]);
    }

    #[test]
    fn uid_in_validates_arguments() {
        let store = fixture();
        let vars = VarTable::new();
        let ctx = ctx(&store, &vars);
        let err = ctx
            .eval_filter(
                &FilterExpr::Func(Function::UidIn("friend".into(), vec!["abc".into()])),
                &[Uid(1)],
            )
            .unwrap_err();
        assert!(err.to_string().contains("\"abc\" in uid_in is not a number"));
        let got = ctx
            .eval_filter(
                &FilterExpr::Func(Function::UidIn("friend".into(), vec!["23".into()])),
                &[Uid(1), Uid(23)],
            )
            .unwrap();
        assert_eq!(got, vec![Uid(1)]);
    }

    #[test]
    fn len_and_aggregates_rejected_at_root() {
        let store = fixture();
        let vars = VarTable::new();
        let err = ctx(&store, &vars)
            .eval_root(&Function::LenCmp(CompareOp::Gt, "a".into(), 0))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Function name: len is not valid at query root"
        );
    }

    #[test]
    fn not_filter_preserves_candidate_order() {
        let store = fixture();
        let vars = VarTable::new();
        let got = ctx(&store, &vars)
            .eval_filter(
                &FilterExpr::Not(Box::new(FilterExpr::Func(Function::Eq(
                    Attr::new("age"),
                    vec![FuncArg::Lit(TypedValue::Int(15))],
                )))),
                &[Uid(31), Uid(25), Uid(24), Uid(23)],
            )
            .unwrap();
        assert_eq!(got, vec![Uid(31), Uid(25)]);
    }

    #[test]
    fn lang_chain_first_populated_wins() {
        let mut store = fixture();
        store.put_value_lang(Uid(1), "name", "en", TypedValue::Str("Michonne-en".into()));
        let vars = VarTable::new();
        let ctx = ctx(&store, &vars);
        let attr = Attr { name: "name".into(), langs: vec!["ko".into(), "en".into()] };
        assert_eq!(
            ctx.node_values(Uid(1), &attr),
            vec![TypedValue::Str("Michonne-en".into())]
        );
        let missing = Attr { name: "name".into(), langs: vec!["fr".into()] };
        assert!(ctx.node_values(Uid(1), &missing).is_empty());
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }
}
