//! Math and aggregate expression evaluation over value variables.
//!
//! A `math(...)` selection is evaluated per node at one expansion level.
//! Variable reads resolve against that level: a variable bound for nodes of
//! the level reads per node (zero when the node has no binding), while a
//! variable whose node set is disjoint from the level collapses to the sum
//! of its values and behaves as a constant. That one rule is what lets a
//! `count(uid)` bound in another block feed arithmetic here.

use rustc_hash::{FxHashMap, FxHashSet};
use time::OffsetDateTime;

use crate::types::{QueryError, Result, TypedValue, Uid};

use super::ast::{MathExpr, MathOp, MathUnaryOp};
use super::vars::VarReader;

#[derive(Clone, Debug)]
enum Resolved {
    PerNode(FxHashMap<Uid, TypedValue>),
    Constant(TypedValue),
}

/// Prepared evaluator for one expression at one level.
#[derive(Debug)]
pub struct MathEvaluator {
    resolved: FxHashMap<String, Resolved>,
    now: OffsetDateTime,
}

impl MathEvaluator {
    /// Resolves every variable the expression reads against `level`.
    pub fn prepare(
        expr: &MathExpr,
        vars: &dyn VarReader,
        level: &[Uid],
        now: OffsetDateTime,
    ) -> Self {
        let level_set: FxHashSet<Uid> = level.iter().copied().collect();
        let mut names = Vec::new();
        expr.vars(&mut names);
        let mut resolved = FxHashMap::default();
        for name in names {
            if resolved.contains_key(&name) {
                continue;
            }
            let map = vars.value_map(&name);
            let intersects = map.keys().any(|u| level_set.contains(u));
            let entry = if intersects || map.is_empty() {
                Resolved::PerNode(map)
            } else {
                Resolved::Constant(sum_values(map.values()))
            };
            resolved.insert(name, entry);
        }
        MathEvaluator { resolved, now }
    }

    /// Evaluates the expression for one node.
    pub fn eval(&self, expr: &MathExpr, uid: Uid) -> Result<TypedValue> {
        match expr {
            MathExpr::Lit(v) => Ok(v.clone()),
            MathExpr::Val(name) => Ok(self.read(name, uid)),
            MathExpr::Binary(op, lhs, rhs) => {
                let a = self.eval(lhs, uid)?;
                let b = self.eval(rhs, uid)?;
                binary(*op, &a, &b)
            }
            MathExpr::Unary(op, arg) => {
                let v = self.eval(arg, uid)?;
                self.unary(*op, &v)
            }
            MathExpr::Cond(cmp, then, otherwise) => {
                let lhs = self.eval(&cmp.lhs, uid)?;
                let rhs = self.eval(&cmp.rhs, uid)?;
                // Both branches are evaluated, so a type error in the
                // untaken branch still aborts; only the taken value is kept.
                let then_v = self.eval(then, uid)?;
                let else_v = self.eval(otherwise, uid)?;
                if TypedValue::compare(cmp.op, &lhs, &rhs)? {
                    Ok(then_v)
                } else {
                    Ok(else_v)
                }
            }
        }
    }

    fn read(&self, name: &str, uid: Uid) -> TypedValue {
        match self.resolved.get(name) {
            Some(Resolved::PerNode(map)) => {
                map.get(&uid).cloned().unwrap_or(TypedValue::Int(0))
            }
            Some(Resolved::Constant(v)) => v.clone(),
            None => TypedValue::Int(0),
        }
    }

    fn unary(&self, op: MathUnaryOp, v: &TypedValue) -> Result<TypedValue> {
        if op == MathUnaryOp::Since {
            let TypedValue::DateTime(dt) = v else {
                return Err(QueryError::TypeMismatch(
                    "since() needs a datetime operand".into(),
                ));
            };
            let elapsed = (self.now - *dt).as_seconds_f64();
            return Ok(TypedValue::Float(elapsed));
        }
        if op == MathUnaryOp::Neg {
            return match v {
                TypedValue::Int(i) => Ok(TypedValue::Int(-i)),
                TypedValue::Float(f) => Ok(TypedValue::Float(-f)),
                _ => Err(non_numeric(v)),
            };
        }
        let f = v.as_f64().ok_or_else(|| non_numeric(v))?;
        let out = match op {
            MathUnaryOp::Ln => f.ln(),
            MathUnaryOp::Exp => f.exp(),
            MathUnaryOp::Sqrt => f.sqrt(),
            MathUnaryOp::Floor => f.floor(),
            MathUnaryOp::Ceil => f.ceil(),
            MathUnaryOp::Since | MathUnaryOp::Neg => unreachable!(),
        };
        Ok(TypedValue::Float(out))
    }
}

fn non_numeric(v: &TypedValue) -> QueryError {
    QueryError::TypeMismatch(format!(
        "math operand is not numeric: {} value",
        v.value_type().name()
    ))
}

fn sum_values<'a>(values: impl Iterator<Item = &'a TypedValue>) -> TypedValue {
    let mut int_sum = 0i64;
    let mut float_sum = 0.0f64;
    let mut any_float = false;
    for v in values {
        match v {
            TypedValue::Int(i) => int_sum = int_sum.wrapping_add(*i),
            TypedValue::Float(f) => {
                any_float = true;
                float_sum += f;
            }
            _ => {}
        }
    }
    if any_float {
        TypedValue::Float(float_sum + int_sum as f64)
    } else {
        TypedValue::Int(int_sum)
    }
}

/// Binary arithmetic. Two int operands stay int except for division, which
/// always produces a float; any float operand promotes the result. Integer
/// overflow promotes to float rather than failing.
fn binary(op: MathOp, a: &TypedValue, b: &TypedValue) -> Result<TypedValue> {
    let (fa, fb) = match (a.as_f64(), b.as_f64()) {
        (Some(fa), Some(fb)) => (fa, fb),
        _ => return Err(non_numeric(if a.is_numeric() { b } else { a })),
    };
    if let (TypedValue::Int(ia), TypedValue::Int(ib)) = (a, b) {
        let int_result = match op {
            MathOp::Add => ia.checked_add(*ib),
            MathOp::Sub => ia.checked_sub(*ib),
            MathOp::Mul => ia.checked_mul(*ib),
            MathOp::Mod => {
                if *ib == 0 {
                    None
                } else {
                    ia.checked_rem(*ib)
                }
            }
            MathOp::Min => Some(*ia.min(ib)),
            MathOp::Max => Some(*ia.max(ib)),
            MathOp::Div | MathOp::Pow | MathOp::LogBase => None,
        };
        if let Some(i) = int_result {
            return Ok(TypedValue::Int(i));
        }
        if op == MathOp::Mod && *ib == 0 {
            return Err(QueryError::InvalidArgument("modulo by zero".into()));
        }
    }
    let out = match op {
        MathOp::Add => fa + fb,
        MathOp::Sub => fa - fb,
        MathOp::Mul => fa * fb,
        MathOp::Div => fa / fb,
        MathOp::Mod => fa % fb,
        MathOp::Min => fa.min(fb),
        MathOp::Max => fa.max(fb),
        MathOp::Pow => fa.powf(fb),
        MathOp::LogBase => fa.ln() / fb.ln(),
    };
    Ok(TypedValue::Float(out))
}
