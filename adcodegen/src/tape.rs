//! Recorded models and their symbolic derivatives
//!
//! The [`Tape`] trait is the seam to the AD engine: given graph arguments for
//! its inputs, a tape records its values, Jacobian or weighted Hessian into a
//! [`Graph`] and hands back the resulting arguments.
//!
//! [`ExprTape`] is a small SSA tape built with a [`TapeBuilder`].  It computes
//! derivatives by forward propagation of sparse first- and second-order
//! coefficients, with constant folding provided by the graph builders.
use crate::{
    graph::{Arg, Base, BinaryOpcode, Graph, UnaryOpcode},
    Error,
};

use std::collections::{BTreeMap, BTreeSet};

/// A recorded model `y = f(x)`
pub trait Tape<T: Base>: Send + Sync {
    /// Number of inputs
    fn domain(&self) -> usize;

    /// Number of outputs
    fn range(&self) -> usize;

    /// Returns, for each output, the inputs it depends on
    fn jacobian_sparsity(&self) -> Vec<BTreeSet<usize>>;

    /// Returns, for each input `a`, the inputs `b` for which
    /// `∂²y_i / ∂x_a ∂x_b` may be nonzero for some `i` in `rows`
    ///
    /// The result is symmetric.
    fn hessian_sparsity(&self, rows: &BTreeSet<usize>) -> Vec<BTreeSet<usize>>;

    /// Records output values for the given inputs
    fn forward_zero(
        &self,
        graph: &mut Graph<T>,
        x: &[Arg<T>],
    ) -> Result<Vec<Arg<T>>, Error>;

    /// Records the Jacobian elements `(row, col)`
    fn sparse_jacobian(
        &self,
        graph: &mut Graph<T>,
        x: &[Arg<T>],
        elements: &[(usize, usize)],
    ) -> Result<Vec<Arg<T>>, Error>;

    /// Records elements `(a, b)` of `Σ_i w_i ∇²y_i`
    fn sparse_hessian(
        &self,
        graph: &mut Graph<T>,
        x: &[Arg<T>],
        w: &[Arg<T>],
        elements: &[(usize, usize)],
    ) -> Result<Vec<Arg<T>>, Error>;
}

/// Position of a value in an [`ExprTape`]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TapeVar(usize);

#[derive(Copy, Clone, Debug, PartialEq)]
enum TapeOp<T> {
    Input(usize),
    Const(T),
    Unary(UnaryOpcode, TapeVar),
    Binary(BinaryOpcode, TapeVar, TapeVar),
}

/// Straight-line tape of unary and binary operations
#[derive(Clone, Debug)]
pub struct ExprTape<T> {
    ops: Vec<TapeOp<T>>,
    domain: usize,
    outputs: Vec<TapeVar>,
}

/// Builder for an [`ExprTape`]
#[derive(Default)]
pub struct TapeBuilder<T> {
    ops: Vec<TapeOp<T>>,
    domain: usize,
}

impl<T: Base> TapeBuilder<T> {
    pub fn new() -> Self {
        Self {
            ops: vec![],
            domain: 0,
        }
    }

    fn push(&mut self, op: TapeOp<T>) -> TapeVar {
        self.ops.push(op);
        TapeVar(self.ops.len() - 1)
    }

    /// Declares the next input
    pub fn input(&mut self) -> TapeVar {
        let i = self.domain;
        self.domain += 1;
        self.push(TapeOp::Input(i))
    }

    /// Declares `n` inputs
    pub fn inputs(&mut self, n: usize) -> Vec<TapeVar> {
        (0..n).map(|_| self.input()).collect()
    }

    pub fn constant(&mut self, v: T) -> TapeVar {
        self.push(TapeOp::Const(v))
    }

    /// Records a unary operation
    ///
    /// Only operations with known first and second derivatives are accepted.
    pub fn unary(&mut self, op: UnaryOpcode, a: TapeVar) -> Result<TapeVar, Error> {
        match op {
            UnaryOpcode::Neg
            | UnaryOpcode::Sqrt
            | UnaryOpcode::Exp
            | UnaryOpcode::Ln
            | UnaryOpcode::Sin
            | UnaryOpcode::Cos
            | UnaryOpcode::Tanh => Ok(self.push(TapeOp::Unary(op, a))),
            _ => Err(Error::UnsupportedOp("tape unary")),
        }
    }

    /// Records a binary operation
    pub fn binary(
        &mut self,
        op: BinaryOpcode,
        a: TapeVar,
        b: TapeVar,
    ) -> Result<TapeVar, Error> {
        match op {
            BinaryOpcode::Pow => Err(Error::UnsupportedOp("tape pow")),
            _ => Ok(self.push(TapeOp::Binary(op, a, b))),
        }
    }

    pub fn add(&mut self, a: TapeVar, b: TapeVar) -> TapeVar {
        self.push(TapeOp::Binary(BinaryOpcode::Add, a, b))
    }
    pub fn sub(&mut self, a: TapeVar, b: TapeVar) -> TapeVar {
        self.push(TapeOp::Binary(BinaryOpcode::Sub, a, b))
    }
    pub fn mul(&mut self, a: TapeVar, b: TapeVar) -> TapeVar {
        self.push(TapeOp::Binary(BinaryOpcode::Mul, a, b))
    }
    pub fn div(&mut self, a: TapeVar, b: TapeVar) -> TapeVar {
        self.push(TapeOp::Binary(BinaryOpcode::Div, a, b))
    }
    pub fn neg(&mut self, a: TapeVar) -> TapeVar {
        self.push(TapeOp::Unary(UnaryOpcode::Neg, a))
    }
    pub fn sin(&mut self, a: TapeVar) -> TapeVar {
        self.push(TapeOp::Unary(UnaryOpcode::Sin, a))
    }
    pub fn cos(&mut self, a: TapeVar) -> TapeVar {
        self.push(TapeOp::Unary(UnaryOpcode::Cos, a))
    }
    pub fn exp(&mut self, a: TapeVar) -> TapeVar {
        self.push(TapeOp::Unary(UnaryOpcode::Exp, a))
    }
    pub fn ln(&mut self, a: TapeVar) -> TapeVar {
        self.push(TapeOp::Unary(UnaryOpcode::Ln, a))
    }
    pub fn sqrt(&mut self, a: TapeVar) -> TapeVar {
        self.push(TapeOp::Unary(UnaryOpcode::Sqrt, a))
    }
    pub fn tanh(&mut self, a: TapeVar) -> TapeVar {
        self.push(TapeOp::Unary(UnaryOpcode::Tanh, a))
    }

    /// Finishes the tape with the given outputs
    pub fn finish(self, outputs: Vec<TapeVar>) -> Result<ExprTape<T>, Error> {
        if outputs.iter().any(|o| o.0 >= self.ops.len()) {
            return Err(Error::BadArgument {
                op: "tape output",
                index: 0,
            });
        }
        Ok(ExprTape {
            ops: self.ops,
            domain: self.domain,
            outputs,
        })
    }
}

/// Sparse first and second-order coefficients of a tape value
///
/// Hessian keys are ordered pairs `(a, b)` with `a <= b`.
#[derive(Clone)]
struct Taylor<T> {
    value: Arg<T>,
    grad: BTreeMap<usize, Arg<T>>,
    hess: BTreeMap<(usize, usize), Arg<T>>,
}

fn key(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

fn accumulate<T: Base, K: Ord>(
    graph: &mut Graph<T>,
    map: &mut BTreeMap<K, Arg<T>>,
    k: K,
    v: Arg<T>,
) {
    let prev = map.remove(&k).unwrap_or(Arg::Const(T::zero()));
    let sum = graph.add(prev, v);
    if !sum.is_zero() {
        map.insert(k, sum);
    }
}

impl<T: Base> ExprTape<T> {
    fn check_inputs(&self, x: &[Arg<T>]) -> Result<(), Error> {
        if x.len() != self.domain {
            return Err(Error::BadSliceLength {
                expected: self.domain,
                actual: x.len(),
            });
        }
        Ok(())
    }

    fn check_element(&self, r: usize, c: usize, rows: usize) -> Result<(), Error> {
        if r >= rows || c >= self.domain {
            return Err(Error::BadArgument {
                op: "tape element",
                index: r,
            });
        }
        Ok(())
    }

    /// Propagates values and first derivatives (and second derivatives, if
    /// `second` is set) through the tape
    fn propagate(
        &self,
        graph: &mut Graph<T>,
        x: &[Arg<T>],
        second: bool,
    ) -> Vec<Taylor<T>> {
        let zero = Arg::Const(T::zero());
        let mut out: Vec<Taylor<T>> = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let t = match *op {
                TapeOp::Input(i) => Taylor {
                    value: x[i],
                    grad: [(i, Arg::Const(T::one()))].into_iter().collect(),
                    hess: BTreeMap::new(),
                },
                TapeOp::Const(c) => Taylor {
                    value: Arg::Const(c),
                    grad: BTreeMap::new(),
                    hess: BTreeMap::new(),
                },
                TapeOp::Unary(op, a) => {
                    let u = out[a.0].clone();
                    let (value, d1, d2) = unary_derivatives(graph, op, u.value);
                    chain(graph, &u, value, d1, if second { d2 } else { zero }, second)
                }
                TapeOp::Binary(op, a, b) => {
                    let (ua, ub) = (&out[a.0], &out[b.0]);
                    match op {
                        BinaryOpcode::Add | BinaryOpcode::Sub => {
                            let value = graph.binary(op, ua.value, ub.value);
                            let mut t = Taylor {
                                value,
                                grad: ua.grad.clone(),
                                hess: if second { ua.hess.clone() } else { BTreeMap::new() },
                            };
                            for (k, v) in &ub.grad {
                                let v = if op == BinaryOpcode::Sub { graph.neg(*v) } else { *v };
                                accumulate(graph, &mut t.grad, *k, v);
                            }
                            if second {
                                for (k, v) in &ub.hess {
                                    let v = if op == BinaryOpcode::Sub { graph.neg(*v) } else { *v };
                                    accumulate(graph, &mut t.hess, *k, v);
                                }
                            }
                            t
                        }
                        BinaryOpcode::Mul => mul(graph, ua, ub, second),
                        BinaryOpcode::Div => {
                            // a / b = a * (1 / b)
                            let r = graph.div(Arg::Const(T::one()), ub.value);
                            let r2 = graph.mul(r, r);
                            let d1 = graph.neg(r2);
                            let d2 = if second {
                                let r3 = graph.mul(r2, r);
                                graph.mul(Arg::Const(T::one() + T::one()), r3)
                            } else {
                                zero
                            };
                            let inv = chain(graph, ub, r, d1, d2, second);
                            mul(graph, ua, &inv, second)
                        }
                        BinaryOpcode::Pow => unreachable!(),
                    }
                }
            };
            out.push(t);
        }
        out
    }
}

/// Returns `(f(u), f'(u), f''(u))`
fn unary_derivatives<T: Base>(
    g: &mut Graph<T>,
    op: UnaryOpcode,
    u: Arg<T>,
) -> (Arg<T>, Arg<T>, Arg<T>) {
    let one = Arg::Const(T::one());
    let value = g.unary(op, u);
    match op {
        UnaryOpcode::Neg => (value, g.neg(one), Arg::Const(T::zero())),
        UnaryOpcode::Sqrt => {
            let half = T::one() / (T::one() + T::one());
            let d1 = g.div(Arg::Const(half), value);
            let d2 = g.div(d1, u);
            let d2 = g.mul(Arg::Const(-half), d2);
            (value, d1, d2)
        }
        UnaryOpcode::Exp => (value, value, value),
        UnaryOpcode::Ln => {
            let d1 = g.div(one, u);
            let d1sq = g.mul(d1, d1);
            (value, d1, g.neg(d1sq))
        }
        UnaryOpcode::Sin => {
            let c = g.unary(UnaryOpcode::Cos, u);
            (value, c, g.neg(value))
        }
        UnaryOpcode::Cos => {
            let s = g.unary(UnaryOpcode::Sin, u);
            (value, g.neg(s), g.neg(value))
        }
        UnaryOpcode::Tanh => {
            let sq = g.mul(value, value);
            let d1 = g.sub(one, sq);
            let t2 = g.mul(Arg::Const(T::one() + T::one()), value);
            let d2 = g.mul(t2, d1);
            (value, d1, g.neg(d2))
        }
        _ => (value, Arg::Const(T::zero()), Arg::Const(T::zero())),
    }
}

/// Applies `v = f(u)` given `f'(u)` and `f''(u)`
fn chain<T: Base>(
    g: &mut Graph<T>,
    u: &Taylor<T>,
    value: Arg<T>,
    d1: Arg<T>,
    d2: Arg<T>,
    second: bool,
) -> Taylor<T> {
    let mut grad = BTreeMap::new();
    for (k, v) in &u.grad {
        let p = g.mul(d1, *v);
        if !p.is_zero() {
            grad.insert(*k, p);
        }
    }
    let mut hess = BTreeMap::new();
    if second {
        for (k, v) in &u.hess {
            let p = g.mul(d1, *v);
            accumulate(g, &mut hess, *k, p);
        }
        if !d2.is_zero() {
            let entries: Vec<_> = u.grad.iter().map(|(k, v)| (*k, *v)).collect();
            for (i, &(a, ga)) in entries.iter().enumerate() {
                for &(b, gb) in &entries[i..] {
                    let p = g.mul(ga, gb);
                    let p = g.mul(d2, p);
                    accumulate(g, &mut hess, key(a, b), p);
                }
            }
        }
    }
    Taylor { value, grad, hess }
}

fn mul<T: Base>(
    g: &mut Graph<T>,
    a: &Taylor<T>,
    b: &Taylor<T>,
    second: bool,
) -> Taylor<T> {
    let value = g.mul(a.value, b.value);
    let mut grad = BTreeMap::new();
    for (k, v) in &a.grad {
        let p = g.mul(b.value, *v);
        accumulate(g, &mut grad, *k, p);
    }
    for (k, v) in &b.grad {
        let p = g.mul(a.value, *v);
        accumulate(g, &mut grad, *k, p);
    }
    let mut hess = BTreeMap::new();
    if second {
        for (k, v) in &a.hess {
            let p = g.mul(b.value, *v);
            accumulate(g, &mut hess, *k, p);
        }
        for (k, v) in &b.hess {
            let p = g.mul(a.value, *v);
            accumulate(g, &mut hess, *k, p);
        }
        for (i, ga) in &a.grad {
            for (j, gb) in &b.grad {
                let mut p = g.mul(*ga, *gb);
                if i == j {
                    p = g.mul(Arg::Const(T::one() + T::one()), p);
                }
                accumulate(g, &mut hess, key(*i, *j), p);
            }
        }
    }
    Taylor { value, grad, hess }
}

impl<T: Base> Tape<T> for ExprTape<T> {
    fn domain(&self) -> usize {
        self.domain
    }

    fn range(&self) -> usize {
        self.outputs.len()
    }

    fn jacobian_sparsity(&self) -> Vec<BTreeSet<usize>> {
        let mut deps: Vec<BTreeSet<usize>> = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let d = match *op {
                TapeOp::Input(i) => [i].into_iter().collect(),
                TapeOp::Const(..) => BTreeSet::new(),
                TapeOp::Unary(_, a) => deps[a.0].clone(),
                TapeOp::Binary(_, a, b) => deps[a.0].union(&deps[b.0]).copied().collect(),
            };
            deps.push(d);
        }
        self.outputs.iter().map(|o| deps[o.0].clone()).collect()
    }

    fn hessian_sparsity(&self, rows: &BTreeSet<usize>) -> Vec<BTreeSet<usize>> {
        let mut deps: Vec<BTreeSet<usize>> = Vec::with_capacity(self.ops.len());
        let mut pairs: Vec<BTreeSet<(usize, usize)>> = Vec::with_capacity(self.ops.len());
        let cross = |a: &BTreeSet<usize>, b: &BTreeSet<usize>, out: &mut BTreeSet<_>| {
            for i in a {
                for j in b {
                    out.insert(key(*i, *j));
                }
            }
        };
        for op in &self.ops {
            let (d, p) = match *op {
                TapeOp::Input(i) => ([i].into_iter().collect(), BTreeSet::new()),
                TapeOp::Const(..) => (BTreeSet::new(), BTreeSet::new()),
                TapeOp::Unary(op, a) => {
                    let mut p = pairs[a.0].clone();
                    if op != UnaryOpcode::Neg {
                        cross(&deps[a.0], &deps[a.0], &mut p);
                    }
                    (deps[a.0].clone(), p)
                }
                TapeOp::Binary(op, a, b) => {
                    let d: BTreeSet<usize> = deps[a.0].union(&deps[b.0]).copied().collect();
                    let mut p: BTreeSet<_> = pairs[a.0].union(&pairs[b.0]).copied().collect();
                    match op {
                        BinaryOpcode::Mul => cross(&deps[a.0], &deps[b.0], &mut p),
                        BinaryOpcode::Div => {
                            cross(&deps[a.0], &deps[b.0], &mut p);
                            cross(&deps[b.0], &deps[b.0], &mut p);
                        }
                        _ => (),
                    }
                    (d, p)
                }
            };
            deps.push(d);
            pairs.push(p);
        }
        let mut out = vec![BTreeSet::new(); self.domain];
        for r in rows {
            let Some(o) = self.outputs.get(*r) else {
                continue;
            };
            for &(a, b) in &pairs[o.0] {
                out[a].insert(b);
                out[b].insert(a);
            }
        }
        out
    }

    fn forward_zero(
        &self,
        graph: &mut Graph<T>,
        x: &[Arg<T>],
    ) -> Result<Vec<Arg<T>>, Error> {
        self.check_inputs(x)?;
        let mut values: Vec<Arg<T>> = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let v = match *op {
                TapeOp::Input(i) => x[i],
                TapeOp::Const(c) => Arg::Const(c),
                TapeOp::Unary(op, a) => graph.unary(op, values[a.0]),
                TapeOp::Binary(op, a, b) => graph.binary(op, values[a.0], values[b.0]),
            };
            values.push(v);
        }
        Ok(self.outputs.iter().map(|o| values[o.0]).collect())
    }

    fn sparse_jacobian(
        &self,
        graph: &mut Graph<T>,
        x: &[Arg<T>],
        elements: &[(usize, usize)],
    ) -> Result<Vec<Arg<T>>, Error> {
        self.check_inputs(x)?;
        for &(r, c) in elements {
            self.check_element(r, c, self.outputs.len())?;
        }
        let t = self.propagate(graph, x, false);
        Ok(elements
            .iter()
            .map(|&(r, c)| {
                t[self.outputs[r].0]
                    .grad
                    .get(&c)
                    .copied()
                    .unwrap_or(Arg::Const(T::zero()))
            })
            .collect())
    }

    fn sparse_hessian(
        &self,
        graph: &mut Graph<T>,
        x: &[Arg<T>],
        w: &[Arg<T>],
        elements: &[(usize, usize)],
    ) -> Result<Vec<Arg<T>>, Error> {
        self.check_inputs(x)?;
        if w.len() != self.outputs.len() {
            return Err(Error::BadSliceLength {
                expected: self.outputs.len(),
                actual: w.len(),
            });
        }
        for &(a, b) in elements {
            self.check_element(a, b, self.domain)?;
        }
        let t = self.propagate(graph, x, true);
        let mut out = Vec::with_capacity(elements.len());
        for &(a, b) in elements {
            let k = key(a, b);
            let mut sum = Arg::Const(T::zero());
            for (o, wi) in self.outputs.iter().zip(w) {
                if wi.is_zero() {
                    continue;
                }
                if let Some(h) = t[o.0].hess.get(&k) {
                    let p = graph.mul(*wi, *h);
                    sum = graph.add(sum, p);
                }
            }
            out.push(sum);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    /// y0 = x0 * sin(x1), y1 = exp(x0) / x2
    fn tape() -> ExprTape<f64> {
        let mut b = TapeBuilder::new();
        let x = b.inputs(3);
        let s = b.sin(x[1]);
        let y0 = b.mul(x[0], s);
        let e = b.exp(x[0]);
        let y1 = b.div(e, x[2]);
        b.finish(vec![y0, y1]).unwrap()
    }

    fn args(g: &mut Graph<f64>, n: usize) -> Vec<Arg<f64>> {
        g.independents(n).into_iter().map(Arg::Node).collect()
    }

    #[test]
    fn sparsity() {
        let t = tape();
        let jac = t.jacobian_sparsity();
        assert_eq!(jac[0], [0, 1].into_iter().collect());
        assert_eq!(jac[1], [0, 2].into_iter().collect());

        let h = t.hessian_sparsity(&[0].into_iter().collect());
        assert_eq!(h[0], [1].into_iter().collect());
        assert_eq!(h[1], [0, 1].into_iter().collect());
        assert!(h[2].is_empty());

        let h = t.hessian_sparsity(&[1].into_iter().collect());
        assert_eq!(h[2], [0, 2].into_iter().collect());
    }

    #[test]
    fn jacobian_values() {
        let t = tape();
        let mut g = Graph::<f64>::new();
        let x = args(&mut g, 3);
        let jac = t
            .sparse_jacobian(&mut g, &x, &[(0, 0), (0, 1), (1, 2), (1, 1)])
            .unwrap();
        assert!(jac[3].is_zero());
        let v = [0.5, 1.5, 2.0];
        assert_relative_eq!(g.eval(jac[0], &v).unwrap(), 1.5f64.sin());
        assert_relative_eq!(g.eval(jac[1], &v).unwrap(), 0.5 * 1.5f64.cos());
        assert_relative_eq!(
            g.eval(jac[2], &v).unwrap(),
            -(0.5f64.exp()) / 4.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn weighted_hessian() {
        let t = tape();
        let mut g = Graph::<f64>::new();
        let x = args(&mut g, 3);
        let w = args(&mut g, 2);
        let h = t
            .sparse_hessian(&mut g, &x, &w, &[(0, 1), (1, 1), (2, 2), (0, 2)])
            .unwrap();
        let v = [0.5, 1.5, 2.0, 3.0, -2.0];
        let e = 0.5f64.exp();
        assert_relative_eq!(g.eval(h[0], &v).unwrap(), 3.0 * 1.5f64.cos());
        assert_relative_eq!(g.eval(h[1], &v).unwrap(), -3.0 * 0.5 * 1.5f64.sin());
        assert_relative_eq!(
            g.eval(h[2], &v).unwrap(),
            -2.0 * 2.0 * e / 8.0,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            g.eval(h[3], &v).unwrap(),
            -2.0 * -e / 4.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn unsupported() {
        let mut b = TapeBuilder::<f64>::new();
        let x = b.input();
        assert!(b.unary(UnaryOpcode::Abs, x).is_err());
        assert!(b.unary(UnaryOpcode::Sqrt, x).is_ok());
    }
}
