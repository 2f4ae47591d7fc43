//! A small looped model shared by the integration tests
//!
//! Independents are `x0..x5`.  For `it` in `0..3`, with `a = x_{it + 1}`,
//! `b = x_{it + 2}`, `c = x0` and the temporary `z = x5²`:
//! - `g0 = a * b + sin(a) * c * z` (equations 0, 1, 2)
//! - `g1 = exp(b) * c` (equations 3, 4, 5)
//! - `g2 = a * a * c`, only for `it < 2` (equations 6, 7)
//!
//! Equation 8 is `x0 + sin(x5)`, outside of the loop.
#![allow(dead_code)]
use adcodegen::{
    graph::Graph,
    loops::{LoopModel, NoLoopModel},
    tape::{ExprTape, Tape, TapeBuilder},
    Arg,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DOMAIN: usize = 6;
pub const RANGE: usize = 9;
pub const ITERATIONS: usize = 3;

pub fn loop_model() -> LoopModel<f64> {
    let mut t = TapeBuilder::<f64>::new();
    let v = t.inputs(4);
    let (a, b, c, z) = (v[0], v[1], v[2], v[3]);
    let ab = t.mul(a, b);
    let s = t.sin(a);
    let sc = t.mul(s, c);
    let scz = t.mul(sc, z);
    let g0 = t.add(ab, scz);
    let e = t.exp(b);
    let g1 = t.mul(e, c);
    let aa = t.mul(a, a);
    let g2 = t.mul(aa, c);
    let tape: Arc<dyn Tape<f64>> = Arc::new(t.finish(vec![g0, g1, g2]).unwrap());

    LoopModel::new(
        0,
        tape,
        ITERATIONS,
        vec![
            vec![Some(0), Some(1), Some(2)],
            vec![Some(3), Some(4), Some(5)],
            vec![Some(6), Some(7), None],
        ],
        vec![vec![1, 2, 3], vec![2, 3, 4]],
        vec![0],
        vec![0],
    )
    .unwrap()
}

pub fn no_loop_model() -> NoLoopModel<f64> {
    let mut t = TapeBuilder::<f64>::new();
    let x = t.inputs(DOMAIN);
    let s = t.sin(x[5]);
    let y8 = t.add(x[0], s);
    let z = t.mul(x[5], x[5]);
    let tape: Arc<dyn Tape<f64>> = Arc::new(t.finish(vec![y8, z]).unwrap());
    NoLoopModel::new(tape, vec![8]).unwrap()
}

/// The same model, without loops
pub fn reference() -> ExprTape<f64> {
    let mut t = TapeBuilder::<f64>::new();
    let x = t.inputs(DOMAIN);
    let z = t.mul(x[5], x[5]);
    let (mut g0, mut g1, mut g2) = (vec![], vec![], vec![]);
    for it in 0..ITERATIONS {
        let (a, b, c) = (x[it + 1], x[it + 2], x[0]);
        let ab = t.mul(a, b);
        let s = t.sin(a);
        let sc = t.mul(s, c);
        let scz = t.mul(sc, z);
        g0.push(t.add(ab, scz));
        let e = t.exp(b);
        g1.push(t.mul(e, c));
        if it < 2 {
            let aa = t.mul(a, a);
            g2.push(t.mul(aa, c));
        }
    }
    let s = t.sin(x[5]);
    let y8 = t.add(x[0], s);

    let mut outputs = g0;
    outputs.extend(g1);
    outputs.extend(g2);
    outputs.push(y8);
    t.finish(outputs).unwrap()
}

pub fn random_point(seed: u64, n: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(0.5..1.5)).collect()
}

/// Every structurally nonzero Jacobian element, row by row
pub fn jacobian_elements(tape: &dyn Tape<f64>) -> (Vec<usize>, Vec<usize>) {
    tape.jacobian_sparsity()
        .into_iter()
        .enumerate()
        .flat_map(|(i, cols)| cols.into_iter().map(move |j| (i, j)))
        .unzip()
}

/// Every structurally nonzero Hessian element of all equations
pub fn hessian_elements(tape: &dyn Tape<f64>) -> BTreeMap<usize, Vec<usize>> {
    let rows = (0..tape.range()).collect();
    tape.hessian_sparsity(&rows)
        .into_iter()
        .enumerate()
        .filter(|(_, cols)| !cols.is_empty())
        .map(|(j, cols)| (j, cols.into_iter().collect()))
        .collect()
}

fn inputs(g: &mut Graph<f64>, n: usize) -> Vec<Arg<f64>> {
    g.independents(n).into_iter().map(Arg::Node).collect()
}

pub fn reference_jacobian(
    tape: &dyn Tape<f64>,
    x: &[f64],
    rows: &[usize],
    cols: &[usize],
) -> Vec<f64> {
    let mut g = Graph::<f64>::new();
    let xs = inputs(&mut g, tape.domain());
    let elements: Vec<_> = rows.iter().copied().zip(cols.iter().copied()).collect();
    let values = tape.sparse_jacobian(&mut g, &xs, &elements).unwrap();
    values.into_iter().map(|v| g.eval(v, x).unwrap()).collect()
}

/// `tx1 * Σ_i py_i ∇²y_i`, in the order of `elements`
pub fn reference_hessian(
    tape: &dyn Tape<f64>,
    x: &[f64],
    tx1: f64,
    py: &[f64],
    elements: &BTreeMap<usize, Vec<usize>>,
) -> Vec<f64> {
    let mut g = Graph::<f64>::new();
    let xs = inputs(&mut g, tape.domain());
    let w: Vec<Arg<f64>> = py.iter().map(|p| Arg::Const(*p * tx1)).collect();
    let pairs: Vec<(usize, usize)> = elements
        .iter()
        .flat_map(|(r, cs)| cs.iter().map(move |c| (*r, *c)))
        .collect();
    let values = tape.sparse_hessian(&mut g, &xs, &w, &pairs).unwrap();
    values.into_iter().map(|v| g.eval(v, x).unwrap()).collect()
}

/// Concatenates `[x, tx1, py]`
pub fn reverse_two_inputs(x: &[f64], tx1: f64, py: &[f64]) -> Vec<f64> {
    let mut out = x.to_vec();
    out.push(tx1);
    out.extend_from_slice(py);
    out
}
