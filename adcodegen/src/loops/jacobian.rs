//! Sparse Jacobians of models with loops
//!
//! Each requested element `(row, col)` is routed either to the loop whose
//! equations include `row`, or to the model outside of loops.  Within a loop,
//! the element is produced by one of three paths:
//! - an indexed tape column reading `col` at the row's iteration,
//! - a non-indexed tape column reading `col` on every iteration,
//! - a temporary `z_k` depending on `col` (chain rule through `dz_k/dx`).
//!
//! A loop body is shared by all iterations, so an element requested for one
//! iteration of an equation must be requested for all of its iterations.
use crate::{
    eval,
    graph::{Accumulate, Arg, Base, Graph, LoopCount, Node},
    loops::{
        hoist_loop_invariants, indexed_independents, loop_independents,
        Branches, LoopModel, NoLoopModel, TapeColumn, ITERATION_INDEX_NAME,
    },
    pattern::IndexPattern,
    Error,
};

use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// Requested elements of one loop equation (tape row)
#[derive(Default, Debug)]
struct RowInfo {
    /// indexed tape column → iteration → output location
    indexed: BTreeMap<usize, BTreeMap<usize, usize>>,
    /// original column → iteration → output location
    non_indexed: BTreeMap<usize, BTreeMap<usize, usize>>,
    /// original columns read through a non-indexed tape column
    non_indexed_evals: BTreeSet<usize>,
    /// original column → temporaries depending on it
    temporaries: BTreeMap<usize, BTreeSet<usize>>,
}

fn record(
    map: &mut BTreeMap<usize, usize>,
    it: usize,
    e: usize,
    row: usize,
    col: usize,
) -> Result<(), Error> {
    if map.insert(it, e).is_some() {
        return Err(Error::RepeatedElement { row, col });
    }
    Ok(())
}

/// Checks that every element is requested on all active iterations
fn check_iterations<T: Base>(
    model: &LoopModel<T>,
    infos: &[RowInfo],
) -> Result<(), Error> {
    for (tape_i, info) in infos.iter().enumerate() {
        let active = model.active_iterations(tape_i);
        let missing = |map: &BTreeMap<usize, usize>| {
            active.iter().copied().find(|it| !map.contains_key(it))
        };
        let equation = |it: usize| model.dependents()[tape_i][it].unwrap_or_default();

        for (tape_j, map) in &info.indexed {
            if let Some(it) = missing(map) {
                let vars = model.indexed()[*tape_j]
                    .iter()
                    .map(|j| j.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(Error::MissingIteration {
                    loop_id: model.loop_id(),
                    equation: equation(it),
                    iteration: it,
                    variable: format!("indexed variable ({vars})"),
                });
            }
        }
        for (j, map) in &info.non_indexed {
            if let Some(it) = missing(map) {
                return Err(Error::MissingIteration {
                    loop_id: model.loop_id(),
                    equation: equation(it),
                    iteration: it,
                    variable: format!("non-indexed variable ({j})"),
                });
            }
        }
    }
    Ok(())
}

/// Records the sparse Jacobian elements `(rows[e], cols[e])` into `graph`
///
/// `x` are the graph arguments of the original independents.  Returns one
/// argument per requested element; elements produced by loops are aliases
/// of the loop's output locations.
pub fn prepare_sparse_jacobian_with_loops<T: Base>(
    graph: &mut Graph<T>,
    x: &[Arg<T>],
    rows: &[usize],
    cols: &[usize],
    loops: &[LoopModel<T>],
    no_loop: Option<&NoLoopModel<T>>,
) -> Result<Vec<Arg<T>>, Error> {
    if rows.len() != cols.len() {
        return Err(Error::BadSliceLength {
            expected: rows.len(),
            actual: cols.len(),
        });
    }
    let nnz = rows.len();

    let mut infos: Vec<Vec<RowInfo>> = loops
        .iter()
        .map(|l| (0..l.equation_count()).map(|_| RowInfo::default()).collect())
        .collect();
    let mut loop_evals: Vec<Vec<BTreeSet<usize>>> = loops
        .iter()
        .map(|l| vec![BTreeSet::new(); l.equation_count()])
        .collect();

    // (no-loop row, column) → location
    let mut no_loop_evals: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    // (temporary, column) pairs needed by loops
    let mut temp_evals: BTreeSet<(usize, usize)> = BTreeSet::new();

    let mut seen = BTreeSet::new();
    for (e, (&i, &j)) in rows.iter().zip(cols).enumerate() {
        if !seen.insert((i, j)) {
            return Err(Error::RepeatedElement { row: i, col: j });
        }

        let found = loops
            .iter()
            .enumerate()
            .find_map(|(l, m)| m.position_of(i).map(|p| (l, p)));
        let Some((l, (tape_i, it))) = found else {
            let il = no_loop
                .and_then(|nl| nl.local_index(i))
                .ok_or(Error::UnknownEquation(i))?;
            no_loop_evals.insert((il, j), e);
            continue;
        };

        let model = &loops[l];
        let sparsity = &model.jacobian_sparsity()[tape_i];
        let info = &mut infos[l][tape_i];
        let evals = &mut loop_evals[l][tape_i];

        if let Some(tape_js) = model.indexed_columns(it, j) {
            for &tape_j in tape_js.iter().filter(|c| sparsity.contains(c)) {
                evals.insert(tape_j);
                record(info.indexed.entry(tape_j).or_default(), it, e, i, j)?;
            }
        }

        let mut in_non_indexed = false;
        if let Some(tape_j) = model
            .non_indexed_column(j)
            .filter(|c| sparsity.contains(c))
        {
            evals.insert(tape_j);
            record(info.non_indexed.entry(j).or_default(), it, e, i, j)?;
            info.non_indexed_evals.insert(j);
            in_non_indexed = true;
        }

        for &tape_j in sparsity {
            let TapeColumn::Temporary(k) = model.column(tape_j) else {
                continue;
            };
            let nl = no_loop.ok_or(Error::MissingTemporaries(model.loop_id()))?;
            let z_row = nl.temporary_row(k);
            if !nl
                .jacobian_sparsity()
                .get(z_row)
                .is_some_and(|s| s.contains(&j))
            {
                continue;
            }
            temp_evals.insert((k, j));
            if !in_non_indexed {
                record(info.non_indexed.entry(j).or_default(), it, e, i, j)?;
                in_non_indexed = true;
            }
            info.temporaries.entry(j).or_default().insert(k);
            evals.insert(tape_j);
        }
    }

    for (model, info) in loops.iter().zip(&infos) {
        check_iterations(model, info)?;
    }

    let mut jac = vec![Arg::Const(T::zero()); nnz];

    // Equations outside of loops, and the temporaries read by loops
    let mut temps = vec![];
    let mut dz_dx: BTreeMap<(usize, usize), Arg<T>> = BTreeMap::new();
    if let Some(nl) = no_loop {
        let y = nl.tape().forward_zero(graph, x)?;
        temps = y[nl.orig_dependents().len()..].to_vec();

        let mut elements: Vec<(usize, usize)> =
            no_loop_evals.keys().copied().collect();
        elements.extend(temp_evals.iter().map(|&(k, j)| (nl.temporary_row(k), j)));
        let values = nl.tape().sparse_jacobian(graph, x, &elements)?;

        for ((il, j), v) in elements.into_iter().zip(values) {
            match no_loop_evals.get(&(il, j)) {
                Some(&e) if il < nl.orig_dependents().len() => jac[e] = v,
                _ => {
                    dz_dx.insert((il - nl.orig_dependents().len(), j), v);
                }
            }
        }
    }

    let declaration = graph.index_declaration(ITERATION_INDEX_NAME);
    for ((model, info), evals) in loops.iter().zip(&infos).zip(&loop_evals) {
        if info
            .iter()
            .all(|r| r.indexed.is_empty() && r.non_indexed.is_empty())
        {
            continue;
        }
        let start = graph
            .loop_start(declaration, LoopCount::Fixed(model.iteration_count()))?;
        let iteration = graph.index(start)?;

        let indexed = indexed_independents(graph, model, iteration)?;
        let xl = loop_independents(model, &indexed, x, &temps)?;

        let elements: Vec<(usize, usize)> = evals
            .iter()
            .enumerate()
            .flat_map(|(i, cols)| cols.iter().map(move |&c| (i, c)))
            .collect();
        let values = model.tape().sparse_jacobian(graph, &xl, &elements)?;
        let dy: BTreeMap<(usize, usize), Arg<T>> =
            elements.into_iter().zip(values).collect();
        let get = |i: usize, c: usize| dy.get(&(i, c)).copied().unwrap_or(Arg::Const(T::zero()));

        let mut branches = Branches::default();
        let mut body = vec![];
        let mut locations = BTreeSet::new();
        let mut write = |graph: &mut Graph<T>,
                         value: Arg<T>,
                         map: &BTreeMap<usize, usize>,
                         active: &BTreeSet<usize>|
         -> Result<Option<Node>, Error> {
            locations.extend(map.values().copied());
            let dep = graph.loop_indexed_dependent(
                value,
                IndexPattern::detect(map),
                iteration,
                Accumulate::Add,
            )?;
            if active.len() == model.iteration_count() {
                Ok(Some(dep))
            } else {
                branches.add(active, dep);
                Ok(None)
            }
        };

        for (tape_i, r) in info.iter().enumerate() {
            let active = model.active_iterations(tape_i);
            for (tape_j, map) in &r.indexed {
                body.extend(write(graph, get(tape_i, *tape_j), map, &active)?);
            }
            for (j, map) in &r.non_indexed {
                let mut value = Arg::Const(T::zero());
                if r.non_indexed_evals.contains(j) {
                    if let Some(c) = model.non_indexed_column(*j) {
                        value = graph.add(value, get(tape_i, c));
                    }
                }
                for k in r.temporaries.get(j).into_iter().flatten() {
                    let Some(c) = model.temporary_column(*k) else {
                        continue;
                    };
                    let dz = dz_dx.get(&(*k, *j)).copied().unwrap_or(Arg::Const(T::zero()));
                    let term = graph.mul(get(tape_i, c), dz);
                    value = graph.add(value, term);
                }
                body.extend(write(graph, value, map, &active)?);
            }
        }

        body.extend(branches.finish(graph, iteration)?);
        let statements = body.len();
        let end = graph.loop_end(start, body)?;
        for e in locations {
            jac[e] = graph.alias(end, e)?.into();
        }
        hoist_loop_invariants(graph, start, end)?;
        debug!(
            "loop {}: {statements} jacobian statements over {} iterations",
            model.loop_id(),
            model.iteration_count()
        );
    }

    Ok(jac)
}

/// A sparse Jacobian recorded into its own graph
#[derive(Debug)]
pub struct SparseJacobian<T> {
    graph: Graph<T>,
    outputs: Vec<Arg<T>>,
    rows: Vec<usize>,
    cols: Vec<usize>,
}

impl<T: Base> SparseJacobian<T> {
    /// Builds the requested elements of the Jacobian of a model with `domain`
    /// independents
    pub fn build(
        domain: usize,
        rows: &[usize],
        cols: &[usize],
        loops: &[LoopModel<T>],
        no_loop: Option<&NoLoopModel<T>>,
    ) -> Result<Self, Error> {
        let mut graph = Graph::new();
        let x: Vec<Arg<T>> = graph
            .independents(domain)
            .into_iter()
            .map(Arg::Node)
            .collect();
        let outputs = prepare_sparse_jacobian_with_loops(
            &mut graph, &x, rows, cols, loops, no_loop,
        )?;
        Ok(Self {
            graph,
            outputs,
            rows: rows.to_vec(),
            cols: cols.to_vec(),
        })
    }

    pub fn graph(&self) -> &Graph<T> {
        &self.graph
    }

    /// Returns the graph, for scheduling with a [`Handler`](crate::Handler)
    pub fn into_parts(self) -> (Graph<T>, Vec<Arg<T>>) {
        (self.graph, self.outputs)
    }

    /// One output per requested element
    pub fn outputs(&self) -> &[Arg<T>] {
        &self.outputs
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    /// Evaluates the requested elements at `x`
    pub fn evaluate(&self, x: &[T]) -> Result<Vec<T>, Error> {
        Ok(eval::evaluate(&self.graph, &self.outputs, x, &[])?.values)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tape::{Tape, TapeBuilder};
    use std::sync::Arc;

    /// y_it = x_it * x_{it + 1}, for it in 0..3
    fn chain_loop() -> LoopModel<f64> {
        let mut b = TapeBuilder::<f64>::new();
        let x = b.inputs(2);
        let y = b.mul(x[0], x[1]);
        let tape: Arc<dyn Tape<f64>> = Arc::new(b.finish(vec![y]).unwrap());
        LoopModel::new(
            0,
            tape,
            3,
            vec![vec![Some(0), Some(1), Some(2)]],
            vec![vec![0, 1, 2], vec![1, 2, 3]],
            vec![],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn simple_loop() {
        let l = chain_loop();
        let rows = [0, 0, 1, 1, 2, 2];
        let cols = [0, 1, 1, 2, 2, 3];
        let jac = SparseJacobian::build(4, &rows, &cols, &[l], None).unwrap();
        let v = jac.evaluate(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(v, vec![2.0, 1.0, 3.0, 2.0, 4.0, 3.0]);
    }

    #[test]
    fn missing_iteration() {
        let l = chain_loop();
        let r = SparseJacobian::build(4, &[0, 1], &[0, 1], &[l], None);
        match r {
            Err(Error::MissingIteration {
                iteration,
                equation,
                ..
            }) => {
                assert_eq!(iteration, 2);
                assert_eq!(equation, 2);
            }
            r => panic!("unexpected result {r:?}"),
        }
    }

    #[test]
    fn repeated_element() {
        let l = chain_loop();
        let rows = [0, 0, 1, 1, 2, 2, 1];
        let cols = [0, 1, 1, 2, 2, 3, 2];
        let r = SparseJacobian::build(4, &rows, &cols, &[l], None);
        assert_eq!(r.err(), Some(Error::RepeatedElement { row: 1, col: 2 }));
    }

    #[test]
    fn unknown_equation() {
        let l = chain_loop();
        let r = SparseJacobian::build(4, &[7], &[0], &[l], None);
        assert_eq!(r.err(), Some(Error::UnknownEquation(7)));
    }
}
