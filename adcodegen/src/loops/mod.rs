//! Loop models and the shared machinery for building loops into a graph
//!
//! A [`LoopModel`] describes equations that repeat over a number of
//! iterations: one small tape evaluated once per iteration, with its inputs
//! drawn from the original independents (indexed or not) or from temporaries
//! computed by the [`NoLoopModel`].
//!
//! The assemblers in [`jacobian`] and [`reverse2`] use these models to
//! produce compressed sparse derivatives, with one loop body shared by all
//! iterations.
pub mod hessian;
pub mod jacobian;
pub mod reverse2;

use crate::{
    graph::{indexed::IndexVec, Arg, Base, Graph, Node, Op, Storage},
    pattern::IndexPattern,
    tape::Tape,
    Error,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Name of the iteration index in generated loops
pub const ITERATION_INDEX_NAME: &str = "j";

/// Classification of a loop tape column
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum TapeColumn {
    /// Indexed independent, by position among the indexed columns
    Indexed(usize),
    /// Non-indexed independent, by original independent index
    NonIndexed(usize),
    /// Temporary, by temporary index `k`
    Temporary(usize),
}

/// Equations of a loop that are active on the same iterations
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EquationGroup {
    /// Tape rows
    pub equations: BTreeSet<usize>,
    pub iterations: BTreeSet<usize>,
}

/// A set of equations repeated over iterations
pub struct LoopModel<T> {
    loop_id: usize,
    tape: Arc<dyn Tape<T>>,
    iteration_count: usize,
    /// `[tape row][iteration]` → original equation, if active
    dependents: Vec<Vec<Option<usize>>>,
    /// `[indexed column][iteration]` → original independent
    indexed: Vec<Vec<usize>>,
    non_indexed: Vec<usize>,
    temporaries: Vec<usize>,

    /// original equation → (tape row, iteration)
    rows: BTreeMap<usize, (usize, usize)>,
    /// `[iteration]`: original independent → indexed tape columns
    iteration_columns: Vec<BTreeMap<usize, BTreeSet<usize>>>,
    equation_groups: Vec<EquationGroup>,
    jacobian_sparsity: Vec<BTreeSet<usize>>,
}

impl<T> std::fmt::Debug for LoopModel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("LoopModel")
            .field("loop_id", &self.loop_id)
            .field("iteration_count", &self.iteration_count)
            .field("equations", &self.dependents.len())
            .finish()
    }
}

impl<T: Base> LoopModel<T> {
    /// Builds a loop model
    ///
    /// Tape columns are ordered as `[indexed, non_indexed, temporaries]`:
    /// - `indexed[c][it]` is the original independent read by indexed column
    ///   `c` at iteration `it`
    /// - `non_indexed[c]` is the original independent read on every iteration
    /// - `temporaries[c]` is the temporary `k` computed outside of loops
    ///
    /// `dependents[i][it]` is the original equation computed by tape row `i`
    /// at iteration `it`, or `None` if the row is inactive there.
    pub fn new(
        loop_id: usize,
        tape: Arc<dyn Tape<T>>,
        iteration_count: usize,
        dependents: Vec<Vec<Option<usize>>>,
        indexed: Vec<Vec<usize>>,
        non_indexed: Vec<usize>,
        temporaries: Vec<usize>,
    ) -> Result<Self, Error> {
        let bad = |s: String| Err(Error::InvalidLoopModel(s));
        if iteration_count == 0 {
            return bad(format!("loop {loop_id} has no iterations"));
        }
        if tape.range() != dependents.len() {
            return bad(format!(
                "loop {loop_id}: tape has {} outputs but {} equations are mapped",
                tape.range(),
                dependents.len()
            ));
        }
        let columns = indexed.len() + non_indexed.len() + temporaries.len();
        if tape.domain() != columns {
            return bad(format!(
                "loop {loop_id}: tape has {} inputs but {columns} columns are mapped",
                tape.domain()
            ));
        }
        if let Some(c) = indexed.iter().position(|v| v.len() != iteration_count) {
            return bad(format!(
                "loop {loop_id}: indexed column {c} is not mapped for every iteration"
            ));
        }
        if let Some(c) = non_indexed
            .iter()
            .enumerate()
            .find_map(|(i, j)| non_indexed[..i].contains(j).then_some(*j))
        {
            return bad(format!(
                "loop {loop_id}: independent {c} is used by more than one \
                 non-indexed column"
            ));
        }

        let mut rows = BTreeMap::new();
        for (i, its) in dependents.iter().enumerate() {
            if its.len() != iteration_count {
                return bad(format!(
                    "loop {loop_id}: equation {i} is not mapped for every iteration"
                ));
            }
            if its.iter().all(|r| r.is_none()) {
                return bad(format!(
                    "loop {loop_id}: equation {i} is never active"
                ));
            }
            for (it, r) in its.iter().enumerate() {
                if let Some(r) = r {
                    if rows.insert(*r, (i, it)).is_some() {
                        return bad(format!(
                            "loop {loop_id}: equation {r} is mapped twice"
                        ));
                    }
                }
            }
        }

        let mut iteration_columns = vec![BTreeMap::new(); iteration_count];
        for (c, v) in indexed.iter().enumerate() {
            for (it, j) in v.iter().enumerate() {
                iteration_columns[it]
                    .entry(*j)
                    .or_insert_with(BTreeSet::new)
                    .insert(c);
            }
        }

        let mut by_iterations: BTreeMap<BTreeSet<usize>, BTreeSet<usize>> =
            BTreeMap::new();
        for (i, its) in dependents.iter().enumerate() {
            let active = its
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_some())
                .map(|(it, _)| it)
                .collect();
            by_iterations.entry(active).or_default().insert(i);
        }
        let equation_groups = by_iterations
            .into_iter()
            .map(|(iterations, equations)| EquationGroup {
                equations,
                iterations,
            })
            .collect();

        let jacobian_sparsity = tape.jacobian_sparsity();
        Ok(Self {
            loop_id,
            tape,
            iteration_count,
            dependents,
            indexed,
            non_indexed,
            temporaries,
            rows,
            iteration_columns,
            equation_groups,
            jacobian_sparsity,
        })
    }

    pub fn loop_id(&self) -> usize {
        self.loop_id
    }

    pub fn tape(&self) -> &dyn Tape<T> {
        self.tape.as_ref()
    }

    pub fn iteration_count(&self) -> usize {
        self.iteration_count
    }

    /// Number of tape rows (equation patterns)
    pub fn equation_count(&self) -> usize {
        self.dependents.len()
    }

    pub fn dependents(&self) -> &[Vec<Option<usize>>] {
        &self.dependents
    }

    pub fn indexed(&self) -> &[Vec<usize>] {
        &self.indexed
    }

    pub fn non_indexed(&self) -> &[usize] {
        &self.non_indexed
    }

    pub fn temporaries(&self) -> &[usize] {
        &self.temporaries
    }

    /// Classifies a tape column
    pub fn column(&self, tape_j: usize) -> TapeColumn {
        let ni = self.indexed.len();
        let nn = self.non_indexed.len();
        if tape_j < ni {
            TapeColumn::Indexed(tape_j)
        } else if tape_j < ni + nn {
            TapeColumn::NonIndexed(self.non_indexed[tape_j - ni])
        } else {
            TapeColumn::Temporary(self.temporaries[tape_j - ni - nn])
        }
    }

    /// Looks up the tape row and iteration of an original equation
    pub fn position_of(&self, row: usize) -> Option<(usize, usize)> {
        self.rows.get(&row).copied()
    }

    /// Returns the original equations handled by this loop
    pub fn rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows.keys().copied()
    }

    /// Returns the indexed tape columns reading independent `j` at iteration
    /// `it`
    pub fn indexed_columns(&self, it: usize, j: usize) -> Option<&BTreeSet<usize>> {
        self.iteration_columns.get(it)?.get(&j)
    }

    /// Returns the tape column reading independent `j` on every iteration
    pub fn non_indexed_column(&self, j: usize) -> Option<usize> {
        self.non_indexed
            .iter()
            .position(|x| *x == j)
            .map(|c| c + self.indexed.len())
    }

    /// Returns the tape column reading temporary `k`
    pub fn temporary_column(&self, k: usize) -> Option<usize> {
        self.temporaries
            .iter()
            .position(|x| *x == k)
            .map(|c| c + self.indexed.len() + self.non_indexed.len())
    }

    /// Returns the original independent read by a tape column at an
    /// iteration, if it is not a temporary
    pub fn original_column(&self, tape_j: usize, it: usize) -> Option<usize> {
        match self.column(tape_j) {
            TapeColumn::Indexed(c) => Some(self.indexed[c][it]),
            TapeColumn::NonIndexed(j) => Some(j),
            TapeColumn::Temporary(..) => None,
        }
    }

    /// Returns the iterations at which a tape row is active
    pub fn active_iterations(&self, tape_i: usize) -> BTreeSet<usize> {
        self.dependents[tape_i]
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_some())
            .map(|(it, _)| it)
            .collect()
    }

    /// Returns all iterations
    pub fn all_iterations(&self) -> BTreeSet<usize> {
        (0..self.iteration_count).collect()
    }

    pub fn equation_groups(&self) -> &[EquationGroup] {
        &self.equation_groups
    }

    /// Returns, for each tape row, the tape columns it depends on
    pub fn jacobian_sparsity(&self) -> &[BTreeSet<usize>] {
        &self.jacobian_sparsity
    }
}

/// Equations outside of loops, plus the temporaries used by loops
pub struct NoLoopModel<T> {
    tape: Arc<dyn Tape<T>>,
    orig_dependents: Vec<usize>,
    local: BTreeMap<usize, usize>,
    jacobian_sparsity: Vec<BTreeSet<usize>>,
}

impl<T> std::fmt::Debug for NoLoopModel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NoLoopModel")
            .field("orig_dependents", &self.orig_dependents)
            .finish()
    }
}

impl<T: Base> NoLoopModel<T> {
    /// Builds the model outside of loops
    ///
    /// The tape reads all original independents.  Its first outputs are the
    /// original equations `orig_dependents`; the remaining outputs are the
    /// temporaries `z_k` read by loops.
    pub fn new(
        tape: Arc<dyn Tape<T>>,
        orig_dependents: Vec<usize>,
    ) -> Result<Self, Error> {
        if tape.range() < orig_dependents.len() {
            return Err(Error::InvalidLoopModel(format!(
                "tape outside of loops has {} outputs but {} equations are mapped",
                tape.range(),
                orig_dependents.len()
            )));
        }
        let mut local = BTreeMap::new();
        for (i, r) in orig_dependents.iter().enumerate() {
            if local.insert(*r, i).is_some() {
                return Err(Error::InvalidLoopModel(format!(
                    "equation {r} is mapped twice outside of loops"
                )));
            }
        }
        let jacobian_sparsity = tape.jacobian_sparsity();
        Ok(Self {
            tape,
            orig_dependents,
            local,
            jacobian_sparsity,
        })
    }

    pub fn tape(&self) -> &dyn Tape<T> {
        self.tape.as_ref()
    }

    pub fn orig_dependents(&self) -> &[usize] {
        &self.orig_dependents
    }

    /// Returns the tape row of an original equation
    pub fn local_index(&self, row: usize) -> Option<usize> {
        self.local.get(&row).copied()
    }

    /// Number of temporaries
    pub fn temporary_count(&self) -> usize {
        self.tape.range() - self.orig_dependents.len()
    }

    /// Returns the tape row of temporary `k`
    pub fn temporary_row(&self, k: usize) -> usize {
        self.orig_dependents.len() + k
    }

    /// Returns, for each tape row, the independents it depends on
    pub fn jacobian_sparsity(&self) -> &[BTreeSet<usize>] {
        &self.jacobian_sparsity
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Reads the indexed independents of a loop at the given iteration index
pub(crate) fn indexed_independents<T: Base>(
    graph: &mut Graph<T>,
    model: &LoopModel<T>,
    iteration: Node,
) -> Result<Vec<Arg<T>>, Error> {
    model
        .indexed()
        .iter()
        .map(|v| {
            graph
                .loop_indexed_independent(IndexPattern::detect_slice(v), iteration)
                .map(Arg::Node)
        })
        .collect()
}

/// Builds the loop tape inputs: indexed, non-indexed, then temporaries
pub(crate) fn loop_independents<T: Base>(
    model: &LoopModel<T>,
    indexed: &[Arg<T>],
    x: &[Arg<T>],
    z: &[Arg<T>],
) -> Result<Vec<Arg<T>>, Error> {
    let mut out = indexed.to_vec();
    for j in model.non_indexed() {
        out.push(*x.get(*j).ok_or_else(|| {
            Error::InvalidLoopModel(format!(
                "loop {}: independent {j} is out of range",
                model.loop_id()
            ))
        })?);
    }
    for k in model.temporaries() {
        out.push(*z.get(*k).ok_or(Error::MissingTemporaries(model.loop_id()))?);
    }
    Ok(out)
}

/// Reads the multipliers of a loop's tape rows at the given iteration index
///
/// Multipliers are independents at `offset + original equation`; rows that
/// are not in `equations` get a zero weight.  Iterations on which a row is
/// inactive read the multiplier of its first active iteration, which keeps
/// the lookup in bounds; writes on those iterations are masked by branches.
pub(crate) fn loop_multipliers<T: Base>(
    graph: &mut Graph<T>,
    model: &LoopModel<T>,
    equations: &BTreeSet<usize>,
    offset: usize,
    iteration: Node,
) -> Result<Vec<Arg<T>>, Error> {
    let mut out = Vec::with_capacity(model.equation_count());
    for (i, its) in model.dependents().iter().enumerate() {
        if !equations.contains(&i) {
            out.push(Arg::Const(T::zero()));
            continue;
        }
        let first = its.iter().flatten().next().copied().unwrap_or_default();
        let map: BTreeMap<usize, usize> = its
            .iter()
            .enumerate()
            .map(|(it, r)| (it, offset + r.unwrap_or(first)))
            .collect();
        let n = graph.loop_indexed_independent(IndexPattern::detect(&map), iteration)?;
        out.push(n.into());
    }
    Ok(out)
}

/// Conditional branches of one loop body, keyed by the iterations on which
/// they are taken
///
/// Statements sharing an iteration set end up in a single branch.
#[derive(Default)]
pub(crate) struct Branches {
    pending: BTreeMap<BTreeSet<usize>, Vec<Node>>,
}

impl Branches {
    /// Defers `statement` to the branch taken on `iterations`
    pub fn add(&mut self, iterations: &BTreeSet<usize>, statement: Node) {
        self.pending
            .entry(iterations.clone())
            .or_default()
            .push(statement);
    }

    /// Builds one branch per iteration set, returning the statements closing
    /// them
    pub fn finish<T: Base>(
        self,
        graph: &mut Graph<T>,
        iteration: Node,
    ) -> Result<Vec<Node>, Error> {
        let mut out = Vec::with_capacity(self.pending.len());
        for (iterations, statements) in self.pending {
            let start = graph.cond_start(iteration, &iterations)?;
            let r = graph.cond_result(start, statements)?;
            out.push(graph.cond_end(vec![r])?);
        }
        Ok(out)
    }
}

/// Moves values that do not depend on the loop index out of a loop body
///
/// Every value that is read by a loop-dependent node but does not itself
/// depend on the loop index is attached to the loop start, so that it is
/// evaluated once before the loop.
pub(crate) fn hoist_loop_invariants<T: Base>(
    graph: &mut Graph<T>,
    start: Node,
    end: Node,
) -> Result<(), Error> {
    let mut dependent: IndexVec<bool, Node> = IndexVec::default();
    for (n, d) in graph.nodes() {
        let v = match d.op {
            Op::LoopStart => false,
            Op::Index => d.args[0].node().is_some_and(|p| {
                p == start || dependent.get(p).copied().unwrap_or(false)
            }),
            _ => d
                .args
                .iter()
                .filter_map(|a| a.node())
                .any(|a| dependent.get(a).copied().unwrap_or(false)),
        };
        let i = dependent.push(v);
        debug_assert_eq!(i, n);
    }

    let mut seen = BTreeSet::new();
    let mut hoisted = vec![];
    let mut todo: Vec<Node> = graph.arg_nodes(end).skip(1).map(|(_, n)| n).collect();
    while let Some(n) = todo.pop() {
        if !seen.insert(n) {
            continue;
        }
        for (_, a) in graph.arg_nodes(n) {
            if dependent[a] {
                todo.push(a);
            } else {
                let op = graph.op(a);
                if op.storage() != Storage::None && op != Op::Independent {
                    hoisted.push(a);
                }
            }
        }
    }
    hoisted.sort();
    hoisted.dedup();
    graph.hoist_into_loop_start(start, hoisted)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tape::TapeBuilder;

    fn tape(inputs: usize, outputs: usize) -> Arc<dyn Tape<f64>> {
        let mut b = TapeBuilder::<f64>::new();
        let x = b.inputs(inputs);
        let mut out = vec![];
        for i in 0..outputs {
            out.push(b.mul(x[i % inputs], x[(i + 1) % inputs]));
        }
        Arc::new(b.finish(out).unwrap())
    }

    #[test]
    fn model_maps() {
        let m = LoopModel::new(
            0,
            tape(3, 2),
            3,
            vec![
                vec![Some(0), Some(1), Some(2)],
                vec![Some(3), Some(4), None],
            ],
            vec![vec![0, 1, 2], vec![1, 2, 3]],
            vec![4],
            vec![],
        )
        .unwrap();
        assert_eq!(m.position_of(4), Some((1, 1)));
        assert_eq!(m.position_of(5), None);
        assert_eq!(m.indexed_columns(1, 2), Some(&[1].into_iter().collect()));
        assert_eq!(m.non_indexed_column(4), Some(2));
        assert_eq!(m.column(2), TapeColumn::NonIndexed(4));
        assert_eq!(m.original_column(1, 2), Some(3));
        assert_eq!(m.equation_groups().len(), 2);
        assert_eq!(
            m.equation_groups()[0].iterations,
            [0, 1].into_iter().collect()
        );
    }

    #[test]
    fn invalid_models() {
        let r = LoopModel::new(0, tape(3, 2), 3, vec![], vec![], vec![], vec![]);
        assert!(matches!(r, Err(Error::InvalidLoopModel(..))));
        let r = LoopModel::new(
            0,
            tape(2, 1),
            2,
            vec![vec![Some(0), Some(0)]],
            vec![vec![0, 1], vec![1, 2]],
            vec![],
            vec![],
        );
        assert!(matches!(r, Err(Error::InvalidLoopModel(..))));
    }

    #[test]
    fn hoisting() {
        use crate::graph::{LoopCount, UnaryOpcode};
        let mut g = Graph::<f64>::new();
        let xs = g.independents(4);
        let d = g.index_declaration(ITERATION_INDEX_NAME);
        let start = g.loop_start(d, LoopCount::Fixed(3)).unwrap();
        let j = g.index(start).unwrap();
        let xi = g
            .loop_indexed_independent(IndexPattern::detect_slice(&[1, 2, 3]), j)
            .unwrap();
        let e = g.unary(UnaryOpcode::Exp, xs[0]);
        let v = g.mul(xi, e);
        let dep = g
            .loop_indexed_dependent(
                v,
                IndexPattern::detect_slice(&[0, 1, 2]),
                j,
                crate::graph::Accumulate::Add,
            )
            .unwrap();
        let end = g.loop_end(start, vec![dep]).unwrap();
        hoist_loop_invariants(&mut g, start, end).unwrap();
        assert_eq!(g.loop_invariants(start), &[e]);
    }

    #[test]
    fn one_branch_per_iteration_set() {
        use crate::{
            emit::{Emitter, TextEmitter},
            graph::{Accumulate, LoopCount},
            Handler,
        };
        let mut g = Graph::<f64>::new();
        let x = g.independent();
        let d = g.index_declaration(ITERATION_INDEX_NAME);
        let start = g.loop_start(d, LoopCount::Fixed(4)).unwrap();
        let j = g.index(start).unwrap();

        let odd: BTreeSet<usize> = [1, 3].into();
        let first: BTreeSet<usize> = [0].into();
        let mut branches = Branches::default();
        for (location, its) in [(0, &odd), (1, &first), (2, &odd)] {
            let dep = g
                .loop_indexed_dependent(
                    x.into(),
                    IndexPattern::constant(location),
                    j,
                    Accumulate::Add,
                )
                .unwrap();
            branches.add(its, dep);
        }
        let body = branches.finish(&mut g, j).unwrap();
        assert_eq!(body.len(), 2);
        let end = g.loop_end(start, body).unwrap();
        let results: Vec<Node> = g
            .nodes()
            .filter(|(_, d)| d.op == Op::CondResult)
            .map(|(n, _)| n)
            .collect();
        assert_eq!(results.len(), 2);

        let out = crate::eval::evaluate(&g, &[end.into()], &[2.0], &[]).unwrap();
        assert_eq!(
            out.buffer.into_iter().collect::<Vec<_>>(),
            vec![(0, 4.0), (1, 2.0), (2, 4.0)]
        );

        let mut h = Handler::new(g);
        let mut e = TextEmitter::new();
        let s = h.generate(&[end.into()], &[], &e, &mut vec![]).unwrap();
        let src = e.emit("f", &h, &s).unwrap();
        assert_eq!(src.matches("if ").count(), 2, "{src}");
        assert_eq!(src.matches("out[").count(), 3, "{src}");
    }
}
