//! Sparse Hessians of models with loops, as second-order reverse mode
//!
//! Every generated function takes the inputs `[x, tx1, py]`, where `tx1`
//! scales all results and `py` are the multipliers of the original
//! equations, and writes compressed Hessian rows:
//! `px[e] = tx1 * Σ_i py_i ∂²F_i / ∂x_jrow ∂x_jcol[e]`.
//!
//! Loop contributions are generated once per [`HessianRowGroup`], with the
//! row passed as an index argument.  Equations outside of loops (and the
//! curvature of the temporaries read by loops) get one function per row.
use crate::{
    codegen::{FunctionBatch, FunctionOutputs},
    emit::{Dispatch, DispatchCall},
    eval,
    graph::{Accumulate, Arg, Base, Graph, LoopCount, Node},
    loops::{
        hessian::{
            analyse_sparse_hessian_with_loops, generate_hessian_row_groups,
            EquationGroupTerms, HessianAnalysis, HessianElement, HessianRowGroup,
            LoopHessian, TermKind,
        },
        hoist_loop_invariants, indexed_independents, loop_independents,
        loop_multipliers, Branches, LoopModel, NoLoopModel, ITERATION_INDEX_NAME,
    },
    naming,
    pattern::IndexPattern,
    Error,
};

use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};
use strum::IntoEnumIterator;

/// Name of the Hessian row index argument of group functions
pub const ROW_INDEX_NAME: &str = "jrow";
const LOCAL_ITERATION_NAME: &str = "it";
const LOCAL_COUNT_NAME: &str = "it_count";

/// Function computing the loop contributions of a [`HessianRowGroup`]
#[derive(Debug)]
pub struct GroupFunction<T> {
    name: String,
    loop_id: usize,
    group: HessianRowGroup,
    graph: Graph<T>,
    outputs: Vec<Arg<T>>,
    /// Declaration of the row index argument
    row_index: Node,
    /// Row → compressed locations written
    locations: BTreeMap<usize, BTreeSet<usize>>,
}

impl<T: Base> GroupFunction<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loop_id(&self) -> usize {
        self.loop_id
    }

    pub fn group(&self) -> &HessianRowGroup {
        &self.group
    }

    pub fn graph(&self) -> &Graph<T> {
        &self.graph
    }

    pub fn outputs(&self) -> &[Arg<T>] {
        &self.outputs
    }

    pub fn row_index(&self) -> Node {
        self.row_index
    }

    pub fn locations(&self) -> &BTreeMap<usize, BTreeSet<usize>> {
        &self.locations
    }

    /// Evaluates the contributions to `row`, returning location → value
    pub fn evaluate(
        &self,
        row: usize,
        inputs: &[T],
    ) -> Result<BTreeMap<usize, T>, Error> {
        let out = eval::evaluate(
            &self.graph,
            &self.outputs,
            inputs,
            &[(self.row_index, row)],
        )?;
        Ok(out.buffer)
    }
}

#[derive(Debug)]
struct NoLoopRow<T> {
    name: String,
    /// Full compressed row
    outputs: Vec<Arg<T>>,
    locations: Vec<usize>,
}

/// Row functions for the contributions outside of loops, sharing one graph
#[derive(Debug)]
pub struct NoLoopRows<T> {
    graph: Graph<T>,
    rows: BTreeMap<usize, NoLoopRow<T>>,
}

impl<T: Base> NoLoopRows<T> {
    pub fn graph(&self) -> &Graph<T> {
        &self.graph
    }

    /// Returns the rows with a function
    pub fn rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows.keys().copied()
    }

    /// Evaluates the function of `row`, returning location → value
    pub fn evaluate(
        &self,
        row: usize,
        inputs: &[T],
    ) -> Result<BTreeMap<usize, T>, Error> {
        let Some(r) = self.rows.get(&row) else {
            return Ok(BTreeMap::new());
        };
        let values = eval::evaluate(&self.graph, &r.outputs, inputs, &[])?.values;
        Ok(r.locations.iter().map(|e| (*e, values[*e])).collect())
    }
}

/// A sparse Hessian of a model with loops
#[derive(Debug)]
pub struct ReverseTwo<T> {
    name: String,
    domain: usize,
    range: usize,
    elements: BTreeMap<usize, Vec<usize>>,
    groups: Vec<GroupFunction<T>>,
    no_loop: Option<NoLoopRows<T>>,
    dispatch: Dispatch,
}

impl<T: Base> ReverseTwo<T> {
    /// Builds the functions for the requested Hessian `elements`
    ///
    /// `elements` maps each row `j1` to its columns, in compressed order.
    pub fn build(
        name: &str,
        domain: usize,
        range: usize,
        elements: &BTreeMap<usize, Vec<usize>>,
        loops: &[LoopModel<T>],
        no_loop: Option<&NoLoopModel<T>>,
    ) -> Result<Self, Error> {
        let analysis = analyse_sparse_hessian_with_loops(elements, loops, no_loop)?;

        let mut dispatch = Dispatch::default();
        for (row, cols) in elements {
            dispatch.rows.entry(*row).or_default().len = cols.len();
        }

        let no_loop_rows = match no_loop {
            Some(nl) if !analysis.no_loop.is_empty() => Some(build_no_loop(
                name, domain, range, elements, &analysis, loops, nl,
            )?),
            _ => None,
        };
        if let Some(nl) = &no_loop_rows {
            for (row, r) in &nl.rows {
                dispatch.rows.entry(*row).or_default().calls.push(DispatchCall {
                    function: r.name.clone(),
                    locations: r.locations.clone(),
                    takes_row: false,
                });
            }
        }

        let mut groups = vec![];
        for (model, lh) in loops.iter().zip(&analysis.loops) {
            let row_groups = generate_hessian_row_groups(lh, model.iteration_count());
            debug!(
                "loop {}: {} hessian row groups",
                model.loop_id(),
                row_groups.len()
            );
            for (g, group) in row_groups.into_iter().enumerate() {
                let fname = naming::loop_group_function(
                    name,
                    naming::SPARSE_REVERSE_TWO,
                    model.loop_id(),
                    g,
                );
                let f = build_group_function(
                    fname, domain, range, model, lh, group, no_loop,
                )?;
                for (row, locs) in &f.locations {
                    dispatch.rows.entry(*row).or_default().calls.push(
                        DispatchCall {
                            function: f.name.clone(),
                            locations: locs.iter().copied().collect(),
                            takes_row: true,
                        },
                    );
                }
                groups.push(f);
            }
        }
        info!(
            "{}: {} loop group functions, {} rows outside of loops",
            naming::function(name, naming::SPARSE_REVERSE_TWO),
            groups.len(),
            no_loop_rows.as_ref().map(|r| r.rows.len()).unwrap_or(0)
        );

        Ok(Self {
            name: name.to_owned(),
            domain,
            range,
            elements: elements.clone(),
            groups,
            no_loop: no_loop_rows,
            dispatch,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of function inputs, `[x, tx1, py]`
    pub fn input_count(&self) -> usize {
        self.domain + 1 + self.range
    }

    pub fn elements(&self) -> &BTreeMap<usize, Vec<usize>> {
        &self.elements
    }

    pub fn groups(&self) -> &[GroupFunction<T>] {
        &self.groups
    }

    pub fn no_loop(&self) -> Option<&NoLoopRows<T>> {
        self.no_loop.as_ref()
    }

    /// Plan for assembling each row from the generated functions
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Requested elements as flat `(rows, cols)`, in compressed order
    pub fn sparsity(&self) -> (Vec<usize>, Vec<usize>) {
        self.elements
            .iter()
            .flat_map(|(r, cols)| cols.iter().map(move |c| (*r, *c)))
            .unzip()
    }

    /// Evaluates one compressed row, following the dispatch plan
    pub fn evaluate_row(&self, row: usize, inputs: &[T]) -> Result<Vec<T>, Error> {
        let Some(r) = self.dispatch.rows.get(&row) else {
            return Ok(vec![]);
        };
        let mut out = vec![T::zero(); r.len];
        for call in &r.calls {
            let values = if call.takes_row {
                match self.groups.iter().find(|g| g.name == call.function) {
                    Some(g) => g.evaluate(row, inputs)?,
                    None => BTreeMap::new(),
                }
            } else {
                match &self.no_loop {
                    Some(nl) => nl.evaluate(row, inputs)?,
                    None => BTreeMap::new(),
                }
            };
            for &e in &call.locations {
                if let (Some(v), Some(o)) = (values.get(&e), out.get_mut(e)) {
                    *o = *o + *v;
                }
            }
        }
        Ok(out)
    }

    /// Evaluates every requested element, in the order of [`Self::sparsity`]
    pub fn evaluate(&self, inputs: &[T]) -> Result<Vec<T>, Error> {
        if inputs.len() != self.input_count() {
            return Err(Error::BadSliceLength {
                expected: self.input_count(),
                actual: inputs.len(),
            });
        }
        let mut out = vec![];
        for row in self.elements.keys() {
            out.extend(self.evaluate_row(*row, inputs)?);
        }
        Ok(out)
    }

    /// Splits into graphs and the functions to generate from them
    pub fn into_batches(self) -> Vec<FunctionBatch<T>> {
        let mut out = vec![];
        if let Some(nl) = self.no_loop {
            out.push(FunctionBatch {
                graph: nl.graph,
                functions: nl
                    .rows
                    .into_values()
                    .map(|r| FunctionOutputs {
                        name: r.name,
                        outputs: r.outputs,
                        index_arguments: vec![],
                    })
                    .collect(),
            });
        }
        for g in self.groups {
            out.push(FunctionBatch {
                graph: g.graph,
                functions: vec![FunctionOutputs {
                    name: g.name,
                    outputs: g.outputs,
                    index_arguments: vec![g.row_index],
                }],
            });
        }
        out
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Registers the inputs `[x, tx1, py]`
fn make_inputs<T: Base>(
    graph: &mut Graph<T>,
    domain: usize,
    range: usize,
) -> (Vec<Arg<T>>, Arg<T>, Vec<Arg<T>>) {
    let mut v: Vec<Arg<T>> = graph
        .independents(domain + 1 + range)
        .into_iter()
        .map(Arg::Node)
        .collect();
    let py = v.split_off(domain + 1);
    let tx1 = v.pop().unwrap_or(Arg::Const(T::one()));
    (v, tx1, py)
}

/// Records the temporaries read by a loop and the derivatives `dz_k / dx_j`
#[allow(clippy::type_complexity)]
fn temporaries<T: Base>(
    graph: &mut Graph<T>,
    x: &[Arg<T>],
    model: &LoopModel<T>,
    no_loop: Option<&NoLoopModel<T>>,
    pairs: &BTreeSet<(usize, usize)>,
) -> Result<(Vec<Arg<T>>, BTreeMap<(usize, usize), Arg<T>>), Error> {
    if model.temporaries().is_empty() {
        return Ok((vec![], BTreeMap::new()));
    }
    let nl = no_loop.ok_or(Error::MissingTemporaries(model.loop_id()))?;
    let y = nl.tape().forward_zero(graph, x)?;
    let z = y[nl.orig_dependents().len()..].to_vec();

    let elements: Vec<(usize, usize)> = pairs
        .iter()
        .map(|(k, j)| (nl.temporary_row(*k), *j))
        .collect();
    let values = nl.tape().sparse_jacobian(graph, x, &elements)?;
    Ok((z, pairs.iter().copied().zip(values).collect()))
}

/// Collects the statements of a group function
struct Writer<T> {
    iteration: Node,
    tx1: Arg<T>,
    branches: Branches,
    statements: Vec<Node>,
    locations: BTreeMap<usize, BTreeSet<usize>>,
}

impl<T: Base> Writer<T> {
    /// Writes an indexed term, at the iterations of `group` where it is
    /// present
    ///
    /// If the term is not present on every iteration of the group, the write
    /// is placed in a branch.
    fn indexed(
        &mut self,
        graph: &mut Graph<T>,
        group: &HessianRowGroup,
        positions: &[Option<HessianElement>],
        value: Arg<T>,
    ) -> Result<(), Error> {
        if value.is_zero() {
            return Ok(());
        }
        let mut map: BTreeMap<usize, usize> = BTreeMap::new();
        for (row, its) in &group.jrow_iterations {
            for &it in its {
                let Some(p) = positions
                    .get(it)
                    .copied()
                    .flatten()
                    .filter(|p| p.row == *row)
                else {
                    continue;
                };
                map.insert(it, p.location);
                self.locations.entry(p.row).or_default().insert(p.location);
            }
        }
        if map.is_empty() {
            return Ok(());
        }

        let v = graph.mul(value, self.tx1);
        let dep = graph.loop_indexed_dependent(
            v,
            IndexPattern::detect(&map),
            self.iteration,
            Accumulate::Add,
        )?;
        if map.len() == group.iterations.len() {
            self.statements.push(dep);
        } else {
            let its = map.keys().copied().collect();
            self.branches.add(&its, dep);
        }
        Ok(())
    }

    /// Writes to a constant location of `row`, optionally only on some
    /// iterations
    fn constant(
        &mut self,
        graph: &mut Graph<T>,
        row: usize,
        location: usize,
        value: Arg<T>,
        iterations: Option<&BTreeSet<usize>>,
    ) -> Result<(), Error> {
        if value.is_zero() {
            return Ok(());
        }
        let v = graph.mul(value, self.tx1);
        let dep = graph.loop_indexed_dependent(
            v,
            IndexPattern::constant(location),
            self.iteration,
            Accumulate::Add,
        )?;
        match iterations {
            Some(its) => self.branches.add(its, dep),
            None => self.statements.push(dep),
        }
        self.locations.entry(row).or_default().insert(location);
        Ok(())
    }
}

/// Tape Hessian values of one equation group, by tape column pair
type TapeHessian<T> = BTreeMap<(usize, usize), Arg<T>>;

struct TermValues<'a, T> {
    model: &'a LoopModel<T>,
    dz_dx: &'a BTreeMap<(usize, usize), Arg<T>>,
}

impl<T: Base> TermValues<'_, T> {
    fn get(h: &TapeHessian<T>, a: usize, b: usize) -> Arg<T> {
        h.get(&(a, b)).copied().unwrap_or(Arg::Const(T::zero()))
    }

    fn dz(&self, k: usize, j: usize) -> Arg<T> {
        self.dz_dx
            .get(&(k, j))
            .copied()
            .unwrap_or(Arg::Const(T::zero()))
    }

    /// `Σ_k ∂²g / ∂a ∂z_k · dz_k / dx_j`, with `a` on either side
    fn through_temporaries(
        &self,
        graph: &mut Graph<T>,
        h: &TapeHessian<T>,
        a: usize,
        a_first: bool,
        ks: &BTreeSet<usize>,
        j: usize,
    ) -> Arg<T> {
        let mut out = Arg::Const(T::zero());
        for &k in ks {
            let Some(c) = self.model.temporary_column(k) else {
                continue;
            };
            let d2 = if a_first {
                Self::get(h, a, c)
            } else {
                Self::get(h, c, a)
            };
            let term = graph.mul(d2, self.dz(k, j));
            out = graph.add(out, term);
        }
        out
    }

    /// Value of an indexed term
    fn indexed(
        &self,
        graph: &mut Graph<T>,
        kind: TermKind,
        key: (usize, usize),
        terms: &EquationGroupTerms,
        h: &TapeHessian<T>,
    ) -> Arg<T> {
        let ks = terms.temporaries[kind].get(&key);
        match (kind, ks) {
            (
                TermKind::IndexedIndexed
                | TermKind::IndexedNonIndexed
                | TermKind::NonIndexedIndexed,
                _,
            ) => Self::get(h, key.0, key.1),
            (TermKind::IndexedTemporary, Some(ks)) => {
                self.through_temporaries(graph, h, key.0, true, ks, key.1)
            }
            (TermKind::TemporaryIndexed, Some(ks)) => {
                self.through_temporaries(graph, h, key.1, false, ks, key.0)
            }
            _ => Arg::Const(T::zero()),
        }
    }

    /// Value of the non-indexed family for `(j1, j2)` in one equation group
    fn non_indexed(
        &self,
        graph: &mut Graph<T>,
        key: (usize, usize),
        terms: &EquationGroupTerms,
        h: &TapeHessian<T>,
    ) -> Arg<T> {
        let (j1, j2) = key;
        let n1 = self.model.non_indexed_column(j1);
        let n2 = self.model.non_indexed_column(j2);
        let mut out = Arg::Const(T::zero());
        if terms.non_indexed.contains(&key) {
            if let (Some(a), Some(b)) = (n1, n2) {
                out = graph.add(out, Self::get(h, a, b));
            }
        }
        if let (Some(ks), Some(a)) = (terms.non_indexed_temporary.get(&key), n1) {
            let v = self.through_temporaries(graph, h, a, true, ks, j2);
            out = graph.add(out, v);
        }
        if let (Some(ks), Some(b)) = (terms.temporary_non_indexed.get(&key), n2) {
            let v = self.through_temporaries(graph, h, b, false, ks, j1);
            out = graph.add(out, v);
        }
        if let Some(tt) = terms.temporary_temporary.get(&key) {
            for (k1, k2s) in tt {
                let Some(c1) = self.model.temporary_column(*k1) else {
                    continue;
                };
                let inner = self.through_temporaries(graph, h, c1, true, k2s, j2);
                let v = graph.mul(inner, self.dz(*k1, j1));
                out = graph.add(out, v);
            }
        }
        out
    }
}

fn build_group_function<T: Base>(
    name: String,
    domain: usize,
    range: usize,
    model: &LoopModel<T>,
    lh: &LoopHessian,
    group: HessianRowGroup,
    no_loop: Option<&NoLoopModel<T>>,
) -> Result<GroupFunction<T>, Error> {
    let mut graph = Graph::new();
    let (x, tx1, _py) = make_inputs(&mut graph, domain, range);
    let row_index = graph.index_declaration(ROW_INDEX_NAME);
    let row = graph.index(row_index)?;

    let (z, dz_dx) =
        temporaries(&mut graph, &x, model, no_loop, &lh.temporary_jacobian)?;

    // A loop is needed unless every row reads exactly one iteration
    let counts: BTreeSet<usize> =
        group.jrow_iterations.values().map(BTreeSet::len).collect();
    let creates_loop = counts.len() != 1 || counts.first() != Some(&1);

    let iteration_decl = graph.index_declaration(ITERATION_INDEX_NAME);
    let mut start = None;
    let assign = if creates_loop {
        let count_map: BTreeMap<usize, usize> = group
            .jrow_iterations
            .iter()
            .map(|(r, its)| (*r, its.len()))
            .collect();
        let count_pattern = IndexPattern::detect(&count_map);
        let count = match count_pattern.constant_value() {
            Some(c) => LoopCount::Fixed(c),
            None => {
                let d = graph.index_declaration(LOCAL_COUNT_NAME);
                let a = graph.index_assign(d, count_pattern, &[row])?;
                LoopCount::Indexed(graph.index(a)?)
            }
        };
        let local_decl = graph.index_declaration(LOCAL_ITERATION_NAME);
        let s = graph.loop_start(local_decl, count)?;
        let local = graph.index(s)?;
        start = Some(s);

        // iteration = f(jrow) + g(local iteration), if possible
        let table: BTreeMap<usize, BTreeMap<usize, usize>> = group
            .jrow_iterations
            .iter()
            .map(|(r, its)| (*r, its.iter().copied().enumerate().collect()))
            .collect();
        graph.index_assign(
            iteration_decl,
            IndexPattern::detect_2d(&table),
            &[row, local],
        )?
    } else {
        let table: BTreeMap<usize, usize> = group
            .jrow_iterations
            .iter()
            .filter_map(|(r, its)| its.first().map(|it| (*r, *it)))
            .collect();
        graph.index_assign(iteration_decl, IndexPattern::detect(&table), &[row])?
    };
    let iteration = graph.index(assign)?;

    let indexed = indexed_independents(&mut graph, model, iteration)?;
    let xl = loop_independents(model, &indexed, &x, &z)?;

    let mut hess: Vec<TapeHessian<T>> = vec![];
    for (eq, terms) in model.equation_groups().iter().zip(&lh.groups) {
        if terms.evals.is_empty() {
            hess.push(BTreeMap::new());
            continue;
        }
        let w = loop_multipliers(&mut graph, model, &eq.equations, domain + 1, iteration)?;
        let pairs: Vec<(usize, usize)> = terms.evals.iter().copied().collect();
        let values = model.tape().sparse_hessian(&mut graph, &xl, &w, &pairs)?;
        hess.push(pairs.into_iter().zip(values).collect());
    }

    let values = TermValues {
        model,
        dz_dx: &dz_dx,
    };
    let mut writer = Writer {
        iteration,
        tx1,
        branches: Branches::default(),
        statements: vec![],
        locations: BTreeMap::new(),
    };

    for (terms, h) in lh.groups.iter().zip(&hess) {
        for kind in TermKind::iter().filter(TermKind::is_indexed) {
            for key in group.contrib.terms(kind) {
                let Some(positions) = terms.positions[kind].get(key) else {
                    continue;
                };
                let v = values.indexed(&mut graph, kind, *key, terms, h);
                writer.indexed(&mut graph, &group, positions, v)?;
            }
        }
    }

    // Non-indexed terms accumulate over iterations into one location
    for &(j1, j2) in group.contrib.terms(TermKind::NonIndexedNonIndexed) {
        let Some(&e) = lh.non_indexed_positions.get(&(j1, j2)) else {
            continue;
        };
        let mut total = Arg::Const(T::zero());
        let groups = model.equation_groups().iter().zip(&lh.groups).zip(&hess);
        for ((eq, terms), h) in groups {
            let v = values.non_indexed(&mut graph, (j1, j2), terms, h);
            if v.is_zero() {
                continue;
            }
            let its: BTreeSet<usize> = group
                .iterations
                .intersection(&eq.iterations)
                .copied()
                .collect();
            if its.len() == group.iterations.len() {
                total = graph.add(total, v);
            } else if !its.is_empty() {
                writer.constant(&mut graph, j1, e, v, Some(&its))?;
            }
        }
        writer.constant(&mut graph, j1, e, total, None)?;
    }

    let mut statements = std::mem::take(&mut writer.statements);
    let branches = std::mem::take(&mut writer.branches);
    statements.extend(branches.finish(&mut graph, iteration)?);
    let outputs = match start {
        Some(s) => {
            let end = graph.loop_end(s, statements)?;
            hoist_loop_invariants(&mut graph, s, end)?;
            vec![Arg::Node(end)]
        }
        None => statements.into_iter().map(Arg::Node).collect(),
    };
    debug!(
        "{name}: {} rows, {} iterations{}",
        group.jrow_iterations.len(),
        group.iterations.len(),
        if creates_loop { "" } else { " (no loop)" }
    );

    Ok(GroupFunction {
        name,
        loop_id: model.loop_id(),
        group,
        graph,
        outputs,
        row_index,
        locations: writer.locations,
    })
}

/// Computes `λ_k = Σ_loops Σ_it Σ_i py_i ∂g_i / ∂z_k`, the multipliers of
/// the temporaries read by loops
fn temporary_multipliers<T: Base>(
    graph: &mut Graph<T>,
    x: &[Arg<T>],
    offset: usize,
    loops: &[LoopModel<T>],
    nl: &NoLoopModel<T>,
) -> Result<Vec<Arg<T>>, Error> {
    let mut lambda = vec![Arg::Const(T::zero()); nl.temporary_count()];
    if lambda.is_empty() || loops.iter().all(|m| m.temporaries().is_empty()) {
        return Ok(lambda);
    }
    let y = nl.tape().forward_zero(graph, x)?;
    let z = y[nl.orig_dependents().len()..].to_vec();
    let declaration = graph.index_declaration(ITERATION_INDEX_NAME);

    for model in loops.iter().filter(|m| !m.temporaries().is_empty()) {
        let start = graph
            .loop_start(declaration, LoopCount::Fixed(model.iteration_count()))?;
        let iteration = graph.index(start)?;
        let indexed = indexed_independents(graph, model, iteration)?;
        let xl = loop_independents(model, &indexed, x, &z)?;
        let sparsity = model.jacobian_sparsity();

        let mut branches = Branches::default();
        let mut body = vec![];
        let mut written = BTreeSet::new();
        for eq in model.equation_groups() {
            let mut elements = vec![];
            let mut temps = vec![];
            for &i in &eq.equations {
                for &k in model.temporaries() {
                    if let Some(c) = model
                        .temporary_column(k)
                        .filter(|c| sparsity[i].contains(c))
                    {
                        elements.push((i, c));
                        temps.push(k);
                    }
                }
            }
            if elements.is_empty() {
                continue;
            }
            let w = loop_multipliers(graph, model, &eq.equations, offset, iteration)?;
            let jac = model.tape().sparse_jacobian(graph, &xl, &elements)?;

            let mut sums: BTreeMap<usize, Arg<T>> = BTreeMap::new();
            for ((&(i, _), k), d) in elements.iter().zip(temps).zip(jac) {
                let t = graph.mul(w[i], d);
                let s = sums.remove(&k).unwrap_or(Arg::Const(T::zero()));
                let s = graph.add(s, t);
                sums.insert(k, s);
            }
            for (k, s) in sums {
                let dep = graph.loop_indexed_dependent(
                    s,
                    IndexPattern::constant(k),
                    iteration,
                    Accumulate::Add,
                )?;
                if eq.iterations.len() == model.iteration_count() {
                    body.push(dep);
                } else {
                    branches.add(&eq.iterations, dep);
                }
                written.insert(k);
            }
        }
        body.extend(branches.finish(graph, iteration)?);
        if body.is_empty() {
            continue;
        }
        let end = graph.loop_end(start, body)?;
        hoist_loop_invariants(graph, start, end)?;
        for k in written {
            let a = graph.alias(end, k)?;
            lambda[k] = graph.add(lambda[k], a);
        }
    }
    Ok(lambda)
}

fn build_no_loop<T: Base>(
    name: &str,
    domain: usize,
    range: usize,
    elements: &BTreeMap<usize, Vec<usize>>,
    analysis: &HessianAnalysis,
    loops: &[LoopModel<T>],
    nl: &NoLoopModel<T>,
) -> Result<NoLoopRows<T>, Error> {
    let mut graph = Graph::new();
    let (x, tx1, py) = make_inputs(&mut graph, domain, range);

    let mut w = nl
        .orig_dependents()
        .iter()
        .map(|r| py.get(*r).copied().ok_or(Error::UnknownEquation(*r)))
        .collect::<Result<Vec<_>, _>>()?;
    w.extend(temporary_multipliers(&mut graph, &x, domain + 1, loops, nl)?);

    let pairs: Vec<(usize, usize)> = analysis
        .no_loop
        .iter()
        .flat_map(|(j1, cols)| cols.keys().map(move |j2| (*j1, *j2)))
        .collect();
    let values = nl.tape().sparse_hessian(&mut graph, &x, &w, &pairs)?;

    let mut rows: BTreeMap<usize, NoLoopRow<T>> = BTreeMap::new();
    for ((j1, j2), v) in pairs.into_iter().zip(values) {
        let Some(&e) = analysis.no_loop.get(&j1).and_then(|c| c.get(&j2)) else {
            continue;
        };
        let row = rows.entry(j1).or_insert_with(|| NoLoopRow {
            name: naming::no_loop_row_function(name, naming::SPARSE_REVERSE_TWO, j1),
            outputs: vec![
                Arg::Const(T::zero());
                elements.get(&j1).map(Vec::len).unwrap_or_default()
            ],
            locations: vec![],
        });
        if let Some(o) = row.outputs.get_mut(e) {
            *o = graph.mul(v, tx1);
            row.locations.push(e);
        }
    }
    for r in rows.values_mut() {
        r.locations.sort_unstable();
    }
    Ok(NoLoopRows { graph, rows })
}
