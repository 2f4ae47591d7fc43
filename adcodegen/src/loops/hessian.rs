//! Analysis and grouping of sparse Hessian rows for models with loops
//!
//! A requested Hessian element `(j1, j2)` receives contributions from every
//! loop whose tape reads `x_j1` and `x_j2`, either directly (through indexed
//! or non-indexed tape columns) or through temporaries `z_k(x)`.  Each
//! contribution is classified into a [`TermKind`] and keyed by the tape
//! columns (or original variables) involved, so that rows sharing the same
//! terms on the same iterations can share one generated function.
use crate::{
    graph::Base,
    loops::{LoopModel, NoLoopModel},
    Error,
};

use enum_map::EnumMap;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// Location of a Hessian element reached by one term at one iteration
///
/// A term key fixes the variables read at each iteration, so at most one
/// requested element is reached per `(key, iteration)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HessianElement {
    /// Compressed location within the row
    pub location: usize,
    /// Hessian row (original independent `j1`)
    pub row: usize,
}

/// Category of a second-order term, by the kind of its two operands
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    enum_map::Enum,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum TermKind {
    /// Keyed by `(tape_j1, tape_j2)`
    IndexedIndexed,
    /// Keyed by `(tape_j1, tape_j2)`
    IndexedNonIndexed,
    /// Keyed by `(tape_j1, j2)`
    IndexedTemporary,
    /// Keyed by `(tape_j1, tape_j2)`
    NonIndexedIndexed,
    /// Keyed by `(j1, tape_j2)`
    TemporaryIndexed,
    /// Keyed by `(j1, j2)`; written to a constant location
    NonIndexedNonIndexed,
}

impl TermKind {
    /// Checks whether terms of this kind are written to per-iteration
    /// locations
    pub fn is_indexed(&self) -> bool {
        *self != TermKind::NonIndexedNonIndexed
    }
}

/// The set of terms contributing to a Hessian row (or group of rows)
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct TermContrib {
    pub indexed_indexed: BTreeSet<(usize, usize)>,
    pub indexed_non_indexed: BTreeSet<(usize, usize)>,
    pub indexed_temporary: BTreeSet<(usize, usize)>,
    pub non_indexed_indexed: BTreeSet<(usize, usize)>,
    pub non_indexed_non_indexed: BTreeSet<(usize, usize)>,
    pub temporary_indexed: BTreeSet<(usize, usize)>,
}

impl TermContrib {
    pub fn terms(&self, kind: TermKind) -> &BTreeSet<(usize, usize)> {
        match kind {
            TermKind::IndexedIndexed => &self.indexed_indexed,
            TermKind::IndexedNonIndexed => &self.indexed_non_indexed,
            TermKind::IndexedTemporary => &self.indexed_temporary,
            TermKind::NonIndexedIndexed => &self.non_indexed_indexed,
            TermKind::TemporaryIndexed => &self.temporary_indexed,
            TermKind::NonIndexedNonIndexed => &self.non_indexed_non_indexed,
        }
    }

    pub fn terms_mut(&mut self, kind: TermKind) -> &mut BTreeSet<(usize, usize)> {
        match kind {
            TermKind::IndexedIndexed => &mut self.indexed_indexed,
            TermKind::IndexedNonIndexed => &mut self.indexed_non_indexed,
            TermKind::IndexedTemporary => &mut self.indexed_temporary,
            TermKind::NonIndexedIndexed => &mut self.non_indexed_indexed,
            TermKind::TemporaryIndexed => &mut self.temporary_indexed,
            TermKind::NonIndexedNonIndexed => &mut self.non_indexed_non_indexed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of terms
    pub fn len(&self) -> usize {
        use strum::IntoEnumIterator;
        TermKind::iter().map(|k| self.terms(k).len()).sum()
    }
}

/// Hessian rows that share terms on the same iterations
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HessianRowGroup {
    pub contrib: TermContrib,
    /// Iterations required by each row
    pub jrow_iterations: BTreeMap<usize, BTreeSet<usize>>,
    /// Union of all required iterations
    pub iterations: BTreeSet<usize>,
}

/// Terms of one equation group of a loop
#[derive(Clone, Debug, Default)]
pub struct EquationGroupTerms {
    /// Per-iteration elements of indexed terms, by kind and key
    pub positions:
        EnumMap<TermKind, BTreeMap<(usize, usize), Vec<Option<HessianElement>>>>,
    /// Temporaries mediating `IndexedTemporary` and `TemporaryIndexed` keys
    pub temporaries: EnumMap<TermKind, BTreeMap<(usize, usize), BTreeSet<usize>>>,

    /// `(j1, j2)` pairs reached through two non-indexed columns
    pub non_indexed: BTreeSet<(usize, usize)>,
    /// `(j1, j2)` → temporaries `k` with `z_k(x_j2)`, `j1` non-indexed
    pub non_indexed_temporary: BTreeMap<(usize, usize), BTreeSet<usize>>,
    /// `(j1, j2)` → temporaries `k` with `z_k(x_j1)`, `j2` non-indexed
    pub temporary_non_indexed: BTreeMap<(usize, usize), BTreeSet<usize>>,
    /// `(j1, j2)` → `k1` → `k2`, with `z_k1(x_j1)` and `z_k2(x_j2)`
    pub temporary_temporary: BTreeMap<(usize, usize), BTreeMap<usize, BTreeSet<usize>>>,

    /// Tape Hessian elements `(tape_j1, tape_j2)` read by the terms
    pub evals: BTreeSet<(usize, usize)>,
}

impl EquationGroupTerms {
    fn hit(
        &mut self,
        kind: TermKind,
        key: (usize, usize),
        iterations: usize,
        it: usize,
        element: (usize, usize, usize),
    ) -> Result<(), Error> {
        let (row, col, location) = element;
        let slot = &mut self.positions[kind]
            .entry(key)
            .or_insert_with(|| vec![None; iterations])[it];
        if let Some(p) = slot {
            if p.row != row || p.location != location {
                return Err(Error::RepeatedElement { row, col });
            }
        }
        *slot = Some(HessianElement { location, row });
        Ok(())
    }
}

/// Hessian terms of one loop
#[derive(Clone, Debug, Default)]
pub struct LoopHessian {
    /// Terms per equation group, in the loop's group order
    pub groups: Vec<EquationGroupTerms>,
    /// `(j1, j2)` → location of non-indexed × non-indexed terms
    pub non_indexed_positions: BTreeMap<(usize, usize), usize>,
    /// `(k, j)` pairs of `dz_k / dx_j` read by the terms
    pub temporary_jacobian: BTreeSet<(usize, usize)>,
}

/// Result of [`analyse_sparse_hessian_with_loops`]
#[derive(Clone, Debug, Default)]
pub struct HessianAnalysis {
    /// One entry per loop model, in order
    pub loops: Vec<LoopHessian>,
    /// `j1` → `j2` → location, evaluated outside of loops
    ///
    /// This covers the equations outside of loops and the curvature of the
    /// temporaries read by loops.
    pub no_loop: BTreeMap<usize, BTreeMap<usize, usize>>,
}

/// Temporaries of a loop that depend on each original independent, with
/// their tape columns
fn temporaries_by_independent<T: Base>(
    model: &LoopModel<T>,
    no_loop: Option<&NoLoopModel<T>>,
) -> Result<BTreeMap<usize, Vec<(usize, usize)>>, Error> {
    let mut out: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
    if model.temporaries().is_empty() {
        return Ok(out);
    }
    let nl = no_loop.ok_or(Error::MissingTemporaries(model.loop_id()))?;
    for &k in model.temporaries() {
        let Some(c) = model.temporary_column(k) else {
            continue;
        };
        let row = nl.temporary_row(k);
        for &j in nl.jacobian_sparsity().get(row).into_iter().flatten() {
            out.entry(j).or_default().push((k, c));
        }
    }
    Ok(out)
}

/// Classifies the terms of a requested sparse Hessian
///
/// `elements` maps each Hessian row `j1` to its requested columns; an
/// element's location is its position within the row.
pub fn analyse_sparse_hessian_with_loops<T: Base>(
    elements: &BTreeMap<usize, Vec<usize>>,
    loops: &[LoopModel<T>],
    no_loop: Option<&NoLoopModel<T>>,
) -> Result<HessianAnalysis, Error> {
    let mut out = HessianAnalysis::default();

    struct LoopData<'a, T> {
        model: &'a LoopModel<T>,
        sparsity: Vec<Vec<BTreeSet<usize>>>,
        temporaries: BTreeMap<usize, Vec<(usize, usize)>>,
    }
    let mut data = vec![];
    for model in loops {
        let sparsity = model
            .equation_groups()
            .iter()
            .map(|g| model.tape().hessian_sparsity(&g.equations))
            .collect();
        data.push(LoopData {
            model,
            sparsity,
            temporaries: temporaries_by_independent(model, no_loop)?,
        });
        out.loops.push(LoopHessian {
            groups: vec![EquationGroupTerms::default(); model.equation_groups().len()],
            ..LoopHessian::default()
        });
    }

    // Curvature outside of loops: original equations, then the temporaries
    // read by loops
    let no_loop_sparsity = no_loop.map(|nl| {
        let orig = (0..nl.orig_dependents().len()).collect();
        let used: BTreeSet<usize> = loops
            .iter()
            .flat_map(|m| m.temporaries().iter().map(|k| nl.temporary_row(*k)))
            .collect();
        (nl.tape().hessian_sparsity(&orig), nl.tape().hessian_sparsity(&used))
    });

    for (&j1, cols) in elements {
        let mut seen = BTreeSet::new();
        for (e, &j2) in cols.iter().enumerate() {
            if !seen.insert(j2) {
                return Err(Error::RepeatedElement { row: j1, col: j2 });
            }

            for (d, lh) in data.iter().zip(out.loops.iter_mut()) {
                analyse_loop_element(d.model, &d.sparsity, &d.temporaries, lh, (j1, j2, e))?;
            }

            if let Some((orig, temps)) = &no_loop_sparsity {
                let hit = |s: &Vec<BTreeSet<usize>>| s.get(j1).is_some_and(|s| s.contains(&j2));
                if hit(orig) || hit(temps) {
                    out.no_loop.entry(j1).or_default().insert(j2, e);
                }
            }
        }
    }

    for (d, lh) in data.iter().zip(&out.loops) {
        debug!(
            "loop {}: {} non-indexed hessian elements, {} temporary derivatives",
            d.model.loop_id(),
            lh.non_indexed_positions.len(),
            lh.temporary_jacobian.len()
        );
    }
    Ok(out)
}

fn analyse_loop_element<T: Base>(
    model: &LoopModel<T>,
    sparsity: &[Vec<BTreeSet<usize>>],
    temporaries: &BTreeMap<usize, Vec<(usize, usize)>>,
    lh: &mut LoopHessian,
    element: (usize, usize, usize),
) -> Result<(), Error> {
    let (j1, j2, e) = element;
    let n1 = model.non_indexed_column(j1);
    let n2 = model.non_indexed_column(j2);
    let t1 = temporaries.get(&j1).map(Vec::as_slice).unwrap_or_default();
    let t2 = temporaries.get(&j2).map(Vec::as_slice).unwrap_or_default();
    let count = model.iteration_count();
    let hit = (j1, j2, e);

    for (g, eq) in model.equation_groups().iter().enumerate() {
        let s = &sparsity[g];
        let linked = |a: usize, b: usize| s.get(a).is_some_and(|s| s.contains(&b));
        let terms = &mut lh.groups[g];

        for &it in &eq.iterations {
            let c1 = model.indexed_columns(it, j1).cloned().unwrap_or_default();
            let c2 = model.indexed_columns(it, j2).cloned().unwrap_or_default();

            for &a in &c1 {
                for &b in c2.iter().filter(|b| linked(a, **b)) {
                    terms.evals.insert((a, b));
                    terms.hit(TermKind::IndexedIndexed, (a, b), count, it, hit)?;
                }
                if let Some(b) = n2.filter(|b| linked(a, *b)) {
                    terms.evals.insert((a, b));
                    terms.hit(TermKind::IndexedNonIndexed, (a, b), count, it, hit)?;
                }
                let ks: BTreeSet<usize> = t2
                    .iter()
                    .filter(|(_, c)| linked(a, *c))
                    .map(|(k, c)| {
                        terms.evals.insert((a, *c));
                        lh.temporary_jacobian.insert((*k, j2));
                        *k
                    })
                    .collect();
                if !ks.is_empty() {
                    terms.hit(TermKind::IndexedTemporary, (a, j2), count, it, hit)?;
                    terms.temporaries[TermKind::IndexedTemporary]
                        .entry((a, j2))
                        .or_default()
                        .extend(ks);
                }
            }

            for &b in &c2 {
                if let Some(a) = n1.filter(|a| linked(*a, b)) {
                    terms.evals.insert((a, b));
                    terms.hit(TermKind::NonIndexedIndexed, (a, b), count, it, hit)?;
                }
                let ks: BTreeSet<usize> = t1
                    .iter()
                    .filter(|(_, c)| linked(*c, b))
                    .map(|(k, c)| {
                        terms.evals.insert((*c, b));
                        lh.temporary_jacobian.insert((*k, j1));
                        *k
                    })
                    .collect();
                if !ks.is_empty() {
                    terms.hit(TermKind::TemporaryIndexed, (j1, b), count, it, hit)?;
                    terms.temporaries[TermKind::TemporaryIndexed]
                        .entry((j1, b))
                        .or_default()
                        .extend(ks);
                }
            }
        }

        // Non-indexed family, accumulated over iterations into one location
        let mut found = false;
        if let (Some(a), Some(b)) = (n1, n2) {
            if linked(a, b) {
                terms.evals.insert((a, b));
                terms.non_indexed.insert((j1, j2));
                found = true;
            }
        }
        if let Some(a) = n1 {
            let ks: BTreeSet<usize> = t2
                .iter()
                .filter(|(_, c)| linked(a, *c))
                .map(|(k, c)| {
                    terms.evals.insert((a, *c));
                    lh.temporary_jacobian.insert((*k, j2));
                    *k
                })
                .collect();
            if !ks.is_empty() {
                terms.non_indexed_temporary.insert((j1, j2), ks);
                found = true;
            }
        }
        if let Some(b) = n2 {
            let ks: BTreeSet<usize> = t1
                .iter()
                .filter(|(_, c)| linked(*c, b))
                .map(|(k, c)| {
                    terms.evals.insert((*c, b));
                    lh.temporary_jacobian.insert((*k, j1));
                    *k
                })
                .collect();
            if !ks.is_empty() {
                terms.temporary_non_indexed.insert((j1, j2), ks);
                found = true;
            }
        }
        let mut tt: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for &(k1, c1) in t1 {
            for &(k2, c2) in t2.iter().filter(|(_, c2)| linked(c1, *c2)) {
                terms.evals.insert((c1, c2));
                lh.temporary_jacobian.insert((k1, j1));
                lh.temporary_jacobian.insert((k2, j2));
                tt.entry(k1).or_default().insert(k2);
            }
        }
        if !tt.is_empty() {
            terms.temporary_temporary.insert((j1, j2), tt);
            found = true;
        }
        if found {
            lh.non_indexed_positions.insert((j1, j2), e);
        }
    }
    Ok(())
}

/// Groups the rows of a loop's Hessian terms
///
/// Rows are first grouped by the exact set of terms they receive; each group
/// is then split so that, within a final group, every term applies to the
/// same iterations for a given row.
pub fn generate_hessian_row_groups(
    info: &LoopHessian,
    iteration_count: usize,
) -> Vec<HessianRowGroup> {
    // kind → key → row → iterations
    let mut term_rows: EnumMap<
        TermKind,
        BTreeMap<(usize, usize), BTreeMap<usize, BTreeSet<usize>>>,
    > = EnumMap::default();
    let mut rows: BTreeMap<usize, TermContrib> = BTreeMap::new();

    for terms in &info.groups {
        for (kind, positions) in &terms.positions {
            for (key, elements) in positions {
                let present = elements
                    .iter()
                    .enumerate()
                    .filter_map(|(it, e)| e.map(|e| (it, e)));
                for (it, el) in present {
                    rows.entry(el.row).or_default().terms_mut(kind).insert(*key);
                    term_rows[kind]
                        .entry(*key)
                        .or_default()
                        .entry(el.row)
                        .or_default()
                        .insert(it);
                }
            }
        }
    }
    for &(j1, j2) in info.non_indexed_positions.keys() {
        rows.entry(j1)
            .or_default()
            .terms_mut(TermKind::NonIndexedNonIndexed)
            .insert((j1, j2));
    }

    let mut contrib_rows: BTreeMap<TermContrib, BTreeSet<usize>> = BTreeMap::new();
    for (jrow, c) in rows {
        contrib_rows.entry(c).or_default().insert(jrow);
    }

    let all: BTreeSet<usize> = (0..iteration_count).collect();
    let mut groups: Vec<HessianRowGroup> = vec![];
    for (c, jrows) in &contrib_rows {
        let mut contribs: BTreeMap<(usize, BTreeSet<usize>), TermContrib> =
            BTreeMap::new();
        for kind in <TermKind as strum::IntoEnumIterator>::iter() {
            for key in c.terms(kind) {
                if !kind.is_indexed() {
                    contribs
                        .entry((key.0, all.clone()))
                        .or_default()
                        .terms_mut(kind)
                        .insert(*key);
                    continue;
                }
                let by_row = term_rows[kind].get(key).into_iter().flatten();
                for (jrow, its) in by_row.filter(|(r, _)| jrows.contains(r)) {
                    contribs
                        .entry((*jrow, its.clone()))
                        .or_default()
                        .terms_mut(kind)
                        .insert(*key);
                }
            }
        }

        let mut subgroups: BTreeMap<TermContrib, usize> = BTreeMap::new();
        for ((jrow, its), hc) in contribs {
            match subgroups.get(&hc) {
                Some(&i) => {
                    let g = &mut groups[i];
                    g.iterations.extend(its.iter().copied());
                    g.jrow_iterations.insert(jrow, its);
                }
                None => {
                    subgroups.insert(hc.clone(), groups.len());
                    groups.push(HessianRowGroup {
                        contrib: hc,
                        jrow_iterations: [(jrow, its.clone())].into(),
                        iterations: its,
                    });
                }
            }
        }
    }
    groups
}
