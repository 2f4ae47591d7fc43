//! Source generation for models with loops
//!
//! [`ModelCodegen`] ties the pieces together: it builds the derivative graphs
//! with the loop assemblers, schedules every function with a [`Handler`] and
//! renders it through an [`Emitter`].  Graphs are independent of each other,
//! so each one becomes a job in a [`JobPool`].
use crate::{
    emit::Emitter,
    graph::{Arg, Base, Graph, Node},
    handler::Handler,
    jobs::{Job, JobPool},
    loops::{
        jacobian::SparseJacobian, reverse2::ReverseTwo, LoopModel, NoLoopModel,
    },
    naming, Error,
};

use log::info;
use std::collections::{BTreeMap, BTreeSet};

/// Outputs of one generated function
#[derive(Clone, Debug)]
pub struct FunctionOutputs<T> {
    pub name: String,
    pub outputs: Vec<Arg<T>>,
    /// Index declarations passed in as arguments
    pub index_arguments: Vec<Node>,
}

/// A graph and the functions to generate from it
#[derive(Debug)]
pub struct FunctionBatch<T> {
    pub graph: Graph<T>,
    pub functions: Vec<FunctionOutputs<T>>,
}

/// Rendered functions of one batch
#[derive(Clone, Debug, Default)]
pub struct RenderedBatch {
    pub functions: Vec<(String, String)>,
    pub atomic_functions: Vec<String>,
}

impl<T: Base> FunctionBatch<T> {
    /// Schedules and renders every function of the batch
    ///
    /// The functions share one [`Handler`], so their atomic function list is
    /// shared as well.
    pub fn render<E: Emitter<T> + ?Sized>(
        self,
        emitter: &mut E,
        reuse_ids: bool,
    ) -> Result<RenderedBatch, Error> {
        let mut handler = Handler::new(self.graph);
        handler.set_reuse_ids(reuse_ids);
        let mut out = RenderedBatch::default();
        for f in &self.functions {
            let schedule = handler.generate(
                &f.outputs,
                &f.index_arguments,
                &*emitter,
                &mut out.atomic_functions,
            )?;
            let src = emitter.emit(&f.name, &handler, &schedule)?;
            out.functions.push((f.name.clone(), src));
        }
        Ok(out)
    }
}

/// Generation settings
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Settings {
    /// Model name, used as the prefix of every function name
    pub name: String,
    /// Recycle temporary variable and array ids
    pub reuse_ids: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name: "model".to_owned(),
            reuse_ids: true,
        }
    }
}

/// Generated source text
#[derive(Clone, Debug, Default)]
pub struct Sources {
    /// Function name → source
    pub functions: BTreeMap<String, String>,
    /// Atomic functions used by any generated function, in first-use order
    pub atomic_functions: Vec<String>,
}

/// Generates derivative sources for a model made of loops plus equations
/// outside of loops
pub struct ModelCodegen<T> {
    settings: Settings,
    domain: usize,
    range: usize,
    loops: Vec<LoopModel<T>>,
    no_loop: Option<NoLoopModel<T>>,
    jobs: JobPool,
}

impl<T: Base> ModelCodegen<T> {
    /// Builds a generator for a model with `domain` independents and `range`
    /// equations
    pub fn new(
        settings: Settings,
        domain: usize,
        range: usize,
        loops: Vec<LoopModel<T>>,
        no_loop: Option<NoLoopModel<T>>,
    ) -> Result<Self, Error> {
        let mut seen = BTreeSet::new();
        for model in &loops {
            if !seen.insert(model.loop_id()) {
                return Err(Error::InvalidLoopModel(format!(
                    "loop id {} is used twice",
                    model.loop_id()
                )));
            }
            if let Some(r) = model.rows().find(|r| *r >= range) {
                return Err(Error::UnknownEquation(r));
            }
        }
        if let Some(r) = no_loop
            .iter()
            .flat_map(|nl| nl.orig_dependents())
            .find(|r| **r >= range)
        {
            return Err(Error::UnknownEquation(*r));
        }
        Ok(Self {
            settings,
            domain,
            range,
            loops,
            no_loop,
            jobs: JobPool::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn jobs(&self) -> &JobPool {
        &self.jobs
    }

    pub fn jobs_mut(&mut self) -> &mut JobPool {
        &mut self.jobs
    }

    /// Replaces the job pool, e.g. to use a dedicated thread pool
    pub fn set_jobs(&mut self, jobs: JobPool) {
        self.jobs = jobs;
    }

    pub fn domain(&self) -> usize {
        self.domain
    }

    pub fn range(&self) -> usize {
        self.range
    }

    /// Builds the graph of the requested Jacobian elements
    pub fn sparse_jacobian(
        &self,
        rows: &[usize],
        cols: &[usize],
    ) -> Result<SparseJacobian<T>, Error> {
        SparseJacobian::build(
            self.domain,
            rows,
            cols,
            &self.loops,
            self.no_loop.as_ref(),
        )
    }

    /// Builds the Hessian row functions for the requested elements
    pub fn sparse_reverse_two(
        &self,
        elements: &BTreeMap<usize, Vec<usize>>,
    ) -> Result<ReverseTwo<T>, Error> {
        ReverseTwo::build(
            &self.settings.name,
            self.domain,
            self.range,
            elements,
            &self.loops,
            self.no_loop.as_ref(),
        )
    }

    /// Generates the sparse Jacobian function and its sparsity function
    pub fn jacobian_sources<E>(
        &mut self,
        rows: &[usize],
        cols: &[usize],
        emitter: &E,
    ) -> Result<Sources, Error>
    where
        E: Emitter<T> + Clone + Send,
    {
        let jac = self.sparse_jacobian(rows, cols)?;
        let name = naming::function(&self.settings.name, naming::SPARSE_JACOBIAN);
        let (graph, outputs) = jac.into_parts();
        let batch = FunctionBatch {
            graph,
            functions: vec![FunctionOutputs {
                name,
                outputs,
                index_arguments: vec![],
            }],
        };
        let mut out = self.render(vec![batch], emitter)?;

        let sparsity =
            naming::sparsity_function(&self.settings.name, naming::SPARSE_JACOBIAN);
        let src = emitter.clone().emit_sparsity(&sparsity, rows, cols);
        out.functions.insert(sparsity, src);
        Ok(out)
    }

    /// Generates the Hessian row functions, the function assembling them
    /// and the sparsity function
    pub fn reverse_two_sources<E>(
        &mut self,
        elements: &BTreeMap<usize, Vec<usize>>,
        emitter: &E,
    ) -> Result<Sources, Error>
    where
        E: Emitter<T> + Clone + Send,
    {
        let r2 = self.sparse_reverse_two(elements)?;
        let (rows, cols) = r2.sparsity();
        let dispatch = r2.dispatch().clone();
        let mut out = self.render(r2.into_batches(), emitter)?;

        let mut e = emitter.clone();
        let name = naming::function(&self.settings.name, naming::SPARSE_REVERSE_TWO);
        let sparsity =
            naming::sparsity_function(&self.settings.name, naming::SPARSE_REVERSE_TWO);
        out.functions
            .insert(sparsity.clone(), e.emit_sparsity(&sparsity, &rows, &cols));
        out.functions.insert(name.clone(), e.emit_dispatch(&name, &dispatch));
        Ok(out)
    }

    fn render<E>(
        &mut self,
        batches: Vec<FunctionBatch<T>>,
        emitter: &E,
    ) -> Result<Sources, Error>
    where
        E: Emitter<T> + Clone + Send,
    {
        let reuse_ids = self.settings.reuse_ids;
        let mut queue = self.jobs.queue();
        for b in batches {
            let name = b
                .functions
                .first()
                .map(|f| f.name.clone())
                .unwrap_or_default();
            let mut e = emitter.clone();
            queue.submit(Job::new(name, move || b.render(&mut e, reuse_ids)));
        }

        let mut out = Sources::default();
        for r in queue.wait() {
            let r = r?;
            for a in r.atomic_functions {
                if !out.atomic_functions.contains(&a) {
                    out.atomic_functions.push(a);
                }
            }
            out.functions.extend(r.functions);
        }
        info!(
            "{}: generated {} functions",
            naming::model_name(&self.settings.name),
            out.functions.len()
        );
        Ok(out)
    }
}
