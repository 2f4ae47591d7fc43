//! Evaluation order and storage assignment for a recorded graph
//!
//! The [`Handler`] owns a [`Graph`] and, for each generated function, walks
//! the nodes reachable from the function outputs to decide
//! - which nodes are evaluated into their own variable (and in what order),
//! - which nodes are inlined into their consumers,
//! - which temporary, array or atomic id each stored value gets.
//!
//! With id reuse enabled, a liveness pass then recycles scalar ids (LIFO) and
//! array slots (best fit, see [`ArrayAllocator`]).
//!
//! All traversals use explicit work stacks, so arbitrarily deep graphs are
//! handled without recursion.
mod alloc;

pub use alloc::ArrayAllocator;

use crate::{
    emit::Emitter,
    graph::{indexed::IndexVec, Arg, Base, Graph, Node, Op, Storage},
    Error,
};

use log::debug;
use std::collections::{BTreeSet, HashSet};

/// Per-node scheduling state, cleared before each generation call
#[derive(Copy, Clone, Debug, Default)]
struct NodeState {
    /// Assigned id (0 means unassigned); its space depends on the node's
    /// [`Storage`]
    id: usize,
    /// Number of references from reachable consumers (outputs included)
    total_use: usize,
    /// Working counter, reused by each pass
    usage: usize,
    /// 1-based position in the evaluation order; 0 means unscheduled
    order: usize,
    /// Evaluation order of the last consumer; 0 means "never released"
    last_use: usize,
}

/// Result of scheduling one function
#[derive(Clone, Debug)]
pub struct Schedule<T> {
    /// Nodes evaluated into variables (or executed as statements), in order
    pub order: Vec<Node>,
    /// Function outputs
    pub outputs: Vec<Arg<T>>,
    /// Index declarations passed in as function arguments
    pub index_arguments: Vec<Node>,
    /// First temporary id (independents use `1..min_temporary_id`)
    pub min_temporary_id: usize,
    /// Number of scalar temporaries
    pub temporary_count: usize,
    /// Number of array slots
    pub array_size: usize,
    /// Number of atomic result slots
    pub atomic_count: usize,
    /// Atomic functions used, in first-use order
    pub atomic_functions: Vec<String>,
    /// Whether ids were recycled
    pub reuse_ids: bool,
}

/// Schedules graphs into straight-line (or looped) code and assigns ids
pub struct Handler<T = f64> {
    graph: Graph<T>,
    state: IndexVec<NodeState, Node>,

    id_count: usize,
    id_array_count: usize,
    id_atomic_count: usize,
    min_temporary_id: usize,

    order: Vec<Node>,
    atomic_order: Vec<String>,
    atomic_seen: HashSet<String>,

    reuse_ids: bool,
}

static_assertions::assert_impl_all!(Handler<f64>: Send);

impl<T: Base> Default for Handler<T> {
    fn default() -> Self {
        Self::new(Graph::new())
    }
}

impl<T: Base> Handler<T> {
    /// Builds a handler around an existing graph
    pub fn new(graph: Graph<T>) -> Self {
        Self {
            graph,
            state: IndexVec::default(),
            id_count: 1,
            id_array_count: 1,
            id_atomic_count: 1,
            min_temporary_id: 1,
            order: vec![],
            atomic_order: vec![],
            atomic_seen: HashSet::new(),
            reuse_ids: true,
        }
    }

    /// Borrows the graph
    pub fn graph(&self) -> &Graph<T> {
        &self.graph
    }

    /// Mutably borrows the graph, e.g. to add more functions to it
    pub fn graph_mut(&mut self) -> &mut Graph<T> {
        &mut self.graph
    }

    /// Unwraps the handler, returning its graph
    pub fn into_graph(self) -> Graph<T> {
        self.graph
    }

    /// Clears every node and all scheduling state
    pub fn reset(&mut self) {
        self.graph.clear();
        self.state.clear();
        self.reset_counters();
        self.atomic_order.clear();
        self.atomic_seen.clear();
    }

    fn reset_counters(&mut self) {
        self.state.resize(self.graph.len(), NodeState::default());
        self.state.fill(NodeState::default());
        self.id_count = 1;
        self.id_array_count = 1;
        self.id_atomic_count = 1;
        self.min_temporary_id = 1;
        self.order.clear();
    }

    /// Enables or disables id recycling (enabled by default)
    pub fn set_reuse_ids(&mut self, reuse: bool) {
        self.reuse_ids = reuse;
    }

    pub fn reuse_ids(&self) -> bool {
        self.reuse_ids
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Schedules the given outputs, using `emitter` as the inlining policy
    ///
    /// `index_arguments` are index declarations supplied by the caller of the
    /// generated function (e.g. the Hessian row), and `atomic_functions` is
    /// the ordered list of atomic names shared between calls: names used here
    /// are appended to it if new.
    pub fn generate<E: Emitter<T> + ?Sized>(
        &mut self,
        outputs: &[Arg<T>],
        index_arguments: &[Node],
        emitter: &E,
        atomic_functions: &mut Vec<String>,
    ) -> Result<Schedule<T>, Error> {
        let start = std::time::Instant::now();
        for o in outputs.iter().filter_map(|o| o.node()) {
            self.graph.check_node(o)?;
        }
        for d in index_arguments {
            self.graph.check_node(*d)?;
        }

        self.reset_counters();
        self.atomic_order = atomic_functions.clone();
        self.atomic_seen = atomic_functions.iter().cloned().collect();

        self.assign_independent_ids();
        self.mark_used(outputs)?;
        self.compute_evaluation_order(outputs, emitter)?;
        if self.reuse_ids {
            self.reduce_temporary_variables(outputs)?;
        }

        atomic_functions.clone_from(&self.atomic_order);
        let out = Schedule {
            order: self.order.clone(),
            outputs: outputs.to_vec(),
            index_arguments: index_arguments.to_vec(),
            min_temporary_id: self.min_temporary_id,
            temporary_count: self.temporary_variable_count(),
            array_size: self.temporary_array_size(),
            atomic_count: self.id_atomic_count - 1,
            atomic_functions: self.atomic_order.clone(),
            reuse_ids: self.reuse_ids,
        };
        debug!(
            "scheduled {} nodes ({} temporaries, {} array slots) in {:?}",
            out.order.len(),
            out.temporary_count,
            out.array_size,
            start.elapsed()
        );
        Ok(out)
    }

    /// Gives independents the ids `1..=k`, in creation order
    pub fn assign_independent_ids(&mut self) {
        self.state.resize(self.graph.len(), NodeState::default());
        for &n in self.graph.independent_nodes() {
            self.state[n].id = self.id_count;
            self.id_count += 1;
        }
        self.min_temporary_id = self.id_count;
    }

    /// Returns the position of an independent variable
    pub fn independent_index(&self, node: Node) -> Result<usize, Error> {
        self.graph.independent_index(node)
    }

    /// Counts references to every node reachable from the outputs
    ///
    /// Each node's arguments are visited once, on the first reference.
    pub fn mark_used(&mut self, outputs: &[Arg<T>]) -> Result<(), Error> {
        self.state.resize(self.graph.len(), NodeState::default());
        let mut todo: Vec<Node> =
            outputs.iter().rev().filter_map(|o| o.node()).collect();
        while let Some(n) = todo.pop() {
            self.graph.check_node(n)?;
            let s = &mut self.state[n];
            s.total_use += 1;
            if s.total_use == 1 {
                todo.extend(self.graph.arg_nodes(n).rev().map(|(_, a)| a));
            }
        }
        Ok(())
    }

    fn is_independent(&self, n: Node) -> bool {
        self.graph.op(n) == Op::Independent
    }

    /// Checks whether `n` holds a scalar temporary id
    pub fn is_temporary(&self, n: Node) -> bool {
        self.graph.op(n).storage() == Storage::Scalar
            && self.state[n].id >= self.min_temporary_id
    }

    /// Checks whether `n` holds an array block
    pub fn is_temporary_array(&self, n: Node) -> bool {
        self.graph.op(n).storage() == Storage::Array && self.state[n].id > 0
    }

    /// Assigns the next id from the counter matching the node's storage
    pub fn allocate(&mut self, n: Node) {
        let id = match self.graph.op(n).storage() {
            Storage::None => return,
            Storage::Scalar => {
                self.id_count += 1;
                self.id_count - 1
            }
            Storage::Array => {
                let id = self.id_array_count;
                self.id_array_count += self.graph.args(n).len();
                id
            }
            Storage::Atomic => {
                self.id_atomic_count += 1;
                self.id_atomic_count - 1
            }
        };
        self.state[n].id = id;
    }

    fn enqueue(&mut self, n: Node) {
        self.order.push(n);
        self.state[n].order = self.order.len();
    }

    /// Builds the evaluation order for the outputs
    ///
    /// Post-order traversal: a node is queued after all of its arguments.  An
    /// argument is queued (and given an id) the first time it is consumed if
    /// the emitter wants a variable for it, if the consuming operation needs
    /// a variable operand, or if it is a statement; otherwise it is inlined
    /// into its consumer, and inherits the consumer's evaluation order.
    pub fn compute_evaluation_order<E: Emitter<T> + ?Sized>(
        &mut self,
        outputs: &[Arg<T>],
        emitter: &E,
    ) -> Result<(), Error> {
        enum Frame {
            Enter(Node),
            Exit(Node),
        }

        let mut expanded: IndexVec<bool, Node> =
            vec![false; self.graph.len()].into();
        for out in outputs.iter().filter_map(|o| o.node()) {
            if self.state[out].usage == 0 {
                let mut todo = vec![Frame::Enter(out)];
                while let Some(f) = todo.pop() {
                    match f {
                        Frame::Enter(n) => {
                            if self.state[n].usage > 0 || expanded[n] {
                                continue;
                            }
                            expanded[n] = true;
                            todo.push(Frame::Exit(n));
                            for (_, a) in self.graph.arg_nodes(n).rev() {
                                todo.push(Frame::Enter(a));
                            }
                        }
                        Frame::Exit(n) => self.exit_node(n, emitter)?,
                    }
                }
                if !self.is_independent(out) && self.state[out].usage == 0 {
                    self.enqueue(out);
                    if self.state[out].id == 0 {
                        self.allocate(out);
                    }
                    self.propagate_order(out);
                }
            }
            self.state[out].usage += 1;
        }
        Ok(())
    }

    /// Handles a node once all of its arguments have been visited
    fn exit_node<E: Emitter<T> + ?Sized>(
        &mut self,
        n: Node,
        emitter: &E,
    ) -> Result<(), Error> {
        let op = self.graph.op(n);
        if let Op::Atomic(..) = op {
            let id = self.graph.info(n)[0];
            let name = self.graph.atomic_name(id)?.to_owned();
            if self.atomic_seen.insert(name.clone()) {
                self.atomic_order.push(name);
            }
        }

        let args: Vec<(usize, Node)> = self.graph.arg_nodes(n).collect();
        for (i, a) in args {
            if !self.is_independent(a) && self.state[a].usage == 0 {
                let a_op = self.graph.op(a);
                if a_op.is_statement()
                    || emitter.creates_new_variable(
                        &self.graph,
                        a,
                        self.state[a].total_use,
                    )
                    || emitter.requires_variable_argument(&op, i)
                {
                    self.enqueue(a);
                    if self.state[a].id == 0 {
                        self.allocate(a);
                    }
                    self.propagate_order(a);
                }
            }
            self.state[a].usage += 1;
        }
        Ok(())
    }

    /// Gives inlined arguments of a newly queued node its evaluation order
    fn propagate_order(&mut self, n: Node) {
        let order = self.state[n].order;
        let mut todo = vec![n];
        while let Some(n) = todo.pop() {
            for (_, a) in self.graph.arg_nodes(n) {
                if self.state[a].order == 0 && !self.is_independent(a) {
                    self.state[a].order = order;
                    todo.push(a);
                }
            }
        }
    }

    /// Recomputes last uses and recycles ids accordingly
    ///
    /// Releases scheduled at a position happen before that position's own
    /// allocation, so a value may take over the id of an operand it consumes.
    /// Values defined before a loop and read inside it stay live until the
    /// loop end; outputs are never released.
    pub fn reduce_temporary_variables(
        &mut self,
        outputs: &[Arg<T>],
    ) -> Result<(), Error> {
        for s in self.state.iter_mut() {
            s.usage = 0;
            s.last_use = 0;
        }

        // Last-use walk, visiting each reachable node once
        let roots: Vec<Node> = outputs.iter().filter_map(|o| o.node()).collect();
        let mut todo = roots.clone();
        for r in &roots {
            self.state[*r].usage += 1;
        }
        while let Some(n) = todo.pop() {
            let order = self.state[n].order;
            let args: Vec<Node> =
                self.graph.arg_nodes(n).map(|(_, a)| a).collect();
            for a in args {
                let s = &mut self.state[a];
                if s.usage == 0 {
                    todo.push(a);
                }
                s.usage += 1;
                s.last_use = s.last_use.max(order);
            }
        }

        self.extend_loop_lifetimes();

        let outputs: HashSet<Node> = roots.into_iter().collect();
        let mut release: Vec<Vec<Node>> = vec![vec![]; self.order.len()];
        for &n in &self.order {
            let last = self.state[n].last_use;
            if last > 0
                && !outputs.contains(&n)
                && (self.is_temporary(n) || self.is_temporary_array(n))
            {
                release[last - 1].push(n);
            }
        }

        self.id_count = self.min_temporary_id;
        self.id_array_count = 1;
        let mut spare: Vec<usize> = vec![];
        let mut arrays = ArrayAllocator::new();

        for i in 0..self.order.len() {
            for &r in &release[i] {
                let id = self.state[r].id;
                match self.graph.op(r).storage() {
                    Storage::Scalar => spare.push(id),
                    Storage::Array => {
                        arrays.release(id - 1, self.graph.args(r).len())
                    }
                    _ => (),
                }
            }

            let n = self.order[i];
            match self.graph.op(n).storage() {
                Storage::Scalar if self.is_temporary(n) => {
                    self.state[n].id = match spare.pop() {
                        Some(id) => id,
                        None => {
                            self.id_count += 1;
                            self.id_count - 1
                        }
                    };
                }
                Storage::Array if self.state[n].id > 0 => {
                    let blacklist = self.array_blacklist(n);
                    let len = self.graph.args(n).len();
                    self.state[n].id = arrays.reserve(len, &blacklist) + 1;
                }
                _ => (),
            }
        }
        self.id_array_count = arrays.size() + 1;
        Ok(())
    }

    /// Slots read by an array creation through inlined element accesses
    fn array_blacklist(&self, n: Node) -> BTreeSet<usize> {
        self.graph
            .arg_nodes(n)
            .filter(|(_, a)| {
                self.graph.op(*a) == Op::ArrayElement && !self.is_scheduled(*a)
            })
            .filter_map(|(_, a)| {
                let src = self.graph.args(a)[0].node()?;
                let start = self.state[src].id.checked_sub(1)?;
                (self.graph.op(src) == Op::ArrayCreation)
                    .then(|| start + self.graph.info(a)[0])
            })
            .collect()
    }

    /// Keeps values defined before a loop alive until the loop ends
    fn extend_loop_lifetimes(&mut self) {
        let mut spans = vec![];
        for &end in &self.order {
            if self.graph.op(end) != Op::LoopEnd {
                continue;
            }
            if let Some(start) = self.graph.args(end)[0].node() {
                let (s, e) = (self.state[start].order, self.state[end].order);
                if s > 0 && e > s {
                    spans.push((s, e));
                }
            }
        }
        if spans.is_empty() {
            return;
        }
        for i in 0..self.order.len() {
            let n = self.order[i];
            let st = &mut self.state[n];
            for &(s, e) in &spans {
                if st.order < s && st.last_use >= s && st.last_use < e {
                    st.last_use = e;
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Queries

    /// Number of scalar temporaries used by the last schedule
    pub fn temporary_variable_count(&self) -> usize {
        self.id_count - self.min_temporary_id
    }

    /// Number of array slots used by the last schedule
    pub fn temporary_array_size(&self) -> usize {
        self.id_array_count - 1
    }

    /// Returns the id of a node (0 if none)
    pub fn variable_id(&self, n: Node) -> usize {
        self.state.get(n).map(|s| s.id).unwrap_or(0)
    }

    /// Returns the 1-based evaluation order of a node (0 if unscheduled)
    pub fn evaluation_order(&self, n: Node) -> usize {
        self.state.get(n).map(|s| s.order).unwrap_or(0)
    }

    /// Returns the evaluation order of the last consumer of a node
    pub fn last_usage(&self, n: Node) -> usize {
        self.state.get(n).map(|s| s.last_use).unwrap_or(0)
    }

    /// Returns the number of references to a node
    pub fn total_use_count(&self, n: Node) -> usize {
        self.state.get(n).map(|s| s.total_use).unwrap_or(0)
    }

    /// Checks whether `n` appears in the evaluation order
    pub fn is_scheduled(&self, n: Node) -> bool {
        let o = self.evaluation_order(n);
        o > 0 && self.order.get(o - 1) == Some(&n)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        emit::TextEmitter,
        graph::{AtomicOp, LoopCount, UnaryOpcode},
    };
    use rand::{Rng, SeedableRng};

    fn schedule(
        h: &mut Handler<f64>,
        outputs: &[Arg<f64>],
    ) -> Schedule<f64> {
        h.generate(outputs, &[], &TextEmitter::new(), &mut vec![])
            .unwrap()
    }

    #[test]
    fn reuse_operand_id() {
        // y = x0 * x1 + x0
        let mut g = Graph::<f64>::new();
        let x0 = g.independent();
        let x1 = g.independent();
        let m = g.mul(x0, x1);
        let y = g.add(m, x0);

        let mut h = Handler::new(g);
        let s = schedule(&mut h, &[y]);
        let (m, y) = (m.node().unwrap(), y.node().unwrap());
        assert_eq!(h.variable_id(x0), 1);
        assert_eq!(h.variable_id(x1), 2);
        assert_eq!(h.variable_id(m), 3);
        assert_eq!(h.variable_id(y), 3);
        assert_eq!(s.order, vec![m, y]);
        assert_eq!(s.temporary_count, 1);

        h.set_reuse_ids(false);
        let s = schedule(&mut h, &[y.into()]);
        assert_eq!(h.variable_id(m), 3);
        assert_eq!(h.variable_id(y), 4);
        assert_eq!(s.temporary_count, 2);
    }

    #[test]
    fn outputs_are_never_recycled() {
        let mut g = Graph::<f64>::new();
        let x = g.independent();
        let a = g.unary(UnaryOpcode::Sin, x);
        let b = g.unary(UnaryOpcode::Cos, a);
        let c = g.unary(UnaryOpcode::Exp, b);
        let mut h = Handler::new(g);
        schedule(&mut h, &[a, c]);
        let (a, b, c) = (a.node().unwrap(), b.node().unwrap(), c.node().unwrap());
        assert_ne!(h.variable_id(a), h.variable_id(b));
        assert_ne!(h.variable_id(a), h.variable_id(c));
        // `b` dies when `c` is computed
        assert_eq!(h.variable_id(b), h.variable_id(c));
    }

    #[test]
    fn deep_chain() {
        let mut g = Graph::<f64>::new();
        let x = g.independent();
        let mut v: Arg<f64> = x.into();
        for _ in 0..100_000 {
            v = g.unary(UnaryOpcode::Sin, v);
        }
        let mut h = Handler::new(g);
        let s = schedule(&mut h, &[v]);
        assert_eq!(s.order.len(), 100_000);
        assert_eq!(s.temporary_count, 1);
    }

    #[test]
    fn atomic_names_in_order() {
        let mut g = Graph::<f64>::new();
        g.register_atomic(7, "beta");
        g.register_atomic(3, "alpha");
        let x = g.independent();
        let arr = g.array(vec![x.into()]);
        let a = g.atomic(AtomicOp::Call, 3, vec![arr]).unwrap();
        let b = g.atomic(AtomicOp::Call, 7, vec![arr]).unwrap();
        let ea = g.array_element(a, 0).unwrap();
        let eb = g.array_element(b, 0).unwrap();
        let y = g.add(ea, eb);

        let mut h = Handler::new(g);
        let mut names = vec!["gamma".to_owned(), "beta".to_owned()];
        h.generate(&[y], &[], &TextEmitter::new(), &mut names).unwrap();
        assert_eq!(names, vec!["gamma", "beta", "alpha"]);
        assert_eq!(h.variable_id(a), 1);
        assert_eq!(h.variable_id(b), 2);
    }

    #[test]
    fn unknown_atomic() {
        let mut g = Graph::<f64>::new();
        let x = g.independent();
        let arr = g.array(vec![x.into()]);
        let a = g.atomic(AtomicOp::Call, 1, vec![arr]).unwrap();
        let mut h = Handler::new(g);
        let r = h.generate(&[a.into()], &[], &TextEmitter::new(), &mut vec![]);
        assert_eq!(r.err(), Some(Error::UnknownAtomic(1)));
    }

    #[test]
    fn array_slots_are_recycled() {
        let mut g = Graph::<f64>::new();
        let x = g.independent();
        let a = g.array(vec![x.into(), x.into(), x.into()]);
        let e = g.array_element(a, 1).unwrap();
        let b = g.array(vec![e.into()]);
        let f = g.array_element(b, 0).unwrap();
        let c = g.array(vec![f.into(), f.into()]);
        let out = g.array_element(c, 1).unwrap();

        let mut h = Handler::new(g);
        let s = schedule(&mut h, &[out.into()]);
        assert_eq!(h.variable_id(a), 1);
        assert_eq!(h.variable_id(b), 1);
        assert_eq!(h.variable_id(c), 1);
        assert_eq!(s.array_size, 3);
    }

    #[test]
    fn inlined_elements_block_their_slots() {
        let mut g = Graph::<f64>::new();
        let x = g.independent();
        let a = g.array(vec![x.into(), x.into(), x.into()]);
        let e = g.array_element(a, 1).unwrap();
        let b = g.array(vec![e.into()]);
        let f = g.array_element(b, 0).unwrap();
        let c = g.array(vec![f.into(), f.into()]);
        let out = g.array_element(c, 1).unwrap();

        let mut h = Handler::new(g);
        let emitter = TextEmitter::new().with_inlining(true);
        let s = h.generate(&[out.into()], &[], &emitter, &mut vec![]).unwrap();
        assert!(!h.is_scheduled(e));
        assert!(h.is_scheduled(f));
        assert_eq!(h.evaluation_order(e), h.evaluation_order(b));

        // `a` is released when `b` is built, but `b` reads `a[1]` directly
        assert_eq!(h.variable_id(a), 1);
        assert_eq!(h.variable_id(b), 4);
        assert_eq!(h.variable_id(c), 1);
        assert_eq!(s.array_size, 4);
    }

    #[test]
    fn loop_invariants_outlive_loop() {
        let mut g = Graph::<f64>::new();
        let x = g.independent();
        let inv = g.unary(UnaryOpcode::Exp, x).node().unwrap();
        let d = g.index_declaration("j");
        let start = g.loop_start(d, LoopCount::Fixed(3)).unwrap();
        g.hoist_into_loop_start(start, [inv]).unwrap();
        let j = g.index(start).unwrap();
        let xi = g
            .loop_indexed_independent(
                crate::pattern::IndexPattern::constant(0),
                j,
            )
            .unwrap();
        let v = g.mul(inv, xi);
        let w = g.unary(UnaryOpcode::Sin, v);
        let dep = g
            .loop_indexed_dependent(
                w,
                crate::pattern::IndexPattern::constant(0),
                j,
                crate::graph::Accumulate::Add,
            )
            .unwrap();
        let end = g.loop_end(start, vec![dep]).unwrap();

        let mut h = Handler::new(g);
        schedule(&mut h, &[end.into()]);
        let (v, w) = (v.node().unwrap(), w.node().unwrap());
        assert!(h.last_usage(inv) >= h.evaluation_order(end));
        assert_ne!(h.variable_id(inv), h.variable_id(v));
        assert_ne!(h.variable_id(inv), h.variable_id(w));
        assert!(h.evaluation_order(start) < h.evaluation_order(dep));
        assert!(h.evaluation_order(dep) < h.evaluation_order(end));
    }

    /// Builds a random DAG over `n` independents
    fn random_graph(seed: u64) -> (Graph<f64>, Vec<Arg<f64>>) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut g = Graph::<f64>::new();
        let mut pool: Vec<Arg<f64>> =
            g.independents(4).into_iter().map(Arg::Node).collect();
        for _ in 0..200 {
            let a = pool[rng.gen_range(0..pool.len())];
            let b = pool[rng.gen_range(0..pool.len())];
            let v = match rng.gen_range(0..3) {
                0 => g.add(a, b),
                1 => g.mul(a, b),
                _ => g.unary(UnaryOpcode::Sin, a),
            };
            pool.push(v);
        }
        let outputs = (0..5).map(|i| pool[pool.len() - 1 - 7 * i]).collect();
        (g, outputs)
    }

    /// Checks topological order, and that no two values that are live at
    /// the same time share a scalar id or an array slot
    fn check_schedule(h: &Handler<f64>, s: &Schedule<f64>) {
        let g = h.graph();
        for &n in &s.order {
            for (_, a) in g.arg_nodes(n) {
                if h.is_scheduled(a) {
                    assert!(
                        h.evaluation_order(a) < h.evaluation_order(n),
                        "{a} is read by {n} before it is evaluated"
                    );
                }
            }
        }

        let end = |n: Node| match h.last_usage(n) {
            0 => usize::MAX,
            l => l,
        };
        let slots = |n: Node| {
            let start = h.variable_id(n) - 1;
            start..start + g.args(n).len()
        };
        for (i, &a) in s.order.iter().enumerate() {
            for &b in &s.order[i + 1..] {
                if end(a) <= h.evaluation_order(b) {
                    continue;
                }
                if h.is_temporary(a) && h.is_temporary(b) {
                    assert_ne!(
                        h.variable_id(a),
                        h.variable_id(b),
                        "ids overlap for {a} and {b}"
                    );
                }
                if h.is_temporary_array(a) && h.is_temporary_array(b) {
                    let (sa, sb) = (slots(a), slots(b));
                    assert!(
                        sa.end <= sb.start || sb.end <= sa.start,
                        "slots {sa:?} of {a} and {sb:?} of {b} overlap"
                    );
                }
            }
        }

        // Array creations never write over the elements they read inline
        for &n in &s.order {
            if g.op(n) != Op::ArrayCreation {
                continue;
            }
            for (_, e) in g.arg_nodes(n) {
                if g.op(e) != Op::ArrayElement || h.is_scheduled(e) {
                    continue;
                }
                let Some(src) = g.args(e)[0].node() else {
                    continue;
                };
                if g.op(src) == Op::ArrayCreation && h.variable_id(src) > 0 {
                    let slot = slots(src).start + g.info(e)[0];
                    assert!(!slots(n).contains(&slot), "{n} overwrites {e}");
                }
            }
        }
    }

    #[test]
    fn schedule_properties() {
        for seed in 0..20 {
            let (g, outputs) = random_graph(seed);
            let mut h = Handler::new(g);
            let s = schedule(&mut h, &outputs);
            check_schedule(&h, &s);

            // Determinism
            let (g2, outputs2) = random_graph(seed);
            let mut h2 = Handler::new(g2);
            let s2 = schedule(&mut h2, &outputs2);
            assert_eq!(s.order, s2.order);
            for &n in &s.order {
                assert_eq!(h.variable_id(n), h2.variable_id(n));
            }
        }
    }

    /// Builds a random DAG mixing scalars, arrays and array elements
    fn random_array_graph(seed: u64) -> (Graph<f64>, Vec<Arg<f64>>) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut g = Graph::<f64>::new();
        let mut scalars: Vec<Arg<f64>> =
            g.independents(3).into_iter().map(Arg::Node).collect();
        let mut arrays: Vec<Node> = vec![];
        for _ in 0..60 {
            let pick = |rng: &mut rand::rngs::StdRng, v: &[Arg<f64>]| {
                v[rng.gen_range(0..v.len())]
            };
            match rng.gen_range(0..4) {
                0 if !arrays.is_empty() => {
                    let a = arrays[rng.gen_range(0..arrays.len())];
                    let len = g.args(a).len();
                    let e = g.array_element(a, rng.gen_range(0..len)).unwrap();
                    scalars.push(e.into());
                }
                1 => {
                    let len = rng.gen_range(1..5);
                    let elems = (0..len).map(|_| pick(&mut rng, &scalars)).collect();
                    arrays.push(g.array(elems));
                }
                2 => {
                    let (a, b) = (pick(&mut rng, &scalars), pick(&mut rng, &scalars));
                    scalars.push(g.mul(a, b));
                }
                _ => {
                    let a = pick(&mut rng, &scalars);
                    scalars.push(g.unary(UnaryOpcode::Sin, a));
                }
            }
        }
        let outputs = scalars.iter().rev().step_by(5).take(4).copied().collect();
        (g, outputs)
    }

    #[test]
    fn array_slot_properties() {
        for seed in 0..100 {
            for inlining in [false, true] {
                let (g, outputs) = random_array_graph(seed);
                let mut h = Handler::new(g);
                let e = TextEmitter::new().with_inlining(inlining);
                let s = h.generate(&outputs, &[], &e, &mut vec![]).unwrap();
                check_schedule(&h, &s);
            }
        }
    }

    /// `y0 = sin(a) * b * p` on every iteration, `y1 = a * a * p` on the
    /// first two, with `a = x_it`, `b = x_{it + 1}` and `p = x4`
    fn looped() -> crate::loops::LoopModel<f64> {
        use crate::tape::{Tape, TapeBuilder};
        let mut t = TapeBuilder::<f64>::new();
        let v = t.inputs(3);
        let s = t.sin(v[0]);
        let sb = t.mul(s, v[1]);
        let y0 = t.mul(sb, v[2]);
        let aa = t.mul(v[0], v[0]);
        let y1 = t.mul(aa, v[2]);
        let tape: std::sync::Arc<dyn Tape<f64>> =
            std::sync::Arc::new(t.finish(vec![y0, y1]).unwrap());
        crate::loops::LoopModel::new(
            0,
            tape,
            3,
            vec![
                vec![Some(0), Some(1), Some(2)],
                vec![Some(3), Some(4), None],
            ],
            vec![vec![0, 1, 2], vec![1, 2, 3]],
            vec![4],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn loop_schedule_properties() {
        use crate::loops::{jacobian::SparseJacobian, reverse2::ReverseTwo};
        let (rows, cols): (Vec<usize>, Vec<usize>) =
            (0..5).flat_map(|i| (0..5).map(move |j| (i, j))).unzip();
        for reuse in [true, false] {
            let jac =
                SparseJacobian::build(5, &rows, &cols, &[looped()], None).unwrap();
            let (graph, outputs) = jac.into_parts();
            let mut h = Handler::new(graph);
            h.set_reuse_ids(reuse);
            let s = schedule(&mut h, &outputs);
            check_schedule(&h, &s);
        }

        let elements = (0..5).map(|j| (j, (0..5).collect())).collect();
        let r2 = ReverseTwo::build("m", 5, 5, &elements, &[looped()], None).unwrap();
        for batch in r2.into_batches() {
            let mut h = Handler::new(batch.graph);
            for f in &batch.functions {
                let e = TextEmitter::new().with_inlining(true);
                let s = h
                    .generate(&f.outputs, &f.index_arguments, &e, &mut vec![])
                    .unwrap();
                check_schedule(&h, &s);
            }
        }
    }
}
