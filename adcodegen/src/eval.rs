//! Reference interpreter for code-generation graphs
//!
//! This evaluates the same graphs that the [`Handler`](crate::Handler)
//! schedules, including loops, index assignments, indexed writes and
//! conditional branches, so that generated functions can be checked
//! numerically without compiling them.
//!
//! Evaluation is demand-driven: values are computed when an output (or a
//! statement) needs them, and cached.  Values that depend on an index are
//! cached per loop iteration.  Loops do not nest.
use crate::{
    graph::{
        apply_binary, apply_unary, indexed::IndexVec, Accumulate, Arg, Base,
        Graph, LoopCount, Node, Op,
    },
    Error,
};

use log::debug;
use std::collections::{BTreeMap, HashMap};

/// Result of evaluating a set of outputs
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation<T> {
    /// One value per output; statements evaluate to zero
    pub values: Vec<T>,
    /// Locations written by statement outputs (loops and indexed writes)
    pub buffer: BTreeMap<usize, T>,
}

/// Evaluates `outputs` for independent values `x`
///
/// `indexes` gives values for index declarations used as function arguments
/// (e.g. the row of a Hessian group function).
pub fn evaluate<T: Base>(
    graph: &Graph<T>,
    outputs: &[Arg<T>],
    x: &[T],
    indexes: &[(Node, usize)],
) -> Result<Evaluation<T>, Error> {
    if x.len() != graph.independent_count() {
        return Err(Error::BadSliceLength {
            expected: graph.independent_count(),
            actual: x.len(),
        });
    }
    let mut e = Evaluator::new(graph, x, indexes);
    let mut buffer = BTreeMap::new();
    let mut values = Vec::with_capacity(outputs.len());
    for o in outputs {
        let v = match o {
            Arg::Node(n)
                if graph
                    .get_op(*n)
                    .is_some_and(|op| op.is_statement() && *op != Op::Print) =>
            {
                e.execute(*n, &mut buffer)?;
                T::zero()
            }
            _ => e.value(*o)?,
        };
        values.push(v);
    }
    Ok(Evaluation { values, buffer })
}

#[derive(Clone, Debug)]
enum Value<T> {
    Scalar(T),
    Array(Vec<T>),
}

struct Evaluator<'a, T> {
    graph: &'a Graph<T>,
    x: &'a [T],
    indexes: HashMap<Node, usize>,

    /// Whether each node depends on an index
    indexed: IndexVec<bool, Node>,

    values: HashMap<Node, Value<T>>,
    local: HashMap<Node, Value<T>>,

    /// Current iteration of each running loop, keyed by loop start
    iterations: HashMap<Node, usize>,
    /// Output buffers of finished loops, keyed by loop end
    loops: HashMap<Node, BTreeMap<usize, T>>,
}

impl<'a, T: Base> Evaluator<'a, T> {
    fn new(graph: &'a Graph<T>, x: &'a [T], indexes: &[(Node, usize)]) -> Self {
        let mut indexed: IndexVec<bool, Node> = IndexVec::default();
        for (n, d) in graph.nodes() {
            let v = d.op == Op::Index
                || d.args
                    .iter()
                    .filter_map(|a| a.node())
                    .any(|a| indexed.get(a).copied().unwrap_or(false));
            let i = indexed.push(v);
            debug_assert_eq!(i, n);
        }
        Self {
            graph,
            x,
            indexes: indexes.iter().copied().collect(),
            indexed,
            values: HashMap::new(),
            local: HashMap::new(),
            iterations: HashMap::new(),
            loops: HashMap::new(),
        }
    }

    fn cached(&self, n: Node) -> Option<&Value<T>> {
        if self.indexed[n] {
            self.local.get(&n)
        } else {
            self.values.get(&n)
        }
    }

    fn store(&mut self, n: Node, v: Value<T>) {
        if self.indexed[n] {
            self.local.insert(n, v);
        } else {
            self.values.insert(n, v);
        }
    }

    fn scalar(&self, a: Arg<T>) -> Result<T, Error> {
        match a {
            Arg::Const(c) => Ok(c),
            Arg::Node(n) => match self.cached(n) {
                Some(Value::Scalar(v)) => Ok(*v),
                _ => Err(Error::BadNode),
            },
        }
    }

    fn cast(i: usize) -> Result<T, Error> {
        <T as num_traits::NumCast>::from(i).ok_or(Error::BadCast(i))
    }

    fn index_name(&self, n: Node) -> String {
        self.graph
            .index_declaration_of(n)
            .and_then(|d| self.graph.index_name(d))
            .unwrap_or("?")
            .to_owned()
    }

    /// Returns the current value of an `Index` node
    fn index_value(&self, n: Node) -> Result<usize, Error> {
        if self.graph.get_op(n) != Some(&Op::Index) {
            return Err(Error::BadArgument {
                op: "index",
                index: 0,
            });
        }
        let producer = self.graph.args(n)[0].node().ok_or(Error::BadNode)?;
        match self.graph.op(producer) {
            Op::IndexDeclaration => self
                .indexes
                .get(&producer)
                .copied()
                .ok_or_else(|| Error::MissingIndex(self.index_name(n))),
            Op::LoopStart => self
                .iterations
                .get(&producer)
                .copied()
                .ok_or_else(|| Error::MissingIndex(self.index_name(n))),
            Op::IndexAssign(p) => {
                let idx = self.graph.args(producer)[1..]
                    .iter()
                    .map(|a| {
                        a.node()
                            .ok_or(Error::BadNode)
                            .and_then(|a| self.index_value(a))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.graph
                    .pattern(p)
                    .evaluate(&idx)
                    .ok_or(Error::PatternLookup(idx))
            }
            _ => Err(Error::BadNode),
        }
    }

    /// Evaluates a value, without recursing through its arguments
    fn value(&mut self, root: Arg<T>) -> Result<T, Error> {
        let root = match root {
            Arg::Const(c) => return Ok(c),
            Arg::Node(n) => n,
        };
        self.graph.check_node(root)?;
        let mut todo = vec![(root, false)];
        while let Some((n, ready)) = todo.pop() {
            if self.cached(n).is_some() {
                continue;
            }
            let op = self.graph.op(n);
            let args = self.graph.args(n);
            match op {
                Op::Independent => {
                    let v = self.x[self.graph.info(n)[0]];
                    self.store(n, Value::Scalar(v));
                    continue;
                }
                Op::Index => {
                    let v = Self::cast(self.index_value(n)?)?;
                    self.store(n, Value::Scalar(v));
                    continue;
                }
                Op::LoopIndexedIndependent(p) => {
                    let i = self.index_value(args[0].node().ok_or(Error::BadNode)?)?;
                    let j = self
                        .graph
                        .pattern(p)
                        .evaluate(&[i])
                        .ok_or(Error::PatternLookup(vec![i]))?;
                    let v = *self.x.get(j).ok_or(Error::PatternLookup(vec![i]))?;
                    self.store(n, Value::Scalar(v));
                    continue;
                }
                Op::Alias => {
                    let end = args[0].node().ok_or(Error::BadNode)?;
                    self.run_loop(end)?;
                    let loc = self.graph.info(n)[0];
                    let v = self
                        .loops
                        .get(&end)
                        .and_then(|b| b.get(&loc))
                        .copied()
                        .unwrap_or_else(T::zero);
                    self.store(n, Value::Scalar(v));
                    continue;
                }
                Op::Atomic(..) => return Err(Error::UnsupportedOp("atomic")),
                Op::Unary(..)
                | Op::Binary(..)
                | Op::Compare(..)
                | Op::ArrayCreation
                | Op::ArrayElement
                | Op::Print => (),
                op => return Err(Error::UnsupportedOp(op.name())),
            }

            if !ready {
                todo.push((n, true));
                for (_, a) in self.graph.arg_nodes(n) {
                    if self.cached(a).is_none() {
                        todo.push((a, false));
                    }
                }
                continue;
            }

            let v = match op {
                Op::Unary(u) => Value::Scalar(apply_unary(u, self.scalar(args[0])?)),
                Op::Binary(b) => Value::Scalar(apply_binary(
                    b,
                    self.scalar(args[0])?,
                    self.scalar(args[1])?,
                )),
                Op::Compare(c) => {
                    let pick = if c.apply(self.scalar(args[0])?, self.scalar(args[1])?)
                    {
                        args[2]
                    } else {
                        args[3]
                    };
                    Value::Scalar(self.scalar(pick)?)
                }
                Op::ArrayCreation => Value::Array(
                    args.iter()
                        .map(|a| self.scalar(*a))
                        .collect::<Result<_, _>>()?,
                ),
                Op::ArrayElement => {
                    let i = self.graph.info(n)[0];
                    let src = args[0].node().ok_or(Error::BadNode)?;
                    match self.cached(src) {
                        Some(Value::Array(v)) => {
                            Value::Scalar(*v.get(i).ok_or(Error::BadNode)?)
                        }
                        _ => return Err(Error::BadNode),
                    }
                }
                Op::Print => {
                    let v = self.scalar(args[0])?;
                    debug!("{} {v}", self.graph.message(n).unwrap_or_default());
                    Value::Scalar(v)
                }
                _ => unreachable!(),
            };
            self.store(n, v);
        }
        self.scalar(root.into())
    }

    /// Executes a statement, writing indexed outputs into `target`
    fn execute(
        &mut self,
        n: Node,
        target: &mut BTreeMap<usize, T>,
    ) -> Result<(), Error> {
        let args = self.graph.args(n);
        match self.graph.op(n) {
            Op::LoopIndexedDependent(p) => {
                let i = self.index_value(args[1].node().ok_or(Error::BadNode)?)?;
                let loc = self
                    .graph
                    .pattern(p)
                    .evaluate(&[i])
                    .ok_or(Error::PatternLookup(vec![i]))?;
                let v = self.value(args[0])?;
                match Accumulate::from_info(self.graph.info(n)[0]) {
                    Accumulate::Assign => {
                        target.insert(loc, v);
                    }
                    Accumulate::Add => {
                        let e = target.entry(loc).or_insert_with(T::zero);
                        *e = *e + v;
                    }
                }
            }
            Op::CondEnd => {
                let results: Vec<Node> =
                    args.iter().filter_map(|a| a.node()).collect();
                for r in results {
                    self.execute(r, target)?;
                }
            }
            Op::CondResult => {
                let start = args[0].node().ok_or(Error::BadNode)?;
                let index = self.graph.args(start)[0]
                    .node()
                    .ok_or(Error::BadNode)?;
                let i = self.index_value(index)?;
                let taken = self
                    .graph
                    .cond_ranges(start)
                    .into_iter()
                    .any(|(lo, hi)| (lo..=hi).contains(&i));
                if taken {
                    let body: Vec<Node> =
                        args[1..].iter().filter_map(|a| a.node()).collect();
                    for stmt in body {
                        self.execute(stmt, target)?;
                    }
                }
            }
            Op::LoopEnd => {
                self.run_loop(n)?;
                if let Some(b) = self.loops.get(&n) {
                    for (loc, v) in b {
                        let e = target.entry(*loc).or_insert_with(T::zero);
                        *e = *e + *v;
                    }
                }
            }
            Op::Print => {
                self.value(n.into())?;
            }
            Op::IndexDeclaration
            | Op::Index
            | Op::IndexAssign(..)
            | Op::LoopStart
            | Op::CondStart => (),
            _ => {
                self.value(n.into())?;
            }
        }
        Ok(())
    }

    /// Runs a loop once, storing its output buffer
    fn run_loop(&mut self, end: Node) -> Result<(), Error> {
        if self.loops.contains_key(&end) {
            return Ok(());
        }
        if self.graph.get_op(end) != Some(&Op::LoopEnd) {
            return Err(Error::BadArgument {
                op: "alias",
                index: 0,
            });
        }
        let args = self.graph.args(end);
        let start = args[0].node().ok_or(Error::BadNode)?;
        let count = match self.graph.loop_count(start) {
            Some(LoopCount::Fixed(c)) => c,
            Some(LoopCount::Indexed(i)) => self.index_value(i)?,
            None => return Err(Error::BadNode),
        };
        for a in self.graph.loop_invariants(start) {
            self.value(*a)?;
        }

        // Values that depend on index arguments stay cached across iterations
        let outer = std::mem::take(&mut self.local);
        let body: Vec<Node> = args[1..].iter().filter_map(|a| a.node()).collect();
        let mut buffer = BTreeMap::new();
        for it in 0..count {
            self.iterations.insert(start, it);
            self.local.clone_from(&outer);
            for &stmt in &body {
                self.execute(stmt, &mut buffer)?;
            }
        }
        self.iterations.remove(&start);
        self.local = outer;
        self.loops.insert(end, buffer);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{graph::UnaryOpcode, pattern::IndexPattern};

    #[test]
    fn loop_with_alias() {
        // out[i] += x[i] * x[i + 1], for i in 0..3
        let mut g = Graph::<f64>::new();
        let _ = g.independents(4);
        let d = g.index_declaration("j");
        let start = g.loop_start(d, LoopCount::Fixed(3)).unwrap();
        let j = g.index(start).unwrap();
        let a = g
            .loop_indexed_independent(IndexPattern::detect_slice(&[0, 1, 2]), j)
            .unwrap();
        let b = g
            .loop_indexed_independent(IndexPattern::detect_slice(&[1, 2, 3]), j)
            .unwrap();
        let v = g.mul(a, b);
        let dep = g
            .loop_indexed_dependent(
                v,
                IndexPattern::detect_slice(&[0, 1, 2]),
                j,
                Accumulate::Add,
            )
            .unwrap();
        let end = g.loop_end(start, vec![dep]).unwrap();
        let y1 = g.alias(end, 1).unwrap();
        let y = g.unary(UnaryOpcode::Neg, y1);

        let x = [1.0, 2.0, 3.0, 4.0];
        let out = evaluate(&g, &[y, end.into()], &x, &[]).unwrap();
        assert_eq!(out.values[0], -6.0);
        assert_eq!(out.buffer.get(&0), Some(&2.0));
        assert_eq!(out.buffer.get(&2), Some(&12.0));
    }

    #[test]
    fn conditional_write() {
        let mut g = Graph::<f64>::new();
        let x = g.independent();
        let d = g.index_declaration("j");
        let start = g.loop_start(d, LoopCount::Fixed(4)).unwrap();
        let j = g.index(start).unwrap();
        let set = [1, 3].into_iter().collect();
        let c = g.cond_start(j, &set).unwrap();
        let dep = g
            .loop_indexed_dependent(
                x.into(),
                IndexPattern::detect_slice(&[0, 1, 2, 3]),
                j,
                Accumulate::Add,
            )
            .unwrap();
        let r = g.cond_result(c, vec![dep]).unwrap();
        let ce = g.cond_end(vec![r]).unwrap();
        let end = g.loop_end(start, vec![ce]).unwrap();
        let out = evaluate(&g, &[end.into()], &[5.0], &[]).unwrap();
        assert_eq!(
            out.buffer.into_iter().collect::<Vec<_>>(),
            vec![(1, 5.0), (3, 5.0)]
        );
    }

    #[test]
    fn index_argument() {
        let mut g = Graph::<f64>::new();
        let _ = g.independents(3);
        let row = g.index_declaration("jrow");
        let ri = g.index(row).unwrap();
        let d = g.index_declaration("j");
        let assign = g
            .index_assign(d, IndexPattern::detect_slice(&[2, 1, 0]), &[ri])
            .unwrap();
        let j = g.index(assign).unwrap();
        let xi = g
            .loop_indexed_independent(IndexPattern::detect_slice(&[0, 1, 2]), j)
            .unwrap();
        let x = [10.0, 20.0, 30.0];
        let v = evaluate(&g, &[xi.into()], &x, &[(row, 0)]).unwrap();
        assert_eq!(v.values, vec![30.0]);
        let err = evaluate(&g, &[xi.into()], &x, &[]);
        assert_eq!(err, Err(Error::MissingIndex("jrow".to_owned())));
    }
}
