//! Infrastructure for representing recorded operations as graphs
pub(crate) mod indexed;
mod op;
mod solve;

use indexed::{define_index, Index, IndexVec};
pub use op::{
    Accumulate, Arg, AtomicOp, BinaryOpcode, CompareOpcode, Op, Storage,
    UnaryOpcode,
};

use crate::{pattern::IndexPattern, Error};

use bimap::BiMap;
use std::collections::BTreeSet;

define_index!(Node, "An index in the `Graph::nodes` arena");
define_index!(PatternId, "An index in the `Graph::patterns` table");

/// Numeric base type of a graph
///
/// This is implemented for every floating-point type that can be printed,
/// i.e. `f32` and `f64`.
pub trait Base:
    num_traits::Float + std::fmt::Debug + std::fmt::Display + Send + Sync + 'static
{
}
impl<T> Base for T where
    T: num_traits::Float
        + std::fmt::Debug
        + std::fmt::Display
        + Send
        + Sync
        + 'static
{
}

/// A single operation node, with its operands and immediate parameters
#[derive(Clone, Debug)]
pub struct NodeData<T> {
    pub op: Op,
    pub args: Vec<Arg<T>>,
    pub info: Vec<usize>,
}

/// Iteration count of a loop
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoopCount {
    /// Known when the graph is built
    Fixed(usize),
    /// Read from an `Index` node at runtime
    Indexed(Node),
}

/// A `Graph` holds the operations recorded for a model, plus the index
/// patterns, index names and atomic function names they refer to.
///
/// It should be used like an arena allocator: it grows over time, then frees
/// all of its contents when dropped.  Nodes never change once built, except
/// for [`hoist_into_loop_start`](Graph::hoist_into_loop_start) while a loop
/// is being assembled.
#[derive(Debug)]
pub struct Graph<T = f64> {
    nodes: IndexVec<NodeData<T>, Node>,
    independents: Vec<Node>,
    patterns: IndexVec<IndexPattern, PatternId>,
    index_names: Vec<String>,
    messages: Vec<String>,
    atomics: BiMap<usize, String>,
}

impl<T> Default for Graph<T> {
    fn default() -> Self {
        Self {
            nodes: IndexVec::default(),
            independents: vec![],
            patterns: IndexVec::default(),
            index_names: vec![],
            messages: vec![],
            atomics: BiMap::new(),
        }
    }
}

impl<T: Base> Graph<T> {
    /// Build a new empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the graph
    ///
    /// All [`Node`] and [`PatternId`] handles from this graph are invalidated.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.independents.clear();
        self.patterns.clear();
        self.index_names.clear();
        self.messages.clear();
        self.atomics.clear();
    }

    /// Returns the number of nodes in the graph
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Checks whether the graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Checks whether the given [`Node`] is valid in this graph
    pub fn check_node(&self, node: Node) -> Result<(), Error> {
        self.nodes.get(node).ok_or(Error::BadNode).map(|_| ())
    }

    /// Looks up the operation of the given node
    pub fn get_op(&self, node: Node) -> Option<&Op> {
        self.nodes.get(node).map(|n| &n.op)
    }

    /// Returns the operation of a node known to be valid
    pub(crate) fn op(&self, node: Node) -> Op {
        self.nodes[node].op
    }

    /// Returns the arguments of a node known to be valid
    pub fn args(&self, node: Node) -> &[Arg<T>] {
        &self.nodes[node].args
    }

    /// Returns the info list of a node known to be valid
    pub fn info(&self, node: Node) -> &[usize] {
        &self.nodes[node].info
    }

    /// Iterates over node arguments, with their position
    pub fn arg_nodes(
        &self,
        node: Node,
    ) -> impl DoubleEndedIterator<Item = (usize, Node)> + '_ {
        self.nodes[node]
            .args
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.node().map(|n| (i, n)))
    }

    /// Iterates over all nodes in creation order
    pub fn nodes(&self) -> impl Iterator<Item = (Node, &NodeData<T>)> {
        self.nodes.enumerate()
    }

    /// Pushes a raw node, without any folding
    ///
    /// Node arguments must already be present in the graph.
    pub fn push(
        &mut self,
        op: Op,
        args: Vec<Arg<T>>,
        info: Vec<usize>,
    ) -> Result<Node, Error> {
        for (i, a) in args.iter().enumerate() {
            if let Arg::Node(n) = a {
                if self.nodes.get(*n).is_none() {
                    return Err(Error::BadArgument {
                        op: op.name(),
                        index: i,
                    });
                }
            }
        }
        Ok(self.nodes.push(NodeData { op, args, info }))
    }

    fn push_unchecked(
        &mut self,
        op: Op,
        args: Vec<Arg<T>>,
        info: Vec<usize>,
    ) -> Node {
        self.nodes.push(NodeData { op, args, info })
    }

    ////////////////////////////////////////////////////////////////////////////
    // Independents

    /// Creates a new independent variable, at the next position
    pub fn independent(&mut self) -> Node {
        let i = self.independents.len();
        let n = self.push_unchecked(Op::Independent, vec![], vec![i]);
        self.independents.push(n);
        n
    }

    /// Creates `n` new independent variables
    pub fn independents(&mut self, n: usize) -> Vec<Node> {
        (0..n).map(|_| self.independent()).collect()
    }

    /// Returns all independents, in creation order
    pub fn independent_nodes(&self) -> &[Node] {
        &self.independents
    }

    /// Returns the number of independents
    pub fn independent_count(&self) -> usize {
        self.independents.len()
    }

    /// Returns the position of an independent variable
    pub fn independent_index(&self, node: Node) -> Result<usize, Error> {
        match self.nodes.get(node) {
            Some(d) if d.op == Op::Independent => Ok(d.info[0]),
            Some(_) => Err(Error::NotAnIndependent),
            None => Err(Error::BadNode),
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Arithmetic

    /// Returns a constant argument
    pub fn constant(&self, v: T) -> Arg<T> {
        Arg::Const(v)
    }

    /// Builds a unary operation, folding constants
    pub fn unary(&mut self, op: UnaryOpcode, a: impl Into<Arg<T>>) -> Arg<T> {
        let a = a.into();
        if let Arg::Const(c) = a {
            return Arg::Const(apply_unary(op, c));
        }
        self.push_unchecked(Op::Unary(op), vec![a], vec![]).into()
    }

    /// Builds a binary operation, folding constants and identities
    pub fn binary(
        &mut self,
        op: BinaryOpcode,
        a: impl Into<Arg<T>>,
        b: impl Into<Arg<T>>,
    ) -> Arg<T> {
        let a = a.into();
        let b = b.into();
        if let (Arg::Const(x), Arg::Const(y)) = (a, b) {
            return Arg::Const(apply_binary(op, x, y));
        }
        let folded = match op {
            BinaryOpcode::Add if a.is_zero() => Some(b),
            BinaryOpcode::Add | BinaryOpcode::Sub if b.is_zero() => Some(a),
            BinaryOpcode::Sub if a.is_zero() => Some(self.neg(b)),
            BinaryOpcode::Mul if a.is_zero() || b.is_zero() => {
                Some(Arg::Const(T::zero()))
            }
            BinaryOpcode::Mul if a.is_one() => Some(b),
            BinaryOpcode::Mul | BinaryOpcode::Div if b.is_one() => Some(a),
            BinaryOpcode::Div if a.is_zero() => Some(Arg::Const(T::zero())),
            BinaryOpcode::Pow if b.is_zero() => Some(Arg::Const(T::one())),
            BinaryOpcode::Pow if b.is_one() => Some(a),
            _ => None,
        };
        match folded {
            Some(v) => v,
            None => self
                .push_unchecked(Op::Binary(op), vec![a, b], vec![])
                .into(),
        }
    }

    pub fn add(&mut self, a: impl Into<Arg<T>>, b: impl Into<Arg<T>>) -> Arg<T> {
        self.binary(BinaryOpcode::Add, a, b)
    }
    pub fn sub(&mut self, a: impl Into<Arg<T>>, b: impl Into<Arg<T>>) -> Arg<T> {
        self.binary(BinaryOpcode::Sub, a, b)
    }
    pub fn mul(&mut self, a: impl Into<Arg<T>>, b: impl Into<Arg<T>>) -> Arg<T> {
        self.binary(BinaryOpcode::Mul, a, b)
    }
    pub fn div(&mut self, a: impl Into<Arg<T>>, b: impl Into<Arg<T>>) -> Arg<T> {
        self.binary(BinaryOpcode::Div, a, b)
    }
    pub fn neg(&mut self, a: impl Into<Arg<T>>) -> Arg<T> {
        self.unary(UnaryOpcode::Neg, a)
    }

    /// Sums a sequence of values, skipping identical zeros
    pub fn sum<I>(&mut self, values: I) -> Arg<T>
    where
        I: IntoIterator<Item = Arg<T>>,
    {
        values
            .into_iter()
            .fold(Arg::Const(T::zero()), |acc, v| self.add(acc, v))
    }

    /// Builds the conditional expression `cmp(lhs, rhs) ? t : f`
    pub fn compare(
        &mut self,
        cmp: CompareOpcode,
        lhs: impl Into<Arg<T>>,
        rhs: impl Into<Arg<T>>,
        t: impl Into<Arg<T>>,
        f: impl Into<Arg<T>>,
    ) -> Arg<T> {
        let (lhs, rhs, t, f) = (lhs.into(), rhs.into(), t.into(), f.into());
        if let (Arg::Const(a), Arg::Const(b)) = (lhs, rhs) {
            return if cmp.apply(a, b) { t } else { f };
        }
        self.push_unchecked(Op::Compare(cmp), vec![lhs, rhs, t, f], vec![])
            .into()
    }

    ////////////////////////////////////////////////////////////////////////////
    // Arrays, atomics, printing

    /// Builds an array from the given elements
    pub fn array(&mut self, elements: Vec<Arg<T>>) -> Node {
        self.push_unchecked(Op::ArrayCreation, elements, vec![])
    }

    /// Reads element `i` of an array
    pub fn array_element(&mut self, array: Node, i: usize) -> Result<Node, Error> {
        match self.get_op(array).copied() {
            Some(Op::ArrayCreation | Op::Atomic(..)) => {
                Ok(self.push_unchecked(Op::ArrayElement, vec![array.into()], vec![i]))
            }
            Some(_) => Err(Error::BadArgument {
                op: Op::ArrayElement.name(),
                index: 0,
            }),
            None => Err(Error::BadNode),
        }
    }

    /// Registers the name of an atomic function
    pub fn register_atomic(&mut self, id: usize, name: &str) {
        self.atomics.insert(id, name.to_owned());
    }

    /// Looks up the name of an atomic function
    pub fn atomic_name(&self, id: usize) -> Result<&str, Error> {
        self.atomics
            .get_by_left(&id)
            .map(|s| s.as_str())
            .ok_or(Error::UnknownAtomic(id))
    }

    /// Looks up the id of an atomic function by name
    pub fn atomic_id(&self, name: &str) -> Option<usize> {
        self.atomics.get_by_right(name).copied()
    }

    /// Calls atomic function `id` with the given array arguments
    pub fn atomic(
        &mut self,
        kind: AtomicOp,
        id: usize,
        args: Vec<Node>,
    ) -> Result<Node, Error> {
        self.push(
            Op::Atomic(kind),
            args.into_iter().map(Arg::Node).collect(),
            vec![id],
        )
    }

    /// Prints a message together with a value, passing the value through
    pub fn print(&mut self, message: &str, value: impl Into<Arg<T>>) -> Node {
        let id = self.messages.len();
        self.messages.push(message.to_owned());
        self.push_unchecked(Op::Print, vec![value.into()], vec![id])
    }

    /// Returns the message attached to a print node
    pub fn message(&self, node: Node) -> Option<&str> {
        match self.nodes.get(node)? {
            d if d.op == Op::Print => {
                self.messages.get(d.info[0]).map(|s| s.as_str())
            }
            _ => None,
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Indexes, loops and conditions

    /// Stores an index pattern, returning its handle
    pub fn add_pattern(&mut self, p: IndexPattern) -> PatternId {
        self.patterns.push(p)
    }

    /// Looks up an index pattern
    pub fn pattern(&self, p: PatternId) -> &IndexPattern {
        &self.patterns[p]
    }

    /// Declares a named integer index
    pub fn index_declaration(&mut self, name: &str) -> Node {
        let id = self.index_names.len();
        self.index_names.push(name.to_owned());
        self.push_unchecked(Op::IndexDeclaration, vec![], vec![id])
    }

    /// Returns the name of an index declaration
    pub fn index_name(&self, declaration: Node) -> Option<&str> {
        match self.nodes.get(declaration)? {
            d if d.op == Op::IndexDeclaration => {
                self.index_names.get(d.info[0]).map(|s| s.as_str())
            }
            _ => None,
        }
    }

    /// Finds the declaration behind an index-producing node
    pub fn index_declaration_of(&self, node: Node) -> Option<Node> {
        let d = self.nodes.get(node)?;
        match d.op {
            Op::IndexDeclaration => Some(node),
            Op::Index | Op::LoopStart | Op::IndexAssign(..) => {
                self.index_declaration_of(d.args.first()?.node()?)
            }
            _ => None,
        }
    }

    /// Reads the index produced by a declaration, loop start or assignment
    pub fn index(&mut self, producer: Node) -> Result<Node, Error> {
        match self.get_op(producer).copied() {
            Some(
                Op::IndexDeclaration | Op::LoopStart | Op::IndexAssign(..),
            ) => Ok(self.push_unchecked(Op::Index, vec![producer.into()], vec![])),
            Some(_) => Err(Error::BadArgument {
                op: Op::Index.name(),
                index: 0,
            }),
            None => Err(Error::BadNode),
        }
    }

    fn check_index(&self, op: Op, i: usize, n: Node) -> Result<(), Error> {
        match self.get_op(n) {
            Some(Op::Index) => Ok(()),
            Some(_) => Err(Error::BadArgument {
                op: op.name(),
                index: i,
            }),
            None => Err(Error::BadNode),
        }
    }

    /// Assigns a declared index from a pattern over one or two indexes
    pub fn index_assign(
        &mut self,
        declaration: Node,
        pattern: IndexPattern,
        indexes: &[Node],
    ) -> Result<Node, Error> {
        if self.get_op(declaration) != Some(&Op::IndexDeclaration) {
            return Err(Error::BadArgument {
                op: "index_assign",
                index: 0,
            });
        }
        for (i, n) in indexes.iter().enumerate() {
            self.check_index(Op::IndexAssign(PatternId::default()), i + 1, *n)?;
        }
        let p = self.add_pattern(pattern);
        let mut args = vec![declaration.into()];
        args.extend(indexes.iter().map(|n| Arg::Node(*n)));
        Ok(self.push_unchecked(Op::IndexAssign(p), args, vec![]))
    }

    /// Opens a loop over the given index declaration
    pub fn loop_start(
        &mut self,
        declaration: Node,
        count: LoopCount,
    ) -> Result<Node, Error> {
        if self.get_op(declaration) != Some(&Op::IndexDeclaration) {
            return Err(Error::BadArgument {
                op: Op::LoopStart.name(),
                index: 0,
            });
        }
        Ok(match count {
            LoopCount::Fixed(c) => self.push_unchecked(
                Op::LoopStart,
                vec![declaration.into()],
                vec![c],
            ),
            LoopCount::Indexed(n) => {
                self.check_index(Op::LoopStart, 1, n)?;
                self.push_unchecked(
                    Op::LoopStart,
                    vec![declaration.into(), n.into()],
                    vec![],
                )
            }
        })
    }

    /// Returns the iteration count of a loop start
    pub fn loop_count(&self, start: Node) -> Option<LoopCount> {
        let d = self.nodes.get(start)?;
        if d.op != Op::LoopStart {
            return None;
        }
        match d.info.first() {
            Some(c) => Some(LoopCount::Fixed(*c)),
            None => Some(LoopCount::Indexed(d.args.get(1)?.node()?)),
        }
    }

    /// Returns the loop-invariant arguments evaluated before a loop
    pub fn loop_invariants(&self, start: Node) -> &[Arg<T>] {
        let d = &self.nodes[start];
        let skip = if d.info.is_empty() { 2 } else { 1 };
        &d.args[skip.min(d.args.len())..]
    }

    /// Appends loop-invariant values to a loop start, so that they are
    /// evaluated once before the loop instead of on every iteration
    pub fn hoist_into_loop_start(
        &mut self,
        start: Node,
        values: impl IntoIterator<Item = Node>,
    ) -> Result<(), Error> {
        if self.get_op(start) != Some(&Op::LoopStart) {
            return Err(Error::BadArgument {
                op: Op::LoopStart.name(),
                index: 0,
            });
        }
        let present: BTreeSet<Node> = self.nodes[start]
            .args
            .iter()
            .filter_map(|a| a.node())
            .collect();
        let mut new = vec![];
        for v in values {
            self.check_node(v)?;
            if !present.contains(&v) && !new.contains(&v) {
                new.push(v);
            }
        }
        self.nodes[start].args.extend(new.into_iter().map(Arg::Node));
        Ok(())
    }

    /// Reads the independent selected by a pattern applied to an index
    pub fn loop_indexed_independent(
        &mut self,
        pattern: IndexPattern,
        index: Node,
    ) -> Result<Node, Error> {
        if self.get_op(index) != Some(&Op::Index) {
            return Err(Error::BadArgument {
                op: "loop_indexed_independent",
                index: 0,
            });
        }
        let p = self.add_pattern(pattern);
        Ok(self.push_unchecked(
            Op::LoopIndexedIndependent(p),
            vec![index.into()],
            vec![],
        ))
    }

    /// Writes a value to the output location selected by a pattern
    pub fn loop_indexed_dependent(
        &mut self,
        value: Arg<T>,
        pattern: IndexPattern,
        index: Node,
        mode: Accumulate,
    ) -> Result<Node, Error> {
        if self.get_op(index) != Some(&Op::Index) {
            return Err(Error::BadArgument {
                op: "loop_indexed_dependent",
                index: 1,
            });
        }
        let p = self.add_pattern(pattern);
        Ok(self.push_unchecked(
            Op::LoopIndexedDependent(p),
            vec![value, index.into()],
            vec![mode.to_info()],
        ))
    }

    /// Closes a loop, executing `body` statements on each iteration
    pub fn loop_end(
        &mut self,
        start: Node,
        body: Vec<Node>,
    ) -> Result<Node, Error> {
        if self.get_op(start) != Some(&Op::LoopStart) {
            return Err(Error::BadArgument {
                op: Op::LoopEnd.name(),
                index: 0,
            });
        }
        let mut args = vec![start.into()];
        args.extend(body.into_iter().map(Arg::Node));
        self.push(Op::LoopEnd, args, vec![])
    }

    /// Reads output location `location` written by a loop
    pub fn alias(
        &mut self,
        loop_end: Node,
        location: usize,
    ) -> Result<Node, Error> {
        if self.get_op(loop_end) != Some(&Op::LoopEnd) {
            return Err(Error::BadArgument {
                op: Op::Alias.name(),
                index: 0,
            });
        }
        Ok(self.push_unchecked(Op::Alias, vec![loop_end.into()], vec![location]))
    }

    /// Opens a branch taken when `index` is one of `iterations`
    pub fn cond_start(
        &mut self,
        index: Node,
        iterations: &BTreeSet<usize>,
    ) -> Result<Node, Error> {
        self.check_index(Op::CondStart, 0, index)?;
        Ok(self.push_unchecked(
            Op::CondStart,
            vec![index.into()],
            ranges(iterations),
        ))
    }

    /// Returns the inclusive iteration ranges of a branch
    pub fn cond_ranges(&self, start: Node) -> Vec<(usize, usize)> {
        self.nodes[start]
            .info
            .chunks_exact(2)
            .map(|c| (c[0], c[1]))
            .collect()
    }

    /// Places statements inside a branch, executed in order when it is taken
    pub fn cond_result(
        &mut self,
        start: Node,
        statements: Vec<Node>,
    ) -> Result<Node, Error> {
        if self.get_op(start) != Some(&Op::CondStart) {
            return Err(Error::BadArgument {
                op: Op::CondResult.name(),
                index: 0,
            });
        }
        let args = std::iter::once(start)
            .chain(statements)
            .map(Arg::Node)
            .collect();
        self.push(Op::CondResult, args, vec![])
    }

    /// Closes a set of mutually exclusive branches
    pub fn cond_end(&mut self, results: Vec<Node>) -> Result<Node, Error> {
        for (i, r) in results.iter().enumerate() {
            if self.get_op(*r) != Some(&Op::CondResult) {
                return Err(Error::BadArgument {
                    op: Op::CondEnd.name(),
                    index: i,
                });
            }
        }
        Ok(self.push_unchecked(
            Op::CondEnd,
            results.into_iter().map(Arg::Node).collect(),
            vec![],
        ))
    }

    ////////////////////////////////////////////////////////////////////////////
    // Evaluation

    /// Evaluates a single value for the given independent values
    ///
    /// This runs the reference interpreter in [`crate::eval`], so it handles
    /// loops and aliases as well.
    pub fn eval(&self, root: impl Into<Arg<T>>, x: &[T]) -> Result<T, Error> {
        let out = crate::eval::evaluate(self, &[root.into()], x, &[])?;
        Ok(out.values[0])
    }
}

/// Compresses a sorted set into inclusive `[lo, hi]` pairs, flattened
fn ranges(set: &BTreeSet<usize>) -> Vec<usize> {
    let mut out: Vec<usize> = vec![];
    for &i in set {
        match out.last_mut() {
            Some(hi) if *hi + 1 == i => *hi = i,
            _ => out.extend([i, i]),
        }
    }
    out
}

pub(crate) fn apply_unary<T: Base>(op: UnaryOpcode, a: T) -> T {
    match op {
        UnaryOpcode::Neg => -a,
        UnaryOpcode::Abs => a.abs(),
        UnaryOpcode::Sqrt => a.sqrt(),
        UnaryOpcode::Exp => a.exp(),
        UnaryOpcode::Ln => a.ln(),
        UnaryOpcode::Sin => a.sin(),
        UnaryOpcode::Cos => a.cos(),
        UnaryOpcode::Tan => a.tan(),
        UnaryOpcode::Asin => a.asin(),
        UnaryOpcode::Acos => a.acos(),
        UnaryOpcode::Atan => a.atan(),
        UnaryOpcode::Sinh => a.sinh(),
        UnaryOpcode::Cosh => a.cosh(),
        UnaryOpcode::Tanh => a.tanh(),
        UnaryOpcode::Sign => {
            if a.is_zero() {
                T::zero()
            } else {
                a.signum()
            }
        }
    }
}

pub(crate) fn apply_binary<T: Base>(op: BinaryOpcode, a: T, b: T) -> T {
    match op {
        BinaryOpcode::Add => a + b,
        BinaryOpcode::Sub => a - b,
        BinaryOpcode::Mul => a * b,
        BinaryOpcode::Div => a / b,
        BinaryOpcode::Pow => a.powf(b),
    }
}
