use crate::graph::{Node, PatternId};

/// A one-argument math operation
#[derive(
    Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum UnaryOpcode {
    Neg,
    Abs,
    Sqrt,
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Sign,
}

/// A two-argument math operation
#[derive(
    Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum BinaryOpcode {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOpcode {
    /// Returns the infix symbol, if this operation is usually written infix
    pub fn symbol(&self) -> Option<&'static str> {
        match self {
            BinaryOpcode::Add => Some("+"),
            BinaryOpcode::Sub => Some("-"),
            BinaryOpcode::Mul => Some("*"),
            BinaryOpcode::Div => Some("/"),
            BinaryOpcode::Pow => None,
        }
    }
}

/// Comparison used by a conditional expression
#[derive(
    Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, strum::Display,
)]
pub enum CompareOpcode {
    #[strum(to_string = "<")]
    Lt,
    #[strum(to_string = "<=")]
    Le,
    #[strum(to_string = "==")]
    Eq,
    #[strum(to_string = ">=")]
    Ge,
    #[strum(to_string = ">")]
    Gt,
    #[strum(to_string = "!=")]
    Ne,
}

impl CompareOpcode {
    /// Applies the comparison
    pub fn apply<T: PartialOrd>(&self, a: T, b: T) -> bool {
        match self {
            CompareOpcode::Lt => a < b,
            CompareOpcode::Le => a <= b,
            CompareOpcode::Eq => a == b,
            CompareOpcode::Ge => a >= b,
            CompareOpcode::Gt => a > b,
            CompareOpcode::Ne => a != b,
        }
    }
}

/// Flavor of a call into a user-defined atomic function
#[derive(
    Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum AtomicOp {
    /// Zero-order evaluation
    Call,
    /// Forward-mode sweep
    Forward,
    /// Reverse-mode sweep
    Reverse,
}

/// How an indexed dependent writes into its output location
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Accumulate {
    /// `out[loc] = v`
    Assign,
    /// `out[loc] += v`
    Add,
}

impl Accumulate {
    pub(crate) fn to_info(self) -> usize {
        match self {
            Accumulate::Assign => 0,
            Accumulate::Add => 1,
        }
    }
    pub(crate) fn from_info(i: usize) -> Self {
        if i == 0 {
            Accumulate::Assign
        } else {
            Accumulate::Add
        }
    }
}

/// Storage class of a node's value
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Storage {
    /// Statement or independent: never gets a temporary id
    None,
    /// One scalar temporary
    Scalar,
    /// A contiguous block of array slots (one per argument)
    Array,
    /// An atomic function result
    Atomic,
}

/// Represents an operation in the code-generation graph.
///
/// `Op`s should be constructed by calling functions on
/// [`Graph`](crate::graph::Graph), e.g.
/// [`Graph::add`](crate::graph::Graph::add) will generate an
/// `Op::Binary(BinaryOpcode::Add)` node with two arguments.
///
/// Operands live in the owning node's argument list, and small integer
/// parameters (array indexes, atomic ids, output locations) in its info list.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Op {
    /// Independent variable; `info[0]` is its position
    Independent,
    Unary(UnaryOpcode),
    Binary(BinaryOpcode),
    /// `cmp(args[0], args[1]) ? args[2] : args[3]`
    Compare(CompareOpcode),
    /// Array built from its arguments
    ArrayCreation,
    /// Reads `args[0][info[0]]`
    ArrayElement,
    /// Call to atomic function `info[0]` with array arguments
    Atomic(AtomicOp),
    /// Prints message `info[0]` and passes `args[0]` through
    Print,
    /// Declares a named integer index; `info[0]` is the name id
    IndexDeclaration,
    /// Reads the current value of the index produced by `args[0]`, which is
    /// an index declaration (function argument), a loop start or an index
    /// assignment
    Index,
    /// Assigns declaration `args[0]` from the pattern applied to the
    /// remaining (index) arguments
    IndexAssign(PatternId),
    /// Opens a loop over declaration `args[0]`.
    ///
    /// Either `info[0]` holds a fixed iteration count, or `args[1]` is an
    /// index holding the count.  Any remaining arguments are loop-invariant
    /// values evaluated before the loop.
    LoopStart,
    /// Closes the loop started by `args[0]`; the remaining arguments are the
    /// statements executed on each iteration
    LoopEnd,
    /// Reads the independent selected by the pattern applied to `args[0]`
    LoopIndexedIndependent(PatternId),
    /// Writes `args[0]` to the output location selected by the pattern
    /// applied to `args[1]`; `info[0]` is the [`Accumulate`] mode
    LoopIndexedDependent(PatternId),
    /// Reads output location `info[0]` written by loop end `args[0]`
    Alias,
    /// Opens a branch taken when index `args[0]` falls in one of the
    /// inclusive ranges stored pairwise in `info`
    CondStart,
    /// Statement `args[1]` executed in branch `args[0]`
    CondResult,
    /// Closes a set of mutually exclusive branches (`args` are results)
    CondEnd,
}

impl Op {
    /// Returns a short name for the operation kind
    pub fn name(&self) -> &'static str {
        match self {
            Op::Independent => "independent",
            Op::Unary(..) => "unary",
            Op::Binary(..) => "binary",
            Op::Compare(..) => "compare",
            Op::ArrayCreation => "array",
            Op::ArrayElement => "array_element",
            Op::Atomic(..) => "atomic",
            Op::Print => "print",
            Op::IndexDeclaration => "index_declaration",
            Op::Index => "index",
            Op::IndexAssign(..) => "index_assign",
            Op::LoopStart => "loop_start",
            Op::LoopEnd => "loop_end",
            Op::LoopIndexedIndependent(..) => "loop_indexed_independent",
            Op::LoopIndexedDependent(..) => "loop_indexed_dependent",
            Op::Alias => "alias",
            Op::CondStart => "cond_start",
            Op::CondResult => "cond_result",
            Op::CondEnd => "cond_end",
        }
    }

    /// Returns the storage class of values produced by this operation
    pub fn storage(&self) -> Storage {
        match self {
            Op::Unary(..)
            | Op::Binary(..)
            | Op::Compare(..)
            | Op::ArrayElement
            | Op::LoopIndexedIndependent(..)
            | Op::Alias => Storage::Scalar,
            Op::ArrayCreation => Storage::Array,
            Op::Atomic(..) => Storage::Atomic,
            Op::Independent
            | Op::Print
            | Op::IndexDeclaration
            | Op::Index
            | Op::IndexAssign(..)
            | Op::LoopStart
            | Op::LoopEnd
            | Op::LoopIndexedDependent(..)
            | Op::CondStart
            | Op::CondResult
            | Op::CondEnd => Storage::None,
        }
    }

    /// Checks whether this operation is a statement, which must always appear
    /// in the evaluation order even though it holds no value
    pub fn is_statement(&self) -> bool {
        matches!(
            self,
            Op::Print
                | Op::IndexDeclaration
                | Op::Index
                | Op::IndexAssign(..)
                | Op::LoopStart
                | Op::LoopEnd
                | Op::LoopIndexedDependent(..)
                | Op::CondStart
                | Op::CondResult
                | Op::CondEnd
        )
    }

    /// Returns the index pattern used by this operation, if any
    pub fn pattern(&self) -> Option<PatternId> {
        match self {
            Op::IndexAssign(p)
            | Op::LoopIndexedIndependent(p)
            | Op::LoopIndexedDependent(p) => Some(*p),
            _ => None,
        }
    }
}

/// An operand: either a graph node or an immediate constant
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Arg<T> {
    Node(Node),
    Const(T),
}

impl<T> From<Node> for Arg<T> {
    fn from(n: Node) -> Self {
        Arg::Node(n)
    }
}

impl<T: Copy> From<&Arg<T>> for Arg<T> {
    fn from(a: &Arg<T>) -> Self {
        *a
    }
}

impl<T: num_traits::Float> Arg<T> {
    /// Returns the node, if this is not a constant
    pub fn node(&self) -> Option<Node> {
        match self {
            Arg::Node(n) => Some(*n),
            Arg::Const(..) => None,
        }
    }
    /// Returns the constant value, if this is a constant
    pub fn constant(&self) -> Option<T> {
        match self {
            Arg::Node(..) => None,
            Arg::Const(c) => Some(*c),
        }
    }
    /// Checks whether this is the constant zero
    pub fn is_zero(&self) -> bool {
        matches!(self, Arg::Const(c) if c.is_zero())
    }
    /// Checks whether this is the constant one
    pub fn is_one(&self) -> bool {
        matches!(self, Arg::Const(c) if c.is_one())
    }
}
