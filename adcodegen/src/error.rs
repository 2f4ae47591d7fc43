//! Module containing the universal error type
use thiserror::Error;

/// Universal error type for `adcodegen`
///
/// Every error is fatal for the generation call that raised it; nothing is
/// retried internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Node is not present in this `Graph`
    #[error("node is not present in this `Graph`")]
    BadNode,

    /// The given node is not a registered independent variable
    #[error("node is not a registered independent variable")]
    NotAnIndependent,

    /// An argument has an unexpected kind for its operation
    #[error("argument {index} of a {op} node is invalid")]
    BadArgument {
        /// Name of the consuming operation
        op: &'static str,
        /// Position of the argument
        index: usize,
    },

    /// A loop model is internally inconsistent
    #[error("invalid loop model: {0}")]
    InvalidLoopModel(String),

    /// Loops read temporary variables but no model provides them
    #[error(
        "loop {0} reads temporary variables, but there is no model for the \
         equations outside of loops"
    )]
    MissingTemporaries(usize),

    /// The variable being solved for occurs more than once in the expression
    #[error("cannot solve for a variable that occurs {0} times")]
    RepeatedVariable(usize),

    /// The variable being solved for does not occur in the expression
    #[error("variable does not occur in the expression")]
    MissingVariable,

    /// An operation between the expression and the variable has no inverse
    #[error("cannot invert `{0}` while solving")]
    NotInvertible(String),

    /// The same element was requested more than once
    #[error("repeated element at row {row}, column {col}")]
    RepeatedElement {
        /// Row (equation) index
        row: usize,
        /// Column (variable) index
        col: usize,
    },

    /// An element of a looped equation was not requested for every iteration
    #[error(
        "elements of an equation in loop {loop_id} must be requested for all \
         of its iterations; the element for {variable} was not requested for \
         equation {equation} (iteration {iteration})"
    )]
    MissingIteration {
        /// Loop identifier
        loop_id: usize,
        /// Original equation index for the missing iteration, if active
        equation: usize,
        /// Missing iteration
        iteration: usize,
        /// Human-readable description of the variable(s)
        variable: String,
    },

    /// A requested row is not produced by any loop or by the no-loop model
    #[error("equation {0} is not part of any loop or of the no-loop model")]
    UnknownEquation(usize),

    /// An atomic function id has no registered name
    #[error("atomic function id {0} has no registered name")]
    UnknownAtomic(usize),

    /// An index declaration was not given a value during evaluation
    #[error("index `{0}` has no value")]
    MissingIndex(String),

    /// An index pattern has no value for the given indexes
    #[error("index pattern has no value for {0:?}")]
    PatternLookup(Vec<usize>),

    /// The operation cannot be handled by this component
    #[error("unsupported operation: {0}")]
    UnsupportedOp(&'static str),

    /// Slice length does not match the expected count
    #[error("slice length ({actual}) does not match expected count ({expected})")]
    BadSliceLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// A value could not be represented in the numeric base type
    #[error("value {0} cannot be represented in the numeric base type")]
    BadCast(usize),
}
