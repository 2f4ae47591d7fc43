//! Isolating a variable in an expression
use super::{Arg, BinaryOpcode, Base, Graph, Node, Op, UnaryOpcode};
use crate::Error;

use std::collections::HashMap;

impl<T: Base> Graph<T> {
    /// Solves `expr == 0` for `var`, returning an expression for `var`
    ///
    /// `var` must occur exactly once in `expr` (counting every path through
    /// shared nodes).  Each operation on the path from `expr` down to `var`
    /// is inverted in turn; trigonometric inverses use the principal branch.
    pub fn solve_for(
        &mut self,
        expr: impl Into<Arg<T>>,
        var: Node,
    ) -> Result<Arg<T>, Error> {
        self.check_node(var)?;
        let Arg::Node(root) = expr.into() else {
            return Err(Error::MissingVariable);
        };
        self.check_node(root)?;

        let paths = self.occurrences(root, var);
        match paths.get(&root).copied().unwrap_or(0) {
            0 => return Err(Error::MissingVariable),
            1 => (),
            n => return Err(Error::RepeatedVariable(n)),
        }
        let reaches = |a: &Arg<T>| {
            a.node().is_some_and(|n| paths.get(&n).is_some_and(|c| *c > 0))
        };

        let mut rhs = Arg::Const(T::zero());
        let mut node = root;
        while node != var {
            let op = self.op(node);
            let args = self.args(node).to_vec();
            let Some(side) = args.iter().position(&reaches) else {
                return Err(Error::MissingVariable);
            };
            rhs = match op {
                Op::Unary(u) => self.invert_unary(u, rhs)?,
                Op::Binary(b) => {
                    let other = args[1 - side];
                    self.invert_binary(b, side, other, rhs)
                }
                Op::Print => rhs,
                op => return Err(Error::NotInvertible(op.name().to_owned())),
            };
            node = args[side].node().ok_or(Error::MissingVariable)?;
        }
        Ok(rhs)
    }

    /// Counts the paths from each node reachable from `root` down to `var`
    fn occurrences(&self, root: Node, var: Node) -> HashMap<Node, usize> {
        let mut count: HashMap<Node, usize> = HashMap::new();
        let mut todo = vec![(root, false)];
        while let Some((n, ready)) = todo.pop() {
            if count.contains_key(&n) {
                continue;
            }
            if n == var {
                count.insert(n, 1);
            } else if ready {
                let c = self
                    .arg_nodes(n)
                    .map(|(_, a)| count.get(&a).copied().unwrap_or(0))
                    .fold(0, usize::saturating_add);
                count.insert(n, c);
            } else {
                todo.push((n, true));
                todo.extend(self.arg_nodes(n).map(|(_, a)| (a, false)));
            }
        }
        count
    }

    /// Returns `x` such that `op(x) == rhs`
    fn invert_unary(&mut self, op: UnaryOpcode, rhs: Arg<T>) -> Result<Arg<T>, Error> {
        let inverse = match op {
            UnaryOpcode::Neg => UnaryOpcode::Neg,
            UnaryOpcode::Exp => UnaryOpcode::Ln,
            UnaryOpcode::Ln => UnaryOpcode::Exp,
            UnaryOpcode::Sin => UnaryOpcode::Asin,
            UnaryOpcode::Cos => UnaryOpcode::Acos,
            UnaryOpcode::Tan => UnaryOpcode::Atan,
            UnaryOpcode::Asin => UnaryOpcode::Sin,
            UnaryOpcode::Acos => UnaryOpcode::Cos,
            UnaryOpcode::Atan => UnaryOpcode::Tan,
            UnaryOpcode::Sqrt => return Ok(self.mul(rhs, rhs)),
            UnaryOpcode::Abs
            | UnaryOpcode::Sign
            | UnaryOpcode::Sinh
            | UnaryOpcode::Cosh
            | UnaryOpcode::Tanh => return Err(Error::NotInvertible(op.to_string())),
        };
        Ok(self.unary(inverse, rhs))
    }

    /// Returns `x` such that `op(x, other) == rhs` (`side == 0`) or
    /// `op(other, x) == rhs` (`side == 1`)
    fn invert_binary(
        &mut self,
        op: BinaryOpcode,
        side: usize,
        other: Arg<T>,
        rhs: Arg<T>,
    ) -> Arg<T> {
        match (op, side) {
            (BinaryOpcode::Add, _) => self.sub(rhs, other),
            (BinaryOpcode::Sub, 0) => self.add(rhs, other),
            (BinaryOpcode::Sub, _) => self.sub(other, rhs),
            (BinaryOpcode::Mul, _) => self.div(rhs, other),
            (BinaryOpcode::Div, 0) => self.mul(rhs, other),
            (BinaryOpcode::Div, _) => self.div(other, rhs),
            (BinaryOpcode::Pow, 0) => {
                let e = self.div(Arg::Const(T::one()), other);
                self.binary(BinaryOpcode::Pow, rhs, e)
            }
            (BinaryOpcode::Pow, _) => {
                let num = self.unary(UnaryOpcode::Ln, rhs);
                let den = self.unary(UnaryOpcode::Ln, other);
                self.div(num, den)
            }
        }
    }
}
