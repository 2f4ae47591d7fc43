//! Rendering scheduled functions into source text
//!
//! The [`Emitter`] trait is the seam between the scheduler and a target
//! language: the handler asks it which nodes need their own variable, then
//! hands it the finished [`Schedule`] to render.  [`TextEmitter`] produces a
//! readable pseudo-code, mostly useful for debugging and tests.
use crate::{
    graph::{Arg, Base, Graph, LoopCount, Node, Op, Storage},
    handler::{Handler, Schedule},
    pattern::IndexPattern,
    Error,
};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write;

/// Plan for assembling a compressed Hessian row from generated functions
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub rows: BTreeMap<usize, RowDispatch>,
}

/// Functions contributing to a single row
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowDispatch {
    /// Number of compressed locations in the row
    pub len: usize,
    pub calls: Vec<DispatchCall>,
}

/// A single function call in a [`RowDispatch`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchCall {
    pub function: String,
    /// Compressed locations written by the call
    pub locations: Vec<usize>,
    /// Whether the function takes the row as an index argument
    pub takes_row: bool,
}

/// Target-language backend
pub trait Emitter<T: Base> {
    /// Checks whether `node` should be evaluated into its own variable
    ///
    /// `total_use` is the number of references to the node in the function
    /// being scheduled.  Statements are always scheduled, regardless of the
    /// answer.
    fn creates_new_variable(
        &self,
        graph: &Graph<T>,
        node: Node,
        total_use: usize,
    ) -> bool {
        let _ = total_use;
        graph.get_op(node).is_some_and(|op| op.storage() != Storage::None)
    }

    /// Checks whether argument `arg` of an `op` must be a variable
    fn requires_variable_argument(&self, op: &Op, arg: usize) -> bool {
        let _ = (op, arg);
        false
    }

    /// Renders a scheduled function
    fn emit(
        &mut self,
        name: &str,
        handler: &Handler<T>,
        schedule: &Schedule<T>,
    ) -> Result<String, Error>;

    /// Renders a function returning a sparsity pattern
    fn emit_sparsity(&mut self, name: &str, rows: &[usize], cols: &[usize])
    -> String;

    /// Renders a function assembling rows from other generated functions
    fn emit_dispatch(&mut self, name: &str, dispatch: &Dispatch) -> String;
}

/// Debug-friendly pseudo-code emitter
#[derive(Clone, Debug, Default)]
pub struct TextEmitter {
    inline_single_use: bool,
}

impl TextEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inlines arithmetic values that are used exactly once
    pub fn with_inlining(mut self, inline: bool) -> Self {
        self.inline_single_use = inline;
        self
    }
}

impl<T: Base> Emitter<T> for TextEmitter {
    fn creates_new_variable(
        &self,
        graph: &Graph<T>,
        node: Node,
        total_use: usize,
    ) -> bool {
        match graph.get_op(node) {
            None => false,
            Some(Op::Unary(..) | Op::Binary(..) | Op::ArrayElement)
                if self.inline_single_use =>
            {
                total_use > 1
            }
            Some(op) => op.storage() != Storage::None,
        }
    }

    fn emit(
        &mut self,
        name: &str,
        handler: &Handler<T>,
        schedule: &Schedule<T>,
    ) -> Result<String, Error> {
        Renderer::new(handler, schedule).render(name)
    }

    fn emit_sparsity(
        &mut self,
        name: &str,
        rows: &[usize],
        cols: &[usize],
    ) -> String {
        format!("fn {name}() {{\n  rows = {rows:?}\n  cols = {cols:?}\n}}\n")
    }

    fn emit_dispatch(&mut self, name: &str, dispatch: &Dispatch) -> String {
        let mut out = format!("fn {name}(x, tx1, py) {{\n");
        for (row, r) in &dispatch.rows {
            writeln!(out, "  row {row}: px[0..{}] = 0", r.len).ok();
            for c in &r.calls {
                let args = if c.takes_row {
                    format!("x, tx1, py, {row}")
                } else {
                    "x, tx1, py".to_owned()
                };
                writeln!(
                    out,
                    "    px[{:?}] += {}({args})",
                    c.locations, c.function
                )
                .ok();
            }
        }
        out += "}\n";
        out
    }
}

struct Renderer<'a, T> {
    handler: &'a Handler<T>,
    graph: &'a Graph<T>,
    schedule: &'a Schedule<T>,
    /// Statements rendered inside a branch rather than at their own position
    deferred: HashSet<Node>,
}

impl<'a, T: Base> Renderer<'a, T> {
    fn new(handler: &'a Handler<T>, schedule: &'a Schedule<T>) -> Self {
        let graph = handler.graph();
        let deferred = schedule
            .order
            .iter()
            .filter(|n| graph.op(**n) == Op::CondResult)
            .flat_map(|n| graph.args(*n)[1..].iter().filter_map(|a| a.node()))
            .collect();
        Self {
            handler,
            graph,
            schedule,
            deferred,
        }
    }

    fn index_name(&self, n: Node) -> String {
        self.graph
            .index_declaration_of(n)
            .and_then(|d| self.graph.index_name(d))
            .unwrap_or("?")
            .to_owned()
    }

    fn variable(&self, n: Node) -> Option<String> {
        let id = self.handler.variable_id(n);
        match self.graph.op(n) {
            Op::Independent => Some(format!("x[{}]", self.graph.info(n)[0])),
            Op::Index => Some(self.index_name(n)),
            op if self.handler.is_scheduled(n) && id > 0 => {
                Some(match op.storage() {
                    Storage::Array => format!("a{id}"),
                    Storage::Atomic => format!("atom{id}"),
                    _ => format!("v{id}"),
                })
            }
            _ => None,
        }
    }

    /// Renders an operand, expanding inlined nodes without recursion
    fn expr(&self, root: Arg<T>) -> String {
        let root = match root {
            Arg::Const(c) => return format!("{c}"),
            Arg::Node(n) => n,
        };
        if let Some(v) = self.variable(root) {
            return v;
        }
        let mut done: HashMap<Node, String> = HashMap::new();
        let mut todo = vec![(root, false)];
        while let Some((n, ready)) = todo.pop() {
            if done.contains_key(&n) {
                continue;
            }
            if let Some(v) = self.variable(n) {
                done.insert(n, v);
                continue;
            }
            if !ready {
                todo.push((n, true));
                for (_, a) in self.graph.arg_nodes(n) {
                    todo.push((a, false));
                }
                continue;
            }
            let s = self.body(n, |a| match a {
                Arg::Const(c) => format!("{c}"),
                Arg::Node(a) => done.get(&a).cloned().unwrap_or_default(),
            });
            done.insert(n, s);
        }
        done.remove(&root).unwrap_or_default()
    }

    /// Renders the right-hand side of a value node
    fn body<F: Fn(Arg<T>) -> String>(&self, n: Node, arg: F) -> String {
        let args = self.graph.args(n);
        match self.graph.op(n) {
            Op::Unary(op) => format!("{op}({})", arg(args[0])),
            Op::Binary(op) => match op.symbol() {
                Some(s) => format!("({} {s} {})", arg(args[0]), arg(args[1])),
                None => format!("{op}({}, {})", arg(args[0]), arg(args[1])),
            },
            Op::Compare(cmp) => format!(
                "({} {cmp} {} ? {} : {})",
                arg(args[0]),
                arg(args[1]),
                arg(args[2]),
                arg(args[3])
            ),
            Op::ArrayElement => {
                format!("{}[{}]", arg(args[0]), self.graph.info(n)[0])
            }
            Op::LoopIndexedIndependent(p) => format!(
                "x[{}]",
                pattern_expr(self.graph.pattern(p), &[arg(args[0])])
            ),
            Op::Alias => {
                format!("out_{}[{}]", arg(args[0]), self.graph.info(n)[0])
            }
            Op::LoopEnd => format!("loop{}", n),
            Op::Print => arg(args[0]),
            op => op.name().to_owned(),
        }
    }

    fn render(&self, name: &str) -> Result<String, Error> {
        let s = self.schedule;
        let mut out = String::new();
        let index_args: Vec<String> = s
            .index_arguments
            .iter()
            .map(|d| self.graph.index_name(*d).unwrap_or("?").to_owned())
            .collect();
        writeln!(
            out,
            "fn {name}(x[{}]{}) {{",
            self.graph.independent_count(),
            index_args
                .iter()
                .map(|i| format!(", {i}"))
                .collect::<String>()
        )
        .ok();
        writeln!(
            out,
            "  // {} temporaries, {} array slots, {} atomic results",
            s.temporary_count, s.array_size, s.atomic_count
        )
        .ok();

        let mut indent = 1;
        for &n in &s.order {
            if self.deferred.contains(&n) {
                continue;
            }
            let lines = self.statement(n, &mut indent)?;
            for (depth, line) in lines {
                writeln!(out, "{}{line}", "  ".repeat(depth)).ok();
            }
        }
        for (i, o) in s.outputs.iter().enumerate() {
            let is_statement = o
                .node()
                .is_some_and(|n| self.graph.op(n).storage() == Storage::None
                    && self.graph.op(n) != Op::Independent);
            if !is_statement {
                writeln!(out, "  y[{i}] = {}", self.expr(*o)).ok();
            }
        }
        out += "}\n";
        Ok(out)
    }

    /// Renders one scheduled node as `(indent, line)` pairs
    fn statement(
        &self,
        n: Node,
        indent: &mut usize,
    ) -> Result<Vec<(usize, String)>, Error> {
        let args = self.graph.args(n);
        let mut lines = vec![];
        match self.graph.op(n) {
            Op::IndexDeclaration | Op::Index | Op::CondStart | Op::CondEnd => {}
            Op::IndexAssign(p) => {
                let idx: Vec<String> = args[1..]
                    .iter()
                    .filter_map(|a| a.node())
                    .map(|a| self.index_name(a))
                    .collect();
                lines.push((
                    *indent,
                    format!(
                        "{} = {}",
                        self.index_name(n),
                        pattern_expr(self.graph.pattern(p), &idx)
                    ),
                ));
            }
            Op::LoopStart => {
                let count = match self.graph.loop_count(n) {
                    Some(LoopCount::Fixed(c)) => c.to_string(),
                    Some(LoopCount::Indexed(i)) => self.index_name(i),
                    None => return Err(Error::BadNode),
                };
                lines.push((
                    *indent,
                    format!("for {} in 0..{count} {{", self.index_name(n)),
                ));
                *indent += 1;
            }
            Op::LoopEnd => {
                *indent = indent.saturating_sub(1).max(1);
                lines.push((*indent, format!("}} // loop{n}")));
            }
            Op::LoopIndexedDependent(p) => {
                lines.push((*indent, self.write(n, p)));
            }
            Op::CondResult => {
                let start = args[0].node().ok_or(Error::BadNode)?;
                let idx = self.graph.args(start)[0]
                    .node()
                    .map(|i| self.index_name(i))
                    .unwrap_or_default();
                let ranges: Vec<String> = self
                    .graph
                    .cond_ranges(start)
                    .into_iter()
                    .map(|(lo, hi)| {
                        if lo == hi {
                            format!("{idx} == {lo}")
                        } else {
                            format!("{lo} <= {idx} <= {hi}")
                        }
                    })
                    .collect();
                lines.push((*indent, format!("if {} {{", ranges.join(" || "))));
                for stmt in args[1..].iter().filter_map(|a| a.node()) {
                    if let Op::LoopIndexedDependent(p) = self.graph.op(stmt) {
                        lines.push((*indent + 1, self.write(stmt, p)));
                    }
                }
                lines.push((*indent, "}".to_owned()));
            }
            Op::Print => {
                let msg = self.graph.message(n).unwrap_or_default();
                lines.push((
                    *indent,
                    format!("print({msg:?}, {})", self.expr(args[0])),
                ));
            }
            Op::ArrayCreation => {
                let id = self.handler.variable_id(n);
                let elems: Vec<String> =
                    args.iter().map(|a| self.expr(*a)).collect();
                lines.push((
                    *indent,
                    format!(
                        "a[{}..{}] = [{}]",
                        id - 1,
                        id - 1 + args.len(),
                        elems.join(", ")
                    ),
                ));
            }
            Op::Atomic(kind) => {
                let name = self.graph.atomic_name(self.graph.info(n)[0])?;
                let ins: Vec<String> =
                    args.iter().map(|a| self.expr(*a)).collect();
                lines.push((
                    *indent,
                    format!(
                        "atom{} = {name}.{kind}({})",
                        self.handler.variable_id(n),
                        ins.join(", ")
                    ),
                ));
            }
            Op::Independent => {}
            _ => {
                let v = self.variable(n).unwrap_or_default();
                let body = self.body(n, |a| self.expr(a));
                lines.push((*indent, format!("{v} = {body}")));
            }
        }
        Ok(lines)
    }

    fn write(&self, n: Node, p: crate::graph::PatternId) -> String {
        let args = self.graph.args(n);
        let idx = args[1].node().map(|i| self.index_name(i)).unwrap_or_default();
        let op = if self.graph.info(n)[0] == 0 { "=" } else { "+=" };
        format!(
            "out[{}] {op} {}",
            pattern_expr(self.graph.pattern(p), &[idx]),
            self.expr(args[0])
        )
    }
}

/// Renders an index pattern applied to the given index names
pub fn pattern_expr(p: &IndexPattern, idx: &[String]) -> String {
    let x = idx.first().map(|s| s.as_str()).unwrap_or("?");
    match p {
        IndexPattern::Linear(l) => {
            if l.dy == 0 {
                return l.b.to_string();
            }
            let mut s = x.to_owned();
            if l.x_offset != 0 {
                s = format!("({s} - {})", l.x_offset);
            }
            if l.dx != 1 {
                s = format!("({s} / {})", l.dx);
            }
            if l.dy != 1 {
                s = format!("{s} * {}", l.dy);
            }
            if l.b != 0 {
                s = format!("{s} + {}", l.b);
            }
            s
        }
        IndexPattern::Sectioned(sections) => {
            let parts: Vec<String> = sections
                .iter()
                .map(|(start, l)| {
                    format!(
                        "{start}: {}",
                        pattern_expr(&IndexPattern::Linear(*l), idx)
                    )
                })
                .collect();
            format!("sections({x}; {})", parts.join(", "))
        }
        IndexPattern::Plane2D { x: f, z: g } => {
            let z = idx.get(1).cloned().unwrap_or_else(|| "?".to_owned());
            let a = f
                .as_ref()
                .map(|f| pattern_expr(f, &[x.to_owned()]))
                .unwrap_or_else(|| "0".to_owned());
            let b = g
                .as_ref()
                .map(|g| pattern_expr(g, &[z]))
                .unwrap_or_else(|| "0".to_owned());
            format!("({a}) + ({b})")
        }
        IndexPattern::Random1D(m) => {
            format!("{:?}[{x}]", m.values().collect::<Vec<_>>())
        }
        IndexPattern::Random2D(..) => {
            let z = idx.get(1).map(|s| s.as_str()).unwrap_or("?");
            format!("table[{x}][{z}]")
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{Accumulate, UnaryOpcode};

    #[test]
    fn render_straight_line() {
        let mut g = Graph::<f64>::new();
        let x0 = g.independent();
        let x1 = g.independent();
        let m = g.mul(x0, x1);
        let y = g.add(m, x0);
        let mut h = Handler::new(g);
        let mut e = TextEmitter::new();
        let s = h.generate(&[y], &[], &e, &mut vec![]).unwrap();
        let src = e.emit("f", &h, &s).unwrap();
        assert!(src.contains("v3 = (x[0] * x[1])"), "{src}");
        assert!(src.contains("v3 = (v3 + x[0])"), "{src}");
        assert!(src.contains("y[0] = v3"), "{src}");
    }

    #[test]
    fn render_inlined() {
        let mut g = Graph::<f64>::new();
        let x = g.independent();
        let s = g.unary(UnaryOpcode::Sin, x);
        let y = g.mul(s, Arg::Const(2.0));
        let mut h = Handler::new(g);
        let mut e = TextEmitter::new().with_inlining(true);
        let sc = h.generate(&[y], &[], &e, &mut vec![]).unwrap();
        let src = e.emit("f", &h, &sc).unwrap();
        assert!(src.contains("v2 = (sin(x[0]) * 2)"), "{src}");
    }

    #[test]
    fn render_loop() {
        let mut g = Graph::<f64>::new();
        let _ = g.independents(3);
        let d = g.index_declaration("j");
        let start = g.loop_start(d, LoopCount::Fixed(3)).unwrap();
        let j = g.index(start).unwrap();
        let xi = g
            .loop_indexed_independent(IndexPattern::detect_slice(&[0, 1, 2]), j)
            .unwrap();
        let v = g.mul(xi, xi);
        let dep = g
            .loop_indexed_dependent(
                v,
                IndexPattern::detect_slice(&[2, 3, 4]),
                j,
                Accumulate::Assign,
            )
            .unwrap();
        let end = g.loop_end(start, vec![dep]).unwrap();
        let mut h = Handler::new(g);
        let mut e = TextEmitter::new();
        let sc = h.generate(&[end.into()], &[], &e, &mut vec![]).unwrap();
        let src = e.emit("f", &h, &sc).unwrap();
        assert!(src.contains("for j in 0..3 {"), "{src}");
        assert!(src.contains("out[j + 2] = v"), "{src}");
        assert!(src.contains("} // loop"), "{src}");
    }

    #[test]
    fn render_sparsity() {
        let src = <TextEmitter as Emitter<f64>>::emit_sparsity(
            &mut TextEmitter::new(),
            "m_jacobian_sparsity",
            &[0, 1],
            &[1, 0],
        );
        assert!(src.contains("rows = [0, 1]"));
    }
}
