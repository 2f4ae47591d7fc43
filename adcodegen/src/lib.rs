//! Loop-aware source generation for algorithmic differentiation graphs.
//!
//! Operations recorded by an AD engine are stored in a [`Graph`].  A
//! [`Handler`] decides the evaluation order of the nodes needed by a
//! function, which nodes get their own variable, and which temporary, array
//! or atomic ids they use; an [`Emitter`](emit::Emitter) then turns the
//! resulting [`Schedule`](handler::Schedule) into source text.
//!
//! ```
//! use adcodegen::{emit::{Emitter, TextEmitter}, Graph, Handler};
//!
//! let mut g = Graph::<f64>::new();
//! let x = g.independents(2);
//! let s = g.add(x[0], x[1]);
//! let y = g.mul(s, s);
//!
//! let mut handler = Handler::new(g);
//! let mut emitter = TextEmitter::new();
//! let mut atomics = vec![];
//! let schedule = handler.generate(&[y], &[], &emitter, &mut atomics)?;
//! let src = emitter.emit("square", &handler, &schedule)?;
//! assert!(src.starts_with("fn square"));
//! # Ok::<(), adcodegen::Error>(())
//! ```
//!
//! Models whose equations repeat over iterations are described by
//! [`LoopModel`](loops::LoopModel)s.  The assemblers in [`loops`] build
//! sparse Jacobians and Hessian rows of such models with one loop body per
//! pattern of repeated equations, using [`IndexPattern`]s to map iterations
//! to variables and output locations.  [`codegen::ModelCodegen`] ties
//! everything together.
//!
//! # Features
#![doc = document_features::document_features!()]
pub mod codegen;
pub mod emit;
pub mod eval;
pub mod graph;
pub mod handler;
pub mod jobs;
pub mod loops;
pub mod naming;
pub mod pattern;
pub mod tape;

mod error;

pub use error::Error;
pub use graph::{Arg, Graph, Node};
pub use handler::Handler;
pub use pattern::IndexPattern;

#[cfg(test)]
mod test {
    use super::*;
    use crate::emit::{Emitter, TextEmitter};

    static_assertions::assert_impl_all!(Graph<f64>: Send);

    #[test]
    fn it_works() {
        let mut g = Graph::<f64>::new();
        let x = g.independents(2);
        let a = g.add(x[0], Arg::Const(0.0));
        assert_eq!(a, Arg::Node(x[0]));
        let b = g.mul(x[1], Arg::Const(1.0));
        assert_eq!(b, Arg::Node(x[1]));
        let c = g.mul(x[1], Arg::Const(0.0));
        assert!(c.is_zero());

        let y = g.mul(a, b);
        assert_eq!(g.eval(y, &[2.0, 3.0]).unwrap(), 6.0);

        let mut h = Handler::new(g);
        let mut e = TextEmitter::new();
        let s = h.generate(&[y], &[], &e, &mut vec![]).unwrap();
        assert_eq!(s.order, [y.node().unwrap()]);
        let src = e.emit("f", &h, &s).unwrap();
        assert!(src.contains("x[0]"));
    }
}
