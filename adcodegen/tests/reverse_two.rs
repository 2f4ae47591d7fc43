mod common;

use adcodegen::{
    codegen::{ModelCodegen, Settings},
    emit::TextEmitter,
    graph::{LoopCount, Op},
    loops::{reverse2::ReverseTwo, LoopModel},
    tape::{ExprTape, Tape, TapeBuilder},
    Error,
};
use approx::assert_relative_eq;
use std::collections::BTreeMap;
use std::sync::Arc;

fn build(elements: &BTreeMap<usize, Vec<usize>>) -> Result<ReverseTwo<f64>, Error> {
    ReverseTwo::build(
        "LoopedModel",
        common::DOMAIN,
        common::RANGE,
        elements,
        &[common::loop_model()],
        Some(&common::no_loop_model()),
    )
}

fn check(
    r: &ReverseTwo<f64>,
    flat: &dyn Tape<f64>,
    elements: &BTreeMap<usize, Vec<usize>>,
    seed: u64,
) {
    let x = common::random_point(seed, flat.domain());
    let py = common::random_point(seed + 100, flat.range());
    let tx1 = 0.5 + seed as f64;
    let inputs = common::reverse_two_inputs(&x, tx1, &py);

    let actual = r.evaluate(&inputs).unwrap();
    let expected = common::reference_hessian(flat, &x, tx1, &py, elements);
    assert_eq!(actual.len(), expected.len());
    for (a, b) in actual.iter().zip(&expected) {
        assert_relative_eq!(*a, *b, epsilon = 1e-10, max_relative = 1e-10);
    }
}

#[test]
fn matches_flat_model() {
    let flat = common::reference();
    let elements = common::hessian_elements(&flat);
    let r = build(&elements).unwrap();
    for seed in 0..4 {
        check(&r, &flat, &elements, seed);
    }

    // Temporaries and the equation outside of loops contribute to x5
    let nl = r.no_loop().unwrap();
    assert_eq!(nl.rows().collect::<Vec<_>>(), [5]);
    let d = &r.dispatch().rows[&5];
    assert_eq!(d.len, elements[&5].len());
    assert!(d.calls.iter().any(|c| !c.takes_row));
    assert!(d.calls.iter().any(|c| c.takes_row));
}

#[test]
fn lower_triangle() {
    let flat = common::reference();
    let elements: BTreeMap<usize, Vec<usize>> = common::hessian_elements(&flat)
        .into_iter()
        .map(|(r, cols)| {
            let lower = cols.into_iter().filter(|c| *c <= r).rev();
            (r, lower.collect::<Vec<_>>())
        })
        .filter(|(_, cols)| !cols.is_empty())
        .collect();
    let r = build(&elements).unwrap();
    check(&r, &flat, &elements, 11);
}

#[test]
fn unknown_row_is_empty() {
    let flat = common::reference();
    let elements = common::hessian_elements(&flat);
    let r = build(&elements).unwrap();
    let inputs = common::reverse_two_inputs(
        &common::random_point(0, common::DOMAIN),
        1.0,
        &common::random_point(1, common::RANGE),
    );
    assert!(r.evaluate_row(42, &inputs).unwrap().is_empty());
    assert!(matches!(
        r.evaluate(&inputs[1..]),
        Err(Error::BadSliceLength { .. })
    ));
}

#[test]
fn repeated_column() {
    let mut elements = BTreeMap::new();
    elements.insert(1, vec![0, 2, 0]);
    assert_eq!(
        build(&elements).err(),
        Some(Error::RepeatedElement { row: 1, col: 0 })
    );
}

#[test]
fn temporaries_require_no_loop_model() {
    let mut elements = BTreeMap::new();
    elements.insert(1, vec![2]);
    let r = ReverseTwo::build(
        "m",
        common::DOMAIN,
        common::RANGE,
        &elements,
        &[common::loop_model()],
        None,
    );
    assert_eq!(r.err(), Some(Error::MissingTemporaries(0)));
}

/// `y_it = x_{it / 2}² * x3`, for `it` in `0..5`
fn staircase() -> (LoopModel<f64>, ExprTape<f64>) {
    let mut t = TapeBuilder::<f64>::new();
    let v = t.inputs(2);
    let aa = t.mul(v[0], v[0]);
    let y = t.mul(aa, v[1]);
    let tape: Arc<dyn Tape<f64>> = Arc::new(t.finish(vec![y]).unwrap());
    let model = LoopModel::new(
        0,
        tape,
        5,
        vec![(0..5).map(Some).collect()],
        vec![vec![0, 0, 1, 1, 2]],
        vec![3],
        vec![],
    )
    .unwrap();

    let mut t = TapeBuilder::<f64>::new();
    let x = t.inputs(4);
    let ys = (0..5)
        .map(|it| {
            let aa = t.mul(x[it / 2], x[it / 2]);
            t.mul(aa, x[3])
        })
        .collect();
    (model, t.finish(ys).unwrap())
}

#[test]
fn data_dependent_loop_counts() {
    let (model, flat) = staircase();
    let mut elements = BTreeMap::new();
    for r in 0..3 {
        elements.insert(r, vec![r, 3]);
    }
    elements.insert(3, vec![0, 1, 2]);

    let r = ReverseTwo::build("staircase", 4, 5, &elements, &[model], None).unwrap();
    for seed in 0..3 {
        check(&r, &flat, &elements, seed);
    }

    // Rows 0 and 1 read two iterations each, row 2 only one
    let g = r
        .groups()
        .iter()
        .find(|g| g.group().jrow_iterations.len() == 3)
        .unwrap();
    assert_eq!(
        g.group().jrow_iterations.values().map(|s| s.len()).collect::<Vec<_>>(),
        [2, 2, 1]
    );
    let graph = g.graph();
    assert!(graph.nodes().any(|(n, d)| {
        d.op == Op::LoopStart
            && matches!(graph.loop_count(n), Some(LoopCount::Indexed(..)))
    }));
}

fn codegen() -> ModelCodegen<f64> {
    ModelCodegen::new(
        Settings {
            name: "LoopedModel".to_owned(),
            reuse_ids: true,
        },
        common::DOMAIN,
        common::RANGE,
        vec![common::loop_model()],
        Some(common::no_loop_model()),
    )
    .unwrap()
}

#[test]
fn sources() {
    let flat = common::reference();
    let elements = common::hessian_elements(&flat);
    let a = codegen()
        .reverse_two_sources(&elements, &TextEmitter::new())
        .unwrap();
    let b = codegen()
        .reverse_two_sources(&elements, &TextEmitter::new())
        .unwrap();
    assert_eq!(a.functions, b.functions);

    assert!(a.functions.contains_key("looped_model_sparse_reverse_two"));
    assert!(a.functions.contains_key("looped_model_sparse_reverse_two_sparsity"));
    assert!(
        a.functions
            .contains_key("looped_model_sparse_reverse_two_noloop_indep5")
    );
    let dispatch = &a.functions["looped_model_sparse_reverse_two"];
    for name in a.functions.keys().filter(|k| k.contains("_loop0_g")) {
        assert!(dispatch.contains(name.as_str()), "{name} is never called");
    }
}

#[test]
fn deterministic_groups() {
    let flat = common::reference();
    let elements = common::hessian_elements(&flat);
    let a = build(&elements).unwrap();
    let b = build(&elements).unwrap();
    assert_eq!(a.dispatch(), b.dispatch());
    let groups = |r: &ReverseTwo<f64>| {
        r.groups()
            .iter()
            .map(|g| (g.name().to_owned(), g.group().clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(groups(&a), groups(&b));
}
