mod common;

use adcodegen::{
    codegen::{ModelCodegen, Settings},
    emit::TextEmitter,
    loops::jacobian::SparseJacobian,
    Error,
};
use approx::assert_relative_eq;

fn codegen() -> ModelCodegen<f64> {
    ModelCodegen::new(
        Settings {
            name: "LoopedModel".to_owned(),
            ..Settings::default()
        },
        common::DOMAIN,
        common::RANGE,
        vec![common::loop_model()],
        Some(common::no_loop_model()),
    )
    .unwrap()
}

#[test]
fn matches_flat_model() {
    let flat = common::reference();
    let (rows, cols) = common::jacobian_elements(&flat);
    let c = codegen();
    let jac = c.sparse_jacobian(&rows, &cols).unwrap();

    for seed in 0..4 {
        let x = common::random_point(seed, common::DOMAIN);
        let actual = jac.evaluate(&x).unwrap();
        let expected = common::reference_jacobian(&flat, &x, &rows, &cols);
        assert_eq!(actual.len(), expected.len());
        for (a, b) in actual.iter().zip(&expected) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }
}

#[test]
fn element_order_is_preserved() {
    let flat = common::reference();
    let (mut rows, mut cols) = common::jacobian_elements(&flat);
    rows.reverse();
    cols.reverse();
    let jac = codegen().sparse_jacobian(&rows, &cols).unwrap();
    let x = common::random_point(7, common::DOMAIN);
    let actual = jac.evaluate(&x).unwrap();
    let expected = common::reference_jacobian(&flat, &x, &rows, &cols);
    for (a, b) in actual.iter().zip(&expected) {
        assert_relative_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn partially_requested_column() {
    // dg0/da is only requested on iterations 0 and 1
    let flat = common::reference();
    let (rows, cols) = common::jacobian_elements(&flat);
    let (rows, cols): (Vec<usize>, Vec<usize>) = rows
        .into_iter()
        .zip(cols)
        .filter(|e| *e != (2, 3))
        .unzip();
    let r = SparseJacobian::build(
        common::DOMAIN,
        &rows,
        &cols,
        &[common::loop_model()],
        Some(&common::no_loop_model()),
    );
    let e = r.unwrap_err();
    assert!(
        matches!(
            e,
            Error::MissingIteration {
                loop_id: 0,
                equation: 2,
                iteration: 2,
                ..
            }
        ),
        "unexpected error: {e:?}"
    );
    assert!(e.to_string().contains("must be requested for all"));
}

#[test]
fn repeated_element() {
    let flat = common::reference();
    let (mut rows, mut cols) = common::jacobian_elements(&flat);
    rows.push(rows[3]);
    cols.push(cols[3]);
    let r = codegen().sparse_jacobian(&rows, &cols);
    assert_eq!(
        r.err(),
        Some(Error::RepeatedElement {
            row: rows[3],
            col: cols[3]
        })
    );
}

#[test]
fn temporaries_require_no_loop_model() {
    let r = SparseJacobian::build(
        common::DOMAIN,
        &[0],
        &[5],
        &[common::loop_model()],
        None,
    );
    assert_eq!(r.err(), Some(Error::MissingTemporaries(0)));
}

#[test]
fn deterministic_sources() {
    let flat = common::reference();
    let (rows, cols) = common::jacobian_elements(&flat);
    let a = codegen()
        .jacobian_sources(&rows, &cols, &TextEmitter::new())
        .unwrap();
    let b = codegen()
        .jacobian_sources(&rows, &cols, &TextEmitter::new())
        .unwrap();
    assert_eq!(a.functions, b.functions);
    assert_eq!(
        a.functions.keys().collect::<Vec<_>>(),
        ["looped_model_sparse_jacobian", "looped_model_sparse_jacobian_sparsity"]
    );
}
