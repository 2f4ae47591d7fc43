//! Names of generated functions
//!
//! Every name starts with the model name, normalized to snake case, followed
//! by the purpose of the function:
//! - `{model}_{purpose}` for the entry point,
//! - `{model}_{purpose}_loop{id}_g{group}` for a loop row group,
//! - `{model}_{purpose}_noloop_indep{j}` for a row outside of loops,
//! - `{model}_{purpose}_sparsity` for the sparsity pattern.
use heck::ToSnakeCase;

/// Purpose of sparse Jacobian functions
pub const SPARSE_JACOBIAN: &str = "sparse_jacobian";

/// Purpose of sparse second-order reverse mode (Hessian row) functions
pub const SPARSE_REVERSE_TWO: &str = "sparse_reverse_two";

/// Normalizes a model name
pub fn model_name(name: &str) -> String {
    name.to_snake_case()
}

pub fn function(model: &str, purpose: &str) -> String {
    format!("{}_{purpose}", model_name(model))
}

pub fn loop_group_function(
    model: &str,
    purpose: &str,
    loop_id: usize,
    group: usize,
) -> String {
    format!("{}_loop{loop_id}_g{group}", function(model, purpose))
}

pub fn no_loop_row_function(model: &str, purpose: &str, j: usize) -> String {
    format!("{}_noloop_indep{j}", function(model, purpose))
}

pub fn sparsity_function(model: &str, purpose: &str) -> String {
    format!("{}_sparsity", function(model, purpose))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(
            loop_group_function("HeatModel", SPARSE_REVERSE_TWO, 2, 0),
            "heat_model_sparse_reverse_two_loop2_g0"
        );
        assert_eq!(
            no_loop_row_function("heat model", SPARSE_REVERSE_TWO, 7),
            "heat_model_sparse_reverse_two_noloop_indep7"
        );
        assert_eq!(
            sparsity_function("model", SPARSE_JACOBIAN),
            "model_sparse_jacobian_sparsity"
        );
        assert_eq!(function("model", SPARSE_JACOBIAN), "model_sparse_jacobian");
    }
}
