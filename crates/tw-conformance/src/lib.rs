#![forbid(unsafe_code)]

//! Shared fixtures for the conformance oracles under `tests/`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tw_api::ApiError;
use tw_backend_cpu::{CpuEngine, DenseTensor};
use tw_core::{CallArgs, Tree};

/// Default tolerance when comparing finite-difference results.
pub const GRAD_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureFamily {
    Codec,
    Selection,
    Cache,
    Custom,
    Transform,
}

/// The inputs an oracle ran against, digested into its test log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleFixture {
    pub family: FixtureFamily,
    pub case: String,
    pub inputs: Vec<Vec<f64>>,
}

impl OracleFixture {
    #[must_use]
    pub fn new(family: FixtureFamily, case: impl Into<String>) -> Self {
        Self {
            family,
            case: case.into(),
            inputs: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_input(mut self, values: &[f64]) -> Self {
        self.inputs.push(values.to_vec());
        self
    }
}

#[must_use]
pub fn engine() -> Arc<CpuEngine> {
    Arc::new(CpuEngine::new())
}

#[must_use]
pub fn scalar_leaf(value: f64) -> Tree<DenseTensor> {
    Tree::leaf(DenseTensor::scalar(value))
}

#[must_use]
pub fn vec_leaf(values: &[f64]) -> Tree<DenseTensor> {
    Tree::leaf(DenseTensor::vector(values.to_vec()))
}

/// Element data of a tensor leaf.
#[must_use]
pub fn leaf_values(tree: &Tree<DenseTensor>) -> Option<Vec<f64>> {
    tree.as_leaf().map(|tensor| tensor.data().to_vec())
}

/// Element data of every tensor leaf in depth-first order.
#[must_use]
pub fn all_leaf_values(tree: &Tree<DenseTensor>) -> Vec<f64> {
    tree.leaves()
        .into_iter()
        .flat_map(|tensor| tensor.data().iter().copied())
        .collect()
}

/// Panics unless `actual` and `expected` agree elementwise within `tolerance`.
pub fn assert_close(actual: &[f64], expected: &[f64], tolerance: f64) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch: {actual:?} vs {expected:?}"
    );
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {index}: {a} differs from {e} by more than {tolerance}"
        );
    }
}

pub fn arg_tensor(args: &CallArgs<DenseTensor>, index: usize) -> Result<&DenseTensor, ApiError> {
    args.arg(index)
        .and_then(Tree::as_leaf)
        .ok_or_else(|| ApiError::user(format!("positional argument {index} must be a tensor")))
}

pub fn kwarg_tensor<'a>(
    args: &'a CallArgs<DenseTensor>,
    name: &str,
) -> Result<&'a DenseTensor, ApiError> {
    args.kwarg(name)
        .and_then(Tree::as_leaf)
        .ok_or_else(|| ApiError::user(format!("keyword argument '{name}' must be a tensor")))
}

/// The tensor at `key` of a mapping argument.
pub fn field_tensor<'a>(
    tree: &'a Tree<DenseTensor>,
    key: &str,
) -> Result<&'a DenseTensor, ApiError> {
    tree.get(key)
        .and_then(Tree::as_leaf)
        .ok_or_else(|| ApiError::user(format!("field '{key}' must be a tensor")))
}
