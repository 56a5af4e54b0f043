#![forbid(unsafe_code)]

//! The flat-array capability surface a tensor engine exposes.
//!
//! Every transform here works on ordered lists of tensors only; lifting to
//! trees happens one layer up.

mod axes;
mod error;

use std::sync::Arc;

pub use axes::{AxisSpec, VmapAxes};
pub use error::EngineError;

/// A function over a flat list of tensors.
pub type FlatFn<T> = Arc<dyn Fn(&[T]) -> Result<Vec<T>, EngineError> + Send + Sync>;

/// A staged value-and-gradient function returning `(outputs, gradients)`.
pub type ValueAndGradFn<T> =
    Arc<dyn Fn(&[T]) -> Result<(Vec<T>, Vec<T>), EngineError> + Send + Sync>;

pub fn flat_fn<T, F>(f: F) -> FlatFn<T>
where
    F: Fn(&[T]) -> Result<Vec<T>, EngineError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Hints passed to [`Engine::compile`].
///
/// `inputs` and `outputs` are extra tensors the compiled function reads or
/// updates as implicit state.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOptions<T> {
    pub inputs: Vec<T>,
    pub outputs: Vec<T>,
    pub shapeless: bool,
}

impl<T> Default for CompileOptions<T> {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            shapeless: false,
        }
    }
}

/// Uniform interface for tensor engines.
///
/// Gradients are always taken of the first output of `f`, which must be a
/// scalar tensor.
pub trait Engine: Send + Sync {
    type Tensor: Clone + std::fmt::Debug + Send + Sync + 'static;

    /// Human-readable engine name (e.g. "cpu").
    fn name(&self) -> &str;

    /// Stages a function returning the gradients of the first output of `f`
    /// with respect to the inputs at `diff_positions`.
    fn grad(
        &self,
        f: FlatFn<Self::Tensor>,
        diff_positions: &[usize],
    ) -> Result<FlatFn<Self::Tensor>, EngineError>;

    /// Like [`Engine::grad`], also returning all outputs of the forward pass.
    fn value_and_grad(
        &self,
        f: FlatFn<Self::Tensor>,
        diff_positions: &[usize],
    ) -> Result<ValueAndGradFn<Self::Tensor>, EngineError>;

    fn compile(
        &self,
        f: FlatFn<Self::Tensor>,
        options: &CompileOptions<Self::Tensor>,
    ) -> Result<FlatFn<Self::Tensor>, EngineError>;

    /// Stages a function whose intermediates are recomputed rather than
    /// stored when differentiated.
    fn checkpoint(&self, f: FlatFn<Self::Tensor>) -> Result<FlatFn<Self::Tensor>, EngineError>;

    /// Forward-mode product; returns `(outputs, output_tangents)`.
    fn jvp(
        &self,
        f: FlatFn<Self::Tensor>,
        primals: &[Self::Tensor],
        tangents: &[Self::Tensor],
    ) -> Result<(Vec<Self::Tensor>, Vec<Self::Tensor>), EngineError>;

    /// Reverse-mode product; returns `(outputs, input_cotangents)`.
    fn vjp(
        &self,
        f: FlatFn<Self::Tensor>,
        primals: &[Self::Tensor],
        cotangents: &[Self::Tensor],
    ) -> Result<(Vec<Self::Tensor>, Vec<Self::Tensor>), EngineError>;

    /// Stages a batched version of `f`; `in_axes` has one entry per input.
    fn vmap(
        &self,
        f: FlatFn<Self::Tensor>,
        in_axes: &[AxisSpec],
        out_axes: &VmapAxes,
    ) -> Result<FlatFn<Self::Tensor>, EngineError>;

    fn ones_like(&self, tensor: &Self::Tensor) -> Self::Tensor;

    /// Dimensions of `tensor`; shape-specialized staging keys on these.
    fn shape_of(&self, tensor: &Self::Tensor) -> Vec<usize>;
}
