//! CPU reference engine for the tree transform layer.
//!
//! Tensors are dense row-major `f64` buffers. Differentiation uses central
//! finite differences and vmap loops over the batch and stacks the results,
//! so every transform works for any host function without tracing it.

#![forbid(unsafe_code)]

mod engine;
pub mod ops;
mod tensor;

pub use engine::{CpuEngine, DEFAULT_EPSILON};
pub use tensor::DenseTensor;
