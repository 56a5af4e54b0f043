#![forbid(unsafe_code)]

//! Tree-aware function transforms over a pluggable [`Engine`].
//!
//! Arguments and results are nested trees of tensors and constants; each
//! transform flattens them, hands the engine a function over flat tensor
//! lists, and rebuilds trees from what comes back.

pub mod custom;
pub mod errors;
pub mod function;
pub mod transforms;

pub use custom::{CustomFunction, JvpRule, VjpRule, VmapRule};
pub use errors::ApiError;
pub use function::{Function, TreeFn};
pub use transforms::{
    CheckpointWrapped, CompiledWrapped, GradWrapped, ParamsFn, ParamsValueAndGrad,
    ValueAndGradWrapped, VmapWrapped,
};
pub use transforms::{
    checkpoint, compile, grad, jvp, value_and_grad, value_and_grad_params, vjp, vmap,
};

pub use tw_core::{CallArgs, DiffTargets, Gradients, Tree};
pub use tw_engine::{AxisSpec, Engine, VmapAxes};
