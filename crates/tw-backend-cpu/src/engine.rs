use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;
use tw_engine::{
    AxisSpec, CompileOptions, Engine, EngineError, FlatFn, ValueAndGradFn, VmapAxes,
};

use crate::tensor::DenseTensor;

/// Default central-difference step.
pub const DEFAULT_EPSILON: f64 = 1e-6;

/// Reference engine over [`DenseTensor`].
///
/// Counters record how often compilation and checkpointing were staged and
/// how often a staged callable was invoked, so callers can observe caching.
#[derive(Debug)]
pub struct CpuEngine {
    epsilon: f64,
    compile_count: AtomicUsize,
    checkpoint_count: AtomicUsize,
    staged_calls: Arc<AtomicUsize>,
}

impl CpuEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            compile_count: AtomicUsize::new(0),
            checkpoint_count: AtomicUsize::new(0),
            staged_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    #[must_use]
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Number of [`Engine::compile`] calls.
    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.compile_count.load(Ordering::Relaxed)
    }

    /// Number of [`Engine::checkpoint`] calls.
    #[must_use]
    pub fn checkpoint_count(&self) -> usize {
        self.checkpoint_count.load(Ordering::Relaxed)
    }

    /// Number of invocations of compiled or checkpointed callables.
    #[must_use]
    pub fn staged_calls(&self) -> usize {
        self.staged_calls.load(Ordering::Relaxed)
    }

    fn staged(&self, f: FlatFn<DenseTensor>) -> FlatFn<DenseTensor> {
        let calls = Arc::clone(&self.staged_calls);
        Arc::new(move |inputs: &[DenseTensor]| {
            calls.fetch_add(1, Ordering::Relaxed);
            f(inputs)
        })
    }
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn scalar_loss(outputs: &[DenseTensor]) -> Result<f64, EngineError> {
    let first = outputs.first().ok_or(EngineError::EmptyOutput)?;
    first.as_scalar().ok_or_else(|| EngineError::NonScalarOutput {
        shape: first.shape().to_vec(),
    })
}

fn check_positions(inputs: &[DenseTensor], positions: &[usize]) -> Result<(), EngineError> {
    match positions.iter().find(|&&position| position >= inputs.len()) {
        Some(&position) => Err(EngineError::ArityMismatch {
            expected: position + 1,
            actual: inputs.len(),
        }),
        None => Ok(()),
    }
}

fn check_like(
    op: &'static str,
    reference: &[DenseTensor],
    other: &[DenseTensor],
) -> Result<(), EngineError> {
    if reference.len() != other.len() {
        return Err(EngineError::ArityMismatch {
            expected: reference.len(),
            actual: other.len(),
        });
    }
    for (a, b) in reference.iter().zip(other) {
        if a.shape() != b.shape() {
            return Err(EngineError::ShapeMismatch {
                op,
                left: a.shape().to_vec(),
                right: b.shape().to_vec(),
            });
        }
    }
    Ok(())
}

/// Central differences of the scalar first output with respect to every
/// element of the inputs at `positions`.
fn finite_diff_grads(
    f: &FlatFn<DenseTensor>,
    inputs: &[DenseTensor],
    positions: &[usize],
    epsilon: f64,
) -> Result<Vec<DenseTensor>, EngineError> {
    check_positions(inputs, positions)?;
    let mut perturbed = inputs.to_vec();
    let mut grads = Vec::with_capacity(positions.len());
    for &position in positions {
        let mut grad = DenseTensor::zeros(inputs[position].shape().to_vec());
        for element in 0..inputs[position].len() {
            let original = inputs[position].data()[element];
            perturbed[position].data_mut()[element] = original + epsilon;
            let plus = scalar_loss(&f(&perturbed)?)?;
            perturbed[position].data_mut()[element] = original - epsilon;
            let minus = scalar_loss(&f(&perturbed)?)?;
            perturbed[position].data_mut()[element] = original;
            grad.data_mut()[element] = (plus - minus) / (2.0 * epsilon);
        }
        grads.push(grad);
    }
    Ok(grads)
}

fn displaced(
    primals: &[DenseTensor],
    direction: &[DenseTensor],
    step: f64,
) -> Vec<DenseTensor> {
    primals
        .iter()
        .zip(direction)
        .map(|(p, d)| {
            let mut out = p.clone();
            for (x, dx) in out.data_mut().iter_mut().zip(d.data()) {
                *x += step * dx;
            }
            out
        })
        .collect()
}

fn dot(a: &DenseTensor, b: &DenseTensor) -> f64 {
    a.data().iter().zip(b.data()).map(|(x, y)| x * y).sum()
}

impl Engine for CpuEngine {
    type Tensor = DenseTensor;

    fn name(&self) -> &str {
        "cpu"
    }

    fn grad(
        &self,
        f: FlatFn<DenseTensor>,
        diff_positions: &[usize],
    ) -> Result<FlatFn<DenseTensor>, EngineError> {
        trace!(positions = diff_positions.len(), "staging finite-difference grad");
        let positions = diff_positions.to_vec();
        let epsilon = self.epsilon;
        Ok(Arc::new(move |inputs: &[DenseTensor]| {
            finite_diff_grads(&f, inputs, &positions, epsilon)
        }))
    }

    fn value_and_grad(
        &self,
        f: FlatFn<DenseTensor>,
        diff_positions: &[usize],
    ) -> Result<ValueAndGradFn<DenseTensor>, EngineError> {
        trace!(positions = diff_positions.len(), "staging finite-difference value_and_grad");
        let positions = diff_positions.to_vec();
        let epsilon = self.epsilon;
        Ok(Arc::new(move |inputs: &[DenseTensor]| -> Result<_, EngineError> {
            check_positions(inputs, &positions)?;
            let outputs = f(inputs)?;
            scalar_loss(&outputs)?;
            let grads = finite_diff_grads(&f, inputs, &positions, epsilon)?;
            Ok((outputs, grads))
        }))
    }

    fn compile(
        &self,
        f: FlatFn<DenseTensor>,
        options: &CompileOptions<DenseTensor>,
    ) -> Result<FlatFn<DenseTensor>, EngineError> {
        let count = self.compile_count.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(
            count,
            shapeless = options.shapeless,
            state_inputs = options.inputs.len(),
            state_outputs = options.outputs.len(),
            "staging compiled callable"
        );
        Ok(self.staged(f))
    }

    fn checkpoint(&self, f: FlatFn<DenseTensor>) -> Result<FlatFn<DenseTensor>, EngineError> {
        let count = self.checkpoint_count.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(count, "staging checkpointed callable");
        Ok(self.staged(f))
    }

    fn jvp(
        &self,
        f: FlatFn<DenseTensor>,
        primals: &[DenseTensor],
        tangents: &[DenseTensor],
    ) -> Result<(Vec<DenseTensor>, Vec<DenseTensor>), EngineError> {
        check_like("jvp", primals, tangents)?;
        let outputs = f(primals)?;
        let plus = f(&displaced(primals, tangents, self.epsilon))?;
        let minus = f(&displaced(primals, tangents, -self.epsilon))?;
        check_like("jvp", &outputs, &plus)?;
        check_like("jvp", &outputs, &minus)?;
        let denom = 2.0 * self.epsilon;
        let tangents_out = plus
            .iter()
            .zip(&minus)
            .map(|(p, m)| {
                let data = p
                    .data()
                    .iter()
                    .zip(m.data())
                    .map(|(a, b)| (a - b) / denom)
                    .collect();
                DenseTensor::new(p.shape().to_vec(), data)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((outputs, tangents_out))
    }

    fn vjp(
        &self,
        f: FlatFn<DenseTensor>,
        primals: &[DenseTensor],
        cotangents: &[DenseTensor],
    ) -> Result<(Vec<DenseTensor>, Vec<DenseTensor>), EngineError> {
        let outputs = f(primals)?;
        check_like("vjp", &outputs, cotangents)?;
        let epsilon = self.epsilon;
        let weighted = |values: &[DenseTensor]| -> Result<f64, EngineError> {
            let out = f(values)?;
            check_like("vjp", cotangents, &out)?;
            Ok(out.iter().zip(cotangents).map(|(o, c)| dot(o, c)).sum())
        };
        let mut perturbed = primals.to_vec();
        let mut input_cotangents = Vec::with_capacity(primals.len());
        for position in 0..primals.len() {
            let mut grad = DenseTensor::zeros(primals[position].shape().to_vec());
            for element in 0..primals[position].len() {
                let original = primals[position].data()[element];
                perturbed[position].data_mut()[element] = original + epsilon;
                let plus = weighted(&perturbed)?;
                perturbed[position].data_mut()[element] = original - epsilon;
                let minus = weighted(&perturbed)?;
                perturbed[position].data_mut()[element] = original;
                grad.data_mut()[element] = (plus - minus) / (2.0 * epsilon);
            }
            input_cotangents.push(grad);
        }
        Ok((outputs, input_cotangents))
    }

    fn vmap(
        &self,
        f: FlatFn<DenseTensor>,
        in_axes: &[AxisSpec],
        out_axes: &VmapAxes,
    ) -> Result<FlatFn<DenseTensor>, EngineError> {
        trace!(inputs = in_axes.len(), "staging loop-and-stack vmap");
        let in_axes = in_axes.to_vec();
        let out_axes = out_axes.clone();
        Ok(Arc::new(move |inputs: &[DenseTensor]| {
            vmap_loop_and_stack(&f, inputs, &in_axes, &out_axes)
        }))
    }

    fn ones_like(&self, tensor: &DenseTensor) -> DenseTensor {
        tensor.ones_like()
    }

    fn shape_of(&self, tensor: &DenseTensor) -> Vec<usize> {
        tensor.shape().to_vec()
    }
}

fn resolve_axis(spec: AxisSpec, rank: usize) -> Result<Option<usize>, EngineError> {
    match spec {
        AxisSpec::NotBatched => Ok(None),
        AxisSpec::Batched(axis) => spec
            .resolve(rank)
            .map(Some)
            .ok_or(EngineError::AxisOutOfBounds { axis, rank }),
    }
}

fn vmap_loop_and_stack(
    f: &FlatFn<DenseTensor>,
    inputs: &[DenseTensor],
    in_axes: &[AxisSpec],
    out_axes: &VmapAxes,
) -> Result<Vec<DenseTensor>, EngineError> {
    if inputs.len() != in_axes.len() {
        return Err(EngineError::ArityMismatch {
            expected: in_axes.len(),
            actual: inputs.len(),
        });
    }

    let mut resolved = Vec::with_capacity(inputs.len());
    let mut batch_size: Option<usize> = None;
    for (input, spec) in inputs.iter().zip(in_axes) {
        let axis = resolve_axis(*spec, input.rank())?;
        if let Some(axis) = axis {
            let size = input.shape()[axis];
            match batch_size {
                Some(expected) if expected != size => {
                    return Err(EngineError::BatchSizeMismatch {
                        expected,
                        actual: size,
                    });
                }
                _ => batch_size = Some(size),
            }
        }
        resolved.push(axis);
    }
    let batch_size = batch_size.ok_or(EngineError::NoBatchedInput)?;

    let mut per_output: Vec<Vec<DenseTensor>> = Vec::new();
    for index in 0..batch_size {
        let mapped = inputs
            .iter()
            .zip(&resolved)
            .map(|(input, axis)| match axis {
                Some(axis) => input.slice_along(*axis, index),
                None => Ok(input.clone()),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = f(&mapped)?;
        if index == 0 {
            per_output = vec![Vec::with_capacity(batch_size); outputs.len()];
        } else if outputs.len() != per_output.len() {
            return Err(EngineError::InconsistentOutputArity {
                expected: per_output.len(),
                actual: outputs.len(),
            });
        }
        for (slot, value) in per_output.iter_mut().zip(outputs) {
            slot.push(value);
        }
    }

    per_output
        .into_iter()
        .enumerate()
        .map(|(index, values)| match out_axes.spec_for(index) {
            AxisSpec::NotBatched => values.into_iter().next().ok_or(EngineError::EmptyOutput),
            spec @ AxisSpec::Batched(axis) => {
                let rank = values.first().map_or(0, DenseTensor::rank) + 1;
                let target = spec
                    .resolve(rank)
                    .ok_or(EngineError::AxisOutOfBounds { axis, rank })?;
                DenseTensor::stack_along(&values, target)
            }
        })
        .collect()
}
