use std::sync::{Arc, OnceLock};

use tracing::{debug, trace};
use tw_cache::{CacheError, CacheLookup, CallSignature, OutputSlot, TransformCache};
use tw_core::{
    CallArgs, DiffTargets, Gradients, LeafPolicy, Selections, Tree, TreeDef, TreeError,
    TreePath, flatten, flatten_call, flatten_into, inflate_call, inflate_exact, select,
};
use tw_engine::{AxisSpec, CompileOptions, Engine, EngineError, FlatFn, VmapAxes};

use crate::custom::{CustomFunction, VmapRule};
use crate::errors::ApiError;
use crate::function::Function;

type Tensor<E> = <E as Engine>::Tensor;

/// Wraps a tree-level step as an engine callable; errors ride through the
/// engine as callbacks and are recovered by `From<EngineError>`.
fn host_fn<T, F>(f: F) -> FlatFn<T>
where
    T: 'static,
    F: Fn(&[T]) -> Result<Vec<T>, ApiError> + Send + Sync + 'static,
{
    Arc::new(move |flat: &[T]| f(flat).map_err(EngineError::callback))
}

fn check_loss<T>(output: &Tree<T>) -> Result<(), ApiError> {
    match output {
        Tree::Leaf(_) => Ok(()),
        Tree::Sequence(items) if items.first().is_some_and(Tree::is_leaf) => Ok(()),
        other => Err(ApiError::LossNotArray {
            found: other.kind_name(),
        }),
    }
}

/// The loss of a grad-style function: the output itself, or the first
/// element of an output sequence.
fn extract_loss<T>(output: Tree<T>) -> Result<T, ApiError> {
    check_loss(&output)?;
    match output {
        Tree::Leaf(loss) => Ok(loss),
        Tree::Sequence(items) => items
            .into_iter()
            .next()
            .and_then(Tree::into_leaf)
            .ok_or(ApiError::LossNotArray { found: "sequence" }),
        other => Err(ApiError::LossNotArray {
            found: other.kind_name(),
        }),
    }
}

/// Accepts a tensor or a sequence of tensors.
fn leaf_list<T: Clone>(value: &Tree<T>, context: &'static str) -> Result<Vec<T>, ApiError> {
    match value {
        Tree::Leaf(leaf) => Ok(vec![leaf.clone()]),
        Tree::Sequence(items) => items
            .iter()
            .map(|item| {
                item.as_leaf()
                    .cloned()
                    .ok_or(ApiError::UnexpectedOutput {
                        context,
                        found: item.kind_name(),
                    })
            })
            .collect(),
        other => Err(ApiError::UnexpectedOutput {
            context,
            found: other.kind_name(),
        }),
    }
}

/// One tensor is returned bare, several as a sequence.
fn bare_or_sequence<T>(mut leaves: Vec<T>) -> Tree<T> {
    if leaves.len() == 1
        && let Some(leaf) = leaves.pop()
    {
        return Tree::Leaf(leaf);
    }
    Tree::Sequence(leaves.into_iter().map(Tree::Leaf).collect())
}

fn positional_leaves<T: Clone>(args: &CallArgs<T>) -> Result<Vec<T>, ApiError> {
    if !args.keyword.is_empty() {
        return Err(ApiError::CustomKeywordArguments);
    }
    args.positional
        .iter()
        .enumerate()
        .map(|(index, arg)| {
            arg.as_leaf().cloned().ok_or_else(|| {
                ApiError::Tree(TreeError::NonTensorLeaf {
                    path: TreePath::positional(index).to_string(),
                    found: arg.kind_name(),
                })
            })
        })
        .collect()
}

fn recorded_output<'a>(slot: &'a OutputSlot, context: &str) -> Result<&'a TreeDef, ApiError> {
    slot.get().ok_or_else(|| {
        ApiError::Cache(CacheError::MissingOutputStructure {
            key: context.to_owned(),
        })
    })
}

/// Gradient through a custom vjp rule: cotangents are ones, gradients cover
/// every positional argument.
fn custom_vjp_value_and_grad<E: Engine>(
    engine: &E,
    custom: &CustomFunction<Tensor<E>>,
    args: &CallArgs<Tensor<E>>,
) -> Result<Option<(Tree<Tensor<E>>, Gradients<Tensor<E>>)>, ApiError> {
    let Some(rule) = custom.vjp_rule() else {
        return Ok(None);
    };
    debug!(engine = engine.name(), "dispatching to custom vjp rule");
    let primals = positional_leaves(args)?;
    let value = custom.call(args)?;
    let outputs = leaf_list(&value, "custom function output")?;
    let cotangents: Vec<_> = outputs.iter().map(|out| engine.ones_like(out)).collect();
    let grads = rule(&primals, &cotangents, &outputs)?;
    Ok(Some((value, Gradients::Positional(bare_or_sequence(grads)))))
}

pub struct GradWrapped<E: Engine> {
    engine: Arc<E>,
    function: Function<E::Tensor>,
    targets: DiffTargets,
}

pub struct ValueAndGradWrapped<E: Engine> {
    engine: Arc<E>,
    function: Function<E::Tensor>,
    targets: DiffTargets,
}

/// Gradient of `function` with respect to positional argument 0 unless
/// [`GradWrapped::with_targets`] says otherwise.
pub fn grad<E: Engine>(
    engine: Arc<E>,
    function: impl Into<Function<E::Tensor>>,
) -> GradWrapped<E> {
    GradWrapped {
        engine,
        function: function.into(),
        targets: DiffTargets::default(),
    }
}

pub fn value_and_grad<E: Engine>(
    engine: Arc<E>,
    function: impl Into<Function<E::Tensor>>,
) -> ValueAndGradWrapped<E> {
    ValueAndGradWrapped {
        engine,
        function: function.into(),
        targets: DiffTargets::default(),
    }
}

impl<E: Engine> std::fmt::Debug for GradWrapped<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradWrapped")
            .field("engine", &self.engine.name())
            .field("function", &self.function)
            .field("targets", &self.targets)
            .finish()
    }
}

impl<E: Engine> std::fmt::Debug for ValueAndGradWrapped<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueAndGradWrapped")
            .field("engine", &self.engine.name())
            .field("function", &self.function)
            .field("targets", &self.targets)
            .finish()
    }
}

impl<E: Engine> GradWrapped<E> {
    #[must_use]
    pub fn with_targets(mut self, targets: DiffTargets) -> Self {
        self.targets = targets;
        self
    }

    #[must_use]
    pub fn targets(&self) -> &DiffTargets {
        &self.targets
    }

    pub fn call(&self, args: &CallArgs<E::Tensor>) -> Result<Gradients<E::Tensor>, ApiError> {
        if let Some(custom) = self.function.custom()
            && let Some((_, grads)) = custom_vjp_value_and_grad(self.engine.as_ref(), custom, args)?
        {
            return Ok(grads);
        }

        let (selections, leaves) = select(args, &self.targets)?;
        trace!(
            selected = selections.len(),
            leaves = leaves.len(),
            "grad selection"
        );
        let selections = Arc::new(selections);
        let lifted = {
            let function = self.function.clone();
            let call = Arc::new(args.clone());
            let selections = Arc::clone(&selections);
            host_fn(move |flat: &[E::Tensor]| {
                let substituted = selections.substitute(&call, flat)?;
                Ok(vec![extract_loss(function.call(&substituted)?)?])
            })
        };
        let staged = self.engine.grad(lifted, &selections.diff_positions())?;
        let flat_grads = staged(&leaves)?;
        Ok(selections.rebuild_gradients(&flat_grads)?)
    }
}

impl<E: Engine> ValueAndGradWrapped<E> {
    #[must_use]
    pub fn with_targets(mut self, targets: DiffTargets) -> Self {
        self.targets = targets;
        self
    }

    #[must_use]
    pub fn targets(&self) -> &DiffTargets {
        &self.targets
    }

    /// Returns the full function output alongside the gradients of its loss.
    ///
    /// The forward pass runs inside the engine only; the output tree is
    /// rebuilt from the flat outputs the engine hands back. Outputs holding
    /// opaque host objects cannot cross the engine, so their value is taken
    /// from one more host call.
    pub fn call(
        &self,
        args: &CallArgs<E::Tensor>,
    ) -> Result<(Tree<E::Tensor>, Gradients<E::Tensor>), ApiError> {
        if let Some(custom) = self.function.custom()
            && let Some(result) = custom_vjp_value_and_grad(self.engine.as_ref(), custom, args)?
        {
            return Ok(result);
        }

        let (selections, leaves) = select(args, &self.targets)?;
        trace!(
            selected = selections.len(),
            leaves = leaves.len(),
            "value_and_grad selection"
        );
        let selections = Arc::new(selections);
        let plan = Arc::new(OnceLock::<ValuePlan>::new());
        let lifted = {
            let function = self.function.clone();
            let call = Arc::new(args.clone());
            let selections = Arc::clone(&selections);
            let plan = Arc::clone(&plan);
            host_fn(move |flat: &[E::Tensor]| {
                let substituted = selections.substitute(&call, flat)?;
                let value = function.call(&substituted)?;
                check_loss(&value)?;
                match flatten(&value, LeafPolicy::AllowConstants) {
                    Ok((def, out_leaves)) => {
                        let _ = plan.set(ValuePlan::Flat(def));
                        Ok(out_leaves)
                    }
                    Err(TreeError::UnsupportedLeaf { .. }) => {
                        let _ = plan.set(ValuePlan::Host);
                        Ok(vec![extract_loss(value)?])
                    }
                    Err(err) => Err(err.into()),
                }
            })
        };
        let staged = self
            .engine
            .value_and_grad(lifted, &selections.diff_positions())?;
        let (outputs, flat_grads) = staged(&leaves)?;
        let value = match plan.get() {
            Some(ValuePlan::Flat(def)) => inflate_exact(def, &outputs, "output")?,
            Some(ValuePlan::Host) => {
                debug!("output holds host objects, rebuilding value on the host");
                self.function.call(args)?
            }
            None => {
                return Err(ApiError::Cache(CacheError::MissingOutputStructure {
                    key: "value_and_grad".to_owned(),
                }));
            }
        };
        Ok((value, selections.rebuild_gradients(&flat_grads)?))
    }
}

/// How value_and_grad rebuilds the function value after the engine pass.
#[derive(Debug)]
enum ValuePlan {
    /// Every output node flattens; the value is inflated from engine outputs.
    Flat(TreeDef),
    /// The output holds opaque host objects. Only the loss crosses the
    /// engine and the value comes from one more host call.
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageKind {
    Compile,
    Checkpoint,
}

impl StageKind {
    fn label(self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Checkpoint => "checkpoint",
        }
    }
}

/// Shared machinery of compile and checkpoint: one cache entry per distinct
/// call structure and, unless shapeless, per distinct set of leaf shapes.
struct Staged<E: Engine> {
    engine: Arc<E>,
    function: Function<E::Tensor>,
    cache: TransformCache<E::Tensor>,
    kind: StageKind,
}

impl<E: Engine> Staged<E> {
    fn new(engine: Arc<E>, function: Function<E::Tensor>, kind: StageKind) -> Self {
        Self {
            engine,
            function,
            cache: TransformCache::new(kind.label()),
            kind,
        }
    }

    fn lift(&self, call_def: TreeDef, output: OutputSlot) -> FlatFn<E::Tensor> {
        let function = self.function.clone();
        host_fn(move |flat: &[E::Tensor]| {
            let args = inflate_call(&call_def, flat)?;
            let value = function.call(&args)?;
            let (def, out_leaves) = flatten(&value, LeafPolicy::AllowConstants)?;
            output.record(def);
            Ok(out_leaves)
        })
    }

    fn signature(
        &self,
        call_def: TreeDef,
        leaves: &[E::Tensor],
        shapeless: bool,
    ) -> CallSignature {
        if shapeless {
            return CallSignature::shapeless(call_def);
        }
        let shapes = leaves.iter().map(|leaf| self.engine.shape_of(leaf)).collect();
        CallSignature::shaped(call_def, shapes)
    }

    fn call(
        &self,
        args: &CallArgs<E::Tensor>,
        shapeless: bool,
        options: impl FnOnce() -> Result<CompileOptions<E::Tensor>, ApiError>,
    ) -> Result<Tree<E::Tensor>, ApiError> {
        let (call_def, leaves) = flatten_call(args, LeafPolicy::AllowConstants)?;
        let signature = self.signature(call_def, &leaves, shapeless);
        let lookup = self.cache.lookup_or_build(&signature, |output| {
            let lifted = self.lift(signature.structure.clone(), output);
            let staged = match self.kind {
                StageKind::Compile => self.engine.compile(lifted, &options()?)?,
                StageKind::Checkpoint => self.engine.checkpoint(lifted)?,
            };
            Ok::<_, ApiError>(staged)
        })?;

        let (entry, outputs) = match lookup {
            CacheLookup::Hit(entry) => {
                let outputs = entry.call(&leaves)?;
                (entry, outputs)
            }
            CacheLookup::Miss(pending) => {
                let outputs = pending.entry().call(&leaves)?;
                (self.cache.commit(pending)?, outputs)
            }
        };
        Ok(inflate_exact(entry.output_def()?, &outputs, "output")?)
    }
}

/// Ahead-of-time compilation keyed by call structure and leaf shapes.
pub struct CompiledWrapped<E: Engine> {
    staged: Staged<E>,
    inputs: Option<Tree<E::Tensor>>,
    outputs: Option<Tree<E::Tensor>>,
    shapeless: bool,
}

/// Activation checkpointing keyed by call structure and leaf shapes.
pub struct CheckpointWrapped<E: Engine> {
    staged: Staged<E>,
}

pub fn compile<E: Engine>(
    engine: Arc<E>,
    function: impl Into<Function<E::Tensor>>,
) -> CompiledWrapped<E> {
    CompiledWrapped {
        staged: Staged::new(engine, function.into(), StageKind::Compile),
        inputs: None,
        outputs: None,
        shapeless: false,
    }
}

pub fn checkpoint<E: Engine>(
    engine: Arc<E>,
    function: impl Into<Function<E::Tensor>>,
) -> CheckpointWrapped<E> {
    CheckpointWrapped {
        staged: Staged::new(engine, function.into(), StageKind::Checkpoint),
    }
}

impl<E: Engine> std::fmt::Debug for CompiledWrapped<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledWrapped")
            .field("engine", &self.staged.engine.name())
            .field("cache", &self.staged.cache)
            .field("shapeless", &self.shapeless)
            .finish_non_exhaustive()
    }
}

impl<E: Engine> std::fmt::Debug for CheckpointWrapped<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointWrapped")
            .field("engine", &self.staged.engine.name())
            .field("cache", &self.staged.cache)
            .finish_non_exhaustive()
    }
}

fn hint_leaves<T: Clone>(hint: Option<&Tree<T>>) -> Result<Vec<T>, ApiError> {
    let mut leaves = Vec::new();
    if let Some(tree) = hint {
        flatten_into(tree, &mut leaves, LeafPolicy::Strict)?;
    }
    Ok(leaves)
}

impl<E: Engine> CompiledWrapped<E> {
    /// Tensors the compiled function reads as implicit state.
    #[must_use]
    pub fn with_inputs(mut self, inputs: Tree<E::Tensor>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Tensors the compiled function updates as implicit state.
    #[must_use]
    pub fn with_outputs(mut self, outputs: Tree<E::Tensor>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Stages one callable per call structure, whatever the leaf shapes.
    #[must_use]
    pub fn with_shapeless(mut self, shapeless: bool) -> Self {
        self.shapeless = shapeless;
        self
    }

    pub fn call(&self, args: &CallArgs<E::Tensor>) -> Result<Tree<E::Tensor>, ApiError> {
        self.staged.call(args, self.shapeless, || {
            Ok(CompileOptions {
                inputs: hint_leaves(self.inputs.as_ref())?,
                outputs: hint_leaves(self.outputs.as_ref())?,
                shapeless: self.shapeless,
            })
        })
    }

    #[must_use]
    pub fn cache_stats(&self) -> tw_cache::CacheStats {
        self.staged.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.staged.cache.clear();
    }
}

impl<E: Engine> CheckpointWrapped<E> {
    pub fn call(&self, args: &CallArgs<E::Tensor>) -> Result<Tree<E::Tensor>, ApiError> {
        self.staged.call(args, false, || Ok(CompileOptions::default()))
    }

    #[must_use]
    pub fn cache_stats(&self) -> tw_cache::CacheStats {
        self.staged.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.staged.cache.clear();
    }
}

/// Calls `function` with each flat tensor as a positional argument and
/// expects a tensor or a sequence of tensors back.
fn lift_positional<T>(function: Function<T>) -> FlatFn<T>
where
    T: Clone + Send + Sync + 'static,
{
    host_fn(move |flat: &[T]| {
        let args = CallArgs::new(flat.iter().cloned().map(Tree::Leaf).collect());
        leaf_list(&function.call(&args)?, "function output")
    })
}

/// Forward-mode product. Returns `(outputs, output_tangents)` as lists.
pub fn jvp<E: Engine>(
    engine: &E,
    function: impl Into<Function<E::Tensor>>,
    primals: &Tree<E::Tensor>,
    tangents: &Tree<E::Tensor>,
) -> Result<(Vec<E::Tensor>, Vec<E::Tensor>), ApiError> {
    let function = function.into();
    let primals = leaf_list(primals, "primals")?;
    let tangents = leaf_list(tangents, "tangents")?;
    if let Some(custom) = function.custom()
        && let Some(rule) = custom.jvp_rule()
    {
        debug!(engine = engine.name(), "dispatching to custom jvp rule");
        let args = CallArgs::new(primals.iter().cloned().map(Tree::Leaf).collect());
        let outputs = leaf_list(&custom.call(&args)?, "custom function output")?;
        return Ok((outputs, rule(&primals, &tangents)?));
    }
    Ok(engine.jvp(lift_positional(function), &primals, &tangents)?)
}

/// Reverse-mode product. Returns `(outputs, input_cotangents)` as lists.
pub fn vjp<E: Engine>(
    engine: &E,
    function: impl Into<Function<E::Tensor>>,
    primals: &Tree<E::Tensor>,
    cotangents: &Tree<E::Tensor>,
) -> Result<(Vec<E::Tensor>, Vec<E::Tensor>), ApiError> {
    let function = function.into();
    let primals = leaf_list(primals, "primals")?;
    let cotangents = leaf_list(cotangents, "cotangents")?;
    if let Some(custom) = function.custom()
        && let Some(rule) = custom.vjp_rule()
    {
        debug!(engine = engine.name(), "dispatching to custom vjp rule");
        let args = CallArgs::new(primals.iter().cloned().map(Tree::Leaf).collect());
        let outputs = leaf_list(&custom.call(&args)?, "custom function output")?;
        let input_cotangents = rule(&primals, &cotangents, &outputs)?;
        return Ok((outputs, input_cotangents));
    }
    Ok(engine.vjp(lift_positional(function), &primals, &cotangents)?)
}

pub struct VmapWrapped<E: Engine> {
    engine: Arc<E>,
    function: Function<E::Tensor>,
    in_axes: VmapAxes,
    out_axes: VmapAxes,
}

/// Batched mapping over axis 0 of every positional argument by default.
pub fn vmap<E: Engine>(
    engine: Arc<E>,
    function: impl Into<Function<E::Tensor>>,
) -> VmapWrapped<E> {
    VmapWrapped {
        engine,
        function: function.into(),
        in_axes: VmapAxes::default(),
        out_axes: VmapAxes::default(),
    }
}

impl<E: Engine> std::fmt::Debug for VmapWrapped<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmapWrapped")
            .field("engine", &self.engine.name())
            .field("function", &self.function)
            .field("in_axes", &self.in_axes)
            .field("out_axes", &self.out_axes)
            .finish()
    }
}

impl<E: Engine> VmapWrapped<E> {
    /// One spec for all positional arguments, or one per argument. Every
    /// tensor leaf of an argument is batched along the argument's axis.
    #[must_use]
    pub fn with_in_axes(mut self, in_axes: impl Into<VmapAxes>) -> Self {
        self.in_axes = in_axes.into();
        self
    }

    /// One spec for all outputs, or one per output tensor leaf.
    #[must_use]
    pub fn with_out_axes(mut self, out_axes: impl Into<VmapAxes>) -> Self {
        self.out_axes = out_axes.into();
        self
    }

    pub fn call(&self, args: &CallArgs<E::Tensor>) -> Result<Tree<E::Tensor>, ApiError> {
        if let Some(given) = self.in_axes.explicit_len()
            && given != args.positional_len()
        {
            return Err(ApiError::AxesCountMismatch {
                expected: args.positional_len(),
                actual: given,
            });
        }

        if let Some(custom) = self.function.custom()
            && let Some(rule) = custom.vmap_rule()
        {
            return self.call_custom(&rule, args);
        }

        let (call_def, leaves) = flatten_call(args, LeafPolicy::AllowConstants)?;
        let leaf_axes = leaf_axes(&call_def, &self.in_axes)?;
        trace!(
            leaves = leaves.len(),
            batched = leaf_axes.iter().filter(|axis| axis.is_batched()).count(),
            "vmap leaf axes"
        );
        reject_empty_batch(self.engine.as_ref(), &leaves, &leaf_axes)?;

        let output = OutputSlot::new();
        let lifted = {
            let function = self.function.clone();
            let output = output.clone();
            host_fn(move |flat: &[E::Tensor]| {
                let args = inflate_call(&call_def, flat)?;
                let value = function.call(&args)?;
                let (def, out_leaves) = flatten(&value, LeafPolicy::AllowConstants)?;
                output.record(def);
                Ok(out_leaves)
            })
        };
        let staged = self.engine.vmap(lifted, &leaf_axes, &self.out_axes)?;
        let outputs = staged(&leaves)?;
        Ok(inflate_exact(recorded_output(&output, "vmap")?, &outputs, "output")?)
    }

    /// The rule sees one tensor and one axis per positional argument; its
    /// output axes are taken as given.
    fn call_custom(
        &self,
        rule: &VmapRule<E::Tensor>,
        args: &CallArgs<E::Tensor>,
    ) -> Result<Tree<E::Tensor>, ApiError> {
        debug!(engine = self.engine.name(), "dispatching to custom vmap rule");
        let inputs = positional_leaves(args)?;
        let axes: Vec<AxisSpec> = (0..inputs.len())
            .map(|index| self.in_axes.spec_for(index))
            .collect();
        reject_empty_batch(self.engine.as_ref(), &inputs, &axes)?;
        let (outputs, _out_axes) = rule(&inputs, &axes)?;
        Ok(bare_or_sequence(outputs))
    }
}

/// A batch of zero elements never runs the function, so there is no output
/// structure to rebuild.
fn reject_empty_batch<E: Engine>(
    engine: &E,
    leaves: &[E::Tensor],
    axes: &[AxisSpec],
) -> Result<(), ApiError> {
    for (leaf, (tensor, spec)) in leaves.iter().zip(axes).enumerate() {
        let shape = engine.shape_of(tensor);
        if let Some(axis) = spec.resolve(shape.len())
            && shape[axis] == 0
        {
            return Err(ApiError::EmptyBatch { leaf, axis });
        }
    }
    Ok(())
}

/// Expands per-argument axes to one spec per flat leaf of a call; keyword
/// leaves are never batched.
fn leaf_axes(call_def: &TreeDef, in_axes: &VmapAxes) -> Result<Vec<AxisSpec>, ApiError> {
    let (positional, keyword) = call_def.call_parts().ok_or(TreeError::MalformedCallTree {
        found: "descriptor",
    })?;
    let mut axes = Vec::with_capacity(call_def.leaf_count());
    for (index, def) in positional.iter().enumerate() {
        let spec = in_axes.spec_for(index);
        axes.extend(std::iter::repeat_n(spec, def.leaf_count()));
    }
    let keyword_leaves: usize = keyword.iter().map(|(_, def)| def.leaf_count()).sum();
    axes.extend(std::iter::repeat_n(AxisSpec::NotBatched, keyword_leaves));
    Ok(axes)
}

/// A loss `f(params, args)` differentiated with respect to an externally
/// supplied parameter tree.
pub struct ParamsValueAndGrad<E: Engine> {
    engine: Arc<E>,
    loss: Arc<ParamsFn<E::Tensor>>,
}

pub type ParamsFn<T> = dyn Fn(&Tree<T>, &CallArgs<T>) -> Result<Tree<T>, ApiError> + Send + Sync;

pub fn value_and_grad_params<E, F>(engine: Arc<E>, loss: F) -> ParamsValueAndGrad<E>
where
    E: Engine,
    F: Fn(&Tree<E::Tensor>, &CallArgs<E::Tensor>) -> Result<Tree<E::Tensor>, ApiError>
        + Send
        + Sync
        + 'static,
{
    ParamsValueAndGrad {
        engine,
        loss: Arc::new(loss),
    }
}

impl<E: Engine> std::fmt::Debug for ParamsValueAndGrad<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamsValueAndGrad")
            .field("engine", &self.engine.name())
            .finish_non_exhaustive()
    }
}

impl<E: Engine> ParamsValueAndGrad<E> {
    /// Returns `(loss output, parameter gradients)`; the gradient tree has the
    /// structure of `params`.
    pub fn call(
        &self,
        params: &Tree<E::Tensor>,
        args: &CallArgs<E::Tensor>,
    ) -> Result<(Tree<E::Tensor>, Tree<E::Tensor>), ApiError> {
        if params.leaf_count() == 0 {
            trace!("parameter tree has no tensors, skipping engine");
            let value = (self.loss)(params, args)?;
            return Ok((value, Tree::Mapping(Default::default())));
        }

        let loss = Arc::clone(&self.loss);
        let function = Function::new(move |call: &CallArgs<E::Tensor>| {
            let mut positional = call.positional.iter();
            let params = positional.next().ok_or(TreeError::MalformedCallTree {
                found: "empty call",
            })?;
            let rest = CallArgs {
                positional: positional.cloned().collect(),
                keyword: call.keyword.clone(),
            };
            loss(params, &rest)
        });

        let mut positional = Vec::with_capacity(args.positional_len() + 1);
        positional.push(params.clone());
        positional.extend(args.positional.iter().cloned());
        let call = CallArgs {
            positional,
            keyword: args.keyword.clone(),
        };

        let (value, grads) = value_and_grad(Arc::clone(&self.engine), function).call(&call)?;
        Ok((value, grads.into_tree()))
    }
}

#[cfg(test)]
mod tests {
    use super::{bare_or_sequence, extract_loss, leaf_axes, leaf_list};
    use crate::errors::ApiError;
    use tw_core::{CallArgs, LeafPolicy, Tree, flatten_call};
    use tw_engine::{AxisSpec, VmapAxes};

    #[test]
    fn loss_is_first_sequence_leaf() {
        let loss = extract_loss(Tree::sequence([Tree::leaf(1), Tree::int(2)])).expect("loss");
        assert_eq!(loss, 1);
        let err = extract_loss(Tree::<i32>::mapping([("a", Tree::leaf(1))])).expect_err("mapping");
        assert!(matches!(err, ApiError::LossNotArray { found: "mapping" }));
        let err = extract_loss(Tree::<i32>::sequence([])).expect_err("empty");
        assert!(matches!(err, ApiError::LossNotArray { found: "sequence" }));
    }

    #[test]
    fn leaf_lists_reject_nested_values() {
        assert_eq!(leaf_list(&Tree::leaf(1), "primals").expect("leaf"), vec![1]);
        let err = leaf_list(&Tree::sequence([Tree::leaf(1), Tree::int(2)]), "primals")
            .expect_err("constant");
        assert!(matches!(
            err,
            ApiError::UnexpectedOutput {
                context: "primals",
                found: "int"
            }
        ));
        assert_eq!(bare_or_sequence(vec![1]), Tree::leaf(1));
        assert_eq!(
            bare_or_sequence(vec![1, 2]),
            Tree::sequence([Tree::leaf(1), Tree::leaf(2)])
        );
    }

    #[test]
    fn leaf_axes_follow_arguments() {
        let args: CallArgs<i32> = CallArgs::new(vec![
            Tree::sequence([Tree::leaf(1), Tree::leaf(2)]),
            Tree::int(3),
            Tree::leaf(4),
        ])
        .with_kwarg("k", Tree::leaf(5));
        let (def, _) = flatten_call(&args, LeafPolicy::AllowConstants).expect("flatten");
        let axes = leaf_axes(
            &def,
            &VmapAxes::PerArg(vec![
                AxisSpec::Batched(1),
                AxisSpec::NotBatched,
                AxisSpec::Batched(0),
            ]),
        )
        .expect("axes");
        assert_eq!(
            axes,
            vec![
                AxisSpec::Batched(1),
                AxisSpec::Batched(1),
                AxisSpec::Batched(0),
                AxisSpec::NotBatched,
            ]
        );
    }
}
