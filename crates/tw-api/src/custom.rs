//! Functions carrying user-supplied derivative and batching rules.
//!
//! Rules operate on flat tensor lists. Clones of a [`CustomFunction`] share
//! their rule slots, so a rule set after a transform was built still applies
//! to it.

use std::sync::{Arc, PoisonError, RwLock};

use tw_core::{CallArgs, Tree};
use tw_engine::AxisSpec;

use crate::errors::ApiError;
use crate::function::TreeFn;

/// `(primals, cotangents, outputs) -> input cotangents`.
pub type VjpRule<T> = Arc<dyn Fn(&[T], &[T], &[T]) -> Result<Vec<T>, ApiError> + Send + Sync>;

/// `(primals, tangents) -> output tangents`.
pub type JvpRule<T> = Arc<dyn Fn(&[T], &[T]) -> Result<Vec<T>, ApiError> + Send + Sync>;

/// `(inputs, in_axes) -> (outputs, out_axes)`.
pub type VmapRule<T> =
    Arc<dyn Fn(&[T], &[AxisSpec]) -> Result<(Vec<T>, Vec<AxisSpec>), ApiError> + Send + Sync>;

struct Rules<T> {
    vjp: Option<VjpRule<T>>,
    jvp: Option<JvpRule<T>>,
    vmap: Option<VmapRule<T>>,
}

pub struct CustomFunction<T> {
    body: TreeFn<T>,
    rules: Arc<RwLock<Rules<T>>>,
}

impl<T> Clone for CustomFunction<T> {
    fn clone(&self) -> Self {
        Self {
            body: Arc::clone(&self.body),
            rules: Arc::clone(&self.rules),
        }
    }
}

impl<T> std::fmt::Debug for CustomFunction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomFunction")
            .field("vjp", &self.has_custom_vjp())
            .field("jvp", &self.has_custom_jvp())
            .field("vmap", &self.has_custom_vmap())
            .finish()
    }
}

impl<T> CustomFunction<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&CallArgs<T>) -> Result<Tree<T>, ApiError> + Send + Sync + 'static,
    {
        Self {
            body: Arc::new(f),
            rules: Arc::new(RwLock::new(Rules {
                vjp: None,
                jvp: None,
                vmap: None,
            })),
        }
    }

    /// Calls the wrapped function; rules play no part here.
    pub fn call(&self, args: &CallArgs<T>) -> Result<Tree<T>, ApiError> {
        (self.body)(args)
    }

    pub(crate) fn body(&self) -> TreeFn<T> {
        Arc::clone(&self.body)
    }

    fn read<R>(&self, f: impl FnOnce(&Rules<T>) -> R) -> R {
        f(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write(&self, f: impl FnOnce(&mut Rules<T>)) {
        f(&mut self.rules.write().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn set_vjp<F>(&self, rule: F)
    where
        F: Fn(&[T], &[T], &[T]) -> Result<Vec<T>, ApiError> + Send + Sync + 'static,
    {
        self.write(|rules| rules.vjp = Some(Arc::new(rule)));
    }

    pub fn set_jvp<F>(&self, rule: F)
    where
        F: Fn(&[T], &[T]) -> Result<Vec<T>, ApiError> + Send + Sync + 'static,
    {
        self.write(|rules| rules.jvp = Some(Arc::new(rule)));
    }

    pub fn set_vmap<F>(&self, rule: F)
    where
        F: Fn(&[T], &[AxisSpec]) -> Result<(Vec<T>, Vec<AxisSpec>), ApiError>
            + Send
            + Sync
            + 'static,
    {
        self.write(|rules| rules.vmap = Some(Arc::new(rule)));
    }

    pub fn clear_vjp(&self) {
        self.write(|rules| rules.vjp = None);
    }

    pub fn clear_jvp(&self) {
        self.write(|rules| rules.jvp = None);
    }

    pub fn clear_vmap(&self) {
        self.write(|rules| rules.vmap = None);
    }

    #[must_use]
    pub fn has_custom_vjp(&self) -> bool {
        self.read(|rules| rules.vjp.is_some())
    }

    #[must_use]
    pub fn has_custom_jvp(&self) -> bool {
        self.read(|rules| rules.jvp.is_some())
    }

    #[must_use]
    pub fn has_custom_vmap(&self) -> bool {
        self.read(|rules| rules.vmap.is_some())
    }

    #[must_use]
    pub fn vjp_rule(&self) -> Option<VjpRule<T>> {
        self.read(|rules| rules.vjp.clone())
    }

    #[must_use]
    pub fn jvp_rule(&self) -> Option<JvpRule<T>> {
        self.read(|rules| rules.jvp.clone())
    }

    #[must_use]
    pub fn vmap_rule(&self) -> Option<VmapRule<T>> {
        self.read(|rules| rules.vmap.clone())
    }
}
