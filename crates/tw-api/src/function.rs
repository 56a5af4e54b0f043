use std::sync::Arc;

use tw_core::{CallArgs, Tree};

use crate::custom::CustomFunction;
use crate::errors::ApiError;

/// A host function over trees.
pub type TreeFn<T> = Arc<dyn Fn(&CallArgs<T>) -> Result<Tree<T>, ApiError> + Send + Sync>;

/// The function handed to a transform: a plain closure, or a
/// [`CustomFunction`] whose derivative overrides take precedence.
pub struct Function<T> {
    body: TreeFn<T>,
    custom: Option<CustomFunction<T>>,
}

impl<T> Clone for Function<T> {
    fn clone(&self) -> Self {
        Self {
            body: Arc::clone(&self.body),
            custom: self.custom.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Function<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("custom", &self.custom)
            .finish_non_exhaustive()
    }
}

impl<T> Function<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&CallArgs<T>) -> Result<Tree<T>, ApiError> + Send + Sync + 'static,
    {
        Self {
            body: Arc::new(f),
            custom: None,
        }
    }

    pub fn call(&self, args: &CallArgs<T>) -> Result<Tree<T>, ApiError> {
        (self.body)(args)
    }

    #[must_use]
    pub fn custom(&self) -> Option<&CustomFunction<T>> {
        self.custom.as_ref()
    }
}

impl<T> From<CustomFunction<T>> for Function<T> {
    fn from(value: CustomFunction<T>) -> Self {
        Self {
            body: value.body(),
            custom: Some(value),
        }
    }
}

impl<T> From<&CustomFunction<T>> for Function<T> {
    fn from(value: &CustomFunction<T>) -> Self {
        Self::from(value.clone())
    }
}
