use tw_cache::CacheError;
use tw_core::{ErrorKind, SelectionError, TreeError};
use tw_engine::EngineError;

#[derive(Debug)]
pub enum ApiError {
    Tree(TreeError),
    Selection(SelectionError),
    Engine(EngineError),
    Cache(CacheError),
    /// A differentiated function returned something other than a tensor or a
    /// sequence starting with one.
    LossNotArray { found: &'static str },
    /// A value that must be a tensor or a sequence of tensors was not.
    UnexpectedOutput {
        context: &'static str,
        found: &'static str,
    },
    CustomKeywordArguments,
    AxesCountMismatch { expected: usize, actual: usize },
    /// A batched input has no elements along its batch axis.
    EmptyBatch { leaf: usize, axis: usize },
    /// An error raised by user code inside a transformed function.
    User { message: String },
}

impl ApiError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Tree(err) => err.kind(),
            Self::Selection(err) => err.kind(),
            Self::Engine(err) => err.kind(),
            Self::Cache(err) => err.kind(),
            Self::UnexpectedOutput { .. } => ErrorKind::Type,
            Self::LossNotArray { .. }
            | Self::CustomKeywordArguments
            | Self::AxesCountMismatch { .. }
            | Self::EmptyBatch { .. }
            | Self::User { .. } => ErrorKind::Argument,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree(err) => write!(f, "{err}"),
            Self::Selection(err) => write!(f, "{err}"),
            Self::Engine(err) => write!(f, "engine error: {err}"),
            Self::Cache(err) => write!(f, "{err}"),
            Self::LossNotArray { found } => write!(
                f,
                "function must return a tensor or a sequence whose first element is a tensor (got {found})"
            ),
            Self::UnexpectedOutput { context, found } => {
                write!(
                    f,
                    "{context} must be a tensor or a sequence of tensors (got {found})"
                )
            }
            Self::CustomKeywordArguments => write!(
                f,
                "custom-function transforms currently support positional arguments only"
            ),
            Self::AxesCountMismatch { expected, actual } => {
                write!(
                    f,
                    "in_axes has {actual} entries but {expected} positional arguments were provided"
                )
            }
            Self::EmptyBatch { leaf, axis } => write!(
                f,
                "vmap needs a non-empty batch, but input leaf {leaf} has size 0 along axis {axis}"
            ),
            Self::User { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tree(err) => Some(err),
            Self::Selection(err) => Some(err),
            Self::Engine(err) => Some(err),
            Self::Cache(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TreeError> for ApiError {
    fn from(value: TreeError) -> Self {
        Self::Tree(value)
    }
}

impl From<SelectionError> for ApiError {
    fn from(value: SelectionError) -> Self {
        Self::Selection(value)
    }
}

impl From<CacheError> for ApiError {
    fn from(value: CacheError) -> Self {
        Self::Cache(value)
    }
}

/// Errors raised by a lifted function travel through the engine as
/// [`EngineError::Callback`]; they come back out unchanged here.
impl From<EngineError> for ApiError {
    fn from(value: EngineError) -> Self {
        match value {
            EngineError::Callback(inner) => match inner.downcast::<ApiError>() {
                Ok(original) => *original,
                Err(other) => Self::Engine(EngineError::Callback(other)),
            },
            other => Self::Engine(other),
        }
    }
}
