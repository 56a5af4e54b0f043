use tw_core::ErrorKind;

#[derive(Debug)]
pub enum EngineError {
    /// An error raised by the function being transformed, passed through
    /// untouched so the caller can recover it.
    Callback(Box<dyn std::error::Error + Send + Sync>),
    ArityMismatch { expected: usize, actual: usize },
    ShapeMismatch {
        op: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    /// The first output of a differentiated function was not a scalar.
    NonScalarOutput { shape: Vec<usize> },
    EmptyOutput,
    AxisOutOfBounds { axis: i32, rank: usize },
    BatchSizeMismatch { expected: usize, actual: usize },
    /// vmap was asked to batch a call in which no input is batched.
    NoBatchedInput,
    InconsistentOutputArity { expected: usize, actual: usize },
    Execution { detail: String },
}

impl EngineError {
    pub fn callback(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Callback(Box::new(err))
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ArityMismatch { .. }
            | Self::ShapeMismatch { .. }
            | Self::NonScalarOutput { .. }
            | Self::EmptyOutput
            | Self::AxisOutOfBounds { .. }
            | Self::BatchSizeMismatch { .. }
            | Self::NoBatchedInput => ErrorKind::Argument,
            Self::Callback(_) | Self::InconsistentOutputArity { .. } | Self::Execution { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callback(inner) => write!(f, "transformed function failed: {inner}"),
            Self::ArityMismatch { expected, actual } => {
                write!(f, "arity mismatch: expected {expected} inputs, got {actual}")
            }
            Self::ShapeMismatch { op, left, right } => {
                write!(f, "shape mismatch in {op}: {left:?} vs {right:?}")
            }
            Self::NonScalarOutput { shape } => {
                write!(
                    f,
                    "gradient requires a scalar first output, got shape {shape:?}"
                )
            }
            Self::EmptyOutput => write!(f, "function returned no outputs"),
            Self::AxisOutOfBounds { axis, rank } => {
                write!(f, "axis {axis} is out of bounds for rank {rank}")
            }
            Self::BatchSizeMismatch { expected, actual } => {
                write!(
                    f,
                    "vmap batch size mismatch: expected {expected}, got {actual}"
                )
            }
            Self::NoBatchedInput => write!(f, "vmap requires at least one batched input"),
            Self::InconsistentOutputArity { expected, actual } => {
                write!(
                    f,
                    "output arity changed across batch elements: expected {expected}, got {actual}"
                )
            }
            Self::Execution { detail } => write!(f, "execution failed: {detail}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Callback(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EngineError;
    use tw_core::ErrorKind;

    #[derive(Debug, PartialEq)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn callback_errors_can_be_recovered() {
        let err = EngineError::callback(Boom);
        assert!(err.to_string().contains("boom"));
        let EngineError::Callback(inner) = err else {
            panic!("expected callback variant");
        };
        let recovered = inner.downcast::<Boom>().expect("downcast to original");
        assert_eq!(*recovered, Boom);
    }

    #[test]
    fn shape_errors_are_usage_errors() {
        let err = EngineError::ShapeMismatch {
            op: "add",
            left: vec![2],
            right: vec![3],
        };
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert!(err.to_string().contains("[2] vs [3]"));
    }
}
