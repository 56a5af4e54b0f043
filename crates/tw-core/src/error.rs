//! Error taxonomy shared by every crate in the workspace.
//!
//! Three classes of failure exist and all are fail-fast:
//! structural/type errors, usage errors and internal invariant violations.

/// Coarse classification of a failure, independent of which crate raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A value of the wrong kind was found while walking a tree.
    Type,
    /// The caller asked for something the call cannot satisfy.
    Argument,
    /// A reconstruction or bookkeeping invariant was broken inside the layer.
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Type => "type",
            Self::Argument => "argument",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// Strict flattening met something other than a tensor leaf or container.
    NonTensorLeaf { path: String, found: &'static str },
    /// Non-strict flattening met a value that is neither a leaf, a container
    /// nor a supported constant.
    UnsupportedLeaf { path: String, type_name: String },
    /// Inflation ran past the end of the flat leaf list.
    LeafUnderflow { cursor: usize, available: usize },
    /// Inflation finished without consuming exactly the provided leaves.
    LeafCountMismatch {
        context: &'static str,
        consumed: usize,
        provided: usize,
    },
    /// A whole-call tree did not have the `[positional, keyword]` layout.
    MalformedCallTree { found: &'static str },
    /// Two trees walked in lockstep disagree in structure.
    StructureMismatch { path: String, detail: String },
    /// Two leaves collided during a merge with no merge function.
    MergeConflict { path: String },
}

impl TreeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NonTensorLeaf { .. } | Self::UnsupportedLeaf { .. } => ErrorKind::Type,
            Self::StructureMismatch { .. } | Self::MergeConflict { .. } => ErrorKind::Argument,
            Self::LeafUnderflow { .. }
            | Self::LeafCountMismatch { .. }
            | Self::MalformedCallTree { .. } => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonTensorLeaf { path, found } => {
                write!(
                    f,
                    "tree must contain only tensor leaves: found {found} at {path}"
                )
            }
            Self::UnsupportedLeaf { path, type_name } => {
                write!(
                    f,
                    "unsupported leaf type for compiled/checkpointed trees: {type_name} at {path} \
                     (expected tensors or constants: null, bool, number, string, symbol)"
                )
            }
            Self::LeafUnderflow { cursor, available } => {
                write!(
                    f,
                    "internal reconstruction underflow: leaf {cursor} requested but only {available} provided"
                )
            }
            Self::LeafCountMismatch {
                context,
                consumed,
                provided,
            } => {
                write!(
                    f,
                    "internal {context} reconstruction mismatch: consumed {consumed} of {provided} leaves"
                )
            }
            Self::MalformedCallTree { found } => {
                write!(
                    f,
                    "internal call reconstruction mismatch: expected [positional, keyword] pair, found {found}"
                )
            }
            Self::StructureMismatch { path, detail } => {
                write!(f, "tree structure mismatch at {path}: {detail}")
            }
            Self::MergeConflict { path } => {
                write!(f, "merge function required when merging leaf values at {path}")
            }
        }
    }
}

impl std::error::Error for TreeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    NoTarget,
    NegativePosition { position: i64 },
    DuplicatePosition { position: usize },
    DuplicateName { name: String },
    PositionOutOfRange { position: usize, provided: usize },
    MissingKeyword { name: String },
    /// A selected argument could not be flattened strictly.
    Target { target: String, source: TreeError },
}

impl SelectionError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Target { source, .. } => source.kind(),
            _ => ErrorKind::Argument,
        }
    }
}

impl std::fmt::Display for SelectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTarget => write!(f, "gradient requested with respect to no argument"),
            Self::NegativePosition { position } => {
                write!(f, "argument positions cannot be negative (got {position})")
            }
            Self::DuplicatePosition { position } => {
                write!(f, "duplicate argument position {position} is not allowed")
            }
            Self::DuplicateName { name } => {
                write!(f, "duplicate argument name '{name}' is not allowed")
            }
            Self::PositionOutOfRange { position, provided } => {
                write!(
                    f,
                    "cannot compute gradient for positional argument {position} when only {provided} were provided"
                )
            }
            Self::MissingKeyword { name } => {
                write!(
                    f,
                    "cannot compute gradient for keyword argument '{name}' because it was not provided"
                )
            }
            Self::Target { target, source } => write!(f, "{target}: {source}"),
        }
    }
}

impl std::error::Error for SelectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Target { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<TreeError> for SelectionError {
    fn from(value: TreeError) -> Self {
        Self::Target {
            target: "selection".to_owned(),
            source: value,
        }
    }
}
