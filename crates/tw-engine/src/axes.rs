/// Which axis of an input or output carries the batch for vmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisSpec {
    /// Batched along the given axis; negative values count from the end.
    Batched(i32),
    /// Not batched; the same value is broadcast to every batch element.
    NotBatched,
}

impl AxisSpec {
    /// Resolves a possibly negative axis against `rank`.
    ///
    /// Returns `None` for `NotBatched` and for axes outside `0..rank`.
    #[must_use]
    pub fn resolve(self, rank: usize) -> Option<usize> {
        match self {
            Self::NotBatched => None,
            Self::Batched(axis) => {
                let rank = i64::try_from(rank).ok()?;
                let axis = i64::from(axis);
                let resolved = if axis < 0 { rank + axis } else { axis };
                if (0..rank).contains(&resolved) {
                    usize::try_from(resolved).ok()
                } else {
                    None
                }
            }
        }
    }

    #[must_use]
    pub fn is_batched(self) -> bool {
        matches!(self, Self::Batched(_))
    }
}

/// In-axes or out-axes for vmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmapAxes {
    /// Same axis for every input/output.
    Uniform(AxisSpec),
    /// One axis per input/output.
    PerArg(Vec<AxisSpec>),
}

impl Default for VmapAxes {
    fn default() -> Self {
        Self::Uniform(AxisSpec::Batched(0))
    }
}

impl VmapAxes {
    /// Axis for the `index`-th entry; missing per-entry specs default to 0.
    #[must_use]
    pub fn spec_for(&self, index: usize) -> AxisSpec {
        match self {
            Self::Uniform(spec) => *spec,
            Self::PerArg(specs) => specs.get(index).copied().unwrap_or(AxisSpec::Batched(0)),
        }
    }

    /// Number of explicit entries, if per-entry.
    #[must_use]
    pub fn explicit_len(&self) -> Option<usize> {
        match self {
            Self::Uniform(_) => None,
            Self::PerArg(specs) => Some(specs.len()),
        }
    }
}

impl From<AxisSpec> for VmapAxes {
    fn from(value: AxisSpec) -> Self {
        Self::Uniform(value)
    }
}

impl From<Vec<AxisSpec>> for VmapAxes {
    fn from(value: Vec<AxisSpec>) -> Self {
        Self::PerArg(value)
    }
}
