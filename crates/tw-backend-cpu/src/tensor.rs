use tw_engine::EngineError;

/// A dense row-major `f64` tensor. Rank 0 is a scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl DenseTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, EngineError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EngineError::ShapeMismatch {
                op: "from_vec",
                left: shape,
                right: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    #[must_use]
    pub fn vector(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: values,
        }
    }

    /// Builds a rank-2 tensor from equal-length rows.
    pub fn matrix(rows: &[&[f64]]) -> Result<Self, EngineError> {
        let cols = rows.first().map_or(0, |row| row.len());
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(EngineError::ShapeMismatch {
                    op: "matrix",
                    left: vec![cols],
                    right: vec![row.len()],
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            shape: vec![rows.len(), cols],
            data,
        })
    }

    #[must_use]
    pub fn full(shape: Vec<usize>, value: f64) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![value; len],
        }
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    #[must_use]
    pub fn ones_like(&self) -> Self {
        Self::full(self.shape.clone(), 1.0)
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The value of a single-element tensor.
    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self.data.as_slice() {
            [value] => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().copied().map(f).collect(),
        }
    }

    /// The `index`-th slice along `axis`, with that axis removed.
    pub fn slice_along(&self, axis: usize, index: usize) -> Result<Self, EngineError> {
        let Some(&dim) = self.shape.get(axis) else {
            return Err(EngineError::AxisOutOfBounds {
                axis: i32::try_from(axis).unwrap_or(i32::MAX),
                rank: self.rank(),
            });
        };
        if index >= dim {
            return Err(EngineError::BatchSizeMismatch {
                expected: dim,
                actual: index + 1,
            });
        }
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        let mut data = Vec::with_capacity(outer * inner);
        for block in 0..outer {
            let start = (block * dim + index) * inner;
            data.extend_from_slice(&self.data[start..start + inner]);
        }
        let mut shape = self.shape.clone();
        shape.remove(axis);
        Ok(Self { shape, data })
    }

    /// Stacks equally shaped tensors along a new `axis`.
    pub fn stack_along(slices: &[Self], axis: usize) -> Result<Self, EngineError> {
        let Some(first) = slices.first() else {
            return Err(EngineError::EmptyOutput);
        };
        if axis > first.rank() {
            return Err(EngineError::AxisOutOfBounds {
                axis: i32::try_from(axis).unwrap_or(i32::MAX),
                rank: first.rank() + 1,
            });
        }
        for slice in &slices[1..] {
            if slice.shape != first.shape {
                return Err(EngineError::ShapeMismatch {
                    op: "stack",
                    left: first.shape.clone(),
                    right: slice.shape.clone(),
                });
            }
        }
        let outer: usize = first.shape[..axis].iter().product();
        let inner: usize = first.shape[axis..].iter().product();
        let mut data = Vec::with_capacity(first.len() * slices.len());
        for block in 0..outer {
            for slice in slices {
                data.extend_from_slice(&slice.data[block * inner..(block + 1) * inner]);
            }
        }
        let mut shape = first.shape.clone();
        shape.insert(axis, slices.len());
        Ok(Self { shape, data })
    }
}

impl From<f64> for DenseTensor {
    fn from(value: f64) -> Self {
        Self::scalar(value)
    }
}

impl From<Vec<f64>> for DenseTensor {
    fn from(value: Vec<f64>) -> Self {
        Self::vector(value)
    }
}
