//! Elementwise and reduction kernels over [`DenseTensor`].
//!
//! Binary elementwise ops broadcast a single-element operand against the
//! other; any other shape disagreement is an error.

use tw_engine::EngineError;

use crate::tensor::DenseTensor;

fn zip_with(
    op: &'static str,
    lhs: &DenseTensor,
    rhs: &DenseTensor,
    f: impl Fn(f64, f64) -> f64,
) -> Result<DenseTensor, EngineError> {
    if lhs.shape() == rhs.shape() {
        let data = lhs
            .data()
            .iter()
            .zip(rhs.data())
            .map(|(a, b)| f(*a, *b))
            .collect();
        return DenseTensor::new(lhs.shape().to_vec(), data);
    }
    if let Some(b) = rhs.as_scalar()
        && rhs.rank() == 0
    {
        return Ok(lhs.map(|a| f(a, b)));
    }
    if let Some(a) = lhs.as_scalar()
        && lhs.rank() == 0
    {
        return Ok(rhs.map(|b| f(a, b)));
    }
    Err(EngineError::ShapeMismatch {
        op,
        left: lhs.shape().to_vec(),
        right: rhs.shape().to_vec(),
    })
}

pub fn add(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<DenseTensor, EngineError> {
    zip_with("add", lhs, rhs, |a, b| a + b)
}

pub fn sub(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<DenseTensor, EngineError> {
    zip_with("sub", lhs, rhs, |a, b| a - b)
}

pub fn mul(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<DenseTensor, EngineError> {
    zip_with("mul", lhs, rhs, |a, b| a * b)
}

#[must_use]
pub fn scale(tensor: &DenseTensor, factor: f64) -> DenseTensor {
    tensor.map(|x| x * factor)
}

#[must_use]
pub fn add_scalar(tensor: &DenseTensor, offset: f64) -> DenseTensor {
    tensor.map(|x| x + offset)
}

#[must_use]
pub fn square(tensor: &DenseTensor) -> DenseTensor {
    tensor.map(|x| x * x)
}

/// Sum of all elements as a rank-0 tensor.
#[must_use]
pub fn sum(tensor: &DenseTensor) -> DenseTensor {
    DenseTensor::scalar(tensor.data().iter().sum())
}

/// Joins tensors along axis 0; scalars count as length-1 vectors.
pub fn concatenate(parts: &[DenseTensor]) -> Result<DenseTensor, EngineError> {
    let Some(first) = parts.first() else {
        return Ok(DenseTensor::vector(Vec::new()));
    };
    let tail: &[usize] = if first.rank() == 0 {
        &[]
    } else {
        &first.shape()[1..]
    };
    let mut lead = 0;
    let mut data = Vec::new();
    for part in parts {
        let (part_lead, part_tail): (usize, &[usize]) = if part.rank() == 0 {
            (1, &[])
        } else {
            (part.shape()[0], &part.shape()[1..])
        };
        if part_tail != tail {
            return Err(EngineError::ShapeMismatch {
                op: "concatenate",
                left: first.shape().to_vec(),
                right: part.shape().to_vec(),
            });
        }
        lead += part_lead;
        data.extend_from_slice(part.data());
    }
    let mut shape = Vec::with_capacity(tail.len() + 1);
    shape.push(lead);
    shape.extend_from_slice(tail);
    DenseTensor::new(shape, data)
}

/// Matrix product of a rank-2 tensor with a rank-2 or rank-1 tensor.
pub fn matmul(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<DenseTensor, EngineError> {
    let mismatch = || EngineError::ShapeMismatch {
        op: "matmul",
        left: lhs.shape().to_vec(),
        right: rhs.shape().to_vec(),
    };
    let [rows, inner] = *lhs.shape() else {
        return Err(mismatch());
    };
    let (rhs_rows, cols, vector_rhs) = match *rhs.shape() {
        [n] => (n, 1, true),
        [n, m] => (n, m, false),
        _ => return Err(mismatch()),
    };
    if rhs_rows != inner {
        return Err(mismatch());
    }
    let a = lhs.data();
    let b = rhs.data();
    let mut data = vec![0.0; rows * cols];
    for i in 0..rows {
        for k in 0..inner {
            let aik = a[i * inner + k];
            for j in 0..cols {
                data[i * cols + j] += aik * b[k * cols + j];
            }
        }
    }
    let shape = if vector_rhs { vec![rows] } else { vec![rows, cols] };
    DenseTensor::new(shape, data)
}

#[cfg(test)]
mod tests {
    use super::{add, add_scalar, concatenate, matmul, mul, scale, square, sub, sum};
    use crate::tensor::DenseTensor;
    use tw_engine::EngineError;

    #[test]
    fn elementwise_ops_broadcast_scalars() {
        let v = DenseTensor::vector(vec![1.0, 2.0]);
        let two = DenseTensor::scalar(2.0);
        assert_eq!(mul(&v, &two).expect("mul").data(), &[2.0, 4.0]);
        assert_eq!(sub(&two, &v).expect("sub").data(), &[1.0, 0.0]);
        assert_eq!(add(&v, &v).expect("add").data(), &[2.0, 4.0]);
        assert_eq!(scale(&v, 3.0).data(), &[3.0, 6.0]);
        assert_eq!(add_scalar(&v, 1.0).data(), &[2.0, 3.0]);
        assert_eq!(sum(&square(&v)).as_scalar(), Some(5.0));
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let a = DenseTensor::vector(vec![1.0, 2.0]);
        let b = DenseTensor::vector(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            add(&a, &b),
            Err(EngineError::ShapeMismatch { op: "add", .. })
        ));
    }

    #[test]
    fn concatenate_joins_leading_axis() {
        let joined = concatenate(&[
            DenseTensor::vector(vec![1.0, 2.0]),
            DenseTensor::scalar(3.0),
        ])
        .expect("concatenate");
        assert_eq!(joined.shape(), &[3]);
        assert_eq!(joined.data(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn matmul_matrix_vector() {
        let m = DenseTensor::matrix(&[&[1.0, 2.0], &[3.0, 4.0]]).expect("matrix");
        let v = DenseTensor::vector(vec![1.0, 1.0]);
        let out = matmul(&m, &v).expect("matmul");
        assert_eq!(out.shape(), &[2]);
        assert_eq!(out.data(), &[3.0, 7.0]);

        let mm = matmul(&m, &m).expect("matmul");
        assert_eq!(mm.data(), &[7.0, 10.0, 15.0, 22.0]);
        assert!(matmul(&v, &m).is_err());
    }
}
