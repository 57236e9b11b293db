use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::error::PredictorError;

/// Owned host tensor exchanged with an inference engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    F32(ArrayD<f32>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
}

impl Tensor {
    pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Result<Self, PredictorError> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(Tensor::F32)
            .map_err(|e| PredictorError::BadInput(format!("tensor shape {shape:?}: {e}")))
    }

    pub fn from_i32(shape: &[usize], data: Vec<i32>) -> Result<Self, PredictorError> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(Tensor::I32)
            .map_err(|e| PredictorError::BadInput(format!("tensor shape {shape:?}: {e}")))
    }

    pub fn from_i64(shape: &[usize], data: Vec<i64>) -> Result<Self, PredictorError> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(Tensor::I64)
            .map_err(|e| PredictorError::BadInput(format!("tensor shape {shape:?}: {e}")))
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::F32(a) => a.shape(),
            Tensor::I32(a) => a.shape(),
            Tensor::I64(a) => a.shape(),
        }
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            Tensor::F32(_) => "float32",
            Tensor::I32(_) => "int32",
            Tensor::I64(_) => "int64",
        }
    }

    pub fn as_f32(&self) -> Option<ArrayViewD<'_, f32>> {
        match self {
            Tensor::F32(a) => Some(a.view()),
            _ => None,
        }
    }

    /// Lossy widening/narrowing copy to `f32`, for outputs whose element
    /// type depends on how the graph was exported.
    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            Tensor::F32(a) => a.clone(),
            Tensor::I32(a) => a.mapv(|v| v as f32),
            Tensor::I64(a) => a.mapv(|v| v as f32),
        }
    }

    pub fn to_i64(&self) -> ArrayD<i64> {
        match self {
            Tensor::F32(a) => a.mapv(|v| v.round() as i64),
            Tensor::I32(a) => a.mapv(i64::from),
            Tensor::I64(a) => a.clone(),
        }
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(value: ArrayD<f32>) -> Self {
        Tensor::F32(value)
    }
}

impl From<ArrayD<i32>> for Tensor {
    fn from(value: ArrayD<i32>) -> Self {
        Tensor::I32(value)
    }
}

impl From<ArrayD<i64>> for Tensor {
    fn from(value: ArrayD<i64>) -> Self {
        Tensor::I64(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_shape() {
        let err = Tensor::from_f32(&[2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, PredictorError::BadInput(_)));
    }

    #[test]
    fn integer_outputs_convert_to_f32() {
        let tensor = Tensor::from_i64(&[1, 2], vec![3, 4]).unwrap();
        assert_eq!(tensor.dtype(), "int64");
        assert_eq!(tensor.to_f32().as_slice().unwrap(), &[3.0, 4.0]);
        assert!(tensor.as_f32().is_none());
    }
}
