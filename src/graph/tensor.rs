//! Dense row-major tensors holding layer parameters.

use std::fmt;

/// Element storage of a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
}

/// A parameter tensor (kernel, bias, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl Tensor {
    /// Float tensor. The element count must match the shape.
    pub fn from_f32(shape: Vec<usize>, values: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        Self { shape, data: TensorData::F32(values) }
    }

    /// One-dimensional float tensor.
    pub fn vector(values: Vec<f32>) -> Self {
        Self::from_f32(vec![values.len()], values)
    }

    pub fn len(&self) -> usize {
        match &self.data {
            TensorData::F32(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::I16(v) => v.len(),
            TensorData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the tensor holds fixed-point values.
    pub fn is_integer(&self) -> bool {
        !matches!(self.data, TensorData::F32(_))
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Element `i` widened to f64, whatever the storage.
    pub fn get(&self, i: usize) -> f64 {
        match &self.data {
            TensorData::F32(v) => f64::from(v[i]),
            TensorData::I8(v) => f64::from(v[i]),
            TensorData::I16(v) => f64::from(v[i]),
            TensorData::I32(v) => f64::from(v[i]),
        }
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        match &self.data {
            TensorData::F32(_) | TensorData::I32(_) => 4,
            TensorData::I16(_) => 2,
            TensorData::I8(_) => 1,
        }
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = match &self.data {
            TensorData::F32(_) => "f32",
            TensorData::I8(_) => "i8",
            TensorData::I16(_) => "i16",
            TensorData::I32(_) => "i32",
        };
        write!(f, "{}{:?}", ty, self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_basics() {
        let t = Tensor::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(t.len(), 4);
        assert!(!t.is_integer());
        assert_eq!(t.get(3), 4.0);
        assert_eq!(t.to_string(), "f32[2, 2]");

        let q = Tensor { shape: vec![2], data: TensorData::I8(vec![-3, 7]) };
        assert!(q.is_integer());
        assert_eq!(q.element_size(), 1);
        assert_eq!(q.get(0), -3.0);
        assert!(q.as_f32().is_none());
    }
}
