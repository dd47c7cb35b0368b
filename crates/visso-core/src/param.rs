//! Trainable parameters and their gradients
//!
//! A [`Parameter`] pairs a value tensor with an optional [`Gradient`] slot.
//! Live model parameters and posterior means share this type, so a mean can
//! carry its own gradient through the preprocessing pipeline.
//!
//! Gradients are either dense arrays or flat COO sparse vectors (as produced by
//! embedding lookups). Sparse gradients survive accumulation and scaling but are
//! rejected by additive regularizers, see [`crate::error::VissoError::SparseGradient`].
//!
//! # Usage
//!
//! ```
//! use scirs2_core::ndarray_ext::array;
//! use visso_core::param::{Gradient, Parameter};
//!
//! let mut p = Parameter::new("weight", array![1.0, 2.0, 3.0].into_dyn());
//! p.grad = Some(Gradient::Dense(array![0.1, 0.2, 0.3].into_dyn()));
//! assert_eq!(p.numel(), 3);
//! ```

use crate::error::{Result, ShapeError};
use crate::types::Real;
use scirs2_core::ndarray_ext::{ArrayD, IxDyn};

/// Gradient storage
#[derive(Debug, Clone, PartialEq)]
pub enum Gradient<T> {
    /// Dense representation
    Dense(ArrayD<T>),

    /// Sparse COO format over the flattened (row-major) tensor
    Sparse {
        indices: Vec<usize>,
        values: Vec<T>,
        shape: Vec<usize>,
    },
}

impl<T: Real> Gradient<T> {
    /// Build a sparse gradient from parallel index/value lists
    pub fn sparse(indices: Vec<usize>, values: Vec<T>, shape: &[usize]) -> Result<Self> {
        if indices.len() != values.len() {
            return Err(ShapeError::Length {
                expected: indices.len(),
                got: values.len(),
            }
            .into());
        }
        let total: usize = shape.iter().product();
        if let Some(&bad) = indices.iter().find(|&&i| i >= total) {
            return Err(ShapeError::Length {
                expected: total,
                got: bad + 1,
            }
            .into());
        }
        Ok(Self::Sparse {
            indices,
            values,
            shape: shape.to_vec(),
        })
    }

    /// Logical shape of the gradient
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Dense(arr) => arr.shape(),
            Self::Sparse { shape, .. } => shape,
        }
    }

    /// Whether the gradient is stored sparsely
    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse { .. })
    }

    /// Convert to a dense array; duplicate sparse indices are summed
    pub fn to_dense(&self) -> ArrayD<T> {
        match self {
            Self::Dense(arr) => arr.clone(),
            Self::Sparse {
                indices,
                values,
                shape,
            } => {
                let total: usize = shape.iter().product();
                let mut flat = vec![T::zero(); total];
                for (&idx, &val) in indices.iter().zip(values.iter()) {
                    if let Some(slot) = flat.get_mut(idx) {
                        *slot = *slot + val;
                    }
                }
                ArrayD::from_shape_vec(IxDyn(shape), flat)
                    .unwrap_or_else(|_| ArrayD::zeros(IxDyn(shape)))
            }
        }
    }

    /// Dense view of the gradient, converting sparse storage in place
    pub fn densify(&mut self) -> &mut ArrayD<T> {
        if let Self::Sparse { .. } = self {
            *self = Self::Dense(self.to_dense());
        }
        match self {
            Self::Dense(arr) => arr,
            Self::Sparse { .. } => unreachable!("sparse gradient was just densified"),
        }
    }

    /// Scale gradient by a scalar
    pub fn scale(&mut self, factor: T) {
        match self {
            Self::Dense(arr) => arr.mapv_inplace(|v| v * factor),
            Self::Sparse { values, .. } => {
                for val in values.iter_mut() {
                    *val = *val * factor;
                }
            }
        }
    }

    /// Euclidean norm
    pub fn norm(&self) -> T {
        let sum_sq = |arr: &ArrayD<T>| arr.iter().fold(T::zero(), |acc, &v| acc + v * v);
        match self {
            Self::Dense(arr) => sum_sq(arr).sqrt(),
            // duplicates must be merged before squaring
            Self::Sparse { .. } => sum_sq(&self.to_dense()).sqrt(),
        }
    }

    /// Number of stored values
    pub fn nnz(&self) -> usize {
        match self {
            Self::Dense(arr) => arr.len(),
            Self::Sparse { values, .. } => values.len(),
        }
    }
}

/// A named trainable tensor with an optional gradient
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter<T> {
    /// Human-readable name used in logs
    pub name: String,
    /// Current value
    pub data: ArrayD<T>,
    /// Gradient written by backward; `None` when the parameter took no part
    pub grad: Option<Gradient<T>>,
}

impl<T: Real> Parameter<T> {
    /// Create a parameter without a gradient
    pub fn new(name: impl Into<String>, data: ArrayD<T>) -> Self {
        Self {
            name: name.into(),
            data,
            grad: None,
        }
    }

    /// Shape of the value tensor
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Set a dense gradient after checking its shape
    pub fn set_grad(&mut self, grad: ArrayD<T>) -> Result<()> {
        if grad.shape() != self.data.shape() {
            return Err(ShapeError::Tensor {
                expected: self.data.shape().to_vec(),
                got: grad.shape().to_vec(),
            }
            .into());
        }
        self.grad = Some(Gradient::Dense(grad));
        Ok(())
    }

    /// Zero the gradient in place, keeping its storage
    pub fn zero_grad(&mut self) {
        match &mut self.grad {
            Some(Gradient::Dense(arr)) => arr.fill(T::zero()),
            Some(Gradient::Sparse { indices, values, .. }) => {
                indices.clear();
                values.clear();
            }
            None => {}
        }
    }

    /// Copy value (and gradient, when both sides carry one) from another parameter
    pub fn copy_from(&mut self, other: &Parameter<T>) -> Result<()> {
        if other.data.shape() != self.data.shape() {
            return Err(ShapeError::Tensor {
                expected: self.data.shape().to_vec(),
                got: other.data.shape().to_vec(),
            }
            .into());
        }
        self.data.assign(&other.data);
        if self.grad.is_some() {
            if let Some(grad) = &other.grad {
                self.grad = Some(grad.clone());
            }
        }
        Ok(())
    }
}
