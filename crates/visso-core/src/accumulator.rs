//! Weighted running sums over tensors and tensor collections
//!
//! The optimizer collects loss, probabilities, gradients, curvature data and
//! responsibilities over `num_mc_samples × acc_steps` closure calls, each
//! weighted by a scale. [`Accumulate`] is the leaf-wise `sum += scale · value`
//! operation; [`TensorAccumulator`] and [`MixtureAccumulator`] hold the sums.
//!
//! # Example
//!
//! ```
//! use scirs2_core::ndarray_ext::array;
//! use visso_core::accumulator::TensorAccumulator;
//!
//! let mut acc = TensorAccumulator::new();
//! acc.update(&array![1.0, 2.0].into_dyn(), 0.5).unwrap();
//! acc.update(&array![3.0, 4.0].into_dyn(), 0.5).unwrap();
//! assert_eq!(acc.get().unwrap(), array![2.0, 3.0].into_dyn());
//! assert!(acc.get().is_none());
//! ```

use crate::error::{Result, ShapeError};
use crate::param::Gradient;
use crate::table::ComponentTable;
use crate::types::Real;
use scirs2_core::ndarray_ext::ArrayD;

/// Leaf-wise scaled accumulation
pub trait Accumulate: Sized {
    /// Deep copy multiplied by `scale`
    fn scaled(&self, scale: f64) -> Result<Self>;

    /// In-place `self += scale · other`
    fn add_scaled(&mut self, other: &Self, scale: f64) -> Result<()>;
}

impl Accumulate for f64 {
    fn scaled(&self, scale: f64) -> Result<Self> {
        Ok(self * scale)
    }

    fn add_scaled(&mut self, other: &Self, scale: f64) -> Result<()> {
        *self += other * scale;
        Ok(())
    }
}

impl Accumulate for f32 {
    fn scaled(&self, scale: f64) -> Result<Self> {
        Ok(self * scale as f32)
    }

    fn add_scaled(&mut self, other: &Self, scale: f64) -> Result<()> {
        *self += other * scale as f32;
        Ok(())
    }
}

impl<T: Real> Accumulate for ArrayD<T> {
    fn scaled(&self, scale: f64) -> Result<Self> {
        let s = T::lit(scale);
        Ok(self.mapv(|v| v * s))
    }

    fn add_scaled(&mut self, other: &Self, scale: f64) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(ShapeError::Tensor {
                expected: self.shape().to_vec(),
                got: other.shape().to_vec(),
            }
            .into());
        }
        let s = T::lit(scale);
        self.zip_mut_with(other, |a, &b| *a = *a + s * b);
        Ok(())
    }
}

impl<T: Real> Accumulate for Gradient<T> {
    fn scaled(&self, scale: f64) -> Result<Self> {
        let mut out = self.clone();
        out.scale(T::lit(scale));
        Ok(out)
    }

    fn add_scaled(&mut self, other: &Self, scale: f64) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(ShapeError::Tensor {
                expected: self.shape().to_vec(),
                got: other.shape().to_vec(),
            }
            .into());
        }
        let s = T::lit(scale);
        match other {
            Gradient::Dense(val) => {
                let acc = self.densify();
                acc.zip_mut_with(val, |a, &b| *a = *a + s * b);
            }
            Gradient::Sparse {
                indices: other_idx,
                values: other_val,
                ..
            } => match self {
                Gradient::Sparse {
                    indices, values, ..
                } => {
                    // COO concatenation; duplicates are summed on densify
                    indices.extend_from_slice(other_idx);
                    values.extend(other_val.iter().map(|&v| v * s));
                }
                Gradient::Dense(acc) => match acc.as_slice_mut() {
                    Some(flat) => {
                        for (&i, &v) in other_idx.iter().zip(other_val.iter()) {
                            if let Some(slot) = flat.get_mut(i) {
                                *slot = *slot + s * v;
                            }
                        }
                    }
                    None => {
                        let dense = other.to_dense();
                        acc.zip_mut_with(&dense, |a, &b| *a = *a + s * b);
                    }
                },
            },
        }
        Ok(())
    }
}

/// `None` leaves are skipped; a `None` sum adopts the first present value.
impl<A: Accumulate> Accumulate for Option<A> {
    fn scaled(&self, scale: f64) -> Result<Self> {
        self.as_ref().map(|v| v.scaled(scale)).transpose()
    }

    fn add_scaled(&mut self, other: &Self, scale: f64) -> Result<()> {
        match (self.as_mut(), other) {
            (Some(acc), Some(val)) => acc.add_scaled(val, scale),
            (None, Some(val)) => {
                *self = Some(val.scaled(scale)?);
                Ok(())
            }
            (_, None) => Ok(()),
        }
    }
}

impl<A: Accumulate> Accumulate for Vec<A> {
    fn scaled(&self, scale: f64) -> Result<Self> {
        self.iter().map(|v| v.scaled(scale)).collect()
    }

    fn add_scaled(&mut self, other: &Self, scale: f64) -> Result<()> {
        if self.len() != other.len() {
            return Err(ShapeError::Length {
                expected: self.len(),
                got: other.len(),
            }
            .into());
        }
        for (acc, val) in self.iter_mut().zip(other.iter()) {
            acc.add_scaled(val, scale)?;
        }
        Ok(())
    }
}

impl<A: Accumulate> Accumulate for ComponentTable<A> {
    fn scaled(&self, scale: f64) -> Result<Self> {
        self.try_map(|_, v| v.scaled(scale))
    }

    fn add_scaled(&mut self, other: &Self, scale: f64) -> Result<()> {
        self.check_layout(other)?;
        for (acc, val) in self.as_mut_slice().iter_mut().zip(other.as_slice()) {
            acc.add_scaled(val, scale)?;
        }
        Ok(())
    }
}

/// Running weighted sum of one accumulable value
///
/// The first update stores a scaled deep copy, so the accumulator never
/// aliases the caller's tensor. [`TensorAccumulator::get`] hands the sum out
/// and starts a fresh cycle.
#[derive(Debug, Clone)]
pub struct TensorAccumulator<A> {
    value: Option<A>,
}

impl<A> Default for TensorAccumulator<A> {
    fn default() -> Self {
        Self { value: None }
    }
}

impl<A: Accumulate> TensorAccumulator<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `scale · value` to the running sum
    pub fn update(&mut self, value: &A, scale: f64) -> Result<()> {
        match &mut self.value {
            Some(acc) => acc.add_scaled(value, scale),
            None => {
                self.value = Some(value.scaled(scale)?);
                Ok(())
            }
        }
    }

    /// Take the accumulated sum, leaving the accumulator empty
    pub fn get(&mut self) -> Option<A> {
        self.value.take()
    }

    /// Borrow the sum without clearing it
    pub fn peek(&self) -> Option<&A> {
        self.value.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Drop any partial sum
    pub fn reset(&mut self) {
        self.value = None;
    }
}

/// Per-parameter, per-component tensor table with optional leaves
pub type MixtureTable<T> = ComponentTable<Option<ArrayD<T>>>;

/// Accumulator for mixture responsibilities
///
/// Unlike [`TensorAccumulator`], reading does not clear: the curvature and
/// the mean update both consume the same accumulation, and the optimizer
/// calls [`MixtureAccumulator::reset`] once the step has used it.
#[derive(Debug, Clone)]
pub struct MixtureAccumulator<T> {
    value: Option<MixtureTable<T>>,
}

impl<T> Default for MixtureAccumulator<T> {
    fn default() -> Self {
        Self { value: None }
    }
}

impl<T: Real> MixtureAccumulator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every leaf with unit weight
    pub fn update(&mut self, values: &MixtureTable<T>) -> Result<()> {
        self.update_scaled(values, 1.0)
    }

    /// Add every leaf multiplied by `scale`
    pub fn update_scaled(&mut self, values: &MixtureTable<T>, scale: f64) -> Result<()> {
        match &mut self.value {
            Some(acc) => acc.add_scaled(values, scale),
            None => {
                self.value = Some(values.scaled(scale)?);
                Ok(())
            }
        }
    }

    /// Current accumulation
    pub fn get(&self) -> Option<&MixtureTable<T>> {
        self.value.as_ref()
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scirs2_core::ndarray_ext::array;

    #[test]
    fn test_scalar_accumulation() {
        let mut acc = TensorAccumulator::<f64>::new();
        acc.update(&2.0, 0.5).unwrap();
        acc.update(&4.0, 0.25).unwrap();
        assert_eq!(acc.get(), Some(2.0));
        assert!(acc.is_empty());
    }

    #[test]
    fn test_first_update_does_not_alias() {
        let mut acc = TensorAccumulator::new();
        let mut source = array![1.0, 1.0].into_dyn();
        acc.update(&source, 1.0).unwrap();
        source.fill(100.0);
        assert_eq!(acc.get().unwrap(), array![1.0, 1.0].into_dyn());
    }

    #[test]
    fn test_cycle_after_get_starts_from_zero() {
        let mut acc = TensorAccumulator::new();
        acc.update(&array![1.0].into_dyn(), 1.0).unwrap();
        let _ = acc.get();
        acc.update(&array![5.0].into_dyn(), 2.0).unwrap();
        assert_eq!(acc.get().unwrap(), array![10.0].into_dyn());
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let mut acc = TensorAccumulator::new();
        acc.update(&array![1.0, 2.0].into_dyn(), 1.0).unwrap();
        assert!(acc.update(&array![1.0].into_dyn(), 1.0).is_err());
    }

    #[test]
    fn test_option_leaves() {
        let mut acc: TensorAccumulator<Vec<Option<f64>>> = TensorAccumulator::new();
        acc.update(&vec![Some(1.0), None, None], 1.0).unwrap();
        acc.update(&vec![Some(1.0), Some(3.0), None], 0.5).unwrap();
        assert_eq!(acc.get(), Some(vec![Some(1.5), Some(1.5), None]));
    }

    #[test]
    fn test_sparse_gradients_accumulate() {
        let a = Gradient::sparse(vec![0], vec![1.0], &[3]).unwrap();
        let b = Gradient::sparse(vec![0, 2], vec![1.0, 2.0], &[3]).unwrap();
        let mut acc = TensorAccumulator::new();
        acc.update(&a, 1.0).unwrap();
        acc.update(&b, 0.5).unwrap();
        let sum = acc.get().unwrap();
        assert!(sum.is_sparse());
        assert_eq!(sum.to_dense(), array![1.5, 0.0, 1.0].into_dyn());
    }

    #[test]
    fn test_mixed_gradients_accumulate() {
        let dense = Gradient::Dense(array![1.0, 1.0, 1.0].into_dyn());
        let sparse = Gradient::sparse(vec![1], vec![4.0], &[3]).unwrap();

        let mut acc = dense.clone();
        acc.add_scaled(&sparse, 0.5).unwrap();
        assert_eq!(acc, Gradient::Dense(array![1.0, 3.0, 1.0].into_dyn()));

        let mut acc = sparse;
        acc.add_scaled(&dense, 1.0).unwrap();
        assert_eq!(acc, Gradient::Dense(array![1.0, 5.0, 1.0].into_dyn()));
    }

    #[test]
    fn test_mixture_accumulator_get_keeps_value() {
        let table: MixtureTable<f64> =
            ComponentTable::from_fn(1, 2, |_, k| Some(array![k as f64].into_dyn()));
        let mut acc = MixtureAccumulator::new();
        acc.update(&table).unwrap();
        acc.update_scaled(&table, 2.0).unwrap();

        let sum = acc.get().unwrap();
        assert_eq!(sum.get(0, 1).as_ref().unwrap()[[0]], 3.0);
        assert!(acc.get().is_some());

        acc.reset();
        assert!(acc.get().is_none());
    }
}
