//! Core type definitions for visso tensors.
//!
//! All tensors are dynamic-rank `ArrayD<T>` values from scirs2-core's ndarray
//! re-export. The element type is constrained by [`Real`], which bundles the
//! floating-point, scalar-broadcast, and accumulation capabilities the
//! optimizers need.

use crate::accumulator::Accumulate;
use scirs2_core::ndarray_ext::ScalarOperand;
use scirs2_core::numeric::{Float, NumCast};
use std::fmt::Debug;

/// Floating-point element type accepted by visso (`f32` or `f64`).
pub trait Real: Float + ScalarOperand + Accumulate + Debug + Send + Sync + 'static {
    /// Convert an `f64` hyperparameter into the element type.
    ///
    /// Conversion between the supported float widths cannot fail; values out
    /// of range saturate to infinity as `as` casts do, and anything else
    /// becomes NaN.
    fn lit(value: f64) -> Self {
        <Self as NumCast>::from(value).unwrap_or_else(Self::nan)
    }

    /// Widen to `f64` for logging and scalar bookkeeping.
    fn as_f64(self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }
}

impl<T> Real for T where T: Float + ScalarOperand + Accumulate + Debug + Send + Sync + 'static {}

/// Product of a shape's extents (1 for a scalar shape).
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}
