//! Unified error types for visso
//!
//! Every fallible operation in the visso stack returns [`VissoError`]. The
//! variants are:
//!
//! - **`Configuration`**: invalid optimizer/curvature arguments, raised at construction
//! - **`Shape`**: tensor extents that disagree (grad-to-column, accumulation, tables)
//! - **`UnsupportedRank`**: a model output that is neither logits of rank 1 nor rank 2
//! - **`SparseGradient`**: an in-place additive update requested on a sparse gradient
//! - **`Collaborator`**: anything raised by a closure, curvature, or communicator,
//!   propagated unmodified
//!
//! # Examples
//!
//! ```
//! use visso_core::error::{ShapeError, VissoError};
//!
//! fn check_rank(shape: &[usize]) -> Result<(), VissoError> {
//!     if shape.len() < 3 {
//!         return Err(ShapeError::Rank { expected: 3, got: shape.len() }.into());
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_rank(&[2, 3]).is_err());
//! assert!(check_rank(&[2, 3, 4]).is_ok());
//! ```

use thiserror::Error;

/// Top-level error type for all visso operations
#[derive(Error, Debug)]
pub enum VissoError {
    /// Invalid constructor argument
    #[error("Invalid {name}: {value}")]
    Configuration { name: &'static str, value: String },

    /// Shape mismatch errors
    #[error("Shape mismatch: {0}")]
    Shape(#[from] ShapeError),

    /// Model output rank for which no probability mapping exists
    #[error("Invalid ndim {rank}: expected logits of rank 1 (sigmoid) or 2 (softmax)")]
    UnsupportedRank { rank: usize },

    /// Additive in-place update requested on a sparse gradient
    #[error("{option} option is not compatible with sparse gradients")]
    SparseGradient { option: &'static str },

    /// Failure raised by an external collaborator (closure, curvature, communicator)
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl VissoError {
    /// Shorthand for a configuration error
    pub fn config(name: &'static str, value: impl std::fmt::Display) -> Self {
        VissoError::Configuration {
            name,
            value: value.to_string(),
        }
    }
}

/// Shape errors for tensors, tables, and convolution geometry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Tensor shape mismatch: expected {expected:?}, got {got:?}")]
    Tensor { expected: Vec<usize>, got: Vec<usize> },

    #[error("Rank mismatch: expected {expected}, got {got}")]
    Rank { expected: usize, got: usize },

    #[error("Length mismatch: expected {expected}, got {got}")]
    Length { expected: usize, got: usize },

    #[error(
        "grad2col element count mismatch: expected {expected} elements \
         (spatial extent {expected_spatial:?}), got {got} (spatial extent {got_spatial:?})"
    )]
    Grad2Col {
        expected: usize,
        got: usize,
        expected_spatial: Vec<usize>,
        got_spatial: Vec<usize>,
    },

    #[error("Invalid convolution geometry: {reason}")]
    Geometry { reason: String },
}

/// Result alias used throughout visso
pub type Result<T> = std::result::Result<T, VissoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_message() {
        let err = VissoError::config("dataset size", -1.0);
        assert_eq!(err.to_string(), "Invalid dataset size: -1");
    }

    #[test]
    fn test_shape_error_converts() {
        let err: VissoError = ShapeError::Length {
            expected: 2,
            got: 3,
        }
        .into();
        assert!(matches!(err, VissoError::Shape(ShapeError::Length { .. })));
    }

    #[test]
    fn test_collaborator_is_transparent() {
        let err: VissoError = anyhow::anyhow!("device lost").into();
        assert_eq!(err.to_string(), "device lost");
    }

    #[test]
    fn test_sparse_message() {
        let err = VissoError::SparseGradient {
            option: "weight_decay",
        };
        assert_eq!(
            err.to_string(),
            "weight_decay option is not compatible with sparse gradients"
        );
    }
}
