//! # visso-core
//!
//! Tensor-level building blocks for the visso variational-inference optimizers.
//!
//! This crate provides:
//!
//! - **Element trait** ([`Real`]) over `f32`/`f64`
//! - **Parameters and gradients** ([`Parameter`], [`Gradient`]) with dense and sparse storage
//! - **Component arena** ([`ComponentTable`]) for per-parameter × per-component state
//! - **Accumulators** ([`TensorAccumulator`], [`MixtureAccumulator`]) for weighted running sums
//! - **Grad-to-column transform** ([`grad2col`], [`grad2col_transpose`]) for per-example
//!   convolution weight gradients
//! - **Gaussian-mixture math** ([`mixture`]) with log-domain responsibilities
//!
//! ## SciRS2 Integration
//!
//! All array, numeric and random functionality goes through `scirs2-core`
//! (`scirs2_core::ndarray_ext`, `scirs2_core::numeric`, `scirs2_core::random`).
//!
//! ## Quick Start
//!
//! ```
//! use scirs2_core::ndarray_ext::array;
//! use visso_core::{ComponentTable, Parameter};
//!
//! let params = vec![Parameter::new("w", array![0.5, -0.5].into_dyn())];
//! // two mixture components per parameter, both starting at the parameter value
//! let means = ComponentTable::from_fn(params.len(), 2, |p, _| params[p].clone());
//! assert_eq!(means.get(0, 1).data, params[0].data);
//! ```

pub mod accumulator;
pub mod error;
pub mod grad2col;
pub mod mixture;
pub mod param;
pub mod table;
pub mod types;

pub use accumulator::{Accumulate, MixtureAccumulator, MixtureTable, TensorAccumulator};
pub use error::{Result, ShapeError, VissoError};
pub use grad2col::{
    batched_outer, conv_transpose_weight_grads, conv_weight_grads, grad2col, grad2col_transpose,
    ConvGeometry,
};
pub use mixture::{responsibilities, Responsibilities, STD_FLOOR};
pub use param::{Gradient, Parameter};
pub use table::ComponentTable;
pub use types::{numel, Real};
