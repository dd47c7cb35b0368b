//! # visso - Variational Second-Order Optimization
//!
//! This is the **meta crate** that re-exports all visso components for
//! convenient access.
//!
//! ## Quick Start
//!
//! ```
//! use visso::prelude::*;
//! use scirs2_core::ndarray_ext::array;
//!
//! let params = vec![Parameter::new("w", array![0.1, 0.2].into_dyn())];
//! let config = ViConfig::new(500.0).num_mc_samples(1);
//! let opt = ViOptimizer::new(vec![ParamGroup::new("w", params)], config)?;
//! assert_eq!(opt.step_count(), 0);
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Components
//!
//! ### Tensor utilities ([`core`])
//!
//! Parameters and gradients, the component arena, accumulators, the
//! grad-to-column transform and Gaussian-mixture math.
//!
//! ```
//! use visso::core::{grad2col, ConvGeometry};
//! use scirs2_core::ndarray_ext::{ArrayD, IxDyn};
//!
//! let geometry = ConvGeometry::new(&[3]).padding(&[1]);
//! let gy = ArrayD::<f64>::ones(IxDyn(&[2, 4, 10]));
//! let cols = grad2col(&gy, &geometry, &[10]).unwrap();
//! assert_eq!(cols.shape(), &[2, 4 * 3, 10]);
//! ```
//!
//! ### Optimizers ([`optim`])
//!
//! [`optim::ViOptimizer`], curvature estimates, preprocessing pipelines,
//! prediction and the distributed variant.

pub use visso_core as core;
pub use visso_optim as optim;

pub mod prelude {
    //! Prelude module for convenient imports
    //!
    //! # Example
    //!
    //! ```
    //! use visso::prelude::*;
    //!
    //! let config = ViConfig::vogn(60_000.0);
    //! assert!(config.validate().is_ok());
    //! ```

    // Tensor utilities
    pub use crate::core::{
        conv_transpose_weight_grads, conv_weight_grads, grad2col, grad2col_transpose,
        ComponentTable, ConvGeometry, Gradient, Parameter, Real, VissoError,
    };

    // Optimizers
    pub use crate::optim::{
        Communicator, Curvature, DiagCurvature, DiagCurvatureConfig, DistributedViOptimizer,
        GradFlavor, GroupOptions, MixtureWeightUpdate, ModelView, ParamGroup, Prediction,
        StepOutput, ViConfig, ViOptimizer,
    };
}
