//! # visso-optim
//!
//! Second-order variational-inference optimizers over a Gaussian-mixture
//! posterior.
//!
//! This crate provides:
//!
//! - **Optimizer** ([`ViOptimizer`]): Monte-Carlo sampling, accumulation and the
//!   posterior update state machine
//! - **Curvature** ([`Curvature`] trait, [`DiagCurvature`]): running curvature,
//!   its regularized inverse and the posterior std
//! - **Preprocessing** ([`preprocess`]): ordered gradient pipelines for raw and
//!   preconditioned gradients
//! - **Prediction** ([`ViOptimizer::prediction`]): posterior-predictive averages
//! - **Distributed** ([`DistributedViOptimizer`]): reduce/gather around the update
//!   through a [`Communicator`]
//! - **Logging** ([`tracing_support`]): subscriber setup for binaries
//!
//! ## Quick Start
//!
//! ```
//! use scirs2_core::ndarray_ext::array;
//! use visso_core::Parameter;
//! use visso_optim::{DiagCurvature, DiagCurvatureConfig, ParamGroup, ViConfig, ViOptimizer};
//!
//! let params = vec![Parameter::new("w", array![0.3, -0.2].into_dyn())];
//! let curvature = DiagCurvature::new(&params, DiagCurvatureConfig::vogn()).unwrap();
//! let config = ViConfig::vogn(1_000.0).num_mc_samples(4).init_precision(1.0);
//! let mut opt =
//!     ViOptimizer::new(vec![ParamGroup::new("linear", params).curvature(curvature)], config)
//!         .unwrap();
//!
//! let out = opt
//!     .step(|model| {
//!         let w = model.params(0)[0].data.clone();
//!         model.set_grad(0, 0, w.clone())?;
//!         model.set_curvature_data(0, vec![Some(w.mapv(|v| v * v))])?;
//!         Ok((0.5 * w.mapv(|v| v * v).sum(), w))
//!     })
//!     .unwrap();
//! assert_eq!(out.probs.len(), 2);
//! ```

pub mod config;
pub mod curvature;
pub mod distributed;
pub mod group;
pub mod predict;
pub mod preprocess;
pub mod probability;
pub mod tracing_support;
pub mod vi;
pub mod warmup;

pub use config::{GradFlavor, GroupOptions, MixtureWeightUpdate, ViConfig};
pub use curvature::{Curvature, DiagCurvature, DiagCurvatureConfig};
pub use distributed::{Communicator, DistributedViOptimizer, Extractor};
pub use group::{GroupState, ModelView, ParamGroup};
pub use predict::Prediction;
pub use preprocess::{ParamState, Pipeline, Stage};
pub use probability::probabilities;
pub use vi::{LocalSync, OptimState, StepOutput, StepSync, ViOptimizer};
pub use warmup::{KlSchedule, KlWarmup};
