//! Optimizer configuration
//!
//! [`ViConfig`] follows the chained-builder style: start from a preset and
//! override what differs.
//!
//! ```
//! use visso_optim::config::{GradFlavor, ViConfig};
//!
//! let config = ViConfig::vogn(50_000.0)
//!     .learning_rate(2e-3)
//!     .momentum(0.9)
//!     .momentum_type(GradFlavor::Raw);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.num_mc_samples, 50);
//! ```

use visso_core::error::{Result, VissoError};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which gradient a preprocessing stage sees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum GradFlavor {
    /// Accumulated gradient, before curvature preconditioning
    Raw,
    /// Gradient after multiplication by the inverse curvature
    Preconditioned,
}

/// How the mixture weights evolve across accepted steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MixtureWeightUpdate {
    /// Weights stay at `1/K` for the optimizer's lifetime
    #[default]
    Frozen,
    /// `ρ_k = log π_k − log π_K − lr·(δ_k − δ_K)·loss`, then `π = softmax(ρ)`
    Gradient,
}

/// Configuration for [`crate::ViOptimizer`]
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ViConfig {
    /// Number of training examples; scales the KL term
    ///
    /// Must be positive and finite: [`ViConfig::l2_reg`] and
    /// [`ViConfig::std_scale`] divide by it.
    pub dataset_size: f64,
    /// Gaussian components per parameter
    pub num_gmm_components: usize,
    /// Learning rate
    pub learning_rate: f64,
    /// Momentum coefficient
    pub momentum: f64,
    /// Gradient flavor momentum is applied to
    pub momentum_type: GradFlavor,
    /// Weight of the new gradient in the gradient EMA (1 disables it)
    pub grad_ema_decay: f64,
    /// Gradient flavor the EMA is applied to
    pub grad_ema_type: GradFlavor,
    /// Weight decay on preconditioned gradients
    pub weight_decay: f64,
    /// Micro-steps accumulated before each posterior update
    pub acc_steps: usize,
    /// Adam-style bias correction of preconditioned gradients
    pub bias_correction: bool,
    /// Layer-wise adaptive rate scaling
    pub lars: bool,
    /// Gradient flavor LARS is applied to
    pub lars_type: GradFlavor,
    /// Monte-Carlo draws per training step
    pub num_mc_samples: usize,
    /// Monte-Carlo draws per prediction (0 predicts with the posterior mean)
    pub val_num_mc_samples: usize,
    /// Target KL weighting
    pub kl_weighting: f64,
    /// KL weighting at step 0 when warming up
    pub warmup_kl_weighting_init: f64,
    /// Steps over which KL weighting ramps to its target
    pub warmup_kl_weighting_steps: Option<u64>,
    /// Variance of the Gaussian prior on every parameter
    pub prior_variance: f64,
    /// Initial diagonal precision handed to every curvature
    pub init_precision: Option<f64>,
    /// Base of the per-step sampling seed
    pub seed: u64,
    /// Planned number of steps; spaces out distributed seed streams
    pub total_steps: u64,
    pub mixture_weight_update: MixtureWeightUpdate,
}

impl Default for ViConfig {
    fn default() -> Self {
        Self {
            dataset_size: 1.0,
            num_gmm_components: 1,
            learning_rate: 0.01,
            momentum: 0.0,
            momentum_type: GradFlavor::Preconditioned,
            grad_ema_decay: 1.0,
            grad_ema_type: GradFlavor::Raw,
            weight_decay: 0.0,
            acc_steps: 1,
            bias_correction: false,
            lars: false,
            lars_type: GradFlavor::Preconditioned,
            num_mc_samples: 10,
            val_num_mc_samples: 10,
            kl_weighting: 1.0,
            warmup_kl_weighting_init: 0.01,
            warmup_kl_weighting_steps: None,
            prior_variance: 1.0,
            init_precision: None,
            seed: 1,
            total_steps: 1000,
            mixture_weight_update: MixtureWeightUpdate::Frozen,
        }
    }
}

impl ViConfig {
    /// Default configuration for a dataset of the given size
    pub fn new(dataset_size: f64) -> Self {
        Self::default().dataset_size(dataset_size)
    }

    /// Variational Online Gauss-Newton preset
    ///
    /// Pair with [`crate::curvature::DiagCurvatureConfig::vogn`].
    pub fn vogn(dataset_size: f64) -> Self {
        Self::new(dataset_size)
            .learning_rate(1e-3)
            .warmup_kl_weighting(0.01, 1000)
            .grad_ema_decay(0.1)
            .num_mc_samples(50)
            .val_num_mc_samples(100)
    }

    pub fn dataset_size(mut self, dataset_size: f64) -> Self {
        self.dataset_size = dataset_size;
        self
    }

    pub fn num_gmm_components(mut self, n: usize) -> Self {
        self.num_gmm_components = n;
        self
    }

    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn momentum_type(mut self, flavor: GradFlavor) -> Self {
        self.momentum_type = flavor;
        self
    }

    pub fn grad_ema_decay(mut self, decay: f64) -> Self {
        self.grad_ema_decay = decay;
        self
    }

    pub fn grad_ema_type(mut self, flavor: GradFlavor) -> Self {
        self.grad_ema_type = flavor;
        self
    }

    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn acc_steps(mut self, acc_steps: usize) -> Self {
        self.acc_steps = acc_steps;
        self
    }

    pub fn bias_correction(mut self, enabled: bool) -> Self {
        self.bias_correction = enabled;
        self
    }

    pub fn lars(mut self, enabled: bool, flavor: GradFlavor) -> Self {
        self.lars = enabled;
        self.lars_type = flavor;
        self
    }

    pub fn num_mc_samples(mut self, n: usize) -> Self {
        self.num_mc_samples = n;
        self
    }

    pub fn val_num_mc_samples(mut self, n: usize) -> Self {
        self.val_num_mc_samples = n;
        self
    }

    pub fn kl_weighting(mut self, kl: f64) -> Self {
        self.kl_weighting = kl;
        self
    }

    /// Ramp KL weighting linearly from `init` to the target over `steps`
    pub fn warmup_kl_weighting(mut self, init: f64, steps: u64) -> Self {
        self.warmup_kl_weighting_init = init;
        self.warmup_kl_weighting_steps = Some(steps);
        self
    }

    pub fn no_warmup(mut self) -> Self {
        self.warmup_kl_weighting_steps = None;
        self
    }

    pub fn prior_variance(mut self, variance: f64) -> Self {
        self.prior_variance = variance;
        self
    }

    pub fn init_precision(mut self, precision: f64) -> Self {
        self.init_precision = Some(precision);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn total_steps(mut self, total_steps: u64) -> Self {
        self.total_steps = total_steps;
        self
    }

    pub fn mixture_weight_update(mut self, mode: MixtureWeightUpdate) -> Self {
        self.mixture_weight_update = mode;
        self
    }

    /// Reject invalid arguments
    ///
    /// A `dataset_size` of zero is rejected along with negative and
    /// non-finite sizes, since the KL scaling divides by it.
    pub fn validate(&self) -> Result<()> {
        if !(self.dataset_size > 0.0) || !self.dataset_size.is_finite() {
            return Err(VissoError::config("dataset size", self.dataset_size));
        }
        if self.num_gmm_components == 0 {
            return Err(VissoError::config(
                "number of mixture components",
                self.num_gmm_components,
            ));
        }
        if self.num_mc_samples == 0 {
            return Err(VissoError::config(
                "number of MC samples",
                self.num_mc_samples,
            ));
        }
        if self.acc_steps == 0 {
            return Err(VissoError::config("accumulation steps", self.acc_steps));
        }
        if !(self.learning_rate >= 0.0) {
            return Err(VissoError::config("learning rate", self.learning_rate));
        }
        if !(self.momentum >= 0.0) {
            return Err(VissoError::config("momentum", self.momentum));
        }
        if !(0.0..=1.0).contains(&self.grad_ema_decay) {
            return Err(VissoError::config(
                "gradient EMA decay",
                self.grad_ema_decay,
            ));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(VissoError::config("weight decay", self.weight_decay));
        }
        if !(self.kl_weighting >= 0.0) {
            return Err(VissoError::config("KL weighting", self.kl_weighting));
        }
        // the warm-up divides by its initial value
        if self.warmup_kl_weighting_steps.is_some() && !(self.warmup_kl_weighting_init > 0.0) {
            return Err(VissoError::config(
                "initial KL weighting",
                self.warmup_kl_weighting_init,
            ));
        }
        if !(self.prior_variance >= 0.0) {
            return Err(VissoError::config("prior variance", self.prior_variance));
        }
        if let Some(precision) = self.init_precision {
            if !(precision >= 0.0) {
                return Err(VissoError::config("initial precision", precision));
            }
        }
        Ok(())
    }

    /// KL weighting in effect at step 0
    pub fn init_kl_weighting(&self) -> f64 {
        match self.warmup_kl_weighting_steps {
            Some(_) => self.warmup_kl_weighting_init,
            None => self.kl_weighting,
        }
    }

    /// `init_kl / dataset_size / prior_variance`, zero for a zero prior variance
    pub fn l2_reg(&self) -> f64 {
        if self.prior_variance == 0.0 {
            0.0
        } else {
            self.init_kl_weighting() / self.dataset_size / self.prior_variance
        }
    }

    /// `sqrt(init_kl / dataset_size)`
    pub fn std_scale(&self) -> f64 {
        (self.init_kl_weighting() / self.dataset_size).sqrt()
    }
}

/// Per-group overrides of the optimizer-wide hyperparameters
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GroupOptions {
    pub learning_rate: Option<f64>,
    pub momentum: Option<f64>,
    pub weight_decay: Option<f64>,
    /// Whether the prior (L2 term and posterior noise) applies; typically
    /// `false` for normalization-layer parameters
    pub regularize: bool,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            learning_rate: None,
            momentum: None,
            weight_decay: None,
            regularize: true,
        }
    }
}

impl GroupOptions {
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = Some(lr);
        self
    }

    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = Some(momentum);
        self
    }

    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = Some(weight_decay);
        self
    }

    pub fn regularize(mut self, regularize: bool) -> Self {
        self.regularize = regularize;
        self
    }
}
