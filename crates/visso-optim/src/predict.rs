//! Posterior-predictive evaluation

use crate::group::ModelView;
use crate::probability::probabilities;
use crate::tracing_support::prediction_span;
use crate::vi::ViOptimizer;
use scirs2_core::ndarray_ext::ArrayD;
use tracing::debug;
use visso_core::{Real, Result, TensorAccumulator, VissoError};

/// Monte-Carlo averaged prediction
#[derive(Debug, Clone)]
pub struct Prediction<T> {
    /// Probabilities averaged over the draws
    pub probs: ArrayD<T>,
    /// Per-draw probabilities, when requested
    pub samples: Option<Vec<ArrayD<T>>>,
}

impl<T: Real> ViOptimizer<T> {
    /// Average the model's probabilities over posterior samples
    ///
    /// `mc` overrides `val_num_mc_samples`; zero draws predicts once with the
    /// posterior mean. The sampling stream is seeded with the step count, and
    /// the live parameters are restored to the posterior mean afterwards.
    pub fn prediction<F>(
        &mut self,
        mut forward: F,
        mc: Option<usize>,
        keep_probs: bool,
    ) -> Result<Prediction<T>>
    where
        F: FnMut(&ModelView<'_, T>) -> anyhow::Result<ArrayD<T>>,
    {
        self.reseed(self.state.step);

        let mc_samples = mc.unwrap_or(self.config.val_num_mc_samples);
        let use_mean = mc_samples == 0;
        let n = if use_mean { 1 } else { mc_samples };
        let _span = prediction_span(self.state.step, n).entered();

        let mut acc_prob = TensorAccumulator::<ArrayD<T>>::new();
        let mut samples = keep_probs.then(|| Vec::with_capacity(n));

        for _ in 0..n {
            if use_mean {
                self.copy_mean_to_params()?;
            } else {
                self.sample_params()?;
            }
            let output = forward(&ModelView::new(&mut self.groups))?;
            let probs = probabilities(&output)?;
            acc_prob.update(&probs, 1.0 / n as f64)?;
            if let Some(samples) = samples.as_mut() {
                samples.push(probs);
            }
        }

        self.copy_mean_to_params()?;
        debug!(draws = n, use_mean, "prediction");

        let probs = acc_prob
            .get()
            .ok_or_else(|| VissoError::config("number of MC samples", n))?;
        Ok(Prediction { probs, samples })
    }
}
