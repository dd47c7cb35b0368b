//! Variational-inference optimizer with a Gaussian-mixture posterior
//!
//! Every call to [`ViOptimizer::step`] draws `num_mc_samples` parameter
//! samples from the posterior, runs the closure on each, and accumulates the
//! results. Once `acc_steps` calls have accumulated, the posterior is updated:
//!
//! 1. accumulated gradients move onto every component's mean, accumulated
//!    curvature data onto the curvature
//! 2. raw-gradient pipeline (L2 term, ...)
//! 3. curvature step and preconditioning
//! 4. preconditioned-gradient pipeline (weight decay, ...)
//! 5. `mean_k -= lr · δ_k · g_k`
//! 6. mixture weights (see [`MixtureWeightUpdate`])
//! 7. the first component's mean is copied into the live parameters
//!
//! and finally the KL-weighting warm-up advances.
//!
//! # Example
//!
//! ```
//! use scirs2_core::ndarray_ext::array;
//! use visso_core::Parameter;
//! use visso_optim::{ParamGroup, ViConfig, ViOptimizer};
//!
//! let params = vec![Parameter::new("w", array![1.0, -1.0].into_dyn())];
//! let config = ViConfig::new(100.0).num_mc_samples(2);
//! let mut opt = ViOptimizer::new(vec![ParamGroup::new("linear", params)], config).unwrap();
//!
//! let out = opt
//!     .step(|model| {
//!         let w = model.params(0)[0].data.clone();
//!         model.set_grad(0, 0, w.clone())?;
//!         Ok((0.5 * w.mapv(|v| v * v).sum(), array![[0.0, 1.0]].into_dyn()))
//!     })
//!     .unwrap();
//! assert!(out.updated);
//! assert_eq!(opt.step_count(), 1);
//! ```

use crate::config::{GradFlavor, MixtureWeightUpdate, ViConfig};
use crate::group::{CurvatureList, GradList, GroupState, ModelView, ParamGroup};
use crate::preprocess::StageContext;
use crate::probability::probabilities;
use crate::tracing_support::{record_step, step_span};
use crate::warmup::KlWarmup;
use scirs2_core::ndarray_ext::{ArrayD, Zip};
use scirs2_core::random::{rngs::StdRng, SeedableRng};
use tracing::{debug, info, trace, warn};
use visso_core::mixture::log_normalize;
use visso_core::{
    responsibilities, ComponentTable, Gradient, MixtureTable, Parameter, Real, Result, ShapeError,
    TensorAccumulator, VissoError,
};

/// Step counters owned by the optimizer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimState {
    /// Accepted posterior updates
    pub step: u64,
    /// Accumulation rounds since the last update
    pub acc_step: usize,
}

/// Result of one [`ViOptimizer::step`] call
#[derive(Debug, Clone)]
pub struct StepOutput<T> {
    /// Loss averaged over the Monte-Carlo draws
    pub loss: T,
    /// Probabilities averaged over the Monte-Carlo draws
    pub probs: ArrayD<T>,
    /// Whether the posterior was updated by this call
    pub updated: bool,
}

/// Hook around the posterior update
///
/// `before_update` runs once accumulation is complete and the accumulated
/// gradients and curvature data are in place, before anything in the
/// posterior changes. Returning `false` rejects the update.
pub trait StepSync<T: Real> {
    fn before_update(&mut self, groups: &mut [GroupState<T>]) -> Result<bool>;

    fn after_update(&mut self, groups: &mut [GroupState<T>]) -> Result<()>;
}

/// Single-process synchronizer: always accepts
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSync;

impl<T: Real> StepSync<T> for LocalSync {
    fn before_update(&mut self, _groups: &mut [GroupState<T>]) -> Result<bool> {
        Ok(true)
    }

    fn after_update(&mut self, _groups: &mut [GroupState<T>]) -> Result<()> {
        Ok(())
    }
}

/// Second-order variational-inference optimizer
#[derive(Debug)]
pub struct ViOptimizer<T: Real> {
    pub(crate) config: ViConfig,
    pub(crate) groups: Vec<GroupState<T>>,
    pub(crate) state: OptimState,
    pub(crate) seed_base: u64,
    pub(crate) warmup: Option<KlWarmup>,
    pub(crate) kl_weighting: f64,
    pub(crate) rng: StdRng,
}

impl<T: Real> ViOptimizer<T> {
    pub fn new(groups: Vec<ParamGroup<T>>, config: ViConfig) -> Result<Self> {
        config.validate()?;
        let groups = groups
            .into_iter()
            .map(|g| GroupState::build(g, &config))
            .collect::<Result<Vec<_>>>()?;

        let warmup = config.warmup_kl_weighting_steps.map(|steps| KlWarmup {
            init: config.warmup_kl_weighting_init,
            target: config.kl_weighting,
            steps,
            base_l2_reg: config.l2_reg(),
            base_std_scale: config.std_scale(),
        });

        info!(
            groups = groups.len(),
            params = groups.iter().map(|g| g.params.len()).sum::<usize>(),
            components = config.num_gmm_components,
            dataset_size = config.dataset_size,
            mc_samples = config.num_mc_samples,
            l2_reg = config.l2_reg(),
            std_scale = config.std_scale(),
            "initialized VI optimizer"
        );

        Ok(Self {
            kl_weighting: config.init_kl_weighting(),
            seed_base: config.seed,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            groups,
            state: OptimState::default(),
            warmup,
        })
    }

    pub fn config(&self) -> &ViConfig {
        &self.config
    }

    pub fn groups(&self) -> &[GroupState<T>] {
        &self.groups
    }

    pub fn group(&self, index: usize) -> Option<&GroupState<T>> {
        self.groups.get(index)
    }

    /// Live parameters of one group
    pub fn params(&self, group: usize) -> &[Parameter<T>] {
        &self.groups[group].params
    }

    /// Model view for work outside a step (evaluation, gradient checks)
    pub fn model_view(&mut self) -> ModelView<'_, T> {
        ModelView::new(&mut self.groups)
    }

    pub fn state(&self) -> OptimState {
        self.state
    }

    pub fn step_count(&self) -> u64 {
        self.state.step
    }

    pub fn seed_base(&self) -> u64 {
        self.seed_base
    }

    /// KL weighting currently in effect
    pub fn kl_weighting(&self) -> f64 {
        self.kl_weighting
    }

    /// Seed used by the next training step
    pub fn seed(&self) -> u64 {
        self.state.step.wrapping_add(self.seed_base)
    }

    pub(crate) fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Draw live parameter values from the posterior
    ///
    /// Groups without a posterior std (no curvature, or no step yet) get the
    /// first component's mean instead.
    pub fn sample_params(&mut self) -> Result<()> {
        for group in &mut self.groups {
            match group.curvature.as_ref() {
                Some(curv) if curv.std().is_some() => {
                    curv.sample_params(
                        &mut group.params,
                        &group.means,
                        group.std_scale,
                        &group.pais,
                        &mut self.rng,
                    )?;
                }
                _ => {
                    for (p, param) in group.params.iter_mut().enumerate() {
                        param.data.assign(&group.means.get(p, 0).data);
                    }
                }
            }
        }
        Ok(())
    }

    /// One training step with the single-process synchronizer
    pub fn step<F>(&mut self, closure: F) -> Result<StepOutput<T>>
    where
        F: FnMut(&mut ModelView<'_, T>) -> anyhow::Result<(T, ArrayD<T>)>,
    {
        self.step_with_sync(closure, &mut LocalSync)
    }

    /// One training step, consulting `sync` around the posterior update
    pub fn step_with_sync<F, S>(&mut self, mut closure: F, sync: &mut S) -> Result<StepOutput<T>>
    where
        F: FnMut(&mut ModelView<'_, T>) -> anyhow::Result<(T, ArrayD<T>)>,
        S: StepSync<T> + ?Sized,
    {
        let m = self.config.num_mc_samples;
        let n = self.config.acc_steps;
        let draw_scale = 1.0 / (m as f64 * n as f64);
        let _span = step_span(self.state.step, self.state.acc_step, m).entered();

        let mut acc_loss = TensorAccumulator::<T>::new();
        let mut acc_prob = TensorAccumulator::<ArrayD<T>>::new();

        self.reseed(self.seed());

        for draw in 0..m {
            self.sample_params()?;
            let (loss, output) = {
                let mut view = ModelView::new(&mut self.groups);
                closure(&mut view)?
            };
            let probs = probabilities(&output)?;
            acc_loss.update(&loss, 1.0 / m as f64)?;
            acc_prob.update(&probs, 1.0 / n as f64)?;

            for group in &mut self.groups {
                accumulate_draw(group, draw_scale)?;
            }
            trace!(draw, loss = loss.as_f64(), "monte-carlo draw");
        }

        let loss = acc_loss.get().unwrap_or_else(T::zero);
        let probs = acc_prob
            .get()
            .ok_or_else(|| VissoError::config("number of MC samples", m))?;

        self.state.acc_step += 1;
        if self.state.acc_step < n {
            return Ok(StepOutput {
                loss,
                probs,
                updated: false,
            });
        }
        self.state.acc_step = 0;

        for group in &mut self.groups {
            apply_accumulated(group)?;
        }

        if !sync.before_update(&mut self.groups)? {
            warn!(step = self.state.step, "posterior update rejected");
            for group in &mut self.groups {
                group.acc_delta.reset();
            }
            return Ok(StepOutput {
                loss,
                probs,
                updated: false,
            });
        }

        self.state.step += 1;
        let step = self.state.step;
        for group in &mut self.groups {
            update_group(group, &self.config, step, loss)?;
        }
        self.adjust_kl_weighting();
        sync.after_update(&mut self.groups)?;

        record_step(step, loss.as_f64(), self.kl_weighting);
        Ok(StepOutput {
            loss,
            probs,
            updated: true,
        })
    }

    /// Advance the KL warm-up to the current step
    pub fn adjust_kl_weighting(&mut self) {
        let Some(schedule) = self.warmup.and_then(|w| w.at(self.state.step)) else {
            return;
        };
        self.kl_weighting = schedule.kl_weighting;
        for group in &mut self.groups {
            if group.l2_reg > 0.0 {
                group.l2_reg = schedule.l2_reg;
            }
            if group.std_scale > 0.0 {
                group.std_scale = schedule.std_scale;
            }
        }
        debug!(
            step = self.state.step,
            kl_weighting = schedule.kl_weighting,
            l2_reg = schedule.l2_reg,
            std_scale = schedule.std_scale,
            "adjusted KL weighting"
        );
    }

    /// Clear live and mean gradients
    pub fn zero_grad(&mut self) {
        for group in &mut self.groups {
            group.zero_grad();
        }
    }

    /// Copy the first component's mean (and gradient) into the live parameters
    pub fn copy_mean_to_params(&mut self) -> Result<()> {
        for group in &mut self.groups {
            group.copy_mean_to_params()?;
        }
        Ok(())
    }

    /// Discard a partial accumulation, e.g. after a closure error
    pub fn reset_accumulation(&mut self) {
        self.state.acc_step = 0;
        for group in &mut self.groups {
            group.reset_accumulators();
        }
    }
}

/// Fold one Monte-Carlo draw into the group's accumulators
fn accumulate_draw<T: Real>(group: &mut GroupState<T>, scale: f64) -> Result<()> {
    let grads: GradList<T> = group.params.iter().map(|p| p.grad.clone()).collect();
    group.acc_grads.update(&grads, scale)?;

    if let Some(curv) = group.curvature.as_ref() {
        let data: CurvatureList<T> = curv.data().to_vec();
        group.acc_curv.update(&data, scale)?;
    }

    let (deltas, fallback) = draw_responsibilities(group)?;
    if fallback > 0 {
        warn!(
            group = %group.name,
            elements = fallback,
            "mixture likelihood underflowed, using prior weights"
        );
    }
    group.acc_delta.update_scaled(&deltas, scale)
}

/// Responsibilities of the current live sample
///
/// Without a posterior std the prior weights stand in.
fn draw_responsibilities<T: Real>(group: &GroupState<T>) -> Result<(MixtureTable<T>, usize)> {
    let num_params = group.params.len();
    let num_components = group.num_components();
    let stds = group.curvature.as_ref().and_then(|c| c.std());
    let scale = T::lit(group.std_scale);

    let mut entries = Vec::with_capacity(num_params * num_components);
    let mut fallback = 0;
    for (p, param) in group.params.iter().enumerate() {
        let pais = group.pais.components(p);
        match stds {
            Some(std) => {
                let means: Vec<ArrayD<T>> = group
                    .means
                    .components(p)
                    .iter()
                    .map(|m| m.data.clone())
                    .collect();
                let effective: Vec<ArrayD<T>> =
                    std.components(p).iter().map(|s| s * scale).collect();
                let r = responsibilities(&param.data, &means, &effective, pais)?;
                fallback += r.fallback_count;
                entries.extend(r.deltas.into_iter().map(Some));
            }
            None => entries.extend(pais.iter().cloned().map(Some)),
        }
    }
    Ok((
        ComponentTable::from_vec(num_params, num_components, entries)?,
        fallback,
    ))
}

/// Move accumulated gradients onto the means and data onto the curvature
fn apply_accumulated<T: Real>(group: &mut GroupState<T>) -> Result<()> {
    if let Some(grads) = group.acc_grads.get() {
        for (p, grad) in grads.into_iter().enumerate() {
            let Some(grad) = grad else { continue };
            let expected = group.params[p].shape();
            if grad.shape() != expected {
                return Err(ShapeError::Tensor {
                    expected: expected.to_vec(),
                    got: grad.shape().to_vec(),
                }
                .into());
            }
            for mean in group.means.components_mut(p) {
                mean.grad = Some(grad.clone());
            }
        }
    }
    if let Some(curv) = group.curvature.as_mut() {
        if let Some(data) = group.acc_curv.get() {
            curv.set_data(data)?;
        }
    }
    Ok(())
}

fn stage_context<T: Real>(group: &GroupState<T>, config: &ViConfig, step: u64) -> StageContext {
    StageContext {
        l2_reg: group.l2_reg,
        weight_decay: group.weight_decay,
        momentum: group.momentum,
        grad_ema_decay: config.grad_ema_decay,
        step,
        curvature_ema_decay: group.curvature.as_ref().and_then(|c| c.ema_decay()),
        use_sqrt_ema: group.curvature.as_ref().is_some_and(|c| c.use_sqrt_ema()),
    }
}

fn run_pipeline<T: Real>(
    group: &mut GroupState<T>,
    flavor: GradFlavor,
    ctx: &StageContext,
) -> Result<()> {
    let pipeline = match flavor {
        GradFlavor::Raw => &group.raw_pipeline,
        GradFlavor::Preconditioned => &group.preconditioned_pipeline,
    };
    if pipeline.is_empty() {
        return Ok(());
    }
    for ((p, k), mean) in group.means.iter_mut() {
        if let Some(grad) = mean.grad.as_mut() {
            pipeline.apply(ctx, &mean.data, grad, group.param_state.get_mut(p, k))?;
        }
    }
    Ok(())
}

fn update_group<T: Real>(
    group: &mut GroupState<T>,
    config: &ViConfig,
    step: u64,
    loss: T,
) -> Result<()> {
    let ctx = stage_context(group, config, step);
    run_pipeline(group, GradFlavor::Raw, &ctx)?;

    if let Some(curv) = group.curvature.as_mut() {
        curv.set_l2_reg(group.l2_reg);
        curv.set_responsibilities(group.acc_delta.get());
        curv.step(group.std_scale > 0.0)?;
        curv.precondition_grad(&mut group.means)?;
    }

    run_pipeline(group, GradFlavor::Preconditioned, &ctx)?;
    update_mean(group);
    update_pais(group, config.mixture_weight_update, loss)?;
    group.copy_mean_to_params()?;
    group.acc_delta.reset();
    Ok(())
}

/// `mean_k -= lr · δ_k · g_k`
fn update_mean<T: Real>(group: &mut GroupState<T>) {
    let lr = T::lit(group.learning_rate);
    let deltas = group.acc_delta.get();
    for ((p, k), mean) in group.means.iter_mut() {
        let Some(grad) = mean.grad.as_ref() else {
            continue;
        };
        let dense;
        let g = match grad {
            Gradient::Dense(g) => g,
            Gradient::Sparse { .. } => {
                dense = grad.to_dense();
                &dense
            }
        };
        match deltas.and_then(|d| d.get(p, k).as_ref()) {
            Some(delta) => Zip::from(&mut mean.data)
                .and(g)
                .and(delta)
                .for_each(|m, &g, &d| *m = *m - lr * d * g),
            None => Zip::from(&mut mean.data)
                .and(g)
                .for_each(|m, &g| *m = *m - lr * g),
        }
    }
}

/// Mixture-weight update; `Frozen` keeps the weights as they are
fn update_pais<T: Real>(
    group: &mut GroupState<T>,
    mode: MixtureWeightUpdate,
    loss: T,
) -> Result<()> {
    if mode == MixtureWeightUpdate::Frozen || group.num_components() < 2 {
        return Ok(());
    }
    let Some(deltas) = group.acc_delta.get() else {
        return Ok(());
    };
    let step_size = T::lit(group.learning_rate) * loss;
    let last = group.num_components() - 1;
    let floor = T::min_positive_value();

    for p in 0..group.params.len() {
        let pais = group.pais.components(p);
        let log_last = pais[last].mapv(|v| v.max(floor).ln());
        let zeros = ArrayD::zeros(pais[last].raw_dim());
        let delta_last = deltas.get(p, last).as_ref().unwrap_or(&zeros);

        let rhos: Vec<ArrayD<T>> = pais
            .iter()
            .enumerate()
            .map(|(k, pai)| {
                let delta = deltas.get(p, k).as_ref().unwrap_or(&zeros);
                let mut rho = pai.mapv(|v| v.max(floor).ln());
                Zip::from(&mut rho)
                    .and(&log_last)
                    .and(delta)
                    .and(delta_last)
                    .for_each(|r, &l, &d, &dl| *r = *r - l - step_size * (d - dl));
                rho
            })
            .collect();

        let normalized = log_normalize(&rhos)?;
        for (pai, log_pai) in group.pais.components_mut(p).iter_mut().zip(normalized) {
            *pai = log_pai.mapv(|v| v.exp());
        }
    }
    Ok(())
}
