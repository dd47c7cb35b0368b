//! Parameter groups and the model view handed to closures
//!
//! A [`ParamGroup`] is what the caller builds: parameters, an optional
//! curvature and per-group overrides. The optimizer turns each one into a
//! [`GroupState`] holding the posterior (means and mixture weights), the
//! preprocessing pipelines and the accumulators.

use crate::config::{GradFlavor, GroupOptions, ViConfig};
use crate::curvature::Curvature;
use crate::preprocess::{ParamState, Pipeline, PipelineSpec};
use scirs2_core::ndarray_ext::{ArrayD, IxDyn};
use visso_core::{
    ComponentTable, Gradient, MixtureAccumulator, Parameter, Real, Result, TensorAccumulator,
    VissoError,
};

/// Parameters sharing hyperparameters and a curvature
#[derive(Debug)]
pub struct ParamGroup<T: Real> {
    pub name: String,
    pub params: Vec<Parameter<T>>,
    pub curvature: Option<Box<dyn Curvature<T>>>,
    pub options: GroupOptions,
}

impl<T: Real> ParamGroup<T> {
    pub fn new(name: impl Into<String>, params: Vec<Parameter<T>>) -> Self {
        Self {
            name: name.into(),
            params,
            curvature: None,
            options: GroupOptions::default(),
        }
    }

    pub fn curvature(mut self, curvature: impl Curvature<T> + 'static) -> Self {
        self.curvature = Some(Box::new(curvature));
        self
    }

    pub fn boxed_curvature(mut self, curvature: Box<dyn Curvature<T>>) -> Self {
        self.curvature = Some(curvature);
        self
    }

    pub fn options(mut self, options: GroupOptions) -> Self {
        self.options = options;
        self
    }
}

/// Accumulated per-parameter gradients
pub(crate) type GradList<T> = Vec<Option<Gradient<T>>>;
/// Accumulated per-parameter curvature data
pub(crate) type CurvatureList<T> = Vec<Option<ArrayD<T>>>;

/// Optimizer-owned state of one parameter group
#[derive(Debug)]
pub struct GroupState<T: Real> {
    pub(crate) name: String,
    pub(crate) params: Vec<Parameter<T>>,
    pub(crate) curvature: Option<Box<dyn Curvature<T>>>,
    pub(crate) means: ComponentTable<Parameter<T>>,
    pub(crate) pais: ComponentTable<ArrayD<T>>,
    pub(crate) param_state: ComponentTable<ParamState<T>>,
    pub(crate) raw_pipeline: Pipeline,
    pub(crate) preconditioned_pipeline: Pipeline,
    pub(crate) acc_grads: TensorAccumulator<GradList<T>>,
    pub(crate) acc_curv: TensorAccumulator<CurvatureList<T>>,
    pub(crate) acc_delta: MixtureAccumulator<T>,
    pub(crate) learning_rate: f64,
    pub(crate) momentum: f64,
    pub(crate) weight_decay: f64,
    pub(crate) l2_reg: f64,
    pub(crate) std_scale: f64,
}

impl<T: Real> GroupState<T> {
    pub(crate) fn build(group: ParamGroup<T>, config: &ViConfig) -> Result<Self> {
        let ParamGroup {
            name,
            params,
            mut curvature,
            options,
        } = group;

        let learning_rate = options.learning_rate.unwrap_or(config.learning_rate);
        let momentum = options.momentum.unwrap_or(config.momentum);
        let weight_decay = options.weight_decay.unwrap_or(config.weight_decay);
        if !(learning_rate >= 0.0) {
            return Err(VissoError::config("learning rate", learning_rate));
        }
        if !(momentum >= 0.0) {
            return Err(VissoError::config("momentum", momentum));
        }
        if !(weight_decay >= 0.0) {
            return Err(VissoError::config("weight decay", weight_decay));
        }

        let l2_reg = if options.regularize { config.l2_reg() } else { 0.0 };
        let std_scale = if l2_reg == 0.0 { 0.0 } else { config.std_scale() };

        let num_components = config.num_gmm_components;
        let num_params = params.len();
        let means = ComponentTable::from_fn(num_params, num_components, |p, _| {
            Parameter::new(params[p].name.clone(), params[p].data.clone())
        });
        let weight = T::one() / T::lit(num_components as f64);
        let pais = ComponentTable::from_fn(num_params, num_components, |p, _| {
            ArrayD::from_elem(IxDyn(params[p].shape()), weight)
        });
        let param_state = ComponentTable::from_fn(num_params, num_components, |p, _| {
            ParamState::zeros(params[p].shape())
        });

        let spec = PipelineSpec {
            momentum,
            weight_decay,
            has_curvature_ema: curvature
                .as_ref()
                .is_some_and(|c| c.ema_decay().is_some()),
        };
        let raw_pipeline = Pipeline::build(GradFlavor::Raw, config, spec);
        let preconditioned_pipeline = Pipeline::build(GradFlavor::Preconditioned, config, spec);

        if let Some(curv) = curvature.as_mut() {
            curv.set_num_gmm(num_components);
            if let Some(precision) = config.init_precision {
                curv.element_wise_init(precision);
                curv.step(std_scale > 0.0)?;
            }
        }

        Ok(Self {
            name,
            params,
            curvature,
            means,
            pais,
            param_state,
            raw_pipeline,
            preconditioned_pipeline,
            acc_grads: TensorAccumulator::new(),
            acc_curv: TensorAccumulator::new(),
            acc_delta: MixtureAccumulator::new(),
            learning_rate,
            momentum,
            weight_decay,
            l2_reg,
            std_scale,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live parameters
    pub fn params(&self) -> &[Parameter<T>] {
        &self.params
    }

    /// Posterior means, one per parameter × component
    pub fn means(&self) -> &ComponentTable<Parameter<T>> {
        &self.means
    }

    /// Mixture weights, one per parameter × component
    pub fn pais(&self) -> &ComponentTable<ArrayD<T>> {
        &self.pais
    }

    pub fn param_state(&self) -> &ComponentTable<ParamState<T>> {
        &self.param_state
    }

    pub fn curvature(&self) -> Option<&dyn Curvature<T>> {
        self.curvature.as_deref()
    }

    pub fn curvature_mut(&mut self) -> Option<&mut (dyn Curvature<T> + 'static)> {
        self.curvature.as_deref_mut()
    }

    pub fn raw_pipeline(&self) -> &Pipeline {
        &self.raw_pipeline
    }

    pub fn preconditioned_pipeline(&self) -> &Pipeline {
        &self.preconditioned_pipeline
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    pub fn weight_decay(&self) -> f64 {
        self.weight_decay
    }

    pub fn l2_reg(&self) -> f64 {
        self.l2_reg
    }

    pub fn std_scale(&self) -> f64 {
        self.std_scale
    }

    pub fn num_components(&self) -> usize {
        self.means.num_components()
    }

    /// Copy the first component's mean (and its gradient, where the live
    /// parameter has a gradient slot) into the live parameters
    pub(crate) fn copy_mean_to_params(&mut self) -> Result<()> {
        for (p, param) in self.params.iter_mut().enumerate() {
            param.copy_from(self.means.get(p, 0))?;
        }
        Ok(())
    }

    /// Drop partial sums of gradients, curvature data and responsibilities
    pub(crate) fn reset_accumulators(&mut self) {
        self.acc_grads.reset();
        self.acc_curv.reset();
        self.acc_delta.reset();
    }

    pub(crate) fn zero_grad(&mut self) {
        for param in &mut self.params {
            param.zero_grad();
        }
        for mean in self.means.as_mut_slice() {
            mean.zero_grad();
        }
    }
}

/// Mutable access to the live model while a closure runs
///
/// Closures read parameter values, write gradients into the live
/// parameters, and write raw curvature data into each group's curvature.
///
/// # Panics
///
/// Group and parameter indices are checked like slice indices.
#[derive(Debug)]
pub struct ModelView<'a, T: Real> {
    groups: &'a mut [GroupState<T>],
}

impl<'a, T: Real> ModelView<'a, T> {
    pub(crate) fn new(groups: &'a mut [GroupState<T>]) -> Self {
        Self { groups }
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn params(&self, group: usize) -> &[Parameter<T>] {
        &self.groups[group].params
    }

    pub fn params_mut(&mut self, group: usize) -> &mut [Parameter<T>] {
        &mut self.groups[group].params
    }

    pub fn param_mut(&mut self, group: usize, index: usize) -> &mut Parameter<T> {
        &mut self.groups[group].params[index]
    }

    /// Set a dense gradient on a live parameter
    pub fn set_grad(&mut self, group: usize, index: usize, grad: ArrayD<T>) -> Result<()> {
        self.param_mut(group, index).set_grad(grad)
    }

    pub fn curvature_mut(&mut self, group: usize) -> Option<&mut (dyn Curvature<T> + 'static)> {
        self.groups[group].curvature_mut()
    }

    /// Replace a group's raw curvature data
    pub fn set_curvature_data(
        &mut self,
        group: usize,
        data: Vec<Option<ArrayD<T>>>,
    ) -> anyhow::Result<()> {
        match self.curvature_mut(group) {
            Some(curv) => curv.set_data(data),
            None => Err(anyhow::anyhow!("group {group} has no curvature")),
        }
    }
}
