//! Curvature estimates and the diagonal (VOGN-style) implementation
//!
//! A [`Curvature`] belongs to one parameter group. The model closure writes
//! raw curvature `data` (one tensor per parameter) during each Monte-Carlo
//! draw; the optimizer accumulates it, hands the average back through
//! [`Curvature::set_data`], and then calls [`Curvature::step`] to refresh the
//! regularized inverse and the posterior standard deviation of every mixture
//! component.
//!
//! # Example
//!
//! ```
//! use scirs2_core::ndarray_ext::array;
//! use visso_core::Parameter;
//! use visso_optim::curvature::{Curvature, DiagCurvature, DiagCurvatureConfig};
//!
//! let params = vec![Parameter::new("w", array![0.0, 0.0].into_dyn())];
//! let mut curv = DiagCurvature::<f64>::new(&params, DiagCurvatureConfig::vogn()).unwrap();
//! curv.set_num_gmm(1);
//! curv.element_wise_init(4.0);
//! curv.step(true).unwrap();
//! let std = curv.std().unwrap();
//! assert!((std.get(0, 0)[[0]] - 0.5).abs() < 1e-6);
//! ```

use anyhow::{anyhow, ensure};
use scirs2_core::ndarray_ext::{ArrayD, IxDyn, Zip};
use scirs2_core::random::{rngs::StdRng, Rng};
use scirs2_core::StandardNormal;
use std::fmt::Debug;
use visso_core::{ComponentTable, Gradient, MixtureTable, Parameter, Real, Result, VissoError};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Per-group curvature collaborator
pub trait Curvature<T: Real>: Debug + Send {
    /// Raw curvature data, one slot per parameter
    fn data(&self) -> &[Option<ArrayD<T>>];

    fn data_mut(&mut self) -> &mut [Option<ArrayD<T>>];

    /// Replace the raw data; the length must match the parameter count
    fn set_data(&mut self, data: Vec<Option<ArrayD<T>>>) -> anyhow::Result<()>;

    /// Regularized inverse per parameter × component, once computed
    fn inv(&self) -> Option<&ComponentTable<ArrayD<T>>>;

    /// Posterior standard deviation per parameter × component, once computed
    fn std(&self) -> Option<&ComponentTable<ArrayD<T>>>;

    fn std_mut(&mut self) -> Option<&mut ComponentTable<ArrayD<T>>>;

    /// Fold the current data into the estimate and recompute the inverse
    /// (and the std when `update_std` is set)
    fn step(&mut self, update_std: bool) -> anyhow::Result<()>;

    /// Draw live parameter values from the mixture posterior
    fn sample_params(
        &self,
        params: &mut [Parameter<T>],
        means: &ComponentTable<Parameter<T>>,
        std_scale: f64,
        pais: &ComponentTable<ArrayD<T>>,
        rng: &mut StdRng,
    ) -> anyhow::Result<()>;

    /// Multiply every mean gradient by the matching inverse
    fn precondition_grad(&self, means: &mut ComponentTable<Parameter<T>>) -> anyhow::Result<()>;

    /// Start the estimate from a constant diagonal precision
    fn element_wise_init(&mut self, value: f64);

    fn set_num_gmm(&mut self, num_components: usize);

    fn set_l2_reg(&mut self, l2_reg: f64);

    /// Responsibilities weighting the next [`Curvature::step`]
    fn set_responsibilities(&mut self, deltas: Option<&MixtureTable<T>>);

    /// EMA weight of new data, if the estimate is a moving average
    fn ema_decay(&self) -> Option<f64>;

    /// Whether the estimate tracks a square root (affects bias correction)
    fn use_sqrt_ema(&self) -> bool {
        false
    }
}

/// Settings for [`DiagCurvature`]
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiagCurvatureConfig {
    /// Weight of new data in the running average (1 keeps only the latest)
    pub ema_decay: f64,
    /// Added to the diagonal before inversion
    pub damping: f64,
    pub use_sqrt_ema: bool,
}

impl Default for DiagCurvatureConfig {
    fn default() -> Self {
        Self {
            ema_decay: 1.0,
            damping: 1e-7,
            use_sqrt_ema: false,
        }
    }
}

impl DiagCurvatureConfig {
    /// Variational Online Gauss-Newton preset
    pub fn vogn() -> Self {
        Self::default().ema_decay(0.01).damping(1e-7)
    }

    pub fn ema_decay(mut self, ema_decay: f64) -> Self {
        self.ema_decay = ema_decay;
        self
    }

    pub fn damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn use_sqrt_ema(mut self, enabled: bool) -> Self {
        self.use_sqrt_ema = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.ema_decay > 0.0 && self.ema_decay <= 1.0) {
            return Err(VissoError::config("curvature EMA decay", self.ema_decay));
        }
        if !(self.damping >= 0.0) {
            return Err(VissoError::config("damping", self.damping));
        }
        Ok(())
    }
}

/// Diagonal curvature with one running estimate per mixture component
#[derive(Debug, Clone)]
pub struct DiagCurvature<T> {
    config: DiagCurvatureConfig,
    names: Vec<String>,
    shapes: Vec<Vec<usize>>,
    num_components: usize,
    l2_reg: f64,
    data: Vec<Option<ArrayD<T>>>,
    ema: Option<ComponentTable<ArrayD<T>>>,
    inv: Option<ComponentTable<ArrayD<T>>>,
    std: Option<ComponentTable<ArrayD<T>>>,
    deltas: Option<MixtureTable<T>>,
}

impl<T: Real> DiagCurvature<T> {
    /// Curvature for the given parameters, with a single component until
    /// [`Curvature::set_num_gmm`] says otherwise
    pub fn new(params: &[Parameter<T>], config: DiagCurvatureConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            names: params.iter().map(|p| p.name.clone()).collect(),
            shapes: params.iter().map(|p| p.shape().to_vec()).collect(),
            num_components: 1,
            l2_reg: 0.0,
            data: vec![None; params.len()],
            ema: None,
            inv: None,
            std: None,
            deltas: None,
        })
    }

    pub fn config(&self) -> &DiagCurvatureConfig {
        &self.config
    }

    pub fn l2_reg(&self) -> f64 {
        self.l2_reg
    }

    /// Running estimate per parameter × component
    pub fn ema(&self) -> Option<&ComponentTable<ArrayD<T>>> {
        self.ema.as_ref()
    }

    fn delta(&self, param: usize, component: usize) -> Option<&ArrayD<T>> {
        self.deltas
            .as_ref()
            .filter(|d| d.num_params() == self.shapes.len() && d.num_components() == self.num_components)
            .and_then(|d| d.get(param, component).as_ref())
    }

    fn update_ema(&mut self) -> anyhow::Result<()> {
        let decay = T::lit(self.config.ema_decay);
        let num_params = self.shapes.len();
        let mut next = Vec::with_capacity(num_params * self.num_components);
        for p in 0..num_params {
            for k in 0..self.num_components {
                let prev = self.ema.as_ref().map(|e| e.get(p, k));
                let value = match (&self.data[p], prev) {
                    (Some(data), Some(prev)) => {
                        ensure!(
                            data.shape() == prev.shape(),
                            "curvature data for {} has shape {:?}, expected {:?}",
                            self.names[p],
                            data.shape(),
                            prev.shape()
                        );
                        let mut ema = prev.clone();
                        match self.delta(p, k) {
                            Some(delta) => Zip::from(&mut ema).and(data).and(delta).for_each(
                                |e, &d, &w| *e = *e + decay * w * (d - *e),
                            ),
                            None => Zip::from(&mut ema)
                                .and(data)
                                .for_each(|e, &d| *e = *e + decay * (d - *e)),
                        }
                        ema
                    }
                    (Some(data), None) => {
                        ensure!(
                            data.shape() == self.shapes[p].as_slice(),
                            "curvature data for {} has shape {:?}, expected {:?}",
                            self.names[p],
                            data.shape(),
                            self.shapes[p]
                        );
                        data.clone()
                    }
                    (None, Some(prev)) => prev.clone(),
                    (None, None) => {
                        return Err(anyhow!(
                            "no curvature data or initial precision for {}",
                            self.names[p]
                        ))
                    }
                };
                next.push(value);
            }
        }
        self.ema = Some(ComponentTable::from_vec(
            num_params,
            self.num_components,
            next,
        )?);
        Ok(())
    }
}

fn flat<T: Real>(arr: &ArrayD<T>) -> Vec<T> {
    arr.iter().copied().collect()
}

impl<T: Real> Curvature<T> for DiagCurvature<T> {
    fn data(&self) -> &[Option<ArrayD<T>>] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [Option<ArrayD<T>>] {
        &mut self.data
    }

    fn set_data(&mut self, data: Vec<Option<ArrayD<T>>>) -> anyhow::Result<()> {
        ensure!(
            data.len() == self.shapes.len(),
            "expected curvature data for {} parameters, got {}",
            self.shapes.len(),
            data.len()
        );
        self.data = data;
        Ok(())
    }

    fn inv(&self) -> Option<&ComponentTable<ArrayD<T>>> {
        self.inv.as_ref()
    }

    fn std(&self) -> Option<&ComponentTable<ArrayD<T>>> {
        self.std.as_ref()
    }

    fn std_mut(&mut self) -> Option<&mut ComponentTable<ArrayD<T>>> {
        self.std.as_mut()
    }

    fn step(&mut self, update_std: bool) -> anyhow::Result<()> {
        self.update_ema()?;
        let Some(ema) = &self.ema else {
            return Err(anyhow!("curvature estimate missing after update"));
        };
        let shift = T::lit(self.l2_reg + self.config.damping);
        let inv = ema.map(|_, e| e.mapv(|v| T::one() / (v + shift)));
        if update_std {
            self.std = Some(inv.map(|_, i| i.mapv(|v| v.sqrt())));
        }
        self.inv = Some(inv);
        Ok(())
    }

    fn sample_params(
        &self,
        params: &mut [Parameter<T>],
        means: &ComponentTable<Parameter<T>>,
        std_scale: f64,
        pais: &ComponentTable<ArrayD<T>>,
        rng: &mut StdRng,
    ) -> anyhow::Result<()> {
        let std = self
            .std
            .as_ref()
            .ok_or_else(|| anyhow!("posterior std has not been computed"))?;
        ensure!(
            params.len() == means.num_params() && params.len() == std.num_params(),
            "sampling {} parameters with {} means and {} stds",
            params.len(),
            means.num_params(),
            std.num_params()
        );
        let scale = T::lit(std_scale);
        for (p, param) in params.iter_mut().enumerate() {
            let mean_vals: Vec<Vec<T>> = means.components(p).iter().map(|m| flat(&m.data)).collect();
            let std_vals: Vec<Vec<T>> = std.components(p).iter().map(flat).collect();
            let pai_vals: Vec<Vec<T>> = pais.components(p).iter().map(flat).collect();
            let numel = param.numel();
            ensure!(
                mean_vals
                    .iter()
                    .chain(std_vals.iter())
                    .chain(pai_vals.iter())
                    .all(|v| v.len() == numel),
                "posterior of {} does not match its {:?} parameter",
                self.names.get(p).map_or("parameter", String::as_str),
                param.shape()
            );
            let last = mean_vals.len().saturating_sub(1);

            let mut sample = Vec::with_capacity(param.numel());
            for i in 0..numel {
                let k = if last == 0 {
                    0
                } else {
                    let u = T::lit(rng.random::<f64>());
                    let mut cumulative = T::zero();
                    let mut chosen = last;
                    for (k, weights) in pai_vals.iter().enumerate() {
                        cumulative = cumulative + weights[i];
                        if u < cumulative {
                            chosen = k;
                            break;
                        }
                    }
                    chosen
                };
                let z: f64 = rng.sample(StandardNormal);
                let z = T::lit(z);
                sample.push(mean_vals[k][i] + scale * std_vals[k][i] * z);
            }
            let sample = ArrayD::from_shape_vec(IxDyn(param.shape()), sample)?;
            param.data.assign(&sample);
        }
        Ok(())
    }

    fn precondition_grad(&self, means: &mut ComponentTable<Parameter<T>>) -> anyhow::Result<()> {
        let inv = self
            .inv
            .as_ref()
            .ok_or_else(|| anyhow!("curvature inverse has not been computed"))?;
        inv.check_layout(means)?;
        for ((p, k), mean) in means.iter_mut() {
            let factor = inv.get(p, k);
            if let Some(grad) = &mean.grad {
                ensure!(
                    grad.shape() == factor.shape(),
                    "gradient of {} has shape {:?}, curvature has {:?}",
                    mean.name,
                    grad.shape(),
                    factor.shape()
                );
            }
            match &mut mean.grad {
                Some(Gradient::Dense(g)) => g.zip_mut_with(factor, |gv, &f| *gv = *gv * f),
                Some(Gradient::Sparse {
                    indices, values, ..
                }) => {
                    let factor = flat(factor);
                    for (idx, val) in indices.iter().zip(values.iter_mut()) {
                        let f = factor
                            .get(*idx)
                            .ok_or_else(|| anyhow!("sparse index {idx} out of range for {}", mean.name))?;
                        *val = *val * *f;
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    fn element_wise_init(&mut self, value: f64) {
        let value = T::lit(value);
        let shapes = &self.shapes;
        self.ema = Some(ComponentTable::from_fn(
            shapes.len(),
            self.num_components,
            |p, _| ArrayD::from_elem(IxDyn(&shapes[p]), value),
        ));
    }

    fn set_num_gmm(&mut self, num_components: usize) {
        if num_components != self.num_components {
            self.num_components = num_components;
            self.ema = None;
            self.inv = None;
            self.std = None;
            self.deltas = None;
        }
    }

    fn set_l2_reg(&mut self, l2_reg: f64) {
        self.l2_reg = l2_reg;
    }

    fn set_responsibilities(&mut self, deltas: Option<&MixtureTable<T>>) {
        self.deltas = deltas.cloned();
    }

    fn ema_decay(&self) -> Option<f64> {
        Some(self.config.ema_decay)
    }

    fn use_sqrt_ema(&self) -> bool {
        self.config.use_sqrt_ema
    }
}
