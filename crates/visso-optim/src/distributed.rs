//! Data-parallel variant of the VI optimizer
//!
//! Each worker runs its own Monte-Carlo draws. Before the posterior update the
//! accumulated mean gradients and curvature data are reduced across workers;
//! after it, the updated means and posterior stds are gathered back. A worker
//! whose communicator reports the update as not applied leaves its posterior
//! untouched for that step.
//!
//! Workers in different Monte-Carlo groups use disjoint seed streams: the
//! seed base is offset by `mc_group_id · total_steps`.

use crate::group::{GroupState, ModelView, ParamGroup};
use crate::predict::Prediction;
use crate::vi::{StepOutput, StepSync, ViOptimizer};
use crate::ViConfig;
use scirs2_core::ndarray_ext::ArrayD;
use visso_core::{Real, Result};

/// Collective operations over worker-local tensors
pub trait Communicator<T: Real> {
    /// Reduce the tensors across workers in place
    fn reduce_scatter(&mut self, tensors: &mut [&mut ArrayD<T>]) -> anyhow::Result<()>;

    /// Broadcast the owners' values of the tensors in place
    fn all_gather(&mut self, tensors: &mut [&mut ArrayD<T>]) -> anyhow::Result<()>;

    /// Whether the last reduction resulted in an applied update on this worker
    fn is_updated(&self) -> bool;
}

/// Tensor attribute pulled out of every group for a collective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extractor {
    MeanGrad,
    CurvatureData,
    MeanData,
    CurvatureStd,
}

impl Extractor {
    fn reads_mean(self) -> bool {
        matches!(self, Extractor::MeanGrad | Extractor::MeanData)
    }
}

/// Mutable references to the tensors named by `extractors`, group by group
///
/// A list names at most one mean attribute and one curvature attribute; any
/// further entry of the same kind is ignored. Missing tensors (no gradient,
/// no curvature, no std yet) are skipped.
pub fn extract<'a, T: Real>(
    groups: &'a mut [GroupState<T>],
    extractors: &[Extractor],
) -> Vec<&'a mut ArrayD<T>> {
    let mean_attr = extractors.iter().copied().find(|e| e.reads_mean());
    let curv_attr = extractors.iter().copied().find(|e| !e.reads_mean());

    let mut tensors = Vec::new();
    for group in groups.iter_mut() {
        let GroupState {
            means, curvature, ..
        } = group;

        match mean_attr {
            Some(Extractor::MeanGrad) => {
                for mean in means.as_mut_slice() {
                    if let Some(grad) = mean.grad.as_mut() {
                        tensors.push(grad.densify());
                    }
                }
            }
            Some(Extractor::MeanData) => {
                for mean in means.as_mut_slice() {
                    tensors.push(&mut mean.data);
                }
            }
            _ => {}
        }

        if let Some(curv) = curvature.as_mut() {
            match curv_attr {
                Some(Extractor::CurvatureData) => {
                    for data in curv.data_mut().iter_mut() {
                        if let Some(data) = data.as_mut() {
                            tensors.push(data);
                        }
                    }
                }
                Some(Extractor::CurvatureStd) => {
                    if let Some(std) = curv.std_mut() {
                        tensors.extend(std.as_mut_slice().iter_mut());
                    }
                }
                _ => {}
            }
        }
    }
    tensors
}

/// Synchronizer driving a [`Communicator`] around the posterior update
struct CommSync<'c, C> {
    communicator: &'c mut C,
}

impl<T: Real, C: Communicator<T>> StepSync<T> for CommSync<'_, C> {
    fn before_update(&mut self, groups: &mut [GroupState<T>]) -> Result<bool> {
        let extractors = DistributedViOptimizer::<T, C>::extractors_for_rsv();
        let mut tensors = extract(groups, &extractors);
        self.communicator.reduce_scatter(&mut tensors)?;
        Ok(self.communicator.is_updated())
    }

    fn after_update(&mut self, groups: &mut [GroupState<T>]) -> Result<()> {
        let extractors = DistributedViOptimizer::<T, C>::extractors_for_agv();
        let mut tensors = extract(groups, &extractors);
        self.communicator.all_gather(&mut tensors)?;
        Ok(())
    }
}

/// [`ViOptimizer`] whose posterior updates go through a [`Communicator`]
#[derive(Debug)]
pub struct DistributedViOptimizer<T: Real, C> {
    inner: ViOptimizer<T>,
    communicator: C,
    mc_group_id: u64,
}

impl<T: Real, C: Communicator<T>> DistributedViOptimizer<T, C> {
    pub fn new(
        groups: Vec<ParamGroup<T>>,
        config: ViConfig,
        communicator: C,
        mc_group_id: u64,
    ) -> Result<Self> {
        let mut inner = ViOptimizer::new(groups, config)?;
        let offset = mc_group_id.wrapping_mul(inner.config.total_steps);
        inner.seed_base = inner.seed_base.wrapping_add(offset);
        inner.reseed(inner.seed_base);
        Ok(Self {
            inner,
            communicator,
            mc_group_id,
        })
    }

    /// Tensors reduced before the update
    pub fn extractors_for_rsv() -> Vec<Extractor> {
        vec![Extractor::MeanGrad, Extractor::CurvatureData]
    }

    /// Tensors gathered after the update
    pub fn extractors_for_agv() -> Vec<Extractor> {
        vec![Extractor::MeanData, Extractor::CurvatureStd]
    }

    pub fn mc_group_id(&self) -> u64 {
        self.mc_group_id
    }

    pub fn optimizer(&self) -> &ViOptimizer<T> {
        &self.inner
    }

    pub fn optimizer_mut(&mut self) -> &mut ViOptimizer<T> {
        &mut self.inner
    }

    pub fn communicator(&self) -> &C {
        &self.communicator
    }

    pub fn communicator_mut(&mut self) -> &mut C {
        &mut self.communicator
    }

    pub fn step<F>(&mut self, closure: F) -> Result<StepOutput<T>>
    where
        F: FnMut(&mut ModelView<'_, T>) -> anyhow::Result<(T, ArrayD<T>)>,
    {
        let mut sync = CommSync {
            communicator: &mut self.communicator,
        };
        let output = self.inner.step_with_sync(closure, &mut sync)?;
        if self.communicator.is_updated() {
            self.inner.copy_mean_to_params()?;
        }
        Ok(output)
    }

    pub fn prediction<F>(
        &mut self,
        forward: F,
        mc: Option<usize>,
        keep_probs: bool,
    ) -> Result<Prediction<T>>
    where
        F: FnMut(&ModelView<'_, T>) -> anyhow::Result<ArrayD<T>>,
    {
        self.inner.prediction(forward, mc, keep_probs)
    }

    pub fn zero_grad(&mut self) {
        self.inner.zero_grad();
    }
}
