//! Gradient preprocessing pipelines
//!
//! Each parameter group owns two ordered [`Pipeline`]s, one per
//! [`GradFlavor`]. The stage list is fixed when the group is built; running a
//! pipeline applies every stage in order to each posterior mean's gradient.
//!
//! | stage            | flavor         | effect                                     |
//! |------------------|----------------|--------------------------------------------|
//! | `L2Reg`          | raw            | `g += l2_reg · θ`                          |
//! | `WeightDecay`    | preconditioned | `g += weight_decay · θ`                    |
//! | `Momentum`       | configured     | `buf = μ·buf + g; g = buf`                 |
//! | `GradEma`        | configured     | `buf = (1 − d)·buf + d·g; g = buf`         |
//! | `BiasCorrection` | preconditioned | `g *= bc2 / bc1`                           |
//! | `Lars`           | configured     | `g *= ‖θ‖ / (‖g‖ + ε)` when `‖θ‖ > thr`    |

use crate::config::{GradFlavor, ViConfig};
use scirs2_core::ndarray_ext::{ArrayD, Zip};
use visso_core::{Gradient, Real, Result, VissoError};

/// LARS is skipped for parameters whose norm is at or below this
pub const LARS_THRESHOLD: f64 = 1e-2;
/// Added to the gradient norm in the LARS ratio
pub const LARS_EPS: f64 = 1e-9;

/// One preprocessing step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    L2Reg,
    WeightDecay,
    Momentum,
    GradEma,
    BiasCorrection,
    Lars,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::L2Reg => "l2_reg",
            Stage::WeightDecay => "weight_decay",
            Stage::Momentum => "momentum",
            Stage::GradEma => "grad_ema",
            Stage::BiasCorrection => "bias_correction",
            Stage::Lars => "lars",
        }
    }
}

/// Per-mean scratch buffers
#[derive(Debug, Clone)]
pub struct ParamState<T> {
    pub momentum_buffer: ArrayD<T>,
    pub grad_ema_buffer: ArrayD<T>,
}

impl<T: Real> ParamState<T> {
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            momentum_buffer: ArrayD::zeros(shape),
            grad_ema_buffer: ArrayD::zeros(shape),
        }
    }
}

/// Hyperparameters a stage reads at run time
#[derive(Debug, Clone, Copy)]
pub struct StageContext {
    pub l2_reg: f64,
    pub weight_decay: f64,
    pub momentum: f64,
    pub grad_ema_decay: f64,
    /// Accepted steps so far, including the current one
    pub step: u64,
    /// Curvature EMA decay, when the group has a curvature
    pub curvature_ema_decay: Option<f64>,
    pub use_sqrt_ema: bool,
}

/// Group-level settings a pipeline is built from
#[derive(Debug, Clone, Copy)]
pub struct PipelineSpec {
    pub momentum: f64,
    pub weight_decay: f64,
    pub has_curvature_ema: bool,
}

/// Ordered stages for one gradient flavor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    flavor: GradFlavor,
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Select the stages that can have an effect for this flavor
    pub fn build(flavor: GradFlavor, config: &ViConfig, spec: PipelineSpec) -> Self {
        let mut stages = Vec::new();
        match flavor {
            // l2_reg changes with the KL warm-up; its value is checked per run
            GradFlavor::Raw => stages.push(Stage::L2Reg),
            GradFlavor::Preconditioned => {
                if spec.weight_decay != 0.0 {
                    stages.push(Stage::WeightDecay);
                }
            }
        }
        if config.momentum_type == flavor && spec.momentum != 0.0 {
            stages.push(Stage::Momentum);
        }
        if config.grad_ema_type == flavor && config.grad_ema_decay != 1.0 {
            stages.push(Stage::GradEma);
        }
        if flavor == GradFlavor::Preconditioned && config.bias_correction && spec.has_curvature_ema
        {
            stages.push(Stage::BiasCorrection);
        }
        if config.lars && config.lars_type == flavor {
            stages.push(Stage::Lars);
        }
        Self { flavor, stages }
    }

    pub fn flavor(&self) -> GradFlavor {
        self.flavor
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage on one gradient
    pub fn apply<T: Real>(
        &self,
        ctx: &StageContext,
        data: &ArrayD<T>,
        grad: &mut Gradient<T>,
        state: &mut ParamState<T>,
    ) -> Result<()> {
        for stage in &self.stages {
            apply_stage(*stage, ctx, data, grad, state)?;
        }
        Ok(())
    }
}

fn apply_stage<T: Real>(
    stage: Stage,
    ctx: &StageContext,
    data: &ArrayD<T>,
    grad: &mut Gradient<T>,
    state: &mut ParamState<T>,
) -> Result<()> {
    match stage {
        Stage::L2Reg => add_scaled_data(grad, data, ctx.l2_reg, "l2 regularization"),
        Stage::WeightDecay => add_scaled_data(grad, data, ctx.weight_decay, "weight_decay"),
        Stage::Momentum => {
            if ctx.momentum != 0.0 {
                let mu = T::lit(ctx.momentum);
                let g = grad.densify();
                Zip::from(&mut state.momentum_buffer)
                    .and(&*g)
                    .for_each(|b, &v| *b = mu * *b + v);
                g.assign(&state.momentum_buffer);
            }
            Ok(())
        }
        Stage::GradEma => {
            if ctx.grad_ema_decay != 1.0 {
                let d = T::lit(ctx.grad_ema_decay);
                let keep = T::one() - d;
                let g = grad.densify();
                Zip::from(&mut state.grad_ema_buffer)
                    .and(&*g)
                    .for_each(|b, &v| *b = keep * *b + d * v);
                g.assign(&state.grad_ema_buffer);
            }
            Ok(())
        }
        Stage::BiasCorrection => {
            if let Some(curv_decay) = ctx.curvature_ema_decay {
                let exponent = i32::try_from(ctx.step).unwrap_or(i32::MAX);
                let beta1 = 1.0 - ctx.grad_ema_decay;
                let beta2 = 1.0 - curv_decay;
                let bc1 = 1.0 - beta1.powi(exponent);
                let mut bc2 = 1.0 - beta2.powi(exponent);
                if ctx.use_sqrt_ema {
                    bc2 = bc2.sqrt();
                }
                if bc1 != 0.0 {
                    grad.scale(T::lit(bc2 / bc1));
                }
            }
            Ok(())
        }
        Stage::Lars => {
            let d_norm = data.iter().fold(T::zero(), |acc, &v| acc + v * v).sqrt();
            if d_norm.as_f64() > LARS_THRESHOLD {
                let rate = d_norm / (grad.norm() + T::lit(LARS_EPS));
                grad.scale(rate);
            }
            Ok(())
        }
    }
}

fn add_scaled_data<T: Real>(
    grad: &mut Gradient<T>,
    data: &ArrayD<T>,
    coeff: f64,
    option: &'static str,
) -> Result<()> {
    if coeff == 0.0 {
        return Ok(());
    }
    match grad {
        Gradient::Sparse { .. } => Err(VissoError::SparseGradient { option }),
        Gradient::Dense(g) => {
            let c = T::lit(coeff);
            g.zip_mut_with(data, |gv, &dv| *gv = *gv + c * dv);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scirs2_core::ndarray_ext::array;

    fn ctx() -> StageContext {
        StageContext {
            l2_reg: 0.0,
            weight_decay: 0.0,
            momentum: 0.0,
            grad_ema_decay: 1.0,
            step: 1,
            curvature_ema_decay: None,
            use_sqrt_ema: false,
        }
    }

    fn pipeline_spec() -> PipelineSpec {
        PipelineSpec {
            momentum: 0.0,
            weight_decay: 0.0,
            has_curvature_ema: false,
        }
    }

    #[test]
    fn test_default_pipelines() {
        let config = ViConfig::default();
        let raw = Pipeline::build(GradFlavor::Raw, &config, pipeline_spec());
        assert_eq!(raw.stages(), &[Stage::L2Reg]);
        let pre = Pipeline::build(GradFlavor::Preconditioned, &config, pipeline_spec());
        assert!(pre.is_empty());
    }

    #[test]
    fn test_stage_selection_and_order() {
        let config = ViConfig::default()
            .momentum_type(GradFlavor::Preconditioned)
            .grad_ema_decay(0.1)
            .grad_ema_type(GradFlavor::Preconditioned)
            .bias_correction(true)
            .lars(true, GradFlavor::Preconditioned);
        let spec = PipelineSpec {
            momentum: 0.9,
            weight_decay: 1e-4,
            has_curvature_ema: true,
        };
        let pre = Pipeline::build(GradFlavor::Preconditioned, &config, spec);
        assert_eq!(
            pre.stages(),
            &[
                Stage::WeightDecay,
                Stage::Momentum,
                Stage::GradEma,
                Stage::BiasCorrection,
                Stage::Lars
            ]
        );
        let raw = Pipeline::build(GradFlavor::Raw, &config, spec);
        assert_eq!(raw.stages(), &[Stage::L2Reg]);
    }

    #[test]
    fn test_l2_and_sparse_rejection() {
        let data = array![1.0, 2.0].into_dyn();
        let mut state = ParamState::zeros(&[2]);
        let pipeline = Pipeline::build(GradFlavor::Raw, &ViConfig::default(), pipeline_spec());
        let ctx = StageContext {
            l2_reg: 0.5,
            ..ctx()
        };

        let mut grad = Gradient::Dense(array![0.0, 0.0].into_dyn());
        pipeline.apply(&ctx, &data, &mut grad, &mut state).unwrap();
        assert_eq!(grad, Gradient::Dense(array![0.5, 1.0].into_dyn()));

        let mut sparse = Gradient::sparse(vec![0], vec![1.0], &[2]).unwrap();
        let err = pipeline
            .apply(&ctx, &data, &mut sparse, &mut state)
            .unwrap_err();
        assert!(matches!(
            err,
            VissoError::SparseGradient {
                option: "l2 regularization"
            }
        ));

        // a zero coefficient leaves sparse gradients alone
        let idle = StageContext {
            l2_reg: 0.0,
            ..ctx
        };
        assert!(pipeline.apply(&idle, &data, &mut sparse, &mut state).is_ok());
    }

    #[test]
    fn test_momentum_and_ema_buffers() {
        let data = array![0.0].into_dyn();
        let mut state = ParamState::zeros(&[1]);
        let ctx = StageContext {
            momentum: 0.5,
            grad_ema_decay: 0.25,
            ..ctx()
        };

        let mut grad = Gradient::Dense(array![2.0].into_dyn());
        apply_stage(Stage::Momentum, &ctx, &data, &mut grad, &mut state).unwrap();
        let mut grad2 = Gradient::Dense(array![2.0].into_dyn());
        apply_stage(Stage::Momentum, &ctx, &data, &mut grad2, &mut state).unwrap();
        assert_eq!(grad2, Gradient::Dense(array![3.0].into_dyn()));

        let mut g = Gradient::Dense(array![4.0].into_dyn());
        apply_stage(Stage::GradEma, &ctx, &data, &mut g, &mut state).unwrap();
        assert_eq!(g, Gradient::Dense(array![1.0].into_dyn()));
        assert_eq!(state.grad_ema_buffer, array![1.0].into_dyn());

        // sparse gradients are densified by buffered stages
        let mut sparse = Gradient::sparse(vec![0], vec![4.0], &[1]).unwrap();
        apply_stage(Stage::GradEma, &ctx, &data, &mut sparse, &mut state).unwrap();
        assert!(!sparse.is_sparse());
    }

    #[test]
    fn test_bias_correction() {
        let data = array![0.0].into_dyn();
        let mut state = ParamState::zeros(&[1]);
        let ctx = StageContext {
            grad_ema_decay: 0.1,
            step: 1,
            curvature_ema_decay: Some(0.01),
            ..ctx()
        };
        let mut g: Gradient<f64> = Gradient::Dense(array![1.0].into_dyn());
        apply_stage(Stage::BiasCorrection, &ctx, &data, &mut g, &mut state).unwrap();
        // bc1 = 0.1, bc2 = 0.01
        assert!((g.to_dense()[[0]] - 0.1).abs() < 1e-12);

        let sqrt_ctx = StageContext {
            use_sqrt_ema: true,
            ..ctx
        };
        let mut g: Gradient<f64> = Gradient::Dense(array![1.0].into_dyn());
        apply_stage(Stage::BiasCorrection, &sqrt_ctx, &data, &mut g, &mut state).unwrap();
        assert!((g.to_dense()[[0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_lars_threshold() {
        let mut state = ParamState::zeros(&[2]);
        let small = array![1e-3, 0.0].into_dyn();
        let mut g: Gradient<f64> = Gradient::Dense(array![3.0, 4.0].into_dyn());
        apply_stage(Stage::Lars, &ctx(), &small, &mut g, &mut state).unwrap();
        assert_eq!(g, Gradient::Dense(array![3.0, 4.0].into_dyn()));

        let big = array![0.0, 10.0].into_dyn();
        apply_stage(Stage::Lars, &ctx(), &big, &mut g, &mut state).unwrap();
        assert!((g.norm() - 10.0).abs() < 1e-6);
    }
}
