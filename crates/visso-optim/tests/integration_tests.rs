//! End-to-end tests of the VI optimizer state machine

use anyhow::Result;
use scirs2_core::ndarray_ext::{array, ArrayD, Axis, Ix1, IxDyn};
use visso_core::{Gradient, Parameter, ShapeError, VissoError};
use visso_optim::{
    Communicator, DiagCurvature, DiagCurvatureConfig, DistributedViOptimizer, GradFlavor,
    GroupOptions, MixtureWeightUpdate, ModelView, ParamGroup, ViConfig, ViOptimizer,
};

/// Logistic regression on a fixed four-example batch
///
/// Writes the mean gradient into the live parameters and the mean squared
/// per-example gradient into the curvature, when there is one.
fn logistic(model: &mut ModelView<'_, f64>) -> anyhow::Result<(f64, ArrayD<f64>)> {
    let x = array![[1.0, 0.5], [-0.5, 1.0], [0.3, -1.2], [-1.0, -0.4]];
    let y = [1.0, 1.0, 0.0, 0.0];
    let w = model.params(0)[0].data.clone().into_dimensionality::<Ix1>()?;
    let b = model.params(0)[1].data[[0]];

    let logits = x.dot(&w) + b;
    let mut loss = 0.0;
    let mut gw = ArrayD::zeros(IxDyn(&[2]));
    let mut gb = ArrayD::zeros(IxDyn(&[1]));
    let mut cw = ArrayD::zeros(IxDyn(&[2]));
    let mut cb = ArrayD::zeros(IxDyn(&[1]));
    let n = y.len() as f64;
    for (i, (&z, &t)) in logits.iter().zip(y.iter()).enumerate() {
        let p = 1.0 / (1.0 + (-z).exp());
        loss -= (t * p.ln() + (1.0 - t) * (1.0 - p).ln()) / n;
        let r = p - t;
        for j in 0..2 {
            let g = r * x[[i, j]];
            gw[[j]] += g / n;
            cw[[j]] += g * g / n;
        }
        gb[[0]] += r / n;
        cb[[0]] += r * r / n;
    }
    model.set_grad(0, 0, gw)?;
    model.set_grad(0, 1, gb)?;
    if model.curvature_mut(0).is_some() {
        model.set_curvature_data(0, vec![Some(cw), Some(cb)])?;
    }
    Ok((loss, logits.into_dyn()))
}

fn logistic_params() -> Vec<Parameter<f64>> {
    vec![
        Parameter::new("weight", array![0.0, 0.0].into_dyn()),
        Parameter::new("bias", array![0.0].into_dyn()),
    ]
}

fn vogn(config: ViConfig) -> Result<ViOptimizer<f64>> {
    let params = logistic_params();
    let curvature = DiagCurvature::new(&params, DiagCurvatureConfig::vogn())?;
    Ok(ViOptimizer::new(
        vec![ParamGroup::new("logistic", params).curvature(curvature)],
        config,
    )?)
}

#[test]
fn test_end_to_end_single_step() -> Result<()> {
    let config = ViConfig::new(100.0)
        .num_mc_samples(1)
        .val_num_mc_samples(0)
        .acc_steps(1);
    let mut opt = ViOptimizer::new(vec![ParamGroup::new("g", logistic_params())], config)?;

    let out = opt.step(|model| {
        let (_, _) = logistic(model)?;
        Ok((0.5, array![[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]].into_dyn()))
    })?;

    assert_eq!(out.loss, 0.5);
    assert_eq!(out.probs.shape(), &[2, 3]);
    assert_eq!(opt.step_count(), 1);
    let group = &opt.groups()[0];
    for (p, param) in group.params().iter().enumerate() {
        assert_eq!(param.data, group.means().get(p, 0).data);
    }
    Ok(())
}

#[test]
fn test_vogn_reduces_loss() -> Result<()> {
    let config = ViConfig::vogn(400.0)
        .learning_rate(0.5)
        .num_mc_samples(4)
        .no_warmup()
        .init_precision(1.0);
    let mut opt = vogn(config)?;

    let first = opt.step(logistic)?.loss;
    let mut last = first;
    for _ in 0..60 {
        last = opt.step(logistic)?.loss;
    }
    assert!(last < first, "loss went from {first} to {last}");

    let pred = opt.prediction(
        |model| {
            let w = model.params(0)[0].data.clone().into_dimensionality::<Ix1>()?;
            let x = array![[1.0, 0.5], [0.3, -1.2]];
            Ok(x.dot(&w).into_dyn())
        },
        Some(0),
        false,
    )?;
    assert!(pred.probs[[0]] > pred.probs[[1]]);
    Ok(())
}

#[test]
fn test_gradient_accumulation_gating() -> Result<()> {
    let config = ViConfig::new(50.0).num_mc_samples(2).acc_steps(2);
    let mut opt = vogn(config.init_precision(1.0))?;
    let before = opt.groups()[0].means().clone();

    let out = opt.step(logistic)?;
    assert!(!out.updated);
    assert!(out.loss > 0.0);
    assert_eq!(out.probs.len(), 4);
    assert_eq!(opt.step_count(), 0);
    assert_eq!(opt.groups()[0].means(), &before);

    let out = opt.step(logistic)?;
    assert!(out.updated);
    assert_eq!(opt.step_count(), 1);
    assert_ne!(opt.groups()[0].means(), &before);
    Ok(())
}

#[test]
fn test_probabilities_scale_with_accumulation_steps() -> Result<()> {
    let config = ViConfig::new(10.0).num_mc_samples(3).acc_steps(2);
    let mut opt = ViOptimizer::new(vec![ParamGroup::new("g", logistic_params())], config)?;
    fn even_odds(model: &mut ModelView<'_, f64>) -> anyhow::Result<(f64, ArrayD<f64>)> {
        logistic(model)?;
        Ok((1.0, array![0.0, 0.0].into_dyn()))
    }

    // sigmoid(0) = 0.5 per draw, three draws at 1/2 each
    let out = opt.step(even_odds)?;
    assert!(!out.updated);
    assert!((out.loss - 1.0).abs() < 1e-12);
    assert_eq!(out.probs, array![0.75, 0.75].into_dyn());

    let out = opt.step(even_odds)?;
    assert!(out.updated);
    assert_eq!(out.probs, array![0.75, 0.75].into_dyn());
    Ok(())
}

#[test]
fn test_kl_warmup_is_monotone_then_fixed() -> Result<()> {
    let config = ViConfig::new(10.0)
        .num_mc_samples(1)
        .warmup_kl_weighting(0.05, 4)
        .init_precision(1.0);
    let mut opt = vogn(config)?;

    let mut kl = vec![opt.kl_weighting()];
    let mut std_scale = vec![opt.groups()[0].std_scale()];
    for _ in 0..6 {
        opt.step(logistic)?;
        kl.push(opt.kl_weighting());
        std_scale.push(opt.groups()[0].std_scale());
    }
    for i in 1..=4 {
        assert!(kl[i] > kl[i - 1]);
        assert!(std_scale[i] > std_scale[i - 1]);
    }
    assert_eq!(kl[4], kl[5]);
    assert_eq!(kl[5], kl[6]);
    assert!((kl[6] - 1.0).abs() < 1e-12);
    assert!((std_scale[6] - (1.0f64 / 10.0).sqrt()).abs() < 1e-12);
    Ok(())
}

#[test]
fn test_gradient_mixture_weights_sum_to_one() -> Result<()> {
    let config = ViConfig::new(20.0)
        .num_mc_samples(3)
        .num_gmm_components(3)
        .init_precision(2.0)
        .mixture_weight_update(MixtureWeightUpdate::Gradient);
    let mut opt = vogn(config)?;
    for _ in 0..5 {
        opt.step(logistic)?;
    }
    let group = &opt.groups()[0];
    for p in 0..group.params().len() {
        let comps = group.pais().components(p);
        let total = comps
            .iter()
            .fold(ArrayD::<f64>::zeros(comps[0].raw_dim()), |acc, c| acc + c);
        assert!(total.iter().all(|&v| (v - 1.0).abs() < 1e-9));
        assert!(comps.iter().all(|c| c.iter().all(|&v| v > 0.0)));
    }
    Ok(())
}

#[test]
fn test_sparse_gradient_rejected_by_l2() -> Result<()> {
    let config = ViConfig::new(10.0).num_mc_samples(1);
    let params = vec![Parameter::new("embedding", ArrayD::<f64>::zeros(IxDyn(&[4, 2])))];
    let mut opt = ViOptimizer::new(vec![ParamGroup::new("emb", params)], config)?;
    let err = opt
        .step(|model| {
            model.param_mut(0, 0).grad = Some(Gradient::sparse(vec![1, 5], vec![1.0, -1.0], &[4, 2])?);
            Ok((0.0, array![0.0].into_dyn()))
        })
        .unwrap_err();
    assert!(matches!(
        err,
        VissoError::SparseGradient {
            option: "l2 regularization"
        }
    ));
    Ok(())
}

#[test]
fn test_sparse_gradient_allowed_without_regularization() -> Result<()> {
    let config = ViConfig::new(10.0)
        .num_mc_samples(2)
        .grad_ema_decay(0.5)
        .learning_rate(1.0);
    let params = vec![Parameter::new("embedding", ArrayD::<f64>::zeros(IxDyn(&[3])))];
    let group = ParamGroup::new("emb", params).options(GroupOptions::default().regularize(false));
    let mut opt = ViOptimizer::new(vec![group], config)?;
    opt.step(|model| {
        model.param_mut(0, 0).grad = Some(Gradient::sparse(vec![2], vec![4.0], &[3])?);
        Ok((0.0, array![0.0].into_dyn()))
    })?;
    // raw-flavor EMA halves the gradient
    assert_eq!(opt.groups()[0].means().get(0, 0).data, array![0.0, 0.0, -2.0].into_dyn());
    Ok(())
}

#[test]
fn test_gradient_shape_mismatch_is_a_shape_error() -> Result<()> {
    let config = ViConfig::new(10.0).num_mc_samples(1).init_precision(1.0);
    let params = vec![Parameter::new("w", ArrayD::<f64>::zeros(IxDyn(&[3])))];
    let curvature = DiagCurvature::new(&params, DiagCurvatureConfig::vogn())?;
    let group = ParamGroup::new("w", params)
        .curvature(curvature)
        .options(GroupOptions::default().regularize(false));
    let mut opt = ViOptimizer::new(vec![group], config)?;

    let err = opt
        .step(|model| {
            model.param_mut(0, 0).grad = Some(Gradient::sparse(vec![7], vec![1.0], &[8])?);
            Ok((0.0, array![0.0].into_dyn()))
        })
        .unwrap_err();
    assert!(matches!(
        err,
        VissoError::Shape(ShapeError::Tensor { ref expected, ref got })
            if expected == &[3] && got == &[8]
    ));
    assert_eq!(opt.step_count(), 0);
    Ok(())
}

#[test]
fn test_weight_decay_and_momentum_on_preconditioned_gradients() -> Result<()> {
    let config = ViConfig::new(10.0)
        .num_mc_samples(1)
        .momentum(0.5)
        .momentum_type(GradFlavor::Preconditioned)
        .weight_decay(0.1)
        .learning_rate(1.0)
        .prior_variance(0.0);
    let params = vec![Parameter::new("w", array![1.0].into_dyn())];
    let mut opt = ViOptimizer::new(vec![ParamGroup::new("g", params)], config)?;
    let grad_one = |model: &mut ModelView<'_, f64>| -> anyhow::Result<(f64, ArrayD<f64>)> {
        model.set_grad(0, 0, array![1.0].into_dyn())?;
        Ok((0.0, array![0.0].into_dyn()))
    };
    opt.step(grad_one)?;
    // g = 1 + 0.1·1 = 1.1, buf = 1.1
    assert!((opt.params(0)[0].data[[0]] - (1.0 - 1.1)).abs() < 1e-12);
    opt.step(grad_one)?;
    // g = 1 + 0.1·(−0.1) = 0.99, buf = 0.5·1.1 + 0.99 = 1.54
    assert!((opt.params(0)[0].data[[0]] - (-0.1 - 1.54)).abs() < 1e-12);
    Ok(())
}

#[test]
fn test_configuration_errors() -> Result<()> {
    let build = |config: ViConfig| ViOptimizer::new(vec![ParamGroup::new("g", logistic_params())], config);
    let err = build(ViConfig::new(0.0)).unwrap_err();
    assert!(matches!(err, VissoError::Configuration { name: "dataset size", .. }));
    let err = build(ViConfig::new(1.0).num_mc_samples(0)).unwrap_err();
    assert_eq!(err.to_string(), "Invalid number of MC samples: 0");
    assert!(build(ViConfig::new(1.0).prior_variance(-1.0)).is_err());
    assert!(build(ViConfig::new(1.0).kl_weighting(-1.0)).is_err());
    assert!(build(ViConfig::new(1.0).init_precision(-0.5)).is_err());
    Ok(())
}

#[test]
fn test_recovery_after_collaborator_error() -> Result<()> {
    let config = ViConfig::new(10.0).num_mc_samples(2).acc_steps(2).init_precision(1.0);
    let mut opt = vogn(config)?;
    opt.step(logistic)?;
    assert_eq!(opt.state().acc_step, 1);

    let mut calls = 0;
    let err = opt.step(|model| {
        calls += 1;
        if calls == 2 {
            anyhow::bail!("device lost");
        }
        logistic(model)
    });
    assert!(matches!(err, Err(VissoError::Collaborator(_))));

    opt.reset_accumulation();
    assert_eq!(opt.state().acc_step, 0);
    assert!(!opt.step(logistic)?.updated);
    assert!(opt.step(logistic)?.updated);
    Ok(())
}

#[test]
fn test_prediction_keeps_samples() -> Result<()> {
    let config = ViConfig::new(10.0).val_num_mc_samples(3).init_precision(1.0);
    let mut opt = vogn(config)?;
    let pred = opt.prediction(
        |model| {
            let w = model.params(0)[0].data.clone();
            Ok(w.insert_axis(Axis(0)))
        },
        None,
        true,
    )?;
    let samples = pred.samples.expect("samples were requested");
    assert_eq!(samples.len(), 3);
    assert_eq!(pred.probs.shape(), &[1, 2]);
    assert_eq!(opt.params(0)[0].data, opt.groups()[0].means().get(0, 0).data);
    Ok(())
}

/// Single worker whose reductions are the identity; rejects every other
/// update
#[derive(Debug, Default)]
struct Alternating {
    calls: usize,
    accept: bool,
}

impl Communicator<f64> for Alternating {
    fn reduce_scatter(&mut self, tensors: &mut [&mut ArrayD<f64>]) -> anyhow::Result<()> {
        assert!(!tensors.is_empty());
        self.calls += 1;
        self.accept = self.calls % 2 == 1;
        Ok(())
    }

    fn all_gather(&mut self, _tensors: &mut [&mut ArrayD<f64>]) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_updated(&self) -> bool {
        self.accept
    }
}

#[test]
fn test_distributed_accept_and_reject() -> Result<()> {
    let params = logistic_params();
    let curvature = DiagCurvature::new(&params, DiagCurvatureConfig::vogn())?;
    let config = ViConfig::new(10.0).num_mc_samples(2).init_precision(1.0).total_steps(50);
    let mut opt = DistributedViOptimizer::new(
        vec![ParamGroup::new("g", params).curvature(curvature)],
        config,
        Alternating::default(),
        2,
    )?;
    assert_eq!(opt.optimizer().seed_base(), 101);

    assert!(opt.step(logistic)?.updated);
    assert_eq!(opt.optimizer().step_count(), 1);
    let means = opt.optimizer().groups()[0].means().map(|_, m| m.data.clone());

    let out = opt.step(logistic)?;
    assert!(!out.updated);
    assert_eq!(opt.optimizer().step_count(), 1);
    // the reduced gradients land on the means, their values stay put
    let after = opt.optimizer().groups()[0].means().map(|_, m| m.data.clone());
    assert_eq!(after, means);

    assert!(opt.step(logistic)?.updated);
    assert_eq!(opt.optimizer().step_count(), 2);
    Ok(())
}
