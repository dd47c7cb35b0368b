//! Bayesian logistic regression with VOGN
//!
//! Fits a two-feature logistic model on synthetic data with a diagonal
//! Gauss-Newton curvature, then compares mean and posterior-predictive
//! accuracy. Set `RUST_LOG=visso_optim=debug` to see per-step records.

use anyhow::Result;
use scirs2_core::ndarray_ext::{s, Array1, Array2, ArrayD, Ix1, IxDyn};
use scirs2_core::random::{rngs::StdRng, Rng, SeedableRng};
use visso_core::Parameter;
use visso_optim::tracing_support::{init_tracing, TracingConfig};
use visso_optim::{DiagCurvature, DiagCurvatureConfig, ModelView, ParamGroup, ViConfig, ViOptimizer};

const NUM_EXAMPLES: usize = 256;
const BATCH: usize = 32;

fn synthetic(rng: &mut StdRng) -> (Array2<f64>, Array1<f64>) {
    let true_w = [2.0, -1.0];
    let mut x = Array2::zeros((NUM_EXAMPLES, 2));
    let mut y = Array1::zeros(NUM_EXAMPLES);
    for i in 0..NUM_EXAMPLES {
        let a: f64 = rng.random_range(-2.0..2.0);
        let b: f64 = rng.random_range(-2.0..2.0);
        x[[i, 0]] = a;
        x[[i, 1]] = b;
        let p = 1.0 / (1.0 + (-(true_w[0] * a + true_w[1] * b)).exp());
        y[i] = if rng.random::<f64>() < p { 1.0 } else { 0.0 };
    }
    (x, y)
}

/// Mean log loss on a batch; writes gradients and per-example squared
/// gradients (the Gauss-Newton diagonal) into the model
fn batch_loss(
    model: &mut ModelView<'_, f64>,
    x: &Array2<f64>,
    y: &Array1<f64>,
) -> anyhow::Result<(f64, ArrayD<f64>)> {
    let w = model.params(0)[0].data.clone().into_dimensionality::<Ix1>()?;
    let logits = x.dot(&w);
    let n = y.len() as f64;

    let mut loss = 0.0;
    let mut grad = Array1::<f64>::zeros(2);
    let mut ggn = Array1::<f64>::zeros(2);
    for (i, (&z, &t)) in logits.iter().zip(y.iter()).enumerate() {
        let p = 1.0 / (1.0 + (-z).exp());
        loss -= (t * p.max(1e-12).ln() + (1.0 - t) * (1.0 - p).max(1e-12).ln()) / n;
        let row = x.row(i);
        grad.scaled_add((p - t) / n, &row);
        ggn.scaled_add(p * (1.0 - p) / n, &row.mapv(|v| v * v));
    }
    model.set_grad(0, 0, grad.into_dyn())?;
    model.set_curvature_data(0, vec![Some(ggn.into_dyn())])?;
    Ok((loss, logits.into_dyn()))
}

fn logits(model: &ModelView<'_, f64>, x: &Array2<f64>) -> anyhow::Result<ArrayD<f64>> {
    let w = model.params(0)[0].data.clone().into_dimensionality::<Ix1>()?;
    Ok(x.dot(&w).into_dyn())
}

fn accuracy(probs: &ArrayD<f64>, y: &Array1<f64>) -> f64 {
    let hits = probs
        .iter()
        .zip(y.iter())
        .filter(|&(&p, &t)| (p >= 0.5) == (t == 1.0))
        .count();
    hits as f64 / y.len() as f64
}

fn main() -> Result<()> {
    init_tracing(TracingConfig::default())?;

    let mut rng = StdRng::seed_from_u64(7);
    let (x, y) = synthetic(&mut rng);

    let params = vec![Parameter::new("w", ArrayD::<f64>::zeros(IxDyn(&[2])))];
    let curvature = DiagCurvature::new(&params, DiagCurvatureConfig::vogn())?;
    let config = ViConfig::vogn(NUM_EXAMPLES as f64)
        .learning_rate(0.1)
        .num_mc_samples(8)
        .val_num_mc_samples(32)
        .warmup_kl_weighting(0.1, 50)
        .init_precision(1.0);
    let mut opt = ViOptimizer::new(
        vec![ParamGroup::new("logistic", params).curvature(curvature)],
        config,
    )?;

    println!("=== VOGN logistic regression ===\n");
    for epoch in 0..20 {
        let mut epoch_loss = 0.0;
        for start in (0..NUM_EXAMPLES).step_by(BATCH) {
            let xb = x.slice(s![start..start + BATCH, ..]).to_owned();
            let yb = y.slice(s![start..start + BATCH]).to_owned();
            let out = opt.step(|model| batch_loss(model, &xb, &yb))?;
            epoch_loss += out.loss / (NUM_EXAMPLES / BATCH) as f64;
        }
        if epoch % 5 == 4 {
            println!(
                "epoch {:>2}: loss {:.4}, kl weighting {:.3}",
                epoch + 1,
                epoch_loss,
                opt.kl_weighting()
            );
        }
    }

    let mean = opt.prediction(|model| logits(model, &x), Some(0), false)?;
    let bayes = opt.prediction(|model| logits(model, &x), None, false)?;

    println!("\nposterior mean w: {}", opt.groups()[0].means().get(0, 0).data);
    if let Some(std) = opt.groups()[0].curvature().and_then(|c| c.std()) {
        let scale = opt.groups()[0].std_scale();
        println!("posterior std  w: {}", std.get(0, 0).mapv(|s| s * scale));
    }
    println!("accuracy (mean):       {:.3}", accuracy(&mean.probs, &y));
    println!("accuracy (predictive): {:.3}", accuracy(&bayes.probs, &y));
    Ok(())
}
