//! Gaussian-mixture densities and responsibilities
//!
//! All functions are elementwise over same-shaped tensors; the mixture axis is
//! a slice of tensors, one per component. Densities are available in both the
//! linear and the log domain, but [`responsibilities`] always works in the log
//! domain so a mixture whose linear likelihood underflows still yields weights
//! that sum to one.
//!
//! ```text
//! N(x; μ, σ)    = exp(−(x − μ)² / 2σ²) / (σ √(2π))
//! GMM(x)        = Σ_k π_k N(x; μ_k, σ_k)
//! δ_k(x)        = π_k N(x; μ_k, σ_k) / GMM(x)
//! ```

use crate::error::{Result, ShapeError};
use crate::types::Real;
use scirs2_core::ndarray_ext::{ArrayD, Zip};

/// Lower bound applied to every standard deviation
pub const STD_FLOOR: f64 = 1e-12;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

fn check_same_shape<T>(reference: &ArrayD<T>, others: &[&ArrayD<T>]) -> Result<()> {
    for other in others {
        if other.shape() != reference.shape() {
            return Err(ShapeError::Tensor {
                expected: reference.shape().to_vec(),
                got: other.shape().to_vec(),
            }
            .into());
        }
    }
    Ok(())
}

fn check_components<T>(means: &[ArrayD<T>], stds: &[ArrayD<T>], pais: &[ArrayD<T>]) -> Result<()> {
    if means.is_empty() {
        return Err(ShapeError::Length {
            expected: 1,
            got: 0,
        }
        .into());
    }
    for len in [stds.len(), pais.len()] {
        if len != means.len() {
            return Err(ShapeError::Length {
                expected: means.len(),
                got: len,
            }
            .into());
        }
    }
    Ok(())
}

/// Gaussian density
pub fn gaussian<T: Real>(x: &ArrayD<T>, mean: &ArrayD<T>, std: &ArrayD<T>) -> Result<ArrayD<T>> {
    Ok(log_gaussian(x, mean, std)?.mapv(|v| v.exp()))
}

/// Gaussian log-density, with `std` floored at [`STD_FLOOR`]
pub fn log_gaussian<T: Real>(
    x: &ArrayD<T>,
    mean: &ArrayD<T>,
    std: &ArrayD<T>,
) -> Result<ArrayD<T>> {
    check_same_shape(x, &[mean, std])?;
    let floor = T::lit(STD_FLOOR);
    let half = T::lit(0.5);
    let ln_sqrt_2pi = T::lit(LN_SQRT_2PI);
    Ok(Zip::from(x).and(mean).and(std).map_collect(|&x, &m, &s| {
        let s = s.max(floor);
        let z = (x - m) / s;
        -half * z * z - s.ln() - ln_sqrt_2pi
    }))
}

/// Elementwise log-sum-exp across components
///
/// An element whose terms are all `−∞` stays `−∞`.
pub fn logsumexp<T: Real>(terms: &[ArrayD<T>]) -> Result<ArrayD<T>> {
    let first = terms.first().ok_or(ShapeError::Length {
        expected: 1,
        got: 0,
    })?;
    let refs: Vec<&ArrayD<T>> = terms.iter().collect();
    check_same_shape(first, &refs)?;

    let mut max = first.clone();
    for term in &terms[1..] {
        max.zip_mut_with(term, |m, &v| *m = m.max(v));
    }
    let mut sum: ArrayD<T> = ArrayD::zeros(first.raw_dim());
    for term in terms {
        Zip::from(&mut sum)
            .and(term)
            .and(&max)
            .for_each(|acc, &v, &m| {
                if m.is_finite() {
                    *acc = *acc + (v - m).exp();
                }
            });
    }
    Ok(Zip::from(&sum).and(&max).map_collect(|&s, &m| {
        if m.is_finite() {
            m + s.ln()
        } else {
            m
        }
    }))
}

/// Subtract the log-sum-exp so the components exponentiate to one
pub fn log_normalize<T: Real>(terms: &[ArrayD<T>]) -> Result<Vec<ArrayD<T>>> {
    let lse = logsumexp(terms)?;
    Ok(terms.iter().map(|t| t - &lse).collect())
}

fn weighted_log_terms<T: Real>(
    x: &ArrayD<T>,
    means: &[ArrayD<T>],
    stds: &[ArrayD<T>],
    pais: &[ArrayD<T>],
) -> Result<Vec<ArrayD<T>>> {
    check_components(means, stds, pais)?;
    means
        .iter()
        .zip(stds)
        .zip(pais)
        .map(|((mean, std), pai)| {
            check_same_shape(x, &[pai])?;
            let mut term = log_gaussian(x, mean, std)?;
            term.zip_mut_with(pai, |t, &p| *t = *t + p.ln());
            Ok(term)
        })
        .collect()
}

/// Mixture log-density `log Σ_k π_k N(x; μ_k, σ_k)`
pub fn log_gmm<T: Real>(
    x: &ArrayD<T>,
    means: &[ArrayD<T>],
    stds: &[ArrayD<T>],
    pais: &[ArrayD<T>],
) -> Result<ArrayD<T>> {
    logsumexp(&weighted_log_terms(x, means, stds, pais)?)
}

/// Mixture density `Σ_k π_k N(x; μ_k, σ_k)`
pub fn gmm<T: Real>(
    x: &ArrayD<T>,
    means: &[ArrayD<T>],
    stds: &[ArrayD<T>],
    pais: &[ArrayD<T>],
) -> Result<ArrayD<T>> {
    check_components(means, stds, pais)?;
    let mut total = ArrayD::zeros(x.raw_dim());
    for ((mean, std), pai) in means.iter().zip(stds).zip(pais) {
        check_same_shape(x, &[pai])?;
        let density = gaussian(x, mean, std)?;
        Zip::from(&mut total)
            .and(&density)
            .and(pai)
            .for_each(|acc, &d, &p| *acc = *acc + p * d);
    }
    Ok(total)
}

/// Per-component posterior responsibilities
#[derive(Debug, Clone)]
pub struct Responsibilities<T> {
    /// `δ_k`, one tensor per component, summing to one elementwise
    pub deltas: Vec<ArrayD<T>>,
    /// Elements whose likelihood was zero under every component and fell back
    /// to the prior weights
    pub fallback_count: usize,
}

/// Responsibilities `δ_k = π_k N_k / Σ_j π_j N_j`, computed in the log domain
///
/// Elements with `−∞` (or NaN) log-likelihood under every component take the
/// prior weights `π_k` instead.
pub fn responsibilities<T: Real>(
    x: &ArrayD<T>,
    means: &[ArrayD<T>],
    stds: &[ArrayD<T>],
    pais: &[ArrayD<T>],
) -> Result<Responsibilities<T>> {
    let terms = weighted_log_terms(x, means, stds, pais)?;
    let lse = logsumexp(&terms)?;
    let degenerate = lse.mapv(|v| !v.is_finite());
    let fallback_count = degenerate.iter().filter(|&&d| d).count();

    let deltas = terms
        .iter()
        .zip(pais)
        .map(|(term, pai)| {
            let mut delta = ArrayD::zeros(x.raw_dim());
            Zip::from(&mut delta)
                .and(term)
                .and(&lse)
                .and(pai)
                .and(&degenerate)
                .for_each(|d, &t, &l, &p, &bad| {
                    *d = if bad { p } else { (t - l).exp() };
                });
            delta
        })
        .collect();

    Ok(Responsibilities {
        deltas,
        fallback_count,
    })
}
