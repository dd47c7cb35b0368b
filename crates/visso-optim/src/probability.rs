//! Model outputs to class probabilities

use scirs2_core::ndarray_ext::{ArrayD, Axis};
use visso_core::{Real, Result, VissoError};

/// Map logits to probabilities
///
/// Rank-2 outputs `[batch, classes]` get a softmax over the class axis,
/// rank-1 outputs `[batch]` a sigmoid. Other ranks are rejected with
/// [`VissoError::UnsupportedRank`].
pub fn probabilities<T: Real>(output: &ArrayD<T>) -> Result<ArrayD<T>> {
    match output.ndim() {
        2 => Ok(softmax_rows(output)),
        1 => Ok(output.mapv(sigmoid)),
        rank => Err(VissoError::UnsupportedRank { rank }),
    }
}

fn sigmoid<T: Real>(x: T) -> T {
    // split on sign so exp never overflows
    if x >= T::zero() {
        T::one() / (T::one() + (-x).exp())
    } else {
        let e = x.exp();
        e / (T::one() + e)
    }
}

fn softmax_rows<T: Real>(logits: &ArrayD<T>) -> ArrayD<T> {
    let mut probs = logits.clone();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.iter().fold(T::neg_infinity(), |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.iter().fold(T::zero(), |acc, &v| acc + v);
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

#[cfg(test)]
mod tests {
    use super::*;
    use scirs2_core::ndarray_ext::{array, IxDyn};

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let logits: ArrayD<f64> = array![[1.0, 2.0, 3.0], [1000.0, 1000.0, -1000.0]].into_dyn();
        let p = probabilities(&logits).unwrap();
        for row in p.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
        assert!((p[[1, 0]] - 0.5).abs() < 1e-12);
        assert!(p[[0, 2]] > p[[0, 1]]);
    }

    #[test]
    fn test_sigmoid_is_stable() {
        let logits = array![0.0, 800.0, -800.0].into_dyn();
        let p = probabilities(&logits).unwrap();
        assert_eq!(p[[0]], 0.5);
        assert_eq!(p[[1]], 1.0);
        assert_eq!(p[[2]], 0.0);
    }

    #[test]
    fn test_other_ranks_rejected() {
        let output = ArrayD::<f64>::zeros(IxDyn(&[2, 2, 2]));
        let err = probabilities(&output).unwrap_err();
        assert!(matches!(err, VissoError::UnsupportedRank { rank: 3 }));
        assert_eq!(
            err.to_string(),
            "Invalid ndim 3: expected logits of rank 1 (sigmoid) or 2 (softmax)"
        );
        assert!(probabilities(&ArrayD::<f64>::zeros(IxDyn(&[]))).is_err());
    }
}
