//! L1-regularised binary logistic regression.
//!
//! Fitted by proximal gradient descent (iterative soft-thresholding) with a
//! backtracking step size. The `c` option is the inverse regularisation
//! strength: the objective is the class-weighted log-loss plus
//! `(1/c) * ||w||_1`, with an unpenalised intercept. Automatic class
//! weighting scales each example by `n / (2 * n_class)`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SluError, SluResult};
use crate::sparse::{CsrMatrix, SparseVec};

/// Stored parameters of one fitted classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogisticParams {
    pub intercept: f64,
    pub coefs: SparseVec,
}

impl LogisticParams {
    /// `P(y = 1 | x)` for a dense feature vector.
    pub fn predict_prob(&self, feat_vec: &[f64]) -> f64 {
        sigmoid(self.intercept + self.coefs.dot_dense(feat_vec))
    }
}

#[derive(Debug, Clone)]
pub struct LogisticOptions {
    /// Inverse regularisation strength (the trainer's `sparsification`).
    pub c: f64,
    /// Convergence tolerance on the largest parameter change.
    pub tol: f64,
    pub max_iter: usize,
    /// Weight classes by `n / (2 * n_class)`.
    pub class_weight_auto: bool,
}

impl Default for LogisticOptions {
    fn default() -> Self {
        Self {
            c: 1.0,
            tol: 1e-6,
            max_iter: 200,
            class_weight_auto: true,
        }
    }
}

/// Numerically stable logistic function.
pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Stable `ln(1 + exp(-margin))`.
fn log_loss(margin: f64) -> f64 {
    if margin > 0.0 {
        (-margin).exp().ln_1p()
    } else {
        margin.exp().ln_1p() - margin
    }
}

pub fn fit_logistic(
    x: &CsrMatrix,
    y: &[u8],
    opts: &LogisticOptions,
) -> SluResult<LogisticParams> {
    let n = x.n_rows();
    let m = x.n_cols();
    if n == 0 || n != y.len() {
        return Err(SluError::Fit(format!(
            "bad training shape: {n} rows, {} labels",
            y.len()
        )));
    }
    let n_pos = y.iter().filter(|&&l| l == 1).count();
    if n_pos == 0 || n_pos == n {
        return Err(SluError::Fit("training labels are single-class".into()));
    }
    if opts.c <= 0.0 {
        return Err(SluError::Fit(format!(
            "inverse regularisation must be positive, got {}",
            opts.c
        )));
    }

    let (w_pos, w_neg) = if opts.class_weight_auto {
        let n_neg = n - n_pos;
        (
            n as f64 / (2.0 * n_pos as f64),
            n as f64 / (2.0 * n_neg as f64),
        )
    } else {
        (1.0, 1.0)
    };
    let sample_weight =
        |label: u8| -> f64 { if label == 1 { w_pos } else { w_neg } };
    let alpha = 1.0 / opts.c;

    let smooth_loss = |weights: &[f64], bias: f64| -> f64 {
        (0..n)
            .map(|row| {
                let z = x.row_score(row, weights, bias);
                let margin = if y[row] == 1 { z } else { -z };
                sample_weight(y[row]) * log_loss(margin)
            })
            .sum()
    };

    let mut weights = vec![0.0; m];
    let mut bias = 0.0;
    let mut step = 1.0;

    for iter in 0..opts.max_iter {
        // Gradient of the smooth part.
        let mut grad_w = vec![0.0; m];
        let mut grad_b = 0.0;
        for row in 0..n {
            let z = x.row_score(row, &weights, bias);
            let residual = sample_weight(y[row]) * (sigmoid(z) - y[row] as f64);
            for (col, val) in x.row(row) {
                grad_w[col] += residual * val;
            }
            grad_b += residual;
        }

        let f0 = smooth_loss(&weights, bias);
        if !f0.is_finite() {
            return Err(SluError::Fit("objective diverged".into()));
        }

        // Backtracking proximal step.
        let (new_weights, new_bias) = loop {
            let cand_w: Vec<f64> = weights
                .iter()
                .zip(grad_w.iter())
                .map(|(w, g)| soft_threshold(w - step * g, step * alpha))
                .collect();
            let cand_b = bias - step * grad_b;

            let f1 = smooth_loss(&cand_w, cand_b);
            let mut linear = 0.0;
            let mut quad = 0.0;
            for ((cw, w), g) in cand_w.iter().zip(weights.iter()).zip(grad_w.iter()) {
                let d = cw - w;
                linear += g * d;
                quad += d * d;
            }
            let db = cand_b - bias;
            linear += grad_b * db;
            quad += db * db;

            if f1 <= f0 + linear + quad / (2.0 * step) + 1e-12 {
                break (cand_w, cand_b);
            }
            step *= 0.5;
            if step < 1e-12 {
                break (cand_w, cand_b);
            }
        };

        let mut delta: f64 = (new_bias - bias).abs();
        for (nw, w) in new_weights.iter().zip(weights.iter()) {
            delta = delta.max((nw - w).abs());
        }
        weights = new_weights;
        bias = new_bias;
        // Allow the step to recover between iterations.
        step = (step * 2.0).min(1.0);

        if delta < opts.tol {
            debug!(iter, "logistic fit converged");
            break;
        }
    }

    Ok(LogisticParams {
        intercept: bias,
        coefs: SparseVec::from_dense(&weights),
    })
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separable() -> (CsrMatrix, Vec<u8>) {
        let mut x = CsrMatrix::new(2);
        x.push_row(&[(0, 1.0)]);
        x.push_row(&[(0, 1.0)]);
        x.push_row(&[(1, 1.0)]);
        x.push_row(&[(1, 1.0)]);
        (x, vec![1, 1, 0, 0])
    }

    #[test]
    fn fits_separable_data() {
        let (x, y) = separable();
        let opts = LogisticOptions {
            c: 4.0,
            ..Default::default()
        };
        let params = fit_logistic(&x, &y, &opts).unwrap();
        let pos = params.predict_prob(&[1.0, 0.0]);
        let neg = params.predict_prob(&[0.0, 1.0]);
        assert!(pos > 0.5, "positive class scored {pos}");
        assert!(neg < 0.5, "negative class scored {neg}");
    }

    #[test]
    fn strong_regularisation_zeroes_coefficients() {
        let (x, y) = separable();
        let opts = LogisticOptions {
            c: 0.01,
            ..Default::default()
        };
        let params = fit_logistic(&x, &y, &opts).unwrap();
        assert_eq!(params.coefs.nnz(), 0);
    }

    #[test]
    fn prediction_is_sigmoid_of_linear_score() {
        let params = LogisticParams {
            intercept: 0.5,
            coefs: SparseVec::from_pairs(vec![(0, 2.0), (3, -1.0)]),
        };
        let x = [1.0, 0.0, 0.0, 2.0];
        let expected = sigmoid(0.5 + 2.0 - 2.0);
        assert!((params.predict_prob(&x) - expected).abs() < 1e-15);
        assert!((0.0..=1.0).contains(&params.predict_prob(&x)));
    }

    #[test]
    fn single_class_is_rejected() {
        let mut x = CsrMatrix::new(1);
        x.push_row(&[(0, 1.0)]);
        let err = fit_logistic(&x, &[1], &LogisticOptions::default());
        assert!(matches!(err, Err(SluError::Fit(_))));
    }
}
