//! # Ledoit-Wolf Shrinkage
//!
//! $$
//! \hat\Sigma = \delta F + (1-\delta) S,\qquad \delta\in[0,1]
//! $$
//!
//! Daily shrinkage estimators on a `T x N` return matrix. The intensity
//! $\delta$ is the analytic Ledoit-Wolf optimum for the chosen target $F$.

use nalgebra::DMatrix;
use nalgebra::DVector;

use super::demean;
use super::sample_cov;

/// Structured target the sample covariance is shrunk towards.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShrinkageTarget {
  /// Scaled identity with the average sample variance.
  #[default]
  ConstantVariance,
  /// Sample variances with a single average correlation.
  ConstantCorrelation,
  /// Sharpe single-index model on the equal-weighted market.
  SingleFactor,
}

/// Shrunk daily covariance and the intensity used.
pub fn ledoit_wolf(x: &DMatrix<f64>, target: ShrinkageTarget) -> (DMatrix<f64>, f64) {
  match target {
    ShrinkageTarget::ConstantVariance => constant_variance(x),
    ShrinkageTarget::ConstantCorrelation => constant_correlation(x),
    ShrinkageTarget::SingleFactor => single_factor(x),
  }
}

fn blend(target: &DMatrix<f64>, sample: &DMatrix<f64>, delta: f64) -> DMatrix<f64> {
  target * delta + sample * (1.0 - delta)
}

/// Shrinkage towards `mu * I`, `mu = tr(S) / N`, on the biased covariance.
pub fn constant_variance(x: &DMatrix<f64>) -> (DMatrix<f64>, f64) {
  let (t, n) = x.shape();
  let xc = demean(x);
  let emp = (xc.transpose() * &xc) / t as f64;
  if n == 1 {
    return (emp, 0.0);
  }

  let nf = n as f64;
  let tf = t as f64;
  let mu = emp.trace() / nf;

  let x2 = xc.map(|v| v * v);
  let beta_ = (x2.transpose() * &x2).sum();
  let delta_ = emp.norm_squared();

  let target = DMatrix::<f64>::identity(n, n) * mu;
  let delta = (&emp - &target).norm_squared() / nf;
  let beta = ((beta_ / tf - delta_) / (nf * tf)).min(delta);

  let shrinkage = if beta <= 0.0 || delta <= 0.0 {
    0.0
  } else {
    beta / delta
  };
  (blend(&target, &emp, shrinkage), shrinkage)
}

/// Shrinkage towards the constant-correlation matrix, on the unbiased covariance.
pub fn constant_correlation(x: &DMatrix<f64>) -> (DMatrix<f64>, f64) {
  let (t, n) = x.shape();
  let s = sample_cov(x);
  if n < 2 {
    return (s, 0.0);
  }
  let tf = t as f64;
  let nf = n as f64;

  let var = s.diagonal();
  let sd = var.map(|v| v.max(0.0).sqrt());
  let ratio = |a: f64, b: f64| if b > 0.0 { a / b } else { 0.0 };

  let mut corr_sum = 0.0;
  for i in 0..n {
    for j in 0..n {
      if i != j {
        corr_sum += ratio(s[(i, j)], sd[i] * sd[j]);
      }
    }
  }
  let r_bar = corr_sum / (nf * (nf - 1.0));

  let f = DMatrix::from_fn(n, n, |i, j| {
    if i == j {
      var[i]
    } else {
      r_bar * sd[i] * sd[j]
    }
  });

  let xm = demean(x);
  let y = xm.map(|v| v * v);
  let help = (xm.transpose() * &xm) / tf;
  let pi_mat = (y.transpose() * &y) / tf - help.component_mul(&s) * 2.0 + s.component_mul(&s);
  let pi_hat = pi_mat.sum();

  let xm3 = xm.map(|v| v * v * v);
  let term1 = (xm3.transpose() * &xm) / tf;
  let mut rho_off = 0.0;
  for i in 0..n {
    for j in 0..n {
      if i == j {
        continue;
      }
      let theta = term1[(i, j)] - help[(i, i)] * s[(i, j)] - help[(i, j)] * var[i]
        + var[i] * s[(i, j)];
      rho_off += ratio(sd[j], sd[i]) * theta;
    }
  }
  let rho_hat = pi_mat.diagonal().sum() + r_bar * rho_off;
  let gamma_hat = (&s - &f).norm_squared();

  let delta = if gamma_hat > 0.0 {
    ((pi_hat - rho_hat) / gamma_hat / tf).clamp(0.0, 1.0)
  } else {
    0.0
  };
  (blend(&f, &s, delta), delta)
}

/// Shrinkage towards the single-index covariance, on the biased covariance.
pub fn single_factor(x: &DMatrix<f64>) -> (DMatrix<f64>, f64) {
  let (t, n) = x.shape();
  let tf = t as f64;
  let xm = demean(x);
  let xmkt: DVector<f64> = DVector::from_fn(t, |r, _| xm.row(r).mean());

  let sample = (xm.transpose() * &xm) / tf;
  let covmkt: DVector<f64> = (xm.transpose() * &xmkt) / tf;
  let varmkt = xmkt.norm_squared() / tf;
  if varmkt <= 0.0 {
    return (sample, 0.0);
  }

  let mut f = (&covmkt * covmkt.transpose()) / varmkt;
  f.set_diagonal(&sample.diagonal());

  let c = (&sample - &f).norm_squared();
  if c <= 0.0 {
    return (sample, 0.0);
  }

  let y = xm.map(|v| v * v);
  let p = (y.transpose() * &y).sum() / tf - sample.norm_squared();
  let rdiag = y.map(|v| v * v).sum() / tf - sample.diagonal().norm_squared();

  let mut z = xm.clone();
  for (mut row, m) in z.row_iter_mut().zip(xmkt.iter()) {
    row *= *m;
  }
  let yz = (y.transpose() * &z) / tf;
  let zz = (z.transpose() * &z) / tf;

  let mut roff1 = 0.0;
  let mut roff3 = 0.0;
  for i in 0..n {
    for j in 0..n {
      if i == j {
        continue;
      }
      let v1 = yz[(i, j)] - covmkt[i] * sample[(i, j)];
      roff1 += v1 * covmkt[j] / varmkt;
      let v3 = zz[(i, j)] - varmkt * sample[(i, j)];
      roff3 += v3 * covmkt[i] * covmkt[j] / (varmkt * varmkt);
    }
  }
  let r = rdiag + 2.0 * roff1 - roff3;
  let delta = ((p - r) / c / tf).clamp(0.0, 1.0);
  (blend(&f, &sample, delta), delta)
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;

  /// Few observations relative to assets, so shrinkage is strictly positive.
  fn short_panel() -> DMatrix<f64> {
    DMatrix::from_fn(12, 5, |t, j| {
      let tf = t as f64;
      let jf = j as f64;
      0.01 * (0.9 * tf + jf).sin() + 0.004 * (2.3 * tf * (jf + 1.0)).cos()
    })
  }

  #[test]
  fn constant_variance_preserves_the_trace() {
    let x = short_panel();
    let (shrunk, delta) = constant_variance(&x);
    let t = x.nrows() as f64;
    let emp = sample_cov(&x) * ((t - 1.0) / t);
    assert!((0.0..=1.0).contains(&delta));
    assert!(delta > 0.0);
    assert_abs_diff_eq!(shrunk.trace(), emp.trace(), epsilon = 1e-14);
  }

  #[test]
  fn structured_targets_keep_the_sample_diagonal() {
    let x = short_panel();
    let t = x.nrows() as f64;

    let (shrunk, delta) = constant_correlation(&x);
    assert!((0.0..=1.0).contains(&delta));
    let s = sample_cov(&x);
    for i in 0..x.ncols() {
      assert_abs_diff_eq!(shrunk[(i, i)], s[(i, i)], epsilon = 1e-15);
    }

    let (shrunk, delta) = single_factor(&x);
    assert!((0.0..=1.0).contains(&delta));
    let biased = s * ((t - 1.0) / t);
    for i in 0..x.ncols() {
      assert_abs_diff_eq!(shrunk[(i, i)], biased[(i, i)], epsilon = 1e-15);
    }
  }

  #[test]
  fn single_asset_is_not_shrunk() {
    let x = DMatrix::from_column_slice(4, 1, &[0.01, -0.02, 0.005, 0.0]);
    let (shrunk, delta) = constant_variance(&x);
    assert_eq!(delta, 0.0);
    assert_eq!(shrunk.shape(), (1, 1));
    let (_, delta) = constant_correlation(&x);
    assert_eq!(delta, 0.0);
  }

  #[test]
  fn shrunk_matrices_are_symmetric() {
    let x = short_panel();
    for target in [
      ShrinkageTarget::ConstantVariance,
      ShrinkageTarget::ConstantCorrelation,
      ShrinkageTarget::SingleFactor,
    ] {
      let (m, _) = ledoit_wolf(&x, target);
      assert!((&m - m.transpose()).amax() < 1e-15);
    }
  }
}
