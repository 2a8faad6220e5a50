//! # Risk Models
//!
//! $$
//! \hat\Sigma = f\,\frac{1}{T-1}\sum_{t}(r_t-\bar r)(r_t-\bar r)^\top
//! $$
//!
//! Annualized covariance estimators over a [`PriceHistory`], each followed by a
//! positive-semidefinite repair.

pub mod psd;
pub mod shrinkage;

use nalgebra::DMatrix;
use ndarray::Array2;
use tracing::info;
use tracing::warn;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::error::Stage;
use crate::expected_returns::ewm_weights;
use crate::expected_returns::TRADING_DAYS;
use crate::prices::ensure_observations;
use crate::prices::PriceHistory;
use crate::prices::ReturnKind;

pub use psd::fix_nonpositive_semidefinite;
pub use psd::min_eigenvalue;
pub use psd::FixMethod;
pub use shrinkage::ShrinkageTarget;

/// Covariance estimation method.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RiskMethod {
  /// Unbiased sample covariance of daily returns.
  SampleCovariance,
  /// Exponentially weighted covariance of daily returns.
  ExponentialWeighted { span: usize },
  /// Ledoit-Wolf shrinkage towards a structured target.
  LedoitWolf { target: ShrinkageTarget },
}

impl RiskMethod {
  /// Parse a method name. EMA spans default to 180.
  pub fn from_str(s: &str, span: Option<usize>) -> Option<Self> {
    match s.to_lowercase().as_str() {
      "sample" | "sample_cov" => Some(Self::SampleCovariance),
      "exp" | "exp_cov" | "ema" => Some(Self::ExponentialWeighted {
        span: span.unwrap_or(180),
      }),
      "ledoit_wolf" | "ledoit_wolf_constant_variance" => Some(Self::LedoitWolf {
        target: ShrinkageTarget::ConstantVariance,
      }),
      "ledoit_wolf_constant_correlation" => Some(Self::LedoitWolf {
        target: ShrinkageTarget::ConstantCorrelation,
      }),
      "ledoit_wolf_single_factor" => Some(Self::LedoitWolf {
        target: ShrinkageTarget::SingleFactor,
      }),
      _ => None,
    }
  }
}

/// Annualized covariance matrix indexed by ticker.
#[derive(Clone, Debug)]
pub struct CovarianceMatrix {
  tickers: Vec<String>,
  matrix: DMatrix<f64>,
  shrinkage: Option<f64>,
}

impl CovarianceMatrix {
  /// Wrap an externally supplied matrix. It must be square, finite and
  /// symmetric; negative eigenvalues are repaired spectrally.
  pub fn from_matrix(tickers: Vec<String>, matrix: DMatrix<f64>) -> Result<Self> {
    let n = tickers.len();
    if matrix.nrows() != n || matrix.ncols() != n {
      return Err(PortfolioError::invalid(
        Stage::RiskModel,
        "matrix",
        format!(
          "expected {n}x{n}, got {}x{}",
          matrix.nrows(),
          matrix.ncols()
        ),
      ));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
      return Err(PortfolioError::invalid(
        Stage::RiskModel,
        "matrix",
        "entries must be finite",
      ));
    }
    let scale = 1.0 + matrix.amax();
    let asymmetry = (&matrix - matrix.transpose()).amax();
    if asymmetry > 1e-8 * scale {
      return Err(PortfolioError::invalid(
        Stage::RiskModel,
        "matrix",
        format!("not symmetric (max asymmetry {asymmetry:e})"),
      ));
    }
    Ok(Self {
      tickers,
      matrix: fix_nonpositive_semidefinite(matrix, FixMethod::default())?,
      shrinkage: None,
    })
  }

  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  pub fn matrix(&self) -> &DMatrix<f64> {
    &self.matrix
  }

  pub fn len(&self) -> usize {
    self.tickers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tickers.is_empty()
  }

  /// Shrinkage intensity chosen by a Ledoit-Wolf estimator.
  pub fn shrinkage(&self) -> Option<f64> {
    self.shrinkage
  }

  /// Entry for a pair of tickers.
  pub fn get(&self, a: &str, b: &str) -> Option<f64> {
    let i = self.tickers.iter().position(|t| t == a)?;
    let j = self.tickers.iter().position(|t| t == b)?;
    Some(self.matrix[(i, j)])
  }

  /// Correlation matrix implied by the covariances.
  pub fn to_correlation(&self) -> DMatrix<f64> {
    let n = self.matrix.nrows();
    let sd: Vec<f64> = (0..n)
      .map(|i| self.matrix[(i, i)].max(0.0).sqrt())
      .collect();
    DMatrix::from_fn(n, n, |i, j| {
      let denom = sd[i] * sd[j];
      if i == j {
        1.0
      } else if denom > 1e-15 {
        (self.matrix[(i, j)] / denom).clamp(-1.0, 1.0)
      } else {
        0.0
      }
    })
  }
}

/// Covariance estimator configuration.
#[derive(Clone, Debug)]
pub struct RiskEstimator {
  /// Periods per year used for annualization.
  pub frequency: usize,
  /// Daily return convention.
  pub return_kind: ReturnKind,
  /// Repair applied to non-PSD estimates.
  pub fix_method: FixMethod,
}

impl Default for RiskEstimator {
  fn default() -> Self {
    Self {
      frequency: TRADING_DAYS,
      return_kind: ReturnKind::Simple,
      fix_method: FixMethod::Spectral,
    }
  }
}

impl RiskEstimator {
  /// Estimate the annualized covariance matrix and repair it to PSD.
  pub fn estimate(&self, prices: &PriceHistory, method: RiskMethod) -> Result<CovarianceMatrix> {
    if self.frequency == 0 {
      return Err(PortfolioError::invalid(
        Stage::RiskModel,
        "frequency",
        "must be positive",
      ));
    }

    let returns = prices.returns(self.return_kind);
    ensure_observations(&returns, prices.tickers(), 2, Stage::RiskModel)?;
    let x = to_dmatrix(&returns);
    let f = self.frequency as f64;

    let (raw, shrinkage) = match method {
      RiskMethod::SampleCovariance => (sample_cov(&x), None),
      RiskMethod::ExponentialWeighted { span } => (exp_cov(&x, span)?, None),
      RiskMethod::LedoitWolf { target } => {
        let (cov, delta) = shrinkage::ledoit_wolf(&x, target);
        (cov, Some(delta))
      }
    };

    let matrix = fix_nonpositive_semidefinite(raw * f, self.fix_method)?;
    info!(?method, assets = matrix.nrows(), ?shrinkage, "estimated risk model");

    Ok(CovarianceMatrix {
      tickers: prices.tickers().to_vec(),
      matrix,
      shrinkage,
    })
  }
}

pub(crate) fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
  DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

/// Subtract the column means.
pub(crate) fn demean(x: &DMatrix<f64>) -> DMatrix<f64> {
  let t = x.nrows() as f64;
  let mut out = x.clone();
  for mut col in out.column_iter_mut() {
    let m = col.sum() / t;
    col.add_scalar_mut(-m);
  }
  out
}

pub(crate) fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
  (m + m.transpose()) * 0.5
}

/// Unbiased daily sample covariance of a `T x N` return matrix.
pub fn sample_cov(x: &DMatrix<f64>) -> DMatrix<f64> {
  let xm = demean(x);
  let t = x.nrows() as f64;
  (xm.transpose() * &xm) / (t - 1.0)
}

/// Daily exponentially weighted covariance of a `T x N` return matrix.
pub fn exp_cov(x: &DMatrix<f64>, span: usize) -> Result<DMatrix<f64>> {
  if span == 0 {
    return Err(PortfolioError::invalid(
      Stage::RiskModel,
      "span",
      "must be a positive integer, got 0",
    ));
  }
  if span < 10 {
    warn!(span, "it is recommended to use a higher span, e.g. 30 days");
  }

  let xm = demean(x);
  let w = ewm_weights(x.nrows(), span);
  let mut weighted = xm.clone();
  for (mut row, wt) in weighted.row_iter_mut().zip(&w) {
    row *= *wt;
  }
  Ok(symmetrize(&(xm.transpose() * weighted)))
}

#[cfg(test)]
pub(crate) mod tests {
  use approx::assert_abs_diff_eq;
  use chrono::Duration;
  use chrono::NaiveDate;

  use super::*;

  /// Deterministic, mildly correlated price paths.
  pub(crate) fn synthetic_history(n_assets: usize, n_days: usize) -> PriceHistory {
    let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
    let dates = (0..n_days).map(|i| start + Duration::days(i as i64)).collect();
    let mut prices = Array2::<f64>::zeros((n_days, n_assets));
    for j in 0..n_assets {
      let mut p = 50.0 + 10.0 * j as f64;
      for i in 0..n_days {
        if i > 0 {
          let t = i as f64;
          let common = 0.006 * (0.37 * t).sin();
          let own = 0.01 * ((1.3 + 0.71 * j as f64) * t + j as f64).cos();
          p *= 1.0 + 0.0004 * (j + 1) as f64 + common + own;
        }
        prices[[i, j]] = p;
      }
    }
    PriceHistory::new(
      (0..n_assets).map(|j| format!("T{j}")).collect(),
      dates,
      prices,
    )
    .unwrap()
  }

  fn assert_valid(cov: &CovarianceMatrix) {
    let m = cov.matrix();
    assert!((m - m.transpose()).amax() < 1e-9);
    assert!(min_eigenvalue(m) >= -1e-8);
    assert!(m.diagonal().iter().all(|d| *d >= 0.0));
  }

  #[test]
  fn sample_covariance_matches_definition() {
    let x = DMatrix::from_row_slice(4, 2, &[0.01, 0.02, -0.01, 0.0, 0.03, 0.01, 0.01, -0.03]);
    let s = sample_cov(&x);
    // mean of column 0 is 0.01, column 1 is 0.0
    let var0 = (0.0f64.powi(2) + 0.02f64.powi(2) + 0.02f64.powi(2) + 0.0) / 3.0;
    let cov01 = (0.0 * 0.02 + -0.02 * 0.0 + 0.02 * 0.01 + 0.0 * -0.03) / 3.0;
    assert_abs_diff_eq!(s[(0, 0)], var0, epsilon = 1e-15);
    assert_abs_diff_eq!(s[(0, 1)], cov01, epsilon = 1e-15);
    assert_abs_diff_eq!(s[(1, 0)], cov01, epsilon = 1e-15);
  }

  #[test]
  fn every_method_returns_a_valid_annualized_matrix() {
    let h = synthetic_history(4, 120);
    let est = RiskEstimator::default();
    for method in [
      RiskMethod::SampleCovariance,
      RiskMethod::ExponentialWeighted { span: 30 },
      RiskMethod::LedoitWolf {
        target: ShrinkageTarget::ConstantVariance,
      },
      RiskMethod::LedoitWolf {
        target: ShrinkageTarget::ConstantCorrelation,
      },
      RiskMethod::LedoitWolf {
        target: ShrinkageTarget::SingleFactor,
      },
    ] {
      let cov = est.estimate(&h, method).unwrap();
      assert_eq!(cov.len(), 4);
      assert_valid(&cov);
    }
  }

  #[test]
  fn sample_estimate_is_annualized() {
    let h = synthetic_history(2, 60);
    let cov = RiskEstimator::default()
      .estimate(&h, RiskMethod::SampleCovariance)
      .unwrap();
    let daily = sample_cov(&to_dmatrix(&h.returns(ReturnKind::Simple)));
    assert_abs_diff_eq!(cov.matrix()[(0, 1)], daily[(0, 1)] * 252.0, epsilon = 1e-12);
    assert!(cov.shrinkage().is_none());
  }

  #[test]
  fn long_span_exp_cov_approaches_biased_sample_cov() {
    let h = synthetic_history(3, 80);
    let x = to_dmatrix(&h.returns(ReturnKind::Simple));
    let ew = exp_cov(&x, 1_000_000_000).unwrap();
    let t = x.nrows() as f64;
    let biased = sample_cov(&x) * ((t - 1.0) / t);
    assert!((ew - biased).amax() < 1e-8);
  }

  #[test]
  fn exp_cov_rejects_zero_span() {
    let h = synthetic_history(2, 20);
    let err = RiskEstimator::default()
      .estimate(&h, RiskMethod::ExponentialWeighted { span: 0 })
      .unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidParameter { name: "span", .. }));
  }

  #[test]
  fn correlation_has_unit_diagonal() {
    let cov = CovarianceMatrix::from_matrix(
      vec!["A".into(), "B".into()],
      DMatrix::from_row_slice(2, 2, &[0.04, 0.012, 0.012, 0.09]),
    )
    .unwrap();
    let corr = cov.to_correlation();
    assert_abs_diff_eq!(corr[(0, 0)], 1.0);
    assert_abs_diff_eq!(corr[(0, 1)], 0.2, epsilon = 1e-12);
    assert_eq!(cov.get("B", "A"), Some(0.012));
  }

  #[test]
  fn from_matrix_repairs_an_indefinite_matrix() {
    let raw = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
    assert!(min_eigenvalue(&raw) < -0.5);
    let cov = CovarianceMatrix::from_matrix(vec!["A".into(), "B".into()], raw).unwrap();
    assert_valid(&cov);
    assert_abs_diff_eq!(cov.get("A", "B").unwrap(), 1.5, epsilon = 1e-12);
  }

  #[test]
  fn from_matrix_rejects_asymmetric_input() {
    let err = CovarianceMatrix::from_matrix(
      vec!["A".into(), "B".into()],
      DMatrix::from_row_slice(2, 2, &[0.04, 0.01, 0.02, 0.09]),
    )
    .unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidParameter { name: "matrix", .. }));
  }

  #[test]
  fn method_names_parse() {
    assert_eq!(
      RiskMethod::from_str("exp_cov", None),
      Some(RiskMethod::ExponentialWeighted { span: 180 })
    );
    assert_eq!(
      RiskMethod::from_str("ledoit_wolf", None),
      Some(RiskMethod::LedoitWolf {
        target: ShrinkageTarget::ConstantVariance
      })
    );
  }
}
