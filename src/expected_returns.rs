//! # Expected Returns
//!
//! $$
//! \hat\mu_i = f\,\bar r_i,\qquad
//! \hat\mu_i^{\text{CAPM}} = r_f + \beta_i\,(\hat\mu_m - r_f)
//! $$
//!
//! Annualized expected-return estimators over a [`PriceHistory`].

use linreg::linear_regression;
use nalgebra::DVector;
use ndarray::Array2;
use ndarray::Axis;
use tracing::debug;
use tracing::info;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::error::Stage;
use crate::prices::ensure_observations;
use crate::prices::log_returns_series;
use crate::prices::simple_returns_series;
use crate::prices::PriceHistory;
use crate::prices::ReturnKind;

/// Trading periods per year.
pub const TRADING_DAYS: usize = 252;

/// Expected-return estimation method.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReturnMethod {
  /// Mean of daily returns, annualized.
  MeanHistorical,
  /// Exponentially weighted mean of daily returns, annualized.
  ExponentialWeighted { span: usize },
  /// Capital asset pricing model with regression betas.
  Capm,
}

impl ReturnMethod {
  /// Parse a method name. EMA spans default to 500.
  pub fn from_str(s: &str, span: Option<usize>) -> Option<Self> {
    match s.to_lowercase().as_str() {
      "mean" | "mean_historical" | "mean-historical" => Some(Self::MeanHistorical),
      "ema" | "ema_historical" | "exponential" => Some(Self::ExponentialWeighted {
        span: span.unwrap_or(500),
      }),
      "capm" => Some(Self::Capm),
      _ => None,
    }
  }
}

/// Annualized expected return per ticker.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnVector {
  tickers: Vec<String>,
  values: DVector<f64>,
}

impl ReturnVector {
  pub fn new(tickers: Vec<String>, values: Vec<f64>) -> Result<Self> {
    if tickers.len() != values.len() {
      return Err(PortfolioError::invalid(
        Stage::ExpectedReturns,
        "values",
        format!("{} tickers but {} values", tickers.len(), values.len()),
      ));
    }
    Ok(Self {
      tickers,
      values: DVector::from_vec(values),
    })
  }

  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  pub fn values(&self) -> &DVector<f64> {
    &self.values
  }

  pub fn len(&self) -> usize {
    self.tickers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tickers.is_empty()
  }

  pub fn get(&self, ticker: &str) -> Option<f64> {
    let i = self.tickers.iter().position(|t| t == ticker)?;
    Some(self.values[i])
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
    self
      .tickers
      .iter()
      .map(String::as_str)
      .zip(self.values.iter().copied())
  }
}

/// Normalized exponential weights for `n` observations ordered oldest to newest.
///
/// Uses the `span` convention `alpha = 2 / (span + 1)`: the observation `k`
/// periods back carries weight `(1 - alpha)^k`.
pub fn ewm_weights(n: usize, span: usize) -> Vec<f64> {
  let alpha = 2.0 / (span as f64 + 1.0);
  let decay = 1.0 - alpha;
  let mut w: Vec<f64> = (0..n).map(|k| decay.powi((n - 1 - k) as i32)).collect();
  let total: f64 = w.iter().sum();
  if total > 0.0 {
    for x in &mut w {
      *x /= total;
    }
  }
  w
}

/// Expected-return estimator configuration.
#[derive(Clone, Debug)]
pub struct ReturnEstimator {
  /// Periods per year used for annualization.
  pub frequency: usize,
  /// Annualize geometrically instead of scaling the daily mean.
  pub compounding: bool,
  /// Daily return convention.
  pub return_kind: ReturnKind,
  /// Risk-free rate used by CAPM.
  pub risk_free_rate: f64,
  /// Optional benchmark prices aligned with the price history dates (CAPM).
  pub market_prices: Option<Vec<f64>>,
}

impl Default for ReturnEstimator {
  fn default() -> Self {
    Self {
      frequency: TRADING_DAYS,
      compounding: false,
      return_kind: ReturnKind::Simple,
      risk_free_rate: 0.02,
      market_prices: None,
    }
  }
}

impl ReturnEstimator {
  /// Estimate annualized expected returns with the chosen method.
  pub fn estimate(&self, prices: &PriceHistory, method: ReturnMethod) -> Result<ReturnVector> {
    if self.frequency == 0 {
      return Err(PortfolioError::invalid(
        Stage::ExpectedReturns,
        "frequency",
        "must be positive",
      ));
    }

    let returns = prices.returns(self.return_kind);
    ensure_observations(&returns, prices.tickers(), 2, Stage::ExpectedReturns)?;

    let values = match method {
      ReturnMethod::MeanHistorical => self.mean_historical(&returns),
      ReturnMethod::ExponentialWeighted { span } => self.ema_historical(&returns, span)?,
      ReturnMethod::Capm => self.capm(&returns, prices)?,
    };

    info!(?method, assets = values.len(), "estimated expected returns");
    ReturnVector::new(prices.tickers().to_vec(), values)
  }

  fn mean_historical(&self, returns: &Array2<f64>) -> Vec<f64> {
    returns
      .axis_iter(Axis(1))
      .map(|col| self.annualize_series(&col.to_vec()))
      .collect()
  }

  fn ema_historical(&self, returns: &Array2<f64>, span: usize) -> Result<Vec<f64>> {
    if span == 0 {
      return Err(PortfolioError::invalid(
        Stage::ExpectedReturns,
        "span",
        "must be a positive integer, got 0",
      ));
    }

    let w = ewm_weights(returns.nrows(), span);
    Ok(
      returns
        .axis_iter(Axis(1))
        .map(|col| {
          let m: f64 = col.iter().zip(&w).map(|(r, wi)| r * wi).sum();
          self.annualize_mean(m)
        })
        .collect(),
    )
  }

  fn capm(&self, returns: &Array2<f64>, prices: &PriceHistory) -> Result<Vec<f64>> {
    let market: Vec<f64> = match &self.market_prices {
      Some(benchmark) => {
        if benchmark.len() != prices.n_observations() {
          return Err(PortfolioError::invalid(
            Stage::ExpectedReturns,
            "market_prices",
            format!(
              "benchmark has {} prices, history has {}",
              benchmark.len(),
              prices.n_observations()
            ),
          ));
        }
        if benchmark.iter().any(|p| !p.is_finite() || *p <= 0.0) {
          return Err(PortfolioError::invalid(
            Stage::ExpectedReturns,
            "market_prices",
            "benchmark prices must be finite and positive",
          ));
        }
        match self.return_kind {
          ReturnKind::Simple => simple_returns_series(benchmark),
          ReturnKind::Log => log_returns_series(benchmark),
        }
      }
      // equal-weighted universe
      None => returns
        .mean_axis(Axis(1))
        .map(|m| m.to_vec())
        .unwrap_or_default(),
    };

    let market_return = self.annualize_series(&market);
    debug!(market_return, "capm market return");

    returns
      .axis_iter(Axis(1))
      .zip(prices.tickers())
      .map(|(col, ticker)| {
        let asset = col.to_vec();
        let (beta, _): (f64, f64) = linear_regression(market.as_slice(), asset.as_slice()).map_err(|e| {
          PortfolioError::invalid(
            Stage::ExpectedReturns,
            "market_prices",
            format!("beta regression failed for {ticker}: {e:?}"),
          )
        })?;
        Ok(self.risk_free_rate + beta * (market_return - self.risk_free_rate))
      })
      .collect()
  }

  /// Annualize a daily return series according to the compounding policy.
  fn annualize_series(&self, daily: &[f64]) -> f64 {
    let n = daily.len() as f64;
    let f = self.frequency as f64;
    if !self.compounding {
      return daily.iter().sum::<f64>() / n * f;
    }
    match self.return_kind {
      ReturnKind::Simple => {
        let growth: f64 = daily.iter().map(|r| 1.0 + r).product();
        growth.powf(f / n) - 1.0
      }
      ReturnKind::Log => (daily.iter().sum::<f64>() / n * f).exp() - 1.0,
    }
  }

  fn annualize_mean(&self, daily_mean: f64) -> f64 {
    let f = self.frequency as f64;
    match (self.compounding, self.return_kind) {
      (false, _) => daily_mean * f,
      (true, ReturnKind::Simple) => (1.0 + daily_mean).powf(f) - 1.0,
      (true, ReturnKind::Log) => (daily_mean * f).exp() - 1.0,
    }
  }
}
