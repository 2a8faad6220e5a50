//! # Portfolio Pipeline
//!
//! $$
//! P \;\to\; (\hat\mu, \hat\Sigma) \;\to\; \mathbf w^\* \;\to\; \mathbf n
//! $$
//!
//! Orchestration of one run: prices, estimators, optimizer and discrete
//! allocation, each inside its own tracing span.

use chrono::NaiveDate;
use tracing::info;
use tracing::info_span;

use crate::config::PortfolioConfig;
use crate::discrete_allocation::allocate;
use crate::discrete_allocation::latest_prices;
use crate::discrete_allocation::DiscreteAllocation;
use crate::efficient_frontier::EfficientFrontier;
use crate::efficient_frontier::Objective;
use crate::efficient_frontier::PerformanceSummary;
use crate::efficient_frontier::SolverSettings;
use crate::efficient_frontier::WeightAllocation;
use crate::efficient_frontier::WeightBounds;
use crate::efficient_frontier::DEFAULT_L2_GAMMA;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::expected_returns::ReturnEstimator;
use crate::expected_returns::ReturnMethod;
use crate::expected_returns::ReturnVector;
use crate::prices::PriceHistory;
use crate::prices::PriceProvider;
use crate::risk_models::CovarianceMatrix;
use crate::risk_models::RiskEstimator;
use crate::risk_models::RiskMethod;

/// Typed settings for [`PortfolioEngine`].
#[derive(Clone, Debug)]
pub struct PortfolioSettings {
  /// Cash to allocate.
  pub budget: f64,
  pub return_method: ReturnMethod,
  pub return_estimator: ReturnEstimator,
  /// CAPM benchmark ticker, fetched alongside the universe.
  pub benchmark: Option<String>,
  pub risk_method: RiskMethod,
  pub risk_estimator: RiskEstimator,
  pub objective: Objective,
  pub bounds: WeightBounds,
  pub l2_gamma: f64,
  /// Risk-free rate of the reported Sharpe ratio.
  pub risk_free_rate: f64,
  /// `(cutoff, rounding)` of the weight cleaning step, if enabled.
  pub clean: Option<(f64, u32)>,
  pub solver: SolverSettings,
}

impl Default for PortfolioSettings {
  fn default() -> Self {
    Self {
      budget: 10_000.0,
      return_method: ReturnMethod::MeanHistorical,
      return_estimator: ReturnEstimator::default(),
      benchmark: None,
      risk_method: RiskMethod::LedoitWolf {
        target: Default::default(),
      },
      risk_estimator: RiskEstimator::default(),
      objective: Objective::MaxSharpe {
        risk_free_rate: 0.02,
      },
      bounds: WeightBounds::default(),
      l2_gamma: DEFAULT_L2_GAMMA,
      risk_free_rate: 0.02,
      clean: Some((1e-4, 5)),
      solver: SolverSettings::default(),
    }
  }
}

/// Everything a run produces.
#[derive(Clone, Debug)]
pub struct PortfolioReport {
  pub expected_returns: ReturnVector,
  pub covariance: CovarianceMatrix,
  pub weights: WeightAllocation,
  pub performance: PerformanceSummary,
  pub allocation: DiscreteAllocation,
}

/// Single entry point running the full allocation pipeline.
#[derive(Clone, Debug)]
pub struct PortfolioEngine {
  settings: PortfolioSettings,
}

impl PortfolioEngine {
  pub fn new(settings: PortfolioSettings) -> Self {
    Self { settings }
  }

  /// Validate `config` and build an engine from it.
  pub fn from_config(config: &PortfolioConfig) -> Result<Self> {
    Ok(Self::new(config.to_settings()?))
  }

  pub fn settings(&self) -> &PortfolioSettings {
    &self.settings
  }

  /// Fetch `tickers` (plus the benchmark) from `provider` and run.
  pub fn run_with_provider(
    &self,
    provider: &dyn PriceProvider,
    tickers: &[String],
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<PortfolioReport> {
    let mut fetch = tickers.to_vec();
    if let Some(b) = &self.settings.benchmark {
      if !fetch.contains(b) {
        fetch.push(b.clone());
      }
    }

    let history = {
      let _span = info_span!("prices", tickers = fetch.len(), %start, %end).entered();
      let history = provider.fetch(&fetch, start, end)?;
      info!(observations = history.n_observations(), "price history ready");
      history
    };

    let mut engine = self.clone();
    if let Some(b) = &self.settings.benchmark {
      let column = history
        .column(b)
        .ok_or_else(|| PortfolioError::DataUnavailable {
          ticker: b.clone(),
          reason: "benchmark missing from price history".to_string(),
        })?;
      engine.settings.return_estimator.market_prices = Some(column.to_vec());
    }
    engine.run(&history.select(tickers)?)
  }

  /// Run every stage on an already loaded price history.
  pub fn run(&self, history: &PriceHistory) -> Result<PortfolioReport> {
    let s = &self.settings;

    let expected_returns = {
      let _span = info_span!("expected_returns", method = ?s.return_method).entered();
      s.return_estimator.estimate(history, s.return_method)?
    };

    let covariance = {
      let _span = info_span!("risk_model", method = ?s.risk_method).entered();
      s.risk_estimator.estimate(history, s.risk_method)?
    };

    let (weights, performance) = {
      let _span = info_span!("optimizer", objective = s.objective.name()).entered();
      let frontier = EfficientFrontier::new(&expected_returns, &covariance, &s.bounds, s.l2_gamma)?
        .with_settings(s.solver.clone());
      let raw = frontier.optimize(s.objective)?;
      let weights = match s.clean {
        Some((cutoff, rounding)) => raw.clean(cutoff, rounding)?,
        None => raw,
      };
      let performance = frontier.performance(&weights, s.risk_free_rate);
      info!(
        expected_return = performance.expected_annual_return,
        volatility = performance.expected_annual_volatility,
        sharpe = performance.sharpe_ratio,
        "portfolio performance"
      );
      (weights, performance)
    };

    let allocation = {
      let _span = info_span!("discrete_allocation", budget = s.budget).entered();
      allocate(&weights, &latest_prices(history), s.budget)?
    };

    Ok(PortfolioReport {
      expected_returns,
      covariance,
      weights,
      performance,
      allocation,
    })
  }
}

/// Load prices through `provider` and run the pipeline described by `config`.
pub fn run(config: &PortfolioConfig, provider: &dyn PriceProvider) -> Result<PortfolioReport> {
  let engine = PortfolioEngine::from_config(config)?;
  engine.run_with_provider(provider, &config.tickers, config.start()?, config.end()?)
}

#[cfg(test)]
mod tests {
  use tracing_test::traced_test;

  use super::*;
  use crate::discrete_allocation::AllocationOutcome;
  use crate::prices::InMemoryProvider;
  use crate::risk_models::tests::synthetic_history;

  fn config(objective: &str) -> PortfolioConfig {
    let mut config: PortfolioConfig = toml::from_str(
      r#"
budget = 10000.0
tickers = ["T0", "T1", "T2"]
start_date = "2022-01-01"
end_date = "2022-12-31"
"#,
    )
    .unwrap();
    config.optimizer.objective = objective.to_string();
    config
  }

  #[traced_test]
  #[test]
  fn runs_every_stage_and_logs_them() {
    let provider = InMemoryProvider::new(synthetic_history(4, 200));
    let report = run(&config("min_volatility"), &provider).unwrap();

    assert_eq!(report.weights.tickers().len(), 3);
    assert!((report.weights.sum() - 1.0).abs() < 1e-6);
    for (w, (lo, hi)) in report.weights.weights().iter().zip(report.weights.bounds()) {
      assert!(w >= lo && w <= hi);
    }
    assert_eq!(report.allocation.outcome, AllocationOutcome::Filled);
    assert!(report.allocation.leftover >= 0.0);
    assert!(report.performance.expected_annual_volatility > 0.0);

    assert!(logs_contain("estimated expected returns"));
    assert!(logs_contain("estimated risk model"));
    assert!(logs_contain("optimized portfolio"));
    assert!(logs_contain("discrete allocation complete"));
  }

  #[test]
  fn benchmark_feeds_capm() {
    let provider = InMemoryProvider::new(synthetic_history(4, 200));
    let mut config = config("min_volatility");
    config.returns.method = "capm".into();
    config.returns.benchmark = Some("T3".into());
    let report = run(&config, &provider).unwrap();
    assert_eq!(report.expected_returns.tickers(), &config.tickers[..]);
  }

  #[test]
  fn tiny_budget_is_a_valid_outcome() {
    let history = synthetic_history(2, 60);
    let engine = PortfolioEngine::new(PortfolioSettings {
      budget: 1.0,
      objective: Objective::MinVolatility,
      ..Default::default()
    });
    let report = engine.run(&history).unwrap();
    assert_eq!(report.allocation.outcome, AllocationOutcome::BudgetTooSmall);
    assert_eq!(report.allocation.leftover, 1.0);
    assert!(report.allocation.ensure_filled().is_err());
  }

  #[test]
  fn unknown_tickers_surface_as_unavailable() {
    let provider = InMemoryProvider::new(synthetic_history(2, 60));
    let err = run(&config("min_volatility"), &provider).unwrap_err();
    assert!(matches!(err, PortfolioError::DataUnavailable { .. }));
  }
}
