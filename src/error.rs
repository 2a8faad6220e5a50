//! # Errors
//!
//! Error taxonomy shared by every pipeline stage. Each core variant records the
//! [`Stage`] that raised it together with the offending parameters.

use std::fmt::Display;

use thiserror::Error;

/// Pipeline stage that produced an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
  PriceHistory,
  ExpectedReturns,
  RiskModel,
  Optimizer,
  DiscreteAllocation,
  Config,
}

impl Display for Stage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Stage::PriceHistory => write!(f, "price history"),
      Stage::ExpectedReturns => write!(f, "expected returns"),
      Stage::RiskModel => write!(f, "risk model"),
      Stage::Optimizer => write!(f, "frontier optimizer"),
      Stage::DiscreteAllocation => write!(f, "discrete allocation"),
      Stage::Config => write!(f, "configuration"),
    }
  }
}

#[derive(Error, Debug)]
pub enum PortfolioError {
  #[error("[{stage}] insufficient data for {ticker}: {observations} return observations, need at least {required}")]
  InsufficientData {
    stage: Stage,
    ticker: String,
    observations: usize,
    required: usize,
  },

  #[error("[{stage}] invalid parameter `{name}`: {reason}")]
  InvalidParameter {
    stage: Stage,
    name: &'static str,
    reason: String,
  },

  #[error("[{stage}] covariance matrix could not be repaired: min eigenvalue {min_eigenvalue:e}")]
  SingularMatrix { stage: Stage, min_eigenvalue: f64 },

  #[error("infeasible weight bounds: sum of minimums {min_sum:.6}, sum of maximums {max_sum:.6}")]
  InfeasibleBounds { min_sum: f64, max_sum: f64 },

  #[error("infeasible {objective} target {target:.6}: attainable limit is {attainable:.6}")]
  InfeasibleTarget {
    objective: &'static str,
    target: f64,
    attainable: f64,
  },

  #[error("solver did not converge for {objective} after {iterations} iterations (primal residual {primal_residual:e}, dual residual {dual_residual:e})")]
  SolverDivergence {
    objective: &'static str,
    iterations: usize,
    primal_residual: f64,
    dual_residual: f64,
  },

  #[error("budget {budget:.2} is below the cheapest price {cheapest_price:.2} ({ticker})")]
  BudgetTooSmall {
    budget: f64,
    cheapest_price: f64,
    ticker: String,
  },

  #[error("price data unavailable for {ticker}: {reason}")]
  DataUnavailable { ticker: String, reason: String },

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("CSV parsing error: {0}")]
  Csv(#[from] csv::Error),

  #[error("TOML parsing error: {0}")]
  Toml(#[from] toml::de::Error),

  #[error("date parsing error: {0}")]
  DateParse(#[from] chrono::ParseError),
}

impl PortfolioError {
  pub(crate) fn invalid(stage: Stage, name: &'static str, reason: impl Into<String>) -> Self {
    PortfolioError::InvalidParameter {
      stage,
      name,
      reason: reason.into(),
    }
  }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PortfolioError>;
