//! # Efficient Frontier
//!
//! $$
//! \min_{\mathbf w}\ \mathbf w^\top\Sigma\mathbf w + \gamma\lVert\mathbf w\rVert^2
//! \quad\text{s.t.}\quad \mathbf 1^\top\mathbf w = 1,\ l_i \le w_i \le u_i
//! $$
//!
//! Long-only mean-variance optimizers with L2 regularization. Every objective
//! is written as a conic program (budget row in the zero cone, boxes and
//! targets in the nonnegative cone, the risk cap as a second-order cone) and
//! handed to Clarabel through [`conic`].

pub mod bounds;
pub mod conic;

use std::collections::BTreeMap;

use impl_new_derive::ImplNew;
use nalgebra::DMatrix;
use nalgebra::DVector;
use nalgebra::SymmetricEigen;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::error::Stage;
use crate::expected_returns::ReturnVector;
use crate::risk_models::CovarianceMatrix;

pub use bounds::project_to_bounds;
pub use bounds::WeightBounds;
pub use conic::SolverSettings;

use conic::ConicProgram;
use conic::ConicStatus;

/// Default L2 regularization strength.
pub const DEFAULT_L2_GAMMA: f64 = 0.1;
/// Default cutoff of [`WeightAllocation::clean`].
pub const DEFAULT_CLEAN_CUTOFF: f64 = 1e-4;
/// Default decimal places of [`WeightAllocation::clean`].
pub const DEFAULT_CLEAN_ROUNDING: u32 = 5;
/// Finest rounding [`WeightAllocation::clean`] accepts.
pub const MAX_CLEAN_ROUNDING: u32 = 15;

/// Optimization objective.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Objective {
  /// Tangency portfolio for the given risk-free rate.
  MaxSharpe { risk_free_rate: f64 },
  /// Global minimum-variance portfolio.
  MinVolatility,
  /// Highest return with volatility at most the target.
  EfficientRisk { target_volatility: f64 },
  /// Lowest variance with return at least the target.
  EfficientReturn { target_return: f64 },
}

impl Objective {
  /// Parse an objective name. `target` feeds the efficient objectives.
  pub fn from_str(s: &str, target: Option<f64>, risk_free_rate: f64) -> Option<Self> {
    match s.to_lowercase().as_str() {
      "max_sharpe" | "sharpe" => Some(Self::MaxSharpe { risk_free_rate }),
      "min_volatility" | "min_vol" => Some(Self::MinVolatility),
      "efficient_risk" => target.map(|t| Self::EfficientRisk {
        target_volatility: t,
      }),
      "efficient_return" => target.map(|t| Self::EfficientReturn { target_return: t }),
      _ => None,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Self::MaxSharpe { .. } => "max_sharpe",
      Self::MinVolatility => "min_volatility",
      Self::EfficientRisk { .. } => "efficient_risk",
      Self::EfficientReturn { .. } => "efficient_return",
    }
  }
}

/// Continuous weights indexed by ticker, with the boxes they were solved under.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightAllocation {
  tickers: Vec<String>,
  weights: Vec<f64>,
  bounds: Vec<(f64, f64)>,
}

impl WeightAllocation {
  /// Weights under the default `(0, 1)` boxes.
  pub fn new(tickers: Vec<String>, weights: Vec<f64>) -> Result<Self> {
    if tickers.len() != weights.len() {
      return Err(PortfolioError::invalid(
        Stage::Optimizer,
        "weights",
        format!("{} weights for {} tickers", weights.len(), tickers.len()),
      ));
    }
    let bounds = vec![(0.0, 1.0); weights.len()];
    Ok(Self {
      tickers,
      weights,
      bounds,
    })
  }

  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  pub fn weights(&self) -> &[f64] {
    &self.weights
  }

  pub fn bounds(&self) -> &[(f64, f64)] {
    &self.bounds
  }

  pub fn get(&self, ticker: &str) -> Option<f64> {
    let i = self.tickers.iter().position(|t| t == ticker)?;
    Some(self.weights[i])
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
    self
      .tickers
      .iter()
      .map(String::as_str)
      .zip(self.weights.iter().copied())
  }

  pub fn to_map(&self) -> BTreeMap<String, f64> {
    self.iter().map(|(t, w)| (t.to_string(), w)).collect()
  }

  pub fn sum(&self) -> f64 {
    self.weights.iter().sum()
  }

  /// Zero weights below `cutoff` where the lower bound allows it, hand the
  /// freed mass to assets with room below their cap, then round to
  /// `rounding` decimals. The rounding residual lands on the largest weight
  /// that can absorb it, so the result still sums to one inside its boxes.
  pub fn clean(&self, cutoff: f64, rounding: u32) -> Result<Self> {
    if rounding > MAX_CLEAN_ROUNDING {
      return Err(PortfolioError::invalid(
        Stage::Optimizer,
        "rounding",
        format!("at most {MAX_CLEAN_ROUNDING} decimals, got {rounding}"),
      ));
    }
    if !cutoff.is_finite() || cutoff < 0.0 {
      return Err(PortfolioError::invalid(
        Stage::Optimizer,
        "cutoff",
        format!("must be non-negative, got {cutoff}"),
      ));
    }

    let mut weights = self.weights.clone();
    let mut boxes = self.bounds.clone();
    for (w, b) in weights.iter_mut().zip(boxes.iter_mut()) {
      if w.abs() < cutoff && b.0 <= 0.0 {
        *w = 0.0;
        *b = (0.0, 0.0);
      }
    }
    project_to_bounds(&mut weights, &boxes)?;

    let scale = 10f64.powi(rounding as i32);
    for (w, (lo, hi)) in weights.iter_mut().zip(&boxes) {
      *w = ((*w * scale).round() / scale).clamp(*lo, *hi);
    }

    let residual = 1.0 - weights.iter().sum::<f64>();
    if residual != 0.0 {
      let absorber = (0..weights.len())
        .filter(|&i| {
          let v = weights[i] + residual;
          v >= boxes[i].0 && v <= boxes[i].1
        })
        .max_by(|&i, &j| weights[i].total_cmp(&weights[j]));
      match absorber {
        Some(i) => weights[i] += residual,
        None => project_to_bounds(&mut weights, &boxes)?,
      }
    }

    Ok(Self {
      tickers: self.tickers.clone(),
      weights,
      bounds: self.bounds.clone(),
    })
  }
}

/// Expected return, volatility and Sharpe ratio of a portfolio.
#[derive(ImplNew, Clone, Copy, Debug, PartialEq)]
pub struct PerformanceSummary {
  pub expected_annual_return: f64,
  pub expected_annual_volatility: f64,
  pub sharpe_ratio: f64,
}

/// `w.mu`, `sqrt(w' Sigma w)` and `(ret - rf) / vol`, with a zero Sharpe ratio
/// for a riskless portfolio.
pub fn portfolio_performance(
  weights: &DVector<f64>,
  mu: &DVector<f64>,
  sigma: &DMatrix<f64>,
  risk_free_rate: f64,
) -> PerformanceSummary {
  let ret = weights.dot(mu);
  let vol = (weights.dot(&(sigma * weights))).max(0.0).sqrt();
  let sharpe = if vol > 0.0 {
    (ret - risk_free_rate) / vol
  } else {
    0.0
  };
  PerformanceSummary::new(ret, vol, sharpe)
}

/// One sampled point of the efficient frontier.
#[derive(Clone, Debug)]
pub struct FrontierPoint {
  pub target_return: f64,
  pub weights: WeightAllocation,
  pub performance: PerformanceSummary,
}

/// Mean-variance optimizer over a fixed universe.
#[derive(Clone, Debug)]
pub struct EfficientFrontier {
  tickers: Vec<String>,
  mu: DVector<f64>,
  sigma: DMatrix<f64>,
  bounds: Vec<(f64, f64)>,
  l2_gamma: f64,
  settings: SolverSettings,
}

impl EfficientFrontier {
  pub fn new(
    mu: &ReturnVector,
    sigma: &CovarianceMatrix,
    bounds: &WeightBounds,
    l2_gamma: f64,
  ) -> Result<Self> {
    let stage = Stage::Optimizer;
    if mu.tickers() != sigma.tickers() {
      return Err(PortfolioError::invalid(
        stage,
        "tickers",
        format!(
          "expected returns cover {:?} but covariance covers {:?}",
          mu.tickers(),
          sigma.tickers()
        ),
      ));
    }
    if mu.is_empty() {
      return Err(PortfolioError::invalid(stage, "tickers", "empty universe"));
    }
    if mu.values().iter().any(|v| !v.is_finite()) {
      return Err(PortfolioError::invalid(stage, "mu", "expected returns must be finite"));
    }
    if sigma.matrix().iter().any(|v| !v.is_finite()) {
      return Err(PortfolioError::invalid(stage, "sigma", "covariance must be finite"));
    }
    if !l2_gamma.is_finite() || l2_gamma < 0.0 {
      return Err(PortfolioError::invalid(
        stage,
        "l2_gamma",
        format!("must be a non-negative number, got {l2_gamma}"),
      ));
    }
    let bounds = bounds.resolve(mu.len())?;

    Ok(Self {
      tickers: mu.tickers().to_vec(),
      mu: mu.values().clone(),
      sigma: sigma.matrix().clone(),
      bounds,
      l2_gamma,
      settings: SolverSettings::default(),
    })
  }

  pub fn with_settings(mut self, settings: SolverSettings) -> Self {
    self.settings = settings;
    self
  }

  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  pub fn bounds(&self) -> &[(f64, f64)] {
    &self.bounds
  }

  fn n(&self) -> usize {
    self.tickers.len()
  }

  /// Solve for the weights of `objective`.
  pub fn optimize(&self, objective: Objective) -> Result<WeightAllocation> {
    let w = match objective {
      Objective::MinVolatility => self.min_volatility(self.l2_gamma)?,
      Objective::EfficientReturn { target_return } => self.efficient_return(target_return)?,
      Objective::MaxSharpe { risk_free_rate } => self.max_sharpe(risk_free_rate)?,
      Objective::EfficientRisk { target_volatility } => self.efficient_risk(target_volatility)?,
    };
    let allocation = self.finalize(w)?;
    let perf = self.performance(&allocation, 0.0);
    info!(
      objective = objective.name(),
      expected_return = perf.expected_annual_return,
      volatility = perf.expected_annual_volatility,
      "optimized portfolio"
    );
    Ok(allocation)
  }

  /// Performance of `weights` under this frontier's `mu` and `Sigma`.
  pub fn performance(&self, weights: &WeightAllocation, risk_free_rate: f64) -> PerformanceSummary {
    let w = DVector::from_fn(self.n(), |i, _| weights.get(&self.tickers[i]).unwrap_or(0.0));
    portfolio_performance(&w, &self.mu, &self.sigma, risk_free_rate)
  }

  /// Sample `points` portfolios between the minimum-variance return and the
  /// highest attainable return.
  pub fn efficient_frontier(&self, points: usize, risk_free_rate: f64) -> Result<Vec<FrontierPoint>> {
    if points < 2 {
      return Err(PortfolioError::invalid(
        Stage::Optimizer,
        "points",
        format!("need at least 2 frontier points, got {points}"),
      ));
    }
    let w_min = self.min_volatility(self.l2_gamma)?;
    let r_min = w_min.dot(&self.mu);
    let (r_max, _) = max_attainable(&self.mu, &self.bounds);
    debug!(r_min, r_max, points, "sampling efficient frontier");

    let mut frontier = Vec::with_capacity(points);
    for k in 0..points {
      let target_return = r_min + (r_max - r_min) * k as f64 / (points - 1) as f64;
      let weights = self.finalize(self.efficient_return(target_return)?)?;
      let performance = self.performance(&weights, risk_free_rate);
      frontier.push(FrontierPoint {
        target_return,
        weights,
        performance,
      });
    }
    Ok(frontier)
  }

  /// Objective `p`, `q` over the weights with the budget row and the boxes.
  fn budget_and_boxes(&self, p: DMatrix<f64>, q: DVector<f64>) -> ConicProgram {
    let n = self.n();
    let lower = DVector::from_iterator(n, self.bounds.iter().map(|b| -b.0));
    let upper = DVector::from_iterator(n, self.bounds.iter().map(|b| b.1));
    let eye = DMatrix::<f64>::identity(n, n);
    ConicProgram::new(p, q)
      .equal(&DMatrix::from_element(1, n, 1.0), &DVector::from_element(1, 1.0))
      .at_most(&eye, &upper)
      .at_most(&-eye, &lower)
  }

  /// `2 (lambda Sigma + gamma I)`.
  fn hessian(&self, risk_aversion: f64, gamma: f64) -> DMatrix<f64> {
    let n = self.n();
    (&self.sigma * risk_aversion + DMatrix::<f64>::identity(n, n) * gamma) * 2.0
  }

  /// `F` with `F'F = Sigma`: the transposed Cholesky factor, or the spectral
  /// square root when `Sigma` is singular.
  fn risk_factor(&self) -> DMatrix<f64> {
    match self.sigma.clone().cholesky() {
      Some(chol) => chol.l().transpose(),
      None => {
        let eig = SymmetricEigen::new(self.sigma.clone());
        let root = eig.eigenvalues.map(|v| v.max(0.0).sqrt());
        DMatrix::from_diagonal(&root) * eig.eigenvectors.transpose()
      }
    }
  }

  fn infeasible_bounds(&self) -> PortfolioError {
    let (min_sum, max_sum) = self
      .bounds
      .iter()
      .fold((0.0, 0.0), |(a, b), (lo, hi)| (a + lo, b + hi));
    PortfolioError::InfeasibleBounds { min_sum, max_sum }
  }

  fn solve(
    &self,
    program: &ConicProgram,
    objective: &Objective,
    infeasible: impl FnOnce() -> PortfolioError,
  ) -> Result<DVector<f64>> {
    let solution = conic::solve(program, &self.settings)?;
    match solution.status {
      ConicStatus::Solved => Ok(solution.x),
      ConicStatus::Infeasible => Err(infeasible()),
      ConicStatus::MaxIterations | ConicStatus::NumericalError => {
        warn!(
          objective = objective.name(),
          status = ?solution.status,
          iterations = solution.iterations,
          "solver failed"
        );
        Err(PortfolioError::SolverDivergence {
          objective: objective.name(),
          iterations: solution.iterations,
          primal_residual: solution.primal_residual,
          dual_residual: solution.dual_residual,
        })
      }
    }
  }

  fn min_volatility(&self, gamma: f64) -> Result<DVector<f64>> {
    let program = self.budget_and_boxes(self.hessian(1.0, gamma), DVector::zeros(self.n()));
    self.solve(&program, &Objective::MinVolatility, || self.infeasible_bounds())
  }

  fn efficient_return(&self, target_return: f64) -> Result<DVector<f64>> {
    let objective = Objective::EfficientReturn { target_return };
    if !target_return.is_finite() {
      return Err(PortfolioError::invalid(
        Stage::Optimizer,
        "target_return",
        "must be finite",
      ));
    }
    let (attainable, corner) = max_attainable(&self.mu, &self.bounds);
    let unreachable = || PortfolioError::InfeasibleTarget {
      objective: objective.name(),
      target: target_return,
      attainable,
    };
    if target_return > attainable + 1e-9 {
      return Err(unreachable());
    }
    if target_return >= attainable - 1e-12 {
      // only the corner portfolio reaches the maximum
      return Ok(DVector::from_vec(corner));
    }

    let n = self.n();
    let return_row = -DMatrix::from_row_slice(1, n, self.mu.as_slice());
    let program = self
      .budget_and_boxes(self.hessian(1.0, self.l2_gamma), DVector::zeros(n))
      .at_most(&return_row, &DVector::from_element(1, -target_return));
    self.solve(&program, &objective, unreachable)
  }

  fn max_sharpe(&self, risk_free_rate: f64) -> Result<DVector<f64>> {
    let objective = Objective::MaxSharpe { risk_free_rate };
    let excess = self.mu.add_scalar(-risk_free_rate);
    let (best_excess, _) = max_attainable(&excess, &self.bounds);
    if !risk_free_rate.is_finite() || best_excess <= 0.0 {
      return Err(PortfolioError::invalid(
        Stage::Optimizer,
        "risk_free_rate",
        format!(
          "at least one feasible portfolio must have an expected return above the risk-free rate {risk_free_rate}"
        ),
      ));
    }

    // variables (y, kappa) with y = kappa * w
    let n = self.n();
    let k = n;
    let mut p = DMatrix::<f64>::zeros(n + 1, n + 1);
    p.view_mut((0, 0), (n, n)).copy_from(&self.hessian(1.0, self.l2_gamma));

    let mut eq = DMatrix::<f64>::zeros(2, n + 1);
    for i in 0..n {
      eq[(0, i)] = excess[i];
      eq[(1, i)] = 1.0;
    }
    eq[(1, k)] = -1.0;

    // kappa * lo_i <= y_i <= kappa * hi_i, kappa >= 0
    let mut ineq = DMatrix::<f64>::zeros(2 * n + 1, n + 1);
    for (i, (lo, hi)) in self.bounds.iter().enumerate() {
      ineq[(i, i)] = -1.0;
      ineq[(i, k)] = *lo;
      ineq[(n + i, i)] = 1.0;
      ineq[(n + i, k)] = -hi;
    }
    ineq[(2 * n, k)] = -1.0;

    let program = ConicProgram::new(p, DVector::zeros(n + 1))
      .equal(&eq, &DVector::from_vec(vec![1.0, 0.0]))
      .at_most(&ineq, &DVector::zeros(2 * n + 1));
    let x = self.solve(&program, &objective, || self.infeasible_bounds())?;
    let kappa = x[k];
    if kappa <= 1e-12 {
      return Err(PortfolioError::SolverDivergence {
        objective: objective.name(),
        iterations: 0,
        primal_residual: f64::NAN,
        dual_residual: f64::NAN,
      });
    }
    Ok(x.rows(0, n).into_owned() / kappa)
  }

  fn volatility(&self, w: &DVector<f64>) -> f64 {
    w.dot(&(&self.sigma * w)).max(0.0).sqrt()
  }

  fn efficient_risk(&self, target_volatility: f64) -> Result<DVector<f64>> {
    let objective = Objective::EfficientRisk { target_volatility };
    if !target_volatility.is_finite() || target_volatility <= 0.0 {
      return Err(PortfolioError::invalid(
        Stage::Optimizer,
        "target_volatility",
        format!("must be positive, got {target_volatility}"),
      ));
    }

    let w_min = self.min_volatility(0.0)?;
    let min_vol = self.volatility(&w_min);
    let too_tight = || PortfolioError::InfeasibleTarget {
      objective: objective.name(),
      target: target_volatility,
      attainable: min_vol,
    };
    if min_vol > target_volatility + 1e-9 {
      return Err(too_tight());
    }
    if min_vol >= target_volatility - 1e-9 {
      debug!(min_vol, "target volatility is the minimum volatility");
      return Ok(w_min);
    }

    // max mu.w - gamma |w|^2 s.t. |F w| <= target
    let program = self
      .budget_and_boxes(self.hessian(0.0, self.l2_gamma), -self.mu.clone())
      .norm_at_most(&self.risk_factor(), target_volatility);
    self.solve(&program, &objective, too_tight)
  }

  /// Clamp into the bounds and restore the budget.
  fn finalize(&self, w: DVector<f64>) -> Result<WeightAllocation> {
    let mut weights: Vec<f64> = w.iter().copied().collect();
    project_to_bounds(&mut weights, &self.bounds)?;
    Ok(WeightAllocation {
      tickers: self.tickers.clone(),
      weights,
      bounds: self.bounds.clone(),
    })
  }
}

/// Highest `values.w` over the bounded simplex: start at the lower bounds and
/// fill the best assets up to their caps.
fn max_attainable(values: &DVector<f64>, bounds: &[(f64, f64)]) -> (f64, Vec<f64>) {
  let mut w: Vec<f64> = bounds.iter().map(|b| b.0).collect();
  let mut remaining = 1.0 - w.iter().sum::<f64>();
  let mut order: Vec<usize> = (0..values.len()).collect();
  order.sort_by(|&i, &j| values[j].total_cmp(&values[i]));
  for i in order {
    if remaining <= 0.0 {
      break;
    }
    let add = (bounds[i].1 - bounds[i].0).min(remaining);
    w[i] += add;
    remaining -= add;
  }
  let value = w.iter().zip(values.iter()).map(|(a, b)| a * b).sum();
  (value, w)
}
