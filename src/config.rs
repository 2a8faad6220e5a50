//! # Configuration
//!
//! TOML run configuration. Every value is checked by
//! [`PortfolioConfig::validate`] before it is turned into the typed settings
//! the pipeline consumes.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::efficient_frontier::Objective;
use crate::efficient_frontier::SolverSettings;
use crate::efficient_frontier::WeightBounds;
use crate::efficient_frontier::DEFAULT_CLEAN_CUTOFF;
use crate::efficient_frontier::DEFAULT_CLEAN_ROUNDING;
use crate::efficient_frontier::DEFAULT_L2_GAMMA;
use crate::efficient_frontier::MAX_CLEAN_ROUNDING;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::error::Stage;
use crate::expected_returns::ReturnEstimator;
use crate::expected_returns::ReturnMethod;
use crate::expected_returns::TRADING_DAYS;
use crate::pipeline::PortfolioSettings;
use crate::prices::ReturnKind;
use crate::risk_models::FixMethod;
use crate::risk_models::RiskEstimator;
use crate::risk_models::RiskMethod;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Complete run configuration loaded from a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
  /// Cash to invest.
  pub budget: f64,
  /// Universe, in the order used for every output.
  pub tickers: Vec<String>,
  /// First day of the price window (YYYY-MM-DD).
  pub start_date: String,
  /// Last day of the price window (YYYY-MM-DD).
  pub end_date: String,
  #[serde(default)]
  pub returns: ReturnSettings,
  #[serde(default)]
  pub risk: RiskSettings,
  #[serde(default)]
  pub optimizer: OptimizerSettings,
  #[serde(default)]
  pub solver: SolverConfig,
}

/// Expected-return settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnSettings {
  /// "mean_historical", "ema" or "capm".
  #[serde(default = "default_return_method")]
  pub method: String,
  #[serde(default = "default_return_span")]
  pub span: usize,
  #[serde(default)]
  pub compounding: bool,
  #[serde(default)]
  pub log_returns: bool,
  #[serde(default = "default_frequency")]
  pub frequency: usize,
  /// Risk-free rate used by CAPM.
  #[serde(default = "default_risk_free_rate")]
  pub risk_free_rate: f64,
  /// Benchmark ticker for CAPM; the equal-weighted universe when absent.
  #[serde(default)]
  pub benchmark: Option<String>,
}

fn default_return_method() -> String {
  "mean_historical".to_string()
}
fn default_return_span() -> usize {
  500
}
fn default_frequency() -> usize {
  TRADING_DAYS
}
fn default_risk_free_rate() -> f64 {
  0.02
}

impl Default for ReturnSettings {
  fn default() -> Self {
    Self {
      method: default_return_method(),
      span: default_return_span(),
      compounding: false,
      log_returns: false,
      frequency: TRADING_DAYS,
      risk_free_rate: default_risk_free_rate(),
      benchmark: None,
    }
  }
}

/// Risk-model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSettings {
  /// "sample_cov", "exp_cov", "ledoit_wolf", "ledoit_wolf_constant_correlation"
  /// or "ledoit_wolf_single_factor".
  #[serde(default = "default_risk_method")]
  pub method: String,
  #[serde(default = "default_risk_span")]
  pub span: usize,
  /// "spectral" or "diag".
  #[serde(default = "default_fix_method")]
  pub fix_method: String,
}

fn default_risk_method() -> String {
  "ledoit_wolf".to_string()
}
fn default_risk_span() -> usize {
  180
}
fn default_fix_method() -> String {
  "spectral".to_string()
}

impl Default for RiskSettings {
  fn default() -> Self {
    Self {
      method: default_risk_method(),
      span: default_risk_span(),
      fix_method: default_fix_method(),
    }
  }
}

/// Objective, bounds and regularization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
  /// "max_sharpe", "min_volatility", "efficient_risk" or "efficient_return".
  #[serde(default = "default_objective")]
  pub objective: String,
  #[serde(default)]
  pub target_volatility: Option<f64>,
  #[serde(default)]
  pub target_return: Option<f64>,
  /// Risk-free rate for the Sharpe objective and reported performance.
  #[serde(default = "default_risk_free_rate")]
  pub risk_free_rate: f64,
  #[serde(default = "default_l2_gamma")]
  pub l2_gamma: f64,
  #[serde(default)]
  pub min_weight: f64,
  #[serde(default = "default_max_weight")]
  pub max_weight: f64,
  /// Per-ticker `[min, max]` overrides of the uniform bounds.
  #[serde(default)]
  pub weight_bounds: BTreeMap<String, (f64, f64)>,
  #[serde(default = "default_true")]
  pub clean_weights: bool,
  #[serde(default = "default_clean_cutoff")]
  pub clean_cutoff: f64,
  #[serde(default = "default_clean_rounding")]
  pub clean_rounding: u32,
}

fn default_objective() -> String {
  "max_sharpe".to_string()
}
fn default_l2_gamma() -> f64 {
  DEFAULT_L2_GAMMA
}
fn default_max_weight() -> f64 {
  1.0
}
fn default_true() -> bool {
  true
}
fn default_clean_cutoff() -> f64 {
  DEFAULT_CLEAN_CUTOFF
}
fn default_clean_rounding() -> u32 {
  DEFAULT_CLEAN_ROUNDING
}

impl Default for OptimizerSettings {
  fn default() -> Self {
    Self {
      objective: default_objective(),
      target_volatility: None,
      target_return: None,
      risk_free_rate: default_risk_free_rate(),
      l2_gamma: DEFAULT_L2_GAMMA,
      min_weight: 0.0,
      max_weight: 1.0,
      weight_bounds: BTreeMap::new(),
      clean_weights: true,
      clean_cutoff: DEFAULT_CLEAN_CUTOFF,
      clean_rounding: DEFAULT_CLEAN_ROUNDING,
    }
  }
}

/// Interior-point solver knobs; unset values keep the solver defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolverConfig {
  pub max_iter: Option<usize>,
  pub tol_gap_abs: Option<f64>,
  pub tol_gap_rel: Option<f64>,
  pub tol_feas: Option<f64>,
}

fn invalid(name: &'static str, reason: impl Into<String>) -> PortfolioError {
  PortfolioError::invalid(Stage::Config, name, reason)
}

impl PortfolioConfig {
  /// Load configuration from a TOML file.
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    info!("Loading configuration from: {}", path.display());

    let content = fs::read_to_string(path)?;
    let config: PortfolioConfig = toml::from_str(&content)?;
    Ok(config)
  }

  pub fn start(&self) -> Result<NaiveDate> {
    Ok(NaiveDate::parse_from_str(&self.start_date, DATE_FORMAT)?)
  }

  pub fn end(&self) -> Result<NaiveDate> {
    Ok(NaiveDate::parse_from_str(&self.end_date, DATE_FORMAT)?)
  }

  /// Check each value independently of the others.
  pub fn validate(&self) -> Result<()> {
    if !self.budget.is_finite() || self.budget <= 0.0 {
      return Err(invalid("budget", format!("must be positive, got {}", self.budget)));
    }
    if self.tickers.is_empty() {
      return Err(invalid("tickers", "at least one ticker is required"));
    }
    for (i, t) in self.tickers.iter().enumerate() {
      if t.trim().is_empty() {
        return Err(invalid("tickers", "tickers must not be blank"));
      }
      if self.tickers[..i].contains(t) {
        return Err(invalid("tickers", format!("duplicate ticker {t}")));
      }
    }
    if self.start()? >= self.end()? {
      return Err(invalid(
        "start_date",
        format!("{} is not before {}", self.start_date, self.end_date),
      ));
    }

    let r = &self.returns;
    if ReturnMethod::from_str(&r.method, Some(r.span)).is_none() {
      return Err(invalid("returns.method", format!("unknown method {}", r.method)));
    }
    if r.span == 0 {
      return Err(invalid("returns.span", "must be a positive integer"));
    }
    if r.frequency == 0 {
      return Err(invalid("returns.frequency", "must be a positive integer"));
    }
    if !r.risk_free_rate.is_finite() {
      return Err(invalid("returns.risk_free_rate", "must be finite"));
    }

    let k = &self.risk;
    if RiskMethod::from_str(&k.method, Some(k.span)).is_none() {
      return Err(invalid("risk.method", format!("unknown method {}", k.method)));
    }
    if k.span == 0 {
      return Err(invalid("risk.span", "must be a positive integer"));
    }
    if FixMethod::from_str(&k.fix_method).is_none() {
      return Err(invalid("risk.fix_method", format!("unknown method {}", k.fix_method)));
    }

    let o = &self.optimizer;
    match o.objective.to_lowercase().as_str() {
      "efficient_risk" => match o.target_volatility {
        Some(v) if v.is_finite() && v > 0.0 => {}
        _ => {
          return Err(invalid(
            "optimizer.target_volatility",
            "efficient_risk needs a positive target volatility",
          ))
        }
      },
      "efficient_return" => match o.target_return {
        Some(v) if v.is_finite() => {}
        _ => {
          return Err(invalid(
            "optimizer.target_return",
            "efficient_return needs a finite target return",
          ))
        }
      },
      other => {
        if Objective::from_str(other, None, o.risk_free_rate).is_none() {
          return Err(invalid("optimizer.objective", format!("unknown objective {other}")));
        }
      }
    }
    if !o.risk_free_rate.is_finite() {
      return Err(invalid("optimizer.risk_free_rate", "must be finite"));
    }
    if !o.l2_gamma.is_finite() || o.l2_gamma < 0.0 {
      return Err(invalid("optimizer.l2_gamma", "must be non-negative"));
    }
    let in_unit = |lo: f64, hi: f64| 0.0 <= lo && lo <= hi && hi <= 1.0;
    if !in_unit(o.min_weight, o.max_weight) {
      return Err(invalid(
        "optimizer.min_weight",
        format!("need 0 <= min <= max <= 1, got ({}, {})", o.min_weight, o.max_weight),
      ));
    }
    for (t, (lo, hi)) in &o.weight_bounds {
      if !self.tickers.contains(t) {
        return Err(invalid("optimizer.weight_bounds", format!("{t} is not in the universe")));
      }
      if !in_unit(*lo, *hi) {
        return Err(invalid(
          "optimizer.weight_bounds",
          format!("{t}: need 0 <= min <= max <= 1, got ({lo}, {hi})"),
        ));
      }
    }
    if !o.clean_cutoff.is_finite() || o.clean_cutoff < 0.0 {
      return Err(invalid("optimizer.clean_cutoff", "must be non-negative"));
    }
    if o.clean_rounding > MAX_CLEAN_ROUNDING {
      return Err(invalid(
        "optimizer.clean_rounding",
        format!("at most {MAX_CLEAN_ROUNDING} decimals, got {}", o.clean_rounding),
      ));
    }

    let s = &self.solver;
    if s.max_iter == Some(0) {
      return Err(invalid("solver.max_iter", "must be positive"));
    }
    for (name, v) in [
      ("solver.tol_gap_abs", s.tol_gap_abs),
      ("solver.tol_gap_rel", s.tol_gap_rel),
      ("solver.tol_feas", s.tol_feas),
    ] {
      if matches!(v, Some(x) if !(x.is_finite() && x > 0.0)) {
        return Err(invalid(name, "must be positive"));
      }
    }
    Ok(())
  }

  /// Validate and convert into typed pipeline settings.
  pub fn to_settings(&self) -> Result<PortfolioSettings> {
    self.validate()?;

    let r = &self.returns;
    let return_method = ReturnMethod::from_str(&r.method, Some(r.span))
      .ok_or_else(|| invalid("returns.method", format!("unknown method {}", r.method)))?;
    let return_kind = if r.log_returns {
      ReturnKind::Log
    } else {
      ReturnKind::Simple
    };
    let return_estimator = ReturnEstimator {
      frequency: r.frequency,
      compounding: r.compounding,
      return_kind,
      risk_free_rate: r.risk_free_rate,
      market_prices: None,
    };

    let k = &self.risk;
    let risk_method = RiskMethod::from_str(&k.method, Some(k.span))
      .ok_or_else(|| invalid("risk.method", format!("unknown method {}", k.method)))?;
    let fix_method = FixMethod::from_str(&k.fix_method)
      .ok_or_else(|| invalid("risk.fix_method", format!("unknown method {}", k.fix_method)))?;
    let risk_estimator = RiskEstimator {
      frequency: r.frequency,
      return_kind,
      fix_method,
    };

    let o = &self.optimizer;
    let target = match o.objective.to_lowercase().as_str() {
      "efficient_risk" => o.target_volatility,
      "efficient_return" => o.target_return,
      _ => None,
    };
    let objective = Objective::from_str(&o.objective, target, o.risk_free_rate)
      .ok_or_else(|| invalid("optimizer.objective", format!("unknown objective {}", o.objective)))?;

    let bounds = if o.weight_bounds.is_empty() {
      WeightBounds::Uniform(o.min_weight, o.max_weight)
    } else {
      WeightBounds::PerAsset(
        self
          .tickers
          .iter()
          .map(|t| {
            o.weight_bounds
              .get(t)
              .copied()
              .unwrap_or((o.min_weight, o.max_weight))
          })
          .collect(),
      )
    };

    let defaults = SolverSettings::default();
    let s = &self.solver;
    let solver = SolverSettings {
      max_iter: s.max_iter.unwrap_or(defaults.max_iter),
      tol_gap_abs: s.tol_gap_abs.unwrap_or(defaults.tol_gap_abs),
      tol_gap_rel: s.tol_gap_rel.unwrap_or(defaults.tol_gap_rel),
      tol_feas: s.tol_feas.unwrap_or(defaults.tol_feas),
    };

    Ok(PortfolioSettings {
      budget: self.budget,
      return_method,
      return_estimator,
      benchmark: r.benchmark.clone(),
      risk_method,
      risk_estimator,
      objective,
      bounds,
      l2_gamma: o.l2_gamma,
      risk_free_rate: o.risk_free_rate,
      clean: o.clean_weights.then_some((o.clean_cutoff, o.clean_rounding)),
      solver,
    })
  }

  /// Example configuration file content.
  pub fn example() -> String {
    r#"budget = 10000.0
tickers = ["AAPL", "MSFT", "JNJ", "XOM"]
start_date = "2020-01-01"
end_date = "2024-12-31"

[returns]
method = "ema"          # mean_historical | ema | capm
span = 500
compounding = false
risk_free_rate = 0.02
# benchmark = "SPY"

[risk]
method = "ledoit_wolf"  # sample_cov | exp_cov | ledoit_wolf[_constant_correlation|_single_factor]
span = 180
fix_method = "spectral"

[optimizer]
objective = "max_sharpe" # max_sharpe | min_volatility | efficient_risk | efficient_return
# target_volatility = 0.18
# target_return = 0.12
risk_free_rate = 0.02
l2_gamma = 0.1
min_weight = 0.0
max_weight = 1.0

[optimizer.weight_bounds]
# AAPL = [0.05, 0.4]

[solver]
# max_iter = 200
# tol_feas = 1e-9
"#
    .to_string()
  }
}
