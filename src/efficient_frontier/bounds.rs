//! Per-asset weight bounds and the budget-preserving projection onto them.

use crate::error::PortfolioError;
use crate::error::Result;
use crate::error::Stage;

const FEASIBILITY_TOL: f64 = 1e-9;

/// Box constraints on individual weights.
#[derive(Clone, Debug, PartialEq)]
pub enum WeightBounds {
  /// Same `(min, max)` for every asset.
  Uniform(f64, f64),
  /// One `(min, max)` per asset, in ticker order.
  PerAsset(Vec<(f64, f64)>),
}

impl Default for WeightBounds {
  fn default() -> Self {
    WeightBounds::Uniform(0.0, 1.0)
  }
}

impl WeightBounds {
  /// Expand to one validated pair per asset.
  pub fn resolve(&self, n_assets: usize) -> Result<Vec<(f64, f64)>> {
    let pairs = match self {
      WeightBounds::Uniform(lo, hi) => vec![(*lo, *hi); n_assets],
      WeightBounds::PerAsset(pairs) => {
        if pairs.len() != n_assets {
          return Err(PortfolioError::invalid(
            Stage::Optimizer,
            "bounds",
            format!("{} pairs for {n_assets} assets", pairs.len()),
          ));
        }
        pairs.clone()
      }
    };

    for (i, (lo, hi)) in pairs.iter().enumerate() {
      if !(lo.is_finite() && hi.is_finite() && 0.0 <= *lo && lo <= hi && *hi <= 1.0) {
        return Err(PortfolioError::invalid(
          Stage::Optimizer,
          "bounds",
          format!("asset {i}: need 0 <= min <= max <= 1, got ({lo}, {hi})"),
        ));
      }
    }
    check_bounds_feasible(&pairs)?;
    Ok(pairs)
  }
}

/// Weights summing to one must fit inside the boxes.
pub fn check_bounds_feasible(bounds: &[(f64, f64)]) -> Result<()> {
  let min_sum: f64 = bounds.iter().map(|b| b.0).sum();
  let max_sum: f64 = bounds.iter().map(|b| b.1).sum();
  if min_sum - 1.0 > FEASIBILITY_TOL || max_sum + FEASIBILITY_TOL < 1.0 {
    return Err(PortfolioError::InfeasibleBounds { min_sum, max_sum });
  }
  Ok(())
}

/// Clamp into the boxes, then spread any budget gap proportionally to the
/// remaining room of each asset.
pub fn project_to_bounds(weights: &mut [f64], bounds: &[(f64, f64)]) -> Result<()> {
  for (w, (lo, hi)) in weights.iter_mut().zip(bounds) {
    *w = w.clamp(*lo, *hi);
  }
  let sum: f64 = weights.iter().sum();
  if (sum - 1.0).abs() < 1e-12 {
    return Ok(());
  }

  let room: Vec<f64> = if sum < 1.0 {
    bounds.iter().zip(weights.iter()).map(|(b, w)| b.1 - w).collect()
  } else {
    bounds.iter().zip(weights.iter()).map(|(b, w)| (w - b.0).max(0.0)).collect()
  };
  let total: f64 = room.iter().sum();
  if total <= 1e-12 {
    let (min_sum, max_sum) = bounds
      .iter()
      .fold((0.0, 0.0), |(a, b), (lo, hi)| (a + lo, b + hi));
    return Err(PortfolioError::InfeasibleBounds { min_sum, max_sum });
  }

  let gap = 1.0 - sum;
  for (w, r) in weights.iter_mut().zip(&room) {
    *w += gap * r / total;
  }
  Ok(())
}
