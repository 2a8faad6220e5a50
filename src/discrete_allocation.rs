//! # Discrete Allocation
//!
//! $$
//! n_i = \left\lfloor \frac{B\,w_i}{p_i} \right\rfloor,\qquad
//! i^\* = \arg\min_{p_i \le L}\ \frac{(n_i+1)\,p_i}{B} - w_i
//! $$
//!
//! Greedy conversion of continuous weights into whole shares within a budget.

use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use tracing::info;
use tracing::warn;

use crate::efficient_frontier::WeightAllocation;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::error::Stage;
use crate::prices::PriceHistory;

/// Whether the budget could buy anything at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationOutcome {
  Filled,
  /// The budget is below the cheapest price; no shares were bought.
  BudgetTooSmall,
}

/// Integer share counts and the cash left over.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscreteAllocation {
  pub shares: BTreeMap<String, u64>,
  pub leftover: f64,
  pub outcome: AllocationOutcome,
  budget: f64,
  cheapest: (String, f64),
}

impl DiscreteAllocation {
  pub fn budget(&self) -> f64 {
    self.budget
  }

  /// Cash spent on shares.
  pub fn invested(&self) -> f64 {
    self.budget - self.leftover
  }

  /// Turn a [`AllocationOutcome::BudgetTooSmall`] result into an error.
  pub fn ensure_filled(self) -> Result<Self> {
    match self.outcome {
      AllocationOutcome::Filled => Ok(self),
      AllocationOutcome::BudgetTooSmall => Err(PortfolioError::BudgetTooSmall {
        budget: self.budget,
        cheapest_price: self.cheapest.1,
        ticker: self.cheapest.0,
      }),
    }
  }
}

/// Last observed price of every ticker in `history`.
pub fn latest_prices(history: &PriceHistory) -> BTreeMap<String, f64> {
  history.latest_prices()
}

/// Greedy integer allocation of `budget` following `weights`.
pub fn allocate(
  weights: &WeightAllocation,
  latest_prices: &BTreeMap<String, f64>,
  budget: f64,
) -> Result<DiscreteAllocation> {
  let stage = Stage::DiscreteAllocation;
  if !budget.is_finite() || budget <= 0.0 {
    return Err(PortfolioError::invalid(
      stage,
      "budget",
      format!("must be a positive amount, got {budget}"),
    ));
  }
  if weights.tickers().is_empty() {
    return Err(PortfolioError::invalid(stage, "weights", "no tickers to allocate"));
  }

  let mut assets = Vec::with_capacity(weights.tickers().len());
  for (ticker, w) in weights.iter() {
    if !w.is_finite() || w < -1e-9 {
      return Err(PortfolioError::invalid(
        stage,
        "weights",
        format!("{ticker} has a negative or non-finite weight {w}"),
      ));
    }
    let price = *latest_prices.get(ticker).ok_or_else(|| {
      PortfolioError::invalid(stage, "latest_prices", format!("no price for {ticker}"))
    })?;
    if !price.is_finite() || price <= 0.0 {
      return Err(PortfolioError::invalid(
        stage,
        "latest_prices",
        format!("{ticker} has a non-positive price {price}"),
      ));
    }
    assets.push((ticker.to_string(), w.max(0.0), price));
  }

  let total: f64 = assets.iter().map(|a| a.1).sum();
  if total > 1.0 {
    for a in &mut assets {
      a.1 /= total;
    }
  }

  let cheapest = assets
    .iter()
    .min_by_key(|(t, _, p)| (OrderedFloat(*p), t.clone()))
    .map(|(t, _, p)| (t.clone(), *p))
    .ok_or_else(|| PortfolioError::invalid(stage, "weights", "no tickers to allocate"))?;

  if budget < cheapest.1 {
    warn!(budget, cheapest_price = cheapest.1, ticker = %cheapest.0, "budget too small to buy any share");
    return Ok(DiscreteAllocation {
      shares: assets.iter().map(|(t, _, _)| (t.clone(), 0)).collect(),
      leftover: budget,
      outcome: AllocationOutcome::BudgetTooSmall,
      budget,
      cheapest,
    });
  }

  let mut shares: Vec<u64> = assets
    .iter()
    .map(|(_, w, p)| (budget * w / p).floor() as u64)
    .collect();
  let spent = |shares: &[u64]| -> f64 {
    shares
      .iter()
      .zip(&assets)
      .map(|(s, (_, _, p))| *s as f64 * p)
      .sum()
  };
  // recomputed from the share counts each round so rounding drift cannot
  // price out a share that exactly fits
  let tol = 1e-9 * budget.max(1.0);
  loop {
    let leftover = budget - spent(&shares);
    if leftover + tol < cheapest.1 {
      break;
    }
    let pick = assets
      .iter()
      .enumerate()
      .filter(|(_, (_, _, p))| *p <= leftover + tol)
      .min_by_key(|(i, (t, w, p))| {
        let overshoot = (shares[*i] + 1) as f64 * p / budget - w;
        (OrderedFloat(overshoot), t.clone())
      })
      .map(|(i, _)| i);
    let Some(i) = pick else {
      break;
    };
    shares[i] += 1;
  }
  let leftover = (budget - spent(&shares)).max(0.0);

  info!(budget, leftover, "discrete allocation complete");
  Ok(DiscreteAllocation {
    shares: assets
      .iter()
      .zip(&shares)
      .map(|((t, _, _), s)| (t.clone(), *s))
      .collect(),
    leftover,
    outcome: AllocationOutcome::Filled,
    budget,
    cheapest,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn weights(pairs: &[(&str, f64)]) -> WeightAllocation {
    WeightAllocation::new(
      pairs.iter().map(|(t, _)| t.to_string()).collect(),
      pairs.iter().map(|(_, w)| *w).collect(),
    )
    .unwrap()
  }

  fn prices(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(t, p)| (t.to_string(), *p)).collect()
  }

  #[test]
  fn tops_up_until_nothing_is_affordable() {
    let alloc = allocate(
      &weights(&[("A", 0.5), ("B", 0.5)]),
      &prices(&[("A", 300.0), ("B", 150.0)]),
      1000.0,
    )
    .unwrap();
    assert_eq!(alloc.shares["A"], 1);
    assert_eq!(alloc.shares["B"], 4);
    assert!((alloc.leftover - 100.0).abs() < 1e-9);
    assert_eq!(alloc.outcome, AllocationOutcome::Filled);
  }

  #[test]
  fn budget_below_cheapest_price_buys_nothing() {
    let alloc = allocate(&weights(&[("A", 1.0)]), &prices(&[("A", 50.0)]), 10.0).unwrap();
    assert_eq!(alloc.shares["A"], 0);
    assert_eq!(alloc.leftover, 10.0);
    assert_eq!(alloc.outcome, AllocationOutcome::BudgetTooSmall);

    let err = alloc.ensure_filled().unwrap_err();
    assert!(matches!(err, PortfolioError::BudgetTooSmall { cheapest_price, .. } if cheapest_price == 50.0));
  }

  #[test]
  fn spend_is_within_budget_and_leftover_below_cheapest() {
    let w = weights(&[("A", 0.2), ("B", 0.35), ("C", 0.45)]);
    let p = prices(&[("A", 17.3), ("B", 112.9), ("C", 48.05)]);
    let alloc = allocate(&w, &p, 2_500.0).unwrap();
    let spent: f64 = alloc.shares.iter().map(|(t, s)| *s as f64 * p[t]).sum();
    assert!(spent <= 2_500.0);
    assert!((spent + alloc.leftover - 2_500.0).abs() < 1e-9);
    assert!(alloc.leftover < 17.3);
  }

  #[test]
  fn share_that_exactly_fits_is_bought() {
    // 21.06 - 2 * 10.0 evaluates a hair under 1.06
    let alloc = allocate(
      &weights(&[("A", 1.0), ("B", 0.0)]),
      &prices(&[("A", 10.0), ("B", 1.06)]),
      21.06,
    )
    .unwrap();
    assert_eq!(alloc.shares["A"], 2);
    assert_eq!(alloc.shares["B"], 1);
    assert!(alloc.leftover < 1e-9);
  }

  #[test]
  fn seeded_sweep_leaves_less_than_the_cheapest_price() {
    let mut state = 0x2545_f491_4f6c_dd1d_u64;
    let mut next = move |modulus: u64| {
      state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1_442_695_040_888_963_407);
      (state >> 33) % modulus
    };
    let tickers = ["A", "B", "C", "D"];
    for _ in 0..500 {
      let raw: Vec<f64> = tickers.iter().map(|_| next(1_000) as f64).collect();
      let total: f64 = raw.iter().sum::<f64>().max(1.0);
      let w: Vec<(&str, f64)> = tickers.iter().zip(&raw).map(|(t, r)| (*t, r / total)).collect();
      let p: Vec<(&str, f64)> = tickers
        .iter()
        .map(|t| (*t, (100 + next(20_000)) as f64 / 100.0))
        .collect();
      let budget = (1_000 + next(500_000)) as f64 / 100.0;
      let prices = prices(&p);
      let alloc = allocate(&weights(&w), &prices, budget).unwrap();

      let cheapest = p.iter().map(|(_, x)| *x).fold(f64::INFINITY, f64::min);
      let spent: f64 = alloc.shares.iter().map(|(t, s)| *s as f64 * prices[t]).sum();
      assert!(spent <= budget + 1e-9 * budget, "spent {spent} of {budget}");
      match alloc.outcome {
        AllocationOutcome::Filled => assert!(
          alloc.leftover < cheapest,
          "leftover {} with cheapest {cheapest}",
          alloc.leftover
        ),
        AllocationOutcome::BudgetTooSmall => assert!(budget < cheapest),
      }
    }
  }

  #[test]
  fn ties_go_to_the_smallest_ticker() {
    let alloc = allocate(
      &weights(&[("B", 0.5), ("A", 0.5)]),
      &prices(&[("A", 30.0), ("B", 30.0)]),
      100.0,
    )
    .unwrap();
    assert_eq!(alloc.shares["A"], 2);
    assert_eq!(alloc.shares["B"], 1);
    assert!((alloc.leftover - 10.0).abs() < 1e-9);
  }

  #[test]
  fn zero_weights_stay_in_the_universe() {
    let alloc = allocate(
      &weights(&[("A", 1.0), ("B", 0.0)]),
      &prices(&[("A", 40.0), ("B", 15.0)]),
      100.0,
    )
    .unwrap();
    assert_eq!(alloc.shares["A"], 2);
    assert_eq!(alloc.shares["B"], 1);
    assert!((alloc.leftover - 5.0).abs() < 1e-9);
  }

  #[test]
  fn invalid_inputs_are_rejected() {
    let w = weights(&[("A", 1.0)]);
    let err = allocate(&w, &prices(&[("Z", 1.0)]), 100.0).unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidParameter { name: "latest_prices", .. }));

    let err = allocate(&w, &prices(&[("A", 1.0)]), 0.0).unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidParameter { name: "budget", .. }));

    let err = allocate(&w, &prices(&[("A", -1.0)]), 10.0).unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidParameter { name: "latest_prices", .. }));

    let err = allocate(&weights(&[("A", -0.5)]), &prices(&[("A", 1.0)]), 10.0).unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidParameter { name: "weights", .. }));
  }
}
