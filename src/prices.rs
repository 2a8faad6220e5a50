//! # Price History
//!
//! $$
//! r_t = \frac{P_t}{P_{t-1}} - 1 \quad\text{or}\quad r_t = \ln\frac{P_t}{P_{t-1}}
//! $$
//!
//! Aligned adjusted-close panel (rows are dates, columns are tickers) and the
//! provider seam that produces it.

pub mod csv_file;

use std::collections::BTreeMap;

use chrono::NaiveDate;
use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::Axis;
use tracing::debug;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::error::Stage;

pub use csv_file::CsvPriceProvider;

/// Daily return convention.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReturnKind {
  #[default]
  Simple,
  Log,
}

/// Immutable table of adjusted prices aligned on a common ascending date index.
#[derive(Clone, Debug)]
pub struct PriceHistory {
  tickers: Vec<String>,
  dates: Vec<NaiveDate>,
  prices: Array2<f64>,
}

impl PriceHistory {
  /// Build a panel from dates and a `dates x tickers` price matrix.
  pub fn new(tickers: Vec<String>, dates: Vec<NaiveDate>, prices: Array2<f64>) -> Result<Self> {
    let stage = Stage::PriceHistory;
    if tickers.is_empty() {
      return Err(PortfolioError::invalid(stage, "tickers", "at least one ticker is required"));
    }
    if prices.dim() != (dates.len(), tickers.len()) {
      return Err(PortfolioError::invalid(
        stage,
        "prices",
        format!(
          "shape {:?} does not match {} dates x {} tickers",
          prices.dim(),
          dates.len(),
          tickers.len()
        ),
      ));
    }
    for (i, ticker) in tickers.iter().enumerate() {
      if tickers[..i].contains(ticker) {
        return Err(PortfolioError::invalid(stage, "tickers", format!("duplicate ticker {ticker}")));
      }
    }
    if dates.len() < 2 {
      return Err(PortfolioError::InsufficientData {
        stage,
        ticker: tickers[0].clone(),
        observations: dates.len(),
        required: 2,
      });
    }
    if let Some(w) = dates.windows(2).find(|w| w[1] <= w[0]) {
      return Err(PortfolioError::invalid(
        stage,
        "dates",
        format!("dates must be strictly increasing ({} then {})", w[0], w[1]),
      ));
    }
    for (j, col) in prices.axis_iter(Axis(1)).enumerate() {
      if let Some(p) = col.iter().find(|p| !p.is_finite() || **p <= 0.0) {
        return Err(PortfolioError::invalid(
          stage,
          "prices",
          format!("{} has a non-positive or non-finite price {p}", tickers[j]),
        ));
      }
    }

    Ok(Self {
      tickers,
      dates,
      prices,
    })
  }

  /// Build a panel from per-ticker `(date, price)` series sharing the same dates.
  pub fn from_series(series: Vec<(String, Vec<(NaiveDate, f64)>)>) -> Result<Self> {
    let Some((_, first)) = series.first() else {
      return Err(PortfolioError::invalid(
        Stage::PriceHistory,
        "series",
        "at least one series is required",
      ));
    };
    let dates: Vec<NaiveDate> = first.iter().map(|(d, _)| *d).collect();

    let mut prices = Array2::<f64>::zeros((dates.len(), series.len()));
    let mut tickers = Vec::with_capacity(series.len());
    for (j, (ticker, points)) in series.into_iter().enumerate() {
      if points.len() != dates.len() || points.iter().zip(&dates).any(|((d, _), e)| d != e) {
        return Err(PortfolioError::invalid(
          Stage::PriceHistory,
          "series",
          format!("{ticker} is not aligned with the common date index"),
        ));
      }
      for (i, (_, p)) in points.iter().enumerate() {
        prices[[i, j]] = *p;
      }
      tickers.push(ticker);
    }

    Self::new(tickers, dates, prices)
  }

  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  /// Raw `dates x tickers` price matrix.
  pub fn prices(&self) -> &Array2<f64> {
    &self.prices
  }

  pub fn n_assets(&self) -> usize {
    self.tickers.len()
  }

  pub fn n_observations(&self) -> usize {
    self.dates.len()
  }

  /// Price series of a single ticker.
  pub fn column(&self, ticker: &str) -> Option<ArrayView1<'_, f64>> {
    let j = self.tickers.iter().position(|t| t == ticker)?;
    Some(self.prices.column(j))
  }

  /// Daily returns, `(dates - 1) x tickers`.
  pub fn returns(&self, kind: ReturnKind) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((self.dates.len() - 1, self.tickers.len()));
    for (j, col) in self.prices.axis_iter(Axis(1)).enumerate() {
      let closes = col.to_vec();
      let series = match kind {
        ReturnKind::Simple => simple_returns_series(&closes),
        ReturnKind::Log => log_returns_series(&closes),
      };
      for (i, r) in series.into_iter().enumerate() {
        out[[i, j]] = r;
      }
    }
    out
  }

  /// Last observed price of every ticker.
  pub fn latest_prices(&self) -> BTreeMap<String, f64> {
    let last = self.prices.row(self.dates.len() - 1);
    self
      .tickers
      .iter()
      .cloned()
      .zip(last.iter().copied())
      .collect()
  }

  /// Restrict the panel to `tickers`, in the given order.
  pub fn select(&self, tickers: &[String]) -> Result<Self> {
    let mut idx = Vec::with_capacity(tickers.len());
    for ticker in tickers {
      let j = self
        .tickers
        .iter()
        .position(|t| t == ticker)
        .ok_or_else(|| PortfolioError::DataUnavailable {
          ticker: ticker.clone(),
          reason: "ticker not present in price history".to_string(),
        })?;
      idx.push(j);
    }
    let prices = self.prices.select(Axis(1), &idx);
    Self::new(tickers.to_vec(), self.dates.clone(), prices)
  }

  /// Restrict the panel to the inclusive date window `[start, end]`.
  pub fn between(&self, start: NaiveDate, end: NaiveDate) -> Result<Self> {
    let rows: Vec<usize> = self
      .dates
      .iter()
      .enumerate()
      .filter(|(_, d)| **d >= start && **d <= end)
      .map(|(i, _)| i)
      .collect();
    debug!(rows = rows.len(), %start, %end, "windowed price history");
    if rows.is_empty() {
      return Err(PortfolioError::DataUnavailable {
        ticker: self.tickers.join(","),
        reason: format!("no prices between {start} and {end}"),
      });
    }
    let dates = rows.iter().map(|&i| self.dates[i]).collect();
    let prices = self.prices.select(Axis(0), &rows);
    Self::new(self.tickers.clone(), dates, prices)
  }
}

/// Convert close prices to simple-return series.
pub fn simple_returns_series(closes: &[f64]) -> Vec<f64> {
  closes.windows(2).map(|w| w[1] / w[0] - 1.0).collect()
}

/// Convert close prices to log-return series.
pub fn log_returns_series(closes: &[f64]) -> Vec<f64> {
  closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect()
}

/// Every column of `returns` must hold at least `required` observations.
pub(crate) fn ensure_observations(
  returns: &Array2<f64>,
  tickers: &[String],
  required: usize,
  stage: Stage,
) -> Result<()> {
  if returns.nrows() < required {
    return Err(PortfolioError::InsufficientData {
      stage,
      ticker: tickers.first().cloned().unwrap_or_default(),
      observations: returns.nrows(),
      required,
    });
  }
  Ok(())
}

/// Source of aligned price histories.
pub trait PriceProvider {
  /// Fetch adjusted closes for `tickers` over the inclusive window `[start, end]`.
  fn fetch(&self, tickers: &[String], start: NaiveDate, end: NaiveDate) -> Result<PriceHistory>;
}

/// Provider serving a pre-loaded [`PriceHistory`].
#[derive(Clone, Debug)]
pub struct InMemoryProvider {
  history: PriceHistory,
}

impl InMemoryProvider {
  pub fn new(history: PriceHistory) -> Self {
    Self { history }
  }
}

impl PriceProvider for InMemoryProvider {
  fn fetch(&self, tickers: &[String], start: NaiveDate, end: NaiveDate) -> Result<PriceHistory> {
    self.history.select(tickers)?.between(start, end)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::array;

  fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
  }

  fn sample() -> PriceHistory {
    PriceHistory::new(
      vec!["AAA".to_string(), "BBB".to_string()],
      vec![date(2), date(3), date(4)],
      array![[100.0, 50.0], [110.0, 50.0], [99.0, 55.0]],
    )
    .unwrap()
  }

  #[test]
  fn returns_follow_the_requested_convention() {
    let h = sample();
    let simple = h.returns(ReturnKind::Simple);
    assert_eq!(simple.dim(), (2, 2));
    assert!((simple[[0, 0]] - 0.1).abs() < 1e-12);
    assert!((simple[[1, 0]] + 0.1).abs() < 1e-12);
    assert!((simple[[1, 1]] - 0.1).abs() < 1e-12);

    let log = h.returns(ReturnKind::Log);
    assert!((log[[0, 0]] - 1.1f64.ln()).abs() < 1e-12);
  }

  #[test]
  fn rejects_unordered_dates_and_bad_prices() {
    let err = PriceHistory::new(
      vec!["AAA".to_string()],
      vec![date(3), date(2)],
      array![[1.0], [2.0]],
    )
    .unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidParameter { name: "dates", .. }));

    let err = PriceHistory::new(
      vec!["AAA".to_string()],
      vec![date(2), date(3)],
      array![[1.0], [0.0]],
    )
    .unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidParameter { name: "prices", .. }));
  }

  #[test]
  fn single_observation_is_insufficient() {
    let err = PriceHistory::new(vec!["AAA".to_string()], vec![date(2)], array![[1.0]]).unwrap_err();
    assert!(matches!(err, PortfolioError::InsufficientData { observations: 1, .. }));
  }

  #[test]
  fn from_series_requires_alignment() {
    let err = PriceHistory::from_series(vec![
      ("AAA".to_string(), vec![(date(2), 1.0), (date(3), 2.0)]),
      ("BBB".to_string(), vec![(date(2), 1.0), (date(4), 2.0)]),
    ])
    .unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidParameter { name: "series", .. }));
  }

  #[test]
  fn provider_reports_unknown_tickers() {
    let provider = InMemoryProvider::new(sample());
    let err = provider
      .fetch(&["ZZZ".to_string()], date(1), date(31))
      .unwrap_err();
    assert!(matches!(err, PortfolioError::DataUnavailable { ref ticker, .. } if ticker == "ZZZ"));

    let h = provider
      .fetch(&["BBB".to_string()], date(3), date(31))
      .unwrap();
    assert_eq!(h.tickers(), &["BBB".to_string()]);
    assert_eq!(h.n_observations(), 2);
    assert_eq!(h.latest_prices()["BBB"], 55.0);
  }
}
