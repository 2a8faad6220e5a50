//! Wide-format CSV price files: a date column followed by one adjusted-close
//! column per ticker.

use std::path::Path;
use std::path::PathBuf;

use chrono::NaiveDate;
use csv::ReaderBuilder;
use ndarray::Array2;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::PriceHistory;
use super::PriceProvider;
use crate::error::PortfolioError;
use crate::error::Result;

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// [`PriceProvider`] backed by a wide CSV file.
#[derive(Clone, Debug)]
pub struct CsvPriceProvider {
  path: PathBuf,
  date_format: String,
}

impl CsvPriceProvider {
  pub fn new(path: impl AsRef<Path>) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      date_format: DEFAULT_DATE_FORMAT.to_string(),
    }
  }

  /// Override the `chrono` format used for the date column.
  pub fn with_date_format(mut self, date_format: impl Into<String>) -> Self {
    self.date_format = date_format.into();
    self
  }
}

impl PriceProvider for CsvPriceProvider {
  fn fetch(&self, tickers: &[String], start: NaiveDate, end: NaiveDate) -> Result<PriceHistory> {
    info!("Loading prices from: {}", self.path.display());

    let mut reader = ReaderBuilder::new()
      .has_headers(true)
      .trim(csv::Trim::All)
      .from_path(&self.path)?;

    let headers = reader.headers()?.clone();
    let mut columns = Vec::with_capacity(tickers.len());
    for ticker in tickers {
      let col = headers
        .iter()
        .skip(1)
        .position(|h| h.eq_ignore_ascii_case(ticker))
        .ok_or_else(|| PortfolioError::DataUnavailable {
          ticker: ticker.clone(),
          reason: format!("no column in {}", self.path.display()),
        })?;
      columns.push(col + 1);
    }

    let mut dates = Vec::new();
    let mut flat = Vec::new();
    let mut skipped = 0usize;

    'rows: for record in reader.records() {
      let record = record?;
      let Some(raw_date) = record.get(0) else {
        continue;
      };
      let date = NaiveDate::parse_from_str(raw_date, &self.date_format)?;
      if date < start || date > end {
        continue;
      }

      let mut row = Vec::with_capacity(columns.len());
      for &c in &columns {
        match record.get(c).map(str::parse::<f64>) {
          Some(Ok(p)) if p.is_finite() && p > 0.0 => row.push(p),
          _ => {
            skipped += 1;
            continue 'rows;
          }
        }
      }
      dates.push(date);
      flat.extend(row);
    }

    if skipped > 0 {
      warn!(skipped, "dropped rows with missing or invalid prices");
    }
    if dates.is_empty() {
      return Err(PortfolioError::DataUnavailable {
        ticker: tickers.join(","),
        reason: format!("no prices between {start} and {end}"),
      });
    }
    debug!(rows = dates.len(), columns = columns.len(), "parsed price file");

    let prices = Array2::from_shape_vec((dates.len(), columns.len()), flat).map_err(|e| {
      PortfolioError::invalid(crate::error::Stage::PriceHistory, "prices", e.to_string())
    })?;
    PriceHistory::new(tickers.to_vec(), dates, prices)
  }
}
