use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use portfolio_frontier::config::PortfolioConfig;
use portfolio_frontier::pipeline;
use portfolio_frontier::pipeline::PortfolioReport;
use portfolio_frontier::prices::CsvPriceProvider;
use prettytable::row;
use prettytable::Table;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Build a mean-variance portfolio from a price file and a run configuration.
#[derive(Parser)]
#[command(name = "portfolio-frontier")]
#[command(about = "Estimate returns and risk, optimize weights and allocate whole shares")]
struct Cli {
  /// Run configuration (TOML)
  #[arg(short, long, default_value = "portfolio.toml")]
  config: PathBuf,

  /// Wide CSV of adjusted closes: a date column then one column per ticker
  #[arg(short, long)]
  prices: Option<PathBuf>,

  /// chrono format of the date column
  #[arg(long, default_value = "%Y-%m-%d")]
  date_format: String,

  /// Print an example configuration and exit
  #[arg(long)]
  print_example: bool,
}

fn main() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(tracing_subscriber::fmt::layer())
    .with(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let cli = Cli::parse();
  if cli.print_example {
    print!("{}", PortfolioConfig::example());
    return Ok(());
  }

  let prices = cli
    .prices
    .context("--prices is required unless --print-example is given")?;
  let config = PortfolioConfig::load(&cli.config)
    .with_context(|| format!("failed to load {}", cli.config.display()))?;
  let provider = CsvPriceProvider::new(&prices).with_date_format(cli.date_format);

  let report = pipeline::run(&config, &provider).context("portfolio run failed")?;
  print_report(&report);
  Ok(())
}

fn print_report(report: &PortfolioReport) {
  let mut weights = Table::new();
  weights.add_row(row!["Ticker", "Expected return", "Weight", "Shares"]);
  for (i, (ticker, w)) in report.weights.iter().enumerate() {
    weights.add_row(row![
      ticker,
      format!("{:.4}", report.expected_returns.values()[i]),
      format!("{:.4}", w),
      report.allocation.shares.get(ticker).copied().unwrap_or(0),
    ]);
  }
  weights.printstd();

  let p = &report.performance;
  let mut summary = Table::new();
  summary.add_row(row!["Expected annual return", format!("{:.2}%", p.expected_annual_return * 100.0)]);
  summary.add_row(row!["Annual volatility", format!("{:.2}%", p.expected_annual_volatility * 100.0)]);
  summary.add_row(row!["Sharpe ratio", format!("{:.3}", p.sharpe_ratio)]);
  summary.add_row(row!["Invested", format!("{:.2}", report.allocation.invested())]);
  summary.add_row(row!["Leftover", format!("{:.2}", report.allocation.leftover)]);
  summary.add_row(row!["Allocation", format!("{:?}", report.allocation.outcome)]);
  summary.printstd();
}
