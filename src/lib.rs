//! # portfolio-frontier
//!
//! $$
//! \max_{\mathbf w}\ \frac{\mathbf w^\top\mu - r_f}{\sqrt{\mathbf w^\top\Sigma\mathbf w}}
//! \quad\text{s.t.}\quad \mathbf 1^\top\mathbf w = 1,\ \ell \le \mathbf w \le u
//! $$
//!
//! Mean-variance portfolio construction:
//!
//! - [`prices`]: aligned price histories and providers
//! - [`expected_returns`]: mean, exponentially weighted and CAPM return estimates
//! - [`risk_models`]: sample, exponentially weighted and shrunk covariance with PSD repair
//! - [`efficient_frontier`]: constrained mean-variance optimization with L2 regularization
//! - [`discrete_allocation`]: conversion of weights into whole shares
//! - [`pipeline`]: the end-to-end run driven by a [`config::PortfolioConfig`]

pub mod config;
pub mod discrete_allocation;
pub mod efficient_frontier;
pub mod error;
pub mod expected_returns;
pub mod pipeline;
pub mod prices;
pub mod risk_models;

pub use error::PortfolioError;
pub use error::Result;
pub use error::Stage;
