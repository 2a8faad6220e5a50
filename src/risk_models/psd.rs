//! # Positive-Semidefinite Repair
//!
//! $$
//! \Sigma = Q\Lambda Q^\top \;\longrightarrow\; Q\max(\Lambda, 0)Q^\top
//! $$

use nalgebra::DMatrix;
use nalgebra::SymmetricEigen;
use tracing::warn;

use super::symmetrize;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::error::Stage;

/// Eigenvalues below `-PSD_TOLERANCE` mark a matrix as not PSD.
pub const PSD_TOLERANCE: f64 = 1e-12;

/// Largest negative eigenvalue tolerated after repair.
const REPAIR_TOLERANCE: f64 = 1e-8;

/// Repair strategy for covariance estimates with negative eigenvalues.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixMethod {
  /// Clip negative eigenvalues to zero and reconstruct.
  #[default]
  Spectral,
  /// Add a multiple of the identity large enough to lift the smallest eigenvalue.
  Diag,
}

impl FixMethod {
  pub fn from_str(s: &str) -> Option<Self> {
    match s.to_lowercase().as_str() {
      "spectral" => Some(Self::Spectral),
      "diag" => Some(Self::Diag),
      _ => None,
    }
  }
}

pub fn min_eigenvalue(m: &DMatrix<f64>) -> f64 {
  SymmetricEigen::new(symmetrize(m)).eigenvalues.min()
}

pub fn is_positive_semidefinite(m: &DMatrix<f64>) -> bool {
  min_eigenvalue(m) >= -PSD_TOLERANCE
}

/// Return a symmetric PSD version of `m`, leaving PSD input unchanged apart
/// from symmetrization.
pub fn fix_nonpositive_semidefinite(m: DMatrix<f64>, method: FixMethod) -> Result<DMatrix<f64>> {
  if m.iter().any(|v| !v.is_finite()) {
    return Err(PortfolioError::SingularMatrix {
      stage: Stage::RiskModel,
      min_eigenvalue: f64::NAN,
    });
  }

  let m = symmetrize(&m);
  let eig = SymmetricEigen::new(m.clone());
  let lowest = eig.eigenvalues.min();
  if lowest >= -PSD_TOLERANCE {
    return Ok(m);
  }

  warn!(
    min_eigenvalue = lowest,
    ?method,
    "covariance matrix is not positive semidefinite, repairing"
  );

  let fixed = match method {
    FixMethod::Spectral => {
      let clipped = eig.eigenvalues.map(|v| v.max(0.0));
      let q = &eig.eigenvectors;
      symmetrize(&(q * DMatrix::from_diagonal(&clipped) * q.transpose()))
    }
    FixMethod::Diag => {
      let n = m.nrows();
      &m + DMatrix::<f64>::identity(n, n) * (1.1 * lowest.abs())
    }
  };

  let after = min_eigenvalue(&fixed);
  if !after.is_finite() || after < -REPAIR_TOLERANCE {
    return Err(PortfolioError::SingularMatrix {
      stage: Stage::RiskModel,
      min_eigenvalue: after,
    });
  }
  Ok(fixed)
}
