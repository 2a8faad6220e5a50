//! # Conic Programs
//!
//! $$
//! \min_x\ \tfrac12 x^\top P x + q^\top x
//! \quad\text{s.t.}\quad Ax + s = b,\ s \in \mathcal K
//! $$
//!
//! Dense problem assembly on top of the Clarabel interior-point solver. Rows
//! are appended block by block, each block tagged with its cone.

use clarabel::algebra::CscMatrix;
use clarabel::solver::DefaultSettingsBuilder;
use clarabel::solver::DefaultSolver;
use clarabel::solver::IPSolver;
use clarabel::solver::SolverStatus;
use clarabel::solver::SupportedConeT;
use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::error::Stage;

/// Interior-point tuning knobs.
#[derive(Clone, Debug)]
pub struct SolverSettings {
  pub max_iter: usize,
  pub tol_gap_abs: f64,
  pub tol_gap_rel: f64,
  pub tol_feas: f64,
}

impl Default for SolverSettings {
  fn default() -> Self {
    Self {
      max_iter: 200,
      tol_gap_abs: 1e-9,
      tol_gap_rel: 1e-9,
      tol_feas: 1e-9,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConicStatus {
  Solved,
  Infeasible,
  MaxIterations,
  NumericalError,
}

#[derive(Clone, Debug)]
pub struct ConicSolution {
  pub x: DVector<f64>,
  pub status: ConicStatus,
  pub iterations: usize,
  pub primal_residual: f64,
  pub dual_residual: f64,
}

/// Quadratic objective plus a stack of cone-constrained row blocks.
#[derive(Clone, Debug)]
pub struct ConicProgram {
  p: DMatrix<f64>,
  q: DVector<f64>,
  a: DMatrix<f64>,
  b: DVector<f64>,
  cones: Vec<SupportedConeT<f64>>,
}

impl ConicProgram {
  pub fn new(p: DMatrix<f64>, q: DVector<f64>) -> Self {
    let n = q.len();
    Self {
      p,
      q,
      a: DMatrix::zeros(0, n),
      b: DVector::zeros(0),
      cones: Vec::new(),
    }
  }

  fn push(mut self, a: &DMatrix<f64>, b: &DVector<f64>, cone: SupportedConeT<f64>) -> Self {
    let (m, n) = self.a.shape();
    let rows = a.nrows();
    let mut stacked = self.a.resize_vertically(m + rows, 0.0);
    stacked.view_mut((m, 0), (rows, n)).copy_from(a);
    let mut rhs = self.b.resize_vertically(m + rows, 0.0);
    rhs.rows_mut(m, rows).copy_from(b);
    self.a = stacked;
    self.b = rhs;
    self.cones.push(cone);
    self
  }

  /// Rows `a x = b`.
  pub fn equal(self, a: &DMatrix<f64>, b: &DVector<f64>) -> Self {
    let rows = a.nrows();
    self.push(a, b, SupportedConeT::ZeroConeT(rows))
  }

  /// Rows `a x <= b`.
  pub fn at_most(self, a: &DMatrix<f64>, b: &DVector<f64>) -> Self {
    let rows = a.nrows();
    self.push(a, b, SupportedConeT::NonnegativeConeT(rows))
  }

  /// `|F x| <= t`.
  pub fn norm_at_most(self, f: &DMatrix<f64>, t: f64) -> Self {
    let (k, n) = f.shape();
    let mut a = DMatrix::<f64>::zeros(k + 1, n);
    a.view_mut((1, 0), (k, n)).copy_from(&(-f));
    let mut b = DVector::<f64>::zeros(k + 1);
    b[0] = t;
    self.push(&a, &b, SupportedConeT::SecondOrderConeT(k + 1))
  }
}

/// Dense to CSC, keeping only the upper triangle when `upper` is set.
fn to_csc(m: &DMatrix<f64>, upper: bool) -> CscMatrix<f64> {
  let mut colptr = Vec::with_capacity(m.ncols() + 1);
  let mut rowval = Vec::new();
  let mut nzval = Vec::new();
  colptr.push(0);
  for j in 0..m.ncols() {
    let rows = if upper { (j + 1).min(m.nrows()) } else { m.nrows() };
    for i in 0..rows {
      let v = m[(i, j)];
      if v != 0.0 {
        rowval.push(i);
        nzval.push(v);
      }
    }
    colptr.push(nzval.len());
  }
  CscMatrix::new(m.nrows(), m.ncols(), colptr, rowval, nzval)
}

pub fn solve(program: &ConicProgram, settings: &SolverSettings) -> Result<ConicSolution> {
  let stage = Stage::Optimizer;
  let clarabel_settings = DefaultSettingsBuilder::default()
    .max_iter(settings.max_iter.min(u32::MAX as usize) as u32)
    .tol_gap_abs(settings.tol_gap_abs)
    .tol_gap_rel(settings.tol_gap_rel)
    .tol_feas(settings.tol_feas)
    .verbose(false)
    .build()
    .map_err(|e| PortfolioError::invalid(stage, "solver", format!("bad solver settings: {e}")))?;

  let p = to_csc(&program.p, true);
  let a = to_csc(&program.a, false);
  let q: Vec<f64> = program.q.iter().copied().collect();
  let b: Vec<f64> = program.b.iter().copied().collect();

  let mut solver = DefaultSolver::new(&p, &q, &a, &b, &program.cones, clarabel_settings)
    .map_err(|e| PortfolioError::invalid(stage, "solver", format!("rejected problem data: {e:?}")))?;
  solver.solve();

  let solution = &solver.solution;
  let status = match solution.status {
    SolverStatus::Solved | SolverStatus::AlmostSolved => ConicStatus::Solved,
    SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => ConicStatus::Infeasible,
    SolverStatus::MaxIterations | SolverStatus::MaxTime => ConicStatus::MaxIterations,
    _ => ConicStatus::NumericalError,
  };
  debug!(
    status = ?solution.status,
    iterations = solution.iterations,
    objective = solution.obj_val,
    "conic solve finished"
  );

  Ok(ConicSolution {
    x: DVector::from_column_slice(&solution.x),
    status,
    iterations: solution.iterations as usize,
    primal_residual: solution.r_prim,
    dual_residual: solution.r_dual,
  })
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;

  fn simplex(p: DMatrix<f64>, q: DVector<f64>) -> ConicProgram {
    let n = q.len();
    ConicProgram::new(p, q)
      .equal(&DMatrix::from_element(1, n, 1.0), &DVector::from_element(1, 1.0))
      .at_most(&-DMatrix::<f64>::identity(n, n), &DVector::zeros(n))
  }

  #[test]
  fn slack_box_leaves_the_quadratic_minimum() {
    // min x^2 + y^2 - 2x - 4y
    let program = ConicProgram::new(
      DMatrix::from_diagonal(&DVector::from_vec(vec![2.0, 2.0])),
      DVector::from_vec(vec![-2.0, -4.0]),
    )
    .at_most(&DMatrix::identity(2, 2), &DVector::from_element(2, 10.0));
    let sol = solve(&program, &SolverSettings::default()).unwrap();
    assert_eq!(sol.status, ConicStatus::Solved);
    assert_abs_diff_eq!(sol.x[0], 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(sol.x[1], 2.0, epsilon = 1e-6);
  }

  #[test]
  fn budget_and_sign_rows() {
    let program = simplex(
      DMatrix::from_diagonal(&DVector::from_vec(vec![0.08, 0.18])),
      DVector::zeros(2),
    );
    let sol = solve(&program, &SolverSettings::default()).unwrap();
    assert_eq!(sol.status, ConicStatus::Solved);
    assert_abs_diff_eq!(sol.x[0], 0.09 / 0.13, epsilon = 1e-6);
    assert_abs_diff_eq!(sol.x.sum(), 1.0, epsilon = 1e-8);
  }

  #[test]
  fn norm_row_caps_the_point() {
    // max x + y on the unit simplex with |(x, y)| <= 0.8
    let program = simplex(DMatrix::zeros(2, 2), DVector::from_vec(vec![-1.0, -2.0]))
      .norm_at_most(&DMatrix::identity(2, 2), 0.8);
    let sol = solve(&program, &SolverSettings::default()).unwrap();
    assert_eq!(sol.status, ConicStatus::Solved);
    assert!(sol.x.norm() <= 0.8 + 1e-7);
    assert!(sol.x[1] > sol.x[0]);
  }

  #[test]
  fn contradictory_rows_are_infeasible() {
    let program = simplex(DMatrix::identity(2, 2), DVector::zeros(2))
      .at_most(&DMatrix::from_element(1, 2, 1.0), &DVector::from_element(1, 0.5));
    let sol = solve(&program, &SolverSettings::default()).unwrap();
    assert_eq!(sol.status, ConicStatus::Infeasible);
  }

  #[test]
  fn iteration_budget_is_enforced() {
    let program = simplex(DMatrix::identity(3, 3), DVector::from_vec(vec![-1.0, 0.5, 0.2]));
    let settings = SolverSettings {
      max_iter: 1,
      ..Default::default()
    };
    let sol = solve(&program, &settings).unwrap();
    assert_eq!(sol.status, ConicStatus::MaxIterations);
    assert!(sol.iterations <= 1);
  }
}
