use crate::qp::{QpSolution, QpSubproblem};
use anyhow::Result;

/// Variable and constraint bounds reported by a [`Problem`].
///
/// Empty vectors mean unbounded.
#[derive(Debug, Clone, Default)]
pub struct Bounds {
    pub var_lower: Vec<f64>,
    pub var_upper: Vec<f64>,
    pub con_lower: Vec<f64>,
    pub con_upper: Vec<f64>,
}

/// An optimization problem:
///
/// ```txt
///       min f(x)
///        x
/// ```
///
/// subject to
///
/// ```txt
///       con_lower <= c(x) <= con_upper
///       var_lower <= x <= var_upper
/// ```
///
/// The evaluation methods receive `is_new_x = false` when the point is the
/// same as in the previous call, so implementations may return cached values.
/// Any error returned is propagated to the caller of the optimizer.
pub trait Problem {
    /// Returns the number of variables and the number of constraints.
    fn nlp_info(&self) -> Result<(usize, usize)>;

    fn starting_point(&self) -> Result<Vec<f64>>;

    fn bounds_info(&self, num_vars: usize, num_cons: usize) -> Result<Bounds>;

    fn cost(&mut self, x: &[f64], is_new_x: bool) -> Result<f64>;

    fn cost_gradient(&mut self, x: &[f64], is_new_x: bool) -> Result<Vec<f64>>;

    fn constraints(&mut self, x: &[f64], is_new_x: bool) -> Result<Vec<f64>>;

    /// Dense constraint Jacobian, one row per constraint.
    fn constraint_jacobian(&mut self, x: &[f64], is_new_x: bool) -> Result<Vec<Vec<f64>>>;

    /// Returns the (rows, columns) of the constraint Jacobian.
    fn constraint_jacobian_dims(&mut self, x: &[f64], is_new_x: bool) -> Result<(usize, usize)> {
        let jac = self.constraint_jacobian(x, is_new_x)?;
        let cols = jac.first().map_or(x.len(), |row| row.len());
        Ok((jac.len(), cols))
    }

    /// Largest step allowed for each variable per iteration.
    /// Empty means unlimited.
    fn max_var_step(&self) -> Vec<f64> {
        Vec::new()
    }
}

/// Solver for the quadratic programming subproblem of each major iteration.
pub trait QpSolver {
    fn solve(&self, qp: &QpSubproblem) -> Result<QpSolution>;
}

/// Called at the end of each major iteration with the iteration number,
/// number of QP iterations, step length, size of the active set,
/// objective function value, maximum constraint violation and
/// merit function value.
pub trait ProgressMonitor {
    fn update(
        &self,
        i: usize,
        qp_iterations: usize,
        alpha: f64,
        num_active: usize,
        obj: f64,
        max_con_violation: f64,
        merit: f64,
    );
}
