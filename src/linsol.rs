use anyhow::{anyhow, Result};
use sparsetools::csr::CSR;
use spsolve::Solver;

/// Solves `A*x = b` for a square `A`, overwriting `b` with `x`.
pub(crate) fn solve<S>(solver: &S, a_mat: &CSR<usize, f64>, b: &mut [f64]) -> Result<()>
where
    S: Solver<usize, f64>,
{
    let n = b.len();
    if n == 0 {
        return Ok(());
    }
    let a_csc = a_mat.to_csc();

    let mut rhs = b.to_vec();
    solver
        .solve(
            n,
            a_csc.rowidx(),
            a_csc.colptr(),
            a_csc.values(),
            &mut rhs,
            false,
        )
        .map_err(|err| anyhow!("linear solve failed: {}", err))?;

    if rhs.iter().any(|v| !v.is_finite()) {
        return Err(anyhow!("linear solve failed: singular matrix"));
    }
    b.copy_from_slice(&rhs);
    Ok(())
}
