use crate::error::NlpError;
use crate::linsol;
use crate::math::{dot, is_positive_definite, norm, norm_inf};
use crate::traits::QpSolver;
use anyhow::Result;
use log::{debug, trace};
use sparsetools::csr::CSR;
use spsolve::Solver;

/// Residual bounds at or beyond this magnitude are infinite.
const INF_RESIDUAL: f64 = 1e20;
/// Tolerance on constraint satisfaction of normalized rows.
const FEAS_TOL: f64 = 1e-10;
/// Directions and dual steps smaller than this are zero.
const ZERO_TOL: f64 = 1e-10;
/// Rows of `J` whose coefficients all differ by less than this are
/// duplicates.
const DUP_TOL: f64 = 1e-12;
/// Relative tolerance for treating a row as an equality.
const EQ_TOL: f64 = 1e-12;

/// The quadratic programming subproblem:
///
/// ```txt
///       min 1/2 p'*H*p + g'*p
///        p
/// ```
///
/// subject to
///
/// ```txt
///       lower <= J*p <= upper
/// ```
///
/// The step is measured from the current point, so there is no separate
/// center, and only the optimality phase is solved: the dual method
/// starts from the unconstrained minimum and needs no feasible point.
pub struct QpSubproblem<'a> {
    pub hessian: &'a CSR<usize, f64>,
    pub gradient: &'a [f64],
    pub jacobian: &'a CSR<usize, f64>,
    pub lower: &'a [f64],
    pub upper: &'a [f64],
    /// Rows of `J` tried first when they are violated, e.g. the active
    /// set of a previous solve. May be empty.
    pub working_set: &'a [usize],
    /// Merge rows of `J` with identical coefficients and report equality
    /// rows that depend linearly on other equalities.
    pub check_duplicates: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpStatus {
    Optimal,
    Infeasible,
    MaxIterations,
    /// The Hessian is not positive definite.
    NotConvex,
    LinearSolveFailed,
}

impl QpStatus {
    pub fn exit_flag(&self) -> i32 {
        match self {
            QpStatus::Optimal => 1,
            QpStatus::Infeasible => -1,
            QpStatus::MaxIterations => -2,
            QpStatus::NotConvex => -3,
            QpStatus::LinearSolveFailed => -4,
        }
    }
}

/// Row `removed` duplicates row `kept`. The bounds of `kept` have been
/// tightened to the intersection of both rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedRows {
    pub kept: usize,
    pub removed: usize,
}

#[derive(Debug, Clone)]
pub struct QpSolution {
    pub step: Vec<f64>,
    /// Objective function value at `step`.
    pub objective: f64,
    /// Multipliers satisfying `H*p + g = J'*lambda`, one for each row
    /// remaining after the `merged` and `dependent` rows are removed.
    /// Positive at an active lower bound and negative at an active upper
    /// bound.
    pub multipliers: Vec<f64>,
    pub status: QpStatus,
    pub iterations: usize,
    /// Rows with an active inequality, indexed as `multipliers`.
    pub active_set: Vec<usize>,
    /// Duplicated rows, indexed as the input Jacobian.
    pub merged: Vec<MergedRows>,
    /// Equality rows dropped as linear combinations of other equality
    /// rows, indexed as the input Jacobian. Only reported with
    /// `check_duplicates` and only by an optimal solve.
    pub dependent: Vec<usize>,
}

/// Dense dual active set method of Goldfarb and Idnani for strictly
/// convex QPs. The KKT systems are solved using `S`.
pub struct ActiveSetQp<S> {
    solver: S,
    max_iter: Option<usize>,
}

impl<S> ActiveSetQp<S> {
    pub fn new(solver: S) -> Self {
        Self {
            solver,
            max_iter: None,
        }
    }

    /// Limits the number of active set changes. Defaults to
    /// `10*(n + number of one-sided constraints) + 10`.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = Some(max_iter);
        self
    }
}

impl<S: Default> Default for ActiveSetQp<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S> QpSolver for ActiveSetQp<S>
where
    S: Solver<usize, f64>,
{
    fn solve(&self, qp: &QpSubproblem) -> Result<QpSolution> {
        let n = qp.gradient.len();
        let m = qp.jacobian.rows();
        check_dims(qp, n, m)?;
        let jac = qp.jacobian.to_coo().to_dense();

        // Normalize the constraint rows.
        let mut rows = Vec::with_capacity(m);
        let mut fac = Vec::with_capacity(m);
        let mut lo = Vec::with_capacity(m);
        let mut hi = Vec::with_capacity(m);
        for i in 0..m {
            let nrm = norm(&jac[i]);
            let f = if nrm > 0.0 { nrm } else { 1.0 };
            rows.push(jac[i].iter().map(|v| v / f).collect::<Vec<f64>>());
            fac.push(f);
            lo.push(if qp.lower[i] <= -INF_RESIDUAL {
                f64::NEG_INFINITY
            } else {
                qp.lower[i] / f
            });
            hi.push(if qp.upper[i] >= INF_RESIDUAL {
                f64::INFINITY
            } else {
                qp.upper[i] / f
            });
        }

        let mut merged = Vec::new();
        let mut removed = vec![false; m];
        if qp.check_duplicates {
            for i in 0..m {
                if removed[i] {
                    continue;
                }
                for j in (i + 1)..m {
                    if !removed[j] && same_row(&jac[i], &jac[j]) {
                        lo[i] = lo[i].max(lo[j]);
                        hi[i] = hi[i].min(hi[j]);
                        removed[j] = true;
                        merged.push(MergedRows { kept: i, removed: j });
                    }
                }
            }
            if !merged.is_empty() {
                debug!("QP: merged {} duplicate constraint rows", merged.len());
            }
        }
        let keep: Vec<usize> = (0..m).filter(|&i| !removed[i]).collect();
        let fail = |status: QpStatus, iterations: usize, merged: &[MergedRows]| {
            debug!("QP: {:?} after {} iterations", status, iterations);
            QpSolution {
                step: vec![0.0; n],
                objective: 0.0,
                multipliers: vec![0.0; keep.len()],
                status,
                iterations,
                active_set: Vec::new(),
                merged: merged.to_vec(),
                dependent: Vec::new(),
            }
        };

        // Split two-sided rows into one-sided constraints N'*p >= b.
        let mut normals = Vec::new();
        let mut b = Vec::new();
        let mut eq = Vec::new();
        let mut sign = Vec::new();
        let mut row = Vec::new();
        for &i in &keep {
            if lo[i] > hi[i] + FEAS_TOL {
                return Ok(fail(QpStatus::Infeasible, 0, &merged));
            }
            if norm_inf(&rows[i]) == 0.0 {
                if lo[i] > FEAS_TOL || hi[i] < -FEAS_TOL {
                    return Ok(fail(QpStatus::Infeasible, 0, &merged));
                }
                continue;
            }
            let mut push = |s: f64, bound: f64, is_eq: bool| {
                normals.push(rows[i].iter().map(|v| s * v).collect::<Vec<f64>>());
                b.push(s * bound);
                eq.push(is_eq);
                sign.push(s);
                row.push(i);
            };
            if (hi[i] - lo[i]).abs() <= EQ_TOL * (1.0 + lo[i].abs()) {
                push(1.0, lo[i], true);
            } else {
                if lo[i].is_finite() {
                    push(1.0, lo[i], false);
                }
                if hi[i].is_finite() {
                    push(-1.0, hi[i], false);
                }
            }
        }

        // Scale the objective by the largest row sum of the Hessian.
        let h_dense = qp.hessian.to_coo().to_dense();
        let fh = h_dense
            .iter()
            .map(|r| r.iter().map(|v| v.abs()).sum::<f64>())
            .fold(0.0, f64::max);
        let fh = if fh > 0.0 { fh } else { 1.0 };
        let h_mat: Vec<Vec<f64>> = h_dense
            .iter()
            .map(|r| r.iter().map(|v| v / fh).collect())
            .collect();
        if !is_positive_definite(&h_mat) {
            return Ok(fail(QpStatus::NotConvex, 0, &merged));
        }
        let neg_g: Vec<f64> = qp.gradient.iter().map(|v| -v / fh).collect();

        let num_cons = normals.len();
        let mut dual = Dual {
            solver: &self.solver,
            h_mat: &h_mat,
            normals,
            b,
            eq,
            x: Vec::new(),
            active: Vec::new(),
            u: Vec::new(),
            iterations: 0,
            max_iter: self.max_iter.unwrap_or(10 * (n + num_cons) + 10),
        };

        // Unconstrained minimum.
        dual.x = match dual.kkt(&neg_g) {
            Ok((x, _)) => x,
            Err(err) => {
                debug!("QP: {}", err);
                return Ok(fail(QpStatus::LinearSolveFailed, 0, &merged));
            }
        };

        let mut dependent = Vec::new();
        for c in 0..num_cons {
            if !dual.eq[c] {
                continue;
            }
            if dual.slack(c) > 0.0 {
                dual.normals[c].iter_mut().for_each(|v| *v = -*v);
                dual.b[c] = -dual.b[c];
                sign[c] = -sign[c];
            }
            match dual.add(c) {
                Add::Added => {}
                Add::Redundant => {
                    trace!("QP: equality row {} is linearly dependent", row[c]);
                    if qp.check_duplicates {
                        dependent.push(row[c]);
                    }
                }
                Add::Stop(status) => return Ok(fail(status, dual.iterations, &merged)),
            }
        }
        if !dependent.is_empty() {
            debug!("QP: dropped {} dependent equality rows", dependent.len());
        }

        for &w in qp.working_set {
            for c in 0..num_cons {
                if row[c] != w || dual.eq[c] || dual.active.contains(&c) {
                    continue;
                }
                if dual.slack(c) < -FEAS_TOL {
                    if let Add::Stop(status) = dual.add(c) {
                        return Ok(fail(status, dual.iterations, &merged));
                    }
                }
            }
        }

        loop {
            let mut violated = None;
            let mut smin = -FEAS_TOL;
            for c in 0..num_cons {
                if dual.eq[c] || dual.active.contains(&c) {
                    continue;
                }
                let s = dual.slack(c);
                if s < smin {
                    smin = s;
                    violated = Some(c);
                }
            }
            let Some(p) = violated else {
                break;
            };
            trace!("QP: adding row {} (slack {:e})", row[p], smin);
            if let Add::Stop(status) = dual.add(p) {
                return Ok(fail(status, dual.iterations, &merged));
            }
        }

        let mut lam = vec![0.0; m];
        for (&c, &uc) in dual.active.iter().zip(&dual.u) {
            lam[row[c]] += sign[c] * uc;
        }
        let kept: Vec<usize> = keep
            .iter()
            .copied()
            .filter(|i| !dependent.contains(i))
            .collect();
        let multipliers = kept.iter().map(|&i| lam[i] * fh / fac[i]).collect();

        let mut post = vec![0; m];
        for (k, &i) in kept.iter().enumerate() {
            post[i] = k;
        }
        let mut active_set: Vec<usize> = dual
            .active
            .iter()
            .filter(|&&c| !dual.eq[c])
            .map(|&c| post[row[c]])
            .collect();
        active_set.sort_unstable();
        active_set.dedup();

        let iterations = dual.iterations;
        let mut step = dual.x;
        if norm(&step) <= ZERO_TOL
            && keep
                .iter()
                .all(|&i| lo[i] <= FEAS_TOL && hi[i] >= -FEAS_TOL)
        {
            step = vec![0.0; n];
        }
        let p: &[f64] = &step;
        let objective = 0.5 * dot(p, &(qp.hessian * &p)) + dot(qp.gradient, p);

        debug!(
            "QP: optimal after {} iterations, {} active constraints",
            iterations,
            active_set.len()
        );
        Ok(QpSolution {
            step,
            objective,
            multipliers,
            status: QpStatus::Optimal,
            iterations,
            active_set,
            merged,
            dependent,
        })
    }
}

enum Add {
    Added,
    Redundant,
    Stop(QpStatus),
}

/// Working data of the dual method. Constraints are `normals[c]'*x >= b[c]`
/// (equality if `eq[c]`), the active constraints have multipliers `u`.
struct Dual<'a, S> {
    solver: &'a S,
    h_mat: &'a [Vec<f64>],
    normals: Vec<Vec<f64>>,
    b: Vec<f64>,
    eq: Vec<bool>,
    x: Vec<f64>,
    active: Vec<usize>,
    u: Vec<f64>,
    iterations: usize,
    max_iter: usize,
}

impl<'a, S> Dual<'a, S>
where
    S: Solver<usize, f64>,
{
    fn slack(&self, c: usize) -> f64 {
        dot(&self.normals[c], &self.x) - self.b[c]
    }

    /// Solves `[H N; N' 0][z; r] = [rhs; 0]` where the columns of `N`
    /// are the normals of the active constraints.
    fn kkt(&self, rhs: &[f64]) -> Result<(Vec<f64>, Vec<f64>)> {
        let n = rhs.len();
        let k = self.active.len();
        let mut k_mat = vec![vec![0.0; n + k]; n + k];
        for i in 0..n {
            k_mat[i][..n].copy_from_slice(&self.h_mat[i]);
        }
        for (a, &c) in self.active.iter().enumerate() {
            for i in 0..n {
                k_mat[i][n + a] = self.normals[c][i];
                k_mat[n + a][i] = self.normals[c][i];
            }
        }
        let mut z = rhs.to_vec();
        z.resize(n + k, 0.0);
        linsol::solve(self.solver, &CSR::from_dense(&k_mat), &mut z)?;
        let r = z.split_off(n);
        Ok((z, r))
    }

    /// Adds constraint `p` to the active set, dropping inequalities
    /// that block it along the way.
    fn add(&mut self, p: usize) -> Add {
        let mut u_p = 0.0;
        loop {
            self.iterations += 1;
            if self.iterations > self.max_iter {
                return Add::Stop(QpStatus::MaxIterations);
            }
            let s = self.slack(p);
            let (z, r) = match self.kkt(&self.normals[p]) {
                Ok(zr) => zr,
                Err(err) => {
                    debug!("QP: {}", err);
                    return Add::Stop(QpStatus::LinearSolveFailed);
                }
            };

            // Largest dual step before an active inequality multiplier
            // changes sign.
            let mut t1 = f64::INFINITY;
            let mut blocking = None;
            for (a, &c) in self.active.iter().enumerate() {
                if !self.eq[c] && r[a] > ZERO_TOL {
                    let t = self.u[a] / r[a];
                    if t < t1 {
                        t1 = t;
                        blocking = Some(a);
                    }
                }
            }

            if norm_inf(&z) <= ZERO_TOL {
                // Normal of p is dependent on the active normals.
                let Some(l) = blocking else {
                    return if self.eq[p] && s.abs() <= FEAS_TOL {
                        Add::Redundant
                    } else {
                        Add::Stop(QpStatus::Infeasible)
                    };
                };
                for (ua, ra) in self.u.iter_mut().zip(&r) {
                    *ua -= t1 * ra;
                }
                u_p += t1;
                self.active.remove(l);
                self.u.remove(l);
                continue;
            }

            let zn = dot(&z, &self.normals[p]);
            if zn <= 0.0 {
                return Add::Stop(QpStatus::NotConvex);
            }
            let t2 = -s / zn;
            let t = t2.min(t1);
            for (xi, zi) in self.x.iter_mut().zip(&z) {
                *xi += t * zi;
            }
            for (ua, ra) in self.u.iter_mut().zip(&r) {
                *ua -= t * ra;
            }
            u_p += t;

            if t2 <= t1 {
                self.active.push(p);
                self.u.push(u_p);
                return Add::Added;
            }
            if let Some(l) = blocking {
                self.active.remove(l);
                self.u.remove(l);
            }
        }
    }
}

fn same_row(a: &[f64], b: &[f64]) -> bool {
    a.iter().zip(b).all(|(ai, bi)| (ai - bi).abs() <= DUP_TOL)
}

fn check_dims(qp: &QpSubproblem, n: usize, m: usize) -> Result<(), NlpError> {
    let mismatch = |what, expected, actual| NlpError::DimensionMismatch {
        what,
        expected,
        actual,
    };
    if qp.hessian.rows() != n {
        return Err(mismatch("QP Hessian rows", n, qp.hessian.rows()));
    }
    if qp.hessian.cols() != n {
        return Err(mismatch("QP Hessian columns", n, qp.hessian.cols()));
    }
    if m > 0 && qp.jacobian.cols() != n {
        return Err(mismatch("QP Jacobian columns", n, qp.jacobian.cols()));
    }
    if qp.lower.len() != m {
        return Err(mismatch("QP lower residuals", m, qp.lower.len()));
    }
    if qp.upper.len() != m {
        return Err(mismatch("QP upper residuals", m, qp.upper.len()));
    }
    Ok(())
}
