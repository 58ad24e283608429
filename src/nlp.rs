use crate::error::NlpError;
use crate::math::norm_inf;
use crate::traits::{Bounds, Problem};
use anyhow::Result;
use log::{debug, info};

/// Bounds at or beyond this magnitude are treated as infinite.
const UNBOUNDED: f64 = 9e299;
/// Upper bound on the elastic variables.
const ELASTIC_UPPER: f64 = f32::MAX as f64;
/// Initial value of the elastic variables.
const ELASTIC_START: f64 = 1.0;
/// Maximum step of variables without a user supplied limit.
pub(crate) const DEFAULT_MAX_STEP: f64 = 1e300;

/// Cost, constraint values and their derivatives at a point.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub cost: f64,
    pub cost_gradient: Vec<f64>,
    pub constraints: Vec<f64>,
    pub jacobian: Vec<Vec<f64>>,
}

/// Presents a [`Problem`] as a canonical NLP.
///
/// Variable bounds are folded into linear constraint rows appended after the
/// user constraints:
///
/// ```txt
///       [ c(x) ]              [ dc/dx  0   0 ]
///       [ x_b  ]   Jacobian   [ I_b    0   0 ]
/// ```
///
/// In elastic mode each user constraint `i` receives a pair of non-negative
/// variables `v_i`, `w_i` so that the constraint becomes `c_i(x) - v_i + w_i`
/// and the cost becomes `f(x) + weight * sum(v + w)`:
///
/// ```txt
///       [ c(x) - v + w ]              [ dc/dx  -I   I ]
///       [ x_b          ]   Jacobian   [ I_b     0   0 ]
///       [ v            ]              [ 0       I   0 ]
///       [ w            ]              [ 0       0   I ]
/// ```
pub struct NlpTransform<P> {
    problem: P,

    num_user_vars: usize,
    num_user_cons: usize,
    user_bounds: Bounds,
    user_max_step: Vec<f64>,

    /// Variables with a bound row, in row order.
    bound_idx: Vec<usize>,

    elastic: bool,
    elastic_weight: f64,

    num_vars: usize,
    num_cons: usize,
    bounds: Bounds,
    jacobian: Vec<Vec<f64>>,
    cost_gradient: Vec<f64>,
}

impl<P: Problem> NlpTransform<P> {
    /// Wraps `problem`, checking that the sizes it declares agree with
    /// the vectors it returns.
    pub fn new(mut problem: P) -> Result<Self> {
        let (n, m) = problem.nlp_info()?;
        if n == 0 {
            return Err(NlpError::NoVariables.into());
        }

        let x0 = problem.starting_point()?;
        check_len("starting point", n, x0.len())?;

        let bounds = problem.bounds_info(n, m)?;
        let user_bounds = Bounds {
            var_lower: fill("variable lower bounds", bounds.var_lower, n, f64::NEG_INFINITY)?,
            var_upper: fill("variable upper bounds", bounds.var_upper, n, f64::INFINITY)?,
            con_lower: fill("constraint lower bounds", bounds.con_lower, m, f64::NEG_INFINITY)?,
            con_upper: fill("constraint upper bounds", bounds.con_upper, m, f64::INFINITY)?,
        };
        let user_max_step = fill("maximum step sizes", problem.max_var_step(), n, DEFAULT_MAX_STEP)?;

        problem.cost(&x0, true)?;
        let grad = problem.cost_gradient(&x0, false)?;
        check_len("cost gradient", n, grad.len())?;
        let con = problem.constraints(&x0, false)?;
        check_len("constraint values", m, con.len())?;

        let (rows, cols) = problem.constraint_jacobian_dims(&x0, false)?;
        if rows != m || (m != 0 && cols != n) {
            return Err(NlpError::JacobianShape {
                rows,
                cols,
                num_cons: m,
                num_vars: n,
            }
            .into());
        }
        let jac = problem.constraint_jacobian(&x0, false)?;
        check_jacobian(&jac, m, n)?;

        let mut nlp = Self {
            problem,
            num_user_vars: n,
            num_user_cons: m,
            user_bounds,
            user_max_step,
            bound_idx: Vec::new(),
            elastic: false,
            elastic_weight: 0.0,
            num_vars: 0,
            num_cons: 0,
            bounds: Bounds::default(),
            jacobian: Vec::new(),
            cost_gradient: Vec::new(),
        };
        nlp.prepare_arrays();
        Ok(nlp)
    }

    /// Builds the canonical bounds and the constant parts of the Jacobian
    /// and cost gradient for the current mode.
    pub(crate) fn prepare_arrays(&mut self) {
        let (n, m) = (self.num_user_vars, self.num_user_cons);
        let ub = &self.user_bounds;

        // Spurious bounds on unbounded variables would only hurt conditioning.
        self.bound_idx = (0..n)
            .filter(|&j| !(ub.var_lower[j] <= -UNBOUNDED && ub.var_upper[j] >= UNBOUNDED))
            .collect();
        let nb = self.bound_idx.len();
        let ne = self.num_elastic_vars();

        self.num_vars = n + ne;
        self.num_cons = m + nb + ne;

        let mut var_lower = ub.var_lower.clone();
        let mut var_upper = ub.var_upper.clone();
        var_lower.resize(self.num_vars, 0.0);
        var_upper.resize(self.num_vars, ELASTIC_UPPER);

        let mut con_lower = ub.con_lower.clone();
        let mut con_upper = ub.con_upper.clone();
        con_lower.extend(self.bound_idx.iter().map(|&j| ub.var_lower[j]));
        con_upper.extend(self.bound_idx.iter().map(|&j| ub.var_upper[j]));
        con_lower.resize(self.num_cons, 0.0);
        con_upper.resize(self.num_cons, ELASTIC_UPPER);

        self.bounds = Bounds {
            var_lower,
            var_upper,
            con_lower,
            con_upper,
        };

        let mut jac = vec![vec![0.0; self.num_vars]; self.num_cons];
        if self.elastic {
            for i in 0..m {
                jac[i][n + i] = -1.0;
                jac[i][n + m + i] = 1.0;
            }
        }
        for (k, &j) in self.bound_idx.iter().enumerate() {
            jac[m + k][j] = 1.0;
        }
        for e in 0..ne {
            jac[m + nb + e][n + e] = 1.0;
        }
        self.jacobian = jac;

        self.cost_gradient = vec![0.0; self.num_vars];
        self.update_elastic_gradient();

        debug!(
            "NLP: {} variables ({} elastic), {} constraints ({} bound rows)",
            self.num_vars, ne, self.num_cons, nb
        );
    }

    /// Switches to elastic mode with the given weight. All variable and
    /// constraint indexed arrays change size.
    pub fn set_elastic_mode(&mut self, weight: f64) {
        self.elastic = true;
        self.elastic_weight = weight;
        self.prepare_arrays();
        info!(
            "entering elastic mode: weight = {}, {} elastic variables",
            weight,
            self.num_elastic_vars()
        );
    }

    pub fn set_elastic_weight(&mut self, weight: f64) {
        self.elastic_weight = weight;
        self.update_elastic_gradient();
    }

    fn update_elastic_gradient(&mut self) {
        let n = self.num_user_vars;
        let w = if self.elastic { self.elastic_weight } else { 0.0 };
        for g in self.cost_gradient[n..].iter_mut() {
            *g = w;
        }
    }

    /// Returns the number of variables and constraints of the canonical NLP.
    pub fn nlp_info(&self) -> (usize, usize) {
        (self.num_vars, self.num_cons)
    }

    pub fn nlp_bounds_info(&self) -> &Bounds {
        &self.bounds
    }

    /// The user's starting point, extended with the initial elastic variables.
    pub fn nlp_starting_point(&self) -> Result<Vec<f64>> {
        let x0 = self.problem.starting_point()?;
        check_len("starting point", self.num_user_vars, x0.len())?;
        Ok(self.extend_point(&x0))
    }

    /// Extends a user decision vector with the initial elastic variables.
    pub fn extend_point(&self, x_user: &[f64]) -> Vec<f64> {
        let mut x = x_user[..self.num_user_vars].to_vec();
        x.resize(self.num_vars, ELASTIC_START);
        x
    }

    /// Maximum step per variable; elastic variables are unlimited.
    pub fn max_var_step(&self) -> Vec<f64> {
        let mut step = self.user_max_step.clone();
        step.resize(self.num_vars, DEFAULT_MAX_STEP);
        step
    }

    /// Evaluates the canonical cost and constraint values.
    pub fn evaluate_functions(&mut self, x: &[f64], is_new_x: bool) -> Result<(f64, Vec<f64>)> {
        let (n, m) = (self.num_user_vars, self.num_user_cons);
        let xu = &x[..n];

        let mut cost = self.problem.cost(xu, is_new_x)?;
        let user_con = self.problem.constraints(xu, false)?;
        check_len("constraint values", m, user_con.len())?;

        let mut con = Vec::with_capacity(self.num_cons);
        con.extend(user_con);
        if self.elastic {
            let (v, w) = (&x[n..n + m], &x[n + m..n + 2 * m]);
            for i in 0..m {
                con[i] += w[i] - v[i];
            }
            cost += self.elastic_cost(x);
        }
        con.extend(self.bound_idx.iter().map(|&j| x[j]));
        if self.elastic {
            con.extend_from_slice(&x[n..]);
        }
        Ok((cost, con))
    }

    /// Evaluates the canonical cost gradient and constraint Jacobian.
    pub fn evaluate_derivatives(
        &mut self,
        x: &[f64],
        is_new_x: bool,
    ) -> Result<(Vec<f64>, Vec<Vec<f64>>)> {
        let (n, m) = (self.num_user_vars, self.num_user_cons);
        let xu = &x[..n];

        let grad = self.problem.cost_gradient(xu, is_new_x)?;
        check_len("cost gradient", n, grad.len())?;
        let jac = self.problem.constraint_jacobian(xu, false)?;
        check_jacobian(&jac, m, n)?;

        self.cost_gradient[..n].copy_from_slice(&grad);
        for (row, user_row) in self.jacobian.iter_mut().zip(&jac) {
            row[..n].copy_from_slice(user_row);
        }
        Ok((self.cost_gradient.clone(), self.jacobian.clone()))
    }

    pub fn evaluate_all(&mut self, x: &[f64], is_new_x: bool) -> Result<Evaluation> {
        let (cost, constraints) = self.evaluate_functions(x, is_new_x)?;
        let (cost_gradient, jacobian) = self.evaluate_derivatives(x, false)?;
        Ok(Evaluation {
            cost,
            cost_gradient,
            constraints,
            jacobian,
        })
    }

    pub fn elastic_v<'a>(&self, x: &'a [f64]) -> Result<&'a [f64], NlpError> {
        if !self.elastic {
            return Err(NlpError::NotElastic("elastic variable v"));
        }
        let (n, m) = (self.num_user_vars, self.num_user_cons);
        Ok(&x[n..n + m])
    }

    pub fn elastic_w<'a>(&self, x: &'a [f64]) -> Result<&'a [f64], NlpError> {
        if !self.elastic {
            return Err(NlpError::NotElastic("elastic variable w"));
        }
        let (n, m) = (self.num_user_vars, self.num_user_cons);
        Ok(&x[n + m..n + 2 * m])
    }

    /// Largest magnitude of the elastic variables (0 outside elastic mode).
    pub fn max_elastic_var(&self, x: &[f64]) -> f64 {
        if !self.elastic {
            return 0.0;
        }
        norm_inf(&x[self.num_user_vars..self.num_vars])
    }

    /// The elastic penalty term `weight * sum(v + w)`.
    pub fn elastic_cost(&self, x: &[f64]) -> f64 {
        if !self.elastic {
            return 0.0;
        }
        self.elastic_weight * x[self.num_user_vars..self.num_vars].iter().sum::<f64>()
    }

    /// Removes the elastic penalty from a canonical cost value.
    pub fn shift_cost(&self, cost: f64, x: &[f64]) -> f64 {
        cost - self.elastic_cost(x)
    }

    /// Largest violation of the user constraints, given canonical
    /// (uncompacted) constraint values at `x`.
    pub fn max_user_con_violation(&self, con: &[f64], x: &[f64]) -> f64 {
        let (n, m) = (self.num_user_vars, self.num_user_cons);
        let ub = &self.user_bounds;
        (0..m)
            .map(|i| {
                let mut c = con[i];
                if self.elastic {
                    c += x[n + i] - x[n + m + i];
                }
                if c > ub.con_upper[i] {
                    c - ub.con_upper[i]
                } else if c < ub.con_lower[i] {
                    ub.con_lower[i] - c
                } else {
                    0.0
                }
            })
            .fold(0.0, f64::max)
    }

    pub fn is_elastic(&self) -> bool {
        self.elastic
    }

    pub fn elastic_weight(&self) -> f64 {
        self.elastic_weight
    }

    pub fn num_user_vars(&self) -> usize {
        self.num_user_vars
    }

    pub fn num_user_cons(&self) -> usize {
        self.num_user_cons
    }

    pub fn num_elastic_vars(&self) -> usize {
        if self.elastic {
            2 * self.num_user_cons
        } else {
            0
        }
    }

    pub fn problem(&self) -> &P {
        &self.problem
    }

    pub fn problem_mut(&mut self) -> &mut P {
        &mut self.problem
    }

    /// Canonical constraint Jacobian from the last derivative evaluation.
    pub fn jacobian(&self) -> &[Vec<f64>] {
        &self.jacobian
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), NlpError> {
    if expected != actual {
        return Err(NlpError::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

fn check_jacobian(jac: &[Vec<f64>], num_cons: usize, num_vars: usize) -> Result<(), NlpError> {
    if jac.len() != num_cons {
        return Err(NlpError::JacobianShape {
            rows: jac.len(),
            cols: jac.first().map_or(num_vars, |row| row.len()),
            num_cons,
            num_vars,
        });
    }
    for (row, r) in jac.iter().enumerate() {
        if r.len() != num_vars {
            return Err(NlpError::RaggedJacobian {
                row,
                len: r.len(),
                num_vars,
            });
        }
    }
    Ok(())
}

/// An empty vector means unbounded.
fn fill(what: &'static str, v: Vec<f64>, n: usize, value: f64) -> Result<Vec<f64>, NlpError> {
    if v.is_empty() {
        return Ok(vec![value; n]);
    }
    check_len(what, n, v.len())?;
    Ok(v)
}
