use crate::common::*;
use crate::compact::{compact, compact_in_place, remaining};
use crate::error::NlpError;
use crate::hessian::{update_hessian, UpdateKind};
use crate::math::{add_scaled, dot, norm_inf, sub};
use crate::merit::{
    constraint_types, merit, predicted_merit, step_scale, update_penalty, violations,
    ConstraintType,
};
use crate::nlp::NlpTransform;
use crate::qp::{MergedRows, QpSolution, QpStatus, QpSubproblem};
use crate::traits::{Problem, ProgressMonitor, QpSolver};
use anyhow::Result;
use log::{debug, info, trace, warn};
use sparsetools::coo::Coo;
use sparsetools::csc::CSC;
use sparsetools::csr::CSR;

/// Initial exact penalty weight of every constraint.
const INITIAL_MU: f64 = 1e-20;
/// Elastic variables below this are zero.
const MIN_ELASTIC_VAR: f64 = 1e-10;
/// Below this the change in cost is measured absolutely.
const TINY_COST: f64 = 1e-7;
/// Consecutive failed line searches before giving up on a direction.
const MAX_FAILED_SEARCHES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Convergence {
    NotConverged,
    /// Gradient of the Lagrangian is within tolerance.
    Gradient,
    /// Change in cost is within tolerance.
    FunctionChange,
    Infeasible,
}

/// Best point seen since the last roll back.
#[derive(Clone)]
struct MeritSnapshot {
    merit: f64,
    decrease_cond: f64,
    x: Vec<f64>,
    cost: f64,
    con: Vec<f64>,
    full_con: Vec<f64>,
    viol: Vec<f64>,
    cost_grad: Vec<f64>,
    jac: Vec<Vec<f64>>,
    hessian: CSR<usize, f64>,
    alpha: f64,
}

impl Default for MeritSnapshot {
    fn default() -> Self {
        Self {
            merit: 0.0,
            decrease_cond: 0.0,
            x: Vec::new(),
            cost: 0.0,
            con: Vec::new(),
            full_con: Vec::new(),
            viol: Vec::new(),
            cost_grad: Vec::new(),
            jac: Vec::new(),
            hessian: CSR::with_size(0, 0),
            alpha: 0.0,
        }
    }
}

/// Sequential quadratic programming optimizer.
///
/// Minimizes the [`Problem`] `P` using search directions from the QP
/// solver `Q`, a line search on the L1 exact penalty merit function and
/// a quasi-Newton approximation of the Hessian of the Lagrangian. If the
/// QP subproblem is infeasible the problem is relaxed with elastic
/// variables whose weight is raised until the constraints are satisfied
/// or the weight reaches its limit.
///
/// The optimizer is a state machine. [`Sqp::optimize`] runs it to
/// completion; alternatively call [`Sqp::prepare_to_optimize`] once and
/// then [`Sqp::respond_to_data`] until [`Sqp::check_status`] reports a
/// status other than 0 or -1. Each call advances one stage and evaluates
/// the problem at most a few times.
pub struct Sqp<P, Q> {
    nlp: NlpTransform<P>,
    qp: Q,
    opt: Options,
    progress: Option<Box<dyn ProgressMonitor>>,

    state: State,

    num_vars: usize,
    num_cons: usize,
    var_lower: Vec<f64>,
    var_upper: Vec<f64>,
    con_lower: Vec<f64>,
    con_upper: Vec<f64>,
    con_types: Vec<ConstraintType>,
    max_step: Vec<f64>,
    /// Rows dropped as duplicated or dependent, numbered as the NLP
    /// constraints.
    removed: Vec<usize>,

    x: Vec<f64>,
    cost: f64,
    cost_grad: Vec<f64>,
    con: Vec<f64>,
    /// Constraint values before compaction.
    full_con: Vec<f64>,
    jac: Vec<Vec<f64>>,
    hessian: CSR<usize, f64>,
    lambda: Vec<f64>,
    mu: Vec<f64>,

    px: Vec<f64>,
    plam: Vec<f64>,
    active_set: Vec<usize>,
    qp_iterations: usize,
    total_qp_iterations: usize,

    alpha: f64,
    step_scale: f64,
    merit: f64,
    merit_alpha: f64,
    cost_old: f64,
    con_old: Vec<f64>,
    full_con_old: Vec<f64>,
    x_old: Vec<f64>,
    grad_old: Vec<f64>,
    jac_old: Vec<Vec<f64>>,
    viol_old: Vec<f64>,
    step: Vec<f64>,
    grad_lagrangian: Vec<f64>,
    delta_grad_lagrangian: Vec<f64>,
    max_con_violation: f64,

    search_count: usize,
    failed_searches: usize,
    allow_skip: bool,
    test_skipped: bool,
    skips: usize,
    strict_count: usize,
    first_elastic_step: bool,
    min: MeritSnapshot,

    iterations: usize,
    fun_evals: usize,
    update_kind: UpdateKind,
}

impl<P, Q> Sqp<P, Q>
where
    P: Problem,
    Q: QpSolver,
{
    /// Validates the options and the problem dimensions.
    pub fn new(problem: P, qp: Q, opt: Options) -> Result<Self> {
        opt.validate()?;
        let nlp = NlpTransform::new(problem)?;
        let (num_vars, num_cons) = nlp.nlp_info();
        let strict_count = opt.strict_steps;

        Ok(Self {
            nlp,
            qp,
            opt,
            progress: None,
            state: State::Instantiated,
            num_vars,
            num_cons,
            var_lower: Vec::new(),
            var_upper: Vec::new(),
            con_lower: Vec::new(),
            con_upper: Vec::new(),
            con_types: Vec::new(),
            max_step: Vec::new(),
            removed: Vec::new(),
            x: Vec::new(),
            cost: 0.0,
            cost_grad: Vec::new(),
            con: Vec::new(),
            full_con: Vec::new(),
            jac: Vec::new(),
            hessian: CSR::with_size(0, 0),
            lambda: Vec::new(),
            mu: Vec::new(),
            px: Vec::new(),
            plam: Vec::new(),
            active_set: Vec::new(),
            qp_iterations: 0,
            total_qp_iterations: 0,
            alpha: 1.0,
            step_scale: 1.0,
            merit: 0.0,
            merit_alpha: 0.0,
            cost_old: 0.0,
            con_old: Vec::new(),
            full_con_old: Vec::new(),
            x_old: Vec::new(),
            grad_old: Vec::new(),
            jac_old: Vec::new(),
            viol_old: Vec::new(),
            step: Vec::new(),
            grad_lagrangian: Vec::new(),
            delta_grad_lagrangian: Vec::new(),
            max_con_violation: 0.0,
            search_count: 0,
            failed_searches: 0,
            allow_skip: false,
            test_skipped: false,
            skips: 0,
            strict_count,
            first_elastic_step: false,
            min: MeritSnapshot::default(),
            iterations: 0,
            fun_evals: 0,
            update_kind: UpdateKind::NoUpdate,
        })
    }

    /// Reports each major iteration to `progress`.
    pub fn with_progress(mut self, progress: Box<dyn ProgressMonitor>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Evaluates the problem at the starting point and initializes the
    /// Hessian, multipliers and penalty weights.
    pub fn prepare_to_optimize(&mut self) -> Result<()> {
        self.report_configuration();
        self.load_bounds();

        let x0 = self.nlp.nlp_starting_point()?;
        self.x = x0
            .iter()
            .enumerate()
            .map(|(i, &v)| v.max(self.var_lower[i]).min(self.var_upper[i]))
            .collect();
        self.removed.clear();
        self.evaluate_all(true)?;

        self.hessian = Coo::identity(self.num_vars).to_csr();
        self.lambda = vec![0.0; self.num_cons];
        self.mu = vec![INITIAL_MU; self.num_cons];
        self.con_types = constraint_types(&self.con_lower, &self.con_upper, self.opt.feas_tol);

        self.set_state(State::ReadyToOptimize);
        Ok(())
    }

    /// Advances the state machine by one stage.
    pub fn respond_to_data(&mut self) -> Result<()> {
        match self.state {
            State::Instantiated => self.prepare_to_optimize()?,
            State::ReadyToOptimize => self.prepare_line_search()?,
            State::ReadyForLineSearch | State::LineSearchIteration => self.take_step(),
            State::StepTaken => {
                self.test_step_taken()?;
                if self.state == State::LineSearchConverged {
                    self.prepare_for_next_iteration()?;
                    self.next_iteration()?;
                }
            }
            State::LineSearchConverged => {
                self.prepare_for_next_iteration()?;
                self.next_iteration()?;
            }
            State::ReadyForConvergenceTest => self.next_iteration()?,
            State::Finished
            | State::MaxIterCountReached
            | State::MaxFuncEvalsReached
            | State::StepTooSmall
            | State::FailedStepDirection
            | State::InfeasibleProblem => {}
        }
        Ok(())
    }

    /// Status, pending evaluation and current point for the host.
    pub fn check_status(&self) -> StatusReport {
        let eval_kind = match self.state {
            State::Instantiated | State::LineSearchConverged => EvalKind::All,
            State::ReadyForLineSearch | State::LineSearchIteration | State::StepTaken => {
                EvalKind::Functions
            }
            State::ReadyToOptimize
            | State::ReadyForConvergenceTest
            | State::Finished
            | State::MaxIterCountReached
            | State::MaxFuncEvalsReached
            | State::StepTooSmall
            | State::FailedStepDirection
            | State::InfeasibleProblem => EvalKind::None,
        };
        StatusReport {
            status: self.state.status(),
            eval_kind,
            iterations: self.iterations,
            x: self.user_x(),
            is_new_x: self.state == State::StepTaken,
        }
    }

    /// Runs the optimization until a terminal state is reached.
    pub fn optimize(&mut self) -> Result<Solution> {
        if self.state == State::Instantiated {
            self.prepare_to_optimize()?;
        }
        while !self.state.is_terminal() {
            self.respond_to_data()?;
        }
        Ok(self.solution())
    }

    /// The current point as a solution.
    pub fn solution(&self) -> Solution {
        let status = self.state.status();
        let max_con_violation = if self.full_con.is_empty() {
            0.0
        } else {
            self.nlp.max_user_con_violation(&self.full_con, &self.x)
        };
        Solution {
            x: self.user_x(),
            cost: self.nlp.shift_cost(self.cost, &self.x),
            exit_flag: status.code(),
            status,
            stats: IterationStats {
                iterations: self.iterations,
                fun_evals: self.fun_evals,
                qp_iterations: self.total_qp_iterations,
                elastic: self.nlp.is_elastic(),
                elastic_weight: self.nlp.elastic_weight(),
                max_con_violation,
            },
        }
    }

    /// Current stage of the state machine.
    pub fn state(&self) -> State {
        self.state
    }

    /// Major iterations started so far.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Function evaluations made so far.
    pub fn fun_evals(&self) -> usize {
        self.fun_evals
    }

    /// Lagrange multipliers of the (compacted) NLP constraints.
    pub fn multipliers(&self) -> &[f64] {
        &self.lambda
    }

    /// Current approximation of the Hessian of the Lagrangian.
    pub fn hessian(&self) -> &CSR<usize, f64> {
        &self.hessian
    }

    /// The transformed problem.
    pub fn nlp(&self) -> &NlpTransform<P> {
        &self.nlp
    }

    fn user_x(&self) -> Vec<f64> {
        self.x.iter().take(self.nlp.num_user_vars()).copied().collect()
    }

    fn set_state(&mut self, state: State) {
        trace!("{:?} -> {:?}", self.state, state);
        self.state = state;
        match state {
            State::Finished => info!("{}", state.status()),
            State::MaxIterCountReached
            | State::MaxFuncEvalsReached
            | State::StepTooSmall
            | State::FailedStepDirection
            | State::InfeasibleProblem => warn!("{}", state.status()),
            _ => {}
        }
    }

    fn load_bounds(&mut self) {
        let bounds = self.nlp.nlp_bounds_info();
        self.var_lower = bounds.var_lower.clone();
        self.var_upper = bounds.var_upper.clone();
        self.con_lower = bounds.con_lower.clone();
        self.con_upper = bounds.con_upper.clone();
        self.max_step = self.nlp.max_var_step();
        let (num_vars, num_cons) = self.nlp.nlp_info();
        self.num_vars = num_vars;
        self.num_cons = num_cons;
    }

    fn evaluate_functions(&mut self, is_new_x: bool) -> Result<()> {
        let (cost, con) = self.nlp.evaluate_functions(&self.x, is_new_x)?;
        self.fun_evals += 1;
        self.cost = cost;
        self.con = compact(&con, &self.removed);
        self.full_con = con;
        Ok(())
    }

    fn evaluate_derivatives(&mut self) -> Result<()> {
        let (grad, jac) = self.nlp.evaluate_derivatives(&self.x, false)?;
        self.cost_grad = grad;
        self.jac = compact(&jac, &self.removed);
        Ok(())
    }

    fn evaluate_all(&mut self, is_new_x: bool) -> Result<()> {
        self.evaluate_functions(is_new_x)?;
        self.evaluate_derivatives()
    }

    fn violations(&self) -> Vec<f64> {
        violations(&self.con, &self.con_lower, &self.con_upper, &self.con_types)
    }

    /// Computes the search direction, updates the penalty weights and
    /// prepares the line search along it.
    fn prepare_line_search(&mut self) -> Result<()> {
        if self.iterations >= self.opt.max_it {
            self.set_state(State::MaxIterCountReached);
            return Ok(());
        }
        self.iterations += 1;
        self.strict_count += 1;

        if self.skips >= self.opt.max_skips {
            self.restore_minimum();
        }

        if !self.compute_search_direction()? {
            return Ok(());
        }

        let viol = self.violations();
        let raised = update_penalty(
            &mut self.mu,
            &self.px,
            &self.cost_grad,
            &self.hessian,
            &self.jac,
            &viol,
            &self.con_types,
            &self.plam,
        );
        if raised && self.iterations != 1 && !self.first_elastic_step {
            self.min.merit = self.min.cost + dot(&self.mu, &self.min.viol);
            self.min.decrease_cond = self.min.merit;
        }

        self.merit = merit(self.cost, &self.mu, &viol);
        self.alpha = 1.0;
        self.cost_old = self.cost;
        self.con_old = self.con.clone();
        self.full_con_old = self.full_con.clone();
        self.x_old = self.x.clone();
        self.grad_old = self.cost_grad.clone();
        self.jac_old = self.jac.clone();
        self.viol_old = viol;
        self.search_count = 0;

        if self.iterations == 1 || self.first_elastic_step {
            self.set_minimum_merit_values(self.merit, 0.0)?;
            self.first_elastic_step = false;
        }

        self.step_scale = step_scale(
            &self.x_old,
            &self.px,
            &self.var_lower,
            &self.var_upper,
            &self.max_step,
        );
        if self.step_scale == 0.0 {
            self.set_state(State::InfeasibleProblem);
            return Ok(());
        }
        self.set_state(State::ReadyForLineSearch);
        Ok(())
    }

    /// Returns `false` if no search direction could be found.
    fn compute_search_direction(&mut self) -> Result<bool> {
        let sol = self.solve_qp(self.iterations == 1)?;
        let sol = if sol.status == QpStatus::Optimal {
            sol
        } else if self.nlp.is_elastic() {
            warn!("QP subproblem failed in elastic mode: {:?}", sol.status);
            self.set_state(State::FailedStepDirection);
            return Ok(false);
        } else {
            warn!("QP subproblem failed ({:?}), entering elastic mode", sol.status);
            self.prepare_elastic_mode()?;
            self.first_elastic_step = true;
            let sol = self.solve_qp(true)?;
            if sol.status != QpStatus::Optimal {
                warn!("QP subproblem failed in elastic mode: {:?}", sol.status);
                self.set_state(State::FailedStepDirection);
                return Ok(false);
            }
            sol
        };

        self.remove_qp_rows(&sol.merged, &sol.dependent);
        if sol.multipliers.len() != self.num_cons {
            return Err(NlpError::DimensionMismatch {
                what: "QP multipliers",
                expected: self.num_cons,
                actual: sol.multipliers.len(),
            }
            .into());
        }
        self.plam = sub(&sol.multipliers, &self.lambda);
        self.px = sol.step;
        self.active_set = sol.active_set;
        self.qp_iterations = sol.iterations;
        Ok(true)
    }

    fn solve_qp(&mut self, check_duplicates: bool) -> Result<QpSolution> {
        let lower = sub(&self.con_lower, &self.con);
        let upper = sub(&self.con_upper, &self.con);
        let jacobian = sparse_jacobian(&self.jac, self.num_vars);
        let sol = self.qp.solve(&QpSubproblem {
            hessian: &self.hessian,
            gradient: &self.cost_grad,
            jacobian: &jacobian,
            lower: &lower,
            upper: &upper,
            working_set: &[],
            check_duplicates,
        })?;
        if sol.status == QpStatus::Optimal && sol.step.len() != self.num_vars {
            return Err(NlpError::DimensionMismatch {
                what: "QP step",
                expected: self.num_vars,
                actual: sol.step.len(),
            }
            .into());
        }
        self.total_qp_iterations += sol.iterations;
        Ok(sol)
    }

    /// Relaxes the problem with elastic variables. All variable and
    /// constraint indexed arrays are rebuilt.
    fn prepare_elastic_mode(&mut self) -> Result<()> {
        let old_rows = remaining(self.full_con.len(), &self.removed);

        self.nlp.set_elastic_mode(self.opt.elastic_weight);
        self.load_bounds();
        self.x = self.nlp.extend_point(&self.x);
        self.removed = Vec::new();
        self.evaluate_all(false)?;

        let mut mu = vec![INITIAL_MU; self.num_cons];
        for (k, &i) in old_rows.iter().enumerate() {
            mu[i] = self.mu[k];
        }
        self.mu = mu;
        self.lambda = vec![0.0; self.num_cons];
        self.hessian = Coo::identity(self.num_vars).to_csr();
        self.con_types = constraint_types(&self.con_lower, &self.con_upper, self.opt.feas_tol);
        Ok(())
    }

    /// Drops rows the QP found to duplicate another row or to depend on
    /// other equality rows. A kept duplicate takes the intersection of
    /// both bounds.
    fn remove_qp_rows(&mut self, merged: &[MergedRows], dependent: &[usize]) {
        if merged.is_empty() && dependent.is_empty() {
            return;
        }
        let rows = remaining(self.full_con.len(), &self.removed);
        let mut drop = Vec::with_capacity(merged.len() + dependent.len());
        for pair in merged {
            let (k, r) = (pair.kept, pair.removed);
            self.con_lower[k] = self.con_lower[k].max(self.con_lower[r]);
            self.con_upper[k] = self.con_upper[k].min(self.con_upper[r]);
            drop.push(r);
        }
        drop.extend_from_slice(dependent);
        self.removed.extend(drop.iter().map(|&r| rows[r]));
        self.removed.sort_unstable();

        compact_in_place(&mut self.con, &drop);
        compact_in_place(&mut self.con_lower, &drop);
        compact_in_place(&mut self.con_upper, &drop);
        compact_in_place(&mut self.jac, &drop);
        compact_in_place(&mut self.mu, &drop);
        compact_in_place(&mut self.lambda, &drop);
        compact_in_place(&mut self.min.con, &drop);
        compact_in_place(&mut self.min.viol, &drop);
        compact_in_place(&mut self.min.jac, &drop);
        self.num_cons -= drop.len();
        self.con_types = constraint_types(&self.con_lower, &self.con_upper, self.opt.feas_tol);

        debug!(
            "removed {} duplicated or dependent constraint rows, {} remain",
            drop.len(),
            self.num_cons
        );
    }

    fn restore_minimum(&mut self) {
        if self.min.x.len() == self.x.len() {
            debug!("restoring best point after {} relaxed steps", self.skips);
            let min = self.min.clone();
            self.x = min.x;
            self.cost = min.cost;
            self.con = min.con;
            self.full_con = min.full_con;
            self.cost_grad = min.cost_grad;
            self.jac = min.jac;
            self.alpha = min.alpha;
            self.hessian = min.hessian;
            self.merit_alpha = min.merit;
        } else {
            debug!("no best point to restore after {} relaxed steps", self.skips);
        }

        self.allow_skip = false;
        self.strict_count = 0;
        self.skips = 0;
        self.test_skipped = false;
    }

    fn set_minimum_merit_values(&mut self, merit: f64, decrease: f64) -> Result<()> {
        let (cost_grad, jac) = self.nlp.evaluate_derivatives(&self.x, false)?;
        self.min = MeritSnapshot {
            merit,
            decrease_cond: self.merit - decrease,
            x: self.x.clone(),
            cost: self.cost,
            con: self.con.clone(),
            full_con: self.full_con.clone(),
            viol: self.violations(),
            cost_grad,
            jac: compact(&jac, &self.removed),
            hessian: self.hessian.clone(),
            alpha: self.alpha,
        };
        Ok(())
    }

    fn take_step(&mut self) {
        self.search_count += 1;
        if self.search_count > self.opt.max_step_reductions {
            self.search_count = 0;
            self.failed_searches += 1;
            if self.failed_searches >= MAX_FAILED_SEARCHES {
                self.set_state(State::FailedStepDirection);
                return;
            }
            debug!("line search failed, restarting with an identity Hessian");
            self.x = self.x_old.clone();
            self.cost = self.cost_old;
            self.con = self.con_old.clone();
            self.full_con = self.full_con_old.clone();
            self.skips = 0;
            self.hessian = Coo::identity(self.num_vars).to_csr();
            self.test_skipped = false;
            self.allow_skip = false;
            self.set_state(State::ReadyToOptimize);
            return;
        }
        let scale = self.step_scale * self.alpha;
        self.step = self.px.iter().map(|p| scale * p).collect();
        self.x = add_scaled(&self.x_old, 1.0, &self.step);
        self.set_state(State::StepTaken);
    }

    /// Tests the trial point for sufficient decrease in the merit function.
    fn test_step_taken(&mut self) -> Result<()> {
        self.evaluate_functions(true)?;
        let viol = self.violations();
        self.merit_alpha = merit(self.cost, &self.mu, &viol);

        let dx = sub(&self.x, &self.x_old);
        let merit_pred = predicted_merit(
            self.cost_old,
            &self.grad_old,
            &self.mu,
            &self.viol_old,
            &self.jac_old,
            &dx,
        );
        let decrease = self.opt.eta * (self.merit - merit_pred);
        let sufficient = self.merit - decrease;

        if !self.allow_skip || self.strict_count < self.opt.strict_steps {
            // Also rejects NaN.
            if !(self.merit_alpha <= sufficient) {
                if self.fun_evals >= self.opt.max_fun_evals {
                    self.set_state(State::MaxFuncEvalsReached);
                    return Ok(());
                }
                let red = 0.5 / (1.0 - (self.merit - self.merit_alpha) / (self.merit - merit_pred));
                let red = if red > self.opt.tau && red <= 1.0 {
                    red
                } else {
                    self.opt.tau
                };
                self.alpha *= red;
                trace!("step rejected, merit {:e}, alpha = {:e}", self.merit_alpha, self.alpha);
                self.set_state(State::LineSearchIteration);
            } else {
                if self.merit_alpha <= self.min.merit {
                    self.set_minimum_merit_values(self.merit_alpha, decrease)?;
                    self.allow_skip = true;
                } else if self.merit_alpha <= self.min.decrease_cond && self.iterations != 1 {
                    self.allow_skip = true;
                }
                self.set_state(State::LineSearchConverged);
            }
            if self.test_skipped {
                if self.merit_alpha > self.merit {
                    self.skips += 1;
                } else {
                    self.test_skipped = false;
                    self.skips = 0;
                }
            }
        } else {
            if self.merit_alpha <= self.min.decrease_cond {
                self.skips = 0;
                self.set_minimum_merit_values(self.merit_alpha, decrease)?;
                if self.merit_alpha < sufficient {
                    self.allow_skip = true;
                }
            } else {
                self.skips += 1;
                self.test_skipped = true;
                self.allow_skip = false;
                debug!("relaxed step {} accepted without merit decrease", self.skips);
            }
            self.set_state(State::LineSearchConverged);
        }

        if self.skips >= self.opt.max_skips {
            self.set_state(State::LineSearchConverged);
        }
        Ok(())
    }

    /// Evaluates derivatives at the accepted point and updates the
    /// multipliers and the gradient of the Lagrangian.
    fn prepare_for_next_iteration(&mut self) -> Result<()> {
        self.failed_searches = 0;
        self.evaluate_derivatives()?;

        for (l, pl) in self.lambda.iter_mut().zip(&self.plam) {
            *l += self.alpha * pl;
        }
        let grad_lag_old = lagrangian_gradient(&self.grad_old, &self.jac_old, &self.lambda);
        self.grad_lagrangian = lagrangian_gradient(&self.cost_grad, &self.jac, &self.lambda);
        self.delta_grad_lagrangian = sub(&self.grad_lagrangian, &grad_lag_old);

        let viol = self.violations();
        self.max_con_violation = if viol.iter().any(|v| v.is_nan()) {
            f64::NAN
        } else {
            viol.iter().fold(0.0, |m: f64, &v| m.max(v))
        };

        self.report_iteration();
        self.set_state(State::ReadyForConvergenceTest);
        Ok(())
    }

    fn next_iteration(&mut self) -> Result<()> {
        self.check_if_finished()?;
        if self.state == State::LineSearchIteration {
            self.prepare_line_search()?;
        }
        Ok(())
    }

    fn check_if_finished(&mut self) -> Result<()> {
        let converged = self.check_convergence()?;
        if converged == Convergence::NotConverged {
            match update_hessian(
                self.opt.hessian_update,
                &mut self.hessian,
                &self.step,
                &self.delta_grad_lagrangian,
            ) {
                Ok(kind) => {
                    self.update_kind = kind;
                    if self.merit_alpha == self.min.merit {
                        self.min.hessian = self.hessian.clone();
                    }
                }
                Err(_) => {
                    self.set_state(State::StepTooSmall);
                    return Ok(());
                }
            }
        }

        match converged {
            Convergence::NotConverged => {
                if self.fun_evals >= self.opt.max_fun_evals {
                    self.set_state(State::MaxFuncEvalsReached);
                } else {
                    self.set_state(State::LineSearchIteration);
                }
            }
            Convergence::Infeasible => self.set_state(State::InfeasibleProblem),
            Convergence::Gradient | Convergence::FunctionChange => {
                debug!("converged: {:?}", converged);
                self.set_state(State::Finished);
            }
        }
        Ok(())
    }

    fn check_convergence(&mut self) -> Result<Convergence> {
        let elastic = self.nlp.is_elastic();
        let feasible = self.max_con_violation < self.opt.feas_tol;
        let satisfied = if elastic {
            feasible && self.nlp.max_elastic_var(&self.x) <= MIN_ELASTIC_VAR
        } else {
            feasible
        };

        if elastic && !satisfied && self.nlp.elastic_weight() < self.opt.max_elastic_weight {
            self.escalate_elastic_weight()?;
            return Ok(Convergence::NotConverged);
        }

        let df = self.cost - self.cost_old;
        let fun_change = if self.cost_old.abs() > TINY_COST {
            (df / self.cost_old).abs()
        } else {
            df.abs()
        };
        let stationary = if norm_inf(&self.grad_lagrangian) < self.opt.grad_tol {
            Some(Convergence::Gradient)
        } else if fun_change < self.opt.cost_tol {
            Some(Convergence::FunctionChange)
        } else {
            None
        };

        Ok(match stationary {
            Some(kind) if satisfied => kind,
            // Elastic weight is at its limit.
            Some(_) if elastic => Convergence::Infeasible,
            _ => Convergence::NotConverged,
        })
    }

    /// Raises the elastic weight and re-prices the cost and its gradient
    /// at the current point.
    fn escalate_elastic_weight(&mut self) -> Result<()> {
        let weight = (self.nlp.elastic_weight() * self.opt.elastic_weight_growth)
            .min(self.opt.max_elastic_weight);
        self.nlp.set_elastic_weight(weight);
        info!("elastic weight raised to {}", weight);
        self.evaluate_all(false)
    }

    fn report_configuration(&self) {
        let (n, m) = self.nlp.nlp_info();
        info!(
            "SQP: {} variables ({} user), {} constraints ({} user)",
            n,
            self.nlp.num_user_vars(),
            m,
            self.nlp.num_user_cons()
        );
        info!(
            "Hessian update: {}, feas_tol = {:e}, grad_tol = {:e}, cost_tol = {:e}, max_it = {}, max_fun_evals = {}",
            self.opt.hessian_update,
            self.opt.feas_tol,
            self.opt.grad_tol,
            self.opt.cost_tol,
            self.opt.max_it,
            self.opt.max_fun_evals
        );
    }

    fn report_iteration(&self) {
        let cost = self.nlp.shift_cost(self.cost, &self.x);
        let max_con = self.nlp.max_user_con_violation(&self.full_con, &self.x);

        if self.iterations % 10 == 1 {
            debug!(
                "{:>5} {:>6} {:>12} {:>7} {:>14} {:>12} {:>14}  {}",
                "iter", "qp it", "alpha", "active", "cost", "max con", "merit", "update"
            );
        }
        debug!(
            "{:>5} {:>6} {:>12.5e} {:>7} {:>14.6e} {:>12.4e} {:>14.6e}  {}",
            self.iterations,
            self.qp_iterations,
            self.alpha,
            self.active_set.len(),
            cost,
            max_con,
            self.merit_alpha,
            self.update_kind
        );

        if let Some(progress) = &self.progress {
            progress.update(
                self.iterations,
                self.qp_iterations,
                self.alpha,
                self.active_set.len(),
                cost,
                max_con,
                self.merit_alpha,
            );
        }
    }
}

/// `J` as a sparse matrix with `n` columns.
fn sparse_jacobian(jac: &[Vec<f64>], n: usize) -> CSR<usize, f64> {
    if jac.is_empty() {
        CSR::with_size(0, n)
    } else {
        CSR::from_dense(jac)
    }
}

/// Returns `g - J'*lambda`.
fn lagrangian_gradient(grad: &[f64], jac: &[Vec<f64>], lambda: &[f64]) -> Vec<f64> {
    if jac.is_empty() {
        return grad.to_vec();
    }
    let jac_t: CSR<usize, f64> = CSC::from_dense(jac).t();
    sub(grad, &(&jac_t * &lambda))
}
