use crate::error::NlpError;
use std::fmt;

/// Quasi-Newton formula used to update the Hessian of the Lagrangian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HessianUpdate {
    /// Powell-damped BFGS.
    DampedBfgs,
    /// Self-scaled BFGS.
    SelfScaledBfgs,
}

impl fmt::Display for HessianUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HessianUpdate::DampedBfgs => write!(f, "DampedBFGS"),
            HessianUpdate::SelfScaledBfgs => write!(f, "SelfScaledBFGS"),
        }
    }
}

pub struct Options {
    /// Termination tolerance on constraint violation.
    pub feas_tol: f64,
    /// Termination tolerance on the infinity norm of the gradient
    /// of the Lagrangian.
    pub grad_tol: f64,
    /// Termination tolerance on the relative change in cost.
    pub cost_tol: f64,

    /// Maximum number of major iterations.
    pub max_it: usize,
    /// Maximum number of function evaluations.
    pub max_fun_evals: usize,

    /// Hessian update method.
    pub hessian_update: HessianUpdate,

    /// Elastic weight used when elastic mode is first entered.
    pub elastic_weight: f64,
    /// Elastic weight is not escalated beyond this value.
    pub max_elastic_weight: f64,
    /// Factor applied to the elastic weight on each escalation.
    pub elastic_weight_growth: f64,

    /// Sufficient decrease parameter of the line search.
    pub eta: f64,
    /// Smallest step length reduction factor of the line search.
    pub tau: f64,
    /// Consecutive relaxed steps allowed before rolling back to the
    /// best point found.
    pub max_skips: usize,
    /// Iterations of strict line search forced after a roll back.
    pub strict_steps: usize,
    /// Step length reductions before a search direction is abandoned.
    pub max_step_reductions: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            feas_tol: 1e-4,
            grad_tol: 1e-4,
            cost_tol: 1e-4,
            max_it: 200,
            max_fun_evals: 1000,
            hessian_update: HessianUpdate::SelfScaledBfgs,
            elastic_weight: 1.0,
            max_elastic_weight: 10000.0,
            elastic_weight_growth: 10.0,
            eta: 0.1,
            tau: 0.1,
            max_skips: 3,
            strict_steps: 10,
            max_step_reductions: 20,
        }
    }
}

impl Options {
    /// Checks that the option values are usable.
    pub fn validate(&self) -> Result<(), NlpError> {
        let positive = [
            ("feas_tol", self.feas_tol),
            ("grad_tol", self.grad_tol),
            ("cost_tol", self.cost_tol),
            ("elastic_weight", self.elastic_weight),
            ("max_elastic_weight", self.max_elastic_weight),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(NlpError::InvalidOption {
                    name,
                    value,
                    reason: "must be greater than 0",
                });
            }
        }
        if self.eta <= 0.0 || self.eta >= 1.0 {
            return Err(NlpError::InvalidOption {
                name: "eta",
                value: self.eta,
                reason: "must be between 0 and 1",
            });
        }
        if self.tau <= 0.0 || self.tau >= 1.0 {
            return Err(NlpError::InvalidOption {
                name: "tau",
                value: self.tau,
                reason: "must be between 0 and 1",
            });
        }
        if self.elastic_weight_growth <= 1.0 {
            return Err(NlpError::InvalidOption {
                name: "elastic_weight_growth",
                value: self.elastic_weight_growth,
                reason: "must be greater than 1",
            });
        }
        let counts = [
            ("max_it", self.max_it),
            ("max_fun_evals", self.max_fun_evals),
            ("max_skips", self.max_skips),
            ("max_step_reductions", self.max_step_reductions),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(NlpError::InvalidOption {
                    name,
                    value: 0.0,
                    reason: "must be at least 1",
                });
            }
        }
        Ok(())
    }
}

/// Stages of the optimizer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Instantiated,
    ReadyToOptimize,
    ReadyForLineSearch,
    LineSearchIteration,
    StepTaken,
    LineSearchConverged,
    ReadyForConvergenceTest,
    Finished,
    MaxIterCountReached,
    MaxFuncEvalsReached,
    StepTooSmall,
    FailedStepDirection,
    InfeasibleProblem,
}

impl State {
    /// Terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            State::Finished
                | State::MaxIterCountReached
                | State::MaxFuncEvalsReached
                | State::StepTooSmall
                | State::FailedStepDirection
                | State::InfeasibleProblem
        )
    }

    pub fn status(&self) -> Status {
        match self {
            State::Instantiated
            | State::ReadyToOptimize
            | State::StepTaken
            | State::LineSearchConverged
            | State::ReadyForConvergenceTest => Status::InProgress,
            State::ReadyForLineSearch | State::LineSearchIteration => Status::AwaitingEvaluation,
            State::Finished => Status::Converged,
            State::MaxIterCountReached => Status::MaxIterations,
            State::MaxFuncEvalsReached => Status::MaxFunEvals,
            State::StepTooSmall => Status::StepTooSmall,
            State::FailedStepDirection => Status::FailedStepDirection,
            State::InfeasibleProblem => Status::Infeasible,
        }
    }
}

/// Status reported to the host driving the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    InProgress,
    AwaitingEvaluation,
    Converged,
    MaxIterations,
    MaxFunEvals,
    StepTooSmall,
    FailedStepDirection,
    Infeasible,
}

impl Status {
    /// Numeric status code.
    pub fn code(&self) -> i32 {
        match self {
            Status::InProgress => 0,
            Status::AwaitingEvaluation => -1,
            Status::Converged => 1,
            Status::MaxIterations => 2,
            Status::MaxFunEvals => 3,
            Status::StepTooSmall => 4,
            Status::FailedStepDirection => 5,
            Status::Infeasible => 6,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Status::InProgress => "Optimization in progress",
            Status::AwaitingEvaluation => "Optimization is waiting for new function values",
            Status::Converged => "Optimization converged to given tolerance",
            Status::MaxIterations => "Optimization failed: the maximum number of iterations was reached",
            Status::MaxFunEvals => {
                "Optimization failed: the maximum number of function evaluations was reached"
            }
            Status::StepTooSmall => {
                "Optimization failed: the step size became too small to update the Hessian"
            }
            Status::FailedStepDirection => {
                "Optimization failed: a search direction that reduces the merit function could not be found"
            }
            Status::Infeasible => {
                "Optimization failed: no feasible solution found, the problem appears to be infeasible"
            }
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// Kind of evaluation pending at the current point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalKind {
    None,
    /// Cost and constraint values only.
    Functions,
    /// Values and derivatives.
    All,
}

/// Snapshot returned by `Sqp::check_status`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: Status,
    pub eval_kind: EvalKind,
    pub iterations: usize,
    /// Current user decision vector.
    pub x: Vec<f64>,
    pub is_new_x: bool,
}

/// Counters describing a finished (or interrupted) run.
#[derive(Debug, Clone, Default)]
pub struct IterationStats {
    /// Major (SQP) iterations.
    pub iterations: usize,
    /// Function evaluations.
    pub fun_evals: usize,
    /// Total QP subproblem iterations.
    pub qp_iterations: usize,
    /// Set if elastic mode was entered.
    pub elastic: bool,
    /// Final elastic weight (0 if elastic mode was never entered).
    pub elastic_weight: f64,
    /// Largest violation of the user constraints at the solution.
    pub max_con_violation: f64,
}

/// Result of `Sqp::optimize`.
#[derive(Debug, Clone)]
pub struct Solution {
    /// User decision vector.
    pub x: Vec<f64>,
    /// User objective function value (elastic penalty removed).
    pub cost: f64,
    /// Final status code, see [`Status::code`].
    pub exit_flag: i32,
    pub status: Status,
    pub stats: IterationStats,
}
