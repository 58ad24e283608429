use crate::*;
use anyhow::Result;
use spsolve::rlu::RLU;

/// Declares `declared` constraints but returns `returned`, with an
/// optional ragged Jacobian.
struct Misreported {
    declared: usize,
    returned: usize,
    ragged: bool,
    start_len: usize,
    bounds: Bounds,
}

impl Default for Misreported {
    fn default() -> Self {
        Self {
            declared: 2,
            returned: 2,
            ragged: false,
            start_len: 2,
            bounds: Bounds::default(),
        }
    }
}

impl Problem for Misreported {
    fn nlp_info(&self) -> Result<(usize, usize)> {
        Ok((2, self.declared))
    }

    fn starting_point(&self) -> Result<Vec<f64>> {
        Ok(vec![0.5; self.start_len])
    }

    fn bounds_info(&self, _num_vars: usize, _num_cons: usize) -> Result<Bounds> {
        Ok(self.bounds.clone())
    }

    fn cost(&mut self, x: &[f64], _is_new_x: bool) -> Result<f64> {
        Ok(x[0] + x[1])
    }

    fn cost_gradient(&mut self, _x: &[f64], _is_new_x: bool) -> Result<Vec<f64>> {
        Ok(vec![1.0, 1.0])
    }

    fn constraints(&mut self, x: &[f64], _is_new_x: bool) -> Result<Vec<f64>> {
        Ok(vec![x[0] * x[1]; self.returned])
    }

    fn constraint_jacobian(&mut self, x: &[f64], _is_new_x: bool) -> Result<Vec<Vec<f64>>> {
        let mut jac = vec![vec![x[1], x[0]]; self.returned];
        if self.ragged {
            if let Some(row) = jac.last_mut() {
                row.pop();
            }
        }
        Ok(jac)
    }
}

fn new_sqp(problem: Misreported, opt: Options) -> Result<Sqp<Misreported, ActiveSetQp<RLU>>> {
    Sqp::new(problem, ActiveSetQp::new(RLU::default()), opt)
}

fn nlp_error(result: Result<Sqp<Misreported, ActiveSetQp<RLU>>>) -> NlpError {
    match result {
        Ok(_) => panic!("expected an error"),
        Err(err) => err.downcast::<NlpError>().unwrap(),
    }
}

#[test]
fn consistent_problem() {
    assert!(new_sqp(Misreported::default(), Options::default()).is_ok());
}

#[test]
fn constraint_count_mismatch() {
    let problem = Misreported {
        returned: 1,
        ..Default::default()
    };
    let err = nlp_error(new_sqp(problem, Options::default()));
    assert_eq!(
        err,
        NlpError::DimensionMismatch {
            what: "constraint values",
            expected: 2,
            actual: 1,
        }
    );
}

#[test]
fn starting_point_mismatch() {
    let problem = Misreported {
        start_len: 3,
        ..Default::default()
    };
    let err = nlp_error(new_sqp(problem, Options::default()));
    assert!(matches!(
        err,
        NlpError::DimensionMismatch {
            what: "starting point",
            expected: 2,
            actual: 3
        }
    ));
}

#[test]
fn bound_length_mismatch() {
    let problem = Misreported {
        bounds: Bounds {
            var_lower: vec![0.0],
            ..Default::default()
        },
        ..Default::default()
    };
    let err = nlp_error(new_sqp(problem, Options::default()));
    assert!(matches!(err, NlpError::DimensionMismatch { expected: 2, actual: 1, .. }));
}

#[test]
fn ragged_jacobian() {
    let problem = Misreported {
        ragged: true,
        ..Default::default()
    };
    let err = nlp_error(new_sqp(problem, Options::default()));
    assert_eq!(
        err,
        NlpError::RaggedJacobian {
            row: 1,
            len: 1,
            num_vars: 2,
        }
    );
}

#[test]
fn invalid_options() {
    let opt = Options {
        eta: 1.5,
        ..Default::default()
    };
    let err = nlp_error(new_sqp(Misreported::default(), opt));
    assert!(matches!(err, NlpError::InvalidOption { name: "eta", .. }));

    let opt = Options {
        elastic_weight_growth: 1.0,
        ..Default::default()
    };
    assert!(opt.validate().is_err());

    let opt = Options {
        max_it: 0,
        ..Default::default()
    };
    assert!(opt.validate().is_err());

    let opt = Options {
        max_skips: 0,
        ..Default::default()
    };
    let err = nlp_error(new_sqp(Misreported::default(), opt));
    assert!(matches!(err, NlpError::InvalidOption { name: "max_skips", .. }));

    // No strict iterations after a roll back is allowed.
    let opt = Options {
        strict_steps: 0,
        ..Default::default()
    };
    assert!(opt.validate().is_ok());

    assert!(Options::default().validate().is_ok());
}

#[test]
fn status_codes() {
    let codes: Vec<i32> = [
        State::Instantiated,
        State::ReadyForLineSearch,
        State::Finished,
        State::MaxIterCountReached,
        State::MaxFuncEvalsReached,
        State::StepTooSmall,
        State::FailedStepDirection,
        State::InfeasibleProblem,
    ]
    .iter()
    .map(|s| s.status().code())
    .collect();
    assert_eq!(codes, vec![0, -1, 1, 2, 3, 4, 5, 6]);

    assert!(!State::StepTaken.is_terminal());
    assert!(State::InfeasibleProblem.is_terminal());
}
