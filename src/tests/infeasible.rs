use crate::*;
use anyhow::Result;
use float_cmp::assert_approx_eq;
use spsolve::rlu::RLU;

/// min x^2
/// s.t. x >= 5
///      x <= 1
struct Contradiction;

impl Problem for Contradiction {
    fn nlp_info(&self) -> Result<(usize, usize)> {
        Ok((1, 1))
    }

    fn starting_point(&self) -> Result<Vec<f64>> {
        Ok(vec![0.0])
    }

    fn bounds_info(&self, _num_vars: usize, _num_cons: usize) -> Result<Bounds> {
        Ok(Bounds {
            var_lower: vec![f64::NEG_INFINITY],
            var_upper: vec![1.0],
            con_lower: vec![5.0],
            con_upper: vec![f64::INFINITY],
        })
    }

    fn cost(&mut self, x: &[f64], _is_new_x: bool) -> Result<f64> {
        Ok(x[0] * x[0])
    }

    fn cost_gradient(&mut self, x: &[f64], _is_new_x: bool) -> Result<Vec<f64>> {
        Ok(vec![2.0 * x[0]])
    }

    fn constraints(&mut self, x: &[f64], _is_new_x: bool) -> Result<Vec<f64>> {
        Ok(vec![x[0]])
    }

    fn constraint_jacobian(&mut self, _x: &[f64], _is_new_x: bool) -> Result<Vec<Vec<f64>>> {
        Ok(vec![vec![1.0]])
    }
}

#[test]
fn escalates_to_max_weight() {
    let qp = ActiveSetQp::new(RLU::default());
    let mut sqp = Sqp::new(Contradiction, qp, Options::default()).unwrap();
    let sol = sqp.optimize().unwrap();

    assert_eq!(sol.exit_flag, 6);
    assert_eq!(sol.status, Status::Infeasible);
    assert!(sol.stats.elastic);
    assert_eq!(sol.stats.elastic_weight, 10000.0);

    // Closest point to x >= 5 within x <= 1.
    assert_eq!(sol.x.len(), 1);
    assert_approx_eq!(f64, sol.x[0], 1.0, epsilon = 1e-6);
    assert_approx_eq!(f64, sol.cost, 1.0, epsilon = 1e-6);
    assert_approx_eq!(f64, sol.stats.max_con_violation, 4.0, epsilon = 1e-6);

    // x, v and w
    let nlp = sqp.nlp();
    assert!(nlp.is_elastic());
    assert_eq!(nlp.nlp_info(), (3, 4));
}

#[test]
fn lower_weight_limit() {
    let opt = Options {
        max_elastic_weight: 100.0,
        ..Default::default()
    };
    let qp = ActiveSetQp::new(RLU::default());
    let mut sqp = Sqp::new(Contradiction, qp, opt).unwrap();
    let sol = sqp.optimize().unwrap();

    assert_eq!(sol.exit_flag, 6);
    assert_eq!(sol.stats.elastic_weight, 100.0);
    assert!(sol.stats.iterations < 10);
}
