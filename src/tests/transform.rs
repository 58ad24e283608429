use crate::*;
use anyhow::Result;
use float_cmp::assert_approx_eq;

const BIG: f64 = 1e300;

/// min sum(x^2)
/// s.t. -1 <= x0 + 2*x3 <= 1
///
/// x0 free, x1 >= 0, x2 <= 2 and x3 effectively free.
struct Mixed;

impl Problem for Mixed {
    fn nlp_info(&self) -> Result<(usize, usize)> {
        Ok((4, 1))
    }

    fn starting_point(&self) -> Result<Vec<f64>> {
        Ok(vec![0.0; 4])
    }

    fn bounds_info(&self, _num_vars: usize, _num_cons: usize) -> Result<Bounds> {
        Ok(Bounds {
            var_lower: vec![f64::NEG_INFINITY, 0.0, -BIG, -BIG],
            var_upper: vec![f64::INFINITY, f64::INFINITY, 2.0, BIG],
            con_lower: vec![-1.0],
            con_upper: vec![1.0],
        })
    }

    fn cost(&mut self, x: &[f64], _is_new_x: bool) -> Result<f64> {
        Ok(x.iter().map(|v| v * v).sum())
    }

    fn cost_gradient(&mut self, x: &[f64], _is_new_x: bool) -> Result<Vec<f64>> {
        Ok(x.iter().map(|v| 2.0 * v).collect())
    }

    fn constraints(&mut self, x: &[f64], _is_new_x: bool) -> Result<Vec<f64>> {
        Ok(vec![x[0] + 2.0 * x[3]])
    }

    fn constraint_jacobian(&mut self, _x: &[f64], _is_new_x: bool) -> Result<Vec<Vec<f64>>> {
        Ok(vec![vec![1.0, 0.0, 0.0, 2.0]])
    }
}

const X: [f64; 4] = [1.0, 2.0, 3.0, 4.0];

#[test]
fn bound_rows() {
    let mut nlp = NlpTransform::new(Mixed).unwrap();
    assert_eq!(nlp.nlp_info(), (4, 3));

    let b = nlp.nlp_bounds_info();
    assert_eq!(b.con_lower, vec![-1.0, 0.0, -BIG]);
    assert_eq!(b.con_upper, vec![1.0, f64::INFINITY, 2.0]);
    assert_eq!(b.var_lower.len(), 4);

    let (cost, con) = nlp.evaluate_functions(&X, true).unwrap();
    assert_eq!(cost, 30.0);
    assert_eq!(con, vec![9.0, 2.0, 3.0]);

    let (grad, jac) = nlp.evaluate_derivatives(&X, false).unwrap();
    assert_eq!(grad, vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(
        jac,
        vec![
            vec![1.0, 0.0, 0.0, 2.0],
            vec![0.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0, 0.0],
        ]
    );
}

#[test]
fn prepare_is_idempotent() {
    let mut nlp = NlpTransform::new(Mixed).unwrap();
    nlp.set_elastic_mode(3.0);
    let bounds = nlp.nlp_bounds_info().clone();
    let jac = nlp.jacobian().to_vec();

    nlp.prepare_arrays();
    let again = nlp.nlp_bounds_info();
    assert_eq!(again.var_lower, bounds.var_lower);
    assert_eq!(again.var_upper, bounds.var_upper);
    assert_eq!(again.con_lower, bounds.con_lower);
    assert_eq!(again.con_upper, bounds.con_upper);
    assert_eq!(nlp.jacobian(), &jac[..]);
}

#[test]
fn elastic_layout() {
    let mut nlp = NlpTransform::new(Mixed).unwrap();
    nlp.set_elastic_mode(10.0);
    assert!(nlp.is_elastic());
    assert_eq!(nlp.num_elastic_vars(), 2);
    assert_eq!(nlp.nlp_info(), (6, 5));

    let x = nlp.extend_point(&X);
    assert_eq!(x, vec![1.0, 2.0, 3.0, 4.0, 1.0, 1.0]);

    let b = nlp.nlp_bounds_info();
    assert_eq!(&b.var_lower[4..], &[0.0, 0.0]);
    assert_eq!(b.con_lower, vec![-1.0, 0.0, -BIG, 0.0, 0.0]);

    let eval = nlp.evaluate_all(&x, true).unwrap();
    assert_eq!(eval.cost, 50.0);
    assert_eq!(eval.constraints, vec![9.0, 2.0, 3.0, 1.0, 1.0]);
    assert_eq!(eval.cost_gradient, vec![2.0, 4.0, 6.0, 8.0, 10.0, 10.0]);
    assert_eq!(eval.jacobian[0], vec![1.0, 0.0, 0.0, 2.0, -1.0, 1.0]);
    assert_eq!(eval.jacobian[3], vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    assert_eq!(eval.jacobian[4], vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);

    nlp.set_elastic_weight(100.0);
    let (grad, _) = nlp.evaluate_derivatives(&x, false).unwrap();
    assert_eq!(&grad[4..], &[100.0, 100.0]);
}

#[test]
fn elastic_cost_shift() {
    let mut nlp = NlpTransform::new(Mixed).unwrap();
    for weight in [1.0, 10.0, 1234.5] {
        nlp.set_elastic_mode(weight);
        let x = [1.0, 2.0, 3.0, 4.0, 0.25, 0.75];
        let (cost, _) = nlp.evaluate_functions(&x, true).unwrap();
        assert_approx_eq!(f64, cost, 30.0 + weight, epsilon = 1e-9);
        assert_approx_eq!(f64, nlp.shift_cost(cost, &x), 30.0, epsilon = 1e-9);
    }
}

#[test]
fn elastic_variables() {
    let mut nlp = NlpTransform::new(Mixed).unwrap();
    assert_eq!(
        nlp.elastic_v(&X),
        Err(NlpError::NotElastic("elastic variable v"))
    );
    assert!(nlp.elastic_w(&X).is_err());
    assert_eq!(nlp.max_elastic_var(&X), 0.0);

    nlp.set_elastic_mode(1.0);
    let x = [1.0, 2.0, 3.0, 4.0, 0.5, 8.5];
    assert_eq!(nlp.elastic_v(&x).unwrap(), &[0.5]);
    assert_eq!(nlp.elastic_w(&x).unwrap(), &[8.5]);
    assert_eq!(nlp.max_elastic_var(&x), 8.5);

    // The user constraint x0 + 2*x3 = 9 exceeds its upper bound by 8
    // whatever the elastic variables are.
    let (_, con) = nlp.evaluate_functions(&x, true).unwrap();
    assert_eq!(con[0], 17.0);
    assert_approx_eq!(f64, nlp.max_user_con_violation(&con, &x), 8.0, epsilon = 1e-12);
}

#[test]
fn starting_point() {
    let mut nlp = NlpTransform::new(Mixed).unwrap();
    assert_eq!(nlp.nlp_starting_point().unwrap(), vec![0.0; 4]);
    nlp.set_elastic_mode(1.0);
    assert_eq!(
        nlp.nlp_starting_point().unwrap(),
        vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0]
    );
    assert_eq!(nlp.max_var_step().len(), 6);
}
