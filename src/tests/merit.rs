use crate::merit::*;
use float_cmp::assert_approx_eq;
use sparsetools::coo::Coo;

const INF: f64 = f64::INFINITY;

#[test]
fn classify() {
    let types = constraint_types(&[1.0, 0.0, 2.0], &[1.0, INF, 2.0 + 1e-6], 1e-4);
    assert_eq!(
        types,
        vec![
            ConstraintType::Equality,
            ConstraintType::Inequality,
            ConstraintType::Equality
        ]
    );
}

#[test]
fn constraint_violations() {
    let lower = [1.0, 0.0, -INF, 0.0];
    let upper = [1.0, 2.0, 3.0, INF];
    let types = constraint_types(&lower, &upper, 1e-4);

    let viol = violations(&[0.25, 3.0, 1.0, -0.5], &lower, &upper, &types);
    assert_eq!(viol, vec![0.75, 1.0, 0.0, 0.5]);

    assert_approx_eq!(f64, merit(2.0, &[1.0, 2.0, 3.0, 4.0], &viol), 6.75);
}

#[test]
fn prediction() {
    let jac = vec![vec![1.0, 1.0]];
    let pred = predicted_merit(5.0, &[-4.0, -2.0], &[2.0], &[0.5], &jac, &[1.0, 0.5]);
    // 5 - 4 - 1 + 2*(0.5 + 1.5)
    assert_approx_eq!(f64, pred, 4.0);
}

#[test]
fn step_limits() {
    let lower = [0.0, -INF];
    let upper = [1.0, INF];
    let unlimited = [1e300, 1e300];

    // Hits x0 <= 1 half way.
    assert_approx_eq!(f64, step_scale(&[0.0, 0.0], &[2.0, 5.0], &lower, &upper, &unlimited), 0.5);
    // Limited by the maximum step of x1.
    let limited = [1e300, 1.0];
    assert_approx_eq!(f64, step_scale(&[0.0, 0.0], &[0.5, 4.0], &lower, &upper, &limited), 0.25);
    // Already on the bound and moving out.
    assert_eq!(step_scale(&[1.0, 0.0], &[1.0, 0.0], &lower, &upper, &unlimited), 0.0);
    // Crossing by rounding noise only.
    assert_eq!(step_scale(&[0.5, 0.0], &[0.5 + 1e-15, 0.0], &lower, &upper, &unlimited), 1.0);
}

#[test]
fn penalty_not_needed_for_descent() {
    let mut mu = vec![1e-20];
    let raised = update_penalty(
        &mut mu,
        &[-1.0, 1.0],
        &[2.0, 0.0],
        &Coo::identity(2).to_csr(),
        &[vec![1.0, 1.0]],
        &[0.0],
        &[ConstraintType::Equality],
        &[1.0],
    );
    assert!(!raised);
    assert_eq!(mu, vec![1e-20]);
}

#[test]
fn penalty_raised() {
    // p'g + p'Hp/2 = 2 + 2 > 0 and the step removes a violation of 2.
    let mut mu = vec![1e-20];
    let raised = update_penalty(
        &mut mu,
        &[-2.0, 0.0],
        &[-1.0, 0.0],
        &Coo::identity(2).to_csr(),
        &[vec![1.0, 0.0]],
        &[2.0],
        &[ConstraintType::Equality],
        &[3.0],
    );
    assert!(raised);
    assert_approx_eq!(f64, mu[0], 2.0, epsilon = 1e-12);
}
