//! Exact penalty merit function and the quantities derived from it.

use crate::math::dot;
use sparsetools::csr::CSR;

/// Bound crossings smaller than this (relative) are rounding noise.
const BOUND_TOL: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintType {
    Equality,
    Inequality,
}

/// Constraints with bounds closer than `feas_tol` are equalities.
pub fn constraint_types(lower: &[f64], upper: &[f64], feas_tol: f64) -> Vec<ConstraintType> {
    lower
        .iter()
        .zip(upper)
        .map(|(lb, ub)| {
            if (ub - lb).abs() >= feas_tol {
                ConstraintType::Inequality
            } else {
                ConstraintType::Equality
            }
        })
        .collect()
}

/// Magnitude by which each constraint violates its bounds.
pub fn violations(
    con: &[f64],
    lower: &[f64],
    upper: &[f64],
    types: &[ConstraintType],
) -> Vec<f64> {
    (0..con.len())
        .map(|i| match types[i] {
            ConstraintType::Equality => (con[i] - lower[i]).abs(),
            ConstraintType::Inequality => {
                if upper[i] - con[i] < 0.0 {
                    (upper[i] - con[i]).abs()
                } else if con[i] - lower[i] < 0.0 {
                    (con[i] - lower[i]).abs()
                } else {
                    0.0
                }
            }
        })
        .collect()
}

/// `cost + sum(mu*viol)`
pub fn merit(cost: f64, mu: &[f64], viol: &[f64]) -> f64 {
    cost + dot(mu, viol)
}

/// First order prediction of the merit function after moving `dx`
/// from the point where `cost`, `grad`, `viol` and `jac` were evaluated.
pub fn predicted_merit(
    cost: f64,
    grad: &[f64],
    mu: &[f64],
    viol: &[f64],
    jac: &[Vec<f64>],
    dx: &[f64],
) -> f64 {
    let penalty: f64 = (0..mu.len())
        .map(|i| mu[i] * (viol[i] + dot(&jac[i], dx)))
        .sum();
    cost + dot(grad, dx) + penalty
}

/// Raises the penalty weights `mu` so that the search direction `p` is a
/// descent direction of the merit function (Nocedal & Wright, 18.36).
///
/// `plam` is the change in the multipliers predicted by the QP.
/// Returns `true` if any weight was changed.
pub fn update_penalty(
    mu: &mut [f64],
    p: &[f64],
    grad: &[f64],
    h_mat: &CSR<usize, f64>,
    jac: &[Vec<f64>],
    viol: &[f64],
    types: &[ConstraintType],
    plam: &[f64],
) -> bool {
    let pg = dot(p, grad);
    if pg + 0.5 * dot(p, &(h_mat * &p)) <= 0.0 {
        return false;
    }
    let mut sigma = 2.0 * pg.abs();
    let mu_sum_min = 1.5 * pg.abs();

    let pred: Vec<f64> = (0..mu.len())
        .map(|i| {
            let pj = dot(p, &jac[i]);
            match types[i] {
                ConstraintType::Equality => viol[i].abs() - (viol[i] + pj).abs(),
                ConstraintType::Inequality => viol[i].abs() - (viol[i] - pj).abs(),
            }
        })
        .collect();
    let mu_sum = dot(mu, &pred);
    if mu_sum >= mu_sum_min {
        return false;
    }

    let scale: f64 = plam.iter().zip(&pred).map(|(l, r)| (l * r).abs()).sum();
    if !(scale > 0.0) {
        return false;
    }
    sigma = (sigma - mu_sum) / scale;
    for (mi, li) in mu.iter_mut().zip(plam) {
        *mi = mi.max(sigma * li.abs());
    }
    true
}

/// Largest factor in (0, 1] by which the step `p` from `x` can be
/// scaled without exceeding `max_step` or leaving `[lower, upper]`.
pub fn step_scale(x: &[f64], p: &[f64], lower: &[f64], upper: &[f64], max_step: &[f64]) -> f64 {
    let mut factor: f64 = 1.0;
    for i in 0..x.len() {
        if max_step[i].abs() < p[i].abs() {
            factor = factor.min((max_step[i] / p[i]).abs());
        }
        let xp = x[i] + p[i];
        if xp < lower[i] - BOUND_TOL * (1.0 + lower[i].abs()) {
            factor = factor.min(((lower[i] - x[i]) / p[i]).abs());
        } else if xp > upper[i] + BOUND_TOL * (1.0 + upper[i].abs()) {
            factor = factor.min(((upper[i] - x[i]) / p[i]).abs());
        }
    }
    factor
}
