use crate::common::HessianUpdate;
use crate::math::{dot, symmetrize};
use sparsetools::csr::CSR;
use std::fmt;

/// Curvature below which the self-scaled update is skipped.
const MIN_CURVATURE: f64 = 1e-10;

/// The update formula actually applied on an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Bfgs,
    DampedBfgs,
    SelfScaledBfgs,
    NoUpdate,
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateKind::Bfgs => "BFGS",
            UpdateKind::DampedBfgs => "Damped BFGS",
            UpdateKind::SelfScaledBfgs => "Self Scaled BFGS",
            UpdateKind::NoUpdate => "No Update",
        };
        write!(f, "{}", s)
    }
}

/// Raised when an update would divide by zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTooSmall;

/// Updates the approximate Hessian of the Lagrangian `H` given the step
/// `s` and the change in the gradient of the Lagrangian `y`.
///
/// An updated `H` is symmetrized. On error `H` is left unchanged.
pub fn update_hessian(
    method: HessianUpdate,
    h_mat: &mut CSR<usize, f64>,
    s: &[f64],
    y: &[f64],
) -> Result<UpdateKind, StepTooSmall> {
    let hs = &*h_mat * &s;
    let s_hs = dot(s, &hs);
    let sy = dot(s, y);

    let kind = match method {
        HessianUpdate::DampedBfgs => {
            let (theta, kind) = if sy >= 0.1 * s_hs {
                (1.0, UpdateKind::Bfgs)
            } else {
                (0.9 * s_hs / (s_hs - sy), UpdateKind::DampedBfgs)
            };
            let r: Vec<f64> = y
                .iter()
                .zip(&hs)
                .map(|(yi, hsi)| theta * yi + (1.0 - theta) * hsi)
                .collect();
            let sr = dot(s, &r);
            *h_mat = rank_two(h_mat, 1.0, &hs, s_hs, &r, sr)?;
            kind
        }
        HessianUpdate::SelfScaledBfgs => {
            if sy >= s_hs && sy > MIN_CURVATURE {
                *h_mat = rank_two(h_mat, 1.0, &hs, s_hs, y, sy)?;
                UpdateKind::Bfgs
            } else if sy > MIN_CURVATURE && sy <= s_hs {
                let gamma = sy / s_hs;
                *h_mat = rank_two(h_mat, gamma, &hs, s_hs, y, sy)?;
                UpdateKind::SelfScaledBfgs
            } else {
                UpdateKind::NoUpdate
            }
        }
    };
    Ok(kind)
}

/// Returns `gamma*(H - Hs*Hs'/sHs) + r*r'/sr`, symmetrized.
fn rank_two(
    h_mat: &CSR<usize, f64>,
    gamma: f64,
    hs: &[f64],
    s_hs: f64,
    r: &[f64],
    sr: f64,
) -> Result<CSR<usize, f64>, StepTooSmall> {
    if s_hs == 0.0 || sr == 0.0 || !gamma.is_finite() {
        return Err(StepTooSmall);
    }
    let mut h_new = h_mat.to_coo().to_dense();
    for (i, row) in h_new.iter_mut().enumerate() {
        for (j, hij) in row.iter_mut().enumerate() {
            *hij = gamma * (*hij - hs[i] * hs[j] / s_hs) + r[i] * r[j] / sr;
        }
    }
    symmetrize(&mut h_new);
    if h_new.iter().flatten().any(|v| !v.is_finite()) {
        return Err(StepTooSmall);
    }
    Ok(CSR::from_dense(&h_new))
}
