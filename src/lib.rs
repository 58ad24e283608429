mod common;
mod compact;
mod error;
mod hessian;
mod linsol;
mod math;
mod merit;
mod nlp;
mod qp;
mod sqp;
#[cfg(test)]
mod tests;
mod traits;

pub use common::*;
pub use error::NlpError;
pub use hessian::{update_hessian, StepTooSmall, UpdateKind};
pub use nlp::{Evaluation, NlpTransform};
pub use qp::{ActiveSetQp, MergedRows, QpSolution, QpStatus, QpSubproblem};
pub use sqp::Sqp;
pub use traits::*;
