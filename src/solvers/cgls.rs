//! CGLS solver
//!
//! Conjugate gradient for least squares: minimises ||Ax - b||₂ through
//! the implicit normal equations AᵀA x = Aᵀb, touching A only through
//! `apply` and `apply_adjoint`.
//!
//! Reference:
//! Hestenes & Stiefel, "Methods of conjugate gradients for solving
//! linear systems", J Res NBS 1952 (CGLS variant).

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{SvrError, SvrResult};
use crate::recon::LinearOperator;

/// Solver options
#[derive(Debug, Clone)]
pub struct CglsOptions {
    /// Relative tolerance on ||Aᵀ(b - Ax)|| / ||Aᵀb||
    pub tol: f64,
    /// Iteration cap; the last iterate is returned when it is reached
    pub max_iter: usize,
}

impl Default for CglsOptions {
    fn default() -> Self {
        CglsOptions { tol: 1e-4, max_iter: 10 }
    }
}

/// Solution report
#[derive(Debug, Clone)]
pub struct CglsSolution {
    pub x: Vec<f64>,
    pub iterations: usize,
    /// Final relative normal-equation residual
    pub residual: f64,
}

fn norm2(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum()
}

/// Solve min ||Ax - b||₂ with conjugate gradients
///
/// `x0` warm-starts the iteration. The `cancel` flag is checked once
/// per iteration; setting it aborts the solve with `Cancelled`.
/// Failure to reach `tol` within `max_iter` is not an error.
pub fn cgls_solve(
    op: &dyn LinearOperator,
    b: &[f64],
    x0: Option<&[f64]>,
    opts: &CglsOptions,
    cancel: Option<&AtomicBool>,
) -> SvrResult<CglsSolution> {
    let m = op.rows();
    let n = op.cols();
    assert_eq!(b.len(), m, "rhs length must match operator rows");

    let mut x = match x0 {
        Some(x0) => {
            assert_eq!(x0.len(), n, "warm start length must match operator cols");
            x0.to_vec()
        }
        None => vec![0.0; n],
    };

    // r = b - A x
    let mut r = b.to_vec();
    let warm = x.iter().any(|&v| v != 0.0);
    let mut q = vec![0.0; m];
    if warm {
        op.apply(&x, &mut q);
        for (ri, &qi) in r.iter_mut().zip(q.iter()) {
            *ri -= qi;
        }
    }

    // s = Aᵀ r, and the convergence reference ||Aᵀ b||
    let mut s = vec![0.0; n];
    op.apply_adjoint(&r, &mut s);
    let mut gamma = norm2(&s);

    let atb2 = if warm {
        let mut atb = vec![0.0; n];
        op.apply_adjoint(b, &mut atb);
        norm2(&atb)
    } else {
        gamma
    };
    if atb2 == 0.0 {
        return Ok(CglsSolution { x, iterations: 0, residual: 0.0 });
    }
    let threshold2 = opts.tol * opts.tol * atb2;

    if gamma <= threshold2 {
        return Ok(CglsSolution { x, iterations: 0, residual: (gamma / atb2).sqrt() });
    }

    let mut p = s.clone();
    let mut iterations = 0;

    for it in 1..=opts.max_iter {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(SvrError::Cancelled { iteration: it });
            }
        }

        op.apply(&p, &mut q);
        let qq = norm2(&q);
        if qq == 0.0 {
            break;
        }
        let alpha = gamma / qq;

        for (xi, &pi) in x.iter_mut().zip(p.iter()) {
            *xi += alpha * pi;
        }
        for (ri, &qi) in r.iter_mut().zip(q.iter()) {
            *ri -= alpha * qi;
        }

        op.apply_adjoint(&r, &mut s);
        let gamma_new = norm2(&s);
        iterations = it;

        if gamma_new <= threshold2 {
            gamma = gamma_new;
            break;
        }

        let beta = gamma_new / gamma;
        gamma = gamma_new;
        for (pi, &si) in p.iter_mut().zip(s.iter()) {
            *pi = si + beta * *pi;
        }
    }

    Ok(CglsSolution { x, iterations, residual: (gamma / atb2).sqrt() })
}
