//! Shell classification of the diffusion gradient table
//!
//! Buckets volumes into b-value shells. Two b-values belong to the same
//! shell when they differ by less than the clustering epsilon (80
//! s/mm², the conventional scanner jitter bound); anything below the
//! b=0 threshold is grouped into a single lowest shell.

use crate::error::{SvrError, SvrResult};
use crate::table::Matrix;

const BVALUE_EPSILON: f64 = 80.0;
const BZERO_THRESHOLD: f64 = 50.0;

/// One b-value shell: mean b-value and member volume indices
#[derive(Debug, Clone)]
pub struct Shell {
    pub bvalue: f64,
    pub volumes: Vec<usize>,
}

impl Shell {
    pub fn count(&self) -> usize {
        self.volumes.len()
    }
}

/// Ordered shell partition of a gradient table (ascending b-value)
#[derive(Debug, Clone)]
pub struct Shells {
    shells: Vec<Shell>,
}

impl Shells {
    /// Classify the gradient table (rows of [gx, gy, gz, b])
    pub fn new(grad: &Matrix) -> SvrResult<Self> {
        if grad.cols() < 4 {
            return Err(SvrError::InvalidArgument(format!(
                "gradient table must have at least 4 columns, got {}", grad.cols()
            )));
        }
        if !grad.is_finite() {
            return Err(SvrError::Numeric("non-finite entries in gradient table".into()));
        }

        // Sort volumes by b-value, then sweep into clusters
        let nv = grad.rows();
        let mut order: Vec<usize> = (0..nv).collect();
        order.sort_by(|&a, &b| grad[(a, 3)].partial_cmp(&grad[(b, 3)]).unwrap());

        let mut shells: Vec<Shell> = Vec::new();
        for &v in &order {
            let b = grad[(v, 3)].max(0.0);
            let b = if b < BZERO_THRESHOLD { 0.0 } else { b };
            match shells.last_mut() {
                Some(shell) if (b - shell.bvalue).abs() < BVALUE_EPSILON => {
                    // Running mean keeps the shell centre representative
                    let n = shell.count() as f64;
                    shell.bvalue = (shell.bvalue * n + b) / (n + 1.0);
                    shell.volumes.push(v);
                }
                _ => shells.push(Shell { bvalue: b, volumes: vec![v] }),
            }
        }

        for shell in &mut shells {
            shell.volumes.sort_unstable();
        }
        Ok(Shells { shells })
    }

    pub fn count(&self) -> usize {
        self.shells.len()
    }

    pub fn get(&self, s: usize) -> &Shell {
        &self.shells[s]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Shell> {
        self.shells.iter()
    }

    /// Shell with the most volumes (ties broken towards higher b)
    pub fn largest(&self) -> &Shell {
        self.shells
            .iter()
            .max_by(|a, b| {
                a.count()
                    .cmp(&b.count())
                    .then(a.bvalue.partial_cmp(&b.bvalue).unwrap())
            })
            .expect("shell partition is never empty")
    }

    /// Total map volume -> shell index over nv volumes
    pub fn shell_index(&self, nv: usize) -> Vec<usize> {
        let mut idx = vec![0usize; nv];
        for (s, shell) in self.shells.iter().enumerate() {
            for &v in &shell.volumes {
                idx[v] = s;
            }
        }
        idx
    }
}
