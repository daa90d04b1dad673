//! Common test utilities for the reconstruction integration tests

use svr_core::kernels::Ssp;
use svr_core::mapping::ReconMapping;
use svr_core::qspace::QSpaceBasis;
use svr_core::table::{parse_matrix, Matrix};
use svr_core::transform::{GridTransform, IDENTITY};

/// Relative L2 error between two vectors
pub fn rel_err(a: &[f64], b: &[f64]) -> f64 {
    let diff: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
    let norm: f64 = b.iter().map(|y| y * y).sum();
    (diff / norm.max(1e-30)).sqrt()
}

/// Relative L2 error restricted to voxels at least `margin` away from
/// the grid boundary, over all coefficient channels
pub fn rel_err_interior(
    a: &[f64],
    b: &[f64],
    dims: [usize; 3],
    nc: usize,
    margin: usize,
) -> f64 {
    let [nx, ny, nz] = dims;
    let nxyz = nx * ny * nz;
    let mut diff = 0.0;
    let mut norm = 0.0;
    for c in 0..nc {
        for k in margin..nz - margin {
            for j in margin..ny - margin {
                for i in margin..nx - margin {
                    let idx = c * nxyz + i + j * nx + k * nx * ny;
                    let d = a[idx] - b[idx];
                    diff += d * d;
                    norm += b[idx] * b[idx];
                }
            }
        }
    }
    (diff / norm.max(1e-30)).sqrt()
}

/// Six well-spread unit gradient directions at the given b-value
pub fn six_dir_grad(b: f64) -> Matrix {
    let mut m = parse_matrix(
        "1 0 0 0\n0 1 0 0\n0 0 1 0\n0.7071 0.7071 0 0\n0 0.7071 0.7071 0\n0.7071 0 0.7071 0\n",
    )
    .unwrap();
    for v in 0..m.rows() {
        m[(v, 3)] = b;
    }
    m
}

/// Smooth synthetic coefficient field: one low-frequency pattern per
/// channel, flattened with the coefficient axis slowest
pub fn smooth_phantom(dims: [usize; 3], nc: usize) -> Vec<f64> {
    let [nx, ny, nz] = dims;
    let nxyz = nx * ny * nz;
    let mut x = vec![0.0; nc * nxyz];
    for c in 0..nc {
        let fx = 1.0 + 0.3 * c as f64;
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let u = i as f64 / nx as f64;
                    let v = j as f64 / ny as f64;
                    let w = k as f64 / nz as f64;
                    x[c * nxyz + i + j * nx + k * nx * ny] = 1.0
                        + 0.5 * (fx * std::f64::consts::PI * u).sin()
                        + 0.3 * (std::f64::consts::PI * v).cos()
                        + 0.2 * (std::f64::consts::PI * w).sin()
                        + 0.1 * c as f64;
                }
            }
        }
    }
    x
}

/// Deterministic pseudo-random values in [-0.5, 0.5]
pub fn pseudo_random(n: usize, seed: u64) -> Vec<f64> {
    let mut state = seed.max(1);
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state as f64 / u64::MAX as f64) - 0.5
        })
        .collect()
}

/// Mapping and q-space basis on an identity-affine grid
pub fn build_components(
    dims: [usize; 3],
    grad: &Matrix,
    motion: &Matrix,
    lmax: usize,
) -> (ReconMapping, QSpaceBasis) {
    let t = GridTransform::new(IDENTITY);
    let qspace = QSpaceBasis::new(grad, lmax, &[], motion, dims[2]).unwrap();
    let mapping = ReconMapping::new(
        dims,
        grad.rows(),
        &t,
        dims,
        &t,
        motion,
        Ssp::default(),
    )
    .unwrap();
    (mapping, qspace)
}
