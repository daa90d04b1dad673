//! Discrete Laplacian regularisation operators
//!
//! 6-neighbour Laplacian on a 3-D grid and a 1-D second difference
//! along z only, both with Neumann (zero-flux) boundaries: a missing
//! neighbour contributes nothing, so each stencil row sums to zero and
//! the operators are symmetric (self-adjoint).
//!
//! Index convention follows the rest of the crate:
//! idx = x + y*nx + z*nx*ny.

/// Apply the 3-D 6-neighbour Laplacian (in-place into `out`)
pub fn laplacian3d(x: &[f64], out: &mut [f64], nx: usize, ny: usize, nz: usize) {
    assert_eq!(x.len(), nx * ny * nz);
    assert_eq!(out.len(), nx * ny * nz);
    let nxy = nx * ny;

    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let idx = i + j * nx + k * nxy;
                let c = x[idx];
                let mut acc = 0.0;
                if i > 0 {
                    acc += x[idx - 1] - c;
                }
                if i + 1 < nx {
                    acc += x[idx + 1] - c;
                }
                if j > 0 {
                    acc += x[idx - nx] - c;
                }
                if j + 1 < ny {
                    acc += x[idx + nx] - c;
                }
                if k > 0 {
                    acc += x[idx - nxy] - c;
                }
                if k + 1 < nz {
                    acc += x[idx + nxy] - c;
                }
                out[idx] = acc;
            }
        }
    }
}

/// Apply the 1-D second difference along z (in-place into `out`)
pub fn second_diff_z(x: &[f64], out: &mut [f64], nx: usize, ny: usize, nz: usize) {
    assert_eq!(x.len(), nx * ny * nz);
    assert_eq!(out.len(), nx * ny * nz);
    let nxy = nx * ny;

    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let idx = i + j * nx + k * nxy;
                let c = x[idx];
                let mut acc = 0.0;
                if k > 0 {
                    acc += x[idx - nxy] - c;
                }
                if k + 1 < nz {
                    acc += x[idx + nxy] - c;
                }
                out[idx] = acc;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    fn test_field(n: usize, scale: f64) -> Vec<f64> {
        (0..n).map(|i| ((i as f64) * scale).sin() + 0.3 * (i as f64 * 0.11).cos()).collect()
    }

    #[test]
    fn test_laplacian_constant_is_zero() {
        let (nx, ny, nz) = (5, 4, 3);
        let x = vec![2.5; nx * ny * nz];
        let mut out = vec![0.0; nx * ny * nz];
        laplacian3d(&x, &mut out, nx, ny, nz);
        for (i, v) in out.iter().enumerate() {
            assert!(v.abs() < 1e-14, "Laplacian of constant should vanish at {}", i);
        }
    }

    #[test]
    fn test_second_diff_z_constant_is_zero() {
        let (nx, ny, nz) = (4, 4, 5);
        let x = vec![-1.0; nx * ny * nz];
        let mut out = vec![0.0; nx * ny * nz];
        second_diff_z(&x, &mut out, nx, ny, nz);
        for v in &out {
            assert!(v.abs() < 1e-14);
        }
    }

    #[test]
    fn test_laplacian_linear_ramp_interior() {
        // Laplacian of a linear ramp vanishes at interior points; the
        // Neumann boundary leaves a non-zero residual on the faces
        let (nx, ny, nz) = (6, 6, 6);
        let mut x = vec![0.0; nx * ny * nz];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    x[i + j * nx + k * nx * ny] = i as f64;
                }
            }
        }
        let mut out = vec![0.0; nx * ny * nz];
        laplacian3d(&x, &mut out, nx, ny, nz);
        for k in 0..nz {
            for j in 0..ny {
                for i in 1..nx - 1 {
                    let v = out[i + j * nx + k * nx * ny];
                    assert!(v.abs() < 1e-14, "interior ramp Laplacian should vanish, got {}", v);
                }
            }
        }
        // boundary faces see the one-sided stencil
        assert!((out[0] - 1.0).abs() < 1e-14);
        assert!((out[nx - 1] + 1.0).abs() < 1e-14);
    }

    #[test]
    fn test_laplacian_self_adjoint() {
        // <L a, b> == <a, L b> (Neumann stencil is symmetric)
        let (nx, ny, nz) = (5, 6, 4);
        let n = nx * ny * nz;
        let a = test_field(n, 0.37);
        let b = test_field(n, 0.59);
        let mut la = vec![0.0; n];
        let mut lb = vec![0.0; n];
        laplacian3d(&a, &mut la, nx, ny, nz);
        laplacian3d(&b, &mut lb, nx, ny, nz);
        let lhs = dot(&la, &b);
        let rhs = dot(&a, &lb);
        assert!(
            (lhs - rhs).abs() < 1e-10 * lhs.abs().max(1.0),
            "Laplacian should be self-adjoint: {} vs {}", lhs, rhs
        );
    }

    #[test]
    fn test_second_diff_z_self_adjoint() {
        let (nx, ny, nz) = (4, 3, 7);
        let n = nx * ny * nz;
        let a = test_field(n, 0.21);
        let b = test_field(n, 0.83);
        let mut la = vec![0.0; n];
        let mut lb = vec![0.0; n];
        second_diff_z(&a, &mut la, nx, ny, nz);
        second_diff_z(&b, &mut lb, nx, ny, nz);
        let lhs = dot(&la, &b);
        let rhs = dot(&a, &lb);
        assert!((lhs - rhs).abs() < 1e-10 * lhs.abs().max(1.0));
    }

    #[test]
    fn test_second_diff_z_stencil() {
        // Interior: x[k-1] - 2 x[k] + x[k+1]
        let (nx, ny, nz) = (1, 1, 5);
        let x = vec![0.0, 1.0, 4.0, 9.0, 16.0];
        let mut out = vec![0.0; nz];
        second_diff_z(&x, &mut out, nx, ny, nz);
        for k in 1..nz - 1 {
            assert!((out[k] - 2.0).abs() < 1e-14, "quadratic should give 2, got {}", out[k]);
        }
        assert!((out[0] - 1.0).abs() < 1e-14);
        assert!((out[nz - 1] + 7.0).abs() < 1e-14);
    }
}
