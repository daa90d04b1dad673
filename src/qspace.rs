//! Q-space basis for slice-wise reconstruction
//!
//! Builds the per-shell embedding matrices that map the full even-order
//! SH vector into the component basis (optionally through multi-shell
//! radial basis functions), and the per-slice design rows
//! `y_{v,z} = B_{shell(v)} · delta(R_{v,z} · g_v)` where `R_{v,z}` is
//! the rotation part of the rigid motion for that slice. Rotation acts
//! on the gradient direction only; q-space is orientation-only.

use crate::error::{SvrError, SvrResult};
use crate::sh;
use crate::shells::Shells;
use crate::table::Matrix;
use crate::transform::{rotate, rotation_xyz};

/// Per-slice SH design rows and shell embedding
#[derive(Debug, Clone)]
pub struct QSpaceBasis {
    lmax: usize,
    ncoef: usize,
    nz: usize,
    nv: usize,
    shell_basis: Vec<Matrix>,
    shell_idx: Vec<usize>,
    rows: Matrix,
}

impl QSpaceBasis {
    /// Build the design rows for the selected volumes
    ///
    /// `grad` holds one [gx, gy, gz, b] row per selected volume,
    /// `motion` holds nv or nv*nz rigid parameter rows, `rf` is the
    /// optional list of radial basis matrices (one row per shell).
    pub fn new(
        grad: &Matrix,
        lmax: usize,
        rf: &[Matrix],
        motion: &Matrix,
        nz: usize,
    ) -> SvrResult<Self> {
        let nv = grad.rows();
        let shells = Shells::new(grad)?;
        let nshells = shells.count();

        for (k, r) in rf.iter().enumerate() {
            if r.rows() != nshells {
                return Err(SvrError::InvalidArgument(format!(
                    "radial basis {} has {} rows but the data has {} shells",
                    k, r.rows(), nshells
                )));
            }
        }

        let ncoef = get_ncoefs(rf, lmax);
        let shell_basis = init_shell_basis(rf, lmax, nshells, ncoef);
        let shell_idx = shells.shell_index(nv);

        // Design rows: one per (volume, slice). With per-volume motion
        // the SH delta is evaluated once per volume and shared across
        // its slices.
        let n_lmax = sh::n_for_l(lmax);
        let per_slice = motion.rows() == nv * nz;
        let mut rows = Matrix::new(nv * nz, ncoef);

        for v in 0..nv {
            let g = grad.row(v);
            let dir = [g[0], g[1], g[2]];
            let basis = &shell_basis[shell_idx[v]];

            let mut delta = if per_slice {
                Vec::new()
            } else {
                let rot = motion_rotation(motion.row(v));
                sh::delta(rotate(&rot, dir), lmax)
            };

            for z in 0..nz {
                if per_slice {
                    let rot = motion_rotation(motion.row(v * nz + z));
                    delta = sh::delta(rotate(&rot, dir), lmax);
                }
                let out = rows.row_mut(v * nz + z);
                for c in 0..ncoef {
                    let mut sum = 0.0;
                    for i in 0..n_lmax {
                        sum += basis[(c, i)] * delta[i];
                    }
                    out[c] = sum;
                }
            }
        }

        Ok(QSpaceBasis { lmax, ncoef, nz, nv, shell_basis, shell_idx, rows })
    }

    pub fn lmax(&self) -> usize {
        self.lmax
    }

    /// Number of q-space basis coefficients per voxel
    pub fn ncoef(&self) -> usize {
        self.ncoef
    }

    pub fn nshells(&self) -> usize {
        self.shell_basis.len()
    }

    pub fn nvolumes(&self) -> usize {
        self.nv
    }

    /// Embedding matrix B_s of shell s (ncoef x n_for_l(lmax))
    pub fn shell_basis(&self, s: usize) -> &Matrix {
        &self.shell_basis[s]
    }

    pub fn shell_of(&self, v: usize) -> usize {
        self.shell_idx[v]
    }

    /// Design row for slice (v, z)
    pub fn row(&self, v: usize, z: usize) -> &[f64] {
        self.rows.row(v * self.nz + z)
    }

    /// SH series of shell s for one voxel's coefficient vector: B_sᵀ x
    pub fn shell_sh(&self, s: usize, coefs: &[f64], out: &mut [f64]) {
        let basis = &self.shell_basis[s];
        let n_lmax = sh::n_for_l(self.lmax);
        debug_assert_eq!(coefs.len(), self.ncoef);
        debug_assert_eq!(out.len(), n_lmax);
        for i in 0..n_lmax {
            let mut sum = 0.0;
            for c in 0..self.ncoef {
                sum += basis[(c, i)] * coefs[c];
            }
            out[i] = sum;
        }
    }

    /// Least-squares inverse of the stacked shell bases
    ///
    /// Factors the Gram matrix Σ_s B_s B_sᵀ once; the returned
    /// projector then maps per-voxel stacks of per-shell SH series back
    /// to coefficient vectors.
    pub fn init_projector(&self) -> InitProjector<'_> {
        let nc = self.ncoef;
        let n_lmax = sh::n_for_l(self.lmax);
        let mut gram = vec![0.0; nc * nc];
        for basis in &self.shell_basis {
            for a in 0..nc {
                for b in 0..nc {
                    let mut sum = 0.0;
                    for i in 0..n_lmax {
                        sum += basis[(a, i)] * basis[(b, i)];
                    }
                    gram[a * nc + b] += sum;
                }
            }
        }
        cholesky_factor(&mut gram, nc);
        InitProjector { qspace: self, chol: gram }
    }
}

/// Prefactored solver for warm-start projection (see
/// [`QSpaceBasis::init_projector`])
pub struct InitProjector<'a> {
    qspace: &'a QSpaceBasis,
    chol: Vec<f64>,
}

impl InitProjector<'_> {
    /// Coefficient vector from stacked per-shell SH series of one voxel
    ///
    /// Solves (Σ_s B_s B_sᵀ) x = Σ_s B_s h_s; `per_shell` holds
    /// nshells consecutive n_for_l(lmax) blocks.
    pub fn project(&self, per_shell: &[f64], out: &mut [f64]) {
        let q = self.qspace;
        let nc = q.ncoef;
        let n_lmax = sh::n_for_l(q.lmax);
        debug_assert_eq!(per_shell.len(), q.nshells() * n_lmax);
        debug_assert_eq!(out.len(), nc);

        let mut rhs = vec![0.0; nc];
        for (s, basis) in q.shell_basis.iter().enumerate() {
            let h = &per_shell[s * n_lmax..(s + 1) * n_lmax];
            for a in 0..nc {
                let mut sum = 0.0;
                for i in 0..n_lmax {
                    sum += basis[(a, i)] * h[i];
                }
                rhs[a] += sum;
            }
        }
        cholesky_solve_factored(&self.chol, &rhs, out, nc);
    }
}

/// Number of coefficients spanned by the radial basis (or plain SH)
fn get_ncoefs(rf: &[Matrix], lmax: usize) -> usize {
    if rf.is_empty() {
        sh::n_for_l(lmax)
    } else {
        rf.iter()
            .map(|r| sh::n_for_l((2 * (r.cols() - 1)).min(lmax)))
            .sum()
    }
}

/// Per-shell embedding matrices B_s (ncoef x n_for_l(lmax))
fn init_shell_basis(rf: &[Matrix], lmax: usize, nshells: usize, ncoef: usize) -> Vec<Matrix> {
    let n_lmax = sh::n_for_l(lmax);
    let mut basis = Vec::with_capacity(nshells);

    for s in 0..nshells {
        let b = if rf.is_empty() {
            Matrix::identity(n_lmax)
        } else {
            let mut b = Matrix::new(ncoef, n_lmax);
            let mut j = 0;
            for r in rf {
                for l in 0..r.cols() {
                    if 2 * l > lmax {
                        break;
                    }
                    // columns of harmonic band 2l
                    let start = (2 * l).saturating_sub(1) * l;
                    for i in start..(l + 1) * (2 * l + 1) {
                        b[(j, i)] = r[(s, l)];
                        j += 1;
                    }
                }
            }
            b
        };
        basis.push(b);
    }
    basis
}

fn motion_rotation(p: &[f64]) -> [[f64; 3]; 3] {
    rotation_xyz(p[3], p[4], p[5])
}

/// Cholesky-factor the symmetric positive-definite matrix G in place
///
/// Plain lower-triangular factorisation with a tiny diagonal floor.
/// Sized for the small Gram systems here (nc x nc).
fn cholesky_factor(g: &mut [f64], n: usize) {
    for i in 0..n {
        for j in 0..=i {
            let mut sum = g[i * n + j];
            for k in 0..j {
                sum -= g[i * n + k] * g[j * n + k];
            }
            if i == j {
                g[i * n + i] = sum.max(1e-12).sqrt();
            } else {
                g[i * n + j] = sum / g[j * n + j];
            }
        }
    }
}

/// Solve L Lᵀ x = b from a factor produced by `cholesky_factor`
fn cholesky_solve_factored(g: &[f64], b: &[f64], x: &mut [f64], n: usize) {
    // forward substitution L y = b
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= g[i * n + k] * x[k];
        }
        x[i] = sum / g[i * n + i];
    }
    // back substitution Lᵀ x = y
    for i in (0..n).rev() {
        let mut sum = x[i];
        for k in i + 1..n {
            sum -= g[k * n + i] * x[k];
        }
        x[i] = sum / g[i * n + i];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::parse_matrix;

    fn six_dir_grad(b: f64) -> Matrix {
        let mut m = parse_matrix(
            "1 0 0 1\n0 1 0 1\n0 0 1 1\n0.7071 0.7071 0 1\n0 0.7071 0.7071 1\n0.7071 0 0.7071 1\n",
        )
        .unwrap();
        for v in 0..m.rows() {
            m[(v, 3)] = b;
        }
        m
    }

    #[test]
    fn test_single_shell_identity_embedding() {
        let grad = six_dir_grad(1000.0);
        let motion = Matrix::new(6, 6);
        let q = QSpaceBasis::new(&grad, 2, &[], &motion, 4).unwrap();
        assert_eq!(q.ncoef(), 6);
        assert_eq!(q.nshells(), 1);
        assert_eq!(q.shell_basis(0), &Matrix::identity(6));
    }

    #[test]
    fn test_rows_match_delta_without_motion() {
        let grad = six_dir_grad(1000.0);
        let motion = Matrix::new(6, 6);
        let q = QSpaceBasis::new(&grad, 4, &[], &motion, 3).unwrap();
        for v in 0..6 {
            let g = grad.row(v);
            let expected = sh::delta([g[0], g[1], g[2]], 4);
            for z in 0..3 {
                let row = q.row(v, z);
                for (i, (&a, &e)) in row.iter().zip(expected.iter()).enumerate() {
                    assert!((a - e).abs() < 1e-13, "row ({},{}) coef {} mismatch", v, z, i);
                }
            }
        }
    }

    #[test]
    fn test_rotation_equivariance() {
        // Row built with motion rotation R equals the row of the
        // pre-rotated gradient with identity motion
        let grad = six_dir_grad(1000.0);
        let angles = [0.2, -0.35, 0.5];
        let mut motion = Matrix::new(6, 6);
        for v in 0..6 {
            motion.row_mut(v)[3..6].copy_from_slice(&angles);
        }
        let q_moved = QSpaceBasis::new(&grad, 4, &[], &motion, 2).unwrap();

        let rot = rotation_xyz(angles[0], angles[1], angles[2]);
        let mut grad_rot = grad.clone();
        for v in 0..6 {
            let g = grad.row(v);
            let r = rotate(&rot, [g[0], g[1], g[2]]);
            grad_rot.row_mut(v)[..3].copy_from_slice(&r);
        }
        let q_static = QSpaceBasis::new(&grad_rot, 4, &[], &Matrix::new(6, 6), 2).unwrap();

        for v in 0..6 {
            for (i, (&a, &b)) in q_moved.row(v, 0).iter().zip(q_static.row(v, 0).iter()).enumerate() {
                assert!((a - b).abs() < 1e-12, "volume {} coef {}: {} vs {}", v, i, a, b);
            }
        }
    }

    #[test]
    fn test_per_slice_motion_rows_differ() {
        let grad = six_dir_grad(1000.0);
        let nz = 3;
        let mut motion = Matrix::new(6 * nz, 6);
        for r in 0..motion.rows() {
            motion.row_mut(r)[3] = 0.1 * r as f64;
        }
        let q = QSpaceBasis::new(&grad, 2, &[], &motion, nz).unwrap();
        // different slices of the same volume see different rotations
        let a = q.row(1, 0);
        let b = q.row(1, 2);
        let diff: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum();
        assert!(diff > 1e-6, "per-slice rotations should change the rows");
    }

    #[test]
    fn test_b0_volume_isotropic_row() {
        let grad = parse_matrix("0 0 0 0\n1 0 0 1000\n0 1 0 1000\n0 0 1 1000\n").unwrap();
        let motion = Matrix::new(4, 6);
        let q = QSpaceBasis::new(&grad, 4, &[], &motion, 2).unwrap();
        let row = q.row(0, 0);
        assert!(row[0] > 0.0);
        for &v in &row[1..] {
            assert_eq!(v, 0.0, "b=0 row should be l=0 only");
        }
    }

    #[test]
    fn test_ones_radial_basis_matches_plain_sh() {
        // A single all-ones radial response over one shell reproduces
        // the plain SH design
        let grad = six_dir_grad(1000.0);
        let motion = Matrix::new(6, 6);
        let lmax = 4;
        let rf = Matrix::from_vec(vec![1.0; lmax / 2 + 1], 1, lmax / 2 + 1);
        let q_rf = QSpaceBasis::new(&grad, lmax, &[rf], &motion, 2).unwrap();
        let q_plain = QSpaceBasis::new(&grad, lmax, &[], &motion, 2).unwrap();
        assert_eq!(q_rf.ncoef(), q_plain.ncoef());
        for v in 0..6 {
            for (i, (&a, &b)) in q_rf.row(v, 0).iter().zip(q_plain.row(v, 0).iter()).enumerate() {
                assert!((a - b).abs() < 1e-12, "coef {} mismatch: {} vs {}", i, a, b);
            }
        }
    }

    #[test]
    fn test_multi_shell_ncoef() {
        // two shells, two radial basis functions of order 4 and 0
        let grad = parse_matrix(
            "1 0 0 1000\n0 1 0 1000\n0 0 1 1000\n1 0 0 3000\n0 1 0 3000\n0 0 1 3000\n",
        )
        .unwrap();
        let motion = Matrix::new(6, 6);
        let rf0 = Matrix::from_vec(vec![1.0, 0.5, 0.2, 1.0, 0.4, 0.1], 2, 3); // order 4
        let rf1 = Matrix::from_vec(vec![1.0, 0.8], 2, 1); // order 0
        let q = QSpaceBasis::new(&grad, 4, &[rf0, rf1], &motion, 2).unwrap();
        assert_eq!(q.ncoef(), sh::n_for_l(4) + sh::n_for_l(0));
        assert_eq!(q.nshells(), 2);
    }

    #[test]
    fn test_rf_shell_count_mismatch_rejected() {
        let grad = six_dir_grad(1000.0); // one shell
        let motion = Matrix::new(6, 6);
        let rf = Matrix::from_vec(vec![1.0, 0.5, 1.0, 0.4], 2, 2); // two rows
        assert!(matches!(
            QSpaceBasis::new(&grad, 2, &[rf], &motion, 2),
            Err(SvrError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_shell_sh_and_init_projector_roundtrip() {
        let grad = parse_matrix(
            "1 0 0 1000\n0 1 0 1000\n0 0 1 1000\n1 0 0 3000\n0 1 0 3000\n0 0 1 3000\n",
        )
        .unwrap();
        let motion = Matrix::new(6, 6);
        let rf0 = Matrix::from_vec(vec![1.0, 0.5, 0.9, 0.4], 2, 2); // order 2
        let rf1 = Matrix::from_vec(vec![0.3, 1.0], 2, 1); // order 0
        let q = QSpaceBasis::new(&grad, 2, &[rf0, rf1], &motion, 2).unwrap();

        let nc = q.ncoef();
        let coefs: Vec<f64> = (0..nc).map(|i| (i as f64 * 0.7).sin() + 0.2).collect();

        let n_lmax = sh::n_for_l(2);
        let mut stacked = vec![0.0; q.nshells() * n_lmax];
        for s in 0..q.nshells() {
            let (lo, hi) = (s * n_lmax, (s + 1) * n_lmax);
            q.shell_sh(s, &coefs, &mut stacked[lo..hi]);
        }

        let mut back = vec![0.0; nc];
        q.init_projector().project(&stacked, &mut back);
        for i in 0..nc {
            assert!(
                (back[i] - coefs[i]).abs() < 1e-8,
                "init projection should invert shell_sh at {}: {} vs {}", i, back[i], coefs[i]
            );
        }
    }
}
