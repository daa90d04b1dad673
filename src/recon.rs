//! Implicit reconstruction operator
//!
//! `ReconMatrix` is the full forward model `A` of the scattered-slice
//! reconstruction: q-space projection through the per-slice design
//! rows, geometric slice mapping, slice/voxel weighting, and stacked
//! Laplacian regularisation rows. It is never materialised; `apply`
//! and `apply_adjoint` rebuild the per-slice geometry on the fly,
//! which is cheaper than storing the sparse rows.
//!
//! Forward order per slice: collapse the coefficient axis with the SH
//! design row first, then apply the geometric operator once; the
//! product commutes, so the adjoint scatters before distributing.

use rayon::prelude::*;

use crate::error::{SvrError, SvrResult};
use crate::kernels::{laplacian3d, second_diff_z};
use crate::mapping::ReconMapping;
use crate::qspace::QSpaceBasis;
use crate::table::Matrix;

/// Matrix-free linear operator interface for the CG solver
pub trait LinearOperator: Sync {
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;
    /// y = A x
    fn apply(&self, x: &[f64], y: &mut [f64]);
    /// x = Aᵀ y
    fn apply_adjoint(&self, y: &[f64], x: &mut [f64]);
}

/// Full slice-to-volume reconstruction operator
pub struct ReconMatrix<'a> {
    mapping: &'a ReconMapping,
    qspace: &'a QSpaceBasis,
    w_slice: Matrix,
    w_vox: Option<Vec<f64>>,
    reg: f64,
    zreg: f64,
    n_obs: usize,
}

impl<'a> ReconMatrix<'a> {
    /// Assemble the operator
    ///
    /// `w_slice` is nz x nv (defaults to all ones), `w_vox` matches the
    /// source grid raster (nx'·ny'·nz'·nv). `reg`/`zreg` are the
    /// isotropic and through-slice regularisation weights; a zero
    /// weight removes the corresponding block of rows entirely.
    pub fn new(
        mapping: &'a ReconMapping,
        qspace: &'a QSpaceBasis,
        w_slice: Option<Matrix>,
        w_vox: Option<Vec<f64>>,
        reg: f64,
        zreg: f64,
    ) -> SvrResult<Self> {
        let nz = mapping.nslices();
        let nv = mapping.nvolumes();
        let n_obs = mapping.slice_len() * nz * nv;

        let w_slice = match w_slice {
            Some(w) => {
                if w.rows() != nz || w.cols() != nv {
                    return Err(SvrError::InvalidArgument(format!(
                        "slice weight matrix must be {} x {}, got {} x {}",
                        nz, nv, w.rows(), w.cols()
                    )));
                }
                if w.as_slice().iter().any(|v| !v.is_finite() || *v < 0.0) {
                    return Err(SvrError::InvalidArgument(
                        "slice weights must be finite and non-negative".into(),
                    ));
                }
                w
            }
            None => {
                let mut w = Matrix::new(nz, nv);
                for r in 0..nz {
                    w.row_mut(r).fill(1.0);
                }
                w
            }
        };

        if let Some(ref wv) = w_vox {
            if wv.len() != n_obs {
                return Err(SvrError::InvalidArgument(format!(
                    "voxel weight image must have {} values, got {}", n_obs, wv.len()
                )));
            }
            if wv.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(SvrError::InvalidArgument(
                    "voxel weights must be finite and non-negative".into(),
                ));
            }
        }

        if qspace.nvolumes() != nv {
            return Err(SvrError::InvalidArgument(format!(
                "q-space basis covers {} volumes but the mapping has {}",
                qspace.nvolumes(), nv
            )));
        }

        Ok(ReconMatrix { mapping, qspace, w_slice, w_vox, reg, zreg, n_obs })
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn ncoef(&self) -> usize {
        self.qspace.ncoef()
    }

    fn rec_len(&self) -> usize {
        self.mapping.rec_len()
    }

    fn n_reg_blocks(&self) -> usize {
        (self.reg > 0.0) as usize + (self.zreg > 0.0) as usize
    }

    /// Right-hand side for the solver: sqrt-weighted observations with
    /// zero-filled regularisation rows
    pub fn weighted_rhs(&self, y: &[f64]) -> Vec<f64> {
        assert_eq!(y.len(), self.n_obs);
        let mut b = vec![0.0; self.rows()];
        b[..self.n_obs].copy_from_slice(y);
        self.scale_observations(&mut b[..self.n_obs]);
        b
    }

    /// Scale an observation vector by sqrt(W_slice · W_vox) in place
    fn scale_observations(&self, y: &mut [f64]) {
        let nxy = self.mapping.slice_len();
        let nz = self.mapping.nslices();
        y.par_chunks_mut(nxy).enumerate().for_each(|(slab, chunk)| {
            let (v, z) = (slab / nz, slab % nz);
            let ws = self.w_slice[(z, v)];
            if ws == 0.0 {
                chunk.fill(0.0);
                return;
            }
            let sw = ws.sqrt();
            match &self.w_vox {
                Some(wv) => {
                    let off = slab * nxy;
                    for (i, val) in chunk.iter_mut().enumerate() {
                        *val *= sw * wv[off + i].sqrt();
                    }
                }
                None => {
                    for val in chunk.iter_mut() {
                        *val *= sw;
                    }
                }
            }
        });
    }

    /// Collapse the coefficient axis of `x` with the design row of
    /// slice (v, z): buf = Σ_c y_{v,z}[c] · x^{(c)}
    fn collapse(&self, x: &[f64], v: usize, z: usize, buf: &mut [f64]) {
        let rl = self.rec_len();
        let row = self.qspace.row(v, z);
        buf.fill(0.0);
        for (c, &w) in row.iter().enumerate() {
            if w == 0.0 {
                continue;
            }
            let xc = &x[c * rl..(c + 1) * rl];
            for (b, &xv) in buf.iter_mut().zip(xc.iter()) {
                *b += w * xv;
            }
        }
    }

    fn forward_obs(&self, x: &[f64], y: &mut [f64], weighted: bool) {
        let nxy = self.mapping.slice_len();
        let nz = self.mapping.nslices();
        let rl = self.rec_len();

        y[..self.n_obs]
            .par_chunks_mut(nxy)
            .enumerate()
            .for_each_init(
                || vec![0.0; rl],
                |buf, (slab, out)| {
                    let (v, z) = (slab / nz, slab % nz);
                    let ws = self.w_slice[(z, v)];
                    if ws == 0.0 {
                        out.fill(0.0);
                        return;
                    }
                    self.collapse(x, v, z, buf);
                    self.mapping.slice_x2y(buf, out, v, z);
                    if weighted {
                        let sw = ws.sqrt();
                        match &self.w_vox {
                            Some(wv) => {
                                let off = slab * nxy;
                                for (i, val) in out.iter_mut().enumerate() {
                                    *val *= sw * wv[off + i].sqrt();
                                }
                            }
                            None => {
                                for val in out.iter_mut() {
                                    *val *= sw;
                                }
                            }
                        }
                    }
                },
            );
    }

    /// Predicted source signal from a coefficient vector (no
    /// weighting; slices with zero weight come out zero-filled)
    pub fn predict(&self, x: &[f64], y: &mut [f64]) {
        assert_eq!(x.len(), self.cols());
        assert_eq!(y.len(), self.n_obs);
        self.forward_obs(x, y, false);
    }
}

impl LinearOperator for ReconMatrix<'_> {
    fn rows(&self) -> usize {
        self.n_obs + self.n_reg_blocks() * self.ncoef() * self.rec_len()
    }

    fn cols(&self) -> usize {
        self.ncoef() * self.rec_len()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        assert_eq!(x.len(), self.cols());
        assert_eq!(y.len(), self.rows());
        let rl = self.rec_len();
        let [rx, ry, rz] = self.mapping.rec_dims();

        self.forward_obs(x, y, true);

        let mut offset = self.n_obs;
        if self.reg > 0.0 {
            let sreg = self.reg.sqrt();
            y[offset..offset + self.ncoef() * rl]
                .par_chunks_mut(rl)
                .enumerate()
                .for_each(|(c, out)| {
                    laplacian3d(&x[c * rl..(c + 1) * rl], out, rx, ry, rz);
                    for v in out.iter_mut() {
                        *v *= sreg;
                    }
                });
            offset += self.ncoef() * rl;
        }
        if self.zreg > 0.0 {
            let szreg = self.zreg.sqrt();
            y[offset..offset + self.ncoef() * rl]
                .par_chunks_mut(rl)
                .enumerate()
                .for_each(|(c, out)| {
                    second_diff_z(&x[c * rl..(c + 1) * rl], out, rx, ry, rz);
                    for v in out.iter_mut() {
                        *v *= szreg;
                    }
                });
        }
    }

    fn apply_adjoint(&self, y: &[f64], x: &mut [f64]) {
        assert_eq!(y.len(), self.rows());
        assert_eq!(x.len(), self.cols());
        let nxy = self.mapping.slice_len();
        let nz = self.mapping.nslices();
        let rl = self.rec_len();
        let nc = self.ncoef();
        let [rx, ry, rz] = self.mapping.rec_dims();

        // Observation part: each worker scatters weighted slices into a
        // private coefficient accumulator; accumulators are summed at
        // the end (no shared-state scatter).
        let acc = y[..self.n_obs]
            .par_chunks(nxy)
            .enumerate()
            .fold(
                || (vec![0.0; nc * rl], vec![0.0; rl], vec![0.0; nxy]),
                |(mut acc, mut g, mut wr), (slab, slice)| {
                    let (v, z) = (slab / nz, slab % nz);
                    let ws = self.w_slice[(z, v)];
                    if ws == 0.0 {
                        return (acc, g, wr);
                    }
                    let sw = ws.sqrt();
                    match &self.w_vox {
                        Some(wv) => {
                            let off = slab * nxy;
                            for i in 0..nxy {
                                wr[i] = slice[i] * sw * wv[off + i].sqrt();
                            }
                        }
                        None => {
                            for i in 0..nxy {
                                wr[i] = slice[i] * sw;
                            }
                        }
                    }
                    g.fill(0.0);
                    self.mapping.slice_y2x(&wr, &mut g, v, z);
                    let row = self.qspace.row(v, z);
                    for (c, &w) in row.iter().enumerate() {
                        if w == 0.0 {
                            continue;
                        }
                        let xc = &mut acc[c * rl..(c + 1) * rl];
                        for (a, &gv) in xc.iter_mut().zip(g.iter()) {
                            *a += w * gv;
                        }
                    }
                    (acc, g, wr)
                },
            )
            .map(|state| state.0)
            .reduce(
                || vec![0.0; nc * rl],
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(b.iter()) {
                        *x += y;
                    }
                    a
                },
            );
        x.copy_from_slice(&acc);

        // Regularisation part (both stencils are self-adjoint)
        let mut offset = self.n_obs;
        if self.reg > 0.0 {
            let sreg = self.reg.sqrt();
            let r_reg = &y[offset..offset + nc * rl];
            x.par_chunks_mut(rl).enumerate().for_each_init(
                || vec![0.0; rl],
                |tmp, (c, xc)| {
                    laplacian3d(&r_reg[c * rl..(c + 1) * rl], tmp, rx, ry, rz);
                    for (xv, &tv) in xc.iter_mut().zip(tmp.iter()) {
                        *xv += sreg * tv;
                    }
                },
            );
            offset += nc * rl;
        }
        if self.zreg > 0.0 {
            let szreg = self.zreg.sqrt();
            let r_reg = &y[offset..offset + nc * rl];
            x.par_chunks_mut(rl).enumerate().for_each_init(
                || vec![0.0; rl],
                |tmp, (c, xc)| {
                    second_diff_z(&r_reg[c * rl..(c + 1) * rl], tmp, rx, ry, rz);
                    for (xv, &tv) in xc.iter_mut().zip(tmp.iter()) {
                        *xv += szreg * tv;
                    }
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::Ssp;
    use crate::table::parse_matrix;
    use crate::transform::{GridTransform, IDENTITY};

    fn pseudo_random(n: usize, seed: u64) -> Vec<f64> {
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

    fn test_setup(
        dims: [usize; 3],
        motion: Matrix,
    ) -> (ReconMapping, QSpaceBasis) {
        let grad = parse_matrix(
            "1 0 0 1000\n0 1 0 1000\n0 0 1 1000\n\
             0.7071 0.7071 0 1000\n0 0.7071 0.7071 1000\n0.7071 0 0.7071 1000\n",
        )
        .unwrap();
        let t = GridTransform::new(IDENTITY);
        let q = QSpaceBasis::new(&grad, 2, &[], &motion, dims[2]).unwrap();
        let m = ReconMapping::new(dims, 6, &t, dims, &t, &motion, Ssp::default()).unwrap();
        (m, q)
    }

    #[test]
    fn test_shape_accounting() {
        let dims = [4, 4, 4];
        let (m, q) = test_setup(dims, Matrix::new(6, 6));
        let nobs = 4 * 4 * 4 * 6;
        let ncols = 64 * 6;

        let a = ReconMatrix::new(&m, &q, None, None, 0.0, 0.0).unwrap();
        assert_eq!(a.rows(), nobs);
        assert_eq!(a.cols(), ncols);

        let a = ReconMatrix::new(&m, &q, None, None, 1e-3, 0.0).unwrap();
        assert_eq!(a.rows(), nobs + ncols);

        let a = ReconMatrix::new(&m, &q, None, None, 1e-3, 1e-3).unwrap();
        assert_eq!(a.rows(), nobs + 2 * ncols);
    }

    #[test]
    fn test_adjoint_dot_product() {
        let dims = [4, 5, 4];
        let mut motion = Matrix::new(6, 6);
        for v in 0..6 {
            motion
                .row_mut(v)
                .copy_from_slice(&[0.1 * v as f64, -0.2, 0.15, 0.02 * v as f64, -0.01, 0.03]);
        }
        let (m, q) = test_setup(dims, motion);

        let mut w_slice = Matrix::new(dims[2], 6);
        for z in 0..dims[2] {
            for v in 0..6 {
                w_slice[(z, v)] = 0.5 + 0.1 * (z + v) as f64;
            }
        }
        let nobs = dims[0] * dims[1] * dims[2] * 6;
        let w_vox: Vec<f64> = pseudo_random(nobs, 5).iter().map(|v| v + 0.6).collect();

        let a = ReconMatrix::new(&m, &q, Some(w_slice), Some(w_vox), 1e-2, 2e-3).unwrap();
        let x = pseudo_random(a.cols(), 11);
        let r = pseudo_random(a.rows(), 23);

        let mut ax = vec![0.0; a.rows()];
        a.apply(&x, &mut ax);
        let mut atr = vec![0.0; a.cols()];
        a.apply_adjoint(&r, &mut atr);

        let lhs: f64 = ax.iter().zip(r.iter()).map(|(p, q)| p * q).sum();
        let rhs: f64 = x.iter().zip(atr.iter()).map(|(p, q)| p * q).sum();
        let rel = (lhs - rhs).abs() / lhs.abs().max(rhs.abs()).max(1e-12);
        assert!(rel < 1e-10, "adjoint mismatch: {} vs {} (rel {})", lhs, rhs, rel);
    }

    #[test]
    fn test_zero_slice_weight_kills_contribution() {
        let dims = [4, 4, 5];
        let (m, q) = test_setup(dims, Matrix::new(6, 6));
        let nxy = dims[0] * dims[1];

        let mut w = Matrix::new(dims[2], 6);
        for z in 0..dims[2] {
            w.row_mut(z).fill(1.0);
        }
        w[(2, 3)] = 0.0;
        let a = ReconMatrix::new(&m, &q, Some(w), None, 0.0, 0.0).unwrap();

        // forward: the (v=3, z=2) slab must be exactly zero
        let x = pseudo_random(a.cols(), 3);
        let mut y = vec![0.0; a.rows()];
        a.apply(&x, &mut y);
        let slab = 3 * dims[2] + 2;
        for i in 0..nxy {
            assert_eq!(y[slab * nxy + i], 0.0, "zero-weight slice leaked into forward");
        }

        // adjoint: values inside the zeroed slab must not matter
        let mut r = pseudo_random(a.rows(), 17);
        let mut atr1 = vec![0.0; a.cols()];
        a.apply_adjoint(&r, &mut atr1);
        for i in 0..nxy {
            r[slab * nxy + i] = 1000.0;
        }
        let mut atr2 = vec![0.0; a.cols()];
        a.apply_adjoint(&r, &mut atr2);
        for i in 0..a.cols() {
            assert_eq!(atr1[i], atr2[i], "zero-weight slice leaked into adjoint at {}", i);
        }
    }

    #[test]
    fn test_reg_rows_vanish_for_constant_channels() {
        let dims = [4, 4, 4];
        let (m, q) = test_setup(dims, Matrix::new(6, 6));
        let a = ReconMatrix::new(&m, &q, None, None, 1e-2, 1e-2).unwrap();

        let x = vec![1.5; a.cols()];
        let mut y = vec![0.0; a.rows()];
        a.apply(&x, &mut y);
        for (i, &v) in y[a.n_obs()..].iter().enumerate() {
            assert!(v.abs() < 1e-12, "reg row {} should vanish for constant x, got {}", i, v);
        }
    }

    #[test]
    fn test_weighted_rhs_scaling() {
        let dims = [3, 3, 4];
        let (m, q) = test_setup(dims, Matrix::new(6, 6));
        let mut w = Matrix::new(dims[2], 6);
        for z in 0..dims[2] {
            w.row_mut(z).fill(4.0);
        }
        let a = ReconMatrix::new(&m, &q, Some(w), None, 1e-3, 0.0).unwrap();
        let y = vec![1.0; a.n_obs()];
        let b = a.weighted_rhs(&y);
        assert_eq!(b.len(), a.rows());
        for i in 0..a.n_obs() {
            assert!((b[i] - 2.0).abs() < 1e-14, "sqrt(4) scaling expected, got {}", b[i]);
        }
        for &v in &b[a.n_obs()..] {
            assert_eq!(v, 0.0);
        }
    }

    #[test]
    fn test_predict_is_unweighted_forward() {
        let dims = [4, 4, 4];
        let (m, q) = test_setup(dims, Matrix::new(6, 6));
        let mut w = Matrix::new(dims[2], 6);
        for z in 0..dims[2] {
            w.row_mut(z).fill(0.25);
        }
        w[(1, 2)] = 0.0;
        let nxy = dims[0] * dims[1];

        let a_w = ReconMatrix::new(&m, &q, Some(w), None, 0.0, 0.0).unwrap();
        let a_plain = ReconMatrix::new(&m, &q, None, None, 0.0, 0.0).unwrap();

        let x = pseudo_random(a_w.cols(), 31);
        let mut pred = vec![0.0; a_w.n_obs()];
        a_w.predict(&x, &mut pred);
        let mut plain = vec![0.0; a_plain.rows()];
        a_plain.apply(&x, &mut plain);

        let zeroed = 2 * dims[2] + 1;
        for slab in 0..6 * dims[2] {
            for i in 0..nxy {
                let idx = slab * nxy + i;
                if slab == zeroed {
                    assert_eq!(pred[idx], 0.0, "zero-weight slice should predict zero");
                } else {
                    assert!(
                        (pred[idx] - plain[idx]).abs() < 1e-12,
                        "prediction should match unweighted forward at {}", idx
                    );
                }
            }
        }
    }
}
