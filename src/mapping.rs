//! Geometric slice-to-volume mapping
//!
//! The pure geometric part of the forward model: maps a scalar volume
//! on the reconstruction grid to one acquired slice through the rigid
//! motion of that slice, the slice sensitivity profile along the
//! slice-select axis, and windowed-sinc resampling on the recon grid.
//! The adjoint scatters each slice pixel back through the same weights.
//!
//! Per-slice transforms are `Ts2r(v,z) = Trec_scanner2voxel ·
//! T_motion(v,z) · Tsrc_voxel2scanner`; the sparse slice operator is
//! rebuilt on the fly from this geometry rather than stored (it is
//! cheaper to recompute than to keep ~(2n+1)·(2n)³ entries per row).

use rayon::prelude::*;

use crate::error::{SvrError, SvrResult};
use crate::kernels::sinc::SINC_RADIUS;
use crate::kernels::{SincPsf, Ssp};
use crate::table::Matrix;
use crate::transform::{apply, compose, rigid_transform, Affine, GridTransform};

/// Slice-wise geometric forward/adjoint operator over all (v, z)
#[derive(Debug, Clone)]
pub struct ReconMapping {
    src_dims: [usize; 3],
    rec_dims: [usize; 3],
    nv: usize,
    ssp: Ssp,
    psf: SincPsf,
    ts2r: Vec<Affine>,
}

impl ReconMapping {
    /// Build the per-slice transforms
    ///
    /// `motion` must hold nv rows (per-volume) or nv*nz rows
    /// (per-slice) of 6 rigid parameters in scanner space.
    pub fn new(
        src_dims: [usize; 3],
        nv: usize,
        src_transform: &GridTransform,
        rec_dims: [usize; 3],
        rec_transform: &GridTransform,
        motion: &Matrix,
        ssp: Ssp,
    ) -> SvrResult<Self> {
        let nz = src_dims[2];
        if motion.cols() != 6 {
            return Err(SvrError::InvalidArgument(format!(
                "motion table must have 6 columns, got {}", motion.cols()
            )));
        }
        if motion.rows() != nv && motion.rows() != nv * nz {
            return Err(SvrError::InvalidArgument(format!(
                "motion table must have {} (per-volume) or {} (per-slice) rows, got {}",
                nv, nv * nz, motion.rows()
            )));
        }
        if !motion.is_finite() {
            return Err(SvrError::Numeric("non-finite entries in motion table".into()));
        }

        let per_slice = motion.rows() == nv * nz;
        let mut ts2r = Vec::with_capacity(nv * nz);
        for v in 0..nv {
            for z in 0..nz {
                let row = if per_slice { v * nz + z } else { v };
                let t = rigid_transform(motion.row(row));
                ts2r.push(compose(
                    &rec_transform.scanner2voxel,
                    &compose(&t, &src_transform.voxel2scanner),
                ));
            }
        }

        Ok(ReconMapping {
            src_dims,
            rec_dims,
            nv,
            ssp,
            psf: SincPsf::new(),
            ts2r,
        })
    }

    pub fn src_dims(&self) -> [usize; 3] {
        self.src_dims
    }

    pub fn rec_dims(&self) -> [usize; 3] {
        self.rec_dims
    }

    pub fn nvolumes(&self) -> usize {
        self.nv
    }

    pub fn nslices(&self) -> usize {
        self.src_dims[2]
    }

    /// Voxels per slice of the source grid
    pub fn slice_len(&self) -> usize {
        self.src_dims[0] * self.src_dims[1]
    }

    /// Voxels in the reconstruction grid
    pub fn rec_len(&self) -> usize {
        self.rec_dims[0] * self.rec_dims[1] * self.rec_dims[2]
    }

    #[inline]
    fn rec_index(&self, q: [i64; 3]) -> Option<usize> {
        let [nx, ny, nz] = self.rec_dims;
        if q[0] >= 0 && (q[0] as usize) < nx
            && q[1] >= 0 && (q[1] as usize) < ny
            && q[2] >= 0 && (q[2] as usize) < nz
        {
            Some(q[0] as usize + q[1] as usize * nx + q[2] as usize * nx * ny)
        } else {
            None
        }
    }

    /// Forward: gather one slice (v, z) from a scalar recon volume
    pub fn slice_x2y(&self, vol: &[f64], out: &mut [f64], v: usize, z: usize) {
        debug_assert_eq!(vol.len(), self.rec_len());
        debug_assert_eq!(out.len(), self.slice_len());

        let [sx, sy, _] = self.src_dims;
        let nz = self.src_dims[2];
        let t = &self.ts2r[v * nz + z];
        let nssp = self.ssp.radius();

        let mut i = 0;
        for y in 0..sy {
            for x in 0..sx {
                let mut acc = 0.0;
                for s in -nssp..=nssp {
                    let w_ssp = self.ssp.value(s);
                    let ps = [x as f64, y as f64, z as f64 + s as f64];
                    let pr = apply(t, ps);
                    let base = [pr[0].ceil() as i64, pr[1].ceil() as i64, pr[2].ceil() as i64];
                    for rx in -SINC_RADIUS..SINC_RADIUS {
                        for ry in -SINC_RADIUS..SINC_RADIUS {
                            for rz in -SINC_RADIUS..SINC_RADIUS {
                                let q = [base[0] + rx, base[1] + ry, base[2] + rz];
                                if let Some(idx) = self.rec_index(q) {
                                    let w = w_ssp
                                        * self.psf.value([
                                            pr[0] - q[0] as f64,
                                            pr[1] - q[1] as f64,
                                            pr[2] - q[2] as f64,
                                        ]);
                                    acc += w * vol[idx];
                                }
                            }
                        }
                    }
                }
                out[i] = acc;
                i += 1;
            }
        }
    }

    /// Adjoint: scatter one slice (v, z) into a scalar recon volume
    ///
    /// Accumulates into `vol`; the caller clears it when needed.
    pub fn slice_y2x(&self, slice: &[f64], vol: &mut [f64], v: usize, z: usize) {
        debug_assert_eq!(slice.len(), self.slice_len());
        debug_assert_eq!(vol.len(), self.rec_len());

        let [sx, sy, _] = self.src_dims;
        let nz = self.src_dims[2];
        let t = &self.ts2r[v * nz + z];
        let nssp = self.ssp.radius();

        let mut i = 0;
        for y in 0..sy {
            for x in 0..sx {
                let val = slice[i];
                i += 1;
                if val == 0.0 {
                    continue;
                }
                for s in -nssp..=nssp {
                    let w_ssp = self.ssp.value(s);
                    let ps = [x as f64, y as f64, z as f64 + s as f64];
                    let pr = apply(t, ps);
                    let base = [pr[0].ceil() as i64, pr[1].ceil() as i64, pr[2].ceil() as i64];
                    for rx in -SINC_RADIUS..SINC_RADIUS {
                        for ry in -SINC_RADIUS..SINC_RADIUS {
                            for rz in -SINC_RADIUS..SINC_RADIUS {
                                let q = [base[0] + rx, base[1] + ry, base[2] + rz];
                                if let Some(idx) = self.rec_index(q) {
                                    let w = w_ssp
                                        * self.psf.value([
                                            pr[0] - q[0] as f64,
                                            pr[1] - q[1] as f64,
                                            pr[2] - q[2] as f64,
                                        ]);
                                    vol[idx] += w * val;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Forward over all slices: y[v*nz+z] slab = M_{v,z} · vol
    ///
    /// Output slabs are disjoint, so slices run in parallel.
    pub fn x2y(&self, vol: &[f64], y: &mut [f64]) {
        let nxy = self.slice_len();
        let nz = self.src_dims[2];
        debug_assert_eq!(y.len(), nxy * nz * self.nv);

        y.par_chunks_mut(nxy).enumerate().for_each(|(slab, out)| {
            let (v, z) = (slab / nz, slab % nz);
            self.slice_x2y(vol, out, v, z);
        });
    }

    /// Adjoint over all slices: vol = Σ_{v,z} M_{v,z}ᵀ · y slab
    ///
    /// Each worker scatters into a private volume; the per-thread
    /// accumulators are reduced by elementwise addition at the end.
    pub fn y2x(&self, y: &[f64], vol: &mut [f64]) {
        let nxy = self.slice_len();
        let nz = self.src_dims[2];
        debug_assert_eq!(y.len(), nxy * nz * self.nv);
        debug_assert_eq!(vol.len(), self.rec_len());

        let acc = y
            .par_chunks(nxy)
            .enumerate()
            .fold(
                || vec![0.0; self.rec_len()],
                |mut acc, (slab, slice)| {
                    let (v, z) = (slab / nz, slab % nz);
                    self.slice_y2x(slice, &mut acc, v, z);
                    acc
                },
            )
            .reduce(
                || vec![0.0; self.rec_len()],
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(b.iter()) {
                        *x += y;
                    }
                    a
                },
            );
        vol.copy_from_slice(&acc);
    }
}
