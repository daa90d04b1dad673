//! Reconstruction pipeline
//!
//! Wires the components together: shell-based subset selection, table
//! validation, operator assembly, the CGLS solve, and packing of the
//! coefficient and prediction outputs. All table and image validation
//! lives here so the operator modules can assume consistent inputs.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use serde_json::json;

use crate::error::{SvrError, SvrResult};
use crate::kernels::Ssp;
use crate::mapping::ReconMapping;
use crate::nifti_io::NiftiImage;
use crate::qspace::QSpaceBasis;
use crate::recon::ReconMatrix;
use crate::sh;
use crate::shells::Shells;
use crate::solvers::{cgls_solve, CglsOptions};
use crate::table::Matrix;
use crate::transform::GridTransform;

/// Solver and model parameters
#[derive(Debug, Clone)]
pub struct ReconParams {
    /// Maximum harmonic order of the output series (even, 0-30)
    pub lmax: usize,
    pub tol: f64,
    pub max_iter: usize,
    pub reg: f64,
    pub zreg: f64,
    /// Coefficient-axis size of the output (defaults to N_SH(lmax))
    pub padding: Option<usize>,
    /// Also compute the predicted source signal
    pub spred: bool,
    /// Pad the predicted source signal to the full volume count
    pub complete: bool,
    /// Also compute the per-volume signal prediction along the rotated
    /// gradient directions (registration target)
    pub rpred: bool,
}

impl Default for ReconParams {
    fn default() -> Self {
        ReconParams {
            lmax: 4,
            tol: 1e-4,
            max_iter: 10,
            reg: 1e-3,
            zreg: 1e-3,
            padding: None,
            spred: false,
            complete: false,
            rpred: false,
        }
    }
}

/// Assembled inputs of one reconstruction
pub struct ReconInput<'a> {
    /// 4-D source image (scattered slices)
    pub dwi: &'a NiftiImage,
    /// Gradient table, one [gx, gy, gz, b] row per input volume
    pub grad: &'a Matrix,
    /// Rigid motion table (nv or nv*nz rows); identity when absent
    pub motion: Option<&'a Matrix>,
    /// Multi-shell radial basis functions; empty selects single-shell mode
    pub rf: &'a [Matrix],
    /// Slice weights, nz x nv over the full volume list
    pub slice_weights: Option<&'a Matrix>,
    /// Voxel weight image, same dimensions as `dwi`
    pub vox_weights: Option<&'a NiftiImage>,
    /// Header source for the reconstruction grid (defaults to `dwi`)
    pub template: Option<&'a NiftiImage>,
    /// Warm-start coefficient image
    pub init: Option<&'a NiftiImage>,
    pub ssp: Ssp,
    pub params: ReconParams,
}

/// Reconstruction results
pub struct ReconOutput {
    /// Coefficient image: 4-D single-shell, 5-D multi-shell
    pub coefficients: NiftiImage,
    /// Sidecar metadata (shells, shellcounts, gradient subset, solver report)
    pub metadata: serde_json::Value,
    /// Predicted source signal, when requested
    pub spred: Option<NiftiImage>,
    /// Predicted signal along the rotated gradient directions
    pub rpred: Option<NiftiImage>,
    pub iterations: usize,
    pub residual: f64,
    /// Indices of the selected volumes in the input image
    pub selected: Vec<usize>,
}

/// Run the scattered-slice reconstruction
pub fn run_recon(input: &ReconInput, cancel: Option<&AtomicBool>) -> SvrResult<ReconOutput> {
    let p = &input.params;

    if input.dwi.dims.len() != 4 {
        return Err(SvrError::InvalidArgument(format!(
            "input image must be 4-D, got {}-D", input.dwi.dims.len()
        )));
    }
    let [nx, ny, nz] = input.dwi.spatial_dims();
    let nv_full = input.dwi.dims[3];
    let nxyz = nx * ny * nz;

    if p.lmax % 2 != 0 || p.lmax > 30 {
        return Err(SvrError::InvalidArgument(format!(
            "lmax must be even and at most 30, got {}", p.lmax
        )));
    }
    let n_lmax = sh::n_for_l(p.lmax);
    let padding = p.padding.unwrap_or(n_lmax);
    if padding < n_lmax {
        return Err(SvrError::InvalidArgument(format!(
            "padding {} is smaller than the {} coefficients of lmax {}",
            padding, n_lmax, p.lmax
        )));
    }

    if input.grad.rows() != nv_full {
        return Err(SvrError::InvalidArgument(format!(
            "gradient table has {} rows but the image has {} volumes",
            input.grad.rows(), nv_full
        )));
    }

    // Volume selection: largest shell in single-shell mode, all shells
    // in ascending order in multi-shell mode
    let shells = Shells::new(input.grad)?;
    let selected: Vec<usize> = if input.rf.is_empty() {
        shells.largest().volumes.clone()
    } else {
        shells.iter().flat_map(|s| s.volumes.iter().copied()).collect()
    };
    let nv = selected.len();

    let grad_sub = input.grad.select_rows(&selected);
    let motion_sub = subset_motion(input.motion, &selected, nv_full, nz)?;
    let w_slice = subset_slice_weights(input.slice_weights, &selected, nz, nv_full)?;
    let w_vox = subset_vox_weights(input.vox_weights, &selected, &input.dwi.dims)?;

    // Reconstruction grid: template header when given, else the source
    let (rec_dims, rec_affine, rec_voxel_size) = match input.template {
        Some(t) => (t.spatial_dims(), t.affine, t.voxel_size),
        None => ([nx, ny, nz], input.dwi.affine, input.dwi.voxel_size),
    };
    let rec_len: usize = rec_dims.iter().product();

    let src_transform = GridTransform::new(input.dwi.affine);
    let rec_transform = GridTransform::new(rec_affine);

    let qspace = QSpaceBasis::new(&grad_sub, p.lmax, input.rf, &motion_sub, nz)?;
    let mapping = ReconMapping::new(
        [nx, ny, nz],
        nv,
        &src_transform,
        rec_dims,
        &rec_transform,
        &motion_sub,
        input.ssp.clone(),
    )?;
    let a = ReconMatrix::new(&mapping, &qspace, w_slice, w_vox, p.reg, p.zreg)?;

    // Observation vector over the selected volumes; non-finite samples
    // are clipped to zero
    let mut y = Vec::with_capacity(nxyz * nv);
    for &v in &selected {
        y.extend(
            input.dwi.data[v * nxyz..(v + 1) * nxyz]
                .iter()
                .map(|&s| if s.is_finite() { s } else { 0.0 }),
        );
    }
    let b = a.weighted_rhs(&y);

    let x0 = match input.init {
        Some(img) => Some(build_init(img, &qspace, rec_dims, input.rf.is_empty())?),
        None => None,
    };

    let opts = CglsOptions { tol: p.tol, max_iter: p.max_iter };
    let sol = cgls_solve(&a, &b, x0.as_deref(), &opts, cancel)?;

    // Pack the coefficient image
    let nc = qspace.ncoef();
    let coefficients = if input.rf.is_empty() {
        let mut data = vec![0.0; rec_len * padding];
        data[..rec_len * nc].copy_from_slice(&sol.x);
        NiftiImage::new(
            data,
            vec![rec_dims[0], rec_dims[1], rec_dims[2], padding],
            rec_voxel_size,
            rec_affine,
        )
    } else {
        let nshells = qspace.nshells();
        let mut data = vec![0.0; rec_len * nshells * padding];
        let mut coefs = vec![0.0; nc];
        let mut series = vec![0.0; n_lmax];
        for i in 0..rec_len {
            for c in 0..nc {
                coefs[c] = sol.x[c * rec_len + i];
            }
            for s in 0..nshells {
                qspace.shell_sh(s, &coefs, &mut series);
                for (k, &v) in series.iter().enumerate() {
                    data[i + rec_len * (s + nshells * k)] = v;
                }
            }
        }
        NiftiImage::new(
            data,
            vec![rec_dims[0], rec_dims[1], rec_dims[2], nshells, padding],
            rec_voxel_size,
            rec_affine,
        )
    };

    // Sidecar metadata for the written image
    let sub_shells = Shells::new(&grad_sub)?;
    let bvalues: Vec<String> = sub_shells.iter().map(|s| format!("{:.0}", s.bvalue)).collect();
    let counts: Vec<String> = sub_shells.iter().map(|s| format!("{}", s.count())).collect();
    let dw_scheme: Vec<Vec<f64>> = (0..grad_sub.rows()).map(|r| grad_sub.row(r).to_vec()).collect();
    let metadata = json!({
        "shells": bvalues.join(","),
        "shellcounts": counts.join(","),
        "lmax": p.lmax,
        "dw_scheme": dw_scheme,
        "iterations": sol.iterations,
        "residual": sol.residual,
    });

    // Predicted source signal
    let spred = if p.spred {
        let mut pred = vec![0.0; a.n_obs()];
        a.predict(&sol.x, &mut pred);
        let img = if p.complete {
            let mut full = vec![0.0; nxyz * nv_full];
            for (i, &v) in selected.iter().enumerate() {
                full[v * nxyz..(v + 1) * nxyz].copy_from_slice(&pred[i * nxyz..(i + 1) * nxyz]);
            }
            NiftiImage::new(full, vec![nx, ny, nz, nv_full], input.dwi.voxel_size, input.dwi.affine)
        } else {
            NiftiImage::new(pred, vec![nx, ny, nz, nv], input.dwi.voxel_size, input.dwi.affine)
        };
        Some(img)
    } else {
        None
    };

    // Predicted signal along each volume's rotated gradient direction,
    // evaluated per voxel with the design row of the voxel's own slice
    let rpred = if p.rpred {
        let nc = qspace.ncoef();
        let mut data = vec![0.0; rec_len * nv];
        let mut coefs = vec![0.0; nc];
        let rec_nxy = rec_dims[0] * rec_dims[1];
        for i in 0..rec_len {
            for c in 0..nc {
                coefs[c] = sol.x[c * rec_len + i];
            }
            let z = (i / rec_nxy).min(nz - 1);
            for v in 0..nv {
                let row = qspace.row(v, z);
                let mut sum = 0.0;
                for c in 0..nc {
                    sum += row[c] * coefs[c];
                }
                data[v * rec_len + i] = sum;
            }
        }
        Some(NiftiImage::new(
            data,
            vec![rec_dims[0], rec_dims[1], rec_dims[2], nv],
            rec_voxel_size,
            rec_affine,
        ))
    } else {
        None
    };

    Ok(ReconOutput {
        coefficients,
        metadata,
        spred,
        rpred,
        iterations: sol.iterations,
        residual: sol.residual,
        selected,
    })
}

/// Slice the motion table down to the selected volumes
fn subset_motion(
    motion: Option<&Matrix>,
    selected: &[usize],
    nv_full: usize,
    nz: usize,
) -> SvrResult<Matrix> {
    let m = match motion {
        Some(m) => m,
        None => return Ok(Matrix::new(selected.len(), 6)),
    };
    if m.cols() != 6 {
        return Err(SvrError::InvalidArgument(format!(
            "motion table must have 6 columns, got {}", m.cols()
        )));
    }
    if !m.is_finite() {
        return Err(SvrError::Numeric("non-finite entries in motion table".into()));
    }
    if m.rows() == nv_full {
        Ok(m.select_rows(selected))
    } else if m.rows() == nv_full * nz {
        let rows: Vec<usize> = selected
            .iter()
            .flat_map(|&v| (0..nz).map(move |z| v * nz + z))
            .collect();
        Ok(m.select_rows(&rows))
    } else {
        Err(SvrError::InvalidArgument(format!(
            "motion table must have {} (per-volume) or {} (per-slice) rows, got {}",
            nv_full, nv_full * nz, m.rows()
        )))
    }
}

/// Slice the nz x nv weight matrix down to the selected volumes
fn subset_slice_weights(
    weights: Option<&Matrix>,
    selected: &[usize],
    nz: usize,
    nv_full: usize,
) -> SvrResult<Option<Matrix>> {
    match weights {
        Some(w) => {
            if w.rows() != nz || w.cols() != nv_full {
                return Err(SvrError::InvalidArgument(format!(
                    "slice weight matrix must be {} x {}, got {} x {}",
                    nz, nv_full, w.rows(), w.cols()
                )));
            }
            Ok(Some(w.select_cols(selected)))
        }
        None => Ok(None),
    }
}

/// Extract the selected volumes from the voxel weight image
fn subset_vox_weights(
    weights: Option<&NiftiImage>,
    selected: &[usize],
    dwi_dims: &[usize],
) -> SvrResult<Option<Vec<f64>>> {
    match weights {
        Some(img) => {
            if img.dims != dwi_dims {
                return Err(SvrError::InvalidArgument(format!(
                    "voxel weight image dimensions {:?} do not match the input {:?}",
                    img.dims, dwi_dims
                )));
            }
            let nxyz: usize = dwi_dims[..3].iter().product();
            let mut out = Vec::with_capacity(nxyz * selected.len());
            for &v in selected {
                out.extend_from_slice(&img.data[v * nxyz..(v + 1) * nxyz]);
            }
            Ok(Some(out))
        }
        None => Ok(None),
    }
}

/// Build the warm-start vector from a coefficient image
///
/// Single-shell: a 4-D image whose coefficient axis maps directly onto
/// the solution channels. Multi-shell: a 5-D image of per-shell SH
/// series, collapsed through the least-squares inverse of the stacked
/// shell bases. Non-finite values are clipped to zero.
fn build_init(
    img: &NiftiImage,
    qspace: &QSpaceBasis,
    rec_dims: [usize; 3],
    single_shell: bool,
) -> SvrResult<Vec<f64>> {
    if img.spatial_dims() != rec_dims {
        return Err(SvrError::InvalidArgument(format!(
            "init image grid {:?} does not match the reconstruction grid {:?}",
            img.spatial_dims(), rec_dims
        )));
    }
    let rec_len: usize = rec_dims.iter().product();
    let nc = qspace.ncoef();
    let clip = |v: f64| if v.is_finite() { v } else { 0.0 };

    if single_shell {
        if img.dims.len() != 4 {
            return Err(SvrError::InvalidArgument(format!(
                "single-shell init image must be 4-D, got {}-D", img.dims.len()
            )));
        }
        let ncoef_img = img.dims[3];
        let mut x = vec![0.0; nc * rec_len];
        for c in 0..nc.min(ncoef_img) {
            for i in 0..rec_len {
                x[c * rec_len + i] = clip(img.data[c * rec_len + i]);
            }
        }
        Ok(x)
    } else {
        let nshells = qspace.nshells();
        if img.dims.len() != 5 || img.dims[3] != nshells {
            return Err(SvrError::InvalidArgument(format!(
                "multi-shell init image must be 5-D with {} shells, got {:?}",
                nshells, img.dims
            )));
        }
        let n_lmax = sh::n_for_l(qspace.lmax());
        let ncoef_img = img.dims[4];
        let projector = qspace.init_projector();
        let mut x = vec![0.0; nc * rec_len];
        let mut stacked = vec![0.0; nshells * n_lmax];
        let mut coefs = vec![0.0; nc];
        for i in 0..rec_len {
            stacked.fill(0.0);
            for s in 0..nshells {
                for k in 0..n_lmax.min(ncoef_img) {
                    stacked[s * n_lmax + k] = clip(img.data[i + rec_len * (s + nshells * k)]);
                }
            }
            projector.project(&stacked, &mut coefs);
            for c in 0..nc {
                x[c * rec_len + i] = coefs[c];
            }
        }
        Ok(x)
    }
}

/// Find the gradient table for an input image
///
/// An explicit `--grad` table (4+ columns) or `--fslgrad` pair wins;
/// otherwise companion files next to the image are tried: `<stem>.b`,
/// then `<stem>.bvec` + `<stem>.bval`.
pub fn discover_gradients(
    dwi_path: &Path,
    grad: Option<&Path>,
    fslgrad: Option<(&Path, &Path)>,
) -> SvrResult<Matrix> {
    if let Some(path) = grad {
        return crate::table::load_matrix(path);
    }
    if let Some((bvecs, bvals)) = fslgrad {
        return load_fsl_gradients(bvecs, bvals);
    }

    let stem = dwi_path.to_string_lossy();
    let stem = stem
        .strip_suffix(".nii.gz")
        .or_else(|| stem.strip_suffix(".nii"))
        .unwrap_or(&stem)
        .to_string();

    let mrtrix = PathBuf::from(format!("{}.b", stem));
    if mrtrix.exists() {
        return crate::table::load_matrix(&mrtrix);
    }
    let bvecs = PathBuf::from(format!("{}.bvec", stem));
    let bvals = PathBuf::from(format!("{}.bval", stem));
    if bvecs.exists() && bvals.exists() {
        return load_fsl_gradients(&bvecs, &bvals);
    }

    Err(SvrError::InvalidArgument(format!(
        "no gradient table found for '{}' (looked for .b and .bvec/.bval companions)",
        dwi_path.display()
    )))
}

/// Combine FSL-style bvecs (3 x nv) and bvals (1 x nv) into one table
pub fn load_fsl_gradients(bvecs: &Path, bvals: &Path) -> SvrResult<Matrix> {
    let vecs = crate::table::load_matrix(bvecs)?;
    let vals = crate::table::load_matrix(bvals)?;
    if vecs.rows() != 3 {
        return Err(SvrError::InvalidArgument(format!(
            "bvec file must have 3 rows, got {}", vecs.rows()
        )));
    }
    if vals.rows() != 1 || vals.cols() != vecs.cols() {
        return Err(SvrError::InvalidArgument(format!(
            "bval file must have 1 row of {} values, got {} x {}",
            vecs.cols(), vals.rows(), vals.cols()
        )));
    }
    let nv = vecs.cols();
    let mut grad = Matrix::new(nv, 4);
    for v in 0..nv {
        grad[(v, 0)] = vecs[(0, v)];
        grad[(v, 1)] = vecs[(1, v)];
        grad[(v, 2)] = vecs[(2, v)];
        grad[(v, 3)] = vals[(0, v)];
    }
    Ok(grad)
}

/// Parse the slice profile option: a scalar FWHM or a sampled vector file
pub fn parse_ssp_spec(spec: &str) -> SvrResult<Ssp> {
    if let Ok(fwhm) = spec.parse::<f64>() {
        return Ssp::gaussian(fwhm);
    }
    let path = Path::new(spec);
    if !path.exists() {
        return Err(SvrError::InvalidArgument(format!(
            "slice profile '{}' is neither a number nor a readable file", spec
        )));
    }
    let m = crate::table::load_matrix(path)?;
    let values: Vec<f64> = if m.rows() == 1 {
        m.row(0).to_vec()
    } else if m.cols() == 1 {
        (0..m.rows()).map(|r| m[(r, 0)]).collect()
    } else {
        return Err(SvrError::InvalidArgument(format!(
            "slice profile file must hold a vector, got {} x {}", m.rows(), m.cols()
        )));
    };
    Ssp::from_vector(values)
}
