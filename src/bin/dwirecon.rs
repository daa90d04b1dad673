//! Reconstruct a motion-scattered DWI series into an SH coefficient image
//!
//! Usage: dwirecon <DWI> <SH> [options]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use svr_core::error::SvrResult;
use svr_core::kernels::Ssp;
use svr_core::nifti_io::{read_nifti_file, save_nifti_to_file, NiftiImage};
use svr_core::pipeline::{
    discover_gradients, load_fsl_gradients, parse_ssp_spec, run_recon, ReconInput, ReconParams,
};
use svr_core::table::{load_matrix, Matrix};

#[derive(Parser, Debug)]
#[command(
    name = "dwirecon",
    about = "Reconstruct the DWI signal from scattered slices with associated rigid motion"
)]
struct Args {
    /// Input DWI image (4-D NIfTI)
    dwi: PathBuf,

    /// Output spherical harmonics coefficient image
    sh: PathBuf,

    /// Maximum harmonic order of the output series (even)
    #[arg(long, default_value_t = 4)]
    lmax: usize,

    /// Rigid motion parameters: 6 columns (translation, X-Y-Z Euler
    /// rotation) per volume or per slice, in scanner space
    #[arg(long)]
    motion: Option<PathBuf>,

    /// Radial basis matrix per basis function (repeatable); enables
    /// multi-shell reconstruction
    #[arg(long)]
    rf: Vec<PathBuf>,

    /// Slice weight matrix (nz x nv)
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Voxel weight image (same dimensions as the input)
    #[arg(long)]
    voxweights: Option<PathBuf>,

    /// Slice sensitivity profile: Gaussian FWHM (scalar) or sampled
    /// vector file
    #[arg(long)]
    ssp: Option<String>,

    /// Isotropic Laplacian regularisation weight
    #[arg(long, default_value_t = 1e-3)]
    reg: f64,

    /// Through-slice regularisation weight
    #[arg(long, default_value_t = 1e-3)]
    zreg: f64,

    /// Susceptibility field image (not yet supported)
    #[arg(long)]
    field: Option<PathBuf>,

    /// Header defining the reconstruction grid
    #[arg(long)]
    template: Option<PathBuf>,

    /// Convergence tolerance of the conjugate gradient solver
    #[arg(long, default_value_t = 1e-4)]
    tolerance: f64,

    /// Maximum number of conjugate gradient iterations
    #[arg(long, default_value_t = 10)]
    maxiter: usize,

    /// Warm-start coefficient image
    #[arg(long)]
    init: Option<PathBuf>,

    /// Coefficient-axis size of the output (at least N_SH(lmax))
    #[arg(long)]
    padding: Option<usize>,

    /// Output the predicted source signal of all scattered slices
    #[arg(long)]
    spred: Option<PathBuf>,

    /// Output the predicted signal in the original (rotated) gradient
    /// directions
    #[arg(long)]
    rpred: Option<PathBuf>,

    /// Pad the source prediction to the full input volume count
    #[arg(long, default_value_t = false)]
    complete: bool,

    /// Gradient table (one [x y z b] row per volume)
    #[arg(long)]
    grad: Option<PathBuf>,

    /// FSL-style gradient scheme: bvecs and bvals files
    #[arg(long, num_args = 2, value_names = ["BVECS", "BVALS"])]
    fslgrad: Option<Vec<PathBuf>>,
}

fn run(args: &Args) -> SvrResult<()> {
    if args.field.is_some() {
        return Err(svr_core::error::SvrError::InvalidArgument(
            "susceptibility field correction is not yet supported".into(),
        ));
    }

    println!("[STEP 1] Loading input data...");
    let start = Instant::now();
    let dwi = read_nifti_file(&args.dwi)?;
    println!(
        "[INFO] Input: {:?}, voxel {:.2}x{:.2}x{:.2} mm",
        dwi.dims, dwi.voxel_size.0, dwi.voxel_size.1, dwi.voxel_size.2
    );

    let grad = match &args.fslgrad {
        Some(pair) => load_fsl_gradients(&pair[0], &pair[1])?,
        None => discover_gradients(&args.dwi, args.grad.as_deref(), None)?,
    };

    let motion: Option<Matrix> = match &args.motion {
        Some(path) => Some(load_matrix(path)?),
        None => None,
    };
    let rf: Vec<Matrix> = args.rf.iter().map(|p| load_matrix(p)).collect::<SvrResult<_>>()?;
    let slice_weights: Option<Matrix> = match &args.weights {
        Some(path) => Some(load_matrix(path)?),
        None => None,
    };
    let vox_weights: Option<NiftiImage> = match &args.voxweights {
        Some(path) => Some(read_nifti_file(path)?),
        None => None,
    };
    let template: Option<NiftiImage> = match &args.template {
        Some(path) => Some(read_nifti_file(path)?),
        None => None,
    };
    let init: Option<NiftiImage> = match &args.init {
        Some(path) => Some(read_nifti_file(path)?),
        None => None,
    };
    let ssp = match &args.ssp {
        Some(spec) => parse_ssp_spec(spec)?,
        None => Ssp::default(),
    };
    println!("[INFO] Loaded in {:.2?}", start.elapsed());

    println!("[STEP 2] Solving with conjugate gradients...");
    let start = Instant::now();
    let input = ReconInput {
        dwi: &dwi,
        grad: &grad,
        motion: motion.as_ref(),
        rf: &rf,
        slice_weights: slice_weights.as_ref(),
        vox_weights: vox_weights.as_ref(),
        template: template.as_ref(),
        init: init.as_ref(),
        ssp,
        params: ReconParams {
            lmax: args.lmax,
            tol: args.tolerance,
            max_iter: args.maxiter,
            reg: args.reg,
            zreg: args.zreg,
            padding: args.padding,
            spred: args.spred.is_some(),
            complete: args.complete,
            rpred: args.rpred.is_some(),
        },
    };
    let output = run_recon(&input, None)?;
    println!(
        "[INFO] CGLS: {} iterations, estimated residual {:.3e} ({:.2?})",
        output.iterations, output.residual, start.elapsed()
    );
    println!(
        "[INFO] Selected {} of {} volumes",
        output.selected.len(),
        dwi.dims[3]
    );

    println!("[STEP 3] Writing results...");
    save_nifti_to_file(&args.sh, &output.coefficients)?;
    let sidecar = args.sh.with_extension("json");
    std::fs::write(
        &sidecar,
        serde_json::to_string_pretty(&output.metadata).expect("metadata is valid JSON"),
    )
    .map_err(|e| svr_core::error::SvrError::Io(format!(
        "failed to write '{}': {}", sidecar.display(), e
    )))?;
    println!("[INFO] Wrote {}", args.sh.display());

    if let (Some(path), Some(spred)) = (&args.spred, &output.spred) {
        save_nifti_to_file(path, spred)?;
        println!("[INFO] Wrote {}", path.display());
    }
    if let (Some(path), Some(rpred)) = (&args.rpred, &output.rpred) {
        save_nifti_to_file(path, rpred)?;
        println!("[INFO] Wrote {}", path.display());
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dwirecon: {}", e);
            ExitCode::FAILURE
        }
    }
}
