//! SVR-Core: slice-to-volume reconstruction of diffusion MRI
//!
//! Reconstructs a volumetric DWI signal in an even-order real spherical
//! harmonics basis (optionally multi-shell) from scattered 2-D slices
//! with associated rigid head motion, through a matrix-free forward/
//! adjoint operator and a conjugate-gradient least-squares solver.
//!
//! # Modules
//! - `sh`: even-order real spherical harmonics basis
//! - `shells`: b-value shell classification
//! - `kernels`: slice profile, sinc interpolator, Laplacian regularisers
//! - `qspace`: per-slice SH design rows and shell embedding
//! - `mapping`: geometric slice-to-volume forward/adjoint
//! - `recon`: the implicit reconstruction operator A / Aᵀ
//! - `solvers`: matrix-free CGLS driver
//! - `pipeline`: subset selection, validation, solve, output packing
//! - `nifti_io`: NIfTI image I/O (up to 5-D)
//! - `table`: text-matrix tables (motion, weights, gradients)
//! - `transform`: rigid and affine transforms

// Core modules
pub mod error;
pub mod sh;
pub mod shells;
pub mod table;
pub mod transform;

// Operator modules
pub mod kernels;
pub mod mapping;
pub mod qspace;
pub mod recon;
pub mod solvers;

// Orchestration
pub mod pipeline;

// I/O modules
pub mod nifti_io;
