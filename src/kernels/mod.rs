//! Convolution and interpolation kernels
//!
//! - `ssp`: 1-D slice sensitivity profile along the slice-select axis
//! - `sinc`: 3-D windowed-sinc interpolator on the reconstruction grid
//! - `laplacian`: discrete Laplacian operators used for regularisation

pub mod laplacian;
pub mod sinc;
pub mod ssp;

pub use laplacian::{laplacian3d, second_diff_z};
pub use sinc::SincPsf;
pub use ssp::Ssp;
