//! Iterative solvers

pub mod cgls;

pub use cgls::{cgls_solve, CglsOptions, CglsSolution};
