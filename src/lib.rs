//! `sleipnir` is a library for distributed, matrix-free finite and spectral element
//! computations.
//!
//! The crate revolves around three tightly coupled pieces:
//!
//! - a [gather-scatter engine](crate::gather) that reconciles element-local, duplicated
//!   degrees of freedom into a globally consistent numbering, across process boundaries,
//! - [matrix-free elliptic operators](crate::operator) (mass and Helmholtz) that apply the
//!   action of the discretized operator through per-element dense or sum-factorized
//!   contractions, without ever forming a global matrix,
//! - a [Conjugate Gradient solver](crate::cg) driving repeated operator applications and
//!   global reductions to convergence.
//!
//! Cross-process communication is abstracted behind [`comm::Communicator`]; the crate ships
//! a single-process implementation and a channel-backed multi-rank implementation suitable
//! for tests and shared-memory runs. All per-element and per-dof work is data-parallel and
//! executed on a thread pool.
//!
//! Mesh topology, reference-element operators and geometric factors are inputs (see
//! [`mesh`]); the [`procedural`] module generates small structured meshes for tests and
//! benchmarks.

use nalgebra::RealField;

pub mod cg;
pub mod comm;
pub mod error;
pub mod gather;
pub mod kernels;
pub mod mesh;
pub mod operator;
pub mod procedural;
pub mod report;
pub mod solver;

pub extern crate nalgebra;

/// The scalar type used throughout the crate.
///
/// A single precision (`f32` or `f64`) is chosen once per run; every field buffer, kernel
/// and cross-process reduction uses that precision consistently. The `Send + Sync` bounds
/// let fields be processed by data-parallel kernels.
pub trait Real: RealField + Copy + Send + Sync {}

impl<T: RealField + Copy + Send + Sync> Real for T {}

pub use crate::cg::{ConjugateGradient, LinearSolver, SolveSummary, StoppingCriterion};
pub use crate::comm::{Communicator, LocalComm};
pub use crate::operator::{EllipticOperator, LinearOperator, ProblemKind};
pub use crate::solver::{EllipticSolver, ProblemConfig, SolveSettings};
