//! Conjugate Gradient iteration over gathered fields.
//!
//! The solver drives repeated [`LinearOperator`] applications and global reductions. Its
//! scratch vectors live in a [`CgWorkspace`] that is owned by the caller (or by the solver
//! instance) and threaded through every solve, so repeated solves allocate nothing.
//!
//! Failure to converge within the iteration cap is a *normal outcome*, reported through
//! [`SolveSummary::converged`]; only operator and communication failures are errors. An
//! operator that is not positive definite is not trapped either: the `alpha` division
//! poisons the iteration with `inf`/`nan`, the tolerance check never passes, and the
//! caller observes a `nan` residual norm in the summary.

use core::fmt;
use std::error::Error;
use std::ops::{Deref, DerefMut};

use num::{One, Zero};
use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::error::{CommError, SetupError};
use crate::kernels;
use crate::operator::LinearOperator;
use crate::Real;

/// Convergence test for the residual norm.
///
/// The reduction runs in the gathered-dof inner product. `Absolute` compares the residual
/// norm against the tolerance directly; `Relative` scales the tolerance by the norm of the
/// right-hand side. Both are exposed because reasonable callers want either.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StoppingCriterion<T> {
    Absolute(T),
    Relative(T),
}

impl<T: Real> StoppingCriterion<T> {
    fn threshold(&self, rhs_norm: T) -> T {
        match self {
            StoppingCriterion::Absolute(tol) => *tol,
            StoppingCriterion::Relative(tol) => *tol * rhs_norm,
        }
    }
}

/// Optional preconditioner applied as `z = M⁻¹ r` once per iteration.
#[derive(Debug, Clone)]
pub enum Preconditioner<T> {
    None,
    /// Pointwise division by the gathered operator diagonal.
    Jacobi { inverse_diagonal: Vec<T> },
}

impl<T: Real> Preconditioner<T> {
    /// Build a Jacobi sweep from the gathered operator diagonal.
    pub fn jacobi(diagonal: &[T]) -> Result<Self, SetupError> {
        let mut inverse_diagonal = Vec::with_capacity(diagonal.len());
        for (index, &d) in diagonal.iter().enumerate() {
            if !(d > T::zero()) {
                return Err(SetupError::DegenerateDiagonal { index });
            }
            inverse_diagonal.push(T::one() / d);
        }
        Ok(Preconditioner::Jacobi { inverse_diagonal })
    }

    fn apply(&self, z: &mut [T], r: &[T]) {
        match self {
            Preconditioner::None => z.copy_from_slice(r),
            Preconditioner::Jacobi { inverse_diagonal } => {
                // The diagonal covers one field; multi-field buffers repeat it per field.
                let n = inverse_diagonal.len();
                assert_eq!(r.len() % n, 0);
                for (z_f, r_f) in z.chunks_mut(n).zip(r.chunks(n)) {
                    for i in 0..n {
                        z_f[i] = inverse_diagonal[i] * r_f[i];
                    }
                }
            }
        }
    }
}

/// The result of a solve: final iterate count, residual norm and convergence flag.
///
/// `converged == false` with `iterations == max_iterations` means the cap was reached; a
/// `nan` residual norm means the operator broke down (for example `pᵀAp <= 0`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveSummary<T> {
    pub converged: bool,
    pub iterations: usize,
    pub residual_norm: T,
    pub initial_residual_norm: T,
}

#[derive(Debug)]
pub enum SolveErrorKind {
    OperatorError(Box<dyn Error>),
    CommError(CommError),
}

impl fmt::Display for SolveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorError(err) => {
                write!(f, "Error applying operator: ")?;
                err.fmt(f)
            }
            Self::CommError(err) => {
                write!(f, "Communication failure during solve: ")?;
                err.fmt(f)
            }
        }
    }
}

/// A failed solve still reports how far it got.
#[derive(Debug)]
pub struct SolveError<T> {
    pub summary: SolveSummary<T>,
    pub kind: SolveErrorKind,
}

impl<T> SolveError<T> {
    fn new(summary: SolveSummary<T>, kind: SolveErrorKind) -> Self {
        Self { summary, kind }
    }
}

impl<T> fmt::Display for SolveError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CG solve failed after {} iterations. ", self.summary.iterations)?;
        write!(f, "Error: {}", self.kind)
    }
}

impl<T: fmt::Debug> Error for SolveError<T> {}

/// Solver-owned scratch vectors, resized per solve and reusable across solves.
#[derive(Debug, Clone)]
pub struct CgWorkspace<T> {
    r: Vec<T>,
    z: Vec<T>,
    p: Vec<T>,
    ap: Vec<T>,
}

struct Buffers<'a, T> {
    r: &'a mut Vec<T>,
    z: &'a mut Vec<T>,
    p: &'a mut Vec<T>,
    ap: &'a mut Vec<T>,
}

impl<T> Default for CgWorkspace<T> {
    fn default() -> Self {
        Self {
            r: Vec::new(),
            z: Vec::new(),
            p: Vec::new(),
            ap: Vec::new(),
        }
    }
}

impl<T: Real> CgWorkspace<T> {
    fn prepare_buffers(&mut self, dim: usize) -> Buffers<'_, T> {
        self.r.resize(dim, T::zero());
        self.z.resize(dim, T::zero());
        self.p.resize(dim, T::zero());
        self.ap.resize(dim, T::zero());
        Buffers {
            r: &mut self.r,
            z: &mut self.z,
            p: &mut self.p,
            ap: &mut self.ap,
        }
    }
}

#[derive(Debug)]
enum OwnedOrMutRef<'a, T> {
    Owned(T),
    MutRef(&'a mut T),
}

impl<'a, T> Deref for OwnedOrMutRef<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Owned(owned) => owned,
            Self::MutRef(mutref) => mutref,
        }
    }
}

impl<'a, T> DerefMut for OwnedOrMutRef<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Owned(owned) => owned,
            Self::MutRef(mutref) => mutref,
        }
    }
}

fn dot<T, C>(weights: Option<&[T]>, comm: &C, x: &[T], y: &[T]) -> Result<T, CommError>
where
    T: Real,
    C: Communicator<T>,
{
    match weights {
        Some(weights) => kernels::weighted_inner_product(x, y, weights, comm),
        None => kernels::inner_product(x, y, comm),
    }
}

/// A capability interface for linear solvers over gathered fields; variant solvers
/// implement this without exposing their internals.
pub trait LinearSolver<T: Real> {
    fn solve(
        &mut self,
        operator: &dyn LinearOperator<T>,
        x: &mut [T],
        rhs: &[T],
    ) -> Result<SolveSummary<T>, SolveError<T>>;
}

/// Conjugate Gradient with the fused update step.
///
/// The update of `x` and `r` and the reduction for the next `rᵀr` run as one pass over
/// memory ([`kernels::fused_cg_update`]); reformulations that split this into separate
/// kernels double the memory traffic of the update step.
#[derive(Debug)]
pub struct ConjugateGradient<'a, T: Real, C: Communicator<T>> {
    comm: &'a C,
    workspace: OwnedOrMutRef<'a, CgWorkspace<T>>,
    criterion: StoppingCriterion<T>,
    preconditioner: Preconditioner<T>,
    max_iterations: usize,
    /// Per-entry reduction weights for fields that replicate halo dofs across ranks
    /// (see [`GatherScatter::inverse_multiplicity`](crate::gather::GatherScatter)).
    dot_weights: Option<&'a [T]>,
}

impl<'a, T: Real, C: Communicator<T>> ConjugateGradient<'a, T, C> {
    pub fn new(comm: &'a C, criterion: StoppingCriterion<T>, max_iterations: usize) -> Self {
        Self {
            comm,
            workspace: OwnedOrMutRef::Owned(CgWorkspace::default()),
            criterion,
            preconditioner: Preconditioner::None,
            max_iterations,
            dot_weights: None,
        }
    }

    /// Use caller-owned scratch instead of the solver's own.
    pub fn with_workspace(mut self, workspace: &'a mut CgWorkspace<T>) -> Self {
        self.workspace = OwnedOrMutRef::MutRef(workspace);
        self
    }

    pub fn with_preconditioner(mut self, preconditioner: Preconditioner<T>) -> Self {
        self.preconditioner = preconditioner;
        self
    }

    /// Weight every reduction by the given per-entry factors; required whenever the
    /// fields replicate shared dofs across ranks, or the halo would be counted once per
    /// sharing rank.
    pub fn with_dot_weights(mut self, weights: &'a [T]) -> Self {
        self.dot_weights = Some(weights);
        self
    }

    pub fn solve<A: LinearOperator<T>>(
        &mut self,
        operator: &A,
        x: &mut [T],
        rhs: &[T],
    ) -> Result<SolveSummary<T>, SolveError<T>> {
        use SolveErrorKind::*;
        assert_eq!(x.len(), rhs.len());

        let mut summary = SolveSummary {
            converged: false,
            iterations: 0,
            residual_norm: T::zero(),
            initial_residual_norm: T::zero(),
        };

        let comm = self.comm;
        let weights = self.dot_weights;
        let Buffers { r, z, p, ap } = self.workspace.prepare_buffers(x.len());

        // r = rhs - A x
        if let Err(err) = operator.apply(r, x) {
            return Err(SolveError::new(summary, OperatorError(err)));
        }
        kernels::scaled_add(T::one(), rhs, -T::one(), r);

        // p = z = M⁻¹ r
        self.preconditioner.apply(z, r);
        p.copy_from_slice(z);

        let mut rdotr =
            dot(weights, comm, r, r).map_err(|err| SolveError::new(summary, CommError(err)))?;
        let mut rdotz = match &self.preconditioner {
            Preconditioner::None => rdotr,
            _ => dot(weights, comm, z, r)
                .map_err(|err| SolveError::new(summary, CommError(err)))?,
        };

        let rhs_norm = match self.criterion {
            StoppingCriterion::Absolute(_) => T::zero(),
            StoppingCriterion::Relative(_) => dot(weights, comm, rhs, rhs)
                .map_err(|err| SolveError::new(summary, CommError(err)))?
                .sqrt(),
        };
        let threshold = self.criterion.threshold(rhs_norm);

        summary.initial_residual_norm = rdotr.sqrt();
        summary.residual_norm = summary.initial_residual_norm;
        log::debug!(
            "cg: initial residual {:?}, threshold {:?}",
            summary.initial_residual_norm,
            threshold
        );

        loop {
            summary.residual_norm = rdotr.sqrt();
            if summary.residual_norm <= threshold {
                summary.converged = true;
                log::debug!(
                    "cg: converged after {} iterations, residual {:?}",
                    summary.iterations,
                    summary.residual_norm
                );
                return Ok(summary);
            }
            if summary.iterations >= self.max_iterations {
                // The cap is a reported outcome, never a silent truncation.
                log::debug!(
                    "cg: iteration cap {} reached, residual {:?}",
                    self.max_iterations,
                    summary.residual_norm
                );
                return Ok(summary);
            }

            // Ap = A p
            if let Err(err) = operator.apply(ap, p) {
                return Err(SolveError::new(summary, OperatorError(err)));
            }
            let pap =
                dot(weights, comm, p, ap).map_err(|err| SolveError::new(summary, CommError(err)))?;

            // pᵀAp <= 0 poisons alpha rather than aborting; the nan rides through the
            // summary so callers relying on convergence detection can see it.
            let alpha = rdotz / pap;

            // x += alpha p, r -= alpha Ap, and the new rᵀr, in one pass.
            rdotr = kernels::fused_cg_update(alpha, p, ap, x, r, weights, comm)
                .map_err(|err| SolveError::new(summary, CommError(err)))?;
            summary.iterations += 1;

            let beta;
            match &self.preconditioner {
                Preconditioner::None => {
                    beta = rdotr / rdotz;
                    rdotz = rdotr;
                    // p = r + beta p
                    kernels::scaled_add(T::one(), r, beta, p);
                }
                preconditioner => {
                    preconditioner.apply(z, r);
                    let rdotz_next = dot(weights, comm, z, r)
                        .map_err(|err| SolveError::new(summary, CommError(err)))?;
                    beta = rdotz_next / rdotz;
                    rdotz = rdotz_next;
                    // p = z + beta p
                    kernels::scaled_add(T::one(), z, beta, p);
                }
            }
        }
    }
}

impl<'a, T: Real, C: Communicator<T>> LinearSolver<T> for ConjugateGradient<'a, T, C> {
    fn solve(
        &mut self,
        operator: &dyn LinearOperator<T>,
        x: &mut [T],
        rhs: &[T],
    ) -> Result<SolveSummary<T>, SolveError<T>> {
        ConjugateGradient::solve(self, &operator, x, rhs)
    }
}
