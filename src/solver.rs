//! Solver entry points: `setup`, `solve` and the standalone operator application.
//!
//! [`EllipticSolver`] owns everything with process lifetime — the gather-scatter engine,
//! the contraction path and the mesh tables — and lends out [`EllipticOperator`]s that
//! borrow them. Per-solve state (the CG scratch vectors) is owned by the solver and reused
//! across solves.

use std::error::Error;

use num::Zero;
use serde::{Deserialize, Serialize};

use crate::cg::{
    CgWorkspace, ConjugateGradient, Preconditioner, SolveError, SolveErrorKind, SolveSummary,
    StoppingCriterion,
};
use crate::comm::Communicator;
use crate::error::SetupError;
use crate::gather::GatherScatter;
use crate::mesh::Mesh;
use crate::operator::{ContractionPath, EllipticOperator, LinearOperator, ProblemKind};
use crate::report::{OperatorClass, PerfModel};
use crate::Real;

/// What to solve: the operator and the number of independent fields it acts on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProblemConfig<T> {
    pub kind: ProblemKind<T>,
    pub num_fields: usize,
}

/// Preconditioning choices for [`EllipticSolver::solve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preconditioning {
    None,
    Jacobi,
}

/// Per-solve settings; the tolerance convention and the iteration cap are always supplied
/// by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveSettings<T> {
    pub criterion: StoppingCriterion<T>,
    pub max_iterations: usize,
    pub preconditioning: Preconditioning,
}

/// A fully set-up matrix-free solver over one mesh partition.
pub struct EllipticSolver<T: Real, C: Communicator<T>> {
    comm: C,
    mesh: Mesh<T>,
    gs: GatherScatter<T>,
    path: ContractionPath<T>,
    kind: ProblemKind<T>,
    num_fields: usize,
    num_global_elements: u64,
    /// Reduction weights tiled per field; `None` when no dof is shared across ranks.
    dot_weights: Option<Vec<T>>,
    cg_workspace: CgWorkspace<T>,
}

impl<T: Real, C: Communicator<T>> EllipticSolver<T, C> {
    /// Build the dof correspondence, halo plan and contraction path for `mesh`.
    ///
    /// Collective over `comm`: every rank must call `setup` together. Any inconsistency in
    /// the mesh tables aborts setup synchronously; no partially usable solver exists
    /// afterwards.
    pub fn setup(mesh: Mesh<T>, config: ProblemConfig<T>, comm: C) -> Result<Self, SetupError> {
        if config.num_fields == 0 {
            return Err(SetupError::DimensionMismatch {
                context: "field count",
                expected: 1,
                actual: 0,
            });
        }
        mesh.validate()?;
        let gs = GatherScatter::new(&mesh.partition, &comm)?;
        let path = ContractionPath::new(&mesh.reference, &mesh.geometry, &config.kind)?;
        let num_global_elements =
            comm.all_reduce_sum_u64(mesh.partition.num_elements as u64)?;

        log::info!(
            "elliptic solver: {:?} elements (global {}), {} global dofs, {} fields",
            mesh.element_type(),
            num_global_elements,
            gs.num_global_dofs(),
            config.num_fields
        );

        // Shared dofs are replicated on every rank that sees them, so cross-rank
        // reductions weight by the inverse rank multiplicity.
        let dot_weights = gs.has_halo().then(|| {
            let inverse_multiplicity = gs.inverse_multiplicity();
            let mut weights = Vec::with_capacity(config.num_fields * inverse_multiplicity.len());
            for _ in 0..config.num_fields {
                weights.extend_from_slice(inverse_multiplicity);
            }
            weights
        });

        Ok(Self {
            comm,
            mesh,
            gs,
            path,
            kind: config.kind,
            num_fields: config.num_fields,
            num_global_elements,
            dot_weights,
            cg_workspace: CgWorkspace::default(),
        })
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn mesh(&self) -> &Mesh<T> {
        &self.mesh
    }

    pub fn kind(&self) -> ProblemKind<T> {
        self.kind
    }

    pub fn num_fields(&self) -> usize {
        self.num_fields
    }

    /// Gathered dofs visible on this rank (one field).
    pub fn num_gathered_dofs(&self) -> usize {
        self.gs.num_gathered()
    }

    /// Globally unique dofs over all ranks (one field).
    pub fn num_global_dofs(&self) -> u64 {
        self.gs.num_global_dofs()
    }

    /// Length of a gathered multi-field buffer on this rank, as accepted by
    /// [`solve`](Self::solve) and [`apply_operator`](Self::apply_operator).
    pub fn field_len(&self) -> usize {
        self.num_fields * self.gs.num_gathered()
    }

    pub fn gather_scatter(&self) -> &GatherScatter<T> {
        &self.gs
    }

    /// Borrow the matrix-free operator. Harnesses timing repeated applications should
    /// take the operator once and reuse it, so its local buffers are pooled across calls.
    pub fn operator(&self) -> EllipticOperator<'_, T, C> {
        EllipticOperator::new(
            self.kind,
            &self.path,
            &self.mesh.geometry,
            &self.gs,
            &self.comm,
            self.mesh.partition.num_elements,
            self.num_fields,
        )
    }

    /// Standalone operator application, exposed for benchmarking.
    pub fn apply_operator(&self, aq: &mut [T], q: &[T]) -> Result<(), Box<dyn Error>> {
        self.operator().apply(aq, q)
    }

    /// Solve `A x = rhs` with Conjugate Gradient, starting from the supplied `x`.
    ///
    /// Non-convergence within `settings.max_iterations` is reported through the summary,
    /// not as an error.
    pub fn solve(
        &mut self,
        x: &mut [T],
        rhs: &[T],
        settings: &SolveSettings<T>,
    ) -> Result<SolveSummary<T>, SolveError<T>> {
        assert_eq!(x.len(), self.field_len());
        assert_eq!(rhs.len(), self.field_len());

        let preconditioner = match settings.preconditioning {
            Preconditioning::None => Preconditioner::None,
            Preconditioning::Jacobi => {
                self.build_jacobi().map_err(|err| SolveError {
                    summary: SolveSummary {
                        converged: false,
                        iterations: 0,
                        residual_norm: T::zero(),
                        initial_residual_norm: T::zero(),
                    },
                    kind: SolveErrorKind::OperatorError(err),
                })?
            }
        };

        let mut workspace = std::mem::take(&mut self.cg_workspace);
        let result = {
            let operator = self.operator();
            let mut cg =
                ConjugateGradient::new(&self.comm, settings.criterion, settings.max_iterations)
                    .with_workspace(&mut workspace)
                    .with_preconditioner(preconditioner);
            if let Some(weights) = &self.dot_weights {
                cg = cg.with_dot_weights(weights);
            }
            cg.solve(&operator, x, rhs)
        };
        self.cg_workspace = workspace;
        result
    }

    /// Assemble the Jacobi preconditioner from the gathered operator diagonal.
    pub fn build_jacobi(&self) -> Result<Preconditioner<T>, Box<dyn Error>> {
        let mut diagonal = vec![T::zero(); self.gs.num_gathered()];
        self.operator().diagonal(&mut diagonal)?;
        Ok(Preconditioner::jacobi(&diagonal)?)
    }

    /// The closed-form performance model for one operator application on this problem.
    pub fn perf_model(&self) -> PerfModel {
        PerfModel {
            element_type: self.mesh.element_type(),
            operator: match self.kind {
                ProblemKind::Mass => OperatorClass::Mass,
                ProblemKind::Helmholtz { .. } => OperatorClass::Helmholtz,
            },
            nodes_per_element: self.mesh.reference.nodes_per_element(),
            quadrature_points: self.mesh.reference.quadrature_points(),
            num_fields: self.num_fields,
            affine: self.mesh.geometry.is_affine(),
            cubature: self.mesh.reference.has_cubature(),
            num_global_elements: self.num_global_elements,
            num_global_dofs: self.gs.num_global_dofs(),
            scalar_bytes: std::mem::size_of::<T>() as u64,
            index_bytes: std::mem::size_of::<u32>() as u64,
        }
    }
}
