//! Error taxonomy for solver setup and communication.
//!
//! Setup errors abort initialization synchronously; no partially constructed solver is
//! usable afterwards. Numeric anomalies (non-convergence, `nan` propagation from
//! indefinite operators) are *not* errors: they are reported through
//! [`SolveSummary`](crate::cg::SolveSummary).

use crate::mesh::ElementType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    /// A local node slot carries the unassigned-id sentinel, so it maps to no global dof.
    #[error("local node slot {slot} has no global node id assigned")]
    OrphanLocalSlot { slot: usize },

    /// A gathered dof ended up with no local image. Cannot happen for correspondence
    /// tables built from connectivity, but imported tables are checked all the same.
    #[error("gathered dof {dof} has no local image")]
    EmptyGatheredDof { dof: usize },

    /// A neighbor's shared-node list mentions a global id that this partition never touches.
    #[error("neighbor rank {rank} lists shared node {id} which is not part of this partition")]
    UnknownSharedNode { rank: usize, id: u64 },

    /// The element type has no contraction path for the requested configuration.
    #[error("no contraction path for {element_type:?}: {detail}")]
    UnsupportedElement {
        element_type: ElementType,
        detail: &'static str,
    },

    /// Geometric factors required by the requested operator are absent.
    #[error("geometric factors are missing {what}")]
    MissingGeometry { what: &'static str },

    #[error("size mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The operator diagonal is not strictly positive, so a Jacobi sweep cannot be built.
    #[error("operator diagonal entry {index} is not strictly positive")]
    DegenerateDiagonal { index: usize },

    #[error(transparent)]
    Comm(#[from] CommError),
}

/// Communication failures are fatal to the operation that triggered them; the core never
/// retries an exchange or a reduction.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("rank {rank} is no longer reachable")]
    Disconnected { rank: usize },

    #[error("halo message from rank {rank} has length {actual}, expected {expected}")]
    MessageSize {
        rank: usize,
        expected: usize,
        actual: usize,
    },
}
