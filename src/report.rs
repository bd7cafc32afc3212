//! Derived benchmark metrics: closed-form traffic and FLOP models, the smoke-test
//! checksum and the one-line throughput report.
//!
//! The byte and FLOP counts are *models*, derived from the element type, polynomial
//! order, cubature and affine flags; nothing here measures hardware counters. They exist
//! so that timed operator applications can be converted into bandwidth and throughput
//! figures comparable across runs and platforms.

use std::fmt;

use serde::Serialize;

use crate::comm::Communicator;
use crate::error::CommError;
use crate::kernels;
use crate::mesh::ElementType;
use crate::Real;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperatorClass {
    Mass,
    Helmholtz,
}

/// Closed-form traffic/FLOP model for one operator application.
#[derive(Debug, Clone, Serialize)]
pub struct PerfModel {
    pub element_type: ElementType,
    pub operator: OperatorClass,
    pub nodes_per_element: usize,
    pub quadrature_points: usize,
    pub num_fields: usize,
    pub affine: bool,
    pub cubature: bool,
    pub num_global_elements: u64,
    pub num_global_dofs: u64,
    pub scalar_bytes: u64,
    pub index_bytes: u64,
}

impl PerfModel {
    fn nodes_1d(&self) -> u64 {
        nth_root(self.nodes_per_element as u64, self.element_type.reference_dim())
    }

    fn quadrature_1d(&self) -> u64 {
        nth_root(self.quadrature_points as u64, self.element_type.reference_dim())
    }

    /// Estimated bytes moved by one operator application: the gathered field is streamed
    /// once per dof, and each element reads its geometry factors and index maps and writes
    /// its local result.
    pub fn operator_bytes_moved(&self) -> u64 {
        let np = self.nodes_per_element as u64;
        let qp = self.quadrature_points as u64;
        let nf = self.num_fields as u64;
        let nm = self.element_type.metric_len() as u64;
        let sb = self.scalar_bytes;
        let ib = self.index_bytes;

        let geometry_scalars = match (self.operator, self.affine) {
            (OperatorClass::Mass, true) => 1,
            (OperatorClass::Mass, false) => qp,
            (OperatorClass::Helmholtz, true) => 1 + nm,
            (OperatorClass::Helmholtz, false) => qp * (1 + nm),
        };

        self.num_global_dofs * nf * sb
            + (geometry_scalars * sb + ib + np * nf * ib + np * nf * sb)
                * self.num_global_elements
    }

    /// Estimated floating-point operations for one operator application.
    pub fn operator_flops(&self) -> u64 {
        let np = self.nodes_per_element as u64;
        let qp = self.quadrature_points as u64;
        let nq = self.nodes_1d();
        let cq = self.quadrature_1d();
        let d = self.element_type.reference_dim() as u64;
        let nm = self.element_type.metric_len() as u64;

        let mass = if self.element_type.is_tensor_product() {
            if self.cubature {
                // Sum-factorized interpolation down and back plus the pointwise weight.
                match d {
                    2 => 4 * cq * nq * nq + 4 * cq * cq * nq + cq * cq,
                    _ => {
                        4 * cq * nq * nq * nq
                            + 4 * cq * cq * nq * nq
                            + 4 * cq * cq * cq * nq
                            + cq * cq * cq
                    }
                }
            } else {
                // Collocation: diagonal mass.
                2 * np
            }
        } else if self.cubature {
            4 * qp * np + qp
        } else {
            2 * np * np + np
        };

        let stiffness = match self.operator {
            OperatorClass::Mass => 0,
            OperatorClass::Helmholtz => {
                if self.element_type.is_tensor_product() {
                    let m = nq.max(cq);
                    let interp_chain = if self.cubature { d * 2 * m.pow(d as u32 + 1) } else { 0 };
                    // d gradient directions, each a 1-D contraction forward and transposed,
                    // plus the pointwise metric application.
                    2 * d * (2 * nq.pow(d as u32 + 1) + interp_chain) + qp * (2 * d * d) + d * np
                } else if self.affine {
                    nm * (2 * np * np + 2 * np)
                } else {
                    2 * d * (2 * qp * np) + qp * (2 * d * d)
                }
            }
        };

        (mass + stiffness + np) * self.num_fields as u64 * self.num_global_elements
    }

    /// Estimated bytes moved by one CG iteration: one operator application plus the
    /// vector traffic of the reduction and update kernels.
    pub fn cg_bytes_moved(&self, iterations: u64) -> u64 {
        let n = self.num_global_dofs * self.num_fields as u64;
        // pᵀAp reads 2 vectors; the fused update reads p, Ap and read-modify-writes x, r;
        // the search-direction update read-modify-writes p against r (or z).
        let vector_traffic = (2 + 6 + 3) * n * self.scalar_bytes;
        iterations * (self.operator_bytes_moved() + vector_traffic)
    }

    /// Estimated floating-point operations for `iterations` CG iterations.
    pub fn cg_flops(&self, iterations: u64) -> u64 {
        let n = self.num_global_dofs * self.num_fields as u64;
        iterations * (self.operator_flops() + 10 * n)
    }
}

/// Integer `d`-th root for recovering per-axis point counts.
fn nth_root(value: u64, d: usize) -> u64 {
    let mut root = (value as f64).powf(1.0 / d as f64).round() as u64;
    while root.pow(d as u32) > value {
        root -= 1;
    }
    while (root + 1).pow(d as u32) <= value {
        root += 1;
    }
    root
}

/// Global L2 norm of the element-local result field, used as a cross-platform smoke
/// checksum for repeated operator applications.
pub fn checksum<T, C>(local_field: &[T], comm: &C) -> Result<T, CommError>
where
    T: Real,
    C: Communicator<T>,
{
    kernels::norm2(local_field, comm)
}

/// The derived figures for a timed run of repeated operator applications.
#[derive(Debug, Clone, Serialize)]
pub struct ThroughputReport {
    pub degrees_of_freedom: u64,
    pub elapsed_per_apply_secs: f64,
    pub secs_per_dof: f64,
    pub bandwidth_gb_per_sec: f64,
    pub gflops: f64,
    pub dofs_per_rank_sec: f64,
    pub checksum: f64,
}

impl ThroughputReport {
    pub fn new(model: &PerfModel, elapsed_per_apply_secs: f64, ranks: usize, checksum: f64) -> Self {
        let dofs = model.num_global_dofs * model.num_fields as u64;
        Self {
            degrees_of_freedom: dofs,
            elapsed_per_apply_secs,
            secs_per_dof: elapsed_per_apply_secs / dofs as f64,
            bandwidth_gb_per_sec: model.operator_bytes_moved() as f64
                / (1.0e9 * elapsed_per_apply_secs),
            gflops: model.operator_flops() as f64 / (1.0e9 * elapsed_per_apply_secs),
            dofs_per_rank_sec: dofs as f64 / (ranks as f64 * elapsed_per_apply_secs),
            checksum,
        }
    }
}

impl fmt::Display for ThroughputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DOFs={}, elapsed={:.4e}, time per DOF={:.2e}, avg BW (GB/s)={:.1}, avg GFLOPs={:.1}, DOFs/ranks*time={:.2e}, checksum={:.6e}",
            self.degrees_of_freedom,
            self.elapsed_per_apply_secs,
            self.secs_per_dof,
            self.bandwidth_gb_per_sec,
            self.gflops,
            self.dofs_per_rank_sec,
            self.checksum
        )
    }
}
