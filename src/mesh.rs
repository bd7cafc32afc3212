//! Mesh-derived input data: reference-element operators, geometric factors and the raw
//! connectivity a partitioner hands to each rank.
//!
//! Everything in this module is built once at setup and is immutable afterwards, so it can
//! be shared freely by concurrent element and dof tasks. Mesh generation and topology
//! loading are outside the crate; [`crate::procedural`] provides small structured meshes
//! for tests and benchmarks.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::SetupError;
use crate::Real;

/// Sentinel for a local node slot that was never assigned a global node id.
///
/// Encountering it during setup is fatal; see [`SetupError::OrphanLocalSlot`].
pub const UNASSIGNED_NODE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    Triangle,
    Tetrahedron,
    Quadrilateral,
    Hexahedron,
}

impl ElementType {
    pub fn reference_dim(&self) -> usize {
        match self {
            ElementType::Triangle | ElementType::Quadrilateral => 2,
            ElementType::Tetrahedron | ElementType::Hexahedron => 3,
        }
    }

    /// Tensor-product elements run the sum-factorized contraction path; simplices run the
    /// dense per-element path.
    pub fn is_tensor_product(&self) -> bool {
        matches!(self, ElementType::Quadrilateral | ElementType::Hexahedron)
    }

    /// Number of independent entries in the symmetric metric tensor, `d (d + 1) / 2`.
    pub fn metric_len(&self) -> usize {
        let d = self.reference_dim();
        d * (d + 1) / 2
    }
}

/// Index of the `(a, b)` entry of the packed symmetric metric tensor.
///
/// Entries are stored row-major over the upper triangle: in 2d `[G00, G01, G11]`, in 3d
/// `[G00, G01, G02, G11, G12, G22]`.
pub(crate) fn metric_index(dim: usize, a: usize, b: usize) -> usize {
    let (a, b) = if a <= b { (a, b) } else { (b, a) };
    debug_assert!(b < dim);
    a * dim - a * (a + 1) / 2 + b
}

/// Expand a 1-D quadrature weight vector to the tensor-product weight of every grid point,
/// first axis fastest.
pub(crate) fn tensor_weights<T: Real>(weights_1d: &DVector<T>, dim: usize) -> Vec<T> {
    let n = weights_1d.len();
    let mut out = Vec::with_capacity(n.pow(dim as u32));
    match dim {
        2 => {
            for j in 0..n {
                for i in 0..n {
                    out.push(weights_1d[i] * weights_1d[j]);
                }
            }
        }
        3 => {
            for k in 0..n {
                for j in 0..n {
                    for i in 0..n {
                        out.push(weights_1d[i] * weights_1d[j] * weights_1d[k]);
                    }
                }
            }
        }
        _ => unreachable!("tensor-product elements are two- or three-dimensional"),
    }
    out
}

/// Reference-element operators for the dense simplex contraction path.
///
/// `mass` and the per-direction differentiation matrices are nodal (`Np × Np`); the
/// cubature block holds the same operators evaluated on a finer quadrature rule.
#[derive(Debug, Clone)]
pub struct SimplexReferenceElement<T: Real> {
    pub element_type: ElementType,
    pub nodes_per_element: usize,
    pub mass: DMatrix<T>,
    pub diff: Vec<DMatrix<T>>,
    pub cubature: Option<SimplexCubature<T>>,
}

/// Interpolation/differentiation from the `Np` nodal points to `cubNp` cubature points,
/// together with the reference quadrature weights of that rule.
#[derive(Debug, Clone)]
pub struct SimplexCubature<T: Real> {
    pub interp: DMatrix<T>,
    pub diff: Vec<DMatrix<T>>,
    pub weights: DVector<T>,
}

/// Reference-element operators for the tensor-product (quadrilateral/hexahedron) path.
///
/// Only one-dimensional operators are stored; the multi-dimensional operators are never
/// formed, they are applied axis by axis (sum factorization).
#[derive(Debug, Clone)]
pub struct TensorReferenceElement<T: Real> {
    pub element_type: ElementType,
    pub nodes_1d: usize,
    pub weights_1d: DVector<T>,
    pub diff_1d: DMatrix<T>,
    pub cubature: Option<TensorCubature<T>>,
}

#[derive(Debug, Clone)]
pub struct TensorCubature<T: Real> {
    pub interp_1d: DMatrix<T>,
    pub weights_1d: DVector<T>,
}

#[derive(Debug, Clone)]
pub enum ReferenceElement<T: Real> {
    Simplex(SimplexReferenceElement<T>),
    TensorProduct(TensorReferenceElement<T>),
}

impl<T: Real> ReferenceElement<T> {
    pub fn element_type(&self) -> ElementType {
        match self {
            ReferenceElement::Simplex(s) => s.element_type,
            ReferenceElement::TensorProduct(t) => t.element_type,
        }
    }

    pub fn nodes_per_element(&self) -> usize {
        match self {
            ReferenceElement::Simplex(s) => s.nodes_per_element,
            ReferenceElement::TensorProduct(t) => {
                t.nodes_1d.pow(t.element_type.reference_dim() as u32)
            }
        }
    }

    pub fn has_cubature(&self) -> bool {
        match self {
            ReferenceElement::Simplex(s) => s.cubature.is_some(),
            ReferenceElement::TensorProduct(t) => t.cubature.is_some(),
        }
    }

    /// Total number of quadrature points per element: the cubature point count when a
    /// cubature rule is attached, the nodal point count otherwise. Geometric factor arrays
    /// in the curved representation are sized by this.
    pub fn quadrature_points(&self) -> usize {
        match self {
            ReferenceElement::Simplex(s) => match &s.cubature {
                Some(cub) => cub.interp.nrows(),
                None => s.nodes_per_element,
            },
            ReferenceElement::TensorProduct(t) => {
                let d = t.element_type.reference_dim() as u32;
                match &t.cubature {
                    Some(cub) => cub.interp_1d.nrows().pow(d),
                    None => t.nodes_1d.pow(d),
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        match self {
            ReferenceElement::Simplex(s) => {
                let np = s.nodes_per_element;
                let dim = s.element_type.reference_dim();
                if s.element_type.is_tensor_product() {
                    return Err(SetupError::UnsupportedElement {
                        element_type: s.element_type,
                        detail: "tensor-product element supplied with simplex operators",
                    });
                }
                check_dims("simplex mass matrix", s.mass.nrows() * s.mass.ncols(), np * np)?;
                check_dims("simplex differentiation matrices", s.diff.len(), dim)?;
                for d in &s.diff {
                    check_dims("simplex differentiation matrix", d.nrows() * d.ncols(), np * np)?;
                }
                if let Some(cub) = &s.cubature {
                    let nq = cub.interp.nrows();
                    check_dims("cubature interpolation columns", cub.interp.ncols(), np)?;
                    check_dims("cubature weights", cub.weights.len(), nq)?;
                    check_dims("cubature differentiation matrices", cub.diff.len(), dim)?;
                    for d in &cub.diff {
                        check_dims("cubature differentiation rows", d.nrows(), nq)?;
                        check_dims("cubature differentiation columns", d.ncols(), np)?;
                    }
                }
            }
            ReferenceElement::TensorProduct(t) => {
                let n = t.nodes_1d;
                if !t.element_type.is_tensor_product() {
                    return Err(SetupError::UnsupportedElement {
                        element_type: t.element_type,
                        detail: "simplex element supplied with tensor-product operators",
                    });
                }
                check_dims("1d quadrature weights", t.weights_1d.len(), n)?;
                check_dims("1d differentiation matrix", t.diff_1d.nrows() * t.diff_1d.ncols(), n * n)?;
                if let Some(cub) = &t.cubature {
                    check_dims("1d cubature interpolation columns", cub.interp_1d.ncols(), n)?;
                    check_dims("1d cubature weights", cub.weights_1d.len(), cub.interp_1d.nrows())?;
                }
            }
        }
        Ok(())
    }
}

/// Geometric weight arrays, one flavor per mesh.
///
/// The affine representation stores one Jacobian scalar and one constant metric tensor per
/// element; reference quadrature weights are applied on the fly. The curved representation
/// stores fully premultiplied factors (quadrature weight included) per quadrature point.
/// The `metric` array may be empty for mass-only problems.
#[derive(Debug, Clone)]
pub enum GeometricFactors<T> {
    Affine {
        /// `J_e` per element.
        jacobian: Vec<T>,
        /// `J_e ∇ξ_a · ∇ξ_b` per element, packed symmetric; empty when no stiffness term
        /// will ever be applied.
        metric: Vec<T>,
    },
    Curved {
        /// `w_q J_q` per element and quadrature point.
        weighted_jacobian: Vec<T>,
        /// `w_q J_q ∇ξ_a · ∇ξ_b` per element and quadrature point, packed symmetric.
        metric: Vec<T>,
    },
}

impl<T> GeometricFactors<T> {
    pub fn is_affine(&self) -> bool {
        matches!(self, GeometricFactors::Affine { .. })
    }

    pub fn has_metric(&self) -> bool {
        match self {
            GeometricFactors::Affine { metric, .. } => !metric.is_empty(),
            GeometricFactors::Curved { metric, .. } => !metric.is_empty(),
        }
    }

    fn validate(
        &self,
        num_elements: usize,
        quadrature_points: usize,
        metric_len: usize,
    ) -> Result<(), SetupError> {
        match self {
            GeometricFactors::Affine { jacobian, metric } => {
                check_dims("affine Jacobians", jacobian.len(), num_elements)?;
                if !metric.is_empty() {
                    check_dims("affine metric factors", metric.len(), num_elements * metric_len)?;
                }
            }
            GeometricFactors::Curved {
                weighted_jacobian,
                metric,
            } => {
                check_dims(
                    "curved weighted Jacobians",
                    weighted_jacobian.len(),
                    num_elements * quadrature_points,
                )?;
                if !metric.is_empty() {
                    check_dims(
                        "curved metric factors",
                        metric.len(),
                        num_elements * quadrature_points * metric_len,
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// The global ids this partition shares with one neighboring rank.
///
/// Produced by the partitioner together with the element distribution; shared-dof
/// discovery is not the solver's job.
#[derive(Debug, Clone)]
pub struct HaloNeighbor {
    pub rank: usize,
    /// Sorted global node ids known to both ranks.
    pub shared_nodes: Vec<u64>,
}

/// Per-rank element connectivity: one global node id per element-local node slot.
#[derive(Debug, Clone)]
pub struct MeshPartition {
    pub num_elements: usize,
    pub nodes_per_element: usize,
    /// Element-major: slot `e * nodes_per_element + n` holds the global id of node `n` of
    /// element `e`. Multiple slots carrying the same id is what makes dofs shared.
    pub global_node_ids: Vec<u64>,
    pub neighbors: Vec<HaloNeighbor>,
}

impl MeshPartition {
    pub fn num_local_nodes(&self) -> usize {
        self.num_elements * self.nodes_per_element
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        check_dims(
            "global node ids",
            self.global_node_ids.len(),
            self.num_local_nodes(),
        )?;
        Ok(())
    }
}

/// Everything the solver needs from the mesh side: connectivity, reference operators and
/// geometric factors, checked for mutual consistency at setup.
#[derive(Debug, Clone)]
pub struct Mesh<T: Real> {
    pub partition: MeshPartition,
    pub reference: ReferenceElement<T>,
    pub geometry: GeometricFactors<T>,
}

impl<T: Real> Mesh<T> {
    pub fn element_type(&self) -> ElementType {
        self.reference.element_type()
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        self.reference.validate()?;
        self.partition.validate()?;
        check_dims(
            "nodes per element",
            self.partition.nodes_per_element,
            self.reference.nodes_per_element(),
        )?;
        self.geometry.validate(
            self.partition.num_elements,
            self.reference.quadrature_points(),
            self.element_type().metric_len(),
        )
    }
}

fn check_dims(context: &'static str, actual: usize, expected: usize) -> Result<(), SetupError> {
    if actual == expected {
        Ok(())
    } else {
        Err(SetupError::DimensionMismatch {
            context,
            expected,
            actual,
        })
    }
}
