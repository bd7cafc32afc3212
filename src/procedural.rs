//! Procedurally generated structured meshes for tests and benchmarks.
//!
//! These are not a general mesh pipeline — topology input stays outside the crate — but
//! they produce fully consistent [`Mesh`] bundles for small uniform grids: unit-square
//! quadrilateral and triangle meshes, unit-cube hexahedron meshes, a rewrite of affine
//! factors into per-point curved arrays, and a contiguous element partitioner with
//! shared-node neighbor lists for multi-rank tests.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};
use numeric_literals::replace_float_literals;

use crate::mesh::{
    tensor_weights, ElementType, GeometricFactors, HaloNeighbor, Mesh, MeshPartition,
    ReferenceElement, SimplexCubature, SimplexReferenceElement, TensorCubature,
    TensorReferenceElement,
};
use crate::Real;

/// Gauss-Lobatto-Legendre points and weights on `[-1, 1]`.
fn gll_rule(degree: usize) -> (Vec<f64>, Vec<f64>) {
    match degree {
        1 => (vec![-1.0, 1.0], vec![1.0, 1.0]),
        2 => (
            vec![-1.0, 0.0, 1.0],
            vec![1.0 / 3.0, 4.0 / 3.0, 1.0 / 3.0],
        ),
        _ => panic!("procedural meshes support polynomial degrees 1 and 2"),
    }
}

/// Gauss-Legendre points and weights on `[-1, 1]`.
fn gauss_rule(points: usize) -> (Vec<f64>, Vec<f64>) {
    match points {
        1 => (vec![0.0], vec![2.0]),
        2 => {
            let g = 1.0 / 3.0_f64.sqrt();
            (vec![-g, g], vec![1.0, 1.0])
        }
        3 => {
            let g = (3.0_f64 / 5.0).sqrt();
            (
                vec![-g, 0.0, g],
                vec![5.0 / 9.0, 8.0 / 9.0, 5.0 / 9.0],
            )
        }
        _ => panic!("procedural meshes support Gauss rules with up to 3 points"),
    }
}

fn lagrange(nodes: &[f64], m: usize, x: f64) -> f64 {
    let mut value = 1.0;
    for (k, &node) in nodes.iter().enumerate() {
        if k != m {
            value *= (x - node) / (nodes[m] - node);
        }
    }
    value
}

fn lagrange_derivative(nodes: &[f64], m: usize, x: f64) -> f64 {
    let mut sum = 0.0;
    for (j, &node_j) in nodes.iter().enumerate() {
        if j == m {
            continue;
        }
        let mut term = 1.0 / (nodes[m] - node_j);
        for (k, &node_k) in nodes.iter().enumerate() {
            if k != m && k != j {
                term *= (x - node_k) / (nodes[m] - node_k);
            }
        }
        sum += term;
    }
    sum
}

/// `D[i][m] = l_m'(x_i)` on the nodal points.
fn differentiation_matrix(nodes: &[f64]) -> DMatrix<f64> {
    let n = nodes.len();
    DMatrix::from_fn(n, n, |i, m| lagrange_derivative(nodes, m, nodes[i]))
}

/// `I[c][m] = l_m(x_c)` from the nodal points to arbitrary target points.
fn interpolation_matrix(nodes: &[f64], targets: &[f64]) -> DMatrix<f64> {
    DMatrix::from_fn(targets.len(), nodes.len(), |c, m| {
        lagrange(nodes, m, targets[c])
    })
}

fn convert_matrix<T: Real>(matrix: &DMatrix<f64>) -> DMatrix<T> {
    matrix.map(|value| T::from_f64(value).expect("matrix entry must fit in T"))
}

fn convert_vector<T: Real>(values: &[f64]) -> DVector<T> {
    DVector::from_iterator(
        values.len(),
        values
            .iter()
            .map(|&value| T::from_f64(value).expect("weight must fit in T")),
    )
}

fn convert_scalars<T: Real>(values: &[f64]) -> Vec<T> {
    values
        .iter()
        .map(|&value| T::from_f64(value).expect("factor must fit in T"))
        .collect()
}

/// A uniform `cells_x × cells_y` quadrilateral mesh of the unit square with GLL nodes of
/// the given degree, optionally carrying a Gauss cubature rule of matching accuracy.
pub fn unit_square_quad_mesh<T: Real>(
    cells_x: usize,
    cells_y: usize,
    degree: usize,
    with_cubature: bool,
) -> Mesh<T> {
    assert!(cells_x > 0 && cells_y > 0);
    let (nodes, weights) = gll_rule(degree);
    let n1d = degree + 1;
    let points_x = cells_x * degree + 1;

    let mut global_node_ids = Vec::with_capacity(cells_x * cells_y * n1d * n1d);
    for ey in 0..cells_y {
        for ex in 0..cells_x {
            for j in 0..n1d {
                for i in 0..n1d {
                    let ix = ex * degree + i;
                    let iy = ey * degree + j;
                    global_node_ids.push((iy * points_x + ix) as u64);
                }
            }
        }
    }

    let reference = ReferenceElement::TensorProduct(TensorReferenceElement {
        element_type: ElementType::Quadrilateral,
        nodes_1d: n1d,
        weights_1d: convert_vector(&weights),
        diff_1d: convert_matrix(&differentiation_matrix(&nodes)),
        cubature: with_cubature.then(|| {
            let (gauss_nodes, gauss_weights) = gauss_rule(degree + 1);
            TensorCubature {
                interp_1d: convert_matrix(&interpolation_matrix(&nodes, &gauss_nodes)),
                weights_1d: convert_vector(&gauss_weights),
            }
        }),
    });

    let hx = 1.0 / cells_x as f64;
    let hy = 1.0 / cells_y as f64;
    let num_elements = cells_x * cells_y;
    let mut jacobian = Vec::with_capacity(num_elements);
    let mut metric = Vec::with_capacity(num_elements * 3);
    for _ in 0..num_elements {
        jacobian.push(hx * hy / 4.0);
        metric.extend_from_slice(&[hy / hx, 0.0, hx / hy]);
    }

    Mesh {
        partition: MeshPartition {
            num_elements,
            nodes_per_element: n1d * n1d,
            global_node_ids,
            neighbors: Vec::new(),
        },
        reference,
        geometry: GeometricFactors::Affine {
            jacobian: convert_scalars(&jacobian),
            metric: convert_scalars(&metric),
        },
    }
}

/// Coordinates of every gathered dof of [`unit_square_quad_mesh`], ordered by global node
/// id (which is the gathered ordering).
pub fn quad_dof_coordinates<T: Real>(
    cells_x: usize,
    cells_y: usize,
    degree: usize,
) -> Vec<[T; 2]> {
    let points_x = cells_x * degree + 1;
    let points_y = cells_y * degree + 1;
    let mut coordinates = Vec::with_capacity(points_x * points_y);
    for iy in 0..points_y {
        for ix in 0..points_x {
            // GLL nodes of degree <= 2 are equispaced, so the grid is uniform.
            let x = ix as f64 / (cells_x * degree) as f64;
            let y = iy as f64 / (cells_y * degree) as f64;
            coordinates.push([
                T::from_f64(x).expect("coordinate must fit in T"),
                T::from_f64(y).expect("coordinate must fit in T"),
            ]);
        }
    }
    coordinates
}

/// P1 reference operators on the triangle (0,0)-(1,0)-(0,1): exact nodal mass, constant
/// basis gradients, and optionally a degree-2 interior cubature rule (exact for products
/// of linear basis functions).
#[rustfmt::skip]
#[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
fn triangle_reference<T: Real>(with_cubature: bool) -> ReferenceElement<T> {
    let mass = DMatrix::from_row_slice(3, 3, &[
        1.0 / 12.0, 1.0 / 24.0, 1.0 / 24.0,
        1.0 / 24.0, 1.0 / 12.0, 1.0 / 24.0,
        1.0 / 24.0, 1.0 / 24.0, 1.0 / 12.0,
    ]);
    let diff_r = DMatrix::from_row_slice(3, 3, &[
        -1.0, 1.0, 0.0,
        -1.0, 1.0, 0.0,
        -1.0, 1.0, 0.0,
    ]);
    let diff_s = DMatrix::from_row_slice(3, 3, &[
        -1.0, 0.0, 1.0,
        -1.0, 0.0, 1.0,
        -1.0, 0.0, 1.0,
    ]);

    let cubature = with_cubature.then(|| SimplexCubature {
        // Basis values at the interior points (1/6, 1/6), (2/3, 1/6), (1/6, 2/3).
        interp: DMatrix::from_row_slice(3, 3, &[
            2.0 / 3.0, 1.0 / 6.0, 1.0 / 6.0,
            1.0 / 6.0, 2.0 / 3.0, 1.0 / 6.0,
            1.0 / 6.0, 1.0 / 6.0, 2.0 / 3.0,
        ]),
        diff: vec![diff_r.clone(), diff_s.clone()],
        weights: DVector::from_column_slice(&[1.0 / 6.0, 1.0 / 6.0, 1.0 / 6.0]),
    });

    ReferenceElement::Simplex(SimplexReferenceElement {
        element_type: ElementType::Triangle,
        nodes_per_element: 3,
        mass,
        diff: vec![diff_r, diff_s],
        cubature,
    })
}

/// A uniform triangle mesh of the unit square (each grid cell split in two), with linear
/// elements and, optionally, a degree-2 interior cubature rule.
pub fn unit_square_triangle_mesh<T: Real>(
    cells_x: usize,
    cells_y: usize,
    with_cubature: bool,
) -> Mesh<T> {
    assert!(cells_x > 0 && cells_y > 0);
    let points_x = cells_x + 1;
    let vertex = |ix: usize, iy: usize| (iy * points_x + ix) as u64;

    let mut global_node_ids = Vec::with_capacity(cells_x * cells_y * 6);
    for ey in 0..cells_y {
        for ex in 0..cells_x {
            // Lower-left triangle, then the complementary upper-right one.
            global_node_ids.extend_from_slice(&[
                vertex(ex, ey),
                vertex(ex + 1, ey),
                vertex(ex, ey + 1),
            ]);
            global_node_ids.extend_from_slice(&[
                vertex(ex + 1, ey + 1),
                vertex(ex, ey + 1),
                vertex(ex + 1, ey),
            ]);
        }
    }

    let reference = triangle_reference::<T>(with_cubature);

    let hx = 1.0 / cells_x as f64;
    let hy = 1.0 / cells_y as f64;
    let num_elements = 2 * cells_x * cells_y;
    let mut jacobian = Vec::with_capacity(num_elements);
    let mut metric = Vec::with_capacity(num_elements * 3);
    for _ in 0..num_elements {
        jacobian.push(hx * hy);
        metric.extend_from_slice(&[hy / hx, 0.0, hx / hy]);
    }

    Mesh {
        partition: MeshPartition {
            num_elements,
            nodes_per_element: 3,
            global_node_ids,
            neighbors: Vec::new(),
        },
        reference,
        geometry: GeometricFactors::Affine {
            jacobian: convert_scalars(&jacobian),
            metric: convert_scalars(&metric),
        },
    }
}

/// Coordinates of every gathered dof of [`unit_square_triangle_mesh`], ordered by global
/// node id.
pub fn triangle_dof_coordinates<T: Real>(cells_x: usize, cells_y: usize) -> Vec<[T; 2]> {
    quad_dof_coordinates::<T>(cells_x, cells_y, 1)
}

/// A uniform trilinear hexahedron mesh of the unit cube.
pub fn unit_cube_hex_mesh<T: Real>(cells_x: usize, cells_y: usize, cells_z: usize) -> Mesh<T> {
    assert!(cells_x > 0 && cells_y > 0 && cells_z > 0);
    let (nodes, weights) = gll_rule(1);
    let points_x = cells_x + 1;
    let points_y = cells_y + 1;

    let mut global_node_ids = Vec::with_capacity(cells_x * cells_y * cells_z * 8);
    for ez in 0..cells_z {
        for ey in 0..cells_y {
            for ex in 0..cells_x {
                for k in 0..2 {
                    for j in 0..2 {
                        for i in 0..2 {
                            let ix = ex + i;
                            let iy = ey + j;
                            let iz = ez + k;
                            global_node_ids
                                .push(((iz * points_y + iy) * points_x + ix) as u64);
                        }
                    }
                }
            }
        }
    }

    let reference = ReferenceElement::TensorProduct(TensorReferenceElement {
        element_type: ElementType::Hexahedron,
        nodes_1d: 2,
        weights_1d: convert_vector(&weights),
        diff_1d: convert_matrix(&differentiation_matrix(&nodes)),
        cubature: None,
    });

    let hx = 1.0 / cells_x as f64;
    let hy = 1.0 / cells_y as f64;
    let hz = 1.0 / cells_z as f64;
    let num_elements = cells_x * cells_y * cells_z;
    let jacobian_e = hx * hy * hz / 8.0;
    let metric_e = [
        hy * hz / (2.0 * hx),
        0.0,
        0.0,
        hx * hz / (2.0 * hy),
        0.0,
        hx * hy / (2.0 * hz),
    ];
    let mut jacobian = Vec::with_capacity(num_elements);
    let mut metric = Vec::with_capacity(num_elements * 6);
    for _ in 0..num_elements {
        jacobian.push(jacobian_e);
        metric.extend_from_slice(&metric_e);
    }

    Mesh {
        partition: MeshPartition {
            num_elements,
            nodes_per_element: 8,
            global_node_ids,
            neighbors: Vec::new(),
        },
        reference,
        geometry: GeometricFactors::Affine {
            jacobian: convert_scalars(&jacobian),
            metric: convert_scalars(&metric),
        },
    }
}

/// Coordinates of every gathered dof of [`unit_cube_hex_mesh`], ordered by global node id.
pub fn hex_dof_coordinates<T: Real>(
    cells_x: usize,
    cells_y: usize,
    cells_z: usize,
) -> Vec<[T; 3]> {
    let mut coordinates = Vec::new();
    for iz in 0..=cells_z {
        for iy in 0..=cells_y {
            for ix in 0..=cells_x {
                coordinates.push([
                    T::from_f64(ix as f64 / cells_x as f64).expect("coordinate must fit in T"),
                    T::from_f64(iy as f64 / cells_y as f64).expect("coordinate must fit in T"),
                    T::from_f64(iz as f64 / cells_z as f64).expect("coordinate must fit in T"),
                ]);
            }
        }
    }
    coordinates
}

/// Rewrite affine geometric factors as per-quadrature-point curved arrays.
///
/// The resulting mesh describes the identical operator through the curved contraction
/// path, which makes it the reference fixture for path-equivalence tests. A simplex mesh
/// must carry a cubature rule, since the curved simplex path integrates on it.
pub fn expand_to_curved<T: Real>(mesh: &Mesh<T>) -> Mesh<T> {
    let (jacobian, metric) = match &mesh.geometry {
        GeometricFactors::Affine { jacobian, metric } => (jacobian, metric),
        GeometricFactors::Curved { .. } => return mesh.clone(),
    };

    let point_weights: Vec<T> = match &mesh.reference {
        ReferenceElement::TensorProduct(tensor) => match &tensor.cubature {
            Some(cub) => tensor_weights(&cub.weights_1d, tensor.element_type.reference_dim()),
            None => tensor_weights(&tensor.weights_1d, tensor.element_type.reference_dim()),
        },
        ReferenceElement::Simplex(simplex) => {
            let cub = simplex
                .cubature
                .as_ref()
                .expect("curved expansion of a simplex mesh requires a cubature rule");
            cub.weights.iter().copied().collect()
        }
    };

    let num_elements = mesh.partition.num_elements;
    let quadrature_points = point_weights.len();
    let metric_len = mesh.element_type().metric_len();

    let mut weighted_jacobian = Vec::with_capacity(num_elements * quadrature_points);
    let mut curved_metric = if metric.is_empty() {
        Vec::new()
    } else {
        Vec::with_capacity(num_elements * quadrature_points * metric_len)
    };
    for e in 0..num_elements {
        for &w in &point_weights {
            weighted_jacobian.push(jacobian[e] * w);
            if !metric.is_empty() {
                for g in 0..metric_len {
                    curved_metric.push(metric[e * metric_len + g] * w);
                }
            }
        }
    }

    Mesh {
        partition: mesh.partition.clone(),
        reference: mesh.reference.clone(),
        geometry: GeometricFactors::Curved {
            weighted_jacobian,
            metric: curved_metric,
        },
    }
}

/// Split a single-rank mesh into `parts` contiguous element ranges, one per rank, with
/// pairwise shared-node neighbor lists. The union of the returned partitions describes
/// the same global problem as the input mesh.
pub fn partition<T: Real>(mesh: &Mesh<T>, parts: usize) -> Vec<Mesh<T>> {
    let num_elements = mesh.partition.num_elements;
    assert!(parts >= 1 && parts <= num_elements);
    let npe = mesh.partition.nodes_per_element;
    let quadrature_points = mesh.reference.quadrature_points();
    let metric_len = mesh.element_type().metric_len();

    // Contiguous ranges with the remainder spread over the first ranks.
    let base = num_elements / parts;
    let remainder = num_elements % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut cursor = 0;
    for part in 0..parts {
        let len = base + usize::from(part < remainder);
        ranges.push(cursor..cursor + len);
        cursor += len;
    }

    let id_sets: Vec<BTreeSet<u64>> = ranges
        .iter()
        .map(|range| {
            mesh.partition.global_node_ids[range.start * npe..range.end * npe]
                .iter()
                .copied()
                .collect()
        })
        .collect();

    ranges
        .iter()
        .enumerate()
        .map(|(part, range)| {
            let mut neighbors = Vec::new();
            for other in 0..parts {
                if other == part {
                    continue;
                }
                let shared: Vec<u64> = id_sets[part]
                    .intersection(&id_sets[other])
                    .copied()
                    .collect();
                if !shared.is_empty() {
                    neighbors.push(HaloNeighbor {
                        rank: other,
                        shared_nodes: shared,
                    });
                }
            }

            let geometry = match &mesh.geometry {
                GeometricFactors::Affine { jacobian, metric } => GeometricFactors::Affine {
                    jacobian: jacobian[range.clone()].to_vec(),
                    metric: if metric.is_empty() {
                        Vec::new()
                    } else {
                        metric[range.start * metric_len..range.end * metric_len].to_vec()
                    },
                },
                GeometricFactors::Curved {
                    weighted_jacobian,
                    metric,
                } => GeometricFactors::Curved {
                    weighted_jacobian: weighted_jacobian
                        [range.start * quadrature_points..range.end * quadrature_points]
                        .to_vec(),
                    metric: if metric.is_empty() {
                        Vec::new()
                    } else {
                        metric[range.start * quadrature_points * metric_len
                            ..range.end * quadrature_points * metric_len]
                            .to_vec()
                    },
                },
            };

            Mesh {
                partition: MeshPartition {
                    num_elements: range.len(),
                    nodes_per_element: npe,
                    global_node_ids: mesh.partition.global_node_ids
                        [range.start * npe..range.end * npe]
                        .to_vec(),
                    neighbors,
                },
                reference: mesh.reference.clone(),
                geometry,
            }
        })
        .collect()
}
