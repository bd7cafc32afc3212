use paste::paste;
use proptest::collection::vec;
use proptest::prelude::*;

use sleipnir::comm::LocalComm;
use sleipnir::error::SetupError;
use sleipnir::kernels::inner_product;
use sleipnir::mesh::{GeometricFactors, Mesh};
use sleipnir::operator::ProblemKind;
use sleipnir::procedural::{
    expand_to_curved, hex_dof_coordinates, quad_dof_coordinates, triangle_dof_coordinates,
    unit_cube_hex_mesh, unit_square_quad_mesh, unit_square_triangle_mesh,
};
use sleipnir::solver::{EllipticSolver, ProblemConfig};

fn setup(mesh: Mesh<f64>, kind: ProblemKind<f64>) -> EllipticSolver<f64, LocalComm> {
    EllipticSolver::setup(
        mesh,
        ProblemConfig {
            kind,
            num_fields: 1,
        },
        LocalComm,
    )
    .unwrap()
}

fn apply(solver: &EllipticSolver<f64, LocalComm>, q: &[f64]) -> Vec<f64> {
    let mut aq = vec![0.0; q.len()];
    solver.apply_operator(&mut aq, q).unwrap();
    aq
}

#[test]
fn cubature_mass_on_one_bilinear_quad_is_the_consistent_mass_matrix() {
    // On a single unit-square Q1 element the gathered numbering coincides with the
    // tensor node ordering, and 2-point Gauss integrates the basis products exactly.
    let solver = setup(unit_square_quad_mesh(1, 1, 1, true), ProblemKind::Mass);
    #[rustfmt::skip]
    let expected = [
        [1.0 / 9.0,  1.0 / 18.0, 1.0 / 18.0, 1.0 / 36.0],
        [1.0 / 18.0, 1.0 / 9.0,  1.0 / 36.0, 1.0 / 18.0],
        [1.0 / 18.0, 1.0 / 36.0, 1.0 / 9.0,  1.0 / 18.0],
        [1.0 / 36.0, 1.0 / 18.0, 1.0 / 18.0, 1.0 / 9.0],
    ];
    for j in 0..4 {
        let mut unit = vec![0.0; 4];
        unit[j] = 1.0;
        let column = apply(&solver, &unit);
        for i in 0..4 {
            assert!(
                (column[i] - expected[i][j]).abs() < 1e-14,
                "mass[{i}][{j}] = {}, expected {}",
                column[i],
                expected[i][j]
            );
        }
    }
}

#[test]
fn collocation_mass_is_diagonal_with_the_lumped_weights() {
    let solver = setup(unit_square_quad_mesh(1, 1, 1, false), ProblemKind::Mass);
    for j in 0..4 {
        let mut unit = vec![0.0; 4];
        unit[j] = 1.0;
        let column = apply(&solver, &unit);
        for (i, &value) in column.iter().enumerate() {
            let expected = if i == j { 0.25 } else { 0.0 };
            assert!((value - expected).abs() < 1e-14);
        }
    }
}

#[test]
fn cubature_mass_on_triangles_matches_the_exact_nodal_mass() {
    // The P1 nodal mass matrix is already exact, so the degree-2 cubature rule must
    // reproduce it.
    let nodal = setup(unit_square_triangle_mesh(2, 2, false), ProblemKind::Mass);
    let cubature = setup(unit_square_triangle_mesh(2, 2, true), ProblemKind::Mass);
    let q: Vec<f64> = (0..9).map(|g| (0.37 * g as f64).sin()).collect();
    let aq_nodal = apply(&nodal, &q);
    let aq_cubature = apply(&cubature, &q);
    for (a, b) in aq_nodal.iter().zip(&aq_cubature) {
        assert!((a - b).abs() < 1e-14);
    }
}

// The discrete Dirichlet energy of the coordinate field u(x, y) = x is
// \int |grad u|^2 = 1 on the unit square/cube, and the integrand is constant, so every
// quadrature rule must reproduce it exactly. This pins down the metric scaling of each
// stiffness path.
macro_rules! stiffness_energy_test {
    ($name:ident, $mesh:expr, $coords:expr) => {
        paste! {
            #[test]
            fn [<stiffness_energy_of_the_coordinate_field_is_exact_ $name>]() {
                let mesh = $mesh;
                let solver = setup(mesh, ProblemKind::Helmholtz { lambda: 0.0 });
                let q: Vec<f64> = $coords.iter().map(|point| point[0]).collect();
                assert_eq!(q.len(), solver.field_len());
                let aq = apply(&solver, &q);
                let energy = inner_product(&q, &aq, &LocalComm).unwrap();
                assert!(
                    (energy - 1.0).abs() < 1e-12,
                    "energy = {energy}"
                );
            }
        }
    };
}

stiffness_energy_test!(
    quad_degree_1,
    unit_square_quad_mesh::<f64>(3, 2, 1, false),
    quad_dof_coordinates::<f64>(3, 2, 1)
);
stiffness_energy_test!(
    quad_degree_2,
    unit_square_quad_mesh::<f64>(2, 2, 2, false),
    quad_dof_coordinates::<f64>(2, 2, 2)
);
stiffness_energy_test!(
    quad_degree_2_cubature,
    unit_square_quad_mesh::<f64>(2, 2, 2, true),
    quad_dof_coordinates::<f64>(2, 2, 2)
);
stiffness_energy_test!(
    quad_degree_1_curved,
    expand_to_curved(&unit_square_quad_mesh::<f64>(3, 3, 1, false)),
    quad_dof_coordinates::<f64>(3, 3, 1)
);
stiffness_energy_test!(
    triangles,
    unit_square_triangle_mesh::<f64>(3, 3, false),
    triangle_dof_coordinates::<f64>(3, 3)
);
stiffness_energy_test!(
    triangles_curved,
    expand_to_curved(&unit_square_triangle_mesh::<f64>(3, 3, true)),
    triangle_dof_coordinates::<f64>(3, 3)
);
stiffness_energy_test!(
    hexahedra,
    unit_cube_hex_mesh::<f64>(2, 2, 2),
    hex_dof_coordinates::<f64>(2, 2, 2)
);

#[test]
fn stiffness_annihilates_constant_fields() {
    let solver = setup(
        unit_square_quad_mesh(2, 2, 2, false),
        ProblemKind::Helmholtz { lambda: 0.0 },
    );
    let q = vec![1.0; solver.field_len()];
    let aq = apply(&solver, &q);
    for value in aq {
        assert!(value.abs() < 1e-13);
    }
}

#[test]
fn affine_and_curved_paths_apply_the_identical_operator() {
    let affine_mesh = unit_square_quad_mesh::<f64>(2, 2, 2, false);
    let curved_mesh = expand_to_curved(&affine_mesh);
    let affine = setup(affine_mesh, ProblemKind::Helmholtz { lambda: 0.7 });
    let curved = setup(curved_mesh, ProblemKind::Helmholtz { lambda: 0.7 });

    let q: Vec<f64> = (0..affine.field_len())
        .map(|g| (0.13 * g as f64).cos())
        .collect();
    let aq_affine = apply(&affine, &q);
    let aq_curved = apply(&curved, &q);
    for (a, c) in aq_affine.iter().zip(&aq_curved) {
        assert!((a - c).abs() < 1e-13);
    }
}

#[test]
fn operator_diagonal_matches_unit_vector_probes() {
    let solver = setup(unit_square_quad_mesh(2, 2, 1, true), ProblemKind::Mass);
    let operator = solver.operator();
    let n = solver.num_gathered_dofs();

    let mut diagonal = vec![0.0; n];
    operator.diagonal(&mut diagonal).unwrap();

    for g in 0..n {
        let mut unit = vec![0.0; n];
        unit[g] = 1.0;
        let column = apply(&solver, &unit);
        assert!((diagonal[g] - column[g]).abs() < 1e-13);
    }
}

#[test]
fn curved_simplex_geometry_without_cubature_has_no_contraction_path() {
    let mesh = unit_square_triangle_mesh::<f64>(1, 1, false);
    let num_points = mesh.partition.num_elements * 3;
    let broken = Mesh {
        geometry: GeometricFactors::Curved {
            weighted_jacobian: vec![0.1; num_points],
            metric: vec![0.1; num_points * 3],
        },
        ..mesh
    };
    let result = EllipticSolver::setup(
        broken,
        ProblemConfig {
            kind: ProblemKind::Mass,
            num_fields: 1,
        },
        LocalComm,
    );
    assert!(matches!(
        result,
        Err(SetupError::UnsupportedElement { .. })
    ));
}

#[test]
fn helmholtz_requires_metric_factors() {
    let mesh = unit_square_triangle_mesh::<f64>(1, 1, false);
    let mass_only = match mesh.geometry {
        GeometricFactors::Affine { jacobian, .. } => Mesh {
            geometry: GeometricFactors::Affine {
                jacobian,
                metric: Vec::new(),
            },
            partition: mesh.partition,
            reference: mesh.reference,
        },
        GeometricFactors::Curved { .. } => unreachable!(),
    };
    let result = EllipticSolver::setup(
        mass_only,
        ProblemConfig {
            kind: ProblemKind::Helmholtz { lambda: 1.0 },
            num_fields: 1,
        },
        LocalComm,
    );
    assert!(matches!(result, Err(SetupError::MissingGeometry { .. })));
}

#[test]
fn multi_field_apply_acts_fieldwise() {
    let mesh = unit_square_quad_mesh::<f64>(2, 2, 1, false);
    let single = setup(mesh.clone(), ProblemKind::Mass);
    let multi = EllipticSolver::setup(
        mesh,
        ProblemConfig {
            kind: ProblemKind::Mass,
            num_fields: 2,
        },
        LocalComm,
    )
    .unwrap();

    let n = single.num_gathered_dofs();
    let field_a: Vec<f64> = (0..n).map(|g| (g as f64 * 0.21).sin()).collect();
    let field_b: Vec<f64> = (0..n).map(|g| (g as f64 * 0.43).cos()).collect();
    let mut stacked = field_a.clone();
    stacked.extend_from_slice(&field_b);

    let aq_a = apply(&single, &field_a);
    let aq_b = apply(&single, &field_b);
    let aq_stacked = apply(&multi, &stacked);

    for g in 0..n {
        assert!((aq_stacked[g] - aq_a[g]).abs() < 1e-14);
        assert!((aq_stacked[n + g] - aq_b[g]).abs() < 1e-14);
    }
}

proptest! {
    #[test]
    fn mass_operator_is_linear(
        x in vec(-1.0..1.0f64, 9),
        y in vec(-1.0..1.0f64, 9),
        a in -2.0..2.0f64,
        b in -2.0..2.0f64,
    ) {
        let solver = setup(unit_square_quad_mesh(2, 2, 1, true), ProblemKind::Mass);
        let combined: Vec<f64> = x.iter().zip(&y).map(|(xi, yi)| a * xi + b * yi).collect();

        let aq_combined = apply(&solver, &combined);
        let aq_x = apply(&solver, &x);
        let aq_y = apply(&solver, &y);
        for g in 0..9 {
            let reference = a * aq_x[g] + b * aq_y[g];
            prop_assert!((aq_combined[g] - reference).abs() < 1e-12);
        }
    }

    #[test]
    fn helmholtz_operator_is_symmetric(
        x in vec(-1.0..1.0f64, 9),
        y in vec(-1.0..1.0f64, 9),
    ) {
        let mesh = expand_to_curved(&unit_square_triangle_mesh(2, 2, true));
        let solver = setup(mesh, ProblemKind::Helmholtz { lambda: 0.3 });

        let ay = apply(&solver, &y);
        let ax = apply(&solver, &x);
        let x_ay = inner_product(&x, &ay, &LocalComm).unwrap();
        let ax_y = inner_product(&ax, &y, &LocalComm).unwrap();
        prop_assert!((x_ay - ax_y).abs() < 1e-12);
    }
}
