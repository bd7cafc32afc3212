use std::error::Error;

use matrixcompare::assert_scalar_eq;
use nalgebra::DMatrix;

use sleipnir::cg::{
    CgWorkspace, ConjugateGradient, LinearSolver, Preconditioner, StoppingCriterion,
};
use sleipnir::comm::LocalComm;
use sleipnir::operator::LinearOperator;

/// A dense matrix as a linear operator, for exercising the solver in isolation.
struct DenseOperator(DMatrix<f64>);

impl LinearOperator<f64> for DenseOperator {
    fn apply(&self, aq: &mut [f64], q: &[f64]) -> Result<(), Box<dyn Error>> {
        for (i, out) in aq.iter_mut().enumerate() {
            let mut acc = 0.0;
            for (j, &q_j) in q.iter().enumerate() {
                acc += self.0[(i, j)] * q_j;
            }
            *out = acc;
        }
        Ok(())
    }
}

fn spd_operator() -> DenseOperator {
    DenseOperator(DMatrix::from_row_slice(
        3,
        3,
        &[21.0, -1.0, -5.0, -1.0, 11.0, -4.0, -5.0, -4.0, 26.0],
    ))
}

#[test]
fn solves_an_spd_system_to_machine_precision() {
    let operator = spd_operator();
    let x_expected = [1.0, 3.0, 2.0];
    let mut rhs = vec![0.0; 3];
    operator.apply(&mut rhs, &x_expected).unwrap();

    let comm = LocalComm;
    let mut x = vec![0.0; 3];
    let summary = ConjugateGradient::new(&comm, StoppingCriterion::Absolute(1e-12), 10)
        .solve(&operator, &mut x, &rhs)
        .unwrap();

    assert!(summary.converged);
    // Exact-arithmetic CG finishes in at most n steps for an n x n system.
    assert!(summary.iterations <= 3);
    for (computed, expected) in x.iter().zip(&x_expected) {
        assert_scalar_eq!(*computed, *expected, comp = abs, tol = 1e-9);
    }
}

#[test]
fn zero_iteration_cap_reports_the_initial_residual_untouched() {
    let operator = spd_operator();
    let rhs = vec![2.0, -1.0, 4.0];
    let rhs_norm = rhs.iter().map(|v| v * v).sum::<f64>().sqrt();

    let comm = LocalComm;
    let mut x = vec![0.0; 3];
    let summary = ConjugateGradient::new(&comm, StoppingCriterion::Absolute(1e-12), 0)
        .solve(&operator, &mut x, &rhs)
        .unwrap();

    assert!(!summary.converged);
    assert_eq!(summary.iterations, 0);
    assert!((summary.residual_norm - rhs_norm).abs() < 1e-14);
    assert_eq!(summary.residual_norm, summary.initial_residual_norm);
    assert_eq!(x, vec![0.0; 3]);
}

#[test]
fn relative_criterion_scales_with_the_right_hand_side() {
    let operator = DenseOperator(DMatrix::from_diagonal_element(3, 3, 4.0));
    let rhs = vec![4000.0, 8000.0, -4000.0];

    let comm = LocalComm;
    let mut x = vec![0.0; 3];
    let summary = ConjugateGradient::new(&comm, StoppingCriterion::Relative(1e-10), 10)
        .solve(&operator, &mut x, &rhs)
        .unwrap();
    assert!(summary.converged);
    assert!((x[0] - 1000.0).abs() < 1e-6);
}

#[test]
fn jacobi_preconditioning_reaches_the_same_solution() {
    let operator = spd_operator();
    let x_expected = [0.5, -2.0, 1.25];
    let mut rhs = vec![0.0; 3];
    operator.apply(&mut rhs, &x_expected).unwrap();

    let preconditioner = Preconditioner::jacobi(&[21.0, 11.0, 26.0]).unwrap();
    let comm = LocalComm;
    let mut x = vec![0.0; 3];
    let summary = ConjugateGradient::new(&comm, StoppingCriterion::Absolute(1e-12), 20)
        .with_preconditioner(preconditioner)
        .solve(&operator, &mut x, &rhs)
        .unwrap();

    assert!(summary.converged);
    for (computed, expected) in x.iter().zip(&x_expected) {
        assert_scalar_eq!(*computed, *expected, comp = abs, tol = 1e-9);
    }
}

#[test]
fn jacobi_rejects_a_non_positive_diagonal() {
    assert!(Preconditioner::<f64>::jacobi(&[1.0, 0.0, 2.0]).is_err());
    assert!(Preconditioner::<f64>::jacobi(&[1.0, -3.0, 2.0]).is_err());
}

#[test]
fn operator_breakdown_surfaces_nan_instead_of_aborting() {
    // The zero operator gives pAp = 0: alpha blows up, and the nan must ride through the
    // summary rather than abort the solve.
    let operator = DenseOperator(DMatrix::zeros(3, 3));
    let rhs = vec![1.0, 1.0, 1.0];

    let comm = LocalComm;
    let mut x = vec![0.0; 3];
    let summary = ConjugateGradient::new(&comm, StoppingCriterion::Absolute(1e-12), 5)
        .solve(&operator, &mut x, &rhs)
        .unwrap();

    assert!(!summary.converged);
    assert!(summary.residual_norm.is_nan());
}

#[test]
fn workspace_is_reusable_across_solves() {
    let operator = spd_operator();
    let rhs = vec![1.0, 2.0, 3.0];
    let comm = LocalComm;
    let mut workspace = CgWorkspace::default();

    let mut x_first = vec![0.0; 3];
    let first = ConjugateGradient::new(&comm, StoppingCriterion::Absolute(1e-12), 10)
        .with_workspace(&mut workspace)
        .solve(&operator, &mut x_first, &rhs)
        .unwrap();

    let mut x_second = vec![0.0; 3];
    let second = ConjugateGradient::new(&comm, StoppingCriterion::Absolute(1e-12), 10)
        .with_workspace(&mut workspace)
        .solve(&operator, &mut x_second, &rhs)
        .unwrap();

    assert!(first.converged && second.converged);
    assert_eq!(x_first, x_second);
}

#[test]
fn variant_solvers_are_reachable_through_the_capability_interface() {
    let operator = spd_operator();
    let rhs = vec![3.0, 1.0, -2.0];
    let comm = LocalComm;
    let mut cg = ConjugateGradient::new(&comm, StoppingCriterion::Absolute(1e-12), 10);
    let solver: &mut dyn LinearSolver<f64> = &mut cg;

    let mut x = vec![0.0; 3];
    let summary = solver.solve(&operator, &mut x, &rhs).unwrap();
    assert!(summary.converged);
}
