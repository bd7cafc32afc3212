use criterion::{black_box, criterion_group, criterion_main, Criterion};

use sleipnir::comm::LocalComm;
use sleipnir::operator::{LinearOperator, ProblemKind};
use sleipnir::procedural::{unit_cube_hex_mesh, unit_square_quad_mesh};
use sleipnir::solver::{EllipticSolver, ProblemConfig};

fn bench_operator(
    c: &mut Criterion,
    name: &str,
    solver: &EllipticSolver<f64, LocalComm>,
) {
    let operator = solver.operator();
    let n = solver.field_len();
    let q: Vec<f64> = (0..n).map(|g| (0.11 * g as f64).sin()).collect();
    let mut aq = vec![0.0; n];

    c.bench_function(name, |b| {
        b.iter(|| {
            operator
                .apply(black_box(&mut aq), black_box(&q))
                .unwrap();
        })
    });

    let model = solver.perf_model();
    println!(
        "{name}: {} dofs, modelled {} bytes / {} flops per apply",
        model.num_global_dofs,
        model.operator_bytes_moved(),
        model.operator_flops()
    );
}

fn operator_benches(c: &mut Criterion) {
    let mass_quad = EllipticSolver::setup(
        unit_square_quad_mesh::<f64>(64, 64, 2, true),
        ProblemConfig {
            kind: ProblemKind::Mass,
            num_fields: 1,
        },
        LocalComm,
    )
    .unwrap();
    bench_operator(c, "mass apply, 64x64 quads, degree 2, cubature", &mass_quad);

    let helmholtz_hex = EllipticSolver::setup(
        unit_cube_hex_mesh::<f64>(16, 16, 16),
        ProblemConfig {
            kind: ProblemKind::Helmholtz { lambda: 1.0 },
            num_fields: 1,
        },
        LocalComm,
    )
    .unwrap();
    bench_operator(c, "helmholtz apply, 16^3 hexes", &helmholtz_hex);
}

criterion_group!(benches, operator_benches);
criterion_main!(benches);
