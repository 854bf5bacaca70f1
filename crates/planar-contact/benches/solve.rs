//! Criterion benchmarks for the contact force solver.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use planar_contact::ForceSolver;
use planar_math::DMat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Random symmetric positive-definite influence matrix and bias vector.
fn make_system(n: usize, seed: u64) -> (DMat, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut m = DMat::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            m[(i, j)] = rng.gen_range(-1.0..1.0);
        }
    }
    let a = m.transpose() * &m + DMat::identity(n, n) * 0.5;
    let b: Vec<f64> = (0..n).map(|_| rng.gen_range(-5.0..0.0)).collect();
    (a, b)
}

fn bench_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("force_solve");
    for &n in &[4_usize, 16, 48] {
        let (a, b) = make_system(n, 99);
        let joint = vec![false; n];
        let mut solver = ForceSolver::new(1);
        let mut f = vec![0.0; n];
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |bench, _| {
            bench.iter(|| {
                solver
                    .solve(&a, &mut f, &b, &joint, None)
                    .expect("positive-definite system must solve");
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_solve);
criterion_main!(benches);
