use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dieback::forecast::forest::{ForestParams, RandomForest};
use dieback::indices::standardize::{StandardizeOptions, standardize};
use ndarray::{Array1, Array2, Array3};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_design(rows: usize, features: usize) -> (Array2<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(0x5EED_F0 + rows as u64);
    let x = Array2::from_shape_fn((rows, features), |_| rng.sample::<f64, _>(Standard));
    let y = Array1::from_shape_fn(rows, |i| 3.0 * x[[i, 0]] - x[[i, 1]].powi(2) + 0.1 * rng.sample::<f64, _>(Standard));
    (x, y)
}

fn benchmark_forest(c: &mut Criterion) {
    let params = ForestParams {
        n_estimators: 50,
        ..ForestParams::default()
    };
    let mut group = c.benchmark_group("forest_fit");
    for rows in [500_usize, 2000, 8000] {
        let (x, y) = random_design(rows, 24);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("fit", rows), &(x, y), |b, (x, y)| {
            b.iter(|| {
                let forest = RandomForest::fit(black_box(x.view()), black_box(y.view()), &params);
                black_box(forest.map(|f| f.trees.len()).unwrap_or(0));
            });
        });
    }
    group.finish();
}

fn benchmark_standardize(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut group = c.benchmark_group("standardize");
    for side in [16_usize, 64] {
        let reference = Array3::from_shape_fn((side, side, 30), |_| 50.0 + 500.0 * rng.sample::<f64, _>(Standard));
        let focal = Array3::from_shape_fn((side, side, 20), |_| 50.0 + 500.0 * rng.sample::<f64, _>(Standard));
        group.throughput(Throughput::Elements((side * side) as u64));
        group.bench_with_input(BenchmarkId::new("spi", side), &(focal, reference), |b, (focal, reference)| {
            b.iter(|| {
                let out = standardize(black_box(focal.view()), black_box(reference.view()), StandardizeOptions::spi());
                black_box(out);
            });
        });
    }
    group.finish();
}

criterion_group!(forest_fit, benchmark_forest, benchmark_standardize);
criterion_main!(forest_fit);
