// ========================================================================================
//
//                 COUNTERFAIR SWEEP AND LATENT INFERENCE BENCHMARK
//
// ========================================================================================
//
// Measures the two loops a full run spends most of its time in outside the joint
// fit: the per-threshold fairness sweep, and per-candidate latent re-inference by
// grid quadrature versus NUTS.
//
// ========================================================================================

use counterfair::counterfactual::{CounterfactualConfig, LatentEstimator, infer_latents};
use counterfair::hmc::NutsConfig;
use counterfair::progress::NoopProgress;
use counterfair::simulate::{draw_parameters, simulate_population};
use counterfair::sweep::{GroupSizes, ThresholdGrid, fairness_sweep};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// --- Benchmark Tuning Parameters ---

/// Candidate counts on the x-axis of the sweep benchmark.
const SWEEP_SIZES: [usize; 4] = [1_000, 10_000, 100_000, 1_000_000];
/// Candidates re-inferred per latent benchmark iteration.
const LATENT_CANDIDATES: usize = 50;

fn bench_fairness_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("fairness_sweep");
    let grid = ThresholdGrid::default();
    for &n in &SWEEP_SIZES {
        let mut rng = StdRng::seed_from_u64(n as u64);
        let probabilities: Array1<f64> = (0..n).map(|_| rng.r#gen::<f64>()).collect();
        let groups: Vec<usize> = (0..n).map(|_| rng.gen_range(0..3)).collect();
        let sizes = GroupSizes::from_membership(&groups, 3).unwrap();

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                fairness_sweep(
                    black_box(probabilities.view()),
                    black_box(&groups),
                    &sizes,
                    &grid,
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_latent_inference(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(2017);
    let names = vec!["female".to_string(), "male".to_string()];
    let params = draw_parameters(&names, &mut rng);
    let (population, _) =
        simulate_population(&params, LATENT_CANDIDATES, &[], &mut rng).unwrap();
    let population = population.without_decision();

    let estimators = [
        (
            "grid",
            LatentEstimator::Grid {
                points: 2001,
                bound: 8.0,
            },
        ),
        ("nuts", LatentEstimator::Mcmc),
    ];

    let mut group = c.benchmark_group("latent_inference");
    group.sample_size(10);
    group.throughput(Throughput::Elements(LATENT_CANDIDATES as u64));
    for (name, estimator) in estimators {
        let config = CounterfactualConfig {
            estimator,
            sampler: NutsConfig {
                n_chains: 2,
                n_warmup: 200,
                n_samples: 200,
                ..NutsConfig::default()
            },
        };
        group.bench_function(name, |b| {
            b.iter(|| infer_latents(&params, black_box(&population), &config, &NoopProgress).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fairness_sweep, bench_latent_inference);
criterion_main!(benches);
