//! Shared builders for unit tests.

use crate::data::{Feature, Population};
use crate::model::{DecisionCoefficients, FeatureCoefficients, GlobalParameters};
use crate::simulate::simulate_population;
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Two-group parameters where every feature loads clearly on `u` and the
/// protected attribute shifts every feature.
pub fn informative_parameters() -> GlobalParameters {
    let features = Feature::ALL
        .into_iter()
        .map(|feature| FeatureCoefficients {
            feature,
            intercept: 0.2,
            eta_u: if feature == Feature::Grade { 1.5 } else { 1.0 },
            eta_a: vec![0.3, -0.3],
        })
        .collect();
    GlobalParameters {
        group_names: vec!["a".to_string(), "b".to_string()],
        sigma_g: 0.5,
        decision: DecisionCoefficients {
            eta_u: 1.2,
            eta_a: vec![-0.5, 0.5],
        },
        features,
    }
}

/// A labeled population drawn under `params`, plus its true latent factors.
pub fn labeled_population(
    params: &GlobalParameters,
    n: usize,
    seed: u64,
) -> (Population, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    simulate_population(params, n, &[], &mut rng).expect("simulated population is valid")
}

pub fn correlation(x: &Array1<f64>, y: &Array1<f64>) -> f64 {
    let mx = x.mean().unwrap_or(0.0);
    let my = y.mean().unwrap_or(0.0);
    let cov: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    let vx: f64 = x.iter().map(|a| (a - mx).powi(2)).sum();
    let vy: f64 = y.iter().map(|b| (b - my).powi(2)).sum();
    cov / (vx * vy).sqrt()
}
