//! # Counterfactual Generator
//!
//! Re-infers each candidate's latent factor in a world where the protected
//! attribute has been overwritten, holding every other feature fixed.
//!
//! Under frozen [`GlobalParameters`] the latent factors are conditionally
//! independent and the decision never enters the inference-mode density, so
//! each candidate is a separate one-dimensional target. Candidates are
//! processed in parallel and every candidate's sampler is seeded from the run
//! seed alone: a candidate's estimate depends only on that candidate's data,
//! never on its position in the file.

use crate::data::{DataError, Population};
use crate::diagnostics::{ess_bulk, split_rhat};
use crate::hmc::{NutsConfig, SamplerError, run_nuts_sampling};
use crate::model::{GlobalParameters, InferenceModel, LatentPosterior, ModelError};
use crate::progress::{NoopProgress, SamplingProgress};
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CounterfactualError {
    #[error("Invalid counterfactual settings: {0}")]
    InvalidConfig(String),
    #[error("At least one scenario is required.")]
    NoScenarios,
    #[error("Could not build scenario population: {0}")]
    Data(#[from] DataError),
    #[error("Parameters do not fit the population: {0}")]
    Model(#[from] ModelError),
    #[error("Latent re-inference failed for candidate {index}: {source}")]
    Sampler {
        index: usize,
        #[source]
        source: SamplerError,
    },
}

/// A world in which every candidate is re-inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scenario {
    /// Protected attributes as observed.
    Factual,
    /// Every candidate relabeled to one group.
    AllGroup { group: usize },
}

impl Scenario {
    /// `factual`, or `all_<group name>`; used in output file names.
    pub fn label(&self, group_names: &[String]) -> String {
        match self {
            Scenario::Factual => "factual".to_string(),
            Scenario::AllGroup { group } => match group_names.get(*group) {
                Some(name) => format!("all_{name}"),
                None => format!("all_{group}"),
            },
        }
    }

    /// The scenario's population: protected vectors overwritten as needed
    /// and decisions dropped, so nothing downstream can condition on them.
    pub fn apply(&self, population: &Population) -> Result<Population, DataError> {
        match self {
            Scenario::Factual => Ok(population.without_decision()),
            Scenario::AllGroup { group } => population.relabeled(*group),
        }
    }

    /// The factual world followed by one relabeled world per group.
    pub fn standard_set(num_groups: usize) -> Vec<Scenario> {
        std::iter::once(Scenario::Factual)
            .chain((0..num_groups).map(|group| Scenario::AllGroup { group }))
            .collect()
    }
}

/// How the posterior of one latent factor is summarized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum LatentEstimator {
    /// Multi-chain NUTS per candidate.
    #[default]
    Mcmc,
    /// Exact posterior moments on a uniform grid over `[-bound, bound]`.
    Grid { points: usize, bound: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterfactualConfig {
    pub estimator: LatentEstimator,
    /// Sampler settings for every candidate's one-dimensional run.
    pub sampler: NutsConfig,
}

impl Default for CounterfactualConfig {
    fn default() -> Self {
        Self {
            estimator: LatentEstimator::Mcmc,
            sampler: NutsConfig {
                n_chains: 4,
                n_warmup: 300,
                n_samples: 500,
                ..NutsConfig::default()
            },
        }
    }
}

impl CounterfactualConfig {
    pub fn validate(&self) -> Result<(), CounterfactualError> {
        match self.estimator {
            LatentEstimator::Mcmc => self
                .sampler
                .validate()
                .map_err(|e| CounterfactualError::InvalidConfig(e.to_string())),
            LatentEstimator::Grid { points, bound } => {
                if points < 3 {
                    return Err(CounterfactualError::InvalidConfig(format!(
                        "grid needs at least 3 points, got {points}"
                    )));
                }
                if !(bound.is_finite() && bound > 0.0) {
                    return Err(CounterfactualError::InvalidConfig(format!(
                        "grid bound must be positive and finite, got {bound}"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Posterior summary of one candidate's latent factor.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentEstimate {
    pub mean: f64,
    pub sd: f64,
    /// Sampler-only diagnostics; `None` for the grid estimator.
    pub rhat: Option<f64>,
    pub ess_bulk: Option<f64>,
    pub divergences: usize,
}

/// Re-inferred latent factors of one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioLatents {
    pub scenario: Scenario,
    pub label: String,
    /// The relabeled population the latents were inferred from.
    pub population: Population,
    pub estimates: Vec<LatentEstimate>,
}

impl ScenarioLatents {
    pub fn means(&self) -> Array1<f64> {
        self.estimates.iter().map(|e| e.mean).collect()
    }

    pub fn divergences(&self) -> usize {
        self.estimates.iter().map(|e| e.divergences).sum()
    }

    pub fn max_rhat(&self) -> Option<f64> {
        self.estimates
            .iter()
            .filter_map(|e| e.rhat)
            .filter(|r| r.is_finite())
            .reduce(f64::max)
    }
}

/// Infers every candidate's latent factor under `params`, without decisions.
pub fn infer_latents(
    params: &GlobalParameters,
    population: &Population,
    config: &CounterfactualConfig,
    progress: &dyn SamplingProgress,
) -> Result<Vec<LatentEstimate>, CounterfactualError> {
    config.validate()?;
    let model = InferenceModel::new(params, population)?;
    (0..model.len())
        .into_par_iter()
        .map(|i| {
            let target = model.individual(i);
            let estimate = match config.estimator {
                LatentEstimator::Mcmc => sample_latent(&target, &config.sampler)
                    .map_err(|source| CounterfactualError::Sampler { index: i, source }),
                LatentEstimator::Grid { points, bound } => Ok(grid_latent(&target, points, bound)),
            };
            progress.on_advance(1);
            estimate
        })
        .collect()
}

/// Runs every scenario against `population` and returns them in order.
pub fn generate_counterfactuals(
    params: &GlobalParameters,
    population: &Population,
    scenarios: &[Scenario],
    config: &CounterfactualConfig,
    progress: &dyn SamplingProgress,
) -> Result<Vec<ScenarioLatents>, CounterfactualError> {
    if scenarios.is_empty() {
        return Err(CounterfactualError::NoScenarios);
    }
    config.validate()?;
    params.check_compatible(population)?;

    let mut results = Vec::with_capacity(scenarios.len());
    for &scenario in scenarios {
        let label = scenario.label(population.group_names());
        let relabeled = scenario.apply(population)?;
        log::info!(
            "Re-inferring latent factors for {} candidates under scenario '{label}'",
            relabeled.len()
        );
        progress.on_start(&label, relabeled.len() as u64);
        let estimates = infer_latents(params, &relabeled, config, progress);
        progress.on_finish();
        let latents = ScenarioLatents {
            scenario,
            label,
            population: relabeled,
            estimates: estimates?,
        };

        let divergent = latents
            .estimates
            .iter()
            .filter(|e| e.divergences > 0)
            .count();
        if divergent > 0 {
            log::warn!(
                "Scenario '{}': {divergent} candidate(s) had divergent transitions ({} in total)",
                latents.label,
                latents.divergences()
            );
        }
        if let Some(rhat) = latents.max_rhat() {
            if rhat > 1.01 {
                log::warn!(
                    "Scenario '{}': max per-candidate R-hat is {rhat:.4}",
                    latents.label
                );
            }
        }
        results.push(latents);
    }
    Ok(results)
}

fn sample_latent(
    target: &LatentPosterior,
    sampler: &NutsConfig,
) -> Result<LatentEstimate, SamplerError> {
    let result = run_nuts_sampling(target, sampler, &NoopProgress)?;
    let chains = result.parameter_chains(0, false);
    let pooled: Vec<f64> = chains.iter().flatten().copied().collect();
    let n = pooled.len() as f64;
    let mean = pooled.iter().sum::<f64>() / n;
    let sd = if pooled.len() > 1 {
        (pooled.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    Ok(LatentEstimate {
        mean,
        sd,
        rhat: Some(split_rhat(&chains)),
        ess_bulk: Some(ess_bulk(&chains)),
        divergences: result.divergences(),
    })
}

/// Posterior mean and standard deviation by quadrature on a uniform grid,
/// with log-sum-exp weights.
fn grid_latent(target: &LatentPosterior, points: usize, bound: f64) -> LatentEstimate {
    let step = 2.0 * bound / (points - 1) as f64;
    let grid: Vec<f64> = (0..points).map(|j| -bound + j as f64 * step).collect();
    let log_weights: Vec<f64> = grid.iter().map(|&u| target.evaluate(u).0).collect();
    let max = log_weights
        .iter()
        .copied()
        .filter(|w| w.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = log_weights
        .iter()
        .map(|&w| if w.is_finite() { (w - max).exp() } else { 0.0 })
        .collect();
    let total: f64 = weights.iter().sum();
    let mean = grid.iter().zip(&weights).map(|(u, w)| u * w).sum::<f64>() / total;
    let variance = grid
        .iter()
        .zip(&weights)
        .map(|(u, w)| (u - mean).powi(2) * w)
        .sum::<f64>()
        / total;
    LatentEstimate {
        mean,
        sd: variance.sqrt(),
        rhat: None,
        ess_bulk: None,
        divergences: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{correlation, informative_parameters, labeled_population};
    use approx::assert_abs_diff_eq;

    fn quick_mcmc() -> CounterfactualConfig {
        CounterfactualConfig {
            estimator: LatentEstimator::Mcmc,
            sampler: NutsConfig {
                n_chains: 2,
                n_warmup: 150,
                n_samples: 300,
                seed: 99,
                ..NutsConfig::default()
            },
        }
    }

    fn grid() -> CounterfactualConfig {
        CounterfactualConfig {
            estimator: LatentEstimator::Grid {
                points: 2001,
                bound: 8.0,
            },
            ..CounterfactualConfig::default()
        }
    }

    #[test]
    fn two_relabeled_worlds_give_one_latent_per_candidate() {
        let params = informative_parameters();
        let (labeled, _) = labeled_population(&params, 10, 3);
        let population = labeled.without_decision();
        let scenarios = [Scenario::AllGroup { group: 1 }, Scenario::AllGroup { group: 0 }];
        for config in [quick_mcmc(), grid()] {
            let worlds =
                generate_counterfactuals(&params, &population, &scenarios, &config, &NoopProgress)
                    .unwrap();
            assert_eq!(worlds.len(), 2);
            assert_eq!(worlds[0].label, "all_b");
            assert_eq!(worlds[1].label, "all_a");
            for world in &worlds {
                assert_eq!(world.means().len(), 10);
                assert!(world.means().iter().all(|u| u.is_finite()));
                assert!(world.population.decision().is_none());
            }
            // Group a shifts every feature up, so explaining the same
            // features as group a needs a lower latent factor.
            for i in 0..10 {
                assert!(worlds[1].estimates[i].mean < worlds[0].estimates[i].mean);
            }
        }
    }

    #[test]
    fn sampler_matches_quadrature() {
        let params = informative_parameters();
        let (population, _) = labeled_population(&params, 12, 8);
        let sampled = infer_latents(&params, &population, &quick_mcmc(), &NoopProgress).unwrap();
        let exact = infer_latents(&params, &population, &grid(), &NoopProgress).unwrap();
        for (s, e) in sampled.iter().zip(&exact) {
            assert_abs_diff_eq!(s.mean, e.mean, epsilon = 0.25 * e.sd + 0.02);
            assert!(s.rhat.unwrap() < 1.05);
            assert!(e.rhat.is_none());
        }
    }

    #[test]
    fn estimates_do_not_depend_on_candidate_order() {
        let params = informative_parameters();
        let (population, _) = labeled_population(&params, 9, 5);
        let reversed_rows: Vec<usize> = (0..9).rev().collect();
        let reversed = population.select(&reversed_rows);
        let forward = infer_latents(&params, &population, &quick_mcmc(), &NoopProgress).unwrap();
        let backward = infer_latents(&params, &reversed, &quick_mcmc(), &NoopProgress).unwrap();
        for (i, estimate) in forward.iter().enumerate() {
            assert_eq!(estimate, &backward[8 - i]);
        }
    }

    #[test]
    fn decisions_never_reach_inference() {
        let params = informative_parameters();
        let (labeled, _) = labeled_population(&params, 6, 2);
        let with = infer_latents(&params, &labeled, &grid(), &NoopProgress).unwrap();
        let without =
            infer_latents(&params, &labeled.without_decision(), &grid(), &NoopProgress).unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn factual_latents_track_the_truth() {
        let params = informative_parameters();
        let (population, truth) = labeled_population(&params, 200, 13);
        let worlds = generate_counterfactuals(
            &params,
            &population,
            &[Scenario::Factual],
            &grid(),
            &NoopProgress,
        )
        .unwrap();
        assert!(correlation(&worlds[0].means(), &truth) > 0.8);
    }

    #[test]
    fn rejects_bad_settings() {
        let params = informative_parameters();
        let (population, _) = labeled_population(&params, 4, 1);
        let bad_grid = CounterfactualConfig {
            estimator: LatentEstimator::Grid {
                points: 2,
                bound: 5.0,
            },
            ..CounterfactualConfig::default()
        };
        assert!(matches!(
            infer_latents(&params, &population, &bad_grid, &NoopProgress),
            Err(CounterfactualError::InvalidConfig(_))
        ));
        assert!(matches!(
            generate_counterfactuals(&params, &population, &[], &grid(), &NoopProgress),
            Err(CounterfactualError::NoScenarios)
        ));
        assert!(matches!(
            Scenario::AllGroup { group: 5 }.apply(&population),
            Err(DataError::GroupOutOfRange { .. })
        ));
        assert_eq!(
            Scenario::standard_set(2),
            vec![
                Scenario::Factual,
                Scenario::AllGroup { group: 0 },
                Scenario::AllGroup { group: 1 }
            ]
        );
    }
}
