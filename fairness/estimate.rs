//! Fits the generative model to training data and freezes the result.
//!
//! This is the training half of the pipeline: run NUTS over the joint
//! training-mode posterior, map every draw onto one sign mode, summarize the
//! draws and collapse them into the frozen [`GlobalParameters`] that every
//! downstream step receives.

use crate::data::{Feature, Population};
use crate::diagnostics::{FitQuality, ParameterSummary, QualityThresholds, summarize_result};
use crate::hmc::{NutsConfig, SamplerError, run_nuts_sampling};
use crate::model::{GlobalParameters, ModelError, TrainingModel};
use crate::progress::SamplingProgress;
use ndarray::Array1;
use std::cell::Cell;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Model construction failed: {0}")]
    Model(#[from] ModelError),

    #[error("Posterior sampling failed: {0}")]
    Sampler(#[from] SamplerError),

    #[error(
        "Posterior means produced an invalid parameter bundle ({0}). The chains most likely did not converge; inspect the diagnostics."
    )]
    DegenerateEstimate(String),
}

/// Everything learned from the training population.
#[derive(Debug, Clone)]
pub struct ModelFit {
    /// Posterior means of the global parameters, frozen for downstream use.
    pub params: GlobalParameters,
    /// One row per parameter, on the reported scale (`sigma_g`, not the
    /// log-variance). The first `N` rows are the training latent factors.
    pub summaries: Vec<ParameterSummary>,
    /// Posterior mean of each training candidate's latent factor.
    pub latent_means: Array1<f64>,
    pub latent_sds: Array1<f64>,
    /// Same rows as `summaries`, over warmup and retained draws together.
    /// Present only when the sampler kept its warmup draws.
    pub warmup_summaries: Option<Vec<ParameterSummary>>,
    /// Retained iterations whose transition diverged, one list per chain.
    pub divergent_iterations: Vec<Vec<usize>>,
    pub quality: FitQuality,
    /// Draws that were reflected onto the anchor's positive half-space.
    pub reflected_draws: usize,
}

/// Samples the training-mode posterior and summarizes it.
///
/// Draws are reflected so that `anchor`'s latent loading is non-negative
/// before anything is averaged; without this, chains that settle in opposite
/// sign modes would average to zero.
pub fn fit_generative_model(
    population: &Population,
    sampler: &NutsConfig,
    thresholds: &QualityThresholds,
    anchor: Feature,
    progress: &dyn SamplingProgress,
) -> Result<ModelFit, EstimationError> {
    let model = TrainingModel::new(population)?;
    let layout = model.layout();
    log::info!(
        "Fitting generative model: {} candidates, {} groups, {} free parameters.",
        layout.num_obs,
        layout.num_groups,
        layout.dim()
    );
    log::info!(
        "  - {} chains x ({} warmup + {} samples), seed {}",
        sampler.n_chains,
        sampler.n_warmup,
        sampler.n_samples,
        sampler.seed
    );

    let total_iterations = sampler.n_chains * sampler.iterations_per_chain();
    progress.on_start("fitting generative model", total_iterations as u64);
    let sampled = run_nuts_sampling(&model, sampler, progress);
    progress.on_finish();
    let mut result = sampled?;

    let reflected = Cell::new(0usize);
    result.map_draws(|draw| {
        if layout.reflect_sign(draw, anchor) {
            reflected.set(reflected.get() + 1);
        }
    });
    let reflected_draws = reflected.get();
    log::info!("Reflected {reflected_draws} draw(s) onto the positive '{anchor}' loading.");

    let names = layout.names(population.group_names());
    let lv = layout.log_variance();
    let reported = |j: usize, x: f64| if j == lv { (0.5 * x).exp() } else { x };
    let summaries = summarize_result(&result, &names, false, reported);
    let warmup_summaries = result
        .has_warmup()
        .then(|| summarize_result(&result, &names, true, reported));

    let means = Array1::from_iter(summaries.iter().map(|s| s.mean));
    let params = layout.to_parameters(means.view(), population.group_names());
    params
        .validate()
        .map_err(|e| EstimationError::DegenerateEstimate(e.to_string()))?;

    let n = layout.num_obs;
    let latent_means = Array1::from_iter(summaries[..n].iter().map(|s| s.mean));
    let latent_sds = Array1::from_iter(summaries[..n].iter().map(|s| s.sd));

    let quality = FitQuality::assess(&summaries, &result, thresholds);
    log::info!(
        "Fit quality: max R-hat {:.4}, min bulk ESS {:.1}, min tail ESS {:.1}, {} divergence(s).",
        quality.max_rhat,
        quality.min_ess_bulk,
        quality.min_ess_tail,
        quality.divergences
    );
    if !quality.reliable {
        for problem in &quality.problems {
            log::warn!("Fit flagged unreliable: {problem}");
        }
    }

    Ok(ModelFit {
        params,
        summaries,
        latent_means,
        latent_sds,
        warmup_summaries,
        divergent_iterations: result.divergent_iterations(),
        quality,
        reflected_draws,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::test_fixtures::{correlation, informative_parameters, labeled_population};

    #[test]
    fn recovers_latent_ordering_and_anchor_sign() {
        let (population, latent) = labeled_population(&informative_parameters(), 80, 21);
        let sampler = NutsConfig {
            n_chains: 2,
            n_warmup: 300,
            n_samples: 300,
            seed: 4,
            ..NutsConfig::default()
        };
        let fit = fit_generative_model(
            &population,
            &sampler,
            &QualityThresholds::default(),
            Feature::Grade,
            &NoopProgress,
        )
        .unwrap();

        assert_eq!(fit.latent_means.len(), 80);
        assert_eq!(fit.summaries.len(), 80 + 8 * 4 + 3 + 1);
        assert_eq!(fit.summaries.last().unwrap().name, "sigma_g");
        assert!(fit.params.feature(Feature::Grade).eta_u >= 0.0);
        assert!(fit.params.sigma_g > 0.0);
        assert_eq!(fit.quality.total_draws, 600);
        assert!(fit.warmup_summaries.is_none());
        assert_eq!(fit.divergent_iterations.len(), 2);
        let listed: usize = fit.divergent_iterations.iter().map(Vec::len).sum();
        assert_eq!(listed, fit.quality.divergences);
        let r = correlation(&fit.latent_means, &latent);
        assert!(r > 0.6, "correlation with true latent factors = {r}");
    }

    #[test]
    fn kept_warmup_gets_its_own_summary() {
        let (population, _) = labeled_population(&informative_parameters(), 20, 5);
        let sampler = NutsConfig {
            n_chains: 2,
            n_warmup: 40,
            n_samples: 30,
            seed: 8,
            save_warmup: true,
            ..NutsConfig::default()
        };
        let fit = fit_generative_model(
            &population,
            &sampler,
            &QualityThresholds::default(),
            Feature::Grade,
            &NoopProgress,
        )
        .unwrap();
        let warmup = fit.warmup_summaries.as_ref().unwrap();
        assert_eq!(warmup.len(), fit.summaries.len());
        for (with, without) in warmup.iter().zip(&fit.summaries) {
            assert_eq!(with.name, without.name);
        }
        // Quality is judged on retained draws only.
        assert_eq!(fit.quality.total_draws, 60);
        assert!(fit.params.feature(Feature::Grade).eta_u >= 0.0);
    }

    #[test]
    fn training_requires_decisions() {
        let (population, _) = labeled_population(&informative_parameters(), 10, 1);
        let unlabeled = population.without_decision();
        let err = fit_generative_model(
            &unlabeled,
            &NutsConfig::default(),
            &QualityThresholds::default(),
            Feature::Grade,
            &NoopProgress,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EstimationError::Model(ModelError::MissingDecision)
        ));
    }
}
