//! End-to-end orchestration: split, fit, re-infer, predict, sweep.
//!
//! Each stage takes the previous stage's output by reference and writes its
//! own tables into the output directory:
//!
//! | file | content |
//! |---|---|
//! | `params.toml` | frozen global parameters |
//! | `diagnostics.tsv` | per-parameter posterior summary and convergence |
//! | `diagnostics_warmup.tsv` | the same over warmup and retained draws (`save_warmup`) |
//! | `divergences.tsv` | chain and retained iteration of every divergent transition |
//! | `quality.toml` | whole-fit verdict |
//! | `latent_<set>_<scenario>.tsv` | re-inferred latent factors |
//! | `predictions_<variant>_<scenario>.tsv` | test-set decision probabilities |
//! | `sweep_<variant>_<scenario>.tsv` | threshold sweep |
//! | `agreement_<variant>_<a>_vs_<b>.tsv` | cross-scenario agreement |

use crate::config::{ConfigError, RunConfig};
use crate::counterfactual::{
    CounterfactualError, LatentEstimate, Scenario, ScenarioLatents, generate_counterfactuals,
};
use crate::data::{DataError, Population, split_train_test};
use crate::estimate::{EstimationError, ModelFit, fit_generative_model};
use crate::io::{
    OutputError, write_agreement, write_divergences, write_latents, write_parameter_summaries,
    write_predictions, write_quality, write_sweep,
};
use crate::model::{GlobalParameters, ModelError};
use crate::predictor::{FittedPredictor, ModelVariant, PredictorError};
use crate::progress::SamplingProgress;
use crate::sweep::{GroupSizes, SweepError, agreement_sweep, fairness_sweep};
use ndarray::Array1;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Estimation(#[from] EstimationError),
    #[error(transparent)]
    Counterfactual(#[from] CounterfactualError),
    #[error("Decision predictor '{variant}' under scenario '{scenario}': {source}")]
    Predictor {
        variant: ModelVariant,
        scenario: String,
        #[source]
        source: PredictorError,
    },
    #[error(transparent)]
    Sweep(#[from] SweepError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error("Could not create output directory '{path}': {source}")]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Test-set probabilities of one variant under one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioPredictions {
    pub variant: ModelVariant,
    pub scenario: Scenario,
    pub label: String,
    pub probabilities: Array1<f64>,
}

/// What a full run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub fit: ModelFit,
    pub test_latents: Vec<ScenarioLatents>,
    pub predictions: Vec<ScenarioPredictions>,
    pub outputs: Vec<PathBuf>,
}

fn prepare_output_dir(out_dir: &Path) -> Result<(), PipelineError> {
    fs::create_dir_all(out_dir).map_err(|source| PipelineError::OutputDirectory {
        path: out_dir.to_path_buf(),
        source,
    })
}

/// Fits the generative model and writes `params.toml`, `diagnostics.tsv`,
/// `divergences.tsv`, `quality.toml` and the jointly fitted training
/// latents, plus `diagnostics_warmup.tsv` when warmup draws were kept.
pub fn fit_and_save(
    train: &Population,
    config: &RunConfig,
    out_dir: &Path,
    progress: &dyn SamplingProgress,
    outputs: &mut Vec<PathBuf>,
) -> Result<ModelFit, PipelineError> {
    prepare_output_dir(out_dir)?;
    let fit = fit_generative_model(
        train,
        &config.sampler,
        &config.quality,
        config.sign_anchor,
        progress,
    )?;

    let params_path = out_dir.join("params.toml");
    fit.params.save(&params_path.to_string_lossy())?;
    outputs.push(params_path);

    let diagnostics_path = out_dir.join("diagnostics.tsv");
    write_parameter_summaries(&diagnostics_path, &fit.summaries)?;
    outputs.push(diagnostics_path);

    if let Some(warmup) = &fit.warmup_summaries {
        let warmup_path = out_dir.join("diagnostics_warmup.tsv");
        write_parameter_summaries(&warmup_path, warmup)?;
        outputs.push(warmup_path);
    }

    let divergences_path = out_dir.join("divergences.tsv");
    write_divergences(&divergences_path, &fit.divergent_iterations)?;
    outputs.push(divergences_path);

    let quality_path = out_dir.join("quality.toml");
    write_quality(&quality_path, &fit.quality)?;
    outputs.push(quality_path);

    let joint: Vec<LatentEstimate> = fit.summaries[..train.len()]
        .iter()
        .map(|s| LatentEstimate {
            mean: s.mean,
            sd: s.sd,
            rhat: Some(s.rhat),
            ess_bulk: Some(s.ess_bulk),
            divergences: 0,
        })
        .collect();
    let joint_path = out_dir.join("latent_train_joint.tsv");
    write_latents(&joint_path, &joint, &member_names(train))?;
    outputs.push(joint_path);

    Ok(fit)
}

/// Re-infers latent factors of `population` under every scenario and writes
/// one `latent_<set>_<scenario>.tsv` per scenario.
pub fn counterfactuals_and_save(
    params: &GlobalParameters,
    population: &Population,
    set: &str,
    config: &RunConfig,
    out_dir: &Path,
    progress: &dyn SamplingProgress,
    outputs: &mut Vec<PathBuf>,
) -> Result<Vec<ScenarioLatents>, PipelineError> {
    prepare_output_dir(out_dir)?;
    let scenarios = config.resolve_scenarios(population.num_groups())?;
    let worlds =
        generate_counterfactuals(params, population, &scenarios, &config.counterfactual, progress)?;
    let names = member_names(population);
    for world in &worlds {
        let path = out_dir.join(format!("latent_{set}_{}.tsv", world.label));
        write_latents(&path, &world.estimates, &names)?;
        outputs.push(path);
    }
    Ok(worlds)
}

/// Runs the whole analysis on a labeled population.
///
/// Every scenario is applied to both halves of the split. A variant's
/// predictor for a scenario is trained on that scenario's training latents
/// against the observed training decisions, then scored on the same
/// scenario's test latents. Sweeps group candidates by their factual test
/// group and normalize by the factual test group sizes.
pub fn run_pipeline(
    population: &Population,
    config: &RunConfig,
    out_dir: &Path,
    progress: &dyn SamplingProgress,
) -> Result<RunReport, PipelineError> {
    config.validate()?;
    let scenarios = config.resolve_scenarios(population.num_groups())?;
    population.require_decision()?;
    let (train, test) =
        split_train_test(population, config.split.test_fraction, config.split.seed)?;
    log::info!(
        "Split {} candidates into {} training and {} test candidates (seed {})",
        population.len(),
        train.len(),
        test.len(),
        config.split.seed
    );

    let mut outputs = Vec::new();
    let fit = fit_and_save(&train, config, out_dir, progress, &mut outputs)?;
    let train_decisions = train.require_decision()?;

    let train_worlds =
        counterfactuals_and_save(&fit.params, &train, "train", config, out_dir, progress, &mut outputs)?;
    let test_worlds =
        counterfactuals_and_save(&fit.params, &test, "test", config, out_dir, progress, &mut outputs)?;

    let test_groups = test.group_indices();
    let sizes = GroupSizes::from_membership(&test_groups, test.num_groups())?;
    let test_names = member_names(&test);
    let group_names = test.group_names();

    let mut predictions = Vec::new();
    for &variant in &config.sweep.variants {
        for (train_world, test_world) in train_worlds.iter().zip(&test_worlds) {
            let label = test_world.label.clone();
            let wrap = |source| PipelineError::Predictor {
                variant,
                scenario: label.clone(),
                source,
            };
            let predictor = FittedPredictor::fit(
                variant,
                &train_world.population,
                train_world.means().view(),
                train_decisions,
                &config.predictor,
            )
            .map_err(wrap)?;
            let probabilities = predictor
                .predict(&test_world.population, test_world.means().view())
                .map_err(wrap)?;

            let path = out_dir.join(format!("predictions_{variant}_{label}.tsv"));
            write_predictions(&path, probabilities.view(), &test_names)?;
            outputs.push(path);

            let rows = fairness_sweep(
                probabilities.view(),
                &test_groups,
                &sizes,
                &config.sweep.thresholds,
            )?;
            let path = out_dir.join(format!("sweep_{variant}_{label}.tsv"));
            write_sweep(&path, &rows, group_names)?;
            outputs.push(path);

            predictions.push(ScenarioPredictions {
                variant,
                scenario: test_world.scenario,
                label,
                probabilities,
            });
        }
    }

    for &variant in &config.sweep.variants {
        let of_variant: Vec<&ScenarioPredictions> =
            predictions.iter().filter(|p| p.variant == variant).collect();
        for (i, a) in of_variant.iter().enumerate() {
            for b in &of_variant[i + 1..] {
                let rows = agreement_sweep(
                    a.probabilities.view(),
                    b.probabilities.view(),
                    &config.sweep.agreement_thresholds,
                )?;
                let path = out_dir.join(format!(
                    "agreement_{variant}_{}_vs_{}.tsv",
                    a.label, b.label
                ));
                write_agreement(&path, &rows)?;
                outputs.push(path);
            }
        }
    }

    log::info!(
        "Run complete: {} scenario(s), {} variant(s), {} file(s) written to '{}'",
        scenarios.len(),
        config.sweep.variants.len(),
        outputs.len(),
        out_dir.display()
    );
    if !fit.quality.reliable {
        log::warn!("The generative-model fit was flagged unreliable; see quality.toml");
    }

    Ok(RunReport {
        fit,
        test_latents: test_worlds,
        predictions,
        outputs,
    })
}

/// Each candidate's factual group name.
fn member_names(population: &Population) -> Vec<String> {
    let names = population.group_names();
    population
        .group_indices()
        .into_iter()
        .map(|g| names[g].clone())
        .collect()
}
