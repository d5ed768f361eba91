//! Run configuration, read from TOML.
//!
//! Every field has a default, so a file only needs the settings it changes:
//!
//! ```toml
//! sign_anchor = "grade"
//!
//! [sampler]
//! n_chains = 4
//! n_warmup = 1000
//!
//! [sweep.thresholds]
//! step = 0.05
//! ```

use crate::counterfactual::{CounterfactualConfig, Scenario};
use crate::data::Feature;
use crate::diagnostics::QualityThresholds;
use crate::hmc::NutsConfig;
use crate::predictor::{ModelVariant, PredictorConfig};
use crate::sweep::ThresholdGrid;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration in [{section}]: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
}

impl ConfigError {
    fn invalid(section: &'static str, err: impl ToString) -> Self {
        ConfigError::Invalid {
            section,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Fraction of candidates held out for counterfactual evaluation.
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.3,
            seed: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub thresholds: ThresholdGrid,
    /// Grid for the cross-scenario agreement sweep.
    pub agreement_thresholds: ThresholdGrid,
    pub variants: Vec<ModelVariant>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdGrid::default(),
            agreement_thresholds: ThresholdGrid {
                start: 0.05,
                end: 0.95,
                step: 0.05,
            },
            variants: ModelVariant::ALL.to_vec(),
        }
    }
}

/// Everything a full run needs besides the input data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Feature whose latent loading is forced non-negative.
    pub sign_anchor: Feature,
    /// Scenarios to re-infer. Empty means factual plus one world per group.
    pub scenarios: Vec<Scenario>,
    pub sampler: NutsConfig,
    pub counterfactual: CounterfactualConfig,
    pub predictor: PredictorConfig,
    pub sweep: SweepConfig,
    pub quality: QualityThresholds,
    pub split: SplitConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sign_anchor: Feature::Grade,
            scenarios: Vec::new(),
            sampler: NutsConfig::default(),
            counterfactual: CounterfactualConfig::default(),
            predictor: PredictorConfig::default(),
            sweep: SweepConfig::default(),
            quality: QualityThresholds::default(),
            split: SplitConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&text)?;
        config.validate()?;
        log::info!("Loaded configuration from '{path}'");
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Checks every section. Group-dependent checks live in
    /// [`Self::resolve_scenarios`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sampler
            .validate()
            .map_err(|e| ConfigError::invalid("sampler", e))?;
        self.counterfactual
            .validate()
            .map_err(|e| ConfigError::invalid("counterfactual", e))?;
        self.predictor
            .validate()
            .map_err(|e| ConfigError::invalid("predictor", e))?;
        self.sweep
            .thresholds
            .validate()
            .map_err(|e| ConfigError::invalid("sweep.thresholds", e))?;
        self.sweep
            .agreement_thresholds
            .validate()
            .map_err(|e| ConfigError::invalid("sweep.agreement_thresholds", e))?;
        if self.sweep.variants.is_empty() {
            return Err(ConfigError::invalid(
                "sweep",
                "at least one predictor variant is required",
            ));
        }
        let q = &self.quality;
        if !(q.max_rhat >= 1.0 && q.min_ess_bulk >= 0.0 && q.min_ess_tail >= 0.0) {
            return Err(ConfigError::invalid(
                "quality",
                "max_rhat must be at least 1 and ESS floors non-negative",
            ));
        }
        if !(self.split.test_fraction > 0.0 && self.split.test_fraction < 1.0) {
            return Err(ConfigError::invalid(
                "split",
                format!(
                    "test_fraction must lie strictly between 0 and 1, got {}",
                    self.split.test_fraction
                ),
            ));
        }
        Ok(())
    }

    /// The scenarios to run for `num_groups` groups, checked against that
    /// count.
    pub fn resolve_scenarios(&self, num_groups: usize) -> Result<Vec<Scenario>, ConfigError> {
        if self.scenarios.is_empty() {
            return Ok(Scenario::standard_set(num_groups));
        }
        for scenario in &self.scenarios {
            if let Scenario::AllGroup { group } = scenario {
                if *group >= num_groups {
                    return Err(ConfigError::invalid(
                        "scenarios",
                        format!("group {group} does not exist; the data has {num_groups} groups"),
                    ));
                }
            }
        }
        Ok(self.scenarios.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counterfactual::LatentEstimator;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_files_fill_in_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
sign_anchor = "programming"

[sampler]
n_chains = 3
seed = 77

[counterfactual.estimator]
method = "grid"
points = 501
bound = 6.0

[sweep.thresholds]
step = 0.05
"#
        )
        .unwrap();
        let config = RunConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.sign_anchor, Feature::Programming);
        assert_eq!(config.sampler.n_chains, 3);
        assert_eq!(config.sampler.seed, 77);
        assert_eq!(config.sampler.n_warmup, NutsConfig::default().n_warmup);
        assert_eq!(
            config.counterfactual.estimator,
            LatentEstimator::Grid {
                points: 501,
                bound: 6.0
            }
        );
        assert_eq!(config.sweep.thresholds.step, 0.05);
        assert_eq!(config.sweep.thresholds.end, 1.0);
        assert_eq!(config.sweep.variants.len(), 3);
    }

    #[test]
    fn saved_configuration_loads_back() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        let config = RunConfig {
            scenarios: vec![Scenario::AllGroup { group: 1 }, Scenario::Factual],
            ..RunConfig::default()
        };
        config.save(path).unwrap();
        assert_eq!(RunConfig::load(path).unwrap(), config);
    }

    #[test]
    fn invalid_sections_are_named() {
        let config = RunConfig {
            sampler: NutsConfig {
                n_chains: 1,
                ..NutsConfig::default()
            },
            ..RunConfig::default()
        };
        match config.validate() {
            Err(ConfigError::Invalid { section, .. }) => assert_eq!(section, "sampler"),
            other => panic!("expected a sampler error, got {other:?}"),
        }

        let mut config = RunConfig::default();
        config.split.test_fraction = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { section: "split", .. })
        ));
    }

    #[test]
    fn scenarios_default_to_every_world() {
        let config = RunConfig::default();
        assert_eq!(config.resolve_scenarios(3).unwrap().len(), 4);
        let explicit = RunConfig {
            scenarios: vec![Scenario::AllGroup { group: 2 }],
            ..RunConfig::default()
        };
        assert!(explicit.resolve_scenarios(2).is_err());
        assert!(explicit.resolve_scenarios(3).is_ok());
    }
}
