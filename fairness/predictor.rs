//! # Decision Predictor
//!
//! Maximum-likelihood logistic regressions that predict the hiring decision
//! from three different column sets:
//!
//! - `fair`: intercept and the latent factor only;
//! - `unaware`: intercept and the eight observed features;
//! - `full`: the eight observed features and the protected one-hot block,
//!   which already spans the intercept.
//!
//! Continuous columns are standardized with training statistics and the
//! same transformation is replayed at prediction time. Fitting is
//! deterministic BFGS with a tiny ridge that only matters under separation.

use crate::data::{Feature, FeatureKind, Population};
use crate::model::{log1p_exp, sigmoid};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Bounds for every reported probability.
pub const PROBABILITY_FLOOR: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum PredictorError {
    #[error("Invalid predictor settings: {0}")]
    InvalidConfig(String),
    #[error("Shape mismatch for {what}: expected {expected}, found {found}.")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Non-finite value in predictor column '{0}'.")]
    NonFiniteInput(String),
    #[error(
        "Predictor was fitted with {expected} protected groups but the population has {found}."
    )]
    GroupCountMismatch { expected: usize, found: usize },
    #[error("Logistic regression failed to converge: {0}")]
    OptimizationFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    Fair,
    Unaware,
    Full,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 3] = [ModelVariant::Fair, ModelVariant::Unaware, ModelVariant::Full];

    pub fn name(self) -> &'static str {
        match self {
            ModelVariant::Fair => "fair",
            ModelVariant::Unaware => "unaware",
            ModelVariant::Full => "full",
        }
    }

    fn has_intercept(self) -> bool {
        !matches!(self, ModelVariant::Full)
    }

    /// Predictor columns (intercept excluded), in design-matrix order.
    pub fn column_names(self, group_names: &[String]) -> Vec<String> {
        let features = Feature::ALL.iter().map(|f| f.column_name().to_string());
        match self {
            ModelVariant::Fair => vec!["u".to_string()],
            ModelVariant::Unaware => features.collect(),
            ModelVariant::Full => features
                .chain(group_names.iter().map(|g| format!("a_{g}")))
                .collect(),
        }
    }

    /// Raw design columns plus a flag per column telling whether it is
    /// continuous (and therefore standardized).
    fn design(
        self,
        population: &Population,
        latent: ArrayView1<f64>,
    ) -> Result<(Array2<f64>, Vec<bool>), PredictorError> {
        if latent.len() != population.len() {
            return Err(PredictorError::ShapeMismatch {
                what: "latent factors",
                expected: population.len(),
                found: latent.len(),
            });
        }
        let continuous_features: Vec<bool> = Feature::ALL
            .iter()
            .map(|f| f.kind() == FeatureKind::Continuous)
            .collect();
        match self {
            ModelVariant::Fair => Ok((latent.to_owned().insert_axis(Axis(1)), vec![true])),
            ModelVariant::Unaware => Ok((population.features().to_owned(), continuous_features)),
            ModelVariant::Full => {
                let design = ndarray::concatenate(
                    Axis(1),
                    &[population.features(), population.protected()],
                )
                .map_err(|e| PredictorError::InvalidConfig(format!("design assembly: {e}")))?;
                let mut continuous = continuous_features;
                continuous.extend(std::iter::repeat_n(false, population.num_groups()));
                Ok((design, continuous))
            }
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// L2 penalty on the slopes, scaled per observation.
    pub ridge: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            ridge: 1e-6,
            tolerance: 1e-6,
            max_iterations: 1000,
        }
    }
}

impl PredictorConfig {
    pub fn validate(&self) -> Result<(), PredictorError> {
        if !(self.ridge.is_finite() && self.ridge >= 0.0) {
            return Err(PredictorError::InvalidConfig(format!(
                "ridge must be non-negative, got {}",
                self.ridge
            )));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(PredictorError::InvalidConfig(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(PredictorError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A fitted logistic regression for one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPredictor {
    pub variant: ModelVariant,
    pub column_names: Vec<String>,
    /// Intercept (when the variant has one) followed by one slope per
    /// column, on the standardized scale.
    pub coefficients: Vec<f64>,
    center: Vec<f64>,
    scale: Vec<f64>,
    pub iterations: usize,
    /// Mean negative log-likelihood at the optimum, penalty included.
    pub final_loss: f64,
}

impl FittedPredictor {
    /// Fits `variant` on a training population, its latent factors and the
    /// observed decisions.
    pub fn fit(
        variant: ModelVariant,
        population: &Population,
        latent: ArrayView1<f64>,
        decisions: ArrayView1<f64>,
        config: &PredictorConfig,
    ) -> Result<Self, PredictorError> {
        config.validate()?;
        if decisions.len() != population.len() {
            return Err(PredictorError::ShapeMismatch {
                what: "decisions",
                expected: population.len(),
                found: decisions.len(),
            });
        }
        let column_names = variant.column_names(population.group_names());
        let (raw, continuous) = variant.design(population, latent)?;
        check_finite(raw.view(), &column_names)?;

        let mut center = vec![0.0; raw.ncols()];
        let mut scale = vec![1.0; raw.ncols()];
        for (j, column) in raw.axis_iter(Axis(1)).enumerate() {
            if continuous[j] {
                let mean = column.mean().unwrap_or(0.0);
                let sd = column.std(0.0);
                center[j] = mean;
                scale[j] = if sd > 0.0 { sd } else { 1.0 };
            }
        }
        let x = with_intercept(standardize(raw.view(), &center, &scale), variant.has_intercept());
        let y = decisions.to_owned();
        let n = y.len() as f64;
        let ridge = config.ridge;
        let first_slope = usize::from(variant.has_intercept());
        let dim = x.ncols();

        let loss_and_grad = move |beta: &Array1<f64>| -> (f64, Array1<f64>) {
            let eta = x.dot(beta);
            let mut loss = 0.0;
            let mut residual = Array1::<f64>::zeros(eta.len());
            for i in 0..eta.len() {
                // -log L_i = log(1 + e^eta) - y * eta
                loss += log1p_exp(eta[i]) - y[i] * eta[i];
                residual[i] = sigmoid(eta[i]) - y[i];
            }
            let mut grad = x.t().dot(&residual) / n;
            loss /= n;
            for j in first_slope..beta.len() {
                loss += 0.5 * ridge * beta[j] * beta[j];
                grad[j] += ridge * beta[j];
            }
            (loss, grad)
        };

        let BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        } = Bfgs::new(Array1::zeros(dim), loss_and_grad)
            .with_tolerance(config.tolerance)
            .with_max_iterations(config.max_iterations)
            .run()
            .map_err(|e| PredictorError::OptimizationFailed(format!("BFGS failed: {:?}", e)))?;

        log::debug!(
            "Fitted '{variant}' predictor on {} rows in {iterations} iterations (loss {final_value:.6})",
            population.len()
        );

        Ok(Self {
            variant,
            column_names,
            coefficients: final_point.to_vec(),
            center,
            scale,
            iterations,
            final_loss: final_value,
        })
    }

    /// Decision probabilities for a population, clamped to
    /// `[PROBABILITY_FLOOR, 1 - PROBABILITY_FLOOR]`.
    pub fn predict(
        &self,
        population: &Population,
        latent: ArrayView1<f64>,
    ) -> Result<Array1<f64>, PredictorError> {
        if self.variant == ModelVariant::Full {
            let expected = self.column_names.len() - Feature::COUNT;
            if population.num_groups() != expected {
                return Err(PredictorError::GroupCountMismatch {
                    expected,
                    found: population.num_groups(),
                });
            }
        }
        let (raw, _) = self.variant.design(population, latent)?;
        check_finite(raw.view(), &self.column_names)?;
        let x = with_intercept(
            standardize(raw.view(), &self.center, &self.scale),
            self.variant.has_intercept(),
        );
        let beta = Array1::from(self.coefficients.clone());
        Ok(x
            .dot(&beta)
            .mapv(|eta| sigmoid(eta).clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR)))
    }
}

fn check_finite(raw: ArrayView2<f64>, names: &[String]) -> Result<(), PredictorError> {
    for (j, column) in raw.axis_iter(Axis(1)).enumerate() {
        if column.iter().any(|v| !v.is_finite()) {
            return Err(PredictorError::NonFiniteInput(names[j].clone()));
        }
    }
    Ok(())
}

fn standardize(raw: ArrayView2<f64>, center: &[f64], scale: &[f64]) -> Array2<f64> {
    let mut x = raw.to_owned();
    for (j, mut column) in x.axis_iter_mut(Axis(1)).enumerate() {
        column.mapv_inplace(|v| (v - center[j]) / scale[j]);
    }
    x
}

fn with_intercept(x: Array2<f64>, intercept: bool) -> Array2<f64> {
    if !intercept {
        return x;
    }
    let mut out = Array2::<f64>::ones((x.nrows(), x.ncols() + 1));
    out.slice_mut(ndarray::s![.., 1..]).assign(&x);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{informative_parameters, labeled_population};

    #[test]
    fn fair_predictor_learns_the_latent_effect() {
        let params = informative_parameters();
        let (population, latent) = labeled_population(&params, 400, 17);
        let decisions = population.decision().unwrap();
        let fitted = FittedPredictor::fit(
            ModelVariant::Fair,
            &population,
            latent.view(),
            decisions,
            &PredictorConfig::default(),
        )
        .unwrap();
        assert_eq!(fitted.coefficients.len(), 2);
        assert!(fitted.coefficients[1] > 0.5, "slope = {}", fitted.coefficients[1]);

        let probabilities = fitted.predict(&population, latent.view()).unwrap();
        assert_eq!(probabilities.len(), 400);
        assert!(probabilities.iter().all(|&p| p > 0.0 && p < 1.0));
        // Higher latent factor, higher probability.
        let (lo, hi) = latent
            .iter()
            .enumerate()
            .fold((0, 0), |(lo, hi), (i, &u)| {
                (
                    if u < latent[lo] { i } else { lo },
                    if u > latent[hi] { i } else { hi },
                )
            });
        assert!(probabilities[hi] > probabilities[lo]);
    }

    #[test]
    fn variants_use_their_column_sets() {
        let params = informative_parameters();
        let (population, latent) = labeled_population(&params, 300, 4);
        let decisions = population.decision().unwrap();
        let config = PredictorConfig::default();
        let unaware = FittedPredictor::fit(
            ModelVariant::Unaware,
            &population,
            latent.view(),
            decisions,
            &config,
        )
        .unwrap();
        assert_eq!(unaware.coefficients.len(), 1 + 8);
        assert_eq!(unaware.column_names[0], "grade");

        let full = FittedPredictor::fit(
            ModelVariant::Full,
            &population,
            latent.view(),
            decisions,
            &config,
        )
        .unwrap();
        assert_eq!(full.coefficients.len(), 8 + 2);
        assert_eq!(full.column_names[8..], ["a_a".to_string(), "a_b".to_string()]);
        // Group b is favored by the decision model.
        assert!(full.coefficients[9] > full.coefficients[8]);
    }

    #[test]
    fn fitting_is_deterministic() {
        let params = informative_parameters();
        let (population, latent) = labeled_population(&params, 150, 9);
        let decisions = population.decision().unwrap();
        let fit = || {
            FittedPredictor::fit(
                ModelVariant::Unaware,
                &population,
                latent.view(),
                decisions,
                &PredictorConfig::default(),
            )
            .unwrap()
        };
        assert_eq!(fit(), fit());
    }

    #[test]
    fn extreme_scores_stay_inside_the_unit_interval() {
        let params = informative_parameters();
        let (population, latent) = labeled_population(&params, 20, 2);
        let fitted = FittedPredictor {
            variant: ModelVariant::Fair,
            column_names: vec!["u".to_string()],
            coefficients: vec![0.0, 1e4],
            center: vec![0.0],
            scale: vec![1.0],
            iterations: 0,
            final_loss: 0.0,
        };
        let probabilities = fitted.predict(&population, latent.view()).unwrap();
        assert!(
            probabilities
                .iter()
                .all(|&p| (PROBABILITY_FLOOR..=1.0 - PROBABILITY_FLOOR).contains(&p))
        );
    }

    #[test]
    fn rejects_mismatched_inputs() {
        let params = informative_parameters();
        let (population, latent) = labeled_population(&params, 20, 2);
        let short = latent.slice(ndarray::s![..5]);
        let err = FittedPredictor::fit(
            ModelVariant::Fair,
            &population,
            short,
            population.decision().unwrap(),
            &PredictorConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PredictorError::ShapeMismatch { .. }));

        let bad = PredictorConfig {
            ridge: -1.0,
            ..PredictorConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
