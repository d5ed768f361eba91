//! # Generative Model
//!
//! A single latent factor `u_i ~ N(0, 1)` per candidate drives every observed
//! feature and the hiring decision:
//!
//! - `grade ~ Normal(intercept + eta_u*u + a·eta_a, sigma_g)`, with
//!   `sigma_g² ~ InvGamma(1, 1)`
//! - binary features `~ Bernoulli(sigmoid(intercept + eta_u*u + a·eta_a))`
//! - count features `~ Poisson(exp(intercept + eta_u*u + a·eta_a))`
//! - `decision ~ Bernoulli(sigmoid(eta_u*u + a·eta_a))`
//!
//! The decision never depends on an observed feature: everything the
//! protected attribute does to the decision outside `a·eta_a` must travel
//! through `u`. Every coefficient has a standard-normal prior.
//!
//! The model runs in two modes. [`TrainingModel`] frees all coefficients and
//! every `u` and conditions on the decisions. [`InferenceModel`] holds a frozen
//! [`GlobalParameters`] bundle and frees only the latent factors; the decision
//! term is dropped so a counterfactual never conditions on the outcome.

use crate::data::{Feature, FeatureKind, Population};
use crate::hmc::LogDensity;
use ndarray::{Array1, ArrayView1, ArrayViewMut1, s};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// Likelihood family of a feature block, each with its canonical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureFamily {
    /// Identity link with a shared residual scale.
    Gaussian,
    /// Logit link, for 0/1 outcomes.
    BernoulliLogit,
    /// Log link, for non-negative counts.
    PoissonLog,
}

/// Log-likelihood of one observation and its partial derivatives with
/// respect to the linear predictor and to the Gaussian log-variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLikelihood {
    pub value: f64,
    pub d_eta: f64,
    pub d_log_variance: f64,
}

impl FeatureFamily {
    pub fn for_kind(kind: FeatureKind) -> Self {
        match kind {
            FeatureKind::Continuous => FeatureFamily::Gaussian,
            FeatureKind::Binary => FeatureFamily::BernoulliLogit,
            FeatureKind::Count => FeatureFamily::PoissonLog,
        }
    }

    /// Maps a linear predictor to the mean of the response.
    pub fn inverse_link(self, eta: f64) -> f64 {
        match self {
            FeatureFamily::Gaussian => eta,
            FeatureFamily::BernoulliLogit => sigmoid(eta),
            FeatureFamily::PoissonLog => eta.exp(),
        }
    }

    /// `log_variance` is only read by the Gaussian family.
    pub fn log_likelihood(self, y: f64, eta: f64, log_variance: f64) -> PointLikelihood {
        match self {
            FeatureFamily::Gaussian => {
                let inv_var = (-log_variance).exp();
                let residual = y - eta;
                let sq = residual * residual;
                PointLikelihood {
                    value: -0.5 * (2.0 * PI).ln() - 0.5 * log_variance - 0.5 * sq * inv_var,
                    d_eta: residual * inv_var,
                    d_log_variance: -0.5 + 0.5 * sq * inv_var,
                }
            }
            FeatureFamily::BernoulliLogit => PointLikelihood {
                value: y * eta - log1p_exp(eta),
                d_eta: y - sigmoid(eta),
                d_log_variance: 0.0,
            },
            FeatureFamily::PoissonLog => {
                let rate = eta.exp();
                PointLikelihood {
                    value: y * eta - rate - ln_gamma(y + 1.0),
                    d_eta: y - rate,
                    d_log_variance: 0.0,
                }
            }
        }
    }
}

/// Numerically stable logistic function.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `ln(1 + exp(x))` without overflow.
pub fn log1p_exp(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// The `(intercept, latent loading, protected loading)` record shared by
/// every feature block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCoefficients {
    pub feature: Feature,
    pub intercept: f64,
    pub eta_u: f64,
    pub eta_a: Vec<f64>,
}

impl FeatureCoefficients {
    pub fn family(&self) -> FeatureFamily {
        FeatureFamily::for_kind(self.feature.kind())
    }

    /// The part of the linear predictor that does not involve `u`.
    pub fn offset(&self, protected: ArrayView1<f64>) -> f64 {
        self.intercept
            + protected
                .iter()
                .zip(&self.eta_a)
                .map(|(a, e)| a * e)
                .sum::<f64>()
    }
}

/// Decision block. There is no intercept: the one-hot protected vector
/// already spans one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCoefficients {
    pub eta_u: f64,
    pub eta_a: Vec<f64>,
}

/// Frozen point estimates of every population-level parameter.
///
/// This is the bundle passed by reference into counterfactual re-inference.
/// It is saved as human-readable TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalParameters {
    pub group_names: Vec<String>,
    /// Residual standard deviation of `grade`.
    pub sigma_g: f64,
    pub decision: DecisionCoefficients,
    /// One block per feature, in [`Feature::ALL`] order.
    pub features: Vec<FeatureCoefficients>,
}

/// Custom error type for parameter bundles and model construction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write parameter file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML parameter file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize parameters to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Data has {found} protected groups, but the parameters were fitted on {expected}.")]
    MismatchedGroupCount { found: usize, expected: usize },
    #[error("Invalid parameter bundle: {0}")]
    InvalidParameters(String),
    #[error("Training mode needs observed decisions for every candidate.")]
    MissingDecision,
}

impl GlobalParameters {
    pub fn num_groups(&self) -> usize {
        self.group_names.len()
    }

    pub fn feature(&self, feature: Feature) -> &FeatureCoefficients {
        &self.features[feature.index()]
    }

    /// Checks shape and finiteness. Called on load and before inference.
    pub fn validate(&self) -> Result<(), ModelError> {
        let k = self.num_groups();
        if self.features.len() != Feature::COUNT {
            return Err(ModelError::InvalidParameters(format!(
                "expected {} feature blocks, found {}",
                Feature::COUNT,
                self.features.len()
            )));
        }
        for (block, expected) in self.features.iter().zip(Feature::ALL) {
            if block.feature != expected {
                return Err(ModelError::InvalidParameters(format!(
                    "feature block '{}' found where '{}' was expected",
                    block.feature, expected
                )));
            }
            if block.eta_a.len() != k {
                return Err(ModelError::InvalidParameters(format!(
                    "'{}' has {} protected loadings for {k} groups",
                    block.feature,
                    block.eta_a.len()
                )));
            }
            let finite = block.intercept.is_finite()
                && block.eta_u.is_finite()
                && block.eta_a.iter().all(|v| v.is_finite());
            if !finite {
                return Err(ModelError::InvalidParameters(format!(
                    "'{}' has non-finite coefficients",
                    block.feature
                )));
            }
        }
        if self.decision.eta_a.len() != k {
            return Err(ModelError::InvalidParameters(format!(
                "decision has {} protected loadings for {k} groups",
                self.decision.eta_a.len()
            )));
        }
        if !(self.decision.eta_u.is_finite() && self.decision.eta_a.iter().all(|v| v.is_finite()))
        {
            return Err(ModelError::InvalidParameters(
                "decision has non-finite coefficients".to_string(),
            ));
        }
        if !(self.sigma_g.is_finite() && self.sigma_g > 0.0) {
            return Err(ModelError::InvalidParameters(format!(
                "sigma_g must be positive and finite, got {}",
                self.sigma_g
            )));
        }
        Ok(())
    }

    /// Ensures a population has the protected-attribute width these
    /// parameters were fitted on.
    pub fn check_compatible(&self, population: &Population) -> Result<(), ModelError> {
        if population.num_groups() != self.num_groups() {
            return Err(ModelError::MismatchedGroupCount {
                found: population.num_groups(),
                expected: self.num_groups(),
            });
        }
        Ok(())
    }

    /// Saves the parameters to a file in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads and validates parameters from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let params: GlobalParameters = toml::from_str(&toml_string)?;
        params.validate()?;
        Ok(params)
    }
}

/// Positions of every free parameter in the flat training-mode vector.
///
/// Order: `u[0..N]`, then per feature `(intercept, eta_u, eta_a[0..K])`,
/// then the decision's `(eta_u, eta_a[0..K])`, then the log-variance of
/// `grade`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    pub num_obs: usize,
    pub num_groups: usize,
}

impl ParameterLayout {
    pub fn new(num_obs: usize, num_groups: usize) -> Self {
        Self {
            num_obs,
            num_groups,
        }
    }

    fn feature_block_len(&self) -> usize {
        2 + self.num_groups
    }

    pub fn dim(&self) -> usize {
        self.num_obs
            + Feature::COUNT * self.feature_block_len()
            + 1
            + self.num_groups
            + 1
    }

    pub fn feature_block(&self, feature: Feature) -> usize {
        self.num_obs + feature.index() * self.feature_block_len()
    }

    pub fn decision_block(&self) -> usize {
        self.num_obs + Feature::COUNT * self.feature_block_len()
    }

    pub fn log_variance(&self) -> usize {
        self.dim() - 1
    }

    /// Every coefficient with a standard-normal prior.
    pub fn coefficient_range(&self) -> std::ops::Range<usize> {
        self.num_obs..self.log_variance()
    }

    /// Names of the constrained parameters, aligned with [`Self::constrain`].
    pub fn names(&self, group_names: &[String]) -> Vec<String> {
        let mut names = Vec::with_capacity(self.dim());
        names.extend((0..self.num_obs).map(|i| format!("u[{i}]")));
        for feature in Feature::ALL {
            names.push(format!("{feature}.intercept"));
            names.push(format!("{feature}.eta_u"));
            names.extend(group_names.iter().map(|g| format!("{feature}.eta_a[{g}]")));
        }
        names.push("decision.eta_u".to_string());
        names.extend(group_names.iter().map(|g| format!("decision.eta_a[{g}]")));
        names.push("sigma_g".to_string());
        names
    }

    /// Maps an unconstrained draw to the reported scale: the trailing
    /// log-variance becomes `sigma_g`.
    pub fn constrain(&self, draw: ArrayView1<f64>) -> Array1<f64> {
        let mut out = draw.to_owned();
        let lv = self.log_variance();
        out[lv] = (0.5 * draw[lv]).exp();
        out
    }

    /// Reflects a draw so the anchor feature's latent loading is
    /// non-negative. The likelihood is invariant under flipping `u` and every
    /// latent loading together. Returns whether the draw was flipped.
    pub fn reflect_sign(&self, mut draw: ArrayViewMut1<f64>, anchor: Feature) -> bool {
        if draw[self.feature_block(anchor) + 1] >= 0.0 {
            return false;
        }
        draw.slice_mut(s![0..self.num_obs]).mapv_inplace(|u| -u);
        for feature in Feature::ALL {
            draw[self.feature_block(feature) + 1] *= -1.0;
        }
        draw[self.decision_block()] *= -1.0;
        true
    }

    /// Packs parameters and latent factors into an unconstrained vector.
    pub fn pack(&self, params: &GlobalParameters, latent: ArrayView1<f64>) -> Array1<f64> {
        let k = self.num_groups;
        let mut theta = Array1::<f64>::zeros(self.dim());
        theta.slice_mut(s![0..self.num_obs]).assign(&latent);
        for feature in Feature::ALL {
            let block = self.feature_block(feature);
            let coeffs = params.feature(feature);
            theta[block] = coeffs.intercept;
            theta[block + 1] = coeffs.eta_u;
            for g in 0..k {
                theta[block + 2 + g] = coeffs.eta_a[g];
            }
        }
        let decision = self.decision_block();
        theta[decision] = params.decision.eta_u;
        for g in 0..k {
            theta[decision + 1 + g] = params.decision.eta_a[g];
        }
        theta[self.log_variance()] = 2.0 * params.sigma_g.ln();
        theta
    }

    /// Builds a parameter bundle from a constrained vector (e.g. posterior
    /// means), ignoring the latent block.
    pub fn to_parameters(
        &self,
        constrained: ArrayView1<f64>,
        group_names: &[String],
    ) -> GlobalParameters {
        let k = self.num_groups;
        let features = Feature::ALL
            .into_iter()
            .map(|feature| {
                let block = self.feature_block(feature);
                FeatureCoefficients {
                    feature,
                    intercept: constrained[block],
                    eta_u: constrained[block + 1],
                    eta_a: constrained.slice(s![block + 2..block + 2 + k]).to_vec(),
                }
            })
            .collect();
        let decision = self.decision_block();
        GlobalParameters {
            group_names: group_names.to_vec(),
            sigma_g: constrained[self.log_variance()],
            decision: DecisionCoefficients {
                eta_u: constrained[decision],
                eta_a: constrained
                    .slice(s![decision + 1..decision + 1 + k])
                    .to_vec(),
            },
            features,
        }
    }
}

/// Training-mode joint density over all latent factors and coefficients.
pub struct TrainingModel<'a> {
    population: &'a Population,
    decision: ArrayView1<'a, f64>,
    layout: ParameterLayout,
}

impl<'a> TrainingModel<'a> {
    pub fn new(population: &'a Population) -> Result<Self, ModelError> {
        let decision = population
            .decision()
            .ok_or(ModelError::MissingDecision)?;
        Ok(Self {
            population,
            decision,
            layout: ParameterLayout::new(population.len(), population.num_groups()),
        })
    }

    pub fn layout(&self) -> ParameterLayout {
        self.layout
    }
}

impl LogDensity for TrainingModel<'_> {
    fn dim(&self) -> usize {
        self.layout.dim()
    }

    fn log_density_and_gradient(
        &self,
        theta: ArrayView1<f64>,
        mut grad: ArrayViewMut1<f64>,
    ) -> f64 {
        let layout = &self.layout;
        let n = layout.num_obs;
        let k = layout.num_groups;
        let lv = layout.log_variance();
        let log_variance = theta[lv];
        let protected = self.population.protected();
        grad.fill(0.0);

        let mut lp = 0.0;
        for i in 0..n {
            lp -= 0.5 * theta[i] * theta[i];
            grad[i] -= theta[i];
        }
        for j in layout.coefficient_range() {
            lp -= 0.5 * theta[j] * theta[j];
            grad[j] -= theta[j];
        }
        // InvGamma(1, 1) on the variance, sampled on the log scale.
        let inv_var = (-log_variance).exp();
        lp += -log_variance - inv_var;
        grad[lv] += -1.0 + inv_var;

        for feature in Feature::ALL {
            let family = FeatureFamily::for_kind(feature.kind());
            let y = self.population.feature_column(feature);
            let block = layout.feature_block(feature);
            let intercept = theta[block];
            let eta_u = theta[block + 1];
            let eta_a = theta.slice(s![block + 2..block + 2 + k]);
            for i in 0..n {
                let a = protected.row(i);
                let u = theta[i];
                let eta = intercept + eta_u * u + a.dot(&eta_a);
                let point = family.log_likelihood(y[i], eta, log_variance);
                lp += point.value;
                grad[block] += point.d_eta;
                grad[block + 1] += point.d_eta * u;
                for g in 0..k {
                    grad[block + 2 + g] += point.d_eta * a[g];
                }
                grad[i] += point.d_eta * eta_u;
                grad[lv] += point.d_log_variance;
            }
        }

        let block = layout.decision_block();
        let eta_u = theta[block];
        let eta_a = theta.slice(s![block + 1..block + 1 + k]);
        for i in 0..n {
            let a = protected.row(i);
            let u = theta[i];
            let eta = eta_u * u + a.dot(&eta_a);
            let point = FeatureFamily::BernoulliLogit.log_likelihood(self.decision[i], eta, 0.0);
            lp += point.value;
            grad[block] += point.d_eta * u;
            for g in 0..k {
                grad[block + 1 + g] += point.d_eta * a[g];
            }
            grad[i] += point.d_eta * eta_u;
        }

        lp
    }
}

/// Inference-mode model: frozen parameters, free latent factors, no decision.
pub struct InferenceModel<'a> {
    params: &'a GlobalParameters,
    population: &'a Population,
}

impl<'a> InferenceModel<'a> {
    pub fn new(
        params: &'a GlobalParameters,
        population: &'a Population,
    ) -> Result<Self, ModelError> {
        params.validate()?;
        params.check_compatible(population)?;
        Ok(Self { params, population })
    }

    pub fn len(&self) -> usize {
        self.population.len()
    }

    pub fn is_empty(&self) -> bool {
        self.population.is_empty()
    }

    /// Conditional on frozen parameters the latent factors are independent,
    /// so the inference-mode density factorizes into one target per candidate.
    pub fn individual(&self, i: usize) -> LatentPosterior {
        let all_protected = self.population.protected();
        let all_features = self.population.features();
        let protected = all_protected.row(i);
        let features = all_features.row(i);
        let mut offsets = [0.0; Feature::COUNT];
        let mut loadings = [0.0; Feature::COUNT];
        let mut values = [0.0; Feature::COUNT];
        for feature in Feature::ALL {
            let coeffs = self.params.feature(feature);
            offsets[feature.index()] = coeffs.offset(protected);
            loadings[feature.index()] = coeffs.eta_u;
            values[feature.index()] = features[feature.index()];
        }
        LatentPosterior {
            offsets,
            loadings,
            values,
            log_variance: 2.0 * self.params.sigma_g.ln(),
        }
    }
}

/// Unnormalized posterior of one candidate's latent factor under frozen
/// parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentPosterior {
    offsets: [f64; Feature::COUNT],
    loadings: [f64; Feature::COUNT],
    values: [f64; Feature::COUNT],
    log_variance: f64,
}

impl LatentPosterior {
    /// Log density and derivative at `u`.
    pub fn evaluate(&self, u: f64) -> (f64, f64) {
        let mut lp = -0.5 * u * u;
        let mut grad = -u;
        for feature in Feature::ALL {
            let j = feature.index();
            let eta = self.offsets[j] + self.loadings[j] * u;
            let point = FeatureFamily::for_kind(feature.kind()).log_likelihood(
                self.values[j],
                eta,
                self.log_variance,
            );
            lp += point.value;
            grad += point.d_eta * self.loadings[j];
        }
        (lp, grad)
    }
}

impl LogDensity for LatentPosterior {
    fn dim(&self) -> usize {
        1
    }

    fn log_density_and_gradient(
        &self,
        theta: ArrayView1<f64>,
        mut grad: ArrayViewMut1<f64>,
    ) -> f64 {
        let (lp, d) = self.evaluate(theta[0]);
        grad[0] = d;
        lp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Observation;
    use approx::assert_abs_diff_eq;

    fn example_parameters() -> GlobalParameters {
        let features = Feature::ALL
            .into_iter()
            .enumerate()
            .map(|(j, feature)| FeatureCoefficients {
                feature,
                intercept: 0.1 * j as f64 - 0.2,
                eta_u: 0.5 + 0.05 * j as f64,
                eta_a: vec![0.2, -0.3],
            })
            .collect();
        GlobalParameters {
            group_names: vec!["female".to_string(), "male".to_string()],
            sigma_g: 0.8,
            decision: DecisionCoefficients {
                eta_u: 1.2,
                eta_a: vec![-0.4, 0.4],
            },
            features,
        }
    }

    fn small_population() -> Population {
        let rows = [
            (0, 3.1, [1.0, 0.0, 1.0, 0.0, 1.0], [2.0, 1.0], 1.0),
            (1, 2.4, [0.0, 1.0, 0.0, 0.0, 1.0], [1.0, 0.0], 0.0),
            (0, 1.7, [0.0, 0.0, 0.0, 1.0, 0.0], [0.0, 2.0], 0.0),
            (1, 3.8, [1.0, 1.0, 1.0, 1.0, 1.0], [3.0, 1.0], 1.0),
        ];
        let observations: Vec<_> = rows
            .iter()
            .map(|&(group, grade, b, c, decision)| {
                let mut protected = vec![0.0, 0.0];
                protected[group] = 1.0;
                Observation {
                    protected,
                    grade,
                    debate: b[0],
                    programming: b[1],
                    internat: b[2],
                    entrep: b[3],
                    study: b[4],
                    lang: c[0],
                    degree: c[1],
                    decision: Some(decision),
                }
            })
            .collect();
        Population::from_observations(
            &observations,
            vec!["female".to_string(), "male".to_string()],
        )
        .unwrap()
    }

    fn finite_difference_check<T: LogDensity>(target: &T, theta: &Array1<f64>) {
        let mut grad = Array1::zeros(target.dim());
        target.log_density_and_gradient(theta.view(), grad.view_mut());
        let eps = 1e-6;
        let mut scratch = Array1::zeros(target.dim());
        for j in 0..target.dim() {
            let mut plus = theta.clone();
            let mut minus = theta.clone();
            plus[j] += eps;
            minus[j] -= eps;
            let lp_plus = target.log_density_and_gradient(plus.view(), scratch.view_mut());
            let lp_minus = target.log_density_and_gradient(minus.view(), scratch.view_mut());
            let fd = (lp_plus - lp_minus) / (2.0 * eps);
            assert!(
                (grad[j] - fd).abs() < 1e-4 * (1.0 + fd.abs()),
                "gradient mismatch at index {j}: analytic={}, fd={fd}",
                grad[j]
            );
        }
    }

    #[test]
    fn point_likelihoods_match_closed_forms() {
        let gaussian = FeatureFamily::Gaussian.log_likelihood(1.5, 1.0, 0.0);
        assert_abs_diff_eq!(gaussian.value, -0.5 * (2.0 * PI).ln() - 0.125, epsilon = 1e-12);
        assert_abs_diff_eq!(gaussian.d_eta, 0.5, epsilon = 1e-12);

        let bernoulli = FeatureFamily::BernoulliLogit.log_likelihood(1.0, 0.0, 0.0);
        assert_abs_diff_eq!(bernoulli.value, 0.5_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(bernoulli.d_eta, 0.5, epsilon = 1e-12);

        let poisson = FeatureFamily::PoissonLog.log_likelihood(2.0, 0.0, 0.0);
        assert_abs_diff_eq!(poisson.value, -1.0 - 2.0_f64.ln(), epsilon = 1e-10);
        assert_abs_diff_eq!(poisson.d_eta, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn sigmoid_and_softplus_are_stable_at_extremes() {
        assert_eq!(sigmoid(-800.0), 0.0);
        assert_eq!(sigmoid(800.0), 1.0);
        assert!(log1p_exp(800.0).is_finite());
        assert_abs_diff_eq!(log1p_exp(0.0), 2.0_f64.ln(), epsilon = 1e-15);
    }

    #[test]
    fn training_gradient_matches_finite_differences() {
        let population = small_population();
        let model = TrainingModel::new(&population).unwrap();
        let params = example_parameters();
        let latent = Array1::from_vec(vec![0.3, -0.7, 1.1, 0.05]);
        let theta = model.layout().pack(&params, latent.view());
        finite_difference_check(&model, &theta);
    }

    #[test]
    fn inference_gradient_matches_finite_differences() {
        let population = small_population();
        let params = example_parameters();
        let model = InferenceModel::new(&params, &population).unwrap();
        for i in 0..model.len() {
            let target = model.individual(i);
            finite_difference_check(&target, &Array1::from_vec(vec![0.4]));
        }
    }

    #[test]
    fn inference_mode_ignores_decisions() {
        let population = small_population();
        let params = example_parameters();
        let stripped = population.without_decision();
        let with = InferenceModel::new(&params, &population).unwrap();
        let without = InferenceModel::new(&params, &stripped).unwrap();
        for i in 0..population.len() {
            assert_eq!(with.individual(i), without.individual(i));
        }
    }

    #[test]
    fn training_mode_requires_decisions() {
        let population = small_population().without_decision();
        assert!(matches!(
            TrainingModel::new(&population),
            Err(ModelError::MissingDecision)
        ));
    }

    #[test]
    fn layout_round_trips_parameters() {
        let params = example_parameters();
        let layout = ParameterLayout::new(3, 2);
        let theta = layout.pack(&params, Array1::from_vec(vec![0.1, 0.2, 0.3]).view());
        let constrained = layout.constrain(theta.view());
        let rebuilt = layout.to_parameters(constrained.view(), &params.group_names);
        assert_abs_diff_eq!(rebuilt.sigma_g, params.sigma_g, epsilon = 1e-12);
        assert_eq!(rebuilt.features.len(), Feature::COUNT);
        assert_eq!(rebuilt.decision, params.decision);
        assert_eq!(layout.names(&params.group_names).len(), layout.dim());
        assert_eq!(layout.names(&params.group_names)[layout.dim() - 1], "sigma_g");
    }

    #[test]
    fn sign_reflection_preserves_the_training_density() {
        let population = small_population();
        let model = TrainingModel::new(&population).unwrap();
        let mut params = example_parameters();
        params.features[Feature::Grade.index()].eta_u = -0.6;
        let latent = Array1::from_vec(vec![0.3, -0.7, 1.1, 0.05]);
        let theta = model.layout().pack(&params, latent.view());
        let mut reflected = theta.clone();
        assert!(model.layout().reflect_sign(reflected.view_mut(), Feature::Grade));
        assert!(reflected[model.layout().feature_block(Feature::Grade) + 1] > 0.0);
        assert_abs_diff_eq!(reflected[0], -0.3, epsilon = 1e-15);

        let mut grad = Array1::zeros(model.dim());
        let before = model.log_density_and_gradient(theta.view(), grad.view_mut());
        let after = model.log_density_and_gradient(reflected.view(), grad.view_mut());
        assert_abs_diff_eq!(before, after, epsilon = 1e-9);
        assert!(!model.layout().reflect_sign(reflected.view_mut(), Feature::Grade));
    }

    #[test]
    fn validation_catches_bad_bundles() {
        let mut params = example_parameters();
        params.validate().unwrap();
        params.sigma_g = 0.0;
        assert!(params.validate().is_err());

        let mut params = example_parameters();
        params.features[3].eta_a.pop();
        assert!(params.validate().is_err());

        let mut params = example_parameters();
        params.features.swap(0, 1);
        assert!(params.validate().is_err());
    }

    #[test]
    fn parameters_round_trip_through_toml() {
        let params = example_parameters();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.toml");
        let path = path.to_str().unwrap();
        params.save(path).unwrap();
        let loaded = GlobalParameters::load(path).unwrap();
        assert_eq!(loaded, params);
    }
}
