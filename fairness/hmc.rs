//! NUTS Sampler using mini-mcmc
//!
//! Anything implementing [`LogDensity`] (dimension, log density and analytic
//! gradient) can be sampled. The sampler knows nothing about the model it is
//! sampling.
//!
//! # Design
//!
//! The density is presented to mini-mcmc as a `GradientTarget` whose
//! `unnorm_logp_and_grad` is overridden with the analytic gradient, so burn's
//! autodiff graph is never built. mini-mcmc's NUTS adapts the step size by
//! dual averaging over the warmup iterations and discards them.
//!
//! # Reproducibility
//!
//! Every chain is its own single-chain `NUTS` seeded from `(seed, chain
//! index)`. Chains run on the rayon pool and are collected in chain order, so
//! the same configuration always yields bitwise-identical draws.
//!
//! # Divergences
//!
//! mini-mcmc reports neither energies nor divergent trajectories, so each
//! chain's target logs every density evaluation. An evaluation diverged when
//! its log density or gradient is non-finite, or when its log density lies
//! more than [`MAX_ENERGY_ERROR`] below the best value the chain has reached.
//! Afterwards every evaluation is charged to the transition whose draw is
//! evaluated next; a transition with a divergent evaluation is marked
//! divergent on its [`Transition`] and is never retried.
//!
//! # Warmup Draws
//!
//! mini-mcmc does not return the iterations it adapts on. With `save_warmup`,
//! each chain first runs an `n_warmup` leg whose draws are kept, then adapts
//! and samples starting where that leg ended.

use crate::progress::SamplingProgress;
use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::tensor::TensorData;
use mini_mcmc::distributions::GradientTarget;
use mini_mcmc::nuts::NUTS;
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Backend type for NUTS - uses f64 for numerical precision
pub type NutsBackend = Autodiff<NdArray<f64>>;

/// Log density drop beyond which an evaluation is declared divergent.
pub const MAX_ENERGY_ERROR: f64 = 1000.0;

/// Random initialization attempts before giving up on a chain.
const MAX_INIT_ATTEMPTS: usize = 100;

/// A differentiable, unnormalized log density on an unconstrained space.
pub trait LogDensity: Sync {
    fn dim(&self) -> usize;

    /// Returns the log density at `theta` and writes its gradient into `grad`.
    fn log_density_and_gradient(&self, theta: ArrayView1<f64>, grad: ArrayViewMut1<f64>) -> f64;
}

/// How each chain picks its starting point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitStrategy {
    /// Uniform on `[-radius, radius]` in every coordinate.
    Random { radius: f64 },
    /// Every coordinate set to `value`.
    Fixed { value: f64 },
}

impl Default for InitStrategy {
    fn default() -> Self {
        InitStrategy::Random { radius: 2.0 }
    }
}

/// Configuration for NUTS sampling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutsConfig {
    /// Number of parallel chains (at least 2)
    pub n_chains: usize,
    /// Number of warmup iterations to discard
    pub n_warmup: usize,
    /// Number of samples to collect (after warmup)
    pub n_samples: usize,
    /// Seed shared by the whole run
    pub seed: u64,
    pub init: InitStrategy,
    /// Target acceptance probability (0.6-0.9 recommended)
    pub target_accept: f64,
    /// Keep warmup draws, e.g. to diagnose early mixing
    pub save_warmup: bool,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            n_chains: 4,
            n_warmup: 1000,
            n_samples: 1000,
            seed: 2017,
            init: InitStrategy::default(),
            target_accept: 0.8,
            save_warmup: false,
        }
    }
}

impl NutsConfig {
    pub fn validate(&self) -> Result<(), SamplerError> {
        if self.n_chains < 2 {
            return Err(SamplerError::InvalidConfig(format!(
                "at least 2 chains are required for convergence diagnostics, got {}",
                self.n_chains
            )));
        }
        if self.n_samples == 0 {
            return Err(SamplerError::InvalidConfig(
                "n_samples must be at least 1".to_string(),
            ));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(SamplerError::InvalidConfig(format!(
                "target_accept must lie in (0, 1), got {}",
                self.target_accept
            )));
        }
        match self.init {
            InitStrategy::Random { radius } if !(radius.is_finite() && radius > 0.0) => {
                Err(SamplerError::InvalidConfig(format!(
                    "random init radius must be positive and finite, got {radius}"
                )))
            }
            InitStrategy::Fixed { value } if !value.is_finite() => Err(
                SamplerError::InvalidConfig(format!("fixed init value must be finite, got {value}")),
            ),
            _ => Ok(()),
        }
    }

    /// Iterations one chain reports to a progress observer.
    pub fn iterations_per_chain(&self) -> usize {
        let warmup_legs = if self.save_warmup { 2 } else { 1 };
        warmup_legs * self.n_warmup + self.n_samples
    }
}

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Invalid sampler configuration: {0}")]
    InvalidConfig(String),
    #[error("The target density has zero dimensions.")]
    ZeroDimension,
    #[error(
        "Chain {chain} found no starting point with a finite log density and gradient after {attempts} attempt(s)."
    )]
    InitializationFailed { chain: usize, attempts: usize },
    #[error("Chain {chain} returned draws that could not be read back: {message}")]
    Backend { chain: usize, message: String },
}

/// Per-iteration sampler statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub warmup: bool,
    /// Log density at the draw this transition produced.
    pub log_density: f64,
    /// Density evaluations charged to this transition.
    pub evaluations: usize,
    pub divergent: bool,
}

/// Everything one chain produced.
#[derive(Clone, Debug)]
pub struct ChainOutput {
    pub chain: usize,
    /// Present only when `save_warmup` was set: shape (n_warmup, dim).
    pub warmup_draws: Option<Array2<f64>>,
    /// Retained draws: shape (n_samples, dim).
    pub draws: Array2<f64>,
    /// One entry per returned draw, kept warmup draws first.
    pub transitions: Vec<Transition>,
    /// Divergent evaluations during the iterations mini-mcmc adapted on and
    /// discarded.
    pub adaptation_divergences: usize,
}

impl ChainOutput {
    /// Divergent transitions after warmup.
    pub fn divergences(&self) -> usize {
        self.transitions
            .iter()
            .filter(|t| !t.warmup && t.divergent)
            .count()
    }

    /// Indices of the retained draws whose transition diverged.
    pub fn divergent_iterations(&self) -> Vec<usize> {
        self.transitions
            .iter()
            .filter(|t| !t.warmup)
            .enumerate()
            .filter(|(_, t)| t.divergent)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Result of NUTS sampling: all chains, in chain order.
#[derive(Clone, Debug)]
pub struct NutsResult {
    pub chains: Vec<ChainOutput>,
}

impl NutsResult {
    pub fn dim(&self) -> usize {
        self.chains.first().map_or(0, |c| c.draws.ncols())
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    /// Total post-warmup divergences across chains.
    pub fn divergences(&self) -> usize {
        self.chains.iter().map(ChainOutput::divergences).sum()
    }

    /// Divergent retained iterations, one list per chain.
    pub fn divergent_iterations(&self) -> Vec<Vec<usize>> {
        self.chains
            .iter()
            .map(ChainOutput::divergent_iterations)
            .collect()
    }

    /// Whether every chain kept its warmup draws.
    pub fn has_warmup(&self) -> bool {
        !self.chains.is_empty() && self.chains.iter().all(|c| c.warmup_draws.is_some())
    }

    /// Draws of parameter `j`, one vector per chain. Warmup draws come first
    /// when requested and available.
    pub fn parameter_chains(&self, j: usize, include_warmup: bool) -> Vec<Vec<f64>> {
        self.chains
            .iter()
            .map(|chain| {
                let mut values = Vec::new();
                if include_warmup {
                    if let Some(warmup) = &chain.warmup_draws {
                        values.extend(warmup.column(j).iter().copied());
                    }
                }
                values.extend(chain.draws.column(j).iter().copied());
                values
            })
            .collect()
    }

    /// Posterior mean of every parameter over the retained draws of all chains.
    pub fn posterior_mean(&self) -> Array1<f64> {
        let mut sum = Array1::<f64>::zeros(self.dim());
        let mut count = 0usize;
        for chain in &self.chains {
            for row in chain.draws.rows() {
                sum += &row;
                count += 1;
            }
        }
        if count > 0 {
            sum /= count as f64;
        }
        sum
    }

    /// Rewrites every stored draw (warmup included) in place.
    pub fn map_draws<F>(&mut self, f: F)
    where
        F: Fn(ArrayViewMut1<f64>),
    {
        for chain in &mut self.chains {
            if let Some(warmup) = chain.warmup_draws.as_mut() {
                for row in warmup.rows_mut() {
                    f(row);
                }
            }
            for row in chain.draws.rows_mut() {
                f(row);
            }
        }
    }
}

/// One density evaluation seen by a chain.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Evaluation {
    log_density: f64,
    /// Log density and every gradient component are finite.
    finite: bool,
}

/// A [`LogDensity`] as mini-mcmc sees it, logging every evaluation.
///
/// mini-mcmc clones the target; clones share one evaluation log.
struct ChainTarget<'a, T> {
    density: &'a T,
    evaluations: Arc<Mutex<Vec<Evaluation>>>,
}

impl<T> Clone for ChainTarget<'_, T> {
    fn clone(&self) -> Self {
        Self {
            density: self.density,
            evaluations: Arc::clone(&self.evaluations),
        }
    }
}

impl<'a, T: LogDensity> ChainTarget<'a, T> {
    fn new(density: &'a T) -> Self {
        Self {
            density,
            evaluations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Non-finite evaluations are handed to mini-mcmc as `-inf` with a zero
    /// gradient so the trajectory is rejected instead of poisoned.
    fn evaluate(&self, position: Tensor<NutsBackend, 1>) -> (f64, Array1<f64>) {
        let dim = self.density.dim();
        let mut grad = Array1::<f64>::zeros(dim);
        let log_density = match position.into_data().to_vec::<f64>() {
            Ok(theta) if theta.len() == dim => self
                .density
                .log_density_and_gradient(ArrayView1::from(theta.as_slice()), grad.view_mut()),
            _ => f64::NAN,
        };
        let finite = log_density.is_finite() && grad.iter().all(|g| g.is_finite());
        if let Ok(mut log) = self.evaluations.lock() {
            log.push(Evaluation {
                log_density,
                finite,
            });
        }
        if finite {
            (log_density, grad)
        } else {
            (f64::NEG_INFINITY, Array1::zeros(dim))
        }
    }

    fn take_evaluations(&self) -> Vec<Evaluation> {
        self.evaluations
            .lock()
            .map(|mut log| std::mem::take(&mut *log))
            .unwrap_or_default()
    }
}

impl<T: LogDensity> GradientTarget<f64, NutsBackend> for ChainTarget<'_, T> {
    fn unnorm_logp(&self, position: Tensor<NutsBackend, 1>) -> Tensor<NutsBackend, 1> {
        let device = position.device();
        let (log_density, _) = self.evaluate(position);
        Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![log_density], [1]), &device)
    }

    fn unnorm_logp_and_grad(
        &self,
        position: Tensor<NutsBackend, 1>,
    ) -> (Tensor<NutsBackend, 1>, Tensor<NutsBackend, 1>) {
        let device = position.device();
        let (log_density, grad) = self.evaluate(position);
        let dim = grad.len();
        let logp_tensor =
            Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![log_density], [1]), &device);
        let grad_tensor =
            Tensor::<NutsBackend, 1>::from_data(TensorData::new(grad.to_vec(), [dim]), &device);
        (logp_tensor, grad_tensor)
    }
}

/// Runs NUTS on `target` with one rayon task per chain.
pub fn run_nuts_sampling<T: LogDensity>(
    target: &T,
    config: &NutsConfig,
    progress: &dyn SamplingProgress,
) -> Result<NutsResult, SamplerError> {
    config.validate()?;
    if target.dim() == 0 {
        return Err(SamplerError::ZeroDimension);
    }

    let chains = (0..config.n_chains)
        .into_par_iter()
        .map(|chain| {
            let output = run_chain(target, config, chain);
            progress.on_advance(config.iterations_per_chain() as u64);
            output
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NutsResult { chains })
}

fn chain_seed(seed: u64, chain: usize) -> u64 {
    seed ^ (chain as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn run_chain<T: LogDensity>(
    target: &T,
    config: &NutsConfig,
    chain: usize,
) -> Result<ChainOutput, SamplerError> {
    let dim = target.dim();
    let seed = chain_seed(config.seed, chain);
    let mut rng = StdRng::seed_from_u64(seed);
    let init = initialize(target, &config.init, &mut rng, chain)?;

    let chain_target = ChainTarget::new(target);
    let mut sampler = NUTS::<f64, NutsBackend, ChainTarget<'_, T>>::new(
        chain_target.clone(),
        vec![init.to_vec()],
        config.target_accept,
    )
    .set_seed(seed);

    let mut transitions = Vec::with_capacity(config.n_warmup + config.n_samples);
    let mut warmup_draws = None;
    if config.save_warmup && config.n_warmup > 0 {
        let draws = read_draws(sampler.run(config.n_warmup, 0), dim, chain)?;
        let attributed = attribute_evaluations(
            &draw_log_densities(target, &draws),
            &chain_target.take_evaluations(),
            false,
        );
        transitions.extend(attributed.transitions.into_iter().map(|t| Transition {
            warmup: true,
            ..t
        }));
        warmup_draws = Some(draws);
    }

    let draws = read_draws(sampler.run(config.n_samples, config.n_warmup), dim, chain)?;
    let attributed = attribute_evaluations(
        &draw_log_densities(target, &draws),
        &chain_target.take_evaluations(),
        config.n_warmup > 0,
    );
    transitions.extend(attributed.transitions);

    let output = ChainOutput {
        chain,
        warmup_draws,
        draws,
        transitions,
        adaptation_divergences: attributed.leading_divergences,
    };
    let divergences = output.divergences();
    if divergences > 0 {
        log::warn!(
            "Chain {chain}: {divergences} divergent transition(s) after warmup at iteration(s) {:?}; posterior summaries may be unreliable",
            output.divergent_iterations()
        );
    }
    log::debug!(
        "Chain {chain}: finished, {} divergent evaluation(s) during adaptation",
        output.adaptation_divergences
    );
    Ok(output)
}

/// Converts mini-mcmc's `[chains, draws, dim]` output of a single chain.
fn read_draws(
    sample: Tensor<NutsBackend, 3>,
    dim: usize,
    chain: usize,
) -> Result<Array2<f64>, SamplerError> {
    let [_, rows, _] = sample.dims();
    let values = sample
        .into_data()
        .to_vec::<f64>()
        .map_err(|e| SamplerError::Backend {
            chain,
            message: format!("{e:?}"),
        })?;
    Array2::from_shape_vec((rows, dim), values).map_err(|e| SamplerError::Backend {
        chain,
        message: e.to_string(),
    })
}

fn draw_log_densities<T: LogDensity>(target: &T, draws: &Array2<f64>) -> Vec<f64> {
    let mut grad = Array1::<f64>::zeros(draws.ncols());
    draws
        .rows()
        .into_iter()
        .map(|row| target.log_density_and_gradient(row, grad.view_mut()))
        .collect()
}

struct Attribution {
    transitions: Vec<Transition>,
    /// Divergent evaluations before the first returned draw's, when that
    /// stretch belongs to discarded iterations.
    leading_divergences: usize,
}

/// Charges every evaluation of one `run` call to the transition whose draw
/// is evaluated next, matching draws to evaluations by their exact log
/// density. A draw with no match after the cursor (a rejected proposal that
/// was not re-evaluated) gets no evaluations of its own.
///
/// With `discarded`, everything up to the first draw's evaluation belongs to
/// the adaptation iterations and is only counted.
fn attribute_evaluations(
    draw_log_densities: &[f64],
    evaluations: &[Evaluation],
    discarded: bool,
) -> Attribution {
    let mut best = f64::NEG_INFINITY;
    let mut divergent_in = |span: &[Evaluation]| -> usize {
        let mut count = 0;
        for e in span {
            if !e.finite || e.log_density < best - MAX_ENERGY_ERROR {
                count += 1;
            } else {
                best = best.max(e.log_density);
            }
        }
        count
    };

    let mut cursor = 0;
    let mut leading_divergences = 0;
    let mut transitions = Vec::with_capacity(draw_log_densities.len());
    for (t, &log_density) in draw_log_densities.iter().enumerate() {
        let end = evaluations[cursor..]
            .iter()
            .position(|e| e.log_density == log_density)
            .map_or(cursor, |k| cursor + k + 1);
        let span = &evaluations[cursor..end];
        cursor = end;

        let (charged, divergent) = if t == 0 && discarded {
            leading_divergences = divergent_in(span);
            (0, false)
        } else {
            (span.len(), divergent_in(span) > 0)
        };
        transitions.push(Transition {
            warmup: false,
            log_density,
            evaluations: charged,
            divergent,
        });
    }
    Attribution {
        transitions,
        leading_divergences,
    }
}

fn initialize<T: LogDensity>(
    target: &T,
    init: &InitStrategy,
    rng: &mut StdRng,
    chain: usize,
) -> Result<Array1<f64>, SamplerError> {
    let dim = target.dim();
    let attempts = match init {
        InitStrategy::Random { .. } => MAX_INIT_ATTEMPTS,
        InitStrategy::Fixed { .. } => 1,
    };
    let mut grad = Array1::<f64>::zeros(dim);
    for _ in 0..attempts {
        let theta = match *init {
            InitStrategy::Random { radius } => {
                Array1::from_shape_fn(dim, |_| rng.gen_range(-radius..radius))
            }
            InitStrategy::Fixed { value } => Array1::from_elem(dim, value),
        };
        let log_density = target.log_density_and_gradient(theta.view(), grad.view_mut());
        if log_density.is_finite() && grad.iter().all(|g| g.is_finite()) {
            return Ok(theta);
        }
    }
    Err(SamplerError::InitializationFailed { chain, attempts })
}
