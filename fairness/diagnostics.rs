//! Convergence diagnostics for multi-chain MCMC output
//!
//! Rank-normalized split R-hat, bulk and tail effective sample size
//! (Vehtari, Gelman, Simpson, Carpenter & Bürkner, 2021). mini-mcmc's
//! `RunStats` only carries run-wide R-hat and ESS, so the per-parameter,
//! rank-normalized values are computed here. Every function takes draws as
//! one `Vec<f64>` per chain, in iteration order.
//!
//! A parameter whose draws are constant has no defined R-hat or ESS; those
//! functions return `NaN` for it and callers treat `NaN` as "not estimable".

use crate::hmc::NutsResult;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf_inv;
use std::f64::consts::SQRT_2;

// =============================================================================
// Thresholds and summary records
// =============================================================================

/// Limits a fit must satisfy to be called reliable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub max_rhat: f64,
    pub min_ess_bulk: f64,
    pub min_ess_tail: f64,
    pub max_divergences: usize,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            max_rhat: 1.01,
            min_ess_bulk: 400.0,
            min_ess_tail: 400.0,
            max_divergences: 0,
        }
    }
}

/// Posterior summary of one scalar parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub q5: f64,
    pub q50: f64,
    pub q95: f64,
    pub rhat: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
}

impl ParameterSummary {
    pub fn from_chains(name: impl Into<String>, chains: &[Vec<f64>]) -> Self {
        let pooled: Vec<f64> = chains.iter().flatten().copied().collect();
        let mean = mean(&pooled);
        let sd = sample_variance(&pooled, mean).sqrt();
        let mut sorted = pooled;
        sorted.sort_by(f64::total_cmp);
        Self {
            name: name.into(),
            mean,
            sd,
            q5: quantile_sorted(&sorted, 0.05),
            q50: quantile_sorted(&sorted, 0.5),
            q95: quantile_sorted(&sorted, 0.95),
            rhat: split_rhat(chains),
            ess_bulk: ess_bulk(chains),
            ess_tail: ess_tail(chains),
        }
    }
}

/// Summarizes every parameter of a sampler run. `transform` maps each
/// draw column to the reported scale before summarizing.
pub fn summarize_result<F>(
    result: &NutsResult,
    names: &[String],
    include_warmup: bool,
    transform: F,
) -> Vec<ParameterSummary>
where
    F: Fn(usize, f64) -> f64 + Sync,
{
    names
        .par_iter()
        .enumerate()
        .map(|(j, name)| {
            let chains: Vec<Vec<f64>> = result
                .parameter_chains(j, include_warmup)
                .into_iter()
                .map(|chain| chain.into_iter().map(|x| transform(j, x)).collect())
                .collect();
            ParameterSummary::from_chains(name.clone(), &chains)
        })
        .collect()
}

/// Whole-fit verdict against [`QualityThresholds`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitQuality {
    pub divergences: usize,
    pub total_draws: usize,
    pub max_rhat: f64,
    pub min_ess_bulk: f64,
    pub min_ess_tail: f64,
    /// Parameters whose R-hat or ESS could not be computed.
    pub not_estimable: Vec<String>,
    pub reliable: bool,
    pub problems: Vec<String>,
}

impl FitQuality {
    pub fn assess(
        summaries: &[ParameterSummary],
        result: &NutsResult,
        thresholds: &QualityThresholds,
    ) -> Self {
        let finite = |x: &f64| x.is_finite();
        let max_rhat = summaries
            .iter()
            .map(|s| s.rhat)
            .filter(finite)
            .fold(f64::NAN, f64::max);
        let min_ess_bulk = summaries
            .iter()
            .map(|s| s.ess_bulk)
            .filter(finite)
            .fold(f64::NAN, f64::min);
        let min_ess_tail = summaries
            .iter()
            .map(|s| s.ess_tail)
            .filter(finite)
            .fold(f64::NAN, f64::min);
        let not_estimable: Vec<String> = summaries
            .iter()
            .filter(|s| !(s.rhat.is_finite() && s.ess_bulk.is_finite()))
            .map(|s| s.name.clone())
            .collect();
        let divergences = result.divergences();
        let total_draws = result.chains.iter().map(|c| c.draws.nrows()).sum();

        let mut problems = Vec::new();
        if divergences > thresholds.max_divergences {
            problems.push(format!(
                "{divergences} divergent transition(s) after warmup (allowed: {})",
                thresholds.max_divergences
            ));
        }
        if max_rhat > thresholds.max_rhat {
            problems.push(format!(
                "max R-hat {max_rhat:.4} exceeds {}",
                thresholds.max_rhat
            ));
        }
        if min_ess_bulk < thresholds.min_ess_bulk {
            problems.push(format!(
                "min bulk ESS {min_ess_bulk:.1} below {}",
                thresholds.min_ess_bulk
            ));
        }
        if min_ess_tail < thresholds.min_ess_tail {
            problems.push(format!(
                "min tail ESS {min_ess_tail:.1} below {}",
                thresholds.min_ess_tail
            ));
        }
        if !not_estimable.is_empty() {
            problems.push(format!(
                "{} parameter(s) with constant draws: {}",
                not_estimable.len(),
                not_estimable.join(", ")
            ));
        }

        Self {
            divergences,
            total_draws,
            max_rhat,
            min_ess_bulk,
            min_ess_tail,
            not_estimable,
            reliable: problems.is_empty(),
            problems,
        }
    }
}

// =============================================================================
// R-hat
// =============================================================================

/// Rank-normalized split R-hat: the larger of the bulk and folded values.
pub fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    if split.len() < 2 || split[0].len() < 2 {
        return f64::NAN;
    }
    let bulk = basic_rhat(&rank_normalize(&split));
    let median = {
        let mut pooled: Vec<f64> = split.iter().flatten().copied().collect();
        pooled.sort_by(f64::total_cmp);
        quantile_sorted(&pooled, 0.5)
    };
    let folded: Vec<Vec<f64>> = split
        .iter()
        .map(|c| c.iter().map(|x| (x - median).abs()).collect())
        .collect();
    let tail = basic_rhat(&rank_normalize(&folded));
    if bulk.is_nan() || tail.is_nan() {
        return f64::NAN;
    }
    bulk.max(tail)
}

fn basic_rhat(chains: &[Vec<f64>]) -> f64 {
    let n = chains[0].len() as f64;
    let means: Vec<f64> = chains.iter().map(|c| mean(c)).collect();
    let within = chains
        .iter()
        .zip(&means)
        .map(|(c, &m)| sample_variance(c, m))
        .sum::<f64>()
        / chains.len() as f64;
    let between_over_n = sample_variance(&means, mean(&means));
    if !(within > 0.0) {
        return f64::NAN;
    }
    let var_plus = (n - 1.0) / n * within + between_over_n;
    (var_plus / within).sqrt()
}

// =============================================================================
// Effective sample size
// =============================================================================

/// Bulk ESS: ESS of the rank-normalized split chains.
pub fn ess_bulk(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    if split.is_empty() || split[0].len() < 4 {
        return f64::NAN;
    }
    basic_ess(&rank_normalize(&split))
}

/// Tail ESS: the smaller ESS of the 5% and 95% quantile indicators.
pub fn ess_tail(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    if split.is_empty() || split[0].len() < 4 {
        return f64::NAN;
    }
    let mut pooled: Vec<f64> = split.iter().flatten().copied().collect();
    pooled.sort_by(f64::total_cmp);
    let indicator = |q: f64| -> Vec<Vec<f64>> {
        split
            .iter()
            .map(|c| c.iter().map(|&x| if x <= q { 1.0 } else { 0.0 }).collect())
            .collect()
    };
    let lower = basic_ess(&indicator(quantile_sorted(&pooled, 0.05)));
    let upper = basic_ess(&indicator(quantile_sorted(&pooled, 0.95)));
    if lower.is_nan() || upper.is_nan() {
        return f64::NAN;
    }
    lower.min(upper)
}

/// Multi-chain ESS with Geyer's initial monotone sequence, following Stan.
/// Autocovariances are evaluated lazily since the sequence usually
/// truncates after a few lags.
fn basic_ess(chains: &[Vec<f64>]) -> f64 {
    let m = chains.len();
    let n = chains[0].len();
    let means: Vec<f64> = chains.iter().map(|c| mean(c)).collect();
    let acov = |lag: usize| -> f64 {
        chains
            .iter()
            .zip(&means)
            .map(|(c, &mu)| {
                (0..n - lag)
                    .map(|t| (c[t] - mu) * (c[t + lag] - mu))
                    .sum::<f64>()
                    / n as f64
            })
            .sum::<f64>()
            / m as f64
    };

    let nf = n as f64;
    let acov0 = acov(0);
    let mean_var = acov0 * nf / (nf - 1.0);
    let mut var_plus = mean_var * (nf - 1.0) / nf;
    if m > 1 {
        var_plus += sample_variance(&means, mean(&means));
    }
    if !(var_plus > 0.0) || !(mean_var > 0.0) {
        return f64::NAN;
    }
    let rho = |lag: usize| 1.0 - (mean_var - acov(lag)) / var_plus;

    let mut rho_hat = vec![0.0; n + 2];
    rho_hat[0] = 1.0;
    let mut rho_even = 1.0;
    let mut rho_odd = rho(1);
    rho_hat[1] = rho_odd;
    let mut s = 1;
    while s + 4 < n && rho_even + rho_odd > 0.0 {
        rho_even = rho(s + 1);
        rho_odd = rho(s + 2);
        if rho_even + rho_odd >= 0.0 {
            rho_hat[s + 1] = rho_even;
            rho_hat[s + 2] = rho_odd;
        }
        s += 2;
    }
    let max_s = s;
    if rho_hat[max_s] > 0.0 {
        rho_hat[max_s + 1] = rho_hat[max_s];
    }
    let mut s = 1;
    while s + 3 <= max_s {
        let pair = rho_hat[s - 1] + rho_hat[s];
        if rho_hat[s + 1] + rho_hat[s + 2] > pair {
            rho_hat[s + 1] = pair / 2.0;
            rho_hat[s + 2] = pair / 2.0;
        }
        s += 2;
    }

    let total = (m * n) as f64;
    let tau = -1.0 + 2.0 * rho_hat[..max_s].iter().sum::<f64>() + rho_hat[max_s + 1];
    let tau = tau.max(1.0 / total.log10());
    total / tau
}

// =============================================================================
// Helpers
// =============================================================================

/// Splits every chain into halves, dropping the middle draw of odd chains.
fn split_chains(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let min_len = chains.iter().map(Vec::len).min().unwrap_or(0);
    let half = min_len / 2;
    if half == 0 {
        return Vec::new();
    }
    chains
        .iter()
        .flat_map(|c| {
            let c = &c[..min_len];
            [c[..half].to_vec(), c[min_len - half..].to_vec()]
        })
        .collect()
}

/// Replaces pooled draws by normal scores of their average ranks.
fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let pooled: Vec<f64> = chains.iter().flatten().copied().collect();
    let ranks = average_ranks(&pooled);
    let total = pooled.len() as f64;
    let mut scores = ranks
        .into_iter()
        .map(|r| normal_quantile((r - 0.375) / (total + 0.25)));
    chains
        .iter()
        .map(|c| scores.by_ref().take(c.len()).collect())
        .collect()
}

/// 1-based ranks with ties sharing their average rank.
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let rank = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }
    ranks
}

/// Standard normal quantile function.
pub fn normal_quantile(p: f64) -> f64 {
    SQRT_2 * erf_inv(2.0 * p - 1.0)
}

/// Linear-interpolation quantile of sorted values.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * q.clamp(0.0, 1.0);
            let lo = h.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn iid_chains(seed: u64, m: usize, n: usize, shift: &[f64]) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..m)
            .map(|c| {
                (0..n)
                    .map(|_| rng.sample::<f64, _>(StandardNormal) + shift[c])
                    .collect()
            })
            .collect()
    }

    fn ar1_chains(seed: u64, m: usize, n: usize, phi: f64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..m)
            .map(|_| {
                let mut x = 0.0;
                (0..n)
                    .map(|_| {
                        let e: f64 = rng.sample(StandardNormal);
                        x = phi * x + (1.0 - phi * phi).sqrt() * e;
                        x
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn rhat_is_near_one_for_mixed_chains() {
        let chains = iid_chains(1, 4, 500, &[0.0; 4]);
        let rhat = split_rhat(&chains);
        assert!(rhat < 1.01, "rhat = {rhat}");
        assert!(rhat > 0.99, "rhat = {rhat}");
    }

    #[test]
    fn rhat_flags_a_stuck_chain() {
        let chains = iid_chains(2, 4, 500, &[0.0, 0.0, 0.0, 3.0]);
        assert!(split_rhat(&chains) > 1.1);
    }

    #[test]
    fn rhat_flags_a_trending_chain() {
        // Within-chain drift is only visible after splitting.
        let chains: Vec<Vec<f64>> = (0..2)
            .map(|_| (0..400).map(|t| t as f64 / 100.0).collect())
            .collect();
        assert!(split_rhat(&chains) > 1.5);
    }

    #[test]
    fn ess_is_near_draw_count_for_independent_draws() {
        let chains = iid_chains(3, 4, 500, &[0.0; 4]);
        let bulk = ess_bulk(&chains);
        let tail = ess_tail(&chains);
        assert!(bulk > 1400.0 && bulk < 2800.0, "bulk = {bulk}");
        assert!(tail > 1000.0 && tail < 2800.0, "tail = {tail}");
    }

    #[test]
    fn ess_shrinks_with_autocorrelation() {
        let chains = ar1_chains(4, 4, 500, 0.9);
        let bulk = ess_bulk(&chains);
        assert!(bulk < 400.0, "bulk = {bulk}");
        assert!(bulk > 30.0, "bulk = {bulk}");
    }

    #[test]
    fn constant_draws_are_not_estimable() {
        let chains = vec![vec![1.5; 100], vec![1.5; 100]];
        assert!(split_rhat(&chains).is_nan());
        assert!(ess_bulk(&chains).is_nan());
        assert!(ess_tail(&chains).is_nan());
        let summary = ParameterSummary::from_chains("c", &chains);
        assert_eq!(summary.mean, 1.5);
        assert_eq!(summary.sd, 0.0);
    }

    #[test]
    fn ranks_average_ties() {
        assert_eq!(
            average_ranks(&[3.0, 1.0, 3.0, 2.0]),
            vec![3.5, 1.0, 3.5, 2.0]
        );
    }

    #[test]
    fn quantiles_interpolate() {
        let sorted = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.5), 2.0);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.05), 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(normal_quantile(0.975), 1.959964, epsilon = 1e-5);
        assert_abs_diff_eq!(normal_quantile(0.5), 0.0, epsilon = 1e-12);
    }
}
