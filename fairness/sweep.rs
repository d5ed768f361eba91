//! # Fairness Metric Sweep
//!
//! Binarizes decision probabilities over a grid of thresholds and tabulates,
//! per protected group, how many candidates would be hired. A prediction is
//! positive at threshold `c` iff `p >= c`.
//!
//! Ratios that would divide by zero are defined explicitly: equal counts
//! give exactly 1, and a vanishing denominator alone gives `+inf`.

use ndarray::ArrayView1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SweepError {
    #[error("Invalid threshold grid: {0}")]
    InvalidGrid(String),
    #[error("Invalid group sizes: {0}")]
    InvalidGroupSizes(String),
    #[error("Shape mismatch for {what}: expected {expected}, found {found}.")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Candidate {index} belongs to group {group}, but only {num_groups} groups exist.")]
    GroupOutOfRange {
        index: usize,
        group: usize,
        num_groups: usize,
    },
    #[error("Probability at position {index} is {value}, outside [0, 1].")]
    InvalidProbability { index: usize, value: f64 },
}

/// Inclusive threshold grid `start..=end` by `step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdGrid {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl Default for ThresholdGrid {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 1.0,
            step: 0.01,
        }
    }
}

impl ThresholdGrid {
    pub fn new(start: f64, end: f64, step: f64) -> Result<Self, SweepError> {
        let grid = Self { start, end, step };
        grid.validate()?;
        Ok(grid)
    }

    pub fn validate(&self) -> Result<(), SweepError> {
        if !(self.start.is_finite() && self.end.is_finite() && self.step.is_finite()) {
            return Err(SweepError::InvalidGrid(format!(
                "bounds and step must be finite, got {}..={} by {}",
                self.start, self.end, self.step
            )));
        }
        if self.step <= 0.0 {
            return Err(SweepError::InvalidGrid(format!(
                "step must be positive, got {}",
                self.step
            )));
        }
        if self.start > self.end {
            return Err(SweepError::InvalidGrid(format!(
                "start {} exceeds end {}",
                self.start, self.end
            )));
        }
        if (self.end - self.start) / self.step > 1e7 {
            return Err(SweepError::InvalidGrid(
                "grid has more than ten million thresholds".to_string(),
            ));
        }
        Ok(())
    }

    /// Threshold values, each computed from its index so rounding error
    /// never accumulates.
    pub fn values(&self) -> Vec<f64> {
        let count = ((self.end - self.start) / self.step + 1e-9).floor() as usize + 1;
        (0..count)
            .map(|i| (self.start + i as f64 * self.step).min(self.end))
            .collect()
    }
}

/// Population size of every group, used to normalize disparity ratios.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSizes(Vec<usize>);

impl GroupSizes {
    pub fn new(sizes: Vec<usize>) -> Result<Self, SweepError> {
        if sizes.len() < 2 {
            return Err(SweepError::InvalidGroupSizes(format!(
                "at least 2 groups are required, got {}",
                sizes.len()
            )));
        }
        Ok(Self(sizes))
    }

    /// Counts group memberships.
    pub fn from_membership(groups: &[usize], num_groups: usize) -> Result<Self, SweepError> {
        let mut sizes = vec![0; num_groups];
        for (index, &group) in groups.iter().enumerate() {
            *sizes
                .get_mut(group)
                .ok_or(SweepError::GroupOutOfRange {
                    index,
                    group,
                    num_groups,
                })? += 1;
        }
        Self::new(sizes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

/// One group's positives at one threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTally {
    pub positives: usize,
    /// Share of all positive decisions that went to this group, in percent.
    pub hire_pct: f64,
    /// Positives divided by the group's size.
    pub selection_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRow {
    pub threshold: f64,
    pub groups: Vec<GroupTally>,
    pub total_positives: usize,
    /// Positives as a percentage of all candidates.
    pub total_pct: f64,
    /// Disparity of each group `1..K` against group 0.
    pub disparity: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementRow {
    pub threshold: f64,
    /// Fraction of candidates whose binarized decision is the same in both
    /// scenarios.
    pub agreement_rate: f64,
    pub positives_a: usize,
    pub positives_b: usize,
    /// `positives_b / positives_a`, guarded.
    pub positive_ratio: f64,
}

/// `numerator / denominator`, except that equal operands give exactly 1
/// (including `0 / 0`) and a zero denominator alone gives `+inf`.
pub fn guarded_ratio(numerator: f64, denominator: f64) -> f64 {
    if numerator == denominator {
        1.0
    } else if denominator == 0.0 {
        f64::INFINITY
    } else {
        numerator / denominator
    }
}

/// Size-normalized selection ratio of group B against reference group A:
/// `(pos_b * |A|) / (pos_a * |B|)`. Exactly 1 whenever `pos_a == pos_b`.
pub fn disparity_ratio(pos_a: usize, size_a: usize, pos_b: usize, size_b: usize) -> f64 {
    if pos_a == pos_b {
        return 1.0;
    }
    guarded_ratio(
        pos_b as f64 * size_a as f64,
        pos_a as f64 * size_b as f64,
    )
}

/// Tabulates positives per group at every threshold of `grid`.
///
/// `groups[i]` is candidate `i`'s group; `sizes` supplies the normalizing
/// population sizes and fixes the number of groups.
pub fn fairness_sweep(
    probabilities: ArrayView1<f64>,
    groups: &[usize],
    sizes: &GroupSizes,
    grid: &ThresholdGrid,
) -> Result<Vec<SweepRow>, SweepError> {
    grid.validate()?;
    check_probabilities(probabilities)?;
    if groups.len() != probabilities.len() {
        return Err(SweepError::ShapeMismatch {
            what: "group memberships",
            expected: probabilities.len(),
            found: groups.len(),
        });
    }
    let num_groups = sizes.len();
    if let Some((index, &group)) = groups.iter().enumerate().find(|(_, g)| **g >= num_groups) {
        return Err(SweepError::GroupOutOfRange {
            index,
            group,
            num_groups,
        });
    }

    let n = probabilities.len();
    let sizes = sizes.as_slice();
    let rows = grid
        .values()
        .into_par_iter()
        .map(|threshold| {
            let mut positives = vec![0usize; num_groups];
            for (&p, &g) in probabilities.iter().zip(groups) {
                if p >= threshold {
                    positives[g] += 1;
                }
            }
            let total_positives: usize = positives.iter().sum();
            let tallies = positives
                .iter()
                .zip(sizes)
                .map(|(&pos, &size)| GroupTally {
                    positives: pos,
                    hire_pct: percent(pos, total_positives),
                    selection_rate: if size > 0 {
                        pos as f64 / size as f64
                    } else {
                        0.0
                    },
                })
                .collect();
            let disparity = (1..num_groups)
                .map(|b| disparity_ratio(positives[0], sizes[0], positives[b], sizes[b]))
                .collect();
            SweepRow {
                threshold,
                groups: tallies,
                total_positives,
                total_pct: percent(total_positives, n),
                disparity,
            }
        })
        .collect();
    Ok(rows)
}

/// Compares two scenarios' predictions for the same candidates at every
/// threshold of `grid`.
pub fn agreement_sweep(
    probabilities_a: ArrayView1<f64>,
    probabilities_b: ArrayView1<f64>,
    grid: &ThresholdGrid,
) -> Result<Vec<AgreementRow>, SweepError> {
    grid.validate()?;
    check_probabilities(probabilities_a)?;
    check_probabilities(probabilities_b)?;
    if probabilities_a.len() != probabilities_b.len() {
        return Err(SweepError::ShapeMismatch {
            what: "second scenario's predictions",
            expected: probabilities_a.len(),
            found: probabilities_b.len(),
        });
    }
    let n = probabilities_a.len();
    let rows = grid
        .values()
        .into_par_iter()
        .map(|threshold| {
            let mut same = 0usize;
            let mut positives_a = 0usize;
            let mut positives_b = 0usize;
            for (&pa, &pb) in probabilities_a.iter().zip(probabilities_b.iter()) {
                let (a, b) = (pa >= threshold, pb >= threshold);
                same += usize::from(a == b);
                positives_a += usize::from(a);
                positives_b += usize::from(b);
            }
            AgreementRow {
                threshold,
                agreement_rate: if n > 0 { same as f64 / n as f64 } else { 1.0 },
                positives_a,
                positives_b,
                positive_ratio: guarded_ratio(positives_b as f64, positives_a as f64),
            }
        })
        .collect();
    Ok(rows)
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}

fn check_probabilities(probabilities: ArrayView1<f64>) -> Result<(), SweepError> {
    match probabilities
        .iter()
        .enumerate()
        .find(|(_, p)| !(0.0..=1.0).contains(*p))
    {
        Some((index, &value)) => Err(SweepError::InvalidProbability { index, value }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;
    use proptest::prelude::*;

    #[test]
    fn constant_half_probabilities_split_evenly() {
        let probabilities = Array1::from_elem(10, 0.5);
        let groups = [0, 0, 0, 0, 0, 1, 1, 1, 1, 1];
        let sizes = GroupSizes::from_membership(&groups, 2).unwrap();
        let grid = ThresholdGrid::new(0.0, 1.0, 0.1).unwrap();
        let rows = fairness_sweep(probabilities.view(), &groups, &sizes, &grid).unwrap();
        assert_eq!(rows.len(), 11);

        let at_half = rows
            .iter()
            .find(|r| (r.threshold - 0.5).abs() < 1e-12)
            .unwrap();
        assert_eq!(at_half.total_positives, 10);
        assert_abs_diff_eq!(at_half.groups[0].hire_pct, 50.0);
        assert_abs_diff_eq!(at_half.groups[1].hire_pct, 50.0);
        assert_abs_diff_eq!(at_half.groups[0].selection_rate, 1.0);
        assert_eq!(at_half.disparity, vec![1.0]);

        // Above one half nobody is hired and the ratio stays defined.
        let last = rows.last().unwrap();
        assert_eq!(last.threshold, 1.0);
        assert_eq!(last.total_positives, 0);
        assert_eq!(last.groups[0].hire_pct, 0.0);
        assert_eq!(last.disparity, vec![1.0]);
    }

    #[test]
    fn grid_values_are_computed_by_index() {
        let grid = ThresholdGrid::new(0.0, 1.0, 0.01).unwrap();
        let values = grid.values();
        assert_eq!(values.len(), 101);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[100], 1.0);
        assert_abs_diff_eq!(values[30], 0.3, epsilon = 1e-15);
        assert!(ThresholdGrid::new(0.0, 1.0, 0.0).is_err());
        assert!(ThresholdGrid::new(1.0, 0.0, 0.1).is_err());
        assert_eq!(ThresholdGrid::new(0.5, 0.5, 0.1).unwrap().values(), vec![0.5]);
    }

    #[test]
    fn degenerate_ratios_are_defined() {
        assert_eq!(disparity_ratio(0, 10, 0, 30), 1.0);
        assert_eq!(disparity_ratio(4, 10, 4, 30), 1.0);
        assert_eq!(disparity_ratio(0, 10, 3, 30), f64::INFINITY);
        assert_abs_diff_eq!(disparity_ratio(2, 10, 3, 30), 0.5);
        assert_eq!(guarded_ratio(0.0, 0.0), 1.0);
        assert_eq!(guarded_ratio(0.0, 5.0), 0.0);
    }

    #[test]
    fn disparity_uses_the_supplied_sizes() {
        // Same memberships, different normalizing sizes.
        let probabilities = ndarray::array![0.9, 0.9, 0.9, 0.1];
        let groups = [0, 0, 1, 1];
        let grid = ThresholdGrid::new(0.5, 0.5, 0.1).unwrap();
        let even = GroupSizes::new(vec![2, 2]).unwrap();
        let skewed = GroupSizes::new(vec![2, 4]).unwrap();
        let a = fairness_sweep(probabilities.view(), &groups, &even, &grid).unwrap();
        let b = fairness_sweep(probabilities.view(), &groups, &skewed, &grid).unwrap();
        assert_abs_diff_eq!(a[0].disparity[0], 0.5);
        assert_abs_diff_eq!(b[0].disparity[0], 0.25);
    }

    #[test]
    fn rejects_inconsistent_inputs() {
        let probabilities = ndarray::array![0.2, 0.7];
        let grid = ThresholdGrid::default();
        let sizes = GroupSizes::new(vec![1, 1]).unwrap();
        assert!(matches!(
            fairness_sweep(probabilities.view(), &[0], &sizes, &grid),
            Err(SweepError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            fairness_sweep(probabilities.view(), &[0, 2], &sizes, &grid),
            Err(SweepError::GroupOutOfRange { index: 1, .. })
        ));
        let bad = ndarray::array![0.2, 1.5];
        assert!(matches!(
            fairness_sweep(bad.view(), &[0, 1], &sizes, &grid),
            Err(SweepError::InvalidProbability { index: 1, .. })
        ));
        assert!(GroupSizes::new(vec![3]).is_err());
    }

    #[test]
    fn agreement_compares_binarized_decisions() {
        let a = ndarray::array![0.1, 0.6, 0.8, 0.4];
        let b = ndarray::array![0.2, 0.4, 0.9, 0.45];
        let grid = ThresholdGrid::new(0.5, 0.5, 0.1).unwrap();
        let rows = agreement_sweep(a.view(), b.view(), &grid).unwrap();
        assert_abs_diff_eq!(rows[0].agreement_rate, 0.75);
        assert_eq!(rows[0].positives_a, 2);
        assert_eq!(rows[0].positives_b, 1);
        assert_abs_diff_eq!(rows[0].positive_ratio, 0.5);
    }

    proptest! {
        #[test]
        fn raising_the_threshold_never_adds_positives(
            probabilities in prop::collection::vec(0.0f64..=1.0, 1..60),
            seed in any::<u64>(),
        ) {
            let groups: Vec<usize> = (0..probabilities.len())
                .map(|i| ((seed >> (i % 64)) & 1) as usize)
                .collect();
            let sizes = GroupSizes::new(vec![
                groups.iter().filter(|&&g| g == 0).count(),
                groups.iter().filter(|&&g| g == 1).count(),
            ]).unwrap();
            let p = Array1::from(probabilities);
            let grid = ThresholdGrid::new(0.0, 1.0, 0.05).unwrap();
            let rows = fairness_sweep(p.view(), &groups, &sizes, &grid).unwrap();
            for pair in rows.windows(2) {
                prop_assert!(pair[1].total_positives <= pair[0].total_positives);
                for g in 0..2 {
                    prop_assert!(pair[1].groups[g].positives <= pair[0].groups[g].positives);
                }
            }
        }

        #[test]
        fn equal_counts_give_unit_disparity(
            positives in 0usize..1000,
            size_a in 1usize..5000,
            size_b in 1usize..5000,
        ) {
            prop_assert_eq!(disparity_ratio(positives, size_a, positives, size_b), 1.0);
        }

        #[test]
        fn identical_predictions_always_agree(
            probabilities in prop::collection::vec(0.0f64..=1.0, 1..60),
        ) {
            let p = Array1::from(probabilities);
            let rows = agreement_sweep(p.view(), p.view(), &ThresholdGrid::default()).unwrap();
            for row in rows {
                prop_assert_eq!(row.agreement_rate, 1.0);
                prop_assert_eq!(row.positive_ratio, 1.0);
            }
        }
    }
}
