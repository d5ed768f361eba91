//! # Observation Store
//!
//! The exclusive entry point for candidate data. Tabular files are read with
//! `polars`, checked against a strict schema and turned into a validated,
//! column-oriented [`Population`] for the statistical core.
//!
//! - Strict Schema: feature column names are fixed (`grade`, `debate`, ...).
//!   Protected-attribute columns are every column whose name starts with
//!   `a_`, in header order; the suffix becomes the group name.
//! - Fail Fast: a `Population` can only be built through validation, so a
//!   non-one-hot protected row, a negative count or a non-binary flag is
//!   rejected before any inference begins.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use polars::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Prefix marking one-hot protected-attribute columns in input files.
pub const PROTECTED_PREFIX: &str = "a_";

/// Name of the decision column in input files.
pub const DECISION_COLUMN: &str = "decision";

/// Measurement type of an observed feature. Drives validation here and the
/// likelihood family in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Continuous,
    Binary,
    Count,
}

/// The eight observed, non-decision features of a candidate, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Grade,
    Debate,
    Programming,
    Internat,
    Entrep,
    Study,
    Lang,
    Degree,
}

impl Feature {
    pub const ALL: [Feature; 8] = [
        Feature::Grade,
        Feature::Debate,
        Feature::Programming,
        Feature::Internat,
        Feature::Entrep,
        Feature::Study,
        Feature::Lang,
        Feature::Degree,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn column_name(self) -> &'static str {
        match self {
            Feature::Grade => "grade",
            Feature::Debate => "debate",
            Feature::Programming => "programming",
            Feature::Internat => "internat",
            Feature::Entrep => "entrep",
            Feature::Study => "study",
            Feature::Lang => "lang",
            Feature::Degree => "degree",
        }
    }

    pub fn kind(self) -> FeatureKind {
        match self {
            Feature::Grade => FeatureKind::Continuous,
            Feature::Debate
            | Feature::Programming
            | Feature::Internat
            | Feature::Entrep
            | Feature::Study => FeatureKind::Binary,
            Feature::Lang | Feature::Degree => FeatureKind::Count,
        }
    }

    /// Position of this feature in the canonical column order.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_name(name: &str) -> Option<Feature> {
        Self::ALL.into_iter().find(|f| f.column_name() == name)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

/// One candidate, as a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// One-hot protected-attribute vector of length K.
    pub protected: Vec<f64>,
    pub grade: f64,
    pub debate: f64,
    pub programming: f64,
    pub internat: f64,
    pub entrep: f64,
    pub study: f64,
    pub lang: f64,
    pub degree: f64,
    /// Hiring decision; present only for training observations.
    pub decision: Option<f64>,
}

impl Observation {
    pub fn feature(&self, feature: Feature) -> f64 {
        match feature {
            Feature::Grade => self.grade,
            Feature::Debate => self.debate,
            Feature::Programming => self.programming,
            Feature::Internat => self.internat,
            Feature::Entrep => self.entrep,
            Feature::Study => self.study,
            Feature::Lang => self.lang,
            Feature::Degree => self.degree,
        }
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to a number. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the column '{0}'. This tool requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error("Non-finite value {value} in column '{column}' at row {row}.")]
    NonFiniteValue {
        column: String,
        row: usize,
        value: f64,
    },
    #[error("The population is empty; at least one observation is required.")]
    EmptyPopulation,
    #[error(
        "Found {found} protected-attribute column(s); at least 2 one-hot columns prefixed with '{PROTECTED_PREFIX}' are required."
    )]
    TooFewGroups { found: usize },
    #[error("Shape mismatch for {what}: expected {expected}, found {found}.")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error(
        "Protected-attribute row {row} is not one-hot (entries must be 0 or 1 and sum to 1; sum was {sum})."
    )]
    ProtectedNotOneHot { row: usize, sum: f64 },
    #[error("Binary column '{column}' has value {value} at row {row}; expected 0 or 1.")]
    NonBinaryValue {
        column: String,
        row: usize,
        value: f64,
    },
    #[error("Count column '{column}' has value {value} at row {row}; expected a non-negative integer.")]
    InvalidCount {
        column: String,
        row: usize,
        value: f64,
    },
    #[error("Training data requires a '{DECISION_COLUMN}' column with a value for every row.")]
    DecisionRequired,
    #[error("Group index {group} is out of range for {num_groups} groups.")]
    GroupOutOfRange { group: usize, num_groups: usize },
    #[error("Invalid train/test split: {0}")]
    InvalidSplit(String),
}

/// A validated, column-oriented set of observations.
///
/// Rows of `protected` are one-hot, `features` holds the eight features in
/// [`Feature::ALL`] order, and `decision` is present for training data only.
#[derive(Debug, Clone)]
pub struct Population {
    protected: Array2<f64>,
    features: Array2<f64>,
    decision: Option<Array1<f64>>,
    group_names: Vec<String>,
}

impl Population {
    /// Builds a population, rejecting any data that violates the schema.
    pub fn new(
        protected: Array2<f64>,
        features: Array2<f64>,
        decision: Option<Array1<f64>>,
        group_names: Vec<String>,
    ) -> Result<Self, DataError> {
        let n = protected.nrows();
        if n == 0 {
            return Err(DataError::EmptyPopulation);
        }
        if protected.ncols() < 2 {
            return Err(DataError::TooFewGroups {
                found: protected.ncols(),
            });
        }
        if group_names.len() != protected.ncols() {
            return Err(DataError::ShapeMismatch {
                what: "group names",
                expected: protected.ncols(),
                found: group_names.len(),
            });
        }
        if features.nrows() != n {
            return Err(DataError::ShapeMismatch {
                what: "feature rows",
                expected: n,
                found: features.nrows(),
            });
        }
        if features.ncols() != Feature::COUNT {
            return Err(DataError::ShapeMismatch {
                what: "feature columns",
                expected: Feature::COUNT,
                found: features.ncols(),
            });
        }

        for (row, values) in protected.axis_iter(Axis(0)).enumerate() {
            validate_one_hot(row, values)?;
        }
        for feature in Feature::ALL {
            validate_feature_column(feature, features.column(feature.index()))?;
        }
        if let Some(decision) = &decision {
            if decision.len() != n {
                return Err(DataError::ShapeMismatch {
                    what: "decision rows",
                    expected: n,
                    found: decision.len(),
                });
            }
            for (row, &value) in decision.iter().enumerate() {
                validate_binary(DECISION_COLUMN, row, value)?;
            }
        }

        Ok(Self {
            protected,
            features,
            decision,
            group_names,
        })
    }

    /// Builds a population from row records. Decisions are kept only when
    /// every observation carries one.
    pub fn from_observations(
        observations: &[Observation],
        group_names: Vec<String>,
    ) -> Result<Self, DataError> {
        let n = observations.len();
        if n == 0 {
            return Err(DataError::EmptyPopulation);
        }
        let k = group_names.len();
        let mut protected = Array2::<f64>::zeros((n, k));
        let mut features = Array2::<f64>::zeros((n, Feature::COUNT));
        for (i, obs) in observations.iter().enumerate() {
            if obs.protected.len() != k {
                return Err(DataError::ShapeMismatch {
                    what: "protected-attribute vector",
                    expected: k,
                    found: obs.protected.len(),
                });
            }
            for (j, &value) in obs.protected.iter().enumerate() {
                protected[[i, j]] = value;
            }
            for feature in Feature::ALL {
                features[[i, feature.index()]] = obs.feature(feature);
            }
        }
        let decision = observations
            .iter()
            .map(|obs| obs.decision)
            .collect::<Option<Vec<f64>>>()
            .map(Array1::from_vec);
        Self::new(protected, features, decision, group_names)
    }

    pub fn len(&self) -> usize {
        self.protected.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_groups(&self) -> usize {
        self.protected.ncols()
    }

    pub fn group_names(&self) -> &[String] {
        &self.group_names
    }

    pub fn protected(&self) -> ArrayView2<'_, f64> {
        self.protected.view()
    }

    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    pub fn feature_column(&self, feature: Feature) -> ArrayView1<'_, f64> {
        self.features.column(feature.index())
    }

    pub fn decision(&self) -> Option<ArrayView1<'_, f64>> {
        self.decision.as_ref().map(|d| d.view())
    }

    /// The decision vector, or an error when this is not training data.
    pub fn require_decision(&self) -> Result<ArrayView1<'_, f64>, DataError> {
        self.decision().ok_or(DataError::DecisionRequired)
    }

    /// Group index of each observation (the position of the 1 in its row).
    pub fn group_indices(&self) -> Vec<usize> {
        self.protected
            .axis_iter(Axis(0))
            .map(|row| row.iter().position(|&v| v == 1.0).unwrap_or(0))
            .collect()
    }

    /// Number of observations in each group.
    pub fn group_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.num_groups()];
        for g in self.group_indices() {
            sizes[g] += 1;
        }
        sizes
    }

    /// The same candidates with every protected vector overwritten to `group`
    /// and decisions dropped. All other features are untouched.
    pub fn relabeled(&self, group: usize) -> Result<Self, DataError> {
        let k = self.num_groups();
        if group >= k {
            return Err(DataError::GroupOutOfRange {
                group,
                num_groups: k,
            });
        }
        let mut protected = Array2::<f64>::zeros((self.len(), k));
        protected.column_mut(group).fill(1.0);
        Ok(Self {
            protected,
            features: self.features.clone(),
            decision: None,
            group_names: self.group_names.clone(),
        })
    }

    /// The same candidates with decisions dropped.
    pub fn without_decision(&self) -> Self {
        Self {
            protected: self.protected.clone(),
            features: self.features.clone(),
            decision: None,
            group_names: self.group_names.clone(),
        }
    }

    /// A new population made of the given rows, in the given order.
    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            protected: self.protected.select(Axis(0), rows),
            features: self.features.select(Axis(0), rows),
            decision: self.decision.as_ref().map(|d| d.select(Axis(0), rows)),
            group_names: self.group_names.clone(),
        }
    }
}

fn validate_one_hot(row: usize, values: ArrayView1<f64>) -> Result<(), DataError> {
    let sum: f64 = values.sum();
    let all_binary = values.iter().all(|&v| v == 0.0 || v == 1.0);
    if !all_binary || sum != 1.0 {
        return Err(DataError::ProtectedNotOneHot { row, sum });
    }
    Ok(())
}

fn validate_binary(column: &str, row: usize, value: f64) -> Result<(), DataError> {
    if value != 0.0 && value != 1.0 {
        return Err(DataError::NonBinaryValue {
            column: column.to_string(),
            row,
            value,
        });
    }
    Ok(())
}

fn validate_feature_column(feature: Feature, values: ArrayView1<f64>) -> Result<(), DataError> {
    let column = feature.column_name();
    for (row, &value) in values.iter().enumerate() {
        if !value.is_finite() {
            return Err(DataError::NonFiniteValue {
                column: column.to_string(),
                row,
                value,
            });
        }
        match feature.kind() {
            FeatureKind::Continuous => {}
            FeatureKind::Binary => validate_binary(column, row, value)?,
            FeatureKind::Count => {
                if value < 0.0 || value.fract() != 0.0 {
                    return Err(DataError::InvalidCount {
                        column: column.to_string(),
                        row,
                        value,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Randomly partitions a population into `(train, test)`.
///
/// The test set receives `round(n * test_fraction)` rows; both sides must be
/// non-empty. The permutation depends only on `seed`.
pub fn split_train_test(
    population: &Population,
    test_fraction: f64,
    seed: u64,
) -> Result<(Population, Population), DataError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(DataError::InvalidSplit(format!(
            "test fraction must lie strictly between 0 and 1, got {test_fraction}"
        )));
    }
    let n = population.len();
    let n_test = (n as f64 * test_fraction).round() as usize;
    if n_test == 0 || n_test == n {
        return Err(DataError::InvalidSplit(format!(
            "{n} rows with test fraction {test_fraction} leaves one side empty"
        )));
    }
    let mut rows: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    rows.shuffle(&mut rng);
    let (test_rows, train_rows) = rows.split_at(n_test);
    Ok((population.select(train_rows), population.select(test_rows)))
}

/// Loads and validates a population from a tab-separated file.
///
/// With `require_decision`, a missing `decision` column is an error; without
/// it, the column is read when present and otherwise left out.
pub fn load_population(path: &str, require_decision: bool) -> Result<Population, DataError> {
    fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                found_type: format!("{:?}", series.dtype()),
            })?;

        if casted.null_count() > 0 {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                found_type: format!("{:?}", series.dtype()),
            });
        }

        let chunked = casted.f64()?.rechunk();
        Ok(chunked.into_no_null_iter().collect())
    }

    log::info!("Loading data from '{path}'");

    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    let column_names: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|c| c.as_str().to_string())
        .collect();

    let protected_columns: Vec<&String> = column_names
        .iter()
        .filter(|c| c.starts_with(PROTECTED_PREFIX))
        .collect();
    if protected_columns.len() < 2 {
        return Err(DataError::TooFewGroups {
            found: protected_columns.len(),
        });
    }
    for feature in Feature::ALL {
        if !column_names.iter().any(|c| c == feature.column_name()) {
            return Err(DataError::ColumnNotFound(feature.column_name().to_string()));
        }
    }
    let has_decision = column_names.iter().any(|c| c == DECISION_COLUMN);
    if require_decision && !has_decision {
        return Err(DataError::DecisionRequired);
    }

    let n = df.height();
    let k = protected_columns.len();
    let mut protected = Array2::<f64>::zeros((n, k));
    let mut group_names = Vec::with_capacity(k);
    for (j, name) in protected_columns.iter().enumerate() {
        let values = extract_numeric_column(&df, name)?;
        protected.column_mut(j).assign(&Array1::from_vec(values));
        group_names.push(name[PROTECTED_PREFIX.len()..].to_string());
    }

    let mut features = Array2::<f64>::zeros((n, Feature::COUNT));
    for feature in Feature::ALL {
        let values = extract_numeric_column(&df, feature.column_name())?;
        features
            .column_mut(feature.index())
            .assign(&Array1::from_vec(values));
    }

    let decision = if has_decision {
        Some(Array1::from_vec(extract_numeric_column(
            &df,
            DECISION_COLUMN,
        )?))
    } else {
        None
    };

    let population = Population::new(protected, features, decision, group_names)?;
    log::info!(
        "Loaded {} observations across {} protected groups {:?}",
        population.len(),
        population.num_groups(),
        population.group_names()
    );
    Ok(population)
}
