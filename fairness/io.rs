//! Tab-separated result tables and TOML reports.

use crate::counterfactual::LatentEstimate;
use crate::data::{DECISION_COLUMN, Feature, PROTECTED_PREFIX, Population};
use crate::diagnostics::{FitQuality, ParameterSummary};
use crate::sweep::{AgreementRow, SweepRow};
use csv::{Writer, WriterBuilder};
use ndarray::ArrayView1;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to write file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize report to TOML: {0}")]
    Toml(#[from] toml::ser::Error),
    #[error("Table '{table}' has {found} rows for {expected} candidates.")]
    RowCountMismatch {
        table: &'static str,
        expected: usize,
        found: usize,
    },
}

fn tsv_writer(path: &Path) -> Result<Writer<File>, OutputError> {
    Ok(WriterBuilder::new().delimiter(b'\t').from_path(path)?)
}

fn number(x: f64) -> String {
    format!("{x:.6}")
}

fn optional(x: Option<f64>) -> String {
    x.map(number).unwrap_or_default()
}

/// One row per parameter: name, mean, sd, quantiles, R-hat and ESS.
pub fn write_parameter_summaries(
    path: &Path,
    summaries: &[ParameterSummary],
) -> Result<(), OutputError> {
    let mut writer = tsv_writer(path)?;
    writer.write_record([
        "parameter", "mean", "sd", "q5", "q50", "q95", "rhat", "ess_bulk", "ess_tail",
    ])?;
    for s in summaries {
        writer.write_record([
            s.name.clone(),
            number(s.mean),
            number(s.sd),
            number(s.q5),
            number(s.q50),
            number(s.q95),
            number(s.rhat),
            number(s.ess_bulk),
            number(s.ess_tail),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// One row per divergent retained transition: chain and iteration.
pub fn write_divergences(path: &Path, per_chain: &[Vec<usize>]) -> Result<(), OutputError> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["chain", "iteration"])?;
    for (chain, iterations) in per_chain.iter().enumerate() {
        for iteration in iterations {
            writer.write_record([chain.to_string(), iteration.to_string()])?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// One row per candidate with the posterior summary of its latent factor.
/// `groups` holds each candidate's factual group name.
pub fn write_latents(
    path: &Path,
    estimates: &[LatentEstimate],
    groups: &[String],
) -> Result<(), OutputError> {
    if groups.len() != estimates.len() {
        return Err(OutputError::RowCountMismatch {
            table: "latent factors",
            expected: groups.len(),
            found: estimates.len(),
        });
    }
    let mut writer = tsv_writer(path)?;
    writer.write_record(["index", "group", "u_mean", "u_sd", "rhat", "ess_bulk", "divergences"])?;
    for (i, (estimate, group)) in estimates.iter().zip(groups).enumerate() {
        writer.write_record([
            i.to_string(),
            group.clone(),
            number(estimate.mean),
            number(estimate.sd),
            optional(estimate.rhat),
            optional(estimate.ess_bulk),
            estimate.divergences.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_predictions(
    path: &Path,
    probabilities: ArrayView1<f64>,
    groups: &[String],
) -> Result<(), OutputError> {
    if groups.len() != probabilities.len() {
        return Err(OutputError::RowCountMismatch {
            table: "predictions",
            expected: groups.len(),
            found: probabilities.len(),
        });
    }
    let mut writer = tsv_writer(path)?;
    writer.write_record(["index", "group", "probability"])?;
    for (i, (&p, group)) in probabilities.iter().zip(groups).enumerate() {
        writer.write_record([i.to_string(), group.clone(), number(p)])?;
    }
    writer.flush()?;
    Ok(())
}

/// Per-threshold group tallies. Columns per group `g`: `g_positives`,
/// `g_hire_pct`, `g_selection_rate`; then totals and one
/// `disparity_<g>_vs_<reference>` column per non-reference group.
pub fn write_sweep(
    path: &Path,
    rows: &[SweepRow],
    group_names: &[String],
) -> Result<(), OutputError> {
    let mut writer = tsv_writer(path)?;
    let mut header = vec!["threshold".to_string()];
    for g in group_names {
        header.push(format!("{g}_positives"));
        header.push(format!("{g}_hire_pct"));
        header.push(format!("{g}_selection_rate"));
    }
    header.push("total_positives".to_string());
    header.push("total_pct".to_string());
    if let Some((reference, others)) = group_names.split_first() {
        header.extend(
            others
                .iter()
                .map(|g| format!("disparity_{g}_vs_{reference}")),
        );
    }
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![number(row.threshold)];
        for tally in &row.groups {
            record.push(tally.positives.to_string());
            record.push(number(tally.hire_pct));
            record.push(number(tally.selection_rate));
        }
        record.push(row.total_positives.to_string());
        record.push(number(row.total_pct));
        record.extend(row.disparity.iter().map(|&d| number(d)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_agreement(path: &Path, rows: &[AgreementRow]) -> Result<(), OutputError> {
    let mut writer = tsv_writer(path)?;
    writer.write_record([
        "threshold",
        "agreement_rate",
        "positives_a",
        "positives_b",
        "positive_ratio",
    ])?;
    for row in rows {
        writer.write_record([
            number(row.threshold),
            number(row.agreement_rate),
            row.positives_a.to_string(),
            row.positives_b.to_string(),
            number(row.positive_ratio),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_quality(path: &Path, quality: &FitQuality) -> Result<(), OutputError> {
    std::fs::write(path, toml::to_string_pretty(quality)?)?;
    Ok(())
}

/// Writes a population in the input format, so it can be read back with
/// [`crate::data::load_population`].
pub fn write_population(path: &Path, population: &Population) -> Result<(), OutputError> {
    let mut writer = tsv_writer(path)?;
    let mut header: Vec<String> = population
        .group_names()
        .iter()
        .map(|g| format!("{PROTECTED_PREFIX}{g}"))
        .collect();
    header.extend(Feature::ALL.iter().map(|f| f.column_name().to_string()));
    let decision = population.decision();
    if decision.is_some() {
        header.push(DECISION_COLUMN.to_string());
    }
    writer.write_record(&header)?;

    let protected = population.protected();
    let features = population.features();
    for i in 0..population.len() {
        let mut record: Vec<String> = protected.row(i).iter().map(|v| v.to_string()).collect();
        record.extend(features.row(i).iter().map(|v| v.to_string()));
        if let Some(decision) = &decision {
            record.push(decision[i].to_string());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
