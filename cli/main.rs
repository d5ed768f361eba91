#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::process;

use counterfair::config::RunConfig;
use counterfair::counterfactual::LatentEstimator;
use counterfair::data::load_population;
use counterfair::io::write_population;
use counterfair::model::GlobalParameters;
use counterfair::pipeline::{counterfactuals_and_save, fit_and_save, run_pipeline};
use counterfair::progress::BarProgress;
use counterfair::simulate::{SimulationConfig, simulate};

#[derive(Parser)]
#[command(
    name = "counterfair",
    about = "Counterfactual fairness auditing with a latent-confounder model",
    long_about = "Fits a latent-confounder generative model to hiring data with NUTS, re-infers \
                 each candidate's latent factor under counterfactual protected attributes, and \
                 sweeps decision thresholds to compare selection rates across groups and worlds."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// TOML run configuration; missing settings take their defaults
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// Directory that receives every output file
    #[arg(long, default_value = "counterfair_out")]
    out_dir: PathBuf,

    /// Number of NUTS chains for the generative-model fit
    #[arg(long)]
    chains: Option<usize>,

    /// Warmup iterations per chain
    #[arg(long)]
    warmup: Option<usize>,

    /// Retained iterations per chain
    #[arg(long)]
    samples: Option<usize>,

    /// Seed for every sampler in the run
    #[arg(long)]
    seed: Option<u64>,

    /// Re-infer latent factors by grid quadrature instead of per-candidate NUTS
    #[arg(long)]
    grid: bool,

    /// Keep warmup draws of the fit and write warmup-inclusive diagnostics
    #[arg(long)]
    save_warmup: bool,
}

impl CommonArgs {
    fn resolve(&self) -> Result<RunConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(chains) = self.chains {
            config.sampler.n_chains = chains;
        }
        if let Some(warmup) = self.warmup {
            config.sampler.n_warmup = warmup;
        }
        if let Some(samples) = self.samples {
            config.sampler.n_samples = samples;
        }
        if let Some(seed) = self.seed {
            config.sampler.seed = seed;
            config.counterfactual.sampler.seed = seed;
        }
        if self.save_warmup {
            config.sampler.save_warmup = true;
        }
        if self.grid {
            config.counterfactual.estimator = LatentEstimator::Grid {
                points: 2001,
                bound: 8.0,
            };
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Draw a synthetic population from the generative model
    #[command(about = "Simulate candidates (outputs: population TSV and true parameters)")]
    Simulate {
        /// Output TSV path
        output: PathBuf,

        /// Number of candidates
        #[arg(long, default_value = "500")]
        n: usize,

        /// Comma-separated protected group names
        #[arg(long, value_delimiter = ',', default_value = "female,male")]
        groups: Vec<String>,

        #[arg(long, default_value = "42")]
        seed: u64,

        /// Where to write the parameters the data was drawn from
        #[arg(long)]
        params_out: Option<PathBuf>,
    },

    /// Fit the generative model to labeled training data
    #[command(about = "Fit the generative model (outputs: params.toml, diagnostics.tsv, quality.toml)")]
    Fit {
        /// Training TSV with a_* columns, the eight features and decision
        training_data: String,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Re-infer latent factors under counterfactual protected attributes
    #[command(about = "Re-infer latent factors per scenario (outputs: latent_<set>_<scenario>.tsv)")]
    Counterfactual {
        /// TSV with a_* columns and the eight features; decisions are ignored
        data: String,

        /// Frozen parameters written by `fit`
        #[arg(long)]
        params: String,

        /// Label used in the output file names
        #[arg(long, default_value = "test")]
        set: String,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Split, fit, re-infer, predict and sweep in one go
    #[command(about = "Run the full analysis on a labeled dataset")]
    Run {
        /// Labeled TSV with a_* columns, the eight features and decision
        data: String,

        #[command(flatten)]
        common: CommonArgs,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Simulate {
            output,
            n,
            groups,
            seed,
            params_out,
        } => simulate_command(output, n, groups, seed, params_out),
        Commands::Fit {
            training_data,
            common,
        } => fit_command(&training_data, &common),
        Commands::Counterfactual {
            data,
            params,
            set,
            common,
        } => counterfactual_command(&data, &params, &set, &common),
        Commands::Run { data, common } => run_command(&data, &common),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn simulate_command(
    output: PathBuf,
    n: usize,
    groups: Vec<String>,
    seed: u64,
    params_out: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let simulation = simulate(&SimulationConfig {
        num_individuals: n,
        group_names: groups,
        seed,
        ..SimulationConfig::default()
    })?;
    write_population(&output, &simulation.population)?;
    println!("Wrote {} candidates to {}", n, output.display());
    if let Some(path) = params_out {
        simulation.params.save(&path.to_string_lossy())?;
        println!("Wrote true parameters to {}", path.display());
    }
    Ok(())
}

fn fit_command(training_data: &str, common: &CommonArgs) -> Result<(), Box<dyn Error>> {
    let config = common.resolve()?;
    let population = load_population(training_data, true)?;
    let progress = BarProgress::new();
    let mut outputs = Vec::new();
    let fit = fit_and_save(&population, &config, &common.out_dir, &progress, &mut outputs)?;

    println!(
        "Fit {} candidates: max R-hat {:.4}, min bulk ESS {:.0}, {} divergence(s), reliable: {}",
        population.len(),
        fit.quality.max_rhat,
        fit.quality.min_ess_bulk,
        fit.quality.divergences,
        fit.quality.reliable
    );
    for path in outputs {
        println!("  {}", path.display());
    }
    Ok(())
}

fn counterfactual_command(
    data: &str,
    params: &str,
    set: &str,
    common: &CommonArgs,
) -> Result<(), Box<dyn Error>> {
    let config = common.resolve()?;
    let params = GlobalParameters::load(params)?;
    let population = load_population(data, false)?;
    let progress = BarProgress::new();
    let mut outputs = Vec::new();
    let worlds = counterfactuals_and_save(
        &params,
        &population,
        set,
        &config,
        &common.out_dir,
        &progress,
        &mut outputs,
    )?;
    for world in &worlds {
        println!(
            "Scenario '{}': {} candidates, {} divergence(s)",
            world.label,
            world.estimates.len(),
            world.divergences()
        );
    }
    for path in outputs {
        println!("  {}", path.display());
    }
    Ok(())
}

fn run_command(data: &str, common: &CommonArgs) -> Result<(), Box<dyn Error>> {
    let config = common.resolve()?;
    let population = load_population(data, true)?;
    let progress = BarProgress::new();
    let report = run_pipeline(&population, &config, &common.out_dir, &progress)?;
    println!(
        "Wrote {} file(s) to {} (fit reliable: {})",
        report.outputs.len(),
        common.out_dir.display(),
        report.fit.quality.reliable
    );
    Ok(())
}
