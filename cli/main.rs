#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use dieback::forecast::assemble::{EvaluationTensor, assemble};
use dieback::forecast::evaluate::evaluate_all;
use dieback::forecast::forest::ForestParams;
use dieback::forecast::metrics::{performance_matrix, write_performance};
use dieback::forecast::model::{ApplyConfig, TrainedForest, apply_forest, reformat_predictions, train_final};
use dieback::forecast::samples::{
    DEFAULT_TARGET, SampleConfig, build_samples, filter_positive, load_samples, write_samples,
};
use dieback::grid::folds::{FoldConfig, append_folds};
use dieback::grid::io::{read_grid, write_grid};
use dieback::grid::summary::{SummaryConfig, summarize_ensemble, summarize_years};
use dieback::grid::water_year::{AggregateConfig, aggregate_water_year};
use dieback::indices::engine::{IndexConfig, compute_indices, with_reference};
use dieback::shared::config::{load_config, load_config_or_default};
use dieback::shared::progress::ConsoleProgress;
use dieback::shared::tasks::ThreadTaskPool;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Args)]
pub struct EvaluateArgs {
    /// Sample table produced by `samples` (optionally filtered)
    pub training_data: PathBuf,

    /// Output path for the cross-validation result archive (.json or .json.gz)
    pub result: PathBuf,

    /// TOML file with random forest hyperparameters; defaults are used when absent
    #[arg(long, value_name = "PATH")]
    pub forest: Option<PathBuf>,

    /// Name of the target column
    #[arg(long, default_value = DEFAULT_TARGET)]
    pub target: String,

    /// Number of worker threads (defaults to one per logical CPU)
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,
}

#[derive(Args)]
pub struct TrainArgs {
    /// Sample table produced by `samples` (optionally filtered)
    pub training_data: PathBuf,

    /// Output path for the trained model (TOML)
    pub model: PathBuf,

    /// Year whose rows the final model is fitted on
    #[arg(short, long, default_value = "2012")]
    pub year: i64,

    /// TOML file with random forest hyperparameters; defaults are used when absent
    #[arg(long, value_name = "PATH")]
    pub forest: Option<PathBuf>,

    /// Name of the target column
    #[arg(long, default_value = DEFAULT_TARGET)]
    pub target: String,
}

#[derive(Parser)]
#[command(
    name = "dieback",
    version,
    about = "Standardized climate indices and cross-validated tree-mortality forecasting",
    long_about = "Computes rolling precipitation and standardized drought indices on gridded \
                 climate data and evaluates random-forest mortality forecasts with spatially \
                 blocked cross-validation."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Collapse a monthly grid into water years
    #[command(about = "Aggregate monthly climate into water years")]
    Aggregate {
        /// Monthly grid store (time labels YYYYMM)
        input: PathBuf,
        /// TOML file naming the variables to keep and their reducers
        config: PathBuf,
        /// Output grid store
        output: PathBuf,
    },

    /// Reduce each configured variable over the time axis of one grid
    #[command(about = "Summarize a projection over its years")]
    Accumulate {
        /// Grid store to summarize
        input: PathBuf,
        /// TOML file listing the statistics to compute
        config: PathBuf,
        /// Output grid store with a single time step
        output: PathBuf,
    },

    /// Reduce each configured variable across ensemble members
    #[command(about = "Summarize an ensemble of projections")]
    Ensemble {
        /// TOML file listing the statistics to compute
        config: PathBuf,
        /// Output grid store
        output: PathBuf,
        /// Member grid stores sharing grid and time axis
        #[arg(required = true, num_args = 1..)]
        members: Vec<PathBuf>,
    },

    /// Compute PR/PRET and SPI/SPEI for every configured span
    #[command(about = "Compute rolling and standardized climate indices")]
    Indices {
        /// Grid store covering the focal period
        input: PathBuf,
        /// TOML index configuration
        config: PathBuf,
        /// Output grid store
        output: PathBuf,
        /// Separate store holding the reference period; joined before the input
        #[arg(short, long, value_name = "PATH")]
        reference: Option<PathBuf>,
        /// Number of worker threads (defaults to one per logical CPU)
        #[arg(long, value_name = "N")]
        workers: Option<usize>,
    },

    /// Append spatial block folds and cell identifiers to a grid
    #[command(about = "Assign spatial folds (outputs fold and id variables)")]
    Folds {
        input: PathBuf,
        /// TOML fold configuration
        config: PathBuf,
        output: PathBuf,
    },

    /// Join mortality and climate grids into a sample table
    #[command(about = "Build the training sample table")]
    Samples {
        /// Mortality grid with fold, id and target variables
        mortality: PathBuf,
        /// Climate index grid
        climate: PathBuf,
        /// TOML sample configuration
        config: PathBuf,
        /// Output sample table (TSV)
        output: PathBuf,
    },

    /// Keep only rows whose target is strictly positive
    #[command(about = "Filter the sample table to positive targets")]
    Filter {
        training_data: PathBuf,
        output: PathBuf,
        #[arg(long, default_value = DEFAULT_TARGET)]
        target: String,
    },

    /// Leave-one-fold-out evaluation for every (year, fold) pair
    #[command(about = "Cross-validate the forest (outputs a result archive)")]
    Evaluate(EvaluateArgs),

    /// Fit the final model on one year
    #[command(about = "Train the final forest (outputs a TOML model)")]
    Train(TrainArgs),

    /// Predict every configured year over a climate grid
    #[command(about = "Apply a trained forest to a climate grid")]
    Apply {
        climate: PathBuf,
        /// Model written by `train`
        model: PathBuf,
        /// TOML apply configuration
        config: PathBuf,
        output: PathBuf,
        #[arg(long, value_name = "N")]
        workers: Option<usize>,
    },

    /// Rebuild a mortality grid from same-year cross-validated predictions
    #[command(about = "Reformat cross-validated predictions onto the mortality grid")]
    Reformat {
        /// Result archive written by `evaluate`
        result: PathBuf,
        mortality: PathBuf,
        output: PathBuf,
        #[arg(long, default_value = DEFAULT_TARGET)]
        target: String,
    },

    /// R² and RMSE for every (training year, evaluation year) pair
    #[command(about = "Summarize skill per year pair (outputs TSV)")]
    Performance { result: PathBuf, output: PathBuf },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Aggregate { input, config, output }) => run_aggregate(&input, &config, &output),
        Some(Commands::Accumulate { input, config, output }) => run_accumulate(&input, &config, &output),
        Some(Commands::Ensemble { config, output, members }) => run_ensemble(&config, &output, members),
        Some(Commands::Indices {
            input,
            config,
            output,
            reference,
            workers,
        }) => run_indices(&input, &config, &output, reference.as_deref(), workers),
        Some(Commands::Folds { input, config, output }) => run_folds(&input, &config, &output),
        Some(Commands::Samples {
            mortality,
            climate,
            config,
            output,
        }) => run_samples(&mortality, &climate, &config, &output),
        Some(Commands::Filter {
            training_data,
            output,
            target,
        }) => run_filter(&training_data, &output, &target),
        Some(Commands::Evaluate(args)) => run_evaluate(args),
        Some(Commands::Train(args)) => run_train(args),
        Some(Commands::Apply {
            climate,
            model,
            config,
            output,
            workers,
        }) => run_apply(&climate, &model, &config, &output, workers),
        Some(Commands::Reformat {
            result,
            mortality,
            output,
            target,
        }) => run_reformat(&result, &mortality, &output, &target),
        Some(Commands::Performance { result, output }) => run_performance(&result, &output),
        None => {
            let mut command = Cli::command();
            match command.print_help() {
                Ok(()) => {
                    println!();
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_aggregate(input: &Path, config: &Path, output: &Path) -> CliResult {
    let config: AggregateConfig = load_config(config)?;
    config.validate()?;
    let monthly = read_grid(input)?;
    let yearly = aggregate_water_year(&monthly, &config)?;
    write_grid(output, &yearly)?;
    println!(
        "Aggregated {} months into {} water years: {}",
        monthly.time.len(),
        yearly.time.len(),
        output.display()
    );
    Ok(())
}

fn run_accumulate(input: &Path, config: &Path, output: &Path) -> CliResult {
    let config: SummaryConfig = load_config(config)?;
    config.validate()?;
    let projection = read_grid(input)?;
    let summary = summarize_years(&projection, &config)?;
    write_grid(output, &summary)?;
    println!(
        "Summarized {} steps into {} statistics: {}",
        projection.time.len(),
        summary.variables.len(),
        output.display()
    );
    Ok(())
}

fn run_ensemble(config: &Path, output: &Path, mut members: Vec<PathBuf>) -> CliResult {
    let config: SummaryConfig = load_config(config)?;
    config.validate()?;
    members.sort();
    let datasets = members
        .iter()
        .map(|path| read_grid(path))
        .collect::<Result<Vec<_>, _>>()?;
    let summary = summarize_ensemble(&datasets, &config)?;
    write_grid(output, &summary)?;
    println!(
        "Summarized {} ensemble members into {} statistics: {}",
        datasets.len(),
        summary.variables.len(),
        output.display()
    );
    Ok(())
}

fn run_indices(
    input: &Path,
    config: &Path,
    output: &Path,
    reference: Option<&Path>,
    workers: Option<usize>,
) -> CliResult {
    let config: IndexConfig = load_config(config)?;
    let mut dataset = read_grid(input)?;
    if let Some(reference) = reference {
        let reference = read_grid(reference)?;
        dataset = with_reference(&dataset, &reference, &config)?;
    }
    config.validate(&dataset)?;

    let pool = ThreadTaskPool::new(workers)?;
    println!("Computing indices with {} workers", pool.num_workers());
    let mut progress = ConsoleProgress::new();
    let merged = compute_indices(Arc::new(dataset), Arc::new(config), &pool, &mut progress)?;
    write_grid(output, &merged)?;
    println!("Indices written to: {}", output.display());
    Ok(())
}

fn run_folds(input: &Path, config: &Path, output: &Path) -> CliResult {
    let config: FoldConfig = load_config(config)?;
    config.validate()?;
    let mut dataset = read_grid(input)?;
    let assignment = append_folds(&mut dataset, &config)?;
    write_grid(output, &dataset)?;
    println!(
        "Assigned {} folds; grid written to: {}",
        assignment.num_folds(),
        output.display()
    );
    Ok(())
}

fn run_samples(mortality: &Path, climate: &Path, config: &Path, output: &Path) -> CliResult {
    let config: SampleConfig = load_config(config)?;
    config.validate()?;
    let mortality = read_grid(mortality)?;
    let climate = read_grid(climate)?;
    let table = build_samples(&mortality, &climate, &config)?;
    write_samples(output, &table)?;
    println!(
        "Wrote {} samples with {} features to: {}",
        table.len(),
        table.feature_names.len(),
        output.display()
    );
    Ok(())
}

fn run_filter(training_data: &Path, output: &Path, target: &str) -> CliResult {
    let table = load_samples(training_data, target)?;
    let kept = filter_positive(&table);
    write_samples(output, &kept)?;
    println!(
        "Kept {} of {} samples with positive {target}",
        kept.len(),
        table.len()
    );
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> CliResult {
    let params: ForestParams = load_config_or_default(args.forest.as_deref())?;
    params.validate()?;
    println!("Loading training data from: {}", args.training_data.display());
    let table = load_samples(&args.training_data, &args.target)?;
    println!(
        "Loaded {} samples with {} features",
        table.len(),
        table.feature_names.len()
    );

    let pool = ThreadTaskPool::new(args.workers)?;
    let mut progress = ConsoleProgress::new();
    let years = table.years();
    let folds = table.folds();
    let ids = table.ids();
    let results = evaluate_all(Arc::new(table), Arc::new(params), &pool, &mut progress)?;
    let tensor = assemble(&results, &years, &folds, &ids, &mut progress)?;
    tensor.save(&args.result)?;
    println!("Result archive saved to: {}", args.result.display());
    Ok(())
}

fn run_train(args: TrainArgs) -> CliResult {
    let params: ForestParams = load_config_or_default(args.forest.as_deref())?;
    params.validate()?;
    let table = load_samples(&args.training_data, &args.target)?;
    println!("Training final model on {}...", args.year);
    let model = train_final(&table, args.year, &params)?;
    model.save(&args.model)?;
    println!("Model saved to: {}", args.model.display());
    Ok(())
}

fn run_apply(
    climate: &Path,
    model: &Path,
    config: &Path,
    output: &Path,
    workers: Option<usize>,
) -> CliResult {
    let config: ApplyConfig = load_config(config)?;
    config.validate()?;
    println!("Loading model from: {}", model.display());
    let model = TrainedForest::load(model)?;
    let climate = read_grid(climate)?;

    let pool = ThreadTaskPool::new(workers)?;
    let mut progress = ConsoleProgress::new();
    let predictions = apply_forest(Arc::new(model), Arc::new(climate), &config, &pool, &mut progress)?;
    write_grid(output, &predictions)?;
    println!("Predictions written to: {}", output.display());
    Ok(())
}

fn run_reformat(result: &Path, mortality: &Path, output: &Path, target: &str) -> CliResult {
    let tensor = EvaluationTensor::load(result)?;
    let mortality = read_grid(mortality)?;
    let reformatted = reformat_predictions(&tensor, &mortality, target)?;
    write_grid(output, &reformatted)?;
    println!("Reformatted predictions written to: {}", output.display());
    Ok(())
}

fn run_performance(result: &Path, output: &Path) -> CliResult {
    let tensor = EvaluationTensor::load(result)?;
    let matrix = performance_matrix(&tensor);
    write_performance(output, &matrix)?;
    println!("Performance table written to: {}", output.display());
    Ok(())
}
