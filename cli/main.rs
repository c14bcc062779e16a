#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fs::File;
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process;

use digitfit::data::{DatasetConfig, LabeledSplit, load_block, load_dataset, load_dataset_with};
use digitfit::estimate::{ClassFit, TrainingConfig, train_one_vs_all_with_progress};
use digitfit::evaluate::SplitReport;
use digitfit::model::TrainedModel;
use digitfit::optimize::{FitStatus, OptimizerKind};
use digitfit::progress::FitProgressObserver;

#[derive(Clone, Copy, ValueEnum)]
pub enum OptimizerCli {
    /// Nonlinear conjugate gradient with a strong-Wolfe line search
    Cg,
    /// Quasi-Newton BFGS
    Bfgs,
}

impl From<OptimizerCli> for OptimizerKind {
    fn from(value: OptimizerCli) -> Self {
        match value {
            OptimizerCli::Cg => OptimizerKind::ConjugateGradient,
            OptimizerCli::Bfgs => OptimizerKind::Bfgs,
        }
    }
}

#[derive(Args)]
pub struct TrainArgs {
    /// Directory holding train{c}.csv and test{c}.csv for every class
    pub data_dir: PathBuf,

    /// Where to write the trained model (.toml)
    #[arg(long, default_value = "model.toml")]
    pub output: PathBuf,

    /// Number of classes K
    #[arg(long, default_value = "10")]
    pub classes: usize,

    #[arg(long, value_enum, default_value_t = OptimizerCli::Cg)]
    pub optimizer: OptimizerCli,

    /// Iteration budget for each per-class fit
    #[arg(long, default_value = "50")]
    pub max_iterations: usize,

    /// Stop a per-class fit once the gradient infinity norm falls below this
    #[arg(long, default_value = "1e-5")]
    pub gradient_tolerance: f64,

    /// Rows held out for validation from the head of each training block
    #[arg(long, default_value = "1000")]
    pub validation_per_class: usize,

    /// Drop pixel columns whose training standard deviation is at or below this
    #[arg(long, default_value = "0.001")]
    pub variance_threshold: f64,

    /// Fit classes one after another instead of in parallel
    #[arg(long)]
    pub sequential: bool,
}

impl TrainArgs {
    fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig {
            num_classes: self.classes,
            validation_per_class: self.validation_per_class,
            variance_threshold: self.variance_threshold,
            ..DatasetConfig::default()
        }
    }

    fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            num_classes: self.classes,
            optimizer: self.optimizer.into(),
            max_iterations: self.max_iterations,
            gradient_tolerance: self.gradient_tolerance,
            parallel: !self.sequential,
        }
    }
}

#[derive(Args)]
pub struct EvaluateArgs {
    /// Directory holding train{c}.csv and test{c}.csv for every class
    pub data_dir: PathBuf,

    /// Path to trained model file (.toml)
    #[arg(long)]
    pub model: PathBuf,

    /// Rows held out for validation from the head of each training block.
    /// Defaults to the split the model was trained with
    #[arg(long)]
    pub validation_per_class: Option<usize>,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Headerless CSV of raw pixel rows
    pub input: PathBuf,

    /// Path to trained model file (.toml)
    #[arg(long)]
    pub model: PathBuf,

    #[arg(long, default_value = "predictions.tsv")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "digitfit",
    about = "One-vs-all logistic regression for handwritten digits",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Train a one-vs-all model and report split accuracies")]
    Train(TrainArgs),
    #[command(about = "Score a saved model against a dataset directory")]
    Evaluate(EvaluateArgs),
    #[command(about = "Predict classes for raw pixel rows")]
    Predict(PredictArgs),
}

/// Drives an indicatif bar from per-class training events.
struct ClassProgressBar {
    bar: ProgressBar,
}

impl ClassProgressBar {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(0), draw_target);
        let style = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} classes {msg}",
        )
        .map(|style| style.progress_chars("█▉▊▋▌▍▎▏  "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }
}

impl FitProgressObserver for ClassProgressBar {
    fn on_fit_start(&self, num_classes: usize) {
        self.bar.set_length(num_classes as u64);
        self.bar.set_position(0);
    }

    fn on_class_finished(&self, fit: &ClassFit) {
        self.bar
            .set_message(format!("class {} {}", fit.class_id, fit.status));
        self.bar.inc(1);
    }

    fn on_fit_finish(&self) {
        self.bar.finish_and_clear();
    }
}

fn report_split(
    model: &TrainedModel,
    name: &str,
    split: &LabeledSplit,
) -> Result<(), Box<dyn std::error::Error>> {
    if split.is_empty() {
        println!("{name} split is empty; skipping.");
        return Ok(());
    }
    let predicted = model.predict(split.features.view())?;
    let report = SplitReport::new(
        name,
        predicted.view(),
        split.labels.view(),
        model.config.num_classes,
    )?;
    print!("{report}");
    Ok(())
}

fn summarize_fits(fits: &[ClassFit]) {
    for fit in fits {
        println!(
            "  class {}: {} after {} iterations, loss {:.6}, |grad|_inf {:.3e}",
            fit.class_id, fit.status, fit.iterations, fit.final_loss, fit.gradient_norm
        );
    }
    let stalled = fits
        .iter()
        .filter(|fit| fit.status == FitStatus::Stalled)
        .count();
    if stalled > 0 {
        println!("Warning: {stalled} class fit(s) stalled before reaching the tolerance.");
    }
}

pub fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let dataset_config = args.dataset_config();
    let dataset = load_dataset(&args.data_dir, &dataset_config)?;
    println!(
        "Loaded {} training, {} validation and {} test samples with {} features.",
        dataset.train.len(),
        dataset.validation.len(),
        dataset.test.len(),
        dataset.preprocessor.num_features()
    );

    let config = args.training_config();
    println!("Training {} one-vs-all classifiers...", config.num_classes);
    let progress = ClassProgressBar::new();
    let fit = train_one_vs_all_with_progress(
        dataset.train.features.view(),
        dataset.train.labels.view(),
        &config,
        &progress,
    )?;
    summarize_fits(&fit.fits);

    let model = TrainedModel::new(config, fit, Some(dataset.preprocessor))
        .with_dataset_config(dataset_config);
    report_split(&model, "Training", &dataset.train)?;
    report_split(&model, "Validation", &dataset.validation)?;
    report_split(&model, "Test", &dataset.test)?;

    model.save(&args.output)?;
    println!("Model saved to: {}", args.output.display());
    Ok(())
}

pub fn evaluate(args: EvaluateArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", args.model.display());
    let model = TrainedModel::load(&args.model)?;
    let preprocessor = model
        .preprocessor
        .clone()
        .ok_or("model has no stored preprocessor; it cannot be applied to raw pixel data")?;

    let stored = model.dataset.clone().unwrap_or_else(|| {
        log::warn!("Model does not record its dataset split; using default settings.");
        DatasetConfig::default()
    });
    let config = DatasetConfig {
        num_classes: model.config.num_classes,
        validation_per_class: args
            .validation_per_class
            .unwrap_or(stored.validation_per_class),
        intensity_scale: preprocessor.intensity_scale,
        ..stored
    };
    log::info!(
        "Holding out {} validation rows per class.",
        config.validation_per_class
    );
    let dataset = load_dataset_with(&args.data_dir, &config, Some(preprocessor))?;

    report_split(&model, "Training", &dataset.train)?;
    report_split(&model, "Validation", &dataset.validation)?;
    report_split(&model, "Test", &dataset.test)?;
    Ok(())
}

pub fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", args.model.display());
    let model = TrainedModel::load(&args.model)?;

    println!("Loading raw rows from: {}", args.input.display());
    let raw = load_block(&args.input)?;
    let predictions = model.predict_raw(raw.view())?;

    write_predictions(&args.output, predictions.iter().copied())?;
    println!(
        "{} predictions saved to: {}",
        predictions.len(),
        args.output.display()
    );
    Ok(())
}

fn write_predictions(
    path: &Path,
    predictions: impl Iterator<Item = usize>,
) -> Result<(), std::io::Error> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "row\tpredicted_class")?;
    for (row, class_id) in predictions.enumerate() {
        writeln!(writer, "{row}\t{class_id}")?;
    }
    writer.flush()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Evaluate(args)) => evaluate(args),
        Some(Commands::Predict(args)) => predict(args),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) }),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
