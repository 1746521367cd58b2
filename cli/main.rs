#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::{Array2, s};
use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use coalesce::kernels::config::JobConfig;
use coalesce::kernels::covariance::{Covariance, CovarianceOutput};
use coalesce::kernels::implicit_als::{self, AlsModel};
use coalesce::kernels::kmeans::{self, KmeansResult};
use coalesce::kernels::linear_regression::{self, NormalEquationsTraining, QrTraining, RegressionMethod};
use coalesce::kernels::moments::LowOrderMoments;
use coalesce::kernels::naive_bayes::{NaiveBayesModel, NaiveBayesTraining};
use coalesce::kernels::pca::{PcaCorrelation, PcaMethod, PcaSvd};
use coalesce::kernels::qr::Qr;
use coalesce::kernels::svd::Svd;
use coalesce::kernels::{IterationObserver, IterativeAlgorithm};
use coalesce::loader::{DataFormat, DatasetLoader, PartitionScheme, PartitionedDataset, join_labels, split_columns};
use coalesce::operation::Decomposition;
use coalesce::sink::{ArtifactKey, FsSink, ResultSink, format_table};
use coalesce::staged::StagedDecomposition;
use coalesce::{Coordinator, GlobalResult, PartitionIndex, PipelineError, TaskContext};

/// Rows of each table shown on the terminal.
const PREVIEW_ROWS: usize = 10;

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Clone, Copy, ValueEnum)]
enum FormatCli {
    Dense,
    Csr,
}

#[derive(Clone, Copy, ValueEnum)]
enum SchemeCli {
    /// Partition index from the `_N` file-name suffix
    Suffix,
    /// Partition index from natural file order
    Order,
    /// Row chunks of at most `max_rows_per_block`
    Chunks,
    /// Indices strided by task ordinal; needs --task-ordinal and --total-tasks
    Strided,
}

#[derive(Clone, Copy, ValueEnum)]
enum PcaMethodCli {
    Correlation,
    Svd,
}

#[derive(Clone, Copy, ValueEnum)]
enum RegressionMethodCli {
    Normeq,
    Qr,
}

#[derive(Args)]
struct CommonArgs {
    /// File or directory of partition files
    #[arg(long, value_name = "PATH")]
    input: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = FormatCli::Dense)]
    format: FormatCli,

    #[arg(long, value_enum, default_value_t = SchemeCli::Order)]
    scheme: SchemeCli,

    /// Ordinal of this task among --total-tasks (strided scheme)
    #[arg(long, value_name = "K")]
    task_ordinal: Option<u32>,

    #[arg(long, value_name = "N")]
    total_tasks: Option<u32>,

    /// Number of features; inferred from the data when omitted
    #[arg(long, value_name = "P")]
    features: Option<usize>,

    /// Directory receiving result tables
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Job configuration (.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Worker threads; overrides the configuration and COALESCE_WORKERS
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
}

#[derive(Parser)]
#[command(
    name = "coalesce",
    about = "Distributed partial-aggregation runner for statistical kernels",
    long_about = "Runs statistical and linear-algebra kernels over a partitioned dataset: \
                 each partition is reduced locally, partial results are merged at a single \
                 master, and multi-step algorithms redistribute keyed partials between rounds."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Low-order moments of every feature")]
    Moments(CommonArgs),

    #[command(about = "Variance-covariance or correlation matrix")]
    Covariance {
        #[command(flatten)]
        common: CommonArgs,

        /// Report the correlation matrix instead of the covariance matrix
        #[arg(long)]
        correlation: bool,
    },

    #[command(about = "Principal component analysis")]
    Pca {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, value_enum)]
        method: Option<PcaMethodCli>,
    },

    #[command(about = "Tall-skinny QR decomposition in one job")]
    Qr(CommonArgs),

    #[command(about = "Thin SVD in one job")]
    Svd(CommonArgs),

    #[command(about = "QR decomposition as three separate jobs sharing --output")]
    QrStaged {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=3))]
        step: u8,
    },

    #[command(about = "SVD as three separate jobs sharing --output")]
    SvdStaged {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=3))]
        step: u8,
    },

    #[command(about = "K-means clustering (outputs: centroids, assignments)")]
    Kmeans {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, value_name = "K")]
        clusters: Option<usize>,

        #[arg(long, value_name = "N")]
        iterations: Option<usize>,
    },

    #[command(about = "Multinomial naive Bayes training and prediction")]
    NaiveBayes {
        #[command(flatten)]
        common: CommonArgs,

        /// Class labels, partitioned like --input
        #[arg(long, value_name = "PATH")]
        labels: PathBuf,

        /// Data to classify with the trained model
        #[arg(long, value_name = "PATH")]
        test: Option<PathBuf>,

        #[arg(long, value_name = "K")]
        classes: Option<usize>,
    },

    #[command(about = "Linear regression training and prediction")]
    Linreg {
        #[command(flatten)]
        common: CommonArgs,

        /// Leading columns that are regressors; the rest are responses
        #[arg(long, value_name = "P")]
        regressors: Option<usize>,

        #[arg(long, value_enum)]
        method: Option<RegressionMethodCli>,

        /// Data laid out like --input whose responses are predicted
        #[arg(long, value_name = "PATH")]
        test: Option<PathBuf>,
    },

    #[command(about = "Implicit alternating least squares on CSR ratings")]
    Als {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, value_name = "K")]
        factors: Option<usize>,

        #[arg(long, value_name = "N")]
        iterations: Option<usize>,
    },
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());

    pb
}

/// Drives a progress bar from iteration callbacks.
#[derive(Default)]
struct ProgressReporter {
    bar: Option<ProgressBar>,
}

impl IterationObserver for ProgressReporter {
    fn on_start(&mut self, algorithm: IterativeAlgorithm, total_iterations: usize) {
        self.bar = Some(create_progress_bar(total_iterations as u64, algorithm.describe()));
    }

    fn on_iteration(&mut self, algorithm: IterativeAlgorithm, completed: usize, objective: Option<f64>) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed as u64);
            if let Some(objective) = objective {
                bar.set_message(format!("{algorithm} (objective {objective:.6e})"));
            }
        }
    }

    fn on_finish(&mut self, _algorithm: IterativeAlgorithm) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

/// Everything a subcommand needs before it touches data.
struct Job {
    config: JobConfig,
    coordinator: Coordinator,
    sink: Option<FsSink>,
}

impl Job {
    fn publish(&self, stage: &str, result: &GlobalResult) -> CliResult {
        if let Some(sink) = &self.sink {
            sink.publish(stage, result)?;
            println!("Tables written to '{}'.", sink.root().join(stage).display());
        }
        Ok(())
    }

    fn put_partition_tables(&self, stage: &str, name: &str, tables: &[(PartitionIndex, Array2<f64>)]) -> CliResult {
        if let Some(sink) = &self.sink {
            for (index, table) in tables {
                sink.put_table(&ArtifactKey::partition(stage, name, *index), table)?;
            }
        }
        Ok(())
    }

    fn require_sink(&self) -> Result<&FsSink, Box<dyn Error>> {
        self.sink
            .as_ref()
            .ok_or_else(|| "staged runs need --output to share results between steps".into())
    }
}

fn setup(common: &CommonArgs) -> Result<Job, Box<dyn Error>> {
    let config = match &common.config {
        Some(path) => JobConfig::load(path)?,
        None => JobConfig::default(),
    };
    let workers = common
        .workers
        .filter(|&n| n > 0)
        .unwrap_or_else(|| config.resolved_workers());
    let coordinator = Coordinator::with_workers(workers)?;
    let sink = common.output.as_ref().map(FsSink::new).transpose()?;
    Ok(Job {
        config,
        coordinator,
        sink,
    })
}

fn task_context(common: &CommonArgs) -> Result<Option<TaskContext>, Box<dyn Error>> {
    match (common.task_ordinal, common.total_tasks) {
        (Some(ordinal), Some(total)) => Ok(Some(TaskContext::new(ordinal, total)?)),
        (None, None) => Ok(None),
        _ => Err("--task-ordinal and --total-tasks must be given together".into()),
    }
}

/// Loader for the main input. `--features` only describes this data.
fn loader(common: &CommonArgs, config: &JobConfig, format: DataFormat) -> Result<DatasetLoader, Box<dyn Error>> {
    let loader = partition_loader(common, config, format)?;
    Ok(match common.features {
        Some(p) => loader.with_features(p),
        None => loader,
    })
}

/// Loader for label and response files that follow the input's partitioning
/// but keep their own width.
fn partition_loader(
    common: &CommonArgs,
    config: &JobConfig,
    format: DataFormat,
) -> Result<DatasetLoader, Box<dyn Error>> {
    let scheme = match common.scheme {
        SchemeCli::Suffix => PartitionScheme::FileSuffix,
        SchemeCli::Order => PartitionScheme::FileOrder,
        SchemeCli::Chunks => PartitionScheme::RowChunks {
            max_rows: config.max_rows_per_block,
        },
        SchemeCli::Strided => PartitionScheme::Strided(
            task_context(common)?.ok_or("the strided scheme needs --task-ordinal and --total-tasks")?,
        ),
    };
    Ok(DatasetLoader::new(format).with_scheme(scheme))
}

fn input_path(common: &CommonArgs) -> Result<&Path, Box<dyn Error>> {
    common
        .input
        .as_deref()
        .ok_or_else(|| "--input is required for this command".into())
}

fn format_of(common: &CommonArgs) -> DataFormat {
    match common.format {
        FormatCli::Dense => DataFormat::Dense,
        FormatCli::Csr => DataFormat::Csr,
    }
}

fn load(common: &CommonArgs, config: &JobConfig) -> Result<PartitionedDataset, Box<dyn Error>> {
    Ok(loader(common, config, format_of(common))?.load(input_path(common)?)?)
}

fn print_table(name: &str, table: &Array2<f64>) {
    println!("{name} ({} x {}):", table.nrows(), table.ncols());
    let shown = table.nrows().min(PREVIEW_ROWS);
    print!("{}", format_table(&table.slice(s![..shown, ..]).to_owned()));
    if shown < table.nrows() {
        println!("... {} more rows", table.nrows() - shown);
    }
}

fn print_result(title: &str, result: &GlobalResult) {
    println!("\n{title}");
    for (name, table) in result {
        print_table(name, table);
    }
}

fn run_moments(common: CommonArgs) -> CliResult {
    let job = setup(&common)?;
    let inputs = load(&common, &job.config)?.into_inputs();
    let result = job.coordinator.aggregate(&LowOrderMoments, &inputs)?;
    print_result("Low-order moments", &result);
    job.publish("low_order_moments", &result)
}

fn run_covariance(common: CommonArgs, correlation: bool) -> CliResult {
    let job = setup(&common)?;
    let inputs = load(&common, &job.config)?.into_inputs();
    let output = if correlation {
        CovarianceOutput::Correlation
    } else {
        CovarianceOutput::Covariance
    };
    let result = job.coordinator.aggregate(&Covariance { output }, &inputs)?;
    print_result("Covariance", &result);
    job.publish("covariance", &result)
}

fn run_pca(common: CommonArgs, method: Option<PcaMethodCli>) -> CliResult {
    let job = setup(&common)?;
    let inputs = load(&common, &job.config)?.into_inputs();
    let method = match method {
        Some(PcaMethodCli::Correlation) => PcaMethod::Correlation,
        Some(PcaMethodCli::Svd) => PcaMethod::Svd,
        None => job.config.pca.method,
    };
    let result = match method {
        PcaMethod::Correlation => job.coordinator.aggregate(&PcaCorrelation, &inputs)?,
        PcaMethod::Svd => job.coordinator.aggregate(&PcaSvd, &inputs)?,
    };
    print_result("Principal component analysis", &result);
    job.publish("pca", &result)
}

fn run_decomposition<D>(common: CommonArgs, op: &D, stage: &str) -> CliResult
where
    D: Decomposition<Input = coalesce::PartitionBlock>,
{
    let job = setup(&common)?;
    let inputs = load(&common, &job.config)?.into_inputs();
    let factorization = job.coordinator.decompose(op, &inputs)?;
    print_result(stage, &factorization.global);
    for (index, factor) in factorization.factors.iter().take(1) {
        print_table(&format!("{}x{index}", D::FACTOR), factor);
    }
    job.publish(stage, &factorization.global)?;
    job.put_partition_tables(stage, D::FACTOR, &factorization.factors)
}

fn run_staged<D>(common: CommonArgs, op: &D, stage: &str, step: u8) -> CliResult
where
    D: Decomposition<Input = coalesce::PartitionBlock>,
{
    let job = setup(&common)?;
    let sink = job.require_sink()?;
    let staged = StagedDecomposition::new(op, sink, stage);
    match step {
        1 => {
            let inputs = load(&common, &job.config)?.into_inputs();
            let written = staged.run_step1(&job.coordinator, &inputs)?;
            println!("Step 1 stored {} partition(s) under '{stage}'.", written.len());
        }
        2 => {
            let global = staged.run_step2()?;
            print_result(stage, &global);
        }
        _ => {
            let mut pending = staged.pending_step3()?;
            if let Some(ctx) = task_context(&common)? {
                pending.retain(|index| index.get() % ctx.total_tasks() == ctx.ordinal());
            }
            let factors = staged.run_step3(&job.coordinator, &pending)?;
            println!("Step 3 stored {} '{}' factor(s) under '{stage}'.", factors.len(), D::FACTOR);
        }
    }
    Ok(())
}

fn run_kmeans(common: CommonArgs, clusters: Option<usize>, iterations: Option<usize>) -> CliResult {
    let job = setup(&common)?;
    let inputs = load(&common, &job.config)?.into_inputs();
    let mut params = job.config.kmeans.clone();
    params.n_clusters = clusters.unwrap_or(params.n_clusters);
    params.max_iterations = iterations.unwrap_or(params.max_iterations);

    let mut progress = ProgressReporter::default();
    let KmeansResult {
        centroids,
        objective,
        iterations,
        tables,
    } = kmeans::run_kmeans(&job.coordinator, &inputs, &params, &mut progress)?;
    println!("K-means finished after {iterations} iteration(s); objective {objective:.6e}.");
    print_result("K-means", &tables);

    let assignments = job.coordinator.executor().execute("kmeans/assign", &inputs, |index, block| {
        kmeans::assign(block, &centroids).map_err(PipelineError::stage("kmeans/assign", index))
    })?;
    job.publish("kmeans", &tables)?;
    job.put_partition_tables("kmeans", "assignments", &assignments)
}

fn run_naive_bayes(
    common: CommonArgs,
    labels: PathBuf,
    test: Option<PathBuf>,
    classes: Option<usize>,
) -> CliResult {
    let job = setup(&common)?;
    let data = load(&common, &job.config)?;
    let label_data = partition_loader(&common, &job.config, DataFormat::Dense)?.load(&labels)?;
    let inputs = join_labels(data, label_data)?;

    let mut params = job.config.naive_bayes.clone();
    params.n_classes = classes.unwrap_or(params.n_classes);
    let result = job.coordinator.aggregate(&NaiveBayesTraining { params }, &inputs)?;
    print_result("Naive Bayes model", &result);
    job.publish("naive_bayes", &result)?;

    if let Some(test) = test {
        let model = NaiveBayesModel::from_tables(&result)?;
        let blocks = loader(&common, &job.config, format_of(&common))?.load(&test)?.into_inputs();
        let predictions = job.coordinator.executor().execute("naive_bayes/predict", &blocks, |index, block| {
            model
                .predict(block)
                .map_err(PipelineError::stage("naive_bayes/predict", index))
        })?;
        for (index, labels) in predictions.iter().take(1) {
            print_table(&format!("predictionsx{index}"), labels);
        }
        job.put_partition_tables("naive_bayes", "predictions", &predictions)?;
    }
    Ok(())
}

fn run_linreg(
    common: CommonArgs,
    regressors: Option<usize>,
    method: Option<RegressionMethodCli>,
    test: Option<PathBuf>,
) -> CliResult {
    let job = setup(&common)?;
    let settings = &job.config.linear_regression;
    let n_features = regressors
        .or(settings.n_features)
        .ok_or("linear regression needs --regressors or linear_regression.n_features")?;
    let method = match method {
        Some(RegressionMethodCli::Normeq) => RegressionMethod::NormalEquations,
        Some(RegressionMethodCli::Qr) => RegressionMethod::Qr,
        None => settings.method,
    };
    let inputs = split_columns(load(&common, &job.config)?, n_features)?;
    let result = match method {
        RegressionMethod::NormalEquations => job.coordinator.aggregate(&NormalEquationsTraining, &inputs)?,
        RegressionMethod::Qr => job.coordinator.aggregate(&QrTraining, &inputs)?,
    };
    print_result("Linear regression model", &result);
    job.publish("linear_regression", &result)?;

    if let Some(test) = test {
        let beta = result.require("beta")?;
        let blocks = split_columns(
            partition_loader(&common, &job.config, DataFormat::Dense)?.load(&test)?,
            n_features,
        )?;
        let predictions = job.coordinator.executor().execute("linear_regression/predict", &blocks, |index, block| {
            linear_regression::predict(&block.data, beta)
                .map_err(PipelineError::stage("linear_regression/predict", index))
        })?;
        for (index, predicted) in predictions.iter().take(1) {
            print_table(&format!("predictionsx{index}"), predicted);
        }
        job.put_partition_tables("linear_regression", "predictions", &predictions)?;
    }
    Ok(())
}

fn run_als(common: CommonArgs, factors: Option<usize>, iterations: Option<usize>) -> CliResult {
    let job = setup(&common)?;
    let inputs = load(&common, &job.config)?.into_inputs();
    let mut params = job.config.als.clone();
    params.n_factors = factors.unwrap_or(params.n_factors);
    params.max_iterations = iterations.unwrap_or(params.max_iterations);

    let mut progress = ProgressReporter::default();
    let model: AlsModel = implicit_als::train(&job.coordinator, inputs, &params, &mut progress)?;
    println!(
        "Implicit ALS trained {} user and {} item factor rows.",
        model.user_layout.total_rows(),
        model.item_layout.total_rows()
    );

    let users: Vec<_> = model.users.iter().map(|(i, m)| (*i, m.factors.clone())).collect();
    let items: Vec<_> = model.items.iter().map(|(i, m)| (*i, m.factors.clone())).collect();
    if let Some((index, first)) = users.first() {
        print_table(&format!("usersx{index}"), first);
    }
    job.put_partition_tables("implicit_als", "users", &users)?;
    job.put_partition_tables("implicit_als", "items", &items)?;

    let ratings = implicit_als::predict_ratings(&job.coordinator, &model)?;
    if let Some((user_index, row)) = ratings.first() {
        if let Some((item_index, table)) = row.first() {
            print_table(&format!("ratingsx{user_index}x{item_index}"), table);
        }
    }
    for (user_index, row) in &ratings {
        job.put_partition_tables("implicit_als", &format!("ratingsx{user_index}"), row)?;
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Moments(common)) => run_moments(common),
        Some(Commands::Covariance {
            common,
            correlation,
        }) => run_covariance(common, correlation),
        Some(Commands::Pca { common, method }) => run_pca(common, method),
        Some(Commands::Qr(common)) => run_decomposition(common, &Qr, "qr"),
        Some(Commands::Svd(common)) => run_decomposition(common, &Svd, "svd"),
        Some(Commands::QrStaged { common, step }) => run_staged(common, &Qr, "qr", step),
        Some(Commands::SvdStaged { common, step }) => run_staged(common, &Svd, "svd", step),
        Some(Commands::Kmeans {
            common,
            clusters,
            iterations,
        }) => run_kmeans(common, clusters, iterations),
        Some(Commands::NaiveBayes {
            common,
            labels,
            test,
            classes,
        }) => run_naive_bayes(common, labels, test, classes),
        Some(Commands::Linreg {
            common,
            regressors,
            method,
            test,
        }) => run_linreg(common, regressors, method, test),
        Some(Commands::Als {
            common,
            factors,
            iterations,
        }) => run_als(common, factors, iterations),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
