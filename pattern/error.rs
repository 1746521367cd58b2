use crate::config::ConfigError;
use crate::envelope::EnvelopeError;
use crate::loader::LoadError;
use crate::sink::SinkError;
use crate::types::PartitionIndex;
use ndarray_linalg::error::LinalgError;
use thiserror::Error;

/// Failures raised inside an algorithm kernel, independent of where it runs.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Required input table '{0}' is missing.")]
    MissingTable(String),

    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("At least {required} observations are needed but only {found} were supplied.")]
    InsufficientObservations { required: usize, found: usize },

    #[error("Label {value} in row {row} is not a class in 0..{n_classes}.")]
    InvalidLabel {
        row: usize,
        value: f64,
        n_classes: usize,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Factors of entity {0} were not shipped to this partition.")]
    MissingFactor(usize),

    #[error("Tables could not be assembled: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Numerical failure: {0}")]
    Numerical(String),

    #[error("Linear algebra backend failed: {0}")]
    Linalg(#[from] LinalgError),
}

/// Everything that can stop a job, tagged with the stage that raised it.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Stage '{stage}' failed on partition {partition}: {source}")]
    Stage {
        stage: &'static str,
        partition: PartitionIndex,
        #[source]
        source: KernelError,
    },

    #[error("Master stage '{stage}' failed: {source}")]
    Master {
        stage: &'static str,
        #[source]
        source: KernelError,
    },

    #[error("Stage '{stage}' could not transfer the result of partition {partition}: {source}")]
    Transfer {
        stage: &'static str,
        partition: PartitionIndex,
        #[source]
        source: EnvelopeError,
    },

    #[error("Stage '{stage}' received no partial results.")]
    EmptyInput { stage: &'static str },

    #[error(
        "Stage '{stage}' received partition {index} more than once. The total task count must stay fixed for the lifetime of a job."
    )]
    TaskRestartInconsistency {
        stage: &'static str,
        index: PartitionIndex,
    },

    #[error("Stage '{stage}' addressed partition {destination}, which is not part of this round.")]
    UnknownDestination {
        stage: &'static str,
        destination: PartitionIndex,
    },

    #[error("Stage '{stage}' has no input for partition {partition}.")]
    MissingRoute {
        stage: &'static str,
        partition: PartitionIndex,
    },

    #[error("Stage '{stage}' never finished partition {partition}. Run it again before merging.")]
    IncompleteStage {
        stage: &'static str,
        partition: PartitionIndex,
    },

    #[error("Failed to build the local worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl PipelineError {
    /// Attaches a master-side stage name to a kernel failure.
    pub fn master(stage: &'static str) -> impl FnOnce(KernelError) -> PipelineError {
        move |source| PipelineError::Master { stage, source }
    }

    /// Attaches a stage name and partition to a kernel failure.
    pub fn stage(
        stage: &'static str,
        partition: PartitionIndex,
    ) -> impl FnOnce(KernelError) -> PipelineError {
        move |source| PipelineError::Stage {
            stage,
            partition,
            source,
        }
    }

    pub fn transfer(
        stage: &'static str,
        partition: PartitionIndex,
    ) -> impl FnOnce(EnvelopeError) -> PipelineError {
        move |source| PipelineError::Transfer {
            stage,
            partition,
            source,
        }
    }
}
