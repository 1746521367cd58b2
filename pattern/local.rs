//! The local-step executor: runs one step independently on every partition.

use crate::envelope::{Envelope, Payload};
use crate::error::{KernelError, PipelineError};
use crate::types::PartitionIndex;
use log::{debug, info};
use rayon::prelude::*;
use std::time::Instant;

/// Logs entry to and exit from a stage. The exit line is written on every
/// path out of the stage, failures included.
pub struct StageSpan {
    stage: &'static str,
    started: Instant,
    completed: bool,
}

impl StageSpan {
    pub fn enter(stage: &'static str, partitions: usize) -> Self {
        debug!("Stage '{stage}' starting on {partitions} partition(s).");
        Self {
            stage,
            started: Instant::now(),
            completed: false,
        }
    }

    pub fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for StageSpan {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        if self.completed {
            info!("Stage '{}' finished in {:.2?}.", self.stage, elapsed);
        } else {
            info!("Stage '{}' aborted after {:.2?}.", self.stage, elapsed);
        }
    }
}

/// Owns the worker pool that local steps run on.
///
/// Steps receive only their own partition's input plus shared read-only
/// context, so they may run concurrently in any order.
pub struct LocalExecutor {
    pool: rayon::ThreadPool,
}

impl LocalExecutor {
    pub fn new(workers: usize) -> Result<Self, PipelineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("coalesce-local-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `step` on every input and returns the outputs in input order.
    /// The first failure aborts the whole stage.
    pub fn execute<I, O, F>(
        &self,
        stage: &'static str,
        inputs: &[(PartitionIndex, I)],
        step: F,
    ) -> Result<Vec<(PartitionIndex, O)>, PipelineError>
    where
        I: Sync,
        O: Send,
        F: Fn(PartitionIndex, &I) -> Result<O, PipelineError> + Sync,
    {
        let span = StageSpan::enter(stage, inputs.len());
        let outputs = self.pool.install(|| {
            inputs
                .par_iter()
                .map(|(index, input)| step(*index, input).map(|out| (*index, out)))
                .collect::<Result<Vec<_>, _>>()
        })?;
        span.complete();
        Ok(outputs)
    }

    /// Like [`execute`](Self::execute), consuming the inputs.
    pub fn execute_owned<I, O, F>(
        &self,
        stage: &'static str,
        inputs: Vec<(PartitionIndex, I)>,
        step: F,
    ) -> Result<Vec<(PartitionIndex, O)>, PipelineError>
    where
        I: Send,
        O: Send,
        F: Fn(PartitionIndex, I) -> Result<O, PipelineError> + Sync,
    {
        let span = StageSpan::enter(stage, inputs.len());
        let outputs = self.pool.install(|| {
            inputs
                .into_par_iter()
                .map(|(index, input)| step(index, input).map(|out| (index, out)))
                .collect::<Result<Vec<_>, _>>()
        })?;
        span.complete();
        Ok(outputs)
    }

    /// Runs a kernel on every partition and packs each result for transport.
    pub fn run<I, P, F>(
        &self,
        stage: &'static str,
        inputs: &[(PartitionIndex, I)],
        kernel: F,
    ) -> Result<Vec<Envelope>, PipelineError>
    where
        I: Sync,
        P: Payload,
        F: Fn(PartitionIndex, &I) -> Result<P, KernelError> + Sync,
    {
        let packed = self.execute(stage, inputs, |index, input| {
            let partial = kernel(index, input).map_err(PipelineError::stage(stage, index))?;
            Envelope::wrap(&partial, index).map_err(PipelineError::transfer(stage, index))
        })?;
        Ok(packed.into_iter().map(|(_, envelope)| envelope).collect())
    }
}
