//! Decompositions split across separate jobs.
//!
//! When no process survives from one step to the next, every intermediate
//! value goes through a [`ResultSink`] keyed by partition index:
//!
//! | job | reads                                   | writes                                   |
//! |-----|-----------------------------------------|------------------------------------------|
//! | 1   | input blocks                            | `step1ForStep2x<i>`, `step1ForStep3x<i>`, `step1Completex<i>` |
//! | 2   | every `step1ForStep2x<i>`               | `step2ForStep3x<i>`, global tables       |
//! | 3   | `step1ForStep3x<i>`, `step2ForStep3x<i>` | the factor table `<FACTOR>x<i>`          |
//!
//! `step1Completex<i>` is written only after every partition of a job-1 call
//! has stored both of its outputs, and is removed when a call starts. Job 2
//! refuses to merge a `step1ForStep2x<i>` without it.

use crate::envelope::{Envelope, Payload};
use crate::error::PipelineError;
use crate::operation::Decomposition;
use crate::pipeline::{Coordinator, decomposition_step2};
use crate::sink::{ArtifactKey, ResultSink};
use crate::types::{GlobalResult, PartitionIndex};
use log::{info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const STEP1_FOR_STEP2: &str = "step1ForStep2";
pub const STEP1_FOR_STEP3: &str = "step1ForStep3";
pub const STEP2_FOR_STEP3: &str = "step2ForStep3";
pub const STEP1_COMPLETE: &str = "step1Complete";

#[derive(Serialize, Deserialize)]
struct Step1Complete;

impl Payload for Step1Complete {
    const TAG: &'static str = "staged/step1Complete";
}

pub struct StagedDecomposition<'a, D: Decomposition> {
    op: &'a D,
    sink: &'a dyn ResultSink,
    stage: String,
}

impl<'a, D: Decomposition> StagedDecomposition<'a, D> {
    pub fn new(op: &'a D, sink: &'a dyn ResultSink, stage: impl Into<String>) -> Self {
        Self {
            op,
            sink,
            stage: stage.into(),
        }
    }

    fn key(&self, name: &str, index: PartitionIndex) -> ArtifactKey {
        ArtifactKey::partition(self.stage.as_str(), name, index)
    }

    /// Job 1: runs step 1 on the partitions loaded by this task.
    pub fn run_step1(
        &self,
        coordinator: &Coordinator,
        inputs: &[(PartitionIndex, D::Input)],
    ) -> Result<Vec<PartitionIndex>, PipelineError> {
        for (index, _) in inputs {
            self.sink
                .remove_envelope(&self.key(STEP1_COMPLETE, *index))?;
        }
        let outputs = coordinator.decomposition_step1(self.op, inputs)?;
        let mut written = Vec::with_capacity(outputs.len());
        for (index, (for_master, cached)) in &outputs {
            self.sink
                .put_envelope(&self.key(STEP1_FOR_STEP3, *index), cached)?;
            self.sink
                .put_envelope(&self.key(STEP1_FOR_STEP2, *index), for_master)?;
            written.push(*index);
        }
        for index in &written {
            let marker = Envelope::wrap(&Step1Complete, *index)
                .map_err(PipelineError::transfer(D::STEP1, *index))?;
            self.sink
                .put_envelope(&self.key(STEP1_COMPLETE, *index), &marker)?;
        }
        info!(
            "Stored step 1 output of {} partitions under '{}'.",
            written.len(),
            self.stage
        );
        Ok(written)
    }

    /// Job 2: merges every stored step-1 output and stores the routed entries.
    pub fn run_step2(&self) -> Result<GlobalResult, PipelineError> {
        let indices = self.sink.partitions(&self.stage, STEP1_FOR_STEP2)?;
        let complete: BTreeSet<PartitionIndex> = self
            .sink
            .partitions(&self.stage, STEP1_COMPLETE)?
            .into_iter()
            .collect();
        if let Some(&partition) = indices.iter().find(|index| !complete.contains(*index)) {
            warn!(
                "Partition {partition} under '{}' has step 1 output but no completion marker.",
                self.stage
            );
            return Err(PipelineError::IncompleteStage {
                stage: D::STEP1,
                partition,
            });
        }
        let envelopes = indices
            .iter()
            .map(|index| self.sink.get_envelope(&self.key(STEP1_FOR_STEP2, *index)))
            .collect::<Result<Vec<Envelope>, _>>()?;
        let (global, routed) = decomposition_step2(self.op, envelopes)?;
        for (destination, envelope) in routed.iter() {
            self.sink
                .put_envelope(&self.key(STEP2_FOR_STEP3, destination), envelope)?;
        }
        self.sink.publish(&self.stage, &global)?;
        info!(
            "Merged {} partitions and published {} tables under '{}'.",
            indices.len(),
            global.len(),
            self.stage
        );
        Ok(global)
    }

    /// Partitions with a routed step-2 entry waiting for step 3.
    pub fn pending_step3(&self) -> Result<Vec<PartitionIndex>, PipelineError> {
        Ok(self.sink.partitions(&self.stage, STEP2_FOR_STEP3)?)
    }

    /// Job 3: finishes the given partitions. Factors are stored only once
    /// every partition of the call has succeeded.
    pub fn run_step3(
        &self,
        coordinator: &Coordinator,
        indices: &[PartitionIndex],
    ) -> Result<Vec<(PartitionIndex, Array2<f64>)>, PipelineError> {
        let joined = indices
            .iter()
            .map(|index| {
                let cached = self.sink.get_envelope(&self.key(STEP1_FOR_STEP3, *index))?;
                let routed = self.sink.get_envelope(&self.key(STEP2_FOR_STEP3, *index))?;
                Ok((*index, (cached, routed)))
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;
        let factors = coordinator.decomposition_step3(self.op, joined)?;
        for (index, factor) in &factors {
            self.sink.put_table(&self.key(D::FACTOR, *index), factor)?;
        }
        info!(
            "Stored {} '{}' factors under '{}'.",
            factors.len(),
            D::FACTOR,
            self.stage
        );
        Ok(factors)
    }
}
