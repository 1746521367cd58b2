//! The master-merge executor: the single coordination point behind every barrier.

use crate::envelope::{Envelope, Payload};
use crate::error::PipelineError;
use crate::local::StageSpan;
use crate::operation::Aggregation;
use crate::types::{GlobalResult, PartitionIndex};
use log::debug;
use std::collections::BTreeSet;

/// Opens every envelope of a round, ordered by sender.
///
/// Nothing is returned unless every envelope opens: a round with an empty
/// input, a repeated sender or an unreadable payload fails as a whole.
pub fn collect<P: Payload>(
    stage: &'static str,
    mut envelopes: Vec<Envelope>,
) -> Result<Vec<(PartitionIndex, P)>, PipelineError> {
    if envelopes.is_empty() {
        return Err(PipelineError::EmptyInput { stage });
    }
    let mut seen = BTreeSet::new();
    for envelope in &envelopes {
        if !seen.insert(envelope.partition()) {
            return Err(PipelineError::TaskRestartInconsistency {
                stage,
                index: envelope.partition(),
            });
        }
    }
    envelopes.sort_by_key(Envelope::partition);
    envelopes
        .into_iter()
        .map(|envelope| {
            let index = envelope.partition();
            envelope
                .unwrap::<P>()
                .map(|value| (index, value))
                .map_err(PipelineError::transfer(stage, index))
        })
        .collect()
}

/// Merges the partial results of one aggregation round and finalizes them.
///
/// Partials are folded in partition order, so a given set of partials always
/// produces bit-identical output however they arrived.
pub fn merge<A: Aggregation>(
    aggregation: &A,
    envelopes: Vec<Envelope>,
) -> Result<GlobalResult, PipelineError> {
    let stage = A::MERGE_STAGE;
    let span = StageSpan::enter(stage, envelopes.len());
    let partials = collect::<A::Partial>(stage, envelopes)?;
    debug!("Merging {} partial results in '{stage}'.", partials.len());

    let mut partials = partials.into_iter().map(|(_, partial)| partial);
    let first = partials
        .next()
        .ok_or(PipelineError::EmptyInput { stage })?;
    let total = partials.try_fold(first, |acc, next| {
        aggregation
            .combine(acc, next)
            .map_err(PipelineError::master(stage))
    })?;
    let result = aggregation
        .finalize(total)
        .map_err(PipelineError::master(stage))?;
    span.complete();
    Ok(result)
}
