//! The pipeline coordinator.
//!
//! Every round follows the same rule: no step starts until every input it
//! depends on has been produced by the previous step. Values cross from one
//! step to the next only as envelopes, and everything a round needs is passed
//! in explicitly.

use crate::envelope::Envelope;
use crate::error::PipelineError;
use crate::local::{LocalExecutor, StageSpan};
use crate::master;
use crate::operation::{Aggregation, AlternatingRound, Decomposition};
use crate::types::{GlobalResult, KeyedPartialCollection, PartitionIndex};
use log::debug;
use ndarray::Array2;
use std::collections::{BTreeMap, BTreeSet};

/// Output of a three-step decomposition: the master's global tables and one
/// factor block per partition, in index order.
#[derive(Clone, Debug)]
pub struct Factorization {
    pub global: GlobalResult,
    pub factors: Vec<(PartitionIndex, Array2<f64>)>,
}

/// Checks that a keyed collection addresses exactly the partitions alive in the round.
pub fn check_routes<T>(
    stage: &'static str,
    alive: &BTreeSet<PartitionIndex>,
    routed: &KeyedPartialCollection<T>,
) -> Result<(), PipelineError> {
    if let Some(destination) = routed.keys().find(|k| !alive.contains(k)) {
        return Err(PipelineError::UnknownDestination { stage, destination });
    }
    if let Some(&partition) = alive.iter().find(|k| !routed.contains(**k)) {
        return Err(PipelineError::MissingRoute { stage, partition });
    }
    Ok(())
}

/// Master half of a decomposition: merges step-1 envelopes and packs the
/// routed entries, keyed by destination, for step 3.
pub fn decomposition_step2<D: Decomposition>(
    op: &D,
    for_master: Vec<Envelope>,
) -> Result<(GlobalResult, KeyedPartialCollection<Envelope>), PipelineError> {
    let stage = D::STEP2;
    let span = StageSpan::enter(stage, for_master.len());
    let partials = master::collect::<D::ForMaster>(stage, for_master)?;
    let alive: BTreeSet<PartitionIndex> = partials.iter().map(|(index, _)| *index).collect();

    let (global, routed) = op.step2(partials).map_err(PipelineError::master(stage))?;
    check_routes(stage, &alive, &routed)?;

    let packed = routed
        .into_iter()
        .map(|(destination, entry)| {
            Envelope::wrap(&entry, PartitionIndex::MASTER)
                .map(|envelope| (destination, envelope))
                .map_err(PipelineError::transfer(stage, destination))
        })
        .collect::<Result<KeyedPartialCollection<_>, _>>()?;
    span.complete();
    Ok((global, packed))
}

/// Pairs each partition's cached step-1 output with its routed step-2 entry.
pub fn join_by_index(
    stage: &'static str,
    cached: BTreeMap<PartitionIndex, Envelope>,
    mut routed: KeyedPartialCollection<Envelope>,
) -> Result<Vec<(PartitionIndex, (Envelope, Envelope))>, PipelineError> {
    let mut joined = Vec::with_capacity(cached.len());
    for (index, cache) in cached {
        let entry = routed.remove(index).ok_or(PipelineError::MissingRoute {
            stage,
            partition: index,
        })?;
        joined.push((index, (cache, entry)));
    }
    if let Some(destination) = routed.keys().next() {
        return Err(PipelineError::UnknownDestination { stage, destination });
    }
    Ok(joined)
}

pub struct Coordinator {
    executor: LocalExecutor,
}

impl Coordinator {
    pub fn new(executor: LocalExecutor) -> Self {
        Self { executor }
    }

    pub fn with_workers(workers: usize) -> Result<Self, PipelineError> {
        Ok(Self::new(LocalExecutor::new(workers)?))
    }

    pub fn executor(&self) -> &LocalExecutor {
        &self.executor
    }

    /// Local step on every partition, then one merge at the master.
    pub fn aggregate<A: Aggregation>(
        &self,
        op: &A,
        inputs: &[(PartitionIndex, A::Input)],
    ) -> Result<GlobalResult, PipelineError> {
        let partials = self
            .executor
            .run(A::LOCAL_STAGE, inputs, |index, input| op.local(index, input))?;
        master::merge(op, partials)
    }

    /// Step 1 of a decomposition: per partition, the master-bound envelope
    /// and the envelope cached for step 3.
    pub fn decomposition_step1<D: Decomposition>(
        &self,
        op: &D,
        inputs: &[(PartitionIndex, D::Input)],
    ) -> Result<Vec<(PartitionIndex, (Envelope, Envelope))>, PipelineError> {
        let stage = D::STEP1;
        self.executor.execute(stage, inputs, |index, input| {
            let (for_master, cached) = op.step1(input).map_err(PipelineError::stage(stage, index))?;
            let for_master =
                Envelope::wrap(&for_master, index).map_err(PipelineError::transfer(stage, index))?;
            let cached =
                Envelope::wrap(&cached, index).map_err(PipelineError::transfer(stage, index))?;
            Ok((for_master, cached))
        })
    }

    /// Step 3 of a decomposition on already joined inputs.
    pub fn decomposition_step3<D: Decomposition>(
        &self,
        op: &D,
        joined: Vec<(PartitionIndex, (Envelope, Envelope))>,
    ) -> Result<Vec<(PartitionIndex, Array2<f64>)>, PipelineError> {
        let stage = D::STEP3;
        self.executor
            .execute_owned(stage, joined, |index, (cached, routed)| {
                let cached = cached
                    .unwrap::<D::Cached>()
                    .map_err(PipelineError::transfer(stage, index))?;
                let routed = routed
                    .unwrap::<D::Routed>()
                    .map_err(PipelineError::transfer(stage, index))?;
                op.step3(cached, routed)
                    .map_err(PipelineError::stage(stage, index))
            })
    }

    /// Runs all three steps with a full barrier before step 3.
    pub fn decompose<D: Decomposition>(
        &self,
        op: &D,
        inputs: &[(PartitionIndex, D::Input)],
    ) -> Result<Factorization, PipelineError> {
        // --- Step 1: independent per partition ---
        let outputs = self.decomposition_step1(op, inputs)?;
        let mut for_master = Vec::with_capacity(outputs.len());
        let mut cached = BTreeMap::new();
        for (index, (to_master, to_self)) in outputs {
            for_master.push(to_master);
            cached.insert(index, to_self);
        }

        // --- Step 2: barrier, then the master merge ---
        let (global, routed) = decomposition_step2(op, for_master)?;

        // --- Step 3: each partition joins its cache with its routed entry ---
        let joined = join_by_index(D::STEP3, cached, routed)?;
        let factors = self.decomposition_step3(op, joined)?;
        Ok(Factorization { global, factors })
    }

    /// One half-iteration of an alternating factorization.
    ///
    /// `models` and `routing` belong to the side held fixed and must share
    /// their indices; `data` belongs to the side being solved. Returns the new
    /// model blocks, one per data partition.
    pub fn half_iteration<R: AlternatingRound>(
        &self,
        round: &R,
        models: &[(PartitionIndex, R::Model)],
        routing: &[(PartitionIndex, R::Routing)],
        data: &[(PartitionIndex, R::Data)],
    ) -> Result<Vec<(PartitionIndex, R::Model)>, PipelineError> {
        // --- Step 1: summarize each fixed-side block ---
        let summaries = self
            .executor
            .run(R::STEP1, models, |_, model| round.step1(model))?;

        // --- Step 2: merge, then pack once for replication ---
        let partials = master::collect::<R::Summary>(R::STEP2, summaries)?;
        let merged = round
            .step2(partials)
            .map_err(PipelineError::master(R::STEP2))?;
        let broadcast = Envelope::wrap(&merged, PartitionIndex::MASTER)
            .map_err(PipelineError::transfer(R::STEP2, PartitionIndex::MASTER))?;
        drop(merged);

        // --- Step 3: cut each fixed-side block into shipments ---
        let routes: BTreeMap<PartitionIndex, &R::Routing> =
            routing.iter().map(|(index, r)| (*index, r)).collect();
        let paired = models
            .iter()
            .map(|(index, model)| {
                routes
                    .get(index)
                    .map(|r| (*index, (model, *r)))
                    .ok_or(PipelineError::MissingRoute {
                        stage: R::STEP3,
                        partition: *index,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let destinations: BTreeSet<PartitionIndex> = data.iter().map(|(index, _)| *index).collect();

        let shipped = self
            .executor
            .execute(R::STEP3, &paired, |index, (model, routing)| {
                let outgoing = round
                    .step3(model, routing)
                    .map_err(PipelineError::stage(R::STEP3, index))?;
                outgoing
                    .into_iter()
                    .map(|(destination, shipment)| {
                        if !destinations.contains(&destination) {
                            return Err(PipelineError::UnknownDestination {
                                stage: R::STEP3,
                                destination,
                            });
                        }
                        Envelope::wrap(&shipment, index)
                            .map(|envelope| (destination, envelope))
                            .map_err(PipelineError::transfer(R::STEP3, index))
                    })
                    .collect::<Result<Vec<_>, _>>()
            })?;

        // --- Redistribution: every shipment lands in its destination's inbox ---
        let mut inboxes: BTreeMap<PartitionIndex, Vec<Envelope>> =
            destinations.iter().map(|d| (*d, Vec::new())).collect();
        let mut shipments = 0usize;
        for (_, outgoing) in shipped {
            for (destination, envelope) in outgoing {
                if let Some(inbox) = inboxes.get_mut(&destination) {
                    inbox.push(envelope);
                    shipments += 1;
                }
            }
        }
        debug!(
            "Redistributed {shipments} shipments to {} partitions.",
            inboxes.len()
        );

        // --- Step 4: solve each data partition from its own inbox ---
        let work: Vec<(PartitionIndex, (&R::Data, Vec<Envelope>))> = data
            .iter()
            .map(|(index, block)| (*index, (block, inboxes.remove(index).unwrap_or_default())))
            .collect();
        self.executor
            .execute_owned(R::STEP4, work, |index, (block, inbox)| {
                let merged = broadcast
                    .open::<R::Merged>()
                    .map_err(PipelineError::transfer(R::STEP4, index))?;
                let mut received = KeyedPartialCollection::new();
                for envelope in inbox {
                    let sender = envelope.partition();
                    let shipment = envelope
                        .unwrap::<R::Shipment>()
                        .map_err(PipelineError::transfer(R::STEP4, sender))?;
                    if received.insert(sender, shipment).is_some() {
                        return Err(PipelineError::TaskRestartInconsistency {
                            stage: R::STEP4,
                            index: sender,
                        });
                    }
                }
                round
                    .step4(block, merged, received)
                    .map_err(PipelineError::stage(R::STEP4, index))
            })
    }
}
