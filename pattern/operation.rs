//! The capabilities an algorithm provides to the coordinator.
//!
//! An algorithm is one type implementing one of these traits; its payload
//! types carry the algorithm's tags on the wire. The coordinator only knows
//! which step runs where and what has to arrive before it may start.

use crate::envelope::Payload;
use crate::error::KernelError;
use crate::types::{GlobalResult, KeyedPartialCollection, PartitionIndex};
use ndarray::Array2;

/// A one-round reduction: local partials, an associative merge, a finalizer.
///
/// `combine` must be associative and commutative up to floating-point
/// rounding, so the result is independent of how the data was partitioned.
pub trait Aggregation: Sync {
    type Input: Sync;
    type Partial: Payload + Send;

    const LOCAL_STAGE: &'static str;
    const MERGE_STAGE: &'static str;

    fn local(&self, index: PartitionIndex, input: &Self::Input)
    -> Result<Self::Partial, KernelError>;

    fn combine(
        &self,
        left: Self::Partial,
        right: Self::Partial,
    ) -> Result<Self::Partial, KernelError>;

    fn finalize(&self, total: Self::Partial) -> Result<GlobalResult, KernelError>;
}

/// A three-step decomposition.
///
/// Step 1 runs per partition and yields one value for the master and one kept
/// for step 3 of the same partition. Step 2 merges every master-bound value
/// into a global result plus one routed entry per partition. Step 3 combines a
/// partition's cached value with its routed entry into its final factor.
pub trait Decomposition: Sync {
    type Input: Sync;
    type ForMaster: Payload + Send;
    type Cached: Payload + Send;
    type Routed: Payload + Send;

    const STEP1: &'static str;
    const STEP2: &'static str;
    const STEP3: &'static str;
    /// Name under which per-partition factors are published.
    const FACTOR: &'static str;

    fn step1(&self, input: &Self::Input) -> Result<(Self::ForMaster, Self::Cached), KernelError>;

    /// `partials` arrive ordered by partition index.
    fn step2(
        &self,
        partials: Vec<(PartitionIndex, Self::ForMaster)>,
    ) -> Result<(GlobalResult, KeyedPartialCollection<Self::Routed>), KernelError>;

    fn step3(&self, cached: Self::Cached, routed: Self::Routed)
    -> Result<Array2<f64>, KernelError>;
}

/// One half-iteration of an alternating factorization.
///
/// The side being solved owns `Data`; the other side owns the current `Model`
/// blocks and their `Routing`. Step 1 summarizes each model block, step 2
/// merges the summaries, step 3 cuts each model block into shipments keyed by
/// the data partitions that need them, and step 4 solves every data partition
/// from the merged summary and all shipments addressed to it.
pub trait AlternatingRound: Sync {
    type Data: Sync;
    type Model: Payload + Send + Sync;
    type Routing: Sync;
    type Summary: Payload + Send;
    type Merged: Payload + Send + Sync;
    type Shipment: Payload + Send;

    const STEP1: &'static str;
    const STEP2: &'static str;
    const STEP3: &'static str;
    const STEP4: &'static str;

    fn step1(&self, model: &Self::Model) -> Result<Self::Summary, KernelError>;

    fn step2(
        &self,
        summaries: Vec<(PartitionIndex, Self::Summary)>,
    ) -> Result<Self::Merged, KernelError>;

    fn step3(
        &self,
        model: &Self::Model,
        routing: &Self::Routing,
    ) -> Result<KeyedPartialCollection<Self::Shipment>, KernelError>;

    /// `received` is keyed by the sending partition.
    fn step4(
        &self,
        data: &Self::Data,
        merged: Self::Merged,
        received: KeyedPartialCollection<Self::Shipment>,
    ) -> Result<Self::Model, KernelError>;
}
