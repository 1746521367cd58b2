use coalesce::kernels::NoopIterationObserver;
use coalesce::kernels::implicit_als::{self, AlsParams};
use coalesce::operation::AlternatingRound;
use coalesce::{Coordinator, CsrBlock, KernelError, KeyedPartialCollection, Payload, PartitionBlock, PartitionIndex, PipelineError};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Count(u64);

impl Payload for Count {
    const TAG: &'static str = "test/count";
}

/// Each model block ships its count to the listed partitions; each data
/// partition reports `100 * total + sum of what it received`.
struct Relay;

impl AlternatingRound for Relay {
    type Data = ();
    type Model = Count;
    type Routing = Vec<u32>;
    type Summary = Count;
    type Merged = Count;
    type Shipment = Count;

    const STEP1: &'static str = "relay/step1";
    const STEP2: &'static str = "relay/step2";
    const STEP3: &'static str = "relay/step3";
    const STEP4: &'static str = "relay/step4";

    fn step1(&self, model: &Count) -> Result<Count, KernelError> {
        Ok(model.clone())
    }

    fn step2(&self, summaries: Vec<(PartitionIndex, Count)>) -> Result<Count, KernelError> {
        Ok(Count(summaries.iter().map(|(_, c)| c.0).sum()))
    }

    fn step3(&self, model: &Count, routing: &Vec<u32>) -> Result<KeyedPartialCollection<Count>, KernelError> {
        Ok(routing
            .iter()
            .map(|d| (PartitionIndex(*d), model.clone()))
            .collect())
    }

    fn step4(
        &self,
        _data: &(),
        merged: Count,
        received: KeyedPartialCollection<Count>,
    ) -> Result<Count, KernelError> {
        Ok(Count(merged.0 * 100 + received.iter().map(|(_, c)| c.0).sum::<u64>()))
    }
}

fn models() -> Vec<(PartitionIndex, Count)> {
    vec![(PartitionIndex(0), Count(1)), (PartitionIndex(1), Count(2))]
}

fn data() -> Vec<(PartitionIndex, ())> {
    vec![(PartitionIndex(10), ()), (PartitionIndex(11), ())]
}

#[test]
fn shipments_reach_their_destinations() {
    let coordinator = Coordinator::with_workers(2).unwrap();
    let routing = vec![(PartitionIndex(0), vec![10]), (PartitionIndex(1), vec![10, 11])];
    let out = coordinator
        .half_iteration(&Relay, &models(), &routing, &data())
        .unwrap();
    assert_eq!(
        out,
        vec![(PartitionIndex(10), Count(303)), (PartitionIndex(11), Count(302))]
    );
}

#[test]
fn partitions_without_shipments_still_run() {
    let coordinator = Coordinator::with_workers(2).unwrap();
    let routing = vec![(PartitionIndex(0), vec![]), (PartitionIndex(1), vec![11])];
    let out = coordinator
        .half_iteration(&Relay, &models(), &routing, &data())
        .unwrap();
    assert_eq!(out[0], (PartitionIndex(10), Count(300)));
}

#[test]
fn shipments_to_dead_partitions_are_rejected() {
    let coordinator = Coordinator::with_workers(2).unwrap();
    let routing = vec![(PartitionIndex(0), vec![10]), (PartitionIndex(1), vec![12])];
    let err = coordinator
        .half_iteration(&Relay, &models(), &routing, &data())
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::UnknownDestination {
            destination: PartitionIndex(12),
            ..
        }
    ));
}

#[test]
fn a_model_block_without_routing_is_rejected() {
    let coordinator = Coordinator::with_workers(2).unwrap();
    let routing = vec![(PartitionIndex(0), vec![10])];
    let err = coordinator
        .half_iteration(&Relay, &models(), &routing, &data())
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::MissingRoute {
            partition: PartitionIndex(1),
            ..
        }
    ));
}

fn ratings(cuts: &[usize]) -> Vec<(PartitionIndex, PartitionBlock)> {
    // 8 users x 6 items
    let cells: Vec<(usize, usize, f64)> = (0..8)
        .flat_map(|u| (0..6).map(move |i| (u, i)))
        .filter(|(u, i)| (u * 7 + i * 3) % 4 == 0)
        .map(|(u, i)| (u, i, ((u + i) % 5 + 1) as f64))
        .collect();
    let mut bounds = vec![0];
    bounds.extend_from_slice(cuts);
    bounds.push(8);
    bounds
        .windows(2)
        .enumerate()
        .map(|(k, w)| {
            let local = cells
                .iter()
                .filter(|(u, _, _)| *u >= w[0] && *u < w[1])
                .map(|&(u, i, v)| (u - w[0], i, v))
                .collect();
            let block = CsrBlock::from_triplets(w[1] - w[0], 6, local).unwrap();
            (PartitionIndex(k as u32), PartitionBlock::Sparse(block))
        })
        .collect()
}

#[test]
fn implicit_als_is_deterministic_across_worker_counts() {
    let params = AlsParams {
        n_factors: 3,
        max_iterations: 2,
        ..AlsParams::default()
    };
    let one = Coordinator::with_workers(1).unwrap();
    let four = Coordinator::with_workers(4).unwrap();
    let a = implicit_als::train(&one, ratings(&[3, 5]), &params, &mut NoopIterationObserver).unwrap();
    let b = implicit_als::train(&four, ratings(&[3, 5]), &params, &mut NoopIterationObserver).unwrap();
    assert_eq!(a.users, b.users);
    assert_eq!(a.items, b.items);
    assert_eq!(a.item_layout.total_rows(), 6);
    assert!(a.users.iter().all(|(_, m)| m.factors.ncols() == 3));
}
