//! Identifiers and containers that every stage of a job agrees on.

use crate::config::ConfigError;
use crate::error::KernelError;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;

/// Stable identifier of a partition. The same index names the same slice of
/// data in every round of a job; results are joined across rounds by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionIndex(pub u32);

impl PartitionIndex {
    /// Sender identity used for results produced by the master itself.
    pub const MASTER: PartitionIndex = PartitionIndex(u32::MAX);

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PartitionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::MASTER {
            f.write_str("master")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u32> for PartitionIndex {
    fn from(value: u32) -> Self {
        PartitionIndex(value)
    }
}

/// Coordinates of one task as assigned by the execution framework.
///
/// `total_tasks` is fixed for the lifetime of a job. A task owns the
/// partitions `ordinal, ordinal + total_tasks, ordinal + 2 * total_tasks, ...`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    ordinal: u32,
    total_tasks: u32,
}

impl TaskContext {
    pub fn new(ordinal: u32, total_tasks: u32) -> Result<Self, ConfigError> {
        if total_tasks == 0 {
            return Err(ConfigError::Invalid(
                "the total task count must be at least one".to_string(),
            ));
        }
        if ordinal >= total_tasks {
            return Err(ConfigError::Invalid(format!(
                "task ordinal {ordinal} is outside the task count {total_tasks}"
            )));
        }
        Ok(Self {
            ordinal,
            total_tasks,
        })
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn total_tasks(&self) -> u32 {
        self.total_tasks
    }

    /// Index of the `k`-th partition owned by this task, or `None` when it
    /// does not fit in a `PartitionIndex`.
    pub fn partition(&self, k: u32) -> Option<PartitionIndex> {
        k.checked_mul(self.total_tasks)
            .and_then(|offset| offset.checked_add(self.ordinal))
            .map(PartitionIndex)
    }

    /// Unbounded stride over the partitions this task owns.
    pub fn indices(&self) -> StridedIndices {
        StridedIndices {
            next: Some(self.ordinal),
            stride: self.total_tasks,
        }
    }
}

pub struct StridedIndices {
    next: Option<u32>,
    stride: u32,
}

impl Iterator for StridedIndices {
    type Item = PartitionIndex;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.checked_add(self.stride);
        Some(PartitionIndex(current))
    }
}

/// A set of named numeric tables. Every finished aggregation is reported in
/// this shape; names are ordered so that printing and persisting are stable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedTables {
    tables: BTreeMap<String, Array2<f64>>,
}

/// The final output of a master step.
pub type GlobalResult = NamedTables;

impl NamedTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, table: Array2<f64>) -> Option<Array2<f64>> {
        self.tables.insert(name.into(), table)
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, table: Array2<f64>) -> Self {
        self.insert(name, table);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Array2<f64>> {
        self.tables.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Array2<f64>, KernelError> {
        self.tables
            .get(name)
            .ok_or_else(|| KernelError::MissingTable(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Array2<f64>> {
        self.tables.iter()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl<'a> IntoIterator for &'a NamedTables {
    type Item = (&'a String, &'a Array2<f64>);
    type IntoIter = btree_map::Iter<'a, String, Array2<f64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.tables.iter()
    }
}

/// Artifacts addressed to destination partitions. Keys are the partitions
/// that must receive the value; iteration is in index order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyedPartialCollection<T> {
    entries: BTreeMap<PartitionIndex, T>,
}

impl<T> Default for KeyedPartialCollection<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> KeyedPartialCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous value when the destination was already present.
    pub fn insert(&mut self, destination: PartitionIndex, value: T) -> Option<T> {
        self.entries.insert(destination, value)
    }

    pub fn get(&self, destination: PartitionIndex) -> Option<&T> {
        self.entries.get(&destination)
    }

    pub fn remove(&mut self, destination: PartitionIndex) -> Option<T> {
        self.entries.remove(&destination)
    }

    pub fn contains(&self, destination: PartitionIndex) -> bool {
        self.entries.contains_key(&destination)
    }

    pub fn keys(&self) -> impl Iterator<Item = PartitionIndex> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PartitionIndex, &T)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> IntoIterator for KeyedPartialCollection<T> {
    type Item = (PartitionIndex, T);
    type IntoIter = btree_map::IntoIter<PartitionIndex, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<T> FromIterator<(PartitionIndex, T)> for KeyedPartialCollection<T> {
    fn from_iter<I: IntoIterator<Item = (PartitionIndex, T)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Maps global row numbers onto partitions laid out in index order.
///
/// The partitions of one side of a factorization are contiguous row ranges;
/// partition `i` starts where partition `i - 1` ends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowPartition {
    indices: Vec<PartitionIndex>,
    offsets: Vec<usize>,
}

impl RowPartition {
    /// Builds the layout from `(index, row count)` pairs in any order.
    pub fn from_counts(counts: impl IntoIterator<Item = (PartitionIndex, usize)>) -> Self {
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort_by_key(|(index, _)| *index);
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        offsets.push(0);
        let mut running = 0usize;
        for (_, rows) in &counts {
            running += rows;
            offsets.push(running);
        }
        Self {
            indices: counts.into_iter().map(|(index, _)| index).collect(),
            offsets,
        }
    }

    /// Splits `total_rows` into `parts` near-equal contiguous ranges indexed `0..parts`.
    pub fn even(total_rows: usize, parts: usize) -> Self {
        let parts = parts.max(1);
        let base = total_rows / parts;
        let extra = total_rows % parts;
        Self::from_counts(
            (0..parts).map(|i| (PartitionIndex(i as u32), base + usize::from(i < extra))),
        )
    }

    pub fn total_rows(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn indices(&self) -> &[PartitionIndex] {
        &self.indices
    }

    fn position(&self, index: PartitionIndex) -> Option<usize> {
        self.indices.binary_search(&index).ok()
    }

    /// First global row owned by `index`.
    pub fn offset(&self, index: PartitionIndex) -> Option<usize> {
        self.position(index).map(|p| self.offsets[p])
    }

    pub fn range(&self, index: PartitionIndex) -> Option<std::ops::Range<usize>> {
        self.position(index)
            .map(|p| self.offsets[p]..self.offsets[p + 1])
    }

    /// Partition owning the zero-based global row `row`.
    pub fn owner(&self, row: usize) -> Option<PartitionIndex> {
        if row >= self.total_rows() {
            return None;
        }
        // offsets[p] <= row < offsets[p + 1]; empty partitions share an offset.
        let p = self.offsets.partition_point(|&start| start <= row) - 1;
        self.indices.get(p).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_indices_follow_the_task_ordinal() {
        let ctx = TaskContext::new(2, 4).unwrap();
        let owned: Vec<u32> = ctx.indices().take(3).map(PartitionIndex::get).collect();
        assert_eq!(owned, vec![2, 6, 10]);
        assert_eq!(ctx.partition(1), Some(PartitionIndex(6)));
    }

    #[test]
    fn strided_index_past_u32_is_none() {
        let ctx = TaskContext::new(3, 4).unwrap();
        assert_eq!(ctx.partition(u32::MAX / 4), Some(PartitionIndex(u32::MAX)));
        assert_eq!(ctx.partition(u32::MAX / 4 + 1), None);
        assert_eq!(ctx.partition(u32::MAX), None);
    }

    #[test]
    fn task_context_rejects_out_of_range_ordinals() {
        assert!(TaskContext::new(0, 0).is_err());
        assert!(TaskContext::new(4, 4).is_err());
    }

    #[test]
    fn row_partition_resolves_owners_across_empty_partitions() {
        let layout = RowPartition::from_counts([
            (PartitionIndex(1), 0),
            (PartitionIndex(0), 3),
            (PartitionIndex(2), 2),
        ]);
        assert_eq!(layout.total_rows(), 5);
        assert_eq!(layout.owner(0), Some(PartitionIndex(0)));
        assert_eq!(layout.owner(2), Some(PartitionIndex(0)));
        assert_eq!(layout.owner(3), Some(PartitionIndex(2)));
        assert_eq!(layout.owner(5), None);
        assert_eq!(layout.range(PartitionIndex(2)), Some(3..5));
    }

    #[test]
    fn even_layout_spreads_the_remainder_first() {
        let layout = RowPartition::even(7, 3);
        assert_eq!(layout.range(PartitionIndex(0)), Some(0..3));
        assert_eq!(layout.range(PartitionIndex(1)), Some(3..5));
        assert_eq!(layout.range(PartitionIndex(2)), Some(5..7));
    }

    #[test]
    fn required_table_reports_its_name() {
        let tables = NamedTables::new().with("mean", Array2::zeros((1, 2)));
        assert!(tables.require("mean").is_ok());
        match tables.require("variance") {
            Err(KernelError::MissingTable(name)) => assert_eq!(name, "variance"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
