//! # Partitioned Dataset Loader
//!
//! Turns partitioned text input into a keyed collection of in-memory blocks.
//! Every block receives its `PartitionIndex` here, once, and keeps it for the
//! rest of the job.
//!
//! - Dense files: one CSV row of doubles per line. Every row must carry the
//!   declared feature count (or the width of the first row when none is declared).
//! - Sparse files: three lines holding the one-based row offsets, column
//!   indices and values of a CSR block. The feature count is the largest
//!   column index unless one is declared.
//! - Indices come from the file name suffix (`name_3.csv` is partition 2), from
//!   natural file-name order, from row chunks cut out of the files, or from the
//!   stride of the task that loads them.

use crate::block::{CsrBlock, LabeledBlock, PartitionBlock};
use crate::types::{PartitionIndex, TaskContext};
use log::{debug, info};
use ndarray::{Array2, Axis, s};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failures while reading partitioned input. Every variant other than `Io`
/// and `NoInput` describes malformed input.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No input files were found at '{0}'.")]
    NoInput(PathBuf),
    #[error("Malformed CSV in '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path}:{line}: expected {expected} values but found {found}.")]
    TokenCount {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("{path}:{line}: '{token}' is not a number.")]
    InvalidNumber {
        path: PathBuf,
        line: u64,
        token: String,
    },
    #[error("Sparse block in '{path}' is inconsistent: {reason}")]
    SparseLayout { path: PathBuf, reason: String },
    #[error("'{0}' contains no rows.")]
    EmptyFile(PathBuf),
    #[error("Cannot derive a partition index from the file name '{0}'.")]
    UnindexedFileName(PathBuf),
    #[error("Partition {0} was loaded more than once.")]
    DuplicatePartition(PartitionIndex),
    #[error("Blocks disagree on the feature count: expected {expected}, found {found}.")]
    WidthMismatch { expected: usize, found: usize },
    #[error("Partition {0} has data but no labels, or labels but no data.")]
    UnpairedPartition(PartitionIndex),
    #[error("Partition {partition} has {data_rows} data rows but {label_rows} label rows.")]
    LabelRowMismatch {
        partition: PartitionIndex,
        data_rows: usize,
        label_rows: usize,
    },
    #[error("'{0}' lies past the last partition index this task can own.")]
    StrideOverflow(PathBuf),
    #[error("The {0} scheme cannot be used with this input format.")]
    UnsupportedScheme(&'static str),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    #[default]
    Dense,
    Csr,
}

/// How partition indices are assigned to loaded blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionScheme {
    /// `name_<k>.ext` becomes partition `k - 1`.
    FileSuffix,
    /// The `k`-th file in natural name order becomes partition `k`.
    FileOrder,
    /// Dense rows are cut into blocks of at most `max_rows`, numbered in file order.
    RowChunks { max_rows: usize },
    /// The `k`-th file becomes partition `ordinal + k * total_tasks`.
    Strided(TaskContext),
}

impl PartitionScheme {
    fn name(&self) -> &'static str {
        match self {
            Self::FileSuffix => "file-suffix",
            Self::FileOrder => "file-order",
            Self::RowChunks { .. } => "row-chunk",
            Self::Strided(_) => "strided",
        }
    }
}

/// Blocks keyed by their partition index, iterated in index order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionedDataset {
    blocks: BTreeMap<PartitionIndex, PartitionBlock>,
}

impl PartitionedDataset {
    pub fn from_blocks(
        blocks: impl IntoIterator<Item = (PartitionIndex, PartitionBlock)>,
    ) -> Result<Self, LoadError> {
        let mut map = BTreeMap::new();
        for (index, block) in blocks {
            match map.entry(index) {
                Entry::Vacant(slot) => {
                    slot.insert(block);
                }
                Entry::Occupied(_) => return Err(LoadError::DuplicatePartition(index)),
            }
        }
        Ok(Self { blocks: map })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, index: PartitionIndex) -> Option<&PartitionBlock> {
        self.blocks.get(&index)
    }

    pub fn indices(&self) -> impl Iterator<Item = PartitionIndex> + '_ {
        self.blocks.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PartitionIndex, &PartitionBlock)> {
        self.blocks.iter().map(|(k, v)| (*k, v))
    }

    pub fn total_rows(&self) -> usize {
        self.blocks.values().map(PartitionBlock::n_rows).sum()
    }

    pub fn n_features(&self) -> usize {
        self.blocks
            .values()
            .map(PartitionBlock::n_cols)
            .max()
            .unwrap_or(0)
    }

    /// The blocks as executor input, in index order.
    pub fn into_inputs(self) -> Vec<(PartitionIndex, PartitionBlock)> {
        self.blocks.into_iter().collect()
    }

    /// Gives every block the same feature count. Sparse blocks are padded;
    /// dense blocks must already agree.
    fn harmonize(self) -> Result<Self, LoadError> {
        let width = self.n_features();
        let blocks = self
            .blocks
            .into_iter()
            .map(|(index, block)| block.widen(width).map(|block| (index, block)))
            .collect::<Result<_, _>>()?;
        Ok(Self { blocks })
    }
}

pub struct DatasetLoader {
    format: DataFormat,
    scheme: PartitionScheme,
    n_features: Option<usize>,
}

impl DatasetLoader {
    pub fn new(format: DataFormat) -> Self {
        Self {
            format,
            scheme: PartitionScheme::FileOrder,
            n_features: None,
        }
    }

    pub fn with_scheme(mut self, scheme: PartitionScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_features(mut self, n_features: usize) -> Self {
        self.n_features = Some(n_features);
        self
    }

    /// Loads a single file or every regular file of a directory.
    pub fn load(&self, input: &Path) -> Result<PartitionedDataset, LoadError> {
        let files = list_input_files(input)?;
        self.load_files(input, &files)
    }

    /// Loads `files`, which were listed from `source`.
    pub fn load_files(&self, source: &Path, files: &[PathBuf]) -> Result<PartitionedDataset, LoadError> {
        if files.is_empty() {
            return Err(LoadError::NoInput(source.to_path_buf()));
        }

        let indexed: Vec<(PartitionIndex, &PathBuf)> = match self.scheme {
            PartitionScheme::RowChunks { max_rows } => return self.load_chunked(files, max_rows),
            PartitionScheme::FileSuffix => files
                .iter()
                .map(|path| suffix_index(path).map(|index| (index, path)))
                .collect::<Result<_, _>>()?,
            PartitionScheme::FileOrder => files
                .iter()
                .enumerate()
                .map(|(k, path)| (PartitionIndex(k as u32), path))
                .collect(),
            PartitionScheme::Strided(ctx) => files
                .iter()
                .enumerate()
                .map(|(k, path)| {
                    u32::try_from(k)
                        .ok()
                        .and_then(|k| ctx.partition(k))
                        .map(|index| (index, path))
                        .ok_or_else(|| LoadError::StrideOverflow(path.clone()))
                })
                .collect::<Result<_, _>>()?,
        };

        let blocks = indexed
            .par_iter()
            .map(|(index, path)| {
                let block = self.read_block(path)?;
                debug!(
                    "Loaded partition {} from '{}' ({} x {}).",
                    index,
                    path.display(),
                    block.n_rows(),
                    block.n_cols()
                );
                Ok((*index, block))
            })
            .collect::<Result<Vec<_>, LoadError>>()?;

        let dataset = PartitionedDataset::from_blocks(blocks)?.harmonize()?;
        info!(
            "Loaded {} partitions with {} rows and {} features ({} scheme).",
            dataset.len(),
            dataset.total_rows(),
            dataset.n_features(),
            self.scheme.name()
        );
        Ok(dataset)
    }

    fn read_block(&self, path: &Path) -> Result<PartitionBlock, LoadError> {
        let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match self.format {
            DataFormat::Dense => parse_dense(&text, self.n_features, path).map(PartitionBlock::Dense),
            DataFormat::Csr => parse_csr(&text, self.n_features, path).map(PartitionBlock::Sparse),
        }
    }

    fn load_chunked(
        &self,
        files: &[PathBuf],
        max_rows: usize,
    ) -> Result<PartitionedDataset, LoadError> {
        if self.format != DataFormat::Dense || max_rows == 0 {
            return Err(LoadError::UnsupportedScheme(self.scheme.name()));
        }
        let mut next = 0u32;
        let mut blocks = Vec::new();
        for path in files {
            let PartitionBlock::Dense(table) = self.read_block(path)? else {
                return Err(LoadError::UnsupportedScheme(self.scheme.name()));
            };
            for chunk in table.axis_chunks_iter(Axis(0), max_rows) {
                blocks.push((PartitionIndex(next), PartitionBlock::Dense(chunk.to_owned())));
                next += 1;
            }
        }
        let dataset = PartitionedDataset::from_blocks(blocks)?.harmonize()?;
        info!(
            "Cut {} rows into {} partitions of at most {} rows.",
            dataset.total_rows(),
            dataset.len(),
            max_rows
        );
        Ok(dataset)
    }
}

/// Regular files of `input` in natural name order, or `input` itself.
pub fn list_input_files(input: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let io_err = |source| LoadError::Io {
        path: input.to_path_buf(),
        source,
    };
    let metadata = fs::metadata(input).map_err(io_err)?;
    if metadata.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(input).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.file_type().map_err(io_err)?.is_file() {
            files.push(entry.path());
        }
    }
    if files.is_empty() {
        return Err(LoadError::NoInput(input.to_path_buf()));
    }
    files.sort_by(|a, b| {
        natord::compare(
            &a.file_name().unwrap_or_default().to_string_lossy(),
            &b.file_name().unwrap_or_default().to_string_lossy(),
        )
    });
    Ok(files)
}

/// `prefix_<k>.ext` maps to partition `k - 1`.
pub fn suffix_index(path: &Path) -> Result<PartitionIndex, LoadError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tokens: Vec<&str> = name.split(['_', '.']).collect();
    tokens
        .len()
        .checked_sub(2)
        .and_then(|i| tokens[i].parse::<u32>().ok())
        .and_then(|k| k.checked_sub(1))
        .map(PartitionIndex)
        .ok_or_else(|| LoadError::UnindexedFileName(path.to_path_buf()))
}

fn parse_number(token: &str, line: u64, path: &Path) -> Result<f64, LoadError> {
    lexical_core::parse::<f64>(token.as_bytes()).map_err(|_| LoadError::InvalidNumber {
        path: path.to_path_buf(),
        line,
        token: token.to_string(),
    })
}

/// Parses a dense CSV block. Blank lines are skipped.
pub fn parse_dense(
    text: &str,
    n_features: Option<usize>,
    path: &Path,
) -> Result<Array2<f64>, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut expected = n_features;
    let mut values = Vec::new();
    let mut n_rows = 0usize;
    for record in reader.records() {
        let record = record.map_err(|source| LoadError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let line = record.position().map_or(0, |p| p.line());
        let width = *expected.get_or_insert(record.len());
        if record.len() != width {
            return Err(LoadError::TokenCount {
                path: path.to_path_buf(),
                line,
                expected: width,
                found: record.len(),
            });
        }
        for token in record.iter() {
            values.push(parse_number(token, line, path)?);
        }
        n_rows += 1;
    }

    let width = match expected {
        Some(width) if n_rows > 0 && width > 0 => width,
        _ => return Err(LoadError::EmptyFile(path.to_path_buf())),
    };
    Array2::from_shape_vec((n_rows, width), values).map_err(|e| LoadError::SparseLayout {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn parse_index_line(line: &str, line_no: u64, path: &Path) -> Result<Vec<usize>, LoadError> {
    line.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|token| {
            lexical_core::parse::<usize>(token.as_bytes()).map_err(|_| LoadError::InvalidNumber {
                path: path.to_path_buf(),
                line: line_no,
                token: token.to_string(),
            })
        })
        .collect()
}

/// Parses a sparse block: row offsets, column indices and values on the
/// first three non-blank lines, all one-based.
pub fn parse_csr(text: &str, n_features: Option<usize>, path: &Path) -> Result<CsrBlock, LoadError> {
    let layout_err = |reason: String| LoadError::SparseLayout {
        path: path.to_path_buf(),
        reason,
    };
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i as u64 + 1, l))
        .filter(|(_, l)| !l.trim().is_empty());
    let (Some(offsets_line), Some(cols_line), Some(values_line)) =
        (lines.next(), lines.next(), lines.next())
    else {
        return Err(layout_err(
            "expected three lines of row offsets, column indices and values".to_string(),
        ));
    };

    let row_offsets = parse_index_line(offsets_line.1, offsets_line.0, path)?;
    let col_indices = parse_index_line(cols_line.1, cols_line.0, path)?;
    let values = values_line
        .1
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| parse_number(t, values_line.0, path))
        .collect::<Result<Vec<_>, _>>()?;

    // --- Header consistency ---
    if col_indices.len() != values.len() {
        return Err(layout_err(format!(
            "{} column indices but {} values",
            col_indices.len(),
            values.len()
        )));
    }
    let last = row_offsets.last().copied().unwrap_or(0);
    if last == 0 || last - 1 != values.len() {
        return Err(layout_err(format!(
            "{} values but the last row offset is {}",
            values.len(),
            last
        )));
    }
    let inferred_features = col_indices.iter().copied().max().unwrap_or(0);
    if inferred_features == 0 {
        return Err(layout_err("no features".to_string()));
    }
    if row_offsets.len() < 2 {
        return Err(layout_err("no rows".to_string()));
    }
    let n_cols = match n_features {
        Some(declared) if declared < inferred_features => {
            return Err(layout_err(format!(
                "column index {inferred_features} exceeds the declared {declared} features"
            )));
        }
        Some(declared) => declared,
        None => inferred_features,
    };

    CsrBlock::new(n_cols, row_offsets, col_indices, values).map_err(layout_err)
}

/// Pairs data and label blocks that share a partition index.
pub fn join_labels(
    data: PartitionedDataset,
    labels: PartitionedDataset,
) -> Result<Vec<(PartitionIndex, LabeledBlock)>, LoadError> {
    let mut labels = labels.blocks;
    let mut joined = Vec::with_capacity(data.len());
    for (index, block) in data.blocks {
        let label_block = labels
            .remove(&index)
            .ok_or(LoadError::UnpairedPartition(index))?;
        if label_block.n_rows() != block.n_rows() {
            return Err(LoadError::LabelRowMismatch {
                partition: index,
                data_rows: block.n_rows(),
                label_rows: label_block.n_rows(),
            });
        }
        joined.push((
            index,
            LabeledBlock {
                data: block,
                labels: label_block.to_dense().into_owned(),
            },
        ));
    }
    if let Some(index) = labels.into_keys().next() {
        return Err(LoadError::UnpairedPartition(index));
    }
    Ok(joined)
}

/// Splits dense blocks into their first `n_features` columns and the rest.
pub fn split_columns(
    data: PartitionedDataset,
    n_features: usize,
) -> Result<Vec<(PartitionIndex, LabeledBlock)>, LoadError> {
    data.blocks
        .into_iter()
        .map(|(index, block)| {
            let PartitionBlock::Dense(table) = block else {
                return Err(LoadError::UnsupportedScheme("column-split"));
            };
            if n_features == 0 || table.ncols() <= n_features {
                return Err(LoadError::WidthMismatch {
                    expected: n_features + 1,
                    found: table.ncols(),
                });
            }
            Ok((
                index,
                LabeledBlock {
                    data: PartitionBlock::Dense(table.slice(s![.., ..n_features]).to_owned()),
                    labels: table.slice(s![.., n_features..]).to_owned(),
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;
    use tempfile::{NamedTempFile, tempdir};

    fn path() -> PathBuf {
        PathBuf::from("block.csv")
    }

    #[test]
    fn dense_rows_must_match_the_declared_width() {
        let table = parse_dense("1,2,3\n4, 5 ,6\n\n", Some(3), &path()).unwrap();
        assert_eq!(table, array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);

        match parse_dense("1,2,3\n4,5\n", None, &path()) {
            Err(LoadError::TokenCount {
                line,
                expected,
                found,
                ..
            }) => {
                assert_eq!((line, expected, found), (2, 3, 2));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            parse_dense("1,x\n", None, &path()),
            Err(LoadError::InvalidNumber { .. })
        ));
        assert!(matches!(
            parse_dense("", None, &path()),
            Err(LoadError::EmptyFile(_))
        ));
    }

    #[test]
    fn sparse_header_is_recovered_from_the_loaded_block() {
        let text = "1,3,3,5\n1,4,2,3\n0.5,1.5,2.5,3.5\n";
        let block = parse_csr(text, None, &path()).unwrap();
        assert_eq!(block.n_rows(), 3);
        assert_eq!(block.n_cols(), 4);
        assert_eq!(block.nnz(), 4);
        assert_eq!(block.row_offsets().last().copied(), Some(block.nnz() + 1));
    }

    #[test]
    fn sparse_consistency_rules_are_enforced() {
        let cases = [
            "1,3\n1,2,3\n1.0,2.0\n",
            "1,5\n1,2,3\n1.0,2.0,3.0\n",
            "1\n\n\n",
            "1,3\n1,2\n1.0,2.0\n1\n",
        ];
        for (i, text) in cases.iter().take(3).enumerate() {
            assert!(
                matches!(
                    parse_csr(text, None, &path()),
                    Err(LoadError::SparseLayout { .. })
                ),
                "case {i} should be rejected"
            );
        }
        assert!(parse_csr(cases[3], None, &path()).is_ok());
        assert!(parse_csr(cases[3], Some(1), &path()).is_err());
    }

    #[test]
    fn file_suffix_names_the_partition() {
        assert_eq!(
            suffix_index(Path::new("/data/covcormoments_dense_3.csv")).unwrap(),
            PartitionIndex(2)
        );
        assert!(suffix_index(Path::new("/data/dense.csv")).is_err());
        assert!(suffix_index(Path::new("/data/dense_0.csv")).is_err());
    }

    #[test]
    fn directories_load_in_natural_order() {
        let dir = tempdir().unwrap();
        for (name, value) in [("part_10.csv", 10.0), ("part_2.csv", 2.0), ("part_1.csv", 1.0)] {
            fs::write(dir.path().join(name), format!("{value},{value}\n")).unwrap();
        }
        let dataset = DatasetLoader::new(DataFormat::Dense)
            .load(dir.path())
            .unwrap();
        let firsts: Vec<f64> = dataset
            .iter()
            .map(|(_, block)| block.to_dense()[[0, 0]])
            .collect();
        assert_eq!(firsts, vec![1.0, 2.0, 10.0]);

        let by_suffix = DatasetLoader::new(DataFormat::Dense)
            .with_scheme(PartitionScheme::FileSuffix)
            .load(dir.path())
            .unwrap();
        assert_eq!(
            by_suffix.indices().collect::<Vec<_>>(),
            vec![PartitionIndex(0), PartitionIndex(1), PartitionIndex(9)]
        );
    }

    #[test]
    fn strided_loading_uses_the_task_stride() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "1\n").unwrap();
        fs::write(dir.path().join("b.csv"), "2\n").unwrap();
        let ctx = TaskContext::new(1, 3).unwrap();
        let dataset = DatasetLoader::new(DataFormat::Dense)
            .with_scheme(PartitionScheme::Strided(ctx))
            .load(dir.path())
            .unwrap();
        assert_eq!(
            dataset.indices().collect::<Vec<_>>(),
            vec![PartitionIndex(1), PartitionIndex(4)]
        );
    }

    #[test]
    fn an_empty_file_list_names_its_source() {
        let dir = tempdir().unwrap();
        let err = DatasetLoader::new(DataFormat::Dense)
            .with_scheme(PartitionScheme::RowChunks { max_rows: 4 })
            .load_files(dir.path(), &[])
            .unwrap_err();
        match err {
            LoadError::NoInput(source) => assert_eq!(source, dir.path()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn row_chunks_cover_every_row_once() {
        let mut file = NamedTempFile::new().unwrap();
        for i in 0..7 {
            writeln!(file, "{i},{}", i * 2).unwrap();
        }
        let dataset = DatasetLoader::new(DataFormat::Dense)
            .with_scheme(PartitionScheme::RowChunks { max_rows: 3 })
            .load(file.path())
            .unwrap();
        let rows: Vec<usize> = dataset.iter().map(|(_, b)| b.n_rows()).collect();
        assert_eq!(rows, vec![3, 3, 1]);
        assert_eq!(dataset.get(PartitionIndex(2)).unwrap().to_dense()[[0, 0]], 6.0);
    }

    #[test]
    fn sparse_blocks_share_the_widest_feature_count() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("s_1.csv"), "1,2\n2\n1.0\n").unwrap();
        fs::write(dir.path().join("s_2.csv"), "1,2\n5\n1.0\n").unwrap();
        let dataset = DatasetLoader::new(DataFormat::Csr)
            .with_scheme(PartitionScheme::FileSuffix)
            .load(dir.path())
            .unwrap();
        assert!(dataset.iter().all(|(_, b)| b.n_cols() == 5));
    }

    #[test]
    fn labels_join_by_partition_index() {
        let data = PartitionedDataset::from_blocks([
            (PartitionIndex(0), PartitionBlock::Dense(array![[1.0], [2.0]])),
            (PartitionIndex(1), PartitionBlock::Dense(array![[3.0]])),
        ])
        .unwrap();
        let labels = PartitionedDataset::from_blocks([
            (PartitionIndex(1), PartitionBlock::Dense(array![[1.0]])),
            (PartitionIndex(0), PartitionBlock::Dense(array![[0.0], [1.0]])),
        ])
        .unwrap();
        let joined = join_labels(data.clone(), labels).unwrap();
        assert_eq!(joined[1].1.labels, array![[1.0]]);

        let short = PartitionedDataset::from_blocks([(
            PartitionIndex(0),
            PartitionBlock::Dense(array![[0.0], [1.0]]),
        )])
        .unwrap();
        assert!(matches!(
            join_labels(data, short),
            Err(LoadError::UnpairedPartition(PartitionIndex(1)))
        ));
    }

    #[test]
    fn trailing_columns_become_labels() {
        let data = PartitionedDataset::from_blocks([(
            PartitionIndex(0),
            PartitionBlock::Dense(array![[1.0, 2.0, 9.0], [3.0, 4.0, 8.0]]),
        )])
        .unwrap();
        let split = split_columns(data, 2).unwrap();
        assert_eq!(split[0].1.labels, array![[9.0], [8.0]]);
        assert_eq!(split[0].1.data.n_cols(), 2);
    }
}
