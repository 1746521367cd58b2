//! Durable storage for results and per-partition artifacts.
//!
//! Artifacts are addressed by `(stage, name, partition)`. Multi-job pipelines
//! rely on the partition component: a later job looks up exactly the artifact
//! an earlier job wrote for the same partition index.

use crate::envelope::{Envelope, EnvelopeError};
use crate::loader::{LoadError, parse_dense};
use crate::types::{GlobalResult, PartitionIndex};
use dashmap::DashMap;
use itertools::Itertools;
use log::debug;
use ndarray::Array2;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const ENVELOPE_EXTENSION: &str = "bin";
const TABLE_EXTENSION: &str = "csv";

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Storage I/O failed at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No artifact is stored under '{0}'.")]
    NotFound(ArtifactKey),
    #[error("Artifact '{key}' is not a readable envelope: {source}")]
    Envelope {
        key: ArtifactKey,
        #[source]
        source: EnvelopeError,
    },
    #[error("Artifact '{key}' is not a readable table: {source}")]
    Table {
        key: ArtifactKey,
        #[source]
        source: LoadError,
    },
    #[error("'{0}' cannot be used as an artifact name.")]
    InvalidName(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    stage: String,
    name: String,
    partition: Option<PartitionIndex>,
}

impl ArtifactKey {
    pub fn global(stage: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            name: name.into(),
            partition: None,
        }
    }

    pub fn partition(stage: impl Into<String>, name: impl Into<String>, index: PartitionIndex) -> Self {
        Self {
            stage: stage.into(),
            name: name.into(),
            partition: Some(index),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> Option<PartitionIndex> {
        self.partition
    }

    /// `name` for global artifacts, `name` + `x` + index for per-partition ones.
    pub fn stem(&self) -> String {
        match self.partition {
            Some(index) => format!("{}x{}", self.name, index.get()),
            None => self.name.clone(),
        }
    }

    fn validate(&self) -> Result<(), SinkError> {
        let bad = |s: &str| s.is_empty() || s.contains(['/', '\\']) || s.starts_with('.');
        if bad(&self.stage) {
            return Err(SinkError::InvalidName(self.stage.clone()));
        }
        if bad(&self.name) {
            return Err(SinkError::InvalidName(self.name.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage, self.stem())
    }
}

/// Recovers the partition index from a stem written for `name`.
fn partition_of_stem(stem: &str, name: &str) -> Option<PartitionIndex> {
    let digits = stem.strip_prefix(name)?.strip_prefix('x')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(PartitionIndex)
}

/// Renders a table as CSV with shortest round-trip float formatting.
pub fn format_table(table: &Array2<f64>) -> String {
    let mut buffer = ryu::Buffer::new();
    let mut out = String::with_capacity(table.len() * 12);
    for row in table.rows() {
        let line = row.iter().map(|v| buffer.format(*v).to_string()).join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

pub trait ResultSink: Send + Sync {
    fn put_envelope(&self, key: &ArtifactKey, envelope: &Envelope) -> Result<(), SinkError>;

    fn get_envelope(&self, key: &ArtifactKey) -> Result<Envelope, SinkError>;

    /// Removing an envelope that was never stored is not an error.
    fn remove_envelope(&self, key: &ArtifactKey) -> Result<(), SinkError>;

    fn put_table(&self, key: &ArtifactKey, table: &Array2<f64>) -> Result<(), SinkError>;

    fn get_table(&self, key: &ArtifactKey) -> Result<Array2<f64>, SinkError>;

    /// Indices of every per-partition envelope stored as `stage`/`name`, ascending.
    fn partitions(&self, stage: &str, name: &str) -> Result<Vec<PartitionIndex>, SinkError>;

    /// Stores every table of a finished result under `stage`.
    fn publish(&self, stage: &str, result: &GlobalResult) -> Result<(), SinkError> {
        for (name, table) in result {
            self.put_table(&ArtifactKey::global(stage, name.as_str()), table)?;
        }
        Ok(())
    }
}

/// A sink rooted at a directory: `<root>/<stage>/<stem>.bin` for envelopes and
/// `<root>/<stage>/<stem>.csv` for tables. Files are written under a temporary
/// name and renamed into place, so readers never see a partial artifact.
pub struct FsSink {
    root: PathBuf,
}

impl FsSink {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| SinkError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &ArtifactKey, extension: &str) -> Result<PathBuf, SinkError> {
        key.validate()?;
        Ok(self
            .root
            .join(&key.stage)
            .join(format!("{}.{extension}", key.stem())))
    }

    /// Writes `bytes` next to `path` and returns the temporary file's path.
    fn stage_file(path: &Path, bytes: &[u8]) -> Result<PathBuf, SinkError> {
        let io_err = |source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut staged = path.as_os_str().to_owned();
        staged.push(".partial");
        let staged = PathBuf::from(staged);
        let mut file = fs::File::create(&staged).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(staged)
    }

    fn commit(staged: &Path, path: &Path) -> Result<(), SinkError> {
        fs::rename(staged, path).map_err(|source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read(&self, key: &ArtifactKey, path: &Path) -> Result<Vec<u8>, SinkError> {
        fs::read(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SinkError::NotFound(key.clone())
            } else {
                SinkError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })
    }
}

impl ResultSink for FsSink {
    fn put_envelope(&self, key: &ArtifactKey, envelope: &Envelope) -> Result<(), SinkError> {
        let path = self.path_for(key, ENVELOPE_EXTENSION)?;
        let bytes = envelope.to_bytes().map_err(|source| SinkError::Envelope {
            key: key.clone(),
            source,
        })?;
        let staged = Self::stage_file(&path, &bytes)?;
        Self::commit(&staged, &path)?;
        debug!("Stored envelope {key} ({} bytes).", bytes.len());
        Ok(())
    }

    fn get_envelope(&self, key: &ArtifactKey) -> Result<Envelope, SinkError> {
        let path = self.path_for(key, ENVELOPE_EXTENSION)?;
        let bytes = self.read(key, &path)?;
        Envelope::from_bytes(&bytes).map_err(|source| SinkError::Envelope {
            key: key.clone(),
            source,
        })
    }

    fn remove_envelope(&self, key: &ArtifactKey) -> Result<(), SinkError> {
        let path = self.path_for(key, ENVELOPE_EXTENSION)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed envelope {key}.");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SinkError::Io { path, source }),
        }
    }

    fn put_table(&self, key: &ArtifactKey, table: &Array2<f64>) -> Result<(), SinkError> {
        let path = self.path_for(key, TABLE_EXTENSION)?;
        let staged = Self::stage_file(&path, format_table(table).as_bytes())?;
        Self::commit(&staged, &path)
    }

    fn get_table(&self, key: &ArtifactKey) -> Result<Array2<f64>, SinkError> {
        let path = self.path_for(key, TABLE_EXTENSION)?;
        let bytes = self.read(key, &path)?;
        let text = String::from_utf8_lossy(&bytes);
        parse_dense(&text, None, &path).map_err(|source| SinkError::Table {
            key: key.clone(),
            source,
        })
    }

    fn partitions(&self, stage: &str, name: &str) -> Result<Vec<PartitionIndex>, SinkError> {
        let dir = self.root.join(stage);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SinkError::Io { path: dir, source }),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SinkError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENVELOPE_EXTENSION) {
                continue;
            }
            let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned());
            if let Some(index) = stem.as_deref().and_then(|s| partition_of_stem(s, name)) {
                found.push(index);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Writes every table before making any of them visible.
    fn publish(&self, stage: &str, result: &GlobalResult) -> Result<(), SinkError> {
        let mut staged = Vec::with_capacity(result.len());
        for (name, table) in result {
            let path = self.path_for(&ArtifactKey::global(stage, name.as_str()), TABLE_EXTENSION)?;
            match Self::stage_file(&path, format_table(table).as_bytes()) {
                Ok(tmp) => staged.push((tmp, path)),
                Err(e) => {
                    for (tmp, _) in &staged {
                        let _ = fs::remove_file(tmp);
                    }
                    return Err(e);
                }
            }
        }
        for (tmp, path) in &staged {
            Self::commit(tmp, path)?;
        }
        debug!("Published {} tables under '{stage}'.", staged.len());
        Ok(())
    }
}

/// An in-process sink. Envelopes are kept in their framed byte form so a
/// reader always decodes its own copy.
#[derive(Default)]
pub struct MemorySink {
    envelopes: DashMap<ArtifactKey, Vec<u8>>,
    tables: DashMap<ArtifactKey, Array2<f64>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.envelopes.len() + self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultSink for MemorySink {
    fn put_envelope(&self, key: &ArtifactKey, envelope: &Envelope) -> Result<(), SinkError> {
        key.validate()?;
        let bytes = envelope.to_bytes().map_err(|source| SinkError::Envelope {
            key: key.clone(),
            source,
        })?;
        self.envelopes.insert(key.clone(), bytes);
        Ok(())
    }

    fn get_envelope(&self, key: &ArtifactKey) -> Result<Envelope, SinkError> {
        let bytes = self
            .envelopes
            .get(key)
            .ok_or_else(|| SinkError::NotFound(key.clone()))?;
        Envelope::from_bytes(bytes.value()).map_err(|source| SinkError::Envelope {
            key: key.clone(),
            source,
        })
    }

    fn remove_envelope(&self, key: &ArtifactKey) -> Result<(), SinkError> {
        key.validate()?;
        self.envelopes.remove(key);
        Ok(())
    }

    fn put_table(&self, key: &ArtifactKey, table: &Array2<f64>) -> Result<(), SinkError> {
        key.validate()?;
        self.tables.insert(key.clone(), table.clone());
        Ok(())
    }

    fn get_table(&self, key: &ArtifactKey) -> Result<Array2<f64>, SinkError> {
        self.tables
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SinkError::NotFound(key.clone()))
    }

    fn partitions(&self, stage: &str, name: &str) -> Result<Vec<PartitionIndex>, SinkError> {
        let mut found: Vec<PartitionIndex> = self
            .envelopes
            .iter()
            .filter(|entry| entry.key().stage == stage && entry.key().name == name)
            .filter_map(|entry| entry.key().partition)
            .collect();
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use ndarray::array;
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Marker(u32);

    impl Payload for Marker {
        const TAG: &'static str = "test/marker";
    }

    fn exercise(sink: &dyn ResultSink) {
        for i in [4u32, 0, 2] {
            let key = ArtifactKey::partition("qr", "step1", PartitionIndex(i));
            let envelope = Envelope::wrap(&Marker(i), PartitionIndex(i)).unwrap();
            sink.put_envelope(&key, &envelope).unwrap();
        }
        sink.put_envelope(
            &ArtifactKey::partition("qr", "step1ForStep2", PartitionIndex(9)),
            &Envelope::wrap(&Marker(9), PartitionIndex(9)).unwrap(),
        )
        .unwrap();
        assert_eq!(
            sink.partitions("qr", "step1").unwrap(),
            vec![PartitionIndex(0), PartitionIndex(2), PartitionIndex(4)]
        );
        let back = sink
            .get_envelope(&ArtifactKey::partition("qr", "step1", PartitionIndex(2)))
            .unwrap();
        assert_eq!(back.unwrap::<Marker>().unwrap(), Marker(2));
        assert!(matches!(
            sink.get_envelope(&ArtifactKey::partition("qr", "step1", PartitionIndex(3))),
            Err(SinkError::NotFound(_))
        ));

        let removed = ArtifactKey::partition("qr", "step1", PartitionIndex(2));
        sink.remove_envelope(&removed).unwrap();
        sink.remove_envelope(&removed).unwrap();
        assert_eq!(
            sink.partitions("qr", "step1").unwrap(),
            vec![PartitionIndex(0), PartitionIndex(4)]
        );

        let result = GlobalResult::new()
            .with("mean", array![[0.1, -2.5e-8]])
            .with("matrixR", array![[1.0, 2.0], [0.0, 3.0]]);
        sink.publish("qr", &result).unwrap();
        assert_eq!(
            sink.get_table(&ArtifactKey::global("qr", "mean")).unwrap(),
            array![[0.1, -2.5e-8]]
        );
        assert_eq!(
            sink.get_table(&ArtifactKey::global("qr", "matrixR")).unwrap(),
            array![[1.0, 2.0], [0.0, 3.0]]
        );
    }

    #[test]
    fn filesystem_sink_stores_and_finds_artifacts() {
        let dir = tempdir().unwrap();
        let sink = FsSink::new(dir.path()).unwrap();
        exercise(&sink);
        assert!(dir.path().join("qr").join("step1x4.bin").is_file());
        assert!(dir.path().join("qr").join("matrixR.csv").is_file());
    }

    #[test]
    fn memory_sink_stores_and_finds_artifacts() {
        let sink = MemorySink::new();
        exercise(&sink);
        assert_eq!(sink.len(), 5);
    }

    #[test]
    fn names_cannot_escape_the_stage_directory() {
        let sink = MemorySink::new();
        let key = ArtifactKey::global("qr", "../secret");
        assert!(matches!(
            sink.put_table(&key, &array![[1.0]]),
            Err(SinkError::InvalidName(_))
        ));
    }

    #[test]
    fn stems_only_match_their_own_name() {
        assert_eq!(partition_of_stem("Qx12", "Q"), Some(PartitionIndex(12)));
        assert_eq!(partition_of_stem("step1ForStep2x3", "step1"), None);
        assert_eq!(partition_of_stem("matrixR", "matri"), None);
    }
}
