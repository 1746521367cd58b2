//! Job configuration: a TOML file holding the execution settings and one
//! section per kernel. The binary applies its command-line flags last.

use crate::kernels::implicit_als::AlsParams;
use crate::kernels::kmeans::KmeansParams;
use crate::kernels::linear_regression::RegressionMethod;
use crate::kernels::naive_bayes::NaiveBayesParams;
use crate::kernels::pca::PcaMethod;
use crate::config::{ConfigError, resolve_workers};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Size of the local worker pool. Zero means one worker per logical core.
    pub workers: usize,
    /// Row limit used when a single input file is cut into blocks.
    pub max_rows_per_block: usize,
    pub kmeans: KmeansParams,
    pub als: AlsParams,
    pub naive_bayes: NaiveBayesParams,
    pub linear_regression: LinearRegressionConfig,
    pub pca: PcaConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_rows_per_block: 4_096,
            kmeans: KmeansParams::default(),
            als: AlsParams::default(),
            naive_bayes: NaiveBayesParams::default(),
            linear_regression: LinearRegressionConfig::default(),
            pca: PcaConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearRegressionConfig {
    pub method: RegressionMethod,
    /// Number of leading columns that are features; the rest are responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_features: Option<usize>,
}

impl Default for LinearRegressionConfig {
    fn default() -> Self {
        Self {
            method: RegressionMethod::NormalEquations,
            n_features: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaConfig {
    pub method: PcaMethod,
}

impl JobConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: JobConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rows_per_block == 0 {
            return Err(ConfigError::Invalid(
                "max_rows_per_block must be positive".to_string(),
            ));
        }
        if self.kmeans.n_clusters == 0 {
            return Err(ConfigError::Invalid(
                "kmeans.n_clusters must be positive".to_string(),
            ));
        }
        if self.als.n_factors == 0 {
            return Err(ConfigError::Invalid(
                "als.n_factors must be positive".to_string(),
            ));
        }
        if self.naive_bayes.n_classes == 0 {
            return Err(ConfigError::Invalid(
                "naive_bayes.n_classes must be positive".to_string(),
            ));
        }
        if self.naive_bayes.alpha < 0.0 || self.als.alpha < 0.0 || self.als.lambda < 0.0 {
            return Err(ConfigError::Invalid(
                "smoothing and regularization weights must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolved_workers(&self) -> usize {
        resolve_workers(self.workers)
    }
}
