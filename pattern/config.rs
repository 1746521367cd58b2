//! Configuration shared by every job: the error type for invalid settings and
//! the worker-count override read from the environment.

use thiserror::Error;

/// Overrides the configured worker count when set to a positive integer.
pub const WORKERS_ENV_VAR: &str = "COALESCE_WORKERS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Worker count after applying `COALESCE_WORKERS` to `configured`. Zero
/// means one worker per logical core.
pub fn resolve_workers(configured: usize) -> usize {
    let from_env = std::env::var(WORKERS_ENV_VAR).ok();
    workers_with_override(configured, from_env.as_deref())
}

fn workers_with_override(configured: usize, env_value: Option<&str>) -> usize {
    let overridden = env_value
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|&n| n > 0);
    match overridden.unwrap_or(configured) {
        0 => num_cpus::get(),
        n => n,
    }
}
