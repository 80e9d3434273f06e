use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::Sample;
use crate::error::PipelineError;

const DEFAULT_FOOTPRINT_BYTES: u64 = 120 * 1024 * 1024 * 1024;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub data_root: Option<String>,
    #[serde(default)]
    pub max_parallel_processes: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub disk_ceiling_bytes: Option<u64>,
    #[serde(default)]
    pub default_footprint_bytes: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    #[serde(default)]
    pub rate_limit_backoff_cap_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub data_root: Utf8PathBuf,
    pub max_parallel_processes: usize,
    pub batch_size: usize,
    pub disk_ceiling_bytes: u64,
    pub default_footprint_bytes: u64,
    pub max_retries: u32,
    pub step_timeout_secs: u64,
    pub rate_limit_backoff_cap_secs: u64,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PipelineError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("cardioseq.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(PipelineError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| PipelineError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| PipelineError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PipelineError> {
        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            data_root: Utf8PathBuf::from(config.data_root.unwrap_or_else(|| "data".to_string())),
            max_parallel_processes: config.max_parallel_processes.unwrap_or(4).max(1),
            batch_size: config.batch_size.unwrap_or(5).max(1),
            disk_ceiling_bytes: config
                .disk_ceiling_bytes
                .unwrap_or(4 * DEFAULT_FOOTPRINT_BYTES),
            default_footprint_bytes: config
                .default_footprint_bytes
                .unwrap_or(DEFAULT_FOOTPRINT_BYTES),
            max_retries: config.max_retries.unwrap_or(3),
            step_timeout_secs: config.step_timeout_secs.unwrap_or(6 * 60 * 60),
            rate_limit_backoff_cap_secs: config.rate_limit_backoff_cap_secs.unwrap_or(120),
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BacklogEntry {
    Shorthand(String),
    Detailed(BacklogEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BacklogEntryObject {
    pub id: String,
    #[serde(default)]
    pub disease: Option<String>,
    #[serde(default)]
    pub estimated_footprint_bytes: Option<u64>,
}

/// Load a sample backlog from either a JSON array of entries or a plain
/// newline-separated accession list. Input order is preserved.
pub fn load_backlog(path: &Path, config: &ResolvedConfig) -> Result<Vec<Sample>, PipelineError> {
    let content =
        fs::read_to_string(path).map_err(|_| PipelineError::BacklogRead(path.to_path_buf()))?;

    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        let entries: Vec<BacklogEntry> = serde_json::from_str(&content)
            .map_err(|err| PipelineError::BacklogParse(err.to_string()))?;
        return resolve_backlog(entries, config);
    }

    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            Ok(Sample {
                id: line.parse()?,
                disease: "unknown".to_string(),
                estimated_footprint_bytes: config.default_footprint_bytes,
            })
        })
        .collect()
}

pub fn resolve_backlog(
    entries: Vec<BacklogEntry>,
    config: &ResolvedConfig,
) -> Result<Vec<Sample>, PipelineError> {
    entries
        .into_iter()
        .map(|entry| match entry {
            BacklogEntry::Shorthand(value) => Ok(Sample {
                id: value.parse()?,
                disease: "unknown".to_string(),
                estimated_footprint_bytes: config.default_footprint_bytes,
            }),
            BacklogEntry::Detailed(obj) => Ok(Sample {
                id: obj.id.parse()?,
                disease: obj.disease.unwrap_or_else(|| "unknown".to_string()),
                estimated_footprint_bytes: obj
                    .estimated_footprint_bytes
                    .unwrap_or(config.default_footprint_bytes),
            }),
        })
        .collect()
}
