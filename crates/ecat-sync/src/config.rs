use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use ecat_core::{Identifier, Schema};
use ecat_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

pub const DEFAULT_USER_AGENT: &str = "CKAN-Ecosystem-Catalog/1.0 (https://ecosystem.ckan.org)";
pub const DEFAULT_CKAN_URL: &str = "https://ecosystem.ckan.org";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("unknown dataset `{0}`")]
    UnknownDataset(String),
}

/// Process configuration, read once and injected into each component.
#[derive(Debug, Clone, Serialize)]
pub struct SyncConfig {
    pub concurrency: usize,
    pub per_call_timeout: Duration,
    pub authoritative_for_absence: bool,
    pub retry_limit: u32,
    pub user_agent: String,
    pub ckan_url: String,
    #[serde(skip_serializing)]
    pub ckan_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub github_token: Option<String>,
    pub github_api_url: String,
    pub reports_dir: PathBuf,
    pub datasets_file: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            per_call_timeout: Duration::from_secs(15),
            authoritative_for_absence: false,
            retry_limit: 3,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            ckan_url: DEFAULT_CKAN_URL.to_string(),
            ckan_api_key: None,
            github_token: None,
            github_api_url: ecat_sources::DEFAULT_GITHUB_API.to_string(),
            reports_dir: PathBuf::from("./reports"),
            datasets_file: PathBuf::from("./datasets.yaml"),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            concurrency: parse_var(&lookup, "ECAT_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            per_call_timeout: parse_var::<u64>(&lookup, "ECAT_PER_CALL_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.per_call_timeout),
            authoritative_for_absence: match lookup("ECAT_AUTHORITATIVE_FOR_ABSENCE") {
                Some(v) => parse_flag("ECAT_AUTHORITATIVE_FOR_ABSENCE", &v)?,
                None => defaults.authoritative_for_absence,
            },
            retry_limit: parse_var(&lookup, "ECAT_RETRY_LIMIT")?.unwrap_or(defaults.retry_limit),
            user_agent: lookup("ECAT_USER_AGENT").unwrap_or(defaults.user_agent),
            ckan_url: lookup("CKAN_URL").unwrap_or(defaults.ckan_url),
            ckan_api_key: lookup("CKAN_API_KEY").filter(|v| !v.is_empty()),
            github_token: lookup("GITHUB_TOKEN").filter(|v| !v.is_empty()),
            github_api_url: lookup("GITHUB_API_URL").unwrap_or(defaults.github_api_url),
            reports_dir: lookup("ECAT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            datasets_file: lookup("ECAT_DATASETS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.datasets_file),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "ECAT_CONCURRENCY",
                value: "0".into(),
                reason: "must be a positive integer",
            });
        }
        if self.retry_limit == 0 {
            return Err(ConfigError::Invalid {
                var: "ECAT_RETRY_LIMIT",
                value: "0".into(),
                reason: "at least one attempt is required",
            });
        }
        if self.per_call_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                var: "ECAT_PER_CALL_TIMEOUT_SECS",
                value: "0".into(),
                reason: "must be positive",
            });
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::default().with_max_attempts(self.retry_limit)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
            var,
            value,
            reason: "expected a non-negative integer",
        }),
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected true or false",
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Extensions,
    Sites,
}

impl DatasetKind {
    pub fn schema(self) -> Schema {
        match self {
            Self::Extensions => Schema::extensions(),
            Self::Sites => Schema::sites(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub dataset_id: String,
    pub kind: DatasetKind,
    pub snapshot_resource: String,
    pub timeseries_resource: String,
    pub identifiers_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetConfig>,
}

impl DatasetRegistry {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, dataset_id: &str) -> Result<&DatasetConfig, ConfigError> {
        self.datasets
            .iter()
            .find(|d| d.dataset_id == dataset_id)
            .ok_or_else(|| ConfigError::UnknownDataset(dataset_id.to_string()))
    }
}

const HEADER_NAMES: [&str; 4] = ["url", "urls", "github_url", "repository_url"];

/// One identifier per line; blanks, `#` comments and a leading header are skipped.
pub fn parse_identifiers(text: &str) -> Vec<Identifier> {
    text.lines()
        .map(|line| line.split(',').next().unwrap_or_default().trim())
        .enumerate()
        .filter(|(i, line)| {
            !(line.is_empty()
                || line.starts_with('#')
                || (*i == 0 && HEADER_NAMES.contains(&line.to_ascii_lowercase().as_str())))
        })
        .map(|(_, line)| Identifier::new(line))
        .collect()
}

pub async fn load_identifiers(path: &Path) -> anyhow::Result<Vec<Identifier>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading identifier list {}", path.display()))?;
    Ok(parse_identifiers(&text))
}
