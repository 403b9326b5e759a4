//! Configuration
//!
//! `<data dir>/config/config.json`, written with defaults on first run.
//! Environment variables override the remote endpoint settings.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::session::default_data_dir;

pub const ENV_API_KEY: &str = "MEMORIA_API_KEY";
pub const ENV_FALLBACK_API_KEY: &str = "DEEPSEEK_API_KEY";
pub const ENV_BASE_URL: &str = "MEMORIA_BASE_URL";
pub const ENV_MODEL: &str = "MEMORIA_MODEL";
pub const ENV_DATA_DIR: &str = "MEMORIA_DATA_DIR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Data directory not found")]
    NoDataDir,
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Which token estimator to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    /// Whitespace-delimited word count
    #[default]
    Whitespace,
    /// cl100k_base BPE count
    Cl100k,
}

/// Tunables of the memory manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    /// Token budget for one request
    pub budget: u32,
    /// Classify after every N stored user messages
    pub classify_every: u32,
    /// How many recent unflagged messages each classification pass looks at
    pub classify_window: usize,
    /// Ordinary messages fetched per assembly
    pub retrieval_cap: usize,
    /// K: most recent ordinary messages never compacted
    pub retention_window: usize,
    /// M: ordinary messages summarized per compaction
    pub compaction_batch: usize,
    pub max_compaction_rounds: u32,
    pub chat_temperature: f32,
    pub judge_temperature: f32,
    pub summary_temperature: f32,
    pub style_temperature: f32,
    pub style_analysis: bool,
    pub knowledge_extraction: bool,
    pub knowledge_temperature: f32,
    pub estimator: EstimatorKind,
    /// Secrets and personal data: any message containing one is pinned
    /// without asking the model
    pub sensitive_keywords: Vec<String>,
    /// Explicit requests to keep something; checked on user input only
    pub manual_mark_keywords: Vec<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget: 3500,
            classify_every: 3,
            classify_window: 3,
            retrieval_cap: 100,
            retention_window: 5,
            compaction_batch: 20,
            max_compaction_rounds: 3,
            chat_temperature: 0.7,
            judge_temperature: 0.0,
            summary_temperature: 0.3,
            style_temperature: 0.3,
            style_analysis: true,
            knowledge_extraction: true,
            knowledge_temperature: 0.3,
            estimator: EstimatorKind::Whitespace,
            sensitive_keywords: strings(&[
                "password", "allergy", "allergic", "id number", "passport", "密码", "过敏", "身份证号",
            ]),
            manual_mark_keywords: strings(&["remember", "important", "记住", "重要"]),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget == 0 {
            return Err(ConfigError::Invalid("budget must be positive".to_string()));
        }
        if self.classify_every == 0 {
            return Err(ConfigError::Invalid("classifyEvery must be positive".to_string()));
        }
        if self.retrieval_cap == 0 {
            return Err(ConfigError::Invalid("retrievalCap must be positive".to_string()));
        }
        Ok(())
    }
}

/// Chat completion endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub model: String,
    /// Never written to disk; comes from the environment
    #[serde(skip)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com/v1".to_string(),
            model: "deepseek-chat".to_string(),
            api_key: None,
            timeout_secs: 120,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub memory: MemoryConfig,
    pub remote: RemoteConfig,
    /// Where sessions are stored; defaults to the data directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load from the default location, creating the directory layout and a
    /// default config file on first run, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var_os(ENV_DATA_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir().map_err(|_| ConfigError::NoDataDir)?,
        };
        let mut config = Self::load_from_dir(&base)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.memory.validate()?;
        Ok(config)
    }

    /// Load `<base>/config/config.json`, writing defaults if it is missing.
    pub fn load_from_dir(base: &Path) -> Result<Self, ConfigError> {
        for dir in [base.join("sessions"), base.join("config")] {
            if !dir.exists() {
                fs::create_dir_all(&dir)?;
            }
        }

        let path = base.join("config").join("config.json");
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            let config = AppConfig::default();
            fs::write(&path, serde_json::to_string_pretty(&config)?)?;
            info!(path = ?path, "Wrote default config");
            config
        };

        if config.data_dir.is_none() {
            config.data_dir = Some(base.to_path_buf());
        }
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(ENV_API_KEY).or_else(|| lookup(ENV_FALLBACK_API_KEY)) {
            if !key.trim().is_empty() {
                self.remote.api_key = Some(key);
            }
        }
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.remote.base_url = url;
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.remote.model = model;
        }
    }

    pub fn sessions_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir().map_err(|_| ConfigError::NoDataDir),
        }
    }
}
