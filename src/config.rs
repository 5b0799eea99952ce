use crate::errors::AppResult;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DB_PATH_ENV: &str = "NOTEBOOK_SYNC_DB";
const LOG_FILTER_ENV: &str = "NOTEBOOK_SYNC_LOG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub log_filter: String,
    pub notification_capacity: usize,
    pub comment_feed_capacity: usize,
    pub refetch_on_settle: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("notebooks.db"),
            log_dir: None,
            log_filter: "info".to_string(),
            notification_capacity: 64,
            comment_feed_capacity: 256,
            refetch_on_settle: true,
        }
    }
}

impl EngineConfig {
    /// Reads YAML from `path`; a missing file means defaults. Env overrides apply last.
    pub fn load(path: &Path) -> AppResult<Self> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading engine config {}", path.display()))?;
            Self::from_yaml(&raw)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(DB_PATH_ENV).filter(|value| !value.trim().is_empty()) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(filter) = lookup(LOG_FILTER_ENV).filter(|value| !value.trim().is_empty()) {
            self.log_filter = filter;
        }
    }
}
