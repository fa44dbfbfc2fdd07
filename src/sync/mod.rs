pub mod backoff;
pub mod network;
pub mod orchestrator;
pub mod strategy;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::Operation;
use crate::storage::{repository, Database};

/// `app_config` key holding the completion time of the last full pass.
pub const LAST_SYNC_KEY: &str = "last_sync_at";

const DEFAULT_API_URL: &str = "http://localhost:8080/api";

/// Tunables for the orchestrator and background worker.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub sync_on_mutation: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            batch_size: 10,
            max_retries: 5,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            poll_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            sync_on_mutation: true,
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with `sync.*` and `api.base_url` entries from
    /// `app_config`. `FINTRAX_API_URL` wins over the stored base URL.
    pub async fn load(db: &Database) -> Result<Self> {
        let entries = db.read(|conn| Ok(repository::list_config(conn)?)).await?;
        let mut config = Self::default();
        for (key, value) in &entries {
            config.apply(key, value)?;
        }
        if let Ok(url) = std::env::var("FINTRAX_API_URL") {
            if !url.trim().is_empty() {
                config.api_base_url = url;
            }
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "api.base_url" => self.api_base_url = value.to_string(),
            "sync.batch_size" => {
                self.batch_size = parse_setting(key, value)?;
                if self.batch_size == 0 {
                    return Err(Error::Config("sync.batch_size must be at least 1".into()));
                }
            }
            "sync.max_retries" => self.max_retries = parse_setting(key, value)?,
            "sync.backoff_base_secs" => {
                self.backoff_base = Duration::from_secs(parse_setting(key, value)?)
            }
            "sync.backoff_max_secs" => {
                self.backoff_max = Duration::from_secs(parse_setting(key, value)?)
            }
            "sync.poll_interval_secs" => {
                self.poll_interval = Duration::from_secs(parse_setting(key, value)?)
            }
            "sync.request_timeout_secs" => {
                self.request_timeout = Duration::from_secs(parse_setting(key, value)?)
            }
            "sync.on_mutation" => self.sync_on_mutation = parse_setting(key, value)?,
            _ => {}
        }
        Ok(())
    }
}

fn parse_setting<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: {value:?}")))
}

/// Report returned after a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub status: PassStatus,
    pub synced: u64,
    pub failed: u64,
    pub conflicts: u64,
    pub collapsed: u64,
    pub batches: u32,
    pub remaining: u64,
}

impl PassReport {
    pub fn skipped() -> Self {
        Self {
            status: PassStatus::Skipped,
            ..Self::default()
        }
    }

    /// Derive the status from the counts gathered during a pass.
    pub fn finish(mut self) -> Self {
        self.status = if self.failed == 0 {
            PassStatus::Success
        } else if self.synced > 0 || self.conflicts > 0 {
            PassStatus::PartialFailure
        } else {
            PassStatus::Failed
        };
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PassStatus {
    #[default]
    Success,
    PartialFailure,
    Failed,
    /// Offline or another pass was already running.
    Skipped,
    /// The server refused our credentials; the pass stopped early.
    Unauthorized,
}

/// Observer for sync passes. All methods default to no-ops.
pub trait SyncProgress: Send + Sync {
    fn on_pass_start(&self, _queued: usize) {}
    fn on_batch_complete(&self, _batch: u32, _report: &PassReport) {}
    fn on_operation_failed(&self, _op: &Operation, _error: &Error) {}
    fn on_pass_complete(&self, _report: &PassReport) {}
}

pub struct NoopProgress;

impl SyncProgress for NoopProgress {}
