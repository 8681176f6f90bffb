//! Pipeline configuration.
//!
//! Every tunable lives in [`PipelineConfig`]. It is assembled from an optional
//! `linkrank.{toml,json,yaml}` file and `LINKRANK__*` environment variables
//! (double underscore separates sections, e.g. `LINKRANK__RANK__DAMPING=0.9`),
//! and each component receives its own section at construction.

use crate::error::Result;
use crate::urls::{DEFAULT_BLOCKED_EXTENSIONS, UrlPolicy};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DATABASE_FILE: &str = "linkrank.db";
pub const LINKS_DIR: &str = "links";
pub const SCORES_DIR: &str = "scores";
pub const SNAPSHOT_FILE: &str = "pagerank_scores.json";
pub const RANK_LOCK_FILE: &str = "rank.lock";
pub const CONFIG_FILE: &str = "linkrank.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub frontier_queue: String,
    pub content_queue: String,
    pub blocked_extensions: Vec<String>,
    pub store: StoreConfig,
    pub fetch: FetchConfig,
    pub frontier: FrontierConfig,
    pub crawl: CrawlConfig,
    pub rank: RankConfig,
    pub index: IndexConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            frontier_queue: "url_frontier".to_string(),
            content_queue: "content_for_indexing".to_string(),
            blocked_extensions: DEFAULT_BLOCKED_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            store: StoreConfig::default(),
            fetch: FetchConfig::default(),
            frontier: FrontierConfig::default(),
            crawl: CrawlConfig::default(),
            rank: RankConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration. An explicit `file` must exist; otherwise a
    /// `linkrank.*` file in the current directory is picked up if present.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        builder = match file {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("linkrank").required(false)),
        };
        let config = builder
            .add_source(
                Environment::with_prefix("LINKRANK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn links_dir(&self) -> PathBuf {
        self.data_dir.join(LINKS_DIR)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SCORES_DIR).join(SNAPSHOT_FILE)
    }

    pub fn rank_lock_path(&self) -> PathBuf {
        self.data_dir.join(RANK_LOCK_FILE)
    }

    pub fn url_policy(&self) -> UrlPolicy {
        UrlPolicy::new(&self.blocked_extensions)
    }
}

/// SQLite connection behaviour and the process-level reconnect loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub busy_timeout_ms: u64,
    pub connect_attempts: u32,
    pub connect_initial_backoff_ms: u64,
    pub connect_max_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            connect_attempts: 5,
            connect_initial_backoff_ms: 500,
            connect_max_backoff_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: linkrank_scanner::fetcher::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Lease and retry policy for frontier deliveries.
///
/// `max_deliveries = 1` makes a failed fetch terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontierConfig {
    pub lease_timeout_secs: u64,
    pub max_deliveries: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            lease_timeout_secs: 60,
            max_deliveries: 1,
            retry_initial_backoff_ms: 30_000,
            retry_max_backoff_ms: 3_600_000,
        }
    }
}

impl FrontierConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

/// Which discovered links are fed back into the frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowMode {
    /// Only links pointing at another registrable domain.
    CrossDomain,
    /// Every valid link.
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub workers: usize,
    pub follow_mode: FollowMode,
    pub politeness_delay_ms: u64,
    pub idle_poll_ms: u64,
    pub exit_when_idle: bool,
    pub max_idle_polls: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            follow_mode: FollowMode::CrossDomain,
            politeness_delay_ms: 1_000,
            idle_poll_ms: 500,
            exit_when_idle: false,
            max_idle_polls: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankConfig {
    pub damping: f64,
    pub iterations: usize,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            damping: 0.85,
            iterations: 15,
        }
    }
}

impl RankConfig {
    /// Floor applied to every node each round, and the score of unknown URLs.
    pub fn base_score(&self) -> f64 {
        1.0 - self.damping
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub score_refresh_secs: u64,
    pub lease_timeout_secs: u64,
    pub idle_poll_ms: u64,
    pub exit_when_idle: bool,
    pub max_idle_polls: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            score_refresh_secs: 5,
            lease_timeout_secs: 60,
            idle_poll_ms: 500,
            exit_when_idle: false,
            max_idle_polls: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tunables() {
        let config = PipelineConfig::default();
        assert_eq!(config.rank.damping, 0.85);
        assert_eq!(config.rank.iterations, 15);
        assert_eq!(config.fetch.timeout_secs, 10);
        assert_eq!(config.frontier.max_deliveries, 1);
        assert_eq!(config.frontier_queue, "url_frontier");
        assert_eq!(config.content_queue, "content_for_indexing");
        assert!(config.blocked_extensions.iter().any(|e| e == ".pdf"));
        assert!((config.rank.base_score() - 0.15).abs() < 1e-12);
    }

    #[test]
    fn test_paths_derive_from_data_dir() {
        let config = PipelineConfig {
            data_dir: PathBuf::from("/tmp/lr"),
            ..PipelineConfig::default()
        };
        assert_eq!(config.database_path(), PathBuf::from("/tmp/lr/linkrank.db"));
        assert_eq!(config.links_dir(), PathBuf::from("/tmp/lr/links"));
        assert_eq!(
            config.snapshot_path(),
            PathBuf::from("/tmp/lr/scores/pagerank_scores.json")
        );
    }

    #[test]
    fn test_load_partial_json_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.json");
        std::fs::write(
            &path,
            r#"{ "rank": { "iterations": 3 }, "crawl": { "follow_mode": "all" } }"#,
        )
        .unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.rank.iterations, 3);
        assert_eq!(config.rank.damping, 0.85);
        assert_eq!(config.crawl.follow_mode, FollowMode::All);
        assert_eq!(config.crawl.workers, 4);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nope.json");
        assert!(PipelineConfig::load(Some(&path)).is_err());
    }
}
