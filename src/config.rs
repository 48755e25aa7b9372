//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the pipeline engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite database URL.
    pub database_url: String,
    /// Default workspace root; per-run directories live under
    /// `<root>/<repo>/<pipeline_id>`.
    pub workspace_root: PathBuf,
    /// Number of task workers.
    pub workers: usize,
    /// Queue capacity; triggers beyond it fail with a queue-full error.
    pub queue_capacity: usize,
    /// How often the cron scheduler checks for due entries.
    pub cron_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:pipeforge.db".to_string(),
            workspace_root: std::env::temp_dir().join("pipeforge").join("workspaces"),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 100,
            cron_poll_interval: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_cron_poll_interval(mut self, interval: Duration) -> Self {
        self.cron_poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.queue_capacity, 100);
        assert!(config.workspace_root.ends_with("pipeforge/workspaces"));
    }

    #[test]
    fn test_builder_clamps_to_one() {
        let config = EngineConfig::new().with_workers(0).with_queue_capacity(0);
        assert_eq!(config.workers, 1);
        assert_eq!(config.queue_capacity, 1);
    }
}
