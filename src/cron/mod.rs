//! Cron-triggered pipeline runs.
//!
//! The scheduler reconciles its entries against the repo pipeline configs at
//! startup and whenever settings change: each repo contributes one entry per
//! sanitized cron expression. A cooperative ticker fires due entries; every
//! firing synthesizes a manual-style trigger with `CRON_*` variables.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::store::{StateStore, StoreError};

/// A cron firing handed to the trigger surface.
#[derive(Debug, Clone)]
pub struct CronFiring {
    pub repo_id: i64,
    pub expression: String,
    pub at: DateTime<Utc>,
}

/// Receives cron firings; implemented by the engine's trigger path.
#[async_trait]
pub trait CronTrigger: Send + Sync {
    async fn fire(&self, firing: CronFiring);
}

struct CronEntry {
    expression: String,
    schedule: Cron,
    next: Option<DateTime<Utc>>,
}

/// Watches repo pipeline configs and fires their cron schedules.
pub struct CronScheduler {
    store: Arc<StateStore>,
    entries: Mutex<HashMap<i64, Vec<CronEntry>>>,
    stop: CancellationToken,
}

impl CronScheduler {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
        }
    }

    /// Rebuilds every repo's entries from the database. Existing entries
    /// for a repo are replaced wholesale; invalid expressions are skipped
    /// without affecting their siblings.
    pub async fn reconcile(&self) -> Result<(), StoreError> {
        let configs = self.store.list_pipeline_configs().await?;
        let now = Utc::now();

        let mut entries = self.entries.lock().expect("cron entries poisoned");
        entries.clear();

        for config in configs {
            let schedules = sanitize_schedules(&config.effective_cron_schedules());
            if schedules.is_empty() {
                continue;
            }

            let mut repo_entries = Vec::with_capacity(schedules.len());
            for expression in schedules {
                match Cron::new(&expression).parse() {
                    Ok(schedule) => {
                        let next = schedule.find_next_occurrence(&now, false).ok();
                        debug!(repo_id = config.repo_id, %expression, next = ?next, "registered cron entry");
                        repo_entries.push(CronEntry {
                            expression,
                            schedule,
                            next,
                        });
                    }
                    Err(e) => {
                        warn!(repo_id = config.repo_id, %expression, error = %e, "skipping invalid cron expression");
                    }
                }
            }

            if !repo_entries.is_empty() {
                entries.insert(config.repo_id, repo_entries);
            }
        }

        info!(repos = entries.len(), "cron entries reconciled");
        Ok(())
    }

    /// Runs the ticker until shutdown. Due entries fire on a spawned task
    /// so a panicking trigger path never takes the scheduler down.
    pub async fn run(self: Arc<Self>, config: &EngineConfig, trigger: Arc<dyn CronTrigger>) {
        let mut ticker = tokio::time::interval(config.cron_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for firing in self.due_firings(Utc::now()) {
                let trigger = Arc::clone(&trigger);
                let handle = tokio::spawn(async move {
                    trigger.fire(firing).await;
                });
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!(error = %e, "cron firing panicked");
                    }
                }
            }
        }

        info!("cron scheduler stopped");
    }

    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Collects entries due at `now` and advances their next occurrence.
    fn due_firings(&self, now: DateTime<Utc>) -> Vec<CronFiring> {
        let mut due = Vec::new();
        let mut entries = self.entries.lock().expect("cron entries poisoned");

        for (repo_id, repo_entries) in entries.iter_mut() {
            for entry in repo_entries.iter_mut() {
                let Some(next) = entry.next else { continue };
                if next > now {
                    continue;
                }

                due.push(CronFiring {
                    repo_id: *repo_id,
                    expression: entry.expression.clone(),
                    at: now,
                });
                entry.next = entry.schedule.find_next_occurrence(&now, false).ok();
            }
        }

        due
    }
}

/// Trims whitespace and surrounding quotes, drops empties, and removes
/// duplicates while preserving order. Legacy rows sometimes stored quoted
/// values.
pub fn sanitize_schedules(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    for expression in raw {
        let trimmed = expression
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim()
            .to_string();
        if trimmed.is_empty() || out.contains(&trimmed) {
            continue;
        }
        out.push(trimmed);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RepoPipelineConfig;

    #[test]
    fn test_sanitize_schedules() {
        let raw = vec![
            "  0 3 * * *  ".to_string(),
            "\"0 3 * * *\"".to_string(),
            "'*/5 * * * *'".to_string(),
            "   ".to_string(),
            String::new(),
        ];

        assert_eq!(sanitize_schedules(&raw), vec!["0 3 * * *", "*/5 * * * *"]);
    }

    #[tokio::test]
    async fn test_reconcile_skips_invalid_expressions() {
        let store = Arc::new(StateStore::in_memory().await.unwrap());
        store
            .upsert_repository(&crate::model::Repository {
                id: 1,
                owner: "acme".to_string(),
                name: "app".to_string(),
                full_name: "acme/app".to_string(),
                url: String::new(),
                clone_url: String::new(),
                branch: "main".to_string(),
                active: true,
            })
            .await
            .unwrap();

        let mut config = RepoPipelineConfig::new(1);
        config.cron_schedules = vec![
            "0 3 * * *".to_string(),
            "not a cron".to_string(),
            "*/10 * * * *".to_string(),
        ];
        store.upsert_pipeline_config(&config).await.unwrap();

        let scheduler = CronScheduler::new(store);
        scheduler.reconcile().await.unwrap();

        let entries = scheduler.entries.lock().unwrap();
        assert_eq!(entries[&1].len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_upgrades_legacy_spec() {
        let store = Arc::new(StateStore::in_memory().await.unwrap());
        store
            .upsert_repository(&crate::model::Repository {
                id: 2,
                owner: "acme".to_string(),
                name: "legacy".to_string(),
                full_name: "acme/legacy".to_string(),
                url: String::new(),
                clone_url: String::new(),
                branch: "main".to_string(),
                active: true,
            })
            .await
            .unwrap();

        let mut config = RepoPipelineConfig::new(2);
        config.cron_enabled = true;
        config.cron_spec = "\"30 2 * * *\"".to_string();
        store.upsert_pipeline_config(&config).await.unwrap();

        let scheduler = CronScheduler::new(store);
        scheduler.reconcile().await.unwrap();

        let entries = scheduler.entries.lock().unwrap();
        assert_eq!(entries[&2].len(), 1);
        assert_eq!(entries[&2][0].expression, "30 2 * * *");
    }

    #[tokio::test]
    async fn test_due_firings_advance() {
        let store = Arc::new(StateStore::in_memory().await.unwrap());
        let scheduler = CronScheduler::new(store);

        let schedule = Cron::new("* * * * *").parse().unwrap();
        let past = Utc::now() - chrono::Duration::minutes(5);
        scheduler.entries.lock().unwrap().insert(
            7,
            vec![CronEntry {
                expression: "* * * * *".to_string(),
                schedule,
                next: Some(past),
            }],
        );

        let now = Utc::now();
        let due = scheduler.due_firings(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].repo_id, 7);
        assert_eq!(due[0].expression, "* * * * *");

        // The entry advanced past `now`; nothing fires twice.
        assert!(scheduler.due_firings(now).is_empty());
    }
}
