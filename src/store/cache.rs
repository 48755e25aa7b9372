//! Per-pipeline object cache with TTL.
//!
//! Read paths on hot pipelines (status polling, approval submission) hit the
//! cache; every mutation through the store invalidates the entry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::model::Pipeline;

/// Default entry lifetime.
const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// TTL cache of pipeline rows keyed by id.
pub struct PipelineCache {
    ttl: Duration,
    entries: Mutex<HashMap<i64, (Pipeline, Instant)>>,
}

impl Default for PipelineCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl PipelineCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a clone of the cached pipeline if the entry is still fresh.
    pub fn get(&self, id: i64) -> Option<Pipeline> {
        let mut entries = self.entries.lock().expect("pipeline cache poisoned");
        match entries.get(&id) {
            Some((pipeline, stored)) if stored.elapsed() < self.ttl => Some(pipeline.clone()),
            Some(_) => {
                entries.remove(&id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, pipeline: Pipeline) {
        let mut entries = self.entries.lock().expect("pipeline cache poisoned");
        entries.insert(pipeline.id, (pipeline, Instant::now()));
    }

    pub fn invalidate(&self, id: i64) {
        self.entries
            .lock()
            .expect("pipeline cache poisoned")
            .remove(&id);
    }
}
