//! Transactional persistence for pipelines, workflows, steps, tasks, and
//! log entries, plus a per-pipeline object cache with TTL.

mod cache;
mod database;
mod migrations;
mod schema;

pub use cache::PipelineCache;
pub use database::{
    ApprovalOutcome, CancelOutcome, NewPipeline, NewStep, StateStore, StoreError,
};
pub use migrations::{MigrationError, MigrationRunner};
