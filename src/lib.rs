//! pipeforge: a self-hosted CI engine.
//!
//! Compiles declarative YAML pipeline specifications into sequences of
//! container-executed steps, schedules them across a bounded worker pool,
//! persists every observable state transition, and supports approvals,
//! branch conditioning, cron triggers, retention, credential injection, and
//! mid-run cancellation.

pub mod approval;
pub mod cli;
pub mod config;
pub mod cron;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod retention;
pub mod runner;
pub mod runtime;
pub mod secrets;
pub mod spec;
pub mod store;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError, TriggerOptions};
pub use error::{
    ApprovalError, CredentialError, QueueError, RunnerError, RuntimeError, SpecError, StoreError,
};
