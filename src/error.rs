//! Error taxonomy for the engine.
//!
//! Each subsystem owns its error enum next to its code; this module
//! re-exports them so embedders can match on the full taxonomy from one
//! place:
//!
//! - `SpecError`: invalid pipeline YAML; no pipeline row is created
//! - `QueueError`: queue admission and lifecycle failures
//! - `StoreError`: persistence failures; partial writes roll back
//! - `RuntimeError`: container pull/create/run failures and cancellation
//! - `CredentialError`: credential store backend failures
//! - `ApprovalError`: verdict validation failures
//! - `RunnerError`: task execution failures
//! - `EngineError`: the public surface's combined error
//!
//! Policy: user-triggered operations surface the first blocking error;
//! background paths (cron firings, retention, the log sink) log and
//! swallow.

pub use crate::approval::ApprovalError;
pub use crate::engine::EngineError;
pub use crate::queue::QueueError;
pub use crate::runner::RunnerError;
pub use crate::runtime::RuntimeError;
pub use crate::secrets::CredentialError;
pub use crate::spec::SpecError;
pub use crate::store::{MigrationError, StoreError};
