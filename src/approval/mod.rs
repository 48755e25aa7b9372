//! Human-in-the-loop approval gates.
//!
//! The runner consults the controller when it reaches an approval step: a
//! first visit records the request, blocks the step and pipeline, and
//! releases the worker; a verdict submitted through `submit` either resumes
//! the run (the task is re-enqueued under its original id) or finalizes the
//! pipeline as failed.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::model::{
    now_ts, ApprovalAction, ApprovalDecision, ApprovalState, ApprovalStrategy, Pipeline, Status,
    Step, StepApproval, StepKind, Task,
};
use crate::store::{ApprovalOutcome, StateStore, StoreError};

/// Default pipeline message when a rejection carries no comment.
pub const DEFAULT_REJECT_MESSAGE: &str = "审批被拒绝";

/// Message used when a pending approval runs out its timeout.
pub const EXPIRED_MESSAGE: &str = "approval timed out";

/// Errors from approval operations.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("not found: {0}")]
    NotFound(String),

    /// The pipeline is already terminal (finished, killed, or canceled).
    #[error("pipeline already finished")]
    AlreadyFinished,

    #[error("step '{0}' is not an approval step")]
    NotApprovalStep(String),

    #[error("approval already finalized")]
    AlreadyFinalized,

    #[error("user '{0}' is not an allowed approver")]
    NotAllowed(String),
}

/// What the runner should do at an approval step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// The approval is granted; continue with the next step.
    Proceed,
    /// The request is pending; release the worker.
    Suspend,
    /// The approval was rejected with this message.
    Rejected(String),
    /// The approval timed out.
    Expired,
}

/// Suspends and resumes runs at approval steps.
pub struct ApprovalController {
    store: Arc<StateStore>,
}

impl ApprovalController {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Evaluates an approval step from inside the runner.
    ///
    /// On first encounter the request metadata is persisted and the step and
    /// pipeline transition to blocked; the caller then returns the task,
    /// relinquishing its worker.
    pub async fn gate(&self, pipeline: &Pipeline, step: &Step) -> Result<Gate, ApprovalError> {
        let mut approval = step
            .approval
            .clone()
            .ok_or_else(|| ApprovalError::NotApprovalStep(step.name.clone()))?;

        match approval.state {
            ApprovalState::Approved => Ok(Gate::Proceed),
            ApprovalState::Rejected => Ok(Gate::Rejected(reject_message(&approval))),
            ApprovalState::Expired => Ok(Gate::Expired),
            ApprovalState::Pending => {
                let now = now_ts();

                if approval.requested_at > 0
                    && approval.timeout > 0
                    && now >= approval.expires_at
                {
                    approval.state = ApprovalState::Expired;
                    approval.finalized_at = now;
                    self.store.update_step_approval(step.id, &approval).await?;
                    return Ok(Gate::Expired);
                }

                if approval.requested_at == 0 {
                    approval.requested_at = now;
                    approval.requested_by = pipeline.author.clone();
                    if approval.timeout > 0 {
                        approval.expires_at = now + approval.timeout;
                    }
                }

                self.store
                    .apply_approval_request(pipeline.id, step.id, &approval, &approval.message)
                    .await?;
                Ok(Gate::Suspend)
            }
        }
    }

    /// Records a verdict for a blocked approval step.
    ///
    /// On approval (subject to the step's strategy) the step flips to
    /// success, the pipeline returns to running, and the original task is
    /// returned for re-enqueueing. On rejection the pipeline is finalized as
    /// failed with the comment as its message.
    pub async fn submit(
        &self,
        repo_id: i64,
        pipeline_id: i64,
        step_pid: i64,
        actor: &str,
        action: ApprovalAction,
        comment: &str,
    ) -> Result<(ApprovalState, Option<Task>), ApprovalError> {
        let pipeline = self
            .store
            .get_pipeline(pipeline_id)
            .await?
            .filter(|p| p.repo_id == repo_id)
            .ok_or_else(|| ApprovalError::NotFound(format!("pipeline {pipeline_id}")))?;

        if pipeline.status.is_terminal() {
            return Err(ApprovalError::AlreadyFinished);
        }

        let step = self
            .store
            .get_step_by_pid(pipeline_id, step_pid)
            .await?
            .ok_or_else(|| {
                ApprovalError::NotFound(format!("step {step_pid} of pipeline {pipeline_id}"))
            })?;

        if step.kind != StepKind::Approval {
            return Err(ApprovalError::NotApprovalStep(step.name.clone()));
        }
        let mut approval = step
            .approval
            .clone()
            .ok_or_else(|| ApprovalError::NotApprovalStep(step.name.clone()))?;

        if approval.state.is_terminal() {
            return Err(ApprovalError::AlreadyFinalized);
        }
        if !approval.allows(actor) {
            return Err(ApprovalError::NotAllowed(actor.to_string()));
        }

        let now = now_ts();

        if approval.requested_at > 0 && approval.timeout > 0 && now >= approval.expires_at {
            approval.state = ApprovalState::Expired;
            approval.finalized_at = now;
            self.store
                .apply_approval_outcome(&ApprovalOutcome {
                    pipeline_id,
                    step_id: step.id,
                    approval,
                    step_state: Status::Failure,
                    step_error: EXPIRED_MESSAGE.to_string(),
                    pipeline_status: Status::Failure,
                    pipeline_message: Some(EXPIRED_MESSAGE.to_string()),
                    finalize: true,
                    ts: now,
                })
                .await?;
            return Ok((ApprovalState::Expired, None));
        }

        approval.record_decision(ApprovalDecision {
            user: actor.to_string(),
            action,
            comment: comment.to_string(),
            timestamp: now,
        });

        match action {
            ApprovalAction::Reject => {
                approval.state = ApprovalState::Rejected;
                approval.finalized_at = now;
                approval.finalized_by = actor.to_string();

                let message = if comment.is_empty() {
                    DEFAULT_REJECT_MESSAGE.to_string()
                } else {
                    comment.to_string()
                };

                self.store
                    .apply_approval_outcome(&ApprovalOutcome {
                        pipeline_id,
                        step_id: step.id,
                        approval,
                        step_state: Status::Failure,
                        step_error: message.clone(),
                        pipeline_status: Status::Failure,
                        pipeline_message: Some(message),
                        finalize: true,
                        ts: now,
                    })
                    .await?;

                Ok((ApprovalState::Rejected, None))
            }
            ApprovalAction::Approve => {
                let granted = approval.approvers.is_empty()
                    || approval.strategy == ApprovalStrategy::Any
                    || approval.all_approved();

                if !granted {
                    // Strategy `all`: the decision is recorded, the gate
                    // stays pending until every approver has approved.
                    self.store.update_step_approval(step.id, &approval).await?;
                    return Ok((ApprovalState::Pending, None));
                }

                approval.state = ApprovalState::Approved;
                approval.finalized_at = now;
                approval.finalized_by = actor.to_string();

                self.store
                    .apply_approval_outcome(&ApprovalOutcome {
                        pipeline_id,
                        step_id: step.id,
                        approval,
                        step_state: Status::Success,
                        step_error: String::new(),
                        pipeline_status: Status::Running,
                        pipeline_message: None,
                        finalize: false,
                        ts: now,
                    })
                    .await?;

                let task = self.store.get_task_by_pipeline(pipeline_id).await?;
                if task.is_none() {
                    warn!(pipeline_id, "approved pipeline has no task row to resume");
                }

                Ok((ApprovalState::Approved, task))
            }
        }
    }
}

fn reject_message(approval: &StepApproval) -> String {
    approval
        .decisions
        .iter()
        .rev()
        .find(|d| d.action == ApprovalAction::Reject)
        .map(|d| {
            if d.comment.is_empty() {
                DEFAULT_REJECT_MESSAGE.to_string()
            } else {
                d.comment.clone()
            }
        })
        .unwrap_or_else(|| DEFAULT_REJECT_MESSAGE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, Repository};
    use crate::store::{NewPipeline, NewStep};
    use std::collections::HashMap;

    async fn setup(approvers: Vec<&str>, strategy: ApprovalStrategy) -> (Arc<StateStore>, Pipeline, Step) {
        let store = Arc::new(StateStore::in_memory().await.unwrap());
        store
            .upsert_repository(&Repository {
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

        let approval = StepApproval {
            message: "release gate".to_string(),
            approvers: approvers.into_iter().map(String::from).collect(),
            strategy,
            timeout: 3600,
            ..Default::default()
        };

        let (pipeline, _) = store
            .create_pipeline(
                NewPipeline {
                    repo_id: 1,
                    author: "alice".to_string(),
                    event: Event::Manual,
                    branch: "main".to_string(),
                    r#ref: String::new(),
                    commit: String::new(),
                    message: String::new(),
                    title: String::new(),
                    additional_variables: HashMap::new(),
                },
                "build",
                &[NewStep {
                    name: "gate".to_string(),
                    kind: StepKind::Approval,
                    approval: Some(approval),
                }],
                HashMap::new(),
            )
            .await
            .unwrap();

        let step = store.list_steps(pipeline.id).await.unwrap().remove(0);
        (store, pipeline, step)
    }

    #[tokio::test]
    async fn test_gate_first_visit_blocks() {
        let (store, pipeline, step) = setup(vec!["alice"], ApprovalStrategy::Any).await;
        let controller = ApprovalController::new(store.clone());

        let gate = controller.gate(&pipeline, &step).await.unwrap();
        assert_eq!(gate, Gate::Suspend);

        let reloaded = store.get_pipeline(pipeline.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, Status::Blocked);
        assert_eq!(reloaded.message, "release gate");

        let step = store.get_step(step.id).await.unwrap().unwrap();
        assert_eq!(step.state, Status::Blocked);
        let approval = step.approval.unwrap();
        assert!(approval.requested_at > 0);
        assert_eq!(approval.requested_by, "alice");
        assert_eq!(approval.expires_at, approval.requested_at + 3600);
    }

    #[tokio::test]
    async fn test_submit_approve_any_resumes() {
        let (store, pipeline, step) = setup(vec!["alice", "bob"], ApprovalStrategy::Any).await;
        let controller = ApprovalController::new(store.clone());
        controller.gate(&pipeline, &step).await.unwrap();

        let (state, task) = controller
            .submit(1, pipeline.id, step.pid, "bob", ApprovalAction::Approve, "ok")
            .await
            .unwrap();

        assert_eq!(state, ApprovalState::Approved);
        assert!(task.is_some());

        let step = store.get_step(step.id).await.unwrap().unwrap();
        assert_eq!(step.state, Status::Success);
        let pipeline = store.get_pipeline(pipeline.id).await.unwrap().unwrap();
        assert_eq!(pipeline.status, Status::Running);
    }

    #[tokio::test]
    async fn test_submit_approve_all_waits_for_everyone() {
        let (store, pipeline, step) = setup(vec!["alice", "bob"], ApprovalStrategy::All).await;
        let controller = ApprovalController::new(store.clone());
        controller.gate(&pipeline, &step).await.unwrap();

        let (state, task) = controller
            .submit(1, pipeline.id, step.pid, "alice", ApprovalAction::Approve, "")
            .await
            .unwrap();
        assert_eq!(state, ApprovalState::Pending);
        assert!(task.is_none());

        let (state, task) = controller
            .submit(1, pipeline.id, step.pid, "bob", ApprovalAction::Approve, "")
            .await
            .unwrap();
        assert_eq!(state, ApprovalState::Approved);
        assert!(task.is_some());
    }

    #[tokio::test]
    async fn test_submit_reject_finalizes_pipeline() {
        let (store, pipeline, step) = setup(vec!["alice"], ApprovalStrategy::Any).await;
        let controller = ApprovalController::new(store.clone());
        controller.gate(&pipeline, &step).await.unwrap();

        let (state, task) = controller
            .submit(1, pipeline.id, step.pid, "alice", ApprovalAction::Reject, "no")
            .await
            .unwrap();

        assert_eq!(state, ApprovalState::Rejected);
        assert!(task.is_none());

        let step = store.get_step(step.id).await.unwrap().unwrap();
        assert_eq!(step.state, Status::Failure);
        assert_eq!(step.error, "no");

        let pipeline = store.get_pipeline(pipeline.id).await.unwrap().unwrap();
        assert_eq!(pipeline.status, Status::Failure);
        assert_eq!(pipeline.message, "no");
        assert!(store
            .get_task_by_pipeline(pipeline.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_approver() {
        let (store, pipeline, step) = setup(vec!["alice"], ApprovalStrategy::Any).await;
        let controller = ApprovalController::new(store.clone());
        controller.gate(&pipeline, &step).await.unwrap();

        let err = controller
            .submit(1, pipeline.id, step.pid, "mallory", ApprovalAction::Approve, "")
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotAllowed(user) if user == "mallory"));
    }

    #[tokio::test]
    async fn test_submit_after_cancel_reports_terminal() {
        let (store, pipeline, step) = setup(vec!["alice"], ApprovalStrategy::Any).await;
        let controller = ApprovalController::new(store.clone());
        controller.gate(&pipeline, &step).await.unwrap();

        store
            .cancel_pipeline(pipeline.id, "Pipeline cancelled by user")
            .await
            .unwrap();

        let err = controller
            .submit(1, pipeline.id, step.pid, "alice", ApprovalAction::Approve, "")
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyFinished));
    }

    #[tokio::test]
    async fn test_submit_wrong_repo_is_not_found() {
        let (store, pipeline, step) = setup(vec!["alice"], ApprovalStrategy::Any).await;
        let controller = ApprovalController::new(store);

        let err = controller
            .submit(999, pipeline.id, step.pid, "alice", ApprovalAction::Approve, "")
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_gate_translates_terminal_states() {
        let (store, pipeline, step) = setup(vec![], ApprovalStrategy::Any).await;
        let controller = ApprovalController::new(store.clone());

        let mut approval = step.approval.clone().unwrap();
        approval.state = ApprovalState::Approved;
        store.update_step_approval(step.id, &approval).await.unwrap();
        let step = store.get_step(step.id).await.unwrap().unwrap();

        assert_eq!(controller.gate(&pipeline, &step).await.unwrap(), Gate::Proceed);
    }
}
