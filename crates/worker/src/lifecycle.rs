//! Shared job state machine.
//!
//! `Queued -> Started -> {Completed | Failed}`, with `Canceled` set from
//! outside. Every transition runs in its own store transaction and its
//! events are published on the bus only after the commit succeeds.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use plandiff_core::error::CoreError;
use plandiff_core::job::{EventSubject, JobEvent, JobEventType, JobStatus};
use plandiff_core::store::{Store, StoreTx};
use plandiff_core::types::EntityId;
use plandiff_events::JobEventBus;
use serde_json::json;

use crate::error::JobResult;
use crate::handlers::{metadata, HandlerOutput};

/// Identity of the job a lifecycle call operates on.
#[derive(Debug, Clone)]
pub struct JobScope {
    pub job_id: EntityId,
    pub job_type: String,
    pub subject: EventSubject,
}

impl JobScope {
    pub fn new(job_id: impl Into<EntityId>, job_type: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: job_type.into(),
            subject: EventSubject::default(),
        }
    }

    pub fn with_subject(mut self, subject: EventSubject) -> Self {
        self.subject = subject;
        self
    }

    fn event(&self, event_type: JobEventType) -> JobEvent {
        JobEvent::new(&self.job_type, &self.job_id, event_type).with_subject(&self.subject)
    }
}

/// How a delivery ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Canceled,
    AlreadyFinished(JobStatus),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => f.write_str("canceled"),
            Self::AlreadyFinished(status) => write!(f, "already {status}"),
        }
    }
}

/// Result of staging one transition: the value to return, the events
/// that were appended and whether the writes should be committed.
struct Transition<T> {
    value: T,
    events: Vec<JobEvent>,
    commit: bool,
}

impl<T> Transition<T> {
    fn commit(value: T, events: Vec<JobEvent>) -> Self {
        Self {
            value,
            events,
            commit: true,
        }
    }

    fn discard(value: T) -> Self {
        Self {
            value,
            events: Vec::new(),
            commit: false,
        }
    }
}

#[derive(Clone)]
pub struct LifecycleController {
    store: Arc<dyn Store>,
    bus: Option<Arc<JobEventBus>>,
}

impl LifecycleController {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, bus: None }
    }

    pub fn with_bus(mut self, bus: Arc<JobEventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Run `handler` under the job lifecycle.
    ///
    /// Transient failures are returned without marking the job so the
    /// delivery can be retried. Permanent failures mark the job `Failed`
    /// in a fresh transaction and are then returned.
    pub async fn execute<F, Fut>(&self, scope: &JobScope, handler: F) -> JobResult<Disposition>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = JobResult<HandlerOutput>>,
    {
        if let Some(reason) = self.start(scope).await? {
            tracing::info!(reason = %reason, "Skipping job");
            return Ok(Disposition::Skipped(reason));
        }

        let started = Instant::now();
        let result = match handler().await {
            Ok(output) => self.complete(scope, output).await,
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(disposition) => {
                tracing::info!(elapsed_ms, ?disposition, "Job finished");
                Ok(disposition)
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    elapsed_ms,
                    error = %e,
                    error_type = e.error_type(),
                    "Job hit a transient error, leaving it for redelivery"
                );
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    elapsed_ms,
                    error = %e,
                    error_type = e.error_type(),
                    "Job failed"
                );
                if let Err(mark) = self.fail(scope, &e).await {
                    tracing::error!(error = %mark, "Could not record job failure");
                    return Err(mark);
                }
                Err(e)
            }
        }
    }

    /// `Queued -> Started`. Returns a skip reason when the job must not run.
    pub async fn start(&self, scope: &JobScope) -> JobResult<Option<SkipReason>> {
        let mut tx = self.store.begin().await?;
        let staged = start_in(tx.as_mut(), scope).await;
        self.finish(tx, staged).await
    }

    /// Apply the handler's changeset and mark the job `Completed`, unless it
    /// was canceled while the handler ran.
    pub async fn complete(&self, scope: &JobScope, output: HandlerOutput) -> JobResult<Disposition> {
        let mut tx = self.store.begin().await?;
        let staged = complete_in(tx.as_mut(), scope, output).await;
        self.finish(tx, staged).await
    }

    /// Mark the job `Failed` with the error recorded on the event. A job
    /// that is missing or already terminal is left untouched.
    pub async fn fail(&self, scope: &JobScope, error: &crate::error::JobError) -> JobResult<()> {
        let mut tx = self.store.begin().await?;
        let staged = fail_in(tx.as_mut(), scope, error).await;
        self.finish(tx, staged).await
    }

    async fn finish<T>(
        &self,
        tx: Box<dyn StoreTx>,
        staged: JobResult<Transition<T>>,
    ) -> JobResult<T> {
        match staged {
            Ok(transition) if transition.commit => {
                tx.commit().await?;
                self.publish(transition.events);
                Ok(transition.value)
            }
            Ok(transition) => {
                rollback(tx).await;
                Ok(transition.value)
            }
            Err(e) => {
                rollback(tx).await;
                Err(e)
            }
        }
    }

    fn publish(&self, events: Vec<JobEvent>) {
        let Some(bus) = &self.bus else { return };
        for event in events {
            bus.publish(event);
        }
    }
}

async fn rollback(tx: Box<dyn StoreTx>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "Transaction rollback failed");
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

async fn start_in(
    tx: &mut dyn StoreTx,
    scope: &JobScope,
) -> JobResult<Transition<Option<SkipReason>>> {
    let Some(job) = tx.job_for_update(&scope.job_id).await? else {
        return Err(CoreError::not_found("job", &scope.job_id).into());
    };

    match job.status {
        JobStatus::Canceled => Ok(Transition::discard(Some(SkipReason::Canceled))),
        status @ (JobStatus::Completed | JobStatus::Failed) => {
            Ok(Transition::discard(Some(SkipReason::AlreadyFinished(status))))
        }
        JobStatus::Queued | JobStatus::Started => {
            if job.status == JobStatus::Queued {
                tx.update_job_status(&scope.job_id, JobStatus::Started).await?;
            }
            let mut events = Vec::new();
            let event = scope.event(JobEventType::Started);
            if tx.append_job_event(&event).await? {
                events.push(event);
            } else {
                tracing::debug!("Started event already recorded, redelivery");
            }
            Ok(Transition::commit(None, events))
        }
    }
}

async fn complete_in(
    tx: &mut dyn StoreTx,
    scope: &JobScope,
    output: HandlerOutput,
) -> JobResult<Transition<Disposition>> {
    let Some(job) = tx.job_for_update(&scope.job_id).await? else {
        return Err(CoreError::not_found("job", &scope.job_id).into());
    };

    match job.status {
        JobStatus::Canceled => {
            tracing::info!("Job canceled while running, discarding results");
            return Ok(Transition::discard(Disposition::Skipped(SkipReason::Canceled)));
        }
        status @ (JobStatus::Completed | JobStatus::Failed) => {
            tracing::warn!(status = %status, "Job finished elsewhere while running");
            return Ok(Transition::discard(Disposition::Skipped(
                SkipReason::AlreadyFinished(status),
            )));
        }
        JobStatus::Queued | JobStatus::Started => {}
    }

    output.changeset.apply(tx).await?;
    tx.update_job_status(&scope.job_id, JobStatus::Completed).await?;

    let mut events = Vec::new();
    let event = scope
        .event(JobEventType::Completed)
        .with_metadata(output.metadata)
        .with_llm_usage(output.usage);
    if tx.append_job_event(&event).await? {
        events.push(event);
    }
    Ok(Transition::commit(Disposition::Completed, events))
}

async fn fail_in(
    tx: &mut dyn StoreTx,
    scope: &JobScope,
    error: &crate::error::JobError,
) -> JobResult<Transition<()>> {
    let Some(job) = tx.job_for_update(&scope.job_id).await? else {
        return Ok(Transition::discard(()));
    };
    if job.status.is_terminal() {
        return Ok(Transition::discard(()));
    }

    tx.update_job_status(&scope.job_id, JobStatus::Failed).await?;
    let mut events = Vec::new();
    let event = scope.event(JobEventType::Failed).with_metadata(metadata(json!({
        "errorType": error.error_type(),
        "errorKind": error.kind().as_str(),
        "message": error.to_string(),
    })));
    if tx.append_job_event(&event).await? {
        events.push(event);
    }
    Ok(Transition::commit((), events))
}
