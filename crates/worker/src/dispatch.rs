//! Job registry and dispatcher.
//!
//! [`route`] resolves a parsed envelope into a typed [`JobPayload`]; the
//! [`Dispatcher`] runs the matching handler under the lifecycle controller
//! inside a per-job tracing span.

use plandiff_core::envelope::JobEnvelope;
use plandiff_core::error::CoreError;
use plandiff_core::payload::{JobPayload, JobType};
use plandiff_core::types::EntityId;
use tracing::{field, Instrument};

use crate::error::{JobError, JobResult};
use crate::handlers::{detect, overlay, preprocess, HandlerContext, HandlerOutput};
use crate::lifecycle::{Disposition, JobScope, LifecycleController};

/// Look up the envelope's job type and decode its payload strictly.
pub fn route(envelope: &JobEnvelope) -> Result<JobPayload, CoreError> {
    let job_type = JobType::parse(&envelope.job_type)?;
    JobPayload::decode(job_type, &envelope.payload)
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: HandlerContext,
    lifecycle: LifecycleController,
}

impl Dispatcher {
    pub fn new(ctx: HandlerContext, lifecycle: LifecycleController) -> Self {
        Self { ctx, lifecycle }
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    /// Route and execute one envelope.
    ///
    /// A payload that cannot be routed is a permanent failure and marks
    /// the job `Failed` when the job row exists.
    pub async fn dispatch(&self, envelope: &JobEnvelope, message_id: &str) -> JobResult<Disposition> {
        let span = tracing::info_span!(
            "job",
            job_id = %envelope.job_id,
            job_type = %envelope.job_type,
            message_id,
            drawing_id = field::Empty,
            sheet_id = field::Empty,
            block_id = field::Empty,
            overlay_id = field::Empty,
        );
        self.dispatch_inner(envelope, &span).instrument(span.clone()).await
    }

    async fn dispatch_inner(
        &self,
        envelope: &JobEnvelope,
        span: &tracing::Span,
    ) -> JobResult<Disposition> {
        let scope = JobScope::new(&envelope.job_id, &envelope.job_type);
        let payload = match route(envelope) {
            Ok(payload) => payload,
            Err(e) => {
                let err = JobError::from(e);
                tracing::error!(error = %err, error_type = err.error_type(), "Job payload rejected");
                self.lifecycle.fail(&scope, &err).await?;
                return Err(err);
            }
        };

        let log = payload.log_context();
        for (name, value) in [
            ("drawing_id", &log.drawing_id),
            ("sheet_id", &log.sheet_id),
            ("block_id", &log.block_id),
            ("overlay_id", &log.overlay_id),
        ] {
            if let Some(value) = value {
                span.record(name, value.as_str());
            }
        }
        tracing::debug!(version = %envelope.version, "Dispatching job");

        let scope = scope.with_subject(payload.event_subject());
        let ctx = &self.ctx;
        let job_id = &envelope.job_id;
        self.lifecycle
            .execute(&scope, || run_handler(ctx, job_id, payload))
            .await
    }
}

async fn run_handler(
    ctx: &HandlerContext,
    job_id: &EntityId,
    payload: JobPayload,
) -> JobResult<HandlerOutput> {
    match payload {
        JobPayload::DrawingPreprocess(p) => preprocess::drawing(ctx, p).await,
        JobPayload::SheetPreprocess(p) => preprocess::sheet(ctx, p).await,
        JobPayload::DrawingOverlay(p) => overlay::drawing(ctx, job_id, p).await,
        JobPayload::SheetOverlay(p) => overlay::sheet(ctx, job_id, p).await,
        JobPayload::BlockOverlay(p) => overlay::block(ctx, job_id, p).await,
        JobPayload::ChangeDetect(p) => detect::change(ctx, job_id, p).await,
        JobPayload::ClashDetect(p) => detect::clash(ctx, job_id, p).await,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn envelope(value: serde_json::Value) -> JobEnvelope {
        JobEnvelope::parse(value, None).unwrap()
    }

    #[test]
    fn change_detect_routes_with_overlay_id() {
        let env = envelope(json!({
            "type": "overlay.change.detect",
            "id": "job-1",
            "payload": {"overlayId": "ov-1"}
        }));
        assert_matches!(route(&env), Ok(JobPayload::ChangeDetect(p)) if p.overlay_id.as_deref() == Some("ov-1"));
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let env = envelope(json!({"type": "sheet.teleport", "id": "job-1", "payload": {}}));
        assert_matches!(route(&env), Err(CoreError::UnsupportedJobType(t)) if t == "sheet.teleport");
    }

    #[test]
    fn unknown_payload_field_is_rejected() {
        let env = envelope(json!({
            "type": "sheet.preprocess",
            "id": "job-1",
            "payload": {"sheetId": "s-1", "dpi": 300}
        }));
        assert_matches!(route(&env), Err(CoreError::Validation(_)));
    }

    #[test]
    fn every_registered_type_routes() {
        let payloads = [
            (JobType::DrawingPreprocess, json!({"drawing_id": "d"})),
            (JobType::SheetPreprocess, json!({"sheet_id": "s"})),
            (JobType::DrawingOverlay, json!({"drawing_a_id": "d"})),
            (JobType::SheetOverlay, json!({"sheet_a_id": "s"})),
            (JobType::BlockOverlay, json!({"block_a_id": "b"})),
            (JobType::ChangeDetect, json!({"sheet_overlay_job_id": "j"})),
            (JobType::ClashDetect, json!({"overlay_id": "o"})),
        ];
        for (job_type, payload) in payloads {
            let env = envelope(json!({"type": job_type.as_str(), "id": "job", "payload": payload}));
            assert_eq!(route(&env).unwrap().job_type(), job_type);
        }
    }
}
