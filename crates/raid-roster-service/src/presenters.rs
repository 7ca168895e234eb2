use std::time::Duration;

use async_trait::async_trait;
use raid_roster_api::{Presenter, RenderError};
use raid_roster_core::{AssignmentOutcome, Recruitment, RenderHandle};
use serde_json::{json, Value};
use tracing::{debug, info};
use ulid::Ulid;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Renders nothing; every presentation call becomes a log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPresenter;

#[async_trait]
impl Presenter for LogPresenter {
    async fn publish(&self, recruitment: &Recruitment) -> Result<RenderHandle, RenderError> {
        let handle =
            RenderHandle { channel_ref: "log".to_string(), message_ref: Ulid::new().to_string() };
        info!(
            recruitment_id = %recruitment.id,
            message_ref = %handle.message_ref,
            activity_kind = %recruitment.activity_kind,
            scheduled_date = %recruitment.scheduled_date,
            proposed_time = %recruitment.proposed_time,
            "recruitment published"
        );
        Ok(handle)
    }

    async fn refresh(
        &self,
        recruitment: &Recruitment,
        handle: &RenderHandle,
        preview: Option<&AssignmentOutcome>,
    ) -> Result<(), RenderError> {
        debug!(
            recruitment_id = %recruitment.id,
            message_ref = %handle.message_ref,
            state = %recruitment.state,
            participants = recruitment.participants.len(),
            preview_assigned = preview.map(|outcome| outcome.assignments.len()),
            "recruitment re-rendered"
        );
        Ok(())
    }

    async fn notify(&self, recruitment: &Recruitment, text: &str) -> Result<(), RenderError> {
        info!(recruitment_id = %recruitment.id, text, "recruitment notice");
        Ok(())
    }

    async fn retire(&self, handle: &RenderHandle) -> Result<(), RenderError> {
        info!(message_ref = %handle.message_ref, "rendered recruitment retired");
        Ok(())
    }
}

/// Posts presentation events as JSON to a single endpoint.
///
/// A `404` or `410` answer to a `refreshed` event means the rendered message is gone.
#[derive(Debug, Clone)]
pub struct WebhookPresenter {
    url: String,
}

impl WebhookPresenter {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    async fn deliver(&self, payload: Value) -> Result<(), RenderError> {
        let url = self.url.clone();
        let result = tokio::task::spawn_blocking(move || {
            ureq::post(&url).timeout(WEBHOOK_TIMEOUT).send_json(payload).map(|_| ())
        })
        .await
        .map_err(|err| RenderError::Failed(format!("webhook task did not complete: {err}")))?;

        match result {
            Ok(()) => Ok(()),
            Err(ureq::Error::Status(404 | 410, _)) => Err(RenderError::HandleMissing),
            Err(ureq::Error::Status(code, _)) => {
                Err(RenderError::Failed(format!("webhook answered with status {code}")))
            }
            Err(err) => Err(RenderError::Failed(err.to_string())),
        }
    }

    /// Like [`Self::deliver`] for events where a missing endpoint is an ordinary failure.
    async fn deliver_plain(&self, payload: Value) -> Result<(), RenderError> {
        self.deliver(payload).await.map_err(|err| match err {
            RenderError::HandleMissing => {
                RenderError::Failed("webhook endpoint not found".to_string())
            }
            other => other,
        })
    }
}

#[async_trait]
impl Presenter for WebhookPresenter {
    async fn publish(&self, recruitment: &Recruitment) -> Result<RenderHandle, RenderError> {
        let handle =
            RenderHandle { channel_ref: "webhook".to_string(), message_ref: Ulid::new().to_string() };
        self.deliver_plain(json!({
            "event": "published",
            "message_ref": handle.message_ref,
            "recruitment": recruitment,
        }))
        .await?;
        Ok(handle)
    }

    async fn refresh(
        &self,
        recruitment: &Recruitment,
        handle: &RenderHandle,
        preview: Option<&AssignmentOutcome>,
    ) -> Result<(), RenderError> {
        self.deliver(json!({
            "event": "refreshed",
            "message_ref": handle.message_ref,
            "recruitment": recruitment,
            "preview": preview,
        }))
        .await
    }

    async fn notify(&self, recruitment: &Recruitment, text: &str) -> Result<(), RenderError> {
        self.deliver_plain(json!({
            "event": "notified",
            "recruitment_id": recruitment.id,
            "text": text,
        }))
        .await
    }

    async fn retire(&self, handle: &RenderHandle) -> Result<(), RenderError> {
        self.deliver_plain(json!({ "event": "retired", "message_ref": handle.message_ref }))
            .await
    }
}
