use async_trait::async_trait;
use raid_roster_core::{AssignmentOutcome, Recruitment, RenderHandle};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RenderError {
    /// The rendered message behind a handle no longer exists.
    #[error("render handle no longer resolves")]
    HandleMissing,
    #[error("render failed: {0}")]
    Failed(String),
}

/// The presentation collaborator. The core calls it; it never calls back into the core.
#[async_trait]
pub trait Presenter: Send + Sync {
    /// Render a recruitment for the first time and return the handle for later updates.
    async fn publish(&self, recruitment: &Recruitment) -> Result<RenderHandle, RenderError>;

    /// Re-render an existing message. `preview` is non-authoritative.
    async fn refresh(
        &self,
        recruitment: &Recruitment,
        handle: &RenderHandle,
        preview: Option<&AssignmentOutcome>,
    ) -> Result<(), RenderError>;

    /// Best-effort broadcast.
    async fn notify(&self, recruitment: &Recruitment, text: &str) -> Result<(), RenderError>;

    /// Remove a rendered message.
    async fn retire(&self, handle: &RenderHandle) -> Result<(), RenderError>;
}
