use std::collections::BTreeSet;
use std::sync::Arc;

use raid_roster_core::{
    closing_summary, compute_assignment, date_format, ActivityKind, Actor, ActorId,
    AssignmentMode, AssignmentOutcome, CloseTrigger, EvictionReason, JoinOutcome, Participant,
    Preference, Recruitment, RecruitmentId, RecruitmentState, RenderHandle, RosterError, Slot,
    TimeSlot,
};
use raid_roster_store_json::{RecruitmentStore, SnapshotReport};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

mod config;
mod locks;
mod persistence;
mod presenter;
mod session;
mod tasks;

pub use config::RosterConfig;
pub use locks::IdLocks;
pub use persistence::PersistenceManager;
pub use presenter::{Presenter, RenderError};
pub use session::{JoinSession, SessionTracker};
pub use tasks::{run_periodic, spawn_background_tasks};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRecruitmentRequest {
    pub activity_kind: ActivityKind,
    #[serde(with = "date_format")]
    pub scheduled_date: Date,
    pub proposed_time: TimeSlot,
    pub organizer_id: ActorId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinRequest {
    pub actor_id: ActorId,
    pub display_name: String,
    pub preference: Preference,
    pub slot_choices: BTreeSet<Slot>,
    pub earliest_available: TimeSlot,
    #[serde(default)]
    pub remarks: Option<String>,
    #[serde(default)]
    pub synthetic: bool,
}

impl JoinRequest {
    fn into_participant(self) -> Participant {
        Participant {
            actor_id: self.actor_id,
            display_name: self.display_name.trim().to_string(),
            preference: self.preference,
            slot_choices: self.slot_choices,
            earliest_available: self.earliest_available,
            remarks: self.remarks,
            assigned_slot: None,
            synthetic: self.synthetic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinReceipt {
    pub recruitment_id: RecruitmentId,
    pub outcome: JoinOutcome,
    pub participant_count: usize,
    /// True only for the join that brought the count exactly to the threshold.
    pub threshold_reached: bool,
    pub preview: Option<AssignmentOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaveReceipt {
    pub recruitment_id: RecruitmentId,
    pub participant_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloseReceipt {
    pub recruitment_id: RecruitmentId,
    pub trigger: CloseTrigger,
    pub state: RecruitmentState,
    pub final_activity_kind: Option<ActivityKind>,
    pub final_time: Option<TimeSlot>,
    pub outcome: AssignmentOutcome,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoCloseReport {
    pub closed: Vec<RecruitmentId>,
    pub failed: Vec<RecruitmentId>,
    /// Closed by someone else between the scan and the transition.
    pub skipped: Vec<RecruitmentId>,
}

impl AutoCloseReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.failed.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<(RecruitmentId, EvictionReason)>,
}

/// The lifecycle controller. Every mutation of the recruitment store goes through here.
pub struct RosterApi {
    config: RosterConfig,
    store: Arc<RwLock<RecruitmentStore>>,
    presenter: Arc<dyn Presenter>,
    persistence: Arc<PersistenceManager>,
    sessions: Mutex<SessionTracker>,
    locks: IdLocks,
}

impl std::fmt::Debug for RosterApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RosterApi")
            .field("config", &self.config)
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

impl RosterApi {
    /// # Errors
    /// Returns [`RosterError::Validation`] when `config` is invalid.
    pub fn new(
        config: RosterConfig,
        store: RecruitmentStore,
        presenter: Arc<dyn Presenter>,
        persistence: Arc<PersistenceManager>,
    ) -> Result<Self, RosterError> {
        config.validate()?;
        let sessions = Mutex::new(SessionTracker::new(config.session_ttl));
        Ok(Self {
            config,
            store: Arc::new(RwLock::new(store)),
            presenter,
            persistence,
            sessions,
            locks: IdLocks::new(),
        })
    }

    /// Build a controller over whatever the snapshot file holds.
    ///
    /// # Errors
    /// Returns [`RosterError::Validation`] when `config` is invalid.
    pub fn load(
        config: RosterConfig,
        presenter: Arc<dyn Presenter>,
        persistence: Arc<PersistenceManager>,
    ) -> Result<Self, RosterError> {
        let (store, _) = persistence.load();
        Self::new(config, store, presenter, persistence)
    }

    #[must_use]
    pub fn config(&self) -> &RosterConfig {
        &self.config
    }

    async fn fetch(&self, id: RecruitmentId) -> Result<Recruitment, RosterError> {
        self.store.read().await.get(&id).cloned().ok_or(RosterError::RecruitmentNotFound(id))
    }

    async fn commit(&self, record: Recruitment) {
        self.store.write().await.put(record);
    }

    async fn persist(&self) {
        self.persistence.save_logged(&self.store).await;
    }

    /// # Errors
    /// Returns [`RosterError::RecruitmentNotFound`] for an unknown id.
    pub async fn get(&self, id: RecruitmentId) -> Result<Recruitment, RosterError> {
        self.fetch(id).await
    }

    /// All recruitments, optionally in one state, oldest first.
    pub async fn list(&self, state: Option<RecruitmentState>) -> Vec<Recruitment> {
        let mut records = self
            .store
            .read()
            .await
            .all_entries()
            .map(|(_, record)| record)
            .filter(|record| state.map_or(true, |state| record.state == state))
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
        });
        records
    }

    /// Create a recruitment in `Pending`.
    ///
    /// # Errors
    /// Returns [`RosterError::Validation`] for an empty organizer id.
    pub async fn create_pending(
        &self,
        request: CreateRecruitmentRequest,
    ) -> Result<Recruitment, RosterError> {
        if request.organizer_id.as_str().trim().is_empty() {
            return Err(RosterError::Validation("organizer_id MUST be non-empty".to_string()));
        }

        let record = Recruitment::new_pending(
            request.activity_kind,
            request.scheduled_date,
            request.proposed_time,
            request.organizer_id,
            OffsetDateTime::now_utc(),
        );
        self.commit(record.clone()).await;
        info!(
            recruitment_id = %record.id,
            operation = "create",
            state = %record.state,
            activity_kind = %record.activity_kind,
            "recruitment created"
        );
        self.persist().await;
        Ok(record)
    }

    /// `Pending -> Open`: publish the recruitment and attach its render handle.
    ///
    /// # Errors
    /// Returns [`RosterError::RecruitmentNotFound`], [`RosterError::InvalidState`] when not
    /// pending, or [`RosterError::PresentationFailure`] when publishing fails. The record is
    /// unchanged on error.
    pub async fn open(&self, id: RecruitmentId) -> Result<RenderHandle, RosterError> {
        let _guard = self.locks.acquire(id).await;
        let mut record = self.fetch(id).await?;
        record.ensure_pending("open")?;

        let handle = self.presenter.publish(&record).await.map_err(|err| {
            RosterError::PresentationFailure { id, reason: err.to_string() }
        })?;
        record.open(handle.clone())?;
        self.commit(record).await;
        info!(recruitment_id = %id, operation = "open", state = "open", "recruitment opened");
        self.persist().await;
        Ok(handle)
    }

    /// Add or replace a participant on an open recruitment.
    ///
    /// # Errors
    /// Returns [`RosterError::RecruitmentNotFound`], [`RosterError::RecruitmentNotOpen`],
    /// [`RosterError::Validation`], [`RosterError::RecruitmentFull`], or
    /// [`RosterError::RecruitmentOrphaned`] when the rendered message has disappeared.
    pub async fn join(
        &self,
        id: RecruitmentId,
        request: JoinRequest,
    ) -> Result<JoinReceipt, RosterError> {
        let _guard = self.locks.acquire(id).await;
        let mut record = self.fetch(id).await?;
        if record.state != RecruitmentState::Open {
            return Err(RosterError::RecruitmentNotOpen(id));
        }

        let mut participant = request.into_participant();
        participant.normalize_remarks(self.config.max_remarks_len)?;
        let actor_id = participant.actor_id.clone();
        let outcome = record.upsert_participant(participant, self.config.capacity)?;

        let participant_count = record.participants.len();
        let threshold = self.config.preview_threshold;
        let threshold_reached = outcome == JoinOutcome::Inserted && participant_count == threshold;
        let preview = self.preview_for(&record);

        self.commit(record.clone()).await;
        info!(
            recruitment_id = %id,
            operation = "join",
            state = %record.state,
            actor_id = %actor_id,
            outcome = ?outcome,
            participant_count,
            "participant joined"
        );

        self.refresh_render(&record, preview.as_ref()).await?;
        if threshold_reached {
            let text = format!(
                "[{}] recruitment {id} has {participant_count} participants; preview assignment is ready",
                record.activity_kind
            );
            self.notify(&record, &text).await;
        }
        self.persist().await;

        Ok(JoinReceipt { recruitment_id: id, outcome, participant_count, threshold_reached, preview })
    }

    /// Withdraw a participant from an open recruitment.
    ///
    /// # Errors
    /// Returns [`RosterError::RecruitmentNotFound`], [`RosterError::NotAParticipant`],
    /// [`RosterError::RecruitmentClosed`] after close, or [`RosterError::RecruitmentOrphaned`].
    pub async fn leave(
        &self,
        id: RecruitmentId,
        actor_id: &ActorId,
    ) -> Result<LeaveReceipt, RosterError> {
        let _guard = self.locks.acquire(id).await;
        let mut record = self.fetch(id).await?;
        record.remove_participant(actor_id)?;

        let participant_count = record.participants.len();
        let preview = self.preview_for(&record);
        self.commit(record.clone()).await;
        info!(
            recruitment_id = %id,
            operation = "leave",
            state = %record.state,
            actor_id = %actor_id,
            participant_count,
            "participant left"
        );

        self.refresh_render(&record, preview.as_ref()).await?;
        self.persist().await;
        Ok(LeaveReceipt { recruitment_id: id, participant_count })
    }

    /// Organizer- or elevated-actor close with a final assignment run.
    ///
    /// # Errors
    /// Returns [`RosterError::Forbidden`], [`RosterError::AlreadyClosed`],
    /// [`RosterError::InvalidState`] for pending recruitments, or
    /// [`RosterError::AssignmentFailure`] after committing `Closed` without final fields.
    pub async fn close(&self, id: RecruitmentId, actor: &Actor) -> Result<CloseReceipt, RosterError> {
        let _guard = self.locks.acquire(id).await;
        let record = self.fetch(id).await?;
        record.authorize(actor, "close")?;
        record.ensure_closable()?;
        self.finish(record, CloseTrigger::Actor).await
    }

    /// Deadline-driven close. Re-checks state and deadline under the id lock.
    ///
    /// # Errors
    /// Returns [`RosterError::AlreadyClosed`] when someone closed it first,
    /// [`RosterError::Validation`] before the deadline, or [`RosterError::AssignmentFailure`]
    /// after committing `Errored`.
    pub async fn auto_close(
        &self,
        id: RecruitmentId,
        now: OffsetDateTime,
    ) -> Result<CloseReceipt, RosterError> {
        let _guard = self.locks.acquire(id).await;
        let record = self.fetch(id).await?;
        record.ensure_closable()?;
        if !self.config.closing.is_due(&record, now)? {
            return Err(RosterError::Validation(format!(
                "recruitment {id} has not reached its closing deadline"
            )));
        }
        self.finish(record, CloseTrigger::Deadline).await
    }

    async fn finish(
        &self,
        mut record: Recruitment,
        trigger: CloseTrigger,
    ) -> Result<CloseReceipt, RosterError> {
        let id = record.id;
        let result = compute_assignment(&record, AssignmentMode::Final);

        let outcome = match result {
            Ok(outcome) => {
                record.record_assignment(&outcome);
                debug!(
                    recruitment_id = %id,
                    mode = "final",
                    eligible = outcome.ranking.len(),
                    assigned = outcome.assignments.len(),
                    vacant = outcome.vacant_slots.len(),
                    final_activity_kind = %outcome.final_activity_kind,
                    final_time = %outcome.final_time,
                    "assignment computed"
                );
                Ok(outcome)
            }
            Err(err) => {
                record.record_assignment_failure(trigger);
                let label = match trigger {
                    CloseTrigger::Actor => "closed_unassigned",
                    CloseTrigger::Deadline => "errored",
                };
                warn!(
                    recruitment_id = %id,
                    outcome = label,
                    error = %err,
                    "assignment failed; manual follow-up required"
                );
                Err(err)
            }
        };

        let operation = match trigger {
            CloseTrigger::Actor => "close",
            CloseTrigger::Deadline => "auto_close",
        };
        self.commit(record.clone()).await;
        info!(
            recruitment_id = %id,
            operation,
            state = %record.state,
            "recruitment closed"
        );

        let rendered = self.refresh_render(&record, None).await;
        if rendered.is_ok() {
            self.notify(&record, &closing_summary(&record, trigger)).await;
        }
        self.persist().await;
        rendered?;

        let outcome = outcome?;
        Ok(CloseReceipt {
            recruitment_id: id,
            trigger,
            state: record.state,
            final_activity_kind: record.final_activity_kind,
            final_time: record.final_time,
            outcome,
        })
    }

    /// Remove a recruitment. Unknown ids succeed as [`DeleteOutcome::AlreadyAbsent`].
    ///
    /// # Errors
    /// Returns [`RosterError::Forbidden`] unless `actor` is the organizer or elevated.
    pub async fn delete(
        &self,
        id: RecruitmentId,
        actor: &Actor,
    ) -> Result<DeleteOutcome, RosterError> {
        let guard = self.locks.acquire(id).await;
        let Some(record) = self.store.read().await.get(&id).cloned() else {
            return Ok(DeleteOutcome::AlreadyAbsent);
        };
        record.authorize(actor, "delete")?;

        if let Some(handle) = &record.render_handle {
            if let Err(err) = self.presenter.retire(handle).await {
                warn!(recruitment_id = %id, error = %err, "failed to retire rendered recruitment");
            }
        }
        self.store.write().await.delete(&id);
        info!(recruitment_id = %id, operation = "delete", actor_id = %actor.id, "recruitment deleted");
        self.persist().await;

        drop(guard);
        self.locks.prune().await;
        Ok(DeleteOutcome::Deleted)
    }

    /// Non-authoritative assignment for display; never written back.
    ///
    /// # Errors
    /// Returns [`RosterError::RecruitmentNotFound`] or [`RosterError::AssignmentFailure`].
    pub async fn preview(&self, id: RecruitmentId) -> Result<AssignmentOutcome, RosterError> {
        let record = self.fetch(id).await?;
        compute_assignment(&record, AssignmentMode::Preview)
    }

    fn preview_for(&self, record: &Recruitment) -> Option<AssignmentOutcome> {
        if record.participants.len() < self.config.preview_threshold {
            return None;
        }
        match compute_assignment(record, AssignmentMode::Preview) {
            Ok(outcome) => {
                debug!(
                    recruitment_id = %record.id,
                    mode = "preview",
                    eligible = outcome.ranking.len(),
                    assigned = outcome.assignments.len(),
                    vacant = outcome.vacant_slots.len(),
                    final_activity_kind = %outcome.final_activity_kind,
                    final_time = %outcome.final_time,
                    "assignment computed"
                );
                Some(outcome)
            }
            Err(err) => {
                warn!(recruitment_id = %record.id, error = %err, "preview assignment failed");
                None
            }
        }
    }

    async fn refresh_render(
        &self,
        record: &Recruitment,
        preview: Option<&AssignmentOutcome>,
    ) -> Result<(), RosterError> {
        let Some(handle) = &record.render_handle else {
            return Ok(());
        };
        match self.presenter.refresh(record, handle, preview).await {
            Ok(()) => Ok(()),
            Err(RenderError::HandleMissing) => {
                self.store.write().await.delete(&record.id);
                warn!(
                    recruitment_id = %record.id,
                    operation = "self_heal",
                    "rendered message is gone; recruitment removed"
                );
                self.persist().await;
                Err(RosterError::RecruitmentOrphaned(record.id))
            }
            Err(err) => {
                warn!(recruitment_id = %record.id, error = %err, "failed to refresh render");
                Ok(())
            }
        }
    }

    async fn notify(&self, record: &Recruitment, text: &str) {
        if let Err(err) = self.presenter.notify(record, text).await {
            warn!(recruitment_id = %record.id, error = %err, "notification failed");
        }
    }

    /// Close every open recruitment whose deadline has passed.
    pub async fn scan_auto_close(&self, now: OffsetDateTime) -> AutoCloseReport {
        let candidates = self
            .list(Some(RecruitmentState::Open))
            .await
            .into_iter()
            .filter(|record| self.config.closing.is_due(record, now).unwrap_or(false))
            .map(|record| record.id)
            .collect::<Vec<_>>();

        let mut report = AutoCloseReport::default();
        for id in candidates {
            match self.auto_close(id, now).await {
                Ok(_) => report.closed.push(id),
                Err(RosterError::AssignmentFailure { .. }) => report.failed.push(id),
                Err(err) if err.is_invalid_state() || matches!(err, RosterError::RecruitmentNotFound(_)) => {
                    debug!(recruitment_id = %id, error = %err, "auto-close skipped; already handled");
                    report.skipped.push(id);
                }
                Err(err) => {
                    warn!(recruitment_id = %id, error = %err, "auto-close failed");
                    report.failed.push(id);
                }
            }
        }
        report
    }

    /// Remove recruitments past their retention ceiling, then snapshot if anything went.
    pub async fn sweep_retention(&self, now: OffsetDateTime) -> SweepReport {
        let candidates = self
            .store
            .read()
            .await
            .all_entries()
            .filter(|(_, record)| self.config.retention.eviction_reason(record, now).is_some())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        let mut report = SweepReport::default();
        for id in candidates {
            let _guard = self.locks.acquire(id).await;
            let mut store = self.store.write().await;
            let Some(reason) =
                store.get(&id).and_then(|record| self.config.retention.eviction_reason(record, now))
            else {
                continue;
            };
            store.delete(&id);
            info!(recruitment_id = %id, operation = "retention", reason = ?reason, "recruitment evicted");
            report.removed.push((id, reason));
        }

        if !report.removed.is_empty() {
            self.persist().await;
        }
        self.locks.prune().await;
        report
    }

    pub async fn autosave(&self) -> Option<SnapshotReport> {
        self.persistence.save_logged(&self.store).await
    }

    /// Synchronous snapshot for the crash path.
    ///
    /// # Errors
    /// Returns an error when the store is write-locked or the write fails.
    pub fn emergency_snapshot(&self) -> anyhow::Result<SnapshotReport> {
        self.persistence.emergency_save(&self.store)
    }

    /// Start a join wizard for `actor_id` on an open recruitment.
    ///
    /// # Errors
    /// Returns [`RosterError::RecruitmentNotFound`] or [`RosterError::RecruitmentNotOpen`].
    pub async fn begin_session(
        &self,
        actor_id: ActorId,
        id: RecruitmentId,
    ) -> Result<JoinSession, RosterError> {
        let record = self.fetch(id).await?;
        if record.state != RecruitmentState::Open {
            return Err(RosterError::RecruitmentNotOpen(id));
        }
        Ok(self.sessions.lock().await.begin(actor_id, id, OffsetDateTime::now_utc()))
    }

    /// # Errors
    /// Returns [`RosterError::Validation`] without a live session.
    pub async fn session_preference(
        &self,
        actor_id: &ActorId,
        preference: Preference,
    ) -> Result<JoinSession, RosterError> {
        self.sessions.lock().await.choose_preference(actor_id, preference, OffsetDateTime::now_utc())
    }

    /// # Errors
    /// Returns [`RosterError::Validation`] for an empty selection or without a live session.
    pub async fn session_slots(
        &self,
        actor_id: &ActorId,
        slots: BTreeSet<Slot>,
    ) -> Result<JoinSession, RosterError> {
        self.sessions.lock().await.choose_slots(actor_id, slots, OffsetDateTime::now_utc())
    }

    /// # Errors
    /// Returns [`RosterError::Validation`] without a live session.
    pub async fn session_availability(
        &self,
        actor_id: &ActorId,
        earliest_available: TimeSlot,
    ) -> Result<JoinSession, RosterError> {
        self.sessions.lock().await.choose_availability(
            actor_id,
            earliest_available,
            OffsetDateTime::now_utc(),
        )
    }

    /// # Errors
    /// Returns [`RosterError::Validation`] for over-long remarks or without a live session.
    pub async fn session_remarks(
        &self,
        actor_id: &ActorId,
        remarks: Option<String>,
    ) -> Result<JoinSession, RosterError> {
        let mut scratch = Participant {
            actor_id: actor_id.clone(),
            display_name: String::new(),
            preference: Preference::Either,
            slot_choices: BTreeSet::new(),
            earliest_available: TimeSlot::NOW,
            remarks,
            assigned_slot: None,
            synthetic: false,
        };
        scratch.normalize_remarks(self.config.max_remarks_len)?;
        self.sessions.lock().await.set_remarks(actor_id, scratch.remarks, OffsetDateTime::now_utc())
    }

    /// The actor's live session, if any.
    pub async fn session(&self, actor_id: &ActorId) -> Option<JoinSession> {
        self.sessions.lock().await.get(actor_id, OffsetDateTime::now_utc()).cloned()
    }

    pub async fn cancel_session(&self, actor_id: &ActorId) -> bool {
        self.sessions.lock().await.cancel(actor_id)
    }

    /// Consume the actor's session and join with what it collected.
    ///
    /// # Errors
    /// Returns [`RosterError::Validation`] for a missing or incomplete session, or any
    /// [`Self::join`] error.
    pub async fn confirm_session(
        &self,
        actor_id: ActorId,
        display_name: String,
    ) -> Result<JoinReceipt, RosterError> {
        let session =
            self.sessions.lock().await.take(&actor_id, OffsetDateTime::now_utc()).ok_or_else(|| {
                RosterError::Validation(format!("no active join session for {actor_id}"))
            })?;
        let id = session.recruitment_id;
        let request = session.into_request(actor_id, display_name)?;
        self.join(id, request).await
    }

    pub async fn evict_sessions(&self, now: OffsetDateTime) -> usize {
        self.sessions.lock().await.evict_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Mutex as StdMutex, PoisonError};

    use async_trait::async_trait;
    use raid_roster_store_json::SnapshotFile;
    use time::macros::{date, datetime};
    use time::Duration;

    use super::*;

    #[derive(Debug, Default)]
    struct RecordingPresenter {
        events: StdMutex<Vec<String>>,
        fail_publish: bool,
        missing_handles: bool,
    }

    impl RecordingPresenter {
        fn record(&self, event: String) {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    #[async_trait]
    impl Presenter for RecordingPresenter {
        async fn publish(&self, recruitment: &Recruitment) -> Result<RenderHandle, RenderError> {
            if self.fail_publish {
                return Err(RenderError::Failed("channel unavailable".to_string()));
            }
            self.record(format!("publish:{}", recruitment.id));
            Ok(RenderHandle {
                channel_ref: "channel".to_string(),
                message_ref: format!("message-{}", recruitment.id),
            })
        }

        async fn refresh(
            &self,
            recruitment: &Recruitment,
            _handle: &RenderHandle,
            preview: Option<&AssignmentOutcome>,
        ) -> Result<(), RenderError> {
            if self.missing_handles {
                return Err(RenderError::HandleMissing);
            }
            self.record(format!("refresh:{}:preview={}", recruitment.state, preview.is_some()));
            Ok(())
        }

        async fn notify(&self, _recruitment: &Recruitment, text: &str) -> Result<(), RenderError> {
            self.record(format!("notify:{text}"));
            Ok(())
        }

        async fn retire(&self, handle: &RenderHandle) -> Result<(), RenderError> {
            self.record(format!("retire:{}", handle.message_ref));
            Ok(())
        }
    }

    struct Harness {
        api: Arc<RosterApi>,
        presenter: Arc<RecordingPresenter>,
        dir: PathBuf,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn harness_with(presenter: RecordingPresenter, config: RosterConfig) -> Harness {
        let dir = std::env::temp_dir().join(format!("raid-roster-api-{}", ulid::Ulid::new()));
        let presenter = Arc::new(presenter);
        let persistence = Arc::new(PersistenceManager::new(SnapshotFile::in_dir(&dir)));
        let api = match RosterApi::new(
            config,
            RecruitmentStore::new(),
            Arc::clone(&presenter) as Arc<dyn Presenter>,
            persistence,
        ) {
            Ok(api) => Arc::new(api),
            Err(err) => panic!("fixture config should be valid: {err}"),
        };
        Harness { api, presenter, dir }
    }

    fn harness() -> Harness {
        harness_with(RecordingPresenter::default(), RosterConfig::default())
    }

    fn create_request(kind: ActivityKind) -> CreateRecruitmentRequest {
        CreateRecruitmentRequest {
            activity_kind: kind,
            scheduled_date: date!(2026 - 10 - 20),
            proposed_time: TimeSlot::at_hour(21).unwrap_or(TimeSlot::NOW),
            organizer_id: ActorId::new("organizer"),
        }
    }

    fn join_request(actor: &str, preference: Preference, slots: &[Slot]) -> JoinRequest {
        JoinRequest {
            actor_id: ActorId::new(actor),
            display_name: format!("{actor} name"),
            preference,
            slot_choices: slots.iter().copied().collect(),
            earliest_available: TimeSlot::NOW,
            remarks: None,
            synthetic: true,
        }
    }

    async fn open_recruitment(api: &RosterApi, kind: ActivityKind) -> RecruitmentId {
        let record = match api.create_pending(create_request(kind)).await {
            Ok(record) => record,
            Err(err) => panic!("create should succeed: {err}"),
        };
        if let Err(err) = api.open(record.id).await {
            panic!("open should succeed: {err}");
        }
        record.id
    }

    async fn join_ok(api: &RosterApi, id: RecruitmentId, request: JoinRequest) -> JoinReceipt {
        match api.join(id, request).await {
            Ok(receipt) => receipt,
            Err(err) => panic!("join should succeed: {err}"),
        }
    }

    // Test IDs: TAPI-001
    #[tokio::test]
    async fn create_open_join_close_assigns_slots() {
        let harness = harness();
        let api = &harness.api;
        let id = open_recruitment(api, ActivityKind::Tengen).await;

        join_ok(api, id, join_request("alice", Preference::Tengen, &[Slot::Fire])).await;
        join_ok(api, id, join_request("bob", Preference::Either, &[Slot::Fire, Slot::Water])).await;

        let receipt = match api.close(id, &Actor::member("organizer")).await {
            Ok(receipt) => receipt,
            Err(err) => panic!("close should succeed: {err}"),
        };
        assert_eq!(receipt.state, RecruitmentState::Assigned);
        assert_eq!(receipt.final_activity_kind, Some(ActivityKind::Tengen));

        let record = match api.get(id).await {
            Ok(record) => record,
            Err(err) => panic!("record should exist: {err}"),
        };
        assert_eq!(
            record.participant(&ActorId::new("alice")).and_then(|p| p.assigned_slot),
            Some(Slot::Fire)
        );
        assert_eq!(
            record.participant(&ActorId::new("bob")).and_then(|p| p.assigned_slot),
            Some(Slot::Water)
        );
        assert!(harness.presenter.events().iter().any(|event| event.contains("water: bob name")));
    }

    // Test IDs: TAPI-002
    #[tokio::test]
    async fn join_before_open_is_rejected() {
        let harness = harness();
        let record = match harness.api.create_pending(create_request(ActivityKind::Tengen)).await {
            Ok(record) => record,
            Err(err) => panic!("create should succeed: {err}"),
        };

        let result = harness
            .api
            .join(record.id, join_request("alice", Preference::Tengen, &[Slot::Fire]))
            .await;
        assert!(matches!(result, Err(RosterError::RecruitmentNotOpen(_))));

        let close = harness.api.close(record.id, &Actor::member("organizer")).await;
        assert!(matches!(close, Err(RosterError::InvalidState { operation: "close", .. })));
    }

    // Test IDs: TAPI-003
    #[tokio::test]
    async fn close_twice_reports_already_closed_and_leaves_store_unchanged() {
        let harness = harness();
        let api = &harness.api;
        let id = open_recruitment(api, ActivityKind::Tengen).await;
        join_ok(api, id, join_request("alice", Preference::Tengen, &[Slot::Fire])).await;

        if let Err(err) = api.close(id, &Actor::member("organizer")).await {
            panic!("first close should succeed: {err}");
        }
        let before = api.get(id).await;

        let second = api.close(id, &Actor::member("organizer")).await;
        assert!(matches!(second, Err(RosterError::AlreadyClosed(_))));
        assert_eq!(api.get(id).await, before);
    }

    // Test IDs: TAPI-004
    #[tokio::test]
    async fn close_requires_organizer_or_elevated_actor() {
        let harness = harness();
        let api = &harness.api;
        let id = open_recruitment(api, ActivityKind::Tengen).await;

        let forbidden = api.close(id, &Actor::member("bystander")).await;
        assert!(matches!(forbidden, Err(RosterError::Forbidden { .. })));

        let elevated = api.close(id, &Actor::elevated("moderator")).await;
        assert!(elevated.is_ok());
    }

    // Test IDs: TAPI-005
    #[tokio::test]
    async fn unknown_ids_report_not_found_and_delete_is_idempotent() {
        let harness = harness();
        let api = &harness.api;
        let unknown = RecruitmentId::new();

        assert!(matches!(api.open(unknown).await, Err(RosterError::RecruitmentNotFound(_))));
        assert!(matches!(
            api.leave(unknown, &ActorId::new("a")).await,
            Err(RosterError::RecruitmentNotFound(_))
        ));
        assert!(matches!(
            api.delete(unknown, &Actor::member("anyone")).await,
            Ok(DeleteOutcome::AlreadyAbsent)
        ));
    }

    // Test IDs: TAPI-006
    #[tokio::test]
    async fn threshold_join_previews_without_writing_back() {
        let config = RosterConfig { capacity: 3, preview_threshold: 2, ..RosterConfig::default() };
        let harness = harness_with(RecordingPresenter::default(), config);
        let api = &harness.api;
        let id = open_recruitment(api, ActivityKind::Tengen).await;

        let first = join_ok(api, id, join_request("a", Preference::Tengen, &[Slot::Fire])).await;
        assert!(first.preview.is_none());

        let second = join_ok(api, id, join_request("b", Preference::Tengen, &[Slot::Water])).await;
        assert!(second.threshold_reached);
        assert!(second.preview.is_some());

        let rejoin = join_ok(api, id, join_request("b", Preference::Tengen, &[Slot::Earth])).await;
        assert_eq!(rejoin.outcome, JoinOutcome::Replaced);
        assert!(!rejoin.threshold_reached);
        assert!(rejoin.preview.is_some());

        let record = match api.get(id).await {
            Ok(record) => record,
            Err(err) => panic!("record should exist: {err}"),
        };
        assert!(record.participants.iter().all(|p| p.assigned_slot.is_none()));
        assert!(record.final_time.is_none());

        let notices =
            harness.presenter.events().iter().filter(|event| event.starts_with("notify:")).count();
        assert_eq!(notices, 1);
    }

    // Test IDs: TAPI-007
    #[tokio::test]
    async fn leave_after_close_is_rejected() {
        let harness = harness();
        let api = &harness.api;
        let id = open_recruitment(api, ActivityKind::Tengen).await;
        join_ok(api, id, join_request("alice", Preference::Tengen, &[Slot::Fire])).await;

        let missing = api.leave(id, &ActorId::new("ghost")).await;
        assert!(matches!(missing, Err(RosterError::NotAParticipant { .. })));

        if let Err(err) = api.close(id, &Actor::member("organizer")).await {
            panic!("close should succeed: {err}");
        }
        let after = api.leave(id, &ActorId::new("alice")).await;
        assert!(matches!(after, Err(RosterError::RecruitmentClosed(_))));
    }

    // Test IDs: TAPI-008
    #[tokio::test]
    async fn failed_publish_leaves_recruitment_pending() {
        let harness = harness_with(
            RecordingPresenter { fail_publish: true, ..RecordingPresenter::default() },
            RosterConfig::default(),
        );
        let record = match harness.api.create_pending(create_request(ActivityKind::Vote)).await {
            Ok(record) => record,
            Err(err) => panic!("create should succeed: {err}"),
        };

        let result = harness.api.open(record.id).await;
        assert!(matches!(result, Err(RosterError::PresentationFailure { .. })));
        let stored = harness.api.get(record.id).await;
        assert_eq!(stored.map(|record| record.state), Ok(RecruitmentState::Pending));
    }

    // Test IDs: TAPI-009
    #[tokio::test]
    async fn missing_render_handle_removes_orphaned_record() {
        let harness = harness_with(
            RecordingPresenter { missing_handles: true, ..RecordingPresenter::default() },
            RosterConfig::default(),
        );
        let api = &harness.api;
        let id = open_recruitment(api, ActivityKind::Tengen).await;

        let result = api.join(id, join_request("alice", Preference::Tengen, &[Slot::Fire])).await;
        assert!(matches!(result, Err(RosterError::RecruitmentOrphaned(_))));
        assert!(matches!(api.get(id).await, Err(RosterError::RecruitmentNotFound(_))));
    }

    // Test IDs: TAPI-010
    #[tokio::test]
    async fn auto_close_waits_for_deadline_and_tolerates_races() {
        let harness = harness();
        let api = &harness.api;
        let due = open_recruitment(api, ActivityKind::Tengen).await;
        let raced = open_recruitment(api, ActivityKind::Tengen).await;

        let early = datetime!(2026-10-19 22:00 UTC);
        assert!(api.scan_auto_close(early).await.is_empty());
        assert!(matches!(api.auto_close(due, early).await, Err(RosterError::Validation(_))));

        if let Err(err) = api.close(raced, &Actor::member("organizer")).await {
            panic!("manual close should succeed: {err}");
        }
        let late = datetime!(2026-10-20 00:00 UTC);
        let report = api.scan_auto_close(late).await;
        assert_eq!(report.closed, vec![due]);
        assert!(report.failed.is_empty());

        let second = api.auto_close(raced, late).await;
        assert!(second.as_ref().is_err_and(RosterError::is_invalid_state));
        assert_eq!(api.get(due).await.map(|record| record.state), Ok(RecruitmentState::Closed));
    }

    // Test IDs: TAPI-011
    #[tokio::test]
    async fn engine_failure_is_marked_distinctly_per_trigger() {
        let harness = harness();
        let api = &harness.api;
        let by_actor = open_recruitment(api, ActivityKind::Tengen).await;
        let by_deadline = open_recruitment(api, ActivityKind::Tengen).await;

        for id in [by_actor, by_deadline] {
            let mut store = api.store.write().await;
            let Some(mut record) = store.get(&id).cloned() else {
                panic!("record should exist");
            };
            record.participants.push(Participant {
                actor_id: ActorId::new("broken"),
                display_name: "broken".to_string(),
                preference: Preference::Tengen,
                slot_choices: BTreeSet::new(),
                earliest_available: TimeSlot::NOW,
                remarks: None,
                assigned_slot: None,
                synthetic: true,
            });
            store.put(record);
        }

        let manual = api.close(by_actor, &Actor::member("organizer")).await;
        assert!(matches!(manual, Err(RosterError::AssignmentFailure { .. })));
        assert_eq!(api.get(by_actor).await.map(|r| r.state), Ok(RecruitmentState::Closed));

        let report = api.scan_auto_close(datetime!(2026-10-20 00:00 UTC)).await;
        assert_eq!(report.failed, vec![by_deadline]);
        assert_eq!(api.get(by_deadline).await.map(|r| r.state), Ok(RecruitmentState::Errored));
    }

    // Test IDs: TAPI-012
    #[tokio::test]
    async fn retention_sweep_applies_both_ceilings() {
        let harness = harness();
        let api = &harness.api;
        let now = OffsetDateTime::now_utc();

        let closed_old = open_recruitment(api, ActivityKind::Tengen).await;
        let closed_recent = open_recruitment(api, ActivityKind::Tengen).await;
        let open_ancient = open_recruitment(api, ActivityKind::Tengen).await;
        for id in [closed_old, closed_recent] {
            if let Err(err) = api.close(id, &Actor::member("organizer")).await {
                panic!("close should succeed: {err}");
            }
        }
        {
            let mut store = api.store.write().await;
            for (id, age) in [
                (closed_old, Duration::days(4)),
                (closed_recent, Duration::days(2)),
                (open_ancient, Duration::days(8)),
            ] {
                let Some(mut record) = store.get(&id).cloned() else {
                    panic!("record should exist");
                };
                record.created_at = now - age;
                store.put(record);
            }
        }

        let report = api.sweep_retention(now).await;
        let removed = report.removed.iter().map(|(id, _)| *id).collect::<BTreeSet<_>>();
        assert_eq!(removed, [closed_old, open_ancient].into_iter().collect());
        assert!(api.get(closed_recent).await.is_ok());
    }

    // Test IDs: TAPI-013
    #[tokio::test]
    async fn delete_retires_render_and_checks_authority() {
        let harness = harness();
        let api = &harness.api;
        let id = open_recruitment(api, ActivityKind::Tengen).await;

        let forbidden = api.delete(id, &Actor::member("bystander")).await;
        assert!(matches!(forbidden, Err(RosterError::Forbidden { .. })));

        assert_eq!(api.delete(id, &Actor::member("organizer")).await, Ok(DeleteOutcome::Deleted));
        assert_eq!(api.delete(id, &Actor::member("organizer")).await, Ok(DeleteOutcome::AlreadyAbsent));
        assert!(harness.presenter.events().iter().any(|event| event.starts_with("retire:")));
    }

    // Test IDs: TAPI-014
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_respect_capacity() {
        let harness = harness();
        let id = open_recruitment(&harness.api, ActivityKind::Tengen).await;

        let mut handles = Vec::new();
        for index in 0..10 {
            let api = Arc::clone(&harness.api);
            handles.push(tokio::spawn(async move {
                api.join(id, join_request(&format!("actor-{index}"), Preference::Either, &[Slot::Fire]))
                    .await
            }));
        }

        let mut joined = 0;
        let mut full = 0;
        for handle in handles {
            match handle.await {
                Ok(Ok(_)) => joined += 1,
                Ok(Err(RosterError::RecruitmentFull { .. })) => full += 1,
                Ok(Err(err)) => panic!("unexpected join error: {err}"),
                Err(err) => panic!("join task panicked: {err}"),
            }
        }
        assert_eq!((joined, full), (6, 4));
        assert_eq!(harness.api.get(id).await.map(|record| record.participants.len()), Ok(6));
    }

    // Test IDs: TAPI-015
    #[tokio::test]
    async fn session_confirm_joins_and_consumes_session() {
        let harness = harness();
        let api = &harness.api;
        let id = open_recruitment(api, ActivityKind::Vote).await;
        let actor = ActorId::new("wizard-user");

        let steps = [
            api.begin_session(actor.clone(), id).await,
            api.session_preference(&actor, Preference::LuciZero).await,
            api.session_slots(&actor, [Slot::Light].into_iter().collect()).await,
            api.session_availability(&actor, TimeSlot::at_hour(22).unwrap_or(TimeSlot::NOW)).await,
            api.session_remarks(&actor, Some("  ".to_string())).await,
        ];
        for step in steps {
            if let Err(err) = step {
                panic!("session step should succeed: {err}");
            }
        }
        let live = api.session(&actor).await;
        assert_eq!(live.as_ref().map(|session| session.recruitment_id), Some(id));
        assert_eq!(live.and_then(|session| session.preference), Some(Preference::LuciZero));

        let receipt = match api.confirm_session(actor.clone(), "Wizard".to_string()).await {
            Ok(receipt) => receipt,
            Err(err) => panic!("confirm should join: {err}"),
        };
        assert_eq!(receipt.outcome, JoinOutcome::Inserted);

        assert!(api.session(&actor).await.is_none());
        let again = api.confirm_session(actor, "Wizard".to_string()).await;
        assert!(matches!(again, Err(RosterError::Validation(_))));
    }

    // Test IDs: TAPI-016
    #[tokio::test]
    async fn overlong_remarks_are_rejected_before_mutation() {
        let harness = harness();
        let api = &harness.api;
        let id = open_recruitment(api, ActivityKind::Tengen).await;

        let mut request = join_request("alice", Preference::Tengen, &[Slot::Fire]);
        request.remarks = Some("x".repeat(101));
        assert!(matches!(api.join(id, request).await, Err(RosterError::Validation(_))));
        assert_eq!(api.get(id).await.map(|record| record.participants.len()), Ok(0));
    }

    // Test IDs: TAPI-017
    #[tokio::test]
    async fn mutations_are_persisted_to_snapshot() {
        let harness = harness();
        let api = &harness.api;
        let id = open_recruitment(api, ActivityKind::Tengen).await;
        join_ok(api, id, join_request("alice", Preference::Tengen, &[Slot::Fire])).await;

        let (store, _) = match SnapshotFile::in_dir(&harness.dir).load() {
            Ok(loaded) => loaded,
            Err(err) => panic!("snapshot should load: {err:#}"),
        };
        assert_eq!(store.get(&id).map(|record| record.participants.len()), Some(1));
    }

    // Test IDs: TAPI-018
    #[tokio::test]
    async fn join_on_closed_recruitment_reports_state_before_remarks() {
        let harness = harness();
        let api = &harness.api;
        let id = open_recruitment(api, ActivityKind::Tengen).await;
        if let Err(err) = api.close(id, &Actor::member("organizer")).await {
            panic!("close should succeed: {err}");
        }

        let mut request = join_request("late", Preference::Tengen, &[Slot::Fire]);
        request.remarks = Some("x".repeat(500));
        assert_eq!(api.join(id, request).await, Err(RosterError::RecruitmentNotOpen(id)));
    }
}
