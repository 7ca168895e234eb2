use std::collections::{BTreeSet, HashMap};

use raid_roster_core::{ActorId, Preference, RecruitmentId, RosterError, Slot, TimeSlot};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::JoinRequest;

/// Selections an actor has made so far in the multi-step join flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinSession {
    pub recruitment_id: RecruitmentId,
    pub preference: Option<Preference>,
    pub slot_choices: Option<BTreeSet<Slot>>,
    pub earliest_available: Option<TimeSlot>,
    pub remarks: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub touched_at: OffsetDateTime,
}

impl JoinSession {
    fn new(recruitment_id: RecruitmentId, now: OffsetDateTime) -> Self {
        Self {
            recruitment_id,
            preference: None,
            slot_choices: None,
            earliest_available: None,
            remarks: None,
            touched_at: now,
        }
    }

    /// Turn a finished session into a join request.
    ///
    /// # Errors
    /// Returns [`RosterError::Validation`] naming the first step the actor has not completed.
    pub fn into_request(
        self,
        actor_id: ActorId,
        display_name: String,
    ) -> Result<JoinRequest, RosterError> {
        let missing = |step: &str| {
            RosterError::Validation(format!("join session for {actor_id} is missing {step}"))
        };
        let preference = self.preference.ok_or_else(|| missing("a preference"))?;
        let slot_choices = self.slot_choices.ok_or_else(|| missing("slot choices"))?;
        let earliest_available =
            self.earliest_available.ok_or_else(|| missing("an availability time"))?;

        Ok(JoinRequest {
            actor_id,
            display_name,
            preference,
            slot_choices,
            earliest_available,
            remarks: self.remarks,
            synthetic: false,
        })
    }
}

/// Per-actor scratch state with an idle TTL. Nothing here is persisted.
#[derive(Debug)]
pub struct SessionTracker {
    ttl: Duration,
    sessions: HashMap<ActorId, JoinSession>,
}

impl SessionTracker {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, sessions: HashMap::new() }
    }

    fn is_expired(&self, session: &JoinSession, now: OffsetDateTime) -> bool {
        now - session.touched_at > self.ttl
    }

    /// Start a fresh session, replacing whatever the actor had before.
    pub fn begin(
        &mut self,
        actor_id: ActorId,
        recruitment_id: RecruitmentId,
        now: OffsetDateTime,
    ) -> JoinSession {
        let session = JoinSession::new(recruitment_id, now);
        self.sessions.insert(actor_id, session.clone());
        session
    }

    #[must_use]
    pub fn get(&self, actor_id: &ActorId, now: OffsetDateTime) -> Option<&JoinSession> {
        self.sessions.get(actor_id).filter(|session| !self.is_expired(session, now))
    }

    fn update(
        &mut self,
        actor_id: &ActorId,
        now: OffsetDateTime,
        apply: impl FnOnce(&mut JoinSession),
    ) -> Result<JoinSession, RosterError> {
        let ttl = self.ttl;
        let Some(session) =
            self.sessions.get_mut(actor_id).filter(|session| now - session.touched_at <= ttl)
        else {
            return Err(RosterError::Validation(format!("no active join session for {actor_id}")));
        };
        apply(session);
        session.touched_at = now;
        Ok(session.clone())
    }

    /// # Errors
    /// Returns [`RosterError::Validation`] when the actor has no live session.
    pub fn choose_preference(
        &mut self,
        actor_id: &ActorId,
        preference: Preference,
        now: OffsetDateTime,
    ) -> Result<JoinSession, RosterError> {
        self.update(actor_id, now, |session| session.preference = Some(preference))
    }

    /// # Errors
    /// Returns [`RosterError::Validation`] for an empty selection or a missing session.
    pub fn choose_slots(
        &mut self,
        actor_id: &ActorId,
        slots: BTreeSet<Slot>,
        now: OffsetDateTime,
    ) -> Result<JoinSession, RosterError> {
        if slots.is_empty() {
            return Err(RosterError::Validation(
                "slot choices MUST include at least one slot".to_string(),
            ));
        }
        self.update(actor_id, now, |session| session.slot_choices = Some(slots))
    }

    /// # Errors
    /// Returns [`RosterError::Validation`] when the actor has no live session.
    pub fn choose_availability(
        &mut self,
        actor_id: &ActorId,
        earliest_available: TimeSlot,
        now: OffsetDateTime,
    ) -> Result<JoinSession, RosterError> {
        self.update(actor_id, now, |session| session.earliest_available = Some(earliest_available))
    }

    /// # Errors
    /// Returns [`RosterError::Validation`] when the actor has no live session.
    pub fn set_remarks(
        &mut self,
        actor_id: &ActorId,
        remarks: Option<String>,
        now: OffsetDateTime,
    ) -> Result<JoinSession, RosterError> {
        self.update(actor_id, now, |session| session.remarks = remarks)
    }

    /// Remove and return the actor's live session.
    pub fn take(&mut self, actor_id: &ActorId, now: OffsetDateTime) -> Option<JoinSession> {
        let session = self.sessions.remove(actor_id)?;
        (!self.is_expired(&session, now)).then_some(session)
    }

    pub fn cancel(&mut self, actor_id: &ActorId) -> bool {
        self.sessions.remove(actor_id).is_some()
    }

    /// Drop idle sessions; returns how many were removed.
    pub fn evict_expired(&mut self, now: OffsetDateTime) -> usize {
        let ttl = self.ttl;
        let before = self.sessions.len();
        self.sessions.retain(|_, session| now - session.touched_at <= ttl);
        before - self.sessions.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn fixture_time() -> OffsetDateTime {
        datetime!(2026-10-18 12:00 UTC)
    }

    // Test IDs: TSES-001
    #[test]
    fn begin_supersedes_previous_session() {
        let mut tracker = SessionTracker::new(Duration::minutes(15));
        let actor = ActorId::new("alice");
        let first = RecruitmentId::new();
        let second = RecruitmentId::new();

        tracker.begin(actor.clone(), first, fixture_time());
        if let Err(err) = tracker.choose_preference(&actor, Preference::Tengen, fixture_time()) {
            panic!("preference should be recorded: {err}");
        }
        tracker.begin(actor.clone(), second, fixture_time());

        let session = tracker.get(&actor, fixture_time());
        assert_eq!(session.map(|session| session.recruitment_id), Some(second));
        assert_eq!(session.and_then(|session| session.preference), None);
        assert_eq!(tracker.len(), 1);
    }

    // Test IDs: TSES-002
    #[test]
    fn completed_session_becomes_join_request() {
        let mut tracker = SessionTracker::new(Duration::minutes(15));
        let actor = ActorId::new("alice");
        let id = RecruitmentId::new();
        let now = fixture_time();

        tracker.begin(actor.clone(), id, now);
        let steps = [
            tracker.choose_preference(&actor, Preference::Either, now),
            tracker.choose_slots(&actor, [Slot::Fire, Slot::Dark].into_iter().collect(), now),
            tracker.choose_availability(&actor, TimeSlot::NOW, now),
            tracker.set_remarks(&actor, Some("late by 10m".to_string()), now),
        ];
        for step in steps {
            if let Err(err) = step {
                panic!("session step should succeed: {err}");
            }
        }

        let Some(session) = tracker.take(&actor, now) else {
            panic!("session should still be live");
        };
        assert!(tracker.is_empty());

        let request = match session.into_request(actor.clone(), "Alice".to_string()) {
            Ok(request) => request,
            Err(err) => panic!("complete session should convert: {err}"),
        };
        assert_eq!(request.slot_choices.len(), 2);
        assert_eq!(request.remarks.as_deref(), Some("late by 10m"));
    }

    // Test IDs: TSES-003
    #[test]
    fn incomplete_session_names_missing_step() {
        let mut tracker = SessionTracker::new(Duration::minutes(15));
        let actor = ActorId::new("bob");
        tracker.begin(actor.clone(), RecruitmentId::new(), fixture_time());

        let Some(session) = tracker.take(&actor, fixture_time()) else {
            panic!("session should be live");
        };
        let err = match session.into_request(actor, "Bob".to_string()) {
            Ok(_) => panic!("incomplete session must not convert"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("preference"));
    }

    // Test IDs: TSES-004
    #[test]
    fn idle_sessions_expire_and_cannot_be_updated() {
        let mut tracker = SessionTracker::new(Duration::minutes(15));
        let actor = ActorId::new("carol");
        tracker.begin(actor.clone(), RecruitmentId::new(), fixture_time());

        let later = fixture_time() + Duration::minutes(16);
        assert!(tracker.get(&actor, later).is_none());
        assert!(matches!(
            tracker.choose_availability(&actor, TimeSlot::NOW, later),
            Err(RosterError::Validation(_))
        ));
        assert_eq!(tracker.evict_expired(later), 1);
        assert!(!tracker.cancel(&actor));
    }

    // Test IDs: TSES-005
    #[test]
    fn each_step_refreshes_the_idle_timer() {
        let mut tracker = SessionTracker::new(Duration::minutes(15));
        let actor = ActorId::new("dave");
        tracker.begin(actor.clone(), RecruitmentId::new(), fixture_time());

        let step_time = fixture_time() + Duration::minutes(10);
        if let Err(err) = tracker.choose_preference(&actor, Preference::LuciZero, step_time) {
            panic!("live session should update: {err}");
        }
        let check_time = fixture_time() + Duration::minutes(20);
        assert_eq!(tracker.evict_expired(check_time), 0);
        assert!(tracker.get(&actor, check_time).is_some());
    }

    // Test IDs: TSES-006
    #[test]
    fn empty_slot_selection_is_rejected() {
        let mut tracker = SessionTracker::new(Duration::minutes(15));
        let actor = ActorId::new("erin");
        tracker.begin(actor.clone(), RecruitmentId::new(), fixture_time());
        assert!(tracker.choose_slots(&actor, BTreeSet::new(), fixture_time()).is_err());
    }
}
