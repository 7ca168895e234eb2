use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use ulid::Ulid;

mod assignment;

pub use assignment::{
    compute_assignment, AssignmentMode, AssignmentOutcome, RankedParticipant, VoteTally,
};

/// `YYYY-MM-DD` serde for [`Date`] fields.
pub mod date_format {
    use time::Date;

    time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

    pub use iso_date::{deserialize, serialize};
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RosterError {
    #[error("recruitment not found: {0}")]
    RecruitmentNotFound(RecruitmentId),
    #[error("recruitment {id} is {state}; cannot {operation}")]
    InvalidState { id: RecruitmentId, state: RecruitmentState, operation: &'static str },
    #[error("recruitment {0} is not open for sign-ups")]
    RecruitmentNotOpen(RecruitmentId),
    #[error("recruitment {0} is closed; participation can no longer be withdrawn")]
    RecruitmentClosed(RecruitmentId),
    #[error("recruitment {0} is already closed")]
    AlreadyClosed(RecruitmentId),
    #[error("actor {actor} may not {operation} recruitment {id}")]
    Forbidden { id: RecruitmentId, actor: ActorId, operation: &'static str },
    #[error("actor {actor} is not a participant of recruitment {id}")]
    NotAParticipant { id: RecruitmentId, actor: ActorId },
    #[error("recruitment {id} is full ({capacity} participants)")]
    RecruitmentFull { id: RecruitmentId, capacity: usize },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("assignment failed for recruitment {id}: {reason}")]
    AssignmentFailure { id: RecruitmentId, reason: String },
    #[error("presentation failed for recruitment {id}: {reason}")]
    PresentationFailure { id: RecruitmentId, reason: String },
    #[error("recruitment {0} lost its rendered message and was removed")]
    RecruitmentOrphaned(RecruitmentId),
}

impl RosterError {
    /// Stable machine-readable name for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RecruitmentNotFound(_) => "recruitment_not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::RecruitmentNotOpen(_) => "recruitment_not_open",
            Self::RecruitmentClosed(_) => "recruitment_closed",
            Self::AlreadyClosed(_) => "already_closed",
            Self::Forbidden { .. } => "forbidden",
            Self::NotAParticipant { .. } => "not_a_participant",
            Self::RecruitmentFull { .. } => "recruitment_full",
            Self::Validation(_) => "validation",
            Self::AssignmentFailure { .. } => "assignment_failure",
            Self::PresentationFailure { .. } => "presentation_failure",
            Self::RecruitmentOrphaned(_) => "recruitment_orphaned",
        }
    }

    /// True for every error that reports an operation attempted in the wrong state.
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::RecruitmentNotOpen(_)
                | Self::RecruitmentClosed(_)
                | Self::AlreadyClosed(_)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecruitmentId(pub Ulid);

impl RecruitmentId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecruitmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecruitmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecruitmentId {
    type Err = RosterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| RosterError::Validation(format!("invalid recruitment id {value}: {err}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The caller of an authority-checked operation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub id: ActorId,
    #[serde(default)]
    pub elevated: bool,
}

impl Actor {
    #[must_use]
    pub fn member(id: impl Into<String>) -> Self {
        Self { id: ActorId::new(id), elevated: false }
    }

    #[must_use]
    pub fn elevated(id: impl Into<String>) -> Self {
        Self { id: ActorId::new(id), elevated: true }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Tengen,
    #[serde(rename = "lucizero")]
    LuciZero,
    Vote,
}

impl ActivityKind {
    /// Winner of a tied vote.
    pub const DEFAULT_VARIANT: Self = Self::Tengen;

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tengen => "tengen",
            Self::LuciZero => "lucizero",
            Self::Vote => "vote",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tengen" => Some(Self::Tengen),
            "lucizero" => Some(Self::LuciZero),
            "vote" => Some(Self::Vote),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_concrete(self) -> bool {
        !matches!(self, Self::Vote)
    }
}

impl Display for ActivityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Preference {
    Tengen,
    #[serde(rename = "lucizero")]
    LuciZero,
    Either,
}

impl Preference {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tengen => "tengen",
            Self::LuciZero => "lucizero",
            Self::Either => "either",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tengen" => Some(Self::Tengen),
            "lucizero" => Some(Self::LuciZero),
            "either" => Some(Self::Either),
            _ => None,
        }
    }

    /// Whether a participant with this preference can take part in `kind`.
    #[must_use]
    pub fn accepts(self, kind: ActivityKind) -> bool {
        matches!(
            (self, kind),
            (Self::Either, _)
                | (Self::Tengen, ActivityKind::Tengen)
                | (Self::LuciZero, ActivityKind::LuciZero)
        )
    }
}

/// One of the six element roles a party needs filled. Declaration order is the claim order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Fire,
    Water,
    Earth,
    Wind,
    Light,
    Dark,
}

impl Slot {
    pub const ALL: [Self; 6] =
        [Self::Fire, Self::Water, Self::Earth, Self::Wind, Self::Light, Self::Dark];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fire => "fire",
            Self::Water => "water",
            Self::Earth => "earth",
            Self::Wind => "wind",
            Self::Light => "light",
            Self::Dark => "dark",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|slot| slot.as_str() == value)
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-of-day token from the ordinal table: `now` (ordinal 0) then `00:00` through `23:00`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct TimeSlot(u8);

impl TimeSlot {
    pub const NOW: Self = Self(0);

    /// # Errors
    /// Returns [`RosterError::Validation`] when `hour` is not in `0..=23`.
    pub fn at_hour(hour: u8) -> Result<Self, RosterError> {
        if hour > 23 {
            return Err(RosterError::Validation(format!("hour {hour} is outside 00..23")));
        }
        Ok(Self(hour + 1))
    }

    #[must_use]
    pub fn ordinal(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn hour(self) -> Option<u8> {
        self.0.checked_sub(1)
    }

    /// Every token in ordinal order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..=24).map(Self)
    }
}

impl Display for TimeSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.hour() {
            None => f.write_str("now"),
            Some(hour) => write!(f, "{hour:02}:00"),
        }
    }
}

impl FromStr for TimeSlot {
    type Err = RosterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "now" {
            return Ok(Self::NOW);
        }
        let invalid = || RosterError::Validation(format!("unknown time token: {value}"));
        let hour = value.strip_suffix(":00").ok_or_else(invalid)?;
        if hour.len() != 2 {
            return Err(invalid());
        }
        let hour = hour.parse::<u8>().map_err(|_| invalid())?;
        Self::at_hour(hour).map_err(|_| invalid())
    }
}

impl TryFrom<String> for TimeSlot {
    type Error = RosterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeSlot> for String {
    fn from(value: TimeSlot) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecruitmentState {
    Pending,
    Open,
    Closed,
    Assigned,
    Errored,
}

impl RecruitmentState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Assigned => "assigned",
            Self::Errored => "errored",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "assigned" => Some(Self::Assigned),
            "errored" => Some(Self::Errored),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Assigned | Self::Errored)
    }
}

impl Display for RecruitmentState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to the rendered recruitment message; only the presenter interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct RenderHandle {
    pub channel_ref: String,
    pub message_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Participant {
    pub actor_id: ActorId,
    pub display_name: String,
    pub preference: Preference,
    pub slot_choices: BTreeSet<Slot>,
    pub earliest_available: TimeSlot,
    #[serde(default)]
    pub remarks: Option<String>,
    #[serde(default)]
    pub assigned_slot: Option<Slot>,
    #[serde(default)]
    pub synthetic: bool,
}

impl Participant {
    /// Validate the structural invariants every stored participant must satisfy.
    ///
    /// # Errors
    /// Returns [`RosterError::Validation`] for an empty actor id, display name, or slot set,
    /// or an assigned slot the participant never chose.
    pub fn validate(&self) -> Result<(), RosterError> {
        if self.actor_id.as_str().trim().is_empty() {
            return Err(RosterError::Validation("actor_id MUST be non-empty".to_string()));
        }

        if self.display_name.trim().is_empty() {
            return Err(RosterError::Validation(format!(
                "display_name MUST be non-empty for actor {}",
                self.actor_id
            )));
        }

        if self.slot_choices.is_empty() {
            return Err(RosterError::Validation(format!(
                "slot_choices MUST include at least one slot for actor {}",
                self.actor_id
            )));
        }

        if let Some(slot) = self.assigned_slot {
            if !self.slot_choices.contains(&slot) {
                return Err(RosterError::Validation(format!(
                    "assigned slot {slot} is not among the choices of actor {}",
                    self.actor_id
                )));
            }
        }

        Ok(())
    }

    /// Trim remarks, drop blank ones, and enforce the length bound.
    ///
    /// # Errors
    /// Returns [`RosterError::Validation`] when the remarks exceed `max_len` characters.
    pub fn normalize_remarks(&mut self, max_len: usize) -> Result<(), RosterError> {
        let remarks = self
            .remarks
            .take()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if let Some(value) = &remarks {
            let length = value.chars().count();
            if length > max_len {
                return Err(RosterError::Validation(format!(
                    "remarks MUST be at most {max_len} characters (got {length})"
                )));
            }
        }
        self.remarks = remarks;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JoinOutcome {
    Inserted,
    Replaced,
}

/// What drove a recruitment to close.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CloseTrigger {
    Actor,
    Deadline,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Recruitment {
    pub id: RecruitmentId,
    pub activity_kind: ActivityKind,
    #[serde(with = "date_format")]
    pub scheduled_date: Date,
    pub proposed_time: TimeSlot,
    pub organizer_id: ActorId,
    pub state: RecruitmentState,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub final_activity_kind: Option<ActivityKind>,
    #[serde(default)]
    pub final_time: Option<TimeSlot>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub render_handle: Option<RenderHandle>,
}

impl Recruitment {
    #[must_use]
    pub fn new_pending(
        activity_kind: ActivityKind,
        scheduled_date: Date,
        proposed_time: TimeSlot,
        organizer_id: ActorId,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: RecruitmentId::new(),
            activity_kind,
            scheduled_date,
            proposed_time,
            organizer_id,
            state: RecruitmentState::Pending,
            participants: Vec::new(),
            final_activity_kind: None,
            final_time: None,
            created_at,
            render_handle: None,
        }
    }

    #[must_use]
    pub fn participant(&self, actor_id: &ActorId) -> Option<&Participant> {
        self.participants.iter().find(|participant| &participant.actor_id == actor_id)
    }

    #[must_use]
    pub fn has_final_assignment(&self) -> bool {
        self.final_activity_kind.is_some() && self.final_time.is_some()
    }

    /// Validate a stored recruitment against the lifecycle invariants.
    ///
    /// # Errors
    /// Returns [`RosterError::Validation`] describing the first violated invariant.
    pub fn validate(&self) -> Result<(), RosterError> {
        let mut seen = BTreeSet::new();
        let mut claimed = BTreeSet::new();
        for participant in &self.participants {
            participant.validate()?;
            if !seen.insert(&participant.actor_id) {
                return Err(RosterError::Validation(format!(
                    "actor {} appears more than once",
                    participant.actor_id
                )));
            }
            if let Some(slot) = participant.assigned_slot {
                if !claimed.insert(slot) {
                    return Err(RosterError::Validation(format!(
                        "slot {slot} is assigned to more than one participant"
                    )));
                }
            }
        }

        if self.final_activity_kind.is_some() != self.final_time.is_some() {
            return Err(RosterError::Validation(
                "final_activity_kind and final_time MUST be set together".to_string(),
            ));
        }

        if self.final_activity_kind.is_some_and(|kind| !kind.is_concrete()) {
            return Err(RosterError::Validation(
                "final_activity_kind MUST be a concrete variant".to_string(),
            ));
        }

        if !self.has_final_assignment() && !claimed.is_empty() {
            return Err(RosterError::Validation(
                "assigned slots require a final assignment".to_string(),
            ));
        }

        match self.state {
            RecruitmentState::Pending => {
                if !self.participants.is_empty() || self.render_handle.is_some() {
                    return Err(RosterError::Validation(
                        "pending recruitments MUST have no participants and no render handle"
                            .to_string(),
                    ));
                }
                if self.has_final_assignment() {
                    return Err(RosterError::Validation(
                        "pending recruitments MUST NOT carry a final assignment".to_string(),
                    ));
                }
            }
            RecruitmentState::Open => {
                if self.render_handle.is_none() {
                    return Err(RosterError::Validation(
                        "open recruitments MUST have a render handle".to_string(),
                    ));
                }
                if self.has_final_assignment() {
                    return Err(RosterError::Validation(
                        "open recruitments MUST NOT carry a final assignment".to_string(),
                    ));
                }
            }
            RecruitmentState::Assigned => {
                if !self.has_final_assignment() {
                    return Err(RosterError::Validation(
                        "assigned recruitments MUST carry a final assignment".to_string(),
                    ));
                }
            }
            RecruitmentState::Closed | RecruitmentState::Errored => {}
        }

        Ok(())
    }

    /// `Pending -> Open`, attaching the render handle exactly once.
    ///
    /// # Errors
    /// Returns [`RosterError::InvalidState`] unless the recruitment is pending.
    pub fn open(&mut self, handle: RenderHandle) -> Result<(), RosterError> {
        self.ensure_pending("open")?;
        self.render_handle = Some(handle);
        self.state = RecruitmentState::Open;
        Ok(())
    }

    /// # Errors
    /// Returns [`RosterError::InvalidState`] unless the recruitment is pending.
    pub fn ensure_pending(&self, operation: &'static str) -> Result<(), RosterError> {
        if self.state != RecruitmentState::Pending {
            return Err(RosterError::InvalidState { id: self.id, state: self.state, operation });
        }
        Ok(())
    }

    /// Insert a participant, or replace the record of an actor who already joined.
    ///
    /// # Errors
    /// Returns [`RosterError::RecruitmentNotOpen`] outside `Open`, [`RosterError::Validation`]
    /// for an invalid participant, or [`RosterError::RecruitmentFull`] when a new actor would
    /// exceed `capacity`.
    pub fn upsert_participant(
        &mut self,
        mut participant: Participant,
        capacity: usize,
    ) -> Result<JoinOutcome, RosterError> {
        if self.state != RecruitmentState::Open {
            return Err(RosterError::RecruitmentNotOpen(self.id));
        }

        participant.assigned_slot = None;
        participant.validate()?;

        if let Some(existing) =
            self.participants.iter_mut().find(|existing| existing.actor_id == participant.actor_id)
        {
            *existing = participant;
            return Ok(JoinOutcome::Replaced);
        }

        if self.participants.len() >= capacity {
            return Err(RosterError::RecruitmentFull { id: self.id, capacity });
        }

        self.participants.push(participant);
        Ok(JoinOutcome::Inserted)
    }

    /// Withdraw an actor from an open recruitment.
    ///
    /// # Errors
    /// Returns [`RosterError::NotAParticipant`] when the actor never joined, or
    /// [`RosterError::RecruitmentClosed`] once the recruitment has left `Open`.
    pub fn remove_participant(&mut self, actor_id: &ActorId) -> Result<Participant, RosterError> {
        let Some(index) =
            self.participants.iter().position(|participant| &participant.actor_id == actor_id)
        else {
            return Err(RosterError::NotAParticipant { id: self.id, actor: actor_id.clone() });
        };

        if self.state != RecruitmentState::Open {
            return Err(RosterError::RecruitmentClosed(self.id));
        }

        Ok(self.participants.remove(index))
    }

    /// Only the organizer or an elevated actor may force-close or delete.
    ///
    /// # Errors
    /// Returns [`RosterError::Forbidden`] for any other actor.
    pub fn authorize(&self, actor: &Actor, operation: &'static str) -> Result<(), RosterError> {
        if actor.elevated || actor.id == self.organizer_id {
            return Ok(());
        }
        Err(RosterError::Forbidden { id: self.id, actor: actor.id.clone(), operation })
    }

    /// # Errors
    /// Returns [`RosterError::AlreadyClosed`] for terminal recruitments and
    /// [`RosterError::InvalidState`] for pending ones, which must be opened first.
    pub fn ensure_closable(&self) -> Result<(), RosterError> {
        match self.state {
            RecruitmentState::Open => Ok(()),
            RecruitmentState::Pending => Err(RosterError::InvalidState {
                id: self.id,
                state: self.state,
                operation: "close",
            }),
            RecruitmentState::Closed | RecruitmentState::Assigned | RecruitmentState::Errored => {
                Err(RosterError::AlreadyClosed(self.id))
            }
        }
    }

    /// Write a final assignment back onto the record.
    ///
    /// Every participant's slot is overwritten (ineligible and unreached ones are cleared). A run
    /// with no eligible participants closes the recruitment without assignments.
    pub fn record_assignment(&mut self, outcome: &AssignmentOutcome) {
        for participant in &mut self.participants {
            participant.assigned_slot = outcome.slot_for(&participant.actor_id);
        }
        self.final_activity_kind = Some(outcome.final_activity_kind);
        self.final_time = Some(outcome.final_time);
        self.state = if outcome.is_degenerate() {
            RecruitmentState::Closed
        } else {
            RecruitmentState::Assigned
        };
    }

    /// Mark a close whose assignment run failed. The record stays non-authoritative until an
    /// operator intervenes.
    pub fn record_assignment_failure(&mut self, trigger: CloseTrigger) {
        for participant in &mut self.participants {
            participant.assigned_slot = None;
        }
        self.final_activity_kind = None;
        self.final_time = None;
        self.state = match trigger {
            CloseTrigger::Actor => RecruitmentState::Closed,
            CloseTrigger::Deadline => RecruitmentState::Errored,
        };
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Older than the absolute ceiling, whatever the state.
    Expired,
    /// Terminal and older than the terminal ceiling.
    TerminalExpired,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub terminal_max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_age: Duration::days(7), terminal_max_age: Duration::days(3) }
    }
}

impl RetentionPolicy {
    #[must_use]
    pub fn eviction_reason(
        &self,
        recruitment: &Recruitment,
        now: OffsetDateTime,
    ) -> Option<EvictionReason> {
        let age = now - recruitment.created_at;
        if age > self.max_age {
            return Some(EvictionReason::Expired);
        }
        if recruitment.state.is_terminal() && age > self.terminal_max_age {
            return Some(EvictionReason::TerminalExpired);
        }
        None
    }
}

/// Fixed local time-of-day on the scheduled date at which open recruitments close.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ClosingSchedule {
    pub hour: u8,
    pub utc_offset: UtcOffset,
}

impl Default for ClosingSchedule {
    fn default() -> Self {
        Self { hour: 8, utc_offset: time::macros::offset!(+9) }
    }
}

impl ClosingSchedule {
    /// # Errors
    /// Returns [`RosterError::Validation`] when the configured hour is not a valid time of day.
    pub fn deadline_for(&self, date: Date) -> Result<OffsetDateTime, RosterError> {
        let time = Time::from_hms(self.hour, 0, 0).map_err(|err| {
            RosterError::Validation(format!("invalid closing hour {}: {err}", self.hour))
        })?;
        Ok(PrimitiveDateTime::new(date, time).assume_offset(self.utc_offset))
    }

    /// # Errors
    /// Returns [`RosterError::Validation`] when the configured hour is invalid.
    pub fn is_due(
        &self,
        recruitment: &Recruitment,
        now: OffsetDateTime,
    ) -> Result<bool, RosterError> {
        Ok(now >= self.deadline_for(recruitment.scheduled_date)?)
    }
}

/// Broadcast text for a terminal transition.
#[must_use]
pub fn closing_summary(recruitment: &Recruitment, trigger: CloseTrigger) -> String {
    let how = match trigger {
        CloseTrigger::Actor => "closed",
        CloseTrigger::Deadline => "closed automatically",
    };
    let kind = recruitment.final_activity_kind.unwrap_or(recruitment.activity_kind);
    let time = recruitment.final_time.unwrap_or(recruitment.proposed_time);

    let mut text = format!(
        "[{kind}] recruitment {} {how}\nscheduled: {} at {time}\nparticipants: {}\n",
        recruitment.id,
        recruitment.scheduled_date,
        recruitment.participants.len()
    );

    if !recruitment.has_final_assignment() {
        text.push_str("assignment failed; manual follow-up required\n");
        return text;
    }

    for slot in Slot::ALL {
        let holder = recruitment
            .participants
            .iter()
            .find(|participant| participant.assigned_slot == Some(slot))
            .map_or("vacant", |participant| participant.display_name.as_str());
        text.push_str(&format!("{slot}: {holder}\n"));
    }
    text
}
