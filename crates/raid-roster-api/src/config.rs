use std::time::Duration;

use raid_roster_core::{ClosingSchedule, RetentionPolicy, RosterError};

/// Deployment constants for the roster. `Default` matches the observed deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterConfig {
    /// Maximum distinct participants per recruitment.
    pub capacity: usize,
    /// Participant count at which joins start rendering a preview assignment.
    pub preview_threshold: usize,
    pub max_remarks_len: usize,
    pub closing: ClosingSchedule,
    pub retention: RetentionPolicy,
    pub session_ttl: time::Duration,
    pub autosave_interval: Duration,
    pub auto_close_interval: Duration,
    pub retention_interval: Duration,
    pub session_sweep_interval: Duration,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            capacity: 6,
            preview_threshold: 6,
            max_remarks_len: 100,
            closing: ClosingSchedule::default(),
            retention: RetentionPolicy::default(),
            session_ttl: time::Duration::minutes(15),
            autosave_interval: Duration::from_secs(2 * 60),
            auto_close_interval: Duration::from_secs(5 * 60),
            retention_interval: Duration::from_secs(6 * 60 * 60),
            session_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RosterConfig {
    /// # Errors
    /// Returns [`RosterError::Validation`] for settings the controller cannot run with.
    pub fn validate(&self) -> Result<(), RosterError> {
        if self.capacity == 0 {
            return Err(RosterError::Validation("capacity MUST be at least 1".to_string()));
        }
        if self.preview_threshold == 0 {
            return Err(RosterError::Validation("preview_threshold MUST be at least 1".to_string()));
        }
        if self.closing.hour > 23 {
            return Err(RosterError::Validation(format!(
                "closing hour MUST be within 0..=23 (got {})",
                self.closing.hour
            )));
        }
        if self.retention.terminal_max_age > self.retention.max_age {
            return Err(RosterError::Validation(
                "terminal retention MUST NOT exceed the absolute retention ceiling".to_string(),
            ));
        }
        let intervals = [
            ("autosave_interval", self.autosave_interval),
            ("auto_close_interval", self.auto_close_interval),
            ("retention_interval", self.retention_interval),
            ("session_sweep_interval", self.session_sweep_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, interval)| interval.is_zero()) {
            return Err(RosterError::Validation(format!("{name} MUST be non-zero")));
        }
        Ok(())
    }
}
