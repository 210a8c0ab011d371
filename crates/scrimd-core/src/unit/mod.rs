//! The per-unit state document.
//!
//! One organizational unit (a server/guild running one event at a
//! time) owns exactly one [`UnitState`]: the round state machine, the
//! check-in tracker, and the optional escalation ladder, persisted
//! together as a single snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkin::CheckinTracker;
use crate::escalation::EscalationLadder;
use crate::round::RoundState;

/// Identifier of an organizational unit.
///
/// Doubles as the snapshot filename stem, so the character set is
/// restricted accordingly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitId(String);

/// Rejection of a malformed unit identifier.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid unit id '{0}': expected 1-64 chars of [a-z0-9_-]")]
pub struct InvalidUnitId(pub String);

impl UnitId {
    /// Validates and wraps a unit identifier.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidUnitId`] for an empty, over-long, or
    /// non-filename-safe value.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidUnitId> {
        let value = value.into();
        let valid = !value.is_empty()
            && value.len() <= 64
            && value
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if valid {
            Ok(Self(value))
        } else {
            Err(InvalidUnitId(value))
        }
    }

    /// The identifier as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UnitId {
    type Error = InvalidUnitId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UnitId> for String {
    fn from(value: UnitId) -> Self {
        value.0
    }
}

/// Everything the orchestrator persists for one unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitState {
    /// Round progression state machine.
    #[serde(default)]
    pub round: RoundState,
    /// Pre-event check-in state.
    #[serde(default)]
    pub checkin: CheckinTracker,
    /// Escalation ladder for the round currently awaiting results.
    #[serde(default)]
    pub escalation: Option<EscalationLadder>,
}

impl UnitState {
    /// Fresh state for a unit seen for the first time.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks the round-state invariants; used by property tests.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.round.check_invariants()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_id_validation() {
        assert!(UnitId::new("or40").is_ok());
        assert!(UnitId::new("guild-123_a").is_ok());
        assert!(UnitId::new("").is_err());
        assert!(UnitId::new("Has Upper").is_err());
        assert!(UnitId::new("dots.bad").is_err());
        assert!(UnitId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn test_snapshot_round_trips_through_json() {
        let state = UnitState::new();
        let json = serde_json::to_string(&state).unwrap();
        let back: UnitState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_empty_document_loads_with_defaults() {
        let state: UnitState = serde_json::from_str("{}").unwrap();
        assert_eq!(state.round.round_number(), 1);
        assert!(state.escalation.is_none());
    }
}
