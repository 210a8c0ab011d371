//! File-backed roster source.
//!
//! The entry system (an external collaborator) maintains a JSON
//! document mapping each unit to its registered participants and the
//! event dates. The daemon only reads it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use scrimd_core::notify::{NotifyError, ParticipantId, RosterSource};
use scrimd_core::time::Clock;
use scrimd_core::unit::UnitId;
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
struct RosterEntry {
    #[serde(default)]
    participants: BTreeSet<ParticipantId>,
    #[serde(default)]
    event_dates: BTreeSet<NaiveDate>,
}

type RosterDocument = BTreeMap<String, RosterEntry>;

/// Roster source reading the entry system's JSON document on every
/// call, so roster changes show up without a daemon restart.
pub struct FileRosterSource {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileRosterSource {
    /// Creates a source for the given document path.
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }

    fn load(&self) -> Result<RosterDocument, NotifyError> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| NotifyError::RosterUnavailable {
                detail: format!("read {}: {e}", self.path.display()),
            })?;
        serde_json::from_str(&content).map_err(|e| NotifyError::RosterUnavailable {
            detail: format!("decode {}: {e}", self.path.display()),
        })
    }
}

#[async_trait]
impl RosterSource for FileRosterSource {
    async fn list_participants(
        &self,
        unit: &UnitId,
    ) -> Result<BTreeSet<ParticipantId>, NotifyError> {
        let doc = self.load()?;
        Ok(doc
            .get(unit.as_str())
            .map(|entry| entry.participants.clone())
            .unwrap_or_default())
    }

    async fn is_present_today(&self, unit: &UnitId) -> Result<bool, NotifyError> {
        let doc = self.load()?;
        let today = self.clock.today();
        Ok(doc
            .get(unit.as_str())
            .is_some_and(|entry| entry.event_dates.contains(&today)))
    }
}

/// Fixed roster for tests: same participants every day, always an
/// event day.
pub struct FixedRoster {
    participants: BTreeSet<ParticipantId>,
}

impl FixedRoster {
    /// Creates a roster from entry numbers.
    ///
    /// # Panics
    ///
    /// Panics on an invalid entry number; inputs are test literals.
    #[must_use]
    pub fn of(numbers: &[&str]) -> Self {
        Self {
            participants: numbers
                .iter()
                .map(|n| ParticipantId::new(*n).expect("valid test entry number"))
                .collect(),
        }
    }
}

#[async_trait]
impl RosterSource for FixedRoster {
    async fn list_participants(
        &self,
        _unit: &UnitId,
    ) -> Result<BTreeSet<ParticipantId>, NotifyError> {
        Ok(self.participants.clone())
    }

    async fn is_present_today(&self, _unit: &UnitId) -> Result<bool, NotifyError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use scrimd_core::time::FixedClock;

    use super::*;

    #[tokio::test]
    async fn test_reads_unit_entry_from_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.json");
        std::fs::write(
            &path,
            r#"{
                "or40": {
                    "participants": ["001", "002"],
                    "event_dates": ["2026-08-07"]
                }
            }"#,
        )
        .unwrap();
        let clock = Arc::new(FixedClock::at("2026-08-07T21:00:00+09:00"));
        let source = FileRosterSource::new(&path, clock);

        let unit = UnitId::new("or40").unwrap();
        let roster = source.list_participants(&unit).await.unwrap();
        assert_eq!(roster.len(), 2);
        assert!(source.is_present_today(&unit).await.unwrap());

        let other = UnitId::new("other").unwrap();
        assert!(source.list_participants(&other).await.unwrap().is_empty());
        assert!(!source.is_present_today(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_document_is_roster_unavailable() {
        let clock = Arc::new(FixedClock::at("2026-08-07T21:00:00+09:00"));
        let source = FileRosterSource::new("/nonexistent/roster.json", clock);
        let unit = UnitId::new("or40").unwrap();
        let err = source.list_participants(&unit).await.unwrap_err();
        assert!(matches!(err, NotifyError::RosterUnavailable { .. }));
    }
}
