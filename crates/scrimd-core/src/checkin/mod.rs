//! Pre-event check-in phases.
//!
//! Four announcements fire at fixed offsets before the configured
//! event start, each at most once per calendar day; the guard date is
//! persisted so a restart cannot re-fire a phase. Participants land in
//! exactly one of three disjoint buckets (checked in, declined,
//! forfeited round 1) or remain unoperated.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notify::{DeliveryId, ParticipantId};
use crate::time::TimeOfDay;

/// One of the four pre-event announcement phases.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CheckinPhase {
    /// Event start − 30 min: open check-in to every roster member.
    Open,
    /// Event start − 10 min: remind members who have not operated yet.
    Reminder,
    /// Event start − 5 min: freeze a status snapshot for operators.
    StatusSnapshot,
    /// Event start − 2 min: final broadcast ("begin setup").
    FinalBroadcast,
}

impl CheckinPhase {
    /// All phases, in firing order.
    pub const ALL: [Self; 4] = [
        Self::Open,
        Self::Reminder,
        Self::StatusSnapshot,
        Self::FinalBroadcast,
    ];

    /// Minutes before event start at which this phase becomes due.
    #[must_use]
    pub const fn offset_minutes(self) -> u32 {
        match self {
            Self::Open => 30,
            Self::Reminder => 10,
            Self::StatusSnapshot => 5,
            Self::FinalBroadcast => 2,
        }
    }

    /// Looks up a phase by its operator-facing number (1-4).
    #[must_use]
    pub const fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Open),
            2 => Some(Self::Reminder),
            3 => Some(Self::StatusSnapshot),
            4 => Some(Self::FinalBroadcast),
            _ => None,
        }
    }

    /// Operator-facing phase number (1-4).
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Open => 1,
            Self::Reminder => 2,
            Self::StatusSnapshot => 3,
            Self::FinalBroadcast => 4,
        }
    }
}

impl fmt::Display for CheckinPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Open => "open",
            Self::Reminder => "reminder",
            Self::StatusSnapshot => "status_snapshot",
            Self::FinalBroadcast => "final_broadcast",
        };
        f.write_str(label)
    }
}

/// How a participant responded to check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckinMark {
    /// Ready to play.
    CheckedIn,
    /// Withdrawing from the event.
    Declined,
    /// Skipping round 1 only.
    Forfeited,
}

/// Errors from check-in bookkeeping.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CheckinError {
    /// The participant is not on today's roster.
    #[error("participant {id} is not on the roster")]
    NotOnRoster {
        /// The unknown entry number.
        id: ParticipantId,
    },
}

/// Per-event-day check-in state.
///
/// The three mark sets are disjoint subsets of the roster; marking a
/// participant moves them between buckets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckinTracker {
    #[serde(default)]
    roster: BTreeSet<ParticipantId>,
    #[serde(default)]
    checked_in: BTreeSet<ParticipantId>,
    #[serde(default)]
    declined: BTreeSet<ParticipantId>,
    #[serde(default)]
    forfeited: BTreeSet<ParticipantId>,

    /// Send-once guard: phase -> date it last fired.
    #[serde(default)]
    phase_sent_dates: BTreeMap<CheckinPhase, NaiveDate>,

    /// Check-in window closed for the day (automation may take over).
    #[serde(default)]
    closed: bool,

    /// Operator status board, edited in place once posted.
    #[serde(default)]
    status_notice: Option<DeliveryId>,
    /// Minute key (`YYYY-MM-DD HH:MM`) of the last board refresh.
    #[serde(default)]
    status_refreshed_minute: Option<String>,
}

impl CheckinTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the roster from the entry system. Marks for entries no
    /// longer on the roster are dropped.
    pub fn set_roster(&mut self, roster: BTreeSet<ParticipantId>) {
        self.checked_in.retain(|id| roster.contains(id));
        self.declined.retain(|id| roster.contains(id));
        self.forfeited.retain(|id| roster.contains(id));
        self.roster = roster;
    }

    /// Current roster.
    #[must_use]
    pub const fn roster(&self) -> &BTreeSet<ParticipantId> {
        &self.roster
    }

    /// Participants who checked in.
    #[must_use]
    pub const fn checked_in(&self) -> &BTreeSet<ParticipantId> {
        &self.checked_in
    }

    /// Participants who declined.
    #[must_use]
    pub const fn declined(&self) -> &BTreeSet<ParticipantId> {
        &self.declined
    }

    /// Participants forfeiting round 1.
    #[must_use]
    pub const fn forfeited(&self) -> &BTreeSet<ParticipantId> {
        &self.forfeited
    }

    /// Roster members who have not operated yet.
    #[must_use]
    pub fn unoperated(&self) -> BTreeSet<ParticipantId> {
        self.roster
            .iter()
            .filter(|id| {
                !self.checked_in.contains(*id)
                    && !self.declined.contains(*id)
                    && !self.forfeited.contains(*id)
            })
            .cloned()
            .collect()
    }

    /// Records a participant's response, moving them out of any other
    /// bucket. Returns `false` when the mark was already in place.
    ///
    /// # Errors
    ///
    /// Returns [`CheckinError::NotOnRoster`] for unknown entries.
    pub fn mark(&mut self, id: &ParticipantId, mark: CheckinMark) -> Result<bool, CheckinError> {
        if !self.roster.contains(id) {
            return Err(CheckinError::NotOnRoster { id: id.clone() });
        }
        let target = match mark {
            CheckinMark::CheckedIn => &self.checked_in,
            CheckinMark::Declined => &self.declined,
            CheckinMark::Forfeited => &self.forfeited,
        };
        if target.contains(id) {
            return Ok(false);
        }
        self.checked_in.remove(id);
        self.declined.remove(id);
        self.forfeited.remove(id);
        match mark {
            CheckinMark::CheckedIn => self.checked_in.insert(id.clone()),
            CheckinMark::Declined => self.declined.insert(id.clone()),
            CheckinMark::Forfeited => self.forfeited.insert(id.clone()),
        };
        Ok(true)
    }

    /// Phases due at `now` for an event starting at `start` that have
    /// not fired on `today` yet, in firing order.
    ///
    /// Offsets assume the start time is at least 30 minutes into the
    /// day; config validation enforces that.
    #[must_use]
    pub fn due_phases(
        &self,
        now: TimeOfDay,
        start: TimeOfDay,
        today: NaiveDate,
    ) -> Vec<CheckinPhase> {
        CheckinPhase::ALL
            .into_iter()
            .filter(|phase| {
                now >= start.wrapping_sub_minutes(phase.offset_minutes())
                    && !self.sent_on(*phase, today)
            })
            .collect()
    }

    /// Whether a phase already fired on the given date.
    #[must_use]
    pub fn sent_on(&self, phase: CheckinPhase, date: NaiveDate) -> bool {
        self.phase_sent_dates.get(&phase) == Some(&date)
    }

    /// Arms the send-once guard for a phase. Recorded before the
    /// dispatch goes out, so a crash in between errs on the side of
    /// not re-sending.
    pub fn record_sent(&mut self, phase: CheckinPhase, date: NaiveDate) {
        self.phase_sent_dates.insert(phase, date);
    }

    /// Clears the guard after a failed dispatch so the next tick
    /// retries the phase.
    pub fn clear_sent(&mut self, phase: CheckinPhase) {
        self.phase_sent_dates.remove(&phase);
    }

    /// Recipients for a phase: everyone for the opener, the unoperated
    /// remainder for the reminder. The snapshot and final broadcast
    /// target fixed destinations, not individual participants.
    #[must_use]
    pub fn phase_targets(&self, phase: CheckinPhase) -> Vec<ParticipantId> {
        match phase {
            CheckinPhase::Open => self.roster.iter().cloned().collect(),
            CheckinPhase::Reminder => self.unoperated().into_iter().collect(),
            CheckinPhase::StatusSnapshot | CheckinPhase::FinalBroadcast => Vec::new(),
        }
    }

    /// Whether the check-in window has been closed for the day.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closes the check-in window.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        true
    }

    /// Current operator status board notice, if posted.
    #[must_use]
    pub const fn status_notice(&self) -> Option<&DeliveryId> {
        self.status_notice.as_ref()
    }

    /// Records the posted status board notice.
    pub fn set_status_notice(&mut self, id: Option<DeliveryId>) {
        self.status_notice = id;
    }

    /// Per-minute throttle for the status board: returns `true` and
    /// records the key when this minute has not refreshed yet.
    pub fn note_status_refresh(&mut self, minute_key: &str) -> bool {
        if self.status_refreshed_minute.as_deref() == Some(minute_key) {
            return false;
        }
        self.status_refreshed_minute = Some(minute_key.to_string());
        true
    }

    /// Renders the operator status snapshot as text.
    #[must_use]
    pub fn status_text(&self) -> String {
        fn list(set: &BTreeSet<ParticipantId>) -> String {
            if set.is_empty() {
                "none".to_string()
            } else {
                set.iter()
                    .map(ParticipantId::as_str)
                    .collect::<Vec<_>>()
                    .join(" / ")
            }
        }
        format!(
            "Check-in status (round 1)\n\n\
             Checked in:\n{}\n\n\
             Forfeited round 1:\n{}\n\n\
             Declined:\n{}\n\n\
             No response:\n{}",
            list(&self.checked_in),
            list(&self.forfeited),
            list(&self.declined),
            list(&self.unoperated()),
        )
    }

    /// Day-rollover reset: clears marks, the closed flag, and the
    /// status board. The roster and the per-date phase guards stay
    /// (the guards compare against today's date, so yesterday's
    /// entries are inert).
    pub fn reset_for_new_day(&mut self) {
        self.checked_in.clear();
        self.declined.clear();
        self.forfeited.clear();
        self.closed = false;
        self.status_notice = None;
        self.status_refreshed_minute = None;
    }

    /// Operator full reset: everything including the phase guards, so
    /// the phases may fire again today. The roster stays.
    pub fn reset_all(&mut self) {
        self.reset_for_new_day();
        self.phase_sent_dates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn tracker_with(roster: &[&str]) -> CheckinTracker {
        let mut tracker = CheckinTracker::new();
        tracker.set_roster(roster.iter().map(|s| pid(s)).collect());
        tracker
    }

    #[test]
    fn test_mark_moves_between_disjoint_buckets() {
        let mut tracker = tracker_with(&["001", "002"]);
        assert!(tracker.mark(&pid("001"), CheckinMark::CheckedIn).unwrap());
        assert!(tracker.mark(&pid("001"), CheckinMark::Declined).unwrap());
        assert!(!tracker.checked_in().contains(&pid("001")));
        assert!(tracker.declined().contains(&pid("001")));
        // Re-marking the same bucket is a no-op.
        assert!(!tracker.mark(&pid("001"), CheckinMark::Declined).unwrap());
    }

    #[test]
    fn test_mark_rejects_unknown_participant() {
        let mut tracker = tracker_with(&["001"]);
        let err = tracker.mark(&pid("009"), CheckinMark::CheckedIn).unwrap_err();
        assert_eq!(err, CheckinError::NotOnRoster { id: pid("009") });
    }

    #[test]
    fn test_unoperated_is_roster_minus_marked() {
        let mut tracker = tracker_with(&["001", "002", "003"]);
        tracker.mark(&pid("001"), CheckinMark::CheckedIn).unwrap();
        tracker.mark(&pid("002"), CheckinMark::Forfeited).unwrap();
        let unop = tracker.unoperated();
        assert_eq!(unop.len(), 1);
        assert!(unop.contains(&pid("003")));
    }

    #[test]
    fn test_due_phases_follow_offsets() {
        let tracker = tracker_with(&["001"]);
        let start = t("22:00");
        let today = date("2026-08-07");
        assert!(tracker.due_phases(t("21:29"), start, today).is_empty());
        assert_eq!(
            tracker.due_phases(t("21:30"), start, today),
            vec![CheckinPhase::Open]
        );
        assert_eq!(
            tracker.due_phases(t("21:55"), start, today),
            vec![
                CheckinPhase::Open,
                CheckinPhase::Reminder,
                CheckinPhase::StatusSnapshot
            ]
        );
        assert_eq!(tracker.due_phases(t("21:58"), start, today).len(), 4);
    }

    #[test]
    fn test_sent_guard_is_per_day() {
        let mut tracker = tracker_with(&["001"]);
        let start = t("22:00");
        let yesterday = date("2026-08-06");
        let today = date("2026-08-07");
        tracker.record_sent(CheckinPhase::Open, yesterday);
        // Yesterday's guard does not block today.
        assert!(tracker
            .due_phases(t("21:30"), start, today)
            .contains(&CheckinPhase::Open));
        tracker.record_sent(CheckinPhase::Open, today);
        assert!(!tracker
            .due_phases(t("21:30"), start, today)
            .contains(&CheckinPhase::Open));
    }

    #[test]
    fn test_clear_sent_rearms_phase() {
        let mut tracker = tracker_with(&["001"]);
        let today = date("2026-08-07");
        tracker.record_sent(CheckinPhase::Reminder, today);
        assert!(tracker.sent_on(CheckinPhase::Reminder, today));
        tracker.clear_sent(CheckinPhase::Reminder);
        assert!(!tracker.sent_on(CheckinPhase::Reminder, today));
    }

    #[test]
    fn test_reminder_targets_only_unoperated() {
        let mut tracker = tracker_with(&["001", "002", "003"]);
        tracker.mark(&pid("002"), CheckinMark::CheckedIn).unwrap();
        assert_eq!(tracker.phase_targets(CheckinPhase::Open).len(), 3);
        let reminder = tracker.phase_targets(CheckinPhase::Reminder);
        assert_eq!(reminder, vec![pid("001"), pid("003")]);
        assert!(tracker.phase_targets(CheckinPhase::FinalBroadcast).is_empty());
    }

    #[test]
    fn test_status_refresh_throttles_per_minute() {
        let mut tracker = tracker_with(&["001"]);
        assert!(tracker.note_status_refresh("2026-08-07 21:56"));
        assert!(!tracker.note_status_refresh("2026-08-07 21:56"));
        assert!(tracker.note_status_refresh("2026-08-07 21:57"));
    }

    #[test]
    fn test_day_reset_clears_marks_but_keeps_roster() {
        let mut tracker = tracker_with(&["001", "002"]);
        tracker.mark(&pid("001"), CheckinMark::CheckedIn).unwrap();
        tracker.close();
        tracker.reset_for_new_day();
        assert!(tracker.checked_in().is_empty());
        assert!(!tracker.is_closed());
        assert_eq!(tracker.roster().len(), 2);
    }

    #[test]
    fn test_phase_numbers_round_trip() {
        for phase in CheckinPhase::ALL {
            assert_eq!(CheckinPhase::from_number(phase.number()), Some(phase));
        }
        assert_eq!(CheckinPhase::from_number(0), None);
        assert_eq!(CheckinPhase::from_number(5), None);
    }
}
