//! Distribution blackout windows.
//!
//! The event's environment rotates on a fixed external schedule (the
//! operator enters "minutes remaining" when the rotation timer is
//! visible). Credentials must not go out in the window immediately
//! before a rotation, so participants never receive a lobby that is
//! about to be torn down. Round 1 gets a longer lead because the field
//! is still assembling.

use serde::{Deserialize, Serialize};

use crate::time::TimeOfDay;

/// Lead minutes before the rotation for the first round.
pub const FIRST_ROUND_LEAD_MINUTES: u32 = 7;

/// Lead minutes before the rotation for every later round.
pub const LATER_ROUND_LEAD_MINUTES: u32 = 4;

/// A half-open `[from, to)` window during which distribution is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseWindow {
    /// Start of the blackout (inclusive).
    pub from: TimeOfDay,
    /// End of the blackout (exclusive); equals the rotation time.
    pub to: TimeOfDay,
}

impl PauseWindow {
    /// Whether `now` falls inside the window.
    #[must_use]
    pub fn contains(&self, now: TimeOfDay) -> bool {
        now.is_within(self.from, self.to)
    }
}

/// Lead minutes for a given round number.
#[must_use]
pub const fn lead_minutes(round_number: u32) -> u32 {
    if round_number == 1 {
        FIRST_ROUND_LEAD_MINUTES
    } else {
        LATER_ROUND_LEAD_MINUTES
    }
}

/// Derives the rotation time from "minutes remaining" entered now.
#[must_use]
pub fn switch_time(now: TimeOfDay, remaining_minutes: u32) -> TimeOfDay {
    now.wrapping_add_minutes(remaining_minutes)
}

/// Computes the blackout window for a rotation at `switch` and the
/// given round number.
///
/// Windows never wrap: a rotation in the first minutes after midnight
/// clamps the start to `00:00`, so `from <= to` always holds and the
/// half-open containment check stays well defined.
#[must_use]
pub fn window_for(switch: TimeOfDay, round_number: u32) -> PauseWindow {
    let lead = lead_minutes(round_number);
    let from = if u32::from(switch.minutes_from_midnight()) >= lead {
        switch.wrapping_sub_minutes(lead)
    } else {
        TimeOfDay::default()
    };
    PauseWindow { from, to: switch }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    #[test]
    fn test_lead_is_seven_only_for_round_one() {
        assert_eq!(lead_minutes(1), 7);
        assert_eq!(lead_minutes(2), 4);
        assert_eq!(lead_minutes(3), 4);
        assert_eq!(lead_minutes(10), 4);
    }

    #[test]
    fn test_window_anchors_to_switch_time() {
        let switch = switch_time(t("22:10"), 5);
        assert_eq!(switch, t("22:15"));

        let w = window_for(switch, 1);
        assert_eq!(w.from, t("22:08"));
        assert_eq!(w.to, t("22:15"));

        let w = window_for(switch, 2);
        assert_eq!(w.from, t("22:11"));
        assert_eq!(w.to, t("22:15"));
    }

    #[test]
    fn test_zero_remaining_yields_empty_window_boundary() {
        // Rotation "now": the window ends at now, so now itself is
        // already outside (half-open upper bound).
        let now = t("22:00");
        let w = window_for(switch_time(now, 0), 2);
        assert!(!w.contains(now));
        assert!(w.contains(t("21:58")));
    }

    #[test]
    fn test_window_clamps_at_midnight() {
        let w = window_for(t("00:02"), 2);
        assert_eq!(w.from, t("00:00"));
        assert_eq!(w.to, t("00:02"));
        assert!(w.from <= w.to);
    }

    #[test]
    fn test_contains_is_half_open() {
        let w = window_for(t("22:15"), 2);
        assert!(!w.contains(t("22:10")));
        assert!(w.contains(t("22:11")));
        assert!(w.contains(t("22:14")));
        assert!(!w.contains(t("22:15")));
    }
}
