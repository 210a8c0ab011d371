//! Round state and transitions.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::error::RoundError;
use super::CONFIRM_GRACE_MINUTES;
use crate::key::KeyHistory;
use crate::notify::DeliveryId;
use crate::pause::{self, PauseWindow};
use crate::time::TimeOfDay;

/// Lifecycle phase of the current round.
///
/// Advanced only by the explicit transitions on [`RoundState`]; the
/// automation loop never writes the phase directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Nothing prepared yet (or just reset).
    #[default]
    Init,
    /// Round accepted, waiting to distribute the credential.
    Prep,
    /// Credential generated and delivered to the credential holder.
    CredentialSent,
    /// Holder signalled readiness; departure time is locked in.
    DepartureConfirmed,
    /// The round is being played.
    InRound,
    /// Round finished, waiting for result submission.
    AwaitingResult,
    /// Final round's result is in; the event is over.
    Ended,
}

impl RoundPhase {
    /// Whether a credential must be held in this phase.
    #[must_use]
    pub const fn carries_credential(self) -> bool {
        matches!(
            self,
            Self::CredentialSent | Self::DepartureConfirmed | Self::InRound
        )
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Init => "init",
            Self::Prep => "prep",
            Self::CredentialSent => "credential_sent",
            Self::DepartureConfirmed => "departure_confirmed",
            Self::InRound => "in_round",
            Self::AwaitingResult => "awaiting_result",
            Self::Ended => "ended",
        };
        f.write_str(label)
    }
}

/// Complete round progression state for one organizational unit.
///
/// # Invariants
///
/// - `confirmed_time`, once set, is never earlier than `planned_time`.
/// - `credential` is `Some` exactly when the phase carries one.
/// - `blackout.from <= blackout.to` (windows never wrap).
/// - `round_number >= 1`.
///
/// Unknown fields in a persisted snapshot are ignored on load so older
/// daemons' state files remain readable; missing fields take their
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundState {
    #[serde(default = "default_round_number")]
    round_number: u32,
    #[serde(default)]
    phase: RoundPhase,
    #[serde(default)]
    credential: Option<String>,
    #[serde(default)]
    planned_time: Option<TimeOfDay>,
    #[serde(default)]
    confirmed_time: Option<TimeOfDay>,

    /// Operator-entered rotation time, kept so the blackout window can
    /// be recomputed when the round number changes.
    #[serde(default)]
    switch_time: Option<TimeOfDay>,
    #[serde(default)]
    remaining_minutes: Option<u32>,
    #[serde(default)]
    blackout: Option<PauseWindow>,

    #[serde(default)]
    emergency_stop: bool,
    #[serde(default)]
    auto_enabled: bool,
    #[serde(default)]
    credential_notified_once: bool,

    #[serde(default)]
    pending_send_at: Option<TimeOfDay>,
    /// Round number a parked send targets; set when a result submission
    /// lands inside the blackout and the next round's distribution is
    /// deferred past it.
    #[serde(default)]
    pending_round: Option<u32>,
    #[serde(default)]
    deferral_announced: bool,

    #[serde(default)]
    used_credentials: KeyHistory,

    /// When the general notice should be deleted (one minute past
    /// departure). Full timestamp so a departure just before midnight
    /// cleans up on the right day.
    #[serde(default)]
    delete_after: Option<NaiveDateTime>,

    #[serde(default)]
    general_notice: Option<DeliveryId>,
    #[serde(default)]
    holder_notice: Option<DeliveryId>,

    #[serde(default)]
    last_reset_date: Option<NaiveDate>,
}

const fn default_round_number() -> u32 {
    1
}

impl Default for RoundState {
    fn default() -> Self {
        Self {
            round_number: 1,
            phase: RoundPhase::Init,
            credential: None,
            planned_time: None,
            confirmed_time: None,
            switch_time: None,
            remaining_minutes: None,
            blackout: None,
            emergency_stop: false,
            auto_enabled: false,
            credential_notified_once: false,
            pending_send_at: None,
            pending_round: None,
            deferral_announced: false,
            used_credentials: KeyHistory::new(),
            delete_after: None,
            general_notice: None,
            holder_notice: None,
            last_reset_date: None,
        }
    }
}

impl RoundState {
    /// Creates the initial state for a fresh unit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Current round number (1-based).
    #[must_use]
    pub const fn round_number(&self) -> u32 {
        self.round_number
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Current round credential, if one is live.
    #[must_use]
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    /// Earliest estimated distribution/departure time.
    #[must_use]
    pub const fn planned_time(&self) -> Option<TimeOfDay> {
        self.planned_time
    }

    /// Locked-in departure time.
    #[must_use]
    pub const fn confirmed_time(&self) -> Option<TimeOfDay> {
        self.confirmed_time
    }

    /// Current blackout window, if one is configured.
    #[must_use]
    pub const fn blackout(&self) -> Option<PauseWindow> {
        self.blackout
    }

    /// Operator-entered rotation time.
    #[must_use]
    pub const fn switch_time(&self) -> Option<TimeOfDay> {
        self.switch_time
    }

    /// Whether the operator has asserted the emergency stop.
    #[must_use]
    pub const fn emergency_stop(&self) -> bool {
        self.emergency_stop
    }

    /// Whether the automation loop may drive transitions.
    #[must_use]
    pub const fn auto_enabled(&self) -> bool {
        self.auto_enabled
    }

    /// Whether this round's credential has already been distributed.
    #[must_use]
    pub const fn credential_notified_once(&self) -> bool {
        self.credential_notified_once
    }

    /// Deferred distribution release time, if a send is parked behind
    /// a blackout.
    #[must_use]
    pub const fn pending_send_at(&self) -> Option<TimeOfDay> {
        self.pending_send_at
    }

    /// Round number a parked deferred send targets.
    #[must_use]
    pub const fn pending_round(&self) -> Option<u32> {
        self.pending_round
    }

    /// Whether the current deferral has been announced.
    #[must_use]
    pub const fn deferral_announced(&self) -> bool {
        self.deferral_announced
    }

    /// Credential de-duplication history.
    #[must_use]
    pub const fn used_credentials(&self) -> &KeyHistory {
        &self.used_credentials
    }

    /// Mutable credential history, for generation.
    pub fn used_credentials_mut(&mut self) -> &mut KeyHistory {
        &mut self.used_credentials
    }

    /// Scheduled cleanup instant for the general notice.
    #[must_use]
    pub const fn delete_after(&self) -> Option<NaiveDateTime> {
        self.delete_after
    }

    /// Delivery id of the last general credential notice.
    #[must_use]
    pub const fn general_notice(&self) -> Option<&DeliveryId> {
        self.general_notice.as_ref()
    }

    /// Delivery id of the last credential-holder notice.
    #[must_use]
    pub const fn holder_notice(&self) -> Option<&DeliveryId> {
        self.holder_notice.as_ref()
    }

    /// Date of the last day-rollover reset.
    #[must_use]
    pub const fn last_reset_date(&self) -> Option<NaiveDate> {
        self.last_reset_date
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Begins preparation for the current round.
    ///
    /// `Init` or `Ended` move to `Prep`; a repeated call in `Prep` is a
    /// no-op. Clears the credential and the confirmed time.
    ///
    /// # Errors
    ///
    /// Returns [`RoundError::InvalidTransition`] from any mid-round
    /// phase.
    pub fn begin_preparation(&mut self) -> Result<bool, RoundError> {
        match self.phase {
            RoundPhase::Prep => Ok(false),
            RoundPhase::Init | RoundPhase::Ended => {
                self.phase = RoundPhase::Prep;
                self.credential = None;
                self.confirmed_time = None;
                Ok(true)
            },
            from => Err(RoundError::InvalidTransition {
                from,
                operation: "begin preparation",
            }),
        }
    }

    /// Records a distributed credential: `Prep` moves to
    /// `CredentialSent` with the planned time and the send-once flag
    /// set.
    ///
    /// The flag is set here, inside the locked mutation, and must be
    /// persisted before the actual dispatch so a crash between the two
    /// cannot double-send. A repeated call for an already-notified
    /// round is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RoundError::InvalidTransition`] outside `Prep`.
    pub fn mark_credential_sent(
        &mut self,
        credential: String,
        planned: TimeOfDay,
    ) -> Result<bool, RoundError> {
        match self.phase {
            RoundPhase::CredentialSent if self.credential_notified_once => Ok(false),
            RoundPhase::Prep => {
                self.phase = RoundPhase::CredentialSent;
                self.credential = Some(credential);
                self.planned_time = Some(planned);
                self.confirmed_time = None;
                self.credential_notified_once = true;
                self.deferral_announced = false;
                Ok(true)
            },
            from => Err(RoundError::InvalidTransition {
                from,
                operation: "distribute credential",
            }),
        }
    }

    /// Reverts [`mark_credential_sent`](Self::mark_credential_sent)
    /// after a failed dispatch so the next tick can retry.
    pub fn rollback_credential_sent(&mut self) {
        if self.phase == RoundPhase::CredentialSent {
            self.phase = RoundPhase::Prep;
            self.credential = None;
            self.credential_notified_once = false;
        }
    }

    /// Locks in the departure time after the holder confirms
    /// readiness: `max(planned_time, now + confirm grace)`.
    ///
    /// A confirmation may delay the announced estimate but never
    /// pre-empt it. Repeated confirmation returns the already-locked
    /// time without mutating.
    ///
    /// # Errors
    ///
    /// Returns an error outside `CredentialSent`, or when no planned
    /// time was recorded.
    pub fn confirm_departure(&mut self, now: TimeOfDay) -> Result<TimeOfDay, RoundError> {
        match self.phase {
            RoundPhase::DepartureConfirmed => self.confirmed_time.ok_or(
                // Unreachable in practice: the transition below always
                // records a confirmed time.
                RoundError::MissingPlannedTime {
                    round_number: self.round_number,
                },
            ),
            RoundPhase::CredentialSent => {
                let planned =
                    self.planned_time
                        .ok_or(RoundError::MissingPlannedTime {
                            round_number: self.round_number,
                        })?;
                let earliest = now.wrapping_add_minutes(CONFIRM_GRACE_MINUTES);
                let confirmed = planned.max(earliest);
                self.confirmed_time = Some(confirmed);
                self.phase = RoundPhase::DepartureConfirmed;
                Ok(confirmed)
            },
            from => Err(RoundError::InvalidTransition {
                from,
                operation: "confirm departure",
            }),
        }
    }

    /// Marks the round as underway once the confirmed departure time
    /// has been reached. Returns `Ok(false)` while it is still early.
    ///
    /// # Errors
    ///
    /// Returns [`RoundError::InvalidTransition`] outside
    /// `DepartureConfirmed`.
    pub fn begin_round(&mut self, now: TimeOfDay) -> Result<bool, RoundError> {
        match self.phase {
            RoundPhase::InRound => Ok(false),
            RoundPhase::DepartureConfirmed => {
                let Some(confirmed) = self.confirmed_time else {
                    return Err(RoundError::MissingPlannedTime {
                        round_number: self.round_number,
                    });
                };
                if now < confirmed {
                    return Ok(false);
                }
                self.phase = RoundPhase::InRound;
                Ok(true)
            },
            from => Err(RoundError::InvalidTransition {
                from,
                operation: "begin round",
            }),
        }
    }

    /// Moves to `AwaitingResult` once submissions have been requested.
    /// Clears the live credential.
    ///
    /// # Errors
    ///
    /// Returns [`RoundError::InvalidTransition`] outside `InRound` or
    /// `DepartureConfirmed` (a result request straight after departure
    /// confirmation is allowed; short rounds end before the loop ticks
    /// into `InRound`).
    pub fn request_result(&mut self) -> Result<bool, RoundError> {
        match self.phase {
            RoundPhase::AwaitingResult => Ok(false),
            RoundPhase::InRound | RoundPhase::DepartureConfirmed => {
                self.phase = RoundPhase::AwaitingResult;
                self.credential = None;
                Ok(true)
            },
            from => Err(RoundError::InvalidTransition {
                from,
                operation: "request result",
            }),
        }
    }

    /// Advances past a completed round: `AwaitingResult` moves to
    /// `Prep` for the next round, or to `Ended` after the final round.
    ///
    /// Resets the credential, confirmed time, and send-once flag.
    ///
    /// # Errors
    ///
    /// Returns [`RoundError::InvalidTransition`] outside
    /// `AwaitingResult`.
    pub fn advance_round(&mut self, max_rounds: u32) -> Result<RoundPhase, RoundError> {
        match self.phase {
            RoundPhase::AwaitingResult => {
                self.credential = None;
                self.confirmed_time = None;
                self.credential_notified_once = false;
                self.deferral_announced = false;
                self.planned_time = None;
                if self.round_number >= max_rounds {
                    self.phase = RoundPhase::Ended;
                } else {
                    self.round_number += 1;
                    self.phase = RoundPhase::Prep;
                }
                Ok(self.phase)
            },
            from => Err(RoundError::InvalidTransition {
                from,
                operation: "advance round",
            }),
        }
    }

    /// Asserts the emergency stop. Automatic transitions are gated off
    /// until the operator explicitly resumes; manual operations still
    /// work (a human is taking responsibility). Also drops out of
    /// automatic mode, matching the operator panel semantics.
    pub fn set_emergency_stop(&mut self) -> bool {
        if self.emergency_stop {
            return false;
        }
        self.emergency_stop = true;
        self.auto_enabled = false;
        true
    }

    /// Clears the emergency stop. Does not re-enable automatic mode.
    pub fn clear_emergency_stop(&mut self) -> bool {
        if !self.emergency_stop {
            return false;
        }
        self.emergency_stop = false;
        true
    }

    /// Enables or disables the automation loop for this unit.
    pub fn set_auto_enabled(&mut self, enabled: bool) {
        self.auto_enabled = enabled;
    }

    // ------------------------------------------------------------------
    // Blackout bookkeeping
    // ------------------------------------------------------------------

    /// Applies an operator-entered "minutes remaining until rotation"
    /// and derives the blackout window for the current round.
    pub fn apply_remaining_minutes(&mut self, now: TimeOfDay, remaining: u32) {
        let switch = pause::switch_time(now, remaining);
        self.remaining_minutes = Some(remaining);
        self.switch_time = Some(switch);
        self.blackout = Some(pause::window_for(switch, self.round_number));
    }

    /// Recomputes the blackout window from the stored rotation time
    /// (used when the round number changes after the minutes were
    /// entered). Falls back to the stored remaining-minutes value.
    pub fn recompute_blackout(&mut self, now: TimeOfDay) {
        let switch = match (self.switch_time, self.remaining_minutes) {
            (Some(s), _) => s,
            (None, Some(rem)) => {
                let s = pause::switch_time(now, rem);
                self.switch_time = Some(s);
                s
            },
            (None, None) => return,
        };
        self.blackout = Some(pause::window_for(switch, self.round_number));
    }

    /// Selects the current round number directly (operator panel) and
    /// recomputes the blackout window for the new lead.
    ///
    /// # Errors
    ///
    /// Returns [`RoundError::RoundOutOfRange`] for round numbers
    /// outside `1..=max_rounds`.
    pub fn set_round_number(
        &mut self,
        round: u32,
        max_rounds: u32,
        now: TimeOfDay,
    ) -> Result<(), RoundError> {
        if round == 0 || round > max_rounds {
            return Err(RoundError::RoundOutOfRange {
                requested: round,
                max_rounds,
            });
        }
        self.round_number = round;
        self.recompute_blackout(now);
        Ok(())
    }

    /// Parks a deferred distribution behind the current blackout.
    /// Returns `true` the first time (the deferral still needs to be
    /// announced).
    pub fn defer_until(&mut self, at: TimeOfDay) -> bool {
        self.pending_send_at = Some(at);
        if self.deferral_announced {
            false
        } else {
            self.deferral_announced = true;
            true
        }
    }

    /// Records which round a parked deferred send targets.
    pub fn set_pending_round(&mut self, round: Option<u32>) {
        self.pending_round = round;
    }

    /// Sets the planned distribution time.
    pub fn set_planned_time(&mut self, planned: Option<TimeOfDay>) {
        self.planned_time = planned;
    }

    /// Drops a parked deferred send without touching the send-once
    /// flag (used when a manual distribution superseded the parked
    /// one).
    pub fn clear_pending_send(&mut self) {
        self.pending_send_at = None;
        self.pending_round = None;
        self.deferral_announced = false;
    }

    /// Consumes a released deferred send, switching to the parked
    /// round number. Returns the round the distribution targets.
    pub fn take_pending_send(&mut self) -> Option<u32> {
        self.pending_send_at.take()?;
        self.deferral_announced = false;
        let round = self.pending_round.take().unwrap_or(self.round_number);
        self.round_number = round;
        self.credential_notified_once = false;
        Some(round)
    }

    // ------------------------------------------------------------------
    // Delivery bookkeeping
    // ------------------------------------------------------------------

    /// Records the general credential notice for later cleanup.
    pub fn set_general_notice(&mut self, id: Option<DeliveryId>) {
        self.general_notice = id;
    }

    /// Records the credential-holder notice for later replacement.
    pub fn set_holder_notice(&mut self, id: Option<DeliveryId>) {
        self.holder_notice = id;
    }

    /// Schedules cleanup of the general notice.
    pub fn set_delete_after(&mut self, at: Option<NaiveDateTime>) {
        self.delete_after = at;
    }

    /// Takes both recorded notices for deletion, clearing them.
    pub fn take_notices(&mut self) -> (Option<DeliveryId>, Option<DeliveryId>) {
        (self.general_notice.take(), self.holder_notice.take())
    }

    /// Records the day-rollover reset date.
    pub fn set_last_reset_date(&mut self, date: NaiveDate) {
        self.last_reset_date = Some(date);
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    /// Full reset: back to round 1 / `Init`, with every round and
    /// automation field cleared, including any pending deferred send,
    /// atomically with the rest. Configuration (destinations, event
    /// metadata) lives outside this struct and is untouched; the
    /// credential history survives so reissued rounds stay unique.
    ///
    /// `initial_planned` seeds the round-1 planned time (the
    /// configured event start).
    pub fn full_reset(&mut self, initial_planned: Option<TimeOfDay>) {
        let used = std::mem::take(&mut self.used_credentials);
        *self = Self {
            planned_time: initial_planned,
            used_credentials: used,
            ..Self::default()
        };
    }

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------

    /// Checks the documented invariants; used by property tests.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.round_number == 0 {
            return Err("round_number must be >= 1".to_string());
        }
        if self.credential.is_some() != self.phase.carries_credential() {
            return Err(format!(
                "credential presence ({}) inconsistent with phase {}",
                self.credential.is_some(),
                self.phase
            ));
        }
        if let (Some(planned), Some(confirmed)) = (self.planned_time, self.confirmed_time) {
            if confirmed < planned {
                return Err(format!(
                    "confirmed_time {confirmed} earlier than planned_time {planned}"
                ));
            }
        }
        if let Some(window) = self.blackout {
            if window.from > window.to {
                return Err(format!(
                    "blackout window wraps: {} > {}",
                    window.from, window.to
                ));
            }
        }
        Ok(())
    }
}
