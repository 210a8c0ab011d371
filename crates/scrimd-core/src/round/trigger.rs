//! Distribution trigger: per-tick decision logic.
//!
//! Pure function over the round state and the current time. The
//! automation loop acts on the decision; nothing here performs I/O or
//! mutates state.

use super::state::{RoundPhase, RoundState};
use crate::time::TimeOfDay;

/// Why the trigger decided to do nothing this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithholdReason {
    /// Operator emergency stop is asserted.
    EmergencyStop,
    /// Automatic mode is off; only manual distribution is allowed.
    AutoDisabled,
    /// Nothing is due.
    NothingDue,
}

/// The trigger's verdict for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionDecision {
    /// Do nothing.
    Withhold(WithholdReason),
    /// A send is due but falls inside the blackout window; park it
    /// until the window ends. `announce` is true the first time this
    /// deferral is seen.
    Defer {
        /// Release time (the blackout's end).
        until: TimeOfDay,
        /// Whether the deferral notice still needs to go out.
        announce: bool,
    },
    /// A parked deferred send has come due; distribute for `round`.
    ReleasePending {
        /// Round number the parked send targets.
        round: u32,
    },
    /// Round 1's scheduled start has arrived; distribute now.
    SendInitial,
}

/// Inputs the trigger needs beyond the round state.
#[derive(Debug, Clone, Copy)]
pub struct TriggerContext {
    /// Current local time of day.
    pub now: TimeOfDay,
    /// Configured event start time (round 1 distribution anchor).
    pub start_time: TimeOfDay,
}

/// Evaluates the distribution trigger for one tick.
#[must_use]
pub fn evaluate(state: &RoundState, ctx: &TriggerContext) -> DistributionDecision {
    if state.emergency_stop() {
        return DistributionDecision::Withhold(WithholdReason::EmergencyStop);
    }
    if !state.auto_enabled() {
        return DistributionDecision::Withhold(WithholdReason::AutoDisabled);
    }

    let in_blackout = state
        .blackout()
        .is_some_and(|window| window.contains(ctx.now));

    let initial_due = state.round_number() == 1
        && !state.credential_notified_once()
        && ctx.now >= ctx.start_time
        && matches!(state.phase(), RoundPhase::Init | RoundPhase::Prep);

    if in_blackout {
        let parked = state.pending_send_at().is_some() || state.pending_round().is_some();
        if parked || initial_due {
            // A window always exists here: in_blackout proved it.
            let until = state.blackout().map_or(ctx.now, |window| window.to);
            return DistributionDecision::Defer {
                until,
                announce: !state.deferral_announced(),
            };
        }
        return DistributionDecision::Withhold(WithholdReason::NothingDue);
    }

    if let Some(at) = state.pending_send_at() {
        if ctx.now >= at {
            return DistributionDecision::ReleasePending {
                round: state.pending_round().unwrap_or_else(|| state.round_number()),
            };
        }
    }

    if initial_due {
        return DistributionDecision::SendInitial;
    }

    DistributionDecision::Withhold(WithholdReason::NothingDue)
}
