//! Round progression state machine and distribution trigger.
//!
//! This module owns the single source of truth for what the
//! orchestrator is doing in a round: the phase, the credential, the
//! planned and confirmed departure times, the blackout window, and the
//! operator override flags. All mutation goes through the explicit,
//! idempotent transition methods on [`RoundState`]; the automation
//! loop consults [`trigger::evaluate`] each tick to decide whether a
//! credential should go out now, be deferred past a blackout, or be
//! withheld.
//!
//! Two grace constants are deliberately distinct: the planned-time
//! heuristic used when a distribution is initiated mid-event, and the
//! minimum setup time applied when the credential holder confirms.
//! The upstream system used both values in different places without
//! recording why; they are kept separate until an owner unifies them.

mod error;
mod state;
mod trigger;

#[cfg(test)]
mod tests;

pub use error::RoundError;
pub use state::{RoundPhase, RoundState};
pub use trigger::{evaluate, DistributionDecision, TriggerContext, WithholdReason};

/// Minutes added to "now" when a planned distribution time has to be
/// invented mid-event (manual distribution, post-result trigger).
pub const GRACE_OFFSET_MINUTES: u32 = 3;

/// Minimum minutes between a readiness confirmation and departure.
pub const CONFIRM_GRACE_MINUTES: u32 = 2;

/// Minutes after departure before the general notice is cleaned up.
pub const CLEANUP_DELAY_MINUTES: u32 = 1;
