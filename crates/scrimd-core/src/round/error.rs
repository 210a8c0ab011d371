//! Round state machine error types.

use thiserror::Error;

use super::state::RoundPhase;

/// Errors from round state transitions.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RoundError {
    /// The operation is not valid from the current phase.
    #[error("cannot {operation} from phase {from}")]
    InvalidTransition {
        /// The current phase.
        from: RoundPhase,
        /// The attempted operation.
        operation: &'static str,
    },

    /// A departure confirmation arrived before any credential was
    /// distributed for the round.
    #[error("no planned distribution time recorded for round {round_number}")]
    MissingPlannedTime {
        /// The current round number.
        round_number: u32,
    },

    /// Operator supplied a round number outside the event bounds.
    #[error("round {requested} is out of range (1..={max_rounds})")]
    RoundOutOfRange {
        /// The rejected round number.
        requested: u32,
        /// The configured number of rounds.
        max_rounds: u32,
    },
}
