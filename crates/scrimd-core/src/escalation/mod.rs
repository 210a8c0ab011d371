//! Result-submission escalation.
//!
//! When a participant reports a missed result submission, operators
//! fall back to a ranked list of up to three alternate contacts. Each
//! report consumes one rank: a configured rank is contacted (and the
//! stage advances only once the dispatch is confirmed), a blank rank
//! is noted as a gap and skipped on the next report, and an exhausted
//! ladder reports that no further targets remain.

use serde::{Deserialize, Serialize};

use crate::notify::ParticipantId;

/// Number of ranked fallback slots.
pub const RANK_SLOTS: usize = 3;

/// What a "result missing" report should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationAction {
    /// Contact this rank's target. The stage must be advanced via
    /// [`EscalationLadder::confirm_notified`] only after the dispatch
    /// actually succeeds.
    Contact {
        /// Rank being contacted (1-3).
        rank: u8,
        /// The target entry number.
        target: ParticipantId,
    },
    /// The rank was left blank by the operator; nobody is contacted
    /// and the stage does not advance. The gap is remembered, so the
    /// next report moves on to the following rank.
    Gap {
        /// Rank that produced no action (1-3).
        rank: u8,
    },
    /// Every rank has been consumed.
    Exhausted,
}

/// Per-round ranked contact ladder.
///
/// `stage` counts confirmed notifications and never decreases; noted
/// gaps are tracked separately so a blank rank neither advances the
/// stage nor blocks later ranks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscalationLadder {
    round_number: u32,
    targets: [Option<ParticipantId>; RANK_SLOTS],
    #[serde(default)]
    stage: u8,
    #[serde(default)]
    noted_gaps: u8,
}

impl EscalationLadder {
    /// Arms a ladder for a round with operator-supplied targets (gaps
    /// allowed).
    #[must_use]
    pub fn new(round_number: u32, targets: [Option<ParticipantId>; RANK_SLOTS]) -> Self {
        Self {
            round_number,
            targets,
            stage: 0,
            noted_gaps: 0,
        }
    }

    /// Round this ladder belongs to.
    #[must_use]
    pub const fn round_number(&self) -> u32 {
        self.round_number
    }

    /// Confirmed-notify count (0-3).
    #[must_use]
    pub const fn stage(&self) -> u8 {
        self.stage
    }

    /// Re-arms the ladder at stage 0 when a report arrives for a
    /// different round than the one it was configured for. Returns
    /// `true` if the ladder was stale.
    pub fn ensure_round(&mut self, round_number: u32) -> bool {
        if self.round_number == round_number {
            return false;
        }
        self.round_number = round_number;
        self.stage = 0;
        self.noted_gaps = 0;
        true
    }

    fn cursor(&self) -> usize {
        usize::from(self.stage) + usize::from(self.noted_gaps)
    }

    /// Resolves one "result missing" report.
    ///
    /// Blank ranks are noted here (one per report); the stage itself
    /// only moves in [`confirm_notified`](Self::confirm_notified),
    /// after the caller has actually delivered the contact, so failed
    /// dispatches retry the same rank.
    pub fn resolve_report(&mut self) -> EscalationAction {
        let cursor = self.cursor();
        if cursor >= RANK_SLOTS {
            return EscalationAction::Exhausted;
        }
        let rank = (cursor + 1) as u8;
        match &self.targets[cursor] {
            Some(target) => EscalationAction::Contact {
                rank,
                target: target.clone(),
            },
            None => {
                self.noted_gaps += 1;
                EscalationAction::Gap { rank }
            },
        }
    }

    /// Advances the stage after a caller-confirmed successful notify.
    pub fn confirm_notified(&mut self) {
        if self.cursor() < RANK_SLOTS {
            self.stage += 1;
        }
    }
}
