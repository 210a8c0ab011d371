//! Per-unit orchestration.
//!
//! The [`Orchestrator`] owns every operation on one unit: the
//! operator control surface (begin/distribute/confirm/reset/...) and
//! the automation tick steps the loop drives. All state changes go
//! through the unit handle's locked mutation; external dispatches
//! happen with the lock released and under a bounded timeout, and
//! anything gated on a persisted idempotency flag waits for the
//! snapshot write to succeed first.

use std::sync::Arc;
use std::time::Duration;

use scrimd_core::checkin::{CheckinError, CheckinMark, CheckinPhase};
use scrimd_core::config::EventConfig;
use scrimd_core::escalation::{EscalationAction, EscalationLadder, RANK_SLOTS};
use scrimd_core::key::{KeyError, KeyGenerator};
use scrimd_core::notify::{
    distributor_for, CredentialDistributor, CredentialNotice, DeliveryId, Destination,
    MessagingSink, NoticeParams, NoticePayload, NoticeRenderer, NotifyError, ParticipantId,
    RosterSource,
};
use scrimd_core::pause::PauseWindow;
use scrimd_core::round::{
    evaluate, DistributionDecision, RoundError, RoundPhase, TriggerContext,
    CLEANUP_DELAY_MINUTES, GRACE_OFFSET_MINUTES,
};
use scrimd_core::store::StoreError;
use scrimd_core::time::{Clock, TimeOfDay};
use scrimd_core::unit::UnitId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::state::UnitHandle;

/// Failures from operator operations and tick steps.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OpError {
    /// A state transition was not legal.
    #[error(transparent)]
    Round(#[from] RoundError),

    /// Check-in bookkeeping rejected the input.
    #[error(transparent)]
    Checkin(#[from] CheckinError),

    /// Credential generation failed (configuration problem).
    #[error(transparent)]
    Key(#[from] KeyError),

    /// An external dispatch failed; retried by the caller or the next
    /// tick.
    #[error(transparent)]
    Notify(#[from] NotifyError),

    /// The snapshot write that must precede a dispatch failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The emergency stop gates automatic distribution.
    #[error("emergency stop is asserted; automatic action withheld")]
    Stopped,

    /// The request itself was invalid; state was not mutated.
    #[error("{0}")]
    Invalid(String),
}

/// Operator-facing snapshot of one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    /// The unit being reported.
    pub unit: UnitId,
    /// Current round (1-based).
    pub round_number: u32,
    /// Current phase.
    pub phase: RoundPhase,
    /// Live credential, if any.
    pub credential: Option<String>,
    /// Earliest estimated distribution/departure time.
    pub planned_time: Option<TimeOfDay>,
    /// Locked-in departure time.
    pub confirmed_time: Option<TimeOfDay>,
    /// Current blackout window.
    pub blackout: Option<PauseWindow>,
    /// Parked deferred send release time.
    pub pending_send_at: Option<TimeOfDay>,
    /// Operator override flags.
    pub emergency_stop: bool,
    /// Whether the automation loop drives this unit.
    pub auto_enabled: bool,
    /// Whether check-in has closed for the day.
    pub checkin_closed: bool,
    /// Roster size.
    pub roster_size: usize,
    /// Checked-in count.
    pub checked_in: usize,
    /// Declined count.
    pub declined: usize,
    /// Forfeited count.
    pub forfeited: usize,
    /// Not-yet-operated count.
    pub unoperated: usize,
    /// Escalation ladder stage, when a ladder is armed.
    pub escalation_stage: Option<u8>,
}

enum StagedDistribution {
    AlreadySent,
    Send {
        notice: CredentialNotice,
        old_holder: Option<DeliveryId>,
        old_general: Option<DeliveryId>,
    },
}

enum NextRound {
    Ended,
    Deferred { until: TimeOfDay, announce: bool },
    Distribute,
}

/// All operations on one unit.
pub struct Orchestrator {
    handle: Arc<UnitHandle>,
    config: Arc<EventConfig>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MessagingSink>,
    roster: Arc<dyn RosterSource>,
    renderer: Arc<dyn NoticeRenderer>,
    distributor: Arc<dyn CredentialDistributor>,
    keygen: KeyGenerator,
    call_timeout: Duration,
}

impl Orchestrator {
    /// Wires an orchestrator for one unit.
    #[must_use]
    pub fn new(
        handle: Arc<UnitHandle>,
        config: Arc<EventConfig>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MessagingSink>,
        roster: Arc<dyn RosterSource>,
        renderer: Arc<dyn NoticeRenderer>,
    ) -> Self {
        let distributor: Arc<dyn CredentialDistributor> =
            Arc::from(distributor_for(config.distributor));
        let keygen = KeyGenerator::new(config.credential_prefix.clone());
        let call_timeout = Duration::from_secs(config.daemon.call_timeout_secs);
        Self {
            handle,
            config,
            clock,
            sink,
            roster,
            renderer,
            distributor,
            keygen,
            call_timeout,
        }
    }

    /// The unit this orchestrator drives.
    #[must_use]
    pub fn unit(&self) -> &UnitId {
        self.handle.id()
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, NotifyError>> + Send,
    ) -> Result<T, NotifyError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout {
                seconds: self.call_timeout.as_secs(),
            }),
        }
    }

    async fn notify_ops(&self, text: String) {
        let result = self
            .bounded(
                self.sink
                    .send(self.unit(), Destination::Ops, NoticePayload::text(text)),
            )
            .await;
        if let Err(e) = result {
            debug!(unit = %self.unit(), error = %e, "ops notice not delivered");
        }
    }

    /// Alerts operators that an automation step has been failing for
    /// a whole streak of consecutive ticks.
    pub async fn alert_step_failure(&self, step: &str, streak: u32, error: &OpError) {
        self.notify_ops(format!(
            "Automation step '{step}' has failed {streak} ticks in a row: {error}"
        ))
        .await;
    }

    // ------------------------------------------------------------------
    // Operator control surface
    // ------------------------------------------------------------------

    /// Current status snapshot.
    pub async fn status(&self) -> StatusView {
        let unit = self.unit().clone();
        self.handle
            .read(|state| StatusView {
                unit,
                round_number: state.round.round_number(),
                phase: state.round.phase(),
                credential: state.round.credential().map(str::to_string),
                planned_time: state.round.planned_time(),
                confirmed_time: state.round.confirmed_time(),
                blackout: state.round.blackout(),
                pending_send_at: state.round.pending_send_at(),
                emergency_stop: state.round.emergency_stop(),
                auto_enabled: state.round.auto_enabled(),
                checkin_closed: state.checkin.is_closed(),
                roster_size: state.checkin.roster().len(),
                checked_in: state.checkin.checked_in().len(),
                declined: state.checkin.declined().len(),
                forfeited: state.checkin.forfeited().len(),
                unoperated: state.checkin.unoperated().len(),
                escalation_stage: state.escalation.as_ref().map(EscalationLadder::stage),
            })
            .await
    }

    /// Begins preparation for the current round.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Round`] from a mid-round phase.
    pub async fn begin_preparation(&self) -> Result<String, OpError> {
        let changed = self
            .handle
            .mutate(|state| state.round.begin_preparation())
            .await?;
        Ok(if changed {
            "preparation started".to_string()
        } else {
            "already in preparation".to_string()
        })
    }

    /// Distributes the round credential on operator request. Bypasses
    /// the emergency-stop gate (a human is taking responsibility).
    ///
    /// # Errors
    ///
    /// Returns the staging or dispatch failure; a failed dispatch is
    /// rolled back so a retry can distribute again.
    pub async fn distribute_credential_manual(&self) -> Result<String, OpError> {
        self.distribute(true, "manual").await
    }

    async fn distribute(&self, manual: bool, reason: &str) -> Result<String, OpError> {
        let now = self.clock.time_of_day();
        let start_time = self.config.start_time;
        let keygen = self.keygen.clone();

        let staged = self
            .handle
            .mutate(|state| -> Result<StagedDistribution, OpError> {
                if state.round.emergency_stop() && !manual {
                    return Err(OpError::Stopped);
                }
                match state.round.phase() {
                    RoundPhase::CredentialSent if state.round.credential_notified_once() => {
                        return Ok(StagedDistribution::AlreadySent);
                    },
                    RoundPhase::Init | RoundPhase::Ended => {
                        state.round.begin_preparation()?;
                    },
                    RoundPhase::Prep => {},
                    from => {
                        return Err(OpError::Invalid(format!(
                            "cannot distribute a credential from phase {from}"
                        )));
                    },
                }

                let round_number = state.round.round_number();
                let planned = if round_number == 1 && !manual {
                    // Round 1 anchors to the event start, pushed past
                    // the blackout if the start falls inside it.
                    match state.round.blackout() {
                        Some(window) if window.contains(start_time) => window.to,
                        _ => start_time,
                    }
                } else {
                    now.wrapping_add_minutes(GRACE_OFFSET_MINUTES)
                };

                let credential = keygen.generate(state.round.used_credentials_mut())?;
                state.round.mark_credential_sent(credential.clone(), planned)?;
                let (old_holder, old_general) = state.round.take_notices();
                Ok(StagedDistribution::Send {
                    notice: CredentialNotice {
                        round_number,
                        credential,
                        planned_time: planned,
                    },
                    old_holder,
                    old_general,
                })
            })
            .await?;

        let StagedDistribution::Send {
            notice,
            old_holder,
            old_general,
        } = staged
        else {
            return Ok("credential already distributed for this round".to_string());
        };

        // The send-once flag must be durable before anything leaves
        // the process.
        self.handle.ensure_persisted().await?;

        // Clear the previous round's notices so the holder channel
        // only ever shows one live credential.
        for old in [old_holder, old_general].into_iter().flatten() {
            if let Err(e) = self.bounded(self.sink.delete(self.unit(), &old)).await {
                debug!(unit = %self.unit(), error = %e, "stale notice not deleted");
            }
        }

        let dispatched = self
            .bounded(
                self.distributor
                    .distribute(self.sink.as_ref(), self.unit(), &notice),
            )
            .await;

        match dispatched {
            Ok(receipt) => {
                self.handle
                    .mutate(|state| {
                        state.round.set_holder_notice(receipt.holder_notice);
                        state.round.set_general_notice(receipt.general_notice);
                    })
                    .await;
                info!(
                    unit = %self.unit(),
                    round = notice.round_number,
                    planned = %notice.planned_time,
                    reason,
                    "credential distributed"
                );
                Ok(format!(
                    "credential distributed for round {} (planned {})",
                    notice.round_number, notice.planned_time
                ))
            },
            Err(e) => {
                self.handle
                    .mutate(|state| state.round.rollback_credential_sent())
                    .await;
                Err(e.into())
            },
        }
    }

    /// Locks in the departure time after the credential holder
    /// confirms readiness, and posts the general departure notice.
    ///
    /// # Errors
    ///
    /// Returns the transition or dispatch failure. A re-invocation
    /// after a failed dispatch retries the notice with the same
    /// locked time.
    pub async fn confirm_departure(&self) -> Result<String, OpError> {
        let now = self.clock.time_of_day();
        let (confirmed, was_confirmed, round_number, credential) = self
            .handle
            .mutate(
                |state| -> Result<(TimeOfDay, bool, u32, Option<String>), OpError> {
                    let was_confirmed = state.round.phase() == RoundPhase::DepartureConfirmed
                        && state.round.general_notice().is_some();
                    let confirmed = state.round.confirm_departure(now)?;
                    Ok((
                        confirmed,
                        was_confirmed,
                        state.round.round_number(),
                        state.round.credential().map(str::to_string),
                    ))
                },
            )
            .await?;

        if was_confirmed {
            return Ok(format!("departure already confirmed for {confirmed}"));
        }
        self.handle.ensure_persisted().await?;

        // Best-effort render; the plain-text notice is the fallback.
        let params = NoticeParams {
            round_number,
            credential: credential.clone(),
            time_label: "departure".to_string(),
            time: Some(confirmed),
        };
        let image = match self.bounded(self.renderer.render_notice(&params)).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(unit = %self.unit(), error = %e, "render failed; sending text notice");
                None
            },
        };

        let mut payload = NoticePayload::text(match &credential {
            Some(c) => format!("Round {round_number} credential: {c}\nDeparture: {confirmed}"),
            None => format!("Round {round_number} departure: {confirmed}"),
        });
        if let Some(image) = image {
            payload = payload.with_image(image);
        }
        let general = self
            .bounded(self.sink.send(self.unit(), Destination::General, payload))
            .await?;

        // The general notice is cleaned up shortly after departure.
        let cleanup_time = confirmed.wrapping_add_minutes(CLEANUP_DELAY_MINUTES);
        let date = if cleanup_time < confirmed {
            self.clock.today().succ_opt()
        } else {
            Some(self.clock.today())
        };
        let delete_after = date.and_then(|d| cleanup_time.on_date(d));

        self.handle
            .mutate(|state| {
                state.round.set_general_notice(Some(general));
                state.round.set_delete_after(delete_after);
            })
            .await;
        info!(unit = %self.unit(), round = round_number, %confirmed, "departure confirmed");
        Ok(format!("departure confirmed for {confirmed}"))
    }

    /// Marks the round as underway (operator path; the loop also
    /// drives this once the confirmed time is reached).
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Round`] outside `DepartureConfirmed`.
    pub async fn begin_round(&self) -> Result<String, OpError> {
        let now = self.clock.time_of_day();
        let started = self
            .handle
            .mutate(|state| state.round.begin_round(now))
            .await?;
        Ok(if started {
            "round started".to_string()
        } else {
            "departure time not reached yet".to_string()
        })
    }

    /// Asks for result submissions and arms the escalation ladder
    /// with up to three ranked fallback contacts (gaps allowed).
    ///
    /// # Errors
    ///
    /// Returns the transition or dispatch failure.
    pub async fn request_result(
        &self,
        targets: Vec<Option<ParticipantId>>,
    ) -> Result<String, OpError> {
        if targets.len() > RANK_SLOTS {
            return Err(OpError::Invalid(format!(
                "at most {RANK_SLOTS} escalation targets are supported"
            )));
        }
        let mut ranked: [Option<ParticipantId>; RANK_SLOTS] = Default::default();
        for (slot, target) in ranked.iter_mut().zip(targets) {
            *slot = target;
        }

        let round_number = self
            .handle
            .mutate(|state| -> Result<u32, OpError> {
                state.round.request_result()?;
                let round_number = state.round.round_number();
                state.escalation = Some(EscalationLadder::new(round_number, ranked));
                Ok(round_number)
            })
            .await?;

        self.bounded(self.sink.send(
            self.unit(),
            Destination::General,
            NoticePayload::text(format!(
                "Round {round_number} finished. Submit your result/replay data now."
            )),
        ))
        .await?;
        Ok(format!("result submissions requested for round {round_number}"))
    }

    /// Records a confirmed result submission: advances the round and
    /// distributes the next credential, deferring it past a blackout.
    ///
    /// # Errors
    ///
    /// Returns the transition or distribution failure.
    pub async fn submit_result(&self) -> Result<String, OpError> {
        let now = self.clock.time_of_day();
        let max_rounds = self.config.max_rounds;

        let next = self
            .handle
            .mutate(|state| -> Result<NextRound, OpError> {
                let phase = state.round.advance_round(max_rounds)?;
                if phase == RoundPhase::Ended {
                    return Ok(NextRound::Ended);
                }
                let round = state.round.round_number();
                // The lead changes with the round number.
                state.round.recompute_blackout(now);
                let planned = now.wrapping_add_minutes(GRACE_OFFSET_MINUTES);
                if let Some(window) = state.round.blackout() {
                    // Defer when the distribution itself or its
                    // planned departure would land inside the window.
                    if window.contains(now) || window.contains(planned) {
                        let announce = state.round.defer_until(window.to);
                        state.round.set_pending_round(Some(round));
                        return Ok(NextRound::Deferred {
                            until: window.to,
                            announce,
                        });
                    }
                }
                Ok(NextRound::Distribute)
            })
            .await?;

        match next {
            NextRound::Ended => Ok("final result recorded; the event is over".to_string()),
            NextRound::Deferred { until, announce } => {
                self.handle.ensure_persisted().await?;
                if announce {
                    self.announce_deferral(until).await;
                }
                Ok(format!(
                    "result recorded; next distribution deferred to {until}"
                ))
            },
            NextRound::Distribute => self.distribute(false, "result_submitted").await,
        }
    }

    async fn announce_deferral(&self, until: TimeOfDay) {
        let result = self
            .bounded(self.sink.send(
                self.unit(),
                Destination::General,
                NoticePayload::text(format!(
                    "Credential distribution overlaps the map rotation; \
                     adjusted to {until}."
                )),
            ))
            .await;
        if let Err(e) = result {
            warn!(unit = %self.unit(), error = %e, "deferral notice not delivered");
        }
    }

    /// Asserts the emergency stop.
    pub async fn emergency_stop(&self) -> Result<String, OpError> {
        let changed = self
            .handle
            .mutate(|state| state.round.set_emergency_stop())
            .await;
        Ok(if changed {
            "emergency stop asserted; automatic transitions are suspended".to_string()
        } else {
            "emergency stop was already asserted".to_string()
        })
    }

    /// Clears the emergency stop. Automatic mode stays off until
    /// re-enabled explicitly.
    pub async fn emergency_resume(&self) -> Result<String, OpError> {
        let changed = self
            .handle
            .mutate(|state| state.round.clear_emergency_stop())
            .await;
        Ok(if changed {
            "emergency stop cleared (automatic mode stays off)".to_string()
        } else {
            "emergency stop was not asserted".to_string()
        })
    }

    /// Enables or disables the automation loop for this unit.
    pub async fn set_auto(&self, enabled: bool) -> Result<String, OpError> {
        self.handle
            .mutate(|state| state.round.set_auto_enabled(enabled))
            .await;
        Ok(format!(
            "automatic mode {}",
            if enabled { "enabled" } else { "disabled" }
        ))
    }

    /// Applies an operator-entered "minutes remaining until rotation"
    /// and derives the blackout window.
    pub async fn set_pause_remaining_minutes(&self, minutes: u32) -> Result<String, OpError> {
        if minutes > 24 * 60 {
            return Err(OpError::Invalid(format!(
                "remaining minutes {minutes} out of range (0..=1440)"
            )));
        }
        let now = self.clock.time_of_day();
        let window = self
            .handle
            .mutate(|state| {
                state.round.apply_remaining_minutes(now, minutes);
                state.round.blackout()
            })
            .await;
        match window {
            Some(w) => Ok(format!("distribution blackout set: {} - {}", w.from, w.to)),
            None => Ok("no blackout window derived".to_string()),
        }
    }

    /// Selects the current round number directly.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Round`] for out-of-range rounds.
    pub async fn set_round(&self, round: u32) -> Result<String, OpError> {
        let now = self.clock.time_of_day();
        let max_rounds = self.config.max_rounds;
        self.handle
            .mutate(|state| state.round.set_round_number(round, max_rounds, now))
            .await?;
        Ok(format!("round set to {round}"))
    }

    /// Full reset: round 1 / `Init`, all round and automation fields
    /// cleared (including any parked deferred send), check-in guards
    /// cleared, escalation disarmed. Destinations and event metadata
    /// live in configuration and are untouched.
    pub async fn full_reset(&self) -> Result<String, OpError> {
        let start_time = self.config.start_time;
        self.handle
            .mutate(|state| {
                state.round.full_reset(Some(start_time));
                state.checkin.reset_all();
                state.escalation = None;
            })
            .await;
        info!(unit = %self.unit(), "full reset");
        Ok("state reset to round 1".to_string())
    }

    /// Records a participant's check-in response.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Checkin`] for entries not on the roster.
    pub async fn checkin_mark(
        &self,
        id: ParticipantId,
        mark: CheckinMark,
    ) -> Result<String, OpError> {
        let changed = self
            .handle
            .mutate(|state| state.checkin.mark(&id, mark))
            .await?;
        Ok(if changed {
            format!("{id} marked")
        } else {
            format!("{id} already had that mark")
        })
    }

    /// Re-fires a check-in phase regardless of its send-once guard
    /// (operator recovery path after a delivery failure).
    ///
    /// # Errors
    ///
    /// Returns [`OpError::Invalid`] for an unknown phase number, or
    /// the dispatch failure.
    pub async fn force_checkin_phase(&self, phase_number: u8) -> Result<String, OpError> {
        let phase = CheckinPhase::from_number(phase_number).ok_or_else(|| {
            OpError::Invalid(format!("unknown check-in phase {phase_number} (1-4)"))
        })?;
        self.fire_checkin_phase(phase, true).await?;
        Ok(format!("check-in phase {phase} re-sent"))
    }

    /// Handles a "result missing" report for a round: contacts the
    /// next ranked escalation target, notes a blank rank, or reports
    /// exhaustion.
    ///
    /// # Errors
    ///
    /// Returns the dispatch failure; the stage is not advanced, so
    /// the next report retries the same rank.
    pub async fn report_result_missing(&self, round: u32) -> Result<String, OpError> {
        let action = self
            .handle
            .mutate(|state| {
                let ladder = state
                    .escalation
                    .get_or_insert_with(|| EscalationLadder::new(round, Default::default()));
                ladder.ensure_round(round);
                ladder.resolve_report()
            })
            .await;

        match action {
            EscalationAction::Contact { rank, target } => {
                self.bounded(self.sink.send(
                    self.unit(),
                    Destination::Participant {
                        id: target.clone(),
                    },
                    NoticePayload::text(format!(
                        "Operator notice: please help submit the round {round} \
                         result/replay data (escalation rank {rank})."
                    )),
                ))
                .await?;
                self.handle
                    .mutate(|state| {
                        if let Some(ladder) = &mut state.escalation {
                            ladder.confirm_notified();
                        }
                    })
                    .await;
                self.notify_ops(format!(
                    "Round {round} result missing: contacted rank {rank} ({target})."
                ))
                .await;
                Ok(format!("contacted escalation rank {rank} ({target})"))
            },
            EscalationAction::Gap { rank } => {
                self.notify_ops(format!(
                    "Round {round} result missing: rank {rank} is not configured."
                ))
                .await;
                Ok(format!("rank {rank} is blank; nobody contacted"))
            },
            EscalationAction::Exhausted => Ok("no further escalation targets".to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Automation tick steps
    // ------------------------------------------------------------------

    /// Tick step: check-in phases, status board, and the auto-close
    /// that arms automatic mode.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the loop logs it and keeps ticking.
    pub async fn tick_checkin(&self) -> Result<(), OpError> {
        if !self.bounded(self.roster.is_present_today(self.unit())).await? {
            return Ok(());
        }
        let roster = self
            .bounded(self.roster.list_participants(self.unit()))
            .await?;

        let now = self.clock.time_of_day();
        let today = self.clock.today();
        let start = self.config.start_time;

        let due = self
            .handle
            .mutate(|state| {
                state.checkin.set_roster(roster);
                state.checkin.due_phases(now, start, today)
            })
            .await;
        for phase in due {
            self.fire_checkin_phase(phase, false).await?;
        }

        self.refresh_status_board(false).await?;

        let close_at = start.wrapping_sub_minutes(self.config.checkin_close_minutes);
        if now >= close_at {
            let armed = self
                .handle
                .mutate(|state| {
                    if state.checkin.close() {
                        state.round.set_auto_enabled(true);
                        true
                    } else {
                        false
                    }
                })
                .await;
            if armed {
                info!(unit = %self.unit(), "check-in closed; automatic mode armed");
            }
        }
        Ok(())
    }

    async fn fire_checkin_phase(&self, phase: CheckinPhase, force: bool) -> Result<(), OpError> {
        let today = self.clock.today();
        let armed = self
            .handle
            .mutate(|state| {
                if !force && state.checkin.sent_on(phase, today) {
                    return false;
                }
                state.checkin.record_sent(phase, today);
                true
            })
            .await;
        if !armed {
            return Ok(());
        }
        // Guard durable before the dispatch, so a crash in between
        // errs on the side of not re-sending.
        self.handle.ensure_persisted().await?;

        if let Err(e) = self.dispatch_checkin_phase(phase).await {
            // Re-arm so the next tick retries.
            self.handle
                .mutate(|state| state.checkin.clear_sent(phase))
                .await;
            return Err(e.into());
        }
        info!(unit = %self.unit(), %phase, "check-in phase sent");
        Ok(())
    }

    async fn dispatch_checkin_phase(&self, phase: CheckinPhase) -> Result<(), NotifyError> {
        match phase {
            CheckinPhase::Open | CheckinPhase::Reminder => {
                let targets = self.handle.read(|state| state.checkin.phase_targets(phase)).await;
                let text = match phase {
                    CheckinPhase::Open => "Check in once you are ready.",
                    _ => "Assembly time. Check in now if you have not yet.",
                };
                for id in targets {
                    self.bounded(self.sink.send(
                        self.unit(),
                        Destination::Participant { id },
                        NoticePayload::text(text),
                    ))
                    .await?;
                }
                Ok(())
            },
            CheckinPhase::StatusSnapshot => self.refresh_status_board(true).await,
            CheckinPhase::FinalBroadcast => {
                self.bounded(self.sink.send(
                    self.unit(),
                    Destination::General,
                    NoticePayload::text(
                        "Start your stream and final setup now; operators may \
                         reach out if your stream is not visible.",
                    ),
                ))
                .await?;
                Ok(())
            },
        }
    }

    async fn refresh_status_board(&self, force: bool) -> Result<(), NotifyError> {
        let now_dt = self.clock.now();
        let now = TimeOfDay::from_datetime(&now_dt);
        let start = self.config.start_time;
        let in_window = now >= start.wrapping_sub_minutes(5) && now <= start;
        if !force && !in_window {
            return Ok(());
        }

        let minute_key = now_dt.format("%Y-%m-%d %H:%M").to_string();
        let staged = self
            .handle
            .mutate(|state| {
                let fresh = state.checkin.note_status_refresh(&minute_key);
                if fresh || force {
                    Some((
                        state.checkin.status_text(),
                        state.checkin.status_notice().cloned(),
                    ))
                } else {
                    None
                }
            })
            .await;
        let Some((text, existing)) = staged else {
            return Ok(());
        };

        match existing {
            Some(id) => {
                let edited = self
                    .bounded(self.sink.edit(self.unit(), &id, NoticePayload::text(text)))
                    .await;
                if let Err(e) = edited {
                    // The board message is gone; repost next refresh.
                    self.handle
                        .mutate(|state| state.checkin.set_status_notice(None))
                        .await;
                    return Err(e);
                }
            },
            None => {
                let id = self
                    .bounded(self.sink.send(
                        self.unit(),
                        Destination::Ops,
                        NoticePayload::text(text),
                    ))
                    .await?;
                self.handle
                    .mutate(|state| state.checkin.set_status_notice(Some(id)))
                    .await;
            },
        }
        Ok(())
    }

    /// Tick step: the distribution trigger - initial round-1 send,
    /// deferral bookkeeping, parked-send release, and driving
    /// `DepartureConfirmed` into `InRound` once the time arrives.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the loop logs it and keeps ticking.
    pub async fn tick_distribution(&self) -> Result<(), OpError> {
        let now = self.clock.time_of_day();

        // Departure time reached: the round is underway.
        let _ = self
            .handle
            .mutate(|state| {
                if state.round.auto_enabled()
                    && !state.round.emergency_stop()
                    && state.round.phase() == RoundPhase::DepartureConfirmed
                {
                    state.round.begin_round(now).unwrap_or(false)
                } else {
                    false
                }
            })
            .await;

        let ctx = TriggerContext {
            now,
            start_time: self.config.start_time,
        };
        let decision = self.handle.read(|state| evaluate(&state.round, &ctx)).await;

        match decision {
            DistributionDecision::Withhold(_) => Ok(()),
            DistributionDecision::Defer { until, .. } => {
                let announce = self.handle.mutate(|state| state.round.defer_until(until)).await;
                self.handle.ensure_persisted().await?;
                if announce {
                    self.announce_deferral(until).await;
                }
                Ok(())
            },
            DistributionDecision::ReleasePending { round } => {
                let release = self
                    .handle
                    .mutate(|state| match state.round.phase() {
                        RoundPhase::Init | RoundPhase::Prep | RoundPhase::Ended => {
                            state.round.take_pending_send().is_some()
                        },
                        _ => {
                            // A manual distribution superseded the
                            // parked send.
                            state.round.clear_pending_send();
                            false
                        },
                    })
                    .await;
                if release {
                    info!(unit = %self.unit(), round, "releasing deferred distribution");
                    self.distribute(false, "pause_release").await.map(|_| ())
                } else {
                    Ok(())
                }
            },
            DistributionDecision::SendInitial => {
                self.distribute(false, "auto_start").await.map(|_| ())
            },
        }
    }

    /// Tick step: deletes the general/holder notices once the
    /// scheduled cleanup instant has passed.
    ///
    /// # Errors
    ///
    /// Infallible today; signature matches the other tick steps.
    pub async fn tick_cleanup(&self) -> Result<(), OpError> {
        let now = self.clock.now().naive_local();
        let due = self
            .handle
            .read(|state| state.round.delete_after().is_some_and(|at| now >= at))
            .await;
        if !due {
            return Ok(());
        }
        let (general, holder) = self
            .handle
            .mutate(|state| {
                state.round.set_delete_after(None);
                state.round.take_notices()
            })
            .await;
        for id in [general, holder].into_iter().flatten() {
            if let Err(e) = self.bounded(self.sink.delete(self.unit(), &id)).await {
                debug!(unit = %self.unit(), error = %e, "notice cleanup failed");
            }
        }
        Ok(())
    }

    /// Tick step: day rollover - a full reset the first time a tick
    /// lands at or past the configured reset hour on a new day.
    ///
    /// # Errors
    ///
    /// Infallible today; signature matches the other tick steps.
    pub async fn tick_rollover(&self) -> Result<(), OpError> {
        let today = self.clock.today();
        if self.clock.time_of_day().hour() < self.config.reset_hour {
            return Ok(());
        }
        let start_time = self.config.start_time;
        let did_reset = self
            .handle
            .mutate(|state| {
                match state.round.last_reset_date() {
                    Some(date) if date == today => false,
                    // A unit seen for the first time has nothing to
                    // roll over; just stamp the date.
                    None => {
                        state.round.set_last_reset_date(today);
                        false
                    },
                    Some(_) => {
                        state.round.full_reset(Some(start_time));
                        state.round.set_last_reset_date(today);
                        state.checkin.reset_for_new_day();
                        state.escalation = None;
                        true
                    },
                }
            })
            .await;
        if did_reset {
            info!(unit = %self.unit(), %today, "day rollover reset");
        }
        Ok(())
    }
}
