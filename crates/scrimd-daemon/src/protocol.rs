//! Operator control protocol.
//!
//! Line-delimited JSON over a Unix socket: one request object per
//! line, one response object per line. Every response carries `ok`
//! plus a human-readable reason; invalid input is rejected at this
//! boundary without mutating state.

use std::collections::HashMap;
use std::sync::Arc;

use scrimd_core::checkin::CheckinMark;
use scrimd_core::notify::ParticipantId;
use scrimd_core::unit::UnitId;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::orchestrator::{Orchestrator, StatusView};

/// One operator request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperatorRequest {
    /// Report the unit's current status.
    Status {
        /// Target unit.
        unit: UnitId,
    },
    /// Begin preparation for the current round.
    BeginPreparation {
        /// Target unit.
        unit: UnitId,
    },
    /// Manually distribute the round credential (bypasses the
    /// emergency-stop gate).
    DistributeCredential {
        /// Target unit.
        unit: UnitId,
    },
    /// Lock in the departure time after the holder confirms.
    ConfirmDeparture {
        /// Target unit.
        unit: UnitId,
    },
    /// Mark the round as underway.
    BeginRound {
        /// Target unit.
        unit: UnitId,
    },
    /// Ask for result submissions and arm the escalation ladder.
    RequestResult {
        /// Target unit.
        unit: UnitId,
        /// Up to three ranked fallback contacts; gaps allowed.
        #[serde(default)]
        targets: Vec<Option<ParticipantId>>,
    },
    /// Record a confirmed result submission.
    SubmitResult {
        /// Target unit.
        unit: UnitId,
    },
    /// Assert the emergency stop.
    EmergencyStop {
        /// Target unit.
        unit: UnitId,
    },
    /// Clear the emergency stop.
    EmergencyResume {
        /// Target unit.
        unit: UnitId,
    },
    /// Enable or disable automatic mode.
    SetAuto {
        /// Target unit.
        unit: UnitId,
        /// Desired automatic mode.
        enabled: bool,
    },
    /// Enter "minutes remaining until rotation" and derive the
    /// blackout window.
    SetPauseRemainingMinutes {
        /// Target unit.
        unit: UnitId,
        /// Minutes until the rotation.
        minutes: u32,
    },
    /// Select the current round number.
    SetRound {
        /// Target unit.
        unit: UnitId,
        /// The round to select.
        round: u32,
    },
    /// Reset to round 1 / initial phase.
    FullReset {
        /// Target unit.
        unit: UnitId,
    },
    /// Re-fire a check-in phase regardless of its guard.
    ForceCheckinPhase {
        /// Target unit.
        unit: UnitId,
        /// Phase number (1-4).
        phase: u8,
    },
    /// Record a participant's check-in response.
    CheckinMark {
        /// Target unit.
        unit: UnitId,
        /// The participant.
        id: ParticipantId,
        /// The response.
        mark: CheckinMark,
    },
    /// Handle a "result missing" report for a round.
    ReportResultMissing {
        /// Target unit.
        unit: UnitId,
        /// The round the report is about.
        round: u32,
    },
}

impl OperatorRequest {
    fn unit(&self) -> &UnitId {
        match self {
            Self::Status { unit }
            | Self::BeginPreparation { unit }
            | Self::DistributeCredential { unit }
            | Self::ConfirmDeparture { unit }
            | Self::BeginRound { unit }
            | Self::RequestResult { unit, .. }
            | Self::SubmitResult { unit }
            | Self::EmergencyStop { unit }
            | Self::EmergencyResume { unit }
            | Self::SetAuto { unit, .. }
            | Self::SetPauseRemainingMinutes { unit, .. }
            | Self::SetRound { unit, .. }
            | Self::FullReset { unit }
            | Self::ForceCheckinPhase { unit, .. }
            | Self::CheckinMark { unit, .. }
            | Self::ReportResultMissing { unit, .. } => unit,
        }
    }
}

/// One operator response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorResponse {
    /// Whether the operation succeeded.
    pub ok: bool,
    /// Human-readable outcome.
    pub reason: String,
    /// Status payload, for status requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusView>,
}

impl OperatorResponse {
    fn ok(reason: String) -> Self {
        Self {
            ok: true,
            reason,
            status: None,
        }
    }

    fn err(reason: String) -> Self {
        Self {
            ok: false,
            reason,
            status: None,
        }
    }
}

/// Dispatches operator requests onto per-unit orchestrators.
pub struct OperatorService {
    orchestrators: HashMap<UnitId, Arc<Orchestrator>>,
}

impl OperatorService {
    /// Creates a service over the given orchestrators.
    #[must_use]
    pub fn new(orchestrators: HashMap<UnitId, Arc<Orchestrator>>) -> Self {
        Self { orchestrators }
    }

    /// Handles one request.
    pub async fn handle(&self, request: OperatorRequest) -> OperatorResponse {
        let Some(orchestrator) = self.orchestrators.get(request.unit()).cloned() else {
            return OperatorResponse::err(format!("unknown unit '{}'", request.unit()));
        };

        let outcome = match request {
            OperatorRequest::Status { .. } => {
                let status = orchestrator.status().await;
                return OperatorResponse {
                    ok: true,
                    reason: format!("round {} ({})", status.round_number, status.phase),
                    status: Some(status),
                };
            },
            OperatorRequest::BeginPreparation { .. } => orchestrator.begin_preparation().await,
            OperatorRequest::DistributeCredential { .. } => {
                orchestrator.distribute_credential_manual().await
            },
            OperatorRequest::ConfirmDeparture { .. } => orchestrator.confirm_departure().await,
            OperatorRequest::BeginRound { .. } => orchestrator.begin_round().await,
            OperatorRequest::RequestResult { targets, .. } => {
                orchestrator.request_result(targets).await
            },
            OperatorRequest::SubmitResult { .. } => orchestrator.submit_result().await,
            OperatorRequest::EmergencyStop { .. } => orchestrator.emergency_stop().await,
            OperatorRequest::EmergencyResume { .. } => orchestrator.emergency_resume().await,
            OperatorRequest::SetAuto { enabled, .. } => orchestrator.set_auto(enabled).await,
            OperatorRequest::SetPauseRemainingMinutes { minutes, .. } => {
                orchestrator.set_pause_remaining_minutes(minutes).await
            },
            OperatorRequest::SetRound { round, .. } => orchestrator.set_round(round).await,
            OperatorRequest::FullReset { .. } => orchestrator.full_reset().await,
            OperatorRequest::ForceCheckinPhase { phase, .. } => {
                orchestrator.force_checkin_phase(phase).await
            },
            OperatorRequest::CheckinMark { id, mark, .. } => {
                orchestrator.checkin_mark(id, mark).await
            },
            OperatorRequest::ReportResultMissing { round, .. } => {
                orchestrator.report_result_missing(round).await
            },
        };

        match outcome {
            Ok(reason) => OperatorResponse::ok(reason),
            Err(e) => OperatorResponse::err(e.to_string()),
        }
    }

    /// Accept loop for the operator socket. Runs until shutdown.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, shutdown: watch::Receiver<bool>) {
        info!("operator socket listening");
        let mut shutdown_accept = shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let service = Arc::clone(&self);
                            let conn_shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                service.serve_connection(stream, conn_shutdown).await;
                            });
                        },
                        Err(e) => {
                            warn!(error = %e, "operator socket accept failed");
                        },
                    }
                },
                _ = shutdown_accept.changed() => {
                    if *shutdown_accept.borrow() {
                        info!("operator socket shutting down");
                        return;
                    }
                },
            }
        }
    }

    async fn serve_connection(
        &self,
        stream: tokio::net::UnixStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                    continue;
                },
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    debug!(error = %e, "operator connection read failed");
                    return;
                },
            };
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<OperatorRequest>(&line) {
                Ok(request) => self.handle(request).await,
                Err(e) => OperatorResponse::err(format!("malformed request: {e}")),
            };
            let Ok(mut encoded) = serde_json::to_string(&response) else {
                return;
            };
            encoded.push('\n');
            if writer.write_all(encoded.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}
