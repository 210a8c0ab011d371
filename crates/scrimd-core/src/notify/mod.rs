//! External collaborator seams: messaging, roster, rendering, and the
//! credential distribution strategies.
//!
//! The chat platform, the entry/roster system, and the image renderer
//! are all outside this repository. The orchestrator only ever talks
//! to them through the narrow traits here, so the daemon can wire in
//! real transports and the tests can wire in fakes without touching
//! the state machines.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::time::TimeOfDay;
use crate::unit::UnitId;

/// A participant's entry number, e.g. `"001"`.
///
/// The entry system hands out zero-padded three-digit numbers; anything
/// else is rejected at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

/// Rejection of a malformed participant identifier.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid participant id '{0}': expected a three-digit entry number")]
pub struct InvalidParticipantId(pub String);

impl ParticipantId {
    /// Validates and wraps an entry number.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidParticipantId`] unless the input is exactly
    /// three ASCII digits.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidParticipantId> {
        let value = value.into();
        if value.len() == 3 && value.chars().all(|c| c.is_ascii_digit()) {
            Ok(Self(value))
        } else {
            Err(InvalidParticipantId(value))
        }
    }

    /// The entry number as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = InvalidParticipantId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ParticipantId> for String {
    fn from(value: ParticipantId) -> Self {
        value.0
    }
}

/// Opaque identifier for a delivered notice, used to edit or delete it
/// later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(Uuid);

impl DeliveryId {
    /// Mints a fresh delivery id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Logical destination for a notice. The relay maps these onto the
/// platform's channels; the orchestrator never sees a channel id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// The general key distribution channel (all participants).
    General,
    /// The credential holder's channel.
    Holder,
    /// The operator notification channel.
    Ops,
    /// One participant's private channel.
    Participant {
        /// The targeted entry number.
        id: ParticipantId,
    },
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::General => f.write_str("general"),
            Self::Holder => f.write_str("holder"),
            Self::Ops => f.write_str("ops"),
            Self::Participant { id } => write!(f, "participant:{id}"),
        }
    }
}

/// Content of one outbound notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticePayload {
    /// Plain-text body; always present, used as the fallback when a
    /// rendered image is unavailable.
    pub text: String,
    /// Optional rendered image attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
}

impl NoticePayload {
    /// A text-only notice.
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            text: body.into(),
            image: None,
        }
    }

    /// Attaches a rendered image to this notice.
    #[must_use]
    pub fn with_image(mut self, image: Vec<u8>) -> Self {
        self.image = Some(image);
        self
    }
}

/// Failures from external collaborator calls.
///
/// Every wrapper returns an explicit error; whether to suppress it is
/// decided at the automation loop's per-step boundary, never inside
/// the wrapper.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NotifyError {
    /// The call did not complete within its bounded budget.
    #[error("external call timed out after {seconds}s")]
    Timeout {
        /// The budget that elapsed.
        seconds: u64,
    },

    /// The destination exists but is temporarily unreachable.
    #[error("destination {destination} unavailable: {detail}")]
    Unavailable {
        /// Where the notice was headed.
        destination: Destination,
        /// Transport-level detail.
        detail: String,
    },

    /// No destination of this kind is configured for the unit.
    #[error("no {destination} destination configured")]
    MissingDestination {
        /// The missing destination kind.
        destination: Destination,
    },

    /// The roster source could not produce a roster.
    #[error("roster unavailable: {detail}")]
    RosterUnavailable {
        /// Source-level detail.
        detail: String,
    },

    /// The render service failed or declined; callers degrade to the
    /// plain-text payload.
    #[error("render failed: {detail}")]
    RenderFailed {
        /// Renderer-level detail.
        detail: String,
    },

    /// Transport I/O failure.
    #[error("notify transport i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Messaging sink consumed by the orchestrator.
///
/// Three idempotent-shaped operations; no platform UI concepts leak
/// through this seam.
#[async_trait]
pub trait MessagingSink: Send + Sync {
    /// Delivers a notice, returning an id usable with `edit`/`delete`.
    async fn send(
        &self,
        unit: &UnitId,
        destination: Destination,
        payload: NoticePayload,
    ) -> Result<DeliveryId, NotifyError>;

    /// Replaces the content of a previously delivered notice.
    async fn edit(
        &self,
        unit: &UnitId,
        id: &DeliveryId,
        payload: NoticePayload,
    ) -> Result<(), NotifyError>;

    /// Removes a previously delivered notice.
    async fn delete(&self, unit: &UnitId, id: &DeliveryId) -> Result<(), NotifyError>;
}

/// Roster source backing the check-in scheduler.
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// All entry numbers registered for the unit.
    async fn list_participants(
        &self,
        unit: &UnitId,
    ) -> Result<std::collections::BTreeSet<ParticipantId>, NotifyError>;

    /// Whether today is an event day for the unit.
    async fn is_present_today(&self, unit: &UnitId) -> Result<bool, NotifyError>;
}

/// Template parameters for a rendered credential notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeParams {
    /// Round the notice is for.
    pub round_number: u32,
    /// The credential, when the notice carries one.
    pub credential: Option<String>,
    /// Caption for the time field ("departure" vs "estimated").
    pub time_label: String,
    /// The time to display.
    pub time: Option<TimeOfDay>,
}

/// Render service producing visual notices.
#[async_trait]
pub trait NoticeRenderer: Send + Sync {
    /// Renders a notice image. Failure never blocks a tick; callers
    /// fall back to plain text.
    async fn render_notice(&self, params: &NoticeParams) -> Result<Vec<u8>, NotifyError>;
}

/// Which distribution strategy a unit runs.
///
/// A closed set selected by configuration; there is no runtime module
/// lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributorKind {
    /// Credential goes to the holder first; the general pool is
    /// notified once the holder confirms departure.
    #[default]
    HolderRelay,
    /// Credential goes to the holder and the general pool at once.
    Broadcast,
}

/// What a distribution strategy delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionReceipt {
    /// Notice posted to the credential holder.
    pub holder_notice: Option<DeliveryId>,
    /// Notice posted to the general pool, when the strategy sends one
    /// up front.
    pub general_notice: Option<DeliveryId>,
}

/// Inputs to a distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialNotice {
    /// Round the credential belongs to.
    pub round_number: u32,
    /// The one-time credential.
    pub credential: String,
    /// Earliest estimated departure time.
    pub planned_time: TimeOfDay,
}

impl CredentialNotice {
    fn holder_text(&self) -> String {
        format!(
            "Round {} credential: {}\nEstimated departure: {}\n\
             Confirm once the lobby is ready.",
            self.round_number, self.credential, self.planned_time
        )
    }

    fn general_text(&self) -> String {
        format!(
            "Round {} credential: {}\nEstimated departure: {}",
            self.round_number, self.credential, self.planned_time
        )
    }
}

/// Strategy seam for getting a fresh credential to the field.
#[async_trait]
pub trait CredentialDistributor: Send + Sync {
    /// Delivers the credential per the strategy.
    async fn distribute(
        &self,
        sink: &dyn MessagingSink,
        unit: &UnitId,
        notice: &CredentialNotice,
    ) -> Result<DistributionReceipt, NotifyError>;
}

/// Holder-first strategy: the general pool hears nothing until the
/// holder confirms.
pub struct HolderRelayDistributor;

#[async_trait]
impl CredentialDistributor for HolderRelayDistributor {
    async fn distribute(
        &self,
        sink: &dyn MessagingSink,
        unit: &UnitId,
        notice: &CredentialNotice,
    ) -> Result<DistributionReceipt, NotifyError> {
        let holder = sink
            .send(
                unit,
                Destination::Holder,
                NoticePayload::text(notice.holder_text()),
            )
            .await?;
        Ok(DistributionReceipt {
            holder_notice: Some(holder),
            general_notice: None,
        })
    }
}

/// Simultaneous strategy: holder and general pool get the credential
/// in the same pass. The holder notice still goes first so a partial
/// failure leaves the holder informed.
pub struct BroadcastDistributor;

#[async_trait]
impl CredentialDistributor for BroadcastDistributor {
    async fn distribute(
        &self,
        sink: &dyn MessagingSink,
        unit: &UnitId,
        notice: &CredentialNotice,
    ) -> Result<DistributionReceipt, NotifyError> {
        let holder = sink
            .send(
                unit,
                Destination::Holder,
                NoticePayload::text(notice.holder_text()),
            )
            .await?;
        let general = sink
            .send(
                unit,
                Destination::General,
                NoticePayload::text(notice.general_text()),
            )
            .await?;
        Ok(DistributionReceipt {
            holder_notice: Some(holder),
            general_notice: Some(general),
        })
    }
}

/// Resolves the configured strategy to its implementation.
#[must_use]
pub fn distributor_for(kind: DistributorKind) -> Box<dyn CredentialDistributor> {
    match kind {
        DistributorKind::HolderRelay => Box::new(HolderRelayDistributor),
        DistributorKind::Broadcast => Box::new(BroadcastDistributor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id_requires_three_digits() {
        assert!(ParticipantId::new("001").is_ok());
        assert!(ParticipantId::new("999").is_ok());
        assert!(ParticipantId::new("1").is_err());
        assert!(ParticipantId::new("0001").is_err());
        assert!(ParticipantId::new("01a").is_err());
        assert!(ParticipantId::new("").is_err());
    }

    #[test]
    fn test_destination_serde_shape() {
        let d = Destination::Participant {
            id: ParticipantId::new("012").unwrap(),
        };
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, r#"{"kind":"participant","id":"012"}"#);
        let back: Destination = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_distributor_kind_default_is_holder_relay() {
        assert_eq!(DistributorKind::default(), DistributorKind::HolderRelay);
    }
}
