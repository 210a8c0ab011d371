//! scrimd - operator CLI.
//!
//! A thin client: each subcommand maps onto exactly one operator
//! request, sent as a JSON line over the daemon's Unix socket; the
//! reply is printed and the exit code reflects `ok`.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scrimd_core::checkin::CheckinMark;
use scrimd_core::notify::ParticipantId;
use scrimd_core::unit::UnitId;
use scrimd_daemon::protocol::{OperatorRequest, OperatorResponse};

/// Reply wait budget; the daemon answers within one external-call
/// timeout.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// scrimd operator client
#[derive(Parser, Debug)]
#[command(name = "scrimd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the daemon's operator socket
    #[arg(long, default_value = "scrimd.sock")]
    socket: PathBuf,

    /// Unit to operate on
    #[arg(long, default_value = "or40")]
    unit: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the unit's current status
    Status,
    /// Begin preparation for the current round
    BeginPrep,
    /// Distribute the round credential (manual; bypasses the
    /// emergency stop)
    Distribute,
    /// Confirm the holder's readiness and lock the departure time
    Confirm,
    /// Mark the round as underway
    BeginRound,
    /// Ask for result submissions; pass up to three ranked fallback
    /// entry numbers, "-" for a blank rank
    RequestResult {
        /// Ranked fallback contacts, e.g. `001 - 003`
        targets: Vec<String>,
    },
    /// Record a confirmed result submission
    SubmitResult,
    /// Assert the emergency stop
    Stop,
    /// Clear the emergency stop
    Resume,
    /// Enable or disable automatic mode
    SetAuto {
        /// `on` or `off`
        state: String,
    },
    /// Enter minutes remaining until the map rotation
    PauseMinutes {
        /// Minutes until the rotation
        minutes: u32,
    },
    /// Select the current round number
    SetRound {
        /// The round to select
        round: u32,
    },
    /// Reset the unit to round 1
    Reset,
    /// Re-fire a check-in phase (1-4) regardless of its guard
    ForceCheckin {
        /// Phase number
        phase: u8,
    },
    /// Record a participant's check-in response
    Mark {
        /// Entry number
        id: String,
        /// `checkin`, `decline`, or `forfeit`
        response: String,
    },
    /// Report a missing result submission for a round
    ReportMissing {
        /// The round the report is about
        round: u32,
    },
}

fn parse_mark(s: &str) -> Result<CheckinMark> {
    match s {
        "checkin" => Ok(CheckinMark::CheckedIn),
        "decline" => Ok(CheckinMark::Declined),
        "forfeit" => Ok(CheckinMark::Forfeited),
        other => bail!("unknown response '{other}': expected checkin, decline, or forfeit"),
    }
}

fn parse_targets(raw: Vec<String>) -> Result<Vec<Option<ParticipantId>>> {
    raw.into_iter()
        .map(|t| {
            if t == "-" {
                Ok(None)
            } else {
                ParticipantId::new(t.as_str())
                    .map(Some)
                    .map_err(Into::into)
            }
        })
        .collect()
}

fn build_request(unit: UnitId, command: Command) -> Result<OperatorRequest> {
    Ok(match command {
        Command::Status => OperatorRequest::Status { unit },
        Command::BeginPrep => OperatorRequest::BeginPreparation { unit },
        Command::Distribute => OperatorRequest::DistributeCredential { unit },
        Command::Confirm => OperatorRequest::ConfirmDeparture { unit },
        Command::BeginRound => OperatorRequest::BeginRound { unit },
        Command::RequestResult { targets } => OperatorRequest::RequestResult {
            unit,
            targets: parse_targets(targets)?,
        },
        Command::SubmitResult => OperatorRequest::SubmitResult { unit },
        Command::Stop => OperatorRequest::EmergencyStop { unit },
        Command::Resume => OperatorRequest::EmergencyResume { unit },
        Command::SetAuto { state } => OperatorRequest::SetAuto {
            unit,
            enabled: match state.as_str() {
                "on" => true,
                "off" => false,
                other => bail!("unknown state '{other}': expected on or off"),
            },
        },
        Command::PauseMinutes { minutes } => {
            OperatorRequest::SetPauseRemainingMinutes { unit, minutes }
        },
        Command::SetRound { round } => OperatorRequest::SetRound { unit, round },
        Command::Reset => OperatorRequest::FullReset { unit },
        Command::ForceCheckin { phase } => OperatorRequest::ForceCheckinPhase { unit, phase },
        Command::Mark { id, response } => OperatorRequest::CheckinMark {
            unit,
            id: ParticipantId::new(id.as_str())?,
            mark: parse_mark(&response)?,
        },
        Command::ReportMissing { round } => OperatorRequest::ReportResultMissing { unit, round },
    })
}

fn exchange(socket: &Path, request: &OperatorRequest) -> Result<OperatorResponse> {
    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("connecting to {} (is the daemon running?)", socket.display()))?;
    stream
        .set_read_timeout(Some(REPLY_TIMEOUT))
        .context("setting read timeout")?;

    let mut encoded = serde_json::to_string(request).context("encoding request")?;
    encoded.push('\n');
    stream
        .write_all(encoded.as_bytes())
        .context("sending request")?;

    let mut reply = String::new();
    BufReader::new(stream)
        .read_line(&mut reply)
        .context("reading reply")?;
    if reply.trim().is_empty() {
        bail!("daemon closed the connection without a reply");
    }
    serde_json::from_str(&reply).context("decoding reply")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let unit = UnitId::new(cli.unit.as_str())?;
    let request = build_request(unit, cli.command)?;
    let response = exchange(&cli.socket, &request)?;

    if let Some(status) = &response.status {
        println!("{}", serde_json::to_string_pretty(status)?);
    } else {
        println!("{}", response.reason);
    }
    if !response.ok {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_allow_dash_gaps() {
        let targets =
            parse_targets(vec!["001".to_string(), "-".to_string(), "003".to_string()]).unwrap();
        assert_eq!(targets.len(), 3);
        assert!(targets[0].is_some());
        assert!(targets[1].is_none());
        assert!(targets[2].is_some());
    }

    #[test]
    fn test_targets_reject_bad_entry_numbers() {
        assert!(parse_targets(vec!["12".to_string()]).is_err());
    }

    #[test]
    fn test_mark_parsing() {
        assert_eq!(parse_mark("checkin").unwrap(), CheckinMark::CheckedIn);
        assert_eq!(parse_mark("decline").unwrap(), CheckinMark::Declined);
        assert_eq!(parse_mark("forfeit").unwrap(), CheckinMark::Forfeited);
        assert!(parse_mark("maybe").is_err());
    }
}
