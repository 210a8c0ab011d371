//! Configuration parsing and validation.
//!
//! One TOML document (`scrimd.toml`) describes the event (start time,
//! rounds, credential prefix), the daemon (paths, tick interval,
//! timeouts), and the units to drive. Defaults follow the event this
//! system was built for; everything is overridable.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notify::DistributorKind;
use crate::time::TimeOfDay;
use crate::unit::UnitId;

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration is structurally valid but semantically wrong.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Event start time (`T0` for check-in phases, round 1 anchor).
    #[serde(default = "default_start_time")]
    pub start_time: TimeOfDay,

    /// Number of rounds in the event.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Organizational prefix on generated credentials.
    #[serde(default = "default_credential_prefix")]
    pub credential_prefix: String,

    /// The event's UTC offset, in hours.
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,

    /// Local hour at which the day-rollover reset runs.
    #[serde(default = "default_reset_hour")]
    pub reset_hour: u8,

    /// Minutes before start at which check-in closes and automation
    /// arms itself.
    #[serde(default = "default_checkin_close_minutes")]
    pub checkin_close_minutes: u32,

    /// Which credential distribution strategy to run.
    #[serde(default)]
    pub distributor: DistributorKind,

    /// Units this daemon drives.
    #[serde(default)]
    pub units: Vec<UnitConfig>,

    /// Daemon process settings.
    #[serde(default)]
    pub daemon: DaemonSection,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            start_time: default_start_time(),
            max_rounds: default_max_rounds(),
            credential_prefix: default_credential_prefix(),
            utc_offset_hours: default_utc_offset_hours(),
            reset_hour: default_reset_hour(),
            checkin_close_minutes: default_checkin_close_minutes(),
            distributor: DistributorKind::default(),
            units: Vec::new(),
            daemon: DaemonSection::default(),
        }
    }
}

/// One driven unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitConfig {
    /// The unit's identifier (also the snapshot filename stem).
    pub id: UnitId,
}

/// Daemon process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    /// Directory for persisted unit snapshots.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Operator control socket path.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Directory for per-unit outbox files (drained by the chat
    /// relay).
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,

    /// Roster document maintained by the entry system.
    #[serde(default = "default_roster_path")]
    pub roster_path: PathBuf,

    /// Automation tick interval, seconds.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Per-call budget for external calls, seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Consecutive failed ticks of one step before operators are
    /// alerted.
    #[serde(default = "default_failure_alert_ticks")]
    pub failure_alert_ticks: u32,

    /// External render program; omitted means plain-text notices only.
    #[serde(default)]
    pub render_command: Option<PathBuf>,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            socket_path: default_socket_path(),
            outbox_dir: default_outbox_dir(),
            roster_path: default_roster_path(),
            tick_interval_secs: default_tick_interval_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            failure_alert_ticks: default_failure_alert_ticks(),
            render_command: None,
        }
    }
}

fn default_start_time() -> TimeOfDay {
    TimeOfDay::new(22, 0).expect("literal in range")
}

const fn default_max_rounds() -> u32 {
    3
}

fn default_credential_prefix() -> String {
    "OR40".to_string()
}

const fn default_utc_offset_hours() -> i32 {
    9
}

const fn default_reset_hour() -> u8 {
    5
}

const fn default_checkin_close_minutes() -> u32 {
    2
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("scrimd.sock")
}

fn default_outbox_dir() -> PathBuf {
    PathBuf::from("outbox")
}

fn default_roster_path() -> PathBuf {
    PathBuf::from("roster.json")
}

const fn default_tick_interval_secs() -> u64 {
    10
}

const fn default_call_timeout_secs() -> u64 {
    5
}

const fn default_failure_alert_ticks() -> u32 {
    6
}

impl EventConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or
    /// validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation beyond what serde enforces.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] with the first problem
    /// found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Validation(msg));

        if self.credential_prefix.is_empty() {
            return fail("credential_prefix must not be empty".to_string());
        }
        if self.max_rounds == 0 {
            return fail("max_rounds must be at least 1".to_string());
        }
        // Check-in offsets reach back 30 minutes and never wrap.
        if self.start_time.minutes_from_midnight() < 30 {
            return fail(format!(
                "start_time {} is within 30 minutes of midnight; \
                 check-in phases would wrap to the previous day",
                self.start_time
            ));
        }
        if self.utc_offset_hours.abs() > 23 {
            return fail(format!(
                "utc_offset_hours {} out of range (-23..=23)",
                self.utc_offset_hours
            ));
        }
        if self.reset_hour > 23 {
            return fail(format!("reset_hour {} out of range (0..=23)", self.reset_hour));
        }
        if self.checkin_close_minutes > 30 {
            return fail(format!(
                "checkin_close_minutes {} out of range (0..=30)",
                self.checkin_close_minutes
            ));
        }
        if !(5..=60).contains(&self.daemon.tick_interval_secs) {
            return fail(format!(
                "daemon.tick_interval_secs {} out of range (5..=60)",
                self.daemon.tick_interval_secs
            ));
        }
        if self.daemon.call_timeout_secs == 0
            || self.daemon.call_timeout_secs >= self.daemon.tick_interval_secs
        {
            return fail(format!(
                "daemon.call_timeout_secs {} must be nonzero and below the tick interval",
                self.daemon.call_timeout_secs
            ));
        }
        if self.daemon.failure_alert_ticks == 0 {
            return fail("daemon.failure_alert_ticks must be at least 1".to_string());
        }
        if self.units.is_empty() {
            return fail("at least one [[units]] entry is required".to_string());
        }
        let mut seen = std::collections::BTreeSet::new();
        for unit in &self.units {
            if !seen.insert(&unit.id) {
                return fail(format!("duplicate unit id '{}'", unit.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [[units]]
            id = "or40"
        "#
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = EventConfig::from_toml(minimal_toml()).unwrap();
        assert_eq!(config.start_time.to_string(), "22:00");
        assert_eq!(config.max_rounds, 3);
        assert_eq!(config.credential_prefix, "OR40");
        assert_eq!(config.utc_offset_hours, 9);
        assert_eq!(config.reset_hour, 5);
        assert_eq!(config.distributor, DistributorKind::HolderRelay);
        assert_eq!(config.daemon.tick_interval_secs, 10);
    }

    #[test]
    fn test_full_config_parses() {
        let config = EventConfig::from_toml(
            r#"
                start_time = "20:30"
                max_rounds = 5
                credential_prefix = "SCRIM"
                distributor = "broadcast"

                [daemon]
                state_dir = "/var/lib/scrimd"
                tick_interval_secs = 15
                call_timeout_secs = 4
                render_command = "/usr/local/bin/notice-render"

                [[units]]
                id = "alpha"

                [[units]]
                id = "beta"
            "#,
        )
        .unwrap();
        assert_eq!(config.start_time.to_string(), "20:30");
        assert_eq!(config.distributor, DistributorKind::Broadcast);
        assert_eq!(config.units.len(), 2);
        assert!(config.daemon.render_command.is_some());
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let err = EventConfig::from_toml(
            r#"
                credential_prefix = ""

                [[units]]
                id = "or40"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_start_time_near_midnight_rejected() {
        let err = EventConfig::from_toml(
            r#"
                start_time = "00:10"

                [[units]]
                id = "or40"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_no_units_rejected() {
        let err = EventConfig::from_toml("").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_duplicate_units_rejected() {
        let err = EventConfig::from_toml(
            r#"
                [[units]]
                id = "or40"

                [[units]]
                id = "or40"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_call_timeout_must_fit_inside_tick() {
        let err = EventConfig::from_toml(
            r#"
                [daemon]
                tick_interval_secs = 10
                call_timeout_secs = 10

                [[units]]
                id = "or40"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
