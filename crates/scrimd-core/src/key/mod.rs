//! Round credential generation.
//!
//! Each round gets a one-time lobby credential: a fixed organizational
//! prefix followed by four digits. Uniqueness is enforced against a
//! bounded history of every credential the unit has handed out;
//! exhausting the retry budget means the credential space is too small
//! for the history window and is surfaced as a hard error rather than
//! silently reusing a value.

use std::collections::{HashSet, VecDeque};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How many previously issued credentials are remembered for
/// de-duplication.
pub const HISTORY_CAPACITY: usize = 20_000;

/// Generation attempts before giving up.
pub const MAX_GENERATION_ATTEMPTS: u32 = 20_000;

/// Errors from credential generation.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeyError {
    /// Every attempt collided with the history window.
    ///
    /// This is a configuration problem (the numeric suffix space is
    /// smaller than the retained history), not a transient condition.
    #[error(
        "credential space exhausted after {attempts} attempts with prefix '{prefix}'; \
         shrink the history window or widen the credential space"
    )]
    SpaceExhausted {
        /// The configured credential prefix.
        prefix: String,
        /// How many attempts were made.
        attempts: u32,
    },
}

/// Bounded window of previously issued credentials.
///
/// Insertion order is retained so the oldest entries fall out first
/// once the window is full. The set view keeps membership checks O(1).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct KeyHistory {
    entries: VecDeque<String>,
}

impl KeyHistory {
    /// Creates an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Number of remembered credentials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a credential was issued within the window.
    #[must_use]
    pub fn contains(&self, credential: &str) -> bool {
        self.entries.iter().any(|k| k == credential)
    }

    /// Records an issued credential, evicting the oldest entry when
    /// the window is full.
    pub fn record(&mut self, credential: String) {
        if self.entries.len() >= HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(credential);
    }

    fn as_set(&self) -> HashSet<&str> {
        self.entries.iter().map(String::as_str).collect()
    }
}

/// Generates unique round credentials.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    prefix: String,
}

impl KeyGenerator {
    /// Creates a generator with the given organizational prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Generates a fresh credential not present in `history` and
    /// records it there.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::SpaceExhausted`] when the retry budget runs
    /// out without finding an unused value.
    pub fn generate(&self, history: &mut KeyHistory) -> Result<String, KeyError> {
        let used = history.as_set();
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let candidate = format!("{}{:04}", self.prefix, rng.gen_range(0..10_000));
            if !used.contains(candidate.as_str()) {
                drop(used);
                history.record(candidate.clone());
                return Ok(candidate);
            }
        }
        Err(KeyError::SpaceExhausted {
            prefix: self.prefix.clone(),
            attempts: MAX_GENERATION_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_credential_has_prefix_and_four_digits() {
        let gen = KeyGenerator::new("OR40");
        let mut history = KeyHistory::new();
        let key = gen.generate(&mut history).unwrap();
        assert!(key.starts_with("OR40"));
        let suffix = &key["OR40".len()..];
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_generation_records_into_history() {
        let gen = KeyGenerator::new("OR40");
        let mut history = KeyHistory::new();
        let key = gen.generate(&mut history).unwrap();
        assert!(history.contains(&key));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_generation_avoids_history() {
        let gen = KeyGenerator::new("X");
        let mut history = KeyHistory::new();
        // Occupy all but one suffix.
        for n in 0..9_999 {
            history.record(format!("X{n:04}"));
        }
        let key = gen.generate(&mut history).unwrap();
        assert_eq!(key, "X9999");
    }

    #[test]
    fn test_exhaustion_is_a_hard_error() {
        let gen = KeyGenerator::new("X");
        let mut history = KeyHistory::new();
        for n in 0..10_000 {
            history.record(format!("X{n:04}"));
        }
        let err = gen.generate(&mut history).unwrap_err();
        assert!(matches!(err, KeyError::SpaceExhausted { .. }));
    }

    #[test]
    fn test_history_window_is_bounded() {
        let mut history = KeyHistory::new();
        for n in 0..(HISTORY_CAPACITY + 10) {
            history.record(format!("K{n}"));
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert!(!history.contains("K0"));
        assert!(history.contains(&format!("K{}", HISTORY_CAPACITY + 9)));
    }
}
