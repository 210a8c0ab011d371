//! Atomic snapshot persistence.
//!
//! One JSON document per unit under the state directory. Writes stage
//! the new document in a temp file in the same directory, fsync it,
//! and rename it over the previous snapshot, so a crash mid-write
//! always leaves either the old or the new document intact.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::unit::{UnitId, UnitState};

/// Errors from snapshot persistence.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Filesystem failure reading or writing a snapshot.
    #[error("snapshot i/o at {path}: {source}")]
    Io {
        /// The snapshot (or directory) path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A snapshot on disk could not be decoded.
    #[error("corrupt snapshot at {path}: {source}")]
    Corrupt {
        /// The snapshot path.
        path: PathBuf,
        /// The decode error.
        #[source]
        source: serde_json::Error,
    },

    /// A snapshot could not be encoded (should not happen for valid
    /// state; kept explicit rather than panicking).
    #[error("failed to encode snapshot for unit {unit}: {source}")]
    Encode {
        /// The unit whose state failed to encode.
        unit: UnitId,
        /// The encode error.
        #[source]
        source: serde_json::Error,
    },
}

/// Directory-backed store of per-unit snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the directory cannot be
    /// created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Path of a unit's snapshot document.
    #[must_use]
    pub fn snapshot_path(&self, unit: &UnitId) -> PathBuf {
        self.dir.join(format!("{unit}.json"))
    }

    /// Loads a unit's snapshot, or `None` when the unit has no state
    /// yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on read failure and
    /// [`StoreError::Corrupt`] when the document does not decode.
    pub fn load(&self, unit: &UnitId) -> Result<Option<UnitState>, StoreError> {
        let path = self.snapshot_path(unit);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let state =
            serde_json::from_str(&content).map_err(|source| StoreError::Corrupt { path, source })?;
        Ok(Some(state))
    }

    /// Writes a unit's snapshot atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Encode`] or [`StoreError::Io`]; the
    /// previous snapshot survives any failure.
    pub fn save(&self, unit: &UnitId, state: &UnitState) -> Result<(), StoreError> {
        let encoded =
            serde_json::to_vec_pretty(state).map_err(|source| StoreError::Encode {
                unit: unit.clone(),
                source,
            })?;
        let path = self.snapshot_path(unit);
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        // Temp file in the same directory so the rename stays on one
        // filesystem.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(&encoded).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// Unit ids with a snapshot on disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the directory cannot be read.
    /// Files that are not `<unit>.json` are ignored.
    pub fn list_units(&self) -> Result<Vec<UnitId>, StoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut units = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let Some(stem) = Path::new(&name)
                .file_stem()
                .and_then(|s| s.to_str())
            else {
                continue;
            };
            if Path::new(&name).extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(unit) = UnitId::new(stem) {
                units.push(unit);
            }
        }
        units.sort();
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    #[test]
    fn test_load_missing_unit_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.load(&unit("or40")).unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let mut state = UnitState::new();
        state.round.begin_preparation().unwrap();
        store.save(&unit("or40"), &state).unwrap();
        let loaded = store.load(&unit("or40")).unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let u = unit("or40");
        let first = UnitState::new();
        store.save(&u, &first).unwrap();
        let mut second = UnitState::new();
        second.round.begin_preparation().unwrap();
        store.save(&u, &second).unwrap();
        assert_eq!(store.load(&u).unwrap().unwrap(), second);
        // No stray temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_corrupt_snapshot_is_an_explicit_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        std::fs::write(store.snapshot_path(&unit("or40")), b"not json").unwrap();
        let err = store.load(&unit("or40")).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_list_units_finds_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        store.save(&unit("beta"), &UnitState::new()).unwrap();
        store.save(&unit("alpha"), &UnitState::new()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();
        let units = store.list_units().unwrap();
        assert_eq!(units, vec![unit("alpha"), unit("beta")]);
    }
}
