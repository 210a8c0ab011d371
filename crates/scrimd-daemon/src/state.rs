//! Per-unit shared state.
//!
//! Each unit gets one [`UnitHandle`]: a mutex-guarded [`UnitState`]
//! plus the snapshot store. Operator commands and the automation loop
//! both mutate through [`UnitHandle::mutate`], which serializes the
//! read-modify-write, stages a snapshot, and performs the disk write
//! with the state lock released. A version counter keeps concurrent
//! staged writes from clobbering a newer snapshot with an older one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use scrimd_core::store::{SnapshotStore, StoreError};
use scrimd_core::unit::{UnitId, UnitState};
use tokio::sync::Mutex;
use tracing::warn;

struct Versioned {
    state: UnitState,
    version: u64,
}

/// Handle to one unit's state and its persistence.
pub struct UnitHandle {
    id: UnitId,
    store: SnapshotStore,
    state: Mutex<Versioned>,
    /// Last version written to disk; also serializes the disk writes
    /// themselves.
    written: Mutex<u64>,
    /// Set when a snapshot write failed; [`ensure_persisted`] must
    /// succeed before the next dispatch that depends on a persisted
    /// idempotency flag.
    ///
    /// [`ensure_persisted`]: UnitHandle::ensure_persisted
    persist_pending: AtomicBool,
}

impl UnitHandle {
    /// Loads (or initializes) a unit's state from the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when an existing snapshot cannot be
    /// read; a missing snapshot is not an error.
    pub fn open(id: UnitId, store: SnapshotStore) -> Result<Self, StoreError> {
        let state = store.load(&id)?.unwrap_or_default();
        Ok(Self {
            id,
            store,
            state: Mutex::new(Versioned { state, version: 0 }),
            written: Mutex::new(0),
            persist_pending: AtomicBool::new(false),
        })
    }

    /// The unit this handle belongs to.
    #[must_use]
    pub const fn id(&self) -> &UnitId {
        &self.id
    }

    /// Reads a projection of the current state under the lock.
    pub async fn read<T>(&self, f: impl FnOnce(&UnitState) -> T) -> T {
        let guard = self.state.lock().await;
        f(&guard.state)
    }

    /// Applies a mutation under the lock, then persists the staged
    /// snapshot with the lock released.
    ///
    /// The mutation is visible to subsequent readers immediately; a
    /// failed disk write only flags `persist_pending` (logged here),
    /// and callers about to perform an external dispatch that relies
    /// on a persisted flag must call
    /// [`ensure_persisted`](Self::ensure_persisted) first.
    pub async fn mutate<T>(&self, f: impl FnOnce(&mut UnitState) -> T) -> T {
        let (out, snapshot, version) = {
            let mut guard = self.state.lock().await;
            let out = f(&mut guard.state);
            guard.version += 1;
            (out, guard.state.clone(), guard.version)
        };
        if let Err(e) = self.write_snapshot(&snapshot, version).await {
            self.persist_pending.store(true, Ordering::SeqCst);
            warn!(unit = %self.id, error = %e, "snapshot write failed; will retry before next dispatch");
        }
        out
    }

    /// Retries persistence of the current state if a previous write
    /// failed.
    ///
    /// # Errors
    ///
    /// Returns the write error; the caller must not dispatch anything
    /// gated on a persisted flag until this succeeds.
    pub async fn ensure_persisted(&self) -> Result<(), StoreError> {
        if !self.persist_pending.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (snapshot, version) = {
            let guard = self.state.lock().await;
            (guard.state.clone(), guard.version)
        };
        self.write_snapshot(&snapshot, version).await
    }

    async fn write_snapshot(&self, snapshot: &UnitState, version: u64) -> Result<(), StoreError> {
        let mut written = self.written.lock().await;
        if version <= *written {
            // A newer snapshot is already durable; this one is
            // subsumed.
            return Ok(());
        }
        self.store.save(&self.id, snapshot)?;
        *written = version;
        self.persist_pending.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry of all units this daemon drives.
pub struct UnitRegistry {
    units: HashMap<UnitId, Arc<UnitHandle>>,
}

impl UnitRegistry {
    /// Opens handles for the configured units against one store.
    ///
    /// # Errors
    ///
    /// Returns the first snapshot load failure.
    pub fn open(store: &SnapshotStore, unit_ids: &[UnitId]) -> Result<Self, StoreError> {
        let mut units = HashMap::new();
        for id in unit_ids {
            let handle = UnitHandle::open(id.clone(), store.clone())?;
            units.insert(id.clone(), Arc::new(handle));
        }
        Ok(Self { units })
    }

    /// Looks up a unit's handle.
    #[must_use]
    pub fn get(&self, id: &UnitId) -> Option<Arc<UnitHandle>> {
        self.units.get(id).cloned()
    }

    /// All handles, in arbitrary order.
    pub fn handles(&self) -> impl Iterator<Item = &Arc<UnitHandle>> {
        self.units.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_mutate_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let handle = UnitHandle::open(unit("or40"), store.clone()).unwrap();

        handle
            .mutate(|state| state.round.begin_preparation().unwrap())
            .await;

        // A fresh handle sees the persisted mutation.
        let reloaded = UnitHandle::open(unit("or40"), store).unwrap();
        let round = reloaded.read(|s| s.round.round_number()).await;
        assert_eq!(round, 1);
        let phase = reloaded.read(|s| s.round.phase()).await;
        assert_eq!(phase, scrimd_core::RoundPhase::Prep);
    }

    #[tokio::test]
    async fn test_registry_resolves_configured_units() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let registry = UnitRegistry::open(&store, &[unit("a"), unit("b")]).unwrap();
        assert!(registry.get(&unit("a")).is_some());
        assert!(registry.get(&unit("c")).is_none());
        assert_eq!(registry.handles().count(), 2);
    }
}
