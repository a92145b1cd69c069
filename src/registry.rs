// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The registry tracks each cluster member backend's identity and lifecycle
//! state. There is exactly one registry per logical cluster endpoint, and
//! all mutation goes through it behind a single write lock, so membership
//! changes are serialized: two tasks racing to deactivate the same backend
//! collapse into one transition (the loser sees the state already moved and
//! does nothing).

use crate::Driver;
use async_std::sync::Arc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// A simple backend identifier, unique within one cluster configuration.
/// Registry ordering (and therefore primary selection) follows the `u64`.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendId(pub u64);

impl std::fmt::Debug for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("db#{}", self.0))
    }
}

/// Lifecycle state of one backend.
///
/// `Active` backends receive fanned-out calls. A backend moves to
/// `Inactive` on confirmed failure, to `Synchronizing` when scheduled for
/// full data resynchronization, and back to `Active` only when that resync
/// completes.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendState {
    Active,
    Inactive,
    Synchronizing,
}

/// One cluster member: an independent relational database instance, driven
/// through its own [Driver] instance (which doubles as its connection
/// factory).
pub struct Backend<D: Driver> {
    pub id: BackendId,
    pub(crate) driver: Arc<D>,
    pub(crate) state: BackendState,
}

/// Ordered mapping from [BackendId] to [Backend]. Owned by the
/// [crate::Cluster] behind an `RwLock`; see the module docs for the
/// single-writer discipline.
pub struct Registry<D: Driver> {
    backends: BTreeMap<BackendId, Backend<D>>,
}

impl<D: Driver> Registry<D> {
    pub fn new() -> Self {
        Registry {
            backends: BTreeMap::new(),
        }
    }

    /// Register a backend at cluster configuration time. New backends start
    /// `Active`.
    pub fn insert(&mut self, id: BackendId, driver: Arc<D>) {
        self.backends.insert(
            id,
            Backend {
                id,
                driver,
                state: BackendState::Active,
            },
        );
    }

    pub fn state(&self, id: BackendId) -> Option<BackendState> {
        self.backends.get(&id).map(|b| b.state)
    }

    pub fn driver(&self, id: BackendId) -> Option<Arc<D>> {
        self.backends.get(&id).map(|b| b.driver.clone())
    }

    /// All backend ids, in registry order, regardless of state.
    pub fn all_ids(&self) -> Vec<BackendId> {
        self.backends.keys().cloned().collect()
    }

    /// All `Active` backend ids, in registry order.
    pub fn active_ids(&self) -> Vec<BackendId> {
        self.backends
            .values()
            .filter(|b| b.state == BackendState::Active)
            .map(|b| b.id)
            .collect()
    }

    /// The designated primary: the first `Active` backend in registry
    /// order. Every call's visible result derives from this backend (or,
    /// if it failed mid-call, the first remaining success).
    pub fn primary(&self) -> Option<BackendId> {
        self.backends
            .values()
            .find(|b| b.state == BackendState::Active)
            .map(|b| b.id)
    }

    /// `Active` -> `Inactive` on confirmed failure. Returns false if the
    /// backend was already out of `Active` (a concurrent deactivation won).
    pub fn deactivate(&mut self, id: BackendId) -> bool {
        match self.backends.get_mut(&id) {
            Some(b) if b.state == BackendState::Active => {
                info!("deactivating {:?}", id);
                b.state = BackendState::Inactive;
                true
            }
            _ => false,
        }
    }

    /// `Inactive` -> `Synchronizing` when scheduled for resync.
    pub fn schedule_resync(&mut self, id: BackendId) -> bool {
        match self.backends.get_mut(&id) {
            Some(b) if b.state == BackendState::Inactive => {
                info!("scheduling resync of {:?}", id);
                b.state = BackendState::Synchronizing;
                true
            }
            _ => false,
        }
    }

    /// Deactivate and immediately schedule for resync: the transition a
    /// failing backend takes when a write succeeded on a peer.
    pub fn quarantine(&mut self, id: BackendId) -> bool {
        let deactivated = self.deactivate(id);
        self.schedule_resync(id) || deactivated
    }

    /// `Synchronizing` -> `Active`, only once resynchronization completes.
    pub fn activate(&mut self, id: BackendId) -> bool {
        match self.backends.get_mut(&id) {
            Some(b) if b.state == BackendState::Synchronizing => {
                info!("activating {:?} after resync", id);
                b.state = BackendState::Active;
                true
            }
            _ => false,
        }
    }
}
