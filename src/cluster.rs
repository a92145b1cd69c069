// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The root object: one logical database endpoint over a set of backends.
//!
//! A [Cluster] is cheap to clone (every field is shared) and every clone
//! sees the same registry, journal, lock manager and staging factory. The
//! usual shape of a program using this crate is: build a cluster, register
//! backends, run [Cluster::recover], then hand clones to whatever serves
//! clients, each of which calls [Cluster::open] to enter the proxy
//! hierarchy.

use crate::{
    BackendId, BackendState, DispatchMode, Driver, Error, Journal, JournalRecord, LockManager,
    MemberId, Messenger, Registry, Staging, TxnId,
};
use async_std::sync::{Arc, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use tracing::error;

/// Tuning knobs for one cluster endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// How multi-backend strategies spread their per-backend calls.
    pub dispatch: DispatchMode,
    /// How long a structural operation waits for the cluster-global lock
    /// before giving up with [Error::LockTimeout].
    pub lock_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            dispatch: DispatchMode::Parallel,
            lock_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Cluster<D: Driver, J: Journal> {
    pub self_id: MemberId,
    pub config: ClusterConfig,
    pub(crate) registry: Arc<RwLock<Registry<D>>>,
    pub(crate) journal: Arc<J>,
    pub(crate) locks: LockManager,
    pub(crate) staging: Arc<dyn Staging>,
    txn_seq: Arc<AtomicU64>,
    fenced: Arc<AtomicBool>,
}

impl<D: Driver, J: Journal> Clone for Cluster<D, J> {
    fn clone(&self) -> Self {
        Cluster {
            self_id: self.self_id,
            config: self.config.clone(),
            registry: self.registry.clone(),
            journal: self.journal.clone(),
            locks: self.locks.clone(),
            staging: self.staging.clone(),
            txn_seq: self.txn_seq.clone(),
            fenced: self.fenced.clone(),
        }
    }
}

impl<D: Driver, J: Journal> Cluster<D, J> {
    pub fn new(
        self_id: MemberId,
        config: ClusterConfig,
        journal: J,
        messenger: Arc<dyn Messenger>,
        staging: Arc<dyn Staging>,
    ) -> Self {
        Cluster {
            self_id,
            config,
            registry: Arc::new(RwLock::new(Registry::new())),
            journal: Arc::new(journal),
            locks: LockManager::new(self_id, messenger),
            staging,
            txn_seq: Arc::new(AtomicU64::new(1)),
            fenced: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a backend. New backends start ACTIVE, so this belongs in
    /// configuration time, before the cluster serves calls; a backend added
    /// to a live cluster must go through resynchronization instead.
    pub async fn add_backend(&self, id: BackendId, driver: D) {
        self.registry.write().await.insert(id, Arc::new(driver));
    }

    pub async fn backend_state(&self, id: BackendId) -> Option<BackendState> {
        self.registry.read().await.state(id)
    }

    pub async fn active_backends(&self) -> Vec<BackendId> {
        self.registry.read().await.active_ids()
    }

    /// The decree-protocol lock manager for this member. Its receive side
    /// (the [crate::DecreeHandler] impl) must be registered with the group
    /// transport by the caller, since transports differ in how they attach
    /// handlers.
    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    pub fn journal(&self) -> &J {
        &self.journal
    }

    pub(crate) fn next_txn(&self) -> TxnId {
        TxnId {
            member: self.self_id,
            seq: self.txn_seq.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// True once a journal fault has fenced this node; see
    /// [Cluster::journal_append].
    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::SeqCst)
    }

    pub(crate) fn check_fence(&self) -> Result<(), Error> {
        if self.is_fenced() {
            Err(Error::Journal("node is fenced".into()))
        } else {
            Ok(())
        }
    }

    // All journal writes funnel through here. A fault fences the node: with
    // the journal gone we can no longer promise to detect divergence, so no
    // further writes are accepted until a restart (and recovery) clears it.
    pub(crate) fn journal_append(&self, record: JournalRecord) -> Result<(), Error> {
        match self.journal.append(record) {
            Ok(()) => Ok(()),
            Err(fault) => {
                error!("journal fault, fencing node: {}", fault);
                self.fenced.store(true, Ordering::SeqCst);
                Err(Error::Journal(fault.0))
            }
        }
    }
}
