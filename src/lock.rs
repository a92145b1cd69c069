// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Named, cluster-wide mutual exclusion without a central lock server.
//!
//! Cluster-structural operations (schema changes, anything invalidating
//! cached metadata) are serialized by broadcasting lock "decrees" through
//! the [Messenger] in two phases:
//!
//!   1. The originator broadcasts a prepare for an ACQUIRE decree on lock
//!      name L. Each member attempts a non-blocking local acquisition of L
//!      and votes.
//!
//!   2. If every vote is true, a commit broadcast follows: each member
//!      records the decree in its pending-decree set, and L is now held
//!      cluster-wide. Any false vote (or any transport failure, which we
//!      treat as an implicit abort) triggers an abort broadcast releasing
//!      whatever was locally prepared.
//!
//! RELEASE decrees always prepare true -- there is no contention on
//! unlocking -- and do their work at commit: unlock locally and remove the
//! entry from the pending-decree set. Their abort is a no-op.
//!
//! The invariant is all-or-nothing: a named lock is either present in every
//! member's pending-decree set or held nowhere. Duplicate deliveries are
//! harmless: local acquisition is idempotent per decree identity
//! (origin, seq), and the pending-set insert/remove are naturally so.

use crate::{DecreeHandler, Error, MemberId, Messenger, SyncBoxFuture, Vote};
use async_std::{
    future,
    sync::{Arc, Mutex},
    task,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracing::{debug, debug_span, warn, Instrument};

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecreeKind {
    Acquire,
    Release,
}

/// Lifecycle of one decree round, as observed by its originator. The
/// transitions are driven by messenger callbacks: Init -> Prepared on a
/// completed vote round, then Committed or Aborted, terminally.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecreePhase {
    Init,
    Prepared,
    Committed,
    Aborted,
}

/// A proposed cluster-wide lock action, broadcast through the two-phase
/// protocol. Identity is `(origin, seq)`: handlers use it to recognize
/// redundant deliveries of the same decree.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockDecree {
    pub name: String,
    pub origin: MemberId,
    pub seq: u64,
    pub kind: DecreeKind,
}

impl LockDecree {
    pub fn identity(&self) -> (MemberId, u64) {
        (self.origin, self.seq)
    }
}

// One decree round in flight on the originator, tracked as an explicit
// state machine so partially-prepared state can be released on timeout.
struct Round {
    decree: LockDecree,
    phase: DecreePhase,
}

/// The local non-blocking lock table underneath the decree protocol.
/// Acquisition is idempotent per decree identity: a redundant prepare from
/// the decree already holding the lock re-votes true without
/// double-acquiring.
#[derive(Default)]
pub(crate) struct LocalLockTable {
    held: HashMap<String, (MemberId, u64)>,
}

impl LocalLockTable {
    pub(crate) fn try_acquire(&mut self, name: &str, identity: (MemberId, u64)) -> bool {
        match self.held.get(name) {
            None => {
                self.held.insert(name.to_string(), identity);
                true
            }
            Some(holder) => *holder == identity,
        }
    }

    pub(crate) fn holder(&self, name: &str) -> Option<(MemberId, u64)> {
        self.held.get(name).cloned()
    }

    pub(crate) fn release(&mut self, name: &str) {
        self.held.remove(name);
    }

    pub(crate) fn release_if_held_by(&mut self, name: &str, identity: (MemberId, u64)) {
        if self.held.get(name) == Some(&identity) {
            self.held.remove(name);
        }
    }
}

/// One member's lock manager: the originator side ([LockManager::acquire],
/// [LockManager::release]) and the participant side (the [DecreeHandler]
/// impl the transport delivers into).
pub struct LockManager {
    pub self_id: MemberId,
    seq: Arc<AtomicU64>,
    messenger: Arc<dyn Messenger>,
    locks: Arc<Mutex<LocalLockTable>>,

    // Decrees currently believed held cluster-wide, keyed by lock name.
    // Mutated only under this mutex; RELEASE commit removal is naturally
    // idempotent.
    pending: Arc<Mutex<BTreeMap<String, LockDecree>>>,
}

impl Clone for LockManager {
    fn clone(&self) -> Self {
        LockManager {
            self_id: self.self_id,
            seq: self.seq.clone(),
            messenger: self.messenger.clone(),
            locks: self.locks.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl LockManager {
    /// The conventional cluster-global lock name, held around any operation
    /// that restructures the cluster itself.
    pub const GLOBAL: &'static str = "";

    const RETRY_DELAY: Duration = Duration::from_millis(50);

    pub fn new(self_id: MemberId, messenger: Arc<dyn Messenger>) -> Self {
        LockManager {
            self_id,
            seq: Arc::new(AtomicU64::new(1)),
            messenger,
            locks: Arc::new(Mutex::new(LocalLockTable::default())),
            pending: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn new_decree(&self, name: &str, kind: DecreeKind) -> LockDecree {
        LockDecree {
            name: name.to_string(),
            origin: self.self_id,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            kind,
        }
    }

    /// Names of the decrees currently believed held cluster-wide.
    pub async fn pending_locks(&self) -> Vec<String> {
        self.pending.lock().await.keys().cloned().collect()
    }

    // See crate::SyncBoxFuture for explanation of this wrapper function.
    pub fn acquire(&self, name: &str, timeout: Duration) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        let name = name.to_string();
        let span = debug_span!("acquire", member=?this.self_id, lock=%name);
        Box::pin(async move { this.acquire_(name, timeout).instrument(span).await })
    }

    async fn acquire_(&self, name: String, timeout: Duration) -> Result<(), Error> {
        // The in-flight decree is shared with the timeout path so that a
        // round interrupted mid-await still gets its abort broadcast,
        // releasing any locally-prepared state on members that voted.
        let inflight: Arc<Mutex<Option<LockDecree>>> = Arc::new(Mutex::new(None));

        let attempt = {
            let this = self.clone();
            let name = name.clone();
            let inflight = inflight.clone();
            async move {
                loop {
                    let decree = this.new_decree(&name, DecreeKind::Acquire);
                    *inflight.lock().await = Some(decree.clone());
                    match this.run_acquire_round(decree).await? {
                        DecreePhase::Committed => {
                            *inflight.lock().await = None;
                            return Ok(());
                        }
                        _ => {
                            // Contention: someone else holds (or is
                            // preparing) the lock. Wait and retry until the
                            // caller's timeout expires.
                            *inflight.lock().await = None;
                            task::sleep(Self::RETRY_DELAY).await;
                        }
                    }
                }
            }
        };

        match future::timeout(timeout, attempt).await {
            Ok(res) => res,
            Err(_) => {
                if let Some(decree) = inflight.lock().await.take() {
                    debug!("aborting timed-out decree {:?}", decree);
                    if let Err(e) = self.messenger.abort(decree).await {
                        warn!("abort broadcast after timeout failed: {:?}", e);
                    }
                }
                Err(Error::LockTimeout)
            }
        }
    }

    // One prepare/commit-or-abort round for an ACQUIRE decree. Returns the
    // terminal phase; transport failure during prepare is an implicit
    // abort.
    async fn run_acquire_round(&self, decree: LockDecree) -> Result<DecreePhase, Error> {
        let mut round = Round {
            decree,
            phase: DecreePhase::Init,
        };
        let votes: Vec<Vote> = match self.messenger.prepare(round.decree.clone()).await {
            Ok(votes) => votes,
            Err(e) => {
                debug!("prepare transport failure, implicit abort: {:?}", e);
                let _ = self.messenger.abort(round.decree.clone()).await;
                return Err(Error::ClusterComm);
            }
        };
        round.phase = DecreePhase::Prepared;
        if votes.is_empty() {
            return Err(Error::Protocol("decree broadcast reached no members".into()));
        }
        if votes.iter().all(|v| v.granted) {
            self.messenger
                .commit(round.decree.clone())
                .await
                .map_err(|_| Error::ClusterComm)?;
            round.phase = DecreePhase::Committed;
            debug!("decree {:?} committed", round.decree);
        } else {
            self.messenger
                .abort(round.decree.clone())
                .await
                .map_err(|_| Error::ClusterComm)?;
            round.phase = DecreePhase::Aborted;
            debug!("decree {:?} aborted by vote", round.decree);
        }
        Ok(round.phase)
    }

    // See crate::SyncBoxFuture for explanation of this wrapper function.
    pub fn release(&self, name: &str) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        let name = name.to_string();
        let span = debug_span!("release", member=?this.self_id, lock=%name);
        Box::pin(async move { this.release_(name).instrument(span).await })
    }

    async fn release_(&self, name: String) -> Result<(), Error> {
        let decree = self.new_decree(&name, DecreeKind::Release);
        // Release prepares always vote true; the round is still broadcast
        // so every member sees the same decree identity.
        self.messenger
            .prepare(decree.clone())
            .await
            .map_err(|_| Error::ClusterComm)?;
        self.messenger
            .commit(decree)
            .await
            .map_err(|_| Error::ClusterComm)?;
        Ok(())
    }
}

impl DecreeHandler for LockManager {
    fn handle_prepare(&self, decree: LockDecree) -> SyncBoxFuture<Result<bool, Error>> {
        let this = self.clone();
        Box::pin(async move {
            match decree.kind {
                DecreeKind::Release => Ok(true),
                DecreeKind::Acquire => {
                    let granted = this
                        .locks
                        .lock()
                        .await
                        .try_acquire(&decree.name, decree.identity());
                    Ok(granted)
                }
            }
        })
    }

    fn handle_commit(&self, decree: LockDecree) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        Box::pin(async move {
            match decree.kind {
                DecreeKind::Acquire => {
                    let held = this.locks.lock().await.holder(&decree.name)
                        == Some(decree.identity());
                    if !held {
                        return Err(Error::Protocol(format!(
                            "commit of unprepared decree {:?}",
                            decree
                        )));
                    }
                    this.pending
                        .lock()
                        .await
                        .insert(decree.name.clone(), decree);
                    Ok(())
                }
                DecreeKind::Release => {
                    this.locks.lock().await.release(&decree.name);
                    this.pending.lock().await.remove(&decree.name);
                    Ok(())
                }
            }
        })
    }

    fn handle_abort(&self, decree: LockDecree) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        Box::pin(async move {
            match decree.kind {
                DecreeKind::Acquire => {
                    this.locks
                        .lock()
                        .await
                        .release_if_held_by(&decree.name, decree.identity());
                    // The abort may arrive after this decree's commit did
                    // (the originator's timeout path aborts whatever is in
                    // flight): the pending entry it installed goes too, or
                    // the lock would read as held here and nowhere else.
                    let mut pending = this.pending.lock().await;
                    if pending.get(&decree.name).map(LockDecree::identity)
                        == Some(decree.identity())
                    {
                        pending.remove(&decree.name);
                    }
                    Ok(())
                }
                // Nothing was prepared for a release; nothing to undo.
                DecreeKind::Release => Ok(()),
            }
        })
    }
}
