// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The durability journal and crash recovery.
//!
//! Every transactional fan-out write is bracketed in the journal: a start
//! event before any backend is touched, one invoker event per backend as it
//! responds (completed flag plus a snapshot of the result or exception),
//! and an end event once every backend has answered. Invoker events are
//! "updated" by appending a superseding record; the latest record per
//! `(txn, backend)` wins, so the journal only ever appends.
//!
//! On restart, [Cluster::recover] scans the journal. A transaction whose
//! records show every backend agreeing (all completed, or none did) is
//! harmless and its records are discarded. A transaction where some backend
//! completed a write that another missed is real divergence: the lagging
//! backends are quarantined for full resynchronization and the transaction
//! is retained until [Cluster::resync_complete] confirms the repair.
//! Recovery never replays operations; backend calls are not assumed
//! idempotent or deterministic.
//!
//! A journal fault mid-write is fatal to the node: without the journal we
//! cannot promise to detect divergence, so the cluster fences itself and
//! refuses further writes until restarted.

use crate::{BackendId, BackendState, Cluster, Driver, MemberId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{info, warn};

/// Cluster-unique transaction identifier: the originating member plus a
/// member-local sequence number.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId {
    pub member: MemberId,
    pub seq: u64,
}

impl std::fmt::Debug for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("txn:{:?}/{}", self.member, self.seq))
    }
}

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvocationPhase {
    Start,
    End,
}

/// Brackets one transactional fan-out write: a `Start` before the first
/// backend call, an `End` after every backend has responded.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationEvent {
    pub txn: TxnId,
    pub phase: InvocationPhase,
}

/// A serialized result or exception captured for the journal.
///
/// Values that refuse to serialize are not an error: we degrade to
/// recording their type name, which is still enough for recovery (recovery
/// only ever compares completion, never replays results).
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Snapshot {
    Value(Vec<u8>),
    TypeOnly(String),
}

impl Snapshot {
    pub fn capture<T: Serialize>(val: &T) -> Snapshot {
        match serde_json::to_vec(val) {
            Ok(bytes) => Snapshot::Value(bytes),
            Err(_) => Snapshot::TypeOnly(std::any::type_name::<T>().to_string()),
        }
    }
}

/// The per-backend record inside a transaction: whether this backend's
/// invocation ran to completion, and what it produced. Appended first with
/// `completed: false` before the backend call, superseded with the outcome
/// after.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvokerEvent {
    pub txn: TxnId,
    pub backend: BackendId,
    pub completed: bool,
    pub result: Option<Snapshot>,
    pub exception: Option<Snapshot>,
}

impl InvokerEvent {
    /// Supersession key: the latest journal record with this key wins.
    pub fn key(&self) -> (TxnId, BackendId) {
        (self.txn, self.backend)
    }
}

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JournalRecord {
    Invocation(InvocationEvent),
    Invoker(InvokerEvent),
}

impl JournalRecord {
    pub fn txn(&self) -> TxnId {
        match self {
            JournalRecord::Invocation(e) => e.txn,
            JournalRecord::Invoker(e) => e.txn,
        }
    }
}

/// A failure of the journal itself (not of any backend). Always fatal to
/// the node; see the module docs.
#[derive(Error, Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[error("journal fault: {0}")]
pub struct JournalFault(pub String);

/// The durable, ordered record store underneath the cluster. Implementors
/// must make [Journal::append] durable before returning, and must preserve
/// append order in [Journal::records]: recovery depends on later records
/// superseding earlier ones.
pub trait Journal: Send + Sync + 'static {
    fn append(&self, record: JournalRecord) -> Result<(), JournalFault>;

    /// All records, in append order.
    fn records(&self) -> Result<Vec<JournalRecord>, JournalFault>;

    /// Drop every record belonging to `txn`.
    fn delete_txn(&self, txn: TxnId) -> Result<(), JournalFault>;
}

/// What [Cluster::recover] found and did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Backends flagged for resynchronization.
    pub quarantined: Vec<BackendId>,
    /// Transactions whose backends all agreed; records dropped.
    pub discarded: Vec<TxnId>,
    /// Divergent transactions kept until resync completes.
    pub retained: Vec<TxnId>,
}

// Per-transaction view reconstructed from the journal: the latest invoker
// record per backend, and whether the bracketing End was written.
struct TxnView {
    ended: bool,
    invokers: BTreeMap<BackendId, InvokerEvent>,
}

impl TxnView {
    fn new() -> Self {
        TxnView {
            ended: false,
            invokers: BTreeMap::new(),
        }
    }

    // Backends this transaction touched that did not complete. A backend
    // with a Start-phase record but no completed outcome counts: we cannot
    // know whether its write landed.
    fn incomplete(&self) -> BTreeSet<BackendId> {
        self.invokers
            .values()
            .filter(|ev| !ev.completed)
            .map(|ev| ev.backend)
            .collect()
    }

    fn any_completed(&self) -> bool {
        self.invokers.values().any(|ev| ev.completed)
    }

    // Divergent iff some backend completed the write while another touched
    // by the same transaction did not. All-completed and none-completed are
    // both consistent outcomes (the latter: the write happened nowhere).
    fn divergent(&self) -> bool {
        self.any_completed() && (!self.ended || !self.incomplete().is_empty())
    }
}

fn scan(records: &[JournalRecord]) -> BTreeMap<TxnId, TxnView> {
    let mut txns: BTreeMap<TxnId, TxnView> = BTreeMap::new();
    for rec in records {
        let view = txns.entry(rec.txn()).or_insert_with(TxnView::new);
        match rec {
            JournalRecord::Invocation(ev) => {
                if ev.phase == InvocationPhase::End {
                    view.ended = true;
                }
            }
            // Later records supersede earlier ones with the same key.
            JournalRecord::Invoker(ev) => {
                view.invokers.insert(ev.backend, ev.clone());
            }
        }
    }
    txns
}

impl<D: Driver, J: Journal> Cluster<D, J> {
    /// Scan the journal for transactions interrupted by a crash, quarantine
    /// any backend that missed a write a peer completed, and discard the
    /// records of transactions whose backends all agreed.
    ///
    /// Intended to run once at startup, before the cluster serves calls.
    pub async fn recover(&self) -> Result<RecoveryReport, JournalFault> {
        let records = self.journal.records()?;
        let txns = scan(&records);
        let mut report = RecoveryReport::default();

        for (txn, view) in txns.iter() {
            if view.divergent() {
                let lagging = view.incomplete();
                warn!("recovery: {:?} diverged, lagging backends {:?}", txn, lagging);
                let mut reg = self.registry.write().await;
                let known = reg.all_ids();
                for id in lagging {
                    // A record can outlive a configuration change; records
                    // naming a departed backend stay retained, since nobody
                    // will ever resync it.
                    if !known.contains(&id) {
                        warn!("recovery: {:?} names unknown backend {:?}", txn, id);
                        continue;
                    }
                    if reg.quarantine(id) && !report.quarantined.contains(&id) {
                        report.quarantined.push(id);
                    }
                }
                report.retained.push(*txn);
            } else {
                self.journal.delete_txn(*txn)?;
                report.discarded.push(*txn);
            }
        }
        info!(
            "recovery: {} discarded, {} retained, {} quarantined",
            report.discarded.len(),
            report.retained.len(),
            report.quarantined.len()
        );
        Ok(report)
    }

    /// Mark a backend's resynchronization finished: reactivate it, then
    /// drop any retained transaction whose lagging backends have now all
    /// been repaired.
    pub async fn resync_complete(&self, id: BackendId) -> Result<bool, JournalFault> {
        let activated = self.registry.write().await.activate(id);
        if !activated {
            return Ok(false);
        }
        let records = self.journal.records()?;
        let txns = scan(&records);
        let reg = self.registry.read().await;
        for (txn, view) in txns.iter() {
            let repaired = view
                .incomplete()
                .iter()
                .all(|b| reg.state(*b) == Some(BackendState::Active));
            if repaired {
                info!("recovery: {:?} repaired, dropping records", txn);
                self.journal.delete_txn(*txn)?;
            }
        }
        Ok(true)
    }
}
