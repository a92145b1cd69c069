// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The invocation fan-out engine: every client call enters through
//! [Cluster::invoke], gets a strategy from the static tables in
//! [crate::strategy], and is spread over the ACTIVE backends accordingly.
//!
//! The failure policy differs sharply between reads and writes. A failed
//! read proves nothing about divergence (the backend may just be busy), so
//! reads never deactivate anyone. A write that fails on one backend while
//! succeeding on a peer is exactly divergence: the failing backend is
//! quarantined for resynchronization and the caller still sees success,
//! carrying the designated primary's result. Only when a write fails
//! everywhere does the caller see the failure, and then nobody is
//! deactivated: unanimous failure is consistency.
//!
//! Cluster-structural operations additionally bracket their dispatch in the
//! cluster-global decree lock, serializing them across all members.

use crate::{
    strategy_for, BackendId, Cluster, DispatchMode, Driver, Error, InvocationEvent,
    InvocationPhase, InvokerEvent, Journal, JournalRecord, LockManager, Op, ProxyNode, Snapshot,
    Strategy, SyncBoxFuture, TxnId,
};
use async_std::{sync::Arc, task};
use futures::{stream::FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use tracing::{debug, debug_span, info, warn, Instrument};

impl<D: Driver, J: Journal> Cluster<D, J> {
    // See crate::SyncBoxFuture for explanation of this wrapper function.
    pub fn invoke(
        &self,
        node: &Arc<ProxyNode<D>>,
        op: D::Op,
    ) -> SyncBoxFuture<Result<D::Val, Error>> {
        let this = self.clone();
        let node = node.clone();
        let span = debug_span!("invoke", kind=?node.kind, op=%op.name());
        Box::pin(async move { this.invoke_(node, op).instrument(span).await })
    }

    async fn invoke_(&self, node: Arc<ProxyNode<D>>, op: D::Op) -> Result<D::Val, Error> {
        if node.is_closed() {
            return Err(Error::Protocol("resource is closed".into()));
        }
        let strategy = strategy_for(node.kind, op.name(), node.read_only);
        debug!("selected {:?}", strategy);

        if op.is_structural() {
            // Serialize structural operations cluster-wide. The lock is
            // released even when dispatch fails; a failed release only
            // warns, since there is nothing useful to do about a broken
            // transport here beyond surfacing the operation's own outcome.
            self.locks
                .acquire(LockManager::GLOBAL, self.config.lock_timeout)
                .await?;
            let res = self.run_strategy_(strategy, &node, &op).await;
            if let Err(e) = self.locks.release(LockManager::GLOBAL).await {
                warn!("failed to release cluster-global lock: {:?}", e);
            }
            res
        } else {
            self.run_strategy_(strategy, &node, &op).await
        }
    }

    async fn run_strategy_(
        &self,
        strategy: Strategy,
        node: &Arc<ProxyNode<D>>,
        op: &D::Op,
    ) -> Result<D::Val, Error> {
        match strategy {
            Strategy::SingleRead => self.single_read_(node, op).await,
            Strategy::PerBackendRead => self.per_backend_read_(node, op).await,
            Strategy::FanOutWrite => {
                self.check_fence()?;
                self.fan_out_write_(node, op, None).await
            }
            Strategy::TransactionalWrite => {
                self.check_fence()?;
                self.transactional_write_(node, op).await
            }
        }
    }

    // Read the designated primary; its failure is the caller's failure.
    async fn single_read_(&self, node: &Arc<ProxyNode<D>>, op: &D::Op) -> Result<D::Val, Error> {
        let primary = match self.registry.read().await.primary() {
            Some(id) => id,
            None => return Err(Error::NoActiveBackends),
        };
        self.invoke_one_(node, op, primary).await
    }

    // Execute on every ACTIVE backend, with no agreement, journaling or
    // deactivation: reads prove nothing about divergence. Used for
    // inspection calls and queries, which must still touch each backend so
    // per-backend handle state (cursors especially) stays aligned. The
    // visible result is the primary's, or the first success if the primary
    // failed.
    async fn per_backend_read_(
        &self,
        node: &Arc<ProxyNode<D>>,
        op: &D::Op,
    ) -> Result<D::Val, Error> {
        let ids = self.registry.read().await.active_ids();
        if ids.is_empty() {
            return Err(Error::NoActiveBackends);
        }
        let outcomes = self.dispatch_(node, op, &ids).await;
        let mut errors = Vec::new();
        let mut first_ok = None;
        for (id, res) in outcomes {
            match res {
                Ok(val) => {
                    if first_ok.is_none() {
                        first_ok = Some(val);
                    }
                }
                Err(e) => {
                    debug!("read failed on {:?}: {:?}", id, e);
                    errors.push(e);
                }
            }
        }
        match first_ok {
            Some(val) => Ok(val),
            None => Err(Error::aggregate(errors)),
        }
    }

    // Execute on every ACTIVE backend. With a journal transaction supplied,
    // each backend's outcome is recorded as it lands. Divergent failures
    // quarantine; unanimous failure surfaces without deactivating.
    async fn fan_out_write_(
        &self,
        node: &Arc<ProxyNode<D>>,
        op: &D::Op,
        txn: Option<TxnId>,
    ) -> Result<D::Val, Error> {
        let ids = self.registry.read().await.active_ids();
        if ids.is_empty() {
            return Err(Error::NoActiveBackends);
        }
        let outcomes = self.dispatch_(node, op, &ids).await;

        if let Some(txn) = txn {
            for (id, res) in outcomes.iter() {
                self.journal_append(JournalRecord::Invoker(InvokerEvent {
                    txn,
                    backend: *id,
                    completed: res.is_ok(),
                    result: res.as_ref().ok().map(Snapshot::capture),
                    exception: res.as_ref().err().map(Snapshot::capture),
                }))?;
            }
        }

        let any_ok = outcomes.iter().any(|(_, r)| r.is_ok());
        if any_ok {
            // Divergence: quarantine each backend that missed the write.
            for (id, res) in outcomes.iter() {
                if let Err(e) = res {
                    info!("write diverged on {:?}, quarantining: {:?}", id, e);
                    self.registry.write().await.quarantine(*id);
                }
            }
            // The visible result is the primary's (the first dispatched
            // backend), or the first success if the primary itself failed.
            let first_ok = outcomes.into_iter().find_map(|(_, r)| r.ok());
            match first_ok {
                Some(val) => Ok(val),
                None => Err(Error::NoActiveBackends),
            }
        } else {
            let errors = outcomes.into_iter().filter_map(|(_, r)| r.err()).collect();
            Err(Error::aggregate(errors))
        }
    }

    // A fan-out write bracketed in the durability journal: Start, one
    // pre-image invoker record per backend, the superseding outcomes, End.
    // A consistent outcome (all completed, or none) drops the records
    // immediately; a divergent one retains them until resync completes.
    async fn transactional_write_(
        &self,
        node: &Arc<ProxyNode<D>>,
        op: &D::Op,
    ) -> Result<D::Val, Error> {
        let ids = self.registry.read().await.active_ids();
        if ids.is_empty() {
            return Err(Error::NoActiveBackends);
        }
        let txn = self.next_txn();
        debug!("journaling {:?} for {}", txn, op.name());
        self.journal_append(JournalRecord::Invocation(InvocationEvent {
            txn,
            phase: InvocationPhase::Start,
        }))?;
        for id in ids.iter() {
            self.journal_append(JournalRecord::Invoker(InvokerEvent {
                txn,
                backend: *id,
                completed: false,
                result: None,
                exception: None,
            }))?;
        }

        let res = self.fan_out_write_(node, op, Some(txn)).await;

        self.journal_append(JournalRecord::Invocation(InvocationEvent {
            txn,
            phase: InvocationPhase::End,
        }))?;

        // Divergent transactions keep their records; everything else is
        // settled and the records would only slow the next recovery scan.
        let diverged = res.is_ok() && !self.registry.read().await.active_ids().eq(&ids);
        if !diverged {
            if let Err(fault) = self.journal.delete_txn(txn) {
                warn!("failed to drop settled {:?}: {}", txn, fault);
            }
        }
        res
    }

    // Spread one call over `ids`, per the configured dispatch mode.
    // Outcomes come back in registry order either way.
    async fn dispatch_(
        &self,
        node: &Arc<ProxyNode<D>>,
        op: &D::Op,
        ids: &[BackendId],
    ) -> Vec<(BackendId, Result<D::Val, Error>)> {
        match self.config.dispatch {
            DispatchMode::Sequential => {
                let mut outcomes = Vec::new();
                for id in ids {
                    outcomes.push((*id, self.invoke_one_(node, op, *id).await));
                }
                outcomes
            }
            DispatchMode::Parallel => {
                let mut tasks = FuturesUnordered::new();
                for id in ids {
                    let this = self.clone();
                    let node = node.clone();
                    let op = op.clone();
                    let id = *id;
                    tasks.push(task::spawn(async move {
                        (id, this.invoke_one_(&node, &op, id).await)
                    }));
                }
                let mut by_id = BTreeMap::new();
                while let Some((id, res)) = tasks.next().await {
                    by_id.insert(id, res);
                }
                ids.iter()
                    .filter_map(|id| by_id.remove(id).map(|r| (*id, r)))
                    .collect()
            }
        }
    }

    // One synchronous driver call on one backend, through the node's
    // lazily-created handle.
    async fn invoke_one_(
        &self,
        node: &Arc<ProxyNode<D>>,
        op: &D::Op,
        id: BackendId,
    ) -> Result<D::Val, Error> {
        let handle = self.backend_handle(node, id).await?;
        let driver = match self.registry.read().await.driver(id) {
            Some(d) => d,
            None => return Err(Error::BackendNotActive(id)),
        };
        driver
            .invoke(&handle, op)
            .map_err(|e| Error::Backend(id, e.to_string()))
    }
}
