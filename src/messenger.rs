// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The contract with the reliable group-messaging transport, and an
//! in-process loopback implementation of it.
//!
//! The transport itself (wire protocol, membership discovery, failure
//! detection) is outside this crate; what we rely on is narrow: delivery is
//! reliable (never silently dropped), FIFO per origin, and unordered across
//! origins. The decree protocol in [crate::lock] is written to be correct
//! under exactly that guarantee -- prepare/commit/abort are idempotent and
//! order-tolerant per decree identity.

use crate::{lock::LockDecree, Error, SyncBoxFuture};
use async_std::sync::{Arc, RwLock};
use serde::{Deserialize, Serialize};

/// A simple member identifier, unique across any present or future
/// configuration of the peer group. A randomly-chosen u64 should suffice.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberId(pub u64);

impl std::fmt::Debug for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("#{}", self.0))
    }
}

/// One member's vote in a prepare round.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote {
    pub member: MemberId,
    pub granted: bool,
}

/// The sending side of the transport: broadcast a decree round to every
/// member (including the origin) and, for prepare, aggregate the votes.
///
/// A transport error from [Messenger::prepare] is treated by callers as an
/// implicit abort of the decree.
pub trait Messenger: Send + Sync + 'static {
    fn prepare(&self, decree: LockDecree) -> SyncBoxFuture<Result<Vec<Vote>, Error>>;
    fn commit(&self, decree: LockDecree) -> SyncBoxFuture<Result<(), Error>>;
    fn abort(&self, decree: LockDecree) -> SyncBoxFuture<Result<(), Error>>;
}

/// The receiving side: what each member exposes to the transport. The
/// [crate::LockManager] implements this.
pub trait DecreeHandler: Send + Sync + 'static {
    fn handle_prepare(&self, decree: LockDecree) -> SyncBoxFuture<Result<bool, Error>>;
    fn handle_commit(&self, decree: LockDecree) -> SyncBoxFuture<Result<(), Error>>;
    fn handle_abort(&self, decree: LockDecree) -> SyncBoxFuture<Result<(), Error>>;
}

/// An in-process [Messenger] that delivers decrees directly to a set of
/// registered [DecreeHandler]s, in registration order. Delivery is
/// synchronous and sequential, which trivially satisfies the per-origin
/// FIFO contract. Useful for single-process clusters and for tests.
#[derive(Clone)]
pub struct LoopbackMessenger {
    members: Arc<RwLock<Vec<(MemberId, Arc<dyn DecreeHandler>)>>>,
}

impl LoopbackMessenger {
    pub fn new() -> Self {
        LoopbackMessenger {
            members: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a member's receive side. Should happen before any decree
    /// traffic; membership changes mid-decree are not supported here.
    pub async fn join(&self, member: MemberId, handler: Arc<dyn DecreeHandler>) {
        self.members.write().await.push((member, handler));
    }
}

impl Default for LoopbackMessenger {
    fn default() -> Self {
        LoopbackMessenger::new()
    }
}

impl Messenger for LoopbackMessenger {
    fn prepare(&self, decree: LockDecree) -> SyncBoxFuture<Result<Vec<Vote>, Error>> {
        let members = self.members.clone();
        Box::pin(async move {
            let mut votes = Vec::new();
            for (member, handler) in members.read().await.iter() {
                let granted = handler.handle_prepare(decree.clone()).await?;
                votes.push(Vote {
                    member: *member,
                    granted,
                });
            }
            Ok(votes)
        })
    }

    fn commit(&self, decree: LockDecree) -> SyncBoxFuture<Result<(), Error>> {
        let members = self.members.clone();
        Box::pin(async move {
            for (_, handler) in members.read().await.iter() {
                handler.handle_commit(decree.clone()).await?;
            }
            Ok(())
        })
    }

    fn abort(&self, decree: LockDecree) -> SyncBoxFuture<Result<(), Error>> {
        let members = self.members.clone();
        Box::pin(async move {
            for (_, handler) in members.read().await.iter() {
                handler.handle_abort(decree.clone()).await?;
            }
            Ok(())
        })
    }
}
