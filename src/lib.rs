// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This is a work-in-progress implementation of the core of a "fan-out"
//! high-availability database endpoint: one logical database backed by a
//! cluster of independent, unmodified relational backends. Every client
//! operation is executed against all (or a chosen subset of) the backends,
//! individual backend failures are masked, and members that diverge are
//! detected and scheduled for repair.
//!
//! There is deliberately no query engine and no replication protocol of our
//! own here; the backends are ordinary single-node databases and we drive
//! them through a client-supplied [Driver]. What this crate provides is the
//! hard connective tissue between them:
//!
//!   - An invocation fan-out engine with a small set of per-call strategies
//!     (single-backend read, per-backend read, fan-out write, transactional
//!     write), selected by a static method-name lookup rather than any kind
//!     of runtime proxying.
//!
//!   - A hierarchical resource-proxy model: a connection owns statements,
//!     statements own result cursors, and closing a resource closes all of
//!     its owned descendants deterministically, even in the face of
//!     individual close failures.
//!
//!   - A distributed lock manager for cluster-structural operations, built
//!     as a two-phase decree broadcast (prepare/commit/abort) over a
//!     reliable group [Messenger] with only per-origin FIFO ordering.
//!
//!   - A durability journal that brackets every multi-backend write with
//!     begin/end events and per-backend invoker events, so that a crash in
//!     the middle of a fan-out write can never leave *silent* divergence:
//!     on restart the journal is scanned and any backend that missed a
//!     write its peers completed is flagged for full resynchronization.
//!
//! ## Summary
//!
//! The short version of the write path is:
//!
//!   - A call enters the proxy hierarchy at some node and a strategy is
//!     chosen from its method name.
//!
//!   - The strategy consults the [Registry] for ACTIVE backends and fans
//!     the call out, in parallel or sequentially (a configuration choice).
//!
//!   - Transactional writes are bracketed in the [Journal]: a start event,
//!     one invoker event per backend (completed flag plus a result or
//!     exception snapshot), and an end event once every backend responded.
//!
//!   - A backend that fails while a peer succeeds is deactivated and
//!     flagged SYNCHRONIZING; the caller still sees success, carrying the
//!     designated (primary) backend's result. Divergent results are never
//!     merged, only used to trigger deactivation.
//!
//! ## Caveats
//!
//! Nothing's perfect, and this crate is anything but:
//!
//!  - Resynchronization itself (the bulk data copy that repairs a
//!    SYNCHRONIZING backend) is not here; we only detect divergence and
//!    track the repair lifecycle. Recovery is resync, never replay:
//!    arbitrary backend operations are not assumed idempotent or
//!    deterministic, so we refuse to replay them.
//!
//!  - The group messenger is a contract, not an implementation: we assume
//!    reliable delivery with per-origin FIFO ordering and nothing across
//!    origins. The decree protocol is written to be idempotent and
//!    order-tolerant per decree identity under exactly that assumption.
//!    An in-process [LoopbackMessenger] is provided for single-process
//!    clusters and tests.
//!
//!  - Vendor SQL dialects, metadata caching and the enumeration of the
//!    full relational call surface are the [Driver]'s business, not ours.
//!
//! ## Name
//!
//! Wikipedia:
//!
//! > The Lernaean Hydra is a serpentine lake monster in Greek mythology.
//! > Its many heads grew back when cut off.
//!
//! One body, many heads; losing a head is survivable, and a lost head
//! grows back -- though only after a full regeneration, not a graft.

#![allow(dead_code)]

use futures::Future;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;

mod cluster;
mod driver;
mod durability;
mod fanout;
mod lock;
mod messenger;
mod proxy;
mod registry;
mod staging;
mod strategy;

pub use cluster::{Cluster, ClusterConfig};
pub use driver::{Driver, Op};
pub use durability::{
    InvocationEvent, InvocationPhase, InvokerEvent, Journal, JournalFault, JournalRecord,
    RecoveryReport, Snapshot, TxnId,
};
pub use lock::{DecreeKind, DecreePhase, LockDecree, LockManager};
pub use messenger::{DecreeHandler, LoopbackMessenger, MemberId, Messenger, Vote};
pub use proxy::{ProxyNode, ResourceKind};
pub use registry::{Backend, BackendId, BackendState, Registry};
pub use staging::{BufferStaging, StagedToken, Staging, StagingScope};
pub use strategy::{strategy_for, DispatchMode, Strategy};

/// Errors surfaced by cluster operations.
///
/// Per-backend failures are non-fatal to an operation as long as some other
/// backend succeeds; they are retained in the [Error::AllBackends] and
/// [Error::Close] aggregates rather than dropped. A [Error::Journal] failure
/// is fatal to the whole node: it fences further writes until a restart
/// resynchronizes it.
#[derive(Error, Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Error {
    #[error("backend {0:?} failed: {1}")]
    Backend(BackendId, String),
    #[error("backend {0:?} is not active")]
    BackendNotActive(BackendId),
    #[error("no active backends")]
    NoActiveBackends,
    #[error("all backends failed")]
    AllBackends(Vec<Error>),
    #[error("failed to close {} resources", .0.len())]
    Close(Vec<Error>),
    #[error("lock acquisition timed out")]
    LockTimeout,
    #[error("cluster communication failed")]
    ClusterComm,
    #[error("durability journal failure: {0}")]
    Journal(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl Error {
    /// Collapse a set of per-backend errors into the error we surface when
    /// an operation fails everywhere: a lone failure is surfaced unchanged,
    /// anything else becomes an [Error::AllBackends] aggregate.
    pub(crate) fn aggregate(mut errors: Vec<Error>) -> Error {
        match errors.len() {
            0 => Error::NoActiveBackends,
            1 => match errors.pop() {
                Some(e) => e,
                None => Error::NoActiveBackends,
            },
            _ => Error::AllBackends(errors),
        }
    }
}

// We define a BoxFuture-like wrapper type here and wrap most of our nontrivial
// async fn calls in it, for compilation and code footprint reasons: it costs an
// extra heap allocation per async call, but means the library compiles faster,
// can handle recursive futures (the proxy hierarchy is recursive), and doesn't
// require compiler pragmas to override the maximum allowed type size.
//
// We don't use the standard BoxFuture type because we want our boxed futures to
// also implement Sync, which the standard one doesn't.
type SyncBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static + Send + Sync>>;
