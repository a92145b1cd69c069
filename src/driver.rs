// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::Serialize;
use std::fmt::Debug;

/// An `Op` is one logical client call: the unit the fan-out engine
/// dispatches to backends. Clients of this crate define their own operation
/// type (typically an enum over the relational call surface they care
/// about) and implement this trait on it.
///
/// The [Op::name] is what drives strategy selection: it is looked up in the
/// static method-name tables in [crate::strategy], so operations should use
/// the conventional snake_case names those tables list ("commit",
/// "execute_query", "get_metadata", ...). Unknown names fall back to the
/// per-resource-kind default strategy.
pub trait Op: Clone + Debug + Send + Sync + 'static {
    /// Method name used for static strategy lookup.
    fn name(&self) -> &str;

    /// True for cluster-structural calls (schema changes, anything that
    /// invalidates cached metadata cluster-wide). Structural calls are
    /// serialized under the cluster-global lock before dispatch. Detecting
    /// structural SQL is a dialect concern, so the decision lives with the
    /// operation, not in the core.
    fn is_structural(&self) -> bool {
        false
    }
}

/// A `Driver` is the seam between the cluster core and one vendor's actual
/// database client library. Clients of this crate provide an implementation
/// per backend and pass the instances in when registering backends on the
/// [crate::Cluster].
///
/// Drivers are synchronous request/response: the fan-out engine supplies
/// the concurrency around them. The core assumes nothing about the backend
/// beyond this interface -- no backend-side replication, no coordination.
/// Dialect-specific SQL generation is the driver's business; the core only
/// ever hands it the generic [Driver::Op] values the client constructed.
///
/// Handles model backend-local resources (a connection, a statement, a
/// cursor). They are created lazily: [Driver::connect] opens the root
/// (connection-level) handle, and [Driver::derive] creates a child handle
/// from a parent's handle, mirroring the proxy hierarchy one level down
/// on each backend.
pub trait Driver: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;
    type Op: Op;
    type Val: Clone + Debug + Eq + Serialize + Send + Sync + 'static;
    type Err: std::error::Error + Send + Sync + 'static;

    /// Open the root (connection-level) handle on this backend.
    fn connect(&self) -> Result<Self::Handle, Self::Err>;

    /// Create a child resource handle from a parent handle (eg. a statement
    /// from a connection, a cursor from a statement).
    fn derive(&self, parent: &Self::Handle, op: &Self::Op) -> Result<Self::Handle, Self::Err>;

    /// Execute one synchronous call against a handle.
    fn invoke(&self, handle: &Self::Handle, op: &Self::Op) -> Result<Self::Val, Self::Err>;

    /// Close a handle, releasing the backend-local resource.
    fn close(&self, handle: &Self::Handle) -> Result<(), Self::Err>;
}
