// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The hierarchical resource-proxy model.
//!
//! Client-visible resources form a tree: a connection owns statements,
//! statements own result cursors. Each tree node is a [ProxyNode] holding,
//! per backend, the backend-local handle that mirrors it. Handles are
//! created lazily, on the first call that reaches a given backend through a
//! given node, by walking up to the parent's handle and calling
//! [crate::Driver::derive] (or [crate::Driver::connect] at the root).
//!
//! Closing a node is deterministic and total: all descendants close first
//! (depth-first), then the node's own backend handles, then its staging
//! scope is released and it detaches from its parent. Individual close
//! failures are collected, never short-circuited; the caller gets them all
//! in one [Error::Close]. Closing twice is a no-op.

use crate::{
    BackendId, BackendState, Cluster, Driver, Error, Journal, StagingScope, SyncBoxFuture,
};
use async_std::sync::{Arc, Mutex};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Weak,
    },
};
use tracing::{debug, debug_span, Instrument};

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Connection,
    Statement,
    PreparedStatement,
    ResultSet,
}

impl ResourceKind {
    // Statement-family nodes own a staging scope for streamed parameters.
    pub(crate) fn stages_streams(&self) -> bool {
        matches!(self, ResourceKind::Statement | ResourceKind::PreparedStatement)
    }
}

/// One node in the resource tree. Obtained from [Cluster::open] (roots) and
/// [Cluster::open_child]; always handled through an `Arc`. Ownership runs
/// strictly downward: a parent owns its children, and a child keeps only a
/// weak back-pointer for handle derivation and close-time detach.
pub struct ProxyNode<D: Driver> {
    pub kind: ResourceKind,
    pub(crate) read_only: bool,
    // Non-owning: the parent owns its children, never the reverse.
    pub(crate) parent: Option<Weak<ProxyNode<D>>>,
    // The operation that derives this node's handle from the parent's, on
    // each backend that gets one. None only at the root.
    pub(crate) derive_op: Option<D::Op>,
    pub(crate) handles: Mutex<HashMap<BackendId, D::Handle>>,
    pub(crate) children: Mutex<Vec<Arc<ProxyNode<D>>>>,
    pub(crate) scope: Option<Arc<dyn StagingScope>>,
    closed: AtomicBool,
}

impl<D: Driver> std::fmt::Debug for ProxyNode<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "proxy({:?}{})",
            self.kind,
            if self.is_closed() { ", closed" } else { "" }
        ))
    }
}

impl<D: Driver> ProxyNode<D> {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The staging scope for streamed parameters, present on
    /// statement-family nodes.
    pub fn staging_scope(&self) -> Option<Arc<dyn StagingScope>> {
        self.scope.clone()
    }
}

impl<D: Driver, J: Journal> Cluster<D, J> {
    /// Open a root (connection-level) node. No backend is contacted yet;
    /// per-backend connections appear lazily as calls flow through.
    pub fn open(&self, read_only: bool) -> Arc<ProxyNode<D>> {
        Arc::new(ProxyNode {
            kind: ResourceKind::Connection,
            read_only,
            parent: None,
            derive_op: None,
            handles: Mutex::new(HashMap::new()),
            children: Mutex::new(Vec::new()),
            scope: None,
            closed: AtomicBool::new(false),
        })
    }

    /// Open a child resource under `parent`: the node that will mirror, on
    /// each backend, the handle derived by `op` from the parent's handle.
    pub async fn open_child(
        &self,
        parent: &Arc<ProxyNode<D>>,
        kind: ResourceKind,
        op: D::Op,
    ) -> Result<Arc<ProxyNode<D>>, Error> {
        if parent.is_closed() {
            return Err(Error::Protocol("parent resource is closed".into()));
        }
        let scope = if kind.stages_streams() {
            Some(self.staging.open_scope())
        } else {
            None
        };
        let child = Arc::new(ProxyNode {
            kind,
            read_only: parent.read_only,
            parent: Some(Arc::downgrade(parent)),
            derive_op: Some(op),
            handles: Mutex::new(HashMap::new()),
            children: Mutex::new(Vec::new()),
            scope,
            closed: AtomicBool::new(false),
        });
        parent.children.lock().await.push(child.clone());
        Ok(child)
    }

    // The backend-local handle mirroring `node` on backend `id`, created on
    // first use. Boxed because the parent walk is recursive; see
    // crate::SyncBoxFuture.
    pub(crate) fn backend_handle(
        &self,
        node: &Arc<ProxyNode<D>>,
        id: BackendId,
    ) -> SyncBoxFuture<Result<D::Handle, Error>> {
        let this = self.clone();
        let node = node.clone();
        Box::pin(async move { this.backend_handle_(node, id).await })
    }

    async fn backend_handle_(
        &self,
        node: Arc<ProxyNode<D>>,
        id: BackendId,
    ) -> Result<D::Handle, Error> {
        if node.is_closed() {
            return Err(Error::Protocol("resource is closed".into()));
        }
        let driver = {
            let reg = self.registry.read().await;
            match reg.state(id) {
                Some(BackendState::Active) => match reg.driver(id) {
                    Some(d) => d,
                    None => return Err(Error::BackendNotActive(id)),
                },
                _ => return Err(Error::BackendNotActive(id)),
            }
        };
        if let Some(h) = node.handles.lock().await.get(&id) {
            return Ok(h.clone());
        }
        debug!("creating {:?} handle on {:?}", node.kind, id);
        let created = match (&node.parent, &node.derive_op) {
            (None, _) => driver
                .connect()
                .map_err(|e| Error::Backend(id, e.to_string()))?,
            (Some(weak), Some(op)) => {
                let parent = match weak.upgrade() {
                    Some(p) => p,
                    None => return Err(Error::Protocol("parent resource was dropped".into())),
                };
                let parent_handle = self.backend_handle(&parent, id).await?;
                driver
                    .derive(&parent_handle, op)
                    .map_err(|e| Error::Backend(id, e.to_string()))?
            }
            (Some(_), None) => {
                return Err(Error::Protocol(
                    "child resource with no deriving operation".into(),
                ))
            }
        };
        let mut handles = node.handles.lock().await;
        match handles.get(&id) {
            // Raced with another creator; keep the first handle, close ours.
            Some(h) => {
                let h = h.clone();
                drop(handles);
                let _ = driver.close(&created);
                Ok(h)
            }
            None => {
                handles.insert(id, created.clone());
                Ok(created)
            }
        }
    }

    // See crate::SyncBoxFuture for explanation of this wrapper function.
    pub fn close(&self, node: &Arc<ProxyNode<D>>) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        let node = node.clone();
        let span = debug_span!("close", kind=?node.kind);
        Box::pin(async move { this.close_(node).instrument(span).await })
    }

    async fn close_(&self, node: Arc<ProxyNode<D>>) -> Result<(), Error> {
        if node.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut errors = Vec::new();

        let children: Vec<_> = std::mem::take(&mut *node.children.lock().await);
        for child in children {
            if let Err(e) = self.close(&child).await {
                match e {
                    Error::Close(nested) => errors.extend(nested),
                    other => errors.push(other),
                }
            }
        }

        let handles: HashMap<_, _> = std::mem::take(&mut *node.handles.lock().await);
        {
            let reg = self.registry.read().await;
            for (id, handle) in handles {
                if let Some(driver) = reg.driver(id) {
                    if let Err(e) = driver.close(&handle) {
                        errors.push(Error::Backend(id, e.to_string()));
                    }
                }
            }
        }

        if let Some(scope) = &node.scope {
            scope.release();
        }
        if let Some(parent) = node.parent.as_ref().and_then(Weak::upgrade) {
            parent
                .children
                .lock()
                .await
                .retain(|c| !Arc::ptr_eq(c, &node));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Close(errors))
        }
    }
}
