// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Staging of large streamed parameters (LOBs).
//!
//! A streamed parameter can only be read once from the client, but a
//! fan-out write needs to hand the same bytes to every backend. So streams
//! are staged: captured once into a scope-owned buffer, then fetched as
//! many times as there are backends. A scope is owned by the proxy node
//! that created it (a statement, typically) and is released wholesale when
//! that node closes; individual tokens are not tracked beyond that.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::Read,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

/// Handle for one staged stream, valid within its scope until release.
#[derive(Clone, Copy, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagedToken(pub u64);

/// One proxy node's staging area. All tokens issued by a scope die together
/// when [StagingScope::release] runs.
pub trait StagingScope: Send + Sync + 'static {
    /// Drain `src` into the scope, returning a token for repeated fetching.
    fn stage(&self, src: &mut dyn Read) -> Result<StagedToken, Error>;

    /// Fetch a staged stream's bytes. Fetching does not consume the token.
    fn fetch(&self, token: StagedToken) -> Result<Vec<u8>, Error>;

    /// Discard everything staged in this scope. Idempotent.
    fn release(&self);
}

/// Factory for [StagingScope]s, held by the [crate::Cluster] and consulted
/// whenever a statement-level proxy node is created.
pub trait Staging: Send + Sync + 'static {
    fn open_scope(&self) -> Arc<dyn StagingScope>;
}

/// Heap-buffer staging. Fine for moderate LOBs; an implementation backed by
/// temporary files would implement the same traits.
#[derive(Clone, Default)]
pub struct BufferStaging;

impl Staging for BufferStaging {
    fn open_scope(&self) -> Arc<dyn StagingScope> {
        Arc::new(BufferScope::default())
    }
}

#[derive(Default)]
struct BufferScope {
    next: AtomicU64,
    staged: Mutex<BTreeMap<StagedToken, Vec<u8>>>,
}

impl StagingScope for BufferScope {
    fn stage(&self, src: &mut dyn Read) -> Result<StagedToken, Error> {
        let mut buf = Vec::new();
        src.read_to_end(&mut buf)
            .map_err(|e| Error::Protocol(format!("staging stream failed: {}", e)))?;
        let token = StagedToken(self.next.fetch_add(1, Ordering::SeqCst));
        match self.staged.lock() {
            Ok(mut staged) => {
                staged.insert(token, buf);
                Ok(token)
            }
            Err(_) => Err(Error::Protocol("staging scope poisoned".into())),
        }
    }

    fn fetch(&self, token: StagedToken) -> Result<Vec<u8>, Error> {
        match self.staged.lock() {
            Ok(staged) => match staged.get(&token) {
                Some(buf) => Ok(buf.clone()),
                None => Err(Error::Protocol(format!(
                    "no staged stream for {:?}",
                    token
                ))),
            },
            Err(_) => Err(Error::Protocol("staging scope poisoned".into())),
        }
    }

    fn release(&self) {
        if let Ok(mut staged) = self.staged.lock() {
            staged.clear();
        }
    }
}
