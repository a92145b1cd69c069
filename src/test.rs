// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use hydra::{
    BackendId, BackendState, BufferStaging, Cluster, ClusterConfig, DecreeHandler, DecreeKind,
    Driver, Error, InvocationEvent, InvocationPhase, InvokerEvent, Journal, JournalFault,
    JournalRecord, LockDecree, LockManager, LoopbackMessenger, MemberId, Op, ResourceKind,
    Snapshot, TxnId,
};

use async_std::task;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::info;

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum MemOp {
    Put(String, u64),
    Get(String),
    SetAutoCommit(bool),
    Commit,
    CreateStatement,
    OpenCursor,
    Next,
    Ddl(String),
}

impl Op for MemOp {
    fn name(&self) -> &str {
        match self {
            MemOp::Put(_, _) | MemOp::Ddl(_) => "execute_update",
            MemOp::Get(_) => "execute_query",
            MemOp::SetAutoCommit(_) => "set_auto_commit",
            MemOp::Commit => "commit",
            MemOp::CreateStatement => "create_statement",
            MemOp::OpenCursor => "get_result_set",
            MemOp::Next => "next",
        }
    }
    fn is_structural(&self) -> bool {
        matches!(self, MemOp::Ddl(_))
    }
}

#[derive(Error, Debug)]
#[error("{0}")]
struct MemErr(String);

// One simulated backend's mutable innards, shared between the driver the
// cluster owns and the test's assertions.
#[derive(Default)]
struct MemState {
    kv: BTreeMap<String, u64>,
    open_handles: BTreeSet<u64>,
    fail_writes: bool,
    fail_all: bool,
    fail_close: bool,
    fail_close_handles: BTreeSet<u64>,
}

struct MemDriver {
    state: Arc<Mutex<MemState>>,
    next_handle: AtomicU64,
}

impl MemDriver {
    fn new(state: Arc<Mutex<MemState>>) -> Self {
        MemDriver {
            state,
            next_handle: AtomicU64::new(1),
        }
    }

    fn open_handle(&self) -> Result<u64, MemErr> {
        let mut st = self.state.lock().unwrap();
        if st.fail_all {
            return Err(MemErr("backend unreachable".into()));
        }
        let h = self.next_handle.fetch_add(1, Ordering::SeqCst);
        st.open_handles.insert(h);
        Ok(h)
    }
}

impl Driver for MemDriver {
    type Handle = u64;
    type Op = MemOp;
    type Val = u64;
    type Err = MemErr;

    fn connect(&self) -> Result<u64, MemErr> {
        self.open_handle()
    }

    fn derive(&self, _parent: &u64, _op: &MemOp) -> Result<u64, MemErr> {
        self.open_handle()
    }

    fn invoke(&self, _handle: &u64, op: &MemOp) -> Result<u64, MemErr> {
        let mut st = self.state.lock().unwrap();
        if st.fail_all {
            return Err(MemErr("backend unreachable".into()));
        }
        match op {
            MemOp::Put(k, v) => {
                if st.fail_writes {
                    return Err(MemErr("write refused".into()));
                }
                st.kv.insert(k.clone(), *v);
                Ok(1)
            }
            MemOp::Get(k) => Ok(st.kv.get(k).copied().unwrap_or(0)),
            MemOp::SetAutoCommit(_) | MemOp::Commit | MemOp::Ddl(_) => {
                if st.fail_writes {
                    return Err(MemErr("write refused".into()));
                }
                Ok(0)
            }
            MemOp::CreateStatement | MemOp::OpenCursor | MemOp::Next => Ok(0),
        }
    }

    fn close(&self, handle: &u64) -> Result<(), MemErr> {
        let mut st = self.state.lock().unwrap();
        if st.fail_close || st.fail_close_handles.contains(handle) {
            return Err(MemErr("close refused".into()));
        }
        st.open_handles.remove(handle);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MemJournal {
    records: Arc<Mutex<Vec<JournalRecord>>>,
    fail: Arc<AtomicBool>,
}

impl Journal for MemJournal {
    fn append(&self, record: JournalRecord) -> Result<(), JournalFault> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(JournalFault("disk full".into()));
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }

    fn records(&self) -> Result<Vec<JournalRecord>, JournalFault> {
        Ok(self.records.lock().unwrap().clone())
    }

    fn delete_txn(&self, txn: TxnId) -> Result<(), JournalFault> {
        self.records.lock().unwrap().retain(|r| r.txn() != txn);
        Ok(())
    }
}

struct Sim {
    cluster: Cluster<MemDriver, MemJournal>,
    journal: MemJournal,
    messenger: LoopbackMessenger,
    states: BTreeMap<BackendId, Arc<Mutex<MemState>>>,
}

async fn mk_sim(n: u64, config: ClusterConfig) -> Sim {
    let messenger = LoopbackMessenger::new();
    let journal = MemJournal::default();
    let cluster = Cluster::new(
        MemberId(1),
        config,
        journal.clone(),
        Arc::new(messenger.clone()),
        Arc::new(BufferStaging),
    );
    messenger
        .join(MemberId(1), Arc::new(cluster.lock_manager().clone()))
        .await;
    let mut states = BTreeMap::new();
    for i in 1..=n {
        let id = BackendId(i);
        let state: Arc<Mutex<MemState>> = Arc::new(Mutex::new(MemState::default()));
        states.insert(id, state.clone());
        cluster.add_backend(id, MemDriver::new(state)).await;
    }
    Sim {
        cluster,
        journal,
        messenger,
        states,
    }
}

fn setup_tracing_subscriber() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn value_on(sim: &Sim, id: BackendId, key: &str) -> Option<u64> {
    sim.states[&id].lock().unwrap().kv.get(key).copied()
}

fn open_handles_on(sim: &Sim, id: BackendId) -> usize {
    sim.states[&id].lock().unwrap().open_handles.len()
}

pub fn replicated_write_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let sim = mk_sim(3, ClusterConfig::default()).await;
        let conn = sim.cluster.open(false);
        let stmt = sim
            .cluster
            .open_child(&conn, ResourceKind::Statement, MemOp::CreateStatement)
            .await
            .unwrap();

        let n = sim
            .cluster
            .invoke(&stmt, MemOp::Put("a".into(), 7))
            .await
            .unwrap();
        assert_eq!(n, 1);
        for id in [BackendId(1), BackendId(2), BackendId(3)].iter() {
            assert_eq!(value_on(&sim, *id, "a"), Some(7));
        }
        // A settled transaction leaves nothing behind in the journal.
        assert!(sim.journal.records().unwrap().is_empty());

        assert_eq!(
            sim.cluster.invoke(&stmt, MemOp::Get("a".into())).await.unwrap(),
            7
        );

        // Transaction boundaries are connection-level transactional
        // writes; a clean one also settles without journal residue.
        sim.cluster.invoke(&conn, MemOp::Commit).await.unwrap();
        assert!(sim.journal.records().unwrap().is_empty());

        sim.cluster.close(&conn).await.unwrap();
    });
}

pub fn divergent_write_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let sim = mk_sim(2, ClusterConfig::default()).await;
        sim.states[&BackendId(2)].lock().unwrap().fail_writes = true;

        let conn = sim.cluster.open(false);
        let stmt = sim
            .cluster
            .open_child(&conn, ResourceKind::Statement, MemOp::CreateStatement)
            .await
            .unwrap();

        // The caller sees success carrying the primary's result; the
        // lagging backend is quarantined for resync.
        let n = sim
            .cluster
            .invoke(&stmt, MemOp::Put("a".into(), 7))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            sim.cluster.backend_state(BackendId(2)).await,
            Some(BackendState::Synchronizing)
        );
        // Divergent transactions keep their records until repaired.
        assert!(!sim.journal.records().unwrap().is_empty());

        // Repair: fix the backend, copy the data, declare resync done.
        {
            let mut st = sim.states[&BackendId(2)].lock().unwrap();
            st.fail_writes = false;
            st.kv.insert("a".into(), 7);
        }
        assert!(sim.cluster.resync_complete(BackendId(2)).await.unwrap());
        assert_eq!(
            sim.cluster.backend_state(BackendId(2)).await,
            Some(BackendState::Active)
        );
        assert!(sim.journal.records().unwrap().is_empty());
    });
}

pub fn unanimous_failure_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let sim = mk_sim(2, ClusterConfig::default()).await;
        sim.states[&BackendId(1)].lock().unwrap().fail_writes = true;
        sim.states[&BackendId(2)].lock().unwrap().fail_writes = true;

        let conn = sim.cluster.open(false);
        let stmt = sim
            .cluster
            .open_child(&conn, ResourceKind::Statement, MemOp::CreateStatement)
            .await
            .unwrap();

        // Unanimous failure is consistency: the caller sees the error and
        // nobody is deactivated.
        match sim.cluster.invoke(&stmt, MemOp::Put("a".into(), 7)).await {
            Err(Error::AllBackends(errs)) => assert_eq!(errs.len(), 2),
            other => panic!("expected AllBackends, got {:?}", other),
        }
        assert_eq!(
            sim.cluster.backend_state(BackendId(1)).await,
            Some(BackendState::Active)
        );
        assert_eq!(
            sim.cluster.backend_state(BackendId(2)).await,
            Some(BackendState::Active)
        );
        // Nothing completed anywhere, so the journal settles clean.
        assert!(sim.journal.records().unwrap().is_empty());
    });
}

pub fn read_failover_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let sim = mk_sim(2, ClusterConfig::default()).await;
        let conn = sim.cluster.open(false);
        let stmt = sim
            .cluster
            .open_child(&conn, ResourceKind::Statement, MemOp::CreateStatement)
            .await
            .unwrap();

        sim.cluster
            .invoke(&stmt, MemOp::Put("a".into(), 7))
            .await
            .unwrap();
        sim.states[&BackendId(1)].lock().unwrap().fail_all = true;

        // The per-backend read masks the dead primary and answers from the
        // peer; a failed read deactivates nobody.
        assert_eq!(
            sim.cluster.invoke(&stmt, MemOp::Get("a".into())).await.unwrap(),
            7
        );
        assert_eq!(
            sim.cluster.backend_state(BackendId(1)).await,
            Some(BackendState::Active)
        );
    });
}

pub fn read_only_downgrade_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let sim = mk_sim(2, ClusterConfig::default()).await;
        let conn = sim.cluster.open(true);
        let stmt = sim
            .cluster
            .open_child(&conn, ResourceKind::Statement, MemOp::CreateStatement)
            .await
            .unwrap();

        // On a read-only connection a write-shaped call runs as a
        // primary-only read: it reaches one backend, not the cluster.
        sim.cluster
            .invoke(&stmt, MemOp::Put("a".into(), 7))
            .await
            .unwrap();
        assert_eq!(value_on(&sim, BackendId(1), "a"), Some(7));
        assert_eq!(value_on(&sim, BackendId(2), "a"), None);
        assert!(sim.journal.records().unwrap().is_empty());
    });
}

pub fn lock_contention_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let messenger = LoopbackMessenger::new();
        let a = LockManager::new(MemberId(1), Arc::new(messenger.clone()));
        let b = LockManager::new(MemberId(2), Arc::new(messenger.clone()));
        messenger.join(MemberId(1), Arc::new(a.clone())).await;
        messenger.join(MemberId(2), Arc::new(b.clone())).await;

        a.acquire("tbl", Duration::from_secs(1)).await.unwrap();
        assert_eq!(a.pending_locks().await, vec!["tbl".to_string()]);

        // Held elsewhere: retries burn down the timeout, then give up.
        match b.acquire("tbl", Duration::from_millis(300)).await {
            Err(Error::LockTimeout) => (),
            other => panic!("expected LockTimeout, got {:?}", other),
        }

        a.release("tbl").await.unwrap();
        assert!(a.pending_locks().await.is_empty());
        b.acquire("tbl", Duration::from_secs(1)).await.unwrap();
        b.release("tbl").await.unwrap();
    });
}

pub fn decree_idempotence_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let messenger = LoopbackMessenger::new();
        let lm = LockManager::new(MemberId(1), Arc::new(messenger.clone()));
        messenger.join(MemberId(1), Arc::new(lm.clone())).await;

        let acq = LockDecree {
            name: "tbl".into(),
            origin: MemberId(9),
            seq: 1,
            kind: DecreeKind::Acquire,
        };

        // Committing a decree nobody prepared is a protocol violation.
        match lm.handle_commit(acq.clone()).await {
            Err(Error::Protocol(_)) => (),
            other => panic!("expected Protocol, got {:?}", other),
        }

        // Redundant deliveries of each phase are harmless.
        assert!(lm.handle_prepare(acq.clone()).await.unwrap());
        assert!(lm.handle_prepare(acq.clone()).await.unwrap());
        lm.handle_commit(acq.clone()).await.unwrap();
        lm.handle_commit(acq.clone()).await.unwrap();
        assert_eq!(lm.pending_locks().await, vec!["tbl".to_string()]);

        let rel = LockDecree {
            name: "tbl".into(),
            origin: MemberId(9),
            seq: 2,
            kind: DecreeKind::Release,
        };
        lm.handle_commit(rel.clone()).await.unwrap();
        lm.handle_commit(rel.clone()).await.unwrap();
        assert!(lm.pending_locks().await.is_empty());

        // A late abort of the released decree has nothing to undo.
        lm.handle_abort(acq).await.unwrap();
    });
}

pub fn late_abort_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let messenger = LoopbackMessenger::new();
        let lm = LockManager::new(MemberId(1), Arc::new(messenger.clone()));
        messenger.join(MemberId(1), Arc::new(lm.clone())).await;

        let acq = LockDecree {
            name: "tbl".into(),
            origin: MemberId(9),
            seq: 1,
            kind: DecreeKind::Acquire,
        };
        assert!(lm.handle_prepare(acq.clone()).await.unwrap());
        lm.handle_commit(acq.clone()).await.unwrap();
        assert_eq!(lm.pending_locks().await, vec!["tbl".to_string()]);

        // An originator that times out aborts its in-flight decree even if
        // the commit already landed here; the abort must undo the whole
        // acquisition, pending entry included, so the lock is free again.
        lm.handle_abort(acq).await.unwrap();
        assert!(lm.pending_locks().await.is_empty());

        let next = LockDecree {
            name: "tbl".into(),
            origin: MemberId(2),
            seq: 1,
            kind: DecreeKind::Acquire,
        };
        assert!(lm.handle_prepare(next.clone()).await.unwrap());
        lm.handle_commit(next).await.unwrap();
        assert_eq!(lm.pending_locks().await, vec!["tbl".to_string()]);
    });
}

pub fn structural_lock_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let config = ClusterConfig {
            lock_timeout: Duration::from_millis(300),
            ..ClusterConfig::default()
        };
        let sim = mk_sim(2, config).await;
        let peer = LockManager::new(MemberId(2), Arc::new(sim.messenger.clone()));
        sim.messenger
            .join(MemberId(2), Arc::new(peer.clone()))
            .await;

        let conn = sim.cluster.open(false);
        let stmt = sim
            .cluster
            .open_child(&conn, ResourceKind::Statement, MemOp::CreateStatement)
            .await
            .unwrap();

        // A structural call takes and releases the cluster-global lock
        // around its dispatch.
        sim.cluster
            .invoke(&stmt, MemOp::Ddl("alter table t".into()))
            .await
            .unwrap();
        assert!(sim.cluster.lock_manager().pending_locks().await.is_empty());

        // With the global lock held by a peer, the structural call times
        // out instead of dispatching.
        peer.acquire(LockManager::GLOBAL, Duration::from_secs(1))
            .await
            .unwrap();
        match sim
            .cluster
            .invoke(&stmt, MemOp::Ddl("alter table t".into()))
            .await
        {
            Err(Error::LockTimeout) => (),
            other => panic!("expected LockTimeout, got {:?}", other),
        }
        peer.release(LockManager::GLOBAL).await.unwrap();
    });
}

pub fn close_cascade_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let sim = mk_sim(2, ClusterConfig::default()).await;
        let conn = sim.cluster.open(false);
        let stmt = sim
            .cluster
            .open_child(&conn, ResourceKind::Statement, MemOp::CreateStatement)
            .await
            .unwrap();
        let cursor = sim
            .cluster
            .open_child(&stmt, ResourceKind::ResultSet, MemOp::OpenCursor)
            .await
            .unwrap();

        // Touch everything so handles exist on both backends.
        sim.cluster
            .invoke(&stmt, MemOp::Put("a".into(), 7))
            .await
            .unwrap();
        sim.cluster.invoke(&cursor, MemOp::Next).await.unwrap();
        assert_eq!(open_handles_on(&sim, BackendId(1)), 3);

        let scope = stmt.staging_scope().unwrap();
        let tok = scope.stage(&mut &b"lob"[..]).unwrap();
        assert_eq!(scope.fetch(tok).unwrap(), b"lob");

        assert_eq!(format!("{:?}", *stmt), "proxy(Statement)");

        // Backend 2 refuses to close any of its three handles; the cascade
        // still closes everything else and reports every failure at once.
        sim.states[&BackendId(2)].lock().unwrap().fail_close = true;
        match sim.cluster.close(&conn).await {
            Err(Error::Close(errs)) => assert_eq!(errs.len(), 3),
            other => panic!("expected Close, got {:?}", other),
        }
        assert_eq!(format!("{:?}", *stmt), "proxy(Statement, closed)");
        assert_eq!(open_handles_on(&sim, BackendId(1)), 0);
        assert!(conn.is_closed() && stmt.is_closed() && cursor.is_closed());

        // The statement's staging scope died with it.
        assert!(scope.fetch(tok).is_err());

        // Closing again is a no-op, and closed resources refuse calls.
        sim.cluster.close(&conn).await.unwrap();
        match sim.cluster.invoke(&stmt, MemOp::Get("a".into())).await {
            Err(Error::Protocol(_)) => (),
            other => panic!("expected Protocol, got {:?}", other),
        }
        match sim
            .cluster
            .open_child(&conn, ResourceKind::Statement, MemOp::CreateStatement)
            .await
        {
            Err(Error::Protocol(_)) => (),
            other => panic!("expected Protocol, got {:?}", other),
        }
    });
}

pub fn sibling_close_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let sim = mk_sim(1, ClusterConfig::default()).await;
        let conn = sim.cluster.open(false);
        let mut stmts = Vec::new();
        for i in 0..3u64 {
            let stmt = sim
                .cluster
                .open_child(&conn, ResourceKind::Statement, MemOp::CreateStatement)
                .await
                .unwrap();
            sim.cluster
                .invoke(&stmt, MemOp::Put(format!("k{}", i), i))
                .await
                .unwrap();
            stmts.push(stmt);
        }
        // Connection handle plus one per statement.
        assert_eq!(open_handles_on(&sim, BackendId(1)), 4);

        // The middle sibling's handle refuses to close. Its failure must
        // not stop the other siblings (or the connection) from closing.
        sim.states[&BackendId(1)]
            .lock()
            .unwrap()
            .fail_close_handles
            .insert(3);
        match sim.cluster.close(&conn).await {
            Err(Error::Close(errs)) => assert_eq!(errs.len(), 1),
            other => panic!("expected Close, got {:?}", other),
        }
        assert!(conn.is_closed());
        for stmt in &stmts {
            assert!(stmt.is_closed());
        }
        assert_eq!(
            sim.states[&BackendId(1)]
                .lock()
                .unwrap()
                .open_handles
                .iter()
                .copied()
                .collect::<Vec<_>>(),
            vec![3]
        );
    });
}

pub fn recovery_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let sim = mk_sim(2, ClusterConfig::default()).await;
        let txn = TxnId {
            member: MemberId(1),
            seq: 99,
        };
        let invoker = |backend, completed| {
            JournalRecord::Invoker(InvokerEvent {
                txn,
                backend,
                completed,
                result: None,
                exception: None,
            })
        };

        // Simulate a crash mid-write: backend 1 completed, backend 2 never
        // reported, no End was written.
        sim.journal
            .append(JournalRecord::Invocation(InvocationEvent {
                txn,
                phase: InvocationPhase::Start,
            }))
            .unwrap();
        sim.journal.append(invoker(BackendId(1), false)).unwrap();
        sim.journal.append(invoker(BackendId(2), false)).unwrap();
        sim.journal.append(invoker(BackendId(1), true)).unwrap();

        let report = sim.cluster.recover().await.unwrap();
        assert_eq!(report.quarantined, vec![BackendId(2)]);
        assert_eq!(report.retained, vec![txn]);
        assert!(report.discarded.is_empty());
        assert_eq!(
            sim.cluster.backend_state(BackendId(2)).await,
            Some(BackendState::Synchronizing)
        );

        assert!(sim.cluster.resync_complete(BackendId(2)).await.unwrap());
        assert_eq!(
            sim.cluster.backend_state(BackendId(2)).await,
            Some(BackendState::Active)
        );
        assert!(sim.journal.records().unwrap().is_empty());
        info!("recovered: {:?}", report);
    });
}

pub fn journal_fence_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let sim = mk_sim(2, ClusterConfig::default()).await;
        let conn = sim.cluster.open(false);
        let stmt = sim
            .cluster
            .open_child(&conn, ResourceKind::Statement, MemOp::CreateStatement)
            .await
            .unwrap();

        sim.cluster
            .invoke(&stmt, MemOp::Put("a".into(), 7))
            .await
            .unwrap();

        sim.journal.fail.store(true, Ordering::SeqCst);
        match sim.cluster.invoke(&stmt, MemOp::Put("a".into(), 8)).await {
            Err(Error::Journal(_)) => (),
            other => panic!("expected Journal, got {:?}", other),
        }
        assert!(sim.cluster.is_fenced());

        // The fence outlives the fault: even with the journal healthy
        // again, writes stay refused until a restart.
        sim.journal.fail.store(false, Ordering::SeqCst);
        match sim.cluster.invoke(&conn, MemOp::SetAutoCommit(false)).await {
            Err(Error::Journal(_)) => (),
            other => panic!("expected Journal, got {:?}", other),
        }
        // Reads still flow.
        assert_eq!(
            sim.cluster.invoke(&stmt, MemOp::Get("a".into())).await.unwrap(),
            7
        );
    });
}

pub fn journal_serde_test() {
    setup_tracing_subscriber();
    let ev = InvokerEvent {
        txn: TxnId {
            member: MemberId(3),
            seq: 11,
        },
        backend: BackendId(2),
        completed: true,
        result: Some(Snapshot::capture(&42u64)),
        exception: None,
    };
    let rec = JournalRecord::Invoker(ev);
    let bytes = serde_json::to_vec(&rec).unwrap();
    let back: JournalRecord = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(rec, back);
}
