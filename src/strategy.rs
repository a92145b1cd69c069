// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Static selection of a per-call dispatch strategy.
//!
//! There is no runtime proxying or reflection here: each resource kind
//! carries small constant tables of method names, and [strategy_for] is a
//! slice lookup. Names absent from every table get the kind's default
//! (a primary-only read), which is always safe: a misclassified write
//! simply doesn't fan out, it never corrupts peers.
//!
//! A connection marked read-only downgrades every write strategy to a
//! primary-only read: the backends' own read-only enforcement will reject
//! actual mutation, and fanning such calls out would just reject it N
//! times.

use serde::{Deserialize, Serialize};

use crate::ResourceKind;

/// How one call is spread over the cluster.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// Execute on the designated primary only; its failure is the caller's.
    SingleRead,
    /// Execute on every ACTIVE backend without agreement or journaling,
    /// carrying the primary's result (or the first success if the primary
    /// failed). Failures are masked and never deactivate anyone -- reads
    /// prove nothing about divergence.
    PerBackendRead,
    /// Execute on every ACTIVE backend, without journal bracketing: handle
    /// state changes and other calls that must land everywhere but need no
    /// crash-divergence detection.
    FanOutWrite,
    /// Execute on every ACTIVE backend, bracketed in the durability
    /// journal.
    TransactionalWrite,
}

/// Whether multi-backend strategies run their per-backend calls
/// concurrently (one task per backend) or one after another in registry
/// order. Sequential dispatch trades latency for strictly reproducible
/// interleaving, which some backends' locking behaves better under.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatchMode {
    Parallel,
    Sequential,
}

impl Default for DispatchMode {
    fn default() -> Self {
        DispatchMode::Parallel
    }
}

// Connection-level calls answered from local driver state.
pub const CONNECTION_DRIVER_READS: &[&str] = &[
    "get_auto_commit",
    "get_catalog",
    "get_holdability",
    "get_transaction_isolation",
    "get_type_map",
    "get_warnings",
    "is_closed",
    "is_read_only",
];

// Connection-level calls that actually consult the backend.
pub const CONNECTION_DATABASE_READS: &[&str] = &["get_metadata", "is_valid"];

// Connection state that must be mirrored on every backend, but needs no
// durability bracket: losing it in a crash loses nothing durable.
pub const CONNECTION_DRIVER_WRITES: &[&str] = &[
    "create_statement",
    "prepare_statement",
    "prepare_call",
    "set_auto_commit",
    "set_catalog",
    "set_holdability",
    "set_read_only",
    "set_transaction_isolation",
    "set_type_map",
    "clear_warnings",
];

// Transaction boundaries: the calls whose partial completion is exactly
// the divergence the journal exists to catch.
pub const CONNECTION_TXN_WRITES: &[&str] =
    &["commit", "rollback", "set_savepoint", "release_savepoint", "rollback_savepoint"];

pub const STATEMENT_READS: &[&str] = &[
    "execute_query",
    "get_fetch_size",
    "get_max_rows",
    "get_query_timeout",
    "get_result_set",
    "get_update_count",
    "get_warnings",
];

pub const STATEMENT_DRIVER_WRITES: &[&str] = &[
    "add_batch",
    "clear_batch",
    "clear_parameters",
    "set_cursor_name",
    "set_fetch_size",
    "set_max_rows",
    "set_parameter",
    "set_query_timeout",
];

pub const STATEMENT_TXN_WRITES: &[&str] = &["execute", "execute_batch", "execute_update"];

// Cursor movement mirrors on every backend so positioned updates stay
// aligned.
pub const CURSOR_MOVES: &[&str] = &[
    "absolute",
    "after_last",
    "before_first",
    "first",
    "last",
    "move_to_current_row",
    "move_to_insert_row",
    "next",
    "previous",
    "relative",
];

pub const CURSOR_TXN_WRITES: &[&str] = &["delete_row", "insert_row", "update_row"];

/// Pick the strategy for one call: a lookup in the tables above, downgraded
/// to a primary-only read when the owning connection is read-only.
pub fn strategy_for(kind: ResourceKind, name: &str, read_only: bool) -> Strategy {
    let strategy = match kind {
        ResourceKind::Connection => {
            if CONNECTION_DRIVER_READS.contains(&name) {
                Strategy::SingleRead
            } else if CONNECTION_DATABASE_READS.contains(&name) {
                Strategy::PerBackendRead
            } else if CONNECTION_DRIVER_WRITES.contains(&name) {
                Strategy::FanOutWrite
            } else if CONNECTION_TXN_WRITES.contains(&name) {
                Strategy::TransactionalWrite
            } else {
                Strategy::SingleRead
            }
        }
        ResourceKind::Statement | ResourceKind::PreparedStatement => {
            if name == "execute_query" {
                Strategy::PerBackendRead
            } else if STATEMENT_READS.contains(&name) {
                Strategy::SingleRead
            } else if STATEMENT_DRIVER_WRITES.contains(&name) {
                Strategy::FanOutWrite
            } else if STATEMENT_TXN_WRITES.contains(&name) {
                Strategy::TransactionalWrite
            } else {
                Strategy::SingleRead
            }
        }
        ResourceKind::ResultSet => {
            if CURSOR_MOVES.contains(&name) {
                Strategy::FanOutWrite
            } else if CURSOR_TXN_WRITES.contains(&name) {
                Strategy::TransactionalWrite
            } else {
                Strategy::SingleRead
            }
        }
    };
    if read_only {
        match strategy {
            Strategy::FanOutWrite | Strategy::TransactionalWrite => Strategy::SingleRead,
            s => s,
        }
    } else {
        strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_select_their_table() {
        assert_eq!(
            strategy_for(ResourceKind::Connection, "commit", false),
            Strategy::TransactionalWrite
        );
        assert_eq!(
            strategy_for(ResourceKind::Connection, "create_statement", false),
            Strategy::FanOutWrite
        );
        assert_eq!(
            strategy_for(ResourceKind::Statement, "execute_update", false),
            Strategy::TransactionalWrite
        );
        assert_eq!(
            strategy_for(ResourceKind::Statement, "execute_query", false),
            Strategy::PerBackendRead
        );
        assert_eq!(
            strategy_for(ResourceKind::ResultSet, "next", false),
            Strategy::FanOutWrite
        );
        assert_eq!(
            strategy_for(ResourceKind::ResultSet, "update_row", false),
            Strategy::TransactionalWrite
        );
    }

    #[test]
    fn unknown_names_default_to_primary_read() {
        assert_eq!(
            strategy_for(ResourceKind::Statement, "get_moon_phase", false),
            Strategy::SingleRead
        );
    }

    #[test]
    fn read_only_downgrades_writes() {
        assert_eq!(
            strategy_for(ResourceKind::Connection, "commit", true),
            Strategy::SingleRead
        );
        assert_eq!(
            strategy_for(ResourceKind::Statement, "execute_update", true),
            Strategy::SingleRead
        );
        // Reads are untouched.
        assert_eq!(
            strategy_for(ResourceKind::Statement, "execute_query", true),
            Strategy::PerBackendRead
        );
    }
}
