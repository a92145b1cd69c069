// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

pub use hydra::*;

#[cfg(test)]
mod test;

// We have these tests external from the crate for two reasons:
//
//  1. to make sure the public API is usable without accidentally relying on
//     crate-level-visibility stuff.
//
//  2. to use `cargo llvm-lines` in the llvm-lines/ subdirectory, to measure
//     footprint of final codegen when everything's actually instantiated.

#[test]
fn replicated_write_test() {
    test::replicated_write_test();
}

#[test]
fn divergent_write_test() {
    test::divergent_write_test();
}

#[test]
fn unanimous_failure_test() {
    test::unanimous_failure_test();
}

#[test]
fn read_failover_test() {
    test::read_failover_test();
}

#[test]
fn read_only_downgrade_test() {
    test::read_only_downgrade_test();
}

#[test]
fn lock_contention_test() {
    test::lock_contention_test();
}

#[test]
fn decree_idempotence_test() {
    test::decree_idempotence_test();
}

#[test]
fn late_abort_test() {
    test::late_abort_test();
}

#[test]
fn structural_lock_test() {
    test::structural_lock_test();
}

#[test]
fn close_cascade_test() {
    test::close_cascade_test();
}

#[test]
fn sibling_close_test() {
    test::sibling_close_test();
}

#[test]
fn recovery_test() {
    test::recovery_test();
}

#[test]
fn journal_fence_test() {
    test::journal_fence_test();
}

#[test]
fn journal_serde_test() {
    test::journal_serde_test();
}

pub fn main() {
    println!("please run `cargo test` instead");
}
