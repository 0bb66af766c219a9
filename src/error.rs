// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use thiserror::Error;

/// Internal control-flow signal raised by [`Cell::get`](crate::cell::Cell::get) when it
/// observes a value committed after the transaction's snapshot epoch.
///
/// `Abort` never escapes the driver: [`Context::read_tx`](crate::Context::read_tx) and
/// [`Context::write_tx`](crate::Context::write_tx) catch it and redirect execution to the
/// fallback path. It is threaded through `Result` rather than raised as a panic, since Rust
/// has no resumable-exception mechanism suited to normal control flow; callers propagate it
/// with `?` from inside a transaction thunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort;

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stale read detected, transaction must restart")
    }
}

impl std::error::Error for Abort {}

/// Programmer-error contract violations: misuse of the transactional API that a well-behaved
/// caller never triggers. These are distinct from [`Abort`], which is an expected, internally
/// handled part of normal operation under contention.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContractViolation {
    /// `Cell::get`/`Cell::set` was called on a thread with no active transaction.
    #[error("no transaction is active on this thread")]
    NoActiveTransaction,

    /// `read_tx`/`write_tx` was called while a transaction was already active on this
    /// thread. Nested (recursive) transactions are not supported.
    #[error("a transaction is already active on this thread; nested transactions are not supported")]
    NestedTransaction,

    /// `Cell::set` was called while the active transaction is in read-only mode.
    #[error("Cell::set called inside a read-only transaction")]
    WriteInReadTransaction,
}
