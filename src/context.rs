// SPDX-License-Identifier: Apache-2.0

//! Per-thread transaction state.
//!
//! Exactly one [`TxState`] may be active per thread at a time, stored in a `thread_local!` so
//! that no state leaks across threads or across nested entries. The driver in
//! [`crate::global`] is the sole writer of `mode`, `start_epoch`, `read_set`, and `write_set`;
//! user code only ever touches them indirectly through [`crate::cell::Cell::get`] and
//! [`crate::cell::Cell::set`].

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use log::trace;

use crate::error::ContractViolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Read,
    Write,
}

pub(crate) struct TxState {
    pub(crate) mode: Mode,
    pub(crate) start_epoch: u64,
    /// Identities of cells read during a write transaction. Empty and unused in read mode
    /// (see the data model: read transactions validate inline on every `get` instead).
    pub(crate) read_set: HashSet<usize>,
    /// Identities of cells written during a write transaction, mapped to their pending
    /// bit-packed value. A later `set` on the same cell overwrites its entry (invariant: the
    /// write set is idempotent under repeated writes to one cell).
    pub(crate) write_set: HashMap<usize, u64>,
}

impl TxState {
    fn new(mode: Mode, start_epoch: u64) -> Self {
        Self {
            mode,
            start_epoch,
            read_set: HashSet::new(),
            write_set: HashMap::new(),
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<TxState>> = const { RefCell::new(None) };
}

/// Guards the lifetime of the thread-local transaction state.
///
/// Dropping the guard clears [`CURRENT`] unconditionally, on every exit path -- normal return,
/// the internal fallback retry, or a panic unwinding out of a user thunk -- which is what keeps
/// the state-hygiene invariant (read/write sets empty, no transaction active) true even when a
/// thunk panics.
pub(crate) struct TxGuard;

impl TxGuard {
    /// Starts a new transaction on this thread, failing if one is already active.
    pub(crate) fn try_enter(mode: Mode, start_epoch: u64) -> Result<Self, ContractViolation> {
        CURRENT.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_some() {
                return Err(ContractViolation::NestedTransaction);
            }
            trace!("entering transaction: mode={mode:?} start_epoch={start_epoch}");
            *slot = Some(TxState::new(mode, start_epoch));
            Ok(())
        })?;
        Ok(TxGuard)
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        CURRENT.with(|cell| {
            *cell.borrow_mut() = None;
        });
    }
}

/// Runs `f` against the active transaction's state, panicking with
/// [`ContractViolation::NoActiveTransaction`] if no transaction is active on this thread.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut TxState) -> R) -> R {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let state = slot
            .as_mut()
            .unwrap_or_else(|| panic!("{}", ContractViolation::NoActiveTransaction));
        f(state)
    })
}

/// Re-samples the start epoch of the active transaction, used when re-entering the fallback
/// path after an abort or a failed validation.
pub(crate) fn reset_start_epoch(epoch: u64) {
    with_current(|tx| tx.start_epoch = epoch);
}

/// Clears the read and write sets of the active transaction, used before re-running a thunk
/// on the write retry path so stale entries from the speculative attempt are not reused.
pub(crate) fn clear_sets() {
    with_current(|tx| {
        tx.read_set.clear();
        tx.write_set.clear();
    });
}
