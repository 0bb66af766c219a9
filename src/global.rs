// SPDX-License-Identifier: Apache-2.0

//! The global transactional context and the read/write transaction driver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use log::{debug, info};

use crate::cell;
use crate::context::{self, Mode, TxGuard};
use crate::error::{Abort, ContractViolation};

/// Owns the global epoch counter, the contention-fallback lock, and the retry counters for one
/// independent transactional universe.
///
/// Multiple `Context`s may coexist; a transaction is scoped to exactly one, and the caller is
/// responsible for only touching cells created for use with a given `Context` from
/// transactions run on that same `Context` (the runtime does not enforce this at runtime).
pub struct Context {
    /// Linearization order for successful write commits. Incremented by exactly one per
    /// commit, only while `fallback_lock` is held exclusively.
    epoch: AtomicU64,
    /// Held exclusively during every write commit and for the full duration of a retried
    /// (fallback) thunk; held in shared mode for the full duration of a retried read thunk.
    fallback_lock: RwLock<()>,
    read_retries: AtomicU64,
    write_retries: AtomicU64,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a new context with a fresh epoch of 0 and an unlocked fallback lock.
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            fallback_lock: RwLock::new(()),
            read_retries: AtomicU64::new(0),
            write_retries: AtomicU64::new(0),
        }
    }

    /// Number of times a read transaction observed a stale value and had to restart under the
    /// shared fallback lock. Observability only; never required for correctness.
    pub fn read_retries(&self) -> u64 {
        self.read_retries.load(Ordering::Relaxed)
    }

    /// Number of times a write transaction failed commit-time validation and had to restart
    /// under the exclusive fallback lock. Observability only; never required for correctness.
    pub fn write_retries(&self) -> u64 {
        self.write_retries.load(Ordering::Relaxed)
    }

    /// Runs `thunk` as a read-only transaction and returns its result.
    ///
    /// Read transactions keep no read set: every [`Cell::get`](crate::Cell::get) call
    /// validates itself against the transaction's start epoch as it happens, so a stale read
    /// aborts on the spot. On abort, the transaction is retried exactly once, under the
    /// fallback lock in shared mode, which is guaranteed to succeed because no writer can be
    /// mid-commit while any shared holder is present.
    ///
    /// # Panics
    /// Panics if a transaction is already active on this thread. Use
    /// [`Context::try_read_tx`] to handle that case without panicking.
    pub fn read_tx<R>(&self, thunk: impl FnMut() -> Result<R, Abort>) -> R {
        self.try_read_tx(thunk)
            .unwrap_or_else(|violation| panic!("{violation}"))
    }

    /// Fallible form of [`Context::read_tx`]: returns
    /// [`ContractViolation::NestedTransaction`] instead of panicking if a transaction is
    /// already active on this thread.
    pub fn try_read_tx<R>(&self, mut thunk: impl FnMut() -> Result<R, Abort>) -> Result<R, ContractViolation> {
        let start_epoch = self.epoch.load(Ordering::Acquire);
        let _guard = TxGuard::try_enter(Mode::Read, start_epoch)?;
        debug!("read_tx: start epoch={start_epoch}");

        match thunk() {
            Ok(value) => Ok(value),
            Err(Abort) => Ok(self.retry_read_under_shared_lock(&mut thunk)),
        }
    }

    fn retry_read_under_shared_lock<R>(&self, thunk: &mut impl FnMut() -> Result<R, Abort>) -> R {
        self.read_retries.fetch_add(1, Ordering::Relaxed);
        info!("read_tx: stale read, retrying under shared fallback lock");

        let _lock = self.fallback_lock.read().expect("fallback lock poisoned");
        let start_epoch = self.epoch.load(Ordering::Acquire);
        context::reset_start_epoch(start_epoch);

        thunk().unwrap_or_else(|Abort| {
            panic!(
                "read transaction aborted a second time while holding the shared fallback \
                 lock; no writer can commit while a shared holder is present, so this \
                 indicates a bug in the commit protocol"
            )
        })
    }

    /// Runs `thunk` as a read-write transaction and returns its result.
    ///
    /// The thunk first runs speculatively, without holding any lock: `Cell::get` registers
    /// reads in the thread-local read set, `Cell::set` stages writes in the write set. If the
    /// thunk succeeds, the fallback lock is taken exclusively and the read/write sets are
    /// validated against the current epoch; on success the write set is published and the
    /// epoch is advanced. If validation fails, or the speculative thunk itself aborted, the
    /// transaction is retried exactly once under the exclusive fallback lock, which is
    /// guaranteed to succeed since no other writer can be running concurrently.
    ///
    /// # Panics
    /// Panics if a transaction is already active on this thread. Use
    /// [`Context::try_write_tx`] to handle that case without panicking.
    pub fn write_tx<R>(&self, thunk: impl FnMut() -> Result<R, Abort>) -> R {
        self.try_write_tx(thunk)
            .unwrap_or_else(|violation| panic!("{violation}"))
    }

    /// Fallible form of [`Context::write_tx`]: returns
    /// [`ContractViolation::NestedTransaction`] instead of panicking if a transaction is
    /// already active on this thread.
    pub fn try_write_tx<R>(&self, mut thunk: impl FnMut() -> Result<R, Abort>) -> Result<R, ContractViolation> {
        let start_epoch = self.epoch.load(Ordering::Relaxed);
        let _guard = TxGuard::try_enter(Mode::Write, start_epoch)?;
        debug!("write_tx: start epoch={start_epoch}");

        let value = match thunk() {
            Ok(value) => value,
            Err(Abort) => return Ok(self.retry_write_under_exclusive_lock(&mut thunk)),
        };

        let commit_lock = self.fallback_lock.write().expect("fallback lock poisoned");
        let committed = self.validate_and_commit();
        drop(commit_lock);

        if committed {
            Ok(value)
        } else {
            Ok(self.retry_write_under_exclusive_lock(&mut thunk))
        }
    }

    /// Validates the active transaction's read and write sets against `self.epoch` and, if
    /// they check out, publishes the write set and advances the epoch.
    ///
    /// Must be called while holding `fallback_lock` exclusively: both the read of the current
    /// epoch to compute `commit_epoch` and the cell commits themselves rely on no other writer
    /// running concurrently.
    fn validate_and_commit(&self) -> bool {
        context::with_current(|tx| {
            // Safety: every id in read_set/write_set was produced by `Cell::identity` on a
            // cell reachable from this transaction's thunk, which is still executing (or has
            // just returned) on this thread; see `cell::epoch_of`'s safety doc.
            let valid = tx
                .read_set
                .iter()
                .chain(tx.write_set.keys())
                .all(|&id| unsafe { cell::epoch_of(id) } <= tx.start_epoch);

            if !valid {
                return false;
            }

            let commit_epoch = self.epoch.load(Ordering::Relaxed) + 1;
            for (&id, &bits) in tx.write_set.iter() {
                // Safety: same as above.
                unsafe { cell::commit_at(id, commit_epoch, bits) };
            }
            self.epoch.store(commit_epoch, Ordering::Release);
            true
        })
    }

    /// The guaranteed-success fallback for write transactions: re-runs `thunk` while holding
    /// the fallback lock exclusively, so no concurrent writer can be mid-commit and no
    /// concurrent reader can observe a torn read. Validation is skipped on this path -- the
    /// exclusive lock already rules out the only thing validation would catch -- but the
    /// thunk is re-executed from scratch so its decisions are based on fresh reads rather than
    /// the stale speculative ones.
    fn retry_write_under_exclusive_lock<R>(&self, thunk: &mut impl FnMut() -> Result<R, Abort>) -> R {
        self.write_retries.fetch_add(1, Ordering::Relaxed);
        info!("write_tx: retrying under exclusive fallback lock");

        let _lock = self.fallback_lock.write().expect("fallback lock poisoned");
        let start_epoch = self.epoch.load(Ordering::Relaxed);
        context::reset_start_epoch(start_epoch);
        context::clear_sets();

        let value = thunk().unwrap_or_else(|Abort| {
            panic!(
                "write transaction aborted while holding the exclusive fallback lock; no \
                 concurrent writer can be running, so this indicates a bug in the commit \
                 protocol"
            )
        });

        let commit_epoch = start_epoch + 1;
        context::with_current(|tx| {
            for (&id, &bits) in tx.write_set.iter() {
                // Safety: see `validate_and_commit`.
                unsafe { cell::commit_at(id, commit_epoch, bits) };
            }
        });
        self.epoch.store(commit_epoch, Ordering::Release);

        value
    }
}
