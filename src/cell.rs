// SPDX-License-Identifier: Apache-2.0

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::{self, Mode};
use crate::error::{Abort, ContractViolation};
use crate::scalar::Scalar;

/// Type-erased storage shared by every `Cell<T>`, regardless of `T`: a bit-packed value and
/// its write-epoch, both plain `AtomicU64`s.
///
/// Keeping this representation independent of `T` is what lets the driver in
/// [`crate::global`] validate and commit a transaction's read/write sets without knowing the
/// concrete scalar type of each cell it touches -- it only ever needs a cell's address and its
/// two words (see [`epoch_of`] and [`commit_at`]).
#[derive(Default)]
struct CellState {
    value: AtomicU64,
    write_epoch: AtomicU64,
}

/// A single transactionally managed variable of scalar type `T`.
///
/// A cell pairs a value with a monotonically non-decreasing `write_epoch`: the global epoch
/// at which `value` was last committed. Cells are caller-allocated and must outlive every
/// transaction that touches them -- the runtime holds no references to a cell between
/// transactions.
///
/// `get`/`set` consult the calling thread's active transaction implicitly; there is no
/// explicit transaction handle to pass around. Using either outside a transaction, or `set`
/// inside a read-only transaction, is a programmer error and panics (see
/// [`ContractViolation`]).
///
/// # Example
/// ```
/// use epoch_stm::{Cell, Context};
///
/// let ctx = Context::new();
/// let balance = Cell::new(100i64);
///
/// ctx.write_tx(|| {
///     let current = balance.get()?;
///     balance.set(current - 20);
///     Ok(())
/// });
///
/// assert_eq!(ctx.read_tx(|| balance.get()), 80);
/// ```
pub struct Cell<T: Scalar> {
    state: CellState,
    _marker: PhantomData<T>,
}

impl<T: Scalar> Cell<T> {
    /// Creates a new cell holding `value`, with `write_epoch` initialized to 0.
    pub fn new(value: T) -> Self {
        Self {
            state: CellState {
                value: AtomicU64::new(value.to_bits()),
                write_epoch: AtomicU64::new(0),
            },
            _marker: PhantomData,
        }
    }

    /// The stable identity of this cell, used as the key in a transaction's read and write
    /// sets. Per the data model's design notes, this is the address of the cell's
    /// type-erased state (its "version tag"); it is only ever compared or used to recover a
    /// reference to this same `CellState` within the dynamic extent of a transaction that is
    /// holding a `&Cell<T>` borrow of `self`, so no aliasing or lifetime hazard arises from
    /// reducing it to a `usize`.
    fn identity(&self) -> usize {
        &self.state as *const CellState as usize
    }

    /// Reads the cell's value under the calling thread's active transaction.
    ///
    /// In write mode, a pending value from an earlier `set` in the same transaction is
    /// returned directly (read-your-own-writes) without touching `write_epoch`. Otherwise the
    /// value is loaded and checked against the transaction's start epoch; a value committed
    /// after the snapshot was taken aborts the transaction with [`Abort`].
    ///
    /// # Panics
    /// Panics with [`ContractViolation::NoActiveTransaction`] if no transaction is active on
    /// the calling thread.
    pub fn get(&self) -> Result<T, Abort> {
        context::with_current(|tx| match tx.mode {
            Mode::Write => {
                if let Some(&bits) = tx.write_set.get(&self.identity()) {
                    return Ok(T::from_bits(bits));
                }
                tx.read_set.insert(self.identity());
                self.load_checked(tx.start_epoch)
            }
            Mode::Read => self.load_checked(tx.start_epoch),
        })
    }

    /// Stages `value` as the cell's new value, to be published if and when the enclosing
    /// write transaction commits. Does not touch `value`/`write_epoch` directly, and does not
    /// imply a read of the prior value. A later `set` on the same cell in the same
    /// transaction overwrites this entry rather than accumulating.
    ///
    /// # Panics
    /// Panics with [`ContractViolation::NoActiveTransaction`] if no transaction is active, or
    /// with [`ContractViolation::WriteInReadTransaction`] if the active transaction is
    /// read-only.
    pub fn set(&self, value: T) {
        context::with_current(|tx| {
            if tx.mode != Mode::Write {
                panic!("{}", ContractViolation::WriteInReadTransaction);
            }
            tx.write_set.insert(self.identity(), value.to_bits());
        })
    }

    fn load_checked(&self, start_epoch: u64) -> Result<T, Abort> {
        // Acquire on the value pairs with the Release store in `commit_at`: a reader who
        // observes a new value is guaranteed to also observe its new (or a later) write_epoch
        // in the load that follows.
        let bits = self.state.value.load(Ordering::Acquire);
        let epoch = self.state.write_epoch.load(Ordering::Relaxed);
        if epoch > start_epoch {
            return Err(Abort);
        }
        Ok(T::from_bits(bits))
    }
}

impl<T: Scalar + Default> Default for Cell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Reads the write-epoch of the cell identified by `id`, for commit-time validation.
///
/// # Safety
/// `id` must have been produced by [`Cell::identity`] on a `Cell` that is still alive and
/// reachable from this thread. This holds for every identity found in a transaction's read or
/// write set: cells are contractually required to outlive any transaction that references
/// them, and identities never escape the dynamic extent of the `read_tx`/`write_tx` call that
/// recorded them.
pub(crate) unsafe fn epoch_of(id: usize) -> u64 {
    (*(id as *const CellState)).write_epoch.load(Ordering::Relaxed)
}

/// Publishes a pending write to the cell identified by `id`: stamps `write_epoch` with
/// relaxed ordering, then stores the new bits with release ordering (see [`Cell::load_checked`]
/// for the pairing). Must only be called while holding the owning [`crate::Context`]'s fallback
/// lock exclusively.
///
/// # Safety
/// Same precondition as [`epoch_of`].
pub(crate) unsafe fn commit_at(id: usize, epoch: u64, bits: u64) {
    let state = &*(id as *const CellState);
    state.write_epoch.store(epoch, Ordering::Relaxed);
    state.value.store(bits, Ordering::Release);
}
