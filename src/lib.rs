// SPDX-License-Identifier: Apache-2.0

//! # Epoch STM
//!
//! A software transactional memory (STM) runtime for scalar cells, built on epoch-based
//! optimistic concurrency control. Callers group reads and writes of [`Cell`] values into
//! atomic, isolated transactions via [`Context::read_tx`] and [`Context::write_tx`],
//! obtaining serializable semantics without hand-written locking.
//!
//! Non-conflicting transactions run lock-free: a write transaction executes its thunk
//! speculatively, tracking which cells it read and what it would write, and only takes a lock
//! at commit time to validate and publish. Read transactions never take a lock unless they hit
//! a conflict, in which case a single retry under a shared lock is guaranteed to succeed.
//! Progress for writers is guaranteed the same way: a transaction that keeps losing the
//! validation race is retried exactly once under an exclusive lock, where no concurrent writer
//! can interfere.
//!
//! The runtime operates purely on [`Scalar`] cells. Composing cells into larger aggregates
//! (for example, one cell per field of a user-defined struct) is left to an external
//! mechanism -- a derive macro, a code generator, or a hand-written wrapper -- this crate only
//! provides the transactional primitive those aggregates are built from.
//!
//! ```
//! use epoch_stm::{Cell, Context};
//!
//! let ctx = Context::new();
//! let x = Cell::new(0i64);
//! let y = Cell::new(0i64);
//!
//! ctx.write_tx(|| {
//!     let v = x.get()? + 1;
//!     x.set(v);
//!     y.set(v);
//!     Ok(())
//! });
//!
//! let (a, b) = ctx.read_tx(|| Ok((x.get()?, y.get()?)));
//! assert_eq!(a, b);
//! ```
#![allow(clippy::type_complexity)]

mod cell;
mod context;
mod error;
mod global;
mod scalar;

pub use cell::Cell;
pub use error::{Abort, ContractViolation};
pub use global::Context;
pub use scalar::Scalar;

/// Convenience alias for the `Result` type threaded through transaction thunks.
pub type Result<T> = core::result::Result<T, Abort>;
