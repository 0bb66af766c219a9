// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use epoch_stm::{Cell, Context};

#[cfg(test)]
#[ctor::ctor]
/// This function runs before any of the tests in this binary.
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

#[test]
fn read_your_own_writes() {
    let ctx = Context::new();
    let c = Cell::new(0i64);

    ctx.write_tx(|| {
        c.set(5);
        assert_eq!(c.get()?, 5);
        c.set(7);
        assert_eq!(c.get()?, 7);
        Ok(())
    });

    assert_eq!(ctx.read_tx(|| c.get()), 7);
}

#[test]
fn single_writer_linearizability() {
    const ITERATIONS: i64 = 200_000;

    let ctx = Arc::new(Context::new());
    let counter = Arc::new(Cell::new(0i64));

    let writer_ctx = ctx.clone();
    let writer_counter = counter.clone();
    let writer = thread::spawn(move || {
        for _ in 0..ITERATIONS {
            writer_ctx.write_tx(|| {
                let current = writer_counter.get()?;
                writer_counter.set(current + 1);
                Ok(())
            });
        }
    });
    writer.join().expect("writer thread panicked");

    assert_eq!(ctx.read_tx(|| counter.get()), ITERATIONS);
}

#[test]
fn multi_writer_increments_under_contention() {
    const THREADS: usize = 4;
    const PER_THREAD: i64 = 50_000;

    let ctx = Arc::new(Context::new());
    let counter = Arc::new(Cell::new(0i64));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let ctx = ctx.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    ctx.write_tx(|| {
                        let current = counter.get()?;
                        counter.set(current + 1);
                        Ok(())
                    });
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("writer thread panicked");
    }

    assert_eq!(ctx.read_tx(|| counter.get()), THREADS as i64 * PER_THREAD);
    // write_retries is an unsigned observability counter; it is always defined, and with four
    // threads racing on one cell it should be nonzero, but we only assert it didn't deadlock
    // computing it.
    let _ = ctx.write_retries();
}

#[test]
fn paired_field_consistency_under_concurrent_reader() {
    const ITERATIONS: i64 = 20_000;

    let ctx = Arc::new(Context::new());
    let x = Arc::new(Cell::new(0i64));
    let y = Arc::new(Cell::new(0i64));

    let writer_ctx = ctx.clone();
    let writer_x = x.clone();
    let writer_y = y.clone();
    let writer = thread::spawn(move || {
        for i in 0..ITERATIONS {
            writer_ctx.write_tx(|| {
                writer_x.set(i);
                writer_y.set(i);
                Ok(())
            });
        }
    });

    let reader_ctx = ctx.clone();
    let reader_x = x.clone();
    let reader_y = y.clone();
    let reader = thread::spawn(move || {
        for _ in 0..ITERATIONS {
            let (a, b) = reader_ctx.read_tx(|| Ok((reader_x.get()?, reader_y.get()?)));
            assert_eq!(a, b, "reader observed a torn pair of fields");
        }
    });

    writer.join().expect("writer thread panicked");
    reader.join().expect("reader thread panicked");

    assert!(ctx.read_retries() < u64::MAX);
    assert!(ctx.write_retries() < u64::MAX);
}

#[test]
fn forced_conflict_drives_writer_through_exclusive_fallback() {
    let ctx = Arc::new(Context::new());
    let cell = Arc::new(Cell::new(0i64));
    let barrier = Arc::new(Barrier::new(2));
    // write_tx's thunk is an FnMut that may be re-invoked by the exclusive-fallback retry; the
    // barrier has only two parties (this thread's first attempt and writer B), so the wait must
    // be gated to fire on the speculative attempt only, never on the retry.
    let first_attempt = Arc::new(AtomicBool::new(true));

    // Writer A reads the cell, pauses on the barrier on its first (speculative) attempt only
    // (simulating work done mid-transaction with no lock held), then writes. Writer B races in
    // during the pause and commits first, which must force A's commit-time validation to fail
    // and fall back to the guaranteed exclusive retry.
    let ctx_a = ctx.clone();
    let cell_a = cell.clone();
    let barrier_a = barrier.clone();
    let first_attempt_a = first_attempt.clone();
    let writer_a = thread::spawn(move || {
        ctx_a.write_tx(|| {
            let current = cell_a.get()?;
            if first_attempt_a.swap(false, Ordering::SeqCst) {
                barrier_a.wait();
            }
            cell_a.set(current + 1);
            Ok(())
        });
    });

    let ctx_b = ctx.clone();
    let cell_b = cell.clone();
    let barrier_b = barrier.clone();
    let writer_b = thread::spawn(move || {
        barrier_b.wait();
        ctx_b.write_tx(|| {
            let current = cell_b.get()?;
            cell_b.set(current + 100);
            Ok(())
        });
    });

    writer_a.join().expect("writer A panicked");
    writer_b.join().expect("writer B panicked");

    // Both writes landed (one as +1, one as +100), in some serial order; the exact order is
    // not determined by the barrier alone, but both must have taken effect and A must have
    // needed the fallback path since B committed while A's thunk was paused mid-flight.
    let final_value = ctx.read_tx(|| cell.get());
    assert!(final_value == 101, "expected both increments to land, got {final_value}");
    assert!(ctx.write_retries() >= 1, "expected the forced conflict to trigger a write retry");
}

#[test]
fn read_fallback_returns_a_consistent_value_after_forced_abort() {
    let ctx = Arc::new(Context::new());
    let cell = Arc::new(Cell::new(10i64));
    let before_read = Arc::new(Barrier::new(2));
    let after_commit = Arc::new(Barrier::new(2));
    // read_tx's thunk is an FnMut that may be re-invoked by the shared-lock fallback retry; both
    // barriers have only two parties (this thread's first attempt and the writer), so the waits
    // must be gated to fire on the speculative attempt only, never on the retry.
    let first_attempt = Arc::new(AtomicBool::new(true));

    let ctx_r = ctx.clone();
    let cell_r = cell.clone();
    let before_read_r = before_read.clone();
    let after_commit_r = after_commit.clone();
    let first_attempt_r = first_attempt.clone();
    let reader = thread::spawn(move || {
        ctx_r.read_tx(|| {
            if first_attempt_r.swap(false, Ordering::SeqCst) {
                before_read_r.wait();
                after_commit_r.wait();
            }
            cell_r.get()
        })
    });

    let ctx_w = ctx.clone();
    let cell_w = cell.clone();
    let before_read_w = before_read.clone();
    let after_commit_w = after_commit.clone();
    let writer = thread::spawn(move || {
        before_read_w.wait();
        ctx_w.write_tx(|| {
            cell_w.set(20);
            Ok(())
        });
        after_commit_w.wait();
    });

    writer.join().expect("writer thread panicked");
    let observed = reader.join().expect("reader thread panicked");

    assert_eq!(observed, 20, "reader must see the committed value, not a stale or torn one");
    assert!(ctx.read_retries() >= 1, "expected the forced commit-before-read race to abort the first read attempt");
}

#[test]
fn aborted_write_thunk_does_not_advance_epoch_or_mutate_cell() {
    let ctx = Context::new();
    let cell = Cell::new(3i32);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        ctx.write_tx(|| -> epoch_stm::Result<()> {
            cell.set(999);
            panic!("injected failure inside the thunk");
        })
    }));
    assert!(result.is_err());

    assert_eq!(ctx.read_tx(|| cell.get()), 3);
    assert_eq!(ctx.write_retries(), 0);
}

#[test]
fn nested_transaction_is_a_contract_violation_not_a_panic() {
    let ctx = Context::new();

    let outcome = ctx.try_write_tx(|| -> Result<(), epoch_stm::Abort> {
        let nested = ctx.try_read_tx(|| Ok(()));
        assert_eq!(nested, Err(epoch_stm::ContractViolation::NestedTransaction));
        Ok(())
    });

    assert!(outcome.is_ok());
}

#[test]
#[should_panic(expected = "no transaction is active")]
fn cell_access_outside_any_transaction_panics() {
    let cell = Cell::new(0u8);
    let _ = cell.get();
}
