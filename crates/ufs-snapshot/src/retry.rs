//! Optimistic retry against the snapshot coordination lock.
//!
//! A decision is made under the lock, the slow part (block I/O, allocation)
//! runs with the lock released, and the result is committed only if the
//! generation is unchanged when the lock is retaken. Otherwise the work is
//! abandoned and the whole sequence starts again.

use parking_lot::Mutex;
use tracing::trace;
use ufs_error::{Result, UfsError};

/// Upper bound on attempts before giving up with [`UfsError::Busy`].
pub const MAX_ATTEMPTS: u32 = 64;

/// State whose generation is bumped on every change that can invalidate a
/// decision made against it.
pub trait Generation {
    fn generation(&self) -> u64;
}

/// Run `decide` → `work` → `commit` with generation validation.
///
/// `decide` and `commit` run with `lock` held; `work` and `abandon` run
/// without it. `abandon` receives the output of a `work` whose decision went
/// stale and must undo its side effects.
pub fn with_generation_retry<S, P, W, T>(
    lock: &Mutex<S>,
    mut decide: impl FnMut(&S) -> Result<P>,
    mut work: impl FnMut(&P) -> Result<W>,
    mut commit: impl FnMut(&mut S, P, W) -> Result<T>,
    mut abandon: impl FnMut(W) -> Result<()>,
) -> Result<T>
where
    S: Generation,
{
    for attempt in 0..MAX_ATTEMPTS {
        let (seen, plan) = {
            let state = lock.lock();
            (state.generation(), decide(&state)?)
        };
        let done = work(&plan)?;
        let mut state = lock.lock();
        if state.generation() == seen {
            return commit(&mut state, plan, done);
        }
        drop(state);
        trace!(attempt, seen, "generation moved, retrying");
        abandon(done)?;
    }
    Err(UfsError::Busy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Counter {
        generation: u64,
        value: u32,
    }

    impl Generation for Counter {
        fn generation(&self) -> u64 {
            self.generation
        }
    }

    #[test]
    fn commits_when_nothing_moved() {
        let lock = Mutex::new(Counter {
            generation: 1,
            value: 0,
        });
        let out = with_generation_retry(
            &lock,
            |s| Ok(s.value + 1),
            |plan| Ok(*plan * 10),
            |s, plan, done| {
                s.value = plan;
                Ok(done)
            },
            |_| Ok(()),
        )
        .expect("retry");
        assert_eq!(out, 10);
        assert_eq!(lock.lock().value, 1);
    }

    #[test]
    fn stale_decisions_are_abandoned_and_redone() {
        let lock = Mutex::new(Counter {
            generation: 1,
            value: 0,
        });
        let bumps = Cell::new(2);
        let abandoned = Cell::new(0);
        let decided = with_generation_retry(
            &lock,
            |s| Ok(s.generation),
            |_| {
                // Simulate a concurrent membership change during the work.
                if bumps.get() > 0 {
                    bumps.set(bumps.get() - 1);
                    lock.lock().generation += 1;
                }
                Ok(())
            },
            |_, plan, ()| Ok(plan),
            |()| {
                abandoned.set(abandoned.get() + 1);
                Ok(())
            },
        )
        .expect("retry");
        assert_eq!(decided, 3);
        assert_eq!(abandoned.get(), 2);
    }

    #[test]
    fn endless_churn_reports_busy() {
        let lock = Mutex::new(Counter {
            generation: 0,
            value: 0,
        });
        let err = with_generation_retry(
            &lock,
            |_| Ok(()),
            |()| {
                lock.lock().generation += 1;
                Ok(())
            },
            |_, (), ()| Ok(()),
            |()| Ok(()),
        )
        .unwrap_err();
        assert!(matches!(err, UfsError::Busy));
    }
}
