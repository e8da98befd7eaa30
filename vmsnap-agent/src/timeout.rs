//! Bounds how long filesystems stay frozen
//!
//! A held freeze stalls every writer on the machine, so the guard prefers
//! releasing the freeze over waiting for a slow snapshot. It never kills
//! work: a supervised worker that misses the deadline is abandoned and keeps
//! running, and whatever it produces afterwards is discarded.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// How a supervised unit of work ended, from the waiter's point of view
#[derive(Debug)]
pub enum Supervised<T> {
    /// The worker handed over its result before the deadline
    Completed(T),
    /// The deadline passed first; the worker was left running
    Abandoned { waited: Duration },
    /// The worker panicked or could not be started
    Failed(String),
}

/// Freeze-hold bound
#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    limit: Duration,
}

impl TimeoutGuard {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Deadline for a call that starts now
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.limit
    }

    /// Run `work` on its own thread and wait for it up to the limit
    pub fn supervise<T, F>(&self, work: F) -> Supervised<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let started = Instant::now();

        let spawned = thread::Builder::new()
            .name("vmsnap-snapshot".to_string())
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(work));
                // The receiver is gone once the waiter has abandoned us
                let _ = tx.send(result);
            });

        if let Err(e) = spawned {
            return Supervised::Failed(format!("cannot start snapshot worker: {e}"));
        }

        match rx.recv_timeout(self.limit) {
            Ok(Ok(value)) => Supervised::Completed(value),
            Ok(Err(panic)) => Supervised::Failed(panic_message(panic.as_ref())),
            Err(RecvTimeoutError::Timeout) => Supervised::Abandoned {
                waited: started.elapsed(),
            },
            Err(RecvTimeoutError::Disconnected) => {
                Supervised::Failed("snapshot worker exited without a result".to_string())
            }
        }
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_completed_before_deadline() {
        let guard = TimeoutGuard::new(Duration::from_secs(5));
        match guard.supervise(|| 42) {
            Supervised::Completed(v) => assert_eq!(v, 42),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_abandoned_worker_keeps_running() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let guard = TimeoutGuard::new(Duration::from_millis(50));

        let outcome = guard.supervise(move || {
            thread::sleep(Duration::from_millis(300));
            flag.store(true, Ordering::SeqCst);
            7
        });

        match outcome {
            Supervised::Abandoned { waited } => assert!(waited >= Duration::from_millis(50)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!finished.load(Ordering::SeqCst));

        // Not cancelled: the worker finishes on its own
        thread::sleep(Duration::from_millis(600));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let guard = TimeoutGuard::new(Duration::from_secs(5));
        let outcome: Supervised<()> = guard.supervise(|| panic!("storage client exploded"));
        match outcome {
            Supervised::Failed(msg) => assert!(msg.contains("storage client exploded")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_deadline_is_in_the_future() {
        let guard = TimeoutGuard::new(Duration::from_secs(60));
        assert!(guard.deadline() > Instant::now());
        assert_eq!(guard.limit(), Duration::from_secs(60));
    }
}
