//! One-time module initialization shared by every request.
//!
//! State machine: `Uninitialized -> Initializing -> Ready`, or
//! `Initializing -> Failed`. It never goes back. The first caller that finds
//! the cell uninitialized starts the load; everyone arriving while it runs
//! awaits the same shared future instead of starting another one.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared, TryFutureExt};

use super::transcoder::{panic_message, LoadError};

type PendingLoad<M> = Shared<BoxFuture<'static, Result<Arc<M>, LoadError>>>;

enum InitState<M> {
    Uninitialized,
    Initializing(PendingLoad<M>),
    Ready(Arc<M>),
    /// Terminal. Later callers get the same error back.
    Failed(LoadError),
}

/// Observable phase of an [`InitCell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

/// Lazily initialized, single-flight module handle.
pub struct InitCell<M> {
    state: Mutex<InitState<M>>,
    /// Number of load attempts actually started.
    attempts: AtomicUsize,
}

impl<M> std::fmt::Debug for InitCell<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitCell")
            .field("phase", &self.phase())
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl<M> Default for InitCell<M> {
    fn default() -> Self {
        Self {
            state: Mutex::new(InitState::Uninitialized),
            attempts: AtomicUsize::new(0),
        }
    }
}

impl<M> InitCell<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> InitPhase {
        match *self.lock() {
            InitState::Uninitialized => InitPhase::Uninitialized,
            InitState::Initializing(_) => InitPhase::Initializing,
            InitState::Ready(_) => InitPhase::Ready,
            InitState::Failed(_) => InitPhase::Failed,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, InitState<M>> {
        // The lock is never held across an await or user code, so a poisoned
        // guard still holds a consistent state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<M: Send + Sync + 'static> InitCell<M> {
    /// Return the module, running `init` only if no load has started yet.
    ///
    /// `init` is called with the lock held, so it must only build the future;
    /// the actual work happens when the future is awaited, after the lock is
    /// released.
    pub async fn get_or_init<F, Fut>(&self, init: F) -> Result<Arc<M>, LoadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<M, LoadError>> + Send + 'static,
    {
        let pending = {
            let mut state = self.lock();
            match &*state {
                InitState::Ready(module) => return Ok(module.clone()),
                InitState::Failed(err) => return Err(err.clone()),
                InitState::Initializing(pending) => pending.clone(),
                InitState::Uninitialized => {
                    self.attempts.fetch_add(1, Ordering::SeqCst);
                    // A panicking load must still settle the cell, or every
                    // later caller would poll a poisoned `Shared`.
                    let pending = AssertUnwindSafe(init())
                        .catch_unwind()
                        .map(|caught| {
                            caught.unwrap_or_else(|panic| {
                                Err(LoadError::Other(format!(
                                    "module loader panicked: {}",
                                    panic_message(&*panic)
                                )))
                            })
                        })
                        .map_ok(Arc::new)
                        .boxed()
                        .shared();
                    *state = InitState::Initializing(pending.clone());
                    pending
                }
            }
        };

        let outcome = pending.await;

        // Whichever waiter resumes first records the outcome.
        let mut state = self.lock();
        if matches!(*state, InitState::Initializing(_)) {
            *state = match &outcome {
                Ok(module) => InitState::Ready(module.clone()),
                Err(err) => InitState::Failed(err.clone()),
            };
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures_util::future::join_all;

    async fn slow_load(counter: Arc<AtomicUsize>, value: u32) -> Result<u32, LoadError> {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(value)
    }

    async fn exploding_load() -> Result<u32, LoadError> {
        panic!("loader exploded")
    }

    #[tokio::test]
    async fn test_starts_uninitialized() {
        let cell: InitCell<u32> = InitCell::new();
        assert_eq!(cell.phase(), InitPhase::Uninitialized);
        assert_eq!(cell.attempts(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let cell: InitCell<u32> = InitCell::new();
        let loads = Arc::new(AtomicUsize::new(0));

        let callers = (0..8).map(|i| {
            let loads = loads.clone();
            let cell = &cell;
            async move { cell.get_or_init(move || slow_load(loads, 100 + i)).await }
        });
        let results = join_all(callers).await;

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cell.attempts(), 1);
        assert_eq!(cell.phase(), InitPhase::Ready);
        // Every caller sees the value produced by the first one.
        for result in results {
            assert_eq!(*result.unwrap(), 100);
        }
    }

    #[tokio::test]
    async fn test_ready_cell_skips_init() {
        let cell: InitCell<u32> = InitCell::new();
        let loads = Arc::new(AtomicUsize::new(0));

        cell.get_or_init({
            let loads = loads.clone();
            move || slow_load(loads, 1)
        })
        .await
        .unwrap();
        let second = cell
            .get_or_init(|| async { Err(LoadError::Other("must not run".into())) })
            .await
            .unwrap();

        assert_eq!(*second, 1);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_permanent() {
        let cell: InitCell<u32> = InitCell::new();

        let first = cell
            .get_or_init(|| async { Err(LoadError::Other("no module".into())) })
            .await;
        assert_eq!(first.unwrap_err().to_string(), "no module");
        assert_eq!(cell.phase(), InitPhase::Failed);

        let second = cell.get_or_init(|| async { Ok(7) }).await;
        assert_eq!(second.unwrap_err().to_string(), "no module");
        assert_eq!(cell.attempts(), 1);
    }

    #[tokio::test]
    async fn test_panicking_load_fails_permanently() {
        let cell: InitCell<u32> = InitCell::new();
        let expected = "module loader panicked: loader exploded";

        let first = cell.get_or_init(exploding_load).await;
        assert_eq!(first.unwrap_err().to_string(), expected);
        assert_eq!(cell.phase(), InitPhase::Failed);

        let second = cell.get_or_init(|| async { Ok(7) }).await;
        assert_eq!(second.unwrap_err().to_string(), expected);
        assert_eq!(cell.attempts(), 1);
    }

    #[tokio::test]
    async fn test_phase_is_initializing_while_load_runs() {
        let cell = Arc::new(InitCell::<u32>::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let waiter = tokio::spawn({
            let cell = cell.clone();
            async move {
                cell.get_or_init(move || async move {
                    let _ = release_rx.await;
                    Ok(5)
                })
                .await
            }
        });

        while cell.phase() == InitPhase::Uninitialized {
            tokio::task::yield_now().await;
        }
        assert_eq!(cell.phase(), InitPhase::Initializing);

        release_tx.send(()).unwrap();
        assert_eq!(*waiter.await.unwrap().unwrap(), 5);
        assert_eq!(cell.phase(), InitPhase::Ready);
    }
}
