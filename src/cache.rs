//! Cancelable singleflight cache for builds.
//!
//! The cache holds at most one entry: the latest build. Concurrent
//! submissions for the same key collapse into one worker whose progress is
//! fanned out to every submitter; a submission for a *different* key cancels
//! the in-flight build and replaces the entry atomically. Waiters parked on
//! a replaced entry observe its identity change and surface
//! [`SubmitError::Cancelled`] instead of reading the successor's state.

use std::fmt::Debug;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use anyhow::anyhow;
use thiserror::Error;

use crate::broadcast::{Listener, ProgressBroadcaster};

/// One-shot cooperative stop flag handed to build workers. Once set, stays
/// set.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a build worker can end, other than returning a result.
#[derive(Debug, Error)]
pub enum BuildFailure {
    /// The worker noticed its cancel token and stopped.
    #[error("build was cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Outcome of one submission.
#[derive(Clone, Debug, Error)]
pub enum SubmitError {
    /// This submission's entry was replaced by a build for a different key
    /// before it finished.
    #[error("build was cancelled by a newer request")]
    Cancelled,
    /// The build failed. Every submission joined to the entry sees the same
    /// error, and it stays cached until the entry is replaced.
    #[error("build failed: {0}")]
    Worker(Arc<anyhow::Error>),
}

/// A build worker: runs once on a dedicated thread, reporting progress and
/// polling the cancel token between phases.
pub type Worker<R> =
    Box<dyn FnOnce(&dyn Fn(&str, u8), &CancelToken) -> Result<R, BuildFailure> + Send>;

/// Idempotent one-shot signal; fires when an entry leaves the loading state
/// for any reason (terminal transition or replacement).
#[derive(Default)]
struct OnceEvent {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl OnceEvent {
    fn fire(&self) {
        let mut fired = self.fired.lock().unwrap();
        if !*fired {
            *fired = true;
            self.cond.notify_all();
        }
    }

    fn wait(&self) {
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            fired = self.cond.wait(fired).unwrap();
        }
    }
}

enum Status<R> {
    Loading,
    Complete(R),
    Failed(Arc<anyhow::Error>),
}

struct Entry<K, R> {
    /// Unique per entry; waiters compare it after waking to detect that
    /// their entry was replaced.
    id: u64,
    key: K,
    status: Status<R>,
    broadcaster: Arc<ProgressBroadcaster>,
    cancel: CancelToken,
    done: Arc<OnceEvent>,
}

/// Observable state of the current entry, for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Loading,
    Complete,
    Error,
}

pub struct SingleflightCache<K, R> {
    // shared with worker threads, which record their outcome after the
    // submitting call has already returned to the pool
    current: Arc<Mutex<Option<Entry<K, R>>>>,
    next_id: AtomicU64,
}

impl<K, R> Default for SingleflightCache<K, R> {
    fn default() -> Self {
        SingleflightCache {
            current: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<K, R> SingleflightCache<K, R>
where
    K: Clone + Eq + Debug + Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a build for `key`.
    ///
    /// Returns the cached result if the current entry already completed for
    /// this key, joins the in-flight build if one is loading, or cancels and
    /// replaces the current entry when the key differs. Blocks the calling
    /// thread until the joined entry reaches a terminal state or is
    /// replaced.
    pub fn submit(
        &self,
        key: K,
        worker: Worker<R>,
        listener: Option<Listener>,
    ) -> Result<R, SubmitError> {
        let (ident, done) = {
            let mut current = self.current.lock().unwrap();
            if let Some(entry) = current.as_ref().filter(|entry| entry.key == key) {
                match &entry.status {
                    Status::Complete(result) => {
                        log::info!("cache hit for {key:?}: returning cached result");
                        if let Some(listener) = listener {
                            let _ = listener("Using cached result", 100);
                        }
                        return Ok(result.clone());
                    }
                    Status::Failed(error) => {
                        log::info!("cache hit for {key:?}: re-raising cached error");
                        return Err(SubmitError::Worker(error.clone()));
                    }
                    Status::Loading => {
                        log::info!("joining in-flight build for {key:?}");
                        if let Some(listener) = listener {
                            entry.broadcaster.add(listener);
                        }
                        (entry.id, entry.done.clone())
                    }
                }
            } else {
                // Preempt any build for another key, then install a fresh
                // entry.
                let old_done = current.take().map(|old| {
                    log::info!("cancelling build for {:?} in favour of {key:?}", old.key);
                    old.cancel.set();
                    old.done
                });

                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let entry = Entry {
                    id,
                    key: key.clone(),
                    status: Status::Loading,
                    broadcaster: Arc::new(ProgressBroadcaster::new()),
                    cancel: CancelToken::new(),
                    done: Arc::new(OnceEvent::default()),
                };
                if let Some(listener) = listener {
                    entry.broadcaster.add(listener);
                }

                let broadcaster = entry.broadcaster.clone();
                let cancel = entry.cancel.clone();
                let done = entry.done.clone();

                log::info!("cache miss: starting build {id} for {key:?}");
                *current = Some(entry);
                drop(current);

                // Wake waiters parked on the replaced entry only after the
                // new one is installed, so they observe the identity change
                // rather than an empty cache.
                if let Some(old_done) = old_done {
                    old_done.fire();
                }

                self.spawn_worker(id, worker, broadcaster, cancel, done.clone());
                (id, done)
            }
        };

        done.wait();

        let current = self.current.lock().unwrap();
        match current.as_ref() {
            Some(entry) if entry.id == ident => match &entry.status {
                Status::Complete(result) => Ok(result.clone()),
                Status::Failed(error) => Err(SubmitError::Worker(error.clone())),
                // unreachable under the locking rules: done only fires at a
                // terminal transition or a replacement
                Status::Loading => Err(SubmitError::Worker(Arc::new(anyhow!(
                    "build {ident} signalled completion while still loading"
                )))),
            },
            _ => Err(SubmitError::Cancelled),
        }
    }

    /// Cooperatively stop the in-flight build, if any.
    ///
    /// Sets the current entry's cancel token without replacing it; the
    /// worker winds down on its next check and clears the entry, and every
    /// parked submission surfaces [`SubmitError::Cancelled`]. Completed and
    /// failed entries are left in place.
    pub fn cancel_current(&self) {
        let current = self.current.lock().unwrap();
        if let Some(entry) = current.as_ref() {
            if matches!(entry.status, Status::Loading) {
                log::info!("cancelling in-flight build {} on request", entry.id);
                entry.cancel.set();
            }
        }
    }

    /// Key and stage of the current entry, if any.
    pub fn snapshot(&self) -> Option<(K, Stage)> {
        let current = self.current.lock().unwrap();
        current.as_ref().map(|entry| {
            let stage = match entry.status {
                Status::Loading => Stage::Loading,
                Status::Complete(_) => Stage::Complete,
                Status::Failed(_) => Stage::Error,
            };
            (entry.key.clone(), stage)
        })
    }

    fn spawn_worker(
        &self,
        id: u64,
        worker: Worker<R>,
        broadcaster: Arc<ProgressBroadcaster>,
        cancel: CancelToken,
        done: Arc<OnceEvent>,
    ) {
        let slot = self.current.clone();
        thread::spawn(move || {
            let report = move |message: &str, percent: u8| broadcaster.broadcast(message, percent);
            let outcome = catch_unwind(AssertUnwindSafe(|| worker(&report, &cancel)));
            Self::finish(&slot, id, outcome);
            // fired outside the cache lock, and regardless of replacement,
            // so legacy waiters always wake
            done.fire();
        });
    }

    /// Record the worker's outcome. Only the entry that is *still current*
    /// may be mutated; a replaced build's outcome is discarded because the
    /// successor owns the cache now.
    fn finish(
        slot: &Mutex<Option<Entry<K, R>>>,
        id: u64,
        outcome: thread::Result<Result<R, BuildFailure>>,
    ) {
        let mut current = slot.lock().unwrap();
        let ours = current.as_ref().is_some_and(|entry| entry.id == id);
        if !ours {
            log::info!("build {id} finished after replacement; leaving successor untouched");
            return;
        }

        match outcome {
            Ok(Ok(result)) => {
                log::info!("build {id} complete");
                if let Some(entry) = current.as_mut() {
                    entry.status = Status::Complete(result);
                }
            }
            Ok(Err(BuildFailure::Cancelled)) => {
                // cancellation is never cached
                log::info!("build {id} cancelled, clearing entry");
                *current = None;
            }
            Ok(Err(BuildFailure::Failed(error))) => {
                log::error!("build {id} failed: {error:#}");
                if let Some(entry) = current.as_mut() {
                    entry.status = Status::Failed(Arc::new(error));
                }
            }
            Err(panic) => {
                let message = match panic.downcast::<&str>() {
                    Ok(message) => *message,
                    _ => "panic!()",
                };
                log::error!("build {id} panicked: {message}");
                if let Some(entry) = current.as_mut() {
                    entry.status = Status::Failed(Arc::new(anyhow!("build panicked: {message}")));
                }
            }
        }
    }
}
