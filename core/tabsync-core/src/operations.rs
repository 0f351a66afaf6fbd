//! Lock-Protected Session Operations
//!
//! Every write to the shared blob is a read-modify-write cycle executed here.
//! Storage has no compare-and-swap, so mutual exclusion between execution
//! contexts is emulated with an optimistic lock written *into* the blob.
//!
//! # Protocol (locking strategies)
//!
//! ```text
//!  read ──lock present?──► Contended(Initial)
//!   │
//!  write state+lock(token)
//!  read ──lock != token?──► Contended(Acquired)
//!   │
//!  transform(state without lock)
//!  read ──lock != token?──► Contended(PostProcess)
//!   │
//!  write result+expire+lock(token)      (or clear ──► settled)
//!  read ──lock != token?──► Contended(PostPersist)
//!   │
//!  write result without lock ──► settled
//! ```
//!
//! A contended attempt sleeps for the retry delay and restarts from the first
//! read, so each restart picks up whatever a contender wrote meanwhile.
//! After `max_tries` contended attempts the operation is dropped silently:
//! neither `transform` nor `on_settled` runs again and nothing more is written.
//!
//! Strategies without locking collapse the protocol to read, transform,
//! write, settle.
//!
//! # Ordering
//!
//! Operations submitted to one [`OperationProcessor`] run strictly one after
//! another, in submission order. Operation *k+1* does not read the blob until
//! operation *k* has settled (or been dropped).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::state::{SessionState, LOCK_KEY};
use crate::storage::SessionStorage;

/// What a transform wants done with the blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// Write this state (with a fresh `expire`). A cleared state behaves like
    /// [`Processed::Clear`].
    Persist(SessionState),
    /// Remove the blob entirely.
    Clear,
    /// Write nothing. The lock, if taken, is still released.
    Unchanged,
}

type Transform = Box<dyn FnMut(SessionState) -> Processed + Send>;
type Settled = Box<dyn FnOnce(SessionState) + Send>;

/// A read-modify-write request against the session blob.
///
/// `transform` may run more than once when the lock is contended after it
/// ran; only the run belonging to the successful attempt is persisted.
pub struct SessionOperation {
    transform: Transform,
    on_settled: Option<Settled>,
}

impl SessionOperation {
    pub fn new<F>(transform: F) -> Self
    where
        F: FnMut(SessionState) -> Processed + Send + 'static,
    {
        SessionOperation {
            transform: Box::new(transform),
            on_settled: None,
        }
    }

    /// Adds a callback invoked once with the final persisted (or cleared)
    /// state. Callbacks run in the order they were added.
    pub fn on_settled<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(SessionState) + Send + 'static,
    {
        let previous = self.on_settled.take();
        self.on_settled = Some(Box::new(move |state: SessionState| {
            if let Some(previous) = previous {
                previous(state.clone());
            }
            callback(state);
        }));
        self
    }

    fn settle(self, state: SessionState) {
        if let Some(callback) = self.on_settled {
            callback(state);
        }
    }
}

impl std::fmt::Debug for SessionOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOperation")
            .field("has_on_settled", &self.on_settled.is_some())
            .finish()
    }
}

/// Re-verification points of the lock protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Another writer already holds the lock.
    Initial,
    /// Our lock write was overwritten before we read it back.
    Acquired,
    /// The lock changed while `transform` ran.
    PostProcess,
    /// Our result was overwritten right after we wrote it.
    PostPersist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Attempt {
    Settled(SessionState),
    Contended(Checkpoint),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorSettings {
    pub lock_retry_delay: Duration,
    pub lock_max_tries: u32,
    pub expiration_delay: Duration,
}

impl From<&SessionConfig> for ProcessorSettings {
    fn from(config: &SessionConfig) -> Self {
        ProcessorSettings {
            lock_retry_delay: config.lock_retry_delay,
            lock_max_tries: config.lock_max_tries,
            expiration_delay: config.expiration_delay,
        }
    }
}

enum Job {
    Run(SessionOperation),
    Barrier(oneshot::Sender<()>),
}

/// FIFO executor of [`SessionOperation`]s for one execution context.
///
/// Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct OperationProcessor {
    sender: mpsc::UnboundedSender<Job>,
}

impl OperationProcessor {
    /// Spawns the worker task. Must be called inside a tokio runtime.
    pub fn spawn(
        storage: SessionStorage,
        settings: ProcessorSettings,
        clock: Arc<dyn Clock>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let worker = Worker {
            storage,
            settings,
            clock,
        };

        let handle = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                match job {
                    Job::Run(operation) => worker.process(operation).await,
                    Job::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        (OperationProcessor { sender }, handle)
    }

    /// Queues an operation without waiting for it.
    pub fn submit(&self, operation: SessionOperation) {
        if self.sender.send(Job::Run(operation)).is_err() {
            debug!("Session operation dropped: processor stopped");
        }
    }

    /// Queues an operation and waits for it to settle.
    ///
    /// Returns `None` if the operation was dropped (lock retries exhausted or
    /// processor stopped).
    pub async fn run(&self, operation: SessionOperation) -> Option<SessionState> {
        let (done, settled) = oneshot::channel();
        self.submit(operation.on_settled(move |state| {
            let _ = done.send(state);
        }));
        settled.await.ok()
    }

    /// Waits until every operation queued before this call has settled or
    /// been dropped. Touches no storage.
    pub async fn flush(&self) {
        let (done, flushed) = oneshot::channel();
        if self.sender.send(Job::Barrier(done)).is_ok() {
            let _ = flushed.await;
        }
    }
}

struct Worker {
    storage: SessionStorage,
    settings: ProcessorSettings,
    clock: Arc<dyn Clock>,
}

impl Worker {
    async fn process(&self, mut operation: SessionOperation) {
        if !self.storage.supports_locking() {
            let state = self.apply_unlocked(&mut operation.transform);
            operation.settle(state);
            return;
        }

        for attempt in 1..=self.settings.lock_max_tries {
            match self.attempt_locked(&mut operation.transform) {
                Attempt::Settled(state) => {
                    operation.settle(state);
                    return;
                }
                Attempt::Contended(checkpoint) => {
                    debug!(?checkpoint, attempt, "Session lock contended; retrying");
                    tokio::time::sleep(self.settings.lock_retry_delay).await;
                }
            }
        }

        debug!(
            max_tries = self.settings.lock_max_tries,
            "Session operation dropped after exhausting lock retries"
        );
    }

    fn apply_unlocked(&self, transform: &mut Transform) -> SessionState {
        let current = self.storage.retrieve_session().without_lock();
        match transform(current.clone()) {
            Processed::Persist(state) if !state.is_cleared() => {
                let state = self.with_fresh_expire(state);
                self.storage.persist_session(&state);
                state
            }
            Processed::Persist(_) | Processed::Clear => {
                self.storage.clear_session();
                SessionState::new()
            }
            Processed::Unchanged => current,
        }
    }

    fn attempt_locked(&self, transform: &mut Transform) -> Attempt {
        let current = self.storage.retrieve_session();
        if current.lock().is_some() {
            return Attempt::Contended(Checkpoint::Initial);
        }

        let token = new_lock_token();
        let mut locked = current;
        locked.set_lock(&token);
        self.storage.persist_session(&locked);

        let current = self.storage.retrieve_session();
        if current.lock() != Some(token.as_str()) {
            return Attempt::Contended(Checkpoint::Acquired);
        }

        let processed = transform(current.without_lock());

        let current = self.storage.retrieve_session();
        if current.lock() != Some(token.as_str()) {
            return Attempt::Contended(Checkpoint::PostProcess);
        }

        match processed {
            Processed::Persist(state) if !state.is_cleared() => {
                let mut state = self.with_fresh_expire(state);
                state.set_lock(&token);
                self.storage.persist_session(&state);
            }
            Processed::Persist(_) | Processed::Clear => {
                // Clearing also drops the lock; there is nothing left to verify.
                self.storage.clear_session();
                return Attempt::Settled(SessionState::new());
            }
            Processed::Unchanged => {}
        }

        let current = self.storage.retrieve_session();
        if current.lock() != Some(token.as_str()) {
            return Attempt::Contended(Checkpoint::PostPersist);
        }

        let released = current.without_lock();
        self.storage.persist_session(&released);
        Attempt::Settled(released)
    }

    fn with_fresh_expire(&self, mut state: SessionState) -> SessionState {
        state.remove(LOCK_KEY);
        state.expand(self.clock.now(), self.settings.expiration_delay);
        state
    }
}

fn new_lock_token() -> String {
    uuid::Uuid::new_v4().to_string()
}
