//! Per-product session lifecycle.
//!
//! Each product keeps a local cache of the last session state it saw and
//! reconciles it with the shared blob on every operation:
//!
//! - **renew**: activity found no session for this product; a fresh decision
//!   is stored (and an `id` minted if tracked). Notifies `renew` once.
//! - **expand**: the session is still live; `expire` is pushed forward.
//! - **expire**: the blob no longer matches the cache (cleared, timed out, or
//!   replaced by another context). The cache empties and `expire` is notified
//!   once per cached session.
//!
//! Several products share one blob; each only writes its own key plus the
//! shared `id` and `created`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use crate::clock::{Clock, TimeStamp};
use crate::decision::ComputeDecision;
use crate::history::ValueHistory;
use crate::operations::{OperationProcessor, Processed, SessionOperation};
use crate::state::{SessionState, CREATED_KEY, ID_KEY};
use crate::storage::SessionStorage;

const NOTIFICATION_CAPACITY: usize = 16;

/// What a product knows about the session active at some point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Absent when the product does not track the session.
    pub id: Option<String>,
    pub tracking_type: Option<String>,
}

struct StoreState {
    cache: SessionState,
    history: ValueHistory<SessionContext>,
}

pub(crate) struct SessionStore {
    product_key: String,
    compute: ComputeDecision,
    processor: OperationProcessor,
    clock: Arc<dyn Clock>,
    time_out_delay: Duration,
    state: Mutex<StoreState>,
    renew: broadcast::Sender<()>,
    expire: broadcast::Sender<()>,
}

impl SessionStore {
    pub(crate) fn new(
        product_key: String,
        compute: ComputeDecision,
        processor: OperationProcessor,
        storage: &SessionStorage,
        clock: Arc<dyn Clock>,
        time_out_delay: Duration,
    ) -> Arc<Self> {
        let now = clock.now();
        let stored = storage.retrieve_session().without_lock();
        let cache = if stored.is_active(now, time_out_delay) {
            stored
        } else {
            SessionState::new()
        };

        let (renew, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (expire, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Arc::new(SessionStore {
            product_key,
            compute,
            processor,
            clock,
            time_out_delay,
            state: Mutex::new(StoreState {
                cache,
                history: ValueHistory::new(time_out_delay),
            }),
            renew,
            expire,
        })
    }

    pub(crate) fn product_key(&self) -> &str {
        &self.product_key
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn subscribe_renew(&self) -> broadcast::Receiver<()> {
        self.renew.subscribe()
    }

    pub(crate) fn subscribe_expire(&self) -> broadcast::Receiver<()> {
        self.expire.subscribe()
    }

    pub(crate) fn cached_session(&self) -> SessionState {
        self.lock_state().cache.clone()
    }

    pub(crate) fn find_context(&self, at: Option<TimeStamp>) -> Option<SessionContext> {
        self.lock_state().history.find(at)
    }

    /// Restarts the history with the current context, dated `start`.
    pub(crate) fn reset_history(&self, start: TimeStamp) {
        let mut state = self.lock_state();
        let context = self.context_of(&state.cache);
        state.history.reset();
        state.history.add(context, start);
    }

    pub(crate) fn clear_old_history(&self) {
        let now = self.clock.now();
        self.lock_state().history.clear_old(now);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────

    /// Keeps a live session alive, or starts a new one for this product.
    pub(crate) fn expand_or_renew(self: &Arc<Self>) -> SessionOperation {
        let is_tracked = Arc::new(AtomicBool::new(false));

        let store = Arc::clone(self);
        let tracked = Arc::clone(&is_tracked);
        let transform = move |session: SessionState| {
            let mut session = store.synchronize(session);
            tracked.store(store.apply_decision(&mut session), Ordering::SeqCst);
            Processed::Persist(session)
        };

        let store = Arc::clone(self);
        SessionOperation::new(transform).on_settled(move |session| {
            if is_tracked.load(Ordering::SeqCst) && !store.has_session_in_cache() {
                store.renew_in_cache(session);
            } else {
                store.lock_state().cache = session;
            }
        })
    }

    /// Pushes the inactivity deadline of a session this product already
    /// knows about. Never starts a session.
    pub(crate) fn expand(self: &Arc<Self>) -> SessionOperation {
        let store = Arc::clone(self);
        SessionOperation::new(move |session| {
            if store.has_session_in_cache() {
                Processed::Persist(store.synchronize(session))
            } else {
                Processed::Unchanged
            }
        })
    }

    /// Clears a blob that is no longer active, then reconciles the cache.
    /// Writes nothing while the session is live.
    pub(crate) fn watch(self: &Arc<Self>) -> SessionOperation {
        let store = Arc::clone(self);
        let clock = Arc::clone(&self.clock);
        let time_out_delay = self.time_out_delay;
        SessionOperation::new(move |session: SessionState| {
            if session.is_active(clock.now(), time_out_delay) {
                Processed::Unchanged
            } else {
                Processed::Clear
            }
        })
        .on_settled(move |session| {
            store.synchronize(session);
        })
    }

    /// Clears the shared session for every product.
    pub(crate) async fn expire(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let operation = SessionOperation::new(|_| Processed::Clear).on_settled(move |_| {
            store.synchronize(SessionState::new());
        });

        if self.processor.run(operation).await.is_none() {
            // The clear was dropped; still end the session locally
            self.synchronize(SessionState::new());
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reconciliation
    // ─────────────────────────────────────────────────────────────────────

    /// Reconciles the cache with `session` and returns the live view of it
    /// (an inactive session reads as empty).
    fn synchronize(&self, session: SessionState) -> SessionState {
        let session = if session.is_active(self.clock.now(), self.time_out_delay) {
            session
        } else {
            SessionState::new()
        };

        let mut state = self.lock_state();
        if self.cache_has_product(&state.cache) {
            if self.is_outdated(&state.cache, &session) {
                self.expire_in_cache(&mut state);
            } else {
                state.cache = session.clone();
            }
        }
        session
    }

    /// Stores this product's decision, minting a session id if tracked.
    fn apply_decision(&self, session: &mut SessionState) -> bool {
        let decision = (self.compute)(session.get(&self.product_key));
        session.set(self.product_key.clone(), decision.tracking_type);

        if decision.is_tracked && session.id().is_none() {
            session.set(ID_KEY, uuid::Uuid::new_v4().to_string());
            session.set(CREATED_KEY, self.clock.now().to_string());
        }
        decision.is_tracked
    }

    fn has_session_in_cache(&self) -> bool {
        self.cache_has_product(&self.lock_state().cache)
    }

    fn cache_has_product(&self, cache: &SessionState) -> bool {
        cache.contains(&self.product_key)
    }

    fn is_outdated(&self, cache: &SessionState, session: &SessionState) -> bool {
        cache.id() != session.id()
            || cache.get(&self.product_key) != session.get(&self.product_key)
    }

    fn expire_in_cache(&self, state: &mut StoreState) {
        debug!(
            product = %self.product_key,
            session_id = state.cache.id().unwrap_or("-"),
            "Session expired"
        );
        state.cache = SessionState::new();
        state.history.close_active(self.clock.now());
        let _ = self.expire.send(());
    }

    fn renew_in_cache(&self, session: SessionState) {
        debug!(
            product = %self.product_key,
            session_id = session.id().unwrap_or("-"),
            "Session renewed"
        );
        let context = self.context_of(&session);
        {
            let mut state = self.lock_state();
            state.cache = session;
            state.history.add(context, self.clock.now());
        }
        let _ = self.renew.send(());
    }

    fn context_of(&self, session: &SessionState) -> SessionContext {
        SessionContext {
            id: session.id().map(str::to_string),
            tracking_type: session.get(&self.product_key).map(str::to_string),
        }
    }
}
