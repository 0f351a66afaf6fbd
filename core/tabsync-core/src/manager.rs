//! Session host and per-product managers.
//!
//! A [`SessionHost`] stands for one execution context (a tab). It owns the
//! single FIFO operation processor shared by all products of that context,
//! the activity and visibility signals, and every timer task. Dropping the
//! host (or calling [`SessionHost::stop`]) tears all of it down.
//!
//! Each [`SessionHost::start_session_manager`] call spawns one driver task:
//!
//! ```text
//!   poll every poll_delay ───────────────► watch            (detect expiry)
//!   visible && every visibility delay ───► expand
//!   visibility -> Visible ───────────────► expand
//!   activity (throttled) ────────────────► expand_or_renew  (may renew)
//!   every history_clear_interval ────────► drop old history
//! ```

use std::future::pending;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::activity::{ActivityKind, Throttle, Visibility};
use crate::clock::{Clock, RuntimeClock, TimeStamp};
use crate::config::SessionConfig;
use crate::decision::{ComputeDecision, TrackingDecision};
use crate::error::Result;
use crate::operations::{OperationProcessor, ProcessorSettings};
use crate::state::SessionState;
use crate::storage::{SessionStorage, SessionStoreStrategy};
use crate::store::{SessionContext, SessionStore};

const ACTIVITY_CAPACITY: usize = 64;
/// Shortest period a driver timer may tick at.
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
struct DriverTimers {
    poll_delay: Duration,
    visibility_check_delay: Duration,
    history_clear_interval: Duration,
}

impl From<&SessionConfig> for DriverTimers {
    fn from(config: &SessionConfig) -> Self {
        DriverTimers {
            poll_delay: config.poll_delay.max(MIN_TIMER_PERIOD),
            visibility_check_delay: config.visibility_check_delay.max(MIN_TIMER_PERIOD),
            history_clear_interval: config.history_clear_interval.max(MIN_TIMER_PERIOD),
        }
    }
}

pub struct SessionHost {
    config: SessionConfig,
    storage: SessionStorage,
    clock: Arc<dyn Clock>,
    origin: TimeStamp,
    processor: OperationProcessor,
    activity: broadcast::Sender<ActivityKind>,
    visibility: watch::Sender<Visibility>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionHost {
    /// Creates a host over `strategy`. Must be called inside a tokio runtime.
    pub fn new(config: SessionConfig, strategy: Arc<dyn SessionStoreStrategy>) -> Self {
        Self::with_clock(config, strategy, Arc::new(RuntimeClock::new()))
    }

    pub fn with_clock(
        config: SessionConfig,
        strategy: Arc<dyn SessionStoreStrategy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let storage = SessionStorage::new(strategy);
        let (processor, worker) = OperationProcessor::spawn(
            storage.clone(),
            ProcessorSettings::from(&config),
            Arc::clone(&clock),
        );
        let (activity, _) = broadcast::channel(ACTIVITY_CAPACITY);
        let (visibility, _) = watch::channel(Visibility::default());

        SessionHost {
            origin: clock.now(),
            config,
            storage,
            clock,
            processor,
            activity,
            visibility,
            tasks: Mutex::new(vec![worker]),
        }
    }

    /// Creates a host over the storage medium named in `config`.
    pub fn from_config(config: SessionConfig) -> Result<Self> {
        let strategy = config.storage.build()?;
        Ok(Self::new(config, strategy))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Wall-clock time at which this host was created.
    pub fn origin(&self) -> TimeStamp {
        self.origin
    }

    /// Starts the session lifecycle of one product.
    ///
    /// Resolves once the product's first expand-or-renew has settled, so the
    /// returned manager already reflects the stored (or freshly started)
    /// session. `compute` receives the raw value stored under `product_key`.
    pub async fn start_session_manager<F>(
        &self,
        product_key: impl Into<String>,
        compute: F,
    ) -> SessionManager
    where
        F: Fn(Option<&str>) -> TrackingDecision + Send + Sync + 'static,
    {
        let compute: ComputeDecision = Arc::new(compute);
        let store = SessionStore::new(
            product_key.into(),
            compute,
            self.processor.clone(),
            &self.storage,
            Arc::clone(&self.clock),
            self.config.time_out_delay,
        );

        self.processor.run(store.expand_or_renew()).await;
        store.reset_history(self.origin);

        let driver = tokio::spawn(drive(
            Arc::clone(&store),
            self.processor.clone(),
            DriverTimers::from(&self.config),
            self.activity.subscribe(),
            self.visibility.subscribe(),
        ));
        self.track(driver);

        debug!(product = %store.product_key(), "Session manager started");
        SessionManager {
            store,
            processor: self.processor.clone(),
        }
    }

    /// Signals a user interaction to every product of this host.
    pub fn notify_activity(&self, kind: ActivityKind) {
        trace!(?kind, "Activity");
        let _ = self.activity.send(kind);
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        trace!(?visibility, "Visibility changed");
        self.visibility.send_replace(visibility);
    }

    pub fn visibility(&self) -> Visibility {
        *self.visibility.borrow()
    }

    /// Waits until every operation queued so far has settled.
    pub async fn flush(&self) {
        self.processor.flush().await;
    }

    /// Cancels every timer, listener, and queued operation of this host.
    pub fn stop(&self) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }
}

impl Drop for SessionHost {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SessionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHost")
            .field("origin", &self.origin)
            .field("storage", &self.storage)
            .finish()
    }
}

/// One product's view of the shared session.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<SessionStore>,
    processor: OperationProcessor,
}

impl SessionManager {
    pub fn product_key(&self) -> &str {
        self.store.product_key()
    }

    /// The session context active at `at`, or the current one when `at` is
    /// `None`. Returns `None` when no session was active.
    pub fn find_active_session(&self, at: Option<TimeStamp>) -> Option<SessionContext> {
        self.store.find_context(at)
    }

    /// The last session state this product reconciled with storage.
    pub fn cached_session(&self) -> SessionState {
        self.store.cached_session()
    }

    /// Fires once each time activity starts a new tracked session.
    pub fn subscribe_renew(&self) -> broadcast::Receiver<()> {
        self.store.subscribe_renew()
    }

    /// Fires at most once per session this product saw end.
    pub fn subscribe_expire(&self) -> broadcast::Receiver<()> {
        self.store.subscribe_expire()
    }

    /// Ends the shared session now.
    pub async fn expire(&self) {
        self.store.expire().await;
    }

    /// Keeps a live session alive, or starts one, like user activity would.
    pub async fn expand_or_renew(&self) {
        self.processor.run(self.store.expand_or_renew()).await;
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("product_key", &self.product_key())
            .finish()
    }
}

async fn drive(
    store: Arc<SessionStore>,
    processor: OperationProcessor,
    timers: DriverTimers,
    mut activity: broadcast::Receiver<ActivityKind>,
    mut visibility: watch::Receiver<Visibility>,
) {
    let start = Instant::now();
    let mut poll = interval_at(start + timers.poll_delay, timers.poll_delay);
    let mut visibility_check = interval_at(
        start + timers.visibility_check_delay,
        timers.visibility_check_delay,
    );
    let mut history_cleanup = interval_at(
        start + timers.history_clear_interval,
        timers.history_clear_interval,
    );
    for timer in [&mut poll, &mut visibility_check, &mut history_cleanup] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    let mut throttle = Throttle::new(timers.poll_delay);

    loop {
        let trailing = throttle.deadline();
        tokio::select! {
            _ = poll.tick() => processor.submit(store.watch()),
            _ = visibility_check.tick() => {
                if *visibility.borrow() == Visibility::Visible {
                    processor.submit(store.expand());
                }
            }
            changed = visibility.changed() => {
                if changed.is_err() {
                    break;
                }
                if *visibility.borrow_and_update() == Visibility::Visible {
                    processor.submit(store.expand());
                }
            }
            received = activity.recv() => match received {
                // A lagged receiver still saw activity
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if throttle.hit(Instant::now()) {
                        processor.submit(store.expand_or_renew());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = until(trailing) => {
                if throttle.take_trailing(Instant::now()) {
                    processor.submit(store.expand_or_renew());
                }
            }
            _ = history_cleanup.tick() => store.clear_old_history(),
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
