//! Lifecycle tests for a single tab hosting one or more products.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tabsync_core::config::{
    EXPIRATION_DELAY, POLL_DELAY, TIME_OUT_DELAY, VISIBILITY_CHECK_DELAY,
};
use tabsync_core::{
    ActivityKind, MemoryStrategy, RuntimeClock, SessionConfig, SessionHost, SessionManager,
    StorageConfig, TrackingDecision, Visibility,
};
use tokio::sync::broadcast;
use tokio::time::sleep;

const START: i64 = 1_700_000_000_000;
const FIRST: &str = "first";
const SECOND: &str = "second";
const SECOND_MS: i64 = 1_000;

fn tracked(_: Option<&str>) -> TrackingDecision {
    TrackingDecision::tracked("tracked")
}

fn not_tracked(_: Option<&str>) -> TrackingDecision {
    TrackingDecision::not_tracked("not-tracked")
}

fn tab(medium: &MemoryStrategy) -> SessionHost {
    let config = SessionConfig {
        storage: StorageConfig::Memory { locking: true },
        ..SessionConfig::default()
    };
    SessionHost::with_clock(
        config,
        Arc::new(medium.clone()),
        Arc::new(RuntimeClock::starting_at(START)),
    )
}

fn stored(medium: &MemoryStrategy) -> String {
    medium.raw().unwrap_or_default()
}

/// Lets the driver react to signals, then waits for queued operations.
async fn settle(host: &SessionHost) {
    sleep(Duration::from_millis(1)).await;
    host.flush().await;
}

async fn click(host: &SessionHost) {
    host.notify_activity(ActivityKind::Click);
    settle(host).await;
}

/// Removes the blob behind the tab's back and waits for the next poll.
async fn expire_blob(host: &SessionHost, medium: &MemoryStrategy) {
    medium.set_raw(None);
    sleep(POLL_DELAY).await;
    settle(host).await;
}

fn notified(receiver: &mut broadcast::Receiver<()>) -> usize {
    let mut count = 0;
    while receiver.try_recv().is_ok() {
        count += 1;
    }
    count
}

fn assert_session_id_defined(manager: &SessionManager, medium: &MemoryStrategy) -> String {
    let id = manager
        .find_active_session(None)
        .and_then(|context| context.id)
        .expect("session id");
    assert!(id.chars().all(|c| c.is_ascii_hexdigit() || c == '-'), "{}", id);
    assert!(stored(medium).contains(&format!("id={}", id)));
    id
}

fn assert_session_id_undefined(manager: &SessionManager, medium: &MemoryStrategy) {
    assert_eq!(manager.find_active_session(None).and_then(|c| c.id), None);
    assert!(!stored(medium).contains("id="));
}

fn assert_tracking_type(manager: &SessionManager, medium: &MemoryStrategy, expected: &str) {
    let context = manager.find_active_session(None).expect("session context");
    assert_eq!(context.tracking_type.as_deref(), Some(expected));
    assert!(stored(medium).contains(&format!("{}={}", manager.product_key(), expected)));
}

fn assert_tracking_type_undefined(manager: &SessionManager, medium: &MemoryStrategy) {
    assert_eq!(
        manager.find_active_session(None).and_then(|c| c.tracking_type),
        None
    );
    assert!(!stored(medium).contains(&format!("{}=", manager.product_key())));
}

// ─────────────────────────────────────────────────────────────────────────────
// Stored decision
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_tracked_stores_tracking_type_and_session_id() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;

    assert_session_id_defined(&manager, &medium);
    assert_tracking_type(&manager, &medium, "tracked");
    assert!(stored(&medium).contains(&format!("created={}", START)));
    assert!(!stored(&medium).contains("lock="));
}

#[tokio::test(start_paused = true)]
async fn test_not_tracked_stores_tracking_type_only() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, not_tracked).await;

    assert_session_id_undefined(&manager, &medium);
    assert_tracking_type(&manager, &medium, "not-tracked");
}

#[tokio::test(start_paused = true)]
async fn test_keeps_existing_session_id_and_tracking_type() {
    let medium = MemoryStrategy::new(true);
    medium.set_raw(Some("id=abcdef&first=tracked"));
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;

    assert_eq!(
        manager.find_active_session(None).and_then(|c| c.id).as_deref(),
        Some("abcdef")
    );
    assert_tracking_type(&manager, &medium, "tracked");
}

#[tokio::test(start_paused = true)]
async fn test_keeps_existing_not_tracked_decision() {
    let medium = MemoryStrategy::new(true);
    medium.set_raw(Some("first=not-tracked"));
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, not_tracked).await;

    assert_session_id_undefined(&manager, &medium);
    assert_tracking_type(&manager, &medium, "not-tracked");
}

#[tokio::test(start_paused = true)]
async fn test_product_key_with_punctuation_is_stored_and_expires() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager("session.replay", tracked).await;
    let mut expire = manager.subscribe_expire();

    let context = manager.find_active_session(None).expect("session context");
    assert!(context.id.is_some());
    assert_eq!(context.tracking_type.as_deref(), Some("tracked"));
    assert!(stored(&medium).contains("session.replay=tracked"));

    manager.expire().await;
    sleep(EXPIRATION_DELAY + POLL_DELAY).await;
    settle(&host).await;

    assert_eq!(notified(&mut expire), 1);
    assert_eq!(manager.find_active_session(None), None);
}

#[tokio::test(start_paused = true)]
async fn test_foreign_keys_survive_writes() {
    let medium = MemoryStrategy::new(true);
    medium.set_raw(Some("foo.bar=1&x%20y=2"));
    let host = tab(&medium);
    let _manager = host.start_session_manager(FIRST, tracked).await;

    click(&host).await;

    assert!(stored(&medium).contains("foo.bar=1"));
    assert!(stored(&medium).contains("x%20y=2"));
}

#[tokio::test(start_paused = true)]
async fn test_decision_callback_receives_raw_stored_value() {
    for (blob, expected) in [
        (None, None),
        (Some("first=invalid"), Some("invalid")),
        (Some("first=tracked"), Some("tracked")),
        (Some("first=not-tracked"), Some("not-tracked")),
    ] {
        let medium = MemoryStrategy::new(true);
        medium.set_raw(blob);
        let host = tab(&medium);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        host.start_session_manager(FIRST, move |prior| {
            recorder.lock().unwrap().push(prior.map(str::to_string));
            TrackingDecision::tracked("tracked")
        })
        .await;

        assert_eq!(
            seen.lock().unwrap().first().cloned(),
            Some(expected.map(str::to_string)),
            "{:?}",
            blob
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Renewal
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_renews_on_activity_after_expiration() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;
    let first_id = assert_session_id_defined(&manager, &medium);
    let mut renew = manager.subscribe_renew();

    expire_blob(&host, &medium).await;

    assert_eq!(notified(&mut renew), 0);
    assert_session_id_undefined(&manager, &medium);
    assert_tracking_type_undefined(&manager, &medium);

    click(&host).await;

    assert_eq!(notified(&mut renew), 1);
    let renewed_id = assert_session_id_defined(&manager, &medium);
    assert_ne!(renewed_id, first_id);
    assert_tracking_type(&manager, &medium, "tracked");
}

#[tokio::test(start_paused = true)]
async fn test_visibility_does_not_renew_after_expiration() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;
    let mut renew = manager.subscribe_renew();

    expire_blob(&host, &medium).await;

    sleep(VISIBILITY_CHECK_DELAY).await;
    host.set_visibility(Visibility::Hidden);
    host.set_visibility(Visibility::Visible);
    settle(&host).await;

    assert_eq!(notified(&mut renew), 0);
    assert_session_id_undefined(&manager, &medium);
}

// ─────────────────────────────────────────────────────────────────────────────
// Several products on one tab
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_products_share_session_id() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let first = host.start_session_manager(FIRST, tracked).await;
    let second = host.start_session_manager(SECOND, tracked).await;

    let first_id = first.find_active_session(None).and_then(|c| c.id);
    assert!(first_id.is_some());
    assert_eq!(first_id, second.find_active_session(None).and_then(|c| c.id));
}

#[tokio::test(start_paused = true)]
async fn test_products_do_not_erase_each_other() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    host.start_session_manager(FIRST, tracked).await;

    // Leading expand-or-renew, then a visibility expand mid-window
    click(&host).await;
    sleep(POLL_DELAY / 2).await;
    host.set_visibility(Visibility::Hidden);
    host.set_visibility(Visibility::Visible);
    settle(&host).await;

    host.start_session_manager(SECOND, tracked).await;
    assert!(stored(&medium).contains("first=tracked"));
    assert!(stored(&medium).contains("second=tracked"));

    sleep(POLL_DELAY / 2).await;
    settle(&host).await;
    assert!(stored(&medium).contains("first=tracked"));
    assert!(stored(&medium).contains("second=tracked"));
}

#[tokio::test(start_paused = true)]
async fn test_products_have_independent_tracking_types() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let first = host.start_session_manager(FIRST, tracked).await;
    let second = host.start_session_manager(SECOND, not_tracked).await;

    assert_eq!(
        first.find_active_session(None).and_then(|c| c.tracking_type).as_deref(),
        Some("tracked")
    );
    assert_eq!(
        second.find_active_session(None).and_then(|c| c.tracking_type).as_deref(),
        Some("not-tracked")
    );
}

#[tokio::test(start_paused = true)]
async fn test_each_product_is_notified_of_expire_and_renew() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let first = host.start_session_manager(FIRST, tracked).await;
    let mut first_expire = first.subscribe_expire();
    let mut first_renew = first.subscribe_renew();
    let second = host.start_session_manager(SECOND, tracked).await;
    let mut second_expire = second.subscribe_expire();
    let mut second_renew = second.subscribe_renew();

    expire_blob(&host, &medium).await;

    assert_eq!(notified(&mut first_expire), 1);
    assert_eq!(notified(&mut second_expire), 1);
    assert_eq!(notified(&mut first_renew), 0);
    assert_eq!(notified(&mut second_renew), 0);

    click(&host).await;

    assert_eq!(notified(&mut first_renew), 1);
    assert_eq!(notified(&mut second_renew), 1);
    assert_eq!(
        first.find_active_session(None).and_then(|c| c.id),
        second.find_active_session(None).and_then(|c| c.id)
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Absolute ceiling
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_expires_when_time_out_delay_is_reached() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;
    let mut expire = manager.subscribe_expire();

    assert!(manager.find_active_session(None).is_some());
    assert!(medium.raw().is_some());

    // Visible page keeps expanding; only the ceiling can end the session
    sleep(TIME_OUT_DELAY + POLL_DELAY).await;
    settle(&host).await;

    assert_eq!(manager.find_active_session(None), None);
    assert_eq!(medium.raw(), None);
    assert_eq!(notified(&mut expire), 1);
}

#[tokio::test(start_paused = true)]
async fn test_renews_existing_timed_out_session() {
    let medium = MemoryStrategy::new(true);
    let created = START - TIME_OUT_DELAY.as_millis() as i64;
    medium.set_raw(Some(&format!("id=abcde&first=tracked&created={}", created)));

    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;
    let mut expire = manager.subscribe_expire();
    settle(&host).await;

    let id = manager.find_active_session(None).and_then(|c| c.id);
    assert!(id.is_some());
    assert_ne!(id.as_deref(), Some("abcde"));
    assert!(stored(&medium).contains(&format!("created={}", START)));
    // The old session was never active from this tab's point of view
    assert_eq!(notified(&mut expire), 0);
}

#[tokio::test(start_paused = true)]
async fn test_does_not_add_created_to_legacy_session() {
    let medium = MemoryStrategy::new(true);
    medium.set_raw(Some("id=abcde&first=tracked"));
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;

    assert_eq!(
        manager.find_active_session(None).and_then(|c| c.id).as_deref(),
        Some("abcde")
    );
    assert!(!stored(&medium).contains("created="));
}

#[tokio::test(start_paused = true)]
async fn test_legacy_session_survives_past_time_out_delay() {
    let medium = MemoryStrategy::new(true);
    medium.set_raw(Some("id=abcde&first=tracked"));
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;
    let mut expire = manager.subscribe_expire();

    sleep(TIME_OUT_DELAY + POLL_DELAY).await;
    settle(&host).await;

    assert_eq!(notified(&mut expire), 0);
    assert_eq!(
        manager.find_active_session(None).and_then(|c| c.id).as_deref(),
        Some("abcde")
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Inactivity expiration
// ─────────────────────────────────────────────────────────────────────────────

async fn hidden_tab(
    medium: &MemoryStrategy,
    compute: fn(Option<&str>) -> TrackingDecision,
) -> (SessionHost, SessionManager) {
    let host = tab(medium);
    host.set_visibility(Visibility::Hidden);
    let manager = host.start_session_manager(FIRST, compute).await;
    (host, manager)
}

#[tokio::test(start_paused = true)]
async fn test_expires_after_expiration_delay() {
    let medium = MemoryStrategy::new(true);
    let (host, manager) = hidden_tab(&medium, tracked).await;
    let mut expire = manager.subscribe_expire();
    assert_session_id_defined(&manager, &medium);

    sleep(EXPIRATION_DELAY + POLL_DELAY).await;
    settle(&host).await;

    assert_session_id_undefined(&manager, &medium);
    assert_eq!(notified(&mut expire), 1);
}

#[tokio::test(start_paused = true)]
async fn test_activity_expands_session() {
    let medium = MemoryStrategy::new(true);
    let (host, manager) = hidden_tab(&medium, tracked).await;
    let mut expire = manager.subscribe_expire();
    let id = assert_session_id_defined(&manager, &medium);

    sleep(EXPIRATION_DELAY - Duration::from_millis(10)).await;
    click(&host).await;

    sleep(Duration::from_millis(10) + POLL_DELAY).await;
    settle(&host).await;
    assert_eq!(assert_session_id_defined(&manager, &medium), id);
    assert_eq!(notified(&mut expire), 0);

    sleep(EXPIRATION_DELAY).await;
    settle(&host).await;
    assert_session_id_undefined(&manager, &medium);
    assert_eq!(notified(&mut expire), 1);
}

#[tokio::test(start_paused = true)]
async fn test_activity_expands_not_tracked_session() {
    let medium = MemoryStrategy::new(true);
    let (host, manager) = hidden_tab(&medium, not_tracked).await;
    let mut expire = manager.subscribe_expire();
    assert_tracking_type(&manager, &medium, "not-tracked");

    sleep(EXPIRATION_DELAY - Duration::from_millis(10)).await;
    click(&host).await;

    sleep(Duration::from_millis(10) + POLL_DELAY).await;
    settle(&host).await;
    assert_tracking_type(&manager, &medium, "not-tracked");
    assert_eq!(notified(&mut expire), 0);

    sleep(EXPIRATION_DELAY).await;
    settle(&host).await;
    assert_tracking_type_undefined(&manager, &medium);
    assert_eq!(notified(&mut expire), 1);
}

async fn assert_visibility_expands(compute: fn(Option<&str>) -> TrackingDecision) {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, compute).await;
    let mut expire = manager.subscribe_expire();
    let tracking_type = compute(None).tracking_type;

    // Last visibility expand happens at 3 * VISIBILITY_CHECK_DELAY
    sleep(VISIBILITY_CHECK_DELAY * 3 + POLL_DELAY).await;
    host.set_visibility(Visibility::Hidden);
    settle(&host).await;
    assert_tracking_type(&manager, &medium, &tracking_type);
    assert_eq!(notified(&mut expire), 0);

    sleep(EXPIRATION_DELAY - POLL_DELAY * 2).await;
    settle(&host).await;
    assert_tracking_type(&manager, &medium, &tracking_type);
    assert_eq!(notified(&mut expire), 0);

    sleep(POLL_DELAY * 2).await;
    settle(&host).await;
    assert_tracking_type_undefined(&manager, &medium);
    assert_eq!(notified(&mut expire), 1);
}

#[tokio::test(start_paused = true)]
async fn test_visibility_expands_session() {
    assert_visibility_expands(tracked).await;
}

#[tokio::test(start_paused = true)]
async fn test_visibility_expands_not_tracked_session() {
    assert_visibility_expands(not_tracked).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Manual expiration
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_expire_clears_session() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;
    let mut expire = manager.subscribe_expire();

    manager.expire().await;

    assert_session_id_undefined(&manager, &medium);
    assert_eq!(medium.raw(), None);
    assert_eq!(notified(&mut expire), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_expire_notifies_once() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;
    let mut expire = manager.subscribe_expire();

    manager.expire().await;
    manager.expire().await;

    assert_session_id_undefined(&manager, &medium);
    assert_eq!(notified(&mut expire), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expire_after_natural_expiration_notifies_once() {
    let medium = MemoryStrategy::new(true);
    let (host, manager) = hidden_tab(&medium, tracked).await;
    let mut expire = manager.subscribe_expire();

    sleep(EXPIRATION_DELAY + POLL_DELAY).await;
    settle(&host).await;
    manager.expire().await;

    assert_session_id_undefined(&manager, &medium);
    assert_eq!(notified(&mut expire), 1);
}

#[tokio::test(start_paused = true)]
async fn test_activity_renews_after_manual_expire() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;
    sleep(POLL_DELAY).await;

    manager.expire().await;
    click(&host).await;

    assert_session_id_defined(&manager, &medium);
}

// ─────────────────────────────────────────────────────────────────────────────
// History
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_no_session_without_start_time_after_expiry() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;

    expire_blob(&host, &medium).await;

    assert_eq!(manager.find_active_session(None), None);
}

#[tokio::test(start_paused = true)]
async fn test_current_context_without_start_time() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;

    let context = manager.find_active_session(None).expect("context");
    assert!(context.id.is_some());
    assert!(context.tracking_type.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_context_matching_start_time() {
    let medium = MemoryStrategy::new(true);
    let host = tab(&medium);
    let manager = host.start_session_manager(FIRST, tracked).await;
    assert_eq!(host.origin(), START);

    // 0s to ~10s: first session
    sleep(Duration::from_secs(10) - POLL_DELAY).await;
    let first = manager.find_active_session(None).expect("first session");
    expire_blob(&host, &medium).await;

    // ~10s to 20s: no session
    sleep(Duration::from_secs(10)).await;

    // 20s onwards: second session
    click(&host).await;
    sleep(Duration::from_secs(10)).await;
    let second = manager.find_active_session(None).expect("second session");
    assert_ne!(first.id, second.id);

    assert_eq!(manager.find_active_session(Some(START + 5 * SECOND_MS)), Some(first));
    assert_eq!(manager.find_active_session(Some(START + 15 * SECOND_MS)), None);
    assert_eq!(
        manager.find_active_session(Some(START + 25 * SECOND_MS)),
        Some(second)
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Teardown
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_timers() {
    let medium = MemoryStrategy::new(true);
    let (host, manager) = hidden_tab(&medium, tracked).await;
    let mut expire = manager.subscribe_expire();
    let before = stored(&medium);

    host.stop();
    sleep(EXPIRATION_DELAY + POLL_DELAY).await;

    // No poll ran, so nobody noticed the deadline passing
    assert_eq!(stored(&medium), before);
    assert_eq!(notified(&mut expire), 0);
}
