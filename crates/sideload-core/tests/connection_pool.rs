//! Tests for pooled device connections.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sideload_backend_mock::{MockDevice, MockTransport};
use sideload_core::device::{ConnectionKind, DeviceLocator, LocatorHandle, LookupMode};
use sideload_core::error::DeviceError;
use sideload_core::pool::Lease;
use sideload_core::session::{
    ConnectionPool, ConnectionPreferences, HeartbeatSettings, HeartbeatState, ProgressFn,
    SessionSettings,
};

const UDID: &str = "00008030-001A2B3C4D5E6F70";

fn settings(heartbeat: bool) -> SessionSettings {
    SessionSettings {
        label: "tests".to_string(),
        heartbeat: HeartbeatSettings {
            enabled: heartbeat,
            ..HeartbeatSettings::default()
        },
    }
}

fn transport_with_device() -> MockTransport {
    let transport = MockTransport::new();
    transport.add_device(MockDevice::new(UDID, "Test iPhone"), ConnectionKind::Usb);
    transport
}

fn pool(transport: &MockTransport, heartbeat: bool) -> ConnectionPool {
    ConnectionPool::new(Arc::new(transport.clone()), settings(heartbeat))
}

fn ignore() -> ProgressFn {
    Arc::new(|_| {})
}

fn recorder() -> (ProgressFn, Arc<Mutex<Vec<f64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (Arc::new(move |p| sink.lock().unwrap().push(p)), seen)
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_connection() {
    let transport = transport_with_device();
    transport.set_open_delay(Some(Duration::from_millis(50)));
    let pool = pool(&transport, false);

    let (a, b) = tokio::join!(
        pool.connection(UDID, ConnectionPreferences::default(), ignore()),
        pool.connection(UDID, ConnectionPreferences::default(), ignore()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Lease::ptr_eq(&a, &b));
    assert_eq!(transport.opens(), 1);
    assert_eq!(transport.handshakes(), 1);
}

#[tokio::test]
async fn live_connection_is_returned_as_is() {
    let transport = transport_with_device();
    let pool = pool(&transport, false);

    let first = pool
        .connection(UDID, ConnectionPreferences::default(), ignore())
        .await
        .unwrap();
    let second = pool
        .connection(UDID, ConnectionPreferences::default(), ignore())
        .await
        .unwrap();

    assert!(Lease::ptr_eq(&first, &second));
    assert_eq!(transport.opens(), 1);
    assert!(pool.is_live(UDID, &ConnectionPreferences::default()));
}

#[tokio::test]
async fn different_preferences_get_different_connections() {
    let transport = transport_with_device();
    let pool = pool(&transport, false);

    let either = pool
        .connection(UDID, ConnectionPreferences::default(), ignore())
        .await
        .unwrap();
    let usb = pool
        .connection(
            UDID,
            ConnectionPreferences::lookup_mode(LookupMode::Only(ConnectionKind::Usb)),
            ignore(),
        )
        .await
        .unwrap();

    assert!(!Lease::ptr_eq(&either, &usb));
    assert_eq!(transport.opens(), 2);
}

#[tokio::test]
async fn released_connection_is_rebuilt() {
    let transport = transport_with_device();
    let pool = pool(&transport, false);
    let preferences = ConnectionPreferences::default();

    let first = pool
        .connection(UDID, preferences.clone(), ignore())
        .await
        .unwrap();
    let copy = first.clone();
    drop(first);
    assert!(pool.is_live(UDID, &preferences));
    drop(copy);
    assert!(!pool.is_live(UDID, &preferences));

    let _again = pool
        .connection(UDID, preferences.clone(), ignore())
        .await
        .unwrap();
    assert_eq!(transport.opens(), 2);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_requesters_share_a_failure() {
    let transport = MockTransport::new();
    transport.set_open_delay(Some(Duration::from_millis(50)));
    let pool = pool(&transport, false);

    let (a, b) = tokio::join!(
        pool.connection(UDID, ConnectionPreferences::default(), ignore()),
        pool.connection(UDID, ConnectionPreferences::default(), ignore()),
    );

    assert!(matches!(a, Err(DeviceError::NotFound { .. })));
    assert!(matches!(b, Err(DeviceError::NotFound { .. })));
    assert_eq!(transport.opens(), 1);
}

#[tokio::test]
async fn failures_are_not_cached() {
    let transport = MockTransport::new();
    let pool = pool(&transport, false);

    let missing = pool
        .connection(UDID, ConnectionPreferences::default(), ignore())
        .await;
    assert!(missing.is_err());

    transport.add_device(MockDevice::new(UDID, "Test iPhone"), ConnectionKind::Usb);
    let found = pool
        .connection(UDID, ConnectionPreferences::default(), ignore())
        .await;
    assert!(found.is_ok());
    assert_eq!(transport.opens(), 2);
}

#[tokio::test]
async fn handshake_refusal_surfaces_to_the_caller() {
    let transport = MockTransport::new();
    transport.add_device(
        MockDevice::new(UDID, "Test iPhone").with_locked_prompts(1),
        ConnectionKind::Usb,
    );
    let pool = pool(&transport, false);

    let locked = pool
        .connection(UDID, ConnectionPreferences::default(), ignore())
        .await;
    assert!(matches!(locked, Err(DeviceError::PasswordProtected)));

    let unlocked = pool
        .connection(UDID, ConnectionPreferences::default(), ignore())
        .await;
    assert!(unlocked.is_ok());
}

// ============================================================================
// Progress
// ============================================================================

#[tokio::test]
async fn builder_sees_every_checkpoint() {
    let transport = transport_with_device();
    let pool = pool(&transport, true);
    let (progress, seen) = recorder();

    let _connection = pool
        .connection(UDID, ConnectionPreferences::default(), progress)
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), [0.0, 0.0, 0.5, 0.75, 1.0, 1.0]);
}

#[tokio::test]
async fn reused_connection_reports_only_start_and_end() {
    let transport = transport_with_device();
    let pool = pool(&transport, false);
    let _first = pool
        .connection(UDID, ConnectionPreferences::default(), ignore())
        .await
        .unwrap();

    let (progress, seen) = recorder();
    let _second = pool
        .connection(UDID, ConnectionPreferences::default(), progress)
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), [0.0, 1.0]);
}

#[tokio::test]
async fn failed_request_still_reports_completion() {
    let pool = pool(&MockTransport::new(), false);
    let (progress, seen) = recorder();

    let result = pool
        .connection(UDID, ConnectionPreferences::default(), progress)
        .await;

    assert!(result.is_err());
    assert_eq!(seen.lock().unwrap().last(), Some(&1.0));
}

// ============================================================================
// Heartbeat and teardown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn heartbeat_runs_until_connection_released() {
    let transport = transport_with_device();
    let pool = pool(&transport, true);

    let connection = pool
        .connection(UDID, ConnectionPreferences::default(), ignore())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(connection.heartbeat_state(), Some(HeartbeatState::Beating));
    assert_eq!(transport.heartbeat_replies(), 3);

    drop(connection);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.heartbeat_replies(), 3);
}

#[tokio::test]
async fn close_stops_heartbeat_and_is_idempotent() {
    let transport = transport_with_device();
    let pool = pool(&transport, true);

    let connection = pool
        .connection(UDID, ConnectionPreferences::default(), ignore())
        .await
        .unwrap();
    assert!(connection.heartbeat_state().is_some());

    connection.close();
    connection.close();
    assert_eq!(connection.heartbeat_state(), None);
}

#[tokio::test]
async fn disabled_heartbeat_is_never_started() {
    let transport = transport_with_device();
    let pool = pool(&transport, false);

    let connection = pool
        .connection(UDID, ConnectionPreferences::default(), ignore())
        .await
        .unwrap();
    tokio::task::yield_now().await;

    assert_eq!(connection.heartbeat_state(), None);
    assert_eq!(transport.heartbeat_replies(), 0);
}

// ============================================================================
// Custom locators
// ============================================================================

#[derive(Debug, Default)]
struct TunnelLocator {
    created: AtomicUsize,
    released: Arc<AtomicBool>,
}

struct Tunnel(Arc<AtomicBool>);

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl DeviceLocator for TunnelLocator {
    fn create_handle(&self) -> Result<LocatorHandle, DeviceError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Tunnel(Arc::clone(&self.released))))
    }
}

#[tokio::test]
async fn custom_locator_handle_lives_as_long_as_the_connection() {
    let transport = transport_with_device();
    let pool = pool(&transport, false);
    let locator = Arc::new(TunnelLocator::default());
    let preferences = ConnectionPreferences::custom(locator.clone());
    let (progress, seen) = recorder();

    let connection = pool
        .connection(UDID, preferences.clone(), progress)
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), [0.0, 0.0, 0.25, 0.5, 1.0, 1.0]);
    assert_eq!(locator.created.load(Ordering::SeqCst), 1);
    assert!(!locator.released.load(Ordering::SeqCst));

    let again = pool
        .connection(UDID, preferences, ignore())
        .await
        .unwrap();
    assert!(Lease::ptr_eq(&connection, &again));
    assert_eq!(locator.created.load(Ordering::SeqCst), 1);

    drop(connection);
    drop(again);
    assert!(locator.released.load(Ordering::SeqCst));
}
