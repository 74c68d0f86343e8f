//! Pooled device connections.
//!
//! At most one [`Connection`] is alive per [`ConnectionKey`] at any moment.
//! Callers get a [`SharedConnection`] lease from [`ConnectionPool`]; the
//! connection is torn down when the last lease drops and rebuilt on the next
//! request.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use super::heartbeat::{HeartbeatClient, HeartbeatHandler, HeartbeatSource, HeartbeatState};
use super::SessionSettings;
use crate::device::{
    DeviceHandle, DeviceLocator, DeviceTransport, LocatorHandle, LockdownClient, LookupMode,
    ServiceClient,
};
use crate::error::DeviceError;
use crate::pool::{Lease, WeakPool};

/// Progress callback taking a fraction in `[0, 1]`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// A leased connection.
pub type SharedConnection = Lease<ConnectionKey, Connection>;

/// A caller-supplied locator, compared by identity.
///
/// Two keys built from clones of the same `Arc` name the same connection;
/// two separately allocated locators never do, even if they look alike.
#[derive(Clone)]
pub struct CustomLocator(Arc<dyn DeviceLocator>);

impl CustomLocator {
    pub fn new(locator: Arc<dyn DeviceLocator>) -> Self {
        Self(locator)
    }

    fn identity(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for CustomLocator {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for CustomLocator {}

impl Hash for CustomLocator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Debug for CustomLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CustomLocator").field(&self.0).finish()
    }
}

/// How the device behind a connection is located.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LookupHandler {
    System(LookupMode),
    Custom(CustomLocator),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionPreferences {
    pub lookup: LookupHandler,
}

impl ConnectionPreferences {
    pub fn lookup_mode(mode: LookupMode) -> Self {
        Self {
            lookup: LookupHandler::System(mode),
        }
    }

    pub fn custom(locator: Arc<dyn DeviceLocator>) -> Self {
        Self {
            lookup: LookupHandler::Custom(CustomLocator::new(locator)),
        }
    }
}

impl Default for ConnectionPreferences {
    fn default() -> Self {
        Self::lookup_mode(LookupMode::Either)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub udid: String,
    pub preferences: ConnectionPreferences,
}

/// The pieces of a session that service clients are minted from.
struct SessionServices {
    device: Arc<dyn DeviceHandle>,
    lockdown: Arc<dyn LockdownClient>,
}

impl SessionServices {
    async fn start_client<T: ServiceClient>(&self, send_escrow_bag: bool) -> Result<T, DeviceError> {
        let endpoint = self
            .lockdown
            .start_service(T::SERVICE_NAME, send_escrow_bag)
            .await?;
        let channel = self.device.connect_service(&endpoint).await?;
        Ok(T::from_channel(channel))
    }
}

#[async_trait]
impl HeartbeatSource for SessionServices {
    async fn open(&self) -> Result<HeartbeatClient, DeviceError> {
        self.start_client(false).await
    }
}

/// A handshaken session with one device.
pub struct Connection {
    udid: String,
    preferences: ConnectionPreferences,
    services: Arc<SessionServices>,
    heartbeat: Mutex<Option<HeartbeatHandler>>,
    // Declared last: the locator's handle may keep the link to the device
    // alive, so it goes after everything that uses the link.
    locator_handle: Mutex<Option<LocatorHandle>>,
}

impl Connection {
    /// Build a connection, reporting four equal checkpoints through
    /// `progress`.
    async fn establish(
        transport: Arc<dyn DeviceTransport>,
        key: ConnectionKey,
        settings: SessionSettings,
        progress: ProgressFn,
    ) -> Result<Self, DeviceError> {
        progress(0.0 / 4.0);
        debug!(udid = %key.udid, "Establishing connection");

        let mut locator_handle = None;
        let device = match &key.preferences.lookup {
            LookupHandler::System(mode) => transport.open(&key.udid, *mode).await?,
            LookupHandler::Custom(locator) => {
                locator_handle = Some(locator.0.create_handle()?);
                progress(1.0 / 4.0);
                transport.open(&key.udid, LookupMode::Either).await?
            }
        };
        progress(2.0 / 4.0);

        let lockdown = device.lockdown(&settings.label, true).await?;
        let services = Arc::new(SessionServices { device, lockdown });

        let heartbeat = if settings.heartbeat.enabled {
            progress(3.0 / 4.0);
            let source: Arc<dyn HeartbeatSource> = services.clone();
            Some(HeartbeatHandler::start(source, settings.heartbeat))
        } else {
            None
        };
        progress(4.0 / 4.0);

        info!(udid = %key.udid, heartbeat = heartbeat.is_some(), "Connection established");
        Ok(Self {
            udid: key.udid,
            preferences: key.preferences,
            services,
            heartbeat: Mutex::new(heartbeat),
            locator_handle: Mutex::new(locator_handle),
        })
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    pub fn preferences(&self) -> &ConnectionPreferences {
        &self.preferences
    }

    pub fn device(&self) -> &Arc<dyn DeviceHandle> {
        &self.services.device
    }

    /// The handshaken lockdown client of this session.
    pub fn lockdown(&self) -> &Arc<dyn LockdownClient> {
        &self.services.lockdown
    }

    /// Start a service on the device and return a client bound to this
    /// session.
    pub async fn start_client<T: ServiceClient>(
        &self,
        send_escrow_bag: bool,
    ) -> Result<T, DeviceError> {
        self.services.start_client(send_escrow_bag).await
    }

    /// Heartbeat state, or `None` when the heartbeat is disabled or the
    /// connection has been closed.
    pub fn heartbeat_state(&self) -> Option<HeartbeatState> {
        lock(&self.heartbeat).as_ref().map(HeartbeatHandler::state)
    }

    /// Stop the heartbeat, then release the locator handle.
    ///
    /// Idempotent, never blocks on I/O, and runs automatically on drop.
    pub fn close(&self) {
        let heartbeat = lock(&self.heartbeat).take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop();
            debug!(udid = %self.udid, "Heartbeat stopped for closing connection");
        }
        drop(lock(&self.locator_handle).take());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
        debug!(udid = %self.udid, "Connection released");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("udid", &self.udid)
            .field("preferences", &self.preferences)
            .field("heartbeat", &self.heartbeat_state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands out pooled connections over a transport.
#[derive(Clone)]
pub struct ConnectionPool {
    transport: Arc<dyn DeviceTransport>,
    settings: SessionSettings,
    pool: Arc<WeakPool<ConnectionKey, Connection, DeviceError>>,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn DeviceTransport>, settings: SessionSettings) -> Self {
        Self {
            transport,
            settings,
            pool: Arc::new(WeakPool::new()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn DeviceTransport> {
        &self.transport
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Get the live connection for `(udid, preferences)` or build one.
    ///
    /// `progress` receives 0 up front and 1 once this call resolves, success
    /// or not. The caller that actually builds the connection also sees the
    /// construction checkpoints in between.
    pub async fn connection(
        &self,
        udid: &str,
        preferences: ConnectionPreferences,
        progress: ProgressFn,
    ) -> Result<SharedConnection, DeviceError> {
        progress(0.0);

        let key = ConnectionKey {
            udid: udid.to_string(),
            preferences,
        };
        let result = self
            .pool
            .value(key.clone(), || {
                Connection::establish(
                    Arc::clone(&self.transport),
                    key,
                    self.settings.clone(),
                    Arc::clone(&progress),
                )
            })
            .await;

        progress(1.0);
        result
    }

    /// Whether a live connection exists for the key.
    pub fn is_live(&self, udid: &str, preferences: &ConnectionPreferences) -> bool {
        self.pool.contains(&ConnectionKey {
            udid: udid.to_string(),
            preferences: preferences.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectionKind;
    use std::collections::HashSet;

    #[derive(Debug)]
    struct NullLocator;

    impl DeviceLocator for NullLocator {
        fn create_handle(&self) -> Result<LocatorHandle, DeviceError> {
            Ok(Box::new(()))
        }
    }

    fn key(udid: &str, preferences: ConnectionPreferences) -> ConnectionKey {
        ConnectionKey {
            udid: udid.to_string(),
            preferences,
        }
    }

    #[test]
    fn system_keys_compare_by_value() {
        let usb = ConnectionPreferences::lookup_mode(LookupMode::Only(ConnectionKind::Usb));
        assert_eq!(key("a", usb.clone()), key("a", usb.clone()));
        assert_ne!(key("a", usb.clone()), key("b", usb.clone()));
        assert_ne!(key("a", usb), key("a", ConnectionPreferences::default()));
    }

    #[test]
    fn custom_locators_compare_by_identity() {
        let locator: Arc<dyn DeviceLocator> = Arc::new(NullLocator);
        let same = ConnectionPreferences::custom(Arc::clone(&locator));
        let again = ConnectionPreferences::custom(locator);
        let other = ConnectionPreferences::custom(Arc::new(NullLocator));

        assert_eq!(same, again);
        assert_ne!(same, other);

        let keys: HashSet<_> = [
            key("a", same.clone()),
            key("a", again),
            key("a", other),
        ]
        .into_iter()
        .collect();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn custom_never_equals_system() {
        let custom = ConnectionPreferences::custom(Arc::new(NullLocator));
        assert_ne!(custom, ConnectionPreferences::default());
    }
}
