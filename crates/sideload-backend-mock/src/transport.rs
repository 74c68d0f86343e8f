use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sideload_core::device::{
    AttachedDevice, ConnectionKind, DeviceEvent, DeviceEvents, DeviceHandle,
    DeviceTransport, LockdownClient, LookupMode, PairRecord, ServiceChannel, ServiceClient,
    ServiceEndpoint,
};
use sideload_core::error::DeviceError;
use sideload_core::session::{HeartbeatClient, HeartbeatPacket};
use tokio::sync::mpsc;
use tracing::debug;

/// A scripted device.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub udid: String,
    pub name: String,
    /// Handshakes and pair requests that fail with a pending trust dialog
    /// before the device accepts.
    pub pairing_prompts: usize,
    /// Handshakes that fail because the device is locked, counted after the
    /// pairing prompts.
    pub locked_prompts: usize,
    /// Name lookups during discovery fail.
    pub failing_probe: bool,
    /// Seconds between heartbeat requests.
    pub heartbeat_interval: u64,
}

impl MockDevice {
    pub fn new(udid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            udid: udid.into(),
            name: name.into(),
            pairing_prompts: 0,
            locked_prompts: 0,
            failing_probe: false,
            heartbeat_interval: 10,
        }
    }

    pub fn with_pairing_prompts(mut self, count: usize) -> Self {
        self.pairing_prompts = count;
        self
    }

    pub fn with_locked_prompts(mut self, count: usize) -> Self {
        self.locked_prompts = count;
        self
    }

    pub fn with_failing_probe(mut self) -> Self {
        self.failing_probe = true;
        self
    }
}

/// Per-device state that outlives attachments.
#[derive(Debug)]
struct DeviceState {
    device: MockDevice,
    values: HashMap<(Option<String>, String), Value>,
    paired: Vec<PairRecord>,
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    handshakes: AtomicUsize,
    heartbeat_replies: AtomicUsize,
    services: AtomicUsize,
}

#[derive(Default)]
struct Inner {
    devices: Mutex<HashMap<String, DeviceState>>,
    attached: Mutex<BTreeSet<(String, ConnectionKind)>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DeviceEvent>>>,
    pair_records: Mutex<HashMap<String, PairRecord>>,
    open_delay: Mutex<Option<Duration>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory device multiplexer.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and attach it with `kind`.
    pub fn add_device(&self, device: MockDevice, kind: ConnectionKind) {
        let udid = device.udid.clone();
        lock(&self.inner.pair_records)
            .entry(udid.clone())
            .or_insert_with(|| sample_pair_record(&udid));
        lock(&self.inner.devices).insert(
            udid.clone(),
            DeviceState {
                device,
                values: HashMap::new(),
                paired: Vec::new(),
            },
        );
        self.attach(&udid, kind);
    }

    /// Attach a known device over another link.
    pub fn attach(&self, udid: &str, kind: ConnectionKind) {
        if lock(&self.inner.attached).insert((udid.to_string(), kind)) {
            self.emit(DeviceEvent::added(udid, kind));
        }
    }

    pub fn detach(&self, udid: &str, kind: ConnectionKind) {
        if lock(&self.inner.attached).remove(&(udid.to_string(), kind)) {
            self.emit(DeviceEvent::removed(udid, kind));
        }
    }

    /// Send a raw event to every subscriber without touching the attached
    /// set.
    pub fn emit(&self, event: DeviceEvent) {
        debug!(udid = %event.device.udid, kind = ?event.kind, "Mock device event");
        lock(&self.inner.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn set_pair_record(&self, udid: &str, record: PairRecord) {
        lock(&self.inner.pair_records).insert(udid.to_string(), record);
    }

    /// Delay every `open` call, to keep constructions in flight.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *lock(&self.inner.open_delay) = delay;
    }

    pub fn opens(&self) -> usize {
        self.inner.counters.opens.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> usize {
        self.inner.counters.handshakes.load(Ordering::SeqCst)
    }

    pub fn heartbeat_replies(&self) -> usize {
        self.inner.counters.heartbeat_replies.load(Ordering::SeqCst)
    }

    /// A value previously written through lockdown.
    pub fn value(&self, udid: &str, domain: Option<&str>, key: &str) -> Option<Value> {
        lock(&self.inner.devices)
            .get(udid)
            .and_then(|state| {
                state
                    .values
                    .get(&(domain.map(str::to_string), key.to_string()))
            })
            .cloned()
    }

    /// Records the device accepted through lockdown pairing.
    pub fn paired_records(&self, udid: &str) -> Vec<PairRecord> {
        lock(&self.inner.devices)
            .get(udid)
            .map(|state| state.paired.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn devices(&self) -> Result<Vec<AttachedDevice>, DeviceError> {
        Ok(lock(&self.inner.attached)
            .iter()
            .map(|(udid, kind)| AttachedDevice::new(udid.clone(), *kind))
            .collect())
    }

    async fn subscribe(&self) -> Result<DeviceEvents, DeviceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        Ok(rx)
    }

    async fn open(
        &self,
        udid: &str,
        lookup: LookupMode,
    ) -> Result<Arc<dyn DeviceHandle>, DeviceError> {
        self.inner.counters.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.inner.open_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // Network sorts first, so Either prefers it like a real multiplexer
        let kind = lock(&self.inner.attached)
            .iter()
            .find(|(id, kind)| id == udid && lookup.allows(*kind))
            .map(|(_, kind)| *kind)
            .ok_or_else(|| DeviceError::NotFound {
                udid: udid.to_string(),
            })?;

        Ok(Arc::new(MockHandle {
            inner: Arc::clone(&self.inner),
            udid: udid.to_string(),
            kind,
        }))
    }

    async fn pair_record(&self, udid: &str) -> Result<PairRecord, DeviceError> {
        lock(&self.inner.pair_records)
            .get(udid)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound {
                udid: udid.to_string(),
            })
    }
}

/// An opened mock device.
pub struct MockHandle {
    inner: Arc<Inner>,
    udid: String,
    kind: ConnectionKind,
}

impl std::fmt::Debug for MockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHandle")
            .field("udid", &self.udid)
            .field("kind", &self.kind)
            .finish()
    }
}

impl MockHandle {
    /// Consume one scripted refusal, if any are left.
    fn refusal(&self) -> Result<(), DeviceError> {
        let mut devices = lock(&self.inner.devices);
        let state = devices.get_mut(&self.udid).ok_or_else(|| DeviceError::NotFound {
            udid: self.udid.clone(),
        })?;
        if state.device.pairing_prompts > 0 {
            state.device.pairing_prompts -= 1;
            return Err(DeviceError::PairingDialogPending);
        }
        if state.device.locked_prompts > 0 {
            state.device.locked_prompts -= 1;
            return Err(DeviceError::PasswordProtected);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceHandle for MockHandle {
    fn udid(&self) -> &str {
        &self.udid
    }

    async fn lockdown(
        &self,
        _label: &str,
        handshake: bool,
    ) -> Result<Arc<dyn LockdownClient>, DeviceError> {
        if handshake {
            self.inner.counters.handshakes.fetch_add(1, Ordering::SeqCst);
            self.refusal()?;
        }
        Ok(Arc::new(MockLockdown {
            inner: Arc::clone(&self.inner),
            udid: self.udid.clone(),
            handshaken: handshake,
        }))
    }

    async fn connect_service(
        &self,
        endpoint: &ServiceEndpoint,
    ) -> Result<Box<dyn ServiceChannel>, DeviceError> {
        if endpoint.name != HeartbeatClient::SERVICE_NAME {
            return Err(DeviceError::ServiceUnavailable(endpoint.name.clone()));
        }
        let interval = lock(&self.inner.devices)
            .get(&self.udid)
            .map(|state| state.device.heartbeat_interval)
            .ok_or_else(|| DeviceError::NotFound {
                udid: self.udid.clone(),
            })?;
        Ok(Box::new(HeartbeatChannel {
            inner: Arc::clone(&self.inner),
            interval,
        }))
    }
}

struct MockLockdown {
    inner: Arc<Inner>,
    udid: String,
    handshaken: bool,
}

#[async_trait]
impl LockdownClient for MockLockdown {
    async fn value(&self, domain: Option<&str>, key: &str) -> Result<Value, DeviceError> {
        let devices = lock(&self.inner.devices);
        let state = devices.get(&self.udid).ok_or_else(|| DeviceError::NotFound {
            udid: self.udid.clone(),
        })?;

        if domain.is_none() && key == "DeviceName" {
            if state.device.failing_probe && !self.handshaken {
                return Err(DeviceError::Transport("device went away".into()));
            }
            return Ok(Value::String(state.device.name.clone()));
        }
        state
            .values
            .get(&(domain.map(str::to_string), key.to_string()))
            .cloned()
            .ok_or_else(|| DeviceError::Protocol(format!("no value for {key}")))
    }

    async fn set_value(
        &self,
        domain: Option<&str>,
        key: &str,
        value: Value,
    ) -> Result<(), DeviceError> {
        let mut devices = lock(&self.inner.devices);
        let state = devices
            .get_mut(&self.udid)
            .ok_or_else(|| DeviceError::NotFound {
                udid: self.udid.clone(),
            })?;
        state
            .values
            .insert((domain.map(str::to_string), key.to_string()), value);
        Ok(())
    }

    async fn start_service(
        &self,
        name: &str,
        _send_escrow_bag: bool,
    ) -> Result<ServiceEndpoint, DeviceError> {
        if !self.handshaken {
            return Err(DeviceError::Protocol(
                "services need a handshaken session".into(),
            ));
        }
        let n = self.inner.counters.services.fetch_add(1, Ordering::SeqCst);
        Ok(ServiceEndpoint {
            name: name.to_string(),
            port: 49152 + (n % 1000) as u16,
            ssl: true,
        })
    }

    async fn pair(&self, record: &PairRecord) -> Result<(), DeviceError> {
        let mut devices = lock(&self.inner.devices);
        let state = devices
            .get_mut(&self.udid)
            .ok_or_else(|| DeviceError::NotFound {
                udid: self.udid.clone(),
            })?;
        if state.device.pairing_prompts > 0 {
            state.device.pairing_prompts -= 1;
            return Err(DeviceError::PairingDialogPending);
        }
        state.paired.push(record.clone());
        Ok(())
    }
}

/// Heartbeat service that asks for a beat on every receive.
struct HeartbeatChannel {
    inner: Arc<Inner>,
    interval: u64,
}

#[async_trait]
impl ServiceChannel for HeartbeatChannel {
    async fn send(&mut self, message: Value) -> Result<(), DeviceError> {
        let packet: HeartbeatPacket = serde_json::from_value(message)
            .map_err(|e| DeviceError::Protocol(format!("unexpected heartbeat reply: {e}")))?;
        if packet != HeartbeatPacket::polo() {
            return Err(DeviceError::Protocol(format!(
                "unexpected heartbeat reply {:?}",
                packet.command
            )));
        }
        self.inner
            .counters
            .heartbeat_replies
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(&mut self, _timeout: Duration) -> Result<Value, DeviceError> {
        serde_json::to_value(HeartbeatPacket::marco(self.interval))
            .map_err(|e| DeviceError::Protocol(e.to_string()))
    }
}

/// A pair record with well-formed identifiers, derived from the udid so
/// every device gets a distinct one.
pub fn sample_pair_record(udid: &str) -> PairRecord {
    let seed = udid
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    PairRecord {
        device_certificate: b"device-cert".to_vec(),
        host_certificate: b"host-cert".to_vec(),
        root_certificate: b"root-cert".to_vec(),
        host_id: format!("{seed:08X}-0000-4000-8000-000000000001"),
        system_buid: format!("{seed:08X}-0000-4000-8000-000000000002"),
        extra: serde_json::Map::new(),
    }
}
