use async_trait::async_trait;
use futures::{channel::mpsc, stream::BoxStream, StreamExt};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{ModspressoError, Result},
    transport::{DiscoveryFilter, GattLink, LinkEvent, Transport},
    types::PeripheralIdentity,
    CHARACTERISTIC_UUID, SERVICE_UUID,
};

/// Step at which the mock should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    /// Discovery reports that the user dismissed the chooser
    Scan,
    /// Opening the link
    Open,
    /// Resolving the service or characteristic
    Resolve,
    /// Enabling notifications
    Subscribe,
    /// Every write
    Write,
}

#[derive(Debug, Clone)]
struct MockPeripheral {
    identity: PeripheralIdentity,
    services: Vec<Uuid>,
}

struct MockState {
    supported: bool,
    devices: Vec<MockPeripheral>,
    failure: Option<FailurePoint>,
    writes: Vec<Vec<u8>>,
    feed: Option<mpsc::UnboundedSender<LinkEvent>>,
    subscribed: bool,
    open_links: usize,
}

/// Fake [`Transport`] backed by shared in-memory state
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    write_gate: Arc<watch::Sender<bool>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a supported transport with no peripherals in range
    #[must_use]
    pub fn new() -> Self {
        let (write_gate, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(MockState {
                supported: true,
                devices: Vec::new(),
                failure: None,
                writes: Vec::new(),
                feed: None,
                subscribed: false,
                open_links: 0,
            })),
            write_gate: Arc::new(write_gate),
        }
    }

    /// Create a transport with one peripheral in range
    #[must_use]
    pub fn with_device(identity: PeripheralIdentity) -> Self {
        let mock = Self::new();
        mock.add_device(identity, vec![SERVICE_UUID]);
        mock
    }

    /// Create a transport for a host without a radio
    #[must_use]
    pub fn unsupported() -> Self {
        let mock = Self::new();
        mock.lock().supported = false;
        mock
    }

    /// Put a peripheral in range, advertising `services`
    pub fn add_device(&self, identity: PeripheralIdentity, services: Vec<Uuid>) {
        self.lock().devices.push(MockPeripheral { identity, services });
    }

    /// Fail every subsequent call at `point`
    pub fn fail_at(&self, point: FailurePoint) {
        self.lock().failure = Some(point);
    }

    /// Stop injecting failures
    pub fn clear_failure(&self) {
        self.lock().failure = None;
    }

    /// Deliver a notification on the subscribed characteristic
    ///
    /// Returns `false` if nothing is subscribed.
    pub fn push_notification(&self, frame: impl Into<Vec<u8>>) -> bool {
        self.lock()
            .feed
            .as_ref()
            .is_some_and(|feed| feed.unbounded_send(LinkEvent::Notification(frame.into())).is_ok())
    }

    /// Simulate the peripheral dropping the link
    pub fn drop_peer(&self) {
        let mut state = self.lock();
        if let Some(feed) = state.feed.take() {
            let _ = feed.unbounded_send(LinkEvent::Disconnected);
        }
        state.subscribed = false;
    }

    /// Every frame written so far, in order
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Every frame written so far, parsed as JSON
    ///
    /// Frames that are not JSON are skipped.
    #[must_use]
    pub fn written_json(&self) -> Vec<serde_json::Value> {
        self.lock()
            .writes
            .iter()
            .filter_map(|frame| serde_json::from_slice(frame).ok())
            .collect()
    }

    /// Whether notifications are currently enabled
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.lock().subscribed
    }

    /// Number of links opened and not yet closed
    #[must_use]
    pub fn open_links(&self) -> usize {
        self.lock().open_links
    }

    /// Make writes wait until [`Self::release_writes`] is called
    pub fn hold_writes(&self) {
        self.write_gate.send_replace(true);
    }

    /// Let held and future writes complete
    pub fn release_writes(&self) {
        self.write_gate.send_replace(false);
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl Transport for MockTransport {
    async fn scan(&self, filter: &DiscoveryFilter) -> Result<Vec<PeripheralIdentity>> {
        let state = self.lock();
        if !state.supported {
            return Err(ModspressoError::NotSupported(
                "mock transport has no radio".to_string(),
            ));
        }
        if state.failure == Some(FailurePoint::Scan) {
            return Err(ModspressoError::UserCancelled);
        }

        let found: Vec<_> = state
            .devices
            .iter()
            .filter(|d| filter.matches(Some(&d.identity.name), &d.services))
            .map(|d| d.identity.clone())
            .collect();
        debug!("Mock scan found {} device(s)", found.len());

        if found.is_empty() {
            return Err(ModspressoError::NoDeviceChosen);
        }
        Ok(found)
    }

    async fn open(&self, peripheral: &PeripheralIdentity) -> Result<Arc<dyn GattLink>> {
        let mut state = self.lock();
        if state.failure == Some(FailurePoint::Open) {
            return Err(ModspressoError::ConnectError(
                "GATT server refused the connection".to_string(),
            ));
        }
        if !state.devices.iter().any(|d| d.identity.id == peripheral.id) {
            return Err(ModspressoError::ConnectError(format!(
                "peripheral {} is out of range",
                peripheral.id
            )));
        }
        state.open_links += 1;

        Ok(Arc::new(MockLink {
            state: Arc::clone(&self.state),
            write_gate: Arc::clone(&self.write_gate),
            resolved: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockLink {
    state: Arc<Mutex<MockState>>,
    write_gate: Arc<watch::Sender<bool>>,
    resolved: AtomicBool,
    closed: AtomicBool,
}

impl MockLink {
    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ModspressoError::ConnectError("link is closed".to_string()));
        }
        if !self.resolved.load(Ordering::SeqCst) {
            return Err(ModspressoError::ConnectError(
                "characteristic not resolved".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl GattLink for MockLink {
    async fn resolve(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        if lock(&self.state).failure == Some(FailurePoint::Resolve) {
            return Err(ModspressoError::ConnectError(
                "service discovery failed".to_string(),
            ));
        }
        if service != SERVICE_UUID || characteristic != CHARACTERISTIC_UUID {
            return Err(ModspressoError::ConnectError(format!(
                "characteristic {characteristic} not found"
            )));
        }
        self.resolved.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, LinkEvent>> {
        self.ensure_usable()?;
        let mut state = lock(&self.state);
        if state.failure == Some(FailurePoint::Subscribe) {
            return Err(ModspressoError::ConnectError(
                "enabling notifications failed".to_string(),
            ));
        }

        let (feed, events) = mpsc::unbounded();
        state.feed = Some(feed);
        state.subscribed = true;
        Ok(events.boxed())
    }

    async fn unsubscribe(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.feed = None;
        state.subscribed = false;
        Ok(())
    }

    async fn write(&self, frame: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ModspressoError::WriteFailed("link is closed".to_string()));
        }

        let mut gate = self.write_gate.subscribe();
        let _ = gate.wait_for(|held| !*held).await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ModspressoError::WriteFailed(
                "link closed during write".to_string(),
            ));
        }

        let mut state = lock(&self.state);
        if state.failure == Some(FailurePoint::Write) {
            return Err(ModspressoError::WriteFailed(
                "GATT write was rejected".to_string(),
            ));
        }
        state.writes.push(frame.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = lock(&self.state);
            state.open_links = state.open_links.saturating_sub(1);
            state.feed = None;
            state.subscribed = false;
        }
        Ok(())
    }
}
