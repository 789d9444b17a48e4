use futures::{stream::BoxStream, StreamExt};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{ModspressoError, Result},
    protocol::{self, InboundEvent},
    transport::{DiscoveryFilter, GattLink, LinkEvent, Transport},
    types::{LinkState, PeripheralIdentity},
    CHARACTERISTIC_UUID, SERVICE_UUID,
};

/// Who ended a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`LinkSession::disconnect`] was called
    Local,
    /// The peripheral went away
    Peer,
}

/// Event delivered to the session listener
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The link state changed
    State(LinkState),
    /// A notification was decoded
    Inbound(InboundEvent),
    /// The link ended
    Disconnected(DisconnectReason),
}

struct ActiveLink {
    peripheral: PeripheralIdentity,
    link: Arc<dyn GattLink>,
    pump: JoinHandle<()>,
    closed: Arc<AtomicBool>,
}

/// Connection state machine for exactly one peripheral
pub struct LinkSession {
    transport: Arc<dyn Transport>,
    filter: DiscoveryFilter,
    state: Arc<RwLock<LinkState>>,
    listener: mpsc::UnboundedSender<SessionEvent>,
    discovered: Vec<PeripheralIdentity>,
    active: Option<ActiveLink>,
}

impl LinkSession {
    /// Create an idle session and the receiver its events are delivered to
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        filter: DiscoveryFilter,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (listener, events) = mpsc::unbounded_channel();
        let session = Self {
            transport,
            filter,
            state: Arc::new(RwLock::new(LinkState::Idle)),
            listener,
            discovered: Vec::new(),
            active: None,
        };
        (session, events)
    }

    /// Current link state
    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    /// Shared handle to the link state, readable without the session
    #[must_use]
    pub fn state_handle(&self) -> Arc<RwLock<LinkState>> {
        Arc::clone(&self.state)
    }

    /// Peripherals returned by the last successful scan
    #[must_use]
    pub fn discovered(&self) -> &[PeripheralIdentity] {
        &self.discovered
    }

    /// Peripheral of the active link, if any
    ///
    /// Returns `None` once the peer has dropped the link, even before the
    /// session releases it.
    #[must_use]
    pub fn peripheral(&self) -> Option<&PeripheralIdentity> {
        self.active
            .as_ref()
            .filter(|active| !active.closed.load(Ordering::SeqCst))
            .map(|active| &active.peripheral)
    }

    /// Discover matching peripherals, tearing down any active link first
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotSupported`], [`ModspressoError::NoDeviceChosen`] or
    /// [`ModspressoError::UserCancelled`] from the transport. The session is `Idle`
    /// afterwards in every case.
    pub async fn scan(&mut self) -> Result<Vec<PeripheralIdentity>> {
        self.disconnect().await?;

        info!("Starting scan for Modspresso devices...");
        self.set_state(LinkState::Scanning).await;
        let result = self.transport.scan(&self.filter).await;
        self.set_state(LinkState::Idle).await;

        let found = result?;
        if found.is_empty() {
            return Err(ModspressoError::NoDeviceChosen);
        }

        info!("Scan completed. Found {} device(s)", found.len());
        self.discovered.clone_from(&found);
        Ok(found)
    }

    /// Open a link to a peripheral from the last scan and subscribe to notifications
    ///
    /// An active link is torn down first. If any step fails, the partly opened
    /// link is released before returning.
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NoDeviceChosen`] if `peripheral` was not returned
    /// by the last scan, or [`ModspressoError::ConnectError`] carrying the
    /// underlying reason.
    pub async fn connect(&mut self, peripheral: &PeripheralIdentity) -> Result<()> {
        if self.active.is_some() {
            self.teardown().await;
        }
        if !self.discovered.iter().any(|p| p.id == peripheral.id) {
            return Err(ModspressoError::NoDeviceChosen);
        }

        info!("Connecting to device: {}", peripheral.name);
        self.set_state(LinkState::Connecting).await;

        let link = match self.transport.open(peripheral).await {
            Ok(link) => link,
            Err(err) => {
                self.set_state(LinkState::Idle).await;
                return Err(connect_error(err));
            }
        };

        let events = match Self::prepare(link.as_ref()).await {
            Ok(events) => events,
            Err(err) => {
                warn!("Connection to {} failed: {err}", peripheral.name);
                release(link.as_ref()).await;
                self.set_state(LinkState::Idle).await;
                return Err(connect_error(err));
            }
        };

        self.set_state(LinkState::Connected).await;

        let closed = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(pump_notifications(
            events,
            Arc::clone(&self.state),
            self.listener.clone(),
            Arc::clone(&closed),
        ));

        self.active = Some(ActiveLink {
            peripheral: peripheral.clone(),
            link,
            pump,
            closed,
        });

        info!("Successfully connected to {}", peripheral.name);
        Ok(())
    }

    async fn prepare(link: &dyn GattLink) -> Result<BoxStream<'static, LinkEvent>> {
        link.resolve(SERVICE_UUID, CHARACTERISTIC_UUID).await?;
        link.subscribe().await
    }

    /// Handle for writing to the active link without holding the session
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotConnected`] if no link is connected.
    pub fn writer(&self) -> Result<LinkWriter> {
        match &self.active {
            Some(active) if !active.closed.load(Ordering::SeqCst) => Ok(LinkWriter {
                link: Arc::clone(&active.link),
                closed: Arc::clone(&active.closed),
            }),
            _ => Err(ModspressoError::NotConnected),
        }
    }

    /// Write one encoded frame
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotConnected`] if no link is connected, or
    /// [`ModspressoError::WriteFailed`] if the transport rejects the write.
    pub async fn write(&self, frame: &[u8]) -> Result<()> {
        self.writer()?.write(frame).await
    }

    /// Tear down the active link and forget the last scan results
    ///
    /// Calling this with no active link is a no-op.
    ///
    /// # Errors
    ///
    /// Never fails today; teardown problems are logged and the session still
    /// reaches `Idle`.
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.active.is_some() {
            self.teardown().await;
        }
        self.discovered.clear();
        Ok(())
    }

    async fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        let owned = !active.closed.swap(true, Ordering::SeqCst);
        if owned {
            info!("Disconnecting from {}", active.peripheral.name);
            self.set_state(LinkState::Disconnecting).await;
        }

        active.pump.abort();
        release(active.link.as_ref()).await;

        if owned {
            self.set_state(LinkState::Idle).await;
            let _ = self
                .listener
                .send(SessionEvent::Disconnected(DisconnectReason::Local));
        } else {
            debug!(
                "Released link to {} after peer disconnect",
                active.peripheral.name
            );
        }
    }

    async fn set_state(&self, next: LinkState) {
        let mut state = self.state.write().await;
        if *state != next {
            *state = next;
            let _ = self.listener.send(SessionEvent::State(next));
        }
    }
}

/// Write access to one link, usable while the session is torn down
///
/// Once the link is closed, by either side, every write fails with
/// [`ModspressoError::NotConnected`].
#[derive(Clone)]
pub struct LinkWriter {
    link: Arc<dyn GattLink>,
    closed: Arc<AtomicBool>,
}

impl LinkWriter {
    /// Write one encoded frame and wait for the transport acknowledgement
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotConnected`] if the link has closed, or
    /// [`ModspressoError::WriteFailed`] if the transport rejects the write.
    pub async fn write(&self, frame: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ModspressoError::NotConnected);
        }

        debug!("Writing {} byte frame", frame.len());
        self.link.write(frame).await.map_err(|err| match err {
            ModspressoError::WriteFailed(_) => err,
            other => ModspressoError::WriteFailed(other.to_string()),
        })
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.pump.abort();
        }
    }
}

async fn release(link: &dyn GattLink) {
    if let Err(e) = link.unsubscribe().await {
        warn!("Failed to unsubscribe: {e}");
    }
    if let Err(e) = link.close().await {
        warn!("Failed to close link: {e}");
    }
}

fn connect_error(err: ModspressoError) -> ModspressoError {
    match err {
        ModspressoError::ConnectError(_) => err,
        other => ModspressoError::ConnectError(other.to_string()),
    }
}

async fn pump_notifications(
    mut events: BoxStream<'static, LinkEvent>,
    state: Arc<RwLock<LinkState>>,
    listener: mpsc::UnboundedSender<SessionEvent>,
    closed: Arc<AtomicBool>,
) {
    while let Some(event) = events.next().await {
        match event {
            LinkEvent::Notification(frame) => {
                let _ = listener.send(SessionEvent::Inbound(protocol::decode(&frame)));
            }
            LinkEvent::Disconnected => break,
        }
    }

    if !closed.swap(true, Ordering::SeqCst) {
        info!("Peripheral dropped the link");
        *state.write().await = LinkState::Idle;
        let _ = listener.send(SessionEvent::State(LinkState::Idle));
        let _ = listener.send(SessionEvent::Disconnected(DisconnectReason::Peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FailurePoint, MockTransport};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    fn profiler() -> PeripheralIdentity {
        PeripheralIdentity::new("mock-1", "EspressoProfiler-ESP32")
    }

    fn session(mock: &MockTransport) -> (LinkSession, mpsc::UnboundedReceiver<SessionEvent>) {
        LinkSession::new(Arc::new(mock.clone()), DiscoveryFilter::default())
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session dropped")
    }

    async fn connected(mock: &MockTransport) -> (LinkSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (mut session, mut events) = session(mock);
        session.scan().await.unwrap();
        session.connect(&profiler()).await.unwrap();
        while events.try_recv().is_ok() {}
        (session, events)
    }

    #[tokio::test]
    async fn test_connect_walks_states() {
        let mock = MockTransport::with_device(profiler());
        let (mut session, mut events) = session(&mock);

        assert_eq!(session.scan().await.unwrap(), vec![profiler()]);
        assert_ok!(session.connect(&profiler()).await);
        assert_eq!(session.state().await, LinkState::Connected);
        assert_eq!(session.peripheral(), Some(&profiler()));
        assert!(mock.is_subscribed());

        let mut states = Vec::new();
        while let Ok(SessionEvent::State(state)) = events.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                LinkState::Scanning,
                LinkState::Idle,
                LinkState::Connecting,
                LinkState::Connected
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_requires_scan() {
        let mock = MockTransport::with_device(profiler());
        let (mut session, _events) = session(&mock);

        assert!(matches!(
            session.connect(&profiler()).await,
            Err(ModspressoError::NoDeviceChosen)
        ));
        assert_eq!(mock.open_links(), 0);
    }

    #[tokio::test]
    async fn test_scan_failure_returns_to_idle() {
        let mock = MockTransport::unsupported();
        let (mut session, _events) = session(&mock);

        assert!(matches!(
            session.scan().await,
            Err(ModspressoError::NotSupported(_))
        ));
        assert_eq!(session.state().await, LinkState::Idle);
    }

    #[tokio::test]
    async fn test_failed_connect_releases_link() {
        for point in [FailurePoint::Open, FailurePoint::Resolve, FailurePoint::Subscribe] {
            let mock = MockTransport::with_device(profiler());
            let (mut session, _events) = session(&mock);
            session.scan().await.unwrap();

            mock.fail_at(point);
            let result = session.connect(&profiler()).await;
            assert!(
                matches!(result, Err(ModspressoError::ConnectError(_))),
                "{point:?}"
            );
            assert_eq!(session.state().await, LinkState::Idle);
            assert!(!mock.is_subscribed(), "{point:?}");
            assert_eq!(mock.open_links(), 0, "{point:?}");
            assert!(session.peripheral().is_none());
        }
    }

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let mock = MockTransport::with_device(profiler());
        let (_session, mut events) = connected(&mock).await;

        mock.push_notification(br#"{"type":"serial_log","message":"one"}"#.to_vec());
        mock.push_notification(b"garbage".to_vec());
        mock.push_notification(br#"{"type":"serial_log","message":"two"}"#.to_vec());

        let mut received = Vec::new();
        for _ in 0..3 {
            if let SessionEvent::Inbound(event) = next_event(&mut events).await {
                received.push(event);
            }
        }

        assert!(matches!(&received[0], InboundEvent::LogLine(line) if line.text == "one"));
        assert!(matches!(&received[1], InboundEvent::Unrecognized { .. }));
        assert!(matches!(&received[2], InboundEvent::LogLine(line) if line.text == "two"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mock = MockTransport::with_device(profiler());
        let (mut session, mut events) = connected(&mock).await;

        assert_ok!(session.disconnect().await);
        assert_ok!(session.disconnect().await);
        assert_eq!(session.state().await, LinkState::Idle);
        assert_eq!(mock.open_links(), 0);
        assert!(session.discovered().is_empty());

        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Disconnected(DisconnectReason::Local)) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);

        assert_err!(session.write(b"{}").await);
    }

    #[tokio::test]
    async fn test_peer_disconnect_notifies_once() {
        let mock = MockTransport::with_device(profiler());
        let (mut session, mut events) = connected(&mock).await;

        mock.drop_peer();
        loop {
            if next_event(&mut events).await == SessionEvent::Disconnected(DisconnectReason::Peer) {
                break;
            }
        }
        assert_eq!(session.state().await, LinkState::Idle);
        assert!(session.peripheral().is_none());
        assert!(matches!(
            session.write(b"{}").await,
            Err(ModspressoError::NotConnected)
        ));

        assert_ok!(session.disconnect().await);
        assert_eq!(mock.open_links(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rescan_tears_down_active_link() {
        let mock = MockTransport::with_device(profiler());
        let (mut session, _events) = connected(&mock).await;

        session.scan().await.unwrap();
        assert_eq!(session.state().await, LinkState::Idle);
        assert_eq!(mock.open_links(), 0);
        assert!(!mock.is_subscribed());

        session.connect(&profiler()).await.unwrap();
        session.connect(&profiler()).await.unwrap();
        assert_eq!(mock.open_links(), 1);
    }

    #[tokio::test]
    async fn test_writer_outlives_teardown() {
        let mock = MockTransport::with_device(profiler());
        let (mut session, _events) = connected(&mock).await;

        let writer = session.writer().unwrap();
        assert_ok!(writer.write(br#"{"command":"get_status"}"#).await);

        session.disconnect().await.unwrap();
        assert!(matches!(
            writer.write(br#"{"command":"get_status"}"#).await,
            Err(ModspressoError::NotConnected)
        ));
        assert!(matches!(session.writer(), Err(ModspressoError::NotConnected)));
        assert_eq!(mock.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let mock = MockTransport::with_device(profiler());
        let (session, _events) = connected(&mock).await;

        assert_ok!(session.write(br#"{"command":"get_status"}"#).await);
        mock.fail_at(FailurePoint::Write);
        assert!(matches!(
            session.write(br#"{"command":"get_status"}"#).await,
            Err(ModspressoError::WriteFailed(_))
        ));
        assert_eq!(mock.writes().len(), 1);
    }
}
