use crate::{
    ble::BtleplugTransport,
    calibration::{level_for_pressure, CalibrationCurve},
    curve::{simulate_progress, SimulatedProgress},
    error::{ModspressoError, Result},
    protocol::{
        self, Acknowledgement, CalibrationReport, InboundEvent, OutboundCommand, ProfileInventory,
    },
    session::{DisconnectReason, LinkSession, SessionEvent},
    transport::{DiscoveryFilter, Transport},
    types::{
        ConnectionParams, DeviceStatus, HardwareButton, LinkState, LogBuffer, LogLine,
        PeripheralIdentity, PressureUpdate, Profile,
    },
    SERVICE_UUID,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Profile to run: sent inline or referenced by storage slot
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileSource {
    /// Send the full profile with the command
    Inline(Profile),
    /// Run the profile stored in a device slot
    Slot(u8),
}

impl From<Profile> for ProfileSource {
    fn from(profile: Profile) -> Self {
        Self::Inline(profile)
    }
}

impl From<u8> for ProfileSource {
    fn from(slot: u8) -> Self {
        Self::Slot(slot)
    }
}

/// Event broadcast to facade subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The link state changed
    LinkState(LinkState),
    /// A status snapshot replaced the previous one
    Status(DeviceStatus),
    /// A device log line was buffered
    Log(LogLine),
    /// Pressure readout from a running profile
    Pressure(PressureUpdate),
    /// Device calibration table
    Calibration(CalibrationReport),
    /// Stored profile inventory
    Inventory(ProfileInventory),
    /// Command acknowledgement
    Acknowledgement(Acknowledgement),
    /// Undecodable frame text
    Unrecognized(String),
    /// The link ended
    Disconnected(DisconnectReason),
}

/// State written by the notification path and read by callers
struct Telemetry {
    status: RwLock<Option<DeviceStatus>>,
    logs: RwLock<LogBuffer>,
    pressure: RwLock<Option<PressureUpdate>>,
    calibration: RwLock<Option<CalibrationReport>>,
    inventory: RwLock<Option<ProfileInventory>>,
    acknowledgement: RwLock<Option<Acknowledgement>>,
    running: RwLock<Option<(Profile, Instant)>>,
}

impl Telemetry {
    fn new(log_capacity: usize) -> Self {
        Self {
            status: RwLock::new(None),
            logs: RwLock::new(LogBuffer::with_capacity(log_capacity)),
            pressure: RwLock::new(None),
            calibration: RwLock::new(None),
            inventory: RwLock::new(None),
            acknowledgement: RwLock::new(None),
            running: RwLock::new(None),
        }
    }

    async fn apply(&self, event: SessionEvent) -> DeviceEvent {
        match event {
            SessionEvent::State(state) => DeviceEvent::LinkState(state),
            SessionEvent::Disconnected(reason) => {
                self.running.write().await.take();
                DeviceEvent::Disconnected(reason)
            }
            SessionEvent::Inbound(InboundEvent::StatusUpdate(status)) => {
                *self.status.write().await = Some(status.clone());
                DeviceEvent::Status(status)
            }
            SessionEvent::Inbound(InboundEvent::LogLine(line)) => {
                self.logs.write().await.push(line.clone());
                DeviceEvent::Log(line)
            }
            SessionEvent::Inbound(InboundEvent::PressureUpdate(update)) => {
                *self.pressure.write().await = Some(update);
                DeviceEvent::Pressure(update)
            }
            SessionEvent::Inbound(InboundEvent::CalibrationReport(report)) => {
                *self.calibration.write().await = Some(report.clone());
                DeviceEvent::Calibration(report)
            }
            SessionEvent::Inbound(InboundEvent::ProfileInventory(inventory)) => {
                *self.inventory.write().await = Some(inventory.clone());
                DeviceEvent::Inventory(inventory)
            }
            SessionEvent::Inbound(InboundEvent::Acknowledgement(ack)) => {
                if ack.is_error() {
                    warn!("Device reported {}: {:?}", ack.status, ack.body);
                } else {
                    debug!("Device acknowledged: {}", ack.status);
                }
                if ack.status == "profile_stopped" {
                    self.running.write().await.take();
                }
                *self.acknowledgement.write().await = Some(ack.clone());
                DeviceEvent::Acknowledgement(ack)
            }
            SessionEvent::Inbound(InboundEvent::Unrecognized { raw }) => {
                DeviceEvent::Unrecognized(raw)
            }
        }
    }
}

async fn dispatch_events(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    telemetry: Arc<Telemetry>,
    subscribers: broadcast::Sender<DeviceEvent>,
) {
    while let Some(event) = events.recv().await {
        let event = telemetry.apply(event).await;
        let _ = subscribers.send(event);
    }
}

/// Main interface for controlling a Modspresso controller
///
/// `EspressoDevice` owns the link session and exposes intent-level commands.
/// Each command resolves once the transport acknowledges its write; replies
/// arrive separately as notifications and are reflected in [`Self::status`],
/// [`Self::logs`] and the [`DeviceEvent`] stream. There are no request IDs on
/// the wire, so every status update is treated as a fresh snapshot rather than
/// the answer to a particular request.
///
/// Commands issued while no link is connected fail immediately with
/// [`ModspressoError::NotConnected`]; nothing is queued or retried. Every
/// failure is also kept in [`Self::last_error`] for display. Writes go out in
/// call order, and [`Self::disconnect`] does not wait for one in flight.
///
/// # Examples
///
/// ```no_run
/// use modspresso::{ConnectionParams, EspressoDevice};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let device = EspressoDevice::with_bluetooth(ConnectionParams::default()).await?;
///     device.connect_first().await?;
///
///     device.start_profile(0_u8).await?;
///     device.request_status().await?;
///
///     if let Some(status) = device.status().await {
///         println!("Pressure: {:.1} bar", status.pressure);
///     }
///
///     device.stop_profile().await?;
///     device.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct EspressoDevice {
    session: Mutex<LinkSession>,
    write_order: Mutex<()>,
    link_state: Arc<RwLock<LinkState>>,
    params: ConnectionParams,
    telemetry: Arc<Telemetry>,
    pushed_calibration: RwLock<Option<CalibrationCurve>>,
    last_error: RwLock<Option<String>>,
    subscribers: broadcast::Sender<DeviceEvent>,
    dispatcher: JoinHandle<()>,
}

impl EspressoDevice {
    /// Create a facade over `transport`
    ///
    /// Must be called from within a Tokio runtime; inbound events are handled
    /// by a background task for the lifetime of the facade.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, params: ConnectionParams) -> Self {
        let filter = DiscoveryFilter::new(SERVICE_UUID, params.name_prefixes.clone());
        let (session, events) = LinkSession::new(transport, filter);
        let link_state = session.state_handle();
        let telemetry = Arc::new(Telemetry::new(params.log_capacity));
        let (subscribers, _) = broadcast::channel(EVENT_CAPACITY);

        let dispatcher = tokio::spawn(dispatch_events(
            events,
            Arc::clone(&telemetry),
            subscribers.clone(),
        ));

        Self {
            session: Mutex::new(session),
            write_order: Mutex::new(()),
            link_state,
            params,
            telemetry,
            pushed_calibration: RwLock::new(None),
            last_error: RwLock::new(None),
            subscribers,
            dispatcher,
        }
    }

    /// Create a facade using the host Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotSupported`] if the host has no usable adapter.
    pub async fn with_bluetooth(params: ConnectionParams) -> Result<Self> {
        let transport =
            BtleplugTransport::new(Duration::from_millis(params.scan_timeout_ms)).await?;
        Ok(Self::new(Arc::new(transport), params))
    }

    /// Connection parameters in use
    #[must_use]
    pub const fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Subscribe to device events
    ///
    /// Only events sent after subscribing are received.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.subscribers.subscribe()
    }

    /// Current link state
    pub async fn link_state(&self) -> LinkState {
        *self.link_state.read().await
    }

    /// Whether a link is connected
    pub async fn is_connected(&self) -> bool {
        self.link_state().await == LinkState::Connected
    }

    /// Discover Modspresso controllers
    ///
    /// Any active link is torn down first.
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotSupported`], [`ModspressoError::NoDeviceChosen`] or
    /// [`ModspressoError::UserCancelled`].
    pub async fn scan(&self) -> Result<Vec<PeripheralIdentity>> {
        let result = self.session.lock().await.scan().await;
        self.track(result).await
    }

    /// Connect to a peripheral returned by the last scan
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NoDeviceChosen`] if `peripheral` was not scanned,
    /// or [`ModspressoError::ConnectError`] if the link cannot be established.
    pub async fn connect(&self, peripheral: &PeripheralIdentity) -> Result<()> {
        let result = self.session.lock().await.connect(peripheral).await;
        if result.is_ok() {
            self.clear_error().await;
        }
        self.track(result).await
    }

    /// Scan and connect to the first controller found
    ///
    /// # Errors
    ///
    /// Returns any error from [`Self::scan`] or [`Self::connect`].
    pub async fn connect_first(&self) -> Result<PeripheralIdentity> {
        let result = async {
            let mut session = self.session.lock().await;
            let peripheral = session
                .scan()
                .await?
                .into_iter()
                .next()
                .ok_or(ModspressoError::NoDeviceChosen)?;
            session.connect(&peripheral).await?;
            Ok::<_, ModspressoError>(peripheral)
        }
        .await;

        if result.is_ok() {
            self.clear_error().await;
        }
        self.track(result).await
    }

    /// Disconnect from the device; a no-op when already disconnected
    ///
    /// # Errors
    ///
    /// Never fails today; teardown problems are logged.
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.session.lock().await.disconnect().await;
        self.telemetry.running.write().await.take();
        self.track(result).await
    }

    /// Run a profile, either sent inline or stored in a slot
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotConnected`], [`ModspressoError::InvalidParameters`],
    /// [`ModspressoError::PayloadTooLarge`] or [`ModspressoError::WriteFailed`].
    pub async fn start_profile(&self, source: impl Into<ProfileSource>) -> Result<()> {
        match source.into() {
            ProfileSource::Inline(profile) => {
                info!("Starting profile: {}", profile.name);
                self.send(OutboundCommand::StartProfile {
                    name: profile.name.clone(),
                    segments: profile.segments.clone(),
                })
                .await?;
                *self.telemetry.running.write().await = Some((profile, Instant::now()));
                Ok(())
            }
            ProfileSource::Slot(id) => {
                info!("Starting stored profile in slot {id}");
                self.send(OutboundCommand::StartProfileById { id }).await?;
                self.telemetry.running.write().await.take();
                Ok(())
            }
        }
    }

    /// Stop the running profile
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotConnected`] or [`ModspressoError::WriteFailed`].
    pub async fn stop_profile(&self) -> Result<()> {
        info!("Stopping profile");
        self.send(OutboundCommand::StopProfile).await?;
        self.telemetry.running.write().await.take();
        Ok(())
    }

    /// Drive the pump dimmer at a fixed level
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::InvalidParameters`] if `level` exceeds 100, or
    /// [`ModspressoError::NotConnected`] / [`ModspressoError::WriteFailed`].
    pub async fn set_control_level(&self, level: u8) -> Result<()> {
        info!("Setting control level to {level}%");
        self.send(OutboundCommand::SetControlLevel { level }).await
    }

    /// Drive the pump at the level the calibration curve predicts for `pressure`
    ///
    /// Uses the curve last pushed from this facade, falling back to the table
    /// last reported by the device. Returns the level that was sent.
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotConnected`], or
    /// [`ModspressoError::InvalidParameters`] if no calibration data is known.
    pub async fn set_target_pressure(&self, pressure: f64) -> Result<u8> {
        let result = async {
            self.ensure_connected().await?;
            let curve = self.calibration().await.ok_or_else(|| {
                ModspressoError::InvalidParameters("no calibration data available".to_string())
            })?;
            Ok::<_, ModspressoError>(level_for_pressure(&curve, pressure))
        }
        .await;
        let level = self.track(result).await?;

        info!("Target pressure {pressure:.1} bar maps to level {level}%");
        self.send(OutboundCommand::SetControlLevel { level }).await?;
        Ok(level)
    }

    /// Put the device into calibration mode
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotConnected`] or [`ModspressoError::WriteFailed`].
    pub async fn start_calibration(&self) -> Result<()> {
        self.send(OutboundCommand::StartCalibration).await
    }

    /// Record the pressure measured at one calibration step (level = step * 10)
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::InvalidParameters`] for a step above 10 or a pressure
    /// outside 0-12 bar, or [`ModspressoError::NotConnected`] /
    /// [`ModspressoError::WriteFailed`].
    pub async fn set_calibration_point(&self, step: u8, pressure: f64) -> Result<()> {
        self.send(OutboundCommand::SetCalibrationPoint { step, pressure })
            .await
    }

    /// Replace the device calibration table
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotConnected`] or [`ModspressoError::WriteFailed`].
    pub async fn push_calibration_data(&self, curve: &CalibrationCurve) -> Result<()> {
        info!("Pushing {} calibration sample(s)", curve.len());
        self.send(OutboundCommand::SetCalibrationData {
            curve: curve.clone(),
        })
        .await?;
        *self.pushed_calibration.write().await = Some(curve.clone());
        Ok(())
    }

    /// Ask the device for a status snapshot
    ///
    /// The reply updates [`Self::status`] when it arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotConnected`] or [`ModspressoError::WriteFailed`].
    pub async fn request_status(&self) -> Result<()> {
        self.send(OutboundCommand::GetStatus).await
    }

    /// Ask the device for its calibration table
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotConnected`] or [`ModspressoError::WriteFailed`].
    pub async fn request_calibration_status(&self) -> Result<()> {
        self.send(OutboundCommand::GetCalibrationStatus).await
    }

    /// Ask the device for its stored profile inventory
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotConnected`] or [`ModspressoError::WriteFailed`].
    pub async fn request_profile_status(&self) -> Result<()> {
        self.send(OutboundCommand::GetProfileStatus).await
    }

    /// Persist a profile into a device slot (0-9)
    ///
    /// Large profiles are shrunk to fit a single write; see
    /// [`protocol::shrink_store_profile`].
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::InvalidParameters`] for a bad slot or profile,
    /// [`ModspressoError::PayloadTooLarge`] if it cannot be made to fit, or
    /// [`ModspressoError::NotConnected`] / [`ModspressoError::WriteFailed`].
    pub async fn store_profile(&self, slot: u8, profile: &Profile) -> Result<()> {
        info!("Storing profile {} in slot {slot}", profile.name);
        self.send(OutboundCommand::StoreProfile {
            slot,
            profile: profile.clone(),
        })
        .await
    }

    /// Assign a stored profile to a hardware button
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::NotConnected`] or [`ModspressoError::WriteFailed`].
    pub async fn assign_button_default(&self, button: HardwareButton, slot: u8) -> Result<()> {
        info!("Assigning slot {slot} to {button}");
        self.send(OutboundCommand::SetButtonDefault { button, slot })
            .await
    }

    /// Write text verbatim
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::PayloadTooLarge`] if the text exceeds the write
    /// ceiling, or [`ModspressoError::NotConnected`] / [`ModspressoError::WriteFailed`].
    pub async fn send_raw_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(OutboundCommand::RawText { text: text.into() })
            .await
    }

    /// Last status snapshot received
    pub async fn status(&self) -> Option<DeviceStatus> {
        self.telemetry.status.read().await.clone()
    }

    /// Buffered device log lines, oldest first
    pub async fn logs(&self) -> Vec<LogLine> {
        self.telemetry.logs.read().await.iter().cloned().collect()
    }

    /// Drop every buffered device log line
    pub async fn clear_logs(&self) {
        self.telemetry.logs.write().await.clear();
    }

    /// Last pressure readout received
    pub async fn last_pressure(&self) -> Option<PressureUpdate> {
        *self.telemetry.pressure.read().await
    }

    /// Last stored profile inventory received
    pub async fn profile_inventory(&self) -> Option<ProfileInventory> {
        self.telemetry.inventory.read().await.clone()
    }

    /// Last command acknowledgement received
    pub async fn last_acknowledgement(&self) -> Option<Acknowledgement> {
        self.telemetry.acknowledgement.read().await.clone()
    }

    /// Calibration curve in effect: the last one pushed, else the last one reported
    pub async fn calibration(&self) -> Option<CalibrationCurve> {
        if let Some(curve) = self.pushed_calibration.read().await.clone() {
            return Some(curve);
        }
        self.telemetry
            .calibration
            .read()
            .await
            .as_ref()
            .filter(|report| !report.curve.is_empty())
            .map(|report| report.curve.clone())
    }

    /// Progress of the inline profile started from this facade, computed locally
    ///
    /// Returns `None` when no inline profile is running. The readout is
    /// derived from the profile and wall-clock time, never from telemetry.
    pub async fn simulated_progress(&self) -> Option<SimulatedProgress> {
        self.telemetry
            .running
            .read()
            .await
            .as_ref()
            .map(|(profile, started)| simulate_progress(profile, started.elapsed().as_secs_f64()))
    }

    /// Message of the most recent failed operation
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Forget the most recent failure
    pub async fn clear_error(&self) {
        self.last_error.write().await.take();
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.is_connected().await {
            Ok(())
        } else {
            Err(ModspressoError::NotConnected)
        }
    }

    async fn send(&self, command: OutboundCommand) -> Result<()> {
        let result = self.write_command(&command).await;
        self.track(result).await
    }

    async fn write_command(&self, command: &OutboundCommand) -> Result<()> {
        self.ensure_connected().await?;

        let frame = protocol::encode(command, self.params.max_write_size)?;
        debug!("Sending {} ({} bytes)", command.name(), frame.len());

        let _order = self.write_order.lock().await;
        let writer = self.session.lock().await.writer()?;
        writer.write(&frame).await
    }

    async fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            error!("Device operation failed: {e}");
            *self.last_error.write().await = Some(e.to_string());
        }
        result
    }
}

impl Drop for EspressoDevice {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}
