use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    error::{ModspressoError, Result},
    DEVICE_NAME_PREFIXES, MAX_WRITE_SIZE,
};

/// Lifecycle state of the link to the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LinkState {
    /// No peripheral is being discovered or connected
    #[default]
    Idle,
    /// Discovery is running
    Scanning,
    /// A link to a chosen peripheral is being opened
    Connecting,
    /// The characteristic is resolved and subscribed
    Connected,
    /// A local teardown is in progress
    Disconnecting,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// A discovered peripheral
///
/// `id` is the platform handle rendered as a string; it only has meaning to the
/// transport that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralIdentity {
    /// Opaque platform identifier
    pub id: String,
    /// Advertised name
    pub name: String,
    /// Signal strength at discovery time, when the platform reports it
    pub rssi: Option<i16>,
}

impl PeripheralIdentity {
    /// Create a new identity without signal strength
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi: None,
        }
    }
}

/// One linear piece of a pressure profile
///
/// Times are seconds from profile start, pressures are bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSegment {
    /// Segment start time in seconds
    pub start_time: f64,
    /// Segment end time in seconds
    pub end_time: f64,
    /// Pressure at `start_time` in bar
    pub start_pressure: f64,
    /// Pressure at `end_time` in bar
    pub end_pressure: f64,
}

impl ProfileSegment {
    /// Create a new segment
    #[must_use]
    pub const fn new(start_time: f64, end_time: f64, start_pressure: f64, end_pressure: f64) -> Self {
        Self {
            start_time,
            end_time,
            start_pressure,
            end_pressure,
        }
    }

    /// Segment length in seconds
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Whether `t` lies within `[start_time, end_time]`
    #[must_use]
    pub fn contains(&self, t: f64) -> bool {
        self.start_time <= t && t <= self.end_time
    }
}

/// A named pressure profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Caller-assigned identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Free-form description, never sent to the device
    #[serde(default)]
    pub description: String,
    /// Ordered segments
    pub segments: Vec<ProfileSegment>,
}

impl Profile {
    /// Create a profile with an empty description
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, segments: Vec<ProfileSegment>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            segments,
        }
    }

    /// Latest segment end time, or zero for an empty profile
    #[must_use]
    pub fn total_duration(&self) -> f64 {
        self.segments
            .iter()
            .map(|s| s.end_time)
            .fold(0.0, f64::max)
    }

    /// Check segment ordering
    ///
    /// Every segment must satisfy `end_time >= start_time` and start no earlier
    /// than the previous segment ended. Gaps between segments are allowed.
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::InvalidParameters`] describing the first offending segment.
    pub fn validate(&self) -> Result<()> {
        let mut previous_end = f64::NEG_INFINITY;
        for (index, segment) in self.segments.iter().enumerate() {
            let values = [
                segment.start_time,
                segment.end_time,
                segment.start_pressure,
                segment.end_pressure,
            ];
            if values.iter().any(|v| !v.is_finite()) {
                return Err(ModspressoError::InvalidParameters(format!(
                    "segment {index} contains a non-finite value"
                )));
            }
            if segment.end_time < segment.start_time {
                return Err(ModspressoError::InvalidParameters(format!(
                    "segment {index} ends ({}) before it starts ({})",
                    segment.end_time, segment.start_time
                )));
            }
            if segment.start_time < previous_end {
                return Err(ModspressoError::InvalidParameters(format!(
                    "segment {index} overlaps the previous segment"
                )));
            }
            previous_end = segment.end_time;
        }
        Ok(())
    }
}

/// Hardware shortcut button on the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareButton {
    /// Button 1
    One,
    /// Button 2
    Two,
}

impl HardwareButton {
    /// Button number as used on the wire
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

impl TryFrom<u8> for HardwareButton {
    type Error = ModspressoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            other => Err(ModspressoError::InvalidParameters(format!(
                "button must be 1 or 2, got {other}"
            ))),
        }
    }
}

impl fmt::Display for HardwareButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "button {}", self.number())
    }
}

/// Stored profile assigned to a hardware button
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonAssignment {
    /// Device storage slot
    pub slot: u8,
    /// Name of the stored profile, when the device reports it
    pub name: Option<String>,
}

/// Button assignments reported by the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonDefaults {
    /// Assignment for button 1
    pub button1: Option<ButtonAssignment>,
    /// Assignment for button 2
    pub button2: Option<ButtonAssignment>,
}

impl ButtonDefaults {
    /// Assignment for the given button
    #[must_use]
    pub const fn get(&self, button: HardwareButton) -> Option<&ButtonAssignment> {
        match button {
            HardwareButton::One => self.button1.as_ref(),
            HardwareButton::Two => self.button2.as_ref(),
        }
    }
}

/// Telemetry snapshot pushed by the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Measured pressure in bar
    pub pressure: f64,
    /// Whether a profile is executing
    pub is_running: bool,
    /// Index of the executing segment
    pub current_segment_index: u32,
    /// Segment count of the executing profile
    pub total_segments: u32,
    /// Seconds since the device booted
    pub uptime_seconds: u64,
    /// Whether the device holds calibration data
    pub is_calibrated: bool,
    /// Number of profiles stored on the device, when reported
    pub stored_profile_count: Option<u8>,
    /// Hardware button assignments, when reported
    pub button_defaults: Option<ButtonDefaults>,
}

/// Pressure readout sent while a profile executes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureUpdate {
    /// Measured pressure in bar
    pub current_pressure: f64,
    /// Profile target at `elapsed_seconds`
    pub target_pressure: f64,
    /// Seconds since the profile started
    pub elapsed_seconds: f64,
}

/// Severity of a device log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum LogLevel {
    /// Debug output
    Debug,
    /// Informational output
    #[default]
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

impl LogLevel {
    /// Parse the wire representation; unknown values fall back to `Info`
    #[must_use]
    pub fn from_wire(value: &str) -> Self {
        match value {
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Values below this are milliseconds since boot rather than Unix time (Sep 2001).
pub const WALL_CLOCK_THRESHOLD_MS: u64 = 1_000_000_000_000;

/// Timestamp attached to a device log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceTimestamp {
    /// Time since the device booted
    SinceBoot(Duration),
    /// Wall-clock time
    WallClock(SystemTime),
}

impl DeviceTimestamp {
    /// Interpret a raw millisecond timestamp from the device
    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        if millis < WALL_CLOCK_THRESHOLD_MS {
            Self::SinceBoot(Duration::from_millis(millis))
        } else {
            Self::WallClock(UNIX_EPOCH + Duration::from_millis(millis))
        }
    }
}

impl Default for DeviceTimestamp {
    fn default() -> Self {
        Self::SinceBoot(Duration::ZERO)
    }
}

/// A log line forwarded from the device's serial console
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Message text
    pub text: String,
    /// Severity
    pub level: LogLevel,
    /// Device-side timestamp
    pub timestamp: DeviceTimestamp,
}

/// Bounded FIFO of device log lines; the oldest line is dropped once full
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<LogLine>,
    capacity: usize,
}

impl LogBuffer {
    /// Create an empty buffer holding at most `capacity` lines
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a line, evicting the oldest one when full
    pub fn push(&mut self, line: LogLine) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Number of buffered lines
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Maximum number of lines retained
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }

    /// Remove every line
    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

/// Default number of retained device log lines
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Connection and buffering parameters
///
/// Every field has a default, so a partial JSON document deserializes cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// How long discovery runs, in milliseconds
    pub scan_timeout_ms: u64,
    /// Advertised name prefixes accepted during discovery
    pub name_prefixes: Vec<String>,
    /// Largest single write the transport accepts
    pub max_write_size: usize,
    /// Number of device log lines kept by the facade
    pub log_capacity: usize,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 5_000,
            name_prefixes: DEVICE_NAME_PREFIXES.iter().map(ToString::to_string).collect(),
            max_write_size: MAX_WRITE_SIZE,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}
