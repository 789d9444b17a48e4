use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    calibration::{CalibrationCurve, MAX_CALIBRATION_PRESSURE, MAX_CONTROL_LEVEL},
    error::{ModspressoError, Result},
    types::{
        ButtonAssignment, ButtonDefaults, DeviceStatus, DeviceTimestamp, HardwareButton, LogLevel,
        LogLine, PressureUpdate, Profile, ProfileSegment,
    },
};

/// Number of profile slots on the device
pub const PROFILE_SLOTS: u8 = 10;

/// Segments the device keeps per stored profile
pub const MAX_STORED_SEGMENTS: usize = 10;

/// Name characters kept in the first compact `store_profile` attempt
pub const COMPACT_NAME_CHARS: usize = 12;

/// Highest calibration step accepted by `set_calibration_point`
pub const MAX_CALIBRATION_STEP: u8 = 10;

/// Reduction steps allowed after the first compact attempt
pub const MAX_SHRINK_ITERATIONS: usize = 5;

const SEGMENT_FLOOR: usize = 5;
const SEGMENT_STEP: usize = 2;
const NAME_FLOOR: usize = 8;
const NAME_STEP: usize = 2;

/// Button slot value meaning "no profile assigned"
pub const UNASSIGNED_SLOT: u8 = 255;

/// Command sent to the controller
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    /// Run a profile supplied inline
    StartProfile {
        /// Profile name
        name: String,
        /// Profile segments
        segments: Vec<ProfileSegment>,
    },
    /// Run a profile stored on the device
    StartProfileById {
        /// Storage slot
        id: u8,
    },
    /// Stop the running profile and cut the pump
    StopProfile,
    /// Drive the dimmer at a fixed level
    SetControlLevel {
        /// Level in percent, 0-100
        level: u8,
    },
    /// Enter calibration mode
    StartCalibration,
    /// Record one measured calibration step
    SetCalibrationPoint {
        /// Step index, 0-10 (level = step * 10)
        step: u8,
        /// Measured pressure in bar
        pressure: f64,
    },
    /// Replace the device calibration table
    SetCalibrationData {
        /// Calibration samples
        curve: CalibrationCurve,
    },
    /// Ask for the device calibration table
    GetCalibrationStatus,
    /// Ask for a status snapshot
    GetStatus,
    /// Ask for the stored profile inventory
    GetProfileStatus,
    /// Persist a profile into a storage slot
    StoreProfile {
        /// Storage slot, 0-9
        slot: u8,
        /// Profile to store
        profile: Profile,
    },
    /// Assign a stored profile to a hardware button
    SetButtonDefault {
        /// Button to assign
        button: HardwareButton,
        /// Storage slot
        slot: u8,
    },
    /// Write text verbatim
    RawText {
        /// Text to write
        text: String,
    },
}

impl OutboundCommand {
    /// Wire name of the command, used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StartProfile { .. } => "start_profile",
            Self::StartProfileById { .. } => "start_profile_by_id",
            Self::StopProfile => "stop_profile",
            Self::SetControlLevel { .. } => "set_dim_level",
            Self::StartCalibration => "start_calibration",
            Self::SetCalibrationPoint { .. } => "set_calibration_point",
            Self::SetCalibrationData { .. } => "set_calibration_data",
            Self::GetCalibrationStatus => "get_calibration_status",
            Self::GetStatus => "get_status",
            Self::GetProfileStatus => "get_profile_status",
            Self::StoreProfile { .. } => "store_profile",
            Self::SetButtonDefault { .. } => "set_default_profile",
            Self::RawText { .. } => "raw_text",
        }
    }

    /// Check parameter ranges
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::InvalidParameters`] for an out-of-range level, slot,
    /// step or pressure, or a malformed profile.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::SetControlLevel { level } if *level > MAX_CONTROL_LEVEL => {
                Err(ModspressoError::InvalidParameters(format!(
                    "control level {level} is out of range (0 - {MAX_CONTROL_LEVEL})"
                )))
            }
            Self::StartProfileById { id: slot } | Self::StoreProfile { slot, .. }
                if *slot >= PROFILE_SLOTS =>
            {
                Err(ModspressoError::InvalidParameters(format!(
                    "profile slot {slot} is out of range (0 - {})",
                    PROFILE_SLOTS - 1
                )))
            }
            Self::SetCalibrationPoint { step, .. } if *step > MAX_CALIBRATION_STEP => {
                Err(ModspressoError::InvalidParameters(format!(
                    "calibration step {step} is out of range (0 - {MAX_CALIBRATION_STEP})"
                )))
            }
            Self::SetCalibrationPoint { pressure, .. }
                if !(0.0..=MAX_CALIBRATION_PRESSURE).contains(pressure) =>
            {
                Err(ModspressoError::InvalidParameters(format!(
                    "calibration pressure {pressure} bar is out of range (0 - {MAX_CALIBRATION_PRESSURE})"
                )))
            }
            Self::StoreProfile { profile, .. } => profile.validate(),
            Self::StartProfile { name, segments } => {
                Profile::new(String::new(), name.clone(), segments.clone()).validate()
            }
            _ => Ok(()),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum WireCommand<'a> {
    StartProfile {
        profile: WireProfile<'a>,
    },
    StartProfileById {
        id: u8,
    },
    StopProfile,
    SetDimLevel {
        level: u8,
    },
    StartCalibration,
    SetCalibrationPoint {
        step: u8,
        pressure: f64,
    },
    SetCalibrationData {
        calibration: &'a CalibrationCurve,
    },
    GetCalibrationStatus,
    GetStatus,
    GetProfileStatus,
    StoreProfile {
        id: u8,
        profile: WireProfile<'a>,
    },
    SetDefaultProfile {
        button: u8,
        #[serde(rename = "profileId")]
        profile_id: u8,
    },
}

#[derive(Serialize)]
struct WireProfile<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    name: &'a str,
    segments: &'a [ProfileSegment],
}

#[derive(Serialize)]
struct CompactStore<'a> {
    cmd: &'static str,
    id: u8,
    p: CompactProfile<'a>,
}

#[derive(Serialize)]
struct CompactProfile<'a> {
    id: &'a str,
    n: &'a str,
    s: Vec<CompactSegment>,
}

#[derive(Serialize)]
struct CompactSegment {
    st: f64,
    et: f64,
    sp: f64,
    ep: f64,
}

impl From<&ProfileSegment> for CompactSegment {
    fn from(segment: &ProfileSegment) -> Self {
        Self {
            st: segment.start_time,
            et: segment.end_time,
            sp: segment.start_pressure,
            ep: segment.end_pressure,
        }
    }
}

/// Segment and name allowance for one compact `store_profile` attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkLimits {
    /// Leading segments kept
    pub segments: usize,
    /// Leading name characters kept
    pub name_chars: usize,
}

impl ShrinkLimits {
    /// Limits for the first compact attempt of a profile with `segment_count` segments
    #[must_use]
    pub fn initial(segment_count: usize) -> Self {
        Self {
            segments: segment_count.min(MAX_STORED_SEGMENTS),
            name_chars: COMPACT_NAME_CHARS,
        }
    }

    /// Next, smaller limits, or `None` once nothing is left to drop
    ///
    /// Segments go first, two at a time down to five; then the name loses two
    /// characters at a time down to eight; finally only one segment is kept.
    #[must_use]
    pub fn reduce(self) -> Option<Self> {
        if self.segments > SEGMENT_FLOOR {
            Some(Self {
                segments: (self.segments - SEGMENT_STEP).max(SEGMENT_FLOOR),
                ..self
            })
        } else if self.name_chars > NAME_FLOOR {
            Some(Self {
                name_chars: (self.name_chars - NAME_STEP).max(NAME_FLOOR),
                ..self
            })
        } else if self.segments > 1 {
            Some(Self { segments: 1, ..self })
        } else {
            None
        }
    }
}

/// Encode a command into a single write no larger than `ceiling` bytes
///
/// # Errors
///
/// Returns [`ModspressoError::InvalidParameters`] if the command fails validation,
/// [`ModspressoError::PayloadTooLarge`] if no encoding fits, or
/// [`ModspressoError::Serialization`] if a value cannot be represented as JSON.
pub fn encode(command: &OutboundCommand, ceiling: usize) -> Result<Bytes> {
    command.validate()?;

    if let OutboundCommand::StoreProfile { slot, profile } = command {
        return shrink_store_profile(*slot, profile, ceiling);
    }

    let frame = match frame_of(command) {
        Frame::Json(wire) => to_json(&wire)?,
        Frame::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
    };

    if frame.len() > ceiling {
        return Err(ModspressoError::PayloadTooLarge {
            size: frame.len(),
            limit: ceiling,
        });
    }
    Ok(frame)
}

/// Encode `store_profile`, shrinking it until it fits within `ceiling`
///
/// The full encoding is used when it fits. Otherwise compact encodings are
/// tried starting from [`ShrinkLimits::initial`], applying at most
/// [`MAX_SHRINK_ITERATIONS`] reductions.
///
/// # Errors
///
/// Returns [`ModspressoError::PayloadTooLarge`] carrying the smallest size produced
/// when no attempt fits, or [`ModspressoError::Serialization`] for unencodable values.
pub fn shrink_store_profile(slot: u8, profile: &Profile, ceiling: usize) -> Result<Bytes> {
    let full = to_json(&WireCommand::StoreProfile {
        id: slot,
        profile: WireProfile {
            id: Some(&profile.id),
            name: &profile.name,
            segments: &profile.segments,
        },
    })?;
    if full.len() <= ceiling {
        return Ok(full);
    }

    debug!(
        size = full.len(),
        limit = ceiling,
        "store_profile exceeds write limit, switching to compact encoding"
    );

    let mut limits = ShrinkLimits::initial(profile.segments.len());
    let mut smallest = full.len();
    let mut reductions = 0;

    loop {
        let frame = encode_compact(slot, profile, limits)?;
        debug!(
            size = frame.len(),
            segments = limits.segments,
            name_chars = limits.name_chars,
            "compact store_profile attempt"
        );
        if frame.len() <= ceiling {
            return Ok(frame);
        }
        smallest = smallest.min(frame.len());

        if reductions == MAX_SHRINK_ITERATIONS {
            break;
        }
        match limits.reduce() {
            Some(next) => limits = next,
            None => break,
        }
        reductions += 1;
    }

    Err(ModspressoError::PayloadTooLarge {
        size: smallest,
        limit: ceiling,
    })
}

fn encode_compact(slot: u8, profile: &Profile, limits: ShrinkLimits) -> Result<Bytes> {
    to_json(&CompactStore {
        cmd: "store_profile",
        id: slot,
        p: CompactProfile {
            id: &profile.id,
            n: truncate_chars(&profile.name, limits.name_chars),
            s: profile
                .segments
                .iter()
                .take(limits.segments)
                .map(CompactSegment::from)
                .collect(),
        },
    })
}

enum Frame<'a> {
    Json(WireCommand<'a>),
    Text(&'a str),
}

fn frame_of(command: &OutboundCommand) -> Frame<'_> {
    let wire = match command {
        OutboundCommand::StartProfile { name, segments } => WireCommand::StartProfile {
            profile: WireProfile {
                id: None,
                name,
                segments,
            },
        },
        OutboundCommand::StartProfileById { id } => WireCommand::StartProfileById { id: *id },
        OutboundCommand::StopProfile => WireCommand::StopProfile,
        OutboundCommand::SetControlLevel { level } => WireCommand::SetDimLevel { level: *level },
        OutboundCommand::StartCalibration => WireCommand::StartCalibration,
        OutboundCommand::SetCalibrationPoint { step, pressure } => {
            WireCommand::SetCalibrationPoint {
                step: *step,
                pressure: *pressure,
            }
        }
        OutboundCommand::SetCalibrationData { curve } => {
            WireCommand::SetCalibrationData { calibration: curve }
        }
        OutboundCommand::GetCalibrationStatus => WireCommand::GetCalibrationStatus,
        OutboundCommand::GetStatus => WireCommand::GetStatus,
        OutboundCommand::GetProfileStatus => WireCommand::GetProfileStatus,
        OutboundCommand::StoreProfile { slot, profile } => WireCommand::StoreProfile {
            id: *slot,
            profile: WireProfile {
                id: Some(&profile.id),
                name: &profile.name,
                segments: &profile.segments,
            },
        },
        OutboundCommand::SetButtonDefault { button, slot } => WireCommand::SetDefaultProfile {
            button: button.number(),
            profile_id: *slot,
        },
        OutboundCommand::RawText { text } => return Frame::Text(text),
    };
    Frame::Json(wire)
}

fn to_json<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    text.char_indices()
        .nth(max_chars)
        .map_or(text, |(index, _)| &text[..index])
}

/// Frame received from the controller
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Periodic or requested telemetry snapshot
    StatusUpdate(DeviceStatus),
    /// Serial console line
    LogLine(LogLine),
    /// Pressure readout while a profile runs
    PressureUpdate(PressureUpdate),
    /// Calibration table held by the device
    CalibrationReport(CalibrationReport),
    /// Stored profile inventory
    ProfileInventory(ProfileInventory),
    /// Command acknowledgement such as `profile_started`
    Acknowledgement(Acknowledgement),
    /// Frame that could not be decoded
    Unrecognized {
        /// Frame text, lossily decoded
        raw: String,
    },
}

/// Calibration table reported by the device
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationReport {
    /// Whether the device considers itself calibrated
    pub is_calibrated: bool,
    /// Reported samples
    pub curve: CalibrationCurve,
}

/// Summary of one stored profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProfileSummary {
    /// Storage slot
    pub id: u8,
    /// Stored (possibly truncated) name
    pub name: String,
    /// Stored segment count
    #[serde(default)]
    pub segment_count: u8,
    /// Stored duration in seconds
    #[serde(default)]
    pub total_duration: u16,
    /// Whether the stored checksum verified
    #[serde(default)]
    pub checksum_valid: bool,
}

/// Stored profile inventory reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfileInventory {
    /// Number of occupied slots
    pub profile_count: u8,
    /// Hardware button assignments
    pub button_defaults: ButtonDefaults,
    /// Per-slot summaries
    pub profiles: Vec<StoredProfileSummary>,
}

/// Acknowledgement of a command
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgement {
    /// Value of the `status` field, e.g. `profile_started`
    pub status: String,
    /// Remaining fields
    pub body: Map<String, Value>,
}

impl Acknowledgement {
    /// Whether the device reported a failure
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status.ends_with("_error") || self.body.contains_key("error")
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireStatus {
    current_pressure: f64,
    is_running: bool,
    current_segment: u32,
    total_segments: u32,
    uptime: f64,
    is_calibrated: bool,
    profile_count: Option<u8>,
    default_profile1: Option<u8>,
    default_profile2: Option<u8>,
    default_profile1_name: Option<String>,
    default_profile2_name: Option<String>,
}

impl From<WireStatus> for DeviceStatus {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn from(wire: WireStatus) -> Self {
        let button_defaults = if wire.default_profile1.is_some() || wire.default_profile2.is_some() {
            Some(ButtonDefaults {
                button1: assignment(wire.default_profile1, wire.default_profile1_name),
                button2: assignment(wire.default_profile2, wire.default_profile2_name),
            })
        } else {
            None
        };

        Self {
            pressure: wire.current_pressure,
            is_running: wire.is_running,
            current_segment_index: wire.current_segment,
            total_segments: wire.total_segments,
            uptime_seconds: wire.uptime.max(0.0) as u64,
            is_calibrated: wire.is_calibrated,
            stored_profile_count: wire.profile_count,
            button_defaults,
        }
    }
}

fn assignment(slot: Option<u8>, name: Option<String>) -> Option<ButtonAssignment> {
    match slot {
        Some(slot) if slot != UNASSIGNED_SLOT => Some(ButtonAssignment { slot, name }),
        _ => None,
    }
}

#[derive(Deserialize)]
struct WireLog {
    message: String,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    timestamp: Option<f64>,
}

impl From<WireLog> for LogLine {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn from(wire: WireLog) -> Self {
        Self {
            text: wire.message,
            level: wire
                .level
                .as_deref()
                .map_or(LogLevel::Info, LogLevel::from_wire),
            timestamp: DeviceTimestamp::from_millis(wire.timestamp.unwrap_or(0.0).max(0.0) as u64),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WirePressure {
    current_pressure: f64,
    target_pressure: f64,
    current_time: f64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireCalibration {
    is_calibrated: bool,
    calibration_data: CalibrationCurve,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireInventory {
    profile_count: u8,
    default_profile1: Option<u8>,
    default_profile2: Option<u8>,
    profiles: Vec<StoredProfileSummary>,
}

/// Decode a notification, turning anything undecodable into [`InboundEvent::Unrecognized`]
///
/// Failures are logged at `warn` and never propagated.
#[must_use]
pub fn decode(frame: &[u8]) -> InboundEvent {
    match try_decode(frame) {
        Ok(event) => event,
        Err(err) => {
            let raw = String::from_utf8_lossy(frame).into_owned();
            warn!(error = %err, raw = %raw, "skipping inbound frame");
            InboundEvent::Unrecognized { raw }
        }
    }
}

/// Decode a notification
///
/// # Errors
///
/// Returns [`ModspressoError::DecodeSkipped`] if the frame is not UTF-8 JSON, has an
/// unknown `type`, or lacks both `type` and `status`.
pub fn try_decode(frame: &[u8]) -> Result<InboundEvent> {
    let text = std::str::from_utf8(frame)
        .map_err(|e| ModspressoError::DecodeSkipped(format!("invalid UTF-8: {e}")))?;
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ModspressoError::DecodeSkipped(format!("invalid JSON: {e}")))?;
    let Value::Object(mut fields) = value else {
        return Err(ModspressoError::DecodeSkipped(
            "frame is not a JSON object".to_string(),
        ));
    };

    let frame_type = fields.get("type").and_then(Value::as_str).map(ToString::to_string);
    match frame_type.as_deref() {
        Some("status_update") => {
            let wire: WireStatus = from_fields(fields)?;
            Ok(InboundEvent::StatusUpdate(wire.into()))
        }
        Some("serial_log") => {
            let wire: WireLog = from_fields(fields)?;
            Ok(InboundEvent::LogLine(wire.into()))
        }
        Some("pressure_update") => {
            let wire: WirePressure = from_fields(fields)?;
            Ok(InboundEvent::PressureUpdate(PressureUpdate {
                current_pressure: wire.current_pressure,
                target_pressure: wire.target_pressure,
                elapsed_seconds: wire.current_time,
            }))
        }
        Some("calibration_status") => {
            let wire: WireCalibration = from_fields(fields)?;
            Ok(InboundEvent::CalibrationReport(CalibrationReport {
                is_calibrated: wire.is_calibrated,
                curve: wire.calibration_data,
            }))
        }
        Some("profile_status") => {
            let wire: WireInventory = from_fields(fields)?;
            Ok(InboundEvent::ProfileInventory(ProfileInventory {
                profile_count: wire.profile_count,
                button_defaults: ButtonDefaults {
                    button1: assignment(wire.default_profile1, None),
                    button2: assignment(wire.default_profile2, None),
                },
                profiles: wire.profiles,
            }))
        }
        Some(other) => Err(ModspressoError::DecodeSkipped(format!(
            "unknown frame type `{other}`"
        ))),
        None => match fields.remove("status") {
            Some(Value::String(status)) => Ok(InboundEvent::Acknowledgement(Acknowledgement {
                status,
                body: fields,
            })),
            _ => Err(ModspressoError::DecodeSkipped(
                "frame has neither `type` nor `status`".to_string(),
            )),
        },
    }
}

fn from_fields<T: for<'de> Deserialize<'de>>(fields: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| ModspressoError::DecodeSkipped(format!("malformed frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_WRITE_SIZE;
    use serde_json::json;

    fn encode_value(command: &OutboundCommand) -> Value {
        let bytes = encode(command, MAX_WRITE_SIZE).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Segments whose pressures are thirds, so each one costs ~65 bytes compact
    fn long_segments(count: u32) -> Vec<ProfileSegment> {
        (0..count)
            .map(|i| {
                ProfileSegment::new(
                    f64::from(i * 3),
                    f64::from(i * 3 + 3),
                    f64::from(i + 1) / 3.0,
                    f64::from(i + 2) / 3.0,
                )
            })
            .collect()
    }

    #[test]
    fn test_simple_command_shapes() {
        assert_eq!(
            encode_value(&OutboundCommand::StopProfile),
            json!({"command": "stop_profile"})
        );
        assert_eq!(
            encode_value(&OutboundCommand::SetControlLevel { level: 45 }),
            json!({"command": "set_dim_level", "level": 45})
        );
        assert_eq!(
            encode_value(&OutboundCommand::StartProfileById { id: 3 }),
            json!({"command": "start_profile_by_id", "id": 3})
        );
        assert_eq!(
            encode_value(&OutboundCommand::SetButtonDefault {
                button: HardwareButton::Two,
                slot: 4
            }),
            json!({"command": "set_default_profile", "button": 2, "profileId": 4})
        );
        assert_eq!(
            encode_value(&OutboundCommand::GetStatus),
            json!({"command": "get_status"})
        );
        assert_eq!(
            encode_value(&OutboundCommand::SetCalibrationPoint {
                step: 5,
                pressure: 6.5
            }),
            json!({"command": "set_calibration_point", "step": 5, "pressure": 6.5})
        );
    }

    #[test]
    fn test_start_profile_shape() {
        let command = OutboundCommand::StartProfile {
            name: "Classic".to_string(),
            segments: vec![ProfileSegment::new(0.0, 8.0, 2.0, 9.0)],
        };
        assert_eq!(
            encode_value(&command),
            json!({
                "command": "start_profile",
                "profile": {
                    "name": "Classic",
                    "segments": [
                        {"startTime": 0.0, "endTime": 8.0, "startPressure": 2.0, "endPressure": 9.0}
                    ]
                }
            })
        );
    }

    #[test]
    fn test_calibration_data_shape() {
        let curve = CalibrationCurve::from_samples([(10, 1.0), (50, 6.5)]).unwrap();
        assert_eq!(
            encode_value(&OutboundCommand::SetCalibrationData { curve }),
            json!({"command": "set_calibration_data", "calibration": {"10": 1.0, "50": 6.5}})
        );
    }

    #[test]
    fn test_small_store_profile_uses_full_keys() {
        let profile = Profile::new("p1", "Turbo", vec![ProfileSegment::new(0.0, 25.0, 6.0, 6.0)]);
        let value = encode_value(&OutboundCommand::StoreProfile { slot: 2, profile });
        assert_eq!(
            value,
            json!({
                "command": "store_profile",
                "id": 2,
                "profile": {
                    "id": "p1",
                    "name": "Turbo",
                    "segments": [
                        {"startTime": 0.0, "endTime": 25.0, "startPressure": 6.0, "endPressure": 6.0}
                    ]
                }
            })
        );
    }

    #[test]
    fn test_large_store_profile_shrinks_segments_first() {
        let profile = Profile::new("espresso-01", "Declining Lever Pull", long_segments(10));
        let command = OutboundCommand::StoreProfile { slot: 3, profile };

        let bytes = encode(&command, MAX_WRITE_SIZE).unwrap();
        assert!(bytes.len() <= MAX_WRITE_SIZE);

        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["cmd"], "store_profile");
        assert_eq!(value["id"], 3);
        assert!(value.get("command").is_none());
        assert_eq!(value["p"]["id"], "espresso-01");
        assert_eq!(value["p"]["n"], "Declining Le");

        let segments = value["p"]["s"].as_array().unwrap();
        assert_eq!(segments.len(), 6);
        assert_eq!(
            segments[0],
            json!({"st": 0.0, "et": 3.0, "sp": 1.0 / 3.0, "ep": 2.0 / 3.0})
        );
    }

    #[test]
    fn test_store_profile_reaches_single_segment() {
        let long_id = "x".repeat(350);
        let profile = Profile::new(long_id, "Declining Lever Pull", long_segments(7));

        let bytes = shrink_store_profile(1, &profile, MAX_WRITE_SIZE).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["p"]["s"].as_array().unwrap().len(), 1);
        assert_eq!(value["p"]["n"], "Declinin");
    }

    #[test]
    fn test_store_profile_too_large_fails() {
        let profile = Profile::new("x".repeat(600), "Declining Lever Pull", long_segments(10));
        let result = encode(&OutboundCommand::StoreProfile { slot: 0, profile }, MAX_WRITE_SIZE);
        assert!(matches!(
            result,
            Err(ModspressoError::PayloadTooLarge { limit: 512, size }) if size > 512
        ));
    }

    #[test]
    fn test_shrink_reduction_order() {
        let mut limits = ShrinkLimits::initial(14);
        let mut seen = vec![(limits.segments, limits.name_chars)];
        while let Some(next) = limits.reduce() {
            limits = next;
            seen.push((limits.segments, limits.name_chars));
        }
        assert_eq!(
            seen,
            vec![(10, 12), (8, 12), (6, 12), (5, 12), (5, 10), (5, 8), (1, 8)]
        );

        let short = ShrinkLimits::initial(3);
        assert_eq!(
            short.reduce(),
            Some(ShrinkLimits {
                segments: 3,
                name_chars: 10
            })
        );
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("Crème brûlée shot", 8), "Crème br");
        assert_eq!(truncate_chars("Short", 12), "Short");
    }

    #[test]
    fn test_raw_text_passthrough_and_limit() {
        let bytes = encode(
            &OutboundCommand::RawText {
                text: "{\"command\":\"get_status\"}".to_string(),
            },
            MAX_WRITE_SIZE,
        )
        .unwrap();
        assert_eq!(&bytes[..], b"{\"command\":\"get_status\"}");

        let oversized = OutboundCommand::RawText {
            text: "a".repeat(513),
        };
        assert!(matches!(
            encode(&oversized, MAX_WRITE_SIZE),
            Err(ModspressoError::PayloadTooLarge { size: 513, limit: 512 })
        ));
    }

    #[test]
    fn test_parameter_validation() {
        assert!(matches!(
            encode(&OutboundCommand::SetControlLevel { level: 101 }, MAX_WRITE_SIZE),
            Err(ModspressoError::InvalidParameters(_))
        ));
        assert!(matches!(
            encode(&OutboundCommand::StartProfileById { id: 10 }, MAX_WRITE_SIZE),
            Err(ModspressoError::InvalidParameters(_))
        ));
        assert!(matches!(
            encode(
                &OutboundCommand::SetCalibrationPoint {
                    step: 11,
                    pressure: 3.0
                },
                MAX_WRITE_SIZE
            ),
            Err(ModspressoError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_decode_full_status() {
        let frame = br#"{"type":"status_update","current_pressure":7.5,"is_running":true,
            "current_segment":1,"total_segments":3,"uptime":120,"is_calibrated":true,
            "profile_count":4,"default_profile1":2,"default_profile2":255,
            "default_profile1_name":"Classic"}"#;

        let InboundEvent::StatusUpdate(status) = decode(frame) else {
            panic!("expected status update");
        };
        assert!((status.pressure - 7.5).abs() < f64::EPSILON);
        assert!(status.is_running);
        assert_eq!(status.current_segment_index, 1);
        assert_eq!(status.total_segments, 3);
        assert_eq!(status.uptime_seconds, 120);
        assert!(status.is_calibrated);
        assert_eq!(status.stored_profile_count, Some(4));

        let defaults = status.button_defaults.unwrap();
        assert_eq!(
            defaults.get(HardwareButton::One),
            Some(&ButtonAssignment {
                slot: 2,
                name: Some("Classic".to_string())
            })
        );
        assert_eq!(defaults.get(HardwareButton::Two), None);
    }

    #[test]
    fn test_decode_partial_status_uses_defaults() {
        let frame = br#"{"type":"status_update","current_pressure":3.2,"is_running":false}"#;
        let InboundEvent::StatusUpdate(status) = decode(frame) else {
            panic!("expected status update");
        };
        assert!(!status.is_calibrated);
        assert_eq!(status.total_segments, 0);
        assert_eq!(status.uptime_seconds, 0);
        assert_eq!(status.stored_profile_count, None);
        assert_eq!(status.button_defaults, None);

        let bare = decode(br#"{"type":"status_update"}"#);
        assert_eq!(bare, InboundEvent::StatusUpdate(DeviceStatus::default()));
    }

    #[test]
    fn test_decode_serial_log() {
        let frame = br#"{"type":"serial_log","message":"Dim level set to: 40%","level":"warn","timestamp":5230}"#;
        let InboundEvent::LogLine(line) = decode(frame) else {
            panic!("expected log line");
        };
        assert_eq!(line.text, "Dim level set to: 40%");
        assert_eq!(line.level, LogLevel::Warn);
        assert_eq!(
            line.timestamp,
            DeviceTimestamp::SinceBoot(std::time::Duration::from_millis(5230))
        );
    }

    #[test]
    fn test_decode_acknowledgement() {
        let frame = br#"{"status":"default_profile_set","button":1,"profileId":3}"#;
        let InboundEvent::Acknowledgement(ack) = decode(frame) else {
            panic!("expected acknowledgement");
        };
        assert_eq!(ack.status, "default_profile_set");
        assert_eq!(ack.body["profileId"], 3);
        assert!(!ack.is_error());

        let InboundEvent::Acknowledgement(failure) =
            decode(br#"{"status":"calibration_error","error":"No valid points"}"#)
        else {
            panic!("expected acknowledgement");
        };
        assert!(failure.is_error());
    }

    #[test]
    fn test_decode_auxiliary_frames() {
        let pressure = decode(
            br#"{"type":"pressure_update","current_pressure":0,"target_pressure":5.5,"current_time":9}"#,
        );
        assert_eq!(
            pressure,
            InboundEvent::PressureUpdate(PressureUpdate {
                current_pressure: 0.0,
                target_pressure: 5.5,
                elapsed_seconds: 9.0,
            })
        );

        let InboundEvent::CalibrationReport(report) = decode(
            br#"{"type":"calibration_status","is_calibrated":true,"calibration_data":{"10":1,"50":6.5}}"#,
        ) else {
            panic!("expected calibration report");
        };
        assert!(report.is_calibrated);
        assert_eq!(report.curve.len(), 2);

        assert!(matches!(
            decode(br#"{"type":"calibration_status","is_calibrated":true,"calibration_data":{"150":9.0}}"#),
            InboundEvent::Unrecognized { .. }
        ));

        let InboundEvent::ProfileInventory(inventory) = decode(
            br#"{"type":"profile_status","profile_count":1,"default_profile1":0,"default_profile2":255,
                "profiles":[{"id":0,"name":"Classic","segment_count":3,"total_duration":30,"checksum_valid":true}]}"#,
        ) else {
            panic!("expected profile inventory");
        };
        assert_eq!(inventory.profile_count, 1);
        assert_eq!(inventory.profiles[0].name, "Classic");
        assert_eq!(inventory.button_defaults.button1.map(|a| a.slot), Some(0));
        assert!(inventory.button_defaults.button2.is_none());
    }

    #[test]
    fn test_decode_garbage_is_unrecognized() {
        assert_eq!(
            decode(b"{not json"),
            InboundEvent::Unrecognized {
                raw: "{not json".to_string()
            }
        );
        assert!(matches!(
            decode(br#"{"type":"firmware_banner"}"#),
            InboundEvent::Unrecognized { .. }
        ));
        assert!(matches!(decode(b"[1,2,3]"), InboundEvent::Unrecognized { .. }));
        assert!(matches!(
            decode(&[0xff, 0xfe, 0x00]),
            InboundEvent::Unrecognized { .. }
        ));
        assert!(matches!(
            try_decode(br#"{"type":"serial_log"}"#),
            Err(ModspressoError::DecodeSkipped(_))
        ));
    }
}
