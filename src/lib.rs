#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Modspresso ☕
//!
//! A Rust library for driving an ESP32-based espresso pressure profiler over
//! Bluetooth Low Energy.
//!
//! The controller sits between the machine's pump and a phase-angle dimmer. It
//! exposes one GATT characteristic that carries UTF-8 JSON in both directions:
//! commands are written to it, and status, log and acknowledgement frames
//! arrive as notifications. This crate covers that link end to end:
//!
//! - **Calibration**: piecewise-linear mapping between dimmer level and bar
//!   ([`calibration`])
//! - **Profiles**: target pressure along a profile's time axis ([`curve`])
//! - **Wire codec**: command encoding, including the compact `store_profile`
//!   form that keeps large profiles under the 512 byte write limit
//!   ([`protocol`])
//! - **Link session**: discovery, connection lifecycle and notification
//!   delivery for a single peripheral ([`session`])
//! - **Device facade**: intent-level commands plus the last known status and
//!   a rolling device log ([`EspressoDevice`])
//!
//! The radio sits behind the [`transport::Transport`] trait. [`ble`] provides
//! the btleplug implementation and [`mock`] an in-memory one for tests.
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: this library drives a pump under pressure. Keep the
//! machine's own over-pressure valve in place and stay within reach of the
//! power switch while a profile runs.
//!
//! ## Quick Start
//!
//! ```no_run
//! use modspresso::{ConnectionParams, EspressoDevice, Profile, ProfileSegment};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = EspressoDevice::with_bluetooth(ConnectionParams::default()).await?;
//!     device.connect_first().await?;
//!
//!     let profile = Profile::new(
//!         "classic",
//!         "Classic 9 bar",
//!         vec![
//!             ProfileSegment::new(0.0, 8.0, 2.0, 2.0),
//!             ProfileSegment::new(8.0, 12.0, 2.0, 9.0),
//!             ProfileSegment::new(12.0, 30.0, 9.0, 9.0),
//!         ],
//!     );
//!     device.start_profile(profile).await?;
//!
//!     device.stop_profile().await?;
//!     device.disconnect().await?;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy transport backed by btleplug
pub mod ble;
/// Dimmer level to pressure calibration math
pub mod calibration;
/// Profile target pressure over time
pub mod curve;
/// Main device control interface
pub mod device;
/// Error types and handling
pub mod error;
/// In-memory transport for tests and demos
pub mod mock;
/// Wire codec for commands and notifications
pub mod protocol;
/// Connection lifecycle for a single peripheral
pub mod session;
/// Radio capability traits
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use calibration::{level_for_pressure, pressure_for_level, CalibrationCurve};
pub use curve::{pressure_at_time, simulate_progress, SimulatedProgress};
pub use device::{DeviceEvent, EspressoDevice, ProfileSource};
pub use error::{ModspressoError, Result};
pub use protocol::{InboundEvent, OutboundCommand};
pub use session::{DisconnectReason, LinkSession, LinkWriter};
pub use types::{
    ButtonAssignment, ButtonDefaults, ConnectionParams, DeviceStatus, DeviceTimestamp,
    HardwareButton, LinkState, LogLevel, LogLine, PeripheralIdentity, PressureUpdate, Profile,
    ProfileSegment,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// GATT service advertised by the profiler firmware
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4faf_c201_1fb5_459e_8fcc_c5c9_c331_914b);

/// Read/write/notify characteristic carrying all traffic in both directions
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbeb5_483e_36e1_4688_b7f5_ea07_361b_26a8);

/// Advertised-name prefixes accepted during discovery
///
/// The firmware advertises as `EspressoProfiler-ESP32`; development boards that
/// have not been renamed still advertise with the `ESP32` prefix.
pub const DEVICE_NAME_PREFIXES: &[&str] = &["EspressoProfiler", "ESP32"];

/// Largest single write the peripheral accepts, in bytes
pub const MAX_WRITE_SIZE: usize = 512;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_constants() {
        assert_eq!(
            SERVICE_UUID,
            Uuid::parse_str("4fafc201-1fb5-459e-8fcc-c5c9c331914b").unwrap()
        );
        assert_eq!(
            CHARACTERISTIC_UUID,
            Uuid::parse_str("beb5483e-36e1-4688-b7f5-ea07361b26a8").unwrap()
        );
    }
}
