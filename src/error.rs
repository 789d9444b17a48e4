use thiserror::Error;

/// Errors that can occur while talking to a Modspresso controller
#[derive(Error, Debug)]
pub enum ModspressoError {
    /// The host has no usable Bluetooth capability
    #[error("Bluetooth not supported on this host: {0}")]
    NotSupported(String),

    /// Discovery finished without a matching peripheral
    #[error("No Modspresso device found")]
    NoDeviceChosen,

    /// The user dismissed the device chooser
    #[error("Device selection cancelled by user")]
    UserCancelled,

    /// Opening the link or resolving the service/characteristic failed
    #[error("Failed to connect to device: {0}")]
    ConnectError(String),

    /// A command was issued with no connected session
    #[error("Not connected to a Modspresso device")]
    NotConnected,

    /// The transport rejected a write
    #[error("Failed to send command: {0}")]
    WriteFailed(String),

    /// The encoded command does not fit in a single write, even after shrinking
    #[error("Payload of {size} bytes exceeds the {limit} byte write limit")]
    PayloadTooLarge {
        /// Size of the smallest encoding that was produced
        size: usize,
        /// Write ceiling in bytes
        limit: usize,
    },

    /// An inbound frame could not be decoded
    #[error("Skipped undecodable frame: {0}")]
    DecodeSkipped(String),

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// JSON serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bluetooth adapter error not covered by a more specific kind
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}

/// Result type for Modspresso operations
pub type Result<T> = std::result::Result<T, ModspressoError>;

impl ModspressoError {
    /// Check if this error indicates a missing or broken link
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectError(_)
                | Self::NotConnected
                | Self::NoDeviceChosen
                | Self::NotSupported(_)
        )
    }

    /// Check if this error was raised at the transport boundary (scan, connect, write)
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::NotSupported(_)
                | Self::NoDeviceChosen
                | Self::UserCancelled
                | Self::ConnectError(_)
                | Self::WriteFailed(_)
        )
    }

    /// Check if retrying the same operation later can succeed without changing its input
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::WriteFailed(_)
                | Self::NotConnected
                | Self::NoDeviceChosen
                | Self::UserCancelled
                | Self::DecodeSkipped(_)
        )
    }
}
