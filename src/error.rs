//! Error types for charger communication and configuration.

use thiserror::Error;

/// Result type alias for charger operations.
pub type Result<T> = std::result::Result<T, ChargerError>;

/// Error types for communication with the charger device.
#[derive(Error, Debug)]
pub enum ChargerError {
    /// Serial port communication error
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Communication timeout (no response from device)
    #[error("Communication timeout")]
    Timeout,

    /// Response failed structural validation
    #[error("Invalid response to command {cmd_id:#04x}")]
    InvalidResponse {
        /// Command the response belonged to
        cmd_id: u8,
    },

    /// Capability response carried the wrong protocol key
    #[error("Protocol key mismatch: {found:#010x}")]
    ProtocolMismatch {
        /// Key reported by the device
        found: u32,
    },

    /// Operation requires an established device connection
    #[error("Device not connected")]
    NotConnected,

    /// Configuration or parameter value out of its valid range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Persisted configuration could not be read or written
    #[error("Config persistence error: {0}")]
    Persist(#[from] serde_json::Error),
}
