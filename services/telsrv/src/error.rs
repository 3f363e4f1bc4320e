//! Error handling for the telemetry gateway service
//!
//! All fallible operations in this crate return [`Result`], which wraps
//! [`TelSrvError`]. Wire-level faults (bad CRC, truncated frames) are not
//! errors at this level; they are handled by resynchronization inside the
//! frame layer and never surface to callers.

use thiserror::Error;

/// Telemetry gateway error type
#[derive(Error, Debug)]
pub enum TelSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// General protocol communication errors
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Modbus protocol specific errors
    #[error("Modbus error: {0}")]
    ModbusError(String),

    /// Modbus exception response reported by a device
    #[error("Modbus exception: function {function:#04x}, code {code:#04x}")]
    ModbusException { function: u8, code: u8 },

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Invalid data format or content errors
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Invalid parameter errors
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A command is already outstanding for the device
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Device not found in the directory snapshot
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Link not found or not running
    #[error("Link not found: {0}")]
    LinkNotFound(String),

    /// Data serialization and deserialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Durable history storage errors
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Latest-value cache errors
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Device directory snapshot unavailable or failed to load
    #[error("Directory error: {0}")]
    DirectoryError(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<sqlx::Error> for TelSrvError {
    fn from(err: sqlx::Error) -> Self {
        TelSrvError::StorageError(err.to_string())
    }
}

impl From<redis::RedisError> for TelSrvError {
    fn from(err: redis::RedisError) -> Self {
        TelSrvError::CacheError(err.to_string())
    }
}

impl From<serde_json::Error> for TelSrvError {
    fn from(err: serde_json::Error) -> Self {
        TelSrvError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for TelSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        TelSrvError::SerializationError(err.to_string())
    }
}

/// Result type alias using [`TelSrvError`]
pub type Result<T> = std::result::Result<T, TelSrvError>;
