//! Error handling for the servo communication stack
//!
//! Errors split into two families: validation errors that are raised before
//! any wire I/O (invalid parameter names, out-of-range values, bad path ids)
//! and transport/protocol faults. Only transport faults participate in the
//! transaction engine's retry loop; a device-reported Modbus exception is a
//! deterministic rejection and is surfaced immediately.

use thiserror::Error;

/// Servo driver error type
#[derive(Error, Debug, Clone)]
pub enum ServoError {
    /// Serial port cannot be opened, or the device does not answer a
    /// verification read after the port opened
    #[error("Connection error: {0}")]
    Connection(String),

    /// Write failure, CRC mismatch, byte-count mismatch, or retry exhaustion
    #[error("Communication error: {0}")]
    Communication(String),

    /// Read or write did not complete within the configured timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Device-reported Modbus exception response
    #[error("Modbus exception 0x{code:02X}: {}", exception_description(*code))]
    ModbusException {
        /// Raw exception code from the device
        code: u8,
    },

    /// Unknown symbolic parameter name
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Value outside the documented range for a parameter
    #[error("Parameter '{name}' value {value} out of range [{min}, {max}]")]
    ParameterOutOfRange {
        name: String,
        value: i32,
        min: i32,
        max: i32,
    },

    /// Operation requires an established connection
    #[error("Not connected to servo drive")]
    NotConnected,

    /// Alarm active or a hardware precondition is unmet
    #[error("Servo not ready: {0}")]
    ServoNotReady(String),

    /// PR path id outside 0-15
    #[error("Invalid PR path id {0} (must be 0-15)")]
    InvalidPath(u8),

    /// Homing operation failed
    #[error("Homing error: {0}")]
    Homing(String),

    /// Operation is not available on this device or firmware revision
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(String),

    /// Data serialization and deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General internal errors (poisoned locks and similar)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the servo driver
pub type Result<T> = std::result::Result<T, ServoError>;

impl ServoError {
    pub fn connection(msg: impl Into<String>) -> Self {
        ServoError::Connection(msg.into())
    }

    pub fn communication(msg: impl Into<String>) -> Self {
        ServoError::Communication(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ServoError::Timeout(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        ServoError::Io(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ServoError::Internal(msg.into())
    }

    /// Whether the transaction engine may retry after this error.
    ///
    /// Timeouts and generic communication faults are assumed transient;
    /// everything else is deterministic and retrying would only repeat it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServoError::Timeout(_) | ServoError::Communication(_))
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for ServoError {
    fn from(err: std::io::Error) -> Self {
        ServoError::Io(err.to_string())
    }
}

// Conversion from serde_json::Error
impl From<serde_json::Error> for ServoError {
    fn from(err: serde_json::Error) -> Self {
        ServoError::Serialization(format!("JSON error: {err}"))
    }
}

// Conversion from serialport::Error
impl From<serialport::Error> for ServoError {
    fn from(err: serialport::Error) -> Self {
        ServoError::Connection(err.to_string())
    }
}

/// Human-readable category for a Modbus exception code.
///
/// Closed table per the Modbus application protocol specification; unknown
/// codes are reported as such rather than guessed at.
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal function",
        0x02 => "Illegal data address",
        0x03 => "Illegal data value",
        0x04 => "Slave device failure",
        0x05 => "Acknowledge",
        0x06 => "Slave device busy",
        0x08 => "Memory parity error",
        0x0A => "Gateway path unavailable",
        0x0B => "Gateway target device failed to respond",
        _ => "Unknown Modbus exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_description_closed_table() {
        assert_eq!(exception_description(0x01), "Illegal function");
        assert_eq!(exception_description(0x02), "Illegal data address");
        assert_eq!(exception_description(0x0B), "Gateway target device failed to respond");
        assert_eq!(exception_description(0x7F), "Unknown Modbus exception");
    }

    #[test]
    fn test_modbus_exception_display() {
        let err = ServoError::ModbusException { code: 0x02 };
        assert_eq!(err.to_string(), "Modbus exception 0x02: Illegal data address");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ServoError::timeout("read").is_retryable());
        assert!(ServoError::communication("crc").is_retryable());
        assert!(!ServoError::ModbusException { code: 1 }.is_retryable());
        assert!(!ServoError::NotConnected.is_retryable());
        assert!(!ServoError::InvalidPath(16).is_retryable());
    }

    #[test]
    fn test_out_of_range_display() {
        let err = ServoError::ParameterOutOfRange {
            name: "rigidity_level".into(),
            value: 40,
            min: 0,
            max: 31,
        };
        assert_eq!(
            err.to_string(),
            "Parameter 'rigidity_level' value 40 out of range [0, 31]"
        );
    }
}
