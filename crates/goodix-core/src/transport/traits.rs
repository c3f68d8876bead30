//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for bulk communication with the sensor,
//! allowing different implementations (nusb, mock, etc.).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Interface not claimed")]
    InterfaceNotClaimed,

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Device returned only zero-length packets after {attempts} reads")]
    NoData { attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract USB transport interface.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
/// - Future alternative backends
pub trait UsbTransport: Send + Sync {
    /// Claim the sensor interface. Must be called before any transfer.
    fn claim_interface(&self) -> Result<(), TransportError>;

    /// Release the sensor interface.
    fn release_interface(&self) -> Result<(), TransportError>;

    /// Submit one bulk OUT transfer.
    fn bulk_out(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Submit one bulk IN transfer of up to `max_len` bytes.
    fn bulk_in(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}
