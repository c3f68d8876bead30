//! Goodix-Core: GF5395 fingerprint sensor protocol implementation in Rust.
//!
//! This crate drives a Goodix GF5395 capacitive fingerprint sensor over
//! USB bulk transfers: chunked message transport, the GTLS key-agreement
//! handshake, calibration from OTP data, and sensor config upload.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, message codec, MCU sub-envelope
//! - **Transport**: USB communication abstraction (nusb, mock) and chunking
//! - **Crypto**: Session key derivation from the pre-shared key
//! - **GTLS**: Handshake state machine
//! - **Calibration**: OTP-derived parameters and config blob patching
//! - **Device**: Command layer over a live transport
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level bring-up orchestrator
//!
//! # Example
//!
//! ```no_run
//! use goodix_core::session::{SensorSession, SessionConfig};
//!
//! let config = SessionConfig {
//!     config_path: Some("gf5395_config.bin".to_string()),
//!     ..Default::default()
//! };
//!
//! let session = SensorSession::new(config);
//! let device = session.run().expect("sensor bring-up failed");
//! assert!(device.session_established());
//! ```

pub mod calibration;
pub mod crypto;
pub mod device;
pub mod events;
pub mod gtls;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use calibration::{CalibrationError, CalibrationParams, SensorConfig};
pub use crypto::{CryptoProvider, DerivedSession, HmacSha256Provider, SessionKeys};
pub use device::{
    DeviceError, FdtOpcodeTable, FdtOperation, GoodixDevice, ResetKind, SendOptions,
};
pub use events::{LogLevel, NullObserver, SensorEvent, SensorObserver, SensorPhase, TracingObserver};
pub use gtls::{GtlsParams, GtlsState, HandshakeError};
pub use protocol::{Message, ProtocolError};
pub use session::{SensorSession, SessionConfig};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
