//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front-ends to observe session progress without tight
//! coupling to the protocol core.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Sensor bring-up phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorPhase {
    /// Claiming the interface and flushing stale data.
    Initializing,
    /// GTLS handshake in progress.
    Handshake,
    /// Deriving calibration from OTP data.
    Calibration,
    /// Uploading the patched config blob.
    ConfigUpload,
    /// Waiting on finger-detection events.
    FingerDetection,
    /// Bring-up finished.
    Ready,
    /// Error state.
    Error,
}

impl fmt::Display for SensorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorPhase::Initializing => write!(f, "Initializing"),
            SensorPhase::Handshake => write!(f, "Handshake"),
            SensorPhase::Calibration => write!(f, "Calibration"),
            SensorPhase::ConfigUpload => write!(f, "Config Upload"),
            SensorPhase::FingerDetection => write!(f, "Finger Detection"),
            SensorPhase::Ready => write!(f, "Ready"),
            SensorPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted during a sensor session.
#[derive(Debug, Clone)]
pub enum SensorEvent {
    /// Device connected.
    DeviceConnected { vid: u16, pid: u16 },
    /// Phase changed.
    PhaseChanged { from: SensorPhase, to: SensorPhase },
    /// Handshake advanced to a new state.
    HandshakeAdvanced { state: String },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Error occurred.
    Error { message: String },
    /// Bring-up complete; session usable.
    Ready,
}

/// Observer trait for receiving sensor events.
pub trait SensorObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &SensorEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl SensorObserver for NullObserver {
    fn on_event(&self, _event: &SensorEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl SensorObserver for TracingObserver {
    fn on_event(&self, event: &SensorEvent) {
        match event {
            SensorEvent::DeviceConnected { vid, pid } => {
                tracing::info!(vid = %format!("{vid:04X}"), pid = %format!("{pid:04X}"), "Device connected");
            }
            SensorEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            SensorEvent::HandshakeAdvanced { state } => {
                tracing::debug!(state = %state, "Handshake advanced");
            }
            SensorEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            SensorEvent::Error { message } => {
                tracing::error!("{}", message);
            }
            SensorEvent::Ready => {
                tracing::info!("Sensor ready");
            }
        }
    }
}
