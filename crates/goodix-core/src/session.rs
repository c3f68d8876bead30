//! Sensor session - high-level orchestrator for device bring-up.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::calibration::SensorConfig;
use crate::device::{FdtOpcodeTable, GoodixDevice, ResetKind};
use crate::events::{LogLevel, SensorEvent, SensorObserver, SensorPhase, TracingObserver};
use crate::protocol::DEFAULT_TIMEOUT_MS;
use crate::transport::{NusbTransport, TransportError, UsbTransport};

/// How long to poll for the sensor before giving up.
const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Configuration for a sensor session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pre-shared key as a hex string.
    pub psk_hex: String,
    /// Per-transfer timeout in milliseconds.
    pub timeout_ms: u64,
    /// Model-specific finger-detection opcodes.
    pub fdt_opcodes: FdtOpcodeTable,
    /// Path to the sensor config blob to upload, if any.
    pub config_path: Option<String>,
    /// OTP dump as a hex string, used to derive calibration.
    pub otp_hex: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            // The all-zero PSK every unprovisioned sensor ships with.
            psk_hex: "0".repeat(64),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            fdt_opcodes: FdtOpcodeTable::default(),
            config_path: None,
            otp_hex: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Decode the configured pre-shared key.
    pub fn psk(&self) -> Result<Vec<u8>> {
        hex::decode(&self.psk_hex).context("psk_hex is not valid hex")
    }
}

/// Tracks the current bring-up phase so skipped stages (no OTP, no
/// config blob) never produce a transition out of a phase that never ran.
struct PhaseTracker {
    current: SensorPhase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            current: SensorPhase::Initializing,
        }
    }

    fn advance(&mut self, to: SensorPhase) -> SensorEvent {
        let from = std::mem::replace(&mut self.current, to);
        SensorEvent::PhaseChanged { from, to }
    }
}

/// Sensor session - orchestrates bring-up from cold device to an
/// established GTLS session with calibration applied.
pub struct SensorSession<O: SensorObserver> {
    config: SessionConfig,
    observer: Arc<O>,
}

impl SensorSession<TracingObserver> {
    /// Create a new session with the default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: SensorObserver + 'static> SensorSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self { config, observer }
    }

    /// Run the bring-up sequence and hand back the live device.
    #[instrument(skip(self))]
    pub fn run(&self) -> Result<GoodixDevice<NusbTransport>> {
        match self.bring_up() {
            Ok(device) => {
                self.observer.on_event(&SensorEvent::Ready);
                Ok(device)
            }
            Err(err) => {
                self.observer.on_event(&SensorEvent::Error {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn bring_up(&self) -> Result<GoodixDevice<NusbTransport>> {
        let transport = self.wait_for_device()?;
        self.observer.on_event(&SensorEvent::DeviceConnected {
            vid: transport.vendor_id(),
            pid: transport.product_id(),
        });

        let psk = self.config.psk()?;
        let mut device = GoodixDevice::new(transport, psk)
            .with_timeout(Duration::from_millis(self.config.timeout_ms));
        let mut phases = PhaseTracker::new();

        device.init_device()?;
        let drained = device.drain_pending();
        if drained > 0 {
            self.observer.on_event(&SensorEvent::Log {
                level: LogLevel::Debug,
                message: format!("discarded {drained} stale packets"),
            });
        }
        device.reset(ResetKind::Sensor, true)?;

        self.observer.on_event(&phases.advance(SensorPhase::Handshake));
        device.run_handshake()?;
        if let Some(params) = device.gtls() {
            self.observer.on_event(&SensorEvent::HandshakeAdvanced {
                state: params.state.to_string(),
            });
        }

        if let Some(otp_hex) = &self.config.otp_hex {
            self.observer
                .on_event(&phases.advance(SensorPhase::Calibration));
            let otp = hex::decode(otp_hex).context("otp_hex is not valid hex")?;
            device.set_calibration(&otp)?;
        }

        if let Some(path) = &self.config.config_path {
            self.observer
                .on_event(&phases.advance(SensorPhase::ConfigUpload));
            info!(path = %path, "Loading sensor config blob");
            let blob = std::fs::read(path)?;
            let mut config = SensorConfig::new(blob)?;
            if device.calibration().is_some() {
                device.prepare_config(&mut config)?;
            }
            device.upload_config(&config)?;
        }

        self.observer.on_event(&phases.advance(SensorPhase::Ready));
        Ok(device)
    }

    fn wait_for_device(&self) -> Result<NusbTransport> {
        info!("Waiting for sensor...");
        let start = Instant::now();
        loop {
            match NusbTransport::open() {
                Ok(t) => return Ok(t),
                Err(TransportError::DeviceNotFound { .. }) => {
                    if start.elapsed() > DEVICE_WAIT_TIMEOUT {
                        return Err(anyhow!(
                            "Timeout waiting for sensor after {}s",
                            DEVICE_WAIT_TIMEOUT.as_secs()
                        ));
                    }
                    thread::sleep(DEVICE_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
