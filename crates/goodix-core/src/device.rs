//! Device session: the command layer on top of the chunk transport.
//!
//! [`GoodixDevice`] owns a [`UsbTransport`] and drives every sensor
//! operation over it: soft resets, the GTLS key-agreement handshake,
//! config upload, finger-detection arming, power control. Every command
//! follows the same shape: encode, send chunked, wait for the generic
//! firmware ACK, optionally read a reply message.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::calibration::{CalibrationError, CalibrationParams, SensorConfig};
use crate::crypto::{CryptoProvider, HmacSha256Provider};
use crate::gtls::{GtlsParams, GtlsState, HandshakeError, split_server_hello};
use crate::protocol::{
    CATEGORY_CONFIG, CATEGORY_CONTROL, CATEGORY_FDT, CATEGORY_MCU, CATEGORY_POWER, CMD_EC_CONTROL,
    CMD_MCU, CMD_RESET, CMD_SLEEP, CMD_UPLOAD_CONFIG, DEFAULT_TIMEOUT_MS, FDT_BASE_LEN,
    FDT_REPLY_LEN, GTLS_CLIENT_CONFIRM, GTLS_CLIENT_HELLO, GTLS_SERVER_DONE, GTLS_SERVER_IDENTITY,
    McuEnvelope, Message, ProtocolError, RESET_TIMEOUT_MS, SLEEP_TIMEOUT_MS, check_ack, decode,
    encode, expect_identity,
};
use crate::transport::{
    ChunkError, TransportError, UsbTransport, receive_chunk, receive_message, send_chunked,
};

/// Cap on packets discarded by [`GoodixDevice::drain_pending`].
const DRAIN_LIMIT: usize = 64;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error("config upload rejected by firmware: status {status:#04x}")]
    ConfigRejected { status: u8 },

    #[error("EC control (enable={enable}) failed: status {status:#04x}")]
    EcControl { enable: bool, status: u8 },

    #[error("sensor not calibrated: derive parameters from the OTP first")]
    NotCalibrated,

    #[error("no handshake in progress")]
    NoHandshake,
}

impl From<ChunkError> for DeviceError {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::Transport(e) => DeviceError::Transport(e),
            ChunkError::Protocol(e) => DeviceError::Protocol(e),
        }
    }
}

/// Per-command send options.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Compute the message checksum instead of the skip sentinel.
    pub checksum: bool,
    /// Per-transfer timeout for both the OUT packets and the ACK read.
    pub timeout: Duration,
    /// Read a reply message after the ACK.
    pub expect_reply: bool,
}

impl SendOptions {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            checksum: true,
            timeout: Duration::from_millis(timeout_ms),
            expect_reply: false,
        }
    }

    pub fn with_reply(mut self) -> Self {
        self.expect_reply = true;
        self
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_MS)
    }
}

/// Soft reset variants. The payload is a 16-bit field: bits 0..3 select
/// the reset kind, bit 8 requests an IRQ on completion (sensor reset
/// only), bits 8..16 otherwise carry the settle delay in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Reset the sensor array, optionally raising an IRQ when done.
    Sensor,
    /// Reboot the MCU firmware.
    Mcu,
    /// Reboot without any settle delay.
    Immediate,
}

impl ResetKind {
    fn payload(self, irq_enabled: bool) -> u16 {
        match self {
            ResetKind::Sensor => {
                let mut value = 0b001 | (20 << 8);
                if irq_enabled {
                    value |= 0x100;
                }
                value
            }
            ResetKind::Mcu => 0b010 | (50 << 8),
            ResetKind::Immediate => 0b011,
        }
    }
}

/// Finger-detection operation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdtOperation {
    Down,
    Up,
    Manual,
}

impl FdtOperation {
    /// Message command under [`CATEGORY_FDT`].
    pub fn command(self) -> u8 {
        match self {
            FdtOperation::Down => 0,
            FdtOperation::Up => 1,
            FdtOperation::Manual => 2,
        }
    }

    fn opcode(self, table: &FdtOpcodeTable) -> u8 {
        match self {
            FdtOperation::Down => table.down,
            FdtOperation::Up => table.up,
            FdtOperation::Manual => table.manual,
        }
    }
}

impl fmt::Display for FdtOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdtOperation::Down => write!(f, "DOWN"),
            FdtOperation::Up => write!(f, "UP"),
            FdtOperation::Manual => write!(f, "MANUAL"),
        }
    }
}

/// Mode opcodes for finger detection. These are model-specific and come
/// from the session configuration, not from the sensor itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdtOpcodeTable {
    pub down: u8,
    pub up: u8,
    pub manual: u8,
}

/// A live session with a GF5395 sensor.
pub struct GoodixDevice<T: UsbTransport, C: CryptoProvider = HmacSha256Provider> {
    transport: T,
    crypto: C,
    psk: Vec<u8>,
    timeout: Duration,
    gtls: Option<GtlsParams>,
    calibration: Option<CalibrationParams>,
}

impl<T: UsbTransport> GoodixDevice<T> {
    pub fn new(transport: T, psk: Vec<u8>) -> Self {
        Self::with_crypto(transport, HmacSha256Provider, psk)
    }
}

impl<T: UsbTransport, C: CryptoProvider> GoodixDevice<T, C> {
    pub fn with_crypto(transport: T, crypto: C, psk: Vec<u8>) -> Self {
        Self {
            transport,
            crypto,
            psk,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            gtls: None,
            calibration: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Handshake state, if one was started.
    pub fn gtls(&self) -> Option<&GtlsParams> {
        self.gtls.as_ref()
    }

    pub fn session_established(&self) -> bool {
        self.gtls.as_ref().is_some_and(|p| p.is_established())
    }

    pub fn calibration(&self) -> Option<&CalibrationParams> {
        self.calibration.as_ref()
    }

    /// Claim the bulk interface and drop any stale session state.
    pub fn init_device(&mut self) -> Result<(), DeviceError> {
        self.transport.claim_interface()?;
        self.gtls = None;
        self.calibration = None;
        info!(
            vid = %format!("{:04x}", self.transport.vendor_id()),
            pid = %format!("{:04x}", self.transport.product_id()),
            "Device initialized"
        );
        Ok(())
    }

    pub fn deinit_device(&mut self) -> Result<(), DeviceError> {
        self.gtls = None;
        self.transport.release_interface()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Message exchange
    // ------------------------------------------------------------------

    /// Send one message: encode, chunk out, consume the firmware ACK.
    /// With `expect_reply` the follow-up reply message is read and
    /// returned.
    pub fn send(
        &self,
        message: &Message,
        options: SendOptions,
    ) -> Result<Option<Message>, DeviceError> {
        self.write_command(message, options)?;
        if options.expect_reply {
            Ok(Some(self.receive_with(options.timeout)?))
        } else {
            Ok(None)
        }
    }

    /// Read and decode one reply message with the default timeout.
    pub fn receive(&self) -> Result<Message, DeviceError> {
        self.receive_with(self.timeout)
    }

    fn receive_with(&self, timeout: Duration) -> Result<Message, DeviceError> {
        let buffer = receive_message(&self.transport, timeout)?;
        let message = decode(&buffer)?;
        trace!(
            category = message.category,
            command = message.command,
            len = message.payload.len(),
            "Message received"
        );
        Ok(message)
    }

    fn write_command(&self, message: &Message, options: SendOptions) -> Result<(), DeviceError> {
        debug!(
            category = message.category,
            command = message.command,
            len = message.payload.len(),
            "Running command"
        );
        let encoded = encode(message, options.checksum, true);
        send_chunked(&self.transport, &encoded, options.timeout)?;

        let ack = self.receive_with(options.timeout)?;
        check_ack(&ack)?;
        if ack.payload[0] != message.cmd_byte() {
            // The firmware ACKs every message; a stale echo usually means
            // leftover traffic from a previous session.
            warn!(
                expected = %format!("{:#04x}", message.cmd_byte()),
                received = %format!("{:#04x}", ack.payload[0]),
                "ACK echoes a different command"
            );
        }
        Ok(())
    }

    /// Discard buffered IN packets left over from a previous session.
    pub fn drain_pending(&self) -> usize {
        let timeout = Duration::from_millis(50);
        let mut drained = 0;
        while drained < DRAIN_LIMIT && receive_chunk(&self.transport, timeout).is_ok() {
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "Discarded stale packets");
        }
        drained
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Issue a soft reset. No reply follows; the sensor settles within
    /// the delay encoded in the payload.
    #[instrument(skip(self))]
    pub fn reset(&self, kind: ResetKind, irq_enabled: bool) -> Result<(), DeviceError> {
        let payload = kind.payload(irq_enabled).to_le_bytes().to_vec();
        let message = Message::new(CATEGORY_CONTROL, CMD_RESET, payload);
        self.send(&message, SendOptions::new(RESET_TIMEOUT_MS))?;
        Ok(())
    }

    /// Toggle the sensor's event circuit.
    #[instrument(skip(self))]
    pub fn ec_control(&self, enable: bool) -> Result<(), DeviceError> {
        let flag = enable as u8;
        let message = Message::new(CATEGORY_CONTROL, CMD_EC_CONTROL, vec![flag, flag, 0]);
        let reply = self
            .send(&message, SendOptions::default().with_reply())?
            .ok_or(DeviceError::Transport(TransportError::NoData { attempts: 0 }))?;
        expect_identity(CATEGORY_CONTROL, CMD_EC_CONTROL, &reply)?;

        let status = reply.payload.first().copied().unwrap_or(0);
        if status != 1 {
            return Err(DeviceError::EcControl { enable, status });
        }
        Ok(())
    }

    /// Put the sensor into its low-power state.
    #[instrument(skip(self))]
    pub fn set_sleep_mode(&self) -> Result<(), DeviceError> {
        let message = Message::new(CATEGORY_POWER, CMD_SLEEP, vec![0x01, 0x00]);
        self.send(&message, SendOptions::new(SLEEP_TIMEOUT_MS))?;
        Ok(())
    }

    /// Upload a patched sensor config blob. The firmware answers with a
    /// one-byte status where `1` means accepted.
    #[instrument(skip(self, config))]
    pub fn upload_config(&self, config: &SensorConfig) -> Result<(), DeviceError> {
        let message = Message::new(
            CATEGORY_CONFIG,
            CMD_UPLOAD_CONFIG,
            config.as_bytes().to_vec(),
        );
        let reply = self
            .send(&message, SendOptions::default().with_reply())?
            .ok_or(DeviceError::Transport(TransportError::NoData { attempts: 0 }))?;
        expect_identity(CATEGORY_CONFIG, CMD_UPLOAD_CONFIG, &reply)?;

        let status = reply.payload.first().copied().unwrap_or(0);
        if status != 1 {
            return Err(DeviceError::ConfigRejected { status });
        }
        info!(len = config.as_bytes().len(), "Config accepted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calibration
    // ------------------------------------------------------------------

    /// Derive and store calibration parameters from an OTP dump.
    pub fn set_calibration(&mut self, otp: &[u8]) -> Result<&CalibrationParams, DeviceError> {
        let params = CalibrationParams::derive(otp)?;
        Ok(self.calibration.insert(params))
    }

    /// Patch a config blob with the stored calibration parameters and
    /// rewrite its trailing checksum.
    pub fn prepare_config(&self, config: &mut SensorConfig) -> Result<(), DeviceError> {
        let params = self.calibration.as_ref().ok_or(DeviceError::NotCalibrated)?;
        config.patch(params);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Finger detection
    // ------------------------------------------------------------------

    /// Arm finger detection in the given mode. Returns `true` only for
    /// [`FdtOperation::Manual`]; DOWN and UP are fire-and-forget triggers
    /// with no synchronous success signal at this layer.
    pub fn finger_detection_start(
        &self,
        op: FdtOperation,
        opcodes: &FdtOpcodeTable,
        fdt_base: &[u8; FDT_BASE_LEN],
    ) -> Result<bool, DeviceError> {
        debug!(mode = %op, "Arming finger detection");
        let mut payload = Vec::with_capacity(2 + FDT_BASE_LEN);
        payload.push(op.opcode(opcodes));
        payload.push(0x01);
        payload.extend_from_slice(fdt_base);

        let message = Message::new(CATEGORY_FDT, op.command(), payload);
        self.send(&message, SendOptions::default())?;
        Ok(op == FdtOperation::Manual)
    }

    /// Wait for a finger-detection reply and return its IRQ status byte.
    pub fn finger_detection_poll(
        &self,
        op: FdtOperation,
        expected_fdt_base: &[u8; FDT_BASE_LEN],
    ) -> Result<u8, DeviceError> {
        let reply = self.receive()?;
        expect_identity(CATEGORY_FDT, op.command(), &reply)?;
        if reply.payload.len() != FDT_REPLY_LEN {
            return Err(DeviceError::Protocol(ProtocolError::Malformed {
                expected: FDT_REPLY_LEN,
                actual: reply.payload.len(),
            }));
        }

        let irq_status = reply.payload[2];
        if &reply.payload[4..4 + FDT_BASE_LEN] != expected_fdt_base {
            trace!(mode = %op, "FDT reply base differs from the armed table");
        }
        debug!(mode = %op, irq_status = %format!("{irq_status:#04x}"), "FDT reply");
        Ok(irq_status)
    }

    // ------------------------------------------------------------------
    // GTLS handshake
    // ------------------------------------------------------------------

    /// Run the full three-step handshake. On any failure the partial
    /// session state is discarded; a later retry starts from scratch with
    /// a fresh client random.
    #[instrument(skip(self))]
    pub fn run_handshake(&mut self) -> Result<(), DeviceError> {
        self.gtls = Some(GtlsParams::new(self.crypto.random_nonce()));
        loop {
            match self.handshake_step() {
                Ok(GtlsState::Complete) => {
                    info!("GTLS handshake established");
                    return Ok(());
                }
                Ok(_) => continue,
                Err(err) => {
                    self.gtls = None;
                    return Err(err);
                }
            }
        }
    }

    /// Advance the handshake by one step and return the new state.
    pub fn handshake_step(&mut self) -> Result<GtlsState, DeviceError> {
        let state = self.gtls.as_ref().ok_or(DeviceError::NoHandshake)?.state;
        match state {
            GtlsState::ClientHello => self.step_client_hello(),
            GtlsState::ServerIdentify => self.step_server_identify(),
            GtlsState::ServerDone => self.step_server_done(),
            GtlsState::Complete => Ok(GtlsState::Complete),
        }
    }

    fn step_client_hello(&mut self) -> Result<GtlsState, DeviceError> {
        let client_random = self
            .gtls
            .as_ref()
            .ok_or(DeviceError::NoHandshake)?
            .client_random;
        debug!(client_random = %hex::encode(client_random), "CLIENT_HELLO");
        self.send_mcu(GTLS_CLIENT_HELLO, &client_random)?;

        let params = self.gtls.as_mut().ok_or(DeviceError::NoHandshake)?;
        params.on_client_hello_sent()?;
        Ok(params.state)
    }

    fn step_server_identify(&mut self) -> Result<GtlsState, DeviceError> {
        let payload = self.recv_mcu(GTLS_SERVER_IDENTITY)?;
        let client_random = self
            .gtls
            .as_ref()
            .ok_or(DeviceError::NoHandshake)?
            .client_random;

        let (server_random, _) = split_server_hello(&payload)?;
        let derived = self
            .crypto
            .derive_session_keys(&client_random, &server_random, &self.psk);

        let confirm = {
            let params = self.gtls.as_mut().ok_or(DeviceError::NoHandshake)?;
            params.on_server_identify(&payload, derived)?
        };
        self.send_mcu(GTLS_CLIENT_CONFIRM, &confirm)?;
        Ok(GtlsState::ServerDone)
    }

    fn step_server_done(&mut self) -> Result<GtlsState, DeviceError> {
        let payload = self.recv_mcu(GTLS_SERVER_DONE)?;
        let params = self.gtls.as_mut().ok_or(DeviceError::NoHandshake)?;
        params.on_server_done(&payload)?;
        Ok(params.state)
    }

    /// Send a tagged MCU envelope inside a category `0xD` message.
    fn send_mcu(&self, tag: u32, data: &[u8]) -> Result<(), DeviceError> {
        let envelope = McuEnvelope::new(tag, data.to_vec());
        let message = Message::new(CATEGORY_MCU, CMD_MCU, envelope.to_bytes());
        self.write_command(&message, SendOptions::new(DEFAULT_TIMEOUT_MS))
    }

    /// Read a category `0xD` message and unwrap its MCU envelope,
    /// checking the tag against the expected handshake step.
    fn recv_mcu(&self, expected_tag: u32) -> Result<Vec<u8>, DeviceError> {
        let message = self.receive()?;
        expect_identity(CATEGORY_MCU, CMD_MCU, &message)?;
        let envelope = McuEnvelope::parse(&message.payload)?;
        if envelope.tag != expected_tag {
            return Err(HandshakeError::UnexpectedTag {
                expected: expected_tag,
                received: envelope.tag,
            }
            .into());
        }
        Ok(envelope.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DerivedSession, NONCE_LEN};
    use crate::protocol::{CATEGORY_ACK, CMD_ACK};
    use crate::transport::{MockTransport, split_packets};

    /// Crypto provider with a deterministic nonce, delegating key
    /// derivation to the real provider.
    struct FixedNonceCrypto([u8; NONCE_LEN]);

    impl CryptoProvider for FixedNonceCrypto {
        fn random_nonce(&self) -> [u8; NONCE_LEN] {
            self.0
        }

        fn derive_session_keys(
            &self,
            client_random: &[u8; NONCE_LEN],
            server_random: &[u8; NONCE_LEN],
            psk: &[u8],
        ) -> DerivedSession {
            HmacSha256Provider.derive_session_keys(client_random, server_random, psk)
        }
    }

    const CLIENT_RANDOM: [u8; NONCE_LEN] = [0x11; NONCE_LEN];
    const SERVER_RANDOM: [u8; NONCE_LEN] = [0x22; NONCE_LEN];
    const PSK: [u8; 32] = [0u8; 32];

    fn device_with_mock() -> GoodixDevice<MockTransport, FixedNonceCrypto> {
        GoodixDevice::with_crypto(
            MockTransport::new(),
            FixedNonceCrypto(CLIENT_RANDOM),
            PSK.to_vec(),
        )
    }

    fn queue_reply(mock: &MockTransport, message: &Message) {
        mock.queue_packets(split_packets(&encode(message, true, true)));
    }

    fn queue_ack(mock: &MockTransport, category: u8, command: u8) {
        let echoed = Message::new(category, command, vec![]).cmd_byte();
        let ack = Message::new(CATEGORY_ACK, CMD_ACK, vec![echoed, 0x01]);
        queue_reply(mock, &ack);
    }

    fn mcu_message(tag: u32, payload: Vec<u8>) -> Message {
        Message::new(CATEGORY_MCU, CMD_MCU, McuEnvelope::new(tag, payload).to_bytes())
    }

    fn decode_write(packet: &[u8]) -> Message {
        decode(packet).unwrap()
    }

    #[test]
    fn test_reset_sensor_payload() {
        let device = device_with_mock();
        queue_ack(device.transport(), CATEGORY_CONTROL, CMD_RESET);
        device.reset(ResetKind::Sensor, true).unwrap();

        let writes = device.transport().get_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 64);
        // cmd 0xA2, length 4, payload 0x1501 LE, checksum 0xA9EE LE
        assert_eq!(&writes[0][..7], &[0xA2, 0x04, 0x00, 0x01, 0x15, 0xEE, 0xA9]);
    }

    #[test]
    fn test_reset_payload_variants() {
        assert_eq!(ResetKind::Sensor.payload(false), 0x1401);
        assert_eq!(ResetKind::Sensor.payload(true), 0x1501);
        assert_eq!(ResetKind::Mcu.payload(false), 0x3202);
        // IRQ flag only applies to sensor resets.
        assert_eq!(ResetKind::Mcu.payload(true), 0x3202);
        assert_eq!(ResetKind::Immediate.payload(false), 0x0003);
    }

    #[test]
    fn test_sleep_mode_payload() {
        let device = device_with_mock();
        queue_ack(device.transport(), CATEGORY_POWER, CMD_SLEEP);
        device.set_sleep_mode().unwrap();

        let writes = device.transport().get_writes();
        assert_eq!(&writes[0][..7], &[0x60, 0x04, 0x00, 0x01, 0x00, 0x45, 0xAA]);
    }

    #[test]
    fn test_handshake_success() {
        let mut device = device_with_mock();
        let derived =
            HmacSha256Provider.derive_session_keys(&CLIENT_RANDOM, &SERVER_RANDOM, &PSK);

        let mut hello = SERVER_RANDOM.to_vec();
        hello.extend_from_slice(&derived.client_identity);

        let mock = device.transport();
        queue_ack(mock, CATEGORY_MCU, CMD_MCU);
        queue_reply(mock, &mcu_message(GTLS_SERVER_IDENTITY, hello));
        queue_ack(mock, CATEGORY_MCU, CMD_MCU);
        queue_reply(mock, &mcu_message(GTLS_SERVER_DONE, vec![0]));

        device.run_handshake().unwrap();
        assert!(device.session_established());

        let params = device.gtls().unwrap();
        assert_eq!(params.keys.as_ref().unwrap(), &derived.keys);
        assert_eq!(
            params.hmac_client_counter,
            Some(derived.keys.hmac_client_counter_init)
        );
        assert_eq!(
            params.hmac_server_counter,
            Some(derived.keys.hmac_server_counter_init)
        );

        // Two outbound messages: CLIENT_HELLO and CLIENT_CONFIRM.
        let writes = device.transport().get_writes();
        assert_eq!(writes.len(), 2);

        let hello_out = McuEnvelope::parse(&decode_write(&writes[0]).payload).unwrap();
        assert_eq!(hello_out.tag, GTLS_CLIENT_HELLO);
        assert_eq!(hello_out.payload, CLIENT_RANDOM);

        let confirm_out = McuEnvelope::parse(&decode_write(&writes[1]).payload).unwrap();
        assert_eq!(confirm_out.tag, GTLS_CLIENT_CONFIRM);
        assert_eq!(&confirm_out.payload[..32], &derived.client_identity);
        assert_eq!(&confirm_out.payload[32..], &[0xEE, 0xEE, 0xEE, 0xEE]);
    }

    #[test]
    fn test_handshake_wrong_identity_length() {
        let mut device = device_with_mock();
        let mock = device.transport();
        queue_ack(mock, CATEGORY_MCU, CMD_MCU);
        queue_reply(mock, &mcu_message(GTLS_SERVER_IDENTITY, vec![0u8; 63]));

        let err = device.run_handshake().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Handshake(HandshakeError::WrongLength {
                expected: 0x40,
                received: 63,
            })
        ));
        // Failed handshakes leave no partial state behind.
        assert!(device.gtls().is_none());
    }

    #[test]
    fn test_handshake_identity_mismatch() {
        let mut device = device_with_mock();
        // Sensor derived its identity from a different PSK.
        let sensor_side =
            HmacSha256Provider.derive_session_keys(&CLIENT_RANDOM, &SERVER_RANDOM, &[0xFF; 32]);
        let mut hello = SERVER_RANDOM.to_vec();
        hello.extend_from_slice(&sensor_side.client_identity);

        let mock = device.transport();
        queue_ack(mock, CATEGORY_MCU, CMD_MCU);
        queue_reply(mock, &mcu_message(GTLS_SERVER_IDENTITY, hello));

        let err = device.run_handshake().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Handshake(HandshakeError::IdentityMismatch { .. })
        ));
        assert!(device.gtls().is_none());
    }

    #[test]
    fn test_handshake_server_rejected() {
        let mut device = device_with_mock();
        let derived =
            HmacSha256Provider.derive_session_keys(&CLIENT_RANDOM, &SERVER_RANDOM, &PSK);
        let mut hello = SERVER_RANDOM.to_vec();
        hello.extend_from_slice(&derived.client_identity);

        let mock = device.transport();
        queue_ack(mock, CATEGORY_MCU, CMD_MCU);
        queue_reply(mock, &mcu_message(GTLS_SERVER_IDENTITY, hello));
        queue_ack(mock, CATEGORY_MCU, CMD_MCU);
        queue_reply(mock, &mcu_message(GTLS_SERVER_DONE, vec![0x05]));

        let err = device.run_handshake().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Handshake(HandshakeError::ServerRejected { .. })
        ));
        assert!(!device.session_established());
    }

    #[test]
    fn test_handshake_unexpected_tag() {
        let mut device = device_with_mock();
        let mock = device.transport();
        queue_ack(mock, CATEGORY_MCU, CMD_MCU);
        // SERVER_DONE arrives where SERVER_IDENTIFY was expected.
        queue_reply(mock, &mcu_message(GTLS_SERVER_DONE, vec![0]));

        let err = device.run_handshake().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Handshake(HandshakeError::UnexpectedTag {
                expected: GTLS_SERVER_IDENTITY,
                received: GTLS_SERVER_DONE,
            })
        ));
    }

    #[test]
    fn test_step_without_handshake() {
        let mut device = device_with_mock();
        assert!(matches!(
            device.handshake_step().unwrap_err(),
            DeviceError::NoHandshake
        ));
    }

    #[test]
    fn test_upload_config_accepted() {
        let device = device_with_mock();
        let config = SensorConfig::new(vec![0u8; 16]).unwrap();

        let mock = device.transport();
        queue_ack(mock, CATEGORY_CONFIG, CMD_UPLOAD_CONFIG);
        queue_reply(mock, &Message::new(CATEGORY_CONFIG, CMD_UPLOAD_CONFIG, vec![1]));

        device.upload_config(&config).unwrap();

        let sent = decode_write(&device.transport().get_writes()[0]);
        assert_eq!(sent.category, CATEGORY_CONFIG);
        assert_eq!(sent.payload, config.as_bytes());
    }

    #[test]
    fn test_upload_config_rejected() {
        let device = device_with_mock();
        let config = SensorConfig::new(vec![0u8; 16]).unwrap();

        let mock = device.transport();
        queue_ack(mock, CATEGORY_CONFIG, CMD_UPLOAD_CONFIG);
        queue_reply(mock, &Message::new(CATEGORY_CONFIG, CMD_UPLOAD_CONFIG, vec![0]));

        let err = device.upload_config(&config).unwrap_err();
        assert!(matches!(err, DeviceError::ConfigRejected { status: 0 }));
    }

    #[test]
    fn test_upload_config_reply_identity_checked() {
        let device = device_with_mock();
        let config = SensorConfig::new(vec![0u8; 16]).unwrap();

        let mock = device.transport();
        queue_ack(mock, CATEGORY_CONFIG, CMD_UPLOAD_CONFIG);
        queue_reply(mock, &Message::new(CATEGORY_CONTROL, CMD_RESET, vec![1]));

        let err = device.upload_config(&config).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Protocol(ProtocolError::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn test_ec_control() {
        let device = device_with_mock();
        let mock = device.transport();
        queue_ack(mock, CATEGORY_CONTROL, CMD_EC_CONTROL);
        queue_reply(mock, &Message::new(CATEGORY_CONTROL, CMD_EC_CONTROL, vec![1, 0]));
        device.ec_control(true).unwrap();

        let sent = decode_write(&device.transport().get_writes()[0]);
        assert_eq!(sent.payload, vec![1, 1, 0]);

        queue_ack(mock, CATEGORY_CONTROL, CMD_EC_CONTROL);
        queue_reply(mock, &Message::new(CATEGORY_CONTROL, CMD_EC_CONTROL, vec![0, 0]));
        let err = device.ec_control(false).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::EcControl {
                enable: false,
                status: 0,
            }
        ));
    }

    #[test]
    fn test_finger_detection_start() {
        let device = device_with_mock();
        let opcodes = FdtOpcodeTable {
            down: 0x8C,
            up: 0x86,
            manual: 0x40,
        };
        let base = [0xAB; FDT_BASE_LEN];

        let mock = device.transport();
        queue_ack(mock, CATEGORY_FDT, FdtOperation::Manual.command());
        let armed = device
            .finger_detection_start(FdtOperation::Manual, &opcodes, &base)
            .unwrap();
        assert!(armed);

        let sent = decode_write(&device.transport().get_writes()[0]);
        assert_eq!(sent.category, CATEGORY_FDT);
        assert_eq!(sent.command, 2);
        assert_eq!(sent.payload[0], 0x40);
        assert_eq!(sent.payload[1], 0x01);
        assert_eq!(&sent.payload[2..], &base);

        queue_ack(mock, CATEGORY_FDT, FdtOperation::Down.command());
        let armed = device
            .finger_detection_start(FdtOperation::Down, &opcodes, &base)
            .unwrap();
        assert!(!armed);
    }

    #[test]
    fn test_finger_detection_poll() {
        let device = device_with_mock();
        let base = [0x10; FDT_BASE_LEN];

        let mut payload = vec![0u8; FDT_REPLY_LEN];
        payload[2] = 0x42;
        payload[4..4 + FDT_BASE_LEN].copy_from_slice(&base);
        queue_reply(
            device.transport(),
            &Message::new(CATEGORY_FDT, FdtOperation::Manual.command(), payload),
        );

        let irq = device
            .finger_detection_poll(FdtOperation::Manual, &base)
            .unwrap();
        assert_eq!(irq, 0x42);
    }

    #[test]
    fn test_finger_detection_poll_bad_length() {
        let device = device_with_mock();
        queue_reply(
            device.transport(),
            &Message::new(CATEGORY_FDT, FdtOperation::Down.command(), vec![0u8; 10]),
        );

        let err = device
            .finger_detection_poll(FdtOperation::Down, &[0; FDT_BASE_LEN])
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Protocol(ProtocolError::Malformed {
                expected: FDT_REPLY_LEN,
                actual: 10,
            })
        ));
    }

    #[test]
    fn test_drain_pending() {
        let device = device_with_mock();
        device.transport().queue_packet(&[0xAA; 64]);
        device.transport().queue_packet(&[0xBB; 64]);
        assert_eq!(device.drain_pending(), 2);
        assert_eq!(device.drain_pending(), 0);
    }

    #[test]
    fn test_prepare_config_requires_calibration() {
        let mut device = device_with_mock();
        let mut config = SensorConfig::new(vec![0u8; 16]).unwrap();
        assert!(matches!(
            device.prepare_config(&mut config).unwrap_err(),
            DeviceError::NotCalibrated
        ));

        let mut otp = vec![0u8; 64];
        otp[17] = 0x0A;
        otp[23] = 0x41;
        device.set_calibration(&otp).unwrap();
        device.prepare_config(&mut config).unwrap();
    }

    #[test]
    fn test_init_claims_interface() {
        let mut device = device_with_mock();
        assert!(!device.transport().is_claimed());
        device.init_device().unwrap();
        assert!(device.transport().is_claimed());
        device.deinit_device().unwrap();
        assert!(!device.transport().is_claimed());
    }
}
