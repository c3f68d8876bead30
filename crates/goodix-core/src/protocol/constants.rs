//! Protocol constants for the Goodix GF5395 capacitive sensor.

// ============================================================================
// Device Identification
// ============================================================================

/// Goodix Technology Vendor ID
pub const GOODIX_VENDOR_ID: u16 = 0x27C6;

/// GF5395 Product ID
pub const GF5395_PRODUCT_ID: u16 = 0x5395;

/// All supported PIDs for device discovery
pub const SUPPORTED_PIDS: &[u16] = &[GF5395_PRODUCT_ID];

// ============================================================================
// Endpoint / Transfer Sizes
// ============================================================================

/// Maximum bulk OUT packet size. Every OUT transfer is padded to this size.
pub const EP_OUT_MAX: usize = 64;

/// Maximum bulk IN packet size.
pub const EP_IN_MAX: usize = 0x2000;

/// Bound on consecutive zero-length IN packets before the read is abandoned.
/// The firmware busy-idles with empty packets; an unbounded retry loop would
/// spin forever on a wedged sensor.
pub const EMPTY_READ_LIMIT: u32 = 16;

// ============================================================================
// Timeouts
// ============================================================================

/// Default per-transfer timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Timeout for reset commands.
pub const RESET_TIMEOUT_MS: u64 = 500;

/// Timeout for the sleep-mode command.
pub const SLEEP_TIMEOUT_MS: u64 = 200;

// ============================================================================
// Message Categories
// ============================================================================

/// Finger detection (FDT) operations.
pub const CATEGORY_FDT: u8 = 0x3;

/// Power management (sleep mode).
pub const CATEGORY_POWER: u8 = 0x6;

/// Sensor configuration upload.
pub const CATEGORY_CONFIG: u8 = 0x9;

/// Reset and EC control.
pub const CATEGORY_CONTROL: u8 = 0xA;

/// Generic firmware acknowledgment.
pub const CATEGORY_ACK: u8 = 0xB;

/// MCU sub-envelope carrier (handshake traffic).
pub const CATEGORY_MCU: u8 = 0xD;

// ============================================================================
// Commands
// ============================================================================

pub const CMD_RESET: u8 = 1;
pub const CMD_EC_CONTROL: u8 = 7;
pub const CMD_SLEEP: u8 = 0;
pub const CMD_UPLOAD_CONFIG: u8 = 0;
pub const CMD_ACK: u8 = 0;
pub const CMD_MCU: u8 = 1;

// ============================================================================
// GTLS Handshake Envelope Tags
// ============================================================================

pub const GTLS_CLIENT_HELLO: u32 = 0xFF01;
pub const GTLS_SERVER_IDENTITY: u32 = 0xFF02;
pub const GTLS_CLIENT_CONFIRM: u32 = 0xFF03;
pub const GTLS_SERVER_DONE: u32 = 0xFF04;

/// Fixed marker appended to the client confirmation payload.
pub const CLIENT_CONFIRM_MARKER: [u8; 4] = [0xEE, 0xEE, 0xEE, 0xEE];

/// Length of the SERVER_IDENTIFY payload: 32-byte random + 32-byte identity.
pub const SERVER_IDENTITY_LEN: usize = 0x40;

// ============================================================================
// Calibration / Config Blob
// ============================================================================

/// Tag for the TCODE entries in the sensor config blob.
pub const TCODE_TAG: u16 = 0x5C;

/// Tag for the DAC low-byte entries.
pub const DAC_L_TAG: u16 = 0x220;

/// Tag for the touch-down delta entry.
pub const DELTA_DOWN_TAG: u16 = 0x82;

/// Length of a finger-detection base table.
pub const FDT_BASE_LEN: usize = 24;

/// Expected payload length of a finger-detection reply.
pub const FDT_REPLY_LEN: usize = 28;
