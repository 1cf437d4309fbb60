//! Serial DFU wire constants.

use std::time::Duration;

// ============================================================================
// Framing
// ============================================================================

/// Start of every frame. Never escaped; only ever sent at frame start.
pub const FRAME_START: u8 = 0xAA;

/// Escape prefix inside frame bodies.
pub const ESCAPE: u8 = 0xAB;

/// Follows [`ESCAPE`] to encode a literal 0xAA.
pub const ESCAPED_START: u8 = 0xAC;

/// Follows [`ESCAPE`] to encode a literal 0xAB.
pub const ESCAPED_ESCAPE: u8 = 0xAB;

/// Largest request payload; the length byte must stay within a u8.
pub const MAX_PAYLOAD_SIZE: usize = 253;

/// Length byte of a payload-less request.
pub const MIN_FRAME_LENGTH: u8 = 2;

/// Logical size of a response frame: start, length, opcode, echo, status.
pub const RESPONSE_FRAME_SIZE: usize = 5;

/// Length byte carried by every response frame.
pub const RESPONSE_LENGTH: u8 = 4;

// ============================================================================
// Link activation
// ============================================================================

/// Sent to wake the bootloader; it answers with a free-form ASCII banner.
pub const WAKE_PATTERN: [u8; 4] = [0xCA, 0x9D, 0xC6, 0xA4];

pub const DEFAULT_WAKE_ATTEMPTS: u32 = 8;

/// Banner bytes read per wake attempt.
pub const MAX_BANNER_SIZE: usize = 32;

// ============================================================================
// Transfer
// ============================================================================

pub const DEFAULT_CHUNK_SIZE: usize = 192;

/// Progress is reported every time this many more bytes have been sent.
pub const DEFAULT_PROGRESS_INTERVAL: usize = 2048;

// ============================================================================
// Config packet
// ============================================================================

pub const KEY_SIZE: usize = 16;
pub const MAC_SIZE: usize = 6;

/// Old key, new key, MAC and reserved bytes.
pub const CONFIG_RECORD_SIZE: usize = 48;

/// Header, IV/tag and config record as produced by the signer.
pub const CONFIG_PACKET_SIZE: usize = 92;

// ============================================================================
// Timing
// ============================================================================

pub const DEFAULT_BAUD_RATE: usize = 115_200;
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_BANNER_TIMEOUT: Duration = Duration::from_millis(500);

/// The device resets after activation and is left alone for this long.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Granularity of transport reads while waiting for a deadline.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
