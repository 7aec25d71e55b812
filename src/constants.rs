//! DSMR / P1 Protocol Constants
//!
//! This module defines constants used by the P1 telegram reader, based on the
//! DSMR P1 Companion Standard (2.2 up to 5.0.2) and the Luxembourg/Belgian
//! e-MUCS "Smarty" extension.

use std::time::Duration;

/// Telegram start character
pub const TELEGRAM_START: u8 = b'/';

/// Telegram end character, followed by the CRC16 digits
pub const TELEGRAM_END: u8 = b'!';

/// Opening bracket of a COSEM value group
pub const VALUE_START: u8 = b'(';

/// Closing bracket of a COSEM value group
pub const VALUE_END: u8 = b')';

/// Number of hex digits of the CRC16 after the end character
pub const CRC_DIGITS: usize = 4;

/// Upper bound for a single telegram; anything larger is treated as garbage.
pub const MAX_TELEGRAM_SIZE: usize = 10 * 1024;

/// Header prefixes of meters known to send a checksum that never matches.
pub const DEFAULT_CRC_EXEMPT_HEADERS: &[&str] = &["/KMP5"];

// ----------------------------------------------------------------------------
// Smarty frame layout
// ----------------------------------------------------------------------------

/// First byte of an encrypted Smarty frame
pub const SMARTY_START_BYTE: u8 = 0xDB;

/// Separator in front of the two byte payload length
pub const SMARTY_LENGTH_SEPARATOR: u8 = 0x82;

/// Security control byte (authenticated and encrypted)
pub const SMARTY_SECURITY_CONTROL: u8 = 0x30;

/// Length of the system title
pub const SMARTY_SYSTEM_TITLE_LENGTH: usize = 8;

/// Length of the frame counter
pub const SMARTY_FRAME_COUNTER_LENGTH: usize = 4;

/// Length of the GCM authentication tag
pub const SMARTY_GCM_TAG_LENGTH: usize = 12;

/// Length of an AES-128 key
pub const SMARTY_KEY_LENGTH: usize = 16;

/// Bytes counted by the payload length that are not ciphertext:
/// security control byte, frame counter and GCM tag.
pub const SMARTY_PAYLOAD_OVERHEAD: usize =
    1 + SMARTY_FRAME_COUNTER_LENGTH + SMARTY_GCM_TAG_LENGTH;

/// Default additional authentication key used by all Smarty meters
pub const SMARTY_DEFAULT_ADDITIONAL_KEY: &str = "00112233445566778899AABBCCDDEEFF";

/// Consecutive authentication failures, without any frame ever decrypting,
/// after which the decryption key is reported as invalid
pub const SMARTY_AUTH_FAILURES_BEFORE_FATAL: u32 = 3;

// ----------------------------------------------------------------------------
// Timing
// ----------------------------------------------------------------------------

/// Default time without telegram before the connection is restarted
pub const DEFAULT_RECEIVED_TIMEOUT: Duration = Duration::from_secs(120);

/// Multiple of the received timeout after which the device is reported offline
pub const OFFLINE_FACTOR: u32 = 10;

/// Lower bound for the watchdog tick
pub const MIN_WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

/// Interval at which the reader task reports idle links to the connector
pub const READER_IDLE_TICK: Duration = Duration::from_secs(1);

/// Time a serial setting gets to produce a telegram during autodetection;
/// DSMR 2.2 to 4 meters send one every 10 seconds.
pub const AUTODETECT_WINDOW: Duration = Duration::from_secs(15);

/// Timeout for establishing a TCP connection to a P1 gateway
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Decode errors tolerated on one serial setting before switching
pub const AUTODETECT_MAX_DECODE_ERRORS: u32 = 3;

/// Capacity of the reader -> dispatcher queue
pub const EVENT_QUEUE_CAPACITY: usize = 16;

/// Size of the read buffer of the reader task
pub const READ_BUFFER_SIZE: usize = 1024;

// ----------------------------------------------------------------------------
// M-Bus device types (EN 13757-3) found in 0-n:24.1.0
// ----------------------------------------------------------------------------

pub const MBUS_DEVICE_TYPE_ELECTRICITY: i64 = 0x02;
pub const MBUS_DEVICE_TYPE_GAS: i64 = 0x03;
pub const MBUS_DEVICE_TYPE_HEAT: i64 = 0x04;
pub const MBUS_DEVICE_TYPE_WARM_WATER: i64 = 0x06;
pub const MBUS_DEVICE_TYPE_WATER: i64 = 0x07;
pub const MBUS_DEVICE_TYPE_COOLING_OUTLET: i64 = 0x0A;
pub const MBUS_DEVICE_TYPE_COOLING_INLET: i64 = 0x0B;
pub const MBUS_DEVICE_TYPE_HEAT_COOLING: i64 = 0x0D;

/// Highest M-Bus channel index in a telegram
pub const MAX_MBUS_CHANNEL: u8 = 4;
