//! # dsmr-rs - A Rust Crate for Reading DSMR P1 Smart Meter Ports
//!
//! The dsmr-rs crate reads the P1 port of Dutch, Belgian and Luxembourg smart
//! meters (DSMR 2.2 up to 5.0.2, e-MUCS and Smarty) and decodes the telegrams
//! into typed COSEM objects.
//!
//! ## Features
//!
//! - Serial ports with autodetection of the line settings, or TCP P1 gateways
//! - AES-128-GCM decryption of Smarty frames
//! - Streaming telegram parser with CRC16 verification and resynchronization
//! - Detection of the electricity meter and M-Bus sub-meters (gas, water, heat)
//! - Listener dispatch with distinguishable error categories
//! - Receive watchdog with restart and offline hysteresis
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! dsmr-rs = "0.1.0"
//! ```
//!
//! ```rust
//! use dsmr_rs::{parse_telegram, ParserOptions, CosemObjectType};
//! use dsmr_rs::telegram::crc::seal_telegram;
//!
//! let raw = seal_telegram(
//!     "/ISK5\\2M550T-1012\r\n\r\n1-3:0.2.8(50)\r\n1-0:1.8.1(000123.456*kWh)\r\n",
//! );
//! let telegram = parse_telegram(raw.as_bytes(), &ParserOptions::default()).unwrap();
//! let delivered = telegram.first_of_type(CosemObjectType::EmeterDeliveryTariff1).unwrap();
//! assert_eq!(delivered.float(), Some((123.456, Some("kWh"))));
//! ```

pub mod bridge;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod logging;
pub mod meter;
pub mod telegram;
pub mod util;

pub use crate::error::{DsmrError, ErrorStatus, TelegramError};
pub use crate::logging::{init_logger, log_info};

// Telegram decoding
pub use telegram::{
    parse_telegram, CosemObject, CosemObjectType, CosemValue, DecodeEvent, DecoderOptions,
    MeterTimestamp, ObisId, P1TelegramParser, ParserOptions, SmartyDecrypter, SmartyKeys,
    Telegram, TelegramDecoder,
};

// Devices and listeners
pub use device::{
    Connector, DeviceEvent, DsmrDevice, DsmrEventListener, ListenerRegistry, SerialConnector,
    SerialSettings, TcpConnector,
};

pub use bridge::{BridgeStatus, DsmrBridge};
pub use config::DsmrConfig;
pub use meter::{detect_meters, DetectedMeter, MeterDetection, MeterKind};

/// Decodes every telegram in a captured P1 dump.
///
/// Rejected telegrams are returned as errors in stream order; the parser
/// resynchronizes after each of them.
///
/// # Arguments
/// * `data` - Raw bytes as read from the port (plaintext or Smarty frames)
/// * `options` - Parser and decryption settings
pub fn decode_dump(data: &[u8], options: &DecoderOptions) -> Vec<Result<Telegram, ErrorStatus>> {
    let mut decoder = options.build();
    let mut events = decoder.feed(data);
    // A dump may end right after the checksum digits
    events.extend(decoder.feed(b"\r\n"));
    events
        .into_iter()
        .map(|event| match event {
            DecodeEvent::Telegram(telegram) => Ok(telegram),
            DecodeEvent::Rejected(err) => Err(ErrorStatus::from(&err)),
            DecodeEvent::Failed(status) => Err(status),
        })
        .collect()
}
