//! # Configuration
//!
//! [`DsmrConfig`] describes one P1 port. It is usually loaded from a JSON
//! file; every field has a default so a minimal file only names the port:
//!
//! ```json
//! { "serial_port": "/dev/ttyUSB0" }
//! ```
//!
//! ```json
//! {
//!   "host": "192.168.1.20",
//!   "port": 2000,
//!   "decryption_key": "000102030405060708090A0B0C0D0E0F",
//!   "received_timeout_secs": 30
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CRC_EXEMPT_HEADERS, DEFAULT_RECEIVED_TIMEOUT, SMARTY_DEFAULT_ADDITIONAL_KEY,
};
use crate::device::{Connector, SerialConnector, SerialSettings, TcpConnector};
use crate::error::DsmrError;
use crate::telegram::{DecoderOptions, ParserOptions, SmartyKeys};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DsmrConfig {
    /// Serial device, e.g. `/dev/ttyUSB0`
    pub serial_port: Option<String>,
    /// Fixed line settings; autodetected when absent
    pub serial_settings: Option<SerialSettings>,
    /// P1 gateway host for TCP connections
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Smarty decryption key, 32 hex digits
    pub decryption_key: Option<String>,
    /// Smarty additional authentication key, 32 hex digits
    pub additional_key: String,
    /// Seconds without telegram before the connection is restarted
    pub received_timeout_secs: u64,
    /// Keep unknown objects and skip malformed lines
    pub lenient: bool,
    /// Header prefixes whose checksum is not verified
    pub crc_exempt_headers: Vec<String>,
}

impl Default for DsmrConfig {
    fn default() -> Self {
        DsmrConfig {
            serial_port: None,
            serial_settings: None,
            host: None,
            port: None,
            decryption_key: None,
            additional_key: SMARTY_DEFAULT_ADDITIONAL_KEY.to_string(),
            received_timeout_secs: DEFAULT_RECEIVED_TIMEOUT.as_secs(),
            lenient: false,
            crc_exempt_headers: DEFAULT_CRC_EXEMPT_HEADERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl DsmrConfig {
    pub fn serial(port: impl Into<String>) -> Self {
        DsmrConfig {
            serial_port: Some(port.into()),
            ..Default::default()
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        DsmrConfig {
            host: Some(host.into()),
            port: Some(port),
            ..Default::default()
        }
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DsmrError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json(&text)
            .map_err(|e| DsmrError::Config(format!("{}: {e}", path.display())))?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, DsmrError> {
        let config: DsmrConfig =
            serde_json::from_str(text).map_err(|e| DsmrError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that exactly one transport is configured and the keys parse.
    pub fn validate(&self) -> Result<(), DsmrError> {
        match (&self.serial_port, &self.host) {
            (Some(_), Some(_)) => {
                return Err(DsmrError::Config(
                    "configure either serial_port or host, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(DsmrError::Config(
                    "no transport configured, set serial_port or host".to_string(),
                ))
            }
            (Some(port), None) if port.trim().is_empty() => {
                return Err(DsmrError::Config("serial_port is empty".to_string()))
            }
            (None, Some(host)) if host.trim().is_empty() => {
                return Err(DsmrError::Config("host is empty".to_string()))
            }
            (None, Some(_)) if self.port.is_none() => {
                return Err(DsmrError::Config("TCP connection needs a port".to_string()))
            }
            _ => {}
        }
        if self.received_timeout_secs == 0 {
            return Err(DsmrError::Config(
                "received_timeout_secs must be positive".to_string(),
            ));
        }
        self.smarty_keys()?;
        Ok(())
    }

    pub fn received_timeout(&self) -> Duration {
        Duration::from_secs(self.received_timeout_secs)
    }

    pub fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            lenient: self.lenient,
            crc_exempt_headers: self.crc_exempt_headers.clone(),
        }
    }

    /// Keys for Smarty decryption, `None` for unencrypted meters.
    pub fn smarty_keys(&self) -> Result<Option<SmartyKeys>, DsmrError> {
        match self.decryption_key.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(key) => Ok(Some(SmartyKeys::from_hex(
                key,
                Some(self.additional_key.trim()),
            )?)),
        }
    }

    pub fn decoder_options(&self) -> Result<DecoderOptions, DsmrError> {
        Ok(DecoderOptions {
            parser: self.parser_options(),
            smarty: self.smarty_keys()?,
            ..Default::default()
        })
    }

    /// Builds the connector for the configured transport.
    pub fn connector(&self) -> Result<Box<dyn Connector>, DsmrError> {
        self.validate()?;
        match (&self.serial_port, &self.host, self.port) {
            (Some(port), _, _) => Ok(match self.serial_settings {
                Some(settings) => Box::new(SerialConnector::new(port.clone(), settings)),
                None => Box::new(SerialConnector::autodetect(port.clone())),
            }),
            (None, Some(host), Some(port)) => Ok(Box::new(TcpConnector::new(host.clone(), port))),
            _ => Err(DsmrError::Config("no transport configured".to_string())),
        }
    }
}
