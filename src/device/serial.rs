//! # P1 Serial Port
//!
//! DSMR 4 and 5 meters send at 115200 baud 8N1, DSMR 2.2 and 3 meters at
//! 9600 baud 7E1. When the settings are not configured the
//! [`SerialAutoDetector`] tries both until one of them yields a telegram.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;

use crate::constants::{AUTODETECT_MAX_DECODE_ERRORS, AUTODETECT_WINDOW};
use crate::device::connector::{BoxedStream, Connector, LinkAction, LinkEvent};
use crate::error::ErrorStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    None,
    Even,
    Odd,
}

impl SerialParity {
    fn letter(self) -> char {
        match self {
            SerialParity::None => 'N',
            SerialParity::Even => 'E',
            SerialParity::Odd => 'O',
        }
    }
}

/// Line settings of a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerialSettings {
    pub baud: u32,
    pub data_bits: u8,
    pub parity: SerialParity,
    pub stop_bits: u8,
}

impl SerialSettings {
    /// DSMR 4.x and 5.x
    pub const HIGH_SPEED: SerialSettings = SerialSettings {
        baud: 115_200,
        data_bits: 8,
        parity: SerialParity::None,
        stop_bits: 1,
    };

    /// DSMR 2.2 and 3.0
    pub const LOW_SPEED: SerialSettings = SerialSettings {
        baud: 9_600,
        data_bits: 7,
        parity: SerialParity::Even,
        stop_bits: 1,
    };

    /// Order in which autodetection tries the settings.
    pub const AUTODETECT_ORDER: [SerialSettings; 2] = [Self::HIGH_SPEED, Self::LOW_SPEED];

    fn tokio_data_bits(&self) -> Result<tokio_serial::DataBits, ErrorStatus> {
        match self.data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            _ => Err(ErrorStatus::PortNotCompatible),
        }
    }

    fn tokio_stop_bits(&self) -> Result<tokio_serial::StopBits, ErrorStatus> {
        match self.stop_bits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            _ => Err(ErrorStatus::PortNotCompatible),
        }
    }

    fn tokio_parity(&self) -> tokio_serial::Parity {
        match self.parity {
            SerialParity::None => tokio_serial::Parity::None,
            SerialParity::Even => tokio_serial::Parity::Even,
            SerialParity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

impl fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud,
            self.data_bits,
            self.parity.letter(),
            self.stop_bits
        )
    }
}

/// Chooses serial settings from what the reader observes.
#[derive(Debug, Clone)]
pub struct SerialAutoDetector {
    candidates: Vec<SerialSettings>,
    index: usize,
    locked: bool,
    decode_errors: u32,
    window: Duration,
    opened_at: Option<Instant>,
}

impl SerialAutoDetector {
    pub fn new(candidates: Vec<SerialSettings>, window: Duration) -> Self {
        let candidates = if candidates.is_empty() {
            SerialSettings::AUTODETECT_ORDER.to_vec()
        } else {
            candidates
        };
        SerialAutoDetector {
            candidates,
            index: 0,
            locked: false,
            decode_errors: 0,
            window,
            opened_at: None,
        }
    }

    pub fn current(&self) -> SerialSettings {
        self.candidates[self.index]
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Starts the detection window for the current settings.
    pub fn port_opened(&mut self, now: Instant) {
        self.opened_at = Some(now);
        self.decode_errors = 0;
    }

    pub fn observe(&mut self, event: LinkEvent, now: Instant) -> LinkAction {
        if self.locked {
            return LinkAction::Continue;
        }
        match event {
            LinkEvent::Telegram => {
                log::info!("Serial settings detected: {}", self.current());
                self.locked = true;
                LinkAction::Continue
            }
            LinkEvent::DecodeError => {
                self.decode_errors += 1;
                if self.decode_errors >= AUTODETECT_MAX_DECODE_ERRORS {
                    log::debug!(
                        "{} decode errors with {}, trying next settings",
                        self.decode_errors,
                        self.current()
                    );
                    self.advance()
                } else {
                    LinkAction::Continue
                }
            }
            LinkEvent::Idle => match self.opened_at {
                Some(opened) if now.saturating_duration_since(opened) >= self.window => {
                    log::debug!("No telegram with {}, trying next settings", self.current());
                    self.advance()
                }
                _ => LinkAction::Continue,
            },
        }
    }

    fn advance(&mut self) -> LinkAction {
        self.decode_errors = 0;
        self.opened_at = None;
        self.index += 1;
        if self.index >= self.candidates.len() {
            self.index = 0;
            log::warn!("Serial settings detection failed, starting over");
            LinkAction::Reopen {
                report: Some(ErrorStatus::PortSettingsDetectionFailed),
            }
        } else {
            LinkAction::Reopen { report: None }
        }
    }
}

/// Maps port open failures to the reported category.
pub fn classify_open_error(err: &tokio_serial::Error) -> ErrorStatus {
    let description = err.description.to_lowercase();
    match err.kind {
        tokio_serial::ErrorKind::NoDevice => {
            if description.contains("busy") || description.contains("in use") {
                ErrorStatus::PortInUse
            } else {
                ErrorStatus::PortDoesNotExist
            }
        }
        tokio_serial::ErrorKind::InvalidInput => ErrorStatus::PortNotCompatible,
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => ErrorStatus::PortDoesNotExist,
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => ErrorStatus::PortInUse,
        _ if description.contains("busy") || description.contains("in use") => {
            ErrorStatus::PortInUse
        }
        _ if description.contains("ioctl") || description.contains("not a tty") => {
            ErrorStatus::PortNotCompatible
        }
        _ => ErrorStatus::PortOpenFailed(err.description.clone()),
    }
}

/// How the connector picks its line settings.
#[derive(Debug, Clone)]
enum SettingsMode {
    Fixed(SerialSettings),
    Auto(SerialAutoDetector),
}

/// Serial P1 port.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port_name: String,
    mode: SettingsMode,
}

impl SerialConnector {
    pub fn new(port_name: impl Into<String>, settings: SerialSettings) -> Self {
        SerialConnector {
            port_name: port_name.into(),
            mode: SettingsMode::Fixed(settings),
        }
    }

    /// Connector that detects the line settings.
    pub fn autodetect(port_name: impl Into<String>) -> Self {
        SerialConnector {
            port_name: port_name.into(),
            mode: SettingsMode::Auto(SerialAutoDetector::new(
                SerialSettings::AUTODETECT_ORDER.to_vec(),
                AUTODETECT_WINDOW,
            )),
        }
    }

    pub fn settings(&self) -> SerialSettings {
        match &self.mode {
            SettingsMode::Fixed(settings) => *settings,
            SettingsMode::Auto(detector) => detector.current(),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&mut self) -> Result<BoxedStream, ErrorStatus> {
        let settings = self.settings();
        if cfg!(unix) && !std::path::Path::new(&self.port_name).exists() {
            return Err(ErrorStatus::PortDoesNotExist);
        }
        let port = tokio_serial::new(&self.port_name, settings.baud)
            .data_bits(settings.tokio_data_bits()?)
            .stop_bits(settings.tokio_stop_bits()?)
            .parity(settings.tokio_parity())
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                log::debug!("Opening {} failed: {e}", self.port_name);
                classify_open_error(&e)
            })?;

        if let SettingsMode::Auto(detector) = &mut self.mode {
            detector.port_opened(Instant::now());
        }
        log::info!("Opened {} with {}", self.port_name, settings);
        Ok(Box::new(port))
    }

    fn name(&self) -> String {
        self.port_name.clone()
    }

    fn observe(&mut self, event: LinkEvent, now: Instant) -> LinkAction {
        match &mut self.mode {
            SettingsMode::Fixed(_) => LinkAction::Continue,
            SettingsMode::Auto(detector) => detector.observe(event, now),
        }
    }
}
