//! The telegram module contains everything between raw bytes and decoded
//! meter readings: OBIS identifiers, COSEM objects, the CRC, the streaming
//! P1 parser and the Smarty decryption layer in front of it.

pub mod cosem;
pub mod crc;
pub mod obis;
pub mod parser;
pub mod smarty;

pub use cosem::{CosemObject, CosemObjectType, CosemValue, MeterTimestamp};
pub use obis::ObisId;
pub use parser::{parse_telegram, P1TelegramParser, ParserOptions};
pub use smarty::{SmartyDecrypter, SmartyKeys};

use crate::error::{ErrorStatus, TelegramError};
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// One complete meter reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Telegram {
    /// Identification line without the leading `/`, e.g. `ISK5\2M550T-1012`
    pub header: String,
    /// Objects in the order they appear in the telegram
    pub objects: Vec<CosemObject>,
    /// Checksum sent by the meter; `None` for DSMR 2.2/3.0 telegrams
    pub crc: Option<u16>,
    /// True when the checksum was present and matched
    pub crc_verified: bool,
}

impl Telegram {
    /// Three letter manufacturer code from the identification line.
    pub fn manufacturer(&self) -> &str {
        self.header.get(..3).unwrap_or(&self.header)
    }

    /// First object with the given identifier.
    pub fn get(&self, obis: &ObisId) -> Option<&CosemObject> {
        self.objects.iter().find(|object| object.obis == *obis)
    }

    /// All objects of a type, e.g. `MbusDelivery` on every channel.
    pub fn objects_of_type(
        &self,
        kind: CosemObjectType,
    ) -> impl Iterator<Item = &CosemObject> + '_ {
        self.objects.iter().filter(move |object| object.kind == kind)
    }

    /// First object of a type.
    pub fn first_of_type(&self, kind: CosemObjectType) -> Option<&CosemObject> {
        self.objects_of_type(kind).next()
    }

    /// Objects on an M-Bus channel (0 = main meter).
    pub fn objects_on_channel(&self, channel: u8) -> impl Iterator<Item = &CosemObject> + '_ {
        self.objects
            .iter()
            .filter(move |object| object.channel() == channel)
    }

    /// Objects kept without registry entry (lenient mode).
    pub fn unknown_objects(&self) -> impl Iterator<Item = &CosemObject> + '_ {
        self.objects_of_type(CosemObjectType::Unknown)
    }

    /// P1 protocol version, e.g. `50` for DSMR 5.0.
    pub fn p1_version(&self) -> Option<&str> {
        self.first_of_type(CosemObjectType::P1Version)
            .or_else(|| self.first_of_type(CosemObjectType::P1VersionBelgium))
            .and_then(CosemObject::text)
    }

    /// Time the meter produced the telegram.
    pub fn timestamp(&self) -> Option<&MeterTimestamp> {
        self.first_of_type(CosemObjectType::P1Timestamp)
            .and_then(CosemObject::timestamp)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Outcome of feeding bytes into a decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    /// A complete, verified telegram.
    Telegram(Telegram),
    /// A telegram was dropped; the decoder has resynchronized.
    Rejected(TelegramError),
    /// Decoding cannot continue (e.g. wrong decryption key).
    Failed(ErrorStatus),
}

/// Turns a byte stream into telegrams.
///
/// Implementations keep partial frames between calls and resynchronize on
/// their own; `reset` drops any buffered state.
pub trait TelegramDecoder: Send {
    fn feed(&mut self, data: &[u8]) -> Vec<DecodeEvent>;
    fn reset(&mut self);
}

/// Selects and configures the decoder for a connection.
#[derive(Debug, Clone, Default)]
pub struct DecoderOptions {
    pub parser: ParserOptions,
    /// Present for Smarty meters; frames are decrypted before parsing.
    pub smarty: Option<SmartyKeys>,
    /// Set once a Smarty frame authenticated. Clones share it, so decoders
    /// rebuilt on reconnect keep treating failures as corrupt frames.
    pub key_confirmed: Arc<AtomicBool>,
}

impl DecoderOptions {
    pub fn build(&self) -> Box<dyn TelegramDecoder> {
        let parser = P1TelegramParser::new(self.parser.clone());
        match &self.smarty {
            Some(keys) => Box::new(SmartyDecrypter::with_key_state(
                keys.clone(),
                parser,
                Arc::clone(&self.key_confirmed),
            )),
            None => Box::new(parser),
        }
    }
}
