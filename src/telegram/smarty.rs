//! # Smarty (e-MUCS) Frame Decryption
//!
//! Luxembourg and Belgian meters following e-MUCS wrap every P1 telegram in an
//! AES-128-GCM encrypted frame:
//!
//! ```text
//! DB | 08 | system title (8) | 82 | length (2, BE) | 30
//!    | frame counter (4) | ciphertext | tag (12)
//! ```
//!
//! `length` counts the security byte, the frame counter, the ciphertext and
//! the tag. The IV is the system title followed by the frame counter, the
//! additional authenticated data is the security byte followed by the
//! additional key.
//!
//! ```rust
//! use dsmr_rs::telegram::smarty::SmartyKeys;
//!
//! let keys = SmartyKeys::from_hex("000102030405060708090A0B0C0D0E0F", None).unwrap();
//! ```

use aes::Aes128;
use aes_gcm::aead::consts::U12;
use aes_gcm::{AeadInPlace, AesGcm, KeyInit, Nonce, Tag};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{
    MAX_TELEGRAM_SIZE, SMARTY_AUTH_FAILURES_BEFORE_FATAL, SMARTY_DEFAULT_ADDITIONAL_KEY,
    SMARTY_FRAME_COUNTER_LENGTH, SMARTY_GCM_TAG_LENGTH, SMARTY_KEY_LENGTH,
    SMARTY_LENGTH_SEPARATOR, SMARTY_PAYLOAD_OVERHEAD, SMARTY_SECURITY_CONTROL, SMARTY_START_BYTE,
    SMARTY_SYSTEM_TITLE_LENGTH,
};
use crate::error::{ErrorStatus, TelegramError};
use crate::telegram::parser::P1TelegramParser;
use crate::telegram::{DecodeEvent, TelegramDecoder};
use crate::util::{hex, logging::LogThrottle};

/// AES-128-GCM with 12 byte nonce and 12 byte tag
type SmartyCipher = AesGcm<Aes128, U12, U12>;

/// Encryption errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("Decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    #[error("Encryption failed: {reason}")]
    EncryptionFailed { reason: String },
}

/// Decryption key and additional authentication key of a Smarty meter.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SmartyKeys {
    key: [u8; SMARTY_KEY_LENGTH],
    additional_key: [u8; SMARTY_KEY_LENGTH],
}

impl SmartyKeys {
    pub fn new(key: [u8; SMARTY_KEY_LENGTH], additional_key: [u8; SMARTY_KEY_LENGTH]) -> Self {
        Self {
            key,
            additional_key,
        }
    }

    /// Parses 32 hex digit keys; `None` selects the default additional key.
    pub fn from_hex(key: &str, additional_key: Option<&str>) -> Result<Self, CryptoError> {
        let key = parse_key(key)?;
        let additional_key = parse_key(additional_key.unwrap_or(SMARTY_DEFAULT_ADDITIONAL_KEY))?;
        Ok(Self::new(key, additional_key))
    }

    fn aad(&self) -> [u8; SMARTY_KEY_LENGTH + 1] {
        let mut aad = [0u8; SMARTY_KEY_LENGTH + 1];
        aad[0] = SMARTY_SECURITY_CONTROL;
        aad[1..].copy_from_slice(&self.additional_key);
        aad
    }

    fn cipher(&self) -> Result<SmartyCipher, CryptoError> {
        SmartyCipher::new_from_slice(&self.key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: SMARTY_KEY_LENGTH,
            actual: self.key.len(),
        })
    }
}

impl fmt::Debug for SmartyKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartyKeys").finish_non_exhaustive()
    }
}

fn parse_key(hex_str: &str) -> Result<[u8; SMARTY_KEY_LENGTH], CryptoError> {
    let bytes = hex::decode_hex(hex_str).map_err(|e| CryptoError::InvalidKey {
        reason: e.to_string(),
    })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: SMARTY_KEY_LENGTH,
            actual: bytes.len(),
        })
}

fn build_iv(system_title: &[u8], frame_counter: &[u8]) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[..SMARTY_SYSTEM_TITLE_LENGTH].copy_from_slice(system_title);
    iv[SMARTY_SYSTEM_TITLE_LENGTH..].copy_from_slice(frame_counter);
    iv
}

/// Decrypts a frame body in place.
pub fn decrypt_payload(
    keys: &SmartyKeys,
    system_title: &[u8],
    frame_counter: &[u8],
    buffer: &mut [u8],
    tag: &[u8],
) -> Result<(), CryptoError> {
    if system_title.len() != SMARTY_SYSTEM_TITLE_LENGTH
        || frame_counter.len() != SMARTY_FRAME_COUNTER_LENGTH
        || tag.len() != SMARTY_GCM_TAG_LENGTH
    {
        return Err(CryptoError::DecryptionFailed {
            reason: "invalid frame field length".to_string(),
        });
    }
    let iv = build_iv(system_title, frame_counter);
    keys.cipher()?
        .decrypt_in_place_detached(
            Nonce::<U12>::from_slice(&iv),
            &keys.aad(),
            buffer,
            Tag::<U12>::from_slice(tag),
        )
        .map_err(|_| CryptoError::DecryptionFailed {
            reason: "GCM authentication/decryption failed".to_string(),
        })
}

/// Builds an encrypted frame around a plaintext telegram.
pub fn encrypt_telegram(
    keys: &SmartyKeys,
    system_title: &[u8; SMARTY_SYSTEM_TITLE_LENGTH],
    frame_counter: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let payload_length = plaintext.len() + SMARTY_PAYLOAD_OVERHEAD;
    let length_field = u16::try_from(payload_length).map_err(|_| CryptoError::EncryptionFailed {
        reason: format!("telegram too long: {} bytes", plaintext.len()),
    })?;
    let counter = frame_counter.to_be_bytes();
    let iv = build_iv(system_title, &counter);

    let mut ciphertext = plaintext.to_vec();
    let tag = keys
        .cipher()?
        .encrypt_in_place_detached(Nonce::<U12>::from_slice(&iv), &keys.aad(), &mut ciphertext)
        .map_err(|_| CryptoError::EncryptionFailed {
            reason: "GCM encryption failed".to_string(),
        })?;

    let mut frame = Vec::with_capacity(payload_length + 12);
    frame.push(SMARTY_START_BYTE);
    frame.push(SMARTY_SYSTEM_TITLE_LENGTH as u8);
    frame.extend_from_slice(system_title);
    frame.push(SMARTY_LENGTH_SEPARATOR);
    frame.extend_from_slice(&length_field.to_be_bytes());
    frame.push(SMARTY_SECURITY_CONTROL);
    frame.extend_from_slice(&counter);
    frame.extend_from_slice(&ciphertext);
    frame.extend_from_slice(&tag);
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitForStart,
    SystemTitleLength,
    SystemTitle,
    LengthSeparator,
    PayloadLength,
    SecurityControl,
    FrameCounter,
    Payload,
    GcmTag,
}

/// Reassembles encrypted frames from a byte stream and feeds the decrypted
/// telegrams to a [`P1TelegramParser`].
pub struct SmartyDecrypter {
    keys: SmartyKeys,
    parser: P1TelegramParser,
    state: State,
    system_title: Vec<u8>,
    length_bytes: Vec<u8>,
    payload_length: usize,
    frame_counter: Vec<u8>,
    ciphertext: Vec<u8>,
    tag: Vec<u8>,
    /// Set after the first frame that authenticated with the configured key.
    /// Shared between the decrypters of one connection so restarts keep it.
    key_confirmed: Arc<AtomicBool>,
    /// Authentication failures since the last good frame
    auth_failures: u32,
    throttle: LogThrottle,
}

impl SmartyDecrypter {
    pub fn new(keys: SmartyKeys, parser: P1TelegramParser) -> Self {
        Self::with_key_state(keys, parser, Arc::default())
    }

    /// Creates a decrypter that records key confirmation in `key_confirmed`.
    pub fn with_key_state(
        keys: SmartyKeys,
        parser: P1TelegramParser,
        key_confirmed: Arc<AtomicBool>,
    ) -> Self {
        SmartyDecrypter {
            keys,
            parser,
            state: State::WaitForStart,
            system_title: Vec::with_capacity(SMARTY_SYSTEM_TITLE_LENGTH),
            length_bytes: Vec::with_capacity(2),
            payload_length: 0,
            frame_counter: Vec::with_capacity(SMARTY_FRAME_COUNTER_LENGTH),
            ciphertext: Vec::with_capacity(1024),
            tag: Vec::with_capacity(SMARTY_GCM_TAG_LENGTH),
            key_confirmed,
            auth_failures: 0,
            throttle: LogThrottle::new(60_000, 5),
        }
    }

    fn clear(&mut self) {
        self.state = State::WaitForStart;
        self.system_title.clear();
        self.length_bytes.clear();
        self.payload_length = 0;
        self.frame_counter.clear();
        self.ciphertext.clear();
        self.tag.clear();
    }

    /// Drops the current frame and rescans starting at `byte`.
    fn resync(&mut self, byte: u8, reason: String, events: &mut Vec<DecodeEvent>) {
        crate::log_warn_throttled!(self.throttle, "Smarty framing error: {reason}");
        self.clear();
        events.push(DecodeEvent::Rejected(TelegramError::InvalidFrame(reason)));
        if byte == SMARTY_START_BYTE {
            self.state = State::SystemTitleLength;
        }
    }

    fn push_byte(&mut self, byte: u8, events: &mut Vec<DecodeEvent>) {
        match self.state {
            State::WaitForStart => {
                if byte == SMARTY_START_BYTE {
                    self.clear();
                    self.state = State::SystemTitleLength;
                }
            }
            State::SystemTitleLength => {
                if byte as usize == SMARTY_SYSTEM_TITLE_LENGTH {
                    self.state = State::SystemTitle;
                } else {
                    self.resync(byte, format!("unexpected system title length {byte}"), events);
                }
            }
            State::SystemTitle => {
                self.system_title.push(byte);
                if self.system_title.len() == SMARTY_SYSTEM_TITLE_LENGTH {
                    self.state = State::LengthSeparator;
                }
            }
            State::LengthSeparator => {
                if byte == SMARTY_LENGTH_SEPARATOR {
                    self.state = State::PayloadLength;
                } else {
                    self.resync(byte, format!("expected 0x82, got 0x{byte:02X}"), events);
                }
            }
            State::PayloadLength => {
                self.length_bytes.push(byte);
                if self.length_bytes.len() == 2 {
                    let length =
                        u16::from_be_bytes([self.length_bytes[0], self.length_bytes[1]]) as usize;
                    if length <= SMARTY_PAYLOAD_OVERHEAD
                        || length > MAX_TELEGRAM_SIZE + SMARTY_PAYLOAD_OVERHEAD
                    {
                        self.resync(byte, format!("implausible payload length {length}"), events);
                    } else {
                        self.payload_length = length;
                        self.state = State::SecurityControl;
                    }
                }
            }
            State::SecurityControl => {
                if byte == SMARTY_SECURITY_CONTROL {
                    self.state = State::FrameCounter;
                } else {
                    self.resync(byte, format!("unsupported security control 0x{byte:02X}"), events);
                }
            }
            State::FrameCounter => {
                self.frame_counter.push(byte);
                if self.frame_counter.len() == SMARTY_FRAME_COUNTER_LENGTH {
                    self.state = State::Payload;
                }
            }
            State::Payload => {
                self.ciphertext.push(byte);
                if self.ciphertext.len() == self.payload_length - SMARTY_PAYLOAD_OVERHEAD {
                    self.state = State::GcmTag;
                }
            }
            State::GcmTag => {
                self.tag.push(byte);
                if self.tag.len() == SMARTY_GCM_TAG_LENGTH {
                    self.decrypt_frame(events);
                    self.clear();
                }
            }
        }
    }

    fn decrypt_frame(&mut self, events: &mut Vec<DecodeEvent>) {
        let mut buffer = std::mem::take(&mut self.ciphertext);
        let result = decrypt_payload(
            &self.keys,
            &self.system_title,
            &self.frame_counter,
            &mut buffer,
            &self.tag,
        );

        match result {
            Ok(()) => {
                self.key_confirmed.store(true, Ordering::SeqCst);
                self.auth_failures = 0;
                log::trace!(
                    "Decrypted frame {} from {}",
                    hex::encode_hex(&self.frame_counter),
                    hex::encode_hex_upper(&self.system_title)
                );
                let mut decoded = self.parser.feed(&buffer);
                if decoded.is_empty() {
                    // Frame ended directly after the checksum digits
                    decoded = self.parser.feed(b"\r\n");
                }
                if decoded.is_empty() {
                    decoded.push(DecodeEvent::Rejected(TelegramError::Incomplete));
                }
                self.parser.reset();
                events.extend(decoded);
            }
            Err(err) => {
                self.auth_failures = self.auth_failures.saturating_add(1);
                if self.key_confirmed.load(Ordering::SeqCst)
                    || self.auth_failures < SMARTY_AUTH_FAILURES_BEFORE_FATAL
                {
                    crate::log_warn_throttled!(self.throttle, "Dropping corrupt frame: {err}");
                    events.push(DecodeEvent::Rejected(TelegramError::AuthenticationFailed));
                } else {
                    log::error!("Cannot decrypt Smarty frame, check the decryption key: {err}");
                    events.push(DecodeEvent::Failed(ErrorStatus::InvalidDecryptionKey));
                }
            }
        }
        buffer.zeroize();
    }
}

impl TelegramDecoder for SmartyDecrypter {
    fn feed(&mut self, data: &[u8]) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        for &byte in data {
            self.push_byte(byte, &mut events);
        }
        events
    }

    fn reset(&mut self) {
        self.clear();
        self.parser.reset();
    }
}
