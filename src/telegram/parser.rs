//! # P1 Telegram Parser
//!
//! Streaming parser for the line oriented P1 format:
//!
//! ```text
//! /ISK5\2M550T-1012            header
//!                              empty line
//! 1-3:0.2.8(50)                OBIS(value)...
//! 0-0:1.0.0(210510123000S)
//! 1-0:1.8.1(000123.456*kWh)
//! ...
//! !EF2F                        end marker + CRC16
//! ```
//!
//! Bytes can be fed in arbitrary chunks. The parser never needs a restart:
//! anything that is not a well formed telegram is dropped and scanning
//! continues at the next `/`. A `/` inside a telegram, header line included,
//! starts a new one, so a telegram cut off by a line drop cannot swallow the
//! next.

use bytes::BytesMut;
use nom::bytes::complete::take_till;
use nom::character::complete::char;
use nom::multi::many1;
use nom::sequence::delimited;
use nom::IResult;

use crate::constants::{MAX_TELEGRAM_SIZE, TELEGRAM_END, TELEGRAM_START, VALUE_END, VALUE_START};
use crate::error::TelegramError;
use crate::telegram::cosem::CosemObject;
use crate::telegram::crc::{crc16, parse_crc_digits};
use crate::telegram::obis::{parse_obis_id, ObisId};
use crate::telegram::{DecodeEvent, Telegram, TelegramDecoder};
use crate::util::logging::LogThrottle;

/// Maximum length of the identification line
const MAX_HEADER_LENGTH: usize = 128;

/// Options controlling how strict the parser is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserOptions {
    /// Keep unknown objects as raw text and skip malformed ones instead of
    /// rejecting the whole telegram.
    pub lenient: bool,
    /// Header prefixes (including the leading `/`) whose CRC is never checked.
    pub crc_exempt_headers: Vec<String>,
}

impl Default for ParserOptions {
    fn default() -> Self {
        ParserOptions {
            lenient: false,
            crc_exempt_headers: crate::constants::DEFAULT_CRC_EXEMPT_HEADERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ParserOptions {
    pub fn lenient() -> Self {
        ParserOptions {
            lenient: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitForStart,
    Header,
    Data,
    Crc,
}

/// Streaming P1 telegram parser.
#[derive(Debug)]
pub struct P1TelegramParser {
    options: ParserOptions,
    state: State,
    /// Telegram bytes from `/` up to and including `!`
    buffer: BytesMut,
    crc_digits: String,
    line_start: bool,
    throttle: LogThrottle,
}

impl P1TelegramParser {
    pub fn new(options: ParserOptions) -> Self {
        P1TelegramParser {
            options,
            state: State::WaitForStart,
            buffer: BytesMut::with_capacity(2048),
            crc_digits: String::with_capacity(4),
            line_start: false,
            throttle: LogThrottle::new(60_000, 5),
        }
    }

    pub fn options(&self) -> &ParserOptions {
        &self.options
    }

    /// Feeds bytes and hands every finished telegram, or the reason it was
    /// rejected, to `sink`.
    pub fn feed_with<F>(&mut self, data: &[u8], sink: &mut F)
    where
        F: FnMut(Result<Telegram, TelegramError>),
    {
        for &byte in data {
            self.push_byte(byte, sink);
        }
    }

    fn push_byte<F>(&mut self, byte: u8, sink: &mut F)
    where
        F: FnMut(Result<Telegram, TelegramError>),
    {
        match self.state {
            State::WaitForStart => {
                if byte == TELEGRAM_START {
                    self.begin();
                }
            }
            State::Header => {
                if byte == TELEGRAM_START {
                    log::debug!("Telegram start inside header line, restarting");
                    self.begin();
                    return;
                }
                self.buffer.extend_from_slice(&[byte]);
                if byte == b'\n' {
                    self.state = State::Data;
                    self.line_start = true;
                } else if self.buffer.len() > MAX_HEADER_LENGTH {
                    log::debug!("Header line too long, waiting for next telegram");
                    self.reset();
                }
            }
            State::Data => {
                if byte == TELEGRAM_START {
                    crate::log_warn_throttled!(
                        self.throttle,
                        "Telegram start inside telegram, discarding {} buffered bytes",
                        self.buffer.len()
                    );
                    self.begin();
                    return;
                }
                self.buffer.extend_from_slice(&[byte]);
                if self.line_start && byte == TELEGRAM_END {
                    self.state = State::Crc;
                    self.crc_digits.clear();
                } else if self.buffer.len() > MAX_TELEGRAM_SIZE {
                    self.reset();
                    sink(Err(TelegramError::Overflow {
                        limit: MAX_TELEGRAM_SIZE,
                    }));
                    return;
                }
                self.line_start = byte == b'\n';
            }
            State::Crc => {
                if byte.is_ascii_hexdigit() {
                    self.crc_digits.push(byte as char);
                    if self.crc_digits.len() > crate::constants::CRC_DIGITS {
                        let digits = std::mem::take(&mut self.crc_digits);
                        self.reset();
                        sink(Err(TelegramError::InvalidCrc(digits)));
                    }
                } else {
                    let result = self.finish();
                    self.reset();
                    sink(result);
                    if byte == TELEGRAM_START {
                        self.begin();
                    }
                }
            }
        }
    }

    fn begin(&mut self) {
        self.buffer.clear();
        self.buffer.extend_from_slice(&[TELEGRAM_START]);
        self.crc_digits.clear();
        self.line_start = false;
        self.state = State::Header;
    }

    /// Verifies the checksum and decodes the buffered telegram.
    fn finish(&mut self) -> Result<Telegram, TelegramError> {
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        let (header_line, rest) = text.split_once('\n').ok_or(TelegramError::MissingHeader)?;
        let header = header_line.trim_end_matches('\r');
        if header.len() < 2 {
            return Err(TelegramError::MissingHeader);
        }

        let crc = if self.crc_digits.is_empty() {
            // DSMR 2.2 and 3.0 telegrams end with a bare '!'
            None
        } else {
            Some(
                parse_crc_digits(&self.crc_digits)
                    .ok_or_else(|| TelegramError::InvalidCrc(self.crc_digits.clone()))?,
            )
        };

        let mut crc_verified = false;
        if let Some(expected) = crc {
            let calculated = crc16(&self.buffer);
            if expected == calculated {
                crc_verified = true;
            } else if self.is_crc_exempt(header) {
                log::debug!("Ignoring CRC mismatch for exempt meter {header}");
            } else {
                crate::log_warn_throttled!(
                    self.throttle,
                    "CRC mismatch: expected {expected:04X}, calculated {calculated:04X}"
                );
                return Err(TelegramError::CrcMismatch {
                    expected,
                    calculated,
                });
            }
        }

        let body = rest.strip_suffix('!').unwrap_or(rest);
        let objects = parse_body(body, self.options.lenient)?;

        Ok(Telegram {
            header: header[1..].to_string(),
            objects,
            crc,
            crc_verified,
        })
    }

    fn is_crc_exempt(&self, header: &str) -> bool {
        self.options
            .crc_exempt_headers
            .iter()
            .any(|prefix| header.starts_with(prefix.as_str()))
    }
}

impl TelegramDecoder for P1TelegramParser {
    fn feed(&mut self, data: &[u8]) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        self.feed_with(data, &mut |result| {
            events.push(match result {
                Ok(telegram) => DecodeEvent::Telegram(telegram),
                Err(err) => DecodeEvent::Rejected(err),
            })
        });
        events
    }

    fn reset(&mut self) {
        self.state = State::WaitForStart;
        self.buffer.clear();
        self.crc_digits.clear();
        self.line_start = false;
    }
}

/// Bracketed values of one line, e.g. `(101209112500W)(12785.123*m3)`.
fn parse_values(input: &str) -> IResult<&str, Vec<&str>> {
    many1(delimited(
        char(VALUE_START as char),
        take_till(|c| c == VALUE_END as char),
        char(VALUE_END as char),
    ))(input)
}

fn parse_cosem_line(input: &str) -> IResult<&str, (ObisId, Vec<&str>)> {
    let (input, obis) = parse_obis_id(input)?;
    let (input, values) = parse_values(input)?;
    Ok((input, (obis, values)))
}

struct RawObject {
    obis: ObisId,
    values: Vec<String>,
}

fn parse_body(body: &str, lenient: bool) -> Result<Vec<CosemObject>, TelegramError> {
    let mut raw_objects: Vec<RawObject> = Vec::new();

    for line in body.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if line.starts_with(VALUE_START as char) {
            // Continuation of the previous object (DSMR 2/3 gas reading)
            match (parse_values(line), raw_objects.last_mut()) {
                (Ok(("", values)), Some(previous)) => {
                    previous.values.extend(values.into_iter().map(str::to_string));
                    continue;
                }
                _ => {}
            }
        } else if let Ok(("", (obis, values))) = parse_cosem_line(line) {
            raw_objects.push(RawObject {
                obis,
                values: values.into_iter().map(str::to_string).collect(),
            });
            continue;
        }

        if lenient {
            log::debug!("Skipping malformed line {line:?}");
        } else {
            return Err(TelegramError::MalformedLine(line.to_string()));
        }
    }

    let mut objects = Vec::with_capacity(raw_objects.len());
    for raw in raw_objects {
        match CosemObject::decode(raw.obis, &raw.values) {
            Ok(object) => objects.push(object),
            Err(TelegramError::UnknownObject(_)) if lenient => {
                objects.push(CosemObject::unknown(raw.obis, &raw.values));
            }
            Err(err) if lenient => log::debug!("Skipping object: {err}"),
            Err(err) => return Err(err),
        }
    }

    Ok(objects)
}

/// Decodes the first complete telegram found in `data`.
pub fn parse_telegram(data: &[u8], options: &ParserOptions) -> Result<Telegram, TelegramError> {
    let mut parser = P1TelegramParser::new(options.clone());
    let mut first = None;
    parser.feed_with(data, &mut |result| {
        if first.is_none() {
            first = Some(result);
        }
    });
    if first.is_none() && parser.state == State::Crc {
        // Input ended right after the checksum without a line break
        first = Some(parser.finish());
    }
    first.unwrap_or(Err(TelegramError::Incomplete))
}
