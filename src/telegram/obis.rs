//! # OBIS Identifiers
//!
//! OBIS codes name the quantity a COSEM object carries, written
//! `A-B:C.D.E` in P1 telegrams (e.g. `1-0:1.8.1` = electricity delivered to
//! the client, tariff 1). Group B is the channel: 0 for the main meter,
//! 1..4 for M-Bus sub-meters, which is why the same `C.D.E` appears several
//! times in one telegram.

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, digit1};
use nom::combinator::{map_res, opt};
use nom::sequence::{preceded, tuple};
use nom::IResult;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::TelegramError;

/// An OBIS identifier `A-B:C.D.E[*F]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObisId {
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub f: Option<u8>,
}

impl ObisId {
    /// Identifier without the optional F group.
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8) -> Self {
        Self {
            a,
            b,
            c,
            d,
            e,
            f: None,
        }
    }

    /// M-Bus channel (group B).
    pub fn channel(&self) -> u8 {
        self.b
    }

    /// Same identifier with group B replaced, used to match channel templates.
    pub fn with_channel(&self, channel: u8) -> Self {
        Self { b: channel, ..*self }
    }

    /// `C.D.E` part; identical for the same quantity on every channel.
    pub fn reduced(&self) -> (u8, u8, u8) {
        (self.c, self.d, self.e)
    }
}

impl fmt::Display for ObisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}:{}.{}.{}", self.a, self.b, self.c, self.d, self.e)?;
        if let Some(group_f) = self.f {
            write!(f, "*{group_f}")?;
        }
        Ok(())
    }
}

impl FromStr for ObisId {
    type Err = TelegramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_obis_id(s.trim()) {
            Ok(("", id)) => Ok(id),
            _ => Err(TelegramError::MalformedLine(s.to_string())),
        }
    }
}

fn group(input: &str) -> IResult<&str, u8> {
    map_res(digit1, u8::from_str)(input)
}

/// Uses the `nom` crate to parse an OBIS identifier from the start of a line.
pub fn parse_obis_id(input: &str) -> IResult<&str, ObisId> {
    let (input, (a, _, b, _, c, _, d, _, e)) = tuple((
        group,
        char('-'),
        group,
        char(':'),
        group,
        char('.'),
        group,
        char('.'),
        group,
    ))(input)?;
    let (input, f) = opt(preceded(alt((tag("*"), tag("."))), group))(input)?;

    Ok((input, ObisId { a, b, c, d, e, f }))
}
