//! # COSEM Objects
//!
//! A COSEM object is one `OBIS(value)(value)...` line of a telegram with its
//! values decoded according to the object's registered layout. The registry
//! below covers the objects defined by DSMR 2.2 up to 5.0.2 and the Smarty
//! (e-MUCS) additions.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::constants::MAX_MBUS_CHANNEL;
use crate::error::TelegramError;
use crate::telegram::obis::ObisId;

/// Timestamp as sent by the meter: `YYMMDDhhmmss` plus an optional DST flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MeterTimestamp {
    /// Local wall clock time of the meter
    pub local: NaiveDateTime,
    /// `Some(true)` for summer time (`S`), `Some(false)` for winter time (`W`)
    pub dst: Option<bool>,
}

impl MeterTimestamp {
    /// Parses `YYMMDDhhmmss[S|W]`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (digits, dst) = match raw.as_bytes().last() {
            Some(b'S') => (&raw[..raw.len() - 1], Some(true)),
            Some(b'W') => (&raw[..raw.len() - 1], Some(false)),
            _ => (raw, None),
        };
        if digits.len() != 12 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let local = NaiveDateTime::parse_from_str(&format!("20{digits}"), "%Y%m%d%H%M%S").ok()?;
        Some(Self { local, dst })
    }

    /// UTC offset implied by the DST flag (Central European Time).
    pub fn offset(&self) -> Option<FixedOffset> {
        let hours = match self.dst? {
            true => 2,
            false => 1,
        };
        FixedOffset::east_opt(hours * 3600)
    }

    /// Absolute time, if the meter sent a DST flag.
    pub fn to_datetime(&self) -> Option<DateTime<FixedOffset>> {
        self.offset()?.from_local_datetime(&self.local).single()
    }
}

impl fmt::Display for MeterTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}", self.local),
        }
    }
}

/// A decoded COSEM value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CosemValue {
    Text(String),
    Integer(i64),
    Float { value: f64, unit: Option<String> },
    Timestamp(MeterTimestamp),
}

impl fmt::Display for CosemValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CosemValue::Text(text) => write!(f, "{text}"),
            CosemValue::Integer(value) => write!(f, "{value}"),
            CosemValue::Float { value, unit: Some(unit) } => write!(f, "{value} {unit}"),
            CosemValue::Float { value, unit: None } => write!(f, "{value}"),
            CosemValue::Timestamp(ts) => write!(f, "{ts}"),
        }
    }
}

/// How a single raw value is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Integer,
    /// Decimal number with an optional `*unit`; `Some` pins the unit.
    Float(Option<&'static str>),
    Timestamp,
}

/// Shape of the value list of an object.
#[derive(Debug, Clone, Copy)]
pub enum ValueLayout {
    Fixed(&'static [ValueKind]),
    /// Prefix values followed by zero or more repetitions of a group.
    Repeating {
        prefix: &'static [ValueKind],
        group: &'static [ValueKind],
    },
}

/// Which values of group B an object accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelRule {
    Exact(u8),
    MBus,
}

impl ChannelRule {
    fn matches(self, channel: u8) -> bool {
        match self {
            ChannelRule::Exact(b) => b == channel,
            ChannelRule::MBus => (1..=MAX_MBUS_CHANNEL).contains(&channel),
        }
    }
}

use ValueKind::{Float, Integer, Text, Timestamp};

const KWH: ValueKind = Float(Some("kWh"));
const KW: ValueKind = Float(Some("kW"));
const VOLT: ValueKind = Float(Some("V"));
const AMPERE: ValueKind = Float(Some("A"));

macro_rules! cosem_registry {
    ($(
        $variant:ident => ($a:expr, $b:expr, $c:expr, $d:expr, $e:expr), $layout:expr, $desc:expr;
    )*) => {
        /// Known COSEM object types.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum CosemObjectType {
            $( $variant, )*
            /// Object not in the registry; values kept as raw text.
            Unknown,
        }

        struct Descriptor {
            kind: CosemObjectType,
            a: u8,
            channel: ChannelRule,
            reduced: (u8, u8, u8),
            layout: ValueLayout,
            description: &'static str,
        }

        static DESCRIPTORS: &[Descriptor] = &[
            $( Descriptor {
                kind: CosemObjectType::$variant,
                a: $a,
                channel: $b,
                reduced: ($c, $d, $e),
                layout: $layout,
                description: $desc,
            }, )*
        ];
    };
}

const MAIN: ChannelRule = ChannelRule::Exact(0);
const MBUS: ChannelRule = ChannelRule::MBus;

cosem_registry! {
    P1Version => (1, ChannelRule::Exact(3), 0, 2, 8), ValueLayout::Fixed(&[Text]), "P1 version";
    P1VersionBelgium => (0, MAIN, 96, 1, 4), ValueLayout::Fixed(&[Text]), "e-MUCS version";
    P1Timestamp => (0, MAIN, 1, 0, 0), ValueLayout::Fixed(&[Timestamp]), "Telegram timestamp";
    EquipmentIdentifier => (0, MAIN, 96, 1, 1), ValueLayout::Fixed(&[Text]), "Equipment identifier";
    LogicalDeviceName => (0, MAIN, 42, 0, 0), ValueLayout::Fixed(&[Text]), "Logical device name";
    EmeterDeliveryTariff1 => (1, MAIN, 1, 8, 1), ValueLayout::Fixed(&[KWH]),
        "Energy delivered to client, tariff 1";
    EmeterDeliveryTariff2 => (1, MAIN, 1, 8, 2), ValueLayout::Fixed(&[KWH]),
        "Energy delivered to client, tariff 2";
    EmeterProductionTariff1 => (1, MAIN, 2, 8, 1), ValueLayout::Fixed(&[KWH]),
        "Energy delivered by client, tariff 1";
    EmeterProductionTariff2 => (1, MAIN, 2, 8, 2), ValueLayout::Fixed(&[KWH]),
        "Energy delivered by client, tariff 2";
    EmeterDeliveryTotal => (1, MAIN, 1, 8, 0), ValueLayout::Fixed(&[KWH]),
        "Energy delivered to client, total";
    EmeterProductionTotal => (1, MAIN, 2, 8, 0), ValueLayout::Fixed(&[KWH]),
        "Energy delivered by client, total";
    EmeterTariffIndicator => (0, MAIN, 96, 14, 0), ValueLayout::Fixed(&[Text]), "Tariff indicator";
    EmeterActualDelivery => (1, MAIN, 1, 7, 0), ValueLayout::Fixed(&[KW]), "Actual power delivered";
    EmeterActualProduction => (1, MAIN, 2, 7, 0), ValueLayout::Fixed(&[KW]),
        "Actual power received";
    EmeterThreshold => (0, MAIN, 17, 0, 0), ValueLayout::Fixed(&[Float(None)]), "Actual threshold";
    EmeterSwitchPosition => (0, MAIN, 96, 3, 10), ValueLayout::Fixed(&[Integer]), "Breaker state";
    EmeterPowerFailures => (0, MAIN, 96, 7, 21), ValueLayout::Fixed(&[Integer]),
        "Number of power failures";
    EmeterLongPowerFailures => (0, MAIN, 96, 7, 9), ValueLayout::Fixed(&[Integer]),
        "Number of long power failures";
    EmeterPowerFailureLog => (1, MAIN, 99, 97, 0),
        ValueLayout::Repeating { prefix: &[Integer, Text], group: &[Timestamp, Float(Some("s"))] },
        "Power failure event log";
    EmeterVoltageSagsL1 => (1, MAIN, 32, 32, 0), ValueLayout::Fixed(&[Integer]), "Voltage sags L1";
    EmeterVoltageSagsL2 => (1, MAIN, 52, 32, 0), ValueLayout::Fixed(&[Integer]), "Voltage sags L2";
    EmeterVoltageSagsL3 => (1, MAIN, 72, 32, 0), ValueLayout::Fixed(&[Integer]), "Voltage sags L3";
    EmeterVoltageSwellsL1 => (1, MAIN, 32, 36, 0), ValueLayout::Fixed(&[Integer]),
        "Voltage swells L1";
    EmeterVoltageSwellsL2 => (1, MAIN, 52, 36, 0), ValueLayout::Fixed(&[Integer]),
        "Voltage swells L2";
    EmeterVoltageSwellsL3 => (1, MAIN, 72, 36, 0), ValueLayout::Fixed(&[Integer]),
        "Voltage swells L3";
    EmeterTextCode => (0, MAIN, 96, 13, 1), ValueLayout::Fixed(&[Text]), "Numeric message";
    EmeterText => (0, MAIN, 96, 13, 0), ValueLayout::Fixed(&[Text]), "Text message";
    EmeterVoltageL1 => (1, MAIN, 32, 7, 0), ValueLayout::Fixed(&[VOLT]), "Instantaneous voltage L1";
    EmeterVoltageL2 => (1, MAIN, 52, 7, 0), ValueLayout::Fixed(&[VOLT]), "Instantaneous voltage L2";
    EmeterVoltageL3 => (1, MAIN, 72, 7, 0), ValueLayout::Fixed(&[VOLT]), "Instantaneous voltage L3";
    EmeterCurrentL1 => (1, MAIN, 31, 7, 0), ValueLayout::Fixed(&[AMPERE]),
        "Instantaneous current L1";
    EmeterCurrentL2 => (1, MAIN, 51, 7, 0), ValueLayout::Fixed(&[AMPERE]),
        "Instantaneous current L2";
    EmeterCurrentL3 => (1, MAIN, 71, 7, 0), ValueLayout::Fixed(&[AMPERE]),
        "Instantaneous current L3";
    EmeterActivePowerDeliveryL1 => (1, MAIN, 21, 7, 0), ValueLayout::Fixed(&[KW]),
        "Active power delivered L1";
    EmeterActivePowerDeliveryL2 => (1, MAIN, 41, 7, 0), ValueLayout::Fixed(&[KW]),
        "Active power delivered L2";
    EmeterActivePowerDeliveryL3 => (1, MAIN, 61, 7, 0), ValueLayout::Fixed(&[KW]),
        "Active power delivered L3";
    EmeterActivePowerProductionL1 => (1, MAIN, 22, 7, 0), ValueLayout::Fixed(&[KW]),
        "Active power received L1";
    EmeterActivePowerProductionL2 => (1, MAIN, 42, 7, 0), ValueLayout::Fixed(&[KW]),
        "Active power received L2";
    EmeterActivePowerProductionL3 => (1, MAIN, 62, 7, 0), ValueLayout::Fixed(&[KW]),
        "Active power received L3";
    EmeterFuseThreshold => (1, MAIN, 31, 4, 0), ValueLayout::Fixed(&[AMPERE]), "Current limitation";
    EmeterAverageDemand => (1, MAIN, 1, 4, 0), ValueLayout::Fixed(&[KW]), "Current average demand";
    EmeterMaxDemandMonth => (1, MAIN, 1, 6, 0), ValueLayout::Fixed(&[Timestamp, KW]),
        "Maximum demand of running month";
    EmeterMaxDemandHistory => (0, MAIN, 98, 1, 0),
        ValueLayout::Repeating {
            prefix: &[Integer, Text, Text],
            group: &[Timestamp, Timestamp, KW],
        },
        "Maximum demand of last 13 months";
    MbusDeviceType => (0, MBUS, 24, 1, 0), ValueLayout::Fixed(&[Integer]), "M-Bus device type";
    MbusEquipmentIdentifier => (0, MBUS, 96, 1, 0), ValueLayout::Fixed(&[Text]),
        "M-Bus equipment identifier";
    MbusValvePosition => (0, MBUS, 24, 4, 0), ValueLayout::Fixed(&[Integer]),
        "M-Bus valve position";
    MbusDelivery => (0, MBUS, 24, 2, 1), ValueLayout::Fixed(&[Timestamp, Float(None)]),
        "M-Bus last reading";
    MbusDeliveryBelgium => (0, MBUS, 24, 2, 3), ValueLayout::Fixed(&[Timestamp, Float(None)]),
        "M-Bus last reading (e-MUCS)";
    MbusLegacyDelivery => (0, MBUS, 24, 3, 0),
        ValueLayout::Fixed(&[Timestamp, Integer, Integer, Integer, Text, Text, Float(None)]),
        "M-Bus last hourly reading (DSMR 2/3)";
}

static REGISTRY: Lazy<HashMap<(u8, u8, u8, u8), Vec<&'static Descriptor>>> = Lazy::new(|| {
    let mut map: HashMap<_, Vec<_>> = HashMap::new();
    for descriptor in DESCRIPTORS {
        let (c, d, e) = descriptor.reduced;
        map.entry((descriptor.a, c, d, e)).or_default().push(descriptor);
    }
    map
});

fn lookup(obis: &ObisId) -> Option<&'static Descriptor> {
    REGISTRY
        .get(&(obis.a, obis.c, obis.d, obis.e))?
        .iter()
        .copied()
        .find(|descriptor| descriptor.channel.matches(obis.b))
}

fn descriptor_of(kind: CosemObjectType) -> Option<&'static Descriptor> {
    DESCRIPTORS.iter().find(|descriptor| descriptor.kind == kind)
}

impl CosemObjectType {
    /// Registered type for an identifier, `None` if unknown.
    pub fn from_obis(obis: &ObisId) -> Option<Self> {
        lookup(obis).map(|descriptor| descriptor.kind)
    }

    /// Human readable description.
    pub fn description(&self) -> &'static str {
        descriptor_of(*self)
            .map(|descriptor| descriptor.description)
            .unwrap_or("Unknown object")
    }

    /// Value layout, `None` for [`CosemObjectType::Unknown`].
    pub fn layout(&self) -> Option<ValueLayout> {
        descriptor_of(*self).map(|descriptor| descriptor.layout)
    }

    /// True for objects living on an M-Bus channel.
    pub fn is_mbus(&self) -> bool {
        descriptor_of(*self).is_some_and(|descriptor| descriptor.channel == ChannelRule::MBus)
    }
}

/// One decoded line of a telegram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CosemObject {
    pub obis: ObisId,
    pub kind: CosemObjectType,
    pub values: Vec<CosemValue>,
}

impl CosemObject {
    /// Decodes the raw bracket contents of a registered object.
    ///
    /// Returns [`TelegramError::UnknownObject`] for identifiers outside the
    /// registry; the parser decides whether that is acceptable.
    pub fn decode(obis: ObisId, raw_values: &[String]) -> Result<Self, TelegramError> {
        let descriptor =
            lookup(&obis).ok_or_else(|| TelegramError::UnknownObject(obis.to_string()))?;
        let kinds = expand_layout(&descriptor.layout, raw_values.len()).ok_or_else(|| {
            TelegramError::InvalidValue {
                obis: obis.to_string(),
                reason: format!("unexpected number of values: {}", raw_values.len()),
            }
        })?;

        let mut values = raw_values
            .iter()
            .zip(kinds)
            .map(|(raw, kind)| decode_value(raw, kind))
            .collect::<Result<Vec<_>, String>>()
            .map_err(|reason| TelegramError::InvalidValue {
                obis: obis.to_string(),
                reason,
            })?;

        if descriptor.kind == CosemObjectType::MbusLegacyDelivery {
            attach_legacy_unit(&mut values);
        }

        Ok(Self {
            obis,
            kind: descriptor.kind,
            values,
        })
    }

    /// Keeps an unregistered object with its values as raw text.
    pub fn unknown(obis: ObisId, raw_values: &[String]) -> Self {
        Self {
            obis,
            kind: CosemObjectType::Unknown,
            values: raw_values.iter().cloned().map(CosemValue::Text).collect(),
        }
    }

    /// M-Bus channel of the object (0 for the main meter).
    ///
    /// Group B of electricity objects is not a channel (`1-3:0.2.8`).
    pub fn channel(&self) -> u8 {
        match self.kind {
            CosemObjectType::Unknown
                if self.obis.a == 0 && self.obis.channel() <= crate::constants::MAX_MBUS_CHANNEL =>
            {
                self.obis.channel()
            }
            kind if kind.is_mbus() => self.obis.channel(),
            _ => 0,
        }
    }

    /// The measured value: the last value of the object.
    ///
    /// Objects with a capture time (`0-1:24.2.1(ts)(value)`) carry the reading
    /// last, single value objects have only one.
    pub fn value(&self) -> Option<&CosemValue> {
        self.values.last()
    }

    /// Numeric value and unit of the last value, if it is a float.
    pub fn float(&self) -> Option<(f64, Option<&str>)> {
        match self.value()? {
            CosemValue::Float { value, unit } => Some((*value, unit.as_deref())),
            CosemValue::Integer(value) => Some((*value as f64, None)),
            _ => None,
        }
    }

    /// First timestamp among the values.
    pub fn timestamp(&self) -> Option<&MeterTimestamp> {
        self.values.iter().find_map(|value| match value {
            CosemValue::Timestamp(ts) => Some(ts),
            _ => None,
        })
    }

    /// First integer among the values.
    pub fn integer(&self) -> Option<i64> {
        self.values.iter().find_map(|value| match value {
            CosemValue::Integer(v) => Some(*v),
            _ => None,
        })
    }

    /// First text among the values.
    pub fn text(&self) -> Option<&str> {
        self.values.iter().find_map(|value| match value {
            CosemValue::Text(text) => Some(text.as_str()),
            _ => None,
        })
    }
}

impl fmt::Display for CosemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}):", self.obis, self.kind.description())?;
        for value in &self.values {
            write!(f, " {value}")?;
        }
        Ok(())
    }
}

fn expand_layout(layout: &ValueLayout, count: usize) -> Option<Vec<ValueKind>> {
    match layout {
        ValueLayout::Fixed(kinds) => (kinds.len() == count).then(|| kinds.to_vec()),
        ValueLayout::Repeating { prefix, group } => {
            if count < prefix.len() || (count - prefix.len()) % group.len() != 0 {
                return None;
            }
            let repetitions = (count - prefix.len()) / group.len();
            let mut kinds = prefix.to_vec();
            for _ in 0..repetitions {
                kinds.extend_from_slice(group);
            }
            Some(kinds)
        }
    }
}

fn decode_value(raw: &str, kind: ValueKind) -> Result<CosemValue, String> {
    match kind {
        ValueKind::Text => Ok(CosemValue::Text(raw.to_string())),
        ValueKind::Integer => {
            let (number, _) = split_unit(raw);
            number
                .parse::<i64>()
                .map(CosemValue::Integer)
                .map_err(|_| format!("not an integer: {raw:?}"))
        }
        ValueKind::Float(expected_unit) => {
            let (number, unit) = split_unit(raw);
            let value = number
                .parse::<f64>()
                .map_err(|_| format!("not a number: {raw:?}"))?;
            if let (Some(expected), Some(actual)) = (expected_unit, unit) {
                if !expected.eq_ignore_ascii_case(actual) {
                    return Err(format!("expected unit {expected}, got {actual}"));
                }
            }
            Ok(CosemValue::Float {
                value,
                unit: unit.map(str::to_string),
            })
        }
        ValueKind::Timestamp => MeterTimestamp::parse(raw)
            .map(CosemValue::Timestamp)
            .ok_or_else(|| format!("not a timestamp: {raw:?}")),
    }
}

fn split_unit(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once('*') {
        Some((number, unit)) => (number, Some(unit)),
        None => (raw, None),
    }
}

/// DSMR 2/3 gas readings carry the unit as a separate value in front of the
/// reading.
fn attach_legacy_unit(values: &mut [CosemValue]) {
    let unit = match values.get(5) {
        Some(CosemValue::Text(unit)) if !unit.is_empty() => unit.clone(),
        _ => return,
    };
    if let Some(CosemValue::Float { unit: slot @ None, .. }) = values.last_mut() {
        *slot = Some(unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_decode_energy() {
        let obis: ObisId = "1-0:1.8.1".parse().unwrap();
        let object = CosemObject::decode(obis, &raw(&["000123.456*kWh"])).unwrap();
        assert_eq!(object.kind, CosemObjectType::EmeterDeliveryTariff1);
        assert_eq!(object.float(), Some((123.456, Some("kWh"))));
    }

    #[test]
    fn test_decode_mbus_channel() {
        let obis: ObisId = "0-2:24.2.1".parse().unwrap();
        let object =
            CosemObject::decode(obis, &raw(&["101209112500W", "12785.123*m3"])).unwrap();
        assert_eq!(object.kind, CosemObjectType::MbusDelivery);
        assert_eq!(object.channel(), 2);
        assert_eq!(object.float(), Some((12785.123, Some("m3"))));
        let ts = object.timestamp().unwrap();
        assert_eq!(ts.dst, Some(false));
        assert_eq!(ts.to_datetime().unwrap().to_rfc3339(), "2010-12-09T11:25:00+01:00");
    }

    #[test]
    fn test_main_channel_object_on_mbus_channel_is_unknown() {
        let obis: ObisId = "1-1:1.8.1".parse().unwrap();
        assert_eq!(CosemObjectType::from_obis(&obis), None);
        assert!(matches!(
            CosemObject::decode(obis, &raw(&["1.0*kWh"])),
            Err(TelegramError::UnknownObject(_))
        ));
    }

    #[test]
    fn test_power_failure_log() {
        let obis: ObisId = "1-0:99.97.0".parse().unwrap();
        let values = raw(&[
            "2",
            "0-0:96.7.19",
            "101208152415W",
            "0000000240*s",
            "101208151004W",
            "0000000301*s",
        ]);
        let object = CosemObject::decode(obis, &values).unwrap();
        assert_eq!(object.values.len(), 6);
        assert_eq!(object.integer(), Some(2));

        let empty = CosemObject::decode(obis, &raw(&["0", "0-0:96.7.19"])).unwrap();
        assert_eq!(empty.values.len(), 2);

        assert!(CosemObject::decode(obis, &raw(&["1", "0-0:96.7.19", "101208152415W"])).is_err());
    }

    #[test]
    fn test_unit_mismatch() {
        let obis: ObisId = "1-0:32.7.0".parse().unwrap();
        assert!(CosemObject::decode(obis, &raw(&["230.0*A"])).is_err());
        assert!(CosemObject::decode(obis, &raw(&["230.0*V"])).is_ok());
    }

    #[test]
    fn test_legacy_gas_unit() {
        let obis: ObisId = "0-1:24.3.0".parse().unwrap();
        let values = raw(&["090212160000", "00", "60", "1", "0-1:24.2.1", "m3", "00001.001"]);
        let object = CosemObject::decode(obis, &values).unwrap();
        assert_eq!(object.float(), Some((1.001, Some("m3"))));
        assert_eq!(object.timestamp().unwrap().dst, None);
    }

    #[test]
    fn test_timestamp_parse() {
        assert!(MeterTimestamp::parse("210510123000S").is_some());
        assert!(MeterTimestamp::parse("2105101230S").is_none());
        assert!(MeterTimestamp::parse("211310123000S").is_none());
    }

    #[test]
    fn test_unknown_keeps_raw() {
        let obis: ObisId = "0-0:96.50.68".parse().unwrap();
        let object = CosemObject::unknown(obis, &raw(&["ON"]));
        assert_eq!(object.kind, CosemObjectType::Unknown);
        assert_eq!(object.text(), Some("ON"));
    }
}
