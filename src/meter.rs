//! # Meter Detection
//!
//! A telegram carries the readings of the electricity meter and of up to four
//! M-Bus sub-meters (gas, water, heat...). Detection groups the objects per
//! meter; objects that no meter claims are reported separately so that
//! unsupported content is visible in the log.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::{
    MBUS_DEVICE_TYPE_COOLING_INLET, MBUS_DEVICE_TYPE_COOLING_OUTLET, MBUS_DEVICE_TYPE_ELECTRICITY,
    MBUS_DEVICE_TYPE_GAS, MBUS_DEVICE_TYPE_HEAT, MBUS_DEVICE_TYPE_HEAT_COOLING,
    MBUS_DEVICE_TYPE_WARM_WATER, MBUS_DEVICE_TYPE_WATER,
};
use crate::error::ErrorStatus;
use crate::telegram::{CosemObject, CosemObjectType, ObisId, Telegram};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MeterKind {
    /// Main electricity meter
    Electricity,
    Gas,
    Heat,
    Cooling,
    Water,
    WarmWater,
    /// Electricity meter attached as M-Bus slave
    SlaveElectricity,
}

impl MeterKind {
    /// Sub-meter kind for an M-Bus device type (EN 13757-3).
    pub fn from_mbus_device_type(device_type: i64) -> Option<Self> {
        match device_type {
            MBUS_DEVICE_TYPE_ELECTRICITY => Some(MeterKind::SlaveElectricity),
            MBUS_DEVICE_TYPE_GAS => Some(MeterKind::Gas),
            MBUS_DEVICE_TYPE_HEAT | MBUS_DEVICE_TYPE_HEAT_COOLING => Some(MeterKind::Heat),
            MBUS_DEVICE_TYPE_COOLING_OUTLET | MBUS_DEVICE_TYPE_COOLING_INLET => {
                Some(MeterKind::Cooling)
            }
            MBUS_DEVICE_TYPE_WATER => Some(MeterKind::Water),
            MBUS_DEVICE_TYPE_WARM_WATER => Some(MeterKind::WarmWater),
            _ => None,
        }
    }
}

impl fmt::Display for MeterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MeterKind::Electricity => "electricity",
            MeterKind::Gas => "gas",
            MeterKind::Heat => "heat",
            MeterKind::Cooling => "cooling",
            MeterKind::Water => "water",
            MeterKind::WarmWater => "warm water",
            MeterKind::SlaveElectricity => "slave electricity",
        };
        f.write_str(name)
    }
}

/// A meter found in a telegram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedMeter {
    pub kind: MeterKind,
    /// M-Bus channel, 0 for the main meter
    pub channel: u8,
    /// P1 version for the main meter, e.g. `50`
    pub version: Option<String>,
    pub equipment_id: Option<String>,
    /// Identifiers of the objects belonging to this meter
    pub objects: Vec<ObisId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeterDetection {
    pub meters: Vec<DetectedMeter>,
    /// Objects not claimed by any detected meter
    pub unclaimed: Vec<ObisId>,
}

impl MeterDetection {
    pub fn is_supported(&self) -> bool {
        !self.meters.is_empty()
    }

    /// [`ErrorStatus::UnsupportedMeter`] if nothing was detected.
    pub fn check(&self) -> Result<(), ErrorStatus> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(ErrorStatus::UnsupportedMeter)
        }
    }

    pub fn meter(&self, kind: MeterKind) -> Option<&DetectedMeter> {
        self.meters.iter().find(|meter| meter.kind == kind)
    }
}

/// Groups the objects of a telegram into meters.
pub fn detect_meters(telegram: &Telegram) -> MeterDetection {
    let mut detection = MeterDetection::default();
    let mut channels: BTreeMap<u8, Vec<&CosemObject>> = BTreeMap::new();
    for object in &telegram.objects {
        channels.entry(object.channel()).or_default().push(object);
    }

    for (channel, objects) in channels {
        let (known, unknown): (Vec<&CosemObject>, Vec<&CosemObject>) = objects
            .into_iter()
            .partition(|object| object.kind != CosemObjectType::Unknown);
        detection
            .unclaimed
            .extend(unknown.iter().map(|object| object.obis));

        let meter = if channel == 0 {
            main_meter(telegram, &known)
        } else {
            sub_meter(channel, &known)
        };
        match meter {
            Some(meter) => detection.meters.push(meter),
            None => {
                if !known.is_empty() {
                    log::debug!("No supported meter on channel {channel}");
                }
                detection
                    .unclaimed
                    .extend(known.iter().map(|object| object.obis));
            }
        }
    }

    if !detection.unclaimed.is_empty() {
        log::debug!(
            "Objects without meter: {}",
            detection
                .unclaimed
                .iter()
                .map(ObisId::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    detection
}

/// The electricity meter needs at least one measurement besides the
/// identification objects.
fn main_meter(telegram: &Telegram, objects: &[&CosemObject]) -> Option<DetectedMeter> {
    let has_measurement = objects.iter().any(|object| {
        !matches!(
            object.kind,
            CosemObjectType::P1Version
                | CosemObjectType::P1VersionBelgium
                | CosemObjectType::P1Timestamp
                | CosemObjectType::EquipmentIdentifier
                | CosemObjectType::LogicalDeviceName
        )
    });
    if !has_measurement {
        return None;
    }
    Some(DetectedMeter {
        kind: MeterKind::Electricity,
        channel: 0,
        version: telegram.p1_version().map(str::to_string),
        equipment_id: objects
            .iter()
            .find(|object| {
                matches!(
                    object.kind,
                    CosemObjectType::EquipmentIdentifier | CosemObjectType::LogicalDeviceName
                )
            })
            .and_then(|object| object.text())
            .map(str::to_string),
        objects: objects.iter().map(|object| object.obis).collect(),
    })
}

fn sub_meter(channel: u8, objects: &[&CosemObject]) -> Option<DetectedMeter> {
    let find = |kind: CosemObjectType| objects.iter().find(|object| object.kind == kind);

    let kind = match find(CosemObjectType::MbusDeviceType).and_then(|object| object.integer()) {
        Some(device_type) => {
            let kind = MeterKind::from_mbus_device_type(device_type);
            if kind.is_none() {
                log::debug!("Unsupported M-Bus device type {device_type} on channel {channel}");
            }
            kind?
        }
        // DSMR 2.2/3.0 telegrams only have the legacy gas reading
        None if find(CosemObjectType::MbusLegacyDelivery).is_some() => MeterKind::Gas,
        None => return None,
    };

    Some(DetectedMeter {
        kind,
        channel,
        version: None,
        equipment_id: find(CosemObjectType::MbusEquipmentIdentifier)
            .and_then(|object| object.text())
            .map(str::to_string),
        objects: objects.iter().map(|object| object.obis).collect(),
    })
}
