//! Shelly Pro 3EM Modbus register layout.
//!
//! The address space is a static table of definitions. Each definition names
//! where its words come from; nothing is stored per register, every read is
//! rendered from the installed snapshot and the device identity.
//!
//! | Window | Addresses | Contents |
//! |--------|-----------|----------|
//! | Device | 30000-30099 | MAC (3 words), model (10 words), name (16 words) |
//! | EM | 31000-31079 | timestamp, error flags, totals, per phase blocks at 31020/31040/31060 |
//! | EMData | 31160-31229 | timestamp, energy totals, per phase blocks at 31170/31190/31210 |

use crate::device::DeviceIdentity;
use crate::meter_data::{MeterSnapshot, Phase, PhaseReading};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, LazyLock};

pub const DEVICE_INFO_WINDOW: RangeInclusive<u32> = 30000..=30099;
pub const EM_WINDOW: RangeInclusive<u32> = 31000..=31079;
pub const EMDATA_WINDOW: RangeInclusive<u32> = 31160..=31229;

const MODEL_BYTES: usize = 20;
const NAME_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseField {
    Voltage,
    Current,
    ActivePower,
    ApparentPower,
    PowerFactor,
    /// One of the per phase error flags
    Error,
    Frequency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyField {
    Delivered,
    Returned,
}

/// How the words of one register are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterSource {
    MacAddress,
    Model,
    DeviceName,
    Timestamp,
    /// Meter error flag; phase errors are raised while the data is unusable
    MeterError(Option<Phase>),
    /// Flag the emulator never raises
    Unused,
    NeutralCurrent,
    TotalCurrent,
    TotalActivePower,
    TotalApparentPower,
    Phase(Phase, PhaseField),
    TotalEnergy,
    TotalEnergyReturned,
    PhaseEnergy(Phase, EnergyField),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDefinition {
    pub address: u32,
    /// Number of 16 bit words
    pub size: u32,
    pub source: RegisterSource,
}

impl RegisterDefinition {
    fn covers(&self, address: u32) -> bool {
        address >= self.address && address - self.address < self.size
    }
}

static LAYOUT: LazyLock<BTreeMap<u32, RegisterDefinition>> = LazyLock::new(build_layout);

fn build_layout() -> BTreeMap<u32, RegisterDefinition> {
    use RegisterSource as S;

    let mut defs = vec![
        (30000, 3, S::MacAddress),
        (30006, 10, S::Model),
        (30016, 16, S::DeviceName),
        (31000, 2, S::Timestamp),
        (31002, 1, S::MeterError(Some(Phase::A))),
        (31003, 1, S::MeterError(Some(Phase::B))),
        (31004, 1, S::MeterError(Some(Phase::C))),
        (31005, 1, S::MeterError(None)),
        (31006, 1, S::Unused),
        (31007, 2, S::NeutralCurrent),
        (31009, 1, S::Unused),
        (31010, 1, S::Unused),
        (31011, 2, S::TotalCurrent),
        (31013, 2, S::TotalActivePower),
        (31015, 2, S::TotalApparentPower),
        (31160, 2, S::Timestamp),
        (31162, 2, S::TotalEnergy),
        (31164, 2, S::TotalEnergyReturned),
    ];

    for (phase, base) in Phase::ALL.into_iter().zip([31020, 31040, 31060]) {
        defs.extend([
            (base, 2, S::Phase(phase, PhaseField::Voltage)),
            (base + 2, 2, S::Phase(phase, PhaseField::Current)),
            (base + 4, 2, S::Phase(phase, PhaseField::ActivePower)),
            (base + 6, 2, S::Phase(phase, PhaseField::ApparentPower)),
            (base + 8, 2, S::Phase(phase, PhaseField::PowerFactor)),
            (base + 10, 1, S::Phase(phase, PhaseField::Error)),
            (base + 11, 1, S::Phase(phase, PhaseField::Error)),
            (base + 12, 1, S::Phase(phase, PhaseField::Error)),
            (base + 13, 2, S::Phase(phase, PhaseField::Frequency)),
        ]);
    }

    for (phase, base) in Phase::ALL.into_iter().zip([31170, 31190, 31210]) {
        defs.extend([
            (base, 2, S::PhaseEnergy(phase, EnergyField::Delivered)),
            (base + 4, 2, S::PhaseEnergy(phase, EnergyField::Returned)),
            // Perpetual counters mirror the resettable ones
            (base + 12, 2, S::PhaseEnergy(phase, EnergyField::Delivered)),
            (base + 14, 2, S::PhaseEnergy(phase, EnergyField::Returned)),
        ]);
    }

    defs.into_iter()
        .map(|(address, size, source)| {
            (
                address,
                RegisterDefinition {
                    address,
                    size,
                    source,
                },
            )
        })
        .collect()
}

/// The definition whose word range contains `address`, if any.
pub fn definition_at(address: u32) -> Option<&'static RegisterDefinition> {
    LAYOUT
        .range(..=address)
        .next_back()
        .map(|(_, def)| def)
        .filter(|def| def.covers(address))
}

/// Whether a read starting at `address` falls into one of the published windows.
pub fn is_readable_address(address: u32) -> bool {
    DEVICE_INFO_WINDOW.contains(&address)
        || EM_WINDOW.contains(&address)
        || EMDATA_WINDOW.contains(&address)
}

/// Big endian IEEE-754, high word first
pub fn float_to_registers(value: f32) -> [u16; 2] {
    let bytes = value.to_be_bytes();
    [
        u16::from_be_bytes([bytes[0], bytes[1]]),
        u16::from_be_bytes([bytes[2], bytes[3]]),
    ]
}

pub fn registers_to_float(words: [u16; 2]) -> f32 {
    let [hi, lo] = words;
    f32::from_bits((u32::from(hi) << 16) | u32::from(lo))
}

pub fn uint32_to_registers(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, (value & 0xFFFF) as u16]
}

/// UTF-8 text cut or zero padded to `byte_len`, two bytes per word.
pub fn string_to_registers(text: &str, byte_len: usize) -> Vec<u16> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(byte_len, 0);
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
        .collect()
}

/// Renders a [`MeterSnapshot`] into the register layout.
///
/// Clone one per request and install the snapshot taken for that request;
/// the map itself is not shared between readers.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    device: Arc<DeviceIdentity>,
    snapshot: Option<MeterSnapshot>,
}

impl RegisterMap {
    pub fn new(device: Arc<DeviceIdentity>) -> Self {
        Self {
            device,
            snapshot: None,
        }
    }

    pub fn set_snapshot(&mut self, snapshot: MeterSnapshot) {
        self.snapshot = Some(snapshot);
    }

    /// Exactly `count` words starting at `address`. Addresses outside any
    /// definition read as zero.
    pub fn read(&self, address: u32, count: usize) -> Vec<u16> {
        let mut words = vec![0u16; count];
        let (snapshot, failed) = self.view();
        let mut rendered: Option<(u32, Vec<u16>)> = None;

        for (offset, word) in words.iter_mut().enumerate() {
            let Some(position) = u32::try_from(offset)
                .ok()
                .and_then(|o| address.checked_add(o))
            else {
                break;
            };
            let Some(def) = definition_at(position) else {
                continue;
            };
            // Words are visited in order, so each definition renders once
            if rendered.as_ref().map(|(start, _)| *start) != Some(def.address) {
                rendered = Some((def.address, self.render(&snapshot, failed, def.source)));
            }
            if let Some((_, values)) = &rendered {
                *word = values
                    .get((position - def.address) as usize)
                    .copied()
                    .unwrap_or(0);
            }
        }
        words
    }

    /// The values a read renders, and whether the meter error flags are raised.
    /// Unusable data reads as zero with the flags raised; without any snapshot
    /// the defaults are served instead.
    fn view(&self) -> (Cow<'_, MeterSnapshot>, bool) {
        match &self.snapshot {
            Some(snapshot) if snapshot.is_usable() => (Cow::Borrowed(snapshot), false),
            Some(snapshot) => (Cow::Owned(zeroed(snapshot)), true),
            None => (Cow::Owned(MeterSnapshot::default()), false),
        }
    }

    fn render(&self, snapshot: &MeterSnapshot, failed: bool, source: RegisterSource) -> Vec<u16> {
        let float = |value: f64| float_to_registers(value as f32).to_vec();
        let flag = |raised: bool| vec![u16::from(raised)];

        match source {
            RegisterSource::MacAddress => {
                let mac = self.device.mac_bytes();
                mac.chunks(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect()
            }
            RegisterSource::Model => string_to_registers(self.device.model(), MODEL_BYTES),
            RegisterSource::DeviceName => {
                string_to_registers(self.device.device_name(), NAME_BYTES)
            }
            RegisterSource::Timestamp => uint32_to_registers(snapshot.unix_timestamp()).to_vec(),
            RegisterSource::MeterError(Some(_)) => flag(failed),
            RegisterSource::MeterError(None) | RegisterSource::Unused => flag(false),
            RegisterSource::NeutralCurrent => float(0.0),
            RegisterSource::TotalCurrent => float(snapshot.total_current()),
            RegisterSource::TotalActivePower => float(snapshot.total_power()),
            RegisterSource::TotalApparentPower => float(snapshot.total_apparent_power()),
            RegisterSource::Phase(phase, field) => {
                let reading = snapshot.phase(phase);
                match field {
                    PhaseField::Voltage => float(reading.voltage),
                    PhaseField::Current => float(reading.current),
                    PhaseField::ActivePower => float(reading.active_power()),
                    PhaseField::ApparentPower => float(reading.apparent_power),
                    PhaseField::PowerFactor => float(reading.power_factor),
                    PhaseField::Error => flag(failed),
                    PhaseField::Frequency => float(reading.frequency),
                }
            }
            RegisterSource::TotalEnergy => float(snapshot.total_energy),
            RegisterSource::TotalEnergyReturned => float(snapshot.total_energy_returned),
            RegisterSource::PhaseEnergy(phase, EnergyField::Delivered) => {
                float(snapshot.phase(phase).energy_total)
            }
            RegisterSource::PhaseEnergy(phase, EnergyField::Returned) => {
                float(snapshot.phase(phase).energy_returned_total)
            }
        }
    }
}

/// Same capture time, every measurement zero
fn zeroed(snapshot: &MeterSnapshot) -> MeterSnapshot {
    let zero = PhaseReading {
        voltage: 0.0,
        power_factor: 0.0,
        frequency: 0.0,
        ..Default::default()
    };
    MeterSnapshot {
        phase_a: zero.clone(),
        phase_b: zero.clone(),
        phase_c: zero,
        timestamp: snapshot.timestamp,
        ..Default::default()
    }
}
