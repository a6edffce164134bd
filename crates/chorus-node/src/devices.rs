//! Simulated device inventory.
//!
//! A peer fronts a handful of devices. Each device kind reports a fixed set of
//! metrics, and a query for a metric counts the devices that report it. The
//! inventory travels as a device string: one decimal digit per kind, in
//! catalog order.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chorus_protocols::MetricSource;
use parking_lot::RwLock;
use rand::Rng;

use crate::error::{NodeError, Result};

/// Device count drawn when none is configured.
pub const RANDOM_DEVICE_RANGE: RangeInclusive<usize> = 3..=30;

/// Most devices of one kind a device string can carry.
pub const MAX_PER_KIND: u8 = 9;

/// Every device kind, in device-string order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    AirPollutionMonitor,
    AirVent,
    Clock,
    DoorLock,
    DoorSensor,
    Dryer,
    LightSwitch,
    Microwave,
    Outlet,
    PowerMeter,
    Refrigerator,
    StreetLight,
    Thermometer,
    Thermostat,
    Tv,
    WashMachine,
    Watch,
    WaterLeakSensor,
    WindowSensor,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 19] = [
        DeviceKind::AirPollutionMonitor,
        DeviceKind::AirVent,
        DeviceKind::Clock,
        DeviceKind::DoorLock,
        DeviceKind::DoorSensor,
        DeviceKind::Dryer,
        DeviceKind::LightSwitch,
        DeviceKind::Microwave,
        DeviceKind::Outlet,
        DeviceKind::PowerMeter,
        DeviceKind::Refrigerator,
        DeviceKind::StreetLight,
        DeviceKind::Thermometer,
        DeviceKind::Thermostat,
        DeviceKind::Tv,
        DeviceKind::WashMachine,
        DeviceKind::Watch,
        DeviceKind::WaterLeakSensor,
        DeviceKind::WindowSensor,
    ];

    /// Metrics a device of this kind reports.
    pub fn metrics(self) -> &'static [&'static str] {
        match self {
            DeviceKind::AirPollutionMonitor => &["POWER_CONSUMPTION", "POWER_STATE", "AIR_QUALITY"],
            DeviceKind::AirVent => &[
                "POWER_CONSUMPTION",
                "POWER_STATE",
                "AIR_QUALITY",
                "TEMPERATURE",
                "THROTTLE_STATE",
            ],
            DeviceKind::Clock => &[
                "POWER_CONSUMPTION",
                "POWER_STATE",
                "BATTERY_PERCENTAGE",
                "CURRENT_TIME",
                "TIME_SINCE_LAST_SYNC",
            ],
            DeviceKind::DoorLock => &["POWER_CONSUMPTION", "POWER_STATE", "LOCK_STATE"],
            DeviceKind::DoorSensor => &[
                "POWER_CONSUMPTION",
                "POWER_STATE",
                "INSIDE_TEMPERATURE",
                "TEMPERATURE",
                "OPEN_STATE",
            ],
            DeviceKind::Dryer => &["POWER_CONSUMPTION", "POWER_STATE", "CURRENT_CYCLE_STEP"],
            DeviceKind::LightSwitch => &["POWER_CONSUMPTION", "LIGHT_STATUS"],
            DeviceKind::Microwave => &["POWER_CONSUMPTION", "POWER_STATE"],
            DeviceKind::Outlet => &["POWER_CONSUMPTION", "POWER_STATE", "TEMPERATURE"],
            DeviceKind::PowerMeter => &["POWER_CONSUMPTION", "HOUSE_POWER_STATUS"],
            DeviceKind::Refrigerator => &[
                "POWER_CONSUMPTION",
                "POWER_STATE",
                "TEMPERATURE",
                "FRIDGE_TEMPERATURE",
                "FREEZER_TEMPERATURE",
                "ICE_LEVEL",
            ],
            DeviceKind::StreetLight => &["POWER_CONSUMPTION", "LIGHT_STATUS"],
            DeviceKind::Thermometer => &[
                "POWER_CONSUMPTION",
                "POWER_STATE",
                "RECORD_HIGH",
                "TEMPERATURE",
                "RECORD_LOW",
            ],
            DeviceKind::Thermostat => &[
                "POWER_CONSUMPTION",
                "POWER_STATE",
                "SET_TEMPERATURE",
                "TEMPERATURE",
                "TIME_TO_NEXT_TEMPERATURE_CHANGE",
            ],
            DeviceKind::Tv => &[
                "POWER_CONSUMPTION",
                "POWER_STATE",
                "CPU_USAGE",
                "MEMORY_USAGE",
                "NETFLIX",
                "AMAZON_PRIME",
            ],
            DeviceKind::WashMachine => &["POWER_CONSUMPTION", "POWER_STATE", "CURRENT_CYCLE_STEP"],
            DeviceKind::Watch => &[
                "POWER_CONSUMPTION",
                "POWER_STATE",
                "CPU_USAGE",
                "MEMORY_USAGE",
                "BATTERY_PERCENTAGE",
                "HEART_RATE",
            ],
            DeviceKind::WaterLeakSensor => &["POWER_CONSUMPTION", "POWER_STATE", "CURRENT_LEAK"],
            DeviceKind::WindowSensor => &[
                "POWER_CONSUMPTION",
                "INSIDE_TEMPERATURE",
                "TEMPERATURE",
                "OPEN_STATE",
            ],
        }
    }

    pub fn supports(self, metric: &str) -> bool {
        self.metrics().contains(&metric)
    }
}

/// How many devices of each kind a peer fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Inventory {
    counts: [u8; DeviceKind::ALL.len()],
}

impl Inventory {
    /// An inventory with no devices.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A random inventory of 3 to 30 devices.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let total = rng.gen_range(RANDOM_DEVICE_RANGE);
        Self::with_total(total, rng)
    }

    /// `total` devices of random kinds. Totals beyond what a device string
    /// can carry are capped.
    pub fn with_total<R: Rng + ?Sized>(total: usize, rng: &mut R) -> Self {
        let mut inventory = Self::empty();
        let total = total.min(Self::capacity());
        while inventory.device_count() < total {
            let slot = rng.gen_range(0..DeviceKind::ALL.len());
            if inventory.counts[slot] < MAX_PER_KIND {
                inventory.counts[slot] += 1;
            }
        }
        inventory
    }

    /// Most devices an inventory can hold.
    pub fn capacity() -> usize {
        DeviceKind::ALL.len() * usize::from(MAX_PER_KIND)
    }

    pub fn count_of(&self, kind: DeviceKind) -> u8 {
        self.counts[kind as usize]
    }

    /// `(kind, count)` for every kind present.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceKind, u8)> + '_ {
        DeviceKind::ALL
            .iter()
            .zip(self.counts)
            .filter(|(_, n)| *n > 0)
            .map(|(k, n)| (*k, n))
    }

    pub fn device_count(&self) -> usize {
        self.counts.iter().map(|n| usize::from(*n)).sum()
    }

    /// Devices that report `metric`.
    pub fn metric_count(&self, metric: &str) -> usize {
        self.iter()
            .filter(|(kind, _)| kind.supports(metric))
            .map(|(_, n)| usize::from(n))
            .sum()
    }

    /// Distinct metrics reported by at least one device.
    pub fn metric_names(&self) -> BTreeSet<&'static str> {
        self.iter()
            .flat_map(|(kind, _)| kind.metrics().iter().copied())
            .collect()
    }

    /// The device string for this inventory.
    pub fn device_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Inventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for n in self.counts {
            write!(f, "{}", n)?;
        }
        Ok(())
    }
}

impl FromStr for Inventory {
    type Err = NodeError;

    /// Missing trailing kinds count as zero, extra digits are ignored.
    fn from_str(s: &str) -> Result<Self> {
        let mut inventory = Self::empty();
        for (slot, c) in s.trim().chars().enumerate() {
            let n = c
                .to_digit(10)
                .ok_or_else(|| NodeError::InvalidDevices(s.to_string()))?;
            if let Some(count) = inventory.counts.get_mut(slot) {
                *count = n as u8;
            }
        }
        Ok(inventory)
    }
}

/// The inventory a running peer answers queries from. The registry may
/// replace it when it hands out the overlay.
#[derive(Debug, Default)]
pub struct DeviceSet {
    inventory: RwLock<Inventory>,
}

impl DeviceSet {
    pub fn new(inventory: Inventory) -> Self {
        Self {
            inventory: RwLock::new(inventory),
        }
    }

    pub fn inventory(&self) -> Inventory {
        *self.inventory.read()
    }

    pub fn replace(&self, inventory: Inventory) {
        *self.inventory.write() = inventory;
    }
}

impl MetricSource for DeviceSet {
    fn device_count(&self) -> usize {
        self.inventory.read().device_count()
    }

    fn metric_count(&self, metric: &str) -> usize {
        self.inventory.read().metric_count(metric)
    }

    fn metric_names(&self) -> Vec<String> {
        self.inventory
            .read()
            .metric_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}
