//! The enumerations of the canonical device model, with their wire/persisted
//! string forms. Each enum has exactly one table in each direction; everything
//! else in the crate goes through these.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::errors::*;

macro_rules! fmt_as_str {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str(self.as_str())
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    LinePower,
    Battery,
    Ups,
    Mouse,
    Keyboard,
    Pda,
    Phone,
    Monitor,
    #[default]
    Unknown,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LinePower => "line-power",
            Self::Battery => "battery",
            Self::Ups => "ups",
            Self::Mouse => "mouse",
            Self::Keyboard => "keyboard",
            Self::Pda => "pda",
            Self::Phone => "phone",
            Self::Monitor => "monitor",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "line-power" => Self::LinePower,
            "battery" => Self::Battery,
            "ups" => Self::Ups,
            "mouse" => Self::Mouse,
            "keyboard" => Self::Keyboard,
            "pda" => Self::Pda,
            "phone" => Self::Phone,
            "monitor" => Self::Monitor,
            "unknown" => Self::Unknown,
            other => return Err(Error::new(format!("unknown device type '{other}'"))),
        })
    }
}

impl fmt::Display for DeviceType {
    fmt_as_str!();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    Charging,
    Discharging,
    Empty,
    FullyCharged,
    PendingCharge,
    PendingDischarge,
    #[default]
    Unknown,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Charging => "charging",
            Self::Discharging => "discharging",
            Self::Empty => "empty",
            Self::FullyCharged => "fully-charged",
            Self::PendingCharge => "pending-charge",
            Self::PendingDischarge => "pending-discharge",
            Self::Unknown => "unknown",
        }
    }

    /// Map a kernel `status` attribute value. The match is case-insensitive;
    /// strings the kernel never documented come back as `Unknown`.
    pub fn from_kernel_status(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "charging" => Self::Charging,
            "discharging" => Self::Discharging,
            "full" => Self::FullyCharged,
            "empty" => Self::Empty,
            _ => Self::Unknown,
        }
    }
}

impl FromStr for DeviceState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "charging" => Self::Charging,
            "discharging" => Self::Discharging,
            "empty" => Self::Empty,
            "fully-charged" => Self::FullyCharged,
            "pending-charge" => Self::PendingCharge,
            "pending-discharge" => Self::PendingDischarge,
            "unknown" => Self::Unknown,
            other => return Err(Error::new(format!("unknown device state '{other}'"))),
        })
    }
}

impl fmt::Display for DeviceState {
    fmt_as_str!();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Technology {
    LithiumIon,
    LithiumPolymer,
    LithiumIronPhosphate,
    LeadAcid,
    NickelCadmium,
    NickelMetalHydride,
    #[default]
    Unknown,
}

impl Technology {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LithiumIon => "lithium-ion",
            Self::LithiumPolymer => "lithium-polymer",
            Self::LithiumIronPhosphate => "lithium-iron-phosphate",
            Self::LeadAcid => "lead-acid",
            Self::NickelCadmium => "nickel-cadmium",
            Self::NickelMetalHydride => "nickel-metal-hydride",
            Self::Unknown => "unknown",
        }
    }

    /// Interpret the battery chemistry strings firmware actually emits. The
    /// ACPI spec is bad at defining these, so every case combination of
    /// "Li-Ion" is in the wild.
    pub fn from_acpi(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "li-ion" | "lion" => Self::LithiumIon,
            "pb" | "pbac" => Self::LeadAcid,
            "lip" | "lipo" | "li-poly" => Self::LithiumPolymer,
            "nimh" => Self::NickelMetalHydride,
            "lifo" | "life" => Self::LithiumIronPhosphate,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Technology {
    fmt_as_str!();
}

/// The four per-battery time-series kept by the history store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryType {
    Rate,
    Charge,
    TimeFull,
    TimeEmpty,
}

impl HistoryType {
    pub const ALL: [Self; 4] = [Self::Rate, Self::Charge, Self::TimeFull, Self::TimeEmpty];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rate => "rate",
            Self::Charge => "charge",
            Self::TimeFull => "time-full",
            Self::TimeEmpty => "time-empty",
        }
    }
}

impl FromStr for HistoryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "rate" => Self::Rate,
            "charge" => Self::Charge,
            "time-full" => Self::TimeFull,
            "time-empty" => Self::TimeEmpty,
            other => return Err(Error::new(format!("unknown history type '{other}'"))),
        })
    }
}

impl fmt::Display for HistoryType {
    fmt_as_str!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        for state in [
            DeviceState::Charging,
            DeviceState::Discharging,
            DeviceState::Empty,
            DeviceState::FullyCharged,
            DeviceState::PendingCharge,
            DeviceState::PendingDischarge,
            DeviceState::Unknown,
        ] {
            assert_eq!(state.as_str().parse::<DeviceState>().unwrap(), state);
        }
    }

    #[test]
    fn type_strings_round_trip() {
        for ty in [
            DeviceType::LinePower,
            DeviceType::Battery,
            DeviceType::Ups,
            DeviceType::Mouse,
            DeviceType::Keyboard,
            DeviceType::Pda,
            DeviceType::Phone,
            DeviceType::Monitor,
            DeviceType::Unknown,
        ] {
            assert_eq!(ty.as_str().parse::<DeviceType>().unwrap(), ty);
        }
    }

    #[test]
    fn kernel_status_mapping() {
        assert_eq!(
            DeviceState::from_kernel_status("Charging"),
            DeviceState::Charging
        );
        assert_eq!(
            DeviceState::from_kernel_status("FULL"),
            DeviceState::FullyCharged
        );
        assert_eq!(
            DeviceState::from_kernel_status("Not charging"),
            DeviceState::Unknown
        );
    }

    #[test]
    fn acpi_technology_mapping() {
        assert_eq!(Technology::from_acpi("Li-Ion"), Technology::LithiumIon);
        assert_eq!(Technology::from_acpi("LION"), Technology::LithiumIon);
        assert_eq!(Technology::from_acpi("PbAc"), Technology::LeadAcid);
        assert_eq!(Technology::from_acpi("LiP"), Technology::LithiumPolymer);
        assert_eq!(Technology::from_acpi("li-poly"), Technology::LithiumPolymer);
        assert_eq!(Technology::from_acpi("NiMH"), Technology::NickelMetalHydride);
        assert_eq!(
            Technology::from_acpi("LiFe"),
            Technology::LithiumIronPhosphate
        );
        assert_eq!(Technology::from_acpi("plutonium"), Technology::Unknown);
    }
}
