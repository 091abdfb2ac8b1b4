//! The sysfs `power_supply` variant: laptop batteries and AC adapters.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::{DeviceData, PollTimings, VariantDriver};
use crate::backend::NativeDevice;
use crate::errors::*;
use crate::types::{DeviceState, DeviceType, Technology};
use crate::util::{self, read_prop, read_prop_bool, read_prop_string};

make_log_macro!(debug, "supply");

/// ACPI firmware reports this current when it cannot measure one.
const RATE_UNREPORTED: f64 = 0xffff as f64;
/// Nothing a laptop carries dissipates this much.
const RATE_SANITY_LIMIT: f64 = 100_000.0;

pub(super) async fn probe(
    native: &NativeDevice,
    data: &mut DeviceData,
) -> Option<Box<dyn VariantDriver>> {
    let dir = native.sysfs_dir();
    if !dir.exists() {
        return None;
    }
    // an `online` attribute is what makes a supply an AC adapter; UPS and
    // peripheral batteries never appear in this subsystem
    data.device_type = if dir.join("online").exists() {
        DeviceType::LinePower
    } else {
        DeviceType::Battery
    };
    Some(Box::new(Supply::default()))
}

#[derive(Default)]
pub(super) struct Supply {
    has_coldplug_values: bool,
    /// Charge-reporting hardware speaks ampere-hours; energies are derived
    /// through the design voltage.
    charge_units: bool,
    energy_old: f64,
    energy_old_time: u64,
    unknown_retries: u32,
}

#[async_trait]
impl VariantDriver for Supply {
    async fn refresh(&mut self, data: &mut DeviceData, native: &NativeDevice) -> Result<bool> {
        match data.device_type {
            DeviceType::LinePower => self.refresh_line_power(data, native).await,
            _ => self.refresh_battery(data, native).await,
        }
    }

    fn poll_interval(&mut self, data: &DeviceData, timings: &PollTimings) -> Option<Duration> {
        if data.device_type == DeviceType::LinePower {
            // the kernel always sends change uevents for AC transitions
            return None;
        }
        match data.state {
            DeviceState::FullyCharged => None,
            DeviceState::Unknown if self.unknown_retries < timings.unknown_retries => {
                // poll faster than normal, but not at 0.5 Hz forever
                self.unknown_retries += 1;
                Some(timings.unknown)
            }
            _ => Some(timings.normal),
        }
    }
}

impl Supply {
    async fn refresh_line_power(
        &mut self,
        data: &mut DeviceData,
        native: &NativeDevice,
    ) -> Result<bool> {
        let dir = native.sysfs_dir();
        if !dir.exists() {
            return Ok(false);
        }
        data.power_supply = true;
        data.online = read_prop_bool(dir, "online").await.unwrap_or(false);
        Ok(true)
    }

    async fn refresh_battery(
        &mut self,
        data: &mut DeviceData,
        native: &NativeDevice,
    ) -> Result<bool> {
        let dir = native.sysfs_dir();
        if !dir.exists() {
            // the kernel yanked the handle from under us
            return Ok(false);
        }

        data.is_present = read_prop_bool(dir, "present").await.unwrap_or(false);
        if !data.is_present {
            // still tracked; the slot may get a battery again
            data.reset_battery_values();
            self.has_coldplug_values = false;
            self.energy_old = 0.0;
            self.energy_old_time = 0;
            return Ok(true);
        }

        let mut energy = microunits(dir, "energy_now", "energy_avg").await;
        let voltage_design = design_voltage(dir).await;

        self.charge_units = energy == 0.0;
        if self.charge_units {
            energy = microunits(dir, "charge_now", "charge_avg").await * voltage_design;
        }

        if !self.has_coldplug_values {
            // arriving via the power_supply class means we feed the host
            data.power_supply = true;

            if let Some(technology) = read_prop_string(dir, "technology").await {
                data.technology = Technology::from_acpi(technology.trim());
            }
            data.vendor = read_prop_string(dir, "manufacturer").await.unwrap_or_default();
            data.model = read_prop_string(dir, "model_name").await.unwrap_or_default();
            data.serial = read_prop_string(dir, "serial_number").await.unwrap_or_default();
            // assume true for anything a laptop carries
            data.is_rechargeable = true;

            let mut energy_full;
            let energy_full_design;
            if self.charge_units {
                energy_full = microunits(dir, "charge_full", "").await * voltage_design;
                energy_full_design = microunits(dir, "charge_full_design", "").await * voltage_design;
            } else {
                energy_full = microunits(dir, "energy_full", "").await;
                energy_full_design = microunits(dir, "energy_full_design", "").await;
            }

            // some firmware has no idea what the last full charge was
            if energy_full < 0.01 && energy_full_design > 0.01 {
                log::warn!(
                    "{}: correcting energy_full using energy_full_design",
                    data.native_path
                );
                energy_full = energy_full_design;
            }
            if energy_full_design > 0.0 {
                data.capacity = (100.0 * energy_full / energy_full_design).clamp(0.0, 100.0);
            }
            data.energy_full = energy_full;
            data.energy_full_design = energy_full_design;

            self.has_coldplug_values = true;
        }

        let status = read_prop_string(dir, "status").await.unwrap_or_default();
        let mut state = DeviceState::from_kernel_status(status.trim());
        // if flat and the BIOS does not know what to do, it is just empty
        if state == DeviceState::Unknown && energy < 0.01 {
            debug!("{}: unknown and very low, treating as empty", data.native_path);
            state = DeviceState::Empty;
        }
        if state != DeviceState::Unknown && self.unknown_retries > 0 {
            debug!("resetting unknown timeout after {} retries", self.unknown_retries);
            self.unknown_retries = 0;
        }

        let raw_rate: f64 = read_prop(dir, "current_now").await.unwrap_or(0.0);
        let mut energy_rate = if raw_rate == RATE_UNREPORTED {
            0.0
        } else {
            (raw_rate / 1_000_000.0).abs()
        };
        if self.charge_units {
            energy_rate *= voltage_design;
        }
        if energy_rate > RATE_SANITY_LIMIT {
            energy_rate = 0.0;
        }

        // some batteries don't update their last_full attribute
        if energy > data.energy_full {
            log::warn!(
                "{}: energy {} bigger than full {}",
                data.native_path,
                energy,
                data.energy_full
            );
            data.energy_full = energy;
        }

        let mut voltage = microunits(dir, "voltage_now", "voltage_avg").await;
        if voltage == 0.0 {
            voltage = voltage_design;
        }

        let now = util::now_secs();
        if energy_rate == 0.0 {
            // the hardware reported nothing usable; derive a rate from how
            // fast the charge has been moving
            if let Some(derived) =
                derived_rate(self.energy_old, self.energy_old_time, energy, now)
            {
                energy_rate = derived;
            }
        }

        if data.energy_full > 0.0 {
            data.percentage = (100.0 * energy / data.energy_full).clamp(0.0, 100.0);
        }

        let mut time_to_empty = 0i64;
        let mut time_to_full = 0i64;
        if energy_rate > 0.0 {
            match state {
                DeviceState::Discharging => {
                    time_to_empty = (3600.0 * energy / energy_rate) as i64;
                }
                DeviceState::Charging => {
                    time_to_full = (3600.0 * (data.energy_full - energy) / energy_rate) as i64;
                }
                _ => {}
            }
        }

        self.energy_old = energy;
        self.energy_old_time = now;
        if data.state != state {
            // a state transition invalidates the rate baseline
            self.energy_old = 0.0;
        }

        data.energy = energy;
        data.energy_rate = energy_rate;
        data.voltage = voltage;
        data.state = state;
        data.time_to_empty = time_to_empty;
        data.time_to_full = time_to_full;

        Ok(true)
    }
}

/// Read a µ-unit attribute (µWh, µAh, µV) into its base unit, with an
/// `_avg` fallback for hardware that only averages.
async fn microunits(dir: &Path, attr: &str, fallback: &str) -> f64 {
    let mut value: f64 = read_prop(dir, attr).await.unwrap_or(0.0);
    if value == 0.0 && !fallback.is_empty() {
        value = read_prop(dir, fallback).await.unwrap_or(0.0);
    }
    value / 1_000_000.0
}

/// The voltage used to convert ampere figures to watt figures.
async fn design_voltage(dir: &Path) -> f64 {
    let mut voltage = microunits(dir, "voltage_max_design", "").await;
    if voltage < 1.0 {
        voltage = microunits(dir, "voltage_min_design", "").await;
    }
    if voltage < 1.0 {
        debug!("using present voltage as design voltage");
        voltage = microunits(dir, "voltage_present", "").await;
    }
    voltage
}

/// Watts implied by the energy drop since the previous refresh, if the drop
/// is big enough to be signal rather than noise.
fn derived_rate(energy_old: f64, old_time: u64, energy: f64, now: u64) -> Option<f64> {
    if energy_old <= 0.0 || old_time == 0 || now <= old_time {
        return None;
    }
    let delta = energy_old - energy;
    if delta < 0.1 {
        return None;
    }
    Some(delta * 3600.0 / (now - old_time) as f64)
}
