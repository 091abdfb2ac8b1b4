//! The per-source device state machine: coldplug classification, refresh
//! dispatch, poll policy and the canonical property set.

pub mod csr;
pub mod hid_ups;
pub mod supply;
pub mod wup;

use std::time::Duration;

use async_trait::async_trait;

use crate::backend::NativeDevice;
use crate::config::Config;
use crate::errors::*;
use crate::history::{HistoryStore, SaveAction, battery_id};
use crate::types::{DeviceState, DeviceType, Technology};
use crate::util;

make_log_macro!(debug, "device");

/// The canonical property set. Every device exposes all of it; attributes
/// that make no sense for a variant keep their sentinel values (0, empty,
/// false, Unknown).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceData {
    pub native_path: String,
    pub device_type: DeviceType,
    pub vendor: String,
    pub model: String,
    pub serial: String,
    /// Seconds since the epoch of the last successful refresh.
    pub update_time: u64,
    /// Whether this device powers the host.
    pub power_supply: bool,
    pub online: bool,
    pub is_present: bool,
    pub is_rechargeable: bool,
    pub has_history: bool,
    pub has_statistics: bool,
    pub state: DeviceState,
    pub technology: Technology,
    /// Health: 100 · energy_full / energy_full_design, 0..100.
    pub capacity: f64,
    /// Watt-hours; 0 means "no value".
    pub energy: f64,
    pub energy_empty: f64,
    pub energy_full: f64,
    pub energy_full_design: f64,
    /// Watts, magnitude.
    pub energy_rate: f64,
    pub voltage: f64,
    /// 0..100.
    pub percentage: f64,
    /// Seconds; 0 means unknown.
    pub time_to_empty: i64,
    pub time_to_full: i64,
}

impl DeviceData {
    /// Reset every battery-electrical field to its sentinel. Identity and
    /// classification survive.
    pub fn reset_battery_values(&mut self) {
        self.vendor.clear();
        self.model.clear();
        self.serial.clear();
        self.update_time = 0;
        self.power_supply = false;
        self.online = false;
        self.is_present = false;
        self.is_rechargeable = false;
        self.has_history = false;
        self.has_statistics = false;
        self.state = DeviceState::Unknown;
        self.technology = Technology::Unknown;
        self.capacity = 0.0;
        self.energy = 0.0;
        self.energy_empty = 0.0;
        self.energy_full = 0.0;
        self.energy_full_design = 0.0;
        self.energy_rate = 0.0;
        self.voltage = 0.0;
        self.percentage = 0.0;
        self.time_to_empty = 0;
        self.time_to_full = 0;
    }
}

/// Poll cadences, from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct PollTimings {
    pub normal: Duration,
    pub unknown: Duration,
    pub unknown_retries: u32,
}

impl From<&Config> for PollTimings {
    fn from(config: &Config) -> Self {
        Self {
            normal: Duration::from_secs(config.poll_interval),
            unknown: Duration::from_secs(config.unknown_poll_interval),
            unknown_retries: config.unknown_poll_retries,
        }
    }
}

/// What a device variant knows how to do. One implementation per hardware
/// flavour; the shared state machine drives them uniformly.
#[async_trait]
pub trait VariantDriver: Send {
    /// Re-read the hardware into `data`. `Ok(false)` means the handle is
    /// gone and the device should be dropped.
    async fn refresh(&mut self, data: &mut DeviceData, native: &NativeDevice) -> Result<bool>;

    /// When to look again without being told; `None` disables polling.
    fn poll_interval(&mut self, data: &DeviceData, timings: &PollTimings) -> Option<Duration> {
        let _ = data;
        Some(timings.normal)
    }
}

pub struct Device {
    native: NativeDevice,
    pub data: DeviceData,
    object_path: String,
    driver: Box<dyn VariantDriver>,
    pub history: Option<HistoryStore>,
    timings: PollTimings,
    low_battery_threshold: f64,
    has_ever_refreshed: bool,
    /// Generation counter for outstanding poll timers; a timer that fires
    /// with a stale generation is ignored.
    pub poll_seq: u64,
}

impl Device {
    /// Classify a native handle and build the device for it, running the
    /// probe pipeline for the handle's subsystem. `None` means every probe
    /// rejected the handle.
    pub async fn coldplug(native: NativeDevice, config: &Config) -> Option<Self> {
        let base = || DeviceData {
            native_path: native.native_path().to_string(),
            ..Default::default()
        };

        let (driver, data) = match native.subsystem.as_str() {
            "power_supply" => {
                let mut data = base();
                (supply::probe(&native, &mut data).await?, data)
            }
            "tty" => {
                let mut data = base();
                (wup::probe(&native, &mut data).await?, data)
            }
            "usb" => {
                // a rejected probe leaves the handle free for the next one
                let mut data = base();
                match csr::probe(&native, &mut data).await {
                    Some(driver) => (driver, data),
                    None => {
                        let mut data = base();
                        (hid_ups::probe(&native, &mut data).await?, data)
                    }
                }
            }
            other => {
                debug!("ignoring {} ({other})", native.native_path());
                return None;
            }
        };

        let object_path = compute_object_path(data.device_type, native.native_path());
        let mut device = Self {
            native,
            data,
            object_path,
            driver,
            history: None,
            timings: PollTimings::from(config),
            low_battery_threshold: config.low_battery_threshold,
            has_ever_refreshed: false,
            poll_seq: 0,
        };

        if !device.refresh().await {
            debug!("initial refresh rejected {}", device.data.native_path);
            return None;
        }
        device.attach_history(config);
        Some(device)
    }

    /// Attach the history store once we know who this battery is.
    fn attach_history(&mut self, config: &Config) {
        if self.data.device_type != DeviceType::Battery
            || !self.data.power_supply
            || !self.data.is_present
        {
            return;
        }
        let id = battery_id(&self.data.model, self.data.energy_full_design, &self.data.serial);
        let mut store = HistoryStore::new(
            config.state_dir(),
            Duration::from_secs(config.history_save_interval),
        );
        if store.set_id(&id) {
            self.data.has_history = true;
            self.data.has_statistics = true;
            self.history = Some(store);
            self.feed_history();
        }
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn native_path(&self) -> &str {
        self.native.native_path()
    }

    /// Re-read the device. Returns false when the handle is gone and the
    /// device should be dropped from the list.
    pub async fn refresh(&mut self) -> bool {
        let old = self.data.clone();
        self.data.update_time = util::now_secs();
        let alive = match self.driver.refresh(&mut self.data, &self.native).await {
            Ok(alive) => alive,
            Err(err) => {
                debug!("refresh failed on {}: {err}", old.native_path);
                // a transient failure keeps the previous values
                self.data = old;
                return true;
            }
        };
        if !alive {
            return false;
        }
        self.enforce_invariants(&old);
        self.feed_history();
        if !self.has_ever_refreshed {
            debug!("{:?}", self.data);
            self.has_ever_refreshed = true;
        }
        true
    }

    /// Handle a backend change notification: adopt the new handle, refresh,
    /// and report whether anything observable moved.
    pub async fn changed(&mut self, native: NativeDevice) -> Option<bool> {
        self.native = native;
        self.refresh_diff().await
    }

    /// Refresh and report whether any property differs from the prior
    /// snapshot. `None` means the handle is gone.
    pub async fn refresh_diff(&mut self) -> Option<bool> {
        let before = self.data.clone();
        if !self.refresh().await {
            return None;
        }
        Some(self.data != before)
    }

    /// The §3 invariants, applied after every variant refresh so no driver
    /// can publish an inconsistent record.
    fn enforce_invariants(&mut self, old: &DeviceData) {
        let data = &mut self.data;

        // hardware sometimes reports a last-full charge above the design
        // capacity; believe the measurement and raise the design value
        if data.energy_full_design > 0.0 && data.energy_full > data.energy_full_design {
            log::warn!(
                "{}: energy_full ({}) greater than energy_full_design ({})",
                data.native_path,
                data.energy_full,
                data.energy_full_design
            );
            data.energy_full_design = data.energy_full;
        }
        if data.energy > data.energy_full && data.energy_full > 0.0 {
            data.energy_full = data.energy;
        }

        data.percentage = data.percentage.clamp(0.0, 100.0);
        data.capacity = data.capacity.clamp(0.0, 100.0);
        data.energy_rate = data.energy_rate.max(0.0);

        // a battery is only believed to be full once it is clearly not
        // draining and mostly charged
        if data.state == DeviceState::FullyCharged
            && old.state != DeviceState::FullyCharged
            && (old.state == DeviceState::Discharging || data.percentage <= 60.0)
        {
            data.state = old.state;
        }

        match data.state {
            DeviceState::Charging => data.time_to_empty = 0,
            DeviceState::Discharging => data.time_to_full = 0,
            _ => {}
        }
        const TWENTY_HOURS: i64 = 20 * 60 * 60;
        if data.time_to_empty > TWENTY_HOURS {
            data.time_to_empty = 0;
        }
        if data.time_to_full > TWENTY_HOURS {
            data.time_to_full = 0;
        }
    }

    fn feed_history(&mut self) {
        let Some(history) = &mut self.history else {
            return;
        };
        history.set_state(self.data.state);
        history.set_charge(self.data.percentage);
        history.set_rate(self.data.energy_rate);
        history.set_time_full(self.data.time_to_full);
        history.set_time_empty(self.data.time_to_empty);
    }

    pub fn plan_history_save(&mut self) -> Option<SaveAction> {
        self.history.as_mut()?.plan_save()
    }

    pub fn save_history(&mut self) {
        if let Some(history) = &mut self.history {
            if let Err(err) = history.save() {
                log::warn!("failed to save history: {err}");
            }
        }
    }

    /// The variant's poll policy for the current state.
    pub fn poll_interval(&mut self) -> Option<Duration> {
        self.driver.poll_interval(&self.data, &self.timings)
    }

    /// Whether this device makes the system "on battery". `None` when the
    /// question is meaningless for this variant.
    pub fn on_battery(&self) -> Option<bool> {
        if self.data.device_type != DeviceType::Battery || !self.data.power_supply {
            return None;
        }
        if !self.data.is_present {
            return None;
        }
        Some(self.data.state == DeviceState::Discharging)
    }

    pub fn low_battery(&self) -> Option<bool> {
        let on_battery = self.on_battery()?;
        if !on_battery {
            return Some(false);
        }
        Some(self.data.percentage < self.low_battery_threshold)
    }

    pub fn online(&self) -> Option<bool> {
        (self.data.device_type == DeviceType::LinePower).then_some(self.data.online)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(native: NativeDevice) -> Self {
        struct Inert;
        #[async_trait]
        impl VariantDriver for Inert {
            async fn refresh(&mut self, _: &mut DeviceData, _: &NativeDevice) -> Result<bool> {
                Ok(true)
            }
        }
        let data = DeviceData {
            native_path: native.native_path().to_string(),
            ..Default::default()
        };
        let object_path = compute_object_path(data.device_type, &data.native_path);
        Self {
            native,
            data,
            object_path,
            driver: Box::new(Inert),
            history: None,
            timings: PollTimings {
                normal: Duration::from_secs(30),
                unknown: Duration::from_secs(2),
                unknown_retries: 30,
            },
            low_battery_threshold: 10.0,
            has_ever_refreshed: false,
            poll_seq: 0,
        }
    }
}

/// The public object path: `/devices/<variant>_<sanitized basename>`, with
/// the characters the transport can't carry mapped to ones it can.
pub fn compute_object_path(device_type: DeviceType, native_path: &str) -> String {
    let basename = native_path.rsplit('/').next().unwrap_or(native_path);
    let id: String = format!("{}_{}", device_type.as_str(), basename)
        .chars()
        .map(|c| match c {
            '-' => '_',
            '.' => 'x',
            ':' => 'o',
            other => other,
        })
        .collect();
    format!("/devices/{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_sanitization() {
        assert_eq!(
            compute_object_path(DeviceType::Battery, "/sys/devices/.../power_supply/BAT0"),
            "/devices/battery_BAT0"
        );
        // '-' -> '_', '.' -> 'x', ':' -> 'o'
        assert_eq!(
            compute_object_path(DeviceType::LinePower, "/sys/devices/LNXSYSTM:00/ADP-1.2"),
            "/devices/line_power_ADP_1x2"
        );
        assert_eq!(
            compute_object_path(DeviceType::Ups, "/sys/bus/usb/devices/1-1:1.0"),
            "/devices/ups_1_1o1x0"
        );
    }

    #[test]
    fn invariants_clamp_and_promote() {
        let mut device = Device::for_tests(NativeDevice::new("power_supply", "/sys/bat"));
        device.data.device_type = DeviceType::Battery;
        device.data.energy_full = 60.0;
        device.data.energy_full_design = 50.0;
        device.data.percentage = 120.0;
        device.data.capacity = -3.0;
        device.data.state = DeviceState::Discharging;
        device.data.time_to_full = 500;
        device.data.time_to_empty = 21 * 60 * 60;
        let old = DeviceData::default();
        device.enforce_invariants(&old);

        // the observed full charge wins over the claimed design capacity
        assert_eq!(device.data.energy_full_design, 60.0);
        assert_eq!(device.data.percentage, 100.0);
        assert_eq!(device.data.capacity, 0.0);
        // discharging devices have no time-to-full, and a 21 h estimate is
        // a firmware fantasy
        assert_eq!(device.data.time_to_full, 0);
        assert_eq!(device.data.time_to_empty, 0);
    }

    #[test]
    fn fully_charged_needs_evidence() {
        let mut device = Device::for_tests(NativeDevice::new("power_supply", "/sys/bat"));
        device.data.state = DeviceState::FullyCharged;
        device.data.percentage = 40.0;
        let mut old = DeviceData {
            state: DeviceState::Charging,
            ..Default::default()
        };
        device.enforce_invariants(&old);
        assert_eq!(device.data.state, DeviceState::Charging);

        device.data.state = DeviceState::FullyCharged;
        device.data.percentage = 97.0;
        device.enforce_invariants(&old);
        assert_eq!(device.data.state, DeviceState::FullyCharged);

        // never directly from discharging
        old.state = DeviceState::Discharging;
        device.data.state = DeviceState::FullyCharged;
        device.enforce_invariants(&old);
        assert_eq!(device.data.state, DeviceState::Discharging);
    }

    #[test]
    fn predicates_depend_on_variant() {
        let mut device = Device::for_tests(NativeDevice::new("power_supply", "/sys/bat"));
        device.data.device_type = DeviceType::Battery;
        device.data.power_supply = true;
        device.data.is_present = true;
        device.data.state = DeviceState::Discharging;
        device.data.percentage = 5.0;
        assert_eq!(device.on_battery(), Some(true));
        assert_eq!(device.low_battery(), Some(true));
        assert_eq!(device.online(), None);

        device.data.percentage = 50.0;
        assert_eq!(device.low_battery(), Some(false));

        device.data.is_present = false;
        assert_eq!(device.on_battery(), None);

        let mut ac = Device::for_tests(NativeDevice::new("power_supply", "/sys/ac"));
        ac.data.device_type = DeviceType::LinePower;
        ac.data.online = true;
        assert_eq!(ac.online(), Some(true));
        assert_eq!(ac.on_battery(), None);
    }
}
