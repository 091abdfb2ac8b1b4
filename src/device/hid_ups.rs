//! HID UPS devices, spoken to through the kernel's `hiddev` interface.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{DeviceData, VariantDriver};
use crate::backend::NativeDevice;
use crate::errors::*;
use crate::types::{DeviceState, DeviceType, Technology};
use crate::util::read_prop_string;

make_log_macro!(debug, "hid_ups");

// Usage codes from the USB Power Device and Battery System usage pages.
const HID_REMAINING_CAPACITY: u32 = 0x85_0066;
const HID_RUNTIME_TO_EMPTY: u32 = 0x85_0068;
const HID_CHARGING: u32 = 0x85_0044;
const HID_DISCHARGING: u32 = 0x85_0045;
const HID_BATTERY_PRESENT: u32 = 0x85_00d1;
const HID_CHEMISTRY: u32 = 0x85_0089;
const HID_RECHARGEABLE: u32 = 0x85_008b;
const HID_OEM_INFORMATION: u32 = 0x85_008f;
const HID_PRODUCT: u32 = 0x84_00fe;
const HID_SERIAL_NUMBER: u32 = 0x84_00ff;
const HID_DESIGN_CAPACITY: u32 = 0x85_0083;

/// Application usage page that marks a hiddev node as a power device.
const HID_PAGE_POWER_DEVICE: u32 = 0x84;

const HID_REPORT_ID_FIRST: u32 = 0x0000_0100;
const HID_REPORT_ID_NEXT: u32 = 0x0000_0200;
const HID_REPORT_TYPE_MIN: u32 = 1;
const HID_REPORT_TYPE_MAX: u32 = 3;

#[repr(C)]
#[derive(Default)]
struct HiddevDevinfo {
    bustype: u32,
    busnum: u32,
    devnum: u32,
    ifnum: u32,
    vendor: i16,
    product: i16,
    version: i16,
    num_applications: u32,
}

#[repr(C)]
#[derive(Default)]
struct HiddevReportInfo {
    report_type: u32,
    report_id: u32,
    num_fields: u32,
}

#[repr(C)]
#[derive(Default)]
struct HiddevFieldInfo {
    report_type: u32,
    report_id: u32,
    field_index: u32,
    maxusage: u32,
    flags: u32,
    physical: u32,
    logical: u32,
    application: u32,
    logical_minimum: i32,
    logical_maximum: i32,
    physical_minimum: i32,
    physical_maximum: i32,
    unit_exponent: u32,
    unit: u32,
}

#[repr(C)]
#[derive(Default)]
struct HiddevUsageRef {
    report_type: u32,
    report_id: u32,
    field_index: u32,
    usage_index: u32,
    usage_code: u32,
    value: i32,
}

#[repr(C)]
struct HiddevStringDescriptor {
    index: i32,
    value: [libc::c_char; 256],
}

nix::ioctl_read!(hiddev_gdevinfo, b'H', 0x03, HiddevDevinfo);
nix::ioctl_read!(hiddev_gstring, b'H', 0x04, HiddevStringDescriptor);
nix::ioctl_readwrite!(hiddev_greportinfo, b'H', 0x09, HiddevReportInfo);
nix::ioctl_readwrite!(hiddev_gfieldinfo, b'H', 0x0a, HiddevFieldInfo);
nix::ioctl_readwrite!(hiddev_gusage, b'H', 0x0b, HiddevUsageRef);
nix::ioctl_readwrite!(hiddev_gucode, b'H', 0x0d, HiddevUsageRef);

pub(super) async fn probe(
    native: &NativeDevice,
    data: &mut DeviceData,
) -> Option<Box<dyn VariantDriver>> {
    let node = find_hiddev_node(native.sysfs_dir())?;
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(&node)
        .ok()?;

    if !is_power_device(&file) {
        debug!("{} is not a power device", node.display());
        return None;
    }

    data.device_type = DeviceType::Ups;
    data.power_supply = true;
    data.is_present = true;
    data.is_rechargeable = true;
    // the descriptors may fill this in properly below
    data.vendor = read_prop_string(native.sysfs_dir(), "manufacturer")
        .await
        .unwrap_or_default();

    let ups = HidUps { file };
    ups.read_all_descriptors(data);
    Some(Box::new(ups))
}

pub(super) struct HidUps {
    file: File,
}

#[async_trait]
impl VariantDriver for HidUps {
    async fn refresh(&mut self, data: &mut DeviceData, _native: &NativeDevice) -> Result<bool> {
        // drain whatever interrupt reports queued up; silence is normal
        let mut buf = [0u8; 64 * 8];
        loop {
            match (&self.file).read(&mut buf) {
                Ok(0) => break,
                Ok(len) => {
                    for event in buf[..len].chunks_exact(8) {
                        let code = u32::from_ne_bytes(event[..4].try_into().expect("chunk of 8"));
                        let value = i32::from_ne_bytes(event[4..].try_into().expect("chunk of 8"));
                        self.apply(data, code, value);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    return Err(Error::new(format!("hiddev read failed: {err}")));
                }
            }
        }
        Ok(true)
    }
}

impl HidUps {
    fn apply(&self, data: &mut DeviceData, code: u32, value: i32) -> bool {
        let fd = self.file.as_raw_fd();
        apply_usage(data, code, value, |index| get_string(fd, index))
    }

    /// Walk every report descriptor once so the initial property set is
    /// complete without waiting for the UPS to feel chatty.
    fn read_all_descriptors(&self, data: &mut DeviceData) {
        let fd = self.file.as_raw_fd();
        for report_type in HID_REPORT_TYPE_MIN..=HID_REPORT_TYPE_MAX {
            let mut rinfo = HiddevReportInfo {
                report_type,
                report_id: HID_REPORT_ID_FIRST,
                ..Default::default()
            };
            while unsafe { hiddev_greportinfo(fd, &mut rinfo) }.is_ok() {
                for field_index in 0..rinfo.num_fields {
                    let mut finfo = HiddevFieldInfo {
                        report_type: rinfo.report_type,
                        report_id: rinfo.report_id,
                        field_index,
                        ..Default::default()
                    };
                    if unsafe { hiddev_gfieldinfo(fd, &mut finfo) }.is_err() {
                        continue;
                    }
                    for usage_index in 0..finfo.maxusage {
                        let mut uref = HiddevUsageRef {
                            report_type: finfo.report_type,
                            report_id: finfo.report_id,
                            field_index,
                            usage_index,
                            ..Default::default()
                        };
                        if unsafe { hiddev_gucode(fd, &mut uref) }.is_err()
                            || unsafe { hiddev_gusage(fd, &mut uref) }.is_err()
                        {
                            continue;
                        }
                        self.apply(data, uref.usage_code, uref.value);
                    }
                }
                rinfo.report_id |= HID_REPORT_ID_NEXT;
            }
        }
    }
}

/// Map one usage report onto the canonical property set. Returns whether
/// the code meant anything to us.
fn apply_usage(
    data: &mut DeviceData,
    code: u32,
    value: i32,
    get_string: impl Fn(i32) -> String,
) -> bool {
    match code {
        HID_REMAINING_CAPACITY => data.percentage = f64::from(value),
        HID_RUNTIME_TO_EMPTY => data.time_to_empty = i64::from(value),
        HID_CHARGING => {
            if value != 0 {
                data.state = DeviceState::Charging;
            }
        }
        HID_DISCHARGING => {
            if value != 0 {
                data.state = DeviceState::Discharging;
            }
        }
        HID_BATTERY_PRESENT => data.is_present = value != 0,
        HID_CHEMISTRY => data.technology = Technology::from_acpi(&get_string(value)),
        HID_RECHARGEABLE => data.is_rechargeable = value != 0,
        HID_OEM_INFORMATION => data.vendor = get_string(value),
        HID_PRODUCT => data.model = get_string(value),
        HID_SERIAL_NUMBER => data.serial = get_string(value),
        HID_DESIGN_CAPACITY => data.energy_full_design = f64::from(value),
        _ => return false,
    }
    true
}

/// Whether any application collection of this hiddev node sits on the Power
/// Device usage page.
fn is_power_device(file: &File) -> bool {
    let fd = file.as_raw_fd();
    let mut info = HiddevDevinfo::default();
    if unsafe { hiddev_gdevinfo(fd, &mut info) }.is_err() {
        return false;
    }
    let request = nix::request_code_none!(b'H', 0x02);
    for index in 0..info.num_applications {
        let usage = unsafe { libc::ioctl(fd, request as libc::c_ulong, index) };
        if usage >= 0 && (usage as u32) >> 16 == HID_PAGE_POWER_DEVICE {
            return true;
        }
    }
    false
}

fn get_string(fd: libc::c_int, index: i32) -> String {
    if index == 0 {
        return String::new();
    }
    let mut desc = HiddevStringDescriptor {
        index,
        value: [0; 256],
    };
    if unsafe { hiddev_gstring(fd, &mut desc) }.is_err() {
        return String::new();
    }
    let bytes: Vec<u8> = desc
        .value
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

/// USB devices expose their hiddev character node through a `usbmisc` child
/// of one of their interfaces.
fn find_hiddev_node(sysfs_dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(sysfs_dir).ok()?;
    for entry in entries.flatten() {
        let usbmisc = entry.path().join("usbmisc");
        let Ok(children) = std::fs::read_dir(&usbmisc) else {
            continue;
        };
        for child in children.flatten() {
            let name = child.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("hiddev") {
                return Some(Path::new("/dev/usb").join(name.as_ref()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_strings(index: i32) -> String {
        match index {
            1 => "PbAc".to_string(),
            2 => "APC".to_string(),
            3 => "Back-UPS 700".to_string(),
            4 => "4B1234X56789".to_string(),
            _ => String::new(),
        }
    }

    #[test]
    fn usages_map_onto_the_property_set() {
        let mut data = DeviceData::default();
        assert!(apply_usage(&mut data, HID_REMAINING_CAPACITY, 87, fake_strings));
        assert!(apply_usage(&mut data, HID_RUNTIME_TO_EMPTY, 1740, fake_strings));
        assert!(apply_usage(&mut data, HID_DISCHARGING, 1, fake_strings));
        assert!(apply_usage(&mut data, HID_BATTERY_PRESENT, 1, fake_strings));
        assert!(apply_usage(&mut data, HID_CHEMISTRY, 1, fake_strings));
        assert!(apply_usage(&mut data, HID_RECHARGEABLE, 1, fake_strings));
        assert!(apply_usage(&mut data, HID_OEM_INFORMATION, 2, fake_strings));
        assert!(apply_usage(&mut data, HID_PRODUCT, 3, fake_strings));
        assert!(apply_usage(&mut data, HID_SERIAL_NUMBER, 4, fake_strings));
        assert!(apply_usage(&mut data, HID_DESIGN_CAPACITY, 700, fake_strings));

        assert_eq!(data.percentage, 87.0);
        assert_eq!(data.time_to_empty, 1740);
        assert_eq!(data.state, DeviceState::Discharging);
        assert!(data.is_present);
        assert_eq!(data.technology, Technology::LeadAcid);
        assert!(data.is_rechargeable);
        assert_eq!(data.vendor, "APC");
        assert_eq!(data.model, "Back-UPS 700");
        assert_eq!(data.serial, "4B1234X56789");
        assert_eq!(data.energy_full_design, 700.0);
    }

    #[test]
    fn charging_flags_only_set_on_nonzero() {
        let mut data = DeviceData::default();
        apply_usage(&mut data, HID_CHARGING, 0, fake_strings);
        assert_eq!(data.state, DeviceState::Unknown);
        apply_usage(&mut data, HID_CHARGING, 1, fake_strings);
        assert_eq!(data.state, DeviceState::Charging);
        // a zero discharge flag does not clear the charging state
        apply_usage(&mut data, HID_DISCHARGING, 0, fake_strings);
        assert_eq!(data.state, DeviceState::Charging);
    }

    #[test]
    fn unknown_usages_are_ignored() {
        let mut data = DeviceData::default();
        // below-RCL and shutdown-imminent are deliberately unmapped
        assert!(!apply_usage(&mut data, 0x84_0042, 1, fake_strings));
        assert!(!apply_usage(&mut data, 0x84_0069, 1, fake_strings));
        assert_eq!(data, DeviceData::default());
    }
}
