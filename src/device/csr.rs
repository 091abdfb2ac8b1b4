//! CSR wireless peripherals (mice and keyboards with a receiver dongle that
//! reports charge over a vendor control request).

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use super::{DeviceData, PollTimings, VariantDriver};
use crate::backend::NativeDevice;
use crate::errors::*;
use crate::types::{DeviceState, DeviceType};
use crate::util::{read_prop, read_prop_string};

make_log_macro!(debug, "csr");

/// Property the platform rules set on supported receivers.
const BATTERY_TYPE_PROPERTY: &str = "POWERKIT_BATTERY_TYPE";
/// Set on C502/C504/C505 dual receivers, where the mouse is the second
/// device and is addressed through the high byte.
const DUAL_PROPERTY: &str = "POWERKIT_CSR_DUAL";

const USB_TIMEOUT_MS: u32 = 100;

#[repr(C)]
struct UsbdevfsCtrltransfer {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    timeout: u32,
    data: *mut libc::c_void,
}

nix::ioctl_readwrite!(usbdevfs_control, b'U', 0, UsbdevfsCtrltransfer);

pub(super) async fn probe(
    native: &NativeDevice,
    data: &mut DeviceData,
) -> Option<Box<dyn VariantDriver>> {
    data.device_type = match native.property(BATTERY_TYPE_PROPERTY) {
        Some("mouse") => DeviceType::Mouse,
        Some("keyboard") => DeviceType::Keyboard,
        _ => {
            debug!("{} is not a csr receiver", native.native_path());
            return None;
        }
    };

    let dir = native.sysfs_dir();
    let bus_num: u32 = read_prop(dir, "busnum").await.unwrap_or(0);
    let dev_num: u32 = read_prop(dir, "devnum").await.unwrap_or(0);
    if bus_num == 0 || dev_num == 0 {
        log::warn!("unable to get bus or device numbers for {}", native.native_path());
        return None;
    }

    let is_dual = native.property(DUAL_PROPERTY) == Some("1");
    debug!("is_dual={is_dual}");

    data.vendor = read_prop_string(dir, "manufacturer").await.unwrap_or_default();
    data.model = read_prop_string(dir, "product").await.unwrap_or_default();
    data.power_supply = false;
    data.is_present = true;
    data.is_rechargeable = true;
    data.state = DeviceState::Discharging;

    Some(Box::new(Csr {
        bus_num,
        dev_num,
        is_dual,
    }))
}

pub(super) struct Csr {
    bus_num: u32,
    dev_num: u32,
    is_dual: bool,
}

#[derive(Debug, PartialEq)]
enum CsrReading {
    /// The receiver is handling the radio; ask again later.
    Busy,
    Level(f64),
    NoData,
}

#[async_trait]
impl VariantDriver for Csr {
    async fn refresh(&mut self, data: &mut DeviceData, _native: &NativeDevice) -> Result<bool> {
        let node = self.usbfs_node();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&node)
            .or_error(|| format!("cannot open {}", node.display()))?;

        // dual receivers address the mouse via the high byte
        let addr: u16 = if self.is_dual { 1 << 8 } else { 0 };
        let mut buf = [0u8; 8];
        let mut transfer = UsbdevfsCtrltransfer {
            request_type: 0xc0,
            request: 0x09,
            value: 0x03 | addr,
            index: addr,
            length: buf.len() as u16,
            timeout: USB_TIMEOUT_MS,
            data: buf.as_mut_ptr().cast(),
        };
        let written = unsafe { usbdevfs_control(file.as_raw_fd(), &mut transfer) }
            .error("control transfer failed")?;
        if written != buf.len() as i32 {
            return Err(Error::new(format!(
                "short control transfer: {written} of {} bytes",
                buf.len()
            )));
        }

        match parse_charge_report(&buf) {
            CsrReading::Busy => debug!("receiver busy"),
            CsrReading::NoData => {}
            CsrReading::Level(percentage) => data.percentage = percentage,
        }
        Ok(true)
    }

    fn poll_interval(&mut self, _data: &DeviceData, timings: &PollTimings) -> Option<Duration> {
        Some(timings.normal)
    }
}

impl Csr {
    fn usbfs_node(&self) -> PathBuf {
        PathBuf::from(format!(
            "/dev/bus/usb/{:03}/{:03}",
            self.bus_num, self.dev_num
        ))
    }
}

/// Interpret the 8-byte vendor report. The charge level lives in the low
/// three bits of P5 on a 0..7 scale.
fn parse_charge_report(buf: &[u8; 8]) -> CsrReading {
    let p0 = buf[1];
    let p4 = buf[2];
    let p5 = buf[3];
    // C504 receivers report 0x3b/0 while busy talking to the radio
    if p0 == 0x3b && p4 == 0 {
        return CsrReading::Busy;
    }
    let raw = p5 & 0x07;
    if raw == 0 {
        return CsrReading::NoData;
    }
    CsrReading::Level(100.0 / 7.0 * f64::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_report_parsing() {
        assert_eq!(
            parse_charge_report(&[0, 0x3b, 0, 5, 0, 0, 0, 0]),
            CsrReading::Busy
        );
        assert_eq!(
            parse_charge_report(&[0, 0, 1, 0, 0, 0, 0, 0]),
            CsrReading::NoData
        );
        match parse_charge_report(&[0, 0, 1, 7, 0, 0, 0, 0]) {
            CsrReading::Level(level) => assert_eq!(level, 100.0),
            other => panic!("unexpected reading: {other:?}"),
        }
        match parse_charge_report(&[0, 0, 1, 0x0b, 0, 0, 0, 0]) {
            // only the low three bits are charge
            CsrReading::Level(level) => assert!((level - 300.0 / 7.0).abs() < 1e-9),
            other => panic!("unexpected reading: {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_requires_the_platform_hint() {
        let mut data = DeviceData::default();
        let native = NativeDevice::new("usb", "/sys/bus/usb/devices/1-1");
        assert!(probe(&native, &mut data).await.is_none());
    }
}
