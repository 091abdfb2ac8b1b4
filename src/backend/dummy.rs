//! A backend that fabricates a single battery out of thin air. Useful for
//! developing against machines with no power hardware, and for integration
//! tests: the synthetic device goes through the exact same sysfs-shaped
//! refresh path as a real one.

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use super::{BackendAction, BackendEvent, NativeDevice};
use crate::errors::*;

make_log_macro!(debug, "backend");

const CHANGE_INTERVAL: Duration = Duration::from_secs(30);

pub(super) fn spawn(events: UnboundedSender<BackendEvent>) -> Result<()> {
    let dir = std::env::temp_dir().join(format!("powerkitd-dummy-{}", std::process::id()));
    let battery = dir.join("BAT0");
    std::fs::create_dir_all(&battery)
        .or_error(|| format!("failed to create {}", battery.display()))?;
    write_battery(&battery, "Discharging")?;

    tokio::spawn(async move {
        let native = || NativeDevice::new("power_supply", &battery.display().to_string());
        let _ = events.send(BackendEvent {
            action: BackendAction::Add,
            native: native(),
        });

        // flip between charging and discharging forever so clients have
        // something to watch
        let mut discharging = true;
        loop {
            tokio::time::sleep(CHANGE_INTERVAL).await;
            discharging = !discharging;
            let status = if discharging {
                "Discharging"
            } else {
                "Charging"
            };
            debug!("dummy battery now {status}");
            if write_battery(&battery, status).is_err() {
                return;
            }
            if events
                .send(BackendEvent {
                    action: BackendAction::Change,
                    native: native(),
                })
                .is_err()
            {
                return;
            }
        }
    });
    Ok(())
}

fn write_battery(dir: &Path, status: &str) -> Result<()> {
    let attrs = [
        ("present", "1"),
        ("status", status),
        ("energy_now", "54000000"),
        ("energy_full", "60000000"),
        ("energy_full_design", "60000000"),
        ("voltage_now", "12000000"),
        ("voltage_max_design", "12000000"),
        ("current_now", "10000000"),
        ("manufacturer", "POWERKIT"),
        ("model_name", "Dummy Battery"),
        ("serial_number", "DUMMY001"),
        ("technology", "Li-ion"),
    ];
    for (attr, value) in attrs {
        std::fs::write(dir.join(attr), format!("{value}\n"))
            .or_error(|| format!("failed to write dummy attribute {attr}"))?;
    }
    Ok(())
}
