//! End-to-end test against the dummy backend: the synthetic battery flows
//! through coldplug, classification, sysfs-shaped refresh and history
//! attachment exactly like real hardware would.

use std::time::Duration;

use powerkitd::config::{BackendKind, Config, HookPaths};
use powerkitd::daemon::{Daemon, DaemonSignal};
use powerkitd::hooks::BusPolicyAuth;
use powerkitd::types::{DeviceState, DeviceType};

fn test_config() -> Config {
    let state_dir = std::env::temp_dir().join(format!("powerkitd-it-{}", std::process::id()));
    Config {
        localstate_dir: state_dir.display().to_string(),
        backend: BackendKind::Dummy,
        hooks: HookPaths {
            powersave: "/bin/true".into(),
            suspend: "/bin/true".into(),
            hibernate: "/bin/true".into(),
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn dummy_battery_reaches_the_device_model() {
    let handle = Daemon::start(test_config(), Box::new(BusPolicyAuth))
        .await
        .unwrap();
    let daemon = handle.daemon;
    let mut events = handle.events;
    let mut signals = handle.signals;

    // drive the event loop by hand until the synthetic battery lands
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            daemon.lock().await.handle_event(event).await;
            if !daemon.lock().await.enumerate_devices().await.is_empty() {
                break;
            }
        }
    })
    .await
    .expect("dummy battery never appeared");

    let locked = daemon.lock().await;
    let paths = locked.enumerate_devices().await;
    assert_eq!(paths.len(), 1);
    assert!(paths[0].starts_with("/devices/battery_"), "{}", paths[0]);
    assert_eq!(locked.display_device().await.unwrap(), paths[0]);

    let device = locked.device_by_object_path(&paths[0]).await.unwrap();
    let device = device.lock().await;
    assert_eq!(device.data.device_type, DeviceType::Battery);
    assert_eq!(device.data.state, DeviceState::Discharging);
    assert_eq!(device.data.percentage, 90.0);
    assert_eq!(device.data.energy, 54.0);
    assert_eq!(device.data.energy_rate, 10.0);
    assert_eq!(device.data.vendor, "POWERKIT");
    assert!(device.data.has_history);
    assert!(device.history.is_some());
    drop(device);

    // the system runs on that battery alone
    assert!(locked.on_battery());
    drop(locked);

    let mut saw_added = false;
    while let Ok(signal) = signals.try_recv() {
        if matches!(signal, DaemonSignal::DeviceAdded(_)) {
            saw_added = true;
        }
    }
    assert!(saw_added, "no device-added notification was emitted");
}
