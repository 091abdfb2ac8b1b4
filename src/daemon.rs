//! The aggregator: owns the device list, derives the system-wide booleans,
//! drives power policy on transitions, and backs the RPC surface.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::backend::{self, BackendAction, BackendEvent, NativeDevice};
use crate::config::Config;
use crate::device::Device;
use crate::device_list::{DeviceList, SharedDevice};
use crate::errors::*;
use crate::history::SaveAction;
use crate::hooks::{self, ACTION_HIBERNATE, ACTION_SUSPEND, AuthCheck};
use crate::lid::LidSwitch;
use crate::types::DeviceType;
use crate::wakeups::WakeupsMonitor;

make_log_macro!(debug, "daemon");

/// After an on-battery flip, refresh the batteries again once the firmware
/// has had time to settle on its new story.
const ON_BATTERY_REFRESH_DELAY: Duration = Duration::from_secs(3);

/// Everything that wakes the daemon up.
#[derive(Debug)]
pub enum Event {
    Backend(BackendEvent),
    /// A device poll timer fired; stale generations are ignored.
    Poll { native_path: String, seq: u64 },
    /// A debounced history save came due.
    FlushHistory { native_path: String },
    /// The post-transition battery sweep.
    DeferredRefresh,
    LidClosed(bool),
}

/// Notifications for the RPC layer to forward to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonSignal {
    /// A system boolean flipped.
    Changed,
    DeviceAdded(String),
    DeviceChanged(String),
    DeviceRemoved(String),
    WakeupsTotalChanged(u32),
    WakeupsDataChanged,
}

pub struct Daemon {
    config: Config,
    auth: Box<dyn AuthCheck>,
    list: DeviceList,
    events_tx: UnboundedSender<Event>,
    signals_tx: UnboundedSender<DaemonSignal>,
    pub wakeups: WakeupsMonitor,

    on_battery: bool,
    low_battery: bool,
    lid_is_present: bool,
    lid_is_closed: bool,
    can_suspend: bool,
    can_hibernate: bool,

    /// Input devices already claimed as lid switches.
    lid_paths: HashSet<String>,
}

pub struct DaemonHandle {
    pub daemon: Arc<Mutex<Daemon>>,
    pub events: UnboundedReceiver<Event>,
    pub signals: UnboundedReceiver<DaemonSignal>,
}

impl Daemon {
    pub fn new(
        config: Config,
        auth: Box<dyn AuthCheck>,
        capabilities: (bool, bool),
    ) -> (Self, UnboundedReceiver<Event>, UnboundedReceiver<DaemonSignal>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let daemon = Self {
            config,
            auth,
            list: DeviceList::new(),
            events_tx,
            signals_tx,
            wakeups: WakeupsMonitor::new(),
            on_battery: false,
            low_battery: false,
            lid_is_present: false,
            lid_is_closed: false,
            can_suspend: capabilities.0,
            can_hibernate: capabilities.1,
            lid_paths: HashSet::new(),
        };
        (daemon, events_rx, signals_rx)
    }

    /// Probe capabilities, apply the initial power policy and start the
    /// configured backend.
    pub async fn start(config: Config, auth: Box<dyn AuthCheck>) -> Result<DaemonHandle> {
        let capabilities = hooks::sleep_capabilities().await;
        debug!(
            "can_suspend={} can_hibernate={}",
            capabilities.0, capabilities.1
        );
        crate::wakeups::set_timer_stats(std::path::Path::new(crate::wakeups::USERSPACE_SOURCE), true);

        let (daemon, events, signals) = Self::new(config, auth, capabilities);
        hooks::run_powersave(&daemon.config.hooks, daemon.on_battery);

        let (backend_tx, mut backend_rx) = mpsc::unbounded_channel();
        backend::start(daemon.config.backend, backend_tx)?;
        let events_tx = daemon.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = backend_rx.recv().await {
                if events_tx.send(Event::Backend(event)).is_err() {
                    break;
                }
            }
        });

        Ok(DaemonHandle {
            daemon: Arc::new(Mutex::new(daemon)),
            events,
            signals,
        })
    }

    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Backend(event) => match event.action {
                BackendAction::Add => self.device_add(event.native).await,
                BackendAction::Change => self.device_changed(event.native).await,
                BackendAction::Remove => self.device_remove(event.native).await,
            },
            Event::Poll { native_path, seq } => self.device_poll(&native_path, seq).await,
            Event::FlushHistory { native_path } => {
                if let Some(device) = self.list.lookup(&native_path) {
                    device.lock().await.save_history();
                }
            }
            Event::DeferredRefresh => {
                debug!("doing the delayed refresh");
                self.refresh_batteries().await;
            }
            Event::LidClosed(closed) => self.set_lid_closed(closed, true),
        }
    }

    async fn device_add(&mut self, native: NativeDevice) {
        if let Some(existing) = self.list.lookup(native.native_path()) {
            // we already have the device; treat the add as a change
            debug!(
                "treating add event as change event on {}",
                native.native_path()
            );
            self.refresh_existing(existing, Some(native)).await;
            return;
        }

        if native.subsystem == "input" {
            self.lid_add(native).await;
            return;
        }

        let Some(device) = Device::coldplug(native, &self.config).await else {
            return;
        };
        let native_path = device.native_path().to_string();
        let object_path = device.object_path().to_string();
        let shared = Arc::new(Mutex::new(device));
        if !self.list.insert(&native_path, shared.clone()) {
            return;
        }
        self.signal(DaemonSignal::DeviceAdded(object_path));
        self.arm_device_timers(&shared).await;
        self.recompute().await;
    }

    async fn device_changed(&mut self, native: NativeDevice) {
        match self.list.lookup(native.native_path()) {
            Some(device) => self.refresh_existing(device, Some(native)).await,
            None => {
                // never assume an unknown handle is classified
                debug!(
                    "treating change event as add on {}",
                    native.native_path()
                );
                self.device_add(native).await;
            }
        }
    }

    async fn device_remove(&mut self, native: NativeDevice) {
        let Some(device) = self.list.lookup(native.native_path()) else {
            debug!("ignoring remove event on {}", native.native_path());
            return;
        };
        self.drop_device(&device).await;
    }

    async fn drop_device(&mut self, device: &SharedDevice) {
        let object_path = {
            let mut locked = device.lock().await;
            // outstanding polls die with the generation bump
            locked.poll_seq += 1;
            locked.save_history();
            locked.object_path().to_string()
        };
        self.list.remove(device);
        self.signal(DaemonSignal::DeviceRemoved(object_path));
        self.recompute().await;
    }

    /// Refresh a known device, optionally swapping in a fresh native handle,
    /// and propagate whatever changed.
    async fn refresh_existing(&mut self, device: SharedDevice, native: Option<NativeDevice>) {
        let (outcome, object_path) = {
            let mut locked = device.lock().await;
            let outcome = match native {
                Some(native) => locked.changed(native).await,
                None => locked.refresh_diff().await,
            };
            (outcome, locked.object_path().to_string())
        };
        match outcome {
            Some(true) => {
                self.signal(DaemonSignal::DeviceChanged(object_path.clone()));
                self.arm_device_timers(&device).await;
                self.recompute().await;
            }
            Some(false) => {
                self.arm_device_timers(&device).await;
            }
            None => {
                // the kernel yanked the handle; this is an implicit removal
                debug!("{object_path} is gone, dropping");
                self.drop_device(&device).await;
            }
        }
    }

    async fn device_poll(&mut self, native_path: &str, seq: u64) {
        let Some(device) = self.list.lookup(native_path) else {
            return;
        };
        {
            let locked = device.lock().await;
            if locked.poll_seq != seq {
                // a refresh got there first and re-armed the timer
                return;
            }
        }
        debug!("no updates on {native_path}; forcing refresh");
        self.refresh_existing(device, None).await;
    }

    /// Re-arm the poll timer per the variant's policy and schedule any
    /// pending history save.
    async fn arm_device_timers(&mut self, device: &SharedDevice) {
        let mut locked = device.lock().await;

        locked.poll_seq += 1;
        if let Some(delay) = locked.poll_interval() {
            let seq = locked.poll_seq;
            let native_path = locked.native_path().to_string();
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Event::Poll { native_path, seq });
            });
        }

        match locked.plan_history_save() {
            Some(SaveAction::Immediate) => {
                debug!("saving directly to disk as low power");
                locked.save_history();
            }
            Some(SaveAction::Debounce(delay)) => {
                let native_path = locked.native_path().to_string();
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::FlushHistory { native_path });
                });
            }
            None => {}
        }
    }

    /// Recompute the system booleans; on a flip, notify and apply policy.
    async fn recompute(&mut self) {
        let mut any_discharging = false;
        let mut any_online = false;
        let mut all_low = true;
        for device in self.list.snapshot() {
            let device = device.lock().await;
            if let Some(on_battery) = device.on_battery() {
                any_discharging |= on_battery;
            }
            if let Some(online) = device.online() {
                any_online |= online;
            }
            if let Some(low) = device.low_battery() {
                all_low &= low;
            }
        }

        let on_battery = any_discharging && !any_online;
        if on_battery != self.on_battery {
            self.on_battery = on_battery;
            debug!("now on_battery = {on_battery}");
            self.signal(DaemonSignal::Changed);

            // refresh all the batteries now, and again once the hardware
            // has settled
            self.refresh_batteries().await;
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ON_BATTERY_REFRESH_DELAY).await;
                let _ = tx.send(Event::DeferredRefresh);
            });

            hooks::run_powersave(&self.config.hooks, on_battery);
        }

        let low_battery = on_battery && all_low;
        if low_battery != self.low_battery {
            self.low_battery = low_battery;
            debug!("now low_battery = {low_battery}");
            self.signal(DaemonSignal::Changed);
        }
    }

    /// Synchronous sweep over every battery. No signals: this is damage
    /// control after a transition, not a state change in itself.
    async fn refresh_batteries(&mut self) {
        for device in self.list.snapshot() {
            let is_battery = {
                let locked = device.lock().await;
                locked.data.device_type == DeviceType::Battery
            };
            if is_battery {
                let mut locked = device.lock().await;
                let _ = locked.refresh_diff().await;
                drop(locked);
                self.arm_device_timers(&device).await;
            }
        }
    }

    async fn lid_add(&mut self, native: NativeDevice) {
        if self.lid_paths.contains(native.native_path()) {
            return;
        }
        let Some(lid) = LidSwitch::probe(&native).await else {
            return;
        };
        self.lid_paths.insert(native.native_path().to_string());
        let initial_closed = lid.is_closed();
        self.lid_coldplug(initial_closed);

        let (lid_tx, mut lid_rx) = mpsc::unbounded_channel();
        lid.watch(lid_tx);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(closed) = lid_rx.recv().await {
                if events_tx.send(Event::LidClosed(closed)).is_err() {
                    break;
                }
            }
        });
    }

    /// Register a lid switch. The initial closed state is recorded but not
    /// announced: a client acting on a "lid closed" event during daemon
    /// startup would suspend the machine it was just started on.
    fn lid_coldplug(&mut self, initial_closed: bool) {
        self.lid_is_present = true;
        self.set_lid_closed(initial_closed, false);
    }

    fn set_lid_closed(&mut self, closed: bool, notify: bool) {
        debug!("lid_is_closed = {closed}");
        if self.lid_is_closed == closed {
            return;
        }
        self.lid_is_closed = closed;
        if notify {
            self.signal(DaemonSignal::Changed);
        } else {
            debug!("not emitting lid change event for daemon startup");
        }
    }

    fn signal(&self, signal: DaemonSignal) {
        let _ = self.signals_tx.send(signal);
    }

    // --- the operations behind the RPC surface ---

    pub async fn enumerate_devices(&self) -> Vec<String> {
        let mut paths = Vec::with_capacity(self.list.len());
        for device in self.list.snapshot() {
            paths.push(device.lock().await.object_path().to_string());
        }
        paths
    }

    /// The device a UI should present: the first present power-supply
    /// battery, or failing that the first device at all.
    pub async fn display_device(&self) -> Result<String, DaemonError> {
        let mut fallback = None;
        for device in self.list.snapshot() {
            let locked = device.lock().await;
            if locked.data.device_type == DeviceType::Battery
                && locked.data.power_supply
                && locked.data.is_present
            {
                return Ok(locked.object_path().to_string());
            }
            if fallback.is_none() {
                fallback = Some(locked.object_path().to_string());
            }
        }
        fallback.ok_or_else(|| DaemonError::NoSuchDevice("no devices".into()))
    }

    pub async fn device_by_object_path(&self, object_path: &str) -> Option<SharedDevice> {
        for device in self.list.snapshot() {
            if device.lock().await.object_path() == object_path {
                return Some(device);
            }
        }
        None
    }

    pub async fn suspend(&self, subject: &str) -> Result<(), DaemonError> {
        if !self.can_suspend {
            return Err(DaemonError::CapabilityMissing("suspend"));
        }
        if !self.auth.check(subject, ACTION_SUSPEND) {
            return Err(DaemonError::AuthDenied(subject.to_string(), ACTION_SUSPEND));
        }
        hooks::run_sleep_helper(&self.config.hooks.suspend).await
    }

    pub async fn hibernate(&self, subject: &str) -> Result<(), DaemonError> {
        if !self.can_hibernate {
            return Err(DaemonError::CapabilityMissing("hibernate"));
        }
        if !self.auth.check(subject, ACTION_HIBERNATE) {
            return Err(DaemonError::AuthDenied(subject.to_string(), ACTION_HIBERNATE));
        }
        hooks::run_sleep_helper(&self.config.hooks.hibernate).await
    }

    pub fn on_battery(&self) -> bool {
        self.on_battery
    }

    pub fn on_low_battery(&self) -> bool {
        self.on_battery && self.low_battery
    }

    pub fn lid_is_present(&self) -> bool {
        self.lid_is_present
    }

    pub fn lid_is_closed(&self) -> bool {
        self.lid_is_closed
    }

    pub fn can_suspend(&self) -> bool {
        self.can_suspend
    }

    pub fn can_hibernate(&self) -> bool {
        self.can_hibernate
    }

    /// Flush everything that must not be lost across a shutdown.
    pub async fn flush(&mut self) {
        for device in self.list.snapshot() {
            device.lock().await.save_history();
        }
        crate::wakeups::set_timer_stats(
            std::path::Path::new(crate::wakeups::USERSPACE_SOURCE),
            false,
        );
    }
}

/// The daemon's event loop. All state mutation funnels through here.
pub async fn run(daemon: Arc<Mutex<Daemon>>, mut events: UnboundedReceiver<Event>) {
    let mut wakeups_timer =
        tokio::time::interval(Duration::from_secs(crate::wakeups::POLL_INTERVAL_SECS));
    wakeups_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                daemon.lock().await.handle_event(event).await;
            }
            _ = wakeups_timer.tick() => {
                let mut daemon = daemon.lock().await;
                if let Some(total) = daemon.wakeups.poll().await {
                    daemon.signal(DaemonSignal::WakeupsTotalChanged(total));
                }
                daemon.signal(DaemonSignal::WakeupsDataChanged);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::DenyAll;
    use crate::util::test_util::{scratch_dir, write_attr};
    use std::path::Path;

    fn test_config(dir: &Path) -> Config {
        Config {
            localstate_dir: dir.join("state").display().to_string(),
            hooks: crate::config::HookPaths {
                powersave: "/bin/true".into(),
                suspend: "/bin/true".into(),
                hibernate: "/bin/false".into(),
            },
            ..Default::default()
        }
    }

    fn battery_dir(root: &Path, name: &str, status: &str, percent_e6: &str) -> std::path::PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        write_attr(&dir, "present", "1");
        write_attr(&dir, "status", status);
        write_attr(&dir, "energy_now", percent_e6);
        write_attr(&dir, "energy_full", "10000000");
        write_attr(&dir, "energy_full_design", "10000000");
        write_attr(&dir, "current_now", "1000000");
        write_attr(&dir, "voltage_max_design", "12000000");
        dir
    }

    fn ac_dir(root: &Path, online: &str) -> std::path::PathBuf {
        let dir = root.join("AC");
        std::fs::create_dir_all(&dir).unwrap();
        write_attr(&dir, "online", online);
        dir
    }

    fn add_event(dir: &Path) -> Event {
        Event::Backend(BackendEvent {
            action: BackendAction::Add,
            native: NativeDevice::new("power_supply", dir.to_str().unwrap()),
        })
    }

    fn change_event(dir: &Path) -> Event {
        Event::Backend(BackendEvent {
            action: BackendAction::Change,
            native: NativeDevice::new("power_supply", dir.to_str().unwrap()),
        })
    }

    async fn drain_signals(rx: &mut UnboundedReceiver<DaemonSignal>) -> Vec<DaemonSignal> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            out.push(signal);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn on_battery_flip_notifies_and_schedules_sweep() {
        let root = scratch_dir("daemon-flip");
        let (mut daemon, mut events, mut signals) =
            Daemon::new(test_config(&root), Box::new(DenyAll), (true, true));

        let ac = ac_dir(&root, "1");
        let bat = battery_dir(&root, "BAT0", "Discharging", "8000000");
        daemon.handle_event(add_event(&ac)).await;
        daemon.handle_event(add_event(&bat)).await;

        // a discharging battery behind an online AC supply is not on battery
        assert!(!daemon.on_battery());
        drain_signals(&mut signals).await;

        // pull the plug
        write_attr(&ac, "online", "0");
        daemon.handle_event(change_event(&ac)).await;
        assert!(daemon.on_battery());
        let emitted = drain_signals(&mut signals).await;
        assert!(emitted.contains(&DaemonSignal::Changed));

        // the deferred sweep fires 3 s later
        loop {
            match events.recv().await.unwrap() {
                Event::DeferredRefresh => break,
                other => daemon.handle_event(other).await,
            }
        }
    }

    #[tokio::test]
    async fn no_battery_means_not_on_battery() {
        // an offline AC supply alone does not put the system "on battery"
        let root = scratch_dir("daemon-aconly");
        let (mut daemon, _events, _signals) =
            Daemon::new(test_config(&root), Box::new(DenyAll), (true, true));
        let ac = ac_dir(&root, "0");
        daemon.handle_event(add_event(&ac)).await;
        assert!(!daemon.on_battery());
        assert!(!daemon.on_low_battery());
    }

    #[tokio::test(start_paused = true)]
    async fn low_battery_requires_every_battery_low() {
        let root = scratch_dir("daemon-low");
        let (mut daemon, _events, mut signals) =
            Daemon::new(test_config(&root), Box::new(DenyAll), (true, true));

        let low = battery_dir(&root, "BAT0", "Discharging", "500000"); // 5 %
        let full = battery_dir(&root, "BAT1", "Discharging", "9000000"); // 90 %
        daemon.handle_event(add_event(&low)).await;
        daemon.handle_event(add_event(&full)).await;
        assert!(daemon.on_battery());
        assert!(!daemon.on_low_battery(), "one healthy battery saves the day");
        drain_signals(&mut signals).await;

        write_attr(&full, "energy_now", "400000"); // now 4 %
        daemon.handle_event(change_event(&full)).await;
        assert!(daemon.on_low_battery());
        assert!(
            drain_signals(&mut signals)
                .await
                .contains(&DaemonSignal::Changed)
        );
    }

    #[tokio::test]
    async fn lid_coldplug_is_suppressed_but_later_events_are_not() {
        let root = scratch_dir("daemon-lid");
        let (mut daemon, _events, mut signals) =
            Daemon::new(test_config(&root), Box::new(DenyAll), (true, true));

        daemon.lid_coldplug(true);
        assert!(daemon.lid_is_present());
        assert!(daemon.lid_is_closed());
        assert!(
            drain_signals(&mut signals).await.is_empty(),
            "coldplug lid state must not be announced"
        );

        daemon.handle_event(Event::LidClosed(false)).await;
        daemon.handle_event(Event::LidClosed(true)).await;
        let emitted = drain_signals(&mut signals).await;
        assert_eq!(
            emitted,
            vec![DaemonSignal::Changed, DaemonSignal::Changed]
        );

        // duplicate state is not a transition
        daemon.handle_event(Event::LidClosed(true)).await;
        assert!(drain_signals(&mut signals).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn devices_enumerate_and_remove() {
        let root = scratch_dir("daemon-enum");
        let (mut daemon, _events, mut signals) =
            Daemon::new(test_config(&root), Box::new(DenyAll), (true, true));

        let ac = ac_dir(&root, "1");
        let bat = battery_dir(&root, "BAT0", "Charging", "5000000");
        daemon.handle_event(add_event(&ac)).await;
        daemon.handle_event(add_event(&bat)).await;

        let paths = daemon.enumerate_devices().await;
        assert_eq!(paths.len(), 2);
        assert!(paths[0].starts_with("/devices/line_power_"));
        assert!(paths[1].starts_with("/devices/battery_"));
        assert_eq!(
            daemon.display_device().await.unwrap(),
            paths[1],
            "display device prefers the battery"
        );

        let emitted = drain_signals(&mut signals).await;
        assert_eq!(
            emitted
                .iter()
                .filter(|s| matches!(s, DaemonSignal::DeviceAdded(_)))
                .count(),
            2
        );
        // added precedes any change for the same device
        assert!(matches!(emitted[0], DaemonSignal::DeviceAdded(_)));

        daemon
            .handle_event(Event::Backend(BackendEvent {
                action: BackendAction::Remove,
                native: NativeDevice::new("power_supply", bat.to_str().unwrap()),
            }))
            .await;
        assert_eq!(daemon.enumerate_devices().await.len(), 1);
        assert!(
            drain_signals(&mut signals)
                .await
                .iter()
                .any(|s| matches!(s, DaemonSignal::DeviceRemoved(_)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_sysfs_dir_is_an_implicit_removal() {
        let root = scratch_dir("daemon-gone");
        let (mut daemon, _events, mut signals) =
            Daemon::new(test_config(&root), Box::new(DenyAll), (true, true));
        let bat = battery_dir(&root, "BAT0", "Discharging", "8000000");
        daemon.handle_event(add_event(&bat)).await;
        assert_eq!(daemon.enumerate_devices().await.len(), 1);
        drain_signals(&mut signals).await;

        std::fs::remove_dir_all(&bat).unwrap();
        daemon.handle_event(change_event(&bat)).await;
        assert!(daemon.enumerate_devices().await.is_empty());
        assert!(
            drain_signals(&mut signals)
                .await
                .iter()
                .any(|s| matches!(s, DaemonSignal::DeviceRemoved(_)))
        );
        assert!(!daemon.on_battery(), "the gone battery no longer counts");
    }

    #[tokio::test]
    async fn privileged_operations_are_gated() {
        let root = scratch_dir("daemon-auth");
        let (daemon, _events, _signals) =
            Daemon::new(test_config(&root), Box::new(DenyAll), (true, false));

        match daemon.suspend(":1.9").await.unwrap_err() {
            DaemonError::AuthDenied(subject, action) => {
                assert_eq!(subject, ":1.9");
                assert_eq!(action, ACTION_SUSPEND);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // capability is checked before authorization
        assert!(matches!(
            daemon.hibernate(":1.9").await.unwrap_err(),
            DaemonError::CapabilityMissing("hibernate")
        ));
    }
}
