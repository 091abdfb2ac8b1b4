//! The D-Bus surface. Deliberately thin: every method delegates to a plain
//! operation on the daemon or a device, and the error taxonomy maps onto
//! standard bus errors at this boundary and nowhere else.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::OwnedObjectPath;
use zbus::{Connection, fdo, interface};

use crate::daemon::{Daemon, DaemonSignal};
use crate::device_list::SharedDevice;
use crate::errors::*;
use crate::types::HistoryType;

make_log_macro!(debug, "rpc");

pub const BUS_NAME: &str = "org.freedesktop.powerkit";
pub const DAEMON_PATH: &str = "/org/freedesktop/powerkit";
pub const WAKEUPS_PATH: &str = "/org/freedesktop/powerkit/Wakeups";

fn to_fdo(err: DaemonError) -> fdo::Error {
    match &err {
        DaemonError::AuthDenied(..) => fdo::Error::AccessDenied(err.to_string()),
        DaemonError::CapabilityMissing(_) => fdo::Error::NotSupported(err.to_string()),
        DaemonError::NoSuchDevice(_) => fdo::Error::UnknownObject(err.to_string()),
        DaemonError::HookFailed { .. } | DaemonError::General(_) => {
            fdo::Error::Failed(err.to_string())
        }
    }
}

fn object_path(path: String) -> fdo::Result<OwnedObjectPath> {
    OwnedObjectPath::try_from(path).map_err(|e| fdo::Error::Failed(e.to_string()))
}

struct DaemonInterface {
    daemon: Arc<Mutex<Daemon>>,
}

#[interface(name = "org.freedesktop.powerkit.Daemon")]
impl DaemonInterface {
    async fn enumerate_devices(&self) -> fdo::Result<Vec<OwnedObjectPath>> {
        let paths = self.daemon.lock().await.enumerate_devices().await;
        paths.into_iter().map(object_path).collect()
    }

    async fn get_display_device(&self) -> fdo::Result<OwnedObjectPath> {
        let path = self
            .daemon
            .lock()
            .await
            .display_device()
            .await
            .map_err(to_fdo)?;
        object_path(path)
    }

    async fn suspend(&self, #[zbus(header)] header: zbus::message::Header<'_>) -> fdo::Result<()> {
        let subject = subject_from(&header);
        self.daemon
            .lock()
            .await
            .suspend(&subject)
            .await
            .map_err(to_fdo)
    }

    async fn hibernate(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> fdo::Result<()> {
        let subject = subject_from(&header);
        self.daemon
            .lock()
            .await
            .hibernate(&subject)
            .await
            .map_err(to_fdo)
    }

    #[zbus(property)]
    async fn daemon_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    #[zbus(property)]
    async fn on_battery(&self) -> bool {
        self.daemon.lock().await.on_battery()
    }

    #[zbus(property)]
    async fn on_low_battery(&self) -> bool {
        self.daemon.lock().await.on_low_battery()
    }

    #[zbus(property)]
    async fn lid_is_present(&self) -> bool {
        self.daemon.lock().await.lid_is_present()
    }

    #[zbus(property)]
    async fn lid_is_closed(&self) -> bool {
        self.daemon.lock().await.lid_is_closed()
    }

    #[zbus(property)]
    async fn can_suspend(&self) -> bool {
        self.daemon.lock().await.can_suspend()
    }

    #[zbus(property)]
    async fn can_hibernate(&self) -> bool {
        self.daemon.lock().await.can_hibernate()
    }

    #[zbus(signal)]
    async fn changed(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn device_added(emitter: &SignalEmitter<'_>, device: OwnedObjectPath)
    -> zbus::Result<()>;

    #[zbus(signal)]
    async fn device_changed(
        emitter: &SignalEmitter<'_>,
        device: OwnedObjectPath,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn device_removed(
        emitter: &SignalEmitter<'_>,
        device: OwnedObjectPath,
    ) -> zbus::Result<()>;
}

fn subject_from(header: &zbus::message::Header<'_>) -> String {
    header
        .sender()
        .map(|name| name.to_string())
        .unwrap_or_else(|| ":unknown".to_string())
}

struct DeviceInterface {
    device: SharedDevice,
}

#[interface(name = "org.freedesktop.powerkit.Device")]
impl DeviceInterface {
    async fn refresh(&self) -> fdo::Result<()> {
        let _ = self.device.lock().await.refresh().await;
        Ok(())
    }

    /// History records as `(time, value, state)`, newest within `timespan`
    /// seconds, at most `resolution` points.
    async fn get_history(
        &self,
        kind: String,
        timespan: u32,
        resolution: u32,
    ) -> fdo::Result<Vec<(u32, f64, String)>> {
        let kind: HistoryType = kind
            .parse()
            .map_err(|e: Error| fdo::Error::InvalidArgs(e.to_string()))?;
        let device = self.device.lock().await;
        let Some(history) = &device.history else {
            return Err(fdo::Error::Failed("device has no history".into()));
        };
        Ok(history
            .get_history(kind, timespan, resolution)
            .into_iter()
            .map(|r| (r.time as u32, r.value, r.state.to_string()))
            .collect())
    }

    /// The charge/discharge profile: 101 `(value, accuracy)` bins.
    async fn get_statistics(&self, kind: String) -> fdo::Result<Vec<(f64, f64)>> {
        let charging = match kind.as_str() {
            "charging" => true,
            "discharging" => false,
            other => {
                return Err(fdo::Error::InvalidArgs(format!(
                    "unknown statistics type '{other}'"
                )));
            }
        };
        let device = self.device.lock().await;
        let Some(history) = &device.history else {
            return Err(fdo::Error::Failed("device has no statistics".into()));
        };
        Ok(history
            .get_profile(charging)
            .into_iter()
            .map(|bin| (bin.value, bin.accuracy))
            .collect())
    }

    #[zbus(property)]
    async fn native_path(&self) -> String {
        self.device.lock().await.data.native_path.clone()
    }

    #[zbus(property, name = "Type")]
    async fn device_type(&self) -> String {
        self.device.lock().await.data.device_type.to_string()
    }

    #[zbus(property)]
    async fn vendor(&self) -> String {
        self.device.lock().await.data.vendor.clone()
    }

    #[zbus(property)]
    async fn model(&self) -> String {
        self.device.lock().await.data.model.clone()
    }

    #[zbus(property)]
    async fn serial(&self) -> String {
        self.device.lock().await.data.serial.clone()
    }

    #[zbus(property)]
    async fn update_time(&self) -> u64 {
        self.device.lock().await.data.update_time
    }

    #[zbus(property)]
    async fn power_supply(&self) -> bool {
        self.device.lock().await.data.power_supply
    }

    #[zbus(property)]
    async fn online(&self) -> bool {
        self.device.lock().await.data.online
    }

    #[zbus(property)]
    async fn is_present(&self) -> bool {
        self.device.lock().await.data.is_present
    }

    #[zbus(property)]
    async fn is_rechargeable(&self) -> bool {
        self.device.lock().await.data.is_rechargeable
    }

    #[zbus(property)]
    async fn has_history(&self) -> bool {
        self.device.lock().await.data.has_history
    }

    #[zbus(property)]
    async fn has_statistics(&self) -> bool {
        self.device.lock().await.data.has_statistics
    }

    #[zbus(property)]
    async fn state(&self) -> String {
        self.device.lock().await.data.state.to_string()
    }

    #[zbus(property)]
    async fn technology(&self) -> String {
        self.device.lock().await.data.technology.to_string()
    }

    #[zbus(property)]
    async fn capacity(&self) -> f64 {
        self.device.lock().await.data.capacity
    }

    #[zbus(property)]
    async fn energy(&self) -> f64 {
        self.device.lock().await.data.energy
    }

    #[zbus(property)]
    async fn energy_empty(&self) -> f64 {
        self.device.lock().await.data.energy_empty
    }

    #[zbus(property)]
    async fn energy_full(&self) -> f64 {
        self.device.lock().await.data.energy_full
    }

    #[zbus(property)]
    async fn energy_full_design(&self) -> f64 {
        self.device.lock().await.data.energy_full_design
    }

    #[zbus(property)]
    async fn energy_rate(&self) -> f64 {
        self.device.lock().await.data.energy_rate
    }

    #[zbus(property)]
    async fn voltage(&self) -> f64 {
        self.device.lock().await.data.voltage
    }

    #[zbus(property)]
    async fn percentage(&self) -> f64 {
        self.device.lock().await.data.percentage
    }

    #[zbus(property)]
    async fn time_to_empty(&self) -> i64 {
        self.device.lock().await.data.time_to_empty
    }

    #[zbus(property)]
    async fn time_to_full(&self) -> i64 {
        self.device.lock().await.data.time_to_full
    }

    #[zbus(signal)]
    async fn changed(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;
}

struct WakeupsInterface {
    daemon: Arc<Mutex<Daemon>>,
}

#[interface(name = "org.freedesktop.powerkit.Wakeups")]
impl WakeupsInterface {
    async fn get_total(&self) -> fdo::Result<u32> {
        self.daemon
            .lock()
            .await
            .wakeups
            .total()
            .ok_or_else(|| fdo::Error::Failed("no interrupt data".into()))
    }

    async fn get_data(&self) -> Vec<(bool, u32, f64, String, String)> {
        self.daemon
            .lock()
            .await
            .wakeups
            .data()
            .into_iter()
            .map(|e| (e.is_userspace, e.id, e.value, e.cmdline, e.details))
            .collect()
    }

    #[zbus(signal)]
    async fn total_changed(emitter: &SignalEmitter<'_>, value: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn data_changed(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;
}

/// Connect, export the daemon and wakeups objects, and start the task that
/// forwards internal notifications out as bus signals and (de)registers
/// device objects as they come and go.
pub async fn serve(
    daemon: Arc<Mutex<Daemon>>,
    mut signals: UnboundedReceiver<DaemonSignal>,
    claim_name: bool,
) -> Result<Connection> {
    let connection = Connection::system()
        .await
        .error("failed to connect to the system bus")?;

    connection
        .object_server()
        .at(
            DAEMON_PATH,
            DaemonInterface {
                daemon: daemon.clone(),
            },
        )
        .await
        .error("failed to export daemon object")?;
    connection
        .object_server()
        .at(
            WAKEUPS_PATH,
            WakeupsInterface {
                daemon: daemon.clone(),
            },
        )
        .await
        .error("failed to export wakeups object")?;

    if claim_name {
        connection
            .request_name(BUS_NAME)
            .await
            .error("failed to claim bus name")?;
    }

    let conn = connection.clone();
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            if let Err(err) = forward_signal(&conn, &daemon, signal).await {
                debug!("failed to forward signal: {err}");
            }
        }
    });

    Ok(connection)
}

async fn forward_signal(
    connection: &Connection,
    daemon: &Arc<Mutex<Daemon>>,
    signal: DaemonSignal,
) -> zbus::Result<()> {
    let server = connection.object_server();
    let daemon_ref = server
        .interface::<_, DaemonInterface>(DAEMON_PATH)
        .await?;
    match signal {
        DaemonSignal::Changed => {
            DaemonInterface::changed(daemon_ref.signal_emitter()).await?;
        }
        DaemonSignal::DeviceAdded(path) => {
            if let Some(device) = daemon.lock().await.device_by_object_path(&path).await {
                server.at(path.as_str(), DeviceInterface { device }).await?;
            }
            let path = OwnedObjectPath::try_from(path)?;
            DaemonInterface::device_added(daemon_ref.signal_emitter(), path).await?;
        }
        DaemonSignal::DeviceChanged(path) => {
            if let Ok(device_ref) = server
                .interface::<_, DeviceInterface>(path.as_str())
                .await
            {
                DeviceInterface::changed(device_ref.signal_emitter()).await?;
            }
            let path = OwnedObjectPath::try_from(path)?;
            DaemonInterface::device_changed(daemon_ref.signal_emitter(), path).await?;
        }
        DaemonSignal::DeviceRemoved(path) => {
            let _ = server.remove::<DeviceInterface, _>(path.as_str()).await;
            let path = OwnedObjectPath::try_from(path)?;
            DaemonInterface::device_removed(daemon_ref.signal_emitter(), path).await?;
        }
        DaemonSignal::WakeupsTotalChanged(value) => {
            let wakeups_ref = server
                .interface::<_, WakeupsInterface>(WAKEUPS_PATH)
                .await?;
            WakeupsInterface::total_changed(wakeups_ref.signal_emitter(), value).await?;
        }
        DaemonSignal::WakeupsDataChanged => {
            let wakeups_ref = server
                .interface::<_, WakeupsInterface>(WAKEUPS_PATH)
                .await?;
            WakeupsInterface::data_changed(wakeups_ref.signal_emitter()).await?;
        }
    }
    Ok(())
}
