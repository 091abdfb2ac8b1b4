//! The Linux backend: sysfs enumeration plus a `NETLINK_KOBJECT_UEVENT`
//! socket for hotplug notifications.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::UnboundedSender;

use super::{BackendAction, BackendEvent, NativeDevice};
use crate::errors::*;
use crate::util;

make_log_macro!(debug, "backend");

/// The subsystems power devices can appear on.
const SUBSYSTEMS: [&str; 4] = ["power_supply", "usb", "tty", "input"];

/// Kernel uevent multicast group.
const UEVENT_GROUP_KERNEL: u32 = 1;

pub(super) fn spawn(events: UnboundedSender<BackendEvent>) -> Result<()> {
    // Arm the socket before enumerating so nothing slips between the two;
    // an add raced with enumeration is handled upstream as a change.
    let fd = open_uevent_socket().error("failed to open uevent socket")?;

    tokio::spawn(async move {
        if let Err(err) = run(fd, events).await {
            log::error!("linux backend died: {err}");
        }
    });
    Ok(())
}

fn open_uevent_socket() -> std::io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::NETLINK_KOBJECT_UEVENT,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = UEVENT_GROUP_KERNEL;
    let res = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            std::ptr::addr_of!(addr).cast(),
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

fn recv_datagram(fd: &OwnedFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let res = unsafe { libc::recv(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
    if res < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

async fn run(fd: OwnedFd, events: UnboundedSender<BackendEvent>) -> Result<()> {
    coldplug(&events).await;

    let async_fd = AsyncFd::new(fd).error("failed to register uevent socket")?;
    let mut buf = [0u8; 8192];
    loop {
        let mut guard = async_fd
            .readable()
            .await
            .error("uevent socket wait failed")?;
        match guard.try_io(|inner| recv_datagram(inner.get_ref(), &mut buf)) {
            Ok(Ok(len)) => {
                if let Some(event) = parse_uevent(&buf[..len]) {
                    if events.send(event).is_err() {
                        // daemon is gone; nothing left to notify
                        return Ok(());
                    }
                }
            }
            Ok(Err(err)) => return Err(Error::new(format!("uevent recv failed: {err}"))),
            Err(_would_block) => continue,
        }
    }
}

/// Emit an add for every device currently present on our subsystems.
async fn coldplug(events: &UnboundedSender<BackendEvent>) {
    for subsystem in SUBSYSTEMS {
        let class_dir = if subsystem == "usb" {
            PathBuf::from("/sys/bus/usb/devices")
        } else {
            Path::new("/sys/class").join(subsystem)
        };
        let mut entries = match tokio::fs::read_dir(&class_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!("cannot enumerate {}: {err}", class_dir.display());
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            // resolve the class symlink so coldplug paths match uevent paths
            let path = match tokio::fs::canonicalize(entry.path()).await {
                Ok(path) => path,
                Err(_) => entry.path(),
            };
            let Some(path_str) = path.to_str() else {
                continue;
            };
            debug!("coldplug {subsystem} device {path_str}");
            let native = native_from_sysfs(subsystem, path_str).await;
            let _ = events.send(BackendEvent {
                action: BackendAction::Add,
                native,
            });
        }
    }
}

/// Build a native handle from a sysfs directory, pulling the uevent file in
/// as properties (it carries DEVNAME for char devices).
async fn native_from_sysfs(subsystem: &str, path: &str) -> NativeDevice {
    let mut native = NativeDevice::new(subsystem, path);
    if let Ok(contents) = util::read_file(Path::new(path).join("uevent")).await {
        for line in contents.lines() {
            if let Some((key, value)) = line.split_once('=') {
                native.properties.insert(key.to_string(), value.to_string());
            }
        }
    }
    if let Some(devname) = native.properties.get("DEVNAME") {
        native.dev_node = Some(Path::new("/dev").join(devname));
    }
    native
}

/// Decode one kernel uevent datagram: `action@devpath` followed by
/// NUL-separated `KEY=VALUE` pairs. Events for other subsystems, and udevd's
/// own re-broadcasts, yield `None`.
fn parse_uevent(payload: &[u8]) -> Option<BackendEvent> {
    // udevd re-broadcasts carry a "libudev" magic header; we only speak
    // kernel uevents
    if payload.starts_with(b"libudev") {
        return None;
    }
    let mut segments = payload
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(String::from_utf8_lossy);

    let header = segments.next()?.into_owned();
    let (action, devpath) = header.split_once('@')?;

    let mut properties = HashMap::new();
    for segment in segments {
        if let Some((key, value)) = segment.split_once('=') {
            properties.insert(key.to_string(), value.to_string());
        }
    }

    let subsystem = properties.get("SUBSYSTEM")?.clone();
    if !SUBSYSTEMS.contains(&subsystem.as_str()) {
        return None;
    }

    let action = match action {
        "add" => BackendAction::Add,
        "change" => BackendAction::Change,
        "remove" => BackendAction::Remove,
        other => {
            debug!("unhandled action '{other}' on {devpath}");
            return None;
        }
    };

    let mut native = NativeDevice::new(&subsystem, &format!("/sys{devpath}"));
    if let Some(devname) = properties.get("DEVNAME") {
        native.dev_node = Some(Path::new("/dev").join(devname));
    }
    native.properties = properties;
    Some(BackendEvent { action, native })
}
