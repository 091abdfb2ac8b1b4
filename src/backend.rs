//! Translation of platform events into uniform device add/change/remove
//! notifications. The backends are the only code that knows how to enumerate
//! and observe the host; everything above them is platform-neutral.

pub mod dummy;
pub mod linux;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc::UnboundedSender;

use crate::config::BackendKind;
use crate::errors::*;

/// A platform handle for one device: its stable native path plus whatever
/// else the platform told us about it.
#[derive(Debug, Clone, Default)]
pub struct NativeDevice {
    pub subsystem: String,
    path: String,
    /// The character device node, for subsystems that have one.
    pub dev_node: Option<PathBuf>,
    /// Key/value properties from the platform (uevent environment).
    pub properties: HashMap<String, String>,
}

impl NativeDevice {
    pub fn new(subsystem: &str, path: &str) -> Self {
        Self {
            subsystem: subsystem.to_string(),
            path: path.to_string(),
            dev_node: None,
            properties: HashMap::new(),
        }
    }

    pub fn with_node(mut self, node: PathBuf) -> Self {
        self.dev_node = Some(node);
        self
    }

    /// The stable identifier this device is keyed by.
    pub fn native_path(&self) -> &str {
        &self.path
    }

    /// The sysfs directory backing this device.
    pub fn sysfs_dir(&self) -> &Path {
        Path::new(&self.path)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendAction {
    Add,
    Change,
    Remove,
}

#[derive(Debug)]
pub struct BackendEvent {
    pub action: BackendAction,
    pub native: NativeDevice,
}

/// Start the selected backend: enumerate what is already plugged in and arm
/// the platform's change notification, delivering everything as events.
pub fn start(kind: BackendKind, events: UnboundedSender<BackendEvent>) -> Result<()> {
    match kind {
        BackendKind::Linux => linux::spawn(events),
        BackendKind::Dummy => dummy::spawn(events),
    }
}
