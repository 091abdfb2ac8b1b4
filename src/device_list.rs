//! The authoritative collection of live devices, keyed by native path with
//! insertion-order iteration.

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::Mutex;

use crate::device::Device;

make_log_macro!(debug, "device_list");

pub type SharedDevice = Arc<Mutex<Device>>;

/// An insertion-ordered map from native path to device. The map and the
/// iteration sequence are the same structure, so they cannot drift apart.
#[derive(Default)]
pub struct DeviceList {
    devices: IndexMap<String, SharedDevice>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the device for a native path. Empty paths never match.
    pub fn lookup(&self, native_path: &str) -> Option<SharedDevice> {
        if native_path.is_empty() {
            return None;
        }
        self.devices.get(native_path).cloned()
    }

    /// Record a new association. Fails on an empty path, and on a path that
    /// is already known — callers must treat that as "use lookup instead".
    pub fn insert(&mut self, native_path: &str, device: SharedDevice) -> bool {
        if native_path.is_empty() {
            debug!("refusing to insert device with empty native path");
            return false;
        }
        if self.devices.contains_key(native_path) {
            debug!("{native_path} already known");
            return false;
        }
        self.devices.insert(native_path.to_string(), device);
        debug!("added {native_path}");
        true
    }

    /// Remove every association pointing at this device, preserving the
    /// order of the remaining entries.
    pub fn remove(&mut self, device: &SharedDevice) -> bool {
        let before = self.devices.len();
        self.devices
            .retain(|_, candidate| !Arc::ptr_eq(candidate, device));
        before != self.devices.len()
    }

    /// A snapshot for read-only iteration, so no lock is held across
    /// callbacks that may re-enter the list.
    pub fn snapshot(&self) -> Vec<SharedDevice> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NativeDevice;

    fn fake_device(path: &str) -> SharedDevice {
        Arc::new(Mutex::new(Device::for_tests(NativeDevice::new(
            "power_supply",
            path,
        ))))
    }

    #[test]
    fn insert_lookup_remove() {
        let mut list = DeviceList::new();
        let a = fake_device("/sys/a");
        let b = fake_device("/sys/b");

        assert!(list.insert("/sys/a", a.clone()));
        assert!(list.insert("/sys/b", b.clone()));
        assert!(!list.insert("/sys/a", b.clone()), "duplicate key accepted");
        assert!(!list.insert("", a.clone()), "empty key accepted");

        assert!(list.lookup("/sys/a").is_some());
        assert!(list.lookup("").is_none());
        assert!(list.lookup("/sys/c").is_none());

        assert!(list.remove(&a));
        assert!(!list.remove(&a), "double remove reported success");
        assert_eq!(list.len(), 1);
        assert!(list.lookup("/sys/a").is_none());
    }

    #[test]
    fn iteration_keeps_insertion_order() {
        let mut list = DeviceList::new();
        for path in ["/sys/c", "/sys/a", "/sys/b"] {
            list.insert(path, fake_device(path));
        }
        list.remove(&list.lookup("/sys/a").unwrap());

        let snapshot = list.snapshot();
        assert_eq!(snapshot.len(), 2);
        // still the order the devices appeared in, not sorted
        assert!(Arc::ptr_eq(&snapshot[0], &list.lookup("/sys/c").unwrap()));
        assert!(Arc::ptr_eq(&snapshot[1], &list.lookup("/sys/b").unwrap()));
    }
}
