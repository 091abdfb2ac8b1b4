//! The lid-switch observer: an input device with the SW_LID capability,
//! feeding lid open/close transitions into the daemon.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::UnboundedSender;

use crate::backend::NativeDevice;
use crate::util;

make_log_macro!(debug, "lid");

const EV_SW: u16 = 0x05;
const SW_LID: u16 = 0x00;

/// `struct input_event` on 64-bit: 16 bytes of timestamp, type, code, value.
const INPUT_EVENT_SIZE: usize = 24;

nix::ioctl_read_buf!(eviocgsw, b'E', 0x1b, u8);

pub struct LidSwitch {
    file: File,
}

impl LidSwitch {
    /// Attach to an input device if it is a lid switch; anything else is
    /// rejected silently.
    pub async fn probe(native: &NativeDevice) -> Option<Self> {
        let dir = native.sysfs_dir();
        let mask = match util::read_file(dir.join("device/capabilities/sw")).await {
            Ok(mask) => mask,
            Err(_) => util::read_file(dir.join("capabilities/sw")).await.ok()?,
        };
        if !sw_mask_has_lid(&mask) {
            return None;
        }

        let node = native.dev_node.as_ref()?;
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(node)
            .ok()?;
        debug!("found lid switch at {}", node.display());
        Some(Self { file })
    }

    /// The switch state right now, straight from the kernel.
    pub fn is_closed(&self) -> bool {
        let mut switches = [0u8; 16];
        if unsafe { eviocgsw(self.file.as_raw_fd(), &mut switches) }.is_err() {
            return false;
        }
        switches[usize::from(SW_LID / 8)] & (1 << (SW_LID % 8)) != 0
    }

    /// Watch the event node and report every lid transition. Runs until the
    /// receiver goes away or the device node dies.
    pub fn watch(self, lid_events: UnboundedSender<bool>) {
        tokio::spawn(async move {
            let Ok(async_fd) = AsyncFd::new(self.file) else {
                log::warn!("cannot watch lid switch");
                return;
            };
            let mut buf = [0u8; INPUT_EVENT_SIZE * 16];
            loop {
                let Ok(mut guard) = async_fd.readable().await else {
                    return;
                };
                match guard.try_io(|inner| (inner.get_ref()).read(&mut buf)) {
                    Ok(Ok(0)) => return,
                    Ok(Ok(len)) => {
                        for closed in lid_transitions(&buf[..len]) {
                            if lid_events.send(closed).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Err(err)) => {
                        debug!("lid switch read failed: {err}");
                        return;
                    }
                    Err(_would_block) => continue,
                }
            }
        });
    }
}

/// Decode SW_LID transitions out of a raw `input_event` buffer.
fn lid_transitions(buf: &[u8]) -> Vec<bool> {
    let mut out = Vec::new();
    for event in buf.chunks_exact(INPUT_EVENT_SIZE) {
        let event_type = u16::from_ne_bytes(event[16..18].try_into().expect("sized chunk"));
        let code = u16::from_ne_bytes(event[18..20].try_into().expect("sized chunk"));
        let value = i32::from_ne_bytes(event[20..24].try_into().expect("sized chunk"));
        if event_type == EV_SW && code == SW_LID {
            out.push(value != 0);
        }
    }
    out
}

/// Whether an input device's switch capability bitmask includes SW_LID.
/// The mask is hex words separated by spaces, least significant word last.
fn sw_mask_has_lid(mask: &str) -> bool {
    let Some(low_word) = mask.split_whitespace().last() else {
        return false;
    };
    match u64::from_str_radix(low_word, 16) {
        Ok(word) => word & (1 << SW_LID) != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sw_mask_detection() {
        assert!(sw_mask_has_lid("1"));
        assert!(sw_mask_has_lid("3"));
        assert!(sw_mask_has_lid("20 1"));
        assert!(!sw_mask_has_lid("2"));
        assert!(!sw_mask_has_lid("0"));
        assert!(!sw_mask_has_lid(""));
        assert!(!sw_mask_has_lid("zz"));
    }

    #[test]
    fn transitions_are_decoded_from_raw_events() {
        let mut buf = Vec::new();
        // lid closed
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(&EV_SW.to_ne_bytes());
        buf.extend_from_slice(&SW_LID.to_ne_bytes());
        buf.extend_from_slice(&1i32.to_ne_bytes());
        // a key event that must be ignored
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(&1u16.to_ne_bytes());
        buf.extend_from_slice(&30u16.to_ne_bytes());
        buf.extend_from_slice(&1i32.to_ne_bytes());
        // lid opened
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(&EV_SW.to_ne_bytes());
        buf.extend_from_slice(&SW_LID.to_ne_bytes());
        buf.extend_from_slice(&0i32.to_ne_bytes());

        assert_eq!(lid_transitions(&buf), vec![true, false]);
    }
}
