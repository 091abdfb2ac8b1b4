//! Watts Up? Pro external power meters on a USB serial port.
//!
//! The meter speaks a line protocol at 115200 8N1: commands look like
//! `#R,W,0` and responses are frames of the shape
//! `#<cmd>,<sub>,<N>,<field1>,…,<fieldN>;`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, SetArg,
};

use super::{DeviceData, PollTimings, VariantDriver};
use crate::backend::NativeDevice;
use crate::errors::*;
use crate::types::DeviceType;

make_log_macro!(debug, "wup");

/// Clears the meter's internal memory.
const COMMAND_CLEAR: &str = "#R,W,0";
/// Command character of the periodic data-log record.
const COMMAND_DATA: char = 'd';
/// Position of the watts reading in a data-log record.
const FIELD_WATTS: usize = 0;

/// How long the meter gets to answer the probe.
const PROBE_DELAY: Duration = Duration::from_millis(200);

pub(super) async fn probe(
    native: &NativeDevice,
    data: &mut DeviceData,
) -> Option<Box<dyn VariantDriver>> {
    let node = native.dev_node.as_ref()?;
    // a tty without a backing device is a virtual console
    if !native.sysfs_dir().join("device").exists() {
        return None;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(node)
        .ok()?;
    if !configure_serial(&file) {
        debug!("cannot set speed on {}, not a meter", node.display());
        return None;
    }

    // ask it to clear; a real meter answers with a well-formed frame
    if file.write_all(COMMAND_CLEAR.as_bytes()).is_err() {
        return None;
    }
    tokio::time::sleep(PROBE_DELAY).await;
    let mut buf = [0u8; 256];
    let len = match (&file).read(&mut buf) {
        Ok(len) => len,
        Err(_) => return None,
    };
    let response = String::from_utf8_lossy(&buf[..len]);
    if parse_frame(&response).is_none() {
        debug!("no valid frame from {}", node.display());
        return None;
    }

    data.device_type = DeviceType::Monitor;
    data.vendor = native.property("ID_VENDOR").unwrap_or_default().to_string();
    Some(Box::new(Wup { file }))
}

/// 115200 8N1 raw, parity errors ignored.
fn configure_serial(file: &File) -> bool {
    let Ok(mut tio) = termios::tcgetattr(file) else {
        return false;
    };
    termios::cfmakeraw(&mut tio);
    if termios::cfsetispeed(&mut tio, BaudRate::B115200).is_err()
        || termios::cfsetospeed(&mut tio, BaudRate::B115200).is_err()
    {
        return false;
    }
    let _ = termios::tcflush(file, FlushArg::TCIFLUSH);
    tio.input_flags |= InputFlags::IGNPAR;
    tio.control_flags &= !ControlFlags::CSTOPB;
    termios::tcsetattr(file, SetArg::TCSANOW, &tio).is_ok()
}

pub(super) struct Wup {
    file: File,
}

#[async_trait]
impl VariantDriver for Wup {
    async fn refresh(&mut self, data: &mut DeviceData, _native: &NativeDevice) -> Result<bool> {
        let mut buf = [0u8; 256];
        let len = match (&self.file).read(&mut buf) {
            Ok(len) => len,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                // nothing buffered since the last poll
                return Ok(true);
            }
            Err(err) => return Err(Error::new(format!("meter read failed: {err}"))),
        };
        let text = String::from_utf8_lossy(&buf[..len]);
        match parse_frame(&text) {
            Some(frame) => {
                if let Some(watts) = watts_from_frame(&frame) {
                    data.energy_rate = watts;
                } else {
                    debug!("ignoring command '{}'", frame.command);
                }
            }
            None => debug!("failed to parse {text:?}"),
        }
        Ok(true)
    }

    fn poll_interval(&mut self, _data: &DeviceData, timings: &PollTimings) -> Option<Duration> {
        Some(timings.normal)
    }
}

#[derive(Debug, PartialEq)]
struct Frame {
    command: char,
    subcommand: char,
    fields: Vec<String>,
}

/// Pull one frame out of a dirty byte stream: everything before the first
/// `#` is line noise, everything after the first `;` is the next frame.
fn parse_frame(data: &str) -> Option<Frame> {
    let start = data.find('#')?;
    let packet = data[start..].split(';').next()?;

    let tokens: Vec<&str> = packet.split(',').map(str::trim).collect();
    if tokens.len() < 3 {
        debug!("not enough tokens in {packet:?}");
        return None;
    }

    let mut command_chars = tokens[0].chars();
    if command_chars.next() != Some('#') {
        return None;
    }
    let command = command_chars.next()?;
    if command_chars.next().is_some() {
        debug!("expected command '#?' but got {:?}", tokens[0]);
        return None;
    }

    let mut subcommand_chars = tokens[1].chars();
    let subcommand = subcommand_chars.next()?;
    if subcommand_chars.next().is_some() {
        return None;
    }

    let declared: usize = tokens[2].parse().ok()?;
    let fields: Vec<String> = tokens[3..].iter().map(|s| s.to_string()).collect();
    if declared != fields.len() {
        debug!(
            "field count expected to be {declared} but got {}",
            fields.len()
        );
        return None;
    }

    Some(Frame {
        command,
        subcommand,
        fields,
    })
}

fn watts_from_frame(frame: &Frame) -> Option<f64> {
    if frame.command != COMMAND_DATA {
        return None;
    }
    frame.fields.get(FIELD_WATTS)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_survive_line_noise() {
        let frame = parse_frame("sdfsd#d,-,3, 1052 ,118,60;garbage").unwrap();
        assert_eq!(frame.command, 'd');
        assert_eq!(frame.subcommand, '-');
        assert_eq!(frame.fields, vec!["1052", "118", "60"]);
        assert_eq!(watts_from_frame(&frame), Some(1052.0));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        // no start marker
        assert_eq!(parse_frame("d,-,1,5;"), None);
        // too few tokens
        assert_eq!(parse_frame("#d,-"), None);
        // command must be exactly '#' plus one character
        assert_eq!(parse_frame("#dx,-,1,5;"), None);
        // declared field count must match
        assert_eq!(parse_frame("#d,-,4,1052,118;"), None);
        assert_eq!(parse_frame("#d,-,1,1052,118;"), None);
        // a non-numeric count is no frame at all
        assert_eq!(parse_frame("#d,-,x,1052;"), None);
    }

    #[test]
    fn only_data_records_carry_watts() {
        let frame = parse_frame("#v,-,2,3,1").unwrap();
        assert_eq!(watts_from_frame(&frame), None);
        // the clear command's echo parses but carries nothing
        let frame = parse_frame("#R,W,0").unwrap();
        assert_eq!(frame.fields.len(), 0);
        assert_eq!(watts_from_frame(&frame), None);
    }
}
