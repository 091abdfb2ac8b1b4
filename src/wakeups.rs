//! Sampling of kernel interrupt counters and userspace timer statistics,
//! reduced to wakeups-per-second per source plus a smoothed system total.

use std::path::Path;

use crate::util;

make_log_macro!(debug, "wakeups");

pub const KERNEL_SOURCE: &str = "/proc/interrupts";
pub const USERSPACE_SOURCE: &str = "/proc/timer_stats";
pub const POLL_INTERVAL_SECS: u64 = 2;

/// Sources below this rate are noise and not reported.
const SMALLEST_VALUE: f64 = 0.1;
/// EMA factor for the system total.
const TOTAL_SMOOTH_FACTOR: f64 = 0.125;

/// Symbolic x86 IPI rows in `/proc/interrupts` get synthetic ids above the
/// hardware IRQ range.
const SPECIAL_IRQS: [(&str, u32); 9] = [
    ("NMI", 0xff0),
    ("LOC", 0xff1),
    ("RES", 0xff2),
    ("CAL", 0xff3),
    ("TLB", 0xff4),
    ("TRM", 0xff5),
    ("SPU", 0xff6),
    ("ERR", 0xff7),
    ("MIS", 0xff8),
];

#[derive(Debug, Clone)]
pub struct WakeupsEntry {
    pub id: u32,
    pub is_userspace: bool,
    pub cmdline: String,
    pub details: String,
    pub value: f64,
    old: u64,
}

#[derive(Default)]
pub struct WakeupsMonitor {
    data: Vec<WakeupsEntry>,
    total_old: u32,
    total_ave: f64,
}

impl WakeupsMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The smoothed total wakeups per second, if we have seen any data.
    pub fn total(&self) -> Option<u32> {
        if self.total_ave <= 0.0 {
            None
        } else {
            Some(self.total_ave.round() as u32)
        }
    }

    /// All sources above the noise floor, busiest first.
    pub fn data(&self) -> Vec<WakeupsEntry> {
        let mut out: Vec<WakeupsEntry> = self
            .data
            .iter()
            .filter(|e| e.value > SMALLEST_VALUE)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.value.total_cmp(&a.value));
        out
    }

    fn entry_mut(&mut self, id: u32) -> &mut WakeupsEntry {
        if let Some(index) = self.data.iter().position(|e| e.id == id) {
            return &mut self.data[index];
        }
        self.data.push(WakeupsEntry {
            id,
            is_userspace: false,
            cmdline: String::new(),
            details: String::new(),
            value: 0.0,
            old: 0,
        });
        self.data.last_mut().expect("just pushed")
    }

    /// Fold one `/proc/interrupts` snapshot in. `interval` is the seconds
    /// since the previous snapshot.
    pub fn sample_kernel(&mut self, contents: &str, interval: f64) {
        for entry in &mut self.data {
            if !entry.is_userspace {
                entry.value = 0.0;
            }
        }

        let mut lines = contents.lines();
        let cpus = match lines.next() {
            Some(header) => header.split_whitespace().count(),
            None => return,
        };
        if cpus == 0 {
            return;
        }

        for line in lines {
            let Some((name, rest)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            let (irq, special_ipi) = match SPECIAL_IRQS.iter().find(|(n, _)| *n == name) {
                Some((_, id)) => (*id, true),
                None => match name.parse() {
                    Ok(irq) => (irq, false),
                    Err(_) => continue,
                },
            };

            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() < cpus + 1 {
                continue;
            }
            let mut interrupts: u64 = 0;
            let mut ok = true;
            for field in &fields[..cpus] {
                match field.parse::<u64>() {
                    Ok(count) => interrupts += count,
                    Err(_) => {
                        ok = false;
                        break;
                    }
                }
            }
            if !ok || interrupts == 0 {
                continue;
            }
            let details = fields[cpus..].join(" ");

            let entry = self.entry_mut(irq);
            if entry.details.is_empty() {
                entry.details = clean_irq_details(&details);
                entry.cmdline = if special_ipi { "kernel-ipi" } else { "interrupt" }.into();
                entry.is_userspace = false;
            }
            if entry.old > 0 && interval > 0.0 {
                entry.value = interrupts.saturating_sub(entry.old) as f64 / interval;
            }
            entry.old = interrupts;
        }
    }

    /// Fold one `/proc/timer_stats` snapshot in. `cmdline_of` resolves a pid
    /// to a command line, injectable so the parser is testable.
    pub fn sample_userspace(&mut self, contents: &str, cmdline_of: impl Fn(u32) -> Option<String>) {
        for entry in &mut self.data {
            if entry.is_userspace {
                entry.value = 0.0;
            }
        }

        let mut period = 5.0f64;
        for line in contents.lines() {
            if line.contains("Timer Stats Version:") || line.contains("events/sec") {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if line.contains("Sample period:") {
                if let Some(value) = fields.get(2).and_then(|v| v.parse().ok()) {
                    period = value;
                }
                continue;
            }
            if fields.len() < 4 {
                continue;
            }

            // "  76D,  2522 firefox  hrtimer_start_range_ns (hrtimer_wakeup)"
            let count_field = fields[0].trim_end_matches(',');
            if count_field.contains('D') {
                // deferred timers don't cause wakeups
                continue;
            }
            let Ok(count) = count_field.parse::<u64>() else {
                continue;
            };
            if count == 0 {
                continue;
            }
            let Ok(pid) = fields[1].parse::<u32>() else {
                continue;
            };
            let comm = fields[2];
            let function = fields[3..].join(" ");
            if is_tick_housekeeping(&function) {
                continue;
            }

            let entry = self.entry_mut(pid);
            if entry.details.is_empty() {
                if matches!(comm, "insmod" | "modprobe" | "swapper") {
                    entry.cmdline = comm.into();
                    entry.is_userspace = false;
                } else {
                    entry.cmdline = cmdline_of(pid).unwrap_or_else(|| comm.into());
                    entry.is_userspace = true;
                }
                entry.details = function;
            }
            if period > 0.0 {
                entry.value = count as f64 / period;
            }
        }
    }

    /// Recompute the smoothed total. Returns the new value when it moved.
    pub fn update_total(&mut self) -> Option<u32> {
        let total = self.data.iter().map(|e| e.value).sum::<f64>().round() as u32;
        if total == self.total_old {
            return None;
        }
        if self.total_old == 0 {
            self.total_ave = f64::from(total);
        } else {
            self.total_ave =
                TOTAL_SMOOTH_FACTOR * f64::from(total) + (1.0 - TOTAL_SMOOTH_FACTOR) * self.total_ave;
        }
        self.total_old = total;
        Some(self.total_ave.round() as u32)
    }

    /// Read and fold in both kernel and userspace sources.
    pub async fn poll(&mut self) -> Option<u32> {
        match util::read_file(KERNEL_SOURCE).await {
            Ok(contents) => self.sample_kernel(&contents, POLL_INTERVAL_SECS as f64),
            Err(err) => debug!("failed to read {KERNEL_SOURCE}: {err}"),
        }
        match util::read_file(USERSPACE_SOURCE).await {
            Ok(contents) => self.sample_userspace(&contents, cmdline_from_proc),
            Err(err) => debug!("failed to read {USERSPACE_SOURCE}: {err}"),
        }
        self.update_total()
    }
}

fn is_tick_housekeeping(function: &str) -> bool {
    function
        .split(|c| c == ' ' || c == '(' || c == ')')
        .any(|word| {
            word.starts_with("tick_nohz_")
                || word.starts_with("tick_setup_sched_timer")
                || word == "tick_sched_timer"
        })
}

/// Drop the interrupt-chip noise so only the driver names remain.
fn clean_irq_details(details: &str) -> String {
    for marker in ["IO-APIC-fasteoi", "IO-APIC-edge"] {
        if let Some(index) = details.find(marker) {
            return details[index + marker.len()..].trim_start().to_string();
        }
    }
    details.to_string()
}

fn cmdline_from_proc(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let cmdline: String = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part))
        .collect::<Vec<_>>()
        .join(" ");
    if cmdline.is_empty() { None } else { Some(cmdline) }
}

/// Arm or disarm kernel timer statistics collection.
pub fn set_timer_stats(path: &Path, enable: bool) {
    let value = if enable { "1\n" } else { "0\n" };
    if let Err(err) = std::fs::write(path, value) {
        debug!("cannot toggle {}: {err}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERRUPTS_T0: &str = "\
            CPU0       CPU1
   9:      29730        365   IO-APIC-fasteoi   acpi
  16:       1200        100   IO-APIC-edge   i8042
 NMI:         10         10   Non-maskable interrupts
 ERR:          0
";

    const INTERRUPTS_T1: &str = "\
            CPU0       CPU1
   9:      29750        385   IO-APIC-fasteoi   acpi
  16:       1200        100   IO-APIC-edge   i8042
 NMI:         12         12   Non-maskable interrupts
 ERR:          0
";

    #[test]
    fn kernel_rates_come_from_deltas() {
        let mut monitor = WakeupsMonitor::new();
        monitor.sample_kernel(INTERRUPTS_T0, 2.0);
        // first sample only seeds the counters
        assert!(monitor.data.iter().all(|e| e.value == 0.0));

        monitor.sample_kernel(INTERRUPTS_T1, 2.0);
        let acpi = monitor.data.iter().find(|e| e.id == 9).unwrap();
        assert_eq!(acpi.value, 20.0); // 40 interrupts over 2 s
        assert_eq!(acpi.details, "acpi");
        assert_eq!(acpi.cmdline, "interrupt");
        assert!(!acpi.is_userspace);

        let keyboard = monitor.data.iter().find(|e| e.id == 16).unwrap();
        assert_eq!(keyboard.value, 0.0);
        assert_eq!(keyboard.details, "i8042");

        let nmi = monitor.data.iter().find(|e| e.id == 0xff0).unwrap();
        assert_eq!(nmi.cmdline, "kernel-ipi");
        assert_eq!(nmi.value, 2.0);

        // the short ERR row has no per-CPU columns and is skipped
        assert!(!monitor.data.iter().any(|e| e.id == 0xff7));
    }

    const TIMER_STATS: &str = "\
Timer Stats Version: v0.2
Sample period: 4.000 s
  76,     0 swapper          hrtimer_start_range_ns (tick_sched_timer)
  40,  2522 firefox          hrtimer_start_range_ns (hrtimer_wakeup)
  10D,  123 deferred-thing   hrtimer_start_range_ns (hrtimer_wakeup)
   0,  999 idle             hrtimer_start (hrtimer_wakeup)
   8,  2523 compositor       tick_nohz_restart_sched_tick (tick_sched_timer)
984 total events, 253.0 events/sec
";

    #[test]
    fn userspace_rows_are_filtered_and_rated() {
        let mut monitor = WakeupsMonitor::new();
        monitor.sample_userspace(TIMER_STATS, |pid| {
            (pid == 2522).then(|| "/usr/lib/firefox/firefox".to_string())
        });

        let firefox = monitor.data.iter().find(|e| e.id == 2522).unwrap();
        assert_eq!(firefox.value, 10.0); // 40 events over 4 s
        assert_eq!(firefox.cmdline, "/usr/lib/firefox/firefox");
        assert!(firefox.is_userspace);

        // swapper rows count as kernel, not userspace, but the tick
        // housekeeping callback removes this one entirely
        assert!(!monitor.data.iter().any(|e| e.id == 0));
        // deferred, zero-count and tick rows never make it in
        assert!(!monitor.data.iter().any(|e| e.id == 123));
        assert!(!monitor.data.iter().any(|e| e.id == 999));
        assert!(!monitor.data.iter().any(|e| e.id == 2523));
    }

    #[test]
    fn total_smoothing_seeds_then_averages() {
        let mut monitor = WakeupsMonitor::new();
        monitor.sample_kernel(INTERRUPTS_T0, 2.0);
        monitor.sample_kernel(INTERRUPTS_T1, 2.0);
        // first nonzero total seeds the average directly: 20 + 2 = 22
        assert_eq!(monitor.update_total(), Some(22));
        assert_eq!(monitor.total(), Some(22));

        monitor
            .data
            .iter_mut()
            .for_each(|e| e.value = if e.id == 9 { 120.0 } else { 0.0 });
        // 0.125 * 120 + 0.875 * 22 = 34.25
        assert_eq!(monitor.update_total(), Some(34));
        // unchanged total reports nothing new
        assert_eq!(monitor.update_total(), None);
    }

    #[test]
    fn data_is_sorted_and_noise_is_dropped() {
        let mut monitor = WakeupsMonitor::new();
        monitor.sample_kernel(INTERRUPTS_T0, 2.0);
        monitor.sample_kernel(INTERRUPTS_T1, 2.0);
        let data = monitor.data();
        assert_eq!(data.len(), 2);
        assert!(data[0].value >= data[1].value);
        assert_eq!(data[0].id, 9);
    }
}
