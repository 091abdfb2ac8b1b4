//! Per-battery time-series with durable persistence.
//!
//! Four series are kept per battery (rate, charge, time-full, time-empty).
//! Appends are deduplicated against the last stored value and saved to disk
//! on a debounced schedule; when the battery is discharging and nearly empty
//! the debounce is bypassed so the data survives a critical shutdown.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::*;
use crate::types::{DeviceState, HistoryType};
use crate::util;

make_log_macro!(debug, "history");

/// Percentage below which a discharging battery saves straight to disk.
const LOW_POWER_CHARGE: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryRecord {
    pub time: u64,
    pub value: f64,
    pub state: DeviceState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsRecord {
    pub value: f64,
    /// 0..100; how much charge-cycle evidence backs this bin.
    pub accuracy: f64,
}

/// What the caller should do about persistence after an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveAction {
    /// Write now; the battery may not live long enough for a debounce.
    Immediate,
    /// Arm a one-shot flush timer for this store.
    Debounce(Duration),
}

#[derive(Debug, Default)]
struct Series {
    data: Vec<HistoryRecord>,
    last_value: Option<f64>,
}

impl Series {
    /// Append if the value differs from the last stored one.
    fn record(&mut self, time: u64, value: f64, state: DeviceState) -> bool {
        if self.last_value == Some(value) {
            return false;
        }
        self.data.push(HistoryRecord { time, value, state });
        self.last_value = Some(value);
        true
    }

    fn to_file_contents(&self) -> String {
        let mut out = String::new();
        for record in &self.data {
            out.push_str(&format!(
                "{}\t{}\t{}\n",
                record.time, record.value, record.state
            ));
        }
        out
    }

    /// Parse a persisted series. Unparseable lines are skipped, not fatal;
    /// a truncated file just yields a shorter series.
    fn load(&mut self, contents: &str) {
        for line in contents.lines() {
            let mut fields = line.split('\t');
            let record = (|| {
                let time = fields.next()?.parse().ok()?;
                let value = fields.next()?.parse().ok()?;
                let state = fields.next()?.parse().ok()?;
                Some(HistoryRecord { time, value, state })
            })();
            match record {
                Some(record) => self.data.push(record),
                None => debug!("skipping corrupt history line: {line:?}"),
            }
        }
        self.last_value = self.data.last().map(|r| r.value);
    }
}

pub struct HistoryStore {
    dir: PathBuf,
    id: Option<String>,
    state: DeviceState,
    rate: Series,
    charge: Series,
    time_full: Series,
    time_empty: Series,
    debounce: Duration,
    dirty: bool,
    save_armed: bool,
}

/// The stable identity of a battery: `model-energy_full_design-serial`, each
/// component only when it carries information, with filesystem-hostile
/// characters replaced.
pub fn battery_id(model: &str, energy_full_design: f64, serial: &str) -> String {
    let mut id = String::new();
    if model.len() > 2 {
        id.push_str(model);
        id.push('-');
    }
    if energy_full_design > 0.0 {
        id.push_str(&format!("{}-", energy_full_design as u64));
    }
    if serial.len() > 2 {
        id.push_str(serial);
        id.push('-');
    }
    if id.is_empty() {
        return "generic_id".into();
    }
    id.pop();
    id.chars()
        .map(|c| match c {
            '\\' | '\t' | '"' | '\'' | ' ' | '/' => '_',
            other => other,
        })
        .collect()
}

impl HistoryStore {
    pub fn new(dir: PathBuf, debounce: Duration) -> Self {
        Self {
            dir,
            id: None,
            state: DeviceState::Unknown,
            rate: Series::default(),
            charge: Series::default(),
            time_full: Series::default(),
            time_empty: Series::default(),
            debounce,
            dirty: false,
            save_armed: false,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Bind the store to a battery identity and load any previous data. The
    /// id can only be set once. A marker record (time 0, state unknown) is
    /// appended to every series so later analysis can tell data recorded
    /// before this daemon run from data recorded after.
    pub fn set_id(&mut self, id: &str) -> bool {
        if self.id.is_some() || id.is_empty() {
            return false;
        }
        debug!("using id: {id}");
        self.id = Some(id.to_string());
        for kind in HistoryType::ALL {
            let path = self.file_path(kind);
            if let Ok(contents) = std::fs::read_to_string(&path) {
                self.series_mut(kind).load(&contents);
            }
            let series = self.series_mut(kind);
            series.data.push(HistoryRecord {
                time: 0,
                value: 0.0,
                state: DeviceState::Unknown,
            });
            series.last_value = None;
        }
        self.dirty = true;
        true
    }

    fn series(&self, kind: HistoryType) -> &Series {
        match kind {
            HistoryType::Rate => &self.rate,
            HistoryType::Charge => &self.charge,
            HistoryType::TimeFull => &self.time_full,
            HistoryType::TimeEmpty => &self.time_empty,
        }
    }

    fn series_mut(&mut self, kind: HistoryType) -> &mut Series {
        match kind {
            HistoryType::Rate => &mut self.rate,
            HistoryType::Charge => &mut self.charge,
            HistoryType::TimeFull => &mut self.time_full,
            HistoryType::TimeEmpty => &mut self.time_empty,
        }
    }

    fn file_path(&self, kind: HistoryType) -> PathBuf {
        let id = self.id.as_deref().unwrap_or("generic_id");
        self.dir.join(format!("history-{}-{}.dat", kind.as_str(), id))
    }

    pub fn set_state(&mut self, state: DeviceState) -> bool {
        if self.id.is_none() {
            return false;
        }
        self.state = state;
        true
    }

    pub fn set_charge(&mut self, percentage: f64) -> bool {
        self.push(HistoryType::Charge, percentage)
    }

    pub fn set_rate(&mut self, rate: f64) -> bool {
        self.push(HistoryType::Rate, rate)
    }

    pub fn set_time_full(&mut self, time: i64) -> bool {
        if time < 0 {
            return false;
        }
        self.push(HistoryType::TimeFull, time as f64)
    }

    pub fn set_time_empty(&mut self, time: i64) -> bool {
        if time < 0 {
            return false;
        }
        self.push(HistoryType::TimeEmpty, time as f64)
    }

    fn push(&mut self, kind: HistoryType, value: f64) -> bool {
        if self.id.is_none() || self.state == DeviceState::Unknown {
            return false;
        }
        let now = util::now_secs();
        let state = self.state;
        if self.series_mut(kind).record(now, value, state) {
            self.dirty = true;
            return true;
        }
        false
    }

    /// True when the battery is running out: the save debounce is skipped to
    /// minimize data loss on a critical shutdown.
    fn is_low_power(&self) -> bool {
        if self.state != DeviceState::Discharging {
            return false;
        }
        match self.charge.data.last() {
            Some(last) => last.state == DeviceState::Discharging && last.value < LOW_POWER_CHARGE,
            None => false,
        }
    }

    /// Decide how the pending data should reach disk, if at all. Arms the
    /// debounce flag; the caller owns the actual timer.
    pub fn plan_save(&mut self) -> Option<SaveAction> {
        if !self.dirty || self.id.is_none() {
            return None;
        }
        if self.is_low_power() {
            return Some(SaveAction::Immediate);
        }
        if self.save_armed {
            return None;
        }
        self.save_armed = true;
        Some(SaveAction::Debounce(self.debounce))
    }

    /// Rewrite all four series files. Whole-file rewrites keep a partially
    /// written file from poisoning more than one save interval.
    pub fn save(&mut self) -> Result<()> {
        if self.id.is_none() {
            return Err(Error::new("no id, cannot save history"));
        }
        std::fs::create_dir_all(&self.dir)
            .or_error(|| format!("failed to create {}", self.dir.display()))?;
        for kind in HistoryType::ALL {
            let path = self.file_path(kind);
            let contents = self.series(kind).to_file_contents();
            std::fs::write(&path, contents)
                .or_error(|| format!("failed to write {}", path.display()))?;
        }
        self.dirty = false;
        self.save_armed = false;
        Ok(())
    }

    pub fn needs_save(&self) -> bool {
        self.dirty
    }

    /// Records from the last `timespan` seconds (with a 5 % grace so a
    /// request for "the last hour" does not flap on the boundary), reduced
    /// to at most `resolution` points. `timespan` of 0 means everything.
    pub fn get_history(
        &self,
        kind: HistoryType,
        timespan: u32,
        resolution: u32,
    ) -> Vec<HistoryRecord> {
        let data = &self.series(kind).data;
        // the unknown markers appended on load have time 0, so the newest
        // record is not necessarily the last one
        let Some(newest) = data.iter().map(|r| r.time).max() else {
            return Vec::new();
        };
        let filtered: Vec<HistoryRecord> = if timespan == 0 {
            data.clone()
        } else {
            let window = (f64::from(timespan) * 0.95) as u64;
            data.iter()
                .filter(|r| newest.saturating_sub(r.time) < window)
                .copied()
                .collect()
        };
        limit_resolution(&filtered, resolution)
    }

    /// The charge/discharge profile: for each integer percentage, how long
    /// this battery historically takes to move through that percent,
    /// relative to its own average (+1.0 = twice the average, -1.0 = half).
    pub fn get_profile(&self, charging: bool) -> Vec<StatsRecord> {
        let wanted = if charging {
            DeviceState::Charging
        } else {
            DeviceState::Discharging
        };
        let mut bins = vec![
            StatsRecord {
                value: 0.0,
                accuracy: 0.0
            };
            101
        ];

        let mut anchor: Option<&HistoryRecord> = None;
        let mut last_state: Option<DeviceState> = None;
        let mut old_bin = usize::MAX;
        for record in &self.charge.data {
            // a state transition invalidates the running timing baseline
            if last_state != Some(record.state) {
                last_state = Some(record.state);
                anchor = Some(record);
                old_bin = bin_of(record.value);
                continue;
            }
            let bin = bin_of(record.value);
            if bin == old_bin {
                continue;
            }
            old_bin = bin;
            if let Some(prev) = anchor {
                let delta = (record.value - prev.value).abs();
                // reject noise and discontinuities
                if delta > 0.01 && delta < 3.0 && record.state == wanted && bin <= 100 {
                    bins[bin].value += record.time.saturating_sub(prev.time) as f64;
                    bins[bin].accuracy += 1.0;
                }
            }
            anchor = Some(record);
        }

        for bin in &mut bins {
            if bin.accuracy > 0.0 {
                bin.value /= bin.accuracy;
            }
        }

        let populated: Vec<f64> = bins
            .iter()
            .filter(|b| b.accuracy > 0.0)
            .map(|b| b.value)
            .collect();
        if !populated.is_empty() {
            let average = populated.iter().sum::<f64>() / populated.len() as f64;
            for bin in &mut bins {
                if bin.accuracy > 0.0 && average > 0.0 {
                    bin.value = (bin.value - average) / average;
                } else {
                    bin.value = 0.0;
                }
            }
        }

        // five observed cycles count as full confidence
        for bin in &mut bins {
            bin.accuracy = (bin.accuracy * 20.0).min(100.0);
        }
        bins
    }
}

fn bin_of(value: f64) -> usize {
    value.round().clamp(0.0, 100.0) as usize
}

/// Reduce a series to at most `max_points` records using time division:
/// divide the covered span into `max_points` equal slots and average each
/// slot, starting a fresh output record whenever the device state changes so
/// no averaged point spans two states.
fn limit_resolution(records: &[HistoryRecord], max_points: u32) -> Vec<HistoryRecord> {
    if records.is_empty() || max_points == 0 {
        return Vec::new();
    }
    if records.len() <= max_points as usize {
        return records.to_vec();
    }
    let newest = records.iter().map(|r| r.time).max().unwrap_or(0);
    let oldest = records.iter().map(|r| r.time).min().unwrap_or(0);
    let step = newest.saturating_sub(oldest) as f64 / f64::from(max_points);
    if step <= 0.0 {
        // all records share a timestamp; averaging per state is all we can do
        let mut out: Vec<HistoryRecord> = Vec::new();
        for record in records {
            match out.last_mut() {
                Some(last) if last.state == record.state => {
                    last.value = (last.value + record.value) / 2.0;
                }
                _ => out.push(*record),
            }
        }
        return out;
    }

    let mut out = Vec::new();
    let mut boundary = newest as f64 - step;
    let mut time_sum: u128 = 0;
    let mut value_sum = 0.0;
    let mut count: u64 = 0;
    let mut state = DeviceState::Unknown;

    for record in records.iter().rev() {
        let crossed = (record.time as f64) < boundary;
        if count > 0 && (crossed || record.state != state) {
            out.push(HistoryRecord {
                time: (time_sum / u128::from(count)) as u64,
                value: value_sum / count as f64,
                state,
            });
            while (record.time as f64) < boundary {
                boundary -= step;
            }
            time_sum = 0;
            value_sum = 0.0;
            count = 0;
        }
        if count == 0 {
            state = record.state;
        }
        time_sum += u128::from(record.time);
        value_sum += record.value;
        count += 1;
    }
    if count > 0 {
        out.push(HistoryRecord {
            time: (time_sum / u128::from(count)) as u64,
            value: value_sum / count as f64,
            state,
        });
    }
    out.reverse();
    out
}
