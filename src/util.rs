use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;

use crate::errors::*;

/// Defines a module-local log macro with a fixed target, so `RUST_LOG` can
/// filter per subsystem (e.g. `RUST_LOG=supply=debug`).
macro_rules! make_log_macro {
    (@wdoll $macro_name:ident, $target:literal, ($dol:tt)) => {
        #[allow(dead_code, unused_macros)]
        macro_rules! $macro_name {
            ($dol($args:tt)+) => {
                ::log::$macro_name!(target: $target, $dol($args)+)
            };
        }
    };
    ($macro_name:ident, $target:literal) => {
        make_log_macro!(@wdoll $macro_name, $target, ($));
    };
}

pub fn default<T: Default>() -> T {
    T::default()
}

/// Read a file to a string, stripping the trailing newline.
pub async fn read_file(path: impl AsRef<Path>) -> std::io::Result<String> {
    let mut content = tokio::fs::read_to_string(path).await?;
    if content.ends_with('\n') {
        content.pop();
    }
    Ok(content)
}

/// Read and parse a single sysfs attribute. Missing or malformed attributes
/// are `None` — sysfs files come and go with the hardware.
pub async fn read_prop<T: FromStr + Send>(dir: &Path, attr: &str) -> Option<T> {
    read_file(dir.join(attr))
        .await
        .ok()
        .and_then(|x| x.trim().parse().ok())
}

/// Like [`read_prop`], but treats the attribute as a `0`/`1` boolean.
pub async fn read_prop_bool(dir: &Path, attr: &str) -> Option<bool> {
    read_prop::<u8>(dir, attr).await.map(|v| v != 0)
}

/// Read a sysfs string attribute with surrounding whitespace stripped and
/// non-printable characters removed (vendor strings are not to be trusted).
pub async fn read_prop_string(dir: &Path, attr: &str) -> Option<String> {
    let raw = read_file(dir.join(attr)).await.ok()?;
    let cleaned: String = raw.trim().chars().filter(|c| !c.is_control()).collect();
    Some(cleaned)
}

pub fn deserialize_toml_file<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .or_error(|| format!("Failed to read file: {}", path.display()))?;
    toml::from_str(&contents).map_err(|err| {
        let location = err
            .span()
            .map(|span| format!(" at {}..{}", span.start, span.end))
            .unwrap_or_default();
        Error::new(format!(
            "Failed to deserialize TOML file {}{}: {}",
            path.display(),
            location,
            err.message()
        ))
    })
}

/// Seconds since the epoch; the daemon's notion of "now" for update stamps
/// and history records.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[tokio::test]
    async fn read_prop_parses_and_rejects() {
        let dir = scratch_dir("util");
        write_attr(&dir, "energy_now", "6000000");
        write_attr(&dir, "status", "Charging");
        assert_eq!(read_prop::<u64>(&dir, "energy_now").await, Some(6_000_000));
        assert_eq!(read_prop::<u64>(&dir, "status").await, None);
        assert_eq!(read_prop::<u64>(&dir, "absent").await, None);
    }

    #[tokio::test]
    async fn strings_are_sanitized() {
        let dir = scratch_dir("util");
        write_attr(&dir, "model_name", "  DELL X\u{7}123  ");
        assert_eq!(
            read_prop_string(&dir, "model_name").await.as_deref(),
            Some("DELL X123")
        );
    }
}
