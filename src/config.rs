use std::path::{Path, PathBuf};

use serde::Deserialize;
use smart_default::SmartDefault;

use crate::errors::*;
use crate::util;

make_log_macro!(debug, "config");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Linux,
    /// A synthetic single-battery backend, for development and tests.
    Dummy,
}

/// External helper binaries the daemon shells out to. Overridable so tests
/// and odd distributions can point elsewhere.
#[derive(Debug, Clone, Deserialize, SmartDefault)]
#[serde(deny_unknown_fields, default)]
pub struct HookPaths {
    #[default("/usr/sbin/pm-powersave".into())]
    pub powersave: String,
    #[default("/usr/sbin/pm-suspend".into())]
    pub suspend: String,
    #[default("/usr/sbin/pm-hibernate".into())]
    pub hibernate: String,
}

#[derive(Debug, Clone, Deserialize, SmartDefault)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Where per-battery history files live.
    #[default("/var/lib/powerkitd".into())]
    pub localstate_dir: String,

    pub backend: BackendKind,

    /// Regular device poll cadence, seconds.
    #[default(30)]
    pub poll_interval: u64,

    /// Fast poll cadence while a battery reports an unknown state, seconds.
    #[default(2)]
    pub unknown_poll_interval: u64,

    /// How many fast polls to attempt before falling back to the regular
    /// cadence.
    #[default(30)]
    pub unknown_poll_retries: u32,

    /// Debounce window for history saves, seconds.
    #[default(5)]
    pub history_save_interval: u64,

    /// Batteries below this percentage count as low.
    #[default(10.0)]
    pub low_battery_threshold: f64,

    pub hooks: HookPaths,
}

impl Config {
    /// Load the configuration, or fall back to the defaults when the file
    /// does not exist. A file that exists but fails to parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        util::deserialize_toml_file(path)
    }

    pub fn state_dir(&self) -> PathBuf {
        match shellexpand::full(&self.localstate_dir) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => PathBuf::from(&self.localstate_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::scratch_dir;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.backend, BackendKind::Linux);
        assert_eq!(config.poll_interval, 30);
        assert_eq!(config.unknown_poll_interval, 2);
        assert_eq!(config.history_save_interval, 5);
        assert_eq!(config.hooks.powersave, "/usr/sbin/pm-powersave");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/powerkitd.toml")).unwrap();
        assert_eq!(config.low_battery_threshold, 10.0);
    }

    #[test]
    fn parses_overrides_and_rejects_unknown_keys() {
        let dir = scratch_dir("config");
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            "localstate_dir = \"/tmp/pk\"\nbackend = \"dummy\"\npoll_interval = 5\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.backend, BackendKind::Dummy);
        assert_eq!(config.poll_interval, 5);
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/pk"));

        std::fs::write(&path, "not_a_key = true\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
