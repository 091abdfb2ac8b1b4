//! System sleep capability probes and the pm-utils helper invocations, plus
//! the authorization seam that gates the privileged ones.

use std::process::Stdio;

use tokio::process::Command;

use crate::config::HookPaths;
use crate::errors::*;
use crate::util;

make_log_macro!(debug, "hooks");

pub const SLEEP_STATE_PATH: &str = "/sys/power/state";
pub const MEMINFO_PATH: &str = "/proc/meminfo";

/// If active memory exceeds this share of free swap, a hibernate image may
/// not fit and hibernate is disabled.
pub const SWAP_WATERLINE: f64 = 80.0;

/// What the kernel advertises in `/sys/power/state`.
pub fn parse_sleep_states(contents: &str) -> (bool, bool) {
    let states: Vec<&str> = contents.split_whitespace().collect();
    (states.contains(&"mem"), states.contains(&"disk"))
}

/// How close we are to not fitting a hibernate image: `100 · Active /
/// SwapFree`, from `/proc/meminfo` contents. 0 when either value is missing.
pub fn swap_waterline(meminfo: &str) -> f64 {
    let mut active: u64 = 0;
    let mut swap_free: u64 = 0;
    for line in meminfo.lines() {
        let mut fields = line.split_whitespace();
        let Some(key) = fields.next() else { continue };
        let Some(value) = fields.next().and_then(|v| v.parse().ok()) else {
            continue;
        };
        match key {
            "Active:" => active = value,
            "SwapFree:" => swap_free = value,
            _ => {}
        }
    }
    if active == 0 || swap_free == 0 {
        return 0.0;
    }
    active as f64 * 100.0 / swap_free as f64
}

/// Probe what this system can do: `(can_suspend, can_hibernate)`. Hibernate
/// additionally requires enough free swap for the image.
pub async fn sleep_capabilities() -> (bool, bool) {
    let contents = match util::read_file(SLEEP_STATE_PATH).await {
        Ok(contents) => contents,
        Err(err) => {
            log::warn!("failed to read {SLEEP_STATE_PATH}: {err}");
            return (false, false);
        }
    };
    let (can_suspend, mut can_hibernate) = parse_sleep_states(&contents);

    if can_hibernate {
        match util::read_file(MEMINFO_PATH).await {
            Ok(meminfo) => {
                let waterline = swap_waterline(&meminfo);
                debug!("swap waterline at {waterline:.1}%");
                if waterline > SWAP_WATERLINE {
                    debug!("not enough swap to enable hibernate");
                    can_hibernate = false;
                }
            }
            Err(err) => log::warn!("failed to read {MEMINFO_PATH}: {err}"),
        }
    }
    (can_suspend, can_hibernate)
}

/// Tell pm-utils which power policy to apply. Fire and forget: the scripts
/// are advisory and a failure only costs some power.
pub fn run_powersave(hooks: &HookPaths, on_battery: bool) {
    let helper = hooks.powersave.clone();
    let arg = if on_battery { "true" } else { "false" };
    debug!("executing {helper} {arg}");
    match Command::new(&helper)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(mut child) => {
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if !status.success() => {
                        log::warn!("{helper} exited with {status}");
                    }
                    Ok(_) => {}
                    Err(err) => log::warn!("failed to wait for {helper}: {err}"),
                }
            });
        }
        Err(err) => log::warn!("failed to run {helper}: {err}"),
    }
}

/// Run a suspend or hibernate helper to completion. Output is captured so a
/// failure can be reported with its stdout/stderr attached.
pub async fn run_sleep_helper(helper: &str) -> Result<(), DaemonError> {
    debug!("executing {helper}");
    let output = Command::new(helper)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| DaemonError::HookFailed {
            helper: helper.to_string(),
            detail: format!("failed to spawn: {err}"),
        })?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        log::warn!("{helper} failed: status={} stdout={stdout:?} stderr={stderr:?}", output.status);
        return Err(DaemonError::HookFailed {
            helper: helper.to_string(),
            detail: format!("status {}: {}", output.status, stderr.trim()),
        });
    }
    Ok(())
}

/// The authorization decision for privileged operations. The polkit
/// integration of a full desktop stack plugs in here; the shipped default
/// defers to the bus policy, which already restricts who can talk to us.
pub trait AuthCheck: Send + Sync {
    fn check(&self, subject: &str, action_id: &'static str) -> bool;
}

/// Allow everything the bus let through, with an audit line.
pub struct BusPolicyAuth;

impl AuthCheck for BusPolicyAuth {
    fn check(&self, subject: &str, action_id: &'static str) -> bool {
        debug!("allowing {action_id} for {subject} (bus policy)");
        true
    }
}

/// Refuse everything; used by tests exercising the denial path.
pub struct DenyAll;

impl AuthCheck for DenyAll {
    fn check(&self, _subject: &str, _action_id: &'static str) -> bool {
        false
    }
}

pub const ACTION_SUSPEND: &str = "org.freedesktop.powerkit.suspend";
pub const ACTION_HIBERNATE: &str = "org.freedesktop.powerkit.hibernate";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_state_parsing() {
        assert_eq!(parse_sleep_states("freeze mem disk"), (true, true));
        assert_eq!(parse_sleep_states("freeze mem"), (true, false));
        assert_eq!(parse_sleep_states("disk"), (false, true));
        assert_eq!(parse_sleep_states(""), (false, false));
        // "standby" must not match "disk" or "mem" by substring
        assert_eq!(parse_sleep_states("standby memx"), (false, false));
    }

    #[test]
    fn swap_waterline_from_meminfo() {
        let meminfo = "\
MemTotal:       16000000 kB
Active:          4000000 kB
SwapTotal:       8000000 kB
SwapFree:        8000000 kB
";
        assert_eq!(swap_waterline(meminfo), 50.0);

        let tight = "\
Active:          7000000 kB
SwapFree:        8000000 kB
";
        assert!(swap_waterline(tight) > SWAP_WATERLINE);
        assert_eq!(swap_waterline("MemTotal: 1 kB\n"), 0.0);
    }

    #[tokio::test]
    async fn failed_helper_is_surfaced() {
        let err = run_sleep_helper("/bin/false").await.unwrap_err();
        match err {
            DaemonError::HookFailed { helper, .. } => assert_eq!(helper, "/bin/false"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(run_sleep_helper("/bin/true").await.is_ok());
    }

    #[test]
    fn auth_seams() {
        assert!(BusPolicyAuth.check(":1.42", ACTION_SUSPEND));
        assert!(!DenyAll.check(":1.42", ACTION_HIBERNATE));
    }
}
