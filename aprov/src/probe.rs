use std::collections::HashMap;
use std::time::Duration;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::Serialize;

use crate::adb::{Adb, ShellRequest};

/// Ephemeral users landed in Android 8.0.
pub const EPHEMERAL_USER_MIN_SDK: u32 = 26;
/// Multi-user mode is generally usable from Lollipop on, even when
/// `pm get-max-users` under-reports.
pub const MULTI_USER_MIN_SDK: u32 = 21;
/// `-g` (grant all runtime permissions) exists from Marshmallow on.
pub const RUNTIME_PERMISSION_MIN_SDK: u32 = 23;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What a device supports, probed once per session and cached by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCapabilities {
    pub device_id: String,
    pub root_access: bool,
    /// A `resetprop` binary is reachable through `su` - the actual tool is
    /// what matters, not which root manager shipped it.
    pub resetprop_available: bool,
    pub multi_user_support: bool,
    pub ephemeral_user_support: bool,
    pub sdk_version: u32,
}

impl DeviceCapabilities {
    pub fn can_spoof_properties(&self) -> bool {
        self.root_access && self.resetprop_available
    }
}

lazy_static! {
    static ref MAX_USERS_RE: Regex =
        Regex::new(r"(?i)Maximum supported users:\s*(\d+)").expect("static regex");
    static ref ANY_NUMBER_RE: Regex = Regex::new(r"(\d+)").expect("static regex");
}

fn parse_max_users(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(caps) = MAX_USERS_RE.captures(text) {
        return caps[1].parse().ok();
    }
    if let Ok(v) = text.parse::<u32>() {
        return Some(v);
    }
    // last resort for unexpected vendor phrasing
    ANY_NUMBER_RE
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
}

/// Probes a device's capabilities. Every sub-probe is best-effort: a failing
/// query leaves the corresponding capability at its default instead of
/// aborting the probe. Always re-queries; use [CapabilityCache] to hold the
/// result for a session.
pub fn detect_capabilities(adb: &dyn Adb, device: &str) -> DeviceCapabilities {
    let mut caps = DeviceCapabilities {
        device_id: device.to_string(),
        ..DeviceCapabilities::default()
    };

    if let Ok(sdk) = adb.getprop(device, "ro.build.version.sdk").parse::<u32>() {
        caps.sdk_version = sdk;
        caps.ephemeral_user_support = sdk >= EPHEMERAL_USER_MIN_SDK;
    }

    let res = adb.shell(
        device,
        &ShellRequest::new(["pm", "get-max-users"]).timeout(PROBE_TIMEOUT),
    );
    if res.ok() {
        match parse_max_users(&res.stdout) {
            Some(n) if n > 1 => caps.multi_user_support = true,
            Some(1) if caps.sdk_version >= MULTI_USER_MIN_SDK => {
                // Some ROMs report a ceiling of 1 while multi-user is in
                // fact enabled; the global setting is the tie-breaker.
                let enabled = adb.shell(
                    device,
                    &ShellRequest::new(["settings", "get", "global", "multi_user_enabled"])
                        .timeout(PROBE_TIMEOUT),
                );
                if enabled.ok() && enabled.stdout.trim() == "1" {
                    caps.multi_user_support = true;
                }
            }
            _ => {}
        }
    }

    let id_out = adb.shell(
        device,
        &ShellRequest::new(["id"]).as_root().timeout(PROBE_TIMEOUT),
    );
    if id_out.ok() && id_out.stdout.contains("uid=0(root)") {
        caps.root_access = true;

        let lookup = adb.shell(
            device,
            &ShellRequest::new(["which", "resetprop"])
                .as_root()
                .timeout(PROBE_TIMEOUT),
        );
        if lookup.ok() && !lookup.stdout.trim().is_empty() {
            caps.resetprop_available = true;
            debug!(
                "{}: found resetprop at {}",
                device,
                lookup.stdout.trim()
            );
        }
    }

    caps
}

/// The device's user ceiling: `pm get-max-users`, falling back to the
/// `fw.max_users` property, falling back to a sensible default of 4.
pub fn max_users(adb: &dyn Adb, device: &str) -> u32 {
    let res = adb.shell(
        device,
        &ShellRequest::new(["pm", "get-max-users"]).timeout(PROBE_TIMEOUT),
    );
    if res.ok() {
        if let Some(n) = parse_max_users(&res.stdout).filter(|n| *n > 0) {
            return n;
        }
    }

    let prop = adb.getprop(device, "fw.max_users");
    if let Ok(n) = prop.parse::<u32>() {
        if n > 0 {
            debug!("{}: used fw.max_users for the user ceiling: {}", device, n);
            return n;
        }
    }

    4
}

/// Session cache for capability snapshots, keyed by device id and
/// invalidated only by an explicit [CapabilityCache::refresh].
#[derive(Default)]
pub struct CapabilityCache {
    inner: HashMap<String, DeviceCapabilities>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, adb: &dyn Adb, device: &str) -> &DeviceCapabilities {
        if !self.inner.contains_key(device) {
            let caps = detect_capabilities(adb, device);
            self.inner.insert(device.to_string(), caps);
        }
        &self.inner[device]
    }

    pub fn refresh(&mut self, adb: &dyn Adb, device: &str) -> &DeviceCapabilities {
        let caps = detect_capabilities(adb, device);
        self.inner.insert(device.to_string(), caps);
        &self.inner[device]
    }

    pub fn peek(&self, device: &str) -> Option<&DeviceCapabilities> {
        self.inner.get(device)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::CmdOutput;
    use crate::testing::ScriptedAdb;

    #[test]
    fn test_parse_max_users() {
        assert_eq!(parse_max_users("Maximum supported users: 4"), Some(4));
        assert_eq!(parse_max_users("maximum supported users:8"), Some(8));
        assert_eq!(parse_max_users("4"), Some(4));
        assert_eq!(parse_max_users("users = 16 total"), Some(16));
        assert_eq!(parse_max_users("no numerals here"), None);
    }

    #[test]
    fn test_detect_rooted_device() {
        let adb = ScriptedAdb::new()
            .on("getprop ro.build.version.sdk", CmdOutput::success("33"))
            .on("pm get-max-users", CmdOutput::success("Maximum supported users: 4"))
            .on("id", CmdOutput::success("uid=0(root) gid=0(root)"))
            .on("which resetprop", CmdOutput::success("/system/bin/resetprop"));

        let caps = detect_capabilities(&adb, "SER123");
        assert_eq!(caps.sdk_version, 33);
        assert!(caps.ephemeral_user_support);
        assert!(caps.multi_user_support);
        assert!(caps.root_access);
        assert!(caps.resetprop_available);
        assert!(caps.can_spoof_properties());
    }

    #[test]
    fn test_detect_unrooted_device_is_best_effort() {
        let adb = ScriptedAdb::new()
            .on("getprop ro.build.version.sdk", CmdOutput::success("24"))
            .on("pm get-max-users", CmdOutput::failure(1, "unknown command"))
            .on("id", CmdOutput::failure(1, "su: not found"));

        let caps = detect_capabilities(&adb, "SER123");
        assert_eq!(caps.sdk_version, 24);
        assert!(!caps.ephemeral_user_support);
        assert!(!caps.multi_user_support);
        assert!(!caps.root_access);
        assert!(!caps.resetprop_available);
    }

    #[test]
    fn test_underreported_ceiling_uses_settings_fallback() {
        let adb = ScriptedAdb::new()
            .on("getprop ro.build.version.sdk", CmdOutput::success("30"))
            .on("pm get-max-users", CmdOutput::success("1"))
            .on(
                "settings get global multi_user_enabled",
                CmdOutput::success("1"),
            )
            .on("id", CmdOutput::failure(1, "no su"));

        let caps = detect_capabilities(&adb, "SER123");
        assert!(caps.multi_user_support);
    }

    #[test]
    fn test_max_users_fallbacks() {
        let adb = ScriptedAdb::new()
            .on("pm get-max-users", CmdOutput::failure(1, "bad"))
            .on("getprop fw.max_users", CmdOutput::success("8"));
        assert_eq!(max_users(&adb, "SER123"), 8);

        let adb = ScriptedAdb::new()
            .on("pm get-max-users", CmdOutput::failure(1, "bad"))
            .on("getprop fw.max_users", CmdOutput::success(""));
        assert_eq!(max_users(&adb, "SER123"), 4);
    }

    #[test]
    fn test_cache_probes_once() {
        let adb = ScriptedAdb::new()
            .on("getprop ro.build.version.sdk", CmdOutput::success("33"))
            .on("pm get-max-users", CmdOutput::success("Maximum supported users: 4"))
            .on("id", CmdOutput::failure(1, "no su"));

        let mut cache = CapabilityCache::new();
        let first = cache.get(&adb, "SER123").clone();
        let calls_after_first = adb.calls().len();
        let second = cache.get(&adb, "SER123").clone();
        assert_eq!(first, second);
        assert_eq!(adb.calls().len(), calls_after_first);

        cache.refresh(&adb, "SER123");
        assert!(adb.calls().len() > calls_after_first);
    }
}
