use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use regex::Regex;

use crate::adb::{Adb, ShellRequest};
use crate::config::UserConfig;
use crate::probe::{self, DeviceCapabilities};
use crate::retry::{exponential_secs, retry};
use crate::spoof::SpoofEngine;
use crate::{Error, Result};

const CREATE_USER_TIMEOUT: Duration = Duration::from_secs(90);
const REMOVE_USER_TIMEOUT: Duration = Duration::from_secs(90);
const SWITCH_USER_TIMEOUT: Duration = Duration::from_secs(60);
const LIMIT_SETTLE: Duration = Duration::from_secs(1);

/// A provisioned, isolated user profile on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: u32,
    pub user_name: String,
    pub is_ephemeral: bool,
    pub fingerprint_randomized: bool,
}

/// Which parts of a session's device modifications to undo. The three are
/// orthogonal; declining one never blocks the others.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupChoices {
    pub restore_properties: bool,
    pub remove_profile: bool,
    pub restore_user_limit: bool,
}

impl CleanupChoices {
    pub fn everything() -> Self {
        Self {
            restore_properties: true,
            remove_profile: true,
            restore_user_limit: true,
        }
    }
}

lazy_static! {
    /// The success phrasing of `pm create-user` varies by vendor; these are
    /// tried in order and the list is meant to grow as new ROMs show up.
    static ref USER_ID_PARSERS: Vec<Regex> = [
        r"(?i)Success: created user id (\d+)",
        r"(?i)Success: user added \(id=(\d+)\)",
        r"UserInfo\{(\d+):",
        r"(?i)Created user id (\d+)",
        r"(?i)user id (\d+) created",
        r"(?i)id\s*=\s*(\d+)",
        r"userId=(\d+)",
        r"User_(\d+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect();
}

/// Extracts the new numeric user id from a `pm create-user` success message.
pub fn parse_user_id(output: &str) -> Option<u32> {
    for parser in USER_ID_PARSERS.iter() {
        if let Some(caps) = parser.captures(output) {
            if let Ok(id) = caps[1].parse() {
                return Some(id);
            }
        }
    }
    None
}

/// Creates, validates-switches-to and tears down isolated user profiles.
/// Owns the single active-profile slot per device; creating a second profile
/// while one is active is an error until the caller cleans up.
pub struct UserProfileManager {
    adb: Arc<dyn Adb>,
    config: UserConfig,
    active: HashMap<String, UserProfile>,
    limit_originals: HashMap<String, u32>,
}

impl UserProfileManager {
    pub fn new(adb: Arc<dyn Adb>, config: UserConfig) -> Self {
        Self {
            adb,
            config,
            active: HashMap::new(),
            limit_originals: HashMap::new(),
        }
    }

    pub fn config(&self) -> &UserConfig {
        &self.config
    }

    pub fn active_profile(&self, device: &str) -> Option<&UserProfile> {
        self.active.get(device)
    }

    pub fn has_adjusted_limit(&self, device: &str) -> bool {
        self.limit_originals.contains_key(device)
    }

    /// Creates a fresh user profile and switches the device into it.
    ///
    /// Gated on multi-user support and free storage. An ephemeral profile is
    /// requested with `want_permanent = false` and silently downgrades to a
    /// permanent one when the device predates ephemeral users. Creation is
    /// retried with exponential backoff; a failure after the user exists
    /// (android-id assignment or switch validation) removes the partial user
    /// before the next attempt.
    pub fn create_profile(
        &mut self,
        device: &str,
        caps: &DeviceCapabilities,
        spoof: &mut SpoofEngine,
        want_permanent: bool,
        name: Option<String>,
    ) -> Result<UserProfile> {
        if let Some(profile) = self.active.get(device) {
            return Err(Error::ProfileActive(device.to_string(), profile.user_id));
        }
        if self.config.check_multiuser_support && !caps.multi_user_support {
            return Err(Error::CapabilityGap(
                device.to_string(),
                "multi-user support".to_string(),
            ));
        }
        if !self.check_storage(device, self.config.min_storage_mb) {
            return Err(Error::ProfileCreation(
                device.to_string(),
                format!(
                    "insufficient storage, need more than {} MB free on /data",
                    self.config.min_storage_mb
                ),
            ));
        }

        let mut ephemeral = !want_permanent;
        if ephemeral && !caps.ephemeral_user_support {
            warn!(
                "{}: ephemeral users unsupported (SDK {}), creating a permanent profile instead",
                device, caps.sdk_version
            );
            ephemeral = false;
        }

        let name = name.unwrap_or_else(|| Local::now().format("%m-%d-%y_%H-%M").to_string());

        if self.config.bypass_user_limits && caps.root_access {
            self.maybe_raise_user_limit(device, caps);
        }

        let retries = self.config.creation_retries.max(1);
        let profile = retry(retries, exponential_secs(), |attempt| {
            debug!(
                "{}: attempt {}/{} to create user {:?}",
                device,
                attempt + 1,
                retries,
                name
            );
            self.try_create_once(device, caps, spoof, ephemeral, &name)
        })
        .map_err(|e| Error::ProfileCreation(device.to_string(), e))?;

        self.active.insert(device.to_string(), profile.clone());
        Ok(profile)
    }

    fn try_create_once(
        &mut self,
        device: &str,
        caps: &DeviceCapabilities,
        spoof: &mut SpoofEngine,
        ephemeral: bool,
        name: &str,
    ) -> std::result::Result<UserProfile, String> {
        let mut args = vec!["pm".to_string(), "create-user".to_string()];
        if ephemeral {
            args.push("--ephemeral".to_string());
        }
        args.push(name.to_string());

        let mut res = self.adb.shell(
            device,
            &ShellRequest::new(args.clone()).timeout(CREATE_USER_TIMEOUT),
        );
        if !res.ok() && res.combined().contains("SecurityException") && caps.root_access {
            debug!("{}: pm create-user denied for shell, retrying with root", device);
            res = self.adb.shell(
                device,
                &ShellRequest::new(args).timeout(CREATE_USER_TIMEOUT).as_root(),
            );
        }

        if !res.ok() || !res.stdout.to_lowercase().contains("success") {
            return Err(format!("user creation failed: {}", res.combined()));
        }

        let user_id = parse_user_id(&res.stdout).ok_or_else(|| {
            format!(
                "user creation reported success but no id was parseable from: {}",
                res.stdout.trim()
            )
        })?;
        info!(
            "{}: created {} user {:?} (id {})",
            device,
            if ephemeral { "ephemeral" } else { "permanent" },
            name,
            user_id
        );

        if self.config.auto_set_random_android_id {
            if !caps.root_access {
                warn!(
                    "{}: no root, cannot assign an android_id to user {}",
                    device, user_id
                );
            } else if !spoof.spoof_android_id(device, Some(user_id)) {
                self.cleanup_failed_creation(device, caps, user_id);
                return Err(format!("failed to assign android_id to user {user_id}"));
            }
        }

        if let Err(e) = self.switch_with_validation(device, user_id) {
            self.cleanup_failed_creation(device, caps, user_id);
            return Err(format!("switch to user {user_id} failed: {e}"));
        }

        let fingerprint_randomized = spoof
            .apply_random_fingerprint(device, caps)
            .unwrap_or(false);
        if !fingerprint_randomized {
            warn!(
                "{}: profile created but device identity randomization was skipped or failed",
                device
            );
        }

        Ok(UserProfile {
            user_id,
            user_name: name.to_string(),
            is_ephemeral: ephemeral,
            fingerprint_randomized,
        })
    }

    /// Switches the device to a user and confirms the switch took effect by
    /// polling the current-user query. With validation disabled, a fixed
    /// delay is the only safeguard and success is assumed.
    pub fn switch_with_validation(&self, device: &str, user_id: u32) -> Result<()> {
        debug!("{}: switching to user {}", device, user_id);
        let res = self.adb.shell(
            device,
            &ShellRequest::new(["am", "switch-user", &user_id.to_string()])
                .timeout(SWITCH_USER_TIMEOUT),
        );
        if !res.ok() {
            let msg = res.combined();
            if msg.contains("SecurityException") && msg.contains("permission to switch users") {
                info!(
                    "{}: the shell may not switch users while the device is locked; unlock it \
                     or check developer options",
                    device
                );
            }
            return Err(Error::Generic(format!(
                "am switch-user {user_id} failed: {msg}"
            )));
        }

        if !self.config.switch_initial_delay.is_zero() {
            thread::sleep(self.config.switch_initial_delay);
        }

        if !self.config.validate_user_switch {
            if !self.config.switch_no_validation_delay.is_zero() {
                thread::sleep(self.config.switch_no_validation_delay);
            }
            debug!(
                "{}: switch to user {} assumed complete (validation disabled)",
                device, user_id
            );
            return Ok(());
        }

        let deadline = Instant::now() + self.config.switch_validate_timeout;
        while Instant::now() < deadline {
            if !self.config.switch_poll_interval.is_zero() {
                thread::sleep(self.config.switch_poll_interval);
            }
            let cur = self
                .adb
                .shell(device, &ShellRequest::new(["am", "get-current-user"]));
            if cur.ok() {
                if cur.stdout.trim().parse::<u32>().ok() == Some(user_id) {
                    debug!("{}: switch to user {} verified", device, user_id);
                    return Ok(());
                }
                debug!(
                    "{}: waiting for switch to user {} (currently {})",
                    device,
                    user_id,
                    cur.stdout.trim()
                );
            }
        }

        Err(Error::Generic(format!(
            "could not validate switch to user {user_id} within {:?}",
            self.config.switch_validate_timeout
        )))
    }

    fn cleanup_failed_creation(&self, device: &str, caps: &DeviceCapabilities, user_id: u32) {
        if user_id == 0 {
            return;
        }
        warn!(
            "{}: removing partially provisioned user {} after a failed setup step",
            device, user_id
        );
        self.remove_user(device, caps, user_id);
    }

    /// Removes a user by id - for partial creations and stray profiles left
    /// behind by earlier sessions. Retries once with root when the
    /// unprivileged attempt fails; "already removed" responses count as
    /// success.
    pub fn remove_user(&self, device: &str, caps: &DeviceCapabilities, user_id: u32) -> bool {
        if user_id == 0 {
            error!("refusing to remove the owner user");
            return false;
        }
        let args = ["pm", "remove-user", &user_id.to_string()];
        let mut res = self.adb.shell(
            device,
            &ShellRequest::new(args).timeout(REMOVE_USER_TIMEOUT),
        );
        if !res.ok() && caps.root_access {
            debug!("{}: remove-user denied for shell, retrying with root", device);
            res = self.adb.shell(
                device,
                &ShellRequest::new(args).timeout(REMOVE_USER_TIMEOUT).as_root(),
            );
        }
        if res.ok() {
            debug!("{}: user {} removed", device, user_id);
            return true;
        }

        let text = res.combined().to_lowercase();
        let already_gone = [
            "doesn't exist",
            "does not exist",
            "no user exists",
            "will be removed",
            "already being removed",
        ]
        .iter()
        .any(|frag| text.contains(frag));
        if already_gone {
            debug!("{}: user {} was already gone", device, user_id);
            return true;
        }
        warn!(
            "{}: could not remove user {}: {}",
            device,
            user_id,
            res.combined()
        );
        false
    }

    /// Tears down the active profile: switches back to the owner first when
    /// the profile is still in the foreground, then removes the user
    /// (retrying once with root). "Already removed" responses count as
    /// success for ephemeral profiles. The active slot is cleared no matter
    /// how the removal went.
    pub fn cleanup_profile(&mut self, device: &str, caps: &DeviceCapabilities) -> bool {
        let profile = match self.active.get(device) {
            Some(p) => p.clone(),
            None => return true,
        };
        if profile.user_id == 0 {
            self.active.remove(device);
            return true;
        }

        info!(
            "{}: cleaning up {} user {:?} (id {})",
            device,
            if profile.is_ephemeral { "ephemeral" } else { "permanent" },
            profile.user_name,
            profile.user_id
        );
        let mut success = true;

        let cur = self
            .adb
            .shell(device, &ShellRequest::new(["am", "get-current-user"]));
        if cur.ok() && cur.stdout.trim().parse::<u32>().ok() == Some(profile.user_id) {
            if let Err(e) = self.switch_with_validation(device, 0) {
                success = false;
                warn!(
                    "{}: could not switch back to the owner before removal: {}",
                    device, e
                );
            } else if !self.config.switch_initial_delay.is_zero() {
                thread::sleep(self.config.switch_initial_delay);
            }
        }

        let args = ["pm", "remove-user", &profile.user_id.to_string()];
        let mut res = self.adb.shell(
            device,
            &ShellRequest::new(args).timeout(REMOVE_USER_TIMEOUT),
        );
        if !res.ok() && caps.root_access {
            debug!("{}: remove-user denied for shell, retrying with root", device);
            res = self.adb.shell(
                device,
                &ShellRequest::new(args).timeout(REMOVE_USER_TIMEOUT).as_root(),
            );
        }

        if res.ok() {
            info!("{}: user {} removed", device, profile.user_id);
        } else {
            let text = res.combined().to_lowercase();
            let already_gone = [
                "doesn't exist",
                "does not exist",
                "no user exists",
                "will be removed",
                "already being removed",
            ]
            .iter()
            .any(|frag| text.contains(frag));

            if already_gone {
                info!(
                    "{}: user {} was already removed or is scheduled for removal",
                    device, profile.user_id
                );
                if !profile.is_ephemeral {
                    success = false;
                }
            } else {
                success = false;
                warn!(
                    "{}: failed to remove user {}: {}",
                    device,
                    profile.user_id,
                    res.combined()
                );
            }
        }

        self.active.remove(device);
        success
    }

    /// Free space on /data in megabytes, compared against the configured
    /// minimum. Unparseable output is treated as sufficient so a broken
    /// query never blocks installs.
    pub fn check_storage(&self, device: &str, min_mb: u64) -> bool {
        let res = self
            .adb
            .shell(device, &ShellRequest::new(["df", "-k", "/data"]));
        if res.ok() {
            if let Some(line) = res
                .stdout
                .lines()
                .rev()
                .find(|l| l.trim_end().ends_with("/data"))
            {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if let Some(kb) = fields.get(3).and_then(|f| f.parse::<u64>().ok()) {
                    let mb = kb / 1024;
                    debug!("{}: {} MB available on /data", device, mb);
                    if mb < min_mb {
                        warn!(
                            "{}: low storage, {} MB available but {} MB required",
                            device, mb, min_mb
                        );
                        return false;
                    }
                    return true;
                }
            }
        }
        warn!(
            "{}: could not parse `df -k /data` output, assuming sufficient space",
            device
        );
        true
    }

    fn maybe_raise_user_limit(&mut self, device: &str, caps: &DeviceCapabilities) {
        let res = self
            .adb
            .shell(device, &ShellRequest::new(["pm", "list", "users"]));
        let current_users = if res.ok() {
            res.stdout
                .lines()
                .filter(|l| l.contains("UserInfo{"))
                .count() as u32
        } else {
            0
        };

        let ceiling = probe::max_users(&*self.adb, device);
        if current_users < ceiling {
            return;
        }

        warn!(
            "{}: user limit reached ({}/{}), attempting to raise it",
            device, current_users, ceiling
        );
        let target = (current_users + 2).max(ceiling + 1).min(10);
        if !self.adjust_user_limit(device, caps, target) {
            error!(
                "{}: could not raise the user limit, creation may fail",
                device
            );
        }
    }

    /// Raises (or lowers) the device's user ceiling through the global
    /// switcher setting and, when resetprop is available, the fw.max_users
    /// property. The original ceiling is recorded once per device so it can
    /// be restored later.
    pub fn adjust_user_limit(
        &mut self,
        device: &str,
        caps: &DeviceCapabilities,
        new_limit: u32,
    ) -> bool {
        if new_limit < 1 {
            error!("user limit must be at least 1");
            return false;
        }
        if !caps.root_access {
            error!("{}: root required to adjust the user limit", device);
            return false;
        }

        if !self.limit_originals.contains_key(device) {
            let original = probe::max_users(&*self.adb, device);
            self.limit_originals.insert(device.to_string(), original);
            debug!("{}: stored original user limit {}", device, original);
        }

        let (ok_global, ok_fw) = self.write_user_limit(device, caps, new_limit);

        thread::sleep(LIMIT_SETTLE);
        let now = probe::max_users(&*self.adb, device);
        if now >= new_limit {
            info!("{}: user limit verified at {}", device, now);
            return true;
        }
        warn!(
            "{}: user limit adjustment may not be fully effective (reported {})",
            device, now
        );
        // the ceiling query can lag behind the settings write
        ok_global || ok_fw
    }

    /// Puts the stored original ceiling back. Nothing to do when no
    /// adjustment was ever made.
    pub fn restore_user_limit(&mut self, device: &str, caps: &DeviceCapabilities) -> bool {
        let original = match self.limit_originals.get(device) {
            Some(v) => *v,
            None => {
                debug!("{}: no user limit adjustment to restore", device);
                return true;
            }
        };
        if !caps.root_access {
            warn!("{}: root unavailable, cannot restore the user limit", device);
            return false;
        }

        info!("{}: restoring user limit to {}", device, original);
        let (ok_global, ok_fw) = self.write_user_limit(device, caps, original);
        if ok_global || ok_fw {
            self.limit_originals.remove(device);
            return true;
        }
        error!("{}: failed to restore the user limit", device);
        false
    }

    fn write_user_limit(
        &self,
        device: &str,
        caps: &DeviceCapabilities,
        limit: u32,
    ) -> (bool, bool) {
        let global = self.adb.shell(
            device,
            &ShellRequest::new([
                "settings",
                "put",
                "global",
                "user_switcher_max_users",
                &limit.to_string(),
            ])
            .as_root(),
        );
        if global.ok() {
            debug!("{}: user_switcher_max_users set to {}", device, limit);
        } else {
            warn!(
                "{}: failed to set user_switcher_max_users: {}",
                device,
                global.combined()
            );
        }

        let fw_ok = if caps.resetprop_available {
            let fw = self.adb.shell(
                device,
                &ShellRequest::new(["resetprop", "fw.max_users", &limit.to_string()]).as_root(),
            );
            if fw.ok() {
                debug!("{}: fw.max_users set to {}", device, limit);
            } else {
                warn!("{}: failed to set fw.max_users: {}", device, fw.combined());
            }
            fw.ok()
        } else {
            debug!("{}: no resetprop, skipping fw.max_users", device);
            false
        };

        (global.ok(), fw_ok)
    }

    /// Session cleanup with independent choices: properties, profile and
    /// user limit each restore (or stay) on their own.
    pub fn comprehensive_cleanup(
        &mut self,
        device: &str,
        caps: &DeviceCapabilities,
        spoof: &mut SpoofEngine,
        choices: CleanupChoices,
    ) -> bool {
        let mut ok = true;

        if choices.restore_properties {
            if !spoof.restore_all(device) {
                ok = false;
            }
        } else if spoof.has_backups(device) {
            info!(
                "{}: keeping {} modified properties",
                device,
                spoof.backup_count(device)
            );
        }

        if choices.remove_profile {
            if !self.cleanup_profile(device, caps) {
                ok = false;
            }
        } else if let Some(profile) = self.active.get(device) {
            info!(
                "{}: keeping user profile {:?} (id {})",
                device, profile.user_name, profile.user_id
            );
        }

        if choices.restore_user_limit {
            if !self.restore_user_limit(device, caps) {
                ok = false;
            }
        } else if self.limit_originals.contains_key(device) {
            info!("{}: keeping the adjusted user limit", device);
        }

        ok
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::CmdOutput;
    use crate::config::SpoofConfig;
    use crate::patterns::PatternCatalog;
    use crate::testing::ScriptedAdb;

    fn fast_config() -> UserConfig {
        UserConfig {
            creation_retries: 1,
            switch_initial_delay: Duration::ZERO,
            switch_validate_timeout: Duration::from_secs(1),
            switch_poll_interval: Duration::ZERO,
            switch_no_validation_delay: Duration::ZERO,
            post_creation_settle: Duration::ZERO,
            ..UserConfig::default()
        }
    }

    fn caps(root: bool, multi_user: bool, ephemeral: bool) -> DeviceCapabilities {
        DeviceCapabilities {
            device_id: "SER123".to_string(),
            root_access: root,
            resetprop_available: root,
            multi_user_support: multi_user,
            ephemeral_user_support: ephemeral,
            sdk_version: 33,
        }
    }

    fn spoof_engine(adb: Arc<dyn Adb>) -> SpoofEngine {
        // identity randomization is exercised in spoof.rs tests; profile
        // tests keep it out of the exchange
        SpoofEngine::new(
            adb,
            SpoofConfig {
                auto_spoof_on_user_creation: false,
                settle_delay: Duration::ZERO,
                ..SpoofConfig::default()
            },
            PatternCatalog::builtin(),
        )
    }

    #[test]
    fn test_parse_user_id_variants() {
        assert_eq!(parse_user_id("Success: created user id 10"), Some(10));
        assert_eq!(parse_user_id("Success: user added (id=11)"), Some(11));
        assert_eq!(parse_user_id("UserInfo{12:work:c13}"), Some(12));
        assert_eq!(parse_user_id("Created user id 13"), Some(13));
        assert_eq!(parse_user_id("new user: userId=14"), Some(14));
        assert_eq!(parse_user_id("no id in here"), None);
    }

    #[test]
    fn test_check_storage() {
        let df_ok = "Filesystem 1K-blocks Used Available Use% Mounted on\n\
                     /dev/block/dm-5 115740656 103279332 12311324 90% /data";
        let adb = ScriptedAdb::new().on("df -k /data", CmdOutput::success(df_ok));
        let mgr = UserProfileManager::new(Arc::new(adb), fast_config());
        assert!(mgr.check_storage("SER123", 500));

        let df_low = "Filesystem 1K-blocks Used Available Use% Mounted on\n\
                      /dev/block/dm-5 115740656 115535556 204800 99% /data";
        let adb = ScriptedAdb::new().on("df -k /data", CmdOutput::success(df_low));
        let mgr = UserProfileManager::new(Arc::new(adb), fast_config());
        assert!(!mgr.check_storage("SER123", 500));

        // unparseable output defaults to "sufficient"
        let adb = ScriptedAdb::new().on("df -k /data", CmdOutput::success("nonsense"));
        let mgr = UserProfileManager::new(Arc::new(adb), fast_config());
        assert!(mgr.check_storage("SER123", 500));
    }

    #[test]
    fn test_create_profile_happy_path() {
        let adb = Arc::new(
            ScriptedAdb::new()
                .on(
                    "pm create-user",
                    CmdOutput::success("Success: created user id 10"),
                )
                .on("am get-current-user", CmdOutput::success("10")),
        );
        let mut spoof = spoof_engine(adb.clone());
        let mut mgr = UserProfileManager::new(adb.clone(), fast_config());

        let profile = mgr
            .create_profile("SER123", &caps(true, true, true), &mut spoof, false, None)
            .unwrap();
        assert_eq!(profile.user_id, 10);
        assert!(profile.is_ephemeral);
        assert!(mgr.active_profile("SER123").is_some());
        assert!(adb
            .calls()
            .iter()
            .any(|c| c.contains("pm create-user --ephemeral")));

        // a second profile on the same device is rejected until cleanup
        let err = mgr
            .create_profile("SER123", &caps(true, true, true), &mut spoof, false, None)
            .unwrap_err();
        assert!(matches!(err, Error::ProfileActive(_, 10)));
    }

    #[test]
    fn test_ephemeral_downgrades_to_permanent() {
        let adb = Arc::new(
            ScriptedAdb::new()
                .on(
                    "pm create-user",
                    CmdOutput::success("Success: created user id 11"),
                )
                .on("am get-current-user", CmdOutput::success("11")),
        );
        let mut spoof = spoof_engine(adb.clone());
        let mut mgr = UserProfileManager::new(adb.clone(), fast_config());

        let profile = mgr
            .create_profile(
                "SER123",
                &caps(true, true, false),
                &mut spoof,
                false,
                Some("tester".to_string()),
            )
            .unwrap();
        assert!(!profile.is_ephemeral);
        assert!(adb.calls().iter().any(|c| c.contains("pm create-user tester")));
        assert!(!adb.calls().iter().any(|c| c.contains("--ephemeral")));
    }

    #[test]
    fn test_create_requires_multiuser() {
        let adb = Arc::new(ScriptedAdb::new());
        let mut spoof = spoof_engine(adb.clone());
        let mut mgr = UserProfileManager::new(adb, fast_config());
        let err = mgr
            .create_profile("SER123", &caps(true, false, true), &mut spoof, true, None)
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityGap(_, _)));
    }

    #[test]
    fn test_failed_switch_cleans_up_partial_user() {
        let adb = Arc::new(
            ScriptedAdb::new()
                .on(
                    "pm create-user",
                    CmdOutput::success("Success: created user id 12"),
                )
                .on(
                    "am switch-user 12",
                    CmdOutput::failure(1, "SecurityException: permission to switch users denied"),
                ),
        );
        let mut spoof = spoof_engine(adb.clone());
        let mut mgr = UserProfileManager::new(
            adb.clone(),
            UserConfig {
                auto_set_random_android_id: false,
                ..fast_config()
            },
        );

        let err = mgr
            .create_profile("SER123", &caps(false, true, true), &mut spoof, false, None)
            .unwrap_err();
        assert!(matches!(err, Error::ProfileCreation(_, _)));
        assert!(mgr.active_profile("SER123").is_none());
        // the partially created user was removed
        assert!(adb.calls().iter().any(|c| c.contains("pm remove-user 12")));
    }

    #[test]
    fn test_cleanup_switches_back_and_removes() {
        let adb = Arc::new(
            ScriptedAdb::new()
                .once("am get-current-user", CmdOutput::success("10"))
                .on("pm remove-user 10", CmdOutput::success("Success: removed user")),
        );
        let mut mgr = UserProfileManager::new(
            adb.clone(),
            UserConfig {
                validate_user_switch: false,
                ..fast_config()
            },
        );
        mgr.active.insert(
            "SER123".to_string(),
            UserProfile {
                user_id: 10,
                user_name: "tester".to_string(),
                is_ephemeral: false,
                fingerprint_randomized: true,
            },
        );

        assert!(mgr.cleanup_profile("SER123", &caps(true, true, true)));
        assert!(mgr.active_profile("SER123").is_none());
        assert!(adb.calls().iter().any(|c| c.contains("am switch-user 0")));
    }

    #[test]
    fn test_cleanup_tolerates_already_removed_ephemeral() {
        let adb = Arc::new(
            ScriptedAdb::new()
                .on("am get-current-user", CmdOutput::success("0"))
                .on(
                    "pm remove-user 10",
                    CmdOutput::failure(1, "Error: no user exists with id 10"),
                ),
        );
        let mut mgr = UserProfileManager::new(adb, fast_config());
        mgr.active.insert(
            "SER123".to_string(),
            UserProfile {
                user_id: 10,
                user_name: "tester".to_string(),
                is_ephemeral: true,
                fingerprint_randomized: false,
            },
        );

        assert!(mgr.cleanup_profile("SER123", &caps(false, true, true)));
        assert!(mgr.active_profile("SER123").is_none());
    }

    #[test]
    fn test_restore_user_limit_roundtrip() {
        let adb = Arc::new(ScriptedAdb::new().on(
            "pm get-max-users",
            CmdOutput::success("Maximum supported users: 4"),
        ));
        let mut mgr = UserProfileManager::new(adb.clone(), fast_config());

        // nothing stored: trivially done
        assert!(mgr.restore_user_limit("SER123", &caps(true, true, true)));

        mgr.limit_originals.insert("SER123".to_string(), 4);
        assert!(mgr.has_adjusted_limit("SER123"));
        assert!(mgr.restore_user_limit("SER123", &caps(true, true, true)));
        assert!(!mgr.has_adjusted_limit("SER123"));
        assert!(adb
            .calls()
            .iter()
            .any(|c| c.contains("user_switcher_max_users 4")));
    }

    #[test]
    fn test_comprehensive_cleanup_choices_are_orthogonal() {
        let adb = Arc::new(
            ScriptedAdb::new()
                .once("getprop ro.a", CmdOutput::success("orig"))
                .once("getprop ro.a", CmdOutput::success("orig"))
                .on("getprop ro.a", CmdOutput::success("orig"))
                .on("am get-current-user", CmdOutput::success("0"))
                .on("pm remove-user", CmdOutput::success("Success")),
        );
        let mut spoof = spoof_engine(adb.clone());
        spoof.backup_property("SER123", "ro.a");
        let mut mgr = UserProfileManager::new(adb, fast_config());
        mgr.active.insert(
            "SER123".to_string(),
            UserProfile {
                user_id: 10,
                user_name: "tester".to_string(),
                is_ephemeral: false,
                fingerprint_randomized: false,
            },
        );

        // restore properties only: the profile must survive
        let choices = CleanupChoices {
            restore_properties: true,
            ..CleanupChoices::default()
        };
        assert!(mgr.comprehensive_cleanup("SER123", &caps(true, true, true), &mut spoof, choices));
        assert!(!spoof.has_backups("SER123"));
        assert!(mgr.active_profile("SER123").is_some());

        // now remove the profile too
        let choices = CleanupChoices {
            remove_profile: true,
            ..CleanupChoices::default()
        };
        assert!(mgr.comprehensive_cleanup("SER123", &caps(true, true, true), &mut spoof, choices));
        assert!(mgr.active_profile("SER123").is_none());
    }
}
