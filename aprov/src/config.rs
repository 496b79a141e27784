use std::fs;
use std::path::Path;
use std::time::Duration;

use toml::{Table, Value};

use crate::{Error, Result};

/// Property spoofing toggles. Every field has a documented default so the
/// engine can be constructed without any configuration file at all.
#[derive(Debug, Clone)]
pub struct SpoofConfig {
    /// Master switch for resetprop-based property spoofing.
    pub enabled: bool,
    /// Record original values before the first modification of a property.
    pub backup_original_properties: bool,
    pub spoof_build_fingerprint: bool,
    pub spoof_serial_number: bool,
    pub spoof_device_model: bool,
    pub spoof_android_version_props: bool,
    /// Also rewrite the secure `android_id` setting for the current user.
    pub spoof_android_id: bool,
    /// Randomize the device identity whenever a new user profile is created.
    pub auto_spoof_on_user_creation: bool,
    /// Manufacturer key in the pattern catalog.
    pub manufacturer: String,
    /// Model name or display name; empty means pick one at random.
    pub model: String,
    /// Android version key in the pattern catalog.
    pub android_version: String,
    /// Pause between a property write and its verification read.
    pub settle_delay: Duration,
}

impl Default for SpoofConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backup_original_properties: true,
            spoof_build_fingerprint: true,
            spoof_serial_number: true,
            spoof_device_model: true,
            spoof_android_version_props: true,
            spoof_android_id: true,
            auto_spoof_on_user_creation: true,
            manufacturer: "samsung".to_string(),
            model: String::new(),
            android_version: "13".to_string(),
            settle_delay: Duration::from_millis(200),
        }
    }
}

/// User profile lifecycle settings.
#[derive(Debug, Clone)]
pub struct UserConfig {
    /// Master switch for isolated user profiles.
    pub enabled: bool,
    pub use_ephemeral_users: bool,
    /// Assign a random 16-hex android_id to freshly created users.
    pub auto_set_random_android_id: bool,
    pub creation_retries: u32,
    pub validate_user_switch: bool,
    pub switch_initial_delay: Duration,
    pub switch_validate_timeout: Duration,
    pub switch_poll_interval: Duration,
    pub switch_no_validation_delay: Duration,
    /// Settle time after a new profile is ready, before installs begin.
    pub post_creation_settle: Duration,
    pub min_storage_mb: u64,
    pub check_multiuser_support: bool,
    /// Attempt to raise the device's user ceiling when it is reached.
    pub bypass_user_limits: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_ephemeral_users: true,
            auto_set_random_android_id: true,
            creation_retries: 3,
            validate_user_switch: true,
            switch_initial_delay: Duration::from_secs(3),
            switch_validate_timeout: Duration::from_secs(30),
            switch_poll_interval: Duration::from_secs(2),
            switch_no_validation_delay: Duration::from_secs(5),
            post_creation_settle: Duration::from_secs(10),
            min_storage_mb: 500,
            check_multiuser_support: true,
            bypass_user_limits: false,
        }
    }
}

/// Installation behavior.
#[derive(Debug, Clone)]
pub struct InstallConfig {
    pub replace_existing: bool,
    pub allow_downgrade: bool,
    pub grant_runtime_permissions: bool,
    /// After INSTALL_FAILED_MISSING_SPLIT, retry once with every file from
    /// the bundle instead of the filtered selection.
    pub retry_all_on_missing_split: bool,
    /// Offer uninstall-and-retry on conflict-class failures.
    pub prompt_uninstall_on_conflict: bool,
    pub install_timeout: Duration,
    pub obb_push_timeout: Duration,
    pub uninstall_timeout: Duration,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            replace_existing: true,
            allow_downgrade: false,
            grant_runtime_permissions: true,
            retry_all_on_missing_split: true,
            prompt_uninstall_on_conflict: true,
            install_timeout: Duration::from_secs(900),
            obb_push_timeout: Duration::from_secs(600),
            uninstall_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionerConfig {
    pub spoofing: SpoofConfig,
    pub users: UserConfig,
    pub install: InstallConfig,
}

impl ProvisionerConfig {
    /// Loads a toml document where every key is optional; anything missing
    /// keeps its default.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|_| Error::MissingFile(path.to_string_lossy().into_owned()))?;
        let table: Table = toml::from_str(&text)
            .map_err(|e| Error::InvalidConfig(path.to_string_lossy().into_owned(), e.to_string()))?;
        Ok(Self::from_table(&table))
    }

    pub fn from_table(table: &Table) -> Self {
        let mut cfg = Self::default();

        if let Some(Value::Table(t)) = table.get("spoofing") {
            let s = &mut cfg.spoofing;
            s.enabled = table_bool(t, "enabled", s.enabled);
            s.backup_original_properties =
                table_bool(t, "backup_original_properties", s.backup_original_properties);
            s.spoof_build_fingerprint =
                table_bool(t, "spoof_build_fingerprint", s.spoof_build_fingerprint);
            s.spoof_serial_number = table_bool(t, "spoof_serial_number", s.spoof_serial_number);
            s.spoof_device_model = table_bool(t, "spoof_device_model", s.spoof_device_model);
            s.spoof_android_version_props = table_bool(
                t,
                "spoof_android_version_props",
                s.spoof_android_version_props,
            );
            s.spoof_android_id = table_bool(t, "spoof_android_id", s.spoof_android_id);
            s.auto_spoof_on_user_creation = table_bool(
                t,
                "auto_spoof_on_user_creation",
                s.auto_spoof_on_user_creation,
            );
            s.manufacturer = table_str(t, "manufacturer", &s.manufacturer);
            s.model = table_str(t, "model", &s.model);
            s.android_version = table_str(t, "android_version", &s.android_version);
        }

        if let Some(Value::Table(t)) = table.get("users") {
            let u = &mut cfg.users;
            u.enabled = table_bool(t, "enabled", u.enabled);
            u.use_ephemeral_users = table_bool(t, "use_ephemeral_users", u.use_ephemeral_users);
            u.auto_set_random_android_id = table_bool(
                t,
                "auto_set_random_android_id",
                u.auto_set_random_android_id,
            );
            u.creation_retries = table_u64(t, "creation_retries", u.creation_retries as u64) as u32;
            u.validate_user_switch =
                table_bool(t, "validate_user_switch", u.validate_user_switch);
            u.switch_initial_delay =
                table_secs(t, "switch_initial_delay_seconds", u.switch_initial_delay);
            u.switch_validate_timeout = table_secs(
                t,
                "validate_user_switch_timeout_seconds",
                u.switch_validate_timeout,
            );
            u.switch_no_validation_delay = table_secs(
                t,
                "switch_no_validation_delay_seconds",
                u.switch_no_validation_delay,
            );
            u.post_creation_settle = table_secs(
                t,
                "post_creation_settle_seconds",
                u.post_creation_settle,
            );
            u.min_storage_mb = table_u64(t, "min_storage_mb", u.min_storage_mb);
            u.check_multiuser_support =
                table_bool(t, "check_multiuser_support", u.check_multiuser_support);
            u.bypass_user_limits = table_bool(t, "bypass_user_limits", u.bypass_user_limits);
        }

        if let Some(Value::Table(t)) = table.get("install") {
            let i = &mut cfg.install;
            i.replace_existing = table_bool(t, "replace_existing", i.replace_existing);
            i.allow_downgrade = table_bool(t, "allow_downgrade", i.allow_downgrade);
            i.grant_runtime_permissions =
                table_bool(t, "grant_runtime_permissions", i.grant_runtime_permissions);
            i.retry_all_on_missing_split = table_bool(
                t,
                "retry_all_on_missing_split",
                i.retry_all_on_missing_split,
            );
            i.prompt_uninstall_on_conflict = table_bool(
                t,
                "prompt_uninstall_on_conflict",
                i.prompt_uninstall_on_conflict,
            );
            i.install_timeout = table_secs(t, "install_timeout_seconds", i.install_timeout);
            i.obb_push_timeout = table_secs(t, "obb_push_timeout_seconds", i.obb_push_timeout);
            i.uninstall_timeout =
                table_secs(t, "uninstall_timeout_seconds", i.uninstall_timeout);
        }

        cfg
    }
}

pub(crate) fn table_bool(table: &Table, key: &str, default: bool) -> bool {
    table
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or(default)
}

pub(crate) fn table_u64(table: &Table, key: &str, default: u64) -> u64 {
    table
        .get(key)
        .and_then(Value::as_integer)
        .filter(|v| *v >= 0)
        .map(|v| v as u64)
        .unwrap_or(default)
}

pub(crate) fn table_str(table: &Table, key: &str, default: &str) -> String {
    table
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

pub(crate) fn table_secs(table: &Table, key: &str, default: Duration) -> Duration {
    table
        .get(key)
        .and_then(Value::as_integer)
        .filter(|v| *v >= 0)
        .map(|v| Duration::from_secs(v as u64))
        .unwrap_or(default)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ProvisionerConfig::default();
        assert!(cfg.spoofing.enabled);
        assert!(cfg.spoofing.backup_original_properties);
        assert!(cfg.users.use_ephemeral_users);
        assert_eq!(cfg.users.creation_retries, 3);
        assert_eq!(cfg.users.min_storage_mb, 500);
        assert_eq!(cfg.install.install_timeout, Duration::from_secs(900));
        assert!(!cfg.install.allow_downgrade);
    }

    #[test]
    fn test_partial_overlay_keeps_defaults() {
        let doc = r#"
[users]
use_ephemeral_users = false
min_storage_mb = 100

[install]
allow_downgrade = true
"#;
        let table: Table = toml::from_str(doc).unwrap();
        let cfg = ProvisionerConfig::from_table(&table);

        assert!(!cfg.users.use_ephemeral_users);
        assert_eq!(cfg.users.min_storage_mb, 100);
        // untouched keys keep their defaults
        assert_eq!(cfg.users.creation_retries, 3);
        assert!(cfg.install.allow_downgrade);
        assert!(cfg.spoofing.enabled);
    }

    #[test]
    fn test_duration_keys() {
        let doc = r#"
[users]
switch_initial_delay_seconds = 0
validate_user_switch_timeout_seconds = 5
"#;
        let table: Table = toml::from_str(doc).unwrap();
        let cfg = ProvisionerConfig::from_table(&table);
        assert_eq!(cfg.users.switch_initial_delay, Duration::ZERO);
        assert_eq!(cfg.users.switch_validate_timeout, Duration::from_secs(5));
    }
}
