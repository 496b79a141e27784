use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;

use chrono::{Datelike, Duration as ChronoDuration, Utc};
use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;

use crate::adb::{Adb, ShellRequest};
use crate::config::SpoofConfig;
use crate::patterns::{ModelProfile, PatternCatalog};
use crate::probe::DeviceCapabilities;
use crate::{Error, Result};

/// The resetprop invocation shapes tried, in order, for stubborn properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetStrategy {
    Standard,
    NonPersistent,
    Forced,
}

impl SetStrategy {
    pub const ALL: [SetStrategy; 3] = [Self::Standard, Self::NonPersistent, Self::Forced];

    fn name(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::NonPersistent => "non-persistent",
            Self::Forced => "forced",
        }
    }

    fn args(self, prop: &str, value: &str) -> Vec<String> {
        let mut args = vec!["resetprop".to_string()];
        match self {
            Self::Standard => {}
            Self::NonPersistent => args.push("-n".to_string()),
            Self::Forced => args.push("--force".to_string()),
        }
        args.push(prop.to_string());
        args.push(value.to_string());
        args
    }
}

/// Result of a verified property mutation. `command_ok` and `verified` are
/// reported separately so callers can pick their own strictness;
/// [SetOutcome::succeeded] is the engine's policy (both must hold).
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOutcome {
    pub command_ok: bool,
    pub verified: bool,
    pub strategy: Option<SetStrategy>,
}

impl SetOutcome {
    pub fn succeeded(&self) -> bool {
        self.command_ok && self.verified
    }
}

/// Properties that are commonly locked down at runtime; listed here purely
/// for operator feedback when a set fails.
const READONLY_HINTS: &[(&str, &str)] = &[
    ("ro.product.model", "hardware/bootloader enforced on many ROMs"),
    ("ro.product.device", "hardware/bootloader enforced"),
    ("ro.product.board", "hardware/bootloader enforced"),
    ("ro.hardware", "hardware identifier, typically unchangeable"),
    ("ro.bootloader", "bootloader version, typically unchangeable"),
    ("ro.boot.bootloader", "bootloader version, typically unchangeable"),
    ("ro.product.cpu.abi", "hardware ABI, typically unchangeable"),
    ("ro.product.cpu.abilist", "hardware ABI list, typically unchangeable"),
];

lazy_static! {
    static ref SERIAL_VALUE_RE: Regex =
        Regex::new(r"^[a-zA-Z0-9\-]{4,32}$").expect("static regex");
    static ref FINGERPRINT_VALUE_RE: Regex =
        Regex::new(r"^[a-zA-Z0-9][\w.\-/:%]+[a-zA-Z0-9]$").expect("static regex");
    static ref ANDROID_ID_RE: Regex = Regex::new(r"^[0-9a-fA-F]{16}$").expect("static regex");
    static ref BUILD_ID_VALUE_RE: Regex =
        Regex::new(r"^[A-Z0-9._\-]{3,64}$").expect("static regex");
    static ref GENERIC_VALUE_RE: Regex =
        Regex::new(r"^[\w.\-\s:]{1,128}$").expect("static regex");
    static ref SERIAL_RUN_RE: Regex = Regex::new(r"\{(\d+)\}").expect("static regex");
}

/// Validates a candidate value against its property class. An empty value is
/// always valid - it signals "unset/delete".
pub fn validate_property(name: &str, value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    if name == "ro.build.version.sdk" {
        return value
            .parse::<u32>()
            .map(|v| (1..=1000).contains(&v))
            .unwrap_or(false);
    }
    if name == "ro.serialno" || name == "ro.boot.serialno" {
        return SERIAL_VALUE_RE.is_match(value);
    }
    let lowered = name.to_lowercase();
    if lowered.contains("fingerprint") {
        if value.matches('/').count() < 3 || !value.contains(':') {
            return false;
        }
        return FINGERPRINT_VALUE_RE.is_match(value);
    }
    if name == "android_id" || lowered.contains("androidid") {
        return ANDROID_ID_RE.is_match(value);
    }
    if name == "ro.build.id" || name == "ro.build.display.id" {
        return BUILD_ID_VALUE_RE.is_match(value);
    }
    GENERIC_VALUE_RE.is_match(value)
}

fn looks_like_usage_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("resetprop") && (lowered.contains("usage") || lowered.contains("options:"))
}

fn random_string(len: usize, chars: &str) -> String {
    let pool: Vec<char> = chars.chars().collect();
    if pool.is_empty() {
        return String::new();
    }
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| pool[rng.gen_range(0..pool.len())])
        .collect()
}

pub fn random_hex(len: usize) -> String {
    random_string(len, "0123456789abcdef")
}

/// Backs up, generates, applies and restores system properties through
/// resetprop. Owns the per-device backup state; nothing else writes it.
pub struct SpoofEngine {
    adb: Arc<dyn Adb>,
    config: SpoofConfig,
    catalog: PatternCatalog,
    backups: HashMap<String, HashMap<String, String>>,
}

impl SpoofEngine {
    pub fn new(adb: Arc<dyn Adb>, config: SpoofConfig, catalog: PatternCatalog) -> Self {
        Self {
            adb,
            config,
            catalog,
            backups: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SpoofConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PatternCatalog {
        &self.catalog
    }

    pub fn get_property(&self, device: &str, prop: &str) -> String {
        self.adb.getprop(device, prop)
    }

    pub fn has_backups(&self, device: &str) -> bool {
        self.backups.get(device).map_or(false, |m| !m.is_empty())
    }

    pub fn backup_count(&self, device: &str) -> usize {
        self.backups.get(device).map_or(0, HashMap::len)
    }

    pub fn backed_up_value(&self, device: &str, prop: &str) -> Option<&str> {
        self.backups
            .get(device)
            .and_then(|m| m.get(prop))
            .map(String::as_str)
    }

    /// Records a property's current value before its first modification.
    /// Idempotent: later calls for the same property never overwrite the
    /// stored original. An empty stored value means "did not exist".
    pub fn backup_property(&mut self, device: &str, prop: &str) {
        if !self.config.backup_original_properties {
            return;
        }
        if self
            .backups
            .get(device)
            .map_or(false, |m| m.contains_key(prop))
        {
            return;
        }

        let original = self.get_property(device, prop);
        self.backups
            .entry(device.to_string())
            .or_default()
            .insert(prop.to_string(), original.clone());

        // A second read catches properties that are actively changing under
        // us; that is a warning, not a failure.
        let reread = self.get_property(device, prop);
        if reread != original {
            warn!(
                "{}: property {} changed during backup read (was {:?}, now {:?})",
                device, prop, original, reread
            );
        } else {
            debug!("{}: backed up {} = {:?}", device, prop, original);
        }
    }

    /// Applies a property through the strategy ladder, verifying each write
    /// with a read-back. A strategy whose failure output is the tool's own
    /// usage text is skipped as unsupported rather than counted as a real
    /// failure.
    pub fn set_with_verification(&mut self, device: &str, prop: &str, value: &str) -> SetOutcome {
        self.backup_property(device, prop);

        let mut outcome = SetOutcome::default();
        for strategy in SetStrategy::ALL {
            let res = self
                .adb
                .shell(device, &ShellRequest::new(strategy.args(prop, value)).as_root());
            if res.ok() {
                outcome.command_ok = true;
                if !self.config.settle_delay.is_zero() {
                    thread::sleep(self.config.settle_delay);
                }
                let read_back = self.get_property(device, prop);
                if read_back == value {
                    outcome.verified = true;
                    outcome.strategy = Some(strategy);
                    debug!(
                        "{}: set {} = {:?} ({} strategy, verified)",
                        device,
                        prop,
                        value,
                        strategy.name()
                    );
                    return outcome;
                }
                warn!(
                    "{}: set {} via {} strategy succeeded but read back {:?}",
                    device,
                    prop,
                    strategy.name(),
                    read_back
                );
                continue;
            }

            let text = res.combined();
            if looks_like_usage_text(&text) {
                debug!(
                    "{}: resetprop does not support the {} strategy",
                    device,
                    strategy.name()
                );
                continue;
            }
            debug!(
                "{}: {} strategy failed for {}: {}",
                device,
                strategy.name(),
                prop,
                text.lines().next().unwrap_or("no output")
            );
        }

        error!("{}: all resetprop strategies failed for {}", device, prop);
        self.explain_set_failure(device, prop);
        outcome
    }

    /// Operator feedback for a failed set: names known read-only properties
    /// and checks the SELinux mode. Log-only, no control-flow effect.
    fn explain_set_failure(&self, device: &str, prop: &str) {
        if let Some((_, hint)) = READONLY_HINTS.iter().find(|(name, _)| *name == prop) {
            info!("{}: {} is typically read-only ({})", device, prop, hint);
        } else if prop.starts_with("ro.") {
            info!(
                "{}: {} is a read-only property and may be protected by SELinux policy",
                device, prop
            );
        }

        let res = self.adb.shell(device, &ShellRequest::new(["getenforce"]));
        if res.ok() && res.stdout.trim().eq_ignore_ascii_case("enforcing") {
            info!(
                "{}: SELinux is enforcing, which can prevent setting some properties",
                device
            );
        }
    }

    fn delete_property(&self, device: &str, prop: &str) -> bool {
        let res = self.adb.shell(
            device,
            &ShellRequest::new(["resetprop", "--delete", prop]).as_root(),
        );
        if res.ok() {
            return true;
        }
        // deleting something that was never there is fine
        let text = res.combined().to_lowercase();
        text.contains("not found") || text.contains("no such property")
    }

    /// Restores a property to its backed-up original. Requires backups:
    /// with them disabled, or with no entry for the property, there is no
    /// known original to restore and this reports failure (after a
    /// best-effort delete in the no-entry case). An empty stored original
    /// deletes the property instead of setting it. Read-back mismatches on
    /// the restore write are logged, not failed.
    pub fn restore_property(&mut self, device: &str, prop: &str) -> bool {
        if !self.config.backup_original_properties {
            warn!(
                "{}: property backup is disabled, cannot restore {}",
                device, prop
            );
            return false;
        }

        let original = self
            .backups
            .get(device)
            .and_then(|m| m.get(prop))
            .cloned();

        match original {
            Some(original) if !original.is_empty() => {
                info!("{}: restoring {} to {:?}", device, prop, original);
                let outcome = self.set_with_verification(device, prop, &original);
                if outcome.command_ok && !outcome.verified {
                    warn!(
                        "{}: restore of {} ran but read-back does not match yet",
                        device, prop
                    );
                }
                outcome.command_ok
            }
            Some(_) => {
                info!(
                    "{}: original value of {} was empty, deleting property",
                    device, prop
                );
                self.delete_property(device, prop)
            }
            None => {
                warn!(
                    "{}: no backup for {}, attempting delete instead",
                    device, prop
                );
                self.delete_property(device, prop);
                false
            }
        }
    }

    /// Restores every property backed up for the device - or, when backups
    /// are disabled, deletes the whole configured spoofable set. The backup
    /// map for the device is cleared only if every restoration succeeded.
    pub fn restore_all(&mut self, device: &str) -> bool {
        let backup_enabled = self.config.backup_original_properties;

        let props: Vec<String> = if backup_enabled {
            match self.backups.get(device) {
                Some(m) if !m.is_empty() => m.keys().cloned().collect(),
                _ => {
                    info!("{}: no properties to restore", device);
                    return true;
                }
            }
        } else {
            info!(
                "{}: backups disabled, deleting the configured spoofable set",
                device
            );
            self.catalog.master_props().to_vec()
        };

        info!("{}: restoring {} properties", device, props.len());
        let mut all_ok = true;
        for prop in &props {
            let ok = if backup_enabled {
                self.restore_property(device, prop)
            } else {
                self.delete_property(device, prop)
            };
            if !ok {
                all_ok = false;
            }
        }

        if all_ok {
            self.backups.remove(device);
            info!("{}: property restoration complete", device);
        } else {
            error!("{}: some properties failed to restore", device);
        }
        all_ok
    }

    fn generate_build_id(&self, mfg_key: &str, version_key: &str) -> String {
        let mut rng = rand::thread_rng();

        let prefix = self
            .catalog
            .manufacturer(mfg_key)
            .and_then(|p| p.build_id_patterns.get(version_key))
            .and_then(|prefixes| prefixes.choose(&mut rng))
            .cloned()
            .unwrap_or_else(|| {
                match version_key {
                    "14" => "UP1A",
                    "13" => "TQ1A",
                    _ => "SP1A",
                }
                .to_string()
            });

        // a plausible build date, one to twelve months back
        let date = Utc::now() - ChronoDuration::days(rng.gen_range(30..=360));
        format!(
            "{}.{}.{:03}",
            prefix,
            date.format("%y%m%d"),
            rng.gen_range(1..=999)
        )
    }

    fn generate_incremental(&self, mfg_key: &str, model: &ModelProfile, build_id: &str) -> String {
        let mut rng = rand::thread_rng();
        match mfg_key {
            "samsung" => {
                // firmware-style: model code + region + tier + year/month code
                let base = model
                    .model
                    .rsplit('-')
                    .next()
                    .unwrap_or(model.model.as_str());
                let region = ["XX", "OXM", "EUX"].choose(&mut rng).expect("non-empty");
                let tier = ['U', 'S', 'E'].choose(&mut rng).expect("non-empty");
                let year_offset = (Utc::now().year() - 2018 + rng.gen_range(-1..=0)).max(0) as u8;
                let year_char = (b'A' + year_offset.min(25)) as char;
                let month_char = "ABCDEFGHIJKL"
                    .chars()
                    .nth(rng.gen_range(0..12))
                    .expect("in range");
                format!(
                    "{}{}{}{}{}{}{}",
                    base,
                    region,
                    tier,
                    rng.gen_range(1..=5),
                    year_char,
                    month_char,
                    rng.gen_range(1..=9)
                )
            }
            "google" => rng.gen_range(7_000_000..=12_999_999).to_string(),
            "xiaomi" => format!("{}.{}", build_id, rng.gen_range(10_000..=99_999)),
            _ => format!("{}.{}", build_id, rng.gen_range(100_000..=999_999)),
        }
    }

    /// Renders the catalog's fingerprint template for a manufacturer, model
    /// and Android version key.
    pub fn generate_fingerprint(
        &self,
        mfg_key: &str,
        model: &ModelProfile,
        version_key: &str,
    ) -> String {
        let (eff_key, brand) = match self.catalog.manufacturer_or_default(mfg_key) {
            Some((key, pattern)) => (key, pattern.brand.clone()),
            None => (mfg_key.to_lowercase(), mfg_key.to_lowercase()),
        };

        let product = if !model.product.is_empty() {
            model.product.clone()
        } else if !model.device.is_empty() {
            model.device.clone()
        } else {
            "generic_product".to_string()
        };
        let device = if !model.device.is_empty() {
            model.device.clone()
        } else {
            product.clone()
        };

        let release = self
            .catalog
            .version(version_key)
            .map(|v| v.release.clone())
            .unwrap_or_else(|| version_key.to_string());

        let build_id = self.generate_build_id(&eff_key, version_key);
        let incremental = self.generate_incremental(&eff_key, model, &build_id);

        self.catalog
            .fingerprint_template
            .replace("{brand}", &brand)
            .replace("{product}", &product)
            .replace("{device}", &device)
            .replace("{release}", &release)
            .replace("{build_id}", &build_id)
            .replace("{incremental}", &incremental)
            .replace("{type}", &self.catalog.build_type)
            .replace("{tags}", &self.catalog.build_tags)
    }

    /// Expands the manufacturer's declarative serial pattern: every `{N}`
    /// run becomes N random characters from the manufacturer's alphabet,
    /// literals pass through.
    pub fn generate_serial(&self, mfg_key: &str) -> String {
        let (pattern, chars) = self
            .catalog
            .manufacturer_or_default(mfg_key)
            .map(|(_, p)| (p.serial_pattern.clone(), p.serial_chars.clone()))
            .unwrap_or_else(|| {
                (
                    "{12}".to_string(),
                    "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789".to_string(),
                )
            });

        if SERIAL_RUN_RE.is_match(&pattern) {
            let mut out = String::new();
            let mut last = 0;
            for caps in SERIAL_RUN_RE.captures_iter(&pattern) {
                let whole = caps.get(0).expect("match");
                out.push_str(&pattern[last..whole.start()]);
                let len: usize = caps[1].parse().unwrap_or(8);
                out.push_str(&random_string(len, &chars));
                last = whole.end();
            }
            out.push_str(&pattern[last..]);
            return out;
        }

        if let Ok(len) = pattern.parse::<usize>() {
            return random_string(len, &chars);
        }

        random_string(12, &chars)
    }

    /// Rewrites the secure `android_id` setting with a random 16-hex value,
    /// for the current user or the given one. Root required. A verification
    /// mismatch is logged but the command-level success stands.
    pub fn spoof_android_id(&mut self, device: &str, user: Option<u32>) -> bool {
        let android_id = random_hex(16);
        if !validate_property("android_id", &android_id) {
            error!("{}: generated android_id failed validation", device);
            return false;
        }

        let mut args = vec!["settings".to_string(), "put".to_string()];
        if let Some(uid) = user {
            args.push("--user".to_string());
            args.push(uid.to_string());
        }
        args.extend(
            ["secure", "android_id", android_id.as_str()]
                .iter()
                .map(|s| s.to_string()),
        );

        let res = self.adb.shell(device, &ShellRequest::new(args).as_root());
        if !res.ok() {
            error!(
                "{}: failed to set android_id{}: {}",
                device,
                user.map(|u| format!(" for user {u}")).unwrap_or_default(),
                res.combined()
            );
            return false;
        }

        let mut verify_args = vec!["settings".to_string(), "get".to_string()];
        if let Some(uid) = user {
            verify_args.push("--user".to_string());
            verify_args.push(uid.to_string());
        }
        verify_args.push("secure".to_string());
        verify_args.push("android_id".to_string());

        let verify = self
            .adb
            .shell(device, &ShellRequest::new(verify_args).as_root());
        if verify.ok() && verify.stdout.trim() == android_id {
            debug!("{}: android_id set and verified", device);
        } else {
            warn!(
                "{}: android_id set but verification read {:?}",
                device,
                verify.stdout.trim()
            );
        }
        true
    }

    /// Applies a full device identity to the device: resolves the
    /// manufacturer pattern and model, generates fingerprint/serial/version
    /// values, filters them through the feature toggles and the catalog's
    /// master list, validates each value, and sets the survivors through the
    /// verified path. Requires root plus resetprop; returns Ok(true) only
    /// if every attempted property both set and verified.
    pub fn apply_device_spoofing(
        &mut self,
        device: &str,
        caps: &DeviceCapabilities,
        mfg_key: &str,
        model_hint: &str,
        version_key: &str,
    ) -> Result<bool> {
        if !caps.can_spoof_properties() {
            return Err(Error::CapabilityGap(
                device.to_string(),
                "root access with resetprop".to_string(),
            ));
        }

        let (eff_key, pattern) = self
            .catalog
            .manufacturer_or_default(mfg_key)
            .map(|(k, p)| (k, p.clone()))
            .ok_or_else(|| Error::new_generic("pattern catalog has no manufacturers"))?;
        if eff_key != mfg_key.to_lowercase() {
            warn!(
                "unknown manufacturer {:?}, using {:?} instead",
                mfg_key, eff_key
            );
        }

        let model = self.resolve_model(&pattern.models, model_hint);
        info!(
            "{}: spoofing as {} {} (Android {})",
            device, pattern.manufacturer, model.display_name, version_key
        );

        let fingerprint = self.generate_fingerprint(&eff_key, &model, version_key);
        let serial = self.generate_serial(&eff_key);
        let (release, sdk) = self
            .catalog
            .version(version_key)
            .map(|v| (v.release.clone(), v.sdk))
            .unwrap_or_else(|| (version_key.to_string(), 33));

        // build id and incremental come out of the fingerprint so the
        // individual properties stay mutually consistent
        let fp_parts: Vec<&str> = fingerprint.split('/').collect();
        let build_id = fp_parts
            .get(3)
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.generate_build_id(&eff_key, version_key));
        let incremental = fp_parts
            .get(4)
            .and_then(|s| s.split(':').next())
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.generate_incremental(&eff_key, &model, &build_id));

        let mut rng = rand::thread_rng();
        let build_date = Utc::now() - ChronoDuration::days(rng.gen_range(30..=180));

        let mut candidates: BTreeMap<String, String> = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            candidates.insert(k.to_string(), v);
        };

        put("ro.product.brand", pattern.brand.clone());
        put("ro.product.manufacturer", pattern.manufacturer.clone());
        put("ro.product.model", model.model.clone());
        put("ro.product.name", model.product.clone());
        put("ro.product.device", model.device.clone());
        put("ro.product.board", model.board.clone());

        put("ro.build.fingerprint", fingerprint.clone());
        put("ro.vendor.build.fingerprint", fingerprint.clone());
        put("ro.system.build.fingerprint", fingerprint.clone());
        put("ro.odm.build.fingerprint", fingerprint.clone());
        put("ro.build.id", build_id.clone());
        put(
            "ro.build.display.id",
            format!("{}.{}", build_id, incremental),
        );
        put("ro.build.version.incremental", incremental.clone());
        put(
            "ro.build.description",
            format!(
                "{}-{} {} {} {} {}",
                model.product, self.catalog.build_type, release, build_id, incremental,
                self.catalog.build_tags
            ),
        );
        put("ro.build.type", self.catalog.build_type.clone());
        put("ro.build.tags", self.catalog.build_tags.clone());
        put(
            "ro.build.host",
            format!(
                "android-build-{}{}.c.android.com",
                ["gke", "chi", "sfo"].choose(&mut rng).expect("non-empty"),
                rng.gen_range(10..=99)
            ),
        );
        put("ro.build.user", "android-build".to_string());
        put("ro.build.date.utc", build_date.timestamp().to_string());
        put(
            "ro.build.date",
            build_date.format("%a %b %d %H:%M:%S UTC %Y").to_string(),
        );

        put("ro.build.version.release", release);
        put("ro.build.version.sdk", sdk.to_string());

        put("ro.serialno", serial.clone());
        put("ro.boot.serialno", serial);

        let selected = self.filter_by_toggles(candidates);

        if self.config.spoof_android_id {
            self.spoof_android_id(device, None);
        }

        if selected.is_empty() {
            info!(
                "{}: no properties selected for spoofing under the current configuration",
                device
            );
            return Ok(true);
        }

        info!("{}: setting {} properties", device, selected.len());
        let mut all_ok = true;
        for (prop, value) in &selected {
            if !validate_property(prop, value) {
                warn!(
                    "{}: invalid value for {}: {:?}, skipping",
                    device, prop, value
                );
                all_ok = false;
                continue;
            }
            if !self.set_with_verification(device, prop, value).succeeded() {
                all_ok = false;
            }
        }

        if all_ok {
            info!("{}: all selected properties applied and verified", device);
        } else {
            warn!("{}: some properties failed to apply or verify", device);
        }
        Ok(all_ok)
    }

    /// Picks a random manufacturer, model and Android version and applies
    /// them - used when provisioning a fresh user profile so consecutive
    /// profiles look like unrelated devices. Skips cleanly when disabled;
    /// degrades to Ok(false) when the device cannot spoof.
    pub fn apply_random_fingerprint(
        &mut self,
        device: &str,
        caps: &DeviceCapabilities,
    ) -> Result<bool> {
        if !self.config.auto_spoof_on_user_creation {
            debug!("{}: auto-spoof on user creation is disabled", device);
            return Ok(true);
        }
        if !caps.can_spoof_properties() {
            warn!(
                "{}: root with resetprop unavailable, skipping identity randomization",
                device
            );
            return Ok(false);
        }

        let (mfg, version) = {
            let mut rng = rand::thread_rng();
            let mfgs: Vec<&String> = self.catalog.manufacturers.keys().collect();
            let mfg = match mfgs.choose(&mut rng) {
                Some(m) => (*m).clone(),
                None => return Err(Error::new_generic("pattern catalog has no manufacturers")),
            };
            let versions: Vec<&String> = self.catalog.android_versions.keys().collect();
            let version = versions
                .choose(&mut rng)
                .map(|v| (*v).clone())
                .unwrap_or_else(|| "13".to_string());
            (mfg, version)
        };

        info!(
            "{}: randomizing device identity ({} / Android {})",
            device, mfg, version
        );
        self.apply_device_spoofing(device, caps, &mfg, "", &version)
    }

    fn resolve_model(&self, models: &[ModelProfile], hint: &str) -> ModelProfile {
        if !hint.is_empty() {
            if let Some(found) = models.iter().find(|m| {
                m.model.eq_ignore_ascii_case(hint) || m.display_name.eq_ignore_ascii_case(hint)
            }) {
                return found.clone();
            }
            warn!("model {:?} not found in catalog, choosing at random", hint);
        }

        let mut rng = rand::thread_rng();
        models
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(ModelProfile::generic)
    }

    fn filter_by_toggles(&self, candidates: BTreeMap<String, String>) -> BTreeMap<String, String> {
        let fingerprint_group = |k: &str| {
            [
                "fingerprint",
                "build.id",
                "display.id",
                "incremental",
                "description",
                "build.type",
                "build.tags",
                "build.host",
                "build.user",
                "build.date",
            ]
            .iter()
            .any(|m| k.contains(m))
        };
        let serial_group = |k: &str| k.contains("serialno");
        let model_group = |k: &str| {
            ["product.", ".board", ".model", ".device", ".brand", ".manufacturer"]
                .iter()
                .any(|m| k.contains(m))
        };
        let version_group = |k: &str| k.contains("version.release") || k.contains("version.sdk");

        candidates
            .into_iter()
            .filter(|(k, _)| {
                (self.config.spoof_build_fingerprint && fingerprint_group(k))
                    || (self.config.spoof_serial_number && serial_group(k))
                    || (self.config.spoof_device_model && model_group(k))
                    || (self.config.spoof_android_version_props && version_group(k))
            })
            .filter(|(k, _)| self.catalog.is_spoofable(k))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::CmdOutput;
    use crate::testing::ScriptedAdb;

    fn test_config() -> SpoofConfig {
        SpoofConfig {
            settle_delay: std::time::Duration::ZERO,
            ..SpoofConfig::default()
        }
    }

    fn engine(adb: ScriptedAdb) -> SpoofEngine {
        SpoofEngine::new(Arc::new(adb), test_config(), PatternCatalog::builtin())
    }

    fn rooted_caps() -> DeviceCapabilities {
        DeviceCapabilities {
            device_id: "SER123".to_string(),
            root_access: true,
            resetprop_available: true,
            multi_user_support: true,
            ephemeral_user_support: true,
            sdk_version: 33,
        }
    }

    #[test]
    fn test_serial_shape_samsung() {
        let eng = engine(ScriptedAdb::new());
        let re = Regex::new(r"^R[A-Z0-9]{8}$").unwrap();
        for _ in 0..20 {
            let serial = eng.generate_serial("samsung");
            assert_eq!(serial.len(), 9);
            assert!(re.is_match(&serial), "bad serial {serial}");
        }
    }

    #[test]
    fn test_serial_multiple_runs() {
        let eng = engine(ScriptedAdb::new());
        // google's pattern is {8}{8}
        let serial = eng.generate_serial("google");
        assert_eq!(serial.len(), 16);
        assert!(serial.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_fingerprint_shape_google_13() {
        let eng = engine(ScriptedAdb::new());
        let model = eng.catalog().manufacturer("google").unwrap().models[0].clone();
        let re =
            Regex::new(r"^google/husky/husky:13/[A-Z0-9]{4}\.\d{6}\.\d{3}/\d+:user/release-keys$")
                .unwrap();
        for _ in 0..10 {
            let fp = eng.generate_fingerprint("google", &model, "13");
            assert!(re.is_match(&fp), "bad fingerprint {fp}");
            assert!(fp.matches('/').count() >= 3);
            assert!(fp.contains(':'));
            assert!(validate_property("ro.build.fingerprint", &fp));
        }
    }

    #[test]
    fn test_validate_property() {
        assert!(validate_property("ro.build.version.sdk", "33"));
        assert!(!validate_property("ro.build.version.sdk", "zero"));
        assert!(!validate_property("ro.build.version.sdk", "5000"));

        assert!(validate_property("ro.serialno", "R58M12ABCDE"));
        assert!(!validate_property("ro.serialno", "no spaces allowed"));
        assert!(!validate_property("ro.serialno", "abc"));

        assert!(validate_property(
            "ro.build.fingerprint",
            "google/husky/husky:14/AP1A.240305.002/11425009:user/release-keys"
        ));
        assert!(!validate_property("ro.build.fingerprint", "not-a-fingerprint"));

        assert!(validate_property("android_id", "0123456789abcdef"));
        assert!(!validate_property("android_id", "0123"));

        assert!(validate_property("ro.build.id", "TP1A.220624.014"));
        // empty always valid - means unset
        assert!(validate_property("ro.product.model", ""));
    }

    #[test]
    fn test_backup_is_idempotent() {
        let adb = ScriptedAdb::new()
            .once("getprop ro.product.model", CmdOutput::success("SM-ORIG"))
            .once("getprop ro.product.model", CmdOutput::success("SM-ORIG"))
            .on("getprop ro.product.model", CmdOutput::success("CHANGED"));
        let mut eng = engine(adb);

        eng.backup_property("SER123", "ro.product.model");
        assert_eq!(
            eng.backed_up_value("SER123", "ro.product.model"),
            Some("SM-ORIG")
        );

        // further backups never overwrite the stored original, even though
        // the property now reads differently
        eng.backup_property("SER123", "ro.product.model");
        assert_eq!(
            eng.backed_up_value("SER123", "ro.product.model"),
            Some("SM-ORIG")
        );
        assert_eq!(eng.backup_count("SER123"), 1);
    }

    #[test]
    fn test_backup_disabled_is_noop() {
        let adb = ScriptedAdb::new();
        let mut eng = SpoofEngine::new(
            Arc::new(adb),
            SpoofConfig {
                backup_original_properties: false,
                settle_delay: std::time::Duration::ZERO,
                ..SpoofConfig::default()
            },
            PatternCatalog::builtin(),
        );
        eng.backup_property("SER123", "ro.product.model");
        assert_eq!(eng.backup_count("SER123"), 0);
        // and restoration then fails explicitly
        assert!(!eng.restore_property("SER123", "ro.product.model"));
    }

    #[test]
    fn test_set_with_verification_strategy_fallback() {
        // first strategy's flags are unsupported (usage text), second works
        let adb = ScriptedAdb::new()
            .once("getprop ro.x", CmdOutput::success(""))
            .once("getprop ro.x", CmdOutput::success(""))
            .once(
                "resetprop ro.x NEW",
                CmdOutput::failure(1, "resetprop: usage: resetprop [options] NAME VALUE"),
            )
            .once("resetprop -n ro.x NEW", CmdOutput::success(""))
            .on("getprop ro.x", CmdOutput::success("NEW"));
        let mut eng = engine(adb);

        let outcome = eng.set_with_verification("SER123", "ro.x", "NEW");
        assert!(outcome.succeeded());
        assert_eq!(outcome.strategy, Some(SetStrategy::NonPersistent));
    }

    #[test]
    fn test_set_failure_exhausts_strategies() {
        let adb = ScriptedAdb::new()
            .on("resetprop", CmdOutput::failure(1, "permission denied"))
            .on("getprop ro.x", CmdOutput::success("OLD"));
        let mut eng = engine(adb);

        let outcome = eng.set_with_verification("SER123", "ro.x", "NEW");
        assert!(!outcome.succeeded());
        assert!(!outcome.command_ok);
    }

    #[test]
    fn test_restore_applies_backed_up_value() {
        let adb = ScriptedAdb::new()
            // backup reads the original twice
            .once("getprop ro.product.model", CmdOutput::success("SM-ORIG"))
            .once("getprop ro.product.model", CmdOutput::success("SM-ORIG"))
            // the spoofed set verifies against the new value
            .once("getprop ro.product.model", CmdOutput::success("SM-FAKE"))
            // the restore verifies against the original again
            .on("getprop ro.product.model", CmdOutput::success("SM-ORIG"));
        let mut eng = engine(adb);

        assert!(eng
            .set_with_verification("SER123", "ro.product.model", "SM-FAKE")
            .succeeded());
        assert!(eng.restore_property("SER123", "ro.product.model"));
    }

    #[test]
    fn test_restore_of_unbacked_property_fails() {
        let adb = ScriptedAdb::new();
        let mut eng = engine(adb);
        // never backed up: must not fabricate a restoration
        assert!(!eng.restore_property("SER123", "ro.product.model"));
    }

    #[test]
    fn test_restore_empty_original_deletes() {
        let adb = ScriptedAdb::new()
            .once("getprop ro.custom.prop", CmdOutput::success(""))
            .once("getprop ro.custom.prop", CmdOutput::success(""));
        let mut eng = engine(adb);

        eng.backup_property("SER123", "ro.custom.prop");
        assert_eq!(eng.backed_up_value("SER123", "ro.custom.prop"), Some(""));
        assert!(eng.restore_property("SER123", "ro.custom.prop"));
    }

    #[test]
    fn test_restore_all_clears_backups_only_on_full_success() {
        let adb = ScriptedAdb::new()
            .once("getprop ro.a", CmdOutput::success("one"))
            .once("getprop ro.a", CmdOutput::success("one"))
            // restore write fails on every strategy
            .on("resetprop", CmdOutput::failure(1, "read-only"))
            .on("getprop ro.a", CmdOutput::success("spoofed"));
        let mut eng = engine(adb);

        eng.backup_property("SER123", "ro.a");
        assert!(!eng.restore_all("SER123"));
        assert!(eng.has_backups("SER123"));
    }

    #[test]
    fn test_spoofing_requires_capabilities() {
        let mut eng = engine(ScriptedAdb::new());
        let caps = DeviceCapabilities {
            device_id: "SER123".to_string(),
            ..DeviceCapabilities::default()
        };
        assert!(matches!(
            eng.apply_device_spoofing("SER123", &caps, "samsung", "", "13"),
            Err(Error::CapabilityGap(_, _))
        ));
    }

    #[test]
    fn test_empty_master_list_makes_spoofing_a_noop() {
        let adb = ScriptedAdb::new();
        let mut catalog = PatternCatalog::builtin();
        catalog.props_to_spoof = Some(Vec::new());
        let mut eng = SpoofEngine::new(
            Arc::new(adb),
            SpoofConfig {
                spoof_android_id: false,
                settle_delay: std::time::Duration::ZERO,
                ..SpoofConfig::default()
            },
            catalog,
        );

        let res = eng
            .apply_device_spoofing("SER123", &rooted_caps(), "samsung", "", "13")
            .unwrap();
        assert!(res);
        assert_eq!(eng.backup_count("SER123"), 0);
    }

    #[test]
    fn test_apply_spoofing_sets_and_verifies() {
        // Answer every resetprop with success and make every getprop read
        // back whatever the last resetprop wrote, by scripting the generic
        // fallback: default unmatched responses succeed with empty output,
        // so only the verification reads need care. Instead of reproducing
        // the full exchange we restrict the master list to two stable
        // properties.
        let adb = ScriptedAdb::new()
            .on("getprop ro.build.type", CmdOutput::success("user"))
            .on("getprop ro.build.user", CmdOutput::success("android-build"));
        let mut catalog = PatternCatalog::builtin();
        catalog.props_to_spoof = Some(vec![
            "ro.build.type".to_string(),
            "ro.build.user".to_string(),
        ]);
        let mut eng = SpoofEngine::new(
            Arc::new(adb),
            SpoofConfig {
                spoof_android_id: false,
                backup_original_properties: false,
                settle_delay: std::time::Duration::ZERO,
                ..SpoofConfig::default()
            },
            catalog,
        );

        let ok = eng
            .apply_device_spoofing("SER123", &rooted_caps(), "samsung", "", "13")
            .unwrap();
        assert!(ok);
    }
}
