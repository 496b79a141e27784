use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use which::which;

use crate::adb::{Adb, ShellRequest};
use crate::command::{run_cmd_timeout, CmdOutput};
use crate::config::{InstallConfig, ProvisionerConfig};
use crate::patterns::PatternCatalog;
use crate::probe::{CapabilityCache, DeviceCapabilities, RUNTIME_PERMISSION_MIN_SDK};
use crate::splits::{
    extract_bundle, read_device_profile, select_splits, UNKNOWN_PACKAGE,
};
use crate::spoof::SpoofEngine;
use crate::users::UserProfileManager;
use crate::{Error, Result};

/// Terminal state of one installation, with the tool's raw output where
/// there is any to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Success,
    MissingSplit(String),
    InvalidPackage(String),
    InsufficientStorage(String),
    Conflict(String),
    UninstallFailed(String),
    UserDeclinedUninstall(String),
    Timeout(String),
    GeneralFailure(String),
}

impl InstallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::MissingSplit(_) => "missing split",
            Self::InvalidPackage(_) => "invalid package",
            Self::InsufficientStorage(_) => "insufficient storage",
            Self::Conflict(_) => "conflict",
            Self::UninstallFailed(_) => "uninstall failed",
            Self::UserDeclinedUninstall(_) => "uninstall declined",
            Self::Timeout(_) => "timeout",
            Self::GeneralFailure(_) => "failure",
        }
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::MissingSplit(d)
            | Self::InvalidPackage(d)
            | Self::InsufficientStorage(d)
            | Self::Conflict(d)
            | Self::UninstallFailed(d)
            | Self::UserDeclinedUninstall(d)
            | Self::Timeout(d)
            | Self::GeneralFailure(d) => Some(d),
        }
    }
}

/// Failures that an uninstall-and-retry can plausibly clear.
const CONFLICT_SIGNATURES: [&str; 4] = [
    "INSTALL_FAILED_ALREADY_EXISTS",
    "INSTALL_FAILED_UPDATE_INCOMPATIBLE",
    "INSTALL_FAILED_VERSION_DOWNGRADE",
    "INSTALL_FAILED_SHARED_USER_INCOMPATIBLE",
];

/// Maps raw `adb install` output to an [InstallOutcome].
pub fn classify_install_output(out: &CmdOutput) -> InstallOutcome {
    if out.timed_out() {
        return InstallOutcome::Timeout(out.combined());
    }
    if out.ok() && out.stdout.contains("Success") {
        return InstallOutcome::Success;
    }

    let text = out.combined();
    if CONFLICT_SIGNATURES.iter().any(|sig| text.contains(sig)) {
        return InstallOutcome::Conflict(text);
    }
    if text.contains("INSTALL_FAILED_MISSING_SPLIT") {
        return InstallOutcome::MissingSplit(text);
    }
    if text.contains("INSTALL_FAILED_INVALID_APK") || text.contains("INSTALL_PARSE_FAILED") {
        return InstallOutcome::InvalidPackage(text);
    }
    if text.contains("INSTALL_FAILED_INSUFFICIENT_STORAGE") {
        return InstallOutcome::InsufficientStorage(text);
    }
    InstallOutcome::GeneralFailure(text)
}

/// Decision point for uninstall-and-retry on conflicts. The library never
/// prompts by itself; interactive frontends implement this.
pub trait ConflictPrompt {
    fn confirm_uninstall(&self, package: &str, device: &str) -> bool;
}

/// Non-interactive [ConflictPrompt] with a fixed answer.
pub struct AssumeAnswer(pub bool);

impl ConflictPrompt for AssumeAnswer {
    fn confirm_uninstall(&self, _package: &str, _device: &str) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A single `.apk` file.
    Apk,
    /// A multi-file bundle: `.xapk`, `.apkm` or `.zip`.
    Bundle,
}

#[derive(Debug, Clone)]
pub struct PackageSource {
    pub path: PathBuf,
    pub kind: SourceKind,
}

impl PackageSource {
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::MissingFile(path.to_string_lossy().into_owned()));
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let kind = match ext.as_str() {
            "apk" => SourceKind::Apk,
            "xapk" | "apkm" | "zip" => SourceKind::Bundle,
            other => {
                return Err(Error::Generic(format!(
                    "unsupported package file type: .{other}"
                )))
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            kind,
        })
    }

    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

/// Best-effort package name for a standalone apk, through an external
/// `aapt`/`aapt2` if one is on PATH. Without it, conflict resolution for
/// single files degrades gracefully (no uninstall offer).
pub fn detect_package_name(apk: &Path) -> Option<String> {
    let aapt = which("aapt").or_else(|_| which("aapt2")).ok()?;
    let out = run_cmd_timeout(
        &aapt,
        &[
            "dump".to_string(),
            "badging".to_string(),
            apk.to_string_lossy().into_owned(),
        ],
        Duration::from_secs(10),
    );
    if !out.ok() {
        return None;
    }
    for line in out.stdout.lines() {
        if let Some(rest) = line.strip_prefix("package:") {
            if let Some(idx) = rest.find("name='") {
                let tail = &rest[idx + 6..];
                if let Some(end) = tail.find('\'') {
                    return Some(tail[..end].to_string());
                }
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub source: String,
    pub outcome: InstallOutcome,
}

fn base_first_order(path: &Path) -> (bool, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    (name != "base.apk", name)
}

/// Drives the end-to-end per-device workflow: capability probe, optional
/// property spoofing, optional user profile provisioning, then installation
/// of each requested package with bounded conflict and missing-split
/// retries, and auxiliary obb placement.
pub struct Orchestrator {
    adb: Arc<dyn Adb>,
    install: InstallConfig,
    spoof: SpoofEngine,
    users: UserProfileManager,
    caps: CapabilityCache,
    diagnostics: Vec<String>,
}

impl Orchestrator {
    pub fn new(adb: Arc<dyn Adb>, config: ProvisionerConfig, catalog: PatternCatalog) -> Self {
        let spoof = SpoofEngine::new(adb.clone(), config.spoofing, catalog);
        let users = UserProfileManager::new(adb.clone(), config.users);
        Self {
            adb,
            install: config.install,
            spoof,
            users,
            caps: CapabilityCache::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn adb(&self) -> Arc<dyn Adb> {
        self.adb.clone()
    }

    pub fn spoof(&mut self) -> &mut SpoofEngine {
        &mut self.spoof
    }

    pub fn users(&mut self) -> &mut UserProfileManager {
        &mut self.users
    }

    /// The session capability snapshot for a device, probing on first use.
    pub fn capabilities(&mut self, device: &str) -> DeviceCapabilities {
        self.caps.get(&*self.adb, device).clone()
    }

    pub fn reprobe(&mut self, device: &str) -> DeviceCapabilities {
        self.caps.refresh(&*self.adb, device).clone()
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    /// End-of-session cleanup for a device, honoring the caller's choices.
    pub fn cleanup_device(&mut self, device: &str, choices: crate::users::CleanupChoices) -> bool {
        let caps = self.capabilities(device);
        self.users
            .comprehensive_cleanup(device, &caps, &mut self.spoof, choices)
    }

    fn record(&mut self, msg: String) {
        self.diagnostics.push(msg);
    }

    /// Provisions a device (spoofing and/or an isolated user, as configured
    /// and as capabilities allow) and installs every source on it. Failure
    /// to provision degrades to installing for the default user; each
    /// source gets its own report.
    pub fn install_on_device(
        &mut self,
        device: &str,
        sources: &[PackageSource],
        prompt: &dyn ConflictPrompt,
    ) -> Vec<InstallReport> {
        let caps = self.capabilities(device);

        if self.spoof.config().enabled {
            if caps.can_spoof_properties() {
                let mfg = self.spoof.config().manufacturer.clone();
                let model = self.spoof.config().model.clone();
                let version = self.spoof.config().android_version.clone();
                match self.spoof.apply_device_spoofing(device, &caps, &mfg, &model, &version) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.record(format!("{device}: some properties failed to spoof or verify"))
                    }
                    Err(e) => self.record(format!("{device}: property spoofing skipped: {e}")),
                }
            } else {
                debug!(
                    "{}: skipping property spoofing (no root with resetprop)",
                    device
                );
            }
        }

        let mut target_user = None;
        if self.users.config().enabled {
            if caps.multi_user_support {
                let want_permanent = !self.users.config().use_ephemeral_users;
                let settle = self.users.config().post_creation_settle;
                match self.users.create_profile(
                    device,
                    &caps,
                    &mut self.spoof,
                    want_permanent,
                    None,
                ) {
                    Ok(profile) => {
                        info!(
                            "{}: installs target new {} user {} ({:?})",
                            device,
                            if profile.is_ephemeral { "ephemeral" } else { "permanent" },
                            profile.user_id,
                            profile.user_name
                        );
                        target_user = Some(profile.user_id);
                        if !settle.is_zero() {
                            thread::sleep(settle);
                        }
                    }
                    Err(e) => self.record(format!(
                        "{device}: user profile setup failed, installing to the default user: {e}"
                    )),
                }
            } else {
                debug!("{}: skipping user profile (no multi-user support)", device);
            }
        }

        let mut reports = Vec::new();
        for source in sources {
            let outcome = match source.kind {
                SourceKind::Apk => {
                    self.install_single(device, &caps, &source.path, target_user, prompt)
                }
                SourceKind::Bundle => {
                    self.install_bundle(device, &caps, &source.path, target_user, prompt)
                }
            };
            if let Some(diag) = outcome.diagnostic() {
                self.record(format!(
                    "{}: {} -> {}: {}",
                    device,
                    source.display_name(),
                    outcome.label(),
                    diag
                ));
            }
            reports.push(InstallReport {
                source: source.display_name(),
                outcome,
            });
        }
        reports
    }

    fn install_single(
        &mut self,
        device: &str,
        caps: &DeviceCapabilities,
        path: &Path,
        user: Option<u32>,
        prompt: &dyn ConflictPrompt,
    ) -> InstallOutcome {
        let package = detect_package_name(path);
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("{}: installing {}", device, label);

        let files = vec![path.to_path_buf()];
        self.install_apk_set(
            device,
            caps,
            &files,
            package.as_deref(),
            &label,
            user,
            prompt,
            1,
        )
    }

    fn install_bundle(
        &mut self,
        device: &str,
        caps: &DeviceCapabilities,
        path: &Path,
        user: Option<u32>,
        prompt: &dyn ConflictPrompt,
    ) -> InstallOutcome {
        let bundle = match extract_bundle(path) {
            Ok(b) => b,
            Err(e) => return InstallOutcome::InvalidPackage(format!("extraction failed: {e}")),
        };

        let profile = read_device_profile(&*self.adb, device);
        let selected = match select_splits(
            &bundle.apk_files,
            &profile,
            bundle.manifest.as_ref(),
            bundle.dir.path(),
        ) {
            Ok(s) => s,
            Err(e) => return InstallOutcome::InvalidPackage(e.to_string()),
        };

        let package = bundle.has_known_package().then(|| bundle.package_name.as_str());
        let label = bundle.app_name.clone();
        info!(
            "{}: installing {} ({} of {} files selected)",
            device,
            label,
            selected.len(),
            bundle.apk_files.len()
        );

        let mut outcome =
            self.install_apk_set(device, caps, &selected, package, &label, user, prompt, 1);

        // Selection heuristics are best-effort; a missing-split failure gets
        // one retry with the complete unfiltered set, never more.
        if self.install.retry_all_on_missing_split {
            if let InstallOutcome::MissingSplit(diag) = &outcome {
                let mut all = bundle.apk_files.clone();
                all.sort_by_key(|p| base_first_order(p));
                if all != selected {
                    warn!(
                        "{}: {} failed with a missing split, retrying with all {} files",
                        device,
                        label,
                        all.len()
                    );
                    self.record(format!(
                        "{device}: {label}: missing split on first attempt ({diag}), \
                         retrying with the complete file set"
                    ));
                    outcome =
                        self.install_apk_set(device, caps, &all, package, &label, user, prompt, 2);
                } else {
                    debug!(
                        "{}: broadened retry skipped, selection already covered every file",
                        device
                    );
                }
            }
        }

        if outcome.is_success() && !bundle.obb_files.is_empty() {
            info!(
                "{}: placing {} obb file(s) for {}",
                device,
                bundle.obb_files.len(),
                label
            );
            if !self.push_obb_files(device, caps, &bundle.obb_files, &bundle.package_name, user) {
                // the package itself is installed and stays installed
                self.record(format!(
                    "{device}: {label}: not all auxiliary obb files could be copied"
                ));
            }
        }

        outcome
    }

    fn install_apk_set(
        &mut self,
        device: &str,
        caps: &DeviceCapabilities,
        files: &[PathBuf],
        package: Option<&str>,
        label: &str,
        user: Option<u32>,
        prompt: &dyn ConflictPrompt,
        attempt: u32,
    ) -> InstallOutcome {
        if files.is_empty() {
            return InstallOutcome::InvalidPackage(format!("no files to install for {label}"));
        }

        let mut args = vec![if files.len() > 1 {
            "install-multiple".to_string()
        } else {
            "install".to_string()
        }];
        if let Some(uid) = user.filter(|u| *u != 0) {
            args.push("--user".to_string());
            args.push(uid.to_string());
        }
        if self.install.replace_existing {
            args.push("-r".to_string());
        }
        if self.install.allow_downgrade {
            args.push("-d".to_string());
        }
        if self.install.grant_runtime_permissions && caps.sdk_version >= RUNTIME_PERMISSION_MIN_SDK
        {
            args.push("-g".to_string());
        }
        args.extend(files.iter().map(|f| f.to_string_lossy().into_owned()));

        debug!(
            "{}: install attempt {} for {} ({} file(s))",
            device,
            attempt,
            label,
            files.len()
        );
        let out = self.adb.run(device, &args, self.install.install_timeout);

        match classify_install_output(&out) {
            // A conflict on the first attempt may be cleared by uninstalling
            // the existing package; the retry happens at most once and never
            // offers again.
            InstallOutcome::Conflict(diag)
                if attempt == 1 && self.install.prompt_uninstall_on_conflict =>
            {
                let package = match package.filter(|p| *p != UNKNOWN_PACKAGE) {
                    Some(p) => p,
                    None => {
                        warn!(
                            "{}: {} conflicts but its package name is unknown, cannot offer uninstall",
                            device, label
                        );
                        return InstallOutcome::Conflict(diag);
                    }
                };

                warn!("{}: {} conflicts with an installed package", device, label);
                if !prompt.confirm_uninstall(package, device) {
                    info!("{}: uninstall of {} declined", device, package);
                    return InstallOutcome::UserDeclinedUninstall(diag);
                }
                if !self.uninstall_existing(device, package, user) {
                    return InstallOutcome::UninstallFailed(diag);
                }
                info!("{}: retrying {} after uninstall", device, label);
                self.install_apk_set(
                    device,
                    caps,
                    files,
                    Some(package),
                    label,
                    user,
                    prompt,
                    attempt + 1,
                )
            }
            other => other,
        }
    }

    fn uninstall_existing(&mut self, device: &str, package: &str, user: Option<u32>) -> bool {
        info!("{}: uninstalling {}", device, package);
        let out = self
            .adb
            .uninstall(device, package, user, self.install.uninstall_timeout);
        if out.ok() && out.stdout.contains("Success") {
            return true;
        }

        let text = out.combined();
        let lowered = text.to_lowercase();
        // a package that was never installed is as good as uninstalled
        if text.contains("not installed for")
            || lowered.contains("is not installed")
            || (text.contains("DELETE_FAILED_INTERNAL_ERROR") && lowered.contains("does not exist"))
        {
            debug!("{}: {} was not installed", device, package);
            return true;
        }

        self.record(format!("{device}: failed to uninstall {package}: {text}"));
        false
    }

    /// Copies auxiliary obb files into the package's per-user storage path.
    /// The destination directory is created first (with a root fallback);
    /// one failed copy aborts the remaining ones but never undoes the
    /// already-installed package.
    fn push_obb_files(
        &mut self,
        device: &str,
        caps: &DeviceCapabilities,
        obb_files: &[PathBuf],
        package: &str,
        user: Option<u32>,
    ) -> bool {
        if package == UNKNOWN_PACKAGE {
            self.record(format!(
                "{device}: cannot place obb files without a package name"
            ));
            return false;
        }

        let obb_dir = format!(
            "/storage/emulated/{}/Android/obb/{}",
            user.unwrap_or(0),
            package
        );
        debug!("{}: creating {}", device, obb_dir);
        let mut res = self
            .adb
            .shell(device, &ShellRequest::new(["mkdir", "-p", &obb_dir]));
        if !res.ok() && caps.root_access {
            res = self.adb.shell(
                device,
                &ShellRequest::new(["mkdir", "-p", &obb_dir]).as_root(),
            );
        }
        if !res.ok() {
            warn!(
                "{}: could not create {} ({}), copies may fail",
                device,
                obb_dir,
                res.combined()
            );
        }

        for obb in obb_files {
            let name = obb
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let remote = format!("{obb_dir}/{name}");
            info!("{}: copying {}", device, name);
            let out = self
                .adb
                .push(device, obb, &remote, self.install.obb_push_timeout);
            if !out.ok() {
                self.record(format!(
                    "{device}: failed to copy obb {name}: {}",
                    out.combined()
                ));
                return false;
            }
        }
        true
    }

    /// Matches the accumulated diagnostics against known failure signatures
    /// and returns targeted remediation hints. Purely informational.
    pub fn suggest_remedies(&self) -> Vec<String> {
        let text = self.diagnostics.join(" ").to_lowercase();
        let mut hints: Vec<String> = Vec::new();
        let mut hint = |condition: bool, msg: &str| {
            if condition && !hints.iter().any(|h| h == msg) {
                hints.push(msg.to_string());
            }
        };

        hint(
            text.contains("device not found") || text.contains("device offline"),
            "Ensure the device is connected, USB debugging is enabled and the host is \
             authorized; a device can drop off during user switches or long operations.",
        );
        hint(
            text.contains("timeout") || text.contains("timed out"),
            "An operation timed out. Check device responsiveness and cable stability, and \
             raise the timeouts in the configuration for very slow devices.",
        );
        hint(
            text.contains("insufficient") || text.contains("enospc") || text.contains("storage"),
            "The device is low on storage; free up space on internal storage.",
        );
        hint(
            text.contains("permission")
                || text.contains("denied")
                || text.contains("securityexception"),
            "The Android system denied an operation. Unlock the device during sensitive steps \
             and make sure the shell can gain root where root is required.",
        );
        hint(
            text.contains("install_failed_version_downgrade"),
            "A version downgrade was rejected. Enable allow_downgrade, and note that some \
             ROMs block downgrades regardless.",
        );
        hint(
            text.contains("install_failed_missing_split"),
            "The app needs split files that were not installed together. For single apks this \
             means the file is incomplete; for bundles, keep the broadened missing-split retry \
             enabled.",
        );
        hint(
            text.contains("install_failed_invalid_apk") || text.contains("install_parse_failed"),
            "A package file is corrupted or incompatible with the device architecture.",
        );
        hint(
            text.contains("user profile setup failed")
                || text.contains("switch to user")
                || text.contains("create user"),
            "User profile provisioning failed. Verify the device supports multiple users, keep \
             it unlocked, and consider the user-limit bypass if the ceiling is reached.",
        );
        hint(
            text.contains("resetprop") || text.contains("failed to spoof"),
            "Property spoofing needs a working root solution with a resetprop binary; some \
             properties stay protected by the ROM even then.",
        );

        hints
    }
}
