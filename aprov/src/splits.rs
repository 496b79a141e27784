use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde::Deserialize;
use tempfile::TempDir;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::adb::Adb;
use crate::{Error, Result};

/// Split identifiers use underscores where ABI names use hyphens.
const ABI_MARKERS: [&str; 5] = ["arm64_v8a", "armeabi_v7a", "armeabi", "x86_64", "x86"];
const DPI_MARKERS: [&str; 8] = [
    "ldpi", "mdpi", "tvdpi", "hdpi", "xhdpi", "xxhdpi", "xxxhdpi", "nodpi",
];

/// Standard Android density buckets.
pub fn dpi_bucket(dpi: u32) -> &'static str {
    match dpi {
        0..=120 => "ldpi",
        121..=160 => "mdpi",
        161..=213 => "tvdpi",
        214..=240 => "hdpi",
        241..=320 => "xhdpi",
        321..=480 => "xxhdpi",
        481..=640 => "xxxhdpi",
        _ => "nodpi",
    }
}

/// The ABI/DPI/SDK profile split selection is matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub primary_abi: String,
    pub all_abis: Vec<String>,
    pub sdk: u32,
    pub dpi: u32,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        // common arm64 handset
        Self {
            primary_abi: "arm64-v8a".to_string(),
            all_abis: vec![
                "arm64-v8a".to_string(),
                "armeabi-v7a".to_string(),
                "armeabi".to_string(),
            ],
            sdk: 33,
            dpi: 480,
        }
    }
}

impl DeviceProfile {
    pub fn dpi_bucket(&self) -> &'static str {
        dpi_bucket(self.dpi)
    }
}

/// Reads the device's ABI/DPI/SDK profile, falling back to sensible defaults
/// field by field so a flaky query never aborts an install.
pub fn read_device_profile(adb: &dyn Adb, device: &str) -> DeviceProfile {
    let mut profile = DeviceProfile::default();

    let abi = adb.getprop(device, "ro.product.cpu.abi");
    if !abi.is_empty() {
        profile.primary_abi = abi;
    }

    let abilist = adb.getprop(device, "ro.product.cpu.abilist");
    if !abilist.is_empty() {
        profile.all_abis = abilist
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    } else {
        // derive a plausible list from the primary ABI
        profile.all_abis = if profile.primary_abi.contains("arm64") {
            vec![
                "arm64-v8a".to_string(),
                "armeabi-v7a".to_string(),
                "armeabi".to_string(),
            ]
        } else if profile.primary_abi.contains("x86_64") {
            vec!["x86_64".to_string(), "x86".to_string()]
        } else if profile.primary_abi.contains("armeabi") {
            vec!["armeabi-v7a".to_string(), "armeabi".to_string()]
        } else {
            vec![profile.primary_abi.clone()]
        };
    }

    if let Ok(dpi) = adb.getprop(device, "ro.sf.lcd_density").parse() {
        profile.dpi = dpi;
    }
    if let Ok(sdk) = adb.getprop(device, "ro.build.version.sdk").parse() {
        profile.sdk = sdk;
    }

    debug!(
        "{}: device profile abi={} abis={:?} sdk={} dpi={} ({})",
        device,
        profile.primary_abi,
        profile.all_abis,
        profile.sdk,
        profile.dpi,
        profile.dpi_bucket()
    );
    profile
}

/// The bundle's `manifest.json`, when present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleManifest {
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub split_apks: Vec<SplitEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SplitEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub file: String,
}

lazy_static! {
    // config.en, config.pt_br, foo.config.zh
    static ref LANG_SPLIT_RE: Regex =
        Regex::new(r"(?:^|\.)config\.[a-z]{2}(?:_[a-z]{2})?$").expect("static regex");
}

fn is_language_split(id: &str) -> bool {
    id.contains(".lang") || LANG_SPLIT_RE.is_match(id)
}

fn names_foreign_abi(id: &str, all_abis: &[String]) -> bool {
    let is_abi_split = ABI_MARKERS.iter().any(|m| id.contains(m));
    if !is_abi_split {
        return false;
    }
    !all_abis
        .iter()
        .any(|abi| id.contains(&abi.replace('-', "_")))
}

fn names_foreign_dpi(id: &str, bucket: &str) -> bool {
    let is_dpi_split = DPI_MARKERS.iter().any(|m| id.contains(m));
    if !is_dpi_split {
        return false;
    }
    !(id.contains(bucket) || id.contains("nodpi"))
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn file_name_lower(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn looks_like_config_split(name: &str) -> bool {
    ["config.", "split_", "_config."]
        .iter()
        .any(|m| name.contains(m))
}

/// Identifies the base package of a bundle: a manifest entry flagged as
/// base, a file literally named `base.apk`, the largest non-config-looking
/// file, or the largest file overall.
fn identify_base(
    apks: &[PathBuf],
    manifest: Option<&BundleManifest>,
    extract_dir: &Path,
) -> Option<PathBuf> {
    if let Some(manifest) = manifest {
        if let Some(entry) = manifest
            .split_apks
            .iter()
            .find(|s| s.id == "base" && !s.file.is_empty())
        {
            let candidate = extract_dir.join(&entry.file);
            if apks.contains(&candidate) {
                return Some(candidate);
            }
        }
    }

    if let Some(literal) = apks.iter().find(|p| file_name_lower(p) == "base.apk") {
        return Some(literal.clone());
    }

    let non_config: Vec<&PathBuf> = apks
        .iter()
        .filter(|p| !looks_like_config_split(&file_name_lower(p)))
        .collect();
    if let Some(largest) = non_config.iter().max_by_key(|p| file_size(p)) {
        return Some((*largest).clone());
    }

    apks.iter().max_by_key(|p| file_size(p)).cloned()
}

/// Picks the minimal correct subset of a bundle's files for a device.
///
/// With a manifest, each declared split is matched by its identifier:
/// language splits are always kept, ABI and density splits only when they
/// name something the device has, and anything unrecognized is kept by
/// default. Without a manifest the same rules run against file names. The
/// result is deterministically ordered with the base file first and the
/// rest alphabetical.
pub fn select_splits(
    apks: &[PathBuf],
    profile: &DeviceProfile,
    manifest: Option<&BundleManifest>,
    extract_dir: &Path,
) -> Result<Vec<PathBuf>> {
    if apks.is_empty() {
        return Err(Error::NoBaseApk(extract_dir.to_string_lossy().into_owned()));
    }

    let base = identify_base(apks, manifest, extract_dir)
        .ok_or_else(|| Error::NoBaseApk(extract_dir.to_string_lossy().into_owned()))?;

    let bucket = profile.dpi_bucket();
    let mut selected: BTreeSet<PathBuf> = BTreeSet::new();
    selected.insert(base.clone());

    let declared_splits = manifest
        .map(|m| m.split_apks.as_slice())
        .unwrap_or_default();

    if !declared_splits.is_empty() {
        debug!("using manifest split declarations for selection");
        for entry in declared_splits {
            let id = entry.id.to_lowercase();
            if entry.file.is_empty() || id == "base" {
                continue;
            }
            let path = extract_dir.join(&entry.file);
            if !apks.contains(&path) {
                debug!("manifest split {:?} not among extracted files", entry.file);
                continue;
            }

            if is_language_split(&id) {
                selected.insert(path);
                continue;
            }
            if names_foreign_abi(&id, &profile.all_abis) {
                debug!("excluding ABI split {} (device: {:?})", id, profile.all_abis);
                continue;
            }
            if names_foreign_dpi(&id, bucket) {
                debug!("excluding density split {} (device: {})", id, bucket);
                continue;
            }
            selected.insert(path);
        }
    } else {
        debug!("no manifest split declarations, selecting by file name");
        for apk in apks {
            if *apk == base {
                continue;
            }
            let name = file_name_lower(apk);
            if names_foreign_abi(&name, &profile.all_abis) {
                continue;
            }
            if names_foreign_dpi(&name, bucket) {
                continue;
            }
            selected.insert(apk.clone());
        }
    }

    let mut ordered: Vec<PathBuf> = selected.into_iter().collect();
    ordered.sort_by_key(|p| (*p != base, file_name_lower(p)));
    Ok(ordered)
}

/// A bundle unpacked into scratch space. The extraction directory lives as
/// long as this value does.
pub struct ExtractedBundle {
    pub dir: TempDir,
    pub apk_files: Vec<PathBuf>,
    pub obb_files: Vec<PathBuf>,
    pub manifest: Option<BundleManifest>,
    pub package_name: String,
    pub app_name: String,
}

pub const UNKNOWN_PACKAGE: &str = "unknown";

impl ExtractedBundle {
    pub fn has_known_package(&self) -> bool {
        self.package_name != UNKNOWN_PACKAGE
    }
}

/// Unpacks an `.xapk`/`.apkm`/`.zip` bundle into a temporary directory and
/// catalogs its contents. The package name comes from the manifest when one
/// exists, else from an obb directory name, else stays unknown.
pub fn extract_bundle(path: &Path) -> Result<ExtractedBundle> {
    if !path.is_file() {
        return Err(Error::MissingFile(path.to_string_lossy().into_owned()));
    }

    let dir = TempDir::with_prefix("aprov-bundle-")?;
    let mut archive = ZipArchive::new(File::open(path)?)
        .map_err(|e| Error::Generic(format!("cannot read bundle {}: {e}", path.display())))?;
    archive
        .extract(dir.path())
        .map_err(|e| Error::Generic(format!("cannot extract bundle {}: {e}", path.display())))?;

    let mut apk_files = Vec::new();
    let mut obb_files = Vec::new();
    for entry in WalkDir::new(dir.path()).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let p = entry.into_path();
        match p.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("apk") => apk_files.push(p),
            Some(ext) if ext.eq_ignore_ascii_case("obb") => obb_files.push(p),
            _ => {}
        }
    }
    apk_files.sort();
    obb_files.sort();

    let manifest: Option<BundleManifest> = {
        let manifest_path = dir.path().join("manifest.json");
        if manifest_path.is_file() {
            match fs::read_to_string(&manifest_path)
                .map_err(Error::from)
                .and_then(|text| {
                    serde_json::from_str(&text)
                        .map_err(|e| Error::Generic(format!("bad manifest.json: {e}")))
                }) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("{}: unreadable manifest.json: {}", path.display(), e);
                    None
                }
            }
        } else {
            None
        }
    };

    let mut package_name = manifest
        .as_ref()
        .and_then(|m| m.package_name.clone())
        .unwrap_or_default();

    if package_name.is_empty() {
        // obb files live under a directory named after the package
        package_name = obb_files
            .first()
            .and_then(|p| p.parent())
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| n.contains('.'))
            .unwrap_or_default();
    }
    if package_name.is_empty() {
        package_name = UNKNOWN_PACKAGE.to_string();
    }

    let app_name = manifest
        .as_ref()
        .and_then(|m| m.name.clone())
        .unwrap_or_else(|| {
            if package_name != UNKNOWN_PACKAGE {
                package_name.clone()
            } else {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| UNKNOWN_PACKAGE.to_string())
            }
        });

    info!(
        "extracted {}: {} apks, {} obbs, package {}",
        path.display(),
        apk_files.len(),
        obb_files.len(),
        package_name
    );

    Ok(ExtractedBundle {
        dir,
        apk_files,
        obb_files,
        manifest,
        package_name,
        app_name,
    })
}
