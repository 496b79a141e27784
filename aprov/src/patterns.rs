use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use lazy_static::lazy_static;
use toml::{Table, Value};

use crate::config::{table_str, table_u64};
use crate::{Error, Result};

/// Manufacturer key used whenever a requested key is unknown.
pub const DEFAULT_MANUFACTURER: &str = "samsung";

pub const DEFAULT_FINGERPRINT_TEMPLATE: &str =
    "{brand}/{product}/{device}:{release}/{build_id}/{incremental}:{type}/{tags}";
pub const DEFAULT_BUILD_TYPE: &str = "user";
pub const DEFAULT_BUILD_TAGS: &str = "release-keys";

lazy_static! {
    /// Properties the engine is allowed to rewrite unless a catalog document
    /// overrides the list. Restoration with backups disabled also walks this
    /// list when deleting.
    pub static ref DEFAULT_PROPS_TO_SPOOF: Vec<String> = [
        "ro.product.brand",
        "ro.product.manufacturer",
        "ro.product.model",
        "ro.product.name",
        "ro.product.device",
        "ro.product.board",
        "ro.build.fingerprint",
        "ro.vendor.build.fingerprint",
        "ro.system.build.fingerprint",
        "ro.odm.build.fingerprint",
        "ro.build.id",
        "ro.build.display.id",
        "ro.build.version.incremental",
        "ro.build.version.release",
        "ro.build.version.sdk",
        "ro.serialno",
        "ro.boot.serialno",
        "ro.build.description",
        "ro.build.type",
        "ro.build.tags",
        "ro.build.host",
        "ro.build.user",
        "ro.build.date",
        "ro.build.date.utc",
        "ro.miui.ui.version.name",
        "ro.miui.ui.version.code",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProfile {
    pub product: String,
    pub device: String,
    pub model: String,
    pub board: String,
    pub display_name: String,
    pub hardware: String,
}

impl ModelProfile {
    /// Stand-in profile for manufacturers with no model entries.
    pub fn generic() -> Self {
        Self {
            product: "generic_product".to_string(),
            device: "generic_device".to_string(),
            model: "GenericModel".to_string(),
            board: "generic_board".to_string(),
            display_name: "Generic Phone".to_string(),
            hardware: "generic_hw".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManufacturerPattern {
    pub brand: String,
    pub manufacturer: String,
    pub models: Vec<ModelProfile>,
    /// Build-id prefixes keyed by Android version key ("13" -> ["TP1A", ..]).
    pub build_id_patterns: BTreeMap<String, Vec<String>>,
    /// Serial shape, e.g. `R{8}`: literal prefix/suffix around a run of
    /// random characters drawn from `serial_chars`.
    pub serial_pattern: String,
    pub serial_chars: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndroidVersion {
    pub release: String,
    pub sdk: u32,
}

/// The device pattern catalog: loaded once, read-only thereafter.
#[derive(Debug, Clone)]
pub struct PatternCatalog {
    pub manufacturers: BTreeMap<String, ManufacturerPattern>,
    pub android_versions: BTreeMap<String, AndroidVersion>,
    pub fingerprint_template: String,
    pub build_type: String,
    pub build_tags: String,
    /// `None` means "key absent, use the built-in master list"; an explicit
    /// empty list turns spoofing into a no-op.
    pub props_to_spoof: Option<Vec<String>>,
}

fn model(
    product: &str,
    device: &str,
    model: &str,
    board: &str,
    display_name: &str,
    hardware: &str,
) -> ModelProfile {
    ModelProfile {
        product: product.to_string(),
        device: device.to_string(),
        model: model.to_string(),
        board: board.to_string(),
        display_name: display_name.to_string(),
        hardware: hardware.to_string(),
    }
}

fn build_ids(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
        .collect()
}

const SERIAL_ALNUM: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

impl PatternCatalog {
    pub fn builtin() -> Self {
        let mut manufacturers = BTreeMap::new();

        manufacturers.insert(
            "samsung".to_string(),
            ManufacturerPattern {
                brand: "samsung".to_string(),
                manufacturer: "samsung".to_string(),
                models: vec![
                    model("dm3qxeea", "dm3q", "SM-S908B", "dm3q", "Galaxy S22 Ultra", "qcom"),
                    model(
                        "gts7xlwifi",
                        "gts7xlwifi",
                        "SM-T970",
                        "kona",
                        "Galaxy Tab S7+ Wi-Fi",
                        "qcom",
                    ),
                ],
                build_id_patterns: build_ids(&[
                    ("13", &["TP1A", "TQ1A"]),
                    ("14", &["UP1A", "UQ1A"]),
                ]),
                serial_pattern: "R{8}".to_string(),
                serial_chars: SERIAL_ALNUM.to_string(),
            },
        );

        manufacturers.insert(
            "google".to_string(),
            ManufacturerPattern {
                brand: "google".to_string(),
                manufacturer: "Google".to_string(),
                models: vec![
                    model("husky", "husky", "Pixel 8 Pro", "husky", "Pixel 8 Pro", "husky"),
                    model("oriole", "oriole", "Pixel 6", "slider", "Pixel 6", "slider"),
                ],
                build_id_patterns: build_ids(&[
                    ("13", &["TQ1A", "TQ2A"]),
                    ("14", &["UQ1A", "UD1A"]),
                ]),
                serial_pattern: "{8}{8}".to_string(),
                serial_chars: SERIAL_ALNUM.to_string(),
            },
        );

        manufacturers.insert(
            "xiaomi".to_string(),
            ManufacturerPattern {
                brand: "xiaomi".to_string(),
                manufacturer: "Xiaomi".to_string(),
                models: vec![
                    model("venus", "venus", "M2011K2G", "kona", "Mi 11", "qcom"),
                    model("marble", "marble", "2211133C", "taro", "13 Pro", "qcom"),
                ],
                build_id_patterns: build_ids(&[
                    ("13", &["TQ1A", "TQ2A"]),
                    ("14", &["UQ1A", "UD1A"]),
                ]),
                serial_pattern: "{10}".to_string(),
                serial_chars: SERIAL_ALNUM.to_string(),
            },
        );

        manufacturers.insert(
            "oneplus".to_string(),
            ManufacturerPattern {
                brand: "oneplus".to_string(),
                manufacturer: "OnePlus".to_string(),
                models: vec![
                    model("OnePlus11", "OP5915L1", "CPH2449", "kalama", "OnePlus 11", "qcom"),
                    model(
                        "OnePlus10Pro",
                        "OP515BL1",
                        "NE2213",
                        "lahaina",
                        "OnePlus 10 Pro",
                        "qcom",
                    ),
                ],
                build_id_patterns: build_ids(&[
                    ("13", &["TP1A", "TQ1A"]),
                    ("14", &["UP1A", "UQ1A"]),
                ]),
                serial_pattern: "{16}".to_string(),
                serial_chars: SERIAL_ALNUM.to_string(),
            },
        );

        manufacturers.insert(
            "oppo".to_string(),
            ManufacturerPattern {
                brand: "oppo".to_string(),
                manufacturer: "OPPO".to_string(),
                models: vec![model(
                    "OP4F2FL1",
                    "OP4F2F",
                    "CPH2423",
                    "kalama",
                    "Find X6 Pro",
                    "qcom",
                )],
                build_id_patterns: build_ids(&[
                    ("13", &["TP1A", "TQ1A"]),
                    ("14", &["UP1A", "UQ1A"]),
                ]),
                serial_pattern: "{15}".to_string(),
                serial_chars: SERIAL_ALNUM.to_string(),
            },
        );

        let android_versions = [
            ("10", "10", 29),
            ("11", "11", 30),
            ("12", "12", 31),
            ("13", "13", 33),
            ("14", "14", 34),
        ]
        .iter()
        .map(|(key, release, sdk)| {
            (
                key.to_string(),
                AndroidVersion {
                    release: release.to_string(),
                    sdk: *sdk,
                },
            )
        })
        .collect();

        Self {
            manufacturers,
            android_versions,
            fingerprint_template: DEFAULT_FINGERPRINT_TEMPLATE.to_string(),
            build_type: DEFAULT_BUILD_TYPE.to_string(),
            build_tags: DEFAULT_BUILD_TAGS.to_string(),
            props_to_spoof: None,
        }
    }

    /// Loads a toml catalog document. Any top-level key the document omits
    /// keeps its built-in value; present keys replace their built-in
    /// counterpart wholesale.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|_| Error::MissingFile(path.to_string_lossy().into_owned()))?;
        let table: Table = toml::from_str(&text)
            .map_err(|e| Error::InvalidConfig(path.to_string_lossy().into_owned(), e.to_string()))?;
        Ok(Self::from_table(&table))
    }

    pub fn from_table(table: &Table) -> Self {
        let mut catalog = Self::builtin();

        catalog.fingerprint_template =
            table_str(table, "fingerprint_template", &catalog.fingerprint_template);
        catalog.build_type = table_str(table, "build_type", &catalog.build_type);
        catalog.build_tags = table_str(table, "build_tags", &catalog.build_tags);

        if let Some(Value::Array(list)) = table.get("props_to_spoof") {
            catalog.props_to_spoof = Some(
                list.iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.to_string())
                    .collect(),
            );
        }

        if let Some(Value::Table(mfgs)) = table.get("manufacturers") {
            catalog.manufacturers = mfgs
                .iter()
                .filter_map(|(key, value)| {
                    value
                        .as_table()
                        .map(|t| (key.clone(), parse_manufacturer(key, t)))
                })
                .collect();
        }

        if let Some(Value::Table(versions)) = table.get("android_versions") {
            catalog.android_versions = versions
                .iter()
                .filter_map(|(key, value)| {
                    value.as_table().map(|t| {
                        (
                            key.clone(),
                            AndroidVersion {
                                release: table_str(t, "release", key),
                                sdk: table_u64(t, "sdk", 33) as u32,
                            },
                        )
                    })
                })
                .collect();
        }

        catalog
    }

    pub fn manufacturer(&self, key: &str) -> Option<&ManufacturerPattern> {
        self.manufacturers.get(&key.to_lowercase())
    }

    /// Resolves a manufacturer, falling back to [DEFAULT_MANUFACTURER] (or
    /// the first catalog entry) for unknown keys. Returns the effective key
    /// alongside the pattern so generated values stay consistent.
    pub fn manufacturer_or_default(&self, key: &str) -> Option<(String, &ManufacturerPattern)> {
        let lowered = key.to_lowercase();
        if let Some(pattern) = self.manufacturers.get(&lowered) {
            return Some((lowered, pattern));
        }
        if let Some(pattern) = self.manufacturers.get(DEFAULT_MANUFACTURER) {
            return Some((DEFAULT_MANUFACTURER.to_string(), pattern));
        }
        self.manufacturers
            .iter()
            .next()
            .map(|(k, v)| (k.clone(), v))
    }

    pub fn version(&self, key: &str) -> Option<&AndroidVersion> {
        self.android_versions.get(key)
    }

    /// The effective spoofable-property list.
    pub fn master_props(&self) -> &[String] {
        self.props_to_spoof
            .as_deref()
            .unwrap_or_else(|| DEFAULT_PROPS_TO_SPOOF.as_slice())
    }

    pub fn is_spoofable(&self, prop: &str) -> bool {
        self.master_props().iter().any(|p| p == prop)
    }
}

fn parse_manufacturer(key: &str, t: &Table) -> ManufacturerPattern {
    let models = match t.get("models") {
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(Value::as_table)
            .map(|m| ModelProfile {
                product: table_str(m, "product", ""),
                device: table_str(m, "device", ""),
                model: table_str(m, "model", ""),
                board: table_str(m, "board", ""),
                display_name: table_str(m, "display_name", ""),
                hardware: table_str(m, "hardware", ""),
            })
            .collect(),
        _ => Vec::new(),
    };

    let build_id_patterns = match t.get("build_ids") {
        Some(Value::Table(map)) => map
            .iter()
            .filter_map(|(version, value)| {
                value.as_array().map(|list| {
                    (
                        version.clone(),
                        list.iter()
                            .filter_map(Value::as_str)
                            .map(|s| s.to_string())
                            .collect(),
                    )
                })
            })
            .collect(),
        _ => BTreeMap::new(),
    };

    ManufacturerPattern {
        brand: table_str(t, "brand", key),
        manufacturer: table_str(t, "manufacturer", key),
        models,
        build_id_patterns,
        serial_pattern: table_str(t, "serial_pattern", "{12}"),
        serial_chars: table_str(t, "serial_chars", SERIAL_ALNUM),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = PatternCatalog::builtin();
        assert_eq!(catalog.manufacturers.len(), 5);
        assert!(catalog.manufacturer("samsung").is_some());
        assert!(catalog.manufacturer("SAMSUNG").is_some());
        assert_eq!(catalog.version("13").unwrap().sdk, 33);
        assert!(catalog.is_spoofable("ro.build.fingerprint"));
        assert!(!catalog.is_spoofable("ro.kernel.qemu"));
    }

    #[test]
    fn test_unknown_manufacturer_falls_back() {
        let catalog = PatternCatalog::builtin();
        let (key, _) = catalog.manufacturer_or_default("nokia").unwrap();
        assert_eq!(key, DEFAULT_MANUFACTURER);
    }

    #[test]
    fn test_overlay_keeps_missing_keys() {
        let doc = r#"
build_tags = "test-keys"
"#;
        let table: Table = toml::from_str(doc).unwrap();
        let catalog = PatternCatalog::from_table(&table);
        assert_eq!(catalog.build_tags, "test-keys");
        // untouched sections keep the builtin data
        assert_eq!(catalog.manufacturers.len(), 5);
        assert_eq!(catalog.fingerprint_template, DEFAULT_FINGERPRINT_TEMPLATE);
        assert!(catalog.props_to_spoof.is_none());
    }

    #[test]
    fn test_empty_spoof_list_is_honored() {
        let doc = r#"
props_to_spoof = []
"#;
        let table: Table = toml::from_str(doc).unwrap();
        let catalog = PatternCatalog::from_table(&table);
        assert_eq!(catalog.props_to_spoof, Some(Vec::new()));
        assert!(catalog.master_props().is_empty());
        assert!(!catalog.is_spoofable("ro.build.fingerprint"));
    }

    #[test]
    fn test_manufacturers_replaced_wholesale() {
        let doc = r#"
[manufacturers.fairphone]
brand = "Fairphone"
serial_pattern = "FP{6}"
serial_chars = "0123456789"

[[manufacturers.fairphone.models]]
product = "FP4"
device = "FP4"
model = "FP4"
board = "lahaina"
display_name = "Fairphone 4"
hardware = "qcom"

[manufacturers.fairphone.build_ids]
"13" = ["TKQ1"]
"#;
        let table: Table = toml::from_str(doc).unwrap();
        let catalog = PatternCatalog::from_table(&table);
        assert_eq!(catalog.manufacturers.len(), 1);
        let fp = catalog.manufacturer("fairphone").unwrap();
        assert_eq!(fp.brand, "Fairphone");
        assert_eq!(fp.models.len(), 1);
        assert_eq!(fp.build_id_patterns["13"], vec!["TKQ1".to_string()]);
        // the default key is gone, so fallback picks the first entry
        let (key, _) = catalog.manufacturer_or_default("samsung").unwrap();
        assert_eq!(key, "fairphone");
    }
}
