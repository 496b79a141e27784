use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};

use aprov::adb::Adb;
use aprov::{ExecAdb, PatternCatalog, ProvisionerConfig};

pub fn connect() -> anyhow::Result<Arc<dyn Adb>> {
    let adb = ExecAdb::new().with_context(|| "locating the adb binary")?;
    Ok(Arc::new(adb))
}

/// Resolves the target device: the explicit serial when given, otherwise the
/// single connected device. Multiple devices require an explicit choice.
pub fn single_device(adb: &dyn Adb, explicit: Option<&str>) -> anyhow::Result<String> {
    if let Some(serial) = explicit {
        return Ok(serial.to_string());
    }
    let mut devices = adb.devices().with_context(|| "listing devices")?;
    if devices.len() > 1 {
        bail!(
            "multiple devices connected ({}), pass --device",
            devices.join(", ")
        );
    }
    Ok(devices.remove(0))
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<ProvisionerConfig> {
    match path {
        Some(p) => {
            ProvisionerConfig::load(p).with_context(|| format!("loading config {}", p.display()))
        }
        None => Ok(ProvisionerConfig::default()),
    }
}

pub fn load_catalog(path: Option<&Path>) -> anyhow::Result<PatternCatalog> {
    match path {
        Some(p) => {
            PatternCatalog::load(p).with_context(|| format!("loading patterns {}", p.display()))
        }
        None => Ok(PatternCatalog::builtin()),
    }
}
