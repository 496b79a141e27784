use std::path::PathBuf;

use anyhow::bail;
use clap::Args;

use aprov::probe::detect_capabilities;
use aprov::SpoofEngine;

use crate::utils::{connect, load_catalog, load_config, single_device};

#[derive(Args)]
pub struct Spoof {
    /// Device serial; defaults to the single connected device
    #[arg(short, long)]
    device: Option<String>,

    /// Manufacturer key from the pattern catalog
    #[arg(short, long)]
    manufacturer: Option<String>,

    /// Model name or display name; omit for a random model
    #[arg(long)]
    model: Option<String>,

    /// Android version key from the pattern catalog
    #[arg(short, long)]
    android_version: Option<String>,

    /// Pick manufacturer, model and version at random
    #[arg(short, long, conflicts_with_all = ["manufacturer", "model", "android_version"])]
    random: bool,

    /// Configuration file (toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device pattern catalog (toml)
    #[arg(long)]
    patterns: Option<PathBuf>,
}

impl Spoof {
    pub fn run(&self) -> anyhow::Result<()> {
        let config = load_config(self.config.as_deref())?;
        let catalog = load_catalog(self.patterns.as_deref())?;
        let adb = connect()?;
        let device = single_device(&*adb, self.device.as_deref())?;

        let caps = detect_capabilities(&*adb, &device);
        if !caps.can_spoof_properties() {
            bail!(
                "{device}: property spoofing needs root access with a resetprop binary \
                 (root: {}, resetprop: {})",
                caps.root_access,
                caps.resetprop_available
            );
        }

        let manufacturer = self
            .manufacturer
            .clone()
            .unwrap_or_else(|| config.spoofing.manufacturer.clone());
        let model = self
            .model
            .clone()
            .unwrap_or_else(|| config.spoofing.model.clone());
        let version = self
            .android_version
            .clone()
            .unwrap_or_else(|| config.spoofing.android_version.clone());

        let mut engine = SpoofEngine::new(adb, config.spoofing, catalog);
        let ok = if self.random {
            engine.apply_random_fingerprint(&device, &caps)?
        } else {
            engine.apply_device_spoofing(&device, &caps, &manufacturer, &model, &version)?
        };

        if !ok {
            bail!("{device}: some properties failed to apply or verify");
        }
        println!("{device}: spoofed identity applied");
        println!("note: backups live only for this run; `aprov restore` deletes spoofed values");
        Ok(())
    }
}
