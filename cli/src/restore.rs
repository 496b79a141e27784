use std::path::PathBuf;

use anyhow::bail;
use clap::Args;

use aprov::config::SpoofConfig;
use aprov::probe::detect_capabilities;
use aprov::SpoofEngine;

use crate::utils::{connect, load_catalog, single_device};

#[derive(Args)]
pub struct Restore {
    /// Device serial; defaults to the single connected device
    #[arg(short, long)]
    device: Option<String>,

    /// Device pattern catalog (toml); its spoofable-property list is what
    /// gets deleted
    #[arg(long)]
    patterns: Option<PathBuf>,
}

impl Restore {
    pub fn run(&self) -> anyhow::Result<()> {
        let catalog = load_catalog(self.patterns.as_deref())?;
        let adb = connect()?;
        let device = single_device(&*adb, self.device.as_deref())?;

        let caps = detect_capabilities(&*adb, &device);
        if !caps.can_spoof_properties() {
            bail!("{device}: restoring needs root access with a resetprop binary");
        }

        // Backups from an earlier run don't survive the process, so the only
        // honest restoration is deleting every property the catalog allows
        // spoofing; the device then falls back to its real values.
        let config = SpoofConfig {
            backup_original_properties: false,
            ..SpoofConfig::default()
        };
        let mut engine = SpoofEngine::new(adb, config, catalog);
        if !engine.restore_all(&device) {
            bail!("{device}: some properties could not be deleted");
        }
        println!("{device}: spoofed properties deleted");
        Ok(())
    }
}
