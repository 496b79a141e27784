use std::path::PathBuf;

use anyhow::bail;
use clap::Args;

use aprov::config::{SpoofConfig, UserConfig};
use aprov::probe::detect_capabilities;
use aprov::{SpoofEngine, UserProfileManager};

use crate::utils::{connect, load_catalog, single_device};

#[derive(Args)]
pub struct Cleanup {
    /// Device serial; defaults to the single connected device
    #[arg(short, long)]
    device: Option<String>,

    /// Remove this user id (a stray profile from an earlier session)
    #[arg(short, long)]
    user: Option<u32>,

    /// Also delete spoofed properties
    #[arg(long)]
    restore_properties: bool,

    /// Device pattern catalog (toml)
    #[arg(long)]
    patterns: Option<PathBuf>,
}

impl Cleanup {
    pub fn run(&self) -> anyhow::Result<()> {
        if self.user.is_none() && !self.restore_properties {
            bail!("nothing to do: pass --user <id> and/or --restore-properties");
        }

        let adb = connect()?;
        let device = single_device(&*adb, self.device.as_deref())?;
        let caps = detect_capabilities(&*adb, &device);
        let mut ok = true;

        if let Some(user_id) = self.user {
            let manager = UserProfileManager::new(adb.clone(), UserConfig::default());
            if manager.remove_user(&device, &caps, user_id) {
                println!("{device}: user {user_id} removed");
            } else {
                ok = false;
            }
        }

        if self.restore_properties {
            if !caps.can_spoof_properties() {
                bail!("{device}: deleting properties needs root access with resetprop");
            }
            let catalog = load_catalog(self.patterns.as_deref())?;
            let config = SpoofConfig {
                backup_original_properties: false,
                ..SpoofConfig::default()
            };
            let mut engine = SpoofEngine::new(adb, config, catalog);
            if engine.restore_all(&device) {
                println!("{device}: spoofed properties deleted");
            } else {
                ok = false;
            }
        }

        if !ok {
            bail!("{device}: cleanup left some changes behind");
        }
        Ok(())
    }
}
