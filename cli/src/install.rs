use std::path::PathBuf;

use anyhow::bail;
use clap::Args;
use log::warn;

use aprov::adb::Adb;
use aprov::install::{AssumeAnswer, ConflictPrompt, PackageSource};
use aprov::users::CleanupChoices;
use aprov::Orchestrator;

use crate::utils::{connect, load_catalog, load_config};

#[derive(Args)]
pub struct Install {
    /// Package files to install: .apk, .xapk, .apkm or .zip
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Target device serial(s); all connected devices when omitted
    #[arg(short, long)]
    device: Vec<String>,

    /// Configuration file (toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device pattern catalog (toml)
    #[arg(long)]
    patterns: Option<PathBuf>,

    /// Skip property spoofing for this run
    #[arg(long)]
    no_spoof: bool,

    /// Skip isolated user profile provisioning for this run
    #[arg(long)]
    no_user_profile: bool,

    /// Create a permanent profile instead of an ephemeral one
    #[arg(long)]
    permanent_user: bool,

    /// Uninstall conflicting packages without asking
    #[arg(short = 'y', long)]
    yes: bool,

    /// Never uninstall conflicting packages
    #[arg(short = 'n', long, conflicts_with = "yes")]
    no: bool,

    /// Undo everything afterwards: restore properties, remove the profile,
    /// restore the user limit
    #[arg(long)]
    cleanup: bool,
}

/// Asks on the terminal before uninstalling an existing package.
struct PromptUninstall;

impl ConflictPrompt for PromptUninstall {
    fn confirm_uninstall(&self, package: &str, device: &str) -> bool {
        promptly::prompt_default(
            format!("Uninstall existing {package} from {device} and retry"),
            false,
        )
        .unwrap_or(false)
    }
}

impl Install {
    pub fn run(&self) -> anyhow::Result<()> {
        let mut config = load_config(self.config.as_deref())?;
        if self.no_spoof {
            config.spoofing.enabled = false;
        }
        if self.no_user_profile {
            config.users.enabled = false;
        }
        if self.permanent_user {
            config.users.use_ephemeral_users = false;
        }
        let catalog = load_catalog(self.patterns.as_deref())?;

        let sources = self
            .files
            .iter()
            .map(|f| PackageSource::from_path(f))
            .collect::<aprov::Result<Vec<_>>>()?;

        let adb = connect()?;
        let devices = if self.device.is_empty() {
            adb.devices()?
        } else {
            self.device.clone()
        };

        let prompt: Box<dyn ConflictPrompt> = if self.yes {
            Box::new(AssumeAnswer(true))
        } else if self.no {
            Box::new(AssumeAnswer(false))
        } else {
            Box::new(PromptUninstall)
        };

        let mut orch = Orchestrator::new(adb, config, catalog);
        let mut successes = 0usize;
        let mut failures = 0usize;

        for device in &devices {
            println!("== {device}");
            let reports = orch.install_on_device(device, &sources, prompt.as_ref());
            for report in &reports {
                if report.outcome.is_success() {
                    successes += 1;
                    println!("  ok   {}", report.source);
                } else {
                    failures += 1;
                    println!("  FAIL {} ({})", report.source, report.outcome.label());
                }
            }

            if self.cleanup && !orch.cleanup_device(device, CleanupChoices::everything()) {
                warn!("{device}: cleanup left some changes behind");
            }
        }

        for hint in orch.suggest_remedies() {
            println!("hint: {hint}");
        }

        println!("{successes} succeeded, {failures} failed");
        if successes == 0 && failures > 0 {
            bail!("all installations failed");
        }
        Ok(())
    }
}
