use std::borrow::Cow;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use flexi_logger::{FileSpec, LevelFilter, LogSpecification, Logger, LoggerHandle, WriteMode};

mod devices;
use devices::Devices;

mod probe;
use probe::Probe;

mod install;
use install::Install;

mod spoof;
use spoof::Spoof;

mod restore;
use restore::Restore;

mod cleanup;
use cleanup::Cleanup;

mod utils;

#[derive(Parser)]
#[command(name = "aprov")]
#[command(version)]
#[command(about = "Provision Android devices over adb: spoofed identities, \
isolated user profiles and split-aware package installation")]
struct Cli {
    /// Log to stderr instead of a file
    #[arg(short = 'e', long, action = clap::ArgAction::SetTrue, default_value_t = false)]
    log_stderr: bool,

    /// Send log output to the given file (default: ./aprov.log)
    #[arg(short = 'f', long)]
    log_file: Option<PathBuf>,

    /// Set the log level, 0 = warn, 1 = info, 2 = debug, 3 = trace
    #[arg(short = 'l', long, default_value_t = 0)]
    log_level: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected devices
    #[command()]
    Devices(Devices),

    /// Probe what a device supports: root, resetprop, multi-user, storage
    #[command()]
    Probe(Probe),

    /// Install packages, provisioning a spoofed identity and an isolated
    /// user profile first where the device and configuration allow it
    #[command()]
    Install(Install),

    /// Apply a spoofed device identity to the current user
    #[command()]
    Spoof(Spoof),

    /// Delete spoofed properties so the device falls back to its real values
    #[command()]
    Restore(Restore),

    /// Remove stray provisioned users and spoofed properties
    #[command()]
    Cleanup(Cleanup),
}

impl Cli {
    fn configure_loggers(&self) -> anyhow::Result<LoggerHandle> {
        let log_spec = if self.log_level > 0 {
            let lvl = match self.log_level {
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            };
            LogSpecification::builder().module("aprov", lvl).build()
        } else {
            LogSpecification::env().with_context(|| "getting log spec from env")?
        };

        let mut logger = Logger::with(log_spec);

        if !self.log_stderr {
            let path = match &self.log_file {
                Some(v) => {
                    if v.is_absolute() {
                        Cow::Borrowed(v)
                    } else {
                        Cow::Owned(std::env::current_dir()?.join(v))
                    }
                }
                None => Cow::Owned(std::env::current_dir()?.join("aprov.log")),
            };
            logger = logger
                .log_to_file(FileSpec::try_from(path.as_ref()).with_context(|| "creating filespec")?)
                .append()
                .write_mode(WriteMode::BufferAndFlush);
        }

        logger.start().with_context(|| "starting logger")
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_handle = cli.configure_loggers()?;

    let res = match cli.command {
        Commands::Devices(c) => c.run(),
        Commands::Probe(c) => c.run(),
        Commands::Install(c) => c.run(),
        Commands::Spoof(c) => c.run(),
        Commands::Restore(c) => c.run(),
        Commands::Cleanup(c) => c.run(),
    };

    log_handle.flush();
    res
}
