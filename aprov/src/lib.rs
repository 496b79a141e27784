pub mod errors;
pub use errors::{Error, Result};

pub mod command;
pub use command::CmdOutput;

pub mod adb;
pub use adb::{Adb, ExecAdb, ShellRequest};

pub mod retry;

pub mod probe;
pub use probe::{detect_capabilities, CapabilityCache, DeviceCapabilities};

pub mod patterns;
pub use patterns::PatternCatalog;

pub mod config;
pub use config::ProvisionerConfig;

pub mod spoof;
pub use spoof::SpoofEngine;

pub mod users;
pub use users::{CleanupChoices, UserProfile, UserProfileManager};

pub mod splits;

pub mod install;
pub use install::{InstallOutcome, Orchestrator, PackageSource};

#[cfg(test)]
pub mod testing;
