use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("required binary `{0}` not available")]
    MissingBin(String),

    #[error("{0}")]
    IO(io::Error),

    #[error("no adb device connected")]
    NoDevice,
    #[error("adb device {0} not found")]
    DeviceNotFound(String),

    #[error("command failed with status {0}: {1}")]
    CommandError(i32, String),

    #[error("invalid config {0}: {1}")]
    InvalidConfig(String, String),

    #[error("file {0} doesn't exist")]
    MissingFile(String),

    #[error("no base package could be identified in {0}")]
    NoBaseApk(String),

    #[error("device {0} already has an active provisioned profile (user {1})")]
    ProfileActive(String, u32),

    #[error("failed to provision user profile on {0}: {1}")]
    ProfileCreation(String, String),

    #[error("device {0} lacks required capability: {1}")]
    CapabilityGap(String, String),

    #[error("generic error: {0}")]
    Generic(String),
}

impl Error {
    pub fn new_generic<S: ToString + ?Sized>(s: &S) -> Self {
        Self::Generic(s.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::IO(err)
    }
}
