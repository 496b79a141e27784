use std::path::Path;
use std::time::Duration;

use which::which;

use crate::command::{
    join_for_su, run_cmd_timeout, CmdOutput, EXIT_BAD_COMMAND, EXIT_EMPTY_ROOT_COMMAND,
};
use crate::{Error, Result};

/// Default timeout for capability and property reads. Anything that moves
/// real data (install, push) picks its own, much longer, deadline.
pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEVICES_TIMEOUT: Duration = Duration::from_secs(10);

/// A single device shell invocation: the argv plus how to run it.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub args: Vec<String>,
    pub timeout: Duration,
    pub as_root: bool,
    pub target_user: Option<u32>,
}

impl ShellRequest {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            timeout: DEFAULT_SHELL_TIMEOUT,
            as_root: false,
            target_user: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn as_root(mut self) -> Self {
        self.as_root = true;
        self
    }

    /// Escalate into the given user's context instead of the superuser
    /// identity. Only meaningful together with [as_root].
    pub fn for_user(mut self, user: u32) -> Self {
        self.target_user = Some(user);
        self
    }
}

/// The `Adb` trait abstracts the external `adb` tool. Command failure is a
/// value, not an error: [CmdOutput] exit codes at or below -1 are runner
/// faults, everything else came from the tool itself. Only [Adb::devices]
/// returns `Result`, since without a working adb there is nothing to do.
pub trait Adb: Send + Sync {
    /// `adb -s <device> shell ...`, optionally wrapped in `su [uid] -c`.
    fn shell(&self, device: &str, req: &ShellRequest) -> CmdOutput;

    /// `adb -s <device> <args...>` for non-shell subcommands (install,
    /// install-multiple, uninstall, push).
    fn run(&self, device: &str, args: &[String], timeout: Duration) -> CmdOutput;

    /// Serials of all connected devices in the `device` state.
    fn devices(&self) -> Result<Vec<String>>;

    /// Reads a system property, returning an empty string when the read
    /// fails or the property is unset.
    fn getprop(&self, device: &str, prop: &str) -> String {
        let out = self.shell(device, &ShellRequest::new(["getprop", prop]));
        if out.ok() {
            out.stdout.trim().to_string()
        } else {
            String::new()
        }
    }

    fn push(&self, device: &str, local: &Path, remote: &str, timeout: Duration) -> CmdOutput {
        let args = vec![
            "push".to_string(),
            local.to_string_lossy().into_owned(),
            remote.to_string(),
        ];
        self.run(device, &args, timeout)
    }

    fn uninstall(
        &self,
        device: &str,
        package: &str,
        user: Option<u32>,
        timeout: Duration,
    ) -> CmdOutput {
        let mut args = vec!["uninstall".to_string()];
        // --user 0 is the implicit default and some ROMs mishandle the
        // explicit flag, so it is only emitted for real secondary users.
        if let Some(uid) = user.filter(|u| *u != 0) {
            args.push("--user".to_string());
            args.push(uid.to_string());
        }
        args.push(package.to_string());
        self.run(device, &args, timeout)
    }
}

/// An [Adb] implementation that invokes the external `adb` binary.
#[derive(Clone)]
pub struct ExecAdb {
    bin: String,
}

impl ExecAdb {
    /// Resolves `adb` on PATH.
    pub fn new() -> Result<Self> {
        let bin = which("adb")
            .map_err(|_| Error::MissingBin("adb".to_string()))?
            .to_string_lossy()
            .into_owned();
        Ok(Self { bin })
    }

    pub fn with_bin<S: Into<String>>(bin: S) -> Self {
        Self { bin: bin.into() }
    }

    fn base_args(&self, device: &str) -> Vec<String> {
        let mut args = Vec::new();
        if !device.is_empty() {
            args.push("-s".to_string());
            args.push(device.to_string());
        }
        args
    }
}

impl Adb for ExecAdb {
    fn shell(&self, device: &str, req: &ShellRequest) -> CmdOutput {
        if req.args.is_empty() {
            return CmdOutput::fault(EXIT_BAD_COMMAND, "empty shell command");
        }

        let mut args = self.base_args(device);
        args.push("shell".to_string());

        if req.as_root {
            let joined = join_for_su(&req.args);
            if joined.is_empty() {
                return CmdOutput::fault(EXIT_EMPTY_ROOT_COMMAND, "empty root command");
            }
            args.push("su".to_string());
            args.push(req.target_user.unwrap_or(0).to_string());
            args.push("-c".to_string());
            args.push(joined);
        } else {
            args.extend(req.args.iter().cloned());
        }

        run_cmd_timeout(&self.bin, &args, req.timeout)
    }

    fn run(&self, device: &str, cmd_args: &[String], timeout: Duration) -> CmdOutput {
        let mut args = self.base_args(device);
        args.extend(cmd_args.iter().cloned());
        run_cmd_timeout(&self.bin, &args, timeout)
    }

    fn devices(&self) -> Result<Vec<String>> {
        let out = run_cmd_timeout(&self.bin, &["devices", "-l"], DEVICES_TIMEOUT);
        if !out.ok() {
            return Err(Error::CommandError(out.code, out.combined()));
        }

        let mut serials = Vec::new();
        // First line is the "List of devices attached" header
        for line in out.stdout.lines().skip(1) {
            let mut fields = line.split_whitespace();
            let (serial, state) = match (fields.next(), fields.next()) {
                (Some(serial), Some(state)) => (serial, state),
                _ => continue,
            };
            if state == "device" {
                serials.push(serial.to_string());
            }
        }

        if serials.is_empty() {
            return Err(Error::NoDevice);
        }
        Ok(serials)
    }
}
