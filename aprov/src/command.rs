use std::ffi::OsStr;
use std::io::Read;
use std::process::{ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::Level::Debug;
use log::{debug, log_enabled, warn};

/// Exit codes reserved for faults in the runner itself. External tools own
/// the non-negative range; anything at or below [EXIT_TIMEOUT] means the
/// command never ran to completion on the device.
pub const EXIT_TIMEOUT: i32 = -1;
pub const EXIT_TRANSPORT: i32 = -2;
pub const EXIT_BAD_COMMAND: i32 = -3;
pub const EXIT_EMPTY_ROOT_COMMAND: i32 = -4;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success<S: Into<String>>(stdout: S) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure<S: Into<String>>(code: i32, stderr: S) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn fault(code: i32, msg: &str) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: msg.to_string(),
        }
    }

    #[inline]
    pub fn ok(&self) -> bool {
        self.code == 0
    }

    /// True when the failure originated in the runner (timeout, transport,
    /// malformed command) rather than in the external tool.
    #[inline]
    pub fn is_runner_fault(&self) -> bool {
        self.code <= EXIT_TIMEOUT
    }

    #[inline]
    pub fn timed_out(&self) -> bool {
        self.code == EXIT_TIMEOUT
    }

    /// stdout and stderr glued together; adb routes errors to either stream
    /// depending on version, so diagnostics match against both.
    pub fn combined(&self) -> String {
        let mut s = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        s.push_str(self.stdout.trim());
        if !self.stderr.trim().is_empty() {
            if !s.is_empty() {
                s.push(' ');
            }
            s.push_str(self.stderr.trim());
        }
        s
    }
}

fn to_trimmed_utf8(v: Vec<u8>) -> String {
    String::from_utf8_lossy(&v).trim_end().to_string()
}

fn drain_pipe_stdout(pipe: ChildStdout) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut pipe = pipe;
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn drain_pipe_stderr(pipe: ChildStderr) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut pipe = pipe;
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

/// Run a command to completion with a hard deadline. The child is killed when
/// the deadline passes and the output collected so far is returned with
/// [EXIT_TIMEOUT]. Spawn failures become [EXIT_TRANSPORT]; this function never
/// returns an error for command failure.
pub fn run_cmd_timeout<C, S>(cmd: C, args: &[S], timeout: Duration) -> CmdOutput
where
    C: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    if log_enabled!(Debug) {
        log_cmd(&cmd, args);
    }

    let mut child = match Command::new(&cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return CmdOutput::fault(EXIT_TRANSPORT, &e.to_string()),
    };

    let out_handle = drain_pipe_stdout(child.stdout.take().expect("stdout was piped"));
    let err_handle = drain_pipe_stderr(child.stderr.take().expect("stderr was piped"));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                thread::sleep(WAIT_POLL_INTERVAL);
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return CmdOutput::fault(EXIT_TRANSPORT, &e.to_string());
            }
        }
    };

    let stdout = to_trimmed_utf8(out_handle.join().unwrap_or_default());
    let stderr = to_trimmed_utf8(err_handle.join().unwrap_or_default());

    match status {
        Some(status) => CmdOutput {
            // A signal death carries no code; treat it like a transport fault.
            code: status.code().unwrap_or(EXIT_TRANSPORT),
            stdout,
            stderr,
        },
        None => {
            warn!("command timed out after {:?}", timeout);
            CmdOutput {
                code: EXIT_TIMEOUT,
                stdout,
                stderr: if stderr.is_empty() {
                    "timeout".to_string()
                } else {
                    stderr
                },
            }
        }
    }
}

/// Quotes a string with single quotes for the device shell
pub fn quote(s: &str) -> String {
    let mut new = String::with_capacity(s.len() + 2);
    new.push('\'');
    for c in s.chars() {
        if c == '\'' {
            new.push_str("'\"'\"'");
        } else {
            new.push(c);
        }
    }
    new.push('\'');
    new
}

const SH_METACHARS: &str = "&|;()<>$`\\\"!*?#~[]{}";

/// Joins an argv into a single string suitable for `su -c '...'`. Tokens
/// containing whitespace, quotes, or shell metacharacters are quoted; plain
/// tokens pass through untouched so the resulting command stays readable in
/// device logs.
pub fn join_for_su(args: &[String]) -> String {
    let mut joined = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            joined.push(' ');
        }
        let needs_quoting = arg.is_empty()
            || arg
                .chars()
                .any(|c| c.is_whitespace() || c == '\'' || SH_METACHARS.contains(c));
        if needs_quoting {
            joined.push_str(&quote(arg));
        } else {
            joined.push_str(arg);
        }
    }
    joined
}

pub fn log_cmd<C, S>(cmd: &C, args: &[S])
where
    C: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let mut line = cmd.as_ref().to_string_lossy().into_owned();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    debug!("Running command: `{}`", line);
}
