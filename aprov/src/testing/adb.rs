use std::sync::Mutex;
use std::time::Duration;

use mockall::mock;
use rstest::fixture;

use crate::adb::{Adb, ShellRequest};
use crate::command::CmdOutput;

mock! {
    pub Adb {}

    impl crate::adb::Adb for Adb {
        fn shell(&self, device: &str, req: &ShellRequest) -> CmdOutput;
        fn run(&self, device: &str, args: &[String], timeout: Duration) -> CmdOutput;
        fn devices(&self) -> crate::Result<Vec<String>>;
    }
}

#[fixture]
pub fn mock_adb() -> MockAdb {
    MockAdb::new()
}

struct Rule {
    needle: String,
    output: CmdOutput,
    once: bool,
}

/// An [Adb] fake that answers commands from an ordered script. Rules match
/// on a substring of the space-joined argv; `once` rules are consumed, `on`
/// rules persist. Unmatched commands succeed with empty output, so scripts
/// only need to spell out the interesting exchanges. The full transcript is
/// recorded for assertions.
pub struct ScriptedAdb {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    devices: Vec<String>,
}

impl ScriptedAdb {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            devices: Vec::new(),
        }
    }

    pub fn with_devices<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices = devices.into_iter().map(Into::into).collect();
        self
    }

    /// Persistent rule: every command containing `needle` gets `output`.
    pub fn on<S: Into<String>>(self, needle: S, output: CmdOutput) -> Self {
        self.rules.lock().expect("poisoned").push(Rule {
            needle: needle.into(),
            output,
            once: false,
        });
        self
    }

    /// One-shot rule, consumed by its first match. Earlier rules win, so
    /// sequences of differing answers to the same command are expressed as
    /// consecutive `once` rules.
    pub fn once<S: Into<String>>(self, needle: S, output: CmdOutput) -> Self {
        self.rules.lock().expect("poisoned").push(Rule {
            needle: needle.into(),
            output,
            once: true,
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("poisoned").clone()
    }

    pub fn call_count_containing(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    fn answer(&self, key: &str) -> CmdOutput {
        self.calls.lock().expect("poisoned").push(key.to_string());

        let mut rules = self.rules.lock().expect("poisoned");
        if let Some(idx) = rules.iter().position(|r| key.contains(&r.needle)) {
            let output = rules[idx].output.clone();
            if rules[idx].once {
                rules.remove(idx);
            }
            return output;
        }
        CmdOutput::success("")
    }
}

impl Default for ScriptedAdb {
    fn default() -> Self {
        Self::new()
    }
}

impl Adb for ScriptedAdb {
    fn shell(&self, _device: &str, req: &ShellRequest) -> CmdOutput {
        let mut key = req.args.join(" ");
        if req.as_root {
            key = format!("su {} -c {}", req.target_user.unwrap_or(0), key);
        }
        self.answer(&key)
    }

    fn run(&self, _device: &str, args: &[String], _timeout: Duration) -> CmdOutput {
        self.answer(&args.join(" "))
    }

    fn devices(&self) -> crate::Result<Vec<String>> {
        if self.devices.is_empty() {
            return Err(crate::Error::NoDevice);
        }
        Ok(self.devices.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_mock_adb_default_methods_delegate(mock_adb: MockAdb) {
        let mut mock = mock_adb;
        mock.expect_shell()
            .withf(|_, req| req.args == ["getprop", "ro.product.model"])
            .returning(|_, _| CmdOutput::success("Pixel 8 Pro"));
        assert_eq!(mock.getprop("SER123", "ro.product.model"), "Pixel 8 Pro");
    }

    #[test]
    fn test_scripted_adb_once_rules_are_consumed() {
        let adb = ScriptedAdb::new()
            .once("getprop ro.x", CmdOutput::success("first"))
            .on("getprop ro.x", CmdOutput::success("after"));
        assert_eq!(adb.getprop("SER123", "ro.x"), "first");
        assert_eq!(adb.getprop("SER123", "ro.x"), "after");
        assert_eq!(adb.getprop("SER123", "ro.x"), "after");
        assert_eq!(adb.call_count_containing("getprop ro.x"), 3);
    }
}
