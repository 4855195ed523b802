use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Output};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;

use crate::command::Runner;

static NS_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Returns `true` if the environment supports namespace and bridge tests
/// (requires `ip`, `ovs-vsctl` and root).
pub fn check_privileges() -> bool {
    let is_root = Command::new("id")
        .arg("-u")
        .output()
        .is_ok_and(|o| String::from_utf8_lossy(&o.stdout).trim() == "0");

    is_root
        && Command::new("ip")
            .args(["netns", "list"])
            .output()
            .is_ok_and(|o| o.status.success())
}

/// Returns `true` if Open vSwitch is installed and its database is reachable.
pub fn check_ovs() -> bool {
    Command::new("ovs-vsctl")
        .arg("show")
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Generate a unique namespace/interface name safe for parallel tests.
///
/// Combines prefix + PID + atomic counter, truncated to 15 chars
/// (Linux netdev name limit).
pub fn unique_ns_name(prefix: &str) -> String {
    let seq = NS_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() % 0xffff;
    let name = format!("{prefix}_{pid:x}_{seq}");
    if name.len() > 15 { name[..15].to_string() } else { name }
}

struct Response {
    prefix: String,
    code: i32,
    stdout: String,
    stderr: String,
}

/// A [`Runner`] that records every command line instead of executing it.
///
/// Commands succeed with empty output unless a scripted response matches:
/// the most recently added response whose prefix starts the command line
/// wins.
#[derive(Default)]
pub struct RecordingRunner {
    log: Mutex<Vec<String>>,
    responses: Mutex<Vec<Response>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeed with `stdout` for commands starting with `prefix`.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.push(prefix, 0, stdout, "");
    }

    /// Fail with exit `code` and `stderr` for commands starting with `prefix`.
    pub fn respond_err(&self, prefix: &str, code: i32, stderr: &str) {
        self.push(prefix, code, "", stderr);
    }

    fn push(&self, prefix: &str, code: i32, stdout: &str, stderr: &str) {
        self.responses.lock().unwrap().push(Response {
            prefix: prefix.to_string(),
            code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    /// Every command line run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Command lines starting with `prefix`, in order.
    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Forget recorded commands, keeping scripted responses.
    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }

    fn record(&self, argv: &[&str]) -> (ExitStatus, Vec<u8>, Vec<u8>) {
        let line = argv.join(" ");
        let responses = self.responses.lock().unwrap();
        let hit = responses.iter().rev().find(|r| line.starts_with(&r.prefix));
        let result = match hit {
            Some(r) => (
                ExitStatus::from_raw(r.code << 8),
                r.stdout.clone().into_bytes(),
                r.stderr.clone().into_bytes(),
            ),
            None => (ExitStatus::from_raw(0), Vec::new(), Vec::new()),
        };
        self.log.lock().unwrap().push(line);
        result
    }
}

impl Runner for RecordingRunner {
    fn output(&self, argv: &[&str]) -> Result<Output> {
        let (status, stdout, stderr) = self.record(argv);
        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }

    fn status(&self, argv: &[&str]) -> Result<ExitStatus> {
        Ok(self.record(argv).0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_names_fit_ifname_limit() {
        assert!(unique_ns_name("a_very_long_prefix").len() <= 15);
        assert_ne!(unique_ns_name("x"), unique_ns_name("x"));
    }

    #[test]
    fn test_latest_response_wins() {
        let rec = RecordingRunner::new();
        rec.respond("ip", "first");
        rec.respond_err("ip link", 3, "boom");

        let out = rec.output(&["ip", "link", "show"]).unwrap();
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stderr, b"boom");

        let out = rec.output(&["ip", "addr"]).unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout, b"first");
        assert_eq!(rec.commands_matching("ip link"), vec!["ip link show"]);
    }
}
