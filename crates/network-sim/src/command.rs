use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::{Context, Result, bail};
use tracing::{debug, trace};

/// Executes external programs on behalf of the emulation primitives.
///
/// Every namespace, bridge, link and firewall operation goes through a
/// `Runner`, so the whole bootstrap sequence can be observed by swapping in
/// [`crate::test_util::RecordingRunner`].
pub trait Runner: Send + Sync {
    /// Run `argv` to completion, capturing stdout and stderr.
    fn output(&self, argv: &[&str]) -> Result<Output>;

    /// Run `argv` with inherited stdio and return its exit status.
    fn status(&self, argv: &[&str]) -> Result<ExitStatus>;
}

/// Shared handle to a runner, held by every RAII primitive.
pub type SharedRunner = Arc<dyn Runner>;

/// The child process a runner is currently waiting on.
///
/// Clones share state, so a signal handler holding a clone can terminate
/// a command that another thread is blocked on.
#[derive(Debug, Clone, Default)]
pub struct ChildTracker {
    inner: Arc<Tracked>,
}

#[derive(Debug, Default)]
struct Tracked {
    pid: AtomicU32,
    attached: AtomicBool,
}

impl ChildTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pid` as the running child until the returned guard drops.
    /// `attached` marks a command sharing the caller's terminal.
    pub fn track(&self, pid: u32, attached: bool) -> Tracking<'_> {
        self.inner.attached.store(attached, Ordering::SeqCst);
        self.inner.pid.store(pid, Ordering::SeqCst);
        Tracking { tracker: self }
    }

    pub fn pid(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Whether a command attached to the terminal is running.
    pub fn is_attached(&self) -> bool {
        self.pid().is_some() && self.inner.attached.load(Ordering::SeqCst)
    }

    /// Send SIGTERM to the running child. Returns `false` when there is none.
    pub fn terminate(&self) -> bool {
        let Some(pid) = self.pid() else {
            return false;
        };
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        debug!(pid, "terminating running command");
        // SAFETY: kill has no memory-safety preconditions
        unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
    }
}

/// Clears the tracked child when dropped.
pub struct Tracking<'a> {
    tracker: &'a ChildTracker,
}

impl Drop for Tracking<'_> {
    fn drop(&mut self) {
        self.tracker.inner.pid.store(0, Ordering::SeqCst);
        self.tracker.inner.attached.store(false, Ordering::SeqCst);
    }
}

/// Runs commands on the local host, optionally through `sudo`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    sudo: bool,
    children: ChildTracker,
}

impl SystemRunner {
    pub fn new(sudo: bool) -> Self {
        Self {
            sudo,
            children: ChildTracker::new(),
        }
    }

    pub fn shared(sudo: bool) -> SharedRunner {
        Arc::new(Self::new(sudo))
    }

    /// Handle on the command this runner is waiting on, if any.
    pub fn children(&self) -> ChildTracker {
        self.children.clone()
    }

    fn spawn(&self, mut cmd: Command, argv: &[&str]) -> Result<Child> {
        cmd.spawn()
            .with_context(|| format!("spawn {}", argv.join(" ")))
    }

    fn command(&self, argv: &[&str]) -> Result<Command> {
        let Some((program, args)) = argv.split_first() else {
            bail!("empty command line");
        };
        let cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program).args(args);
            cmd
        } else {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        };
        Ok(cmd)
    }
}

impl Runner for SystemRunner {
    fn output(&self, argv: &[&str]) -> Result<Output> {
        trace!(cmd = %argv.join(" "), "run");
        let mut cmd = self.command(argv)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = self.spawn(cmd, argv)?;
        let _tracking = self.children.track(child.id(), false);
        child
            .wait_with_output()
            .with_context(|| format!("wait for {}", argv.join(" ")))
    }

    fn status(&self, argv: &[&str]) -> Result<ExitStatus> {
        trace!(cmd = %argv.join(" "), "run interactive");
        let mut child = self.spawn(self.command(argv)?, argv)?;
        let _tracking = self.children.track(child.id(), true);
        child
            .wait()
            .with_context(|| format!("wait for {}", argv.join(" ")))
    }
}

/// Run `argv`, returning raw output regardless of exit status.
pub fn run(runner: &dyn Runner, argv: &[&str]) -> Result<Output> {
    runner.output(argv)
}

/// Run `argv`, returning output on success or bailing with stderr.
pub fn run_checked(runner: &dyn Runner, argv: &[&str]) -> Result<Output> {
    let output = runner.output(argv)?;
    if !output.status.success() {
        bail!(
            "command failed ({}): {}\n{}",
            output.status,
            argv.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

/// Run `argv` and return its stdout as a string, failing on non-zero exit.
pub fn stdout_of(runner: &dyn Runner, argv: &[&str]) -> Result<String> {
    let output = run_checked(runner, argv)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingRunner;

    #[test]
    fn test_run_checked_reports_stderr() {
        let runner = RecordingRunner::new();
        runner.respond_err("ip netns add", 2, "File exists");

        let err = run_checked(&runner, &["ip", "netns", "add", "h1"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ip netns add h1"), "{msg}");
        assert!(msg.contains("File exists"), "{msg}");
    }

    #[test]
    fn test_run_ignores_status() {
        let runner = RecordingRunner::new();
        runner.respond_err("ip link del", 1, "Cannot find device");

        let out = run(&runner, &["ip", "link", "del", "s1-eth1"]).expect("run");
        assert!(!out.status.success());
        assert_eq!(runner.commands(), vec!["ip link del s1-eth1"]);
    }

    #[test]
    fn test_stdout_of() {
        let runner = RecordingRunner::new();
        runner.respond("ovs-vsctl list-ports", "s1-eth1\ns1-eth2\n");

        let out = stdout_of(&runner, &["ovs-vsctl", "list-ports", "s1"]).expect("stdout");
        assert_eq!(out.lines().count(), 2);
    }

    #[test]
    fn test_system_runner_rejects_empty_argv() {
        let runner = SystemRunner::new(false);
        assert!(runner.output(&[]).is_err());
    }

    #[test]
    fn test_tracking_clears_on_drop() {
        let tracker = ChildTracker::new();
        assert_eq!(tracker.pid(), None);
        assert!(!tracker.terminate());
        {
            let _tracking = tracker.track(4242, true);
            assert_eq!(tracker.pid(), Some(4242));
            assert!(tracker.is_attached());
        }
        assert_eq!(tracker.pid(), None);
        assert!(!tracker.is_attached());
    }

    #[test]
    fn test_terminate_running_command() {
        use std::os::unix::process::ExitStatusExt;
        use std::time::{Duration, Instant};

        let runner = SystemRunner::new(false);
        let children = runner.children();
        let waiter = std::thread::spawn(move || runner.status(&["sleep", "30"]));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !children.is_attached() {
            assert!(Instant::now() < deadline, "sleep never started");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(children.terminate());

        let status = waiter.join().unwrap().expect("status");
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        assert_eq!(children.pid(), None);
    }
}
