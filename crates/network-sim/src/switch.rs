use anyhow::{Context, Result};
use tracing::debug;

use crate::command::{SharedRunner, run, run_checked, stdout_of};

/// Derive an OpenFlow datapath id from the digits in a switch name.
///
/// `s15` becomes `000000000000000f`. Returns `None` when the name carries
/// no digits or the number does not fit in 64 bits.
pub fn dpid_from_name(name: &str) -> Option<String> {
    let digits: String = name.chars().filter(char::is_ascii_digit).collect();
    let n: u64 = digits.parse().ok()?;
    Some(format!("{n:016x}"))
}

/// An Open vSwitch bridge in the root namespace with RAII cleanup.
///
/// The bridge runs in `secure` fail mode, so it forwards nothing until a
/// controller installs flows.
pub struct Bridge {
    pub name: String,
    runner: SharedRunner,
}

impl Bridge {
    pub fn new(runner: SharedRunner, name: &str, dpid: &str) -> Result<Self> {
        let dpid_arg = format!("other_config:datapath-id={dpid}");
        run_checked(
            &*runner,
            &[
                "ovs-vsctl",
                "--if-exists",
                "del-br",
                name,
                "--",
                "add-br",
                name,
                "--",
                "set",
                "bridge",
                name,
                "fail_mode=secure",
                &dpid_arg,
            ],
        )
        .with_context(|| format!("create bridge '{name}'"))?;

        debug!(bridge = name, dpid, "created ovs bridge");

        Ok(Self {
            name: name.to_string(),
            runner,
        })
    }

    /// Add `port` to the bridge and bring it up.
    pub fn add_port(&self, port: &str) -> Result<()> {
        run_checked(&*self.runner, &["ovs-vsctl", "add-port", &self.name, port])
            .with_context(|| format!("add port {port} to '{}'", self.name))?;
        run_checked(&*self.runner, &["ip", "link", "set", port, "up"])
            .with_context(|| format!("bring {port} up"))?;
        debug!(bridge = %self.name, port, "added bridge port");
        Ok(())
    }

    /// Point the bridge at an OpenFlow controller, e.g. `tcp:10.0.0.1:6653`.
    pub fn set_controller(&self, target: &str) -> Result<()> {
        run_checked(
            &*self.runner,
            &["ovs-vsctl", "set-controller", &self.name, target],
        )
        .with_context(|| format!("set controller {target} on '{}'", self.name))?;
        debug!(bridge = %self.name, target, "controller registered");
        Ok(())
    }

    /// List the ports currently attached to the bridge.
    pub fn ports(&self) -> Result<Vec<String>> {
        let out = stdout_of(&*self.runner, &["ovs-vsctl", "list-ports", &self.name])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        debug!(bridge = %self.name, "deleting ovs bridge");
        let _ = run(
            &*self.runner,
            &["ovs-vsctl", "--if-exists", "del-br", &self.name],
        );
    }
}
