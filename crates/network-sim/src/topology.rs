use std::process::Output;

use anyhow::{Context, Result};
use tracing::debug;

use crate::command::{SharedRunner, run, run_checked};

/// Linux limit on network device names.
pub const IFNAME_MAX: usize = 15;

/// A Linux network namespace with RAII cleanup.
///
/// Creates the namespace on construction, brings up loopback, and deletes
/// it on drop. Commands inside the namespace run via `ip netns exec`.
pub struct Namespace {
    pub name: String,
    runner: SharedRunner,
}

impl Namespace {
    pub fn new(runner: SharedRunner, name: &str) -> Result<Self> {
        // Stale namespace left by an earlier run
        let _ = run(&*runner, &["ip", "netns", "del", name]);

        run_checked(&*runner, &["ip", "netns", "add", name])
            .with_context(|| format!("create netns '{name}'"))?;

        debug!(ns = name, "created network namespace");

        // Loopback is best-effort
        let _ = run(
            &*runner,
            &["ip", "netns", "exec", name, "ip", "link", "set", "lo", "up"],
        );

        Ok(Self {
            name: name.to_string(),
            runner,
        })
    }

    fn argv<'a>(&'a self, cmd: &'a str, args: &[&'a str]) -> Vec<&'a str> {
        let mut full = vec!["ip", "netns", "exec", self.name.as_str(), cmd];
        full.extend_from_slice(args);
        full
    }

    /// Run a command inside this namespace, returning raw output.
    pub fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        run(&*self.runner, &self.argv(cmd, args))
            .with_context(|| format!("exec '{cmd}' in ns '{}'", self.name))
    }

    /// Run a command inside this namespace, failing if it exits non-zero.
    pub fn exec_checked(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        run_checked(&*self.runner, &self.argv(cmd, args))
            .with_context(|| format!("exec '{cmd}' in ns '{}'", self.name))
    }

    /// Assign `cidr` (if any) to `iface` and bring it up.
    pub fn configure_iface(&self, iface: &str, cidr: Option<&str>) -> Result<()> {
        if let Some(cidr) = cidr {
            self.exec_checked("ip", &["addr", "add", cidr, "dev", iface])
                .with_context(|| format!("set {cidr} on {iface}"))?;
        }
        self.exec_checked("ip", &["link", "set", iface, "up"])
            .with_context(|| format!("bring {iface} up"))?;
        Ok(())
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        debug!(ns = %self.name, "deleting network namespace");
        let _ = run(&*self.runner, &["ip", "netns", "del", &self.name]);
    }
}

/// Assign `cidr` (if any) to `iface` in the root namespace and bring it up.
pub fn configure_root_iface(runner: &SharedRunner, iface: &str, cidr: Option<&str>) -> Result<()> {
    if let Some(cidr) = cidr {
        run_checked(&**runner, &["ip", "addr", "add", cidr, "dev", iface])
            .with_context(|| format!("set {cidr} on {iface}"))?;
    }
    run_checked(&**runner, &["ip", "link", "set", iface, "up"])
        .with_context(|| format!("bring {iface} up"))?;
    Ok(())
}

/// A veth pair created in the root namespace.
///
/// Dropping the pair deletes `local` from the root namespace, which removes
/// the peer too. Either end may be moved into a [`Namespace`].
pub struct VethPair {
    pub local: String,
    pub peer: String,
    runner: SharedRunner,
}

impl VethPair {
    pub fn new(runner: SharedRunner, local: &str, peer: &str) -> Result<Self> {
        // Stale veth left by an earlier run
        let _ = run(&*runner, &["ip", "link", "del", local]);

        run_checked(
            &*runner,
            &["ip", "link", "add", local, "type", "veth", "peer", "name", peer],
        )
        .with_context(|| format!("create veth pair {local} <-> {peer}"))?;

        debug!(local, peer, "created veth pair");

        Ok(Self {
            local: local.to_string(),
            peer: peer.to_string(),
            runner,
        })
    }

    /// Move the local end into `ns`. The pair then disappears with the
    /// namespace; the root-namespace delete on drop becomes a no-op.
    pub fn move_local(&self, ns: &Namespace) -> Result<()> {
        run_checked(&*self.runner, &["ip", "link", "set", &self.local, "netns", &ns.name])
            .with_context(|| format!("move {} into ns '{}'", self.local, ns.name))?;
        Ok(())
    }

    /// Move the peer end into `ns`.
    pub fn move_peer(&self, ns: &Namespace) -> Result<()> {
        run_checked(&*self.runner, &["ip", "link", "set", &self.peer, "netns", &ns.name])
            .with_context(|| format!("move {} into ns '{}'", self.peer, ns.name))?;
        Ok(())
    }
}

impl Drop for VethPair {
    fn drop(&mut self) {
        debug!(local = %self.local, "deleting veth pair");
        let _ = run(&*self.runner, &["ip", "link", "del", &self.local]);
    }
}
