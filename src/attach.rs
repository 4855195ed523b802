//! Binding physical host interfaces into emulated switches.
//!
//! An interface qualifies when it exists and carries no IPv4 address: one
//! that is still configured belongs to the host's own networking and
//! would be cut off once it becomes a switch port.

use std::sync::LazyLock;

use network_sim::{Runner, run};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use crate::topology::{Topology, TopologyError};

static DOTTED_QUAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+\.\d+\.\d+\.\d+").expect("valid regex")
});

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("{0} does not exist")]
    Absent(String),
    #[error("{intf} has an IP address ({}) and is probably in use", .addrs.join(", "))]
    Configured { intf: String, addrs: Vec<String> },
    #[error("unknown switch '{0}'")]
    UnknownSwitch(String),
    #[error("'{0}' is not a switch")]
    NotASwitch(String),
    #[error("{intf} is already attached to {switch}")]
    AlreadyAttached { intf: String, switch: String },
    #[error("cannot inspect {intf}: {reason}")]
    Probe { intf: String, reason: String },
    #[error(transparent)]
    Topology(TopologyError),
}

impl From<TopologyError> for AttachError {
    fn from(err: TopologyError) -> Self {
        match err {
            TopologyError::UnknownNode(name) => AttachError::UnknownSwitch(name),
            TopologyError::NotASwitch(name) => AttachError::NotASwitch(name),
            TopologyError::PortInUse { intf, switch } => {
                AttachError::AlreadyAttached { intf, switch }
            }
            other => AttachError::Topology(other),
        }
    }
}

/// Interface names from `ip -o link show` output.
///
/// Lines look like `3: eth1@if7: <BROADCAST,...> mtu 1500 ...`; the `@peer`
/// suffix is not part of the name.
pub fn link_names(output: &str) -> Vec<&str> {
    output
        .lines()
        .filter_map(|line| line.split(':').nth(1))
        .map(str::trim)
        .map(|name| name.split('@').next().unwrap_or(name))
        .filter(|name| !name.is_empty())
        .collect()
}

/// Every dotted quad in `ip -o -4 addr show` output.
pub fn ipv4_addresses(output: &str) -> Vec<String> {
    DOTTED_QUAD
        .find_iter(output)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Check that `intf` exists on the host and carries no IPv4 address.
pub fn check_interface(runner: &dyn Runner, intf: &str) -> Result<(), AttachError> {
    let probe = |argv: &[&str]| -> Result<String, AttachError> {
        let out = run(runner, argv).map_err(|e| AttachError::Probe {
            intf: intf.to_string(),
            reason: format!("{e:#}"),
        })?;
        if !out.status.success() {
            return Err(AttachError::Probe {
                intf: intf.to_string(),
                reason: format!(
                    "{} ({}): {}",
                    argv.join(" "),
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    };

    let links = probe(&["ip", "-o", "link", "show"])?;
    if !link_names(&links).contains(&intf) {
        return Err(AttachError::Absent(intf.to_string()));
    }

    let addrs = probe(&["ip", "-o", "-4", "addr", "show", "dev", intf])?;
    let addrs = ipv4_addresses(&addrs);
    if !addrs.is_empty() {
        return Err(AttachError::Configured {
            intf: intf.to_string(),
            addrs,
        });
    }

    debug!(intf, "interface is free");
    Ok(())
}

/// Bind the host interface `intf` to `switch`.
///
/// The topology is checked first and the host second; the topology is
/// only changed once both agree.
pub fn attach_interface(
    topo: &mut Topology,
    runner: &dyn Runner,
    intf: &str,
    switch: &str,
) -> Result<(), AttachError> {
    topo.check_port(intf, switch)?;
    check_interface(runner, intf)?;
    topo.add_port(intf, switch)?;
    info!(intf, switch, "attached interface");
    Ok(())
}
