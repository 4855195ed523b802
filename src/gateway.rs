//! Internet access for the emulated subnet through the root namespace.
//!
//! Connecting links a gateway node in the root namespace to one switch,
//! starts the network, NATs the subnet out of the internet-facing
//! interface and points every host's default route at the gateway.
//! Disconnecting flushes the firewall and turns forwarding back off.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use network_sim::{Runner, run, run_checked};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::network::Network;
use crate::topology::Ipv4Cidr;

/// One command of a plan, with a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub description: String,
    pub argv: Vec<String>,
}

impl Step {
    pub fn new(description: &str, argv: &[&str]) -> Self {
        Self {
            description: description.to_string(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    fn args(&self) -> Vec<&str> {
        self.argv.iter().map(String::as_str).collect()
    }

    /// Run the step in the root namespace.
    pub fn run(&self, runner: &dyn Runner) -> Result<()> {
        debug!(step = %self.description, cmd = %self.command_line(), "run step");
        run_checked(runner, &self.args()).with_context(|| format!("{} failed", self.description))?;
        Ok(())
    }

    /// Run the step on `node` of `net`.
    pub fn run_in(&self, net: &Network, node: &str) -> Result<()> {
        debug!(node, step = %self.description, cmd = %self.command_line(), "run step");
        let out = net
            .exec(node, &self.args())
            .with_context(|| format!("{} failed on {node}", self.description))?;
        if !out.status.success() {
            bail!(
                "{} failed on {node} ({}): {}\n{}",
                self.description,
                out.status,
                self.command_line(),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Run `plan` in order, stopping at the first failing step.
pub fn run_plan(runner: &dyn Runner, plan: &[Step]) -> Result<()> {
    for step in plan {
        step.run(runner)?;
    }
    Ok(())
}

/// Firewall and forwarding setup that NATs `subnet`, reached through
/// `local_intf`, out of `inet_intf`.
pub fn nat_start_steps(local_intf: &str, inet_intf: &str, subnet: Ipv4Cidr) -> Vec<Step> {
    let subnet = subnet.network().to_string();
    vec![
        Step::new("flush filter rules", &["iptables", "-F"]),
        Step::new("flush nat rules", &["iptables", "-t", "nat", "-F"]),
        Step::new("accept input", &["iptables", "-P", "INPUT", "ACCEPT"]),
        Step::new("accept output", &["iptables", "-P", "OUTPUT", "ACCEPT"]),
        Step::new("drop unmatched forwards", &["iptables", "-P", "FORWARD", "DROP"]),
        Step::new(
            "drop inbound spoofing of the subnet",
            &["iptables", "-I", "FORWARD", "-i", local_intf, "-d", &subnet, "-j", "DROP"],
        ),
        Step::new(
            "forward subnet traffic outward",
            &["iptables", "-A", "FORWARD", "-i", local_intf, "-s", &subnet, "-j", "ACCEPT"],
        ),
        Step::new(
            "forward replies into the subnet",
            &["iptables", "-A", "FORWARD", "-i", inet_intf, "-d", &subnet, "-j", "ACCEPT"],
        ),
        Step::new(
            "masquerade outbound traffic",
            &["iptables", "-t", "nat", "-A", "POSTROUTING", "-o", inet_intf, "-j", "MASQUERADE"],
        ),
        Step::new("enable forwarding", &["sysctl", "net.ipv4.ip_forward=1"]),
    ]
}

pub fn nat_stop_steps() -> Vec<Step> {
    vec![
        Step::new("flush filter rules", &["iptables", "-F"]),
        Step::new("flush nat rules", &["iptables", "-t", "nat", "-F"]),
        Step::new("disable forwarding", &["sysctl", "net.ipv4.ip_forward=0"]),
    ]
}

/// Routes sending a host's traffic for `subnet` out of `intf` and
/// everything else to `gateway`.
pub fn host_route_steps(intf: &str, subnet: Ipv4Cidr, gateway: Ipv4Addr) -> Vec<Step> {
    let subnet = subnet.network().to_string();
    let gateway = gateway.to_string();
    vec![
        Step::new("flush default route", &["ip", "route", "flush", "root", "0/0"]),
        Step::new("add subnet route", &["ip", "route", "add", &subnet, "dev", intf]),
        Step::new("add default route", &["ip", "route", "add", "default", "via", &gateway]),
    ]
}

/// Keep the network manager away from `intf` by declaring it manually
/// configured in `path`.
///
/// Returns whether the file was changed; the network manager is restarted
/// only then. A missing file is skipped.
pub fn fix_network_manager(runner: &dyn Runner, path: &Path, intf: &str) -> Result<bool> {
    let stanza = format!("\niface {intf} inet manual\n");
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(
                path = %path.display(),
                "interfaces file not found, skipping network manager fix"
            );
            return Ok(false);
        }
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    if contents.contains(&stanza) {
        debug!(intf, path = %path.display(), "interface already manual");
        return Ok(false);
    }

    info!(intf, path = %path.display(), "adding 'iface {intf} inet manual'");
    OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(stanza.as_bytes()))
        .with_context(|| format!("append to {}", path.display()))?;

    match run(runner, &["service", "network-manager", "restart"]) {
        Ok(out) if out.status.success() => {}
        Ok(out) => warn!(
            status = %out.status,
            stderr = %String::from_utf8_lossy(&out.stderr).trim(),
            "network-manager restart failed"
        ),
        Err(e) => warn!(error = %format!("{e:#}"), "network-manager restart failed"),
    }
    Ok(true)
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Name of the gateway node; its interface is `<name>-eth0`.
    pub name: String,
    /// Switch the gateway is linked to.
    pub switch: String,
    /// Gateway address inside the subnet.
    pub ip: Ipv4Cidr,
    /// Internet-facing interface of the host.
    pub inet_intf: String,
    pub interfaces_file: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: "root".to_string(),
            switch: "s1".to_string(),
            ip: Ipv4Cidr::DEFAULT_SUBNET.with_addr(Ipv4Addr::new(10, 0, 0, 254)),
            inet_intf: "eth0".to_string(),
            interfaces_file: PathBuf::from("/etc/network/interfaces"),
        }
    }
}

impl GatewayConfig {
    pub fn local_intf(&self) -> String {
        format!("{}-eth0", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Disconnected,
    Connected,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway is already connected")]
    AlreadyConnected,
    #[error("gateway address {ip} is outside the subnet {subnet}")]
    OutsideSubnet { ip: Ipv4Cidr, subnet: Ipv4Cidr },
    #[error("disconnect incomplete: {}", .0.join("; "))]
    Disconnect(Vec<String>),
}

pub struct Gateway {
    config: GatewayConfig,
    state: GatewayState,
    nat_touched: bool,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            state: GatewayState::Disconnected,
            nat_touched: false,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    /// Whether firewall or forwarding state may have been changed and
    /// needs a [`Gateway::disconnect`].
    pub fn nat_touched(&self) -> bool {
        self.nat_touched
    }

    /// Link the gateway into `net`, start it, NAT the subnet and route
    /// every host through the gateway.
    pub fn connect(&mut self, net: &mut Network) -> Result<()> {
        if self.state == GatewayState::Connected {
            return Err(GatewayError::AlreadyConnected.into());
        }
        let subnet = net.topology().subnet();
        if !subnet.contains(self.config.ip.addr()) {
            return Err(GatewayError::OutsideSubnet {
                ip: self.config.ip,
                subnet,
            }
            .into());
        }

        let local_intf = self.config.local_intf();
        fix_network_manager(&**net.runner(), &self.config.interfaces_file, &local_intf)?;

        net.add_gateway_link(&self.config.name, &self.config.switch, self.config.ip)?;
        net.start()?;

        self.nat_touched = true;
        run_plan(
            &**net.runner(),
            &nat_start_steps(&local_intf, &self.config.inet_intf, subnet),
        )
        .context("start NAT")?;

        let gateway_ip = self.config.ip.addr();
        for host in net.topology().hosts() {
            let Some(intf) = net.topology().default_intf(&host.name) else {
                warn!(host = %host.name, "host has no interface, skipping routes");
                continue;
            };
            for step in host_route_steps(intf, subnet, gateway_ip) {
                step.run_in(net, &host.name)?;
            }
        }

        self.state = GatewayState::Connected;
        info!(
            gateway = %self.config.name,
            switch = %self.config.switch,
            inet = %self.config.inet_intf,
            "connected to the internet"
        );
        Ok(())
    }

    /// Flush the firewall and disable forwarding.
    ///
    /// Every step is attempted even when an earlier one fails; failures are
    /// reported together.
    pub fn disconnect(&mut self, runner: &dyn Runner) -> Result<()> {
        let errors: Vec<String> = nat_stop_steps()
            .iter()
            .filter_map(|step| step.run(runner).err())
            .map(|e| format!("{e:#}"))
            .collect();

        self.state = GatewayState::Disconnected;
        self.nat_touched = false;

        if errors.is_empty() {
            info!("NAT stopped");
            Ok(())
        } else {
            Err(GatewayError::Disconnect(errors).into())
        }
    }
}
