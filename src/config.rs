//! Command-line configuration.
//!
//! [`Cli`] is the raw clap surface; [`BootstrapConfig`] is what the
//! bootstrap sequence consumes, with defaults applied and the topology
//! source resolved.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::gateway::GatewayConfig;
use crate::topology::presets::{self, PresetKind};
use crate::topology::{Controller, DEFAULT_CONTROLLER_PORT, Ipv4Cidr, Topology};

pub const DEFAULT_CONTROLLER_NAME: &str = "c0";
pub const DEFAULT_CONTROLLER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 176, 132);

#[derive(Parser, Debug)]
#[command(
    name = "sdn_bootstrap",
    author,
    version,
    disable_version_flag = true,
    about = "Build an emulated OpenFlow network, attach physical ports and NAT it to the internet"
)]
pub struct Cli {
    /// Print the version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::SetTrue)]
    pub print_version: bool,

    /// Physical interfaces for the topology's attachment points, in order
    /// (default eth1, eth2, ...)
    pub interfaces: Vec<String>,

    /// Built-in topology: two-tree (default), mini-circle, tree
    #[arg(long = "topology", value_enum, default_value = "two-tree")]
    pub topology: PresetKind,
    /// Tree depth (tree only)
    #[arg(long = "depth", default_value = "2")]
    pub depth: u32,
    /// Tree fanout (tree only)
    #[arg(long = "fanout", default_value = "2")]
    pub fanout: u32,
    /// Load the topology from a JSON descriptor instead of a built-in one
    #[arg(long = "topology-file", conflicts_with = "topology")]
    pub topology_file: Option<PathBuf>,

    /// Attach an extra interface to a switch, as IFACE=SWITCH (repeatable)
    #[arg(long = "attach", value_parser = parse_attachment)]
    pub attach: Vec<(String, String)>,
    /// Do not attach any physical interface
    #[arg(long = "no-attach")]
    pub no_attach: bool,

    /// Controller name [default: c0]
    #[arg(long = "controller-name")]
    pub controller_name: Option<String>,
    /// Controller address [default: 192.168.176.132]
    #[arg(long = "controller-ip")]
    pub controller_ip: Option<Ipv4Addr>,
    /// Controller OpenFlow port [default: 6653]
    #[arg(long = "controller-port")]
    pub controller_port: Option<u16>,

    /// Switch linked to the root namespace gateway
    #[arg(long = "gateway-switch", default_value = "s1")]
    pub gateway_switch: String,
    /// Gateway address inside the emulated subnet
    #[arg(long = "root-ip", default_value = "10.0.0.254/8")]
    pub root_ip: Ipv4Cidr,
    /// Emulated subnet [default: 10.0.0.0/8]
    #[arg(long = "subnet")]
    pub subnet: Option<Ipv4Cidr>,
    /// Internet-facing interface of this machine
    #[arg(long = "inet-intf", default_value = "eth0")]
    pub inet_intf: String,
    /// Interfaces file that keeps the network manager off the gateway link
    #[arg(long = "interfaces-file", default_value = "/etc/network/interfaces")]
    pub interfaces_file: PathBuf,
    /// Do not connect the emulated network to the internet
    #[arg(long = "no-internet")]
    pub no_internet: bool,

    /// Run every system command through sudo
    #[arg(long = "sudo")]
    pub sudo: bool,
}

/// Parse `IFACE=SWITCH`.
pub fn parse_attachment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((intf, switch)) if !intf.is_empty() && !switch.is_empty() => {
            Ok((intf.to_string(), switch.to_string()))
        }
        _ => Err(format!("invalid attachment '{s}': expected IFACE=SWITCH")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologySource {
    Preset {
        kind: PresetKind,
        depth: u32,
        fanout: u32,
    },
    File(PathBuf),
}

impl TopologySource {
    pub fn load(&self) -> Result<Topology> {
        let topo = match self {
            TopologySource::Preset { kind, depth, fanout } => match kind {
                PresetKind::TwoTree => presets::two_tree()?,
                PresetKind::MiniCircle => presets::mini_circle()?,
                PresetKind::Tree => {
                    if *depth == 0 || *fanout == 0 {
                        bail!("tree depth and fanout must be at least 1");
                    }
                    presets::tree(*depth, *fanout)?
                }
            },
            TopologySource::File(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("read topology file {}", path.display()))?;
                Topology::from_json(&json)
                    .with_context(|| format!("load topology file {}", path.display()))?
            }
        };
        Ok(topo)
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub source: TopologySource,
    /// Interfaces for the attachment points, in order.
    pub interfaces: Vec<String>,
    /// Extra `(interface, switch)` bindings.
    pub attachments: Vec<(String, String)>,
    pub attach: bool,
    pub controller_name: Option<String>,
    pub controller_ip: Option<Ipv4Addr>,
    pub controller_port: Option<u16>,
    pub subnet: Option<Ipv4Cidr>,
    /// `None` keeps the network offline.
    pub gateway: Option<GatewayConfig>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            source: TopologySource::Preset {
                kind: PresetKind::TwoTree,
                depth: 2,
                fanout: 2,
            },
            interfaces: Vec::new(),
            attachments: Vec::new(),
            attach: true,
            controller_name: None,
            controller_ip: None,
            controller_port: None,
            subnet: None,
            gateway: Some(GatewayConfig::default()),
        }
    }
}

impl BootstrapConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        let source = match &cli.topology_file {
            Some(path) => TopologySource::File(path.clone()),
            None => TopologySource::Preset {
                kind: cli.topology,
                depth: cli.depth,
                fanout: cli.fanout,
            },
        };
        let gateway = (!cli.no_internet).then(|| GatewayConfig {
            switch: cli.gateway_switch.clone(),
            ip: cli.root_ip,
            inet_intf: cli.inet_intf.clone(),
            interfaces_file: cli.interfaces_file.clone(),
            ..GatewayConfig::default()
        });
        Self {
            source,
            interfaces: cli.interfaces.clone(),
            attachments: cli.attach.clone(),
            attach: !cli.no_attach,
            controller_name: cli.controller_name.clone(),
            controller_ip: cli.controller_ip,
            controller_port: cli.controller_port,
            subnet: cli.subnet,
            gateway,
        }
    }

    /// The controller to register: the topology's own, if it names one,
    /// with any command-line values layered on top.
    pub fn resolve_controller(&self, existing: Option<&Controller>) -> Controller {
        let mut controller = existing.cloned().unwrap_or_else(|| {
            Controller::new(
                DEFAULT_CONTROLLER_NAME,
                DEFAULT_CONTROLLER_IP,
                DEFAULT_CONTROLLER_PORT,
            )
        });
        if let Some(name) = &self.controller_name {
            controller.name = name.clone();
        }
        if let Some(ip) = self.controller_ip {
            controller.ip = ip;
        }
        if let Some(port) = self.controller_port {
            controller.port = port;
        }
        controller
    }

    /// Load the topology and apply subnet and controller settings.
    pub fn topology(&self) -> Result<Topology> {
        let mut topo = self.source.load()?;
        if let Some(subnet) = self.subnet {
            topo.set_subnet(subnet);
        }
        let controller = self.resolve_controller(topo.controller());
        topo.set_controller(controller);
        Ok(topo)
    }

    /// `(interface, switch)` pairs to attach to `topo`: positional
    /// interfaces map onto the attachment points in order, unnamed points
    /// take their default interface, extra bindings come last.
    pub fn attachments_for(&self, topo: &Topology) -> Result<Vec<(String, String)>> {
        if !self.attach {
            return Ok(Vec::new());
        }
        let points = topo.attachment_points();
        if self.interfaces.len() > points.len() {
            bail!(
                "{} interfaces given but topology '{}' has {} attachment point(s); \
                 use --attach IFACE=SWITCH",
                self.interfaces.len(),
                topo.name(),
                points.len()
            );
        }
        let mut pairs: Vec<(String, String)> = points
            .iter()
            .enumerate()
            .map(|(i, point)| {
                let intf = self
                    .interfaces
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| point.default_intf.clone());
                (intf, point.switch.clone())
            })
            .collect();
        pairs.extend(self.attachments.iter().cloned());
        Ok(pairs)
    }
}
