//! The emulated network: a [`Topology`] realised as namespaces, bridges and
//! veth pairs.
//!
//! Every OS object is held by an RAII handle. [`Network::stop`] (or drop)
//! removes bridges first, then links, then namespaces, so a network that
//! failed halfway through [`Network::build`] or [`Network::start`] still
//! cleans up whatever it created.

use std::collections::HashMap;
use std::process::Output;

use anyhow::{Context, Result, bail};
use network_sim::{
    Bridge, Namespace, SharedRunner, VethPair, configure_root_iface, dpid_from_name, run,
};
use tracing::{debug, info};

use crate::topology::{Endpoint, Ipv4Cidr, Link, NodeKind, Topology};

pub struct Network {
    topology: Topology,
    runner: SharedRunner,
    namespaces: HashMap<String, Namespace>,
    bridges: Vec<Bridge>,
    veths: Vec<VethPair>,
    started: bool,
}

impl Network {
    /// Create every namespace, bridge and link of `topology`.
    ///
    /// Hosts without a static address are numbered first. Nothing is
    /// brought up and no switch has a controller until [`Network::start`].
    pub fn build(mut topology: Topology, runner: SharedRunner) -> Result<Self> {
        topology.assign_addresses(&[])?;
        topology.validate()?;

        let mut net = Self {
            topology,
            runner,
            namespaces: HashMap::new(),
            bridges: Vec::new(),
            veths: Vec::new(),
            started: false,
        };

        info!(
            topology = net.topology.name(),
            hosts = net.topology.hosts().count(),
            switches = net.topology.switches().count(),
            links = net.topology.links().len(),
            "building network"
        );

        let nodes = net.topology.nodes().to_vec();
        for (i, node) in nodes.iter().enumerate() {
            match node.kind {
                NodeKind::Host => {
                    let ns = Namespace::new(net.runner.clone(), &node.name)?;
                    net.namespaces.insert(node.name.clone(), ns);
                }
                NodeKind::Switch => {
                    let dpid = dpid_from_name(&node.name)
                        .unwrap_or_else(|| format!("{:016x}", i + 1));
                    let bridge = Bridge::new(net.runner.clone(), &node.name, &dpid)?;
                    net.bridges.push(bridge);
                }
                NodeKind::Gateway => {}
            }
        }

        let links = net.topology.links().to_vec();
        for link in &links {
            net.create_link(link)?;
        }

        Ok(net)
    }

    fn create_link(&mut self, link: &Link) -> Result<()> {
        let veth = VethPair::new(self.runner.clone(), &link.a.intf, &link.b.intf)?;
        if let Some(ns) = self.namespaces.get(&link.a.node) {
            veth.move_local(ns)?;
        }
        if let Some(ns) = self.namespaces.get(&link.b.node) {
            veth.move_peer(ns)?;
        }
        debug!(a = %link.a.node, b = %link.b.node, "link created");
        self.veths.push(veth);
        Ok(())
    }

    /// Add a gateway node in the root namespace, linked to `switch` and
    /// addressed `ip`. Only possible before the network is started.
    pub fn add_gateway_link(&mut self, name: &str, switch: &str, ip: Ipv4Cidr) -> Result<()> {
        if self.started {
            bail!("cannot add gateway '{name}' to a running network");
        }
        if self.topology.node(switch).map(|n| n.kind) != Some(NodeKind::Switch) {
            bail!("gateway switch '{switch}' is not a switch of this topology");
        }
        self.topology.check_address_free(ip.addr(), name)?;
        self.topology.add_gateway(name)?;
        let link = self
            .topology
            .add_link_with_ips(name, Some(ip), switch, None)?
            .clone();
        self.create_link(&link)?;
        info!(gateway = name, switch, %ip, "gateway linked");
        Ok(())
    }

    /// Configure addresses, bring every interface up, plug the switch-side
    /// interfaces and physical ports into their bridges, and register every
    /// bridge with the controller.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            bail!("network already started");
        }
        let Some(controller) = self.topology.controller().cloned() else {
            bail!("no controller configured; refusing to start switches in secure mode");
        };

        let links = self.topology.links().to_vec();
        for end in links.iter().flat_map(|l| [&l.a, &l.b]) {
            self.configure_endpoint(end)?;
        }

        for bridge in &self.bridges {
            for end in self.topology.endpoints(&bridge.name) {
                bridge.add_port(&end.intf)?;
            }
            for port in self.topology.ports().iter().filter(|p| p.switch == bridge.name) {
                bridge
                    .add_port(&port.intf)
                    .with_context(|| format!("attach {} to {}", port.intf, port.switch))?;
            }
        }

        let target = controller.target();
        for bridge in &self.bridges {
            bridge.set_controller(&target)?;
        }

        self.started = true;
        info!(controller = %controller.name, %target, "network started");
        Ok(())
    }

    fn configure_endpoint(&self, end: &Endpoint) -> Result<()> {
        let ip = self.topology.endpoint_ip(end).map(|c| c.to_string());
        match self.topology.node(&end.node).map(|n| n.kind) {
            Some(NodeKind::Host) => {
                let ns = self
                    .namespaces
                    .get(&end.node)
                    .with_context(|| format!("no namespace for host '{}'", end.node))?;
                ns.configure_iface(&end.intf, ip.as_deref())
            }
            Some(NodeKind::Gateway) => configure_root_iface(&self.runner, &end.intf, ip.as_deref()),
            // Switch ports come up as they join their bridge
            Some(NodeKind::Switch) | None => Ok(()),
        }
    }

    /// Remove everything the network created. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.bridges.is_empty() && self.veths.is_empty() && self.namespaces.is_empty() {
            return;
        }
        info!(topology = self.topology.name(), "stopping network");
        self.bridges.clear();
        self.veths.clear();
        self.namespaces.clear();
        self.started = false;
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn runner(&self) -> &SharedRunner {
        &self.runner
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn namespace(&self, host: &str) -> Option<&Namespace> {
        self.namespaces.get(host)
    }

    pub fn bridge(&self, switch: &str) -> Option<&Bridge> {
        self.bridges.iter().find(|b| b.name == switch)
    }

    /// Run `argv` on `node`: inside its namespace for hosts, in the root
    /// namespace for switches and gateways.
    pub fn exec(&self, node: &str, argv: &[&str]) -> Result<Output> {
        let Some((cmd, args)) = argv.split_first() else {
            bail!("empty command");
        };
        if !self.topology.contains(node) {
            bail!("unknown node '{node}'");
        }
        match self.namespaces.get(node) {
            Some(ns) => ns.exec(cmd, args),
            None => run(&*self.runner, argv),
        }
    }

    /// The full command line running `argv` on `node`: wrapped in
    /// `ip netns exec` for hosts, unchanged for switches and gateways.
    pub fn command_line(&self, node: &str, argv: &[&str]) -> Result<Vec<String>> {
        if argv.is_empty() {
            bail!("empty command");
        }
        if !self.topology.contains(node) {
            bail!("unknown node '{node}'");
        }
        let mut full: Vec<String> = match self.namespaces.get(node) {
            Some(ns) => ["ip", "netns", "exec", ns.name.as_str()]
                .map(String::from)
                .to_vec(),
            None => Vec::new(),
        };
        full.extend(argv.iter().map(|a| a.to_string()));
        Ok(full)
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.stop();
    }
}
