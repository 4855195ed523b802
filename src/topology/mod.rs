//! Declarative description of an emulated network.
//!
//! A [`Topology`] is built by explicit node and link declarations. It
//! enforces its invariants at insertion time: links only reference nodes
//! that already exist, a node pair is linked at most once, and every
//! generated interface name fits the Linux netdev limit.

mod addr;
mod descriptor;
pub mod presets;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;

use network_sim::IFNAME_MAX;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use addr::{CidrError, Ipv4Cidr};
pub use descriptor::TopologyDescriptor;

/// Default OpenFlow controller port.
pub const DEFAULT_CONTROLLER_PORT: u16 = 6653;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("invalid node name '{0}'")]
    InvalidName(String),
    #[error("node '{0}' already exists")]
    DuplicateNode(String),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("link {0} <-> {1} already exists")]
    DuplicateLink(String, String),
    #[error("node '{0}' cannot be linked to itself")]
    SelfLoop(String),
    #[error("interface name '{0}' exceeds {IFNAME_MAX} characters")]
    InterfaceNameTooLong(String),
    #[error("'{0}' is not a switch")]
    NotASwitch(String),
    #[error("interface {intf} is already attached to {switch}")]
    PortInUse { intf: String, switch: String },
    #[error("address {addr} is used by both {first} and {second}")]
    DuplicateAddress {
        addr: Ipv4Addr,
        first: String,
        second: String,
    },
    #[error("no free address left in {0}")]
    AddressesExhausted(Ipv4Cidr),
    #[error("topology has no nodes")]
    Empty,
    #[error("topology is not connected: {0} unreachable from {1}")]
    Disconnected(String, String),
    #[error("invalid topology descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Switch,
    Host,
    /// Lives in the root namespace and routes the emulated subnet outward.
    Gateway,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Static address of the node's first interface.
    pub ip: Option<Ipv4Cidr>,
}

/// One end of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub node: String,
    pub intf: String,
    /// Address assigned to this interface, overriding the node's address.
    pub ip: Option<Ipv4Cidr>,
}

/// An undirected link. Endpoint order is declaration order only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub a: Endpoint,
    pub b: Endpoint,
}

impl Link {
    pub fn touches(&self, node: &str) -> bool {
        self.a.node == node || self.b.node == node
    }

    /// The endpoint on `node`'s side, if the link touches it.
    pub fn end_of(&self, node: &str) -> Option<&Endpoint> {
        if self.a.node == node {
            Some(&self.a)
        } else if self.b.node == node {
            Some(&self.b)
        } else {
            None
        }
    }

    /// The endpoint opposite `node`.
    pub fn peer_of(&self, node: &str) -> Option<&Endpoint> {
        if self.a.node == node {
            Some(&self.b)
        } else if self.b.node == node {
            Some(&self.a)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controller {
    pub name: String,
    pub ip: Ipv4Addr,
    #[serde(default = "default_controller_port")]
    pub port: u16,
}

fn default_controller_port() -> u16 {
    DEFAULT_CONTROLLER_PORT
}

impl Controller {
    pub fn new(name: &str, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            name: name.to_string(),
            ip,
            port,
        }
    }

    /// OVS controller target string, e.g. `tcp:192.168.176.132:6653`.
    pub fn target(&self) -> String {
        format!("tcp:{}:{}", self.ip, self.port)
    }
}

/// A switch where a physical interface is expected to be plugged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPoint {
    pub switch: String,
    pub default_intf: String,
}

/// A host interface bound to a switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalPort {
    pub intf: String,
    pub switch: String,
}

#[derive(Debug, Clone)]
pub struct Topology {
    name: String,
    subnet: Ipv4Cidr,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    links: Vec<Link>,
    link_keys: HashSet<(String, String)>,
    next_port: HashMap<String, u32>,
    controller: Option<Controller>,
    attachment_points: Vec<AttachmentPoint>,
    ports: Vec<PhysicalPort>,
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < IFNAME_MAX
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl Topology {
    /// An empty topology on the `10.0.0.0/8` subnet.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subnet: Ipv4Cidr::DEFAULT_SUBNET,
            nodes: Vec::new(),
            index: HashMap::new(),
            links: Vec::new(),
            link_keys: HashSet::new(),
            next_port: HashMap::new(),
            controller: None,
            attachment_points: Vec::new(),
            ports: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subnet(&self) -> Ipv4Cidr {
        self.subnet
    }

    pub fn set_subnet(&mut self, subnet: Ipv4Cidr) {
        self.subnet = subnet.network();
    }

    fn add_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        ip: Option<Ipv4Cidr>,
    ) -> Result<(), TopologyError> {
        if !valid_name(name) {
            return Err(TopologyError::InvalidName(name.to_string()));
        }
        if self.index.contains_key(name) {
            return Err(TopologyError::DuplicateNode(name.to_string()));
        }
        // Mininet numbering: host and gateway ports from 0, switch ports from 1
        let first_port = if kind == NodeKind::Switch { 1 } else { 0 };
        self.index.insert(name.to_string(), self.nodes.len());
        self.next_port.insert(name.to_string(), first_port);
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
            ip,
        });
        Ok(())
    }

    pub fn add_switch(&mut self, name: &str) -> Result<(), TopologyError> {
        self.add_node(name, NodeKind::Switch, None)
    }

    pub fn add_host(&mut self, name: &str, ip: Option<Ipv4Cidr>) -> Result<(), TopologyError> {
        self.add_node(name, NodeKind::Host, ip)
    }

    pub fn add_gateway(&mut self, name: &str) -> Result<(), TopologyError> {
        self.add_node(name, NodeKind::Gateway, None)
    }

    fn peek_intf(&self, node: &str) -> Result<String, TopologyError> {
        let port = self
            .next_port
            .get(node)
            .ok_or_else(|| TopologyError::UnknownNode(node.to_string()))?;
        let intf = format!("{node}-eth{port}");
        if intf.len() > IFNAME_MAX {
            return Err(TopologyError::InterfaceNameTooLong(intf));
        }
        Ok(intf)
    }

    /// Link two existing nodes. Returns a reference to the new link.
    pub fn add_link(&mut self, a: &str, b: &str) -> Result<&Link, TopologyError> {
        self.add_link_with_ips(a, None, b, None)
    }

    /// Link two existing nodes, assigning per-endpoint addresses.
    pub fn add_link_with_ips(
        &mut self,
        a: &str,
        a_ip: Option<Ipv4Cidr>,
        b: &str,
        b_ip: Option<Ipv4Cidr>,
    ) -> Result<&Link, TopologyError> {
        for node in [a, b] {
            if !self.index.contains_key(node) {
                return Err(TopologyError::UnknownNode(node.to_string()));
            }
        }
        if a == b {
            return Err(TopologyError::SelfLoop(a.to_string()));
        }
        let key = link_key(a, b);
        if self.link_keys.contains(&key) {
            return Err(TopologyError::DuplicateLink(a.to_string(), b.to_string()));
        }

        let a_intf = self.peek_intf(a)?;
        let b_intf = self.peek_intf(b)?;
        for node in [a, b] {
            if let Some(port) = self.next_port.get_mut(node) {
                *port += 1;
            }
        }

        self.link_keys.insert(key);
        self.links.push(Link {
            a: Endpoint {
                node: a.to_string(),
                intf: a_intf,
                ip: a_ip,
            },
            b: Endpoint {
                node: b.to_string(),
                intf: b_intf,
                ip: b_ip,
            },
        });
        Ok(&self.links[self.links.len() - 1])
    }

    pub fn set_controller(&mut self, controller: Controller) {
        self.controller = Some(controller);
    }

    pub fn controller(&self) -> Option<&Controller> {
        self.controller.as_ref()
    }

    pub fn add_attachment_point(
        &mut self,
        switch: &str,
        default_intf: &str,
    ) -> Result<(), TopologyError> {
        self.require_switch(switch)?;
        self.attachment_points.push(AttachmentPoint {
            switch: switch.to_string(),
            default_intf: default_intf.to_string(),
        });
        Ok(())
    }

    pub fn attachment_points(&self) -> &[AttachmentPoint] {
        &self.attachment_points
    }

    fn require_switch(&self, name: &str) -> Result<&Node, TopologyError> {
        let node = self
            .node(name)
            .ok_or_else(|| TopologyError::UnknownNode(name.to_string()))?;
        if node.kind != NodeKind::Switch {
            return Err(TopologyError::NotASwitch(name.to_string()));
        }
        Ok(node)
    }

    /// Check that `intf` could be bound to `switch`, without binding it.
    pub fn check_port(&self, intf: &str, switch: &str) -> Result<(), TopologyError> {
        self.require_switch(switch)?;
        if let Some(p) = self.ports.iter().find(|p| p.intf == intf) {
            return Err(TopologyError::PortInUse {
                intf: intf.to_string(),
                switch: p.switch.clone(),
            });
        }
        Ok(())
    }

    /// Bind the host interface `intf` to `switch`.
    pub fn add_port(&mut self, intf: &str, switch: &str) -> Result<(), TopologyError> {
        self.check_port(intf, switch)?;
        self.ports.push(PhysicalPort {
            intf: intf.to_string(),
            switch: switch.to_string(),
        });
        Ok(())
    }

    pub fn ports(&self) -> &[PhysicalPort] {
        &self.ports
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Host)
    }

    pub fn switches(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Switch)
    }

    pub fn gateways(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Gateway)
    }

    pub fn has_link(&self, a: &str, b: &str) -> bool {
        self.link_keys.contains(&link_key(a, b))
    }

    /// Names of the nodes directly linked to `name`, in link order.
    pub fn neighbors(&self, name: &str) -> Vec<&str> {
        self.links
            .iter()
            .filter_map(|l| l.peer_of(name))
            .map(|e| e.node.as_str())
            .collect()
    }

    /// `name`'s link endpoints, in link order.
    pub fn endpoints(&self, name: &str) -> Vec<&Endpoint> {
        self.links.iter().filter_map(|l| l.end_of(name)).collect()
    }

    /// The node's first interface, which carries its default route.
    pub fn default_intf(&self, name: &str) -> Option<&str> {
        self.links
            .iter()
            .find_map(|l| l.end_of(name))
            .map(|e| e.intf.as_str())
    }

    /// Address configured on `endpoint`: its own, or the node's address on
    /// the node's first interface.
    pub fn endpoint_ip(&self, endpoint: &Endpoint) -> Option<Ipv4Cidr> {
        if endpoint.ip.is_some() {
            return endpoint.ip;
        }
        let node = self.node(&endpoint.node)?;
        if self.default_intf(&node.name) == Some(endpoint.intf.as_str()) {
            node.ip
        } else {
            None
        }
    }

    /// Give every host without a static address the lowest free address
    /// of the subnet, in declaration order. `reserved` addresses are
    /// skipped in addition to those already assigned.
    pub fn assign_addresses(&mut self, reserved: &[Ipv4Addr]) -> Result<(), TopologyError> {
        let mut used: HashSet<Ipv4Addr> = reserved.iter().copied().collect();
        used.extend(self.nodes.iter().filter_map(|n| n.ip.map(|c| c.addr())));
        used.extend(
            self.links
                .iter()
                .flat_map(|l| [l.a.ip, l.b.ip])
                .flatten()
                .map(|c| c.addr()),
        );

        let subnet = self.subnet;
        let mut next = 1u32;
        for node in self.nodes.iter_mut().filter(|n| n.kind == NodeKind::Host) {
            if node.ip.is_some() {
                continue;
            }
            let ip = loop {
                let candidate = subnet
                    .host(next)
                    .ok_or(TopologyError::AddressesExhausted(subnet))?;
                next += 1;
                if !used.contains(&candidate.addr()) {
                    break candidate;
                }
            };
            used.insert(ip.addr());
            node.ip = Some(ip);
        }
        Ok(())
    }

    /// Every statically held address with the node holding it.
    fn addressed(&self) -> impl Iterator<Item = (Ipv4Addr, &str)> {
        self.nodes
            .iter()
            .filter_map(|n| n.ip.map(|ip| (ip.addr(), n.name.as_str())))
            .chain(
                self.links
                    .iter()
                    .flat_map(|l| [&l.a, &l.b])
                    .filter_map(|e| e.ip.map(|ip| (ip.addr(), e.node.as_str()))),
            )
    }

    /// The node already holding `addr`, if any.
    pub fn address_owner(&self, addr: Ipv4Addr) -> Option<&str> {
        self.addressed()
            .find(|(held, _)| *held == addr)
            .map(|(_, owner)| owner)
    }

    /// Fail when `addr` is already held by a node other than `claimant`.
    pub fn check_address_free(&self, addr: Ipv4Addr, claimant: &str) -> Result<(), TopologyError> {
        match self.address_owner(addr) {
            Some(owner) if owner != claimant => Err(TopologyError::DuplicateAddress {
                addr,
                first: owner.to_string(),
                second: claimant.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Check the graph is non-empty and connected, and that no address is
    /// used twice.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let first = self.nodes.first().ok_or(TopologyError::Empty)?;

        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue = VecDeque::from([first.name.as_str()]);
        seen.insert(&first.name);
        while let Some(cur) = queue.pop_front() {
            for next in self.neighbors(cur) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        if let Some(lost) = self.nodes.iter().find(|n| !seen.contains(n.name.as_str())) {
            return Err(TopologyError::Disconnected(
                lost.name.clone(),
                first.name.clone(),
            ));
        }

        let mut owners: HashMap<Ipv4Addr, &str> = HashMap::new();
        for (addr, owner) in self.addressed() {
            if let Some(prev) = owners.insert(addr, owner)
                && prev != owner
            {
                return Err(TopologyError::DuplicateAddress {
                    addr,
                    first: prev.to_string(),
                    second: owner.to_string(),
                });
            }
        }
        Ok(())
    }
}
