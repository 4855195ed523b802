use serde::{Deserialize, Serialize};

use super::{Controller, Ipv4Cidr, Topology, TopologyError};

/// JSON form of a topology.
///
/// ```json
/// {
///   "name": "star",
///   "subnet": "10.0.0.0/8",
///   "controller": { "name": "c0", "ip": "192.168.176.132" },
///   "switches": ["s1"],
///   "hosts": [{ "name": "h1" }, { "name": "h2", "ip": "10.0.0.2/8" }],
///   "links": [["s1", "h1"], ["s1", "h2"]],
///   "attachment_points": [{ "switch": "s1", "default_intf": "eth1" }]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyDescriptor {
    pub name: String,
    #[serde(default)]
    pub subnet: Option<Ipv4Cidr>,
    #[serde(default)]
    pub controller: Option<Controller>,
    #[serde(default)]
    pub switches: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<HostDescriptor>,
    #[serde(default)]
    pub links: Vec<(String, String)>,
    #[serde(default)]
    pub attachment_points: Vec<AttachmentDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostDescriptor {
    pub name: String,
    #[serde(default)]
    pub ip: Option<Ipv4Cidr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachmentDescriptor {
    pub switch: String,
    pub default_intf: String,
}

impl TopologyDescriptor {
    /// Declare every node, then every link, then attachment points.
    pub fn into_topology(self) -> Result<Topology, TopologyError> {
        let mut topo = Topology::new(&self.name);
        if let Some(subnet) = self.subnet {
            topo.set_subnet(subnet);
        }
        for switch in &self.switches {
            topo.add_switch(switch)?;
        }
        for host in &self.hosts {
            topo.add_host(&host.name, host.ip)?;
        }
        for (a, b) in &self.links {
            topo.add_link(a, b)?;
        }
        for point in &self.attachment_points {
            topo.add_attachment_point(&point.switch, &point.default_intf)?;
        }
        if let Some(controller) = self.controller {
            topo.set_controller(controller);
        }
        Ok(topo)
    }
}

impl Topology {
    pub fn from_json(json: &str) -> Result<Topology, TopologyError> {
        let descriptor: TopologyDescriptor = serde_json::from_str(json)?;
        descriptor.into_topology()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_from_json() {
        let topo = Topology::from_json(
            r#"{
                "name": "star",
                "controller": { "name": "c0", "ip": "192.168.176.132" },
                "switches": ["s1"],
                "hosts": [{ "name": "h1" }, { "name": "h2", "ip": "10.0.0.2/8" }],
                "links": [["s1", "h1"], ["s1", "h2"]],
                "attachment_points": [{ "switch": "s1", "default_intf": "eth1" }]
            }"#,
        )
        .expect("parse");

        assert_eq!(topo.name(), "star");
        assert_eq!(topo.neighbors("s1"), vec!["h1", "h2"]);
        assert_eq!(topo.node("h2").unwrap().ip.unwrap().to_string(), "10.0.0.2/8");
        let controller = topo.controller().unwrap();
        assert_eq!(controller.ip, Ipv4Addr::new(192, 168, 176, 132));
        assert_eq!(controller.port, 6653);
        assert_eq!(topo.attachment_points().len(), 1);
    }

    #[test]
    fn test_from_json_rejects_dangling_link() {
        let err = Topology::from_json(
            r#"{ "name": "bad", "switches": ["s1"], "links": [["s1", "h1"]] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::UnknownNode(n) if n == "h1"));
    }

    #[test]
    fn test_from_json_rejects_unknown_fields() {
        let err = Topology::from_json(r#"{ "name": "x", "routers": [] }"#).unwrap_err();
        assert!(matches!(err, TopologyError::Descriptor(_)));
    }
}
