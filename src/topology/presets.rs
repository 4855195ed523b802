//! Built-in topologies.

use std::fmt;
use std::net::Ipv4Addr;

use super::{Ipv4Cidr, Topology, TopologyError};

/// Which built-in topology to build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PresetKind {
    /// Depth-3 binary tree with four physical attachment points.
    #[default]
    TwoTree,
    /// Hub, spoke ring and leaf ring with two hosts per leaf.
    MiniCircle,
    /// Generic tree of configurable depth and fanout.
    Tree,
}

impl fmt::Display for PresetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresetKind::TwoTree => write!(f, "two-tree"),
            PresetKind::MiniCircle => write!(f, "mini-circle"),
            PresetKind::Tree => write!(f, "tree"),
        }
    }
}

impl std::str::FromStr for PresetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "two-tree" => Ok(PresetKind::TwoTree),
            "mini-circle" => Ok(PresetKind::MiniCircle),
            "tree" => Ok(PresetKind::Tree),
            _ => Err(format!(
                "invalid topology '{}': use two-tree, mini-circle, or tree",
                s
            )),
        }
    }
}

impl clap::ValueEnum for PresetKind {
    fn value_variants<'a>() -> &'a [Self] {
        &[PresetKind::TwoTree, PresetKind::MiniCircle, PresetKind::Tree]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            PresetKind::TwoTree => Some(clap::builder::PossibleValue::new("two-tree")),
            PresetKind::MiniCircle => Some(clap::builder::PossibleValue::new("mini-circle")),
            PresetKind::Tree => Some(clap::builder::PossibleValue::new("tree")),
        }
    }
}

fn host_ip(n: u8) -> Option<Ipv4Cidr> {
    Some(Ipv4Cidr::DEFAULT_SUBNET.with_addr(Ipv4Addr::new(10, 0, 0, n)))
}

/// Depth-3 binary tree: `s1` at the root, `s2`/`s3` below it, and so on
/// down to the eight leaf switches `s8`..`s15`.
///
/// Hosts `h2`..`h15` hang off the leaves with static addresses
/// `10.0.0.N/8`. `h5` and `h12` are absent: their places under `s10` and
/// `s13` go to physical machines plugged in through attachment points,
/// alongside the outside machines under `s8` and `s15`.
pub fn two_tree() -> Result<Topology, TopologyError> {
    let mut topo = Topology::new("two-tree");

    for i in 1..=15 {
        topo.add_switch(&format!("s{i}"))?;
    }
    let hosts: [(u8, u8); 12] = [
        (8, 2),
        (9, 3),
        (9, 4),
        (10, 6),
        (11, 7),
        (11, 8),
        (12, 9),
        (12, 10),
        (13, 11),
        (14, 13),
        (14, 14),
        (15, 15),
    ];
    for &(_, h) in &hosts {
        topo.add_host(&format!("h{h}"), host_ip(h))?;
    }

    for parent in 1..=7 {
        topo.add_link(&format!("s{parent}"), &format!("s{}", parent * 2))?;
        topo.add_link(&format!("s{parent}"), &format!("s{}", parent * 2 + 1))?;
    }
    for &(s, h) in &hosts {
        topo.add_link(&format!("s{s}"), &format!("h{h}"))?;
    }

    topo.add_attachment_point("s8", "eth1")?;
    topo.add_attachment_point("s15", "eth2")?;
    topo.add_attachment_point("s10", "eth3")?;
    topo.add_attachment_point("s13", "eth4")?;

    Ok(topo)
}

/// Ring-of-stars: hub `s1` feeds the spoke ring `s2`..`s5`; each spoke
/// feeds two leaf switches of the leaf ring `s6`..`s13`; each leaf carries
/// two hosts, `h1`..`h16`.
pub fn mini_circle() -> Result<Topology, TopologyError> {
    let mut topo = Topology::new("mini-circle");

    for i in 1..=13 {
        topo.add_switch(&format!("s{i}"))?;
    }
    for i in 1..=16 {
        topo.add_host(&format!("h{i}"), None)?;
    }

    let switch_links: [(u8, u8); 24] = [
        (1, 2),
        (1, 3),
        (1, 4),
        (1, 5),
        (2, 6),
        (2, 7),
        (2, 3),
        (3, 8),
        (3, 9),
        (3, 4),
        (4, 10),
        (4, 11),
        (4, 5),
        (5, 12),
        (5, 13),
        (5, 2),
        (6, 7),
        (7, 8),
        (8, 9),
        (9, 10),
        (10, 11),
        (11, 12),
        (12, 13),
        (13, 6),
    ];
    for (a, b) in switch_links {
        topo.add_link(&format!("s{a}"), &format!("s{b}"))?;
    }
    for leaf in 6..=13u8 {
        let first = (leaf - 6) * 2 + 1;
        topo.add_link(&format!("s{leaf}"), &format!("h{first}"))?;
        topo.add_link(&format!("s{leaf}"), &format!("h{}", first + 1))?;
    }

    Ok(topo)
}

/// Tree of switches `depth` levels deep with `fanout` children each; the
/// bottom level holds hosts. Nodes are numbered depth-first, switches and
/// hosts separately, so `tree(1, 4)` is `s1` with `h1`..`h4`.
pub fn tree(depth: u32, fanout: u32) -> Result<Topology, TopologyError> {
    let mut topo = Topology::new(&format!("tree-{depth}x{fanout}"));
    let mut counters = (1u32, 1u32);
    add_subtree(&mut topo, depth, fanout, &mut counters)?;
    Ok(topo)
}

fn add_subtree(
    topo: &mut Topology,
    depth: u32,
    fanout: u32,
    counters: &mut (u32, u32),
) -> Result<String, TopologyError> {
    if depth == 0 {
        let name = format!("h{}", counters.1);
        counters.1 += 1;
        topo.add_host(&name, None)?;
        return Ok(name);
    }
    let name = format!("s{}", counters.0);
    counters.0 += 1;
    topo.add_switch(&name)?;
    for _ in 0..fanout {
        let child = add_subtree(topo, depth - 1, fanout, counters)?;
        topo.add_link(&name, &child)?;
    }
    Ok(name)
}
