//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

use network_sim::{SharedRunner, check_ovs, check_privileges, run_checked};
use sdn_bootstrap::Network;
use sdn_bootstrap::topology::{Controller, Topology};

static SEQ: AtomicU32 = AtomicU32::new(0);

/// Returns `true` if tests should be skipped (prints the reason to
/// stderr). Use at the top of every test.
pub fn skip_without_deps() -> bool {
    if !check_privileges() {
        eprintln!("Skipping: requires root and iproute2");
        return true;
    }
    if !check_ovs() {
        eprintln!("Skipping: Open vSwitch not available");
        return true;
    }
    false
}

/// Short tag unique to this test run, so node and interface names stay
/// within the 15 character limit and do not collide between tests.
pub fn tag() -> String {
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{:x}{seq}", std::process::id() % 0xfff)
}

/// One switch with two hosts. Returns the topology and the node names
/// `(switch, host_a, host_b)`.
pub fn star(tag: &str) -> (Topology, String, String, String) {
    let switch = format!("s{tag}");
    let a = format!("a{tag}");
    let b = format!("b{tag}");

    let mut topo = Topology::new(&format!("star{tag}"));
    topo.add_switch(&switch).expect("switch");
    topo.add_host(&a, None).expect("host a");
    topo.add_host(&b, None).expect("host b");
    topo.add_link(&switch, &a).expect("link a");
    topo.add_link(&switch, &b).expect("link b");
    // Nothing listens here; flows are installed by hand instead
    topo.set_controller(Controller::new("c0", Ipv4Addr::LOCALHOST, 6653));
    (topo, switch, a, b)
}

/// Let `switch` forward like a learning switch without a controller.
pub fn normal_flows(runner: &SharedRunner, switch: &str) {
    run_checked(&**runner, &["ovs-ofctl", "add-flow", switch, "action=normal"])
        .expect("install normal flow");
}

/// Run `argv` on `node`, returning whether it exited successfully.
pub fn succeeds(net: &Network, node: &str, argv: &[&str]) -> bool {
    net.exec(node, argv)
        .map(|o| o.status.success())
        .unwrap_or(false)
}
