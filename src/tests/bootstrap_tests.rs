#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::process::{ExitStatus, Output};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::Result;
    use network_sim::{RecordingRunner, Runner};
    use tempfile::{NamedTempFile, TempDir};

    use crate::attach::AttachError;
    use crate::bootstrap::{bootstrap, bootstrap_cancellable};
    use crate::config::{BootstrapConfig, TopologySource};
    use crate::gateway::{GatewayConfig, GatewayState};
    use crate::topology::TopologyError;
    use crate::topology::presets::PresetKind;

    const LINKS: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP
3: eth1: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN
4: eth2: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN
5: eth3: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN
6: eth4: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN
";

    fn star_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "star",
                "controller": {{ "name": "c0", "ip": "192.168.176.132" }},
                "switches": ["s1"],
                "hosts": [{{ "name": "h1" }}, {{ "name": "h2" }}],
                "links": [["s1", "h1"], ["s1", "h2"]]
            }}"#
        )
        .unwrap();
        file
    }

    fn online(dir: &TempDir, source: TopologySource) -> BootstrapConfig {
        BootstrapConfig {
            source,
            gateway: Some(GatewayConfig {
                interfaces_file: dir.path().join("interfaces"),
                ..GatewayConfig::default()
            }),
            ..BootstrapConfig::default()
        }
    }

    fn two_tree() -> TopologySource {
        TopologySource::Preset {
            kind: PresetKind::TwoTree,
            depth: 2,
            fanout: 2,
        }
    }

    fn position(cmds: &[String], needle: &str) -> usize {
        cmds.iter()
            .position(|c| c == needle)
            .unwrap_or_else(|| panic!("missing command: {needle}"))
    }

    #[test]
    fn test_star_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let file = star_file();
        let rec = Arc::new(RecordingRunner::new());
        let config = online(&dir, TopologySource::File(file.path().to_path_buf()));

        let emulation = bootstrap(&config, rec.clone()).unwrap();
        let topo = emulation.network().topology();

        assert_eq!(topo.neighbors("s1"), vec!["h1", "h2", "root"]);
        let cmds = rec.commands();
        let controller = position(&cmds, "ovs-vsctl set-controller s1 tcp:192.168.176.132:6653");
        let nat = position(&cmds, "iptables -t nat -A POSTROUTING -o eth0 -j MASQUERADE");
        assert!(controller < nat);
        assert_eq!(
            emulation.gateway().map(|g| g.state()),
            Some(GatewayState::Connected)
        );
    }

    #[test]
    fn test_forwarding_enabled_then_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let file = star_file();
        let rec = Arc::new(RecordingRunner::new());
        let config = online(&dir, TopologySource::File(file.path().to_path_buf()));

        let mut emulation = bootstrap(&config, rec.clone()).unwrap();
        let policies = rec.commands_matching("iptables -P FORWARD");
        assert_eq!(policies, vec!["iptables -P FORWARD DROP"]);
        assert_eq!(
            rec.commands_matching("sysctl").last().map(String::as_str),
            Some("sysctl net.ipv4.ip_forward=1")
        );

        rec.clear();
        emulation.teardown().unwrap();
        let cmds = rec.commands();
        let off = position(&cmds, "sysctl net.ipv4.ip_forward=0");
        let bridge = position(&cmds, "ovs-vsctl --if-exists del-br s1");
        let ns = position(&cmds, "ip netns del h1");
        assert!(off < bridge && bridge < ns);

        rec.clear();
        emulation.teardown().unwrap();
        drop(emulation);
        assert!(rec.commands().is_empty());
    }

    #[test]
    fn test_two_tree_routes_only_on_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Arc::new(RecordingRunner::new());
        rec.respond("ip -o link show", LINKS);

        let emulation = bootstrap(&online(&dir, two_tree()), rec.clone()).unwrap();

        let defaults: Vec<String> = rec
            .commands()
            .into_iter()
            .filter(|c| c.ends_with("ip route add default via 10.0.0.254"))
            .collect();
        assert_eq!(defaults.len(), 12);
        assert!(defaults.iter().all(|c| c.starts_with("ip netns exec h")));
        assert!(rec.commands_matching("ip route").is_empty());

        for (intf, switch) in [("eth1", "s8"), ("eth2", "s15"), ("eth3", "s10"), ("eth4", "s13")] {
            let port = format!("ovs-vsctl add-port {switch} {intf}");
            assert_eq!(rec.commands_matching(&port).len(), 1, "{port}");
        }
        assert_eq!(emulation.network().topology().ports().len(), 4);
        assert!(
            rec.commands()
                .contains(&"ip link add root-eth0 type veth peer name s1-eth3".to_string())
        );
    }

    #[test]
    fn test_absent_interface_aborts_before_any_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Arc::new(RecordingRunner::new());
        rec.respond("ip -o link show", "1: lo: <LOOPBACK,UP>\n2: eth1: <BROADCAST>\n");

        let err = bootstrap(&online(&dir, two_tree()), rec.clone())
            .err()
            .expect("eth2 is absent");

        assert!(matches!(
            err.downcast_ref::<AttachError>(),
            Some(AttachError::Absent(n)) if n == "eth2"
        ));
        assert!(
            rec.commands()
                .iter()
                .all(|c| c.starts_with("ip -o link show") || c.starts_with("ip -o -4 addr show"))
        );
    }

    #[test]
    fn test_configured_interface_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Arc::new(RecordingRunner::new());
        rec.respond("ip -o link show", LINKS);
        rec.respond(
            "ip -o -4 addr show dev eth3",
            "5: eth3    inet 192.168.5.7/24 scope global eth3",
        );

        let err = bootstrap(&online(&dir, two_tree()), rec.clone())
            .err()
            .expect("eth3 is configured");
        assert!(matches!(
            err.downcast_ref::<AttachError>(),
            Some(AttachError::Configured { .. })
        ));
        assert!(rec.commands_matching("ip netns add").is_empty());
    }

    #[test]
    fn test_host_holding_gateway_address_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "clash",
                "switches": ["s1"],
                "hosts": [{{ "name": "h1", "ip": "10.0.0.254/8" }}, {{ "name": "h2" }}],
                "links": [["s1", "h1"], ["s1", "h2"]]
            }}"#
        )
        .unwrap();
        let rec = Arc::new(RecordingRunner::new());
        let config = online(&dir, TopologySource::File(file.path().to_path_buf()));

        let err = bootstrap(&config, rec.clone()).err().expect("address clash");

        assert!(matches!(
            err.downcast_ref::<TopologyError>(),
            Some(TopologyError::DuplicateAddress { first, second, .. })
                if first == "h1" && second == "root"
        ));
        assert!(rec.commands().is_empty());
    }

    #[test]
    fn test_failed_nat_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let file = star_file();
        let rec = Arc::new(RecordingRunner::new());
        rec.respond_err("iptables -t nat -A", 1, "iptables: No chain/target/match by that name.");
        let config = online(&dir, TopologySource::File(file.path().to_path_buf()));

        let err = bootstrap(&config, rec.clone()).err().expect("NAT must fail");
        assert!(format!("{err:#}").contains("masquerade outbound traffic failed"));

        let cmds = rec.commands();
        let failed = position(&cmds, "iptables -t nat -A POSTROUTING -o eth0 -j MASQUERADE");
        let after = &cmds[failed + 1..];
        assert!(after.contains(&"sysctl net.ipv4.ip_forward=0".to_string()));
        assert!(after.contains(&"ovs-vsctl --if-exists del-br s1".to_string()));
        assert!(after.contains(&"ip netns del h2".to_string()));
        assert!(rec.commands_matching("ip netns exec h1 ip route").is_empty());
    }

    #[test]
    fn test_failed_start_leaves_firewall_alone() {
        let dir = tempfile::tempdir().unwrap();
        let file = star_file();
        let rec = Arc::new(RecordingRunner::new());
        rec.respond_err("ovs-vsctl set-controller", 1, "database connection failed");
        let config = online(&dir, TopologySource::File(file.path().to_path_buf()));

        assert!(bootstrap(&config, rec.clone()).is_err());
        assert!(rec.commands_matching("iptables").is_empty());
        assert!(rec.commands_matching("sysctl").is_empty());
        assert!(
            rec.commands()
                .contains(&"ovs-vsctl --if-exists del-br s1".to_string())
        );
    }

    /// Raises `cancel` as soon as a command starting with `trigger` runs.
    struct CancelOn {
        inner: Arc<RecordingRunner>,
        trigger: &'static str,
        cancel: Arc<AtomicBool>,
    }

    impl CancelOn {
        fn check(&self, argv: &[&str]) {
            if argv.join(" ").starts_with(self.trigger) {
                self.cancel.store(true, Ordering::SeqCst);
            }
        }
    }

    impl Runner for CancelOn {
        fn output(&self, argv: &[&str]) -> Result<Output> {
            self.check(argv);
            self.inner.output(argv)
        }

        fn status(&self, argv: &[&str]) -> Result<ExitStatus> {
            self.check(argv);
            self.inner.status(argv)
        }
    }

    #[test]
    fn test_cancel_during_build_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let file = star_file();
        let rec = Arc::new(RecordingRunner::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let runner = Arc::new(CancelOn {
            inner: rec.clone(),
            trigger: "ip link add",
            cancel: cancel.clone(),
        });
        let config = online(&dir, TopologySource::File(file.path().to_path_buf()));

        let err = bootstrap_cancellable(&config, runner, &cancel)
            .err()
            .expect("cancelled");

        assert!(err.to_string().contains("cancelled"), "{err}");
        let cmds = rec.commands();
        let built = position(&cmds, "ip link add s1-eth2 type veth peer name h2-eth0");
        let last = |needle: &str| cmds.iter().rposition(|c| c == needle).unwrap();
        assert!(built < last("ovs-vsctl --if-exists del-br s1"));
        assert!(built < last("ip netns del h1"));
        assert!(rec.commands_matching("ovs-vsctl set-controller").is_empty());
        assert!(rec.commands_matching("iptables").is_empty());
        assert!(rec.commands_matching("sysctl").is_empty());
    }

    #[test]
    fn test_cancel_before_start_creates_nothing() {
        let file = star_file();
        let rec = Arc::new(RecordingRunner::new());
        let config = BootstrapConfig {
            source: TopologySource::File(file.path().to_path_buf()),
            gateway: None,
            ..BootstrapConfig::default()
        };

        assert!(bootstrap_cancellable(&config, rec.clone(), &AtomicBool::new(true)).is_err());
        assert!(rec.commands().is_empty());
    }

    #[test]
    fn test_offline_never_touches_firewall() {
        let file = star_file();
        let rec = Arc::new(RecordingRunner::new());
        let config = BootstrapConfig {
            source: TopologySource::File(file.path().to_path_buf()),
            gateway: None,
            ..BootstrapConfig::default()
        };

        let mut emulation = bootstrap(&config, rec.clone()).unwrap();
        emulation.teardown().unwrap();

        assert!(emulation.gateway().is_none());
        assert!(rec.commands_matching("iptables").is_empty());
        assert!(rec.commands_matching("sysctl").is_empty());
        assert!(!emulation.network().topology().contains("root"));
    }
}
