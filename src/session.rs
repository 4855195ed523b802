//! Interactive command shell scoped to a running emulation.
//!
//! Commands:
//! - `help` - list commands
//! - `nodes` - list nodes
//! - `net` - list each node's links
//! - `links` - list links
//! - `dump` - nodes with interfaces and addresses
//! - `intfs` - interfaces per node
//! - `controller` - the registered controller
//! - `pingall` - ping between every pair of hosts
//! - `sh CMD...` - run a command in the root namespace
//! - `NODE CMD...` - run a command on a node; host names become addresses
//! - `exit`, `quit` or end of input - leave the session

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use network_sim::{ChildTracker, Runner};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{debug, info, warn};

use crate::bootstrap::Emulation;
use crate::network::Network;
use crate::topology::NodeKind;

pub const PROMPT: &str = "sdn> ";

const HELP: &str = "\
Documented commands:
  help        show this message
  nodes       list nodes
  net         list each node's links
  links       list links
  dump        show nodes with interfaces and addresses
  intfs       list interfaces per node
  controller  show the registered controller
  pingall     ping between every pair of hosts
  sh CMD      run CMD in the root namespace
  NODE CMD    run CMD on NODE (host names in CMD are replaced by addresses)
  exit, quit  leave the session and tear the network down
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Exit,
    /// Run this command line attached to the terminal. The network is not
    /// needed while it runs.
    Foreground(Vec<String>),
}

/// How the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Exited,
    Signal(&'static str),
}

/// Execute one command line against `net`, writing its output to `out`.
///
/// Commands meant for the terminal (`sh` and node commands) are returned
/// as [`Outcome::Foreground`] instead of being run.
pub fn execute(net: &Network, line: &str, out: &mut dyn Write) -> Result<Outcome> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((&cmd, args)) = parts.split_first() else {
        return Ok(Outcome::Continue);
    };

    match cmd {
        "exit" | "quit" => return Ok(Outcome::Exit),
        "help" | "?" => write!(out, "{HELP}")?,
        "nodes" => nodes(net, out)?,
        "net" => adjacency(net, out)?,
        "links" => links(net, out)?,
        "dump" => dump(net, out)?,
        "intfs" => intfs(net, out)?,
        "controller" => controller(net, out)?,
        "pingall" => pingall(net, out)?,
        "sh" => {
            if args.is_empty() {
                writeln!(out, "usage: sh CMD...")?;
            } else {
                let script = args.join(" ");
                return Ok(Outcome::Foreground(vec!["sh".into(), "-c".into(), script]));
            }
        }
        node if net.topology().contains(node) => {
            if args.is_empty() {
                writeln!(out, "usage: {node} CMD...")?;
            } else {
                let argv = substitute_addresses(net, args);
                let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
                return Ok(Outcome::Foreground(net.command_line(node, &argv)?));
            }
        }
        _ => {
            writeln!(out, "*** Unknown command: {line}")?;
            writeln!(out, "type 'help' for a list of commands")?;
        }
    }
    Ok(Outcome::Continue)
}

/// Replace host and gateway names in `args` with their addresses.
pub fn substitute_addresses(net: &Network, args: &[&str]) -> Vec<String> {
    let topo = net.topology();
    args.iter()
        .map(|arg| {
            topo.node(arg)
                .filter(|n| n.kind != NodeKind::Switch)
                .and_then(|n| {
                    topo.endpoints(&n.name)
                        .first()
                        .and_then(|e| topo.endpoint_ip(e))
                        .or(n.ip)
                })
                .map(|ip| ip.addr().to_string())
                .unwrap_or_else(|| arg.to_string())
        })
        .collect()
}

fn nodes(net: &Network, out: &mut dyn Write) -> Result<()> {
    let topo = net.topology();
    let mut names: Vec<&str> = topo
        .controller()
        .map(|c| c.name.as_str())
        .into_iter()
        .collect();
    names.extend(topo.nodes().iter().map(|n| n.name.as_str()));
    writeln!(out, "available nodes are:")?;
    writeln!(out, "{}", names.join(" "))?;
    Ok(())
}

fn adjacency(net: &Network, out: &mut dyn Write) -> Result<()> {
    let topo = net.topology();
    for node in topo.nodes() {
        let mut entries: Vec<String> = topo
            .links()
            .iter()
            .filter_map(|l| Some((l.end_of(&node.name)?, l.peer_of(&node.name)?)))
            .map(|(own, peer)| format!("{}:{}", own.intf, peer.intf))
            .collect();
        entries.extend(
            topo.ports()
                .iter()
                .filter(|p| p.switch == node.name)
                .map(|p| format!("{}:", p.intf)),
        );
        writeln!(out, "{} {}", node.name, entries.join(" "))?;
    }
    if let Some(c) = topo.controller() {
        writeln!(out, "{}", c.name)?;
    }
    Ok(())
}

fn links(net: &Network, out: &mut dyn Write) -> Result<()> {
    let topo = net.topology();
    for link in topo.links() {
        writeln!(out, "{}<->{}", link.a.intf, link.b.intf)?;
    }
    for port in topo.ports() {
        writeln!(out, "{}<->{} (physical)", port.intf, port.switch)?;
    }
    Ok(())
}

fn dump(net: &Network, out: &mut dyn Write) -> Result<()> {
    let topo = net.topology();
    for node in topo.nodes() {
        let kind = match node.kind {
            NodeKind::Host => "Host",
            NodeKind::Switch => "OVSSwitch",
            NodeKind::Gateway => "Gateway",
        };
        let intfs: Vec<String> = topo
            .endpoints(&node.name)
            .into_iter()
            .map(|e| match topo.endpoint_ip(e) {
                Some(ip) => format!("{}:{}", e.intf, ip),
                None => format!("{}:None", e.intf),
            })
            .collect();
        writeln!(out, "<{kind} {}: {}>", node.name, intfs.join(","))?;
    }
    if let Some(c) = topo.controller() {
        writeln!(out, "<RemoteController {}: {}:{}>", c.name, c.ip, c.port)?;
    }
    Ok(())
}

fn intfs(net: &Network, out: &mut dyn Write) -> Result<()> {
    let topo = net.topology();
    for node in topo.nodes() {
        let mut names: Vec<&str> = topo
            .endpoints(&node.name)
            .into_iter()
            .map(|e| e.intf.as_str())
            .collect();
        names.extend(
            topo.ports()
                .iter()
                .filter(|p| p.switch == node.name)
                .map(|p| p.intf.as_str()),
        );
        writeln!(out, "{}: {}", node.name, names.join(","))?;
    }
    Ok(())
}

fn controller(net: &Network, out: &mut dyn Write) -> Result<()> {
    match net.topology().controller() {
        Some(c) => writeln!(
            out,
            "{} {} ({} switches)",
            c.name,
            c.target(),
            net.topology().switches().count()
        )?,
        None => writeln!(out, "no controller")?,
    }
    Ok(())
}

fn pingall(net: &Network, out: &mut dyn Write) -> Result<()> {
    let topo = net.topology();
    let hosts: Vec<(&str, Option<String>)> = topo
        .hosts()
        .map(|h| (h.name.as_str(), h.ip.map(|ip| ip.addr().to_string())))
        .collect();

    writeln!(out, "*** Ping: testing ping reachability")?;
    let mut sent = 0usize;
    let mut received = 0usize;
    for (src, _) in &hosts {
        write!(out, "{src} -> ")?;
        for (dst, ip) in &hosts {
            if src == dst {
                continue;
            }
            sent += 1;
            let reached = match ip {
                Some(ip) => net
                    .exec(src, &["ping", "-c1", "-W1", ip])
                    .is_ok_and(|o| o.status.success()),
                None => false,
            };
            if reached {
                received += 1;
                write!(out, "{dst} ")?;
            } else {
                write!(out, "X ")?;
            }
        }
        writeln!(out)?;
        out.flush()?;
    }
    let dropped = if sent == 0 {
        0
    } else {
        100 * (sent - received) / sent
    };
    writeln!(out, "*** Results: {dropped}% dropped ({received}/{sent} received)")?;
    Ok(())
}

/// Read commands from `input` until `exit`, `quit` or end of input.
///
/// The emulation is locked only while a command inspects it; foreground
/// commands run with the lock released. Command errors are reported and
/// the session continues.
pub fn run<R: BufRead, W: Write>(
    emulation: &Mutex<Emulation>,
    input: R,
    mut out: W,
) -> Result<()> {
    let mut lines = input.lines();
    loop {
        write!(out, "{PROMPT}")?;
        out.flush()?;
        let Some(line) = lines.next() else {
            writeln!(out)?;
            return Ok(());
        };
        let line = line.context("read command")?;

        let guard = emulation.lock().unwrap_or_else(PoisonError::into_inner);
        let result = execute(guard.network(), line.trim(), &mut out);
        let runner = guard.network().runner().clone();
        drop(guard);

        let result = match result {
            Ok(Outcome::Exit) => return Ok(()),
            Ok(Outcome::Continue) => Ok(()),
            Ok(Outcome::Foreground(argv)) => foreground(&*runner, &argv),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            writeln!(out, "*** Error: {e:#}")?;
        }
    }
}

fn foreground(runner: &dyn Runner, argv: &[String]) -> Result<()> {
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    let status = runner
        .status(&argv)
        .with_context(|| format!("run '{}'", argv.join(" ")))?;
    debug!(cmd = %argv.join(" "), %status, "command finished");
    Ok(())
}

/// The termination signals the process handles itself.
pub struct Signals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl Signals {
    /// Install handlers for SIGINT, SIGTERM and SIGHUP. Must be called
    /// inside a tokio runtime.
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("install SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("install SIGTERM handler")?,
            hangup: signal(SignalKind::hangup()).context("install SIGHUP handler")?,
        })
    }

    /// Wait for the next signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.hangup.recv() => "SIGHUP",
        }
    }
}

/// Decide what `sig` does to a running session.
///
/// SIGINT while a foreground command runs only interrupts that command,
/// which shares the terminal and receives the signal itself. Anything else
/// ends the session, terminating whatever command is still running.
pub fn signal_ends_session(sig: &'static str, children: &ChildTracker) -> Option<SessionEnd> {
    if sig == "SIGINT" && children.is_attached() {
        return None;
    }
    children.terminate();
    Some(SessionEnd::Signal(sig))
}

/// Run the session on stdin until it ends or a termination signal arrives.
///
/// The session runs on a blocking thread; when a signal ends it, the
/// thread is abandoned where it stands and the caller tears down.
pub async fn run_until_signal(
    emulation: Arc<Mutex<Emulation>>,
    children: &ChildTracker,
    signals: &mut Signals,
) -> Result<SessionEnd> {
    let mut session = tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        run(&emulation, stdin.lock(), std::io::stdout())
    });

    let end = loop {
        tokio::select! {
            res = &mut session => {
                res.context("session thread failed")??;
                break SessionEnd::Exited;
            }
            sig = signals.recv() => match signal_ends_session(sig, children) {
                Some(end) => break end,
                None => println!("\nInterrupt"),
            },
        }
    };

    match end {
        SessionEnd::Exited => info!("session ended"),
        SessionEnd::Signal(sig) => warn!(signal = sig, "session interrupted"),
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use network_sim::RecordingRunner;

    use super::*;
    use crate::topology::{Controller, Topology};

    fn network(rec: &Arc<RecordingRunner>) -> Network {
        let mut topo = Topology::new("star");
        topo.add_switch("s1").unwrap();
        topo.add_host("h1", None).unwrap();
        topo.add_host("h2", None).unwrap();
        topo.add_link("s1", "h1").unwrap();
        topo.add_link("s1", "h2").unwrap();
        topo.add_port("eth1", "s1").unwrap();
        topo.set_controller(Controller::new(
            "c0",
            Ipv4Addr::new(192, 168, 176, 132),
            6653,
        ));
        let mut net = Network::build(topo, rec.clone()).unwrap();
        net.start().unwrap();
        rec.clear();
        net
    }

    fn output(net: &Network, line: &str) -> String {
        let mut out = Vec::new();
        assert_eq!(execute(net, line, &mut out).unwrap(), Outcome::Continue);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_listing_commands() {
        let rec = Arc::new(RecordingRunner::new());
        let net = network(&rec);

        assert_eq!(output(&net, "nodes"), "available nodes are:\nc0 s1 h1 h2\n");
        assert_eq!(
            output(&net, "net"),
            "s1 s1-eth1:h1-eth0 s1-eth2:h2-eth0 eth1:\nh1 h1-eth0:s1-eth1\nh2 h2-eth0:s1-eth2\nc0\n"
        );
        assert_eq!(
            output(&net, "links"),
            "s1-eth1<->h1-eth0\ns1-eth2<->h2-eth0\neth1<->s1 (physical)\n"
        );
        assert_eq!(output(&net, "intfs"), "s1: s1-eth1,s1-eth2,eth1\nh1: h1-eth0\nh2: h2-eth0\n");
        assert!(output(&net, "dump").contains("<Host h1: h1-eth0:10.0.0.1/8>"));
        assert!(output(&net, "dump").contains("<RemoteController c0: 192.168.176.132:6653>"));
        assert!(output(&net, "controller").starts_with("c0 tcp:192.168.176.132:6653"));
        assert!(output(&net, "help").contains("pingall"));
        assert!(rec.commands().is_empty());
    }

    fn foreground(net: &Network, line: &str) -> Vec<String> {
        let mut out = Vec::new();
        match execute(net, line, &mut out).unwrap() {
            Outcome::Foreground(argv) => argv,
            other => panic!("expected a foreground command, got {other:?}"),
        }
    }

    #[test]
    fn test_node_command_substitutes_addresses() {
        let rec = Arc::new(RecordingRunner::new());
        let net = network(&rec);

        assert_eq!(
            foreground(&net, "h1 ping -c1 h2").join(" "),
            "ip netns exec h1 ping -c1 10.0.0.2"
        );
        assert_eq!(
            foreground(&net, "s1 ovs-ofctl dump-flows s1").join(" "),
            "ovs-ofctl dump-flows s1"
        );
        assert!(output(&net, "h1").starts_with("usage: h1 CMD"));
        assert!(rec.commands().is_empty());
    }

    #[test]
    fn test_sh_runs_in_root_namespace() {
        let rec = Arc::new(RecordingRunner::new());
        let net = network(&rec);

        assert_eq!(
            foreground(&net, "sh ovs-vsctl show"),
            vec!["sh", "-c", "ovs-vsctl show"]
        );
    }

    #[test]
    fn test_interrupt_spares_foreground_command() {
        let children = ChildTracker::new();
        assert_eq!(
            signal_ends_session("SIGINT", &children),
            Some(SessionEnd::Signal("SIGINT"))
        );

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        {
            let _tracking = children.track(child.id(), true);
            assert_eq!(signal_ends_session("SIGINT", &children), None);
            assert!(child.try_wait().unwrap().is_none());
        }
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_terminate_ends_foreground_command() {
        use std::os::unix::process::ExitStatusExt;

        let children = ChildTracker::new();
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let end = {
            let _tracking = children.track(child.id(), true);
            signal_ends_session("SIGTERM", &children)
        };

        assert_eq!(end, Some(SessionEnd::Signal("SIGTERM")));
        assert_eq!(child.wait().unwrap().signal(), Some(libc::SIGTERM));
    }

    #[test]
    fn test_pingall_summary() {
        let rec = Arc::new(RecordingRunner::new());
        rec.respond_err("ip netns exec h2 ping", 1, "");
        let net = network(&rec);

        let out = output(&net, "pingall");
        assert!(out.contains("h1 -> h2 \n"), "{out}");
        assert!(out.contains("h2 -> X \n"), "{out}");
        assert!(out.ends_with("*** Results: 50% dropped (1/2 received)\n"), "{out}");
    }

    #[test]
    fn test_unknown_and_exit() {
        let rec = Arc::new(RecordingRunner::new());
        let net = network(&rec);

        assert!(output(&net, "frobnicate").contains("Unknown command: frobnicate"));
        assert_eq!(output(&net, "   "), "");
        let mut out = Vec::new();
        assert_eq!(execute(&net, "exit", &mut out).unwrap(), Outcome::Exit);
        assert_eq!(execute(&net, "quit", &mut out).unwrap(), Outcome::Exit);
    }
}
