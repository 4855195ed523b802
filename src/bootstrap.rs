//! The full bring-up sequence and its teardown guard.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use network_sim::{ChildTracker, SharedRunner};
use tracing::{debug, error, info, warn};

use crate::attach::attach_interface;
use crate::config::BootstrapConfig;
use crate::gateway::Gateway;
use crate::network::Network;
use crate::session::Signals;

/// A running emulation. Tears itself down when dropped.
pub struct Emulation {
    network: Network,
    gateway: Option<Gateway>,
    torn_down: bool,
}

impl Emulation {
    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn gateway(&self) -> Option<&Gateway> {
        self.gateway.as_ref()
    }

    /// Disconnect from the internet (when NAT state was touched), then
    /// remove the network. Runs once; later calls do nothing.
    pub fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        info!("tearing down emulation");

        let mut result = Ok(());
        if let Some(gateway) = &mut self.gateway
            && gateway.nat_touched()
        {
            result = gateway.disconnect(&**self.network.runner());
        }
        self.network.stop();
        result
    }
}

impl Drop for Emulation {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            error!("teardown failed: {e:#}");
        }
    }
}

/// Load the topology, attach physical interfaces, build the network and
/// bring it up, connected to the internet when a gateway is configured.
///
/// Every precondition is checked before anything is created. On failure
/// everything created so far is removed again.
pub fn bootstrap(config: &BootstrapConfig, runner: SharedRunner) -> Result<Emulation> {
    bootstrap_cancellable(config, runner, &AtomicBool::new(false))
}

/// [`bootstrap`], giving up at the next stage boundary once `cancel` is
/// set. Whatever was created before that is removed again.
pub fn bootstrap_cancellable(
    config: &BootstrapConfig,
    runner: SharedRunner,
    cancel: &AtomicBool,
) -> Result<Emulation> {
    let checkpoint = |stage: &str| -> Result<()> {
        if cancel.load(Ordering::SeqCst) {
            bail!("bootstrap cancelled before {stage}");
        }
        Ok(())
    };

    let mut topo = config.topology()?;

    for (intf, switch) in config.attachments_for(&topo)? {
        checkpoint("attaching interfaces")?;
        attach_interface(&mut topo, &*runner, &intf, &switch)?;
    }

    let reserved: Vec<Ipv4Addr> = config.gateway.iter().map(|g| g.ip.addr()).collect();
    if let Some(gateway) = &config.gateway {
        topo.check_address_free(gateway.ip.addr(), &gateway.name)?;
    }
    topo.assign_addresses(&reserved)?;

    checkpoint("building the network")?;
    let network = Network::build(topo, runner).context("build network")?;
    let mut emulation = Emulation {
        network,
        gateway: config.gateway.clone().map(Gateway::new),
        torn_down: false,
    };

    checkpoint("starting the network")?;
    match &mut emulation.gateway {
        Some(gateway) => gateway
            .connect(&mut emulation.network)
            .context("connect to the internet")?,
        None => emulation.network.start().context("start network")?,
    }
    checkpoint("handing over to the session")?;

    info!(
        topology = emulation.network.topology().name(),
        online = emulation.gateway.is_some(),
        "emulation ready"
    );
    Ok(emulation)
}

/// Run [`bootstrap_cancellable`] on a blocking thread, watching `signals`.
///
/// A signal cancels the bootstrap and terminates the command it is waiting
/// on. Everything built so far is torn down before the error is returned.
pub async fn bootstrap_until_signal(
    config: BootstrapConfig,
    runner: SharedRunner,
    children: &ChildTracker,
    signals: &mut Signals,
) -> Result<Emulation> {
    let cancel = Arc::new(AtomicBool::new(false));
    let mut task = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || bootstrap_cancellable(&config, runner, &cancel))
    };

    let sig = tokio::select! {
        res = &mut task => return res.context("bootstrap thread failed")?,
        sig = signals.recv() => sig,
    };
    warn!(signal = sig, "interrupted during bootstrap");
    cancel.store(true, Ordering::SeqCst);
    children.terminate();

    match task.await.context("bootstrap thread failed")? {
        Ok(mut emulation) => {
            if let Err(e) = emulation.teardown() {
                error!("teardown failed: {e:#}");
            }
        }
        Err(e) => debug!("bootstrap abandoned: {e:#}"),
    }
    bail!("interrupted by {sig} during bootstrap")
}
