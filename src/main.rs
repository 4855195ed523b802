use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use network_sim::{SharedRunner, SystemRunner};
use sdn_bootstrap::bootstrap::bootstrap_until_signal;
use sdn_bootstrap::config::{BootstrapConfig, Cli};
use sdn_bootstrap::session::{self, SessionEnd, Signals};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for the binary (non-Windows only)
#[cfg(not(windows))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Cli::parse();
    if args.print_version {
        let version = env!("CARGO_PKG_VERSION");
        let git_hash = env!("GIT_HASH");
        let git_branch = env!("GIT_BRANCH");
        let git_dirty = env!("GIT_DIRTY");

        println!(
            "{} ({}@{}{}) [{}]",
            version,
            git_branch,
            git_hash,
            git_dirty,
            env!("CARGO_PKG_NAME")
        );
        return Ok(());
    }

    // SAFETY: geteuid has no preconditions and cannot fail
    let euid = unsafe { libc::geteuid() };
    if euid != 0 && !args.sudo {
        bail!("must run as root (or pass --sudo to run system commands through sudo)");
    }

    let config = BootstrapConfig::from_cli(&args);
    let system = SystemRunner::new(args.sudo);
    let children = system.children();
    let runner: SharedRunner = Arc::new(system);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build runtime")?;
    let (emulation, outcome) = rt.block_on(async {
        // Installed before anything is created
        let mut signals = Signals::install()?;
        let emulation = bootstrap_until_signal(config, runner, &children, &mut signals)
            .await
            .context("bootstrap failed")?;
        let emulation = Arc::new(Mutex::new(emulation));
        let outcome =
            session::run_until_signal(emulation.clone(), &children, &mut signals).await;
        anyhow::Ok((emulation, outcome))
    })?;
    // The session thread may still be blocked on stdin; leave it behind
    rt.shutdown_timeout(Duration::from_millis(100));

    let teardown = emulation
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .teardown();
    if let Err(e) = &teardown {
        error!("teardown failed: {e:#}");
    }

    if let SessionEnd::Signal(sig) = outcome? {
        info!(signal = sig, "stopped by signal");
    }
    teardown.context("teardown failed")
}
