//! vigil, a lightweight monitoring agent.
//!
//! Loads a JSON configuration, assembles the collection pipeline and runs
//! until SIGINT/SIGTERM, then shuts the scheduler, worker pool and submit
//! pool down in that order.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vigil_core::{Agent, AgentConfig};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Lightweight monitoring agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the agent configuration file
    #[arg(short, long)]
    config: PathBuf,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    // Async-signal-safe: just flip the flag, the main loop does the rest.
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::load(&cli.config)
        .with_context(|| format!("loading config '{}'", cli.config.display()))?;

    let mut agent = Agent::from_config(&config).context("assembling agent")?;
    info!(
        agent = %agent.name(),
        jobs = agent.job_count(),
        workers = agent.worker_count(),
        "configuration loaded"
    );

    install_signal_handlers();
    agent.start();

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutdown signal received");
    agent.stop();
    info!("stopped, bye");
    Ok(())
}
