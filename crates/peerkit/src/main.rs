//! peerkit-sim: runs several peers over the in-memory transport.
//!
//! Every simulated peer gets its own [`NetworkContext`].  Once the chosen
//! candidate sees all other peers it claims the host role, and the run lasts
//! until the configured duration passes or Ctrl+C is pressed.
//!
//! # Usage
//!
//! ```text
//! peerkit-sim [OPTIONS]
//!
//! Options:
//!   --peers         <N>     Number of simulated peers [default: 3]
//!   --host-index    <I>     Peer that claims the host role [default: 0]
//!   --duration-secs <SECS>  How long to run [default: 10]
//!   --config        <PATH>  Config file (env: PEERKIT_CONFIG)
//!   --log-level     <LEVEL> Overrides [session].log_level
//! ```
//!
//! `RUST_LOG` takes precedence over both log level sources.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use peerkit::infrastructure::storage::config::{
    load_config, load_config_from, AppConfig, IdentityEntry,
};
use peerkit::infrastructure::transport::memory::MemoryHub;
use peerkit::{HostObserver, NetworkContext, PeerObserver};
use peerkit_core::PeerIdentity;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// In-memory simulation of a small peer network with host election.
#[derive(Debug, Parser)]
#[command(name = "peerkit-sim", version)]
struct Cli {
    /// Number of simulated peers.
    #[arg(long, default_value_t = 3)]
    peers: usize,

    /// Index of the peer that claims the host role once connected.
    #[arg(long, default_value_t = 0)]
    host_index: usize,

    /// Run time in seconds after the network settles.
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Config file to read session settings from.  Defaults to the platform
    /// config file.
    #[arg(long, env = "PEERKIT_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<AppConfig> {
        match &self.config {
            Some(path) => load_config_from(path)
                .with_context(|| format!("failed to load config from {}", path.display())),
            // Logging is not up yet, so the fallback is reported on stderr.
            None => load_config().or_else(|e| {
                eprintln!("peerkit-sim: using default config ({e})");
                Ok::<_, anyhow::Error>(AppConfig::default())
            }),
        }
    }
}

/// Logs every peer and host change seen by one simulated peer.
struct LoggingObserver {
    owner: String,
}

impl PeerObserver for LoggingObserver {
    fn peer_updated(&self, peer: &PeerIdentity) {
        info!(at = %self.owner, peer = %peer, "peer updated");
    }
}

impl HostObserver for LoggingObserver {
    fn host_updated(&self, host: Option<&PeerIdentity>) {
        match host {
            Some(host) => info!(at = %self.owner, host = %host, "host changed"),
            None => info!(at = %self.owner, "no host"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    anyhow::ensure!(cli.peers >= 2, "--peers must be at least 2");
    anyhow::ensure!(
        cli.host_index < cli.peers,
        "--host-index {} is out of range for {} peers",
        cli.host_index,
        cli.peers
    );

    let config = cli.load_config()?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.session.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)),
        )
        .init();

    info!(
        peers = cli.peers,
        service = %config.session.service_name,
        "peerkit-sim starting"
    );

    let hub = MemoryHub::new();
    let mut contexts = Vec::with_capacity(cli.peers);
    let mut observers = Vec::with_capacity(cli.peers);
    for i in 0..cli.peers {
        let mut peer_config = config.clone();
        peer_config.identity = Some(IdentityEntry::from_identity(&PeerIdentity::local(format!(
            "peer-{i}"
        ))));
        let context = NetworkContext::start(peer_config, None, Arc::new(hub.clone()))
            .with_context(|| format!("failed to start peer-{i}"))?;

        let observer = Arc::new(LoggingObserver {
            owner: format!("peer-{i}"),
        });
        let as_peer: Arc<dyn PeerObserver> = observer.clone();
        let as_host: Arc<dyn HostObserver> = observer.clone();
        context.add_peer_observer(Arc::downgrade(&as_peer));
        context.add_host_observer(Arc::downgrade(&as_host));
        observers.push(observer);
        contexts.push(context);
    }

    let candidate = Arc::clone(&contexts[cli.host_index]);
    let everyone = cli.peers - 1;
    if wait_until(|| candidate.connected_peers().len() == everyone).await {
        candidate.make_me_host();
    } else {
        warn!("peers did not all connect in time; skipping host claim");
    }

    let host_id = candidate.my_identity().map(|me| me.id());
    let converged = wait_until(|| {
        contexts
            .iter()
            .all(|c| c.host().map(|h| h.id()) == host_id)
    })
    .await;
    if converged {
        info!(host = ?host_id, "all peers agree on the host");
    } else {
        warn!("host election did not converge");
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.duration_secs)) => {
            info!("simulation finished");
        }
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("received Ctrl+C; shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for Ctrl+C"),
        },
    }

    for context in &contexts {
        context.shutdown();
    }
    // Contexts hold observers weakly; keep them alive until shutdown is logged.
    drop(observers);
    Ok(())
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + CONVERGENCE_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    done()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        // Arrange / Act
        let cli = Cli::parse_from(["peerkit-sim"]);

        // Assert
        assert_eq!(cli.peers, 3);
        assert_eq!(cli.host_index, 0);
        assert_eq!(cli.duration_secs, 10);
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "peerkit-sim",
            "--peers",
            "5",
            "--host-index",
            "4",
            "--log-level",
            "debug",
        ]);

        assert_eq!(cli.peers, 5);
        assert_eq!(cli.host_index, 4);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
