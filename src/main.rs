use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use eyre::WrapErr;
use tcprelay::{
    config::{self, Config, RelayConfig},
    signals::shutdown_signal,
    supervisor::Supervisor,
    trace::init_tracing_subscriber,
    Endpoint,
};
use tracing::{error, info};

include!(concat!(env!("OUT_DIR"), "/features.rs"));

/// Relay every TCP connection accepted locally to a fixed upstream.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file, flags below override its values
    #[arg(short, long, env = "TCPRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Local address to accept clients on
    #[arg(short, long, env = "TCPRELAY_LISTEN")]
    listen: Option<SocketAddr>,

    /// Upstream `host:port` every client is relayed to
    #[arg(short, long, env = "TCPRELAY_UPSTREAM")]
    upstream: Option<Endpoint>,

    /// Upstream connect timeout in milliseconds
    #[arg(long, env = "TCPRELAY_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,

    /// Shutdown grace period in milliseconds
    #[arg(long, env = "TCPRELAY_GRACE_PERIOD_MS")]
    grace_period_ms: Option<u64>,

    /// Maximum number of concurrently relayed connections
    #[arg(long, env = "TCPRELAY_MAX_CONNECTIONS")]
    max_connections: Option<usize>,
}

impl Args {
    async fn into_config(self) -> eyre::Result<Config> {
        let mut relay = match &self.config {
            Some(path) => {
                config::load(path)
                    .await
                    .wrap_err_with(|| format!("loading {}", path.display()))?
                    .relay
            }
            None => {
                let upstream = self.upstream.clone().ok_or_else(|| {
                    eyre::eyre!("an upstream is required, pass --upstream or --config")
                })?;
                RelayConfig::with_upstream(upstream)
            }
        };

        if let Some(listen) = self.listen {
            relay.listen_address = listen;
        }
        if let Some(upstream) = self.upstream {
            relay.upstream = upstream;
        }
        if let Some(connect_timeout_ms) = self.connect_timeout_ms {
            relay.connect_timeout_ms = connect_timeout_ms;
        }
        if let Some(grace_period_ms) = self.grace_period_ms {
            relay.shutdown_grace_period_ms = grace_period_ms;
        }
        if let Some(max_connections) = self.max_connections {
            relay.max_connections = Some(max_connections);
        }

        let config = Config { relay };
        config.validate()?;

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();

    init_tracing_subscriber()?;

    info!(features = ?ENABLED_FEATURES, "relay starting");

    let config = args.into_config().await?;

    let supervisor = Supervisor::bind(&config.relay).wrap_err_with(|| {
        format!("unable to bind to {}", config.relay.listen_address)
    })?;

    info!(
        listen_address = %config.relay.listen_address,
        upstream = %config.relay.upstream,
        "forwarding",
    );

    let report = supervisor
        .run(async {
            if let Err(error) = shutdown_signal().await {
                // Shut down right away if signals can not be observed
                error!(%error, "unable to listen for shutdown signals");
            }
        })
        .await;

    info!(?report, "exiting");

    Ok(())
}
