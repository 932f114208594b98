use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{task, time::timeout};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};
use tracing_error::TracedError;

use crate::{config::RelayConfig, listener::Listener, relay_set::RelaySet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Pairs that were live when shutdown began.
    pub live_at_shutdown: usize,
    /// Pairs still live after the grace period that had to be closed.
    pub forced: usize,
    /// Pairs relayed to completion over the whole run.
    pub completed: usize,
    /// Completed pairs that ended in an I/O failure.
    pub errored: usize,
}

/// Owns the listener and every connection it spawns.
pub struct Supervisor {
    listener: Listener,
    relays: Arc<RelaySet>,
    tracker: TaskTracker,
    grace_period: Duration,
}

impl Supervisor {
    /// Bind the listening socket. Failure here is fatal for the process.
    pub fn bind(config: &RelayConfig) -> Result<Self, TracedError<io::Error>> {
        let relays = RelaySet::new(config.max_connections);
        let tracker = TaskTracker::new();
        let listener = Listener::bind(config, relays.clone(), tracker.clone())?;

        Ok(Supervisor {
            listener,
            relays,
            tracker,
            grace_period: config.shutdown_grace_period(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relays(&self) -> Arc<RelaySet> {
        self.relays.clone()
    }

    /// Relay until `shutdown` resolves, then drain.
    ///
    /// Live pairs get the grace period to finish on their own, whatever is
    /// left after that is force closed.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> ShutdownReport {
        let stop = CancellationToken::new();
        let accept_loop = task::spawn(self.listener.serve(stop.clone()));

        shutdown.await;

        stop.cancel();
        if let Err(error) = accept_loop.await {
            error!(%error, "accept loop failed");
        }

        // No more connection tasks can be spawned past this point
        self.tracker.close();

        let live_at_shutdown = self.relays.len();
        info!(
            live = live_at_shutdown,
            grace_period = ?self.grace_period,
            "draining connections"
        );

        let forced = match timeout(self.grace_period, self.tracker.wait()).await {
            Ok(()) => 0,
            Err(_) => {
                let forced = self.relays.close_all();
                warn!(forced, "grace period expired, force closing connections");
                self.tracker.wait().await;
                forced
            }
        };

        let completed = self.relays.completed();
        let errored = self.relays.errored();
        info!(live_at_shutdown, forced, completed, errored, "relay shut down");

        ShutdownReport {
            live_at_shutdown,
            forced,
            completed,
            errored,
        }
    }
}
