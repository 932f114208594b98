use std::time::{Duration, Instant};

use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    task::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use crate::forwarder::{Direction, ForwardReport, Forwarder, Termination};

type ForwarderTask = JoinHandle<(ForwardReport, OwnedReadHalf, OwnedWriteHalf)>;

/// How a [`ConnectionPair`] ended.
#[derive(Debug)]
pub struct PairOutcome {
    /// Report of the forwarder that stopped first and decided the close.
    pub first: Option<ForwardReport>,
    /// Report of the forwarder that was stopped as a consequence.
    pub second: Option<ForwardReport>,
    /// The pair was closed by the supervisor, not by a peer.
    pub forced: bool,
    pub duration: Duration,
}

impl PairOutcome {
    pub fn bytes(&self, direction: Direction) -> u64 {
        [&self.first, &self.second]
            .into_iter()
            .flatten()
            .find(|report| report.direction == direction)
            .map_or(0, |report| report.bytes)
    }

    pub fn error(&self) -> Option<&Termination> {
        [&self.first, &self.second]
            .into_iter()
            .flatten()
            .map(|report| &report.termination)
            .find(|termination| termination.is_error())
    }
}

/// A client connection and the upstream connection it is relayed to.
pub struct ConnectionPair {
    client: TcpStream,
    upstream: TcpStream,
}

impl ConnectionPair {
    pub fn new(client: TcpStream, upstream: TcpStream) -> Self {
        ConnectionPair { client, upstream }
    }

    /// Relay until either side stops, then close both sockets.
    ///
    /// `force` is only cancelled by the supervisor at shutdown.
    pub async fn run(self, force: CancellationToken) -> PairOutcome {
        let started = Instant::now();
        let stop = CancellationToken::new();

        let (client_read, client_write) = self.client.into_split();
        let (upstream_read, upstream_write) = self.upstream.into_split();

        let mut to_upstream: ForwarderTask = task::spawn(
            Forwarder::new(Direction::ClientToUpstream, client_read, upstream_write)
                .run(stop.clone())
                .in_current_span(),
        );
        let mut to_client: ForwarderTask = task::spawn(
            Forwarder::new(Direction::UpstreamToClient, upstream_read, client_write)
                .run(stop.clone())
                .in_current_span(),
        );

        let (first, second, forced) = tokio::select! {
            first = &mut to_upstream => (first, to_client, false),
            first = &mut to_client => (first, to_upstream, false),
            _ = force.cancelled() => {
                stop.cancel();
                let first = to_upstream.await;
                (first, to_client, true)
            }
        };

        // Whichever side finished first decides the close for both
        stop.cancel();
        let second = second.await;

        let mut halves = Halves::default();
        let first = halves.collect(first);
        let second = halves.collect(second);
        halves.close().await;

        let outcome = PairOutcome {
            first,
            second,
            forced,
            duration: started.elapsed(),
        };
        log_outcome(&outcome);

        outcome
    }
}

/// Socket halves handed back by the forwarders, reunited for closing.
#[derive(Default)]
struct Halves {
    client_read: Option<OwnedReadHalf>,
    client_write: Option<OwnedWriteHalf>,
    upstream_read: Option<OwnedReadHalf>,
    upstream_write: Option<OwnedWriteHalf>,
}

impl Halves {
    fn collect(
        &mut self,
        joined: Result<(ForwardReport, OwnedReadHalf, OwnedWriteHalf), task::JoinError>,
    ) -> Option<ForwardReport> {
        let (report, read, write) = match joined {
            Ok(joined) => joined,
            Err(error) => {
                // The halves were dropped with the task, which already closed them
                warn!(%error, "forwarder task failed");
                return None;
            }
        };

        match report.direction {
            Direction::ClientToUpstream => {
                self.client_read = Some(read);
                self.upstream_write = Some(write);
            }
            Direction::UpstreamToClient => {
                self.upstream_read = Some(read);
                self.client_write = Some(write);
            }
        }

        Some(report)
    }

    async fn close(self) {
        close_stream("client", self.client_read, self.client_write).await;
        close_stream("upstream", self.upstream_read, self.upstream_write).await;
    }
}

async fn close_stream(
    side: &'static str,
    read: Option<OwnedReadHalf>,
    write: Option<OwnedWriteHalf>,
) {
    let (Some(read), Some(write)) = (read, write) else {
        return;
    };

    match read.reunite(write) {
        Ok(mut stream) => {
            if let Err(error) = stream.shutdown().await {
                trace!(side, %error, "shutdown after close failed");
            }
        }
        Err(error) => warn!(side, %error, "socket halves did not match"),
    }
}

fn log_outcome(outcome: &PairOutcome) {
    let client_to_upstream = outcome.bytes(Direction::ClientToUpstream);
    let upstream_to_client = outcome.bytes(Direction::UpstreamToClient);
    let closed_by = outcome.first.as_ref().map(|report| report.direction);

    if outcome.forced {
        info!(
            client_to_upstream,
            upstream_to_client,
            duration = ?outcome.duration,
            "pair force closed"
        );
    } else if let Some(error) = outcome.error() {
        warn!(
            client_to_upstream,
            upstream_to_client,
            closed_by = ?closed_by,
            duration = ?outcome.duration,
            %error,
            "pair closed with error"
        );
    } else {
        debug!(
            client_to_upstream,
            upstream_to_client,
            closed_by = ?closed_by,
            duration = ?outcome.duration,
            "pair closed"
        );
    }
}
