use std::{
    error::Error,
    fmt::{self, Display},
    io,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use tcprelay_model::Endpoint;
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    time::{sleep, timeout},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, field, info, info_span, trace, warn, Instrument, Span};
use tracing_error::{InstrumentError, TracedError};

use crate::{config::RelayConfig, pair::ConnectionPair, relay_set::RelaySet};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum DialError {
    Timeout(Duration),
    Io(io::Error),
    Cancelled,
}

impl Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialError::Timeout(after) => write!(f, "connect timed out after {after:?}"),
            DialError::Io(error) => Display::fmt(error, f),
            DialError::Cancelled => write!(f, "connect abandoned for shutdown"),
        }
    }
}

impl Error for DialError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DialError::Io(error) => Some(error),
            _ => None,
        }
    }
}

/// Connect to `upstream`, giving up after `connect_timeout` or when `cancel` fires.
#[tracing::instrument(name = "connect_upstream", skip_all, fields(%upstream))]
pub async fn dial(
    upstream: &Endpoint,
    connect_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<TcpStream, DialError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DialError::Cancelled),
        connected = timeout(connect_timeout, TcpStream::connect(upstream.addr())) => match connected {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(error)) => Err(DialError::Io(error)),
            Err(_) => Err(DialError::Timeout(connect_timeout)),
        },
    }
}

/// Check if the error only concerns the connection being accepted, in which
/// case the listening socket is still healthy.
fn is_connection_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
    )
}

/// Bind `address` with `SO_REUSEADDR` and the given backlog.
pub fn bind(address: SocketAddr, backlog: u32) -> Result<TcpListener, TracedError<io::Error>> {
    let socket = match address {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(InstrumentError::in_current_span)?;

    socket
        .set_reuseaddr(true)
        .map_err(InstrumentError::in_current_span)?;
    socket
        .bind(address)
        .map_err(InstrumentError::in_current_span)?;

    socket.listen(backlog).map_err(InstrumentError::in_current_span)
}

/// Accepts clients and relays each one to the fixed upstream.
pub struct Listener {
    listener: TcpListener,
    upstream: Endpoint,
    connect_timeout: Duration,
    nodelay: bool,
    relays: Arc<RelaySet>,
    tracker: TaskTracker,
}

impl Listener {
    pub fn bind(
        config: &RelayConfig,
        relays: Arc<RelaySet>,
        tracker: TaskTracker,
    ) -> Result<Self, TracedError<io::Error>> {
        let listener = bind(config.listen_address, config.listen_backlog)?;

        Ok(Listener {
            listener,
            upstream: config.upstream.clone(),
            connect_timeout: config.connect_timeout(),
            nodelay: config.nodelay,
            relays,
            tracker,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `stop` is cancelled.
    ///
    /// Every connection is handled on its own task registered with the
    /// tracker, this loop never waits on one.
    pub async fn serve(self, stop: CancellationToken) {
        info!(
            listen_address = ?self.listener.local_addr().ok(),
            upstream = %self.upstream,
            "relay listening",
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((client, peer)) => self.spawn_connection(client, peer),
                Err(error) if is_connection_error(&error) => {
                    trace!(%error, "accept failed for a single connection");
                }
                Err(error) => {
                    error!(%error, "accept failed, backing off");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!("relay stopped accepting connections");
    }

    fn spawn_connection(&self, client: TcpStream, peer: SocketAddr) {
        info!(%peer, "connection accepted");

        let connection = handle_connection(
            client,
            peer,
            self.upstream.clone(),
            self.connect_timeout,
            self.nodelay,
            self.relays.clone(),
        )
        .instrument(info_span!(
            "connection",
            %peer,
            upstream = %self.upstream,
            id = field::Empty
        ));

        #[cfg(feature = "tokio-console")]
        if let Err(error) = tokio::task::Builder::new()
            .name(&peer.to_string())
            .spawn(self.tracker.track_future(connection))
        {
            error!(%error, "unable to spawn connection task");
        }

        #[cfg(not(feature = "tokio-console"))]
        self.tracker.spawn(connection);
    }
}

async fn handle_connection(
    client: TcpStream,
    peer: SocketAddr,
    upstream: Endpoint,
    connect_timeout: Duration,
    nodelay: bool,
    relays: Arc<RelaySet>,
) {
    trace!("new connection");

    if !relays.has_capacity() {
        warn!(live = relays.len(), "connection limit reached, dropping client");
        return;
    }

    let upstream_stream = match dial(&upstream, connect_timeout, &relays.shutdown_token()).await {
        Ok(stream) => stream,
        // Dropping the client closes it
        Err(DialError::Cancelled) => return,
        Err(error) => {
            warn!(%error, "could not connect to upstream");
            return;
        }
    };
    debug!("connected to upstream");

    if nodelay {
        for stream in [&client, &upstream_stream] {
            if let Err(error) = stream.set_nodelay(true) {
                debug!(%error, "unable to set TCP_NODELAY");
            }
        }
    }

    let registration = match relays.register(peer, upstream) {
        Ok(registration) => registration,
        Err(full) => {
            warn!(%full, "dropping client");
            return;
        }
    };
    Span::current().record("id", field::display(registration.id()));

    let outcome = ConnectionPair::new(client, upstream_stream)
        .run(registration.close_token().clone())
        .await;
    registration.finish(&outcome);
}
