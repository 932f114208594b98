use std::fmt::{self, Display};

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

const BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => write!(f, "client->upstream"),
            Direction::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Why a [`Forwarder`] stopped copying.
#[derive(Debug)]
pub enum Termination {
    /// The source closed its write side.
    Eof,
    /// Reading from the source failed.
    Read(io::Error),
    /// Writing to the destination failed.
    Write(io::Error),
    /// The owning pair asked the forwarder to stop.
    Cancelled,
}

impl Termination {
    pub fn is_error(&self) -> bool {
        matches!(self, Termination::Read(_) | Termination::Write(_))
    }
}

impl Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Eof => write!(f, "end of stream"),
            Termination::Read(error) => write!(f, "read failed: {error}"),
            Termination::Write(error) => write!(f, "write failed: {error}"),
            Termination::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug)]
pub struct ForwardReport {
    pub direction: Direction,
    pub bytes: u64,
    pub termination: Termination,
}

/// Copies one direction of a connection pair.
///
/// The forwarder owns the read half of its source and the write half of its
/// destination for as long as it runs and hands both back when it stops. It
/// never shuts down the destination, that is left to the pair.
pub struct Forwarder<R, W> {
    direction: Direction,
    source: R,
    destination: W,
}

impl<R, W> Forwarder<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(direction: Direction, source: R, destination: W) -> Self {
        Forwarder {
            direction,
            source,
            destination,
        }
    }

    #[tracing::instrument(name = "forward", skip_all, fields(direction = %self.direction))]
    pub async fn run(mut self, cancel: CancellationToken) -> (ForwardReport, R, W) {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut bytes = 0u64;

        let termination = loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Termination::Cancelled,
                read = self.source.read(&mut buffer) => read,
            };

            let len = match read {
                Ok(0) => break Termination::Eof,
                Ok(len) => len,
                Err(error) => break Termination::Read(error),
            };

            let write = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Termination::Cancelled,
                write = write_chunk(&mut self.destination, &buffer[..len]) => write,
            };

            if let Err(error) = write {
                break Termination::Write(error);
            }

            bytes += len as u64;
        };

        trace!(bytes, %termination, "forwarder stopped");

        (
            ForwardReport {
                direction: self.direction,
                bytes,
                termination,
            },
            self.source,
            self.destination,
        )
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(destination: &mut W, chunk: &[u8]) -> io::Result<()> {
    destination.write_all(chunk).await?;
    destination.flush().await
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::{
        io::{duplex, AsyncReadExt, AsyncWriteExt},
        time::timeout,
    };
    use tokio_util::sync::CancellationToken;

    use super::{Direction, Forwarder, Termination};

    #[tokio::test]
    async fn copies_until_eof_in_order() {
        let (mut source_peer, source) = duplex(64);
        let (destination, mut destination_peer) = duplex(64);

        let forwarder = Forwarder::new(Direction::ClientToUpstream, source, destination);
        let task = tokio::spawn(forwarder.run(CancellationToken::new()));

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                source_peer.write_all(&payload).await.unwrap();
                source_peer.shutdown().await.unwrap();
                source_peer
            })
        };

        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        while received.len() < payload.len() {
            let len = destination_peer.read(&mut chunk).await.unwrap();
            assert_ne!(len, 0);
            received.extend_from_slice(&chunk[..len]);
        }
        assert_eq!(received, payload);

        let _source_peer = writer.await.unwrap();
        let (report, _, _) = timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.direction, Direction::ClientToUpstream);
        assert_eq!(report.bytes, payload.len() as u64);
        assert!(matches!(report.termination, Termination::Eof));
    }

    #[tokio::test]
    async fn empty_source_terminates_immediately() {
        let (source_peer, source) = duplex(64);
        let (destination, _destination_peer) = duplex(64);
        drop(source_peer);

        let (report, _, _) = timeout(
            Duration::from_secs(5),
            Forwarder::new(Direction::UpstreamToClient, source, destination)
                .run(CancellationToken::new()),
        )
        .await
        .unwrap();

        assert_eq!(report.bytes, 0);
        assert!(matches!(report.termination, Termination::Eof));
    }

    #[tokio::test]
    async fn cancellation_unblocks_pending_read() {
        let (_source_peer, source) = duplex(64);
        let (destination, _destination_peer) = duplex(64);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(
            Forwarder::new(Direction::ClientToUpstream, source, destination).run(cancel.clone()),
        );
        cancel.cancel();

        let (report, _, _) = timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report.termination, Termination::Cancelled));
        assert!(!report.termination.is_error());
    }

    #[tokio::test]
    async fn closed_destination_is_a_write_error() {
        let (mut source_peer, source) = duplex(64);
        let (destination, destination_peer) = duplex(64);
        drop(destination_peer);

        source_peer.write_all(b"doomed").await.unwrap();

        let (report, _, _) = timeout(
            Duration::from_secs(5),
            Forwarder::new(Direction::ClientToUpstream, source, destination)
                .run(CancellationToken::new()),
        )
        .await
        .unwrap();

        assert_eq!(report.bytes, 0);
        assert!(matches!(report.termination, Termination::Write(_)));
        assert!(report.termination.is_error());
    }
}
