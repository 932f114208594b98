use std::{
    fmt::{self, Display},
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use dashmap::DashMap;
use tcprelay_model::Endpoint;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};
use uuid::Uuid;

use crate::pair::PairOutcome;

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct PairId(Uuid);

impl PairId {
    pub fn new() -> Self {
        PairId(Uuid::new_v4())
    }
}

impl Default for PairId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[derive(Debug)]
pub struct LivePair {
    pub peer: SocketAddr,
    pub upstream: Endpoint,
    pub started: Instant,
    close: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySetFull {
    pub limit: usize,
}

impl Display for RelaySetFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection limit of {} reached", self.limit)
    }
}

impl std::error::Error for RelaySetFull {}

/// The set of live connection pairs.
///
/// `live` is the admission counter; the map only holds details for
/// observability and forced closure.
#[derive(Debug)]
pub struct RelaySet {
    pairs: DashMap<PairId, LivePair>,
    live: watch::Sender<usize>,
    limit: Option<usize>,
    shutdown: CancellationToken,
    completed: AtomicUsize,
    errored: AtomicUsize,
}

impl RelaySet {
    pub fn new(limit: Option<usize>) -> Arc<Self> {
        Arc::new(RelaySet {
            pairs: DashMap::new(),
            live: watch::Sender::new(0),
            limit,
            shutdown: CancellationToken::new(),
            completed: AtomicUsize::new(0),
            errored: AtomicUsize::new(0),
        })
    }

    /// Whether a new pair would currently be admitted.
    pub fn has_capacity(&self) -> bool {
        self.limit.map_or(true, |limit| *self.live.borrow() < limit)
    }

    /// Add a pair, handing back the guard that removes it again.
    pub fn register(
        self: &Arc<Self>,
        peer: SocketAddr,
        upstream: Endpoint,
    ) -> Result<Registration, RelaySetFull> {
        let limit = self.limit;
        let admitted = self.live.send_if_modified(|live| match limit {
            Some(limit) if *live >= limit => false,
            _ => {
                *live += 1;
                true
            }
        });

        if !admitted {
            return Err(RelaySetFull {
                limit: limit.unwrap_or_default(),
            });
        }

        let id = PairId::new();
        let close = self.shutdown.child_token();
        self.pairs.insert(
            id,
            LivePair {
                peer,
                upstream,
                started: Instant::now(),
                close: close.clone(),
            },
        );
        trace!(%id, %peer, "pair registered");

        Ok(Registration {
            id,
            close,
            relays: Arc::clone(self),
        })
    }

    pub fn len(&self) -> usize {
        *self.live.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn ids(&self) -> Vec<PairId> {
        self.pairs.iter().map(|entry| *entry.key()).collect()
    }

    /// Pairs that have finished relaying since startup.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    /// Finished pairs whose relaying ended in an I/O failure.
    pub fn errored(&self) -> usize {
        self.errored.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.live.subscribe()
    }

    /// Token that is cancelled once every pair has been told to close.
    /// Work that has not registered a pair yet uses it to bail out.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait until no pair is live.
    #[cfg(test)]
    pub async fn drained(&self) {
        let mut live = self.live.subscribe();
        // The sender lives in `self`, so this can not fail while we borrow it
        let _ = live.wait_for(|live| *live == 0).await;
    }

    /// Force every live pair to close. Returns how many pairs were live.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for entry in self.pairs.iter() {
            let pair = entry.value();
            info!(
                id = %entry.key(),
                peer = %pair.peer,
                upstream = %pair.upstream,
                age = ?pair.started.elapsed(),
                "force closing pair"
            );
            pair.close.cancel();
            closed += 1;
        }
        self.shutdown.cancel();

        closed
    }

    fn remove(&self, id: PairId) {
        if self.pairs.remove(&id).is_some() {
            self.live.send_modify(|live| *live -= 1);
            trace!(%id, "pair removed");
        }
    }
}

/// Membership of one pair in the [`RelaySet`], removed on drop.
#[derive(Debug)]
pub struct Registration {
    id: PairId,
    close: CancellationToken,
    relays: Arc<RelaySet>,
}

impl Registration {
    pub fn id(&self) -> PairId {
        self.id
    }

    /// Cancelled when the supervisor force closes this pair.
    pub fn close_token(&self) -> &CancellationToken {
        &self.close
    }

    /// Report how the pair ended, consuming its membership.
    pub fn finish(self, outcome: &PairOutcome) {
        self.relays.completed.fetch_add(1, Ordering::Relaxed);
        if outcome.error().is_some() {
            self.relays.errored.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.relays.remove(self.id);
    }
}

#[cfg(test)]
mod test {
    use std::{io, net::SocketAddr, time::Duration};

    use tcprelay_model::Endpoint;
    use tokio::time::timeout;

    use super::RelaySet;
    use crate::{
        forwarder::{Direction, ForwardReport, Termination},
        pair::PairOutcome,
    };

    fn outcome(termination: Termination) -> PairOutcome {
        PairOutcome {
            first: Some(ForwardReport {
                direction: Direction::UpstreamToClient,
                bytes: 0,
                termination,
            }),
            second: None,
            forced: false,
            duration: Duration::ZERO,
        }
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn upstream() -> Endpoint {
        Endpoint::new("127.0.0.1", 9)
    }

    #[test]
    fn registration_is_removed_on_drop() {
        let relays = RelaySet::new(None);

        let first = relays.register(peer(1), upstream()).unwrap();
        let second = relays.register(peer(2), upstream()).unwrap();
        assert_eq!(relays.len(), 2);
        assert_ne!(first.id(), second.id());

        drop(first);
        assert_eq!(relays.len(), 1);
        assert_eq!(relays.ids(), vec![second.id()]);

        drop(second);
        assert!(relays.is_empty());
    }

    #[test]
    fn limit_rejects_until_a_slot_frees() {
        let relays = RelaySet::new(Some(1));

        let held = relays.register(peer(1), upstream()).unwrap();
        assert!(!relays.has_capacity());
        let rejected = relays.register(peer(2), upstream()).unwrap_err();
        assert_eq!(rejected.limit, 1);
        assert_eq!(relays.len(), 1);

        drop(held);
        assert!(relays.has_capacity());
        assert!(relays.register(peer(3), upstream()).is_ok());
    }

    #[test]
    fn close_all_cancels_every_pair() {
        let relays = RelaySet::new(None);
        let a = relays.register(peer(1), upstream()).unwrap();
        let b = relays.register(peer(2), upstream()).unwrap();

        assert_eq!(relays.close_all(), 2);
        assert!(a.close_token().is_cancelled());
        assert!(b.close_token().is_cancelled());
        assert!(relays.shutdown_token().is_cancelled());

        // Closing does not remove membership, the pairs do that as they finish
        assert_eq!(relays.len(), 2);
    }

    #[test]
    fn finished_pairs_are_counted() {
        let relays = RelaySet::new(None);

        let clean = relays.register(peer(1), upstream()).unwrap();
        clean.finish(&outcome(Termination::Eof));
        let failed = relays.register(peer(2), upstream()).unwrap();
        failed.finish(&outcome(Termination::Read(io::ErrorKind::ConnectionReset.into())));

        assert!(relays.is_empty());
        assert_eq!(relays.completed(), 2);
        assert_eq!(relays.errored(), 1);
    }

    #[tokio::test]
    async fn drained_resolves_when_last_pair_leaves() {
        let relays = RelaySet::new(None);
        let registration = relays.register(peer(1), upstream()).unwrap();

        let waiter = tokio::spawn({
            let relays = relays.clone();
            async move { relays.drained().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(registration);
        timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
