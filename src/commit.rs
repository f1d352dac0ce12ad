//! Commit confirmation
//!
//! One subscription per committing peer, registered before the envelope goes
//! to ordering so an early commit event cannot be missed. Each peer's wait
//! races its own deadline; all waits are joined at a single barrier. Every
//! subscription is unregistered exactly once, by whichever of event, timeout
//! or drop ends it first.

use crate::identity::{PeerId, TransactionId};
use crate::{Error, Result};
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Validation code a committing peer reports for a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValidationCode {
    Valid,
    Invalid,
    Timeout,

    /// Any other code the peer reports, e.g. `MVCC_READ_CONFLICT`
    Other(String),
}

impl ValidationCode {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationCode::Valid)
    }
}

impl std::fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationCode::Valid => f.write_str("VALID"),
            ValidationCode::Invalid => f.write_str("INVALID"),
            ValidationCode::Timeout => f.write_str("TIMEOUT"),
            ValidationCode::Other(code) => f.write_str(code),
        }
    }
}

impl From<&str> for ValidationCode {
    fn from(code: &str) -> Self {
        match code {
            "VALID" => ValidationCode::Valid,
            "INVALID" => ValidationCode::Invalid,
            "TIMEOUT" => ValidationCode::Timeout,
            other => ValidationCode::Other(other.to_string()),
        }
    }
}

/// Notification that a peer committed (or refused) a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    pub peer_id: PeerId,
    pub tx_id: TransactionId,
    pub validation_code: ValidationCode,
}

/// Handle a notifier hands out for a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Invoked at most once with the peer's commit event
pub type CommitCallback = Box<dyn FnOnce(CommitEvent) + Send + Sync + 'static>;

/// Event source of committing peers
pub trait CommitNotifier: Send + Sync {
    fn subscribe(
        &self,
        tx_id: &TransactionId,
        peer_id: &PeerId,
        callback: CommitCallback,
    ) -> Result<SubscriptionHandle>;

    fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// A committing peer and the notifier that reports its commits
#[derive(Clone)]
pub struct CommittingPeer {
    pub peer_id: PeerId,
    pub notifier: Arc<dyn CommitNotifier>,
}

impl CommittingPeer {
    pub fn new(peer_id: impl Into<PeerId>, notifier: Arc<dyn CommitNotifier>) -> Self {
        Self {
            peer_id: peer_id.into(),
            notifier,
        }
    }
}

impl std::fmt::Debug for CommittingPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommittingPeer")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Terminal state of one peer's watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// An event arrived; the code may still be a failure
    Confirmed(ValidationCode),
    TimedOut,
}

impl CommitResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, CommitResult::Confirmed(code) if code.is_valid())
    }
}

/// One peer's resolved watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCommit {
    pub peer_id: PeerId,
    pub result: CommitResult,
}

struct Registration {
    tx_id: TransactionId,
    peer_id: PeerId,
    notifier: Arc<dyn CommitNotifier>,
    handle: SubscriptionHandle,
}

type Registry = Arc<DashMap<u64, Registration>>;

/// Unregisters its subscription when dropped
struct SubscriptionGuard {
    key: u64,
    registry: Registry,
}

impl SubscriptionGuard {
    fn release(&self) {
        if let Some((_, registration)) = self.registry.remove(&self.key) {
            registration.notifier.unsubscribe(registration.handle);
            debug!(
                "Unregistered commit listener for {} on {}",
                registration.tx_id, registration.peer_id
            );
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

struct PendingCommit {
    peer_id: PeerId,
    receiver: oneshot::Receiver<CommitEvent>,
    guard: SubscriptionGuard,
}

/// Watches committing peers for transaction commit events
///
/// Open subscriptions are owned by the watcher instance, never shared
/// process-wide.
pub struct CommitWatcher {
    registry: Registry,
    next_key: AtomicU64,
}

impl Default for CommitWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitWatcher {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(DashMap::new()),
            next_key: AtomicU64::new(0),
        }
    }

    /// Register a listener on every committing peer
    ///
    /// The per-peer deadlines start now. If any registration fails the ones
    /// already made are released before returning.
    pub fn arm(
        &self,
        tx_id: &TransactionId,
        peers: &[CommittingPeer],
        per_peer_timeout: Duration,
    ) -> Result<ArmedWatch> {
        let deadline = Instant::now() + per_peer_timeout;
        let mut pending = Vec::with_capacity(peers.len());

        for peer in peers {
            if pending
                .iter()
                .any(|p: &PendingCommit| p.peer_id == peer.peer_id)
            {
                return Err(Error::InvalidProposal(format!(
                    "committing peer {} configured more than once",
                    peer.peer_id
                )));
            }

            let (sender, receiver) = oneshot::channel();
            let callback: CommitCallback = Box::new(move |event| {
                // The receiver is gone once the watch settled; nothing to do.
                let _ = sender.send(event);
            });

            let handle = peer
                .notifier
                .subscribe(tx_id, &peer.peer_id, callback)
                .map_err(|e| {
                    error!(
                        "Failed to register commit listener for {} on {}: {}",
                        tx_id, peer.peer_id, e
                    );
                    match e {
                        Error::Subscription(_) => e,
                        other => Error::Subscription(other.to_string()),
                    }
                })?;

            let key = self.next_key.fetch_add(1, Ordering::Relaxed);
            self.registry.insert(
                key,
                Registration {
                    tx_id: tx_id.clone(),
                    peer_id: peer.peer_id.clone(),
                    notifier: peer.notifier.clone(),
                    handle,
                },
            );
            debug!("Registered commit listener for {} on {}", tx_id, peer.peer_id);

            pending.push(PendingCommit {
                peer_id: peer.peer_id.clone(),
                receiver,
                guard: SubscriptionGuard {
                    key,
                    registry: self.registry.clone(),
                },
            });
        }

        Ok(ArmedWatch {
            tx_id: tx_id.clone(),
            deadline,
            per_peer_timeout,
            pending,
        })
    }

    /// Arm and wait in one step
    pub async fn watch(
        &self,
        tx_id: &TransactionId,
        peers: &[CommittingPeer],
        per_peer_timeout: Duration,
    ) -> Result<Vec<PeerCommit>> {
        Ok(self.arm(tx_id, peers, per_peer_timeout)?.wait().await)
    }

    /// Number of subscriptions currently registered
    pub fn active_subscriptions(&self) -> usize {
        self.registry.len()
    }

    /// Unregister every subscription still open
    pub fn disconnect_all(&self) -> usize {
        let keys: Vec<u64> = self.registry.iter().map(|entry| *entry.key()).collect();
        let mut released = 0;
        for key in keys {
            if let Some((_, registration)) = self.registry.remove(&key) {
                registration.notifier.unsubscribe(registration.handle);
                released += 1;
            }
        }
        if released > 0 {
            info!("Disconnected {} commit listeners", released);
        }
        released
    }
}

/// Subscriptions registered for one transaction, not yet awaited
///
/// Dropping it without waiting releases every subscription.
pub struct ArmedWatch {
    tx_id: TransactionId,
    deadline: Instant,
    per_peer_timeout: Duration,
    pending: Vec<PendingCommit>,
}

impl ArmedWatch {
    pub fn tx_id(&self) -> &TransactionId {
        &self.tx_id
    }

    pub fn peer_count(&self) -> usize {
        self.pending.len()
    }

    /// Wait for every peer to resolve, in configured peer order
    ///
    /// A slow or silent peer only affects its own entry.
    pub async fn wait(self) -> Vec<PeerCommit> {
        let ArmedWatch {
            tx_id,
            deadline,
            per_peer_timeout,
            pending,
        } = self;

        let waits = pending
            .into_iter()
            .map(|commit| wait_for_peer(&tx_id, commit, deadline, per_peer_timeout));
        join_all(waits).await
    }
}

async fn wait_for_peer(
    tx_id: &TransactionId,
    commit: PendingCommit,
    deadline: Instant,
    per_peer_timeout: Duration,
) -> PeerCommit {
    let PendingCommit {
        peer_id,
        receiver,
        guard,
    } = commit;

    let result = match tokio::time::timeout_at(deadline, receiver).await {
        Ok(Ok(event)) if &event.tx_id != tx_id => {
            // The listener is spent, so this peer can no longer confirm.
            warn!(
                "Ignoring commit event from {} for {} while watching {}",
                peer_id, event.tx_id, tx_id
            );
            tokio::time::sleep_until(deadline).await;
            CommitResult::TimedOut
        }
        Ok(Ok(event)) => {
            if event.validation_code.is_valid() {
                info!("Transaction {} has been committed on peer {}", tx_id, peer_id);
            } else {
                error!(
                    "Transaction {} was invalid on peer {}, code = {}",
                    tx_id, peer_id, event.validation_code
                );
            }
            CommitResult::Confirmed(event.validation_code)
        }
        Ok(Err(_)) => {
            warn!(
                "Commit listener for {} on {} closed without an event",
                tx_id, peer_id
            );
            CommitResult::TimedOut
        }
        Err(_) => {
            warn!(
                "No commit event for {} from {} within {:?}",
                tx_id, peer_id, per_peer_timeout
            );
            CommitResult::TimedOut
        }
    };

    guard.release();
    PeerCommit { peer_id, result }
}
