//! Transaction submission orchestrator
//!
//! Drives one transaction through
//! `Building -> Endorsing -> PolicyCheck -> Ordering -> Watching -> Settled`
//! and reduces everything that happened into a single outcome.

use crate::commit::{CommitResult, CommitWatcher, CommittingPeer, PeerCommit, ValidationCode};
use crate::endorsement::{EndorsementCollector, EndorsementSet, EndorsingPeer};
use crate::identity::{IdentityContext, IdentityProvider, PeerId, TransactionId};
use crate::lifecycle::{LifecycleStatistics, LifecycleTracker, SubmissionRecord, SubmissionState};
use crate::ordering::{OrderingReceipt, OrderingService, OrderingSubmitter};
use crate::policy::{AllPeersSucceed, EndorsementPolicy, PolicyDecision};
use crate::proposal::{ChaincodeRef, ProposalBuilder};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Per-peer bound on an endorsement request (milliseconds)
    pub endorsement_timeout_ms: u64,

    /// Per-peer commit wait when the request does not set one (milliseconds)
    pub commit_timeout_ms: u64,

    /// Bound on the ordering call (milliseconds)
    pub ordering_timeout_ms: u64,

    /// Maximum number of submissions to track
    pub max_tracked_submissions: usize,

    /// Maximum age for settled submissions before pruning (milliseconds)
    pub max_finalized_age_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            endorsement_timeout_ms: 30_000,
            commit_timeout_ms: 30_000,
            ordering_timeout_ms: 30_000,
            max_tracked_submissions: 100_000,
            max_finalized_age_ms: 3_600_000, // 1 hour
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("endorsement_timeout_ms", self.endorsement_timeout_ms),
            ("commit_timeout_ms", self.commit_timeout_ms),
            ("ordering_timeout_ms", self.ordering_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.max_tracked_submissions == 0 {
            return Err(Error::Config(
                "max_tracked_submissions must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything one `submit_transaction` call needs
#[derive(Clone, Debug)]
pub struct SubmissionRequest {
    pub channel_id: String,
    pub chaincode: ChaincodeRef,
    pub function: String,
    pub args: Vec<Vec<u8>>,
    pub endorsing_peers: Vec<Arc<dyn EndorsingPeer>>,
    pub committing_peers: Vec<CommittingPeer>,

    /// Per-peer commit wait; falls back to the configured default
    pub per_peer_timeout: Option<Duration>,
}

impl SubmissionRequest {
    pub fn new(
        channel_id: impl Into<String>,
        chaincode: ChaincodeRef,
        function: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            chaincode,
            function: function.into(),
            args: Vec::new(),
            endorsing_peers: Vec::new(),
            committing_peers: Vec::new(),
            per_peer_timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<Vec<u8>>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn endorsing_peer(mut self, peer: Arc<dyn EndorsingPeer>) -> Self {
        self.endorsing_peers.push(peer);
        self
    }

    pub fn committing_peer(mut self, peer: CommittingPeer) -> Self {
        self.committing_peers.push(peer);
        self
    }

    pub fn per_peer_timeout(mut self, timeout: Duration) -> Self {
        self.per_peer_timeout = Some(timeout);
        self
    }
}

/// Final result of one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Ordered and confirmed VALID by every committing peer
    Committed,

    /// Endorsement policy refused; ordering never ran
    EndorsementRejected {
        peer_id: Option<PeerId>,
        reason: String,
    },

    /// Ordering service refused, failed or did not answer
    OrderingFailed(String),

    /// A committing peer sent no event in time
    CommitTimeout(PeerId),

    /// A committing peer reported a non-VALID code
    CommitInvalid(PeerId, ValidationCode),
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed)
    }
}

impl std::fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionOutcome::Committed => f.write_str("committed"),
            TransactionOutcome::EndorsementRejected {
                peer_id: Some(peer),
                reason,
            } => write!(f, "endorsement rejected by {}: {}", peer, reason),
            TransactionOutcome::EndorsementRejected {
                peer_id: None,
                reason,
            } => write!(f, "endorsement rejected: {}", reason),
            TransactionOutcome::OrderingFailed(reason) => {
                write!(f, "ordering failed: {}", reason)
            }
            TransactionOutcome::CommitTimeout(peer) => {
                write!(f, "no commit event from {} within the timeout", peer)
            }
            TransactionOutcome::CommitInvalid(peer, code) => {
                write!(f, "peer {} reported validation code {}", peer, code)
            }
        }
    }
}

/// Outcome of a submission together with the per-peer picture behind it
#[derive(Debug, Clone)]
pub struct SubmissionReport {
    pub tx_id: TransactionId,
    pub outcome: TransactionOutcome,
    pub endorsements: EndorsementSet,

    /// Present when the ordering service accepted the envelope
    pub receipt: Option<OrderingReceipt>,

    /// Per-peer commit results, in configured order; empty if watching never ran
    pub commits: Vec<PeerCommit>,
}

/// Reduce the joined commit results to an outcome
///
/// The first committing peer, in configured order, that did not confirm
/// VALID decides the failure.
pub fn settle_commits(commits: &[PeerCommit]) -> TransactionOutcome {
    for commit in commits {
        match &commit.result {
            CommitResult::Confirmed(code) if code.is_valid() => {}
            CommitResult::Confirmed(code) => {
                return TransactionOutcome::CommitInvalid(commit.peer_id.clone(), code.clone())
            }
            CommitResult::TimedOut => {
                return TransactionOutcome::CommitTimeout(commit.peer_id.clone())
            }
        }
    }
    TransactionOutcome::Committed
}

/// Top-level submission state machine
///
/// Each call to [`submit_transaction`](Self::submit_transaction) runs with its
/// own transaction id; calls share no in-flight state.
pub struct SubmissionOrchestrator {
    config: OrchestratorConfig,
    identity_provider: Arc<dyn IdentityProvider>,
    identity_context: IdentityContext,
    collector: EndorsementCollector,
    policy: Arc<dyn EndorsementPolicy>,
    submitter: OrderingSubmitter,
    watcher: CommitWatcher,
    lifecycle: LifecycleTracker,
}

impl SubmissionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        identity_provider: Arc<dyn IdentityProvider>,
        ordering_service: Arc<dyn OrderingService>,
    ) -> Result<Self> {
        config.validate()?;

        let collector =
            EndorsementCollector::new(Duration::from_millis(config.endorsement_timeout_ms));
        let submitter = OrderingSubmitter::new(
            ordering_service,
            identity_provider.clone(),
            Duration::from_millis(config.ordering_timeout_ms),
        );
        let lifecycle = LifecycleTracker::new(config.max_tracked_submissions);

        Ok(Self {
            config,
            identity_provider,
            identity_context: IdentityContext::new(),
            collector,
            policy: Arc::new(AllPeersSucceed),
            submitter,
            watcher: CommitWatcher::new(),
            lifecycle,
        })
    }

    /// Replace the default all-peers-succeed policy
    pub fn with_policy(mut self, policy: Arc<dyn EndorsementPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Set the current time function (for testing)
    pub fn with_time_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + Clone + 'static,
    {
        self.identity_context = self.identity_context.with_time_fn(f.clone());
        self.submitter = self.submitter.with_time_fn(f.clone());
        self.lifecycle = self.lifecycle.with_time_fn(f);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Submit a transaction and wait until its outcome is decided
    ///
    /// `Err` means the protocol never started (no valid caller, malformed
    /// proposal, commit listeners could not be registered). Everything that
    /// happens once the proposal is on the network is reported as a
    /// [`TransactionOutcome`] in the returned report. Nothing is retried.
    pub async fn submit_transaction(&self, request: SubmissionRequest) -> Result<SubmissionReport> {
        if request.committing_peers.is_empty() {
            return Err(Error::InvalidProposal(
                "no committing peers configured".to_string(),
            ));
        }
        for (i, peer) in request.committing_peers.iter().enumerate() {
            if request.committing_peers[..i]
                .iter()
                .any(|earlier| earlier.peer_id == peer.peer_id)
            {
                return Err(Error::InvalidProposal(format!(
                    "committing peer {} configured more than once",
                    peer.peer_id
                )));
            }
        }
        let per_peer_timeout = request
            .per_peer_timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.commit_timeout_ms));

        // Building
        let caller = self.identity_provider.current_caller()?;
        let tx = self.identity_context.new_transaction_id(&caller)?;
        let tx_id = tx.tx_id.clone();
        info!("Submitting transaction {}", tx_id);

        for pruned in self.lifecycle.register(&tx_id)? {
            self.submitter.forget(&pruned);
        }
        // Until settled, any early return or cancellation drops the record.
        let _pending = PendingSubmission {
            orchestrator: self,
            tx_id: &tx_id,
        };

        let proposal = ProposalBuilder::build(
            &request.channel_id,
            &request.chaincode,
            &request.function,
            request.args.iter().cloned(),
            &tx,
        )
        .map_err(|e| {
            warn!("Proposal for {} is malformed: {}", tx_id, e);
            e
        })?;

        // Endorsing
        self.lifecycle.transition(&tx_id, SubmissionState::Endorsing)?;
        let endorsements = self
            .collector
            .broadcast(&proposal, &request.endorsing_peers)
            .await?;

        // PolicyCheck
        self.lifecycle
            .transition(&tx_id, SubmissionState::PolicyCheck)?;
        let approved = match self.policy.evaluate(&endorsements) {
            PolicyDecision::Accept(approved) => approved,
            PolicyDecision::Reject(rejection) => {
                warn!(
                    "Failed to send proposal {} or receive valid response: {}",
                    tx_id, rejection
                );
                let outcome = TransactionOutcome::EndorsementRejected {
                    peer_id: rejection.peer_id,
                    reason: rejection.reason,
                };
                return self.finish(&tx_id, outcome, endorsements, None, Vec::new());
            }
        };

        // Ordering: listeners go up before the envelope leaves.
        self.lifecycle.transition(&tx_id, SubmissionState::Ordering)?;
        let watch = self
            .watcher
            .arm(&tx_id, &request.committing_peers, per_peer_timeout)?;
        debug!(
            "Armed {} commit listeners for {} ({:?} each)",
            watch.peer_count(),
            tx_id,
            per_peer_timeout
        );

        let receipt = match self.submitter.submit(&caller, &approved, &proposal).await {
            Ok(receipt) => receipt,
            Err(e) => {
                // Dropping the watch releases every listener.
                drop(watch);
                let outcome = TransactionOutcome::OrderingFailed(e.to_string());
                return self.finish(&tx_id, outcome, endorsements, None, Vec::new());
            }
        };

        // Watching
        self.lifecycle.transition(&tx_id, SubmissionState::Watching)?;
        let commits = watch.wait().await;
        let outcome = settle_commits(&commits);
        if !outcome.is_committed() {
            warn!(
                "Failed to get valid commit notifications for {}: {}",
                tx_id, outcome
            );
        }

        self.finish(&tx_id, outcome, endorsements, Some(receipt), commits)
    }

    /// Blocking variant for callers outside an async runtime
    ///
    /// Must not be called from within a tokio runtime.
    pub fn submit_transaction_blocking(&self, request: SubmissionRequest) -> Result<SubmissionReport> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Internal(format!("failed to start runtime: {}", e)))?;
        runtime.block_on(self.submit_transaction(request))
    }

    fn finish(
        &self,
        tx_id: &TransactionId,
        outcome: TransactionOutcome,
        endorsements: EndorsementSet,
        receipt: Option<OrderingReceipt>,
        commits: Vec<PeerCommit>,
    ) -> Result<SubmissionReport> {
        self.lifecycle.settle(tx_id, outcome.clone())?;
        Ok(SubmissionReport {
            tx_id: tx_id.clone(),
            outcome,
            endorsements,
            receipt,
            commits,
        })
    }

    pub fn submission_state(&self, tx_id: &TransactionId) -> Option<SubmissionState> {
        self.lifecycle.state(tx_id)
    }

    pub fn submission_record(&self, tx_id: &TransactionId) -> Option<SubmissionRecord> {
        self.lifecycle.record(tx_id)
    }

    pub fn statistics(&self) -> LifecycleStatistics {
        self.lifecycle.statistics()
    }

    /// Number of commit listeners currently registered
    pub fn active_subscriptions(&self) -> usize {
        self.watcher.active_subscriptions()
    }

    /// Prune settled submissions past the configured age
    pub fn run_cleanup(&self) -> usize {
        let pruned = self
            .lifecycle
            .prune_settled(self.config.max_finalized_age_ms);
        for tx_id in &pruned {
            self.submitter.forget(tx_id);
        }
        if !pruned.is_empty() {
            info!("Pruned {} settled submissions", pruned.len());
        }
        pruned.len()
    }

    /// Release every open commit listener
    pub fn shutdown(&self) {
        let released = self.watcher.disconnect_all();
        debug!("Orchestrator shut down, released {} listeners", released);
    }
}

/// Drops the lifecycle record of a submission that never settled
///
/// Covers early `Err` returns and a `submit_transaction` future dropped
/// mid-flight, so an abandoned record never holds a capacity slot.
struct PendingSubmission<'a> {
    orchestrator: &'a SubmissionOrchestrator,
    tx_id: &'a TransactionId,
}

impl Drop for PendingSubmission<'_> {
    fn drop(&mut self) {
        let lifecycle = &self.orchestrator.lifecycle;
        if lifecycle.state(self.tx_id).map_or(false, |s| !s.is_terminal()) {
            lifecycle.discard(self.tx_id);
            self.orchestrator.submitter.forget(self.tx_id);
            debug!("Dropped unsettled submission {}", self.tx_id);
        }
    }
}
