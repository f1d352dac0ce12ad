//! Submission lifecycle tracking
//!
//! Records where each submission is in the protocol and how it settled.

use crate::identity::{system_time_ms, TransactionId};
use crate::orchestrator::TransactionOutcome;
use crate::{Error, Result};
use dashmap::DashMap;
use tracing::{debug, info, warn};

/// Protocol state of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmissionState {
    /// Proposal is being assembled
    Building,

    /// Waiting for every endorsing peer
    Endorsing,

    /// Endorsement policy is being evaluated
    PolicyCheck,

    /// Envelope is with the ordering service
    Ordering,

    /// Waiting for commit events
    Watching,

    /// Outcome decided
    Settled,
}

impl SubmissionState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionState::Settled)
    }

    /// Whether `next` may follow this state
    pub fn can_transition_to(&self, next: SubmissionState) -> bool {
        use SubmissionState::*;
        matches!(
            (self, next),
            (Building, Endorsing)
                | (Endorsing, PolicyCheck)
                | (PolicyCheck, Ordering)
                | (PolicyCheck, Settled)
                | (Ordering, Watching)
                | (Ordering, Settled)
                | (Watching, Settled)
        )
    }
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmissionState::Building => write!(f, "Building"),
            SubmissionState::Endorsing => write!(f, "Endorsing"),
            SubmissionState::PolicyCheck => write!(f, "PolicyCheck"),
            SubmissionState::Ordering => write!(f, "Ordering"),
            SubmissionState::Watching => write!(f, "Watching"),
            SubmissionState::Settled => write!(f, "Settled"),
        }
    }
}

/// Lifecycle information for one submission
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub tx_id: TransactionId,
    pub state: SubmissionState,

    /// Registration timestamp (Unix milliseconds)
    pub submitted_at: u64,

    /// Last state change (Unix milliseconds)
    pub updated_at: u64,

    /// Settlement timestamp (Unix milliseconds, if settled)
    pub settled_at: Option<u64>,

    /// Final outcome (if settled)
    pub outcome: Option<TransactionOutcome>,
}

impl SubmissionRecord {
    fn new(tx_id: TransactionId, timestamp: u64) -> Self {
        Self {
            tx_id,
            state: SubmissionState::Building,
            submitted_at: timestamp,
            updated_at: timestamp,
            settled_at: None,
            outcome: None,
        }
    }

    /// Time from registration to settlement (milliseconds)
    pub fn settle_time_ms(&self) -> Option<u64> {
        self.settled_at
            .map(|settled| settled.saturating_sub(self.submitted_at))
    }
}

/// Tracks every in-flight and recently settled submission
pub struct LifecycleTracker {
    records: DashMap<TransactionId, SubmissionRecord>,

    /// Maximum number of records to keep
    max_records: usize,

    /// Current time provider (for testing)
    current_time_fn: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl LifecycleTracker {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: DashMap::new(),
            max_records,
            current_time_fn: Box::new(system_time_ms),
        }
    }

    /// Set the current time function (for testing)
    pub fn with_time_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.current_time_fn = Box::new(f);
        self
    }

    /// Start tracking a submission in `Building`
    ///
    /// Returns the settled ids pruned to make room, if the tracker was full.
    pub fn register(&self, tx_id: &TransactionId) -> Result<Vec<TransactionId>> {
        if self.records.contains_key(tx_id) {
            return Err(Error::DuplicateSubmission(tx_id.to_string()));
        }

        let mut pruned = Vec::new();
        if self.records.len() >= self.max_records {
            // Make room by dropping settled records first
            pruned = self.prune_settled(0);

            if self.records.len() >= self.max_records {
                return Err(Error::CapacityExceeded(self.max_records));
            }
        }

        let timestamp = (self.current_time_fn)();
        self.records
            .insert(tx_id.clone(), SubmissionRecord::new(tx_id.clone(), timestamp));
        debug!("Tracking submission {}", tx_id);
        Ok(pruned)
    }

    /// Move a submission to `next`
    pub fn transition(&self, tx_id: &TransactionId, next: SubmissionState) -> Result<()> {
        let timestamp = (self.current_time_fn)();
        let mut record = self
            .records
            .get_mut(tx_id)
            .ok_or_else(|| Error::TransactionNotFound(tx_id.to_string()))?;

        if !record.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "illegal transition {} -> {} for {}",
                record.state, next, tx_id
            )));
        }

        debug!("Submission {}: {} -> {}", tx_id, record.state, next);
        record.state = next;
        record.updated_at = timestamp;
        Ok(())
    }

    /// Record the final outcome
    pub fn settle(&self, tx_id: &TransactionId, outcome: TransactionOutcome) -> Result<()> {
        self.transition(tx_id, SubmissionState::Settled)?;

        let timestamp = (self.current_time_fn)();
        let mut record = self
            .records
            .get_mut(tx_id)
            .ok_or_else(|| Error::TransactionNotFound(tx_id.to_string()))?;

        if outcome.is_committed() {
            info!("Submission {} settled: {}", tx_id, outcome);
        } else {
            warn!("Submission {} settled: {}", tx_id, outcome);
        }
        record.settled_at = Some(timestamp);
        record.outcome = Some(outcome);
        Ok(())
    }

    /// Stop tracking a submission that never reached the network
    pub fn discard(&self, tx_id: &TransactionId) -> bool {
        self.records.remove(tx_id).is_some()
    }

    pub fn state(&self, tx_id: &TransactionId) -> Option<SubmissionState> {
        self.records.get(tx_id).map(|record| record.state)
    }

    pub fn record(&self, tx_id: &TransactionId) -> Option<SubmissionRecord> {
        self.records.get(tx_id).map(|record| record.clone())
    }

    /// Transactions not yet settled
    pub fn in_flight(&self) -> Vec<TransactionId> {
        self.records
            .iter()
            .filter(|entry| !entry.value().state.is_terminal())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove settled records older than the given age (milliseconds)
    ///
    /// Returns the ids that were removed.
    pub fn prune_settled(&self, max_age_ms: u64) -> Vec<TransactionId> {
        let current_time = (self.current_time_fn)();
        let cutoff_time = current_time.saturating_sub(max_age_ms);

        let to_remove: Vec<TransactionId> = self
            .records
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .settled_at
                    .map(|t| t <= cutoff_time)
                    .unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for tx_id in &to_remove {
            self.records.remove(tx_id);
        }

        if !to_remove.is_empty() {
            debug!("Pruned {} settled submissions", to_remove.len());
        }

        to_remove
    }

    pub fn statistics(&self) -> LifecycleStatistics {
        let mut stats = LifecycleStatistics::default();

        for entry in self.records.iter() {
            let record = entry.value();

            match &record.outcome {
                None => stats.in_flight_count += 1,
                Some(TransactionOutcome::Committed) => stats.committed_count += 1,
                Some(TransactionOutcome::EndorsementRejected { .. }) => {
                    stats.endorsement_rejected_count += 1
                }
                Some(TransactionOutcome::OrderingFailed(_)) => stats.ordering_failed_count += 1,
                Some(TransactionOutcome::CommitTimeout(_)) => stats.commit_timeout_count += 1,
                Some(TransactionOutcome::CommitInvalid(..)) => stats.commit_invalid_count += 1,
            }

            if let Some(time) = record.settle_time_ms() {
                stats.total_latency_ms += time;
                stats.latency_sample_count += 1;
            }
        }

        stats.total_count = self.records.len();
        stats
    }
}

/// Lifecycle statistics
#[derive(Debug, Clone, Default)]
pub struct LifecycleStatistics {
    pub total_count: usize,
    pub in_flight_count: usize,
    pub committed_count: usize,
    pub endorsement_rejected_count: usize,
    pub ordering_failed_count: usize,
    pub commit_timeout_count: usize,
    pub commit_invalid_count: usize,

    /// Sum of settle latencies (milliseconds)
    pub total_latency_ms: u64,
    pub latency_sample_count: usize,
}

impl LifecycleStatistics {
    /// Get average settle latency (milliseconds)
    pub fn average_latency_ms(&self) -> Option<f64> {
        if self.latency_sample_count > 0 {
            Some(self.total_latency_ms as f64 / self.latency_sample_count as f64)
        } else {
            None
        }
    }

    /// Fraction of settled submissions that committed (0.0 to 1.0)
    pub fn commit_rate(&self) -> f64 {
        let settled = self.total_count - self.in_flight_count;
        if settled > 0 {
            self.committed_count as f64 / settled as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn tx_id(seed: u8) -> TransactionId {
        TransactionId::derive(&[seed; 24], b"Org2MSPcert")
    }

    #[test]
    fn test_full_path_to_committed() {
        let tracker = LifecycleTracker::new(100).with_time_fn(|| 1000);
        let tx = tx_id(1);

        tracker.register(&tx).unwrap();
        assert_eq!(tracker.state(&tx), Some(SubmissionState::Building));

        for next in [
            SubmissionState::Endorsing,
            SubmissionState::PolicyCheck,
            SubmissionState::Ordering,
            SubmissionState::Watching,
        ] {
            tracker.transition(&tx, next).unwrap();
            assert_eq!(tracker.state(&tx), Some(next));
        }

        tracker.settle(&tx, TransactionOutcome::Committed).unwrap();
        let record = tracker.record(&tx).unwrap();
        assert_eq!(record.state, SubmissionState::Settled);
        assert_eq!(record.outcome, Some(TransactionOutcome::Committed));
        assert_eq!(record.settle_time_ms(), Some(0));
    }

    #[test]
    fn test_rejection_settles_from_policy_check() {
        let tracker = LifecycleTracker::new(100);
        let tx = tx_id(2);

        tracker.register(&tx).unwrap();
        tracker.transition(&tx, SubmissionState::Endorsing).unwrap();
        tracker.transition(&tx, SubmissionState::PolicyCheck).unwrap();
        tracker
            .settle(
                &tx,
                TransactionOutcome::EndorsementRejected {
                    peer_id: Some(PeerId::new("peer1")),
                    reason: "status 500".to_string(),
                },
            )
            .unwrap();

        assert_eq!(tracker.state(&tx), Some(SubmissionState::Settled));
    }

    #[test]
    fn test_illegal_transitions_are_refused() {
        let tracker = LifecycleTracker::new(100);
        let tx = tx_id(3);
        tracker.register(&tx).unwrap();

        assert!(tracker.transition(&tx, SubmissionState::Ordering).is_err());
        assert!(tracker.settle(&tx, TransactionOutcome::Committed).is_err());
        assert!(matches!(
            tracker.transition(&tx_id(4), SubmissionState::Endorsing),
            Err(Error::TransactionNotFound(_))
        ));
    }

    #[test]
    fn test_statistics() {
        let tracker = LifecycleTracker::new(100).with_time_fn(|| 1000);

        for i in 0..5 {
            let tx = tx_id(i);
            tracker.register(&tx).unwrap();
            if i < 3 {
                tracker.transition(&tx, SubmissionState::Endorsing).unwrap();
                tracker.transition(&tx, SubmissionState::PolicyCheck).unwrap();
                tracker.transition(&tx, SubmissionState::Ordering).unwrap();
                tracker.transition(&tx, SubmissionState::Watching).unwrap();
                let outcome = if i == 0 {
                    TransactionOutcome::CommitTimeout(PeerId::new("peer1"))
                } else {
                    TransactionOutcome::Committed
                };
                tracker.settle(&tx, outcome).unwrap();
            }
        }

        let stats = tracker.statistics();
        assert_eq!(stats.total_count, 5);
        assert_eq!(stats.in_flight_count, 2);
        assert_eq!(stats.committed_count, 2);
        assert_eq!(stats.commit_timeout_count, 1);
        assert!((stats.commit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(tracker.in_flight().len(), 2);
    }

    #[test]
    fn test_prune_settled_and_capacity() {
        let clock = Arc::new(AtomicU64::new(1000));
        let time = clock.clone();
        let tracker =
            LifecycleTracker::new(2).with_time_fn(move || time.load(Ordering::SeqCst));

        let settled = tx_id(1);
        tracker.register(&settled).unwrap();
        tracker.transition(&settled, SubmissionState::Endorsing).unwrap();
        tracker.transition(&settled, SubmissionState::PolicyCheck).unwrap();
        tracker
            .settle(
                &settled,
                TransactionOutcome::EndorsementRejected {
                    peer_id: None,
                    reason: "no endorsements collected".to_string(),
                },
            )
            .unwrap();

        let pending = tx_id(2);
        tracker.register(&pending).unwrap();

        clock.store(5000, Ordering::SeqCst);
        assert!(tracker.prune_settled(10_000).is_empty());

        // Full: the settled record makes room, the in-flight one stays.
        let third = tx_id(3);
        assert_eq!(tracker.register(&third).unwrap(), vec![settled.clone()]);
        assert!(tracker.record(&settled).is_none());
        assert!(tracker.record(&pending).is_some());

        // Full of in-flight records: refuse.
        assert!(matches!(
            tracker.register(&tx_id(4)),
            Err(Error::CapacityExceeded(2))
        ));
    }

    #[test]
    fn test_discard() {
        let tracker = LifecycleTracker::new(10);
        let tx = tx_id(9);
        tracker.register(&tx).unwrap();
        assert!(tracker.discard(&tx));
        assert!(tracker.state(&tx).is_none());
    }
}
