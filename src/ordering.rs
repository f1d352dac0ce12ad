//! Ordering submission
//!
//! Packages approved endorsements into a signed envelope and hands it to the
//! ordering service exactly once per transaction id. Failures are terminal;
//! retrying is left to the caller because a blind resubmission can commit
//! the same transaction twice.

use crate::endorsement::ProposalResponse;
use crate::identity::{system_time_ms, Identity, IdentityProvider, TransactionId};
use crate::proposal::{ChaincodeRef, Proposal};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Signed, submission-ready transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub tx_id: TransactionId,
    pub channel_id: String,

    /// Encoded [`ChannelHeader`]
    pub header: Vec<u8>,

    /// Encoded proposal plus approved responses
    pub payload: Vec<u8>,

    /// Creator's signature over `header || payload`
    pub signature: Vec<u8>,
}

impl Envelope {
    pub fn decode_header(&self) -> Result<ChannelHeader> {
        Ok(bincode::deserialize(&self.header)?)
    }

    pub fn decode_payload(&self) -> Result<TransactionPayload> {
        Ok(bincode::deserialize(&self.payload)?)
    }
}

/// Envelope header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHeader {
    pub channel_id: String,
    pub tx_id: TransactionId,
    pub chaincode: ChaincodeRef,
    pub timestamp_ms: u64,
}

/// Envelope payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub proposal: Proposal,
    pub endorsements: Vec<ProposalResponse>,
}

/// Status the ordering service reports for an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderingStatus {
    Success,

    /// Rejection code, e.g. `BAD_REQUEST` or `SERVICE_UNAVAILABLE`
    Rejected(String),
}

impl std::fmt::Display for OrderingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderingStatus::Success => f.write_str("SUCCESS"),
            OrderingStatus::Rejected(code) => f.write_str(code),
        }
    }
}

/// Ordering service answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingReceipt {
    pub status: OrderingStatus,
    pub info: String,
}

impl OrderingReceipt {
    pub fn success() -> Self {
        Self {
            status: OrderingStatus::Success,
            info: String::new(),
        }
    }

    pub fn rejected(code: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            status: OrderingStatus::Rejected(code.into()),
            info: info.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OrderingStatus::Success
    }
}

/// Service that sequences envelopes into blocks
#[async_trait]
pub trait OrderingService: Send + Sync {
    async fn submit(&self, envelope: Envelope) -> Result<OrderingReceipt>;
}

/// Builds envelopes and submits them once
pub struct OrderingSubmitter {
    service: Arc<dyn OrderingService>,
    identity_provider: Arc<dyn IdentityProvider>,

    /// Bound on the single ordering call
    timeout: Duration,

    /// Every transaction id handed to the ordering service
    submitted: DashSet<TransactionId>,

    /// Current time provider (for testing)
    current_time_fn: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl OrderingSubmitter {
    pub fn new(
        service: Arc<dyn OrderingService>,
        identity_provider: Arc<dyn IdentityProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            identity_provider,
            timeout,
            submitted: DashSet::new(),
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

    /// Build the signed envelope for `proposal` and its approved endorsements
    pub fn build_envelope(
        &self,
        caller: &Identity,
        approved: &[ProposalResponse],
        proposal: &Proposal,
    ) -> Result<Envelope> {
        if approved.is_empty() {
            return Err(Error::Ordering(
                "no approved endorsements to submit".to_string(),
            ));
        }

        let header = bincode::serialize(&ChannelHeader {
            channel_id: proposal.channel_id().to_string(),
            tx_id: proposal.tx_id().clone(),
            chaincode: proposal.chaincode().clone(),
            timestamp_ms: (self.current_time_fn)(),
        })?;
        let payload = bincode::serialize(&TransactionPayload {
            proposal: proposal.clone(),
            endorsements: approved.to_vec(),
        })?;

        let mut signed = Vec::with_capacity(header.len() + payload.len());
        signed.extend_from_slice(&header);
        signed.extend_from_slice(&payload);
        let signature = self.identity_provider.sign(caller, &signed)?;

        Ok(Envelope {
            tx_id: proposal.tx_id().clone(),
            channel_id: proposal.channel_id().to_string(),
            header,
            payload,
            signature,
        })
    }

    /// Submit the transaction for ordering
    ///
    /// Returns the receipt only when the service reports `SUCCESS`. Transport
    /// failures, timeouts and rejection codes become `Error::Ordering`.
    pub async fn submit(
        &self,
        caller: &Identity,
        approved: &[ProposalResponse],
        proposal: &Proposal,
    ) -> Result<OrderingReceipt> {
        let start = std::time::Instant::now();
        let tx_id = proposal.tx_id();

        let envelope = self.build_envelope(caller, approved, proposal)?;

        if !self.submitted.insert(tx_id.clone()) {
            warn!("Transaction {} was already submitted for ordering", tx_id);
            return Err(Error::DuplicateSubmission(tx_id.to_string()));
        }

        debug!(
            "Submitting envelope for {} ({} endorsements, {} bytes)",
            tx_id,
            approved.len(),
            envelope.header.len() + envelope.payload.len()
        );

        let receipt = match tokio::time::timeout(self.timeout, self.service.submit(envelope)).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                error!("Failed to send transaction {} to ordering: {}", tx_id, e);
                return Err(match e {
                    Error::Ordering(_) => e,
                    other => Error::Ordering(other.to_string()),
                });
            }
            Err(_) => {
                error!(
                    "Ordering service did not answer for {} within {:?}",
                    tx_id, self.timeout
                );
                return Err(Error::Ordering(format!(
                    "no answer within {}ms",
                    self.timeout.as_millis()
                )));
            }
        };

        if !receipt.is_success() {
            error!(
                "Failed to order transaction {}. Error code: {}",
                tx_id, receipt.status
            );
            return Err(Error::Ordering(format!(
                "status {}: {}",
                receipt.status, receipt.info
            )));
        }

        info!(
            "Transaction {} accepted by ordering in {:?}",
            tx_id,
            start.elapsed()
        );
        Ok(receipt)
    }

    pub fn was_submitted(&self, tx_id: &TransactionId) -> bool {
        self.submitted.contains(tx_id)
    }

    /// Stop remembering a settled transaction id
    pub fn forget(&self, tx_id: &TransactionId) -> bool {
        self.submitted.remove(tx_id).is_some()
    }

    /// Number of transaction ids remembered for deduplication
    pub fn submitted_count(&self) -> usize {
        self.submitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MockOrderer, StaticIdentityProvider};

    fn approved(proposal: &Proposal) -> Vec<ProposalResponse> {
        vec![mock::success_response("peer0", proposal)]
    }

    fn submitter(orderer: Arc<MockOrderer>) -> OrderingSubmitter {
        OrderingSubmitter::new(
            orderer,
            Arc::new(StaticIdentityProvider::new(mock::test_identity())),
            Duration::from_secs(30),
        )
        .with_time_fn(|| 1_700_000_000_000)
    }

    #[tokio::test]
    async fn test_envelope_carries_proposal_and_endorsements() {
        let orderer = Arc::new(MockOrderer::accepting());
        let submitter = submitter(orderer.clone());
        let proposal = mock::test_proposal();

        let receipt = submitter
            .submit(&mock::test_identity(), &approved(&proposal), &proposal)
            .await
            .unwrap();
        assert!(receipt.is_success());
        assert_eq!(receipt.status.to_string(), "SUCCESS");

        let envelopes = orderer.envelopes();
        assert_eq!(envelopes.len(), 1);
        let envelope = &envelopes[0];
        assert_eq!(&envelope.tx_id, proposal.tx_id());
        assert!(!envelope.signature.is_empty());

        let header = envelope.decode_header().unwrap();
        assert_eq!(header.channel_id, proposal.channel_id());
        assert_eq!(header.timestamp_ms, 1_700_000_000_000);

        let payload = envelope.decode_payload().unwrap();
        assert_eq!(payload.proposal, proposal);
        assert_eq!(payload.endorsements, approved(&proposal));
    }

    #[tokio::test]
    async fn test_submits_at_most_once_per_transaction() {
        let orderer = Arc::new(MockOrderer::accepting());
        let submitter = submitter(orderer.clone());
        let proposal = mock::test_proposal();
        let caller = mock::test_identity();

        submitter
            .submit(&caller, &approved(&proposal), &proposal)
            .await
            .unwrap();
        let second = submitter
            .submit(&caller, &approved(&proposal), &proposal)
            .await;

        assert!(matches!(second, Err(Error::DuplicateSubmission(_))));
        assert_eq!(orderer.envelopes().len(), 1);
        assert!(submitter.was_submitted(proposal.tx_id()));
    }

    #[tokio::test]
    async fn test_rejection_code_is_an_ordering_error() {
        let orderer = Arc::new(MockOrderer::rejecting("BAD_REQUEST"));
        let submitter = submitter(orderer.clone());
        let proposal = mock::test_proposal();

        let result = submitter
            .submit(&mock::test_identity(), &approved(&proposal), &proposal)
            .await;
        match result {
            Err(Error::Ordering(reason)) => assert!(reason.contains("BAD_REQUEST")),
            other => panic!("expected ordering error, got {:?}", other),
        }

        // A failed attempt still counts as the one submission.
        assert!(submitter.was_submitted(proposal.tx_id()));
    }

    #[tokio::test]
    async fn test_transport_failure_is_an_ordering_error() {
        let orderer = Arc::new(MockOrderer::unreachable());
        let submitter = submitter(orderer);
        let proposal = mock::test_proposal();

        let result = submitter
            .submit(&mock::test_identity(), &approved(&proposal), &proposal)
            .await;
        assert!(matches!(result, Err(Error::Ordering(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_orderer_times_out() {
        let orderer = Arc::new(MockOrderer::hanging());
        let submitter = submitter(orderer);
        let proposal = mock::test_proposal();

        let result = submitter
            .submit(&mock::test_identity(), &approved(&proposal), &proposal)
            .await;
        match result {
            Err(Error::Ordering(reason)) => assert!(reason.contains("30000ms")),
            other => panic!("expected ordering timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nothing_to_submit() {
        let orderer = Arc::new(MockOrderer::accepting());
        let submitter = submitter(orderer.clone());
        let proposal = mock::test_proposal();

        let result = submitter.submit(&mock::test_identity(), &[], &proposal).await;
        assert!(matches!(result, Err(Error::Ordering(_))));
        assert!(orderer.envelopes().is_empty());
        assert!(!submitter.was_submitted(proposal.tx_id()));
    }
}
