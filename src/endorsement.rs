//! Endorsement collection
//!
//! Broadcasts a proposal to every configured endorsing peer at once and waits
//! for all of them to settle. A peer that errors or runs out of time
//! contributes an explicit `Absent` entry instead of aborting the collection.

use crate::identity::PeerId;
use crate::proposal::Proposal;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Status code an endorsing peer reports for a successful simulation
pub const SUCCESS_STATUS: i32 = 200;

/// A peer's signed answer to a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalResponse {
    pub peer_id: PeerId,
    pub status: i32,
    pub message: String,
    pub payload: Vec<u8>,
    pub endorsement_signature: Vec<u8>,
}

impl ProposalResponse {
    pub fn is_success(&self) -> bool {
        self.status == SUCCESS_STATUS
    }
}

/// Peer that simulates proposals and endorses the result
#[async_trait]
pub trait EndorsingPeer: Send + Sync {
    fn peer_id(&self) -> &PeerId;

    async fn send_proposal(&self, proposal: &Proposal) -> Result<ProposalResponse>;
}

impl std::fmt::Debug for dyn EndorsingPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EndorsingPeer({})", self.peer_id())
    }
}

/// Outcome of one peer's endorsement request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndorsementResult {
    Responded(ProposalResponse),

    /// Peer was unreachable, errored or timed out
    Absent(Error),
}

/// One configured peer and what it returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndorsement {
    pub peer_id: PeerId,
    pub result: EndorsementResult,
}

impl PeerEndorsement {
    pub fn response(&self) -> Option<&ProposalResponse> {
        match &self.result {
            EndorsementResult::Responded(response) => Some(response),
            EndorsementResult::Absent(_) => None,
        }
    }
}

/// Full endorsement picture, one entry per configured peer in configured order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndorsementSet {
    entries: Vec<PeerEndorsement>,
}

impl EndorsementSet {
    pub fn new(entries: Vec<PeerEndorsement>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[PeerEndorsement] {
        &self.entries
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerEndorsement> {
        self.entries.iter().find(|entry| &entry.peer_id == peer_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of peers that answered with success status
    pub fn success_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.response().map(|r| r.is_success()).unwrap_or(false))
            .count()
    }
}

/// Fans a proposal out to endorsing peers
#[derive(Debug, Clone)]
pub struct EndorsementCollector {
    /// Per-peer bound on a single endorsement request
    per_peer_timeout: Duration,
}

impl EndorsementCollector {
    pub fn new(per_peer_timeout: Duration) -> Self {
        Self { per_peer_timeout }
    }

    /// Send `proposal` to every peer and wait for all of them
    ///
    /// The returned set has exactly one entry per peer, in the order given.
    pub async fn broadcast(
        &self,
        proposal: &Proposal,
        peers: &[Arc<dyn EndorsingPeer>],
    ) -> Result<EndorsementSet> {
        if peers.is_empty() {
            return Err(Error::InvalidProposal(
                "no endorsing peers configured".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(peers.len());
        for peer in peers {
            if !seen.insert(peer.peer_id()) {
                return Err(Error::InvalidProposal(format!(
                    "endorsing peer {} configured more than once",
                    peer.peer_id()
                )));
            }
        }

        debug!(
            "Broadcasting proposal {} to {} endorsing peers",
            proposal.tx_id(),
            peers.len()
        );

        let requests = peers
            .iter()
            .map(|peer| self.request_endorsement(proposal, peer.as_ref()));
        let entries = join_all(requests).await;

        let set = EndorsementSet::new(entries);
        info!(
            "Collected endorsements for {}: {}/{} successful",
            proposal.tx_id(),
            set.success_count(),
            set.len()
        );
        Ok(set)
    }

    async fn request_endorsement(
        &self,
        proposal: &Proposal,
        peer: &dyn EndorsingPeer,
    ) -> PeerEndorsement {
        let peer_id = peer.peer_id().clone();

        let result =
            match tokio::time::timeout(self.per_peer_timeout, peer.send_proposal(proposal)).await {
                Ok(Ok(response)) => {
                    if response.is_success() {
                        info!(
                            "Proposal {} endorsed by {}: status {}, message {:?}, payload {} bytes, signature {} bytes",
                            proposal.tx_id(),
                            peer_id,
                            response.status,
                            response.message,
                            response.payload.len(),
                            response.endorsement_signature.len()
                        );
                    } else {
                        warn!(
                            "Proposal {} refused by {}: status {}, message {:?}",
                            proposal.tx_id(),
                            peer_id,
                            response.status,
                            response.message
                        );
                    }
                    EndorsementResult::Responded(response)
                }
                Ok(Err(e)) => {
                    warn!("Proposal {} failed on {}: {}", proposal.tx_id(), peer_id, e);
                    EndorsementResult::Absent(e)
                }
                Err(_) => {
                    let timeout_ms = self.per_peer_timeout.as_millis() as u64;
                    warn!(
                        "Proposal {} timed out on {} after {}ms",
                        proposal.tx_id(),
                        peer_id,
                        timeout_ms
                    );
                    EndorsementResult::Absent(Error::EndorsementTimeout {
                        peer: peer_id.to_string(),
                        timeout_ms,
                    })
                }
            };

        PeerEndorsement { peer_id, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MockEndorser};

    #[tokio::test(start_paused = true)]
    async fn test_one_entry_per_peer_despite_failures() {
        let proposal = mock::test_proposal();
        let peers: Vec<Arc<dyn EndorsingPeer>> = vec![
            Arc::new(MockEndorser::responding("peer0", 200)),
            Arc::new(MockEndorser::failing("peer1", "connection refused")),
            Arc::new(MockEndorser::hanging("peer2")),
            Arc::new(MockEndorser::responding("peer3", 500)),
        ];

        let collector = EndorsementCollector::new(Duration::from_secs(30));
        let set = collector.broadcast(&proposal, &peers).await.unwrap();

        assert_eq!(set.len(), 4);
        let ids: Vec<&str> = set.entries().iter().map(|e| e.peer_id.as_str()).collect();
        assert_eq!(ids, vec!["peer0", "peer1", "peer2", "peer3"]);

        assert!(set.entries()[0].response().unwrap().is_success());
        assert!(matches!(
            &set.entries()[1].result,
            EndorsementResult::Absent(Error::Endorsement { .. })
        ));
        assert!(matches!(
            &set.entries()[2].result,
            EndorsementResult::Absent(Error::EndorsementTimeout { timeout_ms: 30_000, .. })
        ));
        assert_eq!(set.entries()[3].response().unwrap().status, 500);
        assert_eq!(set.success_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_run_concurrently() {
        let proposal = mock::test_proposal();
        let peers: Vec<Arc<dyn EndorsingPeer>> = vec![
            Arc::new(MockEndorser::responding("peer0", 200).with_delay(Duration::from_secs(10))),
            Arc::new(MockEndorser::responding("peer1", 200).with_delay(Duration::from_secs(10))),
        ];

        let started = tokio::time::Instant::now();
        let collector = EndorsementCollector::new(Duration::from_secs(15));
        let set = collector.broadcast(&proposal, &peers).await.unwrap();

        assert_eq!(set.success_count(), 2);
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_every_peer_receives_the_proposal() {
        let proposal = mock::test_proposal();
        let first = Arc::new(MockEndorser::failing("peer0", "boom"));
        let second = Arc::new(MockEndorser::responding("peer1", 200));
        let peers: Vec<Arc<dyn EndorsingPeer>> = vec![first.clone(), second.clone()];

        EndorsementCollector::new(Duration::from_secs(1))
            .broadcast(&proposal, &peers)
            .await
            .unwrap();

        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_empty_peer_sets_are_rejected() {
        let proposal = mock::test_proposal();
        let collector = EndorsementCollector::new(Duration::from_secs(1));

        let result = collector.broadcast(&proposal, &[]).await;
        assert!(matches!(result, Err(Error::InvalidProposal(_))));

        let peers: Vec<Arc<dyn EndorsingPeer>> = vec![
            Arc::new(MockEndorser::responding("peer0", 200)),
            Arc::new(MockEndorser::responding("peer0", 200)),
        ];
        let result = collector.broadcast(&proposal, &peers).await;
        assert!(matches!(result, Err(Error::InvalidProposal(_))));
    }
}
