//! Endorsement policies
//!
//! A policy only ever sees the complete endorsement set; it never talks to
//! peers. Deployments swap policies without touching collection.

use crate::endorsement::{EndorsementResult, EndorsementSet, PeerEndorsement, ProposalResponse};
use crate::identity::PeerId;
use tracing::{debug, warn};

/// Why a policy refused an endorsement set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// First offending peer, if a single peer can be blamed
    pub peer_id: Option<PeerId>,
    pub reason: String,
}

impl Rejection {
    pub fn for_peer(peer_id: PeerId, reason: impl Into<String>) -> Self {
        Self {
            peer_id: Some(peer_id),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.peer_id {
            Some(peer) => write!(f, "peer {}: {}", peer, self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

/// Result of evaluating a policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Responses that go into the envelope, in configured peer order
    Accept(Vec<ProposalResponse>),
    Reject(Rejection),
}

impl PolicyDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, PolicyDecision::Accept(_))
    }
}

/// Decides whether a complete endorsement set may be ordered
pub trait EndorsementPolicy: Send + Sync + std::fmt::Debug {
    fn evaluate(&self, endorsements: &EndorsementSet) -> PolicyDecision;
}

/// Describe why one entry does not count as a successful endorsement
fn failure_reason(entry: &PeerEndorsement) -> Option<String> {
    match &entry.result {
        EndorsementResult::Responded(response) if response.is_success() => None,
        EndorsementResult::Responded(response) => Some(format!(
            "status {} ({})",
            response.status, response.message
        )),
        EndorsementResult::Absent(err) => Some(format!("no response: {}", err)),
    }
}

fn successful_responses(endorsements: &EndorsementSet) -> Vec<ProposalResponse> {
    endorsements
        .entries()
        .iter()
        .filter_map(PeerEndorsement::response)
        .filter(|response| response.is_success())
        .cloned()
        .collect()
}

/// Every configured peer must answer with success status
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPeersSucceed;

impl EndorsementPolicy for AllPeersSucceed {
    fn evaluate(&self, endorsements: &EndorsementSet) -> PolicyDecision {
        if endorsements.is_empty() {
            return PolicyDecision::Reject(Rejection {
                peer_id: None,
                reason: "no endorsements collected".to_string(),
            });
        }

        // Each peer is judged on its own response.
        for entry in endorsements.entries() {
            if let Some(reason) = failure_reason(entry) {
                warn!("Endorsement policy rejected peer {}: {}", entry.peer_id, reason);
                return PolicyDecision::Reject(Rejection::for_peer(entry.peer_id.clone(), reason));
            }
        }

        debug!("All {} endorsements accepted", endorsements.len());
        PolicyDecision::Accept(successful_responses(endorsements))
    }
}

/// At least `required` peers must answer with success status
#[derive(Debug, Clone, Copy)]
pub struct QuorumPolicy {
    pub required: usize,
}

impl QuorumPolicy {
    pub fn new(required: usize) -> Self {
        Self { required }
    }
}

impl EndorsementPolicy for QuorumPolicy {
    fn evaluate(&self, endorsements: &EndorsementSet) -> PolicyDecision {
        let approved = successful_responses(endorsements);
        if self.required > 0 && approved.len() >= self.required {
            debug!(
                "Quorum reached: {}/{} endorsements (required {})",
                approved.len(),
                endorsements.len(),
                self.required
            );
            return PolicyDecision::Accept(approved);
        }

        let reason = format!(
            "quorum not reached: {}/{} successful, {} required",
            approved.len(),
            endorsements.len(),
            self.required
        );
        let rejection = match endorsements
            .entries()
            .iter()
            .find_map(|entry| failure_reason(entry).map(|why| (entry.peer_id.clone(), why)))
        {
            Some((peer_id, why)) => Rejection::for_peer(peer_id, format!("{}; {}", reason, why)),
            None => Rejection {
                peer_id: None,
                reason,
            },
        };
        warn!("Endorsement policy rejected: {}", rejection);
        PolicyDecision::Reject(rejection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn responded(peer: &str, status: i32) -> PeerEndorsement {
        PeerEndorsement {
            peer_id: PeerId::new(peer),
            result: EndorsementResult::Responded(ProposalResponse {
                peer_id: PeerId::new(peer),
                status,
                message: if status == 200 { "OK".into() } else { "chaincode error".into() },
                payload: b"result".to_vec(),
                endorsement_signature: vec![7u8; 16],
            }),
        }
    }

    fn absent(peer: &str) -> PeerEndorsement {
        PeerEndorsement {
            peer_id: PeerId::new(peer),
            result: EndorsementResult::Absent(Error::Endorsement {
                peer: peer.to_string(),
                reason: "unreachable".to_string(),
            }),
        }
    }

    #[test]
    fn test_all_success_accepts() {
        let set = EndorsementSet::new(vec![responded("peer0", 200), responded("peer1", 200)]);

        match AllPeersSucceed.evaluate(&set) {
            PolicyDecision::Accept(approved) => {
                assert_eq!(approved.len(), 2);
                assert_eq!(approved[0].peer_id, PeerId::new("peer0"));
                assert_eq!(approved[1].peer_id, PeerId::new("peer1"));
            }
            other => panic!("expected accept, got {:?}", other),
        }
    }

    #[test]
    fn test_absent_peer_rejects_naming_it() {
        let set = EndorsementSet::new(vec![responded("peer0", 200), absent("peer1")]);

        match AllPeersSucceed.evaluate(&set) {
            PolicyDecision::Reject(rejection) => {
                assert_eq!(rejection.peer_id, Some(PeerId::new("peer1")));
                assert!(rejection.reason.contains("no response"));
            }
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[test]
    fn test_non_success_status_rejects_naming_it() {
        let set = EndorsementSet::new(vec![responded("peer0", 200), responded("peer1", 500)]);

        match AllPeersSucceed.evaluate(&set) {
            PolicyDecision::Reject(rejection) => {
                assert_eq!(rejection.peer_id, Some(PeerId::new("peer1")));
                assert!(rejection.reason.contains("500"));
                assert!(rejection.to_string().starts_with("peer peer1"));
            }
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[test]
    fn test_each_peer_judged_on_its_own_status() {
        // A healthy first peer must not mask a failing later one.
        let set = EndorsementSet::new(vec![
            responded("peer0", 200),
            responded("peer1", 200),
            responded("peer2", 403),
        ]);

        let decision = AllPeersSucceed.evaluate(&set);
        assert_eq!(
            decision,
            PolicyDecision::Reject(Rejection::for_peer(
                PeerId::new("peer2"),
                "status 403 (chaincode error)"
            ))
        );
    }

    #[test]
    fn test_first_offending_peer_is_named() {
        let set = EndorsementSet::new(vec![absent("peer0"), responded("peer1", 500)]);

        match AllPeersSucceed.evaluate(&set) {
            PolicyDecision::Reject(rejection) => {
                assert_eq!(rejection.peer_id, Some(PeerId::new("peer0")))
            }
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_set_rejects() {
        let set = EndorsementSet::default();
        assert!(!AllPeersSucceed.evaluate(&set).is_accept());
        assert!(!QuorumPolicy::new(1).evaluate(&set).is_accept());
    }

    #[test]
    fn test_quorum_policy() {
        let set = EndorsementSet::new(vec![
            responded("peer0", 200),
            absent("peer1"),
            responded("peer2", 200),
        ]);

        match QuorumPolicy::new(2).evaluate(&set) {
            PolicyDecision::Accept(approved) => {
                let ids: Vec<&str> = approved.iter().map(|r| r.peer_id.as_str()).collect();
                assert_eq!(ids, vec!["peer0", "peer2"]);
            }
            other => panic!("expected accept, got {:?}", other),
        }

        match QuorumPolicy::new(3).evaluate(&set) {
            PolicyDecision::Reject(rejection) => {
                assert_eq!(rejection.peer_id, Some(PeerId::new("peer1")));
                assert!(rejection.reason.contains("2/3 successful"));
            }
            other => panic!("expected reject, got {:?}", other),
        }
    }
}
