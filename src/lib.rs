//! # Ledger Transaction Coordinator
//!
//! Client-side coordinator that carries one transaction from proposal to
//! confirmed commit on a permissioned ledger network.
//!
//! This crate provides:
//! - Transaction id derivation bound to the caller's identity
//! - Proposal construction
//! - Parallel endorsement collection with per-peer timeouts
//! - Pluggable endorsement policies
//! - Single-shot ordering submission of a signed envelope
//! - Commit confirmation across independent peer event sources
//! - Lifecycle tracking of every submission

#![warn(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]
#![allow(missing_docs)] // Internal implementation details

mod error;
mod identity;
mod proposal;
mod endorsement;
mod policy;
mod ordering;
mod commit;
mod lifecycle;
mod orchestrator;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use error::{Error, Result};
pub use identity::{Identity, IdentityContext, IdentityProvider, PeerId, TransactionId, TxContext};
pub use proposal::{ChaincodeRef, Proposal, ProposalBuilder};
pub use endorsement::{
    EndorsementCollector, EndorsementResult, EndorsementSet, EndorsingPeer, PeerEndorsement,
    ProposalResponse, SUCCESS_STATUS,
};
pub use policy::{AllPeersSucceed, EndorsementPolicy, PolicyDecision, QuorumPolicy, Rejection};
pub use ordering::{
    ChannelHeader, Envelope, OrderingReceipt, OrderingService, OrderingStatus, OrderingSubmitter,
    TransactionPayload,
};
pub use commit::{
    ArmedWatch, CommitCallback, CommitEvent, CommitNotifier, CommitResult, CommitWatcher,
    CommittingPeer, PeerCommit, SubscriptionHandle, ValidationCode,
};
pub use lifecycle::{LifecycleStatistics, LifecycleTracker, SubmissionRecord, SubmissionState};
pub use orchestrator::{
    settle_commits, OrchestratorConfig, SubmissionOrchestrator, SubmissionReport,
    SubmissionRequest, TransactionOutcome,
};
