//! In-memory collaborators for tests
//!
//! Scripted endorsing peers, ordering service, commit notifier and identity
//! provider. The ordering service can be wired to a notifier so that an
//! accepted envelope produces commit events the way a real network would.

use crate::commit::{
    CommitCallback, CommitEvent, CommitNotifier, SubscriptionHandle, ValidationCode,
};
use crate::endorsement::{EndorsingPeer, ProposalResponse, SUCCESS_STATUS};
use crate::identity::{Identity, IdentityContext, IdentityProvider, PeerId, TransactionId};
use crate::ordering::{Envelope, OrderingReceipt, OrderingService};
use crate::proposal::{ChaincodeRef, Proposal, ProposalBuilder};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Enrolled caller used across tests
pub fn test_identity() -> Identity {
    Identity::new("Org2MSP", b"-----BEGIN CERTIFICATE-----\nadmin@org2\n".to_vec())
}

/// Proposal with a fresh transaction id
pub fn test_proposal() -> Proposal {
    let tx = IdentityContext::new()
        .new_transaction_id(&test_identity())
        .expect("test identity is valid");
    ProposalBuilder::build(
        "mychannel",
        &ChaincodeRef::new("mars", "v0"),
        "purchase",
        vec![r#"{"PID":"p2017042501","UserID":"u001","FID":"20170401001"}"#],
        &tx,
    )
    .expect("test proposal is well formed")
}

/// Successful endorsement of `proposal` by `peer`
pub fn success_response(peer: &str, proposal: &Proposal) -> ProposalResponse {
    endorse(&PeerId::new(peer), proposal, SUCCESS_STATUS)
}

fn endorse(peer_id: &PeerId, proposal: &Proposal, status: i32) -> ProposalResponse {
    let mut hasher = Sha256::new();
    hasher.update(peer_id.as_str().as_bytes());
    hasher.update(proposal.tx_id().as_str().as_bytes());

    ProposalResponse {
        peer_id: peer_id.clone(),
        status,
        message: if status == SUCCESS_STATUS {
            "OK".to_string()
        } else {
            format!("chaincode {} failed", proposal.chaincode())
        },
        payload: format!("{}:{}", proposal.function(), proposal.args().len()).into_bytes(),
        endorsement_signature: hasher.finalize().to_vec(),
    }
}

/// Identity provider with a fixed caller
pub struct StaticIdentityProvider {
    identity: Option<Identity>,
}

impl StaticIdentityProvider {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
        }
    }

    /// Provider with nobody enrolled
    pub fn unenrolled() -> Self {
        Self { identity: None }
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn current_caller(&self) -> Result<Identity> {
        self.identity
            .clone()
            .ok_or_else(|| Error::Identity("no enrolled user".to_string()))
    }

    fn sign(&self, identity: &Identity, message: &[u8]) -> Result<Vec<u8>> {
        let mut hasher = Sha256::new();
        hasher.update(identity.serialize());
        hasher.update(message);
        Ok(hasher.finalize().to_vec())
    }
}

#[derive(Debug, Clone)]
enum EndorserBehavior {
    Respond(i32),
    Fail(String),
    Hang,
}

/// Scripted endorsing peer
pub struct MockEndorser {
    peer_id: PeerId,
    behavior: EndorserBehavior,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockEndorser {
    fn with_behavior(peer: &str, behavior: EndorserBehavior) -> Self {
        Self {
            peer_id: PeerId::new(peer),
            behavior,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Answers every proposal with `status`
    pub fn responding(peer: &str, status: i32) -> Self {
        Self::with_behavior(peer, EndorserBehavior::Respond(status))
    }

    /// Fails every proposal with a transport error
    pub fn failing(peer: &str, reason: &str) -> Self {
        Self::with_behavior(peer, EndorserBehavior::Fail(reason.to_string()))
    }

    /// Never answers
    pub fn hanging(peer: &str) -> Self {
        Self::with_behavior(peer, EndorserBehavior::Hang)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndorsingPeer for MockEndorser {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    async fn send_proposal(&self, proposal: &Proposal) -> Result<ProposalResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behavior {
            EndorserBehavior::Respond(status) => Ok(endorse(&self.peer_id, proposal, *status)),
            EndorserBehavior::Fail(reason) => Err(Error::Endorsement {
                peer: self.peer_id.to_string(),
                reason: reason.clone(),
            }),
            EndorserBehavior::Hang => std::future::pending().await,
        }
    }
}

#[derive(Debug, Clone)]
enum OrdererBehavior {
    Accept,
    Reject(String),
    Unreachable,
    Hang,
}

/// Scripted ordering service
pub struct MockOrderer {
    behavior: OrdererBehavior,
    notifier: Option<Arc<InMemoryNotifier>>,
    envelopes: Mutex<Vec<Envelope>>,
}

impl MockOrderer {
    fn with_behavior(behavior: OrdererBehavior) -> Self {
        Self {
            behavior,
            notifier: None,
            envelopes: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::with_behavior(OrdererBehavior::Accept)
    }

    pub fn rejecting(code: &str) -> Self {
        Self::with_behavior(OrdererBehavior::Reject(code.to_string()))
    }

    pub fn unreachable() -> Self {
        Self::with_behavior(OrdererBehavior::Unreachable)
    }

    pub fn hanging() -> Self {
        Self::with_behavior(OrdererBehavior::Hang)
    }

    /// Publish commit events to `notifier` for every accepted envelope
    pub fn publishing_to(mut self, notifier: Arc<InMemoryNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Envelopes received so far
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl OrderingService for MockOrderer {
    async fn submit(&self, envelope: Envelope) -> Result<OrderingReceipt> {
        let tx_id = envelope.tx_id.clone();
        self.envelopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(envelope);

        match &self.behavior {
            OrdererBehavior::Accept => {
                if let Some(notifier) = &self.notifier {
                    notifier.publish_commit(&tx_id);
                }
                Ok(OrderingReceipt::success())
            }
            OrdererBehavior::Reject(code) => Ok(OrderingReceipt::rejected(
                code.clone(),
                "rejected by orderer",
            )),
            OrdererBehavior::Unreachable => {
                Err(Error::Ordering("connection refused".to_string()))
            }
            OrdererBehavior::Hang => std::future::pending().await,
        }
    }
}

/// How a committing peer reacts once a transaction is ordered
#[derive(Debug, Clone)]
pub enum CommitScript {
    /// Emit the code right away
    Emit(ValidationCode),

    /// Emit the code after a delay
    EmitAfter(Duration, ValidationCode),

    /// Never emit
    Silent,

    /// Drop the callback without invoking it
    Drop,

    /// Emit the code right away, but for a different transaction id
    Misroute(ValidationCode),
}

struct Subscription {
    tx_id: TransactionId,
    peer_id: PeerId,
    callback: Option<CommitCallback>,
}

/// Commit notifier that keeps registrations in memory
///
/// Peers without a script emit `VALID`.
pub struct InMemoryNotifier {
    subscriptions: DashMap<SubscriptionHandle, Subscription>,
    scripts: DashMap<PeerId, CommitScript>,
    next_handle: AtomicU64,
    subscribe_count: AtomicUsize,
    unsubscribe_count: AtomicUsize,
    refuse: AtomicBool,
}

impl Default for InMemoryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            scripts: DashMap::new(),
            next_handle: AtomicU64::new(1),
            subscribe_count: AtomicUsize::new(0),
            unsubscribe_count: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        }
    }

    pub fn script(&self, peer: &str, script: CommitScript) {
        self.scripts.insert(PeerId::new(peer), script);
    }

    /// Make every later `subscribe` fail
    pub fn refuse_subscriptions(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Deliver commit events for `tx_id` according to each peer's script
    pub fn publish_commit(&self, tx_id: &TransactionId) {
        let mut deliveries = Vec::new();
        for mut entry in self.subscriptions.iter_mut() {
            let subscription = entry.value_mut();
            if &subscription.tx_id != tx_id {
                continue;
            }
            let script = self
                .scripts
                .get(&subscription.peer_id)
                .map(|s| s.value().clone())
                .unwrap_or(CommitScript::Emit(ValidationCode::Valid));
            if matches!(script, CommitScript::Silent) {
                continue;
            }
            if let Some(callback) = subscription.callback.take() {
                deliveries.push((subscription.peer_id.clone(), callback, script));
            }
        }

        for (peer_id, callback, script) in deliveries {
            let event = |validation_code| CommitEvent {
                peer_id: peer_id.clone(),
                tx_id: tx_id.clone(),
                validation_code,
            };
            match script {
                CommitScript::Emit(code) => callback(event(code)),
                CommitScript::EmitAfter(delay, code) => {
                    let event = event(code);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        callback(event);
                    });
                }
                CommitScript::Misroute(code) => callback(CommitEvent {
                    peer_id: peer_id.clone(),
                    tx_id: TransactionId::derive(b"misrouted", tx_id.as_str().as_bytes()),
                    validation_code: code,
                }),
                CommitScript::Drop => drop(callback),
                CommitScript::Silent => {}
            }
        }
    }

    /// Registrations not yet unsubscribed
    pub fn open_registrations(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribe_count.load(Ordering::SeqCst)
    }
}

impl CommitNotifier for InMemoryNotifier {
    fn subscribe(
        &self,
        tx_id: &TransactionId,
        peer_id: &PeerId,
        callback: CommitCallback,
    ) -> Result<SubscriptionHandle> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Subscription(format!(
                "event hub for {} is disconnected",
                peer_id
            )));
        }

        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.subscriptions.insert(
            handle,
            Subscription {
                tx_id: tx_id.clone(),
                peer_id: peer_id.clone(),
                callback: Some(callback),
            },
        );
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        if self.subscriptions.remove(&handle).is_some() {
            self.unsubscribe_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}
