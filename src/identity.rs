//! Caller identity and transaction id derivation
//!
//! Every submission attempt gets a fresh random nonce. The transaction id is
//! the SHA-256 digest of that nonce followed by the caller's serialized
//! identity, so it is bound to both the caller and the attempt.

use crate::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Nonce length in bytes
pub const NONCE_LENGTH: usize = 24;

/// Identifier of a network peer (endorsing or committing)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Transaction identifier, hex-encoded
///
/// Used as the correlation key between a submission and its commit events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Derive the id from a nonce and the caller's serialized identity
    pub fn derive(nonce: &[u8], creator: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(nonce);
        hasher.update(creator);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Membership service provider the caller belongs to
    pub msp_id: String,

    /// Enrollment certificate bytes
    pub certificate: Vec<u8>,

    /// Credential expiry (Unix milliseconds), `None` if it never expires
    pub expires_at_ms: Option<u64>,
}

impl Identity {
    pub fn new(msp_id: impl Into<String>, certificate: impl Into<Vec<u8>>) -> Self {
        Self {
            msp_id: msp_id.into(),
            certificate: certificate.into(),
            expires_at_ms: None,
        }
    }

    pub fn with_expiry(mut self, expires_at_ms: u64) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    /// Serialized creator bytes: MSP id followed by the certificate
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.msp_id.len() + self.certificate.len());
        bytes.extend_from_slice(self.msp_id.as_bytes());
        bytes.extend_from_slice(&self.certificate);
        bytes
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map(|exp| exp <= now_ms).unwrap_or(false)
    }
}

/// Source of the authenticated caller and holder of its key material
pub trait IdentityProvider: Send + Sync {
    /// Current caller, or `Error::Identity` if nobody is enrolled
    fn current_caller(&self) -> Result<Identity>;

    /// Sign `message` with the caller's private key
    fn sign(&self, identity: &Identity, message: &[u8]) -> Result<Vec<u8>>;
}

/// Transaction id plus the material it was derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxContext {
    pub tx_id: TransactionId,
    pub nonce: Vec<u8>,
    pub creator: Vec<u8>,
}

/// Derives a unique transaction id per submission attempt
pub struct IdentityContext {
    /// Current time provider (for testing)
    current_time_fn: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl Default for IdentityContext {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityContext {
    pub fn new() -> Self {
        Self {
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

    /// Create a fresh transaction id for `caller`
    ///
    /// Fails immediately with `Error::Identity` when the credential is absent
    /// or expired; it is never retried here.
    pub fn new_transaction_id(&self, caller: &Identity) -> Result<TxContext> {
        if caller.msp_id.is_empty() || caller.certificate.is_empty() {
            warn!("Refusing to derive transaction id: caller credential is absent");
            return Err(Error::Identity("caller credential is absent".to_string()));
        }

        let now = (self.current_time_fn)();
        if caller.is_expired(now) {
            warn!("Refusing to derive transaction id: credential for {} expired", caller.msp_id);
            return Err(Error::Identity(format!(
                "credential for {} expired at {}",
                caller.msp_id,
                caller.expires_at_ms.unwrap_or_default()
            )));
        }

        let mut nonce = vec![0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);

        let creator = caller.serialize();
        let tx_id = TransactionId::derive(&nonce, &creator);
        debug!("Derived transaction id {} for {}", tx_id, caller.msp_id);

        Ok(TxContext {
            tx_id,
            nonce,
            creator,
        })
    }
}

/// Wall clock in Unix milliseconds
pub(crate) fn system_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
