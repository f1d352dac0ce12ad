//! Proposal construction
//!
//! Pure, network-free assembly of the request that endorsing peers execute.

use crate::identity::{TransactionId, TxContext};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Reference to the chaincode a proposal invokes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChaincodeRef {
    pub name: String,

    /// Empty means "whatever version is instantiated on the channel"
    pub version: String,
}

impl ChaincodeRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ChaincodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.version.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}", self.name, self.version)
        }
    }
}

/// Immutable transaction proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    channel_id: String,
    chaincode: ChaincodeRef,
    function: String,
    args: Vec<Vec<u8>>,
    tx_id: TransactionId,
    nonce: Vec<u8>,
    creator: Vec<u8>,
}

impl Proposal {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn chaincode(&self) -> &ChaincodeRef {
        &self.chaincode
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    pub fn tx_id(&self) -> &TransactionId {
        &self.tx_id
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    pub fn creator(&self) -> &[u8] {
        &self.creator
    }
}

/// Builds proposals from caller input
pub struct ProposalBuilder;

impl ProposalBuilder {
    /// Assemble a proposal
    ///
    /// Channel id, chaincode name and function must be non-empty and free of
    /// whitespace. Arguments are opaque byte payloads kept in order.
    pub fn build<A>(
        channel_id: &str,
        chaincode: &ChaincodeRef,
        function: &str,
        args: A,
        tx: &TxContext,
    ) -> Result<Proposal>
    where
        A: IntoIterator,
        A::Item: Into<Vec<u8>>,
    {
        require_token("channel id", channel_id)?;
        require_token("chaincode name", &chaincode.name)?;
        require_token("function", function)?;
        if chaincode.version.chars().any(char::is_whitespace) {
            return Err(Error::InvalidProposal(format!(
                "chaincode version {:?} contains whitespace",
                chaincode.version
            )));
        }
        if tx.nonce.is_empty() || tx.creator.is_empty() {
            return Err(Error::InvalidProposal(
                "transaction context is missing nonce or creator".to_string(),
            ));
        }

        Ok(Proposal {
            channel_id: channel_id.to_string(),
            chaincode: chaincode.clone(),
            function: function.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            tx_id: tx.tx_id.clone(),
            nonce: tx.nonce.clone(),
            creator: tx.creator.clone(),
        })
    }
}

fn require_token(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidProposal(format!("{} must not be empty", what)));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(Error::InvalidProposal(format!(
            "{} {:?} contains whitespace",
            what, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, IdentityContext};

    fn tx() -> TxContext {
        IdentityContext::new()
            .new_transaction_id(&Identity::new("Org2MSP", b"cert".to_vec()))
            .unwrap()
    }

    #[test]
    fn test_build_keeps_argument_order() {
        let tx = tx();
        let chaincode = ChaincodeRef::new("mars", "v0");
        let proposal = ProposalBuilder::build(
            "mychannel",
            &chaincode,
            "purchase",
            vec!["a", "b", "100"],
            &tx,
        )
        .unwrap();

        assert_eq!(proposal.channel_id(), "mychannel");
        assert_eq!(proposal.chaincode(), &chaincode);
        assert_eq!(proposal.function(), "purchase");
        assert_eq!(
            proposal.args(),
            &[b"a".to_vec(), b"b".to_vec(), b"100".to_vec()]
        );
        assert_eq!(proposal.tx_id(), &tx.tx_id);
        assert_eq!(proposal.nonce(), tx.nonce.as_slice());
    }

    #[test]
    fn test_empty_args_are_allowed() {
        let proposal = ProposalBuilder::build(
            "mychannel",
            &ChaincodeRef::new("mars", ""),
            "query",
            Vec::<Vec<u8>>::new(),
            &tx(),
        )
        .unwrap();
        assert!(proposal.args().is_empty());
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        let tx = tx();
        let chaincode = ChaincodeRef::new("mars", "v0");

        let cases = [
            ("", chaincode.clone(), "invoke"),
            ("mychannel", ChaincodeRef::new("", "v0"), "invoke"),
            ("mychannel", chaincode.clone(), ""),
            ("my channel", chaincode.clone(), "invoke"),
            ("mychannel", ChaincodeRef::new("mars", "v 0"), "invoke"),
        ];

        for (channel, chaincode, function) in cases {
            let result =
                ProposalBuilder::build(channel, &chaincode, function, vec!["x"], &tx);
            assert!(
                matches!(result, Err(Error::InvalidProposal(_))),
                "expected rejection for {:?}/{}/{:?}",
                channel,
                chaincode,
                function
            );
        }
    }
}
