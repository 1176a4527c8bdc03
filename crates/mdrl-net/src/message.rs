//! Wire messages exchanged between nodes.
//!
//! Every message on a program topic is a [`TransportMessage`] encoded with
//! bincode, wrapped in a [`SignedMessage`] and then in a
//! [`MaybeEncrypted`] envelope that is sealed when the sender names
//! recipients.

use crate::error::{NetworkError, Result};
use mdrl_log::{Identity, Keystore, KeyId, MaybeEncrypted, PublicSignKey, SignatureWithKey};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// One head entry plus the ancestors the receiver most likely needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadWithRefs {
    /// Stored bytes of the head entry.
    pub entry: Vec<u8>,
    /// Stored bytes of referenced ancestors, newest first.
    pub references: Vec<Vec<u8>>,
}

/// Heads of one store of a program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeHeadsMessage {
    pub program_address: String,
    pub store_index: u32,
    pub heads: Vec<HeadWithRefs>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub addresses: Vec<String>,
}

/// Known peers, sent so the receiver can dial them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSwarmMessage {
    pub info: Vec<PeerInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMessage {
    ExchangeHeads(ExchangeHeadsMessage),
    ExchangeSwarm(ExchangeSwarmMessage),
}

/// Encoded message plus an optional signature over it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub data: Vec<u8>,
    pub signature: Option<SignatureWithKey>,
}

impl SignedMessage {
    pub fn new(data: Vec<u8>, identity: Option<&Identity>) -> Self {
        let signature = identity.map(|id| id.sign(&data));
        SignedMessage { data, signature }
    }

    /// Unsigned messages verify trivially.
    pub fn verify(&self) -> bool {
        self.signature.as_ref().map_or(true, |s| s.verify(&self.data))
    }

    pub fn signer(&self) -> Option<PublicSignKey> {
        self.signature.as_ref().map(|s| s.public_key)
    }
}

/// A message that passed decoding and signature checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message: TransportMessage,
    pub signer: Option<PublicSignKey>,
}

/// Encodes, signs and optionally seals a message.
pub async fn encode_message(
    message: &TransportMessage,
    identity: Option<&Identity>,
    seal: Option<(&[KeyId], &dyn Keystore)>,
) -> Result<Vec<u8>> {
    let data = bincode::serialize(message)?;
    let signed = SignedMessage::new(data, identity);
    let envelope = match seal {
        Some((recipients, keystore)) => MaybeEncrypted::sealed(signed, recipients, keystore).await?,
        None => MaybeEncrypted::plain(signed)?,
    };
    Ok(bincode::serialize(&envelope)?)
}

/// Opens, verifies and decodes a message received from the transport.
pub async fn decode_message(bytes: &[u8], keystore: Option<&dyn Keystore>) -> Result<ReceivedMessage> {
    let envelope: MaybeEncrypted<SignedMessage> = bincode::deserialize(bytes)?;
    let signed = match envelope.decrypt(keystore).await {
        Ok(signed) => signed,
        Err(err) => {
            let err = NetworkError::from(err);
            if err == NetworkError::AccessDenied {
                trace!("Dropping message sealed for other recipients");
            }
            return Err(err);
        }
    };
    if !signed.verify() {
        warn!(signer = ?signed.signer(), "Dropping message with invalid signature");
        return Err(NetworkError::InvalidSignature);
    }
    let message: TransportMessage = bincode::deserialize(&signed.data)?;
    Ok(ReceivedMessage {
        message,
        signer: signed.signer(),
    })
}

/// What a subscriber does on a program topic. Sent as subscription data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionRole {
    Replicator,
    Observer,
}

impl SubscriptionRole {
    const REPLICATOR: u8 = 0;
    const OBSERVER: u8 = 1;

    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            SubscriptionRole::Replicator => vec![Self::REPLICATOR],
            SubscriptionRole::Observer => vec![Self::OBSERVER],
        }
    }

    /// Reads the leading tag byte.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.first() {
            Some(&Self::REPLICATOR) => Ok(SubscriptionRole::Replicator),
            Some(&Self::OBSERVER) => Ok(SubscriptionRole::Observer),
            Some(tag) => Err(NetworkError::Malformed(format!("unknown subscription role tag {}", tag))),
            None => Err(NetworkError::Malformed("empty subscription data".into())),
        }
    }

    pub fn is_replicator(self) -> bool {
        self == SubscriptionRole::Replicator
    }
}
